/// Outcome of verifying a connection credential with the authentication
/// collaborator. The gateway never issues tokens; it only consumes this.
#[derive(Debug, Clone, Copy)]
pub struct VerifiedUser {
    pub user_id: i64,
    pub active: bool,
    pub verified: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential")]
    InvalidToken,
    #[error("account is inactive")]
    InactiveAccount,
    #[error("account is not verified")]
    UnverifiedAccount,
}

/// Resolves a raw token into a user id plus account-status flags.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<VerifiedUser, AuthError>;
}
