use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use parley_gateway::auth::{AuthError, TokenVerifier, VerifiedUser};

use crate::AppState;
use crate::error::ApiError;

/// Claims minted by the (external) authentication collaborator. Account
/// status travels in the token so the delivery system never touches the
/// account store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub active: bool,
    pub verified: bool,
    pub exp: usize,
}

/// Extract and validate the bearer token, rejecting callers whose account is
/// suspended or unverified. The verified claims land in request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized)?;

    let claims = token_data.claims;
    if !claims.active || !claims.verified {
        return Err(ApiError::Forbidden);
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// The gateway-facing half of token verification: the same decode, shaped as
/// the authentication collaborator the connection lifecycle expects.
pub struct JwtVerifier {
    secret: String,
}

impl JwtVerifier {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<VerifiedUser, AuthError> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AuthError::InvalidToken)?;

        Ok(VerifiedUser {
            user_id: token_data.claims.sub,
            active: token_data.claims.active,
            verified: token_data.claims.verified,
        })
    }
}

/// Mint a token the way the external issuer would. Used by tests and local
/// tooling only; production tokens come from the account service.
pub fn issue_token(secret: &str, user_id: i64) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        active: true,
        verified: true,
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_verify_round_trip() {
        let token = issue_token("test-secret", 42).unwrap();
        let verifier = JwtVerifier::new("test-secret".to_string());
        let user = verifier.verify(&token).unwrap();
        assert_eq!(user.user_id, 42);
        assert!(user.active);
        assert!(user.verified);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_token("test-secret", 42).unwrap();
        let verifier = JwtVerifier::new("other-secret".to_string());
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let verifier = JwtVerifier::new("test-secret".to_string());
        assert!(verifier.verify("not-a-jwt").is_err());
    }
}
