use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use parley_store::StoreError;
use parley_types::api::ErrorBody;

/// API-level error taxonomy. Authentication failures close the door entirely;
/// authorization failures reject the one request; anchor misses surface as
/// 404 so clients can distinguish "empty" from "nothing to anchor on".
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,
    #[error("you are not a subscriber of this channel")]
    Forbidden,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NoAnchor(_) => Self::NotFound("no messages found in the channel".into()),
            StoreError::ChannelNotFound(id) => Self::NotFound(format!("channel {id} not found")),
            StoreError::AlreadySubscribed { .. } | StoreError::NotSubscribed { .. } => {
                Self::BadRequest(err.to_string())
            }
            StoreError::LockPoisoned | StoreError::Db(_) => Self::Internal(err.into()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(e) => {
                error!("internal error: {:?}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_the_right_status() {
        let err: ApiError = StoreError::NoAnchor(7).into();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err: ApiError = StoreError::ChannelNotFound(7).into();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err: ApiError = StoreError::AlreadySubscribed {
            user_id: 1,
            channel_id: 7,
        }
        .into();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err: ApiError = StoreError::LockPoisoned.into();
        assert!(matches!(err, ApiError::Internal(_)));
    }
}
