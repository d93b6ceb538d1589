use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use parley_types::error::ChatError;

/// HTTP projection of the domain taxonomy. Forbidden and not-found share a
/// body on purpose — callers cannot probe for conversation existence.
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::FollowRequired | ChatError::Forbidden => StatusCode::FORBIDDEN,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Decryption => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::Storage(e) => {
                error!("storage error: {}", e);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal server error" })),
                )
                    .into_response();
            }
        };

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
