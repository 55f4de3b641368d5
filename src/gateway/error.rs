//! HTTP mapping of [`DispatchError`].

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::DispatchError;

/// Error half of the response envelope.
#[derive(Debug)]
pub struct ApiError(pub DispatchError);

#[derive(Debug, Serialize)]
struct ErrorPayload {
    success: bool,
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::Unauthorized => StatusCode::UNAUTHORIZED,
            DispatchError::Forbidden => StatusCode::FORBIDDEN,
            DispatchError::InvalidState(_) | DispatchError::Conflict(_) => StatusCode::CONFLICT,
            DispatchError::Expired | DispatchError::Exhausted => StatusCode::GONE,
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::Database(_) | DispatchError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(DispatchError::Validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(DispatchError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Storage details stay in the log.
            tracing::error!("Request failed: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        let payload = ErrorPayload {
            success: false,
            error: self.0.kind(),
            message,
        };
        (status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (DispatchError::NotFound("Agent 1".into()), StatusCode::NOT_FOUND),
            (DispatchError::Unauthorized, StatusCode::UNAUTHORIZED),
            (DispatchError::Forbidden, StatusCode::FORBIDDEN),
            (DispatchError::InvalidState("x".into()), StatusCode::CONFLICT),
            (DispatchError::Conflict("x".into()), StatusCode::CONFLICT),
            (DispatchError::Expired, StatusCode::GONE),
            (DispatchError::Exhausted, StatusCode::GONE),
            (DispatchError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                DispatchError::Database(DatabaseError::Pool("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
