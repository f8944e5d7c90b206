use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use busline_core::CoreError;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    AuthorizationError(String),
    ValidationError(String),
    NotFoundError(String),
    ConflictError(String),
    UnprocessableError(String),
    UpstreamError(String),
    ServiceUnavailable(String),
    InternalServerError(String),
    Anyhow(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::UnprocessableError(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::UpstreamError(msg) => {
                tracing::warn!("Upstream failure: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::ServiceUnavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Service busy, retry with the same order_ref".to_string())
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let message = err.to_string();
        match err {
            CoreError::ValidationError(_) => AppError::ValidationError(message),
            CoreError::NotFound(_) => AppError::NotFoundError(message),
            CoreError::Conflict(_)
            | CoreError::DuplicateOrderRef(_)
            | CoreError::SeatUnavailable { .. } => AppError::ConflictError(message),
            CoreError::ChangeWindowClosed { .. } => AppError::UnprocessableError(message),
            CoreError::Transient(_) => AppError::ServiceUnavailable(message),
            CoreError::ExternalService(_) => AppError::UpstreamError(message),
            CoreError::InternalError(_) => AppError::InternalServerError(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Anyhow(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn status_of(err: CoreError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_core_error_status_mapping() {
        assert_eq!(status_of(CoreError::ValidationError("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(CoreError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(CoreError::DuplicateOrderRef("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(CoreError::SeatUnavailable { trip_id: Uuid::nil(), seats: vec!["1A".into()] }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(CoreError::ChangeWindowClosed { hours_left: 3, min_hours: 24 }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_of(CoreError::Transient("x".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_of(CoreError::ExternalService("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status_of(CoreError::InternalError("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
