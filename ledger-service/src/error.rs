use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ledger_client::StoreError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Overloaded: {0}")]
    Overloaded(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ServiceError::Store(ref e) => {
                tracing::error!("Store error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Store error")
            }
            ServiceError::NotFound(ref msg) => (StatusCode::NOT_FOUND, msg.as_str()),
            ServiceError::InvalidInput(ref msg) => (StatusCode::BAD_REQUEST, msg.as_str()),
            ServiceError::Overloaded(ref msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.as_str()),
            ServiceError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
