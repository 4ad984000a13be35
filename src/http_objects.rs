use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use state_store::StoreError;
use tracing::error;

#[derive(Debug, Serialize, Deserialize)]
pub struct BlobdAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl BlobdAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error_str(e: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: &str) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for BlobdAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<StoreError> for BlobdAPIError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => Self::not_found(&e.to_string()),
            StoreError::Conflict(_) => Self::conflict(&e.to_string()),
            _ => Self::internal_error_str(&e.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthzResponse {
    pub status: String,
    pub live_blobs: usize,
    pub version: String,
}
