// HTTP error mapping: every failure leaves the API as {detail, error_code}
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::model_runtime::Capability;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Rejected before any model is invoked.
    #[error("{detail}")]
    InvalidInput {
        detail: String,
        code: &'static str,
    },

    #[error("Uploaded file exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    #[error("Error processing {}: {message}", .capability.display_name())]
    Inference {
        capability: Capability,
        message: String,
    },
}

impl ApiError {
    pub fn invalid_file_type() -> Self {
        Self::InvalidInput {
            detail: "Invalid file type. Please upload an image file.".to_string(),
            code: "invalid_file_type",
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::InvalidInput {
            detail: format!("Missing required field: {}", field),
            code: "missing_field",
        }
    }

    pub fn bad_multipart(err: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            detail: format!("Malformed multipart body: {}", err),
            code: "invalid_multipart",
        }
    }

    /// Multipart read failure; body-limit overruns keep their 413.
    pub fn multipart(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge {
                limit: crate::server::MAX_UPLOAD_BYTES,
            }
        } else {
            Self::bad_multipart(err)
        }
    }

    pub fn inference(capability: Capability, err: &anyhow::Error) -> Self {
        Self::Inference {
            capability,
            message: format!("{:#}", err),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Inference { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidInput { code, .. } => code,
            ApiError::PayloadTooLarge { .. } => "payload_too_large",
            ApiError::Inference { .. } => "inference_failed",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({
                "detail": self.to_string(),
                "error_code": self.code(),
            })),
        )
            .into_response()
    }
}
