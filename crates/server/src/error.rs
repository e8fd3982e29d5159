use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use murmur_core::CoreError;
use murmur_llm::ProviderError;
use murmur_protocol::{ErrorBody, ErrorCategory};
use murmur_storage::StorageError;
use snafu::Snafu;

pub type ServerResult<T> = Result<T, ServerError>;

/// Startup and serving failures of the `murmur` binary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ServerError {
    #[snafu(display("failed to load configuration on `{stage}`: {source}"))]
    ConfigExtract {
        stage: &'static str,
        source: Box<figment::Error>,
    },
    #[snafu(display("failed to open conversation store on `{stage}`, {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to create model provider on `{stage}`, {source}"))]
    CreateProvider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to bind {address} on `{stage}`: {source}"))]
    Bind {
        stage: &'static str,
        address: String,
        source: std::io::Error,
    },
    #[snafu(display("http server failed on `{stage}`: {source}"))]
    Serve {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Request failures, rendered as a status code and an [`ErrorBody`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("chat '{id}' was not found"))]
    ChatNotFound { stage: &'static str, id: String },
    #[snafu(display("invalid request on `{stage}`: {details}"))]
    BadRequest {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("chat store failed on `{stage}`, {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("turn could not start on `{stage}`, {source}"))]
    Turn {
        stage: &'static str,
        source: CoreError,
    },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ChatNotFound { .. } => StatusCode::NOT_FOUND,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Storage { source, .. } if source.is_not_found() => StatusCode::NOT_FOUND,
            Self::Storage { source, .. } if source.is_invalid_input() => StatusCode::BAD_REQUEST,
            Self::Turn { source, .. } if source.is_not_found() => StatusCode::NOT_FOUND,
            Self::Turn { source, .. } if source.is_invalid_input() => StatusCode::BAD_REQUEST,
            Self::Turn { source, .. } if source.is_conflict() => StatusCode::CONFLICT,
            Self::Storage { .. } | Self::Turn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self, status: StatusCode) -> ErrorBody {
        match status {
            StatusCode::NOT_FOUND => ErrorBody {
                error: ErrorCategory::NotFound.user_message().to_string(),
                category: ErrorCategory::NotFound,
            },
            // Client errors describe the caller's own input, so the detail is safe to return.
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT => ErrorBody {
                error: self.client_detail(),
                category: ErrorCategory::Unknown,
            },
            _ => ErrorBody {
                error: ErrorCategory::Unknown.user_message().to_string(),
                category: ErrorCategory::Unknown,
            },
        }
    }

    fn client_detail(&self) -> String {
        match self {
            Self::BadRequest { details, .. } => details.clone(),
            Self::Storage { source, .. } => source.to_string(),
            Self::Turn { source, .. } => source.to_string(),
            Self::ChatNotFound { .. } => self.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }

        (status, Json(self.body(status))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_chat_maps_to_not_found() {
        let error = ApiError::Storage {
            stage: "test",
            source: StorageError::NotFound {
                stage: "test",
                entity: "chat",
                id: "x".to_string(),
            },
        };
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn internal_failures_do_not_leak_detail() {
        let error = ApiError::Storage {
            stage: "test",
            source: StorageError::InvariantViolation {
                stage: "test",
                details: "secret table layout".to_string(),
            },
        };
        let status = error.status();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!error.body(status).error.contains("secret"));
    }
}
