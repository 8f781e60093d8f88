use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

use crate::cachememdb::IndexError;
use crate::persist::StorageError;

/// An error returned by the [`LeaseCache`](crate::LeaseCache).
#[derive(Debug, thiserror::Error)]
pub enum LeaseCacheError {
    /// The request was malformed.
    #[error("{0}")]
    InvalidRequest(String),

    /// The proxier failed to produce a response.
    ///
    /// This is the proxier's own error, passed through unchanged.
    #[error(transparent)]
    Proxy(anyhow::Error),

    /// An entry could not be indexed or encoded.
    #[error("internal cache error")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("persistent storage failed")]
    Storage(#[from] StorageError),
}

impl LeaseCacheError {
    /// The HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Proxy(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<IndexError> for LeaseCacheError {
    fn from(err: IndexError) -> Self {
        Self::Internal(Box::new(err))
    }
}

impl From<serde_json::Error> for LeaseCacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(Box::new(err))
    }
}

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<LeaseCacheError> for ResponseError {
    fn from(err: LeaseCacheError) -> Self {
        Self {
            status: err.status(),
            err: err.into(),
        }
    }
}

impl From<serde_json::Error> for ResponseError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            err: err.into(),
        }
    }
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((code, msg): (StatusCode, &'static str)) -> Self {
        Self {
            status: code,
            err: anyhow::anyhow!(msg),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
///
/// Lists the error followed by its causes.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    pub errors: Vec<String>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let errors = err.chain().map(|err| err.to_string()).collect();
        ApiErrorResponse { errors }
    }
}
