//! Receiver errors and their OCPI responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ocpi_core::{RegistryError, ResourceKind};
use thiserror::Error;
use tracing::{debug, error};

use crate::envelope::{OcpiStatus, Reply};

/// Errors surfaced by receiver handlers
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Missing or unknown access token")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Lookup of a resource that does not exist (GET)
    #[error("Unknown {kind}: {id}")]
    UnknownResource { kind: ResourceKind, id: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ReceiverError {
    /// Registry error from a read, where an unknown identity is a 404
    pub fn lookup(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { kind, id } => ReceiverError::UnknownResource { kind, id },
            other => ReceiverError::Registry(other),
        }
    }

    pub fn unknown(kind: ResourceKind, id: impl ToString) -> Self {
        ReceiverError::UnknownResource {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for ReceiverError {
    fn from(err: serde_json::Error) -> Self {
        ReceiverError::Registry(RegistryError::Serialization(err))
    }
}

impl IntoResponse for ReceiverError {
    fn into_response(self) -> Response {
        let message = self.to_string();

        let reply = match self {
            ReceiverError::Unauthorized => Reply::new(StatusCode::UNAUTHORIZED, OcpiStatus::ClientError),
            ReceiverError::Forbidden(_) => Reply::new(StatusCode::FORBIDDEN, OcpiStatus::ClientError),
            ReceiverError::InvalidRequest(_) => {
                Reply::new(StatusCode::BAD_REQUEST, OcpiStatus::InvalidParameters)
            }
            ReceiverError::UnknownResource { kind, .. } => {
                Reply::new(StatusCode::NOT_FOUND, OcpiStatus::unknown(kind))
            }
            ReceiverError::Registry(err) => match err {
                RegistryError::DowngradeRejected {
                    last_updated,
                    etag,
                    existing,
                    ..
                } => Reply::new(StatusCode::BAD_REQUEST, OcpiStatus::ClientError)
                    .with_data(existing)
                    .with_version(&etag, last_updated),
                RegistryError::NotFound { kind, .. } => Reply::new(StatusCode::OK, OcpiStatus::unknown(kind)),
                RegistryError::AlreadyExists { kind, .. } => {
                    return Reply::new(StatusCode::BAD_REQUEST, OcpiStatus::ClientError)
                        .with_message(format!("{} already exists", kind))
                        .into_response();
                }
                RegistryError::InvalidPatch(_) | RegistryError::InvalidResource(_) => {
                    Reply::new(StatusCode::BAD_REQUEST, OcpiStatus::InvalidParameters)
                }
                RegistryError::Serialization(e) => {
                    error!("Receiver: Serialization failure: {}", e);
                    Reply::new(StatusCode::INTERNAL_SERVER_ERROR, OcpiStatus::ServerError)
                }
            },
        };

        debug!("Receiver: {} ({})", message, reply.http_status());
        reply.with_message(message).into_response()
    }
}
