//! OCPI response envelope
//!
//! Every response body is `{ data?, status_code, status_message?, timestamp }`.
//! Semantic failures travel in `status_code`; the HTTP status is reserved
//! for transport, authentication and malformed-input failures.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use ocpi_core::{ETag, ResourceKind, Resource, Stored};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// OCPI status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcpiStatus {
    Success,
    ClientError,
    InvalidParameters,
    NotEnoughInformation,
    UnknownLocation,
    UnknownToken,
    ServerError,
}

impl OcpiStatus {
    pub fn code(&self) -> u16 {
        match self {
            OcpiStatus::Success => 1000,
            OcpiStatus::ClientError => 2000,
            OcpiStatus::InvalidParameters => 2001,
            OcpiStatus::NotEnoughInformation => 2002,
            OcpiStatus::UnknownLocation => 2003,
            OcpiStatus::UnknownToken => 2004,
            OcpiStatus::ServerError => 3000,
        }
    }

    /// Status for a resource that could not be found
    pub fn unknown(kind: ResourceKind) -> Self {
        if kind.is_location_family() {
            OcpiStatus::UnknownLocation
        } else {
            OcpiStatus::InvalidParameters
        }
    }
}

/// Response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Format a timestamp as an HTTP-date
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// An OCPI response under construction
#[derive(Debug)]
pub struct Reply {
    http: StatusCode,
    status: OcpiStatus,
    message: Option<String>,
    data: Option<Value>,
    headers: HeaderMap,
}

impl Reply {
    pub fn new(http: StatusCode, status: OcpiStatus) -> Self {
        Self {
            http,
            status,
            message: None,
            data: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK, OcpiStatus::Success)
    }

    /// HTTP 200 carrying a non-success OCPI status
    pub fn rejected(status: OcpiStatus, message: impl Into<String>) -> Self {
        Self::new(StatusCode::OK, status).with_message(message)
    }

    /// Versioned resource with its `ETag` and `Last-Modified` headers
    pub fn resource<R: Resource>(http: StatusCode, stored: &Stored<R>) -> Result<Self, serde_json::Error> {
        Ok(Self::new(http, OcpiStatus::Success)
            .with_data(serde_json::to_value(&stored.resource)?)
            .with_version(&stored.etag, stored.last_updated()))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn without_data(mut self) -> Self {
        self.data = None;
        self
    }

    pub fn with_version(self, etag: &ETag, last_updated: DateTime<Utc>) -> Self {
        self.with_header(header::ETAG, format!("\"{}\"", etag))
            .with_header(header::LAST_MODIFIED, http_date(last_updated))
    }

    /// Add a header; values that are not valid header text are dropped
    pub fn with_header(mut self, name: HeaderName, value: impl AsRef<str>) -> Self {
        match HeaderValue::from_str(value.as_ref()) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => error!("Receiver: Dropping invalid {} header value", name),
        }
        self
    }

    pub fn http_status(&self) -> StatusCode {
        self.http
    }

    pub fn status(&self) -> OcpiStatus {
        self.status
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let envelope = Envelope {
            data: self.data,
            status_code: self.status.code(),
            status_message: self.message,
            timestamp: Utc::now(),
        };

        let mut response = (self.http, self.headers, axum::Json(envelope)).into_response();
        response.extensions_mut().insert(self.status);
        response
    }
}

/// Empty 304 for a matching `If-None-Match`
pub fn not_modified(etag: &ETag) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
}

/// Whether an `If-None-Match` header names `etag`
pub fn etag_matches(headers: &HeaderMap, etag: &ETag) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|tag| tag.trim().trim_start_matches("W/").trim_matches('"'))
        .any(|tag| tag == "*" || tag == etag.as_str())
}
