//! Request observers
//!
//! Observers see every request before its handler runs and every response
//! after, without the handlers knowing about them. The chain runs as axum
//! middleware around the whole receiver.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, warn};
use uuid::Uuid;

use crate::envelope::OcpiStatus;
use crate::receiver::SharedState;

pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");

/// What observers learn about a request
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub request_id: String,
    pub correlation_id: Option<String>,
    pub method: Method,
    pub path: String,
}

/// What observers learn about the response
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: StatusCode,
    /// OCPI status code, absent for bodies not produced by the receiver
    pub ocpi_status: Option<OcpiStatus>,
    pub elapsed: Duration,
}

/// Hook around every receiver request
pub trait RequestObserver: Send + Sync {
    fn on_request(&self, _request: &RequestInfo) {}

    fn on_response(&self, _request: &RequestInfo, _response: &ResponseInfo) {}
}

/// Ordered list of observers
#[derive(Clone, Default)]
pub struct ObserverChain {
    observers: Vec<Arc<dyn RequestObserver>>,
}

impl ObserverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify_request(&self, request: &RequestInfo) {
        for observer in &self.observers {
            observer.on_request(request);
        }
    }

    pub fn notify_response(&self, request: &RequestInfo, response: &ResponseInfo) {
        for observer in &self.observers {
            observer.on_response(request, response);
        }
    }
}

/// Logs one line per request
#[derive(Debug, Default)]
pub struct TracingObserver;

impl RequestObserver for TracingObserver {
    fn on_response(&self, request: &RequestInfo, response: &ResponseInfo) {
        let ocpi = response.ocpi_status.map_or(0, |s| s.code());
        if response.status.is_server_error() {
            warn!(
                "Receiver: {} {} -> {} / {} in {:?} (request {})",
                request.method, request.path, response.status, ocpi, response.elapsed, request.request_id
            );
        } else {
            info!(
                "Receiver: {} {} -> {} / {} in {:?} (request {})",
                request.method, request.path, response.status, ocpi, response.elapsed, request.request_id
            );
        }
    }
}

fn header_text(request: &Request, name: &HeaderName) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Middleware running the observer chain and echoing request ids
pub async fn observe(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let info = RequestInfo {
        request_id: header_text(&request, &REQUEST_ID).unwrap_or_else(|| Uuid::new_v4().to_string()),
        correlation_id: header_text(&request, &CORRELATION_ID),
        method: request.method().clone(),
        path: request.uri().path().to_string(),
    };

    state.observers.notify_request(&info);
    let started = Instant::now();

    let mut response = next.run(request).await;

    let outcome = ResponseInfo {
        status: response.status(),
        ocpi_status: response.extensions().get::<OcpiStatus>().copied(),
        elapsed: started.elapsed(),
    };
    state.observers.notify_response(&info, &outcome);

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&info.request_id) {
        headers.insert(REQUEST_ID, value);
    }
    if let Some(value) = info.correlation_id.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(CORRELATION_ID, value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl RequestObserver for Recorder {
        fn on_request(&self, request: &RequestInfo) {
            self.seen.lock().push(format!("> {}", request.path));
        }

        fn on_response(&self, request: &RequestInfo, response: &ResponseInfo) {
            self.seen.lock().push(format!("< {} {}", request.path, response.status.as_u16()));
        }
    }

    #[test]
    fn test_chain_notifies_in_order() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let chain = ObserverChain::new()
            .with(first.clone())
            .with(Arc::new(TracingObserver))
            .with(second.clone());
        assert_eq!(chain.len(), 3);

        let request = RequestInfo {
            request_id: "req-1".to_string(),
            correlation_id: None,
            method: Method::GET,
            path: "/tokens".to_string(),
        };
        chain.notify_request(&request);
        chain.notify_response(
            &request,
            &ResponseInfo {
                status: StatusCode::OK,
                ocpi_status: Some(OcpiStatus::Success),
                elapsed: Duration::from_millis(3),
            },
        );

        assert_eq!(*first.seen.lock(), vec!["> /tokens", "< /tokens 200"]);
        assert_eq!(*second.seen.lock(), *first.seen.lock());
    }
}
