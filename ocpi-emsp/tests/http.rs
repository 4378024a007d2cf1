//! Receiver over a loopback socket, driven by a reqwest client

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use ocpi_core::{
    AuthorizationService, CommandResultType, CommandStore, CommandType, LocalAuthorizer, PartyKey, Registry,
    TokenStatus,
};
use ocpi_emsp::{
    CommandDispatcher, CommandResponseType, CpoEndpoint, EmspConfig, PartyAccess, ReceiverState, RequestInfo,
    RequestObserver, ResponseInfo, SharedState,
};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const CPO_TOKEN: &str = "cpo-token";

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, u16)>>,
}

impl RequestObserver for Recorder {
    fn on_response(&self, request: &RequestInfo, response: &ResponseInfo) {
        self.seen.lock().push((
            request.path.clone(),
            response.ocpi_status.map_or(0, |s| s.code()),
        ));
    }
}

struct TestServer {
    base: String,
    http: reqwest::Client,
    state: SharedState,
    recorder: Arc<Recorder>,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|config| config).await
    }

    async fn start_with(configure: impl FnOnce(EmspConfig) -> EmspConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = configure(
            EmspConfig::new(PartyKey::new("NL", "EMS"))
                .with_listen_addr(addr)
                .with_public_url(format!("http://{}", addr))
                .with_page_limits(2, 10)
                .with_party(PartyAccess::cpo(CPO_TOKEN, PartyKey::new("DE", "GEF")))
                .with_party(PartyAccess::cpo("blocked-token", PartyKey::new("DE", "BLK")).blocked()),
        );
        let base = config.url("");

        let registry = Arc::new(Registry::new());
        let commands = Arc::new(CommandStore::new(config.command_ttl));
        let authorization = AuthorizationService::new(Arc::new(LocalAuthorizer::new(
            registry.clone(),
            config.party.clone(),
        )));

        let recorder = Arc::new(Recorder::default());
        let state = ReceiverState::new(config, registry, commands, authorization)
            .with_observer(recorder.clone())
            .into_shared();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(ocpi_emsp::serve_listener(state.clone(), listener, async {
            let _ = shutdown_rx.await;
        }));

        Self {
            base,
            http: reqwest::Client::new(),
            state,
            recorder,
            _shutdown: shutdown_tx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("Authorization", format!("Token {}", CPO_TOKEN))
    }

    async fn send(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> (StatusCode, reqwest::header::HeaderMap, Value) {
        let mut request = self.request(method, path);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = if status == StatusCode::NOT_MODIFIED {
            Value::Null
        } else {
            response.json().await.unwrap()
        };
        (status, headers, body)
    }

    async fn put(&self, path: &str, body: Value) -> (StatusCode, reqwest::header::HeaderMap, Value) {
        self.send(reqwest::Method::PUT, path, Some(body)).await
    }

    async fn patch(&self, path: &str, body: Value) -> (StatusCode, reqwest::header::HeaderMap, Value) {
        self.send(reqwest::Method::PATCH, path, Some(body)).await
    }

    async fn get(&self, path: &str) -> (StatusCode, reqwest::header::HeaderMap, Value) {
        self.send(reqwest::Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, reqwest::header::HeaderMap, Value) {
        self.send(reqwest::Method::POST, path, Some(body)).await
    }
}

fn location(last_updated: &str) -> Value {
    json!({
        "country_code": "DE",
        "party_id": "GEF",
        "id": "loc-1",
        "name": "Depot",
        "evses": [{
            "uid": "E1",
            "status": "AVAILABLE",
            "connectors": [{"id": "1", "standard": "IEC_62196_T2", "last_updated": last_updated}],
            "last_updated": last_updated
        }],
        "last_updated": last_updated
    })
}

async fn seed_token(server: &TestServer, uid: &str, allowed: &str, last_updated: &str) {
    let status: TokenStatus = serde_json::from_value(json!({
        "token": {
            "country_code": "NL",
            "party_id": "EMS",
            "uid": uid,
            "type": "RFID",
            "contract_id": format!("NL-EMS-C{}", uid),
            "last_updated": last_updated
        },
        "allowed": allowed
    }))
    .unwrap();
    server.state.registry.tokens().upsert(status, false).await.unwrap();
}

// ============================================================================
// Locations
// ============================================================================

#[tokio::test]
async fn test_location_downgrade_protection() {
    let server = TestServer::start().await;
    let path = "/locations/DE/GEF/loc-1";

    let (status, headers, body) = server.put(path, location("2024-03-01T12:00:00Z")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status_code"], 1000);
    let etag = headers["etag"].to_str().unwrap().to_string();

    // Older representation without override
    let (status, headers, body) = server.put(path, location("2024-03-01T11:00:00Z")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status_code"], 2000);
    assert_eq!(body["data"]["last_updated"], "2024-03-01T12:00:00Z");
    assert_eq!(headers["etag"].to_str().unwrap(), etag);
    assert_eq!(headers["last-modified"], "Fri, 01 Mar 2024 12:00:00 GMT");

    let (_, _, body) = server.get(path).await;
    assert_eq!(body["data"]["last_updated"], "2024-03-01T12:00:00Z");

    // Explicit override
    let (status, _, _) = server
        .put(&format!("{}?forceDowngrade=true", path), location("2024-03-01T11:00:00Z"))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = server.get(path).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["last_updated"], "2024-03-01T11:00:00Z");
    assert_eq!(body["data"]["name"], "Depot");
}

#[tokio::test]
async fn test_server_policy_overrides_request_flag() {
    let server = TestServer::start_with(|config| config.with_downgrade_policy(false)).await;
    let path = "/locations/DE/GEF/loc-1";

    server.put(path, location("2024-03-01T12:00:00Z")).await;
    let (status, _, _) = server
        .put(&format!("{}?forceDowngrade=true", path), location("2024-03-01T11:00:00Z"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_nested_evse_and_connector() {
    let server = TestServer::start().await;

    // Parent missing
    let evse = json!({"uid": "E2", "status": "AVAILABLE", "last_updated": "2024-03-01T12:30:00Z"});
    let (status, _, body) = server.put("/locations/DE/GEF/loc-1/E2", evse.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 2003);

    server.put("/locations/DE/GEF/loc-1", location("2024-03-01T12:00:00Z")).await;
    let (status, _, _) = server.put("/locations/DE/GEF/loc-1/E2", evse).await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, _, body) = server.get("/locations/DE/GEF/loc-1").await;
    assert_eq!(body["data"]["last_updated"], "2024-03-01T12:30:00Z");
    assert_eq!(body["data"]["evses"].as_array().unwrap().len(), 2);

    let (status, _, body) = server
        .patch("/locations/DE/GEF/loc-1/E1/1", json!({"max_electric_power": 22000}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["max_electric_power"], 22000);

    let (status, _, body) = server.get("/locations/DE/GEF/loc-1/E1/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["standard"], "IEC_62196_T2");

    let (status, _, body) = server.get("/locations/DE/GEF/loc-1/E9").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status_code"], 2003);
}

#[tokio::test]
async fn test_patch_and_get_unknown() {
    let server = TestServer::start().await;

    let (status, _, body) = server
        .patch("/locations/DE/GEF/nowhere", json!({"name": "Renamed"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 2003);

    let (status, _, body) = server
        .patch("/tariffs/DE/GEF/t-404", json!({"currency": "EUR"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 2001);

    let (status, _, body) = server.get("/sessions/DE/GEF/s-404").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status_code"], 2001);
    assert!(server.state.registry.tariffs().is_empty());
}

#[tokio::test]
async fn test_malformed_and_mismatched_bodies() {
    let server = TestServer::start().await;

    let response = server
        .request(reqwest::Method::PUT, "/locations/DE/GEF/loc-1")
        .header("Content-Type", "application/json")
        .body("{\"id\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status_code"], 2001);

    let mut other = location("2024-03-01T12:00:00Z");
    other["id"] = json!("loc-2");
    let (status, _, body) = server.put("/locations/DE/GEF/loc-1", other).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status_code"], 2001);
}

#[tokio::test]
async fn test_object_ids_are_case_sensitive() {
    let server = TestServer::start().await;

    let mut shouted = location("2024-03-01T12:00:00Z");
    shouted["id"] = json!("LOC-1");
    let (status, _, body) = server.put("/locations/DE/GEF/loc-1", shouted).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status_code"], 2001);
    assert!(server.state.registry.locations().is_empty());

    let evse = json!({"uid": "e1", "status": "AVAILABLE", "last_updated": "2024-03-01T12:00:00Z"});
    server.put("/locations/DE/GEF/loc-1", location("2024-03-01T12:00:00Z")).await;
    let (status, _, body) = server.put("/locations/DE/GEF/loc-1/E1", evse).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status_code"], 2001);

    // Party fields still match regardless of case
    let mut lower = location("2024-03-01T13:00:00Z");
    lower["country_code"] = json!("de");
    lower["party_id"] = json!("gef");
    let (status, _, _) = server.put("/locations/DE/GEF/loc-1", lower).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = server.get("/locations/DE/GEF/loc-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["last_updated"], "2024-03-01T13:00:00Z");
}

#[tokio::test]
async fn test_if_none_match() {
    let server = TestServer::start().await;
    let tariff = json!({
        "country_code": "DE",
        "party_id": "GEF",
        "id": "t-1",
        "currency": "EUR",
        "last_updated": "2024-03-01T12:00:00Z"
    });
    let (status, headers, _) = server.put("/tariffs/DE/GEF/t-1", tariff).await;
    assert_eq!(status, StatusCode::CREATED);
    let etag = headers["etag"].to_str().unwrap().to_string();

    let response = server
        .request(reqwest::Method::GET, "/tariffs/DE/GEF/t-1")
        .header("If-None-Match", etag)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    let (status, _, body) = server
        .send(reqwest::Method::DELETE, "/tariffs/DE/GEF/t-1", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 1000);
}

// ============================================================================
// Access control
// ============================================================================

#[tokio::test]
async fn test_access_control() {
    let server = TestServer::start().await;
    let path = server.url("/locations/DE/GEF/loc-1");

    let response = server.http.get(&path).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = server
        .http
        .get(&path)
        .header("Authorization", "Token blocked-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Valid caller, someone else's objects
    let (status, _, _) = server.get("/locations/FR/XYZ/loc-1").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let health = format!("{}/health", server.state.config.public_url);
    let response = server.http.get(health).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_observers_and_request_ids() {
    let server = TestServer::start().await;

    let response = server
        .request(reqwest::Method::GET, "/sessions/DE/GEF/s-1")
        .header("X-Request-ID", "req-42")
        .header("X-Correlation-ID", "corr-7")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-42");
    assert_eq!(response.headers()["x-correlation-id"], "corr-7");

    let seen = server.recorder.seen.lock().clone();
    assert_eq!(seen, vec![("/ocpi/emsp/2.2/sessions/DE/GEF/s-1".to_string(), 2001)]);
}

// ============================================================================
// CDRs and tokens
// ============================================================================

#[tokio::test]
async fn test_cdr_is_create_only() {
    let server = TestServer::start().await;
    let cdr = json!({
        "country_code": "DE",
        "party_id": "GEF",
        "id": "cdr-1",
        "total_energy": 12.5,
        "last_updated": "2024-03-01T13:00:00Z"
    });

    let (status, headers, _) = server.post("/cdrs", cdr.clone()).await;
    assert_eq!(status, StatusCode::CREATED);
    let location = headers["location"].to_str().unwrap().to_string();
    assert_eq!(location, server.url("/cdrs/DE/GEF/cdr-1"));

    let (status, _, body) = server.post("/cdrs", cdr).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status_code"], 2000);
    assert_eq!(body["status_message"], "CDR already exists");

    let (status, _, body) = server.get("/cdrs/DE/GEF/cdr-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_energy"], 12.5);
}

#[tokio::test]
async fn test_token_pagination() {
    let server = TestServer::start().await;
    for (uid, at) in [
        ("t-1", "2024-01-01T00:00:00Z"),
        ("t-2", "2024-01-02T00:00:00Z"),
        ("t-3", "2024-01-03T00:00:00Z"),
    ] {
        seed_token(&server, uid, "ALLOWED", at).await;
    }

    let (status, headers, body) = server.get("/tokens").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-total-count"], "3");
    assert_eq!(headers["x-limit"], "2");
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"][0]["uid"], "t-1");
    assert_eq!(
        headers["link"].to_str().unwrap(),
        format!("<{}?offset=2&limit=2>; rel=\"next\"", server.url("/tokens"))
    );

    let (_, headers, body) = server.get("/tokens?offset=2&limit=2").await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert!(headers.get("link").is_none());

    let (_, headers, _) = server.get("/tokens?date_from=2024-01-02T00:00:00Z").await;
    assert_eq!(headers["x-total-count"], "2");

    let (status, _, body) = server.get("/tokens?date_from=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status_code"], 2001);
}

#[tokio::test]
async fn test_authorize() {
    let server = TestServer::start().await;
    seed_token(&server, "tok-ok", "ALLOWED", "2024-01-01T00:00:00Z").await;
    server.put("/locations/DE/GEF/loc-1", location("2024-03-01T12:00:00Z")).await;

    let (status, _, body) = server
        .post("/tokens/tok-ok/authorize?type=RFID", json!({"location_id": "loc-1", "evse_uids": ["E1", "E7"]}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 1000);
    assert_eq!(body["data"]["allowed"], "ALLOWED");
    assert_eq!(body["data"]["location"]["evse_uids"], json!(["E1"]));
    assert_eq!(body["data"]["info"]["text"], "Charging allowed!");

    let (status, _, body) = server
        .post("/tokens/tok-ok/authorize", json!({"location_id": "loc-1", "evse_uids": ["E7", "E8"]}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 2003);
    assert_eq!(body["data"]["allowed"], "NOT_ALLOWED");
    assert!(!body["data"]["info"]["text"].as_str().unwrap().is_empty());

    let response = server
        .request(reqwest::Method::POST, "/tokens/nobody/authorize")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status_code"], 2004);
    assert_eq!(body["data"]["allowed"], "NOT_ALLOWED");
}

// ============================================================================
// Commands
// ============================================================================

#[tokio::test]
async fn test_command_callbacks() {
    let server = TestServer::start().await;

    let (status, _, body) = server
        .post("/commands/START_SESSION/never-sent", json!({"result": "ACCEPTED"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 2000);
    assert_eq!(body["status_message"], "Unknown command");

    server
        .state
        .commands
        .record_dispatch_with_id("cmd-1".to_string(), CommandType::StartSession)
        .unwrap();

    let (status, _, _) = server
        .post("/commands/START_SESSION/cmd-1", json!({"result": "ACCEPTED"}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _, _) = server
        .post("/commands/START_SESSION/cmd-1", json!({"result": "REJECTED"}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let record = server.state.commands.get("cmd-1").unwrap();
    assert_eq!(record.result.unwrap().result, CommandResultType::Rejected);
    assert_eq!(record.deliveries, 2);

    // Same id under another command type
    let (status, _, body) = server
        .post("/commands/STOP_SESSION/cmd-1", json!({"result": "ACCEPTED"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 2000);

    let (status, _, body) = server
        .post("/commands/REBOOT/cmd-1", json!({"result": "ACCEPTED"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status_code"], 2001);
}

/// Minimal CPO commands module: answers ACCEPTED, then posts the result
async fn mock_cpo_command(
    State(http): State<reqwest::Client>,
    Path(command_type): Path<String>,
    Json(command): Json<Value>,
) -> Json<Value> {
    let response_url = command["response_url"].as_str().unwrap_or_default().to_string();
    let result = if command_type == "START_SESSION" { "ACCEPTED" } else { "REJECTED" };

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = http
            .post(response_url)
            .header("Authorization", format!("Token {}", CPO_TOKEN))
            .json(&json!({"result": result}))
            .send()
            .await;
    });

    Json(json!({
        "data": {"result": "ACCEPTED", "timeout": 30},
        "status_code": 1000,
        "timestamp": "2024-03-01T12:00:00Z"
    }))
}

#[tokio::test]
async fn test_dispatch_and_correlate() {
    let cpo_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cpo_addr = cpo_listener.local_addr().unwrap();
    let cpo = Router::new()
        .route("/commands/:command_type", post(mock_cpo_command))
        .with_state(reqwest::Client::new());
    tokio::spawn(async move {
        let _ = axum::serve(cpo_listener, cpo).await;
    });

    let server = TestServer::start_with(|config| {
        config.with_cpo_endpoint(CpoEndpoint {
            party: PartyKey::new("DE", "GEF"),
            token: "emsp-token".to_string(),
            commands_url: format!("http://{}/commands", cpo_addr),
        })
    })
    .await;

    let dispatcher = CommandDispatcher::new(&server.state.config, server.state.commands.clone());
    let dispatched = dispatcher
        .dispatch(
            &PartyKey::new("DE", "GEF"),
            CommandType::StartSession,
            json!({"token": {"uid": "tok-ok"}, "location_id": "loc-1"}),
        )
        .await
        .unwrap();
    assert_eq!(dispatched.response.result, CommandResponseType::Accepted);

    let result = server
        .state
        .commands
        .wait_for_result(&dispatched.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.result, CommandResultType::Accepted);

    let record = server.state.commands.get(&dispatched.id).unwrap();
    assert_eq!(record.command_type, CommandType::StartSession);
    assert_eq!(record.deliveries, 1);
}
