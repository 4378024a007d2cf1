//! EMSP receiver module handlers
//!
//! One submodule per OCPI module. Handlers authenticate the caller, parse
//! the body themselves so malformed JSON gets an OCPI envelope, call the
//! registry and map the outcome to a [`Reply`].

pub mod cdrs;
pub mod commands;
pub mod locations;
pub mod sessions;
pub mod tariffs;
pub mod tokens;

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use ocpi_core::{
    AuthorizationService, CommandStore, ObjectKey, Registry, Resource, VersionedStore,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::access::{AccessControl, Caller};
use crate::config::EmspConfig;
use crate::envelope::{etag_matches, not_modified, OcpiStatus, Reply};
use crate::error::ReceiverError;
use crate::observer::{ObserverChain, RequestObserver};

/// State shared by all handlers
pub struct ReceiverState {
    pub config: EmspConfig,
    pub registry: Arc<Registry>,
    pub commands: Arc<CommandStore>,
    pub authorization: AuthorizationService,
    pub access: AccessControl,
    pub observers: ObserverChain,
}

pub type SharedState = Arc<ReceiverState>;

impl ReceiverState {
    pub fn new(
        config: EmspConfig,
        registry: Arc<Registry>,
        commands: Arc<CommandStore>,
        authorization: AuthorizationService,
    ) -> Self {
        let access = AccessControl::new(config.parties.iter().cloned());
        Self {
            config,
            registry,
            commands,
            authorization,
            access,
            observers: ObserverChain::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observers = self.observers.with(observer);
        self
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(self)
    }
}

/// Query flags of a PUT
#[derive(Debug, Default, Deserialize)]
pub struct UpsertParams {
    #[serde(rename = "forceDowngrade")]
    pub force_downgrade: Option<String>,
}

impl UpsertParams {
    pub fn requested_downgrade(&self) -> bool {
        self.force_downgrade
            .as_deref()
            .map_or(false, |v| v.eq_ignore_ascii_case("true") || v == "1")
    }
}

/// Parse a JSON request body
pub(crate) fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ReceiverError> {
    serde_json::from_slice(body).map_err(|e| ReceiverError::InvalidRequest(format!("malformed body: {}", e)))
}

fn identity_mismatch(field: &str, in_path: &str, in_body: &str) -> ReceiverError {
    ReceiverError::InvalidRequest(format!(
        "{} '{}' in body does not match '{}' in path",
        field, in_body, in_path
    ))
}

/// Body object id must match the URL exactly, ids are keys as given
pub(crate) fn check_identity(field: &str, in_path: &str, in_body: &str) -> Result<(), ReceiverError> {
    if in_path == in_body {
        Ok(())
    } else {
        Err(identity_mismatch(field, in_path, in_body))
    }
}

/// Body country code or party id must match the URL, ignoring case
pub(crate) fn check_party_field(field: &str, in_path: &str, in_body: &str) -> Result<(), ReceiverError> {
    if in_path.eq_ignore_ascii_case(in_body) {
        Ok(())
    } else {
        Err(identity_mismatch(field, in_path, in_body))
    }
}

/// Address an object of the caller's own party
pub(crate) fn object_key(
    caller: &Caller,
    country_code: &str,
    party_id: &str,
    id: &str,
) -> Result<ObjectKey, ReceiverError> {
    let party = caller.require_party(country_code, party_id)?;
    Ok(ObjectKey::new(party, id))
}

fn upsert_status(was_created: bool) -> StatusCode {
    if was_created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

// ============================================================================
// Party-owned objects (tariffs, sessions)
// ============================================================================

/// Resources addressed by `/{country_code}/{party_id}/{id}`
pub(crate) trait PartyObject: Resource<Key = ObjectKey> {
    fn identity(&self) -> (&str, &str, &str);
}

impl PartyObject for ocpi_core::Tariff {
    fn identity(&self) -> (&str, &str, &str) {
        (&self.country_code, &self.party_id, &self.id)
    }
}

impl PartyObject for ocpi_core::Session {
    fn identity(&self) -> (&str, &str, &str) {
        (&self.country_code, &self.party_id, &self.id)
    }
}

impl PartyObject for ocpi_core::Cdr {
    fn identity(&self) -> (&str, &str, &str) {
        (&self.country_code, &self.party_id, &self.id)
    }
}

pub(crate) async fn get_object<R: PartyObject>(
    store: &VersionedStore<R>,
    key: &ObjectKey,
    headers: &HeaderMap,
) -> Result<Response, ReceiverError> {
    let stored = store
        .get(key)
        .await
        .ok_or_else(|| ReceiverError::unknown(R::KIND, key))?;

    if etag_matches(headers, &stored.etag) {
        return Ok(not_modified(&stored.etag));
    }
    Ok(Reply::resource(StatusCode::OK, &stored)?.into_response())
}

pub(crate) async fn put_object<R: PartyObject>(
    store: &VersionedStore<R>,
    key: &ObjectKey,
    body: &Bytes,
    allow_downgrade: bool,
) -> Result<Reply, ReceiverError> {
    let incoming: R = parse_body(body)?;
    let (country_code, party_id, id) = incoming.identity();
    check_party_field("country_code", &key.party.country_code, country_code)?;
    check_party_field("party_id", &key.party.party_id, party_id)?;
    check_identity("id", &key.id, id)?;

    let upserted = store.upsert(incoming, allow_downgrade).await?;
    Ok(Reply::resource(upsert_status(upserted.was_created), &upserted.stored)?.without_data())
}

pub(crate) async fn patch_object<R: PartyObject>(
    store: &VersionedStore<R>,
    key: &ObjectKey,
    body: &Bytes,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Reply, ReceiverError> {
    let patch: Value = parse_body(body)?;
    let stored = store.patch(key, &patch, now).await?;
    Ok(Reply::resource(StatusCode::OK, &stored)?)
}

pub(crate) async fn delete_object<R: PartyObject>(
    store: &VersionedStore<R>,
    key: &ObjectKey,
) -> Result<Reply, ReceiverError> {
    match store.remove(key).await {
        Some(_) => Ok(Reply::ok()),
        None => Ok(Reply::rejected(
            OcpiStatus::unknown(R::KIND),
            format!("Unknown {}: {}", R::KIND, key),
        )),
    }
}
