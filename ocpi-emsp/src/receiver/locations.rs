//! Locations module
//!
//! - `/locations/{cc}/{pid}/{location_id}`
//! - `/locations/{cc}/{pid}/{location_id}/{evse_uid}`
//! - `/locations/{cc}/{pid}/{location_id}/{evse_uid}/{connector_id}`
//!
//! EVSEs and connectors are versioned on their own `last_updated`; writing
//! one requires its parent to exist.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use ocpi_core::{Connector, Evse, Location, ResourceKind, Stored};
use serde_json::Value;

use super::{check_identity, check_party_field, object_key, parse_body, upsert_status, SharedState, UpsertParams};
use crate::access::Caller;
use crate::envelope::{etag_matches, not_modified, OcpiStatus, Reply};
use crate::error::ReceiverError;

type LocationPath = Path<(String, String, String)>;
type EvsePath = Path<(String, String, String, String)>;
type ConnectorPath = Path<(String, String, String, String, String)>;

fn cached_or_reply<R: ocpi_core::Resource>(stored: &Stored<R>, headers: &HeaderMap) -> Result<Response, ReceiverError> {
    if etag_matches(headers, &stored.etag) {
        return Ok(not_modified(&stored.etag));
    }
    Ok(Reply::resource(StatusCode::OK, stored)?.into_response())
}

// ============================================================================
// Location
// ============================================================================

pub async fn get_location(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, location_id)): LocationPath,
    headers: HeaderMap,
) -> Result<Response, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &location_id)?;
    let stored = state
        .registry
        .locations()
        .get(&key)
        .await
        .ok_or_else(|| ReceiverError::unknown(ResourceKind::Location, &key))?;

    cached_or_reply(&stored, &headers)
}

pub async fn put_location(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, location_id)): LocationPath,
    Query(params): Query<UpsertParams>,
    body: Bytes,
) -> Result<Reply, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &location_id)?;
    let location: Location = parse_body(&body)?;
    check_party_field("country_code", &key.party.country_code, &location.country_code)?;
    check_party_field("party_id", &key.party.party_id, &location.party_id)?;
    check_identity("id", &key.id, &location.id)?;

    let allow_downgrade = state.config.allow_downgrade(params.requested_downgrade());
    let upserted = state.registry.put_location(location, allow_downgrade).await?;

    Ok(Reply::resource(upsert_status(upserted.was_created), &upserted.stored)?.without_data())
}

pub async fn patch_location(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, location_id)): LocationPath,
    body: Bytes,
) -> Result<Reply, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &location_id)?;
    let patch: Value = parse_body(&body)?;
    let stored = state.registry.patch_location(&key, &patch).await?;

    Ok(Reply::resource(StatusCode::OK, &stored)?)
}

pub async fn delete_location(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, location_id)): LocationPath,
) -> Result<Reply, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &location_id)?;
    match state.registry.locations().remove(&key).await {
        Some(_) => Ok(Reply::ok()),
        None => Ok(Reply::rejected(
            OcpiStatus::UnknownLocation,
            format!("Unknown location: {}", key),
        )),
    }
}

// ============================================================================
// EVSE
// ============================================================================

pub async fn get_evse(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, location_id, evse_uid)): EvsePath,
    headers: HeaderMap,
) -> Result<Response, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &location_id)?;
    let stored = state
        .registry
        .get_evse(&key, &evse_uid)
        .await
        .map_err(ReceiverError::lookup)?;

    cached_or_reply(&stored, &headers)
}

pub async fn put_evse(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, location_id, evse_uid)): EvsePath,
    Query(params): Query<UpsertParams>,
    body: Bytes,
) -> Result<Reply, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &location_id)?;
    let evse: Evse = parse_body(&body)?;
    check_identity("uid", &evse_uid, &evse.uid)?;

    let allow_downgrade = state.config.allow_downgrade(params.requested_downgrade());
    let upserted = state.registry.put_evse(&key, evse, allow_downgrade).await?;

    Ok(Reply::resource(upsert_status(upserted.was_created), &upserted.stored)?.without_data())
}

pub async fn patch_evse(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, location_id, evse_uid)): EvsePath,
    body: Bytes,
) -> Result<Reply, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &location_id)?;
    let patch: Value = parse_body(&body)?;
    let stored = state.registry.patch_evse(&key, &evse_uid, &patch).await?;

    Ok(Reply::resource(StatusCode::OK, &stored)?)
}

// ============================================================================
// Connector
// ============================================================================

pub async fn get_connector(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, location_id, evse_uid, connector_id)): ConnectorPath,
    headers: HeaderMap,
) -> Result<Response, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &location_id)?;
    let stored = state
        .registry
        .get_connector(&key, &evse_uid, &connector_id)
        .await
        .map_err(ReceiverError::lookup)?;

    cached_or_reply(&stored, &headers)
}

pub async fn put_connector(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, location_id, evse_uid, connector_id)): ConnectorPath,
    Query(params): Query<UpsertParams>,
    body: Bytes,
) -> Result<Reply, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &location_id)?;
    let connector: Connector = parse_body(&body)?;
    check_identity("id", &connector_id, &connector.id)?;

    let allow_downgrade = state.config.allow_downgrade(params.requested_downgrade());
    let upserted = state
        .registry
        .put_connector(&key, &evse_uid, connector, allow_downgrade)
        .await?;

    Ok(Reply::resource(upsert_status(upserted.was_created), &upserted.stored)?.without_data())
}

pub async fn patch_connector(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, location_id, evse_uid, connector_id)): ConnectorPath,
    body: Bytes,
) -> Result<Reply, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &location_id)?;
    let patch: Value = parse_body(&body)?;
    let stored = state
        .registry
        .patch_connector(&key, &evse_uid, &connector_id, &patch)
        .await?;

    Ok(Reply::resource(StatusCode::OK, &stored)?)
}
