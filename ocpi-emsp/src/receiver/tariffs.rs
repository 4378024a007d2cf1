//! Tariffs module: `/tariffs/{country_code}/{party_id}/{tariff_id}`

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;

use super::{delete_object, get_object, object_key, patch_object, put_object, SharedState, UpsertParams};
use crate::access::Caller;
use crate::envelope::Reply;
use crate::error::ReceiverError;

pub async fn get_tariff(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, tariff_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &tariff_id)?;
    get_object(state.registry.tariffs(), &key, &headers).await
}

pub async fn put_tariff(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, tariff_id)): Path<(String, String, String)>,
    Query(params): Query<UpsertParams>,
    body: Bytes,
) -> Result<Reply, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &tariff_id)?;
    let allow_downgrade = state.config.allow_downgrade(params.requested_downgrade());
    put_object(state.registry.tariffs(), &key, &body, allow_downgrade).await
}

pub async fn patch_tariff(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, tariff_id)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<Reply, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &tariff_id)?;
    patch_object(state.registry.tariffs(), &key, &body, state.registry.now()).await
}

pub async fn delete_tariff(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, tariff_id)): Path<(String, String, String)>,
) -> Result<Reply, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &tariff_id)?;
    delete_object(state.registry.tariffs(), &key).await
}
