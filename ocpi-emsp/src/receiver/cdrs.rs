//! CDRs module
//!
//! CDRs are final: a CPO posts each one once, later posts with the same id
//! are refused. The `Location` header of a created CDR points at its GET URL.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use ocpi_core::{Cdr, Resource};
use tracing::info;

use super::{get_object, object_key, parse_body, SharedState};
use crate::access::Caller;
use crate::envelope::{OcpiStatus, Reply};
use crate::error::ReceiverError;

pub async fn post_cdr(
    State(state): State<SharedState>,
    caller: Caller,
    body: Bytes,
) -> Result<Reply, ReceiverError> {
    let cdr: Cdr = parse_body(&body)?;
    caller.require_party(&cdr.country_code, &cdr.party_id)?;

    let stored = state.registry.cdrs().insert_new(cdr).await?;
    let key = stored.resource.key();
    info!("Receiver: Stored CDR {}", key);

    let location = state.config.url(&format!(
        "/cdrs/{}/{}/{}",
        key.party.country_code, key.party.party_id, key.id
    ));
    Ok(Reply::new(StatusCode::CREATED, OcpiStatus::Success)
        .with_version(&stored.etag, stored.last_updated())
        .with_header(header::LOCATION, location))
}

pub async fn get_cdr(
    State(state): State<SharedState>,
    caller: Caller,
    Path((country_code, party_id, cdr_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ReceiverError> {
    let key = object_key(&caller, &country_code, &party_id, &cdr_id)?;
    get_object(state.registry.cdrs(), &key, &headers).await
}
