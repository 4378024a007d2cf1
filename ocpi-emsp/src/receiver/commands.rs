//! Commands module: `POST /commands/{command_type}/{command_id}`
//!
//! Result callbacks for commands this EMSP sent earlier. An unknown command
//! id is reported in the OCPI status with HTTP 200 so the CPO does not keep
//! retrying.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use ocpi_core::{CommandError, CommandResult, CommandType};
use tracing::debug;

use super::{parse_body, SharedState};
use crate::access::Caller;
use crate::envelope::{OcpiStatus, Reply};
use crate::error::ReceiverError;

pub async fn command_result(
    State(state): State<SharedState>,
    caller: Caller,
    Path((command_type, command_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Reply, ReceiverError> {
    let command_type: CommandType = command_type.parse().map_err(ReceiverError::InvalidRequest)?;
    let result: CommandResult = parse_body(&body)?;

    match state.commands.resolve(&command_id, command_type, result) {
        Ok(record) => {
            debug!(
                "Receiver: {} result for {} from {} (delivery {})",
                command_type, command_id, caller.party, record.deliveries
            );
            Ok(Reply::new(StatusCode::ACCEPTED, OcpiStatus::Success))
        }
        Err(CommandError::UnknownCommand(_)) => {
            debug!("Receiver: {} sent a result for unknown command {}", caller.party, command_id);
            Ok(Reply::rejected(OcpiStatus::ClientError, "Unknown command"))
        }
        Err(other) => Err(ReceiverError::InvalidRequest(other.to_string())),
    }
}
