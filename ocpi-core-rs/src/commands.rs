//! Command callback correlation
//!
//! Commands sent to a CPO (reserve, cancel reservation, start/stop session,
//! unlock connector) share one id keyspace. The CPO answers later on a
//! per-type callback endpoint; the result is matched here by command id.
//!
//! Repeated delivery for the same id overwrites the stored result (last write
//! wins) and is logged. Unresolved records expire after a retention period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{Clock, DisplayText, SystemClock};

/// Opaque command identifier
pub type CommandId = String;

/// Default retention of a dispatched command
pub const DEFAULT_COMMAND_TTL: Duration = Duration::from_secs(15 * 60);

/// Command sent to a CPO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    ReserveNow,
    CancelReservation,
    StartSession,
    StopSession,
    UnlockConnector,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::ReserveNow => "RESERVE_NOW",
            CommandType::CancelReservation => "CANCEL_RESERVATION",
            CommandType::StartSession => "START_SESSION",
            CommandType::StopSession => "STOP_SESSION",
            CommandType::UnlockConnector => "UNLOCK_CONNECTOR",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RESERVE_NOW" => Ok(CommandType::ReserveNow),
            "CANCEL_RESERVATION" => Ok(CommandType::CancelReservation),
            "START_SESSION" => Ok(CommandType::StartSession),
            "STOP_SESSION" => Ok(CommandType::StopSession),
            "UNLOCK_CONNECTOR" => Ok(CommandType::UnlockConnector),
            other => Err(format!("unknown command type '{}'", other)),
        }
    }
}

/// Outcome reported by the CPO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandResultType {
    Accepted,
    CanceledReservation,
    EvseOccupied,
    EvseInoperative,
    Failed,
    NotSupported,
    Rejected,
    Timeout,
    UnknownReservation,
}

/// Result payload of a command callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub result: CommandResultType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message: Vec<DisplayText>,
}

impl CommandResult {
    pub fn new(result: CommandResultType) -> Self {
        Self {
            result,
            message: Vec::new(),
        }
    }
}

/// A dispatched command and its result, once known
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    pub id: CommandId,
    pub command_type: CommandType,
    pub dispatched_at: DateTime<Utc>,
    pub result: Option<CommandResult>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Number of result callbacks received
    pub deliveries: u32,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(CommandId),

    #[error("Command already dispatched: {0}")]
    DuplicateCommand(CommandId),

    #[error("No result for command {0} within the wait period")]
    Timeout(CommandId),
}

struct Entry {
    record: CommandRecord,
    result_tx: watch::Sender<Option<CommandResult>>,
}

/// Correlation store for dispatched commands
pub struct CommandStore {
    entries: RwLock<HashMap<CommandId, Arc<Mutex<Entry>>>>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl CommandStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)),
        }
    }

    /// Record a new dispatch under a fresh id
    pub fn record_dispatch(&self, command_type: CommandType) -> CommandId {
        loop {
            let id = Uuid::new_v4().to_string();
            if self.record_dispatch_with_id(id.clone(), command_type).is_ok() {
                return id;
            }
        }
    }

    /// Record a dispatch under a caller-chosen id
    pub fn record_dispatch_with_id(&self, id: CommandId, command_type: CommandType) -> Result<(), CommandError> {
        let now = self.clock.now();
        let mut entries = self.entries.write();

        if let Some(existing) = entries.get(&id) {
            if !self.is_expired(&existing.lock().record, now) {
                return Err(CommandError::DuplicateCommand(id));
            }
        }

        let (result_tx, _) = watch::channel(None);
        let record = CommandRecord {
            id: id.clone(),
            command_type,
            dispatched_at: now,
            result: None,
            resolved_at: None,
            deliveries: 0,
        };
        entries.insert(id.clone(), Arc::new(Mutex::new(Entry { record, result_tx })));

        debug!("Commands: Dispatched {} {}", command_type, id);
        Ok(())
    }

    /// Store the CPO's result for `id`
    pub fn resolve(
        &self,
        id: &str,
        command_type: CommandType,
        result: CommandResult,
    ) -> Result<CommandRecord, CommandError> {
        let now = self.clock.now();
        let entry = self.live_entry(id, now)?;
        let mut entry = entry.lock();

        if entry.record.command_type != command_type {
            warn!(
                "Commands: Result for {} arrived as {} but was dispatched as {}",
                id, command_type, entry.record.command_type
            );
            return Err(CommandError::UnknownCommand(id.to_string()));
        }

        entry.record.deliveries += 1;
        if let Some(previous) = &entry.record.result {
            warn!(
                "Commands: Result for {} delivered {} times, {:?} replaced by {:?}",
                id, entry.record.deliveries, previous.result, result.result
            );
        } else {
            info!("Commands: {} {} resolved as {:?}", command_type, id, result.result);
        }

        entry.record.result = Some(result.clone());
        entry.record.resolved_at = Some(now);
        entry.result_tx.send_replace(Some(result));

        Ok(entry.record.clone())
    }

    pub fn get(&self, id: &str) -> Option<CommandRecord> {
        let now = self.clock.now();
        self.live_entry(id, now).ok().map(|e| e.lock().record.clone())
    }

    /// Watch the result slot of `id`
    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<Option<CommandResult>>> {
        let now = self.clock.now();
        self.live_entry(id, now).ok().map(|e| e.lock().result_tx.subscribe())
    }

    /// Wait until a result for `id` is known
    pub async fn wait_for_result(&self, id: &str, timeout: Duration) -> Result<CommandResult, CommandError> {
        let mut rx = self
            .subscribe(id)
            .ok_or_else(|| CommandError::UnknownCommand(id.to_string()))?;

        let outcome = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(result)) => result.clone(),
            // Record dropped while waiting
            Ok(Err(_)) => None,
            Err(_) => return Err(CommandError::Timeout(id.to_string())),
        };
        outcome.ok_or_else(|| CommandError::UnknownCommand(id.to_string()))
    }

    /// Drop a record, e.g. when the CPO refused the command outright
    pub fn forget(&self, id: &str) -> Option<CommandRecord> {
        let entry = self.entries.write().remove(id)?;
        let record = entry.lock().record.clone();
        debug!("Commands: Forgot {}", id);
        Some(record)
    }

    /// Remove every record past its retention period
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(&entry.lock().record, now));

        let removed = before - entries.len();
        if removed > 0 {
            info!("Commands: Expired {} command records", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, record: &CommandRecord, now: DateTime<Utc>) -> bool {
        record
            .dispatched_at
            .checked_add_signed(self.ttl)
            .map_or(false, |expires| now >= expires)
    }

    fn live_entry(&self, id: &str, now: DateTime<Utc>) -> Result<Arc<Mutex<Entry>>, CommandError> {
        let entry = self
            .entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CommandError::UnknownCommand(id.to_string()))?;

        if self.is_expired(&entry.lock().record, now) {
            debug!("Commands: {} has expired", id);
            return Err(CommandError::UnknownCommand(id.to_string()));
        }
        Ok(entry)
    }
}

impl Default for CommandStore {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TTL)
    }
}
