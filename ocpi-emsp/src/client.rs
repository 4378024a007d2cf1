//! Outbound commands to CPOs
//!
//! [`CommandDispatcher`] records each command in the [`CommandStore`] before
//! posting it, so a result callback that races the CPO's synchronous answer
//! still finds its record. Commands the CPO refuses are forgotten again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ocpi_core::{ClientRegistry, CommandId, CommandStore, CommandType, DisplayText, PartyKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CpoEndpoint, EmspConfig};
use crate::envelope::Envelope;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No command endpoint configured for {0}")]
    UnknownParty(PartyKey),

    #[error("Command body must be a JSON object")]
    InvalidCommand,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CPO answered status {status_code}: {}", .message.as_deref().unwrap_or("no message"))]
    Status {
        status_code: u16,
        message: Option<String>,
    },
}

/// Synchronous answer of a CPO to a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandResponseType {
    NotSupported,
    Rejected,
    Accepted,
    UnknownSession,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub result: CommandResponseType,
    /// Seconds the CPO expects to need before posting the result
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message: Vec<DisplayText>,
}

/// HTTP client for one CPO's commands module
pub struct CpoClient {
    http: reqwest::Client,
    endpoint: CpoEndpoint,
}

impl CpoClient {
    pub fn new(endpoint: CpoEndpoint, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, endpoint })
    }

    pub fn party(&self) -> &PartyKey {
        &self.endpoint.party
    }

    /// POST `command` to `{commands_url}/{TYPE}`
    pub async fn post_command(&self, command_type: CommandType, command: &Value) -> Result<CommandResponse, ClientError> {
        let url = format!("{}/{}", self.endpoint.commands_url, command_type);
        debug!("Client: POST {}", url);

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.endpoint.token))
            .json(command)
            .send()
            .await?;

        let http_status = response.status();
        let envelope: Envelope<CommandResponse> = response.json().await?;

        match envelope.data {
            Some(data) if http_status.is_success() && envelope.status_code == 1000 => Ok(data),
            _ => Err(ClientError::Status {
                status_code: envelope.status_code,
                message: envelope.status_message,
            }),
        }
    }
}

/// A command that was sent to a CPO
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub id: CommandId,
    pub response: CommandResponse,
}

/// Sends commands to CPOs and tracks them for their result callbacks
pub struct CommandDispatcher {
    commands: Arc<CommandStore>,
    clients: ClientRegistry<PartyKey, CpoClient>,
    endpoints: HashMap<PartyKey, CpoEndpoint>,
    response_base: String,
    timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(config: &EmspConfig, commands: Arc<CommandStore>) -> Self {
        let endpoints = config
            .cpo_endpoints
            .iter()
            .map(|e| (e.party.clone(), e.clone()))
            .collect();

        Self {
            commands,
            clients: ClientRegistry::new(),
            endpoints,
            response_base: config.url("/commands"),
            timeout: config.request_timeout,
        }
    }

    pub fn commands(&self) -> &Arc<CommandStore> {
        &self.commands
    }

    /// URL the CPO posts the result of command `id` to
    pub fn response_url(&self, command_type: CommandType, id: &str) -> String {
        format!("{}/{}/{}", self.response_base, command_type, id)
    }

    async fn client(&self, cpo: &PartyKey) -> Result<Arc<CpoClient>, ClientError> {
        self.clients
            .get_or_create(cpo, || async {
                let endpoint = self
                    .endpoints
                    .get(cpo)
                    .cloned()
                    .ok_or_else(|| ClientError::UnknownParty(cpo.clone()))?;
                CpoClient::new(endpoint, self.timeout)
            })
            .await
    }

    /// Send `command` to `cpo`, with `response_url` filled in
    pub async fn dispatch(
        &self,
        cpo: &PartyKey,
        command_type: CommandType,
        mut command: Value,
    ) -> Result<Dispatched, ClientError> {
        let client = self.client(cpo).await?;
        let id = self.commands.record_dispatch(command_type);

        match command.as_object_mut() {
            Some(fields) => {
                fields.insert(
                    "response_url".to_string(),
                    Value::String(self.response_url(command_type, &id)),
                );
            }
            None => {
                self.commands.forget(&id);
                return Err(ClientError::InvalidCommand);
            }
        }

        match client.post_command(command_type, &command).await {
            Ok(response) => {
                if response.result == CommandResponseType::Accepted {
                    info!("Client: {} {} accepted by {}", command_type, id, cpo);
                } else {
                    warn!("Client: {} {} answered {:?} by {}", command_type, id, response.result, cpo);
                    self.commands.forget(&id);
                }
                Ok(Dispatched { id, response })
            }
            Err(e) => {
                warn!("Client: {} {} to {} failed: {}", command_type, id, cpo, e);
                self.commands.forget(&id);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocpi_core::commands::DEFAULT_COMMAND_TTL;
    use serde_json::json;

    fn dispatcher() -> CommandDispatcher {
        let config = EmspConfig::default()
            .with_public_url("https://emsp.example.com")
            .with_cpo_endpoint(CpoEndpoint {
                party: PartyKey::new("DE", "GEF"),
                token: "tok".to_string(),
                commands_url: "http://127.0.0.1:9/commands".to_string(),
            });
        CommandDispatcher::new(&config, Arc::new(CommandStore::new(DEFAULT_COMMAND_TTL)))
    }

    #[test]
    fn test_response_url() {
        assert_eq!(
            dispatcher().response_url(CommandType::StartSession, "abc"),
            "https://emsp.example.com/ocpi/emsp/2.2/commands/START_SESSION/abc"
        );
    }

    #[tokio::test]
    async fn test_unknown_party_records_nothing() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .dispatch(&PartyKey::new("FR", "XYZ"), CommandType::StopSession, json!({"session_id": "s-1"}))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::UnknownParty(_)));
        assert!(dispatcher.commands().is_empty());
    }

    #[tokio::test]
    async fn test_non_object_command_is_forgotten() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .dispatch(&PartyKey::new("DE", "GEF"), CommandType::StopSession, json!(["s-1"]))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::InvalidCommand));
        assert!(dispatcher.commands().is_empty());
    }

    #[test]
    fn test_command_response_shape() {
        let response: CommandResponse = serde_json::from_value(json!({
            "result": "ACCEPTED",
            "timeout": 30
        }))
        .unwrap();
        assert_eq!(response.result, CommandResponseType::Accepted);
        assert!(response.message.is_empty());
    }
}
