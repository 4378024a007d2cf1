//! Real-time token authorization
//!
//! A CPO asks whether a token may charge right now, optionally scoped to a
//! location and a set of its EVSEs. The decision comes from one of two
//! strategies chosen at construction:
//! - [`LocalAuthorizer`]: stored token status, location scope narrowed to
//!   the EVSEs that exist
//! - [`RemoteAuthorizer`]: an external [`RealtimeAuthorization`] backend,
//!   falling back to another strategy when the backend fails

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::Registry;
use crate::resource::{ObjectKey, TokenType};
use crate::types::{DisplayText, PartyKey};

/// Authorization outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllowedType {
    Allowed,
    Blocked,
    Expired,
    NoCredit,
    NotAllowed,
}

/// Location, optionally narrowed to some of its EVSEs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationReference {
    pub location_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evse_uids: Vec<String>,
}

/// Authorization decision returned to the CPO
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationInfo {
    pub allowed: AllowedType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<DisplayText>,
}

impl AuthorizationInfo {
    pub fn new(allowed: AllowedType) -> Self {
        Self {
            allowed,
            authorization_reference: None,
            location: None,
            info: None,
        }
    }

    /// Denial reported for a token or location that could not be resolved
    pub fn not_allowed() -> Self {
        Self::new(AllowedType::NotAllowed).with_default_message()
    }

    fn with_default_message(mut self) -> Self {
        if self.info.is_none() {
            self.info = Some(default_message(self.allowed));
        }
        self
    }
}

/// Fixed display text per outcome
pub fn default_message(allowed: AllowedType) -> DisplayText {
    let text = match allowed {
        AllowedType::Allowed => "Charging allowed!",
        AllowedType::Blocked => "Token is blocked!",
        AllowedType::Expired => "Token has expired!",
        AllowedType::NoCredit => "No credit left!",
        AllowedType::NotAllowed => "Charging is not allowed!",
    };
    DisplayText::en(text)
}

/// One authorize call
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationRequest {
    /// Party asking, owner of the referenced location
    pub cpo: PartyKey,
    pub token_uid: String,
    pub token_type: TokenType,
    pub location: Option<LocationReference>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthorizeError {
    #[error("Unknown token: {0}")]
    UnknownToken(String),

    #[error("Unknown location: {0}")]
    UnknownLocation(String),

    #[error("None of the EVSEs exist at location {0}")]
    UnknownEvse(String),

    #[error("Authorization backend failed: {0}")]
    Delegate(String),
}

/// External real-time authorization backend
#[async_trait]
pub trait RealtimeAuthorization: Send + Sync {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<AuthorizationInfo, AuthorizeError>;
}

/// Decision strategy. `Ok(None)` means no decision could be made.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<Option<AuthorizationInfo>, AuthorizeError>;
}

// ============================================================================
// Strategies
// ============================================================================

/// Decides from the registry's stored token status
pub struct LocalAuthorizer {
    registry: Arc<Registry>,
    /// Party the tokens were issued by (this EMSP)
    token_owner: PartyKey,
}

impl LocalAuthorizer {
    pub fn new(registry: Arc<Registry>, token_owner: PartyKey) -> Self {
        Self { registry, token_owner }
    }

    async fn narrow(
        &self,
        cpo: &PartyKey,
        reference: &LocationReference,
    ) -> Result<LocationReference, AuthorizeError> {
        let key = ObjectKey::new(cpo.clone(), &reference.location_id);
        let location = self
            .registry
            .locations()
            .get(&key)
            .await
            .ok_or_else(|| AuthorizeError::UnknownLocation(key.to_string()))?
            .resource;

        if reference.evse_uids.is_empty() {
            return Ok(reference.clone());
        }

        let evse_uids: Vec<String> = reference
            .evse_uids
            .iter()
            .filter(|uid| location.evse(uid).is_some())
            .cloned()
            .collect();

        if evse_uids.is_empty() {
            return Err(AuthorizeError::UnknownEvse(key.to_string()));
        }
        if evse_uids.len() < reference.evse_uids.len() {
            debug!(
                "Authorization: Narrowed EVSEs at {} from {:?} to {:?}",
                key, reference.evse_uids, evse_uids
            );
        }

        Ok(LocationReference {
            location_id: reference.location_id.clone(),
            evse_uids,
        })
    }
}

#[async_trait]
impl Authorizer for LocalAuthorizer {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<Option<AuthorizationInfo>, AuthorizeError> {
        let key = ObjectKey::new(self.token_owner.clone(), &request.token_uid);
        let status = self
            .registry
            .tokens()
            .get(&key)
            .await
            .map(|stored| stored.resource)
            .filter(|status| status.token.token_type == request.token_type)
            .ok_or_else(|| AuthorizeError::UnknownToken(request.token_uid.clone()))?;

        let location = match &request.location {
            Some(reference) => Some(self.narrow(&request.cpo, reference).await?),
            None => status.location,
        };

        Ok(Some(AuthorizationInfo {
            allowed: status.allowed,
            authorization_reference: None,
            location,
            info: None,
        }))
    }
}

/// Decides through an external backend
pub struct RemoteAuthorizer {
    delegate: Arc<dyn RealtimeAuthorization>,
    fallback: Option<Arc<dyn Authorizer>>,
}

impl RemoteAuthorizer {
    pub fn new(delegate: Arc<dyn RealtimeAuthorization>) -> Self {
        Self {
            delegate,
            fallback: None,
        }
    }

    /// Strategy consulted when the backend fails
    pub fn with_fallback(mut self, fallback: Arc<dyn Authorizer>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[async_trait]
impl Authorizer for RemoteAuthorizer {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<Option<AuthorizationInfo>, AuthorizeError> {
        match self.delegate.authorize(request).await {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                warn!(
                    "Authorization: Backend failed for token {} ({}), {}",
                    request.token_uid,
                    e,
                    if self.fallback.is_some() { "using fallback" } else { "no fallback" }
                );
                match &self.fallback {
                    Some(fallback) => fallback.authorize(request).await,
                    None => Ok(None),
                }
            }
        }
    }
}

// ============================================================================
// Service
// ============================================================================

/// Applies a strategy, the BLOCKED default and the display messages
pub struct AuthorizationService {
    strategy: Arc<dyn Authorizer>,
}

impl AuthorizationService {
    pub fn new(strategy: Arc<dyn Authorizer>) -> Self {
        Self { strategy }
    }

    pub async fn authorize(&self, request: &AuthorizationRequest) -> Result<AuthorizationInfo, AuthorizeError> {
        let mut info = match self.strategy.authorize(request).await? {
            Some(info) => info,
            None => {
                debug!("Authorization: No decision for token {}, blocking", request.token_uid);
                AuthorizationInfo::new(AllowedType::Blocked)
            }
        };

        if info.allowed == AllowedType::Allowed && info.authorization_reference.is_none() {
            info.authorization_reference = Some(Uuid::new_v4().to_string());
        }

        Ok(info.with_default_message())
    }
}
