//! Versioned OCPI resources
//!
//! Only identity and `last_updated` are typed; the remaining OCPI fields of
//! each object travel in `extra` untouched.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::authorization::{AllowedType, LocationReference};
use crate::types::PartyKey;

/// Kind of versioned resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Location,
    Evse,
    Connector,
    Tariff,
    Session,
    Cdr,
    Token,
}

impl ResourceKind {
    /// Location, EVSE and connector share the "unknown location" status
    pub fn is_location_family(&self) -> bool {
        matches!(
            self,
            ResourceKind::Location | ResourceKind::Evse | ResourceKind::Connector
        )
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Location => "location",
            ResourceKind::Evse => "EVSE",
            ResourceKind::Connector => "connector",
            ResourceKind::Tariff => "tariff",
            ResourceKind::Session => "session",
            ResourceKind::Cdr => "CDR",
            ResourceKind::Token => "token",
        };
        f.write_str(s)
    }
}

/// A resource versioned by its `last_updated` timestamp
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static;

    const KIND: ResourceKind;

    fn key(&self) -> Self::Key;

    fn last_updated(&self) -> DateTime<Utc>;

    fn set_last_updated(&mut self, at: DateTime<Utc>);

    /// Structural checks beyond what deserialization enforces
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Identity of a party-owned object: country code, party id, object id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub party: PartyKey,
    pub id: String,
}

impl ObjectKey {
    pub fn new(party: PartyKey, id: impl Into<String>) -> Self {
        Self {
            party,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.party.country_code, self.party.party_id, self.id)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("'{}' must not be empty", field))
    } else {
        Ok(())
    }
}

fn validate_owned(country_code: &str, party_id: &str, id_field: &str, id: &str) -> Result<(), String> {
    require_non_empty("country_code", country_code)?;
    require_non_empty("party_id", party_id)?;
    require_non_empty(id_field, id)
}

// ============================================================================
// Locations
// ============================================================================

/// Connector of an EVSE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub last_updated: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// EVSE of a location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evse {
    pub uid: String,
    #[serde(default)]
    pub connectors: Vec<Connector>,
    pub last_updated: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Evse {
    pub fn connector(&self, connector_id: &str) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.id == connector_id)
    }
}

/// Charging location published by a CPO
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub country_code: String,
    pub party_id: String,
    pub id: String,
    #[serde(default)]
    pub evses: Vec<Evse>,
    pub last_updated: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Location {
    pub fn evse(&self, uid: &str) -> Option<&Evse> {
        self.evses.iter().find(|e| e.uid == uid)
    }
}

impl Resource for Location {
    type Key = ObjectKey;
    const KIND: ResourceKind = ResourceKind::Location;

    fn key(&self) -> ObjectKey {
        ObjectKey::new(PartyKey::new(&self.country_code, &self.party_id), &self.id)
    }

    fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    fn set_last_updated(&mut self, at: DateTime<Utc>) {
        self.last_updated = at;
    }

    fn validate(&self) -> Result<(), String> {
        validate_owned(&self.country_code, &self.party_id, "id", &self.id)?;
        for (i, evse) in self.evses.iter().enumerate() {
            evse.validate()?;
            if self.evses[..i].iter().any(|e| e.uid == evse.uid) {
                return Err(format!("duplicate EVSE uid '{}'", evse.uid));
            }
        }
        Ok(())
    }
}

impl Resource for Evse {
    type Key = String;
    const KIND: ResourceKind = ResourceKind::Evse;

    fn key(&self) -> String {
        self.uid.clone()
    }

    fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    fn set_last_updated(&mut self, at: DateTime<Utc>) {
        self.last_updated = at;
    }

    fn validate(&self) -> Result<(), String> {
        require_non_empty("uid", &self.uid)?;
        for (i, connector) in self.connectors.iter().enumerate() {
            connector.validate()?;
            if self.connectors[..i].iter().any(|c| c.id == connector.id) {
                return Err(format!("duplicate connector id '{}'", connector.id));
            }
        }
        Ok(())
    }
}

impl Resource for Connector {
    type Key = String;
    const KIND: ResourceKind = ResourceKind::Connector;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    fn set_last_updated(&mut self, at: DateTime<Utc>) {
        self.last_updated = at;
    }

    fn validate(&self) -> Result<(), String> {
        require_non_empty("id", &self.id)
    }
}

// ============================================================================
// Tariffs, sessions, CDRs
// ============================================================================

macro_rules! party_object {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            pub country_code: String,
            pub party_id: String,
            pub id: String,
            pub last_updated: DateTime<Utc>,
            #[serde(flatten)]
            pub extra: Map<String, Value>,
        }

        impl Resource for $name {
            type Key = ObjectKey;
            const KIND: ResourceKind = $kind;

            fn key(&self) -> ObjectKey {
                ObjectKey::new(PartyKey::new(&self.country_code, &self.party_id), &self.id)
            }

            fn last_updated(&self) -> DateTime<Utc> {
                self.last_updated
            }

            fn set_last_updated(&mut self, at: DateTime<Utc>) {
                self.last_updated = at;
            }

            fn validate(&self) -> Result<(), String> {
                validate_owned(&self.country_code, &self.party_id, "id", &self.id)
            }
        }
    };
}

party_object!(
    /// Tariff published by a CPO
    Tariff,
    ResourceKind::Tariff
);

party_object!(
    /// Charging session reported by a CPO
    Session,
    ResourceKind::Session
);

party_object!(
    /// Charge detail record of a finished session
    Cdr,
    ResourceKind::Cdr
);

// ============================================================================
// Tokens
// ============================================================================

/// Token type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenType {
    AdHocUser,
    AppUser,
    Other,
    #[default]
    Rfid,
}

/// Charging token issued by this EMSP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub country_code: String,
    pub party_id: String,
    pub uid: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub last_updated: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Token together with its locally computed authorization state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStatus {
    pub token: Token,
    pub allowed: AllowedType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationReference>,
}

impl Resource for TokenStatus {
    type Key = ObjectKey;
    const KIND: ResourceKind = ResourceKind::Token;

    fn key(&self) -> ObjectKey {
        ObjectKey::new(
            PartyKey::new(&self.token.country_code, &self.token.party_id),
            &self.token.uid,
        )
    }

    fn last_updated(&self) -> DateTime<Utc> {
        self.token.last_updated
    }

    fn set_last_updated(&mut self, at: DateTime<Utc>) {
        self.token.last_updated = at;
    }

    fn validate(&self) -> Result<(), String> {
        validate_owned(&self.token.country_code, &self.token.party_id, "uid", &self.token.uid)
    }
}
