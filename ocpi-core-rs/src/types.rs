//! Core types shared across the OCPI registry

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// ISO 3166-1 alpha-2 country code, upper case
pub type CountryCode = String;

/// Three-character party id, upper case
pub type PartyId = String;

/// Country code + party id of an OCPI party
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartyKey {
    pub country_code: CountryCode,
    pub party_id: PartyId,
}

impl PartyKey {
    /// Country codes and party ids compare case-insensitively in OCPI,
    /// so both are normalized to upper case.
    pub fn new(country_code: impl AsRef<str>, party_id: impl AsRef<str>) -> Self {
        Self {
            country_code: country_code.as_ref().to_ascii_uppercase(),
            party_id: party_id.as_ref().to_ascii_uppercase(),
        }
    }
}

impl std::fmt::Display for PartyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.country_code, self.party_id)
    }
}

impl std::str::FromStr for PartyKey {
    type Err = String;

    /// Parses `DE/GEF` or `DE-GEF`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cc, pid) = s
            .split_once(['/', '-'])
            .ok_or_else(|| format!("Invalid party '{}', expected CC/PID", s))?;

        if cc.len() != 2 || pid.len() != 3 {
            return Err(format!("Invalid party '{}', expected CC/PID", s));
        }

        Ok(PartyKey::new(cc, pid))
    }
}

/// OCPI role of a party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Cpo,
    Emsp,
    Hub,
    Nap,
    Nsp,
    Other,
    Scsp,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Cpo => "CPO",
            Role::Emsp => "EMSP",
            Role::Hub => "HUB",
            Role::Nap => "NAP",
            Role::Nsp => "NSP",
            Role::Other => "OTHER",
            Role::Scsp => "SCSP",
        };
        f.write_str(s)
    }
}

/// Whether a registered party may use the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessStatus {
    Allowed,
    Blocked,
}

/// Content hash of a stored resource version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// Hash the JSON serialization of `value`.
    ///
    /// Struct fields serialize in declaration order, so equal content
    /// always yields an equal tag.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(value)?;
        Ok(ETag(hex::encode(Sha256::digest(&bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Language-tagged display text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayText {
    pub language: String,
    pub text: String,
}

impl DisplayText {
    pub fn new(language: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            text: text.into(),
        }
    }

    pub fn en(text: impl Into<String>) -> Self {
        Self::new("en", text)
    }
}

/// Time source for the registry
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_party_key_parse() {
        let party: PartyKey = "de/gef".parse().unwrap();
        assert_eq!(party, PartyKey::new("DE", "GEF"));
        assert_eq!(party.to_string(), "DE-GEF");

        assert!("DEGEF".parse::<PartyKey>().is_err());
        assert!("DE/GEFF".parse::<PartyKey>().is_err());
    }

    #[test]
    fn test_etag_tracks_content() {
        let a = serde_json::json!({"id": "loc-1", "name": "Depot"});
        let b = serde_json::json!({"id": "loc-1", "name": "Depot"});
        let c = serde_json::json!({"id": "loc-1", "name": "Depot 2"});

        assert_eq!(ETag::of(&a).unwrap(), ETag::of(&b).unwrap());
        assert_ne!(ETag::of(&a).unwrap(), ETag::of(&c).unwrap());
        assert_eq!(ETag::of(&a).unwrap().as_str().len(), 64);
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }
}
