//! Counterparty access control
//!
//! Requests carry `Authorization: Token <token>`. The token resolves to the
//! calling party's identity, role and status; only allowed CPOs may use the
//! receiver, and only for objects under their own country code and party id.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use ocpi_core::{AccessStatus, PartyKey, Role};
use tracing::{debug, warn};

use crate::config::PartyAccess;
use crate::error::ReceiverError;
use crate::receiver::SharedState;

/// Token lookup for incoming requests
#[derive(Debug, Default)]
pub struct AccessControl {
    by_token: HashMap<String, PartyAccess>,
}

impl AccessControl {
    pub fn new(parties: impl IntoIterator<Item = PartyAccess>) -> Self {
        let mut by_token = HashMap::new();
        for access in parties {
            if let Some(previous) = by_token.insert(access.token.clone(), access) {
                warn!("Access: Token of {} registered twice, keeping the later entry", previous.party);
            }
        }
        Self { by_token }
    }

    /// Resolve the caller of a request and check it may use the receiver
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Caller, ReceiverError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Token "))
            .map(str::trim)
            .ok_or(ReceiverError::Unauthorized)?;

        let access = self.by_token.get(token).ok_or_else(|| {
            debug!("Access: Unknown token presented");
            ReceiverError::Unauthorized
        })?;

        if access.role != Role::Cpo {
            return Err(ReceiverError::Forbidden(format!(
                "{} has role {}, only CPOs may use this endpoint",
                access.party, access.role
            )));
        }
        if access.status == AccessStatus::Blocked {
            return Err(ReceiverError::Forbidden(format!("{} is blocked", access.party)));
        }

        Ok(Caller {
            party: access.party.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

/// Authenticated CPO calling the receiver
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    pub party: PartyKey,
}

impl Caller {
    /// Objects addressed in a request must belong to the caller
    pub fn require_party(&self, country_code: &str, party_id: &str) -> Result<PartyKey, ReceiverError> {
        let party = PartyKey::new(country_code, party_id);
        if party != self.party {
            return Err(ReceiverError::Forbidden(format!(
                "{} may not modify objects of {}",
                self.party, party
            )));
        }
        Ok(party)
    }
}

#[async_trait]
impl FromRequestParts<SharedState> for Caller {
    type Rejection = ReceiverError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        state.access.authenticate(&parts.headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn control() -> AccessControl {
        AccessControl::new([
            PartyAccess::cpo("cpo-token", PartyKey::new("DE", "GEF")),
            PartyAccess::cpo("blocked-token", PartyKey::new("DE", "BLK")).blocked(),
            PartyAccess::cpo("hub-token", PartyKey::new("NL", "HUB")).with_role(Role::Hub),
        ])
    }

    fn headers(authorization: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(authorization).unwrap());
        headers
    }

    #[test]
    fn test_authenticate() {
        let control = control();

        let caller = control.authenticate(&headers("Token cpo-token")).unwrap();
        assert_eq!(caller.party, PartyKey::new("DE", "GEF"));

        assert!(matches!(
            control.authenticate(&HeaderMap::new()),
            Err(ReceiverError::Unauthorized)
        ));
        assert!(matches!(
            control.authenticate(&headers("Bearer cpo-token")),
            Err(ReceiverError::Unauthorized)
        ));
        assert!(matches!(
            control.authenticate(&headers("Token nope")),
            Err(ReceiverError::Unauthorized)
        ));
        assert!(matches!(
            control.authenticate(&headers("Token blocked-token")),
            Err(ReceiverError::Forbidden(_))
        ));
        assert!(matches!(
            control.authenticate(&headers("Token hub-token")),
            Err(ReceiverError::Forbidden(_))
        ));
    }

    #[test]
    fn test_require_party() {
        let caller = Caller {
            party: PartyKey::new("DE", "GEF"),
        };
        assert!(caller.require_party("de", "gef").is_ok());
        assert!(matches!(
            caller.require_party("DE", "XYZ"),
            Err(ReceiverError::Forbidden(_))
        ));
    }
}
