//! OCPI registry: one versioned store per resource kind.
//!
//! Locations own their EVSEs and connectors. Nested entities are versioned
//! on their own `last_updated`: a location PUT that is newer than the stored
//! location does not overwrite an EVSE or connector that is newer than the
//! incoming copy of it. Accepting a nested update raises the parent's
//! `last_updated` to at least the child's.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::RegistryError;
use crate::patch::apply_merge_patch;
use crate::resource::{Cdr, Connector, Evse, Location, ObjectKey, Resource, ResourceKind, Session, Tariff, TokenStatus};
use crate::store::{check_ordering, Stored, Upserted, VersionedStore};
use crate::types::{Clock, SystemClock};

/// Shared registry of everything a CPO publishes to this EMSP
pub struct Registry {
    clock: Arc<dyn Clock>,
    locations: VersionedStore<Location>,
    tariffs: VersionedStore<Tariff>,
    sessions: VersionedStore<Session>,
    cdrs: VersionedStore<Cdr>,
    tokens: VersionedStore<TokenStatus>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            locations: VersionedStore::new(),
            tariffs: VersionedStore::new(),
            sessions: VersionedStore::new(),
            cdrs: VersionedStore::new(),
            tokens: VersionedStore::new(),
        }
    }

    /// Registry time, used for patch timestamps
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn locations(&self) -> &VersionedStore<Location> {
        &self.locations
    }

    pub fn tariffs(&self) -> &VersionedStore<Tariff> {
        &self.tariffs
    }

    pub fn sessions(&self) -> &VersionedStore<Session> {
        &self.sessions
    }

    pub fn cdrs(&self) -> &VersionedStore<Cdr> {
        &self.cdrs
    }

    pub fn tokens(&self) -> &VersionedStore<TokenStatus> {
        &self.tokens
    }

    // ========================================================================
    // Location tree
    // ========================================================================

    /// Full location update; nested EVSEs and connectors keep their own ordering
    pub async fn put_location(
        &self,
        incoming: Location,
        allow_downgrade: bool,
    ) -> Result<Upserted<Location>, RegistryError> {
        self.locations
            .upsert_merged(incoming, allow_downgrade, |existing, incoming| {
                merge_location(existing, incoming, allow_downgrade)
            })
            .await
    }

    pub async fn put_evse(
        &self,
        location: &ObjectKey,
        incoming: Evse,
        allow_downgrade: bool,
    ) -> Result<Upserted<Evse>, RegistryError> {
        incoming.validate().map_err(RegistryError::InvalidResource)?;

        let (_, upserted) = self
            .locations
            .modify(location, |current| {
                let mut updated = current.clone();
                let child_updated = incoming.last_updated;

                let (evse, was_created) = match updated.evses.iter_mut().find(|e| e.uid == incoming.uid) {
                    Some(existing) => {
                        check_ordering(&Stored::new(existing.clone())?, child_updated, allow_downgrade)?;
                        *existing = merge_evse(existing, incoming, allow_downgrade);
                        (existing.clone(), false)
                    }
                    None => {
                        updated.evses.push(incoming.clone());
                        (incoming, true)
                    }
                };

                updated.last_updated = updated.last_updated.max(child_updated);
                Ok((updated, Upserted { stored: Stored::new(evse)?, was_created }))
            })
            .await?;

        debug!(
            "Registry: {} EVSE {} at {}",
            if upserted.was_created { "Added" } else { "Replaced" },
            upserted.stored.resource.uid,
            location
        );
        Ok(upserted)
    }

    pub async fn put_connector(
        &self,
        location: &ObjectKey,
        evse_uid: &str,
        incoming: Connector,
        allow_downgrade: bool,
    ) -> Result<Upserted<Connector>, RegistryError> {
        incoming.validate().map_err(RegistryError::InvalidResource)?;

        let (_, upserted) = self
            .locations
            .modify(location, |current| {
                let mut updated = current.clone();
                let child_updated = incoming.last_updated;

                let evse = updated
                    .evses
                    .iter_mut()
                    .find(|e| e.uid == evse_uid)
                    .ok_or_else(|| RegistryError::not_found(ResourceKind::Evse, evse_uid))?;

                let (connector, was_created) = match evse.connectors.iter_mut().find(|c| c.id == incoming.id) {
                    Some(existing) => {
                        check_ordering(&Stored::new(existing.clone())?, child_updated, allow_downgrade)?;
                        *existing = incoming;
                        (existing.clone(), false)
                    }
                    None => {
                        evse.connectors.push(incoming.clone());
                        (incoming, true)
                    }
                };

                evse.last_updated = evse.last_updated.max(child_updated);
                updated.last_updated = updated.last_updated.max(child_updated);
                Ok((updated, Upserted { stored: Stored::new(connector)?, was_created }))
            })
            .await?;

        Ok(upserted)
    }

    pub async fn patch_location(&self, key: &ObjectKey, patch: &Value) -> Result<Stored<Location>, RegistryError> {
        self.locations.patch(key, patch, self.now()).await
    }

    pub async fn patch_evse(
        &self,
        location: &ObjectKey,
        evse_uid: &str,
        patch: &Value,
    ) -> Result<Stored<Evse>, RegistryError> {
        let now = self.now();
        let (_, evse) = self
            .locations
            .modify(location, |current| {
                let mut updated = current.clone();
                let evse = updated
                    .evses
                    .iter_mut()
                    .find(|e| e.uid == evse_uid)
                    .ok_or_else(|| RegistryError::not_found(ResourceKind::Evse, evse_uid))?;

                *evse = apply_merge_patch(evse, patch, now)?;
                let patched = evse.clone();

                updated.last_updated = updated.last_updated.max(patched.last_updated);
                Ok((updated, Stored::new(patched)?))
            })
            .await?;

        debug!("Registry: Patched EVSE {} at {}", evse_uid, location);
        Ok(evse)
    }

    pub async fn patch_connector(
        &self,
        location: &ObjectKey,
        evse_uid: &str,
        connector_id: &str,
        patch: &Value,
    ) -> Result<Stored<Connector>, RegistryError> {
        let now = self.now();
        let (_, connector) = self
            .locations
            .modify(location, |current| {
                let mut updated = current.clone();
                let evse = updated
                    .evses
                    .iter_mut()
                    .find(|e| e.uid == evse_uid)
                    .ok_or_else(|| RegistryError::not_found(ResourceKind::Evse, evse_uid))?;
                let connector = evse
                    .connectors
                    .iter_mut()
                    .find(|c| c.id == connector_id)
                    .ok_or_else(|| RegistryError::not_found(ResourceKind::Connector, connector_id))?;

                *connector = apply_merge_patch(connector, patch, now)?;
                let patched = connector.clone();

                evse.last_updated = evse.last_updated.max(patched.last_updated);
                updated.last_updated = updated.last_updated.max(patched.last_updated);
                Ok((updated, Stored::new(patched)?))
            })
            .await?;

        Ok(connector)
    }

    pub async fn get_evse(&self, location: &ObjectKey, evse_uid: &str) -> Result<Stored<Evse>, RegistryError> {
        let stored = self
            .locations
            .get(location)
            .await
            .ok_or_else(|| RegistryError::not_found(ResourceKind::Location, location))?;

        let evse = stored
            .resource
            .evse(evse_uid)
            .ok_or_else(|| RegistryError::not_found(ResourceKind::Evse, evse_uid))?;

        Stored::new(evse.clone())
    }

    pub async fn get_connector(
        &self,
        location: &ObjectKey,
        evse_uid: &str,
        connector_id: &str,
    ) -> Result<Stored<Connector>, RegistryError> {
        let evse = self.get_evse(location, evse_uid).await?;
        let connector = evse
            .resource
            .connector(connector_id)
            .ok_or_else(|| RegistryError::not_found(ResourceKind::Connector, connector_id))?;

        Stored::new(connector.clone())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep stored children that are newer than their incoming copies
fn merge_children<C, F>(existing: &[C], incoming: Vec<C>, allow_downgrade: bool, merge: F) -> Vec<C>
where
    C: Resource,
    F: Fn(&C, C) -> C,
{
    incoming
        .into_iter()
        .map(|child| match existing.iter().find(|e| e.key() == child.key()) {
            Some(stored) if !allow_downgrade && child.last_updated() <= stored.last_updated() => {
                debug!(
                    "Registry: Keeping stored {} {} ({} >= {})",
                    C::KIND,
                    stored.key(),
                    stored.last_updated(),
                    child.last_updated()
                );
                stored.clone()
            }
            Some(stored) => merge(stored, child),
            None => child,
        })
        .collect()
}

fn merge_location(existing: &Location, mut incoming: Location, allow_downgrade: bool) -> Location {
    let evses = std::mem::take(&mut incoming.evses);
    incoming.evses = merge_children(&existing.evses, evses, allow_downgrade, |stored, evse| {
        merge_evse(stored, evse, allow_downgrade)
    });
    incoming
}

fn merge_evse(existing: &Evse, mut incoming: Evse, allow_downgrade: bool) -> Evse {
    let connectors = std::mem::take(&mut incoming.connectors);
    incoming.connectors = merge_children(&existing.connectors, connectors, allow_downgrade, |_, c| c);
    incoming
}
