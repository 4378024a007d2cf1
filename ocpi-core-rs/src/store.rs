//! Versioned resource store with per-key atomic commits.
//!
//! Implements:
//! - Conditional upsert (last-write-wins by `last_updated`, optional downgrade)
//! - Merge-patch of existing resources
//! - Filtered, paginated listing
//!
//! Each key owns a slot guarded by its own async mutex. The slot index is
//! only locked for lookups and insertions, so writers on different keys
//! never wait on each other. A mutation builds the new version on a copy
//! and swaps it in while holding the slot, so readers see either the old
//! or the new version.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::patch::apply_merge_patch;
use crate::resource::Resource;
use crate::types::ETag;

/// A committed resource version
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<R> {
    pub resource: R,
    pub etag: ETag,
}

impl<R: Resource> Stored<R> {
    pub fn new(resource: R) -> Result<Self, RegistryError> {
        let etag = ETag::of(&resource)?;
        Ok(Self { resource, etag })
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.resource.last_updated()
    }

    fn downgrade_rejected(&self) -> RegistryError {
        match serde_json::to_value(&self.resource) {
            Ok(existing) => RegistryError::DowngradeRejected {
                kind: R::KIND,
                last_updated: self.last_updated(),
                etag: self.etag.clone(),
                existing,
            },
            Err(e) => RegistryError::Serialization(e),
        }
    }
}

/// Outcome of an accepted upsert
#[derive(Debug, Clone)]
pub struct Upserted<R> {
    pub stored: Stored<R>,
    pub was_created: bool,
}

/// Listing filter on `last_updated` (`date_from` inclusive, `date_to` exclusive)
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ListFilter {
    fn matches(&self, at: DateTime<Utc>) -> bool {
        self.date_from.map_or(true, |from| at >= from) && self.date_to.map_or(true, |to| at < to)
    }
}

/// One page of a listing
#[derive(Debug, Clone)]
pub struct Page<R> {
    pub items: Vec<Stored<R>>,
    /// Number of items matching the date filter, before offset/limit
    pub total: usize,
    pub offset: usize,
}

/// Decide whether `incoming` may replace `existing`
pub fn check_ordering<R: Resource>(
    existing: &Stored<R>,
    incoming: DateTime<Utc>,
    allow_downgrade: bool,
) -> Result<(), RegistryError> {
    if incoming > existing.last_updated() || allow_downgrade {
        Ok(())
    } else {
        Err(existing.downgrade_rejected())
    }
}

type Slot<R> = Arc<Mutex<Option<Stored<R>>>>;

/// Store of one resource kind
pub struct VersionedStore<R: Resource> {
    slots: RwLock<HashMap<R::Key, Slot<R>>>,
}

impl<R: Resource> VersionedStore<R> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Lock the live slot for `key`, creating it if requested.
    ///
    /// A slot removed from the index while we waited for its lock is stale;
    /// the lookup is retried against the current index.
    async fn lock_slot(&self, key: &R::Key, create: bool) -> Option<OwnedMutexGuard<Option<Stored<R>>>> {
        loop {
            let slot = if create {
                self.slots.write().entry(key.clone()).or_default().clone()
            } else {
                self.slots.read().get(key)?.clone()
            };

            let guard = slot.clone().lock_owned().await;

            let current = self
                .slots
                .read()
                .get(key)
                .map_or(false, |live| Arc::ptr_eq(live, &slot));
            if current {
                return Some(guard);
            }

            debug!("Registry: {} slot {} replaced while waiting, retrying", R::KIND, key);
        }
    }

    /// Drop a slot created for a commit that failed, while still holding it.
    /// Waiters on the slot see it leave the index and retry.
    fn discard_vacant(&self, key: &R::Key, slot: &OwnedMutexGuard<Option<Stored<R>>>) {
        if slot.is_some() {
            return;
        }
        let mut slots = self.slots.write();
        if slots
            .get(key)
            .map_or(false, |live| Arc::ptr_eq(live, OwnedMutexGuard::mutex(slot)))
        {
            slots.remove(key);
        }
    }

    /// Current version of `key`
    pub async fn get(&self, key: &R::Key) -> Option<Stored<R>> {
        let slot = self.slots.read().get(key)?.clone();
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Upsert with last-write-wins ordering on `last_updated`
    pub async fn upsert(&self, incoming: R, allow_downgrade: bool) -> Result<Upserted<R>, RegistryError> {
        self.upsert_merged(incoming, allow_downgrade, |_, incoming| incoming)
            .await
    }

    /// Upsert where an accepted replacement is first combined with the
    /// stored version by `merge(existing, incoming)`
    pub async fn upsert_merged<F>(
        &self,
        incoming: R,
        allow_downgrade: bool,
        merge: F,
    ) -> Result<Upserted<R>, RegistryError>
    where
        F: FnOnce(&R, R) -> R,
    {
        incoming.validate().map_err(RegistryError::InvalidResource)?;

        let key = incoming.key();
        let mut slot = self
            .lock_slot(&key, true)
            .await
            .ok_or_else(|| RegistryError::not_found(R::KIND, &key))?;

        let (resource, was_created) = match slot.as_ref() {
            None => (incoming, true),
            Some(existing) => {
                check_ordering(existing, incoming.last_updated(), allow_downgrade)?;
                if incoming.last_updated() <= existing.last_updated() {
                    info!(
                        "Registry: Downgrade of {} {} accepted ({} -> {})",
                        R::KIND,
                        key,
                        existing.last_updated(),
                        incoming.last_updated()
                    );
                }
                (merge(&existing.resource, incoming), false)
            }
        };

        let stored = match Stored::new(resource) {
            Ok(stored) => stored,
            Err(e) => {
                self.discard_vacant(&key, &slot);
                return Err(e);
            }
        };
        *slot = Some(stored.clone());

        debug!(
            "Registry: {} {} {} (etag={})",
            if was_created { "Created" } else { "Replaced" },
            R::KIND,
            key,
            stored.etag
        );

        Ok(Upserted { stored, was_created })
    }

    /// Insert a resource that must not exist yet
    pub async fn insert_new(&self, resource: R) -> Result<Stored<R>, RegistryError> {
        resource.validate().map_err(RegistryError::InvalidResource)?;

        let key = resource.key();
        let mut slot = self
            .lock_slot(&key, true)
            .await
            .ok_or_else(|| RegistryError::not_found(R::KIND, &key))?;

        if slot.is_some() {
            return Err(RegistryError::AlreadyExists {
                kind: R::KIND,
                id: key.to_string(),
            });
        }

        let stored = match Stored::new(resource) {
            Ok(stored) => stored,
            Err(e) => {
                self.discard_vacant(&key, &slot);
                return Err(e);
            }
        };
        *slot = Some(stored.clone());
        debug!("Registry: Created {} {}", R::KIND, key);
        Ok(stored)
    }

    /// Replace an existing resource with `update(current)`.
    ///
    /// `update` runs while the slot is held; nothing is written when it fails.
    /// Never creates a resource.
    pub async fn modify<F, T>(&self, key: &R::Key, update: F) -> Result<(Stored<R>, T), RegistryError>
    where
        F: FnOnce(&R) -> Result<(R, T), RegistryError>,
    {
        let mut slot = self
            .lock_slot(key, false)
            .await
            .ok_or_else(|| RegistryError::not_found(R::KIND, key))?;

        let current = slot
            .as_ref()
            .ok_or_else(|| RegistryError::not_found(R::KIND, key))?;

        let (resource, extra) = update(&current.resource)?;
        let stored = Stored::new(resource)?;
        *slot = Some(stored.clone());

        Ok((stored, extra))
    }

    /// Merge-patch an existing resource
    pub async fn patch(
        &self,
        key: &R::Key,
        patch: &Value,
        now: DateTime<Utc>,
    ) -> Result<Stored<R>, RegistryError> {
        let (stored, ()) = self
            .modify(key, |current| Ok((apply_merge_patch(current, patch, now)?, ())))
            .await?;

        debug!("Registry: Patched {} {} (etag={})", R::KIND, key, stored.etag);
        Ok(stored)
    }

    /// Remove `key`, returning the last version
    pub async fn remove(&self, key: &R::Key) -> Option<Stored<R>> {
        let slot = self.slots.write().remove(key)?;
        let removed = slot.lock().await.take();

        if removed.is_some() {
            debug!("Registry: Removed {} {}", R::KIND, key);
        }
        removed
    }

    /// Remove every resource matching `filter`, returning how many were removed
    pub async fn remove_all<P>(&self, filter: P) -> usize
    where
        P: Fn(&R) -> bool,
    {
        let mut removed = 0;
        for key in self.keys() {
            let Some(slot) = self.slots.read().get(&key).cloned() else {
                continue;
            };

            let matches = slot
                .lock()
                .await
                .as_ref()
                .map_or(false, |stored| filter(&stored.resource));

            if matches && self.remove(&key).await.is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Registry: Removed {} {} resources", removed, R::KIND);
        }
        removed
    }

    /// All versions, ordered by `last_updated` then key
    pub async fn list(&self) -> Vec<Stored<R>> {
        let slots: Vec<Slot<R>> = self.slots.read().values().cloned().collect();

        let mut items = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(stored) = slot.lock().await.clone() {
                items.push(stored);
            }
        }

        items.sort_by(|a, b| {
            a.last_updated()
                .cmp(&b.last_updated())
                .then_with(|| a.resource.key().cmp(&b.resource.key()))
        });
        items
    }

    /// Filtered, paginated listing
    pub async fn list_page<P>(&self, filter: &ListFilter, scope: P) -> Page<R>
    where
        P: Fn(&R) -> bool,
    {
        let matching: Vec<Stored<R>> = self
            .list()
            .await
            .into_iter()
            .filter(|s| filter.matches(s.last_updated()) && scope(&s.resource))
            .collect();

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();

        Page {
            items,
            total,
            offset: filter.offset,
        }
    }

    fn keys(&self) -> Vec<R::Key> {
        self.slots.read().keys().cloned().collect()
    }

    /// Number of slots, including ones whose first commit is in flight
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Resource> Default for VersionedStore<R> {
    fn default() -> Self {
        Self::new()
    }
}
