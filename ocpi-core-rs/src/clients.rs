//! Per-counterparty client registry
//!
//! Outbound clients are created lazily, once per counterparty, even when
//! several requests need the same client at the same time.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::info;

/// Create-once cache of clients keyed by counterparty
pub struct ClientRegistry<K, C> {
    cells: Mutex<HashMap<K, Arc<OnceCell<Arc<C>>>>>,
}

impl<K, C> ClientRegistry<K, C>
where
    K: Clone + Eq + Hash + Display,
{
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Cached client for `key`, built by `create` on first use.
    ///
    /// Concurrent callers for the same key wait for a single `create`; a
    /// failed `create` leaves the key empty for the next caller to retry.
    pub async fn get_or_create<F, Fut, E>(&self, key: &K, create: F) -> Result<Arc<C>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let cell = self.cells.lock().entry(key.clone()).or_default().clone();

        let client = cell
            .get_or_try_init(|| async {
                let client = create().await?;
                info!("Clients: Created client for {}", key);
                Ok::<_, E>(Arc::new(client))
            })
            .await?;
        Ok(client.clone())
    }

    pub fn get(&self, key: &K) -> Option<Arc<C>> {
        self.cells.lock().get(key).and_then(|cell| cell.get().cloned())
    }

    pub fn remove(&self, key: &K) -> Option<Arc<C>> {
        let removed = self.cells.lock().remove(key)?.get().cloned();
        if removed.is_some() {
            info!("Clients: Dropped client for {}", key);
        }
        removed
    }

    /// Number of initialized clients
    pub fn len(&self) -> usize {
        self.cells.lock().values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, C> Default for ClientRegistry<K, C>
where
    K: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}
