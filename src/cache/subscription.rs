use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use super::entry::CacheEntry;
use super::keys::KeyPath;
use super::store::CacheStore;

/// Live binding between a consumer and one cache entry.
///
/// Holding a subscription keeps the entry's subscriber count raised, which
/// makes invalidation refetch it eagerly and shields it from eviction.
/// Disposal (explicit or on drop) never cancels a fetch already in flight.
pub struct Subscription {
    store: Arc<CacheStore>,
    key: KeyPath,
    slot_id: u64,
    receiver: watch::Receiver<CacheEntry>,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(
        store: Arc<CacheStore>,
        key: KeyPath,
        slot_id: u64,
        receiver: watch::Receiver<CacheEntry>,
    ) -> Self {
        Self {
            store,
            key,
            slot_id,
            receiver,
            active: true,
        }
    }

    pub fn key(&self) -> &KeyPath {
        &self.key
    }

    /// Most recently published entry.
    pub fn current(&self) -> CacheEntry {
        self.receiver.borrow().clone()
    }

    /// Wait for the next state transition. `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<CacheEntry> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Wait until `predicate` holds for the published entry.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&CacheEntry) -> bool) -> Option<CacheEntry> {
        self.receiver
            .wait_for(predicate)
            .await
            .ok()
            .map(|entry| (*entry).clone())
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.active {
            self.active = false;
            self.store.unsubscribe(&self.key, self.slot_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.active)
            .finish()
    }
}
