use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

const PRESENCE_TTL: Duration = Duration::from_secs(90);

/// `mark_online`/`is_online` for enriching the device-list endpoint; never consulted by an
/// authorization decision. A concurrent-safe map behind one lock is enough — unlike the
/// authorization cache, there's only one table here, so no read/write lock split is needed.
#[derive(Default)]
pub struct PresenceCache {
    entries: RwLock<HashMap<Uuid, Instant>>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_online(&self, device_id: Uuid) {
        self.entries.write().insert(device_id, Instant::now() + PRESENCE_TTL);
    }

    pub fn is_online(&self, device_id: Uuid) -> bool {
        self.entries.read().get(&device_id).map(|expiry| *expiry > Instant::now()).unwrap_or(false)
    }

    /// Drop expired entries. Run every 30s by the lifecycle sweeper.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.write().retain(|_, expiry| *expiry > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_and_reads_online() {
        let cache = PresenceCache::new();
        let id = Uuid::new_v4();
        assert!(!cache.is_online(id));
        cache.mark_online(id);
        assert!(cache.is_online(id));
    }

    #[test]
    fn sweep_drops_expired() {
        let cache = PresenceCache::new();
        let id = Uuid::new_v4();
        cache.entries.write().insert(id, Instant::now() - Duration::from_secs(1));
        cache.sweep();
        assert!(!cache.is_online(id));
    }
}
