use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as KeyMutex, OwnedMutexGuard};

/// Keyed exclusive scopes, one per host address.
///
/// Reconciling a host reads its prior active port set and writes against it,
/// so two snapshots touching the same host must not interleave. Snapshots for
/// different hosts do not contend here.
pub struct HostLocks {
    slots: Arc<Mutex<HashMap<String, Arc<KeyMutex<()>>>>>,
}

impl Clone for HostLocks {
    fn clone(&self) -> Self { HostLocks { slots: self.slots.clone() } }
}

impl Default for HostLocks {
    fn default() -> Self { Self::new() }
}

/// Guards held for the duration of one snapshot. Dropping releases every host.
pub struct HostGuards {
    _guards: Vec<OwnedMutexGuard<()>>,
    pub keys: Vec<String>,
}

impl HostLocks {
    pub fn new() -> Self {
        HostLocks { slots: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn slot(&self, key: &str) -> Arc<KeyMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // Drop slots nobody holds or waits on
        slots.retain(|_, m| Arc::strong_count(m) > 1);
        slots.entry(key.to_string()).or_insert_with(|| Arc::new(KeyMutex::new(()))).clone()
    }

    /// Blocks the calling thread until every key is held. Keys are sorted and
    /// deduplicated first, so two callers with overlapping sets cannot deadlock
    /// and a repeated key cannot block on itself.
    ///
    /// Must not be called from inside an async task; use a blocking worker.
    pub fn acquire_blocking<I, S>(&self, keys: I) -> HostGuards
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for k in &keys {
            guards.push(self.slot(k).blocking_lock_owned());
        }
        HostGuards { _guards: guards, keys }
    }

    #[cfg(test)]
    fn try_acquire(&self, key: &str) -> Option<HostGuards> {
        let guard = self.slot(key).try_lock_owned().ok()?;
        Some(HostGuards { _guards: vec![guard], keys: vec![key.to_string()] })
    }

    /// Number of keys currently tracked (held or awaited).
    pub fn tracked(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.values().filter(|m| Arc::strong_count(m) > 1).count()
    }
}
