//! Process-wide atomic snapshot of the current [`Config`].

use std::sync::{Arc, RwLock};

use super::types::Config;

/// Holder of the currently installed configuration snapshot.
///
/// Snapshots are immutable once published; `get` hands out a cheap
/// `Arc` clone, so readers keep a consistent view for as long as they
/// hold it even if a reload swaps the snapshot underneath them.
#[derive(Debug)]
pub struct ConfigState {
    current: RwLock<Arc<Config>>,
}

impl ConfigState {
    pub fn new(cfg: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(cfg)),
        }
    }

    /// The currently installed snapshot. Never torn: the swap in
    /// [`set`](Self::set) is atomic under the write lock.
    pub fn get(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Install a new validated snapshot. All subsequent `get` calls
    /// observe it; snapshots already handed out stay valid.
    pub fn set(&self, cfg: Config) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(cfg);
    }
}
