//! Live-reloadable settings.
//!
//! Readers take a snapshot per operation with [`SettingsHandle::current`];
//! long-running loops hold a [`watch::Receiver`] and react to changes.

use std::sync::Arc;

use tokio::sync::watch;

use crate::settings::Settings;

/// Shared handle to the current settings snapshot.
#[derive(Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<Arc<Settings>>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(settings));
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the settings in effect right now.
    pub fn current(&self) -> Arc<Settings> {
        self.tx.borrow().clone()
    }

    /// Replace the settings and notify subscribers.
    pub fn update(&self, settings: Settings) {
        self.tx.send_replace(Arc::new(settings));
    }

    /// Apply an in-place edit to a copy of the current settings and publish it.
    pub fn modify(&self, edit: impl FnOnce(&mut Settings)) {
        let mut next = (*self.current()).clone();
        edit(&mut next);
        self.update(next);
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
