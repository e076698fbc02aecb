//! In-memory [`SettingsStore`].  Nothing survives the process.

use std::sync::{Mutex, PoisonError};

use pairlink_core::{EndpointRecord, KnownPeer};

use crate::application::ports::{LinkSettings, SettingsStore};

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<LinkSettings>,
}

impl MemorySettingsStore {
    pub fn with_settings(settings: LinkSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }

    fn update(&self, f: impl FnOnce(&mut LinkSettings)) {
        f(&mut self.settings.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl SettingsStore for MemorySettingsStore {
    fn snapshot(&self) -> LinkSettings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_manually_disconnected(&self, value: bool) {
        self.update(|s| s.manually_disconnected = value);
    }

    fn set_auto_reconnect_enabled(&self, value: bool) {
        self.update(|s| s.auto_reconnect_enabled = value);
    }

    fn set_last_active_device(&self, record: &EndpointRecord) {
        self.update(|s| s.last_active_device = Some(record.clone()));
    }

    fn save_peers(&self, peers: &[KnownPeer]) {
        self.update(|s| s.peers = peers.to_vec());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
