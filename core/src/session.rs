//! Per-user session context: the cached API key.
//!
//! Shared by reference between every component that authenticates, instead
//! of living in a global.

use std::sync::RwLock;

use log::info;

#[derive(Debug, Default)]
pub struct Session {
    api_key: RwLock<Option<String>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(key: impl Into<String>) -> Self {
        let session = Self::new();
        session.set_api_key(key);
        session
    }

    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key().is_some()
    }

    /// Store a key; blank keys clear the session instead.
    pub fn set_api_key(&self, key: impl Into<String>) {
        let key = key.into().trim().to_string();
        let mut slot = self.api_key.write().unwrap_or_else(|e| e.into_inner());
        *slot = (!key.is_empty()).then_some(key);
    }

    /// Forget the cached key so the next attempt re-derives it.
    pub fn clear(&self) {
        let mut slot = self.api_key.write().unwrap_or_else(|e| e.into_inner());
        if slot.take().is_some() {
            info!("cleared cached API key");
        }
    }
}
