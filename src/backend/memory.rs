// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! In-memory backend.
//!
//! The reference implementation of the backend contract. Zone serials do not
//! survive restarts, so this backend is only suitable for test setups and
//! static single-node deployments.

use crate::backend::{Backend, KeyRecord, ZoneRecord};
use crate::config::MemoryConfig;
use crate::errors::BackendError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default)]
struct MemoryKey {
    secret: String,
    zones: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    zones: HashMap<String, ZoneRecord>,
    keys: HashMap<String, MemoryKey>,
}

/// Backend keeping all state in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend seeded with the configured zones and keys.
    #[must_use]
    pub fn from_config(config: &MemoryConfig) -> Self {
        let mut state = State::default();
        for (name, seed) in &config.zones {
            state.zones.insert(
                name.clone(),
                ZoneRecord {
                    serial: seed.serial,
                    acme_answers: seed.acme_challenge_answers.clone(),
                    debug: seed.debug,
                },
            );
        }
        for (name, seed) in &config.keys {
            state.keys.insert(
                name.clone(),
                MemoryKey {
                    secret: seed.secret.clone(),
                    zones: seed.zones.iter().cloned().collect(),
                },
            );
        }
        Self {
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_zone(
        &self,
        _cancel: &CancellationToken,
        zone: &str,
    ) -> Result<ZoneRecord, BackendError> {
        self.read()
            .zones
            .get(zone)
            .cloned()
            .ok_or_else(|| BackendError::ZoneNotFound { zone: zone.into() })
    }

    async fn set_zone(
        &self,
        _cancel: &CancellationToken,
        zone: &str,
        acme_answers: Vec<String>,
    ) -> Result<(), BackendError> {
        let mut state = self.write();
        let record = state
            .zones
            .get_mut(zone)
            .ok_or_else(|| BackendError::ZoneNotFound { zone: zone.into() })?;
        record.serial = record.serial.wrapping_add(1);
        record.acme_answers = acme_answers;
        Ok(())
    }

    async fn get_key(
        &self,
        _cancel: &CancellationToken,
        key: &str,
    ) -> Result<KeyRecord, BackendError> {
        self.read()
            .keys
            .get(key)
            .map(|record| KeyRecord {
                secret: record.secret.clone(),
                zones: record.zones.iter().cloned().collect(),
            })
            .ok_or_else(|| BackendError::KeyNotFound { key: key.into() })
    }

    async fn create_zone(
        &self,
        _cancel: &CancellationToken,
        zone: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.write();
        if state.zones.contains_key(zone) {
            return Err(BackendError::Conflict {
                kind: "Zone",
                name: zone.into(),
            });
        }
        state.zones.insert(zone.into(), ZoneRecord::default());
        Ok(())
    }

    async fn delete_zone(
        &self,
        _cancel: &CancellationToken,
        zone: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.write();
        state.zones.remove(zone);
        // Bindings are owned jointly by the key and the zone.
        for key in state.keys.values_mut() {
            key.zones.remove(zone);
        }
        Ok(())
    }

    async fn create_key(
        &self,
        _cancel: &CancellationToken,
        key: &str,
        secret: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.write();
        if state.keys.contains_key(key) {
            return Err(BackendError::Conflict {
                kind: "UpdateKey",
                name: key.into(),
            });
        }
        state.keys.insert(
            key.into(),
            MemoryKey {
                secret: secret.into(),
                zones: BTreeSet::new(),
            },
        );
        Ok(())
    }

    async fn delete_key(
        &self,
        _cancel: &CancellationToken,
        key: &str,
    ) -> Result<(), BackendError> {
        self.write().keys.remove(key);
        Ok(())
    }

    async fn set_key_secret(
        &self,
        _cancel: &CancellationToken,
        key: &str,
        secret: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.write();
        let record = state
            .keys
            .get_mut(key)
            .ok_or_else(|| BackendError::KeyNotFound { key: key.into() })?;
        record.secret = secret.into();
        Ok(())
    }

    async fn bind_key(
        &self,
        _cancel: &CancellationToken,
        key: &str,
        zone: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.write();
        if !state.zones.contains_key(zone) {
            return Err(BackendError::ZoneNotFound { zone: zone.into() });
        }
        let record = state
            .keys
            .get_mut(key)
            .ok_or_else(|| BackendError::KeyNotFound { key: key.into() })?;
        record.zones.insert(zone.into());
        Ok(())
    }

    async fn unbind_key(
        &self,
        _cancel: &CancellationToken,
        key: &str,
        zone: &str,
    ) -> Result<(), BackendError> {
        if let Some(record) = self.write().keys.get_mut(key) {
            record.zones.remove(zone);
        }
        Ok(())
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod memory_tests;
