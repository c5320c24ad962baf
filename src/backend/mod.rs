// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Backend contract and registry.
//!
//! The DNS engine only ever talks to [`Backend`]. The hot path uses
//! [`Backend::get_zone`], [`Backend::set_zone`] and [`Backend::get_key`];
//! the remaining operations exist for management tooling and tests.
//!
//! Two implementations ship with the responder:
//!
//! - [`memory::MemoryBackend`] keeps everything in process memory and is the
//!   reference implementation of the contract.
//! - [`kubernetes::KubernetesBackend`] stores zones, keys and bindings as
//!   Kubernetes resources and serves reads from a watch-driven local cache.

pub mod kubernetes;
pub mod memory;

use crate::config::Config;
use crate::errors::{BackendError, ConfigError, Error};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identifier of the in-memory backend.
pub const MEMORY_BACKEND: &str = "memory";

/// Identifier of the Kubernetes backend.
pub const KUBERNETES_BACKEND: &str = "kubernetes";

/// A zone as seen by the DNS engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ZoneRecord {
    /// Current zone serial. Strictly increases on every successful
    /// [`Backend::set_zone`].
    pub serial: u32,
    /// The ACME challenge answers currently published for the zone.
    pub acme_answers: Vec<String>,
    /// Enables verbose per-request diagnostics for this zone.
    pub debug: bool,
}

/// An update key as seen by the TSIG provider.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyRecord {
    /// Base64-encoded HMAC secret.
    pub secret: String,
    /// The zones this key is currently bound to, deduplicated and sorted.
    pub zones: Vec<String>,
}

/// The CRUD contract every backend implements.
///
/// All operations take a cancellation handle; a backend that has to wait
/// for remote state returns [`BackendError::RequestFailed`] when the handle
/// fires first. Mutating operations are read-your-writes: once they return,
/// a read on the same backend value observes the effect.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Retrieve a zone by name.
    async fn get_zone(
        &self,
        cancel: &CancellationToken,
        zone: &str,
    ) -> Result<ZoneRecord, BackendError>;

    /// Atomically replace a zone's ACME challenge answers and increment its
    /// serial.
    async fn set_zone(
        &self,
        cancel: &CancellationToken,
        zone: &str,
        acme_answers: Vec<String>,
    ) -> Result<(), BackendError>;

    /// Retrieve an update key and the set of zones it is bound to.
    async fn get_key(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<KeyRecord, BackendError>;

    /// Register a new zone with serial 0 and no answers.
    async fn create_zone(
        &self,
        cancel: &CancellationToken,
        zone: &str,
    ) -> Result<(), BackendError>;

    /// Delete a zone, cascading to its key bindings.
    async fn delete_zone(
        &self,
        cancel: &CancellationToken,
        zone: &str,
    ) -> Result<(), BackendError>;

    /// Create a new update key without any zone bindings.
    async fn create_key(
        &self,
        cancel: &CancellationToken,
        key: &str,
        secret: &str,
    ) -> Result<(), BackendError>;

    /// Delete an update key and everything that hangs off it. Idempotent.
    async fn delete_key(&self, cancel: &CancellationToken, key: &str)
        -> Result<(), BackendError>;

    /// Rotate an update key's secret in place.
    async fn set_key_secret(
        &self,
        cancel: &CancellationToken,
        key: &str,
        secret: &str,
    ) -> Result<(), BackendError>;

    /// Bind a key to a zone, allowing the key to update that zone.
    async fn bind_key(
        &self,
        cancel: &CancellationToken,
        key: &str,
        zone: &str,
    ) -> Result<(), BackendError>;

    /// Remove every binding between a key and a zone. Idempotent.
    async fn unbind_key(
        &self,
        cancel: &CancellationToken,
        key: &str,
        zone: &str,
    ) -> Result<(), BackendError>;

    /// Shut down the backend and release its resources.
    async fn close(&self, cancel: &CancellationToken) -> Result<(), BackendError>;
}

/// Shared handle to a backend implementation.
pub type DynBackend = Arc<dyn Backend>;

/// Build the backend selected by the configuration.
pub async fn build(config: &Config) -> Result<DynBackend, Error> {
    match config.backend_id()? {
        MEMORY_BACKEND => Ok(Arc::new(memory::MemoryBackend::from_config(&config.memory))),
        KUBERNETES_BACKEND => {
            let backend = kubernetes::KubernetesBackend::new(&config.kubernetes).await?;
            Ok(Arc::new(backend))
        }
        other => Err(ConfigError::UnknownBackend {
            backend: other.to_string(),
        }
        .into()),
    }
}
