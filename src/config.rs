// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Configuration surface for the responder.
//!
//! Configuration is loaded from an optional JSON file and then overlaid with
//! `ACMEDNS_*` environment variables, so container deployments can get away
//! without mounting a file at all. [`Config::validate`] runs before the
//! server is constructed; every validation failure is fatal.

use crate::constants::DEFAULT_LISTEN;
use crate::errors::ConfigError;
use hickory_proto::rr::Name;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address and port to listen on for TCP and UDP requests.
    pub listen: SocketAddr,

    /// Nameservers returned in NS responses. The first entry also populates
    /// the SOA MNAME and RNAME fields. Required, must be valid DNS names.
    pub nameservers: Vec<String>,

    /// Identifier of the backend implementation to build. Required.
    pub backend: Option<String>,

    /// Logging options.
    pub log: LogConfig,

    /// Seed data for the in-memory backend.
    pub memory: MemoryConfig,

    /// Connection options for the Kubernetes backend.
    pub kubernetes: KubernetesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN
                .parse()
                .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 5353))),
            nameservers: Vec::new(),
            backend: None,
            log: LogConfig::default(),
            memory: MemoryConfig::default(),
            kubernetes: KubernetesConfig::default(),
        }
    }
}

/// Logging options.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default log severity when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Seed data for the in-memory backend. Useful for static deployments and
/// for tests; the serials of seeded zones do not survive restarts.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Zones to seed, keyed by zone name.
    pub zones: HashMap<String, MemoryZoneSeed>,

    /// Update keys to seed, keyed by key name.
    pub keys: HashMap<String, MemoryKeySeed>,
}

/// A seeded zone for the in-memory backend.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MemoryZoneSeed {
    /// Initial zone serial.
    pub serial: u32,
    /// Initial ACME challenge answers.
    pub acme_challenge_answers: Vec<String>,
    /// Enables verbose per-request diagnostics for this zone.
    pub debug: bool,
}

/// A seeded update key for the in-memory backend.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MemoryKeySeed {
    /// Base64-encoded HMAC secret.
    pub secret: String,
    /// Zones this key may update.
    pub zones: Vec<String>,
}

/// Connection options for the Kubernetes backend.
///
/// When `api_url` is unset the client is inferred from the standard
/// environment (kubeconfig or in-cluster service account). Authentication
/// material may be supplied inline (`token`, `username`/`password`) or via
/// file paths (`token_file`, `client_cert`/`client_key`).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// API server URL, e.g. `https://kubernetes.default.svc`.
    pub api_url: Option<String>,
    /// Namespace holding the Zone, UpdateKey and UpdateKeyZoneBinding
    /// resources.
    pub namespace: String,
    /// Bearer token, inline.
    pub token: Option<String>,
    /// Bearer token, read from this file on each request.
    pub token_file: Option<String>,
    /// Basic-auth username.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Client certificate path (PEM).
    pub client_cert: Option<String>,
    /// Client key path (PEM).
    pub client_key: Option<String>,
    /// Certificate authority bundle path (PEM).
    pub ca_cert: Option<String>,
    /// Disables server certificate verification. Test clusters only.
    pub insecure_skip_tls_verify: bool,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            namespace: "default".to_string(),
            token: None,
            token_file: None,
            username: None,
            password: None,
            client_cert: None,
            client_key: None,
            ca_cert: None,
            insecure_skip_tls_verify: false,
            timeout_secs: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional JSON file, then apply `ACMEDNS_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(listen) = env_var("ACMEDNS_LISTEN") {
            self.listen = listen.parse().map_err(|_| ConfigError::Invalid {
                reason: format!("ACMEDNS_LISTEN is not a valid address: '{listen}'"),
            })?;
        }
        if let Some(nameservers) = env_var("ACMEDNS_NAMESERVERS") {
            self.nameservers = nameservers
                .split(',')
                .map(|ns| ns.trim().to_string())
                .collect();
        }
        if let Some(backend) = env_var("ACMEDNS_BACKEND") {
            self.backend = Some(backend);
        }
        if let Some(level) = env_var("ACMEDNS_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(api_url) = env_var("ACMEDNS_KUBERNETES_API_URL") {
            self.kubernetes.api_url = Some(api_url);
        }
        if let Some(namespace) = env_var("ACMEDNS_KUBERNETES_NAMESPACE") {
            self.kubernetes.namespace = namespace;
        }
        if let Some(token_file) = env_var("ACMEDNS_KUBERNETES_TOKEN_FILE") {
            self.kubernetes.token_file = Some(token_file);
        }
        Ok(())
    }

    /// Validate the parts of the configuration the DNS engine depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nameservers.is_empty() {
            return Err(ConfigError::MissingNameservers);
        }
        for (index, ns) in self.nameservers.iter().enumerate() {
            if ns.is_empty() {
                return Err(ConfigError::EmptyNameserver { index });
            }
            if Name::from_ascii(ns).is_err() {
                return Err(ConfigError::InvalidNameserver {
                    name: ns.clone(),
                    index,
                });
            }
        }
        self.backend_id()?;
        Ok(())
    }

    /// The selected backend identifier, or `MISSING_BACKEND`.
    pub fn backend_id(&self) -> Result<&str, ConfigError> {
        match self.backend.as_deref() {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(ConfigError::MissingBackend),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
