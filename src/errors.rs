// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Error types for the acmedns responder.
//!
//! Every error carries a stable code (see [`ConfigError::code`] and friends)
//! so that log consumers and callers can classify failures without matching
//! on display strings. The DNS engine only distinguishes "not found" from
//! "transient backend failure"; the classification helpers on
//! [`BackendError`] encode that split.

use thiserror::Error;

/// Configuration errors, surfaced before the server starts. All of them are
/// fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No nameservers were configured. At least one is required to answer
    /// SOA and NS queries.
    #[error("nameservers are required for NS delegation")]
    MissingNameservers,

    /// A nameserver entry was present but empty.
    #[error("empty nameserver at position {index}")]
    EmptyNameserver {
        /// Zero-based position of the offending entry.
        index: usize,
    },

    /// A nameserver entry is not a valid DNS name.
    #[error("invalid nameserver '{name}' at position {index}")]
    InvalidNameserver {
        /// The rejected nameserver string.
        name: String,
        /// Zero-based position of the offending entry.
        index: usize,
    },

    /// No backend implementation was selected.
    #[error("no backend selected")]
    MissingBackend,

    /// The selected backend identifier does not name a known implementation.
    #[error("unknown backend '{backend}'")]
    UnknownBackend {
        /// The identifier that failed to resolve.
        backend: String,
    },

    /// The configuration file could not be read.
    #[error("cannot read configuration file {path}")]
    Read {
        /// Path of the file that failed to load.
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("cannot parse configuration file {path}")]
    Parse {
        /// Path of the file that failed to parse.
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Catch-all for other invalid configuration values.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Human-readable description of what is wrong.
        reason: String,
    },
}

impl ConfigError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingNameservers => "MISSING_NAMESERVERS",
            Self::EmptyNameserver { .. } => "EMPTY_NAMESERVER",
            Self::InvalidNameserver { .. } => "INVALID_NAMESERVER",
            Self::MissingBackend => "MISSING_BACKEND",
            Self::UnknownBackend { .. } | Self::Read { .. } | Self::Parse { .. } | Self::Invalid { .. } => {
                "INVALID_CONFIGURATION"
            }
        }
    }
}

/// Errors produced by backend implementations.
///
/// The taxonomy is uniform across backends: the engine reacts to the
/// classification ([`is_not_found`](Self::is_not_found) versus everything
/// else), never to the concrete backend that produced the error.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The requested zone does not exist in the backend.
    #[error("zone '{zone}' not found in backend")]
    ZoneNotFound {
        /// The zone name that was looked up.
        zone: String,
    },

    /// The requested update key does not exist in the backend.
    #[error("update key '{key}' not found in backend")]
    KeyNotFound {
        /// The key name that was looked up.
        key: String,
    },

    /// A stored object of some kind was not found. Backends wrap this into
    /// the zone or key specific variant at their public surface.
    #[error("{kind} object '{name}' not found in namespace '{namespace}'")]
    ObjectNotFound {
        /// Object kind as known to the backing store.
        kind: &'static str,
        /// Object name.
        name: String,
        /// Namespace the object was expected in.
        namespace: String,
    },

    /// The object already exists. Only management operations surface this.
    #[error("{kind} object '{name}' already exists")]
    Conflict {
        /// Object kind as known to the backing store.
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// A request against the backing store failed for a transient reason.
    #[error("backend request failed: {reason}")]
    RequestFailed {
        /// What failed, including any object coordinates known at the
        /// failure site.
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl BackendError {
    /// Shorthand for a [`BackendError::RequestFailed`] without a cause.
    pub(crate) fn request_failed(reason: impl Into<String>) -> Self {
        Self::RequestFailed {
            reason: reason.into(),
            source: None,
        }
    }

    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ZoneNotFound { .. } => "ZONE_NOT_IN_BACKEND",
            Self::KeyNotFound { .. } => "KEY_NOT_IN_BACKEND",
            Self::ObjectNotFound { .. } => "OBJECT_NOT_IN_BACKEND",
            Self::Conflict { .. } => "OBJECT_CONFLICT",
            Self::RequestFailed { .. } => "BACKEND_REQUEST_FAILED",
        }
    }

    /// Returns true if this error means the object does not exist, as
    /// opposed to a transient failure talking to the store.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ZoneNotFound { .. } | Self::KeyNotFound { .. } | Self::ObjectNotFound { .. }
        )
    }

    /// Returns true if this error is a creation conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// TSIG signature handling errors. The engine treats every one of these as
/// an authentication failure and answers NOTAUTH.
#[derive(Error, Debug)]
pub enum TsigError {
    /// The update key exists but its secret is unusable.
    #[error("invalid TSIG key '{key}': {reason}")]
    InvalidKey {
        /// Key label from the TSIG record.
        key: String,
        /// What made the key unusable.
        reason: String,
    },

    /// The TSIG record declares an algorithm this responder does not speak.
    #[error("unsupported TSIG algorithm '{algorithm}'")]
    UnsupportedAlgorithm {
        /// The declared algorithm name.
        algorithm: String,
    },

    /// The message MAC did not verify against the key.
    #[error("TSIG signature verification failed for key '{key}'")]
    BadSignature {
        /// Key label from the TSIG record.
        key: String,
    },

    /// The signature is valid but its timestamp is outside the fudge window.
    #[error("TSIG signature for key '{key}' is outside its validity window")]
    BadTime {
        /// Key label from the TSIG record.
        key: String,
    },

    /// The key lookup itself failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl TsigError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidKey { .. } => "INVALID_TSIG_KEY",
            Self::UnsupportedAlgorithm { .. } => "UNSUPPORTED_TSIG_ALGORITHM",
            Self::BadSignature { .. } => "TSIG_BAD_SIGNATURE",
            Self::BadTime { .. } => "TSIG_BAD_TIME",
            Self::Backend(err) => err.code(),
        }
    }
}

/// Server lifecycle errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The caller's cancellation fired before a listener finished starting.
    #[error("timeout while trying to start DNS server")]
    StartTimeout,

    /// A listener could not bind its socket.
    #[error("cannot bind {proto} listener on {addr}")]
    Bind {
        /// Listener transport, `udp` or `tcp`.
        proto: &'static str,
        /// The address that failed to bind.
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A listener's serve loop died on a socket error.
    #[error("{proto} listener failed")]
    Serve {
        /// Listener transport, `udp` or `tcp`.
        proto: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A single listener failed to shut down.
    #[error("{proto} listener shutdown failed: {reason}")]
    ListenerShutdownFailed {
        /// Listener transport, `udp` or `tcp`.
        proto: &'static str,
        /// What went wrong while stopping.
        reason: String,
    },

    /// A listener did not stop within the shutdown grace period.
    #[error("{proto} listener did not stop within the grace period")]
    ShutdownTimeout {
        /// Listener transport, `udp` or `tcp`.
        proto: &'static str,
    },

    /// Server-wide shutdown failed; wraps the first listener failure.
    #[error("server shutdown failed")]
    ShutdownFailed {
        #[source]
        source: Box<ServerError>,
    },
}

impl ServerError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::StartTimeout => "SERVER_START_TIMEOUT",
            Self::Bind { .. } | Self::Serve { .. } => "LISTENER_START_FAILED",
            Self::ListenerShutdownFailed { .. } => "LISTENER_SHUTDOWN_FAILED",
            Self::ShutdownTimeout { .. } => "SHUTDOWN_TIMEOUT",
            Self::ShutdownFailed { .. } => "SERVER_SHUTDOWN_FAILED",
        }
    }
}

/// Composite error type covering the whole responder.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Backend error.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// TSIG error.
    #[error(transparent)]
    Tsig(#[from] TsigError),

    /// Server lifecycle error.
    #[error(transparent)]
    Server(#[from] ServerError),
}

impl Error {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(err) => err.code(),
            Self::Backend(err) => err.code(),
            Self::Tsig(err) => err.code(),
            Self::Server(err) => err.code(),
        }
    }
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod errors_tests;
