// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Shared constants for the acmedns responder.

/// Default listen address for both the UDP and TCP listeners.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:5353";

/// TTL of TXT answers. ACME validators re-query aggressively, so this is
/// deliberately short.
pub const TXT_TTL: u32 = 60;

/// TTL of SOA and NS answers.
pub const INFRA_TTL: u32 = 86_400;

/// SOA refresh interval, in seconds.
pub const SOA_REFRESH: i32 = 86_400;

/// SOA retry interval, in seconds.
pub const SOA_RETRY: i32 = 7_200;

/// SOA expire interval, in seconds.
pub const SOA_EXPIRE: i32 = 3_600_000;

/// SOA minimum TTL, also used as the negative-caching TTL.
pub const SOA_MINIMUM: u32 = 60;

/// Maximum length of a single TXT character-string on the wire.
pub const TXT_CHUNK_LEN: usize = 255;

/// The label that every name served by this responder must start with.
pub const ACME_CHALLENGE_PREFIX: &str = "_acme-challenge.";

/// Bounded retry count for optimistic backend updates. Keeps a heavily
/// contended zone from livelocking the update path.
pub const SET_RETRY_LIMIT: usize = 3;

/// Idle timeout for TCP connections, in seconds.
pub const TCP_IDLE_TIMEOUT_SECS: u64 = 30;

/// How long a listener gets to wind down before shutdown gives up on it.
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Data key under which an update key's secret is stored in its Secret.
pub const SECRET_DATA_KEY: &str = "key";

/// API group of the acmedns resource kinds.
pub const API_GROUP: &str = "acmedns.io";

/// API version of the acmedns resource kinds.
pub const API_VERSION: &str = "v1";
