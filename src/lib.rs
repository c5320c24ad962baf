// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! # acmedns
//!
//! A minimal authoritative DNS responder for the ACME DNS-01 challenge
//! flow. It answers TXT, SOA and NS queries for `_acme-challenge.<zone>`
//! names and accepts TSIG-authenticated RFC 2136 dynamic updates that
//! install the TXT answers a certificate authority reads. It serves no
//! other DNS traffic.
//!
//! ## Modules
//!
//! - [`dns`] - the protocol engine: UDP/TCP listeners, the query and update
//!   state machines, TSIG verification
//! - [`backend`] - the storage contract plus the in-memory and
//!   Kubernetes-backed implementations
//! - [`config`] - configuration loading and validation
//! - [`errors`] - the error taxonomy with stable codes
//!
//! ## Example
//!
//! ```rust,no_run
//! use acmedns::config::Config;
//! use acmedns::dns::Server;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), acmedns::errors::Error> {
//! let mut config = Config::default();
//! config.nameservers = vec!["ns.example.com".to_string()];
//! config.backend = Some("memory".to_string());
//!
//! let backend = acmedns::backend::build(&config).await?;
//! let server = Server::new(&config, backend.clone())?;
//!
//! let cancel = CancellationToken::new();
//! let running = server.start(&cancel).await?;
//! // ... serve until shutdown ...
//! running.stop().await?;
//! backend.close(&cancel).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod constants;
pub mod dns;
pub mod errors;

pub use config::Config;
pub use dns::{RunningServer, Server};
pub use errors::Error;
