// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! The DNS protocol engine: listeners, request handling, TSIG.

pub(crate) mod handler;
pub mod server;
pub(crate) mod tsig;

pub use server::{RunningServer, Server};
