// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Per-object wait registry used by the watched cache.
//!
//! Mutating cache operations need "block until the local cache reflects my
//! change" semantics. Each cache keeps one [`Waiter`] per operation class
//! (create, update, delete); the watch event handler submits the affected
//! object name and every waiter for that name re-checks its condition.

use crate::errors::BackendError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Maps object names to one-shot notification channels.
///
/// A waiter round works like this: register interest in the name, check the
/// condition, and only then block. Registration happens before the check, so
/// an event that lands between the check and the block still wakes the
/// waiter. [`Waiter::submit`] retires the name's channel; the next round
/// creates a fresh one.
pub(crate) struct Waiter {
    kind: &'static str,
    namespace: String,
    queues: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Waiter {
    pub(crate) fn new(kind: &'static str, namespace: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Wake every waiter currently blocked on `name`.
    pub(crate) fn submit(&self, name: &str) {
        let notify = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    /// Block until `condition` reports true for `name`, or until `cancel`
    /// fires.
    ///
    /// The condition runs once per wakeup; a condition error aborts the wait
    /// and is returned as-is. Cancellation is reported as a
    /// `BACKEND_REQUEST_FAILED` annotated with the object coordinates.
    pub(crate) async fn wait<F>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        condition: F,
    ) -> Result<(), BackendError>
    where
        F: Fn() -> Result<bool, BackendError>,
    {
        loop {
            let notify = {
                let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
                queues
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Notify::new()))
                    .clone()
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, otherwise an event landing
            // between the check and the await would be lost.
            notified.as_mut().enable();

            if condition()? {
                return Ok(());
            }

            tokio::select! {
                () = &mut notified => {}
                () = cancel.cancelled() => {
                    return Err(BackendError::RequestFailed {
                        reason: format!(
                            "timeout while waiting for the {} cache in namespace '{}' to observe change to '{}'",
                            self.kind, self.namespace, name
                        ),
                        source: None,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "waiter_tests.rs"]
mod waiter_tests;
