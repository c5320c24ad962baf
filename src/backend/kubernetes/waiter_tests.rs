// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Unit tests for the wait registry.

#[cfg(test)]
mod tests {
    use crate::backend::kubernetes::waiter::Waiter;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_condition_holds() {
        let waiter = Waiter::new("Zone", "default");
        let cancel = CancellationToken::new();
        waiter
            .wait(&cancel, "example.com", || Ok(true))
            .await
            .expect("condition already satisfied");
    }

    #[tokio::test]
    async fn test_submit_wakes_waiter() {
        let waiter = Arc::new(Waiter::new("Zone", "default"));
        let cancel = CancellationToken::new();
        let flag = Arc::new(AtomicBool::new(false));

        let waiting = {
            let waiter = waiter.clone();
            let flag = flag.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                waiter
                    .wait(&cancel, "example.com", move || {
                        Ok(flag.load(Ordering::SeqCst))
                    })
                    .await
            })
        };

        // Give the waiter time to block, then flip the flag and submit.
        tokio::time::sleep(Duration::from_millis(50)).await;
        flag.store(true, Ordering::SeqCst);
        waiter.submit("example.com");

        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .expect("waiter should wake")
            .expect("task should not panic")
            .expect("wait should succeed");
    }

    #[tokio::test]
    async fn test_submit_for_other_name_does_not_wake() {
        let waiter = Arc::new(Waiter::new("Zone", "default"));
        let cancel = CancellationToken::new();

        let waiting = {
            let waiter = waiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { waiter.wait(&cancel, "a.example", || Ok(false)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        waiter.submit("b.example");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        cancel.cancel();
        let err = waiting
            .await
            .expect("task should not panic")
            .expect_err("cancelled wait must fail");
        assert_eq!(err.code(), "BACKEND_REQUEST_FAILED");
    }

    #[tokio::test]
    async fn test_cancellation_reports_request_failed_with_name() {
        let waiter = Waiter::new("UpdateKey", "dns-system");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = waiter
            .wait(&cancel, "test", || Ok(false))
            .await
            .expect_err("must fail");
        assert_eq!(err.code(), "BACKEND_REQUEST_FAILED");
        let message = err.to_string();
        assert!(message.contains("test"));
        assert!(message.contains("UpdateKey"));
        assert!(message.contains("dns-system"));
    }

    #[tokio::test]
    async fn test_condition_error_aborts_wait() {
        let waiter = Waiter::new("Zone", "default");
        let cancel = CancellationToken::new();
        let err = waiter
            .wait(&cancel, "example.com", || {
                Err(crate::errors::BackendError::request_failed(
                    "object deleted while waiting",
                ))
            })
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("deleted"));
    }
}
