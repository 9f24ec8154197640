//! Pending-operations table: correlation token → completion handle.
//!
//! Every request the client sends gets a fresh token and a [`PendingOperation`]
//! the caller awaits. The reader task completes the entry when the matching
//! acknowledgement arrives. A caller that times out, or drops its handle,
//! removes its entry; a late acknowledgement then finds nothing to complete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::GatewayError;

type Table<T> = Arc<Mutex<HashMap<String, oneshot::Sender<T>>>>;

/// Table of in-flight operations.
#[derive(Debug)]
pub struct PendingOperations<T> {
    ops: Table<T>,
    next: AtomicU64,
}

impl<T> Default for PendingOperations<T> {
    fn default() -> Self {
        Self {
            ops: Arc::new(Mutex::new(HashMap::new())),
            next: AtomicU64::new(1),
        }
    }
}

impl<T> PendingOperations<T> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a token and registers its completion handle.
    pub fn begin(&self) -> PendingOperation<T> {
        let token = format!("op-{}", self.next.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), tx);
        PendingOperation {
            token,
            rx,
            ops: Arc::clone(&self.ops),
        }
    }

    /// Completes `token` with `value`. Returns `false` when nobody waits
    /// for it any more.
    pub fn complete(&self, token: &str, value: T) -> bool {
        let waiter = self
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
        waiter.is_some_and(|tx| tx.send(value).is_ok())
    }

    /// Fails every waiter; used when the stream ends.
    pub fn clear(&self) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of operations still waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Completion handle of one operation.
#[derive(Debug)]
pub struct PendingOperation<T> {
    token: String,
    rx: oneshot::Receiver<T>,
    ops: Table<T>,
}

impl<T> PendingOperation<T> {
    /// Correlation token to put on the request.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Timeout`] if no reply arrives within
    /// `timeout` and [`GatewayError::Transport`] if the stream ended first.
    pub async fn wait(mut self, timeout: Duration) -> Result<T, GatewayError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(GatewayError::Transport(format!(
                "stream closed before {} was acknowledged",
                self.token
            ))),
            Err(_) => Err(GatewayError::Timeout(format!(
                "no acknowledgement for {} within {timeout:?}",
                self.token
            ))),
        }
    }
}

impl<T> Drop for PendingOperation<T> {
    fn drop(&mut self) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.token);
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::task::Poll;

    use super::*;

    #[tokio::test]
    async fn completion_reaches_waiter() {
        let table = PendingOperations::<u32>::new();
        let op = table.begin();
        let token = op.token().to_string();
        assert!(table.complete(&token, 7));
        assert!(matches!(op.wait(Duration::from_secs(1)).await, Ok(7)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn wait_stays_pending_until_completed() {
        let table = PendingOperations::<u32>::new();
        let op = table.begin();
        let token = op.token().to_string();
        let mut wait = tokio_test::task::spawn(op.wait(Duration::from_secs(5)));
        tokio_test::assert_pending!(wait.poll());

        assert!(table.complete(&token, 3));
        assert!(wait.is_woken());
        let Poll::Ready(Ok(3)) = wait.poll() else {
            panic!("completion not observed");
        };
    }

    #[tokio::test]
    async fn timeout_removes_entry() {
        let table = PendingOperations::<u32>::new();
        let op = table.begin();
        let token = op.token().to_string();
        assert!(matches!(
            op.wait(Duration::from_millis(10)).await,
            Err(GatewayError::Timeout(_))
        ));
        assert!(table.is_empty());
        assert!(!table.complete(&token, 1));
    }

    #[test]
    fn dropped_handle_removes_entry() {
        let table = PendingOperations::<u32>::new();
        let first = table.begin();
        let second = table.begin();
        assert_ne!(first.token(), second.token());
        drop(first);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn clear_fails_waiters() {
        let table = PendingOperations::<u32>::new();
        let op = table.begin();
        table.clear();
        assert!(matches!(
            op.wait(Duration::from_secs(1)).await,
            Err(GatewayError::Transport(_))
        ));
    }
}
