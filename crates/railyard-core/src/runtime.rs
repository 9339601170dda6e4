//! Run controls: external cancellation and per-call deadlines.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::collaborators::{ExternalError, ExternalResult};

/// Cancellation signal shared between an operator and the active run.
///
/// The run checks the signal at every node or stage boundary; a node that
/// is already executing is allowed to finish.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of the signal, so this only
        // errors if every handle was dropped.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Run an external call under an optional deadline.
///
/// An elapsed deadline is reported as [`ExternalError::Timeout`] and is
/// handled by callers exactly like any other failure of the call.
pub async fn with_deadline<T, F>(
    operation: &str,
    limit: Option<Duration>,
    call: F,
) -> ExternalResult<T>
where
    F: Future<Output = ExternalResult<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| ExternalError::Timeout {
                operation: operation.to_string(),
                limit_ms: limit.as_millis() as u64,
            })?,
        None => call.await,
    }
}
