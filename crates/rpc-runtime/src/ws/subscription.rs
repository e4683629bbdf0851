//! Subscription and connection identity, cancellation and handles

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Server-side identity of one live subscription, time-ordered (UUID v7).
///
/// Request ids are chosen by the client and may be reused once a subscription
/// ends; this id never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new subscription ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Identity of one socket connection (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new connection ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// One-shot cancellation flag that can be awaited.
#[derive(Debug, Default)]
pub struct CancellationSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationSignal {
    /// Create a new, untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the signal and wake every waiter.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Owner of a live subscription's pump task.
///
/// Dropping the handle cancels the subscription and aborts the task; [`stop`](Self::stop)
/// instead lets the task drop its source and finish on its own.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    path: Arc<str>,
    signal: Arc<CancellationSignal>,
    task: Option<JoinHandle<()>>,
    created_at: Instant,
}

impl SubscriptionHandle {
    /// Handle for a subscription on `path` whose task watches `signal`.
    pub fn new(path: impl Into<Arc<str>>, signal: Arc<CancellationSignal>) -> Self {
        Self {
            id: SubscriptionId::new(),
            path: path.into(),
            signal,
            task: None,
            created_at: Instant::now(),
        }
    }

    /// Attach the pump task.
    pub fn set_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// Server-side id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Procedure path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Time since the subscription started.
    pub fn duration(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Cancel and wait until the task has released its source.
    pub async fn stop(mut self) {
        self.signal.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
            && e.is_panic()
        {
            tracing::warn!(subscription_id = %self.id, path = %self.path, "Subscription task panicked");
        }
    }

    /// Forget the task without aborting it. Used by the task itself on exit.
    pub(crate) fn detach(&mut self) {
        self.task = None;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.signal.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
