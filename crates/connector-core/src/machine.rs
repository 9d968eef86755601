//! Connection state machine shared by every connector.
//!
//! [`ConnectionManager`] wraps a [`Connectable`] driver and owns its
//! lifecycle: serialized transitions, the `disconnecting` guard, and a single
//! retry timer that is always cancelled before a new one is armed.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected|Connecting -> Disconnecting -> Disconnected
//! Disconnected -> ReconnectScheduled -> Connecting   (enabled, not torn down)
//! ```
//!
//! Driver errors never escape: they are logged and the machine settles in a
//! well-defined state.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result};
use crate::retry::RetryTimer;
use crate::state::ConnectionState;
use crate::traits::Connectable;

/// Default delay before a failed connection is retried.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Settings for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connector identity used in every log line.
    pub connector_id: String,
    /// Delay between a failure and the next attempt.
    pub retry_interval: Duration,
    /// When false, failures never schedule a retry.
    pub enabled: bool,
}

impl ConnectionConfig {
    pub fn new(connector_id: impl Into<String>) -> Self {
        Self {
            connector_id: connector_id.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            enabled: true,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Counters exposed for status reporting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub attempts: u64,
    pub connections: u64,
    pub failures: u64,
    pub timers_armed: u64,
    pub timers_cancelled: u64,
    pub retry_pending: bool,
}

type RetryFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Inner {
    id: String,
    retry_interval: Duration,
    enabled: AtomicBool,
    driver: Arc<dyn Connectable>,
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    /// Held for the whole duration of a transition.
    transition: tokio::sync::Mutex<()>,
    /// Depth of intentional teardowns in progress.
    disconnecting: AtomicUsize,
    stopped: AtomicBool,
    retry: Mutex<RetryTimer>,
    attempts: AtomicU64,
    /// Successful connects; identifies the live connection.
    connections: AtomicU64,
    failures: AtomicU64,
}

/// Drives a [`Connectable`] through its lifecycle.
///
/// Cloning is cheap; clones share the same machine.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, driver: Arc<dyn Connectable>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                id: config.connector_id,
                retry_interval: config.retry_interval,
                enabled: AtomicBool::new(config.enabled),
                driver,
                state_tx,
                transitions,
                transition: tokio::sync::Mutex::new(()),
                disconnecting: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                retry: Mutex::new(RetryTimer::new()),
                attempts: AtomicU64::new(0),
                connections: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn connector_id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch the latest state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Every state entered from now on, in order, including short-lived ones
    /// a [`subscribe`](Self::subscribe) receiver may never observe.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.transitions.subscribe()
    }

    /// Whether the intentional-teardown guard is currently raised.
    pub fn is_disconnecting(&self) -> bool {
        self.inner.disconnecting.load(Ordering::SeqCst) > 0
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stats(&self) -> ConnectionStats {
        let retry = self.inner.retry.lock();
        ConnectionStats {
            attempts: self.inner.attempts.load(Ordering::Relaxed),
            connections: self.inner.connections.load(Ordering::SeqCst),
            failures: self.inner.failures.load(Ordering::Relaxed),
            timers_armed: retry.armed_total(),
            timers_cancelled: retry.cancelled_total(),
            retry_pending: retry.is_pending(),
        }
    }

    /// Clear a previous [`stop`](Self::stop) and connect.
    pub async fn start(&self) {
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.connect().await;
    }

    /// Connect the driver.
    ///
    /// Idempotent: a pending retry timer is cancelled first and an already
    /// connected machine is left untouched. Failures are logged and handed to
    /// the retry path.
    pub async fn connect(&self) {
        self.inner.attempt_connect(None).await;
    }

    /// Intentional teardown.
    ///
    /// Cancels the pending retry timer, raises the `disconnecting` guard for
    /// the whole teardown, then clears it. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.disconnecting.fetch_add(1, Ordering::SeqCst);
        inner.cancel_retry();

        {
            let _transition = inner.transition.lock().await;
            inner.cancel_retry();

            match inner.current() {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    inner.set_state(ConnectionState::Disconnecting);
                    if let Err(e) = inner.driver.disconnect().await {
                        warn!(connector = %inner.id, error = %e, "Error during disconnect");
                    }
                    inner.set_state(ConnectionState::Disconnected);
                    info!(connector = %inner.id, "Disconnected");
                }
                ConnectionState::ReconnectScheduled | ConnectionState::Disconnecting => {
                    inner.set_state(ConnectionState::Disconnected);
                }
                ConnectionState::Disconnected => {}
            }
        }

        inner.disconnecting.fetch_sub(1, Ordering::SeqCst);
    }

    /// Disconnect and make sure no timer revives the connector afterwards.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.disconnect().await;
    }

    /// Report that the live connection broke.
    ///
    /// Ignored while an intentional teardown is running and when the machine
    /// is already down or waiting on its retry timer, so a burst of errors
    /// arms a single timer. An error that raced with a newer successful
    /// connect belongs to the old connection and is ignored as well.
    pub async fn report_transport_error(&self, reason: &str) {
        let inner = &self.inner;
        let connection = inner.connections.load(Ordering::SeqCst);
        if self.is_disconnecting() || inner.current().is_settled_down() {
            debug!(connector = %inner.id, reason, "Ignoring transport error");
            return;
        }

        let _transition = inner.transition.lock().await;
        if self.is_disconnecting() || inner.current().is_settled_down() {
            debug!(connector = %inner.id, reason, "Ignoring transport error");
            return;
        }
        if inner.connections.load(Ordering::SeqCst) != connection {
            debug!(connector = %inner.id, reason, "Ignoring transport error from a previous connection");
            return;
        }

        warn!(connector = %inner.id, reason, "Transport error, connection lost");
        inner.fail_and_schedule().await;
    }

    /// Probe the destination through the driver without touching state.
    pub async fn test_connection(&self) -> Result<()> {
        self.inner.driver.test_connection().await
    }
}

impl Inner {
    fn current(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            // No receiver is fine.
            let _ = self.transitions.send(next);
            if !previous.can_transition_to(next) {
                debug!(connector = %self.id, from = %previous, to = %next, "Unexpected transition");
            }
            debug!(connector = %self.id, from = %previous, to = %next, "State changed");
        }
    }

    fn cancel_retry(&self) -> bool {
        let cancelled = self.retry.lock().cancel();
        if cancelled {
            debug!(connector = %self.id, "Cancelled pending reconnect");
        }
        cancelled
    }

    /// Run one connection attempt.
    ///
    /// `expected` is the retry generation when called from a timer; the
    /// attempt is dropped if that generation was invalidated meanwhile.
    async fn attempt_connect(self: &Arc<Self>, expected: Option<u64>) {
        if expected.is_none() {
            self.cancel_retry();
        }

        let _transition = self.transition.lock().await;

        match expected {
            Some(generation) => {
                let still_wanted = self.retry.lock().is_current(generation);
                if !still_wanted || self.stopped.load(Ordering::SeqCst) {
                    debug!(connector = %self.id, "Dropping stale reconnect");
                    return;
                }
            }
            None => {
                self.cancel_retry();
            }
        }

        if self.current().is_connected() {
            return;
        }

        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Connecting);

        match self.driver.connect().await {
            Ok(()) => {
                self.connections.fetch_add(1, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
                info!(connector = %self.id, "Connected");
            }
            Err(e) => {
                log_connect_error(&self.id, &e);
                self.fail_and_schedule().await;
            }
        }
    }

    /// Cleanup after a failure, then arm a retry when allowed.
    ///
    /// Must be called with the transition lock held.
    async fn fail_and_schedule(self: &Arc<Self>) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Disconnecting);
        if let Err(e) = self.driver.disconnect().await {
            debug!(connector = %self.id, error = %e, "Cleanup after failure failed");
        }
        self.set_state(ConnectionState::Disconnected);
        self.schedule_retry();
    }

    fn schedule_retry(self: &Arc<Self>) {
        if self.disconnecting.load(Ordering::SeqCst) > 0 {
            debug!(connector = %self.id, "Teardown in progress, not scheduling reconnect");
            return;
        }
        if !self.enabled.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst) {
            debug!(connector = %self.id, "Connector disabled, not scheduling reconnect");
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(self);
        let armed = self.retry.lock().arm(self.retry_interval, move |generation| {
            Inner::on_retry_timer(weak, generation)
        });

        match armed {
            Some(_) => {
                self.set_state(ConnectionState::ReconnectScheduled);
                info!(
                    connector = %self.id,
                    retry_in_ms = self.retry_interval.as_millis() as u64,
                    "Reconnect scheduled"
                );
            }
            None => debug!(connector = %self.id, "Reconnect already pending"),
        }
    }

    fn on_retry_timer(weak: Weak<Inner>, generation: u64) -> RetryFuture {
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.retry.lock().take_if_current(generation) {
                return;
            }
            inner.attempt_connect(Some(generation)).await;
        })
    }
}

fn log_connect_error(id: &str, error: &ConnectorError) {
    match error {
        ConnectorError::Configuration(_) => {
            warn!(connector = %id, error = %error, "Connection failed, bad configuration")
        }
        _ => warn!(connector = %id, error = %error, "Connection failed"),
    }
}
