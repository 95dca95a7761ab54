use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Process-wide admission counter for client connections.
///
/// The count lives in a watch channel so that [`ConnectionGate::wait`] can
/// sleep until it reaches zero without polling.
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    active: watch::Sender<usize>,
    max: Option<usize>,
    idle_timeout: Option<Duration>,
}

impl Default for ConnectionGate {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl ConnectionGate {
    pub fn new(max: Option<usize>, idle_timeout: Option<Duration>) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            inner: Arc::new(GateInner {
                active,
                max,
                idle_timeout,
            }),
        }
    }

    /// Admit a connection, returning an RAII guard that releases it on drop.
    ///
    /// Returns `None` once the maximum number of connections is active.
    pub fn increment(&self) -> Option<ConnectionGuard> {
        let max = self.inner.max;
        let admitted = self.inner.active.send_if_modified(|n| match max {
            Some(max) if *n >= max => false,
            _ => {
                *n += 1;
                true
            }
        });
        admitted.then(|| ConnectionGuard {
            inner: self.inner.clone(),
            released: false,
        })
    }

    pub fn count(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Resolve once no connection is active.
    pub async fn wait(&self) {
        let mut rx = self.inner.active.subscribe();
        // The sender lives in `self.inner`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// One admitted connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    inner: Arc<GateInner>,
    released: bool,
}

impl ConnectionGuard {
    /// Idle timer for this connection, if the gate has an idle timeout.
    pub fn idle_timer(&self) -> Option<IdleTimer> {
        self.inner.idle_timeout.map(IdleTimer::new)
    }

    pub fn release(mut self) {
        self.decrement();
    }

    fn decrement(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        self.inner.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.decrement();
    }
}

/// Fires when a connection has seen no activity for the idle timeout.
#[derive(Debug, Clone)]
pub struct IdleTimer {
    tx: Arc<watch::Sender<Instant>>,
    timeout: Duration,
}

impl IdleTimer {
    pub fn new(timeout: Duration) -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self {
            tx: Arc::new(tx),
            timeout,
        }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        self.tx.send_replace(Instant::now());
    }

    /// Wait until `timeout` has elapsed since the last activity.
    pub async fn expired(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let elapsed = rx.borrow_and_update().elapsed();
            if elapsed >= self.timeout {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.timeout - elapsed) => {}
                // Activity: loop to recompute the remaining time.
                _ = rx.changed() => {}
            }
        }
    }
}
