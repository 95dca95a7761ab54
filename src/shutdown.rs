//! Process-wide shutdown state machine.
//!
//! The first graceful request stops the listener and lets open sessions
//! finish. Any further signal, or an immediate request, cancels every
//! connection. Either way the orchestrator returns only once the server
//! future has completed.

use std::future::Future;

use tokio::sync::{mpsc, watch};

/// Shown once the first graceful request has been handled.
pub const GRACEFUL_NOTICE: &str =
    "waiting for open sessions to close, send the signal again to stop immediately";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Graceful,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    GracefulRequested,
    ForceRequested,
    Terminated,
}

pub struct ShutdownOrchestrator<G, I> {
    graceful_stop: Option<G>,
    immediate_stop: Option<I>,
    state: watch::Sender<ShutdownState>,
}

impl<G, I> ShutdownOrchestrator<G, I>
where
    G: FnOnce(),
    I: FnOnce(),
{
    pub fn new(graceful_stop: G, immediate_stop: I) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            graceful_stop: Some(graceful_stop),
            immediate_stop: Some(immediate_stop),
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    fn advance(&self, next: ShutdownState) {
        self.state.send_if_modified(|state| {
            if next > *state {
                tracing::debug!(from = ?state, to = ?next, "shutdown state");
                *state = next;
                true
            } else {
                false
            }
        });
    }

    /// Drive `server` to completion while reacting to termination signals.
    ///
    /// Returns the server's own result. A closed signal channel only means
    /// no further signals will arrive.
    pub async fn run<F, E>(
        mut self,
        mut signals: mpsc::Receiver<TerminationSignal>,
        server: F,
    ) -> Result<(), E>
    where
        F: Future<Output = Result<(), E>>,
    {
        tokio::pin!(server);
        let mut listening = true;

        loop {
            tokio::select! {
                biased;

                result = &mut server => {
                    self.advance(ShutdownState::Terminated);
                    return result;
                }
                signal = signals.recv(), if listening => match signal {
                    None => listening = false,
                    Some(TerminationSignal::Graceful) if self.state() == ShutdownState::Running => {
                        tracing::info!(notice = GRACEFUL_NOTICE, "graceful stop requested");
                        if let Some(stop) = self.graceful_stop.take() {
                            stop();
                        }
                        self.advance(ShutdownState::GracefulRequested);
                        eprintln!("webtty: {GRACEFUL_NOTICE}");
                    }
                    Some(signal) => {
                        tracing::info!(?signal, "immediate stop requested");
                        if let Some(stop) = self.immediate_stop.take() {
                            stop();
                        }
                        self.advance(ShutdownState::ForceRequested);
                        let result = server.await;
                        self.advance(ShutdownState::Terminated);
                        return result;
                    }
                },
            }
        }
    }
}

/// Map SIGINT to a graceful request and SIGTERM to an immediate one.
#[cfg(unix)]
pub fn listen_for_signals() -> std::io::Result<mpsc::Receiver<TerminationSignal>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                Some(()) = interrupt.recv() => TerminationSignal::Graceful,
                Some(()) = terminate.recv() => TerminationSignal::Immediate,
                else => break,
            };
            if tx.send(next).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}
