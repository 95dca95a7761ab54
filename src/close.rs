//! Escalating termination of a session's process.
//!
//! Closing first delivers the configured soft signal, then waits for the
//! process to exit. If it is still alive when the close timeout elapses the
//! whole process group gets `SIGKILL`. Each signal is delivered at most once
//! per controller, however many callers close concurrently.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseSignal {
    Hup,
    Int,
    Quit,
    Term,
    Kill,
    Usr1,
    Usr2,
    Other(i32),
}

impl CloseSignal {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
            Self::Other(n) => n,
        }
    }

    fn from_raw(n: i32) -> Self {
        match n {
            libc::SIGHUP => Self::Hup,
            libc::SIGINT => Self::Int,
            libc::SIGQUIT => Self::Quit,
            libc::SIGTERM => Self::Term,
            libc::SIGKILL => Self::Kill,
            libc::SIGUSR1 => Self::Usr1,
            libc::SIGUSR2 => Self::Usr2,
            n => Self::Other(n),
        }
    }
}

impl FromStr for CloseSignal {
    type Err = ConfigError;

    /// Accepts `INT`, `SIGINT`, `int` or a signal number in `1..=64`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(n) = trimmed.parse::<i32>() {
            return if (1..=64).contains(&n) {
                Ok(Self::from_raw(n))
            } else {
                Err(ConfigError::InvalidSignal(s.to_string()))
            };
        }
        let upper = trimmed.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "HUP" => Ok(Self::Hup),
            "INT" => Ok(Self::Int),
            "QUIT" => Ok(Self::Quit),
            "TERM" => Ok(Self::Term),
            "KILL" => Ok(Self::Kill),
            "USR1" => Ok(Self::Usr1),
            "USR2" => Ok(Self::Usr2),
            _ => Err(ConfigError::InvalidSignal(s.to_string())),
        }
    }
}

impl fmt::Display for CloseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hup => f.write_str("SIGHUP"),
            Self::Int => f.write_str("SIGINT"),
            Self::Quit => f.write_str("SIGQUIT"),
            Self::Term => f.write_str("SIGTERM"),
            Self::Kill => f.write_str("SIGKILL"),
            Self::Usr1 => f.write_str("SIGUSR1"),
            Self::Usr2 => f.write_str("SIGUSR2"),
            Self::Other(n) => write!(f, "signal {n}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("failed to deliver {signal} to process group {pid}: {source}")]
    Delivery {
        signal: CloseSignal,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("pid {0} cannot be signalled")]
    InvalidPid(u32),
}

/// Delivers signals to a session's process.
pub trait Signaler: Send + Sync {
    fn signal(&self, signal: CloseSignal) -> Result<(), SignalError>;
}

/// Signals the child's whole process group with `kill(2)`.
///
/// The child leads its own group (portable-pty calls `setsid`), so negating
/// the pid reaches everything it started on the terminal. Once the exit
/// watcher has set `exited` nothing is sent, so a recycled pid is never hit.
#[derive(Debug, Clone)]
pub struct ProcessGroupSignaler {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
}

impl ProcessGroupSignaler {
    pub fn new(pid: Option<u32>, exited: Arc<AtomicBool>) -> Self {
        Self { pid, exited }
    }
}

impl Signaler for ProcessGroupSignaler {
    fn signal(&self, signal: CloseSignal) -> Result<(), SignalError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if pid == 0 || pid > i32::MAX as u32 {
            return Err(SignalError::InvalidPid(pid));
        }
        if self.exited.load(Ordering::Acquire) {
            tracing::debug!(pid, %signal, "child already exited, skipping signal");
            return Ok(());
        }
        // SAFETY: kill has no memory-safety preconditions.
        let rc = unsafe { libc::kill(-(pid as i32), signal.as_raw()) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            tracing::debug!(pid, %signal, "process group already gone");
            return Ok(());
        }
        Err(SignalError::Delivery {
            signal,
            pid,
            source: err,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    Idle,
    SignalSent,
    Escalating,
    Done,
}

/// Per-session close protocol.
pub struct CloseController<S> {
    signaler: S,
    close_signal: CloseSignal,
    timeout: Option<Duration>,
    exited: CancellationToken,
    state: Mutex<CloseState>,
}

impl<S: Signaler> CloseController<S> {
    /// `exited` must be cancelled exactly when the process has been reaped.
    /// A `timeout` of `None` never escalates to `SIGKILL`.
    pub fn new(
        signaler: S,
        close_signal: CloseSignal,
        timeout: Option<Duration>,
        exited: CancellationToken,
    ) -> Self {
        Self {
            signaler,
            close_signal,
            timeout,
            exited,
            state: Mutex::new(CloseState::Idle),
        }
    }

    pub fn state(&self) -> CloseState {
        *self.state.lock()
    }

    pub fn signaler(&self) -> &S {
        &self.signaler
    }

    /// Terminate the process and resolve once it has exited.
    ///
    /// Safe to call any number of times from any number of tasks. Only a
    /// failed `SIGKILL` is reported; a failed soft signal is logged and the
    /// timeout still applies.
    pub async fn close(&self) -> Result<(), SignalError> {
        if self.exited.is_cancelled() {
            *self.state.lock() = CloseState::Done;
            return Ok(());
        }

        let send_soft = {
            let mut state = self.state.lock();
            if *state == CloseState::Idle {
                *state = CloseState::SignalSent;
                true
            } else {
                false
            }
        };
        if send_soft {
            tracing::debug!(signal = %self.close_signal, "sending close signal");
            if let Err(e) = self.signaler.signal(self.close_signal) {
                tracing::warn!(error = %e, "close signal failed");
            }
        }

        if let Some(timeout) = self.timeout {
            tokio::select! {
                _ = self.exited.cancelled() => {}
                _ = tokio::time::sleep(timeout) => self.escalate(timeout)?,
            }
        }

        self.exited.cancelled().await;
        *self.state.lock() = CloseState::Done;
        Ok(())
    }

    fn escalate(&self, timeout: Duration) -> Result<(), SignalError> {
        {
            let mut state = self.state.lock();
            if *state != CloseState::SignalSent {
                return Ok(());
            }
            *state = CloseState::Escalating;
        }
        if self.exited.is_cancelled() {
            return Ok(());
        }
        tracing::warn!(
            signal = %self.close_signal,
            timeout_ms = timeout.as_millis() as u64,
            "process ignored close signal, sending SIGKILL"
        );
        self.signaler.signal(CloseSignal::Kill)
    }
}
