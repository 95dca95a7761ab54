//! Best-effort recording of what a session's input produced.
//!
//! After every write the current terminal state is captured, compared with
//! the state captured after the previous write, and the new suffix is
//! redacted and pushed to a [`RecordingSink`] on a detached task. Pushes are
//! unordered and never block or fail the write that triggered them.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::runtime::Handle;

use crate::sanitize::Sanitizer;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("recording request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("recording endpoint answered {0}")]
    Status(StatusCode),
}

/// Destination for recording diffs.
pub trait RecordingSink: Send + Sync {
    fn push(&self, text: String) -> BoxFuture<'static, Result<(), RecordingError>>;
}

/// POSTs each diff as the raw request body to `{endpoint}/recording/{hostname}`.
#[derive(Debug, Clone)]
pub struct HttpRecordingSink {
    client: reqwest::Client,
    url: String,
}

impl HttpRecordingSink {
    /// An endpoint given without a scheme is reached over `https://`.
    pub fn new(endpoint: &str, hostname: String) -> Result<Self, RecordingError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: recording_url(endpoint, &hostname),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn recording_url(endpoint: &str, hostname: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.contains("://") {
        format!("{base}/recording/{hostname}")
    } else {
        format!("https://{base}/recording/{hostname}")
    }
}

impl RecordingSink for HttpRecordingSink {
    fn push(&self, text: String) -> BoxFuture<'static, Result<(), RecordingError>> {
        let request = self.client.post(&self.url).body(text);
        Box::pin(async move {
            let resp = request.send().await?;
            let status = resp.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(RecordingError::Status(status))
            }
        })
    }
}

/// Source of the "full output state" that recording diffs are computed from.
pub trait TerminalState: Send + Sync {
    fn capture(&self) -> String;

    /// Called with every chunk of raw output read from the terminal.
    fn observe(&self, _output: &str) {}
}

/// Bounded in-process copy of everything the session printed.
///
/// When the limit is exceeded the oldest half is dropped, so the next
/// capture no longer extends the previous one and is recorded whole.
#[derive(Debug)]
pub struct Transcript {
    text: Mutex<String>,
    limit: usize,
}

impl Transcript {
    pub fn new(limit: usize) -> Self {
        Self {
            text: Mutex::new(String::new()),
            limit,
        }
    }
}

impl TerminalState for Transcript {
    fn capture(&self) -> String {
        self.text.lock().clone()
    }

    fn observe(&self, output: &str) {
        let mut text = self.text.lock();
        text.push_str(output);
        if text.len() > self.limit {
            let mut cut = text.len() - self.limit / 2;
            while !text.is_char_boundary(cut) {
                cut += 1;
            }
            text.drain(..cut);
        }
    }
}

/// The visible contents of the current tmux pane.
#[derive(Debug, Default)]
pub struct TmuxPane;

impl TerminalState for TmuxPane {
    fn capture(&self) -> String {
        match std::process::Command::new("tmux")
            .args(["capture-pane", "-p"])
            .output()
        {
            Ok(out) if out.status.success() => {
                pane_without_prompt(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                tracing::warn!(status = %out.status, "tmux capture-pane failed");
                String::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to run tmux capture-pane");
                String::new()
            }
        }
    }
}

/// Trailing blank lines and the last (prompt) line are not part of the state.
fn pane_without_prompt(pane: &str) -> String {
    let trimmed = pane.trim_end_matches('\n');
    match trimmed.rfind('\n') {
        Some(idx) => trimmed[..idx].to_string(),
        None => String::new(),
    }
}

/// Which [`TerminalState`] a new session gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
    Transcript { limit: usize },
    Tmux,
}

impl Default for StateSource {
    fn default() -> Self {
        Self::Transcript { limit: 64 * 1024 }
    }
}

impl StateSource {
    pub fn build(self) -> Arc<dyn TerminalState> {
        match self {
            Self::Transcript { limit } => Arc::new(Transcript::new(limit)),
            Self::Tmux => Arc::new(TmuxPane),
        }
    }
}

/// The part of `new` that was added since `prev`, or all of `new` when it
/// does not extend `prev`.
pub fn recording_diff<'a>(prev: &str, new: &'a str) -> &'a str {
    new.strip_prefix(prev).unwrap_or(new)
}

/// Per-session recording state.
pub struct InputRecorder {
    state: Arc<dyn TerminalState>,
    sink: Option<Arc<dyn RecordingSink>>,
    sanitizer: Arc<Sanitizer>,
    previous: Mutex<String>,
    runtime: Handle,
}

impl InputRecorder {
    pub fn new(
        state: Arc<dyn TerminalState>,
        sink: Option<Arc<dyn RecordingSink>>,
        sanitizer: Arc<Sanitizer>,
        runtime: Handle,
    ) -> Self {
        Self {
            state,
            sink,
            sanitizer,
            previous: Mutex::new(String::new()),
            runtime,
        }
    }

    pub fn observe_output(&self, output: &str) {
        self.state.observe(output);
    }

    /// Capture, diff and dispatch. Never blocks on the sink.
    pub fn record(&self) {
        let current = self.state.capture();
        let diff = {
            let mut previous = self.previous.lock();
            let diff = self.sanitizer.redact(recording_diff(&previous, &current));
            *previous = current;
            diff
        };
        if diff.is_empty() {
            return;
        }
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let len = diff.len();
        self.runtime.spawn(async move {
            match sink.push(diff).await {
                Ok(()) => tracing::trace!(len, "recording pushed"),
                Err(e) => tracing::warn!(error = %e, "failed to push recording"),
            }
        });
    }
}
