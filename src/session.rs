//! A command running on a pseudo-terminal, shared by the tasks that pump
//! its input and output.
//!
//! Every session owns one exit watcher on the blocking pool. The watcher is
//! the only code that releases the terminal handle, and it does so only after
//! the child has been reaped. Everything else (`read`, `write`, `resize`,
//! `close`) may run concurrently from any thread.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{MasterPty, PtySize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::close::{CloseController, CloseSignal, ProcessGroupSignaler, SignalError, Signaler};
use crate::pty::{self, SpawnError, SpawnedPty, WindowSize};
use crate::recording::{InputRecorder, RecordingSink, StateSource, TerminalState};
use crate::sanitize::Sanitizer;

const READ_CHUNK: usize = 4096;

/// Per-session settings.
#[derive(Clone)]
pub struct SessionOptions {
    pub close_signal: CloseSignal,
    /// `None` never escalates to `SIGKILL`.
    pub close_timeout: Option<Duration>,
    pub term: String,
    pub size: WindowSize,
    pub sanitizer: Arc<Sanitizer>,
    /// Recording is disabled when there is no sink.
    pub sink: Option<Arc<dyn RecordingSink>>,
    pub state: Arc<dyn TerminalState>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            close_signal: CloseSignal::Int,
            close_timeout: Some(Duration::from_secs(10)),
            term: "xterm-256color".to_string(),
            size: WindowSize::default(),
            sanitizer: Arc::new(Sanitizer::default()),
            sink: None,
            state: StateSource::default().build(),
        }
    }
}

/// Master side and writer of the terminal. Released by the exit watcher.
struct TerminalHandle {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
}

impl TerminalHandle {
    fn release(&self) {
        self.writer.lock().take();
        self.master.lock().take();
    }
}

struct ReadSide {
    reader: Box<dyn Read + Send>,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    undecoded: Vec<u8>,
    /// Redacted output that did not fit into the caller's buffer.
    pending: Vec<u8>,
    eof: bool,
}

pub struct PtySession {
    command: String,
    argv: Vec<String>,
    pid: Option<u32>,
    terminal: Arc<TerminalHandle>,
    read_side: Mutex<ReadSide>,
    sanitizer: Arc<Sanitizer>,
    recorder: InputRecorder,
    close: CloseController<ProcessGroupSignaler>,
    child_exited: Arc<AtomicBool>,
    exited: CancellationToken,
    exit_status: Arc<Mutex<Option<u32>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("exited", &self.exited.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Spawn `command` on a new pseudo-terminal and start its exit watcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        command: &str,
        argv: &[String],
        options: SessionOptions,
    ) -> Result<Arc<Self>, SpawnError> {
        let runtime = Handle::try_current()?;
        let SpawnedPty {
            master,
            reader,
            writer,
            mut child,
        } = pty::spawn(command, argv, options.size, &options.term)?;

        let pid = child.process_id();
        let child_exited = Arc::new(AtomicBool::new(false));
        let exited = CancellationToken::new();
        let exit_status = Arc::new(Mutex::new(None));
        let terminal = Arc::new(TerminalHandle {
            master: Mutex::new(Some(master)),
            writer: Mutex::new(Some(writer)),
        });

        let watcher = {
            let child_exited = child_exited.clone();
            let exited = exited.clone();
            let exit_status = exit_status.clone();
            let terminal = terminal.clone();
            runtime.spawn_blocking(move || {
                let result =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| child.wait()));
                let code = match result {
                    Ok(Ok(status)) => {
                        tracing::debug!(?pid, ?status, "session child exited");
                        Some(status.exit_code())
                    }
                    Ok(Err(e)) => {
                        tracing::error!(?pid, error = %e, "error waiting for session child");
                        None
                    }
                    Err(e) => {
                        tracing::error!(?pid, "child exit watcher panicked: {:?}", e);
                        None
                    }
                };
                child_exited.store(true, Ordering::Release);
                *exit_status.lock() = code;
                terminal.release();
                exited.cancel();
            })
        };

        let close = CloseController::new(
            ProcessGroupSignaler::new(pid, child_exited.clone()),
            options.close_signal,
            options.close_timeout,
            exited.clone(),
        );
        let recorder = InputRecorder::new(
            options.state,
            options.sink,
            options.sanitizer.clone(),
            runtime,
        );

        tracing::info!(?pid, command, "session started");

        Ok(Arc::new(Self {
            command: command.to_string(),
            argv: argv.to_vec(),
            pid,
            terminal,
            read_side: Mutex::new(ReadSide {
                reader,
                undecoded: Vec::new(),
                pending: Vec::new(),
                eof: false,
            }),
            sanitizer: options.sanitizer,
            recorder,
            close,
            child_exited,
            exited,
            exit_status,
            watcher: Mutex::new(Some(watcher)),
        }))
    }

    /// Read redacted output. Blocks until output is available.
    ///
    /// Returns `Ok(0)` once the child has exited and all of its output has
    /// been delivered.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut side = self.read_side.lock();
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            if !side.pending.is_empty() {
                let n = buf.len().min(side.pending.len());
                buf[..n].copy_from_slice(&side.pending[..n]);
                side.pending.drain(..n);
                return Ok(n);
            }
            if side.eof {
                return Ok(0);
            }

            match side.reader.read(&mut scratch) {
                Ok(0) => self.finish_reading(&mut side),
                Ok(n) => {
                    side.undecoded.extend_from_slice(&scratch[..n]);
                    let split = side.undecoded.len() - incomplete_tail_len(&side.undecoded);
                    let tail = side.undecoded.split_off(split);
                    let complete = std::mem::replace(&mut side.undecoded, tail);
                    self.push_output(&mut side, &complete);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Linux reports a hung-up terminal as EIO rather than EOF.
                Err(e) if e.raw_os_error() == Some(libc::EIO) => self.finish_reading(&mut side),
                Err(e) => return Err(e),
            }
        }
    }

    fn push_output(&self, side: &mut ReadSide, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(bytes);
        self.recorder.observe_output(&text);
        side.pending
            .extend_from_slice(self.sanitizer.redact(&text).as_bytes());
    }

    fn finish_reading(&self, side: &mut ReadSide) {
        side.eof = true;
        let rest = std::mem::take(&mut side.undecoded);
        self.push_output(side, &rest);
    }

    /// Forward input verbatim, then record what it produced.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        {
            let mut writer = self.terminal.writer.lock();
            let writer = writer
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "terminal closed"))?;
            writer.write_all(buf)?;
            writer.flush()?;
        }
        self.recorder.record();
        Ok(buf.len())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let master = self.terminal.master.lock();
        let master = master
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session has exited"))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(io::Error::other)
    }

    /// Terminate the child and resolve once it has exited. Idempotent.
    pub async fn close(&self) -> Result<(), SignalError> {
        self.close.close().await
    }

    /// Resolve once the exit watcher has finished.
    pub async fn wait(&self) {
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                tracing::error!(pid = ?self.pid, error = %e, "exit watcher task failed");
            }
        }
        self.exited.cancelled().await;
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Token cancelled once the child has exited.
    pub fn exit_token(&self) -> CancellationToken {
        self.exited.clone()
    }

    pub fn exit_status(&self) -> Option<u32> {
        *self.exit_status.lock()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if !self.child_exited.load(Ordering::Acquire) {
            tracing::debug!(pid = ?self.pid, "session dropped with live child, killing");
            if let Err(e) = self.close.signaler().signal(CloseSignal::Kill) {
                tracing::warn!(error = %e, "failed to kill session child");
            }
        }
    }
}

/// Length of an incomplete UTF-8 sequence at the end of `bytes`.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let b = bytes[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return 0,
        };
        let have = bytes.len() - i;
        return if have < width { have } else { 0 };
    }
    0
}
