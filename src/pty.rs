use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command `{command}`: {source}")]
    SpawnCommand {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("no tokio runtime available: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

/// Rows and columns of a terminal window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<WindowSize> for PtySize {
    fn from(size: WindowSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// A freshly spawned child and the master side of its terminal.
///
/// The slave side is closed in this process as soon as the child holds it,
/// so reads on the master end with EOF or `EIO` once the child (and anything
/// it forked onto the terminal) is gone.
pub struct SpawnedPty {
    pub master: Box<dyn MasterPty + Send>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

impl std::fmt::Debug for SpawnedPty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedPty")
            .field("pid", &self.child.process_id())
            .finish_non_exhaustive()
    }
}

pub fn build_command(command: &str, argv: &[String], term: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(command);
    cmd.args(argv);
    // portable-pty defaults to $HOME; keep the server's working directory.
    if let Ok(dir) = std::env::current_dir() {
        cmd.cwd(dir);
    }
    cmd.env("TERM", term);
    cmd
}

/// Allocate a pseudo-terminal and start `command` on it.
///
/// If anything fails after the child started, the child is killed and reaped
/// before the error is returned.
pub fn spawn(
    command: &str,
    argv: &[String],
    size: WindowSize,
    term: &str,
) -> Result<SpawnedPty, SpawnError> {
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(size.into()).map_err(SpawnError::OpenPty)?;

    let cmd = build_command(command, argv, term);
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|source| SpawnError::SpawnCommand {
            command: command.to_string(),
            source,
        })?;
    drop(pair.slave);

    let handles = pair
        .master
        .try_clone_reader()
        .map_err(SpawnError::CloneReader)
        .and_then(|reader| {
            let writer = pair.master.take_writer().map_err(SpawnError::TakeWriter)?;
            Ok((reader, writer))
        });

    match handles {
        Ok((reader, writer)) => Ok(SpawnedPty {
            master: pair.master,
            reader,
            writer,
            child,
        }),
        Err(e) => {
            tracing::warn!(command, "pty setup failed after spawn, killing child");
            let _ = child.kill();
            let _ = child.wait();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_reports_missing_command() {
        let err = spawn(
            "/definitely/not/a/real/binary",
            &[],
            WindowSize::default(),
            "xterm",
        )
        .unwrap_err();
        assert!(
            matches!(err, SpawnError::SpawnCommand { ref command, .. } if command == "/definitely/not/a/real/binary"),
            "got: {err:?}"
        );
    }

    #[test]
    fn spawned_child_output_reaches_master() {
        let mut pty = spawn(
            "/bin/sh",
            &["-c".to_string(), "echo pty-spawn-ok".to_string()],
            WindowSize::default(),
            "xterm",
        )
        .expect("spawn should succeed");

        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match pty.reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
            if String::from_utf8_lossy(&collected).contains("pty-spawn-ok") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("pty-spawn-ok"));
        let status = pty.child.wait().expect("wait should succeed");
        assert!(status.success());
    }

    #[test]
    fn window_size_converts_to_pty_size() {
        let size: PtySize = WindowSize { rows: 40, cols: 120 }.into();
        assert_eq!((size.rows, size.cols, size.pixel_width), (40, 120, 0));
    }
}
