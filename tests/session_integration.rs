//! Integration tests for PtySession against real pseudo-terminals.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webtty::close::CloseSignal;
use webtty::recording::{RecordingError, RecordingSink};
use webtty::session::{PtySession, SessionOptions};

const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

/// Read everything until end of stream using a buffer of `chunk` bytes.
async fn read_to_end(session: Arc<PtySession>, chunk: usize) -> String {
    let handle = tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; chunk];
        let mut out = Vec::new();
        loop {
            match session.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        String::from_utf8(out).expect("redacted output is valid UTF-8")
    });
    timeout(EXIT_TIMEOUT, handle)
        .await
        .expect("read should reach end of stream")
        .unwrap()
}

/// Read until `needle` shows up, returning what was read.
async fn read_until(session: Arc<PtySession>, needle: &'static str) -> String {
    let handle = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 1024];
        let mut out = String::new();
        while !out.contains(needle) {
            match session.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        out
    });
    timeout(EXIT_TIMEOUT, handle)
        .await
        .expect("output should arrive")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn output_is_redacted_line_by_line() {
    let session = PtySession::start(
        "/bin/sh",
        &sh("echo hello; echo password=hunter2; echo QUJDRA==; echo bye"),
        SessionOptions::default(),
    )
    .unwrap();

    let out = read_to_end(session.clone(), 4096).await;
    assert!(out.contains("hello"), "output: {out:?}");
    assert!(out.contains("bye"), "output: {out:?}");
    assert!(!out.contains("hunter2"), "output: {out:?}");
    assert!(!out.contains("QUJDRA=="), "output: {out:?}");
    assert_eq!(out.matches("[TRUNCATED]").count(), 2, "output: {out:?}");

    timeout(EXIT_TIMEOUT, session.wait()).await.unwrap();
    assert_eq!(session.exit_status(), Some(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn tiny_buffers_lose_nothing() {
    let script = "printf 'line one\\nmy password\\nh\\303\\251llo\\n'";
    let session = PtySession::start("/bin/sh", &sh(script), SessionOptions::default()).unwrap();

    let out = read_to_end(session, 3).await;
    assert_eq!(out, "line one\r\n[TRUNCATED]\r\nhéllo\r\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn read_returns_zero_after_exit() {
    let session = PtySession::start("/bin/sh", &sh("echo done"), SessionOptions::default())
        .unwrap();
    read_to_end(session.clone(), 4096).await;
    timeout(EXIT_TIMEOUT, session.wait()).await.unwrap();

    let again = tokio::task::spawn_blocking({
        let session = session.clone();
        move || {
            let mut buf = [0u8; 16];
            session.read(&mut buf)
        }
    })
    .await
    .unwrap();
    assert_eq!(again.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn write_reaches_command() {
    let session = PtySession::start("/bin/cat", &[], SessionOptions::default()).unwrap();
    session.write(b"ping-from-client\n").unwrap();
    let out = read_until(session.clone(), "ping-from-client").await;
    assert!(out.contains("ping-from-client"));

    timeout(EXIT_TIMEOUT, session.close()).await.unwrap().unwrap();
    assert!(session.has_exited());
}

#[tokio::test(flavor = "multi_thread")]
async fn resize_is_visible_to_command() {
    let session = PtySession::start(
        "/bin/sh",
        &sh("read _; stty size"),
        SessionOptions::default(),
    )
    .unwrap();
    session.resize(132, 43).unwrap();
    session.write(b"\n").unwrap();
    let out = read_to_end(session, 4096).await;
    assert!(out.contains("43 132"), "output: {out:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn close_without_escalation() {
    let options = SessionOptions {
        close_signal: CloseSignal::Int,
        close_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    let session = PtySession::start("/bin/sleep", &["30".to_string()], options).unwrap();

    let start = Instant::now();
    timeout(EXIT_TIMEOUT, session.close()).await.unwrap().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(session.has_exited());
}

#[tokio::test(flavor = "multi_thread")]
async fn close_escalates_when_signal_is_ignored() {
    let options = SessionOptions {
        close_signal: CloseSignal::Int,
        close_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let session = PtySession::start(
        "/bin/sh",
        &sh("trap '' INT; echo ready; sleep 30"),
        options,
    )
    .unwrap();
    read_until(session.clone(), "ready").await;

    let start = Instant::now();
    timeout(EXIT_TIMEOUT, session.close()).await.unwrap().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(session.has_exited());

    // A second close is a no-op.
    session.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_closes_all_return() {
    let options = SessionOptions {
        close_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let session = PtySession::start("/bin/cat", &[], options).unwrap();
    let closes: Vec<_> = (0..4)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.close().await })
        })
        .collect();
    for close in closes {
        timeout(EXIT_TIMEOUT, close).await.unwrap().unwrap().unwrap();
    }
}

struct ChannelSink(mpsc::UnboundedSender<String>);

impl RecordingSink for ChannelSink {
    fn push(&self, text: String) -> BoxFuture<'static, Result<(), RecordingError>> {
        let _ = self.0.send(text);
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_record_what_the_session_printed() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = SessionOptions {
        sink: Some(Arc::new(ChannelSink(tx))),
        ..Default::default()
    };
    let session = PtySession::start("/bin/cat", &[], options).unwrap();

    session.write(b"first\n").unwrap();
    read_until(session.clone(), "first").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.write(b"second\n").unwrap();

    let recorded = timeout(EXIT_TIMEOUT, rx.recv())
        .await
        .expect("a recording should be dispatched")
        .unwrap();
    assert!(recorded.contains("first"), "recorded: {recorded:?}");

    session.close().await.unwrap();
}
