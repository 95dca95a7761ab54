//! WebSocket transport driving one [`PtySession`] per connection.
//!
//! Binary frames are raw input. Text frames carry JSON control messages:
//! `{"type":"input","data":"..."}` or `{"type":"resize","cols":80,"rows":24}`.
//! Output is sent as binary frames.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::auth::{check_ws_origin, require_basic_auth};
use crate::config::Settings;
use crate::gate::{ConnectionGate, IdleTimer};
use crate::session::PtySession;

const OUTPUT_CHUNK: usize = 4096;
const PUMP_CAPACITY: usize = 64;
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTTING_DOWN: (u16, &str) = (close_code::AWAY, "server shutting down");

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct AppState {
    command: Arc<str>,
    args: Arc<[String]>,
    settings: Arc<Settings>,
    gate: ConnectionGate,
    graceful: CancellationToken,
    immediate: CancellationToken,
    once_used: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(command: String, args: Vec<String>, settings: Settings) -> Self {
        let gate = ConnectionGate::new(settings.max_connections, settings.idle_timeout);
        Self {
            command: command.into(),
            args: args.into(),
            settings: Arc::new(settings),
            gate,
            graceful: CancellationToken::new(),
            immediate: CancellationToken::new(),
            once_used: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn gate(&self) -> &ConnectionGate {
        &self.gate
    }

    /// Cancelling this stops accepting new connections.
    pub fn graceful_token(&self) -> CancellationToken {
        self.graceful.clone()
    }

    /// Cancelling this also closes every open connection.
    pub fn immediate_token(&self) -> CancellationToken {
        self.immediate.clone()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.gate.count(),
    })
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

pub fn router(state: AppState) -> Router {
    let mut ws_route = get(ws);
    if let Some(credential) = state.settings.credential.clone() {
        tracing::info!("using basic authentication");
        ws_route = ws_route.layer(middleware::from_fn(move |req, next| {
            require_basic_auth(credential.clone(), req, next)
        }));
    }
    let origin = state.settings.ws_origin.clone();
    ws_route = ws_route.layer(middleware::from_fn(move |req, next| {
        check_ws_origin(origin.clone(), req, next)
    }));

    Router::new()
        .route("/health", get(health))
        .route("/ws", ws_route)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let span = tracing::info_span!("connection", session = %uuid::Uuid::new_v4());
    ws.on_upgrade(move |socket| handle_ws(socket, state).instrument(span))
}

async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    tracing::info!(code, reason, "rejecting connection");
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let settings = &state.settings;
    if settings.once && state.once_used.swap(true, Ordering::AcqRel) {
        return reject(socket, close_code::AGAIN, "server accepts a single connection").await;
    }
    let Some(guard) = state.gate.increment() else {
        return reject(socket, close_code::AGAIN, "too many connections").await;
    };

    let session = match PtySession::start(&state.command, &state.args, settings.session_options()) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "failed to start session");
            drop(guard);
            if settings.once {
                state.graceful.cancel();
            }
            return reject(socket, close_code::ERROR, "failed to start command").await;
        }
    };
    tracing::info!(pid = ?session.pid(), active = state.gate.count(), "connection opened");

    let idle = guard.idle_timer();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(PUMP_CAPACITY);
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(PUMP_CAPACITY);
    spawn_output_pump(session.clone(), output_tx);
    spawn_input_pump(session.clone(), input_rx);

    let immediate = &state.immediate;
    let (code, reason) = loop {
        tokio::select! {
            output = output_rx.recv() => match output {
                Some(data) => {
                    touch(&idle);
                    match immediate.run_until_cancelled(ws_tx.send(Message::Binary(data))).await {
                        Some(Ok(())) => {}
                        Some(Err(_)) => break (close_code::NORMAL, "client gone"),
                        None => break SHUTTING_DOWN,
                    }
                }
                None => break (close_code::NORMAL, "session ended"),
            },

            msg = ws_rx.next() => {
                let input = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(ClientMessage::Input { data }) => Bytes::from(data),
                        Ok(ClientMessage::Resize { cols, rows }) => {
                            if let Err(e) = session.resize(cols, rows) {
                                tracing::debug!(error = %e, cols, rows, "resize failed");
                            }
                            continue;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "ignoring malformed message");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break (close_code::NORMAL, "client closed"),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket receive failed");
                        break (close_code::NORMAL, "client gone");
                    }
                };
                match forward_input(settings.permit_write, &idle, &input_tx, immediate, input).await {
                    Forward::Sent => {}
                    Forward::SessionClosed => break (close_code::NORMAL, "session ended"),
                    Forward::Cancelled => break SHUTTING_DOWN,
                }
            },

            _ = idle_expired(&idle) => {
                tracing::info!("closing idle connection");
                break (close_code::NORMAL, "idle timeout");
            }

            _ = immediate.cancelled() => break SHUTTING_DOWN,
        }
    };
    if (code, reason) == SHUTTING_DOWN {
        tracing::debug!("connection cancelled by shutdown");
    }

    drop(input_tx);
    drop(output_rx);
    if let Err(e) = session.close().await {
        tracing::error!(pid = ?session.pid(), error = %e, "failed to close session");
    }
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let goodbye = async {
        ws_tx.send(Message::Close(Some(frame))).await?;
        ws_tx.flush().await
    };
    match tokio::time::timeout(CLOSE_FRAME_TIMEOUT, goodbye).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "failed to send close frame"),
        Err(_) => tracing::debug!("client did not take the close frame in time"),
    }

    tracing::info!(
        pid = ?session.pid(),
        exit_status = ?session.exit_status(),
        reason,
        "connection closed"
    );
    drop(guard);
    if settings.once {
        state.graceful.cancel();
    }
}

fn touch(idle: &Option<IdleTimer>) {
    if let Some(timer) = idle {
        timer.touch();
    }
}

async fn idle_expired(idle: &Option<IdleTimer>) {
    match idle {
        Some(timer) => timer.expired().await,
        None => std::future::pending().await,
    }
}

enum Forward {
    Sent,
    SessionClosed,
    Cancelled,
}

/// Queue client input for the session. Read-only sessions drop it.
async fn forward_input(
    permit_write: bool,
    idle: &Option<IdleTimer>,
    input_tx: &mpsc::Sender<Bytes>,
    immediate: &CancellationToken,
    data: Bytes,
) -> Forward {
    if !permit_write {
        tracing::trace!(len = data.len(), "dropping input on read-only session");
        return Forward::Sent;
    }
    touch(idle);
    match immediate.run_until_cancelled(input_tx.send(data)).await {
        Some(Ok(())) => Forward::Sent,
        Some(Err(_)) => Forward::SessionClosed,
        None => Forward::Cancelled,
    }
}

fn spawn_output_pump(session: Arc<PtySession>, tx: mpsc::Sender<Bytes>) {
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut buf = [0u8; OUTPUT_CHUNK];
            loop {
                match session.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "session read failed");
                        break;
                    }
                }
            }
        }));
        if let Err(e) = result {
            tracing::error!("output pump panicked: {:?}", e);
        }
    });
}

fn spawn_input_pump(session: Arc<PtySession>, mut rx: mpsc::Receiver<Bytes>) {
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            while let Some(data) = rx.blocking_recv() {
                if let Err(e) = session.write(&data) {
                    tracing::debug!(error = %e, "session write failed");
                    break;
                }
            }
        }));
        if let Err(e) = result {
            tracing::error!("input pump panicked: {:?}", e);
        }
    });
}

pub struct WebttyServer {
    listener: TcpListener,
    state: AppState,
}

impl WebttyServer {
    pub async fn bind(state: AppState) -> Result<Self, ServerError> {
        let addr = state.settings.bind.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until the graceful token stops the listener or the immediate
    /// token aborts it, then wait for every open connection to close.
    pub async fn run(self) -> Result<(), ServerError> {
        let state = self.state;
        let graceful = state.graceful.clone();
        let immediate = state.immediate.clone();
        let gate = state.gate.clone();
        let app = router(state);

        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "listening");
        }

        let stop = {
            let graceful = graceful.clone();
            let immediate = immediate.clone();
            async move {
                tokio::select! {
                    _ = graceful.cancelled() => {}
                    _ = immediate.cancelled() => {}
                }
            }
        };
        let serve = axum::serve(self.listener, app)
            .with_graceful_shutdown(stop)
            .into_future();

        let result = tokio::select! {
            result = serve => result.map_err(ServerError::Serve),
            _ = immediate.cancelled() => {
                tracing::info!("listener aborted");
                Ok(())
            }
        };
        if result.is_err() {
            immediate.cancel();
        }

        let open = gate.count();
        if open > 0 {
            tracing::info!(open, "waiting for open connections to close");
        }
        gate.wait().await;
        tracing::info!("server stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> AppState {
        let settings = crate::config::Config::default().validate().unwrap();
        AppState::new("/bin/cat".into(), vec![], settings)
    }

    #[tokio::test]
    async fn health_reports_connections() {
        let state = state();
        let _guard = state.gate().increment().unwrap();
        let resp = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 1);
    }

    #[tokio::test]
    async fn ws_requires_upgrade() {
        let resp = router(state())
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[test]
    fn parses_client_messages() {
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"input","data":"ls\n"}"#).unwrap(),
            ClientMessage::Input { data: "ls\n".into() }
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"resize","cols":100,"rows":30}"#)
                .unwrap(),
            ClientMessage::Resize { cols: 100, rows: 30 }
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#).is_err());
    }

    #[tokio::test]
    async fn run_returns_after_graceful_stop() {
        let mut settings = crate::config::Config::default().validate().unwrap();
        settings.bind = "127.0.0.1:0".into();
        let server = WebttyServer::bind(AppState::new("/bin/cat".into(), vec![], settings))
            .await
            .unwrap();
        let graceful = server.state().graceful_token();
        let run = tokio::spawn(server.run());
        graceful.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bind_failure_names_address() {
        let mut settings = crate::config::Config::default().validate().unwrap();
        settings.bind = "256.0.0.1:1".into();
        let err = WebttyServer::bind(AppState::new("/bin/cat".into(), vec![], settings))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Bind { ref addr, .. } if addr == "256.0.0.1:1"));
    }
}
