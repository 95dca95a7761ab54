//! webtty - share a terminal command over WebSocket
//!
//! Every WebSocket connection gets its own instance of the command, running
//! on a pseudo-terminal. Output is redacted line by line before it leaves the
//! server. SIGINT stops accepting connections and waits for open sessions;
//! a second SIGINT, or SIGTERM, closes them all.

use std::path::PathBuf;

use clap::Parser as ClapParser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webtty::{
    config::{Config, ConfigError, Overrides},
    server::{AppState, ServerError, WebttyServer},
    shutdown::{listen_for_signals, ShutdownOrchestrator},
};

/// webtty - share a terminal command over WebSocket
#[derive(ClapParser, Debug)]
#[command(name = "webtty", version, about, long_about = None)]
struct Cli {
    /// TOML config file (default: ~/.webtty.toml when present)
    #[arg(long, env = "WEBTTY_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to listen on
    #[arg(short = 'a', long, env = "WEBTTY_ADDRESS")]
    address: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long, env = "WEBTTY_PORT")]
    port: Option<u16>,

    /// Let clients write to the command
    #[arg(short = 'w', long, env = "WEBTTY_PERMIT_WRITE")]
    permit_write: bool,

    /// Maximum concurrent connections (0 for unlimited)
    #[arg(long, env = "WEBTTY_MAX_CONNECTION")]
    max_connection: Option<usize>,

    /// Accept only one client and exit when it disconnects
    #[arg(long, env = "WEBTTY_ONCE")]
    once: bool,

    /// Close idle connections after this many seconds (0 to disable)
    #[arg(long, env = "WEBTTY_TIMEOUT")]
    timeout: Option<u64>,

    /// TERM for the command
    #[arg(long, env = "WEBTTY_TERM")]
    term: Option<String>,

    /// Initial terminal width
    #[arg(long, env = "WEBTTY_WIDTH")]
    width: Option<u16>,

    /// Initial terminal height
    #[arg(long, env = "WEBTTY_HEIGHT")]
    height: Option<u16>,

    /// Signal sent to the command when a connection closes (name or number)
    #[arg(long, env = "WEBTTY_CLOSE_SIGNAL")]
    close_signal: Option<String>,

    /// Seconds to wait before SIGKILL after the close signal (negative waits forever)
    #[arg(long, env = "WEBTTY_CLOSE_TIMEOUT", allow_negative_numbers = true)]
    close_timeout: Option<i64>,

    /// Regular expression for allowed WebSocket origins (default: same host only)
    #[arg(long, env = "WEBTTY_WS_ORIGIN")]
    ws_origin: Option<String>,

    /// Require basic authentication with user:password
    #[arg(short = 'c', long, env = "WEBTTY_CREDENTIAL")]
    credential: Option<String>,

    /// Push recordings to this endpoint (enables recording)
    #[arg(long, env = "WEBTTY_RECORDING_URL")]
    recording_url: Option<String>,

    /// Command to run for each connection
    #[arg(required = true)]
    command: String,

    /// Arguments for the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            address: self.address.clone(),
            port: self.port,
            permit_write: self.permit_write,
            once: self.once,
            max_connections: self.max_connection,
            idle_timeout_secs: self.timeout,
            close_signal: self.close_signal.clone(),
            close_timeout_secs: self.close_timeout,
            term: self.term.clone(),
            rows: self.height,
            cols: self.width,
            recording_endpoint: self.recording_url.clone(),
            ws_origin: self.ws_origin.clone(),
            credential: self.credential.clone(),
        }
    }
}

#[derive(Error, Debug)]
pub enum WebttyError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), WebttyError> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = Config::resolve(cli.config.as_deref())?;
    config.apply(cli.overrides());
    let settings = config.validate()?;
    tracing::debug!(?settings, "configuration loaded");

    let state = AppState::new(cli.command.clone(), cli.args.clone(), settings);
    let graceful = state.graceful_token();
    let immediate = state.immediate_token();
    let server = WebttyServer::bind(state).await?;
    tracing::info!(
        addr = %server.local_addr()?,
        command = %cli.command,
        "webtty ready"
    );

    let signals = listen_for_signals()?;
    let orchestrator = ShutdownOrchestrator::new(
        move || graceful.cancel(),
        move || immediate.cancel(),
    );
    orchestrator.run(signals, server.run()).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "webtty=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
