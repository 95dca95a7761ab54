pub mod auth;
pub mod close;
pub mod config;
pub mod gate;
pub mod pty;
pub mod recording;
pub mod sanitize;
pub mod server;
pub mod session;
pub mod shutdown;
