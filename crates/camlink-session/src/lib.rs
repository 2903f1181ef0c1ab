//! TCP control channel to the camera: connect, stream negotiation,
//! keep-alive heartbeats and orderly shutdown.

pub mod config;
pub mod events;
pub mod session;

pub use config::SessionConfig;
pub use events::SessionEvent;
pub use session::{ControlSession, SessionState};

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("connection failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("not connected")]
    NotConnected,
}
