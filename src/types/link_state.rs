//! Link identity and connection state

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two links the bridge maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkId {
    /// Command port of the animation tool
    Animation,
    /// Robot controller
    Robot,
}

impl LinkId {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkId::Animation => "animation",
            LinkId::Robot => "robot",
        }
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of one link, written only by that link's supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected but silent beyond the liveness window
    Degraded,
}

impl ConnectionState {
    /// Whether the transport is usable for sending.
    pub fn is_up(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Connection state plus the generation of the connection it refers to.
///
/// `generation` increments on every successful connect, so a loop that saw a
/// connection fail can wait for a *new* one instead of racing the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub generation: u64,
}

impl LinkStatus {
    pub fn is_up(&self) -> bool {
        self.state.is_up()
    }
}
