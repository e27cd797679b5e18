//! Connection lifecycle states.

use std::fmt;

/// Where the session is in its connection lifecycle.
///
/// `Closed` is terminal; every other state can be left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Keepalive crossed the unresponsiveness threshold; the socket is
    /// being force-closed.
    Unresponsive,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Unresponsive => "UNRESPONSIVE",
            Self::Reconnecting => "RECONNECTING",
            Self::Closed => "CLOSED",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
