// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle States
//!
//! ```text
//! NeverConnected ──► Connecting ◄──► Connected
//!        │               │              │
//!        └───────────────┴──────────────┴──► Closed (terminal)
//! ```

use std::fmt;

/// Lifecycle state of one logical broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, no attempt has succeeded yet.
    NeverConnected,
    /// No live connection; the watcher is retrying.
    Connecting,
    /// A live connection handle is available.
    Connected,
    /// Explicitly shut down. No further transitions.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::NeverConnected => "NeverConnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Closed => "Closed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// True for the states in which the reconnection watcher should try to connect.
    pub fn needs_connection(&self) -> bool {
        matches!(
            self,
            ConnectionState::NeverConnected | ConnectionState::Connecting
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (NeverConnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Connecting)
                | (NeverConnected, Closed)
                | (Connecting, Closed)
                | (Connected, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
