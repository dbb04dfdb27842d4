//! Connection and stream state model.
//!
//! Observers are plain callbacks invoked synchronously on whatever task
//! detected the transition; they must not block.

use crate::addr::EndpointPair;
use crate::traits::Connection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// State of a connection as tracked by the server.
///
/// `Idle` means no streams are currently being handled; a live connection
/// oscillates between `Open` and `Idle` until it reaches the terminal
/// `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Open,
    Idle,
    Closed,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Idle => "idle",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a handled stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Open,
    Idle,
    Closed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Idle => "idle",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifying metadata of a stream, passed to state observers.
///
/// The stream itself is owned by its handler by the time transitions fire,
/// so observers get a snapshot rather than a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: u64,
    pub endpoint: EndpointPair,
}

/// Observer invoked on connection state transitions.
pub type ConnStateHandler = Arc<dyn Fn(&dyn Connection, ConnState) + Send + Sync>;

/// Observer invoked on stream state transitions.
pub type StreamStateHandler = Arc<dyn Fn(&StreamInfo, StreamState) + Send + Sync>;
