//! Supervisor <-> worker messages.
//!
//! Messages are JSON-serialized and newline-delimited. The supervisor writes
//! exactly one [`LoadMessage`] to the worker's stdin; the worker reports
//! readiness with [`WorkerEvent`] lines on its stdout.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactMap;

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unexpected action '{0}'")]
    UnexpectedAction(String),
}

/// Host and port a worker accepts connections on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListeningAddress {
    pub host: String,
    pub port: u16,
}

impl ListeningAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for ListeningAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for ListeningAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Startup message, sent once per worker lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadMessage {
    pub action: String,
    pub entry: PathBuf,
    pub artifacts: ArtifactMap,
}

impl LoadMessage {
    pub const ACTION: &'static str = "load";

    pub fn new(entry: impl Into<PathBuf>, artifacts: ArtifactMap) -> Self {
        Self {
            action: Self::ACTION.to_string(),
            entry: entry.into(),
            artifacts,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        let message: Self = serde_json::from_str(line.trim())?;
        if message.action != Self::ACTION {
            return Err(ProtocolError::UnexpectedAction(message.action));
        }
        Ok(message)
    }
}

/// Readiness signal from the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum WorkerEvent {
    /// The worker's server framework started accepting connections.
    Listening { address: ListeningAddress },
    /// The application declared itself ready.
    Ready { address: ListeningAddress },
}

impl WorkerEvent {
    pub fn address(&self) -> &ListeningAddress {
        match self {
            Self::Listening { address } | Self::Ready { address } => address,
        }
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Parse a stdout line. Lines that are not protocol events yield `None`
    /// and are treated as ordinary program output.
    pub fn from_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }
}
