//! Per-connection session state.
//!
//! A [`SessionHandle`] is what the registries hand around: the identity, the
//! negotiated protocol, and the outbound queue drained by the connection's
//! writer task. The queue is bounded; a session whose queue fills up is
//! evicted. Room presence (active room, joined rooms) is owned by
//! [`crate::rooms::RoomRegistry`] so broadcast snapshots and membership
//! changes happen under a single lock.

use std::{collections::BTreeSet, fmt, sync::Arc};

use tokio::sync::mpsc::{Sender, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::record::Record;

pub type SessionId = u64;

/// Feature flags advertised in the capability announcement.
pub const SERVER_FEATURES: &[&str] = &["rooms", "public_rooms", "structured", "history"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// Plain text lines; lines starting with `/` are commands.
    Legacy,
    /// One JSON record per line.
    Structured,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Legacy => f.write_str("legacy"),
            ProtocolKind::Structured => f.write_str("structured"),
        }
    }
}

/// Features a peer claimed during the capability handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    features: BTreeSet<String>,
    handshake: bool,
}

impl Capabilities {
    /// Parses the comma-separated value of a `features=` flag.
    pub fn from_handshake(features: Option<&str>) -> Self {
        let features = features
            .unwrap_or_default()
            .split(',')
            .map(|feature| feature.trim().to_ascii_lowercase())
            .filter(|feature| !feature.is_empty())
            .collect();
        Self {
            features,
            handshake: true,
        }
    }

    pub fn supports(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// True if the peer answered the announcement with a client handshake.
    pub fn negotiated(&self) -> bool {
        self.handshake
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(String::as_str)
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    username: Arc<str>,
    protocol: ProtocolKind,
    capabilities: Arc<Capabilities>,
    outbound: Sender<String>,
    evicted: CancellationToken,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        username: &str,
        protocol: ProtocolKind,
        capabilities: Capabilities,
        outbound: Sender<String>,
    ) -> Self {
        Self {
            id,
            username: Arc::from(username),
            protocol,
            capabilities: Arc::new(capabilities),
            outbound,
            evicted: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Queues an already-encoded line. Returns false once the writer is gone
    /// or the queue is full; a full queue also evicts the session.
    pub fn send_line(&self, line: impl Into<String>) -> bool {
        match self.outbound.try_send(line.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.evicted.is_cancelled() {
                    warn!(user = %self.username, "outbound queue full, evicting session");
                    self.evicted.cancel();
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Fires once the session has been evicted for not draining its queue.
    pub fn eviction(&self) -> &CancellationToken {
        &self.evicted
    }

    pub fn send_record(&self, record: &Record) -> bool {
        match record.to_line() {
            Ok(line) => self.send_line(line),
            Err(err) => {
                warn!(user = %self.username, ?err, "failed to encode record");
                false
            }
        }
    }

    /// Sends `record` natively to structured peers and its text rendering to
    /// legacy peers.
    pub fn reply(&self, record: &Record) -> bool {
        match self.protocol {
            ProtocolKind::Structured => self.send_record(record),
            ProtocolKind::Legacy => record
                .render_lines()
                .into_iter()
                .all(|line| self.send_line(line)),
        }
    }

    /// Like [`SessionHandle::reply`] but with a hand-written legacy line.
    pub fn reply_with(&self, line: impl Into<String>, record: &Record) -> bool {
        match self.protocol {
            ProtocolKind::Structured => self.send_record(record),
            ProtocolKind::Legacy => self.send_line(line),
        }
    }
}
