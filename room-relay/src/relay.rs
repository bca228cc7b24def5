//! Shared relay state and the broadcast engine.
//!
//! [`Relay`] owns both registries and the history store and is shared with
//! every connection task through an `Arc`. No method holds a registry lock
//! while another registry's lock is taken or while a recipient is served:
//! broadcast snapshots recipients first and delivers afterwards.

use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tracing::{debug, info};

use crate::{
    config::RelayConfig,
    error::RelayError,
    history::{HistoryStore, MemoryHistory},
    negotiate::Identity,
    record::Record,
    rooms::{GLOBAL_ROOM, RoomRegistry},
    session::{ProtocolKind, SessionHandle, SessionId},
    sessions::SessionRegistry,
};

/// A broadcast body in up to two native representations.
///
/// Recipients get the form matching their protocol; when it is missing the
/// other form is converted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub line: Option<String>,
    pub record: Option<Record>,
}

impl Payload {
    pub fn both(line: impl Into<String>, record: Record) -> Self {
        Self {
            line: Some(line.into()),
            record: Some(record),
        }
    }

    pub fn line(line: impl Into<String>) -> Self {
        Self {
            line: Some(line.into()),
            record: None,
        }
    }

    pub fn record(record: Record) -> Self {
        Self {
            line: None,
            record: Some(record),
        }
    }

    /// Chat line from `user` in `room`.
    pub fn chat(user: &str, room: &str, text: &str) -> Self {
        Self::both(format!("{user}: {text}"), Record::chat(user, room, text))
    }

    /// System notice scoped to `room`.
    pub fn notice(room: &str, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::both(text.clone(), Record::room_notice(room, text))
    }

    /// Encodes the payload for a recipient speaking `protocol`.
    pub fn render(&self, protocol: ProtocolKind) -> Result<Option<String>, RelayError> {
        match (protocol, &self.line, &self.record) {
            (ProtocolKind::Legacy, Some(line), _) => Ok(Some(line.clone())),
            (ProtocolKind::Legacy, None, Some(record)) => Ok(Some(record.render_text())),
            (ProtocolKind::Structured, _, Some(record)) => record.to_line().map(Some),
            (ProtocolKind::Structured, Some(line), None) => {
                Record::notice(line.clone()).to_line().map(Some)
            }
            (_, None, None) => Ok(None),
        }
    }

    /// Text recorded in room history.
    fn history_line(&self) -> Option<String> {
        self.line
            .clone()
            .or_else(|| self.record.as_ref().map(Record::render_text))
    }
}

pub struct Relay {
    config: RelayConfig,
    sessions: SessionRegistry,
    rooms: RoomRegistry,
    history: Arc<dyn HistoryStore>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let history = Arc::new(MemoryHistory::new(config.history_capacity));
        Self::with_history(config, history)
    }

    pub fn with_history(config: RelayConfig, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            config,
            sessions: SessionRegistry::new(),
            rooms: RoomRegistry::new(),
            history,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn history(&self) -> &dyn HistoryStore {
        self.history.as_ref()
    }

    /// Inserts a negotiated identity into both registries.
    ///
    /// Fails with a conflict if the name is taken; the caller must then close
    /// the connection.
    pub async fn register(
        &self,
        identity: &Identity,
        outbound: Sender<String>,
    ) -> Result<SessionHandle, RelayError> {
        let handle = SessionHandle::new(
            self.sessions.next_id(),
            &identity.username,
            identity.protocol,
            identity.capabilities.clone(),
            outbound,
        );
        self.sessions.register(handle.clone()).await?;
        self.rooms.enter_global(handle.username()).await;
        info!(
            user = handle.username(),
            protocol = %handle.protocol(),
            handshake = handle.capabilities().negotiated(),
            features = ?handle.capabilities().features().collect::<Vec<_>>(),
            "session registered"
        );
        Ok(handle)
    }

    /// Welcomes a newly registered session and tells `global` about it.
    pub async fn welcome(&self, handle: &SessionHandle) {
        let user = handle.username();
        handle.reply_with(
            format!("Welcome {user}. You are in '{GLOBAL_ROOM}'."),
            &Record::room_notice(GLOBAL_ROOM, format!("Welcome {user}!")),
        );
        self.broadcast(
            GLOBAL_ROOM,
            &Payload::notice(GLOBAL_ROOM, format!("{user} joined the global chat.")),
            Some(user),
        )
        .await;
    }

    /// Delivers `payload` to every session whose active room is `room`.
    ///
    /// Returns how many recipients accepted the payload. Failed deliveries are
    /// skipped; the recipient's own teardown cleans up after it.
    pub async fn broadcast(&self, room: &str, payload: &Payload, exclude: Option<&str>) -> usize {
        let present = self.rooms.active_members(room).await;
        let recipients = self
            .sessions
            .resolve(
                present
                    .iter()
                    .map(String::as_str)
                    .filter(|user| Some(*user) != exclude),
            )
            .await;

        if let Some(line) = payload.history_line() {
            self.history.append(room, &line);
        }

        let mut delivered = 0;
        for recipient in &recipients {
            let sent = match payload.render(recipient.protocol()) {
                Ok(Some(line)) => recipient.send_line(line),
                Ok(None) => false,
                Err(err) => {
                    debug!(user = recipient.username(), %err, "failed to render payload");
                    false
                }
            };
            if sent {
                delivered += 1;
            } else {
                debug!(user = recipient.username(), room, "dropped broadcast to closed session");
            }
        }
        delivered
    }

    /// Removes a session from both registries and announces the departure in
    /// every room it belonged to.
    ///
    /// Only the first call for a given session id does anything; later calls,
    /// or calls for a session that has since been replaced by a new one with
    /// the same name, return `false`.
    pub async fn teardown(&self, username: &str, id: SessionId) -> bool {
        if !self.sessions.is_current(username, id).await {
            return false;
        }
        let rooms = self.rooms.remove_user_everywhere(username).await;
        let removed = self.sessions.remove(username, id).await.is_some();

        for room in &rooms {
            self.broadcast(
                room,
                &Payload::notice(room, format!("{username} disconnected from room '{room}'.")),
                Some(username),
            )
            .await;
        }
        if removed {
            info!(user = username, rooms = rooms.len(), "session removed");
        }
        removed
    }

    /// Tells every live session that the server is going away.
    pub async fn announce_shutdown(&self) {
        let payload = Payload::line("Server shutting down.");
        for session in self.sessions.all().await {
            if let Ok(Some(line)) = payload.render(session.protocol()) {
                session.send_line(line);
            }
        }
    }
}
