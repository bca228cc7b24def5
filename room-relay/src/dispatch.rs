//! Routes one inbound record from a registered session.

use tracing::{debug, warn};

use crate::{
    command::Command,
    error::{Reason, RelayError},
    record::{Record, RoomOp, timestamp},
    relay::{Payload, Relay},
    session::{ProtocolKind, SessionHandle},
};

/// What the session loop should do after a record has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

pub struct Dispatcher<'a> {
    relay: &'a Relay,
    session: &'a SessionHandle,
}

impl<'a> Dispatcher<'a> {
    pub fn new(relay: &'a Relay, session: &'a SessionHandle) -> Self {
        Self { relay, session }
    }

    /// Parses `line` in the session's protocol and executes it. Errors are
    /// reported to the session, which stays connected.
    pub async fn handle_line(&self, line: &str) -> Flow {
        if line.trim().is_empty() {
            return Flow::Continue;
        }
        let parsed = match self.session.protocol() {
            ProtocolKind::Legacy => Command::parse_line(line).map(Some),
            ProtocolKind::Structured => Record::parse(line).and_then(Command::from_record),
        };

        let result = match parsed {
            Ok(Some(command)) => self.dispatch(command).await,
            Ok(None) => Ok(Flow::Continue),
            Err(err) => Err(err),
        };

        match result {
            Ok(flow) => flow,
            Err(err) => {
                self.report(&err);
                Flow::Continue
            }
        }
    }

    pub async fn dispatch(&self, command: Command) -> Result<Flow, RelayError> {
        match command {
            Command::JoinRoom { room, password } => {
                self.join_room(&room, password.as_deref()).await?;
            }
            Command::LeaveRoom { room } => self.leave_room(room).await?,
            Command::ListRooms => self.list_rooms().await,
            Command::ListUsers => self.list_users().await,
            Command::History { count, before } => self.history(count, before).await,
            Command::Chat { text } => self.chat(&text).await?,
            Command::Quit => {
                self.session.reply(&Record::notice("Goodbye."));
                return Ok(Flow::Disconnect);
            }
            Command::Unknown { name } => {
                return Err(RelayError::validation(
                    Reason::UnknownCommand,
                    format!("Unknown command '{name}'."),
                ));
            }
        }
        Ok(Flow::Continue)
    }

    /// Replies with the error, in the session's protocol.
    pub fn report(&self, err: &RelayError) {
        if let RelayError::Protocol(detail) = err {
            warn!(user = self.session.username(), %detail, "malformed input");
        }
        let reason = err.reason().unwrap_or(Reason::Malformed);
        self.session.reply(&Record::error(reason, err.to_string()));
    }

    async fn join_room(&self, room: &str, password: Option<&str>) -> Result<(), RelayError> {
        let user = self.session.username();
        let outcome = self.relay.rooms().join_room(user, room, password).await?;
        let room = outcome.room.as_str();
        debug!(
            user,
            room,
            from = %outcome.previous_active,
            first = outcome.first_membership,
            "joined room"
        );

        let text = format!("Joined room '{room}'.");
        self.session
            .reply(&Record::confirmation(RoomOp::Join, room, room, text));

        let replay = self.relay.config().history_replay;
        if replay > 0 {
            let lines = self.relay.history().read_tail(room, replay);
            if !lines.is_empty() {
                self.session.reply(&Record::History {
                    room: room.to_string(),
                    lines,
                    time: Some(timestamp()),
                });
            }
        }

        if outcome.first_membership {
            self.relay
                .broadcast(
                    room,
                    &Payload::notice(room, format!("{user} joined room '{room}'.")),
                    Some(user),
                )
                .await;
        }
        Ok(())
    }

    async fn leave_room(&self, room: Option<String>) -> Result<(), RelayError> {
        let user = self.session.username();
        let room = match room {
            Some(room) => room,
            None => self
                .relay
                .rooms()
                .active_room(user)
                .await
                .unwrap_or_default(),
        };
        let room = room.trim();

        let active = self.relay.rooms().leave_room(user, room).await?;
        debug!(user, room, active = %active, "left room");

        let text = format!("Left room '{room}'. Active room: {active}.");
        self.session
            .reply(&Record::confirmation(RoomOp::Leave, room, &active, text));
        self.relay
            .broadcast(
                room,
                &Payload::notice(room, format!("{user} left room '{room}'.")),
                Some(user),
            )
            .await;
        Ok(())
    }

    async fn list_rooms(&self) {
        let rooms = self.relay.rooms().list_public_rooms().await;
        self.session.reply(&Record::RoomListing {
            rooms,
            time: Some(timestamp()),
        });
    }

    async fn list_users(&self) {
        let users = self.relay.sessions().usernames().await;
        self.session.reply(&Record::UserListing {
            users,
            time: Some(timestamp()),
        });
    }

    async fn history(&self, count: usize, before: Option<usize>) {
        let user = self.session.username();
        let room = self
            .relay
            .rooms()
            .active_room(user)
            .await
            .unwrap_or_default();
        let lines = match before {
            Some(index) => self.relay.history().read_before(&room, index, count),
            None => self.relay.history().read_tail(&room, count),
        };
        self.session.reply(&Record::History {
            room,
            lines,
            time: Some(timestamp()),
        });
    }

    async fn chat(&self, text: &str) -> Result<(), RelayError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        // Tabs are the only control character a chat line may carry.
        if text.chars().any(|c| c.is_control() && c != '\t') {
            return Err(RelayError::Protocol(
                "chat text cannot contain control characters".to_string(),
            ));
        }
        let user = self.session.username();
        let Some(room) = self.relay.rooms().active_room(user).await else {
            return Ok(());
        };
        self.relay
            .broadcast(&room, &Payload::chat(user, &room, text), Some(user))
            .await;
        Ok(())
    }
}
