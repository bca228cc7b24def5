//! Structured-record wire format.
//!
//! One JSON object per line, discriminated by `kind`. Legacy-line peers never
//! see these directly; [`Record::render_text`] produces their equivalent line.

use serde::{Deserialize, Serialize};

use crate::error::{Reason, RelayError};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Record {
    /// Identification; only meaningful as the first record of a connection.
    Join { user: String },
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<String>,
    },
    /// Room request from a client, or its confirmation from the server.
    RoomOperation {
        op: RoomOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<String>,
    },
    SystemNotice {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<String>,
    },
    RoomListing {
        rooms: Vec<RoomSummary>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<String>,
    },
    UserListing {
        users: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<String>,
    },
    History {
        room: String,
        lines: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<String>,
    },
    Error {
        reason: Reason,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoomOp {
    Join,
    Leave,
    List,
    Quit,
    History,
    Users,
}

/// A public room and how many users currently belong to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSummary {
    pub name: String,
    pub members: usize,
}

pub fn timestamp() -> String {
    chrono::Local::now().format(TIME_FORMAT).to_string()
}

impl Record {
    pub fn parse(line: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    pub fn to_line(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Cheap check used during protocol detection before attempting a parse.
    pub fn looks_structured(line: &str) -> bool {
        line.trim_start().starts_with('{')
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Record::SystemNotice {
            text: text.into(),
            room: None,
            time: Some(timestamp()),
        }
    }

    pub fn room_notice(room: &str, text: impl Into<String>) -> Self {
        Record::SystemNotice {
            text: text.into(),
            room: Some(room.to_string()),
            time: Some(timestamp()),
        }
    }

    pub fn chat(user: &str, room: &str, text: &str) -> Self {
        Record::Message {
            user: Some(user.to_string()),
            room: Some(room.to_string()),
            text: text.to_string(),
            time: Some(timestamp()),
        }
    }

    pub fn error(reason: Reason, text: impl Into<String>) -> Self {
        Record::Error {
            reason,
            text: text.into(),
            room: None,
            time: Some(timestamp()),
        }
    }

    /// Server-side confirmation of a join or leave.
    pub fn confirmation(op: RoomOp, room: &str, active: &str, text: impl Into<String>) -> Self {
        Record::RoomOperation {
            op,
            room: Some(room.to_string()),
            password: None,
            active: Some(active.to_string()),
            count: None,
            before: None,
            text: Some(text.into()),
            time: Some(timestamp()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Record::Join { .. } => "join",
            Record::Message { .. } => "message",
            Record::RoomOperation { .. } => "room-operation",
            Record::SystemNotice { .. } => "system-notice",
            Record::RoomListing { .. } => "room-listing",
            Record::UserListing { .. } => "user-listing",
            Record::History { .. } => "history",
            Record::Error { .. } => "error",
        }
    }

    /// Human-readable equivalent for legacy-line peers, on a single line.
    ///
    /// History is summarized; [`Record::render_lines`] gives one line per
    /// entry.
    pub fn render_text(&self) -> String {
        match self {
            Record::Join { user } => format!("{user} is identifying"),
            Record::Message { user, text, .. } => match user {
                Some(user) => format!("{user}: {text}"),
                None => text.clone(),
            },
            Record::RoomOperation { op, room, text, .. } => match (text, room) {
                (Some(text), _) => text.clone(),
                (None, Some(room)) => format!("{op:?} {room}").to_lowercase(),
                (None, None) => format!("{op:?}").to_lowercase(),
            },
            Record::SystemNotice { text, .. } => text.clone(),
            Record::RoomListing { rooms, .. } => render_listing(rooms),
            Record::UserListing { users, .. } => {
                if users.is_empty() {
                    "Online users: (none)".to_string()
                } else {
                    format!("Online users: {}", users.join(", "))
                }
            }
            Record::History { room, lines, .. } => {
                if lines.is_empty() {
                    format!("No history for '{room}'.")
                } else {
                    format!("History for '{room}': {} lines.", lines.len())
                }
            }
            Record::Error { reason, text, .. } => format!("error [{reason}] {text}"),
        }
    }

    /// Legacy rendering as separate records.
    pub fn render_lines(&self) -> Vec<String> {
        match self {
            Record::History { lines, .. } if !lines.is_empty() => lines.clone(),
            other => vec![other.render_text()],
        }
    }
}

fn render_listing(rooms: &[RoomSummary]) -> String {
    if rooms.is_empty() {
        return "Public rooms: (none)".to_string();
    }
    let names: Vec<String> = rooms
        .iter()
        .map(|room| {
            if room.members == 0 {
                format!("{} (empty)", room.name)
            } else {
                room.name.clone()
            }
        })
        .collect();
    format!("Public rooms: {}", names.join(", "))
}
