//! Error taxonomy shared by every relay component.
//!
//! Validation and conflict errors carry a [`Reason`] that is sent back to the
//! peer verbatim, so the wire names live here too.

use std::{fmt, io, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable reason attached to rejected requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    InvalidName,
    WrongPassword,
    NotMember,
    CannotLeaveGlobal,
    NameTaken,
    AlreadyConnected,
    UnknownCommand,
    Malformed,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::InvalidName => "invalid_name",
            Reason::WrongPassword => "wrong_password",
            Reason::NotMember => "not_member",
            Reason::CannotLeaveGlobal => "cannot_leave_global",
            Reason::NameTaken => "name_taken",
            Reason::AlreadyConnected => "already_connected",
            Reason::UnknownCommand => "unknown_command",
            Reason::Malformed => "malformed",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// Empty or otherwise unusable name, room, or argument.
    #[error("{message}")]
    Validation { reason: Reason, message: String },

    /// Request collides with existing state (duplicate identity, wrong room password).
    #[error("{message}")]
    Conflict { reason: Reason, message: String },

    /// Input that could not be parsed as a record or command.
    #[error("malformed input: {0}")]
    Protocol(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,

    #[error("no identity received within {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayError {
    pub fn validation(reason: Reason, message: impl Into<String>) -> Self {
        RelayError::Validation {
            reason,
            message: message.into(),
        }
    }

    pub fn conflict(reason: Reason, message: impl Into<String>) -> Self {
        RelayError::Conflict {
            reason,
            message: message.into(),
        }
    }

    /// Reason reported to the peer, if this error is reportable at all.
    pub fn reason(&self) -> Option<Reason> {
        match self {
            RelayError::Validation { reason, .. } | RelayError::Conflict { reason, .. } => {
                Some(*reason)
            }
            RelayError::Protocol(_) => Some(Reason::Malformed),
            RelayError::Transport(_) => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, RelayError::Transport(_))
    }
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        RelayError::Transport(TransportError::Io(err))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Protocol(err.to_string())
    }
}
