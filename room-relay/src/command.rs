//! Inbound operations and their parsers.
//!
//! Both protocols funnel into [`Command`]: legacy lines through
//! [`Command::parse_line`], structured records through
//! [`Command::from_record`]. Dispatch then matches on the closed enum.

use crate::{
    error::{Reason, RelayError},
    record::{Record, RoomOp},
};

pub const COMMAND_MARKER: char = '/';
pub const DEFAULT_HISTORY_COUNT: usize = 20;
pub const MAX_HISTORY_COUNT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    JoinRoom {
        room: String,
        password: Option<String>,
    },
    /// `None` means the active room.
    LeaveRoom { room: Option<String> },
    ListRooms,
    ListUsers,
    Quit,
    History { count: usize, before: Option<usize> },
    Chat { text: String },
    Unknown { name: String },
}

impl Command {
    /// Parses a legacy line. Anything not starting with the marker is chat.
    ///
    /// # Syntax
    /// Command names are case-insensitive:
    /// - `/join <room> [password]`
    /// - `/leave [room]`
    /// - `/rooms` (alias: `/list`)
    /// - `/users` (alias: `/listar`)
    /// - `/quit` (alias: `/exit`)
    /// - `/history [count] [before]`
    ///
    /// Arguments may be quoted so they can contain spaces. The marker must be
    /// the first character; indented lines are chat.
    pub fn parse_line(line: &str) -> Result<Self, RelayError> {
        let Some(rest) = line.strip_prefix(COMMAND_MARKER) else {
            return Ok(Command::Chat {
                text: line.to_string(),
            });
        };

        let mut parts = tokenize(rest)?.into_iter();
        let Some(name) = parts.next() else {
            return Ok(Command::Unknown {
                name: String::new(),
            });
        };

        match name.to_lowercase().as_str() {
            "join" => {
                let room = parts.next().ok_or_else(|| {
                    RelayError::validation(Reason::InvalidName, "Usage: /join <room> [password]")
                })?;
                Ok(Command::JoinRoom {
                    room,
                    password: parts.next(),
                })
            }
            "leave" => Ok(Command::LeaveRoom { room: parts.next() }),
            "rooms" | "list" => Ok(Command::ListRooms),
            "users" | "listar" => Ok(Command::ListUsers),
            "quit" | "exit" => Ok(Command::Quit),
            "history" => {
                let count = parts
                    .next()
                    .map(|raw| parse_number(&raw, "count"))
                    .transpose()?
                    .unwrap_or(DEFAULT_HISTORY_COUNT);
                let before = parts
                    .next()
                    .map(|raw| parse_number(&raw, "before"))
                    .transpose()?;
                Ok(Command::history(Some(count), before))
            }
            _ => Ok(Command::Unknown { name }),
        }
    }

    /// Maps a record from a structured peer. `Ok(None)` means the record is
    /// acknowledged by silence (client-side system notices).
    pub fn from_record(record: Record) -> Result<Option<Self>, RelayError> {
        let command = match record {
            Record::Message { text, .. } => {
                if text.starts_with(COMMAND_MARKER) {
                    Command::parse_line(&text)?
                } else {
                    Command::Chat { text }
                }
            }
            Record::RoomOperation {
                op,
                room,
                password,
                count,
                before,
                ..
            } => match op {
                RoomOp::Join => Command::JoinRoom {
                    room: room.unwrap_or_default(),
                    password,
                },
                RoomOp::Leave => Command::LeaveRoom { room },
                RoomOp::List => Command::ListRooms,
                RoomOp::Users => Command::ListUsers,
                RoomOp::Quit => Command::Quit,
                RoomOp::History => Command::history(count, before),
            },
            Record::Join { .. } => {
                return Err(RelayError::conflict(
                    Reason::AlreadyConnected,
                    "Already connected.",
                ));
            }
            Record::SystemNotice { .. } => return Ok(None),
            other => Command::Unknown {
                name: other.kind().to_string(),
            },
        };
        Ok(Some(command))
    }

    fn history(count: Option<usize>, before: Option<usize>) -> Self {
        Command::History {
            count: count.unwrap_or(DEFAULT_HISTORY_COUNT).min(MAX_HISTORY_COUNT),
            before,
        }
    }
}

fn parse_number(raw: &str, what: &str) -> Result<usize, RelayError> {
    raw.parse()
        .map_err(|_| RelayError::Protocol(format!("history {what} must be a number, got '{raw}'")))
}

/// Splits `input` on whitespace, honouring quotes and backslash escapes.
///
/// Single quotes are literal; inside double quotes a backslash escapes the
/// next character. An unterminated quote is a protocol error.
pub fn tokenize(input: &str) -> Result<Vec<String>, RelayError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(unterminated('\'')),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err(unterminated('"')),
                        },
                        Some(c) => current.push(c),
                        None => return Err(unterminated('"')),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn unterminated(quote: char) -> RelayError {
    RelayError::Protocol(format!("unterminated {quote} quote"))
}
