//! Room-based chat relay speaking two wire protocols over TCP.
//!
//! Peers either send a structured JSON `join` record or fall back to plain
//! newline-delimited text after a short detection window. Both kinds of
//! session share rooms, and every broadcast reaches each recipient in its own
//! representation.
//!
//! - [`server`] accepts connections and drives one session per connection.
//! - [`negotiate`] detects the protocol and reads the peer's identity.
//! - [`codec`] frames lines with a length bound; [`record`] is the structured
//!   wire format.
//! - [`command`] parses both protocols into one closed command set, executed
//!   by [`dispatch`].
//! - [`relay`] owns the shared state: [`sessions`], [`rooms`], and the
//!   [`history`] store, plus the broadcast engine.
//! - [`session`] holds per-connection handles and negotiated capabilities.
//! - [`cli`], [`config`], and [`client`] cover the binary: flags, tunables,
//!   and a small terminal client.
//! - [`error`] defines the error taxonomy and wire reasons.

pub mod cli;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod negotiate;
pub mod record;
pub mod relay;
pub mod rooms;
pub mod server;
pub mod session;
pub mod sessions;
