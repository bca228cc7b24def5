//! Protocol detection and identification.
//!
//! [`Negotiator`] is a pure state machine (`Init → Identifying → Registered`)
//! fed with lines and timeouts; [`negotiate`] drives it from a framed reader.
//! The reader's buffer is shared with the session loop, so anything the peer
//! sends after its identity is kept for normal processing.

use futures::StreamExt;
use tokio::{io::AsyncRead, sync::mpsc::Sender, time::Instant};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::{
    codec::{Frame, LineCodec},
    config::RelayConfig,
    error::{Reason, RelayError, TransportError},
    record::Record,
    session::{Capabilities, ProtocolKind, SERVER_FEATURES},
};

/// Marker of the server's capability announcement.
pub const SERVER_HELLO: &str = "HELLO";
/// Marker of a client's capability handshake reply.
pub const CLIENT_HELLO: &str = "CLIENT_HELLO";
pub const NAME_PROMPT: &str = "Enter your name:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the first record; a structured `join` may still arrive.
    Init,
    /// Capabilities announced; waiting for a legacy identity.
    Identifying,
    Registered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub protocol: ProtocolKind,
    pub capabilities: Capabilities,
    /// Name announced in a client handshake; swallowed if the client sends it
    /// again as its first plain line.
    pub echo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Wait,
    /// Lines to send before waiting again.
    Announce(Vec<String>),
    Identified(Identity),
}

#[derive(Debug)]
pub struct Negotiator {
    phase: Phase,
    protocol: ProtocolKind,
    capabilities: Capabilities,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiator {
    pub fn new() -> Self {
        Self {
            phase: Phase::Init,
            protocol: ProtocolKind::Legacy,
            capabilities: Capabilities::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Protocol to answer in if negotiation fails right now.
    pub fn protocol_hint(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn announcement() -> Vec<String> {
        vec![
            format!("{SERVER_HELLO} features={}", SERVER_FEATURES.join(",")),
            NAME_PROMPT.to_string(),
        ]
    }

    /// Detection window expired without a structured `join`.
    pub fn on_timeout(&mut self) -> Step {
        match self.phase {
            Phase::Init => {
                self.phase = Phase::Identifying;
                self.protocol = ProtocolKind::Legacy;
                Step::Announce(Self::announcement())
            }
            Phase::Identifying | Phase::Registered => Step::Wait,
        }
    }

    pub fn on_line(&mut self, line: &str) -> Result<Step, RelayError> {
        if self.phase == Phase::Registered {
            return Ok(Step::Wait);
        }

        if Record::looks_structured(line) {
            return self.on_record(line);
        }

        let trimmed = line.trim();
        let mut tokens = trimmed.split_whitespace();
        if tokens
            .next()
            .is_some_and(|marker| marker.eq_ignore_ascii_case(CLIENT_HELLO))
        {
            return self.on_client_hello(tokens);
        }

        self.protocol = ProtocolKind::Legacy;
        self.identified(trimmed, None)
    }

    /// Marks the session registered; later lines belong to the session loop.
    pub fn complete(&mut self) {
        self.phase = Phase::Registered;
    }

    fn on_record(&mut self, line: &str) -> Result<Step, RelayError> {
        match Record::parse(line)? {
            Record::Join { user } => {
                self.protocol = ProtocolKind::Structured;
                self.identified(&user, None)
            }
            other => {
                warn!(kind = other.kind(), "ignoring record received before join");
                Ok(Step::Wait)
            }
        }
    }

    fn on_client_hello<'a>(
        &mut self,
        tokens: impl Iterator<Item = &'a str>,
    ) -> Result<Step, RelayError> {
        let mut username = None;
        let mut features = None;
        for token in tokens {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "username" => username = Some(value),
                "features" => features = Some(value),
                _ => debug!(key, value, "ignoring unknown handshake flag"),
            }
        }

        self.protocol = ProtocolKind::Legacy;
        self.capabilities = Capabilities::from_handshake(features);
        match username {
            Some(name) => {
                let echo = Some(name.trim().to_string());
                self.identified(name, echo)
            }
            None => {
                self.phase = Phase::Identifying;
                Ok(Step::Wait)
            }
        }
    }

    fn identified(&mut self, candidate: &str, echo: Option<String>) -> Result<Step, RelayError> {
        let username = candidate.trim();
        if username.is_empty() {
            return Err(RelayError::validation(
                Reason::InvalidName,
                "Name cannot be empty.",
            ));
        }
        if username.chars().any(char::is_control) {
            return Err(RelayError::validation(
                Reason::InvalidName,
                "Name cannot contain control characters.",
            ));
        }
        Ok(Step::Identified(Identity {
            username: username.to_string(),
            protocol: self.protocol,
            capabilities: self.capabilities.clone(),
            echo,
        }))
    }
}

/// Sends an error the way a peer speaking `protocol` expects it.
pub fn send_error(outbound: &Sender<String>, protocol: ProtocolKind, err: &RelayError) {
    let record = Record::error(err.reason().unwrap_or(Reason::Malformed), err.to_string());
    let line = match protocol {
        ProtocolKind::Structured => match record.to_line() {
            Ok(line) => line,
            Err(encode_err) => {
                warn!(?encode_err, "failed to encode error record");
                return;
            }
        },
        ProtocolKind::Legacy => record.render_text(),
    };
    let _ = outbound.try_send(line);
}

/// Reads from `frames` until the peer has identified itself.
///
/// Validation errors are reported to the peer before being returned; they end
/// the connection. Malformed records are reported and negotiation continues.
pub async fn negotiate<R>(
    frames: &mut FramedRead<R, LineCodec>,
    outbound: &Sender<String>,
    config: &RelayConfig,
) -> Result<Identity, RelayError>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + config.identify_timeout;
    let mut negotiator = Negotiator::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::TimedOut(config.identify_timeout).into());
        }
        let wait = match negotiator.phase() {
            Phase::Init => config.detect_timeout.min(remaining),
            _ => remaining,
        };

        let step = match tokio::time::timeout(wait, frames.next()).await {
            Err(_elapsed) if negotiator.phase() == Phase::Init => Ok(negotiator.on_timeout()),
            Err(_elapsed) => {
                return Err(TransportError::TimedOut(config.identify_timeout).into());
            }
            Ok(None) => return Err(TransportError::Closed.into()),
            Ok(Some(Err(err))) => return Err(err.into()),
            Ok(Some(Ok(Frame::Oversized { discarded }))) => Err(RelayError::Protocol(format!(
                "record of {discarded} bytes exceeds the limit"
            ))),
            Ok(Some(Ok(Frame::Line(line)))) => negotiator.on_line(&line),
        };

        match step {
            Ok(Step::Wait) => {}
            Ok(Step::Announce(lines)) => {
                debug!("no structured join received, announcing capabilities");
                for line in lines {
                    let _ = outbound.try_send(line);
                }
            }
            Ok(Step::Identified(identity)) => {
                negotiator.complete();
                return Ok(identity);
            }
            Err(err @ RelayError::Protocol(_)) => {
                warn!(%err, "malformed record during negotiation");
                send_error(outbound, negotiator.protocol_hint(), &err);
            }
            Err(err) => {
                send_error(outbound, negotiator.protocol_hint(), &err);
                return Err(err);
            }
        }
    }
}
