use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{codec::DEFAULT_MAX_LINE_LENGTH, config::RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP connections from either protocol.
    Serve(ServeArgs),
    /// Connect to a relay as a legacy-line client.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:55555")]
    pub listen: SocketAddr,

    /// Milliseconds to wait for a structured join record before falling back
    /// to the legacy protocol.
    #[arg(long, default_value_t = 1000)]
    pub detect_timeout_ms: u64,

    /// Seconds a connection may take to identify itself.
    #[arg(long, default_value_t = 60)]
    pub identify_timeout_secs: u64,

    /// Longest accepted record in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    pub max_line_length: usize,

    /// Lines of history kept per room (0 disables history).
    #[arg(long, default_value_t = 500)]
    pub history_capacity: usize,

    /// Lines of history replayed after joining a room.
    #[arg(long, default_value_t = 0)]
    pub history_replay: usize,

    /// Lines queued per session before a peer that stopped reading is dropped.
    #[arg(long, default_value_t = 1024)]
    pub outbound_capacity: usize,

    /// Seconds a single write to a peer may block.
    #[arg(long, default_value_t = 10)]
    pub write_timeout_secs: u64,
}

impl From<&ServeArgs> for RelayConfig {
    fn from(args: &ServeArgs) -> Self {
        Self {
            detect_timeout: Duration::from_millis(args.detect_timeout_ms),
            identify_timeout: Duration::from_secs(args.identify_timeout_secs),
            max_line_length: args.max_line_length,
            history_capacity: args.history_capacity,
            history_replay: args.history_replay,
            outbound_capacity: args.outbound_capacity.max(1),
            write_timeout: Duration::from_secs(args.write_timeout_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname sent in the capability handshake.
    #[arg(long)]
    pub nickname: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:55555")]
    pub server: SocketAddr,
}
