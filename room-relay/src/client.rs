//! Terminal client speaking the legacy-line protocol with a capability
//! handshake.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    codec::{Frame, LineCodec},
    negotiate::{CLIENT_HELLO, NAME_PROMPT, SERVER_HELLO},
};

/// Features this client asks for in its handshake.
pub const CLIENT_FEATURES: &str = "rooms,public_rooms";

type ServerLines = FramedRead<OwnedReadHalf, LineCodec>;
type ServerSink = FramedWrite<OwnedWriteHalf, LineCodec>;

pub fn handshake_line(nickname: &str) -> String {
    format!("{CLIENT_HELLO} username={nickname} features={CLIENT_FEATURES}")
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut server, mut sink) = establish_connection(&args).await?;
    let mut stdin = BufReader::new(io::stdin()).lines();

    run_client_loop(&mut server, &mut sink, &mut stdin, &args.nickname).await?;
    shutdown_connection(&mut sink).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(ServerLines, ServerSink)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((
        FramedRead::new(reader, LineCodec::default()),
        FramedWrite::new(writer, LineCodec::default()),
    ))
}

async fn run_client_loop(
    server: &mut ServerLines,
    sink: &mut ServerSink,
    stdin: &mut Lines<BufReader<Stdin>>,
    nickname: &str,
) -> Result<()> {
    let mut handshake_sent = false;

    loop {
        select! {
            frame = server.next() => {
                let Some(frame) = frame else {
                    write_stdout("*** server closed the connection").await?;
                    break;
                };
                match frame.context("failed to read from server")? {
                    Frame::Line(line) => {
                        if !handshake_sent && is_announcement(&line) {
                            sink.send(handshake_line(nickname)).await?;
                            handshake_sent = true;
                        } else if line.trim() != NAME_PROMPT {
                            write_stdout(&line).await?;
                        }
                    }
                    Frame::Oversized { discarded } => {
                        warn!(discarded, "skipped oversized line from server");
                    }
                }
            }
            input = stdin.next_line(), if handshake_sent => {
                if !handle_stdin_input(input?, sink).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

fn is_announcement(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|marker| marker == SERVER_HELLO)
}

async fn handle_stdin_input(input: Option<String>, sink: &mut ServerSink) -> Result<bool> {
    let Some(input) = input else {
        return Ok(false);
    };
    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    sink.send(text.to_string()).await?;
    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }
    Ok(true)
}

async fn shutdown_connection(sink: &mut ServerSink) {
    if let Err(error) = sink.close().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
