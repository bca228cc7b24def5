//! TCP acceptor and per-connection session driver.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    select,
    sync::mpsc::{self, Receiver, Sender},
    time::timeout,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    codec::{Frame, LineCodec},
    config::RelayConfig,
    dispatch::{Dispatcher, Flow},
    error::RelayError,
    negotiate::{self, Identity},
    relay::Relay,
    session::{SessionHandle, SessionId},
};

pub struct Server {
    listener: TcpListener,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self::with_relay(listener, Arc::new(Relay::new(config)))
    }

    pub fn with_relay(listener: TcpListener, relay: Arc<Relay>) -> Self {
        Self {
            listener,
            relay,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            relay,
            shutdown: token,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&relay, &token).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &relay, &token);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(relay: &Relay, token: &CancellationToken) {
    info!("relay shutting down");
    relay.announce_shutdown().await;
    token.cancel();
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    relay: &Arc<Relay>,
    shutdown: &CancellationToken,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, relay, shutdown),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    relay: &Arc<Relay>,
    shutdown: &CancellationToken,
) {
    let relay = Arc::clone(relay);
    let cancel = shutdown.child_token();
    tokio::spawn(async move {
        debug!(%peer, "connection accepted");
        match handle_connection(stream, &relay, cancel).await {
            Ok(()) => debug!(%peer, "connection closed"),
            Err(err) if err.is_transport() => debug!(%peer, %err, "connection dropped"),
            Err(err) => warn!(%peer, %err, "connection closed with error"),
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    relay: &Arc<Relay>,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    let config = relay.config();
    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, LineCodec::new(config.max_line_length));

    let (outbound, queue) = mpsc::channel(config.outbound_capacity.max(1));
    let writer = tokio::spawn(drain_outbound(
        writer,
        queue,
        LineCodec::new(config.max_line_length),
        config.write_timeout,
        cancel.clone(),
    ));

    let result = serve_session(&mut frames, &outbound, relay, &cancel).await;

    drop(outbound);
    if let Err(err) = writer.await {
        warn!(?err, "writer task failed");
    }
    result
}

/// Writes queued lines until every sender is gone, then shuts the write half.
///
/// A peer that accepts no bytes for `write_timeout` ends the session.
async fn drain_outbound(
    writer: OwnedWriteHalf,
    mut queue: Receiver<String>,
    codec: LineCodec,
    write_timeout: Duration,
    session: CancellationToken,
) {
    let mut sink = FramedWrite::new(writer, codec);
    while let Some(line) = queue.recv().await {
        match timeout(write_timeout, sink.send(line)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(?err, "failed to write to peer");
                session.cancel();
                return;
            }
            Err(_) => {
                warn!(?write_timeout, "peer stopped reading, closing session");
                session.cancel();
                return;
            }
        }
    }
    if let Err(err) = sink.close().await {
        debug!(?err, "failed to shut down write half");
    }
}

async fn serve_session(
    frames: &mut FramedRead<OwnedReadHalf, LineCodec>,
    outbound: &Sender<String>,
    relay: &Arc<Relay>,
    cancel: &CancellationToken,
) -> Result<(), RelayError> {
    let identity = select! {
        _ = cancel.cancelled() => return Ok(()),
        identity = negotiate::negotiate(frames, outbound, relay.config()) => identity?,
    };

    let session = match relay.register(&identity, outbound.clone()).await {
        Ok(session) => session,
        Err(err) => {
            negotiate::send_error(outbound, identity.protocol, &err);
            return Err(err);
        }
    };
    let guard = TeardownGuard::new(relay, &session);

    relay.welcome(&session).await;
    let result = read_loop(frames, relay, &session, identity, cancel).await;

    guard.release().await;
    result
}

async fn read_loop(
    frames: &mut FramedRead<OwnedReadHalf, LineCodec>,
    relay: &Relay,
    session: &SessionHandle,
    identity: Identity,
    cancel: &CancellationToken,
) -> Result<(), RelayError> {
    let dispatcher = Dispatcher::new(relay, session);
    let mut echo = identity.echo;

    loop {
        let frame = select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = session.eviction().cancelled() => {
                debug!(user = session.username(), "session evicted");
                return Ok(());
            }
            frame = frames.next() => frame,
        };

        let line = match frame {
            None => return Ok(()),
            Some(Err(err)) => return Err(err.into()),
            Some(Ok(Frame::Oversized { discarded })) => {
                dispatcher.report(&RelayError::Protocol(format!(
                    "record of {discarded} bytes exceeds the limit"
                )));
                continue;
            }
            Some(Ok(Frame::Line(line))) => line,
        };

        if let Some(name) = echo.take() {
            if line.trim() == name {
                debug!(user = session.username(), "swallowed handshake name echo");
                continue;
            }
        }

        if dispatcher.handle_line(&line).await == Flow::Disconnect {
            return Ok(());
        }
    }
}

/// Runs teardown for a registered session exactly once.
///
/// The normal exit path awaits [`TeardownGuard::release`]. If the guard is
/// dropped instead (early return, panic, task abort) teardown is spawned on
/// the current runtime.
struct TeardownGuard {
    relay: Arc<Relay>,
    username: String,
    id: SessionId,
    armed: bool,
}

impl TeardownGuard {
    fn new(relay: &Arc<Relay>, session: &SessionHandle) -> Self {
        Self {
            relay: Arc::clone(relay),
            username: session.username().to_string(),
            id: session.id(),
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        self.relay.teardown(&self.username, self.id).await;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(user = %self.username, "no runtime available for session teardown");
            return;
        };
        let relay = Arc::clone(&self.relay);
        let username = std::mem::take(&mut self.username);
        let id = self.id;
        runtime.spawn(async move {
            relay.teardown(&username, id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        rooms::GLOBAL_ROOM,
        session::{Capabilities, ProtocolKind},
    };

    async fn registered(relay: &Arc<Relay>, name: &str) -> SessionHandle {
        let (tx, _rx) = mpsc::channel(8);
        let identity = Identity {
            username: name.to_string(),
            protocol: ProtocolKind::Legacy,
            capabilities: Capabilities::default(),
            echo: None,
        };
        relay.register(&identity, tx).await.expect("register")
    }

    #[tokio::test]
    async fn released_guard_tears_down_once() {
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        let session = registered(&relay, "alice").await;

        TeardownGuard::new(&relay, &session).release().await;
        assert!(relay.sessions().get("alice").await.is_none());
        assert!(!relay.teardown("alice", session.id()).await);
    }

    #[tokio::test]
    async fn dropped_guard_spawns_teardown() {
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        let session = registered(&relay, "alice").await;

        drop(TeardownGuard::new(&relay, &session));
        for _ in 0..50 {
            if relay.sessions().get("alice").await.is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(relay.sessions().get("alice").await.is_none());
        assert!(relay.rooms().members(GLOBAL_ROOM).await.expect("global").is_empty());
    }

    #[tokio::test]
    async fn panicking_session_task_is_torn_down() {
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        let session = registered(&relay, "alice").await;

        let task_relay = Arc::clone(&relay);
        let task = tokio::spawn(async move {
            let _guard = TeardownGuard::new(&task_relay, &session);
            panic!("session task blew up");
        });
        assert!(task.await.is_err());

        for _ in 0..50 {
            if relay.sessions().get("alice").await.is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(relay.sessions().is_empty().await);
    }
}
