//! Drives the compiled binary: one `serve` process plus `client` processes
//! and raw sockets talking to it.

use std::{net::SocketAddr, path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    net::TcpStream,
    process::{Child, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Newline-delimited reader with a per-line deadline.
struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    async fn try_next(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let bytes = timeout(READ_TIMEOUT, self.inner.read_line(&mut line))
            .await
            .context("timed out waiting for line")??;
        if bytes == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    async fn next(&mut self, waiting_for: &str) -> Result<String> {
        self.try_next()
            .await
            .with_context(|| format!("{waiting_for}: failed to read line"))?
            .ok_or_else(|| anyhow!("{waiting_for}: stream closed"))
    }

    fn into_inner(self) -> BufReader<R> {
        self.inner
    }
}

struct RelayProcess {
    child: Child,
    addr: SocketAddr,
    logs: JoinHandle<()>,
}

impl RelayProcess {
    async fn spawn(binary: &Path) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["serve", "--listen", "127.0.0.1:0", "--detect-timeout-ms", "200"])
            .env("RUST_LOG", "info")
            .env("NO_COLOR", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn relay")?;
        let stdout = child.stdout.take().context("relay stdout missing")?;

        let mut stdout = LineReader::new(stdout);
        let banner = stdout.next("waiting for listening banner").await?;
        let addr = banner
            .split_whitespace()
            .last()
            .and_then(|token| token.parse::<SocketAddr>().ok())
            .with_context(|| format!("no socket address in banner {banner:?}"))?;

        // Keep the pipe drained so logging never blocks the relay.
        let mut rest = stdout.into_inner();
        let logs = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await;
        });

        Ok(Self { child, addr, logs })
    }

    async fn stop(mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
        let _ = self.logs.await;
    }
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: LineReader<ChildStdout>,
}

impl ClientProcess {
    /// Starts `room-relay client` and waits until the relay has welcomed it.
    async fn spawn(binary: &Path, nickname: &str, addr: SocketAddr) -> Result<Self> {
        let mut child = Command::new(binary)
            .arg("client")
            .arg("--nickname")
            .arg(nickname)
            .arg("--server")
            .arg(addr.to_string())
            .env("RUST_LOG", "warn")
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn client {nickname}"))?;
        let stdin = child.stdin.take().context("client stdin missing")?;
        let stdout = child.stdout.take().context("client stdout missing")?;

        let mut client = Self {
            child,
            stdin,
            stdout: LineReader::new(stdout),
        };
        let welcome = client.recv("waiting for welcome").await?;
        if welcome != format!("Welcome {nickname}. You are in 'global'.") {
            return Err(anyhow!("unexpected welcome for {nickname}: {welcome:?}"));
        }
        Ok(client)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("failed to send {line:?}"))?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self, waiting_for: &str) -> Result<String> {
        self.stdout.next(waiting_for).await
    }

    async fn wait_success(mut self, name: &str) -> Result<()> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("failed to await {name}"))?;
        if !status.success() {
            return Err(anyhow!("{name} exited with status {status}"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn cli_rooms_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("room-relay");
    let relay = RelayProcess::spawn(&binary).await?;

    let mut alice = ClientProcess::spawn(&binary, "alice", relay.addr).await?;
    let mut bob = ClientProcess::spawn(&binary, "bob", relay.addr).await?;
    assert_eq!(
        alice.recv("alice hears bob arrive").await?,
        "bob joined the global chat."
    );

    // Both move into a fresh room; alice hears bob arrive.
    alice.send("/join lounge").await?;
    assert_eq!(alice.recv("alice join").await?, "Joined room 'lounge'.");
    bob.send("/join lounge").await?;
    assert_eq!(bob.recv("bob join").await?, "Joined room 'lounge'.");
    assert_eq!(
        alice.recv("lounge notice").await?,
        "bob joined room 'lounge'."
    );

    alice.send("Hello from Alice").await?;
    assert_eq!(
        bob.recv("bob hears alice").await?,
        "alice: Hello from Alice"
    );

    bob.send("/rooms").await?;
    assert_eq!(
        bob.recv("room listing").await?,
        "Public rooms: global, lounge"
    );
    bob.send("/users").await?;
    assert_eq!(bob.recv("user listing").await?, "Online users: alice, bob");

    alice.send("/quit").await?;
    assert_eq!(alice.recv("alice quit").await?, "*** leaving chat");
    assert_eq!(
        bob.recv("departure notice").await?,
        "alice disconnected from room 'lounge'."
    );

    bob.send("/quit").await?;
    assert_eq!(bob.recv("bob quit").await?, "*** leaving chat");

    alice.wait_success("alice client").await?;
    bob.wait_success("bob client").await?;

    // The relay stays up after clients disconnect.
    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn raw_socket_sees_announcement_then_prompt() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("room-relay");
    let relay = RelayProcess::spawn(&binary).await?;

    let stream = TcpStream::connect(relay.addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = LineReader::new(reader);

    // A silent peer is offered the handshake after the detection window.
    assert_eq!(
        lines.next("capability announcement").await?,
        "HELLO features=rooms,public_rooms,structured,history"
    );
    assert_eq!(lines.next("name prompt").await?, "Enter your name:");

    writer
        .write_all(b"CLIENT_HELLO username=zoe features=rooms\n")
        .await?;
    assert_eq!(
        lines.next("welcome").await?,
        "Welcome zoe. You are in 'global'."
    );

    writer.write_all(b"/quit\n").await?;
    assert_eq!(lines.next("goodbye").await?, "Goodbye.");
    assert_eq!(lines.try_next().await?, None);

    relay.stop().await;
    Ok(())
}
