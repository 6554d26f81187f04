//! One connected client: handshake, receive loop, and cleanup.
//!
//! A session owns the read half of its connection. The write half belongs to
//! a dedicated writer task fed through the session's [`SessionHandle`], so the
//! session itself, the router and every other session's broadcasts all share
//! one ordered outbound queue per client.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{ServerLine, notices, proposed_nickname, read_line, write_line},
    registry::{Registry, SessionHandle, SessionId},
    router,
};

/// How long a closing session waits for its queued lines to reach a peer
/// that has stopped reading.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshaking,
    Active,
    Closed,
}

pub struct Session<R> {
    registry: Arc<Registry>,
    handle: SessionHandle,
    reader: R,
    writer: JoinHandle<()>,
    nickname: Option<String>,
    phase: Phase,
    peer: Option<SocketAddr>,
}

impl<R> Session<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Creates a session and starts its writer task. Nothing is sent until
    /// [`Session::run`] begins the handshake.
    pub fn new<W>(
        registry: Arc<Registry>,
        reader: R,
        writer: W,
        peer: Option<SocketAddr>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, inbox) = mpsc::unbounded_channel();
        let id = registry.next_session_id();
        let writer = tokio::spawn(drain_outbound(id, inbox, writer));

        Self {
            registry,
            handle: SessionHandle::new(id, outbound),
            reader,
            writer,
            nickname: None,
            phase: Phase::Handshaking,
            peer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    /// Drives the session until the peer hangs up, then cleans up.
    ///
    /// Returns the transport error that ended the session, if any. Cleanup
    /// happens either way.
    pub async fn run(mut self) -> Result<()> {
        let outcome = self.serve().await;
        self.close().await;
        self.release().await;
        outcome
    }

    async fn serve(&mut self) -> Result<()> {
        if !self.handshake().await? {
            return Ok(());
        }
        self.receive_loop().await
    }

    /// Returns `false` when the peer left before picking a nickname.
    async fn handshake(&mut self) -> Result<bool> {
        self.reply(ServerLine::system(notices::WELCOME));

        let nickname = loop {
            let Some(line) = read_line(&mut self.reader)
                .await
                .context("failed to read nickname")?
            else {
                debug!(session = %self.id(), peer = ?self.peer, "client left during handshake");
                return Ok(false);
            };

            let proposed = proposed_nickname(&line);
            if proposed.is_empty() {
                self.reply(ServerLine::system(notices::NICKNAME_EMPTY));
                continue;
            }

            match self.registry.register(proposed, self.handle.clone()).await {
                Ok(()) => break proposed.to_string(),
                Err(error) => {
                    debug!(session = %self.id(), %proposed, %error, "nickname refused");
                    self.reply(ServerLine::system(notices::NICKNAME_TAKEN));
                }
            }
        };

        info!(session = %self.id(), peer = ?self.peer, %nickname, "client joined");
        let joined = ServerLine::system(notices::joined(&nickname));
        self.nickname = Some(nickname);
        self.phase = Phase::Active;
        self.registry.broadcast(&joined).await;
        self.registry.announce_user_list().await;
        Ok(true)
    }

    async fn receive_loop(&mut self) -> Result<()> {
        while let Some(line) = read_line(&mut self.reader)
            .await
            .context("failed to read from client")?
        {
            let Some(nickname) = self.nickname.as_mut() else {
                break;
            };
            router::dispatch(&self.registry, &self.handle, nickname, &line).await;
        }
        Ok(())
    }

    /// Leaves the registry and tells everyone else. Safe to call twice.
    async fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        let was_active = self.phase == Phase::Active;
        self.phase = Phase::Closed;

        let Some(nickname) = self.nickname.take() else {
            return;
        };
        let removed = self.registry.unregister(self.id(), &nickname).await;
        if was_active && removed {
            info!(session = %self.id(), peer = ?self.peer, %nickname, "client disconnected");
            self.registry
                .broadcast(&ServerLine::system(notices::left(&nickname)))
                .await;
            self.registry.announce_user_list().await;
        }
    }

    /// Drops the last outbound handle and waits, up to [`FLUSH_TIMEOUT`], for
    /// queued lines to flush. A writer still stuck after that is aborted.
    async fn release(self) {
        let Session {
            handle, mut writer, ..
        } = self;
        let id = handle.id();
        drop(handle);
        match timeout(FLUSH_TIMEOUT, &mut writer).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(session = %id, ?error, "writer task failed"),
            Err(_) => {
                debug!(session = %id, "peer stopped reading; dropping unsent lines");
                writer.abort();
            }
        }
    }

    fn reply(&self, line: ServerLine) {
        self.handle.deliver(&line);
    }
}

async fn drain_outbound<W>(
    id: SessionId,
    mut inbox: mpsc::UnboundedReceiver<String>,
    mut writer: W,
)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = inbox.recv().await {
        if let Err(error) = write_line(&mut writer, &line).await {
            debug!(session = %id, ?error, "failed to deliver line to client");
            return;
        }
    }

    if let Err(error) = writer.shutdown().await {
        debug!(session = %id, ?error, "failed to shut down client writer");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{BufReader, DuplexStream, ReadHalf, WriteHalf},
        time::timeout,
    };

    use super::*;

    type ServerSession = Session<BufReader<ReadHalf<DuplexStream>>>;

    struct Peer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn send(&mut self, line: &str) {
            write_line(&mut self.writer, line).await.expect("peer write");
        }

        async fn expect(&mut self, expected: &str) {
            let line = timeout(Duration::from_secs(1), read_line(&mut self.reader))
                .await
                .expect("timed out waiting for server line")
                .expect("peer read")
                .expect("stream closed early");
            assert_eq!(line, expected);
        }
    }

    fn connect(registry: &Arc<Registry>) -> (ServerSession, Peer) {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);
        let session = Session::new(
            Arc::clone(registry),
            BufReader::new(server_read),
            server_write,
            None,
        );
        let peer = Peer {
            reader: BufReader::new(client_read),
            writer: client_write,
        };
        (session, peer)
    }

    #[tokio::test]
    async fn new_sessions_start_handshaking() {
        let registry = Arc::new(Registry::new());
        let (session, _peer) = connect(&registry);

        assert_eq!(session.phase(), Phase::Handshaking);
        assert_eq!(session.nickname(), None);
    }

    #[tokio::test]
    async fn handshake_retries_until_the_nickname_is_free() {
        let registry = Arc::new(Registry::new());
        let (squatter, _rx) = {
            let (tx, rx) = mpsc::unbounded_channel();
            (SessionHandle::new(registry.next_session_id(), tx), rx)
        };
        registry.register("alice", squatter).await.expect("squatter");

        let (session, mut peer) = connect(&registry);
        let task = tokio::spawn(session.run());

        peer.expect("SYS Welcome! Set nickname with /nick <name>").await;
        peer.send("alice").await;
        peer.expect("SYS Nickname already taken. Enter another:").await;
        peer.send("   ").await;
        peer.expect("SYS Nickname cannot be empty. Enter another:").await;
        peer.send("/nick bob").await;
        peer.expect("SYS bob has joined the chat.").await;
        peer.expect("USERS alice,bob").await;

        drop(peer);
        task.await.expect("session task").expect("session result");
        assert_eq!(registry.snapshot_nicknames().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn leaving_before_handshake_leaves_no_trace() {
        let registry = Arc::new(Registry::new());
        let (watcher, mut rx) = {
            let (tx, rx) = mpsc::unbounded_channel();
            (SessionHandle::new(registry.next_session_id(), tx), rx)
        };
        registry.register("watcher", watcher).await.expect("watcher");

        let (session, mut peer) = connect(&registry);
        let task = tokio::spawn(session.run());
        peer.expect("SYS Welcome! Set nickname with /nick <name>").await;
        drop(peer);

        task.await.expect("session task").expect("session result");
        assert_eq!(registry.snapshot_nicknames().await, vec!["watcher"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_runs_once() {
        let registry = Arc::new(Registry::new());
        let (watcher, mut rx) = {
            let (tx, rx) = mpsc::unbounded_channel();
            (SessionHandle::new(registry.next_session_id(), tx), rx)
        };
        registry.register("watcher", watcher).await.expect("watcher");

        let (mut session, _peer) = connect(&registry);
        registry
            .register("alice", session.handle.clone())
            .await
            .expect("alice");
        session.nickname = Some("alice".into());
        session.phase = Phase::Active;

        session.close().await;
        session.close().await;

        assert_eq!(session.phase(), Phase::Closed);
        assert_eq!(rx.try_recv().expect("left notice"), "SYS alice has left the chat.");
        assert_eq!(rx.try_recv().expect("user list"), "USERS watcher");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn release_gives_up_on_a_peer_that_stopped_reading() {
        let registry = Arc::new(Registry::new());
        let (client, server) = tokio::io::duplex(64);
        let (server_read, server_write) = tokio::io::split(server);
        let session = Session::new(registry, BufReader::new(server_read), server_write, None);

        for _ in 0..64 {
            session.reply(ServerLine::system("backlog nobody will read"));
        }

        timeout(FLUSH_TIMEOUT * 2, session.release())
            .await
            .expect("release should not wait on a stalled peer");
        drop(client);
    }

    #[tokio::test]
    async fn departure_is_announced_to_remaining_sessions() {
        let registry = Arc::new(Registry::new());
        let (alice, mut alice_peer) = connect(&registry);
        let (bob, mut bob_peer) = connect(&registry);
        let alice_task = tokio::spawn(alice.run());
        let bob_task = tokio::spawn(bob.run());

        alice_peer.expect("SYS Welcome! Set nickname with /nick <name>").await;
        alice_peer.send("alice").await;
        alice_peer.expect("SYS alice has joined the chat.").await;
        alice_peer.expect("USERS alice").await;

        bob_peer.expect("SYS Welcome! Set nickname with /nick <name>").await;
        bob_peer.send("bob").await;
        bob_peer.expect("SYS bob has joined the chat.").await;
        bob_peer.expect("USERS alice,bob").await;
        alice_peer.expect("SYS bob has joined the chat.").await;
        alice_peer.expect("USERS alice,bob").await;

        drop(bob_peer);
        bob_task.await.expect("bob task").expect("bob result");

        alice_peer.expect("SYS bob has left the chat.").await;
        alice_peer.expect("USERS alice").await;

        drop(alice_peer);
        alice_task.await.expect("alice task").expect("alice result");
        assert!(registry.snapshot_nicknames().await.is_empty());
    }
}
