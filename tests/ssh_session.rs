//! End-to-end sessions against a real server on loopback.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use icli_serve::{Geometry, Icli, SshOptions, SshServer, Term};
use russh::client::{self, Handle};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::PrivateKey;
use russh::{Channel, ChannelMsg, ChannelOpenFailure, Sig};
use tempfile::TempDir;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Line(String, Geometry),
    Ended { eof: bool },
}

struct Recorder {
    runs: AtomicUsize,
    seen: mpsc::UnboundedSender<Seen>,
}

#[async_trait]
impl Icli for Recorder {
    async fn run(&self, term: &mut dyn Term) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        loop {
            match term.read_line().await {
                Ok(line) => {
                    let quit = line == "quit";
                    let _ = self.seen.send(Seen::Line(line, term.size()));
                    if quit {
                        return;
                    }
                }
                Err(e) => {
                    let _ = self.seen.send(Seen::Ended { eof: e.is_eof() });
                    return;
                }
            }
        }
    }
}

struct Client;

impl client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct Fixture {
    addr: SocketAddr,
    cli: Arc<Recorder>,
    seen: mpsc::UnboundedReceiver<Seen>,
    _dir: TempDir,
}

impl Fixture {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let key_path = dir.path().join("host_key");
        std::fs::write(&key_path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();

        let (tx, seen) = mpsc::unbounded_channel();
        let cli = Arc::new(Recorder {
            runs: AtomicUsize::new(0),
            seen: tx,
        });
        let server = SshServer::bind(cli.clone(), SshOptions::new("127.0.0.1:0", key_path))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        Self {
            addr,
            cli,
            seen,
            _dir: dir,
        }
    }

    async fn connect(&self) -> Handle<Client> {
        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, self.addr, Client).await.unwrap();
        let auth = session.authenticate_none("anyone").await.unwrap();
        assert!(auth.success());
        session
    }

    async fn next_seen(&mut self) -> Seen {
        tokio::time::timeout(WAIT, self.seen.recv())
            .await
            .expect("timed out waiting for the CLI")
            .expect("recorder dropped")
    }

    fn runs(&self) -> usize {
        self.cli.runs.load(Ordering::SeqCst)
    }
}

async fn expect_success(channel: &mut Channel<client::Msg>) {
    loop {
        match tokio::time::timeout(WAIT, channel.wait()).await.unwrap() {
            Some(ChannelMsg::Success) => return,
            Some(ChannelMsg::Failure) => panic!("request refused"),
            Some(_) => continue,
            None => panic!("channel closed before reply"),
        }
    }
}

/// Count request replies until `expected` arrived or nothing more shows up.
async fn count_replies(channel: &mut Channel<client::Msg>, expected: usize) -> (usize, usize) {
    let (mut success, mut failure) = (0, 0);
    while success + failure < expected {
        match tokio::time::timeout(Duration::from_secs(2), channel.wait()).await {
            Ok(Some(ChannelMsg::Success)) => success += 1,
            Ok(Some(ChannelMsg::Failure)) => failure += 1,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    (success, failure)
}

/// Collect output until the server closes the channel.
async fn drain(channel: &mut Channel<client::Msg>) -> String {
    let mut out = Vec::new();
    loop {
        match tokio::time::timeout(WAIT, channel.wait()).await.unwrap() {
            Some(ChannelMsg::Data { data }) => out.extend_from_slice(&data),
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

async fn send(channel: &Channel<client::Msg>, text: &str) {
    channel
        .data(Cursor::new(text.as_bytes().to_vec()))
        .await
        .unwrap();
}

async fn open_shell(session: &Handle<Client>, width: u32, height: u32) -> Channel<client::Msg> {
    let mut channel = session.channel_open_session().await.unwrap();
    channel
        .request_pty(true, "xterm", width, height, 0, 0, &[])
        .await
        .unwrap();
    expect_success(&mut channel).await;
    channel
}

#[tokio::test]
async fn test_pty_shell_quit() {
    let mut fx = Fixture::start().await;
    let session = fx.connect().await;

    let mut channel = open_shell(&session, 80, 24).await;
    channel.request_shell(true).await.unwrap();
    expect_success(&mut channel).await;

    send(&channel, "quit\r").await;
    assert_eq!(
        fx.next_seen().await,
        Seen::Line("quit".into(), Geometry::new(80, 24))
    );

    let output = drain(&mut channel).await;
    assert!(output.contains("quit\r\n"), "missing echo in {output:?}");
    assert_eq!(fx.runs(), 1);
}

#[tokio::test]
async fn test_window_change_replaces_geometry() {
    let mut fx = Fixture::start().await;
    let session = fx.connect().await;

    let mut channel = open_shell(&session, 80, 24).await;
    channel.window_change(100, 30, 0, 0).await.unwrap();
    channel.window_change(120, 40, 0, 0).await.unwrap();
    // The resizes reach the servicer before the shell is acknowledged.
    channel.request_shell(true).await.unwrap();
    expect_success(&mut channel).await;

    send(&channel, "size\r").await;
    assert_eq!(
        fx.next_seen().await,
        Seen::Line("size".into(), Geometry::new(120, 40))
    );

    send(&channel, "quit\r").await;
    fx.next_seen().await;
    drain(&mut channel).await;
}

#[tokio::test]
async fn test_channels_on_one_connection_are_independent() {
    let mut fx = Fixture::start().await;
    let session = fx.connect().await;

    let mut a = open_shell(&session, 80, 24).await;
    let mut b = open_shell(&session, 132, 50).await;
    a.window_change(100, 30, 0, 0).await.unwrap();
    for channel in [&mut a, &mut b] {
        channel.request_shell(true).await.unwrap();
        expect_success(channel).await;
    }

    send(&a, "from-a\r").await;
    send(&b, "from-b\r").await;
    let mut seen = vec![fx.next_seen().await, fx.next_seen().await];
    seen.sort_by_key(|s| format!("{s:?}"));
    assert_eq!(
        seen,
        vec![
            Seen::Line("from-a".into(), Geometry::new(100, 30)),
            Seen::Line("from-b".into(), Geometry::new(132, 50)),
        ]
    );

    send(&a, "quit\r").await;
    send(&b, "quit\r").await;
    drain(&mut a).await;
    drain(&mut b).await;
    assert_eq!(fx.runs(), 2);
}

#[tokio::test]
async fn test_client_eof_ends_read_line() {
    let mut fx = Fixture::start().await;
    let session = fx.connect().await;

    let mut channel = open_shell(&session, 80, 24).await;
    channel.request_shell(true).await.unwrap();
    expect_success(&mut channel).await;
    channel.eof().await.unwrap();

    assert_eq!(fx.next_seen().await, Seen::Ended { eof: true });
    drain(&mut channel).await;
    assert_eq!(fx.runs(), 1);
}

#[tokio::test]
async fn test_ctrl_d_on_empty_line_is_eof() {
    let mut fx = Fixture::start().await;
    let session = fx.connect().await;

    let mut channel = open_shell(&session, 80, 24).await;
    send(&channel, "\x04").await;

    assert_eq!(fx.next_seen().await, Seen::Ended { eof: true });
    drain(&mut channel).await;
}

#[tokio::test]
async fn test_non_session_channel_is_rejected() {
    let mut fx = Fixture::start().await;
    let session = fx.connect().await;

    let rejected = session
        .channel_open_direct_tcpip("localhost", 22, "127.0.0.1", 40000)
        .await;
    // russh picks the refusal reason for channel types it knows.
    assert!(matches!(
        rejected,
        Err(russh::Error::ChannelOpenFailure(
            ChannelOpenFailure::AdministrativelyProhibited
        ))
    ));
    assert_eq!(fx.runs(), 0);

    // The connection is still usable afterwards.
    let mut channel = open_shell(&session, 80, 24).await;
    send(&channel, "quit\r").await;
    assert_eq!(
        fx.next_seen().await,
        Seen::Line("quit".into(), Geometry::new(80, 24))
    );
    drain(&mut channel).await;
    assert_eq!(fx.runs(), 1);
}

#[tokio::test]
async fn test_pipelined_requests_are_all_acknowledged() {
    let mut fx = Fixture::start().await;
    let session = fx.connect().await;

    // Sent back to back, the way OpenSSH does it.
    let mut channel = session.channel_open_session().await.unwrap();
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.window_change(100, 30, 0, 0).await.unwrap();
    channel.request_shell(true).await.unwrap();

    assert_eq!(count_replies(&mut channel, 2).await, (2, 0));

    send(&channel, "quit\r").await;
    assert_eq!(
        fx.next_seen().await,
        Seen::Line("quit".into(), Geometry::new(100, 30))
    );
    drain(&mut channel).await;
}

#[tokio::test]
async fn test_other_requests_go_unanswered() {
    let mut fx = Fixture::start().await;
    let session = fx.connect().await;

    let mut channel = open_shell(&session, 80, 24).await;
    channel.set_env(true, "LANG", "C").await.unwrap();
    channel.signal(Sig::INT).await.unwrap();
    channel
        .request_x11(true, false, "MIT-MAGIC-COOKIE-1", "00", 0)
        .await
        .unwrap();
    channel.request_shell(true).await.unwrap();

    // Only the shell request is answered.
    assert_eq!(count_replies(&mut channel, 2).await, (1, 0));

    send(&channel, "quit\r").await;
    assert_eq!(
        fx.next_seen().await,
        Seen::Line("quit".into(), Geometry::new(80, 24))
    );
    drain(&mut channel).await;
    assert_eq!(fx.runs(), 1);
}
