//! Serving an interactive CLI over SSH.
//!
//! Client authentication is disabled: every client that completes the key
//! exchange is accepted through the `none` method. Put the server behind
//! something that authenticates, or bind it to a trusted interface only.

mod handler;
mod request;
mod session;

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::{decode_secret_key, PrivateKey};
use russh::server::Config;
use russh::{Disconnect, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::ServeError;
use crate::term::Icli;
use handler::ConnectionHandler;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters for serving an interactive CLI over SSH.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// `host:port` to listen on.
    pub addr: String,

    /// Private host key presented to clients, in OpenSSH or PEM format.
    ///
    /// This can be generated with `ssh-keygen -t ed25519 -f my_host_key`.
    pub host_key: PathBuf,

    /// Connections that have not finished the handshake within this window
    /// are dropped. `None` waits forever.
    pub handshake_timeout: Option<Duration>,

    /// Idle connections are closed after this long. `None` disables it.
    pub inactivity_timeout: Option<Duration>,
}

impl SshOptions {
    pub fn new(addr: impl Into<String>, host_key: impl Into<PathBuf>) -> Self {
        Self {
            addr: addr.into(),
            host_key: host_key.into(),
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            inactivity_timeout: None,
        }
    }
}

/// A bound SSH server that has not started accepting yet.
pub struct SshServer {
    listener: TcpListener,
    config: Arc<Config>,
    cli: Arc<dyn Icli>,
    handshake_timeout: Option<Duration>,
}

impl SshServer {
    /// Load the host key and bind the listen address.
    pub async fn bind(cli: Arc<dyn Icli>, options: SshOptions) -> Result<Self, ServeError> {
        let key = load_host_key(&options.host_key).await?;

        warn!("Client authentication is disabled; every SSH client is accepted");
        let config = Config {
            methods: MethodSet::from(&[MethodKind::None][..]),
            inactivity_timeout: options.inactivity_timeout,
            keys: vec![key],
            ..Default::default()
        };

        let listener = TcpListener::bind(&options.addr)
            .await
            .map_err(|source| ServeError::Bind {
                addr: options.addr.clone(),
                source,
            })?;
        info!("Serving SSH on {}", options.addr);

        Ok(Self {
            listener,
            config: Arc::new(config),
            cli,
            handshake_timeout: options.handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections that are already established keep running.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("SSH server shutting down");
                    return;
                }
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept incoming connection ({})", e);
                    continue;
                }
            };

            let span = info_span!("connection", %peer);
            tokio::spawn(
                handle_connection(
                    self.config.clone(),
                    self.cli.clone(),
                    stream,
                    peer,
                    self.handshake_timeout,
                )
                .instrument(span),
            );
        }
    }

    /// Accept connections forever.
    pub async fn run(self) {
        self.run_until(futures::future::pending()).await
    }
}

/// Serve `cli` over SSH until the process exits.
///
/// Only startup failures are returned; per-connection errors are logged.
pub async fn serve_ssh(cli: Arc<dyn Icli>, options: SshOptions) -> Result<(), ServeError> {
    SshServer::bind(cli, options).await?.run().await;
    Ok(())
}

async fn load_host_key(path: &Path) -> Result<PrivateKey, ServeError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ServeError::KeyLoad {
            path: path.to_path_buf(),
            source,
        })?;
    decode_secret_key(&text, None).map_err(|source| ServeError::KeyParse {
        path: path.to_path_buf(),
        source,
    })
}

async fn handle_connection(
    config: Arc<Config>,
    cli: Arc<dyn Icli>,
    stream: TcpStream,
    peer: SocketAddr,
    handshake_timeout: Option<Duration>,
) {
    let deadline = handshake_timeout.map(|t| Instant::now() + t);
    let (handshake_tx, handshake_rx) = oneshot::channel();
    let handler = ConnectionHandler::new(cli, Some(peer), handshake_tx);

    let session = match before(deadline, russh::server::run_stream(config, stream, handler)).await
    {
        Some(Ok(session)) => session,
        Some(Err(e)) => {
            warn!("Failed to handshake ({})", e);
            return;
        }
        None => {
            warn!("Failed to handshake (timed out)");
            return;
        }
    };
    tokio::pin!(session);

    let handshake = async {
        if handshake_rx.await.is_err() {
            // The handler is gone, so the session future finishes first.
            futures::future::pending::<()>().await;
        }
    };
    tokio::select! {
        result = &mut session => {
            if let Err(e) = result {
                warn!("Failed to handshake ({})", e);
            }
            return;
        }
        done = before(deadline, handshake) => {
            if done.is_none() {
                warn!("Failed to handshake (timed out)");
                let _ = session
                    .handle()
                    .disconnect(Disconnect::ByApplication, "handshake timed out".into(), "en".into())
                    .await;
                return;
            }
        }
    }

    info!("New SSH connection from {}", peer);
    match session.await {
        Ok(()) => debug!("SSH connection closed"),
        Err(e) => warn!("SSH connection error: {}", e),
    }
}

/// Run `fut` to completion, or give up at `deadline`.
async fn before<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}
