//! Per-channel work: request servicing and the interactive CLI invocation.
//!
//! Every accepted session channel gets two tasks. One drains the channel's
//! request queue in arrival order and owns the geometry; the other runs the
//! CLI against an [`SshTerm`] and closes the channel once it returns.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

use super::request::ChannelRequest;
use crate::line::{crlf, Input, LineEditor};
use crate::term::{Geometry, Icli, Term, TermError};

/// Chunks of client input buffered per channel before the connection stops
/// reading from the socket.
pub const DATA_QUEUE_DEPTH: usize = 32;

const REQUEST_QUEUE_DEPTH: usize = 16;

/// Outbound side of a session channel.
#[async_trait]
pub trait ChannelIo: Send + Sync + 'static {
    async fn data(&self, buf: &[u8]) -> io::Result<()>;

    /// Send EOF and close the channel.
    async fn close(&self);
}

/// [`ChannelIo`] over a russh server session handle.
pub struct SessionHandle {
    handle: Handle,
    id: ChannelId,
}

impl SessionHandle {
    pub fn new(handle: Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }
}

#[async_trait]
impl ChannelIo for SessionHandle {
    async fn data(&self, buf: &[u8]) -> io::Result<()> {
        self.handle
            .data(self.id, CryptoVec::from_slice(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "ssh channel closed"))
    }

    async fn close(&self) {
        let _ = self.handle.eof(self.id).await;
        let _ = self.handle.close(self.id).await;
    }
}

/// Senders the connection handler uses to feed one session channel.
pub struct SessionSenders {
    pub data: mpsc::Sender<Vec<u8>>,
    pub requests: mpsc::Sender<ChannelRequest>,
}

/// Inbound queues for one session channel, filled by the connection handler.
pub struct SessionQueues {
    pub data: mpsc::Receiver<Vec<u8>>,
    pub requests: mpsc::Receiver<ChannelRequest>,
}

pub fn session_queues() -> (SessionSenders, SessionQueues) {
    let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE_DEPTH);
    let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    (
        SessionSenders {
            data: data_tx,
            requests: requests_tx,
        },
        SessionQueues {
            data: data_rx,
            requests: requests_rx,
        },
    )
}

/// Apply one request to the channel geometry.
pub fn apply_request(request: ChannelRequest, geometry: &watch::Sender<Geometry>) {
    match request {
        ChannelRequest::PtyReq(pty) => {
            debug!(term = %pty.term, width = pty.geometry.width, height = pty.geometry.height, modes = pty.modes, "pty-req");
            geometry.send_replace(pty.geometry);
        }
        ChannelRequest::WindowChange(size) => {
            debug!(width = size.width, height = size.height, "window-change");
            geometry.send_replace(size);
        }
        ChannelRequest::Shell => debug!("shell"),
        ChannelRequest::Other(kind) => debug!("Ignoring '{}' request", kind),
    }
}

/// Service requests one at a time until the queue is closed by the transport.
pub async fn service_requests(
    mut requests: mpsc::Receiver<ChannelRequest>,
    geometry: watch::Sender<Geometry>,
) {
    while let Some(request) = requests.recv().await {
        apply_request(request, &geometry);
    }
    debug!("Request queue closed");
}

/// Start the request servicer and the CLI for a freshly accepted channel.
///
/// The returned handle resolves once the CLI has returned and the channel
/// has been closed.
pub fn spawn_session<C: ChannelIo>(
    cli: Arc<dyn Icli>,
    io: Arc<C>,
    queues: SessionQueues,
) -> JoinHandle<()> {
    let (geometry_tx, geometry_rx) = watch::channel(Geometry::default());

    tokio::spawn(service_requests(queues.requests, geometry_tx).in_current_span());

    let mut term = SshTerm::new(io, queues.data, geometry_rx);
    tokio::spawn(
        async move {
            cli.run(&mut term).await;
            term.close().await;
            debug!("Interactive CLI returned, channel closed");
        }
        .in_current_span(),
    )
}

/// Terminal bound to one SSH session channel.
pub struct SshTerm<C> {
    io: Arc<C>,
    input: mpsc::Receiver<Vec<u8>>,
    editor: LineEditor,
    pending: VecDeque<Input>,
    geometry: watch::Receiver<Geometry>,
    closed: bool,
}

impl<C: ChannelIo> SshTerm<C> {
    pub fn new(
        io: Arc<C>,
        input: mpsc::Receiver<Vec<u8>>,
        geometry: watch::Receiver<Geometry>,
    ) -> Self {
        Self {
            io,
            input,
            editor: LineEditor::new(),
            pending: VecDeque::new(),
            geometry,
            closed: false,
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), TermError> {
        if self.closed {
            return Err(TermError::Closed);
        }
        self.io.data(&crlf(buf)).await?;
        Ok(())
    }
}

#[async_trait]
impl<C: ChannelIo> Term for SshTerm<C> {
    async fn read_line(&mut self) -> Result<String, TermError> {
        loop {
            if self.closed {
                return Err(TermError::Closed);
            }
            match self.pending.pop_front() {
                Some(Input::Line(line)) => return Ok(line),
                Some(Input::Eof) => return Err(TermError::Eof),
                None => {}
            }
            let Some(data) = self.input.recv().await else {
                return Err(TermError::Eof);
            };
            let feed = self.editor.feed(&data);
            if !feed.echo.is_empty() {
                self.io.data(&feed.echo).await?;
            }
            self.pending.extend(feed.inputs);
        }
    }

    async fn write_out(&mut self, buf: &[u8]) -> Result<(), TermError> {
        self.write(buf).await
    }

    async fn write_err(&mut self, buf: &[u8]) -> Result<(), TermError> {
        self.write(buf).await
    }

    fn size(&self) -> Geometry {
        *self.geometry.borrow()
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.io.close().await;
        }
    }
}
