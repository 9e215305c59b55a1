//! Per-connection russh handler: authentication, channel dispatch and
//! routing of channel traffic to the per-channel session tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use super::request::{ChannelRequest, PtyRequest};
use super::session::{session_queues, spawn_session, SessionHandle};
use crate::term::{Geometry, Icli};

/// Senders feeding one accepted session channel.
struct ChannelRoutes {
    /// Dropped on EOF so the terminal reports end of input.
    data: Option<mpsc::Sender<Vec<u8>>>,
    requests: mpsc::Sender<ChannelRequest>,
}

pub struct ConnectionHandler {
    cli: Arc<dyn Icli>,
    peer: Option<SocketAddr>,
    channels: HashMap<ChannelId, ChannelRoutes>,
    /// Fired once the client is authenticated, ending the handshake phase.
    handshake: Option<oneshot::Sender<()>>,
}

impl ConnectionHandler {
    pub fn new(
        cli: Arc<dyn Icli>,
        peer: Option<SocketAddr>,
        handshake: oneshot::Sender<()>,
    ) -> Self {
        Self {
            cli,
            peer,
            channels: HashMap::new(),
            handshake: Some(handshake),
        }
    }

    fn reject_channel(&self, kind: &str) -> bool {
        info!("Rejecting channel: unknown channel type: {}", kind);
        false
    }

    fn discard_global_request(&self, kind: &str) -> bool {
        debug!("Discarding global request '{}'", kind);
        false
    }

    /// Answer a request right away and hand it to the channel's servicer.
    async fn enqueue(
        &self,
        channel: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let Some(requests) = self.channels.get(&channel).map(|r| r.requests.clone()) else {
            debug!(
                "Dropping '{}' request for unknown channel {:?}",
                request.kind(),
                channel
            );
            return Ok(());
        };
        if request.is_acknowledged() {
            session.channel_success(channel)?;
        }
        if requests.send(request).await.is_err() {
            debug!("Request servicer for {:?} is gone", channel);
        }
        Ok(())
    }
}

impl Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!("Accepting user '{}' without authentication", user);
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(handshake) = self.handshake.take() {
            let _ = handshake.send(());
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let (senders, queues) = session_queues();
        self.channels.insert(
            id,
            ChannelRoutes {
                data: Some(senders.data),
                requests: senders.requests,
            },
        );

        let io = Arc::new(SessionHandle::new(session.handle(), id));
        let span = info_span!("session", id = %Uuid::new_v4(), channel = ?id);
        span.in_scope(|| {
            debug!("Session channel accepted");
            spawn_session(self.cli.clone(), io, queues);
        });
        Ok(true)
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel("x11"))
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel("direct-tcpip"))
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel("forwarded-tcpip"))
    }

    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.discard_global_request("tcpip-forward"))
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.discard_global_request("cancel-tcpip-forward"))
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Waiting here holds back the rest of the connection until the
        // CLI catches up with its input.
        let tx = self.channels.get(&channel).and_then(|r| r.data.clone());
        if let Some(tx) = tx {
            let _ = tx.send(data.to_vec()).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?}", channel);
        if let Some(routes) = self.channels.get_mut(&channel) {
            routes.data = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel);
        self.channels.remove(&channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.enqueue(channel, ChannelRequest::Shell, session).await
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let pty = PtyRequest {
            term: term.to_string(),
            geometry: Geometry::new(col_width, row_height),
            modes: modes.len(),
        };
        self.enqueue(channel, ChannelRequest::PtyReq(pty), session)
            .await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = Geometry::new(col_width, row_height);
        self.enqueue(channel, ChannelRequest::WindowChange(size), session)
            .await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.enqueue(channel, ChannelRequest::Other("env".into()), session)
            .await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.enqueue(channel, ChannelRequest::Other("exec".into()), session)
            .await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Subsystem '{}' requested", name);
        self.enqueue(channel, ChannelRequest::Other("subsystem".into()), session)
            .await
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Signal {:?} received", signal);
        self.enqueue(channel, ChannelRequest::Other("signal".into()), session)
            .await
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.enqueue(channel, ChannelRequest::Other("x11-req".into()), session)
            .await
    }

    /// russh answers this one itself from the returned flag, with a
    /// connection-level reply. `true` keeps it silent unless an earlier
    /// global request left its want-reply bit set.
    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = ChannelRequest::Other("auth-agent-req@openssh.com".into());
        self.enqueue(channel, request, session).await?;
        Ok(true)
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if !self.channels.is_empty() {
            warn!(
                peer = ?self.peer,
                "Connection dropped with {} open channel(s)",
                self.channels.len()
            );
        }
    }
}
