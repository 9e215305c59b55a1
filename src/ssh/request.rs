//! In-band requests received on a session channel (RFC 4254 §6.2 and §6.7).
//!
//! russh decodes the payloads before the handler sees them; these types
//! carry what the request servicer needs from them.

use crate::term::Geometry;

pub const SHELL: &str = "shell";
pub const PTY_REQ: &str = "pty-req";
pub const WINDOW_CHANGE: &str = "window-change";

/// A `pty-req` as handed over by russh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub geometry: Geometry,
    /// Number of terminal modes the client sent.
    pub modes: usize,
}

/// One in-band request received on a session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    Shell,
    PtyReq(PtyRequest),
    WindowChange(Geometry),
    /// Any request type this server leaves unanswered.
    Other(String),
}

impl ChannelRequest {
    pub fn kind(&self) -> &str {
        match self {
            ChannelRequest::Shell => SHELL,
            ChannelRequest::PtyReq(_) => PTY_REQ,
            ChannelRequest::WindowChange(_) => WINDOW_CHANGE,
            ChannelRequest::Other(kind) => kind,
        }
    }

    /// Whether the client gets a positive reply. Everything else goes
    /// unanswered.
    ///
    /// The reply has to be written while russh is still handling the
    /// request: it only keeps the want-reply bit of the latest request.
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, ChannelRequest::Shell | ChannelRequest::PtyReq(_))
    }
}
