//! Transport-agnostic terminal used by interactive CLIs.
//!
//! An [`Icli`] only ever sees a `&mut dyn Term`, so the same command loop
//! runs unchanged against the local standard streams or an SSH channel.

use async_trait::async_trait;
use thiserror::Error;

/// Character geometry of a terminal.
///
/// Pixel dimensions sent by SSH clients are accepted on the wire but never
/// applied, so only the character grid is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Errors surfaced to the interactive CLI by a [`Term`].
#[derive(Debug, Error)]
pub enum TermError {
    /// The input stream ended cleanly.
    #[error("end of input")]
    Eof,
    /// The underlying stream failed.
    #[error("terminal i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The terminal was already closed.
    #[error("terminal closed")]
    Closed,
}

impl TermError {
    pub fn is_eof(&self) -> bool {
        matches!(self, TermError::Eof)
    }
}

/// A simple line-oriented terminal.
///
/// Both `write_out` and `write_err` end up on the same stream for every
/// implementation in this crate.
#[async_trait]
pub trait Term: Send {
    /// Wait for the next complete line, without its terminator.
    async fn read_line(&mut self) -> Result<String, TermError>;

    async fn write_out(&mut self, buf: &[u8]) -> Result<(), TermError>;

    async fn write_err(&mut self, buf: &[u8]) -> Result<(), TermError>;

    /// Current geometry as last negotiated with the client.
    fn size(&self) -> Geometry;

    /// Release the underlying stream. Safe to call more than once.
    async fn close(&mut self);
}

/// An interactive command loop served over a [`Term`].
///
/// `run` returns when the session should end. The terminal is borrowed for
/// the duration of the call and must not be retained afterwards.
#[async_trait]
pub trait Icli: Send + Sync + 'static {
    async fn run(&self, term: &mut dyn Term);
}
