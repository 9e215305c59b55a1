//! Serve one interactive command loop over the local terminal or SSH.
//!
//! Implement [`Icli`] once, then hand it to [`serve_local`] or
//! [`serve_ssh`]. The loop only ever talks to a [`Term`], so it cannot tell
//! which transport it is running on.

mod error;
mod line;
mod local;
mod ssh;
mod term;

pub use error::ServeError;
pub use local::{serve_local, serve_local_with, LocalTerm};
pub use ssh::{serve_ssh, SshOptions, SshServer};
pub use term::{Geometry, Icli, Term, TermError};
