use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort SSH server startup before any connection is accepted.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to load private key ({})", path.display())]
    KeyLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse private key ({})", path.display())]
    KeyParse {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("failed to listen on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
