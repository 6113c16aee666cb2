use std::io;

use nix::errno::Errno;

// Child carries whatever the child process rendered with Display across the
// gate/result pipe boundary, since the two processes share no typed channel.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("preflight check failed: {0}")]
    Preflight(String),

    #[error("container setup failed: {0}")]
    Setup(String),

    #[error("pty relay failed: {0}")]
    Relay(String),

    #[error("supervision failed: {0}")]
    Supervise(String),

    #[error("child reported: {0}")]
    Child(String),

    #[error(transparent)]
    Errno(#[from] Errno),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(v: String) -> Self {
        Error::Other(v)
    }
}

impl From<&str> for Error {
    fn from(v: &str) -> Self {
        Error::Other(v.to_owned())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
