use thiserror::Error;

use crate::net::NetError;
use crate::net::frame::FrameError;
use crate::net::proto::{ProtoDecodeError, ProtoEncodeError};

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the per-module errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Encode(#[from] ProtoEncodeError),

    #[error(transparent)]
    Decode(#[from] ProtoDecodeError),

    #[error("config error: {0}")]
    Config(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}
