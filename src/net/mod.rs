//! TCP transport: chunked slice transfer and the control signal bus.
//!
//! Both planes share the same length-and-crc framing and CBOR codec. Every
//! component runs as a plain thread loop talking to the rest of the process
//! through bounded crossbeam channels; there is no async runtime.

pub mod control_client;
pub mod control_server;
pub mod data_client;
pub mod data_server;
pub mod frame;
pub mod proto;

use std::time::Duration;

use thiserror::Error;

pub use control_client::{SignalClient, SignalClientHandle};
pub use control_server::{SignalBus, SignalBusHandle};
pub use data_client::{ChunkRequester, SliceCollector, TransferEvent};
pub use data_server::{ChunkResponder, ChunkResponderHandle};

/// Payload size of every chunk except possibly the last one of a slice.
pub const CHUNK_SIZE: usize = 250_000;

/// Chunk requests a requester keeps in flight at once.
pub const PIPELINE: usize = 10;

/// How long a blocking read waits before a loop re-checks its channels
/// and shutdown flag.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Largest frame either plane accepts: one chunk plus codec overhead.
pub(crate) const MAX_FRAME_BYTES: usize = CHUNK_SIZE + 1024;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] frame::FrameError),
    #[error("encode error: {0}")]
    Encode(#[from] proto::ProtoEncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] proto::ProtoDecodeError),
}
