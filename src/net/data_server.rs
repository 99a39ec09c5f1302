//! Serving side of the chunked slice transfer.
//!
//! One accept loop, one session thread per connection. A session answers each
//! [`ChunkRequest`] with a header frame and, when the slice exists, a raw
//! payload frame holding the chunk bytes. Sessions never push unsolicited
//! data, so the client's credit window is the only flow control needed.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::net::frame::{FrameReader, FrameWriter, NextFrame};
use crate::net::proto::{self, ChunkReply, ChunkRequest};
use crate::net::{CHUNK_SIZE, MAX_FRAME_BYTES, NetError, READ_TIMEOUT};
use crate::store::SharedSliceStore;

/// Serves slice chunks out of a shared [`crate::store::SliceStore`].
pub struct ChunkResponder {
    listen_addr: String,
    store: SharedSliceStore,
}

pub struct ChunkResponderHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ChunkResponderHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stops the accept loop and all session threads in flight.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

impl ChunkResponder {
    pub fn new(listen_addr: impl Into<String>, store: SharedSliceStore) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            store,
        }
    }

    pub fn start(self) -> Result<ChunkResponderHandle, NetError> {
        let listener = TcpListener::bind(&self.listen_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let store = self.store;
        let join = thread::spawn(move || run_accept_loop(listener, store, accept_shutdown));

        tracing::info!(%local_addr, "chunk responder listening");
        Ok(ChunkResponderHandle {
            shutdown,
            join,
            local_addr,
        })
    }
}

fn run_accept_loop(listener: TcpListener, store: SharedSliceStore, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                let store = store.clone();
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || {
                    if let Err(err) = run_session(stream, store, shutdown) {
                        tracing::warn!(%peer, "chunk session error: {err}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                tracing::warn!("chunk responder accept error: {err}");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn run_session(
    stream: TcpStream,
    store: SharedSliceStore,
    shutdown: Arc<AtomicBool>,
) -> Result<(), NetError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let reader_stream = stream.try_clone()?;
    let mut reader = FrameReader::new(reader_stream, MAX_FRAME_BYTES);
    let mut writer = FrameWriter::new(stream, MAX_FRAME_BYTES);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        match reader.read_next_timeout()? {
            NextFrame::TimedOut => continue,
            NextFrame::Closed => return Ok(()),
            NextFrame::Frame(bytes) => match proto::decode_chunk_request(&bytes) {
                Ok(request) => serve_request(&request, &store, &mut writer)?,
                // Frames are delimited, so one bad message does not
                // desync the stream.
                Err(err) => tracing::warn!("discarding malformed chunk request: {err}"),
            },
        }
    }
}

fn serve_request(
    request: &ChunkRequest,
    store: &SharedSliceStore,
    writer: &mut FrameWriter<TcpStream>,
) -> Result<(), NetError> {
    let payload = store
        .lock()
        .expect("slice store lock poisoned")
        .get(request.slice_id);

    let Some(data) = payload else {
        tracing::warn!(slice_id = request.slice_id, "requested slice not in storage");
        let reply = ChunkReply {
            slice_id: request.slice_id,
            available: false,
            offset: request.offset,
            chunk_size: 0,
        };
        writer.write_frame(&proto::encode_chunk_reply(&reply)?)?;
        return Ok(());
    };

    // Clamp to what the slice actually holds; the client learns the served
    // offset and length from the header, not from what it asked for.
    let total = data.len();
    let offset = (request.offset as usize).min(total);
    let len = (request.chunk_size as usize)
        .min(CHUNK_SIZE)
        .min(total - offset);

    let reply = ChunkReply {
        slice_id: request.slice_id,
        available: true,
        offset: offset as u32,
        chunk_size: len as u32,
    };
    writer.write_frame(&proto::encode_chunk_reply(&reply)?)?;
    writer.write_frame(&data[offset..offset + len])?;
    tracing::trace!(
        slice_id = request.slice_id,
        offset,
        len,
        "served slice chunk"
    );
    Ok(())
}
