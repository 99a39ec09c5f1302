//! Requesting side of the chunked slice transfer.
//!
//! The requester runs one thread per connection. It keeps at most
//! [`PIPELINE`] chunk requests in flight and reassembles replies, which may
//! arrive out of order, into per-slice collectors. Finished slices and
//! unavailable ones surface on a bounded event channel.

use std::collections::BTreeMap;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{self, Receiver, Sender, SendTimeoutError, TryRecvError};

use crate::net::frame::{FrameReader, FrameWriter, NextFrame};
use crate::net::proto::{self, ChunkRequest};
use crate::net::{CHUNK_SIZE, MAX_FRAME_BYTES, NetError, PIPELINE, READ_TIMEOUT};

/// How many slice requests may queue up before `request_slice` blocks.
const REQUEST_QUEUE_DEPTH: usize = 10;

/// How long `request_slice` waits on a full queue before giving up.
const REQUEST_OFFER_TIMEOUT: Duration = Duration::from_millis(5000);

/// Something the transfer loop produced for the caller.
#[derive(Debug)]
pub enum TransferEvent {
    /// All chunks of a slice arrived.
    Complete(SliceCollector),
    /// The server does not hold the slice, usually because it was evicted.
    Unavailable { slice_id: u32 },
}

/// Reassembles one slice from chunks keyed by byte offset.
#[derive(Debug)]
pub struct SliceCollector {
    slice_id: u32,
    total_size: u32,
    expected_chunks: u32,
    issued: u32,
    outstanding: u32,
    received: usize,
    chunks: BTreeMap<u32, Bytes>,
}

impl SliceCollector {
    fn new(slice_id: u32, total_size: u32) -> Self {
        let expected_chunks = total_size.div_ceil(CHUNK_SIZE as u32).max(1);
        Self {
            slice_id,
            total_size,
            expected_chunks,
            issued: 0,
            outstanding: 0,
            received: 0,
            chunks: BTreeMap::new(),
        }
    }

    pub fn slice_id(&self) -> u32 {
        self.slice_id
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn received_bytes(&self) -> usize {
        self.received
    }

    /// Assembles the chunks into one contiguous buffer, offset order.
    pub fn into_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.received);
        for chunk in self.chunks.values() {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    fn next_request(&mut self) -> Option<ChunkRequest> {
        if self.issued >= self.expected_chunks {
            return None;
        }
        let offset = self.issued * CHUNK_SIZE as u32;
        // The final request asks only for the remainder.
        let chunk_size = (self.total_size - offset).min(CHUNK_SIZE as u32);
        self.issued += 1;
        self.outstanding += 1;
        Some(ChunkRequest {
            slice_id: self.slice_id,
            offset,
            chunk_size,
        })
    }

    fn insert(&mut self, offset: u32, chunk: Bytes) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.received += chunk.len();
        self.chunks.insert(offset, chunk);
    }

    fn is_complete(&self) -> bool {
        self.issued == self.expected_chunks && self.outstanding == 0
    }
}

/// Transfer loop handle. Request slices with [`request_slice`], collect the
/// results from [`events`].
///
/// [`request_slice`]: ChunkRequester::request_slice
/// [`events`]: ChunkRequester::events
pub struct ChunkRequester {
    request_tx: Sender<(u32, u32)>,
    events_rx: Receiver<TransferEvent>,
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl ChunkRequester {
    pub fn connect(addr: &str) -> Result<Self, NetError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        let (request_tx, request_rx) = channel::bounded(REQUEST_QUEUE_DEPTH);
        let (events_tx, events_rx) = channel::bounded(REQUEST_QUEUE_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));

        let loop_shutdown = Arc::clone(&shutdown);
        let join = thread::spawn(move || {
            if let Err(err) = run_transfer_loop(stream, request_rx, events_tx, loop_shutdown) {
                tracing::warn!("chunk requester loop error: {err}");
            }
        });

        Ok(Self {
            request_tx,
            events_rx,
            shutdown,
            join,
        })
    }

    /// Queues a slice for transfer. Returns false if the queue stayed full
    /// for the whole offer timeout or the transfer loop is gone.
    pub fn request_slice(&self, slice_id: u32, size_bytes: u32) -> bool {
        self.request_tx
            .send_timeout((slice_id, size_bytes), REQUEST_OFFER_TIMEOUT)
            .is_ok()
    }

    pub fn events(&self) -> &Receiver<TransferEvent> {
        &self.events_rx
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        drop(self.request_tx);
        let _ = self.join.join();
    }
}

fn run_transfer_loop(
    stream: TcpStream,
    request_rx: Receiver<(u32, u32)>,
    events_tx: Sender<TransferEvent>,
    shutdown: Arc<AtomicBool>,
) -> Result<(), NetError> {
    let reader_stream = stream.try_clone()?;
    let mut reader = FrameReader::new(reader_stream, MAX_FRAME_BYTES);
    let mut writer = FrameWriter::new(stream, MAX_FRAME_BYTES);

    let mut open: Vec<SliceCollector> = Vec::new();
    let mut credit = 0usize;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }

        let drained = fill_window(&mut open, &request_rx, &mut credit, &mut |request| {
            let frame = proto::encode_chunk_request(request)?;
            writer.write_frame(&frame)?;
            Ok(())
        })?;
        if drained {
            return Ok(());
        }

        if credit == 0 {
            // Nothing in flight; wait for the next slice request instead of
            // spinning on the socket.
            match request_rx.recv_timeout(READ_TIMEOUT) {
                Ok((slice_id, size_bytes)) => {
                    open.push(SliceCollector::new(slice_id, size_bytes));
                }
                Err(channel::RecvTimeoutError::Timeout) => {}
                Err(channel::RecvTimeoutError::Disconnected) => return Ok(()),
            }
            continue;
        }

        let header_bytes = match reader.read_next_timeout()? {
            NextFrame::TimedOut => continue,
            NextFrame::Closed => return Ok(()),
            NextFrame::Frame(bytes) => bytes,
        };
        let header = match proto::decode_chunk_reply(&header_bytes) {
            Ok(header) => header,
            Err(err) => {
                // Frames stay delimited, so one bad body does not desync
                // the stream. Credit stays held until a real reply lands.
                tracing::warn!("discarding malformed chunk reply: {err}");
                continue;
            }
        };
        credit = credit.saturating_sub(1);

        if !header.available {
            // Only the first miss per slice carries news; later replies for
            // the same evicted slice find no collector.
            if let Some(pos) = open.iter().position(|c| c.slice_id == header.slice_id) {
                open.swap_remove(pos);
                tracing::warn!(slice_id = header.slice_id, "server reports slice unavailable");
                if !deliver(
                    &events_tx,
                    &shutdown,
                    TransferEvent::Unavailable {
                        slice_id: header.slice_id,
                    },
                ) {
                    return Ok(());
                }
            }
            continue;
        }

        let payload = loop {
            match reader.read_next_timeout()? {
                NextFrame::Frame(bytes) => break bytes,
                NextFrame::TimedOut => {
                    if shutdown.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                }
                NextFrame::Closed => return Ok(()),
            }
        };

        let Some(pos) = open.iter().position(|c| c.slice_id == header.slice_id) else {
            tracing::trace!(slice_id = header.slice_id, "chunk for unknown slice");
            continue;
        };
        let collector = &mut open[pos];
        collector.insert(header.offset, Bytes::from(payload));
        if collector.is_complete() {
            let done = open.swap_remove(pos);
            tracing::debug!(
                slice_id = done.slice_id,
                bytes = done.received,
                "slice transfer complete"
            );
            if !deliver(&events_tx, &shutdown, TransferEvent::Complete(done)) {
                return Ok(());
            }
        }
    }
}

/// Spends the credit window on chunk requests, pulling new slices into
/// `open` as existing ones run out of chunks to ask for. Never leaves more
/// than [`PIPELINE`] requests in flight. Returns true once the request
/// channel is gone and no transfer remains to finish.
fn fill_window(
    open: &mut Vec<SliceCollector>,
    request_rx: &Receiver<(u32, u32)>,
    credit: &mut usize,
    issue: &mut dyn FnMut(&ChunkRequest) -> Result<(), NetError>,
) -> Result<bool, NetError> {
    while *credit < PIPELINE {
        if let Some(request) = open.iter_mut().find_map(SliceCollector::next_request) {
            issue(&request)?;
            *credit += 1;
            continue;
        }
        match request_rx.try_recv() {
            Ok((slice_id, size_bytes)) => {
                open.push(SliceCollector::new(slice_id, size_bytes));
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => return Ok(open.is_empty()),
        }
    }
    Ok(false)
}

/// Blocking send that stays responsive to shutdown.
fn deliver(events_tx: &Sender<TransferEvent>, shutdown: &AtomicBool, event: TransferEvent) -> bool {
    let mut event = event;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        match events_tx.send_timeout(event, Duration::from_millis(50)) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => event = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_counts_one_chunk_for_empty_slice() {
        let mut collector = SliceCollector::new(1, 0);
        assert_eq!(collector.expected_chunks, 1);
        let request = collector.next_request().unwrap();
        assert_eq!(request.offset, 0);
        assert_eq!(request.chunk_size, 0);
        assert!(collector.next_request().is_none());

        collector.insert(0, Bytes::new());
        assert!(collector.is_complete());
        assert_eq!(collector.into_bytes().len(), 0);
    }

    #[test]
    fn collector_reassembles_out_of_order_chunks() {
        let chunk = CHUNK_SIZE as u32;
        let mut collector = SliceCollector::new(7, chunk * 2 + 3);
        assert_eq!(collector.expected_chunks, 3);

        let mut requested = Vec::new();
        while let Some(request) = collector.next_request() {
            requested.push((request.offset, request.chunk_size));
        }
        assert_eq!(requested, vec![(0, chunk), (chunk, chunk), (chunk * 2, 3)]);

        collector.insert(chunk * 2, Bytes::from(vec![2u8; 3]));
        collector.insert(0, Bytes::from(vec![0u8; CHUNK_SIZE]));
        assert!(!collector.is_complete());
        collector.insert(chunk, Bytes::from(vec![1u8; CHUNK_SIZE]));
        assert!(collector.is_complete());

        let bytes = collector.into_bytes();
        assert_eq!(bytes.len(), CHUNK_SIZE * 2 + 3);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[CHUNK_SIZE], 1);
        assert_eq!(bytes[CHUNK_SIZE * 2], 2);
    }

    #[test]
    fn window_caps_requests_in_flight_at_pipeline() {
        let (request_tx, request_rx) = channel::bounded(REQUEST_QUEUE_DEPTH);
        // One slice worth four full windows of chunks.
        request_tx
            .send((3, (CHUNK_SIZE * PIPELINE * 4) as u32))
            .unwrap();

        let mut open = Vec::new();
        let mut credit = 0usize;
        let mut sent = Vec::new();

        let drained = fill_window(
            &mut open,
            &request_rx,
            &mut credit,
            &mut |request: &ChunkRequest| {
                sent.push(request.offset);
                Ok(())
            },
        )
        .unwrap();
        assert!(!drained);
        assert_eq!(sent.len(), PIPELINE);
        assert_eq!(credit, PIPELINE);

        // Exhausted window: nothing goes out until a reply frees credit.
        fill_window(
            &mut open,
            &request_rx,
            &mut credit,
            &mut |request: &ChunkRequest| {
                sent.push(request.offset);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(sent.len(), PIPELINE);

        credit -= 1;
        fill_window(
            &mut open,
            &request_rx,
            &mut credit,
            &mut |request: &ChunkRequest| {
                sent.push(request.offset);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(sent.len(), PIPELINE + 1);
        assert_eq!(credit, PIPELINE);
        assert_eq!(sent[PIPELINE], (CHUNK_SIZE * PIPELINE) as u32);
    }

    #[test]
    fn window_reports_drained_channel_once_transfers_finish() {
        let (request_tx, request_rx) = channel::bounded::<(u32, u32)>(1);
        drop(request_tx);

        let mut open = Vec::new();
        let mut credit = 0usize;
        let drained = fill_window(
            &mut open,
            &request_rx,
            &mut credit,
            &mut |_request: &ChunkRequest| Ok(()),
        )
        .unwrap();
        assert!(drained);
    }
}
