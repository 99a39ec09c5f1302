//! Data-plane integration: chunked slice transfer over localhost TCP.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use scopewire::net::frame::{FrameReader, FrameWriter};
use scopewire::net::proto::{self, ChunkReply, ChunkRequest};
use scopewire::net::{CHUNK_SIZE, ChunkRequester, ChunkResponder, TransferEvent};
use scopewire::store::SliceStore;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);
const FRAME_CAP: usize = CHUNK_SIZE + 1024;

fn pattern(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

#[test]
fn roundtrips_empty_single_chunk_and_ragged_slices() {
    let sizes: Vec<(u32, usize)> = vec![
        (1, 0),
        (2, CHUNK_SIZE),
        (3, CHUNK_SIZE * 3 + 17),
    ];

    let store = Arc::new(Mutex::new(SliceStore::new(8 * CHUNK_SIZE)));
    {
        let mut store = store.lock().unwrap();
        for (id, size) in &sizes {
            store.put(*id, pattern(*size));
        }
    }

    let responder = ChunkResponder::new("127.0.0.1:0", store).start().expect("responder start");
    let requester =
        ChunkRequester::connect(&responder.local_addr().to_string()).expect("requester connect");

    for (id, size) in &sizes {
        assert!(requester.request_slice(*id, *size as u32), "request queued");
    }

    let mut received: HashMap<u32, Bytes> = HashMap::new();
    while received.len() < sizes.len() {
        match requester.events().recv_timeout(EVENT_TIMEOUT).expect("transfer event") {
            TransferEvent::Complete(collector) => {
                let id = collector.slice_id();
                received.insert(id, collector.into_bytes());
            }
            TransferEvent::Unavailable { slice_id } => {
                panic!("slice {slice_id} unexpectedly unavailable");
            }
        }
    }

    for (id, size) in &sizes {
        assert_eq!(received[id], pattern(*size), "slice {id} content");
    }

    requester.shutdown();
    responder.shutdown();
}

#[test]
fn unknown_slice_surfaces_as_unavailable_without_blocking_others() {
    let store = Arc::new(Mutex::new(SliceStore::new(4 * CHUNK_SIZE)));
    store.lock().unwrap().put(7, pattern(1024));

    let responder = ChunkResponder::new("127.0.0.1:0", store).start().expect("responder start");
    let requester =
        ChunkRequester::connect(&responder.local_addr().to_string()).expect("requester connect");

    assert!(requester.request_slice(99, (CHUNK_SIZE * 2) as u32));
    assert!(requester.request_slice(7, 1024));

    let mut unavailable = None;
    let mut complete = None;
    for _ in 0..2 {
        match requester.events().recv_timeout(EVENT_TIMEOUT).expect("transfer event") {
            TransferEvent::Unavailable { slice_id } => unavailable = Some(slice_id),
            TransferEvent::Complete(collector) => complete = Some(collector),
        }
    }

    assert_eq!(unavailable, Some(99));
    let collector = complete.expect("stored slice still completes");
    assert_eq!(collector.slice_id(), 7);
    assert_eq!(collector.into_bytes(), pattern(1024));

    requester.shutdown();
    responder.shutdown();
}

#[test]
fn requester_skips_a_malformed_reply_and_finishes_the_slice() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let payload = pattern(512);

    let served = payload.clone();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = FrameReader::new(stream.try_clone().expect("clone"), FRAME_CAP);
        let mut writer = FrameWriter::new(stream, FRAME_CAP);

        // Well-framed garbage: passes the checksum, fails CBOR decoding.
        writer.write_frame(b"not a chunk reply").expect("garbage frame");

        let bytes = reader.read_next().expect("request frame").expect("open stream");
        let request = proto::decode_chunk_request(&bytes).expect("chunk request");
        let reply = ChunkReply {
            slice_id: request.slice_id,
            available: true,
            offset: 0,
            chunk_size: served.len() as u32,
        };
        writer
            .write_frame(&proto::encode_chunk_reply(&reply).expect("encode reply"))
            .expect("reply header");
        writer.write_frame(&served).expect("reply payload");
    });

    let requester = ChunkRequester::connect(&addr.to_string()).expect("requester connect");
    assert!(requester.request_slice(24, payload.len() as u32));

    match requester.events().recv_timeout(EVENT_TIMEOUT).expect("transfer event") {
        TransferEvent::Complete(collector) => {
            assert_eq!(collector.slice_id(), 24);
            assert_eq!(collector.into_bytes(), payload);
        }
        TransferEvent::Unavailable { slice_id } => panic!("slice {slice_id} reported unavailable"),
    }

    server.join().expect("serving thread");
    requester.shutdown();
}

#[test]
fn responder_session_survives_a_malformed_request() {
    let store = Arc::new(Mutex::new(SliceStore::new(4 * CHUNK_SIZE)));
    store.lock().unwrap().put(5, pattern(768));

    let responder = ChunkResponder::new("127.0.0.1:0", store).start().expect("responder start");

    let stream = TcpStream::connect(responder.local_addr()).expect("connect");
    stream.set_nodelay(true).expect("nodelay");
    let mut reader = FrameReader::new(stream.try_clone().expect("clone"), FRAME_CAP);
    let mut writer = FrameWriter::new(stream, FRAME_CAP);

    writer.write_frame(b"definitely not cbor").expect("garbage frame");
    let request = ChunkRequest {
        slice_id: 5,
        offset: 0,
        chunk_size: 768,
    };
    writer
        .write_frame(&proto::encode_chunk_request(&request).expect("encode request"))
        .expect("request frame");

    let header_bytes = reader
        .read_next()
        .expect("reply header")
        .expect("session still open");
    let header = proto::decode_chunk_reply(&header_bytes).expect("chunk reply");
    assert!(header.available);
    assert_eq!(header.offset, 0);
    assert_eq!(header.chunk_size, 768);
    let body = reader.read_next().expect("reply payload").expect("payload frame");
    assert_eq!(Bytes::from(body), pattern(768));

    responder.shutdown();
}

#[test]
fn transfers_more_slices_than_the_pipeline_holds() {
    let count = 30u32;
    let size = 2048usize;

    let store = Arc::new(Mutex::new(SliceStore::new(count as usize * size * 2)));
    {
        let mut store = store.lock().unwrap();
        for id in 1..=count {
            store.put(id, pattern(size));
        }
    }

    let responder = ChunkResponder::new("127.0.0.1:0", store).start().expect("responder start");
    let requester =
        ChunkRequester::connect(&responder.local_addr().to_string()).expect("requester connect");

    let mut seen = 0;
    let mut queued = 0u32;
    while seen < count {
        // The request queue is shallower than the slice count, so interleave
        // queueing with draining.
        while queued < count && requester.request_slice(queued + 1, size as u32) {
            queued += 1;
        }
        match requester.events().recv_timeout(EVENT_TIMEOUT).expect("transfer event") {
            TransferEvent::Complete(collector) => {
                assert_eq!(collector.into_bytes(), pattern(size));
                seen += 1;
            }
            TransferEvent::Unavailable { slice_id } => {
                panic!("slice {slice_id} unexpectedly unavailable");
            }
        }
    }

    requester.shutdown();
    responder.shutdown();
}
