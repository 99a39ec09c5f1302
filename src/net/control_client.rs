//! Client side of the control signal bus.
//!
//! One loop thread per connection. Each pass drains everything the server
//! sent, dispatching listeners synchronously, then drains the outbound
//! queue, then sleeps. `SignOn` is always the first message on the wire. A
//! `Status` with state `ShuttingDown` moves the link Running -> Closing ->
//! Closed; there is no way back.

use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use crate::net::frame::{FrameReader, FrameWriter, NextFrame};
use crate::net::proto;
use crate::net::{MAX_FRAME_BYTES, NetError};
use crate::signals::{ClientSignal, ServerSignal};

const OUTBOUND_QUEUE_DEPTH: usize = 100;
const SEND_PAUSE: Duration = Duration::from_millis(1);
const IDLE_SLEEP: Duration = Duration::from_millis(200);
const INBOUND_POLL: Duration = Duration::from_millis(10);

/// Invoked on the client loop thread for every inbound server signal.
pub type ServerSignalListener = Box<dyn Fn(&ServerSignal) + Send>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Running,
    Closing,
}

/// Control connection under construction; listeners attach before `connect`.
pub struct SignalClient {
    addr: String,
    listeners: Vec<ServerSignalListener>,
}

pub struct SignalClientHandle {
    outbound_tx: Sender<ClientSignal>,
    shutdown: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl SignalClientHandle {
    /// Queues a signal for the server. Returns false if the queue stayed
    /// full for five seconds or the connection loop is gone.
    pub fn send(&self, signal: ClientSignal) -> bool {
        self.outbound_tx
            .send_timeout(signal, Duration::from_millis(5000))
            .is_ok()
    }

    /// True once the loop has ended, normally after a `ShuttingDown` status.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Waits for the connection loop to end on its own.
    pub fn join(self) {
        let _ = self.join.join();
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

impl SignalClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            listeners: Vec::new(),
        }
    }

    /// Adds a listener for inbound server signals. Runs on the connection
    /// loop thread, so it must not block for long.
    pub fn on_signal(mut self, listener: ServerSignalListener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn connect(self) -> Result<SignalClientHandle, NetError> {
        let stream = TcpStream::connect(&self.addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(INBOUND_POLL))?;

        let (outbound_tx, outbound_rx) = channel::bounded(OUTBOUND_QUEUE_DEPTH);
        // The server registers a client on its first inbound signal, so the
        // sign-on goes out before anything else can be queued.
        let _ = outbound_tx.send(ClientSignal::SignOn);

        let shutdown = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let loop_shutdown = Arc::clone(&shutdown);
        let loop_closed = Arc::clone(&closed);
        let listeners = self.listeners;
        let join = thread::spawn(move || {
            if let Err(err) = run_client_loop(stream, outbound_rx, listeners, loop_shutdown) {
                tracing::warn!("signal client loop error: {err}");
            }
            loop_closed.store(true, Ordering::Relaxed);
        });

        Ok(SignalClientHandle {
            outbound_tx,
            shutdown,
            closed,
            join,
        })
    }
}

fn run_client_loop(
    stream: TcpStream,
    outbound_rx: Receiver<ClientSignal>,
    listeners: Vec<ServerSignalListener>,
    shutdown: Arc<AtomicBool>,
) -> Result<(), NetError> {
    let reader_stream = stream.try_clone()?;
    let mut reader = FrameReader::new(reader_stream, MAX_FRAME_BYTES);
    let mut writer = FrameWriter::new(stream, MAX_FRAME_BYTES);
    let mut state = LinkState::Running;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }

        // Everything the server has sent so far.
        loop {
            match reader.read_next_timeout()? {
                NextFrame::TimedOut => break,
                NextFrame::Closed => return Ok(()),
                NextFrame::Frame(bytes) => {
                    let signal = match proto::decode_server_signal(&bytes) {
                        Ok(signal) => signal,
                        Err(err) => {
                            tracing::warn!("discarding malformed server signal: {err}");
                            continue;
                        }
                    };
                    for listener in &listeners {
                        listener(&signal);
                    }
                    if let ServerSignal::Status(status) = &signal
                        && status.is_shutting_down()
                    {
                        tracing::info!("server is shutting down, closing control link");
                        state = LinkState::Closing;
                    }
                }
            }
        }

        if state == LinkState::Closing {
            return Ok(());
        }

        // Everything the caller has queued.
        loop {
            match outbound_rx.try_recv() {
                Ok(signal) => {
                    writer.write_frame(&proto::encode_client_signal(&signal)?)?;
                    thread::sleep(SEND_PAUSE);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }

        thread::sleep(IDLE_SLEEP);
    }
}
