//! Server side of the control signal bus.
//!
//! One bus loop owns the client registry. Per connection there is a reader
//! thread (decodes inbound [`ClientSignal`]s) and a writer thread (drains a
//! bounded per-client outbound queue). A client joins the registry with its
//! first inbound signal, not on TCP accept, and leaves it when its
//! connection drops. Broadcasting a `Status` with state `ShuttingDown` is
//! the regular way to stop the bus: it is fanned out first, then the loop
//! terminates and tears every session down.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use crate::net::frame::{FrameReader, FrameWriter, NextFrame};
use crate::net::proto;
use crate::net::{MAX_FRAME_BYTES, NetError, READ_TIMEOUT};
use crate::signals::{ClientSignal, ServerSignal};

/// Outbound signals queued per client and for the bus as a whole.
const SIGNAL_QUEUE_DEPTH: usize = 100;

/// Pause between sends while fanning one signal out to the registry.
const FANOUT_PAUSE: Duration = Duration::from_millis(1);

pub type ClientId = u64;

/// Invoked on the bus loop thread for every inbound client signal.
pub type SignalListener = Box<dyn Fn(ClientId, &ClientSignal) + Send>;

enum BusEvent {
    Connected {
        id: ClientId,
        outbound: Sender<ServerSignal>,
    },
    Inbound {
        id: ClientId,
        signal: ClientSignal,
    },
    Disconnected {
        id: ClientId,
    },
}

/// Control bus under construction; listeners attach before `start`.
pub struct SignalBus {
    listen_addr: String,
    listeners: Vec<SignalListener>,
}

pub struct SignalBusHandle {
    broadcast_tx: Sender<ServerSignal>,
    shutdown: Arc<AtomicBool>,
    connected: Arc<AtomicU32>,
    bus_join: JoinHandle<()>,
    accept_join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl SignalBusHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Clients currently in the registry, i.e. signed on.
    pub fn connected_clients(&self) -> u32 {
        self.connected.load(Ordering::Relaxed)
    }

    /// Queues a signal for fan-out to every registered client. Returns false
    /// if the bus queue stayed full or the bus loop is gone.
    pub fn broadcast(&self, signal: ServerSignal) -> bool {
        self.broadcast_tx
            .send_timeout(signal, Duration::from_millis(5000))
            .is_ok()
    }

    /// Sender half of the broadcast queue, for loops that outlive borrows
    /// of this handle.
    pub fn broadcaster(&self) -> Sender<ServerSignal> {
        self.broadcast_tx.clone()
    }

    pub(crate) fn connected_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.connected)
    }

    /// Waits for the bus to terminate on its own, which happens after a
    /// `ShuttingDown` status has been fanned out.
    pub fn join(self) {
        let _ = self.bus_join.join();
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.accept_join.join();
    }

    /// Immediate stop without the shutdown broadcast.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.bus_join.join();
        let _ = self.accept_join.join();
    }
}

impl SignalBus {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            listeners: Vec::new(),
        }
    }

    /// Adds a listener for inbound client signals. Runs on the bus thread,
    /// so it must not block for long.
    pub fn on_signal(mut self, listener: SignalListener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn start(self) -> Result<SignalBusHandle, NetError> {
        let listener = TcpListener::bind(&self.listen_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicU32::new(0));
        let (events_tx, events_rx) = channel::bounded(SIGNAL_QUEUE_DEPTH);
        let (broadcast_tx, broadcast_rx) = channel::bounded(SIGNAL_QUEUE_DEPTH);

        let bus_shutdown = Arc::clone(&shutdown);
        let bus_connected = Arc::clone(&connected);
        let listeners = self.listeners;
        let bus_join = thread::spawn(move || {
            run_bus_loop(events_rx, broadcast_rx, listeners, bus_shutdown, bus_connected);
        });

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_join =
            thread::spawn(move || run_accept_loop(listener, events_tx, accept_shutdown));

        tracing::info!(%local_addr, "signal bus listening");
        Ok(SignalBusHandle {
            broadcast_tx,
            shutdown,
            connected,
            bus_join,
            accept_join,
            local_addr,
        })
    }
}

fn run_bus_loop(
    events_rx: Receiver<BusEvent>,
    broadcast_rx: Receiver<ServerSignal>,
    listeners: Vec<SignalListener>,
    shutdown: Arc<AtomicBool>,
    connected: Arc<AtomicU32>,
) {
    let mut sessions: HashMap<ClientId, Sender<ServerSignal>> = HashMap::new();
    // Fan-out order is sign-on order.
    let mut registry: Vec<ClientId> = Vec::new();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        crossbeam::select! {
            recv(events_rx) -> event => {
                let Ok(event) = event else { break };
                match event {
                    BusEvent::Connected { id, outbound } => {
                        sessions.insert(id, outbound);
                    }
                    BusEvent::Inbound { id, signal } => {
                        if !registry.contains(&id) {
                            registry.push(id);
                            connected.store(registry.len() as u32, Ordering::Relaxed);
                            tracing::info!(client = id, "client registered");
                        }
                        for listener in &listeners {
                            listener(id, &signal);
                        }
                    }
                    BusEvent::Disconnected { id } => {
                        sessions.remove(&id);
                        registry.retain(|known| *known != id);
                        connected.store(registry.len() as u32, Ordering::Relaxed);
                        tracing::info!(client = id, "client disconnected");
                    }
                }
            }
            recv(broadcast_rx) -> signal => {
                let Ok(signal) = signal else { break };
                let closing = matches!(
                    &signal,
                    ServerSignal::Status(status) if status.is_shutting_down()
                );
                for id in &registry {
                    if let Some(outbound) = sessions.get(id) {
                        if outbound.send_timeout(signal.clone(), READ_TIMEOUT).is_err() {
                            tracing::warn!(client = *id, "dropping signal for stalled client");
                        }
                    }
                    thread::sleep(FANOUT_PAUSE);
                }
                if closing {
                    tracing::info!("shutdown status fanned out, stopping signal bus");
                    break;
                }
            }
            default(READ_TIMEOUT) => {}
        }
    }

    // Dropping the outbound senders ends every writer thread; readers stop
    // on the shutdown flag or when the peer closes.
    shutdown.store(true, Ordering::Relaxed);
    drop(sessions);
}

fn run_accept_loop(listener: TcpListener, events_tx: Sender<BusEvent>, shutdown: Arc<AtomicBool>) {
    let next_id = AtomicU64::new(1);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(client = id, %peer, "control connection accepted");
                if let Err(err) = spawn_session(id, stream, &events_tx, &shutdown) {
                    tracing::warn!(client = id, "control session setup failed: {err}");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                tracing::warn!("signal bus accept error: {err}");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn spawn_session(
    id: ClientId,
    stream: TcpStream,
    events_tx: &Sender<BusEvent>,
    shutdown: &Arc<AtomicBool>,
) -> Result<(), NetError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let (outbound_tx, outbound_rx) = channel::bounded::<ServerSignal>(SIGNAL_QUEUE_DEPTH);
    if events_tx
        .send(BusEvent::Connected {
            id,
            outbound: outbound_tx,
        })
        .is_err()
    {
        return Ok(());
    }

    let writer_stream = stream.try_clone()?;
    thread::spawn(move || {
        if let Err(err) = run_session_writer(writer_stream, outbound_rx) {
            tracing::debug!(client = id, "control writer ended: {err}");
        }
    });

    let events_tx = events_tx.clone();
    let shutdown = Arc::clone(shutdown);
    thread::spawn(move || {
        if let Err(err) = run_session_reader(id, stream, &events_tx, &shutdown) {
            tracing::warn!(client = id, "control reader error: {err}");
        }
        let _ = events_tx.send(BusEvent::Disconnected { id });
    });

    Ok(())
}

fn run_session_reader(
    id: ClientId,
    stream: TcpStream,
    events_tx: &Sender<BusEvent>,
    shutdown: &AtomicBool,
) -> Result<(), NetError> {
    let mut reader = FrameReader::new(stream, MAX_FRAME_BYTES);
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        match reader.read_next_timeout()? {
            NextFrame::TimedOut => continue,
            NextFrame::Closed => return Ok(()),
            NextFrame::Frame(bytes) => match proto::decode_client_signal(&bytes) {
                Ok(signal) => {
                    if events_tx.send(BusEvent::Inbound { id, signal }).is_err() {
                        return Ok(());
                    }
                }
                Err(err) => {
                    tracing::warn!(client = id, "discarding malformed client signal: {err}");
                }
            },
        }
    }
}

fn run_session_writer(
    stream: TcpStream,
    outbound_rx: Receiver<ServerSignal>,
) -> Result<(), NetError> {
    let mut writer = FrameWriter::new(stream, MAX_FRAME_BYTES);
    // Ends when the bus loop drops the sender.
    while let Ok(signal) = outbound_rx.recv() {
        writer.write_frame(&proto::encode_server_signal(&signal)?)?;
    }
    Ok(())
}
