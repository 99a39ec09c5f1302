//! Producer-side orchestrator: hardware in, slices and status out.
//!
//! Owns the hardware on its own loop thread and wires it to the two
//! transport components. Slices land in the shared store and are announced
//! on the control bus; client commands come back in through a bounded
//! channel fed by the bus listener.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use crate::net::NetError;
use crate::net::control_server::{SignalBus, SignalBusHandle};
use crate::net::data_server::{ChunkResponder, ChunkResponderHandle};
use crate::remote::hardware::{HardwareEvent, MicroscopeHardware};
use crate::signals::{ClientSignal, ServerSignal, ServerState, ServerStatus};
use crate::store::SharedSliceStore;

const COMMAND_QUEUE_DEPTH: usize = 100;
const HARDWARE_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct RemoteServerConfig {
    /// Control bus listen address, e.g. `127.0.0.1:4400`.
    pub control_addr: String,
    /// Data plane listen address, by convention control port + 1.
    pub data_addr: String,
}

pub struct RemoteServerHandle {
    control: SignalBusHandle,
    data: ChunkResponderHandle,
    command_tx: Sender<ClientSignal>,
    loop_join: JoinHandle<()>,
}

impl RemoteServerHandle {
    pub fn control_port(&self) -> u16 {
        self.control.port()
    }

    pub fn data_port(&self) -> u16 {
        self.data.port()
    }

    /// Asks the server loop to shut down, same as a client `Shutdown`.
    pub fn request_shutdown(&self) -> bool {
        self.command_tx.send(ClientSignal::Shutdown).is_ok()
    }

    /// Waits for the server loop to end, then tears the transports down.
    /// The control bus terminates once the shutdown status has been fanned
    /// out; the data plane is stopped last.
    pub fn join(self) {
        let _ = self.loop_join.join();
        self.control.join();
        self.data.shutdown();
    }
}

/// Starts the transports and the server loop. The loop runs until a
/// `Shutdown` command arrives, from a client or from the handle.
pub fn start(
    hardware: Box<dyn MicroscopeHardware>,
    store: SharedSliceStore,
    config: RemoteServerConfig,
) -> Result<RemoteServerHandle, NetError> {
    let data = ChunkResponder::new(config.data_addr.clone(), store.clone()).start()?;

    let (command_tx, command_rx) = channel::bounded(COMMAND_QUEUE_DEPTH);
    let listener_tx = command_tx.clone();
    let bus = SignalBus::new(config.control_addr.clone()).on_signal(Box::new(
        move |client, signal| {
            if listener_tx.send(signal.clone()).is_err() {
                tracing::warn!(client, "server loop gone, dropping client signal");
            }
        },
    ));
    let control = match bus.start() {
        Ok(control) => control,
        Err(err) => {
            data.shutdown();
            return Err(err);
        }
    };

    let runtime = ServerRuntime {
        hardware,
        store,
        command_rx,
        broadcast_tx: control.broadcaster(),
        connected: control.connected_counter(),
        data_port: data.port(),
    };
    let loop_join = thread::spawn(move || runtime.run());

    Ok(RemoteServerHandle {
        control,
        data,
        command_tx,
        loop_join,
    })
}

struct ServerRuntime {
    hardware: Box<dyn MicroscopeHardware>,
    store: SharedSliceStore,
    command_rx: Receiver<ClientSignal>,
    broadcast_tx: Sender<ServerSignal>,
    connected: Arc<std::sync::atomic::AtomicU32>,
    data_port: u16,
}

impl ServerRuntime {
    fn run(mut self) {
        tracing::info!("remote microscope server loop started");
        loop {
            let mut closing = false;
            loop {
                match self.command_rx.try_recv() {
                    Ok(ClientSignal::Shutdown) => {
                        closing = true;
                        break;
                    }
                    Ok(signal) => self.handle_command(signal),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closing = true;
                        break;
                    }
                }
            }
            if closing {
                break;
            }

            if let Some(event) = self.hardware.poll_event(HARDWARE_POLL) {
                self.handle_event(event);
            }
        }

        self.hardware.shutdown();
        self.broadcast(self.status(ServerState::ShuttingDown));
        tracing::info!("remote microscope server loop stopped");
    }

    fn handle_command(&mut self, signal: ClientSignal) {
        match signal {
            ClientSignal::SignOn => {
                self.broadcast(self.status(self.hardware.state()));
            }
            ClientSignal::MoveStage { target } => {
                match self.hardware.dimensions().clamp_to_stage(target) {
                    Ok(clamped) => self.hardware.move_stage(clamped),
                    Err(err) => tracing::warn!("ignoring stage move: {err}"),
                }
            }
            ClientSignal::SnapImage => self.hardware.snap_image(),
            ClientSignal::AcquireStack(request) => self.hardware.acquire_stack(request),
            ClientSignal::AblatePoints { points } => self.hardware.ablate_points(points),
            ClientSignal::Stop => self.hardware.stop(),
            // Handled by the loop before dispatch.
            ClientSignal::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: HardwareEvent) {
        match event {
            HardwareEvent::SliceProduced { meta, data } => {
                self.store
                    .lock()
                    .expect("slice store lock poisoned")
                    .put(meta.id, data);
                self.broadcast(ServerSignal::SliceAvailable(meta));
            }
            HardwareEvent::StackStarted(stack) => {
                self.broadcast(ServerSignal::StackAvailable(stack));
            }
            HardwareEvent::StatusChanged(state) => {
                self.broadcast(self.status(state));
            }
        }
    }

    fn status(&self, state: ServerState) -> ServerSignal {
        ServerSignal::Status(ServerStatus {
            state,
            data_ports: vec![self.data_port],
            connected_clients: self.connected.load(Ordering::Relaxed),
            hardware_dimensions: self.hardware.dimensions(),
        })
    }

    fn broadcast(&self, signal: ServerSignal) {
        if self.broadcast_tx.send(signal).is_err() {
            tracing::warn!("control bus gone, dropping broadcast");
        }
    }
}
