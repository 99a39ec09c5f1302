//! Consumer-side orchestrator: announcements in, assembled slices out.
//!
//! Joins the control bus and the data plane of one server. Every
//! `SliceAvailable` announcement turns into a transfer request; completed
//! transfers surface as [`ClientEvent::SliceReady`] with the announced
//! metadata attached.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::net::NetError;
use crate::net::control_client::{SignalClient, SignalClientHandle};
use crate::net::data_client::{ChunkRequester, TransferEvent};
use crate::signals::{
    AblationPoint, AcquireStack, ClientSignal, ServerSignal, ServerStatus, SliceMeta, StackMeta,
    Vec3,
};

const EVENT_QUEUE_DEPTH: usize = 100;
const TRANSFER_POLL: Duration = Duration::from_millis(50);

/// What the remote microscope produced, as seen from this client.
#[derive(Debug)]
pub enum ClientEvent {
    Status(ServerStatus),
    Stack(StackMeta),
    SliceReady { meta: SliceMeta, data: Bytes },
    /// The server no longer holds an announced slice.
    SliceDropped { slice_id: u32 },
}

pub struct RemoteClient {
    control: SignalClientHandle,
    events_rx: Receiver<ClientEvent>,
    shutdown: Arc<AtomicBool>,
    loop_join: JoinHandle<()>,
}

impl RemoteClient {
    pub fn connect(control_addr: &str, data_addr: &str) -> Result<Self, NetError> {
        let (signal_tx, signal_rx) = channel::bounded::<ServerSignal>(EVENT_QUEUE_DEPTH);
        let control = SignalClient::new(control_addr)
            .on_signal(Box::new(move |signal| {
                if signal_tx.send(signal.clone()).is_err() {
                    tracing::warn!("client loop gone, dropping server signal");
                }
            }))
            .connect()?;
        let requester = match ChunkRequester::connect(data_addr) {
            Ok(requester) => requester,
            Err(err) => {
                control.shutdown();
                return Err(err);
            }
        };

        let (events_tx, events_rx) = channel::bounded(EVENT_QUEUE_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));
        let loop_shutdown = Arc::clone(&shutdown);
        let loop_join = thread::spawn(move || {
            run_client_loop(requester, signal_rx, events_tx, loop_shutdown);
        });

        Ok(Self {
            control,
            events_rx,
            shutdown,
            loop_join,
        })
    }

    /// Assembled slices, status updates and drop notices.
    pub fn events(&self) -> &Receiver<ClientEvent> {
        &self.events_rx
    }

    pub fn move_stage(&self, target: Vec3) -> bool {
        self.control.send(ClientSignal::MoveStage { target })
    }

    pub fn snap_image(&self) -> bool {
        self.control.send(ClientSignal::SnapImage)
    }

    pub fn acquire_stack(&self, request: AcquireStack) -> bool {
        self.control.send(ClientSignal::AcquireStack(request))
    }

    pub fn ablate_points(&self, points: Vec<AblationPoint>) -> bool {
        self.control.send(ClientSignal::AblatePoints { points })
    }

    pub fn stop(&self) -> bool {
        self.control.send(ClientSignal::Stop)
    }

    /// Asks the server to shut down; the control link closes once the
    /// shutdown status comes back.
    pub fn request_server_shutdown(&self) -> bool {
        self.control.send(ClientSignal::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// Waits for the server's shutdown status to close the control link,
    /// then stops the local loops.
    pub fn join(self) {
        self.control.join();
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.loop_join.join();
    }

    /// Immediate local teardown without waiting on the server.
    pub fn close(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.loop_join.join();
        self.control.shutdown();
    }
}

fn run_client_loop(
    requester: ChunkRequester,
    signal_rx: Receiver<ServerSignal>,
    events_tx: Sender<ClientEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let mut pending: HashMap<u32, SliceMeta> = HashMap::new();
    let mut closing = false;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        loop {
            match signal_rx.try_recv() {
                Ok(ServerSignal::Status(status)) => {
                    if status.is_shutting_down() {
                        closing = true;
                    }
                    let _ = events_tx.send(ClientEvent::Status(status));
                }
                Ok(ServerSignal::SliceAvailable(meta)) => {
                    if requester.request_slice(meta.id, meta.size_bytes) {
                        pending.insert(meta.id, meta);
                    } else {
                        tracing::warn!(slice_id = meta.id, "transfer queue full, skipping slice");
                    }
                }
                Ok(ServerSignal::StackAvailable(stack)) => {
                    let _ = events_tx.send(ClientEvent::Stack(stack));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closing = true;
                    break;
                }
            }
        }

        match requester.events().recv_timeout(TRANSFER_POLL) {
            Ok(TransferEvent::Complete(collector)) => {
                let slice_id = collector.slice_id();
                let Some(meta) = pending.remove(&slice_id) else {
                    tracing::warn!(slice_id, "transfer finished for unannounced slice, dropping");
                    continue;
                };
                if meta.size_bytes as usize != collector.received_bytes() {
                    tracing::error!(
                        slice_id,
                        announced = meta.size_bytes,
                        received = collector.received_bytes(),
                        "slice size mismatch, delivering anyway"
                    );
                }
                let _ = events_tx.send(ClientEvent::SliceReady {
                    meta,
                    data: collector.into_bytes(),
                });
            }
            Ok(TransferEvent::Unavailable { slice_id }) => {
                pending.remove(&slice_id);
                tracing::warn!(slice_id, "announced slice already gone from the server");
                let _ = events_tx.send(ClientEvent::SliceDropped { slice_id });
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if closing && pending.is_empty() {
            break;
        }
    }

    requester.shutdown();
}
