//! Control-plane integration: registry fan-out and the shutdown handshake.

use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, bounded};
use scopewire::net::{SignalBus, SignalBusHandle, SignalClient, SignalClientHandle};
use scopewire::{
    HardwareDimensions, NumericType, ServerSignal, ServerState, ServerStatus, SliceMeta, Vec2i,
    Vec3,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn dims() -> HardwareDimensions {
    HardwareDimensions {
        stage_min: Vec3::new(0.0, 0.0, 0.0),
        stage_max: Vec3::new(100.0, 100.0, 50.0),
        image_size: Vec2i::new(64, 48),
        vertex_diameter: 1.0,
        numeric_type: NumericType::Int16,
    }
}

fn status(state: ServerState) -> ServerSignal {
    ServerSignal::Status(ServerStatus {
        state,
        data_ports: vec![0],
        connected_clients: 0,
        hardware_dimensions: dims(),
    })
}

fn connect_client(addr: &str) -> (SignalClientHandle, Receiver<ServerSignal>) {
    let (tx, rx) = bounded(100);
    let handle = SignalClient::new(addr)
        .on_signal(Box::new(move |signal| {
            let _ = tx.send(signal.clone());
        }))
        .connect()
        .expect("client connect");
    (handle, rx)
}

fn wait_for_clients(bus: &SignalBusHandle, expected: u32) {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while bus.connected_clients() < expected {
        assert!(Instant::now() < deadline, "clients never signed on");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn broadcast_reaches_each_signed_on_client_exactly_once() {
    let bus = SignalBus::new("127.0.0.1:0").start().expect("bus start");
    let addr = bus.local_addr().to_string();

    let (client_a, events_a) = connect_client(&addr);
    let (client_b, events_b) = connect_client(&addr);
    wait_for_clients(&bus, 2);

    let meta = SliceMeta {
        id: 42,
        created_at_ms: 1,
        stage_pos: Vec3::new(1.0, 2.0, 3.0),
        size_bytes: 512,
        stack_id: None,
    };
    assert!(bus.broadcast(ServerSignal::SliceAvailable(meta.clone())));

    for events in [&events_a, &events_b] {
        let signal = events.recv_timeout(EVENT_TIMEOUT).expect("fan-out signal");
        match signal {
            ServerSignal::SliceAvailable(received) => assert_eq!(received, meta),
            other => panic!("unexpected signal: {other:?}"),
        }
        // Nothing else was broadcast, so nothing else may arrive.
        assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    }

    assert!(bus.broadcast(status(ServerState::ShuttingDown)));
    client_a.join();
    client_b.join();
    bus.join();
}

#[test]
fn shutdown_status_terminates_server_and_client_loops() {
    let bus = SignalBus::new("127.0.0.1:0").start().expect("bus start");
    let addr = bus.local_addr().to_string();

    let (client, events) = connect_client(&addr);
    wait_for_clients(&bus, 1);

    assert!(bus.broadcast(status(ServerState::ShuttingDown)));

    let signal = events.recv_timeout(EVENT_TIMEOUT).expect("shutdown status");
    match signal {
        ServerSignal::Status(received) => assert!(received.is_shutting_down()),
        other => panic!("unexpected signal: {other:?}"),
    }

    // Both loops end on their own; these joins returning is the assertion.
    client.join();
    bus.join();
}

#[test]
fn late_client_joins_the_registry_after_sign_on() {
    let bus = SignalBus::new("127.0.0.1:0").start().expect("bus start");
    let addr = bus.local_addr().to_string();

    let (first, first_events) = connect_client(&addr);
    wait_for_clients(&bus, 1);

    assert!(bus.broadcast(status(ServerState::Manual)));
    assert!(first_events.recv_timeout(EVENT_TIMEOUT).is_ok());

    let (second, second_events) = connect_client(&addr);
    wait_for_clients(&bus, 2);

    assert!(bus.broadcast(status(ServerState::Live)));
    for events in [&first_events, &second_events] {
        let signal = events.recv_timeout(EVENT_TIMEOUT).expect("post-sign-on signal");
        match signal {
            ServerSignal::Status(received) => assert_eq!(received.state, ServerState::Live),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    assert!(bus.broadcast(status(ServerState::ShuttingDown)));
    first.join();
    second.join();
    bus.join();
}
