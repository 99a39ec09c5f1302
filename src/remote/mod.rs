//! End-to-end orchestration of one remote microscope.

pub mod client;
pub mod hardware;
pub mod server;

pub use client::{ClientEvent, RemoteClient};
pub use hardware::{HardwareEvent, MicroscopeHardware, SimulatedStage};
pub use server::{RemoteServerConfig, RemoteServerHandle, start as start_server};
