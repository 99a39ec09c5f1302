#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod error;
pub mod net;
pub mod remote;
pub mod signals;
pub mod store;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the protocol surface at crate root for convenience
pub use crate::net::{CHUNK_SIZE, PIPELINE};
pub use crate::signals::{
    AblationPoint, AcquireStack, ClientSignal, HardwareDimensions, NumericType, ServerSignal,
    ServerState, ServerStatus, SliceMeta, StackMeta, Vec2i, Vec3,
};
pub use crate::store::SliceStore;
