//! Domain signal types shared by both ends of the control plane.
//!
//! Commands and notices are closed enums; dispatch sites match exhaustively
//! so a new signal variant is a compile error everywhere it matters.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Stage-space position or extent, in micrometers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn component(&self, axis: usize) -> f32 {
        match axis {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    fn with_component(mut self, axis: usize, value: f32) -> Self {
        match axis {
            0 => self.x = value,
            1 => self.y = value,
            _ => self.z = value,
        }
        self
    }
}

/// Pixel-space coordinate (image sizes, ROI corners).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Vec2i {
    pub x: i32,
    pub y: i32,
}

impl Vec2i {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Pixel format of produced imagery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumericType {
    Int8,
    Int16,
    Float32,
}

impl NumericType {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            NumericType::Int8 => 1,
            NumericType::Int16 => 2,
            NumericType::Float32 => 4,
        }
    }
}

/// If a clamped stage target is further than this from the request, refuse
/// to move instead of silently snapping to the edge.
const STAGE_SAFETY_CUTOFF: f32 = 1000.0;

#[derive(Debug, Error, PartialEq)]
#[error(
    "stage target ({target:?}) is more than {cutoff} um outside the allowed area ({min:?}..{max:?})"
)]
pub struct StageBoundsError {
    pub target: Vec3,
    pub min: Vec3,
    pub max: Vec3,
    pub cutoff: f32,
}

/// Static description of the attached hardware, sent to clients at sign-on.
#[derive(Clone, Debug, PartialEq)]
pub struct HardwareDimensions {
    pub stage_min: Vec3,
    pub stage_max: Vec3,
    pub image_size: Vec2i,
    pub vertex_diameter: f32,
    pub numeric_type: NumericType,
}

impl HardwareDimensions {
    /// Byte size of one slice produced by this hardware.
    pub fn slice_byte_size(&self) -> usize {
        self.image_size.x.max(0) as usize
            * self.image_size.y.max(0) as usize
            * self.numeric_type.bytes_per_pixel()
    }

    /// Clamp a stage target into the legal area.
    ///
    /// Targets further than [`STAGE_SAFETY_CUTOFF`] outside the area are an
    /// error: a request that far off is a caller bug, not a rounding issue.
    pub fn clamp_to_stage(&self, target: Vec3) -> Result<Vec3, StageBoundsError> {
        let mut safe = target;
        for axis in 0..3 {
            let clamped = target
                .component(axis)
                .clamp(self.stage_min.component(axis), self.stage_max.component(axis));
            if (clamped - target.component(axis)).abs() > STAGE_SAFETY_CUTOFF {
                return Err(StageBoundsError {
                    target,
                    min: self.stage_min,
                    max: self.stage_max,
                    cutoff: STAGE_SAFETY_CUTOFF,
                });
            }
            safe = safe.with_component(axis, clamped);
        }
        if safe != target {
            tracing::warn!(?target, ?safe, "clamped stage target into allowed area");
        }
        Ok(safe)
    }
}

/// Lifecycle state announced by the server in status signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Startup,
    Manual,
    Live,
    Stack,
    ShuttingDown,
}

/// Metadata of one produced slice. The payload travels on the data plane.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceMeta {
    pub id: u32,
    pub created_at_ms: u64,
    pub stage_pos: Vec3,
    pub size_bytes: u32,
    /// Set when the slice belongs to a stack acquisition.
    pub stack_id: Option<u32>,
}

/// Metadata of a stack acquisition (a linked series of slices).
#[derive(Clone, Debug, PartialEq)]
pub struct StackMeta {
    pub id: u32,
    pub from: Vec3,
    pub to: Vec3,
    pub slice_count: u32,
    pub created_at_ms: u64,
}

/// One point of an ablation path.
#[derive(Clone, Debug, PartialEq)]
pub struct AblationPoint {
    pub position: Vec3,
    pub dwell_time_ms: u64,
    pub laser_on: bool,
    pub laser_off: bool,
    pub laser_power: f32,
    pub count_move_time: bool,
}

/// Parameters of a stack acquisition request.
#[derive(Clone, Debug, PartialEq)]
pub struct AcquireStack {
    pub start: Vec3,
    pub end: Vec3,
    pub step_size: f32,
    pub live: bool,
    pub roi_start: Vec2i,
    pub roi_end: Vec2i,
}

/// Client-to-server control commands.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientSignal {
    /// First message every client sends; the server answers with its status.
    SignOn,
    MoveStage { target: Vec3 },
    SnapImage,
    AcquireStack(AcquireStack),
    AblatePoints { points: Vec<AblationPoint> },
    Stop,
    Shutdown,
}

/// Server status, broadcast on sign-on and on every state change.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerStatus {
    pub state: ServerState,
    pub data_ports: Vec<u16>,
    pub connected_clients: u32,
    pub hardware_dimensions: HardwareDimensions,
}

impl ServerStatus {
    pub fn is_shutting_down(&self) -> bool {
        self.state == ServerState::ShuttingDown
    }
}

/// Server-to-client notices.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerSignal {
    Status(ServerStatus),
    SliceAvailable(SliceMeta),
    StackAvailable(StackMeta),
}

/// Wall-clock milliseconds since the Unix epoch, for signal timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> HardwareDimensions {
        HardwareDimensions {
            stage_min: Vec3::new(0.0, 0.0, 0.0),
            stage_max: Vec3::new(100.0, 100.0, 50.0),
            image_size: Vec2i::new(32, 16),
            vertex_diameter: 1.0,
            numeric_type: NumericType::Int16,
        }
    }

    #[test]
    fn slice_byte_size_uses_pixel_format() {
        assert_eq!(dims().slice_byte_size(), 32 * 16 * 2);
    }

    #[test]
    fn clamp_inside_area_is_identity() {
        let target = Vec3::new(10.0, 20.0, 30.0);
        assert_eq!(dims().clamp_to_stage(target), Ok(target));
    }

    #[test]
    fn clamp_snaps_nearby_target_to_edge() {
        let clamped = dims().clamp_to_stage(Vec3::new(-5.0, 50.0, 60.0)).unwrap();
        assert_eq!(clamped, Vec3::new(0.0, 50.0, 50.0));
    }

    #[test]
    fn clamp_refuses_far_off_target() {
        let err = dims()
            .clamp_to_stage(Vec3::new(5000.0, 0.0, 0.0))
            .unwrap_err();
        assert_eq!(err.cutoff, STAGE_SAFETY_CUTOFF);
    }
}
