//! Hardware abstraction for the producer side.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::signals::{
    AblationPoint, AcquireStack, HardwareDimensions, NumericType, ServerState, SliceMeta,
    StackMeta, Vec2i, Vec3, now_ms,
};

/// Something the hardware produced on its own schedule.
#[derive(Debug)]
pub enum HardwareEvent {
    SliceProduced { meta: SliceMeta, data: Bytes },
    StackStarted(StackMeta),
    StatusChanged(ServerState),
}

/// Driver for one microscope. Commands are fire-and-forget; results come
/// back through `poll_event`.
pub trait MicroscopeHardware: Send {
    fn dimensions(&self) -> HardwareDimensions;
    fn state(&self) -> ServerState;
    fn move_stage(&mut self, target: Vec3);
    fn snap_image(&mut self);
    fn acquire_stack(&mut self, request: AcquireStack);
    fn ablate_points(&mut self, points: Vec<AblationPoint>);
    fn stop(&mut self);
    fn shutdown(&mut self);

    /// Next pending event, waiting at most `timeout` when none is queued.
    fn poll_event(&mut self, timeout: Duration) -> Option<HardwareEvent>;
}

/// Cap on how many slices one stack acquisition may synthesise.
const MAX_STACK_SLICES: u32 = 1000;

/// In-memory stand-in for a real microscope. Every command completes
/// immediately and queues its events; image data is a deterministic
/// gradient stamped with the stage position, so tests can assert on bytes.
pub struct SimulatedStage {
    dimensions: HardwareDimensions,
    stage_pos: Vec3,
    state: ServerState,
    next_slice_id: u32,
    next_stack_id: u32,
    events: VecDeque<HardwareEvent>,
}

impl SimulatedStage {
    pub fn new(dimensions: HardwareDimensions) -> Self {
        Self {
            dimensions,
            stage_pos: Vec3::default(),
            state: ServerState::Manual,
            next_slice_id: 1,
            next_stack_id: 1,
            events: VecDeque::new(),
        }
    }

    /// A small stage suitable for tests and demos.
    pub fn small() -> Self {
        Self::new(HardwareDimensions {
            stage_min: Vec3::new(0.0, 0.0, 0.0),
            stage_max: Vec3::new(100.0, 100.0, 50.0),
            image_size: Vec2i::new(64, 48),
            vertex_diameter: 1.0,
            numeric_type: NumericType::Int16,
        })
    }

    pub fn stage_position(&self) -> Vec3 {
        self.stage_pos
    }

    fn set_state(&mut self, state: ServerState) {
        if self.state != state {
            self.state = state;
            self.events.push_back(HardwareEvent::StatusChanged(state));
        }
    }

    fn synth_slice(&mut self, stack_id: Option<u32>) -> (SliceMeta, Bytes) {
        let size = self.dimensions.slice_byte_size();
        let id = self.next_slice_id;
        self.next_slice_id += 1;

        let stamp = (self.stage_pos.x + self.stage_pos.y + self.stage_pos.z) as i64 as u8;
        let mut buf = BytesMut::with_capacity(size);
        for i in 0..size {
            buf.put_u8((i % 251) as u8 ^ stamp);
        }

        let meta = SliceMeta {
            id,
            created_at_ms: now_ms(),
            stage_pos: self.stage_pos,
            size_bytes: size as u32,
            stack_id,
        };
        (meta, buf.freeze())
    }
}

impl MicroscopeHardware for SimulatedStage {
    fn dimensions(&self) -> HardwareDimensions {
        self.dimensions.clone()
    }

    fn state(&self) -> ServerState {
        self.state
    }

    fn move_stage(&mut self, target: Vec3) {
        self.stage_pos = Vec3::new(
            target.x.clamp(self.dimensions.stage_min.x, self.dimensions.stage_max.x),
            target.y.clamp(self.dimensions.stage_min.y, self.dimensions.stage_max.y),
            target.z.clamp(self.dimensions.stage_min.z, self.dimensions.stage_max.z),
        );
    }

    fn snap_image(&mut self) {
        let (meta, data) = self.synth_slice(None);
        self.events
            .push_back(HardwareEvent::SliceProduced { meta, data });
    }

    fn acquire_stack(&mut self, request: AcquireStack) {
        let step = request.step_size.abs().max(f32::EPSILON);
        let span = (request.end.z - request.start.z).abs();
        let slice_count = ((span / step) as u32 + 1).min(MAX_STACK_SLICES);

        let stack_id = self.next_stack_id;
        self.next_stack_id += 1;

        let stack = StackMeta {
            id: stack_id,
            from: request.start,
            to: request.end,
            slice_count,
            created_at_ms: now_ms(),
        };
        self.events.push_back(HardwareEvent::StackStarted(stack));

        self.set_state(if request.live {
            ServerState::Live
        } else {
            ServerState::Stack
        });
        let direction = if request.end.z >= request.start.z {
            1.0
        } else {
            -1.0
        };
        for i in 0..slice_count {
            self.stage_pos = Vec3::new(
                request.start.x,
                request.start.y,
                request.start.z + direction * step * i as f32,
            );
            let (meta, data) = self.synth_slice(Some(stack_id));
            self.events
                .push_back(HardwareEvent::SliceProduced { meta, data });
        }
        self.set_state(ServerState::Manual);
    }

    fn ablate_points(&mut self, points: Vec<AblationPoint>) {
        // No optics to drive; the move to the last point is still observable.
        if let Some(last) = points.last() {
            self.move_stage(last.position);
        }
        tracing::debug!(points = points.len(), "simulated ablation done");
    }

    fn stop(&mut self) {
        self.events.clear();
        self.set_state(ServerState::Manual);
    }

    fn shutdown(&mut self) {
        self.events.clear();
        self.state = ServerState::ShuttingDown;
    }

    fn poll_event(&mut self, timeout: Duration) -> Option<HardwareEvent> {
        if self.events.is_empty() {
            thread::sleep(timeout);
        }
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_produces_a_full_slice() {
        let mut stage = SimulatedStage::small();
        stage.snap_image();

        let event = stage.poll_event(Duration::from_millis(1)).unwrap();
        let HardwareEvent::SliceProduced { meta, data } = event else {
            panic!("expected a slice");
        };
        assert_eq!(data.len(), stage.dimensions().slice_byte_size());
        assert_eq!(meta.size_bytes as usize, data.len());
        assert_eq!(meta.stack_id, None);
    }

    #[test]
    fn stack_links_slices_by_stack_id() {
        let mut stage = SimulatedStage::small();
        stage.acquire_stack(AcquireStack {
            start: Vec3::new(0.0, 0.0, 0.0),
            end: Vec3::new(0.0, 0.0, 2.0),
            step_size: 1.0,
            live: false,
            roi_start: Vec2i::default(),
            roi_end: Vec2i::default(),
        });

        let first = stage.poll_event(Duration::from_millis(1)).unwrap();
        let HardwareEvent::StackStarted(stack) = first else {
            panic!("expected stack announcement first");
        };
        assert_eq!(stack.slice_count, 3);

        let mut produced = 0;
        while let Some(event) = stage.poll_event(Duration::from_millis(1)) {
            if let HardwareEvent::SliceProduced { meta, .. } = event {
                assert_eq!(meta.stack_id, Some(stack.id));
                produced += 1;
            }
        }
        assert_eq!(produced, 3);
    }

    #[test]
    fn moves_clamp_to_stage_bounds() {
        let mut stage = SimulatedStage::small();
        stage.move_stage(Vec3::new(-5.0, 250.0, 25.0));
        assert_eq!(stage.stage_position(), Vec3::new(0.0, 100.0, 25.0));
    }
}
