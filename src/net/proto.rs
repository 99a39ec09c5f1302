//! Wire message schemas and CBOR codec.
//!
//! Every message is a string-keyed CBOR map so fields can be added without
//! breaking older peers; unknown keys are skipped on decode. Control signals
//! travel in a `{type, body}` envelope, data-plane messages are bare maps.

use std::convert::Infallible;

use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::signals::{
    AblationPoint, AcquireStack, ClientSignal, HardwareDimensions, NumericType, ServerSignal,
    ServerState, ServerStatus, SliceMeta, StackMeta, Vec2i, Vec3,
};

/// Upper bound for decoded collections that have no natural small size.
const MAX_ABLATION_POINTS: u64 = 4096;
const MAX_DATA_PORTS: u64 = 16;

// =============================================================================
// Data plane
// =============================================================================

/// Request for one chunk of a slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRequest {
    pub slice_id: u32,
    pub offset: u32,
    pub chunk_size: u32,
}

/// Reply header. When `available`, a raw payload frame of `chunk_size` bytes
/// follows; `offset` and `chunk_size` are the values actually served, which
/// may be smaller than requested at the end of a slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkReply {
    pub slice_id: u32,
    pub available: bool,
    pub offset: u32,
    pub chunk_size: u32,
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("collection {field} too long: max {max} got {got}")]
    CollectionTooLong {
        field: &'static str,
        max: u64,
        got: u64,
    },
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

type Enc<'a> = Encoder<&'a mut Vec<u8>>;

pub fn encode_chunk_request(req: &ChunkRequest) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("id")?.u32(req.slice_id)?;
    enc.str("off")?.u32(req.offset)?;
    enc.str("len")?.u32(req.chunk_size)?;
    Ok(buf)
}

pub fn decode_chunk_request(bytes: &[u8]) -> Result<ChunkRequest, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let len = map_len(&mut dec)?;

    let mut slice_id = None;
    let mut offset = None;
    let mut chunk_size = None;
    for _ in 0..len {
        match dec.str()? {
            "id" => slice_id = Some(dec.u32()?),
            "off" => offset = Some(dec.u32()?),
            "len" => chunk_size = Some(dec.u32()?),
            _ => dec.skip()?,
        }
    }
    finish(&dec)?;

    Ok(ChunkRequest {
        slice_id: slice_id.ok_or(ProtoDecodeError::MissingField("id"))?,
        offset: offset.ok_or(ProtoDecodeError::MissingField("off"))?,
        chunk_size: chunk_size.ok_or(ProtoDecodeError::MissingField("len"))?,
    })
}

pub fn encode_chunk_reply(reply: &ChunkReply) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(4)?;
    enc.str("id")?.u32(reply.slice_id)?;
    enc.str("avail")?.bool(reply.available)?;
    enc.str("off")?.u32(reply.offset)?;
    enc.str("len")?.u32(reply.chunk_size)?;
    Ok(buf)
}

pub fn decode_chunk_reply(bytes: &[u8]) -> Result<ChunkReply, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let len = map_len(&mut dec)?;

    let mut slice_id = None;
    let mut available = None;
    let mut offset = None;
    let mut chunk_size = None;
    for _ in 0..len {
        match dec.str()? {
            "id" => slice_id = Some(dec.u32()?),
            "avail" => available = Some(dec.bool()?),
            "off" => offset = Some(dec.u32()?),
            "len" => chunk_size = Some(dec.u32()?),
            _ => dec.skip()?,
        }
    }
    finish(&dec)?;

    Ok(ChunkReply {
        slice_id: slice_id.ok_or(ProtoDecodeError::MissingField("id"))?,
        available: available.ok_or(ProtoDecodeError::MissingField("avail"))?,
        offset: offset.ok_or(ProtoDecodeError::MissingField("off"))?,
        chunk_size: chunk_size.ok_or(ProtoDecodeError::MissingField("len"))?,
    })
}

// =============================================================================
// Control plane: client -> server
// =============================================================================

pub fn encode_client_signal(signal: &ClientSignal) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(2)?;
    enc.str("type")?.str(client_signal_type(signal))?;
    enc.str("body")?;
    match signal {
        ClientSignal::SignOn
        | ClientSignal::SnapImage
        | ClientSignal::Stop
        | ClientSignal::Shutdown => {
            enc.map(0)?;
        }
        ClientSignal::MoveStage { target } => {
            enc.map(1)?;
            enc.str("target")?;
            encode_vec3(&mut enc, target)?;
        }
        ClientSignal::AcquireStack(stack) => {
            enc.map(6)?;
            enc.str("start")?;
            encode_vec3(&mut enc, &stack.start)?;
            enc.str("end")?;
            encode_vec3(&mut enc, &stack.end)?;
            enc.str("step_size")?.f32(stack.step_size)?;
            enc.str("live")?.bool(stack.live)?;
            enc.str("roi_start")?;
            encode_vec2i(&mut enc, &stack.roi_start)?;
            enc.str("roi_end")?;
            encode_vec2i(&mut enc, &stack.roi_end)?;
        }
        ClientSignal::AblatePoints { points } => {
            enc.map(1)?;
            enc.str("points")?;
            enc.array(points.len() as u64)?;
            for point in points {
                encode_ablation_point(&mut enc, point)?;
            }
        }
    }
    Ok(buf)
}

pub fn decode_client_signal(bytes: &[u8]) -> Result<ClientSignal, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let kind = envelope_header(&mut dec)?;

    let signal = match kind {
        "sign_on" => {
            skip_body(&mut dec)?;
            ClientSignal::SignOn
        }
        "snap_image" => {
            skip_body(&mut dec)?;
            ClientSignal::SnapImage
        }
        "stop" => {
            skip_body(&mut dec)?;
            ClientSignal::Stop
        }
        "shutdown" => {
            skip_body(&mut dec)?;
            ClientSignal::Shutdown
        }
        "move_stage" => {
            let len = map_len(&mut dec)?;
            let mut target = None;
            for _ in 0..len {
                match dec.str()? {
                    "target" => target = Some(decode_vec3(&mut dec)?),
                    _ => dec.skip()?,
                }
            }
            ClientSignal::MoveStage {
                target: target.ok_or(ProtoDecodeError::MissingField("target"))?,
            }
        }
        "acquire_stack" => {
            let len = map_len(&mut dec)?;
            let mut start = None;
            let mut end = None;
            let mut step_size = None;
            let mut live = false;
            let mut roi_start = Vec2i::default();
            let mut roi_end = Vec2i::default();
            for _ in 0..len {
                match dec.str()? {
                    "start" => start = Some(decode_vec3(&mut dec)?),
                    "end" => end = Some(decode_vec3(&mut dec)?),
                    "step_size" => step_size = Some(dec.f32()?),
                    "live" => live = dec.bool()?,
                    "roi_start" => roi_start = decode_vec2i(&mut dec)?,
                    "roi_end" => roi_end = decode_vec2i(&mut dec)?,
                    _ => dec.skip()?,
                }
            }
            ClientSignal::AcquireStack(AcquireStack {
                start: start.ok_or(ProtoDecodeError::MissingField("start"))?,
                end: end.ok_or(ProtoDecodeError::MissingField("end"))?,
                step_size: step_size.ok_or(ProtoDecodeError::MissingField("step_size"))?,
                live,
                roi_start,
                roi_end,
            })
        }
        "ablate_points" => {
            let len = map_len(&mut dec)?;
            let mut points = None;
            for _ in 0..len {
                match dec.str()? {
                    "points" => {
                        let count = array_len(&mut dec)?;
                        if count > MAX_ABLATION_POINTS {
                            return Err(ProtoDecodeError::CollectionTooLong {
                                field: "points",
                                max: MAX_ABLATION_POINTS,
                                got: count,
                            });
                        }
                        let mut list = Vec::with_capacity(count as usize);
                        for _ in 0..count {
                            list.push(decode_ablation_point(&mut dec)?);
                        }
                        points = Some(list);
                    }
                    _ => dec.skip()?,
                }
            }
            ClientSignal::AblatePoints {
                points: points.ok_or(ProtoDecodeError::MissingField("points"))?,
            }
        }
        other => return Err(ProtoDecodeError::UnknownMessageType(other.to_string())),
    };
    finish(&dec)?;
    Ok(signal)
}

fn client_signal_type(signal: &ClientSignal) -> &'static str {
    match signal {
        ClientSignal::SignOn => "sign_on",
        ClientSignal::MoveStage { .. } => "move_stage",
        ClientSignal::SnapImage => "snap_image",
        ClientSignal::AcquireStack(_) => "acquire_stack",
        ClientSignal::AblatePoints { .. } => "ablate_points",
        ClientSignal::Stop => "stop",
        ClientSignal::Shutdown => "shutdown",
    }
}

// =============================================================================
// Control plane: server -> client
// =============================================================================

pub fn encode_server_signal(signal: &ServerSignal) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(2)?;
    enc.str("type")?.str(server_signal_type(signal))?;
    enc.str("body")?;
    match signal {
        ServerSignal::Status(status) => {
            enc.map(4)?;
            enc.str("state")?.str(server_state_str(status.state))?;
            enc.str("data_ports")?;
            enc.array(status.data_ports.len() as u64)?;
            for port in &status.data_ports {
                enc.u16(*port)?;
            }
            enc.str("clients")?.u32(status.connected_clients)?;
            enc.str("hw")?;
            encode_hardware_dimensions(&mut enc, &status.hardware_dimensions)?;
        }
        ServerSignal::SliceAvailable(meta) => {
            enc.map(if meta.stack_id.is_some() { 5 } else { 4 })?;
            enc.str("id")?.u32(meta.id)?;
            enc.str("created")?.u64(meta.created_at_ms)?;
            enc.str("pos")?;
            encode_vec3(&mut enc, &meta.stage_pos)?;
            enc.str("size")?.u32(meta.size_bytes)?;
            if let Some(stack_id) = meta.stack_id {
                enc.str("stack_id")?.u32(stack_id)?;
            }
        }
        ServerSignal::StackAvailable(meta) => {
            enc.map(5)?;
            enc.str("id")?.u32(meta.id)?;
            enc.str("from")?;
            encode_vec3(&mut enc, &meta.from)?;
            enc.str("to")?;
            encode_vec3(&mut enc, &meta.to)?;
            enc.str("slices")?.u32(meta.slice_count)?;
            enc.str("created")?.u64(meta.created_at_ms)?;
        }
    }
    Ok(buf)
}

pub fn decode_server_signal(bytes: &[u8]) -> Result<ServerSignal, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let kind = envelope_header(&mut dec)?;

    let signal = match kind {
        "status" => {
            let len = map_len(&mut dec)?;
            let mut state = None;
            let mut data_ports = Vec::new();
            let mut connected_clients = 0;
            let mut hardware_dimensions = None;
            for _ in 0..len {
                match dec.str()? {
                    "state" => state = Some(decode_server_state(&mut dec)?),
                    "data_ports" => {
                        let count = array_len(&mut dec)?;
                        if count > MAX_DATA_PORTS {
                            return Err(ProtoDecodeError::CollectionTooLong {
                                field: "data_ports",
                                max: MAX_DATA_PORTS,
                                got: count,
                            });
                        }
                        data_ports = Vec::with_capacity(count as usize);
                        for _ in 0..count {
                            data_ports.push(dec.u16()?);
                        }
                    }
                    "clients" => connected_clients = dec.u32()?,
                    "hw" => hardware_dimensions = Some(decode_hardware_dimensions(&mut dec)?),
                    _ => dec.skip()?,
                }
            }
            ServerSignal::Status(ServerStatus {
                state: state.ok_or(ProtoDecodeError::MissingField("state"))?,
                data_ports,
                connected_clients,
                hardware_dimensions: hardware_dimensions
                    .ok_or(ProtoDecodeError::MissingField("hw"))?,
            })
        }
        "slice_available" => {
            let len = map_len(&mut dec)?;
            let mut id = None;
            let mut created_at_ms = None;
            let mut stage_pos = None;
            let mut size_bytes = None;
            let mut stack_id = None;
            for _ in 0..len {
                match dec.str()? {
                    "id" => id = Some(dec.u32()?),
                    "created" => created_at_ms = Some(dec.u64()?),
                    "pos" => stage_pos = Some(decode_vec3(&mut dec)?),
                    "size" => size_bytes = Some(dec.u32()?),
                    "stack_id" => stack_id = Some(dec.u32()?),
                    _ => dec.skip()?,
                }
            }
            ServerSignal::SliceAvailable(SliceMeta {
                id: id.ok_or(ProtoDecodeError::MissingField("id"))?,
                created_at_ms: created_at_ms.ok_or(ProtoDecodeError::MissingField("created"))?,
                stage_pos: stage_pos.ok_or(ProtoDecodeError::MissingField("pos"))?,
                size_bytes: size_bytes.ok_or(ProtoDecodeError::MissingField("size"))?,
                stack_id,
            })
        }
        "stack_available" => {
            let len = map_len(&mut dec)?;
            let mut id = None;
            let mut from = None;
            let mut to = None;
            let mut slice_count = None;
            let mut created_at_ms = None;
            for _ in 0..len {
                match dec.str()? {
                    "id" => id = Some(dec.u32()?),
                    "from" => from = Some(decode_vec3(&mut dec)?),
                    "to" => to = Some(decode_vec3(&mut dec)?),
                    "slices" => slice_count = Some(dec.u32()?),
                    "created" => created_at_ms = Some(dec.u64()?),
                    _ => dec.skip()?,
                }
            }
            ServerSignal::StackAvailable(StackMeta {
                id: id.ok_or(ProtoDecodeError::MissingField("id"))?,
                from: from.ok_or(ProtoDecodeError::MissingField("from"))?,
                to: to.ok_or(ProtoDecodeError::MissingField("to"))?,
                slice_count: slice_count.ok_or(ProtoDecodeError::MissingField("slices"))?,
                created_at_ms: created_at_ms.ok_or(ProtoDecodeError::MissingField("created"))?,
            })
        }
        other => return Err(ProtoDecodeError::UnknownMessageType(other.to_string())),
    };
    finish(&dec)?;
    Ok(signal)
}

fn server_signal_type(signal: &ServerSignal) -> &'static str {
    match signal {
        ServerSignal::Status(_) => "status",
        ServerSignal::SliceAvailable(_) => "slice_available",
        ServerSignal::StackAvailable(_) => "stack_available",
    }
}

fn server_state_str(state: ServerState) -> &'static str {
    match state {
        ServerState::Startup => "startup",
        ServerState::Manual => "manual",
        ServerState::Live => "live",
        ServerState::Stack => "stack",
        ServerState::ShuttingDown => "shutting_down",
    }
}

fn decode_server_state(dec: &mut Decoder<'_>) -> Result<ServerState, ProtoDecodeError> {
    let raw = dec.str()?;
    match raw {
        "startup" => Ok(ServerState::Startup),
        "manual" => Ok(ServerState::Manual),
        "live" => Ok(ServerState::Live),
        "stack" => Ok(ServerState::Stack),
        "shutting_down" => Ok(ServerState::ShuttingDown),
        other => Err(ProtoDecodeError::InvalidField {
            field: "state",
            reason: format!("unknown server state {other}"),
        }),
    }
}

// =============================================================================
// Shared pieces
// =============================================================================

fn encode_vec3(enc: &mut Enc<'_>, v: &Vec3) -> Result<(), ProtoEncodeError> {
    enc.array(3)?.f32(v.x)?.f32(v.y)?.f32(v.z)?;
    Ok(())
}

fn decode_vec3(dec: &mut Decoder<'_>) -> Result<Vec3, ProtoDecodeError> {
    let len = array_len(dec)?;
    if len != 3 {
        return Err(ProtoDecodeError::InvalidField {
            field: "vec3",
            reason: format!("expected 3 components, got {len}"),
        });
    }
    Ok(Vec3::new(dec.f32()?, dec.f32()?, dec.f32()?))
}

fn encode_vec2i(enc: &mut Enc<'_>, v: &Vec2i) -> Result<(), ProtoEncodeError> {
    enc.array(2)?.i32(v.x)?.i32(v.y)?;
    Ok(())
}

fn decode_vec2i(dec: &mut Decoder<'_>) -> Result<Vec2i, ProtoDecodeError> {
    let len = array_len(dec)?;
    if len != 2 {
        return Err(ProtoDecodeError::InvalidField {
            field: "vec2i",
            reason: format!("expected 2 components, got {len}"),
        });
    }
    Ok(Vec2i::new(dec.i32()?, dec.i32()?))
}

fn encode_ablation_point(enc: &mut Enc<'_>, point: &AblationPoint) -> Result<(), ProtoEncodeError> {
    enc.map(6)?;
    enc.str("pos")?;
    encode_vec3(enc, &point.position)?;
    enc.str("dwell_ms")?.u64(point.dwell_time_ms)?;
    enc.str("laser_on")?.bool(point.laser_on)?;
    enc.str("laser_off")?.bool(point.laser_off)?;
    enc.str("power")?.f32(point.laser_power)?;
    enc.str("count_move")?.bool(point.count_move_time)?;
    Ok(())
}

fn decode_ablation_point(dec: &mut Decoder<'_>) -> Result<AblationPoint, ProtoDecodeError> {
    let len = map_len(dec)?;
    let mut position = None;
    let mut dwell_time_ms = 0;
    let mut laser_on = false;
    let mut laser_off = false;
    let mut laser_power = 0.0;
    let mut count_move_time = false;
    for _ in 0..len {
        match dec.str()? {
            "pos" => position = Some(decode_vec3(dec)?),
            "dwell_ms" => dwell_time_ms = dec.u64()?,
            "laser_on" => laser_on = dec.bool()?,
            "laser_off" => laser_off = dec.bool()?,
            "power" => laser_power = dec.f32()?,
            "count_move" => count_move_time = dec.bool()?,
            _ => dec.skip()?,
        }
    }
    Ok(AblationPoint {
        position: position.ok_or(ProtoDecodeError::MissingField("pos"))?,
        dwell_time_ms,
        laser_on,
        laser_off,
        laser_power,
        count_move_time,
    })
}

fn encode_hardware_dimensions(
    enc: &mut Enc<'_>,
    hw: &HardwareDimensions,
) -> Result<(), ProtoEncodeError> {
    enc.map(5)?;
    enc.str("stage_min")?;
    encode_vec3(enc, &hw.stage_min)?;
    enc.str("stage_max")?;
    encode_vec3(enc, &hw.stage_max)?;
    enc.str("image_size")?;
    encode_vec2i(enc, &hw.image_size)?;
    enc.str("vertex_diameter")?.f32(hw.vertex_diameter)?;
    enc.str("numeric_type")?.str(numeric_type_str(hw.numeric_type))?;
    Ok(())
}

fn decode_hardware_dimensions(
    dec: &mut Decoder<'_>,
) -> Result<HardwareDimensions, ProtoDecodeError> {
    let len = map_len(dec)?;
    let mut stage_min = None;
    let mut stage_max = None;
    let mut image_size = None;
    let mut vertex_diameter = None;
    let mut numeric_type = None;
    for _ in 0..len {
        match dec.str()? {
            "stage_min" => stage_min = Some(decode_vec3(dec)?),
            "stage_max" => stage_max = Some(decode_vec3(dec)?),
            "image_size" => image_size = Some(decode_vec2i(dec)?),
            "vertex_diameter" => vertex_diameter = Some(dec.f32()?),
            "numeric_type" => numeric_type = Some(decode_numeric_type(dec)?),
            _ => dec.skip()?,
        }
    }
    Ok(HardwareDimensions {
        stage_min: stage_min.ok_or(ProtoDecodeError::MissingField("stage_min"))?,
        stage_max: stage_max.ok_or(ProtoDecodeError::MissingField("stage_max"))?,
        image_size: image_size.ok_or(ProtoDecodeError::MissingField("image_size"))?,
        vertex_diameter: vertex_diameter
            .ok_or(ProtoDecodeError::MissingField("vertex_diameter"))?,
        numeric_type: numeric_type.ok_or(ProtoDecodeError::MissingField("numeric_type"))?,
    })
}

fn numeric_type_str(t: NumericType) -> &'static str {
    match t {
        NumericType::Int8 => "int8",
        NumericType::Int16 => "int16",
        NumericType::Float32 => "float32",
    }
}

fn decode_numeric_type(dec: &mut Decoder<'_>) -> Result<NumericType, ProtoDecodeError> {
    match dec.str()? {
        "int8" => Ok(NumericType::Int8),
        "int16" => Ok(NumericType::Int16),
        "float32" => Ok(NumericType::Float32),
        other => Err(ProtoDecodeError::InvalidField {
            field: "numeric_type",
            reason: format!("unknown numeric type {other}"),
        }),
    }
}

/// Decode the `{type, body}` envelope up to the start of the body.
fn envelope_header<'b>(dec: &mut Decoder<'b>) -> Result<&'b str, ProtoDecodeError> {
    let len = map_len(dec)?;
    if len != 2 {
        return Err(ProtoDecodeError::InvalidField {
            field: "envelope",
            reason: format!("expected 2 entries, got {len}"),
        });
    }
    let key = dec.str()?;
    if key != "type" {
        return Err(ProtoDecodeError::InvalidField {
            field: "envelope",
            reason: format!("expected type key first, got {key}"),
        });
    }
    let kind = dec.str()?;
    let key = dec.str()?;
    if key != "body" {
        return Err(ProtoDecodeError::InvalidField {
            field: "envelope",
            reason: format!("expected body key second, got {key}"),
        });
    }
    Ok(kind)
}

fn skip_body(dec: &mut Decoder<'_>) -> Result<(), ProtoDecodeError> {
    let len = map_len(dec)?;
    for _ in 0..len {
        dec.skip()?;
        dec.skip()?;
    }
    Ok(())
}

fn map_len(dec: &mut Decoder<'_>) -> Result<u64, ProtoDecodeError> {
    match dec.map()? {
        Some(len) => Ok(len),
        None => Err(ProtoDecodeError::IndefiniteLength),
    }
}

fn array_len(dec: &mut Decoder<'_>) -> Result<u64, ProtoDecodeError> {
    match dec.array()? {
        Some(len) => Ok(len),
        None => Err(ProtoDecodeError::IndefiniteLength),
    }
}

fn finish(dec: &Decoder<'_>) -> Result<(), ProtoDecodeError> {
    if dec.position() != dec.input().len() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> HardwareDimensions {
        HardwareDimensions {
            stage_min: Vec3::new(0.0, 0.0, 0.0),
            stage_max: Vec3::new(100.0, 100.0, 50.0),
            image_size: Vec2i::new(64, 48),
            vertex_diameter: 0.5,
            numeric_type: NumericType::Int16,
        }
    }

    #[test]
    fn chunk_request_roundtrip() {
        let req = ChunkRequest {
            slice_id: 7,
            offset: 250_000,
            chunk_size: 1234,
        };
        let bytes = encode_chunk_request(&req).unwrap();
        assert_eq!(decode_chunk_request(&bytes).unwrap(), req);
    }

    #[test]
    fn chunk_reply_roundtrip() {
        let reply = ChunkReply {
            slice_id: 7,
            available: false,
            offset: 0,
            chunk_size: 0,
        };
        let bytes = encode_chunk_reply(&reply).unwrap();
        assert_eq!(decode_chunk_reply(&bytes).unwrap(), reply);
    }

    #[test]
    fn client_signal_move_stage_roundtrip() {
        let signal = ClientSignal::MoveStage {
            target: Vec3::new(1.5, -2.0, 3.25),
        };
        let bytes = encode_client_signal(&signal).unwrap();
        assert_eq!(decode_client_signal(&bytes).unwrap(), signal);
    }

    #[test]
    fn client_signal_acquire_stack_roundtrip() {
        let signal = ClientSignal::AcquireStack(AcquireStack {
            start: Vec3::new(0.0, 0.0, 0.0),
            end: Vec3::new(0.0, 0.0, 10.0),
            step_size: 0.5,
            live: true,
            roi_start: Vec2i::new(2, 3),
            roi_end: Vec2i::new(60, 40),
        });
        let bytes = encode_client_signal(&signal).unwrap();
        assert_eq!(decode_client_signal(&bytes).unwrap(), signal);
    }

    #[test]
    fn client_signal_ablate_points_roundtrip() {
        let signal = ClientSignal::AblatePoints {
            points: vec![AblationPoint {
                position: Vec3::new(1.0, 2.0, 3.0),
                dwell_time_ms: 250,
                laser_on: true,
                laser_off: false,
                laser_power: 0.8,
                count_move_time: true,
            }],
        };
        let bytes = encode_client_signal(&signal).unwrap();
        assert_eq!(decode_client_signal(&bytes).unwrap(), signal);
    }

    #[test]
    fn server_status_roundtrip() {
        let signal = ServerSignal::Status(ServerStatus {
            state: ServerState::Manual,
            data_ports: vec![4401],
            connected_clients: 2,
            hardware_dimensions: dims(),
        });
        let bytes = encode_server_signal(&signal).unwrap();
        assert_eq!(decode_server_signal(&bytes).unwrap(), signal);
    }

    #[test]
    fn slice_available_roundtrip_with_and_without_stack() {
        for stack_id in [None, Some(9)] {
            let signal = ServerSignal::SliceAvailable(SliceMeta {
                id: 3,
                created_at_ms: 1_700_000_000_000,
                stage_pos: Vec3::new(5.0, 6.0, 7.0),
                size_bytes: 6144,
                stack_id,
            });
            let bytes = encode_server_signal(&signal).unwrap();
            assert_eq!(decode_server_signal(&bytes).unwrap(), signal);
        }
    }

    #[test]
    fn unknown_signal_type_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("type").unwrap().str("warp_drive").unwrap();
        enc.str("body").unwrap().map(0).unwrap();

        let err = decode_client_signal(&buf).unwrap_err();
        assert!(matches!(err, ProtoDecodeError::UnknownMessageType(_)));
    }

    #[test]
    fn missing_field_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(1).unwrap();
        enc.str("id").unwrap().u32(1).unwrap();

        let err = decode_chunk_request(&buf).unwrap_err();
        assert!(matches!(err, ProtoDecodeError::MissingField("off")));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(decode_chunk_reply(&[0xff, 0x00, 0x13]).is_err());
    }
}
