//! Wire format of the VR move RPCs and the server's replies.
//!
//! Every message is a one-byte type tag followed by a bit-packed body.
//! Locations travel as [`NET_QUANTIZE_100`] vectors, accelerations and
//! velocities as [`NET_QUANTIZE_10`], rotations as 16 or 8 bit axes.
#![forbid(unsafe_code)]

use std::path::PathBuf;

use character_collision::BaseHandle;
use character_movement::{CharacterMovement, MoveAction, MovementMode};
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use thiserror::Error;

pub mod bits;
pub mod config;
pub mod quantize;

pub use bits::{BitReader, BitWriter};
pub use config::NetConfig;
pub use quantize::{
    compress_axis_to_byte, compress_axis_to_short, decompress_axis_from_byte,
    decompress_axis_from_short, Quantize, NET_QUANTIZE_10, NET_QUANTIZE_100,
};

const TYPE_SERVER_MOVE_VR: u8 = 1;
const TYPE_SERVER_MOVE_VR_EX_LIGHT: u8 = 2;
const TYPE_SERVER_MOVE_VR_DUAL: u8 = 3;
const TYPE_SERVER_MOVE_VR_DUAL_EX_LIGHT: u8 = 4;
const TYPE_SERVER_MOVE_VR_DUAL_HYBRID_ROOT_MOTION: u8 = 5;
const TYPE_SERVER_MOVE_OLD: u8 = 6;
const TYPE_CLIENT_ADJUST_POSITION: u8 = 7;
const TYPE_CLIENT_ACK_GOOD_MOVE: u8 = 8;

const ACTION_SNAP_TURN: u8 = 1;
const ACTION_TELEPORT: u8 = 2;
const ACTION_STOP_ALL_MOVEMENT: u8 = 3;
const ACTION_SET_ROTATION: u8 = 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("net protocol encode error: {0}")]
    Encode(String),
    #[error("net protocol decode error: {0}")]
    Decode(String),
    #[error("failed to read {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid net config toml: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("{field}: {reason}")]
    Config { field: &'static str, reason: String },
}

/// Per-move extras, each only sent when present.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConditionalMoveRep {
    pub requested_velocity: Option<Vector<Real>>,
    pub custom_vr_input: Option<Vector<Real>>,
    pub move_action: Option<MoveAction>,
}

impl ConditionalMoveRep {
    /// Extras the movement component will consume on its next move.
    pub fn capture(movement: &CharacterMovement) -> Self {
        let custom_vr_input = movement.capsule().custom_vr_input();
        Self {
            requested_velocity: movement.requested_velocity(),
            custom_vr_input: (custom_vr_input != Vector::zeros()).then_some(custom_vr_input),
            move_action: movement.pending_move_action(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requested_velocity.is_none() && self.custom_vr_input.is_none() && self.move_action.is_none()
    }

    /// The values as the other side decodes them.
    pub fn quantized(&self) -> Self {
        Self {
            requested_velocity: self.requested_velocity.map(|v| NET_QUANTIZE_10.round_trip(v)),
            custom_vr_input: self.custom_vr_input.map(|v| NET_QUANTIZE_100.round_trip(v)),
            move_action: self.move_action.map(|action| match action {
                MoveAction::SnapTurn { yaw } => MoveAction::SnapTurn {
                    yaw: round_trip_axis(yaw),
                },
                MoveAction::Teleport { location, yaw } => MoveAction::Teleport {
                    location: NET_QUANTIZE_100.round_trip(location),
                    yaw: round_trip_axis(yaw),
                },
                MoveAction::StopAllMovement => MoveAction::StopAllMovement,
                MoveAction::SetRotation { yaw } => MoveAction::SetRotation {
                    yaw: round_trip_axis(yaw),
                },
            }),
        }
    }

    /// Hands the extras to the movement component for the next move.
    pub fn apply_to(&self, movement: &mut CharacterMovement) {
        movement.set_requested_velocity(self.requested_velocity);
        movement
            .capsule_mut()
            .set_custom_vr_input(self.custom_vr_input.unwrap_or_else(Vector::zeros));
        if let Some(action) = self.move_action {
            movement.queue_move_action(action);
        }
    }
}

/// A yaw after compression to 16 bits.
pub fn round_trip_axis(angle: Real) -> Real {
    decompress_axis_from_short(compress_axis_to_short(angle))
}

/// Movement base and control rotation of a move.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConditionalMoveRep2 {
    pub base: Option<BaseHandle>,
    pub client_yaw: u16,
    /// Pitch (16 bit) and roll (8 bit), omitted when both are zero.
    pub pitch_roll: Option<(u16, u8)>,
}

/// The newest move of a send.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VrMove {
    pub timestamp: f32,
    pub acceleration: Vector<Real>,
    /// Capsule location the client ended the move at.
    pub client_location: Vector<Real>,
    /// Tracked HMD location relative to the actor.
    pub capsule_location: Vector<Real>,
    pub conditional: ConditionalMoveRep,
    /// X/Y: head motion of the move. Z: capsule half height when replicated.
    pub lf_diff: Vector<Real>,
    pub capsule_yaw: u16,
    pub flags: u8,
    pub reps2: ConditionalMoveRep2,
    pub client_mode: MovementMode,
}

/// The unacknowledged move riding along in a dual send.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OldVrMove {
    pub timestamp: f32,
    pub acceleration: Vector<Real>,
    pub flags: u8,
    /// `(pitch << 16) | yaw`, both compressed to shorts.
    pub view: u32,
    pub capsule_location: Vector<Real>,
    pub conditional: ConditionalMoveRep,
    pub lf_diff: Vector<Real>,
    pub capsule_yaw: u16,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DualVrMove {
    pub old: OldVrMove,
    pub new: VrMove,
}

/// An important move that may have been lost, resent in short form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OldMove {
    pub timestamp: f32,
    pub acceleration: Vector<Real>,
    pub flags: u8,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClientAdjustment {
    pub timestamp: f32,
    pub location: Vector<Real>,
    pub velocity: Vector<Real>,
    pub mode: MovementMode,
    pub base: Option<BaseHandle>,
    pub has_base_location: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProtocolMessage {
    ServerMoveVr(VrMove),
    /// [`VrMove`] without acceleration; it decodes as zero.
    ServerMoveVrExLight(VrMove),
    ServerMoveVrDual(DualVrMove),
    /// Dual move where neither half carries acceleration.
    ServerMoveVrDualExLight(DualVrMove),
    ServerMoveVrDualHybridRootMotion(DualVrMove),
    ServerMoveOld(OldMove),
    ClientAdjustPosition(ClientAdjustment),
    ClientAckGoodMove { timestamp: f32 },
}

impl ProtocolMessage {
    /// Timestamp of the newest move the message refers to.
    pub fn timestamp(&self) -> f32 {
        match self {
            ProtocolMessage::ServerMoveVr(data) | ProtocolMessage::ServerMoveVrExLight(data) => {
                data.timestamp
            }
            ProtocolMessage::ServerMoveVrDual(dual)
            | ProtocolMessage::ServerMoveVrDualExLight(dual)
            | ProtocolMessage::ServerMoveVrDualHybridRootMotion(dual) => dual.new.timestamp,
            ProtocolMessage::ServerMoveOld(old) => old.timestamp,
            ProtocolMessage::ClientAdjustPosition(adjustment) => adjustment.timestamp,
            ProtocolMessage::ClientAckGoodMove { timestamp } => *timestamp,
        }
    }

    pub fn is_server_move(&self) -> bool {
        !matches!(
            self,
            ProtocolMessage::ClientAdjustPosition(_) | ProtocolMessage::ClientAckGoodMove { .. }
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut writer = BitWriter::new();
        let tag = match self {
            ProtocolMessage::ServerMoveVr(data) => {
                write_vr_move(&mut writer, data, true)?;
                TYPE_SERVER_MOVE_VR
            }
            ProtocolMessage::ServerMoveVrExLight(data) => {
                write_vr_move(&mut writer, data, false)?;
                TYPE_SERVER_MOVE_VR_EX_LIGHT
            }
            ProtocolMessage::ServerMoveVrDual(dual) => {
                write_dual(&mut writer, dual, true)?;
                TYPE_SERVER_MOVE_VR_DUAL
            }
            ProtocolMessage::ServerMoveVrDualExLight(dual) => {
                write_dual(&mut writer, dual, false)?;
                TYPE_SERVER_MOVE_VR_DUAL_EX_LIGHT
            }
            ProtocolMessage::ServerMoveVrDualHybridRootMotion(dual) => {
                write_dual(&mut writer, dual, true)?;
                TYPE_SERVER_MOVE_VR_DUAL_HYBRID_ROOT_MOTION
            }
            ProtocolMessage::ServerMoveOld(old) => {
                write_timestamp(&mut writer, old.timestamp)?;
                NET_QUANTIZE_10.write(&mut writer, old.acceleration);
                writer.write_u8(old.flags);
                TYPE_SERVER_MOVE_OLD
            }
            ProtocolMessage::ClientAdjustPosition(adjustment) => {
                write_timestamp(&mut writer, adjustment.timestamp)?;
                NET_QUANTIZE_100.write(&mut writer, adjustment.location);
                NET_QUANTIZE_10.write(&mut writer, adjustment.velocity);
                writer.write_u8(adjustment.mode.pack());
                write_base(&mut writer, adjustment.base);
                writer.write_bool(adjustment.has_base_location);
                TYPE_CLIENT_ADJUST_POSITION
            }
            ProtocolMessage::ClientAckGoodMove { timestamp } => {
                write_timestamp(&mut writer, *timestamp)?;
                TYPE_CLIENT_ACK_GOOD_MOVE
            }
        };
        let body = writer.into_bytes();
        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(tag);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&msg_type, rest) = data
            .split_first()
            .ok_or_else(|| ProtocolError::Decode("packet too short".into()))?;
        let mut reader = BitReader::new(rest);
        let message = match msg_type {
            TYPE_SERVER_MOVE_VR => ProtocolMessage::ServerMoveVr(read_vr_move(&mut reader, true)?),
            TYPE_SERVER_MOVE_VR_EX_LIGHT => {
                ProtocolMessage::ServerMoveVrExLight(read_vr_move(&mut reader, false)?)
            }
            TYPE_SERVER_MOVE_VR_DUAL => ProtocolMessage::ServerMoveVrDual(read_dual(&mut reader, true)?),
            TYPE_SERVER_MOVE_VR_DUAL_EX_LIGHT => {
                ProtocolMessage::ServerMoveVrDualExLight(read_dual(&mut reader, false)?)
            }
            TYPE_SERVER_MOVE_VR_DUAL_HYBRID_ROOT_MOTION => {
                ProtocolMessage::ServerMoveVrDualHybridRootMotion(read_dual(&mut reader, true)?)
            }
            TYPE_SERVER_MOVE_OLD => ProtocolMessage::ServerMoveOld(OldMove {
                timestamp: read_timestamp(&mut reader)?,
                acceleration: NET_QUANTIZE_10.read(&mut reader)?,
                flags: reader.read_u8()?,
            }),
            TYPE_CLIENT_ADJUST_POSITION => ProtocolMessage::ClientAdjustPosition(ClientAdjustment {
                timestamp: read_timestamp(&mut reader)?,
                location: NET_QUANTIZE_100.read(&mut reader)?,
                velocity: NET_QUANTIZE_10.read(&mut reader)?,
                mode: read_mode(&mut reader)?,
                base: read_base(&mut reader)?,
                has_base_location: reader.read_bool()?,
            }),
            TYPE_CLIENT_ACK_GOOD_MOVE => ProtocolMessage::ClientAckGoodMove {
                timestamp: read_timestamp(&mut reader)?,
            },
            _ => {
                return Err(ProtocolError::Decode(format!(
                    "unknown message type {}",
                    msg_type
                )))
            }
        };
        reader.finish("message")?;
        Ok(message)
    }
}

fn write_timestamp(writer: &mut BitWriter, timestamp: f32) -> Result<(), ProtocolError> {
    if !timestamp.is_finite() {
        return Err(ProtocolError::Encode(format!("timestamp {timestamp} is not finite")));
    }
    writer.write_f32(timestamp);
    Ok(())
}

fn read_timestamp(reader: &mut BitReader<'_>) -> Result<f32, ProtocolError> {
    let timestamp = reader.read_f32()?;
    if !timestamp.is_finite() {
        return Err(ProtocolError::Decode(format!("timestamp {timestamp} is not finite")));
    }
    Ok(timestamp)
}

fn read_mode(reader: &mut BitReader<'_>) -> Result<MovementMode, ProtocolError> {
    let byte = reader.read_u8()?;
    MovementMode::unpack(byte)
        .ok_or_else(|| ProtocolError::Decode(format!("invalid movement mode {byte:#04x}")))
}

fn write_base(writer: &mut BitWriter, base: Option<BaseHandle>) {
    writer.write_bool(base.is_some());
    if let Some(base) = base {
        writer.write_u32(base.index);
        writer.write_u32(base.generation);
    }
}

fn read_base(reader: &mut BitReader<'_>) -> Result<Option<BaseHandle>, ProtocolError> {
    if !reader.read_bool()? {
        return Ok(None);
    }
    Ok(Some(BaseHandle {
        index: reader.read_u32()?,
        generation: reader.read_u32()?,
    }))
}

fn write_move_action(writer: &mut BitWriter, action: &MoveAction) {
    match *action {
        MoveAction::SnapTurn { yaw } => {
            writer.write_u8(ACTION_SNAP_TURN);
            writer.write_u16(compress_axis_to_short(yaw));
        }
        MoveAction::Teleport { location, yaw } => {
            writer.write_u8(ACTION_TELEPORT);
            NET_QUANTIZE_100.write(writer, location);
            writer.write_u16(compress_axis_to_short(yaw));
        }
        MoveAction::StopAllMovement => writer.write_u8(ACTION_STOP_ALL_MOVEMENT),
        MoveAction::SetRotation { yaw } => {
            writer.write_u8(ACTION_SET_ROTATION);
            writer.write_u16(compress_axis_to_short(yaw));
        }
    }
}

fn read_move_action(reader: &mut BitReader<'_>) -> Result<MoveAction, ProtocolError> {
    let kind = reader.read_u8()?;
    let action = match kind {
        ACTION_SNAP_TURN => MoveAction::SnapTurn {
            yaw: decompress_axis_from_short(reader.read_u16()?),
        },
        ACTION_TELEPORT => MoveAction::Teleport {
            location: NET_QUANTIZE_100.read(reader)?,
            yaw: decompress_axis_from_short(reader.read_u16()?),
        },
        ACTION_STOP_ALL_MOVEMENT => MoveAction::StopAllMovement,
        ACTION_SET_ROTATION => MoveAction::SetRotation {
            yaw: decompress_axis_from_short(reader.read_u16()?),
        },
        _ => return Err(ProtocolError::Decode(format!("unknown move action {kind}"))),
    };
    Ok(action)
}

fn write_conditional(writer: &mut BitWriter, rep: &ConditionalMoveRep) {
    writer.write_bool(rep.requested_velocity.is_some());
    if let Some(velocity) = rep.requested_velocity {
        NET_QUANTIZE_10.write(writer, velocity);
    }
    writer.write_bool(rep.custom_vr_input.is_some());
    if let Some(input) = rep.custom_vr_input {
        NET_QUANTIZE_100.write(writer, input);
    }
    writer.write_bool(rep.move_action.is_some());
    if let Some(action) = &rep.move_action {
        write_move_action(writer, action);
    }
}

fn read_conditional(reader: &mut BitReader<'_>) -> Result<ConditionalMoveRep, ProtocolError> {
    let requested_velocity = if reader.read_bool()? {
        Some(NET_QUANTIZE_10.read(reader)?)
    } else {
        None
    };
    let custom_vr_input = if reader.read_bool()? {
        Some(NET_QUANTIZE_100.read(reader)?)
    } else {
        None
    };
    let move_action = if reader.read_bool()? {
        Some(read_move_action(reader)?)
    } else {
        None
    };
    Ok(ConditionalMoveRep {
        requested_velocity,
        custom_vr_input,
        move_action,
    })
}

fn write_reps2(writer: &mut BitWriter, rep: &ConditionalMoveRep2) {
    write_base(writer, rep.base);
    writer.write_u16(rep.client_yaw);
    writer.write_bool(rep.pitch_roll.is_some());
    if let Some((pitch, roll)) = rep.pitch_roll {
        writer.write_u16(pitch);
        writer.write_u8(roll);
    }
}

fn read_reps2(reader: &mut BitReader<'_>) -> Result<ConditionalMoveRep2, ProtocolError> {
    let base = read_base(reader)?;
    let client_yaw = reader.read_u16()?;
    let pitch_roll = if reader.read_bool()? {
        Some((reader.read_u16()?, reader.read_u8()?))
    } else {
        None
    };
    Ok(ConditionalMoveRep2 {
        base,
        client_yaw,
        pitch_roll,
    })
}

fn check_light(acceleration: Vector<Real>, what: &str) -> Result<(), ProtocolError> {
    if acceleration != Vector::zeros() {
        return Err(ProtocolError::Encode(format!("{what} carries acceleration")));
    }
    Ok(())
}

fn write_vr_move(writer: &mut BitWriter, data: &VrMove, with_accel: bool) -> Result<(), ProtocolError> {
    write_timestamp(writer, data.timestamp)?;
    if with_accel {
        NET_QUANTIZE_10.write(writer, data.acceleration);
    } else {
        check_light(data.acceleration, "ex-light move")?;
    }
    NET_QUANTIZE_100.write(writer, data.client_location);
    NET_QUANTIZE_100.write(writer, data.capsule_location);
    write_conditional(writer, &data.conditional);
    NET_QUANTIZE_100.write(writer, data.lf_diff);
    writer.write_u16(data.capsule_yaw);
    writer.write_u8(data.flags);
    write_reps2(writer, &data.reps2);
    writer.write_u8(data.client_mode.pack());
    Ok(())
}

fn read_vr_move(reader: &mut BitReader<'_>, with_accel: bool) -> Result<VrMove, ProtocolError> {
    let timestamp = read_timestamp(reader)?;
    let acceleration = if with_accel {
        NET_QUANTIZE_10.read(reader)?
    } else {
        Vector::zeros()
    };
    Ok(VrMove {
        timestamp,
        acceleration,
        client_location: NET_QUANTIZE_100.read(reader)?,
        capsule_location: NET_QUANTIZE_100.read(reader)?,
        conditional: read_conditional(reader)?,
        lf_diff: NET_QUANTIZE_100.read(reader)?,
        capsule_yaw: reader.read_u16()?,
        flags: reader.read_u8()?,
        reps2: read_reps2(reader)?,
        client_mode: read_mode(reader)?,
    })
}

fn write_dual(writer: &mut BitWriter, dual: &DualVrMove, with_accel: bool) -> Result<(), ProtocolError> {
    let old = &dual.old;
    write_timestamp(writer, old.timestamp)?;
    if with_accel {
        NET_QUANTIZE_10.write(writer, old.acceleration);
    } else {
        check_light(old.acceleration, "ex-light old move")?;
    }
    writer.write_u8(old.flags);
    writer.write_u32(old.view);
    NET_QUANTIZE_100.write(writer, old.capsule_location);
    write_conditional(writer, &old.conditional);
    NET_QUANTIZE_100.write(writer, old.lf_diff);
    writer.write_u16(old.capsule_yaw);
    write_vr_move(writer, &dual.new, with_accel)
}

fn read_dual(reader: &mut BitReader<'_>, with_accel: bool) -> Result<DualVrMove, ProtocolError> {
    let timestamp = read_timestamp(reader)?;
    let acceleration = if with_accel {
        NET_QUANTIZE_10.read(reader)?
    } else {
        Vector::zeros()
    };
    let old = OldVrMove {
        timestamp,
        acceleration,
        flags: reader.read_u8()?,
        view: reader.read_u32()?,
        capsule_location: NET_QUANTIZE_100.read(reader)?,
        conditional: read_conditional(reader)?,
        lf_diff: NET_QUANTIZE_100.read(reader)?,
        capsule_yaw: reader.read_u16()?,
    };
    let new = read_vr_move(reader, with_accel)?;
    Ok(DualVrMove { old, new })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_move(timestamp: f32, acceleration: Vector<Real>) -> VrMove {
        VrMove {
            timestamp,
            acceleration,
            client_location: Vector::new(120.25, -40.5, 92.0),
            capsule_location: Vector::new(12.5, -3.25, 165.0),
            conditional: ConditionalMoveRep::default(),
            lf_diff: Vector::new(0.75, -0.5, 0.0),
            capsule_yaw: compress_axis_to_short(45.0),
            flags: 0x01,
            reps2: ConditionalMoveRep2 {
                base: Some(BaseHandle {
                    index: 3,
                    generation: 1,
                }),
                client_yaw: compress_axis_to_short(90.0),
                pitch_roll: None,
            },
            client_mode: MovementMode::Walking,
        }
    }

    #[test]
    fn dual_move_round_trip() {
        let dual = DualVrMove {
            old: OldVrMove {
                timestamp: 1.5,
                acceleration: Vector::new(2048.0, 0.0, 0.0),
                flags: 0x02,
                view: (u32::from(compress_axis_to_short(10.0)) << 16) | u32::from(compress_axis_to_short(90.0)),
                capsule_location: Vector::new(12.25, -3.0, 165.0),
                conditional: ConditionalMoveRep {
                    requested_velocity: None,
                    custom_vr_input: Some(Vector::new(1.5, 0.0, 0.0)),
                    move_action: Some(MoveAction::SnapTurn { yaw: 90.0 }),
                },
                lf_diff: Vector::new(0.25, 0.0, 0.0),
                capsule_yaw: compress_axis_to_short(40.0),
            },
            new: sample_move(1.5166, Vector::new(1024.5, -512.0, 0.0)),
        };
        let message = ProtocolMessage::ServerMoveVrDual(dual);
        let encoded = message.encode().expect("encode dual");
        let decoded = ProtocolMessage::decode(&encoded).expect("decode dual");
        assert_eq!(decoded, message);
    }

    #[test]
    fn ex_light_is_smaller_and_decodes_zero_accel() {
        let light = ProtocolMessage::ServerMoveVrExLight(sample_move(2.0, Vector::zeros()));
        let full = ProtocolMessage::ServerMoveVr(sample_move(2.0, Vector::new(300.0, 0.0, 0.0)));
        let light_bytes = light.encode().expect("encode light");
        let full_bytes = full.encode().expect("encode full");
        assert!(light_bytes.len() < full_bytes.len());
        assert_eq!(ProtocolMessage::decode(&light_bytes).expect("decode light"), light);

        let bad = ProtocolMessage::ServerMoveVrExLight(sample_move(2.0, Vector::new(1.0, 0.0, 0.0)));
        assert!(matches!(bad.encode(), Err(ProtocolError::Encode(_))));
    }

    #[test]
    fn adjustment_quantizes_location_and_velocity() {
        let message = ProtocolMessage::ClientAdjustPosition(ClientAdjustment {
            timestamp: 3.25,
            location: Vector::new(10.123, 20.456, 30.789),
            velocity: Vector::new(600.04, 0.0, -420.06),
            mode: MovementMode::Falling,
            base: None,
            has_base_location: false,
        });
        let encoded = message.encode().expect("encode adjustment");
        let ProtocolMessage::ClientAdjustPosition(decoded) =
            ProtocolMessage::decode(&encoded).expect("decode adjustment")
        else {
            panic!("wrong message type");
        };
        assert!((decoded.location - Vector::new(10.12, 20.46, 30.79)).norm() < 1.0e-3);
        assert!((decoded.velocity - Vector::new(600.0, 0.0, -420.1)).norm() < 1.0e-2);
        assert_eq!(decoded.mode, MovementMode::Falling);
    }

    #[test]
    fn decode_rejects_malformed_packets() {
        assert!(ProtocolMessage::decode(&[]).is_err());
        assert!(ProtocolMessage::decode(&[99, 0, 0, 0, 0]).is_err());

        let ack = ProtocolMessage::ClientAckGoodMove { timestamp: 1.0 };
        let mut bytes = ack.encode().expect("encode ack");
        assert_eq!(ProtocolMessage::decode(&bytes).expect("decode ack"), ack);
        bytes.push(0);
        assert!(ProtocolMessage::decode(&bytes).is_err());
        assert!(ProtocolMessage::decode(&bytes[..3]).is_err());

        let mut nan = vec![TYPE_CLIENT_ACK_GOOD_MOVE];
        nan.extend_from_slice(&f32::NAN.to_bits().to_le_bytes());
        assert!(ProtocolMessage::decode(&nan).is_err());

        let old = ProtocolMessage::ServerMoveOld(OldMove {
            timestamp: 0.5,
            acceleration: Vector::zeros(),
            flags: 0,
        });
        assert_eq!(ProtocolMessage::decode(&old.encode().expect("encode old")).expect("decode old"), old);
    }

    #[test]
    fn invalid_mode_byte_is_rejected() {
        let mut writer = BitWriter::new();
        writer.write_f32(1.0);
        NET_QUANTIZE_100.write(&mut writer, Vector::zeros());
        NET_QUANTIZE_10.write(&mut writer, Vector::zeros());
        writer.write_u8(7);
        writer.write_bool(false);
        writer.write_bool(false);
        let mut bytes = vec![TYPE_CLIENT_ADJUST_POSITION];
        bytes.extend_from_slice(&writer.into_bytes());
        let error = ProtocolMessage::decode(&bytes).expect_err("mode 7 is invalid");
        assert!(error.to_string().contains("invalid movement mode"));
    }
}
