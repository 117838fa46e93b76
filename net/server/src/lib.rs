//! Server authority: re-simulates every client move and corrects clients
//! that disagree.
#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use character_movement::MovementContext;
use net_protocol::{
    decompress_axis_from_byte, decompress_axis_from_short, DualVrMove, NetConfig, ProtocolError,
    ProtocolMessage, VrMove,
};
use player_controller::{ControlRotation, VrCharacter};
use thiserror::Error;
use tracing::{debug, info};

pub mod session;

pub use session::{
    old_move_placeholder_location, ClientSession, MoveRejection, MoveTiming, ReplicatedMoveState,
    ServerMoveInput, ServerReply, SessionStats,
};

pub type ConnectionId = u32;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} already has a session")]
    DuplicateConnection(ConnectionId),
    #[error("unexpected {0} message from client")]
    UnexpectedMessage(&'static str),
}

pub struct AuthorityServer {
    config: NetConfig,
    sessions: HashMap<ConnectionId, ClientSession>,
}

impl AuthorityServer {
    pub fn new(config: NetConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn client_count(&self) -> usize {
        self.sessions.len()
    }

    /// Starts authority over `character` for a new connection.
    pub fn connect(&mut self, id: ConnectionId, character: VrCharacter) -> Result<(), ServerError> {
        match self.sessions.entry(id) {
            Entry::Occupied(_) => Err(ServerError::DuplicateConnection(id)),
            Entry::Vacant(entry) => {
                entry.insert(ClientSession::new(character));
                info!(id, "client connected");
                Ok(())
            }
        }
    }

    pub fn disconnect(&mut self, id: ConnectionId) -> Result<ClientSession, ServerError> {
        let session = self
            .sessions
            .remove(&id)
            .ok_or(ServerError::UnknownConnection(id))?;
        info!(id, "client disconnected");
        Ok(session)
    }

    pub fn session(&self, id: ConnectionId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: ConnectionId) -> Option<&mut ClientSession> {
        self.sessions.get_mut(&id)
    }

    /// Sum of every session's counters.
    pub fn stats(&self) -> SessionStats {
        self.sessions
            .values()
            .map(ClientSession::stats)
            .fold(SessionStats::default(), |mut total, stats| {
                total.moves += stats.moves;
                total.old_moves += stats.old_moves;
                total.rejected_moves += stats.rejected_moves;
                total.acks += stats.acks;
                total.corrections += stats.corrections;
                total.deferred_corrections += stats.deferred_corrections;
                total
            })
    }

    /// Decodes and processes one packet from a client. Returns the rejection
    /// of the packet's newest move, if it was dropped.
    pub fn receive(
        &mut self,
        ctx: &MovementContext<'_>,
        id: ConnectionId,
        packet: &[u8],
        now: f32,
    ) -> Result<Option<MoveRejection>, ServerError> {
        let message = ProtocolMessage::decode(packet)?;
        self.handle_client_message(ctx, id, message, now)
    }

    pub fn handle_client_message(
        &mut self,
        ctx: &MovementContext<'_>,
        id: ConnectionId,
        message: ProtocolMessage,
        now: f32,
    ) -> Result<Option<MoveRejection>, ServerError> {
        let config = self.config.clone();
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(ServerError::UnknownConnection(id))?;
        let rejection = match message {
            ProtocolMessage::ServerMoveVr(data) | ProtocolMessage::ServerMoveVrExLight(data) => {
                session.server_move(ctx, &config, &new_move_input(&data), now).err()
            }
            ProtocolMessage::ServerMoveVrDual(dual)
            | ProtocolMessage::ServerMoveVrDualExLight(dual)
            | ProtocolMessage::ServerMoveVrDualHybridRootMotion(dual) => {
                server_move_dual(session, ctx, &config, &dual, now)
            }
            ProtocolMessage::ServerMoveOld(old) => {
                session.server_move_old(ctx, &config, old.timestamp, old.acceleration, old.flags, now);
                None
            }
            ProtocolMessage::ClientAdjustPosition(_) => {
                return Err(ServerError::UnexpectedMessage("client adjust position"))
            }
            ProtocolMessage::ClientAckGoodMove { .. } => {
                return Err(ServerError::UnexpectedMessage("client ack"))
            }
        };
        Ok(rejection)
    }

    /// Encoded replies owed to a connection.
    pub fn drain_replies(&mut self, id: ConnectionId) -> Result<Vec<Vec<u8>>, ServerError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(ServerError::UnknownConnection(id))?;
        let mut packets = Vec::new();
        for reply in session.take_replies() {
            packets.push(reply.into_message().encode()?);
        }
        Ok(packets)
    }
}

/// Old half first, without an error check, then the new half. Both use the
/// new move's base.
fn server_move_dual(
    session: &mut ClientSession,
    ctx: &MovementContext<'_>,
    config: &NetConfig,
    dual: &DualVrMove,
    now: f32,
) -> Option<MoveRejection> {
    let old = &dual.old;
    let old_input = ServerMoveInput {
        timestamp: old.timestamp,
        acceleration: old.acceleration,
        flags: old.flags,
        capsule_location: old.capsule_location,
        capsule_yaw: old.capsule_yaw,
        lf_diff: old.lf_diff,
        conditional: old.conditional,
        control: ControlRotation {
            yaw: decompress_axis_from_short((old.view & 0xFFFF) as u16),
            pitch: decompress_axis_from_short((old.view >> 16) as u16),
            roll: 0.0,
        },
        client_location: old_move_placeholder_location(),
        client_mode: dual.new.client_mode,
        base: dual.new.reps2.base,
    };
    if let Err(rejection) = session.server_move(ctx, config, &old_input, now) {
        debug!(?rejection, timestamp = old.timestamp, "old half of dual move dropped");
    }
    session.server_move(ctx, config, &new_move_input(&dual.new), now).err()
}

fn new_move_input(data: &VrMove) -> ServerMoveInput {
    let (pitch, roll) = data
        .reps2
        .pitch_roll
        .map(|(pitch, roll)| (decompress_axis_from_short(pitch), decompress_axis_from_byte(roll)))
        .unwrap_or((0.0, 0.0));
    ServerMoveInput {
        timestamp: data.timestamp,
        acceleration: data.acceleration,
        flags: data.flags,
        capsule_location: data.capsule_location,
        capsule_yaw: data.capsule_yaw,
        lf_diff: data.lf_diff,
        conditional: data.conditional,
        control: ControlRotation {
            yaw: decompress_axis_from_short(data.reps2.client_yaw),
            pitch,
            roll,
        },
        client_location: data.client_location,
        client_mode: data.client_mode,
        base: data.reps2.base,
    }
}
