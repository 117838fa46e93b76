//! Per-connection authority over one character.

use character_collision::BaseHandle;
use character_movement::{MovementContext, MovementMode};
use net_protocol::{
    decompress_axis_from_short, ClientAdjustment, ConditionalMoveRep, NetConfig, ProtocolMessage,
};
use player_controller::{ControlRotation, VrCharacter};
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::{debug, trace, warn};

/// Why a move was dropped without being simulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveRejection {
    /// Not newer than the last processed move.
    StaleTimestamp,
    /// The client claims more time than has passed on the server.
    TimeDiscrepancy,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ServerReply {
    Ack { timestamp: f32 },
    Adjust(ClientAdjustment),
}

impl ServerReply {
    pub fn into_message(self) -> ProtocolMessage {
        match self {
            ServerReply::Ack { timestamp } => ProtocolMessage::ClientAckGoodMove { timestamp },
            ServerReply::Adjust(adjustment) => ProtocolMessage::ClientAdjustPosition(adjustment),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub moves: u64,
    pub old_moves: u64,
    pub rejected_moves: u64,
    pub acks: u64,
    pub corrections: u64,
    pub deferred_corrections: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReplicatedMoveState {
    pub current_client_timestamp: f32,
    pub has_received_move: bool,
    /// Server clock at the last processed move.
    pub server_timestamp: f32,
    pub last_update_time: Option<f32>,
    /// An error was found but the correction is still rate limited.
    pub pending_adjustment: bool,
    pub last_adjustment_time: Option<f32>,
    pub last_client_location: Vector<Real>,
    pub last_client_mode: MovementMode,
    pub last_client_base: Option<BaseHandle>,
    /// Client time claimed beyond server time elapsed, in seconds.
    pub time_discrepancy: f32,
}

/// Accepted timing of a move, committed only once it is simulated.
#[derive(Clone, Copy, Debug)]
pub struct MoveTiming {
    pub delta_time: Real,
    time_discrepancy: f32,
}

impl ReplicatedMoveState {
    pub fn verify_client_timestamp(
        &self,
        config: &NetConfig,
        timestamp: f32,
        now: f32,
    ) -> Result<MoveTiming, MoveRejection> {
        let claimed = if self.has_received_move {
            let delta = timestamp - self.current_client_timestamp;
            if delta < -config.timestamp_reset_interval * 0.5 {
                // Client wrapped its clock.
                timestamp
            } else if delta > 0.0 {
                delta
            } else {
                return Err(MoveRejection::StaleTimestamp);
            }
        } else {
            timestamp
        };

        let mut time_discrepancy = self.time_discrepancy;
        if let Some(last_update) = self.last_update_time {
            time_discrepancy += claimed - (now - last_update);
            time_discrepancy = time_discrepancy.max(-config.max_time_discrepancy);
            if time_discrepancy > config.max_time_discrepancy {
                return Err(MoveRejection::TimeDiscrepancy);
            }
        }
        Ok(MoveTiming {
            delta_time: self.server_move_delta_time(config, claimed),
            time_discrepancy,
        })
    }

    /// Simulated time for a move claiming `claimed` seconds.
    pub fn server_move_delta_time(&self, config: &NetConfig, claimed: f32) -> Real {
        claimed.min(config.max_move_delta_time).max(0.0)
    }

    fn commit(&mut self, timestamp: f32, timing: MoveTiming, now: f32) {
        self.current_client_timestamp = timestamp;
        self.has_received_move = true;
        self.time_discrepancy = timing.time_discrepancy;
        self.last_update_time = Some(now);
        self.server_timestamp = now;
    }
}

/// One replicated move as the server simulates it.
#[derive(Clone, Copy, Debug)]
pub struct ServerMoveInput {
    pub timestamp: f32,
    pub acceleration: Vector<Real>,
    pub flags: u8,
    pub capsule_location: Vector<Real>,
    pub capsule_yaw: u16,
    pub lf_diff: Vector<Real>,
    pub conditional: ConditionalMoveRep,
    pub control: ControlRotation,
    /// Where the client ended up; the old half of a dual move carries the
    /// placeholder instead.
    pub client_location: Vector<Real>,
    pub client_mode: MovementMode,
    pub base: Option<BaseHandle>,
}

/// Location sent for the old half of a dual move, which is not error checked.
pub fn old_move_placeholder_location() -> Vector<Real> {
    Vector::new(1.0, 2.0, 3.0)
}

pub struct ClientSession {
    character: VrCharacter,
    state: ReplicatedMoveState,
    pending_replies: Vec<ServerReply>,
    stats: SessionStats,
}

impl ClientSession {
    pub fn new(character: VrCharacter) -> Self {
        Self {
            character,
            state: ReplicatedMoveState::default(),
            pending_replies: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn character(&self) -> &VrCharacter {
        &self.character
    }

    pub fn character_mut(&mut self) -> &mut VrCharacter {
        &mut self.character
    }

    pub fn state(&self) -> &ReplicatedMoveState {
        &self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn take_replies(&mut self) -> Vec<ServerReply> {
        std::mem::take(&mut self.pending_replies)
    }

    /// Simulates one client move and checks the result against the client.
    pub fn server_move(
        &mut self,
        ctx: &MovementContext<'_>,
        config: &NetConfig,
        input: &ServerMoveInput,
        now: f32,
    ) -> Result<(), MoveRejection> {
        let timing = self.reject_counted(config, input.timestamp, now)?;
        self.state.commit(input.timestamp, timing, now);

        input.conditional.apply_to(self.character.movement_mut());
        self.character.set_control_rotation(input.control);
        self.character.apply_replicated_vr_state(
            input.capsule_location,
            decompress_axis_from_short(input.capsule_yaw),
            input.lf_diff,
        );
        self.character
            .move_autonomous(ctx, timing.delta_time, input.flags, input.acceleration);
        self.state.last_client_base = input.base;
        self.stats.moves += 1;

        if input.client_location != old_move_placeholder_location() {
            self.server_move_handle_client_error(
                config,
                input.timestamp,
                input.client_location,
                input.client_mode,
                now,
            );
        }
        Ok(())
    }

    /// A possibly lost important move. Already-processed ones are skipped.
    pub fn server_move_old(
        &mut self,
        ctx: &MovementContext<'_>,
        config: &NetConfig,
        timestamp: f32,
        acceleration: Vector<Real>,
        flags: u8,
        now: f32,
    ) {
        let timing = match self.state.verify_client_timestamp(config, timestamp, now) {
            Ok(timing) => timing,
            Err(rejection) => {
                trace!(timestamp, ?rejection, "old move already processed");
                return;
            }
        };
        self.state.commit(timestamp, timing, now);
        debug!(timestamp, "recovering lost move");
        self.character
            .move_autonomous(ctx, timing.delta_time, flags, acceleration);
        self.stats.old_moves += 1;
    }

    fn reject_counted(
        &mut self,
        config: &NetConfig,
        timestamp: f32,
        now: f32,
    ) -> Result<MoveTiming, MoveRejection> {
        let result = self.state.verify_client_timestamp(config, timestamp, now);
        if let Err(rejection) = result {
            self.stats.rejected_moves += 1;
            warn!(
                timestamp,
                current = self.state.current_client_timestamp,
                ?rejection,
                "rejected client move"
            );
        }
        result
    }

    fn server_move_handle_client_error(
        &mut self,
        config: &NetConfig,
        timestamp: f32,
        client_location: Vector<Real>,
        client_mode: MovementMode,
        now: f32,
    ) {
        self.state.last_client_location = client_location;
        self.state.last_client_mode = client_mode;
        if self.server_check_client_error(config, client_location, client_mode) {
            self.state.pending_adjustment = true;
        }

        if !self.state.pending_adjustment {
            self.pending_replies.push(ServerReply::Ack { timestamp });
            self.stats.acks += 1;
            return;
        }

        let allowed = self
            .state
            .last_adjustment_time
            .map_or(true, |last| now - last >= config.correction_rate_limit);
        if !allowed {
            self.stats.deferred_corrections += 1;
            trace!(timestamp, "correction rate limited");
            return;
        }

        let movement = self.character.movement();
        let base = movement.base();
        let adjustment = ClientAdjustment {
            timestamp,
            location: movement.location(),
            velocity: movement.velocity(),
            mode: movement.mode(),
            base,
            has_base_location: base.is_some(),
        };
        debug!(
            timestamp,
            server = ?adjustment.location,
            client = ?client_location,
            "sending client adjustment"
        );
        self.pending_replies.push(ServerReply::Adjust(adjustment));
        self.state.pending_adjustment = false;
        self.state.last_adjustment_time = Some(now);
        self.stats.corrections += 1;
    }

    pub fn server_check_client_error(
        &self,
        config: &NetConfig,
        client_location: Vector<Real>,
        client_mode: MovementMode,
    ) -> bool {
        let movement = self.character.movement();
        let error_squared = (movement.location() - client_location).norm_squared();
        error_squared > config.max_position_error_squared || movement.mode() != client_mode
    }
}
