//! Client-side prediction: simulate locally, save the move, send it, and
//! replay unacknowledged moves on top of server corrections.
#![forbid(unsafe_code)]

use character_movement::math::is_zero;
use character_movement::MovementContext;
use net_protocol::{
    compress_axis_to_byte, compress_axis_to_short, round_trip_axis, ClientAdjustment,
    ConditionalMoveRep, ConditionalMoveRep2, DualVrMove, NetConfig, OldMove, OldVrMove,
    ProtocolError, ProtocolMessage, VrMove, NET_QUANTIZE_10, NET_QUANTIZE_100,
};
use player_controller::{InputIntent, VrCharacter};
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use thiserror::Error;
use tracing::{debug, trace};

pub mod saved_move;

pub use saved_move::{MovePayload, SavedMove, SavedMoveBuffer, VrMovePayload};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("unexpected {0} message from server")]
    UnexpectedMessage(&'static str),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub moves: u64,
    pub combined_moves: u64,
    pub delayed_moves: u64,
    pub packets_sent: u64,
    pub old_moves_sent: u64,
    pub acks: u64,
    pub corrections: u64,
    pub stale_adjustments: u64,
    pub replayed_moves: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ClientNetState {
    pub current_timestamp: f32,
    pub last_send_time: f32,
    /// The newest saved move has not been sent yet.
    pub has_pending_move: bool,
    pub last_acked_timestamp: Option<f32>,
    pub pending_adjustment: Option<ClientAdjustment>,
    /// A correction arrived and saved moves must be replayed.
    pub update_position: bool,
}

pub struct PredictionClient {
    character: VrCharacter,
    config: NetConfig,
    moves: SavedMoveBuffer<VrMovePayload>,
    net: ClientNetState,
    outbox: Vec<Vec<u8>>,
    stats: ClientStats,
}

impl PredictionClient {
    pub fn new(character: VrCharacter, config: NetConfig) -> Self {
        Self {
            character,
            moves: SavedMoveBuffer::new(config.max_saved_moves),
            config,
            net: ClientNetState::default(),
            outbox: Vec::new(),
            stats: ClientStats::default(),
        }
    }

    pub fn character(&self) -> &VrCharacter {
        &self.character
    }

    pub fn character_mut(&mut self) -> &mut VrCharacter {
        &mut self.character
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn net_state(&self) -> &ClientNetState {
        &self.net
    }

    pub fn saved_moves(&self) -> &SavedMoveBuffer<VrMovePayload> {
        &self.moves
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    /// Encoded packets waiting for the transport.
    pub fn drain_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    /// One local frame: apply any correction, read input, move and send.
    pub fn tick(
        &mut self,
        ctx: &MovementContext<'_>,
        intent: &InputIntent,
        delta_time: Real,
        now: f32,
    ) -> Result<(), ClientError> {
        self.update_position_after_server_update(ctx);
        let (acceleration, flags) = self.character.apply_input(intent);
        self.replicate_move_to_server(ctx, delta_time, acceleration, flags, now)
    }

    pub fn replicate_move_to_server(
        &mut self,
        ctx: &MovementContext<'_>,
        delta_time: Real,
        acceleration: Vector<Real>,
        flags: u8,
        now: f32,
    ) -> Result<(), ClientError> {
        let delta_time = delta_time.min(self.config.max_move_delta_time);
        if delta_time <= 0.0 || !delta_time.is_finite() {
            return Ok(());
        }
        self.update_timestamp_and_delta_time(delta_time);
        let acceleration = NET_QUANTIZE_10.round_trip(acceleration);

        // The newest saved move may still be merged, so it is never the old move.
        let old_move = self.moves.important_move_after(1).map(|saved| OldMove {
            timestamp: saved.timestamp,
            acceleration: saved.acceleration,
            flags: saved.flags,
        });

        let mut new_move = self.moves.create_saved_move();
        if self.moves.is_empty() {
            self.net.has_pending_move = false;
        }
        let timestamp = self.net.current_timestamp;
        let payload = self.capture_payload();
        new_move.set_move_for(&self.character, ctx, timestamp, delta_time, acceleration, flags, payload);

        let mut move_delta_time = delta_time;
        if self.net.has_pending_move && self.config.enable_move_combining {
            let combinable = self.moves.last().is_some_and(|pending| {
                pending.can_combine_with(&new_move, self.config.max_move_delta_time)
                    && !ctx.collision.overlap_blocking_test(
                        pending.start_location,
                        &self.character.movement().capsule().shape(),
                    )
            });
            if let Some(pending) = combinable.then(|| self.moves.pop_last()).flatten() {
                let capsule = self.character.movement().capsule();
                let (tracked_location, tracked_yaw) = (capsule.tracked_location(), capsule.tracked_yaw());
                if let Some(start) = &pending.start {
                    self.character.restore(start);
                }
                self.character
                    .movement_mut()
                    .capsule_mut()
                    .set_tracked_pose(tracked_location, tracked_yaw);
                move_delta_time += pending.delta_time;
                let payload = self.capture_payload();
                new_move.set_move_for(
                    &self.character,
                    ctx,
                    timestamp,
                    move_delta_time,
                    acceleration,
                    flags,
                    payload,
                );
                trace!(delta_time = move_delta_time, "combined pending move");
                self.moves.free_move(pending);
                self.net.has_pending_move = false;
                self.stats.combined_moves += 1;
            }
        }

        let payload = new_move.payload;
        payload.conditional.apply_to(self.character.movement_mut());
        self.character
            .apply_replicated_vr_state(payload.capsule_location, payload.capsule_yaw, payload.lf_diff);
        self.character
            .move_autonomous(ctx, move_delta_time, flags, acceleration);
        new_move.post_update(&self.character);
        self.stats.moves += 1;

        let important = self
            .moves
            .last_acked()
            .is_some_and(|acked| new_move.is_important_move(acked));
        let can_delay = self.config.enable_send_delay
            && !self.net.has_pending_move
            && new_move.can_delay_sending()
            && !important;
        self.moves.push(new_move);

        if can_delay && now - self.net.last_send_time < self.config.clamped_send_delta_time() {
            self.net.has_pending_move = true;
            self.stats.delayed_moves += 1;
            return Ok(());
        }

        self.call_server_move(old_move)?;
        self.net.last_send_time = now;
        Ok(())
    }

    fn update_timestamp_and_delta_time(&mut self, delta_time: Real) {
        if self.net.current_timestamp > self.config.timestamp_reset_interval {
            debug!(
                timestamp = self.net.current_timestamp,
                "resetting client timestamp"
            );
            self.net.current_timestamp = delta_time;
            self.net.last_acked_timestamp = None;
            self.moves.mark_timestamp_reset();
        } else {
            self.net.current_timestamp += delta_time;
        }
    }

    /// Head state and extras for the next move, rounded to what the server
    /// will decode.
    fn capture_payload(&self) -> VrMovePayload {
        let movement = self.character.movement();
        let capsule = movement.capsule();
        let lf_diff = self
            .character
            .vr_offset_delta(capsule.difference_from_last_frame());
        VrMovePayload {
            capsule_location: NET_QUANTIZE_100.round_trip(capsule.tracked_location()),
            capsule_yaw: round_trip_axis(capsule.tracked_yaw()),
            lf_diff: NET_QUANTIZE_100.round_trip(lf_diff),
            conditional: ConditionalMoveRep::capture(movement).quantized(),
        }
    }

    fn call_server_move(&mut self, old_move: Option<OldMove>) -> Result<(), ClientError> {
        if let Some(old) = old_move {
            self.outbox.push(ProtocolMessage::ServerMoveOld(old).encode()?);
            self.stats.old_moves_sent += 1;
        }

        let count = self.moves.len();
        let Some(new_move) = self.moves.last() else {
            return Ok(());
        };
        let pending = if self.net.has_pending_move && count >= 2 {
            self.moves.get(count - 2)
        } else {
            None
        };
        let new = vr_move(new_move);
        let message = match pending {
            Some(pending) => {
                let dual = DualVrMove {
                    old: old_vr_move(pending),
                    new,
                };
                if !pending.root_motion && new_move.root_motion {
                    ProtocolMessage::ServerMoveVrDualHybridRootMotion(dual)
                } else if is_zero(&pending.acceleration) && is_zero(&new_move.acceleration) {
                    ProtocolMessage::ServerMoveVrDualExLight(dual)
                } else {
                    ProtocolMessage::ServerMoveVrDual(dual)
                }
            }
            None if is_zero(&new_move.acceleration) => ProtocolMessage::ServerMoveVrExLight(new),
            None => ProtocolMessage::ServerMoveVr(new),
        };
        trace!(timestamp = new.timestamp, dual = pending.is_some(), "sending move");
        self.outbox.push(message.encode()?);
        self.net.has_pending_move = false;
        self.stats.packets_sent += 1;
        Ok(())
    }

    /// Decodes and handles one packet from the server.
    pub fn receive(&mut self, packet: &[u8]) -> Result<(), ClientError> {
        let message = ProtocolMessage::decode(packet)?;
        self.handle_server_message(message)
    }

    pub fn handle_server_message(&mut self, message: ProtocolMessage) -> Result<(), ClientError> {
        match message {
            ProtocolMessage::ClientAckGoodMove { timestamp } => {
                if self.moves.ack_move(timestamp) {
                    self.net.last_acked_timestamp = Some(timestamp);
                    self.stats.acks += 1;
                } else {
                    trace!(timestamp, "ack for a move no longer saved");
                }
                Ok(())
            }
            ProtocolMessage::ClientAdjustPosition(adjustment) => {
                self.client_adjust_position(adjustment);
                Ok(())
            }
            _ => Err(ClientError::UnexpectedMessage("server move")),
        }
    }

    fn client_adjust_position(&mut self, adjustment: ClientAdjustment) {
        let timestamp = adjustment.timestamp;
        let behind_ack = self
            .net
            .last_acked_timestamp
            .is_some_and(|acked| timestamp <= acked);
        if behind_ack || !self.moves.ack_move(timestamp) {
            self.stats.stale_adjustments += 1;
            debug!(timestamp, "ignoring stale adjustment");
            return;
        }
        self.net.last_acked_timestamp = Some(timestamp);
        self.net.pending_adjustment = Some(adjustment);
        self.net.update_position = true;
        self.stats.corrections += 1;
        debug!(
            timestamp,
            location = ?adjustment.location,
            mode = ?adjustment.mode,
            "server corrected position"
        );
    }

    /// Applies a received correction and replays every move the server has
    /// not acknowledged. Returns the number of replayed moves.
    pub fn update_position_after_server_update(&mut self, ctx: &MovementContext<'_>) -> usize {
        if !self.net.update_position {
            return 0;
        }
        self.net.update_position = false;
        let Some(adjustment) = self.net.pending_adjustment.take() else {
            return 0;
        };

        let flags = self.character.compressed_flags();
        let control = self.character.control_rotation();
        let movement = self.character.movement_mut();
        movement.apply_correction(
            ctx,
            adjustment.location,
            adjustment.velocity,
            adjustment.mode,
            adjustment.base,
        );
        if let Some(acked) = self.moves.last_acked() {
            movement
                .capsule_mut()
                .reset_tracking(acked.payload.capsule_location, acked.payload.capsule_yaw);
        }

        let mut replayed = 0;
        for saved in self.moves.iter_mut() {
            saved.rebase_start(&self.character);
            let payload = saved.payload;
            payload.conditional.apply_to(self.character.movement_mut());
            self.character.set_control_rotation(saved.control);
            self.character
                .apply_replicated_vr_state(payload.capsule_location, payload.capsule_yaw, payload.lf_diff);
            self.character
                .move_autonomous(ctx, saved.delta_time, saved.flags, saved.acceleration);
            saved.post_update(&self.character);
            replayed += 1;
        }
        self.character.set_control_rotation(control);
        self.character.update_from_compressed_flags(flags);
        self.stats.replayed_moves += replayed as u64;
        debug!(replayed, "replayed saved moves after correction");
        replayed
    }
}

fn vr_move(saved: &SavedMove) -> VrMove {
    let control = saved.control;
    let pitch_roll = (control.pitch != 0.0 || control.roll != 0.0).then(|| {
        (
            compress_axis_to_short(control.pitch),
            compress_axis_to_byte(control.roll),
        )
    });
    VrMove {
        timestamp: saved.timestamp,
        acceleration: saved.acceleration,
        client_location: saved.end_location,
        capsule_location: saved.payload.capsule_location,
        conditional: saved.payload.conditional,
        lf_diff: saved.payload.lf_diff,
        capsule_yaw: compress_axis_to_short(saved.payload.capsule_yaw),
        flags: saved.flags,
        reps2: ConditionalMoveRep2 {
            base: saved.end_base,
            client_yaw: compress_axis_to_short(control.yaw),
            pitch_roll,
        },
        client_mode: saved.end_mode,
    }
}

fn old_vr_move(saved: &SavedMove) -> OldVrMove {
    let control = saved.control;
    let view = (u32::from(compress_axis_to_short(control.pitch)) << 16)
        | u32::from(compress_axis_to_short(control.yaw));
    OldVrMove {
        timestamp: saved.timestamp,
        acceleration: saved.acceleration,
        flags: saved.flags,
        view,
        capsule_location: saved.payload.capsule_location,
        conditional: saved.payload.conditional,
        lf_diff: saved.payload.lf_diff,
        capsule_yaw: compress_axis_to_short(saved.payload.capsule_yaw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use character_collision::RapierCollision;
    use character_movement::{MovementConfig, MovementMode};
    use physics_rapier::PhysicsWorld;
    use player_controller::FLAG_JUMP_PRESSED;
    use rapier3d::prelude::{vector, ColliderBuilder};

    const DT: Real = 1.0 / 60.0;

    fn floor_world() -> PhysicsWorld {
        let mut world = PhysicsWorld::z_up();
        world.insert_static_collider(
            ColliderBuilder::cuboid(5000.0, 5000.0, 10.0)
                .translation(vector![0.0, 0.0, -10.0])
                .build(),
        );
        world.refresh_queries();
        world
    }

    fn walking_character(ctx: &MovementContext<'_>) -> VrCharacter {
        let mut character = VrCharacter::new(
            MovementConfig::default(),
            vector![0.0, 0.0, 2.0],
            0.0,
            34.0,
            88.0,
        );
        let movement = character.movement_mut();
        movement.set_movement_mode(ctx, MovementMode::Walking);
        // Already walking, so the first two moves may combine.
        movement.set_velocity(vector![300.0, 0.0, 0.0]);
        character
    }

    fn forward() -> Vector<Real> {
        vector![2048.0, 0.0, 0.0]
    }

    #[test]
    fn combined_move_matches_single_long_move() {
        let world = floor_world();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let mut client = PredictionClient::new(walking_character(&ctx), NetConfig::default());
        client
            .replicate_move_to_server(&ctx, DT, forward(), 0, 0.001)
            .expect("first move");
        client
            .replicate_move_to_server(&ctx, DT, forward(), 0, 0.002)
            .expect("second move");

        let stats = client.stats();
        assert_eq!(stats.combined_moves, 1);
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(client.saved_moves().len(), 1);
        let saved = client.saved_moves().last().expect("combined move");
        assert!((saved.delta_time - 2.0 * DT).abs() < 1.0e-6);

        let mut reference = walking_character(&ctx);
        reference.move_autonomous(&ctx, 2.0 * DT, 0, forward());
        let combined = client.character().movement();
        assert!((combined.location() - reference.movement().location()).norm() < 0.01);
        assert!((combined.velocity() - reference.movement().velocity()).norm() < 0.01);
    }

    #[test]
    fn pending_move_that_cannot_combine_goes_out_as_dual() {
        let world = floor_world();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let mut client = PredictionClient::new(walking_character(&ctx), NetConfig::default());
        client
            .replicate_move_to_server(&ctx, DT, forward(), 0, 0.001)
            .expect("first move");
        client
            .replicate_move_to_server(&ctx, DT, forward(), FLAG_JUMP_PRESSED, 0.002)
            .expect("jump move");

        let packets = client.drain_outgoing();
        assert_eq!(packets.len(), 1);
        let message = ProtocolMessage::decode(&packets[0]).expect("decode dual");
        let ProtocolMessage::ServerMoveVrDual(dual) = message else {
            panic!("expected a dual move, got {message:?}");
        };
        assert_eq!(dual.old.flags, 0);
        assert_eq!(dual.new.flags, FLAG_JUMP_PRESSED);
        assert!(dual.old.timestamp < dual.new.timestamp);
        assert_eq!(dual.new.client_mode, MovementMode::Falling);
        assert!(!client.net_state().has_pending_move);
    }

    #[test]
    fn idle_move_sends_ex_light() {
        let world = floor_world();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let config = NetConfig {
            enable_send_delay: false,
            ..NetConfig::default()
        };
        let mut client = PredictionClient::new(walking_character(&ctx), config);
        client
            .replicate_move_to_server(&ctx, DT, Vector::zeros(), 0, 0.0)
            .expect("idle move");
        let packets = client.drain_outgoing();
        assert_eq!(packets.len(), 1);
        assert!(matches!(
            ProtocolMessage::decode(&packets[0]).expect("decode"),
            ProtocolMessage::ServerMoveVrExLight(_)
        ));
    }

    #[test]
    fn correction_replays_unacknowledged_moves() {
        let world = floor_world();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let config = NetConfig {
            enable_send_delay: false,
            ..NetConfig::default()
        };
        let mut client = PredictionClient::new(walking_character(&ctx), config);
        for i in 0..3 {
            client
                .replicate_move_to_server(&ctx, DT, forward(), 0, i as f32 * DT)
                .expect("move");
        }
        let predicted = client.character().movement().location();
        let first = client.saved_moves().iter().next().cloned().expect("first move");

        let shift = vector![0.0, 50.0, 0.0];
        client
            .handle_server_message(ProtocolMessage::ClientAdjustPosition(ClientAdjustment {
                timestamp: first.timestamp,
                location: first.end_location + shift,
                velocity: first.end_velocity,
                mode: MovementMode::Walking,
                base: None,
                has_base_location: false,
            }))
            .expect("adjustment");
        assert_eq!(client.saved_moves().len(), 2);

        let replayed = client.update_position_after_server_update(&ctx);
        assert_eq!(replayed, 2);
        let corrected = client.character().movement().location();
        assert!((corrected - (predicted + shift)).norm() < 1.0);
        assert_eq!(client.stats().corrections, 1);
    }

    #[test]
    fn stale_adjustment_is_ignored() {
        let world = floor_world();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let mut client = PredictionClient::new(walking_character(&ctx), NetConfig::default());
        client
            .handle_server_message(ProtocolMessage::ClientAdjustPosition(ClientAdjustment {
                timestamp: 99.0,
                location: Vector::zeros(),
                velocity: Vector::zeros(),
                mode: MovementMode::Falling,
                base: None,
                has_base_location: false,
            }))
            .expect("stale adjustment");
        assert_eq!(client.stats().stale_adjustments, 1);
        assert_eq!(client.update_position_after_server_update(&ctx), 0);
        assert_eq!(client.character().movement().mode(), MovementMode::Walking);
    }

    #[test]
    fn timestamp_resets_after_interval() {
        let world = floor_world();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let config = NetConfig {
            enable_send_delay: false,
            timestamp_reset_interval: 0.06,
            ..NetConfig::default()
        };
        let mut client = PredictionClient::new(walking_character(&ctx), config);
        for i in 0..5 {
            client
                .replicate_move_to_server(&ctx, DT, forward(), 0, i as f32 * DT)
                .expect("move");
        }
        assert!(client.net_state().current_timestamp < 0.02);
        let marked = client
            .saved_moves()
            .iter()
            .filter(|saved| saved.old_timestamp_before_reset)
            .count();
        assert_eq!(marked, 4);
    }

    #[test]
    fn server_moves_from_server_are_rejected() {
        let world = floor_world();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let mut client = PredictionClient::new(walking_character(&ctx), NetConfig::default());
        let old = ProtocolMessage::ServerMoveOld(OldMove {
            timestamp: 1.0,
            acceleration: Vector::zeros(),
            flags: 0,
        });
        let packet = old.encode().expect("encode");
        assert!(matches!(
            client.receive(&packet),
            Err(ClientError::UnexpectedMessage(_))
        ));
        assert!(client.receive(&[0xFF]).is_err());
    }
}
