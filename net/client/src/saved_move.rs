//! Client-side record of every unacknowledged move.

use character_collision::BaseHandle;
use character_movement::math::{is_zero, safe_normal};
use character_movement::{MovementContext, MovementMode};
use net_protocol::ConditionalMoveRep;
use player_controller::{CharacterSnapshot, ControlRotation, VrCharacter};
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::{trace, warn};

/// Acceleration change that makes a move worth resending.
const ACCEL_MAG_THRESHOLD: Real = 1.0;
const ACCEL_DOT_THRESHOLD: Real = 0.9;
const ACCEL_DOT_THRESHOLD_COMBINE: Real = 0.996;

/// Extra per-move state a [`SavedMove`] carries beyond the base record.
pub trait MovePayload: Clone + Default {
    /// Whether this payload keeps its move from being merged with another.
    fn blocks_combine(&self) -> bool;

    /// Payload-specific merge rules on top of the base record's.
    fn can_combine_with(&self, next: &Self) -> bool;
}

/// Head state sent with each VR move.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VrMovePayload {
    /// Tracked HMD location after the move.
    pub capsule_location: Vector<Real>,
    pub capsule_yaw: Real,
    /// X/Y: head motion of the move. Z: capsule half height when replicated.
    pub lf_diff: Vector<Real>,
    pub conditional: ConditionalMoveRep,
}

impl MovePayload for VrMovePayload {
    fn blocks_combine(&self) -> bool {
        !self.conditional.is_empty()
    }

    fn can_combine_with(&self, next: &Self) -> bool {
        let a = Vector::new(self.lf_diff.x, self.lf_diff.y, 0.0);
        let b = Vector::new(next.lf_diff.x, next.lf_diff.y, 0.0);
        is_zero(&a) || is_zero(&b) || a.dot(&b) > 0.0
    }
}

#[derive(Clone, Debug, Default)]
pub struct SavedMove<P = VrMovePayload> {
    pub timestamp: f32,
    pub delta_time: Real,
    pub acceleration: Vector<Real>,
    pub flags: u8,
    /// Character state the move started from, used to combine and replay.
    pub start: Option<CharacterSnapshot>,
    pub start_location: Vector<Real>,
    pub start_velocity: Vector<Real>,
    pub start_base: Option<BaseHandle>,
    pub start_base_dynamic: bool,
    pub start_mode: MovementMode,
    pub start_half_height: Real,
    pub start_radius: Real,
    pub end_location: Vector<Real>,
    pub end_velocity: Vector<Real>,
    pub end_base: Option<BaseHandle>,
    pub end_mode: MovementMode,
    pub control: ControlRotation,
    pub old_timestamp_before_reset: bool,
    pub force_no_combine: bool,
    pub root_motion: bool,
    pub payload: P,
}

impl<P: MovePayload> SavedMove<P> {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Records the state the move starts from.
    #[allow(clippy::too_many_arguments)]
    pub fn set_move_for(
        &mut self,
        character: &VrCharacter,
        ctx: &MovementContext<'_>,
        timestamp: f32,
        delta_time: Real,
        acceleration: Vector<Real>,
        flags: u8,
        payload: P,
    ) {
        let movement = character.movement();
        self.timestamp = timestamp;
        self.delta_time = delta_time;
        self.acceleration = acceleration;
        self.flags = flags;
        self.start = Some(character.snapshot());
        self.start_location = movement.location();
        self.start_velocity = movement.velocity();
        self.start_base = movement.base();
        self.start_base_dynamic = movement
            .base()
            .and_then(|base| ctx.collision.base_info(base))
            .is_some_and(|info| info.dynamic);
        self.start_mode = movement.mode();
        self.start_half_height = movement.capsule().half_height();
        self.start_radius = movement.capsule().radius();
        self.control = character.control_rotation();
        self.payload = payload;
    }

    /// Moves the recorded start to where a replay begins this move.
    pub fn rebase_start(&mut self, character: &VrCharacter) {
        let movement = character.movement();
        self.start = Some(character.snapshot());
        self.start_location = movement.location();
        self.start_velocity = movement.velocity();
        self.start_base = movement.base();
        self.start_mode = movement.mode();
    }

    /// Records the state the move ended in.
    pub fn post_update(&mut self, character: &VrCharacter) {
        let movement = character.movement();
        self.end_location = movement.location();
        self.end_velocity = movement.velocity();
        self.end_base = movement.base();
        self.end_mode = movement.mode();
    }

    /// Differs enough from the last acknowledged move that losing it would
    /// desync the server.
    pub fn is_important_move(&self, last_acked: &SavedMove<P>) -> bool {
        if self.flags != last_acked.flags || self.end_mode != last_acked.end_mode {
            return true;
        }
        if self.acceleration != last_acked.acceleration {
            let mag = self.acceleration.norm();
            let acked_mag = last_acked.acceleration.norm();
            if (mag - acked_mag).abs() > ACCEL_MAG_THRESHOLD {
                return true;
            }
            let dot = safe_normal(self.acceleration).dot(&safe_normal(last_acked.acceleration));
            if dot < ACCEL_DOT_THRESHOLD {
                return true;
            }
        }
        false
    }

    /// A move that could wait for the next one before being sent.
    pub fn can_delay_sending(&self) -> bool {
        !self.payload.blocks_combine() && !self.force_no_combine
    }

    /// Whether `next` can absorb this (older) move.
    pub fn can_combine_with(&self, next: &SavedMove<P>, max_delta: Real) -> bool {
        let reject = |reason: &str| {
            trace!(reason, "moves not combined");
            false
        };
        if self.force_no_combine || next.force_no_combine {
            return reject("forced");
        }
        if self.old_timestamp_before_reset || next.old_timestamp_before_reset {
            return reject("timestamp reset");
        }
        if self.root_motion || next.root_motion {
            return reject("root motion");
        }
        let zero_accel = is_zero(&self.acceleration);
        if zero_accel != is_zero(&next.acceleration) {
            return reject("acceleration started or stopped");
        }
        if !zero_accel
            && safe_normal(self.acceleration).dot(&safe_normal(next.acceleration))
                < ACCEL_DOT_THRESHOLD_COMBINE
        {
            return reject("acceleration direction");
        }
        if is_zero(&self.start_velocity) != is_zero(&next.start_velocity) {
            return reject("velocity started or stopped");
        }
        if self.delta_time + next.delta_time >= max_delta {
            return reject("delta time");
        }
        if self.flags != next.flags {
            return reject("flags");
        }
        if self.start_mode != next.start_mode || self.end_mode != next.start_mode {
            return reject("movement mode");
        }
        if (self.start_base_dynamic || next.start_base_dynamic) && self.start_base != next.start_base {
            return reject("dynamic base");
        }
        if self.start_half_height != next.start_half_height || self.start_radius != next.start_radius {
            return reject("capsule size");
        }
        if self.payload.blocks_combine() || next.payload.blocks_combine() {
            return reject("conditional reps");
        }
        if !self.payload.can_combine_with(&next.payload) {
            return reject("head motion");
        }
        true
    }
}

/// Unacknowledged moves, oldest first, with a pool of cleared records.
pub struct SavedMoveBuffer<P = VrMovePayload> {
    moves: Vec<SavedMove<P>>,
    free: Vec<SavedMove<P>>,
    max_saved_moves: usize,
    last_acked: Option<SavedMove<P>>,
    overflows: u64,
}

impl<P: MovePayload> SavedMoveBuffer<P> {
    pub fn new(max_saved_moves: usize) -> Self {
        Self {
            moves: Vec::with_capacity(max_saved_moves),
            free: Vec::new(),
            max_saved_moves: max_saved_moves.max(1),
            last_acked: None,
            overflows: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SavedMove<P>> {
        self.moves.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SavedMove<P>> {
        self.moves.iter_mut()
    }

    pub fn get(&self, index: usize) -> Option<&SavedMove<P>> {
        self.moves.get(index)
    }

    pub fn last(&self) -> Option<&SavedMove<P>> {
        self.moves.last()
    }

    pub fn last_acked(&self) -> Option<&SavedMove<P>> {
        self.last_acked.as_ref()
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub fn pool_len(&self) -> usize {
        self.free.len()
    }

    /// A cleared record from the pool. Fails over to freeing every saved
    /// move when the buffer is full.
    pub fn create_saved_move(&mut self) -> SavedMove<P> {
        if self.moves.len() >= self.max_saved_moves {
            self.overflows += 1;
            warn!(
                count = self.moves.len(),
                "saved move buffer overflow, dropping all saved moves"
            );
            self.free_all();
        }
        self.free.pop().unwrap_or_default()
    }

    pub fn push(&mut self, saved: SavedMove<P>) {
        self.moves.push(saved);
    }

    pub fn pop_last(&mut self) -> Option<SavedMove<P>> {
        self.moves.pop()
    }

    pub fn free_move(&mut self, mut saved: SavedMove<P>) {
        saved.clear();
        self.free.push(saved);
    }

    pub fn free_all(&mut self) {
        let moves = std::mem::take(&mut self.moves);
        for saved in moves {
            self.free_move(saved);
        }
    }

    pub fn index_of(&self, timestamp: f32) -> Option<usize> {
        self.moves.iter().position(|saved| saved.timestamp == timestamp)
    }

    /// Frees the move with `timestamp` and everything before it. Returns
    /// false when no saved move has that timestamp.
    pub fn ack_move(&mut self, timestamp: f32) -> bool {
        let Some(index) = self.index_of(timestamp) else {
            return false;
        };
        let mut acked: Vec<_> = self.moves.drain(..=index).collect();
        let last = acked.pop();
        for saved in acked {
            self.free_move(saved);
        }
        if let Some(previous) = std::mem::replace(&mut self.last_acked, last) {
            self.free_move(previous);
        }
        true
    }

    /// Oldest move after the last ack that differs enough from it to be
    /// resent, ignoring the newest `skip_newest` moves.
    pub fn important_move_after(&self, skip_newest: usize) -> Option<&SavedMove<P>> {
        let last_acked = self.last_acked.as_ref()?;
        let end = self.moves.len().saturating_sub(skip_newest);
        self.moves[..end]
            .iter()
            .find(|saved| saved.is_important_move(last_acked))
    }

    /// Marks every saved move as stamped before a client timestamp reset.
    pub fn mark_timestamp_reset(&mut self) {
        for saved in &mut self.moves {
            saved.old_timestamp_before_reset = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walking_move(timestamp: f32, accel: Vector<Real>) -> SavedMove {
        SavedMove {
            timestamp,
            delta_time: 1.0 / 60.0,
            acceleration: accel,
            start_velocity: Vector::new(300.0, 0.0, 0.0),
            start_mode: MovementMode::Walking,
            end_mode: MovementMode::Walking,
            start_half_height: 88.0,
            start_radius: 34.0,
            ..SavedMove::default()
        }
    }

    #[test]
    fn ack_frees_through_timestamp() {
        let mut buffer = SavedMoveBuffer::<VrMovePayload>::new(8);
        for i in 1..=4 {
            let mut saved = buffer.create_saved_move();
            saved.timestamp = i as f32 * 0.25;
            buffer.push(saved);
        }
        assert!(buffer.ack_move(0.5));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.last_acked().map(|saved| saved.timestamp), Some(0.5));
        assert_eq!(buffer.pool_len(), 1);
        assert!(!buffer.ack_move(0.5));
    }

    #[test]
    fn overflow_frees_everything() {
        let mut buffer = SavedMoveBuffer::<VrMovePayload>::new(3);
        for i in 0..3 {
            let mut saved = buffer.create_saved_move();
            saved.timestamp = i as f32;
            buffer.push(saved);
        }
        let saved = buffer.create_saved_move();
        assert!(buffer.is_empty());
        assert_eq!(buffer.overflows(), 1);
        assert_eq!(saved.timestamp, 0.0);
    }

    #[test]
    fn combine_rules() {
        let forward = Vector::new(2048.0, 0.0, 0.0);
        let a = walking_move(1.0, forward);
        let b = walking_move(1.1, forward);
        assert!(a.can_combine_with(&b, 0.125));
        assert!(!a.can_combine_with(&b, 0.03));

        let turned = walking_move(1.1, Vector::new(2048.0, 300.0, 0.0));
        assert!(!a.can_combine_with(&turned, 0.125));

        let mut jumping = walking_move(1.1, forward);
        jumping.flags = 0x01;
        assert!(!a.can_combine_with(&jumping, 0.125));

        let mut snap = walking_move(1.1, forward);
        snap.payload.conditional.move_action =
            Some(character_movement::MoveAction::SnapTurn { yaw: 90.0 });
        assert!(!a.can_combine_with(&snap, 0.125));
        assert!(!snap.can_delay_sending());

        let mut left = walking_move(1.0, forward);
        left.payload.lf_diff = Vector::new(0.0, 2.0, 0.0);
        let mut right = walking_move(1.1, forward);
        right.payload.lf_diff = Vector::new(0.0, -2.0, 0.0);
        assert!(!left.can_combine_with(&right, 0.125));
    }

    #[test]
    fn important_moves_differ_from_last_ack() {
        let mut buffer = SavedMoveBuffer::<VrMovePayload>::new(8);
        let forward = Vector::new(2048.0, 0.0, 0.0);
        buffer.push(walking_move(1.0, forward));
        buffer.push(walking_move(1.1, forward));
        let mut jump = walking_move(1.2, forward);
        jump.flags = 0x01;
        buffer.push(jump);
        buffer.push(walking_move(1.3, forward));
        assert!(buffer.ack_move(1.0));

        let important = buffer.important_move_after(1).expect("jump is important");
        assert_eq!(important.timestamp, 1.2);
        assert!(buffer.important_move_after(2).is_none());
    }
}
