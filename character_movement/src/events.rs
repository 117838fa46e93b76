use character_collision::HitResult;
use rapier3d::math::Vector;
use rapier3d::prelude::Real;

use crate::MovementMode;

/// Notifications for the game layer, drained after each tick.
#[derive(Clone, Debug, PartialEq)]
pub enum MovementEvent {
    Landed {
        hit: HitResult,
    },
    Impact {
        hit: HitResult,
        time_slice: Real,
        move_delta: Vector<Real>,
    },
    /// Still penetrating after depenetration was attempted.
    StuckInGeometry {
        hit: HitResult,
    },
    ModeChanged {
        from: MovementMode,
        to: MovementMode,
    },
    WalkedOffLedge,
    Jumped,
    Crouched,
    Uncrouched,
    /// Random push out of a two-slope wedge.
    DitchNudge {
        velocity: Vector<Real>,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MovementStats {
    pub ticks: u64,
    /// Ticks whose remaining time was dropped at the iteration cap.
    pub truncated_ticks: u64,
    pub stuck_events: u64,
    pub penetration_resolves: u64,
    pub step_ups: u64,
    pub landings: u64,
}
