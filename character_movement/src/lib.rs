//! Character movement integrator for a VR avatar.
//!
//! [`CharacterMovement`] advances one capsule through a movement tick: head
//! motion is rewound, the active mode's physics runs over the tick in
//! sub-steps, and the capsule offset is regenerated afterwards. World access
//! goes through the traits in `character_collision`.
#![forbid(unsafe_code)]

use rapier3d::prelude::Real;

mod based;
pub mod config;
mod crouch;
pub mod events;
mod falling;
pub mod floor;
mod flying;
pub mod math;
pub mod mode;
pub mod movement;
mod nav_walking;
mod step_up;
pub mod sweep;
mod swimming;
pub mod velocity;
pub mod vr_capsule;
mod walking;

pub use config::{ConfigError, MovementConfig};
pub use events::{MovementEvent, MovementStats};
pub use falling::FallingPhysics;
pub use floor::{FloorResult, AVG_FLOOR_DIST};
pub use flying::FlyingPhysics;
pub use mode::{MovementMode, MAX_CUSTOM_SUB_MODE};
pub use movement::{
    CharacterMovement, MoveAction, MovementContext, MovementPhysics, MovementSnapshot, StepDownResult,
};
pub use nav_walking::NavWalkingPhysics;
pub use swimming::SwimmingPhysics;
pub use vr_capsule::VrRootCapsule;
pub use walking::WalkingPhysics;

pub const KINDA_SMALL_NUMBER: Real = 1.0e-4;
/// Floor distance band the walking mode keeps the capsule in.
pub const MIN_FLOOR_DIST: Real = 1.9;
pub const MAX_FLOOR_DIST: Real = 2.4;
pub const MIN_TICK_TIME: Real = 1.0e-6;
/// Sweep hits this close to the capsule rim are retried with a narrower
/// capsule.
pub const SWEEP_EDGE_REJECT_DISTANCE: Real = 0.15;
pub const VERTICAL_SLOPE_NORMAL_Z: Real = 0.001;
/// Hits with `normal.z` below this count as the side of a step.
pub const MAX_STEP_SIDE_Z: Real = 0.08;
