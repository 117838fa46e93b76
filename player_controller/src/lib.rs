//! VR character composition (input + tracked pose + movement component).
#![forbid(unsafe_code)]

use character_movement::math::horizontal;
use character_movement::{
    CharacterMovement, MoveAction, MovementConfig, MovementContext, MovementSnapshot,
};
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::trace;

/// Bits of the compressed flags byte sent with every move.
pub const FLAG_JUMP_PRESSED: u8 = 0x01;
pub const FLAG_WANTS_TO_CROUCH: u8 = 0x02;

const SNAP_TURN_DEADZONE: Real = 1.0e-3;

#[derive(Clone, Copy, Debug, Default)]
pub struct RawInput {
    pub move_x: Real,
    pub move_y: Real,
    pub jump: bool,
    pub crouch: bool,
    /// Degrees to snap-turn this frame, zero for none.
    pub snap_turn: Real,
    /// HMD position relative to the tracking origin.
    pub hmd_location: Vector<Real>,
    pub hmd_yaw: Real,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct InputIntent {
    pub move_axis: [Real; 2],
    pub jump: bool,
    pub crouch: bool,
    pub snap_turn: Option<Real>,
    pub tracked_location: Vector<Real>,
    pub tracked_yaw: Real,
}

pub trait InputAdapter {
    fn intent(&mut self, raw: RawInput) -> InputIntent;
}

#[derive(Default)]
pub struct DirectInputAdapter;

impl DirectInputAdapter {
    fn normalize_axis(axis: [Real; 2]) -> [Real; 2] {
        let len = (axis[0] * axis[0] + axis[1] * axis[1]).sqrt();
        if len > 1.0 {
            [axis[0] / len, axis[1] / len]
        } else {
            axis
        }
    }
}

impl InputAdapter for DirectInputAdapter {
    fn intent(&mut self, raw: RawInput) -> InputIntent {
        let move_axis = Self::normalize_axis([raw.move_x, raw.move_y]);
        let snap_turn = (raw.snap_turn.is_finite() && raw.snap_turn.abs() > SNAP_TURN_DEADZONE)
            .then_some(raw.snap_turn);
        InputIntent {
            move_axis,
            jump: raw.jump,
            crouch: raw.crouch,
            snap_turn,
            tracked_location: raw.hmd_location,
            tracked_yaw: raw.hmd_yaw,
        }
    }
}

/// Control rotation in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ControlRotation {
    pub yaw: Real,
    pub pitch: Real,
    pub roll: Real,
}

/// State a saved move rewinds to before it is replayed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CharacterSnapshot {
    pub movement: MovementSnapshot,
    pub control: ControlRotation,
    pub flags: u8,
}

/// A movement component driven by a tracked headset.
pub struct VrCharacter {
    movement: CharacterMovement,
    control: ControlRotation,
}

impl VrCharacter {
    pub fn new(
        config: MovementConfig,
        origin: Vector<Real>,
        yaw: Real,
        radius: Real,
        half_height: Real,
    ) -> Self {
        Self {
            movement: CharacterMovement::new(config, origin, yaw, radius, half_height),
            control: ControlRotation {
                yaw,
                ..ControlRotation::default()
            },
        }
    }

    pub fn movement(&self) -> &CharacterMovement {
        &self.movement
    }

    pub fn movement_mut(&mut self) -> &mut CharacterMovement {
        &mut self.movement
    }

    pub fn control_rotation(&self) -> ControlRotation {
        self.control
    }

    pub fn set_control_rotation(&mut self, control: ControlRotation) {
        self.control = control;
    }

    /// Turns input into this move's acceleration and flags. The tracked pose
    /// is applied immediately so the capsule follows the head.
    pub fn apply_input(&mut self, intent: &InputIntent) -> (Vector<Real>, u8) {
        self.movement
            .capsule_mut()
            .set_tracked_pose(intent.tracked_location, intent.tracked_yaw);
        if let Some(turn) = intent.snap_turn {
            let yaw = normalize_yaw(self.movement.capsule().actor_yaw() + turn);
            self.movement.queue_move_action(MoveAction::SnapTurn { yaw });
            self.control.yaw = normalize_yaw(self.control.yaw + turn);
            trace!(yaw, "snap turn queued");
        }

        let (sin, cos) = self.control.yaw.to_radians().sin_cos();
        let forward = Vector::new(cos, sin, 0.0);
        let right = Vector::new(-sin, cos, 0.0);
        let wish = forward * intent.move_axis[1] + right * intent.move_axis[0];
        let acceleration = self.movement.scale_input_acceleration(wish);

        let mut flags = 0;
        if intent.jump {
            flags |= FLAG_JUMP_PRESSED;
        }
        if intent.crouch {
            flags |= FLAG_WANTS_TO_CROUCH;
        }
        (acceleration, flags)
    }

    pub fn compressed_flags(&self) -> u8 {
        let mut flags = 0;
        if self.movement.jump_pressed() {
            flags |= FLAG_JUMP_PRESSED;
        }
        if self.movement.wants_to_crouch() {
            flags |= FLAG_WANTS_TO_CROUCH;
        }
        flags
    }

    pub fn update_from_compressed_flags(&mut self, flags: u8) {
        self.movement.set_jump_pressed(flags & FLAG_JUMP_PRESSED != 0);
        self.movement
            .set_wants_to_crouch(flags & FLAG_WANTS_TO_CROUCH != 0);
    }

    /// One move as both sides simulate it: flags, acceleration, then the
    /// movement tick.
    pub fn move_autonomous(
        &mut self,
        ctx: &MovementContext<'_>,
        delta_time: Real,
        flags: u8,
        acceleration: Vector<Real>,
    ) {
        self.update_from_compressed_flags(flags);
        self.movement.set_acceleration(acceleration);
        self.movement.perform_movement(ctx, delta_time);
    }

    /// Applies the head state a client reported for a move: tracked pose,
    /// the head motion to consume, and the capsule height when it is
    /// replicated (carried in `lf_diff.z`). The capsule moves by `lf_diff`
    /// alone, so both sides agree whatever tracked pose they saw before.
    pub fn apply_replicated_vr_state(
        &mut self,
        capsule_location: Vector<Real>,
        capsule_yaw: Real,
        lf_diff: Vector<Real>,
    ) {
        let replicate_height = self.movement.config().replicate_capsule_height;
        let capsule = self.movement.capsule_mut();
        capsule.apply_replicated_head_motion(capsule_location, capsule_yaw, lf_diff);
        if replicate_height && lf_diff.z > 0.0 && lf_diff.z != capsule.half_height() {
            capsule.set_capsule_half_height(lf_diff.z);
        }
    }

    /// `lf_diff` for the move just simulated.
    pub fn vr_offset_delta(&self, head_motion: Vector<Real>) -> Vector<Real> {
        let mut lf_diff = horizontal(head_motion);
        if self.movement.config().replicate_capsule_height {
            lf_diff.z = self.movement.capsule().half_height();
        }
        lf_diff
    }

    pub fn snapshot(&self) -> CharacterSnapshot {
        CharacterSnapshot {
            movement: self.movement.snapshot(),
            control: self.control,
            flags: self.compressed_flags(),
        }
    }

    pub fn restore(&mut self, snapshot: &CharacterSnapshot) {
        self.movement.restore(&snapshot.movement);
        self.control = snapshot.control;
        self.update_from_compressed_flags(snapshot.flags);
    }
}

fn normalize_yaw(yaw: Real) -> Real {
    yaw.rem_euclid(360.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use character_collision::RapierCollision;
    use character_movement::MovementMode;
    use physics_rapier::PhysicsWorld;
    use rapier3d::prelude::{vector, ColliderBuilder};

    fn build_scene(world: &mut PhysicsWorld) {
        world.insert_static_collider(
            ColliderBuilder::cuboid(2000.0, 2000.0, 10.0)
                .translation(vector![0.0, 0.0, -10.0])
                .build(),
        );
        // Three 15 cm steps, each running on to x = 2000.
        for i in 0..3 {
            let height = 15.0 * (i as Real + 1.0);
            let start = 160.0 + i as Real * 80.0;
            world.insert_static_collider(
                ColliderBuilder::cuboid((2000.0 - start) * 0.5, 200.0, height * 0.5)
                    .translation(vector![(2000.0 + start) * 0.5, 0.0, height * 0.5])
                    .build(),
            );
        }
        world.refresh_queries();
    }

    fn standing_character(ctx: &MovementContext<'_>) -> VrCharacter {
        let mut character = VrCharacter::new(
            MovementConfig::default(),
            vector![0.0, 0.0, 2.0],
            0.0,
            34.0,
            88.0,
        );
        character
            .movement_mut()
            .set_movement_mode(ctx, MovementMode::Walking);
        character
    }

    #[test]
    fn direct_adapter_normalizes_axes() {
        let mut adapter = DirectInputAdapter;
        let intent = adapter.intent(RawInput {
            move_x: 1.0,
            move_y: 1.0,
            snap_turn: 0.0,
            ..Default::default()
        });
        let len = (intent.move_axis[0].powi(2) + intent.move_axis[1].powi(2)).sqrt();
        assert!((len - 1.0).abs() < 1.0e-5);
        assert!(intent.snap_turn.is_none());
    }

    #[test]
    fn flags_round_trip_through_movement() {
        let mut character = VrCharacter::new(MovementConfig::default(), Vector::zeros(), 0.0, 34.0, 88.0);
        character.update_from_compressed_flags(FLAG_WANTS_TO_CROUCH);
        assert!(character.movement().wants_to_crouch());
        assert!(!character.movement().jump_pressed());
        assert_eq!(character.compressed_flags(), FLAG_WANTS_TO_CROUCH);
    }

    #[test]
    fn character_walks_up_steps() {
        let mut world = PhysicsWorld::z_up();
        build_scene(&mut world);
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let mut character = standing_character(&ctx);
        let mut adapter = DirectInputAdapter;
        for _ in 0..180 {
            let intent = adapter.intent(RawInput {
                move_y: 1.0,
                ..Default::default()
            });
            let (accel, flags) = character.apply_input(&intent);
            character.move_autonomous(&ctx, 1.0 / 60.0, flags, accel);
        }

        let movement = character.movement();
        assert_eq!(movement.mode(), MovementMode::Walking);
        assert!(movement.location().x > 400.0);
        assert!(movement.feet_location().z > 40.0);
    }

    #[test]
    fn head_motion_is_consumed_as_movement() {
        let mut world = PhysicsWorld::z_up();
        build_scene(&mut world);
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let mut character = standing_character(&ctx);
        let intent = InputIntent {
            tracked_location: vector![0.0, 25.0, 160.0],
            ..Default::default()
        };
        let (accel, flags) = character.apply_input(&intent);
        character.move_autonomous(&ctx, 1.0 / 60.0, flags, accel);

        let movement = character.movement();
        assert!((movement.location().y - 25.0).abs() < 0.5);
        assert!(movement.capsule().origin().y.abs() < 0.5);
        assert_eq!(movement.capsule().difference_from_last_frame(), Vector::zeros());
    }

    #[test]
    fn snapshot_restores_state() {
        let mut world = PhysicsWorld::z_up();
        build_scene(&mut world);
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let mut character = standing_character(&ctx);
        let before = character.snapshot();
        let accel = character.movement().scale_input_acceleration(vector![1.0, 0.0, 0.0]);
        for _ in 0..10 {
            character.move_autonomous(&ctx, 1.0 / 60.0, FLAG_JUMP_PRESSED, accel);
        }
        assert_ne!(character.movement().location(), before.movement.capsule.location());

        character.restore(&before);
        assert_eq!(character.snapshot(), before);
    }

    #[test]
    fn client_and_server_agree_on_replicated_head_motion() {
        let mut world = PhysicsWorld::z_up();
        build_scene(&mut world);
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let mut client = standing_character(&ctx);
        let mut server = standing_character(&ctx);
        // The server last saw a different head pose than the client.
        server
            .movement_mut()
            .capsule_mut()
            .reset_tracking(vector![30.0, -10.0, 160.0], 0.0);

        let mut adapter = DirectInputAdapter;
        let poses = [
            vector![0.0, 0.0, 160.0],
            vector![6.0, 2.0, 160.0],
            vector![14.0, -3.0, 160.0],
            vector![20.0, 5.0, 158.0],
        ];
        for hmd_location in poses {
            let intent = adapter.intent(RawInput {
                move_y: 0.5,
                hmd_location,
                ..Default::default()
            });
            let (accel, flags) = client.apply_input(&intent);
            let capsule = client.movement().capsule();
            let (tracked, yaw) = (capsule.tracked_location(), capsule.tracked_yaw());
            let lf_diff = client.vr_offset_delta(capsule.difference_from_last_frame());

            client.apply_replicated_vr_state(tracked, yaw, lf_diff);
            client.move_autonomous(&ctx, 1.0 / 60.0, flags, accel);
            server.apply_replicated_vr_state(tracked, yaw, lf_diff);
            server.move_autonomous(&ctx, 1.0 / 60.0, flags, accel);

            let (client_location, server_location) =
                (client.movement().location(), server.movement().location());
            assert!(
                (client_location - server_location).norm() < 1.0e-3,
                "{client_location:?} != {server_location:?}"
            );
        }
        assert!(client.movement().location().x > 10.0);
    }
}
