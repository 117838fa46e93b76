use character_collision::{BaseHandle, CollisionQuery, HitResult, NavLocation, NavigationQuery};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::{debug, trace};

use crate::floor::FloorResult;
use crate::math::{clamp_max_size, horizontal, size_2d};
use crate::{
    FallingPhysics, FlyingPhysics, MovementConfig, MovementEvent, MovementMode, MovementStats,
    NavWalkingPhysics, SwimmingPhysics, VrRootCapsule, WalkingPhysics, KINDA_SMALL_NUMBER,
    MIN_TICK_TIME,
};

/// External services for one tick.
#[derive(Clone, Copy)]
pub struct MovementContext<'a> {
    pub collision: &'a dyn CollisionQuery,
    pub navigation: Option<&'a dyn NavigationQuery>,
}

impl<'a> MovementContext<'a> {
    pub fn new(collision: &'a dyn CollisionQuery) -> Self {
        Self {
            collision,
            navigation: None,
        }
    }

    pub fn with_navigation(mut self, navigation: &'a dyn NavigationQuery) -> Self {
        self.navigation = Some(navigation);
        self
    }
}

/// One locomotion mode. Built-in modes are unit structs; custom modes are
/// installed with [`CharacterMovement::set_custom_physics`].
pub trait MovementPhysics {
    fn simulate(
        &mut self,
        movement: &mut CharacterMovement,
        ctx: &MovementContext<'_>,
        delta_time: Real,
        iterations: u32,
    );
}

/// Discrete VR actions applied at the start of a move.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MoveAction {
    /// Turn in place around the headset.
    SnapTurn { yaw: Real },
    /// Place the actor origin, keeping the head offset.
    Teleport { location: Vector<Real>, yaw: Real },
    StopAllMovement,
    /// Turn around the actor origin.
    SetRotation { yaw: Real },
}

/// State restored when a saved move is replayed or combined.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MovementSnapshot {
    pub capsule: VrRootCapsule,
    pub velocity: Vector<Real>,
    pub mode: MovementMode,
    pub ground_mode: MovementMode,
    pub floor: FloorResult,
    pub base: Option<BaseHandle>,
    pub old_base_location: Option<Vector<Real>>,
    pub crouched: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepDownResult {
    pub computed_floor: bool,
    pub floor: FloorResult,
}

pub struct CharacterMovement {
    pub(crate) config: MovementConfig,
    pub(crate) capsule: VrRootCapsule,
    pub(crate) velocity: Vector<Real>,
    pub(crate) acceleration: Vector<Real>,
    pub(crate) analog_input_modifier: Real,
    pub(crate) requested_velocity: Option<Vector<Real>>,
    pub(crate) mode: MovementMode,
    pub(crate) ground_mode: MovementMode,
    pub(crate) current_floor: FloorResult,
    pub(crate) base: Option<BaseHandle>,
    pub(crate) old_base_location: Option<Vector<Real>>,
    pub(crate) just_teleported: bool,
    pub(crate) force_next_floor_check: bool,
    pub(crate) crouch_maintains_base_location: bool,
    pub(crate) crouched: bool,
    pub(crate) wants_to_crouch: bool,
    pub(crate) jump_pressed: bool,
    pub(crate) uncrouched_half_height: Real,
    pub(crate) pending_action: Option<MoveAction>,
    /// Head motion for the tick being simulated.
    pub(crate) additional_vr_input: Vector<Real>,
    pub(crate) vr_input_velocity: Vector<Real>,
    pub(crate) cached_nav_location: Option<NavLocation>,
    pub(crate) rng: ChaCha8Rng,
    pub(crate) events: Vec<MovementEvent>,
    pub(crate) stats: MovementStats,
    last_update_location: Vector<Real>,
    custom_physics: Option<Box<dyn MovementPhysics + Send>>,
}

impl CharacterMovement {
    /// Character standing at `origin` (feet) in `Falling`; switch to a ground
    /// mode once the world is available.
    pub fn new(
        config: MovementConfig,
        origin: Vector<Real>,
        yaw: Real,
        radius: Real,
        half_height: Real,
    ) -> Self {
        let capsule = VrRootCapsule::new(origin, yaw, radius, half_height);
        Self {
            rng: ChaCha8Rng::seed_from_u64(config.ditch_seed),
            ground_mode: config.default_land_mode,
            config,
            capsule,
            velocity: Vector::zeros(),
            acceleration: Vector::zeros(),
            analog_input_modifier: 0.0,
            requested_velocity: None,
            mode: MovementMode::Falling,
            current_floor: FloorResult::default(),
            base: None,
            old_base_location: None,
            just_teleported: false,
            force_next_floor_check: true,
            crouch_maintains_base_location: false,
            crouched: false,
            wants_to_crouch: false,
            jump_pressed: false,
            uncrouched_half_height: capsule.half_height(),
            pending_action: None,
            additional_vr_input: Vector::zeros(),
            vr_input_velocity: Vector::zeros(),
            cached_nav_location: None,
            events: Vec::new(),
            stats: MovementStats::default(),
            last_update_location: capsule.location(),
            custom_physics: None,
        }
    }

    pub fn config(&self) -> &MovementConfig {
        &self.config
    }

    pub fn capsule(&self) -> &VrRootCapsule {
        &self.capsule
    }

    pub fn capsule_mut(&mut self) -> &mut VrRootCapsule {
        &mut self.capsule
    }

    pub fn location(&self) -> Vector<Real> {
        self.capsule.location()
    }

    pub fn velocity(&self) -> Vector<Real> {
        self.velocity
    }

    pub fn set_velocity(&mut self, velocity: Vector<Real>) {
        self.velocity = velocity;
    }

    pub fn acceleration(&self) -> Vector<Real> {
        self.acceleration
    }

    pub fn mode(&self) -> MovementMode {
        self.mode
    }

    pub fn ground_mode(&self) -> MovementMode {
        self.ground_mode
    }

    pub fn current_floor(&self) -> &FloorResult {
        &self.current_floor
    }

    pub fn base(&self) -> Option<BaseHandle> {
        self.base
    }

    pub fn is_crouched(&self) -> bool {
        self.crouched
    }

    pub fn crouch_maintains_base_location(&self) -> bool {
        self.crouch_maintains_base_location
    }

    pub fn is_moving_on_ground(&self) -> bool {
        self.mode.is_moving_on_ground()
    }

    pub fn stats(&self) -> MovementStats {
        self.stats
    }

    pub fn additional_vr_input(&self) -> Vector<Real> {
        self.additional_vr_input
    }

    pub fn drain_events(&mut self) -> Vec<MovementEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn set_custom_physics(&mut self, physics: Box<dyn MovementPhysics + Send>) {
        self.custom_physics = Some(physics);
    }

    /// Player input in -1..=1 per axis, scaled to an acceleration.
    pub fn scale_input_acceleration(&self, input: Vector<Real>) -> Vector<Real> {
        clamp_max_size(input, 1.0) * self.config.max_acceleration
    }

    /// Sets the acceleration for the next move; also used with replicated
    /// accelerations on the server.
    pub fn set_acceleration(&mut self, acceleration: Vector<Real>) {
        let max_accel = self.config.max_acceleration;
        let mut acceleration = clamp_max_size(acceleration, max_accel);
        if !matches!(self.mode, MovementMode::Flying | MovementMode::Swimming) {
            acceleration.z = 0.0;
        }
        self.acceleration = acceleration;
        self.analog_input_modifier = if max_accel > 0.0 {
            (acceleration.norm() / max_accel).clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    pub fn set_requested_velocity(&mut self, velocity: Option<Vector<Real>>) {
        self.requested_velocity = velocity;
    }

    pub fn requested_velocity(&self) -> Option<Vector<Real>> {
        self.requested_velocity
    }

    pub fn set_wants_to_crouch(&mut self, wants_to_crouch: bool) {
        self.wants_to_crouch = wants_to_crouch;
    }

    pub fn wants_to_crouch(&self) -> bool {
        self.wants_to_crouch
    }

    pub fn set_jump_pressed(&mut self, pressed: bool) {
        self.jump_pressed = pressed;
    }

    pub fn jump_pressed(&self) -> bool {
        self.jump_pressed
    }

    pub fn queue_move_action(&mut self, action: MoveAction) {
        self.pending_action = Some(action);
    }

    pub fn pending_move_action(&self) -> Option<MoveAction> {
        self.pending_action
    }

    pub fn snapshot(&self) -> MovementSnapshot {
        MovementSnapshot {
            capsule: self.capsule,
            velocity: self.velocity,
            mode: self.mode,
            ground_mode: self.ground_mode,
            floor: self.current_floor,
            base: self.base,
            old_base_location: self.old_base_location,
            crouched: self.crouched,
        }
    }

    pub fn restore(&mut self, snapshot: &MovementSnapshot) {
        self.capsule = snapshot.capsule;
        self.velocity = snapshot.velocity;
        self.mode = snapshot.mode;
        self.ground_mode = snapshot.ground_mode;
        self.current_floor = snapshot.floor;
        self.base = snapshot.base;
        self.old_base_location = snapshot.old_base_location;
        self.crouched = snapshot.crouched;
        self.crouch_maintains_base_location = snapshot.mode == MovementMode::Walking;
        self.last_update_location =
            snapshot.capsule.location() - horizontal(snapshot.capsule.difference_from_last_frame());
        self.cached_nav_location = None;
    }

    /// Applies an authoritative correction. The floor is recomputed on the
    /// next tick.
    pub fn apply_correction(
        &mut self,
        ctx: &MovementContext<'_>,
        location: Vector<Real>,
        velocity: Vector<Real>,
        mode: MovementMode,
        base: Option<BaseHandle>,
    ) {
        self.capsule.set_location(location);
        self.velocity = velocity;
        self.set_movement_mode(ctx, mode);
        if let Some(base) = base {
            self.set_base(ctx, Some(base));
        }
        self.force_next_floor_check = true;
        self.last_update_location = location;
        debug!(?location, ?mode, "applied movement correction");
    }

    pub fn set_movement_mode(&mut self, ctx: &MovementContext<'_>, new_mode: MovementMode) {
        if new_mode == self.mode {
            return;
        }
        let previous = self.mode;
        self.mode = new_mode;
        match new_mode {
            MovementMode::Walking => {
                self.velocity.z = 0.0;
                self.crouch_maintains_base_location = true;
                self.ground_mode = new_mode;
                let location = self.capsule.location();
                self.current_floor = self.find_floor(ctx, location, false, None);
                self.adjust_floor_height(ctx);
                self.set_base_from_floor(ctx);
            }
            MovementMode::NavWalking => {
                self.velocity.z = 0.0;
                self.crouch_maintains_base_location = true;
                self.ground_mode = new_mode;
                self.current_floor.clear();
                self.cached_nav_location = None;
                self.set_base(ctx, None);
            }
            _ => {
                self.current_floor.clear();
                self.crouch_maintains_base_location = false;
                if new_mode == MovementMode::Falling {
                    self.velocity += self.imparted_movement_base_velocity(ctx);
                }
                self.set_base(ctx, None);
                if new_mode == MovementMode::None {
                    self.velocity = Vector::zeros();
                    self.acceleration = Vector::zeros();
                }
            }
        }
        debug!(from = ?previous, to = ?new_mode, "movement mode changed");
        self.events.push(MovementEvent::ModeChanged {
            from: previous,
            to: new_mode,
        });
    }

    /// Runs the current mode's physics over `delta_time`. Mode changes during
    /// a step call back in here with the unused time.
    pub fn start_new_physics(&mut self, ctx: &MovementContext<'_>, delta_time: Real, iterations: u32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }
        if iterations >= self.config.max_simulation_iterations {
            self.stats.truncated_ticks += 1;
            trace!(remaining = delta_time, "iteration cap reached, dropping remaining time");
            return;
        }
        match self.mode {
            MovementMode::None => {}
            MovementMode::Walking => WalkingPhysics.simulate(self, ctx, delta_time, iterations),
            MovementMode::NavWalking => NavWalkingPhysics.simulate(self, ctx, delta_time, iterations),
            MovementMode::Falling => FallingPhysics.simulate(self, ctx, delta_time, iterations),
            MovementMode::Swimming => SwimmingPhysics.simulate(self, ctx, delta_time, iterations),
            MovementMode::Flying => FlyingPhysics.simulate(self, ctx, delta_time, iterations),
            MovementMode::Custom(_) => {
                if let Some(mut physics) = self.custom_physics.take() {
                    physics.simulate(self, ctx, delta_time, iterations);
                    if self.custom_physics.is_none() {
                        self.custom_physics = Some(physics);
                    }
                }
            }
        }
    }

    /// Step size for the next iteration of a mode loop.
    pub fn simulation_time_step(&self, remaining: Real, iterations: u32) -> Real {
        let mut remaining = remaining;
        if remaining > self.config.max_simulation_time_step
            && iterations < self.config.max_simulation_iterations
        {
            remaining = self.config.max_simulation_time_step.min(remaining * 0.5);
        }
        remaining.max(MIN_TICK_TIME)
    }

    /// One full movement tick.
    pub fn perform_movement(&mut self, ctx: &MovementContext<'_>, delta_time: Real) {
        self.stats.ticks += 1;
        if let Some(action) = self.pending_action.take() {
            self.apply_move_action(action);
        }

        if self.mode == MovementMode::None {
            self.capsule.regenerate_offset_transform();
            self.requested_velocity = None;
            return;
        }

        let resting_location = self.capsule.location() - horizontal(self.capsule.difference_from_last_frame());
        self.force_next_floor_check |=
            self.is_moving_on_ground() && resting_location != self.last_update_location;

        self.update_based_movement(ctx);
        self.update_character_state_before_movement(ctx);
        if self.jump_pressed {
            self.do_jump(ctx);
        }

        let vr_input = self.capsule.rewind() + self.capsule.take_custom_vr_input();
        self.additional_vr_input = vr_input;
        self.vr_input_velocity = if delta_time > 0.0 {
            vr_input / delta_time
        } else {
            Vector::zeros()
        };

        self.start_new_physics(ctx, delta_time, 0);

        self.vr_input_velocity = Vector::zeros();
        self.capsule.regenerate_offset_transform();
        self.requested_velocity = None;
        self.save_base_location(ctx);
        self.last_update_location = self.capsule.location();
    }

    fn apply_move_action(&mut self, action: MoveAction) {
        trace!(?action, "move action");
        match action {
            MoveAction::SnapTurn { yaw } => self.capsule.turn_about_capsule(yaw),
            MoveAction::SetRotation { yaw } => self.capsule.set_actor_yaw(yaw),
            MoveAction::Teleport { location, yaw } => {
                self.capsule.turn_about_capsule(yaw);
                self.capsule.set_origin(location);
                self.just_teleported = true;
                self.force_next_floor_check = true;
            }
            MoveAction::StopAllMovement => {
                self.velocity = Vector::zeros();
                self.acceleration = Vector::zeros();
            }
        }
    }

    fn update_character_state_before_movement(&mut self, ctx: &MovementContext<'_>) {
        if self.wants_to_crouch && !self.crouched && self.can_crouch_in_current_state() {
            self.crouch(ctx);
        } else if !self.wants_to_crouch && self.crouched {
            self.uncrouch(ctx);
        }
    }

    pub fn can_jump(&self) -> bool {
        self.is_moving_on_ground()
            && (!self.crouched || self.config.can_jump_while_crouched)
            && self.config.jump_z_velocity > 0.0
    }

    pub fn do_jump(&mut self, ctx: &MovementContext<'_>) -> bool {
        if !self.can_jump() {
            return false;
        }
        self.velocity.z = self.velocity.z.max(self.config.jump_z_velocity);
        self.set_movement_mode(ctx, MovementMode::Falling);
        self.events.push(MovementEvent::Jumped);
        true
    }

    pub fn can_walk_off_ledges(&self) -> bool {
        if !self.config.can_walk_off_ledges_when_crouching && self.crouched {
            return false;
        }
        self.config.can_walk_off_ledges
    }

    /// Whether `hit` is something we may step onto.
    pub fn can_step_up(&self, ctx: &MovementContext<'_>, hit: &HitResult) -> bool {
        if !hit.is_valid_blocking_hit() || self.mode == MovementMode::Falling {
            return false;
        }
        match hit.component.and_then(|component| ctx.collision.base_info(component)) {
            Some(info) => info.can_step_up,
            None => true,
        }
    }

    /// Lands on `hit`, picks the ground mode and continues with the time left.
    pub fn process_landed(
        &mut self,
        ctx: &MovementContext<'_>,
        hit: &HitResult,
        remaining_time: Real,
        iterations: u32,
    ) {
        self.events.push(MovementEvent::Landed { hit: *hit });
        self.stats.landings += 1;
        debug!(location = ?self.capsule.location(), "landed");

        if self.mode == MovementMode::Falling {
            if self.ground_mode == MovementMode::NavWalking {
                let feet = self.feet_location();
                let has_nav = ctx
                    .navigation
                    .and_then(|navigation| navigation.find_nav_floor(feet))
                    .is_some_and(|nav| nav.node.is_some());
                if !has_nav {
                    self.ground_mode = MovementMode::Walking;
                }
            }
            self.set_post_landed_physics(ctx);
        }
        self.start_new_physics(ctx, remaining_time, iterations);
    }

    fn set_post_landed_physics(&mut self, ctx: &MovementContext<'_>) {
        if self.is_in_water(ctx) {
            self.set_movement_mode(ctx, MovementMode::Swimming);
        } else {
            let ground_mode = self.ground_mode;
            self.set_movement_mode(ctx, ground_mode);
        }
    }

    pub fn feet_location(&self) -> Vector<Real> {
        self.capsule.location() - Vector::new(0.0, 0.0, self.capsule.half_height())
    }

    /// Starts falling off a ledge when allowed (or forced).
    #[allow(clippy::too_many_arguments)]
    pub fn check_fall(
        &mut self,
        ctx: &MovementContext<'_>,
        delta: Vector<Real>,
        sub_location: Vector<Real>,
        remaining_time: Real,
        time_tick: Real,
        iterations: u32,
        must_jump: bool,
    ) -> bool {
        if must_jump || self.can_walk_off_ledges() {
            self.events.push(MovementEvent::WalkedOffLedge);
            if self.is_moving_on_ground() {
                self.start_falling(ctx, iterations, remaining_time, time_tick, delta, sub_location);
            }
            return true;
        }
        false
    }

    /// Switches to falling, handing back the part of the sub-step that was not
    /// travelled.
    pub fn start_falling(
        &mut self,
        ctx: &MovementContext<'_>,
        iterations: u32,
        remaining_time: Real,
        time_tick: Real,
        delta: Vector<Real>,
        sub_location: Vector<Real>,
    ) {
        let desired_dist = delta.norm();
        let actual_dist = size_2d(&(self.capsule.location() - sub_location));
        let remaining_time = if desired_dist < KINDA_SMALL_NUMBER {
            0.0
        } else {
            remaining_time + time_tick * (1.0 - (actual_dist / desired_dist).min(1.0))
        };
        if self.is_moving_on_ground() {
            self.set_movement_mode(ctx, MovementMode::Falling);
        }
        self.start_new_physics(ctx, remaining_time, iterations);
    }

    /// Puts the capsule back where a rejected walking iteration started.
    pub fn revert_move(
        &mut self,
        ctx: &MovementContext<'_>,
        old_location: Vector<Real>,
        old_base: Option<BaseHandle>,
        previous_base_location: Option<Vector<Real>>,
        old_floor: FloorResult,
        fail_move: bool,
    ) {
        self.capsule.set_location(old_location);
        self.just_teleported = false;
        let restorable = old_base.and_then(|base| {
            let info = ctx.collision.base_info(base)?;
            let unmoved = ctx.collision.base_location(base) == previous_base_location;
            (!info.dynamic || unmoved).then_some(base)
        });
        match restorable {
            Some(base) => {
                self.current_floor = old_floor;
                self.set_base(ctx, Some(base));
            }
            None => self.set_base(ctx, None),
        }
        if fail_move {
            self.velocity = Vector::zeros();
            self.acceleration = Vector::zeros();
        }
    }
}

#[cfg(test)]
mod tests {
    use character_collision::RapierCollision;
    use physics_rapier::PhysicsWorld;
    use rapier3d::prelude::*;

    use super::*;

    const DT: Real = 1.0 / 60.0;

    /// Floor with a wall whose face is at x = 50.
    fn floor_and_wall() -> PhysicsWorld {
        let mut world = PhysicsWorld::z_up();
        world.insert_static_collider(
            ColliderBuilder::cuboid(1000.0, 1000.0, 10.0)
                .translation(vector![0.0, 0.0, -10.0])
                .build(),
        );
        world.insert_static_collider(
            ColliderBuilder::cuboid(10.0, 1000.0, 200.0)
                .translation(vector![60.0, 0.0, 200.0])
                .build(),
        );
        world.refresh_queries();
        world
    }

    fn walker(ctx: &MovementContext<'_>) -> CharacterMovement {
        let mut movement =
            CharacterMovement::new(MovementConfig::default(), vector![0.0, 0.0, 2.0], 0.0, 34.0, 88.0);
        movement.set_movement_mode(ctx, MovementMode::Walking);
        movement
    }

    #[test]
    fn head_motion_is_swept_and_stops_at_walls() {
        let world = floor_and_wall();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        let mut movement = walker(&ctx);

        movement.capsule_mut().set_tracked_pose(vector![10.0, 0.0, 160.0], 0.0);
        movement.perform_movement(&ctx, DT);
        assert!((movement.location().x - 10.0).abs() < 0.1);
        assert_eq!(movement.additional_vr_input(), vector![10.0, 0.0, 0.0]);
        assert_eq!(movement.capsule().difference_from_last_frame(), Vector::zeros());
        assert!(movement.velocity().norm() < 0.01);

        // Another 30 cm would put the capsule through the wall.
        movement.capsule_mut().set_tracked_pose(vector![40.0, 0.0, 160.0], 0.0);
        movement.perform_movement(&ctx, DT);
        assert!(movement.location().x <= 16.5);
        assert!(movement.location().x > 10.0);
        assert_eq!(movement.mode(), MovementMode::Walking);
    }

    #[test]
    fn snap_turn_keeps_the_capsule_in_place() {
        let world = floor_and_wall();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        let mut movement = walker(&ctx);
        movement.capsule_mut().set_tracked_pose(vector![5.0, 0.0, 160.0], 0.0);
        movement.perform_movement(&ctx, DT);
        let before = movement.location();

        movement.queue_move_action(MoveAction::SnapTurn { yaw: 90.0 });
        movement.perform_movement(&ctx, DT);
        assert_eq!(movement.capsule().actor_yaw(), 90.0);
        assert!((movement.location() - before).norm() < 1.0e-3);
        assert_eq!(movement.pending_move_action(), None);
    }

    #[test]
    fn long_ticks_are_split_and_capped() {
        let world = floor_and_wall();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        let mut movement = walker(&ctx);

        assert_eq!(movement.simulation_time_step(0.1, 1), 0.05);
        assert_eq!(movement.simulation_time_step(0.03, 1), 0.03);
        assert_eq!(movement.simulation_time_step(0.1, 8), 0.1);
        assert_eq!(movement.simulation_time_step(0.0, 1), MIN_TICK_TIME);

        movement.start_new_physics(&ctx, 0.1, 8);
        assert_eq!(movement.stats().truncated_ticks, 1);
    }

    #[test]
    fn restore_rewinds_a_move() {
        let world = floor_and_wall();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        let mut movement = walker(&ctx);
        let snapshot = movement.snapshot();

        movement.set_acceleration(vector![0.0, 2048.0, 0.0]);
        movement.perform_movement(&ctx, DT);
        assert_ne!(movement.snapshot(), snapshot);

        movement.restore(&snapshot);
        assert_eq!(movement.snapshot(), snapshot);
    }
}
