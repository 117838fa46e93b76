use character_collision::{BaseHandle, HitResult};
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::trace;

use crate::math::{is_nearly_zero, is_zero};
use crate::movement::StepDownResult;
use crate::{
    CharacterMovement, MovementContext, MovementMode, MovementPhysics, KINDA_SMALL_NUMBER,
    MAX_FLOOR_DIST, MIN_TICK_TIME,
};

pub struct WalkingPhysics;

impl MovementPhysics for WalkingPhysics {
    fn simulate(
        &mut self,
        movement: &mut CharacterMovement,
        ctx: &MovementContext<'_>,
        delta_time: Real,
        iterations: u32,
    ) {
        movement.phys_walking(ctx, delta_time, iterations);
    }
}

const DOWN: Vector<Real> = Vector::new(0.0, 0.0, -1.0);

impl CharacterMovement {
    pub fn phys_walking(&mut self, ctx: &MovementContext<'_>, delta_time: Real, mut iterations: u32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }

        self.just_teleported = false;
        let mut checked_fall = false;
        let mut tried_ledge_move = false;
        let mut remaining_time = delta_time;

        while remaining_time >= MIN_TICK_TIME
            && iterations < self.config.max_simulation_iterations
            && self.mode == MovementMode::Walking
        {
            iterations += 1;
            self.just_teleported = false;
            let time_tick = self.simulation_time_step(remaining_time, iterations);
            remaining_time -= time_tick;

            let old_base = self.base;
            let previous_base_location = old_base.and_then(|base| ctx.collision.base_location(base));
            let old_location = self.capsule.location();
            let old_floor = self.current_floor;

            self.maintain_horizontal_ground_velocity();
            self.acceleration.z = 0.0;
            let braking = self.max_braking_deceleration();
            self.calc_velocity(time_tick, self.config.ground_friction, false, braking);
            self.apply_vr_motion_to_velocity();

            let move_velocity = self.velocity;
            let delta = move_velocity * time_tick;
            let zero_delta = is_nearly_zero(&delta, KINDA_SMALL_NUMBER);
            let mut step_down = StepDownResult::default();

            if zero_delta {
                remaining_time = 0.0;
            } else {
                step_down = self.move_along_floor(ctx, move_velocity, time_tick);
            }

            self.current_floor = if step_down.computed_floor {
                step_down.floor
            } else {
                let location = self.capsule.location();
                self.find_floor(ctx, location, zero_delta, None)
            };

            let check_ledges = !self.can_walk_off_ledges();
            if check_ledges && !self.current_floor.is_walkable_floor() {
                let new_delta = if tried_ledge_move {
                    Vector::zeros()
                } else {
                    self.get_ledge_move(ctx, old_location, delta, DOWN)
                };
                if !is_zero(&new_delta) {
                    self.revert_move(ctx, old_location, old_base, previous_base_location, old_floor, false);
                    tried_ledge_move = true;
                    self.velocity = new_delta / time_tick;
                    remaining_time += time_tick;
                    self.restore_pre_additive_vr_motion_velocity();
                    continue;
                }

                let must_jump = zero_delta || self.base_lost_collision(ctx, old_base);
                self.restore_pre_additive_vr_motion_velocity();
                if (must_jump || !checked_fall)
                    && self.check_fall(ctx, delta, old_location, remaining_time, time_tick, iterations, must_jump)
                {
                    return;
                }
                // Not allowed off the ledge: stay where we were.
                self.revert_move(ctx, old_location, old_base, previous_base_location, old_floor, true);
                break;
            }

            if self.current_floor.is_walkable_floor() {
                self.adjust_floor_height(ctx);
                self.set_base_from_floor(ctx);
            } else if self.current_floor.hit.start_penetrating && remaining_time <= 0.0 {
                // The floor sweep started inside geometry: pop out rather than fall.
                let mut hit = self.current_floor.hit;
                hit.trace_end = hit.trace_start + Vector::new(0.0, 0.0, MAX_FLOOR_DIST);
                let adjustment = self.penetration_adjustment(&hit);
                self.resolve_penetration(ctx, adjustment, &hit);
                self.force_next_floor_check = true;
            }

            if self.is_in_water(ctx) {
                self.restore_pre_additive_vr_motion_velocity();
                let velocity = self.velocity;
                self.start_swimming(ctx, old_location, velocity, time_tick, remaining_time, iterations);
                return;
            }

            if !self.current_floor.is_walkable_floor() && !self.current_floor.hit.start_penetrating {
                let must_jump =
                    self.just_teleported || zero_delta || self.base_lost_collision(ctx, old_base);
                if must_jump || !checked_fall {
                    self.restore_pre_additive_vr_motion_velocity();
                    if self.check_fall(ctx, delta, old_location, remaining_time, time_tick, iterations, must_jump) {
                        return;
                    }
                    self.apply_vr_motion_to_velocity();
                }
                checked_fall = true;
            }

            if self.is_moving_on_ground() && !self.just_teleported && time_tick >= MIN_TICK_TIME {
                self.velocity = (self.capsule.location() - old_location) / time_tick;
            }
            self.restore_pre_additive_vr_motion_velocity();

            // Stuck: later iterations would not move either.
            if self.capsule.location() == old_location {
                break;
            }
        }

        if self.is_moving_on_ground() {
            self.maintain_horizontal_ground_velocity();
        }
    }

    /// True when the base we stood on no longer holds us up.
    fn base_lost_collision(&self, ctx: &MovementContext<'_>, old_base: Option<BaseHandle>) -> bool {
        let Some(base) = old_base else {
            return true;
        };
        match ctx.collision.base_info(base) {
            Some(info) => !info.query_enabled && info.dynamic,
            None => true,
        }
    }

    /// Moves along the current floor, following ramps and stepping up or
    /// sliding along anything in the way.
    pub fn move_along_floor(
        &mut self,
        ctx: &MovementContext<'_>,
        velocity: Vector<Real>,
        delta_seconds: Real,
    ) -> StepDownResult {
        let mut result = StepDownResult::default();
        if !self.current_floor.is_walkable_floor() {
            return result;
        }

        let delta = Vector::new(velocity.x, velocity.y, 0.0) * delta_seconds;
        let floor_hit = self.current_floor.hit;
        let mut ramp_vector =
            self.compute_ground_movement_delta(delta, &floor_hit, self.current_floor.line_trace);
        let mut hit = self.safe_move(ctx, ramp_vector);
        let mut last_move_time_slice = delta_seconds;

        if hit.start_penetrating {
            // Deflect off the overlap instead of hitching for the rest of the tick.
            self.handle_impact(&hit, 0.0, Vector::zeros());
            let normal = hit.normal;
            self.slide_along_surface(ctx, delta, 1.0, normal, &mut hit, true);
            if hit.start_penetrating {
                self.notify_stuck(&hit);
            }
        } else if hit.is_valid_blocking_hit() {
            let mut percent_time_applied = hit.time;
            let on_ramp_base = self.base.is_some() && self.base == hit.component;
            if hit.time > 0.0
                && hit.normal.z > KINDA_SMALL_NUMBER
                && self.is_walkable(&hit)
                && (self.can_step_up(ctx, &hit) || on_ramp_base)
            {
                // Another walkable ramp.
                let initial_percent_remaining = 1.0 - percent_time_applied;
                ramp_vector =
                    self.compute_ground_movement_delta(delta * initial_percent_remaining, &hit, false);
                last_move_time_slice *= initial_percent_remaining;
                hit = self.safe_move(ctx, ramp_vector);
                let second_hit_percent = hit.time * initial_percent_remaining;
                percent_time_applied = (percent_time_applied + second_hit_percent).clamp(0.0, 1.0);
            }

            if hit.is_valid_blocking_hit() {
                let on_hit_base = self.base.is_some() && self.base == hit.component;
                let stepped = if self.can_step_up(ctx, &hit) || on_hit_base {
                    self.step_up(ctx, DOWN, delta * (1.0 - percent_time_applied), &hit, true)
                } else {
                    None
                };
                match stepped {
                    Some(step_down) => {
                        result = step_down;
                        self.just_teleported |= !self.config.maintain_horizontal_ground_velocity;
                    }
                    None => {
                        trace!(impact_normal = ?hit.impact_normal, "blocked while walking");
                        self.handle_impact(&hit, last_move_time_slice, ramp_vector);
                        let normal = hit.normal;
                        self.slide_along_surface(ctx, delta, 1.0 - percent_time_applied, normal, &mut hit, true);
                    }
                }
            }
        }
        result
    }

    /// Sideways move that keeps us on walkable ground when we may not walk
    /// off the ledge ahead.
    pub fn get_ledge_move(
        &self,
        ctx: &MovementContext<'_>,
        old_location: Vector<Real>,
        delta: Vector<Real>,
        grav_dir: Vector<Real>,
    ) -> Vector<Real> {
        if is_zero(&delta) {
            return Vector::zeros();
        }
        let side_dir = Vector::new(delta.y, -delta.x, 0.0);
        if self.check_ledge_direction(ctx, old_location, side_dir, grav_dir) {
            return side_dir;
        }
        let side_dir = -side_dir;
        if self.check_ledge_direction(ctx, old_location, side_dir, grav_dir) {
            return side_dir;
        }
        Vector::zeros()
    }

    pub fn check_ledge_direction(
        &self,
        ctx: &MovementContext<'_>,
        old_location: Vector<Real>,
        side_step: Vector<Real>,
        grav_dir: Vector<Real>,
    ) -> bool {
        let shape = self.capsule.shape();
        let side_dest = old_location + side_step;
        let mut result: HitResult = ctx.collision.sweep(&shape, old_location, side_dest);
        if result.blocking_hit && !self.is_walkable(&result) {
            return false;
        }
        if !result.blocking_hit {
            let drop = self.config.max_step_height + self.config.ledge_check_threshold;
            result = ctx.collision.sweep(&shape, side_dest, side_dest + grav_dir * drop);
        }
        result.time < 1.0 && self.is_walkable(&result)
    }
}

#[cfg(test)]
mod tests {
    use character_collision::RapierCollision;
    use physics_rapier::PhysicsWorld;
    use rapier3d::prelude::*;

    use crate::{
        CharacterMovement, MovementConfig, MovementContext, MovementEvent, MovementMode, MAX_FLOOR_DIST,
        MIN_FLOOR_DIST,
    };

    const DT: Real = 1.0 / 60.0;

    /// Floor spanning `-half_x..half_x` along X with its top at z = 0.
    fn slab(half_x: Real) -> PhysicsWorld {
        let mut world = PhysicsWorld::z_up();
        world.insert_static_collider(
            ColliderBuilder::cuboid(half_x, 1000.0, 10.0)
                .translation(vector![0.0, 0.0, -10.0])
                .build(),
        );
        world.refresh_queries();
        world
    }

    fn walker(ctx: &MovementContext<'_>, config: MovementConfig, x: Real) -> CharacterMovement {
        let mut movement = CharacterMovement::new(config, vector![x, 0.0, 2.0], 0.0, 34.0, 88.0);
        movement.set_movement_mode(ctx, MovementMode::Walking);
        movement
    }

    fn push_forward(movement: &mut CharacterMovement, ctx: &MovementContext<'_>, ticks: u32) {
        for _ in 0..ticks {
            let acceleration = movement.scale_input_acceleration(Vector::x());
            movement.set_acceleration(acceleration);
            movement.perform_movement(ctx, DT);
        }
    }

    #[test]
    fn walking_reaches_max_speed_on_flat_ground() {
        let world = slab(5000.0);
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        let mut movement = walker(&ctx, MovementConfig::default(), 0.0);
        let start_z = movement.location().z;

        push_forward(&mut movement, &ctx, 120);

        assert_eq!(movement.mode(), MovementMode::Walking);
        assert!((movement.velocity().x - 600.0).abs() < 1.0);
        assert!(movement.velocity().z.abs() < 1.0e-3);
        assert!(movement.location().x > 500.0);
        assert!((movement.location().z - start_z).abs() < 1.0);
        assert!(movement.current_floor().is_walkable_floor());
    }

    #[test]
    fn walking_off_a_ledge_starts_falling() {
        let world = slab(200.0);
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        let mut movement = walker(&ctx, MovementConfig::default(), 150.0);

        push_forward(&mut movement, &ctx, 30);

        assert_eq!(movement.mode(), MovementMode::Falling);
        assert!(movement.location().x > 200.0);
        let events = movement.drain_events();
        assert!(events.contains(&MovementEvent::WalkedOffLedge));
        assert!(events.contains(&MovementEvent::ModeChanged {
            from: MovementMode::Walking,
            to: MovementMode::Falling,
        }));
    }

    #[test]
    fn ledges_hold_when_walking_off_is_disabled() {
        let world = slab(200.0);
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        let config = MovementConfig {
            can_walk_off_ledges: false,
            ..MovementConfig::default()
        };
        let mut movement = walker(&ctx, config, 150.0);

        push_forward(&mut movement, &ctx, 60);

        assert_eq!(movement.mode(), MovementMode::Walking);
        assert!(movement.location().x < 240.0);
        assert!(!movement.drain_events().contains(&MovementEvent::WalkedOffLedge));
    }

    fn assert_resting_height(movement: &CharacterMovement) {
        let floor = movement.current_floor();
        assert!(floor.is_walkable_floor());
        assert!(
            (MIN_FLOOR_DIST..=MAX_FLOOR_DIST).contains(&floor.floor_dist),
            "floor_dist {}",
            floor.floor_dist
        );
        let gap = movement.location().z - 88.0;
        assert!(gap > MIN_FLOOR_DIST - 0.05 && gap < MAX_FLOOR_DIST + 0.05, "gap {gap}");
    }

    #[test]
    fn resting_floor_distance_stays_in_band() {
        let mut world = slab(5000.0);
        world.insert_static_collider(
            ColliderBuilder::cuboid(10.0, 1000.0, 200.0)
                .translation(vector![200.0, 0.0, 200.0])
                .build(),
        );
        world.refresh_queries();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        let mut movement = walker(&ctx, MovementConfig::default(), 0.0);

        for _ in 0..30 {
            movement.perform_movement(&ctx, DT);
        }
        assert_resting_height(&movement);

        // Keep pressing into the wall long after reaching it.
        push_forward(&mut movement, &ctx, 120);
        assert!(movement.location().x < 190.0 - 34.0 + 0.1);
        assert!(movement.location().x > 190.0 - 34.0 - 1.0);
        assert_eq!(movement.mode(), MovementMode::Walking);
        assert_eq!(movement.stats().step_ups, 0);
        assert_resting_height(&movement);

        // And once released.
        movement.set_acceleration(Vector::zeros());
        for _ in 0..30 {
            movement.perform_movement(&ctx, DT);
        }
        assert_resting_height(&movement);
    }
}
