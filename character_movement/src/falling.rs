use character_collision::HitResult;
use rand::Rng;
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::trace;

use crate::floor::AVG_FLOOR_DIST;
use crate::math::{is_nearly_zero, nearly_equal, safe_normal, safe_normal_2d, size_squared_2d};
use crate::{
    CharacterMovement, MovementContext, MovementEvent, MovementPhysics, KINDA_SMALL_NUMBER,
    MAX_FLOOR_DIST, MIN_TICK_TIME, VERTICAL_SLOPE_NORMAL_Z,
};

pub struct FallingPhysics;

impl MovementPhysics for FallingPhysics {
    fn simulate(
        &mut self,
        movement: &mut CharacterMovement,
        ctx: &MovementContext<'_>,
        delta_time: Real,
        iterations: u32,
    ) {
        movement.phys_falling(ctx, delta_time, iterations);
    }
}

impl CharacterMovement {
    pub fn phys_falling(&mut self, ctx: &MovementContext<'_>, delta_time: Real, mut iterations: u32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }

        let mut fall_acceleration = self.falling_lateral_acceleration();
        fall_acceleration.z = 0.0;
        let has_air_control = size_squared_2d(&fall_acceleration) > 0.0;
        let lateral_friction = self.config.falling_lateral_friction;
        let braking = self.config.braking_deceleration_falling;

        let mut remaining_time = delta_time;
        while remaining_time >= MIN_TICK_TIME && iterations < self.config.max_simulation_iterations {
            iterations += 1;
            let time_tick = self.simulation_time_step(remaining_time, iterations);
            remaining_time -= time_tick;

            let old_location = self.capsule.location();
            self.just_teleported = false;

            let old_velocity = self.velocity;
            let mut velocity_no_air_control = self.velocity;
            let saved_acceleration = self.acceleration;

            if has_air_control {
                // Velocity without any lateral input.
                self.acceleration = Vector::zeros();
                self.velocity.z = 0.0;
                self.calc_velocity(time_tick, lateral_friction, false, braking);
                velocity_no_air_control = Vector::new(self.velocity.x, self.velocity.y, old_velocity.z);
                self.velocity = old_velocity;
            }

            self.acceleration = fall_acceleration;
            self.velocity.z = 0.0;
            self.calc_velocity(time_tick, lateral_friction, false, braking);
            self.velocity.z = old_velocity.z;
            self.acceleration = saved_acceleration;

            if !has_air_control {
                velocity_no_air_control = self.velocity;
            }

            let gravity = self.gravity();
            self.velocity = self.new_fall_velocity(self.velocity, gravity, time_tick);
            velocity_no_air_control = self.new_fall_velocity(velocity_no_air_control, gravity, time_tick);
            let air_control_accel = (self.velocity - velocity_no_air_control) / time_tick;

            let mut adjusted = (old_velocity + self.velocity) * 0.5 * time_tick
                + self.vr_input_velocity * time_tick;
            let mut hit = self.safe_move(ctx, adjusted);

            let mut last_move_time_slice = time_tick;
            let mut sub_time_tick_remaining = time_tick * (1.0 - hit.time);

            if self.is_in_water(ctx) {
                remaining_time += sub_time_tick_remaining;
                self.start_swimming(ctx, old_location, old_velocity, time_tick, remaining_time, iterations);
                return;
            }

            if hit.blocking_hit {
                let location = self.capsule.location();
                if self.is_valid_landing_spot(ctx, location, &hit) {
                    remaining_time += sub_time_tick_remaining;
                    self.process_landed(ctx, &hit, remaining_time, iterations);
                    return;
                }

                // Deflect using the final velocity so the slide keeps the full
                // effect of gravity.
                adjusted = self.velocity * time_tick;

                if !hit.start_penetrating && self.should_check_for_valid_landing_spot(&hit) {
                    let floor = self.find_floor(ctx, location, false, None);
                    if floor.is_walkable_floor() && self.is_valid_landing_spot(ctx, location, &floor.hit) {
                        remaining_time += sub_time_tick_remaining;
                        self.process_landed(ctx, &floor.hit, remaining_time, iterations);
                        return;
                    }
                }

                self.handle_impact(&hit, last_move_time_slice, adjusted);

                if has_air_control {
                    let air_control_delta_v =
                        self.limit_air_control(air_control_accel, &hit) * last_move_time_slice;
                    adjusted = (velocity_no_air_control + air_control_delta_v) * last_move_time_slice;
                }

                let old_hit_normal = hit.normal;
                let old_hit_impact_normal = hit.impact_normal;
                let mut delta = self.compute_slide_vector(adjusted, 1.0 - hit.time, old_hit_normal);

                if sub_time_tick_remaining > KINDA_SMALL_NUMBER && !self.just_teleported {
                    self.velocity = delta / sub_time_tick_remaining;
                }

                if sub_time_tick_remaining > KINDA_SMALL_NUMBER && delta.dot(&adjusted) > 0.0 {
                    hit = self.safe_move(ctx, delta);

                    if hit.blocking_hit {
                        // Second wall.
                        last_move_time_slice = sub_time_tick_remaining;
                        sub_time_tick_remaining *= 1.0 - hit.time;

                        let location = self.capsule.location();
                        if self.is_valid_landing_spot(ctx, location, &hit) {
                            remaining_time += sub_time_tick_remaining;
                            self.process_landed(ctx, &hit, remaining_time, iterations);
                            return;
                        }

                        self.handle_impact(&hit, last_move_time_slice, delta);

                        if has_air_control && hit.normal.z > VERTICAL_SLOPE_NORMAL_Z {
                            let last_move_no_air_control = velocity_no_air_control * last_move_time_slice;
                            delta = self.compute_slide_vector(last_move_no_air_control, 1.0, old_hit_normal);
                        }

                        self.two_wall_adjust(&mut delta, &hit, old_hit_normal);

                        if has_air_control {
                            let air_control_delta_v =
                                self.limit_air_control(air_control_accel, &hit) * sub_time_tick_remaining;
                            // Never back into the first wall.
                            if air_control_delta_v.dot(&old_hit_normal) > 0.0 {
                                delta += air_control_delta_v * sub_time_tick_remaining;
                            }
                        }

                        if sub_time_tick_remaining > KINDA_SMALL_NUMBER && !self.just_teleported {
                            self.velocity = delta / sub_time_tick_remaining;
                        }

                        // Straddling two slopes, neither of which we can stand on.
                        let ditch = old_hit_impact_normal.z > 0.0
                            && hit.impact_normal.z > 0.0
                            && delta.z.abs() <= KINDA_SMALL_NUMBER
                            && hit.impact_normal.dot(&old_hit_impact_normal) < 0.0;

                        hit = self.safe_move(ctx, delta);
                        if hit.time == 0.0 {
                            // Stuck: try a side step.
                            let mut side_delta = safe_normal_2d(old_hit_normal + hit.impact_normal);
                            if is_nearly_zero(&side_delta, KINDA_SMALL_NUMBER) {
                                side_delta = safe_normal(Vector::new(old_hit_normal.y, -old_hit_normal.x, 0.0));
                            }
                            hit = self.safe_move(ctx, side_delta);
                        }

                        let location = self.capsule.location();
                        if ditch || self.is_valid_landing_spot(ctx, location, &hit) || hit.time == 0.0 {
                            self.process_landed(ctx, &hit, 0.0, iterations);
                            return;
                        }
                        if self.perch_radius_threshold() > 0.0
                            && hit.time == 1.0
                            && old_hit_impact_normal.z >= self.config.walkable_floor_z
                        {
                            self.nudge_out_of_ditch(ctx, old_location, time_tick);
                        }
                    }
                }
            } else {
                let location = self.capsule.location();
                self.current_floor = self.find_floor(ctx, location, false, None);
                if self.current_floor.is_walkable_floor() {
                    if self.current_floor.distance_to_floor() < AVG_FLOOR_DIST {
                        self.adjust_floor_height(ctx);
                    }
                } else if self.current_floor.hit.start_penetrating {
                    // Pop out of the floor rather than sweeping further down.
                    let mut hit = self.current_floor.hit;
                    hit.trace_end = hit.trace_start + Vector::new(0.0, 0.0, MAX_FLOOR_DIST);
                    let adjustment = self.penetration_adjustment(&hit);
                    self.resolve_penetration(ctx, adjustment, &hit);
                    self.force_next_floor_check = true;
                }
            }

            if size_squared_2d(&self.velocity) <= KINDA_SMALL_NUMBER * 10.0 {
                self.velocity.x = 0.0;
                self.velocity.y = 0.0;
            }
        }
    }

    /// Random hop out of a wedge inside the perch radius, when the last move
    /// barely changed our position.
    fn nudge_out_of_ditch(&mut self, ctx: &MovementContext<'_>, old_location: Vector<Real>, time_tick: Real) {
        let location = self.capsule.location();
        let z_moved = (location.z - old_location.z).abs();
        let moved_2d_sq = size_squared_2d(&(location - old_location));
        if z_moved > 0.2 * time_tick || moved_2d_sq > 4.0 * time_tick {
            return;
        }
        let max_speed = self.max_speed();
        let nudge_x: Real = self.rng.gen::<Real>() - 0.5;
        let nudge_y: Real = self.rng.gen::<Real>() - 0.5;
        self.velocity.x += 0.25 * max_speed * nudge_x;
        self.velocity.y += 0.25 * max_speed * nudge_y;
        self.velocity.z = (self.config.jump_z_velocity * 0.25).max(1.0);
        trace!(velocity = ?self.velocity, "ditch nudge");
        self.events.push(MovementEvent::DitchNudge {
            velocity: self.velocity,
        });
        let delta = self.velocity * time_tick;
        self.safe_move(ctx, delta);
    }

    /// Whether `hit` is something we can land on from `capsule_location`.
    pub fn is_valid_landing_spot(
        &mut self,
        ctx: &MovementContext<'_>,
        capsule_location: Vector<Real>,
        hit: &HitResult,
    ) -> bool {
        if !hit.blocking_hit {
            return false;
        }
        let radius = self.capsule.radius();
        if !hit.start_penetrating {
            if !self.is_walkable(hit) {
                return false;
            }
            // Contacts above the lower hemisphere come from sliding down walls.
            let lower_hemisphere_z = hit.location.z - self.capsule.half_height() + radius;
            if hit.impact_point.z >= lower_hemisphere_z {
                return false;
            }
            if !self.is_within_edge_tolerance(hit.location, hit.impact_point, radius) {
                return false;
            }
        } else if hit.normal.z < KINDA_SMALL_NUMBER {
            // Depenetrating sideways off a wall, not onto a floor.
            return false;
        }
        self.find_floor(ctx, capsule_location, false, Some(hit))
            .is_walkable_floor()
    }

    /// A hit on the lower edge of a surface: a downward sweep may still find
    /// walkable ground on top of it.
    pub fn should_check_for_valid_landing_spot(&self, hit: &HitResult) -> bool {
        hit.normal.z > KINDA_SMALL_NUMBER
            && !nearly_equal(&hit.normal, &hit.impact_normal, KINDA_SMALL_NUMBER)
            && self.is_within_edge_tolerance(self.capsule.location(), hit.impact_point, self.capsule.radius())
    }
}
