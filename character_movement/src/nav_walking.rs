use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::{debug, trace};

use crate::math::{is_nearly_zero, nearly_equal, size_squared_2d};
use crate::{
    CharacterMovement, MovementContext, MovementMode, MovementPhysics, KINDA_SMALL_NUMBER,
    MIN_TICK_TIME,
};

pub struct NavWalkingPhysics;

impl MovementPhysics for NavWalkingPhysics {
    fn simulate(
        &mut self,
        movement: &mut CharacterMovement,
        ctx: &MovementContext<'_>,
        delta_time: Real,
        iterations: u32,
    ) {
        movement.phys_nav_walking(ctx, delta_time, iterations);
    }
}

impl CharacterMovement {
    /// Walks on the navigation mesh instead of sweeping for a floor. The
    /// capsule follows the nav surface height under the destination.
    pub fn phys_nav_walking(&mut self, ctx: &MovementContext<'_>, delta_time: Real, iterations: u32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }

        self.maintain_horizontal_ground_velocity();
        self.acceleration.z = 0.0;
        let braking = self.max_braking_deceleration();
        self.calc_velocity(delta_time, self.config.ground_friction, false, braking);
        self.apply_vr_motion_to_velocity();

        let iterations = iterations + 1;
        let desired_move = Vector::new(self.velocity.x, self.velocity.y, 0.0);
        let old_location = self.feet_location();
        let delta_move = desired_move * delta_time;
        let mut adjusted_dest = old_location + delta_move;

        let same_nav_location = self.is_same_nav_location(old_location);
        let cached_nav = self.cached_nav_location;
        let dest_nav = match cached_nav {
            Some(cached) if same_nav_location && is_nearly_zero(&delta_move, KINDA_SMALL_NUMBER) => {
                trace!("reusing cached nav location");
                cached
            }
            cached => {
                if same_nav_location && self.config.project_nav_mesh_walking {
                    // Stay near the last valid nav height so we don't follow
                    // geometry out of the nav query range.
                    if let Some(cached) = cached {
                        adjusted_dest.z = cached.location.z;
                    }
                }
                let found = ctx
                    .navigation
                    .and_then(|navigation| navigation.find_nav_floor(adjusted_dest));
                let Some(found) = found else {
                    debug!("no navigation data, switching to walking");
                    self.restore_pre_additive_vr_motion_velocity();
                    self.set_movement_mode(ctx, MovementMode::Walking);
                    self.start_new_physics(ctx, delta_time, iterations);
                    return;
                };
                self.cached_nav_location = Some(found);
                found
            }
        };

        if dest_nav.node.is_none() {
            self.restore_pre_additive_vr_motion_velocity();
            self.start_falling(ctx, iterations, 0.0, delta_time, delta_move, old_location);
            return;
        }

        let mut new_location = Vector::new(adjusted_dest.x, adjusted_dest.y, dest_nav.location.z);
        if self.config.project_nav_mesh_walking {
            new_location = self.project_location_from_nav_mesh(ctx, new_location);
        }

        let old_capsule_location = self.capsule.location();
        let adjusted_delta = new_location - old_location;
        if !is_nearly_zero(&adjusted_delta, KINDA_SMALL_NUMBER) {
            let sweep = self.config.sweep_while_nav_walking;
            self.safe_move_with(ctx, adjusted_delta, sweep);
        }

        if self.is_in_water(ctx) {
            self.restore_pre_additive_vr_motion_velocity();
            let velocity = self.velocity;
            self.start_swimming(ctx, old_capsule_location, velocity, delta_time, 0.0, iterations);
            return;
        }

        if !self.just_teleported {
            self.velocity = (self.feet_location() - old_location) / delta_time;
            self.maintain_horizontal_ground_velocity();
        }
        self.just_teleported = false;
        self.restore_pre_additive_vr_motion_velocity();
    }

    /// Whether the cached nav location still describes where the feet are.
    fn is_same_nav_location(&self, feet: Vector<Real>) -> bool {
        let Some(cached) = self.cached_nav_location else {
            return false;
        };
        if cached.node.is_none() {
            return false;
        }
        if !self.config.project_nav_mesh_walking {
            return nearly_equal(&cached.location, &feet, KINDA_SMALL_NUMBER);
        }
        let dist_sq_2d = size_squared_2d(&(feet - cached.location));
        let dist_z = (feet.z - cached.location.z).abs();
        let scale = if feet.z > cached.location.z {
            self.config.nav_mesh_projection_height_scale_up
        } else {
            self.config.nav_mesh_projection_height_scale_down
        };
        let threshold = self.capsule.half_height() * 2.0 * scale.max(0.0);
        dist_sq_2d <= KINDA_SMALL_NUMBER && dist_z < threshold
    }

    /// Snaps `location` onto the nav mesh surface within the capsule-height
    /// projection window.
    fn project_location_from_nav_mesh(
        &self,
        ctx: &MovementContext<'_>,
        location: Vector<Real>,
    ) -> Vector<Real> {
        let total_height = self.capsule.half_height() * 2.0;
        let up = total_height * self.config.nav_mesh_projection_height_scale_up.max(0.0);
        let down = total_height * self.config.nav_mesh_projection_height_scale_down.max(0.0);
        ctx.navigation
            .and_then(|navigation| navigation.project_point_to_nav_mesh(location, up, down))
            .map_or(location, |projected| Vector::new(location.x, location.y, projected.z))
    }
}
