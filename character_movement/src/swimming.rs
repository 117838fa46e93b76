use character_collision::FluidVolume;
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::debug;

use crate::math::{clamp_max_size, safe_normal};
use crate::{
    CharacterMovement, MovementContext, MovementMode, MovementPhysics, KINDA_SMALL_NUMBER,
    MIN_TICK_TIME,
};

pub struct SwimmingPhysics;

impl MovementPhysics for SwimmingPhysics {
    fn simulate(
        &mut self,
        movement: &mut CharacterMovement,
        ctx: &MovementContext<'_>,
        delta_time: Real,
        iterations: u32,
    ) {
        movement.phys_swimming(ctx, delta_time, iterations);
    }
}

impl CharacterMovement {
    pub fn fluid(&self, ctx: &MovementContext<'_>) -> Option<FluidVolume> {
        ctx.collision.fluid_at(self.capsule.location())
    }

    pub fn is_in_water(&self, ctx: &MovementContext<'_>) -> bool {
        self.fluid(ctx).is_some()
    }

    /// Fraction of the capsule below the fluid surface, 0..=1.
    pub fn immersion_depth(&self, ctx: &MovementContext<'_>) -> Real {
        let Some(fluid) = self.fluid(ctx) else {
            return 0.0;
        };
        let half_height = self.capsule.half_height();
        if half_height == 0.0 || self.config.buoyancy == 0.0 {
            return 1.0;
        }
        let bottom = self.capsule.location().z - half_height;
        ((fluid.surface_z - bottom) / (2.0 * half_height)).clamp(0.0, 1.0)
    }

    /// Switches to swimming after a move that entered a fluid.
    pub fn start_swimming(
        &mut self,
        ctx: &MovementContext<'_>,
        old_location: Vector<Real>,
        old_velocity: Vector<Real>,
        time_tick: Real,
        remaining_time: Real,
        iterations: u32,
    ) {
        if time_tick > 0.0 {
            // The end velocity carries twice the average acceleration.
            let average = (self.capsule.location() - old_location) / time_tick;
            self.velocity = clamp_max_size(average * 2.0 - old_velocity, self.config.terminal_velocity);
        }
        debug!(location = ?self.capsule.location(), "entered fluid");
        self.set_movement_mode(ctx, MovementMode::Swimming);
        if remaining_time >= MIN_TICK_TIME && iterations < self.config.max_simulation_iterations {
            self.phys_swimming(ctx, remaining_time, iterations);
        }
    }

    pub fn phys_swimming(&mut self, ctx: &MovementContext<'_>, delta_time: Real, iterations: u32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }
        let Some(fluid) = self.fluid(ctx) else {
            self.set_movement_mode(ctx, MovementMode::Falling);
            self.start_new_physics(ctx, delta_time, iterations);
            return;
        };

        let depth = self.immersion_depth(ctx);
        let net_buoyancy = self.config.buoyancy * depth;
        let max_swim_speed = self.config.max_swim_speed;
        let original_accel_z = self.acceleration.z;
        let mut limited_up_accel = false;

        if self.velocity.z > 0.33 * max_swim_speed && net_buoyancy != 0.0 {
            // Damp upward speed near the surface.
            self.velocity.z = (0.33 * max_swim_speed).max(self.velocity.z * depth * depth);
        } else if depth < 0.65 {
            limited_up_accel = self.acceleration.z > 0.0;
            self.acceleration.z = self.acceleration.z.min(0.1);
        }

        let iterations = iterations + 1;
        let mut old_location = self.capsule.location();
        self.just_teleported = false;

        let friction = 0.5 * fluid.friction * depth;
        let braking = self.max_braking_deceleration();
        self.calc_velocity(delta_time, friction, true, braking);
        self.velocity.z += self.config.gravity_z() * delta_time * (1.0 - net_buoyancy);
        self.acceleration.z = original_accel_z;

        let vr_delta = self.vr_input_velocity * delta_time;
        let mut adjusted = self.velocity * delta_time + vr_delta;
        let (air_time, mut hit) = self.swim(ctx, adjusted, &fluid);
        let remaining_time = delta_time * air_time;

        if !self.is_in_water(ctx) {
            self.leave_water(ctx, remaining_time, iterations);
            return;
        }

        if hit.time < 1.0 {
            if limited_up_accel && self.velocity.z >= 0.0 {
                // Let us climb out at the surface when pressed against a wall.
                self.velocity.z += original_accel_z * delta_time;
                adjusted = self.velocity * (1.0 - hit.time) * delta_time;
                let (_, second) = self.swim(ctx, adjusted, &fluid);
                hit = second;
                if !self.is_in_water(ctx) {
                    self.leave_water(ctx, remaining_time, iterations);
                    return;
                }
            }

            let grav_dir = Vector::new(0.0, 0.0, -1.0);
            let up_down = grav_dir.dot(&safe_normal(self.velocity));
            let mut stepped_up = false;
            if hit.impact_normal.z.abs() < 0.2
                && up_down < 0.5
                && up_down > -0.2
                && self.can_step_up(ctx, &hit)
            {
                let step_z = self.capsule.location().z;
                stepped_up = self
                    .step_up(ctx, grav_dir, adjusted * (1.0 - hit.time), &hit, false)
                    .is_some();
                if stepped_up {
                    if !self.is_in_water(ctx) {
                        self.leave_water(ctx, remaining_time, iterations);
                        return;
                    }
                    old_location.z = self.capsule.location().z + (old_location.z - step_z);
                }
            }

            if !stepped_up {
                self.handle_impact(&hit, delta_time, adjusted);
                let normal = hit.normal;
                self.slide_along_surface(ctx, adjusted, 1.0 - hit.time, normal, &mut hit, true);
            }
        }

        let moved_time = delta_time - remaining_time;
        if !self.just_teleported && moved_time > KINDA_SMALL_NUMBER {
            self.velocity = ((self.capsule.location() - old_location) - vr_delta) / moved_time;
        }
    }

    /// Swept swim move. When it carries us out of the fluid, backs up to the
    /// surface and reports the fraction of the move that was out of the water.
    fn swim(
        &mut self,
        ctx: &MovementContext<'_>,
        delta: Vector<Real>,
        fluid: &FluidVolume,
    ) -> (Real, character_collision::HitResult) {
        let start = self.capsule.location();
        let mut hit = self.safe_move(ctx, delta);
        let mut air_time = 0.0;
        if !self.is_in_water(ctx) {
            let location = self.capsule.location();
            let desired_dist = delta.norm();
            let travelled_z = location.z - start.z;
            if desired_dist > KINDA_SMALL_NUMBER && travelled_z > KINDA_SMALL_NUMBER {
                let fraction = ((fluid.surface_z - start.z) / travelled_z).clamp(0.0, 1.0);
                let water_line = start + (location - start) * fraction;
                air_time = (water_line - location).norm() / desired_dist;
                hit = self.safe_move(ctx, water_line - location);
            }
        }
        (air_time, hit)
    }

    fn leave_water(&mut self, ctx: &MovementContext<'_>, remaining_time: Real, iterations: u32) {
        debug!(location = ?self.capsule.location(), "left fluid");
        if self.mode == MovementMode::Swimming {
            self.set_movement_mode(ctx, MovementMode::Falling);
        }
        self.start_new_physics(ctx, remaining_time, iterations);
    }
}

#[cfg(test)]
mod tests {
    use character_collision::RapierCollision;
    use physics_rapier::PhysicsWorld;
    use rapier3d::prelude::*;

    use crate::{CharacterMovement, MovementConfig, MovementContext, MovementMode};

    fn pool_world() -> PhysicsWorld {
        let mut world = PhysicsWorld::z_up();
        world.insert_static_collider(
            ColliderBuilder::cuboid(1000.0, 1000.0, 10.0)
                .translation(vector![0.0, 0.0, -10.0])
                .build(),
        );
        world.insert_fluid_volume(vector![1000.0, 1000.0, 150.0], vector![0.0, 0.0, 150.0], 0.3);
        world.refresh_queries();
        world
    }

    #[test]
    fn immersion_depth_tracks_surface() {
        let world = pool_world();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        // Capsule bottom at 100, surface at 300: fully under.
        let movement =
            CharacterMovement::new(MovementConfig::default(), vector![0.0, 0.0, 100.0], 0.0, 34.0, 88.0);
        assert_eq!(movement.immersion_depth(&ctx), 1.0);

        // Bottom at 212, top at 388: half under.
        let movement =
            CharacterMovement::new(MovementConfig::default(), vector![0.0, 0.0, 212.0], 0.0, 34.0, 88.0);
        assert!((movement.immersion_depth(&ctx) - 0.5).abs() < 1.0e-4);
    }

    #[test]
    fn falling_into_fluid_starts_swimming() {
        let world = pool_world();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let mut movement =
            CharacterMovement::new(MovementConfig::default(), vector![0.0, 0.0, 330.0], 0.0, 34.0, 88.0);
        movement.set_velocity(vector![0.0, 0.0, -400.0]);
        for _ in 0..120 {
            movement.perform_movement(&ctx, 1.0 / 60.0);
        }
        // Fully immersed: buoyancy cancels gravity once the pool floor stops us.
        assert_eq!(movement.mode(), MovementMode::Swimming);
        assert!(movement.velocity().z.abs() < 50.0, "{:?}", movement.velocity());
        assert!(movement.location().z > 80.0);
    }
}
