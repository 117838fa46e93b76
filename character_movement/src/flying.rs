use rapier3d::math::Vector;
use rapier3d::prelude::Real;

use crate::math::{is_zero, safe_normal};
use crate::{CharacterMovement, MovementContext, MovementPhysics, MIN_TICK_TIME};

pub struct FlyingPhysics;

impl MovementPhysics for FlyingPhysics {
    fn simulate(
        &mut self,
        movement: &mut CharacterMovement,
        ctx: &MovementContext<'_>,
        delta_time: Real,
        iterations: u32,
    ) {
        movement.phys_flying(ctx, delta_time, iterations);
    }
}

impl CharacterMovement {
    pub fn phys_flying(&mut self, ctx: &MovementContext<'_>, delta_time: Real, iterations: u32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }

        if self.config.cheat_flying && is_zero(&self.acceleration) {
            self.velocity = Vector::zeros();
        }
        let friction = 0.5 * self.config.fluid_friction;
        let braking = self.max_braking_deceleration();
        self.calc_velocity(delta_time, friction, true, braking);
        let move_velocity = self.velocity;

        self.just_teleported = false;
        let mut old_location = self.capsule.location();
        let adjusted = self.velocity * delta_time;
        let vr_delta = self.vr_input_velocity * delta_time;
        let mut hit = self.safe_move(ctx, adjusted + vr_delta);

        if hit.time < 1.0 {
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
                    .step_up(ctx, grav_dir, (adjusted + vr_delta) * (1.0 - hit.time), &hit, false)
                    .is_some();
                if stepped_up {
                    old_location.z = self.capsule.location().z + (old_location.z - step_z);
                }
            }

            if !stepped_up {
                self.handle_impact(&hit, delta_time, adjusted);
                let normal = hit.normal;
                self.slide_along_surface(ctx, adjusted, 1.0 - hit.time, normal, &mut hit, true);
            }
        }

        if self.is_in_water(ctx) {
            self.start_swimming(ctx, old_location, move_velocity, delta_time, 0.0, iterations + 1);
            return;
        }

        if !self.just_teleported {
            self.velocity = ((self.capsule.location() - old_location) - vr_delta) / delta_time;
        }
    }
}

#[cfg(test)]
mod tests {
    use character_collision::RapierCollision;
    use physics_rapier::PhysicsWorld;
    use rapier3d::prelude::*;

    use crate::{CharacterMovement, MovementConfig, MovementContext, MovementEvent, MovementMode};

    #[test]
    fn flying_slides_along_wall_and_keeps_height() {
        let mut world = PhysicsWorld::z_up();
        world.insert_static_collider(
            ColliderBuilder::cuboid(10.0, 500.0, 500.0)
                .translation(vector![100.0, 0.0, 0.0])
                .build(),
        );
        world.refresh_queries();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let mut movement =
            CharacterMovement::new(MovementConfig::default(), vector![0.0, 0.0, 200.0], 0.0, 34.0, 88.0);
        movement.set_movement_mode(&ctx, MovementMode::Flying);
        movement.set_velocity(vector![600.0, 300.0, 0.0]);
        let start_z = movement.location().z;

        for _ in 0..30 {
            movement.perform_movement(&ctx, 1.0 / 60.0);
        }

        let location = movement.location();
        assert!(location.x < 100.0 - 10.0 - 34.0 + 0.5, "went through wall: {location:?}");
        assert!(location.y > 50.0, "did not slide: {location:?}");
        assert!((location.z - start_z).abs() < 1.0);
        assert_eq!(movement.mode(), MovementMode::Flying);
    }

    #[test]
    fn flying_into_fluid_starts_swimming() {
        let mut world = PhysicsWorld::z_up();
        world.insert_fluid_volume(vector![200.0, 1000.0, 200.0], vector![600.0, 0.0, 300.0], 0.3);
        world.refresh_queries();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        let mut movement =
            CharacterMovement::new(MovementConfig::default(), vector![0.0, 0.0, 212.0], 0.0, 34.0, 88.0);
        movement.set_movement_mode(&ctx, MovementMode::Flying);
        movement.set_velocity(vector![600.0, 0.0, 0.0]);

        for _ in 0..120 {
            if movement.mode() != MovementMode::Flying {
                break;
            }
            let acceleration = movement.scale_input_acceleration(Vector::x());
            movement.set_acceleration(acceleration);
            movement.perform_movement(&ctx, 1.0 / 60.0);
        }

        assert_eq!(movement.mode(), MovementMode::Swimming);
        let location = movement.location();
        assert!(location.x > 400.0 && location.x < 800.0, "{location:?}");
        assert!(movement.drain_events().contains(&MovementEvent::ModeChanged {
            from: MovementMode::Flying,
            to: MovementMode::Swimming,
        }));
    }
}
