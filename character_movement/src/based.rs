//! Movement bases: the surface the character stands on and follows.

use character_collision::BaseHandle;
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::{debug, trace};

use crate::math::is_nearly_zero;
use crate::{CharacterMovement, MovementContext, KINDA_SMALL_NUMBER};

impl CharacterMovement {
    pub fn set_base(&mut self, ctx: &MovementContext<'_>, base: Option<BaseHandle>) {
        if self.base == base {
            return;
        }
        trace!(from = ?self.base, to = ?base, "movement base changed");
        self.base = base;
        self.save_base_location(ctx);
    }

    /// Stands on the current floor's component when the floor is walkable.
    pub fn set_base_from_floor(&mut self, ctx: &MovementContext<'_>) {
        let base = if self.current_floor.is_walkable_floor() {
            self.current_floor.hit.component
        } else {
            None
        };
        self.set_base(ctx, base);
    }

    pub fn save_base_location(&mut self, ctx: &MovementContext<'_>) {
        self.old_base_location = self.base.and_then(|base| ctx.collision.base_location(base));
    }

    fn dynamic_base(&self, ctx: &MovementContext<'_>) -> Option<BaseHandle> {
        let base = self.base?;
        ctx.collision
            .base_info(base)
            .filter(|info| info.dynamic)
            .map(|_| base)
    }

    /// Velocity handed over when leaving a moving base.
    pub fn imparted_movement_base_velocity(&self, ctx: &MovementContext<'_>) -> Vector<Real> {
        if !self.config.impart_base_velocity {
            return Vector::zeros();
        }
        self.dynamic_base(ctx)
            .map(|base| ctx.collision.base_velocity(base))
            .unwrap_or_else(Vector::zeros)
    }

    /// Carries the capsule along with a moving base.
    pub fn update_based_movement(&mut self, ctx: &MovementContext<'_>) {
        let Some(base) = self.base else {
            return;
        };
        let Some(info) = ctx.collision.base_info(base) else {
            debug!(?base, "movement base removed");
            self.set_base(ctx, None);
            return;
        };
        if !info.dynamic {
            return;
        }
        let Some(new_base_location) = ctx.collision.base_location(base) else {
            self.set_base(ctx, None);
            return;
        };
        let Some(old_base_location) = self.old_base_location else {
            self.old_base_location = Some(new_base_location);
            return;
        };
        if old_base_location == new_base_location {
            return;
        }

        let delta = new_base_location - old_base_location;
        let old_location = self.capsule.location();
        self.move_updated_component(ctx, delta, true);
        if !is_nearly_zero(&(self.capsule.location() - (old_location + delta)), KINDA_SMALL_NUMBER) {
            trace!(?delta, "unable to follow base move");
        }
        self.old_base_location = Some(new_base_location);
    }
}

#[cfg(test)]
mod tests {
    use character_collision::{BaseHandle, RapierCollision};
    use physics_rapier::PhysicsWorld;
    use rapier3d::prelude::*;

    use crate::{CharacterMovement, MovementConfig, MovementContext, MovementMode};

    const DT: Real = 1.0 / 60.0;

    #[test]
    fn character_rides_a_moving_platform_and_keeps_its_velocity() {
        let mut world = PhysicsWorld::z_up();
        let (body, platform) = world.insert_platform(
            ColliderBuilder::cuboid(500.0, 500.0, 10.0).build(),
            vector![0.0, 0.0, -10.0],
        );
        world.refresh_queries();

        let mut movement = {
            let collision = RapierCollision::new(&world);
            let ctx = MovementContext::new(&collision);
            let mut movement =
                CharacterMovement::new(MovementConfig::default(), vector![0.0, 0.0, 2.0], 0.0, 34.0, 88.0);
            movement.set_movement_mode(&ctx, MovementMode::Walking);
            movement
        };
        assert_eq!(movement.base(), Some(BaseHandle::from(platform)));

        for tick in 1..=30 {
            world.move_platform(body, vector![tick as Real * 2.0, 0.0, -10.0], DT);
            world.step(DT);
            let collision = RapierCollision::new(&world);
            let ctx = MovementContext::new(&collision);
            movement.perform_movement(&ctx, DT);
        }
        assert!((movement.location().x - 60.0).abs() < 1.0);
        assert_eq!(movement.mode(), MovementMode::Walking);

        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        movement.set_jump_pressed(true);
        movement.perform_movement(&ctx, DT);
        assert_eq!(movement.mode(), MovementMode::Falling);
        assert_eq!(movement.base(), None);
        assert!((movement.velocity().x - 120.0).abs() < 1.0);
    }

    #[test]
    fn removed_base_is_dropped() {
        let mut world = PhysicsWorld::z_up();
        let (_, platform) = world.insert_platform(
            ColliderBuilder::cuboid(500.0, 500.0, 10.0).build(),
            vector![0.0, 0.0, -10.0],
        );
        world.refresh_queries();
        let mut movement = {
            let collision = RapierCollision::new(&world);
            let ctx = MovementContext::new(&collision);
            let mut movement =
                CharacterMovement::new(MovementConfig::default(), vector![0.0, 0.0, 2.0], 0.0, 34.0, 88.0);
            movement.set_movement_mode(&ctx, MovementMode::Walking);
            movement
        };
        assert!(movement.base().is_some());

        world.remove_collider(platform);
        world.refresh_queries();
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        movement.update_based_movement(&ctx);
        assert_eq!(movement.base(), None);
    }
}
