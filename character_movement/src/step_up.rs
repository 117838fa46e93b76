use character_collision::HitResult;
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::trace;

use crate::math::is_zero;
use crate::movement::{MovementSnapshot, StepDownResult};
use crate::{CharacterMovement, MovementContext, KINDA_SMALL_NUMBER, MAX_FLOOR_DIST, MAX_STEP_SIDE_Z};

/// Everything a step-up attempt may touch, restored when it is rejected.
struct StepUpRevert {
    snapshot: MovementSnapshot,
    just_teleported: bool,
    force_next_floor_check: bool,
}

impl CharacterMovement {
    /// Climbs onto the obstruction in `hit`: up by the step height, forward by
    /// `delta`, then back down. Returns `None` and leaves the capsule where it
    /// started when any leg of the move is rejected.
    pub fn step_up(
        &mut self,
        ctx: &MovementContext<'_>,
        grav_dir: Vector<Real>,
        delta: Vector<Real>,
        hit: &HitResult,
        compute_floor: bool,
    ) -> Option<StepDownResult> {
        let max_step = self.config.max_step_height;
        if !self.can_step_up(ctx, hit) || max_step <= 0.0 || is_zero(&grav_dir) {
            return None;
        }

        let old_location = self.capsule.location();
        let radius = self.capsule.radius();
        let half_height = self.capsule.half_height();

        // Nothing to climb if the contact is on the upper hemisphere.
        let initial_impact_z = hit.impact_point.z;
        if initial_impact_z > old_location.z + (half_height - radius) {
            trace!(initial_impact_z, "step up rejected: impact too high");
            return None;
        }

        let step_side_z = -hit.impact_normal.dot(&grav_dir);
        let mut initial_floor_base_z = old_location.z - half_height;
        let mut floor_point_z = initial_floor_base_z;
        let mut step_travel_up = max_step;
        let mut step_travel_down = max_step;

        if self.is_moving_on_ground() && self.current_floor.is_walkable_floor() {
            let floor_dist = self.current_floor.distance_to_floor().max(0.0);
            initial_floor_base_z -= floor_dist;
            step_travel_up = (step_travel_up - floor_dist).max(0.0);
            step_travel_down = max_step + MAX_FLOOR_DIST * 2.0;

            let hit_vertical_face =
                !self.is_within_edge_tolerance(hit.location, hit.impact_point, radius);
            if !self.current_floor.line_trace && !hit_vertical_face {
                floor_point_z = self.current_floor.hit.impact_point.z;
            } else {
                floor_point_z -= self.current_floor.floor_dist;
            }
        }

        if initial_impact_z <= initial_floor_base_z {
            trace!(initial_impact_z, "step up rejected: impact below floor");
            return None;
        }

        let revert = StepUpRevert {
            snapshot: self.snapshot(),
            just_teleported: self.just_teleported,
            force_next_floor_check: self.force_next_floor_check,
        };

        let up_hit = self.move_updated_component(ctx, -grav_dir * step_travel_up, true);
        if up_hit.start_penetrating {
            return self.reject_step_up(&revert, "penetrating after up sweep");
        }

        let mut forward_hit = self.move_updated_component(ctx, delta, true);
        let forward_blocked = forward_hit.blocking_hit;
        if forward_blocked {
            if forward_hit.start_penetrating {
                return self.reject_step_up(&revert, "penetrating after forward sweep");
            }
            if up_hit.blocking_hit {
                self.handle_impact(&up_hit, 0.0, Vector::zeros());
            }
            self.handle_impact(&forward_hit, 0.0, Vector::zeros());

            let forward_hit_time = forward_hit.time;
            let normal = forward_hit.normal;
            let slide_amount = self.slide_along_surface(
                ctx,
                delta,
                1.0 - forward_hit_time,
                normal,
                &mut forward_hit,
                true,
            );
            if forward_hit_time == 0.0 && slide_amount == 0.0 {
                return self.reject_step_up(&revert, "no forward progress");
            }
        }

        let down_hit = self.move_updated_component(ctx, grav_dir * step_travel_down, true);
        if down_hit.start_penetrating {
            return self.reject_step_up(&revert, "penetrating after down sweep");
        }

        // Blocked ahead and back where we started: a plain slide does better.
        if forward_blocked && self.capsule.location().z <= old_location.z + KINDA_SMALL_NUMBER {
            return self.reject_step_up(&revert, "no height gained against obstruction");
        }

        let mut result = StepDownResult::default();
        if down_hit.is_valid_blocking_hit() {
            let delta_z = down_hit.impact_point.z - floor_point_z;
            if delta_z > max_step {
                return self.reject_step_up(&revert, "step too high");
            }

            if !self.is_walkable(&down_hit) {
                // Unwalkable normals facing us would push us back down.
                if delta.dot(&down_hit.impact_normal) < 0.0 {
                    return self.reject_step_up(&revert, "unwalkable surface facing move");
                }
                if down_hit.location.z > old_location.z {
                    return self.reject_step_up(&revert, "unwalkable surface above start");
                }
            }

            if !self.is_within_edge_tolerance(down_hit.location, down_hit.impact_point, radius) {
                return self.reject_step_up(&revert, "landing outside edge tolerance");
            }

            if delta_z > 0.0 && !self.can_step_up(ctx, &down_hit) {
                return self.reject_step_up(&revert, "landing surface refuses step up");
            }

            if compute_floor {
                let location = self.capsule.location();
                let floor = self.find_floor(ctx, location, false, Some(&down_hit));
                // Don't climb onto a barely-sloped step side with nothing under it.
                if down_hit.location.z > old_location.z
                    && !floor.blocking_hit
                    && step_side_z < MAX_STEP_SIDE_Z
                {
                    return self.reject_step_up(&revert, "no floor after step");
                }
                result = StepDownResult {
                    computed_floor: true,
                    floor,
                };
            }
        }

        self.just_teleported |= !self.config.maintain_horizontal_ground_velocity;
        self.stats.step_ups += 1;
        trace!(from = ?old_location, to = ?self.capsule.location(), "stepped up");
        Some(result)
    }

    fn reject_step_up(&mut self, revert: &StepUpRevert, reason: &str) -> Option<StepDownResult> {
        let snapshot = &revert.snapshot;
        self.capsule = snapshot.capsule;
        self.velocity = snapshot.velocity;
        self.current_floor = snapshot.floor;
        self.base = snapshot.base;
        self.old_base_location = snapshot.old_base_location;
        self.just_teleported = revert.just_teleported;
        self.force_next_floor_check = revert.force_next_floor_check;
        trace!(reason, "step up rejected");
        None
    }
}

#[cfg(test)]
mod tests {
    use character_collision::RapierCollision;
    use physics_rapier::PhysicsWorld;
    use rapier3d::prelude::*;

    use crate::{
        CharacterMovement, MovementConfig, MovementContext, MovementMode, MovementSnapshot,
        StepDownResult,
    };

    /// Floor plus a long block whose near face is at x = 100.
    fn floor_with_block(height: Real) -> (PhysicsWorld, ColliderHandle) {
        let mut world = PhysicsWorld::z_up();
        world.insert_static_collider(
            ColliderBuilder::cuboid(5000.0, 5000.0, 10.0)
                .translation(vector![0.0, 0.0, -10.0])
                .build(),
        );
        let block = world.insert_static_collider(
            ColliderBuilder::cuboid(1000.0, 1000.0, height * 0.5)
                .translation(vector![1100.0, 0.0, height * 0.5])
                .build(),
        );
        world.refresh_queries();
        (world, block)
    }

    fn walk_forward(world: &PhysicsWorld, ticks: u32) -> CharacterMovement {
        let collision = RapierCollision::new(world);
        let ctx = MovementContext::new(&collision);
        let mut movement =
            CharacterMovement::new(MovementConfig::default(), vector![0.0, 0.0, 2.0], 0.0, 34.0, 88.0);
        movement.set_movement_mode(&ctx, MovementMode::Walking);
        for _ in 0..ticks {
            let acceleration = movement.scale_input_acceleration(Vector::x());
            movement.set_acceleration(acceleration);
            movement.perform_movement(&ctx, 1.0 / 60.0);
        }
        movement
    }

    #[test]
    fn climbs_steps_below_max_step_height() {
        let (world, _) = floor_with_block(30.0);
        let movement = walk_forward(&world, 60);

        assert_eq!(movement.mode(), MovementMode::Walking);
        assert!(movement.stats().step_ups >= 1);
        assert!(movement.location().x > 150.0);
        assert!(movement.location().z > 88.0 + 30.0 - 1.0);
    }

    #[test]
    fn walls_above_max_step_height_block() {
        let (world, _) = floor_with_block(60.0);
        let movement = walk_forward(&world, 60);

        assert_eq!(movement.mode(), MovementMode::Walking);
        assert_eq!(movement.stats().step_ups, 0);
        assert!(movement.location().x < 70.0);
        assert!(movement.location().z < 95.0);
        assert!(movement.location().y.abs() < 0.5);
    }

    #[test]
    fn walls_refusing_step_up_block() {
        let (mut world, block) = floor_with_block(30.0);
        world.set_can_step_up(block, false);
        let movement = walk_forward(&world, 60);

        assert_eq!(movement.stats().step_ups, 0);
        assert!(movement.location().x < 70.0);
        assert!(movement.location().z < 95.0);
        assert!(movement.location().y.abs() < 0.5);
    }

    /// Walks into the block, then steps up from the blocking hit directly.
    fn step_into_block(height: Real) -> (CharacterMovement, Option<StepDownResult>, MovementSnapshot) {
        let (world, _) = floor_with_block(height);
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        let mut movement =
            CharacterMovement::new(MovementConfig::default(), vector![60.0, 0.0, 2.0], 0.0, 34.0, 88.0);
        movement.set_movement_mode(&ctx, MovementMode::Walking);
        movement.perform_movement(&ctx, 1.0 / 60.0);
        assert!(movement.current_floor().is_walkable_floor());
        movement.set_velocity(vector![300.0, 20.0, 0.0]);

        let delta = vector![40.0, 0.0, 0.0];
        let hit = movement.safe_move(&ctx, delta);
        assert!(hit.is_valid_blocking_hit());
        let before = movement.snapshot();
        let stepped = movement.step_up(&ctx, vector![0.0, 0.0, -1.0], delta * (1.0 - hit.time), &hit, true);
        (movement, stepped, before)
    }

    #[test]
    fn rejected_step_up_restores_movement_state() {
        // Blocked by the wall top, lands back on the floor.
        let (movement, stepped, before) = step_into_block(60.0);
        assert!(stepped.is_none());
        assert_eq!(movement.snapshot(), before);
        assert_eq!(movement.stats().step_ups, 0);

        // Clears the edge while rising but the top is above the step height.
        let (movement, stepped, before) = step_into_block(46.0);
        assert!(stepped.is_none());
        assert_eq!(movement.snapshot(), before);
        assert_eq!(movement.location(), before.capsule.location());
    }
}
