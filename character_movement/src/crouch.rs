//! Crouching resizes the capsule. Both directions are all-or-nothing: when
//! the new capsule would overlap something the size and location are left
//! untouched.

use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::debug;

use crate::{CharacterMovement, MovementContext, MovementEvent, KINDA_SMALL_NUMBER, MIN_FLOOR_DIST};

const SWEEP_INFLATION: Real = KINDA_SMALL_NUMBER * 10.0;

impl CharacterMovement {
    pub fn can_crouch_in_current_state(&self) -> bool {
        self.mode.is_falling() || self.is_moving_on_ground()
    }

    /// Shrinks to the crouched half height, keeping the capsule bottom in
    /// place. Returns whether we are crouched afterwards.
    pub fn crouch(&mut self, ctx: &MovementContext<'_>) -> bool {
        if !self.can_crouch_in_current_state() {
            return false;
        }
        let old_half_height = self.capsule.half_height();
        let target = self.capsule.radius().max(self.config.crouched_half_height).max(0.0);
        if old_half_height == target {
            self.crouched = true;
            return true;
        }

        let saved = self.capsule;
        self.capsule.set_capsule_half_height(target);
        if target > old_half_height
            && ctx
                .collision
                .overlap_blocking_test(self.capsule.location(), &self.capsule.shape())
        {
            debug!(target, "crouch blocked");
            self.capsule = saved;
            return false;
        }

        self.crouched = true;
        self.force_next_floor_check = true;
        self.events.push(MovementEvent::Crouched);
        debug!(half_height = target, "crouched");
        true
    }

    /// Grows back to the standing half height if there is room. Returns
    /// whether we are standing afterwards.
    pub fn uncrouch(&mut self, ctx: &MovementContext<'_>) -> bool {
        let standing = self.uncrouched_half_height;
        let current = self.capsule.half_height();
        if current == standing {
            self.crouched = false;
            return true;
        }

        let location = self.capsule.location();
        let standing_shape = self.capsule.shape().with_half_height(standing + SWEEP_INFLATION);
        let blocked = |center: Vector<Real>| ctx.collision.overlap_blocking_test(center, &standing_shape);

        let committed = if self.crouch_maintains_base_location {
            // Keep the bottom where it is.
            let mut center = location + Vector::new(0.0, 0.0, standing_shape.half_height - current);
            let mut encroached = blocked(center);
            if encroached && self.is_moving_on_ground() {
                // Something barely overhead: try closer to the floor.
                let floor = &self.current_floor;
                if floor.blocking_hit && floor.floor_dist > SWEEP_INFLATION {
                    center.z -= floor.floor_dist - SWEEP_INFLATION;
                    encroached = blocked(center);
                }
            }
            (!encroached).then_some(center)
        } else if !blocked(location) {
            Some(location)
        } else if standing > current {
            // Drop a sphere to whatever is below and try to stand up from there.
            let radius = self.capsule.radius();
            let trace_dist = current - radius;
            let short = self.capsule.shape().with_half_height(radius);
            let hit = ctx
                .collision
                .sweep(&short, location, location - Vector::new(0.0, 0.0, trace_dist));
            if hit.start_penetrating {
                None
            } else {
                let distance_to_base = hit.time * trace_dist + short.half_height;
                let center = Vector::new(
                    location.x,
                    location.y,
                    location.z - distance_to_base + standing + SWEEP_INFLATION + MIN_FLOOR_DIST / 2.0,
                );
                (!blocked(center)).then_some(center)
            }
        } else {
            None
        };

        let Some(center) = committed else {
            debug!(half_height = current, "uncrouch blocked");
            return false;
        };

        self.capsule.set_capsule_half_height(standing);
        self.capsule.set_location(center - Vector::new(0.0, 0.0, SWEEP_INFLATION));
        self.crouched = false;
        self.force_next_floor_check = true;
        self.events.push(MovementEvent::Uncrouched);
        debug!(half_height = standing, "uncrouched");
        true
    }
}
