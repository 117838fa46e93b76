//! Swept moves, depenetration and sliding.

use character_collision::HitResult;
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::{trace, warn};

use crate::math::{clamp_max_size, is_nearly_zero, is_zero, project_on_plane, safe_normal, safe_normal_2d};
use crate::{CharacterMovement, MovementContext, MovementEvent, KINDA_SMALL_NUMBER, MIN_FLOOR_DIST};

const PENETRATION_PULLBACK_DISTANCE: Real = 0.125;
const SLIDE_NEARLY_ZERO: Real = 1.0e-3;
const DELTA: Real = 1.0e-5;

impl CharacterMovement {
    /// Moves the capsule by `delta`. With `sweep` the move stops at the first
    /// blocking hit and does not happen at all when starting in penetration.
    pub fn move_updated_component(
        &mut self,
        ctx: &MovementContext<'_>,
        delta: Vector<Real>,
        sweep: bool,
    ) -> HitResult {
        let start = self.capsule.location();
        let end = start + delta;
        if !sweep || is_zero(&delta) {
            self.capsule.set_location(end);
            return HitResult::new(start, end);
        }
        let hit = ctx.collision.sweep(&self.capsule.shape(), start, end);
        if hit.start_penetrating {
            return hit;
        }
        self.capsule
            .set_location(if hit.blocking_hit { hit.location } else { end });
        hit
    }

    /// Swept move that first tries to resolve an initial penetration.
    pub fn safe_move(&mut self, ctx: &MovementContext<'_>, delta: Vector<Real>) -> HitResult {
        self.safe_move_with(ctx, delta, true)
    }

    pub fn safe_move_with(
        &mut self,
        ctx: &MovementContext<'_>,
        delta: Vector<Real>,
        sweep: bool,
    ) -> HitResult {
        let hit = self.move_updated_component(ctx, delta, sweep);
        if hit.start_penetrating {
            let adjustment = self.penetration_adjustment(&hit);
            if self.resolve_penetration(ctx, adjustment, &hit) {
                return self.move_updated_component(ctx, delta, sweep);
            }
        }
        hit
    }

    /// Depenetration vector for a start-penetrating hit.
    pub fn penetration_adjustment(&self, hit: &HitResult) -> Vector<Real> {
        if !hit.start_penetrating {
            return Vector::zeros();
        }
        let depth = if hit.penetration_depth > 0.0 {
            hit.penetration_depth
        } else {
            0.125
        };
        clamp_max_size(
            hit.normal * (depth + PENETRATION_PULLBACK_DISTANCE),
            self.config.max_depenetration,
        )
    }

    /// Tries to move out of penetration: teleport when the adjusted spot is
    /// free, then progressively more permissive sweeps.
    pub fn resolve_penetration(
        &mut self,
        ctx: &MovementContext<'_>,
        adjustment: Vector<Real>,
        hit: &HitResult,
    ) -> bool {
        if is_zero(&adjustment) {
            return false;
        }
        let shape = self.capsule.shape();
        let before = self.capsule.location();
        let moved = if !ctx
            .collision
            .overlap_blocking_test(hit.trace_start + adjustment, &shape)
        {
            self.move_updated_component(ctx, adjustment, false);
            true
        } else {
            let sweep_out = self.move_updated_component(ctx, adjustment, true);
            let mut moved = self.capsule.location() != before;
            if !moved && sweep_out.start_penetrating {
                let second = self.penetration_adjustment(&sweep_out);
                let combined = adjustment + second;
                if second != adjustment && !is_zero(&combined) {
                    self.move_updated_component(ctx, combined, true);
                    moved = self.capsule.location() != before;
                }
            }
            if !moved {
                let move_delta = hit.trace_end - hit.trace_start;
                if !is_zero(&move_delta) {
                    self.move_updated_component(ctx, adjustment + move_delta, true);
                    moved = self.capsule.location() != before;
                    if !moved && move_delta.dot(&adjustment) > 0.0 {
                        self.move_updated_component(ctx, move_delta, true);
                        moved = self.capsule.location() != before;
                    }
                }
            }
            moved
        };
        if moved {
            self.stats.penetration_resolves += 1;
            trace!(?adjustment, "resolved penetration");
        }
        self.just_teleported |= moved;
        moved
    }

    pub fn handle_impact(&mut self, hit: &HitResult, time_slice: Real, move_delta: Vector<Real>) {
        self.events.push(MovementEvent::Impact {
            hit: *hit,
            time_slice,
            move_delta,
        });
    }

    pub(crate) fn notify_stuck(&mut self, hit: &HitResult) {
        self.stats.stuck_events += 1;
        warn!(location = ?self.capsule.location(), depth = hit.penetration_depth, "character stuck in geometry");
        self.events.push(MovementEvent::StuckInGeometry { hit: *hit });
    }

    pub fn compute_slide_vector(
        &self,
        delta: Vector<Real>,
        time: Real,
        normal: Vector<Real>,
    ) -> Vector<Real> {
        let result = project_on_plane(delta, normal) * time;
        if self.mode.is_falling() {
            self.handle_slope_boosting(result, delta, time, normal)
        } else {
            result
        }
    }

    /// Keeps a falling slide from deflecting higher than the move intended.
    fn handle_slope_boosting(
        &self,
        slide: Vector<Real>,
        delta: Vector<Real>,
        time: Real,
        normal: Vector<Real>,
    ) -> Vector<Real> {
        let mut result = slide;
        if result.z > 0.0 {
            let z_limit = delta.z * time;
            if result.z - z_limit > KINDA_SMALL_NUMBER {
                if z_limit > 0.0 {
                    result *= z_limit / result.z;
                } else {
                    result = Vector::zeros();
                }
                let remainder = slide - result;
                let remainder_xy = Vector::new(remainder.x, remainder.y, 0.0);
                result += project_on_plane(remainder_xy, safe_normal_2d(normal));
            }
        }
        result
    }

    /// Slides along the blocking surface, then along a second one if the
    /// first slide hits it. Returns the fraction of `time` applied.
    pub fn slide_along_surface(
        &mut self,
        ctx: &MovementContext<'_>,
        delta: Vector<Real>,
        time: Real,
        normal: Vector<Real>,
        hit: &mut HitResult,
        handle_impact: bool,
    ) -> Real {
        if !hit.blocking_hit {
            return 0.0;
        }
        let mut normal = normal;
        if self.is_moving_on_ground() {
            if normal.z > 0.0 {
                // Never get pushed up an unwalkable surface.
                if !self.is_walkable(hit) {
                    normal = safe_normal_2d(normal);
                }
            } else if normal.z < -KINDA_SMALL_NUMBER
                && self.current_floor.floor_dist < MIN_FLOOR_DIST
                && self.current_floor.blocking_hit
            {
                // Hit on the upper part of the capsule: don't push into the floor.
                let floor_normal = self.current_floor.hit.normal;
                let floor_opposed = delta.dot(&floor_normal) < 0.0 && floor_normal.z < 1.0 - DELTA;
                if floor_opposed {
                    normal = floor_normal;
                }
                normal = safe_normal_2d(normal);
            }
        }

        let old_hit_normal = normal;
        let mut slide_delta = self.compute_slide_vector(delta, time, normal);
        if slide_delta.dot(&delta) <= 0.0 {
            return 0.0;
        }
        *hit = self.safe_move(ctx, slide_delta);
        let first_hit_percent = hit.time;
        let mut percent_applied = first_hit_percent;
        if hit.is_valid_blocking_hit() {
            if handle_impact {
                self.handle_impact(hit, first_hit_percent * time, slide_delta);
            }
            self.two_wall_adjust(&mut slide_delta, hit, old_hit_normal);
            if !is_nearly_zero(&slide_delta, SLIDE_NEARLY_ZERO) && slide_delta.dot(&delta) > 0.0 {
                *hit = self.safe_move(ctx, slide_delta);
                let second_hit_percent = hit.time * (1.0 - first_hit_percent);
                percent_applied += second_hit_percent;
                if handle_impact && hit.blocking_hit {
                    self.handle_impact(hit, second_hit_percent * time, slide_delta);
                }
            }
        }
        percent_applied.clamp(0.0, 1.0)
    }

    /// New move direction after hitting a second surface.
    pub fn two_wall_adjust(
        &self,
        delta: &mut Vector<Real>,
        hit: &HitResult,
        old_hit_normal: Vector<Real>,
    ) {
        let in_delta = *delta;
        let hit_normal = hit.normal;
        if old_hit_normal.dot(&hit_normal) <= 0.0 {
            // Corner of 90 degrees or less: move along the crease.
            let desired = *delta;
            let new_dir = safe_normal(hit_normal.cross(&old_hit_normal));
            *delta = new_dir * (delta.dot(&new_dir) * (1.0 - hit.time));
            if desired.dot(delta) < 0.0 {
                *delta = -*delta;
            }
        } else {
            let desired = *delta;
            *delta = self.compute_slide_vector(*delta, 1.0 - hit.time, hit_normal);
            if delta.dot(&desired) <= 0.0 {
                *delta = Vector::zeros();
            } else if (hit_normal.dot(&old_hit_normal) - 1.0).abs() < KINDA_SMALL_NUMBER {
                // Same wall again: nudge away from it.
                *delta += hit_normal * 0.01;
            }
        }

        if self.is_moving_on_ground() {
            if delta.z > 0.0 {
                if (hit.normal.z >= self.config.walkable_floor_z || self.is_walkable(hit))
                    && hit.normal.z > KINDA_SMALL_NUMBER
                {
                    // Slide up walkable surfaces keeping horizontal speed.
                    let time = 1.0 - hit.time;
                    let scaled = safe_normal(*delta) * in_delta.norm();
                    *delta = Vector::new(in_delta.x, in_delta.y, scaled.z / hit.normal.z) * time;
                    if delta.z > self.config.max_step_height {
                        let rescale = self.config.max_step_height / delta.z;
                        *delta *= rescale;
                    }
                } else {
                    delta.z = 0.0;
                }
            } else if delta.z < 0.0
                && self.current_floor.floor_dist < MIN_FLOOR_DIST
                && self.current_floor.blocking_hit
            {
                delta.z = 0.0;
            }
        }
    }

    /// Ramp-following move that keeps the requested horizontal distance.
    pub fn compute_ground_movement_delta(
        &self,
        delta: Vector<Real>,
        ramp_hit: &HitResult,
        hit_from_line_trace: bool,
    ) -> Vector<Real> {
        let floor_normal = ramp_hit.impact_normal;
        let contact_normal = ramp_hit.normal;
        if floor_normal.z < 1.0 - KINDA_SMALL_NUMBER
            && floor_normal.z > KINDA_SMALL_NUMBER
            && contact_normal.z > KINDA_SMALL_NUMBER
            && !hit_from_line_trace
            && self.is_walkable(ramp_hit)
        {
            let floor_dot_delta = floor_normal.dot(&delta);
            let ramp = Vector::new(delta.x, delta.y, -floor_dot_delta / floor_normal.z);
            if self.config.maintain_horizontal_ground_velocity {
                ramp
            } else {
                safe_normal(ramp) * delta.norm()
            }
        } else {
            delta
        }
    }
}
