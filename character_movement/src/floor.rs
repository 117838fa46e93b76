//! Floor classification: walkability, floor distance, perching.

use character_collision::{CapsuleShape, HitResult};
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use tracing::trace;

use crate::math::size_squared_2d;
use crate::{
    CharacterMovement, MovementConfig, MovementContext, KINDA_SMALL_NUMBER, MAX_FLOOR_DIST,
    MIN_FLOOR_DIST, SWEEP_EDGE_REJECT_DISTANCE,
};

pub const AVG_FLOOR_DIST: Real = (MIN_FLOOR_DIST + MAX_FLOOR_DIST) * 0.5;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FloorResult {
    pub blocking_hit: bool,
    pub walkable_floor: bool,
    /// The result came from the line trace fallback.
    pub line_trace: bool,
    /// Distance from the capsule bottom to the floor, from the sweep.
    pub floor_dist: Real,
    pub line_dist: Real,
    pub hit: HitResult,
}

impl FloorResult {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_walkable_floor(&self) -> bool {
        self.blocking_hit && self.walkable_floor
    }

    pub fn set_from_sweep(&mut self, hit: HitResult, sweep_floor_dist: Real, walkable: bool) {
        self.blocking_hit = hit.is_valid_blocking_hit();
        self.walkable_floor = walkable;
        self.line_trace = false;
        self.floor_dist = sweep_floor_dist;
        self.line_dist = 0.0;
        self.hit = hit;
    }

    /// Takes the normal and component of a line trace but keeps the sweep's
    /// location and timing.
    pub fn set_from_line_trace(
        &mut self,
        hit: HitResult,
        sweep_floor_dist: Real,
        line_dist: Real,
        walkable: bool,
    ) {
        if self.blocking_hit && hit.blocking_hit {
            let old = self.hit;
            self.hit = HitResult {
                time: old.time,
                impact_point: old.impact_point,
                location: old.location,
                trace_start: old.trace_start,
                trace_end: old.trace_end,
                ..hit
            };
            self.line_trace = true;
            self.floor_dist = sweep_floor_dist;
            self.line_dist = line_dist;
            self.walkable_floor = walkable;
        }
    }

    pub fn distance_to_floor(&self) -> Real {
        if self.line_trace {
            self.line_dist
        } else {
            self.floor_dist
        }
    }
}

/// Surface slope test. Vertical and overhanging faces are never walkable.
pub fn is_walkable(config: &MovementConfig, hit: &HitResult) -> bool {
    if !hit.is_valid_blocking_hit() {
        return false;
    }
    hit.impact_normal.z >= KINDA_SMALL_NUMBER && hit.impact_normal.z >= config.walkable_floor_z
}

/// Rejects contacts that barely clip the rim of the capsule.
pub fn is_within_edge_tolerance(
    config: &MovementConfig,
    capsule_location: Vector<Real>,
    impact_point: Vector<Real>,
    radius: Real,
) -> bool {
    let edge = config.edge_reject_distance;
    let dist_sq = size_squared_2d(&(impact_point - capsule_location));
    let reduced = (edge + KINDA_SMALL_NUMBER).max(radius - edge);
    dist_sq < reduced * reduced
}

pub fn is_walkable_floor_hit(
    config: &MovementConfig,
    capsule_location: Vector<Real>,
    hit: &HitResult,
    radius: Real,
) -> bool {
    is_walkable(config, hit)
        && is_within_edge_tolerance(config, capsule_location, hit.impact_point, radius)
}

impl CharacterMovement {
    pub fn is_walkable(&self, hit: &HitResult) -> bool {
        is_walkable(&self.config, hit)
    }

    pub fn is_within_edge_tolerance(
        &self,
        capsule_location: Vector<Real>,
        impact_point: Vector<Real>,
        radius: Real,
    ) -> bool {
        is_within_edge_tolerance(&self.config, capsule_location, impact_point, radius)
    }

    /// Sweeps and line-traces down from `capsule_location` to measure the floor.
    pub fn compute_floor_dist(
        &self,
        ctx: &MovementContext<'_>,
        capsule_location: Vector<Real>,
        line_distance: Real,
        sweep_distance: Real,
        sweep_radius: Real,
        downward_sweep: Option<&HitResult>,
    ) -> FloorResult {
        let mut result = FloorResult::default();
        let radius = self.capsule.radius();
        let half_height = self.capsule.half_height();

        let mut skip_sweep = false;
        if let Some(sweep) = downward_sweep.filter(|hit| hit.is_valid_blocking_hit()) {
            let vertical = sweep.trace_start.z > sweep.trace_end.z
                && size_squared_2d(&(sweep.trace_start - sweep.trace_end)) <= KINDA_SMALL_NUMBER;
            if vertical && self.is_within_edge_tolerance(sweep.location, sweep.impact_point, radius)
            {
                skip_sweep = true;
                let walkable = self.is_walkable(sweep);
                result.set_from_sweep(*sweep, capsule_location.z - sweep.location.z, walkable);
                if walkable {
                    return result;
                }
            }
        }

        if sweep_distance < line_distance {
            return result;
        }

        let max_penetration_adjust = MAX_FLOOR_DIST.max(radius);
        if !skip_sweep && sweep_distance > 0.0 && sweep_radius > 0.0 {
            // A shorter capsule avoids starting on the surface and lets us
            // measure out of shallow penetrations.
            let mut shrink_height = (half_height - radius) * (1.0 - 0.9);
            let mut trace_dist = sweep_distance + shrink_height;
            let mut shape = CapsuleShape::new(sweep_radius, half_height - shrink_height);
            let mut hit = ctx.collision.sweep(
                &shape,
                capsule_location,
                capsule_location - Vector::new(0.0, 0.0, trace_dist),
            );
            if hit.blocking_hit {
                if hit.start_penetrating
                    || !self.is_within_edge_tolerance(capsule_location, hit.impact_point, shape.radius)
                {
                    let reduced_radius =
                        (shape.radius - SWEEP_EDGE_REJECT_DISTANCE - KINDA_SMALL_NUMBER).max(0.0);
                    let reduced = shape.with_radius(reduced_radius);
                    if !reduced.is_nearly_zero() {
                        shrink_height = (half_height - radius) * (1.0 - 0.1);
                        trace_dist = sweep_distance + shrink_height;
                        shape = CapsuleShape::new(
                            reduced_radius,
                            (half_height - shrink_height).max(reduced_radius),
                        );
                        hit = ctx.collision.sweep(
                            &shape,
                            capsule_location,
                            capsule_location - Vector::new(0.0, 0.0, trace_dist),
                        );
                    }
                }

                let sweep_result =
                    (-max_penetration_adjust).max(hit.time * trace_dist - shrink_height);
                result.set_from_sweep(hit, sweep_result, false);
                if hit.is_valid_blocking_hit()
                    && self.is_walkable(&hit)
                    && sweep_result <= sweep_distance
                {
                    result.walkable_floor = true;
                    return result;
                }
            }
        }

        // The sweep missed everything: a line trace cannot do better.
        if !result.blocking_hit && !result.hit.start_penetrating {
            result.floor_dist = sweep_distance;
            return result;
        }

        if line_distance > 0.0 {
            let trace_dist = line_distance + half_height;
            let hit = ctx.collision.line_trace(
                capsule_location,
                capsule_location - Vector::new(0.0, 0.0, trace_dist),
            );
            if hit.blocking_hit && hit.time > 0.0 {
                let line_result = (-max_penetration_adjust).max(hit.time * trace_dist - half_height);
                result.blocking_hit = true;
                if line_result <= line_distance && self.is_walkable(&hit) {
                    let floor_dist = result.floor_dist;
                    result.set_from_line_trace(hit, floor_dist, line_result, true);
                    return result;
                }
            }
        }

        result.walkable_floor = false;
        result.floor_dist = sweep_distance;
        result
    }

    /// Floor under the capsule at `capsule_location`, reusing the current
    /// floor when nothing moved and the base is a plain static surface.
    pub fn find_floor(
        &mut self,
        ctx: &MovementContext<'_>,
        capsule_location: Vector<Real>,
        zero_delta: bool,
        downward_sweep: Option<&HitResult>,
    ) -> FloorResult {
        let on_ground = self.is_moving_on_ground();
        let height_check_adjust = if on_ground {
            MAX_FLOOR_DIST + KINDA_SMALL_NUMBER
        } else {
            -MAX_FLOOR_DIST
        };
        let sweep_dist = MAX_FLOOR_DIST.max(self.config.max_step_height + height_check_adjust);
        let line_dist = sweep_dist;
        let radius = self.capsule.radius();
        let last_floor = self.current_floor;

        let mut need_to_validate = true;
        let mut result = FloorResult::default();
        if !zero_delta || self.force_next_floor_check || self.just_teleported {
            self.force_next_floor_check = false;
            result = self.compute_floor_dist(ctx, capsule_location, line_dist, sweep_dist, radius, downward_sweep);
        } else {
            let base_removed = match self.base {
                Some(base) => match ctx.collision.base_info(base) {
                    Some(info) => {
                        self.force_next_floor_check =
                            !info.query_enabled || !info.blocks_character || info.dynamic;
                        false
                    }
                    None => true,
                },
                None => false,
            };
            if !self.force_next_floor_check && !base_removed && self.base.is_some() {
                result = self.current_floor;
                need_to_validate = false;
            } else {
                self.force_next_floor_check = false;
                result = self.compute_floor_dist(ctx, capsule_location, line_dist, sweep_dist, radius, downward_sweep);
            }
        }

        if self.config.walking_collision_override
            && result.blocking_hit
            && result.floor_dist <= -MAX_FLOOR_DIST.max(radius)
        {
            // Deep negative results come from starting inside geometry the
            // walking override lets us stand in.
            trace!(floor_dist = result.floor_dist, "walking override kept previous floor");
            result = last_floor;
        }

        if need_to_validate
            && result.blocking_hit
            && !result.line_trace
            && self.should_compute_perch_result(&result.hit, true)
        {
            let mut max_perch_floor_dist =
                MAX_FLOOR_DIST.max(self.config.max_step_height + height_check_adjust);
            if on_ground {
                max_perch_floor_dist += self.config.perch_additional_height.max(0.0);
            }
            match self.compute_perch_result(ctx, self.valid_perch_radius(), &result.hit, max_perch_floor_dist) {
                Some(perch) => {
                    let move_up_dist = AVG_FLOOR_DIST - result.floor_dist;
                    if move_up_dist + perch.floor_dist >= max_perch_floor_dist {
                        result.floor_dist = AVG_FLOOR_DIST;
                    }
                    if !result.walkable_floor {
                        let floor_dist = result.floor_dist;
                        result.set_from_line_trace(
                            perch.hit,
                            floor_dist,
                            perch.floor_dist.min(perch.line_dist),
                            true,
                        );
                    }
                }
                None => result.walkable_floor = false,
            }
        }

        trace!(
            walkable = result.walkable_floor,
            blocking = result.blocking_hit,
            floor_dist = result.floor_dist,
            "find floor"
        );
        result
    }

    pub fn perch_radius_threshold(&self) -> Real {
        self.config.perch_radius_threshold.max(0.0)
    }

    pub fn valid_perch_radius(&self) -> Real {
        let radius = self.capsule.radius();
        (radius - self.perch_radius_threshold()).clamp(0.11, radius.max(0.11))
    }

    pub fn should_compute_perch_result(&self, hit: &HitResult, check_radius: bool) -> bool {
        if !hit.is_valid_blocking_hit() {
            return false;
        }
        if self.perch_radius_threshold() <= SWEEP_EDGE_REJECT_DISTANCE {
            return false;
        }
        if check_radius {
            let dist_sq = size_squared_2d(&(hit.impact_point - hit.location));
            let stand_on_edge_radius = self.valid_perch_radius();
            if dist_sq <= stand_on_edge_radius * stand_on_edge_radius {
                return false;
            }
        }
        true
    }

    /// Floor under a narrower capsule at the hit location, if it is walkable
    /// and close enough.
    pub fn compute_perch_result(
        &self,
        ctx: &MovementContext<'_>,
        test_radius: Real,
        hit: &HitResult,
        max_floor_dist: Real,
    ) -> Option<FloorResult> {
        if max_floor_dist <= 0.0 {
            return None;
        }
        let half_height = self.capsule.half_height();
        let hit_above_base = (hit.impact_point.z - (hit.location.z - half_height)).max(0.0);
        let perch_line_dist = (max_floor_dist - hit_above_base).max(0.0);
        let perch_sweep_dist = max_floor_dist.max(0.0) + self.capsule.radius();
        let mut perch = self.compute_floor_dist(
            ctx,
            hit.location,
            perch_line_dist,
            perch_sweep_dist,
            test_radius,
            None,
        );
        if !perch.is_walkable_floor() {
            return None;
        }
        if hit_above_base + perch.floor_dist > max_floor_dist {
            perch.walkable_floor = false;
            return None;
        }
        Some(perch)
    }

    /// Keeps the capsule hovering between the floor distance bounds.
    pub fn adjust_floor_height(&mut self, ctx: &MovementContext<'_>) {
        if !self.current_floor.is_walkable_floor() {
            return;
        }
        let mut old_floor_dist = self.current_floor.floor_dist;
        if self.current_floor.line_trace {
            if old_floor_dist < MIN_FLOOR_DIST && self.current_floor.line_dist >= MIN_FLOOR_DIST {
                // Moving up here would climb an unwalkable wall.
                return;
            }
            old_floor_dist = self.current_floor.line_dist;
        }

        if (MIN_FLOOR_DIST..=MAX_FLOOR_DIST).contains(&old_floor_dist) {
            return;
        }
        let initial_z = self.capsule.location().z;
        let move_dist = AVG_FLOOR_DIST - old_floor_dist;
        let hit = self.safe_move(ctx, Vector::new(0.0, 0.0, move_dist));
        if !hit.is_valid_blocking_hit() {
            self.current_floor.floor_dist += move_dist;
        } else if move_dist > 0.0 {
            self.current_floor.floor_dist += self.capsule.location().z - initial_z;
        } else {
            self.current_floor.floor_dist = self.capsule.location().z - hit.location.z;
            if self.is_walkable(&hit) {
                let floor_dist = self.current_floor.floor_dist;
                self.current_floor.set_from_sweep(hit, floor_dist, true);
            }
        }
        trace!(old_floor_dist, move_dist, "adjusted floor height");
        self.just_teleported |=
            !self.config.maintain_horizontal_ground_velocity || old_floor_dist < 0.0;
        self.force_next_floor_check = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floor_hit(normal: Vector<Real>, impact_point: Vector<Real>) -> HitResult {
        HitResult {
            blocking_hit: true,
            time: 0.5,
            location: Vector::new(0.0, 0.0, 90.0),
            impact_point,
            normal,
            impact_normal: normal,
            ..HitResult::default()
        }
    }

    #[test]
    fn walkable_requires_blocking_slope_under_limit() {
        let config = MovementConfig::default();
        let flat = floor_hit(Vector::z(), Vector::zeros());
        assert!(is_walkable(&config, &flat));

        let steep = floor_hit(Vector::new(0.8, 0.0, 0.6).normalize(), Vector::zeros());
        assert!(!is_walkable(&config, &steep));

        let wall = floor_hit(Vector::x(), Vector::zeros());
        assert!(!is_walkable(&config, &wall));

        let penetrating = HitResult {
            start_penetrating: true,
            ..flat
        };
        assert!(!is_walkable(&config, &penetrating));
    }

    #[test]
    fn edge_tolerance_rejects_rim_contacts() {
        let config = MovementConfig::default();
        let centre = Vector::new(0.0, 0.0, 88.0);
        assert!(is_within_edge_tolerance(&config, centre, Vector::new(33.0, 0.0, 0.0), 34.0));
        assert!(!is_within_edge_tolerance(&config, centre, Vector::new(33.995, 0.0, 0.0), 34.0));

        let flat = floor_hit(Vector::z(), Vector::new(33.995, 0.0, 0.0));
        assert!(is_walkable(&config, &flat));
        assert!(!is_walkable_floor_hit(&config, centre, &flat, 34.0));
    }

    #[test]
    fn line_trace_keeps_sweep_geometry() {
        let mut floor = FloorResult::default();
        let sweep = floor_hit(Vector::new(0.6, 0.0, 0.8), Vector::new(30.0, 0.0, 0.0));
        floor.set_from_sweep(sweep, 3.0, false);

        let line = HitResult {
            impact_point: Vector::new(0.0, 0.0, -1.0),
            time: 0.9,
            ..floor_hit(Vector::z(), Vector::new(0.0, 0.0, -1.0))
        };
        floor.set_from_line_trace(line, 3.0, 2.0, true);
        assert!(floor.line_trace);
        assert!(floor.is_walkable_floor());
        assert_eq!(floor.hit.impact_point, sweep.impact_point);
        assert_eq!(floor.hit.time, 0.5);
        assert_eq!(floor.hit.impact_normal, Vector::z());
        assert_eq!(floor.distance_to_floor(), 2.0);
    }
}
