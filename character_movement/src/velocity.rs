use character_collision::HitResult;
use rapier3d::math::Vector;
use rapier3d::prelude::Real;

use crate::math::{clamp_max_size, is_zero, project_on_plane, safe_normal, safe_normal_2d, size_squared_2d};
use crate::{CharacterMovement, MovementMode, KINDA_SMALL_NUMBER, MIN_TICK_TIME, VERTICAL_SLOPE_NORMAL_Z};

const BRAKE_TO_STOP_VELOCITY: Real = 10.0;
const BRAKING_SUB_STEP_TIME: Real = 1.0 / 33.0;
const OVER_VELOCITY_PERCENT: Real = 1.01;

impl CharacterMovement {
    pub fn max_speed(&self) -> Real {
        let config = &self.config;
        match self.mode {
            MovementMode::Walking | MovementMode::NavWalking => {
                if self.crouched {
                    config.max_walk_speed_crouched
                } else {
                    config.max_walk_speed
                }
            }
            MovementMode::Falling => config.max_walk_speed,
            MovementMode::Swimming => config.max_swim_speed,
            MovementMode::Flying => config.max_fly_speed,
            MovementMode::Custom(_) => config.max_custom_move_speed,
            MovementMode::None => 0.0,
        }
    }

    pub fn max_braking_deceleration(&self) -> Real {
        let config = &self.config;
        match self.mode {
            MovementMode::Walking | MovementMode::NavWalking => config.braking_deceleration_walking,
            MovementMode::Falling => config.braking_deceleration_falling,
            MovementMode::Swimming => config.braking_deceleration_swimming,
            MovementMode::Flying => config.braking_deceleration_flying,
            MovementMode::Custom(_) | MovementMode::None => 0.0,
        }
    }

    pub fn is_exceeding_max_speed(&self, max_speed: Real) -> bool {
        let max_speed = max_speed.max(0.0);
        self.velocity.norm_squared() > max_speed * max_speed * OVER_VELOCITY_PERCENT
    }

    /// Integrates acceleration, friction and braking into `velocity`.
    pub fn calc_velocity(
        &mut self,
        dt: Real,
        friction: Real,
        fluid: bool,
        braking_deceleration: Real,
    ) {
        if dt < MIN_TICK_TIME {
            return;
        }
        let friction = friction.max(0.0);
        let max_accel = self.config.max_acceleration;
        let mut max_speed = self.max_speed();

        let requested = self.apply_requested_move(dt, max_accel, max_speed, friction);
        let (requested_accel, requested_speed) = requested.unwrap_or((Vector::zeros(), 0.0));

        let max_input_speed = max_speed * self.analog_input_modifier;
        max_speed = requested_speed.max(max_input_speed);

        let zero_accel = is_zero(&self.acceleration);
        let over_max = self.is_exceeding_max_speed(max_speed);

        if (zero_accel && requested.is_none()) || over_max {
            let old_velocity = self.velocity;
            let braking_friction = if self.config.use_separate_braking_friction {
                self.config.braking_friction
            } else {
                friction
            };
            self.apply_velocity_braking(dt, braking_friction, braking_deceleration);
            // Braking never takes us below max speed if we started above it.
            if over_max
                && self.velocity.norm_squared() < max_speed * max_speed
                && self.acceleration.dot(&old_velocity) > 0.0
            {
                self.velocity = safe_normal(old_velocity) * max_speed;
            }
        } else if !zero_accel {
            // Friction limits how quickly we change direction.
            let accel_dir = safe_normal(self.acceleration);
            let speed = self.velocity.norm();
            self.velocity -= (self.velocity - accel_dir * speed) * (dt * friction).min(1.0);
        }

        if fluid {
            self.velocity *= 1.0 - (friction * dt).min(1.0);
        }

        if !zero_accel {
            let new_max_input_speed = if self.is_exceeding_max_speed(max_input_speed) {
                self.velocity.norm()
            } else {
                max_input_speed
            };
            self.velocity += self.acceleration * dt;
            self.velocity = clamp_max_size(self.velocity, new_max_input_speed);
        }

        if requested.is_some() {
            let new_max_requested_speed = if self.is_exceeding_max_speed(requested_speed) {
                self.velocity.norm()
            } else {
                requested_speed
            };
            self.velocity += requested_accel * dt;
            self.velocity = clamp_max_size(self.velocity, new_max_requested_speed);
        }
    }

    /// Path-following velocity request. Returns the acceleration and speed it
    /// asks for.
    fn apply_requested_move(
        &mut self,
        dt: Real,
        max_accel: Real,
        max_speed: Real,
        friction: Real,
    ) -> Option<(Vector<Real>, Real)> {
        let requested = self.requested_velocity?;
        let speed_sq = requested.norm_squared();
        if speed_sq < KINDA_SMALL_NUMBER {
            return None;
        }
        let requested_speed_raw = speed_sq.sqrt();
        let move_dir = requested / requested_speed_raw;
        let requested_speed = max_speed.min(requested_speed_raw);
        let move_velocity = move_dir * requested_speed;

        let current_speed_sq = self.velocity.norm_squared();
        let mut acceleration = Vector::zeros();
        if current_speed_sq < requested_speed * requested_speed * OVER_VELOCITY_PERCENT {
            let speed = current_speed_sq.sqrt();
            self.velocity -= (self.velocity - move_dir * speed) * (dt * friction).min(1.0);
            acceleration = clamp_max_size((move_velocity - self.velocity) / dt, max_accel);
        } else {
            // Decelerate instantly so we do not overshoot the destination.
            self.velocity = move_velocity;
        }
        Some((acceleration, requested_speed))
    }

    pub fn apply_velocity_braking(&mut self, dt: Real, friction: Real, braking_deceleration: Real) {
        if is_zero(&self.velocity) || dt < MIN_TICK_TIME {
            return;
        }
        let friction = (friction * self.config.braking_friction_factor.max(0.0)).max(0.0);
        let braking_deceleration = braking_deceleration.max(0.0);
        let zero_friction = friction == 0.0;
        let zero_braking = braking_deceleration == 0.0;
        if zero_friction && zero_braking {
            return;
        }

        let old_velocity = self.velocity;
        let reverse_accel = if zero_braking {
            Vector::zeros()
        } else {
            safe_normal(self.velocity) * -braking_deceleration
        };
        let mut remaining = dt;
        while remaining >= MIN_TICK_TIME {
            // Constant deceleration needs no sub-stepping.
            let step = if remaining > BRAKING_SUB_STEP_TIME && !zero_friction {
                BRAKING_SUB_STEP_TIME.min(remaining * 0.5)
            } else {
                remaining
            };
            remaining -= step;
            self.velocity += (self.velocity * -friction + reverse_accel) * step;
            if self.velocity.dot(&old_velocity) <= 0.0 {
                self.velocity = Vector::zeros();
                return;
            }
        }

        let speed_sq = self.velocity.norm_squared();
        if speed_sq <= KINDA_SMALL_NUMBER
            || (!zero_braking && speed_sq <= BRAKE_TO_STOP_VELOCITY * BRAKE_TO_STOP_VELOCITY)
        {
            self.velocity = Vector::zeros();
        }
    }

    pub fn gravity(&self) -> Vector<Real> {
        Vector::new(0.0, 0.0, self.config.gravity_z())
    }

    /// Applies gravity, clamped to terminal velocity along the gravity
    /// direction.
    pub fn new_fall_velocity(
        &self,
        initial: Vector<Real>,
        gravity: Vector<Real>,
        dt: Real,
    ) -> Vector<Real> {
        let mut result = initial;
        if dt > 0.0 {
            result += gravity * dt;
            let terminal = self.config.terminal_velocity.abs();
            if result.norm_squared() > terminal * terminal {
                let gravity_dir = safe_normal(gravity);
                if result.dot(&gravity_dir) > terminal {
                    result = project_on_plane(result, gravity_dir) + gravity_dir * terminal;
                }
            }
        }
        result
    }

    /// Lateral acceleration while falling, scaled by air control.
    pub fn falling_lateral_acceleration(&self) -> Vector<Real> {
        let mut fall_accel = Vector::new(self.acceleration.x, self.acceleration.y, 0.0);
        if size_squared_2d(&fall_accel) > 0.0 {
            let mut air_control = self.config.air_control;
            if air_control != 0.0 {
                let threshold = self.config.air_control_boost_velocity_threshold;
                if size_squared_2d(&self.velocity) < threshold * threshold {
                    air_control = (self.config.air_control_boost_multiplier * air_control).min(1.0);
                }
            }
            fall_accel = clamp_max_size(fall_accel * air_control, self.config.max_acceleration);
        }
        fall_accel
    }

    /// Stops air control from pushing into walls we can't stand on.
    pub fn limit_air_control(&self, fall_accel: Vector<Real>, hit: &HitResult) -> Vector<Real> {
        let mut result = fall_accel;
        if hit.is_valid_blocking_hit() && hit.normal.z > VERTICAL_SLOPE_NORMAL_Z {
            if fall_accel.dot(&hit.normal) < 0.0 {
                // Parallel to the wall is fine, into it may push us up.
                result = project_on_plane(fall_accel, safe_normal_2d(hit.normal));
            }
        } else if hit.start_penetrating {
            return if result.dot(&hit.normal) > 0.0 {
                result
            } else {
                Vector::zeros()
            };
        }
        result
    }

    pub fn maintain_horizontal_ground_velocity(&mut self) {
        if self.velocity.z != 0.0 {
            if self.config.maintain_horizontal_ground_velocity {
                self.velocity.z = 0.0;
            } else {
                self.velocity = safe_normal_2d(self.velocity) * self.velocity.norm();
            }
        }
    }

    /// Folds this tick's head motion into the velocity for the sub-step.
    pub fn apply_vr_motion_to_velocity(&mut self) {
        self.velocity += self.vr_input_velocity;
    }

    pub fn restore_pre_additive_vr_motion_velocity(&mut self) {
        self.velocity -= self.vr_input_velocity;
    }
}
