use std::path::{Path, PathBuf};

use rapier3d::prelude::Real;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MovementMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid movement config toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Every tunable of the movement integrator. Units are centimetres and
/// seconds, angles are degrees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    /// Minimum `normal.z` of a walkable surface.
    pub walkable_floor_z: Real,
    pub max_step_height: Real,
    pub perch_radius_threshold: Real,
    pub perch_additional_height: Real,
    pub edge_reject_distance: Real,
    pub ledge_check_threshold: Real,
    pub can_walk_off_ledges: bool,
    pub can_walk_off_ledges_when_crouching: bool,

    pub max_walk_speed: Real,
    pub max_walk_speed_crouched: Real,
    pub max_fly_speed: Real,
    pub max_swim_speed: Real,
    pub max_custom_move_speed: Real,
    pub max_acceleration: Real,
    pub ground_friction: Real,
    pub braking_deceleration_walking: Real,
    pub braking_deceleration_falling: Real,
    pub braking_deceleration_flying: Real,
    pub braking_deceleration_swimming: Real,
    pub braking_friction_factor: Real,
    pub braking_friction: Real,
    pub use_separate_braking_friction: bool,

    pub gravity_z: Real,
    pub gravity_scale: Real,
    pub terminal_velocity: Real,
    pub jump_z_velocity: Real,
    pub air_control: Real,
    pub air_control_boost_multiplier: Real,
    pub air_control_boost_velocity_threshold: Real,
    pub falling_lateral_friction: Real,
    pub impart_base_velocity: bool,

    pub fluid_friction: Real,
    pub buoyancy: Real,

    pub project_nav_mesh_walking: bool,
    pub nav_mesh_projection_height_scale_up: Real,
    pub nav_mesh_projection_height_scale_down: Real,
    pub sweep_while_nav_walking: bool,
    /// Mode used after landing: Walking or NavWalking.
    pub default_land_mode: MovementMode,

    pub max_simulation_time_step: Real,
    pub max_simulation_iterations: u32,
    pub max_depenetration: Real,

    pub crouched_half_height: Real,
    pub can_jump_while_crouched: bool,
    pub replicate_capsule_height: bool,

    pub maintain_horizontal_ground_velocity: bool,
    pub cheat_flying: bool,
    /// Keeps the previous floor when a sweep reports deep negative distance.
    pub walking_collision_override: bool,
    pub ditch_seed: u64,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            walkable_floor_z: 0.71,
            max_step_height: 45.0,
            perch_radius_threshold: 0.0,
            perch_additional_height: 40.0,
            edge_reject_distance: 0.01,
            ledge_check_threshold: 4.0,
            can_walk_off_ledges: true,
            can_walk_off_ledges_when_crouching: false,
            max_walk_speed: 600.0,
            max_walk_speed_crouched: 300.0,
            max_fly_speed: 600.0,
            max_swim_speed: 300.0,
            max_custom_move_speed: 600.0,
            max_acceleration: 2048.0,
            ground_friction: 8.0,
            braking_deceleration_walking: 2048.0,
            braking_deceleration_falling: 0.0,
            braking_deceleration_flying: 0.0,
            braking_deceleration_swimming: 0.0,
            braking_friction_factor: 2.0,
            braking_friction: 0.0,
            use_separate_braking_friction: false,
            gravity_z: -980.0,
            gravity_scale: 1.0,
            terminal_velocity: 4000.0,
            jump_z_velocity: 420.0,
            air_control: 0.05,
            air_control_boost_multiplier: 2.0,
            air_control_boost_velocity_threshold: 25.0,
            falling_lateral_friction: 0.0,
            impart_base_velocity: true,
            fluid_friction: 0.3,
            buoyancy: 1.0,
            project_nav_mesh_walking: false,
            nav_mesh_projection_height_scale_up: 0.67,
            nav_mesh_projection_height_scale_down: 1.0,
            sweep_while_nav_walking: true,
            default_land_mode: MovementMode::Walking,
            max_simulation_time_step: 0.05,
            max_simulation_iterations: 8,
            max_depenetration: 500.0,
            crouched_half_height: 40.0,
            can_jump_while_crouched: false,
            replicate_capsule_height: false,
            maintain_horizontal_ground_velocity: true,
            cheat_flying: false,
            walking_collision_override: false,
            ditch_seed: 0x5eed,
        }
    }
}

impl MovementConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Sets `walkable_floor_z` from a maximum slope angle in degrees.
    pub fn set_walkable_floor_angle(&mut self, degrees: Real) {
        self.walkable_floor_z = degrees.clamp(0.0, 90.0).to_radians().cos();
    }

    pub fn walkable_floor_angle(&self) -> Real {
        self.walkable_floor_z.clamp(-1.0, 1.0).acos().to_degrees()
    }

    pub fn gravity_z(&self) -> Real {
        self.gravity_z * self.gravity_scale
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_negative = [
            ("max_step_height", self.max_step_height),
            ("perch_radius_threshold", self.perch_radius_threshold),
            ("perch_additional_height", self.perch_additional_height),
            ("edge_reject_distance", self.edge_reject_distance),
            ("ledge_check_threshold", self.ledge_check_threshold),
            ("max_walk_speed", self.max_walk_speed),
            ("max_walk_speed_crouched", self.max_walk_speed_crouched),
            ("max_fly_speed", self.max_fly_speed),
            ("max_swim_speed", self.max_swim_speed),
            ("max_custom_move_speed", self.max_custom_move_speed),
            ("max_acceleration", self.max_acceleration),
            ("ground_friction", self.ground_friction),
            ("braking_deceleration_walking", self.braking_deceleration_walking),
            ("braking_deceleration_falling", self.braking_deceleration_falling),
            ("braking_deceleration_flying", self.braking_deceleration_flying),
            ("braking_deceleration_swimming", self.braking_deceleration_swimming),
            ("braking_friction_factor", self.braking_friction_factor),
            ("braking_friction", self.braking_friction),
            ("terminal_velocity", self.terminal_velocity),
            ("jump_z_velocity", self.jump_z_velocity),
            ("air_control", self.air_control),
            ("air_control_boost_multiplier", self.air_control_boost_multiplier),
            (
                "air_control_boost_velocity_threshold",
                self.air_control_boost_velocity_threshold,
            ),
            ("falling_lateral_friction", self.falling_lateral_friction),
            ("fluid_friction", self.fluid_friction),
            ("buoyancy", self.buoyancy),
            (
                "nav_mesh_projection_height_scale_up",
                self.nav_mesh_projection_height_scale_up,
            ),
            (
                "nav_mesh_projection_height_scale_down",
                self.nav_mesh_projection_height_scale_down,
            ),
            ("max_depenetration", self.max_depenetration),
        ];
        for (field, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, format!("expected a finite value >= 0, got {value}")));
            }
        }
        for (field, value) in [("gravity_z", self.gravity_z), ("gravity_scale", self.gravity_scale)] {
            if !value.is_finite() {
                return Err(invalid(field, format!("expected a finite value, got {value}")));
            }
        }
        if !(0.0..=1.0).contains(&self.walkable_floor_z) {
            return Err(invalid(
                "walkable_floor_z",
                format!("expected 0..=1, got {}", self.walkable_floor_z),
            ));
        }
        if !self.max_simulation_time_step.is_finite()
            || self.max_simulation_time_step < crate::MIN_TICK_TIME
            || self.max_simulation_time_step > 1.0
        {
            return Err(invalid(
                "max_simulation_time_step",
                format!("expected 1e-6..=1.0, got {}", self.max_simulation_time_step),
            ));
        }
        if !(1..=25).contains(&self.max_simulation_iterations) {
            return Err(invalid(
                "max_simulation_iterations",
                format!("expected 1..=25, got {}", self.max_simulation_iterations),
            ));
        }
        if !self.crouched_half_height.is_finite() || self.crouched_half_height <= 0.0 {
            return Err(invalid(
                "crouched_half_height",
                format!("expected a positive value, got {}", self.crouched_half_height),
            ));
        }
        if !self.default_land_mode.is_moving_on_ground() {
            return Err(invalid(
                "default_land_mode",
                format!("expected walking or nav_walking, got {:?}", self.default_land_mode),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        MovementConfig::default()
            .validate()
            .expect("default config is valid");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = MovementConfig::from_toml_str(
            r#"
max_step_height = 30.0
default_land_mode = "nav_walking"
ditch_seed = 7
"#,
        )
        .expect("parse");
        assert_eq!(config.max_step_height, 30.0);
        assert_eq!(config.default_land_mode, MovementMode::NavWalking);
        assert_eq!(config.ditch_seed, 7);
        assert_eq!(config.max_walk_speed, 600.0);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = MovementConfig::from_toml_str("walkable_floor_z = 1.5").expect_err("range");
        assert!(matches!(err, ConfigError::Invalid { field: "walkable_floor_z", .. }));

        let err = MovementConfig::from_toml_str("max_simulation_iterations = 0").expect_err("range");
        assert!(matches!(err, ConfigError::Invalid { field: "max_simulation_iterations", .. }));

        let err = MovementConfig::from_toml_str("max_step_height = \"tall\"").expect_err("type");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn walkable_angle_round_trips() {
        let mut config = MovementConfig::default();
        config.set_walkable_floor_angle(60.0);
        assert!((config.walkable_floor_z - 0.5).abs() < 1.0e-5);
        assert!((config.walkable_floor_angle() - 60.0).abs() < 1.0e-3);
    }
}
