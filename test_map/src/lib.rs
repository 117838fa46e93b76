//! Test scene format: parsing, validation, expansion and loading into a
//! [`PhysicsWorld`].
//!
//! Scenes are Z-up and measured in centimetres. Solids are static, platforms
//! are kinematic bodies swinging between two points, fluids are sensor
//! volumes.
#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use physics_rapier::PhysicsWorld;
use rapier3d::math::{Point, Vector};
use rapier3d::prelude::{ColliderBuilder, ColliderHandle, Real, RigidBodyHandle};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Built-in scene used when no map file is given.
pub const PROVING_GROUND: &str = include_str!("../maps/proving_ground.toml");

#[derive(Debug, Error)]
pub enum TestMapError {
    #[error("failed to read test map {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse test map: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid test map: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct TestMap {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub spawn: Spawn,
    #[serde(default)]
    pub solids: Vec<SolidSpec>,
    #[serde(default)]
    pub generators: Vec<GeneratorSpec>,
    #[serde(default)]
    pub platforms: Vec<PlatformSpec>,
    #[serde(default)]
    pub fluids: Vec<FluidSpec>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
pub struct Spawn {
    /// Actor origin, at the feet.
    #[serde(default)]
    pub pos: [f32; 3],
    #[serde(default)]
    pub yaw_deg: f32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SolidSpec {
    pub id: String,
    pub kind: SolidKind,
    /// Box centre, or the bottom centre of a ramp's footprint.
    pub pos: [f32; 3],
    #[serde(default)]
    pub size: Option<[f32; 3]>,
    #[serde(default)]
    pub yaw_deg: Option<f32>,
    #[serde(default)]
    pub angle_deg: Option<f32>,
    #[serde(default)]
    pub length: Option<f32>,
    #[serde(default)]
    pub width: Option<f32>,
    #[serde(default = "default_can_step_up")]
    pub can_step_up: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SolidKind {
    Box,
    Ramp,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorSpec {
    Stairs {
        id: String,
        pos: [f32; 3],
        #[serde(default)]
        yaw_deg: f32,
        step_count: u32,
        step_rise: f32,
        step_run: f32,
        width: f32,
        #[serde(default = "default_stairs_variant_gap")]
        variant_gap: f32,
        #[serde(default)]
        variants: Vec<StairsVariant>,
    },
    Ramps {
        id: String,
        pos: [f32; 3],
        #[serde(default)]
        yaw_deg: f32,
        width: f32,
        length: f32,
        angles_deg: Vec<f32>,
        #[serde(default = "default_ramp_gap")]
        gap: f32,
    },
}

#[derive(Clone, Debug, Deserialize)]
pub struct StairsVariant {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub step_count: Option<u32>,
    #[serde(default)]
    pub step_rise: Option<f32>,
    #[serde(default)]
    pub step_run: Option<f32>,
    #[serde(default)]
    pub width: Option<f32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PlatformSpec {
    pub id: String,
    /// Centre at rest.
    pub pos: [f32; 3],
    pub size: [f32; 3],
    /// Offset of the far end of the platform's path.
    #[serde(default)]
    pub travel: [f32; 3],
    /// Seconds for a full out-and-back cycle. Zero keeps the platform still.
    #[serde(default)]
    pub period: f32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FluidSpec {
    pub id: String,
    pub pos: [f32; 3],
    pub size: [f32; 3],
    #[serde(default = "default_fluid_friction")]
    pub friction: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedSolid {
    pub id: String,
    pub kind: SolidKind,
    pub pos: [f32; 3],
    /// Full extents; for ramps `[length, width, height]`.
    pub size: [f32; 3],
    pub yaw_deg: f32,
    pub can_step_up: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TestMapValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl TestMapValidation {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A platform inserted into a world, with the path it follows.
#[derive(Clone, Debug)]
pub struct LoadedPlatform {
    pub id: String,
    pub body: RigidBodyHandle,
    pub collider: ColliderHandle,
    pub origin: Vector<Real>,
    pub travel: Vector<Real>,
    pub period: Real,
}

impl LoadedPlatform {
    /// Ping-pong position at `time`.
    pub fn position_at(&self, time: Real) -> Vector<Real> {
        if self.period <= 0.0 {
            return self.origin;
        }
        let phase = (time / self.period).rem_euclid(1.0);
        let along = if phase < 0.5 {
            phase * 2.0
        } else {
            2.0 - phase * 2.0
        };
        self.origin + self.travel * along
    }
}

/// What [`TestMap::load_into`] put into the world.
#[derive(Clone, Debug, Default)]
pub struct LoadedMap {
    pub spawn_origin: Vector<Real>,
    pub spawn_yaw: Real,
    pub solids: Vec<ColliderHandle>,
    pub platforms: Vec<LoadedPlatform>,
    pub fluids: Vec<ColliderHandle>,
}

impl LoadedMap {
    /// Queues every platform's position for the end of the next `dt` step.
    pub fn drive_platforms(&self, world: &mut PhysicsWorld, time: Real, dt: Real) {
        for platform in &self.platforms {
            world.move_platform(platform.body, platform.position_at(time + dt), dt);
        }
    }
}

impl TestMap {
    pub fn parse_toml(text: &str) -> Result<Self, TestMapError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TestMapError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TestMapError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_toml(&text)
    }

    pub fn proving_ground() -> Result<Self, TestMapError> {
        Self::parse_toml(PROVING_GROUND)
    }

    pub fn validate(&self) -> TestMapValidation {
        let mut validation = TestMapValidation::default();
        if self.version != 1 {
            validation
                .errors
                .push(format!("unsupported version {}", self.version));
        }
        if !vector_is_finite(self.spawn.pos) || !self.spawn.yaw_deg.is_finite() {
            validation.errors.push("spawn must be finite".to_string());
        }
        if self.solids.is_empty() && self.generators.is_empty() && self.platforms.is_empty() {
            validation
                .warnings
                .push("test map has nothing to stand on".to_string());
        }
        for solid in &self.solids {
            validate_solid(solid, &mut validation);
        }
        for generator in &self.generators {
            validate_generator(generator, &mut validation);
        }
        for platform in &self.platforms {
            if !vector_is_finite(platform.pos)
                || !vector_is_finite(platform.travel)
                || !extents_are_positive(platform.size)
            {
                validation
                    .errors
                    .push(format!("platform '{}' has invalid geometry", platform.id));
            }
            if !platform.period.is_finite() || platform.period < 0.0 {
                validation
                    .errors
                    .push(format!("platform '{}' period must be >= 0", platform.id));
            }
        }
        for fluid in &self.fluids {
            if !vector_is_finite(fluid.pos) || !extents_are_positive(fluid.size) {
                validation
                    .errors
                    .push(format!("fluid '{}' has invalid geometry", fluid.id));
            }
            if !fluid.friction.is_finite() || fluid.friction < 0.0 {
                validation
                    .errors
                    .push(format!("fluid '{}' friction must be >= 0", fluid.id));
            }
        }
        validation
    }

    pub fn expanded_solids(&self) -> Result<Vec<ResolvedSolid>, TestMapError> {
        let validation = self.validate();
        if !validation.is_ok() {
            return Err(TestMapError::Invalid(validation.errors.join("; ")));
        }
        let mut solids = Vec::new();
        for solid in &self.solids {
            solids.push(solid.resolve()?);
        }
        for generator in &self.generators {
            solids.extend(generator.expand());
        }
        let mut seen = HashSet::new();
        let ids = solids
            .iter()
            .map(|solid| solid.id.as_str())
            .chain(self.platforms.iter().map(|platform| platform.id.as_str()))
            .chain(self.fluids.iter().map(|fluid| fluid.id.as_str()));
        for id in ids {
            if !seen.insert(id) {
                return Err(TestMapError::Invalid(format!("duplicate id '{id}'")));
            }
        }
        Ok(solids)
    }

    /// Inserts the whole scene into `world` and refreshes its queries.
    pub fn load_into(&self, world: &mut PhysicsWorld) -> Result<LoadedMap, TestMapError> {
        let validation = self.validate();
        for warning in &validation.warnings {
            warn!(map = %self.name, "{warning}");
        }
        let solids = self.expanded_solids()?;

        let mut loaded = LoadedMap {
            spawn_origin: to_vector(self.spawn.pos),
            spawn_yaw: self.spawn.yaw_deg,
            ..LoadedMap::default()
        };
        for solid in &solids {
            let handle = world.insert_static_collider(solid_collider(solid)?);
            if !solid.can_step_up {
                world.set_can_step_up(handle, false);
            }
            loaded.solids.push(handle);
        }
        for platform in &self.platforms {
            let half = to_vector(platform.size) * 0.5;
            let origin = to_vector(platform.pos);
            let (body, collider) =
                world.insert_platform(ColliderBuilder::cuboid(half.x, half.y, half.z).build(), origin);
            loaded.platforms.push(LoadedPlatform {
                id: platform.id.clone(),
                body,
                collider,
                origin,
                travel: to_vector(platform.travel),
                period: platform.period,
            });
        }
        for fluid in &self.fluids {
            let handle = world.insert_fluid_volume(
                to_vector(fluid.size) * 0.5,
                to_vector(fluid.pos),
                fluid.friction,
            );
            loaded.fluids.push(handle);
        }
        world.refresh_queries();
        debug!(
            map = %self.name,
            solids = loaded.solids.len(),
            platforms = loaded.platforms.len(),
            fluids = loaded.fluids.len(),
            "test map loaded"
        );
        Ok(loaded)
    }
}

impl SolidSpec {
    fn resolve(&self) -> Result<ResolvedSolid, TestMapError> {
        let size = self
            .effective_size()
            .ok_or_else(|| TestMapError::Invalid(format!("solid '{}' missing size", self.id)))?;
        Ok(ResolvedSolid {
            id: self.id.clone(),
            kind: self.kind,
            pos: self.pos,
            size,
            yaw_deg: self.yaw_deg.unwrap_or(0.0),
            can_step_up: self.can_step_up,
        })
    }

    fn effective_size(&self) -> Option<[f32; 3]> {
        if let Some(size) = self.size {
            return Some(size);
        }
        if self.kind == SolidKind::Ramp {
            if let (Some(length), Some(width), Some(angle)) =
                (self.length, self.width, self.angle_deg)
            {
                let height = angle.to_radians().tan() * length;
                return Some([length, width, height]);
            }
        }
        None
    }
}

impl GeneratorSpec {
    fn expand(&self) -> Vec<ResolvedSolid> {
        match self {
            GeneratorSpec::Stairs {
                id,
                pos,
                yaw_deg,
                step_count,
                step_rise,
                step_run,
                width,
                variant_gap,
                variants,
            } => build_stairs(
                StairsParams {
                    base_id: id,
                    pos: *pos,
                    yaw_deg: *yaw_deg,
                    step_count: *step_count,
                    step_rise: *step_rise,
                    step_run: *step_run,
                    width: *width,
                },
                *variant_gap,
                variants,
            ),
            GeneratorSpec::Ramps {
                id,
                pos,
                yaw_deg,
                width,
                length,
                angles_deg,
                gap,
            } => build_ramps(id, *pos, *yaw_deg, *width, *length, angles_deg, *gap),
        }
    }
}

fn validate_solid(solid: &SolidSpec, validation: &mut TestMapValidation) {
    if solid.id.trim().is_empty() {
        validation
            .errors
            .push("solid id must not be empty".to_string());
    }
    if !vector_is_finite(solid.pos) {
        validation
            .errors
            .push(format!("solid '{}' has invalid pos", solid.id));
    }
    match solid.effective_size() {
        Some(size) if extents_are_positive(size) => {}
        Some(_) => validation
            .errors
            .push(format!("solid '{}' has invalid size", solid.id)),
        None => validation
            .errors
            .push(format!("solid '{}' missing size or ramp dimensions", solid.id)),
    }
    if let Some(angle) = solid.angle_deg {
        if angle <= 0.0 || angle >= 89.0 {
            validation.errors.push(format!(
                "solid '{}' ramp angle_deg must be between 0 and 89",
                solid.id
            ));
        }
    }
}

fn validate_generator(generator: &GeneratorSpec, validation: &mut TestMapValidation) {
    match generator {
        GeneratorSpec::Stairs {
            id,
            step_count,
            step_rise,
            step_run,
            width,
            variant_gap,
            ..
        } => {
            if id.trim().is_empty() {
                validation
                    .errors
                    .push("stairs generator id must not be empty".to_string());
            }
            if *step_count == 0 {
                validation
                    .errors
                    .push(format!("stairs '{}' step_count must be > 0", id));
            }
            if *step_rise <= 0.0 || *step_run <= 0.0 || *width <= 0.0 {
                validation
                    .errors
                    .push(format!("stairs '{}' dimensions must be > 0", id));
            }
            if *variant_gap < 0.0 {
                validation
                    .errors
                    .push(format!("stairs '{}' variant_gap must be >= 0", id));
            }
        }
        GeneratorSpec::Ramps {
            id,
            width,
            length,
            angles_deg,
            ..
        } => {
            if id.trim().is_empty() {
                validation
                    .errors
                    .push("ramps generator id must not be empty".to_string());
            }
            if *width <= 0.0 || *length <= 0.0 {
                validation
                    .errors
                    .push(format!("ramps '{}' dimensions must be > 0", id));
            }
            if angles_deg.is_empty() {
                validation
                    .errors
                    .push(format!("ramps '{}' angles_deg must not be empty", id));
            }
            if angles_deg
                .iter()
                .any(|angle| *angle <= 0.0 || *angle >= 89.0)
            {
                validation
                    .errors
                    .push(format!("ramps '{}' angle out of range", id));
            }
        }
    }
}

struct StairsParams<'a> {
    base_id: &'a str,
    pos: [f32; 3],
    yaw_deg: f32,
    step_count: u32,
    step_rise: f32,
    step_run: f32,
    width: f32,
}

/// The base flight at `pos`, then each variant beside it along local +Y.
fn build_stairs(
    params: StairsParams<'_>,
    variant_gap: f32,
    variants: &[StairsVariant],
) -> Vec<ResolvedSolid> {
    let yaw = params.yaw_deg.to_radians();
    let side = rotate_z([0.0, 1.0, 0.0], yaw);
    let mut solids = stairs_flight(&params, "base");
    let mut offset = 0.0;
    let mut previous_width = params.width;
    for (index, variant) in variants.iter().enumerate() {
        let width = variant.width.unwrap_or(params.width);
        offset += previous_width * 0.5 + variant_gap + width * 0.5;
        previous_width = width;
        let label = variant
            .id
            .clone()
            .unwrap_or_else(|| format!("variant_{}", index + 1));
        solids.extend(stairs_flight(
            &StairsParams {
                base_id: params.base_id,
                pos: add(params.pos, scale(side, offset)),
                yaw_deg: params.yaw_deg,
                step_count: variant.step_count.unwrap_or(params.step_count),
                step_rise: variant.step_rise.unwrap_or(params.step_rise),
                step_run: variant.step_run.unwrap_or(params.step_run),
                width,
            },
            &label,
        ));
    }
    solids
}

/// Solid blocks rising along local +X from the front edge at `pos`.
fn stairs_flight(params: &StairsParams<'_>, label: &str) -> Vec<ResolvedSolid> {
    let yaw = params.yaw_deg.to_radians();
    (0..params.step_count)
        .map(|index| {
            let height = params.step_rise * (index + 1) as f32;
            let local = [params.step_run * (index as f32 + 0.5), 0.0, height * 0.5];
            ResolvedSolid {
                id: format!("{}/{}/step_{:02}", params.base_id, label, index + 1),
                kind: SolidKind::Box,
                pos: add(params.pos, rotate_z(local, yaw)),
                size: [params.step_run, params.width, height],
                yaw_deg: params.yaw_deg,
                can_step_up: true,
            }
        })
        .collect()
}

fn build_ramps(
    base_id: &str,
    pos: [f32; 3],
    yaw_deg: f32,
    width: f32,
    length: f32,
    angles_deg: &[f32],
    gap: f32,
) -> Vec<ResolvedSolid> {
    let yaw = yaw_deg.to_radians();
    angles_deg
        .iter()
        .enumerate()
        .map(|(index, angle)| {
            let local = [0.0, (width + gap) * index as f32, 0.0];
            ResolvedSolid {
                id: format!("{}/ramp_{:02}", base_id, index + 1),
                kind: SolidKind::Ramp,
                pos: add(pos, rotate_z(local, yaw)),
                size: [length, width, angle.to_radians().tan() * length],
                yaw_deg,
                can_step_up: true,
            }
        })
        .collect()
}

fn solid_collider(solid: &ResolvedSolid) -> Result<rapier3d::prelude::Collider, TestMapError> {
    let half = to_vector(solid.size) * 0.5;
    let builder = match solid.kind {
        SolidKind::Box => ColliderBuilder::cuboid(half.x, half.y, half.z),
        SolidKind::Ramp => {
            // Wedge rising along +X from the bottom of the footprint.
            let points = [
                Point::new(-half.x, -half.y, 0.0),
                Point::new(-half.x, half.y, 0.0),
                Point::new(half.x, -half.y, 0.0),
                Point::new(half.x, half.y, 0.0),
                Point::new(half.x, -half.y, solid.size[2]),
                Point::new(half.x, half.y, solid.size[2]),
            ];
            ColliderBuilder::convex_hull(&points).ok_or_else(|| {
                TestMapError::Invalid(format!("ramp '{}' is degenerate", solid.id))
            })?
        }
    };
    Ok(builder
        .translation(to_vector(solid.pos))
        .rotation(Vector::z() * solid.yaw_deg.to_radians())
        .build())
}

fn rotate_z(value: [f32; 3], yaw: f32) -> [f32; 3] {
    let (sin, cos) = yaw.sin_cos();
    [
        value[0] * cos - value[1] * sin,
        value[0] * sin + value[1] * cos,
        value[2],
    ]
}

fn add(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn scale(value: [f32; 3], factor: f32) -> [f32; 3] {
    [value[0] * factor, value[1] * factor, value[2] * factor]
}

fn to_vector(value: [f32; 3]) -> Vector<Real> {
    Vector::new(value[0], value[1], value[2])
}

fn vector_is_finite(value: [f32; 3]) -> bool {
    value.iter().all(|component| component.is_finite())
}

fn extents_are_positive(value: [f32; 3]) -> bool {
    vector_is_finite(value) && value.iter().all(|component| *component > 0.0)
}

fn default_can_step_up() -> bool {
    true
}

fn default_stairs_variant_gap() -> f32 {
    100.0
}

fn default_ramp_gap() -> f32 {
    50.0
}

fn default_fluid_friction() -> f32 {
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
version = 1
name = "test"

[spawn]
pos = [0.0, 0.0, 2.0]
yaw_deg = 90.0

[[solids]]
id = "floor"
kind = "box"
pos = [0.0, 0.0, -10.0]
size = [2000.0, 2000.0, 20.0]

[[fluids]]
id = "pool"
pos = [500.0, 0.0, 50.0]
size = [200.0, 200.0, 100.0]
"#;

    #[test]
    fn parse_basic_map() {
        let map = TestMap::parse_toml(BASIC).expect("parse");
        let solids = map.expanded_solids().expect("expand");
        assert_eq!(solids.len(), 1);
        assert_eq!(solids[0].id, "floor");
        assert_eq!(map.spawn.yaw_deg, 90.0);
        assert_eq!(map.fluids[0].friction, 0.5);
    }

    #[test]
    fn stairs_are_solid_blocks() {
        let text = r#"
version = 1
name = "stairs"

[[generators]]
kind = "stairs"
id = "flight"
pos = [100.0, 0.0, 0.0]
step_count = 3
step_rise = 20.0
step_run = 30.0
width = 120.0
variants = [{ id = "steep", step_rise = 45.0 }]
"#;
        let map = TestMap::parse_toml(text).expect("parse");
        let solids = map.expanded_solids().expect("expand");
        assert_eq!(solids.len(), 6);
        let top = &solids[2];
        assert_eq!(top.id, "flight/base/step_03");
        assert_eq!(top.size, [30.0, 120.0, 60.0]);
        assert_eq!(top.pos, [175.0, 0.0, 30.0]);
        let steep = &solids[3];
        assert_eq!(steep.id, "flight/steep/step_01");
        assert_eq!(steep.pos[1], 220.0);
        assert_eq!(steep.size[2], 45.0);
    }

    #[test]
    fn invalid_maps_are_reported() {
        let text = r#"
version = 2
name = "broken"

[[solids]]
id = "wedge"
kind = "ramp"
pos = [0.0, 0.0, 0.0]
length = 100.0
width = 50.0
angle_deg = 95.0

[[platforms]]
id = "lift"
pos = [0.0, 0.0, 0.0]
size = [100.0, 100.0, 0.0]
"#;
        let map = TestMap::parse_toml(text).expect("parse");
        let validation = map.validate();
        assert_eq!(validation.errors.len(), 4);
        assert!(matches!(
            map.load_into(&mut PhysicsWorld::z_up()),
            Err(TestMapError::Invalid(_))
        ));
        assert!(matches!(
            TestMap::parse_toml("version = \"one\""),
            Err(TestMapError::Parse(_))
        ));
        assert!(matches!(
            TestMap::load("/nonexistent/map.toml"),
            Err(TestMapError::Io { .. })
        ));
    }

    #[test]
    fn duplicate_ids_across_sections_are_rejected() {
        let text = format!(
            "{BASIC}\n[[platforms]]\nid = \"floor\"\npos = [0.0, 0.0, 0.0]\nsize = [10.0, 10.0, 10.0]\n"
        );
        let map = TestMap::parse_toml(&text).expect("parse");
        assert!(matches!(
            map.expanded_solids(),
            Err(TestMapError::Invalid(message)) if message.contains("floor")
        ));
    }

    #[test]
    fn load_into_builds_the_world() {
        let map = TestMap::parse_toml(BASIC).expect("parse");
        let mut world = PhysicsWorld::z_up();
        let loaded = map.load_into(&mut world).expect("load");
        assert_eq!(loaded.solids.len(), 1);
        assert_eq!(loaded.spawn_origin, Vector::new(0.0, 0.0, 2.0));
        assert!(world.fluid_at(Point::new(500.0, 0.0, 50.0)).is_some());
        assert!(world.fluid_at(Point::new(0.0, 0.0, 50.0)).is_none());
    }

    #[test]
    fn platforms_swing_back_and_forth() {
        let platform = LoadedPlatform {
            id: "lift".to_string(),
            body: RigidBodyHandle::invalid(),
            collider: ColliderHandle::invalid(),
            origin: Vector::new(0.0, 0.0, 100.0),
            travel: Vector::new(0.0, 0.0, 200.0),
            period: 4.0,
        };
        assert_eq!(platform.position_at(0.0).z, 100.0);
        assert_eq!(platform.position_at(1.0).z, 200.0);
        assert_eq!(platform.position_at(2.0).z, 300.0);
        assert_eq!(platform.position_at(3.0).z, 200.0);
        assert_eq!(platform.position_at(4.0).z, 100.0);
    }

    #[test]
    fn proving_ground_loads() {
        let map = TestMap::proving_ground().expect("parse");
        assert!(map.validate().is_ok());
        let mut world = PhysicsWorld::z_up();
        let loaded = map.load_into(&mut world).expect("load");
        assert!(!loaded.solids.is_empty());
        assert_eq!(loaded.platforms.len(), 1);
    }
}
