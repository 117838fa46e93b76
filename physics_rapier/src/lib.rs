//! Rapier world wrapper shared by the movement, server and tooling crates.
//!
//! The world is Z-up and measured in centimetres. Besides static geometry it
//! tracks kinematic platforms (movement bases that move between ticks) and
//! fluid volumes (sensor colliders the swimming mode queries).
#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use rapier3d::parry::query::PointQuery;
use rapier3d::prelude::*;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FluidVolume {
    /// Friction applied to swimming velocity.
    pub friction: Real,
    /// World Z of the fluid surface.
    pub surface_z: Real,
}

#[derive(Clone, Copy, Debug)]
struct Platform {
    collider: ColliderHandle,
    velocity: Vector<Real>,
}

pub struct PhysicsWorld {
    pub gravity: Vector<Real>,
    integration_parameters: IntegrationParameters,
    pipeline: PhysicsPipeline,
    island_manager: IslandManager,
    broad_phase: BroadPhaseMultiSap,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    query_pipeline: QueryPipeline,
    platforms: HashMap<RigidBodyHandle, Platform>,
    fluids: HashMap<ColliderHandle, FluidVolume>,
    query_disabled: HashSet<ColliderHandle>,
    no_step_up: HashSet<ColliderHandle>,
}

impl PhysicsWorld {
    pub fn new(gravity: Vector<Real>) -> Self {
        Self {
            gravity,
            integration_parameters: IntegrationParameters::default(),
            pipeline: PhysicsPipeline::new(),
            island_manager: IslandManager::new(),
            broad_phase: BroadPhaseMultiSap::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            platforms: HashMap::new(),
            fluids: HashMap::new(),
            query_disabled: HashSet::new(),
            no_step_up: HashSet::new(),
        }
    }

    /// Default world: Z-up gravity in cm/s².
    pub fn z_up() -> Self {
        Self::new(vector![0.0, 0.0, -980.0])
    }

    pub fn bodies(&self) -> &RigidBodySet {
        &self.bodies
    }

    pub fn colliders(&self) -> &ColliderSet {
        &self.colliders
    }

    pub fn query_pipeline(&self) -> &QueryPipeline {
        &self.query_pipeline
    }

    pub fn step(&mut self, dt: Real) {
        self.integration_parameters.dt = dt;
        let physics_hooks = ();
        let event_handler = ();
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &physics_hooks,
            &event_handler,
        );
        self.query_pipeline.update(&self.colliders);
    }

    /// Rebuilds the query acceleration structure without advancing time.
    pub fn refresh_queries(&mut self) {
        self.query_pipeline.update(&self.colliders);
    }

    pub fn insert_static_collider(&mut self, collider: Collider) -> ColliderHandle {
        self.colliders.insert(collider)
    }

    /// Inserts a kinematic body carrying `collider`. Characters standing on it
    /// treat it as a dynamic movement base.
    pub fn insert_platform(
        &mut self,
        collider: Collider,
        translation: Vector<Real>,
    ) -> (RigidBodyHandle, ColliderHandle) {
        let body = RigidBodyBuilder::kinematic_position_based()
            .translation(translation)
            .build();
        let body_handle = self.bodies.insert(body);
        let collider_handle =
            self.colliders
                .insert_with_parent(collider, body_handle, &mut self.bodies);
        self.platforms.insert(
            body_handle,
            Platform {
                collider: collider_handle,
                velocity: Vector::zeros(),
            },
        );
        (body_handle, collider_handle)
    }

    /// Schedules the platform to reach `translation` at the end of the next
    /// `step(dt)` and records the implied velocity.
    pub fn move_platform(&mut self, body: RigidBodyHandle, translation: Vector<Real>, dt: Real) {
        let Some(rigid_body) = self.bodies.get_mut(body) else {
            return;
        };
        let current = *rigid_body.translation();
        rigid_body.set_next_kinematic_translation(translation);
        if let Some(platform) = self.platforms.get_mut(&body) {
            platform.velocity = if dt > 0.0 {
                (translation - current) / dt
            } else {
                Vector::zeros()
            };
        }
    }

    pub fn insert_fluid_volume(
        &mut self,
        half_extents: Vector<Real>,
        center: Vector<Real>,
        friction: Real,
    ) -> ColliderHandle {
        let collider = ColliderBuilder::cuboid(half_extents.x, half_extents.y, half_extents.z)
            .translation(center)
            .sensor(true)
            .build();
        let handle = self.colliders.insert(collider);
        self.fluids.insert(
            handle,
            FluidVolume {
                friction,
                surface_z: center.z + half_extents.z,
            },
        );
        handle
    }

    /// Fluid volume containing `point`, if any.
    pub fn fluid_at(&self, point: Point<Real>) -> Option<FluidVolume> {
        self.fluids.iter().find_map(|(handle, fluid)| {
            let collider = self.colliders.get(*handle)?;
            collider
                .shape()
                .contains_point(collider.position(), &point)
                .then_some(*fluid)
        })
    }

    pub fn is_fluid(&self, handle: ColliderHandle) -> bool {
        self.fluids.contains_key(&handle)
    }

    /// Removes a collider and, for platforms, its kinematic body. Handles held
    /// elsewhere stop resolving.
    pub fn remove_collider(&mut self, handle: ColliderHandle) {
        let platform_body = self
            .platforms
            .iter()
            .find(|(_, platform)| platform.collider == handle)
            .map(|(body, _)| *body);
        if let Some(body) = platform_body {
            self.platforms.remove(&body);
            self.bodies.remove(
                body,
                &mut self.island_manager,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                true,
            );
        } else {
            self.colliders
                .remove(handle, &mut self.island_manager, &mut self.bodies, true);
        }
        self.fluids.remove(&handle);
        self.query_disabled.remove(&handle);
        self.no_step_up.remove(&handle);
        self.query_pipeline.update(&self.colliders);
        debug!(collider = ?handle, "collider removed");
    }

    pub fn set_query_enabled(&mut self, handle: ColliderHandle, enabled: bool) {
        if enabled {
            self.query_disabled.remove(&handle);
        } else {
            self.query_disabled.insert(handle);
        }
    }

    pub fn is_query_enabled(&self, handle: ColliderHandle) -> bool {
        !self.query_disabled.contains(&handle)
    }

    /// Marks a collider as something characters may not step onto.
    pub fn set_can_step_up(&mut self, handle: ColliderHandle, can_step_up: bool) {
        if can_step_up {
            self.no_step_up.remove(&handle);
        } else {
            self.no_step_up.insert(handle);
        }
    }

    pub fn can_step_up(&self, handle: ColliderHandle) -> bool {
        !self.no_step_up.contains(&handle)
    }

    /// True when the collider belongs to a kinematic platform.
    pub fn is_dynamic(&self, handle: ColliderHandle) -> bool {
        self.platform_body(handle).is_some()
    }

    pub fn platform_body(&self, handle: ColliderHandle) -> Option<RigidBodyHandle> {
        let collider = self.colliders.get(handle)?;
        let parent = collider.parent()?;
        self.platforms.contains_key(&parent).then_some(parent)
    }

    pub fn collider_translation(&self, handle: ColliderHandle) -> Option<Vector<Real>> {
        self.colliders
            .get(handle)
            .map(|collider| collider.position().translation.vector)
    }

    pub fn collider_velocity(&self, handle: ColliderHandle) -> Vector<Real> {
        self.platform_body(handle)
            .and_then(|body| self.platforms.get(&body))
            .map(|platform| platform.velocity)
            .unwrap_or_else(Vector::zeros)
    }
}
