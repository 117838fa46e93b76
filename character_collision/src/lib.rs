//! Collision and navigation queries consumed by character movement.
//!
//! Movement code only talks to [`CollisionQuery`] and [`NavigationQuery`];
//! [`RapierCollision`] answers them from a [`physics_rapier::PhysicsWorld`].
//! All coordinates are Z-up centimetres and capsules are always upright.
#![forbid(unsafe_code)]

mod nav;
mod rapier;

pub use nav::NavPlane;
pub use physics_rapier::FluidVolume;
pub use rapier::RapierCollision;

use rapier3d::math::Vector;
use rapier3d::prelude::{Capsule, ColliderHandle, Real};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CapsuleShape {
    pub radius: Real,
    /// Half height including the hemispherical caps; never below `radius`.
    pub half_height: Real,
}

impl CapsuleShape {
    pub fn new(radius: Real, half_height: Real) -> Self {
        let radius = radius.max(0.0);
        Self {
            radius,
            half_height: half_height.max(radius),
        }
    }

    pub fn with_half_height(self, half_height: Real) -> Self {
        Self::new(self.radius, half_height)
    }

    pub fn with_radius(self, radius: Real) -> Self {
        Self {
            radius: radius.max(0.0),
            half_height: self.half_height.max(radius),
        }
    }

    pub fn is_nearly_zero(&self) -> bool {
        self.radius <= 1.0e-4 && self.half_height <= 1.0e-4
    }

    pub fn to_capsule(&self) -> Capsule {
        Capsule::new_z((self.half_height - self.radius).max(0.0), self.radius)
    }
}

/// Weak reference to a collider that may be removed at any time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BaseHandle {
    pub index: u32,
    pub generation: u32,
}

impl From<ColliderHandle> for BaseHandle {
    fn from(handle: ColliderHandle) -> Self {
        let (index, generation) = handle.into_raw_parts();
        Self { index, generation }
    }
}

impl From<BaseHandle> for ColliderHandle {
    fn from(handle: BaseHandle) -> Self {
        ColliderHandle::from_raw_parts(handle.index, handle.generation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HitResult {
    pub blocking_hit: bool,
    pub start_penetrating: bool,
    /// Fraction of the trace travelled before the hit, 0..=1.
    pub time: Real,
    pub distance: Real,
    /// Shape centre at `time`.
    pub location: Vector<Real>,
    pub impact_point: Vector<Real>,
    /// Normal of the swept shape at the contact. Differs from
    /// `impact_normal` on edges and corners.
    pub normal: Vector<Real>,
    /// Normal of the surface that was hit.
    pub impact_normal: Vector<Real>,
    pub trace_start: Vector<Real>,
    pub trace_end: Vector<Real>,
    pub penetration_depth: Real,
    pub component: Option<BaseHandle>,
}

impl HitResult {
    /// A trace that travelled the whole way without hitting anything.
    pub fn new(start: Vector<Real>, end: Vector<Real>) -> Self {
        Self {
            blocking_hit: false,
            start_penetrating: false,
            time: 1.0,
            distance: (end - start).norm(),
            location: end,
            impact_point: end,
            normal: Vector::zeros(),
            impact_normal: Vector::zeros(),
            trace_start: start,
            trace_end: end,
            penetration_depth: 0.0,
            component: None,
        }
    }

    pub fn is_valid_blocking_hit(&self) -> bool {
        self.blocking_hit && !self.start_penetrating
    }

    pub fn reset(&mut self, time: Real) {
        *self = Self {
            time,
            ..Self::new(self.trace_start, self.trace_end)
        };
    }
}

impl Default for HitResult {
    fn default() -> Self {
        Self::new(Vector::zeros(), Vector::zeros())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Penetration {
    /// Direction that moves the shape out of the overlap.
    pub normal: Vector<Real>,
    pub depth: Real,
    pub component: Option<BaseHandle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BaseInfo {
    /// Moves between ticks (kinematic platform).
    pub dynamic: bool,
    pub query_enabled: bool,
    pub blocks_character: bool,
    pub can_step_up: bool,
}

/// Geometry services the integrator needs. Results must be deterministic for
/// identical inputs so that server replay matches client prediction.
pub trait CollisionQuery {
    /// Sweeps `shape` from `start` to `end` and reports the first blocking hit.
    /// Overlaps the move separates from are ignored.
    fn sweep(&self, shape: &CapsuleShape, start: Vector<Real>, end: Vector<Real>) -> HitResult;

    fn line_trace(&self, start: Vector<Real>, end: Vector<Real>) -> HitResult;

    fn overlap_blocking_test(&self, location: Vector<Real>, shape: &CapsuleShape) -> bool;

    /// Deepest overlap at `location`, if any.
    fn penetration(&self, location: Vector<Real>, shape: &CapsuleShape) -> Option<Penetration>;

    /// `None` once the object was removed.
    fn base_info(&self, base: BaseHandle) -> Option<BaseInfo>;

    fn base_location(&self, base: BaseHandle) -> Option<Vector<Real>>;

    fn base_velocity(&self, base: BaseHandle) -> Vector<Real>;

    fn fluid_at(&self, point: Vector<Real>) -> Option<FluidVolume>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NavLocation {
    pub location: Vector<Real>,
    /// `None` is an invalid nav node.
    pub node: Option<u64>,
}

pub trait NavigationQuery {
    fn find_nav_floor(&self, point: Vector<Real>) -> Option<NavLocation>;

    fn project_point_to_nav_mesh(
        &self,
        point: Vector<Real>,
        up_offset: Real,
        down_offset: Real,
    ) -> Option<Vector<Real>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capsule_half_height_never_below_radius() {
        let shape = CapsuleShape::new(34.0, 20.0);
        assert_eq!(shape.half_height, 34.0);
        let capsule = shape.to_capsule();
        assert_eq!(capsule.half_height(), 0.0);

        let crouched = CapsuleShape::new(34.0, 88.0).with_half_height(40.0);
        assert_eq!(crouched.half_height, 40.0);
        assert!((crouched.to_capsule().half_height() - 6.0).abs() < 1.0e-5);
    }

    #[test]
    fn base_handle_round_trips_collider_handle() {
        let handle = ColliderHandle::from_raw_parts(7, 3);
        let base = BaseHandle::from(handle);
        assert_eq!(base, BaseHandle { index: 7, generation: 3 });
        assert_eq!(ColliderHandle::from(base), handle);
    }

    #[test]
    fn miss_travels_full_trace() {
        let hit = HitResult::new(Vector::new(0.0, 0.0, 0.0), Vector::new(3.0, 4.0, 0.0));
        assert_eq!(hit.time, 1.0);
        assert_eq!(hit.distance, 5.0);
        assert!(!hit.is_valid_blocking_hit());
    }
}
