use physics_rapier::{FluidVolume, PhysicsWorld};
use rapier3d::math::{Isometry, Point, Vector};
use rapier3d::parry::bounding_volume::BoundingVolume;
use rapier3d::parry::query::{self as parry_query, Contact, RayCast, ShapeCastOptions};
use rapier3d::prelude::{Capsule, Collider, ColliderHandle, QueryFilter, Ray, Real};
use tracing::trace;

use crate::{BaseHandle, BaseInfo, CapsuleShape, CollisionQuery, HitResult, Penetration};

/// Minimum separation kept from a surface after a blocked sweep.
const SWEEP_SKIN: Real = 0.01;
/// Overlaps shallower than this count as touching.
const PENETRATION_TOLERANCE: Real = 1.0e-3;
/// Contacts this close to the start pose are candidates for initial overlap.
const TOUCH_DISTANCE: Real = SWEEP_SKIN * 0.5;
const CONTACT_PREDICTION: Real = 1.0;
const KINDA_SMALL: Real = 1.0e-4;
const FACE_RAY_DISTANCE: Real = 1.0;
const FACE_RAY_NUDGE: Real = 0.05;
/// Contact geometry is read this far back along the sweep so the shapes are
/// separated and the closest features are well defined.
const SURFACE_BACKOFF: Real = 0.1;

/// [`CollisionQuery`] over a borrowed [`PhysicsWorld`]. Sensors, fluid volumes
/// and colliders with queries disabled never block.
pub struct RapierCollision<'w> {
    world: &'w PhysicsWorld,
}

impl<'w> RapierCollision<'w> {
    pub fn new(world: &'w PhysicsWorld) -> Self {
        Self { world }
    }

    pub fn world(&self) -> &'w PhysicsWorld {
        self.world
    }

    fn blocks(&self, handle: ColliderHandle, collider: &Collider) -> bool {
        !collider.is_sensor() && self.world.is_query_enabled(handle)
    }

    /// Contacts between the capsule at `location` and every blocking collider
    /// within `margin` of it. Colliders are tested directly against their
    /// shapes so static geometry never depends on broad-phase state.
    fn contacts(
        &self,
        location: Vector<Real>,
        capsule: &Capsule,
        margin: Real,
    ) -> Vec<(ColliderHandle, Contact)> {
        let margin = margin.max(0.0);
        let pose = Isometry::translation(location.x, location.y, location.z);
        let bounds = capsule.aabb(&pose).loosened(margin + SWEEP_SKIN);
        self.world
            .colliders()
            .iter()
            .filter(|(handle, collider)| self.blocks(*handle, collider))
            .filter(|(_, collider)| collider.compute_aabb().intersects(&bounds))
            .filter_map(|(handle, collider)| {
                let contact = parry_query::contact(
                    collider.position(),
                    collider.shape(),
                    &pose,
                    capsule,
                    margin,
                )
                .ok()??;
                Some((handle, contact))
            })
            .collect()
    }

    fn surface_at(
        &self,
        handle: ColliderHandle,
        location: Vector<Real>,
        capsule: &Capsule,
    ) -> Option<(Vector<Real>, Vector<Real>)> {
        let collider = self.world.colliders().get(handle)?;
        let pose = Isometry::translation(location.x, location.y, location.z);
        let contact = parry_query::contact(
            collider.position(),
            collider.shape(),
            &pose,
            capsule,
            CONTACT_PREDICTION,
        )
        .ok()??;
        Some((contact.normal1.into_inner(), contact.point1.coords))
    }

    /// Normal of the face most opposed to `dir` near `impact_point`.
    fn opposing_face_normal(
        &self,
        handle: ColliderHandle,
        impact_point: Vector<Real>,
        dir: Vector<Real>,
        normal: Vector<Real>,
    ) -> Vector<Real> {
        let Some(collider) = self.world.colliders().get(handle) else {
            return normal;
        };
        let tangent = normal - dir * normal.dot(&dir);
        let nudge = if tangent.norm_squared() > 1.0e-8 {
            tangent.normalize() * FACE_RAY_NUDGE
        } else {
            Vector::zeros()
        };
        let along_sweep = Ray::new(
            Point::from(impact_point - dir * FACE_RAY_DISTANCE - nudge),
            dir,
        );
        if let Some(hit) = collider.shape().cast_ray_and_get_normal(
            collider.position(),
            &along_sweep,
            FACE_RAY_DISTANCE * 2.0,
            true,
        ) {
            let face_point = along_sweep.point_at(hit.time_of_impact).coords;
            let near_impact = (face_point - impact_point).norm() < FACE_RAY_NUDGE * 4.0;
            if near_impact && hit.normal.dot(&dir) < -KINDA_SMALL {
                return hit.normal;
            }
        }
        let along_normal = Ray::new(
            Point::from(impact_point + normal * FACE_RAY_DISTANCE),
            -normal,
        );
        collider
            .shape()
            .cast_ray_and_get_normal(
                collider.position(),
                &along_normal,
                FACE_RAY_DISTANCE * 2.0,
                true,
            )
            .map(|hit| hit.normal)
            .unwrap_or(normal)
    }
}

impl CollisionQuery for RapierCollision<'_> {
    fn sweep(&self, shape: &CapsuleShape, start: Vector<Real>, end: Vector<Real>) -> HitResult {
        let mut hit = HitResult::new(start, end);
        let capsule = shape.to_capsule();
        let delta = end - start;
        let length = delta.norm();
        let dir = if length > 1.0e-6 {
            delta / length
        } else {
            Vector::zeros()
        };

        let mut ignored = Vec::new();
        let mut deepest: Option<(ColliderHandle, Contact)> = None;
        for (handle, contact) in self.contacts(start, &capsule, TOUCH_DISTANCE) {
            let separating = dir.dot(&contact.normal1.into_inner());
            if contact.dist >= -PENETRATION_TOLERANCE {
                if separating > -1.0e-3 {
                    ignored.push(handle);
                }
                continue;
            }
            if separating > 0.0 {
                ignored.push(handle);
                continue;
            }
            if deepest.map_or(true, |(_, best)| contact.dist < best.dist) {
                deepest = Some((handle, contact));
            }
        }
        if let Some((handle, contact)) = deepest {
            hit.blocking_hit = true;
            hit.start_penetrating = true;
            hit.time = 0.0;
            hit.distance = 0.0;
            hit.location = start;
            hit.impact_point = contact.point1.coords;
            hit.normal = contact.normal1.into_inner();
            hit.impact_normal = hit.normal;
            hit.penetration_depth = -contact.dist;
            hit.component = Some(handle.into());
            trace!(depth = hit.penetration_depth, "sweep started penetrating");
            return hit;
        }
        if length <= 1.0e-6 {
            return hit;
        }

        let pose = Isometry::translation(start.x, start.y, start.z);
        let predicate = |handle: ColliderHandle, collider: &Collider| {
            self.blocks(handle, collider) && !ignored.contains(&handle)
        };
        let filter = QueryFilter::default().exclude_sensors().predicate(&predicate);
        let options = ShapeCastOptions {
            max_time_of_impact: 1.0,
            target_distance: 0.0,
            stop_at_penetration: true,
            compute_impact_geometry_on_penetration: true,
        };
        let Some((handle, cast)) = self.world.query_pipeline().cast_shape(
            self.world.bodies(),
            self.world.colliders(),
            &pose,
            &delta,
            &capsule,
            options,
            filter,
        ) else {
            return hit;
        };

        let toi = cast.time_of_impact.clamp(0.0, 1.0);
        let contact_location = start + delta * toi;
        // Exactly touching shapes give arbitrary normals at box edges.
        let backed_off = contact_location - dir * SURFACE_BACKOFF.min(length * toi);
        let (normal, impact_point) = self
            .surface_at(handle, backed_off, &capsule)
            .unwrap_or((-dir, contact_location + dir * shape.radius));
        let approach = (-dir.dot(&normal)).max(0.05);
        let time = (toi - SWEEP_SKIN / (length * approach)).max(0.0);

        hit.blocking_hit = true;
        hit.time = time;
        hit.distance = length * time;
        hit.location = start + delta * time;
        hit.impact_point = impact_point;
        hit.normal = normal;
        hit.impact_normal = self.opposing_face_normal(handle, impact_point, dir, normal);
        hit.component = Some(handle.into());
        hit
    }

    fn line_trace(&self, start: Vector<Real>, end: Vector<Real>) -> HitResult {
        let mut hit = HitResult::new(start, end);
        let delta = end - start;
        if delta.norm_squared() <= 1.0e-12 {
            return hit;
        }
        let ray = Ray::new(Point::from(start), delta);
        let predicate = |handle: ColliderHandle, collider: &Collider| self.blocks(handle, collider);
        let filter = QueryFilter::default().exclude_sensors().predicate(&predicate);
        let Some((handle, intersection)) = self.world.query_pipeline().cast_ray_and_get_normal(
            self.world.bodies(),
            self.world.colliders(),
            &ray,
            1.0,
            true,
            filter,
        ) else {
            return hit;
        };
        let time = intersection.time_of_impact.clamp(0.0, 1.0);
        hit.blocking_hit = true;
        hit.start_penetrating = time <= 0.0;
        hit.time = time;
        hit.distance = delta.norm() * time;
        hit.location = start + delta * time;
        hit.impact_point = hit.location;
        hit.normal = intersection.normal;
        hit.impact_normal = intersection.normal;
        hit.component = Some(handle.into());
        hit
    }

    fn overlap_blocking_test(&self, location: Vector<Real>, shape: &CapsuleShape) -> bool {
        self.contacts(location, &shape.to_capsule(), 0.0)
            .iter()
            .any(|(_, contact)| contact.dist < -PENETRATION_TOLERANCE)
    }

    fn penetration(&self, location: Vector<Real>, shape: &CapsuleShape) -> Option<Penetration> {
        self.contacts(location, &shape.to_capsule(), 0.0)
            .into_iter()
            .filter(|(_, contact)| contact.dist < -PENETRATION_TOLERANCE)
            .min_by(|(_, a), (_, b)| a.dist.total_cmp(&b.dist))
            .map(|(handle, contact)| Penetration {
                normal: contact.normal1.into_inner(),
                depth: -contact.dist,
                component: Some(handle.into()),
            })
    }

    fn base_info(&self, base: BaseHandle) -> Option<BaseInfo> {
        let handle = ColliderHandle::from(base);
        let collider = self.world.colliders().get(handle)?;
        Some(BaseInfo {
            dynamic: self.world.is_dynamic(handle),
            query_enabled: self.world.is_query_enabled(handle),
            blocks_character: !collider.is_sensor(),
            can_step_up: self.world.can_step_up(handle),
        })
    }

    fn base_location(&self, base: BaseHandle) -> Option<Vector<Real>> {
        self.world.collider_translation(base.into())
    }

    fn base_velocity(&self, base: BaseHandle) -> Vector<Real> {
        self.world.collider_velocity(base.into())
    }

    fn fluid_at(&self, point: Vector<Real>) -> Option<FluidVolume> {
        self.world.fluid_at(Point::from(point))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapier3d::prelude::*;

    fn floor_and_ledge() -> PhysicsWorld {
        let mut world = PhysicsWorld::z_up();
        let floor = ColliderBuilder::cuboid(1000.0, 1000.0, 10.0)
            .translation(vector![0.0, 0.0, -10.0])
            .build();
        world.insert_static_collider(floor);
        let block = ColliderBuilder::cuboid(50.0, 200.0, 20.0)
            .translation(vector![200.0, 0.0, 20.0])
            .build();
        world.insert_static_collider(block);
        world.refresh_queries();
        world
    }

    fn shape() -> CapsuleShape {
        CapsuleShape::new(34.0, 88.0)
    }

    #[test]
    fn downward_sweep_lands_on_floor() {
        let world = floor_and_ledge();
        let collision = RapierCollision::new(&world);
        let start = vector![0.0, 0.0, 120.0];
        let hit = collision.sweep(&shape(), start, vector![0.0, 0.0, 0.0]);

        assert!(hit.is_valid_blocking_hit());
        assert!((hit.location.z - 88.0).abs() < 0.1);
        assert!((hit.impact_normal.z - 1.0).abs() < 1.0e-3);
        assert!(hit.impact_point.z.abs() < 0.1);
    }

    #[test]
    fn horizontal_sweep_hits_block_face() {
        let world = floor_and_ledge();
        let collision = RapierCollision::new(&world);
        let start = vector![0.0, 0.0, 90.0];
        let hit = collision.sweep(&shape(), start, vector![300.0, 0.0, 90.0]);

        assert!(hit.is_valid_blocking_hit());
        assert!(hit.location.x < 150.0 - 34.0 + 0.01);
        assert!(hit.location.x > 150.0 - 34.0 - 0.5);
        assert!((hit.impact_normal.x + 1.0).abs() < 1.0e-3);
        assert!(hit.component.is_some());
    }

    #[test]
    fn resting_capsule_slides_along_floor() {
        let world = floor_and_ledge();
        let collision = RapierCollision::new(&world);
        let start = vector![0.0, 0.0, 88.0 + 2.0];
        let hit = collision.sweep(&shape(), start, vector![0.0, 50.0, 90.0]);
        assert!(!hit.blocking_hit);
        assert_eq!(hit.time, 1.0);
    }

    #[test]
    fn penetration_is_reported_unless_moving_out() {
        let world = floor_and_ledge();
        let collision = RapierCollision::new(&world);
        let start = vector![0.0, 0.0, 80.0];

        let down = collision.sweep(&shape(), start, vector![0.0, 0.0, 70.0]);
        assert!(down.start_penetrating);
        assert!((down.penetration_depth - 8.0).abs() < 0.1);
        assert!(down.normal.z > 0.99);

        let up = collision.sweep(&shape(), start, vector![0.0, 0.0, 100.0]);
        assert!(!up.blocking_hit);

        let penetration = collision
            .penetration(start, &shape())
            .expect("capsule overlaps floor");
        assert!((penetration.depth - 8.0).abs() < 0.1);
        assert!(collision.overlap_blocking_test(start, &shape()));
        assert!(!collision.overlap_blocking_test(vector![0.0, 0.0, 95.0], &shape()));
    }

    #[test]
    fn sunken_capsules_overlap_the_floor() {
        let world = floor_and_ledge();
        let collision = RapierCollision::new(&world);

        for (z, depth) in [(80.0, 8.0), (60.0, 28.0)] {
            let location = vector![0.0, 0.0, z];
            assert!(collision.overlap_blocking_test(location, &shape()), "z = {z}");
            let penetration = collision
                .penetration(location, &shape())
                .expect("sunken capsule penetrates");
            assert!((penetration.depth - depth).abs() < 0.1, "z = {z}");
            assert!(penetration.normal.z > 0.99);
            assert!(penetration.component.is_some());
        }

        let buried = vector![0.0, 0.0, 0.0];
        assert!(collision.overlap_blocking_test(buried, &shape()));
        let penetration = collision
            .penetration(buried, &shape())
            .expect("buried capsule penetrates");
        assert!(penetration.depth > 20.0);
        assert!(collision.sweep(&shape(), buried, vector![0.0, 0.0, -10.0]).start_penetrating);
    }

    #[test]
    fn overlap_ignores_sensors_and_disabled_colliders() {
        let mut world = PhysicsWorld::z_up();
        let floor = world.insert_static_collider(
            ColliderBuilder::cuboid(1000.0, 1000.0, 10.0)
                .translation(vector![0.0, 0.0, -10.0])
                .build(),
        );
        world.insert_fluid_volume(vector![100.0, 100.0, 100.0], vector![0.0, 0.0, 100.0], 1.0);
        world.refresh_queries();
        let location = vector![0.0, 0.0, 80.0];
        assert!(RapierCollision::new(&world).overlap_blocking_test(location, &shape()));

        world.set_query_enabled(floor, false);
        let collision = RapierCollision::new(&world);
        assert!(!collision.overlap_blocking_test(location, &shape()));
        assert!(collision.penetration(location, &shape()).is_none());
    }

    #[test]
    fn edge_hits_report_the_face_opposing_the_sweep() {
        let world = floor_and_ledge();
        let collision = RapierCollision::new(&world);
        // Lower hemisphere meets the block's top edge at z = 40.
        let start = vector![0.0, 0.0, 100.0];
        let hit = collision.sweep(&shape(), start, vector![300.0, 0.0, 100.0]);

        assert!(hit.is_valid_blocking_hit());
        assert!(!hit.start_penetrating);
        assert!(hit.normal.x < -0.9);
        assert!(hit.normal.z > 0.0 && hit.normal.z < 0.5);
        assert!((hit.impact_normal.x + 1.0).abs() < 1.0e-3);
        assert!(hit.impact_normal.z.abs() < 1.0e-3);
        assert!((hit.impact_point.z - 40.0).abs() < 0.5);
    }

    #[test]
    fn line_trace_reports_fraction() {
        let world = floor_and_ledge();
        let collision = RapierCollision::new(&world);
        let hit = collision.line_trace(vector![0.0, 0.0, 100.0], vector![0.0, 0.0, -100.0]);
        assert!(hit.is_valid_blocking_hit());
        assert!((hit.time - 0.5).abs() < 1.0e-4);
        assert!((hit.impact_normal.z - 1.0).abs() < 1.0e-4);
    }

    #[test]
    fn removed_base_stops_resolving() {
        let mut world = floor_and_ledge();
        let handle = {
            let collision = RapierCollision::new(&world);
            let hit = collision.sweep(&shape(), vector![0.0, 0.0, 120.0], vector![0.0, 0.0, 0.0]);
            hit.component.expect("floor handle")
        };
        world.remove_collider(handle.into());
        let collision = RapierCollision::new(&world);
        assert!(collision.base_info(handle).is_none());
        assert!(collision.base_location(handle).is_none());
    }
}
