use rapier3d::math::Vector;
use rapier3d::prelude::Real;

use crate::{NavLocation, NavigationQuery};

/// Flat rectangular nav mesh at a fixed height. Enough for test scenes and the
/// simulation tool; real worlds plug their own [`NavigationQuery`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NavPlane {
    pub min: [Real; 2],
    pub max: [Real; 2],
    pub z: Real,
    /// Vertical search extent when looking for the floor under a point.
    pub query_height: Real,
    pub node: u64,
}

impl NavPlane {
    pub fn new(min: [Real; 2], max: [Real; 2], z: Real) -> Self {
        Self {
            min,
            max,
            z,
            query_height: 200.0,
            node: 1,
        }
    }

    fn contains_xy(&self, point: Vector<Real>) -> bool {
        point.x >= self.min[0]
            && point.x <= self.max[0]
            && point.y >= self.min[1]
            && point.y <= self.max[1]
    }
}

impl NavigationQuery for NavPlane {
    fn find_nav_floor(&self, point: Vector<Real>) -> Option<NavLocation> {
        let node = (self.contains_xy(point) && (point.z - self.z).abs() <= self.query_height)
            .then_some(self.node);
        let location = if node.is_some() {
            Vector::new(point.x, point.y, self.z)
        } else {
            point
        };
        Some(NavLocation { location, node })
    }

    fn project_point_to_nav_mesh(
        &self,
        point: Vector<Real>,
        up_offset: Real,
        down_offset: Real,
    ) -> Option<Vector<Real>> {
        let in_window = self.z <= point.z + up_offset && self.z >= point.z - down_offset;
        (self.contains_xy(point) && in_window).then(|| Vector::new(point.x, point.y, self.z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_inside_and_outside_bounds() {
        let plane = NavPlane::new([-100.0, -100.0], [100.0, 100.0], 0.0);
        let inside = plane
            .find_nav_floor(Vector::new(10.0, 20.0, 30.0))
            .expect("plane always has nav data");
        assert_eq!(inside.node, Some(1));
        assert_eq!(inside.location.z, 0.0);

        let outside = plane
            .find_nav_floor(Vector::new(500.0, 0.0, 0.0))
            .expect("plane always has nav data");
        assert_eq!(outside.node, None);
    }

    #[test]
    fn projection_respects_height_window() {
        let plane = NavPlane::new([-100.0, -100.0], [100.0, 100.0], 0.0);
        let projected = plane.project_point_to_nav_mesh(Vector::new(0.0, 0.0, 50.0), 10.0, 60.0);
        assert_eq!(projected, Some(Vector::new(0.0, 0.0, 0.0)));
        assert!(plane
            .project_point_to_nav_mesh(Vector::new(0.0, 0.0, 50.0), 10.0, 20.0)
            .is_none());
    }
}
