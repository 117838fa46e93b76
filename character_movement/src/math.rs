use rapier3d::math::Vector;
use rapier3d::prelude::Real;

use crate::KINDA_SMALL_NUMBER;

const SMALL_NUMBER: Real = 1.0e-8;

pub fn size_2d(v: &Vector<Real>) -> Real {
    size_squared_2d(v).sqrt()
}

pub fn size_squared_2d(v: &Vector<Real>) -> Real {
    v.x * v.x + v.y * v.y
}

pub fn horizontal(v: Vector<Real>) -> Vector<Real> {
    Vector::new(v.x, v.y, 0.0)
}

/// Unit vector, or zero when `v` is too short to normalize.
pub fn safe_normal(v: Vector<Real>) -> Vector<Real> {
    let square = v.norm_squared();
    if square < SMALL_NUMBER {
        Vector::zeros()
    } else {
        v / square.sqrt()
    }
}

pub fn safe_normal_2d(v: Vector<Real>) -> Vector<Real> {
    safe_normal(horizontal(v))
}

pub fn is_nearly_zero(v: &Vector<Real>, tolerance: Real) -> bool {
    v.x.abs() <= tolerance && v.y.abs() <= tolerance && v.z.abs() <= tolerance
}

pub fn is_zero(v: &Vector<Real>) -> bool {
    v.x == 0.0 && v.y == 0.0 && v.z == 0.0
}

pub fn nearly_equal(a: &Vector<Real>, b: &Vector<Real>, tolerance: Real) -> bool {
    is_nearly_zero(&(a - b), tolerance)
}

/// Projects `v` onto the plane with unit normal `normal`.
pub fn project_on_plane(v: Vector<Real>, normal: Vector<Real>) -> Vector<Real> {
    v - normal * v.dot(&normal)
}

pub fn clamp_max_size(v: Vector<Real>, max: Real) -> Vector<Real> {
    if max < KINDA_SMALL_NUMBER {
        return Vector::zeros();
    }
    let square = v.norm_squared();
    if square > max * max {
        v * (max / square.sqrt())
    } else {
        v
    }
}

/// Rotates `v` about +Z by `yaw` degrees.
pub fn rotate_yaw(yaw: Real, v: Vector<Real>) -> Vector<Real> {
    let (sin, cos) = yaw.to_radians().sin_cos();
    Vector::new(v.x * cos - v.y * sin, v.x * sin + v.y * cos, v.z)
}

pub fn unrotate_yaw(yaw: Real, v: Vector<Real>) -> Vector<Real> {
    rotate_yaw(-yaw, v)
}

/// Wraps an angle in degrees into (-180, 180].
pub fn normalize_axis(angle: Real) -> Real {
    let mut angle = angle % 360.0;
    if angle > 180.0 {
        angle -= 360.0;
    } else if angle <= -180.0 {
        angle += 360.0;
    }
    angle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaw_rotation_is_counter_clockwise() {
        let rotated = rotate_yaw(90.0, Vector::new(1.0, 0.0, 5.0));
        assert!(rotated.x.abs() < 1.0e-5);
        assert!((rotated.y - 1.0).abs() < 1.0e-5);
        assert_eq!(rotated.z, 5.0);
        let back = unrotate_yaw(90.0, rotated);
        assert!((back - Vector::new(1.0, 0.0, 5.0)).norm() < 1.0e-5);
    }

    #[test]
    fn safe_normal_handles_tiny_vectors() {
        assert_eq!(safe_normal(Vector::new(1.0e-6, 0.0, 0.0)), Vector::zeros());
        assert_eq!(safe_normal_2d(Vector::new(0.0, 0.0, 7.0)), Vector::zeros());
        let n = safe_normal_2d(Vector::new(3.0, 4.0, 100.0));
        assert!((n - Vector::new(0.6, 0.8, 0.0)).norm() < 1.0e-6);
    }

    #[test]
    fn clamp_and_project() {
        let clamped = clamp_max_size(Vector::new(30.0, 40.0, 0.0), 5.0);
        assert!((clamped.norm() - 5.0).abs() < 1.0e-5);
        let projected = project_on_plane(Vector::new(1.0, 0.0, -1.0), Vector::z());
        assert_eq!(projected, Vector::new(1.0, 0.0, 0.0));
        assert_eq!(normalize_axis(270.0), -90.0);
        assert_eq!(normalize_axis(-180.0), 180.0);
    }
}
