//! Root capsule driven by the tracked headset.
//!
//! The capsule centre sits under the HMD rather than at the actor origin.
//! Head motion since the last regenerate is carried separately in
//! `difference_from_last_frame` so the integrator can rewind it, sweep it
//! together with locomotion, and regenerate the offset afterwards.

use character_collision::CapsuleShape;
use rapier3d::math::Vector;
use rapier3d::prelude::Real;

use crate::math::{horizontal, rotate_yaw};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VrRootCapsule {
    /// World capsule centre.
    location: Vector<Real>,
    actor_yaw: Real,
    /// HMD position relative to the actor origin, in actor space.
    tracked_location: Vector<Real>,
    tracked_yaw: Real,
    last_tracked_location: Vector<Real>,
    /// World-space XY head motion not yet consumed by movement.
    difference_from_last_frame: Vector<Real>,
    radius: Real,
    half_height: Real,
    custom_vr_input: Vector<Real>,
}

impl VrRootCapsule {
    /// Capsule standing on `origin` (the actor's feet) with the head centred.
    pub fn new(origin: Vector<Real>, actor_yaw: Real, radius: Real, half_height: Real) -> Self {
        let shape = CapsuleShape::new(radius, half_height);
        Self {
            location: origin + Vector::new(0.0, 0.0, shape.half_height),
            actor_yaw,
            tracked_location: Vector::zeros(),
            tracked_yaw: 0.0,
            last_tracked_location: Vector::zeros(),
            difference_from_last_frame: Vector::zeros(),
            radius: shape.radius,
            half_height: shape.half_height,
            custom_vr_input: Vector::zeros(),
        }
    }

    pub fn location(&self) -> Vector<Real> {
        self.location
    }

    pub fn set_location(&mut self, location: Vector<Real>) {
        self.location = location;
    }

    /// Actor origin: the capsule bottom shifted back by the head offset.
    pub fn origin(&self) -> Vector<Real> {
        self.location - self.current_tracked_offset()
    }

    pub fn set_origin(&mut self, origin: Vector<Real>) {
        self.location = origin + self.current_tracked_offset();
    }

    pub fn actor_yaw(&self) -> Real {
        self.actor_yaw
    }

    /// Rotates the actor about its origin; the capsule swings with the head.
    pub fn set_actor_yaw(&mut self, yaw: Real) {
        let origin = self.origin();
        self.actor_yaw = yaw;
        self.set_origin(origin);
    }

    /// Rotates the actor about the capsule, leaving the head in place.
    pub fn turn_about_capsule(&mut self, yaw: Real) {
        self.actor_yaw = yaw;
    }

    pub fn tracked_location(&self) -> Vector<Real> {
        self.tracked_location
    }

    pub fn tracked_yaw(&self) -> Real {
        self.tracked_yaw
    }

    /// World yaw the headset faces.
    pub fn world_yaw(&self) -> Real {
        self.actor_yaw + self.tracked_yaw
    }

    pub fn radius(&self) -> Real {
        self.radius
    }

    pub fn half_height(&self) -> Real {
        self.half_height
    }

    pub fn shape(&self) -> CapsuleShape {
        CapsuleShape::new(self.radius, self.half_height)
    }

    pub fn difference_from_last_frame(&self) -> Vector<Real> {
        self.difference_from_last_frame
    }

    pub fn custom_vr_input(&self) -> Vector<Real> {
        self.custom_vr_input
    }

    pub fn set_custom_vr_input(&mut self, input: Vector<Real>) {
        self.custom_vr_input = input;
    }

    pub fn take_custom_vr_input(&mut self) -> Vector<Real> {
        std::mem::replace(&mut self.custom_vr_input, Vector::zeros())
    }

    /// Offset from the actor origin to the capsule centre.
    pub fn current_tracked_offset(&self) -> Vector<Real> {
        rotate_yaw(self.actor_yaw, horizontal(self.tracked_location))
            + Vector::new(0.0, 0.0, self.half_height)
    }

    /// New headset pose. The capsule follows the head right away and the
    /// world-space motion since the last regenerate is accumulated.
    pub fn set_tracked_pose(&mut self, tracked_location: Vector<Real>, tracked_yaw: Real) {
        let origin = self.origin();
        self.tracked_location = tracked_location;
        self.tracked_yaw = tracked_yaw;
        self.difference_from_last_frame = rotate_yaw(
            self.actor_yaw,
            horizontal(tracked_location - self.last_tracked_location),
        );
        self.set_origin(origin);
    }

    /// Adopts a tracked pose as already consumed, without moving the capsule.
    /// Used before replaying saved moves on top of a correction.
    pub fn reset_tracking(&mut self, tracked_location: Vector<Real>, tracked_yaw: Real) {
        self.tracked_location = tracked_location;
        self.last_tracked_location = tracked_location;
        self.tracked_yaw = tracked_yaw;
        self.difference_from_last_frame = Vector::zeros();
    }

    /// Adopts a replicated tracked pose and head motion. The capsule ends up
    /// exactly `delta` away from where it stood before any pending head
    /// motion, whatever tracked pose this side saw last; the tracked pose only
    /// re-derives the origin.
    pub fn apply_replicated_head_motion(
        &mut self,
        tracked_location: Vector<Real>,
        tracked_yaw: Real,
        delta: Vector<Real>,
    ) {
        let settled = self.location - horizontal(self.difference_from_last_frame);
        self.tracked_location = tracked_location;
        self.tracked_yaw = tracked_yaw;
        self.location = settled + horizontal(delta);
        self.difference_from_last_frame = horizontal(delta);
    }

    /// Pulls the capsule back by the pending head motion and hands that motion
    /// to the integrator.
    pub fn rewind(&mut self) -> Vector<Real> {
        let difference = horizontal(self.difference_from_last_frame);
        self.location -= difference;
        difference
    }

    pub fn regenerate_offset_transform(&mut self) {
        self.last_tracked_location = self.tracked_location;
        self.difference_from_last_frame = Vector::zeros();
    }

    /// Resizes the capsule keeping its bottom where it is.
    pub fn set_capsule_half_height(&mut self, half_height: Real) {
        let half_height = half_height.max(self.radius);
        self.location.z += half_height - self.half_height;
        self.half_height = half_height;
    }

    pub fn set_capsule_size(&mut self, radius: Real, half_height: Real) {
        self.radius = radius.max(0.0);
        self.set_capsule_half_height(half_height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_near(a: Vector<Real>, b: Vector<Real>) {
        assert!((a - b).norm() < 1.0e-4, "{a:?} != {b:?}");
    }

    #[test]
    fn head_motion_moves_capsule_and_accumulates() {
        let mut capsule = VrRootCapsule::new(Vector::new(100.0, 0.0, 0.0), 90.0, 20.0, 80.0);
        assert_near(capsule.location(), Vector::new(100.0, 0.0, 80.0));

        capsule.set_tracked_pose(Vector::new(10.0, 0.0, 170.0), 15.0);
        // Actor faces +Y, so local +X is world +Y.
        assert_near(capsule.location(), Vector::new(100.0, 10.0, 80.0));
        assert_near(capsule.difference_from_last_frame(), Vector::new(0.0, 10.0, 0.0));
        assert_near(capsule.origin(), Vector::new(100.0, 0.0, 0.0));

        capsule.set_tracked_pose(Vector::new(15.0, 0.0, 170.0), 15.0);
        assert_near(capsule.difference_from_last_frame(), Vector::new(0.0, 15.0, 0.0));
    }

    #[test]
    fn rewind_then_regenerate() {
        let mut capsule = VrRootCapsule::new(Vector::zeros(), 0.0, 20.0, 80.0);
        capsule.set_tracked_pose(Vector::new(5.0, -3.0, 0.0), 0.0);
        let before = capsule.location();

        let input = capsule.rewind();
        assert_near(input, Vector::new(5.0, -3.0, 0.0));
        assert_near(capsule.location(), before - input);

        capsule.set_location(before);
        capsule.regenerate_offset_transform();
        assert_eq!(capsule.difference_from_last_frame(), Vector::zeros());
        capsule.set_tracked_pose(Vector::new(5.0, -3.0, 0.0), 0.0);
        assert_eq!(capsule.difference_from_last_frame(), Vector::zeros());
    }

    #[test]
    fn resize_keeps_bottom_and_origin() {
        let mut capsule = VrRootCapsule::new(Vector::new(0.0, 0.0, 10.0), 0.0, 30.0, 90.0);
        capsule.set_capsule_half_height(50.0);
        assert_near(capsule.location(), Vector::new(0.0, 0.0, 60.0));
        assert_near(capsule.origin(), Vector::new(0.0, 0.0, 10.0));
        capsule.set_capsule_half_height(10.0);
        assert_eq!(capsule.half_height(), 30.0);
    }

    #[test]
    fn actor_yaw_swings_capsule_around_origin() {
        let mut capsule = VrRootCapsule::new(Vector::zeros(), 0.0, 20.0, 80.0);
        capsule.set_tracked_pose(Vector::new(10.0, 0.0, 0.0), 0.0);
        capsule.regenerate_offset_transform();
        capsule.set_actor_yaw(180.0);
        assert_near(capsule.location(), Vector::new(-10.0, 0.0, 80.0));

        capsule.turn_about_capsule(90.0);
        assert_near(capsule.location(), Vector::new(-10.0, 0.0, 80.0));
        assert_near(capsule.origin(), Vector::new(-10.0, -10.0, 0.0));
    }

    #[test]
    fn replicated_head_motion_agrees_with_local_tracking() {
        let start = Vector::new(50.0, 20.0, 0.0);
        let mut local = VrRootCapsule::new(start, 90.0, 20.0, 80.0);
        let mut remote = local;

        // The remote side missed an earlier pose and still has a stale one.
        local.set_tracked_pose(Vector::new(4.0, 0.0, 0.0), 0.0);
        local.regenerate_offset_transform();
        remote.set_location(local.location());

        local.set_tracked_pose(Vector::new(10.0, 3.0, 0.0), 5.0);
        let delta = local.difference_from_last_frame();
        let tracked = local.tracked_location();

        local.apply_replicated_head_motion(tracked, 5.0, delta);
        remote.apply_replicated_head_motion(tracked, 5.0, delta);

        assert_near(local.location(), remote.location());
        assert_near(local.difference_from_last_frame(), delta);
        assert_near(remote.difference_from_last_frame(), delta);
        assert_eq!(local.tracked_location(), remote.tracked_location());

        // Applying the same motion again does not move the capsule further.
        let location = local.location();
        local.apply_replicated_head_motion(tracked, 5.0, delta);
        assert_near(local.location(), location);

        let mut rewound = remote;
        let consumed = rewound.rewind();
        assert_near(consumed, delta);
        assert_near(rewound.location() + delta, remote.location());
    }
}
