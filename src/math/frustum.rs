//! Sphere/cone view frustum, used by [`crate::voxel::svo::Octree::cull`]
//! to decide whether a node's bounding sphere is worth descending into.

use glam::Vec3;

/// Result of a sphere-against-frustum test. `Intersect` means the sphere
/// straddles a frustum boundary and children must be re-tested; `Inside`
/// means every descendant is trivially visible and further tests can be
/// skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collision {
    Outside,
    Intersect,
    Inside,
}

/// A camera-shaped cone of vision, built from position/basis vectors and
/// a vertical field of view rather than 6 extracted planes. Cheaper to
/// evaluate against a sphere than a 6-plane frustum, at the cost of being
/// conservative near the frustum's side edges.
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    origin: Vec3,
    right: Vec3,
    up: Vec3,
    front: Vec3,

    near: f32,
    far: f32,
    aspect: f32,
    tan_half_fov: f32,

    sphere_factor_x: f32,
    sphere_factor_y: f32,
}

impl Frustum {
    /// `fov_y` is the full vertical field of view in radians. `right`,
    /// `up`, `front` need not be pre-normalized or pre-orthogonalized;
    /// `right` is re-derived from `front` and `up` to guarantee an
    /// orthonormal basis.
    pub fn new(
        origin: Vec3,
        right: Vec3,
        up: Vec3,
        front: Vec3,
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    ) -> Self {
        let front = front.normalize();
        let right = front.cross(up).normalize();
        let up = right.cross(front).normalize();

        let half_angle = fov_y * 0.5;
        let tan_half_fov = half_angle.tan();
        let angle_x = (tan_half_fov * aspect).atan();

        Self {
            origin,
            right,
            up,
            front,
            near,
            far,
            aspect,
            tan_half_fov,
            sphere_factor_x: 1.0 / angle_x.cos(),
            sphere_factor_y: 1.0 / half_angle.cos(),
        }
    }

    /// Classifies a sphere against the frustum's top/bottom and left/
    /// right planes, plus near/far. `Intersect` conservatively covers
    /// the edge case where two boundaries both straddle.
    pub fn sphere_in_frustum(&self, center: Vec3, radius: f32) -> Collision {
        let v = center - self.origin;

        let az = v.dot(self.front);
        let ax = v.dot(self.right);
        let ay = v.dot(self.up);

        if az < self.near - radius || az > self.far + radius {
            return Collision::Outside;
        }

        let mut result = Collision::Inside;

        let az_tan = az * self.tan_half_fov;
        let sy = self.sphere_factor_y * radius;
        if ay > az_tan + sy || ay < -az_tan - sy {
            return Collision::Outside;
        }
        if ay > az_tan - sy || ay < -az_tan + sy {
            result = Collision::Intersect;
        }

        let max_az_x = az_tan * self.aspect;
        let sx = self.sphere_factor_x * radius;
        if ax > max_az_x + sx || ax < -max_az_x - sx {
            return Collision::Outside;
        }
        if ax > max_az_x - sx || ax < -max_az_x + sx {
            result = Collision::Intersect;
        }

        result
    }

    /// 2D analogue of [`Self::sphere_in_frustum`] over the XZ plane,
    /// against only the near/far bounds. Used for horizontal segment
    /// streaming radius checks rather than per-node cull.
    pub fn circle_in_frustum(&self, center: Vec3, radius: f32) -> Collision {
        let origin_xz = Vec3::new(self.origin.x, 0.0, self.origin.z);
        let front_xz = Vec3::new(self.front.x, 0.0, self.front.z).normalize_or_zero();
        let v = Vec3::new(center.x, 0.0, center.z) - origin_xz;
        let az = v.dot(front_xz);

        if az > self.far + radius || az < self.near - radius {
            Collision::Outside
        } else {
            Collision::Intersect
        }
    }

    /// True if a cube of edge `2 * scale` centered at `point` is not
    /// entirely outside the frustum.
    pub fn cube_visible(&self, point: Vec3, scale: f32) -> bool {
        let radius = scale * std::f32::consts::SQRT_2;
        self.sphere_in_frustum(point, radius) != Collision::Outside
    }

    /// True if a `scale`-sided square centered at `point` (XZ plane, Y
    /// ignored) is not entirely outside the near/far range.
    pub fn square_visible(&self, point: Vec3, scale: f32) -> bool {
        let radius = scale * std::f32::consts::SQRT_2;
        self.circle_in_frustum(point, radius) != Collision::Outside
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn looking_down_positive_x() -> Frustum {
        Frustum::new(
            Vec3::ZERO,
            Vec3::X,
            Vec3::Y,
            Vec3::X,
            90f32.to_radians(),
            1.0,
            0.1,
            1000.0,
        )
    }

    #[test]
    fn point_directly_ahead_is_inside() {
        let f = looking_down_positive_x();
        assert_eq!(f.sphere_in_frustum(Vec3::new(10.0, 0.0, 0.0), 0.1), Collision::Inside);
    }

    #[test]
    fn point_behind_camera_is_outside() {
        let f = looking_down_positive_x();
        assert_eq!(f.sphere_in_frustum(Vec3::new(-10.0, 0.0, 0.0), 0.1), Collision::Outside);
    }

    #[test]
    fn point_far_off_axis_is_outside() {
        let f = looking_down_positive_x();
        assert_eq!(f.sphere_in_frustum(Vec3::new(10.0, 500.0, 0.0), 0.1), Collision::Outside);
    }

    #[test]
    fn sphere_straddling_edge_is_intersect() {
        let f = looking_down_positive_x();
        let depth = 10.0;
        let edge_y = depth * f.tan_half_fov;
        assert_eq!(
            f.sphere_in_frustum(Vec3::new(depth, edge_y, 0.0), 1.0),
            Collision::Intersect
        );
    }

    #[test]
    fn cube_visible_matches_sphere_test() {
        let f = looking_down_positive_x();
        assert!(f.cube_visible(Vec3::new(10.0, 0.0, 0.0), 1.0));
        assert!(!f.cube_visible(Vec3::new(-10.0, 0.0, 0.0), 1.0));
    }
}
