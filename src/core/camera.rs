//! Camera: position, orientation, and the derived frustum + face mask
//! used to cull octree nodes and whole chunks.

use crate::core::types::{Mat4, Vec3};
use crate::math::frustum::{Collision, Frustum};
use crate::voxel::svo::Face;

/// Normal-vs-front dot product below which a face is considered to
/// never face the camera, per axis group. Faces along the camera's
/// dominant viewing axes tolerate a shallower angle than the vertical
/// pair, since players look along the horizon far more than straight
/// up or down.
const HORIZONTAL_FACE_THRESHOLD: f32 = 0.55;
const VERTICAL_FACE_THRESHOLD: f32 = 0.25;

/// A free-flying camera defined by position and yaw/pitch, with a
/// cached view matrix and frustum rebuilt by [`Camera::update`].
#[derive(Clone)]
pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,

    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,

    front: Vec3,
    right: Vec3,
    up: Vec3,
    view: Mat4,
    frustum: Frustum,
    face_mask: u8,
}

impl Camera {
    pub fn new(position: Vec3, fov_y_degrees: f32, aspect: f32) -> Self {
        let mut camera = Self {
            position,
            yaw: -std::f32::consts::FRAC_PI_2,
            pitch: 0.0,
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near: 0.1,
            far: 1000.0,
            front: Vec3::NEG_Z,
            right: Vec3::X,
            up: Vec3::Y,
            view: Mat4::IDENTITY,
            frustum: Frustum::new(
                position,
                Vec3::X,
                Vec3::Y,
                Vec3::NEG_Z,
                fov_y_degrees.to_radians(),
                aspect,
                0.1,
                1000.0,
            ),
            face_mask: 0,
        };
        camera.update();
        camera
    }

    pub fn look_at(position: Vec3, target: Vec3, up: Vec3) -> Self {
        let front = (target - position).normalize();
        let yaw = front.z.atan2(front.x);
        let pitch = front.y.asin();
        let mut camera = Self::new(position, 60.0, 16.0 / 9.0);
        camera.yaw = yaw;
        camera.pitch = pitch;
        let _ = up;
        camera.update();
        camera
    }

    /// Recomputes `front`/`right`/`up`, the view matrix, the frustum,
    /// and the axis-aligned face mask from `position`/`yaw`/`pitch`.
    /// Must be called after any of those three change.
    pub fn update(&mut self) {
        self.front = Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize();
        self.right = self.front.cross(Vec3::Y).normalize();
        self.up = self.right.cross(self.front).normalize();

        self.view = Mat4::look_at_rh(self.position, self.position + self.front, Vec3::Y);
        self.frustum = Frustum::new(
            self.position,
            self.right,
            self.up,
            self.front,
            self.fov_y,
            self.aspect,
            self.near,
            self.far,
        );
        self.face_mask = Self::compute_face_mask(self.front);
    }

    /// Clears the bit of any face whose outward normal is angled far
    /// enough away from `front` that it can never be camera-facing.
    fn compute_face_mask(front: Vec3) -> u8 {
        let mut mask = 0u8;
        for face in Face::ALL {
            let (ox, oy, oz) = face.offset();
            let normal = Vec3::new(ox as f32, oy as f32, oz as f32);
            let threshold = if oy != 0 {
                VERTICAL_FACE_THRESHOLD
            } else {
                HORIZONTAL_FACE_THRESHOLD
            };
            if normal.dot(front) > -threshold {
                mask |= face.bit();
            }
        }
        mask
    }

    pub fn view_matrix(&self) -> Mat4 {
        self.view
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn front(&self) -> Vec3 {
        self.front
    }

    pub fn right(&self) -> Vec3 {
        self.right
    }

    pub fn up(&self) -> Vec3 {
        self.up
    }

    pub fn frustum(&self) -> &Frustum {
        &self.frustum
    }

    /// 6-bit mask (within a u8) of faces that can possibly be visible
    /// from the camera's current orientation.
    pub fn face_mask(&self) -> u8 {
        self.face_mask
    }

    pub fn sphere_visible(&self, center: Vec3, radius: f32) -> bool {
        self.frustum.sphere_in_frustum(center, radius) != Collision::Outside
    }

    pub fn square_visible(&self, point: Vec3, scale: f32) -> bool {
        self.frustum.square_visible(point, scale)
    }

    pub fn set_aspect(&mut self, width: f32, height: f32) {
        self.aspect = width / height;
        self.update();
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 5.0), 60.0, 16.0 / 9.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_camera_looks_along_negative_z() {
        let camera = Camera::default();
        assert!(camera.front().z < 0.0);
    }

    #[test]
    fn view_matrix_translates_world_origin_away_from_camera() {
        let mut camera = Camera::default();
        camera.position = Vec3::new(10.0, 0.0, 0.0);
        camera.update();

        let origin_in_camera = camera.view_matrix().transform_point3(Vec3::ZERO);
        assert!((origin_in_camera.z + 5.0).abs() < 10.0 || origin_in_camera != Vec3::ZERO);
    }

    #[test]
    fn face_mask_clears_face_behind_camera() {
        let mut camera = Camera::new(Vec3::ZERO, 60.0, 16.0 / 9.0);
        camera.yaw = 0.0;
        camera.pitch = 0.0;
        camera.update();

        // facing +X: -X face should never be visible, +X should be.
        assert_eq!(camera.face_mask() & Face::NegX.bit(), 0);
        assert_ne!(camera.face_mask() & Face::PosX.bit(), 0);
    }

    #[test]
    fn face_mask_keeps_vertical_faces_under_shallower_threshold() {
        let mut camera = Camera::new(Vec3::ZERO, 60.0, 16.0 / 9.0);
        camera.yaw = 0.0;
        camera.pitch = -0.3; // looking slightly downward
        camera.update();

        assert_ne!(camera.face_mask() & Face::PosY.bit(), 0);
    }
}
