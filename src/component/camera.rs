//! Camera 组件
//!
//! 欧拉角相机：世界矩阵 `T * R(俯仰, 偏航)`，视图矩阵是它的逆，
//! 投影为左手系透视（深度 [0, 1]）。每次修改后调用 [`Camera::update`] 重新计算矩阵。

use super::Transform;
use crate::math::{matrix, Matrix4, Vector3};

/// 默认垂直视场角（弧度）
pub const DEFAULT_FOV_Y: f32 = 0.45;
pub const DEFAULT_NEAR: f32 = 0.1;
pub const DEFAULT_FAR: f32 = 100.0;

/// Camera 组件
#[derive(Debug, Clone)]
pub struct Camera {
    transform: Transform,
    fov_y: f32,
    aspect: f32,
    near_z: f32,
    far_z: f32,

    world_matrix: Matrix4,
    view_matrix: Matrix4,
    proj_matrix: Matrix4,
    view_proj_matrix: Matrix4,
}

impl Camera {
    /// 创建相机，位于 (0, 0, -10) 朝 +Z 看
    pub fn new(aspect: f32) -> Self {
        let mut camera = Self {
            transform: Transform::at(Vector3::new(0.0, 0.0, -10.0)),
            fov_y: DEFAULT_FOV_Y,
            aspect,
            near_z: DEFAULT_NEAR,
            far_z: DEFAULT_FAR,
            world_matrix: Matrix4::identity(),
            view_matrix: Matrix4::identity(),
            proj_matrix: Matrix4::identity(),
            view_proj_matrix: Matrix4::identity(),
        };
        camera.update();
        camera
    }

    /// 重新计算世界、视图、投影矩阵
    pub fn update(&mut self) {
        self.world_matrix = self.transform.world_matrix();
        self.view_matrix = self.world_matrix.try_inverse().unwrap_or_else(Matrix4::identity);
        self.proj_matrix = matrix::perspective_fov_lh(self.fov_y, self.aspect, self.near_z, self.far_z);
        self.view_proj_matrix = self.proj_matrix * self.view_matrix;
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn transform_mut(&mut self) -> &mut Transform {
        &mut self.transform
    }

    pub fn position(&self) -> Vector3 {
        self.transform.translate
    }

    pub fn set_position(&mut self, position: Vector3) {
        self.transform.translate = position;
    }

    pub fn yaw(&self) -> f32 {
        self.transform.rotate.y
    }

    pub fn pitch(&self) -> f32 {
        self.transform.rotate.x
    }

    /// 增加偏航和俯仰，俯仰夹在 `±pitch_limit`
    pub fn rotate(&mut self, yaw_delta: f32, pitch_delta: f32, pitch_limit: f32) {
        self.transform.rotate.y += yaw_delta;
        self.transform.rotate.x = (self.transform.rotate.x + pitch_delta).clamp(-pitch_limit, pitch_limit);
    }

    /// 水平面内的前方向（只看偏航）
    pub fn planar_forward(&self) -> Vector3 {
        let yaw = self.yaw();
        Vector3::new(yaw.sin(), 0.0, yaw.cos())
    }

    /// 水平面内的右方向
    pub fn planar_right(&self) -> Vector3 {
        let yaw = self.yaw();
        Vector3::new(yaw.cos(), 0.0, -yaw.sin())
    }

    /// 在水平面内移动
    pub fn move_planar(&mut self, forward: f32, right: f32) {
        let delta = self.planar_forward() * forward + self.planar_right() * right;
        self.transform.translate += delta;
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        if aspect.is_finite() && aspect > 0.0 {
            self.aspect = aspect;
        }
    }

    pub fn aspect(&self) -> f32 {
        self.aspect
    }

    pub fn fov_y(&self) -> f32 {
        self.fov_y
    }

    pub fn world_matrix(&self) -> Matrix4 {
        self.world_matrix
    }

    pub fn view_matrix(&self) -> Matrix4 {
        self.view_matrix
    }

    pub fn proj_matrix(&self) -> Matrix4 {
        self.proj_matrix
    }

    pub fn view_projection(&self) -> Matrix4 {
        self.view_proj_matrix
    }

    /// 朝向相机的旋转：相机世界矩阵去掉平移
    pub fn billboard(&self) -> Matrix4 {
        matrix::without_translation(&self.world_matrix)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(1280.0 / 720.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vector4;

    #[test]
    fn test_origin_is_in_front_of_default_camera() {
        let camera = Camera::default();
        let clip = camera.view_projection() * Vector4::new(0.0, 0.0, 0.0, 1.0);
        let ndc_z = clip.z / clip.w;
        assert!(clip.w > 0.0);
        assert!((0.0..=1.0).contains(&ndc_z));
        assert!((clip.x / clip.w).abs() < 1e-5);
    }

    #[test]
    fn test_pitch_is_clamped() {
        let mut camera = Camera::default();
        camera.rotate(0.0, 10.0, 1.553_343);
        assert!((camera.pitch() - 1.553_343).abs() < 1e-6);
        camera.rotate(0.0, -20.0, 1.553_343);
        assert!((camera.pitch() + 1.553_343).abs() < 1e-6);
    }

    #[test]
    fn test_billboard_has_no_translation() {
        let mut camera = Camera::default();
        camera.rotate(0.3, 0.2, 1.5);
        camera.update();
        let b = camera.billboard();
        assert_eq!(b[(0, 3)], 0.0);
        assert_eq!(b[(2, 3)], 0.0);
        // 旋转部分与世界矩阵一致
        assert_eq!(b[(0, 0)], camera.world_matrix()[(0, 0)]);
    }

    #[test]
    fn test_planar_move_follows_yaw() {
        let mut camera = Camera::default();
        camera.rotate(std::f32::consts::FRAC_PI_2, 0.0, 1.5);
        camera.move_planar(1.0, 0.0);
        let p = camera.position();
        assert!((p.x - 1.0).abs() < 1e-5);
        assert!((p.z + 10.0).abs() < 1e-5);
    }
}
