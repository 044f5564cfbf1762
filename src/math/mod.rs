//! 数学类型
//!
//! 基于 `nalgebra` 的类型别名，以及渲染核心用到的少量辅助函数。
//! 约定：列向量，矩阵左乘（`world = T * R * S`）。

pub use nalgebra::{Matrix4 as Mat4, Vector2 as Vec2, Vector3 as Vec3, Vector4 as Vec4};

pub type Vector2 = Vec2<f32>;
pub type Vector3 = Vec3<f32>;
pub type Vector4 = Vec4<f32>;
pub type Matrix4 = Mat4<f32>;

/// 颜色类型（RGBA，范围 0.0-1.0）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    /// 创建新的颜色
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    pub const WHITE: Color = Color::new(1.0, 1.0, 1.0, 1.0);
}

impl From<[f32; 4]> for Color {
    fn from(v: [f32; 4]) -> Self {
        Color::new(v[0], v[1], v[2], v[3])
    }
}

/// 矩阵辅助函数
pub mod matrix {
    use super::*;

    /// 按 X（俯仰）、Y（偏航）、Z（翻滚）欧拉角构建旋转矩阵
    ///
    /// 先绕 X，再绕 Y，最后绕 Z。
    pub fn rotation_xyz(rotate: &Vector3) -> Matrix4 {
        let rx = Matrix4::from_axis_angle(&Vector3::x_axis(), rotate.x);
        let ry = Matrix4::from_axis_angle(&Vector3::y_axis(), rotate.y);
        let rz = Matrix4::from_axis_angle(&Vector3::z_axis(), rotate.z);
        rz * ry * rx
    }

    /// 仿射变换：`T * R * S`
    pub fn affine(scale: &Vector3, rotate: &Vector3, translate: &Vector3) -> Matrix4 {
        Matrix4::new_translation(translate) * rotation_xyz(rotate) * Matrix4::new_nonuniform_scaling(scale)
    }

    /// 去掉平移分量，只保留旋转/缩放部分
    pub fn without_translation(m: &Matrix4) -> Matrix4 {
        let mut out = *m;
        out[(0, 3)] = 0.0;
        out[(1, 3)] = 0.0;
        out[(2, 3)] = 0.0;
        out
    }

    /// 左手系透视投影，深度映射到 [0, 1]（Direct3D 约定）
    pub fn perspective_fov_lh(fov_y: f32, aspect: f32, near: f32, far: f32) -> Matrix4 {
        let y_scale = 1.0 / (0.5 * fov_y).tan();
        let x_scale = y_scale / aspect;
        let range = far / (far - near);

        #[rustfmt::skip]
        let m = Matrix4::new(
            x_scale, 0.0,     0.0,   0.0,
            0.0,     y_scale, 0.0,   0.0,
            0.0,     0.0,     range, -near * range,
            0.0,     0.0,     1.0,   0.0,
        );
        m
    }

    /// 左手系正交投影，`top`/`bottom` 可以反向（屏幕坐标 y 向下）
    pub fn orthographic_lh(left: f32, top: f32, right: f32, bottom: f32, near: f32, far: f32) -> Matrix4 {
        let width = right - left;
        let height = top - bottom;
        let depth = far - near;

        #[rustfmt::skip]
        let m = Matrix4::new(
            2.0 / width, 0.0,          0.0,         -(right + left) / width,
            0.0,         2.0 / height, 0.0,         -(top + bottom) / height,
            0.0,         0.0,          1.0 / depth, -near / depth,
            0.0,         0.0,          0.0,         1.0,
        );
        m
    }

    /// 转为 HLSL 默认的列主序常量布局
    pub fn to_gpu(m: &Matrix4) -> [[f32; 4]; 4] {
        // nalgebra 本身按列主序存储
        (*m).into()
    }
}

/// 颜色空间转换
pub mod color_space {
    /// sRGB 分量转线性
    pub fn srgb_to_linear(c: f32) -> f32 {
        if c <= 0.04045 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    }

    /// 线性分量转 sRGB
    pub fn linear_to_srgb(c: f32) -> f32 {
        if c <= 0.0031308 {
            c * 12.92
        } else {
            1.055 * c.powf(1.0 / 2.4) - 0.055
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affine_translation() {
        let m = matrix::affine(&Vector3::new(1.0, 1.0, 1.0), &Vector3::zeros(), &Vector3::new(1.0, 2.0, 3.0));
        let p = m * Vector4::new(0.0, 0.0, 0.0, 1.0);
        assert!((p.x - 1.0).abs() < 1e-6);
        assert!((p.y - 2.0).abs() < 1e-6);
        assert!((p.z - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_without_translation() {
        let m = matrix::affine(&Vector3::new(2.0, 2.0, 2.0), &Vector3::zeros(), &Vector3::new(5.0, 6.0, 7.0));
        let r = matrix::without_translation(&m);
        let p = r * Vector4::new(1.0, 0.0, 0.0, 1.0);
        assert!((p.x - 2.0).abs() < 1e-6);
        assert!(p.y.abs() < 1e-6);
        assert!(p.z.abs() < 1e-6);
    }

    #[test]
    fn test_perspective_depth_range() {
        let proj = matrix::perspective_fov_lh(0.45, 16.0 / 9.0, 0.1, 100.0);
        let near = proj * Vector4::new(0.0, 0.0, 0.1, 1.0);
        let far = proj * Vector4::new(0.0, 0.0, 100.0, 1.0);
        assert!((near.z / near.w).abs() < 1e-5);
        assert!((far.z / far.w - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_orthographic_maps_screen_to_ndc() {
        let proj = matrix::orthographic_lh(0.0, 0.0, 1280.0, 720.0, 0.0, 100.0);
        let top_left = proj * Vector4::new(0.0, 0.0, 0.0, 1.0);
        let bottom_right = proj * Vector4::new(1280.0, 720.0, 100.0, 1.0);
        assert!((top_left.x + 1.0).abs() < 1e-6 && (top_left.y - 1.0).abs() < 1e-6);
        assert!((bottom_right.x - 1.0).abs() < 1e-6 && (bottom_right.y + 1.0).abs() < 1e-6);
        assert!(top_left.z.abs() < 1e-6);
        assert!((bottom_right.z - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_srgb_round_trip() {
        for v in [0.0_f32, 0.02, 0.25, 0.5, 0.75, 1.0] {
            let back = color_space::linear_to_srgb(color_space::srgb_to_linear(v));
            assert!((back - v).abs() < 1e-5, "{v} -> {back}");
        }
    }
}
