//! Transform 组件
//!
//! 缩放、欧拉角旋转（弧度）和平移，世界矩阵为 `T * R * S`。

use crate::math::{matrix, Matrix4, Vector3};

/// 空间变换
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// 缩放
    pub scale: Vector3,

    /// 欧拉角（弧度）：x 俯仰，y 偏航，z 翻滚
    pub rotate: Vector3,

    /// 位置
    pub translate: Vector3,
}

impl Transform {
    pub fn new(scale: Vector3, rotate: Vector3, translate: Vector3) -> Self {
        Self { scale, rotate, translate }
    }

    /// 单位缩放、无旋转，位于 `translate`
    pub fn at(translate: Vector3) -> Self {
        Self { translate, ..Self::default() }
    }

    /// 世界矩阵
    pub fn world_matrix(&self) -> Matrix4 {
        matrix::affine(&self.scale, &self.rotate, &self.translate)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            scale: Vector3::new(1.0, 1.0, 1.0),
            rotate: Vector3::zeros(),
            translate: Vector3::zeros(),
        }
    }
}
