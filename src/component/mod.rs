//! 组件
//!
//! 场景对象使用的空间变换和相机。

mod camera;
mod transform;

pub use camera::Camera;
pub use transform::Transform;
