//! 每帧常量缓冲
//!
//! 常量缓冲放在上传堆上，CPU 每帧改写，通过根 CBV 绑定。每个在飞帧一份，
//! 只写当前帧的那一份：`begin_frame` 已经等待过该帧的 Fence，GPU 不会再读它。

use std::marker::PhantomData;

use bytemuck::{Pod, Zeroable};

use crate::core::error::Result;
use crate::gfx::backend::GpuBackend;
use crate::math::{matrix, Color, Matrix4, Vector3};

use super::frame::Renderer;
use super::resource::TrackedResource;

/// 根 CBV 地址对齐
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// 向上取整到 CBV 对齐
pub fn aligned_size(size: u64) -> u64 {
    (size + CONSTANT_BUFFER_ALIGNMENT - 1) / CONSTANT_BUFFER_ALIGNMENT * CONSTANT_BUFFER_ALIGNMENT
}

/// 光照模型，数值与像素着色器里的 `lightingType` 一致
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightingModel {
    HalfLambert = 0,
    Lambert = 1,
    Phong = 2,
    BlinnPhong = 3,
}

/// 材质（`cbuffer Material : register(b0)`，像素着色器）
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialConstants {
    pub color: [f32; 4],
    pub enable_lighting: i32,
    pub padding: [f32; 3],
    pub uv_transform: [[f32; 4]; 4],
    pub shininess: f32,
    pub lighting_model: i32,
    pub padding2: [f32; 2],
}

impl MaterialConstants {
    /// `lighting` 为 `None` 时不做光照，直接输出纹理色乘材质色
    pub fn new(color: Color, lighting: Option<LightingModel>, uv_transform: &Matrix4, shininess: f32) -> Self {
        Self {
            color: color.to_array(),
            enable_lighting: lighting.is_some() as i32,
            padding: [0.0; 3],
            uv_transform: matrix::to_gpu(uv_transform),
            shininess,
            lighting_model: lighting.map_or(0, |model| model as i32),
            padding2: [0.0; 2],
        }
    }
}

/// 变换（`cbuffer TransformationMatrix : register(b0)`，顶点着色器）
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TransformConstants {
    pub wvp: [[f32; 4]; 4],
    pub world: [[f32; 4]; 4],
}

impl TransformConstants {
    pub fn new(world: &Matrix4, view_projection: &Matrix4) -> Self {
        Self { wvp: matrix::to_gpu(&(view_projection * world)), world: matrix::to_gpu(world) }
    }
}

/// 平行光（`cbuffer DirectionalLight : register(b1)`）
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DirectionalLightConstants {
    pub color: [f32; 4],
    pub direction: [f32; 3],
    pub intensity: f32,
}

/// 相机位置（`cbuffer Camera : register(b2)`），用于镜面反射
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraConstants {
    pub world_position: [f32; 3],
    pub padding: f32,
}

impl CameraConstants {
    pub fn new(position: &Vector3) -> Self {
        Self { world_position: [position.x, position.y, position.z], padding: 0.0 }
    }
}

/// 每个在飞帧一个的常量缓冲环
pub struct FrameConstants<R, T> {
    buffers: Vec<TrackedResource<R>>,
    _marker: PhantomData<T>,
}

impl<R, T: Pod> FrameConstants<R, T> {
    pub fn new<B>(renderer: &mut Renderer<B>) -> Result<Self>
    where
        B: GpuBackend<Resource = R>,
    {
        let size = aligned_size(std::mem::size_of::<T>() as u64);
        let ring = renderer.frames_in_flight();
        let mut buffers = Vec::with_capacity(ring);
        for _ in 0..ring {
            match renderer.create_buffer_resource(size) {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => {
                    for buffer in buffers {
                        renderer.release_resource(buffer);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self { buffers, _marker: PhantomData })
    }

    /// 写入当前帧的缓冲并返回它
    pub fn write<B>(&self, renderer: &mut Renderer<B>, value: &T) -> Result<&TrackedResource<R>>
    where
        B: GpuBackend<Resource = R>,
    {
        let buffer = &self.buffers[renderer.frame_index() % self.buffers.len()];
        renderer.write_buffer(buffer, 0, bytemuck::bytes_of(value))?;
        Ok(buffer)
    }

    pub fn buffer(&self, index: usize) -> Option<&TrackedResource<R>> {
        self.buffers.get(index)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// 调用前 GPU 必须已刷新
    pub fn release<B>(self, renderer: &mut Renderer<B>)
    where
        B: GpuBackend<Resource = R>,
    {
        for buffer in self.buffers {
            renderer.release_resource(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GraphicsConfig;
    use crate::gfx::headless::{CompletionMode, HeadlessDevice};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_constant_layouts_match_hlsl_packing() {
        assert_eq!(std::mem::size_of::<MaterialConstants>(), 112);
        assert_eq!(std::mem::size_of::<TransformConstants>(), 128);
        assert_eq!(std::mem::size_of::<DirectionalLightConstants>(), 32);
        assert_eq!(std::mem::size_of::<CameraConstants>(), 16);
    }

    #[test]
    fn test_sizes_round_up_to_cbv_alignment() {
        assert_eq!(aligned_size(1), 256);
        assert_eq!(aligned_size(256), 256);
        assert_eq!(aligned_size(257), 512);
    }

    #[test]
    fn test_write_targets_current_frame_buffer() {
        let mut renderer =
            Renderer::new(HeadlessDevice::new(8, 8, CompletionMode::Immediate), &GraphicsConfig::default()).unwrap();
        let constants = FrameConstants::<_, CameraConstants>::new(&mut renderer).unwrap();
        assert_eq!(constants.len(), renderer.frames_in_flight());

        let value = CameraConstants::new(&Vector3::new(1.0, 2.0, 3.0));
        let handle = *constants.write(&mut renderer, &value).unwrap().handle();
        assert_eq!(&handle, constants.buffer(renderer.frame_index()).unwrap().handle());

        let bytes = renderer.backend().read_resource(handle).unwrap();
        assert_eq!(bytes.len(), 256);
        let read: CameraConstants = bytemuck::pod_read_unaligned(&bytes[..16]);
        assert_eq!(read, value);
    }

    #[test]
    fn test_release_frees_every_buffer() {
        let mut renderer =
            Renderer::new(HeadlessDevice::new(8, 8, CompletionMode::Immediate), &GraphicsConfig::default()).unwrap();
        let before = renderer.backend().live_resource_count();
        let constants = FrameConstants::<_, TransformConstants>::new(&mut renderer).unwrap();
        assert_eq!(renderer.backend().live_resource_count(), before + constants.len());
        constants.release(&mut renderer);
        assert_eq!(renderer.backend().live_resource_count(), before);
    }
}
