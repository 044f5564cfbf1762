//! 精灵
//!
//! 屏幕空间的带纹理四边形。坐标以像素为单位，原点在客户区左上角，y 向下；
//! 正交投影覆盖整个表面，深度范围 [0, 1]。
//!
//! 世界矩阵为 `T(position) * Rz(rotation) * S(size) * T(-anchor)`，
//! 顶点是 (0,0)-(1,1) 的单位四边形，`anchor` 决定旋转和定位的基准点。
//!
//! 管线：alpha 混合、不剔除、不做深度测试，在 3D 内容之后绘制。

use std::path::Path;

use tracing::debug;

use crate::core::error::{ContractViolation, Result};
use crate::gfx::backend::{GpuBackend, GpuCommand};
use crate::math::{matrix, Color, Matrix4, Vector2, Vector3};

use super::constant::{FrameConstants, MaterialConstants, TransformConstants};
use super::frame::{Renderer, DEPTH_FORMAT};
use super::mesh::{input_layout, MeshVertex, VERTEX_STRIDE};
use super::resource::{ResourceDesc, TrackedResource};
use super::shaders::{BlendMode, CullMode, PipelineDesc, RootParameter, ShaderStage, PIXEL_PROFILE, VERTEX_PROFILE};
use super::surface::BACK_BUFFER_FORMAT;
use super::texture::TextureCache;
use super::upload::StagingBuffer;

pub const VERTEX_SHADER: &str = "sprite.vs.hlsl";
pub const PIXEL_SHADER: &str = "sprite.ps.hlsl";

/// 默认尺寸（像素）
pub const DEFAULT_SIZE: f32 = 100.0;

const QUAD_VERTEX_COUNT: u32 = 6;

const fn corner(x: f32, y: f32) -> MeshVertex {
    MeshVertex { position: [x, y, 0.0, 1.0], texcoord: [x, y], normal: [0.0, 0.0, -1.0] }
}

/// 左上角为原点的单位四边形
const QUAD_VERTICES: [MeshVertex; QUAD_VERTEX_COUNT as usize] = [
    corner(0.0, 0.0),
    corner(1.0, 0.0),
    corner(0.0, 1.0),
    corner(1.0, 0.0),
    corner(1.0, 1.0),
    corner(0.0, 1.0),
];

/// 精灵管线
pub struct SpritePipeline<B: GpuBackend> {
    pipeline: B::Pipeline,
}

impl<B: GpuBackend> SpritePipeline<B> {
    pub fn new(renderer: &mut Renderer<B>) -> Result<Self> {
        let vertex_shader = renderer.compile_shader(Path::new(VERTEX_SHADER), VERTEX_PROFILE)?;
        let pixel_shader = renderer.compile_shader(Path::new(PIXEL_SHADER), PIXEL_PROFILE)?;
        let pipeline = renderer.create_pipeline(&PipelineDesc {
            name: "sprite".to_string(),
            vertex_shader,
            pixel_shader,
            input_layout: input_layout(),
            root_parameters: vec![
                RootParameter::ConstantBuffer { register: 0, visibility: ShaderStage::Pixel },
                RootParameter::ConstantBuffer { register: 0, visibility: ShaderStage::Vertex },
                RootParameter::ShaderResourceTable { register: 0, visibility: ShaderStage::Pixel },
            ],
            blend: BlendMode::Alpha,
            cull: CullMode::None,
            depth_test: false,
            depth_write: false,
            render_target_format: BACK_BUFFER_FORMAT,
            depth_format: DEPTH_FORMAT,
        })?;
        Ok(Self { pipeline })
    }

    pub fn pipeline(&self) -> &B::Pipeline {
        &self.pipeline
    }
}

/// 屏幕空间精灵
pub struct Sprite<B: GpuBackend> {
    /// 锚点所在的屏幕位置（像素）
    pub position: Vector2,
    /// 绕 z 轴旋转（弧度）
    pub rotation: f32,
    pub size: Vector2,
    /// 0..1，(0,0) 为左上角
    pub anchor: Vector2,
    pub color: Color,
    pub uv_transform: Matrix4,
    texture: String,
    vertex_buffer: TrackedResource<B::Resource>,
    vertex_staging: Option<StagingBuffer<B::Resource>>,
    material_buffers: FrameConstants<B::Resource, MaterialConstants>,
    transform_buffers: FrameConstants<B::Resource, TransformConstants>,
    transform_constants: TransformConstants,
}

impl<B: GpuBackend> Sprite<B> {
    pub fn new(renderer: &mut Renderer<B>, texture: &str) -> Result<Self> {
        let material_buffers: FrameConstants<_, MaterialConstants> = FrameConstants::new(renderer)?;
        let transform_buffers: FrameConstants<_, TransformConstants> = match FrameConstants::new(renderer) {
            Ok(buffers) => buffers,
            Err(err) => {
                material_buffers.release(renderer);
                return Err(err);
            }
        };

        let bytes: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        let uploaded = renderer.create_device_resource(&ResourceDesc::buffer(bytes.len() as u64)).and_then(|mut buffer| {
            match renderer.upload_buffer_data(&mut buffer, bytes) {
                Ok(staging) => Ok((buffer, staging)),
                Err(err) => {
                    renderer.release_resource(buffer);
                    Err(err)
                }
            }
        });
        let (vertex_buffer, vertex_staging) = match uploaded {
            Ok(uploaded) => uploaded,
            Err(err) => {
                material_buffers.release(renderer);
                transform_buffers.release(renderer);
                return Err(err);
            }
        };

        let mut sprite = Self {
            position: Vector2::zeros(),
            rotation: 0.0,
            size: Vector2::new(DEFAULT_SIZE, DEFAULT_SIZE),
            anchor: Vector2::zeros(),
            color: Color::WHITE,
            uv_transform: Matrix4::identity(),
            texture: texture.to_string(),
            vertex_buffer,
            vertex_staging: Some(vertex_staging),
            material_buffers,
            transform_buffers,
            transform_constants: TransformConstants::new(&Matrix4::identity(), &Matrix4::identity()),
        };
        sprite.update(renderer);
        Ok(sprite)
    }

    /// 释放已完成的暂存缓冲，按当前表面尺寸计算变换
    pub fn update(&mut self, renderer: &mut Renderer<B>) {
        if let Some(staging) = self.vertex_staging.take() {
            self.vertex_staging = renderer.retire_staging(staging);
        }

        let (width, height) = renderer.surface_size();
        let projection = matrix::orthographic_lh(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
        self.transform_constants = TransformConstants::new(&self.world_matrix(), &projection);
    }

    pub fn world_matrix(&self) -> Matrix4 {
        let anchor = Matrix4::new_translation(&Vector3::new(-self.anchor.x, -self.anchor.y, 0.0));
        let scale = Matrix4::new_nonuniform_scaling(&Vector3::new(self.size.x, self.size.y, 1.0));
        let rotate = Matrix4::from_axis_angle(&Vector3::z_axis(), self.rotation);
        let translate = Matrix4::new_translation(&Vector3::new(self.position.x, self.position.y, 0.0));
        translate * rotate * scale * anchor
    }

    pub fn set_texture(&mut self, texture: &str) {
        self.texture = texture.to_string();
    }

    pub fn texture_key(&self) -> &str {
        &self.texture
    }

    pub fn transform_constants(&self) -> &TransformConstants {
        &self.transform_constants
    }

    /// 写入当前帧的常量并录制绘制
    pub fn draw(
        &self,
        renderer: &mut Renderer<B>,
        pipeline: &SpritePipeline<B>,
        textures: &TextureCache<B::Resource>,
    ) -> Result<()> {
        if !renderer.is_in_frame() {
            return Err(ContractViolation::DrawOutsideFrame.into());
        }
        let texture = textures.gpu_handle(textures.index_of(&self.texture)?)?;

        let material_constants = MaterialConstants::new(self.color, None, &self.uv_transform, 0.0);
        let material = self.material_buffers.write(renderer, &material_constants)?.handle();
        let transform = self.transform_buffers.write(renderer, &self.transform_constants)?.handle();

        let mut recorder = renderer.current_command_batch()?;
        recorder.record(GpuCommand::SetPipeline(pipeline.pipeline()))?;
        recorder.record(GpuCommand::SetVertexBuffer {
            buffer: self.vertex_buffer.handle(),
            stride: VERTEX_STRIDE,
            size: std::mem::size_of_val(&QUAD_VERTICES) as u64,
        })?;
        recorder.record(GpuCommand::SetRootConstantBuffer { index: 0, buffer: material })?;
        recorder.record(GpuCommand::SetRootConstantBuffer { index: 1, buffer: transform })?;
        recorder.record(GpuCommand::SetRootDescriptorTable { index: 2, base: texture })?;
        recorder.record(GpuCommand::DrawInstanced { vertex_count: QUAD_VERTEX_COUNT, instance_count: 1 })?;
        debug!(texture = %self.texture, "Sprite drawn");
        Ok(())
    }

    pub fn release(self, renderer: &mut Renderer<B>) {
        if let Some(staging) = self.vertex_staging {
            renderer.backend_mut().release_resource(staging.into_resource());
        }
        renderer.release_resource(self.vertex_buffer);
        self.material_buffers.release(renderer);
        self.transform_buffers.release(renderer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GraphicsConfig;
    use crate::gfx::headless::{CompletionMode, HeadlessDevice, RecordedCommand, ResourceId};
    use crate::math::Vector4;
    use crate::renderer::mipmap::TextureImage;
    use pretty_assertions::assert_eq;

    const TEXTURE: &str = "uv-checker";

    fn setup() -> (Renderer<HeadlessDevice>, TextureCache<ResourceId>, SpritePipeline<HeadlessDevice>) {
        let mut renderer =
            Renderer::new(HeadlessDevice::new(1280, 720, CompletionMode::Immediate), &GraphicsConfig::default())
                .unwrap();
        let mut textures = TextureCache::new();
        textures
            .load_image(&mut renderer, TEXTURE, TextureImage::from_pixels(2, 2, vec![255; 16]).unwrap())
            .unwrap();
        let pipeline = SpritePipeline::new(&mut renderer).unwrap();
        (renderer, textures, pipeline)
    }

    fn to_ndc(constants: &TransformConstants, x: f32, y: f32) -> Vector4 {
        let wvp = Matrix4::from(constants.wvp);
        wvp * Vector4::new(x, y, 0.0, 1.0)
    }

    #[test]
    fn test_quad_covers_position_to_position_plus_size() {
        let (mut renderer, _, _) = setup();
        let mut sprite = Sprite::new(&mut renderer, TEXTURE).unwrap();
        sprite.position = Vector2::new(100.0, 100.0);
        sprite.update(&mut renderer);

        let world = sprite.world_matrix();
        let far_corner = world * Vector4::new(1.0, 1.0, 0.0, 1.0);
        assert!((far_corner.x - 200.0).abs() < 1e-4 && (far_corner.y - 200.0).abs() < 1e-4);

        // 屏幕左上角映射到 NDC (-1, 1)
        sprite.position = Vector2::zeros();
        sprite.update(&mut renderer);
        let top_left = to_ndc(sprite.transform_constants(), 0.0, 0.0);
        assert!((top_left.x + 1.0).abs() < 1e-6 && (top_left.y - 1.0).abs() < 1e-6);
        sprite.release(&mut renderer);
    }

    #[test]
    fn test_anchor_centers_rotation() {
        let (mut renderer, _, _) = setup();
        let mut sprite = Sprite::new(&mut renderer, TEXTURE).unwrap();
        sprite.position = Vector2::new(640.0, 360.0);
        sprite.anchor = Vector2::new(0.5, 0.5);
        sprite.rotation = std::f32::consts::FRAC_PI_2;

        let center = sprite.world_matrix() * Vector4::new(0.5, 0.5, 0.0, 1.0);
        assert!((center.x - 640.0).abs() < 1e-3 && (center.y - 360.0).abs() < 1e-3);
        sprite.release(&mut renderer);
    }

    #[test]
    fn test_draw_records_constant_buffers_then_texture() {
        let (mut renderer, textures, pipeline) = setup();
        let mut sprite = Sprite::new(&mut renderer, TEXTURE).unwrap();
        renderer.flush().unwrap();
        sprite.update(&mut renderer);

        renderer.begin_frame().unwrap();
        let slot = renderer.frame_index();
        sprite.draw(&mut renderer, &pipeline, &textures).unwrap();
        renderer.end_frame().unwrap();

        let material = *sprite.material_buffers.buffer(slot).unwrap().handle();
        let transform = *sprite.transform_buffers.buffer(slot).unwrap().handle();
        let frame = renderer.backend().submitted_commands().last().unwrap();
        let start = frame.iter().position(|c| *c == RecordedCommand::SetPipeline("sprite".to_string())).unwrap();
        let expected = vec![
            RecordedCommand::SetPipeline("sprite".to_string()),
            RecordedCommand::SetVertexBuffer { buffer: *sprite.vertex_buffer.handle(), stride: 36, size: 6 * 36 },
            RecordedCommand::SetRootConstantBuffer { index: 0, buffer: material },
            RecordedCommand::SetRootConstantBuffer { index: 1, buffer: transform },
            RecordedCommand::SetRootDescriptorTable { index: 2, base: textures.gpu_handle(0).unwrap() },
            RecordedCommand::DrawInstanced { vertex_count: 6, instance_count: 1 },
        ];
        assert_eq!(frame[start..start + expected.len()].to_vec(), expected);
        assert!(renderer.backend().validation_errors().is_empty());

        let bytes = renderer.backend().read_resource(material).unwrap();
        let written: MaterialConstants = bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<MaterialConstants>()]);
        assert_eq!(written.enable_lighting, 0);
        assert_eq!(written.color, [1.0; 4]);
    }

    #[test]
    fn test_consecutive_frames_use_separate_constant_buffers() {
        let (mut renderer, textures, pipeline) = setup();
        let mut sprite = Sprite::new(&mut renderer, TEXTURE).unwrap();
        renderer.flush().unwrap();

        for _ in 0..2 {
            sprite.update(&mut renderer);
            renderer.begin_frame().unwrap();
            sprite.draw(&mut renderer, &pipeline, &textures).unwrap();
            renderer.end_frame().unwrap();
        }

        let history = renderer.backend().submitted_commands();
        let bound: Vec<ResourceId> = history[history.len() - 2..]
            .iter()
            .flat_map(|frame| frame.iter())
            .filter_map(|c| match c {
                RecordedCommand::SetRootConstantBuffer { index: 1, buffer } => Some(*buffer),
                _ => None,
            })
            .collect();
        assert_eq!(bound.len(), 2);
        assert_ne!(bound[0], bound[1]);
    }

    #[test]
    fn test_draw_with_unloaded_texture_is_contract_error() {
        let (mut renderer, textures, pipeline) = setup();
        let mut sprite = Sprite::new(&mut renderer, TEXTURE).unwrap();
        sprite.set_texture("missing");
        renderer.flush().unwrap();

        assert!(sprite.draw(&mut renderer, &pipeline, &textures).unwrap_err().is_contract_violation());
        renderer.begin_frame().unwrap();
        assert!(sprite.draw(&mut renderer, &pipeline, &textures).unwrap_err().is_contract_violation());
    }
}
