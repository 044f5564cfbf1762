//! 网格
//!
//! [`Model`] 持有一份只读的顶点数据（非索引三角形列表）和它使用的纹理，
//! [`MeshObject`] 持有一个实例的变换、材质和光照常量。同一个模型可以被多个对象绘制。
//!
//! # 设计原则
//!
//! - **顶点只上传一次**：顶点缓冲是设备本地资源，经暂存缓冲上传，之后不再改写
//! - **常量按帧环形**：材质、变换、平行光和相机常量每帧写入当前帧的那一份
//! - **根参数顺序固定**：材质 b0(PS)、变换 b0(VS)、纹理 t0、平行光 b1、相机 b2
//!
//! 管线：alpha 混合、背面剔除、深度测试并写深度。

use std::f32::consts::PI;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info};

use crate::component::{Camera, Transform};
use crate::core::error::{ContractViolation, Result};
use crate::gfx::backend::{GpuBackend, GpuCommand};
use crate::math::{Color, Matrix4, Vector3};

use super::constant::{
    CameraConstants, DirectionalLightConstants, FrameConstants, LightingModel, MaterialConstants, TransformConstants,
};
use super::frame::{Renderer, DEPTH_FORMAT};
use super::resource::{ResourceDesc, TrackedResource};
use super::shaders::{
    BlendMode, CullMode, PipelineDesc, RootParameter, ShaderStage, VertexAttribute, VertexFormat, PIXEL_PROFILE,
    VERTEX_PROFILE,
};
use super::surface::BACK_BUFFER_FORMAT;
use super::texture::TextureCache;
use super::upload::StagingBuffer;

pub const VERTEX_SHADER: &str = "object3d.vs.hlsl";
pub const PIXEL_SHADER: &str = "object3d.ps.hlsl";

/// 默认球体的分割数
pub const SPHERE_SUBDIVISION: u32 = 16;

/// 网格、精灵和粒子共用的顶点格式
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 4],
    pub texcoord: [f32; 2],
    pub normal: [f32; 3],
}

pub const VERTEX_STRIDE: u32 = std::mem::size_of::<MeshVertex>() as u32;

/// `MeshVertex` 对应的输入布局
pub fn input_layout() -> Vec<VertexAttribute> {
    let (layout, _) = VertexAttribute::packed(&[
        ("POSITION", VertexFormat::Float4),
        ("TEXCOORD", VertexFormat::Float2),
        ("NORMAL", VertexFormat::Float3),
    ]);
    layout
}

/// 单位球，`subdivision` 为经纬两个方向的分割数
///
/// 每个格子两个三角形，共 `subdivision² × 6` 个顶点。法线等于位置。
pub fn sphere_vertices(subdivision: u32) -> Vec<MeshVertex> {
    let n = subdivision.max(1);
    let lat_step = PI / n as f32;
    let lon_step = 2.0 * PI / n as f32;

    let vertex = |theta: f32, phi: f32| {
        let position = [phi.cos() * theta.sin(), theta.cos(), phi.sin() * theta.sin()];
        MeshVertex {
            position: [position[0], position[1], position[2], 1.0],
            texcoord: [1.0 - phi / (2.0 * PI), theta / PI],
            normal: position,
        }
    };

    let mut vertices = Vec::with_capacity((n * n * 6) as usize);
    for lat in 0..n {
        let (theta0, theta1) = (lat as f32 * lat_step, (lat + 1) as f32 * lat_step);
        for lon in 0..n {
            let (phi0, phi1) = (lon as f32 * lon_step, (lon + 1) as f32 * lon_step);
            let a = vertex(theta0, phi0);
            let b = vertex(theta0, phi1);
            let c = vertex(theta1, phi0);
            let d = vertex(theta1, phi1);
            vertices.extend_from_slice(&[a, c, b, b, c, d]);
        }
    }
    vertices
}

/// 网格管线
pub struct MeshPipeline<B: GpuBackend> {
    pipeline: B::Pipeline,
}

impl<B: GpuBackend> MeshPipeline<B> {
    pub fn new(renderer: &mut Renderer<B>) -> Result<Self> {
        let vertex_shader = renderer.compile_shader(Path::new(VERTEX_SHADER), VERTEX_PROFILE)?;
        let pixel_shader = renderer.compile_shader(Path::new(PIXEL_SHADER), PIXEL_PROFILE)?;
        let pipeline = renderer.create_pipeline(&PipelineDesc {
            name: "object3d".to_string(),
            vertex_shader,
            pixel_shader,
            input_layout: input_layout(),
            root_parameters: vec![
                RootParameter::ConstantBuffer { register: 0, visibility: ShaderStage::Pixel },
                RootParameter::ConstantBuffer { register: 0, visibility: ShaderStage::Vertex },
                RootParameter::ShaderResourceTable { register: 0, visibility: ShaderStage::Pixel },
                RootParameter::ConstantBuffer { register: 1, visibility: ShaderStage::Pixel },
                RootParameter::ConstantBuffer { register: 2, visibility: ShaderStage::Pixel },
            ],
            blend: BlendMode::Alpha,
            cull: CullMode::Back,
            depth_test: true,
            depth_write: true,
            render_target_format: BACK_BUFFER_FORMAT,
            depth_format: DEPTH_FORMAT,
        })?;
        Ok(Self { pipeline })
    }

    pub fn pipeline(&self) -> &B::Pipeline {
        &self.pipeline
    }
}

/// 顶点数据和纹理
pub struct Model<B: GpuBackend> {
    vertex_buffer: TrackedResource<B::Resource>,
    vertex_staging: Option<StagingBuffer<B::Resource>>,
    vertex_count: u32,
    texture: String,
}

impl<B: GpuBackend> Model<B> {
    /// 从非索引三角形列表创建，顶点数必须是 3 的正整数倍
    pub fn new(renderer: &mut Renderer<B>, vertices: &[MeshVertex], texture: &str) -> Result<Self> {
        if vertices.is_empty() || vertices.len() % 3 != 0 {
            return Err(ContractViolation::InvalidMesh { vertices: vertices.len() }.into());
        }

        let bytes: &[u8] = bytemuck::cast_slice(vertices);
        let mut vertex_buffer = renderer.create_device_resource(&ResourceDesc::buffer(bytes.len() as u64))?;
        let vertex_staging = match renderer.upload_buffer_data(&mut vertex_buffer, bytes) {
            Ok(staging) => staging,
            Err(err) => {
                renderer.release_resource(vertex_buffer);
                return Err(err);
            }
        };

        info!(vertices = vertices.len(), texture, "Model created");
        Ok(Self {
            vertex_buffer,
            vertex_staging: Some(vertex_staging),
            vertex_count: vertices.len() as u32,
            texture: texture.to_string(),
        })
    }

    /// 上传完成后释放暂存缓冲
    pub fn update(&mut self, renderer: &mut Renderer<B>) {
        if let Some(staging) = self.vertex_staging.take() {
            self.vertex_staging = renderer.retire_staging(staging);
        }
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn texture_key(&self) -> &str {
        &self.texture
    }

    pub fn vertex_buffer(&self) -> &TrackedResource<B::Resource> {
        &self.vertex_buffer
    }

    pub fn release(self, renderer: &mut Renderer<B>) {
        if let Some(staging) = self.vertex_staging {
            renderer.backend_mut().release_resource(staging.into_resource());
        }
        renderer.release_resource(self.vertex_buffer);
    }
}

/// 平行光
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub color: Color,
    /// 光线前进的方向，写入时归一化
    pub direction: Vector3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self { color: Color::WHITE, direction: Vector3::new(0.0, -1.0, 0.0), intensity: 1.0 }
    }
}

impl DirectionalLight {
    fn to_constants(self) -> DirectionalLightConstants {
        let direction = self.direction.try_normalize(f32::EPSILON).unwrap_or_else(|| Vector3::new(0.0, -1.0, 0.0));
        DirectionalLightConstants {
            color: self.color.to_array(),
            direction: [direction.x, direction.y, direction.z],
            intensity: self.intensity,
        }
    }
}

/// 场景中的一个网格实例
pub struct MeshObject<B: GpuBackend> {
    pub transform: Transform,
    pub color: Color,
    /// `None` 时不做光照
    pub lighting: Option<LightingModel>,
    pub shininess: f32,
    pub uv_transform: Matrix4,
    pub light: DirectionalLight,
    material_buffers: FrameConstants<B::Resource, MaterialConstants>,
    transform_buffers: FrameConstants<B::Resource, TransformConstants>,
    light_buffers: FrameConstants<B::Resource, DirectionalLightConstants>,
    camera_buffers: FrameConstants<B::Resource, CameraConstants>,
    transform_constants: TransformConstants,
    camera_constants: CameraConstants,
}

impl<B: GpuBackend> MeshObject<B> {
    pub fn new(renderer: &mut Renderer<B>) -> Result<Self> {
        let material_buffers: FrameConstants<_, MaterialConstants> = FrameConstants::new(renderer)?;
        let transform_buffers: FrameConstants<_, TransformConstants> = match FrameConstants::new(renderer) {
            Ok(buffers) => buffers,
            Err(err) => {
                material_buffers.release(renderer);
                return Err(err);
            }
        };
        let light_buffers: FrameConstants<_, DirectionalLightConstants> = match FrameConstants::new(renderer) {
            Ok(buffers) => buffers,
            Err(err) => {
                material_buffers.release(renderer);
                transform_buffers.release(renderer);
                return Err(err);
            }
        };
        let camera_buffers: FrameConstants<_, CameraConstants> = match FrameConstants::new(renderer) {
            Ok(buffers) => buffers,
            Err(err) => {
                material_buffers.release(renderer);
                transform_buffers.release(renderer);
                light_buffers.release(renderer);
                return Err(err);
            }
        };

        let mut object = Self {
            transform: Transform::default(),
            color: Color::WHITE,
            lighting: Some(LightingModel::Phong),
            shininess: 40.0,
            uv_transform: Matrix4::identity(),
            light: DirectionalLight::default(),
            material_buffers,
            transform_buffers,
            light_buffers,
            camera_buffers,
            transform_constants: TransformConstants::new(&Matrix4::identity(), &Matrix4::identity()),
            camera_constants: CameraConstants::new(&Vector3::zeros()),
        };
        object.update(&Camera::default());
        Ok(object)
    }

    /// 按相机计算本帧的变换，`draw` 时写入常量缓冲
    pub fn update(&mut self, camera: &Camera) {
        self.transform_constants = TransformConstants::new(&self.transform.world_matrix(), &camera.view_projection());
        self.camera_constants = CameraConstants::new(&camera.position());
    }

    pub fn material_constants(&self) -> MaterialConstants {
        MaterialConstants::new(self.color, self.lighting, &self.uv_transform, self.shininess)
    }

    pub fn transform_constants(&self) -> &TransformConstants {
        &self.transform_constants
    }

    /// 写入当前帧的常量并录制绘制
    pub fn draw(
        &self,
        renderer: &mut Renderer<B>,
        pipeline: &MeshPipeline<B>,
        model: &Model<B>,
        textures: &TextureCache<B::Resource>,
    ) -> Result<()> {
        if !renderer.is_in_frame() {
            return Err(ContractViolation::DrawOutsideFrame.into());
        }
        let texture = textures.gpu_handle(textures.index_of(model.texture_key())?)?;

        let material = self.material_buffers.write(renderer, &self.material_constants())?.handle();
        let transform = self.transform_buffers.write(renderer, &self.transform_constants)?.handle();
        let light = self.light_buffers.write(renderer, &self.light.to_constants())?.handle();
        let camera = self.camera_buffers.write(renderer, &self.camera_constants)?.handle();

        let vertex_size = model.vertex_count as u64 * VERTEX_STRIDE as u64;
        let mut recorder = renderer.current_command_batch()?;
        recorder.record(GpuCommand::SetPipeline(pipeline.pipeline()))?;
        recorder.record(GpuCommand::SetVertexBuffer {
            buffer: model.vertex_buffer.handle(),
            stride: VERTEX_STRIDE,
            size: vertex_size,
        })?;
        recorder.record(GpuCommand::SetRootConstantBuffer { index: 0, buffer: material })?;
        recorder.record(GpuCommand::SetRootConstantBuffer { index: 1, buffer: transform })?;
        recorder.record(GpuCommand::SetRootDescriptorTable { index: 2, base: texture })?;
        recorder.record(GpuCommand::SetRootConstantBuffer { index: 3, buffer: light })?;
        recorder.record(GpuCommand::SetRootConstantBuffer { index: 4, buffer: camera })?;
        recorder.record(GpuCommand::DrawInstanced { vertex_count: model.vertex_count, instance_count: 1 })?;
        debug!(vertices = model.vertex_count, "Mesh drawn");
        Ok(())
    }

    pub fn release(self, renderer: &mut Renderer<B>) {
        self.material_buffers.release(renderer);
        self.transform_buffers.release(renderer);
        self.light_buffers.release(renderer);
        self.camera_buffers.release(renderer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GraphicsConfig;
    use crate::gfx::headless::{CompletionMode, HeadlessDevice, RecordedCommand, ResourceId};
    use crate::renderer::mipmap::TextureImage;
    use crate::renderer::resource::ResourceState;
    use pretty_assertions::assert_eq;

    const TEXTURE: &str = "checker";

    fn setup() -> (Renderer<HeadlessDevice>, TextureCache<ResourceId>, MeshPipeline<HeadlessDevice>) {
        let mut renderer =
            Renderer::new(HeadlessDevice::new(16, 9, CompletionMode::Immediate), &GraphicsConfig::default()).unwrap();
        let mut textures = TextureCache::new();
        textures
            .load_image(&mut renderer, TEXTURE, TextureImage::from_pixels(2, 2, vec![255; 16]).unwrap())
            .unwrap();
        let pipeline = MeshPipeline::new(&mut renderer).unwrap();
        (renderer, textures, pipeline)
    }

    fn triangle() -> [MeshVertex; 3] {
        let v = |x: f32, y: f32| MeshVertex { position: [x, y, 0.0, 1.0], texcoord: [x, y], normal: [0.0, 0.0, -1.0] };
        [v(0.0, 1.0), v(1.0, -1.0), v(-1.0, -1.0)]
    }

    #[test]
    fn test_vertex_layout_is_36_bytes() {
        assert_eq!(VERTEX_STRIDE, 36);
        let offsets: Vec<u32> = input_layout().iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 16, 24]);
    }

    #[test]
    fn test_sphere_has_six_vertices_per_cell() {
        let vertices = sphere_vertices(SPHERE_SUBDIVISION);
        assert_eq!(vertices.len(), 16 * 16 * 6);

        for v in &vertices {
            let p = Vector3::new(v.position[0], v.position[1], v.position[2]);
            assert!((p.norm() - 1.0).abs() < 1e-5);
            assert_eq!(v.normal, [p.x, p.y, p.z]);
            assert!(v.texcoord.iter().all(|t| (-1e-5..=1.0 + 1e-5).contains(t)));
        }
        // 第一个格子从北极开始
        assert!((vertices[0].position[1] - 1.0).abs() < 1e-6);
        assert_eq!(vertices[0].texcoord, [1.0, 0.0]);
    }

    #[test]
    fn test_model_rejects_incomplete_triangles() {
        let (mut renderer, _, _) = setup();
        let live = renderer.backend().live_resource_count();

        let err = Model::new(&mut renderer, &triangle()[..2], TEXTURE).err().unwrap();
        assert!(err.is_contract_violation());
        assert!(Model::new(&mut renderer, &[], TEXTURE).is_err());
        assert_eq!(renderer.backend().live_resource_count(), live);
    }

    #[test]
    fn test_model_uploads_vertices_once() {
        let (mut renderer, _, _) = setup();
        let mut model = Model::new(&mut renderer, &triangle(), TEXTURE).unwrap();
        renderer.flush().unwrap();
        model.update(&mut renderer);

        let handle = *model.vertex_buffer().handle();
        let bytes = renderer.backend().read_resource(handle).unwrap();
        assert_eq!(bytes.as_slice(), bytemuck::cast_slice::<MeshVertex, u8>(&triangle()));
        assert_eq!(model.vertex_buffer().state(), ResourceState::GenericRead);
        model.release(&mut renderer);
    }

    #[test]
    fn test_draw_binds_constants_texture_and_vertices() {
        let (mut renderer, textures, pipeline) = setup();
        let model = Model::new(&mut renderer, &sphere_vertices(4), TEXTURE).unwrap();
        let mut object = MeshObject::new(&mut renderer).unwrap();
        renderer.flush().unwrap();

        let mut camera = Camera::new(16.0 / 9.0);
        camera.set_position(Vector3::new(0.0, 4.0, -10.0));
        camera.update();
        object.transform.translate = Vector3::new(1.0, 0.0, 0.0);
        object.update(&camera);

        renderer.begin_frame().unwrap();
        let slot = renderer.frame_index();
        object.draw(&mut renderer, &pipeline, &model, &textures).unwrap();
        renderer.end_frame().unwrap();

        let frame = renderer.backend().submitted_commands().last().unwrap();
        let start = frame.iter().position(|c| *c == RecordedCommand::SetPipeline("object3d".to_string())).unwrap();
        let expected = vec![
            RecordedCommand::SetPipeline("object3d".to_string()),
            RecordedCommand::SetVertexBuffer {
                buffer: *model.vertex_buffer().handle(),
                stride: VERTEX_STRIDE,
                size: 4 * 4 * 6 * VERTEX_STRIDE as u64,
            },
            RecordedCommand::SetRootConstantBuffer {
                index: 0,
                buffer: *object.material_buffers.buffer(slot).unwrap().handle(),
            },
            RecordedCommand::SetRootConstantBuffer {
                index: 1,
                buffer: *object.transform_buffers.buffer(slot).unwrap().handle(),
            },
            RecordedCommand::SetRootDescriptorTable { index: 2, base: textures.gpu_handle(0).unwrap() },
            RecordedCommand::SetRootConstantBuffer { index: 3, buffer: *object.light_buffers.buffer(slot).unwrap().handle() },
            RecordedCommand::SetRootConstantBuffer {
                index: 4,
                buffer: *object.camera_buffers.buffer(slot).unwrap().handle(),
            },
            RecordedCommand::DrawInstanced { vertex_count: 96, instance_count: 1 },
        ];
        assert_eq!(frame[start..start + expected.len()].to_vec(), expected);
        assert!(renderer.backend().validation_errors().is_empty());

        let transform = object.transform_buffers.buffer(slot).unwrap().handle();
        let bytes = renderer.backend().read_resource(*transform).unwrap();
        let written: TransformConstants = bytemuck::pod_read_unaligned(&bytes[..128]);
        let world = object.transform.world_matrix();
        assert_eq!(written, TransformConstants::new(&world, &camera.view_projection()));
    }

    #[test]
    fn test_material_defaults_to_phong_white() {
        let (mut renderer, _, _) = setup();
        let object = MeshObject::<HeadlessDevice>::new(&mut renderer).unwrap();
        let material = object.material_constants();
        assert_eq!(material.color, [1.0; 4]);
        assert_eq!(material.enable_lighting, 1);
        assert_eq!(material.lighting_model, LightingModel::Phong as i32);
        assert_eq!(material.shininess, 40.0);
        assert_eq!(material.uv_transform, crate::math::matrix::to_gpu(&Matrix4::identity()));
    }

    #[test]
    fn test_light_direction_is_normalized() {
        let light = DirectionalLight { direction: Vector3::new(0.0, -3.0, 4.0), ..DirectionalLight::default() };
        let constants = light.to_constants();
        assert!((constants.direction[1] + 0.6).abs() < 1e-6);
        assert!((constants.direction[2] - 0.8).abs() < 1e-6);

        let degenerate = DirectionalLight { direction: Vector3::zeros(), ..DirectionalLight::default() };
        assert_eq!(degenerate.to_constants().direction, [0.0, -1.0, 0.0]);
    }

    #[test]
    fn test_draw_with_unloaded_texture_is_contract_error() {
        let (mut renderer, textures, pipeline) = setup();
        let model = Model::new(&mut renderer, &triangle(), "missing").unwrap();
        let object = MeshObject::new(&mut renderer).unwrap();
        renderer.flush().unwrap();

        assert!(object.draw(&mut renderer, &pipeline, &model, &textures).unwrap_err().is_contract_violation());
        renderer.begin_frame().unwrap();
        let err = object.draw(&mut renderer, &pipeline, &model, &textures).unwrap_err();
        assert!(err.is_contract_violation());
    }
}
