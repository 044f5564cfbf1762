//! 实例化粒子
//!
//! 所有粒子共享一张纹理和一个 6 顶点的四边形，每帧把存活粒子的实例数据
//! （WVP、World、颜色）紧密写入实例缓冲，然后一次实例化绘制。
//!
//! # 设计原则
//!
//! - **按帧环形**：每个在飞帧一个实例缓冲，写入前等待该帧的 Fence，
//!   CPU 不会覆盖 GPU 可能还在读取的内存
//! - **静默截断**：存活数超过容量时只写前 `capacity` 个，不报错
//! - **面向相机**：所有粒子共用相机世界矩阵去掉平移后的旋转
//!
//! 管线：加法混合、深度测试但不写深度、不剔除。

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace};

use crate::component::{Camera, Transform};
use crate::core::config::ParticleConfig;
use crate::core::error::{ContractViolation, Result};
use crate::gfx::backend::{GpuBackend, GpuCommand};
use crate::math::{matrix, Color, Matrix4, Vector3};

use super::descriptor::{GpuDescriptorHandle, ViewDesc};
use super::frame::{Renderer, DEPTH_FORMAT};
use super::resource::{ResourceDesc, TrackedResource};
use super::mesh::{input_layout, MeshVertex};
use super::shaders::{BlendMode, CullMode, PipelineDesc, RootParameter, ShaderStage, PIXEL_PROFILE, VERTEX_PROFILE};
use super::surface::BACK_BUFFER_FORMAT;
use super::texture::TextureCache;
use super::upload::StagingBuffer;

pub const VERTEX_SHADER: &str = "particle.vs.hlsl";
pub const PIXEL_SHADER: &str = "particle.ps.hlsl";

/// 四边形顶点数
pub const QUAD_VERTEX_COUNT: u32 = 6;

/// 四边形顶点
pub type ParticleVertex = MeshVertex;

const fn quad_vertex(x: f32, y: f32, u: f32, v: f32) -> ParticleVertex {
    ParticleVertex { position: [x, y, 0.0, 1.0], texcoord: [u, v], normal: [0.0, 0.0, -1.0] }
}

/// 两个三角形组成的单位四边形
pub const QUAD_VERTICES: [ParticleVertex; QUAD_VERTEX_COUNT as usize] = [
    quad_vertex(-0.5, 0.5, 0.0, 0.0),
    quad_vertex(-0.5, -0.5, 0.0, 1.0),
    quad_vertex(0.5, 0.5, 1.0, 0.0),
    quad_vertex(0.5, 0.5, 1.0, 0.0),
    quad_vertex(-0.5, -0.5, 0.0, 1.0),
    quad_vertex(0.5, -0.5, 1.0, 1.0),
];

/// 着色器读取的实例数据（`StructuredBuffer<ParticleForGPU>`）
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ParticleForGpu {
    pub wvp: [[f32; 4]; 4],
    pub world: [[f32; 4]; 4],
    pub color: [f32; 4],
}

pub const INSTANCE_STRIDE: u32 = std::mem::size_of::<ParticleForGpu>() as u32;

/// 一个粒子
#[derive(Debug, Clone)]
pub struct Particle {
    pub transform: Transform,
    pub velocity: Vector3,
    pub color: Color,
    /// 生命周期（秒）
    pub lifetime: f32,
    /// 已存活时间（秒）
    pub age: f32,
}

#[derive(Debug)]
struct InstanceSlot<R> {
    buffer: TrackedResource<R>,
    gpu_handle: GpuDescriptorHandle,
}

/// 粒子系统
pub struct ParticleSystem<B: GpuBackend> {
    config: ParticleConfig,
    particles: Vec<Particle>,
    instances: Vec<InstanceSlot<B::Resource>>,
    vertex_buffer: TrackedResource<B::Resource>,
    vertex_staging: Option<StagingBuffer<B::Resource>>,
    pipeline: B::Pipeline,
    texture: Option<String>,
    rng: StdRng,
    /// 本帧写入的实例数，以及写入时的帧序号
    written: u32,
    written_frame: Option<u64>,
    scratch: Vec<ParticleForGpu>,
}

impl<B: GpuBackend> ParticleSystem<B> {
    pub fn new(renderer: &mut Renderer<B>, config: &ParticleConfig) -> Result<Self> {
        Self::with_rng(renderer, config, StdRng::from_entropy())
    }

    /// 固定随机种子，发射结果可复现
    pub fn with_seed(renderer: &mut Renderer<B>, config: &ParticleConfig, seed: u64) -> Result<Self> {
        Self::with_rng(renderer, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(renderer: &mut Renderer<B>, config: &ParticleConfig, rng: StdRng) -> Result<Self> {
        config.validate()?;
        let pipeline = create_pipeline(renderer)?;

        let capacity = config.capacity;
        let ring = renderer.frames_in_flight();
        let mut instances = Vec::with_capacity(ring);
        for _ in 0..ring {
            match create_instance_slot(renderer, capacity) {
                Ok(slot) => instances.push(slot),
                Err(err) => {
                    release_instances(renderer, instances);
                    return Err(err);
                }
            }
        }

        // 顶点上传最后录制，之前的失败不会留下引用已释放资源的命令
        let vertex_bytes = bytemuck::cast_slice(&QUAD_VERTICES);
        let mut vertex_buffer = match renderer.create_device_resource(&ResourceDesc::buffer(vertex_bytes.len() as u64)) {
            Ok(buffer) => buffer,
            Err(err) => {
                release_instances(renderer, instances);
                return Err(err);
            }
        };
        let vertex_staging = match renderer.upload_buffer_data(&mut vertex_buffer, vertex_bytes) {
            Ok(staging) => staging,
            Err(err) => {
                renderer.release_resource(vertex_buffer);
                release_instances(renderer, instances);
                return Err(err);
            }
        };

        info!(capacity, ring, "Particle system created");
        Ok(Self {
            config: config.clone(),
            particles: Vec::new(),
            instances,
            vertex_buffer,
            vertex_staging: Some(vertex_staging),
            pipeline,
            texture: None,
            rng,
            written: 0,
            written_frame: None,
            scratch: Vec::with_capacity(capacity as usize),
        })
    }

    /// 在 `origin` 附近发射 `count` 个粒子，纹理以最后一次发射为准
    pub fn emit(&mut self, texture_key: &str, origin: Vector3, count: usize) {
        self.texture = Some(texture_key.to_string());

        let jitter = self.config.position_jitter;
        let speed = self.config.velocity_range;
        let (life_min, life_max) = (self.config.lifetime_min, self.config.lifetime_max);
        for _ in 0..count {
            let offset = Vector3::new(
                self.rng.gen_range(-jitter..=jitter),
                self.rng.gen_range(-jitter..=jitter),
                self.rng.gen_range(-jitter..=jitter),
            );
            let velocity = Vector3::new(
                self.rng.gen_range(-speed..=speed),
                self.rng.gen_range(-speed..=speed),
                self.rng.gen_range(-speed..=speed),
            );
            self.particles.push(Particle {
                transform: Transform::at(origin + offset),
                velocity,
                color: Color::WHITE,
                lifetime: self.rng.gen_range(life_min..=life_max),
                age: 0.0,
            });
        }
        trace!(count, live = self.particles.len(), "Particles emitted");
    }

    /// 推进模拟并写入本帧的实例缓冲
    ///
    /// 必须在 `begin_frame` 之前或帧内调用，写入的数据只在同一帧的 `draw` 中使用。
    pub fn update(&mut self, renderer: &mut Renderer<B>, dt: f32, camera: &Camera) -> Result<()> {
        if let Some(staging) = self.vertex_staging.take() {
            self.vertex_staging = renderer.retire_staging(staging);
        }

        for particle in &mut self.particles {
            particle.age += dt;
            particle.transform.translate += particle.velocity * dt;
        }
        self.particles.retain(|p| p.age < p.lifetime);
        for particle in &mut self.particles {
            particle.color.a = 1.0 - particle.age / particle.lifetime;
        }

        let billboard = camera.billboard();
        let view_proj = camera.view_projection();
        let capacity = self.config.capacity as usize;

        self.scratch.clear();
        for particle in self.particles.iter().take(capacity) {
            let world = instance_world(&particle.transform, &billboard);
            self.scratch.push(ParticleForGpu {
                wvp: matrix::to_gpu(&(view_proj * world)),
                world: matrix::to_gpu(&world),
                color: particle.color.to_array(),
            });
        }

        renderer.wait_for_frame_slot()?;
        let slot = &self.instances[renderer.frame_index() % self.instances.len()];
        if !self.scratch.is_empty() {
            renderer.write_buffer(&slot.buffer, 0, bytemuck::cast_slice(&self.scratch))?;
        }

        self.written = self.scratch.len() as u32;
        self.written_frame = Some(renderer.frame_count());
        if self.particles.len() > capacity {
            debug!(live = self.particles.len(), capacity, "Particle instances capped");
        }
        Ok(())
    }

    /// 录制实例化绘制，返回绘制的实例数
    ///
    /// 本帧没有调用过 `update` 或没有存活粒子时不录制任何命令。
    pub fn draw(&mut self, renderer: &mut Renderer<B>, textures: &TextureCache<B::Resource>) -> Result<u32> {
        if !renderer.is_in_frame() {
            return Err(ContractViolation::DrawOutsideFrame.into());
        }
        if self.written == 0 || self.written_frame != Some(renderer.frame_count()) {
            return Ok(0);
        }
        let Some(key) = self.texture.as_deref() else {
            return Ok(0);
        };
        let texture = textures.gpu_handle(textures.index_of(key)?)?;

        let slot = &self.instances[renderer.frame_index() % self.instances.len()];
        let vertex_size = std::mem::size_of_val(&QUAD_VERTICES) as u64;
        let stride = std::mem::size_of::<ParticleVertex>() as u32;

        let mut recorder = renderer.current_command_batch()?;
        recorder.record(GpuCommand::SetPipeline(&self.pipeline))?;
        recorder.record(GpuCommand::SetVertexBuffer { buffer: self.vertex_buffer.handle(), stride, size: vertex_size })?;
        recorder.record(GpuCommand::SetRootDescriptorTable { index: 0, base: slot.gpu_handle })?;
        recorder.record(GpuCommand::SetRootDescriptorTable { index: 1, base: texture })?;
        recorder.record(GpuCommand::DrawInstanced { vertex_count: QUAD_VERTEX_COUNT, instance_count: self.written })?;
        Ok(self.written)
    }

    /// 存活粒子数
    pub fn live_count(&self) -> usize {
        self.particles.len()
    }

    /// 本帧写入实例缓冲的粒子数
    pub fn written_count(&self) -> u32 {
        self.written
    }

    pub fn capacity(&self) -> u32 {
        self.config.capacity
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn texture_key(&self) -> Option<&str> {
        self.texture.as_deref()
    }

    pub fn clear(&mut self) {
        self.particles.clear();
        self.written = 0;
    }

    /// 实例缓冲环中第 `index` 个缓冲
    pub fn instance_buffer(&self, index: usize) -> Option<&TrackedResource<B::Resource>> {
        self.instances.get(index).map(|slot| &slot.buffer)
    }

    /// 关闭时释放 GPU 资源，调用前 GPU 必须已刷新
    pub fn release(self, renderer: &mut Renderer<B>) {
        if let Some(staging) = self.vertex_staging {
            renderer.backend_mut().release_resource(staging.into_resource());
        }
        renderer.release_resource(self.vertex_buffer);
        release_instances(renderer, self.instances);
    }
}

fn create_instance_slot<B: GpuBackend>(renderer: &mut Renderer<B>, capacity: u32) -> Result<InstanceSlot<B::Resource>> {
    let buffer = renderer.create_buffer_resource(capacity as u64 * INSTANCE_STRIDE as u64)?;
    let view = ViewDesc::StructuredBuffer { num_elements: capacity, stride: INSTANCE_STRIDE };
    let bound = renderer.allocate_view_slot().and_then(|slot| {
        renderer.create_view(slot, buffer.handle(), &view)?;
        Ok(slot)
    });
    match bound {
        Ok(slot) => {
            let (_, gpu_handle) = renderer.view_slot_addresses(slot);
            Ok(InstanceSlot { buffer, gpu_handle })
        }
        Err(err) => {
            renderer.release_resource(buffer);
            Err(err)
        }
    }
}

fn release_instances<B: GpuBackend>(renderer: &mut Renderer<B>, instances: Vec<InstanceSlot<B::Resource>>) {
    for slot in instances {
        renderer.release_resource(slot.buffer);
    }
}

/// world = T * B * S
fn instance_world(transform: &Transform, billboard: &Matrix4) -> Matrix4 {
    Matrix4::new_translation(&transform.translate) * billboard * Matrix4::new_nonuniform_scaling(&transform.scale)
}

fn create_pipeline<B: GpuBackend>(renderer: &mut Renderer<B>) -> Result<B::Pipeline> {
    let vertex_shader = renderer.compile_shader(Path::new(VERTEX_SHADER), VERTEX_PROFILE)?;
    let pixel_shader = renderer.compile_shader(Path::new(PIXEL_SHADER), PIXEL_PROFILE)?;
    renderer.create_pipeline(&PipelineDesc {
        name: "particle".to_string(),
        vertex_shader,
        pixel_shader,
        input_layout: input_layout(),
        root_parameters: vec![
            RootParameter::ShaderResourceTable { register: 0, visibility: ShaderStage::Vertex },
            RootParameter::ShaderResourceTable { register: 0, visibility: ShaderStage::Pixel },
        ],
        blend: BlendMode::Additive,
        cull: CullMode::None,
        depth_test: true,
        depth_write: false,
        render_target_format: BACK_BUFFER_FORMAT,
        depth_format: DEPTH_FORMAT,
    })
}
