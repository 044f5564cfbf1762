//! 应用上下文
//!
//! [`Engine`] 按构造顺序持有设备（在渲染核心里）、纹理缓存、粒子系统、精灵和网格以及场景状态机，
//! 取代全局单例。所有可变状态都只能通过 `&mut Engine` 访问。
//!
//! # 生命周期
//!
//! ```text
//! new:       渲染核心 -> 纹理缓存 -> 预加载粒子纹理 -> 粒子系统 -> 精灵和网格
//!            -> 提交初始上传 -> 刷新 -> 释放暂存缓冲
//! run_frame: 场景更新 -> begin_frame -> 场景绘制 -> end_frame -> 暂存回收
//! shutdown:  刷新 GPU -> 释放粒子、精灵、网格和纹理资源
//! ```
//!
//! 没有显式调用 `shutdown` 时，`Drop` 会执行同样的流程。`new` 中途失败时
//! 已经创建的部分也走这条路径释放。

use tracing::debug;

use crate::core::config::Config;
use crate::core::error::{ContractViolation, Result};
use crate::core::input::InputSystem;
use crate::core::scene::{SceneContext, SceneDirector, SceneDrawables, SceneKind};
use crate::gfx::backend::GpuBackend;
use crate::renderer::frame::Renderer;
use crate::renderer::mipmap::TextureImage;
use crate::renderer::particle::ParticleSystem;
use crate::renderer::sync::FenceValue;
use crate::renderer::texture::TextureCache;
use crate::{engine_error, engine_info, engine_warn};

/// 粒子纹理缺失时使用的棋盘格尺寸
const FALLBACK_TEXTURE_SIZE: u32 = 64;
const FALLBACK_CELL_SIZE: u32 = 8;

/// 应用上下文
pub struct Engine<B: GpuBackend> {
    renderer: Renderer<B>,
    textures: TextureCache<B::Resource>,
    particles: Option<ParticleSystem<B>>,
    drawables: Option<SceneDrawables<B>>,
    scenes: SceneDirector,
    particle_texture: String,
    shut_down: bool,
}

impl<B: GpuBackend> Engine<B> {
    pub fn new(backend: B, config: &Config) -> Result<Self> {
        let renderer = Renderer::new(backend, &config.graphics)?;
        let mut engine = Self {
            renderer,
            textures: TextureCache::new(),
            particles: None,
            drawables: None,
            scenes: SceneDirector::new(SceneKind::Title),
            particle_texture: config.particles.texture.clone(),
            shut_down: false,
        };

        // 失败时 engine 在这里被丢弃，Drop 刷新 GPU 并释放已经创建的资源
        engine.load(config)?;
        Ok(engine)
    }

    fn load(&mut self, config: &Config) -> Result<()> {
        preload_texture(&mut self.renderer, &mut self.textures, &self.particle_texture)?;
        self.particles = Some(ParticleSystem::new(&mut self.renderer, &config.particles)?);
        self.drawables = Some(SceneDrawables::new(&mut self.renderer, &self.particle_texture)?);

        self.renderer.submit_uploads()?;
        self.renderer.flush()?;
        let released = self.textures.release_staging(&mut self.renderer);

        engine_info!(
            backend = self.renderer.backend().backend_name(),
            textures = self.textures.len(),
            staging_released = released,
            "Engine initialized"
        );
        Ok(())
    }

    /// 运行一帧：场景更新、录制、提交、呈现
    pub fn run_frame(&mut self, input: &InputSystem, dt: f32) -> Result<FenceValue> {
        let particles = self.particles.as_mut().ok_or(ContractViolation::EngineShutDown)?;
        let drawables = self.drawables.as_mut().ok_or(ContractViolation::EngineShutDown)?;
        let mut ctx = SceneContext {
            renderer: &mut self.renderer,
            textures: &mut self.textures,
            particles,
            drawables,
            input,
            particle_texture: &self.particle_texture,
        };

        self.scenes.update(&mut ctx, dt)?;
        ctx.renderer.begin_frame()?;
        self.scenes.draw(&mut ctx)?;
        let fence = ctx.renderer.end_frame()?;

        self.textures.release_staging(&mut self.renderer);
        Ok(fence)
    }

    /// 窗口尺寸变化
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.renderer.resize(width, height)
    }

    /// 刷新 GPU 并释放所有资源，可以重复调用
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.renderer.flush()?;
        if let Some(particles) = self.particles.take() {
            particles.release(&mut self.renderer);
        }
        if let Some(drawables) = self.drawables.take() {
            drawables.release(&mut self.renderer);
        }
        self.textures.release_all(&mut self.renderer);

        engine_info!(frames = self.renderer.frame_count(), "Engine shut down");
        Ok(())
    }

    pub fn renderer(&self) -> &Renderer<B> {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer<B> {
        &mut self.renderer
    }

    pub fn textures(&self) -> &TextureCache<B::Resource> {
        &self.textures
    }

    pub fn particles(&self) -> Option<&ParticleSystem<B>> {
        self.particles.as_ref()
    }

    pub fn drawables(&self) -> Option<&SceneDrawables<B>> {
        self.drawables.as_ref()
    }

    pub fn scenes(&self) -> &SceneDirector {
        &self.scenes
    }

    pub fn scenes_mut(&mut self) -> &mut SceneDirector {
        &mut self.scenes
    }

    pub fn particle_texture(&self) -> &str {
        &self.particle_texture
    }
}

impl<B: GpuBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            engine_error!(error = %err, "Engine shutdown failed");
        }
    }
}

/// 加载粒子纹理，文件不可用时以同一个键上传一张棋盘格
fn preload_texture<B: GpuBackend>(
    renderer: &mut Renderer<B>,
    textures: &mut TextureCache<B::Resource>,
    path: &str,
) -> Result<usize> {
    match textures.load(renderer, path) {
        Ok(index) => Ok(index),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            engine_warn!(path, error = %err, "Particle texture unavailable, using a generated checker");
            textures.load_image(renderer, path, checker_image(FALLBACK_TEXTURE_SIZE, FALLBACK_CELL_SIZE)?)
        }
    }
}

fn checker_image(size: u32, cell: u32) -> Result<TextureImage> {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / cell) + (y / cell)) % 2 == 0;
            let value = if light { 230 } else { 40 };
            pixels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    debug!(size, cell, "Checker texture generated");
    TextureImage::from_pixels(size, size, pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::headless::{CompletionMode, HeadlessDevice, RecordedCommand};
    use crate::renderer::texture::TextureState;
    use pretty_assertions::assert_eq;
    use winit::event::ElementState;
    use winit::keyboard::KeyCode;

    fn config() -> Config {
        let mut config = Config::default();
        config.particles.texture = "does/not/exist.png".to_string();
        config
    }

    #[test]
    fn test_startup_preloads_and_retires_staging() {
        let engine = Engine::new(HeadlessDevice::new(32, 18, CompletionMode::Immediate), &config()).unwrap();

        assert_eq!(engine.textures().len(), 1);
        assert_eq!(engine.textures().pending_staging(), 0);
        assert_eq!(engine.textures().state(engine.particle_texture()), TextureState::Resident);
        assert_eq!(engine.scenes().pending(), Some(SceneKind::Title));
        // 初始上传已经提交并完成
        assert!(!engine.renderer().is_in_frame());
        assert_eq!(engine.renderer().completed_fence(), engine.renderer().last_signaled_fence());
    }

    #[test]
    fn test_title_to_game_draws_particles() {
        let mut engine = Engine::new(HeadlessDevice::new(32, 18, CompletionMode::Immediate), &config()).unwrap();
        let mut input = InputSystem::default();

        engine.run_frame(&input, 0.016).unwrap();
        assert_eq!(engine.scenes().current(), SceneKind::Title);

        input.on_keyboard_input(KeyCode::Space, ElementState::Pressed);
        engine.run_frame(&input, 0.016).unwrap();
        input.end_frame();
        engine.run_frame(&input, 0.016).unwrap();
        assert_eq!(engine.scenes().current(), SceneKind::Game);

        let last = engine.renderer().backend().submitted_commands().last().unwrap();
        assert!(last.iter().any(|c| matches!(c, RecordedCommand::DrawInstanced { vertex_count: 6, .. })));
        assert!(engine.renderer().backend().validation_errors().is_empty());
    }

    #[test]
    fn test_shutdown_releases_everything_but_the_swapchain() {
        let mut engine = Engine::new(HeadlessDevice::new(8, 8, CompletionMode::Immediate), &config()).unwrap();
        engine.run_frame(&InputSystem::default(), 0.016).unwrap();
        engine.shutdown().unwrap();
        engine.shutdown().unwrap();

        // 两个后缓冲和深度缓冲归渲染核心所有
        assert_eq!(engine.renderer().backend().live_resource_count(), 3);
        let err = engine.run_frame(&InputSystem::default(), 0.016).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_failed_startup_releases_what_was_created() {
        let mut config = config();
        // 纹理占用槽 1 之后，粒子的两个实例缓冲只分到一个槽位
        config.graphics.pools.shader_visible = 3;
        let device = HeadlessDevice::new(8, 8, CompletionMode::Immediate);
        let timeline = device.timeline();

        let err = Engine::new(device, &config).err().unwrap();
        assert!(err.to_string().contains("exhausted"), "{err}");
        assert_eq!(timeline.live_resource_count(), 3);
        assert_eq!(timeline.removed_reason(), None);
    }

    #[test]
    fn test_missing_sprite_shader_releases_particles_and_textures() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["particle.vs.hlsl", "particle.ps.hlsl"] {
            std::fs::copy(std::path::Path::new("shaders").join(name), dir.path().join(name)).unwrap();
        }
        let mut config = config();
        config.graphics.shader_dir = dir.path().display().to_string();
        let device = HeadlessDevice::new(8, 8, CompletionMode::Immediate);
        let timeline = device.timeline();

        let err = Engine::new(device, &config).err().unwrap();
        assert!(err.is_fatal());
        // 粒子顶点和纹理的上传已经提交执行，之后才释放
        assert_eq!(timeline.live_resource_count(), 3);
        assert_eq!(timeline.removed_reason(), None);
        assert_eq!(timeline.pending_len(), 0);
    }

    #[test]
    fn test_checker_fallback_has_requested_size() {
        let image = checker_image(16, 4).unwrap();
        assert_eq!((image.metadata.width, image.metadata.height), (16, 16));
    }
}
