//! 场景切换
//!
//! 同一时刻只有一个活动场景和至多一个待切换场景。`request` 只记录下一个场景，
//! 真正的切换发生在下一次 `update` 开头：先结束当前场景，再初始化新场景。
//!
//! # 场景
//!
//! - **Title**：只清屏，按空格进入 Game
//! - **Game**：相机漫游；原点放一个光照球体，左上方放一个调试精灵；
//!   按住空格在原点持续发射粒子，左键单击在相机前方发射一簇；按 T 回到 Title
//!
//! Game 的绘制顺序：球体（写深度）-> 粒子（只测深度）-> 精灵（覆盖在最上层）。

use tracing::{info, warn};
use winit::event::MouseButton;
use winit::keyboard::KeyCode;

use crate::component::Camera;
use crate::core::error::Result;
use crate::core::input::InputSystem;
use crate::gfx::backend::GpuBackend;
use crate::math::{Vector2, Vector3};
use crate::renderer::frame::Renderer;
use crate::renderer::mesh::{sphere_vertices, MeshObject, MeshPipeline, Model, SPHERE_SUBDIVISION};
use crate::renderer::particle::ParticleSystem;
use crate::renderer::sprite::{Sprite, SpritePipeline};
use crate::renderer::texture::TextureCache;

/// 按住空格时每帧发射的数量
const HOLD_EMIT_COUNT: usize = 2;
/// 单击时发射的数量
const CLICK_EMIT_COUNT: usize = 10;
/// 单击发射点在相机前方的距离
const CLICK_EMIT_DISTANCE: f32 = 5.0;
/// 调试精灵的位置和尺寸（像素）
const SPRITE_POSITION: [f32; 2] = [100.0, 100.0];
const SPRITE_SIZE: [f32; 2] = [100.0, 100.0];

/// 场景种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneKind {
    Title,
    Game,
}

/// 场景更新和绘制时可以访问的引擎状态
pub struct SceneContext<'a, B: GpuBackend> {
    pub renderer: &'a mut Renderer<B>,
    pub textures: &'a mut TextureCache<B::Resource>,
    pub particles: &'a mut ParticleSystem<B>,
    pub drawables: &'a mut SceneDrawables<B>,
    pub input: &'a InputSystem,
    /// 粒子使用的纹理键
    pub particle_texture: &'a str,
}

/// Game 场景的精灵和网格，连同它们的管线
pub struct SceneDrawables<B: GpuBackend> {
    pub sprite_pipeline: SpritePipeline<B>,
    pub mesh_pipeline: MeshPipeline<B>,
    pub sphere: Model<B>,
    pub sphere_object: MeshObject<B>,
    pub sprite: Sprite<B>,
}

impl<B: GpuBackend> SceneDrawables<B> {
    /// 球体和精灵都使用 `texture`，它必须已经在纹理缓存里
    pub fn new(renderer: &mut Renderer<B>, texture: &str) -> Result<Self> {
        let sprite_pipeline = SpritePipeline::new(renderer)?;
        let mesh_pipeline = MeshPipeline::new(renderer)?;

        let sphere_object = MeshObject::new(renderer)?;
        let mut sprite = match Sprite::new(renderer, texture) {
            Ok(sprite) => sprite,
            Err(err) => {
                sphere_object.release(renderer);
                return Err(err);
            }
        };
        let sphere = match Model::new(renderer, &sphere_vertices(SPHERE_SUBDIVISION), texture) {
            Ok(model) => model,
            Err(err) => {
                // 精灵的顶点上传已经录制，提交完成后才能释放
                if let Err(flush_err) = renderer.flush() {
                    warn!(error = %flush_err, "Flush before releasing the sprite failed");
                }
                sprite.release(renderer);
                sphere_object.release(renderer);
                return Err(err);
            }
        };

        sprite.position = Vector2::from(SPRITE_POSITION);
        sprite.size = Vector2::from(SPRITE_SIZE);
        sprite.update(renderer);
        Ok(Self { sprite_pipeline, mesh_pipeline, sphere, sphere_object, sprite })
    }

    /// 调用前 GPU 必须已刷新
    pub fn release(self, renderer: &mut Renderer<B>) {
        self.sphere.release(renderer);
        self.sphere_object.release(renderer);
        self.sprite.release(renderer);
    }
}

#[derive(Debug)]
struct GameScene {
    camera: Camera,
}

impl GameScene {
    fn new(aspect: f32) -> Self {
        let mut camera = Camera::new(aspect);
        camera.set_position(Vector3::new(0.0, 4.0, -10.0));
        camera.transform_mut().rotate.x = 0.3;
        camera.update();
        Self { camera }
    }
}

#[derive(Debug)]
enum Scene {
    Title,
    Game(GameScene),
}

impl Scene {
    fn kind(&self) -> SceneKind {
        match self {
            Scene::Title => SceneKind::Title,
            Scene::Game(_) => SceneKind::Game,
        }
    }
}

/// 场景状态机
#[derive(Debug)]
pub struct SceneDirector {
    current: Scene,
    pending: Option<SceneKind>,
}

impl SceneDirector {
    /// 以 `initial` 为第一个场景，它在第一次 `update` 时初始化
    pub fn new(initial: SceneKind) -> Self {
        Self { current: Scene::Title, pending: Some(initial) }
    }

    /// 请求切换场景，后一次请求覆盖前一次
    pub fn request(&mut self, kind: SceneKind) {
        self.pending = Some(kind);
    }

    pub fn current(&self) -> SceneKind {
        self.current.kind()
    }

    pub fn pending(&self) -> Option<SceneKind> {
        self.pending
    }

    /// Game 场景的相机
    pub fn camera(&self) -> Option<&Camera> {
        match &self.current {
            Scene::Game(game) => Some(&game.camera),
            Scene::Title => None,
        }
    }

    /// 应用待切换场景，然后更新当前场景
    pub fn update<B: GpuBackend>(&mut self, ctx: &mut SceneContext<'_, B>, dt: f32) -> Result<()> {
        if let Some(next) = self.pending.take() {
            self.finalize(ctx);
            self.current = initialize(next, ctx);
            info!(scene = ?next, "Scene changed");
        }

        match &mut self.current {
            Scene::Title => {
                if ctx.input.is_key_pressed(KeyCode::Space) {
                    self.pending = Some(SceneKind::Game);
                }
            }
            Scene::Game(game) => {
                if ctx.input.is_key_pressed(KeyCode::KeyT) {
                    self.pending = Some(SceneKind::Title);
                    return Ok(());
                }

                let (width, height) = ctx.renderer.surface_size();
                game.camera.set_aspect(width as f32 / height.max(1) as f32);
                ctx.input.update_camera(&mut game.camera, dt);

                if ctx.input.is_key_pressed(KeyCode::Space) {
                    ctx.particles.emit(ctx.particle_texture, Vector3::zeros(), HOLD_EMIT_COUNT);
                }
                if ctx.input.is_mouse_button_triggered(MouseButton::Left) {
                    let origin = game.camera.position() + game.camera.planar_forward() * CLICK_EMIT_DISTANCE;
                    ctx.particles.emit(ctx.particle_texture, origin, CLICK_EMIT_COUNT);
                }

                ctx.particles.update(ctx.renderer, dt, &game.camera)?;

                let drawables = &mut *ctx.drawables;
                drawables.sphere.update(ctx.renderer);
                drawables.sphere_object.update(&game.camera);
                drawables.sprite.update(ctx.renderer);
            }
        }
        Ok(())
    }

    /// 录制当前场景的绘制命令，必须在帧内调用
    pub fn draw<B: GpuBackend>(&mut self, ctx: &mut SceneContext<'_, B>) -> Result<()> {
        if let Scene::Title = self.current {
            return Ok(());
        }

        let drawables = &*ctx.drawables;
        drawables.sphere_object.draw(ctx.renderer, &drawables.mesh_pipeline, &drawables.sphere, ctx.textures)?;
        ctx.particles.draw(ctx.renderer, ctx.textures)?;
        drawables.sprite.draw(ctx.renderer, &drawables.sprite_pipeline, ctx.textures)
    }

    fn finalize<B: GpuBackend>(&mut self, ctx: &mut SceneContext<'_, B>) {
        if let Scene::Game(_) = self.current {
            ctx.particles.clear();
        }
    }
}

fn initialize<B: GpuBackend>(kind: SceneKind, ctx: &SceneContext<'_, B>) -> Scene {
    match kind {
        SceneKind::Title => Scene::Title,
        SceneKind::Game => {
            let (width, height) = ctx.renderer.surface_size();
            Scene::Game(GameScene::new(width as f32 / height.max(1) as f32))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{GraphicsConfig, ParticleConfig};
    use crate::gfx::headless::{CompletionMode, HeadlessDevice, RecordedCommand};
    use crate::renderer::mipmap::TextureImage;
    use pretty_assertions::assert_eq;
    use winit::event::ElementState;

    const TEXTURE: &str = "particle";

    struct Fixture {
        renderer: Renderer<HeadlessDevice>,
        textures: TextureCache<crate::gfx::headless::ResourceId>,
        particles: ParticleSystem<HeadlessDevice>,
        drawables: SceneDrawables<HeadlessDevice>,
        input: InputSystem,
    }

    impl Fixture {
        fn new() -> Self {
            let mut renderer =
                Renderer::new(HeadlessDevice::new(16, 9, CompletionMode::Immediate), &GraphicsConfig::default()).unwrap();
            let mut textures = TextureCache::new();
            textures
                .load_image(&mut renderer, TEXTURE, TextureImage::from_pixels(1, 1, vec![255; 4]).unwrap())
                .unwrap();
            let particles = ParticleSystem::with_seed(&mut renderer, &ParticleConfig::default(), 1).unwrap();
            let drawables = SceneDrawables::new(&mut renderer, TEXTURE).unwrap();
            renderer.flush().unwrap();
            Self { renderer, textures, particles, drawables, input: InputSystem::default() }
        }

        fn update(&mut self, director: &mut SceneDirector) {
            let mut ctx = SceneContext {
                renderer: &mut self.renderer,
                textures: &mut self.textures,
                particles: &mut self.particles,
                drawables: &mut self.drawables,
                input: &self.input,
                particle_texture: TEXTURE,
            };
            director.update(&mut ctx, 0.016).unwrap();
            self.input.end_frame();
        }

        /// 录制一帧，返回这一帧提交的命令
        fn draw(&mut self, director: &mut SceneDirector) -> Vec<RecordedCommand> {
            let mut ctx = SceneContext {
                renderer: &mut self.renderer,
                textures: &mut self.textures,
                particles: &mut self.particles,
                drawables: &mut self.drawables,
                input: &self.input,
                particle_texture: TEXTURE,
            };
            ctx.renderer.begin_frame().unwrap();
            director.draw(&mut ctx).unwrap();
            ctx.renderer.end_frame().unwrap();
            self.renderer.backend().submitted_commands().last().unwrap().clone()
        }
    }

    #[test]
    fn test_request_applies_on_next_update() {
        let mut fixture = Fixture::new();
        let mut director = SceneDirector::new(SceneKind::Title);
        assert_eq!(director.pending(), Some(SceneKind::Title));

        fixture.update(&mut director);
        assert_eq!(director.current(), SceneKind::Title);
        assert_eq!(director.pending(), None);

        director.request(SceneKind::Game);
        assert_eq!(director.current(), SceneKind::Title);
        fixture.update(&mut director);
        assert_eq!(director.current(), SceneKind::Game);
        assert!(director.camera().is_some());
    }

    #[test]
    fn test_space_starts_game_and_emits() {
        let mut fixture = Fixture::new();
        let mut director = SceneDirector::new(SceneKind::Title);
        fixture.update(&mut director);

        fixture.input.on_keyboard_input(KeyCode::Space, ElementState::Pressed);
        fixture.update(&mut director);
        assert_eq!(director.pending(), Some(SceneKind::Game));

        fixture.update(&mut director);
        assert_eq!(director.current(), SceneKind::Game);
        assert_eq!(fixture.particles.live_count(), HOLD_EMIT_COUNT);
    }

    #[test]
    fn test_leaving_game_clears_particles() {
        let mut fixture = Fixture::new();
        let mut director = SceneDirector::new(SceneKind::Game);
        fixture.input.on_mouse_button(MouseButton::Left, ElementState::Pressed);
        fixture.update(&mut director);
        assert_eq!(fixture.particles.live_count(), CLICK_EMIT_COUNT);

        fixture.input.on_keyboard_input(KeyCode::KeyT, ElementState::Pressed);
        fixture.update(&mut director);
        fixture.update(&mut director);
        assert_eq!(director.current(), SceneKind::Title);
        assert_eq!(fixture.particles.live_count(), 0);
    }

    fn pipelines(frame: &[RecordedCommand]) -> Vec<String> {
        frame
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::SetPipeline(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_title_draws_nothing() {
        let mut fixture = Fixture::new();
        let mut director = SceneDirector::new(SceneKind::Title);
        fixture.update(&mut director);

        let frame = fixture.draw(&mut director);
        assert!(pipelines(&frame).is_empty());
        assert!(!frame.iter().any(|c| matches!(c, RecordedCommand::DrawInstanced { .. })));
    }

    #[test]
    fn test_game_draws_sphere_then_particles_then_sprite() {
        let mut fixture = Fixture::new();
        let mut director = SceneDirector::new(SceneKind::Game);
        fixture.input.on_keyboard_input(KeyCode::Space, ElementState::Pressed);
        fixture.update(&mut director);

        let frame = fixture.draw(&mut director);
        assert_eq!(pipelines(&frame), vec!["object3d", "particle", "sprite"]);

        let draws: Vec<_> = frame
            .iter()
            .filter(|c| matches!(c, RecordedCommand::DrawInstanced { .. }))
            .cloned()
            .collect();
        let sphere_vertices = SPHERE_SUBDIVISION * SPHERE_SUBDIVISION * 6;
        assert_eq!(
            draws,
            vec![
                RecordedCommand::DrawInstanced { vertex_count: sphere_vertices, instance_count: 1 },
                RecordedCommand::DrawInstanced { vertex_count: 6, instance_count: HOLD_EMIT_COUNT as u32 },
                RecordedCommand::DrawInstanced { vertex_count: 6, instance_count: 1 },
            ]
        );
        assert!(fixture.renderer.backend().validation_errors().is_empty());
    }

    #[test]
    fn test_debug_sprite_starts_at_fixed_position() {
        let fixture = Fixture::new();
        assert_eq!(fixture.drawables.sprite.position, Vector2::from(SPRITE_POSITION));
        assert_eq!(fixture.drawables.sprite.size, Vector2::from(SPRITE_SIZE));
        assert_eq!(fixture.drawables.sphere.vertex_count(), SPHERE_SUBDIVISION * SPHERE_SUBDIVISION * 6);
    }
}
