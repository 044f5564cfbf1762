//! 配置管理模块
//!
//! 提供引擎配置的加载、解析和管理功能。
//! 支持从 TOML 配置文件加载，也支持命令行参数覆盖。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [window]
//! width = 1280
//! height = 720
//! title = "Kestrel"
//!
//! [graphics]
//! backend = "dx12"      # 或 "headless"
//! vsync = true
//! frames_in_flight = 2
//! clear_color = [0.1, 0.25, 0.5, 1.0]
//!
//! [graphics.pools]
//! render_target = 2
//! depth_stencil = 1
//! shader_visible = 512
//!
//! [logging]
//! level = "info"        # trace, debug, info, warn, error
//! file_output = true
//!
//! [particles]
//! capacity = 1000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{ConfigError, Result};

/// 引擎配置
///
/// 包含了引擎运行所需的所有配置项。
/// 可以从配置文件加载，也可以通过代码构建。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 窗口配置
    #[serde(default)]
    pub window: WindowConfig,

    /// 图形配置
    #[serde(default)]
    pub graphics: GraphicsConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,

    /// 粒子系统配置
    #[serde(default)]
    pub particles: ParticleConfig,

    /// 输入配置
    #[serde(default)]
    pub input: InputConfig,
}

/// 窗口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// 客户区宽度
    #[serde(default = "default_width")]
    pub width: u32,

    /// 客户区高度
    #[serde(default = "default_height")]
    pub height: u32,

    /// 窗口标题
    #[serde(default = "default_title")]
    pub title: String,

    /// 是否可调整大小
    #[serde(default)]
    pub resizable: bool,
}

/// 图形配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsConfig {
    /// 图形后端选择
    #[serde(default = "default_backend")]
    pub backend: GraphicsBackend,

    /// 垂直同步
    #[serde(default = "default_vsync")]
    pub vsync: bool,

    /// 同时在 GPU 上飞行的帧数（每帧一个命令分配器）
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: u32,

    /// 后缓冲清屏颜色（RGBA）
    #[serde(default = "default_clear_color")]
    pub clear_color: [f32; 4],

    /// Debug 构建下启用调试层
    #[serde(default = "default_debug_layer")]
    pub debug_layer: bool,

    /// 着色器源文件目录
    #[serde(default = "default_shader_dir")]
    pub shader_dir: String,

    /// 描述符池容量
    #[serde(default)]
    pub pools: ViewPoolConfig,
}

/// 三个描述符池的容量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewPoolConfig {
    #[serde(default = "default_rtv_capacity")]
    pub render_target: u32,

    #[serde(default = "default_dsv_capacity")]
    pub depth_stencil: u32,

    #[serde(default = "default_shader_visible_capacity")]
    pub shader_visible: u32,
}

/// 图形后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsBackend {
    /// DirectX 12 后端（仅 Windows）
    Dx12,
    /// 无窗口的模拟设备，用于测试和非 Windows 平台
    Headless,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default = "default_file_output")]
    pub file_output: bool,

    /// 日志目录，每次运行生成一个以时间戳命名的文件
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// 崩溃转储目录
    #[serde(default = "default_dump_dir")]
    pub dump_dir: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// 粒子系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticleConfig {
    /// 实例缓冲容量，超过部分不绘制
    #[serde(default = "default_particle_capacity")]
    pub capacity: u32,

    /// 发射位置抖动半径（每轴）
    #[serde(default = "default_position_jitter")]
    pub position_jitter: f32,

    /// 初速度范围（每轴 ±）
    #[serde(default = "default_velocity_range")]
    pub velocity_range: f32,

    /// 生命周期下限（秒）
    #[serde(default = "default_lifetime_min")]
    pub lifetime_min: f32,

    /// 生命周期上限（秒）
    #[serde(default = "default_lifetime_max")]
    pub lifetime_max: f32,

    /// 默认粒子纹理
    #[serde(default = "default_particle_texture")]
    pub texture: String,
}

/// 相机输入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// 鼠标灵敏度（弧度 / 像素）
    #[serde(default = "default_mouse_sensitivity")]
    pub mouse_sensitivity: f32,

    /// 俯仰角限制（弧度）
    #[serde(default = "default_pitch_limit")]
    pub pitch_limit: f32,

    /// 移动速度（单位 / 秒）
    #[serde(default = "default_move_speed")]
    pub move_speed: f32,

    /// 按住 Shift 时的移动速度
    #[serde(default = "default_sprint_speed")]
    pub sprint_speed: f32,
}

// 默认值函数
fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_title() -> String { "Kestrel".to_string() }
fn default_backend() -> GraphicsBackend {
    if cfg!(target_os = "windows") {
        GraphicsBackend::Dx12
    } else {
        GraphicsBackend::Headless
    }
}
fn default_vsync() -> bool { true }
fn default_frames_in_flight() -> u32 { 2 }
fn default_clear_color() -> [f32; 4] { [0.1, 0.25, 0.5, 1.0] }
fn default_debug_layer() -> bool { true }
fn default_shader_dir() -> String { "shaders".to_string() }
fn default_rtv_capacity() -> u32 { 2 }
fn default_dsv_capacity() -> u32 { 1 }
fn default_shader_visible_capacity() -> u32 { 512 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { true }
fn default_log_dir() -> String { "logs".to_string() }
fn default_dump_dir() -> String { "dumps".to_string() }
fn default_particle_capacity() -> u32 { 1000 }
fn default_position_jitter() -> f32 { 0.5 }
fn default_velocity_range() -> f32 { 1.0 }
fn default_lifetime_min() -> f32 { 1.0 }
fn default_lifetime_max() -> f32 { 3.0 }
fn default_particle_texture() -> String { "resources/uvChecker.png".to_string() }
fn default_mouse_sensitivity() -> f32 { 0.0025 }
fn default_pitch_limit() -> f32 { 1.553_343 }
fn default_move_speed() -> f32 { 2.5 }
fn default_sprint_speed() -> f32 { 6.0 }

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            title: default_title(),
            resizable: false,
        }
    }
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            vsync: default_vsync(),
            frames_in_flight: default_frames_in_flight(),
            clear_color: default_clear_color(),
            debug_layer: default_debug_layer(),
            shader_dir: default_shader_dir(),
            pools: ViewPoolConfig::default(),
        }
    }
}

impl Default for ViewPoolConfig {
    fn default() -> Self {
        Self {
            render_target: default_rtv_capacity(),
            depth_stencil: default_dsv_capacity(),
            shader_visible: default_shader_visible_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_dir: default_log_dir(),
            dump_dir: default_dump_dir(),
        }
    }
}

impl Default for ParticleConfig {
    fn default() -> Self {
        Self {
            capacity: default_particle_capacity(),
            position_jitter: default_position_jitter(),
            velocity_range: default_velocity_range(),
            lifetime_min: default_lifetime_min(),
            lifetime_max: default_lifetime_max(),
            texture: default_particle_texture(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            mouse_sensitivity: default_mouse_sensitivity(),
            pitch_limit: default_pitch_limit(),
            move_speed: default_move_speed(),
            sprint_speed: default_sprint_speed(),
        }
    }
}

impl Config {
    /// 从配置文件加载
    ///
    /// # 参数
    ///
    /// * `path` - 配置文件路径
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在或无法解析则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 从命令行参数覆盖配置
    ///
    /// 支持的参数：
    /// - `--dx12`: 使用 DirectX 12 后端
    /// - `--headless`: 使用模拟设备
    /// - `--width <value>` / `--height <value>`: 客户区尺寸
    /// - `--particles <value>`: 粒子实例缓冲容量
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        if args.iter().any(|a| a == "--dx12") {
            self.graphics.backend = GraphicsBackend::Dx12;
        }

        if args.iter().any(|a| a == "--headless") {
            self.graphics.backend = GraphicsBackend::Headless;
        }

        if let Some(width) = parse_flag_value(&args, "--width") {
            self.window.width = width;
        }

        if let Some(height) = parse_flag_value(&args, "--height") {
            self.window.height = height;
        }

        if let Some(capacity) = parse_flag_value(&args, "--particles") {
            self.particles.capacity = capacity;
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            return Err(invalid("window.width/height", "Window dimensions must be greater than 0"));
        }

        if !(1..=3).contains(&self.graphics.frames_in_flight) {
            return Err(invalid("graphics.frames_in_flight", "Frames in flight must be 1, 2 or 3"));
        }

        // 交换链固定两个后缓冲，各占一个 RTV
        if self.graphics.pools.render_target < 2 {
            return Err(invalid("graphics.pools.render_target", "Need at least 2 slots for the back buffers"));
        }

        if self.graphics.pools.depth_stencil < 1 {
            return Err(invalid("graphics.pools.depth_stencil", "Need at least 1 slot for the depth buffer"));
        }

        // 槽 0 留给调试界面
        if self.graphics.pools.shader_visible < 2 {
            return Err(invalid("graphics.pools.shader_visible", "Slot 0 is reserved, capacity must be at least 2"));
        }

        self.particles.validate()?;

        Ok(())
    }
}

impl ParticleConfig {
    /// 验证粒子参数，构造粒子系统前也会调用
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(invalid("particles.capacity", "Particle capacity must be greater than 0"));
        }

        // 发射时按 [-r, r] 均匀采样，负数或非有限值会得到空区间
        if !self.position_jitter.is_finite() || self.position_jitter < 0.0 {
            return Err(invalid("particles.position_jitter", "Jitter must be finite and non-negative"));
        }

        if !self.velocity_range.is_finite() || self.velocity_range < 0.0 {
            return Err(invalid("particles.velocity_range", "Velocity range must be finite and non-negative"));
        }

        if !self.lifetime_min.is_finite() || !self.lifetime_max.is_finite() {
            return Err(invalid("particles.lifetime_min/max", "Lifetime bounds must be finite"));
        }

        if self.lifetime_min <= 0.0 || self.lifetime_min > self.lifetime_max {
            return Err(invalid("particles.lifetime_min/max", "Lifetime range must be positive and ordered"));
        }

        Ok(())
    }
}

fn parse_flag_value<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    let idx = args.iter().position(|a| a == flag)?;
    args.get(idx + 1)?.parse().ok()
}

fn invalid(field: &str, reason: &str) -> super::error::EngineError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

impl GraphicsBackend {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            GraphicsBackend::Dx12 => "DirectX 12",
            GraphicsBackend::Headless => "Headless",
        }
    }
}
