//! Kestrel 可执行入口
//!
//! 读取 `config.toml`，按配置选择 DirectX 12 窗口模式或无窗口模拟模式运行。
//!
//! # 使用方法
//!
//! ```bash
//! # 使用配置文件
//! cargo run
//!
//! # 命令行覆盖
//! cargo run -- --dx12 --width 1920 --height 1080
//! cargo run -- --headless --particles 500
//! ```
//!
//! 运行失败时在 `logging.dump_dir` 下写出崩溃转储，进程以非零状态退出。

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{error, info, warn};
use winit::event::ElementState;
use winit::keyboard::KeyCode;

use kestrel_engine::core::config::GraphicsBackend;
use kestrel_engine::core::input::InputSystem;
use kestrel_engine::core::{crash, log, Config};
use kestrel_engine::engine::Engine;
use kestrel_engine::gfx::headless::{CompletionMode, HeadlessDevice};

/// 无窗口模式运行的帧数
const HEADLESS_FRAMES: u32 = 180;
const HEADLESS_DELTA_TIME: f32 = 1.0 / 60.0;

fn main() -> anyhow::Result<()> {
    // 1. 配置（在日志之前）
    let mut config = Config::from_file_or_default("config.toml");
    config.apply_args(std::env::args());
    config.validate().context("Invalid configuration")?;

    // 2. 日志与崩溃转储
    let log_file = log::init_logger(&config.logging).context("Failed to initialize logging")?;
    let dump_dir = PathBuf::from(&config.logging.dump_dir);
    crash::install_panic_hook(dump_dir.clone());

    info!(version = env!("CARGO_PKG_VERSION"), log_file = ?log_file, "Kestrel starting");
    info!(
        backend = config.graphics.backend.name(),
        width = config.window.width,
        height = config.window.height,
        frames_in_flight = config.graphics.frames_in_flight,
        "Graphics configuration"
    );

    // 3. 运行
    let result = match config.graphics.backend {
        GraphicsBackend::Headless => run_headless(&config),
        GraphicsBackend::Dx12 => run_windowed(&config),
    };

    if let Err(e) = &result {
        error!(error = ?e, "Fatal error");
        write_dump(&dump_dir, &format!("{e:?}"));
    }
    result
}

fn write_dump(dump_dir: &Path, reason: &str) {
    match crash::write_dump(dump_dir, reason) {
        Ok(path) => error!(path = %path.display(), "Crash dump written"),
        Err(e) => warn!(error = %e, "Failed to write crash dump"),
    }
}

/// 模拟设备上跑固定帧数：进入 Game 场景并按住空格持续发射粒子
fn run_headless(config: &Config) -> anyhow::Result<()> {
    let device = HeadlessDevice::new(config.window.width, config.window.height, CompletionMode::Immediate);
    let mut engine = Engine::new(device, config).context("Failed to initialize engine")?;
    let mut input = InputSystem::new(&config.input);

    for frame in 0..HEADLESS_FRAMES {
        if frame == 1 {
            input.on_keyboard_input(KeyCode::Space, ElementState::Pressed);
        }
        engine.run_frame(&input, HEADLESS_DELTA_TIME)?;
        input.end_frame();
    }

    let validation_errors = engine.renderer().backend().validation_errors();
    for message in &validation_errors {
        warn!(message = %message, "Headless validation error");
    }
    info!(
        frames = engine.renderer().frame_count(),
        scene = ?engine.scenes().current(),
        live_particles = engine.particles().map_or(0, |p| p.live_count()),
        validation_errors = validation_errors.len(),
        "Headless run finished"
    );

    engine.shutdown()?;
    Ok(())
}

#[cfg(target_os = "windows")]
fn run_windowed(config: &Config) -> anyhow::Result<()> {
    use std::time::Instant;

    use kestrel_engine::gfx::Dx12Device;
    use winit::dpi::LogicalSize;
    use winit::event::{Event, WindowEvent};
    use winit::event_loop::{ControlFlow, EventLoop};
    use winit::window::WindowBuilder;

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let window = WindowBuilder::new()
        .with_title(format!("{} [{}]", config.window.title, config.graphics.backend.name()))
        .with_inner_size(LogicalSize::new(config.window.width, config.window.height))
        .with_resizable(config.window.resizable)
        .build(&event_loop)
        .context("Failed to create window")?;

    let size = window.inner_size();
    let device = Dx12Device::new(&window, size.width, size.height, &config.graphics)?;
    let mut engine = Engine::new(device, config).context("Failed to initialize engine")?;
    let mut input = InputSystem::new(&config.input);

    let mut last_frame = Instant::now();
    let mut failure: Option<anyhow::Error> = None;

    info!("Entering main loop...");
    event_loop
        .run(|event, elwt| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    if input.handle_window_event(&event) {
                        return;
                    }
                    match event {
                        WindowEvent::CloseRequested => {
                            info!("Close requested, shutting down...");
                            elwt.exit();
                        }
                        WindowEvent::Resized(new_size) => {
                            if let Err(e) = engine.resize(new_size.width, new_size.height) {
                                failure = Some(e.into());
                                elwt.exit();
                            }
                        }
                        WindowEvent::RedrawRequested => {
                            let now = Instant::now();
                            let dt = now.duration_since(last_frame).as_secs_f32();
                            last_frame = now;

                            if let Err(e) = engine.run_frame(&input, dt) {
                                failure = Some(e.into());
                                elwt.exit();
                            }
                            input.end_frame();
                        }
                        _ => {}
                    }
                }
                Event::AboutToWait => window.request_redraw(),
                _ => {}
            }
        })
        .context("Event loop terminated abnormally")?;

    if let Some(e) = failure {
        return Err(e);
    }
    engine.shutdown()?;
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn run_windowed(_config: &Config) -> anyhow::Result<()> {
    anyhow::bail!("The DirectX 12 backend requires Windows, run with --headless instead")
}
