//! 渲染核心
//!
//! 与具体图形 API 无关的部分：命令批次、帧 Fence、描述符槽位、资源上传、
//! 呈现表面、纹理缓存，以及粒子、精灵和网格三类可绘制对象。
//! 设备操作都通过 [`GpuBackend`](crate::gfx::backend::GpuBackend) 完成。
//!
//! # 模块组织
//!
//! - `frame`：[`Renderer`]，把下面各部分组合成一帧的流程
//! - `command`：命令批次状态机
//! - `sync`：单调递增的帧 Fence
//! - `descriptor`：RTV / DSV / 着色器可见三个槽位池
//! - `resource`：资源描述、状态机和帧资源池
//! - `upload`：暂存缓冲上传
//! - `surface`：双缓冲交换链
//! - `mipmap`：图像解码和 mip 链生成
//! - `texture`：按路径去重的纹理缓存
//! - `constant`：每帧常量缓冲和着色器常量布局
//! - `particle`：实例化粒子
//! - `sprite`：屏幕空间精灵
//! - `mesh`：顶点数组网格和球体生成
//! - `shaders`：着色器和管线描述

pub mod command;
pub mod constant;
pub mod descriptor;
pub mod frame;
pub mod mesh;
pub mod mipmap;
pub mod particle;
pub mod resource;
pub mod shaders;
pub mod sprite;
pub mod surface;
pub mod sync;
pub mod texture;
pub mod upload;

pub use command::{BatchRecorder, CommandBatch, CommandListState};
pub use constant::FrameConstants;
pub use descriptor::{PoolKind, ViewSlotAllocator, OVERLAY_SLOT};
pub use frame::{OverlayHook, Renderer};
pub use mesh::{MeshObject, MeshPipeline, MeshVertex, Model};
pub use mipmap::TextureImage;
pub use particle::ParticleSystem;
pub use resource::{ResourceDesc, ResourceState, TextureFormat, TextureMetadata, TrackedResource};
pub use sprite::{Sprite, SpritePipeline};
pub use sync::{FenceValue, FrameFence};
pub use texture::{TextureCache, TextureState};
