//! 资源管理模块
//!
//! GPU 资源的描述、状态机与上传布局计算。
//!
//! # 设计原则
//!
//! - **独占所有权**：每个 [`TrackedResource`] 只属于创建它的组件（纹理缓存、粒子缓冲等）
//! - **显式状态机**：资源记录当前状态，只允许表中列出的转换，非法转换返回契约错误
//! - **对齐规则**：纹理上传按 256 字节行对齐、512 字节子资源对齐计算暂存缓冲大小

use crate::core::error::{ContractViolation, Result};

/// 纹理行数据对齐（D3D12_TEXTURE_DATA_PITCH_ALIGNMENT）
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u64 = 256;

/// 子资源起始偏移对齐（D3D12_TEXTURE_DATA_PLACEMENT_ALIGNMENT）
pub const TEXTURE_DATA_PLACEMENT_ALIGNMENT: u64 = 512;

/// 向上对齐到 `alignment`（必须是 2 的幂）
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// 资源内存类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// 上传堆：CPU 可写、GPU 可读
    Upload,
    /// 默认堆：GPU 本地内存，CPU 不可访问
    DeviceLocal,
}

/// 资源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    CopyDest,
    GenericRead,
    RenderTarget,
    Present,
    DepthWrite,
}

impl ResourceState {
    pub fn name(&self) -> &'static str {
        match self {
            ResourceState::Common => "common",
            ResourceState::CopyDest => "copy-destination",
            ResourceState::GenericRead => "generic-read",
            ResourceState::RenderTarget => "render-target",
            ResourceState::Present => "present",
            ResourceState::DepthWrite => "depth-write",
        }
    }

    /// 允许的状态转换表
    pub fn can_transition_to(&self, next: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, next),
            (Common, CopyDest)
                | (Common, GenericRead)
                | (CopyDest, GenericRead)
                | (GenericRead, CopyDest)
                | (Present, RenderTarget)
                | (RenderTarget, Present)
        )
    }
}

/// 纹理格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    R32Float,
    Rgba32Float,
    Depth24UnormStencil8,
    Depth32Float,
}

impl TextureFormat {
    /// 每像素字节数
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::R32Float
            | TextureFormat::Depth24UnormStencil8
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba32Float => 16,
        }
    }

    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth24UnormStencil8 | TextureFormat::Depth32Float)
    }

    pub fn is_srgb(&self) -> bool {
        matches!(self, TextureFormat::Rgba8UnormSrgb)
    }
}

/// 纹理元数据（宽、高、格式、mip 数）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureMetadata {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub mip_levels: u32,
}

impl TextureMetadata {
    pub fn new(width: u32, height: u32, format: TextureFormat, mip_levels: u32) -> Self {
        Self { width, height, format, mip_levels }
    }

    /// 完整 mip 链的层数
    pub fn full_mip_count(width: u32, height: u32) -> u32 {
        32 - width.max(height).max(1).leading_zeros()
    }

    /// 指定 mip 层的尺寸
    pub fn mip_extent(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    /// 指定 mip 层紧密排列时的字节数
    pub fn mip_byte_size(&self, level: u32) -> u64 {
        let (w, h) = self.mip_extent(level);
        w as u64 * h as u64 * self.format.bytes_per_pixel() as u64
    }
}

/// 资源描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDesc {
    Buffer { size: u64 },
    Texture2D(TextureMetadata),
}

impl ResourceDesc {
    pub fn buffer(size: u64) -> Self {
        ResourceDesc::Buffer { size }
    }

    /// 缓冲区字节数；纹理返回紧密排列的全部 mip 字节数
    pub fn byte_size(&self) -> u64 {
        match self {
            ResourceDesc::Buffer { size } => *size,
            ResourceDesc::Texture2D(meta) => (0..meta.mip_levels).map(|l| meta.mip_byte_size(l)).sum(),
        }
    }
}

/// 深度 / 颜色清除值
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth { depth: f32, stencil: u8 },
}

/// 一个子资源在暂存缓冲中的放置方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceFootprint {
    /// 在暂存缓冲中的起始偏移
    pub offset: u64,
    /// 对齐后的行跨度
    pub row_pitch: u64,
    pub width: u32,
    pub height: u32,
    /// 每行有效字节数
    pub row_bytes: u64,
}

/// 整个纹理的上传布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLayout {
    pub footprints: Vec<SubresourceFootprint>,
    /// 暂存缓冲所需总字节数
    pub total_size: u64,
}

impl UploadLayout {
    /// 按 D3D12 的对齐规则计算每个 mip 的放置
    pub fn for_texture(meta: &TextureMetadata) -> Self {
        let bpp = meta.format.bytes_per_pixel() as u64;
        let mut footprints = Vec::with_capacity(meta.mip_levels as usize);
        let mut offset = 0u64;
        let mut total_size = 0u64;

        for level in 0..meta.mip_levels {
            let (width, height) = meta.mip_extent(level);
            let row_bytes = width as u64 * bpp;
            let row_pitch = align_up(row_bytes, TEXTURE_DATA_PITCH_ALIGNMENT);

            offset = align_up(offset, TEXTURE_DATA_PLACEMENT_ALIGNMENT);
            footprints.push(SubresourceFootprint { offset, row_pitch, width, height, row_bytes });

            // 最后一行不需要补齐到行跨度
            total_size = offset + row_pitch * (height as u64 - 1) + row_bytes;
            offset += row_pitch * height as u64;
        }

        Self { footprints, total_size }
    }

    /// 把紧密排列的各 mip 数据按行跨度展开到暂存缓冲内容
    pub fn pack(&self, mips: &[Vec<u8>]) -> Result<Vec<u8>> {
        if mips.len() != self.footprints.len() {
            return Err(ContractViolation::UploadSizeMismatch {
                expected: self.footprints.len() as u64,
                actual: mips.len() as u64,
            }
            .into());
        }

        let mut staging = vec![0u8; self.total_size as usize];
        for (footprint, data) in self.footprints.iter().zip(mips) {
            let expected = footprint.row_bytes * footprint.height as u64;
            if data.len() as u64 != expected {
                return Err(ContractViolation::UploadSizeMismatch { expected, actual: data.len() as u64 }.into());
            }

            for (row, src) in data.chunks_exact(footprint.row_bytes as usize).enumerate() {
                let start = (footprint.offset + row as u64 * footprint.row_pitch) as usize;
                staging[start..start + src.len()].copy_from_slice(src);
            }
        }

        Ok(staging)
    }
}

/// 带状态跟踪的 GPU 资源
///
/// `R` 是后端的资源句柄类型。
#[derive(Debug)]
pub struct TrackedResource<R> {
    handle: R,
    desc: ResourceDesc,
    memory: MemoryKind,
    state: ResourceState,
}

impl<R> TrackedResource<R> {
    pub fn new(handle: R, desc: ResourceDesc, memory: MemoryKind, state: ResourceState) -> Self {
        Self { handle, desc, memory, state }
    }

    pub fn handle(&self) -> &R {
        &self.handle
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    pub fn memory(&self) -> MemoryKind {
        self.memory
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// 按状态表转换，返回转换前的状态
    pub fn transition(&mut self, next: ResourceState) -> Result<ResourceState> {
        if !self.state.can_transition_to(next) {
            return Err(ContractViolation::InvalidTransition {
                from: self.state.name(),
                to: next.name(),
            }
            .into());
        }
        let before = self.state;
        self.state = next;
        Ok(before)
    }

    /// 交出底层句柄（释放时使用）
    pub fn into_handle(self) -> R {
        self.handle
    }
}

/// 帧资源
///
/// 每个在飞帧一份：命令分配器的索引，以及它上次提交时的 Fence 值。
#[derive(Debug, Clone, Copy)]
pub struct FrameResource {
    /// 帧索引（同时是命令分配器索引）
    pub frame_index: usize,
    /// 该帧资源上次使用时提交的 Fence 值，0 表示从未使用
    pub fence_value: u64,
}

/// 帧资源池
///
/// 轮转使用 N 份帧资源，复用前必须等待其上次的 Fence 值完成。
#[derive(Debug)]
pub struct FrameResourcePool {
    resources: Vec<FrameResource>,
    current_index: usize,
}

impl FrameResourcePool {
    pub fn new(count: usize) -> Self {
        let resources = (0..count.max(1))
            .map(|frame_index| FrameResource { frame_index, fence_value: 0 })
            .collect();

        Self { resources, current_index: 0 }
    }

    pub fn current(&self) -> &FrameResource {
        &self.resources[self.current_index]
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// 记录当前帧资源的提交 Fence 值
    pub fn mark_in_use(&mut self, fence_value: u64) {
        self.resources[self.current_index].fence_value = fence_value;
    }

    /// 移动到下一帧
    pub fn advance(&mut self) -> &FrameResource {
        self.current_index = (self.current_index + 1) % self.resources.len();
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_table() {
        assert!(ResourceState::CopyDest.can_transition_to(ResourceState::GenericRead));
        assert!(ResourceState::Present.can_transition_to(ResourceState::RenderTarget));
        assert!(ResourceState::RenderTarget.can_transition_to(ResourceState::Present));
        assert!(!ResourceState::Present.can_transition_to(ResourceState::Present));
        assert!(!ResourceState::CopyDest.can_transition_to(ResourceState::RenderTarget));
        assert!(!ResourceState::DepthWrite.can_transition_to(ResourceState::GenericRead));
    }

    #[test]
    fn test_tracked_transition() {
        let mut res = TrackedResource::new(7u32, ResourceDesc::buffer(64), MemoryKind::DeviceLocal, ResourceState::CopyDest);
        assert_eq!(res.transition(ResourceState::GenericRead).unwrap(), ResourceState::CopyDest);
        assert_eq!(res.state(), ResourceState::GenericRead);

        let err = res.transition(ResourceState::Present).unwrap_err();
        assert!(err.is_contract_violation());
        // 失败的转换不改变状态
        assert_eq!(res.state(), ResourceState::GenericRead);
    }

    #[test]
    fn test_full_mip_count() {
        assert_eq!(TextureMetadata::full_mip_count(1, 1), 1);
        assert_eq!(TextureMetadata::full_mip_count(256, 256), 9);
        assert_eq!(TextureMetadata::full_mip_count(300, 20), 9);
    }

    #[test]
    fn test_upload_layout_alignment() {
        // 3x2 RGBA8: 12 字节一行，对齐到 256
        let meta = TextureMetadata::new(3, 2, TextureFormat::Rgba8UnormSrgb, 2);
        let layout = UploadLayout::for_texture(&meta);

        assert_eq!(layout.footprints.len(), 2);
        assert_eq!(layout.footprints[0].offset, 0);
        assert_eq!(layout.footprints[0].row_pitch, 256);
        assert_eq!(layout.footprints[0].row_bytes, 12);
        // mip1 (1x1) 起始于 512
        assert_eq!(layout.footprints[1].offset, 512);
        assert_eq!(layout.footprints[1].width, 1);
        assert_eq!(layout.total_size, 512 + 4);
    }

    #[test]
    fn test_pack_places_rows_at_pitch() {
        let meta = TextureMetadata::new(2, 2, TextureFormat::Rgba8Unorm, 1);
        let layout = UploadLayout::for_texture(&meta);
        let mip0: Vec<u8> = (0..16).collect();

        let staging = layout.pack(&[mip0]).unwrap();
        assert_eq!(&staging[0..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&staging[256..264], &[8, 9, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_pack_rejects_wrong_size() {
        let meta = TextureMetadata::new(2, 2, TextureFormat::Rgba8Unorm, 1);
        let layout = UploadLayout::for_texture(&meta);
        assert!(layout.pack(&[vec![0u8; 15]]).is_err());
    }

    #[test]
    fn test_frame_resource_pool() {
        let mut pool = FrameResourcePool::new(2);
        assert_eq!(pool.current_index(), 0);
        assert_eq!(pool.current().fence_value, 0);

        pool.mark_in_use(1);
        pool.advance();
        assert_eq!(pool.current_index(), 1);
        pool.mark_in_use(2);

        // 回到帧 0，需要等待的值是 1
        assert_eq!(pool.advance().fence_value, 1);
    }
}
