//! 纹理缓存
//!
//! 按路径去重加载纹理，每个不同的纹理占用着色器可见池中的一个槽位。
//!
//! # 设计原则
//!
//! - **幂等加载**：同一路径第二次加载直接返回已有索引，不分配槽位、不创建资源
//! - **先检查后分配**：加载前检查池是否还有空位，池满是致命错误
//! - **没有卸载路径**：纹理一旦加载就常驻到引擎关闭
//! - **延迟释放暂存**：暂存缓冲在上传的 Fence 完成之后由 [`TextureCache::release_staging`] 批量释放
//!
//! 记录状态：`Unloaded -> Loading`（上传已录制）`-> Resident`（GPU 已完成上传）。

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info};

use crate::core::error::{ContractViolation, GraphicsError, Result};
use crate::gfx::backend::GpuBackend;

use super::descriptor::{GpuDescriptorHandle, PoolKind, ViewDesc};
use super::frame::Renderer;
use super::mipmap::TextureImage;
use super::resource::{TextureMetadata, TrackedResource};
use super::upload::StagingBuffer;

/// 纹理记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureState {
    Unloaded,
    Loading,
    Resident,
}

#[derive(Debug)]
struct TextureRecord<R> {
    path: String,
    metadata: TextureMetadata,
    resource: TrackedResource<R>,
    staging: Option<StagingBuffer<R>>,
    slot: u32,
    gpu_handle: GpuDescriptorHandle,
    state: TextureState,
}

/// 纹理缓存
#[derive(Debug)]
pub struct TextureCache<R> {
    records: Vec<TextureRecord<R>>,
    by_path: HashMap<String, usize>,
}

impl<R> Default for TextureCache<R> {
    fn default() -> Self {
        Self { records: Vec::new(), by_path: HashMap::new() }
    }
}

impl<R> TextureCache<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从文件加载纹理，返回纹理索引
    pub fn load<B>(&mut self, renderer: &mut Renderer<B>, path: &str) -> Result<usize>
    where
        B: GpuBackend<Resource = R>,
    {
        if let Some(&index) = self.by_path.get(path) {
            debug!(path, index, "Texture already loaded");
            return Ok(index);
        }
        ensure_slot_available(renderer)?;

        let image = TextureImage::load(Path::new(path))?;
        self.load_image(renderer, path, image)
    }

    /// 以 `key` 为键加载一张已解码的图像
    pub fn load_image<B>(&mut self, renderer: &mut Renderer<B>, key: &str, image: TextureImage) -> Result<usize>
    where
        B: GpuBackend<Resource = R>,
    {
        if let Some(&index) = self.by_path.get(key) {
            return Ok(index);
        }
        ensure_slot_available(renderer)?;

        let metadata = image.metadata;
        let mut resource = renderer.create_texture_resource(&metadata)?;

        // 槽位和视图先于上传，失败时还没有任何 GPU 命令引用该资源，可以立即释放
        let slot = match bind_texture_view(renderer, &resource, &metadata) {
            Ok(slot) => slot,
            Err(err) => {
                renderer.release_resource(resource);
                return Err(err);
            }
        };
        let staging = match renderer.upload_texture_data(&mut resource, &image) {
            Ok(staging) => staging,
            Err(err) => {
                renderer.release_resource(resource);
                return Err(err);
            }
        };
        let (_, gpu_handle) = renderer.view_slot_addresses(slot);

        let index = self.records.len();
        self.records.push(TextureRecord {
            path: key.to_string(),
            metadata,
            resource,
            staging: Some(staging),
            slot,
            gpu_handle,
            state: TextureState::Loading,
        });
        self.by_path.insert(key.to_string(), index);

        info!(
            path = key,
            index,
            slot,
            width = metadata.width,
            height = metadata.height,
            mips = metadata.mip_levels,
            "Texture loaded"
        );
        Ok(index)
    }

    /// 查询纹理索引，未加载时返回契约错误
    pub fn index_of(&self, path: &str) -> Result<usize> {
        self.by_path
            .get(path)
            .copied()
            .ok_or_else(|| ContractViolation::TextureNotLoaded(path.to_string()).into())
    }

    fn record(&self, index: usize) -> Result<&TextureRecord<R>> {
        self.records
            .get(index)
            .ok_or_else(|| ContractViolation::TextureIndexOutOfRange(index).into())
    }

    /// 可直接绑定到描述符表的 GPU 地址
    pub fn gpu_handle(&self, index: usize) -> Result<GpuDescriptorHandle> {
        Ok(self.record(index)?.gpu_handle)
    }

    /// 纹理占用的着色器可见槽位
    pub fn slot(&self, index: usize) -> Result<u32> {
        Ok(self.record(index)?.slot)
    }

    pub fn metadata(&self, path: &str) -> Result<TextureMetadata> {
        let index = self.index_of(path)?;
        Ok(self.record(index)?.metadata)
    }

    pub fn state(&self, path: &str) -> TextureState {
        self.by_path
            .get(path)
            .map_or(TextureState::Unloaded, |&index| self.records[index].state)
    }

    pub fn resource(&self, index: usize) -> Result<&TrackedResource<R>> {
        Ok(&self.record(index)?.resource)
    }

    pub fn path(&self, index: usize) -> Result<&str> {
        Ok(&self.record(index)?.path)
    }

    /// 释放所有上传已完成的暂存缓冲，返回释放数量
    ///
    /// 上传尚未完成的记录保持不变，下次再检查。
    pub fn release_staging<B>(&mut self, renderer: &mut Renderer<B>) -> usize
    where
        B: GpuBackend<Resource = R>,
    {
        let completed = renderer.completed_fence();
        let mut released = 0;

        for record in &mut self.records {
            let retired = record.staging.as_ref().is_some_and(|s| s.is_retired(completed));
            if !retired {
                continue;
            }
            if let Some(staging) = record.staging.take() {
                // 已确认完成，retire_staging 一定会释放
                if let Some(pending) = renderer.retire_staging(staging) {
                    record.staging = Some(pending);
                    continue;
                }
                record.state = TextureState::Resident;
                released += 1;
            }
        }

        if released > 0 {
            debug!(released, completed = completed.value(), "Texture staging buffers released");
        }
        released
    }

    /// 还持有暂存缓冲的纹理数
    pub fn pending_staging(&self) -> usize {
        self.records.iter().filter(|r| r.staging.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 关闭时释放全部 GPU 资源，调用前 GPU 必须已刷新
    pub fn release_all<B>(&mut self, renderer: &mut Renderer<B>)
    where
        B: GpuBackend<Resource = R>,
    {
        self.by_path.clear();
        for record in self.records.drain(..) {
            if let Some(staging) = record.staging {
                renderer.backend_mut().release_resource(staging.into_resource());
            }
            renderer.release_resource(record.resource);
        }
    }
}

fn bind_texture_view<B: GpuBackend>(
    renderer: &mut Renderer<B>,
    resource: &TrackedResource<B::Resource>,
    metadata: &TextureMetadata,
) -> Result<u32> {
    let slot = renderer.allocate_view_slot()?;
    let view = ViewDesc::Texture2D { format: metadata.format, mip_levels: metadata.mip_levels };
    renderer.create_view(slot, resource.handle(), &view)?;
    Ok(slot)
}

fn ensure_slot_available<B: GpuBackend>(renderer: &Renderer<B>) -> Result<()> {
    if renderer.can_allocate_view_slot() {
        return Ok(());
    }
    let pool = renderer.views().pool(PoolKind::ShaderVisible);
    Err(GraphicsError::PoolExhausted { pool: PoolKind::ShaderVisible.name(), capacity: pool.capacity() }.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GraphicsConfig;
    use crate::gfx::headless::{CompletionMode, HeadlessDevice, RecordedCommand, ResourceId};
    use pretty_assertions::assert_eq;

    fn renderer(mode: CompletionMode) -> Renderer<HeadlessDevice> {
        Renderer::new(HeadlessDevice::new(4, 4, mode), &GraphicsConfig::default()).unwrap()
    }

    fn solid(width: u32, height: u32, value: u8) -> TextureImage {
        TextureImage::from_pixels(width, height, vec![value; (width * height * 4) as usize]).unwrap()
    }

    #[test]
    fn test_load_is_idempotent() {
        let mut renderer = renderer(CompletionMode::Immediate);
        let mut cache: TextureCache<ResourceId> = TextureCache::new();

        let before = renderer.views().pool(PoolKind::ShaderVisible).next_free();
        let resources_before = renderer.backend().live_resource_count();

        let a = cache.load_image(&mut renderer, "a.png", solid(4, 4, 10)).unwrap();
        let b = cache.load_image(&mut renderer, "a.png", solid(4, 4, 10)).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
        assert_eq!(renderer.views().pool(PoolKind::ShaderVisible).next_free(), before + 1);
        // 一个纹理资源加一个暂存缓冲
        assert_eq!(renderer.backend().live_resource_count(), resources_before + 2);
    }

    #[test]
    fn test_overlay_then_three_textures_get_slots_1_2_3() {
        let mut renderer = renderer(CompletionMode::Immediate);
        // 槽 0 保留给调试界面
        let first_free = renderer.views().pool(PoolKind::ShaderVisible).next_free();
        assert_eq!(first_free, 1);

        let mut cache = TextureCache::new();
        let slots: Vec<u32> = ["t1", "t2", "t3"]
            .iter()
            .map(|key| {
                let index = cache.load_image(&mut renderer, key, solid(2, 2, 0)).unwrap();
                cache.slot(index).unwrap()
            })
            .collect();
        assert_eq!(slots, vec![1, 2, 3]);

        let (_, gpu1) = renderer.view_slot_addresses(1);
        assert_eq!(cache.gpu_handle(0).unwrap(), gpu1);
    }

    #[test]
    fn test_index_of_before_load_is_contract_error() {
        let cache: TextureCache<ResourceId> = TextureCache::new();
        assert!(cache.index_of("missing.png").unwrap_err().is_contract_violation());
        assert!(cache.gpu_handle(0).unwrap_err().is_contract_violation());
        assert_eq!(cache.state("missing.png"), TextureState::Unloaded);
    }

    #[test]
    fn test_upload_readback_after_fence() {
        let mut renderer = renderer(CompletionMode::Manual);
        let mut cache = TextureCache::new();
        let pixels: Vec<u8> = (0..2 * 2 * 4).map(|i| i as u8 * 7).collect();
        let image = TextureImage::from_pixels(2, 2, pixels).unwrap();
        let expected: Vec<u8> = image.mips.concat();

        let index = cache.load_image(&mut renderer, "grad", image).unwrap();
        assert_eq!(cache.state("grad"), TextureState::Loading);
        renderer.submit_uploads().unwrap();

        // GPU 未完成，暂存保留
        assert_eq!(cache.release_staging(&mut renderer), 0);
        assert_eq!(cache.pending_staging(), 1);

        renderer.backend().timeline().advance_all();
        assert_eq!(cache.release_staging(&mut renderer), 1);
        assert_eq!(cache.state("grad"), TextureState::Resident);

        let handle = *cache.resource(index).unwrap().handle();
        assert_eq!(renderer.backend().read_resource(handle).unwrap(), expected);
        assert!(renderer.backend().removed_reason().is_none());
    }

    #[test]
    fn test_pool_exhaustion_is_fatal() {
        let mut config = GraphicsConfig::default();
        config.pools.shader_visible = 2;
        let mut renderer = Renderer::new(HeadlessDevice::new(4, 4, CompletionMode::Immediate), &config).unwrap();
        let mut cache = TextureCache::new();

        cache.load_image(&mut renderer, "one", solid(1, 1, 0)).unwrap();
        let err = cache.load_image(&mut renderer, "two", solid(1, 1, 0)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_load_leaves_no_pending_copy() {
        let mut config = GraphicsConfig::default();
        config.pools.shader_visible = 2;
        let mut renderer = Renderer::new(HeadlessDevice::new(4, 4, CompletionMode::Manual), &config).unwrap();
        let mut cache = TextureCache::new();

        cache.load_image(&mut renderer, "one", solid(2, 2, 0)).unwrap();
        let live = renderer.backend().live_resource_count();

        // 池已满：不创建资源，也不录制复制
        assert!(cache.load_image(&mut renderer, "two", solid(2, 2, 0)).is_err());
        assert_eq!(renderer.backend().live_resource_count(), live);

        renderer.submit_uploads().unwrap();
        renderer.backend().timeline().advance_all();
        let copies = renderer
            .backend()
            .submitted_commands()
            .iter()
            .flatten()
            .filter(|c| matches!(c, RecordedCommand::CopyTexture { .. }))
            .count();
        assert_eq!(copies, 1);
        assert!(renderer.backend().removed_reason().is_none());
        assert_eq!(cache.release_staging(&mut renderer), 1);
    }

    #[test]
    fn test_upload_failure_releases_texture_without_recording() {
        let mut renderer = renderer(CompletionMode::Manual);
        let mut cache: TextureCache<ResourceId> = TextureCache::new();
        let live = renderer.backend().live_resource_count();

        // 元数据声明 4x4，但只带了一层 2x2 的数据
        let mut image = solid(2, 2, 9);
        image.metadata = TextureMetadata::new(4, 4, image.metadata.format, 1);
        let err = cache.load_image(&mut renderer, "broken", image).unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(cache.state("broken"), TextureState::Unloaded);
        assert_eq!(renderer.backend().live_resource_count(), live);

        renderer.submit_uploads().unwrap();
        renderer.backend().timeline().advance_all();
        assert!(renderer.backend().removed_reason().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tex.png");
        image::RgbaImage::from_pixel(4, 2, image::Rgba([1, 2, 3, 4])).save(&path).unwrap();
        let key = path.display().to_string();

        let mut renderer = renderer(CompletionMode::Immediate);
        let mut cache = TextureCache::new();
        cache.load(&mut renderer, &key).unwrap();

        let meta = cache.metadata(&key).unwrap();
        assert_eq!((meta.width, meta.height, meta.mip_levels), (4, 2, 3));
        assert!(cache.load(&mut renderer, "nope.png").is_err());
    }
}
