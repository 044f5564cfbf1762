//! 资源上传管线
//!
//! 设备本地资源 CPU 不可写，数据通过一个上传堆上的暂存缓冲中转：
//!
//! ```text
//! CPU 数据 --write_mapped--> 暂存缓冲(Upload) --Copy--> 设备资源(CopyDest) --Barrier--> GenericRead
//! ```
//!
//! # 设计原则
//!
//! - **暂存缓冲归调用方**：上传返回 [`StagingBuffer`]，并标记它在哪个 Fence 值完成后可以释放
//! - **按布局填充**：纹理暂存缓冲按 256 字节行跨度、512 字节子资源对齐排列
//! - **只录制不提交**：复制和屏障录制到当前命令批次，由调用方决定何时提交

use tracing::debug;

use crate::core::error::{ContractViolation, Result};
use crate::gfx::backend::{GpuBackend, GpuCommand};

use super::command::CommandBatch;
use super::resource::{MemoryKind, ResourceDesc, ResourceState, TrackedResource};
use super::sync::FenceValue;

/// 上传用的暂存缓冲
///
/// 只有当 GPU 完成值到达 `retire_after` 之后才能释放。
#[derive(Debug)]
pub struct StagingBuffer<R> {
    resource: R,
    size: u64,
    retire_after: FenceValue,
}

impl<R> StagingBuffer<R> {
    pub fn resource(&self) -> &R {
        &self.resource
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn retire_after(&self) -> FenceValue {
        self.retire_after
    }

    /// GPU 是否已经用完
    pub fn is_retired(&self, completed: FenceValue) -> bool {
        completed >= self.retire_after
    }

    pub fn into_resource(self) -> R {
        self.resource
    }
}

/// 创建设备本地资源，初始状态为复制目标
pub fn create_device_resource<B: GpuBackend>(
    backend: &mut B,
    desc: &ResourceDesc,
) -> Result<TrackedResource<B::Resource>> {
    let handle = backend.create_resource(desc, MemoryKind::DeviceLocal, ResourceState::CopyDest, None)?;
    Ok(TrackedResource::new(handle, *desc, MemoryKind::DeviceLocal, ResourceState::CopyDest))
}

/// 创建 CPU 可写的上传堆缓冲（常量、顶点、实例数据）
pub fn create_upload_buffer<B: GpuBackend>(backend: &mut B, size: u64) -> Result<TrackedResource<B::Resource>> {
    let desc = ResourceDesc::buffer(size);
    let handle = backend.create_resource(&desc, MemoryKind::Upload, ResourceState::GenericRead, None)?;
    Ok(TrackedResource::new(handle, desc, MemoryKind::Upload, ResourceState::GenericRead))
}

/// 目标不在复制目标状态时先转换过去（重复上传的情况）
fn prepare_destination<B: GpuBackend>(
    backend: &mut B,
    batch: &mut CommandBatch,
    target: &mut TrackedResource<B::Resource>,
) -> Result<()> {
    if target.state() != ResourceState::CopyDest {
        batch.transition(backend, target, ResourceState::CopyDest)?;
    }
    Ok(())
}

/// 把字节写入一个新的暂存缓冲
fn stage<B: GpuBackend>(backend: &mut B, bytes: &[u8], retire_after: FenceValue) -> Result<StagingBuffer<B::Resource>> {
    let size = bytes.len() as u64;
    let resource = backend.create_resource(&ResourceDesc::buffer(size), MemoryKind::Upload, ResourceState::GenericRead, None)?;
    if let Err(err) = backend.write_mapped(&resource, 0, bytes) {
        backend.release_resource(resource);
        return Err(err);
    }
    Ok(StagingBuffer { resource, size, retire_after })
}

/// 上传缓冲区数据到设备本地缓冲
pub fn upload_buffer<B: GpuBackend>(
    backend: &mut B,
    batch: &mut CommandBatch,
    target: &mut TrackedResource<B::Resource>,
    data: &[u8],
    retire_after: FenceValue,
) -> Result<StagingBuffer<B::Resource>> {
    let capacity = match target.desc() {
        ResourceDesc::Buffer { size } => *size,
        ResourceDesc::Texture2D(meta) => {
            return Err(ContractViolation::UploadSizeMismatch {
                expected: ResourceDesc::Texture2D(*meta).byte_size(),
                actual: data.len() as u64,
            }
            .into())
        }
    };
    if data.is_empty() || data.len() as u64 > capacity {
        return Err(ContractViolation::UploadSizeMismatch { expected: capacity, actual: data.len() as u64 }.into());
    }
    if !batch.is_recording() {
        return Err(ContractViolation::RecordIntoClosedList.into());
    }

    prepare_destination(backend, batch, target)?;
    let staging = stage(backend, data, retire_after)?;
    batch.record(
        backend,
        GpuCommand::CopyBuffer { dst: target.handle(), src: staging.resource(), size: staging.size() },
    )?;
    batch.transition(backend, target, ResourceState::GenericRead)?;

    debug!(bytes = data.len(), retire_after = retire_after.value(), "Buffer upload recorded");
    Ok(staging)
}

/// 上传纹理的全部 mip 到设备本地纹理
///
/// `mips[i]` 是第 i 层紧密排列的像素数据。
pub fn upload_texture<B: GpuBackend>(
    backend: &mut B,
    batch: &mut CommandBatch,
    target: &mut TrackedResource<B::Resource>,
    mips: &[Vec<u8>],
    retire_after: FenceValue,
) -> Result<StagingBuffer<B::Resource>> {
    let meta = match target.desc() {
        ResourceDesc::Texture2D(meta) => *meta,
        ResourceDesc::Buffer { size } => {
            let actual = mips.iter().map(|m| m.len() as u64).sum();
            return Err(ContractViolation::UploadSizeMismatch { expected: *size, actual }.into());
        }
    };
    if !batch.is_recording() {
        return Err(ContractViolation::RecordIntoClosedList.into());
    }

    let layout = backend.upload_layout(&meta);
    let bytes = layout.pack(mips)?;

    prepare_destination(backend, batch, target)?;
    let staging = stage(backend, &bytes, retire_after)?;
    batch.record(
        backend,
        GpuCommand::CopyTexture { dst: target.handle(), src: staging.resource(), layout: &layout },
    )?;
    batch.transition(backend, target, ResourceState::GenericRead)?;

    debug!(
        width = meta.width,
        height = meta.height,
        mips = meta.mip_levels,
        staging_bytes = layout.total_size,
        retire_after = retire_after.value(),
        "Texture upload recorded"
    );
    Ok(staging)
}
