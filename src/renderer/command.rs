//! 命令缓冲区管理模块
//!
//! 一个命令列表 + 每个在飞帧一个命令分配器 + 一个直接队列。
//!
//! # 状态机
//!
//! ```text
//! Closed --begin(allocator)--> Recording --submit()--> Closed
//! ```
//!
//! 向已关闭的列表录制、提交未在录制的列表、在录制中再次 begin，都返回契约错误。
//! `begin` 的前提是该分配器上一次的提交已经完成，由调用方先等待帧 Fence 保证。

use tracing::trace;

use crate::core::error::{ContractViolation, Result};
use crate::gfx::backend::{Command, GpuBackend, GpuCommand};

use super::resource::{ResourceState, TrackedResource};

/// 命令列表状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    /// 已关闭（创建后的初始状态，或已提交）
    Closed,
    /// 正在记录
    Recording,
}

/// 命令批次
#[derive(Debug)]
pub struct CommandBatch {
    state: CommandListState,
    /// 当前录制使用的分配器
    allocator_index: usize,
    /// 本次录制的命令数
    recorded: usize,
    /// 累计提交次数
    submissions: u64,
}

impl CommandBatch {
    pub fn new() -> Self {
        Self {
            state: CommandListState::Closed,
            allocator_index: 0,
            recorded: 0,
            submissions: 0,
        }
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == CommandListState::Recording
    }

    pub fn allocator_index(&self) -> usize {
        self.allocator_index
    }

    pub fn recorded_commands(&self) -> usize {
        self.recorded
    }

    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// 重置分配器和命令列表，进入录制状态
    pub fn begin<B: GpuBackend>(&mut self, backend: &mut B, allocator_index: usize) -> Result<()> {
        if self.is_recording() {
            return Err(ContractViolation::BeginWhileRecording.into());
        }

        backend.reset_commands(allocator_index)?;
        self.state = CommandListState::Recording;
        self.allocator_index = allocator_index;
        self.recorded = 0;
        trace!(allocator = allocator_index, "Command list opened");
        Ok(())
    }

    /// 录制一条命令
    pub fn record<B: GpuBackend>(&mut self, backend: &mut B, command: Command<'_, B>) -> Result<()> {
        if !self.is_recording() {
            return Err(ContractViolation::RecordIntoClosedList.into());
        }

        backend.record(command)?;
        self.recorded += 1;
        Ok(())
    }

    /// 按资源状态表转换并录制屏障
    ///
    /// 非法转换不会录制任何命令，资源状态保持不变。
    pub fn transition<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        resource: &mut TrackedResource<B::Resource>,
        after: ResourceState,
    ) -> Result<()> {
        if !self.is_recording() {
            return Err(ContractViolation::RecordIntoClosedList.into());
        }

        let before = resource.transition(after)?;
        self.record(
            backend,
            GpuCommand::Barrier { resource: resource.handle(), before, after },
        )
    }

    /// 关闭命令列表并提交到队列
    ///
    /// 返回时 GPU 工作尚未完成。
    pub fn submit<B: GpuBackend>(&mut self, backend: &mut B) -> Result<()> {
        if !self.is_recording() {
            return Err(ContractViolation::SubmitWithoutRecording.into());
        }

        backend.close_commands()?;
        self.state = CommandListState::Closed;
        backend.execute_commands()?;
        self.submissions += 1;
        trace!(
            allocator = self.allocator_index,
            commands = self.recorded,
            submission = self.submissions,
            "Command list submitted"
        );
        Ok(())
    }
}

impl Default for CommandBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// 当前命令批次的录制入口
///
/// 把批次和设备的可变借用绑在一起，交给可绘制对象和调试界面使用。
pub struct BatchRecorder<'a, B: GpuBackend> {
    batch: &'a mut CommandBatch,
    backend: &'a mut B,
}

impl<'a, B: GpuBackend> BatchRecorder<'a, B> {
    pub fn new(batch: &'a mut CommandBatch, backend: &'a mut B) -> Self {
        Self { batch, backend }
    }

    pub fn record(&mut self, command: Command<'_, B>) -> Result<()> {
        self.batch.record(self.backend, command)
    }

    pub fn transition(&mut self, resource: &mut TrackedResource<B::Resource>, after: ResourceState) -> Result<()> {
        self.batch.transition(self.backend, resource, after)
    }

    pub fn is_recording(&self) -> bool {
        self.batch.is_recording()
    }

    pub fn backend(&mut self) -> &mut B {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::headless::{CompletionMode, HeadlessDevice, RecordedCommand};
    use crate::renderer::resource::{MemoryKind, ResourceDesc};

    fn device() -> HeadlessDevice {
        HeadlessDevice::new(64, 64, CompletionMode::Immediate)
    }

    #[test]
    fn test_command_batch_state_machine() {
        let mut device = device();
        let mut batch = CommandBatch::new();
        assert_eq!(batch.state(), CommandListState::Closed);

        batch.begin(&mut device, 0).unwrap();
        assert!(batch.is_recording());

        batch.record(&mut device, GpuCommand::SetDescriptorHeap).unwrap();
        assert_eq!(batch.recorded_commands(), 1);

        batch.submit(&mut device).unwrap();
        assert_eq!(batch.state(), CommandListState::Closed);
        assert_eq!(batch.submissions(), 1);
    }

    #[test]
    fn test_record_into_closed_list_fails() {
        let mut device = device();
        let mut batch = CommandBatch::new();
        let err = batch.record(&mut device, GpuCommand::SetDescriptorHeap).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_submit_without_recording_fails() {
        let mut device = device();
        let mut batch = CommandBatch::new();
        assert!(batch.submit(&mut device).unwrap_err().is_contract_violation());

        batch.begin(&mut device, 0).unwrap();
        batch.submit(&mut device).unwrap();
        // 同一个列表不能提交两次
        assert!(batch.submit(&mut device).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_begin_twice_fails() {
        let mut device = device();
        let mut batch = CommandBatch::new();
        batch.begin(&mut device, 0).unwrap();
        assert!(batch.begin(&mut device, 1).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_batch_recorder_forwards_to_batch() {
        let mut device = device();
        let mut batch = CommandBatch::new();
        batch.begin(&mut device, 0).unwrap();
        {
            let mut recorder = BatchRecorder::new(&mut batch, &mut device);
            assert!(recorder.is_recording());
            recorder.record(GpuCommand::SetViewport { width: 4, height: 4 }).unwrap();
        }
        assert_eq!(batch.recorded_commands(), 1);
    }

    #[test]
    fn test_transition_records_barrier() {
        let mut device = device();
        let mut batch = CommandBatch::new();
        let handle = device
            .create_resource(&ResourceDesc::buffer(16), MemoryKind::DeviceLocal, ResourceState::CopyDest, None)
            .unwrap();
        let mut resource = TrackedResource::new(handle, ResourceDesc::buffer(16), MemoryKind::DeviceLocal, ResourceState::CopyDest);

        batch.begin(&mut device, 0).unwrap();
        batch.transition(&mut device, &mut resource, ResourceState::GenericRead).unwrap();

        // 非法转换不录制
        assert!(batch.transition(&mut device, &mut resource, ResourceState::Present).is_err());
        batch.submit(&mut device).unwrap();

        let submitted = device.submitted_commands();
        assert_eq!(submitted.len(), 1);
        assert_eq!(
            submitted[0],
            vec![RecordedCommand::Barrier {
                resource: handle,
                before: ResourceState::CopyDest,
                after: ResourceState::GenericRead,
            }]
        );
    }
}
