//! GPU 同步机制模块
//!
//! 帧 Fence：一个单调递增的完成计数器，用来判断 GPU 何时执行完某次提交，
//! 从而安全地复用该次提交引用的 CPU 侧资源（命令分配器、上传缓冲、暂存资源）。
//!
//! # 使用场景
//!
//! 1. **帧同步**：复用某个帧分配器之前，等待它上一次提交的 Fence 值
//! 2. **资源释放**：暂存资源在其上传批次的 Fence 值完成后才能释放
//! 3. **刷新**：关闭、调整尺寸前等待所有已提交的工作
//!
//! 等待使用操作系统事件阻塞，不自旋。

use tracing::{debug, trace};

use crate::core::error::{ContractViolation, Result};
use crate::gfx::backend::GpuBackend;

/// Fence 值
///
/// 用于CPU-GPU同步的单调递增值。0 表示"从未提交"，总是已完成。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(u64);

impl FenceValue {
    pub const ZERO: FenceValue = FenceValue(0);

    /// 创建新的Fence值
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// 获取内部值
    pub fn value(&self) -> u64 {
        self.0
    }

    /// 下一个Fence值
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// 帧 Fence
///
/// CPU 侧只记录已发出的最后一个信号值；GPU 侧完成值与等待事件由后端持有。
#[derive(Debug, Default)]
pub struct FrameFence {
    /// 最后一次 `signal` 的值
    last_signaled: FenceValue,
}

impl FrameFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最后一次发出的信号值
    pub fn last_signaled(&self) -> FenceValue {
        self.last_signaled
    }

    /// 下一次 `signal` 将使用的值
    ///
    /// 当前正在录制的批次会在提交后以这个值发出信号，
    /// 录制期间创建的暂存资源可据此标记何时可以释放。
    pub fn pending_value(&self) -> FenceValue {
        self.last_signaled.next()
    }

    /// GPU 已完成的值
    pub fn completed<B: GpuBackend>(&self, backend: &B) -> FenceValue {
        FenceValue::new(backend.completed_value())
    }

    /// 检查特定Fence值是否已完成
    pub fn is_completed<B: GpuBackend>(&self, backend: &B, value: FenceValue) -> bool {
        self.completed(backend) >= value
    }

    /// 计数器加一，并在队列上排入信号
    ///
    /// 每次提交之后调用一次，且只调用一次。
    pub fn signal<B: GpuBackend>(&mut self, backend: &mut B) -> Result<FenceValue> {
        let value = self.last_signaled.next();
        backend.signal(value.value())?;
        self.last_signaled = value;
        trace!(fence = value.value(), "Fence signaled");
        Ok(value)
    }

    /// 阻塞直到 GPU 到达 `value`
    ///
    /// 已完成时直接返回（首帧等待 0 的情况）。等待一个从未发出的值会永远阻塞，
    /// 因此作为契约错误返回。
    pub fn wait_until<B: GpuBackend>(&self, backend: &mut B, value: FenceValue) -> Result<()> {
        if value > self.last_signaled {
            return Err(ContractViolation::WaitOnUnsignaledValue {
                requested: value.value(),
                signaled: self.last_signaled.value(),
            }
            .into());
        }

        let completed = backend.completed_value();
        if completed >= value.value() {
            return Ok(());
        }

        trace!(fence = value.value(), completed, "Waiting for GPU");
        backend.wait_for_value(value.value())
    }

    /// 刷新命令队列（等待所有已提交的工作完成）
    pub fn flush<B: GpuBackend>(&mut self, backend: &mut B) -> Result<FenceValue> {
        let value = self.signal(backend)?;
        self.wait_until(backend, value)?;
        debug!(fence = value.value(), "GPU flushed");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::headless::{CompletionMode, HeadlessDevice};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fence_value() {
        let v = FenceValue::new(5);
        assert_eq!(v.value(), 5);
        assert_eq!(v.next().value(), 6);
        assert!(FenceValue::new(1) < FenceValue::new(2));
    }

    #[test]
    fn test_signal_is_monotonic() {
        let mut device = HeadlessDevice::new(64, 64, CompletionMode::Immediate);
        let mut fence = FrameFence::new();

        assert_eq!(fence.pending_value(), FenceValue::new(1));
        let a = fence.signal(&mut device).unwrap();
        let b = fence.signal(&mut device).unwrap();
        assert!(b > a);
        assert_eq!(fence.last_signaled(), b);
        assert_eq!(fence.pending_value(), b.next());
    }

    #[test]
    fn test_first_frame_wait_is_skipped() {
        let mut device = HeadlessDevice::new(64, 64, CompletionMode::Manual);
        let fence = FrameFence::new();
        // 没有任何提交时等待 0 立即返回
        fence.wait_until(&mut device, FenceValue::ZERO).unwrap();
    }

    #[test]
    fn test_wait_on_unsignaled_value_is_error() {
        let mut device = HeadlessDevice::new(64, 64, CompletionMode::Immediate);
        let fence = FrameFence::new();
        let err = fence.wait_until(&mut device, FenceValue::new(1)).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_completion_deferred_until_advanced() {
        let mut device = HeadlessDevice::new(64, 64, CompletionMode::Manual);
        let mut fence = FrameFence::new();

        let v1 = fence.signal(&mut device).unwrap();
        let v2 = fence.signal(&mut device).unwrap();
        assert!(!fence.is_completed(&device, v1));

        let timeline = device.timeline();
        assert_eq!(timeline.advance(), Some(v1.value()));
        assert!(fence.is_completed(&device, v1));
        assert!(!fence.is_completed(&device, v2));

        assert_eq!(timeline.advance(), Some(v2.value()));
        assert!(fence.is_completed(&device, v2));
        assert_eq!(timeline.advance(), None);
    }

    #[test]
    fn test_wait_blocks_until_signal_completes() {
        let mut device = HeadlessDevice::new(64, 64, CompletionMode::Manual);
        let mut fence = FrameFence::new();
        let value = fence.signal(&mut device).unwrap();

        let timeline = device.timeline();
        let advanced = Arc::new(AtomicBool::new(false));
        let flag = advanced.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
            timeline.advance();
        });

        fence.wait_until(&mut device, value).unwrap();
        // wait_until 不能在 GPU 完成之前返回
        assert!(advanced.load(Ordering::SeqCst));
        assert!(fence.is_completed(&device, value));
        worker.join().unwrap();
    }

    #[test]
    fn test_flush_with_immediate_completion() {
        let mut device = HeadlessDevice::new(64, 64, CompletionMode::Immediate);
        let mut fence = FrameFence::new();
        let value = fence.flush(&mut device).unwrap();
        assert!(fence.is_completed(&device, value));
    }
}
