//! 错误处理模块
//!
//! 定义了引擎中使用的统一错误类型，使用 `thiserror` 提供友好的错误消息。
//!
//! # 错误分类
//!
//! - **致命错误**：设备创建、着色器编译、管线创建、描述符池耗尽。引擎无法继续渲染，
//!   调用方记录日志、写崩溃转储后退出。
//! - **契约违规**：向已关闭的命令列表录制、缺少状态转换就呈现、加载前查询纹理索引等。
//!   在所有构建中都以 [`ContractViolation`] 返回，而不是断言。
//! - **有界情况**：实例缓冲溢出、重复加载同一路径。在本地处理，不作为错误上报。

use std::path::PathBuf;

use thiserror::Error;

/// 引擎统一的 Result 类型
///
/// 所有可能返回错误的函数都应该使用这个类型。
pub type Result<T> = std::result::Result<T, EngineError>;

/// Kestrel 引擎的错误类型
#[derive(Debug, Error)]
pub enum EngineError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 图形 API 错误
    #[error("Graphics error: {0}")]
    Graphics(#[from] GraphicsError),

    /// 调用方违反了 API 契约
    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 图像解码错误
    #[error("Image decode error for '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// 日志系统错误
    #[error("Log error: {0}")]
    Log(String),

    /// 初始化错误
    #[error("Initialization error: {0}")]
    Initialization(String),
}

/// 配置相关的错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件未找到
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    /// 配置文件解析失败
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// 配置值无效
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 图形 API 相关的错误
#[derive(Debug, Error)]
pub enum GraphicsError {
    /// 设备创建失败
    #[error("Device creation failed: {0}")]
    DeviceCreation(String),

    /// 交换链错误
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// 着色器编译失败
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// 根签名或管线状态创建失败
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// 资源创建失败
    #[error("Resource creation failed: {0}")]
    ResourceCreation(String),

    /// 渲染命令执行失败
    #[error("Command execution failed: {0}")]
    CommandExecution(String),

    /// 设备已移除（驱动崩溃、TDR 或非法访问）
    #[error("Device removed: {0}")]
    DeviceRemoved(String),

    /// 描述符池已满
    #[error("{pool} view pool exhausted (capacity {capacity})")]
    PoolExhausted { pool: &'static str, capacity: u32 },
}

/// API 契约违规
///
/// 这些情况在原生 API 中只会产生验证层警告或未定义行为，
/// 这里统一以类型化错误返回，方便调用方记录并干净退出。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("cannot record into a closed command list")]
    RecordIntoClosedList,

    #[error("cannot submit a command list that is not recording")]
    SubmitWithoutRecording,

    #[error("cannot begin a frame while the command list is still recording")]
    BeginWhileRecording,

    #[error("cannot submit uploads separately while a frame is being recorded")]
    SubmitDuringFrame,

    #[error("end_frame called without a matching begin_frame")]
    EndWithoutBegin,

    #[error("present requested without the matching {expected} transition on back buffer {index}")]
    PresentWithoutTransition { index: usize, expected: &'static str },

    #[error("back buffer {index} was already transitioned to {state} this frame")]
    DuplicateTransition { index: usize, state: &'static str },

    #[error("invalid resource state transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("texture '{0}' was looked up before it was loaded")]
    TextureNotLoaded(String),

    #[error("texture index {0} is out of range")]
    TextureIndexOutOfRange(usize),

    #[error("view slot {slot} has not been allocated in the {pool} pool")]
    SlotNotAllocated { pool: &'static str, slot: u32 },

    #[error("the overlay view slot was already claimed")]
    OverlaySlotAlreadyClaimed,

    #[error("waited on fence value {requested} which was never signaled (last signaled {signaled})")]
    WaitOnUnsignaledValue { requested: u64, signaled: u64 },

    #[error("fence value {value} is not greater than the last signaled value {last}")]
    NonMonotonicSignal { value: u64, last: u64 },

    #[error("texture dimensions {width}x{height} must be non-zero")]
    EmptyTexture { width: u32, height: u32 },

    #[error("upload of {actual} bytes does not match the destination layout of {expected} bytes")]
    UploadSizeMismatch { expected: u64, actual: u64 },

    #[error("write of {len} bytes at offset {offset} overflows a {size} byte buffer")]
    WriteOutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("mesh needs a non-empty multiple of 3 vertices, got {vertices}")]
    InvalidMesh { vertices: usize },

    #[error("resource is not CPU-writable")]
    ResourceNotMappable,

    #[error("draw recorded outside of begin_frame / end_frame")]
    DrawOutsideFrame,

    #[error("engine used after shutdown")]
    EngineShutDown,
}

impl EngineError {
    /// 是否为不可恢复的错误
    ///
    /// 致命错误和契约违规都会导致引擎退出，区别在于日志分类。
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Graphics(_) | EngineError::Initialization(_) => true,
            EngineError::Contract(_) => true,
            EngineError::Config(_) | EngineError::Io(_) | EngineError::Image { .. } | EngineError::Log(_) => false,
        }
    }

    /// 是否为契约违规
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, EngineError::Contract(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_violation_converts() {
        let err: EngineError = ContractViolation::RecordIntoClosedList.into();
        assert!(err.is_contract_violation());
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Contract violation: cannot record into a closed command list"
        );
    }

    #[test]
    fn test_pool_exhausted_message() {
        let err: EngineError = GraphicsError::PoolExhausted { pool: "shader-visible", capacity: 4 }.into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("capacity 4"));
    }

    #[test]
    fn test_config_error_not_fatal() {
        let err: EngineError = ConfigError::FileNotFound("config.toml".into()).into();
        assert!(!err.is_fatal());
    }
}
