//! DX12 设备上下文
//!
//! 持有设备生命周期内不变的对象：DXGI 工厂、适配器、设备、直接命令队列、
//! Fence 及其等待事件、交换链。
//!
//! # 适配器选择
//!
//! 通过 `IDXGIFactory6::EnumAdapterByGpuPreference` 按高性能优先枚举，跳过软件适配器，
//! 对每个适配器依次尝试 [`FeatureLevel::CANDIDATES`]，取第一个成功创建设备的组合。

use raw_window_handle::{HasWindowHandle, RawWindowHandle};
use tracing::{debug, info, warn};
use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, HANDLE, HWND};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::CreateEventA;

use super::convert;
use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{AdapterInfo, FeatureLevel};
use crate::renderer::surface::{BACK_BUFFER_COUNT, BACK_BUFFER_FORMAT};

pub struct Dx12Context {
    pub factory: IDXGIFactory4,
    pub adapter_info: AdapterInfo,
    pub device: ID3D12Device,
    pub queue: ID3D12CommandQueue,
    pub fence: ID3D12Fence,
    pub fence_event: HANDLE,
    pub swap_chain: IDXGISwapChain3,
    pub width: u32,
    pub height: u32,
}

impl Dx12Context {
    pub fn new(window: &impl HasWindowHandle, width: u32, height: u32, debug_layer: bool) -> Result<Self> {
        unsafe {
            // 1. 调试层
            let factory_flags = if cfg!(debug_assertions) && debug_layer {
                enable_debug_layer()
            } else {
                DXGI_CREATE_FACTORY_FLAGS(0)
            };

            // 2. 工厂与适配器
            let factory: IDXGIFactory4 = CreateDXGIFactory2(factory_flags)
                .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create DXGI factory: {:?}", e)))?;
            let (device, adapter_info) = create_device(&factory)?;

            if cfg!(debug_assertions) && debug_layer {
                configure_info_queue(&device);
            }

            // 3. 命令队列
            let queue_desc = D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
                ..Default::default()
            };
            let queue: ID3D12CommandQueue = device
                .CreateCommandQueue(&queue_desc)
                .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create command queue: {:?}", e)))?;

            // 4. Fence 与等待事件
            let fence: ID3D12Fence = device
                .CreateFence(0, D3D12_FENCE_FLAG_NONE)
                .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create fence: {:?}", e)))?;
            let fence_event = CreateEventA(None, false, false, None)
                .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create fence event: {:?}", e)))?;

            // 5. 交换链
            let hwnd = window_hwnd(window)?;
            let swap_chain = create_swap_chain(&factory, &queue, hwnd, width, height)?;

            info!(
                adapter = %adapter_info.name,
                feature_level = adapter_info.feature_level.name(),
                width,
                height,
                "DX12 device context created"
            );

            Ok(Self { factory, adapter_info, device, queue, fence, fence_event, swap_chain, width, height })
        }
    }
}

impl Drop for Dx12Context {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = CloseHandle(self.fence_event) {
                warn!("Failed to close fence event: {:?}", e);
            }
        }
    }
}

unsafe fn enable_debug_layer() -> DXGI_CREATE_FACTORY_FLAGS {
    let mut debug: Option<ID3D12Debug> = None;
    match D3D12GetDebugInterface(&mut debug) {
        Ok(()) => {
            if let Some(debug) = debug {
                debug.EnableDebugLayer();
                debug!("DX12 Debug Layer enabled");
                return DXGI_CREATE_FACTORY_DEBUG;
            }
            DXGI_CREATE_FACTORY_FLAGS(0)
        }
        Err(e) => {
            warn!("Failed to enable DX12 Debug Layer: {:?}", e);
            DXGI_CREATE_FACTORY_FLAGS(0)
        }
    }
}

/// 破坏、错误和警告级别的消息直接中断到调试器
unsafe fn configure_info_queue(device: &ID3D12Device) {
    match device.cast::<ID3D12InfoQueue>() {
        Ok(queue) => {
            let _ = queue.SetBreakOnSeverity(D3D12_MESSAGE_SEVERITY_CORRUPTION, true);
            let _ = queue.SetBreakOnSeverity(D3D12_MESSAGE_SEVERITY_ERROR, true);
            let _ = queue.SetBreakOnSeverity(D3D12_MESSAGE_SEVERITY_WARNING, true);
            debug!("DX12 info queue configured");
        }
        Err(e) => debug!("DX12 info queue unavailable: {:?}", e),
    }
}

unsafe fn create_device(factory: &IDXGIFactory4) -> Result<(ID3D12Device, AdapterInfo)> {
    let factory6: IDXGIFactory6 = factory
        .cast()
        .map_err(|e| GraphicsError::DeviceCreation(format!("IDXGIFactory6 unavailable: {:?}", e)))?;

    let mut index = 0;
    while let Ok(adapter) =
        factory6.EnumAdapterByGpuPreference::<IDXGIAdapter1>(index, DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE)
    {
        index += 1;

        let desc = match adapter.GetDesc1() {
            Ok(desc) => desc,
            Err(e) => {
                warn!(index, "Failed to query adapter description: {:?}", e);
                continue;
            }
        };
        let name = String::from_utf16_lossy(&desc.Description).trim_end_matches('\0').to_string();
        if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
            debug!(adapter = %name, "Skipping software adapter");
            continue;
        }

        for level in FeatureLevel::CANDIDATES {
            let mut device: Option<ID3D12Device> = None;
            if D3D12CreateDevice(&adapter, convert::feature_level(level), &mut device).is_err() {
                continue;
            }
            if let Some(device) = device {
                let info = AdapterInfo {
                    name,
                    vendor_id: desc.VendorId,
                    device_id: desc.DeviceId,
                    dedicated_video_memory: desc.DedicatedVideoMemory as u64,
                    feature_level: level,
                };
                return Ok((device, info));
            }
        }
        debug!(adapter = %name, "Adapter does not support feature level 12.0");
    }

    Err(GraphicsError::DeviceCreation("No hardware adapter supports Direct3D feature level 12.0".to_string()).into())
}

fn window_hwnd(window: &impl HasWindowHandle) -> Result<HWND> {
    let handle = window
        .window_handle()
        .map_err(|e| GraphicsError::SwapchainError(format!("Failed to get window handle: {e}")))?;
    match handle.as_raw() {
        RawWindowHandle::Win32(win32) => Ok(HWND(win32.hwnd.get() as *mut core::ffi::c_void)),
        other => Err(GraphicsError::SwapchainError(format!("Expected a Win32 window handle, got {:?}", other)).into()),
    }
}

unsafe fn create_swap_chain(
    factory: &IDXGIFactory4,
    queue: &ID3D12CommandQueue,
    hwnd: HWND,
    width: u32,
    height: u32,
) -> Result<IDXGISwapChain3> {
    let desc = DXGI_SWAP_CHAIN_DESC1 {
        Width: width,
        Height: height,
        Format: convert::swap_chain_format(BACK_BUFFER_FORMAT),
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, ..Default::default() },
        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
        BufferCount: BACK_BUFFER_COUNT as u32,
        SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
        ..Default::default()
    };

    let swap_chain: IDXGISwapChain1 = factory
        .CreateSwapChainForHwnd(queue, hwnd, &desc, None, None)
        .map_err(|e| GraphicsError::SwapchainError(format!("Failed to create swap chain: {:?}", e)))?;
    let swap_chain: IDXGISwapChain3 = swap_chain
        .cast()
        .map_err(|e| GraphicsError::SwapchainError(format!("Failed to cast swap chain to IDXGISwapChain3: {:?}", e)))?;

    debug!(width, height, buffers = BACK_BUFFER_COUNT, "Swap chain created");
    Ok(swap_chain)
}
