//! DirectX 12 描述符堆实现
//!
//! 每个视图池对应一个 `ID3D12DescriptorHeap`，槽位分配在渲染核心的
//! `ViewSlotAllocator` 中完成，这里只负责创建堆和写入视图。

use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::convert;
use crate::core::error::{GraphicsError, Result};
use crate::renderer::descriptor::{CpuDescriptorHandle, DescriptorHeapInfo, GpuDescriptorHandle, PoolKind, ViewDesc};

/// DX12 描述符堆
pub struct Dx12DescriptorHeap {
    heap: ID3D12DescriptorHeap,
    kind: PoolKind,
    info: DescriptorHeapInfo,
}

impl Dx12DescriptorHeap {
    /// 创建描述符堆，着色器可见池同时返回 GPU 句柄基址
    pub fn new(device: &ID3D12Device, kind: PoolKind, capacity: u32) -> Result<Self> {
        unsafe {
            let heap_type = convert::descriptor_heap_type(kind);
            let flags = if kind.is_shader_visible() {
                D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
            } else {
                D3D12_DESCRIPTOR_HEAP_FLAG_NONE
            };

            let heap_desc = D3D12_DESCRIPTOR_HEAP_DESC {
                Type: heap_type,
                NumDescriptors: capacity,
                Flags: flags,
                NodeMask: 0,
            };
            let heap: ID3D12DescriptorHeap = device.CreateDescriptorHeap(&heap_desc).map_err(|e| {
                GraphicsError::ResourceCreation(format!("Failed to create {} descriptor heap: {:?}", kind.name(), e))
            })?;

            let increment = device.GetDescriptorHandleIncrementSize(heap_type);
            let cpu_start = CpuDescriptorHandle::new(heap.GetCPUDescriptorHandleForHeapStart().ptr);
            let gpu_start = if kind.is_shader_visible() {
                Some(GpuDescriptorHandle::new(heap.GetGPUDescriptorHandleForHeapStart().ptr))
            } else {
                None
            };

            Ok(Self { heap, kind, info: DescriptorHeapInfo { cpu_start, gpu_start, increment } })
        }
    }

    pub fn heap(&self) -> &ID3D12DescriptorHeap {
        &self.heap
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn info(&self) -> DescriptorHeapInfo {
        self.info
    }
}

/// 在 `handle` 处写入一个视图
pub unsafe fn write_view(
    device: &ID3D12Device,
    handle: CpuDescriptorHandle,
    resource: &ID3D12Resource,
    view: &ViewDesc,
) {
    let cpu = D3D12_CPU_DESCRIPTOR_HANDLE { ptr: handle.ptr };
    match *view {
        ViewDesc::Texture2D { format, mip_levels } => {
            let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
                Format: convert::texture_format(format),
                ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
                Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture2D: D3D12_TEX2D_SRV {
                        MostDetailedMip: 0,
                        MipLevels: mip_levels,
                        PlaneSlice: 0,
                        ResourceMinLODClamp: 0.0,
                    },
                },
            };
            device.CreateShaderResourceView(resource, Some(&desc), cpu);
        }
        ViewDesc::StructuredBuffer { num_elements, stride } => {
            let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
                Format: DXGI_FORMAT_UNKNOWN,
                ViewDimension: D3D12_SRV_DIMENSION_BUFFER,
                Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                    Buffer: D3D12_BUFFER_SRV {
                        FirstElement: 0,
                        NumElements: num_elements,
                        StructureByteStride: stride,
                        Flags: D3D12_BUFFER_SRV_FLAG_NONE,
                    },
                },
            };
            device.CreateShaderResourceView(resource, Some(&desc), cpu);
        }
        ViewDesc::RenderTarget { format } => {
            let desc = D3D12_RENDER_TARGET_VIEW_DESC {
                Format: convert::texture_format(format),
                ViewDimension: D3D12_RTV_DIMENSION_TEXTURE2D,
                Anonymous: D3D12_RENDER_TARGET_VIEW_DESC_0 {
                    Texture2D: D3D12_TEX2D_RTV { MipSlice: 0, PlaneSlice: 0 },
                },
            };
            device.CreateRenderTargetView(resource, Some(&desc), cpu);
        }
        ViewDesc::DepthStencil { format } => {
            let desc = D3D12_DEPTH_STENCIL_VIEW_DESC {
                Format: convert::texture_format(format),
                ViewDimension: D3D12_DSV_DIMENSION_TEXTURE2D,
                Flags: D3D12_DSV_FLAG_NONE,
                Anonymous: D3D12_DEPTH_STENCIL_VIEW_DESC_0 { Texture2D: D3D12_TEX2D_DSV { MipSlice: 0 } },
            };
            device.CreateDepthStencilView(resource, Some(&desc), cpu);
        }
    }
}
