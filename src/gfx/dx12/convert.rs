//! 引擎类型到 D3D12 / DXGI 常量的转换

use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::gfx::backend::FeatureLevel;
use crate::renderer::descriptor::PoolKind;
use crate::renderer::resource::{MemoryKind, ResourceState, TextureFormat};
use crate::renderer::shaders::{ShaderStage, VertexFormat};

pub fn texture_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        TextureFormat::Bgra8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        TextureFormat::R32Float => DXGI_FORMAT_R32_FLOAT,
        TextureFormat::Rgba32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
        TextureFormat::Depth24UnormStencil8 => DXGI_FORMAT_D24_UNORM_S8_UINT,
        TextureFormat::Depth32Float => DXGI_FORMAT_D32_FLOAT,
    }
}

/// Flip 交换链的缓冲不能是 sRGB 格式，sRGB 只体现在 RTV 上
pub fn swap_chain_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::Rgba8UnormSrgb => DXGI_FORMAT_R8G8B8A8_UNORM,
        other => texture_format(other),
    }
}

pub fn vertex_format(format: VertexFormat) -> DXGI_FORMAT {
    match format {
        VertexFormat::Float2 => DXGI_FORMAT_R32G32_FLOAT,
        VertexFormat::Float3 => DXGI_FORMAT_R32G32B32_FLOAT,
        VertexFormat::Float4 => DXGI_FORMAT_R32G32B32A32_FLOAT,
    }
}

pub fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::GenericRead => D3D12_RESOURCE_STATE_GENERIC_READ,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
        ResourceState::DepthWrite => D3D12_RESOURCE_STATE_DEPTH_WRITE,
    }
}

pub fn heap_type(memory: MemoryKind) -> D3D12_HEAP_TYPE {
    match memory {
        MemoryKind::Upload => D3D12_HEAP_TYPE_UPLOAD,
        MemoryKind::DeviceLocal => D3D12_HEAP_TYPE_DEFAULT,
    }
}

pub fn descriptor_heap_type(kind: PoolKind) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match kind {
        PoolKind::RenderTarget => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        PoolKind::DepthStencil => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
        PoolKind::ShaderVisible => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
    }
}

pub fn shader_visibility(stage: ShaderStage) -> D3D12_SHADER_VISIBILITY {
    match stage {
        ShaderStage::Vertex => D3D12_SHADER_VISIBILITY_VERTEX,
        ShaderStage::Pixel => D3D12_SHADER_VISIBILITY_PIXEL,
    }
}

pub fn feature_level(level: FeatureLevel) -> D3D_FEATURE_LEVEL {
    match level {
        FeatureLevel::Level12_0 => D3D_FEATURE_LEVEL_12_0,
        FeatureLevel::Level12_1 => D3D_FEATURE_LEVEL_12_1,
        FeatureLevel::Level12_2 => D3D_FEATURE_LEVEL_12_2,
    }
}
