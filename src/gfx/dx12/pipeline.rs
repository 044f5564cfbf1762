//! 着色器编译与管线状态
//!
//! HLSL 源码在运行时用 D3DCompile 编译（入口固定为 `main`），编译错误信息原样放进
//! [`GraphicsError::ShaderCompilation`]。根签名由 [`PipelineDesc::root_parameters`]
//! 按顺序生成，每个 SRV 表只含一个描述符，并附带 s0 线性包裹静态采样器。

use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::path::Path;

use tracing::debug;
use windows::core::PCSTR;
use windows::Win32::Graphics::Direct3D::Fxc::*;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;

use super::convert;
use crate::core::error::{GraphicsError, Result};
use crate::renderer::shaders::{BlendMode, CullMode, PipelineDesc, RootParameter, ShaderBlob, ShaderStage};

/// 根签名和 PSO
#[derive(Debug)]
pub struct Dx12Pipeline {
    pub name: String,
    pub root_signature: ID3D12RootSignature,
    pub pso: ID3D12PipelineState,
}

pub fn compile_shader(path: &Path, profile: &str) -> Result<ShaderBlob> {
    let stage = ShaderStage::from_profile(profile)
        .ok_or_else(|| GraphicsError::ShaderCompilation(format!("unsupported profile '{profile}'")))?;
    let source = std::fs::read_to_string(path)
        .map_err(|e| GraphicsError::ShaderCompilation(format!("{}: {e}", path.display())))?;

    let source_name = c_string(&path.display().to_string())?;
    let target = c_string(profile)?;
    let flags = if cfg!(debug_assertions) { D3DCOMPILE_DEBUG | D3DCOMPILE_SKIP_OPTIMIZATION } else { 0 };

    unsafe {
        let mut blob: Option<ID3DBlob> = None;
        let mut error_blob: Option<ID3DBlob> = None;
        let result = D3DCompile(
            source.as_ptr() as _,
            source.len(),
            PCSTR(source_name.as_ptr() as *const u8),
            None,
            None,
            windows::core::s!("main"),
            PCSTR(target.as_ptr() as *const u8),
            flags,
            0,
            &mut blob,
            Some(&mut error_blob),
        );

        if let Err(e) = result {
            let message = error_blob
                .map(|error| String::from_utf8_lossy(blob_bytes(&error)).trim_end_matches('\0').to_string())
                .unwrap_or_else(|| format!("{:?}", e));
            return Err(GraphicsError::ShaderCompilation(format!("{}: {}", path.display(), message)).into());
        }
        let blob = blob.ok_or_else(|| GraphicsError::ShaderCompilation(format!("{}: empty bytecode", path.display())))?;

        debug!(path = %path.display(), profile, size = blob.GetBufferSize(), "Shader compiled");
        Ok(ShaderBlob { stage, bytecode: blob_bytes(&blob).to_vec() })
    }
}

pub fn create_pipeline(device: &ID3D12Device, desc: &PipelineDesc) -> Result<Dx12Pipeline> {
    if desc.vertex_shader.stage != ShaderStage::Vertex || desc.pixel_shader.stage != ShaderStage::Pixel {
        return Err(GraphicsError::PipelineCreation(format!("{}: shader stages do not match", desc.name)).into());
    }

    unsafe {
        let root_signature = create_root_signature(device, desc)?;

        // 语义名需要以 NUL 结尾并活到 PSO 创建完成
        let semantics = desc
            .input_layout
            .iter()
            .map(|attribute| c_string(attribute.semantic))
            .collect::<Result<Vec<_>>>()?;
        let input_elements: Vec<D3D12_INPUT_ELEMENT_DESC> = desc
            .input_layout
            .iter()
            .zip(&semantics)
            .map(|(attribute, semantic)| D3D12_INPUT_ELEMENT_DESC {
                SemanticName: PCSTR(semantic.as_ptr() as *const u8),
                SemanticIndex: 0,
                Format: convert::vertex_format(attribute.format),
                InputSlot: 0,
                AlignedByteOffset: attribute.offset,
                InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            })
            .collect();

        let mut pso_desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC::default();
        pso_desc.pRootSignature = ManuallyDrop::new(Some(root_signature.clone()));
        pso_desc.VS = D3D12_SHADER_BYTECODE {
            pShaderBytecode: desc.vertex_shader.bytecode.as_ptr() as _,
            BytecodeLength: desc.vertex_shader.bytecode.len(),
        };
        pso_desc.PS = D3D12_SHADER_BYTECODE {
            pShaderBytecode: desc.pixel_shader.bytecode.as_ptr() as _,
            BytecodeLength: desc.pixel_shader.bytecode.len(),
        };
        pso_desc.BlendState = blend_desc(desc.blend);
        pso_desc.RasterizerState = D3D12_RASTERIZER_DESC {
            FillMode: D3D12_FILL_MODE_SOLID,
            CullMode: match desc.cull {
                CullMode::None => D3D12_CULL_MODE_NONE,
                CullMode::Back => D3D12_CULL_MODE_BACK,
            },
            FrontCounterClockwise: false.into(),
            DepthClipEnable: true.into(),
            ..Default::default()
        };
        pso_desc.DepthStencilState = D3D12_DEPTH_STENCIL_DESC {
            DepthEnable: desc.depth_test.into(),
            DepthWriteMask: if desc.depth_write { D3D12_DEPTH_WRITE_MASK_ALL } else { D3D12_DEPTH_WRITE_MASK_ZERO },
            DepthFunc: D3D12_COMPARISON_FUNC_LESS_EQUAL,
            StencilEnable: false.into(),
            StencilReadMask: 0xFF,
            StencilWriteMask: 0xFF,
            FrontFace: D3D12_DEPTH_STENCILOP_DESC::default(),
            BackFace: D3D12_DEPTH_STENCILOP_DESC::default(),
        };
        pso_desc.SampleMask = u32::MAX;
        pso_desc.InputLayout = D3D12_INPUT_LAYOUT_DESC {
            pInputElementDescs: input_elements.as_ptr(),
            NumElements: input_elements.len() as u32,
        };
        pso_desc.PrimitiveTopologyType = D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE;
        pso_desc.NumRenderTargets = 1;
        pso_desc.RTVFormats[0] = convert::texture_format(desc.render_target_format);
        pso_desc.DSVFormat = convert::texture_format(desc.depth_format);
        pso_desc.SampleDesc.Count = 1;

        let result = device.CreateGraphicsPipelineState::<ID3D12PipelineState>(&pso_desc);
        // 归还描述里借用的根签名引用
        ManuallyDrop::drop(&mut pso_desc.pRootSignature);
        let pso = result
            .map_err(|e| GraphicsError::PipelineCreation(format!("{}: failed to create PSO: {:?}", desc.name, e)))?;

        debug!(pipeline = %desc.name, "Pipeline state created");
        Ok(Dx12Pipeline { name: desc.name.clone(), root_signature, pso })
    }
}

unsafe fn create_root_signature(device: &ID3D12Device, desc: &PipelineDesc) -> Result<ID3D12RootSignature> {
    // 每个描述符表一个区间，地址在填写根参数前固定下来
    let ranges: Vec<D3D12_DESCRIPTOR_RANGE> = desc
        .root_parameters
        .iter()
        .map(|parameter| match *parameter {
            RootParameter::ShaderResourceTable { register, .. } => D3D12_DESCRIPTOR_RANGE {
                RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
                NumDescriptors: 1,
                BaseShaderRegister: register,
                RegisterSpace: 0,
                OffsetInDescriptorsFromTableStart: D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND,
            },
            RootParameter::ConstantBuffer { .. } => D3D12_DESCRIPTOR_RANGE::default(),
        })
        .collect();

    let parameters: Vec<D3D12_ROOT_PARAMETER> = desc
        .root_parameters
        .iter()
        .zip(&ranges)
        .map(|(parameter, range)| match *parameter {
            RootParameter::ShaderResourceTable { visibility, .. } => D3D12_ROOT_PARAMETER {
                ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
                Anonymous: D3D12_ROOT_PARAMETER_0 {
                    DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                        NumDescriptorRanges: 1,
                        pDescriptorRanges: range,
                    },
                },
                ShaderVisibility: convert::shader_visibility(visibility),
            },
            RootParameter::ConstantBuffer { register, visibility } => D3D12_ROOT_PARAMETER {
                ParameterType: D3D12_ROOT_PARAMETER_TYPE_CBV,
                Anonymous: D3D12_ROOT_PARAMETER_0 {
                    Descriptor: D3D12_ROOT_DESCRIPTOR { ShaderRegister: register, RegisterSpace: 0 },
                },
                ShaderVisibility: convert::shader_visibility(visibility),
            },
        })
        .collect();

    let sampler = D3D12_STATIC_SAMPLER_DESC {
        Filter: D3D12_FILTER_MIN_MAG_MIP_LINEAR,
        AddressU: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressV: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressW: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        MipLODBias: 0.0,
        MaxAnisotropy: 1,
        ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
        BorderColor: D3D12_STATIC_BORDER_COLOR_TRANSPARENT_BLACK,
        MinLOD: 0.0,
        MaxLOD: D3D12_FLOAT32_MAX,
        ShaderRegister: 0,
        RegisterSpace: 0,
        ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
    };

    let root_desc = D3D12_ROOT_SIGNATURE_DESC {
        NumParameters: parameters.len() as u32,
        pParameters: parameters.as_ptr(),
        NumStaticSamplers: 1,
        pStaticSamplers: &sampler,
        Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
    };

    let mut signature: Option<ID3DBlob> = None;
    let mut error_blob: Option<ID3DBlob> = None;
    if let Err(e) =
        D3D12SerializeRootSignature(&root_desc, D3D_ROOT_SIGNATURE_VERSION_1, &mut signature, Some(&mut error_blob))
    {
        let message = error_blob
            .map(|error| String::from_utf8_lossy(blob_bytes(&error)).to_string())
            .unwrap_or_else(|| format!("{:?}", e));
        return Err(GraphicsError::PipelineCreation(format!("{}: root signature: {}", desc.name, message)).into());
    }
    let signature = signature
        .ok_or_else(|| GraphicsError::PipelineCreation(format!("{}: empty root signature blob", desc.name)))?;

    device.CreateRootSignature(0, blob_bytes(&signature)).map_err(|e| {
        GraphicsError::PipelineCreation(format!("{}: failed to create root signature: {:?}", desc.name, e)).into()
    })
}

fn blend_desc(mode: BlendMode) -> D3D12_BLEND_DESC {
    let target = match mode {
        BlendMode::Opaque => D3D12_RENDER_TARGET_BLEND_DESC {
            BlendEnable: false.into(),
            LogicOpEnable: false.into(),
            RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
            ..Default::default()
        },
        BlendMode::Alpha | BlendMode::Additive => D3D12_RENDER_TARGET_BLEND_DESC {
            BlendEnable: true.into(),
            LogicOpEnable: false.into(),
            SrcBlend: D3D12_BLEND_SRC_ALPHA,
            DestBlend: if mode == BlendMode::Additive { D3D12_BLEND_ONE } else { D3D12_BLEND_INV_SRC_ALPHA },
            BlendOp: D3D12_BLEND_OP_ADD,
            SrcBlendAlpha: D3D12_BLEND_ONE,
            DestBlendAlpha: D3D12_BLEND_ZERO,
            BlendOpAlpha: D3D12_BLEND_OP_ADD,
            LogicOp: D3D12_LOGIC_OP_NOOP,
            RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
        },
    };

    D3D12_BLEND_DESC {
        AlphaToCoverageEnable: false.into(),
        IndependentBlendEnable: false.into(),
        RenderTarget: [target, Default::default(), Default::default(), Default::default(),
            Default::default(), Default::default(), Default::default(), Default::default()],
    }
}

unsafe fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
}

fn c_string(value: &str) -> Result<CString> {
    CString::new(value).map_err(|e| GraphicsError::ShaderCompilation(format!("invalid string '{value}': {e}")).into())
}
