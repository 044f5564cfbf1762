//! 着色器与管线描述
//!
//! 着色器在运行时从 `shaders/` 目录读取 HLSL 源码并编译（DX12 使用 D3DCompile），
//! 编译失败属于致命错误。管线描述与具体后端无关，由后端翻译为根签名和 PSO。
//!
//! # 渲染管线
//!
//! ```text
//! 实例数据(SRV) -> 顶点着色器 -> 光栅化 -> 像素着色器(纹理 SRV + 静态采样器) -> 渲染目标
//! ```

use super::resource::TextureFormat;

/// 顶点着色器 profile
pub const VERTEX_PROFILE: &str = "vs_5_0";

/// 像素着色器 profile
pub const PIXEL_PROFILE: &str = "ps_5_0";

/// 着色器阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    /// 从 profile 字符串推断阶段（`vs_*` / `ps_*`）
    pub fn from_profile(profile: &str) -> Option<Self> {
        if profile.starts_with("vs_") {
            Some(ShaderStage::Vertex)
        } else if profile.starts_with("ps_") {
            Some(ShaderStage::Pixel)
        } else {
            None
        }
    }
}

/// 编译后的着色器字节码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBlob {
    pub stage: ShaderStage,
    pub bytecode: Vec<u8>,
}

/// 混合模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Opaque,
    /// 普通 alpha 混合：`src * a + dst * (1 - a)`
    Alpha,
    /// 加法混合：`src * a + dst`
    Additive,
}

/// 背面剔除
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Back,
}

/// 根参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootParameter {
    /// 单个 SRV 的描述符表，`register` 为 tN
    ShaderResourceTable { register: u32, visibility: ShaderStage },
    /// 根 CBV，`register` 为 bN
    ConstantBuffer { register: u32, visibility: ShaderStage },
}

/// 顶点属性格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float2,
    Float3,
    Float4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float2 => 8,
            VertexFormat::Float3 => 12,
            VertexFormat::Float4 => 16,
        }
    }
}

/// 输入布局中的一个属性，语义索引固定为 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub semantic: &'static str,
    pub format: VertexFormat,
    pub offset: u32,
}

impl VertexAttribute {
    /// 按顺序紧密排列属性，返回布局和步长
    pub fn packed(attributes: &[(&'static str, VertexFormat)]) -> (Vec<VertexAttribute>, u32) {
        let mut offset = 0;
        let layout = attributes
            .iter()
            .map(|&(semantic, format)| {
                let attribute = VertexAttribute { semantic, format, offset };
                offset += format.size();
                attribute
            })
            .collect();
        (layout, offset)
    }
}

/// 图形管线描述
///
/// 始终包含一个 s0 线性包裹静态采样器。
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub name: String,
    pub vertex_shader: ShaderBlob,
    pub pixel_shader: ShaderBlob,
    pub input_layout: Vec<VertexAttribute>,
    pub root_parameters: Vec<RootParameter>,
    pub blend: BlendMode,
    pub cull: CullMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub render_target_format: TextureFormat,
    pub depth_format: TextureFormat,
}
