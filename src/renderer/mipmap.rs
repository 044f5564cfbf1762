//! 纹理解码与 mip 链生成
//!
//! 颜色纹理一律按 sRGB 处理：先转到线性空间，2x2 盒式滤波，再编码回 sRGB。
//! alpha 通道本身是线性的，直接平均。

use std::path::Path;

use image::RgbaImage;

use crate::core::error::{ContractViolation, EngineError, Result};
use crate::math::color_space::{linear_to_srgb, srgb_to_linear};

use super::resource::{TextureFormat, TextureMetadata};

/// 解码后的纹理及其完整 mip 链
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureImage {
    pub metadata: TextureMetadata,
    /// 每层紧密排列的 RGBA8 数据
    pub mips: Vec<Vec<u8>>,
}

impl TextureImage {
    /// 从文件解码并生成完整 mip 链
    pub fn load(path: &Path) -> Result<Self> {
        let decoded = image::open(path).map_err(|source| EngineError::Image { path: path.to_path_buf(), source })?;
        Self::from_rgba(decoded.to_rgba8())
    }

    pub fn from_rgba(image: RgbaImage) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::from_pixels(width, height, image.into_raw())
    }

    /// 从 RGBA8 sRGB 像素构建
    ///
    /// `pixels` 必须正好是 `width * height * 4` 字节。
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(ContractViolation::EmptyTexture { width, height }.into());
        }
        let expected = width as u64 * height as u64 * 4;
        if pixels.len() as u64 != expected {
            return Err(ContractViolation::UploadSizeMismatch { expected, actual: pixels.len() as u64 }.into());
        }

        let mip_levels = TextureMetadata::full_mip_count(width, height);
        let metadata = TextureMetadata::new(width, height, TextureFormat::Rgba8UnormSrgb, mip_levels);

        let mut mips = Vec::with_capacity(mip_levels as usize);
        mips.push(pixels);
        for level in 1..mip_levels {
            let (src_w, src_h) = metadata.mip_extent(level - 1);
            let (dst_w, dst_h) = metadata.mip_extent(level);
            let next = downsample(&mips[level as usize - 1], src_w, src_h, dst_w, dst_h);
            mips.push(next);
        }

        Ok(Self { metadata, mips })
    }
}

/// 2x2 盒式滤波，奇数边界处夹取到最后一行/列
fn downsample(src: &[u8], src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((dst_w * dst_h * 4) as usize);
    let texel = |x: u32, y: u32, c: usize| src[((y.min(src_h - 1) * src_w + x.min(src_w - 1)) * 4) as usize + c];

    for y in 0..dst_h {
        for x in 0..dst_w {
            let (x0, y0) = (x * 2, y * 2);
            let taps = [(x0, y0), (x0 + 1, y0), (x0, y0 + 1), (x0 + 1, y0 + 1)];

            for c in 0..3 {
                let sum: f32 = taps
                    .iter()
                    .map(|&(tx, ty)| srgb_to_linear(texel(tx, ty, c) as f32 / 255.0))
                    .sum();
                out.push(to_unorm(linear_to_srgb(sum / 4.0)));
            }
            let alpha: f32 = taps.iter().map(|&(tx, ty)| texel(tx, ty, 3) as f32).sum();
            out.push((alpha / 4.0).round() as u8);
        }
    }

    out
}

fn to_unorm(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}
