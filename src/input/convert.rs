//! 像素格式转换与缩放 (Pixel format conversion + resize)
//!
//! 所有输入最终转换为显示尺寸的 RGB24.
//! YUV → RGB 使用 BT.601 整数系数 (乘以128, 右移7位).

use crate::error::{PipelineError, Result};
use crate::pool::RGB_CHANNELS;
use fast_image_resize as fr;

/// YUV420P 平面视图 (借用解码器内存)
pub struct YuvPlanes<'a> {
    pub width: usize,
    pub height: usize,
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub y_stride: usize,
    pub uv_stride: usize,
}

impl YuvPlanes<'_> {
    /// 检查步长和平面长度足够覆盖整幅图像
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::DataInvalid("empty frame".into()));
        }
        if self.y_stride < self.width || self.uv_stride < self.width.div_ceil(2) {
            return Err(PipelineError::DataInvalid(format!(
                "bad stride y={} uv={} for width {}",
                self.y_stride, self.uv_stride, self.width
            )));
        }
        let chroma_rows = self.height.div_ceil(2);
        let y_need = self.y_stride * (self.height - 1) + self.width;
        let uv_need = self.uv_stride * (chroma_rows - 1) + self.width.div_ceil(2);
        if self.y.len() < y_need || self.u.len() < uv_need || self.v.len() < uv_need {
            return Err(PipelineError::DataInvalid("plane shorter than frame".into()));
        }
        Ok(())
    }
}

#[inline]
fn yuv_to_rgb(y: i32, u: i32, v: i32) -> [u8; 3] {
    [
        (y + ((v * 179) >> 7)).clamp(0, 255) as u8,
        (y - ((u * 44) >> 7) - ((v * 91) >> 7)).clamp(0, 255) as u8,
        (y + ((u * 227) >> 7)).clamp(0, 255) as u8,
    ]
}

/// YUV420P → RGB24 (源尺寸)
pub fn yuv420p_to_rgb(planes: &YuvPlanes<'_>, out: &mut [u8]) -> Result<()> {
    planes.validate()?;
    let (w, h) = (planes.width, planes.height);
    if out.len() < w * h * RGB_CHANNELS {
        return Err(PipelineError::DataInvalid("rgb output too small".into()));
    }

    let mut o = 0;
    for row in 0..h {
        let y_row = row * planes.y_stride;
        let uv_row = (row >> 1) * planes.uv_stride;
        for x in 0..w {
            let y = planes.y[y_row + x] as i32;
            let u = planes.u[uv_row + (x >> 1)] as i32 - 128;
            let v = planes.v[uv_row + (x >> 1)] as i32 - 128;
            out[o..o + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
            o += 3;
        }
    }
    Ok(())
}

/// 打包 4:2:2 的字节顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packed422 {
    /// Y0 U Y1 V
    Yuyv,
    /// U Y0 V Y1
    Uyvy,
}

/// 打包 YUV 4:2:2 → RGB24
///
/// `stride` 为每行字节数 (驱动可能在行尾填充), 0 表示紧密排列.
pub fn packed422_to_rgb(
    data: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    order: Packed422,
    out: &mut [u8],
) -> Result<()> {
    if width % 2 != 0 {
        return Err(PipelineError::DataInvalid(format!("odd 4:2:2 width {}", width)));
    }
    let row_bytes = width * 2;
    let stride = if stride == 0 { row_bytes } else { stride };
    if stride < row_bytes {
        return Err(PipelineError::DataInvalid(format!(
            "4:2:2 stride {} < row {}",
            stride, row_bytes
        )));
    }
    if height == 0
        || data.len() < stride * (height - 1) + row_bytes
        || out.len() < width * height * RGB_CHANNELS
    {
        return Err(PipelineError::DataInvalid("packed 4:2:2 buffer too small".into()));
    }

    for row in 0..height {
        let src = &data[row * stride..row * stride + row_bytes];
        let dst = &mut out[row * width * RGB_CHANNELS..(row + 1) * width * RGB_CHANNELS];
        for (pair, chunk) in src.chunks_exact(4).enumerate() {
            let (y0, u, y1, v) = match order {
                Packed422::Yuyv => (chunk[0], chunk[1], chunk[2], chunk[3]),
                Packed422::Uyvy => (chunk[1], chunk[0], chunk[3], chunk[2]),
            };
            let (u, v) = (u as i32 - 128, v as i32 - 128);
            let o = pair * 6;
            dst[o..o + 3].copy_from_slice(&yuv_to_rgb(y0 as i32, u, v));
            dst[o + 3..o + 6].copy_from_slice(&yuv_to_rgb(y1 as i32, u, v));
        }
    }
    Ok(())
}

/// 源格式 → 目标尺寸 RGB24 转换器
///
/// 源分辨率变化时重建中间缓冲.
pub struct FrameConverter {
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
    scratch: Vec<u8>,
    resizer: fr::Resizer,
    rebuilds: usize,
}

impl FrameConverter {
    pub fn new(dst_width: u32, dst_height: u32) -> Self {
        Self {
            src_width: 0,
            src_height: 0,
            dst_width,
            dst_height,
            scratch: Vec::new(),
            resizer: fr::Resizer::new(),
            rebuilds: 0,
        }
    }

    pub fn source_size(&self) -> (u32, u32) {
        (self.src_width, self.src_height)
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.dst_width, self.dst_height)
    }

    /// 源分辨率重建次数
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    fn ensure_source(&mut self, width: u32, height: u32) {
        if self.src_width != width || self.src_height != height {
            if self.src_width != 0 {
                log::info!(
                    "🔄 源分辨率变化 {}x{} → {}x{}, 重建转换器",
                    self.src_width,
                    self.src_height,
                    width,
                    height
                );
            }
            self.src_width = width;
            self.src_height = height;
            self.scratch = vec![0; width as usize * height as usize * RGB_CHANNELS];
            self.rebuilds += 1;
        }
    }

    /// YUV420P → 目标 RGB, 返回写入的行数
    pub fn convert_yuv420p(&mut self, planes: &YuvPlanes<'_>, dst: &mut [u8]) -> Result<u32> {
        self.ensure_source(planes.width as u32, planes.height as u32);
        yuv420p_to_rgb(planes, &mut self.scratch)?;
        self.scale_into(dst)
    }

    /// YUYV/UYVY → 目标 RGB
    pub fn convert_packed422(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        order: Packed422,
        dst: &mut [u8],
    ) -> Result<u32> {
        self.ensure_source(width, height);
        packed422_to_rgb(
            data,
            width as usize,
            height as usize,
            stride as usize,
            order,
            &mut self.scratch,
        )?;
        self.scale_into(dst)
    }

    /// MJPEG → 目标 RGB
    pub fn convert_mjpeg(&mut self, data: &[u8], dst: &mut [u8]) -> Result<u32> {
        let rgb = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
            .map_err(|e| PipelineError::DataInvalid(format!("mjpeg decode: {}", e)))?
            .into_rgb8();
        self.ensure_source(rgb.width(), rgb.height());
        self.scratch.copy_from_slice(rgb.as_raw());
        self.scale_into(dst)
    }

    /// 已经是 RGB24 的源图像 → 目标尺寸
    pub fn convert_rgb(&mut self, data: &[u8], width: u32, height: u32, dst: &mut [u8]) -> Result<u32> {
        self.ensure_source(width, height);
        let need = self.scratch.len();
        if data.len() < need {
            return Err(PipelineError::DataInvalid("rgb source too small".into()));
        }
        self.scratch.copy_from_slice(&data[..need]);
        self.scale_into(dst)
    }

    fn scale_into(&mut self, dst: &mut [u8]) -> Result<u32> {
        let need = self.dst_width as usize * self.dst_height as usize * RGB_CHANNELS;
        if dst.len() < need {
            return Err(PipelineError::DataInvalid("destination buffer too small".into()));
        }

        if self.src_width == self.dst_width && self.src_height == self.dst_height {
            dst[..need].copy_from_slice(&self.scratch);
            return Ok(self.dst_height);
        }

        let src = fr::images::ImageRef::new(
            self.src_width,
            self.src_height,
            &self.scratch,
            fr::PixelType::U8x3,
        )
        .map_err(|e| PipelineError::DataInvalid(format!("resize source: {}", e)))?;
        let mut out = fr::images::Image::from_slice_u8(
            self.dst_width,
            self.dst_height,
            &mut dst[..need],
            fr::PixelType::U8x3,
        )
        .map_err(|e| PipelineError::DataInvalid(format!("resize target: {}", e)))?;

        self.resizer
            .resize(
                &src,
                &mut out,
                &fr::ResizeOptions::new()
                    .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
            )
            .map_err(|e| PipelineError::TransientIo(format!("resize: {}", e)))?;

        Ok(self.dst_height)
    }
}
