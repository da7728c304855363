/// 检测结果绘制
use ab_glyph::{FontArc, PxScale};
use image::{ImageBuffer, Rgb};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size,
};
use imageproc::rect::Rect;

use super::types::FaceBox;
use crate::error::{PipelineError, Result};

/// 框颜色 (按身份 id 取模), RGB 顺序: 绿 蓝 红 青 品红
pub const BOX_COLORS: [[u8; 3]; 5] = [
    [0, 255, 0],
    [0, 0, 255],
    [255, 0, 0],
    [0, 255, 255],
    [255, 0, 255],
];

/// 标签文字颜色, 与框颜色一一对应 (RGB)
pub const TEXT_COLORS: [[u8; 3]; 5] = [
    [255, 255, 255],
    [0, 0, 0],
    [0, 255, 255],
    [255, 255, 0],
    [255, 0, 255],
];

pub const BOX_THICKNESS: i32 = 2;
pub const KEYPOINT_RADIUS: i32 = 3;
/// 只绘制置信度高于该值的关键点
pub const KEYPOINT_MIN_CONFIDENCE: f32 = 0.5;
const LABEL_OFFSET: i32 = 5;
const LABEL_SCALE: f32 = 18.0;

/// 未识别的人脸固定使用 0 号颜色
pub fn color_index(identity_id: i32) -> usize {
    if identity_id >= 0 {
        identity_id as usize % BOX_COLORS.len()
    } else {
        0
    }
}

/// "name (NN%)"
pub fn label_text(face: &FaceBox) -> String {
    format!(
        "{} ({}%)",
        face.identity_name,
        (face.confidence * 100.0) as i32
    )
}

/// 在 RGB 缓冲上绘制检测框/关键点/标签
#[derive(Clone, Default)]
pub struct Painter {
    font: Option<FontArc>,
}

impl Painter {
    pub fn new(font: Option<FontArc>) -> Self {
        Self { font }
    }

    /// 加载字体; 失败时只画框
    pub fn with_font_file(path: &str) -> Self {
        let font = std::fs::read(path)
            .ok()
            .and_then(|bytes| FontArc::try_from_vec(bytes).ok());
        if font.is_none() {
            log::warn!("⚠️ 字体加载失败 {}, 标签不绘制文字", path);
        }
        Self { font }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// `faces` 需已在显示坐标系
    pub fn draw(&self, faces: &[FaceBox], rgb: &mut [u8], width: u32, height: u32) -> Result<()> {
        let need = width as usize * height as usize * 3;
        if rgb.len() < need {
            return Err(PipelineError::DataInvalid(format!(
                "draw target {} < {}",
                rgb.len(),
                need
            )));
        }
        let mut img: ImageBuffer<Rgb<u8>, &mut [u8]> =
            ImageBuffer::from_raw(width, height, &mut rgb[..need])
                .ok_or_else(|| PipelineError::DataInvalid("draw target layout".into()))?;

        for face in faces {
            let ci = color_index(face.identity_id);
            let color = Rgb(BOX_COLORS[ci]);

            let x = face.bbox.x1.round() as i32;
            let y = face.bbox.y1.round() as i32;
            let w = face.bbox.width().round() as i32;
            let h = face.bbox.height().round() as i32;
            for t in 0..BOX_THICKNESS {
                let (rw, rh) = (w - 2 * t, h - 2 * t);
                if rw > 0 && rh > 0 {
                    draw_hollow_rect_mut(
                        &mut img,
                        Rect::at(x + t, y + t).of_size(rw as u32, rh as u32),
                        color,
                    );
                }
            }

            for kp in face.keypoints.iter() {
                if kp.confidence > KEYPOINT_MIN_CONFIDENCE {
                    draw_filled_circle_mut(
                        &mut img,
                        (kp.x.round() as i32, kp.y.round() as i32),
                        KEYPOINT_RADIUS,
                        color,
                    );
                }
            }

            self.draw_label(&mut img, face, x, y, ci);
        }
        Ok(())
    }

    fn draw_label(
        &self,
        img: &mut ImageBuffer<Rgb<u8>, &mut [u8]>,
        face: &FaceBox,
        x: i32,
        y: i32,
        ci: usize,
    ) {
        let text = label_text(face);
        let scale = PxScale::from(LABEL_SCALE);
        let (tw, th) = match &self.font {
            Some(font) => text_size(scale, font, &text),
            // 无字体时按等宽估算背景尺寸
            None => ((text.len() as f32 * LABEL_SCALE * 0.5) as u32, LABEL_SCALE as u32),
        };
        if tw == 0 || th == 0 {
            return;
        }

        let bottom = y - LABEL_OFFSET;
        let top = bottom - th as i32;
        draw_filled_rect_mut(
            img,
            Rect::at(x, top).of_size(tw, th),
            Rgb(BOX_COLORS[ci]),
        );
        if let Some(font) = &self.font {
            draw_text_mut(img, Rgb(TEXT_COLORS[ci]), x, top, scale, font, &text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{BBox, Keypoint, NUM_KEYPOINTS};

    fn face_at(x1: f32, y1: f32, x2: f32, y2: f32, id: i32) -> FaceBox {
        let mut kps = [Keypoint::default(); NUM_KEYPOINTS];
        kps[0] = Keypoint::new((x1 + x2) / 2.0, (y1 + y2) / 2.0, 1.0);
        kps[1] = Keypoint::new(x1 + 3.0, y1 + 3.0, 0.2);
        let mut f = FaceBox::new(0.876, BBox::new(x1, y1, x2, y2), kps);
        f.identity_id = id;
        f
    }

    #[test]
    fn test_color_index() {
        assert_eq!(color_index(-1), 0);
        assert_eq!(color_index(0), 0);
        assert_eq!(color_index(3), 3);
        assert_eq!(color_index(7), 2);
    }

    #[test]
    fn test_palette_is_rgb() {
        // 绿 蓝 红 青 品红
        assert_eq!(BOX_COLORS[0], [0, 255, 0]);
        assert_eq!(BOX_COLORS[1], [0, 0, 255]);
        assert_eq!(BOX_COLORS[2], [255, 0, 0]);
        assert_eq!(BOX_COLORS[3], [0, 255, 255]);
        assert_eq!(TEXT_COLORS[0], [255, 255, 255]);
        assert_eq!(TEXT_COLORS[2], [0, 255, 255]);
    }

    #[test]
    fn test_label_text() {
        let f = face_at(0.0, 0.0, 1.0, 1.0, -1);
        assert_eq!(label_text(&f), "Unknown (87%)");
    }

    #[test]
    fn test_draw_box_keypoints_and_label() {
        let (w, h) = (64u32, 64u32);
        let mut buf = vec![0u8; (w * h * 3) as usize];
        let painter = Painter::default();
        let f = face_at(10.0, 30.0, 50.0, 60.0, 1);
        painter.draw(&[f], &mut buf, w, h).unwrap();

        let px = |x: u32, y: u32| {
            let i = ((y * w + x) * 3) as usize;
            [buf[i], buf[i + 1], buf[i + 2]]
        };
        // 框边 (两像素宽)
        assert_eq!(px(10, 40), BOX_COLORS[1]);
        assert_eq!(px(11, 40), BOX_COLORS[1]);
        assert_eq!(px(12, 40), [0, 0, 0]);
        // 高置信度关键点
        assert_eq!(px(30, 45), BOX_COLORS[1]);
        // 低置信度关键点不画
        assert_eq!(px(13, 33), [0, 0, 0]);
        // 标签背景在框上方
        assert_eq!(px(12, 22), BOX_COLORS[1]);
    }

    #[test]
    fn test_draw_rejects_short_buffer() {
        let mut buf = vec![0u8; 10];
        assert!(Painter::default().draw(&[], &mut buf, 8, 8).is_err());
    }

    #[test]
    fn test_draw_clips_out_of_bounds() {
        let mut buf = vec![0u8; 16 * 16 * 3];
        let f = face_at(-20.0, -20.0, 40.0, 40.0, 2);
        assert!(Painter::default().draw(&[f], &mut buf, 16, 16).is_ok());
    }
}
