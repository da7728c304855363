/// 人脸检测数据结构定义
/// Data structures for face detection

// ========== 公共常量 ==========

/// 模型输入尺寸
pub const MODEL_SIZE: u32 = 640;
/// 每个人脸的关键点数量
pub const NUM_KEYPOINTS: usize = 5;
/// 身份特征向量长度
pub const EMBEDDING_DIM: usize = 128;
/// 未识别身份
pub const UNKNOWN_ID: i32 = -1;
pub const UNKNOWN_NAME: &str = "Unknown";
/// letterbox 填充色
pub const PAD_VALUE: u8 = 114;

// ========== 数据结构 ==========

/// 检测框 (角点形式, 模型输入像素坐标)
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 中心形式 (cx, cy, w, h) → 角点形式
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        (x2 - x1) * (y2 - y1)
    }

    /// 交并比; 不相交或任一框面积非正时为0
    pub fn iou(&self, other: &BBox) -> f32 {
        if self.area() <= 0.0 || other.area() <= 0.0 {
            return 0.0;
        }
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// 人脸关键点 (x, y, confidence)
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }
}

/// 一个人脸检测结果
#[derive(Clone, Debug, PartialEq)]
pub struct FaceBox {
    pub confidence: f32,
    pub bbox: BBox,
    pub keypoints: [Keypoint; NUM_KEYPOINTS],
    pub embedding: Option<Vec<f32>>,
    pub identity_id: i32,
    pub identity_name: String,
}

impl FaceBox {
    /// 新检测默认未识别
    pub fn new(confidence: f32, bbox: BBox, keypoints: [Keypoint; NUM_KEYPOINTS]) -> Self {
        Self {
            confidence,
            bbox,
            keypoints,
            embedding: None,
            identity_id: UNKNOWN_ID,
            identity_name: UNKNOWN_NAME.to_string(),
        }
    }

    pub fn is_identified(&self) -> bool {
        self.identity_id >= 0
    }

    /// 通过 letterbox 映射回显示坐标
    pub fn to_display(&self, lb: &Letterbox) -> FaceBox {
        let (x1, y1) = lb.to_display(self.bbox.x1, self.bbox.y1);
        let (x2, y2) = lb.to_display(self.bbox.x2, self.bbox.y2);
        let mut keypoints = self.keypoints;
        for kp in keypoints.iter_mut() {
            let (x, y) = lb.to_display(kp.x, kp.y);
            kp.x = x;
            kp.y = y;
        }
        FaceBox {
            bbox: BBox::new(x1, y1, x2, y2),
            keypoints,
            ..self.clone()
        }
    }
}

/// letterbox 几何: 等比缩放 + 对称填充到模型输入方形
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    /// 缩放后内容尺寸
    pub scaled_width: u32,
    pub scaled_height: u32,
    /// 总填充量 (左右/上下之和)
    pub padding_width: u32,
    pub padding_height: u32,
    pub model_width: u32,
    pub model_height: u32,
}

impl Letterbox {
    /// 竖屏输入 (宽 < 高) 不适用于该模型, 返回 None
    pub fn compute(
        display_width: u32,
        display_height: u32,
        model_width: u32,
        model_height: u32,
    ) -> Option<Self> {
        if display_width == 0 || display_height == 0 || display_width < display_height {
            return None;
        }
        let scale = (model_width as f32 / display_width as f32)
            .min(model_height as f32 / display_height as f32);
        // 向下取整
        let scaled_width = ((display_width as f32 * scale) as u32).min(model_width);
        let scaled_height = ((display_height as f32 * scale) as u32).min(model_height);

        Some(Self {
            scale,
            scaled_width,
            scaled_height,
            padding_width: model_width - scaled_width,
            padding_height: model_height - scaled_height,
            model_width,
            model_height,
        })
    }

    /// 左侧填充 (余数在右侧)
    pub fn pad_left(&self) -> u32 {
        self.padding_width / 2
    }

    /// 顶部填充 (余数在底部)
    pub fn pad_top(&self) -> u32 {
        self.padding_height / 2
    }

    /// 模型坐标 → 显示坐标
    pub fn to_display(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_left() as f32) / self.scale,
            (y - self.pad_top() as f32) / self.scale,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_properties() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 15.0);
        let far = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&b) - b.iou(&a)).abs() < 1e-6);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&far), 0.0);
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate_boxes() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let flat = BBox::new(2.0, 2.0, 8.0, 2.0);
        let inverted = BBox::new(10.0, 10.0, 0.0, 0.0);
        assert_eq!(a.iou(&flat), 0.0);
        assert_eq!(a.iou(&inverted), 0.0);
        // 边相接不算重叠
        assert_eq!(a.iou(&BBox::new(10.0, 0.0, 20.0, 10.0)), 0.0);
    }

    #[test]
    fn test_center_to_corner() {
        let b = BBox::from_center(50.0, 40.0, 20.0, 10.0);
        assert_eq!(b, BBox::new(40.0, 35.0, 60.0, 45.0));
    }

    #[test]
    fn test_letterbox_1080p() {
        let lb = Letterbox::compute(1920, 1080, 640, 640).unwrap();
        assert!((lb.scale - 640.0 / 1920.0).abs() < 1e-6);
        assert_eq!((lb.scaled_width, lb.scaled_height), (640, 360));
        assert_eq!(lb.padding_height, 280);
        assert_eq!(lb.padding_width, 0);
        assert_eq!(lb.pad_top(), 140);
    }

    #[test]
    fn test_letterbox_truncates_scaled_size() {
        // 768 * 640 / 1366 = 359.82
        let lb = Letterbox::compute(1366, 768, 640, 640).unwrap();
        assert_eq!((lb.scaled_width, lb.scaled_height), (640, 359));
        assert_eq!(lb.padding_height, 281);
        assert_eq!(lb.pad_top(), 140);
    }

    #[test]
    fn test_letterbox_odd_padding_remainder_trails() {
        let lb = Letterbox::compute(700, 301, 640, 640).unwrap();
        let trailing = lb.padding_height - lb.pad_top();
        assert!(trailing >= lb.pad_top());
        assert!(trailing - lb.pad_top() <= 1);
    }

    #[test]
    fn test_letterbox_rejects_portrait() {
        assert!(Letterbox::compute(1080, 1920, 640, 640).is_none());
        assert!(Letterbox::compute(0, 0, 640, 640).is_none());
    }

    #[test]
    fn test_to_display_inverts_letterbox() {
        let lb = Letterbox::compute(1920, 1080, 640, 640).unwrap();
        let (x, y) = lb.to_display(320.0, 140.0 + 180.0);
        assert!((x - 960.0).abs() < 1e-2);
        assert!((y - 540.0).abs() < 1e-2);
    }

    #[test]
    fn test_new_face_is_unknown() {
        let face = FaceBox::new(0.9, BBox::default(), [Keypoint::default(); NUM_KEYPOINTS]);
        assert_eq!(face.identity_id, UNKNOWN_ID);
        assert_eq!(face.identity_name, "Unknown");
        assert!(!face.is_identified());
    }
}
