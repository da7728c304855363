//! 人脸检测引擎
//!
//! letterbox 预处理 → 推理 → 输出解码 (flat 或多尺度网格) → NMS → 身份匹配.
//! 置信度阈值可被显示层并发修改, 用锁保护; 其余状态只属于所在通道线程.

use std::sync::Arc;

use fast_image_resize as fr;
use ndarray::{Array4, ArrayD};
use parking_lot::{Mutex, RwLock};

use super::draw::Painter;
use super::identity::IdentityStore;
use super::layer::{
    decode_flat, decode_grid, face_layers, DetectionLayer, GridMaps, BBOX_DIMS, FLAT_FEATURES,
    GRID_OUTPUTS, KEYPOINT_DIMS,
};
use super::nms::non_max_suppression;
use super::types::{FaceBox, Letterbox, MODEL_SIZE, PAD_VALUE};
use crate::error::{PipelineError, Result};

pub const DEFAULT_CONFIDENCE: f32 = 0.3;
pub const DEFAULT_IOU: f32 = 0.45;

/// 推理后端接口: 输入 `[1, 3, H, W]`, 返回全部输出张量
pub trait InferenceBackend: Send {
    fn run(&mut self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>>;
}

/// 一次推理的结果 (模型坐标系) 与对应的 letterbox
#[derive(Debug, Clone, Default)]
pub struct DetectionOutput {
    pub faces: Vec<FaceBox>,
    pub letterbox: Option<Letterbox>,
}

impl DetectionOutput {
    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// 映射回显示坐标
    pub fn display_faces(&self) -> Vec<FaceBox> {
        match &self.letterbox {
            Some(lb) => self.faces.iter().map(|f| f.to_display(lb)).collect(),
            None => self.faces.clone(),
        }
    }
}

fn check_threshold(name: &str, v: f32) -> Result<f32> {
    if !(0.0..=1.0).contains(&v) {
        return Err(PipelineError::Config(format!(
            "{} threshold {} outside [0, 1]",
            name, v
        )));
    }
    Ok(v)
}

pub struct DetectionEngine {
    backend: Box<dyn InferenceBackend>,
    model_width: u32,
    model_height: u32,
    layers: [DetectionLayer; 3],
    confidence: Arc<Mutex<f32>>,
    iou: f32,
    letterbox: Option<Letterbox>,
    /// 最近一次 compute_padding 的显示尺寸
    padded_for: Option<(u32, u32)>,
    valid: bool,
    identities: Arc<RwLock<IdentityStore>>,
    painter: Painter,
    resizer: fr::Resizer,
    scaled: Vec<u8>,
}

impl DetectionEngine {
    pub fn new(backend: Box<dyn InferenceBackend>) -> Self {
        Self {
            backend,
            model_width: MODEL_SIZE,
            model_height: MODEL_SIZE,
            layers: face_layers(MODEL_SIZE as usize),
            confidence: Arc::new(Mutex::new(DEFAULT_CONFIDENCE)),
            iou: DEFAULT_IOU,
            letterbox: None,
            padded_for: None,
            valid: true,
            identities: Arc::new(RwLock::new(IdentityStore::default())),
            painter: Painter::default(),
            resizer: fr::Resizer::new(),
            scaled: Vec::new(),
        }
    }

    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Result<Self> {
        self.set_confidence(confidence)?;
        self.set_iou(iou)?;
        Ok(self)
    }

    pub fn with_painter(mut self, painter: Painter) -> Self {
        self.painter = painter;
        self
    }

    /// 多个通道共享同一个身份库
    pub fn with_identities(mut self, store: Arc<RwLock<IdentityStore>>) -> Self {
        self.identities = store;
        self
    }

    pub fn identities(&self) -> &Arc<RwLock<IdentityStore>> {
        &self.identities
    }

    pub fn model_size(&self) -> (u32, u32) {
        (self.model_width, self.model_height)
    }

    pub fn letterbox(&self) -> Option<Letterbox> {
        self.letterbox
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// 计算显示尺寸对应的 letterbox; 竖屏输入标记为无效并返回 false
    pub fn compute_padding(&mut self, display_width: u32, display_height: u32) -> bool {
        if self.padded_for == Some((display_width, display_height)) {
            return self.valid;
        }
        self.padded_for = Some((display_width, display_height));
        self.letterbox = Letterbox::compute(
            display_width,
            display_height,
            self.model_width,
            self.model_height,
        );
        self.valid = self.letterbox.is_some();
        match &self.letterbox {
            Some(lb) => log::debug!(
                "letterbox {}x{} → {}x{} 填充 ({}, {})",
                display_width,
                display_height,
                lb.scaled_width,
                lb.scaled_height,
                lb.padding_width,
                lb.padding_height
            ),
            None => log::warn!(
                "⚠️ 输入 {}x{} 不适用于该模型 (竖屏)",
                display_width,
                display_height
            ),
        }
        self.valid
    }

    pub fn set_confidence(&self, v: f32) -> Result<()> {
        *self.confidence.lock() = check_threshold("confidence", v)?;
        Ok(())
    }

    pub fn get_confidence(&self) -> f32 {
        *self.confidence.lock()
    }

    /// 供显示层直接修改阈值
    pub fn confidence_handle(&self) -> Arc<Mutex<f32>> {
        Arc::clone(&self.confidence)
    }

    pub fn set_iou(&mut self, v: f32) -> Result<()> {
        self.iou = check_threshold("iou", v)?;
        Ok(())
    }

    pub fn iou(&self) -> f32 {
        self.iou
    }

    /// 检测一帧 RGB24 图像
    pub fn process(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<DetectionOutput> {
        if !self.compute_padding(width, height) {
            return Ok(DetectionOutput::default());
        }
        let lb = self
            .letterbox
            .ok_or_else(|| PipelineError::Inference("letterbox not computed".into()))?;

        let input = self.preprocess(rgb, width, height, &lb)?;
        let ys = self.backend.run(input)?;
        let mut faces = self.postprocess(&ys)?;

        non_max_suppression(&mut faces, self.iou);
        {
            let store = self.identities.read();
            for face in faces.iter_mut() {
                store.assign(face);
            }
        }

        Ok(DetectionOutput {
            faces,
            letterbox: Some(lb),
        })
    }

    /// 把检测结果画到显示缓冲上
    pub fn draw(&self, output: &DetectionOutput, rgb: &mut [u8], width: u32, height: u32) -> Result<()> {
        self.painter.draw(&output.display_faces(), rgb, width, height)
    }

    /// RGB → BGR, 等比缩放, 常量色填充, 归一化, HWC → CHW
    fn preprocess(&mut self, rgb: &[u8], width: u32, height: u32, lb: &Letterbox) -> Result<Array4<f32>> {
        let src_len = width as usize * height as usize * 3;
        if rgb.len() < src_len {
            return Err(PipelineError::DataInvalid(format!(
                "input frame {} < {}",
                rgb.len(),
                src_len
            )));
        }

        let (sw, sh) = (lb.scaled_width, lb.scaled_height);
        self.scaled.resize(sw as usize * sh as usize * 3, 0);
        if (sw, sh) == (width, height) {
            self.scaled.copy_from_slice(&rgb[..src_len]);
        } else {
            let src = fr::images::ImageRef::new(width, height, &rgb[..src_len], fr::PixelType::U8x3)
                .map_err(|e| PipelineError::DataInvalid(format!("resize source: {}", e)))?;
            let mut dst =
                fr::images::Image::from_slice_u8(sw, sh, &mut self.scaled, fr::PixelType::U8x3)
                    .map_err(|e| PipelineError::DataInvalid(format!("resize target: {}", e)))?;
            self.resizer
                .resize(
                    &src,
                    &mut dst,
                    &fr::ResizeOptions::new()
                        .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
                )
                .map_err(|e| PipelineError::Inference(format!("resize: {}", e)))?;
        }

        let (mw, mh) = (self.model_width as usize, self.model_height as usize);
        let mut input = Array4::from_elem((1, 3, mh, mw), PAD_VALUE as f32 / 255.0);
        let plane = mw * mh;
        let (left, top) = (lb.pad_left() as usize, lb.pad_top() as usize);
        let data = input
            .as_slice_mut()
            .ok_or_else(|| PipelineError::Inference("input tensor not contiguous".into()))?;
        for (y, row) in self.scaled.chunks_exact(sw as usize * 3).enumerate() {
            let base = (y + top) * mw + left;
            for (x, px) in row.chunks_exact(3).enumerate() {
                let i = base + x;
                data[i] = px[2] as f32 / 255.0;
                data[plane + i] = px[1] as f32 / 255.0;
                data[2 * plane + i] = px[0] as f32 / 255.0;
            }
        }
        Ok(input)
    }

    /// 单个 `[1, 15, N]` 输出走 flat 解码, 9 个输出走网格解码
    fn postprocess(&self, ys: &[ArrayD<f32>]) -> Result<Vec<FaceBox>> {
        let confidence = self.get_confidence();
        match ys.len() {
            0 => Err(PipelineError::Inference("model produced no outputs".into())),
            GRID_OUTPUTS => self.decode_grids(ys, confidence),
            _ => {
                let y = &ys[0];
                let shape = y.shape();
                if shape.len() != 3 || shape[1] != FLAT_FEATURES {
                    return Err(PipelineError::Inference(format!(
                        "unexpected output shape {:?}",
                        shape
                    )));
                }
                let data = y
                    .as_slice()
                    .ok_or_else(|| PipelineError::Inference("output not contiguous".into()))?;
                Ok(decode_flat(data, shape[2], confidence))
            }
        }
    }

    /// 网格输出按形状归属到各尺度 (每格 1 / 4 / 10 个值, 格点主序), 与输出顺序无关
    fn decode_grids(&self, ys: &[ArrayD<f32>], confidence: f32) -> Result<Vec<FaceBox>> {
        let mut faces = Vec::new();
        for layer in self.layers.iter() {
            let find = |per_cell: usize| -> Result<&[f32]> {
                let len = layer.cells() * per_cell;
                ys.iter()
                    .find(|y| y.len() == len && has_grid_dims(y, layer))
                    .and_then(|y| y.as_slice())
                    .ok_or_else(|| {
                        PipelineError::Inference(format!(
                            "missing {} element map for {}x{} grid",
                            len, layer.grid_width, layer.grid_height
                        ))
                    })
            };
            let maps = GridMaps {
                bbox: find(BBOX_DIMS)?,
                confidence: find(1)?,
                keypoints: find(KEYPOINT_DIMS)?,
            };
            faces.extend(decode_grid(layer, &maps, confidence));
        }
        Ok(faces)
    }
}

/// 形状中含有相邻的 (grid_height, grid_width) 两维
fn has_grid_dims(y: &ArrayD<f32>, layer: &DetectionLayer) -> bool {
    y.shape()
        .windows(2)
        .any(|w| w[0] == layer.grid_height && w[1] == layer.grid_width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    /// 返回固定输出, 记录输入
    struct MockBackend {
        outputs: Vec<ArrayD<f32>>,
        last_input: Arc<Mutex<Option<Array4<f32>>>>,
    }

    impl MockBackend {
        fn new(outputs: Vec<ArrayD<f32>>) -> Self {
            Self {
                outputs,
                last_input: Arc::new(Mutex::new(None)),
            }
        }
    }

    impl InferenceBackend for MockBackend {
        fn run(&mut self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
            *self.last_input.lock() = Some(input);
            Ok(self.outputs.clone())
        }
    }

    /// `[1, 15, N]`, 每个 anchor: (cx, cy, w, h, conf)
    fn flat(anchors: &[(f32, f32, f32, f32, f32)]) -> ArrayD<f32> {
        let n = anchors.len();
        let mut a = ArrayD::zeros(IxDyn(&[1, FLAT_FEATURES, n]));
        for (i, &(cx, cy, w, h, c)) in anchors.iter().enumerate() {
            a[[0, 0, i]] = cx;
            a[[0, 1, i]] = cy;
            a[[0, 2, i]] = w;
            a[[0, 3, i]] = h;
            a[[0, 4, i]] = c;
            for k in 0..KEYPOINT_DIMS {
                a[[0, 5 + k, i]] = if k % 2 == 0 { cx } else { cy };
            }
        }
        a
    }

    fn engine(outputs: Vec<ArrayD<f32>>) -> DetectionEngine {
        DetectionEngine::new(Box::new(MockBackend::new(outputs)))
    }

    #[test]
    fn test_compute_padding_1080p() {
        let mut e = engine(vec![]);
        assert!(e.compute_padding(1920, 1080));
        let lb = e.letterbox().unwrap();
        assert!((lb.scale - 0.3333).abs() < 1e-3);
        assert_eq!((lb.scaled_width, lb.scaled_height), (640, 360));
        assert_eq!((lb.padding_width, lb.padding_height), (0, 280));
    }

    #[test]
    fn test_portrait_marks_invalid() {
        let mut e = engine(vec![flat(&[(320.0, 320.0, 50.0, 50.0, 0.9)])]);
        assert!(!e.compute_padding(360, 640));
        assert!(!e.is_valid());
        assert!(e.letterbox().is_none());
        let out = e.process(&vec![0u8; 360 * 640 * 3], 360, 640).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_threshold_validation() {
        let mut e = engine(vec![]);
        assert!(e.set_confidence(1.5).is_err());
        assert!(e.set_confidence(-0.1).is_err());
        assert!(e.set_confidence(0.7).is_ok());
        assert_eq!(e.get_confidence(), 0.7);
        assert!(e.set_iou(2.0).is_err());
        assert_eq!(e.iou(), DEFAULT_IOU);

        // 外部句柄修改对引擎可见
        *e.confidence_handle().lock() = 0.2;
        assert_eq!(e.get_confidence(), 0.2);
    }

    #[test]
    fn test_process_flat_nms_and_mapping() {
        let out = flat(&[
            (320.0, 320.0, 60.0, 60.0, 0.9),
            (322.0, 321.0, 60.0, 60.0, 0.8),
            (100.0, 200.0, 20.0, 20.0, 0.2),
        ]);
        let mut e = engine(vec![out]);
        let (w, h) = (1280u32, 720u32);
        let res = e.process(&vec![0u8; (w * h * 3) as usize], w, h).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res.faces[0].confidence, 0.9);
        assert_eq!(res.faces[0].identity_name, "Unknown");

        // 640/1280 = 0.5, 顶部填充 (640 - 360) / 2 = 140
        let disp = res.display_faces();
        assert!((disp[0].bbox.x1 - 580.0).abs() < 1e-3);
        assert!((disp[0].bbox.y1 - 300.0).abs() < 1e-3);
        assert!((disp[0].keypoints[0].x - 640.0).abs() < 1e-3);
    }

    #[test]
    fn test_confidence_monotonic() {
        let anchors: Vec<_> = (0..20)
            .map(|i| (30.0 * i as f32 + 20.0, 300.0, 20.0, 20.0, i as f32 / 20.0))
            .collect();
        let mut e = engine(vec![flat(&anchors)]);
        let frame = vec![0u8; 640 * 480 * 3];
        let mut last = usize::MAX;
        for t in [0.0, 0.25, 0.5, 0.75, 1.0] {
            e.set_confidence(t).unwrap();
            let n = e.process(&frame, 640, 480).unwrap().len();
            assert!(n <= last);
            last = n;
        }
    }

    #[test]
    fn test_preprocess_padding_and_channel_order() {
        let backend = MockBackend::new(vec![flat(&[])]);
        let seen = Arc::clone(&backend.last_input);
        let mut e = DetectionEngine::new(Box::new(backend));
        let (w, h) = (640u32, 320u32);
        let mut frame = vec![0u8; (w * h * 3) as usize];
        for px in frame.chunks_exact_mut(3) {
            px.copy_from_slice(&[255, 0, 51]);
        }
        e.process(&frame, w, h).unwrap();

        let input = seen.lock().take().unwrap();
        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        // 填充区
        assert!((input[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
        assert!((input[[0, 1, 639, 639]] - 114.0 / 255.0).abs() < 1e-6);
        // 内容区, BGR 顺序
        assert!((input[[0, 0, 320, 10]] - 0.2).abs() < 1e-6);
        assert!((input[[0, 1, 320, 10]]).abs() < 1e-6);
        assert!((input[[0, 2, 320, 10]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_grid_outputs() {
        let layers = face_layers(640);
        let mut ys = Vec::new();
        for (l, layer) in layers.iter().enumerate() {
            let mut conf = vec![-20.0f32; layer.cells()];
            if l == 2 {
                conf[0] = 20.0;
            }
            ys.push(ArrayD::from_shape_vec(IxDyn(&[1, layer.grid_height, layer.grid_width, 1]), conf).unwrap());
            ys.push(ArrayD::zeros(IxDyn(&[1, layer.grid_height, layer.grid_width, BBOX_DIMS])));
            ys.push(ArrayD::zeros(IxDyn(&[1, layer.grid_height, layer.grid_width, KEYPOINT_DIMS])));
        }
        let mut e = engine(ys);
        let res = e.process(&vec![0u8; 640 * 640 * 3], 640, 640).unwrap();
        assert_eq!(res.len(), 1);
        // stride 32: cx = 0.5 * 32, w = 32
        assert!((res.faces[0].bbox.x1 - 0.0).abs() < 1e-3);
        assert!((res.faces[0].bbox.x2 - 32.0).abs() < 1e-3);
    }

    #[test]
    fn test_unexpected_output_shape() {
        let mut e = engine(vec![ArrayD::zeros(IxDyn(&[1, 84, 10]))]);
        assert!(e.process(&vec![0u8; 640 * 480 * 3], 640, 480).is_err());
    }
}
