/// 输出张量解码 (flat 输出 / 多尺度网格输出)
use super::types::{BBox, FaceBox, Keypoint, NUM_KEYPOINTS};

/// 每个格点的框回归维度
pub const BBOX_DIMS: usize = 4;
/// 每个格点的关键点维度 (5 点 x 2 坐标)
pub const KEYPOINT_DIMS: usize = NUM_KEYPOINTS * 2;
/// flat 输出每个 anchor 的特征数: box(4) + conf(1) + keypoints(10)
pub const FLAT_FEATURES: usize = BBOX_DIMS + 1 + KEYPOINT_DIMS;
/// 网格输出张量数量: 3 个尺度 x (bbox, conf, keypoints)
pub const GRID_OUTPUTS: usize = 9;

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 单个尺度的网格参数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectionLayer {
    pub grid_width: usize,
    pub grid_height: usize,
    /// 输入分辨率 / 网格分辨率
    pub stride: usize,
}

impl DetectionLayer {
    pub const fn new(grid_width: usize, grid_height: usize, stride: usize) -> Self {
        Self {
            grid_width,
            grid_height,
            stride,
        }
    }

    pub fn cells(&self) -> usize {
        self.grid_width * self.grid_height
    }

    pub fn bbox_len(&self) -> usize {
        self.cells() * BBOX_DIMS
    }

    pub fn keypoint_len(&self) -> usize {
        self.cells() * KEYPOINT_DIMS
    }
}

/// 步长 {8, 16, 32} 的三层网格
pub fn face_layers(model_size: usize) -> [DetectionLayer; 3] {
    [8, 16, 32].map(|s| DetectionLayer::new(model_size / s, model_size / s, s))
}

/// 解码 flat 布局 `[1, 15, N]`, 特征主序 (第 f 个特征第 i 个 anchor 位于 f*N + i)
pub fn decode_flat(data: &[f32], num_anchors: usize, confidence: f32) -> Vec<FaceBox> {
    if data.len() < FLAT_FEATURES * num_anchors {
        log::warn!(
            "⚠️ 输出张量长度不足: {} < {}",
            data.len(),
            FLAT_FEATURES * num_anchors
        );
        return Vec::new();
    }
    let at = |f: usize, i: usize| data[f * num_anchors + i];

    let mut faces = Vec::new();
    for i in 0..num_anchors {
        let conf = at(4, i);
        if conf < confidence {
            continue;
        }
        let bbox = BBox::from_center(at(0, i), at(1, i), at(2, i), at(3, i));
        let mut kps = [Keypoint::default(); NUM_KEYPOINTS];
        for (k, kp) in kps.iter_mut().enumerate() {
            *kp = Keypoint::new(at(5 + k * 2, i), at(6 + k * 2, i), 1.0);
        }
        faces.push(FaceBox::new(conf, bbox, kps));
    }
    faces
}

/// 单个尺度的三个原始特征图
pub struct GridMaps<'a> {
    pub bbox: &'a [f32],
    pub confidence: &'a [f32],
    pub keypoints: &'a [f32],
}

/// 解码一个尺度的网格输出
pub fn decode_grid(layer: &DetectionLayer, maps: &GridMaps, confidence: f32) -> Vec<FaceBox> {
    if maps.confidence.len() < layer.cells()
        || maps.bbox.len() < layer.bbox_len()
        || maps.keypoints.len() < layer.keypoint_len()
    {
        log::warn!(
            "⚠️ 网格特征图尺寸与 {}x{} 不符",
            layer.grid_width,
            layer.grid_height
        );
        return Vec::new();
    }
    let stride = layer.stride as f32;

    let mut faces = Vec::new();
    for row in 0..layer.grid_height {
        for col in 0..layer.grid_width {
            let gi = row * layer.grid_width + col;
            let conf = sigmoid(maps.confidence[gi]);
            if conf < confidence {
                continue;
            }

            let b = &maps.bbox[gi * BBOX_DIMS..(gi + 1) * BBOX_DIMS];
            let cx = (col as f32 + sigmoid(b[0])) * stride;
            let cy = (row as f32 + sigmoid(b[1])) * stride;
            let w = b[2].exp() * stride;
            let h = b[3].exp() * stride;

            let k = &maps.keypoints[gi * KEYPOINT_DIMS..(gi + 1) * KEYPOINT_DIMS];
            let mut kps = [Keypoint::default(); NUM_KEYPOINTS];
            for (n, kp) in kps.iter_mut().enumerate() {
                *kp = Keypoint::new(
                    (col as f32 + sigmoid(k[n * 2])) * stride,
                    (row as f32 + sigmoid(k[n * 2 + 1])) * stride,
                    1.0,
                );
            }
            faces.push(FaceBox::new(conf, BBox::from_center(cx, cy, w, h), kps));
        }
    }
    faces
}
