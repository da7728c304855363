use super::types::FaceBox;
use std::cmp::Ordering;

/// 非极大值抑制 (原地)
///
/// 按置信度降序排序, 依次保留与已保留框 IoU 均不超过阈值的框.
pub fn non_max_suppression(xs: &mut Vec<FaceBox>, iou_threshold: f32) {
    xs.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut current_index = 0;
    for index in 0..xs.len() {
        let drop = (0..current_index).any(|prev| xs[prev].bbox.iou(&xs[index].bbox) > iou_threshold);
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{BBox, Keypoint, NUM_KEYPOINTS};

    fn face(conf: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> FaceBox {
        FaceBox::new(
            conf,
            BBox::new(x1, y1, x2, y2),
            [Keypoint::default(); NUM_KEYPOINTS],
        )
    }

    #[test]
    fn test_nms_keeps_highest() {
        let mut xs = vec![
            face(0.8, 1.0, 1.0, 10.0, 10.0),
            face(0.9, 0.0, 0.0, 10.0, 10.0),
        ];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 1);
        assert_eq!(xs[0].confidence, 0.9);
        assert_eq!(xs[0].bbox, BBox::new(0.0, 0.0, 10.0, 10.0));
    }

    #[test]
    fn test_nms_keeps_disjoint() {
        let mut xs = vec![
            face(0.5, 0.0, 0.0, 10.0, 10.0),
            face(0.7, 50.0, 50.0, 60.0, 60.0),
            face(0.6, 100.0, 0.0, 120.0, 20.0),
        ];
        non_max_suppression(&mut xs, 0.45);
        let confs: Vec<f32> = xs.iter().map(|f| f.confidence).collect();
        assert_eq!(confs, vec![0.7, 0.6, 0.5]);
    }

    #[test]
    fn test_nms_output_pairwise_below_threshold() {
        let mut xs = Vec::new();
        for i in 0..30 {
            let o = (i % 7) as f32 * 3.0;
            xs.push(face(0.3 + i as f32 * 0.02, o, o, o + 20.0, o + 20.0));
        }
        non_max_suppression(&mut xs, 0.45);
        for i in 0..xs.len() {
            for j in (i + 1)..xs.len() {
                assert!(xs[i].bbox.iou(&xs[j].bbox) <= 0.45);
            }
        }
    }

    #[test]
    fn test_nms_empty() {
        let mut xs: Vec<FaceBox> = Vec::new();
        non_max_suppression(&mut xs, 0.45);
        assert!(xs.is_empty());
    }
}
