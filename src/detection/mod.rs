/// 检测系统 (Detection System)
///
/// 每个通道一个引擎实例, 在通道线程内同步调用
/// - DetectionEngine: letterbox + 推理 + 解码 + NMS
/// - IdentityStore:   身份库与余弦匹配
/// - Painter:         结果绘制
pub mod draw;
pub mod engine;
pub mod identity;
pub mod layer;
pub mod nms;
pub mod types;

pub use draw::Painter;
pub use engine::{DetectionEngine, DetectionOutput, InferenceBackend};
pub use identity::{cosine_similarity, IdentityStore};
pub use layer::{face_layers, DetectionLayer};
pub use nms::non_max_suppression;
pub use types::{BBox, FaceBox, Keypoint, Letterbox};
