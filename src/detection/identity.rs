/// 人脸身份库
///
/// 身份 id 单调分配, 从不复用. 库本身不加锁, 由调用方包进 RwLock 共享.
use super::types::{FaceBox, UNKNOWN_ID, UNKNOWN_NAME};
use crate::error::{PipelineError, Result};

/// 默认识别阈值 (余弦相似度)
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone)]
pub struct Identity {
    pub id: i32,
    pub name: String,
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug)]
pub struct IdentityStore {
    identities: Vec<Identity>,
    next_id: i32,
    threshold: f32,
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl IdentityStore {
    pub fn new(threshold: f32) -> Self {
        Self {
            identities: Vec::new(),
            next_id: 0,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    /// 新建身份, 返回分配的 id
    pub fn add_identity(&mut self, name: &str) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        self.identities.push(Identity {
            id,
            name: name.to_string(),
            embeddings: Vec::new(),
        });
        log::info!("👤 新增身份 #{} {}", id, name);
        id
    }

    pub fn add_embedding(&mut self, id: i32, embedding: Vec<f32>) -> Result<()> {
        let identity = self
            .identities
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| PipelineError::DataInvalid(format!("unknown identity id {}", id)))?;
        identity.embeddings.push(embedding);
        Ok(())
    }

    /// 与所有已存特征比较, 返回超过阈值的最佳匹配 (id, 相似度)
    pub fn recognize(&self, embedding: &[f32]) -> Option<(i32, f32)> {
        let mut best: Option<(i32, f32)> = None;
        for identity in &self.identities {
            for stored in &identity.embeddings {
                let sim = cosine_similarity(embedding, stored);
                if sim > self.threshold && best.map_or(true, |(_, b)| sim > b) {
                    best = Some((identity.id, sim));
                }
            }
        }
        best
    }

    pub fn identity_name(&self, id: i32) -> &str {
        self.identities
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.name.as_str())
            .unwrap_or(UNKNOWN_NAME)
    }

    /// 根据人脸自带的特征向量填写身份; 无特征或无匹配时保持 Unknown
    pub fn assign(&self, face: &mut FaceBox) {
        let matched = face.embedding.as_deref().and_then(|e| self.recognize(e));
        match matched {
            Some((id, _)) => {
                face.identity_id = id;
                face.identity_name = self.identity_name(id).to_string();
            }
            None => {
                face.identity_id = UNKNOWN_ID;
                face.identity_name = UNKNOWN_NAME.to_string();
            }
        }
    }
}

/// 余弦相似度; 长度不一致或零向量时为 -1
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return -1.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return -1.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{BBox, Keypoint, NUM_KEYPOINTS};

    #[test]
    fn test_ids_monotonic() {
        let mut store = IdentityStore::default();
        assert_eq!(store.add_identity("alice"), 0);
        assert_eq!(store.add_identity("bob"), 1);
        assert_eq!(store.add_identity("alice"), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_recognize_best_match() {
        let mut store = IdentityStore::default();
        let a = store.add_identity("alice");
        let b = store.add_identity("bob");
        store.add_embedding(a, vec![1.0, 0.0, 0.0]).unwrap();
        store.add_embedding(b, vec![0.0, 1.0, 0.0]).unwrap();
        store.add_embedding(b, vec![0.1, 0.9, 0.0]).unwrap();

        let (id, sim) = store.recognize(&[0.05, 1.0, 0.0]).unwrap();
        assert_eq!(id, b);
        assert!(sim > 0.99);
        assert_eq!(store.identity_name(id), "bob");
    }

    #[test]
    fn test_recognize_below_threshold() {
        let mut store = IdentityStore::default();
        let a = store.add_identity("alice");
        store.add_embedding(a, vec![1.0, 0.0]).unwrap();
        // cos = 0.707
        assert_eq!(store.recognize(&[1.0, 1.0]).map(|(id, _)| id), Some(a));
        store.set_threshold(0.8);
        assert!(store.recognize(&[1.0, 1.0]).is_none());
        assert!(store.recognize(&[0.0, 1.0]).is_none());
    }

    #[test]
    fn test_add_embedding_unknown_id() {
        let mut store = IdentityStore::default();
        assert!(store.add_embedding(7, vec![1.0]).is_err());
        assert_eq!(store.identity_name(7), "Unknown");
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), -1.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), -1.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_assign_without_embedding_stays_unknown() {
        let mut store = IdentityStore::default();
        let a = store.add_identity("alice");
        store.add_embedding(a, vec![1.0, 0.0]).unwrap();

        let mut face = FaceBox::new(0.9, BBox::default(), [Keypoint::default(); NUM_KEYPOINTS]);
        store.assign(&mut face);
        assert_eq!(face.identity_id, -1);

        face.embedding = Some(vec![0.9, 0.1]);
        store.assign(&mut face);
        assert_eq!(face.identity_id, a);
        assert_eq!(face.identity_name, "alice");
    }
}
