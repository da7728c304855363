// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! ONNX Runtime 推理后端
use ndarray::{Array4, ArrayD};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

use crate::detection::InferenceBackend;
use crate::error::{PipelineError, Result};

/// 执行设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrtEP {
    #[default]
    Cpu,
    Cuda(i32),
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub model_path: String,
    pub ep: OrtEP,
    pub intra_threads: usize,
}

impl OrtConfig {
    pub fn new(model_path: &str) -> Self {
        Self {
            model_path: model_path.to_string(),
            ep: OrtEP::Cpu,
            intra_threads: 4,
        }
    }
}

pub struct OrtBackend {
    session: Session,
    ep: OrtEP,
}

impl OrtBackend {
    pub fn build(config: &OrtConfig) -> Result<Self> {
        if !std::path::Path::new(&config.model_path).is_file() {
            return Err(PipelineError::FatalInit(format!(
                "model not found: {}",
                config.model_path
            )));
        }

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?;
        if let OrtEP::Cuda(device_id) = config.ep {
            builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()])?;
        }
        let session = builder.commit_from_file(&config.model_path)?;

        log::info!(
            "✅ 模型加载完成: {} ({:?}, {} 输入, {} 输出)",
            config.model_path,
            config.ep,
            session.inputs.len(),
            session.outputs.len()
        );
        Ok(Self {
            session,
            ep: config.ep,
        })
    }

    pub fn ep(&self) -> OrtEP {
        self.ep
    }
}

impl InferenceBackend for OrtBackend {
    fn run(&mut self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let tensor = Tensor::from_array(input)?;
        let outputs = self.session.run(ort::inputs![tensor])?;
        let mut ys = Vec::with_capacity(outputs.len());
        for i in 0..outputs.len() {
            ys.push(outputs[i].try_extract_array::<f32>()?.into_owned());
        }
        Ok(ys)
    }
}
