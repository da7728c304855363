// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 管线错误分类 (Pipeline error taxonomy)
//!
//! 可恢复错误在发现它的组件边界处理, 不跨线程传播;
//! 只有 FatalInit / Config 会传播到启动流程.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// 打开时设备/流不可达或配置错误 → 该通道启动失败
    #[error("fatal init: {0}")]
    FatalInit(String),

    /// 单个包的读取/解码错误 → 跳过该单元继续
    #[error("transient io: {0}")]
    TransientIo(String),

    /// 流结束或传输断开 → 进入重连循环
    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    /// 没有空闲缓冲区 → 丢弃当前帧
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// 本地设备在超时时间内没有数据
    #[error("device timeout after {0} s")]
    DeviceTimeout(u64),

    /// 损坏帧或空平面 → 丢弃并继续
    #[error("invalid data: {0}")]
    DataInvalid(String),

    /// 会话已关闭
    #[error("session closed")]
    Closed,

    #[error("config: {0}")]
    Config(String),

    #[error("inference: {0}")]
    Inference(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// 是否应在组件内部吞掉并继续运行
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientIo(_)
                | PipelineError::ConnectionLoss(_)
                | PipelineError::ResourceExhausted(_)
                | PipelineError::DataInvalid(_)
        )
    }
}

impl From<ort::Error> for PipelineError {
    fn from(e: ort::Error) -> Self {
        PipelineError::Inference(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(PipelineError::TransientIo("eagain".into()).is_recoverable());
        assert!(PipelineError::ResourceExhausted("pool".into()).is_recoverable());
        assert!(PipelineError::DataInvalid("corrupt".into()).is_recoverable());
        assert!(!PipelineError::FatalInit("unreachable".into()).is_recoverable());
        assert!(!PipelineError::DeviceTimeout(5).is_recoverable());
        assert!(!PipelineError::Closed.is_recoverable());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            PipelineError::DeviceTimeout(5).to_string(),
            "device timeout after 5 s"
        );
        assert_eq!(PipelineError::Closed.to_string(), "session closed");
    }
}
