#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod channel; // 通道线程与关闭顺序
pub mod config; // VMS 配置
pub mod detection; // 人脸检测与身份匹配
pub mod display; // 显示层接口
pub mod error; // 错误分类
pub mod input; // 视频输入系统
pub mod monitor; // FPS / CPU 监控
pub mod ort_backend;
pub mod pool; // 帧缓冲池

pub use crate::channel::{Channel, ChannelExit, ChannelSettings, FpsCounter, Orchestrator};
pub use crate::config::{DeviceTimeoutPolicy, VmsConfig};
pub use crate::display::{DisplaySink, HeadlessDisplay, SquareLayout};
pub use crate::error::{PipelineError, Result};
pub use crate::input::{open_sources, InputSource, Resolution, SourceDescriptor};
pub use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};
