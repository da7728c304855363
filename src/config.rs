//! VMS 配置 - JSON 文件或 `key=value` 文本
//!
//! 两种格式字段一致; 文本格式中 `ip_cam` / `video` / `usb_cam` 可重复出现, 按出现顺序组成输入源列表.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::input::{FileMode, SourceDescriptor, SourceOptions};

/// 本地设备超时后的处理方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTimeoutPolicy {
    /// 整个进程退出
    #[default]
    ExitProcess,
    /// 只停止出问题的通道
    IsolateChannel,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VmsConfig {
    // === 通道与输入 ===
    pub num_chs: i64,                  // 窗口数量
    pub video_predecoded_frames: usize, // 视频文件预解码帧数
    pub sources: Vec<SourceDescriptor>,
    pub file_replay_fps: u32,
    pub file_mode: FileMode,

    // === 模型 ===
    pub model_path: String,
    pub model_name: String,
    pub group: Vec<i64>,
    pub logo: String,
    pub font_path: String,
    pub inf_confidence: f32, // 默认置信度阈值
    pub inf_iou: f32,        // NMS IOU阈值

    // === 显示 ===
    pub screen_idx: i64,
    pub screen_width: u32,
    pub screen_height: u32,

    pub device_timeout_policy: DeviceTimeoutPolicy,
}

impl Default for VmsConfig {
    fn default() -> Self {
        Self {
            num_chs: 16,
            video_predecoded_frames: 300,
            sources: Vec::new(),
            file_replay_fps: 60,
            file_mode: FileMode::Preload,

            model_path: "models/yolov8n-face_post.onnx".to_string(),
            model_name: String::new(),
            group: Vec::new(),
            logo: String::new(),
            font_path: String::new(),
            inf_confidence: 0.3,
            inf_iou: 0.45,

            screen_idx: 0,
            screen_width: 1920,
            screen_height: 1080,

            device_timeout_policy: DeviceTimeoutPolicy::ExitProcess,
        }
    }
}

impl VmsConfig {
    /// 加载并校验; 文件缺失或字段非法都是致命错误
    pub fn load(path: &str) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read config {}: {}", path, e)))?;
        let is_json = Path::new(path)
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            serde_json::from_str(&text)
                .map_err(|e| PipelineError::Config(format!("{}: {}", path, e)))?
        } else {
            Self::parse_kv(&text)?
        };
        config.validate()?;
        log::info!("✅ 配置已从 {} 加载", path);
        Ok(config)
    }

    /// 解析 `key=value` 文本, 未知键忽略
    pub fn parse_kv(text: &str) -> Result<Self> {
        let mut config = Self::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if value.is_empty() {
                continue;
            }
            let bad = |what: &str| {
                PipelineError::Config(format!("line {}: invalid {} '{}'", lineno + 1, what, value))
            };

            match key {
                "num_chs" => config.num_chs = value.parse().map_err(|_| bad(key))?,
                "video_predecoded_frames" => {
                    config.video_predecoded_frames = value.parse().map_err(|_| bad(key))?
                }
                "ip_cam" => config.sources.push(SourceDescriptor::IpCam(value.to_string())),
                "video" => config.sources.push(SourceDescriptor::Video(value.to_string())),
                "usb_cam" => config
                    .sources
                    .push(SourceDescriptor::UsbCam(value.parse().map_err(|_| bad(key))?)),
                "dfp" | "model_path" => config.model_path = value.to_string(),
                "model_name" => config.model_name = value.to_string(),
                "group" => config.group.push(value.parse().map_err(|_| bad(key))?),
                "logo" => config.logo = value.to_string(),
                "font_path" => config.font_path = value.to_string(),
                "inf_confidence" => config.inf_confidence = value.parse().map_err(|_| bad(key))?,
                "inf_iou" => config.inf_iou = value.parse().map_err(|_| bad(key))?,
                "screen_idx" => config.screen_idx = value.parse().map_err(|_| bad(key))?,
                "screen_width" => config.screen_width = value.parse().map_err(|_| bad(key))?,
                "screen_height" => config.screen_height = value.parse().map_err(|_| bad(key))?,
                "file_replay_fps" => config.file_replay_fps = value.parse().map_err(|_| bad(key))?,
                "file_mode" => {
                    config.file_mode = match value {
                        "preload" => FileMode::Preload,
                        "live" => FileMode::Live,
                        _ => return Err(bad(key)),
                    }
                }
                "device_timeout_policy" => {
                    config.device_timeout_policy = match value {
                        "exit_process" => DeviceTimeoutPolicy::ExitProcess,
                        "isolate_channel" => DeviceTimeoutPolicy::IsolateChannel,
                        _ => return Err(bad(key)),
                    }
                }
                _ => log::debug!("忽略未知配置项 {}", key),
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_chs <= 0 {
            return Err(PipelineError::Config(format!(
                "invalid num of CHs: {}",
                self.num_chs
            )));
        }
        if self.screen_idx < 0 {
            return Err(PipelineError::Config(format!(
                "invalid screen id: {}",
                self.screen_idx
            )));
        }
        for (name, v) in [("inf_confidence", self.inf_confidence), ("inf_iou", self.inf_iou)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(PipelineError::Config(format!(
                    "{} {} outside [0, 1]",
                    name, v
                )));
            }
        }
        if self.file_replay_fps == 0 {
            return Err(PipelineError::Config("file_replay_fps must be > 0".into()));
        }
        if self.screen_width == 0 || self.screen_height == 0 {
            return Err(PipelineError::Config("screen size must be non-zero".into()));
        }
        Ok(())
    }

    /// 校验后的通道数
    pub fn channels(&self) -> usize {
        self.num_chs.max(0) as usize
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            predecoded_frames: self.video_predecoded_frames,
            replay_fps: self.file_replay_fps,
            file_mode: self.file_mode,
        }
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("serialize config: {}", e)))?;
        fs::write(path, json)?;
        log::info!("💾 配置已保存到 {}", path);
        Ok(())
    }

    pub fn print_summary(&self) {
        log::info!("🎛️  当前 VMS 配置:");
        log::info!("  通道数: {}  输入源: {}", self.num_chs, self.sources.len());
        for (i, src) in self.sources.iter().enumerate() {
            log::info!("    [{}] {:?}", i, src);
        }
        log::info!(
            "  模型: {} {}",
            self.model_path,
            if self.model_name.is_empty() { "" } else { self.model_name.as_str() }
        );
        log::info!(
            "  置信度: {:.2}  IOU: {:.2}",
            self.inf_confidence,
            self.inf_iou
        );
        log::info!(
            "  屏幕 #{} {}x{}",
            self.screen_idx,
            self.screen_width,
            self.screen_height
        );
        log::info!(
            "  视频文件: {:?}, 预解码 {} 帧 @ {} FPS",
            self.file_mode,
            self.video_predecoded_frames,
            self.file_replay_fps
        );
        log::info!("  设备超时策略: {:?}", self.device_timeout_policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("vms_cfg_{}_{}", std::process::id(), name))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_parse_kv() {
        let text = "num_chs=4\nip_cam=rtsp://admin:pw@10.0.0.9/ch1\nvideo=assets/a.mp4\nusb_cam=0\n\
                    inf_confidence=0.5\nscreen_idx=1\ngroup=3\nunknown_key=1\nlogo=\n";
        let cfg = VmsConfig::parse_kv(text).unwrap();
        assert_eq!(cfg.num_chs, 4);
        assert_eq!(cfg.sources.len(), 3);
        assert_eq!(cfg.sources[2], SourceDescriptor::UsbCam(0));
        assert_eq!(cfg.inf_confidence, 0.5);
        assert_eq!(cfg.inf_iou, 0.45);
        assert_eq!(cfg.screen_idx, 1);
        assert_eq!(cfg.group, vec![3]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_kv_crlf() {
        let cfg = VmsConfig::parse_kv("num_chs=2\r\nvideo=b.mp4\r\n").unwrap();
        assert_eq!(cfg.num_chs, 2);
        assert_eq!(cfg.sources, vec![SourceDescriptor::Video("b.mp4".into())]);
    }

    #[test]
    fn test_validation_is_fatal() {
        let cfg = VmsConfig::parse_kv("num_chs=0").unwrap();
        assert!(cfg.validate().is_err());
        let cfg = VmsConfig::parse_kv("num_chs=-3").unwrap();
        assert!(cfg.validate().is_err());
        let cfg = VmsConfig::parse_kv("screen_idx=-1").unwrap();
        assert!(cfg.validate().is_err());
        let cfg = VmsConfig::parse_kv("inf_iou=1.5").unwrap();
        assert!(cfg.validate().is_err());
        assert!(VmsConfig::parse_kv("num_chs=abc").is_err());
        assert!(VmsConfig::parse_kv("file_mode=stream").is_err());
    }

    #[test]
    fn test_missing_file_is_fatal() {
        assert!(matches!(
            VmsConfig::load("/nonexistent/vms.json"),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_json_save_load() {
        let path = temp_path("cfg.json");
        let mut cfg = VmsConfig::default();
        cfg.num_chs = 2;
        cfg.sources = vec![
            SourceDescriptor::IpCam("rtsp://cam/1".into()),
            SourceDescriptor::UsbCam(1),
        ];
        cfg.device_timeout_policy = DeviceTimeoutPolicy::IsolateChannel;
        cfg.save(&path).unwrap();

        let loaded = VmsConfig::load(&path).unwrap();
        assert_eq!(loaded.num_chs, 2);
        assert_eq!(loaded.sources, cfg.sources);
        assert_eq!(loaded.device_timeout_policy, DeviceTimeoutPolicy::IsolateChannel);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_json_defaults_for_missing_keys() {
        let cfg: VmsConfig = serde_json::from_str(r#"{"num_chs": 9}"#).unwrap();
        assert_eq!(cfg.num_chs, 9);
        assert_eq!(cfg.video_predecoded_frames, 300);
        assert_eq!(cfg.model_path, "models/yolov8n-face_post.onnx");
        assert_eq!(cfg.file_mode, FileMode::Preload);
    }
}
