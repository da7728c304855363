/// 视频输入系统 (Video Input System)
///
/// 每个显示窗口对应一个输入源, 三类来源统一成一个枚举:
/// - NetworkStream: 网络摄像机拉流解码 (断线自动重连)
/// - LocalDevice:   本地 V4L2 采集设备 (内核映射缓冲环)
/// - FilePreload / FileReplay: 视频文件 (预解码循环回放 / 逐帧解码)
pub mod convert;
pub mod decode_filter;
pub mod device;
pub mod file;
pub mod stream;
pub mod v4l2;

pub use convert::FrameConverter;
pub use device::{enumerate, DeviceCaptureSession, DeviceInfo, PixelEncoding};
pub use file::{FilePreloadSession, FileReplaySession};
pub use stream::{source_ip_addr, StreamDecodeSession, StreamState};

use crate::error::{PipelineError, Result};
use crate::pool::RGB_CHANNELS;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 分辨率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// 中断谓词: 全局关闭信号 或 本会话关闭
#[derive(Debug, Clone)]
pub struct Interrupt {
    global: Arc<AtomicBool>,
    local: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new(global: Arc<AtomicBool>) -> Self {
        Self {
            global,
            local: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_set(&self) -> bool {
        self.global.load(Ordering::Relaxed) || self.local.load(Ordering::Relaxed)
    }

    /// 只关闭本会话, 不影响全局信号
    pub fn trigger(&self) {
        self.local.store(true, Ordering::Relaxed);
    }
}

/// 配置中的输入源描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// 网络流地址
    IpCam(String),
    /// 视频文件路径
    Video(String),
    /// 本地设备号 (/dev/videoN)
    UsbCam(usize),
}

/// 视频文件的读取方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    #[default]
    Preload,
    Live,
}

/// 打开输入源需要的全局参数
#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    pub predecoded_frames: usize,
    pub replay_fps: u32,
    pub file_mode: FileMode,
}

/// 统一的输入源
pub enum InputSource {
    NetworkStream(StreamDecodeSession),
    LocalDevice {
        session: DeviceCaptureSession,
        converter: FrameConverter,
    },
    FilePreload(FilePreloadSession),
    FileReplay(FileReplaySession),
}

impl InputSource {
    /// 按描述打开输入源, 输出缩放到 `width x height`
    pub fn open(
        desc: &SourceDescriptor,
        width: u32,
        height: u32,
        options: &SourceOptions,
        interrupt: Interrupt,
    ) -> Result<Self> {
        match desc {
            SourceDescriptor::IpCam(url) => Ok(InputSource::NetworkStream(
                StreamDecodeSession::open(url, width, height, interrupt)?,
            )),
            SourceDescriptor::UsbCam(index) => Ok(InputSource::LocalDevice {
                session: DeviceCaptureSession::open(*index)?,
                converter: FrameConverter::new(width, height),
            }),
            SourceDescriptor::Video(path) => match options.file_mode {
                FileMode::Preload => Ok(InputSource::FilePreload(FilePreloadSession::open(
                    path,
                    width,
                    height,
                    options.predecoded_frames,
                    options.replay_fps,
                    interrupt,
                )?)),
                FileMode::Live => Ok(InputSource::FileReplay(FileReplaySession::open(
                    path, width, height, interrupt,
                )?)),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InputSource::NetworkStream(_) => "network-stream",
            InputSource::LocalDevice { .. } => "local-device",
            InputSource::FilePreload(_) => "file-preload",
            InputSource::FileReplay(_) => "file-replay",
        }
    }

    /// 取一帧复制到 `dst` (显示尺寸 RGB24), 底层缓冲在返回前归还
    pub fn get_frame(&mut self, dst: &mut [u8]) -> Result<()> {
        match self {
            InputSource::NetworkStream(session) => {
                let buf = session.get_frame()?;
                let copied = copy_frame(buf.data(), dst);
                session.return_frame(buf)?;
                copied
            }
            InputSource::FileReplay(session) => {
                let buf = session.get_frame()?;
                let copied = copy_frame(buf.data(), dst);
                session.return_frame(buf)?;
                copied
            }
            InputSource::LocalDevice { session, converter } => {
                let (_, h) = converter.target_size();
                let rows = session.read_rgb(converter, dst)?;
                if rows != h {
                    return Err(PipelineError::DataInvalid(format!(
                        "short conversion {}/{}",
                        rows, h
                    )));
                }
                Ok(())
            }
            InputSource::FilePreload(session) => session.get_frame(dst),
        }
    }

    /// 输入源原始分辨率 (网络流在收到第一帧之前未知)
    pub fn get_resolution(&self) -> Option<Resolution> {
        match self {
            InputSource::NetworkStream(session) => session.get_resolution(),
            InputSource::FileReplay(session) => session.get_resolution(),
            InputSource::LocalDevice { session, .. } => Some(session.get_resolution()),
            InputSource::FilePreload(session) => Some(session.get_resolution()),
        }
    }

    /// 释放设备/会话
    pub fn close(&mut self) {
        match self {
            InputSource::NetworkStream(session) => session.close(),
            InputSource::FileReplay(session) => session.close(),
            InputSource::LocalDevice { session, .. } => session.close(),
            InputSource::FilePreload(_) => {}
        }
    }
}

fn copy_frame(src: &[u8], dst: &mut [u8]) -> Result<()> {
    if dst.len() < src.len() {
        return Err(PipelineError::DataInvalid(format!(
            "display buffer {} < frame {}",
            dst.len(),
            src.len()
        )));
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(())
}

/// 为每个窗口并行打开输入源; 打开失败的窗口得到 None
///
/// `viewers[i]` 是第 i 个窗口的显示尺寸, 超出描述列表的窗口保持空闲.
pub fn open_sources(
    descs: &[SourceDescriptor],
    viewers: &[Resolution],
    options: &SourceOptions,
    shutdown: &Arc<AtomicBool>,
) -> Vec<Option<InputSource>> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = viewers
            .iter()
            .zip(descs.iter())
            .enumerate()
            .map(|(idx, (view, desc))| {
                let interrupt = Interrupt::new(Arc::clone(shutdown));
                scope.spawn(move || {
                    match InputSource::open(desc, view.width, view.height, options, interrupt) {
                        Ok(source) => {
                            log::info!("✅ 通道{} 输入源就绪: {}", idx, source.kind());
                            Some(source)
                        }
                        Err(e) => {
                            log::error!("❌ 通道{} 输入源打开失败 {:?}: {}", idx, desc, e);
                            None
                        }
                    }
                })
            })
            .collect();

        let mut sources: Vec<Option<InputSource>> = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(None))
            .collect();
        sources.resize_with(viewers.len(), || None);
        sources
    })
}

/// 显示尺寸 RGB 缓冲长度
pub fn frame_len(res: Resolution) -> usize {
    res.width as usize * res.height as usize * RGB_CHANNELS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_local_and_global() {
        let global = Arc::new(AtomicBool::new(false));
        let a = Interrupt::new(Arc::clone(&global));
        let b = Interrupt::new(Arc::clone(&global));
        a.trigger();
        assert!(a.is_set());
        assert!(!b.is_set());
        global.store(true, Ordering::Relaxed);
        assert!(b.is_set());
    }

    #[test]
    fn test_source_descriptor_json() {
        let descs: Vec<SourceDescriptor> = serde_json::from_str(
            r#"[{"ip_cam": "rtsp://admin:pw@10.0.0.1/live"}, {"video": "a.mp4"}, {"usb_cam": 0}]"#,
        )
        .unwrap();
        assert_eq!(
            descs,
            vec![
                SourceDescriptor::IpCam("rtsp://admin:pw@10.0.0.1/live".into()),
                SourceDescriptor::Video("a.mp4".into()),
                SourceDescriptor::UsbCam(0),
            ]
        );
    }

    #[test]
    fn test_open_sources_failures_stay_idle() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let descs = vec![
            SourceDescriptor::UsbCam(4090),
            SourceDescriptor::Video("/nonexistent/clip.mp4".into()),
        ];
        let viewers = vec![Resolution::new(64, 36); 3];
        let options = SourceOptions {
            predecoded_frames: 10,
            replay_fps: 60,
            file_mode: FileMode::Live,
        };
        let sources = open_sources(&descs, &viewers, &options, &shutdown);
        assert_eq!(sources.len(), 3);
        assert!(sources.iter().all(|s| s.is_none()));
    }

    #[test]
    fn test_copy_frame_bounds() {
        let mut dst = vec![0u8; 4];
        assert!(copy_frame(&[1, 2, 3], &mut dst).is_ok());
        assert_eq!(&dst[..3], &[1, 2, 3]);
        assert!(copy_frame(&[0; 8], &mut dst).is_err());
    }
}
