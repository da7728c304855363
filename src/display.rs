// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 显示层接口与无界面实现
//!
//! 通道线程只通过 [`DisplaySink`] 与显示层交互: 取显示缓冲, 填充后连同 FPS 发布.
//! [`HeadlessDisplay`] 用于无屏幕部署与测试, 保存每个窗口最新一帧.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{PipelineError, Result};
use crate::input::Resolution;
use crate::pool::{FrameBuffer, FrameBufferPool};

/// 每个窗口的显示缓冲数量 (轮转使用)
pub const DISPLAY_BUFFER_COUNT: usize = 60;
/// 窗口未单独设置置信度时返回的哨兵值
pub const USE_GLOBAL_CONFIDENCE: f32 = -1.0;
/// 窗口宽度对齐 (缩放器要求 32 的倍数)
const WIDTH_ALIGN_MASK: u32 = !0x1f;

/// 通道线程看到的显示层
pub trait DisplaySink: Send + Sync {
    fn viewer_count(&self) -> usize;
    fn viewer_width(&self, id: usize) -> u32;
    fn viewer_height(&self, id: usize) -> u32;
    /// 取一个可写显示缓冲
    fn acquire_display_buffer(&self, id: usize) -> Result<FrameBuffer>;
    /// 发布填充好的缓冲; `fps == 0` 表示本帧没有新的 FPS 值
    fn publish(&self, id: usize, buf: FrameBuffer, fps: f32) -> Result<()>;
    /// 放弃未填充的缓冲 (取帧失败时), 窗口继续显示上一帧
    fn release_display_buffer(&self, id: usize, buf: FrameBuffer) -> Result<()>;
    /// 窗口自己的置信度, 或 [`USE_GLOBAL_CONFIDENCE`]
    fn effective_confidence(&self, id: usize) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerGeometry {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// NxN 方阵布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquareLayout {
    pub mode: u32,
    pub viewers: Vec<ViewerGeometry>,
}

impl SquareLayout {
    pub fn new(num_channels: usize, screen_width: u32, screen_height: u32) -> Result<Self> {
        if num_channels == 0 {
            return Err(PipelineError::Config("layout needs at least one channel".into()));
        }
        let mode = (num_channels as f64).sqrt().ceil() as u32;
        let width = (screen_width / mode) & WIDTH_ALIGN_MASK;
        let height = width * 9 / 16;
        if width == 0 || height == 0 {
            return Err(PipelineError::Config(format!(
                "screen {}x{} too small for {} channels",
                screen_width, screen_height, num_channels
            )));
        }

        let viewers = (0..num_channels as u32)
            .map(|i| ViewerGeometry {
                x: (i % mode) * width,
                y: (i / mode) * height,
                width,
                height,
            })
            .collect();
        log::info!(
            "🖥️ 屏幕 {}x{}, {}x{} 布局, 窗口 {}x{}",
            screen_width,
            screen_height,
            mode,
            mode,
            width,
            height
        );
        Ok(Self { mode, viewers })
    }

    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }

    pub fn resolutions(&self) -> Vec<Resolution> {
        self.viewers
            .iter()
            .map(|g| Resolution::new(g.width, g.height))
            .collect()
    }
}

struct Viewer {
    geometry: ViewerGeometry,
    pool: FrameBufferPool,
    latest: Mutex<Option<FrameBuffer>>,
    fps: Mutex<f32>,
    confidence: Mutex<f32>,
    published: AtomicU64,
}

/// 无界面显示: 只保留每个窗口最新一帧
pub struct HeadlessDisplay {
    viewers: Vec<Viewer>,
}

impl HeadlessDisplay {
    pub fn new(layout: &SquareLayout) -> Result<Self> {
        Self::with_buffers(layout, DISPLAY_BUFFER_COUNT)
    }

    pub fn with_buffers(layout: &SquareLayout, buffers: usize) -> Result<Self> {
        // 最新帧 + 通道正在写的一帧
        let buffers = buffers.max(2);
        let viewers = layout
            .viewers
            .iter()
            .map(|g| {
                Ok(Viewer {
                    geometry: *g,
                    pool: FrameBufferPool::new(buffers, g.width, g.height)?,
                    latest: Mutex::new(None),
                    fps: Mutex::new(0.0),
                    confidence: Mutex::new(USE_GLOBAL_CONFIDENCE),
                    published: AtomicU64::new(0),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { viewers })
    }

    fn viewer(&self, id: usize) -> Result<&Viewer> {
        self.viewers
            .get(id)
            .ok_or_else(|| PipelineError::DataInvalid(format!("no viewer #{}", id)))
    }

    pub fn geometry(&self, id: usize) -> Option<ViewerGeometry> {
        self.viewers.get(id).map(|v| v.geometry)
    }

    /// 设置单个窗口的置信度; `None` 恢复使用全局默认值
    pub fn set_confidence(&self, id: usize, confidence: Option<f32>) -> Result<()> {
        let v = self.viewer(id)?;
        *v.confidence.lock() = match confidence {
            Some(c) if (0.0..=1.0).contains(&c) => c,
            Some(c) => {
                return Err(PipelineError::Config(format!(
                    "confidence {} outside [0, 1]",
                    c
                )))
            }
            None => USE_GLOBAL_CONFIDENCE,
        };
        Ok(())
    }

    /// 所有窗口统一设置
    pub fn set_all_confidence(&self, confidence: Option<f32>) -> Result<()> {
        for id in 0..self.viewers.len() {
            self.set_confidence(id, confidence)?;
        }
        Ok(())
    }

    pub fn fps(&self, id: usize) -> f32 {
        self.viewers.get(id).map_or(0.0, |v| *v.fps.lock())
    }

    pub fn published(&self, id: usize) -> u64 {
        self.viewers
            .get(id)
            .map_or(0, |v| v.published.load(Ordering::Relaxed))
    }

    /// 读取最新一帧
    pub fn with_latest<R>(&self, id: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let v = self.viewers.get(id)?;
        let latest = v.latest.lock();
        latest.as_ref().map(|buf| f(buf.data()))
    }

    /// 每个窗口已发布帧数中的最小值
    pub fn min_published(&self) -> u64 {
        self.viewers
            .iter()
            .map(|v| v.published.load(Ordering::Relaxed))
            .min()
            .unwrap_or(0)
    }
}

impl DisplaySink for HeadlessDisplay {
    fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    fn viewer_width(&self, id: usize) -> u32 {
        self.viewers.get(id).map_or(0, |v| v.geometry.width)
    }

    fn viewer_height(&self, id: usize) -> u32 {
        self.viewers.get(id).map_or(0, |v| v.geometry.height)
    }

    fn acquire_display_buffer(&self, id: usize) -> Result<FrameBuffer> {
        self.viewer(id)?.pool.acquire()
    }

    fn publish(&self, id: usize, buf: FrameBuffer, fps: f32) -> Result<()> {
        let v = self.viewer(id)?;
        let previous = v.latest.lock().replace(buf);
        if let Some(old) = previous {
            v.pool.release(old)?;
        }
        if fps != 0.0 {
            *v.fps.lock() = fps;
        }
        v.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release_display_buffer(&self, id: usize, buf: FrameBuffer) -> Result<()> {
        self.viewer(id)?.pool.release(buf)
    }

    fn effective_confidence(&self, id: usize) -> f32 {
        self.viewers
            .get(id)
            .map_or(USE_GLOBAL_CONFIDENCE, |v| *v.confidence.lock())
    }
}
