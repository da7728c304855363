//! 视频文件输入 (Video file input)
//!
//! - `FilePreloadSession`: 打开时预解码至多 N 帧, 按固定帧间隔循环回放
//! - `FileReplaySession`: 按需逐帧解码, 文件结束时从头开始

use super::convert::{FrameConverter, YuvPlanes};
use super::decode_filter::{DecodeFilter, FrameSink, SinkFlow, SINK_FINISHED};
use super::stream::{build_decode_context, sleep_interruptible, PoolSink, StreamShared};
use super::{Interrupt, Resolution};
use crate::error::{PipelineError, Result};
use crate::pool::{FrameBuffer, FrameBufferPool, RGB_CHANNELS};
use ez_ffmpeg::Input;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// 默认回放帧率
pub const DEFAULT_REPLAY_FPS: u32 = 60;
/// 逐帧解码失败后的重试间隔
pub const REPLAY_RETRY_INTERVAL: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 固定帧间隔节拍器: 每次调用补足上一帧以来剩余的间隔
#[derive(Debug)]
pub struct FramePacer {
    interval: Duration,
    last: Option<Instant>,
}

impl FramePacer {
    /// fps 为 0 时不限速
    pub fn new(fps: u32) -> Self {
        let interval = if fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(1000 / fps as u64)
        };
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

#[derive(Default)]
struct PreloadState {
    frames: Vec<Vec<u8>>,
    original: Option<Resolution>,
}

/// 收集至多 `budget` 帧显示尺寸的 RGB
struct PreloadSink {
    state: Arc<Mutex<PreloadState>>,
    converter: FrameConverter,
    budget: usize,
}

impl FrameSink for PreloadSink {
    fn on_frame(&mut self, planes: &YuvPlanes<'_>) -> SinkFlow {
        let mut state = self.state.lock();
        if state.frames.len() >= self.budget {
            return SinkFlow::Stop;
        }
        if state.original.is_none() {
            state.original = Some(Resolution::new(planes.width as u32, planes.height as u32));
        }

        let (w, h) = self.converter.target_size();
        let mut rgb = vec![0u8; w as usize * h as usize * RGB_CHANNELS];
        let stored = match self.converter.convert_yuv420p(planes, &mut rgb) {
            Ok(rows) if rows == h => {
                state.frames.push(rgb);
                true
            }
            Ok(rows) => {
                log::warn!("⚠️ 预解码帧行数不足 {}/{}", rows, h);
                false
            }
            Err(e) => {
                log::debug!("预解码帧转换失败: {}", e);
                false
            }
        };

        if state.frames.len() >= self.budget {
            SinkFlow::Stop
        } else if stored {
            SinkFlow::Continue
        } else {
            SinkFlow::Dropped
        }
    }
}

/// 预解码文件会话
pub struct FilePreloadSession {
    path: String,
    width: u32,
    height: u32,
    frames: Vec<Vec<u8>>,
    original: Resolution,
    cursor: usize,
    pacer: FramePacer,
}

impl FilePreloadSession {
    /// 解码至多 `max_frames` 帧, 缩放到 `width x height`
    pub fn open(
        path: &str,
        width: u32,
        height: u32,
        max_frames: usize,
        fps: u32,
        interrupt: Interrupt,
    ) -> Result<Self> {
        if max_frames == 0 {
            return Err(PipelineError::FatalInit("预解码帧数必须大于0".into()));
        }
        log::info!("📼 预解码视频 {} (最多{}帧)", path, max_frames);

        let state = Arc::new(Mutex::new(PreloadState::default()));
        let sink = PreloadSink {
            state: Arc::clone(&state),
            converter: FrameConverter::new(width, height),
            budget: max_frames,
        };
        let filter = DecodeFilter::new(path.to_string(), sink, interrupt);
        let ctx = build_decode_context(Input::new(path), filter)
            .map_err(|e| PipelineError::FatalInit(format!("{}: {}", path, e)))?;
        let sch = ctx
            .start()
            .map_err(|e| PipelineError::FatalInit(format!("{}: 启动失败: {}", path, e)))?;
        if let Err(e) = sch.wait() {
            // 预算用尽时过滤器主动结束解码
            if !e.to_string().contains(SINK_FINISHED) {
                log::debug!("预解码结束: {}", e);
            }
        }

        let mut state = std::mem::take(&mut *state.lock());
        if state.frames.is_empty() {
            return Err(PipelineError::FatalInit(format!("{} 没有可解码的视频帧", path)));
        }
        let original = state.original.take().unwrap_or(Resolution::new(width, height));
        log::info!(
            "✅ 预解码完成 {}: {}帧, 原始分辨率 {}x{}",
            path,
            state.frames.len(),
            original.width,
            original.height
        );

        Ok(Self::from_frames(path, width, height, state.frames, original, fps))
    }

    pub(crate) fn from_frames(
        path: &str,
        width: u32,
        height: u32,
        frames: Vec<Vec<u8>>,
        original: Resolution,
        fps: u32,
    ) -> Self {
        Self {
            path: path.to_string(),
            width,
            height,
            frames,
            original,
            cursor: 0,
            pacer: FramePacer::new(fps),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 原始视频分辨率
    pub fn get_resolution(&self) -> Resolution {
        self.original
    }

    /// 复制下一帧到 `dst`, 按帧间隔限速, 末尾回绕到第0帧
    pub fn get_frame(&mut self, dst: &mut [u8]) -> Result<()> {
        let need = self.width as usize * self.height as usize * RGB_CHANNELS;
        if dst.len() < need {
            return Err(PipelineError::DataInvalid("display buffer too small".into()));
        }
        if self.cursor >= self.frames.len() {
            self.cursor = 0;
        }
        dst[..need].copy_from_slice(&self.frames[self.cursor]);
        self.cursor += 1;
        self.pacer.wait();
        Ok(())
    }
}

/// 逐帧解码的文件会话 (内存占用低, 延迟较高)
pub struct FileReplaySession {
    path: String,
    pool: Arc<FrameBufferPool>,
    shared: Arc<StreamShared>,
    worker: Option<JoinHandle<()>>,
}

impl FileReplaySession {
    pub fn open(path: &str, width: u32, height: u32, interrupt: Interrupt) -> Result<Self> {
        if !std::path::Path::new(path).exists() {
            return Err(PipelineError::FatalInit(format!("视频文件不存在: {}", path)));
        }
        // 单缓冲: 解码线程等到消费者归还后才解码下一帧
        let pool = Arc::new(FrameBufferPool::new(1, width, height)?);
        let shared = Arc::new(StreamShared::new(interrupt));

        let worker = {
            let path = path.to_string();
            let pool = Arc::clone(&pool);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("file-replay".into())
                .spawn(move || replay_worker(&path, &pool, &shared))?
        };

        Ok(Self {
            path: path.to_string(),
            pool,
            shared,
            worker: Some(worker),
        })
    }

    pub fn get_resolution(&self) -> Option<Resolution> {
        self.shared.resolution()
    }

    pub fn get_frame(&self) -> Result<FrameBuffer> {
        loop {
            if self.shared.interrupt().is_set() {
                return Err(PipelineError::Closed);
            }
            if let Some(buf) = self.pool.next_ready_timeout(POLL_INTERVAL)? {
                return Ok(buf);
            }
        }
    }

    pub fn return_frame(&self, buf: FrameBuffer) -> Result<()> {
        self.pool.release(buf)
    }

    pub fn close(&mut self) {
        self.shared.interrupt().trigger();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("❌ 文件解码线程 panic: {}", self.path);
            }
        }
    }
}

impl Drop for FileReplaySession {
    fn drop(&mut self) {
        self.close();
    }
}

fn replay_worker(path: &str, pool: &Arc<FrameBufferPool>, shared: &Arc<StreamShared>) {
    let mut rounds = 0usize;
    while !shared.interrupt().is_set() {
        let sink = PoolSink::new(Arc::clone(pool), Arc::clone(shared), true);
        let filter = DecodeFilter::new(path.to_string(), sink, shared.interrupt().clone());
        let outcome = build_decode_context(Input::new(path), filter).and_then(|ctx| {
            let sch = ctx.start().map_err(|e| e.to_string())?;
            sch.wait().map_err(|e| e.to_string())
        });
        if shared.interrupt().is_set() {
            break;
        }
        rounds += 1;
        match outcome {
            Ok(()) => log::debug!("🔁 文件播放结束, 从头开始 (第{}轮): {}", rounds, path),
            Err(e) => {
                log::warn!("⚠️ 文件解码失败: {}, {:?}后重试", e, REPLAY_RETRY_INTERVAL);
                if !sleep_interruptible(shared.interrupt(), REPLAY_RETRY_INTERVAL) {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, v: u8) -> Vec<u8> {
        vec![v; w as usize * h as usize * RGB_CHANNELS]
    }

    #[test]
    fn test_pacer_interval_from_fps() {
        assert_eq!(FramePacer::new(60).interval(), Duration::from_millis(16));
        assert_eq!(FramePacer::new(0).interval(), Duration::ZERO);
    }

    #[test]
    fn test_pacer_spaces_calls() {
        let mut pacer = FramePacer::new(20);
        let start = Instant::now();
        for _ in 0..4 {
            pacer.wait();
        }
        // 第一次不等待, 后三次各补足 50ms
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_preload_wraps_to_start() {
        let frames = vec![solid(2, 2, 1), solid(2, 2, 2), solid(2, 2, 3)];
        let mut session =
            FilePreloadSession::from_frames("clip.mp4", 2, 2, frames, Resolution::new(1920, 1080), 0);
        let mut dst = solid(2, 2, 0);
        let mut seen = Vec::new();
        for _ in 0..7 {
            session.get_frame(&mut dst).unwrap();
            seen.push(dst[0]);
        }
        assert_eq!(seen, vec![1, 2, 3, 1, 2, 3, 1]);
        assert_eq!(session.get_resolution(), Resolution::new(1920, 1080));
    }

    #[test]
    fn test_preload_rejects_small_destination() {
        let mut session =
            FilePreloadSession::from_frames("clip.mp4", 2, 2, vec![solid(2, 2, 1)], Resolution::new(2, 2), 0);
        let mut dst = vec![0u8; 3];
        assert!(session.get_frame(&mut dst).is_err());
    }

    #[test]
    fn test_preload_sink_stops_at_budget() {
        let state = Arc::new(Mutex::new(PreloadState::default()));
        let mut sink = PreloadSink {
            state: Arc::clone(&state),
            converter: FrameConverter::new(2, 2),
            budget: 2,
        };
        let y = vec![80u8; 4 * 4];
        let uv = vec![128u8; 2 * 2];
        let planes = YuvPlanes {
            width: 4,
            height: 4,
            y: &y,
            u: &uv,
            v: &uv,
            y_stride: 4,
            uv_stride: 2,
        };
        assert_eq!(sink.on_frame(&planes), SinkFlow::Continue);
        assert_eq!(sink.on_frame(&planes), SinkFlow::Stop);
        assert_eq!(sink.on_frame(&planes), SinkFlow::Stop);

        let state = state.lock();
        assert_eq!(state.frames.len(), 2);
        assert_eq!(state.original, Some(Resolution::new(4, 4)));
    }

    #[test]
    fn test_replay_missing_file_is_fatal() {
        let irq = Interrupt::new(Arc::new(std::sync::atomic::AtomicBool::new(false)));
        assert!(matches!(
            FileReplaySession::open("/nonexistent/clip.mp4", 4, 4, irq),
            Err(PipelineError::FatalInit(_))
        ));
    }
}
