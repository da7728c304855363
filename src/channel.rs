// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 通道调度 (Channel orchestration)
//!
//! 每个窗口一个通道线程: 取显示缓冲 → 从输入源取帧 → 检测 → 绘制 → 统计 FPS → 发布.
//! 关闭顺序: 设置关闭标志 → 等待所有通道线程 → 等待监控线程 → 释放输入源.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::DeviceTimeoutPolicy;
use crate::detection::DetectionEngine;
use crate::display::DisplaySink;
use crate::error::{PipelineError, Result};
use crate::input::InputSource;
use crate::monitor::Monitor;

/// FPS 统计窗口 (帧)
pub const FPS_WINDOW: u32 = 120;
/// 每帧处理后的让出时间
pub const FRAME_INTERVAL: Duration = Duration::from_millis(30);
/// 设备超时导致进程退出时的退出码
pub const EXIT_DEVICE_TIMEOUT: i32 = 2;

/// 固定窗口 FPS: 第 1 帧记录起点, 窗口结束时计算一次并重置
#[derive(Debug, Default)]
pub struct FpsCounter {
    count: u32,
    start: Option<Instant>,
    last: f32,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) -> Option<f32> {
        self.tick_at(Instant::now())
    }

    /// 只有窗口结束的那一帧返回 Some
    pub fn tick_at(&mut self, now: Instant) -> Option<f32> {
        self.count += 1;
        if self.count == 1 {
            self.start = Some(now);
            return None;
        }
        if self.count == FPS_WINDOW + 1 {
            self.count = 0;
            let elapsed = self.start.map(|s| now.duration_since(s).as_secs_f32())?;
            if elapsed <= 0.0 {
                return None;
            }
            self.last = FPS_WINDOW as f32 / elapsed;
            return Some(self.last);
        }
        None
    }

    /// 最近一次完成窗口的 FPS
    pub fn last(&self) -> f32 {
        self.last
    }
}

/// 所有通道共用的运行参数
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// 窗口未设置置信度时使用
    pub default_confidence: f32,
    pub device_timeout_policy: DeviceTimeoutPolicy,
    /// 每个通道处理多少帧后停止, 0 = 不限
    pub max_frames: u64,
    pub frame_interval: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            default_confidence: 0.3,
            device_timeout_policy: DeviceTimeoutPolicy::ExitProcess,
            max_frames: 0,
            frame_interval: FRAME_INTERVAL,
        }
    }
}

/// 通道线程退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelExit {
    Shutdown,
    FrameLimit,
    SourceClosed,
    DeviceTimeout,
    Failed,
}

/// 一个窗口的处理通道
pub struct Channel {
    id: usize,
    width: u32,
    height: u32,
    source: InputSource,
    engine: DetectionEngine,
    fps: FpsCounter,
    frames: u64,
}

impl Channel {
    pub fn new(id: usize, width: u32, height: u32, source: InputSource, engine: DetectionEngine) -> Self {
        Self {
            id,
            width,
            height,
            source,
            engine,
            fps: FpsCounter::new(),
            frames: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn engine(&self) -> &DetectionEngine {
        &self.engine
    }

    pub fn source(&self) -> &InputSource {
        &self.source
    }

    /// 通道主循环, 直到关闭标志/帧数上限/输入源关闭
    pub fn run(
        &mut self,
        display: &dyn DisplaySink,
        settings: &ChannelSettings,
        shutdown: &AtomicBool,
        frame_count: &AtomicU64,
    ) -> ChannelExit {
        log::info!(
            "📹 通道{} 启动 ({}, {}x{})",
            self.id,
            self.source.kind(),
            self.width,
            self.height
        );
        while !shutdown.load(Ordering::Relaxed) {
            match self.step(display, settings, frame_count) {
                Ok(()) => {}
                Err(PipelineError::Closed) => {
                    return if shutdown.load(Ordering::Relaxed) {
                        ChannelExit::Shutdown
                    } else {
                        log::warn!("⚠️ 通道{} 输入源已关闭", self.id);
                        ChannelExit::SourceClosed
                    };
                }
                Err(PipelineError::DeviceTimeout(secs)) => {
                    return self.on_device_timeout(secs, settings.device_timeout_policy);
                }
                Err(e) if e.is_recoverable() => {
                    log::debug!("通道{} 跳过一帧: {}", self.id, e);
                }
                Err(e) => {
                    log::error!("❌ 通道{} 停止: {}", self.id, e);
                    return ChannelExit::Failed;
                }
            }

            if settings.max_frames > 0 && self.frames >= settings.max_frames {
                log::info!("✅ 通道{} 已处理 {} 帧", self.id, self.frames);
                return ChannelExit::FrameLimit;
            }
            thread::sleep(settings.frame_interval);
        }
        ChannelExit::Shutdown
    }

    fn step(
        &mut self,
        display: &dyn DisplaySink,
        settings: &ChannelSettings,
        frame_count: &AtomicU64,
    ) -> Result<()> {
        // 显示尺寸固定, 重复计算时直接返回缓存结果
        self.engine.compute_padding(self.width, self.height);

        let mut buf = display.acquire_display_buffer(self.id)?;
        if let Err(e) = self.source.get_frame(buf.data_mut()) {
            display.release_display_buffer(self.id, buf)?;
            return Err(e);
        }

        let viewer_conf = display.effective_confidence(self.id);
        let confidence = if viewer_conf < 0.0 {
            settings.default_confidence
        } else {
            viewer_conf
        };
        if let Err(e) = self.engine.set_confidence(confidence) {
            log::warn!("⚠️ 通道{} 置信度无效: {}", self.id, e);
        }

        match self.engine.process(buf.data(), self.width, self.height) {
            Ok(output) => {
                if let Err(e) = self.engine.draw(&output, buf.data_mut(), self.width, self.height) {
                    log::warn!("⚠️ 通道{} 绘制失败: {}", self.id, e);
                }
            }
            Err(e) => log::warn!("⚠️ 通道{} 推理失败: {}", self.id, e),
        }

        self.frames += 1;
        frame_count.fetch_add(1, Ordering::Relaxed);
        let fps = self.fps.tick().unwrap_or(0.0);
        display.publish(self.id, buf, fps)
    }

    fn on_device_timeout(&self, secs: u64, policy: DeviceTimeoutPolicy) -> ChannelExit {
        match policy {
            DeviceTimeoutPolicy::ExitProcess => {
                log::error!(
                    "❌ 通道{} 采集设备 {} 秒无数据, 进程退出",
                    self.id,
                    secs
                );
                std::process::exit(EXIT_DEVICE_TIMEOUT);
            }
            DeviceTimeoutPolicy::IsolateChannel => {
                log::error!(
                    "❌ 通道{} 采集设备 {} 秒无数据, 停止该通道",
                    self.id,
                    secs
                );
                ChannelExit::DeviceTimeout
            }
        }
    }

    /// 释放输入源
    pub fn close(&mut self) {
        self.source.close();
    }
}

/// 通道线程 + 监控线程的生命周期管理
pub struct Orchestrator {
    shutdown: Arc<AtomicBool>,
    frame_count: Arc<AtomicU64>,
    workers: Vec<(usize, JoinHandle<(Channel, ChannelExit)>)>,
    monitor: Option<Monitor>,
}

impl Orchestrator {
    /// 每个通道启动一个线程
    pub fn start(
        channels: Vec<Channel>,
        display: Arc<dyn DisplaySink>,
        settings: ChannelSettings,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let frame_count = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(channels.len());

        for mut channel in channels {
            let id = channel.id();
            let display = Arc::clone(&display);
            let settings = settings.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let counter = Arc::clone(&frame_count);

            let spawned = thread::Builder::new()
                .name(format!("channel-{}", id))
                .spawn(move || {
                    let exit = channel.run(display.as_ref(), &settings, &shutdown_flag, &counter);
                    (channel, exit)
                });
            match spawned {
                Ok(handle) => workers.push((id, handle)),
                Err(e) => {
                    // 已启动的线程需要先停下
                    shutdown.store(true, Ordering::Relaxed);
                    for (_, h) in workers {
                        let _ = h.join();
                    }
                    return Err(PipelineError::FatalInit(format!(
                        "spawn channel {}: {}",
                        id, e
                    )));
                }
            }
        }
        log::info!("✅ 已启动 {} 个通道线程", workers.len());

        Ok(Self {
            shutdown,
            frame_count,
            workers,
            monitor: None,
        })
    }

    /// 启动监控线程
    pub fn attach_monitor(&mut self, interval_secs: u64) -> Result<()> {
        let monitor = Monitor::spawn(
            interval_secs,
            Arc::clone(&self.frame_count),
            Arc::clone(&self.shutdown),
        )?;
        self.monitor = Some(monitor);
        Ok(())
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    pub fn channel_count(&self) -> usize {
        self.workers.len()
    }

    /// 所有通道线程都已自行结束
    pub fn all_finished(&self) -> bool {
        self.workers.iter().all(|(_, h)| h.is_finished())
    }

    /// 按顺序关闭, 返回每个通道的退出原因
    pub fn shutdown(self) -> Vec<(usize, ChannelExit)> {
        self.shutdown.store(true, Ordering::Relaxed);

        let mut channels = Vec::with_capacity(self.workers.len());
        let mut exits = Vec::with_capacity(self.workers.len());
        for (id, handle) in self.workers {
            match handle.join() {
                Ok((channel, exit)) => {
                    exits.push((id, exit));
                    channels.push(channel);
                }
                Err(_) => {
                    log::error!("❌ 通道{} 线程异常退出", id);
                    exits.push((id, ChannelExit::Failed));
                }
            }
        }

        if let Some(monitor) = self.monitor {
            monitor.join();
        }

        for channel in channels.iter_mut() {
            channel.close();
        }
        log::info!("✅ 已关闭 {} 个通道", channels.len());
        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::layer::FLAT_FEATURES;
    use crate::detection::{draw::BOX_COLORS, InferenceBackend};
    use crate::display::{HeadlessDisplay, SquareLayout};
    use crate::input::{FilePreloadSession, Resolution};
    use ndarray::{Array4, ArrayD, IxDyn};

    /// 总是在模型输入中心检测到一张人脸
    struct CenterFace {
        confidence: f32,
    }

    impl InferenceBackend for CenterFace {
        fn run(&mut self, _input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
            let mut y = ArrayD::zeros(IxDyn(&[1, FLAT_FEATURES, 1]));
            y[[0, 0, 0]] = 320.0;
            y[[0, 1, 0]] = 320.0;
            y[[0, 2, 0]] = 200.0;
            y[[0, 3, 0]] = 200.0;
            y[[0, 4, 0]] = self.confidence;
            Ok(vec![y])
        }
    }

    fn preload_source(width: u32, height: u32, frames: usize) -> InputSource {
        let len = (width * height * 3) as usize;
        let frames = (0..frames).map(|i| vec![i as u8 * 10; len]).collect();
        InputSource::FilePreload(FilePreloadSession::from_frames(
            "memory.mp4",
            width,
            height,
            frames,
            Resolution::new(width, height),
            1000,
        ))
    }

    fn fast_settings(max_frames: u64) -> ChannelSettings {
        ChannelSettings {
            default_confidence: 0.3,
            device_timeout_policy: DeviceTimeoutPolicy::IsolateChannel,
            max_frames,
            frame_interval: Duration::from_millis(1),
        }
    }

    fn wait_finished(orch: &Orchestrator) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !orch.all_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_fps_window_120_frames_in_2s() {
        let mut fps = FpsCounter::new();
        let t0 = Instant::now();
        assert_eq!(fps.tick_at(t0), None);
        let step = Duration::from_secs(2) / FPS_WINDOW;
        let mut result = None;
        for i in 1..=FPS_WINDOW {
            result = fps.tick_at(t0 + step * i);
            if i < FPS_WINDOW {
                assert_eq!(result, None);
            }
        }
        let v = result.unwrap();
        assert!((v - 60.0).abs() < 0.01);
        assert!((fps.last() - 60.0).abs() < 0.01);
        // 新窗口重新开始
        assert_eq!(fps.tick_at(t0 + Duration::from_secs(3)), None);
    }

    #[test]
    fn test_channels_publish_and_stop_at_limit() {
        let layout = SquareLayout::new(2, 256, 144).unwrap();
        let display = Arc::new(HeadlessDisplay::with_buffers(&layout, 4).unwrap());
        let (w, h) = (display.viewer_width(0), display.viewer_height(0));

        let channels = (0..2)
            .map(|id| {
                let engine = DetectionEngine::new(Box::new(CenterFace { confidence: 0.9 }));
                Channel::new(id, w, h, preload_source(w, h, 3), engine)
            })
            .collect();
        let shutdown = Arc::new(AtomicBool::new(false));
        let sink: Arc<dyn DisplaySink> = display.clone();
        let orch = Orchestrator::start(channels, sink, fast_settings(5), Arc::clone(&shutdown)).unwrap();
        assert_eq!(orch.channel_count(), 2);

        wait_finished(&orch);
        assert_eq!(orch.frame_count(), 10);
        let exits = orch.shutdown();
        assert!(exits.iter().all(|(_, e)| *e == ChannelExit::FrameLimit));
        assert_eq!(display.published(0), 5);
        assert_eq!(display.min_published(), 5);

        // 显示坐标中的框左边: (320 - 100) / (640/128) = 44
        let px = display
            .with_latest(1, |d| {
                let i = ((h / 2 * w + 44) * 3) as usize;
                [d[i], d[i + 1], d[i + 2]]
            })
            .unwrap();
        assert_eq!(px, BOX_COLORS[0]);
    }

    #[test]
    fn test_viewer_confidence_override() {
        let layout = SquareLayout::new(1, 128, 72).unwrap();
        let display = Arc::new(HeadlessDisplay::with_buffers(&layout, 3).unwrap());
        display.set_confidence(0, Some(0.8)).unwrap();
        let (w, h) = (display.viewer_width(0), display.viewer_height(0));

        let engine = DetectionEngine::new(Box::new(CenterFace { confidence: 0.5 }));
        let channel = Channel::new(0, w, h, preload_source(w, h, 2), engine);
        let sink: Arc<dyn DisplaySink> = display.clone();
        let orch = Orchestrator::start(
            vec![channel],
            sink,
            fast_settings(3),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        wait_finished(&orch);
        orch.shutdown();

        // 0.5 < 0.8, 不画框: 画面保持源帧内容
        let row_mid = display
            .with_latest(0, |d| d[((h / 2 * w + 40) * 3) as usize])
            .unwrap();
        assert_ne!(row_mid, BOX_COLORS[0][1]);
    }

    #[test]
    fn test_shutdown_flag_stops_channels() {
        let layout = SquareLayout::new(1, 128, 72).unwrap();
        let display = Arc::new(HeadlessDisplay::with_buffers(&layout, 3).unwrap());
        let (w, h) = (display.viewer_width(0), display.viewer_height(0));
        let engine = DetectionEngine::new(Box::new(CenterFace { confidence: 0.9 }));
        let channel = Channel::new(0, w, h, preload_source(w, h, 2), engine);

        let shutdown = Arc::new(AtomicBool::new(false));
        let sink: Arc<dyn DisplaySink> = display.clone();
        let mut orch =
            Orchestrator::start(vec![channel], sink, fast_settings(0), Arc::clone(&shutdown)).unwrap();
        orch.attach_monitor(1).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(!orch.all_finished());

        let exits = orch.shutdown();
        assert_eq!(exits, vec![(0, ChannelExit::Shutdown)]);
        assert!(shutdown.load(Ordering::Relaxed));
        assert!(display.published(0) > 0);
    }
}
