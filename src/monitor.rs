//! 运行状态监控线程: 周期性输出总 FPS 与 CPU 负载

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// 监控线程的检查周期
pub const MONITOR_TICK: Duration = Duration::from_millis(100);

/// /proc/stat 第一行的累计 CPU 时间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSample {
    pub idle: u64,
    pub total: u64,
}

impl CpuSample {
    /// 解析 "cpu  user nice system idle ..." 行, idle 为第 4 个数值
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        if fields.next()? != "cpu" {
            return None;
        }
        let times: Vec<u64> = fields.map_while(|f| f.parse().ok()).collect();
        if times.len() < 4 {
            return None;
        }
        Some(Self {
            idle: times[3],
            total: times.iter().sum(),
        })
    }

    pub fn read() -> Option<Self> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        Self::parse(stat.lines().next()?)
    }

    /// 两次采样之间的 CPU 占用百分比
    pub fn load_since(&self, prev: &CpuSample) -> f64 {
        let total = self.total.saturating_sub(prev.total);
        if total == 0 {
            return 0.0;
        }
        let idle = self.idle.saturating_sub(prev.idle);
        100.0 * (1.0 - idle as f64 / total as f64)
    }
}

/// 一个统计周期的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorReport {
    pub index: u64,
    pub fps: f64,
    pub cpu_load: f64,
}

pub struct Monitor {
    handle: JoinHandle<()>,
}

impl Monitor {
    /// 每 `interval_secs` 秒统计一次; `frame_count` 是所有通道共享的帧计数
    pub fn spawn(
        interval_secs: u64,
        frame_count: Arc<AtomicU64>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        Self::spawn_with(interval_secs, frame_count, shutdown, |r| {
            log::info!("📊 {}: FPS {:.1} | CPU_load {:.1} %", r.index, r.fps, r.cpu_load);
        })
    }

    pub fn spawn_with<F>(
        interval_secs: u64,
        frame_count: Arc<AtomicU64>,
        shutdown: Arc<AtomicBool>,
        mut report: F,
    ) -> Result<Self>
    where
        F: FnMut(MonitorReport) + Send + 'static,
    {
        if interval_secs == 0 {
            return Err(PipelineError::Config(
                "monitoring interval must be greater than 0".into(),
            ));
        }
        let target_ticks = (interval_secs * 1000 / MONITOR_TICK.as_millis() as u64).max(1);

        let handle = thread::Builder::new()
            .name("monitor".into())
            .spawn(move || {
                let mut prev_frames = frame_count.load(Ordering::Relaxed);
                let mut prev_cpu = CpuSample::read().unwrap_or_default();
                let mut ticks = 0u64;
                let mut index = 0u64;

                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(MONITOR_TICK);
                    ticks += 1;
                    if ticks < target_ticks {
                        continue;
                    }
                    ticks = 0;

                    let cpu = CpuSample::read().unwrap_or(prev_cpu);
                    let cpu_load = cpu.load_since(&prev_cpu);
                    prev_cpu = cpu;

                    let frames = frame_count.load(Ordering::Relaxed);
                    let fps = frames.saturating_sub(prev_frames) as f64 / interval_secs as f64;
                    prev_frames = frames;

                    report(MonitorReport {
                        index,
                        fps,
                        cpu_load,
                    });
                    index += 1;
                }
            })?;
        Ok(Self { handle })
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            log::error!("❌ 监控线程异常退出");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_parse_proc_stat() {
        let s = CpuSample::parse("cpu  100 0 50 800 50 0 0 0 0 0").unwrap();
        assert_eq!(s.idle, 800);
        assert_eq!(s.total, 1000);
        assert!(CpuSample::parse("cpu0 1 2 3 4").is_none());
        assert!(CpuSample::parse("cpu 1 2").is_none());
    }

    #[test]
    fn test_cpu_load() {
        let a = CpuSample { idle: 800, total: 1000 };
        let b = CpuSample { idle: 1100, total: 1400 };
        // idle 300 / total 400
        assert!((b.load_since(&a) - 25.0).abs() < 1e-9);
        assert_eq!(a.load_since(&a), 0.0);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let r = Monitor::spawn(
            0,
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(r.is_err());
    }

    #[test]
    fn test_monitor_reports_fps() {
        let frames = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let monitor = Monitor::spawn_with(1, Arc::clone(&frames), Arc::clone(&shutdown), move |r| {
            let _ = tx.send(r);
        })
        .unwrap();

        // 等监控线程记下初始计数
        thread::sleep(Duration::from_millis(300));
        frames.fetch_add(30, Ordering::Relaxed);
        let report = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(report.index, 0);
        assert!((report.fps - 30.0).abs() < 1e-9);
        assert!((0.0..=100.0).contains(&report.cpu_load));

        shutdown.store(true, Ordering::Relaxed);
        monitor.join();
    }
}
