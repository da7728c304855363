/// FFmpeg解码过滤器模块
/// FFmpeg decode filter module
///
/// 每个解码后的视频帧都经过这里: 校验 → 借出 YUV420P 平面 → 交给 FrameSink.
/// 关闭信号在这里被轮询, 返回 Err 即可中断 FFmpeg 调度线程.
use super::convert::YuvPlanes;
use super::Interrupt;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};
use std::time::Instant;

/// 中断原因 (作为 FFmpeg 管线错误字符串返回)
pub const INTERRUPTED: &str = "Decoder interrupted";
pub const SINK_FINISHED: &str = "Frame sink finished";

/// 帧接收方的控制流
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    Continue,
    /// 帧未被使用 (没有空闲缓冲或转换失败), 继续解码
    Dropped,
    /// 不再需要更多帧 (例如预解码预算已满)
    Stop,
}

/// 解码帧的接收方
pub trait FrameSink: Send + 'static {
    fn on_frame(&mut self, planes: &YuvPlanes<'_>) -> SinkFlow;
}

/// 解码统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    pub total: usize,
    pub decoded: usize,
    pub dropped: usize,
}

impl DecodeStats {
    /// 按接收方的结果记账
    pub fn record(&mut self, flow: SinkFlow) {
        match flow {
            SinkFlow::Dropped => self.dropped += 1,
            SinkFlow::Continue | SinkFlow::Stop => self.decoded += 1,
        }
    }
}

/// FFmpeg解码过滤器: 视频帧 → FrameSink
pub struct DecodeFilter<S: FrameSink> {
    name: String,
    sink: S,
    interrupt: Interrupt,
    stats: DecodeStats,
    window_decoded: usize,
    last: Instant,
}

impl<S: FrameSink> DecodeFilter<S> {
    pub fn new(name: impl Into<String>, sink: S, interrupt: Interrupt) -> Self {
        Self {
            name: name.into(),
            sink,
            interrupt,
            stats: DecodeStats::default(),
            window_decoded: 0,
            last: Instant::now(),
        }
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    fn drop_frame(&mut self, reason: &str) {
        self.stats.dropped += 1;
        self.log_drop(reason);
    }

    fn log_drop(&self, reason: &str) {
        if self.stats.total <= 10 {
            log::warn!("⚠️ [{}] 丢弃帧 #{}: {}", self.name, self.stats.total, reason);
        } else {
            log::debug!("[{}] 丢弃帧 #{}: {}", self.name, self.stats.total, reason);
        }
    }

    fn report(&mut self) {
        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            let drop_rate = self.stats.dropped as f64 / self.stats.total.max(1) as f64 * 100.0;
            log::debug!(
                "📺 [{}] 解码统计: {:.1}fps | 总帧{} | 丢弃{} ({:.1}%)",
                self.name,
                self.window_decoded as f64 / elapsed,
                self.stats.total,
                self.stats.dropped,
                drop_rate
            );
            self.window_decoded = 0;
            self.last = Instant::now();
        }
    }
}

impl<S: FrameSink> FrameFilter for DecodeFilter<S> {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        log::info!("✅ [{}] 解码线程启动", self.name);
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        if self.interrupt.is_set() {
            return Err(INTERRUPTED.to_string());
        }

        self.stats.total += 1;

        // 空帧或损坏帧
        if unsafe { frame.as_ptr().is_null() || frame.is_empty() } || frame.is_corrupt() {
            self.drop_frame("空帧/损坏帧");
            return Ok(None);
        }

        let flow = unsafe {
            let av = frame.as_ptr();
            let w = (*av).width;
            let h = (*av).height;
            if w <= 0 || h <= 0 || w > 8192 || h > 8192 {
                self.drop_frame(&format!("非法分辨率 {}x{}", w, h));
                return Ok(None);
            }

            // 缺少参考帧、无效比特流
            if (*av).decode_error_flags & 0x03 != 0 {
                let flags = (*av).decode_error_flags;
                self.drop_frame(&format!("解码错误标志=0x{:02x}", flags));
                return Ok(None);
            }

            let (y_ptr, u_ptr, v_ptr) = ((*av).data[0], (*av).data[1], (*av).data[2]);
            if y_ptr.is_null() || u_ptr.is_null() || v_ptr.is_null() {
                self.drop_frame("YUV指针为空");
                return Ok(None);
            }

            let y_stride = (*av).linesize[0];
            let uv_stride = (*av).linesize[1];
            if y_stride <= 0 || uv_stride <= 0 || (*av).linesize[2] != uv_stride {
                self.drop_frame(&format!("步长异常 y={} uv={}", y_stride, uv_stride));
                return Ok(None);
            }

            let (w, h) = (w as usize, h as usize);
            let (y_stride, uv_stride) = (y_stride as usize, uv_stride as usize);
            let chroma_rows = h.div_ceil(2);
            let planes = YuvPlanes {
                width: w,
                height: h,
                y: std::slice::from_raw_parts(y_ptr, y_stride * h),
                u: std::slice::from_raw_parts(u_ptr, uv_stride * chroma_rows),
                v: std::slice::from_raw_parts(v_ptr, uv_stride * chroma_rows),
                y_stride,
                uv_stride,
            };
            if let Err(e) = planes.validate() {
                self.drop_frame(&e.to_string());
                return Ok(None);
            }

            self.sink.on_frame(&planes)
        };

        self.stats.record(flow);
        if flow == SinkFlow::Dropped {
            self.log_drop("接收方未使用该帧");
        } else {
            self.window_decoded += 1;
        }
        self.report();

        match flow {
            SinkFlow::Continue | SinkFlow::Dropped => Ok(Some(frame)),
            SinkFlow::Stop => Err(SINK_FINISHED.to_string()),
        }
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        log::info!(
            "✅ [{}] 解码线程退出 (解码{} / 丢弃{})",
            self.name,
            self.stats.decoded,
            self.stats.dropped
        );
    }
}
