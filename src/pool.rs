// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 帧缓冲池 (Frame buffer pool)
//!
//! 固定容量的生产者/消费者缓冲池, 连接一个解码线程和它唯一的读者.
//! 两条有界队列: `free` 存放空闲缓冲, `ready` 存放已填充的缓冲.
//! 缓冲区以值的形式在队列间移动, 同一时刻只属于一方, 不可复制.

use crate::error::{PipelineError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// RGB24 每像素字节数
pub const RGB_CHANNELS: usize = 3;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// 解码目标缓冲区 (RGB24, 固定尺寸)
///
/// 不实现 Clone: 所有权转移就是句柄转移.
#[derive(Debug)]
pub struct FrameBuffer {
    pool_id: usize,
    index: usize,
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl FrameBuffer {
    fn new(pool_id: usize, index: usize, width: u32, height: u32) -> Self {
        Self {
            pool_id,
            index,
            width,
            height,
            data: vec![0; width as usize * height as usize * RGB_CHANNELS],
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// 每行字节数
    pub fn stride(&self) -> usize {
        self.width as usize * RGB_CHANNELS
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// 有界帧缓冲池
pub struct FrameBufferPool {
    id: usize,
    capacity: usize,
    width: u32,
    height: u32,
    free_tx: Sender<FrameBuffer>,
    free_rx: Receiver<FrameBuffer>,
    ready_tx: Sender<FrameBuffer>,
    ready_rx: Receiver<FrameBuffer>,
}

impl FrameBufferPool {
    /// 分配 `capacity` 个 `width x height` 的 RGB 缓冲区, 全部放入空闲队列
    pub fn new(capacity: usize, width: u32, height: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::FatalInit("pool capacity must be > 0".into()));
        }
        if width == 0 || height == 0 {
            return Err(PipelineError::FatalInit(format!(
                "invalid pool buffer size {}x{}",
                width, height
            )));
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let (free_tx, free_rx) = bounded(capacity);
        let (ready_tx, ready_rx) = bounded(capacity);
        for index in 0..capacity {
            free_tx
                .send(FrameBuffer::new(id, index, width, height))
                .map_err(|_| PipelineError::FatalInit("pool queue closed".into()))?;
        }

        Ok(Self {
            id,
            capacity,
            width,
            height,
            free_tx,
            free_rx,
            ready_tx,
            ready_rx,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// 阻塞直到有空闲缓冲区
    pub fn acquire(&self) -> Result<FrameBuffer> {
        self.free_rx.recv().map_err(|_| PipelineError::Closed)
    }

    /// 非阻塞获取, 没有空闲缓冲时返回 None (解码线程不能等待)
    pub fn try_acquire(&self) -> Option<FrameBuffer> {
        self.free_rx.try_recv().ok()
    }

    /// 带超时的获取, 让调用方有机会检查关闭信号
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Option<FrameBuffer>> {
        match self.free_rx.recv_timeout(timeout) {
            Ok(buf) => Ok(Some(buf)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Closed),
        }
    }

    /// 归还缓冲区到空闲队列
    pub fn release(&self, buf: FrameBuffer) -> Result<()> {
        self.check_owner(&buf)?;
        self.free_tx
            .try_send(buf)
            .map_err(|_| PipelineError::ResourceExhausted("free queue overflow".into()))
    }

    /// 发布已填充的缓冲区 (FIFO)
    pub fn publish(&self, buf: FrameBuffer) -> Result<()> {
        self.check_owner(&buf)?;
        self.ready_tx
            .try_send(buf)
            .map_err(|_| PipelineError::ResourceExhausted("ready queue overflow".into()))
    }

    /// 阻塞直到有已解码的帧
    pub fn next_ready(&self) -> Result<FrameBuffer> {
        self.ready_rx.recv().map_err(|_| PipelineError::Closed)
    }

    pub fn try_next_ready(&self) -> Result<Option<FrameBuffer>> {
        match self.ready_rx.try_recv() {
            Ok(buf) => Ok(Some(buf)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(PipelineError::Closed),
        }
    }

    pub fn next_ready_timeout(&self, timeout: Duration) -> Result<Option<FrameBuffer>> {
        match self.ready_rx.recv_timeout(timeout) {
            Ok(buf) => Ok(Some(buf)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Closed),
        }
    }

    pub fn free_len(&self) -> usize {
        self.free_rx.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready_rx.len()
    }

    /// 当前被持有 (既不在 free 也不在 ready) 的缓冲区数量
    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.free_len() + self.ready_len())
    }

    fn check_owner(&self, buf: &FrameBuffer) -> Result<()> {
        if buf.pool_id != self.id || buf.index >= self.capacity {
            return Err(PipelineError::DataInvalid(format!(
                "buffer #{} does not belong to pool {}",
                buf.index, self.id
            )));
        }
        Ok(())
    }
}
