//! 本地采集设备模块 (V4L2)
//!
//! 内核映射的 4 个采集缓冲组成环: 出队 → 读取 → 入队.
//! 取出的缓冲以整数句柄标识, 必须通过 `put_frame` 恰好归还一次.

use super::convert::{FrameConverter, Packed422};
use super::v4l2::*;
use super::Resolution;
use crate::error::{PipelineError, Result};
use memmap2::{Mmap, MmapOptions};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 请求的内核缓冲数量
pub const DEVICE_BUFFER_COUNT: u32 = 4;
/// 设备就绪等待上限
pub const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// 枚举扫描的最大节点号
const MAX_VIDEO_NODES: usize = 64;

/// 设备报告的原生像素编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelEncoding {
    Mjpeg,
    Yuyv,
    Uyvy,
    Rgb24,
    Grey,
    Other(u32),
}

impl PixelEncoding {
    pub fn from_fourcc(code: u32) -> Self {
        match code {
            V4L2_PIX_FMT_MJPEG => PixelEncoding::Mjpeg,
            V4L2_PIX_FMT_YUYV => PixelEncoding::Yuyv,
            V4L2_PIX_FMT_UYVY => PixelEncoding::Uyvy,
            V4L2_PIX_FMT_RGB24 => PixelEncoding::Rgb24,
            V4L2_PIX_FMT_GREY => PixelEncoding::Grey,
            other => PixelEncoding::Other(other),
        }
    }

    /// 只接受 MJPEG 和打包 YUV 4:2:2
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            PixelEncoding::Mjpeg | PixelEncoding::Yuyv | PixelEncoding::Uyvy
        )
    }
}

/// 采集设备信息
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub index: usize,
    pub path: PathBuf,
    pub card: String,
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
}

/// 出队缓冲的句柄, 不可复制
#[derive(Debug, PartialEq, Eq)]
pub struct BufferHandle {
    index: u32,
}

impl BufferHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// 在设备输入队列中
    Queued,
    /// 已被使用者取出
    Outstanding,
}

/// 出队缓冲未通过校验
#[derive(Debug)]
pub struct DequeueReject {
    pub requeue: Option<u32>,
    pub error: PipelineError,
}

/// 缓冲归属账本: 防止未知缓冲或重复入队
#[derive(Debug)]
pub struct BufferLedger {
    slots: Vec<Slot>,
}

impl BufferLedger {
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![Slot::Queued; count],
        }
    }

    /// 设备交出缓冲 `index`
    pub fn check_out(&mut self, index: u32) -> Result<BufferHandle> {
        match self.slots.get_mut(index as usize) {
            Some(slot) if *slot == Slot::Queued => {
                *slot = Slot::Outstanding;
                Ok(BufferHandle { index })
            }
            Some(_) => Err(PipelineError::DataInvalid(format!(
                "buffer #{} dequeued twice",
                index
            ))),
            None => Err(PipelineError::DataInvalid(format!("unknown buffer #{}", index))),
        }
    }

    /// 使用者归还句柄, 返回可以重新入队的缓冲号
    pub fn check_in(&mut self, handle: BufferHandle) -> Result<u32> {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot) if *slot == Slot::Outstanding => {
                *slot = Slot::Queued;
                Ok(handle.index)
            }
            Some(_) => Err(PipelineError::DataInvalid(format!(
                "buffer #{} already queued",
                handle.index
            ))),
            None => Err(PipelineError::DataInvalid(format!(
                "unknown buffer #{}",
                handle.index
            ))),
        }
    }

    /// 校验刚出队的缓冲并登记; 失败时 `requeue` 是必须立即还给设备的缓冲号
    pub fn accept(
        &mut self,
        index: u32,
        bytes_used: usize,
        mapped_len: Option<usize>,
    ) -> std::result::Result<BufferHandle, DequeueReject> {
        let Some(mapped_len) = mapped_len else {
            return Err(DequeueReject {
                requeue: None,
                error: PipelineError::DataInvalid(format!("unknown buffer #{}", index)),
            });
        };
        if bytes_used > mapped_len {
            return Err(DequeueReject {
                requeue: Some(index),
                error: PipelineError::DataInvalid(format!(
                    "buffer #{} bytesused {} beyond mapping {}",
                    index, bytes_used, mapped_len
                )),
            });
        }
        self.check_out(index).map_err(|error| DequeueReject {
            requeue: Some(index),
            error,
        })
    }

    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| **s == Slot::Outstanding).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// 出队的一帧
#[derive(Debug)]
pub struct DeviceFrame {
    pub handle: BufferHandle,
    pub bytes_used: usize,
    pub sequence: u32,
}

fn open_node(path: &Path) -> Result<File> {
    let meta = std::fs::metadata(path)
        .map_err(|e| PipelineError::FatalInit(format!("无法识别 {}: {}", path.display(), e)))?;
    if !meta.file_type().is_char_device() {
        return Err(PipelineError::FatalInit(format!(
            "{} 不是字符设备",
            path.display()
        )));
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| PipelineError::FatalInit(format!("无法打开 {}: {}", path.display(), e)))
}

fn query_caps(file: &File) -> std::io::Result<v4l2_capability> {
    // SAFETY: 全零是合法的 v4l2_capability
    let mut cap: v4l2_capability = unsafe { std::mem::zeroed() };
    unsafe { xioctl(file.as_raw_fd(), VIDIOC_QUERYCAP, &mut cap) }?;
    Ok(cap)
}

fn current_format(file: &File) -> std::io::Result<v4l2_pix_format> {
    let mut fmt = v4l2_format::capture();
    unsafe { xioctl(file.as_raw_fd(), VIDIOC_G_FMT, &mut fmt) }?;
    // SAFETY: 单平面采集类型下内核填充的是 pix 成员
    Ok(unsafe { fmt.fmt.pix })
}

/// 读取设备能力和当前格式, 不启动采集
pub fn probe(index: usize) -> Result<DeviceInfo> {
    let path = PathBuf::from(format!("/dev/video{}", index));
    let file = open_node(&path)?;
    let cap = query_caps(&file)
        .map_err(|e| PipelineError::FatalInit(format!("QUERYCAP 失败: {}", e)))?;
    let caps = cap.effective_caps();
    if caps & (V4L2_CAP_VIDEO_CAPTURE | V4L2_CAP_VIDEO_CAPTURE_MPLANE) == 0 {
        return Err(PipelineError::FatalInit(format!(
            "{} 不是采集设备",
            path.display()
        )));
    }
    let pix = current_format(&file)
        .map_err(|e| PipelineError::FatalInit(format!("G_FMT 失败: {}", e)))?;

    Ok(DeviceInfo {
        index,
        path,
        card: cap.card_name(),
        encoding: PixelEncoding::from_fourcc(pix.pixelformat),
        width: pix.width,
        height: pix.height,
    })
}

/// 枚举报告受支持像素编码的采集设备
pub fn enumerate() -> Vec<DeviceInfo> {
    log::info!("🔍 正在扫描视频设备...");
    let devices: Vec<DeviceInfo> = (0..MAX_VIDEO_NODES)
        .filter(|i| Path::new(&format!("/dev/video{}", i)).exists())
        .filter_map(|i| probe(i).ok())
        .filter(|info| info.encoding.is_supported())
        .collect();

    for info in &devices {
        log::info!(
            "   [{}] {} {:?} {}x{}",
            info.index,
            info.card,
            info.encoding,
            info.width,
            info.height
        );
    }
    log::info!("✅ 找到 {} 个可用视频设备", devices.len());
    devices
}

/// 本地采集会话
pub struct DeviceCaptureSession {
    info: DeviceInfo,
    file: File,
    maps: Vec<Mmap>,
    ledger: BufferLedger,
    bytes_per_line: u32,
    streaming: bool,
}

impl DeviceCaptureSession {
    /// 打开 `/dev/video{index}` 并启动 MMAP 流式采集
    pub fn open(index: usize) -> Result<Self> {
        let path = PathBuf::from(format!("/dev/video{}", index));
        let file = open_node(&path)?;
        let name = path.display().to_string();
        let fatal = |what: &str, e: std::io::Error| {
            PipelineError::FatalInit(format!("{} {}: {}", name, what, e))
        };

        let cap = query_caps(&file).map_err(|e| fatal("QUERYCAP", e))?;
        let caps = cap.effective_caps();
        if caps & V4L2_CAP_VIDEO_CAPTURE == 0 {
            return Err(PipelineError::FatalInit(format!(
                "{} 不支持单平面视频采集",
                path.display()
            )));
        }
        if caps & V4L2_CAP_STREAMING == 0 {
            return Err(PipelineError::FatalInit(format!(
                "{} 不支持流式 I/O",
                path.display()
            )));
        }

        reset_crop(&file);

        let pix = current_format(&file).map_err(|e| fatal("G_FMT", e))?;
        let encoding = PixelEncoding::from_fourcc(pix.pixelformat);
        if !encoding.is_supported() {
            return Err(PipelineError::FatalInit(format!(
                "{} 像素格式 {:?} 不受支持",
                path.display(),
                encoding
            )));
        }

        let mut req = v4l2_requestbuffers {
            count: DEVICE_BUFFER_COUNT,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        unsafe { xioctl(file.as_raw_fd(), VIDIOC_REQBUFS, &mut req) }
            .map_err(|e| fatal("REQBUFS", e))?;
        if req.count < 2 {
            return Err(PipelineError::FatalInit(format!(
                "{} 缓冲内存不足 ({})",
                path.display(),
                req.count
            )));
        }

        let mut maps = Vec::with_capacity(req.count as usize);
        for i in 0..req.count {
            let mut buf = v4l2_buffer::capture(i);
            unsafe { xioctl(file.as_raw_fd(), VIDIOC_QUERYBUF, &mut buf) }
                .map_err(|e| fatal("QUERYBUF", e))?;
            // SAFETY: MMAP 内存类型下内核填充 offset
            let offset = unsafe { buf.m.offset } as u64;
            // SAFETY: 映射由内核驱动拥有, 会话关闭前不会失效
            let map = unsafe {
                MmapOptions::new()
                    .offset(offset)
                    .len(buf.length as usize)
                    .map(&file)
            }
            .map_err(|e| fatal("mmap", e))?;
            maps.push(map);
        }

        let mut session = Self {
            info: DeviceInfo {
                index,
                path,
                card: cap.card_name(),
                encoding,
                width: pix.width,
                height: pix.height,
            },
            file,
            maps,
            ledger: BufferLedger::new(req.count as usize),
            bytes_per_line: pix.bytesperline,
            streaming: false,
        };

        for i in 0..req.count {
            session.queue(i).map_err(|e| fatal("QBUF", e))?;
        }
        let mut ty = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        unsafe { xioctl(session.file.as_raw_fd(), VIDIOC_STREAMON, &mut ty) }
            .map_err(|e| fatal("STREAMON", e))?;
        session.streaming = true;

        log::info!(
            "✅ 采集设备已打开: {} ({}) {:?} {}x{}, {}个缓冲",
            session.info.path.display(),
            session.info.card,
            encoding,
            pix.width,
            pix.height,
            req.count
        );
        Ok(session)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn get_resolution(&self) -> Resolution {
        Resolution::new(self.info.width, self.info.height)
    }

    fn queue(&self, index: u32) -> std::io::Result<()> {
        let mut buf = v4l2_buffer::capture(index);
        unsafe { xioctl(self.file.as_raw_fd(), VIDIOC_QBUF, &mut buf) }
    }

    /// 等待设备就绪 (最多5秒) 并出队一个已填充的缓冲
    pub fn get_frame(&mut self) -> Result<DeviceFrame> {
        let fd = self.file.as_raw_fd();
        loop {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let ready = unsafe { libc::poll(&mut pfd, 1, DEVICE_WAIT_TIMEOUT.as_millis() as i32) };
            if ready == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(PipelineError::TransientIo(format!("poll: {}", err)));
            }
            if ready == 0 {
                return Err(PipelineError::DeviceTimeout(DEVICE_WAIT_TIMEOUT.as_secs()));
            }

            let mut buf = v4l2_buffer::capture(0);
            match unsafe { xioctl(fd, VIDIOC_DQBUF, &mut buf) } {
                Ok(()) => {
                    let mapped_len = self.maps.get(buf.index as usize).map(|m| m.len());
                    return match self.ledger.accept(buf.index, buf.bytesused as usize, mapped_len) {
                        Ok(handle) => Ok(DeviceFrame {
                            handle,
                            bytes_used: buf.bytesused as usize,
                            sequence: buf.sequence,
                        }),
                        Err(rejected) => {
                            // 不能让缓冲离开采集环
                            if let Some(index) = rejected.requeue {
                                if let Err(e) = self.queue(index) {
                                    log::warn!("⚠️ QBUF #{} 失败: {}", index, e);
                                }
                            }
                            Err(rejected.error)
                        }
                    };
                }
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => continue,
                Err(e) => return Err(PipelineError::TransientIo(format!("DQBUF: {}", e))),
            }
        }
    }

    /// 出队帧的有效数据
    pub fn frame_data(&self, frame: &DeviceFrame) -> &[u8] {
        &self.maps[frame.handle.index as usize][..frame.bytes_used]
    }

    /// 把缓冲重新放回设备队列
    pub fn put_frame(&mut self, frame: DeviceFrame) -> Result<()> {
        let index = self.ledger.check_in(frame.handle)?;
        self.queue(index)
            .map_err(|e| PipelineError::TransientIo(format!("QBUF #{}: {}", index, e)))
    }

    /// 采集一帧并转换为目标尺寸的 RGB; 无论转换成败缓冲都会归还
    pub fn read_rgb(&mut self, converter: &mut FrameConverter, dst: &mut [u8]) -> Result<u32> {
        let frame = self.get_frame()?;
        let (w, h, stride) = (self.info.width, self.info.height, self.bytes_per_line);
        let data = self.frame_data(&frame);
        let converted = match self.info.encoding {
            PixelEncoding::Mjpeg => converter.convert_mjpeg(data, dst),
            PixelEncoding::Yuyv => {
                converter.convert_packed422(data, w, h, stride, Packed422::Yuyv, dst)
            }
            PixelEncoding::Uyvy => {
                converter.convert_packed422(data, w, h, stride, Packed422::Uyvy, dst)
            }
            other => Err(PipelineError::DataInvalid(format!("unsupported {:?}", other))),
        };
        self.put_frame(frame)?;
        converted
    }

    pub fn outstanding(&self) -> usize {
        self.ledger.outstanding()
    }

    /// 停止采集; 映射随会话释放
    pub fn close(&mut self) {
        if self.streaming {
            let mut ty = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
            if let Err(e) = unsafe { xioctl(self.file.as_raw_fd(), VIDIOC_STREAMOFF, &mut ty) } {
                log::warn!("⚠️ STREAMOFF 失败: {}", e);
            }
            self.streaming = false;
            log::info!("🛑 采集设备已关闭: {}", self.info.path.display());
        }
    }
}

impl Drop for DeviceCaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// 把裁剪区域恢复为默认值, 不支持时忽略
fn reset_crop(file: &File) {
    let mut cropcap = v4l2_cropcap {
        type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
        ..Default::default()
    };
    if unsafe { xioctl(file.as_raw_fd(), VIDIOC_CROPCAP, &mut cropcap) }.is_ok() {
        let mut crop = v4l2_crop {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            c: cropcap.defrect,
        };
        let _ = unsafe { xioctl(file.as_raw_fd(), VIDIOC_S_CROP, &mut crop) };
    }
}
