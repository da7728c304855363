use anyhow::{Context, Result};
use clap::Parser;
/// 多路视频监控 + 人脸检测
///
/// 主程序入口 - 直接运行: cargo run --bin vms --release -- --config vms.json
use mimalloc::MiMalloc;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vms_pipeline::channel::{Channel, ChannelSettings, Orchestrator, FRAME_INTERVAL};
use vms_pipeline::config::VmsConfig;
use vms_pipeline::detection::{DetectionEngine, IdentityStore, Painter};
use vms_pipeline::display::{DisplaySink, HeadlessDisplay, SquareLayout};
use vms_pipeline::input::open_sources;
use vms_pipeline::ort_backend::{OrtBackend, OrtConfig, OrtEP};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 全局关闭信号: Ctrl-C / 帧数上限
static SHUTDOWN: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

/// 多路视频监控程序
#[derive(Parser, Debug)]
#[command(author, version, about = "多路视频监控 + 人脸检测", long_about = None)]
struct Args {
    /// 配置文件 (.json 或 key=value 文本)
    #[arg(short, long, default_value = "vms.cfg")]
    config: String,

    /// 覆盖配置中的窗口数量
    #[arg(long)]
    channels: Option<i64>,

    /// CUDA 设备号 (不指定则使用 CPU)
    #[arg(long)]
    cuda: Option<i32>,

    /// 每个模型的推理线程数
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// 每个通道处理多少帧后退出, 0 = 一直运行
    #[arg(long, default_value_t = 0)]
    headless_frames: u64,

    /// 监控输出间隔 (秒)
    #[arg(long, default_value_t = 5)]
    monitor_interval: u64,

    /// 把生效的配置保存为 JSON
    #[arg(long)]
    save_config: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = VmsConfig::load(&args.config)
        .with_context(|| format!("加载配置失败: {}", args.config))?;
    if let Some(n) = args.channels {
        config.num_chs = n;
        config.validate().context("--channels")?;
    }
    config.print_summary();
    if let Some(path) = &args.save_config {
        config.save(path)?;
    }

    let layout = SquareLayout::new(config.channels(), config.screen_width, config.screen_height)?;
    let display = Arc::new(HeadlessDisplay::new(&layout)?);

    // 输入源并行打开, 失败的窗口保持空闲
    let sources = open_sources(
        &config.sources,
        &layout.resolutions(),
        &config.source_options(),
        &SHUTDOWN,
    );

    let painter = if config.font_path.is_empty() {
        Painter::default()
    } else {
        Painter::with_font_file(&config.font_path)
    };
    let identities = Arc::new(RwLock::new(IdentityStore::default()));
    let mut ort_config = OrtConfig::new(&config.model_path);
    ort_config.intra_threads = args.threads;
    if let Some(device_id) = args.cuda {
        ort_config.ep = OrtEP::Cuda(device_id);
    }

    let mut channels = Vec::new();
    for (id, source) in sources.into_iter().enumerate() {
        let Some(source) = source else {
            log::info!("⏸️ 通道{} 空闲", id);
            continue;
        };
        let backend = OrtBackend::build(&ort_config)
            .with_context(|| format!("通道{} 模型加载失败", id))?;
        let engine = DetectionEngine::new(Box::new(backend))
            .with_thresholds(config.inf_confidence, config.inf_iou)?
            .with_painter(painter.clone())
            .with_identities(Arc::clone(&identities));
        channels.push(Channel::new(
            id,
            display.viewer_width(id),
            display.viewer_height(id),
            source,
            engine,
        ));
    }
    if channels.is_empty() {
        log::warn!("⚠️ 没有可用的输入源, 退出");
        return Ok(());
    }

    let flag = Arc::clone(&SHUTDOWN);
    ctrlc::set_handler(move || {
        log::info!("🛑 收到退出信号, 正在停止...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("设置 Ctrl-C 处理失败")?;

    let settings = ChannelSettings {
        default_confidence: config.inf_confidence,
        device_timeout_policy: config.device_timeout_policy,
        max_frames: args.headless_frames,
        frame_interval: FRAME_INTERVAL,
    };
    let sink: Arc<dyn DisplaySink> = display.clone();
    let mut orchestrator = Orchestrator::start(channels, sink, settings, Arc::clone(&SHUTDOWN))?;
    orchestrator.attach_monitor(args.monitor_interval)?;

    while !SHUTDOWN.load(Ordering::Relaxed) && !orchestrator.all_finished() {
        thread::sleep(Duration::from_millis(100));
    }

    let total = orchestrator.frame_count();
    for (id, exit) in orchestrator.shutdown() {
        log::info!("通道{} 退出: {:?} ({} 帧)", id, exit, display.published(id));
    }
    log::info!("✅ 共处理 {} 帧", total);
    Ok(())
}
