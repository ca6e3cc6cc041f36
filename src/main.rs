use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use myy_engine::player::NullBackend;
use myy_engine::{init_logging, EngineConfig, MediaCatalog, PlaybackController, PlayerEvent, StreamCatalog};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "用法: myy_engine <file> [--info] [--seek SECS] [--audio-stream N] [--config FILE]";

#[derive(Debug, Default)]
struct Args {
    file: PathBuf,
    info: bool,
    seek: Option<f64>,
    audio_stream: Option<usize>,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut file = None;
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--info" => args.info = true,
            "--seek" => {
                let value = iter.next().ok_or_else(|| anyhow!("--seek 缺少参数"))?;
                args.seek = Some(value.parse().with_context(|| format!("无效的 seek 位置: {}", value))?);
            }
            "--audio-stream" => {
                let value = iter.next().ok_or_else(|| anyhow!("--audio-stream 缺少参数"))?;
                args.audio_stream = Some(value.parse().with_context(|| format!("无效的音频流索引: {}", value))?);
            }
            "--config" => {
                args.config = Some(iter.next().ok_or_else(|| anyhow!("--config 缺少参数"))?.into());
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other if other.starts_with("--") => return Err(anyhow!("未知参数: {}\n{}", other, USAGE)),
            other => file = Some(PathBuf::from(other)),
        }
    }

    args.file = file.ok_or_else(|| anyhow!(USAGE))?;
    Ok(args)
}

fn print_info(config: &EngineConfig, args: &Args) -> Result<()> {
    let mut catalog = StreamCatalog::new(config);
    catalog.load(&args.file)?;
    println!("{}", serde_json::to_string_pretty(catalog.info())?);
    Ok(())
}

fn play(config: EngineConfig, args: &Args) -> Result<()> {
    let catalog = StreamCatalog::new(&config);
    let controller = PlaybackController::new(catalog, Arc::new(NullBackend::realtime()), config);
    let events = controller.events();

    controller.load(&args.file)?;
    info!(
        "🎬 时长 {:.3}s, 视频 {:?}, 音频流 {:?}",
        controller.duration(),
        controller.video_size(),
        controller.audio_stream_titles()
    );

    if let Some(index) = args.audio_stream {
        controller.change_audio_stream(index)?;
    }
    if let Some(pos) = args.seek {
        controller.seek(pos)?;
    }
    if !controller.play() {
        return Err(anyhow!("无法开始播放"));
    }

    let mut frames = 0u64;
    let mut last_logged = -1.0;
    loop {
        let event = match events.recv_timeout(Duration::from_secs(5)) {
            Ok(event) => event,
            Err(_) => {
                warn!("⚠️ 5 秒内没有事件，退出");
                break;
            }
        };
        match event {
            PlayerEvent::StateChanged(false) => {
                info!("🏁 播放结束，共交付 {} 帧视频", frames);
                break;
            }
            PlayerEvent::PositionChanged(pos) if pos - last_logged >= 1.0 => {
                last_logged = pos;
                info!("⏱ 位置 {:.3}s / {:.3}s", pos, controller.duration());
            }
            PlayerEvent::VideoFrameReady { unit, clock } => {
                frames += 1;
                debug!("🖼 帧 t={:.3}s 时钟 {:.3}s {}x{}", unit.time, clock, unit.frame.width(), unit.frame.height());
            }
            PlayerEvent::SeekingChanged(seeking) => debug!("seeking: {}", seeking),
            _ => {}
        }
    }

    controller.unload();
    Ok(())
}

fn main() -> Result<()> {
    init_logging();
    let args = parse_args()?;

    ffmpeg_next::init().map_err(|e| anyhow!("FFmpeg 初始化失败: {}", e))?;
    info!("✅ FFmpeg 初始化成功");

    let config = EngineConfig::load_or_default(args.config.as_deref());
    config.validate()?;

    if args.info {
        print_info(&config, &args)
    } else {
        play(config, &args)
    }
}
