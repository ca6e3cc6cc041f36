use crate::core::{
    AudioStreamInfo, AudioUnit, CoverStreamInfo, EngineConfig, KeyframeSide, LogCtx, MediaInfo,
    MediaKind, PlayerError, Result, SeekType, StreamCommon, SubtitleStreamInfo, VideoStreamInfo,
    VideoUnit,
};
use crate::player::decoder::{
    audio_format_of, rational_to_f64, AudioDecodeContext, VideoDecodeContext, VideoFilter,
};
use crate::player::source::{FrameSource, MediaCatalog};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::stream::Disposition;
use ffmpeg_next::{codec, format, media, util};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 封面最多在文件开头这么多个包里找
const COVER_PACKET_LIMIT: usize = 256;

/// 一条已启用流的解码上下文
///
/// 解码线程通过 `with` 独占使用；`enabled` 可以在解码进行时无锁查询
struct StreamHandle<D> {
    enabled: AtomicBool,
    context: Mutex<Option<D>>,
    duration: f64,
    label: String,
}

impl<D> StreamHandle<D> {
    fn new(context: D, duration: f64, label: String) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            context: Mutex::new(Some(context)),
            duration,
            label,
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn with<T>(&self, f: impl FnOnce(&mut D) -> Result<T>) -> Result<T> {
        if !self.is_enabled() {
            return Err(PlayerError::Unavailable);
        }
        let mut guard = self.context.lock();
        let context = guard.as_mut().ok_or(PlayerError::Unavailable)?;
        f(context)
    }

    fn check_range(&self, pos: f64) -> Result<()> {
        if !(pos >= 0.0) || pos > self.duration {
            return Err(PlayerError::SeekOutOfRange { pos, duration: self.duration });
        }
        Ok(())
    }

    /// 等正在进行的解码结束后关闭上下文
    fn close(&self) {
        self.enabled.store(false, Ordering::Release);
        self.context.lock().take();
    }
}

/// 音频流拉取句柄
#[derive(Clone)]
pub struct AudioStream(Arc<StreamHandle<AudioDecodeContext>>);

impl FrameSource for AudioStream {
    type Unit = AudioUnit;
    type SeekMode = ();

    fn is_available(&self) -> bool {
        self.0.is_enabled()
    }

    fn next_unit(&self) -> Result<AudioUnit> {
        self.0.with(|context| context.next_block())
    }

    fn seek(&self, pos: f64, _mode: ()) -> Result<()> {
        self.0.check_range(pos)?;
        self.0.with(|context| context.seek(pos))
    }

    fn description(&self) -> String {
        self.0.label.clone()
    }
}

/// 视频流拉取句柄（播放上下文）
#[derive(Clone)]
pub struct VideoStream(Arc<StreamHandle<VideoDecodeContext>>);

impl VideoStream {
    fn next_matching(&self, filter: VideoFilter) -> Result<VideoUnit<util::frame::Video>> {
        self.0.with(|context| context.next_matching(filter)).map(|decoded| VideoUnit {
            frame: Arc::new(decoded.frame),
            time: decoded.time,
            duration: decoded.duration,
        })
    }
}

impl FrameSource for VideoStream {
    type Unit = VideoUnit<util::frame::Video>;
    type SeekMode = SeekType;

    fn is_available(&self) -> bool {
        self.0.is_enabled()
    }

    fn next_unit(&self) -> Result<Self::Unit> {
        self.next_matching(VideoFilter::default())
    }

    fn seek(&self, pos: f64, mode: SeekType) -> Result<()> {
        self.0.check_range(pos)?;
        self.0.with(|context| context.seek(pos, mode))
    }

    fn description(&self) -> String {
        self.0.label.clone()
    }
}

/// 已启用的视频流：播放上下文 + 关键帧探测上下文
struct VideoEntry {
    playback: VideoStream,
    probe: Mutex<VideoDecodeContext>,
}

/// 基于 FFmpeg 的流目录
///
/// `load` 只用一个临时的格式句柄探测流信息和解码封面，随后关闭；
/// 每条启用的流各自打开独立的格式句柄和解码器，互不影响读指针。
pub struct StreamCatalog {
    ctx: LogCtx,
    keyframe_scan_step: f64,
    path: Option<PathBuf>,
    info: MediaInfo,
    audio: BTreeMap<usize, AudioStream>,
    video: BTreeMap<usize, VideoEntry>,
    covers: Vec<Option<Arc<util::frame::Video>>>,
}

impl StreamCatalog {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ctx: LogCtx::new("catalog"),
            keyframe_scan_step: config.keyframe_scan_step,
            path: None,
            info: MediaInfo::default(),
            audio: BTreeMap::new(),
            video: BTreeMap::new(),
            covers: Vec::new(),
        }
    }

    fn loaded_path(&self) -> Result<&Path> {
        self.path.as_deref().ok_or(PlayerError::Unavailable)
    }

    fn audio_stream(&self, index: usize) -> Result<&AudioStream> {
        self.audio.get(&index).ok_or(PlayerError::Unavailable)
    }

    fn video_entry(&self, index: usize) -> Result<&VideoEntry> {
        self.video.get(&index).ok_or(PlayerError::Unavailable)
    }

    pub fn next_audio_frame(&self, index: usize) -> Result<AudioUnit> {
        self.audio_stream(index)?.next_unit()
    }

    pub fn next_video_frame(&self, index: usize, filter: VideoFilter) -> Result<VideoUnit<util::frame::Video>> {
        self.video_entry(index)?.playback.next_matching(filter)
    }

    pub fn seek_audio(&self, index: usize, pos: f64) -> Result<()> {
        self.audio_stream(index)?.seek(pos, ())
    }

    pub fn seek_video(&self, index: usize, pos: f64, mode: SeekType) -> Result<()> {
        self.video_entry(index)?.playback.seek(pos, mode)
    }

    /// 从 0 到时长逐个找右侧关键帧；没有前进时停止
    pub fn keyframe_positions(&self, index: usize) -> Result<Vec<f64>> {
        let entry = self.video_entry(index)?;
        let duration = entry.playback.0.duration;
        let step = self.keyframe_scan_step;
        let mut probe = entry.probe.lock();

        let mut positions: Vec<f64> = Vec::new();
        let mut t = 0.0;
        while t <= duration {
            let Ok(keyframe) = probe.keyframe_at(t, KeyframeSide::Right) else {
                break;
            };
            if positions.last().map_or(false, |last| keyframe <= *last) {
                break;
            }
            positions.push(keyframe);
            t = keyframe + step;
        }
        debug!("{} 🔑 视频流 #{} 共 {} 个关键帧", self.ctx, index, positions.len());
        Ok(positions)
    }

    pub fn audio_stream_titles(&self) -> Vec<Option<String>> {
        self.info.audio.iter().map(|a| a.common.title().map(String::from)).collect()
    }

    pub fn cover_count(&self) -> usize {
        self.info.cover.len()
    }

    /// 解码文件开头的附加图片
    fn decode_covers(&mut self, input: &mut format::context::Input, stream_indices: &[usize]) {
        let mut decoders = BTreeMap::new();
        for (slot, &stream_index) in stream_indices.iter().enumerate() {
            let decoder = input
                .stream(stream_index)
                .ok_or(PlayerError::Unavailable)
                .and_then(|stream| {
                    let context = codec::context::Context::from_parameters(stream.parameters())?;
                    Ok(context.decoder().video()?)
                });
            match decoder {
                Ok(decoder) => {
                    decoders.insert(stream_index, (slot, decoder));
                }
                Err(e) => warn!("{} ⚠️ 封面 #{} 解码器打开失败: {}", self.ctx, slot, e),
            }
        }

        let mut remaining = decoders.len();
        for (stream, packet) in input.packets().take(COVER_PACKET_LIMIT) {
            if remaining == 0 {
                break;
            }
            let Some((slot, decoder)) = decoders.get_mut(&stream.index()) else {
                continue;
            };
            if self.covers[*slot].is_some() {
                continue;
            }
            if decoder.send_packet(&packet).is_err() || decoder.send_eof().is_err() {
                continue;
            }
            let mut frame = util::frame::Video::empty();
            if decoder.receive_frame(&mut frame).is_ok() {
                debug!("{} 🖼 封面 #{}: {}x{}", self.ctx, slot, frame.width(), frame.height());
                self.covers[*slot] = Some(Arc::new(frame));
                remaining -= 1;
            }
        }
    }
}

/// 流时长：流自己的时长，其次容器时长，都没有则为 0
fn stream_duration(stream: &format::stream::Stream, container_duration: f64) -> f64 {
    let duration = stream.duration();
    let time_base = rational_to_f64(stream.time_base());
    if duration > 0 && time_base > 0.0 {
        duration as f64 * time_base
    } else {
        container_duration
    }
}

fn stream_common(stream: &format::stream::Stream, container_duration: f64) -> StreamCommon {
    StreamCommon {
        stream_index: stream.index(),
        duration: stream_duration(stream, container_duration),
        bit_rate: 0,
        codec: stream.parameters().id().name().to_string(),
        metadata: stream
            .metadata()
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
    }
}

fn probe_video(stream: &format::stream::Stream) -> Result<codec::decoder::Video> {
    let context = codec::context::Context::from_parameters(stream.parameters())?;
    Ok(context.decoder().video()?)
}

impl MediaCatalog for StreamCatalog {
    type Frame = util::frame::Video;
    type Audio = AudioStream;
    type Video = VideoStream;

    fn load(&mut self, path: &Path) -> Result<()> {
        if self.path.as_deref() == Some(path) {
            return Ok(());
        }
        if self.path.is_some() {
            self.unload();
        }
        info!("{} 📂 探测文件: {}", self.ctx, path.display());

        if !path.exists() {
            return Err(PlayerError::OpenError(format!("文件不存在: {}", path.display())));
        }
        let mut input =
            format::input(&path).map_err(|e| PlayerError::OpenError(format!("无法打开文件: {}", e)))?;

        let container_duration = if input.duration() > 0 {
            input.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
        } else {
            0.0
        };

        let mut info = MediaInfo {
            path: Some(path.to_path_buf()),
            ..Default::default()
        };
        let mut cover_streams = Vec::new();

        for stream in input.streams() {
            let common = stream_common(&stream, container_duration);
            match stream.parameters().medium() {
                media::Type::Video if stream.disposition().contains(Disposition::ATTACHED_PIC) => {
                    let (width, height) = probe_video(&stream).map_or((0, 0), |d| (d.width(), d.height()));
                    cover_streams.push(stream.index());
                    info.cover.push(CoverStreamInfo { common, width, height });
                }
                media::Type::Video => match probe_video(&stream) {
                    Ok(decoder) => info.video.push(VideoStreamInfo {
                        common,
                        width: decoder.width(),
                        height: decoder.height(),
                        pixel_format: format!("{:?}", decoder.format()).to_lowercase(),
                        frame_rate: rational_to_f64(stream.rate()),
                    }),
                    Err(e) => warn!("{} ⚠️ 跳过无法解码的视频流 {}: {}", self.ctx, stream.index(), e),
                },
                media::Type::Audio => {
                    let probed = codec::context::Context::from_parameters(stream.parameters())
                        .and_then(|context| context.decoder().audio())
                        .map_err(PlayerError::from)
                        .and_then(|decoder| Ok((audio_format_of(&decoder)?, decoder.bit_rate())));
                    match probed {
                        Ok((input_format, bit_rate)) => info.audio.push(AudioStreamInfo {
                            common: StreamCommon { bit_rate, ..common },
                            input: input_format,
                            output: input_format.normalized(),
                        }),
                        Err(e) => warn!("{} ⚠️ 跳过无法解码的音频流 {}: {}", self.ctx, stream.index(), e),
                    }
                }
                media::Type::Subtitle => info.subtitle.push(SubtitleStreamInfo { common }),
                _ => {}
            }
        }

        self.covers = vec![None; cover_streams.len()];
        if !cover_streams.is_empty() {
            self.decode_covers(&mut input, &cover_streams);
        }

        info!(
            "{} ✅ 流: {} 音频, {} 视频, {} 封面, {} 字幕",
            self.ctx,
            info.audio.len(),
            info.video.len(),
            info.cover.len(),
            info.subtitle.len()
        );
        self.info = info;
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    fn unload(&mut self) {
        for stream in self.audio.values() {
            stream.0.close();
        }
        for entry in self.video.values() {
            entry.playback.0.close();
        }
        self.audio.clear();
        self.video.clear();
        self.covers.clear();
        self.info = MediaInfo::default();
        if let Some(path) = self.path.take() {
            debug!("{} 🗑️ 关闭: {}", self.ctx, path.display());
        }
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn enable_audio(&mut self, index: usize) -> Result<AudioStream> {
        let stream_info = self
            .info
            .audio
            .get(index)
            .ok_or(PlayerError::InvalidIndex { kind: MediaKind::Audio, index })?;
        if let Some(stream) = self.audio.get(&index) {
            return Ok(stream.clone());
        }

        let context = AudioDecodeContext::open(
            self.loaded_path()?,
            stream_info.common.stream_index,
            stream_info.output,
            LogCtx::for_stream("audio-decoder", index),
        )?;
        let label = format!("audio#{} ({})", index, stream_info.common.codec);
        let stream = AudioStream(Arc::new(StreamHandle::new(context, stream_info.common.duration, label)));
        info!("{} 🔊 启用音频流 #{}", self.ctx, index);
        self.audio.insert(index, stream.clone());
        Ok(stream)
    }

    fn enable_video(&mut self, index: usize) -> Result<VideoStream> {
        let stream_info = self
            .info
            .video
            .get(index)
            .ok_or(PlayerError::InvalidIndex { kind: MediaKind::Video, index })?;
        if let Some(entry) = self.video.get(&index) {
            return Ok(entry.playback.clone());
        }

        let path = self.loaded_path()?;
        let stream_index = stream_info.common.stream_index;
        let playback = VideoDecodeContext::open(path, stream_index, LogCtx::for_stream("video-decoder", index))?;
        let probe = VideoDecodeContext::open(path, stream_index, LogCtx::for_stream("video-probe", index))?;
        let label = format!("video#{} ({} {}x{})", index, stream_info.common.codec, stream_info.width, stream_info.height);
        let playback = VideoStream(Arc::new(StreamHandle::new(playback, stream_info.common.duration, label)));

        info!("{} 🎬 启用视频流 #{}", self.ctx, index);
        self.video.insert(
            index,
            VideoEntry {
                playback: playback.clone(),
                probe: Mutex::new(probe),
            },
        );
        Ok(playback)
    }

    fn disable(&mut self, kind: MediaKind, index: usize) {
        let closed = match kind {
            MediaKind::Audio => self.audio.remove(&index).map(|stream| stream.0.close()).is_some(),
            MediaKind::Video => self.video.remove(&index).map(|entry| entry.playback.0.close()).is_some(),
            _ => false,
        };
        if closed {
            info!("{} 关闭 {} 流 #{}", self.ctx, kind, index);
        }
    }

    fn is_enabled(&self, kind: MediaKind, index: usize) -> bool {
        match kind {
            MediaKind::Audio => self.audio.contains_key(&index),
            MediaKind::Video => self.video.contains_key(&index),
            _ => false,
        }
    }

    fn locate_keyframe(&self, index: usize, t: f64, side: KeyframeSide) -> Result<f64> {
        let entry = self.video_entry(index)?;
        entry.playback.0.check_range(t)?;
        entry.probe.lock().keyframe_at(t, side)
    }

    fn cover(&self, index: usize) -> Result<Arc<util::frame::Video>> {
        match self.covers.get(index) {
            Some(Some(frame)) => Ok(Arc::clone(frame)),
            Some(None) => Err(PlayerError::DecodeError(format!("封面 #{} 解码失败", index))),
            None => Err(PlayerError::InvalidIndex { kind: MediaKind::Cover, index }),
        }
    }
}
