//! 测试用的手写替身
//!
//! 源按固定步长产生时间轴上的单元，可以：
//! - 用许可数卡住解码线程（观察排队中的请求）
//! - 注入时间戳跳变和解码失败
//! - 记录 seek 位置
//!
//! `FakeCatalog` 在内存中描述一个文件，控制器测试不需要媒体文件和 FFmpeg。

use crate::core::{
    AudioFormat, AudioStreamInfo, AudioUnit, CoverStreamInfo, KeyframeSide, MediaInfo, MediaKind,
    PlayerError, Result, SampleFormat, SeekType, StreamCommon, VideoStreamInfo, VideoUnit,
    CH_LAYOUT_STEREO,
};
use crate::player::source::{choose_nearest, FrameSource, MediaCatalog};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 轮询直到条件成立或超时
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

struct TimelineState {
    next: usize,
    permits: Option<usize>,
    waiting: bool,
    produced: usize,
    fail_after: Option<usize>,
    time_jumps: HashMap<usize, f64>,
    seeks: Vec<f64>,
}

/// 固定步长的时间轴
struct Timeline {
    total: usize,
    step: f64,
    available: AtomicBool,
    state: Mutex<TimelineState>,
    cond: Condvar,
}

impl Timeline {
    fn new(total: usize, step: f64) -> Self {
        Self {
            total,
            step,
            available: AtomicBool::new(true),
            state: Mutex::new(TimelineState {
                next: 0,
                permits: None,
                waiting: false,
                produced: 0,
                fail_after: None,
                time_jumps: HashMap::new(),
                seeks: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn duration(&self) -> f64 {
        self.total as f64 * self.step
    }

    fn next_index(&self) -> Result<(usize, f64)> {
        let mut state = self.state.lock();
        while state.permits == Some(0) {
            state.waiting = true;
            self.cond.wait(&mut state);
        }
        state.waiting = false;

        if !self.available.load(Ordering::SeqCst) {
            return Err(PlayerError::Unavailable);
        }
        if let Some(limit) = state.fail_after {
            if state.produced >= limit {
                return Err(PlayerError::DecodeError("injected failure".into()));
            }
        }
        if state.next >= self.total {
            return Err(PlayerError::EndOfStream);
        }

        let index = state.next;
        state.next += 1;
        state.produced += 1;
        if let Some(permits) = state.permits.as_mut() {
            *permits -= 1;
        }
        let jump = state.time_jumps.get(&index).copied().unwrap_or(0.0);
        Ok((index, index as f64 * self.step + jump))
    }

    fn seek_to(&self, pos: f64, index: usize) -> Result<()> {
        if pos < 0.0 || pos > self.duration() {
            return Err(PlayerError::SeekOutOfRange { pos, duration: self.duration() });
        }
        let mut state = self.state.lock();
        state.next = index.min(self.total);
        state.seeks.push(pos);
        Ok(())
    }

    fn index_at(&self, pos: f64) -> usize {
        ((pos / self.step) + 1e-9).floor().max(0.0) as usize
    }

    fn set_permits(&self, permits: Option<usize>) {
        self.state.lock().permits = permits;
        self.cond.notify_all();
    }
}

/// 假的解码帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFrame {
    pub index: usize,
}

/// 视频源：`fps` 帧率、每 `gop` 帧一个关键帧
#[derive(Clone)]
pub struct FakeVideoSource {
    timeline: Arc<Timeline>,
    gop: usize,
}

impl FakeVideoSource {
    pub fn new(duration: f64, fps: f64, gop: usize) -> Self {
        let total = (duration * fps).round() as usize;
        Self {
            timeline: Arc::new(Timeline::new(total, 1.0 / fps)),
            gop: gop.max(1),
        }
    }

    pub fn duration(&self) -> f64 {
        self.timeline.duration()
    }

    /// 还能解码多少帧；None 表示不限
    pub fn set_permits(&self, permits: Option<usize>) {
        self.timeline.set_permits(permits);
    }

    /// 解码线程正卡在许可上
    pub fn waiting(&self) -> bool {
        self.timeline.state.lock().waiting
    }

    pub fn set_available(&self, available: bool) {
        self.timeline.available.store(available, Ordering::SeqCst);
    }

    pub fn inject_time_jump(&self, index: usize, offset: f64) {
        self.timeline.state.lock().time_jumps.insert(index, offset);
    }

    pub fn fail_after(&self, produced: usize) {
        self.timeline.state.lock().fail_after = Some(produced);
    }

    pub fn clear_failure(&self) {
        self.timeline.state.lock().fail_after = None;
    }

    pub fn seeks(&self) -> Vec<f64> {
        self.timeline.state.lock().seeks.clone()
    }

    /// 关键帧位置（秒）；右侧越界时为 None
    pub fn keyframe_at(&self, t: f64, side: KeyframeSide) -> Option<f64> {
        let index = self.timeline.index_at(t);
        let left = (index / self.gop) * self.gop;
        let right = if index % self.gop == 0 && (index as f64 * self.timeline.step - t).abs() < 1e-9 {
            index
        } else {
            (index / self.gop + 1) * self.gop
        };
        let to_time = |i: usize| i as f64 * self.timeline.step;
        let left = (left < self.timeline.total).then(|| to_time(left));
        let right = (right < self.timeline.total).then(|| to_time(right));
        match side {
            KeyframeSide::Left => left,
            KeyframeSide::Right => right,
            KeyframeSide::Nearest => choose_nearest(t, left, right),
        }
    }
}

impl FrameSource for FakeVideoSource {
    type Unit = VideoUnit<FakeFrame>;
    type SeekMode = SeekType;

    fn is_available(&self) -> bool {
        self.timeline.available.load(Ordering::SeqCst)
    }

    fn next_unit(&self) -> Result<Self::Unit> {
        let (index, time) = self.timeline.next_index()?;
        Ok(VideoUnit {
            frame: Arc::new(FakeFrame { index }),
            time,
            duration: self.timeline.step,
        })
    }

    fn seek(&self, pos: f64, mode: SeekType) -> Result<()> {
        let index = match mode {
            SeekType::ToPos => self.timeline.index_at(pos),
            SeekType::LeftKeyframe | SeekType::RightKeyframe => {
                let side = if mode == SeekType::LeftKeyframe { KeyframeSide::Left } else { KeyframeSide::Right };
                let t = self
                    .keyframe_at(pos, side)
                    .or_else(|| self.keyframe_at(pos, KeyframeSide::Left))
                    .unwrap_or(0.0);
                self.timeline.index_at(t)
            }
        };
        self.timeline.seek_to(pos, index)
    }

    fn description(&self) -> String {
        format!("fake video: {} frames", self.timeline.total)
    }
}

/// 音频源：每个单元 `samples_per_unit` 个采样帧
#[derive(Clone)]
pub struct FakeAudioSource {
    timeline: Arc<Timeline>,
    format: AudioFormat,
    samples_per_unit: usize,
}

impl FakeAudioSource {
    pub fn new(duration: f64, format: AudioFormat, samples_per_unit: usize) -> Self {
        let step = samples_per_unit as f64 / format.sample_rate as f64;
        let total = (duration / step).ceil() as usize;
        Self {
            timeline: Arc::new(Timeline::new(total, step)),
            format,
            samples_per_unit,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.timeline.available.store(available, Ordering::SeqCst);
    }

    pub fn seeks(&self) -> Vec<f64> {
        self.timeline.state.lock().seeks.clone()
    }

    pub fn set_permits(&self, permits: Option<usize>) {
        self.timeline.set_permits(permits);
    }
}

impl FrameSource for FakeAudioSource {
    type Unit = AudioUnit;
    type SeekMode = ();

    fn is_available(&self) -> bool {
        self.timeline.available.load(Ordering::SeqCst)
    }

    fn next_unit(&self) -> Result<AudioUnit> {
        let (index, time) = self.timeline.next_index()?;
        let len = self.samples_per_unit * self.format.bytes_per_frame();
        Ok(AudioUnit::new(vec![(index % 251) as u8; len], time, self.timeline.step))
    }

    fn seek(&self, pos: f64, _mode: ()) -> Result<()> {
        self.timeline.seek_to(pos, self.timeline.index_at(pos))
    }

    fn description(&self) -> String {
        format!("fake audio: {} blocks", self.timeline.total)
    }
}

pub fn s16_stereo(sample_rate: u32) -> AudioFormat {
    AudioFormat {
        sample_format: SampleFormat::S16,
        planar: false,
        sample_rate,
        channels: 2,
        channel_layout: CH_LAYOUT_STEREO,
    }
}

#[derive(Debug, Clone)]
pub struct FakeAudioSpec {
    pub duration: f64,
    pub format: AudioFormat,
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FakeVideoSpec {
    pub duration: f64,
    pub fps: f64,
    pub gop: usize,
    pub width: u32,
    pub height: u32,
}

/// 内存中的"文件"
#[derive(Debug, Clone, Default)]
pub struct FakeMedia {
    pub audio: Vec<FakeAudioSpec>,
    pub video: Option<FakeVideoSpec>,
    pub covers: usize,
}

impl FakeMedia {
    pub fn audio_video(duration: f64) -> Self {
        Self {
            audio: vec![FakeAudioSpec { duration, format: s16_stereo(44100), title: None }],
            video: Some(FakeVideoSpec { duration, fps: 25.0, gop: 25, width: 1280, height: 720 }),
            covers: 0,
        }
    }

    pub fn video_only(duration: f64) -> Self {
        Self {
            audio: Vec::new(),
            video: Some(FakeVideoSpec { duration, fps: 25.0, gop: 25, width: 640, height: 360 }),
            covers: 0,
        }
    }
}

/// 目录上的调用记录
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogCall {
    Load(PathBuf),
    Unload,
    Enable(MediaKind, usize),
    Disable(MediaKind, usize),
}

pub type CatalogJournal = Arc<Mutex<Vec<CatalogCall>>>;

pub struct FakeCatalog {
    media: FakeMedia,
    openable: bool,
    path: Option<PathBuf>,
    info: MediaInfo,
    audio: BTreeMap<usize, FakeAudioSource>,
    video: Option<FakeVideoSource>,
    journal: CatalogJournal,
}

impl FakeCatalog {
    pub fn new(media: FakeMedia) -> Self {
        Self {
            media,
            openable: true,
            path: None,
            info: MediaInfo::default(),
            audio: BTreeMap::new(),
            video: None,
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn unopenable() -> Self {
        Self { openable: false, ..Self::new(FakeMedia::default()) }
    }

    pub fn journal(&self) -> CatalogJournal {
        Arc::clone(&self.journal)
    }

    /// 当前启用的视频源（与解码线程共享时间轴）
    pub fn enabled_video(&self) -> Option<FakeVideoSource> {
        self.video.clone()
    }

    fn build_info(&self, path: &Path) -> MediaInfo {
        let audio = self
            .media
            .audio
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let mut metadata = BTreeMap::new();
                if let Some(title) = &spec.title {
                    metadata.insert("title".to_string(), title.clone());
                }
                AudioStreamInfo {
                    common: StreamCommon {
                        stream_index: i,
                        duration: spec.duration,
                        bit_rate: spec.format.bytes_per_second() * 8,
                        codec: "pcm_s16le".into(),
                        metadata,
                    },
                    input: spec.format,
                    output: spec.format.normalized(),
                }
            })
            .collect();

        let video = self
            .media
            .video
            .iter()
            .map(|spec| VideoStreamInfo {
                common: StreamCommon {
                    stream_index: self.media.audio.len(),
                    duration: spec.duration,
                    codec: "fake".into(),
                    ..Default::default()
                },
                width: spec.width,
                height: spec.height,
                pixel_format: "yuv420p".into(),
                frame_rate: spec.fps,
            })
            .collect();

        let cover = (0..self.media.covers)
            .map(|i| CoverStreamInfo {
                common: StreamCommon { stream_index: 10 + i, ..Default::default() },
                width: 500,
                height: 500,
            })
            .collect();

        MediaInfo {
            path: Some(path.to_path_buf()),
            audio,
            video,
            cover,
            subtitle: Vec::new(),
        }
    }

    fn record(&self, call: CatalogCall) {
        self.journal.lock().push(call);
    }
}

impl MediaCatalog for FakeCatalog {
    type Frame = FakeFrame;
    type Audio = FakeAudioSource;
    type Video = FakeVideoSource;

    fn load(&mut self, path: &Path) -> Result<()> {
        if !self.openable {
            return Err(PlayerError::OpenError(path.display().to_string()));
        }
        if self.path.as_deref() == Some(path) {
            return Ok(());
        }
        self.unload();
        self.record(CatalogCall::Load(path.to_path_buf()));
        self.info = self.build_info(path);
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    fn unload(&mut self) {
        if self.path.take().is_some() {
            self.record(CatalogCall::Unload);
        }
        for source in self.audio.values() {
            source.set_available(false);
        }
        self.audio.clear();
        if let Some(video) = self.video.take() {
            video.set_available(false);
        }
        self.info = MediaInfo::default();
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn enable_audio(&mut self, index: usize) -> Result<FakeAudioSource> {
        let spec = self
            .media
            .audio
            .get(index)
            .cloned()
            .ok_or(PlayerError::InvalidIndex { kind: MediaKind::Audio, index })?;
        if let Some(source) = self.audio.get(&index) {
            return Ok(source.clone());
        }
        self.record(CatalogCall::Enable(MediaKind::Audio, index));
        let source = FakeAudioSource::new(spec.duration, spec.format.normalized(), 1024);
        self.audio.insert(index, source.clone());
        Ok(source)
    }

    fn enable_video(&mut self, index: usize) -> Result<FakeVideoSource> {
        let spec = match (&self.media.video, index) {
            (Some(spec), 0) => spec.clone(),
            _ => return Err(PlayerError::InvalidIndex { kind: MediaKind::Video, index }),
        };
        if let Some(source) = &self.video {
            return Ok(source.clone());
        }
        self.record(CatalogCall::Enable(MediaKind::Video, index));
        let source = FakeVideoSource::new(spec.duration, spec.fps, spec.gop);
        self.video = Some(source.clone());
        Ok(source)
    }

    fn disable(&mut self, kind: MediaKind, index: usize) {
        let removed = match kind {
            MediaKind::Audio => self.audio.remove(&index).map(|s| s.set_available(false)).is_some(),
            MediaKind::Video if index == 0 => self.video.take().map(|s| s.set_available(false)).is_some(),
            _ => false,
        };
        if removed {
            self.record(CatalogCall::Disable(kind, index));
        }
    }

    fn is_enabled(&self, kind: MediaKind, index: usize) -> bool {
        match kind {
            MediaKind::Audio => self.audio.contains_key(&index),
            MediaKind::Video => index == 0 && self.video.is_some(),
            _ => false,
        }
    }

    fn locate_keyframe(&self, index: usize, t: f64, side: KeyframeSide) -> Result<f64> {
        let source = match (&self.video, index) {
            (Some(source), 0) => source,
            _ => return Err(PlayerError::InvalidIndex { kind: MediaKind::Video, index }),
        };
        if t < 0.0 || t > source.duration() {
            return Err(PlayerError::SeekOutOfRange { pos: t, duration: source.duration() });
        }
        source.keyframe_at(t, side).ok_or(PlayerError::EndOfStream)
    }

    fn cover(&self, index: usize) -> Result<Arc<FakeFrame>> {
        if index < self.media.covers {
            Ok(Arc::new(FakeFrame { index }))
        } else {
            Err(PlayerError::InvalidIndex { kind: MediaKind::Cover, index })
        }
    }
}
