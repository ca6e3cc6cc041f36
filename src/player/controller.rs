use crate::core::{
    AudioStreamInfo, AudioUnit, BufferStatus, EngineConfig, KeyframeSide, LogCtx, MediaInfo,
    MediaKind, PlayerError, Result, SeekType, VideoStreamInfo, VideoUnit,
};
use crate::player::audio_player::{AudioBackend, AudioListener, AudioPlayer, AudioPlayerEvent};
use crate::player::buffer_worker::{BufferWorker, WorkerEvent, WorkerListener};
use crate::player::source::{FrameSource, MediaCatalog};
use crate::player::sync::{fallback_frame_duration, sync_to_clock};
use crossbeam_channel::{never, select, tick, unbounded, Receiver, Sender};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 对外通知（渲染端 / 界面端从 `events()` 接收）
#[derive(Debug)]
pub enum PlayerEvent<F> {
    FileChanged(Option<PathBuf>),
    StateChanged(bool),
    PositionChanged(f64),
    /// 该帧应当显示；`clock` 是选帧时参照的时钟
    VideoFrameReady { unit: VideoUnit<F>, clock: f64 },
    SeekingChanged(bool),
    Buffered(MediaKind),
}

/// 派发线程收到的内部事件
enum ControlEvent {
    Audio { player_id: u64, event: AudioPlayerEvent },
    Video { worker_id: u64, event: WorkerEvent },
    /// 唤醒派发线程重新检查定时器状态
    Wake,
    Shutdown,
}

struct AudioSlot<A: FrameSource<Unit = AudioUnit>> {
    index: usize,
    id: u64,
    duration: f64,
    player: AudioPlayer<A>,
}

struct VideoSlot<V: FrameSource> {
    index: usize,
    id: u64,
    duration: f64,
    width: u32,
    height: u32,
    fallback_duration: f64,
    worker: BufferWorker<V>,
}

struct ControllerState<C: MediaCatalog> {
    ctx: LogCtx,
    config: EngineConfig,
    catalog: C,
    backend: Arc<dyn AudioBackend>,
    file: Option<PathBuf>,
    audio: Option<AudioSlot<C::Audio>>,
    video: Option<VideoSlot<C::Video>>,
    /// 最近一次通知出去的播放状态
    playing: bool,
    /// 最近一次通知出去的 seek 状态
    seeking: bool,
    position: f64,
    /// 纯视频播放的节拍定时器
    timer_active: bool,
    /// 纯视频播放时的时钟（秒）和上次推进的时刻
    video_clock: Option<(f64, Instant)>,
    last_preview: Option<f64>,
    next_id: u64,
    control_tx: Sender<ControlEvent>,
    events_tx: Sender<PlayerEvent<C::Frame>>,
}

impl<C: MediaCatalog> ControllerState<C> {
    fn emit(&self, event: PlayerEvent<C::Frame>) {
        let _ = self.events_tx.send(event);
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn set_position(&mut self, pos: f64) {
        if self.position != pos {
            self.position = pos;
            self.emit(PlayerEvent::PositionChanged(pos));
        }
    }

    fn is_playing(&self) -> bool {
        self.audio.as_ref().map_or(false, |a| a.player.is_playing()) || self.timer_active
    }

    /// 重新计算播放状态，只有翻转时才通知
    fn check_playback_state(&mut self) {
        let playing = self.is_playing();
        if playing != self.playing {
            self.playing = playing;
            info!("{} {} 播放状态: {}", self.ctx, if playing { "▶️" } else { "⏸" }, playing);
            self.emit(PlayerEvent::StateChanged(playing));
        }
    }

    /// 音频优先，其次视频
    fn is_seeking(&self) -> bool {
        if let Some(audio) = &self.audio {
            audio.player.is_seeking()
        } else if let Some(video) = &self.video {
            video.worker.is_seeking()
        } else {
            false
        }
    }

    fn check_seeking_state(&mut self) {
        let seeking = self.is_seeking();
        if seeking != self.seeking {
            self.seeking = seeking;
            self.emit(PlayerEvent::SeekingChanged(seeking));
        }
    }

    fn duration(&self) -> f64 {
        self.audio
            .as_ref()
            .map(|a| a.duration)
            .or_else(|| self.video.as_ref().map(|v| v.duration))
            .unwrap_or(0.0)
    }

    fn stop_timer(&mut self) {
        self.timer_active = false;
        self.video_clock = None;
    }

    fn open_audio(&mut self, index: usize, info: &AudioStreamInfo) -> Result<AudioSlot<C::Audio>> {
        let source = self.catalog.enable_audio(index)?;
        let id = self.next_id();
        let tx = self.control_tx.clone();
        let listener: AudioListener = Arc::new(move |event| {
            let _ = tx.send(ControlEvent::Audio { player_id: id, event });
        });
        let player = AudioPlayer::new(
            source,
            info.output,
            Arc::clone(&self.backend),
            &self.config,
            LogCtx::for_stream("audio", index),
            Some(listener),
        );
        Ok(AudioSlot {
            index,
            id,
            duration: info.common.duration,
            player,
        })
    }

    fn open_video(&mut self, index: usize, info: &VideoStreamInfo) -> Result<VideoSlot<C::Video>> {
        let source = self.catalog.enable_video(index)?;
        let id = self.next_id();
        let tx = self.control_tx.clone();
        let listener: WorkerListener = Arc::new(move |event| {
            let _ = tx.send(ControlEvent::Video { worker_id: id, event });
        });
        let worker = BufferWorker::spawn(source, LogCtx::for_stream("video", index), Some(listener));
        worker.set_min_threshold(self.config.video_min_buffer_frames);
        Ok(VideoSlot {
            index,
            id,
            duration: info.common.duration,
            width: info.width,
            height: info.height,
            fallback_duration: fallback_frame_duration(info.frame_rate, self.config.fallback_frame_duration),
            worker,
        })
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        info!("{} 📂 打开媒体文件: {}", self.ctx, path.display());

        // ========== 步骤1: 同一文件直接返回，其他文件先卸载 ==========
        if self.file.as_deref() == Some(path) {
            return Ok(());
        }
        if self.file.is_some() {
            self.unload();
        }

        // ========== 步骤2: 探测流 ==========
        if let Err(e) = self.catalog.load(path) {
            warn!("{} ❌ 打开失败: {}", self.ctx, e);
            self.unload();
            return Err(e);
        }
        let info = self.catalog.info().clone();
        if info.audio.is_empty() && info.video.is_empty() {
            self.unload();
            return Err(PlayerError::OpenError(format!("没有音频或视频流: {}", path.display())));
        }

        // ========== 步骤3: 启用第一条音频流 ==========
        if let Some(audio_info) = info.audio.first() {
            match self.open_audio(0, audio_info) {
                Ok(slot) => self.audio = Some(slot),
                Err(e) => {
                    warn!("{} ❌ 启用音频流失败: {}", self.ctx, e);
                    self.unload();
                    return Err(e);
                }
            }
        }

        // ========== 步骤4: 启用第一条视频流 ==========
        if let Some(video_info) = info.video.first() {
            match self.open_video(0, video_info) {
                Ok(slot) => self.video = Some(slot),
                Err(e) => {
                    warn!("{} ❌ 启用视频流失败: {}", self.ctx, e);
                    self.unload();
                    return Err(e);
                }
            }
        }

        self.file = Some(path.to_path_buf());
        info!(
            "{} ✅ 加载完成: {} 条音频, {} 条视频, {} 张封面, 时长 {:.3}s",
            self.ctx,
            info.audio.len(),
            info.video.len(),
            info.cover.len(),
            self.duration()
        );
        self.emit(PlayerEvent::FileChanged(self.file.clone()));
        Ok(())
    }

    fn unload(&mut self) {
        self.stop_timer();
        // 先停输出和解码线程，再关闭解码上下文
        self.audio = None;
        self.video = None;
        self.catalog.unload();
        self.last_preview = None;

        if let Some(file) = self.file.take() {
            info!("{} 🗑️ 已卸载: {}", self.ctx, file.display());
            self.emit(PlayerEvent::FileChanged(None));
        }
        self.set_position(0.0);
        self.check_playback_state();
        self.check_seeking_state();
    }

    fn play(&mut self) -> bool {
        if self.file.is_none() {
            return false;
        }
        if self.is_playing() {
            return true;
        }

        if let Some(audio) = self.audio.as_mut() {
            // 音频播完后重新播放时，视频跟着回到起点
            let restart = audio.player.worker().is_decode_end() && !audio.player.worker().has_buffered_data();
            if !audio.player.play() {
                warn!("{} ⚠️ 音频播放启动失败", self.ctx);
            } else if restart {
                if let Some(video) = &self.video {
                    video.worker.reset_decoder();
                }
            }
        } else if let Some(video) = &self.video {
            if video.worker.is_decode_end() && !video.worker.has_buffered_data() {
                video.worker.reset_decoder();
                self.set_position(0.0);
            }
            self.timer_active = true;
            self.video_clock = None;
            let _ = self.control_tx.send(ControlEvent::Wake);
        }

        self.check_playback_state();
        self.is_playing()
    }

    fn pause(&mut self) {
        if let Some(audio) = self.audio.as_mut() {
            audio.player.stop();
        }
        self.stop_timer();
        self.check_playback_state();
    }

    /// 有视频时对齐到左侧关键帧，否则原样使用
    fn resolve_seek_pos(&self, pos: f64) -> f64 {
        let Some(video) = &self.video else { return pos };
        match self.catalog.locate_keyframe(video.index, pos, KeyframeSide::Left) {
            Ok(keyframe) => keyframe,
            Err(e) => {
                debug!("{} 关键帧定位失败，使用原始位置 {:.3}s: {}", self.ctx, pos, e);
                pos
            }
        }
    }

    fn seek(&mut self, pos: f64) -> Result<()> {
        if self.file.is_none() {
            return Err(PlayerError::Unavailable);
        }
        let duration = self.duration();
        if !(pos >= 0.0) || pos > duration {
            return Err(PlayerError::SeekOutOfRange { pos, duration });
        }

        let target = self.resolve_seek_pos(pos);
        info!("{} 🎯 Seek: {:.3}s → {:.3}s", self.ctx, pos, target);

        if let Some(audio) = &self.audio {
            audio.player.seek(target);
        }
        if let Some(video) = &self.video {
            video.worker.seek(target, SeekType::ToPos);
        }
        self.video_clock = None;
        self.last_preview = None;
        self.set_position(target);
        self.check_seeking_state();
        Ok(())
    }

    fn change_audio_stream(&mut self, index: usize) -> Result<()> {
        let current = self.audio.as_ref().map(|a| a.index).ok_or(PlayerError::Unavailable)?;
        if current == index {
            return Ok(());
        }
        let info = self
            .catalog
            .info()
            .audio
            .get(index)
            .cloned()
            .ok_or(PlayerError::InvalidIndex { kind: MediaKind::Audio, index })?;

        // ========== 步骤1: 新流先就绪，旧流保持不动 ==========
        let mut slot = self.open_audio(index, &info)?;
        if !slot.player.is_available() {
            drop(slot);
            self.catalog.disable(MediaKind::Audio, index);
            return Err(PlayerError::Unavailable);
        }

        // ========== 步骤2: 接续位置和播放状态 ==========
        if let Some(mut old) = self.audio.take() {
            let was_playing = old.player.is_playing();
            let pos = old.player.position();
            old.player.stop();
            slot.player.seek(pos);
            if was_playing {
                slot.player.play();
            }

            // ========== 步骤3: 最后才关闭旧流 ==========
            let old_index = old.index;
            drop(old);
            self.catalog.disable(MediaKind::Audio, old_index);
        }

        let format = slot.player.format();
        info!(
            "{} 🔀 音频流切换: #{} → #{} ({:?} {}Hz {}ch)",
            self.ctx, current, index, format.sample_format, format.sample_rate, format.channels
        );
        self.audio = Some(slot);
        self.check_playback_state();
        Ok(())
    }

    fn deliver_frame(&mut self, unit: VideoUnit<C::Frame>, clock: f64) {
        trace!("{} 🖼 视频帧 t={:.3}s 时钟 {:.3}s", self.ctx, unit.time, clock);
        self.emit(PlayerEvent::VideoFrameReady { unit, clock });
    }

    /// 丢弃落后的帧，交付窗口包含 `clock` 的帧
    fn sync_video_to(&mut self, clock: f64) -> Option<f64> {
        let video = self.video.as_ref()?;
        let outcome = sync_to_clock(&video.worker, clock, video.fallback_duration);
        if outcome.discarded > 0 {
            debug!("{} ⏭ 视频落后，丢弃 {} 帧 (时钟 {:.3}s)", self.ctx, outcome.discarded, clock);
        }
        let unit = outcome.delivered?;
        let time = unit.time;
        self.deliver_frame(unit, clock);
        Some(time)
    }

    fn on_video_buffered(&mut self) {
        self.emit(PlayerEvent::Buffered(MediaKind::Video));
        self.follow_video_head();
    }

    /// seek 落地后缓冲才对外可见，此时的队头需要重新处理
    fn on_seek_finished(&mut self) {
        self.check_seeking_state();
        if self.video.as_ref().map_or(false, |v| !v.worker.is_seeking()) {
            self.follow_video_head();
        }
    }

    /// 播放中按音频时钟同步；暂停时预览队头
    fn follow_video_head(&mut self) {
        if self.is_playing() {
            if self.audio.is_some() {
                let pos = self.position;
                self.sync_video_to(pos);
            }
            return;
        }

        // 暂停时预览队头，不取出
        let head = match &self.video {
            Some(video) => video.worker.peek(),
            None => None,
        };
        if let Some(head) = head {
            if head.time >= 0.0 && self.last_preview != Some(head.time) {
                self.last_preview = Some(head.time);
                let clock = self.position;
                self.deliver_frame(head, clock);
            }
        }
    }

    fn on_timer_tick(&mut self) {
        if !self.timer_active {
            return;
        }

        let (seeking, has_data, decode_end, head_time) = match &self.video {
            Some(video) => (
                video.worker.is_seeking(),
                video.worker.has_buffered_data(),
                video.worker.is_decode_end(),
                video.worker.peek().map(|u| u.time),
            ),
            None => {
                self.stop_timer();
                self.check_playback_state();
                return;
            }
        };

        if seeking {
            self.video_clock = None;
            return;
        }
        if !has_data {
            if decode_end {
                info!("{} 🏁 视频播放完毕", self.ctx);
                self.stop_timer();
                self.check_playback_state();
            }
            return;
        }

        let now = Instant::now();
        let clock = match self.video_clock {
            Some((clock, last)) => clock + now.duration_since(last).as_secs_f64(),
            None => head_time.map_or(self.position, |t| t.max(self.position)),
        };
        self.video_clock = Some((clock, now));

        if let Some(time) = self.sync_video_to(clock) {
            self.set_position(time);
        }
    }

    fn handle(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Audio { player_id, event } => {
                if self.audio.as_ref().map(|a| a.id) != Some(player_id) {
                    trace!("{} 忽略已替换播放器的事件: {:?}", self.ctx, event);
                    return;
                }
                match event {
                    AudioPlayerEvent::PositionChanged(pos) => {
                        self.sync_video_to(pos);
                        self.set_position(pos);
                    }
                    AudioPlayerEvent::StateChanged(_) => self.check_playback_state(),
                    AudioPlayerEvent::SeekingChanged(false) => self.on_seek_finished(),
                    AudioPlayerEvent::SeekingChanged(true) => self.check_seeking_state(),
                    AudioPlayerEvent::Buffered => self.emit(PlayerEvent::Buffered(MediaKind::Audio)),
                }
            }
            ControlEvent::Video { worker_id, event } => {
                if self.video.as_ref().map(|v| v.id) != Some(worker_id) {
                    return;
                }
                match event {
                    WorkerEvent::Buffered => self.on_video_buffered(),
                    WorkerEvent::SeekingChanged(false) => self.on_seek_finished(),
                    WorkerEvent::SeekingChanged(true) => self.check_seeking_state(),
                }
            }
            ControlEvent::Wake | ControlEvent::Shutdown => {}
        }
    }
}

/// 派发线程：处理播放器/解码线程的通知和纯视频播放的节拍
fn run_dispatcher<C: MediaCatalog>(
    state: Arc<Mutex<ControllerState<C>>>,
    control_rx: Receiver<ControlEvent>,
    interval: Duration,
) {
    let ctx = LogCtx::new("dispatcher");
    debug!("{} 🚀 派发线程启动", ctx);
    let mut ticker: Receiver<Instant> = never();
    let mut ticking = false;

    loop {
        select! {
            recv(control_rx) -> msg => match msg {
                Ok(ControlEvent::Shutdown) | Err(_) => break,
                Ok(event) => state.lock().handle(event),
            },
            recv(ticker) -> _ => state.lock().on_timer_tick(),
        }

        let active = state.lock().timer_active;
        if active != ticking {
            ticker = if active { tick(interval) } else { never() };
            ticking = active;
        }
    }
    debug!("{} ⏹ 派发线程退出", ctx);
}

/// 播放控制器
///
/// 音频存在时以音频位置为主时钟，视频帧按时间窗口跟随；
/// 只有视频时由定时器推进。控制调用在调用方线程执行，
/// 通知通过 `events()` 返回的 channel 送出。
pub struct PlaybackController<C: MediaCatalog> {
    state: Arc<Mutex<ControllerState<C>>>,
    control_tx: Sender<ControlEvent>,
    events_rx: Receiver<PlayerEvent<C::Frame>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl<C: MediaCatalog> PlaybackController<C> {
    pub fn new(catalog: C, backend: Arc<dyn AudioBackend>, config: EngineConfig) -> Self {
        let ctx = LogCtx::new("controller");
        info!("{} 🎮 创建播放控制器 (音频后端: {})", ctx, backend.name());

        let (control_tx, control_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let interval = config.video_timer_interval();

        let state = Arc::new(Mutex::new(ControllerState {
            ctx,
            config,
            catalog,
            backend,
            file: None,
            audio: None,
            video: None,
            playing: false,
            seeking: false,
            position: 0.0,
            timer_active: false,
            video_clock: None,
            last_preview: None,
            next_id: 0,
            control_tx: control_tx.clone(),
            events_tx,
        }));

        let dispatcher_state = Arc::clone(&state);
        let dispatcher = thread::spawn(move || run_dispatcher(dispatcher_state, control_rx, interval));

        Self {
            state,
            control_tx,
            events_rx,
            dispatcher: Some(dispatcher),
        }
    }

    /// 通知接收端（单一消费者；不读取时事件会累积）
    pub fn events(&self) -> Receiver<PlayerEvent<C::Frame>> {
        self.events_rx.clone()
    }

    /// 加载文件并启用第一条音频流和第一条视频流；任何一步失败都会完全卸载
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        self.state.lock().load(path.as_ref())
    }

    pub fn unload(&self) {
        self.state.lock().unload();
    }

    pub fn play(&self) -> bool {
        self.state.lock().play()
    }

    pub fn pause(&self) {
        self.state.lock().pause();
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().is_playing()
    }

    /// 跳转；`pos` 超出 `[0, duration]` 时不改变任何状态
    pub fn seek(&self, pos: f64) -> Result<()> {
        self.state.lock().seek(pos)
    }

    pub fn is_seeking(&self) -> bool {
        self.state.lock().is_seeking()
    }

    pub fn position(&self) -> f64 {
        self.state.lock().position
    }

    pub fn duration(&self) -> f64 {
        self.state.lock().duration()
    }

    pub fn file(&self) -> Option<PathBuf> {
        self.state.lock().file.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().file.is_some()
    }

    pub fn info(&self) -> MediaInfo {
        self.state.lock().catalog.info().clone()
    }

    pub fn change_audio_stream(&self, index: usize) -> Result<()> {
        self.state.lock().change_audio_stream(index)
    }

    pub fn change_audio_stream_by_title(&self, title: &str) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .catalog
            .info()
            .audio
            .iter()
            .position(|a| a.common.title() == Some(title))
            .ok_or_else(|| PlayerError::Other(format!("没有标题为 {} 的音频流", title)))?;
        state.change_audio_stream(index)
    }

    pub fn audio_stream_index(&self) -> Option<usize> {
        self.state.lock().audio.as_ref().map(|a| a.index)
    }

    pub fn audio_stream_titles(&self) -> Vec<Option<String>> {
        self.state
            .lock()
            .catalog
            .info()
            .audio
            .iter()
            .map(|a| a.common.title().map(String::from))
            .collect()
    }

    /// 视频宽高；没有视频时为 None
    pub fn video_size(&self) -> Option<(u32, u32)> {
        self.state.lock().video.as_ref().map(|v| (v.width, v.height))
    }

    pub fn cover_count(&self) -> usize {
        self.state.lock().catalog.info().cover.len()
    }

    pub fn cover(&self, index: usize) -> Result<Arc<C::Frame>> {
        self.state.lock().catalog.cover(index)
    }

    pub fn audio_status(&self) -> Option<BufferStatus> {
        self.state.lock().audio.as_ref().map(|a| a.player.worker().status())
    }

    pub fn video_status(&self) -> Option<BufferStatus> {
        self.state.lock().video.as_ref().map(|v| v.worker.status())
    }
}

impl<C: MediaCatalog> Drop for PlaybackController<C> {
    fn drop(&mut self) {
        let _ = self.control_tx.send(ControlEvent::Shutdown);
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                warn!("⚠️ 派发线程异常退出");
            }
        }
        self.state.lock().unload();
    }
}
