use crate::core::{AudioFormat, AudioUnit, EngineConfig, LogCtx, PlayerError, Result};
use crate::player::buffer_worker::{BufferWorker, WorkerEvent, WorkerListener};
use crate::player::source::FrameSource;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 音频输出设备能力接口
///
/// 平台实现（ALSA / WASAPI / CoreAudio ...）在外部提供，引擎只依赖这个接口。
pub trait AudioSink: Send {
    /// 按归一化后的格式打开设备
    fn open(&mut self, format: &AudioFormat) -> Result<()>;

    /// 写入一个周期的交错 PCM，阻塞到设备接收为止；
    /// 写入返回的节奏就是位置上报的节奏
    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn close(&mut self) {}
}

/// 启动时选定的输出后端，每个播放器实例创建一个 sink
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;
    fn create_sink(&self) -> Result<Box<dyn AudioSink>>;
}

/// 丢弃数据的 sink，按墙上时钟模拟设备消耗速度
pub struct NullSink {
    /// None 表示不等待
    speed: Option<f64>,
    bytes_per_second: usize,
    started: Option<Instant>,
    written: u64,
}

impl NullSink {
    /// `speed` 为播放倍速，1.0 即实时
    pub fn paced(speed: f64) -> Self {
        let speed = (speed.is_finite() && speed > 0.0).then_some(speed);
        Self { speed, bytes_per_second: 0, started: None, written: 0 }
    }

    pub fn unpaced() -> Self {
        Self { speed: None, bytes_per_second: 0, started: None, written: 0 }
    }
}

impl AudioSink for NullSink {
    fn open(&mut self, format: &AudioFormat) -> Result<()> {
        if format.bytes_per_second() == 0 {
            return Err(PlayerError::AudioError(format!("无效的音频格式: {:?}", format)));
        }
        self.bytes_per_second = format.bytes_per_second();
        self.started = None;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let started = *self.started.get_or_insert_with(Instant::now);
        self.written += data.len() as u64;

        if let Some(speed) = self.speed {
            let target = self.written as f64 / (self.bytes_per_second as f64 * speed);
            let target = Duration::from_secs_f64(target);
            let elapsed = started.elapsed();
            if target > elapsed {
                thread::sleep(target - elapsed);
            }
        }
        Ok(())
    }
}

/// 创建 `NullSink` 的后端
pub struct NullBackend {
    speed: Option<f64>,
}

impl NullBackend {
    pub fn realtime() -> Self {
        Self { speed: Some(1.0) }
    }

    pub fn with_speed(speed: f64) -> Self {
        Self { speed: Some(speed) }
    }

    pub fn unpaced() -> Self {
        Self { speed: None }
    }
}

impl AudioBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn create_sink(&self) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(match self.speed {
            Some(speed) => NullSink::paced(speed),
            None => NullSink::unpaced(),
        }))
    }
}

/// 音频播放器通知
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioPlayerEvent {
    StateChanged(bool),
    PositionChanged(f64),
    SeekingChanged(bool),
    Buffered,
}

pub type AudioListener = Arc<dyn Fn(AudioPlayerEvent) + Send + Sync>;

/// 当前正在输出的数据块
struct PlaybackCursor {
    unit: AudioUnit,
    offset: usize,
}

struct PlayerShared<S: FrameSource<Unit = AudioUnit>> {
    ctx: LogCtx,
    worker: BufferWorker<S>,
    format: AudioFormat,
    period_bytes: usize,
    playing: AtomicBool,
    position: Mutex<f64>,
    /// 每次 play / stop 加一，输出线程发现代数变化就退出
    generation: AtomicU64,
    current: Mutex<Option<PlaybackCursor>>,
    listener: Option<AudioListener>,
}

impl<S: FrameSource<Unit = AudioUnit>> PlayerShared<S> {
    fn notify(&self, event: AudioPlayerEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }

    fn set_playing(&self, playing: bool) {
        if self.playing.swap(playing, Ordering::SeqCst) != playing {
            debug!("{} ▶️ 播放状态: {}", self.ctx, playing);
            self.notify(AudioPlayerEvent::StateChanged(playing));
        }
    }

    fn set_position(&self, pos: f64) {
        let mut position = self.position.lock();
        if *position != pos {
            *position = pos;
            drop(position);
            self.notify(AudioPlayerEvent::PositionChanged(pos));
        }
    }

    /// 当前块、缓冲都已耗尽且解码结束
    fn is_exhausted(&self) -> bool {
        self.current.lock().is_none()
            && !self.worker.is_seeking()
            && !self.worker.has_buffered_data()
            && self.worker.is_decode_end()
    }

    /// 用当前块和缓冲填满一个周期，返回写入字节数和周期末尾对应的时间
    fn fill(&self, chunk: &mut [u8]) -> (usize, Option<f64>) {
        let mut current = self.current.lock();
        let mut written = 0;
        let mut pos = None;

        while written < chunk.len() {
            if current.is_none() {
                // seek 期间不取数据，输出静音
                if self.worker.is_seeking() {
                    break;
                }
                match self.worker.pop() {
                    Some(unit) if unit.is_empty() => continue,
                    Some(unit) => *current = Some(PlaybackCursor { unit, offset: 0 }),
                    None => break,
                }
            }
            let Some(cursor) = current.as_mut() else { break };

            let len = cursor.unit.len();
            let n = (chunk.len() - written).min(len - cursor.offset);
            chunk[written..written + n].copy_from_slice(&cursor.unit.data[cursor.offset..cursor.offset + n]);
            cursor.offset += n;
            written += n;
            pos = Some(cursor.unit.time + cursor.unit.duration * cursor.offset as f64 / len as f64);

            if cursor.offset >= len {
                *current = None;
            }
        }

        (written, pos)
    }

    fn run_output(self: Arc<Self>, mut sink: Box<dyn AudioSink>, generation: u64) {
        info!("{} 🔊 音频输出线程启动 (周期 {} 字节)", self.ctx, self.period_bytes);
        let mut chunk = vec![0u8; self.period_bytes];

        while self.generation.load(Ordering::SeqCst) == generation {
            let (filled, pos) = self.fill(&mut chunk);
            if filled == 0 && self.is_exhausted() {
                info!("{} 🏁 音频播放完毕", self.ctx);
                break;
            }
            chunk[filled..].fill(0);

            if let Err(e) = sink.write(&chunk) {
                warn!("{} ❌ 音频写入失败: {}", self.ctx, e);
                break;
            }
            if let Some(pos) = pos {
                self.set_position(pos);
            }
        }

        sink.close();
        // 被 stop() 取代的线程不改状态
        if self.generation.load(Ordering::SeqCst) == generation {
            self.set_playing(false);
        }
        debug!("{} ⏹ 音频输出线程退出", self.ctx);
    }
}

/// 由 BufferWorker 供数的音频播放器
///
/// 播放时输出线程按周期向 sink 写数据，位置由已消耗的字节推算，
/// 位置、播放状态、seek 状态只在变化时通知。
pub struct AudioPlayer<S: FrameSource<Unit = AudioUnit>> {
    shared: Arc<PlayerShared<S>>,
    backend: Arc<dyn AudioBackend>,
    output: Option<JoinHandle<()>>,
}

impl<S: FrameSource<Unit = AudioUnit>> AudioPlayer<S> {
    pub fn new(
        source: S,
        format: AudioFormat,
        backend: Arc<dyn AudioBackend>,
        config: &EngineConfig,
        ctx: LogCtx,
        listener: Option<AudioListener>,
    ) -> Self {
        let worker_listener: Option<WorkerListener> = listener.clone().map(|l| {
            let forward: WorkerListener = Arc::new(move |event| match event {
                WorkerEvent::Buffered => l(AudioPlayerEvent::Buffered),
                WorkerEvent::SeekingChanged(seeking) => l(AudioPlayerEvent::SeekingChanged(seeking)),
            });
            forward
        });
        let worker = BufferWorker::spawn(source, ctx.child("audio-buffer"), worker_listener);

        let period_bytes = period_bytes(&format, config.audio_notify_interval());
        worker.set_min_threshold(period_bytes * config.audio_buffer_periods);

        info!(
            "{} 🎵 音频播放器: {} Hz, {} 声道, {:?}, 后端 {}",
            ctx,
            format.sample_rate,
            format.channels,
            format.sample_format,
            backend.name()
        );

        Self {
            shared: Arc::new(PlayerShared {
                ctx,
                worker,
                format,
                period_bytes,
                playing: AtomicBool::new(false),
                position: Mutex::new(0.0),
                generation: AtomicU64::new(0),
                current: Mutex::new(None),
                listener,
            }),
            backend,
            output: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.shared.worker.is_available()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    pub fn position(&self) -> f64 {
        *self.shared.position.lock()
    }

    pub fn is_seeking(&self) -> bool {
        self.shared.worker.is_seeking()
    }

    pub fn worker(&self) -> &BufferWorker<S> {
        &self.shared.worker
    }

    pub fn format(&self) -> &AudioFormat {
        &self.shared.format
    }

    /// 开始输出；已经播完时先回到起点
    pub fn play(&mut self) -> bool {
        if !self.is_available() {
            warn!("{} ⚠️ 音频流不可用，无法播放", self.shared.ctx);
            return false;
        }
        if self.is_playing() {
            return true;
        }
        self.join_output();

        if self.shared.is_exhausted() {
            self.shared.worker.reset_decoder();
        }

        let mut sink = match self.backend.create_sink() {
            Ok(sink) => sink,
            Err(e) => {
                warn!("{} ❌ 创建音频输出失败: {}", self.shared.ctx, e);
                return false;
            }
        };
        if let Err(e) = sink.open(&self.shared.format) {
            warn!("{} ❌ 打开音频输出失败: {}", self.shared.ctx, e);
            return false;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.set_playing(true);
        let shared = Arc::clone(&self.shared);
        self.output = Some(thread::spawn(move || shared.run_output(sink, generation)));
        true
    }

    pub fn stop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.join_output();
        self.shared.set_playing(false);
    }

    /// 请求 seek 并丢弃正在输出的块
    pub fn seek(&self, pos: f64) -> bool {
        let mut current = self.shared.current.lock();
        if !self.shared.worker.seek(pos, Default::default()) {
            return false;
        }
        *current = None;
        drop(current);
        self.shared.set_position(pos);
        true
    }

    fn join_output(&mut self) {
        if let Some(handle) = self.output.take() {
            if handle.join().is_err() {
                warn!("{} ⚠️ 音频输出线程异常退出", self.shared.ctx);
            }
        }
    }
}

impl<S: FrameSource<Unit = AudioUnit>> Drop for AudioPlayer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 一个输出周期的字节数（按采样帧对齐，至少一帧）
pub fn period_bytes(format: &AudioFormat, interval: Duration) -> usize {
    let frames = (format.sample_rate as f64 * interval.as_secs_f64()).floor() as usize;
    frames.max(1) * format.bytes_per_frame()
}
