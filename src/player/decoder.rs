use crate::core::{
    default_channel_layout, AudioFormat, AudioUnit, KeyframeSide, LogCtx, PlayerError, Result,
    SampleFormat, SeekType,
};
use crate::player::source::choose_nearest;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::format::sample::{Sample, Type as SampleLayout};
use ffmpeg_next::{codec, format, software, util, ChannelLayout, Rational};
use log::{debug, trace, warn};
use std::path::Path;

/// 容器时间基（微秒）
const AV_TIME_BASE: f64 = 1_000_000.0;

/// 时间比较的容差
const TIME_EPSILON: f64 = 1e-6;

pub fn rational_to_f64(r: Rational) -> f64 {
    if r.denominator() == 0 {
        0.0
    } else {
        r.numerator() as f64 / r.denominator() as f64
    }
}

fn to_av_time(pos: f64) -> i64 {
    (pos * AV_TIME_BASE) as i64
}

/// FFmpeg 采样格式 → (格式, 是否 planar)
pub fn sample_format_from_ffmpeg(sample: Sample) -> Option<(SampleFormat, bool)> {
    let (format, layout) = match sample {
        Sample::None => return None,
        Sample::U8(layout) => (SampleFormat::U8, layout),
        Sample::I16(layout) => (SampleFormat::S16, layout),
        Sample::I32(layout) => (SampleFormat::S32, layout),
        Sample::I64(layout) => (SampleFormat::S64, layout),
        Sample::F32(layout) => (SampleFormat::F32, layout),
        Sample::F64(layout) => (SampleFormat::F64, layout),
    };
    Some((format, layout == SampleLayout::Planar))
}

pub fn sample_format_to_ffmpeg(format: SampleFormat, planar: bool) -> Sample {
    let layout = if planar { SampleLayout::Planar } else { SampleLayout::Packed };
    match format {
        SampleFormat::U8 => Sample::U8(layout),
        SampleFormat::S16 => Sample::I16(layout),
        SampleFormat::S32 => Sample::I32(layout),
        SampleFormat::S64 => Sample::I64(layout),
        SampleFormat::F32 => Sample::F32(layout),
        SampleFormat::F64 => Sample::F64(layout),
    }
}

/// 解码器的原始输出格式
pub fn audio_format_of(decoder: &codec::decoder::Audio) -> Result<AudioFormat> {
    let (sample_format, planar) = sample_format_from_ffmpeg(decoder.format())
        .ok_or_else(|| PlayerError::DecodeError(format!("不支持的采样格式: {:?}", decoder.format())))?;
    let channels = decoder.channels();
    let layout = decoder.channel_layout().bits();
    Ok(AudioFormat {
        sample_format,
        planar,
        sample_rate: decoder.rate(),
        channels,
        channel_layout: if layout == 0 { default_channel_layout(channels) } else { layout },
    })
}

/// seek 之后的第一块：整块在 `pos` 之前时丢弃，跨过 `pos` 时裁到从 `pos` 开始
pub fn trim_block(unit: AudioUnit, pos: f64, format: &AudioFormat) -> Option<AudioUnit> {
    if unit.time + unit.duration <= pos {
        return None;
    }
    if unit.time >= pos {
        return Some(unit);
    }

    let bytes_per_frame = format.bytes_per_frame();
    let rate = format.sample_rate as f64;
    let total_frames = unit.len() / bytes_per_frame;
    let skip_frames = (((pos - unit.time) * rate + TIME_EPSILON).floor() as usize).min(total_frames);
    if skip_frames == total_frames {
        return None;
    }

    let offset = skip_frames * bytes_per_frame;
    Some(AudioUnit::new(
        unit.data[offset..].to_vec(),
        unit.time + skip_frames as f64 / rate,
        (total_frames - skip_frames) as f64 / rate,
    ))
}

/// 从 `input` 读取属于 `stream_index` 的下一个包，解封装结束时返回 None
fn next_packet(input: &mut format::context::Input, stream_index: usize) -> Option<ffmpeg::Packet> {
    for (stream, packet) in input.packets() {
        if stream.index() == stream_index {
            return Some(packet);
        }
    }
    None
}

fn open_input(path: &Path) -> Result<format::context::Input> {
    format::input(&path).map_err(|e| PlayerError::OpenError(format!("无法打开文件 {}: {}", path.display(), e)))
}

/// 音频解码上下文：独立的格式句柄 + 解码器 + 重采样器
pub struct AudioDecodeContext {
    ctx: LogCtx,
    input: format::context::Input,
    stream_index: usize,
    decoder: codec::decoder::Audio,
    time_base: f64,
    output: AudioFormat,
    /// (输入采样格式, 输入声道布局, 输入采样率) → 重采样器
    resampler: Option<((Sample, u64, u32), software::resampling::Context)>,
    /// 已向解码器发送 EOF
    draining: bool,
    /// seek 后需要裁掉 `pos` 之前的数据
    skip_before: Option<f64>,
    /// 下一块的预计时间（帧没有时间戳时使用）
    next_time: f64,
}

// 解码器和重采样器不是 Send，但每个上下文同一时刻只被一个线程使用（外层 Mutex）
unsafe impl Send for AudioDecodeContext {}

impl AudioDecodeContext {
    pub fn open(path: &Path, stream_index: usize, output: AudioFormat, ctx: LogCtx) -> Result<Self> {
        let input = open_input(path)?;
        let (decoder, time_base) = {
            let stream = input
                .stream(stream_index)
                .ok_or_else(|| PlayerError::OpenError(format!("流 {} 不存在", stream_index)))?;
            let context = codec::context::Context::from_parameters(stream.parameters())?;
            (context.decoder().audio()?, rational_to_f64(stream.time_base()))
        };

        debug!(
            "{} 🎵 音频解码器: {} Hz, {} 声道, {:?} → {} Hz, {} 声道, {:?}",
            ctx,
            decoder.rate(),
            decoder.channels(),
            decoder.format(),
            output.sample_rate,
            output.channels,
            output.sample_format
        );

        Ok(Self {
            ctx,
            input,
            stream_index,
            decoder,
            time_base,
            output,
            resampler: None,
            draining: false,
            skip_before: None,
            next_time: 0.0,
        })
    }

    /// 下一块 PCM（一个包解出的所有帧拼接在一起）
    pub fn next_block(&mut self) -> Result<AudioUnit> {
        loop {
            let unit = self.decode_packet()?;
            let Some(pos) = self.skip_before else {
                return Ok(unit);
            };
            if let Some(unit) = trim_block(unit, pos, &self.output) {
                trace!("{} seek 落点 {:.3}s，首块从 {:.3}s 开始", self.ctx, pos, unit.time);
                self.skip_before = None;
                return Ok(unit);
            }
        }
    }

    fn decode_packet(&mut self) -> Result<AudioUnit> {
        loop {
            let mut data = Vec::new();
            let mut start = None;
            let mut samples = 0usize;

            // 先取出解码器里已有的帧
            loop {
                let mut decoded = util::frame::Audio::empty();
                match self.decoder.receive_frame(&mut decoded) {
                    Ok(()) => {
                        if start.is_none() {
                            start = decoded.timestamp().map(|ts| ts as f64 * self.time_base);
                        }
                        samples += self.convert_frame(&decoded, &mut data)?;
                    }
                    Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                    Err(ffmpeg::Error::Eof) => break,
                    Err(e) => {
                        warn!("{} ❌ 音频解码失败: {}", self.ctx, e);
                        return Err(PlayerError::DecodeError(e.to_string()));
                    }
                }
            }

            if samples > 0 {
                let time = start.unwrap_or(self.next_time);
                let duration = samples as f64 / self.output.sample_rate as f64;
                self.next_time = time + duration;
                return Ok(AudioUnit::new(data, time, duration));
            }
            if self.draining {
                return Err(PlayerError::EndOfStream);
            }

            match next_packet(&mut self.input, self.stream_index) {
                Some(packet) => {
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        warn!("{} ⚠️ 音频包解码失败（已跳过）: {}", self.ctx, e);
                    }
                }
                None => {
                    debug!("{} 解封装结束，冲刷音频解码器", self.ctx);
                    if let Err(e) = self.decoder.send_eof() {
                        debug!("{} send_eof 失败: {}", self.ctx, e);
                    }
                    self.draining = true;
                }
            }
        }
    }

    /// 重采样并追加到 `out`，返回输出的采样帧数
    fn convert_frame(&mut self, frame: &util::frame::Audio, out: &mut Vec<u8>) -> Result<usize> {
        let layout = if frame.channel_layout().bits() == 0 {
            ChannelLayout::default(frame.channels() as i32)
        } else {
            frame.channel_layout()
        };
        let key = (frame.format(), layout.bits(), frame.rate());

        if self.resampler.as_ref().map_or(true, |(current, _)| *current != key) {
            debug!(
                "{} 🔧 初始化音频重采样器: {:?} {}Hz/{}ch → {:?} {}Hz/{}ch",
                self.ctx,
                frame.format(),
                frame.rate(),
                frame.channels(),
                self.output.sample_format,
                self.output.sample_rate,
                self.output.channels
            );
            let context = software::resampling::Context::get(
                frame.format(),
                layout,
                frame.rate(),
                sample_format_to_ffmpeg(self.output.sample_format, false),
                ChannelLayout::from_bits_truncate(self.output.channel_layout),
                self.output.sample_rate,
            )?;
            self.resampler = Some((key, context));
        }

        let mut resampled = util::frame::Audio::empty();
        if let Some((_, resampler)) = self.resampler.as_mut() {
            resampler.run(frame, &mut resampled)?;
        }

        let samples = resampled.samples();
        let plane = resampled.data(0);
        let bytes = (samples * self.output.bytes_per_frame()).min(plane.len());
        out.extend_from_slice(&plane[..bytes]);
        Ok(bytes / self.output.bytes_per_frame())
    }

    /// 回退到 `pos` 之前的位置，后续块从 `pos` 开始
    pub fn seek(&mut self, pos: f64) -> Result<()> {
        let ts = to_av_time(pos);
        self.input.seek(ts, ..ts)?;
        self.decoder.flush();
        self.draining = false;
        self.skip_before = Some(pos);
        self.next_time = pos;
        debug!("{} 🎯 音频 seek 到 {:.3}s", self.ctx, pos);
        Ok(())
    }
}

/// 一帧解码后的视频
pub struct DecodedFrame {
    pub frame: util::frame::Video,
    /// 没有时间戳时为 -1
    pub time: f64,
    /// 0 表示未知
    pub duration: f64,
    pub key: bool,
}

/// 视频帧过滤条件
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VideoFilter {
    /// 跳过窗口整体在该时间之前的帧
    pub at_or_after: Option<f64>,
    /// 只要关键帧
    pub keyframe_only: bool,
}

impl VideoFilter {
    pub fn accepts(&self, time: f64, duration: f64, key: bool) -> bool {
        if self.keyframe_only && !key {
            return false;
        }
        match self.at_or_after {
            Some(pos) => time >= pos - TIME_EPSILON || (duration > 0.0 && time + duration > pos),
            None => true,
        }
    }
}

/// 视频解码上下文（播放和关键帧探测各用一个）
pub struct VideoDecodeContext {
    ctx: LogCtx,
    input: format::context::Input,
    stream_index: usize,
    decoder: codec::decoder::Video,
    time_base: f64,
    draining: bool,
    /// seek 扫描找到的帧，下一次取帧时先返回
    pending: Option<DecodedFrame>,
}

// 同 AudioDecodeContext
unsafe impl Send for VideoDecodeContext {}

impl VideoDecodeContext {
    pub fn open(path: &Path, stream_index: usize, ctx: LogCtx) -> Result<Self> {
        let input = open_input(path)?;
        let (decoder, time_base) = {
            let stream = input
                .stream(stream_index)
                .ok_or_else(|| PlayerError::OpenError(format!("流 {} 不存在", stream_index)))?;
            let context = codec::context::Context::from_parameters(stream.parameters())?;
            (context.decoder().video()?, rational_to_f64(stream.time_base()))
        };

        debug!(
            "{} 🎬 视频解码器: {}x{}, 格式: {:?}",
            ctx,
            decoder.width(),
            decoder.height(),
            decoder.format()
        );

        Ok(Self {
            ctx,
            input,
            stream_index,
            decoder,
            time_base,
            draining: false,
            pending: None,
        })
    }

    pub fn next_frame(&mut self) -> Result<DecodedFrame> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }

        loop {
            let mut decoded = util::frame::Video::empty();
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => return Ok(self.describe(decoded)),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    if self.draining {
                        return Err(PlayerError::EndOfStream);
                    }
                }
                Err(ffmpeg::Error::Eof) => return Err(PlayerError::EndOfStream),
                Err(e) => {
                    warn!("{} ❌ 视频解码失败: {}", self.ctx, e);
                    return Err(PlayerError::DecodeError(e.to_string()));
                }
            }

            match next_packet(&mut self.input, self.stream_index) {
                Some(packet) => {
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        warn!("{} ⚠️ 视频包解码失败（已跳过）: {}", self.ctx, e);
                    }
                }
                None => {
                    debug!("{} 解封装结束，冲刷视频解码器", self.ctx);
                    if let Err(e) = self.decoder.send_eof() {
                        debug!("{} send_eof 失败: {}", self.ctx, e);
                    }
                    self.draining = true;
                }
            }
        }
    }

    /// 取下一个满足条件的帧
    pub fn next_matching(&mut self, filter: VideoFilter) -> Result<DecodedFrame> {
        loop {
            let frame = self.next_frame()?;
            if filter.accepts(frame.time, frame.duration, frame.key) {
                return Ok(frame);
            }
            trace!("{} 跳过帧 t={:.3}s key={}", self.ctx, frame.time, frame.key);
        }
    }

    fn describe(&self, frame: util::frame::Video) -> DecodedFrame {
        let time = frame.timestamp().map_or(-1.0, |ts| ts as f64 * self.time_base);
        let duration = (frame.packet().duration.max(0)) as f64 * self.time_base;
        let key = frame.is_key();
        DecodedFrame { frame, time, duration, key }
    }

    fn seek_container(&mut self, pos: f64, forward: bool) -> Result<()> {
        let ts = to_av_time(pos);
        if forward {
            self.input.seek(ts, ts..)?;
        } else {
            self.input.seek(ts, ..ts)?;
        }
        self.decoder.flush();
        self.draining = false;
        self.pending = None;
        Ok(())
    }

    /// 定位并扫描到落点帧；落点帧留给下一次 `next_frame`
    ///
    /// 扫描读到文件尾时在 `pos - 1` 重试，直到 `pos < 0`
    pub fn seek(&mut self, pos: f64, mode: SeekType) -> Result<()> {
        let mut target = pos;
        loop {
            let filter = match mode {
                SeekType::ToPos => VideoFilter { at_or_after: Some(target), keyframe_only: false },
                SeekType::LeftKeyframe => VideoFilter { at_or_after: None, keyframe_only: true },
                SeekType::RightKeyframe => VideoFilter { at_or_after: Some(target), keyframe_only: true },
            };
            self.seek_container(target, mode == SeekType::RightKeyframe)?;

            match self.next_matching(filter) {
                Ok(frame) => {
                    debug!("{} 🎯 视频 seek {:.3}s ({:?}) 落在 {:.3}s", self.ctx, pos, mode, frame.time);
                    self.pending = Some(frame);
                    return Ok(());
                }
                Err(PlayerError::EndOfStream) => {
                    target -= 1.0;
                    if target < 0.0 {
                        return Err(PlayerError::EndOfStream);
                    }
                    debug!("{} seek 扫描到达文件尾，改在 {:.3}s 重试", self.ctx, target);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 只读包不解码：定位后找第一个关键包
    fn scan_key_packet(&mut self, t: f64, side: KeyframeSide) -> Option<f64> {
        let stream_index = self.stream_index;
        let time_base = self.time_base;
        for (stream, packet) in self.input.packets() {
            if stream.index() != stream_index || !packet.is_key() {
                continue;
            }
            let Some(pts) = packet.pts().or(packet.dts()) else {
                continue;
            };
            let time = pts as f64 * time_base;
            match side {
                KeyframeSide::Right if time < t - TIME_EPSILON => continue,
                KeyframeSide::Left if time > t + TIME_EPSILON => return None,
                _ => return Some(time),
            }
        }
        None
    }

    /// `t` 左侧 / 右侧 / 最近的关键帧位置
    ///
    /// 左侧找不到时在 `t - 1` 重试；右侧只扫描一次
    pub fn keyframe_at(&mut self, t: f64, side: KeyframeSide) -> Result<f64> {
        match side {
            KeyframeSide::Nearest => {
                let left = self.keyframe_at(t, KeyframeSide::Left).ok();
                let right = self.keyframe_at(t, KeyframeSide::Right).ok();
                choose_nearest(t, left, right).ok_or(PlayerError::EndOfStream)
            }
            KeyframeSide::Right => {
                self.seek_container(t, true)?;
                self.scan_key_packet(t, side).ok_or(PlayerError::EndOfStream)
            }
            KeyframeSide::Left => {
                let mut probe = t;
                loop {
                    self.seek_container(probe, false)?;
                    if let Some(time) = self.scan_key_packet(t, side) {
                        return Ok(time);
                    }
                    probe -= 1.0;
                    if probe < 0.0 {
                        return Err(PlayerError::EndOfStream);
                    }
                }
            }
        }
    }
}
