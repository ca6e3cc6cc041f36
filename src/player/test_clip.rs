//! 测试用的小片段：用 FFmpeg 编码器现场写一个 Matroska 文件
//!
//! - 视频：mpeg4 160x120，25fps，50 帧，每 10 帧一个关键帧（0.0 / 0.4 / 0.8 / 1.2 / 1.6）
//! - 音频：pcm_s16le 44100Hz 立体声，每包 1024 个采样帧
//! - 封面：一张 32x32 的 JPEG 附件（解封装后是 attached pic 视频流）

use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::format::sample::{Sample, Type as SampleLayout};
use ffmpeg_next::util::format::Pixel;
use ffmpeg_next::util::frame;
use ffmpeg_next::{codec, encoder, format, ChannelLayout, Dictionary, Packet, Rational};
use std::path::{Path, PathBuf};
use std::ptr;
use tempfile::TempDir;

pub const VIDEO_STREAM: usize = 0;
pub const AUDIO_STREAM: usize = 1;

pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 120;
pub const FPS: i32 = 25;
pub const FRAMES: usize = 50;
pub const GOP: usize = 10;
pub const KEYFRAMES: [f64; 5] = [0.0, 0.4, 0.8, 1.2, 1.6];

pub const SAMPLE_RATE: u32 = 44100;
pub const BLOCK_SAMPLES: usize = 1024;
pub const AUDIO_BLOCKS: usize = 86;

pub const COVER_SIZE: u32 = 32;

/// Matroska 时间戳精度是 1ms
pub const TIME_TOLERANCE: f64 = 1.5e-3;

/// 临时目录里的片段，离开作用域时删除
pub struct TestClip {
    _dir: TempDir,
    path: PathBuf,
}

impl TestClip {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn write_clip() -> TestClip {
    ffmpeg::init().expect("FFmpeg 初始化失败");
    let dir = tempfile::tempdir().expect("无法创建临时目录");
    let path = dir.path().join("clip.mkv");
    write_mkv(&path).expect("写入测试片段失败");
    TestClip { _dir: dir, path }
}

pub fn assert_time(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < TIME_TOLERANCE,
        "时间 {:.4}s，期望 {:.4}s",
        actual,
        expected
    );
}

/// 编码一张 JPEG
fn encode_cover() -> Result<Vec<u8>, ffmpeg::Error> {
    let codec = encoder::find(codec::Id::MJPEG).ok_or(ffmpeg::Error::EncoderNotFound)?;
    let mut jpeg = codec::context::Context::new_with_codec(codec).encoder().video()?;
    jpeg.set_width(COVER_SIZE);
    jpeg.set_height(COVER_SIZE);
    jpeg.set_format(Pixel::YUVJ420P);
    jpeg.set_time_base(Rational::new(1, FPS));
    let mut jpeg = jpeg.open_as(codec)?;

    let mut picture = frame::Video::new(Pixel::YUVJ420P, COVER_SIZE, COVER_SIZE);
    fill_picture(&mut picture, 200);
    picture.set_pts(Some(0));
    jpeg.send_frame(&picture)?;
    jpeg.send_eof()?;

    let mut packet = Packet::empty();
    jpeg.receive_packet(&mut packet)?;
    Ok(packet.data().map(<[u8]>::to_vec).unwrap_or_default())
}

/// 亮度取 `luma`，色度取中值
fn fill_picture(picture: &mut frame::Video, luma: u8) {
    picture.data_mut(0).fill(luma);
    picture.data_mut(1).fill(128);
    picture.data_mut(2).fill(128);
}

fn write_mkv(path: &Path) -> Result<(), ffmpeg::Error> {
    let mut octx = format::output(&path)?;
    let global_header = octx.format().flags().contains(format::Flags::GLOBAL_HEADER);

    // ========== 步骤1: 视频流 ==========
    let video_codec = encoder::find(codec::Id::MPEG4).ok_or(ffmpeg::Error::EncoderNotFound)?;
    let video_time_base = Rational::new(1, FPS);
    let mut video = codec::context::Context::new_with_codec(video_codec).encoder().video()?;
    video.set_width(WIDTH);
    video.set_height(HEIGHT);
    video.set_format(Pixel::YUV420P);
    video.set_time_base(video_time_base);
    video.set_frame_rate(Some(Rational::new(FPS, 1)));
    video.set_gop(GOP as u32);
    video.set_max_b_frames(0);
    if global_header {
        video.set_flags(codec::Flags::GLOBAL_HEADER);
    }
    // 关掉场景切换检测，关键帧只出现在 GOP 边界
    let mut options = Dictionary::new();
    options.set("sc_threshold", "1000000000");
    let mut video = video.open_as_with(video_codec, options)?;
    {
        let mut stream = octx.add_stream(video_codec)?;
        stream.set_parameters(&video);
        stream.set_time_base(video_time_base);
        stream.set_avg_frame_rate(Rational::new(FPS, 1));
    }

    // ========== 步骤2: 音频流 ==========
    let audio_codec = encoder::find(codec::Id::PCM_S16LE).ok_or(ffmpeg::Error::EncoderNotFound)?;
    let audio_time_base = Rational::new(1, SAMPLE_RATE as i32);
    let sample = Sample::I16(SampleLayout::Packed);
    let mut audio = codec::context::Context::new_with_codec(audio_codec).encoder().audio()?;
    audio.set_rate(SAMPLE_RATE as i32);
    audio.set_channel_layout(ChannelLayout::STEREO);
    audio.set_channels(2);
    audio.set_format(sample);
    audio.set_time_base(audio_time_base);
    let mut audio = audio.open_as(audio_codec)?;
    {
        let mut stream = octx.add_stream(audio_codec)?;
        stream.set_parameters(&audio);
        stream.set_time_base(audio_time_base);
    }

    // ========== 步骤3: 封面附件 ==========
    let cover = encode_cover()?;
    {
        let mjpeg = encoder::find(codec::Id::MJPEG).ok_or(ffmpeg::Error::EncoderNotFound)?;
        let mut stream = octx.add_stream(mjpeg)?;
        let mut metadata = Dictionary::new();
        metadata.set("filename", "cover.jpg");
        metadata.set("mimetype", "image/jpeg");
        stream.set_metadata(metadata);
        unsafe {
            let par = (*stream.as_mut_ptr()).codecpar;
            let padding = ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
            let buf = ffmpeg::ffi::av_mallocz(cover.len() + padding) as *mut u8;
            if buf.is_null() {
                return Err(ffmpeg::Error::Bug);
            }
            ptr::copy_nonoverlapping(cover.as_ptr(), buf, cover.len());
            (*par).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_ATTACHMENT;
            (*par).codec_id = ffmpeg::ffi::AVCodecID::AV_CODEC_ID_MJPEG;
            (*par).extradata = buf;
            (*par).extradata_size = cover.len() as i32;
        }
    }

    octx.write_header()?;
    let video_out = octx.stream(VIDEO_STREAM).map(|s| s.time_base()).ok_or(ffmpeg::Error::StreamNotFound)?;
    let audio_out = octx.stream(AUDIO_STREAM).map(|s| s.time_base()).ok_or(ffmpeg::Error::StreamNotFound)?;

    // ========== 步骤4: 按时间顺序交错编码 ==========
    let mut picture = frame::Video::new(Pixel::YUV420P, WIDTH, HEIGHT);
    let mut block = frame::Audio::new(sample, BLOCK_SAMPLES, ChannelLayout::STEREO);
    block.set_rate(SAMPLE_RATE);

    let (mut next_frame, mut next_block) = (0usize, 0usize);
    while next_frame < FRAMES || next_block < AUDIO_BLOCKS {
        let frame_time = next_frame as f64 / FPS as f64;
        let block_time = (next_block * BLOCK_SAMPLES) as f64 / SAMPLE_RATE as f64;

        if next_frame < FRAMES && (next_block >= AUDIO_BLOCKS || frame_time <= block_time) {
            fill_picture(&mut picture, 16 + (next_frame * 4) as u8);
            picture.set_pts(Some(next_frame as i64));
            video.send_frame(&picture)?;
            drain_encoder(&mut video, &mut octx, VIDEO_STREAM, video_time_base, video_out)?;
            next_frame += 1;
        } else {
            let first = next_block * BLOCK_SAMPLES;
            let data = block.data_mut(0);
            for i in 0..BLOCK_SAMPLES {
                let value = (((first + i) % 2000) as i16 - 1000).to_le_bytes();
                data[i * 4..i * 4 + 2].copy_from_slice(&value);
                data[i * 4 + 2..i * 4 + 4].copy_from_slice(&value);
            }
            block.set_pts(Some(first as i64));
            audio.send_frame(&block)?;
            drain_encoder(&mut audio, &mut octx, AUDIO_STREAM, audio_time_base, audio_out)?;
            next_block += 1;
        }
    }

    // ========== 步骤5: 冲刷编码器并写尾 ==========
    video.send_eof()?;
    drain_encoder(&mut video, &mut octx, VIDEO_STREAM, video_time_base, video_out)?;
    audio.send_eof()?;
    drain_encoder(&mut audio, &mut octx, AUDIO_STREAM, audio_time_base, audio_out)?;
    octx.write_trailer()?;
    Ok(())
}

fn drain_encoder(
    encoder: &mut encoder::Encoder,
    octx: &mut format::context::Output,
    stream_index: usize,
    from: Rational,
    to: Rational,
) -> Result<(), ffmpeg::Error> {
    let mut packet = Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(from, to);
        packet.write_interleaved(octx)?;
    }
    Ok(())
}
