use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// 流的媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    /// 附加图片（专辑封面）
    Cover,
    Subtitle,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Cover => "cover",
            MediaKind::Subtitle => "subtitle",
        };
        f.write_str(name)
    }
}

/// 视频 Seek 方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SeekType {
    /// 精确定位：回退到关键帧后向前解码到目标位置
    #[default]
    ToPos,
    /// 目标位置之前（含）的关键帧
    LeftKeyframe,
    /// 目标位置之后（含）的关键帧
    RightKeyframe,
}

/// 关键帧查找方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyframeSide {
    Left,
    Right,
    Nearest,
}

/// 音频采样格式（不区分 planar / packed，布局见 `AudioFormat::planar`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    S64,
    F32,
    F64,
}

impl SampleFormat {
    pub fn bytes(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::S64 | SampleFormat::F64 => 8,
        }
    }
}

/// 单声道 / 立体声的默认声道布局掩码
pub const CH_LAYOUT_MONO: u64 = 0x4;
pub const CH_LAYOUT_STEREO: u64 = 0x3;

/// 音频格式描述（解码输入端或归一化后的输出端）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_format: SampleFormat,
    pub planar: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub channel_layout: u64,
}

impl AudioFormat {
    pub fn bytes_per_sample(&self) -> usize {
        self.sample_format.bytes()
    }

    /// 位深
    pub fn sample_size(&self) -> usize {
        self.bytes_per_sample() * 8
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }

    /// 输出格式归一化：
    /// - planar → packed
    /// - float / double / 64 位整型 → 32 位整型
    /// - 超过 2 声道 → 立体声
    ///
    /// 采样率保持不变
    pub fn normalized(&self) -> AudioFormat {
        let sample_format = match self.sample_format {
            SampleFormat::F32 | SampleFormat::F64 | SampleFormat::S64 => SampleFormat::S32,
            other => other,
        };

        let (channels, channel_layout) = if self.channels > 2 {
            (2, CH_LAYOUT_STEREO)
        } else if self.channel_layout == 0 {
            (self.channels, default_channel_layout(self.channels))
        } else {
            (self.channels, self.channel_layout)
        };

        AudioFormat {
            sample_format,
            planar: false,
            sample_rate: self.sample_rate,
            channels,
            channel_layout,
        }
    }
}

/// 1/2 声道的默认布局，其余返回 0（交给解码库推导）
pub fn default_channel_layout(channels: u16) -> u64 {
    match channels {
        1 => CH_LAYOUT_MONO,
        2 => CH_LAYOUT_STEREO,
        _ => 0,
    }
}

/// 各类流共有的描述
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamCommon {
    /// 容器内的流索引
    pub stream_index: usize,
    /// 时长（秒）
    pub duration: f64,
    pub bit_rate: usize,
    pub codec: String,
    pub metadata: BTreeMap<String, String>,
}

impl StreamCommon {
    pub fn title(&self) -> Option<&str> {
        self.metadata.get("title").map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub common: StreamCommon,
    /// 解码器输出的原始格式
    pub input: AudioFormat,
    /// 交给音频输出的归一化格式
    pub output: AudioFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoStreamInfo {
    pub common: StreamCommon,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    /// 0 表示未知
    pub frame_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverStreamInfo {
    pub common: StreamCommon,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleStreamInfo {
    pub common: StreamCommon,
}

/// 已加载文件的流清单（可序列化，用于 --info 输出）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub path: Option<PathBuf>,
    pub audio: Vec<AudioStreamInfo>,
    pub video: Vec<VideoStreamInfo>,
    pub cover: Vec<CoverStreamInfo>,
    pub subtitle: Vec<SubtitleStreamInfo>,
}

impl MediaInfo {
    pub fn stream_count(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Audio => self.audio.len(),
            MediaKind::Video => self.video.len(),
            MediaKind::Cover => self.cover.len(),
            MediaKind::Subtitle => self.subtitle.len(),
        }
    }
}

/// 缓冲单元：按时间排序进入 BufferWorker 的输出缓冲
pub trait BufferedUnit: Send + 'static {
    /// 显示时间（秒），负数表示没有时间戳
    fn time(&self) -> f64;
    /// 持续时间（秒），0 表示未知
    fn duration(&self) -> f64;
    /// 计入缓冲阈值的权重：音频为字节数，视频为 1
    fn weight(&self) -> usize;
}

/// 一段已重采样的交错 PCM 数据
#[derive(Debug, Clone)]
pub struct AudioUnit {
    pub data: Arc<[u8]>,
    pub time: f64,
    pub duration: f64,
}

impl AudioUnit {
    pub fn new(data: Vec<u8>, time: f64, duration: f64) -> Self {
        Self {
            data: data.into(),
            time,
            duration,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl BufferedUnit for AudioUnit {
    fn time(&self) -> f64 {
        self.time
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn weight(&self) -> usize {
        self.data.len()
    }
}

/// 一帧解码后的视频
///
/// 帧本体以 `Arc` 共享给渲染端，最后一个持有者释放时才归还解码器内存
#[derive(Debug)]
pub struct VideoUnit<F> {
    pub frame: Arc<F>,
    pub time: f64,
    pub duration: f64,
}

impl<F> Clone for VideoUnit<F> {
    fn clone(&self) -> Self {
        Self {
            frame: Arc::clone(&self.frame),
            time: self.time,
            duration: self.duration,
        }
    }
}

impl<F: Send + Sync + 'static> BufferedUnit for VideoUnit<F> {
    fn time(&self) -> f64 {
        self.time
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn weight(&self) -> usize {
        1
    }
}

/// BufferWorker 状态快照（用于监控和调试）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferStatus {
    /// 缓冲中的单元数
    pub units: usize,
    /// 缓冲权重之和（音频字节数 / 视频帧数）
    pub weight: usize,
    /// 当前阈值
    pub min_threshold: usize,
    /// 排队中的请求数
    pub queued_requests: usize,
    /// 累计入队的 Decode 请求数
    pub decode_requests: u64,
    /// 已执行的解码轮次
    pub decode_passes: u64,
    pub decode_end: bool,
    pub seeking: bool,
}
