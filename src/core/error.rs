use crate::core::types::MediaKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 容器无法打开或探测，load 会完全回滚
    #[error("无法打开文件: {0}")]
    OpenError(String),

    #[error("流索引越界: {kind:?} #{index}")]
    InvalidIndex { kind: MediaKind, index: usize },

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("流已结束")]
    EndOfStream,

    #[error("Seek 位置超出范围: {pos:.3}s (时长 {duration:.3}s)")]
    SeekOutOfRange { pos: f64, duration: f64 },

    /// 流不存在或未启用
    #[error("流不可用")]
    Unavailable,

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("其他错误: {0}")]
    Other(String),
}

impl PlayerError {
    /// 仅当错误是 `EndOfStream` 时返回 true
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, PlayerError::EndOfStream)
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
