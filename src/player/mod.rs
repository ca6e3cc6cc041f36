// 播放器核心模块

pub mod source;         // 流目录 / 拉取句柄接口
pub mod buffer_worker;  // 解码线程 + 输出缓冲
pub mod sync;           // 音视频同步规则
pub mod audio_player;   // 音频输出适配
pub mod controller;     // 播放控制

#[cfg(feature = "ffmpeg")]
pub mod decoder;
#[cfg(feature = "ffmpeg")]
pub mod catalog;

#[cfg(test)]
pub mod testing;
#[cfg(all(test, feature = "ffmpeg"))]
pub mod test_clip;

pub use audio_player::{AudioBackend, AudioPlayer, AudioPlayerEvent, AudioSink, NullBackend, NullSink};
pub use buffer_worker::{BufferWorker, WorkerEvent};
pub use controller::{PlaybackController, PlayerEvent};
pub use source::{FrameSource, MediaCatalog};

#[cfg(feature = "ffmpeg")]
pub use catalog::{AudioStream, StreamCatalog, VideoStream};
#[cfg(feature = "ffmpeg")]
pub use decoder::VideoFilter;
