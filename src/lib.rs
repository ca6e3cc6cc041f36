//! 解码缓冲与音视频同步引擎
//!
//! - `player::source`：流目录和单流拉取句柄的接口
//! - `player::buffer_worker`：每条流一个解码线程，维护按时间排序的输出缓冲
//! - `player::controller`：以音频位置为主时钟，驱动视频帧的交付
//! - `player::catalog`（`ffmpeg` feature）：基于 FFmpeg 的流目录

pub mod core;
pub mod player;

pub use crate::core::{init_logging, EngineConfig, LogCtx, MediaInfo, MediaKind, PlayerError, Result};
pub use crate::player::{MediaCatalog, PlaybackController, PlayerEvent};

#[cfg(feature = "ffmpeg")]
pub use crate::player::StreamCatalog;
