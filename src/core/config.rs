use crate::core::{PlayerError, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 引擎参数
///
/// 所有字段都有默认值，JSON 中缺省的字段使用默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 纯视频播放时的节拍间隔（毫秒），40ms ≈ 25fps
    pub video_timer_interval_ms: u64,
    /// 音频输出周期（毫秒），每个周期写一次设备并上报一次位置
    pub audio_notify_interval_ms: u64,
    /// 音频最小缓冲 = 周期字节数 × 该值
    pub audio_buffer_periods: usize,
    /// 视频最小缓冲帧数，0 表示至少一帧
    pub video_min_buffer_frames: usize,
    /// 既没有帧时长也没有帧率时使用的帧时长（秒）
    pub fallback_frame_duration: f64,
    /// 关键帧列表扫描步长（秒）
    pub keyframe_scan_step: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            video_timer_interval_ms: 40,
            audio_notify_interval_ms: 10,
            audio_buffer_periods: 4,
            video_min_buffer_frames: 0,
            fallback_frame_duration: 0.04,
            keyframe_scan_step: 0.1,
        }
    }
}

impl EngineConfig {
    /// 从 JSON 文件读取配置
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| PlayerError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!("⚙️ 已加载配置: {}", path.display());
        Ok(config)
    }

    /// 读取失败时回退到默认配置
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Self::from_json_file(p).unwrap_or_else(|e| {
                warn!("⚠️ 配置读取失败，使用默认配置: {}", e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.video_timer_interval_ms == 0 {
            return Err(PlayerError::ConfigError("video_timer_interval_ms 必须大于 0".into()));
        }
        if self.audio_notify_interval_ms == 0 {
            return Err(PlayerError::ConfigError("audio_notify_interval_ms 必须大于 0".into()));
        }
        if self.audio_buffer_periods == 0 {
            return Err(PlayerError::ConfigError("audio_buffer_periods 至少为 1".into()));
        }
        if !(self.fallback_frame_duration > 0.0) {
            return Err(PlayerError::ConfigError("fallback_frame_duration 必须大于 0".into()));
        }
        if !(self.keyframe_scan_step > 0.0) {
            return Err(PlayerError::ConfigError("keyframe_scan_step 必须大于 0".into()));
        }
        Ok(())
    }

    pub fn video_timer_interval(&self) -> Duration {
        Duration::from_millis(self.video_timer_interval_ms)
    }

    pub fn audio_notify_interval(&self) -> Duration {
        Duration::from_millis(self.audio_notify_interval_ms)
    }
}
