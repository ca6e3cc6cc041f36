use crate::core::{
    AudioUnit, BufferedUnit, KeyframeSide, MediaInfo, MediaKind, Result, SeekType, VideoUnit,
};
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

/// 单条流的拉取句柄
///
/// BufferWorker 的解码线程是它唯一的调用者，调用由 worker 的操作锁串行化。
/// 方法取 `&self`：句柄内部自己持有解码上下文的锁，
/// 这样 `is_available()` 可以在解码进行时被其他线程查询。
pub trait FrameSource: Send + Sync + 'static {
    type Unit: BufferedUnit + Clone;
    type SeekMode: Copy + Default + Debug + Send + 'static;

    /// 流存在并已启用
    fn is_available(&self) -> bool;

    /// 拉取下一个单元
    ///
    /// - Ok(unit): 解码成功
    /// - Err(EndOfStream): 解封装器已读完
    /// - Err(e): 不可恢复的解码错误
    fn next_unit(&self) -> Result<Self::Unit>;

    /// 清空解码器状态并定位到 `pos`（秒）
    fn seek(&self, pos: f64, mode: Self::SeekMode) -> Result<()>;

    /// 回到起点
    fn reset(&self) -> Result<()> {
        self.seek(0.0, Self::SeekMode::default())
    }

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}

/// 控制器眼中的流目录
///
/// 负责打开文件、枚举流、按流启用独立的解码上下文，
/// 以及不干扰播放读指针的关键帧探测。
pub trait MediaCatalog: Send + 'static {
    /// 解码后的视频帧（以 `Arc` 共享给渲染端）
    type Frame: Send + Sync + 'static;
    type Audio: FrameSource<Unit = AudioUnit, SeekMode = ()>;
    type Video: FrameSource<Unit = VideoUnit<Self::Frame>, SeekMode = SeekType>;

    /// 打开容器并探测流；失败返回 `OpenError`
    fn load(&mut self, path: &Path) -> Result<()>;

    fn unload(&mut self);

    fn path(&self) -> Option<&Path>;

    fn info(&self) -> &MediaInfo;

    /// 启用音频流并返回拉取句柄；重复启用返回共享同一上下文的句柄
    fn enable_audio(&mut self, index: usize) -> Result<Self::Audio>;

    /// 启用视频流（播放上下文 + 探测上下文）
    fn enable_video(&mut self, index: usize) -> Result<Self::Video>;

    fn disable(&mut self, kind: MediaKind, index: usize);

    fn is_enabled(&self, kind: MediaKind, index: usize) -> bool;

    /// 使用探测上下文查找 `t` 附近的关键帧位置（秒）
    fn locate_keyframe(&self, index: usize, t: f64, side: KeyframeSide) -> Result<f64>;

    /// 附加图片（封面）
    fn cover(&self, index: usize) -> Result<Arc<Self::Frame>>;
}

/// `Nearest` 的取舍：两侧都有取更近的一侧，距离相同取右侧；只有一侧成功时退回那一侧
pub fn choose_nearest(t: f64, left: Option<f64>, right: Option<f64>) -> Option<f64> {
    match (left, right) {
        (Some(l), Some(r)) => {
            if (t - l).abs() < (r - t).abs() {
                Some(l)
            } else {
                Some(r)
            }
        }
        (Some(l), None) => Some(l),
        (None, r) => r,
    }
}
