use crate::core::BufferedUnit;
use crate::player::buffer_worker::BufferWorker;
use crate::player::source::FrameSource;

/// 队头帧相对时钟的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadAction {
    /// 没有时间戳，或窗口已经整体落后于时钟
    Discard,
    /// 窗口 `[time, time + duration]` 包含时钟
    Deliver,
    /// 帧还在将来，等时钟追上
    Wait,
}

/// 时长缺失时的帧时长：有帧率用 `1 / frame_rate`，否则用配置的默认值
pub fn fallback_frame_duration(frame_rate: f64, default: f64) -> f64 {
    if frame_rate > 0.0 {
        1.0 / frame_rate
    } else {
        default
    }
}

pub fn classify_head(time: f64, duration: f64, clock: f64, fallback_duration: f64) -> HeadAction {
    if time < 0.0 {
        return HeadAction::Discard;
    }
    let duration = if duration > 0.0 { duration } else { fallback_duration };
    if time + duration < clock {
        HeadAction::Discard
    } else if time <= clock {
        HeadAction::Deliver
    } else {
        HeadAction::Wait
    }
}

/// 一次同步的结果
#[derive(Debug)]
pub struct SyncOutcome<U> {
    /// 窗口包含时钟的帧（已从缓冲取出）
    pub delivered: Option<U>,
    /// 被丢弃的过期帧数
    pub discarded: usize,
}

/// 以 `clock` 为准同步视频缓冲：先丢掉落后的帧，再取出窗口包含时钟的那一帧。
/// 缓冲为空或队头在将来时不取任何帧。
pub fn sync_to_clock<S: FrameSource>(
    worker: &BufferWorker<S>,
    clock: f64,
    fallback_duration: f64,
) -> SyncOutcome<S::Unit> {
    let mut discarded = 0;
    loop {
        let mut action = HeadAction::Wait;
        let popped = worker.pop_if(|head| {
            action = classify_head(head.time(), head.duration(), clock, fallback_duration);
            action != HeadAction::Wait
        });

        match (popped, action) {
            (Some(_), HeadAction::Discard) => discarded += 1,
            (Some(unit), HeadAction::Deliver) => {
                return SyncOutcome { delivered: Some(unit), discarded };
            }
            _ => return SyncOutcome { delivered: None, discarded },
        }
    }
}
