use crate::core::{BufferStatus, BufferedUnit, LogCtx};
use crate::player::source::FrameSource;
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// 解码线程请求
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Request<M> {
    Decode,
    Seek { pos: f64, mode: M },
    Quit,
}

/// BufferWorker 发出的通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// 一轮解码结束且缓冲中有数据
    Buffered,
    /// seek 状态变化（仅在值改变时发出）
    SeekingChanged(bool),
}

/// 通知回调
///
/// 可能在队列锁内被调用，回调里不能再调用同一个 worker 的方法，
/// 只应该转发（例如发到 channel）。
pub type WorkerListener = Arc<dyn Fn(WorkerEvent) + Send + Sync>;

struct RequestQueue<M> {
    requests: VecDeque<Request<M>>,
    /// 队列中有一个 Decode
    decode_queued: bool,
    /// 解码线程正在执行 Decode
    decode_running: bool,
    /// 已请求但尚未完成的 seek
    seeks_in_flight: usize,
    /// 已经发出 Quit，不再接受请求
    closed: bool,
}

impl<M> RequestQueue<M> {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            decode_queued: false,
            decode_running: false,
            seeks_in_flight: 0,
            closed: false,
        }
    }
}

/// 按时间排序的输出缓冲，尾部追加、头部取出
struct UnitBuffer<U> {
    units: VecDeque<U>,
    weight: usize,
}

impl<U: BufferedUnit + Clone> UnitBuffer<U> {
    fn new() -> Self {
        Self { units: VecDeque::new(), weight: 0 }
    }

    /// 时间早于队尾的单元被拒绝
    fn push(&mut self, unit: U) -> bool {
        if let Some(tail) = self.units.back() {
            if unit.time() < tail.time() {
                return false;
            }
        }
        self.weight += unit.weight();
        self.units.push_back(unit);
        true
    }

    fn pop(&mut self) -> Option<U> {
        let unit = self.units.pop_front()?;
        self.weight -= unit.weight();
        Some(unit)
    }

    fn clear(&mut self) {
        self.units.clear();
        self.weight = 0;
    }

    fn is_buffered(&self, min: usize) -> bool {
        if min == 0 {
            !self.units.is_empty()
        } else {
            self.weight >= min
        }
    }
}

struct Shared<S: FrameSource> {
    ctx: LogCtx,
    source: S,
    /// 操作锁：同一时刻只有一个 decode / seek / reset 在访问 source
    op_lock: Mutex<()>,
    data: Mutex<UnitBuffer<S::Unit>>,
    queue: Mutex<RequestQueue<S::SeekMode>>,
    queue_cond: Condvar,
    min_threshold: AtomicUsize,
    decode_end: AtomicBool,
    decode_requests: AtomicU64,
    decode_passes: AtomicU64,
    listener: Option<WorkerListener>,
}

impl<S: FrameSource> Shared<S> {
    fn notify(&self, event: WorkerEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }

    fn is_buffered(&self) -> bool {
        self.data.lock().is_buffered(self.min_threshold.load(Ordering::SeqCst))
    }

    fn is_seeking(&self) -> bool {
        self.queue.lock().seeks_in_flight > 0
    }

    /// 欠缓冲时补一个 Decode 请求
    ///
    /// 同一时刻最多一个 Decode 处于排队或执行中；decode-end 期间不再补。
    fn request_refill(&self) -> bool {
        if self.decode_end.load(Ordering::SeqCst) || !self.source.is_available() {
            return false;
        }
        if self.is_buffered() {
            return false;
        }

        let mut queue = self.queue.lock();
        if queue.closed || queue.decode_queued || queue.decode_running {
            return false;
        }
        queue.requests.push_back(Request::Decode);
        queue.decode_queued = true;
        self.decode_requests.fetch_add(1, Ordering::SeqCst);
        self.queue_cond.notify_one();
        trace!("{} 📥 Decode 请求入队", self.ctx);
        true
    }

    /// 解码直到达到阈值或流结束（调用方持有操作锁）
    fn decode_pass(&self) {
        if !self.source.is_available() || self.decode_end.load(Ordering::SeqCst) || self.is_buffered() {
            return;
        }
        self.decode_passes.fetch_add(1, Ordering::SeqCst);

        loop {
            if self.is_buffered() {
                self.notify(WorkerEvent::Buffered);
                return;
            }

            match self.source.next_unit() {
                Ok(unit) => {
                    self.decode_end.store(false, Ordering::SeqCst);
                    let (time, duration) = (unit.time(), unit.duration());
                    if self.data.lock().push(unit) {
                        trace!("{} 🎞 缓冲 +1: t={:.3}s d={:.3}s", self.ctx, time, duration);
                    } else {
                        debug!("{} ⚠️ 时间戳倒退，丢弃单元: t={:.3}s", self.ctx, time);
                    }
                }
                Err(e) => {
                    if e.is_end_of_stream() {
                        info!("{} 🏁 解码到达流末尾", self.ctx);
                    } else {
                        warn!("{} ❌ 解码失败，按流结束处理: {}", self.ctx, e);
                    }
                    self.decode_end.store(true, Ordering::SeqCst);
                    if !self.data.lock().units.is_empty() {
                        self.notify(WorkerEvent::Buffered);
                    }
                    return;
                }
            }
        }
    }

    /// 清空缓冲 → 定位 → 解码一轮（调用方持有操作锁）
    fn do_seek(&self, pos: f64, mode: S::SeekMode) {
        if pos < 0.0 || !self.source.is_available() {
            return;
        }
        self.data.lock().clear();

        match self.source.seek(pos, mode) {
            Ok(()) => {
                self.decode_end.store(false, Ordering::SeqCst);
                debug!("{} ⏩ Seek 完成: {:.3}s ({:?})", self.ctx, pos, mode);
            }
            Err(e) => warn!("{} ❌ Seek 失败 {:.3}s: {}", self.ctx, pos, e),
        }

        self.decode_pass();
    }

    fn finish_seek(&self) {
        let mut queue = self.queue.lock();
        queue.seeks_in_flight = queue.seeks_in_flight.saturating_sub(1);
        if queue.seeks_in_flight == 0 {
            self.notify(WorkerEvent::SeekingChanged(false));
        }
    }

    fn run(self: Arc<Self>) {
        info!("{} 🎬 解码线程启动: {}", self.ctx, self.source.description());

        loop {
            let request = {
                let mut queue = self.queue.lock();
                let request = loop {
                    if let Some(request) = queue.requests.pop_front() {
                        break request;
                    }
                    self.queue_cond.wait(&mut queue);
                };
                if let Request::Decode = request {
                    queue.decode_queued = false;
                    queue.decode_running = true;
                }
                request
            };

            match request {
                Request::Decode => {
                    {
                        let _op = self.op_lock.lock();
                        self.decode_pass();
                    }
                    self.queue.lock().decode_running = false;
                }
                Request::Seek { pos, mode } => {
                    {
                        let _op = self.op_lock.lock();
                        self.do_seek(pos, mode);
                    }
                    self.finish_seek();
                }
                Request::Quit => {
                    let mut queue = self.queue.lock();
                    queue.requests.clear();
                    queue.closed = true;
                    break;
                }
            }

            // 执行期间被消费掉的部分在这里补回
            self.request_refill();
        }

        info!("{} ⏹ 解码线程退出", self.ctx);
    }
}

/// 带独立解码线程的输出缓冲
///
/// - 调用方线程：`pop` / `peek` / `seek` / `set_min_threshold`，只在数据锁/队列锁内短暂停留
/// - 解码线程：按 FIFO 执行 Decode / Seek / Quit；seek 入队前会移除排队中的 Decode
/// - 缓冲权重低于阈值时自动补 Decode，这是唯一的回填触发点
pub struct BufferWorker<S: FrameSource> {
    shared: Arc<Shared<S>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl<S: FrameSource> BufferWorker<S> {
    /// 启动解码线程；流可用时立即请求第一轮解码
    pub fn spawn(source: S, ctx: LogCtx, listener: Option<WorkerListener>) -> Self {
        let shared = Arc::new(Shared {
            ctx,
            source,
            op_lock: Mutex::new(()),
            data: Mutex::new(UnitBuffer::new()),
            queue: Mutex::new(RequestQueue::new()),
            queue_cond: Condvar::new(),
            min_threshold: AtomicUsize::new(0),
            decode_end: AtomicBool::new(false),
            decode_requests: AtomicU64::new(0),
            decode_passes: AtomicU64::new(0),
            listener,
        });

        let thread_shared = Arc::clone(&shared);
        let thread_handle = thread::spawn(move || thread_shared.run());

        shared.request_refill();

        Self {
            shared,
            thread_handle: Some(thread_handle),
        }
    }

    pub fn is_available(&self) -> bool {
        self.shared.source.is_available()
    }

    /// 设置背压阈值（音频为字节数，视频为帧数）；负数在类型上就不存在
    pub fn set_min_threshold(&self, min: usize) {
        self.shared.min_threshold.store(min, Ordering::SeqCst);
        debug!("{} 📏 最小缓冲: {}", self.shared.ctx, min);
        self.shared.request_refill();
    }

    pub fn min_threshold(&self) -> usize {
        self.shared.min_threshold.load(Ordering::SeqCst)
    }

    pub fn is_buffered(&self) -> bool {
        self.shared.is_buffered()
    }

    pub fn has_buffered_data(&self) -> bool {
        !self.shared.is_seeking() && !self.shared.data.lock().units.is_empty()
    }

    pub fn is_decode_end(&self) -> bool {
        self.shared.decode_end.load(Ordering::SeqCst)
    }

    /// 从 `seek()` 调用开始，直到对应的 Seek 在解码线程完成
    pub fn is_seeking(&self) -> bool {
        self.shared.is_seeking()
    }

    /// 查看队头（seek 未完成时为空）
    pub fn peek(&self) -> Option<S::Unit> {
        if self.shared.is_seeking() {
            return None;
        }
        self.shared.data.lock().units.front().cloned()
    }

    /// 取出队头；低于阈值时补一个 Decode
    pub fn pop(&self) -> Option<S::Unit> {
        self.pop_if(|_| true)
    }

    /// 队头满足条件时取出（判断与取出在同一次加锁内完成）
    pub fn pop_if<F>(&self, pred: F) -> Option<S::Unit>
    where
        F: FnOnce(&S::Unit) -> bool,
    {
        if self.shared.is_seeking() {
            return None;
        }
        let unit = {
            let mut data = self.shared.data.lock();
            match data.units.front() {
                Some(head) if pred(head) => data.pop(),
                _ => None,
            }
        };
        if unit.is_some() {
            self.shared.request_refill();
        }
        unit
    }

    /// 请求 seek；流不可用、`pos < 0` 或线程已退出时返回 false
    pub fn seek(&self, pos: f64, mode: S::SeekMode) -> bool {
        if !(pos >= 0.0) || !self.is_available() {
            return false;
        }

        let mut queue = self.shared.queue.lock();
        if queue.closed {
            return false;
        }

        let before = queue.requests.len();
        queue.requests.retain(|r| !matches!(r, Request::Decode));
        if queue.requests.len() != before {
            queue.decode_queued = false;
            debug!("{} 🧹 Seek 取消了排队中的 Decode", self.shared.ctx);
        }

        queue.requests.push_back(Request::Seek { pos, mode });
        queue.seeks_in_flight += 1;
        if queue.seeks_in_flight == 1 {
            self.shared.notify(WorkerEvent::SeekingChanged(true));
        }
        self.shared.queue_cond.notify_one();
        true
    }

    /// 回到起点并清除 decode-end（在调用方线程同步执行）
    pub fn reset_decoder(&self) -> bool {
        if !self.is_available() {
            return false;
        }
        {
            let _op = self.shared.op_lock.lock();
            if let Err(e) = self.shared.source.reset() {
                warn!("{} ❌ 重置解码器失败: {}", self.shared.ctx, e);
            }
            self.shared.decode_end.store(false, Ordering::SeqCst);
            self.shared.data.lock().clear();
        }
        info!("{} 🔄 解码器已重置", self.shared.ctx);
        self.shared.request_refill();
        true
    }

    /// 发出 Quit：清空排队请求并结束解码线程；已缓冲的数据仍可取出
    pub fn quit(&self) {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            return;
        }

        let cancelled_seeks = queue
            .requests
            .iter()
            .filter(|r| matches!(r, Request::Seek { .. }))
            .count();
        queue.requests.clear();
        queue.decode_queued = false;
        if cancelled_seeks > 0 {
            queue.seeks_in_flight = queue.seeks_in_flight.saturating_sub(cancelled_seeks);
            if queue.seeks_in_flight == 0 {
                self.shared.notify(WorkerEvent::SeekingChanged(false));
            }
        }

        queue.requests.push_back(Request::Quit);
        queue.closed = true;
        self.shared.queue_cond.notify_one();
        debug!("{} ⏹ Quit 已入队", self.shared.ctx);
    }

    pub fn status(&self) -> BufferStatus {
        let (units, weight) = {
            let data = self.shared.data.lock();
            (data.units.len(), data.weight)
        };
        let queue = self.shared.queue.lock();
        BufferStatus {
            units,
            weight,
            min_threshold: self.min_threshold(),
            queued_requests: queue.requests.len(),
            decode_requests: self.shared.decode_requests.load(Ordering::SeqCst),
            decode_passes: self.shared.decode_passes.load(Ordering::SeqCst),
            decode_end: self.is_decode_end(),
            seeking: queue.seeks_in_flight > 0,
        }
    }

    pub fn description(&self) -> String {
        self.shared.source.description()
    }
}

impl<S: FrameSource> Drop for BufferWorker<S> {
    fn drop(&mut self) {
        self.quit();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("{} ⚠️ 解码线程异常退出", self.shared.ctx);
            }
        }
    }
}
