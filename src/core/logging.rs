use std::fmt;
use std::process;
use std::thread;

/// 组件日志上下文
///
/// 由组件的创建者注入，组件内的每条日志都以它为前缀：
/// `[pid:1234 tid:ThreadId(5) video#0]`
#[derive(Debug, Clone)]
pub struct LogCtx {
    component: &'static str,
    stream: Option<usize>,
}

impl LogCtx {
    pub fn new(component: &'static str) -> Self {
        Self { component, stream: None }
    }

    pub fn for_stream(component: &'static str, index: usize) -> Self {
        Self { component, stream: Some(index) }
    }

    /// 派生一个同流的子组件上下文
    pub fn child(&self, component: &'static str) -> Self {
        Self { component, stream: self.stream }
    }
}

impl fmt::Display for LogCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[pid:{} tid:{:?} {}", process::id(), thread::current().id(), self.component)?;
        if let Some(index) = self.stream {
            write!(f, "#{}", index)?;
        }
        f.write_str("]")
    }
}

/// 初始化日志（默认 Info，可通过 RUST_LOG 覆盖）
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}
