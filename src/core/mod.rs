// 核心数据结构和类型定义

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::EngineConfig;
pub use error::*;
pub use logging::{init_logging, LogCtx};
pub use types::*;
