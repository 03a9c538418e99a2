//! 核心基础层模块
//!
//! 提供进程级的基础设施：命名通道总线和执行上下文存储

pub mod channel;
pub mod context;

// 重新导出核心组件
pub use channel::*;
pub use context::*;
