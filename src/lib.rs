//! APM Instrument - 追踪代理的插桩核心
//!
//! 在不修改第三方库源码的前提下，为回调风格的异步函数生成追踪 Span
//!
//! # 架构分层
//!
//! - **插件层**: 模块加载拦截、版本匹配、Span 生命周期控制
//! - **插桩层**: 宿主函数模型、模块导出对象、通用函数包装器
//! - **追踪层**: 追踪器契约与内存追踪器
//! - **核心基础层**: 命名通道总线、执行上下文存储
//!
//! # 数据流
//!
//! ```text
//! 模块加载 -> Interceptor -> 钩子调用 wrap() 替换导出函数
//! 函数调用 -> 包装器发布 start/end/async-end/error
//!          -> TracingPlugin 订阅并管理 Span 与上下文
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod instrument;
pub mod plugins;
pub mod trace;
pub mod types;

// 重新导出核心类型
pub use crate::config::{AgentConfig, ConfigManager, LogLevel, LoggingConfig, PluginConfig};
pub use crate::core::{
    channel, Channel, ChannelHandler, ChannelRegistry, ContextFuture, ContextGuard, ContextStore,
    ExecutionContext, SubscriberId,
};
pub use crate::error::{InstrumentError, Result};
pub use crate::instrument::{
    wrap, Arg, Callback, ChannelNames, EventKind, Exports, FnError, HostFunction, Invocation,
    LifecycleEvent, LifecycleMessage, Member, DEFAULT_NAMESPACE,
};
pub use crate::plugins::{
    add_hook, match_version, Interceptor, ModuleHost, TracingPlugin, WrappedHooks,
};
pub use crate::trace::{MemoryTracer, Span, SpanOptions, SpanRef, Tracer};
pub use crate::types::{HookDescriptor, SpanKind, Tags};

/// 框架信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FRAMEWORK_NAME: &str = "APM Instrument";

/// 按配置初始化日志系统，重复调用无副作用
pub fn init_logging(config: &LoggingConfig) {
    let level: tracing::Level = config.level.into();
    if tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .is_ok()
    {
        tracing::debug!(%level, "Logging initialized");
    }
}

/// 快速启动函数：初始化日志并校验配置
pub async fn initialize(config: &AgentConfig) -> Result<()> {
    init_logging(&config.logging);
    ConfigManager::from_config(config.clone()).validate()?;

    tracing::info!("Initializing {} v{}", FRAMEWORK_NAME, VERSION);
    tracing::info!(service = %config.service, namespace = %config.namespace, "Agent ready");

    Ok(())
}
