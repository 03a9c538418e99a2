//! 通用函数包装器
//!
//! 把回调风格的异步函数转换为四个生命周期通道上的事件序列：
//!
//! ```text
//! <prefix>:start      调用开始，携带完整参数列表
//! <prefix>:end        同步部分结束（正常返回、抛出或被抑制）
//! <prefix>:async-end  回调以无错误方式被调用
//! <prefix>:error      同步抛出，或回调以错误方式被调用
//! ```
//!
//! 通道名称是稳定的字符串键，修改它们属于破坏性变更。

use super::function::{Arg, CallResult, Callback, FnError, FunctionBody, HostFunction, WrapRecord};
use crate::core::{Channel, ChannelRegistry, ContextStore};
use crate::trace::SpanRef;
use crate::types::Tags;
use crate::Result;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 默认通道命名空间
pub const DEFAULT_NAMESPACE: &str = "apm";

/// 生命周期事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    End,
    AsyncEnd,
    Error,
}

impl EventKind {
    /// 通道名后缀
    pub fn suffix(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::End => "end",
            EventKind::AsyncEnd => "async-end",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// 一组生命周期通道的名称
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub start: String,
    pub end: String,
    pub async_end: String,
    pub error: String,
}

impl ChannelNames {
    /// 由完整前缀（如 `apm:dns:lookup`）生成
    pub fn new(prefix: &str) -> Self {
        Self {
            start: format!("{}:{}", prefix, EventKind::Start),
            end: format!("{}:{}", prefix, EventKind::End),
            async_end: format!("{}:{}", prefix, EventKind::AsyncEnd),
            error: format!("{}:{}", prefix, EventKind::Error),
        }
    }

    /// 由命名空间和操作名生成
    pub fn for_operation(namespace: &str, operation: &str) -> Self {
        Self::new(&format!("{}:{}", namespace, operation))
    }
}

/// 单次调用的可变状态
#[derive(Default)]
pub struct InvocationState {
    /// 是否已到达 start
    pub started: bool,
    /// 是否抑制追踪
    pub suppressed: bool,
    /// 本次调用的 Span
    pub span: Option<SpanRef>,
    /// start 之前的上下文，由 end 恢复
    pub saved_context: Option<Arc<crate::core::ExecutionContext>>,
    /// Span 是否已结束
    pub finished: bool,
    /// 标签钩子产生的标签
    pub tags: Tags,
    /// start 时的参数列表，与 start 事件共享
    pub args: Option<Arc<[Arg]>>,
}

static NEXT_INVOCATION_ID: AtomicU64 = AtomicU64::new(1);

/// 一次被插桩的调用
///
/// 在同一次调用的四个事件之间共享，订阅者通过它交换状态。
pub struct Invocation {
    id: u64,
    prefix: String,
    state: Mutex<InvocationState>,
    terminated: AtomicBool,
}

impl Invocation {
    pub fn new(prefix: &str, suppressed: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_INVOCATION_ID.fetch_add(1, Ordering::Relaxed),
            prefix: prefix.to_string(),
            state: Mutex::new(InvocationState {
                suppressed,
                ..InvocationState::default()
            }),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// 锁定状态；不要在持有守卫时回调外部代码
    pub fn state(&self) -> MutexGuard<'_, InvocationState> {
        self.state.lock()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_suppressed(&self) -> bool {
        self.state.lock().suppressed
    }

    pub fn suppress(&self) {
        self.state.lock().suppressed = true;
    }

    /// 标记已到达 start，并记录参数
    pub fn mark_started(&self, args: Arc<[Arg]>) {
        let mut state = self.state.lock();
        state.started = true;
        state.args = Some(args);
    }

    pub fn span(&self) -> Option<SpanRef> {
        self.state.lock().span.clone()
    }

    /// 是否已发布终止事件（async-end 或 error）
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// 抢占终止事件的发布权，只有第一次返回 `true`
    fn try_terminate(&self) -> bool {
        self.terminated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Invocation");
        debug.field("id", &self.id).field("prefix", &self.prefix);
        // 持有状态锁的订阅者也可以打印消息
        match self.state.try_lock() {
            Some(state) => debug
                .field("started", &state.started)
                .field("suppressed", &state.suppressed),
            None => debug.field("state", &"<locked>"),
        };
        debug.field("terminated", &self.is_terminated()).finish()
    }
}

/// 生命周期事件
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Start { args: Arc<[Arg]> },
    End,
    AsyncEnd { result: Option<Value> },
    Error { error: FnError },
}

impl LifecycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Start { .. } => EventKind::Start,
            LifecycleEvent::End => EventKind::End,
            LifecycleEvent::AsyncEnd { .. } => EventKind::AsyncEnd,
            LifecycleEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// 生命周期通道上的消息
#[derive(Debug, Clone)]
pub struct LifecycleMessage {
    pub invocation: Arc<Invocation>,
    pub event: LifecycleEvent,
}

impl LifecycleMessage {
    pub fn new(invocation: Arc<Invocation>, event: LifecycleEvent) -> Self {
        Self { invocation, event }
    }
}

/// 一组已解析的生命周期通道
#[derive(Debug, Clone)]
pub struct LifecycleChannels {
    pub start: Arc<Channel<LifecycleMessage>>,
    pub end: Arc<Channel<LifecycleMessage>>,
    pub async_end: Arc<Channel<LifecycleMessage>>,
    pub error: Arc<Channel<LifecycleMessage>>,
}

impl LifecycleChannels {
    /// 从进程级注册表解析
    pub fn resolve(prefix: &str) -> Result<Self> {
        Self::resolve_in(ChannelRegistry::global(), prefix)
    }

    /// 从指定注册表解析
    pub fn resolve_in(registry: &ChannelRegistry, prefix: &str) -> Result<Self> {
        let names = ChannelNames::new(prefix);
        Ok(Self {
            start: registry.channel(&names.start)?,
            end: registry.channel(&names.end)?,
            async_end: registry.channel(&names.async_end)?,
            error: registry.channel(&names.error)?,
        })
    }

    pub fn get(&self, kind: EventKind) -> &Arc<Channel<LifecycleMessage>> {
        match kind {
            EventKind::Start => &self.start,
            EventKind::End => &self.end,
            EventKind::AsyncEnd => &self.async_end,
            EventKind::Error => &self.error,
        }
    }

    fn publish(&self, invocation: &Arc<Invocation>, event: LifecycleEvent) {
        let channel = self.get(event.kind());
        channel.publish(&LifecycleMessage::new(invocation.clone(), event));
    }
}

/// 作用域守卫：同步部分结束时发布且仅发布一次 end
struct EndGuard<'a> {
    channels: &'a LifecycleChannels,
    invocation: Arc<Invocation>,
}

impl Drop for EndGuard<'_> {
    fn drop(&mut self) {
        self.channels.publish(&self.invocation, LifecycleEvent::End);
    }
}

/// 调用是否满足可追踪的形状：至少 `min_args` 个参数且最后一个是回调
pub fn is_args_valid(args: &[Arg], min_args: usize) -> bool {
    args.len() >= min_args && args.last().map_or(false, Arg::is_callback)
}

/// 使用进程级通道注册表包装函数
pub fn wrap(prefix: &str, target: &HostFunction, min_args: usize) -> Result<HostFunction> {
    wrap_in(ChannelRegistry::global(), prefix, target, min_args)
}

/// 包装函数
///
/// 同一函数最多包装一次：对已包装的函数再次调用直接返回它本身。
pub fn wrap_in(
    registry: &ChannelRegistry,
    prefix: &str,
    target: &HostFunction,
    min_args: usize,
) -> Result<HostFunction> {
    if let Some(record) = target.wrap_record() {
        debug!(function = %target.name(), prefix = %record.prefix, "Function already wrapped");
        return Ok(target.clone());
    }

    let channels = LifecycleChannels::resolve_in(registry, prefix)?;
    let original = target.clone();
    let invocation_prefix = prefix.to_string();

    let body: FunctionBody = Arc::new(move |mut args: Vec<Arg>| -> CallResult {
        if !is_args_valid(&args, min_args) {
            return original.call(args);
        }
        let callback = match args.last() {
            Some(Arg::Callback(callback)) => callback.clone(),
            _ => return original.call(args),
        };

        let bound = callback.bind_to_current();
        let invocation = Invocation::new(
            &invocation_prefix,
            ContextStore::current().is_suppressed(),
        );
        let _end = EndGuard {
            channels: &channels,
            invocation: invocation.clone(),
        };

        channels.publish(&invocation, LifecycleEvent::Start { args: Arc::from(args.as_slice()) });
        if invocation.is_suppressed() {
            return original.call(args);
        }

        let replacement = {
            let channels = channels.clone();
            let invocation = invocation.clone();
            Callback::new(move |error, result| {
                if invocation.try_terminate() {
                    match error {
                        Some(ref error) => channels.publish(
                            &invocation,
                            LifecycleEvent::Error { error: error.clone() },
                        ),
                        None => channels.publish(
                            &invocation,
                            LifecycleEvent::AsyncEnd { result: result.clone() },
                        ),
                    }
                }
                bound.invoke(error, result);
            })
        };
        if let Some(last) = args.last_mut() {
            *last = Arg::Callback(replacement);
        }

        match original.call(args) {
            Ok(value) => Ok(value),
            Err(error) => {
                error.materialize();
                if invocation.try_terminate() {
                    channels.publish(&invocation, LifecycleEvent::Error { error: error.clone() });
                }
                Err(error)
            }
        }
    });

    debug!(function = %target.name(), prefix, min_args, "Wrapped function");

    Ok(HostFunction::wrapping(
        target,
        body,
        WrapRecord {
            prefix: prefix.to_string(),
            min_args,
            original: target.clone(),
        },
    ))
}
