//! Span 生命周期控制器
//!
//! 订阅包装器发布的四个生命周期通道，把一次调用映射为一个 Span：
//!
//! - `start`：创建 Span，保存之前的上下文，进入以新 Span 为当前 Span 的上下文
//! - `end`：恢复 start 保存的上下文
//! - `async-end`：运行结果钩子，然后结束 Span
//! - `error`：在 Span 上记录错误，然后结束 Span
//!
//! 每个 start 只保存紧邻它之前的上下文，对应的 end 恰好恢复这个值，
//! 因此嵌套调用的 start/end 像括号一样配对，与异步完成的交错顺序无关。

use crate::config::PluginConfig;
use crate::core::{Channel, ChannelHandler, ChannelRegistry, ContextStore, SubscriberId};
use crate::instrument::{
    Arg, EventKind, FnError, Invocation, LifecycleChannels, LifecycleEvent, LifecycleMessage,
};
use crate::trace::{SpanOptions, SpanRef, Tracer};
use crate::types::{SpanKind, Tags, SERVICE_NAME_TAG, SPAN_KIND_TAG};
use crate::Result;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// 传给钩子的调用信息
pub struct InvocationInfo<'a> {
    pub invocation: &'a Arc<Invocation>,
    /// start 时的参数列表
    pub args: &'a [Arg],
    /// 异步结果，仅在 async-end 时存在
    pub result: Option<&'a Value>,
    /// 本次调用的 Span，start 阶段尚未创建
    pub span: Option<&'a SpanRef>,
}

/// 标签钩子
pub type TagsHook = Arc<dyn Fn(&InvocationInfo<'_>) -> Tags + Send + Sync>;

/// 结果钩子，在 Span 正常结束之前运行
pub type ResultHook = Arc<dyn Fn(&InvocationInfo<'_>) + Send + Sync>;

/// 可选钩子
#[derive(Clone, Default)]
pub struct WrappedHooks {
    pub tags: Option<TagsHook>,
    pub async_end: Option<ResultHook>,
}

impl WrappedHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags<F>(mut self, f: F) -> Self
    where
        F: Fn(&InvocationInfo<'_>) -> Tags + Send + Sync + 'static,
    {
        self.tags = Some(Arc::new(f));
        self
    }

    pub fn on_async_end<F>(mut self, f: F) -> Self
    where
        F: Fn(&InvocationInfo<'_>) + Send + Sync + 'static,
    {
        self.async_end = Some(Arc::new(f));
        self
    }
}

/// 一个可启停的通道订阅
pub struct Subscription {
    channel: Arc<Channel<LifecycleMessage>>,
    handler: ChannelHandler<LifecycleMessage>,
    id: Mutex<Option<SubscriberId>>,
}

impl Subscription {
    pub fn new(
        channel: Arc<Channel<LifecycleMessage>>,
        handler: ChannelHandler<LifecycleMessage>,
    ) -> Self {
        Self {
            channel,
            handler,
            id: Mutex::new(None),
        }
    }

    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    /// 订阅通道；已启用时无操作
    pub fn enable(&self) {
        let mut id = self.id.lock();
        if id.is_none() {
            *id = Some(self.channel.subscribe_handler(self.handler.clone()));
        }
    }

    /// 取消订阅；未启用时无操作
    pub fn disable(&self) {
        if let Some(id) = self.id.lock().take() {
            self.channel.unsubscribe(id);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.id.lock().is_some()
    }
}

/// 处理函数共享的状态
struct SpanSettings {
    tracer: Arc<dyn Tracer>,
    kind: Option<SpanKind>,
    service: RwLock<Option<String>>,
}

impl SpanSettings {
    fn service_name(&self) -> String {
        self.service
            .read()
            .clone()
            .unwrap_or_else(|| self.tracer.service_name().to_string())
    }
}

/// 追踪插件
///
/// 新建时处于禁用状态，调用 [`TracingPlugin::configure`] 后才开始产生 Span。
pub struct TracingPlugin {
    name: String,
    settings: Arc<SpanSettings>,
    subscriptions: Mutex<Vec<Subscription>>,
    enabled: AtomicBool,
}

impl TracingPlugin {
    pub fn new(name: impl Into<String>, kind: Option<SpanKind>, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            name: name.into(),
            settings: Arc::new(SpanSettings {
                tracer,
                kind,
                service: RwLock::new(None),
            }),
            subscriptions: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Option<SpanKind> {
        self.settings.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// 在进程级注册表上为一个逻辑操作添加四个订阅
    pub fn add_wrapped_subscriptions(
        &self,
        prefix: &str,
        span_name: &str,
        hooks: WrappedHooks,
    ) -> Result<()> {
        self.add_wrapped_subscriptions_in(ChannelRegistry::global(), prefix, span_name, hooks)
    }

    /// 在指定注册表上为一个逻辑操作添加四个订阅
    pub fn add_wrapped_subscriptions_in(
        &self,
        registry: &ChannelRegistry,
        prefix: &str,
        span_name: &str,
        hooks: WrappedHooks,
    ) -> Result<()> {
        let channels = LifecycleChannels::resolve_in(registry, prefix)?;
        let hooks = Arc::new(hooks);
        let span_name: Arc<str> = Arc::from(span_name);

        for kind in [EventKind::Start, EventKind::End, EventKind::AsyncEnd, EventKind::Error] {
            let settings = self.settings.clone();
            let hooks = hooks.clone();
            let span_name = span_name.clone();

            let handler: ChannelHandler<LifecycleMessage> =
                Arc::new(move |message: &LifecycleMessage| -> Result<()> {
                    match &message.event {
                        LifecycleEvent::Start { args } => {
                            on_start(&settings, &span_name, &hooks, &message.invocation, args)
                        }
                        LifecycleEvent::End => on_end(&message.invocation),
                        LifecycleEvent::AsyncEnd { result } => {
                            on_async_end(&hooks, &message.invocation, result.as_ref())
                        }
                        LifecycleEvent::Error { error } => on_error(&message.invocation, error),
                    }
                    Ok(())
                });

            let subscription = Subscription::new(channels.get(kind).clone(), handler);
            if self.is_enabled() {
                subscription.enable();
            }
            self.subscriptions.lock().push(subscription);
        }

        debug!(plugin = %self.name, prefix, span = %span_name, "Added wrapped subscriptions");
        Ok(())
    }

    /// 应用插件配置，按 `enabled` 启停全部订阅
    pub fn configure(&self, config: PluginConfig) {
        *self.settings.service.write() = config.service.clone();

        let was_enabled = self.enabled.swap(config.enabled, Ordering::AcqRel);
        if config.enabled == was_enabled {
            return;
        }

        let subscriptions = self.subscriptions.lock();
        for subscription in subscriptions.iter() {
            if config.enabled {
                subscription.enable();
            } else {
                subscription.disable();
            }
        }
        info!(
            plugin = %self.name,
            enabled = config.enabled,
            subscriptions = subscriptions.len(),
            "Plugin configured"
        );
    }
}

fn on_start(
    settings: &SpanSettings,
    span_name: &str,
    hooks: &WrappedHooks,
    invocation: &Arc<Invocation>,
    args: &Arc<[Arg]>,
) {
    invocation.mark_started(args.clone());

    let user_tags = match &hooks.tags {
        Some(tags) => tags(&InvocationInfo {
            invocation,
            args: &args[..],
            result: None,
            span: None,
        }),
        None => Tags::new(),
    };

    if invocation.is_suppressed() {
        return;
    }

    let current = ContextStore::current();
    let mut tags = Tags::new();
    tags.insert(SERVICE_NAME_TAG.to_string(), settings.service_name());
    tags.extend(user_tags.clone());
    if let Some(kind) = settings.kind {
        tags.insert(SPAN_KIND_TAG.to_string(), kind.as_str().to_string());
    }

    let span = settings.tracer.start_span(
        span_name,
        SpanOptions::new()
            .child_of(current.span().cloned())
            .with_tags(tags),
    );
    let previous = ContextStore::enter_with(Arc::new(current.with_span(span.clone())));

    let mut state = invocation.state();
    state.span = Some(span);
    state.saved_context = Some(previous);
    state.tags = user_tags;
}

fn on_end(invocation: &Arc<Invocation>) {
    let (saved, abandoned) = {
        let mut state = invocation.state();
        if !state.started {
            return;
        }
        let saved = state.saved_context.take();
        // span 创建之后才被抑制：不会再有终止事件，在这里结束它
        let abandoned = if state.suppressed && !state.finished {
            state.finished = true;
            state.span.clone()
        } else {
            None
        };
        (saved, abandoned)
    };

    if let Some(previous) = saved {
        ContextStore::enter_with(previous);
    }
    if let Some(span) = abandoned {
        debug!(span = span.name(), invocation = invocation.id(), "Finishing span of suppressed invocation");
        span.finish();
    }
}

/// 抢占结束 Span 的权利，返回需要结束的 Span 和参数
fn claim_finish(invocation: &Invocation) -> Option<(SpanRef, Option<Arc<[Arg]>>)> {
    let mut state = invocation.state();
    if state.suppressed || !state.started || state.finished {
        return None;
    }
    state.finished = true;
    let span = state.span.clone()?;
    Some((span, state.args.clone()))
}

fn on_async_end(hooks: &WrappedHooks, invocation: &Arc<Invocation>, result: Option<&Value>) {
    let Some((span, args)) = claim_finish(invocation) else {
        return;
    };
    if let Some(hook) = &hooks.async_end {
        hook(&InvocationInfo {
            invocation,
            args: args.as_deref().unwrap_or(&[]),
            result,
            span: Some(&span),
        });
    }
    span.finish();
}

fn on_error(invocation: &Arc<Invocation>, error: &FnError) {
    let Some((span, _)) = claim_finish(invocation) else {
        return;
    };
    span.add_error(error);
    span.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionContext;
    use crate::instrument::{wrap_in, Callback, HostFunction};
    use crate::trace::{MemoryTracer, SpanState, ERROR_MESSAGE_TAG};
    use serde_json::json;

    fn setup(prefix: &str, hooks: WrappedHooks) -> (ChannelRegistry, Arc<MemoryTracer>, TracingPlugin) {
        let registry = ChannelRegistry::new();
        let tracer = Arc::new(MemoryTracer::new("test-service"));
        let plugin = TracingPlugin::new("dns", Some(SpanKind::Client), tracer.clone());
        plugin
            .add_wrapped_subscriptions_in(&registry, prefix, "dns.lookup", hooks)
            .unwrap();
        plugin.configure(PluginConfig::default());
        (registry, tracer, plugin)
    }

    /// 保存回调，稍后由测试手动完成
    fn deferred(name: &str, pending: &Arc<Mutex<Vec<Callback>>>) -> HostFunction {
        let pending = pending.clone();
        HostFunction::new(name, 2, move |mut args| {
            if let Some(Arg::Callback(cb)) = args.pop() {
                pending.lock().push(cb);
            }
            Ok(Value::Null)
        })
    }

    #[tokio::test]
    async fn test_async_lookup_produces_tagged_span() {
        let hooks = WrappedHooks::new()
            .with_tags(|info| {
                let mut tags = Tags::new();
                if let Some(Value::String(host)) = info.args.first().and_then(Arg::as_value) {
                    tags.insert("dns.hostname".to_string(), host.clone());
                }
                tags
            })
            .on_async_end(|info| {
                if let (Some(span), Some(Value::String(address))) = (info.span, info.result) {
                    span.set_tag("dns.address", address);
                }
            });
        let (registry, tracer, _plugin) = setup("apm:dns:lookup", hooks);

        let target = HostFunction::new("lookup", 2, |mut args| {
            if let Some(Arg::Callback(cb)) = args.pop() {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    cb.invoke(None, Some(json!("1.2.3.4")));
                });
            }
            Ok(Value::Null)
        });
        let lookup = wrap_in(&registry, "apm:dns:lookup", &target, 2).unwrap();

        let before = ContextStore::current();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let callback = Callback::new(move |error, result| {
            let _ = tx.send((error.is_none(), result));
        });
        lookup.call(vec![Arg::from("localhost"), callback.into()]).unwrap();
        assert!(Arc::ptr_eq(&ContextStore::current(), &before));
        assert_eq!(tracer.open_spans().len(), 1);

        let (ok, result) = rx.await.unwrap();
        assert!(ok);
        assert_eq!(result, Some(json!("1.2.3.4")));

        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "dns.lookup");
        assert_eq!(span.finish_count, 1);
        assert_eq!(span.tags[SERVICE_NAME_TAG], "test-service");
        assert_eq!(span.tags[SPAN_KIND_TAG], "client");
        assert_eq!(span.tags["dns.hostname"], "localhost");
        assert_eq!(span.tags["dns.address"], "1.2.3.4");
        assert!(!span.error);
    }

    #[test]
    fn test_sync_throw_records_error() {
        let (registry, tracer, _plugin) = setup("apm:dns:reverse", WrappedHooks::new());
        let target = HostFunction::new("reverse", 2, |_| Err(FnError::msg("boom")));
        let reverse = wrap_in(&registry, "apm:dns:reverse", &target, 2).unwrap();

        let before = ContextStore::current();
        let callback = Callback::new(|_, _| {});
        let error = reverse
            .call(vec![Arg::from("1.2.3.4"), callback.into()])
            .unwrap_err();

        assert_eq!(error.to_string(), "boom");
        assert!(Arc::ptr_eq(&ContextStore::current(), &before));

        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].error);
        assert_eq!(spans[0].tags[ERROR_MESSAGE_TAG], "boom");
        assert_eq!(spans[0].finish_count, 1);
    }

    #[test]
    fn test_callback_error_finishes_span_once() {
        let (registry, tracer, _plugin) = setup("apm:dns:resolve", WrappedHooks::new());
        let target = HostFunction::new("resolve", 2, |mut args| {
            if let Some(Arg::Callback(cb)) = args.pop() {
                cb.invoke(Some(FnError::msg("ENOTFOUND")), None);
            }
            Ok(Value::Null)
        });
        let resolve = wrap_in(&registry, "apm:dns:resolve", &target, 2).unwrap();

        resolve
            .call(vec![Arg::from("nowhere"), Callback::new(|_, _| {}).into()])
            .unwrap();

        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].error);
        assert_eq!(spans[0].tags[ERROR_MESSAGE_TAG], "ENOTFOUND");
        assert_eq!(spans[0].finish_count, 1);
    }

    #[test]
    fn test_nested_calls_restore_context_with_interleaved_completion() {
        let registry = ChannelRegistry::new();
        let tracer = Arc::new(MemoryTracer::new("test-service"));
        let plugin = TracingPlugin::new("nested", None, tracer.clone());
        plugin
            .add_wrapped_subscriptions_in(&registry, "apm:test:outer", "outer", WrappedHooks::new())
            .unwrap();
        plugin
            .add_wrapped_subscriptions_in(&registry, "apm:test:inner", "inner", WrappedHooks::new())
            .unwrap();
        plugin.configure(PluginConfig::default());

        let pending = Arc::new(Mutex::new(Vec::new()));
        let inner = wrap_in(&registry, "apm:test:inner", &deferred("inner", &pending), 2).unwrap();

        let outer_target = {
            let pending = pending.clone();
            let inner = inner.clone();
            HostFunction::new("outer", 2, move |mut args| {
                inner
                    .call(vec![Arg::from("b"), Callback::new(|_, _| {}).into()])
                    .map(|_| ())?;
                if let Some(Arg::Callback(cb)) = args.pop() {
                    pending.lock().push(cb);
                }
                Ok(Value::Null)
            })
        };
        let outer = wrap_in(&registry, "apm:test:outer", &outer_target, 2).unwrap();

        let root = Arc::new(ExecutionContext::default());
        let callback_span = Arc::new(Mutex::new(None));
        ContextStore::run(root.clone(), || {
            let callback_span = callback_span.clone();
            let callback = Callback::new(move |_, _| {
                *callback_span.lock() = Some(ContextStore::current().span().is_some());
            });
            outer.call(vec![Arg::from("a"), callback.into()]).unwrap();
            assert!(Arc::ptr_eq(&ContextStore::current(), &root));
        });

        // inner 先于 outer 完成
        let callbacks: Vec<Callback> = pending.lock().drain(..).collect();
        assert_eq!(callbacks.len(), 2);
        callbacks[0].invoke(None, Some(json!("b")));
        callbacks[1].invoke(None, Some(json!("a")));

        assert_eq!(*callback_span.lock(), Some(false));

        let spans = tracer.spans();
        assert_eq!(spans.len(), 2);
        let outer_span = spans.iter().find(|s| s.name == "outer").unwrap();
        let inner_span = spans.iter().find(|s| s.name == "inner").unwrap();
        assert_eq!(inner_span.parent_id, Some(outer_span.span_id));
        assert_eq!(inner_span.trace_id, outer_span.trace_id);
        assert_eq!(outer_span.parent_id, None);
        assert!(spans.iter().all(|s| s.state == SpanState::Finished && s.finish_count == 1));
    }

    #[test]
    fn test_suppressed_context_creates_no_span() {
        let (registry, tracer, _plugin) = setup("apm:dns:lookup", WrappedHooks::new());
        let pending = Arc::new(Mutex::new(Vec::new()));
        let lookup = wrap_in(&registry, "apm:dns:lookup", &deferred("lookup", &pending), 2).unwrap();

        let suppressed = Arc::new(ExecutionContext::default().with_suppressed(true));
        ContextStore::run(suppressed.clone(), || {
            lookup
                .call(vec![Arg::from("x"), Callback::new(|_, _| {}).into()])
                .unwrap();
            assert!(Arc::ptr_eq(&ContextStore::current(), &suppressed));
        });

        let callbacks: Vec<Callback> = pending.lock().drain(..).collect();
        callbacks[0].invoke(None, None);
        assert!(tracer.spans().is_empty());
    }

    #[test]
    fn test_start_subscriber_can_suppress_invocation() {
        let registry = ChannelRegistry::new();
        let tracer = Arc::new(MemoryTracer::new("test-service"));

        let channels = LifecycleChannels::resolve_in(&registry, "apm:test:guarded").unwrap();
        channels.start.subscribe(|message: &LifecycleMessage| {
            message.invocation.suppress();
            Ok(())
        });

        let plugin = TracingPlugin::new("guarded", None, tracer.clone());
        plugin
            .add_wrapped_subscriptions_in(&registry, "apm:test:guarded", "guarded", WrappedHooks::new())
            .unwrap();
        plugin.configure(PluginConfig::default());

        let target = HostFunction::new("guarded", 1, |_| Ok(json!("done")));
        let guarded = wrap_in(&registry, "apm:test:guarded", &target, 1).unwrap();
        let result = guarded.call(vec![Callback::new(|_, _| {}).into()]).unwrap();

        assert_eq!(result, json!("done"));
        assert!(tracer.spans().is_empty());
    }

    #[test]
    fn test_late_suppression_restores_context_and_finishes_span() {
        let (registry, tracer, _plugin) = setup("apm:test:late", WrappedHooks::new());

        // 在插件之后订阅：Span 已创建、上下文已切换
        let channels = LifecycleChannels::resolve_in(&registry, "apm:test:late").unwrap();
        channels.start.subscribe(|message: &LifecycleMessage| {
            message.invocation.suppress();
            Ok(())
        });

        let target = HostFunction::new("late", 2, |mut args| {
            if let Some(Arg::Callback(cb)) = args.pop() {
                cb.invoke(None, Some(json!("ok")));
            }
            Ok(Value::Null)
        });
        let late = wrap_in(&registry, "apm:test:late", &target, 2).unwrap();

        let root = Arc::new(ExecutionContext::default());
        let delivered = Arc::new(Mutex::new(None));
        ContextStore::run(root.clone(), || {
            let delivered = delivered.clone();
            let callback = Callback::new(move |_, result| *delivered.lock() = result);
            late.call(vec![Arg::from("x"), callback.into()]).unwrap();
            assert!(Arc::ptr_eq(&ContextStore::current(), &root));
        });

        assert_eq!(*delivered.lock(), Some(json!("ok")));
        assert!(tracer.open_spans().is_empty());
        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].finish_count, 1);
        assert!(!spans[0].error);
    }

    #[tokio::test]
    async fn test_async_callback_error_finishes_span_once() {
        let (registry, tracer, _plugin) = setup("apm:dns:lookup", WrappedHooks::new());
        let reported = FnError::msg("getaddrinfo ENOTFOUND nowhere.invalid");

        let target = {
            let reported = reported.clone();
            HostFunction::new("lookup", 2, move |mut args| {
                if let Some(Arg::Callback(cb)) = args.pop() {
                    let reported = reported.clone();
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        cb.invoke(Some(reported), None);
                    });
                }
                Ok(Value::Null)
            })
        };
        let lookup = wrap_in(&registry, "apm:dns:lookup", &target, 2).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let callback = Callback::new(move |error, _| {
            let _ = tx.send(error);
        });
        lookup
            .call(vec![Arg::from("nowhere.invalid"), callback.into()])
            .unwrap();
        assert_eq!(tracer.open_spans().len(), 1);

        let error = rx.await.unwrap().unwrap();
        assert!(error.ptr_eq(&reported));

        assert!(tracer.open_spans().is_empty());
        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].error);
        assert_eq!(
            spans[0].tags[ERROR_MESSAGE_TAG],
            "getaddrinfo ENOTFOUND nowhere.invalid"
        );
        assert_eq!(spans[0].finish_count, 1);
    }

    #[test]
    fn test_configure_toggles_subscriptions_and_service() {
        let (registry, tracer, plugin) = setup("apm:dns:lookup", WrappedHooks::new());
        let target = HostFunction::new("lookup", 2, |mut args| {
            if let Some(Arg::Callback(cb)) = args.pop() {
                cb.invoke(None, None);
            }
            Ok(Value::Null)
        });
        let lookup = wrap_in(&registry, "apm:dns:lookup", &target, 2).unwrap();
        let call = || {
            lookup
                .call(vec![Arg::from("x"), Callback::new(|_, _| {}).into()])
                .unwrap();
        };

        assert_eq!(plugin.subscription_count(), 4);
        plugin.configure(PluginConfig::disabled());
        assert!(!plugin.is_enabled());
        call();
        assert!(tracer.spans().is_empty());

        plugin.configure(PluginConfig::default().with_service("dns-service"));
        call();
        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].tags[SERVICE_NAME_TAG], "dns-service");
    }

    #[test]
    fn test_subscription_enable_is_idempotent() {
        let channel = Arc::new(Channel::<LifecycleMessage>::new("apm:test:sub:start"));
        let handler: ChannelHandler<LifecycleMessage> =
            Arc::new(|_: &LifecycleMessage| -> crate::Result<()> { Ok(()) });
        let subscription = Subscription::new(channel.clone(), handler);

        subscription.enable();
        subscription.enable();
        assert_eq!(channel.subscriber_count(), 1);
        assert!(subscription.is_enabled());

        subscription.disable();
        subscription.disable();
        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(subscription.channel_name(), "apm:test:sub:start");
    }
}
