//! 执行上下文存储
//!
//! 保存"当前活跃 Span"和"追踪抑制"标记的续体作用域存储。
//! 每个线程持有一个当前上下文槽位，对应一个单线程协作式事件循环；
//! 跨越异步边界时由 [`ContextStore::bind`]、[`Callback::bind_to_current`]
//! 以及 [`ContextFuture`] 负责在恢复执行时重新进入捕获的上下文。
//!
//! [`Callback::bind_to_current`]: crate::instrument::Callback::bind_to_current

use crate::trace::SpanRef;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// 执行上下文 - 不可变快照
#[derive(Clone, Default)]
pub struct ExecutionContext {
    /// 当前活跃 Span
    span: Option<SpanRef>,
    /// 是否抑制追踪
    suppressed: bool,
}

impl ExecutionContext {
    /// 空上下文
    pub fn root() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn span(&self) -> Option<&SpanRef> {
        self.span.as_ref()
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// 派生出以 `span` 为当前 Span 的新上下文
    pub fn with_span(&self, span: SpanRef) -> Self {
        Self {
            span: Some(span),
            ..self.clone()
        }
    }

    /// 派生出设置了抑制标记的新上下文
    pub fn with_suppressed(&self, suppressed: bool) -> Self {
        Self {
            suppressed,
            ..self.clone()
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("span", &self.span.as_ref().map(|s| s.span_id()))
            .field("suppressed", &self.suppressed)
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Arc<ExecutionContext>> = RefCell::new(ExecutionContext::root());
}

/// 上下文存储
pub struct ContextStore;

impl ContextStore {
    /// 当前上下文
    pub fn current() -> Arc<ExecutionContext> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// 替换当前上下文，返回被替换的值
    ///
    /// 不会自动恢复，调用方负责保存并在适当时机恢复旧值。
    pub fn enter_with(context: Arc<ExecutionContext>) -> Arc<ExecutionContext> {
        CURRENT.with(|current| current.replace(context))
    }

    /// 在指定上下文中执行闭包，结束后（包括 panic）恢复原上下文
    pub fn run<R>(context: Arc<ExecutionContext>, f: impl FnOnce() -> R) -> R {
        let _guard = ContextGuard::enter(context);
        f()
    }

    /// 捕获当前上下文，返回在该上下文中执行的闭包
    pub fn bind<F, R>(f: F) -> impl FnOnce() -> R
    where
        F: FnOnce() -> R,
    {
        let context = Self::current();
        move || Self::run(context, f)
    }

    /// 让 future 在当前上下文中运行
    pub fn scope<F: Future>(future: F) -> ContextFuture<F> {
        Self::in_context(Self::current(), future)
    }

    /// 让 future 在指定上下文中运行
    pub fn in_context<F: Future>(context: Arc<ExecutionContext>, future: F) -> ContextFuture<F> {
        ContextFuture {
            context,
            inner: Box::pin(future),
        }
    }
}

/// 作用域守卫：析构时恢复进入前的上下文
#[must_use = "dropping the guard restores the previous context immediately"]
pub struct ContextGuard {
    previous: Option<Arc<ExecutionContext>>,
}

impl ContextGuard {
    pub fn enter(context: Arc<ExecutionContext>) -> Self {
        Self {
            previous: Some(ContextStore::enter_with(context)),
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            ContextStore::enter_with(previous);
        }
    }
}

/// 携带上下文的 future
///
/// 每次 poll 前进入所携带的上下文，poll 结束后记录任务内部对上下文的修改
/// 并恢复外部上下文，使上下文沿同一逻辑续体传播。
pub struct ContextFuture<F> {
    context: Arc<ExecutionContext>,
    inner: Pin<Box<F>>,
}

impl<F> ContextFuture<F> {
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }
}

impl<F: Future> Future for ContextFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _guard = ContextGuard::enter(this.context.clone());
        let poll = this.inner.as_mut().poll(cx);
        this.context = ContextStore::current();
        poll
    }
}
