//! 最小追踪器契约
//!
//! 生命周期控制器只依赖这里定义的 `Tracer` / `Span` 特征，
//! 具体的追踪器实现（内存、导出器等）由外部提供。

use crate::instrument::FnError;
use crate::types::Tags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 共享的 Span 引用
pub type SpanRef = Arc<dyn Span>;

/// Span 状态：`Pending → Active → Finished`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanState {
    /// 已创建，尚未开始计时
    Pending,
    /// 计时中
    Active,
    /// 已结束
    Finished,
}

/// Span 特征
pub trait Span: Send + Sync + fmt::Debug {
    fn span_id(&self) -> u64;

    fn trace_id(&self) -> u64;

    fn parent_id(&self) -> Option<u64>;

    fn name(&self) -> &str;

    fn state(&self) -> SpanState;

    /// 设置标签，Span 结束后返回 `false` 且不修改
    fn set_tag(&self, key: &str, value: &str) -> bool;

    /// 记录错误，只在 `Active` 状态下生效
    fn add_error(&self, error: &FnError);

    /// 结束 Span，重复调用无效
    fn finish(&self);

    fn is_finished(&self) -> bool {
        self.state() == SpanState::Finished
    }
}

/// 创建 Span 的参数
#[derive(Debug, Clone, Default)]
pub struct SpanOptions {
    /// 父 Span
    pub child_of: Option<SpanRef>,
    /// 初始标签
    pub tags: Tags,
}

impl SpanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_of(mut self, parent: Option<SpanRef>) -> Self {
        self.child_of = parent;
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
}

/// 追踪器特征
pub trait Tracer: Send + Sync {
    /// 创建并启动 Span
    fn start_span(&self, name: &str, options: SpanOptions) -> SpanRef;

    /// 默认服务名
    fn service_name(&self) -> &str;
}
