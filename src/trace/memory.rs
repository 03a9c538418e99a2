//! 内存追踪器
//!
//! 在进程内记录 Span 的追踪器实现，用于检查插桩结果以及演示。

use super::span::{Span, SpanOptions, SpanRef, SpanState, Tracer};
use crate::instrument::FnError;
use crate::types::Tags;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// 错误标签键
pub const ERROR_MESSAGE_TAG: &str = "error.message";
pub const ERROR_STACK_TAG: &str = "error.stack";

/// 已记录的 Span 快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub span_id: u64,
    pub trace_id: u64,
    pub parent_id: Option<u64>,
    pub name: String,
    pub state: SpanState,
    pub tags: Tags,
    /// 是否记录了错误
    pub error: bool,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// 结束次数（正常应为 0 或 1）
    pub finish_count: u32,
}

impl SpanRecord {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct SpanInner {
    state: SpanState,
    tags: Tags,
    error: bool,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    finish_count: u32,
}

/// 内存 Span
#[derive(Debug)]
pub struct MemorySpan {
    span_id: u64,
    trace_id: u64,
    parent_id: Option<u64>,
    name: String,
    inner: Mutex<SpanInner>,
}

impl MemorySpan {
    fn new(name: &str, parent: Option<&SpanRef>, tags: Tags) -> Self {
        let span_id = rand::random::<u64>();
        let trace_id = parent.map(|p| p.trace_id()).unwrap_or(span_id);

        Self {
            span_id,
            trace_id,
            parent_id: parent.map(|p| p.span_id()),
            name: name.to_string(),
            inner: Mutex::new(SpanInner {
                state: SpanState::Pending,
                tags,
                error: false,
                start: None,
                end: None,
                finish_count: 0,
            }),
        }
    }

    fn activate(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SpanState::Pending {
            inner.state = SpanState::Active;
            inner.start = Some(Utc::now());
        }
    }

    /// 当前快照
    pub fn record(&self) -> SpanRecord {
        let inner = self.inner.lock();
        SpanRecord {
            span_id: self.span_id,
            trace_id: self.trace_id,
            parent_id: self.parent_id,
            name: self.name.clone(),
            state: inner.state,
            tags: inner.tags.clone(),
            error: inner.error,
            start: inner.start,
            end: inner.end,
            finish_count: inner.finish_count,
        }
    }
}

impl Span for MemorySpan {
    fn span_id(&self) -> u64 {
        self.span_id
    }

    fn trace_id(&self) -> u64 {
        self.trace_id
    }

    fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> SpanState {
        self.inner.lock().state
    }

    fn set_tag(&self, key: &str, value: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SpanState::Finished {
            warn!(span = %self.name, key, "Ignoring tag on finished span");
            return false;
        }
        inner.tags.insert(key.to_string(), value.to_string());
        true
    }

    fn add_error(&self, error: &FnError) {
        let mut inner = self.inner.lock();
        if inner.state != SpanState::Active {
            warn!(span = %self.name, state = ?inner.state, "Ignoring error on inactive span");
            return;
        }
        inner.error = true;
        inner.tags.insert(ERROR_MESSAGE_TAG.to_string(), error.to_string());
        inner.tags.insert(ERROR_STACK_TAG.to_string(), error.materialize().to_string());
    }

    fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.finish_count += 1;
        if inner.state == SpanState::Finished {
            debug!(span = %self.name, "Span already finished");
            return;
        }
        let end = Utc::now();
        inner.state = SpanState::Finished;
        inner.end = Some(end);

        let duration_ms = inner
            .start
            .map(|start| (end - start).num_milliseconds())
            .unwrap_or(0);
        debug!(
            span = %self.name,
            span_id = self.span_id,
            trace_id = self.trace_id,
            error = inner.error,
            duration_ms,
            "Span finished"
        );
    }
}

/// 内存追踪器
#[derive(Debug)]
pub struct MemoryTracer {
    service: String,
    spans: Mutex<Vec<Arc<MemorySpan>>>,
}

impl MemoryTracer {
    /// 创建新的内存追踪器
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            spans: Mutex::new(Vec::new()),
        }
    }

    /// 按创建顺序返回所有 Span 的快照
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.spans.lock().iter().map(|s| s.record()).collect()
    }

    /// 已结束的 Span
    pub fn finished_spans(&self) -> Vec<SpanRecord> {
        self.spans()
            .into_iter()
            .filter(|s| s.state == SpanState::Finished)
            .collect()
    }

    /// 尚未结束的 Span
    pub fn open_spans(&self) -> Vec<SpanRecord> {
        self.spans()
            .into_iter()
            .filter(|s| s.state != SpanState::Finished)
            .collect()
    }

    pub fn clear(&self) {
        self.spans.lock().clear();
    }
}

impl Tracer for MemoryTracer {
    fn start_span(&self, name: &str, options: SpanOptions) -> SpanRef {
        let span = Arc::new(MemorySpan::new(name, options.child_of.as_ref(), options.tags));
        span.activate();
        self.spans.lock().push(span.clone());
        span
    }

    fn service_name(&self) -> &str {
        &self.service
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_lifecycle() {
        let tracer = MemoryTracer::new("test-service");
        let span = tracer.start_span("dns.lookup", SpanOptions::new());

        assert_eq!(span.state(), SpanState::Active);
        assert!(span.set_tag("dns.hostname", "localhost"));

        span.finish();
        assert!(span.is_finished());
        assert!(!span.set_tag("late", "tag"));

        let records = tracer.finished_spans();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tags.get("dns.hostname").unwrap(), "localhost");
        assert!(!records[0].tags.contains_key("late"));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let tracer = MemoryTracer::new("test-service");
        let span = tracer.start_span("op", SpanOptions::new());
        span.finish();
        let end = tracer.spans()[0].end;
        span.finish();

        let record = &tracer.spans()[0];
        assert_eq!(record.end, end);
        assert_eq!(record.finish_count, 2);
    }

    #[test]
    fn test_error_ignored_after_finish() {
        let tracer = MemoryTracer::new("test-service");
        let span = tracer.start_span("op", SpanOptions::new());

        span.add_error(&FnError::msg("first"));
        span.finish();
        span.add_error(&FnError::msg("second"));

        let record = &tracer.finished_spans()[0];
        assert!(record.error);
        assert_eq!(record.tags.get(ERROR_MESSAGE_TAG).unwrap(), "first");
    }

    #[test]
    fn test_child_inherits_trace() {
        let tracer = MemoryTracer::new("test-service");
        let parent = tracer.start_span("parent", SpanOptions::new());
        let child = tracer.start_span("child", SpanOptions::new().child_of(Some(parent.clone())));

        assert_eq!(child.trace_id(), parent.trace_id());
        assert_eq!(child.parent_id(), Some(parent.span_id()));
        assert_eq!(tracer.open_spans().len(), 2);
    }
}
