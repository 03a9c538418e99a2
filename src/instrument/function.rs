//! 宿主函数模型
//!
//! 被插桩的目标是回调风格的异步函数：参数列表的最后一个参数是
//! 错误优先的一次性回调 `(error, result)`；同步"抛出"用 `Err(FnError)` 表示。

use crate::core::ContextStore;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// 函数调用结果
pub type CallResult = std::result::Result<Value, FnError>;

/// 函数体
pub type FunctionBody = Arc<dyn Fn(Vec<Arg>) -> CallResult + Send + Sync>;

type CallbackFn = Box<dyn FnOnce(Option<FnError>, Option<Value>) + Send>;

struct FnErrorInner {
    error: anyhow::Error,
    detail: OnceCell<String>,
}

/// 被插桩函数产生的错误
///
/// 克隆共享同一个底层错误对象，可以用 [`FnError::ptr_eq`] 判断是否为同一错误。
#[derive(Clone)]
pub struct FnError {
    inner: Arc<FnErrorInner>,
}

impl FnError {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::from_anyhow(anyhow::Error::new(error))
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::from_anyhow(anyhow::Error::msg(message))
    }

    pub fn from_anyhow(error: anyhow::Error) -> Self {
        Self {
            inner: Arc::new(FnErrorInner {
                error,
                detail: OnceCell::new(),
            }),
        }
    }

    /// 生成并固定诊断详情（错误链与构造处的回溯）
    ///
    /// 只在第一次调用时渲染，之后返回同一份文本。
    pub fn materialize(&self) -> &str {
        self.inner
            .detail
            .get_or_init(|| format!("{:?}", self.inner.error))
    }

    /// 已固定的诊断详情
    pub fn detail(&self) -> Option<&str> {
        self.inner.detail.get().map(String::as_str)
    }

    pub fn ptr_eq(&self, other: &FnError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn as_anyhow(&self) -> &anyhow::Error {
        &self.inner.error
    }
}

impl fmt::Display for FnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.error, f)
    }
}

impl fmt::Debug for FnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnError")
            .field("message", &self.inner.error.to_string())
            .field("materialized", &self.inner.detail.get().is_some())
            .finish()
    }
}

impl std::error::Error for FnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.error.source()
    }
}

/// 一次性错误优先回调
///
/// 克隆共享同一个回调，只有第一次调用会执行。
#[derive(Clone)]
pub struct Callback {
    inner: Arc<Mutex<Option<CallbackFn>>>,
}

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Option<FnError>, Option<Value>) + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    /// 调用回调，已被调用过时返回 `false`
    pub fn invoke(&self, error: Option<FnError>, result: Option<Value>) -> bool {
        let callback = self.inner.lock().take();
        match callback {
            Some(callback) => {
                callback(error, result);
                true
            }
            None => {
                warn!("Callback invoked more than once, ignoring");
                false
            }
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// 绑定到当前执行上下文：回调执行时恢复绑定时的上下文
    pub fn bind_to_current(self) -> Callback {
        let context = ContextStore::current();
        Callback::new(move |error, result| {
            ContextStore::run(context, || {
                self.invoke(error, result);
            })
        })
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// 函数参数
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    Callback(Callback),
}

impl Arg {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(value) => Some(value),
            Arg::Callback(_) => None,
        }
    }

    pub fn as_callback(&self) -> Option<&Callback> {
        match self {
            Arg::Callback(callback) => Some(callback),
            Arg::Value(_) => None,
        }
    }

    pub fn is_callback(&self) -> bool {
        matches!(self, Arg::Callback(_))
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Value(Value::String(value.to_string()))
    }
}

impl From<Callback> for Arg {
    fn from(callback: Callback) -> Self {
        Arg::Callback(callback)
    }
}

/// 包装记录
#[derive(Debug)]
pub struct WrapRecord {
    /// 通道前缀
    pub prefix: String,
    /// 可追踪调用的最少参数个数
    pub min_args: usize,
    /// 原始函数
    pub original: HostFunction,
}

/// 宿主函数
///
/// 名称、参数个数和属性表构成可被使用方内省的元数据，
/// 包装后的函数会完整复制这些元数据。
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    arity: usize,
    properties: BTreeMap<String, Value>,
    body: FunctionBody,
    wrap_record: Option<Arc<WrapRecord>>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, arity: usize, body: F) -> Self
    where
        F: Fn(Vec<Arg>) -> CallResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity,
            properties: BTreeMap::new(),
            body: Arc::new(body),
            wrap_record: None,
        }
    }

    /// 以 `original` 的元数据构造包装函数
    pub(crate) fn wrapping(original: &HostFunction, body: FunctionBody, record: WrapRecord) -> Self {
        Self {
            name: original.name.clone(),
            arity: original.arity,
            properties: original.properties.clone(),
            body,
            wrap_record: Some(Arc::new(record)),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// 调用函数
    pub fn call(&self, args: Vec<Arg>) -> CallResult {
        (self.body)(args)
    }

    pub fn is_wrapped(&self) -> bool {
        self.wrap_record.is_some()
    }

    pub fn wrap_record(&self) -> Option<&WrapRecord> {
        self.wrap_record.as_deref()
    }

    /// 还原为未包装的原始函数
    pub fn unwrap_original(&self) -> HostFunction {
        match self.wrap_record {
            Some(ref record) => record.original.unwrap_original(),
            None => self.clone(),
        }
    }

    /// 是否共享同一个函数体
    pub fn same_body(&self, other: &HostFunction) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("properties", &self.properties)
            .field("wrapped", &self.is_wrapped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_callback_is_single_shot() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let calls = calls.clone();
            Callback::new(move |error, result| {
                calls.lock().push((error.is_some(), result));
            })
        };

        let clone = callback.clone();
        assert!(callback.invoke(None, Some(json!("1.2.3.4"))));
        assert!(!clone.invoke(None, Some(json!("5.6.7.8"))));
        assert!(clone.is_consumed());
        assert_eq!(*calls.lock(), vec![(false, Some(json!("1.2.3.4")))]);
    }

    #[test]
    fn test_error_identity_and_materialize() {
        let error = FnError::msg("boom");
        let same = error.clone();
        let other = FnError::msg("boom");

        assert!(error.ptr_eq(&same));
        assert!(!error.ptr_eq(&other));
        assert!(same.detail().is_none());

        let detail = error.materialize().to_string();
        assert!(detail.contains("boom"));
        assert_eq!(same.detail(), Some(detail.as_str()));
        assert_eq!(error.to_string(), "boom");
    }

    #[test]
    fn test_unwrap_original_without_wrapper() {
        let f = HostFunction::new("lookup", 2, |_| Ok(Value::Null))
            .with_property("custom", json!(true));

        let original = f.unwrap_original();
        assert!(original.same_body(&f));
        assert_eq!(original.property("custom"), Some(&json!(true)));
        assert!(!f.is_wrapped());
    }
}
