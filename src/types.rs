//! 插桩核心数据类型
//!
//! 钩子描述符、标签以及跨模块共享的基础类型

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Span 标签
pub type Tags = BTreeMap<String, String>;

/// 标准标签键
pub const SERVICE_NAME_TAG: &str = "service.name";
pub const SPAN_KIND_TAG: &str = "span.kind";

/// 钩子描述符 - 标识一个补丁目标
///
/// 两个描述符当且仅当 `name` 与 `qualifier` 相同时等价，
/// 版本范围不参与比较。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookDescriptor {
    /// 包名
    pub name: String,
    /// 版本范围
    pub versions: Option<Vec<String>>,
    /// 包内文件（为空表示主入口）
    pub qualifier: Option<String>,
}

impl HookDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: None,
            qualifier: None,
        }
    }

    /// 设置版本范围
    pub fn with_versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.versions = Some(versions.into_iter().map(Into::into).collect());
        self
    }

    /// 限定到包内的某个文件
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    /// 加载器视角下的模块名：`name` 或 `name/qualifier`
    pub fn module_name(&self) -> String {
        match self.qualifier.as_deref().filter(|q| !q.is_empty()) {
            Some(file) => format!("{}/{}", self.name, file),
            None => self.name.clone(),
        }
    }
}

impl PartialEq for HookDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.qualifier == other.qualifier
    }
}

impl Eq for HookDescriptor {}

impl std::hash::Hash for HookDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.qualifier.hash(state);
    }
}

impl fmt::Display for HookDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.module_name())?;
        if let Some(ref versions) = self.versions {
            write!(f, "@{}", versions.join(" || "))?;
        }
        Ok(())
    }
}

/// Span 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Client,
    Server,
    Producer,
    Consumer,
    Internal,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Client => "client",
            SpanKind::Server => "server",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
            SpanKind::Internal => "internal",
        }
    }
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_descriptor_equivalence_ignores_versions() {
        let a = HookDescriptor::new("dns").with_versions([">=1"]);
        let b = HookDescriptor::new("dns").with_versions(["<1"]);
        let c = HookDescriptor::new("dns").with_qualifier("lib/resolver.js");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_module_name() {
        assert_eq!(HookDescriptor::new("moleculer").module_name(), "moleculer");
        assert_eq!(
            HookDescriptor::new("moleculer")
                .with_qualifier("src/service-broker.js")
                .module_name(),
            "moleculer/src/service-broker.js"
        );
    }

    #[test]
    fn test_span_kind_serialization() {
        let kind: SpanKind = serde_json::from_str("\"client\"").unwrap();
        assert_eq!(kind, SpanKind::Client);
        assert_eq!(kind.to_string(), "client");
    }
}
