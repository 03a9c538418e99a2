//! 模块导出对象
//!
//! 可共享、可原地修改的命名空间。钩子通过它替换模块的方法，
//! 已经持有导出对象的使用方会立刻看到替换结果。

use super::function::HostFunction;
use crate::{InstrumentError, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 导出成员
#[derive(Debug, Clone)]
pub enum Member {
    Function(HostFunction),
    Namespace(Exports),
    Value(Value),
}

/// 模块导出对象
#[derive(Clone, Default)]
pub struct Exports {
    members: Arc<RwLock<BTreeMap<String, Member>>>,
}

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    /// 构建时添加函数
    pub fn with_function(self, name: impl Into<String>, function: HostFunction) -> Self {
        self.set(name, Member::Function(function));
        self
    }

    /// 构建时添加子命名空间
    pub fn with_namespace(self, name: impl Into<String>, namespace: Exports) -> Self {
        self.set(name, Member::Namespace(namespace));
        self
    }

    /// 构建时添加普通值
    pub fn with_value(self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, Member::Value(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<Member> {
        self.members.read().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, member: Member) {
        self.members.write().insert(name.into(), member);
    }

    pub fn function(&self, name: &str) -> Option<HostFunction> {
        match self.get(name)? {
            Member::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn namespace(&self, name: &str) -> Option<Exports> {
        match self.get(name)? {
            Member::Namespace(namespace) => Some(namespace),
            _ => None,
        }
    }

    pub fn value(&self, name: &str) -> Option<Value> {
        match self.get(name)? {
            Member::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn set_function(&self, name: impl Into<String>, function: HostFunction) {
        self.set(name, Member::Function(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.read().contains_key(name)
    }

    pub fn keys(&self) -> Vec<String> {
        self.members.read().keys().cloned().collect()
    }

    /// 原地替换一个函数成员
    ///
    /// 成员不存在时返回 `Ok(false)`；成员存在但不是函数时返回错误。
    pub fn patch_function<F>(&self, name: &str, patch: F) -> Result<bool>
    where
        F: FnOnce(&HostFunction) -> Result<HostFunction>,
    {
        let current = match self.get(name) {
            None => return Ok(false),
            Some(Member::Function(function)) => function,
            Some(_) => {
                return Err(InstrumentError::module(&format!(
                    "Export '{}' is not a function",
                    name
                )))
            }
        };

        let patched = patch(&current)?;
        self.set_function(name, patched);
        Ok(true)
    }

    /// 是否为同一个导出对象
    pub fn ptr_eq(&self, other: &Exports) -> bool {
        Arc::ptr_eq(&self.members, &other.members)
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exports")
            .field("members", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup() -> HostFunction {
        HostFunction::new("lookup", 2, |_| Ok(json!("127.0.0.1")))
    }

    #[test]
    fn test_mutation_visible_through_clones() {
        let exports = Exports::new().with_function("lookup", lookup());
        let held_by_consumer = exports.clone();

        let replacement = HostFunction::new("lookup", 2, |_| Ok(json!("10.0.0.1")));
        exports.set_function("lookup", replacement);

        let f = held_by_consumer.function("lookup").unwrap();
        assert_eq!(f.call(vec![]).unwrap(), json!("10.0.0.1"));
        assert!(exports.ptr_eq(&held_by_consumer));
    }

    #[test]
    fn test_patch_function() {
        let exports = Exports::new()
            .with_function("lookup", lookup())
            .with_value("ADDRCONFIG", json!(1024));

        let patched = exports
            .patch_function("lookup", |f| Ok(f.clone().with_property("patched", json!(true))))
            .unwrap();
        assert!(patched);
        assert_eq!(
            exports.function("lookup").unwrap().property("patched"),
            Some(&json!(true))
        );

        assert!(!exports.patch_function("missing", |f| Ok(f.clone())).unwrap());
        assert!(exports.patch_function("ADDRCONFIG", |f| Ok(f.clone())).is_err());
    }

    #[test]
    fn test_nested_namespace() {
        let prototype = Exports::new().with_function("resolve", lookup());
        let exports = Exports::new().with_namespace("Resolver", prototype.clone());

        let resolver = exports.namespace("Resolver").unwrap();
        assert!(resolver.ptr_eq(&prototype));
        assert!(resolver.function("resolve").is_some());
        assert!(exports.function("Resolver").is_none());
    }
}
