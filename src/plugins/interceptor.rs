//! 模块加载拦截器
//!
//! 为每个已注册的钩子描述符监听模块加载，对每个匹配的模块实例
//! 恰好调用一次钩子。匹配来源有两个：
//!
//! 1. 前向钩子：注册后新加载的模块，由加载器后端通知
//! 2. 追溯扫描：注册时后端缓存中已经存在的模块

use super::loader::{
    import_host, normalize_posix, read_version, require_host, LoaderBackend, LoaderHook,
    ModuleDetails, ModuleLoadEvent, PackageManifest,
};
use super::version::match_version;
use crate::instrument::Exports;
use crate::types::HookDescriptor;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 模块钩子：返回 `Some` 时替换模块的导出对象
pub type ModuleHook = Arc<dyn Fn(&Exports) -> Option<Exports> + Send + Sync>;

/// 补丁记录的键：（描述符，钩子身份，后端，模块标识）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatchKey {
    descriptor: HookDescriptor,
    hook: usize,
    backend: String,
    module_id: String,
}

impl PatchKey {
    fn new(descriptor: &HookDescriptor, hook: &ModuleHook, backend: &str, module_id: &str) -> Self {
        Self {
            descriptor: descriptor.clone(),
            hook: Arc::as_ptr(hook) as *const () as usize,
            backend: backend.to_string(),
            module_id: module_id.to_string(),
        }
    }
}

#[derive(Clone)]
struct Registration {
    descriptor: HookDescriptor,
    hook: ModuleHook,
}

type PatchedSet = Arc<Mutex<HashSet<PatchKey>>>;

/// 模块加载拦截器
pub struct Interceptor {
    backends: RwLock<Vec<Arc<dyn LoaderBackend>>>,
    registrations: RwLock<Vec<Registration>>,
    patched: PatchedSet,
}

impl Interceptor {
    /// 创建没有后端的拦截器
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            registrations: RwLock::new(Vec::new()),
            patched: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// 使用给定后端创建
    pub fn with_backends(backends: Vec<Arc<dyn LoaderBackend>>) -> Self {
        let interceptor = Self::new();
        *interceptor.backends.write() = backends;
        interceptor
    }

    /// 进程级拦截器，监听 "require" 和 "import" 两个加载器
    pub fn global() -> &'static Interceptor {
        static GLOBAL: Lazy<Interceptor> = Lazy::new(|| {
            let require: Arc<dyn LoaderBackend> = require_host();
            let import: Arc<dyn LoaderBackend> = import_host();
            Interceptor::with_backends(vec![require, import])
        });
        &GLOBAL
    }

    /// 注册钩子
    ///
    /// 同一描述符和同一钩子（按 `Arc` 身份）重复注册时，
    /// 已经处理过的模块实例不会再次触发钩子。
    pub fn register(&self, descriptor: HookDescriptor, hook: ModuleHook) {
        info!(module = %descriptor, "Registering module hook");

        let registration = Registration { descriptor, hook };
        self.registrations.write().push(registration.clone());

        let backends: Vec<Arc<dyn LoaderBackend>> = self.backends.read().clone();
        for backend in backends {
            self.attach(&backend, &registration);
        }
    }

    /// 添加加载器后端，并对其重放已有的注册
    pub fn add_backend(&self, backend: Arc<dyn LoaderBackend>) {
        self.backends.write().push(backend.clone());

        let registrations: Vec<Registration> = self.registrations.read().clone();
        for registration in &registrations {
            self.attach(&backend, registration);
        }
    }

    /// 已注册的描述符
    pub fn descriptors(&self) -> Vec<HookDescriptor> {
        self.registrations
            .read()
            .iter()
            .map(|r| r.descriptor.clone())
            .collect()
    }

    /// 已打过补丁的模块实例数量
    pub fn patched_count(&self) -> usize {
        self.patched.lock().len()
    }

    fn attach(&self, backend: &Arc<dyn LoaderBackend>, registration: &Registration) {
        let loader_hook = forward_hook(backend.name(), registration, self.patched.clone());
        backend.add_load_hook(vec![registration.descriptor.name.clone()], loader_hook);
        self.scan_loaded(backend, registration);
    }

    /// 追溯扫描后端缓存中已有的模块
    fn scan_loaded(&self, backend: &Arc<dyn LoaderBackend>, registration: &Registration) {
        let descriptor = &registration.descriptor;

        for module in backend.loaded_modules() {
            let version = match candidate_version(descriptor, &module.id) {
                Some(version) => version,
                None => continue,
            };
            if !match_version(version.as_deref(), descriptor.versions.as_deref()) {
                debug!(module = %module.id, ?version, "Loaded module version does not match");
                continue;
            }
            if !mark_patched(&self.patched, registration, backend.name(), &module.id) {
                continue;
            }

            debug!(backend = backend.name(), module = %module.id, "Applying hook to loaded module");
            if let Some(replacement) = (registration.hook)(&module.exports) {
                backend.replace_exports(&module.id, replacement);
            }
        }
    }
}

impl Default for Interceptor {
    fn default() -> Self {
        Self::new()
    }
}

/// 注册到进程级拦截器，返回钩子句柄以便重复注册
pub fn add_hook<F>(descriptor: HookDescriptor, hook: F) -> ModuleHook
where
    F: Fn(&Exports) -> Option<Exports> + Send + Sync + 'static,
{
    let hook: ModuleHook = Arc::new(hook);
    Interceptor::global().register(descriptor, hook.clone());
    hook
}

/// 记录补丁；已经存在时返回 `false`
fn mark_patched(patched: &PatchedSet, registration: &Registration, backend: &str, id: &str) -> bool {
    patched.lock().insert(PatchKey::new(
        &registration.descriptor,
        &registration.hook,
        backend,
        id,
    ))
}

fn forward_hook(backend: &str, registration: &Registration, patched: PatchedSet) -> LoaderHook {
    let backend = backend.to_string();
    let registration = registration.clone();
    let expected_name = registration.descriptor.module_name();

    Arc::new(move |event: &ModuleLoadEvent<'_>| {
        if event.module_name.replace('\\', "/") != expected_name {
            return None;
        }
        let version = read_version(event.base_dir);
        if !match_version(version.as_deref(), registration.descriptor.versions.as_deref()) {
            debug!(module = event.id, ?version, "Module version does not match");
            return None;
        }
        if !mark_patched(&patched, &registration, &backend, event.id) {
            return None;
        }

        debug!(backend = %backend, module = event.id, "Applying hook to newly loaded module");
        (registration.hook)(event.exports)
    })
}

/// 判断缓存中的模块是否是描述符的候选，并返回其版本
///
/// 外层 `None` 表示不是候选；内层 `None` 表示版本未知。
fn candidate_version(descriptor: &HookDescriptor, id: &str) -> Option<Option<String>> {
    if id == descriptor.name {
        return Some(None);
    }

    let id = id.replace('\\', "/");
    let package_dir = format!("/node_modules/{}/", descriptor.name);
    if !id.contains(&package_dir) {
        return None;
    }

    let details = ModuleDetails::from_path(&id)?;
    let manifest = match PackageManifest::load(Path::new(&details.base_dir)) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!(module = %id, error = %e, "Failed to read package manifest");
            None
        }
    };

    let expected_file = match descriptor.qualifier.as_deref().filter(|q| !q.is_empty()) {
        Some(qualifier) => normalize_posix(qualifier),
        None => manifest
            .as_ref()
            .map(PackageManifest::main_file)
            .unwrap_or_else(|| "index.js".to_string()),
    };
    if !id.ends_with(&format!("{}{}", package_dir, expected_file)) {
        return None;
    }

    Some(manifest.and_then(|m| m.version))
}
