//! 模块加载器
//!
//! 进程内的模块缓存和加载钩子。一个 `ModuleHost` 既可以扮演 "require"
//! 风格的加载器，也可以扮演 "import" 风格的加载器；拦截器通过
//! `LoaderBackend` 特征与它们交互。

use crate::instrument::Exports;
use crate::{InstrumentError, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const NODE_MODULES: &str = "/node_modules/";
const MANIFEST_FILE: &str = "package.json";
const DEFAULT_MAIN: &str = "index.js";

/// 包清单（`package.json` 的子集）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub main: Option<String>,
}

impl PackageManifest {
    /// 读取包根目录下的清单
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| {
            InstrumentError::manifest(&format!("Invalid {}: {}", path.display(), e))
        })
    }

    /// 规范化后的入口文件，默认 `index.js`
    pub fn main_file(&self) -> String {
        normalize_posix(self.main.as_deref().unwrap_or(DEFAULT_MAIN))
    }
}

/// 读取包版本；清单缺失或损坏时版本未知
pub fn read_version(base_dir: Option<&Path>) -> Option<String> {
    let base_dir = base_dir?;
    match PackageManifest::load(base_dir) {
        Ok(manifest) => manifest.version,
        Err(e) => {
            warn!(base_dir = %base_dir.display(), error = %e, "Failed to read package manifest");
            None
        }
    }
}

/// 规范化 POSIX 风格的相对路径：去掉 `.`，折叠 `..`，统一分隔符
pub fn normalize_posix(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(|c| c == '/' || c == '\\') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return ".".to_string();
    }
    parts.join("/")
}

/// 从模块文件路径中解析出的包信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDetails {
    /// 包名，可能带 `@scope/` 前缀
    pub name: String,
    /// 包根目录
    pub base_dir: String,
    /// 文件相对包根目录的路径
    pub path: String,
}

impl ModuleDetails {
    /// 按最后一个 `node_modules` 段解析；不在任何包内时返回 `None`
    pub fn from_path(id: &str) -> Option<Self> {
        let id = id.replace('\\', "/");
        let index = id.rfind(NODE_MODULES)?;
        let rest = &id[index + NODE_MODULES.len()..];

        let name_segments = if rest.starts_with('@') { 2 } else { 1 };
        let mut segments = rest.splitn(name_segments + 1, '/');
        let name_parts: Vec<&str> = segments.by_ref().take(name_segments).collect();
        if name_parts.len() < name_segments || name_parts.iter().any(|s| s.is_empty()) {
            return None;
        }
        let name = name_parts.join("/");
        let path = segments.next().unwrap_or("").to_string();

        Some(Self {
            base_dir: format!("{}{}{}", &id[..index], NODE_MODULES, name),
            path,
            name,
        })
    }
}

/// 一次模块加载通知
#[derive(Debug)]
pub struct ModuleLoadEvent<'a> {
    /// 模块标识（文件路径或内置模块名）
    pub id: &'a str,
    /// 包名（入口文件）或 `包名/相对路径`（其它文件）
    pub module_name: &'a str,
    /// 包根目录；内置模块没有
    pub base_dir: Option<&'a Path>,
    pub exports: &'a Exports,
}

/// 加载钩子：返回 `Some` 时替换模块导出对象
pub type LoaderHook = Arc<dyn Fn(&ModuleLoadEvent<'_>) -> Option<Exports> + Send + Sync>;

/// 缓存中的模块
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub id: String,
    pub exports: Exports,
}

/// 模块加载器后端
pub trait LoaderBackend: Send + Sync {
    /// 后端名称，用于区分补丁记录
    fn name(&self) -> &str;

    /// 注册加载钩子，只对 `modules` 中列出的包生效
    fn add_load_hook(&self, modules: Vec<String>, hook: LoaderHook);

    /// 当前缓存的全部模块快照
    fn loaded_modules(&self) -> Vec<LoadedModule>;

    /// 替换缓存中的导出对象，模块不存在时返回 `false`
    fn replace_exports(&self, id: &str, exports: Exports) -> bool;
}

struct HookEntry {
    modules: Vec<String>,
    hook: LoaderHook,
}

/// 进程内模块加载器
pub struct ModuleHost {
    name: String,
    cache: RwLock<BTreeMap<String, Exports>>,
    hooks: RwLock<Vec<HookEntry>>,
}

impl ModuleHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache: RwLock::new(BTreeMap::new()),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// 加载模块
    ///
    /// 已缓存时直接返回缓存的导出对象；否则运行工厂函数，
    /// 依次交给匹配的加载钩子处理，再写入缓存。
    pub fn load<F>(&self, id: &str, factory: F) -> Result<Exports>
    where
        F: FnOnce() -> Result<Exports>,
    {
        if let Some(exports) = self.get(id) {
            return Ok(exports);
        }

        let mut exports = factory()?;

        if let Some((package, module_name, base_dir)) = resolve_module_name(id) {
            let hooks: Vec<LoaderHook> = self
                .hooks
                .read()
                .iter()
                .filter(|entry| entry.modules.iter().any(|m| m == &package))
                .map(|entry| entry.hook.clone())
                .collect();

            for hook in hooks {
                let event = ModuleLoadEvent {
                    id,
                    module_name: &module_name,
                    base_dir: base_dir.as_deref().map(Path::new),
                    exports: &exports,
                };
                if let Some(replacement) = hook(&event) {
                    debug!(loader = %self.name, module = id, "Load hook replaced exports");
                    exports = replacement;
                }
            }
        }

        let mut cache = self.cache.write();
        let exports = cache.entry(id.to_string()).or_insert(exports).clone();
        debug!(loader = %self.name, module = id, "Loaded module");
        Ok(exports)
    }

    /// 读取缓存中的模块
    pub fn get(&self, id: &str) -> Option<Exports> {
        self.cache.read().get(id).cloned()
    }

    /// 缓存中的模块数量
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

impl LoaderBackend for ModuleHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_load_hook(&self, modules: Vec<String>, hook: LoaderHook) {
        self.hooks.write().push(HookEntry { modules, hook });
    }

    fn loaded_modules(&self) -> Vec<LoadedModule> {
        self.cache
            .read()
            .iter()
            .map(|(id, exports)| LoadedModule {
                id: id.clone(),
                exports: exports.clone(),
            })
            .collect()
    }

    fn replace_exports(&self, id: &str, exports: Exports) -> bool {
        match self.cache.write().get_mut(id) {
            Some(slot) => {
                *slot = exports;
                true
            }
            None => false,
        }
    }
}

/// 计算 `(包名, 模块名, 包根目录)`
///
/// 不含分隔符的标识是内置模块，模块名即标识本身；
/// 不在任何包内的文件返回 `None`，加载钩子不会被触发。
fn resolve_module_name(id: &str) -> Option<(String, String, Option<String>)> {
    if !id.contains('/') && !id.contains('\\') {
        return Some((id.to_string(), id.to_string(), None));
    }

    let details = ModuleDetails::from_path(id)?;
    let main_file = match PackageManifest::load(Path::new(&details.base_dir)) {
        Ok(manifest) => manifest.main_file(),
        Err(e) => {
            warn!(module = id, error = %e, "Failed to read package manifest");
            DEFAULT_MAIN.to_string()
        }
    };

    let module_name = if normalize_posix(&details.path) == main_file {
        details.name.clone()
    } else {
        format!("{}/{}", details.name, details.path)
    };
    Some((details.name, module_name, Some(details.base_dir)))
}

static REQUIRE_HOST: Lazy<Arc<ModuleHost>> = Lazy::new(|| Arc::new(ModuleHost::new("require")));
static IMPORT_HOST: Lazy<Arc<ModuleHost>> = Lazy::new(|| Arc::new(ModuleHost::new("import")));

/// 进程级 "require" 风格加载器
pub fn require_host() -> Arc<ModuleHost> {
    REQUIRE_HOST.clone()
}

/// 进程级 "import" 风格加载器
pub fn import_host() -> Arc<ModuleHost> {
    IMPORT_HOST.clone()
}

/// 在包根目录写入清单，主要用于准备测试和演示用的包目录
pub fn write_manifest(base_dir: &Path, manifest: &PackageManifest) -> Result<()> {
    std::fs::create_dir_all(base_dir)?;
    let content = serde_json::to_string_pretty(manifest)?;
    std::fs::write(base_dir.join(MANIFEST_FILE), content).map_err(InstrumentError::from)
}
