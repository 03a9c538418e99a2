//! 插件层
//!
//! 模块加载拦截、版本匹配以及把生命周期事件映射为 Span 的追踪插件

pub mod interceptor;
pub mod loader;
pub mod tracing_plugin;
pub mod version;

pub use interceptor::{add_hook, Interceptor, ModuleHook};
pub use loader::{
    import_host, read_version, require_host, LoadedModule, LoaderBackend, LoaderHook,
    ModuleDetails, ModuleHost, ModuleLoadEvent, PackageManifest,
};
pub use tracing_plugin::{
    InvocationInfo, ResultHook, Subscription, TagsHook, TracingPlugin, WrappedHooks,
};
pub use version::match_version;
