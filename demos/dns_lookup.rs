//! DNS 插桩演示
//!
//! 注册一个 `dns` 内置模块的钩子，加载模块时包装其回调函数，
//! 再由追踪插件把每次调用记录为内存中的 Span。

use apm_instrument::instrument::wrap;
use apm_instrument::plugins::{add_hook, require_host, InvocationInfo, TracingPlugin, WrappedHooks};
use apm_instrument::{
    init_logging, Arg, Callback, ConfigManager, Exports, FnError, HookDescriptor, HostFunction,
    MemoryTracer, SpanKind, Tags,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// 需要包装的方法：(方法名, 通道前缀, 最少参数个数)
const DNS_METHODS: &[(&str, &str, usize)] = &[
    ("lookup", "apm:dns:lookup", 2),
    ("lookupService", "apm:dns:lookup_service", 3),
    ("resolve", "apm:dns:resolve", 2),
    ("reverse", "apm:dns:reverse", 2),
    ("resolve4", "apm:dns:resolve:A", 2),
    ("resolve6", "apm:dns:resolve:AAAA", 2),
];

/// 模拟的 DNS 模块，在 tokio 任务中异步完成回调
fn dns_module() -> Exports {
    let lookup = HostFunction::new("lookup", 3, |mut args| {
        let hostname = args
            .first()
            .and_then(Arg::as_value)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(Arg::Callback(cb)) = args.pop() {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if hostname.ends_with(".invalid") {
                    cb.invoke(Some(FnError::msg(format!("getaddrinfo ENOTFOUND {}", hostname))), None);
                } else {
                    cb.invoke(None, Some(json!("127.0.0.1")));
                }
            });
        }
        Ok(Value::Null)
    });

    let reverse = HostFunction::new("reverse", 2, |args| match args.first().and_then(Arg::as_value) {
        Some(Value::String(_)) => Ok(Value::Null),
        _ => Err(FnError::msg("The \"ip\" argument must be of type string")),
    });

    Exports::new()
        .with_function("lookup", lookup)
        .with_function("reverse", reverse)
        .with_value("ADDRCONFIG", json!(1024))
}

fn instrument_dns(dns: &Exports) -> Option<Exports> {
    for &(method, prefix, min_args) in DNS_METHODS {
        match dns.patch_function(method, |f| wrap(prefix, f, min_args)) {
            Ok(true) => info!(method, prefix, "Wrapped dns method"),
            Ok(false) => {}
            Err(e) => warn!(method, error = %e, "Failed to wrap dns method"),
        }
    }
    None
}

fn hostname_tags(info: &InvocationInfo<'_>) -> Tags {
    let mut tags = Tags::new();
    if let Some(Value::String(hostname)) = info.args.first().and_then(Arg::as_value) {
        tags.insert("dns.hostname".to_string(), hostname.clone());
    }
    tags
}

async fn lookup(dns: &Exports, hostname: &str) -> anyhow::Result<Option<Value>> {
    let function = dns
        .function("lookup")
        .ok_or_else(|| anyhow::anyhow!("dns.lookup is missing"))?;

    let (tx, rx) = oneshot::channel();
    let callback = Callback::new(move |error, result| {
        let _ = tx.send(match error {
            Some(error) => Err(error),
            None => Ok(result),
        });
    });
    function.call(vec![Arg::from(hostname), callback.into()])?;

    Ok(rx.await??)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = ConfigManager::new_default();
    init_logging(&config.get_config().logging);

    let tracer = Arc::new(MemoryTracer::new("dns-demo"));
    let plugin = TracingPlugin::new("dns", Some(SpanKind::Client), tracer.clone());
    plugin.add_wrapped_subscriptions(
        "apm:dns:lookup",
        "dns.lookup",
        WrappedHooks::new()
            .with_tags(hostname_tags)
            .on_async_end(|info| {
                if let (Some(span), Some(Value::String(address))) = (info.span, info.result) {
                    span.set_tag("dns.address", address);
                }
            }),
    )?;
    plugin.add_wrapped_subscriptions("apm:dns:reverse", "dns.reverse", WrappedHooks::new())?;
    plugin.configure(config.plugin_config("dns"));

    add_hook(HookDescriptor::new("dns"), instrument_dns);
    let dns = require_host().load("dns", || Ok(dns_module()))?;

    match lookup(&dns, "localhost").await {
        Ok(address) => info!(?address, "Resolved localhost"),
        Err(e) => warn!(error = %e, "Lookup failed"),
    }
    if let Err(e) = lookup(&dns, "nowhere.invalid").await {
        info!(error = %e, "Lookup failed as expected");
    }

    if let Some(reverse) = dns.function("reverse") {
        let callback = Callback::new(|_, _| {});
        if let Err(e) = reverse.call(vec![Arg::Value(json!(42)), callback.into()]) {
            info!(error = %e, "Reverse rejected its argument");
        }
    }

    for span in tracer.finished_spans() {
        println!("{}", serde_json::to_string_pretty(&span)?);
    }
    println!("open spans: {}", tracer.open_spans().len());

    Ok(())
}
