//! 命名通道总线
//!
//! 进程级的发布/订阅注册表，按名称记忆化。发布是同步的：
//! 所有订阅者在发布者的调用栈内按订阅顺序执行。
//!
//! 订阅者列表在发布时做快照，发布过程中的订阅/取消订阅
//! 只影响之后的发布。

use crate::{InstrumentError, Result};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::{type_name, Any};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// 通道订阅处理器
pub type ChannelHandler<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// 订阅者标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

/// 命名通道
pub struct Channel<T> {
    /// 通道名称
    name: String,
    /// 按订阅顺序排列的处理器
    subscribers: RwLock<Vec<(SubscriberId, ChannelHandler<T>)>>,
    /// 订阅者序列号
    next_id: AtomicU64,
}

impl<T: 'static> Channel<T> {
    /// 创建新的通道
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 订阅通道
    pub fn subscribe<F>(&self, handler: F) -> SubscriberId
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(Arc::new(handler))
    }

    /// 订阅已共享的处理器
    pub fn subscribe_handler(&self, handler: ChannelHandler<T>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, handler));
        debug!(channel = %self.name, subscriber = id.0, "Subscribed to channel");
        id
    }

    /// 取消订阅，返回订阅者是否存在
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let original_len = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != original_len
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.read().is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// 发布消息
    ///
    /// 永不失败：处理器返回错误或发生 panic 时记录日志并继续执行其余处理器。
    pub fn publish(&self, payload: &T) {
        let snapshot: Vec<ChannelHandler<T>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(channel = %self.name, error = %e, "Channel subscriber failed");
                }
                Err(cause) => {
                    error!(
                        channel = %self.name,
                        panic = %panic_message(cause.as_ref()),
                        "Channel subscriber panicked"
                    );
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 已注册通道
struct RegisteredChannel {
    channel: Arc<dyn Any + Send + Sync>,
    payload_type: &'static str,
}

/// 通道注册表
pub struct ChannelRegistry {
    channels: DashMap<String, RegisteredChannel>,
}

static GLOBAL_REGISTRY: Lazy<ChannelRegistry> = Lazy::new(ChannelRegistry::new);

impl ChannelRegistry {
    /// 创建新的通道注册表
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// 进程级注册表
    pub fn global() -> &'static ChannelRegistry {
        &GLOBAL_REGISTRY
    }

    /// 获取或创建通道
    ///
    /// 同名重复调用返回同一实例；名称已被其他负载类型占用时返回
    /// [`InstrumentError::ChannelTypeMismatch`]。
    pub fn channel<T>(&self, name: &str) -> Result<Arc<Channel<T>>>
    where
        T: Send + Sync + 'static,
    {
        let (channel, existing) = {
            let entry = self
                .channels
                .entry(name.to_string())
                .or_insert_with(|| RegisteredChannel {
                    channel: Arc::new(Channel::<T>::new(name)),
                    payload_type: type_name::<T>(),
                });
            (entry.channel.clone(), entry.payload_type)
        };

        channel
            .downcast::<Channel<T>>()
            .map_err(|_| InstrumentError::ChannelTypeMismatch {
                name: name.to_string(),
                existing,
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// 已注册的通道名称（排序）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 从进程级注册表获取通道
pub fn channel<T>(name: &str) -> Result<Arc<Channel<T>>>
where
    T: Send + Sync + 'static,
{
    ChannelRegistry::global().channel(name)
}
