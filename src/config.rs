//! 插桩代理配置系统
//!
//! 支持 YAML 和 TOML 格式的配置文件，按扩展名选择解析器

use crate::{InstrumentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// 代理主配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// 默认服务名
    pub service: String,
    /// 通道命名空间
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 各插件配置，键为插件名
    #[serde(default)]
    pub plugins: HashMap<String, PluginConfig>,
}

fn default_namespace() -> String {
    crate::instrument::DEFAULT_NAMESPACE.to_string()
}

/// 日志配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default)]
    pub level: LogLevel,
}

/// 日志级别
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// 插件配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// 是否启用
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 覆盖 Span 的服务名
    #[serde(default)]
    pub service: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service: None,
        }
    }
}

impl PluginConfig {
    /// 禁用状态的配置
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            service: None,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service: "node".to_string(),
            namespace: default_namespace(),
            logging: LoggingConfig::default(),
            plugins: HashMap::new(),
        }
    }
}

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            other => Err(InstrumentError::config(&format!(
                "Unsupported config file extension: {:?}",
                other
            ))),
        }
    }
}

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: AgentConfig,
}

impl ConfigManager {
    /// 从文件加载配置
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| InstrumentError::config(&format!("Failed to read config file: {}", e)))?;

        let config: AgentConfig = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(&content)?,
            ConfigFormat::Toml => toml::from_str(&content).map_err(|e| {
                InstrumentError::config(&format!("Failed to parse config file: {}", e))
            })?,
        };

        tracing::debug!(path = %path.display(), service = %config.service, "Loaded agent configuration");
        Ok(Self { config })
    }

    /// 创建默认配置
    pub fn new_default() -> Self {
        Self {
            config: AgentConfig::default(),
        }
    }

    pub fn from_config(config: AgentConfig) -> Self {
        Self { config }
    }

    /// 保存配置到文件
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match ConfigFormat::from_path(path)? {
            ConfigFormat::Yaml => serde_yaml::to_string(&self.config)?,
            ConfigFormat::Toml => toml::to_string_pretty(&self.config).map_err(|e| {
                InstrumentError::config(&format!("Failed to serialize config: {}", e))
            })?,
        };

        tokio::fs::write(path, content)
            .await
            .map_err(|e| InstrumentError::config(&format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// 获取配置
    pub fn get_config(&self) -> &AgentConfig {
        &self.config
    }

    /// 获取可变配置
    pub fn get_config_mut(&mut self) -> &mut AgentConfig {
        &mut self.config
    }

    /// 插件配置；未配置的插件默认启用，服务名继承代理服务名
    pub fn plugin_config(&self, name: &str) -> PluginConfig {
        let mut config = self.config.plugins.get(name).cloned().unwrap_or_default();
        if config.service.is_none() {
            config.service = Some(self.config.service.clone());
        }
        config
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if self.config.service.trim().is_empty() {
            return Err(InstrumentError::config("Service name cannot be empty"));
        }

        if self.config.namespace.is_empty() || self.config.namespace.contains(':') {
            return Err(InstrumentError::config(
                "Namespace must be non-empty and must not contain ':'",
            ));
        }

        for (name, plugin) in &self.config.plugins {
            if plugin.service.as_deref().map_or(false, |s| s.trim().is_empty()) {
                return Err(InstrumentError::config(&format!(
                    "Plugin '{}' has an empty service name",
                    name
                )));
            }
        }

        tracing::info!("Configuration validation passed");
        Ok(())
    }
}
