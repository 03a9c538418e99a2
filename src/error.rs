//! 插桩核心错误处理系统
//!
//! 统一的错误类型和错误处理机制

use thiserror::Error;

/// 插桩核心统一错误类型
#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Channel '{name}' already exists with payload type {existing}")]
    ChannelTypeMismatch { name: String, existing: &'static str },

    #[error("Version error: {message}")]
    Version { message: String },

    #[error("Module error: {message}")]
    Module { message: String },

    #[error("Manifest error: {message}")]
    Manifest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Plugin error: {message}")]
    Plugin { message: String },
}

impl InstrumentError {
    /// 创建版本相关错误
    pub fn version(message: &str) -> Self {
        Self::Version {
            message: message.to_string(),
        }
    }

    /// 创建模块相关错误
    pub fn module(message: &str) -> Self {
        Self::Module {
            message: message.to_string(),
        }
    }

    /// 创建包清单相关错误
    pub fn manifest(message: &str) -> Self {
        Self::Manifest {
            message: message.to_string(),
        }
    }

    /// 创建配置相关错误
    pub fn config(message: &str) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    /// 创建插件相关错误
    pub fn plugin(message: &str) -> Self {
        Self::Plugin {
            message: message.to_string(),
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, InstrumentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = InstrumentError::module("Test module error");
        assert!(matches!(error, InstrumentError::Module { .. }));
        assert_eq!(error.to_string(), "Module error: Test module error");
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let error = InstrumentError::from(io_error);
        assert!(matches!(error, InstrumentError::Io(_)));
    }

    #[test]
    fn test_channel_type_mismatch_message() {
        let error = InstrumentError::ChannelTypeMismatch {
            name: "apm:dns:lookup:start".to_string(),
            existing: "u32",
        };
        assert_eq!(
            error.to_string(),
            "Channel 'apm:dns:lookup:start' already exists with payload type u32"
        );
    }

    #[test]
    fn test_result_type() {
        let success: Result<i32> = Ok(42);
        let failure: Result<i32> = Err(InstrumentError::config("Test error"));

        assert!(success.is_ok());
        assert!(failure.is_err());
    }
}
