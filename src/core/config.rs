//! 注册中心配置
//!
//! 定义注册中心的配置结构和加载逻辑。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::{CoreError, Result};

/// 注册表配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 等待模块状态变更锁的最长时间（毫秒）
    #[serde(default = "default_state_change_timeout_ms")]
    pub state_change_timeout_ms: u64,

    /// 是否允许安装同名同版本的模块
    #[serde(default)]
    pub allow_duplicate_modules: bool,
}

fn default_state_change_timeout_ms() -> u64 {
    5000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            state_change_timeout_ms: default_state_change_timeout_ms(),
            allow_duplicate_modules: false,
        }
    }
}

impl RegistryConfig {
    /// 状态变更锁超时时间
    pub fn state_change_timeout(&self) -> Duration {
        Duration::from_millis(self.state_change_timeout_ms)
    }
}

/// 事件分发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 异步分发线程名称
    #[serde(default = "default_dispatch_thread_name")]
    pub dispatch_thread_name: String,

    /// 是否启动异步分发线程（关闭后异步监听器不会收到事件）
    #[serde(default = "default_true")]
    pub deliver_async_events: bool,
}

fn default_dispatch_thread_name() -> String {
    "chips-event-dispatch".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            dispatch_thread_name: default_dispatch_thread_name(),
            deliver_async_events: true,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 额外的过滤指令
    #[serde(default)]
    pub filter_directives: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
            filter_directives: None,
        }
    }
}

/// 注册中心配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 注册表配置
    #[serde(default)]
    pub registry: RegistryConfig,

    /// 事件分发配置
    #[serde(default)]
    pub events: EventConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,
}

impl FrameworkConfig {
    /// 创建配置构建器
    pub fn builder() -> FrameworkConfigBuilder {
        FrameworkConfigBuilder::new()
    }

    /// 从文件加载配置（按扩展名选择 JSON 或 YAML）
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await?;

        let mut config: FrameworkConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.validate()?;
        config.config_path = Some(path);
        Ok(config)
    }

    /// 从 YAML 字符串加载配置
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: FrameworkConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置值
    pub fn validate(&self) -> Result<()> {
        if self.registry.state_change_timeout_ms == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "registry.state_change_timeout_ms".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.events.dispatch_thread_name.trim().is_empty() {
            return Err(CoreError::InvalidConfigValue {
                key: "events.dispatch_thread_name".to_string(),
                reason: "不能为空".to_string(),
            });
        }
        Ok(())
    }

    /// 合并另一个配置（只覆盖非默认值）
    pub fn merge(&mut self, other: FrameworkConfig) {
        if other.registry.state_change_timeout_ms != default_state_change_timeout_ms() {
            self.registry.state_change_timeout_ms = other.registry.state_change_timeout_ms;
        }
        if other.registry.allow_duplicate_modules {
            self.registry.allow_duplicate_modules = true;
        }
        if other.events.dispatch_thread_name != default_dispatch_thread_name() {
            self.events.dispatch_thread_name = other.events.dispatch_thread_name;
        }
        if !other.events.deliver_async_events {
            self.events.deliver_async_events = false;
        }
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.filter_directives.is_some() {
            self.logging.filter_directives = other.logging.filter_directives;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct FrameworkConfigBuilder {
    config: FrameworkConfig,
}

impl FrameworkConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置状态变更锁超时
    pub fn state_change_timeout(mut self, timeout: Duration) -> Self {
        self.config.registry.state_change_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 允许安装同名同版本模块
    pub fn allow_duplicate_modules(mut self, allow: bool) -> Self {
        self.config.registry.allow_duplicate_modules = allow;
        self
    }

    /// 设置异步分发线程名称
    pub fn dispatch_thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.events.dispatch_thread_name = name.into();
        self
    }

    /// 关闭异步事件分发
    pub fn without_async_events(mut self) -> Self {
        self.config.events.deliver_async_events = false;
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 构建配置
    pub fn build(self) -> FrameworkConfig {
        self.config
    }
}
