//! 日志系统模块
//!
//! 基于 tracing 生态初始化注册中心的日志输出。配置来自 `FrameworkConfig.logging`：
//!
//! - 控制台输出（pretty 或 JSON）
//! - 滚动文件输出（异步非阻塞写入）
//! - EnvFilter 指令（`RUST_LOG` 优先）
//!
//! 每条日志都带线程名，分发线程上的异步监听器输出可以和调用线程区分开。
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_registry::{FrameworkConfig, Logger};
//!
//! # fn main() -> chips_registry::Result<()> {
//! let config = FrameworkConfig::from_yaml_str("logging:\n  level: debug\n  json_format: true\n")?;
//! let _guard = Logger::init_from(&config)?;
//! tracing::info!(module_id = 3, location = "file:greeter", "模块已安装");
//! # Ok(())
//! # }
//! ```

use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::core::config::{FrameworkConfig, LogConfig};
use crate::utils::{CoreError, Result};

const LOG_FILE_NAME: &str = "chips-registry.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 日志文件轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 不轮转
    Never,
    /// 每小时
    Hourly,
    /// 每天
    #[default]
    Daily,
}

impl RotationStrategy {
    /// 配置文件中使用的名称
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStrategy::Never => "never",
            RotationStrategy::Hourly => "hourly",
            RotationStrategy::Daily => "daily",
        }
    }
}

impl FromStr for RotationStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" | "none" => Ok(RotationStrategy::Never),
            "hourly" => Ok(RotationStrategy::Hourly),
            "daily" => Ok(RotationStrategy::Daily),
            other => Err(CoreError::InvalidConfigValue {
                key: "logging.rotation".to_string(),
                reason: format!("未知的轮转策略 '{}'", other),
            }),
        }
    }
}

impl From<RotationStrategy> for Rotation {
    fn from(strategy: RotationStrategy) -> Self {
        match strategy {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }
}

impl std::fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 校验后的日志配置
///
/// 由 [`LogConfig`] 转换而来，级别、轮转策略和过滤指令都已解析。
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认级别
    pub level: Level,
    /// JSON 格式输出
    pub json_format: bool,
    /// 控制台输出
    pub console_output: bool,
    /// 日志文件目录
    pub log_dir: Option<PathBuf>,
    /// 文件轮转策略
    pub rotation: RotationStrategy,
    /// 叠加在默认级别之上的过滤指令
    pub directives: Vec<Directive>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            console_output: true,
            log_dir: None,
            rotation: RotationStrategy::Daily,
            directives: Vec::new(),
        }
    }
}

impl LoggerConfig {
    /// 解析 `FrameworkConfig.logging`
    ///
    /// # Errors
    ///
    /// 级别、轮转策略或过滤指令无法解析，或开启文件输出却没有目录时，
    /// 返回 `CoreError::InvalidConfigValue`
    pub fn from_log_config(log_config: &LogConfig) -> Result<Self> {
        let level = Level::from_str(log_config.level.trim()).map_err(|_| CoreError::InvalidConfigValue {
            key: "logging.level".to_string(),
            reason: format!("未知的日志级别 '{}'", log_config.level),
        })?;

        let log_dir = match (log_config.file_output, &log_config.log_dir) {
            (false, _) => None,
            (true, Some(dir)) => Some(dir.clone()),
            (true, None) => {
                return Err(CoreError::InvalidConfigValue {
                    key: "logging.log_dir".to_string(),
                    reason: "开启文件输出时必须指定目录".to_string(),
                })
            }
        };

        let directives = match log_config.filter_directives.as_deref() {
            Some(raw) => parse_directives(raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            level,
            json_format: log_config.json_format,
            console_output: true,
            log_dir,
            rotation: log_config.rotation.parse()?,
            directives,
        })
    }

    fn env_filter(&self) -> EnvFilter {
        let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_str()));
        self.directives
            .iter()
            .cloned()
            .fold(base, |filter, directive| filter.add_directive(directive))
    }
}

fn parse_directives(raw: &str) -> Result<Vec<Directive>> {
    raw.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| {
            d.parse::<Directive>().map_err(|e| CoreError::InvalidConfigValue {
                key: "logging.filter_directives".to_string(),
                reason: format!("'{}': {}", d, e),
            })
        })
        .collect()
}

/// 日志守卫
///
/// 持有非阻塞写入器的 WorkerGuard；丢弃时刷新挂起的日志。
#[derive(Default)]
pub struct LogGuard {
    guards: Vec<WorkerGuard>,
}

impl LogGuard {
    /// 活跃写入器数量
    pub fn writer_count(&self) -> usize {
        self.guards.len()
    }
}

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// 日志系统
pub struct Logger;

impl Logger {
    /// 按注册中心配置初始化日志
    ///
    /// # Errors
    ///
    /// 日志配置无效或日志系统已初始化时返回错误
    pub fn init_from(config: &FrameworkConfig) -> Result<LogGuard> {
        Self::init(LoggerConfig::from_log_config(&config.logging)?)
    }

    /// 初始化日志系统
    ///
    /// 返回的 `LogGuard` 必须保持存活直到程序退出。
    ///
    /// # Errors
    ///
    /// 日志系统已初始化或全局订阅者已被其他代码设置时返回 `CoreError::InitFailed`
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if LOGGER_INITIALIZED.get().is_some() {
            return Err(CoreError::InitFailed("日志系统已初始化".to_string()));
        }

        let mut guard = LogGuard::default();
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if config.console_output {
            let (writer, worker) = tracing_appender::non_blocking(io::stdout());
            guard.guards.push(worker);
            layers.push(Self::layer(&config, writer, true));
        }

        if let Some(dir) = &config.log_dir {
            let appender = RollingFileAppender::new(config.rotation.into(), dir, LOG_FILE_NAME);
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard.guards.push(worker);
            layers.push(Self::layer(&config, writer, false));
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(config.env_filter())
            .try_init()
            .map_err(|e| CoreError::InitFailed(format!("日志系统初始化失败: {}", e)))?;

        let _ = LOGGER_INITIALIZED.set(());
        Ok(guard)
    }

    /// 初始化日志，失败时返回空守卫
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_default()
    }

    fn layer(config: &LoggerConfig, writer: NonBlocking, ansi: bool) -> BoxedLayer {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_thread_names(true)
            .with_target(true);

        if config.json_format {
            layer.json().with_ansi(false).boxed()
        } else {
            layer.with_ansi(ansi).boxed()
        }
    }
}

/// 记录一次模块状态变更
#[macro_export]
macro_rules! log_transition {
    ($module:expr, $from:expr, $to:expr) => {
        tracing::debug!(
            module_id = $module.id(),
            location = %$module.location(),
            from = %$from,
            to = %$to,
            "模块状态变更"
        )
    };
}
