//! 注册中心错误类型定义
//!
//! 本模块定义了注册中心中使用的所有错误类型。

use thiserror::Error;

/// 服务工厂错误的具体类别
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactoryErrorKind {
    /// 工厂在执行期间再次请求同一服务
    Recursion,
    /// 工厂返回的对象不能赋值给声明的类型名
    InvalidResult(String),
    /// 工厂返回错误或发生 panic
    Exception(String),
}

impl std::fmt::Display for FactoryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FactoryErrorKind::Recursion => write!(f, "递归调用"),
            FactoryErrorKind::InvalidResult(reason) => write!(f, "返回值无效: {}", reason),
            FactoryErrorKind::Exception(reason) => write!(f, "执行异常: {}", reason),
        }
    }
}

/// 注册中心核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 模块生命周期错误 ====================

    /// 模块内容读取失败
    #[error("模块内容读取失败: '{location}' - {reason}")]
    ContentRead {
        location: String,
        reason: String,
    },

    /// 同名同版本模块已安装
    #[error("模块标识重复: '{symbolic_name}' 版本 {version} 已安装")]
    DuplicateIdentity {
        symbolic_name: String,
        version: String,
    },

    /// 依赖无法满足
    #[error("模块解析失败: '{module}' 缺少依赖 '{missing}'")]
    Resolution {
        module: String,
        missing: String,
    },

    /// 激活钩子失败
    #[error("模块激活失败: '{module}' - {cause}")]
    Activation {
        module: String,
        cause: anyhow::Error,
    },

    /// 停用钩子失败（清理已完成）
    #[error("模块停用失败: '{module}' - {cause}")]
    Deactivation {
        module: String,
        cause: anyhow::Error,
    },

    /// 当前状态不允许该操作
    #[error("状态无效: {operation} 需要 {required}, 当前为 {actual}")]
    InvalidState {
        operation: String,
        required: String,
        actual: String,
    },

    /// 等待状态变更锁超时
    #[error("等待模块 '{module}' 状态变更超时 ({waited_ms}ms)")]
    StateChangeTimeout {
        module: String,
        waited_ms: u64,
    },

    /// 系统模块不支持生命周期操作
    #[error("系统模块不支持操作: {0}")]
    SystemModule(String),

    // ==================== 服务注册错误 ====================

    /// 服务对象不能赋值给声明的类型名
    #[error("服务类型不匹配: {0}")]
    TypeMismatch(String),

    /// 服务工厂错误
    #[error("服务工厂错误: service.id={service_id} - {kind}")]
    Factory {
        service_id: u64,
        kind: FactoryErrorKind,
    },

    /// 属性键重复（大小写变体）
    #[error("属性键重复: '{0}'")]
    DuplicateProperty(String),

    // ==================== 过滤器错误 ====================

    /// 过滤器语法错误
    #[error("过滤器语法错误: 位置 {position} - {reason}")]
    FilterSyntax {
        position: usize,
        reason: String,
    },

    // ==================== 权限错误 ====================

    /// 访问被拒绝
    #[error("访问被拒绝: {action} '{target}'")]
    AccessDenied {
        action: String,
        target: String,
    },

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        key: String,
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 注册中心操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 错误码常量
pub mod error_code {
    // 模块错误 (MODULE-xxx)
    pub const MODULE_CONTENT_READ: &str = "MODULE-001";
    pub const MODULE_DUPLICATE_IDENTITY: &str = "MODULE-002";
    pub const MODULE_RESOLUTION: &str = "MODULE-003";
    pub const MODULE_ACTIVATION: &str = "MODULE-004";
    pub const MODULE_DEACTIVATION: &str = "MODULE-005";
    pub const MODULE_INVALID_STATE: &str = "MODULE-006";
    pub const MODULE_STATE_CHANGE_TIMEOUT: &str = "MODULE-007";
    pub const MODULE_SYSTEM: &str = "MODULE-008";

    // 服务错误 (SERVICE-xxx)
    pub const SERVICE_TYPE_MISMATCH: &str = "SERVICE-001";
    pub const SERVICE_FACTORY: &str = "SERVICE-002";
    pub const SERVICE_DUPLICATE_PROPERTY: &str = "SERVICE-003";

    // 过滤器错误 (FILTER-xxx)
    pub const FILTER_SYNTAX: &str = "FILTER-001";

    // 权限错误 (PERMISSION-xxx)
    pub const PERMISSION_DENIED: &str = "PERMISSION-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";
}

impl CoreError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ContentRead { .. } => error_code::MODULE_CONTENT_READ,
            CoreError::DuplicateIdentity { .. } => error_code::MODULE_DUPLICATE_IDENTITY,
            CoreError::Resolution { .. } => error_code::MODULE_RESOLUTION,
            CoreError::Activation { .. } => error_code::MODULE_ACTIVATION,
            CoreError::Deactivation { .. } => error_code::MODULE_DEACTIVATION,
            CoreError::InvalidState { .. } => error_code::MODULE_INVALID_STATE,
            CoreError::StateChangeTimeout { .. } => error_code::MODULE_STATE_CHANGE_TIMEOUT,
            CoreError::SystemModule(_) => error_code::MODULE_SYSTEM,
            CoreError::TypeMismatch(_) => error_code::SERVICE_TYPE_MISMATCH,
            CoreError::Factory { .. } => error_code::SERVICE_FACTORY,
            CoreError::DuplicateProperty(_) => error_code::SERVICE_DUPLICATE_PROPERTY,
            CoreError::FilterSyntax { .. } => error_code::FILTER_SYNTAX,
            CoreError::AccessDenied { .. } => error_code::PERMISSION_DENIED,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            _ => "UNKNOWN",
        }
    }

    /// 构造状态无效错误
    pub(crate) fn invalid_state(
        operation: impl Into<String>,
        required: impl Into<String>,
        actual: impl std::fmt::Display,
    ) -> Self {
        CoreError::InvalidState {
            operation: operation.into(),
            required: required.into(),
            actual: actual.to_string(),
        }
    }
}
