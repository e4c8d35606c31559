//! 事件数据结构
//!
//! 三类事件：模块生命周期事件、服务事件与框架事件（错误与通知）。

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::module::ModuleHandle;
use crate::service::ServiceReference;
use crate::utils::CoreError;

/// 模块生命周期事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleEventKind {
    /// 已安装
    Installed,
    /// 已解析
    Resolved,
    /// 正在启动
    Starting,
    /// 已启动
    Started,
    /// 正在停止
    Stopping,
    /// 已停止
    Stopped,
    /// 已更新
    Updated,
    /// 解析状态被撤销（更新或卸载前）
    Unresolved,
    /// 已卸载
    Uninstalled,
    /// 等待延迟激活
    LazyActivation,
}

impl ModuleEventKind {
    /// 事件名称
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleEventKind::Installed => "module.installed",
            ModuleEventKind::Resolved => "module.resolved",
            ModuleEventKind::Starting => "module.starting",
            ModuleEventKind::Started => "module.started",
            ModuleEventKind::Stopping => "module.stopping",
            ModuleEventKind::Stopped => "module.stopped",
            ModuleEventKind::Updated => "module.updated",
            ModuleEventKind::Unresolved => "module.unresolved",
            ModuleEventKind::Uninstalled => "module.uninstalled",
            ModuleEventKind::LazyActivation => "module.lazy_activation",
        }
    }

    /// 是否投递给异步模块监听器
    ///
    /// STARTING、STOPPING 与 LAZY_ACTIVATION 只投递给同步监听器。
    pub fn is_async_deliverable(&self) -> bool {
        !matches!(
            self,
            ModuleEventKind::Starting | ModuleEventKind::Stopping | ModuleEventKind::LazyActivation
        )
    }
}

/// 模块生命周期事件
#[derive(Debug, Clone)]
pub struct ModuleEvent {
    /// 事件类型
    pub kind: ModuleEventKind,
    /// 事件所属模块
    pub module: ModuleHandle,
    /// 事件时间戳
    pub timestamp: DateTime<Utc>,
}

impl ModuleEvent {
    /// 创建模块事件
    pub fn new(kind: ModuleEventKind, module: ModuleHandle) -> Self {
        Self {
            kind,
            module,
            timestamp: Utc::now(),
        }
    }
}

/// 服务事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceEventKind {
    /// 已注册
    Registered,
    /// 属性已修改
    Modified,
    /// 属性修改后不再匹配监听器过滤器
    ModifiedEndMatch,
    /// 正在注销（服务仍可获取）
    Unregistering,
}

impl ServiceEventKind {
    /// 事件名称
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceEventKind::Registered => "service.registered",
            ServiceEventKind::Modified => "service.modified",
            ServiceEventKind::ModifiedEndMatch => "service.modified_endmatch",
            ServiceEventKind::Unregistering => "service.unregistering",
        }
    }
}

/// 服务事件
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    /// 事件类型
    pub kind: ServiceEventKind,
    /// 服务引用
    pub reference: ServiceReference,
    /// 事件时间戳
    pub timestamp: DateTime<Utc>,
}

impl ServiceEvent {
    /// 创建服务事件
    pub fn new(kind: ServiceEventKind, reference: ServiceReference) -> Self {
        Self {
            kind,
            reference,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn with_kind(&self, kind: ServiceEventKind) -> Self {
        Self {
            kind,
            reference: self.reference.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// 框架事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameworkEventKind {
    /// 监听器、工厂或异步操作发生错误
    Error,
    /// 警告
    Warning,
    /// 通知
    Info,
}

/// 框架事件
///
/// 监听器或服务工厂的异常不会传播给触发操作的调用方，
/// 而是以 `FrameworkEventKind::Error` 事件异步上报。
#[derive(Debug, Clone)]
pub struct FrameworkEvent {
    /// 事件类型
    pub kind: FrameworkEventKind,
    /// 相关模块
    pub module: Option<ModuleHandle>,
    /// 相关错误
    pub error: Option<Arc<CoreError>>,
    /// 描述
    pub message: String,
    /// 事件时间戳
    pub timestamp: DateTime<Utc>,
}

impl FrameworkEvent {
    /// 创建错误事件
    pub fn error(module: Option<ModuleHandle>, error: CoreError) -> Self {
        Self {
            kind: FrameworkEventKind::Error,
            module,
            message: error.to_string(),
            error: Some(Arc::new(error)),
            timestamp: Utc::now(),
        }
    }

    /// 创建通知事件
    pub fn info(module: Option<ModuleHandle>, message: impl Into<String>) -> Self {
        Self {
            kind: FrameworkEventKind::Info,
            module,
            error: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// 创建警告事件
    pub fn warning(module: Option<ModuleHandle>, message: impl Into<String>) -> Self {
        Self {
            kind: FrameworkEventKind::Warning,
            module,
            error: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// 错误码
    pub fn error_code(&self) -> Option<&'static str> {
        self.error.as_ref().map(|e| e.error_code())
    }
}

/// 监听器收到的事件
#[derive(Debug, Clone)]
pub enum Event {
    /// 模块生命周期事件
    Module(ModuleEvent),
    /// 服务事件
    Service(ServiceEvent),
    /// 框架事件
    Framework(FrameworkEvent),
}

impl Event {
    /// 事件名称，用于日志
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Module(e) => e.kind.as_str(),
            Event::Service(e) => e.kind.as_str(),
            Event::Framework(e) => match e.kind {
                FrameworkEventKind::Error => "framework.error",
                FrameworkEventKind::Warning => "framework.warning",
                FrameworkEventKind::Info => "framework.info",
            },
        }
    }

    /// 模块事件视图
    pub fn as_module(&self) -> Option<&ModuleEvent> {
        match self {
            Event::Module(e) => Some(e),
            _ => None,
        }
    }

    /// 服务事件视图
    pub fn as_service(&self) -> Option<&ServiceEvent> {
        match self {
            Event::Service(e) => Some(e),
            _ => None,
        }
    }

    /// 框架事件视图
    pub fn as_framework(&self) -> Option<&FrameworkEvent> {
        match self {
            Event::Framework(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Module(e) => write!(f, "{} {}", e.kind.as_str(), e.module),
            Event::Service(e) => write!(f, "{} service.id={}", e.kind.as_str(), e.reference.id()),
            Event::Framework(e) => write!(f, "{} {}", self.event_type(), e.message),
        }
    }
}
