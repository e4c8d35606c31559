//! # Chips Registry - 薯片模块注册中心
//!
//! 薯片模块注册中心是一个进程内的动态模块与服务注册框架，提供以下核心功能：
//!
//! - **模块生命周期**: 模块的安装、解析、启动、停止、更新与卸载
//! - **服务注册表**: 按类型名与属性发布、查找、获取服务，支持排序与按使用方的服务工厂
//! - **过滤器**: LDAP 风格的属性过滤表达式
//! - **事件分发**: 同步与异步的模块、服务、框架事件
//! - **日志系统**: 结构化日志记录
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use std::io::Cursor;
//! use chips_registry::{FrameworkConfig, Registry, StartOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 创建注册中心
//!     let registry = Registry::builder()
//!         .config(FrameworkConfig::default())
//!         .build()?;
//!
//!     // 安装并启动模块
//!     let mut manifest = Cursor::new("Module-SymbolicName: com.acme.hello\n");
//!     let module = registry.install("mem:hello", Some(&mut manifest))?;
//!     registry.start(&module, StartOptions::default())?;
//!
//!     registry.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `api` - 注册中心主接口与模块上下文
//! - `module` - 模块记录、加载、依赖解析与生命周期
//! - `service` - 服务记录与服务注册表
//! - `filter` - 过滤表达式解析与匹配
//! - `event` - 事件类型与分发器
//! - `core` - 配置、属性表与访问检查
//! - `utils` - 错误类型与日志

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod core;
pub mod event;
pub mod filter;
pub mod module;
pub mod service;
pub mod utils;

// 重导出常用类型，方便使用
pub use api::{ModuleContext, Registry, RegistryBuilder};

pub use module::{
    ActivationHook, ActivationPolicy, ContentLoader, FnActivator, HeaderResolver, ManifestLoader,
    ModuleContent, ModuleHandle, ModuleRecord, ModuleState, Resolver, StartOptions, StopOptions,
};

pub use service::{
    RegistrationState, ServiceFactory, ServiceObject, ServiceReference, ServiceRegistration,
    ServiceSource,
};

pub use event::{
    DispatchStats, Event, EventCallback, FrameworkEvent, FrameworkEventKind, ListenerId,
    ListenerKind, ModuleEvent, ModuleEventKind, ServiceEvent, ServiceEventKind,
};

pub use filter::Filter;

pub use self::core::{
    AccessAction, AccessChecker, AccessDecision, EventConfig, FrameworkConfig,
    FrameworkConfigBuilder, LogConfig, PropertyMap, PropertyValue, RegistryConfig,
};

pub use utils::{error_code, CoreError, FactoryErrorKind, Result};
pub use utils::{LogGuard, Logger, LoggerConfig, RotationStrategy};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
