//! 模块管理模块
//!
//! 包含模块管理的核心组件：
//! - 模块记录与状态定义
//! - 激活钩子
//! - 内容加载器与依赖解析器
//! - 生命周期状态机

pub mod activator;
pub mod dependency;
pub mod lifecycle;
pub mod loader;
pub(crate) mod lock;
pub mod metadata;

// 重导出常用类型
pub use activator::{ActivationHook, FnActivator};
pub use dependency::{requirements_of, HeaderResolver, Requirement, Resolver};
pub use loader::{ActivatorFactory, ContentLoader, ManifestLoader};
pub use metadata::{
    headers, ActivationPolicy, ModuleContent, ModuleHandle, ModuleRecord, ModuleState,
    StartOptions, StopOptions, SYSTEM_MODULE_ID, SYSTEM_MODULE_LOCATION,
};
