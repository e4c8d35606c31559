//! 核心模块
//!
//! 包含配置、属性表和访问检查。

pub mod access;
pub mod config;
pub mod properties;

pub use access::{AccessAction, AccessChecker, AccessDecision};
pub use config::{EventConfig, FrameworkConfig, FrameworkConfigBuilder, LogConfig, RegistryConfig};
pub use properties::{PropertyMap, PropertyValue};
