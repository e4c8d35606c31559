//! API 模块
//!
//! 包含注册中心主接口与模块上下文。
//!
//! # 模块概览
//!
//! - `registry`: Registry 主接口，提供模块、服务与事件的所有操作
//! - `context`: 激活钩子使用的模块上下文
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::io::Cursor;
//! use chips_registry::{FrameworkConfig, Registry, StartOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FrameworkConfig::builder()
//!         .log_level("info")
//!         .build();
//!
//!     let registry = Registry::builder().config(config).build()?;
//!     let mut manifest = Cursor::new("Module-SymbolicName: com.acme.hello\nModule-Version: 1.0.0\n");
//!     let module = registry.install("mem:hello", Some(&mut manifest))?;
//!     registry.start(&module, StartOptions::default())?;
//!     registry.shutdown();
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod registry;

// 重导出主要类型
pub use context::ModuleContext;
pub use registry::{Registry, RegistryBuilder};
