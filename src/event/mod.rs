//! 事件模块
//!
//! 包含事件类型定义与事件分发器。

#[allow(clippy::module_inception)]
pub mod event;
pub mod dispatcher;

pub use dispatcher::{DispatchStats, EventCallback, EventDispatcher, ListenerId, ListenerKind};
pub use event::{
    Event, FrameworkEvent, FrameworkEventKind, ModuleEvent, ModuleEventKind, ServiceEvent,
    ServiceEventKind,
};
