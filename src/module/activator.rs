//! 模块激活钩子
//!
//! 模块启动时调用 `activate`，停止时调用 `deactivate`。钩子可以返回错误，
//! 也可能 panic；两者都会被注册中心捕获并转换为对应的生命周期错误。

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::api::ModuleContext;

/// 激活钩子
pub trait ActivationHook: Send + Sync {
    /// 激活模块，可在此注册服务和监听器
    fn activate(&self, context: &ModuleContext) -> anyhow::Result<()>;

    /// 停用模块
    fn deactivate(&self, context: &ModuleContext) -> anyhow::Result<()>;
}

/// 由两个闭包组成的激活钩子
pub struct FnActivator<A, D> {
    on_activate: A,
    on_deactivate: D,
}

impl<A, D> FnActivator<A, D>
where
    A: Fn(&ModuleContext) -> anyhow::Result<()> + Send + Sync,
    D: Fn(&ModuleContext) -> anyhow::Result<()> + Send + Sync,
{
    /// 创建闭包激活钩子
    pub fn new(on_activate: A, on_deactivate: D) -> Self {
        Self {
            on_activate,
            on_deactivate,
        }
    }
}

impl<A, D> ActivationHook for FnActivator<A, D>
where
    A: Fn(&ModuleContext) -> anyhow::Result<()> + Send + Sync,
    D: Fn(&ModuleContext) -> anyhow::Result<()> + Send + Sync,
{
    fn activate(&self, context: &ModuleContext) -> anyhow::Result<()> {
        (self.on_activate)(context)
    }

    fn deactivate(&self, context: &ModuleContext) -> anyhow::Result<()> {
        (self.on_deactivate)(context)
    }
}

/// 调用钩子并把 panic 转换为错误
pub(crate) fn call_guarded<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("panic: {}", panic_message(payload.as_ref()))),
    }
}

/// 提取 panic 负载中的消息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}
