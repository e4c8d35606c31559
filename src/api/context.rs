//! 模块上下文
//!
//! 激活钩子收到的句柄。以所属模块的身份访问注册中心：注册的服务与监听器
//! 归属于该模块，访问检查以该模块为请求方。模块离开
//! STARTING/ACTIVE/STOPPING 状态后上下文失效，重新启动后也不会恢复，
//! 新的激活会得到新的上下文。

use std::io::Read;

use crate::core::PropertyMap;
use crate::event::{EventCallback, ListenerId, ListenerKind};
use crate::module::{ModuleHandle, StartOptions, StopOptions};
use crate::service::{ServiceObject, ServiceReference, ServiceRegistration, ServiceSource};
use crate::utils::{CoreError, Result};

use super::Registry;

/// 模块上下文
#[derive(Clone)]
pub struct ModuleContext {
    registry: Registry,
    module: ModuleHandle,
    activation: u64,
}

impl ModuleContext {
    pub(crate) fn new(registry: Registry, module: ModuleHandle) -> Self {
        let activation = module.activation();
        Self {
            registry,
            module,
            activation,
        }
    }

    /// 所属模块
    pub fn module(&self) -> &ModuleHandle {
        &self.module
    }

    /// 注册中心
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 上下文是否仍然有效
    pub fn is_valid(&self) -> bool {
        self.module.check_activation(self.activation).is_ok()
    }

    fn ensure_valid(&self) -> Result<()> {
        self.module.check_activation(self.activation).map_err(|state| {
            CoreError::invalid_state("module_context", "STARTING|ACTIVE|STOPPING", state)
        })
    }

    // ==================== 模块 ====================

    /// 以本模块身份安装模块
    pub fn install(&self, location: &str, content: Option<&mut dyn Read>) -> Result<ModuleHandle> {
        self.ensure_valid()?;
        self.registry
            .inner
            .install(location, content, Some(self.module.as_ref()))
    }

    /// 以本模块身份启动其他模块
    pub fn start(&self, module: &ModuleHandle, options: StartOptions) -> Result<()> {
        self.ensure_valid()?;
        self.registry
            .inner
            .start(module, options, Some(self.module.as_ref()))
    }

    /// 以本模块身份停止其他模块
    pub fn stop(&self, module: &ModuleHandle, options: StopOptions) -> Result<()> {
        self.ensure_valid()?;
        self.registry
            .inner
            .stop(module, options, Some(self.module.as_ref()))
    }

    /// 已安装模块
    pub fn modules(&self) -> Vec<ModuleHandle> {
        self.registry.modules()
    }

    // ==================== 服务 ====================

    /// 以本模块为所有者注册服务
    pub fn register_service(
        &self,
        type_names: &[&str],
        source: ServiceSource,
        properties: PropertyMap,
    ) -> Result<ServiceRegistration> {
        self.ensure_valid()?;
        self.registry
            .inner
            .register_service(&self.module, type_names, source, properties)
    }

    /// 查找服务引用
    pub fn get_service_references(
        &self,
        type_name: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceReference>> {
        self.ensure_valid()?;
        self.registry
            .inner
            .find_references(type_name, filter, Some(self.module.as_ref()))
    }

    /// 查找最佳服务引用
    pub fn get_service_reference(
        &self,
        type_name: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Option<ServiceReference>> {
        Ok(self
            .get_service_references(type_name, filter)?
            .into_iter()
            .next())
    }

    /// 获取服务对象
    pub fn get_service(&self, reference: &ServiceReference) -> Option<ServiceObject> {
        if !self.is_valid() {
            return None;
        }
        self.registry.inner.get_service(&self.module, reference)
    }

    /// 释放服务对象
    pub fn unget_service(&self, reference: &ServiceReference) -> bool {
        self.registry.unget_service(&self.module, reference)
    }

    // ==================== 事件 ====================

    /// 以本模块为所有者添加监听器，模块停止时自动移除
    pub fn add_listener(
        &self,
        kind: ListenerKind,
        filter: Option<&str>,
        callback: EventCallback,
    ) -> Result<ListenerId> {
        self.registry
            .inner
            .add_listener(&self.module, kind, filter, callback)
    }

    /// 移除监听器
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.registry.remove_listener(id)
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module", &self.module.id())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::core::FrameworkConfig;
    use crate::module::{FnActivator, ManifestLoader, ModuleState};

    #[test]
    fn test_context_invalid_after_stop() {
        let saved: Arc<Mutex<Option<ModuleContext>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&saved);
        let loader = ManifestLoader::new().with_activator("keeper", move || {
            let slot = Arc::clone(&slot);
            Arc::new(FnActivator::new(
                move |ctx: &ModuleContext| {
                    *slot.lock() = Some(ctx.clone());
                    Ok(())
                },
                |_: &ModuleContext| Ok(()),
            ))
        });
        let registry = Registry::builder()
            .config(FrameworkConfig::builder().without_async_events().build())
            .loader(Arc::new(loader))
            .build()
            .unwrap();
        let mut manifest = Cursor::new("Module-SymbolicName: k\nModule-Activator: keeper\n");
        let module = registry.install("mem:k", Some(&mut manifest)).unwrap();
        registry.start(&module, StartOptions::default()).unwrap();

        let ctx = saved.lock().take().unwrap();
        assert!(ctx.is_valid());
        assert_eq!(ctx.module().id(), module.id());

        registry.stop(&module, StopOptions::default()).unwrap();
        assert_eq!(module.state(), ModuleState::Resolved);
        assert!(!ctx.is_valid());

        let object = ServiceObject::new(1u8, ["com.acme.Byte"]);
        let err = ctx
            .register_service(&["com.acme.Byte"], ServiceSource::singleton(object), PropertyMap::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    /// 重新启动后旧上下文保持失效，只有新一次激活的上下文可用
    #[test]
    fn test_context_stays_invalid_after_restart() {
        let saved: Arc<Mutex<Vec<ModuleContext>>> = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&saved);
        let loader = ManifestLoader::new().with_activator("keeper", move || {
            let slot = Arc::clone(&slot);
            Arc::new(FnActivator::new(
                move |ctx: &ModuleContext| {
                    slot.lock().push(ctx.clone());
                    Ok(())
                },
                |_: &ModuleContext| Ok(()),
            ))
        });
        let registry = Registry::builder()
            .config(FrameworkConfig::builder().without_async_events().build())
            .loader(Arc::new(loader))
            .build()
            .unwrap();
        let mut manifest = Cursor::new("Module-SymbolicName: k\nModule-Activator: keeper\n");
        let module = registry.install("mem:k", Some(&mut manifest)).unwrap();

        registry.start(&module, StartOptions::default()).unwrap();
        registry.stop(&module, StopOptions::default()).unwrap();
        registry.start(&module, StartOptions::default()).unwrap();
        assert_eq!(module.state(), ModuleState::Active);

        let contexts = saved.lock().clone();
        assert_eq!(contexts.len(), 2);
        let (stale, current) = (&contexts[0], &contexts[1]);
        assert!(!stale.is_valid());
        assert!(current.is_valid());

        let object = ServiceObject::new(1u8, ["com.acme.Byte"]);
        let err = stale
            .register_service(&["com.acme.Byte"], ServiceSource::singleton(object), PropertyMap::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
        assert!(registry.registered_services(&module).is_empty());

        let object = ServiceObject::new(2u8, ["com.acme.Byte"]);
        current
            .register_service(&["com.acme.Byte"], ServiceSource::singleton(object), PropertyMap::new())
            .unwrap();
        assert_eq!(registry.registered_services(&module).len(), 1);
    }
}
