//! 生命周期状态机
//!
//! 模块的安装、解析、启动、停止、更新与卸载。
//!
//! 状态转换：
//!
//! ```text
//! INSTALLED -> RESOLVED -> STARTING -> ACTIVE -> STOPPING -> RESOLVED
//!     \___________\___________________________________________-> UNINSTALLED
//! ```
//!
//! 同一模块的转换由其状态变更锁串行化。同步模块监听器在锁内收到事件，
//! `STARTED` 与 `LAZY_ACTIVATION` 除外。

use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::activator::call_guarded;
use super::lock::StateChangeGuard;
use super::metadata::{
    ActivationPolicy, ModuleContent, ModuleHandle, ModuleRecord, ModuleState, StartOptions,
    StopOptions,
};
use crate::api::registry::RegistryInner;
use crate::api::{ModuleContext, Registry};
use crate::core::AccessAction;
use crate::event::{ModuleEvent, ModuleEventKind};
use crate::log_transition;
use crate::utils::{CoreError, Result};

impl RegistryInner {
    // ==================== 辅助 ====================

    fn lock_module<'a>(&self, module: &'a ModuleRecord) -> Result<StateChangeGuard<'a>> {
        module
            .state_lock()
            .acquire(self.config.registry.state_change_timeout())
            .map_err(|waited| {
                warn!(module_id = module.id(), waited_ms = waited.as_millis() as u64, "等待状态变更锁超时");
                CoreError::StateChangeTimeout {
                    module: module.to_string(),
                    waited_ms: waited.as_millis() as u64,
                }
            })
    }

    /// 系统模块检查与生命周期访问检查
    fn ensure_lifecycle(
        &self,
        module: &ModuleRecord,
        operation: &str,
        requester: Option<&ModuleRecord>,
    ) -> Result<()> {
        if module.is_system() {
            return Err(CoreError::SystemModule(operation.to_string()));
        }
        self.check_access(AccessAction::Lifecycle, module.location(), requester)
    }

    fn transition(&self, module: &ModuleRecord, to: ModuleState) {
        let from = module.state();
        module.set_state(to);
        log_transition!(module, from, to);
    }

    fn emit(&self, kind: ModuleEventKind, module: &ModuleHandle) {
        self.events
            .publish_module(ModuleEvent::new(kind, Arc::clone(module)));
    }

    fn read_content(&self, location: &str, content: Option<&mut dyn Read>) -> Result<ModuleContent> {
        match content {
            Some(reader) => self.loader.load(location, reader),
            None => {
                let mut reader = self.loader.open(location)?;
                self.loader.load(location, &mut *reader)
            }
        }
    }

    /// 同名同版本检查，`exclude` 为更新中的模块自身
    fn check_duplicate(&self, content: &ModuleContent, exclude: Option<u64>) -> Result<()> {
        if self.config.registry.allow_duplicate_modules {
            return Ok(());
        }
        let Some(name) = content.symbolic_name() else {
            return Ok(());
        };
        let version = content.version();

        let duplicate = self.modules.read().by_id.values().any(|m| {
            Some(m.id()) != exclude
                && m.symbolic_name().as_deref() == Some(name.as_str())
                && m.version() == version
        });
        if duplicate {
            return Err(CoreError::DuplicateIdentity {
                symbolic_name: name,
                version: version.to_string(),
            });
        }
        Ok(())
    }

    /// 注销模块的服务、结束本次激活、释放其使用的服务并移除其监听器
    ///
    /// 激活在释放之前结束，正在创建的工厂实例由获取方交还。
    fn release_resources(&self, module: &ModuleHandle) {
        let unregistered = self.services.unregister_all(module);
        module.end_activation();
        let released = self.services.release_all(module);
        let listeners = self.events.remove_listeners(module);
        debug!(
            module_id = module.id(),
            services = unregistered,
            released = released,
            listeners = listeners,
            "模块资源已清理"
        );
    }

    fn context(self: &Arc<Self>, module: &ModuleHandle) -> ModuleContext {
        ModuleContext::new(Registry::from_inner(Arc::clone(self)), Arc::clone(module))
    }

    // ==================== 安装 ====================

    pub(crate) fn install(
        &self,
        location: &str,
        content: Option<&mut dyn Read>,
        requester: Option<&ModuleRecord>,
    ) -> Result<ModuleHandle> {
        self.check_access(AccessAction::Install, location, requester)?;

        let module = {
            let _install = self.install_lock.lock();
            if let Some(existing) = self.modules.read().by_location.get(location) {
                debug!(module_id = existing.id(), location = %location, "模块已安装");
                return Ok(Arc::clone(existing));
            }

            let content = self.read_content(location, content)?;
            self.check_duplicate(&content, None)?;

            let id = self.next_module_id.fetch_add(1, Ordering::SeqCst);
            let module = Arc::new(ModuleRecord::new(id, location, content));
            let mut table = self.modules.write();
            table.by_id.insert(id, Arc::clone(&module));
            table.by_location.insert(location.to_string(), Arc::clone(&module));
            module
        };

        info!(module_id = module.id(), location = %location, "模块已安装");
        self.emit(ModuleEventKind::Installed, &module);
        Ok(module)
    }

    // ==================== 解析 ====================

    pub(crate) fn resolve(&self, module: &ModuleHandle) -> Result<()> {
        if module.state().is_resolved() {
            return Ok(());
        }
        let _guard = self.lock_module(module)?;
        self.resolve_locked(module)
    }

    fn resolve_locked(&self, module: &ModuleHandle) -> Result<()> {
        match module.state() {
            ModuleState::Installed => {}
            ModuleState::Uninstalled => {
                return Err(CoreError::invalid_state(
                    "resolve",
                    "INSTALLED",
                    ModuleState::Uninstalled,
                ))
            }
            _ => return Ok(()),
        }

        let installed = self.installed_modules();
        if let Err(missing) = self.resolver.resolve(module, &installed) {
            warn!(module_id = module.id(), missing = %missing, "模块解析失败");
            return Err(CoreError::Resolution {
                module: module.to_string(),
                missing,
            });
        }

        self.transition(module, ModuleState::Resolved);
        self.emit(ModuleEventKind::Resolved, module);
        Ok(())
    }

    // ==================== 启动 ====================

    pub(crate) fn start(
        self: &Arc<Self>,
        module: &ModuleHandle,
        options: StartOptions,
        requester: Option<&ModuleRecord>,
    ) -> Result<()> {
        self.ensure_lifecycle(module, "start", requester)?;
        self.start_unchecked(module, options)
    }

    fn start_unchecked(self: &Arc<Self>, module: &ModuleHandle, options: StartOptions) -> Result<()> {
        let guard = self.lock_module(module)?;
        info!(module_id = module.id(), "启动模块");

        match module.state() {
            ModuleState::Uninstalled => {
                return Err(CoreError::invalid_state(
                    "start",
                    "INSTALLED|RESOLVED",
                    ModuleState::Uninstalled,
                ))
            }
            ModuleState::Stopping => {
                return Err(CoreError::invalid_state(
                    "start",
                    "INSTALLED|RESOLVED",
                    ModuleState::Stopping,
                ))
            }
            ModuleState::Active => {
                if !options.transient {
                    module.set_persistently_started(true);
                }
                debug!(module_id = module.id(), "模块已在运行中");
                return Ok(());
            }
            ModuleState::Starting => {
                // 延迟激活中的模块可被立即启动；激活中的重入调用直接返回
                if !module.is_lazy_activation_pending() || options.use_activation_policy {
                    return Ok(());
                }
            }
            ModuleState::Installed => self.resolve_locked(module)?,
            ModuleState::Resolved => {}
        }

        if !options.transient {
            module.set_persistently_started(true);
        }

        if options.use_activation_policy
            && module.activation_policy() == ActivationPolicy::Lazy
            && module.state() == ModuleState::Resolved
        {
            self.transition(module, ModuleState::Starting);
            module.set_lazy_pending(true);
            drop(guard);
            info!(module_id = module.id(), "模块等待延迟激活");
            self.emit(ModuleEventKind::LazyActivation, module);
            return Ok(());
        }

        self.activate(module, guard)
    }

    pub(crate) fn trigger_activation(
        self: &Arc<Self>,
        module: &ModuleHandle,
        requester: Option<&ModuleRecord>,
    ) -> Result<()> {
        self.ensure_lifecycle(module, "trigger_activation", requester)?;
        let guard = self.lock_module(module)?;
        match module.state() {
            ModuleState::Starting if module.is_lazy_activation_pending() => self.activate(module, guard),
            ModuleState::Active => Ok(()),
            state => Err(CoreError::invalid_state("trigger_activation", "STARTING", state)),
        }
    }

    /// 调用激活钩子，持有的锁在发布 `STARTED` 前释放
    fn activate(self: &Arc<Self>, module: &ModuleHandle, guard: StateChangeGuard<'_>) -> Result<()> {
        module.set_lazy_pending(false);
        if module.state() != ModuleState::Starting {
            self.transition(module, ModuleState::Starting);
        }
        self.emit(ModuleEventKind::Starting, module);

        let context = self.context(module);
        let result = match module.activator() {
            Some(hook) => call_guarded(|| hook.activate(&context)),
            None => Ok(()),
        };
        let result = result.and_then(|()| match module.state() {
            ModuleState::Starting => Ok(()),
            state => Err(anyhow::anyhow!("激活期间模块状态变为 {}", state)),
        });

        match result {
            Ok(()) => {
                self.transition(module, ModuleState::Active);
                drop(guard);
                info!(module_id = module.id(), "模块启动成功");
                self.emit(ModuleEventKind::Started, module);
                Ok(())
            }
            Err(cause) => {
                error!(module_id = module.id(), error = %cause, "模块激活失败");
                if module.state() == ModuleState::Starting {
                    self.transition(module, ModuleState::Stopping);
                    self.emit(ModuleEventKind::Stopping, module);
                    self.release_resources(module);
                    self.transition(module, ModuleState::Resolved);
                    self.emit(ModuleEventKind::Stopped, module);
                } else {
                    self.release_resources(module);
                }
                drop(guard);
                Err(CoreError::Activation {
                    module: module.to_string(),
                    cause,
                })
            }
        }
    }

    // ==================== 停止 ====================

    pub(crate) fn stop(
        self: &Arc<Self>,
        module: &ModuleHandle,
        options: StopOptions,
        requester: Option<&ModuleRecord>,
    ) -> Result<()> {
        self.ensure_lifecycle(module, "stop", requester)?;
        self.stop_unchecked(module, options)
    }

    fn stop_unchecked(self: &Arc<Self>, module: &ModuleHandle, options: StopOptions) -> Result<()> {
        let _guard = self.lock_module(module)?;
        info!(module_id = module.id(), "停止模块");

        if module.state() == ModuleState::Uninstalled {
            return Err(CoreError::invalid_state(
                "stop",
                "STARTING|ACTIVE",
                ModuleState::Uninstalled,
            ));
        }
        if !options.transient {
            module.set_persistently_started(false);
        }
        self.stop_locked(module)
    }

    /// 停止 STARTING/ACTIVE 模块，其他状态无操作
    fn stop_locked(self: &Arc<Self>, module: &ModuleHandle) -> Result<()> {
        if !matches!(module.state(), ModuleState::Starting | ModuleState::Active) {
            debug!(module_id = module.id(), state = %module.state(), "模块未运行");
            return Ok(());
        }

        let lazy = module.is_lazy_activation_pending();
        module.set_lazy_pending(false);
        self.transition(module, ModuleState::Stopping);
        self.emit(ModuleEventKind::Stopping, module);

        let result = match module.activator() {
            Some(hook) if !lazy => {
                let context = self.context(module);
                call_guarded(|| hook.deactivate(&context))
            }
            _ => Ok(()),
        };

        self.release_resources(module);
        self.transition(module, ModuleState::Resolved);
        self.emit(ModuleEventKind::Stopped, module);

        match result {
            Ok(()) => {
                info!(module_id = module.id(), "模块停止成功");
                Ok(())
            }
            Err(cause) => {
                error!(module_id = module.id(), error = %cause, "模块停用失败");
                Err(CoreError::Deactivation {
                    module: module.to_string(),
                    cause,
                })
            }
        }
    }

    // ==================== 更新 ====================

    pub(crate) fn update(
        self: &Arc<Self>,
        module: &ModuleHandle,
        content: Option<&mut dyn Read>,
        requester: Option<&ModuleRecord>,
    ) -> Result<()> {
        self.ensure_lifecycle(module, "update", requester)?;
        let guard = self.lock_module(module)?;
        info!(module_id = module.id(), "更新模块");

        let state = module.state();
        if state == ModuleState::Uninstalled {
            return Err(CoreError::invalid_state(
                "update",
                "INSTALLED|RESOLVED|ACTIVE",
                state,
            ));
        }

        let content = {
            let _install = self.install_lock.lock();
            let content = self.read_content(module.location(), content)?;
            self.check_duplicate(&content, Some(module.id()))?;
            content
        };

        let restart = match state {
            ModuleState::Active => Some(StartOptions::transient()),
            ModuleState::Starting if module.is_lazy_activation_pending() => Some(StartOptions {
                transient: true,
                use_activation_policy: true,
            }),
            _ => None,
        };

        // 停止失败不中断更新，更新完成后返回给调用方
        let stop_result = match restart {
            Some(_) => self.stop_locked(module),
            None => Ok(()),
        };

        let was_resolved = module.state().is_resolved();
        module.replace_content(content);
        self.transition(module, ModuleState::Installed);
        if was_resolved {
            self.emit(ModuleEventKind::Unresolved, module);
        }
        self.emit(ModuleEventKind::Updated, module);
        drop(guard);
        info!(module_id = module.id(), "模块更新成功");

        if let Some(options) = restart {
            if let Err(e) = self.start_unchecked(module, options) {
                warn!(module_id = module.id(), error = %e, "更新后重启模块失败");
                self.events.report_error(Some(module), e);
            }
        }
        stop_result
    }

    // ==================== 卸载 ====================

    pub(crate) fn uninstall(
        self: &Arc<Self>,
        module: &ModuleHandle,
        requester: Option<&ModuleRecord>,
    ) -> Result<()> {
        self.ensure_lifecycle(module, "uninstall", requester)?;
        let _guard = self.lock_module(module)?;
        info!(module_id = module.id(), "卸载模块");

        if module.state() == ModuleState::Uninstalled {
            return Err(CoreError::invalid_state(
                "uninstall",
                "INSTALLED|RESOLVED|ACTIVE",
                ModuleState::Uninstalled,
            ));
        }

        if let Err(e) = self.stop_locked(module) {
            self.events.report_error(Some(module), e);
        }

        let was_resolved = module.state().is_resolved();
        {
            let mut table = self.modules.write();
            table.by_id.remove(&module.id());
            table.by_location.remove(module.location());
        }
        self.transition(module, ModuleState::Uninstalled);
        module.touch();

        if was_resolved {
            self.emit(ModuleEventKind::Unresolved, module);
        }
        self.emit(ModuleEventKind::Uninstalled, module);
        info!(module_id = module.id(), "模块已卸载");
        Ok(())
    }

    // ==================== 关闭 ====================

    pub(crate) fn shutdown(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("关闭模块注册中心...");

        let running: Vec<ModuleHandle> = self
            .installed_modules()
            .into_iter()
            .filter(|m| matches!(m.state(), ModuleState::Starting | ModuleState::Active))
            .collect();
        for module in running.iter().rev() {
            if let Err(e) = self.stop_unchecked(module, StopOptions::transient()) {
                warn!(module_id = module.id(), error = %e, "关闭时停止模块失败");
            }
        }

        self.services.unregister_all(&self.system);
        self.services.release_all(&self.system);
        self.events.shutdown();
        info!("模块注册中心已关闭");
    }
}
