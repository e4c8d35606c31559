//! 注册中心主接口
//!
//! 提供模块生命周期、服务注册查找与事件监听的统一入口。
//!
//! # 组件
//!
//! - `modules`: 已安装模块表，按 ID 与位置索引
//! - `services`: 服务注册表
//! - `events`: 事件分发器
//! - `system`: 系统模块（ID 0），宿主程序注册服务与监听器时使用
//!
//! # 生命周期
//!
//! 1. `new()` / `builder()` - 创建注册中心，启动事件分发线程
//! 2. `install()` / `start()` / ... - 管理模块
//! 3. `shutdown()` - 按安装逆序停止模块，排空异步事件后关闭分发线程

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::core::access::{self, AccessAction, AccessChecker, AccessDecision};
use crate::core::{FrameworkConfig, PropertyMap};
use crate::event::{DispatchStats, EventCallback, EventDispatcher, ListenerId, ListenerKind};
use crate::filter::Filter;
use crate::module::{
    ContentLoader, HeaderResolver, ManifestLoader, ModuleHandle, ModuleRecord, Resolver,
    StartOptions, StopOptions,
};
use crate::service::{
    ServiceObject, ServiceReference, ServiceRegistration, ServiceRegistry, ServiceSource,
};
use crate::utils::{CoreError, Result};

/// 已安装模块表
#[derive(Default)]
pub(crate) struct ModuleTable {
    pub(crate) by_id: BTreeMap<u64, ModuleHandle>,
    pub(crate) by_location: HashMap<String, ModuleHandle>,
}

/// 注册中心共享状态
pub(crate) struct RegistryInner {
    pub(crate) config: FrameworkConfig,
    pub(crate) loader: Arc<dyn ContentLoader>,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) access: Option<Arc<dyn AccessChecker>>,
    pub(crate) modules: RwLock<ModuleTable>,
    pub(crate) next_module_id: AtomicU64,
    /// 串行化安装与更新时的重复标识检查
    pub(crate) install_lock: Mutex<()>,
    pub(crate) services: Arc<ServiceRegistry>,
    pub(crate) events: Arc<EventDispatcher>,
    pub(crate) system: ModuleHandle,
    pub(crate) closed: AtomicBool,
}

impl RegistryInner {
    /// 执行访问检查
    pub(crate) fn check_access(
        &self,
        action: AccessAction,
        target: &str,
        requester: Option<&ModuleRecord>,
    ) -> Result<()> {
        access::enforce(self.access.as_deref(), action, target, requester)
    }

    /// 静默检查，用于过滤查询结果
    pub(crate) fn is_permitted(
        &self,
        action: AccessAction,
        target: &str,
        requester: Option<&ModuleRecord>,
    ) -> bool {
        self.access
            .as_ref()
            .map_or(true, |c| c.check(action, target, requester) == AccessDecision::Allow)
    }

    /// 已安装模块快照，按 ID 升序
    pub(crate) fn installed_modules(&self) -> Vec<ModuleHandle> {
        self.modules.read().by_id.values().cloned().collect()
    }

    pub(crate) fn register_service(
        &self,
        owner: &ModuleHandle,
        type_names: &[&str],
        source: ServiceSource,
        properties: PropertyMap,
    ) -> Result<ServiceRegistration> {
        for name in type_names {
            self.check_access(AccessAction::RegisterService, name, Some(owner.as_ref()))?;
        }
        self.services.register(owner, type_names, source, properties)
    }

    pub(crate) fn find_references(
        &self,
        type_name: Option<&str>,
        filter: Option<&str>,
        requester: Option<&ModuleRecord>,
    ) -> Result<Vec<ServiceReference>> {
        let filter = filter.map(Filter::parse).transpose()?;
        let mut references = self.services.references(type_name, filter.as_ref());
        if self.access.is_some() {
            references.retain(|r| {
                r.type_names()
                    .iter()
                    .any(|t| self.is_permitted(AccessAction::GetService, t, requester))
            });
        }
        Ok(references)
    }

    pub(crate) fn get_service(
        &self,
        consumer: &ModuleHandle,
        reference: &ServiceReference,
    ) -> Option<ServiceObject> {
        let permitted = reference
            .type_names()
            .iter()
            .any(|t| self.is_permitted(AccessAction::GetService, t, Some(consumer.as_ref())));
        if !permitted {
            let target = reference.type_names().join(", ");
            access::log_denied(AccessAction::GetService, &target, Some(consumer.as_ref()));
            return None;
        }
        self.services.get_service(consumer, reference)
    }

    pub(crate) fn add_listener(
        &self,
        owner: &ModuleHandle,
        kind: ListenerKind,
        filter: Option<&str>,
        callback: EventCallback,
    ) -> Result<ListenerId> {
        let state = owner.state();
        if !state.is_live() {
            return Err(CoreError::invalid_state(
                "add_listener",
                "STARTING|ACTIVE|STOPPING",
                state,
            ));
        }
        self.check_access(AccessAction::AddListener, &kind.to_string(), Some(owner.as_ref()))?;
        let filter = filter.map(Filter::parse).transpose()?;
        Ok(self.events.subscribe(owner, kind, filter, callback))
    }
}

/// 注册中心
///
/// 克隆开销很小，所有克隆共享同一份状态。
///
/// # Example
///
/// ```rust,no_run
/// use chips_registry::{FrameworkConfig, PropertyMap, Registry, ServiceObject, ServiceSource};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = Registry::builder().config(FrameworkConfig::default()).build()?;
///
///     let system = registry.system_module();
///     let object = ServiceObject::new(String::from("hello"), ["com.acme.Greeting"]);
///     registry.register_service(
///         &system,
///         &["com.acme.Greeting"],
///         ServiceSource::singleton(object),
///         PropertyMap::new(),
///     )?;
///
///     let reference = registry.get_service_reference(Some("com.acme.Greeting"), None)?;
///     assert!(reference.is_some());
///
///     registry.shutdown();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Registry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl Registry {
    // ==================== 初始化与关闭 ====================

    /// 创建注册中心
    ///
    /// # Errors
    ///
    /// 配置无效或事件分发线程无法启动时返回错误
    pub fn new(
        config: FrameworkConfig,
        loader: Arc<dyn ContentLoader>,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self> {
        Self::with_parts(config, loader, resolver, None)
    }

    /// 创建构建器
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    fn with_parts(
        config: FrameworkConfig,
        loader: Arc<dyn ContentLoader>,
        resolver: Arc<dyn Resolver>,
        access: Option<Arc<dyn AccessChecker>>,
    ) -> Result<Self> {
        info!("初始化模块注册中心 v{}", crate::VERSION);
        config.validate()?;

        let events = Arc::new(EventDispatcher::new(&config.events)?);
        debug!("事件分发器初始化完成");

        let services = Arc::new(ServiceRegistry::new(Arc::clone(&events)));
        debug!("服务注册表初始化完成");

        let inner = RegistryInner {
            config,
            loader,
            resolver,
            access,
            modules: RwLock::new(ModuleTable::default()),
            next_module_id: AtomicU64::new(1),
            install_lock: Mutex::new(()),
            services,
            events,
            system: Arc::new(ModuleRecord::system()),
            closed: AtomicBool::new(false),
        };

        info!("模块注册中心初始化完成");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    /// 关闭注册中心
    ///
    /// 按安装逆序瞬时停止所有活动模块，然后排空异步事件并停止分发线程。
    /// 重复调用无效果。
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// 是否已关闭
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 当前配置
    pub fn config(&self) -> &FrameworkConfig {
        &self.inner.config
    }

    // ==================== 模块生命周期 ====================

    /// 安装模块
    ///
    /// 同一位置重复安装返回已有模块。`content` 为空时由加载器从位置读取。
    ///
    /// # Errors
    ///
    /// - `CoreError::ContentRead` - 内容无法读取或解析
    /// - `CoreError::DuplicateIdentity` - 同名同版本模块已安装
    /// - `CoreError::AccessDenied` - 访问检查拒绝
    pub fn install(&self, location: &str, content: Option<&mut dyn Read>) -> Result<ModuleHandle> {
        self.inner.install(location, content, None)
    }

    /// 解析模块依赖
    pub fn resolve(&self, module: &ModuleHandle) -> Result<()> {
        self.inner.resolve(module)
    }

    /// 启动模块
    ///
    /// # Errors
    ///
    /// - `CoreError::Resolution` - 依赖无法满足
    /// - `CoreError::Activation` - 激活钩子失败，模块已回到 RESOLVED
    /// - `CoreError::InvalidState` - 模块已卸载
    /// - `CoreError::StateChangeTimeout` - 等待状态变更锁超时
    /// - `CoreError::SystemModule` - 目标为系统模块
    pub fn start(&self, module: &ModuleHandle, options: StartOptions) -> Result<()> {
        self.inner.start(module, options, None)
    }

    /// 触发延迟激活
    ///
    /// 模块以延迟策略启动后停留在 STARTING，调用此方法完成激活。
    pub fn trigger_activation(&self, module: &ModuleHandle) -> Result<()> {
        self.inner.trigger_activation(module, None)
    }

    /// 停止模块
    ///
    /// # Errors
    ///
    /// - `CoreError::Deactivation` - 停用钩子失败（清理已完成，模块已回到 RESOLVED）
    /// - `CoreError::InvalidState` - 模块已卸载
    pub fn stop(&self, module: &ModuleHandle, options: StopOptions) -> Result<()> {
        self.inner.stop(module, options, None)
    }

    /// 更新模块内容
    ///
    /// 活动模块会先停止、替换内容后重新启动；重启失败通过框架错误事件报告。
    pub fn update(&self, module: &ModuleHandle, content: Option<&mut dyn Read>) -> Result<()> {
        self.inner.update(module, content, None)
    }

    /// 卸载模块
    pub fn uninstall(&self, module: &ModuleHandle) -> Result<()> {
        self.inner.uninstall(module, None)
    }

    // ==================== 模块查询 ====================

    /// 按 ID 查找已安装模块，ID 0 返回系统模块
    pub fn module(&self, id: u64) -> Option<ModuleHandle> {
        if id == self.inner.system.id() {
            return Some(Arc::clone(&self.inner.system));
        }
        self.inner.modules.read().by_id.get(&id).cloned()
    }

    /// 按位置查找已安装模块
    pub fn module_by_location(&self, location: &str) -> Option<ModuleHandle> {
        self.inner.modules.read().by_location.get(location).cloned()
    }

    /// 所有已安装模块（不含系统模块），按 ID 升序
    pub fn modules(&self) -> Vec<ModuleHandle> {
        self.inner.installed_modules()
    }

    /// 系统模块
    pub fn system_module(&self) -> ModuleHandle {
        Arc::clone(&self.inner.system)
    }

    // ==================== 服务 ====================

    /// 注册服务
    ///
    /// # Errors
    ///
    /// - `CoreError::InvalidState` - 所属模块不在 STARTING/ACTIVE/STOPPING 状态
    /// - `CoreError::TypeMismatch` - 服务对象未实现声明的类型名
    /// - `CoreError::AccessDenied` - 访问检查拒绝
    pub fn register_service(
        &self,
        owner: &ModuleHandle,
        type_names: &[&str],
        source: ServiceSource,
        properties: PropertyMap,
    ) -> Result<ServiceRegistration> {
        self.inner.register_service(owner, type_names, source, properties)
    }

    /// 查找服务引用，按优先级降序、服务 ID 升序排列
    ///
    /// # Errors
    ///
    /// 过滤器语法错误时返回 `CoreError::FilterSyntax`
    pub fn get_service_references(
        &self,
        type_name: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceReference>> {
        self.inner.find_references(type_name, filter, None)
    }

    /// 查找最佳服务引用
    pub fn get_service_reference(
        &self,
        type_name: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Option<ServiceReference>> {
        Ok(self
            .inner
            .find_references(type_name, filter, None)?
            .into_iter()
            .next())
    }

    /// 按服务 ID 查找引用
    pub fn service_reference_by_id(&self, service_id: u64) -> Option<ServiceReference> {
        self.inner.services.reference_by_id(service_id)
    }

    /// 获取服务对象，使用计数加一
    ///
    /// 服务已注销、工厂失败或访问被拒绝时返回 `None`。
    pub fn get_service(
        &self,
        consumer: &ModuleHandle,
        reference: &ServiceReference,
    ) -> Option<ServiceObject> {
        self.inner.get_service(consumer, reference)
    }

    /// 释放服务对象，使用计数减一
    pub fn unget_service(&self, consumer: &ModuleHandle, reference: &ServiceReference) -> bool {
        self.inner.services.unget_service(consumer, reference)
    }

    /// 模块注册的服务
    pub fn registered_services(&self, module: &ModuleHandle) -> Vec<ServiceReference> {
        self.inner.services.registered_services(module)
    }

    /// 模块正在使用的服务
    pub fn services_in_use(&self, module: &ModuleHandle) -> Vec<ServiceReference> {
        self.inner.services.services_in_use(module)
    }

    /// 正在使用服务的模块
    pub fn using_modules(&self, reference: &ServiceReference) -> Vec<ModuleHandle> {
        self.inner.services.using_modules(reference)
    }

    /// 模块对服务的使用计数
    pub fn use_count(&self, consumer: &ModuleHandle, reference: &ServiceReference) -> usize {
        self.inner.services.use_count(consumer, reference)
    }

    // ==================== 事件 ====================

    /// 添加监听器
    ///
    /// 过滤器只对服务监听器生效。
    ///
    /// # Errors
    ///
    /// - `CoreError::FilterSyntax` - 过滤器语法错误
    /// - `CoreError::InvalidState` - 所属模块不在 STARTING/ACTIVE/STOPPING 状态
    pub fn add_listener(
        &self,
        owner: &ModuleHandle,
        kind: ListenerKind,
        filter: Option<&str>,
        callback: EventCallback,
    ) -> Result<ListenerId> {
        self.inner.add_listener(owner, kind, filter, callback)
    }

    /// 移除监听器
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// 等待已发布的异步事件投递完毕
    pub fn flush_events(&self, timeout: Duration) -> bool {
        self.inner.events.flush(timeout)
    }

    /// 事件分发统计
    pub fn dispatch_stats(&self) -> DispatchStats {
        self.inner.events.stats()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("modules", &self.inner.modules.read().by_id.len())
            .field("services", &self.inner.services.service_count())
            .field("listeners", &self.inner.events.listener_count())
            .finish()
    }
}

/// 注册中心构建器
///
/// 未指定加载器与解析器时使用 [`ManifestLoader`] 与 [`HeaderResolver`]。
#[derive(Default)]
pub struct RegistryBuilder {
    config: FrameworkConfig,
    loader: Option<Arc<dyn ContentLoader>>,
    resolver: Option<Arc<dyn Resolver>>,
    access: Option<Arc<dyn AccessChecker>>,
}

impl RegistryBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置配置
    pub fn config(mut self, config: FrameworkConfig) -> Self {
        self.config = config;
        self
    }

    /// 设置内容加载器
    pub fn loader(mut self, loader: Arc<dyn ContentLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// 设置依赖解析器
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// 设置访问检查器
    pub fn access_checker(mut self, checker: Arc<dyn AccessChecker>) -> Self {
        self.access = Some(checker);
        self
    }

    /// 构建注册中心
    pub fn build(self) -> Result<Registry> {
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(ManifestLoader::new()));
        let resolver = self.resolver.unwrap_or_else(|| Arc::new(HeaderResolver));
        Registry::with_parts(self.config, loader, resolver, self.access)
    }
}
