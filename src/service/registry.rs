//! 服务注册表
//!
//! 负责服务的注册、查找排序与按使用方计数的获取/释放。
//!
//! # 使用计数
//!
//! 每个 (服务, 使用方模块) 对维护一个计数。计数从 0 变为 1 时，
//! 工厂服务会调用 [`ServiceFactory::get_service`] 创建实例；计数回到 0 时
//! 调用 [`ServiceFactory::unget_service`] 释放。同一对上的工厂调用串行执行，
//! 工厂在执行期间再次请求同一服务会被判定为递归调用。
//!
//! [`ServiceFactory::get_service`]: super::ServiceFactory::get_service
//! [`ServiceFactory::unget_service`]: super::ServiceFactory::unget_service

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::record::{
    RegistrationState, ServiceObject, ServiceRecord, ServiceReference, ServiceSource,
};
use crate::core::PropertyMap;
use crate::event::{EventDispatcher, ServiceEvent, ServiceEventKind};
use crate::filter::Filter;
use crate::module::activator::panic_message;
use crate::module::ModuleHandle;
use crate::utils::{CoreError, FactoryErrorKind, Result};

/// 单个 (服务, 使用方) 的使用记录
struct Usage {
    consumer: ModuleHandle,
    reference: ServiceReference,
    count: usize,
    object: Option<ServiceObject>,
    /// 正在执行工厂回调的线程
    busy: Option<ThreadId>,
}

impl Usage {
    fn new(consumer: &ModuleHandle, reference: &ServiceReference) -> Self {
        Self {
            consumer: Arc::clone(consumer),
            reference: Arc::clone(reference),
            count: 0,
            object: None,
            busy: None,
        }
    }
}

type UsageKey = (u64, u64);

#[derive(Default)]
struct ServiceTable {
    /// 可被查找的服务，按服务 ID 排序
    services: BTreeMap<u64, ServiceReference>,
    usages: HashMap<UsageKey, Usage>,
}

/// 获取服务时的下一步动作
enum Acquire {
    Ready(ServiceObject),
    Create(ServiceSource),
    Recursion,
    Wait,
    Unavailable,
}

/// 服务注册表
pub struct ServiceRegistry {
    table: Mutex<ServiceTable>,
    usage_changed: Condvar,
    next_service_id: AtomicU64,
    events: Arc<EventDispatcher>,
}

impl ServiceRegistry {
    /// 创建注册表
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            table: Mutex::new(ServiceTable::default()),
            usage_changed: Condvar::new(),
            next_service_id: AtomicU64::new(1),
            events,
        }
    }

    // ==================== 注册 ====================

    /// 注册服务
    ///
    /// # Errors
    ///
    /// - `CoreError::InvalidState` - 所属模块不在 STARTING/ACTIVE/STOPPING 状态
    /// - `CoreError::TypeMismatch` - 未声明类型名，或单例对象未实现某个类型名
    pub fn register(
        self: &Arc<Self>,
        owner: &ModuleHandle,
        type_names: &[&str],
        source: ServiceSource,
        properties: PropertyMap,
    ) -> Result<ServiceRegistration> {
        let state = owner.state();
        if !state.is_live() {
            return Err(CoreError::invalid_state(
                "register_service",
                "STARTING|ACTIVE|STOPPING",
                state,
            ));
        }
        if type_names.is_empty() {
            return Err(CoreError::TypeMismatch("未声明任何服务类型名".to_string()));
        }
        if let ServiceSource::Singleton(object) = &source {
            if let Some(missing) = type_names.iter().find(|name| !object.implements(name)) {
                return Err(CoreError::TypeMismatch(format!("服务对象未实现 '{}'", missing)));
            }
        }

        let id = self.next_service_id.fetch_add(1, Ordering::SeqCst);
        let names: Vec<String> = type_names.iter().map(|s| s.to_string()).collect();
        let reference = Arc::new(ServiceRecord::new(
            id,
            Arc::clone(owner),
            names,
            source,
            properties,
        ));
        self.table.lock().services.insert(id, Arc::clone(&reference));

        info!(
            service_id = id,
            module_id = owner.id(),
            object_class = ?type_names,
            "服务已注册"
        );
        self.events.publish_service(
            ServiceEvent::new(ServiceEventKind::Registered, Arc::clone(&reference)),
            None,
        );

        Ok(ServiceRegistration {
            registry: Arc::clone(self),
            reference,
        })
    }

    /// 替换服务属性（保留属性不变）并发布 MODIFIED 事件
    ///
    /// # Errors
    ///
    /// 服务已注销或正在注销时返回 `CoreError::InvalidState`
    pub fn set_properties(&self, reference: &ServiceReference, properties: PropertyMap) -> Result<()> {
        let state = reference.state();
        if state != RegistrationState::Registered {
            return Err(CoreError::invalid_state("set_properties", "REGISTERED", state));
        }

        let previous = reference.replace_properties(properties);
        debug!(service_id = reference.id(), "服务属性已修改");
        self.events.publish_service(
            ServiceEvent::new(ServiceEventKind::Modified, Arc::clone(reference)),
            Some(&previous),
        );
        Ok(())
    }

    /// 注销服务
    ///
    /// 先发布 UNREGISTERING（监听器此时仍可获取服务），再从查找表移除，
    /// 最后强制释放所有使用方。
    ///
    /// # Errors
    ///
    /// 重复注销时返回 `CoreError::InvalidState`
    pub fn unregister(&self, reference: &ServiceReference) -> Result<()> {
        let previous = reference.transition(
            RegistrationState::Registered,
            RegistrationState::Unregistering,
        );
        if previous != RegistrationState::Registered {
            return Err(CoreError::invalid_state("unregister", "REGISTERED", previous));
        }

        self.events.publish_service(
            ServiceEvent::new(ServiceEventKind::Unregistering, Arc::clone(reference)),
            None,
        );

        self.table.lock().services.remove(&reference.id());
        reference.set_state(RegistrationState::Unregistered);

        let service_id = reference.id();
        let released = self.release_where(|(svc, _)| *svc == service_id);
        info!(service_id, released, "服务已注销");
        Ok(())
    }

    /// 注销模块注册的全部服务，返回注销数量
    pub fn unregister_all(&self, owner: &ModuleHandle) -> usize {
        self.registered_services(owner)
            .iter()
            .filter(|reference| self.unregister(reference).is_ok())
            .count()
    }

    // ==================== 查找 ====================

    /// 按类型名与过滤器查找服务，按排序规则返回
    ///
    /// 排序：`service.ranking` 高者在前，相同时服务 ID 小者在前。
    pub fn references(&self, type_name: Option<&str>, filter: Option<&Filter>) -> Vec<ServiceReference> {
        let candidates: Vec<ServiceReference> = self.table.lock().services.values().cloned().collect();

        let mut matches: Vec<ServiceReference> = candidates
            .into_iter()
            .filter(|r| type_name.map_or(true, |t| r.has_type(t)))
            .filter(|r| filter.map_or(true, |f| f.matches(&r.properties())))
            .collect();
        sort_by_ranking(&mut matches);
        matches
    }

    /// 按 ID 查找服务
    pub fn reference_by_id(&self, service_id: u64) -> Option<ServiceReference> {
        self.table.lock().services.get(&service_id).cloned()
    }

    /// 模块注册的服务（按 ID 升序）
    pub fn registered_services(&self, owner: &ModuleHandle) -> Vec<ServiceReference> {
        self.table
            .lock()
            .services
            .values()
            .filter(|r| r.owner().id() == owner.id())
            .cloned()
            .collect()
    }

    /// 模块正在使用的服务
    pub fn services_in_use(&self, consumer: &ModuleHandle) -> Vec<ServiceReference> {
        let mut in_use: Vec<ServiceReference> = self
            .table
            .lock()
            .usages
            .values()
            .filter(|u| u.consumer.id() == consumer.id() && u.count > 0)
            .map(|u| Arc::clone(&u.reference))
            .collect();
        in_use.sort_by_key(|r| r.id());
        in_use
    }

    /// 正在使用服务的模块
    pub fn using_modules(&self, reference: &ServiceReference) -> Vec<ModuleHandle> {
        let mut users: Vec<ModuleHandle> = self
            .table
            .lock()
            .usages
            .values()
            .filter(|u| u.reference.id() == reference.id() && u.count > 0)
            .map(|u| Arc::clone(&u.consumer))
            .collect();
        users.sort_by_key(|m| m.id());
        users
    }

    /// 使用方对服务的当前计数
    pub fn use_count(&self, consumer: &ModuleHandle, reference: &ServiceReference) -> usize {
        self.table
            .lock()
            .usages
            .get(&(reference.id(), consumer.id()))
            .map_or(0, |u| u.count)
    }

    /// 可查找的服务数量
    pub fn service_count(&self) -> usize {
        self.table.lock().services.len()
    }

    // ==================== 获取与释放 ====================

    /// 获取服务实例并增加使用计数
    ///
    /// 服务已注销时返回 `None`。工厂失败、递归调用或返回的对象类型不符时
    /// 同样返回 `None`，错误通过框架错误事件异步上报。工厂创建期间使用方
    /// 被停止时，新实例立即交还工厂，同样返回 `None`。
    pub fn get_service(&self, consumer: &ModuleHandle, reference: &ServiceReference) -> Option<ServiceObject> {
        let key = (reference.id(), consumer.id());
        let me = thread::current().id();
        let activation = consumer.activation();

        let source = {
            let mut table = self.table.lock();
            loop {
                match Self::next_acquire(&mut table, key, me, consumer, reference) {
                    Acquire::Ready(object) => return Some(object),
                    Acquire::Unavailable => return None,
                    Acquire::Wait => self.usage_changed.wait(&mut table),
                    Acquire::Recursion => {
                        drop(table);
                        self.report_factory_error(consumer, reference, FactoryErrorKind::Recursion);
                        return None;
                    }
                    Acquire::Create(source) => break source,
                }
            }
        };

        match source {
            ServiceSource::Singleton(object) => Some(object),
            ServiceSource::Factory(factory) => {
                let outcome = Self::create_instance(factory.as_ref(), consumer, reference);
                self.finish_create(key, activation, consumer, reference, factory.as_ref(), outcome)
            }
        }
    }

    fn next_acquire(
        table: &mut ServiceTable,
        key: UsageKey,
        me: ThreadId,
        consumer: &ModuleHandle,
        reference: &ServiceReference,
    ) -> Acquire {
        if reference.state() == RegistrationState::Unregistered {
            return Acquire::Unavailable;
        }

        let usage = table
            .usages
            .entry(key)
            .or_insert_with(|| Usage::new(consumer, reference));

        match usage.busy {
            Some(owner) if owner == me => return Acquire::Recursion,
            Some(_) => return Acquire::Wait,
            None => {}
        }

        if let Some(object) = usage.object.as_ref() {
            usage.count += 1;
            return Acquire::Ready(object.clone());
        }

        match reference.source() {
            ServiceSource::Singleton(object) => {
                usage.object = Some(object.clone());
                usage.count = 1;
                Acquire::Create(ServiceSource::Singleton(object.clone()))
            }
            ServiceSource::Factory(factory) => {
                usage.busy = Some(me);
                Acquire::Create(ServiceSource::Factory(Arc::clone(factory)))
            }
        }
    }

    fn create_instance(
        factory: &dyn super::ServiceFactory,
        consumer: &ModuleHandle,
        reference: &ServiceReference,
    ) -> std::result::Result<ServiceObject, FactoryErrorKind> {
        let created = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            factory.get_service(consumer, reference)
        }));

        match created {
            Ok(Ok(object)) => match reference.type_names().iter().find(|t| !object.implements(t)) {
                Some(missing) => Err(FactoryErrorKind::InvalidResult(format!(
                    "返回的对象未实现 '{}'",
                    missing
                ))),
                None => Ok(object),
            },
            Ok(Err(e)) => Err(FactoryErrorKind::Exception(e.to_string())),
            Err(payload) => Err(FactoryErrorKind::Exception(panic_message(payload.as_ref()))),
        }
    }

    fn finish_create(
        &self,
        key: UsageKey,
        activation: u64,
        consumer: &ModuleHandle,
        reference: &ServiceReference,
        factory: &dyn super::ServiceFactory,
        outcome: std::result::Result<ServiceObject, FactoryErrorKind>,
    ) -> Option<ServiceObject> {
        let mut table = self.table.lock();
        // release_all 会跳过创建中的记录，使用方在此期间结束激活时由这里收尾
        let stale = reference.state() == RegistrationState::Unregistered
            || consumer.activation() != activation;

        match outcome {
            Ok(object) if !stale => {
                let usage = table
                    .usages
                    .entry(key)
                    .or_insert_with(|| Usage::new(consumer, reference));
                usage.busy = None;
                usage.count = 1;
                usage.object = Some(object.clone());
                self.usage_changed.notify_all();
                debug!(
                    service_id = reference.id(),
                    module_id = consumer.id(),
                    "工厂服务实例已创建"
                );
                Some(object)
            }
            Ok(object) => {
                table.usages.remove(&key);
                self.usage_changed.notify_all();
                drop(table);
                self.call_unget(factory, consumer, reference, object);
                None
            }
            Err(kind) => {
                table.usages.remove(&key);
                self.usage_changed.notify_all();
                drop(table);
                self.report_factory_error(consumer, reference, kind);
                None
            }
        }
    }

    /// 减少使用计数，计数归零时释放工厂实例
    ///
    /// 计数已为 0 或服务已注销时返回 false。
    pub fn unget_service(&self, consumer: &ModuleHandle, reference: &ServiceReference) -> bool {
        let key = (reference.id(), consumer.id());
        let me = thread::current().id();
        let mut table = self.table.lock();

        let (object, factory) = loop {
            if reference.state() == RegistrationState::Unregistered {
                return false;
            }
            let Some(usage) = table.usages.get_mut(&key) else {
                return false;
            };
            match usage.busy {
                Some(owner) if owner == me => return false,
                Some(_) => {
                    self.usage_changed.wait(&mut table);
                    continue;
                }
                None => {}
            }
            if usage.count == 0 {
                return false;
            }

            usage.count -= 1;
            if usage.count > 0 {
                return true;
            }

            match reference.source() {
                ServiceSource::Factory(factory) => {
                    usage.busy = Some(me);
                    break (usage.object.take(), Arc::clone(factory));
                }
                ServiceSource::Singleton(_) => {
                    table.usages.remove(&key);
                    return true;
                }
            }
        };

        drop(table);
        if let Some(object) = object {
            self.call_unget(factory.as_ref(), consumer, reference, object);
        }

        let mut table = self.table.lock();
        table.usages.remove(&key);
        self.usage_changed.notify_all();
        true
    }

    /// 释放模块使用的全部服务，返回释放数量
    pub fn release_all(&self, consumer: &ModuleHandle) -> usize {
        let consumer_id = consumer.id();
        self.release_where(|(_, user)| *user == consumer_id)
    }

    /// 强制释放满足条件的使用记录；正在执行工厂回调的记录由回调方收尾
    fn release_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&UsageKey) -> bool,
    {
        let released: Vec<Usage> = {
            let mut table = self.table.lock();
            let keys: Vec<UsageKey> = table
                .usages
                .iter()
                .filter(|(key, usage)| predicate(key) && usage.busy.is_none())
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| table.usages.remove(&key))
                .collect()
        };

        let mut count = 0;
        for usage in released {
            if usage.count == 0 {
                continue;
            }
            count += 1;
            if let (ServiceSource::Factory(factory), Some(object)) =
                (usage.reference.source(), usage.object)
            {
                self.call_unget(factory.as_ref(), &usage.consumer, &usage.reference, object);
            }
        }

        self.usage_changed.notify_all();
        count
    }

    fn call_unget(
        &self,
        factory: &dyn super::ServiceFactory,
        consumer: &ModuleHandle,
        reference: &ServiceReference,
        object: ServiceObject,
    ) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            factory.unget_service(consumer, reference, object)
        }));
        match result {
            Ok(()) => debug!(
                service_id = reference.id(),
                module_id = consumer.id(),
                "工厂服务实例已释放"
            ),
            Err(payload) => self.report_factory_error(
                consumer,
                reference,
                FactoryErrorKind::Exception(panic_message(payload.as_ref())),
            ),
        }
    }

    fn report_factory_error(&self, consumer: &ModuleHandle, reference: &ServiceReference, kind: FactoryErrorKind) {
        self.events.report_error(
            Some(consumer),
            CoreError::Factory {
                service_id: reference.id(),
                kind,
            },
        );
    }
}

/// 按排序规则排列：ranking 降序，服务 ID 升序
pub fn sort_by_ranking(references: &mut [ServiceReference]) {
    references.sort_by_cached_key(|r| (Reverse(r.ranking()), r.id()));
}

/// 服务注册凭据
///
/// 注册方通过它修改属性或注销服务。
#[derive(Clone)]
pub struct ServiceRegistration {
    registry: Arc<ServiceRegistry>,
    reference: ServiceReference,
}

impl ServiceRegistration {
    /// 服务引用
    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    /// 替换服务属性
    pub fn set_properties(&self, properties: PropertyMap) -> Result<()> {
        self.registry.set_properties(&self.reference, properties)
    }

    /// 注销服务
    pub fn unregister(&self) -> Result<()> {
        self.registry.unregister(&self.reference)
    }
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("reference", &self.reference)
            .finish()
    }
}
