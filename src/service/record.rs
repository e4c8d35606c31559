//! 服务记录
//!
//! 服务对象、服务工厂以及注册后的服务记录。

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::{PropertyMap, PropertyValue};
use crate::module::ModuleHandle;

/// 保留属性：服务类型名列表
pub const OBJECT_CLASS: &str = "objectClass";

/// 保留属性：服务 ID
pub const SERVICE_ID: &str = "service.id";

/// 排序属性：服务优先级
pub const SERVICE_RANKING: &str = "service.ranking";

/// 类型擦除的服务对象
///
/// 携带可赋值的类型名集合；注册时声明的每个类型名都必须在集合中。
#[derive(Clone)]
pub struct ServiceObject {
    instance: Arc<dyn Any + Send + Sync>,
    implements: BTreeSet<String>,
}

impl ServiceObject {
    /// 包装服务实例并声明其实现的类型名
    pub fn new<T, I, S>(instance: T, implements: I) -> Self
    where
        T: Any + Send + Sync,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_arc(Arc::new(instance), implements)
    }

    /// 包装已共享的实例
    pub fn from_arc<I, S>(instance: Arc<dyn Any + Send + Sync>, implements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            instance,
            implements: implements.into_iter().map(Into::into).collect(),
        }
    }

    /// 是否可赋值给类型名
    pub fn implements(&self, type_name: &str) -> bool {
        self.implements.contains(type_name)
    }

    /// 声明实现的类型名
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.implements.iter().map(String::as_str)
    }

    /// 向下转型为具体类型
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.instance).downcast::<T>().ok()
    }

    /// 两个服务对象是否指向同一实例
    pub fn same_instance(&self, other: &ServiceObject) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }
}

impl fmt::Debug for ServiceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceObject")
            .field("implements", &self.implements)
            .finish()
    }
}

/// 服务工厂
///
/// 为每个使用方模块创建独立实例。同一 (服务, 使用方) 上的调用不会并发。
pub trait ServiceFactory: Send + Sync {
    /// 为使用方创建服务实例
    fn get_service(&self, consumer: &ModuleHandle, reference: &ServiceReference) -> anyhow::Result<ServiceObject>;

    /// 使用方释放服务实例
    fn unget_service(&self, consumer: &ModuleHandle, reference: &ServiceReference, service: ServiceObject);
}

/// 注册的服务内容
#[derive(Clone)]
pub enum ServiceSource {
    /// 所有使用方共享的单例
    Singleton(ServiceObject),
    /// 按使用方创建实例的工厂
    Factory(Arc<dyn ServiceFactory>),
}

impl ServiceSource {
    /// 共享单例
    pub fn singleton(object: ServiceObject) -> Self {
        ServiceSource::Singleton(object)
    }

    /// 工厂
    pub fn factory<F: ServiceFactory + 'static>(factory: F) -> Self {
        ServiceSource::Factory(Arc::new(factory))
    }

    /// 是否为工厂
    pub fn is_factory(&self) -> bool {
        matches!(self, ServiceSource::Factory(_))
    }
}

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    /// 已注册
    Registered,
    /// 正在注销，事件投递期间服务仍可获取
    Unregistering,
    /// 已注销
    Unregistered,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationState::Registered => "REGISTERED",
            RegistrationState::Unregistering => "UNREGISTERING",
            RegistrationState::Unregistered => "UNREGISTERED",
        };
        f.write_str(name)
    }
}

/// 服务引用
pub type ServiceReference = Arc<ServiceRecord>;

struct ServiceData {
    properties: PropertyMap,
    state: RegistrationState,
}

/// 已注册的服务
pub struct ServiceRecord {
    id: u64,
    owner: ModuleHandle,
    type_names: Vec<String>,
    source: ServiceSource,
    data: RwLock<ServiceData>,
}

impl ServiceRecord {
    pub(crate) fn new(
        id: u64,
        owner: ModuleHandle,
        type_names: Vec<String>,
        source: ServiceSource,
        properties: PropertyMap,
    ) -> Self {
        let properties = with_reserved(properties, &type_names, id);
        Self {
            id,
            owner,
            type_names,
            source,
            data: RwLock::new(ServiceData {
                properties,
                state: RegistrationState::Registered,
            }),
        }
    }

    /// 服务 ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 注册该服务的模块
    pub fn owner(&self) -> &ModuleHandle {
        &self.owner
    }

    /// 注册时声明的类型名
    pub fn type_names(&self) -> &[String] {
        &self.type_names
    }

    /// 是否以该类型名注册
    pub fn has_type(&self, type_name: &str) -> bool {
        self.type_names.iter().any(|t| t == type_name)
    }

    /// 属性快照
    pub fn properties(&self) -> PropertyMap {
        self.data.read().properties.clone()
    }

    /// 读取单个属性
    pub fn property(&self, key: &str) -> Option<PropertyValue> {
        self.data.read().properties.get(key).cloned()
    }

    /// 排序值，缺省或非整数时为 0
    pub fn ranking(&self) -> i64 {
        self.data
            .read()
            .properties
            .get(SERVICE_RANKING)
            .and_then(PropertyValue::as_integer)
            .unwrap_or(0)
    }

    /// 注册状态
    pub fn state(&self) -> RegistrationState {
        self.data.read().state
    }

    /// 是否由工厂提供
    pub fn is_factory(&self) -> bool {
        self.source.is_factory()
    }

    pub(crate) fn source(&self) -> &ServiceSource {
        &self.source
    }

    pub(crate) fn set_state(&self, state: RegistrationState) {
        self.data.write().state = state;
    }

    /// 当前状态为 `from` 时切换到 `to`，返回切换前的状态
    pub(crate) fn transition(&self, from: RegistrationState, to: RegistrationState) -> RegistrationState {
        let mut data = self.data.write();
        let current = data.state;
        if current == from {
            data.state = to;
        }
        current
    }

    /// 替换属性（保留属性不可覆盖），返回旧属性
    pub(crate) fn replace_properties(&self, properties: PropertyMap) -> PropertyMap {
        let properties = with_reserved(properties, &self.type_names, self.id);
        std::mem::replace(&mut self.data.write().properties, properties)
    }
}

fn with_reserved(mut properties: PropertyMap, type_names: &[String], id: u64) -> PropertyMap {
    properties.set(OBJECT_CLASS, PropertyValue::from(type_names.to_vec()));
    properties.set(SERVICE_ID, PropertyValue::Integer(id as i64));
    properties
}

impl fmt::Debug for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRecord")
            .field("id", &self.id)
            .field("owner", &self.owner.id())
            .field("type_names", &self.type_names)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] service.id={}", self.type_names.join(", "), self.id)
    }
}
