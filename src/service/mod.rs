//! 服务模块
//!
//! 包含服务记录、服务工厂接口与服务注册表。

pub mod record;
pub mod registry;

pub use record::{
    RegistrationState, ServiceFactory, ServiceObject, ServiceRecord, ServiceReference,
    ServiceSource, OBJECT_CLASS, SERVICE_ID, SERVICE_RANKING,
};
pub use registry::{sort_by_ranking, ServiceRegistration, ServiceRegistry};
