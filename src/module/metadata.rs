//! 模块记录定义
//!
//! 定义模块生命周期状态、启停选项以及已安装模块的运行时记录。

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use semver::Version;
use serde::{Deserialize, Serialize};

use super::activator::ActivationHook;
use super::lock::StateChangeLock;
use crate::core::{PropertyMap, PropertyValue};

/// 系统模块的固定 ID
pub const SYSTEM_MODULE_ID: u64 = 0;

/// 系统模块的位置
pub const SYSTEM_MODULE_LOCATION: &str = "System Module";

/// 已知的清单头名称
pub mod headers {
    /// 模块符号名
    pub const SYMBOLIC_NAME: &str = "Module-SymbolicName";
    /// 模块版本（semver）
    pub const VERSION: &str = "Module-Version";
    /// 可读名称
    pub const NAME: &str = "Module-Name";
    /// 激活器名称
    pub const ACTIVATOR: &str = "Module-Activator";
    /// 激活策略，取值 `lazy` 表示延迟激活
    pub const ACTIVATION_POLICY: &str = "Module-ActivationPolicy";
    /// 依赖声明，如 `com.acme.http; version=^1.2, com.acme.log`
    pub const REQUIRE_MODULE: &str = "Require-Module";
}

/// 模块生命周期状态
///
/// ```text
/// INSTALLED -> RESOLVED -> STARTING -> ACTIVE -> STOPPING -> RESOLVED
///                  任意非终止状态 -> UNINSTALLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModuleState {
    /// 已安装，依赖未解析
    Installed,
    /// 依赖已解析
    Resolved,
    /// 正在启动（或等待延迟激活）
    Starting,
    /// 运行中
    Active,
    /// 正在停止
    Stopping,
    /// 已卸载（终止状态）
    Uninstalled,
}

impl ModuleState {
    /// 状态名称
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Installed => "INSTALLED",
            ModuleState::Resolved => "RESOLVED",
            ModuleState::Starting => "STARTING",
            ModuleState::Active => "ACTIVE",
            ModuleState::Stopping => "STOPPING",
            ModuleState::Uninstalled => "UNINSTALLED",
        }
    }

    /// 依赖是否已解析
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            ModuleState::Resolved | ModuleState::Starting | ModuleState::Active | ModuleState::Stopping
        )
    }

    /// 该状态下的模块能否注册服务、接收服务事件
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ModuleState::Starting | ModuleState::Active | ModuleState::Stopping
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 激活策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationPolicy {
    /// 启动时立即激活
    #[default]
    Eager,
    /// 首次使用时激活
    Lazy,
}

/// 启动选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// 瞬时启动：不修改模块的持久启动标记
    pub transient: bool,
    /// 遵循模块声明的激活策略
    pub use_activation_policy: bool,
}

impl StartOptions {
    /// 瞬时启动
    pub fn transient() -> Self {
        Self {
            transient: true,
            ..Self::default()
        }
    }

    /// 遵循激活策略启动
    pub fn with_activation_policy() -> Self {
        Self {
            use_activation_policy: true,
            ..Self::default()
        }
    }
}

/// 停止选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// 瞬时停止：保留模块的持久启动标记
    pub transient: bool,
}

impl StopOptions {
    /// 瞬时停止
    pub fn transient() -> Self {
        Self { transient: true }
    }
}

/// 模块内容：加载器解析出的清单头与激活钩子
#[derive(Clone, Default)]
pub struct ModuleContent {
    /// 清单头
    pub headers: PropertyMap,
    /// 激活钩子
    pub activator: Option<Arc<dyn ActivationHook>>,
}

impl ModuleContent {
    /// 符号名
    pub fn symbolic_name(&self) -> Option<String> {
        self.headers.get(headers::SYMBOLIC_NAME).map(|v| v.to_string())
    }

    /// 版本号，缺省或无法解析时为 `0.0.0`
    pub fn version(&self) -> Version {
        parse_version(self.headers.get(headers::VERSION))
    }
}

fn parse_version(value: Option<&PropertyValue>) -> Version {
    value
        .and_then(|v| Version::parse(v.to_string().trim()).ok())
        .unwrap_or_else(|| Version::new(0, 0, 0))
}

impl fmt::Debug for ModuleContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContent")
            .field("headers", &self.headers)
            .field("activator", &self.activator.is_some())
            .finish()
    }
}

/// 模块句柄
pub type ModuleHandle = Arc<ModuleRecord>;

/// 可变部分
struct ModuleData {
    state: ModuleState,
    content: ModuleContent,
    last_modified: DateTime<Utc>,
    persistently_started: bool,
    lazy_pending: bool,
    /// 已结束的激活次数，上下文据此判断是否属于当前激活
    activation: u64,
}

/// 已安装模块的记录
///
/// ID 与位置在记录的整个生命周期内不变；卸载后记录仍可被持有者查询。
pub struct ModuleRecord {
    id: u64,
    location: String,
    data: RwLock<ModuleData>,
    lock: StateChangeLock,
}

impl ModuleRecord {
    pub(crate) fn new(id: u64, location: impl Into<String>, content: ModuleContent) -> Self {
        Self {
            id,
            location: location.into(),
            data: RwLock::new(ModuleData {
                state: ModuleState::Installed,
                content,
                last_modified: Utc::now(),
                persistently_started: false,
                lazy_pending: false,
                activation: 0,
            }),
            lock: StateChangeLock::new(),
        }
    }

    pub(crate) fn system() -> Self {
        let mut headers = PropertyMap::new();
        headers.set(headers::SYMBOLIC_NAME, "system.module");
        headers.set(headers::NAME, SYSTEM_MODULE_LOCATION);
        headers.set(headers::VERSION, env!("CARGO_PKG_VERSION"));

        let record = Self::new(
            SYSTEM_MODULE_ID,
            SYSTEM_MODULE_LOCATION,
            ModuleContent {
                headers,
                activator: None,
            },
        );
        record.set_state(ModuleState::Active);
        record
    }

    /// 模块 ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 安装位置
    pub fn location(&self) -> &str {
        &self.location
    }

    /// 当前状态
    pub fn state(&self) -> ModuleState {
        self.data.read().state
    }

    /// 是否为系统模块
    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_MODULE_ID
    }

    /// 清单头快照（卸载后仍可读取）
    pub fn headers(&self) -> PropertyMap {
        self.data.read().content.headers.clone()
    }

    /// 读取单个清单头
    pub fn header(&self, key: &str) -> Option<PropertyValue> {
        self.data.read().content.headers.get(key).cloned()
    }

    /// 符号名
    pub fn symbolic_name(&self) -> Option<String> {
        self.header(headers::SYMBOLIC_NAME).map(|v| v.to_string())
    }

    /// 版本号，缺省或无法解析时为 `0.0.0`
    pub fn version(&self) -> Version {
        parse_version(self.data.read().content.headers.get(headers::VERSION))
    }

    /// 声明的激活策略
    pub fn activation_policy(&self) -> ActivationPolicy {
        match self.header(headers::ACTIVATION_POLICY) {
            Some(v) if v.to_string().trim().eq_ignore_ascii_case("lazy") => ActivationPolicy::Lazy,
            _ => ActivationPolicy::Eager,
        }
    }

    /// 最后修改时间
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.data.read().last_modified
    }

    /// 是否被持久启动
    pub fn is_persistently_started(&self) -> bool {
        self.data.read().persistently_started
    }

    /// 是否正在等待延迟激活
    pub fn is_lazy_activation_pending(&self) -> bool {
        self.data.read().lazy_pending
    }

    pub(crate) fn set_state(&self, state: ModuleState) {
        self.data.write().state = state;
    }

    pub(crate) fn activator(&self) -> Option<Arc<dyn ActivationHook>> {
        self.data.read().content.activator.clone()
    }

    pub(crate) fn replace_content(&self, content: ModuleContent) {
        let mut data = self.data.write();
        data.content = content;
        data.last_modified = Utc::now();
    }

    pub(crate) fn touch(&self) {
        self.data.write().last_modified = Utc::now();
    }

    pub(crate) fn set_persistently_started(&self, started: bool) {
        self.data.write().persistently_started = started;
    }

    pub(crate) fn set_lazy_pending(&self, pending: bool) {
        self.data.write().lazy_pending = pending;
    }

    pub(crate) fn activation(&self) -> u64 {
        self.data.read().activation
    }

    /// 结束当前激活，之前创建的上下文随之失效
    pub(crate) fn end_activation(&self) {
        self.data.write().activation += 1;
    }

    /// 模块处于 STARTING/ACTIVE/STOPPING 且仍在 `activation` 这次激活中时返回 `Ok`，
    /// 否则返回当前状态
    pub(crate) fn check_activation(&self, activation: u64) -> std::result::Result<(), ModuleState> {
        let data = self.data.read();
        if data.state.is_live() && data.activation == activation {
            Ok(())
        } else {
            Err(data.state)
        }
    }

    pub(crate) fn state_lock(&self) -> &StateChangeLock {
        &self.lock
    }
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.symbolic_name() {
            Some(name) => write!(f, "{} [{}]", name, self.id),
            None => write!(f, "{} [{}]", self.location, self.id),
        }
    }
}
