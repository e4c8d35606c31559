//! 模块内容加载器
//!
//! 把安装位置或字节流转换为清单头与激活钩子。注册中心只通过
//! [`ContentLoader`] 访问模块内容；默认实现 [`ManifestLoader`] 读取
//! YAML 形式的清单：
//!
//! ```yaml
//! Module-SymbolicName: com.acme.greeter
//! Module-Version: 1.0.0
//! Module-Activator: greeter
//! Require-Module: com.acme.log; version=^1
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_yaml::Value;
use tracing::{debug, warn};

use super::activator::ActivationHook;
use super::metadata::{headers, ModuleContent};
use crate::core::{PropertyMap, PropertyValue};
use crate::utils::{CoreError, Result};

/// 模块内容加载器
pub trait ContentLoader: Send + Sync {
    /// 按位置打开内容流（更新或安装时未提供内容时调用）
    fn open(&self, location: &str) -> Result<Box<dyn Read + Send>>;

    /// 从内容流解析模块内容
    fn load(&self, location: &str, reader: &mut dyn Read) -> Result<ModuleContent>;
}

/// 激活器构造函数
pub type ActivatorFactory = Arc<dyn Fn() -> Arc<dyn ActivationHook> + Send + Sync>;

/// YAML 清单加载器
///
/// `Module-Activator` 头按名称在已登记的激活器表中查找。
#[derive(Default)]
pub struct ManifestLoader {
    activators: RwLock<HashMap<String, ActivatorFactory>>,
}

impl ManifestLoader {
    /// 创建加载器
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记激活器，每次加载都会调用构造函数生成新实例
    pub fn register_activator<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn ActivationHook> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(activator = %name, "登记激活器");
        self.activators.write().insert(name, Arc::new(factory));
    }

    /// 链式登记激活器
    pub fn with_activator<F>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn ActivationHook> + Send + Sync + 'static,
    {
        self.register_activator(name, factory);
        self
    }

    /// 解析清单文本
    pub fn parse_manifest(location: &str, text: &str) -> Result<PropertyMap> {
        let content_error = |reason: String| CoreError::ContentRead {
            location: location.to_string(),
            reason,
        };

        let value: Value =
            serde_yaml::from_str(text).map_err(|e| content_error(format!("清单格式无效: {}", e)))?;

        let mapping = match value {
            Value::Mapping(mapping) => mapping,
            Value::Null => return Ok(PropertyMap::new()),
            _ => return Err(content_error("清单必须是键值映射".to_string())),
        };

        let mut headers = PropertyMap::new();
        for (key, value) in mapping {
            let key = match key {
                Value::String(s) => s,
                other => return Err(content_error(format!("清单头名称必须是字符串: {:?}", other))),
            };
            headers
                .insert(key, convert_value(value))
                .map_err(|e| content_error(e.to_string()))?;
        }
        Ok(headers)
    }
}

impl ContentLoader for ManifestLoader {
    fn open(&self, location: &str) -> Result<Box<dyn Read + Send>> {
        let path = location.strip_prefix("file:").unwrap_or(location);
        File::open(Path::new(path))
            .map(|f| Box::new(f) as Box<dyn Read + Send>)
            .map_err(|e| CoreError::ContentRead {
                location: location.to_string(),
                reason: e.to_string(),
            })
    }

    fn load(&self, location: &str, reader: &mut dyn Read) -> Result<ModuleContent> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| CoreError::ContentRead {
                location: location.to_string(),
                reason: e.to_string(),
            })?;

        let headers = Self::parse_manifest(location, &text)?;

        let activator = match headers.get(headers::ACTIVATOR) {
            Some(name) => {
                let name = name.to_string();
                let factory = self.activators.read().get(&name).cloned();
                match factory {
                    Some(factory) => Some(factory()),
                    None => {
                        warn!(location = %location, activator = %name, "激活器未登记");
                        return Err(CoreError::ContentRead {
                            location: location.to_string(),
                            reason: format!("未登记的激活器 '{}'", name),
                        });
                    }
                }
            }
            None => None,
        };

        Ok(ModuleContent { headers, activator })
    }
}

fn convert_value(value: Value) -> PropertyValue {
    match value {
        Value::Bool(b) => PropertyValue::Boolean(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => PropertyValue::Integer(i),
            None => PropertyValue::Float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => PropertyValue::String(s),
        Value::Sequence(items) => PropertyValue::List(items.into_iter().map(convert_value).collect()),
        Value::Null => PropertyValue::String(String::new()),
        other => PropertyValue::String(serde_yaml::to_string(&other).unwrap_or_default().trim().to_string()),
    }
}
