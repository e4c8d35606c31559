//! 属性表
//!
//! 模块清单头与服务注册属性共用的键值容器：
//! 键保留原始大小写，查找时大小写不敏感，按插入顺序枚举。

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::{CoreError, Result};

/// 属性值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// 布尔值
    Boolean(bool),
    /// 整数
    Integer(i64),
    /// 浮点数
    Float(f64),
    /// 字符串
    String(String),
    /// 多值
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// 字符串视图（非字符串返回 None）
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// 整数视图
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// 多值视图；标量视为单元素
    pub fn values(&self) -> Vec<&PropertyValue> {
        match self {
            PropertyValue::List(items) => items.iter().collect(),
            other => vec![other],
        }
    }

    /// 所有值的字符串形式
    pub fn to_strings(&self) -> Vec<String> {
        self.values().into_iter().map(|v| v.to_string()).collect()
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Boolean(b) => write!(f, "{}", b),
            PropertyValue::Integer(i) => write!(f, "{}", i),
            PropertyValue::Float(x) => write!(f, "{}", x),
            PropertyValue::String(s) => f.write_str(s),
            PropertyValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Integer(value as i64)
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        PropertyValue::Integer(value as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(values: Vec<T>) -> Self {
        PropertyValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// 大小写不敏感、保留原始大小写的有序属性表
///
/// 内部以小写键索引，值中保存原始键名。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap {
    entries: IndexMap<String, (String, PropertyValue)>,
}

impl PropertyMap {
    /// 创建空属性表
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入新键
    ///
    /// # Errors
    ///
    /// 已存在该键（含大小写变体）时返回 `CoreError::DuplicateProperty`
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Result<()> {
        let key = key.into();
        let folded = key.to_lowercase();
        if self.entries.contains_key(&folded) {
            return Err(CoreError::DuplicateProperty(key));
        }
        self.entries.insert(folded, (key, value.into()));
        Ok(())
    }

    /// 设置键值，已有同名键（忽略大小写）时覆盖其值并采用新的键名
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        let key = key.into();
        self.entries.insert(key.to_lowercase(), (key, value.into()));
    }

    /// 链式插入，便于构造测试数据与注册属性
    ///
    /// # Errors
    ///
    /// 同 [`PropertyMap::insert`]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Result<Self> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// 大小写不敏感查找
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(&key.to_lowercase()).map(|(_, v)| v)
    }

    /// 大小写敏感查找
    pub fn get_exact(&self, key: &str) -> Option<&PropertyValue> {
        self.entries
            .get(&key.to_lowercase())
            .filter(|(original, _)| original == key)
            .map(|(_, v)| v)
    }

    /// 取字符串值
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(PropertyValue::as_str)
    }

    /// 是否包含键（大小写不敏感）
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    /// 移除键，保持其余键的顺序
    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.entries.shift_remove(&key.to_lowercase()).map(|(_, v)| v)
    }

    /// 按插入顺序枚举原始键名
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(k, _)| k.as_str())
    }

    /// 按插入顺序枚举键值对
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v))
    }

    /// 条目数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for PropertyMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

impl<'de> Deserialize<'de> for PropertyMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = IndexMap::<String, PropertyValue>::deserialize(deserializer)?;
        let mut map = PropertyMap::new();
        for (key, value) in raw {
            map.insert(key, value).map_err(serde::de::Error::custom)?;
        }
        Ok(map)
    }
}
