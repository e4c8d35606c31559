//! 模块依赖解析
//!
//! 注册中心把依赖满足性判断委托给 [`Resolver`]。默认实现
//! [`HeaderResolver`] 读取 `Require-Module` 头：
//!
//! ```text
//! Require-Module: com.acme.http; version=^1.2, com.acme.log
//! ```
//!
//! 每个依赖项必须由一个已安装（未卸载）且版本匹配的模块提供，
//! 并且该模块自身的依赖也可满足。循环依赖视为可满足。

use std::collections::HashSet;

use semver::VersionReq;
use tracing::debug;

use super::metadata::{headers, ModuleHandle, ModuleRecord, ModuleState};

/// 依赖解析器
pub trait Resolver: Send + Sync {
    /// 判断模块依赖是否可满足，失败时返回缺失的依赖描述
    fn resolve(&self, module: &ModuleRecord, installed: &[ModuleHandle]) -> Result<(), String>;
}

impl<F> Resolver for F
where
    F: Fn(&ModuleRecord, &[ModuleHandle]) -> Result<(), String> + Send + Sync,
{
    fn resolve(&self, module: &ModuleRecord, installed: &[ModuleHandle]) -> Result<(), String> {
        self(module, installed)
    }
}

/// 单个依赖声明
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    /// 依赖模块的符号名
    pub symbolic_name: String,
    /// 版本要求，缺省为任意版本
    pub version: VersionReq,
    /// 原始声明文本
    pub raw: String,
}

impl Requirement {
    /// 解析 `name; version=<req>` 形式的单个依赖
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let mut parts = raw.split(';').map(str::trim);
        let symbolic_name = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("依赖声明缺少模块名: '{}'", raw))?
            .to_string();

        let mut version = VersionReq::STAR;
        for attr in parts {
            if let Some((key, value)) = attr.split_once('=') {
                if key.trim().eq_ignore_ascii_case("version") {
                    let value = value.trim().trim_matches('"');
                    version = VersionReq::parse(value)
                        .map_err(|e| format!("依赖 '{}' 的版本要求 '{}' 无效: {}", symbolic_name, value, e))?;
                }
            }
        }

        Ok(Self {
            symbolic_name,
            version,
            raw: raw.to_string(),
        })
    }

    fn is_satisfied_by(&self, candidate: &ModuleRecord) -> bool {
        candidate.symbolic_name().as_deref() == Some(self.symbolic_name.as_str())
            && self.version.matches(&candidate.version())
    }
}

/// 从清单头读取依赖列表
pub fn requirements_of(module: &ModuleRecord) -> Result<Vec<Requirement>, String> {
    let Some(value) = module.header(headers::REQUIRE_MODULE) else {
        return Ok(Vec::new());
    };

    let mut requirements = Vec::new();
    for entry in value.to_strings() {
        for raw in entry.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            requirements.push(Requirement::parse(raw)?);
        }
    }
    Ok(requirements)
}

/// 基于 `Require-Module` 头的默认解析器
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderResolver;

impl HeaderResolver {
    fn resolve_recursive(
        &self,
        module: &ModuleRecord,
        installed: &[ModuleHandle],
        visiting: &mut HashSet<u64>,
    ) -> Result<(), String> {
        if !visiting.insert(module.id()) {
            return Ok(());
        }

        for requirement in requirements_of(module)? {
            let provider = installed
                .iter()
                .filter(|m| m.id() != module.id() && m.state() != ModuleState::Uninstalled)
                .filter(|m| requirement.is_satisfied_by(m))
                .max_by(|a, b| a.version().cmp(&b.version()).then(b.id().cmp(&a.id())));

            match provider {
                Some(provider) => {
                    debug!(
                        module_id = module.id(),
                        provider_id = provider.id(),
                        requirement = %requirement.raw,
                        "依赖已匹配"
                    );
                    self.resolve_recursive(provider, installed, visiting)?;
                }
                None => return Err(requirement.raw),
            }
        }

        Ok(())
    }
}

impl Resolver for HeaderResolver {
    fn resolve(&self, module: &ModuleRecord, installed: &[ModuleHandle]) -> Result<(), String> {
        let mut visiting = HashSet::new();
        self.resolve_recursive(module, installed, &mut visiting)
    }
}
