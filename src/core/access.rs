//! 访问检查
//!
//! 可插拔的权限检查点。未配置检查器时一律放行。

use std::fmt;

use crate::module::ModuleRecord;
use crate::utils::{CoreError, Result};

/// 需要检查的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessAction {
    /// 安装模块，目标为模块位置
    Install,
    /// 启动、停止、更新、卸载模块，目标为模块位置
    Lifecycle,
    /// 注册服务，目标为服务类型名
    RegisterService,
    /// 获取服务，目标为服务类型名
    GetService,
    /// 添加监听器，目标为监听器类型
    AddListener,
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessAction::Install => "install",
            AccessAction::Lifecycle => "lifecycle",
            AccessAction::RegisterService => "register",
            AccessAction::GetService => "get",
            AccessAction::AddListener => "listen",
        };
        f.write_str(name)
    }
}

/// 检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// 允许
    Allow,
    /// 拒绝
    Deny,
}

/// 访问检查器
///
/// `requester` 为发起操作的模块；由宿主程序直接调用时为 `None`。
pub trait AccessChecker: Send + Sync {
    /// 检查一次访问
    fn check(&self, action: AccessAction, target: &str, requester: Option<&ModuleRecord>) -> AccessDecision;
}

impl<F> AccessChecker for F
where
    F: Fn(AccessAction, &str, Option<&ModuleRecord>) -> AccessDecision + Send + Sync,
{
    fn check(&self, action: AccessAction, target: &str, requester: Option<&ModuleRecord>) -> AccessDecision {
        self(action, target, requester)
    }
}

/// 对可选检查器执行检查，拒绝时返回 `CoreError::AccessDenied`
pub(crate) fn enforce(
    checker: Option<&dyn AccessChecker>,
    action: AccessAction,
    target: &str,
    requester: Option<&ModuleRecord>,
) -> Result<()> {
    match checker.map(|c| c.check(action, target, requester)) {
        Some(AccessDecision::Deny) => {
            log_denied(action, target, requester);
            Err(CoreError::AccessDenied {
                action: action.to_string(),
                target: target.to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// 记录一次被拒绝的访问
pub(crate) fn log_denied(action: AccessAction, target: &str, requester: Option<&ModuleRecord>) {
    tracing::warn!(
        action = %action,
        target = %target,
        requester = requester.map(|m| m.id()),
        "访问被拒绝"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_checker_allows() {
        assert!(enforce(None, AccessAction::Install, "file:a", None).is_ok());
    }

    #[test]
    fn test_closure_checker_denies() {
        let checker = |action: AccessAction, target: &str, _: Option<&ModuleRecord>| {
            if action == AccessAction::GetService && target == "secret.Vault" {
                AccessDecision::Deny
            } else {
                AccessDecision::Allow
            }
        };

        assert!(enforce(Some(&checker), AccessAction::GetService, "public.Api", None).is_ok());
        let err = enforce(Some(&checker), AccessAction::GetService, "secret.Vault", None).unwrap_err();
        assert!(matches!(err, CoreError::AccessDenied { .. }));
    }
}
