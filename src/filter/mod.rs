//! 过滤器模块
//!
//! LDAP 风格的布尔过滤器表达式，用于服务查找和服务监听器筛选。
//!
//! ```
//! use chips_registry::{Filter, PropertyMap};
//!
//! let filter = Filter::parse("(&(objectClass=com.acme.Greeter)(lang=zh*))").unwrap();
//! let props = PropertyMap::new()
//!     .with("objectClass", vec!["com.acme.Greeter"]).unwrap()
//!     .with("lang", "zh-CN").unwrap();
//! assert!(filter.matches(&props));
//! ```

pub mod matcher;
pub mod parser;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

pub use matcher::PropertySource;
pub use parser::{CompareOp, FilterNode};

use crate::utils::{CoreError, Result};

/// 已解析的过滤器
///
/// 不可变；相等性与哈希基于规范化字符串形式。
#[derive(Debug, Clone)]
pub struct Filter {
    root: FilterNode,
    canonical: String,
}

impl Filter {
    /// 解析过滤器字符串
    ///
    /// # Errors
    ///
    /// 语法错误时返回 `CoreError::FilterSyntax`，其中 `position` 为出错的字符下标
    pub fn parse(input: &str) -> Result<Self> {
        let root = parser::Parser::new(input).parse()?;
        let mut canonical = String::with_capacity(input.len());
        write_node(&root, &mut canonical);
        Ok(Self { root, canonical })
    }

    /// 语法树根节点
    pub fn root(&self) -> &FilterNode {
        &self.root
    }

    /// 大小写不敏感匹配
    pub fn matches(&self, source: &dyn PropertySource) -> bool {
        matcher::evaluate(&self.root, source, false)
    }

    /// 大小写敏感匹配
    pub fn matches_case_sensitive(&self, source: &dyn PropertySource) -> bool {
        matcher::evaluate(&self.root, source, true)
    }

    /// 规范化字符串
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for Filter {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Filter {}

impl Hash for Filter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

fn write_node(node: &FilterNode, out: &mut String) {
    out.push('(');
    match node {
        FilterNode::And(children) | FilterNode::Or(children) => {
            out.push(if matches!(node, FilterNode::And(_)) { '&' } else { '|' });
            for child in children {
                write_node(child, out);
            }
        }
        FilterNode::Not(child) => {
            out.push('!');
            write_node(child, out);
        }
        FilterNode::Compare { attr, op, value } => {
            out.push_str(attr);
            out.push_str(op.symbol());
            escape_into(value, out);
        }
        FilterNode::Present(attr) => {
            out.push_str(attr);
            out.push_str("=*");
        }
        FilterNode::Substring {
            attr,
            initial,
            any,
            last,
        } => {
            out.push_str(attr);
            out.push('=');
            if let Some(initial) = initial {
                escape_into(initial, out);
            }
            out.push('*');
            for part in any {
                escape_into(part, out);
                out.push('*');
            }
            if let Some(last) = last {
                escape_into(last, out);
            }
        }
    }
    out.push(')');
}

fn escape_into(value: &str, out: &mut String) {
    for c in value.chars() {
        if matches!(c, '\\' | '*' | '(' | ')') {
            out.push('\\');
        }
        out.push(c);
    }
}
