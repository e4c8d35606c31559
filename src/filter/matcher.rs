//! 过滤器求值
//!
//! 纯函数求值：不修改属性源，可重复执行任意次。

use std::cmp::Ordering;
use std::collections::HashMap;

use super::parser::{CompareOp, FilterNode};
use crate::core::{PropertyMap, PropertyValue};

/// 可供过滤器求值的键值来源
pub trait PropertySource {
    /// 查找属性，`case_sensitive` 为 false 时忽略键的大小写
    fn lookup(&self, key: &str, case_sensitive: bool) -> Option<&PropertyValue>;
}

impl PropertySource for PropertyMap {
    fn lookup(&self, key: &str, case_sensitive: bool) -> Option<&PropertyValue> {
        if case_sensitive {
            self.get_exact(key)
        } else {
            self.get(key)
        }
    }
}

impl PropertySource for HashMap<String, PropertyValue> {
    fn lookup(&self, key: &str, case_sensitive: bool) -> Option<&PropertyValue> {
        if case_sensitive {
            return self.get(key);
        }
        self.get(key).or_else(|| {
            self.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }
}

pub(crate) fn evaluate(node: &FilterNode, source: &dyn PropertySource, case_sensitive: bool) -> bool {
    match node {
        FilterNode::And(children) => children.iter().all(|c| evaluate(c, source, case_sensitive)),
        FilterNode::Or(children) => children.iter().any(|c| evaluate(c, source, case_sensitive)),
        FilterNode::Not(child) => !evaluate(child, source, case_sensitive),
        FilterNode::Present(attr) => source.lookup(attr, case_sensitive).is_some(),
        FilterNode::Compare { attr, op, value } => source
            .lookup(attr, case_sensitive)
            .map(|actual| compare_value(actual, *op, value))
            .unwrap_or(false),
        FilterNode::Substring {
            attr,
            initial,
            any,
            last,
        } => source
            .lookup(attr, case_sensitive)
            .map(|actual| {
                actual.values().into_iter().any(|v| {
                    matches_substring(&v.to_string(), initial.as_deref(), any, last.as_deref())
                })
            })
            .unwrap_or(false),
    }
}

fn compare_value(actual: &PropertyValue, op: CompareOp, literal: &str) -> bool {
    match actual {
        PropertyValue::List(items) => items.iter().any(|item| compare_value(item, op, literal)),
        PropertyValue::String(s) => compare_string(s, op, literal),
        PropertyValue::Integer(i) => match literal.trim().parse::<i64>() {
            Ok(n) => compare_ordered(i.cmp(&n), op),
            Err(_) => compare_lexical(&i.to_string(), op, literal),
        },
        PropertyValue::Float(x) => match literal.trim().parse::<f64>() {
            Ok(n) => x
                .partial_cmp(&n)
                .map(|ord| compare_ordered(ord, op))
                .unwrap_or(false),
            Err(_) => compare_lexical(&x.to_string(), op, literal),
        },
        PropertyValue::Boolean(b) => match op {
            CompareOp::Equal | CompareOp::Approx => literal
                .trim()
                .parse::<bool>()
                .or_else(|_| literal.trim().to_lowercase().parse::<bool>())
                .map(|parsed| parsed == *b)
                .unwrap_or(false),
            CompareOp::GreaterEq | CompareOp::LessEq => false,
        },
    }
}

fn compare_string(actual: &str, op: CompareOp, literal: &str) -> bool {
    match op {
        CompareOp::Equal => actual == literal,
        CompareOp::Approx => normalize_approx(actual) == normalize_approx(literal),
        CompareOp::GreaterEq | CompareOp::LessEq => {
            // 两侧都能解析为同类数字时按数值比较，否则按字典序
            if let (Ok(a), Ok(b)) = (actual.trim().parse::<i64>(), literal.trim().parse::<i64>()) {
                return compare_ordered(a.cmp(&b), op);
            }
            if let (Ok(a), Ok(b)) = (actual.trim().parse::<f64>(), literal.trim().parse::<f64>()) {
                return a
                    .partial_cmp(&b)
                    .map(|ord| compare_ordered(ord, op))
                    .unwrap_or(false);
            }
            compare_lexical(actual, op, literal)
        }
    }
}

fn compare_lexical(actual: &str, op: CompareOp, literal: &str) -> bool {
    match op {
        CompareOp::Approx => normalize_approx(actual) == normalize_approx(literal),
        _ => compare_ordered(actual.cmp(literal), op),
    }
}

fn compare_ordered(ord: Ordering, op: CompareOp) -> bool {
    match op {
        CompareOp::Equal | CompareOp::Approx => ord == Ordering::Equal,
        CompareOp::GreaterEq => ord != Ordering::Less,
        CompareOp::LessEq => ord != Ordering::Greater,
    }
}

/// 近似匹配归一化：折叠空白并转为小写
fn normalize_approx(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn matches_substring(value: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let mut rest = value;

    if let Some(prefix) = initial {
        match rest.strip_prefix(prefix) {
            Some(r) => rest = r,
            None => return false,
        }
    }

    if let Some(suffix) = last {
        match rest.strip_suffix(suffix) {
            Some(r) => rest = r,
            None => return false,
        }
    }

    for part in any {
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }

    true
}
