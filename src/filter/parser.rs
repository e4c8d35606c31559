//! 过滤器解析器
//!
//! 递归下降解析 LDAP 风格过滤器字符串：
//!
//! ```text
//! filter     ::= '(' filtercomp ')'
//! filtercomp ::= and | or | not | item
//! and        ::= '&' filterlist
//! or         ::= '|' filterlist
//! not        ::= '!' filter
//! item       ::= attr ('=' | '~=' | '>=' | '<=') value | attr '=*'
//! ```
//!
//! 值中的 `*`、`(`、`)`、`\` 需要用 `\` 转义；错误位置以字符下标计。

use crate::utils::{CoreError, Result};

/// 比较操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `=`
    Equal,
    /// `~=`
    Approx,
    /// `>=`
    GreaterEq,
    /// `<=`
    LessEq,
}

impl CompareOp {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            CompareOp::Equal => "=",
            CompareOp::Approx => "~=",
            CompareOp::GreaterEq => ">=",
            CompareOp::LessEq => "<=",
        }
    }
}

/// 过滤器语法树节点
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterNode {
    /// 合取
    And(Vec<FilterNode>),
    /// 析取
    Or(Vec<FilterNode>),
    /// 取反
    Not(Box<FilterNode>),
    /// 属性与字面值比较
    Compare {
        attr: String,
        op: CompareOp,
        value: String,
    },
    /// 存在性测试 `attr=*`
    Present(String),
    /// 通配匹配，`initial*any*...*final`
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
}

/// 值中的一段：字面文本或未转义的 `*`
enum ValuePart {
    Text(String),
    Wildcard,
}

pub(crate) struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    pub(crate) fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    /// 解析完整输入，结尾只允许空白
    pub(crate) fn parse(mut self) -> Result<FilterNode> {
        let node = self.parse_filter()?;
        self.skip_whitespace();
        if self.pos < self.chars.len() {
            return Err(self.error("过滤器结尾存在多余字符"));
        }
        Ok(node)
    }

    fn parse_filter(&mut self) -> Result<FilterNode> {
        self.skip_whitespace();
        self.expect('(')?;
        let node = self.parse_component()?;
        self.skip_whitespace();
        self.expect(')')?;
        Ok(node)
    }

    fn parse_component(&mut self) -> Result<FilterNode> {
        self.skip_whitespace();
        match self.peek() {
            Some('&') => {
                self.pos += 1;
                Ok(FilterNode::And(self.parse_list()?))
            }
            Some('|') => {
                self.pos += 1;
                Ok(FilterNode::Or(self.parse_list()?))
            }
            Some('!') => {
                self.pos += 1;
                Ok(FilterNode::Not(Box::new(self.parse_filter()?)))
            }
            Some(_) => self.parse_item(),
            None => Err(self.error("过滤器意外结束")),
        }
    }

    fn parse_list(&mut self) -> Result<Vec<FilterNode>> {
        let mut nodes = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() != Some('(') {
                break;
            }
            nodes.push(self.parse_filter()?);
        }
        if nodes.is_empty() {
            return Err(self.error("'&' 或 '|' 之后至少需要一个子过滤器"));
        }
        Ok(nodes)
    }

    fn parse_item(&mut self) -> Result<FilterNode> {
        let attr = self.parse_attr()?;
        let op = self.parse_op()?;
        let value_start = self.pos;
        let parts = self.parse_value()?;

        let has_wildcard = parts.iter().any(|p| matches!(p, ValuePart::Wildcard));
        if !has_wildcard {
            let value = parts
                .into_iter()
                .map(|p| match p {
                    ValuePart::Text(t) => t,
                    ValuePart::Wildcard => String::new(),
                })
                .collect();
            return Ok(FilterNode::Compare { attr, op, value });
        }

        if op != CompareOp::Equal {
            return Err(CoreError::FilterSyntax {
                position: value_start,
                reason: format!("'{}' 的值中不允许未转义的 '*'", op.symbol()),
            });
        }

        if parts.len() == 1 {
            return Ok(FilterNode::Present(attr));
        }

        Ok(Self::substring(attr, parts))
    }

    fn substring(attr: String, parts: Vec<ValuePart>) -> FilterNode {
        // 以通配符切分为若干段：首段、中间段、末段
        let mut segments: Vec<String> = vec![String::new()];
        for part in parts {
            match part {
                ValuePart::Text(t) => {
                    if let Some(last) = segments.last_mut() {
                        last.push_str(&t);
                    }
                }
                ValuePart::Wildcard => segments.push(String::new()),
            }
        }

        let last = segments.pop().filter(|s| !s.is_empty());
        let mut rest = segments.into_iter();
        let initial = rest.next().filter(|s| !s.is_empty());
        let any: Vec<String> = rest.filter(|s| !s.is_empty()).collect();

        // `**` 等只含通配符的值等价于存在性测试
        if initial.is_none() && any.is_empty() && last.is_none() {
            return FilterNode::Present(attr);
        }

        FilterNode::Substring {
            attr,
            initial,
            any,
            last,
        }
    }

    fn parse_attr(&mut self) -> Result<String> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(c) = self.peek() {
            match c {
                '=' | '~' | '<' | '>' => break,
                '(' | ')' => return Err(self.error("属性名中不允许出现括号")),
                _ => self.pos += 1,
            }
        }
        let attr: String = self.chars[start..self.pos].iter().collect();
        let attr = attr.trim_end().to_string();
        if attr.is_empty() {
            return Err(CoreError::FilterSyntax {
                position: start,
                reason: "缺少属性名".to_string(),
            });
        }
        Ok(attr)
    }

    fn parse_op(&mut self) -> Result<CompareOp> {
        let op = match (self.peek(), self.peek_at(1)) {
            (Some('='), _) => {
                self.pos += 1;
                return Ok(CompareOp::Equal);
            }
            (Some('~'), Some('=')) => CompareOp::Approx,
            (Some('>'), Some('=')) => CompareOp::GreaterEq,
            (Some('<'), Some('=')) => CompareOp::LessEq,
            (None, _) => return Err(self.error("过滤器意外结束")),
            _ => return Err(self.error("无效的比较操作符")),
        };
        self.pos += 2;
        Ok(op)
    }

    fn parse_value(&mut self) -> Result<Vec<ValuePart>> {
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("值未以 ')' 结束")),
                Some(')') => break,
                Some('(') => return Err(self.error("值中存在未转义的 '('")),
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c) => {
                            text.push(c);
                            self.pos += 1;
                        }
                        None => return Err(self.error("转义符 '\\' 之后缺少字符")),
                    }
                }
                Some('*') => {
                    if !text.is_empty() {
                        parts.push(ValuePart::Text(std::mem::take(&mut text)));
                    }
                    parts.push(ValuePart::Wildcard);
                    self.pos += 1;
                }
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
        if !text.is_empty() || parts.is_empty() {
            parts.push(ValuePart::Text(text));
        }
        Ok(parts)
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(self.error(&format!("期望 '{}'，实际为 '{}'", expected, c))),
            None => Err(self.error(&format!("期望 '{}'，过滤器意外结束", expected))),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn error(&self, reason: &str) -> CoreError {
        CoreError::FilterSyntax {
            position: self.pos,
            reason: reason.to_string(),
        }
    }
}
