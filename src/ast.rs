//! Grammar IR handed over by the front-end.
//!
//! A grammar is an ordered list of rules, each rule a tree of match
//! expressions. The tree is immutable apart from the `inferred_type`
//! annotations written by the type inference pass.
//!
//! The serde representation follows the JSON AST produced by the front-end:
//! every expression is an object tagged by `type` (`"literal"`, `"rule_ref"`,
//! `"zero_or_more"`, ...) with camelCase field names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One part of a character class: a single character or an inclusive range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassPart {
    Single(char),
    Range(char, char),
}

impl ClassPart {
    /// Check whether `c` falls into this part (case-sensitive).
    pub fn contains(&self, c: char) -> bool {
        match *self {
            ClassPart::Single(x) => x == c,
            ClassPart::Range(lo, hi) => lo <= c && c <= hi,
        }
    }
}

/// A block of opaque user code.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub code: String,
}

impl CodeBlock {
    pub fn new(code: impl Into<String>) -> Self {
        CodeBlock { code: code.into() }
    }
}

/// The match-construct language.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExprKind {
    Literal {
        value: String,
        #[serde(rename = "ignoreCase", default)]
        ignore_case: bool,
    },
    #[serde(rename = "class")]
    CharClass {
        parts: Vec<ClassPart>,
        #[serde(default)]
        inverted: bool,
        #[serde(rename = "ignoreCase", default)]
        ignore_case: bool,
    },
    Any,
    Text {
        expression: Box<Expression>,
    },
    RuleRef {
        name: String,
    },
    Sequence {
        elements: Vec<Expression>,
    },
    Choice {
        alternatives: Vec<Expression>,
    },
    Labeled {
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        pick: bool,
        expression: Box<Expression>,
    },
    Named {
        name: String,
        expression: Box<Expression>,
    },
    Group {
        expression: Box<Expression>,
    },
    Optional {
        expression: Box<Expression>,
    },
    ZeroOrMore {
        expression: Box<Expression>,
    },
    OneOrMore {
        expression: Box<Expression>,
    },
    Repeated {
        expression: Box<Expression>,
        #[serde(default)]
        delimiter: Option<Box<Expression>>,
        #[serde(default)]
        min: u32,
        /// `None` means unbounded.
        #[serde(default)]
        max: Option<u32>,
    },
    SimpleAnd {
        expression: Box<Expression>,
    },
    SimpleNot {
        expression: Box<Expression>,
    },
    SemanticAnd {
        code: String,
    },
    SemanticNot {
        code: String,
    },
    Action {
        expression: Box<Expression>,
        code: String,
        #[serde(rename = "typeSpec", default, skip_serializing_if = "Option::is_none")]
        type_spec: Option<String>,
    },
}

/// An expression node together with its (eventually) inferred type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    #[serde(flatten)]
    pub kind: ExprKind,
    #[serde(rename = "inferredType", default, skip_serializing_if = "Option::is_none")]
    pub inferred_type: Option<String>,
}

impl From<ExprKind> for Expression {
    fn from(kind: ExprKind) -> Self {
        Expression {
            kind,
            inferred_type: None,
        }
    }
}

impl Expression {
    pub fn literal(value: impl Into<String>) -> Self {
        ExprKind::Literal {
            value: value.into(),
            ignore_case: false,
        }
        .into()
    }

    pub fn literal_ic(value: impl Into<String>) -> Self {
        ExprKind::Literal {
            value: value.into(),
            ignore_case: true,
        }
        .into()
    }

    pub fn class(parts: Vec<ClassPart>, inverted: bool, ignore_case: bool) -> Self {
        ExprKind::CharClass {
            parts,
            inverted,
            ignore_case,
        }
        .into()
    }

    pub fn any() -> Self {
        ExprKind::Any.into()
    }

    pub fn text(inner: Expression) -> Self {
        ExprKind::Text {
            expression: Box::new(inner),
        }
        .into()
    }

    pub fn rule_ref(name: impl Into<String>) -> Self {
        ExprKind::RuleRef { name: name.into() }.into()
    }

    pub fn sequence(elements: Vec<Expression>) -> Self {
        ExprKind::Sequence { elements }.into()
    }

    pub fn choice(alternatives: Vec<Expression>) -> Self {
        ExprKind::Choice { alternatives }.into()
    }

    pub fn labeled(label: impl Into<String>, inner: Expression) -> Self {
        ExprKind::Labeled {
            label: Some(label.into()),
            pick: false,
            expression: Box::new(inner),
        }
        .into()
    }

    /// A picked element (`@label:expr` or bare `@expr`).
    pub fn pick(label: Option<&str>, inner: Expression) -> Self {
        ExprKind::Labeled {
            label: label.map(str::to_string),
            pick: true,
            expression: Box::new(inner),
        }
        .into()
    }

    pub fn named(name: impl Into<String>, inner: Expression) -> Self {
        ExprKind::Named {
            name: name.into(),
            expression: Box::new(inner),
        }
        .into()
    }

    pub fn group(inner: Expression) -> Self {
        ExprKind::Group {
            expression: Box::new(inner),
        }
        .into()
    }

    pub fn optional(inner: Expression) -> Self {
        ExprKind::Optional {
            expression: Box::new(inner),
        }
        .into()
    }

    pub fn zero_or_more(inner: Expression) -> Self {
        ExprKind::ZeroOrMore {
            expression: Box::new(inner),
        }
        .into()
    }

    pub fn one_or_more(inner: Expression) -> Self {
        ExprKind::OneOrMore {
            expression: Box::new(inner),
        }
        .into()
    }

    pub fn repeated(
        inner: Expression,
        delimiter: Option<Expression>,
        min: u32,
        max: Option<u32>,
    ) -> Self {
        ExprKind::Repeated {
            expression: Box::new(inner),
            delimiter: delimiter.map(Box::new),
            min,
            max,
        }
        .into()
    }

    pub fn simple_and(inner: Expression) -> Self {
        ExprKind::SimpleAnd {
            expression: Box::new(inner),
        }
        .into()
    }

    pub fn simple_not(inner: Expression) -> Self {
        ExprKind::SimpleNot {
            expression: Box::new(inner),
        }
        .into()
    }

    pub fn semantic_and(code: impl Into<String>) -> Self {
        ExprKind::SemanticAnd { code: code.into() }.into()
    }

    pub fn semantic_not(code: impl Into<String>) -> Self {
        ExprKind::SemanticNot { code: code.into() }.into()
    }

    pub fn action(inner: Expression, code: impl Into<String>) -> Self {
        ExprKind::Action {
            expression: Box::new(inner),
            code: code.into(),
            type_spec: None,
        }
        .into()
    }

    /// An action with an explicit result type (`<Type>{ code }`).
    pub fn typed_action(
        inner: Expression,
        code: impl Into<String>,
        type_spec: impl Into<String>,
    ) -> Self {
        ExprKind::Action {
            expression: Box::new(inner),
            code: code.into(),
            type_spec: Some(type_spec.into()),
        }
        .into()
    }

    /// Direct children, in evaluation order.
    pub fn children(&self) -> Vec<&Expression> {
        match &self.kind {
            ExprKind::Literal { .. }
            | ExprKind::CharClass { .. }
            | ExprKind::Any
            | ExprKind::RuleRef { .. }
            | ExprKind::SemanticAnd { .. }
            | ExprKind::SemanticNot { .. } => Vec::new(),
            ExprKind::Sequence { elements } => elements.iter().collect(),
            ExprKind::Choice { alternatives } => alternatives.iter().collect(),
            ExprKind::Repeated {
                expression,
                delimiter,
                ..
            } => {
                let mut out = vec![expression.as_ref()];
                if let Some(d) = delimiter {
                    out.push(d.as_ref());
                }
                out
            }
            ExprKind::Text { expression }
            | ExprKind::Labeled { expression, .. }
            | ExprKind::Named { expression, .. }
            | ExprKind::Group { expression }
            | ExprKind::Optional { expression }
            | ExprKind::ZeroOrMore { expression }
            | ExprKind::OneOrMore { expression }
            | ExprKind::SimpleAnd { expression }
            | ExprKind::SimpleNot { expression }
            | ExprKind::Action { expression, .. } => vec![expression.as_ref()],
        }
    }

    /// Direct children, mutably, in evaluation order.
    pub fn children_mut(&mut self) -> Vec<&mut Expression> {
        match &mut self.kind {
            ExprKind::Literal { .. }
            | ExprKind::CharClass { .. }
            | ExprKind::Any
            | ExprKind::RuleRef { .. }
            | ExprKind::SemanticAnd { .. }
            | ExprKind::SemanticNot { .. } => Vec::new(),
            ExprKind::Sequence { elements } => elements.iter_mut().collect(),
            ExprKind::Choice { alternatives } => alternatives.iter_mut().collect(),
            ExprKind::Repeated {
                expression,
                delimiter,
                ..
            } => {
                let mut out = vec![expression.as_mut()];
                if let Some(d) = delimiter {
                    out.push(d.as_mut());
                }
                out
            }
            ExprKind::Text { expression }
            | ExprKind::Labeled { expression, .. }
            | ExprKind::Named { expression, .. }
            | ExprKind::Group { expression }
            | ExprKind::Optional { expression }
            | ExprKind::ZeroOrMore { expression }
            | ExprKind::OneOrMore { expression }
            | ExprKind::SimpleAnd { expression }
            | ExprKind::SimpleNot { expression }
            | ExprKind::Action { expression, .. } => vec![expression.as_mut()],
        }
    }

    /// Visit this node and every descendant, parents first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expression)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }

    /// Check whether every node of this subtree carries an inferred type.
    pub fn is_fully_typed(&self) -> bool {
        let mut typed = true;
        self.walk(&mut |e| typed &= e.inferred_type.is_some());
        typed
    }
}

/// A named production.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub expression: Expression,
    #[serde(rename = "typeSpec", default, skip_serializing_if = "Option::is_none")]
    pub type_spec: Option<String>,
    #[serde(rename = "inferredType", default, skip_serializing_if = "Option::is_none")]
    pub inferred_type: Option<String>,
}

impl Rule {
    pub fn new(name: impl Into<String>, expression: Expression) -> Self {
        Rule {
            name: name.into(),
            expression,
            type_spec: None,
            inferred_type: None,
        }
    }

    /// Create a rule with an explicit result type.
    pub fn typed(name: impl Into<String>, expression: Expression, type_spec: impl Into<String>) -> Self {
        Rule {
            type_spec: Some(type_spec.into()),
            ..Rule::new(name, expression)
        }
    }

    /// The type the user wrote for this rule, either on the rule itself or on
    /// the action making up its whole body.
    pub fn declared_type(&self) -> Option<&str> {
        if let Some(spec) = &self.type_spec {
            return Some(spec);
        }
        match &self.expression.kind {
            ExprKind::Action {
                type_spec: Some(spec),
                ..
            } => Some(spec),
            _ => None,
        }
    }
}

/// A whole grammar.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Grammar {
    pub rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<CodeBlock>,
    #[serde(
        rename = "topLevelInitializer",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub top_level_initializer: Option<CodeBlock>,
}

impl Grammar {
    pub fn new(rules: Vec<Rule>) -> Self {
        Grammar {
            rules,
            initializer: None,
            top_level_initializer: None,
        }
    }

    /// Parse the front-end's JSON AST.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_initializer(mut self, code: impl Into<String>) -> Self {
        self.initializer = Some(CodeBlock::new(code));
        self
    }

    pub fn with_top_level_initializer(mut self, code: impl Into<String>) -> Self {
        self.top_level_initializer = Some(CodeBlock::new(code));
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.name == name)
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }
}

fn fmt_class(
    f: &mut fmt::Formatter<'_>,
    parts: &[ClassPart],
    inverted: bool,
    ignore_case: bool,
) -> fmt::Result {
    write!(f, "[")?;
    if inverted {
        write!(f, "^")?;
    }
    for part in parts {
        match part {
            ClassPart::Single(c) => write!(f, "{}", c.escape_debug())?,
            ClassPart::Range(lo, hi) => write!(f, "{}-{}", lo.escape_debug(), hi.escape_debug())?,
        }
    }
    write!(f, "]")?;
    if ignore_case {
        write!(f, "i")?;
    }
    Ok(())
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Literal { value, ignore_case } => {
                write!(f, "{:?}", value)?;
                if *ignore_case {
                    write!(f, "i")?;
                }
                Ok(())
            }
            ExprKind::CharClass {
                parts,
                inverted,
                ignore_case,
            } => fmt_class(f, parts, *inverted, *ignore_case),
            ExprKind::Any => write!(f, "."),
            ExprKind::Text { expression } => write!(f, "$({})", expression),
            ExprKind::RuleRef { name } => write!(f, "{}", name),
            ExprKind::Sequence { elements } => {
                let parts: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
                write!(f, "{}", parts.join(" "))
            }
            ExprKind::Choice { alternatives } => {
                let parts: Vec<String> = alternatives.iter().map(|e| e.to_string()).collect();
                write!(f, "({})", parts.join(" / "))
            }
            ExprKind::Labeled {
                label,
                pick,
                expression,
            } => {
                if *pick {
                    write!(f, "@")?;
                }
                if let Some(label) = label {
                    write!(f, "{}:", label)?;
                }
                write!(f, "{}", expression)
            }
            ExprKind::Named { expression, .. } => write!(f, "{}", expression),
            ExprKind::Group { expression } => write!(f, "({})", expression),
            ExprKind::Optional { expression } => write!(f, "{}?", expression),
            ExprKind::ZeroOrMore { expression } => write!(f, "{}*", expression),
            ExprKind::OneOrMore { expression } => write!(f, "{}+", expression),
            ExprKind::Repeated {
                expression,
                delimiter,
                min,
                max,
            } => {
                write!(f, "{}|{}..", expression, min)?;
                if let Some(max) = max {
                    write!(f, "{}", max)?;
                }
                if let Some(d) = delimiter {
                    write!(f, ", {}", d)?;
                }
                write!(f, "|")
            }
            ExprKind::SimpleAnd { expression } => write!(f, "&{}", expression),
            ExprKind::SimpleNot { expression } => write!(f, "!{}", expression),
            ExprKind::SemanticAnd { code } => write!(f, "&{{{}}}", code),
            ExprKind::SemanticNot { code } => write!(f, "!{{{}}}", code),
            ExprKind::Action {
                expression,
                code,
                type_spec,
            } => {
                write!(f, "{} ", expression)?;
                if let Some(spec) = type_spec {
                    write!(f, "<{}>", spec)?;
                }
                write!(f, "{{{}}}", code)
            }
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.expression)
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.rules {
            writeln!(f, "{}", rule)?;
        }
        Ok(())
    }
}
