//! The constants pool shared by all rules.
//!
//! Bytecode refers to literals, character classes, expectations and user
//! functions by their index in this pool. Every entry is keyed by its
//! rendered TypeScript text: adding an equal constant twice returns the
//! first index, and an index never changes once assigned.

use crate::ast::ClassPart;
use crate::runtime::Expectation;
use indexmap::IndexMap;
use std::fmt::Write;

/// Whether a function constant is an action or a semantic predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Action,
    Predicate,
}

/// A typed user function: `function(a: string, b: number):T { code }`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FunctionConst {
    pub kind: FunctionKind,
    /// Label name and TypeScript type, in label order
    pub params: Vec<(String, String)>,
    pub return_type: String,
    /// User code, copied verbatim
    pub code: String,
}

impl FunctionConst {
    pub fn render(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(name, ty)| format!("{}: {}", name, ty))
            .collect();
        format!(
            "function({}):{} {{{}}}",
            params.join(", "),
            self.return_type,
            self.code
        )
    }
}

/// One pool entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Const {
    /// A string value (already lowercased for case-insensitive matches)
    Literal(String),
    /// A character class compiled to an anchored regular expression
    Class {
        parts: Vec<ClassPart>,
        inverted: bool,
        ignore_case: bool,
    },
    Expectation(Expectation),
    Function(FunctionConst),
}

impl Const {
    /// TypeScript source text of this constant.
    pub fn render(&self) -> String {
        match self {
            Const::Literal(value) => format!("\"{}\"", string_escape(value)),
            Const::Class {
                parts,
                inverted,
                ignore_case,
            } => render_class_regexp(parts, *inverted, *ignore_case),
            Const::Expectation(e) => render_expectation(e),
            Const::Function(f) => f.render(),
        }
    }

    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Const::Literal(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionConst> {
        match self {
            Const::Function(f) => Some(f),
            _ => None,
        }
    }
}

/// Append-only, deduplicated constants table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstPool {
    entries: IndexMap<String, Const>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constant and return its index.
    pub fn add(&mut self, value: Const) -> usize {
        let entry = self.entries.entry(value.render());
        let index = entry.index();
        entry.or_insert(value);
        index
    }

    pub fn add_literal(&mut self, value: impl Into<String>) -> usize {
        self.add(Const::Literal(value.into()))
    }

    pub fn add_expectation(&mut self, expectation: Expectation) -> usize {
        self.add(Const::Expectation(expectation))
    }

    pub fn add_function(&mut self, function: FunctionConst) -> usize {
        self.add(Const::Function(function))
    }

    pub fn get(&self, index: usize) -> Option<&Const> {
        self.entries.get_index(index).map(|(_, c)| c)
    }

    /// Rendered text of the constant at `index`.
    pub fn text(&self, index: usize) -> Option<&str> {
        self.entries.get_index(index).map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Const> {
        self.entries.values()
    }

    /// Rendered texts, in index order.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

fn render_class_regexp(parts: &[ClassPart], inverted: bool, ignore_case: bool) -> String {
    let mut out = String::new();
    if parts.is_empty() {
        out.push_str(if inverted { "/^[\\S\\s]/" } else { "/^(?!)/" });
    } else {
        out.push_str("/^[");
        if inverted {
            out.push('^');
        }
        for part in parts {
            match *part {
                ClassPart::Single(c) => out.push_str(&regexp_class_escape(&c.to_string())),
                ClassPart::Range(lo, hi) => {
                    out.push_str(&regexp_class_escape(&lo.to_string()));
                    out.push('-');
                    out.push_str(&regexp_class_escape(&hi.to_string()));
                }
            }
        }
        out.push_str("]/");
    }
    if ignore_case {
        out.push('i');
    }
    out
}

fn render_expectation(expectation: &Expectation) -> String {
    match expectation {
        Expectation::Literal { text, ignore_case } => format!(
            "peg$literalExpectation(\"{}\", {})",
            string_escape(text),
            ignore_case
        ),
        Expectation::Class {
            parts,
            inverted,
            ignore_case,
        } => {
            let parts: Vec<String> = parts
                .iter()
                .map(|part| match *part {
                    ClassPart::Single(c) => format!("\"{}\"", string_escape(&c.to_string())),
                    ClassPart::Range(lo, hi) => format!(
                        "[\"{}\", \"{}\"]",
                        string_escape(&lo.to_string()),
                        string_escape(&hi.to_string())
                    ),
                })
                .collect();
            format!(
                "peg$classExpectation([{}], {}, {})",
                parts.join(", "),
                inverted,
                ignore_case
            )
        }
        Expectation::Any => "peg$anyExpectation()".to_string(),
        Expectation::End => "peg$endExpectation()".to_string(),
        Expectation::Other { description } => {
            format!("peg$otherExpectation(\"{}\")", string_escape(description))
        }
    }
}

fn escape_unit(out: &mut String, unit: u16, class: bool) {
    match unit {
        0x5C => out.push_str("\\\\"),
        0x22 if !class => out.push_str("\\\""),
        0x2F | 0x5D | 0x5E | 0x2D if class => {
            out.push('\\');
            out.push(unit as u8 as char);
        }
        0x00 => out.push_str("\\0"),
        0x08 => out.push_str("\\b"),
        0x09 => out.push_str("\\t"),
        0x0A => out.push_str("\\n"),
        0x0B => out.push_str("\\v"),
        0x0C => out.push_str("\\f"),
        0x0D => out.push_str("\\r"),
        0x01..=0x0F => write!(out, "\\x0{:X}", unit).unwrap(),
        0x10..=0x1F | 0x7F..=0xFF => write!(out, "\\x{:X}", unit).unwrap(),
        0x100..=0xFFF => write!(out, "\\u0{:X}", unit).unwrap(),
        0x1000..=0xFFFF => write!(out, "\\u{:X}", unit).unwrap(),
        _ => out.push(unit as u8 as char),
    }
}

/// Escape `s` for use inside a double-quoted JavaScript string.
///
/// Works on UTF-16 code units, so characters outside the BMP come out as
/// escaped surrogate pairs.
pub fn string_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for unit in s.encode_utf16() {
        escape_unit(&mut out, unit, false);
    }
    out
}

/// Escape `s` for use inside a regular expression character class.
pub fn regexp_class_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for unit in s.encode_utf16() {
        escape_unit(&mut out, unit, true);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_first_index() {
        let mut pool = ConstPool::new();
        let a = pool.add_literal("a");
        let b = pool.add_literal("b");
        assert_eq!(pool.add_literal("a"), a);
        assert_eq!((a, b), (0, 1));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.text(0), Some("\"a\""));
    }

    #[test]
    fn test_render_class() {
        let c = Const::Class {
            parts: vec![ClassPart::Range('a', 'z'), ClassPart::Single('-')],
            inverted: true,
            ignore_case: true,
        };
        assert_eq!(c.render(), "/^[^a-z\\-]/i");
        let empty = Const::Class {
            parts: vec![],
            inverted: false,
            ignore_case: false,
        };
        assert_eq!(empty.render(), "/^(?!)/");
    }

    #[test]
    fn test_render_expectations() {
        let lit = Const::Expectation(Expectation::literal("a\"b", false));
        assert_eq!(lit.render(), "peg$literalExpectation(\"a\\\"b\", false)");
        let class = Const::Expectation(Expectation::Class {
            parts: vec![ClassPart::Range('0', '9'), ClassPart::Single('x')],
            inverted: false,
            ignore_case: false,
        });
        assert_eq!(
            class.render(),
            "peg$classExpectation([[\"0\", \"9\"], \"x\"], false, false)"
        );
        assert_eq!(
            Const::Expectation(Expectation::Any).render(),
            "peg$anyExpectation()"
        );
    }

    #[test]
    fn test_render_typed_function() {
        let f = FunctionConst {
            kind: FunctionKind::Action,
            params: vec![
                ("a".to_string(), "string".to_string()),
                ("b".to_string(), "number".to_string()),
            ],
            return_type: "CustomType".to_string(),
            code: " code1 ".to_string(),
        };
        assert_eq!(f.render(), "function(a: string, b: number):CustomType { code1 }");
    }

    #[test]
    fn test_string_escape() {
        assert_eq!(string_escape("a\\b\n\u{1}\u{7f}"), "a\\\\b\\n\\x01\\x7F");
        assert_eq!(string_escape("\u{e9}\u{2028}"), "\\xE9\\u2028");
        assert_eq!(string_escape("\u{1F600}"), "\\uD83D\\uDE00");
        assert_eq!(regexp_class_escape("]^/"), "\\]\\^\\/");
    }
}
