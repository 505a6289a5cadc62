//! Runtime support shared by every generated parser.
//!
//! The emitted TypeScript carries its own copy of this logic; the Rust
//! versions here are used by the reference [`Machine`](crate::machine::Machine)
//! and pin down the exact error message format:
//!
//! ```text
//!   Expected "(" or integer but "*" found.
//! ```
//!
//! Expectation descriptions are sorted, deduplicated and joined with
//! `" or "` (two items) or `", "` plus a final `", or "` (three or more).

use crate::ast::ClassPart;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Write;
use thiserror::Error;

/// Something the parser expected at the furthest failure position.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Expectation {
    Literal {
        text: String,
        #[serde(rename = "ignoreCase")]
        ignore_case: bool,
    },
    Class {
        parts: Vec<ClassPart>,
        inverted: bool,
        #[serde(rename = "ignoreCase")]
        ignore_case: bool,
    },
    Any,
    End,
    Other {
        description: String,
    },
}

impl Expectation {
    pub fn literal(text: impl Into<String>, ignore_case: bool) -> Self {
        Expectation::Literal {
            text: text.into(),
            ignore_case,
        }
    }

    pub fn class(parts: Vec<ClassPart>, inverted: bool, ignore_case: bool) -> Self {
        Expectation::Class {
            parts,
            inverted,
            ignore_case,
        }
    }

    pub fn other(description: impl Into<String>) -> Self {
        Expectation::Other {
            description: description.into(),
        }
    }

    /// Human-readable description used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Expectation::Literal { text, .. } => format!("\"{}\"", literal_escape(text)),
            Expectation::Class {
                parts, inverted, ..
            } => {
                let mut out = String::from("[");
                if *inverted {
                    out.push('^');
                }
                for part in parts {
                    match *part {
                        ClassPart::Single(c) => out.push_str(&class_escape(&c.to_string())),
                        ClassPart::Range(lo, hi) => {
                            out.push_str(&class_escape(&lo.to_string()));
                            out.push('-');
                            out.push_str(&class_escape(&hi.to_string()));
                        }
                    }
                }
                out.push(']');
                out
            }
            Expectation::Any => "any character".to_string(),
            Expectation::End => "end of input".to_string(),
            Expectation::Other { description } => description.clone(),
        }
    }
}

fn escape_char(out: &mut String, c: char, class: bool) {
    match c {
        '\\' => out.push_str("\\\\"),
        '"' if !class => out.push_str("\\\""),
        ']' | '^' | '-' if class => {
            out.push('\\');
            out.push(c);
        }
        '\0' => out.push_str("\\0"),
        '\t' => out.push_str("\\t"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\u{01}'..='\u{0F}' => write!(out, "\\x0{:X}", c as u32).unwrap(),
        '\u{10}'..='\u{1F}' | '\u{7F}'..='\u{9F}' => write!(out, "\\x{:X}", c as u32).unwrap(),
        _ => out.push(c),
    }
}

/// Escape a literal for display inside double quotes.
pub fn literal_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        escape_char(&mut out, c, false);
    }
    out
}

/// Escape one side of a class part for display inside brackets.
pub fn class_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        escape_char(&mut out, c, true);
    }
    out
}

fn utf16_cmp(a: &str, b: &str) -> Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

/// Describe a set of expectations: sorted, deduplicated, joined.
pub fn describe_expected(expected: &[Expectation]) -> String {
    let mut descriptions: Vec<String> = expected.iter().map(Expectation::describe).collect();
    descriptions.sort_by(|a, b| utf16_cmp(a, b));
    descriptions.dedup();

    match descriptions.len() {
        0 => String::new(),
        1 => descriptions.remove(0),
        2 => format!("{} or {}", descriptions[0], descriptions[1]),
        n => format!(
            "{}, or {}",
            descriptions[..n - 1].join(", "),
            descriptions[n - 1]
        ),
    }
}

/// Describe the input found at the failure position.
pub fn describe_found(found: Option<&str>) -> String {
    match found {
        Some(s) if !s.is_empty() => format!("\"{}\"", literal_escape(s)),
        _ => "end of input".to_string(),
    }
}

/// Build the message of a structured syntax error.
pub fn build_message(expected: &[Expectation], found: Option<&str>) -> String {
    format!(
        "Expected {} but {} found.",
        describe_expected(expected),
        describe_found(found)
    )
}

/// A position in the input, with 1-based line and column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePosition {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

/// A span of the input.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub start: FilePosition,
    pub end: FilePosition,
}

/// Line/column computation with an incremental cache.
///
/// Offsets count UTF-16 code units, like the emitted parser. A lookup
/// resumes scanning from the nearest cached position before the requested
/// one.
#[derive(Clone, Debug)]
pub struct PositionTracker {
    units: Vec<u16>,
    source: Option<String>,
    cache: BTreeMap<usize, (usize, usize)>,
}

impl PositionTracker {
    pub fn new(input: &str) -> Self {
        Self::from_units(input.encode_utf16().collect())
    }

    pub fn from_units(units: Vec<u16>) -> Self {
        let mut cache = BTreeMap::new();
        cache.insert(0, (1, 1));
        PositionTracker {
            units,
            source: None,
            cache,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Line and column of `pos`.
    pub fn details(&mut self, pos: usize) -> (usize, usize) {
        if let Some(&details) = self.cache.get(&pos) {
            return details;
        }
        let (mut p, (mut line, mut column)) = self
            .cache
            .range(..pos)
            .next_back()
            .map(|(&p, &d)| (p, d))
            .unwrap_or((0, (1, 1)));
        while p < pos {
            if self.units.get(p) == Some(&10) {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
            p += 1;
        }
        self.cache.insert(pos, (line, column));
        (line, column)
    }

    pub fn position(&mut self, offset: usize) -> FilePosition {
        let (line, column) = self.details(offset);
        FilePosition {
            offset,
            line,
            column,
        }
    }

    pub fn location(&mut self, start: usize, end: usize) -> FileRange {
        FileRange {
            source: self.source.clone(),
            start: self.position(start),
            end: self.position(end),
        }
    }

    /// Number of cached positions.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

/// A syntax error produced by a generated parser.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ParseSyntaxError {
    pub message: String,
    pub expected: Vec<Expectation>,
    pub found: Option<String>,
    pub location: FileRange,
}

impl ParseSyntaxError {
    /// An error built from the expectations at the furthest failure.
    pub fn structured(expected: Vec<Expectation>, found: Option<String>, location: FileRange) -> Self {
        ParseSyntaxError {
            message: build_message(&expected, found.as_deref()),
            expected,
            found,
            location,
        }
    }

    /// An error with a user-supplied message.
    pub fn simple(message: impl Into<String>, location: FileRange) -> Self {
        ParseSyntaxError {
            message: message.into(),
            expected: Vec::new(),
            found: Some(String::new()),
            location,
        }
    }

    /// Render the error with an excerpt of the offending line.
    ///
    /// `sources` pairs each source name with its text; the excerpt is taken
    /// from the one matching the error location.
    pub fn format(&self, sources: &[(&str, &str)]) -> String {
        let mut out = format!("Error: {}", self.message);
        let name = self.location.source.as_deref().unwrap_or("");
        let s = self.location.start;
        let loc = format!("{}:{}:{}", name, s.line, s.column);

        let text = sources.iter().find(|(src, _)| *src == name).map(|(_, t)| *t);
        match text {
            Some(text) => {
                let lines = split_lines(text);
                let line = lines.get(s.line.saturating_sub(1)).copied().unwrap_or("");
                let e = self.location.end;
                let last = if s.line == e.line {
                    e.column
                } else {
                    line.chars().count() + 1
                };
                let hat_len = last.saturating_sub(s.column).max(1);
                let filler = " ".repeat(s.line.to_string().len());
                write!(
                    out,
                    "\n --> {}\n{} |\n{} | {}\n{} | {}{}",
                    loc,
                    filler,
                    s.line,
                    line,
                    filler,
                    " ".repeat(s.column.saturating_sub(1)),
                    "^".repeat(hat_len)
                )
                .unwrap();
            }
            None => write!(out, "\n at {}", loc).unwrap(),
        }
        out
    }
}

fn split_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' => {
                lines.push(&text[start..i]);
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                start = i + 1;
            }
            b'\n' => {
                lines.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    lines.push(&text[start..]);
    lines
}
