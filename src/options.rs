//! Generation options.
//!
//! The field names mirror the JSON options object accepted by the front-end
//! (`allowedStartRules`, `returnTypes`, ...), so a whole options object can be
//! deserialized directly with serde.

use crate::ast::Grammar;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Which backend compiles the rule bodies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Optimize {
    /// One structured function per rule.
    #[default]
    Speed,
    /// A generic interpreter over an encoded bytecode table.
    Size,
}

/// Module format of the emitted source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFormat {
    Bare,
    #[default]
    CommonJs,
    Es,
    Amd,
    Umd,
    Globals,
}

/// Configuration for a generation run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerateOptions {
    /// Backend selection
    pub optimize: Optimize,
    /// Emit tracer calls around every rule
    pub trace: bool,
    /// Memoize rule results per input position
    pub cache: bool,
    /// Rules the parser may start from (empty = the first rule)
    pub allowed_start_rules: Vec<String>,
    /// Explicit result types overriding inference
    pub return_types: FxHashMap<String, String>,
    /// Text prepended verbatim to the output
    pub custom_header: Option<String>,
    /// Type action parameters and results from inference instead of `any`
    pub strict_typing: bool,
    pub format: ModuleFormat,
    /// Imported modules (variable → module id), in import order
    pub dependencies: IndexMap<String, String>,
    /// Global variable name for the `globals` and `umd` formats
    pub export_var: Option<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            optimize: Optimize::Speed,
            trace: false,
            cache: false,
            allowed_start_rules: Vec::new(),
            return_types: FxHashMap::default(),
            custom_header: None,
            strict_typing: false,
            format: ModuleFormat::CommonJs,
            dependencies: IndexMap::new(),
            export_var: None,
        }
    }
}

impl GenerateOptions {
    /// Options for the structured backend
    pub fn speed() -> Self {
        Self::default()
    }

    /// Options for the interpreter backend
    pub fn size() -> Self {
        Self {
            optimize: Optimize::Size,
            ..Default::default()
        }
    }

    /// Tracing and memoization both on
    pub fn debug() -> Self {
        Self {
            trace: true,
            cache: true,
            ..Default::default()
        }
    }

    /// Parse the front-end's JSON options object.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_optimize(mut self, optimize: Optimize) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_start_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_start_rules = rules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_return_type(mut self, rule: impl Into<String>, ty: impl Into<String>) -> Self {
        self.return_types.insert(rule.into(), ty.into());
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.custom_header = Some(header.into());
        self
    }

    pub fn with_strict_typing(mut self, strict: bool) -> Self {
        self.strict_typing = strict;
        self
    }

    pub fn with_format(mut self, format: ModuleFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_dependency(mut self, var: impl Into<String>, module: impl Into<String>) -> Self {
        self.dependencies.insert(var.into(), module.into());
        self
    }

    pub fn with_export_var(mut self, var: impl Into<String>) -> Self {
        self.export_var = Some(var.into());
        self
    }

    /// The effective start rules for `grammar`.
    pub fn start_rules(&self, grammar: &Grammar) -> Vec<String> {
        if self.allowed_start_rules.is_empty() {
            grammar.rules.iter().take(1).map(|r| r.name.clone()).collect()
        } else {
            self.allowed_start_rules.clone()
        }
    }

    /// The subset of options the type inference pass reads.
    pub fn infer_options(&self) -> InferOptions {
        InferOptions {
            strict_typing: self.strict_typing,
            return_types: self.return_types.clone(),
        }
    }
}

/// Options for the type inference pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InferOptions {
    /// Keep inferred action types instead of degrading them to `any`
    pub strict_typing: bool,
    pub return_types: FxHashMap<String, String>,
}

impl InferOptions {
    pub fn strict() -> Self {
        Self {
            strict_typing: true,
            ..Default::default()
        }
    }

    pub fn with_return_type(mut self, rule: impl Into<String>, ty: impl Into<String>) -> Self {
        self.return_types.insert(rule.into(), ty.into());
        self
    }
}
