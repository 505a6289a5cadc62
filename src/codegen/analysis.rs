//! Static Analysis for Code Generation
//!
//! Checks a grammar and infers the TypeScript result type of every rule and
//! expression:
//! - Structural validation (duplicate rules, dangling references)
//! - Bottom-up type inference, repeated until every rule is resolved
//! - Cycle detection for rules whose types only depend on each other
//!
//! Types are plain TypeScript source text: `string`, `[string,string]`,
//! `string|null`, `string[]`. A rule reference is typed by the alias of the
//! referenced rule (`T_<rule>`), which the emitter declares for every rule.

use crate::ast::{ExprKind, Expression, Grammar};
use crate::error::{GenerationError, Result};
use crate::options::InferOptions;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use tracing::{debug, instrument, trace};

/// Type of an expression that only looks ahead.
pub const UNDEFINED: &str = "undefined";
/// Type of an action without an explicit type.
pub const DYNAMIC: &str = "any";

/// Name of the type alias declared for `rule`.
pub fn type_alias(rule: &str) -> String {
    format!("T_{}", rule)
}

/// One resolved rule type
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleType {
    pub rule_name: String,
    /// Alias declared in the output (`T_<rule>`)
    pub type_name: String,
    /// The type text the alias stands for
    pub rule_type: String,
}

/// Resolved rule types, in grammar order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleTypeMap {
    entries: Vec<RuleType>,
    index: FxHashMap<String, usize>,
}

impl RuleTypeMap {
    fn insert(&mut self, rule_name: &str, rule_type: String) {
        let entry = RuleType {
            rule_name: rule_name.to_string(),
            type_name: type_alias(rule_name),
            rule_type,
        };
        match self.index.get(rule_name) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(rule_name.to_string(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    /// Resolved type text of `rule`.
    pub fn get(&self, rule: &str) -> Option<&str> {
        self.index
            .get(rule)
            .map(|&i| self.entries[i].rule_type.as_str())
    }

    /// Alias name of `rule`, if it is resolved.
    pub fn type_name(&self, rule: &str) -> Option<&str> {
        self.index
            .get(rule)
            .map(|&i| self.entries[i].type_name.as_str())
    }

    pub fn entries(&self) -> &[RuleType] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleType> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Generate a report of the inferred types
    pub fn report(&self) -> String {
        let mut report = String::new();
        report.push_str("=== Rule Types ===\n\n");
        for entry in &self.entries {
            report.push_str(&format!(
                "  {} ({}): {}\n",
                entry.rule_name, entry.type_name, entry.rule_type
            ));
        }
        report
    }
}

impl fmt::Display for RuleTypeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "type {} = {};", entry.type_name, entry.rule_type)?;
        }
        Ok(())
    }
}

/// Check the grammar's structure before any other pass runs.
pub fn validate(grammar: &Grammar, start_rules: &[String]) -> Result<()> {
    if grammar.is_empty() {
        return Err(GenerationError::EmptyGrammar);
    }

    let mut names = FxHashSet::default();
    for rule in &grammar.rules {
        if !names.insert(rule.name.as_str()) {
            return Err(GenerationError::DuplicateRule {
                name: rule.name.clone(),
            });
        }
    }

    for rule in &grammar.rules {
        let mut missing = None;
        rule.expression.walk(&mut |e| {
            if let ExprKind::RuleRef { name } = &e.kind {
                if missing.is_none() && !names.contains(name.as_str()) {
                    missing = Some(name.clone());
                }
            }
        });
        if let Some(referenced) = missing {
            return Err(GenerationError::UndefinedRule {
                rule: rule.name.clone(),
                referenced,
            });
        }
    }

    for start in start_rules {
        if !names.contains(start.as_str()) {
            return Err(GenerationError::UnknownStartRule {
                rule: start.clone(),
            });
        }
    }

    Ok(())
}

/// Wrap a type for use as an array element.
fn array_of(inner: &str) -> String {
    if is_union(inner) {
        format!("({})[]", inner)
    } else {
        format!("{}[]", inner)
    }
}

/// Whether `ty` has a `|` outside any brackets.
fn is_union(ty: &str) -> bool {
    let mut depth = 0i32;
    for c in ty.chars() {
        match c {
            '(' | '[' | '{' | '<' => depth += 1,
            ')' | ']' | '}' | '>' => depth -= 1,
            '|' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

/// Bottom-up type inference over a grammar.
///
/// Each pass visits every rule in grammar order. A node whose type depends
/// on a rule that is not resolved yet stays unresolved until a later pass;
/// once a node has a type it is never recomputed.
pub struct TypeInference<'o> {
    options: &'o InferOptions,
    /// Rule name → resolved type text
    resolved: FxHashMap<String, String>,
    passes: usize,
}

impl<'o> TypeInference<'o> {
    pub fn new(options: &'o InferOptions) -> Self {
        TypeInference {
            options,
            resolved: FxHashMap::default(),
            passes: 0,
        }
    }

    /// Number of passes the last `run` took.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Check `returnTypes` against the types written in the grammar.
    fn check_consistency(&self, grammar: &Grammar) -> Result<()> {
        for rule in &grammar.rules {
            let configured = match self.options.return_types.get(&rule.name) {
                Some(ty) => ty,
                None => continue,
            };
            if let Some(declared) = rule.declared_type() {
                if declared != configured.as_str() {
                    return Err(GenerationError::InconsistentTypes {
                        rule: rule.name.clone(),
                        declared: declared.to_string(),
                        configured: configured.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run passes until every rule is resolved and fully annotated.
    pub fn run(&mut self, grammar: &mut Grammar) -> Result<RuleTypeMap> {
        self.check_consistency(grammar)?;

        let mut previous = usize::MAX;
        let mut pass = 0;
        loop {
            pass += 1;
            self.passes = pass;
            for rule in grammar.rules.iter_mut() {
                if !self.resolved.contains_key(&rule.name) {
                    let fixed = self
                        .options
                        .return_types
                        .get(&rule.name)
                        .or(rule.type_spec.as_ref())
                        .cloned();
                    if let Some(ty) = fixed {
                        self.resolved.insert(rule.name.clone(), ty);
                    }
                }
                let inferred = self.infer(&mut rule.expression);
                if !self.resolved.contains_key(&rule.name) {
                    if let Some(ty) = inferred {
                        self.resolved.insert(rule.name.clone(), ty);
                    }
                }
                if self.resolved.contains_key(&rule.name) {
                    rule.inferred_type = Some(type_alias(&rule.name));
                }
            }

            let pending: Vec<&str> = grammar
                .rules
                .iter()
                .filter(|r| !self.resolved.contains_key(&r.name) || !r.expression.is_fully_typed())
                .map(|r| r.name.as_str())
                .collect();
            let untyped_rules = grammar
                .rules
                .iter()
                .filter(|r| !self.resolved.contains_key(&r.name))
                .count();
            let progress_measure = pending.len() + untyped_rules;
            debug!(pass, pending = pending.len(), untyped_rules, "type inference pass");

            if pending.is_empty() {
                break;
            }
            if progress_measure >= previous {
                return Err(GenerationError::CyclicRuleReference {
                    rules: pending.iter().map(|s| s.to_string()).collect(),
                });
            }
            previous = progress_measure;
        }

        let mut map = RuleTypeMap::default();
        for rule in &grammar.rules {
            if let Some(ty) = self.resolved.get(&rule.name) {
                map.insert(&rule.name, ty.clone());
            }
        }
        Ok(map)
    }

    /// Infer the type of `node`, annotating it and its descendants.
    ///
    /// A node that already has a type keeps it; only its children are
    /// visited, so nodes below a typed parent (text, predicates) still get
    /// annotated on later passes.
    fn infer(&self, node: &mut Expression) -> Option<String> {
        if let Some(known) = node.inferred_type.clone() {
            for child in node.children_mut() {
                self.infer(child);
            }
            return Some(known);
        }
        let ty = self.compute(node);
        if let Some(ty) = &ty {
            trace!(ty = %ty, "inferred");
        }
        node.inferred_type = ty.clone();
        ty
    }

    fn compute(&self, node: &mut Expression) -> Option<String> {
        let strict = self.options.strict_typing;
        match &mut node.kind {
            ExprKind::Literal { .. } | ExprKind::CharClass { .. } | ExprKind::Any => {
                Some("string".to_string())
            }
            ExprKind::Text { expression } => {
                self.infer(expression);
                Some("string".to_string())
            }
            ExprKind::RuleRef { name } => {
                self.resolved.get(name.as_str()).map(|_| type_alias(name))
            }
            ExprKind::Sequence { elements } => {
                let types: Vec<Option<String>> = elements.iter_mut().map(|e| self.infer(e)).collect();
                let types: Option<Vec<String>> = types.into_iter().collect();
                let types = types?;
                let picked: Vec<&String> = elements
                    .iter()
                    .zip(&types)
                    .filter(|(e, _)| matches!(e.kind, ExprKind::Labeled { pick: true, .. }))
                    .map(|(_, t)| t)
                    .collect();
                match picked.len() {
                    0 => Some(format!("[{}]", types.join(","))),
                    1 => Some(picked[0].clone()),
                    _ => {
                        let picked: Vec<&str> = picked.iter().map(|s| s.as_str()).collect();
                        Some(format!("[{}]", picked.join(",")))
                    }
                }
            }
            ExprKind::Choice { alternatives } => {
                let types: Vec<Option<String>> =
                    alternatives.iter_mut().map(|e| self.infer(e)).collect();
                let types: Vec<String> = types.into_iter().collect::<Option<_>>()?;
                let mut seen = FxHashSet::default();
                let distinct: Vec<&str> = types
                    .iter()
                    .map(String::as_str)
                    .filter(|t| seen.insert(*t))
                    .collect();
                Some(distinct.join("|"))
            }
            ExprKind::Labeled { expression, .. }
            | ExprKind::Named { expression, .. }
            | ExprKind::Group { expression } => self.infer(expression),
            ExprKind::Optional { expression } => {
                self.infer(expression).map(|t| format!("{}|null", t))
            }
            ExprKind::ZeroOrMore { expression } | ExprKind::OneOrMore { expression } => {
                self.infer(expression).map(|t| array_of(&t))
            }
            ExprKind::Repeated {
                expression,
                delimiter,
                ..
            } => {
                if let Some(d) = delimiter {
                    self.infer(d);
                }
                self.infer(expression).map(|t| array_of(&t))
            }
            ExprKind::SimpleAnd { expression } | ExprKind::SimpleNot { expression } => {
                self.infer(expression);
                Some(UNDEFINED.to_string())
            }
            ExprKind::SemanticAnd { .. } | ExprKind::SemanticNot { .. } => {
                Some(UNDEFINED.to_string())
            }
            ExprKind::Action {
                expression,
                type_spec,
                ..
            } => {
                let inner = self.infer(expression);
                if !strict {
                    return Some(DYNAMIC.to_string());
                }
                inner.map(|_| type_spec.clone().unwrap_or_else(|| DYNAMIC.to_string()))
            }
        }
    }
}

/// Infer the types of every rule of `grammar`.
///
/// Fails with [`GenerationError::CyclicRuleReference`] naming every rule that
/// could not be resolved when a pass makes no progress.
#[instrument(skip_all, name = "infer_types")]
pub fn infer_types(grammar: &mut Grammar, options: &InferOptions) -> Result<RuleTypeMap> {
    let map = TypeInference::new(options).run(grammar)?;
    debug!(rules = map.len(), "rule types resolved");
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ClassPart, Rule};

    fn infer_one(expression: Expression) -> String {
        let mut grammar = Grammar::new(vec![Rule::new("start", expression)]);
        let map = infer_types(&mut grammar, &InferOptions::strict()).unwrap();
        map.get("start").unwrap().to_string()
    }

    #[test]
    fn test_sequence_of_literals() {
        let ty = infer_one(Expression::sequence(vec![
            Expression::literal("a"),
            Expression::literal("b"),
            Expression::literal("c"),
        ]));
        assert_eq!(ty, "[string,string,string]");
    }

    #[test]
    fn test_optional() {
        assert_eq!(infer_one(Expression::optional(Expression::literal("a"))), "string|null");
    }

    #[test]
    fn test_nested_optional_is_not_collapsed() {
        let ty = infer_one(Expression::optional(Expression::optional(Expression::literal("a"))));
        assert_eq!(ty, "string|null|null");
    }

    #[test]
    fn test_repetitions() {
        let ty = infer_one(Expression::sequence(vec![
            Expression::one_or_more(Expression::literal("a")),
            Expression::zero_or_more(Expression::literal("b")),
        ]));
        assert_eq!(ty, "[string[],string[]]");
    }

    #[test]
    fn test_array_of_union_is_parenthesized() {
        let ty = infer_one(Expression::zero_or_more(Expression::optional(Expression::any())));
        assert_eq!(ty, "(string|null)[]");
    }

    #[test]
    fn test_choice_dedup() {
        let same = infer_one(Expression::choice(vec![
            Expression::literal("a"),
            Expression::literal("b"),
        ]));
        assert_eq!(same, "string");

        let mixed = infer_one(Expression::choice(vec![
            Expression::typed_action(Expression::literal("a"), "", "Type1"),
            Expression::literal("b"),
            Expression::typed_action(Expression::literal("c"), "", "Type1"),
        ]));
        assert_eq!(mixed, "Type1|string");
    }

    #[test]
    fn test_predicates_are_undefined() {
        let ty = infer_one(Expression::sequence(vec![
            Expression::simple_and(Expression::literal("a")),
            Expression::simple_not(Expression::literal("b")),
            Expression::semantic_and(" code1 "),
        ]));
        assert_eq!(ty, "[undefined,undefined,undefined]");
    }

    #[test]
    fn test_text_and_class() {
        let ty = infer_one(Expression::text(Expression::one_or_more(Expression::class(
            vec![ClassPart::Range('0', '9')],
            false,
            false,
        ))));
        assert_eq!(ty, "string");
    }

    #[test]
    fn test_action_types_strict_and_compat() {
        let rules = || {
            Grammar::new(vec![
                Rule::new("typed", Expression::typed_action(Expression::literal("x"), "", "boolean")),
                Rule::new("untyped", Expression::action(Expression::literal("x"), "")),
            ])
        };
        let mut strict = rules();
        let map = infer_types(&mut strict, &InferOptions::strict()).unwrap();
        assert_eq!(map.get("typed"), Some("boolean"));
        assert_eq!(map.get("untyped"), Some("any"));

        let mut compat = rules();
        let map = infer_types(&mut compat, &InferOptions::default()).unwrap();
        assert_eq!(map.get("typed"), Some("any"));
    }

    #[test]
    fn test_picked_elements() {
        let one = infer_one(Expression::sequence(vec![
            Expression::literal("("),
            Expression::pick(None, Expression::zero_or_more(Expression::any())),
            Expression::literal(")"),
        ]));
        assert_eq!(one, "string[]");

        let two = infer_one(Expression::sequence(vec![
            Expression::pick(Some("a"), Expression::literal("a")),
            Expression::literal(","),
            Expression::pick(Some("b"), Expression::optional(Expression::literal("b"))),
        ]));
        assert_eq!(two, "[string,string|null]");
    }

    #[test]
    fn test_rule_refs_out_of_order() {
        let mut grammar = Grammar::new(vec![
            Rule::new("rule1", Expression::literal("x")),
            Rule::new(
                "composite",
                Expression::sequence(vec![
                    Expression::rule_ref("rule1"),
                    Expression::rule_ref("rule2"),
                    Expression::rule_ref("rule3"),
                ]),
            ),
            Rule::new("rule2", Expression::typed_action(Expression::literal("x"), "", "number")),
            Rule::new("rule3", Expression::literal("x")),
        ]);
        let map = infer_types(&mut grammar, &InferOptions::strict()).unwrap();
        assert_eq!(map.get("composite"), Some("[T_rule1,T_rule2,T_rule3]"));
        assert_eq!(map.get("rule2"), Some("number"));
        assert_eq!(map.type_name("rule3"), Some("T_rule3"));
        assert_eq!(map.len(), 4);
        assert!(grammar.rules.iter().all(|r| r.inferred_type.is_some()));
        assert!(grammar.rules.iter().all(|r| r.expression.is_fully_typed()));
    }

    #[test]
    fn test_forward_chain_resolves_within_rule_count() {
        // r0 = r1, r1 = r2, ..., r9 = "x": one rule resolves per pass
        let count = 10;
        let mut rules: Vec<Rule> = (0..count - 1)
            .map(|i| Rule::new(format!("r{}", i), Expression::rule_ref(format!("r{}", i + 1))))
            .collect();
        rules.push(Rule::new(format!("r{}", count - 1), Expression::literal("x")));
        let mut grammar = Grammar::new(rules);

        let options = InferOptions::default();
        let mut inference = TypeInference::new(&options);
        let map = inference.run(&mut grammar).unwrap();
        assert_eq!(map.len(), count);
        assert_eq!(map.get("r0"), Some("T_r1"));
        assert_eq!(inference.passes(), count);

        // Defined leaves first, a single pass is enough
        grammar.rules.reverse();
        for rule in grammar.rules.iter_mut() {
            clear_types(&mut rule.expression);
            rule.inferred_type = None;
        }
        let mut inference = TypeInference::new(&options);
        inference.run(&mut grammar).unwrap();
        assert_eq!(inference.passes(), 1);
    }

    fn clear_types(expression: &mut Expression) {
        expression.inferred_type = None;
        for child in expression.children_mut() {
            clear_types(child);
        }
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut grammar = Grammar::new(vec![
            Rule::new("rule1", Expression::rule_ref("rule2")),
            Rule::new("rule2", Expression::rule_ref("rule1")),
        ]);
        let err = infer_types(&mut grammar, &InferOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), "Cyclic rule reference in: rule1, rule2");
    }

    #[test]
    fn test_cycle_only_names_cyclic_rules() {
        let mut grammar = Grammar::new(vec![
            Rule::new("start", Expression::literal("s")),
            Rule::new("a", Expression::choice(vec![Expression::rule_ref("b"), Expression::literal("x")])),
            Rule::new("b", Expression::optional(Expression::rule_ref("a"))),
        ]);
        let err = infer_types(&mut grammar, &InferOptions::default()).unwrap_err();
        assert_eq!(
            err,
            GenerationError::CyclicRuleReference {
                rules: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn test_explicit_type_breaks_cycle() {
        let mut grammar = Grammar::new(vec![
            Rule::typed("expr", Expression::choice(vec![
                Expression::sequence(vec![Expression::literal("("), Expression::rule_ref("expr"), Expression::literal(")")]),
                Expression::literal("x"),
            ]), "Expr"),
        ]);
        let map = infer_types(&mut grammar, &InferOptions::strict()).unwrap();
        assert_eq!(map.get("expr"), Some("Expr"));
        assert!(grammar.rules[0].expression.is_fully_typed());
    }

    #[test]
    fn test_return_types_override_and_conflict() {
        let mut grammar = Grammar::new(vec![Rule::new("start", Expression::literal("a"))]);
        let opts = InferOptions::strict().with_return_type("start", "Token");
        let map = infer_types(&mut grammar, &opts).unwrap();
        assert_eq!(map.get("start"), Some("Token"));

        let mut grammar = Grammar::new(vec![Rule::new(
            "start",
            Expression::typed_action(Expression::literal("a"), "", "string"),
        )]);
        let opts = InferOptions::strict().with_return_type("start", "number");
        let err = infer_types(&mut grammar, &opts).unwrap_err();
        assert!(err.to_string().starts_with("Inconsistent types for rule start"));
    }

    #[test]
    fn test_idempotent() {
        let mut grammar = Grammar::new(vec![
            Rule::new("start", Expression::sequence(vec![Expression::rule_ref("item"), Expression::any()])),
            Rule::new("item", Expression::optional(Expression::literal("i"))),
        ]);
        let opts = InferOptions::strict();
        let first = infer_types(&mut grammar, &opts).unwrap();
        let annotated = grammar.clone();
        let second = infer_types(&mut grammar, &opts).unwrap();
        assert_eq!(first, second);
        assert_eq!(grammar, annotated);
    }

    #[test]
    fn test_validate() {
        let grammar = Grammar::new(vec![
            Rule::new("a", Expression::rule_ref("b")),
            Rule::new("a", Expression::any()),
        ]);
        assert_eq!(
            validate(&grammar, &[]),
            Err(GenerationError::DuplicateRule { name: "a".into() })
        );

        let grammar = Grammar::new(vec![Rule::new("a", Expression::rule_ref("b"))]);
        assert!(matches!(
            validate(&grammar, &[]),
            Err(GenerationError::UndefinedRule { .. })
        ));

        let grammar = Grammar::new(vec![Rule::new("a", Expression::any())]);
        assert_eq!(
            validate(&grammar, &["z".to_string()]),
            Err(GenerationError::UnknownStartRule { rule: "z".into() })
        );
        assert_eq!(validate(&Grammar::default(), &[]), Err(GenerationError::EmptyGrammar));
    }
}
