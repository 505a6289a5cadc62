//! Lowering of rule expressions to bytecode.
//!
//! Each expression compiles to code that leaves exactly one value on the
//! stack: the match result, or `FAILED`. Position bookkeeping follows a
//! fixed pattern: constructs that may need to backtrack push the current
//! position first and either drop it (`NIP`) on success or restore it
//! (`POP_CURR_POS`) on failure.
//!
//! # Example
//!
//! ```text
//!   start = "a" "b"
//!
//!   PUSH_CURR_POS
//!   MATCH_STRING 0 [ACCEPT_STRING 0] [FAIL 1]
//!   IF_NOT_ERROR
//!     MATCH_STRING 2 [ACCEPT_STRING 2] [FAIL 3]
//!     IF_NOT_ERROR [WRAP 2, NIP] [POP_N 2, POP_CURR_POS, PUSH_FAILED]
//!   else
//!     POP, POP_CURR_POS, PUSH_FAILED
//! ```
//!
//! Labels visible to an action or semantic predicate become parameters of
//! its function constant, typed from the labeled expressions' inferred
//! types (or `any` outside strict typing).

use crate::ast::{ExprKind, Expression, Grammar};
use crate::consts::{Const, ConstPool, FunctionConst, FunctionKind};
use crate::error::{GenerationError, Result};
use crate::opcodes::Opcode;
use crate::options::GenerateOptions;
use crate::runtime::Expectation;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use tracing::{debug, instrument, trace};

/// Bytecode of one rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleBytecode {
    pub name: String,
    pub bytecode: Vec<u32>,
}

/// Output of the lowering pass: per-rule bytecode plus the shared pool.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompiledGrammar {
    pub rules: Vec<RuleBytecode>,
    pub consts: ConstPool,
}

impl CompiledGrammar {
    pub fn rule_names(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.name == name)
    }

    pub fn bytecode(&self, name: &str) -> Option<&[u32]> {
        self.rules
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.bytecode.as_slice())
    }
}

/// A label in scope: its stack slot and TypeScript type.
#[derive(Clone, Debug)]
struct Label {
    sp: i32,
    ty: String,
}

type Env = IndexMap<String, Label>;

/// The action a sequence reports its elements to.
struct ActionSite<'a> {
    code: &'a str,
    return_type: String,
}

fn op(o: Opcode) -> u32 {
    o.code()
}

fn build_condition(cond: Vec<u32>, then_code: Vec<u32>, else_code: Vec<u32>) -> Vec<u32> {
    let mut out = cond;
    out.push(then_code.len() as u32);
    out.push(else_code.len() as u32);
    out.extend(then_code);
    out.extend(else_code);
    out
}

fn build_loop(cond: Vec<u32>, body: Vec<u32>) -> Vec<u32> {
    let mut out = cond;
    out.push(body.len() as u32);
    out.extend(body);
    out
}

fn build_append_loop(body: &[u32]) -> Vec<u32> {
    let mut inner = vec![op(Opcode::Append)];
    inner.extend_from_slice(body);
    build_loop(vec![op(Opcode::WhileNotError)], inner)
}

fn build_call(function: usize, delta: u32, env: &Env, sp: i32) -> Vec<u32> {
    let mut out = vec![
        op(Opcode::Call),
        function as u32,
        delta,
        env.len() as u32,
    ];
    out.extend(env.values().map(|label| (sp - label.sp) as u32));
    out
}

/// Lowers every rule of a grammar against one shared constants pool.
pub struct BytecodeGenerator<'g> {
    grammar: &'g Grammar,
    rule_indices: FxHashMap<&'g str, usize>,
    consts: ConstPool,
    strict: bool,
    current_rule: &'g str,
}

impl<'g> BytecodeGenerator<'g> {
    pub fn new(grammar: &'g Grammar, options: &GenerateOptions) -> Self {
        let rule_indices = grammar
            .rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.as_str(), i))
            .collect();
        BytecodeGenerator {
            grammar,
            rule_indices,
            consts: ConstPool::new(),
            strict: options.strict_typing,
            current_rule: "",
        }
    }

    /// Lower all rules, consuming the generator.
    pub fn generate(mut self) -> Result<CompiledGrammar> {
        let grammar = self.grammar;
        let mut rules = Vec::with_capacity(grammar.rules.len());
        for rule in &grammar.rules {
            self.current_rule = &rule.name;
            let bytecode = self.expr(&rule.expression, -1, &mut Env::new(), None, &mut Vec::new())?;
            trace!(rule = %rule.name, words = bytecode.len(), "lowered rule");
            rules.push(RuleBytecode {
                name: rule.name.clone(),
                bytecode,
            });
        }
        Ok(CompiledGrammar {
            rules,
            consts: self.consts,
        })
    }

    fn label_type(&self, labeled: &Expression, inner: &Expression) -> Result<String> {
        if !self.strict {
            return Ok("any".to_string());
        }
        labeled
            .inferred_type
            .clone()
            .or_else(|| inner.inferred_type.clone())
            .ok_or_else(|| GenerationError::UnresolvedType {
                rule: self.current_rule.to_string(),
            })
    }

    fn action_type(&self, action: &Expression) -> Result<String> {
        if !self.strict {
            return Ok("any".to_string());
        }
        action
            .inferred_type
            .clone()
            .ok_or_else(|| GenerationError::UnresolvedType {
                rule: self.current_rule.to_string(),
            })
    }

    fn add_function(&mut self, kind: FunctionKind, env: &Env, code: &str, return_type: String) -> usize {
        self.consts.add_function(FunctionConst {
            kind,
            params: env
                .iter()
                .map(|(name, label)| (name.clone(), label.ty.clone()))
                .collect(),
            return_type,
            code: code.to_string(),
        })
    }

    fn simple_predicate(&mut self, inner: &Expression, negative: bool, sp: i32, env: &Env) -> Result<Vec<u32>> {
        let mut out = vec![op(Opcode::PushCurrPos), op(Opcode::SilentFailsOn)];
        out.extend(self.expr(inner, sp + 1, &mut env.clone(), None, &mut Vec::new())?);
        out.push(op(Opcode::SilentFailsOff));
        let (cond, restore_then, restore_else) = if negative {
            (Opcode::IfError, Opcode::Pop, Opcode::PopCurrPos)
        } else {
            (Opcode::IfNotError, Opcode::PopCurrPos, Opcode::Pop)
        };
        out.extend(build_condition(
            vec![op(cond)],
            vec![op(Opcode::Pop), op(restore_then), op(Opcode::PushUndefined)],
            vec![op(Opcode::Pop), op(restore_else), op(Opcode::PushFailed)],
        ));
        Ok(out)
    }

    fn semantic_predicate(&mut self, code: &str, negative: bool, sp: i32, env: &Env) -> Vec<u32> {
        let ret = if self.strict { "boolean" } else { "any" };
        let function = self.add_function(FunctionKind::Predicate, env, code, ret.to_string());
        let mut out = vec![op(Opcode::UpdateSavedPos)];
        out.extend(build_call(function, 0, env, sp));
        let (then_push, else_push) = if negative {
            (Opcode::PushFailed, Opcode::PushUndefined)
        } else {
            (Opcode::PushUndefined, Opcode::PushFailed)
        };
        out.extend(build_condition(
            vec![op(Opcode::If)],
            vec![op(Opcode::Pop), op(then_push)],
            vec![op(Opcode::Pop), op(else_push)],
        ));
        out
    }

    fn sequence_tail(
        &mut self,
        elements: &[Expression],
        processed: usize,
        sp: i32,
        env: &mut Env,
        action: Option<&ActionSite<'_>>,
        pluck: &mut Vec<i32>,
    ) -> Result<Vec<u32>> {
        let total = processed + elements.len();
        if let Some((first, rest)) = elements.split_first() {
            let mut out = self.expr(first, sp, env, None, pluck)?;
            let then_code = self.sequence_tail(rest, processed + 1, sp + 1, env, action, pluck)?;
            let mut else_code = if processed + 1 > 1 {
                vec![op(Opcode::PopN), (processed + 1) as u32]
            } else {
                vec![op(Opcode::Pop)]
            };
            else_code.extend([op(Opcode::PopCurrPos), op(Opcode::PushFailed)]);
            out.extend(build_condition(vec![op(Opcode::IfNotError)], then_code, else_code));
            return Ok(out);
        }

        if let Some(action) = action {
            let function = self.add_function(FunctionKind::Action, env, action.code, action.return_type.clone());
            let mut out = vec![op(Opcode::LoadSavedPos), total as u32];
            out.extend(build_call(function, total as u32 + 1, env, sp));
            Ok(out)
        } else if !pluck.is_empty() {
            let mut out = vec![op(Opcode::Pluck), total as u32 + 1, pluck.len() as u32];
            out.extend(pluck.iter().map(|p| (sp - p) as u32));
            Ok(out)
        } else {
            Ok(vec![op(Opcode::Wrap), total as u32, op(Opcode::Nip)])
        }
    }

    fn repeated(
        &mut self,
        inner: &Expression,
        delimiter: Option<&Expression>,
        min: u32,
        max: Option<u32>,
        sp: i32,
        env: &Env,
    ) -> Result<Vec<u32>> {
        let has_min = min > 0;
        let offset = if has_min { 2 } else { 1 };
        let first = self.expr(inner, sp + offset, &mut env.clone(), None, &mut Vec::new())?;

        let body = match delimiter {
            Some(delim) => {
                let mut out = vec![op(Opcode::PushCurrPos)];
                out.extend(self.expr(delim, sp + offset + 1, &mut env.clone(), None, &mut Vec::new())?);
                let mut then_code = vec![op(Opcode::Pop)];
                then_code.extend(self.expr(inner, sp + offset + 1, &mut env.clone(), None, &mut Vec::new())?);
                then_code.extend(build_condition(
                    vec![op(Opcode::IfError)],
                    vec![op(Opcode::Pop), op(Opcode::PopCurrPos), op(Opcode::PushFailed)],
                    vec![op(Opcode::Nip)],
                ));
                out.extend(build_condition(
                    vec![op(Opcode::IfNotError)],
                    then_code,
                    vec![op(Opcode::Nip)],
                ));
                out
            }
            None => first.clone(),
        };

        let check_max = |code: Vec<u32>| match max {
            Some(max) => build_condition(
                vec![op(Opcode::IfGe), max],
                vec![op(Opcode::PushFailed)],
                code,
            ),
            None => code,
        };

        let mut out = Vec::new();
        if has_min {
            out.push(op(Opcode::PushCurrPos));
        }
        out.push(op(Opcode::PushEmptyArray));
        out.extend(check_max(first));
        out.extend(build_append_loop(&check_max(body)));
        out.push(op(Opcode::Pop));

        if has_min {
            out.extend(build_condition(
                vec![op(Opcode::IfLt), min],
                vec![op(Opcode::Pop), op(Opcode::PopCurrPos), op(Opcode::PushFailed)],
                vec![op(Opcode::Nip)],
            ));
        }
        Ok(out)
    }

    fn expr(
        &mut self,
        node: &Expression,
        sp: i32,
        env: &mut Env,
        action: Option<&ActionSite<'_>>,
        pluck: &mut Vec<i32>,
    ) -> Result<Vec<u32>> {
        match &node.kind {
            ExprKind::Named { name, expression } => {
                let index = self.consts.add_expectation(Expectation::other(name.clone()));
                let mut out = vec![op(Opcode::SilentFailsOn)];
                out.extend(self.expr(expression, sp, env, action, pluck)?);
                out.push(op(Opcode::SilentFailsOff));
                out.extend(build_condition(
                    vec![op(Opcode::IfError)],
                    vec![op(Opcode::Pop), op(Opcode::Fail), index as u32],
                    vec![],
                ));
                Ok(out)
            }

            ExprKind::Choice { alternatives } => {
                let mut codes = Vec::with_capacity(alternatives.len());
                for alt in alternatives {
                    codes.push(self.expr(alt, sp, &mut env.clone(), None, &mut Vec::new())?);
                }
                let mut out = codes.pop().unwrap_or_default();
                while let Some(code) = codes.pop() {
                    let mut then_code = vec![op(Opcode::Pop)];
                    then_code.extend(out);
                    out = code;
                    out.extend(build_condition(vec![op(Opcode::IfError)], then_code, vec![]));
                }
                Ok(out)
            }

            ExprKind::Action {
                expression,
                code,
                ..
            } => {
                let mut inner_env = env.clone();
                let site = ActionSite {
                    code: code.as_str(),
                    return_type: self.action_type(node)?,
                };
                let emit_call = !matches!(&expression.kind, ExprKind::Sequence { elements } if !elements.is_empty());
                let inner_sp = if emit_call { sp + 1 } else { sp };
                let inner = self.expr(expression, inner_sp, &mut inner_env, Some(&site), &mut Vec::new())?;
                if !emit_call {
                    return Ok(inner);
                }
                let function = self.add_function(FunctionKind::Action, &inner_env, code, site.return_type.clone());
                let mut out = vec![op(Opcode::PushCurrPos)];
                out.extend(inner);
                let mut then_code = vec![op(Opcode::LoadSavedPos), 1];
                then_code.extend(build_call(function, 1, &inner_env, sp + 2));
                out.extend(build_condition(vec![op(Opcode::IfNotError)], then_code, vec![]));
                out.push(op(Opcode::Nip));
                Ok(out)
            }

            ExprKind::Sequence { elements } => {
                let mut out = vec![op(Opcode::PushCurrPos)];
                let mut seq_pluck = Vec::new();
                out.extend(self.sequence_tail(elements, 0, sp + 1, env, action, &mut seq_pluck)?);
                Ok(out)
            }

            ExprKind::Labeled {
                label,
                pick,
                expression,
            } => {
                let mut inner_env = env.clone();
                if let Some(label) = label {
                    let ty = self.label_type(node, expression)?;
                    env.insert(label.clone(), Label { sp: sp + 1, ty });
                }
                if *pick {
                    pluck.push(sp + 1);
                }
                self.expr(expression, sp, &mut inner_env, None, &mut Vec::new())
            }

            ExprKind::Text { expression } => {
                let mut out = vec![op(Opcode::PushCurrPos)];
                out.extend(self.expr(expression, sp + 1, &mut env.clone(), None, &mut Vec::new())?);
                out.extend(build_condition(
                    vec![op(Opcode::IfNotError)],
                    vec![op(Opcode::Pop), op(Opcode::Text)],
                    vec![op(Opcode::Nip)],
                ));
                Ok(out)
            }

            ExprKind::SimpleAnd { expression } => self.simple_predicate(expression, false, sp, env),
            ExprKind::SimpleNot { expression } => self.simple_predicate(expression, true, sp, env),

            ExprKind::Optional { expression } => {
                let mut out = self.expr(expression, sp, &mut env.clone(), None, &mut Vec::new())?;
                out.extend(build_condition(
                    vec![op(Opcode::IfError)],
                    vec![op(Opcode::Pop), op(Opcode::PushNull)],
                    vec![],
                ));
                Ok(out)
            }

            ExprKind::ZeroOrMore { expression } => {
                let body = self.expr(expression, sp + 1, &mut env.clone(), None, &mut Vec::new())?;
                let mut out = vec![op(Opcode::PushEmptyArray)];
                out.extend_from_slice(&body);
                out.extend(build_append_loop(&body));
                out.push(op(Opcode::Pop));
                Ok(out)
            }

            ExprKind::OneOrMore { expression } => {
                let body = self.expr(expression, sp + 1, &mut env.clone(), None, &mut Vec::new())?;
                let mut out = vec![op(Opcode::PushEmptyArray)];
                out.extend_from_slice(&body);
                let mut then_code = build_append_loop(&body);
                then_code.push(op(Opcode::Pop));
                out.extend(build_condition(
                    vec![op(Opcode::IfNotError)],
                    then_code,
                    vec![op(Opcode::Pop), op(Opcode::Pop), op(Opcode::PushFailed)],
                ));
                Ok(out)
            }

            ExprKind::Repeated {
                expression,
                delimiter,
                min,
                max,
            } => self.repeated(expression, delimiter.as_deref(), *min, *max, sp, env),

            ExprKind::Group { expression } => {
                self.expr(expression, sp, &mut env.clone(), None, &mut Vec::new())
            }

            ExprKind::SemanticAnd { code } => Ok(self.semantic_predicate(code, false, sp, env)),
            ExprKind::SemanticNot { code } => Ok(self.semantic_predicate(code, true, sp, env)),

            ExprKind::RuleRef { name } => match self.rule_indices.get(name.as_str()) {
                Some(&index) => Ok(vec![op(Opcode::Rule), index as u32]),
                None => Err(GenerationError::UndefinedRule {
                    rule: self.current_rule.to_string(),
                    referenced: name.clone(),
                }),
            },

            ExprKind::Literal { value, ignore_case } => {
                if value.is_empty() {
                    let index = self.consts.add_literal("");
                    return Ok(vec![op(Opcode::Push), index as u32]);
                }
                let matched = if *ignore_case {
                    value.to_lowercase()
                } else {
                    value.clone()
                };
                let string_index = self.consts.add_literal(matched) as u32;
                let expected_index = self
                    .consts
                    .add_expectation(Expectation::literal(value.clone(), *ignore_case))
                    as u32;
                let (cond, accept) = if *ignore_case {
                    (
                        vec![op(Opcode::MatchStringIc), string_index],
                        vec![op(Opcode::AcceptN), value.encode_utf16().count() as u32],
                    )
                } else {
                    (
                        vec![op(Opcode::MatchString), string_index],
                        vec![op(Opcode::AcceptString), string_index],
                    )
                };
                Ok(build_condition(cond, accept, vec![op(Opcode::Fail), expected_index]))
            }

            ExprKind::CharClass {
                parts,
                inverted,
                ignore_case,
            } => {
                let regexp = self.consts.add(Const::Class {
                    parts: parts.clone(),
                    inverted: *inverted,
                    ignore_case: *ignore_case,
                }) as u32;
                let expected = self.consts.add_expectation(Expectation::class(
                    parts.clone(),
                    *inverted,
                    *ignore_case,
                )) as u32;
                Ok(build_condition(
                    vec![op(Opcode::MatchRegexp), regexp],
                    vec![op(Opcode::AcceptN), 1],
                    vec![op(Opcode::Fail), expected],
                ))
            }

            ExprKind::Any => {
                let expected = self.consts.add_expectation(Expectation::Any) as u32;
                Ok(build_condition(
                    vec![op(Opcode::MatchAny)],
                    vec![op(Opcode::AcceptN), 1],
                    vec![op(Opcode::Fail), expected],
                ))
            }
        }
    }
}

/// Lower every rule of `grammar` to bytecode.
///
/// Under strict typing the grammar must already carry inferred types, since
/// they become the parameter types of the function constants.
#[instrument(skip_all, name = "generate_bytecode")]
pub fn generate_bytecode(grammar: &Grammar, options: &GenerateOptions) -> Result<CompiledGrammar> {
    let compiled = BytecodeGenerator::new(grammar, options).generate()?;
    debug!(
        rules = compiled.rules.len(),
        consts = compiled.consts.len(),
        "bytecode generated"
    );
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ClassPart, Rule};

    fn lower(rules: Vec<Rule>) -> CompiledGrammar {
        generate_bytecode(&Grammar::new(rules), &GenerateOptions::default()).unwrap()
    }

    fn texts(compiled: &CompiledGrammar) -> Vec<&str> {
        compiled.consts.texts().collect()
    }

    #[test]
    fn test_literal() {
        let c = lower(vec![Rule::new("start", Expression::literal("a"))]);
        assert_eq!(c.rules[0].bytecode, vec![18, 0, 2, 2, 22, 0, 23, 1]);
        assert_eq!(
            texts(&c),
            vec!["\"a\"", "peg$literalExpectation(\"a\", false)"]
        );
    }

    #[test]
    fn test_literal_ignore_case() {
        let c = lower(vec![Rule::new("start", Expression::literal_ic("A"))]);
        assert_eq!(c.rules[0].bytecode, vec![19, 0, 2, 2, 21, 1, 23, 1]);
        assert_eq!(
            texts(&c),
            vec!["\"a\"", "peg$literalExpectation(\"A\", true)"]
        );
    }

    #[test]
    fn test_empty_literal_pushes_const() {
        let c = lower(vec![Rule::new("start", Expression::literal(""))]);
        assert_eq!(c.rules[0].bytecode, vec![0, 0]);
        assert_eq!(texts(&c), vec!["\"\""]);
    }

    #[test]
    fn test_sequence() {
        let c = lower(vec![Rule::new(
            "start",
            Expression::sequence(vec![
                Expression::literal("a"),
                Expression::literal("b"),
                Expression::literal("c"),
            ]),
        )]);
        assert_eq!(
            c.rules[0].bytecode,
            vec![
                5, // PUSH_CURR_POS
                18, 0, 2, 2, 22, 0, 23, 1, // "a"
                15, 33, 3, // IF_NOT_ERROR
                18, 2, 2, 2, 22, 2, 23, 3, // "b"
                15, 18, 4, // IF_NOT_ERROR
                18, 4, 2, 2, 22, 4, 23, 5, // "c"
                15, 3, 4, // IF_NOT_ERROR
                11, 3, 9, // WRAP 3, NIP
                8, 3, 7, 3, // POP_N 3, POP_CURR_POS, PUSH_FAILED
                8, 2, 7, 3, // POP_N 2, POP_CURR_POS, PUSH_FAILED
                6, 7, 3, // POP, POP_CURR_POS, PUSH_FAILED
            ]
        );
    }

    #[test]
    fn test_choice() {
        let c = lower(vec![Rule::new(
            "start",
            Expression::choice(vec![
                Expression::literal("a"),
                Expression::literal("b"),
                Expression::literal("c"),
            ]),
        )]);
        assert_eq!(
            c.rules[0].bytecode,
            vec![
                18, 0, 2, 2, 22, 0, 23, 1, // "a"
                14, 21, 0, // IF_ERROR
                6, // POP
                18, 2, 2, 2, 22, 2, 23, 3, // "b"
                14, 9, 0, // IF_ERROR
                6, // POP
                18, 4, 2, 2, 22, 4, 23, 5, // "c"
            ]
        );
    }

    #[test]
    fn test_labeled_action_calls_with_offsets() {
        let c = lower(vec![Rule::new(
            "start",
            Expression::action(Expression::labeled("a", Expression::literal("a")), " code "),
        )]);
        assert_eq!(
            c.rules[0].bytecode,
            vec![
                5, // PUSH_CURR_POS
                18, 0, 2, 2, 22, 0, 23, 1, // "a"
                15, 7, 0, // IF_NOT_ERROR
                24, 1, // LOAD_SAVED_POS 1
                26, 2, 1, 1, 0, // CALL f=2 pop=1 params=[0]
                9, // NIP
            ]
        );
        assert_eq!(c.consts.text(2), Some("function(a: any):any { code }"));
    }

    #[test]
    fn test_sequence_action_receives_all_labels() {
        let c = lower(vec![Rule::new(
            "start",
            Expression::action(
                Expression::sequence(vec![
                    Expression::labeled("a", Expression::literal("a")),
                    Expression::literal("b"),
                    Expression::labeled("c", Expression::literal("c")),
                ]),
                "",
            ),
        )]);
        let bc = &c.rules[0].bytecode;
        let tail = [24, 3, 26, 6, 4, 2, 2, 0];
        let at = bc.windows(tail.len()).position(|w| w == tail);
        assert!(at.is_some(), "missing action call in {:?}", bc);
        assert_eq!(c.consts.text(6), Some("function(a: any, c: any):any {}"));
    }

    #[test]
    fn test_pick_plucks_single_element() {
        let c = lower(vec![Rule::new(
            "start",
            Expression::sequence(vec![
                Expression::literal("("),
                Expression::pick(None, Expression::literal("x")),
                Expression::literal(")"),
            ]),
        )]);
        let bc = &c.rules[0].bytecode;
        // PLUCK 4 1 [1]
        assert!(bc.windows(4).any(|w| w == [36, 4, 1, 1]), "{:?}", bc);
    }

    #[test]
    fn test_repeated_bounds() {
        let c = lower(vec![Rule::new(
            "start",
            Expression::repeated(Expression::any(), None, 2, Some(3)),
        )]);
        assert_eq!(
            c.rules[0].bytecode,
            vec![
                5, // PUSH_CURR_POS
                4, // PUSH_EMPTY_ARRAY
                31, 3, 1, 7, 3, // IF_GE 3 [PUSH_FAILED]
                17, 2, 2, 21, 1, 23, 0, // MATCH_ANY
                16, 13, // WHILE_NOT_ERROR
                10, // APPEND
                31, 3, 1, 7, 3, // IF_GE 3 [PUSH_FAILED]
                17, 2, 2, 21, 1, 23, 0, // MATCH_ANY
                6, // POP
                30, 2, 3, 1, // IF_LT 2
                6, 7, 3, // POP, POP_CURR_POS, PUSH_FAILED
                9, // NIP
            ]
        );
    }

    #[test]
    fn test_class_consts() {
        let c = lower(vec![Rule::new(
            "start",
            Expression::class(vec![ClassPart::Range('a', 'z')], false, true),
        )]);
        assert_eq!(c.rules[0].bytecode, vec![20, 0, 2, 2, 21, 1, 23, 1]);
        assert_eq!(
            texts(&c),
            vec![
                "/^[a-z]/i",
                "peg$classExpectation([[\"a\", \"z\"]], false, true)"
            ]
        );
    }

    #[test]
    fn test_named_balances_stack() {
        let c = lower(vec![Rule::new(
            "start",
            Expression::named("digit", Expression::any()),
        )]);
        assert_eq!(
            c.rules[0].bytecode,
            vec![28, 17, 2, 2, 21, 1, 23, 1, 29, 14, 3, 0, 6, 23, 0]
        );
        assert_eq!(c.consts.text(0), Some("peg$otherExpectation(\"digit\")"));
    }

    #[test]
    fn test_undefined_rule() {
        let err = generate_bytecode(
            &Grammar::new(vec![Rule::new("start", Expression::rule_ref("missing"))]),
            &GenerateOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            GenerationError::UndefinedRule {
                rule: "start".into(),
                referenced: "missing".into()
            }
        );
    }

    #[test]
    fn test_strict_typing_requires_types() {
        let grammar = Grammar::new(vec![Rule::new(
            "start",
            Expression::action(Expression::labeled("a", Expression::any()), ""),
        )]);
        let opts = GenerateOptions::default().with_strict_typing(true);
        assert!(matches!(
            generate_bytecode(&grammar, &opts),
            Err(GenerationError::UnresolvedType { .. })
        ));
    }
}
