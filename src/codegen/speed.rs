//! Speed backend: bytecode to structured rule functions.
//!
//! A rule's bytecode is compiled by simulating the value stack at compile
//! time. Every stack slot becomes a local variable `s<N>`, every conditional
//! an `if`, and every loop a `while`. The compiled form is kept as a small
//! statement tree ([`Stmt`]) so it can be rendered to TypeScript or executed
//! directly by the reference machine.
//!
//! The simulation also validates the bytecode: both branches of a
//! conditional must leave the stack at the same height, a loop body must
//! leave it unchanged, and nothing may be read below the bottom of the stack.

use super::indent2;
use crate::consts::{string_escape, Const, ConstPool};
use crate::error::{GenerationError, Result};
use crate::opcodes::Opcode;
use crate::options::GenerateOptions;
use std::fmt::Write;
use tracing::{debug, instrument};

/// A value expression assigned to a stack slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    /// `peg$c<N>`
    Const(usize),
    /// `peg$currPos`
    CurrPos,
    Undefined,
    Null,
    /// `peg$FAILED`
    Failed,
    EmptyArray,
    /// `s<N>`
    Slot(usize),
    /// `[s<a>, s<b>, ...]`
    Array(Vec<usize>),
    /// `input.substring(s<N>, peg$currPos)`
    Substring(usize),
    /// The next `n` code units of the input
    Accept(usize),
    /// `peg$c<F>(s<a>, ...)`
    Call { function: usize, args: Vec<usize> },
    /// `peg$parse<rule>()`
    Rule(usize),
}

/// The condition of an `if` or `while`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cond {
    /// `s<N>` used as a JavaScript truth value
    Truthy(usize),
    IsFailed(usize),
    NotFailed(usize),
    /// At least one code unit of input left
    AnyAvailable,
    /// The input at `peg$currPos` starts with literal constant `c`
    MatchString(usize),
    /// Like `MatchString`, after lowercasing the input
    MatchStringIc(usize),
    /// The next code unit matches class constant `c`
    MatchClass(usize),
    /// `s<N>.length < n`
    LengthLt(usize, u32),
    /// `s<N>.length >= n`
    LengthGe(usize, u32),
}

/// One statement of a compiled rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stmt {
    Assign { slot: usize, value: Expr },
    /// `peg$currPos = s<N>;`
    SetCurrPos(usize),
    /// `peg$currPos += n;`
    AdvanceCurrPos(usize),
    /// `peg$savedPos = s<N>;`, or `peg$savedPos = peg$currPos;` for `None`
    SetSavedPos(Option<usize>),
    /// `s<array>.push(s<value>);`
    Append { array: usize, value: usize },
    /// Record expectation constant `c` unless failures are silenced
    ReportFail(usize),
    SilentFailsOn,
    SilentFailsOff,
    If {
        cond: Cond,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While { cond: Cond, body: Vec<Stmt> },
}

/// A rule compiled to a statement tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledRule {
    pub name: String,
    /// Position of the rule in the grammar
    pub index: usize,
    pub body: Vec<Stmt>,
    /// Highest stack index reached, -1 for an empty body
    pub max_sp: i32,
}

impl CompiledRule {
    /// Number of `s<N>` locals the rendered function declares.
    pub fn slot_count(&self) -> usize {
        (self.max_sp + 1) as usize
    }
}

/// Bytecode compiler for one rule.
struct StackCompiler<'a> {
    rule: &'a str,
    bc: &'a [u32],
    consts: &'a ConstPool,
    rule_count: usize,
    sp: i32,
    max_sp: i32,
}

impl<'a> StackCompiler<'a> {
    fn truncated(&self, offset: usize) -> GenerationError {
        GenerationError::TruncatedBytecode {
            rule: self.rule.to_string(),
            offset,
        }
    }

    fn underflow(&self, offset: usize) -> GenerationError {
        GenerationError::StackUnderflow {
            rule: self.rule.to_string(),
            offset,
        }
    }

    /// Operand `k` of the instruction at `ip`, bounded by the block end.
    fn operand(&self, ip: usize, k: usize, end: usize) -> Result<u32> {
        if ip + k >= end {
            return Err(self.truncated(ip));
        }
        Ok(self.bc[ip + k])
    }

    fn constant(&self, index: u32) -> Result<usize> {
        let index = index as usize;
        if index >= self.consts.len() {
            return Err(GenerationError::UnknownConstant {
                rule: self.rule.to_string(),
                index,
            });
        }
        Ok(index)
    }

    fn literal_len(&self, index: u32) -> Result<usize> {
        let index = self.constant(index)?;
        match self.consts.get(index).and_then(Const::as_literal) {
            Some(value) => Ok(value.encode_utf16().count()),
            None => Err(GenerationError::UnknownConstant {
                rule: self.rule.to_string(),
                index,
            }),
        }
    }

    fn push(&mut self, value: Expr) -> Stmt {
        self.sp += 1;
        self.max_sp = self.max_sp.max(self.sp);
        Stmt::Assign {
            slot: self.sp as usize,
            value,
        }
    }

    fn pop(&mut self, n: u32, offset: usize) -> Result<()> {
        if i64::from(n) > i64::from(self.sp) + 1 {
            return Err(self.underflow(offset));
        }
        self.sp -= n as i32;
        Ok(())
    }

    /// Slot `p` entries below the top.
    fn index(&self, p: u32, offset: usize) -> Result<usize> {
        let slot = i64::from(self.sp) - i64::from(p);
        if slot < 0 {
            return Err(self.underflow(offset));
        }
        Ok(slot as usize)
    }

    /// End of a region of `len` words starting at `start`, if it fits in `end`.
    fn region(&self, ip: usize, start: usize, len: u32, end: usize) -> Result<usize> {
        start
            .checked_add(len as usize)
            .filter(|&region_end| region_end <= end)
            .ok_or_else(|| self.truncated(ip))
    }

    fn top(&self, offset: usize) -> Result<usize> {
        self.index(0, offset)
    }

    fn condition(
        &mut self,
        opcode: Opcode,
        cond: Cond,
        ip: usize,
        end: usize,
        args: usize,
    ) -> Result<(Stmt, usize)> {
        let then_len = self.operand(ip, args + 1, end)?;
        let else_len = self.operand(ip, args + 2, end)?;
        let then_end = self.region(ip, ip + args + 3, then_len, end)?;
        let else_end = self.region(ip, then_end, else_len, end)?;
        let then_start = ip + args + 3;

        let base_sp = self.sp;
        let then_body = self.block(then_start, then_end)?;
        let then_sp = self.sp;
        self.sp = base_sp;
        let else_body = self.block(then_end, else_end)?;
        if self.sp != then_sp {
            return Err(GenerationError::UnbalancedBranches {
                rule: self.rule.to_string(),
                opcode: opcode.name(),
                offset: ip,
                then_sp,
                else_sp: self.sp,
            });
        }

        Ok((
            Stmt::If {
                cond,
                then_body,
                else_body,
            },
            else_end,
        ))
    }

    fn while_loop(&mut self, ip: usize, end: usize) -> Result<(Stmt, usize)> {
        let cond = Cond::NotFailed(self.top(ip)?);
        let body_len = self.operand(ip, 1, end)?;
        let body_start = ip + 2;
        let body_end = self.region(ip, body_start, body_len, end)?;

        let before = self.sp;
        let body = self.block(body_start, body_end)?;
        if self.sp != before {
            return Err(GenerationError::LoopMovesStack {
                rule: self.rule.to_string(),
                offset: ip,
                before,
                after: self.sp,
            });
        }
        Ok((Stmt::While { cond, body }, body_end))
    }

    /// Compile the instructions in `bc[start..end]`.
    fn block(&mut self, start: usize, end: usize) -> Result<Vec<Stmt>> {
        let mut out = Vec::new();
        let mut ip = start;

        while ip < end {
            let word = self.bc[ip];
            let opcode = Opcode::from_u32(word).ok_or_else(|| GenerationError::UnknownOpcode {
                rule: self.rule.to_string(),
                opcode: word,
                offset: ip,
            })?;

            match opcode {
                Opcode::Push => {
                    let c = self.constant(self.operand(ip, 1, end)?)?;
                    out.push(self.push(Expr::Const(c)));
                    ip += 2;
                }
                Opcode::PushCurrPos => {
                    out.push(self.push(Expr::CurrPos));
                    ip += 1;
                }
                Opcode::PushUndefined => {
                    out.push(self.push(Expr::Undefined));
                    ip += 1;
                }
                Opcode::PushNull => {
                    out.push(self.push(Expr::Null));
                    ip += 1;
                }
                Opcode::PushFailed => {
                    out.push(self.push(Expr::Failed));
                    ip += 1;
                }
                Opcode::PushEmptyArray => {
                    out.push(self.push(Expr::EmptyArray));
                    ip += 1;
                }
                Opcode::Pop => {
                    self.pop(1, ip)?;
                    ip += 1;
                }
                Opcode::PopCurrPos => {
                    let slot = self.top(ip)?;
                    out.push(Stmt::SetCurrPos(slot));
                    self.pop(1, ip)?;
                    ip += 1;
                }
                Opcode::PopN => {
                    let n = self.operand(ip, 1, end)?;
                    self.pop(n, ip)?;
                    ip += 2;
                }
                Opcode::Nip => {
                    let value = self.top(ip)?;
                    let below = self.index(1, ip)?;
                    out.push(Stmt::Assign {
                        slot: below,
                        value: Expr::Slot(value),
                    });
                    self.pop(1, ip)?;
                    ip += 1;
                }
                Opcode::Append => {
                    let value = self.top(ip)?;
                    let array = self.index(1, ip)?;
                    out.push(Stmt::Append { array, value });
                    self.pop(1, ip)?;
                    ip += 1;
                }
                Opcode::Wrap => {
                    let n = self.operand(ip, 1, end)?;
                    self.pop(n, ip)?;
                    let first = (self.sp + 1) as usize;
                    let slots: Vec<usize> = (first..first + n as usize).collect();
                    out.push(self.push(Expr::Array(slots)));
                    ip += 2;
                }
                Opcode::Text => {
                    let start = self.top(ip)?;
                    self.pop(1, ip)?;
                    out.push(self.push(Expr::Substring(start)));
                    ip += 1;
                }
                Opcode::If => {
                    let cond = Cond::Truthy(self.top(ip)?);
                    let (stmt, next) = self.condition(opcode, cond, ip, end, 0)?;
                    out.push(stmt);
                    ip = next;
                }
                Opcode::IfError => {
                    let cond = Cond::IsFailed(self.top(ip)?);
                    let (stmt, next) = self.condition(opcode, cond, ip, end, 0)?;
                    out.push(stmt);
                    ip = next;
                }
                Opcode::IfNotError => {
                    let cond = Cond::NotFailed(self.top(ip)?);
                    let (stmt, next) = self.condition(opcode, cond, ip, end, 0)?;
                    out.push(stmt);
                    ip = next;
                }
                Opcode::IfLt | Opcode::IfGe => {
                    let slot = self.top(ip)?;
                    let n = self.operand(ip, 1, end)?;
                    let cond = if opcode == Opcode::IfLt {
                        Cond::LengthLt(slot, n)
                    } else {
                        Cond::LengthGe(slot, n)
                    };
                    let (stmt, next) = self.condition(opcode, cond, ip, end, 1)?;
                    out.push(stmt);
                    ip = next;
                }
                Opcode::WhileNotError => {
                    let (stmt, next) = self.while_loop(ip, end)?;
                    out.push(stmt);
                    ip = next;
                }
                Opcode::MatchAny => {
                    let (stmt, next) = self.condition(opcode, Cond::AnyAvailable, ip, end, 0)?;
                    out.push(stmt);
                    ip = next;
                }
                Opcode::MatchString | Opcode::MatchStringIc => {
                    let c = self.operand(ip, 1, end)?;
                    self.literal_len(c)?;
                    let cond = if opcode == Opcode::MatchString {
                        Cond::MatchString(c as usize)
                    } else {
                        Cond::MatchStringIc(c as usize)
                    };
                    let (stmt, next) = self.condition(opcode, cond, ip, end, 1)?;
                    out.push(stmt);
                    ip = next;
                }
                Opcode::MatchRegexp => {
                    let c = self.constant(self.operand(ip, 1, end)?)?;
                    let (stmt, next) = self.condition(opcode, Cond::MatchClass(c), ip, end, 1)?;
                    out.push(stmt);
                    ip = next;
                }
                Opcode::AcceptN => {
                    let n = self.operand(ip, 1, end)? as usize;
                    out.push(self.push(Expr::Accept(n)));
                    out.push(Stmt::AdvanceCurrPos(n));
                    ip += 2;
                }
                Opcode::AcceptString => {
                    let c = self.operand(ip, 1, end)?;
                    let len = self.literal_len(c)?;
                    out.push(self.push(Expr::Const(c as usize)));
                    out.push(Stmt::AdvanceCurrPos(len));
                    ip += 2;
                }
                Opcode::Fail => {
                    let c = self.constant(self.operand(ip, 1, end)?)?;
                    out.push(self.push(Expr::Failed));
                    out.push(Stmt::ReportFail(c));
                    ip += 2;
                }
                Opcode::LoadSavedPos => {
                    let p = self.operand(ip, 1, end)?;
                    out.push(Stmt::SetSavedPos(Some(self.index(p, ip)?)));
                    ip += 2;
                }
                Opcode::UpdateSavedPos => {
                    out.push(Stmt::SetSavedPos(None));
                    ip += 1;
                }
                Opcode::Call => {
                    let function = self.constant(self.operand(ip, 1, end)?)?;
                    let n = self.operand(ip, 2, end)?;
                    let count = self.operand(ip, 3, end)? as usize;
                    let mut args = Vec::with_capacity(count.min(end - ip));
                    for k in 0..count {
                        let p = self.operand(ip, 4 + k, end)?;
                        args.push(self.index(p, ip)?);
                    }
                    self.pop(n, ip)?;
                    out.push(self.push(Expr::Call { function, args }));
                    ip += 4 + count;
                }
                Opcode::Rule => {
                    let index = self.operand(ip, 1, end)? as usize;
                    if index >= self.rule_count {
                        return Err(GenerationError::UndefinedRule {
                            rule: self.rule.to_string(),
                            referenced: format!("#{}", index),
                        });
                    }
                    out.push(self.push(Expr::Rule(index)));
                    ip += 2;
                }
                Opcode::SilentFailsOn => {
                    out.push(Stmt::SilentFailsOn);
                    ip += 1;
                }
                Opcode::SilentFailsOff => {
                    out.push(Stmt::SilentFailsOff);
                    ip += 1;
                }
                Opcode::Pluck => {
                    let n = self.operand(ip, 1, end)?;
                    let count = self.operand(ip, 2, end)? as usize;
                    let mut picked = Vec::with_capacity(count.min(end - ip));
                    for k in 0..count {
                        let p = self.operand(ip, 3 + k, end)?;
                        picked.push(self.index(p, ip)?);
                    }
                    self.pop(n, ip)?;
                    let value = if count == 1 {
                        Expr::Slot(picked[0])
                    } else {
                        Expr::Array(picked)
                    };
                    out.push(self.push(value));
                    ip += 3 + count;
                }
            }
        }

        Ok(out)
    }
}

/// Compile one rule's bytecode to a statement tree.
///
/// `rule_names` lists every rule of the grammar in order; `RULE` operands
/// index into it.
#[instrument(skip(bytecode, consts, rule_names), fields(len = bytecode.len()))]
pub fn compile_rule(
    rule_name: &str,
    bytecode: &[u32],
    consts: &ConstPool,
    rule_names: &[String],
) -> Result<CompiledRule> {
    let index = rule_names
        .iter()
        .position(|n| n == rule_name)
        .ok_or_else(|| GenerationError::UndefinedRule {
            rule: rule_name.to_string(),
            referenced: rule_name.to_string(),
        })?;
    let mut compiler = StackCompiler {
        rule: rule_name,
        bc: bytecode,
        consts,
        rule_count: rule_names.len(),
        sp: -1,
        max_sp: -1,
    };
    let body = compiler.block(0, bytecode.len())?;
    debug!(max_sp = compiler.max_sp, "compiled rule");

    Ok(CompiledRule {
        name: rule_name.to_string(),
        index,
        body,
        max_sp: compiler.max_sp,
    })
}

fn trace_result(rule_code: &str, result_code: &str) -> String {
    [
        format!("if ({} !== peg$FAILED) {{", result_code),
        "  peg$tracer.trace({".to_string(),
        "    type: \"rule.match\",".to_string(),
        format!("    rule: {},", rule_code),
        format!("    result: {},", result_code),
        "    location: peg$computeLocation(startPos, peg$currPos)".to_string(),
        "  });".to_string(),
        "} else {".to_string(),
        "  peg$tracer.trace({".to_string(),
        "    type: \"rule.fail\",".to_string(),
        format!("    rule: {},", rule_code),
        "    location: peg$computeLocation(startPos, startPos)".to_string(),
        "  });".to_string(),
        "}".to_string(),
    ]
    .join("\n")
}

/// Code run on rule entry: the enter trace and the memo lookup.
///
/// Shared by both backends; `rule_code` and `index_code` are JavaScript
/// expressions for the rule name and index.
pub(crate) fn rule_header(
    rule_code: &str,
    index_code: &str,
    rule_count: usize,
    options: &GenerateOptions,
) -> String {
    let mut parts = vec![String::new()];

    if options.trace {
        parts.push(
            [
                "peg$tracer.trace({".to_string(),
                "  type: \"rule.enter\",".to_string(),
                format!("  rule: {},", rule_code),
                "  location: peg$computeLocation(startPos, startPos)".to_string(),
                "});".to_string(),
                String::new(),
            ]
            .join("\n"),
        );
    }

    if options.cache {
        parts.push(
            [
                format!("const key = peg$currPos * {} + {};", rule_count, index_code),
                "const cached: ICached = peg$resultsCache[key];".to_string(),
                String::new(),
                "if (cached) {".to_string(),
                "  peg$currPos = cached.nextPos;".to_string(),
                String::new(),
            ]
            .join("\n"),
        );
        if options.trace {
            parts.push(indent2(&trace_result(rule_code, "cached.result")) + "\n");
        }
        parts.push("  return cached.result;\n}\n".to_string());
    }

    parts.join("\n")
}

/// Code run on rule exit: the memo store, the exit trace and the return.
pub(crate) fn rule_footer(rule_code: &str, result_code: &str, options: &GenerateOptions) -> String {
    let mut parts = Vec::new();
    if options.cache {
        parts.push(format!(
            "\npeg$resultsCache[key] = {{ nextPos: peg$currPos, result: {} }};",
            result_code
        ));
    }
    if options.trace {
        parts.push(format!("\n{}", trace_result(rule_code, result_code)));
    }
    parts.push(format!("\nreturn {};", result_code));
    parts.join("\n")
}

/// Renders statement trees as TypeScript.
struct Renderer<'a> {
    consts: &'a ConstPool,
    rule_names: &'a [String],
}

impl<'a> Renderer<'a> {
    fn literal_len(&self, c: usize) -> usize {
        self.consts
            .get(c)
            .and_then(Const::as_literal)
            .map(|s| s.encode_utf16().count())
            .unwrap_or(0)
    }

    fn expr(&self, e: &Expr) -> String {
        match e {
            Expr::Const(c) => format!("peg$c{}", c),
            Expr::CurrPos => "peg$currPos".to_string(),
            Expr::Undefined => "undefined".to_string(),
            Expr::Null => "null".to_string(),
            Expr::Failed => "peg$FAILED".to_string(),
            Expr::EmptyArray => "[]".to_string(),
            Expr::Slot(k) => format!("s{}", k),
            Expr::Array(slots) => format!("[{}]", slot_list(slots)),
            Expr::Substring(k) => format!("input.substring(s{}, peg$currPos)", k),
            Expr::Accept(1) => "input.charAt(peg$currPos)".to_string(),
            Expr::Accept(n) => format!("input.substr(peg$currPos, {})", n),
            Expr::Call { function, args } => format!("peg$c{}({})", function, slot_list(args)),
            Expr::Rule(index) => format!(
                "peg$parse{}()",
                self.rule_names.get(*index).map(String::as_str).unwrap_or("")
            ),
        }
    }

    fn cond(&self, cond: &Cond) -> String {
        match cond {
            Cond::Truthy(k) => format!("s{}", k),
            Cond::IsFailed(k) => format!("s{} === peg$FAILED", k),
            Cond::NotFailed(k) => format!("s{} !== peg$FAILED", k),
            Cond::AnyAvailable => "input.length > peg$currPos".to_string(),
            Cond::MatchString(c) => {
                let len = self.literal_len(*c);
                if len == 1 {
                    let code = self
                        .consts
                        .get(*c)
                        .and_then(Const::as_literal)
                        .and_then(|s| s.encode_utf16().next())
                        .unwrap_or(0);
                    format!("input.charCodeAt(peg$currPos) === {}", code)
                } else {
                    format!("input.substr(peg$currPos, {}) === peg$c{}", len, c)
                }
            }
            Cond::MatchStringIc(c) => format!(
                "input.substr(peg$currPos, {}).toLowerCase() === peg$c{}",
                self.literal_len(*c),
                c
            ),
            Cond::MatchClass(c) => format!("peg$c{}.test(input.charAt(peg$currPos))", c),
            Cond::LengthLt(k, n) => format!("s{}.length < {}", k, n),
            Cond::LengthGe(k, n) => format!("s{}.length >= {}", k, n),
        }
    }

    fn block(&self, out: &mut String, stmts: &[Stmt], depth: usize) {
        for stmt in stmts {
            self.stmt(out, stmt, depth);
        }
    }

    fn stmt(&self, out: &mut String, stmt: &Stmt, depth: usize) {
        let pad = "  ".repeat(depth);
        match stmt {
            Stmt::Assign { slot, value } => {
                writeln!(out, "{}s{} = {};", pad, slot, self.expr(value)).unwrap();
            }
            Stmt::SetCurrPos(k) => writeln!(out, "{}peg$currPos = s{};", pad, k).unwrap(),
            Stmt::AdvanceCurrPos(1) => writeln!(out, "{}peg$currPos++;", pad).unwrap(),
            Stmt::AdvanceCurrPos(n) => writeln!(out, "{}peg$currPos += {};", pad, n).unwrap(),
            Stmt::SetSavedPos(Some(k)) => writeln!(out, "{}peg$savedPos = s{};", pad, k).unwrap(),
            Stmt::SetSavedPos(None) => {
                writeln!(out, "{}peg$savedPos = peg$currPos;", pad).unwrap()
            }
            Stmt::Append { array, value } => {
                writeln!(out, "{}s{}.push(s{});", pad, array, value).unwrap()
            }
            Stmt::ReportFail(c) => writeln!(
                out,
                "{}if (peg$silentFails === 0) {{ peg$fail(peg$c{}); }}",
                pad, c
            )
            .unwrap(),
            Stmt::SilentFailsOn => writeln!(out, "{}peg$silentFails++;", pad).unwrap(),
            Stmt::SilentFailsOff => writeln!(out, "{}peg$silentFails--;", pad).unwrap(),
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                writeln!(out, "{}if ({}) {{", pad, self.cond(cond)).unwrap();
                self.block(out, then_body, depth + 1);
                if !else_body.is_empty() {
                    writeln!(out, "{}}} else {{", pad).unwrap();
                    self.block(out, else_body, depth + 1);
                }
                writeln!(out, "{}}}", pad).unwrap();
            }
            Stmt::While { cond, body } => {
                writeln!(out, "{}while ({}) {{", pad, self.cond(cond)).unwrap();
                self.block(out, body, depth + 1);
                writeln!(out, "{}}}", pad).unwrap();
            }
        }
    }
}

fn slot_list(slots: &[usize]) -> String {
    slots
        .iter()
        .map(|k| format!("s{}", k))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render only the body statements, without the function wrapper.
pub fn render_body(rule: &CompiledRule, consts: &ConstPool, rule_names: &[String]) -> String {
    let renderer = Renderer { consts, rule_names };
    let mut out = String::new();
    renderer.block(&mut out, &rule.body, 0);
    out.trim_end().to_string()
}

/// Render a compiled rule as a `peg$parse<rule>` function returning
/// `return_type`.
pub fn render_rule(
    rule: &CompiledRule,
    consts: &ConstPool,
    rule_names: &[String],
    return_type: &str,
    options: &GenerateOptions,
) -> String {
    let rule_code = format!("\"{}\"", string_escape(&rule.name));
    let mut parts = vec![format!(
        "function peg$parse{}(): {} {{",
        rule.name, return_type
    )];

    if options.trace {
        parts.push("  const startPos = peg$currPos;".to_string());
    }
    if rule.max_sp >= 0 {
        let locals: Vec<String> = (0..rule.slot_count()).map(|k| format!("s{}", k)).collect();
        parts.push(format!("  let {};", locals.join(", ")));
    }

    parts.push(indent2(&rule_header(
        &rule_code,
        &rule.index.to_string(),
        rule_names.len(),
        options,
    )));
    parts.push(indent2(&render_body(rule, consts, rule_names)));
    parts.push(indent2(&rule_footer(&rule_code, "s0", options)));
    parts.push("}".to_string());

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Expectation;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn literal_pool() -> ConstPool {
        let mut pool = ConstPool::new();
        pool.add_literal("a");
        pool.add_expectation(Expectation::literal("a", false));
        pool
    }

    #[test]
    fn test_compile_literal() {
        let pool = literal_pool();
        let rule = compile_rule("start", &[18, 0, 2, 2, 22, 0, 23, 1], &pool, &names(&["start"])).unwrap();
        assert_eq!(rule.max_sp, 0);
        assert_eq!(
            rule.body,
            vec![Stmt::If {
                cond: Cond::MatchString(0),
                then_body: vec![
                    Stmt::Assign {
                        slot: 0,
                        value: Expr::Const(0)
                    },
                    Stmt::AdvanceCurrPos(1),
                ],
                else_body: vec![
                    Stmt::Assign {
                        slot: 0,
                        value: Expr::Failed
                    },
                    Stmt::ReportFail(1),
                ],
            }]
        );
    }

    #[test]
    fn test_render_literal_rule() {
        let pool = literal_pool();
        let rule = compile_rule("start", &[18, 0, 2, 2, 22, 0, 23, 1], &pool, &names(&["start"])).unwrap();
        let code = render_rule(&rule, &pool, &names(&["start"]), "T_start", &GenerateOptions::default());
        let expected = [
            "function peg$parsestart(): T_start {",
            "  let s0;",
            "",
            "  if (input.charCodeAt(peg$currPos) === 97) {",
            "    s0 = peg$c0;",
            "    peg$currPos++;",
            "  } else {",
            "    s0 = peg$FAILED;",
            "    if (peg$silentFails === 0) { peg$fail(peg$c1); }",
            "  }",
            "",
            "  return s0;",
            "}",
        ]
        .join("\n");
        assert_eq!(code, expected);
    }

    #[test]
    fn test_multi_unit_literal_uses_substr() {
        let mut pool = ConstPool::new();
        pool.add_literal("abc");
        pool.add_expectation(Expectation::literal("abc", false));
        let rule = compile_rule("r", &[18, 0, 2, 2, 22, 0, 23, 1], &pool, &names(&["r"])).unwrap();
        let body = render_body(&rule, &pool, &names(&["r"]));
        assert!(body.contains("input.substr(peg$currPos, 3) === peg$c0"));
        assert!(body.contains("peg$currPos += 3;"));
    }

    #[test]
    fn test_sequence_locals_and_wrap() {
        // PUSH_CURR_POS, MATCH_ANY { ACCEPT_N 1 } { FAIL }, IF_NOT_ERROR
        //   { MATCH_ANY { ACCEPT_N 1 } { FAIL }, IF_NOT_ERROR { WRAP 2, NIP }
        //     { POP_N 2, POP_CURR_POS, PUSH_FAILED } }
        //   { POP, POP_CURR_POS, PUSH_FAILED }
        let mut pool = ConstPool::new();
        pool.add_expectation(Expectation::Any);
        let bc = [
            5, 17, 2, 2, 21, 1, 23, 0, 15, 17, 3, 17, 2, 2, 21, 1, 23, 0, 15, 3, 4, 11, 2, 9, 8, 2,
            7, 3, 6, 7, 3,
        ];
        let rule = compile_rule("pair", &bc, &pool, &names(&["pair"])).unwrap();
        assert_eq!(rule.max_sp, 2);
        let body = render_body(&rule, &pool, &names(&["pair"]));
        assert!(body.starts_with("s0 = peg$currPos;"));
        assert!(body.contains("s1 = [s1, s2];"));
        assert!(body.contains("s0 = s1;"));
        assert!(body.contains("peg$currPos = s0;"));

        let code = render_rule(&rule, &pool, &names(&["pair"]), "T_pair", &GenerateOptions::default());
        assert!(code.contains("  let s0, s1, s2;"));
    }

    #[test]
    fn test_loop_and_text() {
        // PUSH_CURR_POS, PUSH_EMPTY_ARRAY, MATCH_ANY.., WHILE_NOT_ERROR { APPEND, MATCH_ANY.. }, POP, POP, TEXT
        let mut pool = ConstPool::new();
        pool.add_expectation(Expectation::Any);
        let bc = [
            5, 4, 17, 2, 2, 21, 1, 23, 0, 16, 7, 10, 17, 2, 2, 21, 1, 23, 0, 6, 6, 12,
        ];
        let rule = compile_rule("chars", &bc, &pool, &names(&["chars"])).unwrap();
        let body = render_body(&rule, &pool, &names(&["chars"]));
        assert!(body.contains("while (s2 !== peg$FAILED) {"));
        assert!(body.contains("  s1.push(s2);"));
        assert!(body.ends_with("s0 = input.substring(s0, peg$currPos);"));
    }

    #[test]
    fn test_call_and_pluck_arguments() {
        let mut pool = ConstPool::new();
        pool.add_literal("x");
        // PUSH 0, PUSH 0, PUSH 0, CALL 0 2 2 [1 0], PLUCK 2 1 [1]
        let bc = [0, 0, 0, 0, 0, 0, 26, 0, 2, 2, 1, 0, 36, 2, 1, 1];
        let rule = compile_rule("r", &bc, &pool, &names(&["r"])).unwrap();
        let body = render_body(&rule, &pool, &names(&["r"]));
        assert!(body.contains("s1 = peg$c0(s1, s2);"));
        assert!(body.ends_with("s0 = s0;"));
    }

    #[test]
    fn test_rule_call_and_cache_header() {
        let pool = ConstPool::new();
        let rule = compile_rule("a", &[27, 1], &pool, &names(&["a", "b"])).unwrap();
        let opts = GenerateOptions::default().with_cache(true);
        let code = render_rule(&rule, &pool, &names(&["a", "b"]), "T_a", &opts);
        assert!(code.contains("s0 = peg$parseb();"));
        assert!(code.contains("const key = peg$currPos * 2 + 0;"));
        assert!(code.contains("peg$resultsCache[key] = { nextPos: peg$currPos, result: s0 };"));
    }

    #[test]
    fn test_trace_wraps_rule() {
        let pool = ConstPool::new();
        let rule = compile_rule("a", &[27, 0], &pool, &names(&["a"])).unwrap();
        let opts = GenerateOptions::default().with_trace(true);
        let code = render_rule(&rule, &pool, &names(&["a"]), "T_a", &opts);
        assert!(code.contains("  const startPos = peg$currPos;"));
        assert!(code.contains("type: \"rule.enter\""));
        assert!(code.contains("type: \"rule.match\""));
        assert!(code.contains("rule: \"a\","));
    }

    #[test]
    fn test_empty_body_omits_locals() {
        let pool = ConstPool::new();
        let rule = compile_rule("e", &[], &pool, &names(&["e"])).unwrap();
        assert_eq!(rule.max_sp, -1);
        let code = render_rule(&rule, &pool, &names(&["e"]), "T_e", &GenerateOptions::default());
        assert!(!code.contains("let "));
    }

    #[test]
    fn test_unbalanced_branches() {
        let mut pool = ConstPool::new();
        pool.add_literal("a");
        // PUSH_NULL, IF { PUSH_NULL } { }
        let err = compile_rule("bad", &[2, 13, 1, 0, 2], &pool, &names(&["bad"])).unwrap_err();
        assert!(matches!(
            err,
            GenerationError::UnbalancedBranches {
                opcode: "IF",
                then_sp: 1,
                else_sp: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_loop_must_not_move_stack() {
        let pool = ConstPool::new();
        // PUSH_NULL, WHILE_NOT_ERROR { PUSH_NULL }
        let err = compile_rule("bad", &[2, 16, 1, 2], &pool, &names(&["bad"])).unwrap_err();
        assert!(matches!(
            err,
            GenerationError::LoopMovesStack {
                before: 0,
                after: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_bytecode() {
        let pool = ConstPool::new();
        let n = names(&["r"]);
        assert!(matches!(
            compile_rule("r", &[6], &pool, &n),
            Err(GenerationError::StackUnderflow { offset: 0, .. })
        ));
        assert!(matches!(
            compile_rule("r", &[99], &pool, &n),
            Err(GenerationError::UnknownOpcode { opcode: 99, .. })
        ));
        assert!(matches!(
            compile_rule("r", &[2, 13, 5, 0], &pool, &n),
            Err(GenerationError::TruncatedBytecode { offset: 1, .. })
        ));
        assert!(matches!(
            compile_rule("r", &[0, 3], &pool, &n),
            Err(GenerationError::UnknownConstant { index: 3, .. })
        ));
        assert!(matches!(
            compile_rule("r", &[27, 4], &pool, &n),
            Err(GenerationError::UndefinedRule { .. })
        ));
    }

    #[test]
    fn test_huge_operands_underflow() {
        let mut pool = ConstPool::new();
        pool.add_literal("x");
        let n = names(&["r"]);
        let max = u32::MAX;
        let cases: [&[u32]; 6] = [
            &[2, 24, max],             // PUSH_NULL, LOAD_SAVED_POS max
            &[2, 8, max],              // PUSH_NULL, POP_N max
            &[2, 11, max],             // PUSH_NULL, WRAP max
            &[2, 26, 0, 0, 1, max],    // PUSH_NULL, CALL 0 0 [max]
            &[2, 26, 0, max, 0],       // PUSH_NULL, CALL 0 max []
            &[2, 36, 1, 1, max],       // PUSH_NULL, PLUCK 1 1 [max]
        ];
        for bc in cases {
            assert!(
                matches!(
                    compile_rule("r", bc, &pool, &n),
                    Err(GenerationError::StackUnderflow { offset: 1, .. })
                ),
                "{:?} was accepted",
                bc
            );
        }
        // Wrapping within the stack still works
        assert!(compile_rule("r", &[2, 2, 11, 2], &pool, &n).is_ok());
    }

    #[test]
    fn test_huge_lengths_are_truncated() {
        let pool = ConstPool::new();
        let n = names(&["r"]);
        let max = u32::MAX;
        assert!(matches!(
            compile_rule("r", &[2, 13, max, max], &pool, &n),
            Err(GenerationError::TruncatedBytecode { offset: 1, .. })
        ));
        assert!(matches!(
            compile_rule("r", &[2, 16, max], &pool, &n),
            Err(GenerationError::TruncatedBytecode { offset: 1, .. })
        ));
        // CALL with a huge argument count runs out of words
        let mut pool = ConstPool::new();
        pool.add_literal("x");
        assert!(matches!(
            compile_rule("r", &[2, 26, 0, 1, max, 0], &pool, &n),
            Err(GenerationError::TruncatedBytecode { offset: 1, .. })
        ));
    }

    #[test]
    fn test_rule_missing_from_names() {
        let pool = ConstPool::new();
        assert_eq!(
            compile_rule("c", &[], &pool, &names(&["a", "b"])).unwrap_err(),
            GenerationError::UndefinedRule {
                rule: "c".into(),
                referenced: "c".into()
            }
        );
    }
}
