//! Reference executors for compiled grammars.
//!
//! A [`Machine`] runs a [`CompiledGrammar`] the way the emitted parser
//! would, in one of two ways:
//! - [`Backend::Speed`] walks the statement trees produced by the speed
//!   compiler, slot by slot
//! - [`Backend::Size`] runs the raw bytecode through the same `ips`/`ends`
//!   dispatch loop as the emitted interpreter
//!
//! Both share the parser state (positions, furthest failure, silencing,
//! memo table) and report syntax errors exactly like the generated module.
//! User functions are delegated to a [`Host`].

use crate::bytecode::CompiledGrammar;
use crate::codegen::speed::{compile_rule, CompiledRule, Cond, Expr, Stmt};
use crate::consts::{Const, FunctionConst, FunctionKind};
use crate::error::Result;
use crate::opcodes::Opcode;
use crate::runtime::{Expectation, ParseSyntaxError, PositionTracker};
use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

/// A runtime value on the parser stack.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    /// The `peg$FAILED` sentinel
    Failed,
    Undefined,
    Null,
    Bool(bool),
    Number(OrderedFloat<f64>),
    Str(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn number(n: f64) -> Self {
        Value::Number(OrderedFloat(n))
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Value::Failed)
    }

    /// JavaScript truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Failed | Value::Array(_) => true,
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.0 != 0.0 && !n.0.is_nan(),
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// The value as an input position (positions are always numbers).
    fn as_pos(&self) -> usize {
        match self {
            Value::Number(n) if n.0 > 0.0 => n.0 as usize,
            _ => 0,
        }
    }

    fn length(&self) -> usize {
        match self {
            Value::Array(items) => items.len(),
            Value::Str(s) => s.encode_utf16().count(),
            _ => 0,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Failed => write!(f, "<failed>"),
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A user function invocation.
#[derive(Clone, Debug)]
pub struct CallSite<'a> {
    /// Position of the function in the constants pool
    pub index: usize,
    pub function: &'a FunctionConst,
    /// Label values, in parameter order
    pub args: Vec<Value>,
    /// Matched text between the saved and current position
    pub text: String,
    pub saved_pos: usize,
    pub curr_pos: usize,
}

/// Evaluates action and predicate code on behalf of the machine.
pub trait Host {
    fn call(&mut self, site: CallSite<'_>) -> Value;
}

impl<F> Host for F
where
    F: FnMut(CallSite<'_>) -> Value,
{
    fn call(&mut self, site: CallSite<'_>) -> Value {
        self(site)
    }
}

/// A host that runs no user code: actions return their arguments as an
/// array and predicates always succeed.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralHost;

impl Host for StructuralHost {
    fn call(&mut self, site: CallSite<'_>) -> Value {
        match site.function.kind {
            FunctionKind::Action => Value::Array(site.args),
            FunctionKind::Predicate => Value::Bool(true),
        }
    }
}

/// Which executor runs the rules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Backend {
    #[default]
    Speed,
    Size,
}

/// Failure to run a parse at all, or a syntax error in the input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("Can't start parsing from rule \"{0}\".")]
    UnknownStartRule(String),

    #[error(transparent)]
    Syntax(#[from] ParseSyntaxError),
}

/// Executes a compiled grammar against input strings.
pub struct Machine<'g, H: Host = StructuralHost> {
    compiled: &'g CompiledGrammar,
    rules: Vec<CompiledRule>,
    backend: Backend,
    cache: bool,
    source: Option<String>,
    host: H,
}

impl<'g> Machine<'g, StructuralHost> {
    pub fn new(compiled: &'g CompiledGrammar, backend: Backend) -> Result<Self> {
        Self::with_host(compiled, backend, StructuralHost)
    }
}

impl<'g, H: Host> Machine<'g, H> {
    /// Build a machine; every rule is compiled up front, so malformed
    /// bytecode is rejected here rather than during a parse.
    pub fn with_host(compiled: &'g CompiledGrammar, backend: Backend, host: H) -> Result<Self> {
        let names = compiled.rule_names();
        let rules = compiled
            .rules
            .iter()
            .map(|r| compile_rule(&r.name, &r.bytecode, &compiled.consts, &names))
            .collect::<Result<Vec<_>>>()?;
        debug!(rules = rules.len(), ?backend, "machine ready");
        Ok(Machine {
            compiled,
            rules,
            backend,
            cache: false,
            source: None,
            host,
        })
    }

    /// Memoize rule results per position.
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    /// Source name reported in error locations.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Parse `input` from the first rule.
    pub fn parse(&mut self, input: &str) -> std::result::Result<Value, RunError> {
        self.parse_from(input, None)
    }

    /// Parse `input` from `start_rule`, or the first rule for `None`.
    pub fn parse_from(
        &mut self,
        input: &str,
        start_rule: Option<&str>,
    ) -> std::result::Result<Value, RunError> {
        let start = match start_rule {
            Some(name) => self
                .compiled
                .index_of(name)
                .ok_or_else(|| RunError::UnknownStartRule(name.to_string()))?,
            None => 0,
        };
        if self.compiled.rules.is_empty() {
            return Err(RunError::UnknownStartRule(String::new()));
        }

        let mut run = Run {
            compiled: self.compiled,
            rules: &self.rules,
            backend: self.backend,
            cache: self.cache,
            host: &mut self.host,
            input: input.encode_utf16().collect(),
            curr_pos: 0,
            saved_pos: 0,
            max_fail_pos: 0,
            max_fail_expected: Vec::new(),
            silent_fails: 0,
            results: FxHashMap::default(),
        };
        let result = run.call_rule(start);
        run.finish(result, self.source.as_deref())
            .map_err(RunError::Syntax)
    }
}

/// Instruction pointer and block bounds of the size-backend dispatch loop.
///
/// Entering a block saves the enclosing `end` and the resume address on
/// explicit stacks instead of recursing.
struct Frame {
    ip: usize,
    end: usize,
    ips: Vec<usize>,
    ends: Vec<usize>,
}

impl Frame {
    fn new(end: usize) -> Self {
        Frame {
            ip: 0,
            end,
            ips: Vec::new(),
            ends: Vec::new(),
        }
    }

    /// Enter the then or else block of the conditional at `ip`.
    fn branch(&mut self, bc: &[u32], cond: bool, args: usize) {
        let base = args + 3;
        let then_len = bc[self.ip + base - 2] as usize;
        let else_len = bc[self.ip + base - 1] as usize;
        self.ends.push(self.end);
        self.ips.push(self.ip + base + then_len + else_len);
        if cond {
            self.end = self.ip + base + then_len;
            self.ip += base;
        } else {
            self.end = self.ip + base + then_len + else_len;
            self.ip += base + then_len;
        }
    }

    /// Enter the loop body at `ip`, or skip past it. The loop instruction
    /// is revisited after every pass.
    fn enter_loop(&mut self, bc: &[u32], cond: bool) {
        let body = bc[self.ip + 1] as usize;
        if cond {
            self.ends.push(self.end);
            self.ips.push(self.ip);
            self.end = self.ip + 2 + body;
            self.ip += 2;
        } else {
            self.ip += 2 + body;
        }
    }

    /// Return to the enclosing block; false at the top level.
    fn resume(&mut self) -> bool {
        match (self.ends.pop(), self.ips.pop()) {
            (Some(end), Some(ip)) => {
                self.end = end;
                self.ip = ip;
                true
            }
            _ => false,
        }
    }
}

/// State of one parse.
struct Run<'m, H: Host> {
    compiled: &'m CompiledGrammar,
    rules: &'m [CompiledRule],
    backend: Backend,
    cache: bool,
    host: &'m mut H,
    input: Vec<u16>,
    curr_pos: usize,
    saved_pos: usize,
    max_fail_pos: usize,
    max_fail_expected: Vec<Expectation>,
    silent_fails: u32,
    results: FxHashMap<(usize, usize), (usize, Value)>,
}

impl<'m, H: Host> Run<'m, H> {
    fn text(&self, start: usize, end: usize) -> String {
        let end = end.min(self.input.len());
        let start = start.min(end);
        String::from_utf16_lossy(&self.input[start..end])
    }

    fn fail(&mut self, expectation: &Expectation) {
        if self.curr_pos < self.max_fail_pos {
            return;
        }
        if self.curr_pos > self.max_fail_pos {
            self.max_fail_pos = self.curr_pos;
            self.max_fail_expected.clear();
        }
        self.max_fail_expected.push(expectation.clone());
    }

    fn report_fail(&mut self, index: usize) {
        if self.silent_fails > 0 {
            return;
        }
        let compiled = self.compiled;
        if let Some(Const::Expectation(e)) = compiled.consts.get(index) {
            self.fail(e);
        }
    }

    fn constant(&self, index: usize) -> Value {
        match self.compiled.consts.get(index) {
            Some(Const::Literal(s)) => Value::Str(s.clone()),
            _ => Value::Undefined,
        }
    }

    fn call_function(&mut self, index: usize, args: Vec<Value>) -> Value {
        let compiled = self.compiled;
        let Some(function) = compiled.consts.get(index).and_then(Const::as_function) else {
            return Value::Undefined;
        };
        let site = CallSite {
            index,
            function,
            args,
            text: self.text(self.saved_pos, self.curr_pos),
            saved_pos: self.saved_pos,
            curr_pos: self.curr_pos,
        };
        self.host.call(site)
    }

    fn literal_at(&self, index: usize, ignore_case: bool) -> bool {
        let Some(literal) = self.compiled.consts.get(index).and_then(Const::as_literal) else {
            return false;
        };
        let units: Vec<u16> = literal.encode_utf16().collect();
        let end = self.curr_pos + units.len();
        if end > self.input.len() {
            return false;
        }
        let window = &self.input[self.curr_pos..end];
        if ignore_case {
            String::from_utf16_lossy(window).to_lowercase() == literal
        } else {
            window == units.as_slice()
        }
    }

    fn class_at(&self, index: usize) -> bool {
        let Some(Const::Class {
            parts,
            inverted,
            ignore_case,
        }) = self.compiled.consts.get(index)
        else {
            return false;
        };
        let Some(&unit) = self.input.get(self.curr_pos) else {
            return false;
        };
        let Some(c) = char::from_u32(unit as u32) else {
            // A lone surrogate only matches an inverted class
            return *inverted;
        };
        let hit = |c: char| parts.iter().any(|p| p.contains(c));
        let mut matched = hit(c);
        if !matched && *ignore_case {
            matched = c.to_lowercase().any(hit) || c.to_uppercase().any(hit);
        }
        matched != *inverted
    }

    fn rule_name(&self, index: usize) -> &'m str {
        let compiled = self.compiled;
        compiled
            .rules
            .get(index)
            .map(|r| r.name.as_str())
            .unwrap_or("")
    }

    /// Run rule `index` with memoization and tracing around it.
    fn call_rule(&mut self, index: usize) -> Value {
        let start = self.curr_pos;
        let name = self.rule_name(index);
        trace!(event = "rule.enter", rule = name, offset = start);

        if self.cache {
            if let Some((next, result)) = self.results.get(&(start, index)) {
                self.curr_pos = *next;
                let result = result.clone();
                self.trace_exit(name, start, &result);
                return result;
            }
        }

        let result = match self.backend {
            Backend::Speed => self.run_compiled(index),
            Backend::Size => self.interpret(index),
        };

        if self.cache {
            self.results
                .insert((start, index), (self.curr_pos, result.clone()));
        }
        self.trace_exit(name, start, &result);
        result
    }

    fn trace_exit(&self, name: &str, start: usize, result: &Value) {
        if result.is_failed() {
            trace!(event = "rule.fail", rule = name, offset = start);
        } else {
            trace!(event = "rule.match", rule = name, start, end = self.curr_pos);
        }
    }

    // Speed backend

    fn run_compiled(&mut self, index: usize) -> Value {
        let rules = self.rules;
        let rule = &rules[index];
        let mut slots = vec![Value::Undefined; rule.slot_count()];
        self.exec_block(&rule.body, &mut slots);
        slots.into_iter().next().unwrap_or(Value::Undefined)
    }

    fn exec_block(&mut self, stmts: &'m [Stmt], slots: &mut [Value]) {
        for stmt in stmts {
            self.exec(stmt, slots);
        }
    }

    fn exec(&mut self, stmt: &'m Stmt, slots: &mut [Value]) {
        match stmt {
            Stmt::Assign { slot, value } => {
                let v = self.eval(value, slots);
                slots[*slot] = v;
            }
            Stmt::SetCurrPos(k) => self.curr_pos = slots[*k].as_pos(),
            Stmt::AdvanceCurrPos(n) => self.curr_pos += n,
            Stmt::SetSavedPos(Some(k)) => self.saved_pos = slots[*k].as_pos(),
            Stmt::SetSavedPos(None) => self.saved_pos = self.curr_pos,
            Stmt::Append { array, value } => {
                let v = slots[*value].clone();
                if let Value::Array(items) = &mut slots[*array] {
                    items.push(v);
                }
            }
            Stmt::ReportFail(c) => self.report_fail(*c),
            Stmt::SilentFailsOn => self.silent_fails += 1,
            Stmt::SilentFailsOff => self.silent_fails = self.silent_fails.saturating_sub(1),
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                if self.test(cond, slots) {
                    self.exec_block(then_body, slots);
                } else {
                    self.exec_block(else_body, slots);
                }
            }
            Stmt::While { cond, body } => {
                while self.test(cond, slots) {
                    self.exec_block(body, slots);
                }
            }
        }
    }

    fn eval(&mut self, expr: &Expr, slots: &[Value]) -> Value {
        match expr {
            Expr::Const(c) => self.constant(*c),
            Expr::CurrPos => Value::number(self.curr_pos as f64),
            Expr::Undefined => Value::Undefined,
            Expr::Null => Value::Null,
            Expr::Failed => Value::Failed,
            Expr::EmptyArray => Value::Array(Vec::new()),
            Expr::Slot(k) => slots[*k].clone(),
            Expr::Array(ks) => Value::Array(ks.iter().map(|k| slots[*k].clone()).collect()),
            Expr::Substring(k) => Value::Str(self.text(slots[*k].as_pos(), self.curr_pos)),
            Expr::Accept(n) => Value::Str(self.text(self.curr_pos, self.curr_pos + n)),
            Expr::Call { function, args } => {
                let args = args.iter().map(|k| slots[*k].clone()).collect();
                self.call_function(*function, args)
            }
            Expr::Rule(index) => self.call_rule(*index),
        }
    }

    fn test(&self, cond: &Cond, slots: &[Value]) -> bool {
        match cond {
            Cond::Truthy(k) => slots[*k].is_truthy(),
            Cond::IsFailed(k) => slots[*k].is_failed(),
            Cond::NotFailed(k) => !slots[*k].is_failed(),
            Cond::AnyAvailable => self.input.len() > self.curr_pos,
            Cond::MatchString(c) => self.literal_at(*c, false),
            Cond::MatchStringIc(c) => self.literal_at(*c, true),
            Cond::MatchClass(c) => self.class_at(*c),
            Cond::LengthLt(k, n) => slots[*k].length() < *n as usize,
            Cond::LengthGe(k, n) => slots[*k].length() >= *n as usize,
        }
    }

    // Size backend

    fn interpret(&mut self, index: usize) -> Value {
        let compiled = self.compiled;
        let bc = compiled.rules[index].bytecode.as_slice();
        let mut frame = Frame::new(bc.len());
        let mut stack: Vec<Value> = Vec::new();

        let word = |i: usize| bc[i] as usize;

        loop {
            while frame.ip < frame.end {
                let ip = frame.ip;
                let Some(opcode) = Opcode::from_u32(bc[ip]) else {
                    break;
                };

                match opcode {
                    Opcode::Push => {
                        stack.push(self.constant(word(ip + 1)));
                        frame.ip += 2;
                    }
                    Opcode::PushUndefined => {
                        stack.push(Value::Undefined);
                        frame.ip += 1;
                    }
                    Opcode::PushNull => {
                        stack.push(Value::Null);
                        frame.ip += 1;
                    }
                    Opcode::PushFailed => {
                        stack.push(Value::Failed);
                        frame.ip += 1;
                    }
                    Opcode::PushEmptyArray => {
                        stack.push(Value::Array(Vec::new()));
                        frame.ip += 1;
                    }
                    Opcode::PushCurrPos => {
                        stack.push(Value::number(self.curr_pos as f64));
                        frame.ip += 1;
                    }
                    Opcode::Pop => {
                        stack.pop();
                        frame.ip += 1;
                    }
                    Opcode::PopCurrPos => {
                        self.curr_pos = stack.pop().map(|v| v.as_pos()).unwrap_or(0);
                        frame.ip += 1;
                    }
                    Opcode::PopN => {
                        let keep = stack.len().saturating_sub(word(ip + 1));
                        stack.truncate(keep);
                        frame.ip += 2;
                    }
                    Opcode::Nip => {
                        let len = stack.len();
                        stack.remove(len - 2);
                        frame.ip += 1;
                    }
                    Opcode::Append => {
                        if let Some(v) = stack.pop() {
                            if let Some(Value::Array(items)) = stack.last_mut() {
                                items.push(v);
                            }
                        }
                        frame.ip += 1;
                    }
                    Opcode::Wrap => {
                        let at = stack.len() - word(ip + 1);
                        let items = stack.split_off(at);
                        stack.push(Value::Array(items));
                        frame.ip += 2;
                    }
                    Opcode::Text => {
                        let start = stack.pop().map(|v| v.as_pos()).unwrap_or(0);
                        stack.push(Value::Str(self.text(start, self.curr_pos)));
                        frame.ip += 1;
                    }
                    Opcode::If => {
                        let cond = stack.last().map(Value::is_truthy).unwrap_or(false);
                        frame.branch(bc, cond, 0);
                    }
                    Opcode::IfError => {
                        let cond = stack.last().map(Value::is_failed).unwrap_or(false);
                        frame.branch(bc, cond, 0);
                    }
                    Opcode::IfNotError => {
                        let cond = stack.last().map(|v| !v.is_failed()).unwrap_or(false);
                        frame.branch(bc, cond, 0);
                    }
                    Opcode::IfLt | Opcode::IfGe => {
                        let len = stack.last().map(Value::length).unwrap_or(0);
                        let n = word(ip + 1);
                        let cond = if opcode == Opcode::IfLt { len < n } else { len >= n };
                        frame.branch(bc, cond, 1);
                    }
                    Opcode::WhileNotError => {
                        let cond = stack.last().map(|v| !v.is_failed()).unwrap_or(false);
                        frame.enter_loop(bc, cond);
                    }
                    Opcode::MatchAny => {
                        let cond = self.input.len() > self.curr_pos;
                        frame.branch(bc, cond, 0);
                    }
                    Opcode::MatchString => {
                        let cond = self.literal_at(word(ip + 1), false);
                        frame.branch(bc, cond, 1);
                    }
                    Opcode::MatchStringIc => {
                        let cond = self.literal_at(word(ip + 1), true);
                        frame.branch(bc, cond, 1);
                    }
                    Opcode::MatchRegexp => {
                        let cond = self.class_at(word(ip + 1));
                        frame.branch(bc, cond, 1);
                    }
                    Opcode::AcceptN => {
                        let n = word(ip + 1);
                        stack.push(Value::Str(self.text(self.curr_pos, self.curr_pos + n)));
                        self.curr_pos += n;
                        frame.ip += 2;
                    }
                    Opcode::AcceptString => {
                        let value = self.constant(word(ip + 1));
                        self.curr_pos += value.length();
                        stack.push(value);
                        frame.ip += 2;
                    }
                    Opcode::Fail => {
                        stack.push(Value::Failed);
                        self.report_fail(word(ip + 1));
                        frame.ip += 2;
                    }
                    Opcode::LoadSavedPos => {
                        let p = word(ip + 1);
                        self.saved_pos = stack[stack.len() - 1 - p].as_pos();
                        frame.ip += 2;
                    }
                    Opcode::UpdateSavedPos => {
                        self.saved_pos = self.curr_pos;
                        frame.ip += 1;
                    }
                    Opcode::Call => {
                        let count = word(ip + 3);
                        let args: Vec<Value> = bc[ip + 4..ip + 4 + count]
                            .iter()
                            .map(|&p| stack[stack.len() - 1 - p as usize].clone())
                            .collect();
                        let keep = stack.len() - word(ip + 2);
                        stack.truncate(keep);
                        let value = self.call_function(word(ip + 1), args);
                        stack.push(value);
                        frame.ip += 4 + count;
                    }
                    Opcode::Rule => {
                        let value = self.call_rule(word(ip + 1));
                        stack.push(value);
                        frame.ip += 2;
                    }
                    Opcode::SilentFailsOn => {
                        self.silent_fails += 1;
                        frame.ip += 1;
                    }
                    Opcode::SilentFailsOff => {
                        self.silent_fails = self.silent_fails.saturating_sub(1);
                        frame.ip += 1;
                    }
                    Opcode::Pluck => {
                        let count = word(ip + 2);
                        let mut picked: Vec<Value> = bc[ip + 3..ip + 3 + count]
                            .iter()
                            .map(|&p| stack[stack.len() - 1 - p as usize].clone())
                            .collect();
                        let keep = stack.len() - word(ip + 1);
                        stack.truncate(keep);
                        if count == 1 {
                            stack.push(picked.remove(0));
                        } else {
                            stack.push(Value::Array(picked));
                        }
                        frame.ip += 3 + count;
                    }
                }
            }

            if !frame.resume() {
                break;
            }
        }

        stack.into_iter().next().unwrap_or(Value::Undefined)
    }

    /// The end-of-parse check of the generated `peg$parse`.
    fn finish(
        mut self,
        result: Value,
        source: Option<&str>,
    ) -> std::result::Result<Value, ParseSyntaxError> {
        let len = self.input.len();
        if !result.is_failed() && self.curr_pos == len {
            return Ok(result);
        }
        if !result.is_failed() && self.curr_pos < len {
            self.fail(&Expectation::End);
        }

        let pos = self.max_fail_pos;
        let found = (pos < len).then(|| self.text(pos, pos + 1));
        let mut tracker = PositionTracker::from_units(std::mem::take(&mut self.input));
        if let Some(source) = source {
            tracker = tracker.with_source(source);
        }
        let location = if found.is_some() {
            tracker.location(pos, pos + 1)
        } else {
            tracker.location(pos, pos)
        };
        Err(ParseSyntaxError::structured(
            self.max_fail_expected,
            found,
            location,
        ))
    }
}
