//! tspeg: typed TypeScript code generation for PEG grammars.
//!
//! This crate provides:
//! - Grammar IR with serde interchange for a front-end
//! - Type inference for every rule and expression
//! - Lowering to stack-machine bytecode with a shared constants pool
//! - Two TypeScript backends: structured rule functions (speed) and an
//!   encoded-bytecode interpreter (size)
//! - A Rust model of the emitted runtime (error messages, positions)
//! - Reference executors that run compiled grammars on either backend

pub mod ast;
pub mod bytecode;
pub mod codegen;
pub mod consts;
pub mod error;
pub mod machine;
pub mod opcodes;
pub mod options;
pub mod runtime;

// Re-exports for convenience
pub use ast::{ClassPart, CodeBlock, ExprKind, Expression, Grammar, Rule};
pub use bytecode::{generate_bytecode, CompiledGrammar, RuleBytecode};
pub use codegen::{infer_types, Emitter, RuleType, RuleTypeMap};
pub use consts::{Const, ConstPool, FunctionConst, FunctionKind};
pub use error::{GenerationError, Result};
pub use machine::{Backend, CallSite, Host, Machine, RunError, StructuralHost, Value};
pub use opcodes::Opcode;
pub use options::{GenerateOptions, InferOptions, ModuleFormat, Optimize};
pub use runtime::{Expectation, FilePosition, FileRange, ParseSyntaxError, PositionTracker};

use tracing::{debug, instrument};

/// Output of a generation run
#[derive(Clone, Debug)]
pub struct GeneratedParser {
    /// TypeScript module source
    pub code: String,
    /// Inferred result type of every rule, in grammar order
    pub rule_types: RuleTypeMap,
    /// Bytecode and constants the module was generated from
    pub compiled: CompiledGrammar,
}

impl GeneratedParser {
    /// A reference machine over this parser's bytecode.
    pub fn machine(&self, backend: Backend) -> Result<Machine<'_>> {
        Machine::new(&self.compiled, backend)
    }
}

/// Run the whole pipeline: validate, infer types, lower to bytecode and
/// emit the module.
///
/// The grammar is annotated in place with the inferred types.
#[instrument(skip_all, fields(rules = grammar.len(), optimize = ?options.optimize))]
pub fn generate(grammar: &mut Grammar, options: &GenerateOptions) -> Result<GeneratedParser> {
    let start_rules = options.start_rules(grammar);
    codegen::validate(grammar, &start_rules)?;

    let rule_types = infer_types(grammar, &options.infer_options())?;
    let compiled = generate_bytecode(grammar, options)?;
    let code = Emitter::new(grammar, &compiled, &rule_types, options).emit()?;

    debug!(
        consts = compiled.consts.len(),
        bytes = code.len(),
        "generated parser"
    );
    Ok(GeneratedParser {
        code,
        rule_types,
        compiled,
    })
}
