//! TypeScript Code Generation
//!
//! This module turns a typed grammar and its bytecode into the source of a
//! standalone TypeScript parser module. Two backends share everything but
//! the rule bodies:
//!
//! 1. **Speed**: every rule becomes a structured `peg$parse<rule>` function
//!    compiled from its bytecode by stack-effect simulation
//! 2. **Size**: the bytecode is encoded into strings and run by one generic
//!    interpreter, `peg$parseRule`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Code Generation Pipeline                        │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────────────┐  │
//! │  │ Grammar      │───►│ Type         │───►│ Bytecode + constants     │  │
//! │  │ (rules)      │    │ Inference    │    │ (typed action functions) │  │
//! │  └──────────────┘    │              │    └──────────────────────────┘  │
//! │                      │ - T_<rule>   │              │                   │
//! │                      │ - fixpoint   │      ┌───────┴───────┐           │
//! │                      └──────────────┘      ▼               ▼           │
//! │                                   ┌──────────────┐ ┌──────────────┐    │
//! │                                   │ speed:       │ │ size:        │    │
//! │                                   │ rule funcs   │ │ interpreter  │    │
//! │                                   └──────────────┘ └──────────────┘    │
//! │                                            └───────┬───────┘           │
//! │                                                    ▼                   │
//! │                                          ┌──────────────────────────┐  │
//! │                                          │ Emitter: runtime, error  │  │
//! │                                          │ class, module wrapper    │  │
//! │                                          └──────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ## Input Grammar
//! ```text
//! start = "a" / "b"
//! ```
//!
//! ## Generated Rule (speed backend)
//! ```text
//! function peg$parsestart(): T_start {
//!   let s0;
//!
//!   if (input.charCodeAt(peg$currPos) === 97) {
//!     s0 = peg$c0;
//!     peg$currPos++;
//!   } else {
//!     s0 = peg$FAILED;
//!     if (peg$silentFails === 0) { peg$fail(peg$c1); }
//!   }
//!   ...
//!
//!   return s0;
//! }
//! ```

pub mod analysis;
pub mod emitter;
pub mod size;
pub mod speed;
pub mod tables;

pub use analysis::{infer_types, validate, RuleType, RuleTypeMap, TypeInference};
pub use emitter::Emitter;
pub use size::generate_interpreter;
pub use speed::{compile_rule, render_rule, CompiledRule};
pub use tables::{encode_bytecode, size_tables, speed_tables};

/// Indent every non-empty line of `code` by two spaces.
pub(crate) fn indent2(code: &str) -> String {
    code.split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("  {}", line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
