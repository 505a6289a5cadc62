//! Errors raised while analysing or compiling a grammar.
//!
//! Every variant is fatal: a generation run that hits one produces no
//! output at all.

use thiserror::Error;

/// Generation error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Cyclic rule reference in: {}", .rules.join(", "))]
    CyclicRuleReference { rules: Vec<String> },

    #[error("Inconsistent types for rule {rule}: declared {declared}, returnTypes has {configured}")]
    InconsistentTypes {
        rule: String,
        declared: String,
        configured: String,
    },

    #[error("rule {rule}: label type is not resolved")]
    UnresolvedType { rule: String },

    #[error("rule {rule}: invalid opcode {opcode} at offset {offset}")]
    UnknownOpcode {
        rule: String,
        opcode: u32,
        offset: usize,
    },

    #[error(
        "rule {rule}: Branches of a condition must move the stack pointer in the same way \
         ({opcode} at offset {offset}: then {then_sp}, else {else_sp})"
    )]
    UnbalancedBranches {
        rule: String,
        opcode: &'static str,
        offset: usize,
        then_sp: i32,
        else_sp: i32,
    },

    #[error(
        "rule {rule}: Body of a loop can't move the stack pointer \
         (offset {offset}: before {before}, after {after})"
    )]
    LoopMovesStack {
        rule: String,
        offset: usize,
        before: i32,
        after: i32,
    },

    #[error("rule {rule}: stack underflow at offset {offset}")]
    StackUnderflow { rule: String, offset: usize },

    #[error("rule {rule}: bytecode ends inside the instruction at offset {offset}")]
    TruncatedBytecode { rule: String, offset: usize },

    #[error("rule {rule}: constant {index} is not in the pool")]
    UnknownConstant { rule: String, index: usize },

    #[error("rule {rule}: word {word} can't be encoded as a UTF-16 code unit")]
    UnencodableBytecode { rule: String, word: u32 },

    #[error("Rule \"{referenced}\" is not defined (referenced from \"{rule}\")")]
    UndefinedRule { rule: String, referenced: String },

    #[error("Rule \"{name}\" is already defined")]
    DuplicateRule { name: String },

    #[error("grammar has no rules")]
    EmptyGrammar,

    #[error("Unknown start rule \"{rule}\"")]
    UnknownStartRule { rule: String },
}

impl GenerationError {
    /// The rule the error is attributed to, when there is exactly one.
    pub fn rule(&self) -> Option<&str> {
        use GenerationError::*;
        match self {
            InconsistentTypes { rule, .. }
            | UnresolvedType { rule }
            | UnknownOpcode { rule, .. }
            | UnbalancedBranches { rule, .. }
            | LoopMovesStack { rule, .. }
            | StackUnderflow { rule, .. }
            | TruncatedBytecode { rule, .. }
            | UnknownConstant { rule, .. }
            | UnencodableBytecode { rule, .. }
            | UndefinedRule { rule, .. }
            | UnknownStartRule { rule } => Some(rule),
            DuplicateRule { name } => Some(name),
            CyclicRuleReference { .. } | EmptyGrammar => None,
        }
    }
}

/// Result type for generation operations.
pub type Result<T> = std::result::Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_message() {
        let err = GenerationError::CyclicRuleReference {
            rules: vec!["rule1".into(), "rule2".into()],
        };
        assert_eq!(err.to_string(), "Cyclic rule reference in: rule1, rule2");
        assert_eq!(err.rule(), None);
    }

    #[test]
    fn test_inconsistent_message() {
        let err = GenerationError::InconsistentTypes {
            rule: "start".into(),
            declared: "string".into(),
            configured: "number".into(),
        };
        assert!(err
            .to_string()
            .starts_with("Inconsistent types for rule start"));
        assert_eq!(err.rule(), Some("start"));
    }
}
