//! Bytecode instruction set.
//!
//! Each rule compiles to a flat sequence of 32-bit words: an opcode followed
//! by its operands. Conditionals and loops carry the lengths of their blocks
//! inline, so the sequence can be decoded without a symbol table:
//!
//! ```text
//!   IF_ERROR  thenLen elseLen  <then ...> <else ...>
//!   MATCH_STRING c  thenLen elseLen  <then ...> <else ...>
//!   WHILE_NOT_ERROR bodyLen  <body ...>
//!   CALL f n pc p1 .. pc
//! ```
//!
//! Numbering is shared with the JavaScript interpreter emitted by the size
//! backend, so it must never change.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    // Stack manipulation
    Push = 0,
    PushUndefined = 1,
    PushNull = 2,
    PushFailed = 3,
    PushEmptyArray = 4,
    PushCurrPos = 5,
    Pop = 6,
    PopCurrPos = 7,
    PopN = 8,
    Nip = 9,
    Append = 10,
    Wrap = 11,
    Text = 12,

    // Conditions and loops
    If = 13,
    IfError = 14,
    IfNotError = 15,
    WhileNotError = 16,

    // Matching
    MatchAny = 17,
    MatchString = 18,
    MatchStringIc = 19,
    MatchRegexp = 20,
    AcceptN = 21,
    AcceptString = 22,
    Fail = 23,

    // Calls
    LoadSavedPos = 24,
    UpdateSavedPos = 25,
    Call = 26,
    Rule = 27,

    // Failure reporting
    SilentFailsOn = 28,
    SilentFailsOff = 29,

    // Repetition bounds
    IfLt = 30,
    IfGe = 31,

    Pluck = 36,
}

impl Opcode {
    /// Decode a word, or `None` when it is not an opcode.
    pub fn from_u32(word: u32) -> Option<Opcode> {
        use Opcode::*;
        Some(match word {
            0 => Push,
            1 => PushUndefined,
            2 => PushNull,
            3 => PushFailed,
            4 => PushEmptyArray,
            5 => PushCurrPos,
            6 => Pop,
            7 => PopCurrPos,
            8 => PopN,
            9 => Nip,
            10 => Append,
            11 => Wrap,
            12 => Text,
            13 => If,
            14 => IfError,
            15 => IfNotError,
            16 => WhileNotError,
            17 => MatchAny,
            18 => MatchString,
            19 => MatchStringIc,
            20 => MatchRegexp,
            21 => AcceptN,
            22 => AcceptString,
            23 => Fail,
            24 => LoadSavedPos,
            25 => UpdateSavedPos,
            26 => Call,
            27 => Rule,
            28 => SilentFailsOn,
            29 => SilentFailsOff,
            30 => IfLt,
            31 => IfGe,
            36 => Pluck,
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Number of operand words before the block lengths of a conditional,
    /// or `None` for opcodes that are not conditionals.
    pub fn condition_args(self) -> Option<usize> {
        match self {
            Opcode::If | Opcode::IfError | Opcode::IfNotError | Opcode::MatchAny => Some(0),
            Opcode::MatchString
            | Opcode::MatchStringIc
            | Opcode::MatchRegexp
            | Opcode::IfLt
            | Opcode::IfGe => Some(1),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Push => "PUSH",
            PushUndefined => "PUSH_UNDEFINED",
            PushNull => "PUSH_NULL",
            PushFailed => "PUSH_FAILED",
            PushEmptyArray => "PUSH_EMPTY_ARRAY",
            PushCurrPos => "PUSH_CURR_POS",
            Pop => "POP",
            PopCurrPos => "POP_CURR_POS",
            PopN => "POP_N",
            Nip => "NIP",
            Append => "APPEND",
            Wrap => "WRAP",
            Text => "TEXT",
            If => "IF",
            IfError => "IF_ERROR",
            IfNotError => "IF_NOT_ERROR",
            WhileNotError => "WHILE_NOT_ERROR",
            MatchAny => "MATCH_ANY",
            MatchString => "MATCH_STRING",
            MatchStringIc => "MATCH_STRING_IC",
            MatchRegexp => "MATCH_REGEXP",
            AcceptN => "ACCEPT_N",
            AcceptString => "ACCEPT_STRING",
            Fail => "FAIL",
            LoadSavedPos => "LOAD_SAVED_POS",
            UpdateSavedPos => "UPDATE_SAVED_POS",
            Call => "CALL",
            Rule => "RULE",
            SilentFailsOn => "SILENT_FAILS_ON",
            SilentFailsOff => "SILENT_FAILS_OFF",
            IfLt => "IF_LT",
            IfGe => "IF_GE",
            Pluck => "PLUCK",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Opcode> for u32 {
    fn from(op: Opcode) -> u32 {
        op as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_codes() {
        for word in 0..40u32 {
            if let Some(op) = Opcode::from_u32(word) {
                assert_eq!(op.code(), word);
            }
        }
        assert_eq!(Opcode::from_u32(32), None);
        assert_eq!(Opcode::from_u32(36), Some(Opcode::Pluck));
    }

    #[test]
    fn test_condition_args() {
        assert_eq!(Opcode::IfError.condition_args(), Some(0));
        assert_eq!(Opcode::MatchString.condition_args(), Some(1));
        assert_eq!(Opcode::WhileNotError.condition_args(), None);
        assert_eq!(Opcode::Pop.condition_args(), None);
    }
}
