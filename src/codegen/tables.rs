//! Constant and bytecode tables of the emitted parser.

use super::indent2;
use crate::bytecode::CompiledGrammar;
use crate::consts::{string_escape, ConstPool};
use crate::error::{GenerationError, Result};

/// Offset added to every bytecode word so the encoded string stays printable.
pub const ENCODING_OFFSET: u32 = 32;

/// One `const peg$c<N> = ...;` line per constant.
pub fn speed_tables(consts: &ConstPool) -> String {
    consts
        .texts()
        .enumerate()
        .map(|(i, text)| format!("const peg$c{} = {};", i, text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Encode a rule's bytecode as the body of a `peg$decode("...")` literal.
///
/// Each word becomes the code unit `word + 32`. Words that would land on a
/// surrogate or past `0xFFFF` can't be represented.
pub fn encode_bytecode(rule: &str, bytecode: &[u32]) -> Result<String> {
    let mut raw = String::with_capacity(bytecode.len());
    for &word in bytecode {
        let unit = word
            .checked_add(ENCODING_OFFSET)
            .filter(|&u| u <= 0xFFFF)
            .and_then(char::from_u32)
            .ok_or_else(|| GenerationError::UnencodableBytecode {
                rule: rule.to_string(),
                word,
            })?;
        raw.push(unit);
    }
    Ok(string_escape(&raw))
}

/// The `peg$consts` array and the encoded `peg$bytecode` table.
pub fn size_tables(compiled: &CompiledGrammar) -> Result<String> {
    let consts: Vec<&str> = compiled.consts.texts().collect();
    let mut decoded = Vec::with_capacity(compiled.rules.len());
    for rule in &compiled.rules {
        decoded.push(format!(
            "peg$decode(\"{}\")",
            encode_bytecode(&rule.name, &rule.bytecode)?
        ));
    }

    Ok([
        "const peg$consts = [".to_string(),
        indent2(&consts.join(",\n")),
        "];".to_string(),
        String::new(),
        "const peg$bytecode = [".to_string(),
        indent2(&decoded.join(",\n")),
        "];".to_string(),
    ]
    .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::RuleBytecode;
    use crate::runtime::Expectation;

    fn pool() -> ConstPool {
        let mut pool = ConstPool::new();
        pool.add_literal("a");
        pool.add_expectation(Expectation::literal("a", false));
        pool
    }

    #[test]
    fn test_speed_tables() {
        assert_eq!(
            speed_tables(&pool()),
            "const peg$c0 = \"a\";\nconst peg$c1 = peg$literalExpectation(\"a\", false);"
        );
        assert_eq!(speed_tables(&ConstPool::new()), "");
    }

    #[test]
    fn test_encode_bytecode() {
        // 18 -> '2', 0 -> ' ', 2 -> '"' (escaped), 60 -> '\\' (escaped)
        assert_eq!(encode_bytecode("r", &[18, 0, 2, 60]).unwrap(), "2 \\\"\\\\");
        assert_eq!(encode_bytecode("r", &[200]).unwrap(), "\\xE8");
    }

    #[test]
    fn test_encode_rejects_surrogates() {
        assert_eq!(
            encode_bytecode("r", &[0xD800 - 32]),
            Err(GenerationError::UnencodableBytecode {
                rule: "r".into(),
                word: 0xD800 - 32
            })
        );
        assert!(encode_bytecode("r", &[0x10000]).is_err());
        assert!(encode_bytecode("r", &[u32::MAX]).is_err());
    }

    #[test]
    fn test_size_tables() {
        let compiled = CompiledGrammar {
            rules: vec![
                RuleBytecode {
                    name: "a".into(),
                    bytecode: vec![27, 1],
                },
                RuleBytecode {
                    name: "b".into(),
                    bytecode: vec![17, 2, 2, 21, 1, 23, 0],
                },
            ],
            consts: pool(),
        };
        let expected = [
            "const peg$consts = [",
            "  \"a\",",
            "  peg$literalExpectation(\"a\", false)",
            "];",
            "",
            "const peg$bytecode = [",
            "  peg$decode(\";!\"),",
            "  peg$decode(\"1\\\"\\\"5!7 \")",
            "];",
        ]
        .join("\n");
        assert_eq!(size_tables(&compiled).unwrap(), expected);
    }
}
