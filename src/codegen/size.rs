//! Size backend: the generic bytecode interpreter.
//!
//! Instead of one function per rule, the parser carries every rule's
//! bytecode in an encoded table and runs it through `peg$parseRule`. Nested
//! blocks are handled with explicit `ips`/`ends` stacks instead of
//! recursion, so deeply nested grammars can't overflow the JavaScript stack.

use super::indent2;
use super::speed::{rule_footer, rule_header};
use crate::opcodes::Opcode;
use crate::options::GenerateOptions;

fn indent(code: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    code.split('\n')
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{}", pad, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Dispatch code of a conditional with `args` operands.
fn condition(cond: &str, args: usize) -> String {
    let base = args + 3;
    let then_len = format!("bc[ip + {}]", base - 2);
    let else_len = format!("bc[ip + {}]", base - 1);
    [
        "ends.push(end);".to_string(),
        format!("ips.push(ip + {} + {} + {});", base, then_len, else_len),
        String::new(),
        format!("if ({}) {{", cond),
        format!("  end = ip + {} + {};", base, then_len),
        format!("  ip += {};", base),
        "} else {".to_string(),
        format!("  end = ip + {} + {} + {};", base, then_len, else_len),
        format!("  ip += {} + {};", base, then_len),
        "}".to_string(),
        String::new(),
        "break;".to_string(),
    ]
    .join("\n")
}

fn while_loop(cond: &str) -> String {
    [
        format!("if ({}) {{", cond),
        "  ends.push(end);".to_string(),
        "  ips.push(ip);".to_string(),
        String::new(),
        "  end = ip + 2 + bc[ip + 1];".to_string(),
        "  ip += 2;".to_string(),
        "} else {".to_string(),
        "  ip += 2 + bc[ip + 1];".to_string(),
        "}".to_string(),
        String::new(),
        "break;".to_string(),
    ]
    .join("\n")
}

fn call() -> &'static str {
    "params = bc.slice(ip + 4, ip + 4 + bc[ip + 3])
  .map(function(p) { return stack[stack.length - 1 - p]; });

stack.splice(
  stack.length - bc[ip + 2],
  bc[ip + 2],
  peg$consts[bc[ip + 1]].apply(null, params)
);

ip += 4 + bc[ip + 3];
break;"
}

fn pluck() -> &'static str {
    "params = bc.slice(ip + 3, ip + 3 + bc[ip + 2])
  .map(function(p) { return stack[stack.length - 1 - p]; });

stack.splice(
  stack.length - bc[ip + 1],
  bc[ip + 1],
  bc[ip + 2] === 1 ? params[0] : params
);

ip += 3 + bc[ip + 2];
break;"
}

fn simple(lines: &[&str]) -> String {
    lines.join("\n")
}

/// Body of the `case` for `opcode`.
fn case_body(opcode: Opcode) -> String {
    const TOP: &str = "stack[stack.length - 1]";
    match opcode {
        Opcode::Push => simple(&[
            "stack.push(peg$consts[bc[ip + 1]]);",
            "ip += 2;",
            "break;",
        ]),
        Opcode::PushUndefined => simple(&["stack.push(undefined);", "ip++;", "break;"]),
        Opcode::PushNull => simple(&["stack.push(null);", "ip++;", "break;"]),
        Opcode::PushFailed => simple(&["stack.push(peg$FAILED);", "ip++;", "break;"]),
        Opcode::PushEmptyArray => simple(&["stack.push([]);", "ip++;", "break;"]),
        Opcode::PushCurrPos => simple(&["stack.push(peg$currPos);", "ip++;", "break;"]),
        Opcode::Pop => simple(&["stack.pop();", "ip++;", "break;"]),
        Opcode::PopCurrPos => simple(&["peg$currPos = stack.pop();", "ip++;", "break;"]),
        Opcode::PopN => simple(&["stack.length -= bc[ip + 1];", "ip += 2;", "break;"]),
        Opcode::Nip => simple(&["stack.splice(-2, 1);", "ip++;", "break;"]),
        Opcode::Append => simple(&[
            "stack[stack.length - 2].push(stack.pop());",
            "ip++;",
            "break;",
        ]),
        Opcode::Wrap => simple(&[
            "stack.push(stack.splice(stack.length - bc[ip + 1], bc[ip + 1]));",
            "ip += 2;",
            "break;",
        ]),
        Opcode::Text => simple(&[
            "stack.push(input.substring(stack.pop(), peg$currPos));",
            "ip++;",
            "break;",
        ]),
        Opcode::If => condition(TOP, 0),
        Opcode::IfError => condition(&format!("{} === peg$FAILED", TOP), 0),
        Opcode::IfNotError => condition(&format!("{} !== peg$FAILED", TOP), 0),
        Opcode::IfLt => condition(&format!("{}.length < bc[ip + 1]", TOP), 1),
        Opcode::IfGe => condition(&format!("{}.length >= bc[ip + 1]", TOP), 1),
        Opcode::WhileNotError => while_loop(&format!("{} !== peg$FAILED", TOP)),
        Opcode::MatchAny => condition("input.length > peg$currPos", 0),
        Opcode::MatchString => condition(
            "input.substr(peg$currPos, peg$consts[bc[ip + 1]].length) === peg$consts[bc[ip + 1]]",
            1,
        ),
        Opcode::MatchStringIc => condition(
            "input.substr(peg$currPos, peg$consts[bc[ip + 1]].length).toLowerCase() === peg$consts[bc[ip + 1]]",
            1,
        ),
        Opcode::MatchRegexp => condition(
            "peg$consts[bc[ip + 1]].test(input.charAt(peg$currPos))",
            1,
        ),
        Opcode::AcceptN => simple(&[
            "stack.push(input.substr(peg$currPos, bc[ip + 1]));",
            "peg$currPos += bc[ip + 1];",
            "ip += 2;",
            "break;",
        ]),
        Opcode::AcceptString => simple(&[
            "stack.push(peg$consts[bc[ip + 1]]);",
            "peg$currPos += peg$consts[bc[ip + 1]].length;",
            "ip += 2;",
            "break;",
        ]),
        Opcode::Fail => simple(&[
            "stack.push(peg$FAILED);",
            "if (peg$silentFails === 0) {",
            "  peg$fail(peg$consts[bc[ip + 1]]);",
            "}",
            "ip += 2;",
            "break;",
        ]),
        Opcode::LoadSavedPos => simple(&[
            "peg$savedPos = stack[stack.length - 1 - bc[ip + 1]];",
            "ip += 2;",
            "break;",
        ]),
        Opcode::UpdateSavedPos => simple(&["peg$savedPos = peg$currPos;", "ip++;", "break;"]),
        Opcode::Call => call().to_string(),
        Opcode::Rule => simple(&[
            "stack.push(peg$parseRule(bc[ip + 1]));",
            "ip += 2;",
            "break;",
        ]),
        Opcode::SilentFailsOn => simple(&["peg$silentFails++;", "ip++;", "break;"]),
        Opcode::SilentFailsOff => simple(&["peg$silentFails--;", "ip++;", "break;"]),
        Opcode::Pluck => pluck().to_string(),
    }
}

/// Opcodes in dispatch order.
const DISPATCH: [Opcode; 33] = [
    Opcode::Push,
    Opcode::PushUndefined,
    Opcode::PushNull,
    Opcode::PushFailed,
    Opcode::PushEmptyArray,
    Opcode::PushCurrPos,
    Opcode::Pop,
    Opcode::PopCurrPos,
    Opcode::PopN,
    Opcode::Nip,
    Opcode::Append,
    Opcode::Wrap,
    Opcode::Text,
    Opcode::If,
    Opcode::IfError,
    Opcode::IfNotError,
    Opcode::WhileNotError,
    Opcode::MatchAny,
    Opcode::MatchString,
    Opcode::MatchStringIc,
    Opcode::MatchRegexp,
    Opcode::AcceptN,
    Opcode::AcceptString,
    Opcode::Fail,
    Opcode::LoadSavedPos,
    Opcode::UpdateSavedPos,
    Opcode::Call,
    Opcode::Rule,
    Opcode::SilentFailsOn,
    Opcode::SilentFailsOff,
    Opcode::IfLt,
    Opcode::IfGe,
    Opcode::Pluck,
];

/// `peg$decode` and the `peg$parseRule` interpreter.
///
/// `rule_count` is the number of rules, used for the memo key.
pub fn generate_interpreter(rule_count: usize, options: &GenerateOptions) -> String {
    let mut parts = vec![[
        "function peg$decode(s: string): number[] {",
        "  return s.split(\"\").map((ch) => { return ch.charCodeAt(0) - 32; });",
        "}",
        "",
        "function peg$parseRule(index: number): any {",
    ]
    .join("\n")];

    let mut locals = vec![
        "  const bc = peg$bytecode[index];",
        "  let ip = 0;",
        "  const ips: any[] = [];",
        "  let end = bc.length;",
        "  const ends: any[] = [];",
        "  const stack: any[] = [];",
    ];
    if options.trace {
        locals.push("  const startPos = peg$currPos;");
    }
    locals.push("  let params;");
    parts.push(locals.join("\n"));

    parts.push(indent2(&rule_header(
        "peg$ruleNames[index]",
        "index",
        rule_count,
        options,
    )));

    let mut cases = Vec::with_capacity(DISPATCH.len());
    for opcode in DISPATCH {
        cases.push(format!(
            "        case {}: // {}\n{}",
            opcode.code(),
            opcode.name(),
            indent(&case_body(opcode), 10)
        ));
    }

    parts.push(
        [
            "  while (true) {".to_string(),
            "    while (ip < end) {".to_string(),
            "      switch (bc[ip]) {".to_string(),
            cases.join("\n\n"),
            String::new(),
            "        default:".to_string(),
            "          throw new Error(\"Invalid opcode: \" + bc[ip] + \".\");".to_string(),
            "      }".to_string(),
            "    }".to_string(),
            String::new(),
            "    if (ends.length > 0) {".to_string(),
            "      end = ends.pop();".to_string(),
            "      ip = ips.pop();".to_string(),
            "    } else {".to_string(),
            "      break;".to_string(),
            "    }".to_string(),
            "  }".to_string(),
        ]
        .join("\n"),
    );

    parts.push(indent2(&rule_footer("peg$ruleNames[index]", "stack[0]", options)));
    parts.push("}".to_string());

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_layout() {
        let code = condition("input.length > peg$currPos", 0);
        assert!(code.starts_with("ends.push(end);\nips.push(ip + 3 + bc[ip + 1] + bc[ip + 2]);"));
        assert!(code.contains("  end = ip + 3 + bc[ip + 1];\n  ip += 3;"));
        assert!(code.contains("  ip += 3 + bc[ip + 1];"));
        let with_arg = condition("x", 1);
        assert!(with_arg.contains("ips.push(ip + 4 + bc[ip + 2] + bc[ip + 3]);"));
    }

    #[test]
    fn test_interpreter_covers_every_opcode() {
        let code = generate_interpreter(3, &GenerateOptions::size());
        for opcode in DISPATCH {
            assert!(code.contains(&format!("case {}: // {}", opcode.code(), opcode.name())));
        }
        assert!(code.contains("function peg$parseRule(index: number): any {"));
        assert!(code.contains("peg$consts[bc[ip + 1]].apply(null, params)"));
        assert!(code.contains("throw new Error(\"Invalid opcode: \" + bc[ip] + \".\");"));
        assert!(code.ends_with("  return stack[0];\n}"));
        assert!(!code.contains("startPos"));
        assert!(!code.contains("peg$resultsCache"));
    }

    #[test]
    fn test_interpreter_trace_and_cache() {
        let opts = GenerateOptions::size().with_trace(true).with_cache(true);
        let code = generate_interpreter(3, &opts);
        assert!(code.contains("  const startPos = peg$currPos;"));
        assert!(code.contains("const key = peg$currPos * 3 + index;"));
        assert!(code.contains("rule: peg$ruleNames[index],"));
        assert!(code.contains("peg$resultsCache[key] = { nextPos: peg$currPos, result: stack[0] };"));
    }

    #[test]
    fn test_dispatch_is_complete() {
        for word in 0..64 {
            if let Some(opcode) = Opcode::from_u32(word) {
                assert!(DISPATCH.contains(&opcode), "{} missing", opcode.name());
            }
        }
    }
}
