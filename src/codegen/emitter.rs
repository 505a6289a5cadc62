//! Top-level emitter for generated TypeScript parsers
//!
//! Assembles one self-contained module from:
//! - the runtime declarations (positions, expectations, `SyntaxError`)
//! - a `T_<rule>` alias per rule
//! - the rule functions (speed) or the interpreter and its tables (size)
//! - start-rule dispatch and the final end-of-input check
//! - the module wrapper for the requested format
//!
//! # Example
//!
//! ```text
//! // Generated by tspeg v. 0.1.0
//! import * as lib from "./lib";
//!
//! export interface IFilePosition { ... }
//! export type T_start = string;
//!
//! function peg$parse(input: string, options?: IParseOptions) { ... }
//!
//! export const parse: ParseFunction = peg$parse;
//! export function parseStart(input: string, options?: IParseOptions): T_start { ... }
//! ```

use super::analysis::{RuleTypeMap, DYNAMIC};
use super::indent2;
use super::size::generate_interpreter;
use super::speed::{compile_rule, render_rule};
use super::tables::{size_tables, speed_tables};
use crate::ast::Grammar;
use crate::bytecode::CompiledGrammar;
use crate::consts::string_escape;
use crate::error::{GenerationError, Result};
use crate::options::{GenerateOptions, ModuleFormat, Optimize};
use std::fmt::Write;
use tracing::{debug, instrument};

/// Version stamped into the generated-by banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const TSLINT_DISABLES: [&str; 8] = [
    "only-arrow-functions",
    "object-literal-shorthand",
    "trailing-comma",
    "object-literal-sort-keys",
    "one-variable-per-declaration",
    "max-line-length",
    "no-consecutive-blank-lines",
    "align",
];

const DECLARATIONS: &str = r##"export interface IFilePosition {
  offset: number;
  line: number;
  column: number;
}

export interface IFileRange {
  source?: any;
  start: IFilePosition;
  end: IFilePosition;
}

export interface ILiteralExpectation {
  type: "literal";
  text: string;
  ignoreCase: boolean;
}

export interface IClassParts extends Array<string | IClassParts> {}

export interface IClassExpectation {
  type: "class";
  parts: IClassParts;
  inverted: boolean;
  ignoreCase: boolean;
}

export interface IAnyExpectation {
  type: "any";
}

export interface IEndExpectation {
  type: "end";
}

export interface IOtherExpectation {
  type: "other";
  description: string;
}

export type Expectation = ILiteralExpectation | IClassExpectation | IAnyExpectation | IEndExpectation | IOtherExpectation;

export interface ISourceText {
  source: any;
  text: string;
}

function peg$padEnd(str: string, targetLength: number, padString: string): string {
  padString = padString || " ";
  if (str.length > targetLength) { return str; }
  targetLength -= str.length;
  padString += padString.repeat(targetLength);
  return str + padString.slice(0, targetLength);
}

export class SyntaxError extends Error {
  public static buildMessage(expected: Expectation[], found: string | null) {
    function hex(ch: string): string {
      return ch.charCodeAt(0).toString(16).toUpperCase();
    }

    function literalEscape(s: string): string {
      return s
        .replace(/\\/g, "\\\\")
        .replace(/"/g,  "\\\"")
        .replace(/\0/g, "\\0")
        .replace(/\t/g, "\\t")
        .replace(/\n/g, "\\n")
        .replace(/\r/g, "\\r")
        .replace(/[\x00-\x0F]/g,            (ch) => "\\x0" + hex(ch) )
        .replace(/[\x10-\x1F\x7F-\x9F]/g, (ch) => "\\x"  + hex(ch) );
    }

    function classEscape(s: string): string {
      return s
        .replace(/\\/g, "\\\\")
        .replace(/\]/g, "\\]")
        .replace(/\^/g, "\\^")
        .replace(/-/g,  "\\-")
        .replace(/\0/g, "\\0")
        .replace(/\t/g, "\\t")
        .replace(/\n/g, "\\n")
        .replace(/\r/g, "\\r")
        .replace(/[\x00-\x0F]/g,            (ch) => "\\x0" + hex(ch) )
        .replace(/[\x10-\x1F\x7F-\x9F]/g, (ch) => "\\x"  + hex(ch) );
    }

    function describeExpectation(expectation: Expectation) {
      switch (expectation.type) {
        case "literal":
          return "\"" + literalEscape(expectation.text) + "\"";
        case "class":
          const escapedParts = expectation.parts.map((part) => {
            return Array.isArray(part)
              ? classEscape(part[0] as string) + "-" + classEscape(part[1] as string)
              : classEscape(part);
          });

          return "[" + (expectation.inverted ? "^" : "") + escapedParts.join("") + "]";
        case "any":
          return "any character";
        case "end":
          return "end of input";
        case "other":
          return expectation.description;
      }
    }

    function describeExpected(expected1: Expectation[]) {
      const descriptions = expected1.map(describeExpectation);
      let i: number;
      let j: number;

      descriptions.sort();

      if (descriptions.length > 0) {
        for (i = 1, j = 1; i < descriptions.length; i++) {
          if (descriptions[i - 1] !== descriptions[i]) {
            descriptions[j] = descriptions[i];
            j++;
          }
        }
        descriptions.length = j;
      }

      switch (descriptions.length) {
        case 0:
          return "";

        case 1:
          return descriptions[0];

        case 2:
          return descriptions[0] + " or " + descriptions[1];

        default:
          return descriptions.slice(0, -1).join(", ")
            + ", or "
            + descriptions[descriptions.length - 1];
      }
    }

    function describeFound(found1: string | null) {
      return found1 ? "\"" + literalEscape(found1) + "\"" : "end of input";
    }

    return "Expected " + describeExpected(expected) + " but " + describeFound(found) + " found.";
  }

  public message: string;
  public expected: Expectation[];
  public found: string | null;
  public location: IFileRange;
  public name: string;

  constructor(message: string, expected: Expectation[], found: string | null, location: IFileRange) {
    super();
    this.message = message;
    this.expected = expected;
    this.found = found;
    this.location = location;
    this.name = "SyntaxError";

    if (typeof (Error as any).captureStackTrace === "function") {
      (Error as any).captureStackTrace(this, SyntaxError);
    }
  }

  public format(sources: ISourceText[]): string {
    let str = "Error: " + this.message;
    if (this.location) {
      let src: string | null = null;
      for (const k of sources) {
        if (k.source === this.location.source) {
          src = k.text;
          break;
        }
      }
      const s = this.location.start;
      const loc = (this.location.source !== undefined ? this.location.source : "") + ":" + s.line + ":" + s.column;
      if (src !== null) {
        const e = this.location.end;
        const filler = peg$padEnd("", s.line.toString().length, " ");
        const line = src.split(/\r\n|\n|\r/g)[s.line - 1] || "";
        const last = s.line === e.line ? e.column : line.length + 1;
        const hatLen = (last - s.column) || 1;
        str += "\n --> " + loc + "\n"
          + filler + " |\n"
          + s.line + " | " + line + "\n"
          + filler + " | " + peg$padEnd("", s.column - 1, " ")
          + peg$padEnd("", hatLen, "^");
      } else {
        str += "\n at " + loc;
      }
    }
    return str;
  }
}
"##;

const TRACER: &str = r##"export interface ITraceEvent {
  type: string;
  rule: string;
  result?: any;
  location: IFileRange;
}

export class DefaultTracer {
  private indentLevel: number;

  constructor() {
    this.indentLevel = 0;
  }

  public trace(event: ITraceEvent) {
    const that = this;

    function log(evt: ITraceEvent) {
      function repeat(text: string, n: number) {
         let result = "", i;

         for (i = 0; i < n; i++) {
           result += text;
         }

         return result;
      }

      function pad(text: string, length: number) {
        return text + repeat(" ", length - text.length);
      }

      if (typeof console === "object") {
        console.log(
          evt.location.start.line + ":" + evt.location.start.column + "-"
            + evt.location.end.line + ":" + evt.location.end.column + " "
            + pad(evt.type, 10) + " "
            + repeat("  ", that.indentLevel) + evt.rule
        );
      }
    }

    switch (event.type) {
      case "rule.enter":
        log(event);
        this.indentLevel++;
        break;

      case "rule.match":
        this.indentLevel--;
        log(event);
        break;

      case "rule.fail":
        this.indentLevel--;
        log(event);
        break;

      default:
        throw new Error("Invalid event type: " + event.type + ".");
    }
  }
}
"##;

const CACHED: &str = "export interface ICached {
  nextPos: number;
  result: any;
}
";

const HELPERS: &str = r##"
function text(): string {
  return input.substring(peg$savedPos, peg$currPos);
}

function location(): IFileRange {
  return peg$computeLocation(peg$savedPos, peg$currPos);
}

function expected(description: string, location1?: IFileRange) {
  location1 = location1 !== undefined
    ? location1
    : peg$computeLocation(peg$savedPos, peg$currPos);

  throw peg$buildStructuredError(
    [peg$otherExpectation(description)],
    input.substring(peg$savedPos, peg$currPos),
    location1
  );
}

function error(message: string, location1?: IFileRange) {
  location1 = location1 !== undefined
    ? location1
    : peg$computeLocation(peg$savedPos, peg$currPos);

  throw peg$buildSimpleError(message, location1);
}

function peg$literalExpectation(text1: string, ignoreCase: boolean): ILiteralExpectation {
  return { type: "literal", text: text1, ignoreCase: ignoreCase };
}

function peg$classExpectation(parts: IClassParts, inverted: boolean, ignoreCase: boolean): IClassExpectation {
  return { type: "class", parts: parts, inverted: inverted, ignoreCase: ignoreCase };
}

function peg$anyExpectation(): IAnyExpectation {
  return { type: "any" };
}

function peg$endExpectation(): IEndExpectation {
  return { type: "end" };
}

function peg$otherExpectation(description: string): IOtherExpectation {
  return { type: "other", description: description };
}

function peg$computePosDetails(pos: number) {
  let details = peg$posDetailsCache[pos];
  let p;

  if (details) {
    return details;
  } else {
    p = pos - 1;
    while (!peg$posDetailsCache[p]) {
      p--;
    }

    details = peg$posDetailsCache[p];
    details = {
      line: details.line,
      column: details.column
    };

    while (p < pos) {
      if (input.charCodeAt(p) === 10) {
        details.line++;
        details.column = 1;
      } else {
        details.column++;
      }

      p++;
    }

    peg$posDetailsCache[pos] = details;

    return details;
  }
}

function peg$computeLocation(startPos: number, endPos: number): IFileRange {
  const startPosDetails = peg$computePosDetails(startPos);
  const endPosDetails = peg$computePosDetails(endPos);

  return {
    source: peg$source,
    start: {
      offset: startPos,
      line: startPosDetails.line,
      column: startPosDetails.column
    },
    end: {
      offset: endPos,
      line: endPosDetails.line,
      column: endPosDetails.column
    }
  };
}

function peg$fail(expected1: Expectation) {
  if (peg$currPos < peg$maxFailPos) { return; }

  if (peg$currPos > peg$maxFailPos) {
    peg$maxFailPos = peg$currPos;
    peg$maxFailExpected = [];
  }

  peg$maxFailExpected.push(expected1);
}

function peg$buildSimpleError(message: string, location1: IFileRange) {
  return new SyntaxError(message, [], "", location1);
}

function peg$buildStructuredError(expected1: Expectation[], found: string | null, location1: IFileRange) {
  return new SyntaxError(
    SyntaxError.buildMessage(expected1, found),
    expected1,
    found,
    location1
  );
}
"##;

const END_CHECK: &str = r##"
  if (peg$result !== peg$FAILED && peg$currPos === input.length) {
    return peg$result;
  } else {
    if (peg$result !== peg$FAILED && peg$currPos < input.length) {
      peg$fail(peg$endExpectation());
    }

    throw peg$buildStructuredError(
      peg$maxFailExpected,
      peg$maxFailPos < input.length ? input.charAt(peg$maxFailPos) : null,
      peg$maxFailPos < input.length
        ? peg$computeLocation(peg$maxFailPos, peg$maxFailPos + 1)
        : peg$computeLocation(peg$maxFailPos, peg$maxFailPos)
    );
  }
}"##;

const PARSE_OPTIONS: &str = "export interface IParseOptions {
  filename?: string;
  grammarSource?: any;
  startRule?: string;
  tracer?: any;
  [key: string]: any;
}";

/// Convert `snake_case` to `CamelCase`, keeping leading underscores.
pub fn snake_to_camel(name: &str) -> String {
    let trimmed = name.trim_start_matches('_');
    let mut out = "_".repeat(name.len() - trimmed.len());
    for word in trimmed.split('_') {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// Remove the `export` keyword from declarations that end up inside a
/// function body.
fn strip_exports(code: &str) -> String {
    code.split('\n')
        .map(|line| line.strip_prefix("export ").unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assembles the generated module.
pub struct Emitter<'a> {
    grammar: &'a Grammar,
    compiled: &'a CompiledGrammar,
    rule_types: &'a RuleTypeMap,
    options: &'a GenerateOptions,
    start_rules: Vec<String>,
    rule_names: Vec<String>,
}

impl<'a> Emitter<'a> {
    pub fn new(
        grammar: &'a Grammar,
        compiled: &'a CompiledGrammar,
        rule_types: &'a RuleTypeMap,
        options: &'a GenerateOptions,
    ) -> Self {
        Emitter {
            grammar,
            compiled,
            rule_types,
            options,
            start_rules: options.start_rules(grammar),
            rule_names: compiled.rule_names(),
        }
    }

    /// Generate the complete module source.
    #[instrument(skip_all, name = "emit")]
    pub fn emit(&self) -> Result<String> {
        let toplevel = self.toplevel()?;
        let code = self.wrap(&toplevel);
        debug!(bytes = code.len(), format = ?self.options.format, "emitted module");
        Ok(code)
    }

    fn return_type(&self, rule: &str) -> &str {
        self.rule_types.type_name(rule).unwrap_or(DYNAMIC)
    }

    fn rule_index(&self, rule: &str) -> Result<usize> {
        self.compiled
            .index_of(rule)
            .ok_or_else(|| GenerationError::UnknownStartRule {
                rule: rule.to_string(),
            })
    }

    /// `export type T_<rule> = ...;` for every rule.
    fn type_aliases(&self) -> String {
        let mut code = String::new();
        for entry in self.rule_types.iter() {
            writeln!(code, "export type {} = {};", entry.type_name, entry.rule_type).unwrap();
        }
        code
    }

    fn start_dispatch(&self) -> Result<String> {
        let first = self
            .start_rules
            .first()
            .ok_or(GenerationError::EmptyGrammar)?;
        let mut code = String::new();
        match self.options.optimize {
            Optimize::Size => {
                let mut indices = Vec::with_capacity(self.start_rules.len());
                for rule in &self.start_rules {
                    indices.push(format!("{}: {}", rule, self.rule_index(rule)?));
                }
                writeln!(
                    code,
                    "  const peg$startRuleIndices: {{[id: string]: number}} = {{ {} }};",
                    indices.join(", ")
                )
                .unwrap();
                write!(code, "  let peg$startRuleIndex = {};", self.rule_index(first)?).unwrap();
            }
            Optimize::Speed => {
                let functions: Vec<String> = self
                    .start_rules
                    .iter()
                    .map(|r| format!("{}: peg$parse{}", r, r))
                    .collect();
                writeln!(
                    code,
                    "  const peg$startRuleFunctions: {{[id: string]: any}} = {{ {} }};",
                    functions.join(", ")
                )
                .unwrap();
                write!(code, "  let peg$startRuleFunction: () => any = peg$parse{};", first).unwrap();
            }
        }
        Ok(code)
    }

    fn tables(&self) -> Result<String> {
        match self.options.optimize {
            Optimize::Speed => Ok(speed_tables(&self.compiled.consts)),
            Optimize::Size => size_tables(self.compiled),
        }
    }

    /// The rule functions, or the interpreter for the size backend.
    fn rules(&self) -> Result<String> {
        match self.options.optimize {
            Optimize::Size => {
                // Same stack checks as the speed backend
                for rule in &self.compiled.rules {
                    compile_rule(
                        &rule.name,
                        &rule.bytecode,
                        &self.compiled.consts,
                        &self.rule_names,
                    )?;
                }
                Ok(generate_interpreter(self.rule_names.len(), self.options))
            }
            Optimize::Speed => {
                let mut functions = Vec::with_capacity(self.compiled.rules.len());
                for rule in &self.compiled.rules {
                    let compiled = compile_rule(
                        &rule.name,
                        &rule.bytecode,
                        &self.compiled.consts,
                        &self.rule_names,
                    )?;
                    functions.push(render_rule(
                        &compiled,
                        &self.compiled.consts,
                        &self.rule_names,
                        self.return_type(&rule.name),
                        self.options,
                    ));
                }
                debug!(rules = functions.len(), "compiled rule functions");
                Ok(functions.join("\n\n"))
            }
        }
    }

    /// Everything inside the module wrapper.
    fn toplevel(&self) -> Result<String> {
        let opts = self.options;
        let mut parts: Vec<String> = Vec::new();

        if let Some(header) = &opts.custom_header {
            parts.push(header.clone());
        }
        if let Some(init) = &self.grammar.top_level_initializer {
            parts.push(init.code.clone());
        }
        parts.push(DECLARATIONS.to_string());
        parts.push(self.type_aliases());
        if opts.trace {
            parts.push(TRACER.to_string());
        }
        if opts.cache {
            parts.push(CACHED.to_string());
        }

        parts.push(
            [
                "function peg$parse(input: string, options?: IParseOptions) {",
                "  options = options !== undefined ? options : {};",
                "",
                "  const peg$FAILED: any = {};",
                "  const peg$source = options.grammarSource;",
                "",
            ]
            .join("\n"),
        );
        parts.push(self.start_dispatch()?);
        parts.push(String::new());
        parts.push(indent2(&self.tables()?));

        parts.push(
            [
                "",
                "  let peg$currPos = 0;",
                "  let peg$savedPos = 0;",
                "  const peg$posDetailsCache = [{ line: 1, column: 1 }];",
                "  let peg$maxFailPos = 0;",
                "  let peg$maxFailExpected: Expectation[] = [];",
                "  let peg$silentFails = 0;",
                "",
            ]
            .join("\n"),
        );
        if opts.cache {
            parts.push("  const peg$resultsCache: {[id: number]: ICached} = {};\n".to_string());
        }
        if opts.trace {
            if opts.optimize == Optimize::Size {
                let names: Vec<String> = self
                    .rule_names
                    .iter()
                    .map(|n| format!("\"{}\"", string_escape(n)))
                    .collect();
                parts.push(format!("  const peg$ruleNames = [{}];\n", names.join(", ")));
            }
            parts.push(
                "  const peg$tracer = \"tracer\" in options ? options.tracer : new DefaultTracer();\n"
                    .to_string(),
            );
        }
        parts.push("  let peg$result;\n".to_string());

        let (table, target) = match opts.optimize {
            Optimize::Size => ("peg$startRuleIndices", "peg$startRuleIndex"),
            Optimize::Speed => ("peg$startRuleFunctions", "peg$startRuleFunction"),
        };
        parts.push(format!(
            "  if (options.startRule !== undefined) {{\n    if (!(options.startRule in {table})) {{\n      throw new Error(\"Can't start parsing from rule \\\"\" + options.startRule + \"\\\".\");\n    }}\n\n    {target} = {table}[options.startRule];\n  }}",
            table = table,
            target = target
        ));

        parts.push(indent2(HELPERS));
        parts.push(indent2(&self.rules()?));
        parts.push(String::new());

        if let Some(init) = &self.grammar.initializer {
            parts.push(indent2(&init.code));
            parts.push(String::new());
        }

        parts.push(match opts.optimize {
            Optimize::Size => "  peg$result = peg$parseRule(peg$startRuleIndex);".to_string(),
            Optimize::Speed => "  peg$result = peg$startRuleFunction();".to_string(),
        });
        parts.push(END_CHECK.to_string());

        Ok(parts.join("\n"))
    }

    fn generated_by(&self) -> String {
        let mut lines: Vec<String> = TSLINT_DISABLES
            .iter()
            .map(|rule| format!("// tslint:disable:{}", rule))
            .collect();
        if self.options.trace {
            lines.push("// tslint:disable:no-console".to_string());
        }
        lines.push(String::new());
        lines.push(format!("// Generated by tspeg v. {}", VERSION));
        lines.join("\n")
    }

    fn imports(&self) -> String {
        let mut code = String::new();
        for (var, module) in &self.options.dependencies {
            writeln!(code, "import * as {} from \"{}\";", var, string_escape(module)).unwrap();
        }
        code
    }

    /// Typed `parse<Rule>` functions, one per allowed start rule.
    fn entry_points(&self) -> String {
        let mut code = String::new();
        for rule in &self.start_rules {
            writeln!(
                code,
                "\nexport function parse{}(input: string, options?: IParseOptions): {} {{",
                snake_to_camel(rule),
                self.return_type(rule)
            )
            .unwrap();
            writeln!(
                code,
                "  return peg$parse(input, Object.assign({{}}, options, {{ startRule: \"{}\" }}));",
                string_escape(rule)
            )
            .unwrap();
            code.push('}');
        }
        code
    }

    /// Exports of a module-level format.
    fn parser_module(&self) -> String {
        [
            PARSE_OPTIONS.to_string(),
            "export type ParseFunction = (input: string, options?: IParseOptions) => any;".to_string(),
            "export const parse: ParseFunction = peg$parse;".to_string(),
        ]
        .join("\n")
            + &self.entry_points()
            + "\n"
    }

    /// The value returned by a function-wrapped format.
    fn parser_object(&self) -> String {
        let mut fields = vec!["  SyntaxError: SyntaxError,"];
        if self.options.trace {
            fields.push("  DefaultTracer: DefaultTracer,");
        }
        fields.push("  parse: peg$parse");
        format!("{{\n{}\n}}", fields.join("\n"))
    }

    fn dependency_list(&self) -> (String, String, String) {
        let ids: Vec<String> = self
            .options
            .dependencies
            .values()
            .map(|id| format!("\"{}\"", string_escape(id)))
            .collect();
        let requires: Vec<String> = ids.iter().map(|id| format!("require({})", id)).collect();
        let params: Vec<String> = self
            .options
            .dependencies
            .keys()
            .map(|v| format!("{}: any", v))
            .collect();
        (
            format!("[{}]", ids.join(", ")),
            requires.join(", "),
            params.join(", "),
        )
    }

    fn wrap(&self, toplevel: &str) -> String {
        let banner = self.generated_by();
        match self.options.format {
            ModuleFormat::Bare => [
                banner,
                String::new(),
                toplevel.to_string(),
                String::new(),
                self.parser_module(),
            ]
            .join("\n"),
            ModuleFormat::CommonJs | ModuleFormat::Es => {
                let mut parts = vec![banner, String::new()];
                if self.options.format == ModuleFormat::CommonJs {
                    parts.push("\"use strict\";".to_string());
                    parts.push(String::new());
                }
                if !self.options.dependencies.is_empty() {
                    parts.push(self.imports());
                }
                parts.push(toplevel.to_string());
                parts.push(String::new());
                parts.push(self.parser_module());
                parts.join("\n")
            }
            ModuleFormat::Amd => {
                let (deps, _, params) = self.dependency_list();
                [
                    banner,
                    format!("define({}, function({}) {{", deps, params),
                    "  \"use strict\";".to_string(),
                    String::new(),
                    indent2(&self.inner_body(toplevel)),
                    String::new(),
                    indent2(&format!("return {};", self.parser_object())),
                    "});".to_string(),
                    String::new(),
                ]
                .join("\n")
            }
            ModuleFormat::Globals => [
                banner,
                "(function(root) {".to_string(),
                "  \"use strict\";".to_string(),
                String::new(),
                indent2(&self.inner_body(toplevel)),
                String::new(),
                indent2(&format!(
                    "root.{} = {};",
                    self.export_var(),
                    self.parser_object()
                )),
                "})(this);".to_string(),
                String::new(),
            ]
            .join("\n"),
            ModuleFormat::Umd => {
                let (deps, requires, params) = self.dependency_list();
                let mut parts = vec![[
                    banner,
                    "(function(root, factory) {".to_string(),
                    "  if (typeof define === \"function\" && define.amd) {".to_string(),
                    format!("    define({}, factory);", deps),
                    "  } else if (typeof module === \"object\" && module.exports) {".to_string(),
                    format!("    module.exports = factory({});", requires),
                ]
                .join("\n")];
                if let Some(var) = &self.options.export_var {
                    parts.push(format!("  }} else {{\n    root.{} = factory();", var));
                }
                parts.push(
                    [
                        "  }".to_string(),
                        format!("}})(this, function({}) {{", params),
                        "  \"use strict\";".to_string(),
                        String::new(),
                        indent2(&self.inner_body(toplevel)),
                        String::new(),
                        indent2(&format!("return {};", self.parser_object())),
                        "});".to_string(),
                        String::new(),
                    ]
                    .join("\n"),
                );
                parts.join("\n")
            }
        }
    }

    /// Top-level code placed inside a wrapper function.
    fn inner_body(&self, toplevel: &str) -> String {
        format!("{}\n\n{}", strip_exports(toplevel), strip_exports(PARSE_OPTIONS))
    }

    fn export_var(&self) -> &str {
        self.options.export_var.as_deref().unwrap_or("parser")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expression, Rule};
    use crate::bytecode::{generate_bytecode, RuleBytecode};
    use crate::codegen::analysis::infer_types;
    use crate::consts::ConstPool;

    fn emit_with(grammar: Grammar, options: &GenerateOptions) -> String {
        let mut grammar = grammar;
        let types = infer_types(&mut grammar, &options.infer_options()).unwrap();
        let compiled = generate_bytecode(&grammar, options).unwrap();
        Emitter::new(&grammar, &compiled, &types, options).emit().unwrap()
    }

    fn ab_grammar() -> Grammar {
        Grammar::new(vec![
            Rule::new(
                "start",
                Expression::choice(vec![Expression::literal("a"), Expression::rule_ref("b_rule")]),
            ),
            Rule::new("b_rule", Expression::literal("b")),
        ])
    }

    fn unbalanced() -> CompiledGrammar {
        CompiledGrammar {
            rules: vec![RuleBytecode {
                name: "bad".into(),
                // PUSH_NULL, IF { PUSH_NULL } { }
                bytecode: vec![2, 13, 1, 0, 2],
            }],
            consts: ConstPool::new(),
        }
    }

    #[test]
    fn test_both_backends_reject_invalid_bytecode() {
        let mut grammar = Grammar::new(vec![Rule::new("bad", Expression::any())]);
        let compiled = unbalanced();
        for opts in [GenerateOptions::speed(), GenerateOptions::size()] {
            let types = infer_types(&mut grammar, &opts.infer_options()).unwrap();
            let err = Emitter::new(&grammar, &compiled, &types, &opts).emit().unwrap_err();
            assert!(
                matches!(err, GenerationError::UnbalancedBranches { opcode: "IF", .. }),
                "{:?} accepted unbalanced bytecode",
                opts.optimize
            );
        }
    }

    #[test]
    fn test_empty_expectation_list_describes_as_empty() {
        assert!(DECLARATIONS.contains("        case 0:\n          return \"\";"));
    }

    #[test]
    fn test_snake_to_camel() {
        assert_eq!(snake_to_camel("start"), "Start");
        assert_eq!(snake_to_camel("my_rule_name"), "MyRuleName");
        assert_eq!(snake_to_camel("__private_rule"), "__PrivateRule");
        assert_eq!(snake_to_camel("already_Camel"), "AlreadyCamel");
    }

    #[test]
    fn test_speed_module_layout() {
        let code = emit_with(ab_grammar(), &GenerateOptions::default());
        assert!(code.starts_with("// tslint:disable:only-arrow-functions"));
        assert!(code.contains(&format!("// Generated by tspeg v. {}", VERSION)));
        assert!(code.contains("\"use strict\";"));
        assert!(code.contains("export type T_start = string|T_b_rule;"));
        assert!(code.contains("export type T_b_rule = string;"));
        assert!(code.contains("const peg$c0 = \"a\";"));
        assert!(code.contains("function peg$parsestart(): T_start {"));
        assert!(code.contains("function peg$parseb_rule(): T_b_rule {"));
        assert!(code.contains("peg$startRuleFunctions: {[id: string]: any} = { start: peg$parsestart };"));
        assert!(code.contains("  peg$result = peg$startRuleFunction();"));
        assert!(code.contains("export const parse: ParseFunction = peg$parse;"));
        assert!(code.contains("export function parseStart(input: string, options?: IParseOptions): T_start {"));
        assert!(!code.contains("DefaultTracer"));
        assert!(!code.contains("ICached"));
    }

    #[test]
    fn test_size_module_layout() {
        let opts = GenerateOptions::size().with_start_rules(["b_rule", "start"]);
        let code = emit_with(ab_grammar(), &opts);
        assert!(code.contains("const peg$startRuleIndices: {[id: string]: number} = { b_rule: 1, start: 0 };"));
        assert!(code.contains("let peg$startRuleIndex = 1;"));
        assert!(code.contains("const peg$consts = ["));
        assert!(code.contains("peg$decode(\""));
        assert!(code.contains("function peg$parseRule(index: number): any {"));
        assert!(code.contains("peg$result = peg$parseRule(peg$startRuleIndex);"));
        assert!(!code.contains("function peg$parsestart"));
        assert!(code.contains("export function parseBRule("));
    }

    #[test]
    fn test_trace_and_cache_declarations() {
        let opts = GenerateOptions::debug().with_optimize(Optimize::Size);
        let code = emit_with(ab_grammar(), &opts);
        assert!(code.contains("export class DefaultTracer {"));
        assert!(code.contains("export interface ICached {"));
        assert!(code.contains("const peg$ruleNames = [\"start\", \"b_rule\"];"));
        assert!(code.contains("const peg$resultsCache: {[id: number]: ICached} = {};"));
        assert!(code.contains("// tslint:disable:no-console"));
    }

    #[test]
    fn test_header_and_initializers() {
        let grammar = ab_grammar()
            .with_initializer("const seen = 0;")
            .with_top_level_initializer("import { Node } from \"./ast\";");
        let opts = GenerateOptions::default().with_header("// custom header");
        let code = emit_with(grammar, &opts);
        let header = code.find("// custom header").unwrap();
        let top = code.find("import { Node } from \"./ast\";").unwrap();
        let decls = code.find("export interface IFilePosition").unwrap();
        assert!(header < top && top < decls);
        let init = code.find("  const seen = 0;").unwrap();
        let start = code.find("peg$result = peg$startRuleFunction();").unwrap();
        assert!(init < start);
    }

    #[test]
    fn test_es_imports() {
        let opts = GenerateOptions::default()
            .with_format(ModuleFormat::Es)
            .with_dependency("lib", "./lib");
        let code = emit_with(ab_grammar(), &opts);
        assert!(code.contains("import * as lib from \"./lib\";"));
        assert!(!code.contains("\"use strict\";"));
    }

    #[test]
    fn test_function_wrapped_formats() {
        let opts = GenerateOptions::default()
            .with_format(ModuleFormat::Umd)
            .with_dependency("lib", "./lib")
            .with_export_var("Parser");
        let code = emit_with(ab_grammar(), &opts);
        assert!(code.contains("    define([\"./lib\"], factory);"));
        assert!(code.contains("    module.exports = factory(require(\"./lib\"));"));
        assert!(code.contains("    root.Parser = factory();"));
        assert!(code.contains("})(this, function(lib: any) {"));
        assert!(code.contains("  class SyntaxError extends Error {"));
        assert!(!code.contains("\n  export "));

        let globals = GenerateOptions::default().with_format(ModuleFormat::Globals);
        let code = emit_with(ab_grammar(), &globals);
        assert!(code.contains("  root.parser = {"));
        assert!(code.ends_with("})(this);\n"));

        let amd = GenerateOptions::default().with_format(ModuleFormat::Amd);
        let code = emit_with(ab_grammar(), &amd);
        assert!(code.contains("define([], function() {"));
    }

    #[test]
    fn test_unknown_start_rule_in_size_dispatch() {
        let mut grammar = ab_grammar();
        let opts = GenerateOptions::size().with_start_rules(["missing"]);
        let types = infer_types(&mut grammar, &opts.infer_options()).unwrap();
        let compiled = generate_bytecode(&grammar, &opts).unwrap();
        let err = Emitter::new(&grammar, &compiled, &types, &opts).emit().unwrap_err();
        assert_eq!(
            err,
            GenerationError::UnknownStartRule {
                rule: "missing".into()
            }
        );
    }
}
