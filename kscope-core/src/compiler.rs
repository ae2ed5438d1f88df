use std::fmt;

use crate::ast::Declaration;
use crate::codegen::{CodeGenerator, Lowered};
use crate::error::CoreError;
use crate::interp::{Interpreter, Limits, RuntimeValue};
use crate::ir::{FuncId, IrBuilder, Module};
use crate::lexer::tokenize;
use crate::parser::Parser;
use crate::precedence::PrecedenceTable;
use crate::typecheck::TypeChecker;
use crate::types::TypeRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Keep the IR text of every lowered function for the driver to print.
    pub print_ir: bool,
    /// Instruction budget for one evaluation.
    pub step_limit: u64,
    pub max_call_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let limits = Limits::default();
        SessionConfig {
            print_ir: false,
            step_limit: limits.step_limit,
            max_call_depth: limits.max_call_depth,
        }
    }
}

/// Result of processing one top-level declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Declared(String),
    Defined(String),
    StructDefined(String),
    Evaluated(RuntimeValue),
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Declared(name) => write!(f, "declared `{name}`"),
            UnitOutcome::Defined(name) => write!(f, "defined `{name}`"),
            UnitOutcome::StructDefined(name) => write!(f, "defined struct `{name}`"),
            UnitOutcome::Evaluated(value) => write!(f, "{value}"),
        }
    }
}

/// An incremental compilation session.
///
/// Function signatures, struct types, operator precedences and lowered
/// functions persist from one [`Session::process`] call to the next; a
/// failing declaration only loses itself.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    precedence: PrecedenceTable,
    types: TypeRegistry,
    checker: TypeChecker,
    codegen: CodeGenerator,
    module: Module,
    printed_ir: Vec<String>,
}

impl Default for Session {
    fn default() -> Self {
        Session::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Session {
            config,
            precedence: PrecedenceTable::new(),
            types: TypeRegistry::new(),
            checker: TypeChecker::new(),
            codegen: CodeGenerator::new(),
            module: Module::new("kscope"),
            printed_ir: Vec::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn precedence(&self) -> &PrecedenceTable {
        &self.precedence
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// IR collected since the last call when `print_ir` is set.
    pub fn take_printed_ir(&mut self) -> Vec<String> {
        std::mem::take(&mut self.printed_ir)
    }

    /// Parse one chunk against the session's precedence table.
    ///
    /// Operator prototypes in the chunk update the table even if a later
    /// declaration fails to parse.
    pub fn parse(&mut self, source: &str) -> Result<Vec<Declaration>, CoreError> {
        let tokens = tokenize(source)?;
        Parser::new(tokens, &mut self.precedence).parse().into_result()
    }

    /// Compile one chunk, evaluating its top-level expressions.
    ///
    /// A lexing or parsing failure rejects the whole chunk and yields a
    /// single error. Otherwise there is one result per declaration.
    pub fn process(&mut self, source: &str) -> Vec<Result<UnitOutcome, CoreError>> {
        let declarations = match self.parse(source) {
            Ok(declarations) => declarations,
            Err(err) => {
                tracing::warn!(%err, "chunk rejected");
                return vec![Err(err)];
            }
        };
        tracing::debug!(count = declarations.len(), "parsed chunk");

        declarations
            .into_iter()
            .map(|decl| {
                let outcome = self.process_declaration(decl);
                match &outcome {
                    Ok(unit) => tracing::debug!(%unit, "processed declaration"),
                    Err(err) => tracing::warn!(%err, "declaration rejected"),
                }
                outcome
            })
            .collect()
    }

    /// Compile `source` and return the value of its last top-level
    /// expression (`void` if there is none). The first failure wins.
    pub fn evaluate(&mut self, source: &str) -> Result<RuntimeValue, CoreError> {
        let mut last = RuntimeValue::Void;
        for outcome in self.process(source) {
            if let UnitOutcome::Evaluated(value) = outcome? {
                last = value;
            }
        }
        Ok(last)
    }

    pub fn process_declaration(&mut self, mut decl: Declaration) -> Result<UnitOutcome, CoreError> {
        if let Declaration::Struct(s) = &decl {
            self.types
                .register_struct(&s.name, &s.fields)
                .map_err(|message| CoreError::TypeError(vec![message]))?;
        }
        let (name, anonymous) = match &decl {
            Declaration::Struct(s) => (s.name.clone(), false),
            Declaration::Extern(prototype) => (prototype.symbol(), false),
            Declaration::Function(func) => (func.prototype.symbol(), func.prototype.is_anonymous()),
        };
        let committed = self.checker.signature(&name).cloned();
        self.checker.check(&mut decl, &self.types)?;

        let lowered = match self
            .codegen
            .lower_declaration(decl, &mut self.module, &self.types, &mut self.precedence)
        {
            Ok(lowered) => lowered,
            Err(err) => {
                // The module still holds the previous definition, if any.
                self.checker.restore(&name, committed);
                return Err(err);
            }
        };

        match lowered {
            Lowered::Struct => Ok(UnitOutcome::StructDefined(name)),
            Lowered::Declared(id) => {
                self.record_ir(id);
                Ok(UnitOutcome::Declared(name))
            }
            Lowered::Defined(id) if anonymous => {
                self.record_ir(id);
                let limits = Limits {
                    step_limit: self.config.step_limit,
                    max_call_depth: self.config.max_call_depth,
                };
                let result = Interpreter::new(&self.module, limits).call(id, Vec::new());
                self.module.erase_function(id);
                Ok(UnitOutcome::Evaluated(result?))
            }
            Lowered::Defined(id) => {
                self.record_ir(id);
                Ok(UnitOutcome::Defined(name))
            }
        }
    }

    fn record_ir(&mut self, id: FuncId) {
        let Some(text) = self.module.display_function(id) else {
            return;
        };
        tracing::trace!(ir = %text, "lowered IR");
        if self.config.print_ir {
            self.printed_ir.push(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::ExecError;

    fn outcomes(session: &mut Session, source: &str) -> Vec<UnitOutcome> {
        session
            .process(source)
            .into_iter()
            .map(|outcome| outcome.unwrap_or_else(|err| panic!("{source}: {err}")))
            .collect()
    }

    #[test]
    fn processes_definition_extern_and_expression() {
        let mut session = Session::default();
        let units = outcomes(
            &mut session,
            "def f(x: double) -> double { return x + x; }\n\
             extern sin(x: double) -> double\n\
             exec: double 2 + 3",
        );
        assert_eq!(
            units,
            vec![
                UnitOutcome::Defined("f".to_string()),
                UnitOutcome::Declared("sin".to_string()),
                UnitOutcome::Evaluated(RuntimeValue::F64(5.0)),
            ]
        );
        assert_eq!(units[2].to_string(), "5.000000");
    }

    #[test]
    fn anonymous_functions_are_erased_after_evaluation() {
        let mut session = Session::default();
        session.evaluate("exec: double 1").unwrap();
        session.evaluate("exec: i32 2").unwrap();
        assert!(session.module().function_by_name("__anon_expr").is_none());
        assert_eq!(session.module().functions().count(), 0);
    }

    #[test]
    fn failing_declaration_does_not_block_the_rest() {
        let mut session = Session::default();
        let results = session.process(
            "def bad() -> double { nope }\n\
             def good() -> double { 4 }\n\
             exec good()",
        );
        assert!(matches!(results[0], Err(CoreError::TypeError(_))));
        assert_eq!(results[1].as_ref().unwrap(), &UnitOutcome::Defined("good".to_string()));
        assert_eq!(
            results[2].as_ref().unwrap(),
            &UnitOutcome::Evaluated(RuntimeValue::F64(4.0))
        );
    }

    #[test]
    fn rejected_redefinition_keeps_the_original_signature() {
        let mut session = Session::default();
        outcomes(&mut session, "def f(x: double) -> double { x + x }");
        let results = session.process("def f(x: i32) -> i32 { x }");
        assert!(matches!(results[0], Err(CoreError::LowerError(_))), "{:?}", results[0]);

        assert_eq!(session.evaluate("exec f(2)").unwrap(), RuntimeValue::F64(4.0));
        outcomes(&mut session, "def g(y: double) -> double { f(y) }");
        assert_eq!(session.evaluate("exec g(3)").unwrap(), RuntimeValue::F64(6.0));
    }

    #[test]
    fn failed_first_definition_leaves_no_signature() {
        let mut session = Session::default();
        let results = session.process("def h() -> i32 { 3000000000 }");
        assert!(matches!(results[0], Err(CoreError::LowerError(_))), "{:?}", results[0]);
        assert!(session.module().function_by_name("h").is_none());
        let err = session.evaluate("exec h()").unwrap_err();
        assert!(err.to_string().contains("unknown function `h`"), "{err}");
    }

    #[test]
    fn out_of_range_integer_literal_is_rejected() {
        let mut session = Session::default();
        let err = session.evaluate("exec: i32 3000000000").unwrap_err();
        assert!(matches!(err, CoreError::LowerError(_)), "{err}");
        let err = session.evaluate("exec: i32 2.5").unwrap_err();
        assert!(err.to_string().contains("`2.5`"), "{err}");
        assert_eq!(session.evaluate("exec: i32 2147483647").unwrap(), RuntimeValue::I32(i32::MAX));
    }

    #[test]
    fn parse_error_rejects_the_whole_chunk() {
        let mut session = Session::default();
        let results = session.process("def f() -> double { 1 }\ndef g() -> double { 1 2 }");
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(CoreError::ParseError(_))));
        assert!(session.module().function_by_name("f").is_none());
    }

    #[test]
    fn lex_error_reports_position() {
        let mut session = Session::default();
        let err = session.evaluate("exec 1 + é").unwrap_err();
        assert!(matches!(err, CoreError::LexError { position: 9, .. }), "{err}");
    }

    #[test]
    fn state_persists_between_chunks() {
        let mut session = Session::default();
        outcomes(&mut session, "struct P { x: double, y: double, }");
        outcomes(&mut session, "def binary ^ 60 (a: double, b: double) -> double { a * b }");
        outcomes(&mut session, "def norm() -> double { var p: P; p.x = 3; p.y = 4; p.x ^ p.x + p.y ^ p.y }");
        assert_eq!(session.evaluate("exec norm()").unwrap(), RuntimeValue::F64(25.0));
        assert_eq!(session.precedence().get("^"), Some(60));
        assert!(session.types().contains_struct("P"));
    }

    #[test]
    fn step_limit_comes_from_config() {
        let mut session = Session::new(SessionConfig {
            step_limit: 1_000,
            ..SessionConfig::default()
        });
        outcomes(&mut session, "def spin(n: double) -> double { var t: double; for (i = 0, i < n) { t = t + 1; } t }");
        let err = session.evaluate("exec spin(100000)").unwrap_err();
        assert!(matches!(err, CoreError::Exec(ExecError::StepLimit(1_000))), "{err}");
        // The session stays usable.
        assert_eq!(session.evaluate("exec spin(2)").unwrap(), RuntimeValue::F64(3.0));
    }

    #[test]
    fn deep_recursion_hits_the_call_depth_limit() {
        let mut session = Session::new(SessionConfig {
            max_call_depth: 16,
            ..SessionConfig::default()
        });
        outcomes(&mut session, "def down(n: double) -> double { if (n < 1) { return 0; } return down(n - 1); }");
        assert_eq!(session.evaluate("exec down(10)").unwrap(), RuntimeValue::F64(0.0));
        let err = session.evaluate("exec down(100)").unwrap_err();
        assert!(matches!(err, CoreError::Exec(ExecError::CallDepth(16))), "{err}");
    }

    #[test]
    fn print_ir_collects_lowered_functions() {
        let mut session = Session::new(SessionConfig {
            print_ir: true,
            ..SessionConfig::default()
        });
        outcomes(&mut session, "extern sin(x: double) -> double\ndef f(x: double) -> double { sin(x) }");
        let printed = session.take_printed_ir();
        assert_eq!(printed.len(), 2);
        assert!(printed[0].starts_with("declare double @sin(double)"), "{}", printed[0]);
        assert!(printed[1].contains("call double @sin"), "{}", printed[1]);
        assert!(session.take_printed_ir().is_empty());
    }
}
