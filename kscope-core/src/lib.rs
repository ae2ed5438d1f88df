//! Core pipeline for the kscope language.
//!
//! The pipeline is roughly:
//!
//!   source text
//!     -> lexer      (tokens)
//!     -> parser     (AST, operator precedences installed on the fly)
//!     -> typecheck  (two-pass inference against expected types)
//!     -> codegen    (IR through the `IrBuilder` interface)
//!     -> interp     (evaluation of top-level expressions)
//!
//! The CLI and tests drive everything through [`Session`].

// ---------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------

pub mod error;

// ---------------------------------------------------------------------
// Front-end: lexing and parsing
// ---------------------------------------------------------------------

pub mod lexer;
pub mod precedence;
pub mod parser;
pub mod ast;

// ---------------------------------------------------------------------
// Semantic layers: types, scopes, type checking
// ---------------------------------------------------------------------

pub mod types;
pub mod symbols;
pub mod typecheck;

// ---------------------------------------------------------------------
// Back-end: IR, lowering and evaluation
// ---------------------------------------------------------------------

pub mod ir;
pub mod operators;
pub mod codegen;
pub mod builtins;
pub mod interp;
pub mod compiler;

// ---------------------------------------------------------------------
// Public API re-exports
// ---------------------------------------------------------------------

pub use compiler::{Session, SessionConfig, UnitOutcome};
pub use error::CoreError;
pub use interp::{ExecError, RuntimeValue};
pub use lexer::{Token, TokenKind, tokenize};
pub use parser::parse;
pub use precedence::PrecedenceTable;
