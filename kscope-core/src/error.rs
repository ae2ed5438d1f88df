use thiserror::Error;

use crate::interp::ExecError;
use crate::ir::IrError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("lex error at byte {position}: {message}")]
    LexError { position: usize, message: String },
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("type error: {}", .0.join("; "))]
    TypeError(Vec<String>),
    #[error("lower error: {0}")]
    LowerError(String),
    #[error("execution error: {0}")]
    Exec(#[from] ExecError),
}

impl From<IrError> for CoreError {
    fn from(err: IrError) -> Self {
        CoreError::LowerError(err.to_string())
    }
}
