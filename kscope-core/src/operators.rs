//! Operator dispatch with a per-session cache.
//!
//! Each `(operand type, operator)` pair is resolved once, either to a
//! primitive instruction sequence or to a user operator function, and
//! the decision is reused for later uses of the same pair.

use std::collections::HashMap;

use crate::ast::{OperatorKind, operator_symbol};
use crate::ir::{BinaryOp, CastOp, FuncId, IrBuilder, IrError, IrType, Predicate, ValueId};
use crate::types::{Primitive, TypeDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinOperator {
    Add,
    Sub,
    Mul,
    Less,
}

impl BuiltinOperator {
    fn from_text(op: &str) -> Option<Self> {
        match op {
            "+" => Some(BuiltinOperator::Add),
            "-" => Some(BuiltinOperator::Sub),
            "*" => Some(BuiltinOperator::Mul),
            "<" => Some(BuiltinOperator::Less),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Builtin(Primitive, BuiltinOperator),
    Function(FuncId),
}

#[derive(Debug, Default)]
pub struct OperatorDispatch {
    cache: HashMap<(String, String), Dispatch>,
}

impl OperatorDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `op` applied to values of type `operand`.
    ///
    /// Builtins win for `i32` and `double`; everything else goes to the
    /// user function named `binary<op>` / `unary<op>`.
    pub fn resolve<B: IrBuilder>(
        &mut self,
        builder: &B,
        kind: OperatorKind,
        op: &str,
        operand: &TypeDescriptor,
    ) -> Option<Dispatch> {
        let symbol = operator_symbol(kind, op);
        let key = (operand.name(), symbol);
        if let Some(dispatch) = self.cache.get(&key) {
            return Some(*dispatch);
        }

        let builtin = match (kind, operand) {
            (OperatorKind::Binary, TypeDescriptor::Primitive(p @ (Primitive::Int32 | Primitive::Double))) => {
                BuiltinOperator::from_text(op).map(|b| Dispatch::Builtin(*p, b))
            }
            _ => None,
        };
        let dispatch = builtin.or_else(|| builder.get_function(&key.1).map(Dispatch::Function))?;
        tracing::trace!(operand = %key.0, op = %key.1, ?dispatch, "operator dispatch cached");
        self.cache.insert(key, dispatch);
        Some(dispatch)
    }

    /// Drop cached decisions for an operator function that was (re)defined or erased.
    pub fn invalidate(&mut self, symbol: &str) {
        self.cache.retain(|(_, cached), _| cached != symbol);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Emit the instructions for a resolved operator.
pub fn emit<B: IrBuilder>(builder: &mut B, dispatch: Dispatch, operands: &[ValueId]) -> Result<ValueId, IrError> {
    let (primitive, op) = match dispatch {
        Dispatch::Function(func) => return builder.build_call(func, operands),
        Dispatch::Builtin(primitive, op) => (primitive, op),
    };
    let [lhs, rhs] = operands else {
        return Err(IrError::TypeMismatch(format!(
            "builtin operator expects 2 operands, got {}",
            operands.len()
        )));
    };
    let (lhs, rhs) = (*lhs, *rhs);
    match (primitive, op) {
        (Primitive::Int32, BuiltinOperator::Add) => builder.build_binary(BinaryOp::Add, lhs, rhs),
        (Primitive::Int32, BuiltinOperator::Sub) => builder.build_binary(BinaryOp::Sub, lhs, rhs),
        (Primitive::Int32, BuiltinOperator::Mul) => builder.build_binary(BinaryOp::Mul, lhs, rhs),
        (Primitive::Int32, BuiltinOperator::Less) => {
            let flag = builder.build_compare(Predicate::Slt, lhs, rhs)?;
            builder.build_cast(CastOp::ZExt, flag, IrType::I32)
        }
        (Primitive::Double, BuiltinOperator::Add) => builder.build_binary(BinaryOp::FAdd, lhs, rhs),
        (Primitive::Double, BuiltinOperator::Sub) => builder.build_binary(BinaryOp::FSub, lhs, rhs),
        (Primitive::Double, BuiltinOperator::Mul) => builder.build_binary(BinaryOp::FMul, lhs, rhs),
        (Primitive::Double, BuiltinOperator::Less) => {
            let flag = builder.build_compare(Predicate::Ult, lhs, rhs)?;
            builder.build_cast(CastOp::UiToFp, flag, IrType::F64)
        }
        (Primitive::Void, _) => Err(IrError::TypeMismatch("operator applied to void".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{Interpreter, Limits, RuntimeValue};
    use crate::ir::Module;

    fn double() -> TypeDescriptor {
        TypeDescriptor::Primitive(Primitive::Double)
    }

    #[test]
    fn builtins_resolve_for_primitive_types() {
        let module = Module::new("test");
        let mut dispatch = OperatorDispatch::new();
        assert_eq!(
            dispatch.resolve(&module, OperatorKind::Binary, "+", &double()),
            Some(Dispatch::Builtin(Primitive::Double, BuiltinOperator::Add))
        );
        assert_eq!(dispatch.resolve(&module, OperatorKind::Binary, "|", &double()), None);
        assert_eq!(dispatch.resolve(&module, OperatorKind::Unary, "-", &double()), None);
        assert_eq!(dispatch.len(), 1);
    }

    #[test]
    fn user_operators_are_cached_until_invalidated() {
        let mut module = Module::new("test");
        let or = module
            .declare_function("binary|", vec![IrType::F64, IrType::F64], IrType::F64)
            .unwrap();
        let mut dispatch = OperatorDispatch::new();
        assert_eq!(
            dispatch.resolve(&module, OperatorKind::Binary, "|", &double()),
            Some(Dispatch::Function(or))
        );

        module.erase_function(or);
        // Still cached: the dispatcher does not re-resolve by name.
        assert_eq!(
            dispatch.resolve(&module, OperatorKind::Binary, "|", &double()),
            Some(Dispatch::Function(or))
        );
        dispatch.invalidate("binary|");
        assert_eq!(dispatch.resolve(&module, OperatorKind::Binary, "|", &double()), None);
        assert!(dispatch.is_empty());
    }

    #[test]
    fn less_than_yields_zero_or_one_in_operand_type() {
        let mut module = Module::new("test");
        let func = module.declare_function("lt", vec![IrType::I32, IrType::I32], IrType::I32).unwrap();
        let entry = module.append_block(func, "entry").unwrap();
        module.position_at_end(entry);
        let a = module.param(func, 0).unwrap();
        let b = module.param(func, 1).unwrap();
        let less = Dispatch::Builtin(Primitive::Int32, BuiltinOperator::Less);
        let result = emit(&mut module, less, &[a, b]).unwrap();
        module.build_ret(Some(result)).unwrap();

        let mut interp = Interpreter::new(&module, Limits::default());
        let args = |x, y| vec![RuntimeValue::I32(x), RuntimeValue::I32(y)];
        assert_eq!(interp.run("lt", args(1, 2)).unwrap(), RuntimeValue::I32(1));
        assert_eq!(interp.run("lt", args(2, 1)).unwrap(), RuntimeValue::I32(0));
    }
}
