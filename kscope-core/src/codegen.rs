//! Lowering of checked declarations onto an [`IrBuilder`].
//!
//! Every function gets a single exit block and, unless it returns `void`,
//! one return slot. `return` stores into the slot and jumps to the exit
//! block, so a body may return from anywhere while the emitted CFG keeps
//! exactly one `ret`.
//!
//! Arrays and structs are passed around as the address of their storage
//! and only loaded into first-class values at call boundaries, stores and
//! returns.

use std::collections::HashMap;

use crate::ast::{Address, Body, Declaration, Expr, Function, OperatorKind, Prototype, operator_symbol};
use crate::error::CoreError;
use crate::ir::{BlockId, FuncId, IrBuilder, IrType, Predicate, ValueId};
use crate::operators::{self, BuiltinOperator, Dispatch, OperatorDispatch};
use crate::precedence::PrecedenceTable;
use crate::symbols::{AddressStep, SymbolTable, TypedValue};
use crate::types::{Primitive, TypeDescriptor, TypeRegistry};

type LowerResult<T> = Result<T, CoreError>;

fn lower_error<T>(message: impl Into<String>) -> LowerResult<T> {
    Err(CoreError::LowerError(message.into()))
}

/// What lowering one declaration produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lowered {
    /// Struct declarations need no IR.
    Struct,
    Declared(FuncId),
    Defined(FuncId),
}

/// `value` as an `i32`, if it is integral and in range.
fn int_literal(value: f64) -> Option<i32> {
    let in_range = (f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&value);
    (in_range && value.fract() == 0.0).then_some(value as i32)
}

/// Lowering state that outlives a single declaration.
#[derive(Debug, Default)]
pub struct CodeGenerator {
    dispatch: OperatorDispatch,
    prototypes: HashMap<String, Prototype>,
}

impl CodeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&self) -> &OperatorDispatch {
        &self.dispatch
    }

    /// Lower a batch; one result per declaration, in order.
    pub fn lower<B: IrBuilder>(
        &mut self,
        declarations: Vec<Declaration>,
        builder: &mut B,
        types: &TypeRegistry,
        precedence: &mut PrecedenceTable,
    ) -> Vec<LowerResult<Lowered>> {
        declarations
            .into_iter()
            .map(|decl| self.lower_declaration(decl, builder, types, precedence))
            .collect()
    }

    pub fn lower_declaration<B: IrBuilder>(
        &mut self,
        declaration: Declaration,
        builder: &mut B,
        types: &TypeRegistry,
        precedence: &mut PrecedenceTable,
    ) -> LowerResult<Lowered> {
        match declaration {
            Declaration::Struct(_) => Ok(Lowered::Struct),
            Declaration::Extern(prototype) => self.lower_extern(prototype, builder, types).map(Lowered::Declared),
            Declaration::Function(func) => self
                .lower_function(func, builder, types, precedence)
                .map(Lowered::Defined),
        }
    }

    fn lower_extern<B: IrBuilder>(
        &mut self,
        prototype: Prototype,
        builder: &mut B,
        types: &TypeRegistry,
    ) -> LowerResult<FuncId> {
        let symbol = prototype.symbol();
        let (params, ret) = signature(&prototype, types)?;
        let id = builder.declare_function(&symbol, params, ret)?;
        if prototype.is_operator() {
            self.dispatch.invalidate(&symbol);
        }
        tracing::debug!(%symbol, "declared function");
        self.prototypes.insert(symbol, prototype);
        Ok(id)
    }

    fn lower_function<B: IrBuilder>(
        &mut self,
        func: Function,
        builder: &mut B,
        types: &TypeRegistry,
        precedence: &mut PrecedenceTable,
    ) -> LowerResult<FuncId> {
        let prototype = &func.prototype;
        let symbol = prototype.symbol();
        let (params, ret) = signature(prototype, types)?;

        let existing = builder.get_function(&symbol);
        if let Some(id) = existing {
            if builder.has_body(id) {
                return lower_error(format!("function `{symbol}` is already defined"));
            }
        }
        let id = builder.declare_function(&symbol, params, ret)?;

        // Anonymous functions are erased after evaluation and never called.
        let previous = if prototype.is_anonymous() {
            None
        } else {
            self.prototypes.insert(symbol.clone(), prototype.clone())
        };

        let outcome = FunctionLowering::begin(builder, types, &self.prototypes, &mut self.dispatch, id, prototype)
            .and_then(|mut lowering| lowering.finish(&func.body));
        if prototype.is_operator() {
            self.dispatch.invalidate(&symbol);
        }

        match outcome {
            Ok(()) => {
                if prototype.is_binary_operator() {
                    precedence.set(&prototype.name, prototype.precedence);
                }
                tracing::debug!(%symbol, "lowered function");
                Ok(id)
            }
            Err(err) => {
                if existing.is_some() {
                    builder.clear_body(id);
                } else {
                    builder.erase_function(id);
                }
                if !prototype.is_anonymous() {
                    match previous {
                        Some(previous) => self.prototypes.insert(symbol.clone(), previous),
                        None if existing.is_none() => self.prototypes.remove(&symbol),
                        None => None,
                    };
                }
                tracing::warn!(%symbol, %err, "function discarded");
                Err(err)
            }
        }
    }
}

/// IR parameter and result types of a prototype.
fn signature(prototype: &Prototype, types: &TypeRegistry) -> LowerResult<(Vec<IrType>, IrType)> {
    let ir_type = |name: &str| -> LowerResult<IrType> {
        types
            .resolve(name)
            .and_then(|ty| ty.to_ir())
            .map_err(CoreError::LowerError)
    };
    let params = prototype
        .args
        .iter()
        .map(|(_, ty)| ir_type(ty))
        .collect::<LowerResult<Vec<_>>>()?;
    Ok((params, ir_type(&prototype.return_type)?))
}

fn scalar(ty: &TypeDescriptor) -> Option<Primitive> {
    match ty {
        TypeDescriptor::Primitive(p @ (Primitive::Int32 | Primitive::Double)) => Some(*p),
        _ => None,
    }
}

/// Per-function lowering context.
struct FunctionLowering<'a, B: IrBuilder> {
    builder: &'a mut B,
    types: &'a TypeRegistry,
    prototypes: &'a HashMap<String, Prototype>,
    dispatch: &'a mut OperatorDispatch,
    symbols: SymbolTable,
    func: FuncId,
    exit: BlockId,
    ret_slot: Option<(ValueId, TypeDescriptor)>,
}

impl<'a, B: IrBuilder> FunctionLowering<'a, B> {
    /// Emit the entry block: parameter slots, the exit block and the return slot.
    fn begin(
        builder: &'a mut B,
        types: &'a TypeRegistry,
        prototypes: &'a HashMap<String, Prototype>,
        dispatch: &'a mut OperatorDispatch,
        func: FuncId,
        prototype: &Prototype,
    ) -> LowerResult<Self> {
        let entry = builder.append_block(func, "entry")?;
        builder.position_at_end(entry);

        let mut symbols = SymbolTable::new();
        for (index, (name, ty)) in prototype.args.iter().enumerate() {
            let descriptor = types.resolve(ty).map_err(CoreError::LowerError)?;
            let slot = builder.build_alloca(descriptor.to_ir().map_err(CoreError::LowerError)?)?;
            let incoming = builder.param(func, index)?;
            builder.build_store(incoming, slot)?;
            symbols.add_variant(name, slot, descriptor);
        }
        symbols.step();

        let exit = builder.append_block(func, "exit")?;
        let ret = types
            .resolve(&prototype.return_type)
            .map_err(CoreError::LowerError)?;
        let ret_slot = if ret.is_void() {
            None
        } else {
            let slot = builder.build_alloca(ret.to_ir().map_err(CoreError::LowerError)?)?;
            Some((slot, ret))
        };

        Ok(FunctionLowering {
            builder,
            types,
            prototypes,
            dispatch,
            symbols,
            func,
            exit,
            ret_slot,
        })
    }

    /// Lower the body, route its value into the return slot and emit the exit block.
    fn finish(&mut self, body: &Body) -> LowerResult<()> {
        let value = self.lower_body(body)?;
        if let (Some(value), Some((slot, _))) = (value, self.ret_slot.clone()) {
            let stored = self.materialize(&value)?;
            self.builder.build_store(stored, slot)?;
        }
        self.branch_to(self.exit)?;

        self.builder.position_at_end(self.exit);
        match self.ret_slot.clone() {
            Some((slot, ty)) => {
                let ir = ty.to_ir().map_err(CoreError::LowerError)?;
                let result = self.builder.build_load(ir, slot)?;
                self.builder.build_ret(Some(result))?;
            }
            None => self.builder.build_ret(None)?,
        }
        Ok(())
    }

    fn branch_to(&mut self, target: BlockId) -> LowerResult<()> {
        match self.builder.current_block() {
            Some(current) if !self.builder.is_terminated(current) => Ok(self.builder.build_br(target)?),
            _ => Ok(()),
        }
    }

    fn current_block(&self) -> LowerResult<BlockId> {
        match self.builder.current_block() {
            Some(block) => Ok(block),
            None => lower_error("no insertion block"),
        }
    }

    fn ir_type(&self, ty: &TypeDescriptor) -> LowerResult<IrType> {
        ty.to_ir().map_err(CoreError::LowerError)
    }

    fn resolve(&self, name: &str) -> LowerResult<TypeDescriptor> {
        self.types.resolve(name).map_err(CoreError::LowerError)
    }

    /// First-class value of `value`: aggregates are loaded from their storage.
    fn materialize(&mut self, value: &TypedValue) -> LowerResult<ValueId> {
        if value.ty.is_aggregate() {
            let ir = self.ir_type(&value.ty)?;
            Ok(self.builder.build_load(ir, value.value)?)
        } else {
            Ok(value.value)
        }
    }

    /// Wrap a call result; aggregates are spilled into fresh storage.
    fn call_result(&mut self, value: ValueId, ty: TypeDescriptor) -> LowerResult<Option<TypedValue>> {
        if ty.is_void() {
            return Ok(None);
        }
        if ty.is_aggregate() {
            let ir = self.ir_type(&ty)?;
            let slot = self.builder.build_alloca(ir)?;
            self.builder.build_store(value, slot)?;
            return Ok(Some(TypedValue { value: slot, ty }));
        }
        Ok(Some(TypedValue { value, ty }))
    }

    /// `i1` that is true when `value` differs from zero.
    fn truthiness(&mut self, value: &TypedValue, what: &str) -> LowerResult<ValueId> {
        match scalar(&value.ty) {
            Some(Primitive::Int32) => {
                let zero = self.builder.const_i32(0)?;
                Ok(self.builder.build_compare(Predicate::Ne, value.value, zero)?)
            }
            Some(Primitive::Double) => {
                let zero = self.builder.const_f64(0.0)?;
                Ok(self.builder.build_compare(Predicate::One, value.value, zero)?)
            }
            _ => lower_error(format!("{what} of type `{}` is not numeric", value.ty.name())),
        }
    }

    fn lower_body(&mut self, body: &Body) -> LowerResult<Option<TypedValue>> {
        let mut last = None;
        for expr in &body.expressions {
            last = self.lower_expr(expr)?;
        }
        Ok(if body.has_return_value { last } else { None })
    }

    fn expect_value(&mut self, expr: &Expr, what: &str) -> LowerResult<TypedValue> {
        match self.lower_expr(expr)? {
            Some(value) => Ok(value),
            None => lower_error(format!("{what} does not produce a value")),
        }
    }

    fn lower_address(&mut self, address: &[Address]) -> LowerResult<Vec<AddressStep>> {
        let mut steps = Vec::with_capacity(address.len());
        for step in address {
            steps.push(match step {
                Address::Index(index) => {
                    let index = self.expect_value(index, "index expression")?;
                    if scalar(&index.ty) != Some(Primitive::Int32) {
                        return lower_error(format!("index of type `{}` is not i32", index.ty.name()));
                    }
                    AddressStep::Index(index.value)
                }
                Address::Field(field) => AddressStep::Field(field.clone()),
            });
        }
        Ok(steps)
    }

    fn lower_expr(&mut self, expr: &Expr) -> LowerResult<Option<TypedValue>> {
        match expr {
            Expr::Literal { value, ty } => {
                let descriptor = self.resolve(ty)?;
                let value = match scalar(&descriptor) {
                    Some(Primitive::Int32) => match int_literal(*value) {
                        Some(int) => self.builder.const_i32(int)?,
                        None => return lower_error(format!("literal `{value}` is not a valid `i32`")),
                    },
                    Some(Primitive::Double) => self.builder.const_f64(*value)?,
                    _ => return lower_error(format!("literal of type `{ty}` cannot be lowered")),
                };
                Ok(Some(TypedValue { value, ty: descriptor }))
            }
            Expr::Variable { name, address } => {
                let steps = self.lower_address(address)?;
                let value = self
                    .symbols
                    .load_addressed(self.builder, name, &steps)
                    .map_err(CoreError::LowerError)?;
                Ok(Some(value))
            }
            Expr::Binary { op, lhs, rhs } if op == "=" => self.lower_assignment(lhs, rhs).map(Some),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.expect_value(lhs, "left operand")?;
                let rhs = self.expect_value(rhs, "right operand")?;
                self.lower_operator(OperatorKind::Binary, op, vec![lhs, rhs])
            }
            Expr::Unary { op, operand } => {
                let operand = self.expect_value(operand, "operand")?;
                self.lower_operator(OperatorKind::Unary, op, vec![operand])
            }
            Expr::Call { callee, args } => {
                let Some(func) = self.builder.get_function(callee) else {
                    return lower_error(format!("unknown function referenced: `{callee}`"));
                };
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.expect_value(arg, "argument")?);
                }
                self.call(func, callee, &values)
            }
            Expr::If {
                condition,
                then_body,
                else_body,
            } => self.lower_if(condition, then_body, else_body.as_ref()),
            Expr::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                self.symbols.step();
                let outcome = self.lower_for(var, start, end, step.as_deref(), body);
                self.symbols.back();
                outcome.map(|()| None)
            }
            Expr::VarDeclare {
                name,
                ty,
                init,
                is_const,
            } => {
                self.lower_var(name, ty, init.as_deref(), *is_const)?;
                Ok(None)
            }
            Expr::Return(value) => {
                let value = self.lower_expr(value)?;
                if let (Some(value), Some((slot, _))) = (value, self.ret_slot.clone()) {
                    let stored = self.materialize(&value)?;
                    self.builder.build_store(stored, slot)?;
                }
                self.builder.build_br(self.exit)?;
                // Code after a return still needs somewhere to go.
                let rest = self.builder.append_block(self.func, "afterret")?;
                self.builder.position_at_end(rest);
                Ok(None)
            }
            Expr::Array { elements, ty } => self.lower_array(elements, ty).map(Some),
        }
    }

    fn lower_assignment(&mut self, target: &Expr, value: &Expr) -> LowerResult<TypedValue> {
        let Expr::Variable { name, address } = target else {
            return lower_error("destination of `=` must be a variable");
        };
        let value = self.expect_value(value, "assigned expression")?;
        let steps = self.lower_address(address)?;
        let stored = self.materialize(&value)?;
        self.symbols
            .store_addressed(self.builder, name, &steps, stored)
            .map_err(CoreError::LowerError)?;
        Ok(value)
    }

    fn lower_operator(
        &mut self,
        kind: OperatorKind,
        op: &str,
        operands: Vec<TypedValue>,
    ) -> LowerResult<Option<TypedValue>> {
        let Some(first) = operands.first() else {
            return lower_error(format!("operator `{op}` without operands"));
        };
        let Some(dispatch) = self.dispatch.resolve(&*self.builder, kind, op, &first.ty) else {
            return lower_error(format!(
                "{} operator `{op}` is not defined for `{}`",
                kind.prefix(),
                first.ty.name()
            ));
        };
        match dispatch {
            Dispatch::Builtin(..) => {
                let ty = first.ty.clone();
                if let Some(other) = operands.iter().find(|v| v.ty != ty) {
                    return lower_error(format!(
                        "binary operator `{op}` with two different types, left is `{}`, right is `{}`",
                        ty.name(),
                        other.ty.name()
                    ));
                }
                let values: Vec<_> = operands.iter().map(|v| v.value).collect();
                let value = operators::emit(self.builder, dispatch, &values)?;
                Ok(Some(TypedValue { value, ty }))
            }
            Dispatch::Function(func) => {
                let symbol = operator_symbol(kind, op);
                self.call(func, &symbol, &operands)
            }
        }
    }

    fn call(&mut self, func: FuncId, symbol: &str, args: &[TypedValue]) -> LowerResult<Option<TypedValue>> {
        let Some(prototype) = self.prototypes.get(symbol) else {
            return lower_error(format!("unknown function referenced: `{symbol}`"));
        };
        let ret = self.resolve(&prototype.return_type)?;
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.materialize(arg)?);
        }
        let result = self.builder.build_call(func, &values)?;
        self.call_result(result, ret)
    }

    fn lower_if(&mut self, condition: &Expr, then_body: &Body, else_body: Option<&Body>) -> LowerResult<Option<TypedValue>> {
        let condition = self.expect_value(condition, "if condition")?;
        let flag = self.truthiness(&condition, "if condition")?;

        let then_block = self.builder.append_block(self.func, "then")?;
        let else_block = self.builder.append_block(self.func, "else")?;
        let merge = self.builder.append_block(self.func, "ifcont")?;
        self.builder.build_cond_br(flag, then_block, else_block)?;

        self.builder.position_at_end(then_block);
        self.symbols.step();
        let then_value = self.lower_body(then_body);
        self.symbols.back();
        let then_value = then_value?;
        let then_end = self.current_block()?;
        self.branch_to(merge)?;

        self.builder.position_at_end(else_block);
        let else_value = match else_body {
            Some(body) => {
                self.symbols.step();
                let value = self.lower_body(body);
                self.symbols.back();
                value?
            }
            None => None,
        };
        let else_end = self.current_block()?;
        self.branch_to(merge)?;

        self.builder.position_at_end(merge);
        let (Some(then_value), Some(else_value)) = (then_value, else_value) else {
            return Ok(None);
        };
        if then_value.ty != else_value.ty {
            return lower_error(format!(
                "if branches produce different types `{}` and `{}`",
                then_value.ty.name(),
                else_value.ty.name()
            ));
        }
        // Aggregates merge their storage addresses.
        let ir = if then_value.ty.is_aggregate() {
            IrType::Ptr
        } else {
            self.ir_type(&then_value.ty)?
        };
        let value = self
            .builder
            .build_phi(ir, &[(then_value.value, then_end), (else_value.value, else_end)])?;
        Ok(Some(TypedValue {
            value,
            ty: then_value.ty,
        }))
    }

    fn lower_for(&mut self, var: &str, start: &Expr, end: &Expr, step: Option<&Expr>, body: &Body) -> LowerResult<()> {
        let start = self.expect_value(start, "loop start")?;
        let Some(primitive) = scalar(&start.ty) else {
            return lower_error(format!("loop variable of type `{}` is not numeric", start.ty.name()));
        };
        let var_ir = self.ir_type(&start.ty)?;
        let slot = self.builder.build_alloca(var_ir.clone())?;
        self.builder.build_store(start.value, slot)?;
        self.symbols.add_variant(var, slot, start.ty.clone());

        let loop_block = self.builder.append_block(self.func, "loop")?;
        self.builder.build_br(loop_block)?;
        self.builder.position_at_end(loop_block);

        self.lower_body(body)?;

        let step = match step {
            Some(step) => {
                let step = self.expect_value(step, "loop step")?;
                if step.ty != start.ty {
                    return lower_error(format!(
                        "loop step of type `{}` does not match loop variable `{}`",
                        step.ty.name(),
                        start.ty.name()
                    ));
                }
                step.value
            }
            None => match primitive {
                Primitive::Int32 => self.builder.const_i32(1)?,
                _ => self.builder.const_f64(1.0)?,
            },
        };
        // The end condition sees the variable before this iteration's increment.
        let end = self.expect_value(end, "loop end condition")?;
        let current = self.builder.build_load(var_ir, slot)?;
        let next = operators::emit(
            self.builder,
            Dispatch::Builtin(primitive, BuiltinOperator::Add),
            &[current, step],
        )?;
        self.builder.build_store(next, slot)?;
        let again = self.truthiness(&end, "loop end condition")?;

        let after = self.builder.append_block(self.func, "afterloop")?;
        self.builder.build_cond_br(again, loop_block, after)?;
        self.builder.position_at_end(after);
        Ok(())
    }

    fn lower_var(&mut self, name: &str, ty: &str, init: Option<&Expr>, is_const: bool) -> LowerResult<()> {
        let descriptor = self.resolve(ty)?;
        let init = match init {
            Some(init) => Some(self.expect_value(init, "initializer")?),
            None => None,
        };
        if let Some(value) = &init {
            if value.ty != descriptor {
                return lower_error(format!(
                    "`{name}` of type `{ty}` initialized with `{}`",
                    value.ty.name()
                ));
            }
        }

        if is_const && !descriptor.is_aggregate() {
            let Some(value) = init else {
                return lower_error(format!("constant `{name}` requires an initializer"));
            };
            self.symbols.add_constant(name, value.value, descriptor);
            return Ok(());
        }

        let ir = self.ir_type(&descriptor)?;
        let slot = self.builder.build_alloca(ir)?;
        match &init {
            Some(value) => {
                let stored = self.materialize(value)?;
                self.builder.build_store(stored, slot)?;
            }
            None => match scalar(&descriptor) {
                Some(Primitive::Int32) => {
                    let zero = self.builder.const_i32(0)?;
                    self.builder.build_store(zero, slot)?;
                }
                Some(Primitive::Double) => {
                    let zero = self.builder.const_f64(0.0)?;
                    self.builder.build_store(zero, slot)?;
                }
                _ => {}
            },
        }
        if is_const {
            // A constant aggregate is a private copy bound by address.
            self.symbols.add_constant(name, slot, descriptor);
        } else {
            self.symbols.add_variant(name, slot, descriptor);
        }
        Ok(())
    }

    fn lower_array(&mut self, elements: &[Expr], ty: &str) -> LowerResult<TypedValue> {
        let descriptor = self.resolve(ty)?;
        let TypeDescriptor::Array { element, length } = &descriptor else {
            return lower_error(format!("array literal of non-array type `{ty}`"));
        };
        if *length != elements.len() {
            return lower_error(format!("array literal has {} elements, `{ty}` needs {length}", elements.len()));
        }
        let ir = self.ir_type(&descriptor)?;
        let slot = self.builder.build_alloca(ir.clone())?;
        let zero = self.builder.const_i32(0)?;
        for (position, item) in elements.iter().enumerate() {
            let value = self.expect_value(item, "array element")?;
            if value.ty != **element {
                return lower_error(format!(
                    "array element of type `{}` in `{ty}`",
                    value.ty.name()
                ));
            }
            let stored = self.materialize(&value)?;
            let index = i32::try_from(position).map_err(|err| CoreError::LowerError(err.to_string()))?;
            let index = self.builder.const_i32(index)?;
            let address = self.builder.build_gep(ir.clone(), slot, &[zero, index])?;
            self.builder.build_store(stored, address)?;
        }
        Ok(TypedValue {
            value: slot,
            ty: descriptor,
        })
    }
}
