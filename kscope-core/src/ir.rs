//! Control-flow-graph IR and the builder interface the code generator targets.
//!
//! [`IrBuilder`] is the seam between lowering and whatever backend holds
//! the functions. [`Module`] is the in-memory implementation used by the
//! session and by [`crate::interp`]. Values and blocks are arena indices
//! scoped to their function; function ids are module-wide.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IrType {
    Void,
    I1,
    I32,
    F64,
    /// Opaque pointer into frame memory.
    Ptr,
    Array(Box<IrType>, usize),
    Struct(String, Vec<IrType>),
}

impl IrType {
    pub fn is_aggregate(&self) -> bool {
        matches!(self, IrType::Array(..) | IrType::Struct(..))
    }

    fn is_integer(&self) -> bool {
        matches!(self, IrType::I1 | IrType::I32)
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Void => write!(f, "void"),
            IrType::I1 => write!(f, "i1"),
            IrType::I32 => write!(f, "i32"),
            IrType::F64 => write!(f, "double"),
            IrType::Ptr => write!(f, "ptr"),
            IrType::Array(element, length) => write!(f, "[{length} x {element}]"),
            IrType::Struct(name, _) => write!(f, "%{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    func: FuncId,
    index: usize,
}

impl BlockId {
    pub fn func(self) -> FuncId {
        self.func
    }

    pub fn index(self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(usize);

impl ValueId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    FAdd,
    FSub,
    FMul,
}

impl BinaryOp {
    fn is_float(self) -> bool {
        matches!(self, BinaryOp::FAdd | BinaryOp::FSub | BinaryOp::FMul)
    }

    fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::FAdd => "fadd",
            BinaryOp::FSub => "fsub",
            BinaryOp::FMul => "fmul",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// Integer not-equal.
    Ne,
    /// Signed integer less-than.
    Slt,
    /// Ordered float not-equal.
    One,
    /// Unordered float less-than.
    Ult,
}

impl Predicate {
    fn is_float(self) -> bool {
        matches!(self, Predicate::One | Predicate::Ult)
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Predicate::Ne => "icmp ne",
            Predicate::Slt => "icmp slt",
            Predicate::One => "fcmp one",
            Predicate::Ult => "fcmp ult",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    /// Zero-extend `i1` to `i32`.
    ZExt,
    /// Unsigned integer to double.
    UiToFp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Alloca(IrType),
    Load { ty: IrType, ptr: ValueId },
    Store { value: ValueId, ptr: ValueId },
    /// Address of an element inside an aggregate, LLVM `getelementptr` style:
    /// the first index steps over `ptr` itself and must be zero.
    Gep { ty: IrType, ptr: ValueId, indices: Vec<ValueId> },
    Binary { op: BinaryOp, lhs: ValueId, rhs: ValueId },
    Compare { pred: Predicate, lhs: ValueId, rhs: ValueId },
    Cast { op: CastOp, value: ValueId },
    Phi(Vec<(ValueId, BlockId)>),
    Call { callee: FuncId, args: Vec<ValueId> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Param(usize),
    ConstI32(i32),
    ConstF64(f64),
    Instruction(Instruction),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueData {
    pub ty: IrType,
    pub kind: ValueKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: ValueId,
        then_block: BlockId,
        else_block: BlockId,
    },
    Ret(Option<ValueId>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub label: String,
    pub instructions: Vec<ValueId>,
    pub terminator: Option<Terminator>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<IrType>,
    pub ret: IrType,
    pub values: Vec<ValueData>,
    pub blocks: Vec<Block>,
}

impl Function {
    /// Functions without blocks are declarations resolved at run time.
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn value(&self, id: ValueId) -> Option<&ValueData> {
        self.values.get(id.0)
    }

    fn push_value(&mut self, ty: IrType, kind: ValueKind) -> ValueId {
        self.values.push(ValueData { ty, kind });
        ValueId(self.values.len() - 1)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IrError {
    #[error("no insertion point is set")]
    NoInsertionPoint,
    #[error("function id does not refer to a live function")]
    UnknownFunction,
    #[error("block `{0}` already has a terminator")]
    BlockTerminated(String),
    #[error("value %{0} is not defined in this function")]
    InvalidValue(usize),
    #[error("function `{0}` is already declared with a different signature")]
    SignatureMismatch(String),
    #[error("{0}")]
    TypeMismatch(String),
}

/// Construction primitives the code generator needs from a backend.
pub trait IrBuilder {
    fn get_function(&self, name: &str) -> Option<FuncId>;
    /// Declare `name`, or return the existing function if the signature matches.
    fn declare_function(&mut self, name: &str, params: Vec<IrType>, ret: IrType) -> Result<FuncId, IrError>;
    fn has_body(&self, func: FuncId) -> bool;
    /// Remove a function and everything built inside it.
    fn erase_function(&mut self, func: FuncId);
    /// Drop the blocks of `func`, turning it back into a declaration.
    fn clear_body(&mut self, func: FuncId);
    fn param(&self, func: FuncId, index: usize) -> Result<ValueId, IrError>;

    fn append_block(&mut self, func: FuncId, label: &str) -> Result<BlockId, IrError>;
    fn position_at_end(&mut self, block: BlockId);
    fn current_block(&self) -> Option<BlockId>;
    fn is_terminated(&self, block: BlockId) -> bool;

    fn const_i32(&mut self, value: i32) -> Result<ValueId, IrError>;
    fn const_f64(&mut self, value: f64) -> Result<ValueId, IrError>;
    /// Stack slot for `ty`, placed in the entry block of the current function.
    fn build_alloca(&mut self, ty: IrType) -> Result<ValueId, IrError>;
    fn build_load(&mut self, ty: IrType, ptr: ValueId) -> Result<ValueId, IrError>;
    fn build_store(&mut self, value: ValueId, ptr: ValueId) -> Result<(), IrError>;
    fn build_gep(&mut self, ty: IrType, ptr: ValueId, indices: &[ValueId]) -> Result<ValueId, IrError>;
    fn build_binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId, IrError>;
    fn build_compare(&mut self, pred: Predicate, lhs: ValueId, rhs: ValueId) -> Result<ValueId, IrError>;
    fn build_cast(&mut self, op: CastOp, value: ValueId, to: IrType) -> Result<ValueId, IrError>;
    fn build_phi(&mut self, ty: IrType, incoming: &[(ValueId, BlockId)]) -> Result<ValueId, IrError>;
    fn build_call(&mut self, func: FuncId, args: &[ValueId]) -> Result<ValueId, IrError>;

    fn build_br(&mut self, target: BlockId) -> Result<(), IrError>;
    fn build_cond_br(&mut self, cond: ValueId, then_block: BlockId, else_block: BlockId) -> Result<(), IrError>;
    fn build_ret(&mut self, value: Option<ValueId>) -> Result<(), IrError>;
}

/// A collection of functions plus the builder cursor.
#[derive(Debug, Default)]
pub struct Module {
    pub name: String,
    functions: Vec<Option<Function>>,
    by_name: HashMap<String, FuncId>,
    /// Slots freed by `erase_function`, reused by the next declaration.
    free: Vec<usize>,
    cursor: Option<BlockId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            functions: Vec::new(),
            by_name: HashMap::new(),
            free: Vec::new(),
            cursor: None,
        }
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.0).and_then(Option::as_ref)
    }

    pub fn function_by_name(&self, name: &str) -> Option<(FuncId, &Function)> {
        let id = *self.by_name.get(name)?;
        self.function(id).map(|func| (id, func))
    }

    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|func| (FuncId(index), func)))
    }

    /// Render a single function as text.
    pub fn display_function(&self, id: FuncId) -> Option<String> {
        self.function(id).map(|func| FunctionDisplay { module: self, func }.to_string())
    }

    fn function_mut(&mut self, id: FuncId) -> Result<&mut Function, IrError> {
        self.functions
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(IrError::UnknownFunction)
    }

    fn cursor(&self) -> Result<BlockId, IrError> {
        self.cursor.ok_or(IrError::NoInsertionPoint)
    }

    fn current_function(&self) -> Result<&Function, IrError> {
        let cursor = self.cursor()?;
        self.function(cursor.func).ok_or(IrError::UnknownFunction)
    }

    fn ty(&self, value: ValueId) -> Result<IrType, IrError> {
        self.current_function()?
            .value(value)
            .map(|data| data.ty.clone())
            .ok_or(IrError::InvalidValue(value.0))
    }

    fn expect_type(&self, value: ValueId, expected: &IrType, context: &str) -> Result<(), IrError> {
        let found = self.ty(value)?;
        if &found == expected {
            Ok(())
        } else {
            Err(IrError::TypeMismatch(format!("{context}: expected {expected}, found {found}")))
        }
    }

    /// Append an instruction at the cursor.
    fn push_instruction(&mut self, ty: IrType, instruction: Instruction) -> Result<ValueId, IrError> {
        let cursor = self.cursor()?;
        let func = self.function_mut(cursor.func)?;
        let block = func.blocks.get(cursor.index).ok_or(IrError::NoInsertionPoint)?;
        if block.terminator.is_some() {
            return Err(IrError::BlockTerminated(block.label.clone()));
        }
        let id = func.push_value(ty, ValueKind::Instruction(instruction));
        func.blocks[cursor.index].instructions.push(id);
        Ok(id)
    }

    fn terminate(&mut self, terminator: Terminator) -> Result<(), IrError> {
        let cursor = self.cursor()?;
        let func = self.function_mut(cursor.func)?;
        let block = func.blocks.get_mut(cursor.index).ok_or(IrError::NoInsertionPoint)?;
        if block.terminator.is_some() {
            return Err(IrError::BlockTerminated(block.label.clone()));
        }
        block.terminator = Some(terminator);
        Ok(())
    }

    fn check_block(&self, block: BlockId) -> Result<(), IrError> {
        let cursor = self.cursor()?;
        let owner = self.function(block.func).ok_or(IrError::UnknownFunction)?;
        if block.func != cursor.func || block.index >= owner.blocks.len() {
            return Err(IrError::TypeMismatch("branch target belongs to another function".to_string()));
        }
        Ok(())
    }
}

impl IrBuilder for Module {
    fn get_function(&self, name: &str) -> Option<FuncId> {
        self.function_by_name(name).map(|(id, _)| id)
    }

    fn declare_function(&mut self, name: &str, params: Vec<IrType>, ret: IrType) -> Result<FuncId, IrError> {
        if let Some((id, existing)) = self.function_by_name(name) {
            if existing.params == params && existing.ret == ret {
                return Ok(id);
            }
            return Err(IrError::SignatureMismatch(name.to_string()));
        }
        let mut func = Function {
            name: name.to_string(),
            params: params.clone(),
            ret,
            values: Vec::new(),
            blocks: Vec::new(),
        };
        for (index, ty) in params.into_iter().enumerate() {
            func.push_value(ty, ValueKind::Param(index));
        }
        let id = match self.free.pop() {
            Some(index) => {
                self.functions[index] = Some(func);
                FuncId(index)
            }
            None => {
                self.functions.push(Some(func));
                FuncId(self.functions.len() - 1)
            }
        };
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    fn has_body(&self, func: FuncId) -> bool {
        self.function(func).is_some_and(|f| !f.is_declaration())
    }

    fn erase_function(&mut self, func: FuncId) {
        if let Some(erased) = self.functions.get_mut(func.0).and_then(Option::take) {
            self.by_name.remove(&erased.name);
            self.free.push(func.0);
        }
        if self.cursor.is_some_and(|cursor| cursor.func == func) {
            self.cursor = None;
        }
    }

    fn clear_body(&mut self, func: FuncId) {
        if let Some(Some(function)) = self.functions.get_mut(func.0) {
            function.blocks.clear();
            function.values.truncate(function.params.len());
        }
        if self.cursor.is_some_and(|cursor| cursor.func == func) {
            self.cursor = None;
        }
    }

    fn param(&self, func: FuncId, index: usize) -> Result<ValueId, IrError> {
        let function = self.function(func).ok_or(IrError::UnknownFunction)?;
        if index < function.params.len() {
            Ok(ValueId(index))
        } else {
            Err(IrError::InvalidValue(index))
        }
    }

    fn append_block(&mut self, func: FuncId, label: &str) -> Result<BlockId, IrError> {
        let function = self.function_mut(func)?;
        let index = function.blocks.len();
        let label = if index == 0 || function.blocks.iter().all(|b| b.label != label) {
            label.to_string()
        } else {
            format!("{label}{index}")
        };
        function.blocks.push(Block {
            label,
            instructions: Vec::new(),
            terminator: None,
        });
        Ok(BlockId { func, index })
    }

    fn position_at_end(&mut self, block: BlockId) {
        self.cursor = Some(block);
    }

    fn current_block(&self) -> Option<BlockId> {
        self.cursor
    }

    fn is_terminated(&self, block: BlockId) -> bool {
        self.function(block.func)
            .and_then(|f| f.blocks.get(block.index))
            .is_some_and(|b| b.terminator.is_some())
    }

    fn const_i32(&mut self, value: i32) -> Result<ValueId, IrError> {
        let cursor = self.cursor()?;
        Ok(self
            .function_mut(cursor.func)?
            .push_value(IrType::I32, ValueKind::ConstI32(value)))
    }

    fn const_f64(&mut self, value: f64) -> Result<ValueId, IrError> {
        let cursor = self.cursor()?;
        Ok(self
            .function_mut(cursor.func)?
            .push_value(IrType::F64, ValueKind::ConstF64(value)))
    }

    fn build_alloca(&mut self, ty: IrType) -> Result<ValueId, IrError> {
        let cursor = self.cursor()?;
        let func = self.function_mut(cursor.func)?;
        let id = func.push_value(IrType::Ptr, ValueKind::Instruction(Instruction::Alloca(ty)));
        let values = &func.values;
        let entry = func.blocks.first_mut().ok_or(IrError::NoInsertionPoint)?;
        let slot = entry
            .instructions
            .iter()
            .take_while(|v| {
                matches!(
                    values.get(v.0).map(|d| &d.kind),
                    Some(ValueKind::Instruction(Instruction::Alloca(_)))
                )
            })
            .count();
        entry.instructions.insert(slot, id);
        Ok(id)
    }

    fn build_load(&mut self, ty: IrType, ptr: ValueId) -> Result<ValueId, IrError> {
        self.expect_type(ptr, &IrType::Ptr, "load address")?;
        self.push_instruction(ty.clone(), Instruction::Load { ty, ptr })
    }

    fn build_store(&mut self, value: ValueId, ptr: ValueId) -> Result<(), IrError> {
        self.expect_type(ptr, &IrType::Ptr, "store address")?;
        self.ty(value)?;
        self.push_instruction(IrType::Void, Instruction::Store { value, ptr })?;
        Ok(())
    }

    fn build_gep(&mut self, ty: IrType, ptr: ValueId, indices: &[ValueId]) -> Result<ValueId, IrError> {
        self.expect_type(ptr, &IrType::Ptr, "element address")?;
        let func = self.current_function()?;
        let mut current = &ty;
        for (position, index) in indices.iter().enumerate() {
            let data = func.value(*index).ok_or(IrError::InvalidValue(index.0))?;
            if data.ty != IrType::I32 {
                return Err(IrError::TypeMismatch(format!("element index must be i32, found {}", data.ty)));
            }
            if position == 0 {
                continue;
            }
            current = match current {
                IrType::Array(element, _) => element.as_ref(),
                IrType::Struct(name, fields) => match data.kind {
                    ValueKind::ConstI32(field) if field >= 0 && (field as usize) < fields.len() => {
                        &fields[field as usize]
                    }
                    _ => {
                        return Err(IrError::TypeMismatch(format!(
                            "field index into %{name} must be a constant in range"
                        )));
                    }
                },
                other => {
                    return Err(IrError::TypeMismatch(format!("cannot index into {other}")));
                }
            };
        }
        self.push_instruction(
            IrType::Ptr,
            Instruction::Gep {
                ty,
                ptr,
                indices: indices.to_vec(),
            },
        )
    }

    fn build_binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId, IrError> {
        let ty = self.ty(lhs)?;
        self.expect_type(rhs, &ty, op.mnemonic())?;
        let valid = if op.is_float() { ty == IrType::F64 } else { ty.is_integer() };
        if !valid {
            return Err(IrError::TypeMismatch(format!("{} is not defined for {ty}", op.mnemonic())));
        }
        self.push_instruction(ty, Instruction::Binary { op, lhs, rhs })
    }

    fn build_compare(&mut self, pred: Predicate, lhs: ValueId, rhs: ValueId) -> Result<ValueId, IrError> {
        let ty = self.ty(lhs)?;
        self.expect_type(rhs, &ty, pred.mnemonic())?;
        let valid = if pred.is_float() { ty == IrType::F64 } else { ty.is_integer() };
        if !valid {
            return Err(IrError::TypeMismatch(format!("{} is not defined for {ty}", pred.mnemonic())));
        }
        self.push_instruction(IrType::I1, Instruction::Compare { pred, lhs, rhs })
    }

    fn build_cast(&mut self, op: CastOp, value: ValueId, to: IrType) -> Result<ValueId, IrError> {
        let from = self.ty(value)?;
        let valid = match op {
            CastOp::ZExt => from.is_integer() && to.is_integer(),
            CastOp::UiToFp => from.is_integer() && to == IrType::F64,
        };
        if !valid {
            return Err(IrError::TypeMismatch(format!("cannot cast {from} to {to}")));
        }
        self.push_instruction(to, Instruction::Cast { op, value })
    }

    fn build_phi(&mut self, ty: IrType, incoming: &[(ValueId, BlockId)]) -> Result<ValueId, IrError> {
        for (value, block) in incoming {
            self.expect_type(*value, &ty, "phi incoming value")?;
            self.check_block(*block)?;
        }
        self.push_instruction(ty, Instruction::Phi(incoming.to_vec()))
    }

    fn build_call(&mut self, func: FuncId, args: &[ValueId]) -> Result<ValueId, IrError> {
        let callee = self.function(func).ok_or(IrError::UnknownFunction)?;
        let (name, params, ret) = (callee.name.clone(), callee.params.clone(), callee.ret.clone());
        if params.len() != args.len() {
            return Err(IrError::TypeMismatch(format!(
                "call to `{name}` expects {} arguments, got {}",
                params.len(),
                args.len()
            )));
        }
        for (arg, param) in args.iter().zip(&params) {
            self.expect_type(*arg, param, &format!("argument of `{name}`"))?;
        }
        self.push_instruction(
            ret,
            Instruction::Call {
                callee: func,
                args: args.to_vec(),
            },
        )
    }

    fn build_br(&mut self, target: BlockId) -> Result<(), IrError> {
        self.check_block(target)?;
        self.terminate(Terminator::Br(target))
    }

    fn build_cond_br(&mut self, cond: ValueId, then_block: BlockId, else_block: BlockId) -> Result<(), IrError> {
        self.expect_type(cond, &IrType::I1, "branch condition")?;
        self.check_block(then_block)?;
        self.check_block(else_block)?;
        self.terminate(Terminator::CondBr {
            cond,
            then_block,
            else_block,
        })
    }

    fn build_ret(&mut self, value: Option<ValueId>) -> Result<(), IrError> {
        let ret = self.current_function()?.ret.clone();
        match value {
            Some(value) => self.expect_type(value, &ret, "return value")?,
            None if ret != IrType::Void => {
                return Err(IrError::TypeMismatch(format!("missing return value of type {ret}")));
            }
            None => {}
        }
        self.terminate(Terminator::Ret(value))
    }
}

// ---------------------------------------------------------------------
// Text rendering
// ---------------------------------------------------------------------

struct FunctionDisplay<'m> {
    module: &'m Module,
    func: &'m Function,
}

impl FunctionDisplay<'_> {
    fn operand(&self, value: ValueId) -> String {
        match self.func.value(value).map(|data| &data.kind) {
            Some(ValueKind::ConstI32(v)) => v.to_string(),
            Some(ValueKind::ConstF64(v)) => format!("{v:?}"),
            _ => format!("%{}", value.0),
        }
    }

    fn typed(&self, value: ValueId) -> String {
        let ty = self
            .func
            .value(value)
            .map_or_else(|| "?".to_string(), |data| data.ty.to_string());
        format!("{ty} {}", self.operand(value))
    }

    fn label(&self, block: BlockId) -> String {
        self.func
            .blocks
            .get(block.index)
            .map_or_else(|| format!("bb{}", block.index), |b| b.label.clone())
    }

    fn instruction(&self, id: ValueId, inst: &Instruction) -> String {
        let result = format!("%{} = ", id.0);
        match inst {
            Instruction::Alloca(ty) => format!("{result}alloca {ty}"),
            Instruction::Load { ty, ptr } => format!("{result}load {ty}, ptr {}", self.operand(*ptr)),
            Instruction::Store { value, ptr } => {
                format!("store {}, ptr {}", self.typed(*value), self.operand(*ptr))
            }
            Instruction::Gep { ty, ptr, indices } => {
                let indices: Vec<_> = indices.iter().map(|i| self.typed(*i)).collect();
                format!("{result}getelementptr {ty}, ptr {}, {}", self.operand(*ptr), indices.join(", "))
            }
            Instruction::Binary { op, lhs, rhs } => {
                format!("{result}{} {}, {}", op.mnemonic(), self.typed(*lhs), self.operand(*rhs))
            }
            Instruction::Compare { pred, lhs, rhs } => {
                format!("{result}{} {}, {}", pred.mnemonic(), self.typed(*lhs), self.operand(*rhs))
            }
            Instruction::Cast { op, value } => {
                let to = self
                    .func
                    .value(id)
                    .map_or_else(|| "?".to_string(), |data| data.ty.to_string());
                let name = match op {
                    CastOp::ZExt => "zext",
                    CastOp::UiToFp => "uitofp",
                };
                format!("{result}{name} {} to {to}", self.typed(*value))
            }
            Instruction::Phi(incoming) => {
                let ty = self
                    .func
                    .value(id)
                    .map_or_else(|| "?".to_string(), |data| data.ty.to_string());
                let arms: Vec<_> = incoming
                    .iter()
                    .map(|(value, block)| format!("[ {}, %{} ]", self.operand(*value), self.label(*block)))
                    .collect();
                format!("{result}phi {ty} {}", arms.join(", "))
            }
            Instruction::Call { callee, args } => {
                let (name, ret) = self
                    .module
                    .function(*callee)
                    .map_or_else(|| ("<erased>".to_string(), IrType::Void), |f| (f.name.clone(), f.ret.clone()));
                let args: Vec<_> = args.iter().map(|a| self.typed(*a)).collect();
                let prefix = if ret == IrType::Void { String::new() } else { result };
                format!("{prefix}call {ret} @{name}({})", args.join(", "))
            }
        }
    }
}

impl fmt::Display for FunctionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = self.func;
        let keyword = if func.is_declaration() { "declare" } else { "define" };
        let params: Vec<_> = func
            .params
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                if func.is_declaration() {
                    ty.to_string()
                } else {
                    format!("{ty} %{i}")
                }
            })
            .collect();
        write!(f, "{keyword} {} @{}({})", func.ret, func.name, params.join(", "))?;
        if func.is_declaration() {
            return writeln!(f);
        }
        writeln!(f, " {{")?;
        for block in &func.blocks {
            writeln!(f, "{}:", block.label)?;
            for id in &block.instructions {
                if let Some(ValueKind::Instruction(inst)) = func.value(*id).map(|d| &d.kind) {
                    writeln!(f, "  {}", self.instruction(*id, inst))?;
                }
            }
            match &block.terminator {
                Some(Terminator::Br(target)) => writeln!(f, "  br label %{}", self.label(*target))?,
                Some(Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                }) => writeln!(
                    f,
                    "  br i1 {}, label %{}, label %{}",
                    self.operand(*cond),
                    self.label(*then_block),
                    self.label(*else_block)
                )?,
                Some(Terminator::Ret(Some(value))) => writeln!(f, "  ret {}", self.typed(*value))?,
                Some(Terminator::Ret(None)) => writeln!(f, "  ret void")?,
                None => writeln!(f, "  ; missing terminator")?,
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for (_, func) in self.functions() {
            writeln!(f)?;
            write!(f, "{}", FunctionDisplay { module: self, func })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn define(module: &mut Module, name: &str, params: Vec<IrType>, ret: IrType) -> (FuncId, BlockId) {
        let func = module.declare_function(name, params, ret).expect("declare");
        let entry = module.append_block(func, "entry").expect("entry");
        module.position_at_end(entry);
        (func, entry)
    }

    #[test]
    fn builds_and_prints_a_function() {
        let mut module = Module::new("test");
        let (func, _) = define(&mut module, "twice", vec![IrType::F64], IrType::F64);
        let x = module.param(func, 0).unwrap();
        let sum = module.build_binary(BinaryOp::FAdd, x, x).unwrap();
        module.build_ret(Some(sum)).unwrap();

        let text = module.to_string();
        assert!(text.contains("define double @twice(double %0) {"), "{text}");
        assert!(text.contains("%1 = fadd double %0, %0"), "{text}");
        assert!(text.contains("ret double %1"), "{text}");
    }

    #[test]
    fn allocas_are_hoisted_into_the_entry_block() {
        let mut module = Module::new("test");
        let (func, entry) = define(&mut module, "f", vec![], IrType::Void);
        let next = module.append_block(func, "next").unwrap();
        module.build_br(next).unwrap();
        module.position_at_end(next);
        let slot = module.build_alloca(IrType::I32).unwrap();
        module.build_ret(None).unwrap();

        let function = module.function(func).unwrap();
        assert_eq!(function.blocks[entry.index()].instructions, vec![slot]);
        assert!(function.blocks[next.index()].instructions.is_empty());
    }

    #[test]
    fn rejects_mismatched_operands_and_double_termination() {
        let mut module = Module::new("test");
        let (_, _) = define(&mut module, "f", vec![], IrType::Void);
        let a = module.const_i32(1).unwrap();
        let b = module.const_f64(1.0).unwrap();
        assert!(matches!(module.build_binary(BinaryOp::Add, a, b), Err(IrError::TypeMismatch(_))));
        assert!(module.build_binary(BinaryOp::FAdd, a, a).is_err());
        module.build_ret(None).unwrap();
        assert!(matches!(module.build_ret(None), Err(IrError::BlockTerminated(_))));
    }

    #[test]
    fn redeclaration_must_match_signature() {
        let mut module = Module::new("test");
        let first = module.declare_function("sin", vec![IrType::F64], IrType::F64).unwrap();
        let again = module.declare_function("sin", vec![IrType::F64], IrType::F64).unwrap();
        assert_eq!(first, again);
        assert!(module.declare_function("sin", vec![IrType::I32], IrType::F64).is_err());
        assert!(module.to_string().contains("declare double @sin(double)"));
    }

    #[test]
    fn erased_functions_disappear_and_reset_the_cursor() {
        let mut module = Module::new("test");
        let (func, _) = define(&mut module, "broken", vec![], IrType::F64);
        module.erase_function(func);
        assert_eq!(module.get_function("broken"), None);
        assert_eq!(module.current_block(), None);
        assert!(matches!(module.const_i32(0), Err(IrError::NoInsertionPoint)));
    }

    #[test]
    fn erased_slots_are_reused() {
        let mut module = Module::new("test");
        let (kept, _) = define(&mut module, "kept", vec![], IrType::F64);
        for _ in 0..100 {
            let (temp, _) = define(&mut module, "temp", vec![], IrType::F64);
            assert_ne!(temp, kept);
            assert_eq!(module.get_function("temp"), Some(temp));
            module.erase_function(temp);
        }
        assert_eq!(module.functions.len(), 2);
        assert_eq!(module.get_function("temp"), None);
        assert_eq!(module.get_function("kept"), Some(kept));
        assert_eq!(module.functions().count(), 1);
    }

    #[test]
    fn gep_validates_struct_field_indices() {
        let mut module = Module::new("test");
        define(&mut module, "f", vec![], IrType::Void);
        let ty = IrType::Struct("Foo".to_string(), vec![IrType::F64, IrType::Array(Box::new(IrType::F64), 2)]);
        let slot = module.build_alloca(ty.clone()).unwrap();
        let zero = module.const_i32(0).unwrap();
        let one = module.const_i32(1).unwrap();
        let five = module.const_i32(5).unwrap();
        assert!(module.build_gep(ty.clone(), slot, &[zero, one, one]).is_ok());
        assert!(module.build_gep(ty.clone(), slot, &[zero, five]).is_err());
        assert!(module.build_gep(ty, slot, &[zero, zero, zero]).is_err());
    }
}
