//! Reference interpreter for [`Module`]s.
//!
//! Each call frame owns the memory its allocas create; the frame's slots
//! are released when the call returns. Pointers are a slot number plus a
//! path of element indices into nested aggregates.

use std::fmt;

use thiserror::Error;

use crate::builtins::find_host_function;
use crate::ir::{
    BinaryOp, CastOp, FuncId, Function, Instruction, IrType, Module, Predicate, Terminator, ValueId,
    ValueKind,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Pointer {
    slot: usize,
    path: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    Void,
    I1(bool),
    I32(i32),
    F64(f64),
    Ptr(Pointer),
    Aggregate(Vec<RuntimeValue>),
}

impl RuntimeValue {
    /// Zero value stored into fresh stack slots.
    pub fn zero(ty: &IrType) -> RuntimeValue {
        match ty {
            IrType::Void | IrType::Ptr => RuntimeValue::Void,
            IrType::I1 => RuntimeValue::I1(false),
            IrType::I32 => RuntimeValue::I32(0),
            IrType::F64 => RuntimeValue::F64(0.0),
            IrType::Array(element, length) => {
                RuntimeValue::Aggregate((0..*length).map(|_| RuntimeValue::zero(element)).collect())
            }
            IrType::Struct(_, fields) => RuntimeValue::Aggregate(fields.iter().map(RuntimeValue::zero).collect()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RuntimeValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            RuntimeValue::I32(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for RuntimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeValue::Void => write!(f, "void"),
            RuntimeValue::I1(v) => write!(f, "{}", u8::from(*v)),
            RuntimeValue::I32(v) => write!(f, "{v}"),
            RuntimeValue::F64(v) => write!(f, "{v:.6}"),
            RuntimeValue::Ptr(p) => write!(f, "ptr({})", p.slot),
            RuntimeValue::Aggregate(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecError {
    #[error("function `{0}` is not defined")]
    UndefinedFunction(String),
    #[error("external function `{0}` has no host implementation")]
    UnresolvedExtern(String),
    #[error("function `{name}` expects {expected} arguments, got {found}")]
    ArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("step limit of {0} instructions exceeded")]
    StepLimit(u64),
    #[error("call depth limit of {0} exceeded")]
    CallDepth(usize),
    #[error("index {index} out of bounds for length {length}")]
    OutOfBounds { index: i64, length: usize },
    #[error("invalid memory access")]
    InvalidAccess,
    #[error("malformed IR: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub step_limit: u64,
    pub max_call_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            step_limit: 10_000_000,
            max_call_depth: 512,
        }
    }
}

pub struct Interpreter<'m> {
    module: &'m Module,
    limits: Limits,
    memory: Vec<RuntimeValue>,
    steps: u64,
    depth: usize,
}

fn malformed<T>(message: impl Into<String>) -> Result<T, ExecError> {
    Err(ExecError::Malformed(message.into()))
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module, limits: Limits) -> Self {
        Interpreter {
            module,
            limits,
            memory: Vec::new(),
            steps: 0,
            depth: 0,
        }
    }

    /// Call the function named `name`.
    pub fn run(&mut self, name: &str, args: Vec<RuntimeValue>) -> Result<RuntimeValue, ExecError> {
        let (id, _) = self
            .module
            .function_by_name(name)
            .ok_or_else(|| ExecError::UndefinedFunction(name.to_string()))?;
        self.call(id, args)
    }

    pub fn call(&mut self, id: FuncId, args: Vec<RuntimeValue>) -> Result<RuntimeValue, ExecError> {
        let func = self
            .module
            .function(id)
            .ok_or_else(|| ExecError::UndefinedFunction(format!("#{id:?}")))?;
        if args.len() != func.params.len() {
            return Err(ExecError::ArgumentCount {
                name: func.name.clone(),
                expected: func.params.len(),
                found: args.len(),
            });
        }
        if func.is_declaration() {
            return call_host(func, &args);
        }
        if self.depth >= self.limits.max_call_depth {
            return Err(ExecError::CallDepth(self.limits.max_call_depth));
        }

        self.depth += 1;
        let base = self.memory.len();
        let result = self.execute(func, args);
        self.memory.truncate(base);
        self.depth -= 1;
        result
    }

    fn tick(&mut self) -> Result<(), ExecError> {
        self.steps += 1;
        if self.steps > self.limits.step_limit {
            return Err(ExecError::StepLimit(self.limits.step_limit));
        }
        Ok(())
    }

    fn execute(&mut self, func: &'m Function, args: Vec<RuntimeValue>) -> Result<RuntimeValue, ExecError> {
        let mut frame: Vec<Option<RuntimeValue>> = vec![None; func.values.len()];
        for (slot, arg) in frame.iter_mut().zip(args) {
            *slot = Some(arg);
        }

        let mut block = 0;
        let mut previous = None;
        loop {
            let Some(current) = func.blocks.get(block) else {
                return malformed(format!("block {block} does not exist in `{}`", func.name));
            };
            for id in &current.instructions {
                self.tick()?;
                let value = self.step(func, &frame, *id, previous)?;
                frame[id.index()] = Some(value);
            }
            self.tick()?;
            match &current.terminator {
                Some(Terminator::Br(target)) => {
                    previous = Some(block);
                    block = target.index();
                }
                Some(Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                }) => {
                    let taken = match operand(func, &frame, *cond)? {
                        RuntimeValue::I1(flag) => flag,
                        other => return malformed(format!("branch on non-i1 value {other}")),
                    };
                    previous = Some(block);
                    block = if taken { then_block.index() } else { else_block.index() };
                }
                Some(Terminator::Ret(value)) => {
                    return match value {
                        Some(value) => operand(func, &frame, *value),
                        None => Ok(RuntimeValue::Void),
                    };
                }
                None => return malformed(format!("block `{}` has no terminator", current.label)),
            }
        }
    }

    fn step(
        &mut self,
        func: &'m Function,
        frame: &[Option<RuntimeValue>],
        id: ValueId,
        previous: Option<usize>,
    ) -> Result<RuntimeValue, ExecError> {
        let Some(ValueKind::Instruction(instruction)) = func.value(id).map(|data| &data.kind) else {
            return malformed(format!("%{} is not an instruction", id.index()));
        };
        let value = |v: ValueId| operand(func, frame, v);

        match instruction {
            Instruction::Alloca(ty) => {
                self.memory.push(RuntimeValue::zero(ty));
                Ok(RuntimeValue::Ptr(Pointer {
                    slot: self.memory.len() - 1,
                    path: Vec::new(),
                }))
            }
            Instruction::Load { ptr, .. } => {
                let pointer = as_pointer(value(*ptr)?)?;
                Ok(self.locate(&pointer)?.clone())
            }
            Instruction::Store { value: stored, ptr } => {
                let pointer = as_pointer(value(*ptr)?)?;
                let stored = value(*stored)?;
                *self.locate_mut(&pointer)? = stored;
                Ok(RuntimeValue::Void)
            }
            Instruction::Gep { ptr, indices, .. } => {
                let mut pointer = as_pointer(value(*ptr)?)?;
                for (position, index) in indices.iter().enumerate() {
                    let index = match value(*index)? {
                        RuntimeValue::I32(i) => i,
                        other => return malformed(format!("element index {other} is not i32")),
                    };
                    if position == 0 {
                        if index != 0 {
                            return Err(ExecError::OutOfBounds {
                                index: i64::from(index),
                                length: 1,
                            });
                        }
                        continue;
                    }
                    let slot = usize::try_from(index).map_err(|_| ExecError::OutOfBounds {
                        index: i64::from(index),
                        length: 0,
                    })?;
                    pointer.path.push(slot);
                }
                self.locate(&pointer)?;
                Ok(RuntimeValue::Ptr(pointer))
            }
            Instruction::Binary { op, lhs, rhs } => binary(*op, value(*lhs)?, value(*rhs)?),
            Instruction::Compare { pred, lhs, rhs } => compare(*pred, value(*lhs)?, value(*rhs)?),
            Instruction::Cast { op, value: source } => cast(*op, value(*source)?),
            Instruction::Phi(incoming) => {
                let Some(previous) = previous else {
                    return malformed("phi in entry block");
                };
                let Some((source, _)) = incoming.iter().find(|(_, block)| block.index() == previous) else {
                    return malformed("phi has no value for the predecessor block");
                };
                value(*source)
            }
            Instruction::Call { callee, args } => {
                let args = args.iter().map(|a| value(*a)).collect::<Result<Vec<_>, _>>()?;
                self.call(*callee, args)
            }
        }
    }

    fn locate(&self, pointer: &Pointer) -> Result<&RuntimeValue, ExecError> {
        let mut current = self.memory.get(pointer.slot).ok_or(ExecError::InvalidAccess)?;
        for &index in &pointer.path {
            current = match current {
                RuntimeValue::Aggregate(items) => items.get(index).ok_or(ExecError::OutOfBounds {
                    index: index as i64,
                    length: items.len(),
                })?,
                _ => return Err(ExecError::InvalidAccess),
            };
        }
        Ok(current)
    }

    fn locate_mut(&mut self, pointer: &Pointer) -> Result<&mut RuntimeValue, ExecError> {
        let mut current = self
            .memory
            .get_mut(pointer.slot)
            .ok_or(ExecError::InvalidAccess)?;
        for &index in &pointer.path {
            current = match current {
                RuntimeValue::Aggregate(items) => {
                    let length = items.len();
                    items.get_mut(index).ok_or(ExecError::OutOfBounds {
                        index: index as i64,
                        length,
                    })?
                }
                _ => return Err(ExecError::InvalidAccess),
            };
        }
        Ok(current)
    }
}

fn operand(func: &Function, frame: &[Option<RuntimeValue>], id: ValueId) -> Result<RuntimeValue, ExecError> {
    match func.value(id).map(|data| &data.kind) {
        Some(ValueKind::ConstI32(v)) => Ok(RuntimeValue::I32(*v)),
        Some(ValueKind::ConstF64(v)) => Ok(RuntimeValue::F64(*v)),
        Some(_) => frame
            .get(id.index())
            .cloned()
            .flatten()
            .ok_or_else(|| ExecError::Malformed(format!("%{} used before definition", id.index()))),
        None => malformed(format!("%{} does not exist", id.index())),
    }
}

fn as_pointer(value: RuntimeValue) -> Result<Pointer, ExecError> {
    match value {
        RuntimeValue::Ptr(pointer) => Ok(pointer),
        _ => Err(ExecError::InvalidAccess),
    }
}

fn call_host(func: &Function, args: &[RuntimeValue]) -> Result<RuntimeValue, ExecError> {
    let host = find_host_function(&func.name).ok_or_else(|| ExecError::UnresolvedExtern(func.name.clone()))?;
    if host.arity != args.len() {
        return Err(ExecError::UnresolvedExtern(func.name.clone()));
    }
    let args = args
        .iter()
        .map(|a| a.as_f64().ok_or_else(|| ExecError::UnresolvedExtern(func.name.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    // `extern putchard(c: double)` may be declared without a result.
    match func.ret {
        IrType::F64 => Ok(RuntimeValue::F64((host.call)(&args))),
        IrType::Void => {
            (host.call)(&args);
            Ok(RuntimeValue::Void)
        }
        _ => Err(ExecError::UnresolvedExtern(func.name.clone())),
    }
}

fn binary(op: BinaryOp, lhs: RuntimeValue, rhs: RuntimeValue) -> Result<RuntimeValue, ExecError> {
    use RuntimeValue::{F64, I32};
    let result = match (op, lhs, rhs) {
        (BinaryOp::Add, I32(a), I32(b)) => I32(a.wrapping_add(b)),
        (BinaryOp::Sub, I32(a), I32(b)) => I32(a.wrapping_sub(b)),
        (BinaryOp::Mul, I32(a), I32(b)) => I32(a.wrapping_mul(b)),
        (BinaryOp::FAdd, F64(a), F64(b)) => F64(a + b),
        (BinaryOp::FSub, F64(a), F64(b)) => F64(a - b),
        (BinaryOp::FMul, F64(a), F64(b)) => F64(a * b),
        (op, a, b) => return malformed(format!("{op:?} applied to {a} and {b}")),
    };
    Ok(result)
}

fn compare(pred: Predicate, lhs: RuntimeValue, rhs: RuntimeValue) -> Result<RuntimeValue, ExecError> {
    use RuntimeValue::{F64, I1, I32};
    let result = match (pred, lhs, rhs) {
        (Predicate::Ne, I32(a), I32(b)) => a != b,
        (Predicate::Ne, I1(a), I1(b)) => a != b,
        (Predicate::Slt, I32(a), I32(b)) => a < b,
        (Predicate::One, F64(a), F64(b)) => !a.is_nan() && !b.is_nan() && a != b,
        (Predicate::Ult, F64(a), F64(b)) => a.is_nan() || b.is_nan() || a < b,
        (pred, a, b) => return malformed(format!("{pred:?} applied to {a} and {b}")),
    };
    Ok(I1(result))
}

fn cast(op: CastOp, value: RuntimeValue) -> Result<RuntimeValue, ExecError> {
    use RuntimeValue::{F64, I1, I32};
    let result = match (op, value) {
        (CastOp::ZExt, I1(flag)) => I32(i32::from(flag)),
        (CastOp::ZExt, I32(v)) => I32(v),
        (CastOp::UiToFp, I1(flag)) => F64(if flag { 1.0 } else { 0.0 }),
        (CastOp::UiToFp, I32(v)) => F64(f64::from(v as u32)),
        (op, v) => return malformed(format!("{op:?} applied to {v}")),
    };
    Ok(result)
}
