//! Scoped symbol table used while lowering a function.
//!
//! Two parallel stacks of maps are kept: "variants" bind a name to the
//! storage slot of a `var` (or parameter), "constants" bind a name to the
//! value of a `val`. Lookup walks both stacks from the innermost scope
//! outwards, checking the variant map before the constant map at each
//! level.

use std::collections::HashMap;

use crate::ir::{IrBuilder, ValueId};
use crate::types::TypeDescriptor;

/// A lowered value together with its front-end type.
///
/// Aggregate values (arrays, structs) are represented by the address of
/// their storage.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub value: ValueId,
    pub ty: TypeDescriptor,
}

/// One step of an address chain after its index expression was lowered.
#[derive(Debug, Clone, PartialEq)]
pub enum AddressStep {
    Index(ValueId),
    Field(String),
}

#[derive(Debug, Clone)]
struct Binding {
    value: ValueId,
    ty: TypeDescriptor,
}

#[derive(Debug)]
pub struct SymbolTable {
    variants: Vec<HashMap<String, Binding>>,
    constants: Vec<HashMap<String, Binding>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable {
            variants: vec![HashMap::new()],
            constants: vec![HashMap::new()],
        }
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a nested scope.
    pub fn step(&mut self) {
        self.variants.push(HashMap::new());
        self.constants.push(HashMap::new());
    }

    /// Close the innermost scope. The outermost scope is never popped.
    pub fn back(&mut self) {
        if self.variants.len() > 1 {
            self.variants.pop();
            self.constants.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.variants.len()
    }

    pub fn add_variant(&mut self, name: &str, storage: ValueId, ty: TypeDescriptor) {
        if let Some(scope) = self.variants.last_mut() {
            scope.insert(name.to_string(), Binding { value: storage, ty });
        }
        if let Some(scope) = self.constants.last_mut() {
            scope.remove(name);
        }
    }

    pub fn add_constant(&mut self, name: &str, value: ValueId, ty: TypeDescriptor) {
        if let Some(scope) = self.constants.last_mut() {
            scope.insert(name.to_string(), Binding { value, ty });
        }
        if let Some(scope) = self.variants.last_mut() {
            scope.remove(name);
        }
    }

    /// Innermost binding of `name` and whether it is a constant.
    fn lookup(&self, name: &str) -> Option<(&Binding, bool)> {
        self.variants
            .iter()
            .zip(&self.constants)
            .rev()
            .find_map(|(variants, constants)| {
                variants
                    .get(name)
                    .map(|binding| (binding, false))
                    .or_else(|| constants.get(name).map(|binding| (binding, true)))
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn load<B: IrBuilder>(&self, builder: &mut B, name: &str) -> Result<TypedValue, String> {
        self.load_addressed(builder, name, &[])
    }

    pub fn store<B: IrBuilder>(&self, builder: &mut B, name: &str, value: ValueId) -> Result<(), String> {
        self.store_addressed(builder, name, &[], value)
    }

    /// Load `name` narrowed by `steps`.
    ///
    /// A scalar result is loaded; an aggregate result is returned as the
    /// address of the element.
    pub fn load_addressed<B: IrBuilder>(
        &self,
        builder: &mut B,
        name: &str,
        steps: &[AddressStep],
    ) -> Result<TypedValue, String> {
        let (binding, constant) = self
            .lookup(name)
            .ok_or_else(|| format!("unknown variable name `{name}`"))?;
        if steps.is_empty() && (constant || binding.ty.is_aggregate()) {
            return Ok(TypedValue {
                value: binding.value,
                ty: binding.ty.clone(),
            });
        }
        let (address, ty) = self.address(builder, name, binding, steps)?;
        if ty.is_aggregate() {
            return Ok(TypedValue { value: address, ty });
        }
        let value = builder
            .build_load(ty.to_ir()?, address)
            .map_err(|err| err.to_string())?;
        Ok(TypedValue { value, ty })
    }

    /// Store `value` into `name` narrowed by `steps`.
    ///
    /// Aggregates must already be loaded into a first-class value.
    pub fn store_addressed<B: IrBuilder>(
        &self,
        builder: &mut B,
        name: &str,
        steps: &[AddressStep],
        value: ValueId,
    ) -> Result<(), String> {
        let (binding, constant) = self
            .lookup(name)
            .ok_or_else(|| format!("unknown variable name `{name}`"))?;
        if constant {
            return Err(format!("cannot assign to constant `{name}`"));
        }
        let (address, _) = self.address(builder, name, binding, steps)?;
        builder.build_store(value, address).map_err(|err| err.to_string())
    }

    fn address<B: IrBuilder>(
        &self,
        builder: &mut B,
        name: &str,
        binding: &Binding,
        steps: &[AddressStep],
    ) -> Result<(ValueId, TypeDescriptor), String> {
        if steps.is_empty() {
            return Ok((binding.value, binding.ty.clone()));
        }
        if !binding.ty.is_aggregate() {
            return Err(format!("`{name}` of type `{}` cannot be addressed", binding.ty.name()));
        }

        let zero = builder.const_i32(0).map_err(|err| err.to_string())?;
        let mut indices = vec![zero];
        let mut ty = binding.ty.clone();
        for step in steps {
            ty = match (step, ty) {
                (AddressStep::Index(index), TypeDescriptor::Array { element, .. }) => {
                    indices.push(*index);
                    *element
                }
                (AddressStep::Field(field), TypeDescriptor::Struct(decl)) => {
                    let (position, field_ty) = decl
                        .field(field)
                        .ok_or_else(|| format!("struct `{}` has no field `{field}`", decl.name))?;
                    let position = i32::try_from(position).map_err(|err| err.to_string())?;
                    indices.push(builder.const_i32(position).map_err(|err| err.to_string())?);
                    field_ty.clone()
                }
                (AddressStep::Index(_), other) => {
                    return Err(format!("cannot index into `{}`", other.name()));
                }
                (AddressStep::Field(field), other) => {
                    return Err(format!("type `{}` has no field `{field}`", other.name()));
                }
            };
        }
        let root = binding.ty.to_ir()?;
        let address = builder
            .build_gep(root, binding.value, &indices)
            .map_err(|err| err.to_string())?;
        Ok((address, ty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{Interpreter, Limits, RuntimeValue};
    use crate::ir::{IrType, Module};
    use crate::types::TypeRegistry;

    fn function(module: &mut Module, ret: IrType) {
        let func = module.declare_function("f", vec![], ret).unwrap();
        let entry = module.append_block(func, "entry").unwrap();
        module.position_at_end(entry);
    }

    fn run(module: &Module) -> RuntimeValue {
        Interpreter::new(module, Limits::default()).run("f", vec![]).unwrap()
    }

    #[test]
    fn inner_scope_shadows_and_back_restores() {
        let mut module = Module::new("test");
        function(&mut module, IrType::F64);
        let registry = TypeRegistry::new();
        let double = registry.resolve("double").unwrap();
        let mut table = SymbolTable::new();

        let outer = module.build_alloca(IrType::F64).unwrap();
        let one = module.const_f64(1.0).unwrap();
        module.build_store(one, outer).unwrap();
        table.add_variant("x", outer, double.clone());

        table.step();
        let two = module.const_f64(2.0).unwrap();
        table.add_constant("x", two, double.clone());
        assert_eq!(table.load(&mut module, "x").unwrap().value, two);
        assert!(table.store(&mut module, "x", one).unwrap_err().contains("constant"));
        table.back();

        let loaded = table.load(&mut module, "x").unwrap();
        module.build_ret(Some(loaded.value)).unwrap();
        assert_eq!(run(&module), RuntimeValue::F64(1.0));
        assert!(table.load(&mut module, "y").is_err());
    }

    #[test]
    fn outermost_scope_is_never_popped() {
        let mut table = SymbolTable::new();
        table.back();
        table.back();
        assert_eq!(table.depth(), 1);
    }

    #[test]
    fn addressed_store_and_load_walk_struct_fields_and_indices() {
        let mut registry = TypeRegistry::new();
        registry
            .register_struct(
                "Foo",
                &[
                    ("a".to_string(), "double".to_string()),
                    ("b".to_string(), "array%double%2".to_string()),
                ],
            )
            .unwrap();
        let foo = registry.resolve("Foo").unwrap();

        let mut module = Module::new("test");
        function(&mut module, IrType::F64);
        let mut table = SymbolTable::new();
        let storage = module.build_alloca(foo.to_ir().unwrap()).unwrap();
        table.add_variant("x", storage, foo);

        let one = module.const_i32(1).unwrap();
        let value = module.const_f64(2.5).unwrap();
        let path = [AddressStep::Field("b".to_string()), AddressStep::Index(one)];
        table.store_addressed(&mut module, "x", &path, value).unwrap();

        let field = table
            .load_addressed(&mut module, "x", &[AddressStep::Field("b".to_string())])
            .unwrap();
        assert_eq!(field.ty.name(), "array%double%2");
        let loaded = table.load_addressed(&mut module, "x", &path).unwrap();
        assert_eq!(loaded.ty.name(), "double");
        module.build_ret(Some(loaded.value)).unwrap();
        assert_eq!(run(&module), RuntimeValue::F64(2.5));

        let bad = [AddressStep::Field("missing".to_string())];
        assert!(table.load_addressed(&mut module, "x", &bad).is_err());
        let bad = [AddressStep::Index(one)];
        assert!(table.load_addressed(&mut module, "x", &bad).is_err());
    }
}
