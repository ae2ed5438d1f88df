//! Type descriptors and the structural type registry.
//!
//! Types are referred to by name throughout the front end. Arrays carry
//! their structure inside the name itself (`array%<element>%<length>`),
//! so resolving an array name is a string decomposition rather than a
//! table lookup. Struct names resolve through the registry.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ir::IrType;

/// Built-in primitive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Int32,
    Double,
    Void,
}

impl Primitive {
    pub const fn name(self) -> &'static str {
        match self {
            Primitive::Int32 => "i32",
            Primitive::Double => "double",
            Primitive::Void => "void",
        }
    }

    pub const fn memory_size(self) -> usize {
        match self {
            Primitive::Int32 => 4,
            Primitive::Double => 8,
            Primitive::Void => 0,
        }
    }
}

/// Types that only exist during checking and never reach the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Logical {
    /// Matches every type.
    Any,
    /// A literal whose type has not been pinned yet.
    Uninit,
    Error,
}

impl Logical {
    pub const fn name(self) -> &'static str {
        match self {
            Logical::Any => "any",
            Logical::Uninit => "uninit",
            Logical::Error => "error",
        }
    }
}

pub const I32: &str = Primitive::Int32.name();
pub const DOUBLE: &str = Primitive::Double.name();
pub const VOID: &str = Primitive::Void.name();
pub const ANY: &str = Logical::Any.name();
pub const UNINIT: &str = Logical::Uninit.name();
pub const ERROR: &str = Logical::Error.name();

const ARRAY_PREFIX: &str = "array";
const ARRAY_SEPARATOR: char = '%';

/// A struct type: ordered fields plus name lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<(String, TypeDescriptor)>,
    index: HashMap<String, usize>,
}

impl StructType {
    pub fn new(name: impl Into<String>, fields: Vec<(String, TypeDescriptor)>) -> Self {
        let index = fields
            .iter()
            .enumerate()
            .map(|(position, (field, _))| (field.clone(), position))
            .collect();
        StructType {
            name: name.into(),
            fields,
            index,
        }
    }

    /// Position and type of `field`.
    pub fn field(&self, field: &str) -> Option<(usize, &TypeDescriptor)> {
        let position = *self.index.get(field)?;
        Some((position, &self.fields[position].1))
    }

    pub fn memory_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(_, ty)| ty.memory_size().unwrap_or(0))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeDescriptor {
    Primitive(Primitive),
    Array { element: Box<TypeDescriptor>, length: usize },
    Struct(Rc<StructType>),
    Logical(Logical),
}

impl TypeDescriptor {
    pub fn array(element: TypeDescriptor, length: usize) -> Self {
        TypeDescriptor::Array {
            element: Box::new(element),
            length,
        }
    }

    /// Canonical name; arrays use the encoded form.
    pub fn name(&self) -> String {
        match self {
            TypeDescriptor::Primitive(p) => p.name().to_string(),
            TypeDescriptor::Logical(l) => l.name().to_string(),
            TypeDescriptor::Array { element, length } => array_type_name(&element.name(), *length),
            TypeDescriptor::Struct(s) => s.name.clone(),
        }
    }

    /// Arrays and structs: values of these types live in storage.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, TypeDescriptor::Array { .. } | TypeDescriptor::Struct(_))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeDescriptor::Primitive(Primitive::Void))
    }

    /// Size in bytes, `None` for logical types.
    pub fn memory_size(&self) -> Option<usize> {
        match self {
            TypeDescriptor::Primitive(p) => Some(p.memory_size()),
            TypeDescriptor::Array { element, length } => Some(element.memory_size()? * length),
            TypeDescriptor::Struct(s) => Some(s.memory_size()),
            TypeDescriptor::Logical(_) => None,
        }
    }

    /// The IR type values of this type are represented with.
    pub fn to_ir(&self) -> Result<IrType, String> {
        match self {
            TypeDescriptor::Primitive(Primitive::Int32) => Ok(IrType::I32),
            TypeDescriptor::Primitive(Primitive::Double) => Ok(IrType::F64),
            TypeDescriptor::Primitive(Primitive::Void) => Ok(IrType::Void),
            TypeDescriptor::Array { element, length } => {
                Ok(IrType::Array(Box::new(element.to_ir()?), *length))
            }
            TypeDescriptor::Struct(s) => {
                let fields = s
                    .fields
                    .iter()
                    .map(|(_, ty)| ty.to_ir())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(IrType::Struct(s.name.clone(), fields))
            }
            TypeDescriptor::Logical(l) => Err(format!("type `{}` has no runtime representation", l.name())),
        }
    }
}

/// Encode an array type name.
pub fn array_type_name(element: &str, length: usize) -> String {
    format!("{ARRAY_PREFIX}{ARRAY_SEPARATOR}{element}{ARRAY_SEPARATOR}{length}")
}

/// Split an encoded array name into element name and length.
///
/// The element is the text between the first and the last `%`, so
/// nested arrays (`array%array%double%2%3`) decompose one level at a time.
pub fn extract_nesting_type(name: &str) -> Option<(&str, usize)> {
    if !name.starts_with(ARRAY_PREFIX) {
        return None;
    }
    let first = name.find(ARRAY_SEPARATOR)?;
    let last = name.rfind(ARRAY_SEPARATOR)?;
    if first >= last || first != ARRAY_PREFIX.len() {
        return None;
    }
    let element = &name[first + 1..last];
    let length = name[last + 1..].parse::<usize>().ok()?;
    Some((element, length))
}

/// Innermost non-array element of an encoded array name.
pub fn innermost_element(name: &str) -> &str {
    let mut current = name;
    while let Some((element, _)) = extract_nesting_type(current) {
        current = element;
    }
    current
}

/// `any` on either side matches; otherwise names must be equal.
pub fn is_same_type(left: &str, right: &str) -> bool {
    left == ANY || right == ANY || left == right
}

pub fn is_logical_name(name: &str) -> bool {
    matches!(name, ANY | UNINIT | ERROR)
}

/// Resolves type names to descriptors and owns the struct table.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    structs: HashMap<String, Rc<StructType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, name: &str) -> Result<TypeDescriptor, String> {
        match name {
            "i32" => return Ok(TypeDescriptor::Primitive(Primitive::Int32)),
            "double" => return Ok(TypeDescriptor::Primitive(Primitive::Double)),
            "void" => return Ok(TypeDescriptor::Primitive(Primitive::Void)),
            "any" => return Ok(TypeDescriptor::Logical(Logical::Any)),
            "uninit" => return Ok(TypeDescriptor::Logical(Logical::Uninit)),
            "error" => return Ok(TypeDescriptor::Logical(Logical::Error)),
            _ => {}
        }
        if name.starts_with(ARRAY_PREFIX) {
            if let Some((element, length)) = extract_nesting_type(name) {
                let element = self.resolve(element)?;
                if element.is_void() || matches!(element, TypeDescriptor::Logical(_)) {
                    return Err(format!("invalid array element type in `{name}`"));
                }
                return Ok(TypeDescriptor::array(element, length));
            }
        }
        self.structs
            .get(name)
            .map(|s| TypeDescriptor::Struct(Rc::clone(s)))
            .ok_or_else(|| format!("unknown type `{name}`"))
    }

    pub fn contains_struct(&self, name: &str) -> bool {
        self.structs.contains_key(name)
    }

    /// Register a struct; every field type must already resolve.
    pub fn register_struct(&mut self, name: &str, fields: &[(String, String)]) -> Result<(), String> {
        if self.structs.contains_key(name) || self.resolve(name).is_ok() {
            return Err(format!("type `{name}` is already defined"));
        }
        let mut resolved = Vec::with_capacity(fields.len());
        for (field, ty) in fields {
            if resolved.iter().any(|(seen, _): &(String, TypeDescriptor)| seen == field) {
                return Err(format!("duplicate field `{field}` in struct `{name}`"));
            }
            let descriptor = self
                .resolve(ty)
                .map_err(|err| format!("field `{field}` of struct `{name}`: {err}"))?;
            if descriptor.is_void() || matches!(descriptor, TypeDescriptor::Logical(_)) {
                return Err(format!("field `{field}` of struct `{name}` cannot have type `{ty}`"));
            }
            resolved.push((field.clone(), descriptor));
        }
        tracing::debug!(name, fields = resolved.len(), "registered struct");
        self.structs
            .insert(name.to_string(), Rc::new(StructType::new(name, resolved)));
        Ok(())
    }
}
