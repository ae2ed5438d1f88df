//! Type checking for kscope declarations.
//!
//! Types are handled by name (see [`crate::types`]). Checking an
//! expression always happens *against* an expected type name; `any`
//! accepts everything. Numeric literals start out as `uninit` and are
//! pinned to a concrete type by the context they appear in.
//!
//! Top-level expressions have no declared result type. Their type is
//! inferred in two passes over the same expression:
//!
//! 1. pass 1 (`Checking`) walks the expression against `any` and records
//!    the type of the first variable, call or operator call it meets;
//! 2. pass 2 (`Checked`) walks it again and pins every free literal to
//!    that type.
//!
//! The result depends on traversal order: `x + f(y)` takes the type of
//! `x`. If-conditions and for-loop bounds go through the same protocol.

use std::collections::HashMap;
use std::mem;

use crate::ast::{
    Address, Body, Declaration, Expr, Function, OperatorKind, Prototype, operator_symbol,
};
use crate::error::CoreError;
use crate::types::{
    ANY, DOUBLE, I32, TypeDescriptor, TypeRegistry, UNINIT, VOID, extract_nesting_type,
    innermost_element, is_logical_name, is_same_type,
};

/// Result and argument types of a declared function.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub ret: String,
    pub args: Vec<String>,
}

impl Signature {
    fn of(prototype: &Prototype) -> Self {
        Signature {
            ret: prototype.return_type.clone(),
            args: prototype.args.iter().map(|(_, ty)| ty.clone()).collect(),
        }
    }
}

/// Function signatures known to the session.
///
/// Signatures survive across declarations; everything else about a check
/// (variable scopes, inference state, diagnostics) is per declaration.
#[derive(Debug, Default)]
pub struct TypeChecker {
    functions: HashMap<String, Signature>,
}

impl TypeChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signature(&self, symbol: &str) -> Option<&Signature> {
        self.functions.get(symbol)
    }

    /// Put back the entry `symbol` had before a declaration that a later
    /// stage rejected.
    pub fn restore(&mut self, symbol: &str, previous: Option<Signature>) {
        match previous {
            Some(signature) => self.functions.insert(symbol.to_string(), signature),
            None => self.functions.remove(symbol),
        };
    }

    /// Check one declaration, pinning literal types in place.
    ///
    /// An anonymous function without a result type gets the inferred type
    /// written into its prototype.
    pub fn check(&mut self, declaration: &mut Declaration, types: &TypeRegistry) -> Result<(), CoreError> {
        let mut checker = DeclarationChecker {
            types,
            functions: &mut self.functions,
            env: TypeEnv::default(),
            result_type: VOID.to_string(),
            against: Against::default(),
            diagnostics: Vec::new(),
        };
        let outcome = match declaration {
            Declaration::Struct(_) => Ok(()),
            Declaration::Extern(prototype) => checker.check_extern(prototype),
            Declaration::Function(func) if func.prototype.is_anonymous() => checker.check_anonymous(func),
            Declaration::Function(func) => checker.check_function(func),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(Reported) => {
                tracing::debug!(diagnostics = ?checker.diagnostics, "declaration rejected by type checker");
                Err(CoreError::TypeError(checker.diagnostics))
            }
        }
    }
}

/// Marker for "an error has been pushed into the diagnostics".
#[derive(Debug, Clone, Copy)]
struct Reported;

type Check<T = ()> = Result<T, Reported>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgainstStatus {
    Init,
    Checking,
    Checked,
}

/// State of the two-pass inference protocol.
#[derive(Debug, Clone)]
struct Against {
    status: AgainstStatus,
    /// First type seen on a variable, call or operator call.
    discovered: Option<String>,
    /// First explicitly typed literal; used only when nothing was discovered.
    literal_hint: Option<String>,
}

impl Default for Against {
    fn default() -> Self {
        Against {
            status: AgainstStatus::Init,
            discovered: None,
            literal_hint: None,
        }
    }
}

impl Against {
    fn checking() -> Self {
        Against {
            status: AgainstStatus::Checking,
            ..Against::default()
        }
    }
}

/// 変数名 → 型名 のスコープ付き環境。
#[derive(Debug)]
struct TypeEnv {
    scopes: Vec<Vec<(String, String)>>,
}

impl Default for TypeEnv {
    fn default() -> Self {
        TypeEnv { scopes: vec![Vec::new()] }
    }
}

impl TypeEnv {
    fn step(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn back(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    fn insert(&mut self, name: &str, ty: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((name.to_string(), ty.to_string()));
        }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find_map(|(n, t)| (n == name).then_some(t.as_str()))
    }
}

fn is_numeric(ty: &str) -> bool {
    ty == I32 || ty == DOUBLE
}

fn is_builtin_operator(op: &str) -> bool {
    matches!(op, "+" | "-" | "*" | "<")
}

struct DeclarationChecker<'c> {
    types: &'c TypeRegistry,
    functions: &'c mut HashMap<String, Signature>,
    env: TypeEnv,
    result_type: String,
    against: Against,
    diagnostics: Vec<String>,
}

impl DeclarationChecker<'_> {
    fn error(&mut self, message: impl Into<String>) -> Reported {
        self.diagnostics.push(message.into());
        Reported
    }

    fn expect_same(&mut self, found: &str, expected: &str, what: impl FnOnce() -> String) -> Check {
        if is_same_type(found, expected) {
            Ok(())
        } else {
            Err(self.error(format!("{} has type `{found}`, expected `{expected}`", what())))
        }
    }

    /// Record a concrete type during pass 1.
    fn discover(&mut self, ty: &str) {
        if self.against.status == AgainstStatus::Checking
            && self.against.discovered.is_none()
            && !is_logical_name(ty)
        {
            self.against.discovered = Some(ty.to_string());
        }
    }

    fn signature(&mut self, symbol: &str, what: &str) -> Check<Signature> {
        match self.functions.get(symbol) {
            Some(signature) => Ok(signature.clone()),
            None => Err(self.error(format!("unknown {what} `{symbol}`"))),
        }
    }

    fn resolve_value_type(&mut self, ty: &str, what: impl FnOnce() -> String) -> Check<TypeDescriptor> {
        match self.types.resolve(ty) {
            Ok(descriptor) if descriptor.is_void() || matches!(descriptor, TypeDescriptor::Logical(_)) => {
                Err(self.error(format!("{} cannot have type `{ty}`", what())))
            }
            Ok(descriptor) => Ok(descriptor),
            Err(message) => Err(self.error(format!("{}: {message}", what()))),
        }
    }

    fn validate_prototype(&mut self, prototype: &Prototype) -> Check {
        for (name, ty) in &prototype.args {
            self.resolve_value_type(ty, || format!("argument `{name}`"))?;
        }
        if prototype.return_type != UNINIT {
            if let Err(message) = self.types.resolve(&prototype.return_type) {
                return Err(self.error(format!("return type of `{}`: {message}", prototype.name)));
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Declarations
    // ---------------------------------------------------------------------

    fn check_extern(&mut self, prototype: &Prototype) -> Check {
        self.validate_prototype(prototype)?;
        let symbol = prototype.symbol();
        let signature = Signature::of(prototype);
        if let Some(existing) = self.functions.get(&symbol) {
            if *existing != signature {
                return Err(self.error(format!("`{symbol}` is already declared with a different signature")));
            }
        }
        self.functions.insert(symbol, signature);
        Ok(())
    }

    fn check_function(&mut self, func: &mut Function) -> Check {
        self.validate_prototype(&func.prototype)?;
        let symbol = func.prototype.symbol();
        // Registered before the body so that recursion type-checks.
        let previous = self
            .functions
            .insert(symbol.clone(), Signature::of(&func.prototype));

        for (name, ty) in &func.prototype.args {
            self.env.insert(name, ty);
        }
        self.result_type = func.prototype.return_type.clone();
        let result_type = self.result_type.clone();

        let outcome = self.check_body(&mut func.body, &result_type);
        if outcome.is_err() {
            match previous {
                Some(signature) => self.functions.insert(symbol.clone(), signature),
                None => self.functions.remove(&symbol),
            };
            self.diagnostics.insert(0, format!("in function `{symbol}`"));
        }
        outcome
    }

    fn check_anonymous(&mut self, func: &mut Function) -> Check {
        self.validate_prototype(&func.prototype)?;
        let answer = func.prototype.return_type.clone();
        if answer != UNINIT {
            self.result_type = answer.clone();
            return self.check_body(&mut func.body, &answer);
        }

        let [Expr::Return(expr)] = func.body.expressions.as_mut_slice() else {
            return Err(self.error("top-level expression must be a single returned expression"));
        };
        match self.infer(expr, None)? {
            Some(inferred) => {
                self.pin_literals(expr, &inferred);
                self.result_type = inferred.clone();
                func.prototype.return_type = inferred;
                Ok(())
            }
            None => Err(self.error("cannot infer execution result type")),
        }
    }

    /// Check each statement; only the value statement sees `expected`.
    fn check_body(&mut self, body: &mut Body, expected: &str) -> Check {
        let value_index = if body.has_return_value {
            body.expressions.len().checked_sub(1)
        } else {
            None
        };
        for (index, expr) in body.expressions.iter_mut().enumerate() {
            if Some(index) == value_index {
                self.check_value_statement(expr, expected)?;
            } else {
                self.check_expr(expr, ANY)?;
            }
        }
        Ok(())
    }

    fn check_value_statement(&mut self, expr: &mut Expr, expected: &str) -> Check {
        match expr {
            Expr::For { .. } => Err(self.error("a for loop cannot be the value of a body")),
            Expr::VarDeclare { name, .. } => {
                let name = name.clone();
                self.check_expr(expr, ANY)?;
                if is_same_type(expected, VOID) {
                    Ok(())
                } else {
                    Err(self.error(format!(
                        "declaration of `{name}` cannot be the value of a body of type `{expected}`"
                    )))
                }
            }
            Expr::Return(_) => self.check_expr(expr, ANY),
            _ => {
                self.check_expr(expr, expected)?;
                self.pin_literals(expr, expected);
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Inference protocol
    // ---------------------------------------------------------------------

    /// Two-pass inference of `expr`; `fallback` is used when pass 1
    /// discovers nothing.
    ///
    /// The caller's inference state is saved and restored, so nested uses
    /// (an `if` inside a top-level expression) do not interfere.
    fn infer(&mut self, expr: &mut Expr, fallback: Option<&str>) -> Check<Option<String>> {
        let saved = mem::replace(&mut self.against, Against::checking());
        let outcome = self.infer_passes(expr, fallback);
        self.against = saved;
        outcome
    }

    fn infer_passes(&mut self, expr: &mut Expr, fallback: Option<&str>) -> Check<Option<String>> {
        self.check_expr(expr, ANY)?;
        let found = self
            .against
            .discovered
            .take()
            .or_else(|| self.against.literal_hint.take())
            .or_else(|| fallback.map(str::to_string));
        let Some(ty) = found else {
            return Ok(None);
        };
        self.against.status = AgainstStatus::Checked;
        self.against.discovered = Some(ty.clone());
        self.check_expr(expr, ANY)?;
        Ok(Some(ty))
    }

    /// Condition-like positions: inferred, defaulting to `double`, and numeric.
    fn infer_numeric(&mut self, expr: &mut Expr, fallback: &str, what: &str) -> Check<String> {
        let ty = self.infer(expr, Some(fallback))?.unwrap_or_else(|| fallback.to_string());
        self.pin_literals(expr, &ty);
        if is_numeric(&ty) {
            Ok(ty)
        } else {
            Err(self.error(format!("{what} must be `i32` or `double`, found `{ty}`")))
        }
    }

    /// Check `expr` against a known type without touching the inference state.
    fn check_pinned(&mut self, expr: &mut Expr, expected: &str) -> Check {
        let saved = mem::take(&mut self.against);
        let outcome = self.check_expr(expr, expected);
        self.against = saved;
        outcome?;
        self.pin_literals(expr, expected);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    fn check_expr(&mut self, expr: &mut Expr, expected: &str) -> Check {
        match expr {
            Expr::Literal { ty, .. } => self.check_literal(ty, expected),
            Expr::Variable { name, address } => {
                let ty = self.narrow(name, address)?;
                let name = name.clone();
                self.expect_same(&ty, expected, || format!("variable `{name}`"))?;
                self.discover(&ty);
                Ok(())
            }
            Expr::Binary { op, lhs, rhs } => {
                let op = op.clone();
                self.check_binary(&op, lhs, rhs, expected)
            }
            Expr::Unary { op, operand } => {
                let symbol = operator_symbol(OperatorKind::Unary, op);
                let signature = self.signature(&symbol, "unary operator")?;
                self.expect_same(&signature.ret, expected, || format!("`{symbol}`"))?;
                self.discover(&signature.ret);
                self.check_pinned(operand, &signature.args[0])
            }
            Expr::Call { callee, args } => {
                let callee = callee.clone();
                let signature = self.signature(&callee, "function")?;
                if signature.args.len() != args.len() {
                    return Err(self.error(format!(
                        "`{callee}` expects {} arguments, got {}",
                        signature.args.len(),
                        args.len()
                    )));
                }
                self.expect_same(&signature.ret, expected, || format!("call to `{callee}`"))?;
                self.discover(&signature.ret);
                for (arg, ty) in args.iter_mut().zip(&signature.args) {
                    self.check_pinned(arg, ty)?;
                }
                Ok(())
            }
            Expr::If {
                condition,
                then_body,
                else_body,
            } => {
                self.infer_numeric(condition, DOUBLE, "if condition")?;
                if else_body.is_none() && !is_same_type(expected, VOID) && expected != ANY {
                    return Err(self.error(format!("if without else cannot produce a value of type `{expected}`")));
                }
                self.env.step();
                let then_outcome = self.check_body(then_body, expected);
                self.env.back();
                then_outcome.map_err(|r| {
                    self.diagnostics.push("in then body".to_string());
                    r
                })?;
                if let Some(else_body) = else_body {
                    self.env.step();
                    let else_outcome = self.check_body(else_body, expected);
                    self.env.back();
                    else_outcome.map_err(|r| {
                        self.diagnostics.push("in else body".to_string());
                        r
                    })?;
                }
                Ok(())
            }
            Expr::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                if expected != ANY && expected != VOID {
                    return Err(self.error(format!("a for loop cannot produce a value of type `{expected}`")));
                }
                self.env.step();
                let outcome = self.check_for(var, start, end, step.as_deref_mut(), body);
                self.env.back();
                outcome
            }
            Expr::VarDeclare { name, ty, init, is_const } => {
                let (name, ty) = (name.clone(), ty.clone());
                self.resolve_value_type(&ty, || format!("variable `{name}`"))?;
                match init {
                    Some(init) => self.check_pinned(init, &ty)?,
                    None if *is_const => {
                        return Err(self.error(format!("constant `{name}` requires an initializer")));
                    }
                    None => {}
                }
                self.env.insert(&name, &ty);
                if expected != ANY && expected != VOID {
                    return Err(self.error(format!("declaration of `{name}` does not produce a value")));
                }
                Ok(())
            }
            Expr::Return(value) => {
                let result = self.result_type.clone();
                if result == UNINIT {
                    return self.check_expr(value, ANY);
                }
                self.check_pinned(value, &result)
            }
            Expr::Array { elements, ty } => self.check_array(elements, ty, expected),
        }
    }

    fn check_literal(&mut self, ty: &mut String, expected: &str) -> Check {
        if *ty == UNINIT {
            if expected == ANY {
                if self.against.status == AgainstStatus::Checked {
                    if let Some(discovered) = &self.against.discovered {
                        if is_numeric(discovered) {
                            *ty = discovered.clone();
                        }
                    }
                }
                return Ok(());
            }
            if !is_numeric(expected) {
                return Err(self.error(format!("numeric literal used where `{expected}` is expected")));
            }
            *ty = expected.to_string();
            return Ok(());
        }

        if !is_numeric(ty) {
            return Err(self.error(format!("literal cannot have type `{ty}`")));
        }
        let found = ty.clone();
        self.expect_same(&found, expected, || "literal".to_string())?;
        if self.against.status == AgainstStatus::Checking
            && expected == ANY
            && self.against.literal_hint.is_none()
        {
            self.against.literal_hint = Some(found);
        }
        Ok(())
    }

    fn check_binary(&mut self, op: &str, lhs: &mut Expr, rhs: &mut Expr, expected: &str) -> Check {
        if op == "=" {
            let Expr::Variable { name, address } = lhs else {
                return Err(self.error("left side of `=` must be a variable"));
            };
            let target = self.narrow(name, address)?;
            self.check_pinned(rhs, &target)?;
            let name = name.clone();
            self.expect_same(&target, expected, || format!("assignment to `{name}`"))?;
            self.discover(&target);
            return Ok(());
        }

        if is_builtin_operator(op) {
            self.check_expr(lhs, expected)?;
            return self.check_expr(rhs, expected);
        }

        let symbol = operator_symbol(OperatorKind::Binary, op);
        let signature = self.signature(&symbol, "binary operator")?;
        self.expect_same(&signature.ret, expected, || format!("`{symbol}`"))?;
        self.discover(&signature.ret);
        self.check_pinned(lhs, &signature.args[0])?;
        self.check_pinned(rhs, &signature.args[1])
    }

    fn check_for(
        &mut self,
        var: &str,
        start: &mut Expr,
        end: &mut Expr,
        step: Option<&mut Expr>,
        body: &mut Body,
    ) -> Check {
        let var_ty = self.infer_numeric(start, DOUBLE, "loop start")?;
        self.env.insert(var, &var_ty);
        self.infer_numeric(end, &var_ty, "loop end condition")?;
        if let Some(step) = step {
            self.check_pinned(step, &var_ty)?;
        }
        self.check_body(body, ANY)
    }

    fn check_array(&mut self, elements: &mut [Expr], ty: &mut String, expected: &str) -> Check {
        let Some((annotated, _)) = extract_nesting_type(ty).map(|(e, n)| (e.to_string(), n)) else {
            return Err(self.error(format!("malformed array literal type `{ty}`")));
        };

        let target = if expected == ANY {
            ty.clone()
        } else {
            expected.to_string()
        };
        let Some((element, length)) = extract_nesting_type(&target).map(|(e, n)| (e.to_string(), n)) else {
            return Err(self.error(format!("array literal used where `{expected}` is expected")));
        };
        if elements.len() != length {
            return Err(self.error(format!(
                "array literal has {} elements, expected {length}",
                elements.len()
            )));
        }
        if annotated != element && annotated != innermost_element(&element) {
            return Err(self.error(format!(
                "array literal of `{annotated}` used where elements of `{element}` are expected"
            )));
        }
        self.resolve_value_type(&target, || "array literal".to_string())?;
        for item in elements.iter_mut() {
            self.check_pinned(item, &element)?;
        }
        self.discover(&target);
        *ty = target;
        Ok(())
    }

    /// Walk an address chain from the declared type of `name`.
    ///
    /// Index expressions are checked against `i32`.
    fn narrow(&mut self, name: &str, address: &mut [Address]) -> Check<String> {
        let Some(declared) = self.env.lookup(name) else {
            return Err(self.error(format!("unknown variable name `{name}`")));
        };
        let mut current = declared.to_string();
        for step in address.iter_mut() {
            match step {
                Address::Index(index) => {
                    self.check_pinned(index, I32)?;
                    let Some((element, _)) = extract_nesting_type(&current) else {
                        return Err(self.error(format!("cannot index `{name}`: `{current}` is not an array")));
                    };
                    current = element.to_string();
                }
                Address::Field(field) => {
                    let descriptor = self.types.resolve(&current);
                    let Ok(TypeDescriptor::Struct(decl)) = descriptor else {
                        return Err(self.error(format!("type `{current}` has no field `{field}`")));
                    };
                    let Some((_, field_ty)) = decl.field(field) else {
                        return Err(self.error(format!("struct `{}` has no field `{field}`", decl.name)));
                    };
                    current = field_ty.name();
                }
            }
        }
        Ok(current)
    }

    /// Pin every `uninit` literal reachable from `expr` to the type its
    /// position demands, with `ty` as the type of `expr` itself.
    fn pin_literals(&self, expr: &mut Expr, ty: &str) {
        match expr {
            Expr::Literal { ty: literal, .. } => {
                if *literal == UNINIT && is_numeric(ty) {
                    *literal = ty.to_string();
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                if *op == "=" {
                    return;
                }
                if is_builtin_operator(op) {
                    self.pin_literals(lhs, ty);
                    self.pin_literals(rhs, ty);
                } else if let Some(signature) = self.functions.get(&operator_symbol(OperatorKind::Binary, op)) {
                    self.pin_literals(lhs, &signature.args[0]);
                    self.pin_literals(rhs, &signature.args[1]);
                }
            }
            Expr::Unary { op, operand } => {
                if let Some(signature) = self.functions.get(&operator_symbol(OperatorKind::Unary, op)) {
                    self.pin_literals(operand, &signature.args[0]);
                }
            }
            Expr::Call { callee, args } => {
                if let Some(signature) = self.functions.get(callee.as_str()) {
                    for (arg, arg_ty) in args.iter_mut().zip(&signature.args) {
                        self.pin_literals(arg, arg_ty);
                    }
                }
            }
            Expr::Array { elements, ty: array_ty } => {
                if let Some((element, _)) = extract_nesting_type(array_ty) {
                    for item in elements.iter_mut() {
                        self.pin_literals(item, element);
                    }
                }
            }
            Expr::Variable { address, .. } => {
                for step in address.iter_mut() {
                    if let Address::Index(index) = step {
                        self.pin_literals(index, I32);
                    }
                }
            }
            Expr::If { .. } | Expr::For { .. } | Expr::VarDeclare { .. } | Expr::Return(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::precedence::PrecedenceTable;

    struct Fixture {
        table: PrecedenceTable,
        types: TypeRegistry,
        checker: TypeChecker,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                table: PrecedenceTable::new(),
                types: TypeRegistry::new(),
                checker: TypeChecker::new(),
            }
        }

        /// Check every declaration of `source`, returning them checked.
        fn check(&mut self, source: &str) -> Result<Vec<Declaration>, CoreError> {
            let mut decls = parse(source, &mut self.table)?;
            for decl in &mut decls {
                if let Declaration::Struct(s) = decl {
                    self.types
                        .register_struct(&s.name, &s.fields)
                        .map_err(|m| CoreError::TypeError(vec![m]))?;
                }
                self.checker.check(decl, &self.types)?;
            }
            Ok(decls)
        }

        fn check_ok(&mut self, source: &str) -> Vec<Declaration> {
            self.check(source).unwrap_or_else(|err| panic!("{source}: {err}"))
        }

        fn check_err(&mut self, source: &str) -> String {
            match self.check(source) {
                Ok(_) => panic!("expected a type error for {source}"),
                Err(err) => err.to_string(),
            }
        }
    }

    fn anonymous(decl: &Declaration) -> (&str, String) {
        let Declaration::Function(func) = decl else {
            panic!("expected a function");
        };
        (func.prototype.return_type.as_str(), func.body.to_string())
    }

    #[test]
    fn exec_with_answer_pins_literals() {
        let mut fx = Fixture::new();
        let decls = fx.check_ok("exec: double 2 + 3");
        assert_eq!(anonymous(&decls[0]), ("double", "{(return (+ 2:double 3:double)) =>}".to_string()));
    }

    #[test]
    fn infers_from_first_concrete_sub_term() {
        let mut fx = Fixture::new();
        let decls = fx.check_ok(
            "def f(x: i32) -> i32 { x }\n\
             exec 1 + f(2) * 3",
        );
        assert_eq!(
            anonymous(&decls[1]),
            ("i32", "{(return (+ 1:i32 (* (call f 2:i32) 3:i32))) =>}".to_string())
        );
    }

    #[test]
    fn typed_literal_is_a_fallback_for_inference() {
        let mut fx = Fixture::new();
        let decls = fx.check_ok("exec 2: i32 + 3");
        assert_eq!(anonymous(&decls[0]).0, "i32");
        let err = fx.check_err("exec 2 + 3");
        assert!(err.contains("cannot infer execution result type"), "{err}");
    }

    #[test]
    fn call_arguments_take_parameter_types() {
        let mut fx = Fixture::new();
        let decls = fx.check_ok(
            "def g(n: i32) -> double { 1 }\n\
             exec g(4)",
        );
        assert_eq!(anonymous(&decls[1]), ("double", "{(return (call g 4:i32)) =>}".to_string()));
    }

    #[test]
    fn rejects_mismatched_signatures() {
        let mut fx = Fixture::new();
        fx.check_ok("def f(x: double) -> double { x }");
        assert!(fx.check_err("def g(y: i32) -> i32 { f(y) }").contains("call to `f`"));
        assert!(fx.check_err("def h() -> double { f(1, 2) }").contains("expects 1 arguments"));
        assert!(fx.check_err("def k() -> double { nope(1) }").contains("unknown function `nope`"));
        assert!(fx.check_err("def m() -> double { y }").contains("unknown variable name `y`"));
    }

    #[test]
    fn failed_definition_restores_previous_signature() {
        let mut fx = Fixture::new();
        fx.check_ok("def f(x: double) -> double { x }");
        fx.check_err("def f(x: i32) -> i32 { x + q }");
        let signature = fx.checker.signature("f").expect("f stays declared");
        assert_eq!(signature.ret, "double");
        fx.check_err("def fresh() -> double { q }");
        assert!(fx.checker.signature("fresh").is_none());
    }

    #[test]
    fn recursion_sees_own_signature() {
        let mut fx = Fixture::new();
        fx.check_ok(
            "def fib(x: double) -> double { if (x < 3) { 1 } else { fib(x - 1) + fib(x - 2) } }",
        );
    }

    #[test]
    fn if_condition_is_inferred_and_pinned() {
        let mut fx = Fixture::new();
        let decls = fx.check_ok("def f(n: i32) -> i32 { if (n < 2) { return 1; } return n; }");
        let Declaration::Function(func) = &decls[0] else {
            panic!("expected function");
        };
        let Expr::If { condition, .. } = &func.body.expressions[0] else {
            panic!("expected if");
        };
        assert_eq!(condition.to_string(), "(< n 2:i32)");
    }

    #[test]
    fn literal_only_condition_defaults_to_double() {
        let mut fx = Fixture::new();
        let decls = fx.check_ok("def f() -> double { if (1) { return 2; } return 3; }");
        let Declaration::Function(func) = &decls[0] else {
            panic!("expected function");
        };
        let Expr::If { condition, .. } = &func.body.expressions[0] else {
            panic!("expected if");
        };
        assert_eq!(condition.to_string(), "1:double");
    }

    #[test]
    fn for_loop_variable_takes_start_type() {
        let mut fx = Fixture::new();
        let decls = fx.check_ok(
            "def sum(n: i32) -> i32 { var acc: i32 = 0; for (i = 0: i32, i < n) { acc = acc + i; } return acc; }",
        );
        let Declaration::Function(func) = &decls[0] else {
            panic!("expected function");
        };
        assert_eq!(
            func.body.expressions[1].to_string(),
            "(for i 0:i32 (< i n) {(= acc (+ acc i))})"
        );
    }

    #[test]
    fn trailing_for_is_a_recoverable_error() {
        let mut fx = Fixture::new();
        let mut decls = parse("def f() { 1; }", &mut fx.table).unwrap();
        let Declaration::Function(func) = &mut decls[0] else {
            panic!("expected function");
        };
        func.body = Body {
            expressions: vec![Expr::For {
                var: "i".to_string(),
                start: Box::new(Expr::Literal { value: 0.0, ty: "double".to_string() }),
                end: Box::new(Expr::Literal { value: 0.0, ty: "double".to_string() }),
                step: None,
                body: Body::default(),
            }],
            has_return_value: true,
        };
        let err = fx.checker.check(&mut decls[0], &fx.types).unwrap_err();
        assert!(err.to_string().contains("for loop cannot be the value"), "{err}");
        fx.check_ok("def g() -> double { 1 }");
    }

    #[test]
    fn trailing_declaration_requires_void() {
        let mut fx = Fixture::new();
        fx.check_ok("def f() { var x: double = 1 }");
        assert!(fx.check_err("def g() -> double { var x: double = 1 }").contains("declaration of `x`"));
    }

    #[test]
    fn constants_need_initializers() {
        let mut fx = Fixture::new();
        assert!(fx.check_err("def f() { val x: double; }").contains("requires an initializer"));
    }

    #[test]
    fn address_chains_narrow_through_structs_and_arrays() {
        let mut fx = Fixture::new();
        fx.check_ok(
            "struct Foo { m: double, n: i32, }\n\
             struct Bar { a: double, b: array%Foo%2, }\n\
             def f() -> double { var x: Bar; x.b[1].m = 1.0; x.b[1].m }",
        );
        assert!(fx
            .check_err("def g() -> double { var x: Bar; x.b.m }")
            .contains("type `array%Foo%2` has no field `m`"));
        assert!(fx
            .check_err("def h() -> double { var x: Bar; x.a[0] }")
            .contains("cannot index"));
        assert!(fx
            .check_err("def k() -> i32 { var x: Bar; x.b[0].m }")
            .contains("expected `i32`"));
    }

    #[test]
    fn nested_array_literal_takes_declared_type() {
        let mut fx = Fixture::new();
        let decls = fx.check_ok(
            "def f() -> double { var x: array%array%double%2%2 = [[2, 2]: double, [3, 3]: double]: double; x[0][1] }",
        );
        let Declaration::Function(func) = &decls[0] else {
            panic!("expected function");
        };
        let Expr::VarDeclare { init: Some(init), .. } = &func.body.expressions[0] else {
            panic!("expected declaration");
        };
        assert_eq!(
            init.to_string(),
            "[[2:double 2:double]:array%double%2 [3:double 3:double]:array%double%2]:array%array%double%2%2"
        );
        assert!(fx
            .check_err("def g() { var y: array%double%3 = [1, 2]: double; }")
            .contains("has 2 elements"));
        assert!(fx
            .check_err("def h() { var y: array%double%2 = [1, 2]: i32; }")
            .contains("array literal of `i32`"));
    }

    #[test]
    fn custom_operators_check_against_their_signature() {
        let mut fx = Fixture::new();
        let decls = fx.check_ok(
            "def binary | 5 (a: double, b: double) -> double { if (a) { return 1; } return b; }\n\
             exec 0 | 0",
        );
        assert_eq!(anonymous(&decls[1]), ("double", "{(return (| 0:double 0:double)) =>}".to_string()));
        assert!(fx.check_err("exec 1 ^ 2").contains("unknown binary operator"));
    }
}
