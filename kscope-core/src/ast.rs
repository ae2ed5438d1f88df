use std::fmt;

/// Name given to the function wrapping a top-level expression.
pub const ANONYMOUS_FUNCTION: &str = "__anon_expr";

#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Function(Function),
    Extern(Prototype),
    Struct(StructDecl),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub prototype: Prototype,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Unary,
    Binary,
}

impl OperatorKind {
    pub const fn arity(self) -> usize {
        match self {
            OperatorKind::Unary => 1,
            OperatorKind::Binary => 2,
        }
    }

    pub const fn prefix(self) -> &'static str {
        match self {
            OperatorKind::Unary => "unary",
            OperatorKind::Binary => "binary",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prototype {
    /// Function name, or the operator text for operator functions.
    pub name: String,
    pub args: Vec<(String, String)>,
    pub return_type: String,
    pub operator: Option<OperatorKind>,
    pub precedence: i32,
}

impl Prototype {
    pub fn is_operator(&self) -> bool {
        self.operator.is_some()
    }

    pub fn is_binary_operator(&self) -> bool {
        self.operator == Some(OperatorKind::Binary)
    }

    pub fn is_anonymous(&self) -> bool {
        self.name == ANONYMOUS_FUNCTION
    }

    /// Name used in function tables and the IR module.
    ///
    /// Operator functions are prefixed with their kind so that `unary -`
    /// and `binary -` never collide.
    pub fn symbol(&self) -> String {
        match self.operator {
            Some(kind) => operator_symbol(kind, &self.name),
            None => self.name.clone(),
        }
    }
}

pub fn operator_symbol(kind: OperatorKind, op: &str) -> String {
    format!("{}{op}", kind.prefix())
}

/// Statement list of a function, branch or loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    pub expressions: Vec<Expr>,
    /// The last expression is the value of the body.
    pub has_return_value: bool,
}

/// One narrowing step after a variable name: `[expr]` or `.field`.
#[derive(Debug, Clone, PartialEq)]
pub enum Address {
    Index(Expr),
    Field(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal {
        value: f64,
        ty: String,
    },
    Variable {
        name: String,
        address: Vec<Address>,
    },
    Binary {
        op: String,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: String,
        operand: Box<Expr>,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    If {
        condition: Box<Expr>,
        then_body: Body,
        else_body: Option<Body>,
    },
    For {
        var: String,
        start: Box<Expr>,
        end: Box<Expr>,
        step: Option<Box<Expr>>,
        body: Body,
    },
    VarDeclare {
        name: String,
        ty: String,
        init: Option<Box<Expr>>,
        is_const: bool,
    },
    Return(Box<Expr>),
    Array {
        elements: Vec<Expr>,
        ty: String,
    },
}

impl Expr {
    pub fn variable(name: impl Into<String>) -> Expr {
        Expr::Variable {
            name: name.into(),
            address: Vec::new(),
        }
    }
}

// Compact s-expression rendering, used by `--emit ast` and in tests.

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Declaration::Function(func) => write!(f, "(def {} {})", func.prototype, func.body),
            Declaration::Extern(proto) => write!(f, "(extern {proto})"),
            Declaration::Struct(decl) => {
                write!(f, "(struct {}", decl.name)?;
                for (name, ty) in &decl.fields {
                    write!(f, " {name}:{ty}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.symbol())?;
        for (i, (name, ty)) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{name}:{ty}")?;
        }
        write!(f, ")->{}", self.return_type)
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, expr) in self.expressions.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{expr}")?;
        }
        if self.has_return_value {
            write!(f, " =>")?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal { value, ty } => write!(f, "{value}:{ty}"),
            Expr::Variable { name, address } => {
                write!(f, "{name}")?;
                for step in address {
                    match step {
                        Address::Index(index) => write!(f, "[{index}]")?,
                        Address::Field(field) => write!(f, ".{field}")?,
                    }
                }
                Ok(())
            }
            Expr::Binary { op, lhs, rhs } => write!(f, "({op} {lhs} {rhs})"),
            Expr::Unary { op, operand } => write!(f, "({op} {operand})"),
            Expr::Call { callee, args } => {
                write!(f, "(call {callee}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                write!(f, ")")
            }
            Expr::If {
                condition,
                then_body,
                else_body,
            } => {
                write!(f, "(if {condition} {then_body}")?;
                if let Some(else_body) = else_body {
                    write!(f, " {else_body}")?;
                }
                write!(f, ")")
            }
            Expr::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                write!(f, "(for {var} {start} {end}")?;
                if let Some(step) = step {
                    write!(f, " {step}")?;
                }
                write!(f, " {body})")
            }
            Expr::VarDeclare {
                name,
                ty,
                init,
                is_const,
            } => {
                let keyword = if *is_const { "val" } else { "var" };
                write!(f, "({keyword} {name}:{ty}")?;
                if let Some(init) = init {
                    write!(f, " {init}")?;
                }
                write!(f, ")")
            }
            Expr::Return(value) => write!(f, "(return {value})"),
            Expr::Array { elements, ty } => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, "]:{ty}")
            }
        }
    }
}
