//! Recursive descent parser with precedence climbing for binary operators.
//!
//! The parser borrows the session's [`PrecedenceTable`] mutably: operator
//! prototypes install their precedence while the rest of the chunk is
//! still being parsed, so an operator can be used right after it is
//! declared.

use crate::ast::{
    ANONYMOUS_FUNCTION, Address, Body, Declaration, Expr, Function, OperatorKind, Prototype,
    StructDecl,
};
use crate::error::CoreError;
use crate::lexer::{Token, TokenKind, tokenize};
use crate::precedence::{DEFAULT_BINARY_PRECEDENCE, PrecedenceTable, UNARY_PRECEDENCE};
use crate::types::{UNINIT, VOID, array_type_name};

/// Declarations parsed from one chunk, plus the error that stopped parsing.
///
/// On error the declarations collected so far are still returned; callers
/// are expected to discard them.
#[derive(Debug)]
pub struct ParseOutput {
    pub declarations: Vec<Declaration>,
    pub error: Option<CoreError>,
}

impl ParseOutput {
    pub fn into_result(self) -> Result<Vec<Declaration>, CoreError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.declarations),
        }
    }
}

/// Lex and parse `source` in one step.
pub fn parse(source: &str, precedence: &mut PrecedenceTable) -> Result<Vec<Declaration>, CoreError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens, precedence).parse().into_result()
}

pub struct Parser<'p> {
    tokens: Vec<Token>,
    position: usize,
    precedence: &'p mut PrecedenceTable,
}

fn error<T>(message: impl Into<String>) -> Result<T, CoreError> {
    Err(CoreError::ParseError(message.into()))
}

impl<'p> Parser<'p> {
    pub fn new(tokens: Vec<Token>, precedence: &'p mut PrecedenceTable) -> Self {
        Parser {
            tokens,
            position: 0,
            precedence,
        }
    }

    pub fn parse(mut self) -> ParseOutput {
        let mut declarations = Vec::new();
        loop {
            let result = match self.peek() {
                TokenKind::Eof => break,
                TokenKind::Semi => {
                    self.bump();
                    continue;
                }
                TokenKind::Def => self.parse_definition(),
                TokenKind::Extern => self.parse_extern(),
                TokenKind::Struct => self.parse_struct(),
                TokenKind::Exec => self.parse_exec(),
                _ => self.parse_top_level_expression(UNINIT.to_string()),
            };
            match result {
                Ok(declaration) => declarations.push(declaration),
                Err(err) => {
                    return ParseOutput {
                        declarations,
                        error: Some(err),
                    };
                }
            }
        }
        ParseOutput {
            declarations,
            error: None,
        }
    }

    // ---------------------------------------------------------------------
    // Token cursor
    // ---------------------------------------------------------------------

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map_or(&TokenKind::Eof, |token| &token.kind)
    }

    fn previous(&self) -> Option<&TokenKind> {
        self.position
            .checked_sub(1)
            .and_then(|index| self.tokens.get(index))
            .map(|token| &token.kind)
    }

    fn bump(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.position < self.tokens.len() {
            self.position += 1;
        }
        kind
    }

    fn expect(&mut self, kind: TokenKind, context: &str) -> Result<(), CoreError> {
        if *self.peek() == kind {
            self.bump();
            Ok(())
        } else {
            error(format!("expected {kind} {context}, found {}", self.peek()))
        }
    }

    fn expect_ident(&mut self, context: &str) -> Result<String, CoreError> {
        match self.bump() {
            TokenKind::Ident(name) => Ok(name),
            other => error(format!("expected identifier {context}, found {other}")),
        }
    }

    fn current_precedence(&self) -> i32 {
        match self.peek() {
            TokenKind::Operator(op) => self.precedence.get(op).unwrap_or(-1),
            _ => -1,
        }
    }

    // ---------------------------------------------------------------------
    // Declarations
    // ---------------------------------------------------------------------

    /// definition ::= 'def' prototype '{' body '}'
    fn parse_definition(&mut self) -> Result<Declaration, CoreError> {
        self.bump(); // def
        let prototype = self.parse_prototype()?;
        self.expect(TokenKind::LBrace, "before function body")?;
        let body = self.parse_body()?;
        self.expect(TokenKind::RBrace, "after function body")?;
        Ok(Declaration::Function(Function { prototype, body }))
    }

    /// external ::= 'extern' prototype
    fn parse_extern(&mut self) -> Result<Declaration, CoreError> {
        self.bump(); // extern
        Ok(Declaration::Extern(self.parse_prototype()?))
    }

    /// struct ::= 'struct' id '{' (id ':' type ',')* '}'
    fn parse_struct(&mut self) -> Result<Declaration, CoreError> {
        self.bump(); // struct
        let name = self.expect_ident("after `struct`")?;
        self.expect(TokenKind::LBrace, "after struct name")?;
        let mut fields = Vec::new();
        while *self.peek() != TokenKind::RBrace {
            let field = self.expect_ident("as struct field name")?;
            self.expect(TokenKind::Colon, "after struct field name")?;
            let ty = self.expect_ident("as struct field type")?;
            self.expect(TokenKind::Comma, "after struct field")?;
            fields.push((field, ty));
        }
        self.bump(); // }
        Ok(Declaration::Struct(StructDecl { name, fields }))
    }

    /// exec ::= 'exec' (':' type)? expression
    fn parse_exec(&mut self) -> Result<Declaration, CoreError> {
        self.bump(); // exec
        let answer = if *self.peek() == TokenKind::Colon {
            self.bump();
            self.expect_ident("as execution result type")?
        } else {
            UNINIT.to_string()
        };
        self.parse_top_level_expression(answer)
    }

    /// A top-level expression becomes an anonymous function returning it.
    fn parse_top_level_expression(&mut self, answer: String) -> Result<Declaration, CoreError> {
        let expr = self.parse_expression()?;
        let prototype = Prototype {
            name: ANONYMOUS_FUNCTION.to_string(),
            args: Vec::new(),
            return_type: answer,
            operator: None,
            precedence: 0,
        };
        let body = Body {
            expressions: vec![Expr::Return(Box::new(expr))],
            has_return_value: true,
        };
        Ok(Declaration::Function(Function { prototype, body }))
    }

    /// prototype ::= (id | 'binary' op number? | 'unary' op) '(' (id ':' type),* ')' ('->' type)?
    fn parse_prototype(&mut self) -> Result<Prototype, CoreError> {
        let (name, operator, precedence) = match self.bump() {
            TokenKind::Ident(name) => (name, None, 0),
            TokenKind::Binary => {
                let op = match self.bump() {
                    TokenKind::Operator(op) => op,
                    other => return error(format!("expected binary operator, found {other}")),
                };
                let precedence = match *self.peek() {
                    TokenKind::Number(value) => {
                        self.bump();
                        if value.fract() != 0.0 || !PrecedenceTable::is_valid_binary(value as i32) {
                            return error("Invalid precedence: must be 1..100");
                        }
                        value as i32
                    }
                    _ => DEFAULT_BINARY_PRECEDENCE,
                };
                self.precedence.set(&op, precedence);
                (op, Some(OperatorKind::Binary), precedence)
            }
            TokenKind::Unary => {
                let op = match self.bump() {
                    TokenKind::Operator(op) => op,
                    other => return error(format!("expected unary operator, found {other}")),
                };
                self.precedence.set(&op, UNARY_PRECEDENCE);
                (op, Some(OperatorKind::Unary), UNARY_PRECEDENCE)
            }
            other => return error(format!("expected function name in prototype, found {other}")),
        };

        self.expect(TokenKind::LParen, "in prototype")?;
        let mut args = Vec::new();
        if *self.peek() != TokenKind::RParen {
            loop {
                let arg = self.expect_ident("as argument name")?;
                self.expect(TokenKind::Colon, "after argument name")?;
                let ty = self.expect_ident("as argument type")?;
                args.push((arg, ty));
                match self.bump() {
                    TokenKind::Comma => continue,
                    TokenKind::RParen => break,
                    other => return error(format!("expected `,` or `)` in prototype, found {other}")),
                }
            }
        } else {
            self.bump(); // )
        }

        let return_type = if *self.peek() == TokenKind::Arrow {
            self.bump();
            self.expect_ident("as return type")?
        } else {
            VOID.to_string()
        };

        if let Some(kind) = operator {
            if args.len() != kind.arity() {
                return error("Invalid number of operands for operator");
            }
        }

        Ok(Prototype {
            name,
            args,
            return_type,
            operator,
            precedence,
        })
    }

    /// body ::= (expression ';')* expression?
    ///
    /// Statements ending in `}` need no terminator. At most one statement,
    /// the last, may be left unterminated; it is the value of the body.
    fn parse_body(&mut self) -> Result<Body, CoreError> {
        let mut expressions = Vec::new();
        let mut unterminated = false;
        while *self.peek() != TokenKind::RBrace {
            if *self.peek() == TokenKind::Eof {
                return error("unexpected end of input in body");
            }
            if unterminated {
                return error("Expect one non-delimiter at body.");
            }
            let expr = self.parse_expression()?;
            if *self.peek() == TokenKind::Semi {
                self.bump();
            } else if self.previous() != Some(&TokenKind::RBrace) {
                unterminated = true;
            }
            expressions.push(expr);
        }
        let ends_in_return = matches!(expressions.last(), Some(Expr::Return(_)));
        Ok(Body {
            expressions,
            has_return_value: unterminated || ends_in_return,
        })
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    /// expression ::= unary binoprhs
    fn parse_expression(&mut self) -> Result<Expr, CoreError> {
        let lhs = self.parse_unary()?;
        self.parse_binary_rhs(0, lhs)
    }

    /// binoprhs ::= (op unary)*
    fn parse_binary_rhs(&mut self, min_precedence: i32, mut lhs: Expr) -> Result<Expr, CoreError> {
        loop {
            let precedence = self.current_precedence();
            if precedence < min_precedence {
                return Ok(lhs);
            }
            let TokenKind::Operator(op) = self.bump() else {
                return error("expected binary operator");
            };
            let mut rhs = self.parse_unary()?;
            if precedence < self.current_precedence() {
                rhs = self.parse_binary_rhs(precedence + 1, rhs)?;
            }
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    /// unary ::= op unary | primary
    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        if let TokenKind::Operator(op) = self.peek().clone() {
            self.bump();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, CoreError> {
        match self.peek() {
            TokenKind::Ident(_) => self.parse_identifier(),
            TokenKind::Number(_) => self.parse_literal(),
            TokenKind::LParen => self.parse_paren(),
            TokenKind::LBracket => self.parse_array(),
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::Var { .. } => self.parse_var(),
            TokenKind::Return => self.parse_return(),
            other => error(format!("unknown token {other} when expecting an expression")),
        }
    }

    /// identifier ::= id | id '(' expression,* ')' | id ('[' expression ']' | '.' id)*
    fn parse_identifier(&mut self) -> Result<Expr, CoreError> {
        let name = self.expect_ident("at start of expression")?;

        if *self.peek() == TokenKind::LParen {
            self.bump();
            let mut args = Vec::new();
            if *self.peek() != TokenKind::RParen {
                loop {
                    args.push(self.parse_expression()?);
                    match self.bump() {
                        TokenKind::Comma => continue,
                        TokenKind::RParen => break,
                        other => {
                            return error(format!("expected `)` or `,` in argument list, found {other}"));
                        }
                    }
                }
            } else {
                self.bump();
            }
            return Ok(Expr::Call { callee: name, args });
        }

        let mut address = Vec::new();
        loop {
            match self.peek() {
                TokenKind::LBracket => {
                    self.bump();
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::RBracket, "after index")?;
                    address.push(Address::Index(index));
                }
                TokenKind::Dot => {
                    self.bump();
                    address.push(Address::Field(self.expect_ident("after `.`")?));
                }
                _ => break,
            }
        }
        Ok(Expr::Variable { name, address })
    }

    /// literal ::= number (':' type)?
    fn parse_literal(&mut self) -> Result<Expr, CoreError> {
        let TokenKind::Number(value) = self.bump() else {
            return error("expected number");
        };
        let ty = if *self.peek() == TokenKind::Colon {
            self.bump();
            self.expect_ident("as literal type")?
        } else {
            UNINIT.to_string()
        };
        Ok(Expr::Literal { value, ty })
    }

    fn parse_paren(&mut self) -> Result<Expr, CoreError> {
        self.bump(); // (
        let expr = self.parse_expression()?;
        self.expect(TokenKind::RParen, "after parenthesized expression")?;
        Ok(expr)
    }

    /// array ::= '[' expression,+ ']' ':' type
    fn parse_array(&mut self) -> Result<Expr, CoreError> {
        self.bump(); // [
        let mut elements = Vec::new();
        loop {
            elements.push(self.parse_expression()?);
            match self.bump() {
                TokenKind::Comma => continue,
                TokenKind::RBracket => break,
                other => return error(format!("expected `,` or `]` in array literal, found {other}")),
            }
        }
        self.expect(TokenKind::Colon, "after array literal")?;
        let element = self.expect_ident("as array element type")?;
        let ty = array_type_name(&element, elements.len());
        Ok(Expr::Array { elements, ty })
    }

    /// if ::= 'if' '(' expression ')' '{' body '}' ('else' '{' body '}')?
    fn parse_if(&mut self) -> Result<Expr, CoreError> {
        self.bump(); // if
        self.expect(TokenKind::LParen, "after `if`")?;
        let condition = self.parse_expression()?;
        self.expect(TokenKind::RParen, "after if condition")?;
        let then_body = self.parse_block("then")?;
        let else_body = if *self.peek() == TokenKind::Else {
            self.bump();
            Some(self.parse_block("else")?)
        } else {
            None
        };
        Ok(Expr::If {
            condition: Box::new(condition),
            then_body,
            else_body,
        })
    }

    /// for ::= 'for' '(' id '=' expression ',' expression (',' expression)? ')' '{' body '}'
    fn parse_for(&mut self) -> Result<Expr, CoreError> {
        self.bump(); // for
        self.expect(TokenKind::LParen, "after `for`")?;
        let var = self.expect_ident("as loop variable")?;
        match self.bump() {
            TokenKind::Operator(op) if op == "=" => {}
            other => return error(format!("expected `=` after loop variable, found {other}")),
        }
        let start = self.parse_expression()?;
        self.expect(TokenKind::Comma, "after loop start value")?;
        let end = self.parse_expression()?;
        let step = if *self.peek() == TokenKind::Comma {
            self.bump();
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };
        self.expect(TokenKind::RParen, "after loop header")?;
        let body = self.parse_block("loop")?;
        Ok(Expr::For {
            var,
            start: Box::new(start),
            end: Box::new(end),
            step,
            body,
        })
    }

    /// var ::= ('var' | 'val') id ':' type ('=' expression)?
    fn parse_var(&mut self) -> Result<Expr, CoreError> {
        let TokenKind::Var { constant } = self.bump() else {
            return error("expected `var` or `val`");
        };
        let name = self.expect_ident("after `var`")?;
        self.expect(TokenKind::Colon, "after variable name")?;
        let ty = self.expect_ident("as variable type")?;
        let init = if matches!(self.peek(), TokenKind::Operator(op) if op == "=") {
            self.bump();
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };
        Ok(Expr::VarDeclare {
            name,
            ty,
            init,
            is_const: constant,
        })
    }

    fn parse_return(&mut self) -> Result<Expr, CoreError> {
        self.bump(); // return
        Ok(Expr::Return(Box::new(self.parse_expression()?)))
    }

    fn parse_block(&mut self, what: &str) -> Result<Body, CoreError> {
        self.expect(TokenKind::LBrace, &format!("before {what} body"))?;
        let body = self.parse_body()?;
        self.expect(TokenKind::RBrace, &format!("after {what} body"))?;
        Ok(body)
    }
}
