//! Regex driven lexer for kscope.
//!
//! Comments (`#` to end of line) are blanked out first so that byte
//! offsets reported in errors still point into the caller's source.
//! Tokenizing is all-or-nothing: a single unmatched character rejects
//! the whole input and no partial token list is returned.

use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::CoreError;

/// Kind of a token produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Special
    Eof,

    // Identifiers and literals
    Ident(String),
    Number(f64),
    Operator(String),

    // Punctuation
    Semi,     // ;
    Comma,    // ,
    LParen,   // (
    RParen,   // )
    LBrace,   // {
    RBrace,   // }
    LBracket, // [
    RBracket, // ]
    Colon,    // :
    Dot,      // .
    Arrow,    // ->

    // Keywords
    Def,
    Extern,
    Struct,
    Exec,
    If,
    Else,
    For,
    In,
    Binary,
    Unary,
    /// `var` (constant = false) or `val` (constant = true).
    Var { constant: bool },
    Return,
}

impl TokenKind {
    fn keyword(text: &str) -> Option<TokenKind> {
        let kind = match text {
            "def" => TokenKind::Def,
            "extern" => TokenKind::Extern,
            "struct" => TokenKind::Struct,
            "exec" => TokenKind::Exec,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "binary" => TokenKind::Binary,
            "unary" => TokenKind::Unary,
            "var" => TokenKind::Var { constant: false },
            "val" => TokenKind::Var { constant: true },
            "return" => TokenKind::Return,
            _ => return None,
        };
        Some(kind)
    }

    fn punctuation(text: &str) -> Option<TokenKind> {
        let kind = match text {
            ";" => TokenKind::Semi,
            "," => TokenKind::Comma,
            "(" => TokenKind::LParen,
            ")" => TokenKind::RParen,
            "{" => TokenKind::LBrace,
            "}" => TokenKind::RBrace,
            "[" => TokenKind::LBracket,
            "]" => TokenKind::RBracket,
            ":" => TokenKind::Colon,
            "." => TokenKind::Dot,
            "->" => TokenKind::Arrow,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Eof => write!(f, "end of input"),
            TokenKind::Ident(name) => write!(f, "identifier `{name}`"),
            TokenKind::Number(value) => write!(f, "number `{value}`"),
            TokenKind::Operator(op) => write!(f, "operator `{op}`"),
            TokenKind::Semi => write!(f, "`;`"),
            TokenKind::Comma => write!(f, "`,`"),
            TokenKind::LParen => write!(f, "`(`"),
            TokenKind::RParen => write!(f, "`)`"),
            TokenKind::LBrace => write!(f, "`{{`"),
            TokenKind::RBrace => write!(f, "`}}`"),
            TokenKind::LBracket => write!(f, "`[`"),
            TokenKind::RBracket => write!(f, "`]`"),
            TokenKind::Colon => write!(f, "`:`"),
            TokenKind::Dot => write!(f, "`.`"),
            TokenKind::Arrow => write!(f, "`->`"),
            TokenKind::Def => write!(f, "`def`"),
            TokenKind::Extern => write!(f, "`extern`"),
            TokenKind::Struct => write!(f, "`struct`"),
            TokenKind::Exec => write!(f, "`exec`"),
            TokenKind::If => write!(f, "`if`"),
            TokenKind::Else => write!(f, "`else`"),
            TokenKind::For => write!(f, "`for`"),
            TokenKind::In => write!(f, "`in`"),
            TokenKind::Binary => write!(f, "`binary`"),
            TokenKind::Unary => write!(f, "`unary`"),
            TokenKind::Var { constant: false } => write!(f, "`var`"),
            TokenKind::Var { constant: true } => write!(f, "`val`"),
            TokenKind::Return => write!(f, "`return`"),
        }
    }
}

/// A single token with the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

static COMMENT_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?m)#.*$"));

static TOKEN_PATTERN: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?:",
        r"(?P<ident>[A-Za-z_][A-Za-z0-9_%]*)",
        r"|(?P<number>[0-9]+(?:\.[0-9]*)?)",
        r"|(?P<punct>[;,(){}\[\]])",
        r"|(?P<op>[!-'*-/:<-@\^`|~][!-'*-/:<-@\^`|~]?)",
        r")",
    ))
});

fn pattern(cell: &'static LazyLock<Result<Regex, regex::Error>>) -> Result<&'static Regex, CoreError> {
    cell.as_ref().map_err(|err| CoreError::LexError {
        position: 0,
        message: format!("invalid token pattern: {err}"),
    })
}

/// Split `source` into tokens, ending with [`TokenKind::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Token>, CoreError> {
    let stripped = pattern(&COMMENT_PATTERN)?
        .replace_all(source, |caps: &Captures| " ".repeat(caps[0].len()));
    Lexer::new(&stripped, pattern(&TOKEN_PATTERN)?).run()
}

struct Lexer<'a> {
    source: &'a str,
    pattern: &'a Regex,
    position: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str, pattern: &'a Regex) -> Self {
        Lexer {
            source,
            pattern,
            position: 0,
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, CoreError> {
        loop {
            self.skip_whitespace();
            if self.position >= self.source.len() {
                break;
            }
            let (kind, len) = self.next_kind()?;
            self.tokens.push(Token {
                kind,
                position: self.position,
            });
            self.position += len;
        }
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            position: self.source.len(),
        });
        Ok(self.tokens)
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.source[self.position..];
        let trimmed = rest.trim_start_matches([' ', '\t', '\r', '\n']);
        self.position += rest.len() - trimmed.len();
    }

    /// Classify the token at the cursor, returning it with its byte length.
    fn next_kind(&self) -> Result<(TokenKind, usize), CoreError> {
        let rest = &self.source[self.position..];
        let Some(caps) = self.pattern.captures(rest) else {
            let found = rest.chars().next().unwrap_or(' ');
            return Err(CoreError::LexError {
                position: self.position,
                message: format!("unexpected character `{found}`"),
            });
        };

        if let Some(m) = caps.name("ident") {
            let text = m.as_str();
            let kind = TokenKind::keyword(text).unwrap_or_else(|| TokenKind::Ident(text.to_string()));
            return Ok((kind, m.len()));
        }
        if let Some(m) = caps.name("number") {
            let value = m.as_str().parse::<f64>().map_err(|err| CoreError::LexError {
                position: self.position,
                message: format!("malformed number `{}`: {err}", m.as_str()),
            })?;
            return Ok((TokenKind::Number(value), m.len()));
        }
        // Both punctuation and operator text may map onto a punctuation kind
        // (`:`, `.` and `->` are matched by the operator class).
        let m = caps
            .name("punct")
            .or_else(|| caps.name("op"))
            .ok_or_else(|| CoreError::LexError {
                position: self.position,
                message: "empty token match".to_string(),
            })?;
        let text = m.as_str();
        let kind = TokenKind::punctuation(text).unwrap_or_else(|| TokenKind::Operator(text.to_string()));
        Ok((kind, m.len()))
    }
}
