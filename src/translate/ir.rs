//! Language-neutral representation produced by every frontend's `parse` and
//! consumed by every frontend's `emit`.
//!
//! Statements are structured; expressions stay as token sequences because both
//! languages share almost all of their expression grammar. Emitters map the few
//! operators that differ while rendering.

use super::lexer::{Token, TokenKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub fn of(token: &Token) -> Self {
        Self {
            line: token.line,
            column: token.column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Expr {
    pub tokens: Vec<Token>,
}

impl Expr {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn location(&self) -> Location {
        self.tokens.first().map(Location::of).unwrap_or_default()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.tokens.iter().any(|t| t.is_name(name))
    }

    pub fn contains_op(&self, op: &str) -> bool {
        self.tokens.iter().any(|t| t.is_op(op))
    }

    /// A single bare identifier, e.g. a parameter used as a field default
    pub fn as_name(&self) -> Option<&str> {
        match self.tokens.as_slice() {
            [t] if t.kind == TokenKind::Name => Some(&t.text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Module {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: Location,
}

impl Stmt {
    pub fn new(kind: StmtKind, loc: Location) -> Self {
        Self { kind, loc }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StmtKind {
    Import(Import),
    Function(Function),
    Archetype(Archetype),
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Raise(Option<Expr>),
    Assign {
        target: Expr,
        annotation: Option<Expr>,
        op: String,
        value: Option<Expr>,
    },
    Expr(Expr),
    Pass,
    Break,
    Continue,
    /// Graph-language module entry block
    Entry(Vec<Stmt>),
    /// Graph traversal: `visit <expr>;`
    Visit(Expr),
    /// Graph walker output: `report <expr>;`
    Report(Expr),
    /// Graph walker termination
    Disengage,
    /// Source that the parser could not represent; emitted as a comment
    Unsupported { text: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    /// `from module import a as b` style names; empty for a plain module import
    pub names: Vec<(String, Option<String>)>,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Includes a leading `*` or `**` for variadic parameters
    pub name: String,
    pub annotation: Option<Expr>,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ability {
    /// Archetype the ability fires on, `None` for a bare `with entry`
    pub trigger: Option<String>,
    /// `entry` or `exit`
    pub event: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    /// Receiver parameter excluded
    pub params: Vec<Param>,
    pub returns: Option<Expr>,
    pub body: Vec<Stmt>,
    pub ability: Option<Ability>,
    pub is_static: bool,
    pub loc: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchetypeKind {
    Class,
    Obj,
    Node,
    Edge,
    Walker,
}

impl ArchetypeKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            ArchetypeKind::Class => "class",
            ArchetypeKind::Obj => "obj",
            ArchetypeKind::Node => "node",
            ArchetypeKind::Edge => "edge",
            ArchetypeKind::Walker => "walker",
        }
    }

    /// Marker base class used when the archetype is lowered to a plain class
    pub fn marker_base(&self) -> Option<&'static str> {
        match self {
            ArchetypeKind::Node => Some("Node"),
            ArchetypeKind::Edge => Some("Edge"),
            ArchetypeKind::Walker => Some("Walker"),
            ArchetypeKind::Class | ArchetypeKind::Obj => None,
        }
    }

    /// Name the visited/visiting archetype is bound to inside an ability
    pub fn ability_subject(&self) -> &'static str {
        match self {
            ArchetypeKind::Walker => "here",
            _ => "visitor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub annotation: Option<Expr>,
    pub default: Option<Expr>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archetype {
    pub kind: ArchetypeKind,
    pub name: String,
    pub bases: Vec<String>,
    pub fields: Vec<Field>,
    pub methods: Vec<Function>,
    /// Members the frontend kept but could not classify
    pub other: Vec<Stmt>,
}

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "in", "is", "if", "else", "return", "lambda", "yield", "await", "for",
    "with", "import", "from", "as", "elif", "while", "del", "assert", "raise", "visit", "report",
    "spawn",
];

fn is_opening(text: &str) -> bool {
    matches!(text, "(" | "[" | "{")
}

fn is_closing(text: &str) -> bool {
    matches!(text, ")" | "]" | "}")
}

/// Render a token sequence as source text, asking `map` for the target
/// spelling of each token.
pub fn render(tokens: &[Token], map: &dyn Fn(&Token) -> String) -> String {
    let mut out = String::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut prev: Option<(&Token, String)> = None;
    let mut before_prev: Option<&Token> = None;

    for token in tokens {
        let text = map(token);
        if let Some((p, p_text)) = &prev {
            if needs_space(p, p_text, before_prev, token, &text, stack.last().copied()) {
                out.push(' ');
            }
        }
        out.push_str(&text);

        if token.kind == TokenKind::Op {
            if is_opening(&token.text) {
                stack.push(match token.text.as_str() {
                    "(" => "(",
                    "[" => "[",
                    _ => "{",
                });
            } else if is_closing(&token.text) {
                stack.pop();
            }
        }
        before_prev = prev.as_ref().map(|(p, _)| *p);
        prev = Some((token, text));
    }
    out
}

fn is_unary_position(prev: Option<&Token>) -> bool {
    match prev {
        None => true,
        Some(t) if t.kind == TokenKind::Op => !is_closing(&t.text),
        Some(t) if t.kind == TokenKind::Name => KEYWORDS.contains(&t.text.as_str()),
        _ => false,
    }
}

fn needs_space(
    prev: &Token,
    prev_text: &str,
    before_prev: Option<&Token>,
    cur: &Token,
    cur_text: &str,
    enclosing: Option<&str>,
) -> bool {
    let word = |s: &str| s.chars().next().is_some_and(|c| c.is_alphanumeric() || c == '_');

    if prev.kind == TokenKind::Op {
        if is_opening(&prev.text) || prev.text == "." || prev.text == "~" || prev.text == "`" {
            return false;
        }
        if matches!(prev.text.as_str(), "-" | "+" | "*" | "**") && is_unary_position(before_prev)
        {
            return false;
        }
        if prev.text == "!" && !word(prev_text) {
            return false;
        }
        if prev.text == "=" && enclosing == Some("(") {
            return false;
        }
        if prev.text == ":" && enclosing == Some("[") {
            return false;
        }
    }
    if cur.kind == TokenKind::Op {
        if is_closing(&cur.text) || matches!(cur.text.as_str(), "," | "." | ";") {
            return false;
        }
        if cur.text == ":" {
            return false;
        }
        if cur.text == "=" && enclosing == Some("(") {
            return false;
        }
        if (cur.text == "(" || cur.text == "[")
            && (matches!(prev.kind, TokenKind::Name | TokenKind::Str)
                && !KEYWORDS.contains(&prev_text)
                || (prev.kind == TokenKind::Op && is_closing(&prev.text)))
        {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::lexer::{tokenize, Dialect};

    fn roundtrip(src: &str) -> String {
        let (tokens, _) = tokenize(src, Dialect::Braced);
        let tokens: Vec<Token> = tokens
            .into_iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .collect();
        render(&tokens, &|t| t.text.clone())
    }

    #[test]
    fn test_render_spacing() {
        assert_eq!(roundtrip("a+b*c"), "a + b * c");
        assert_eq!(roundtrip("print ( x , y )"), "print(x, y)");
        assert_eq!(roundtrip("f(a=1, *args, **kw)"), "f(a=1, *args, **kw)");
        assert_eq!(roundtrip("x[1:2].y"), "x[1:2].y");
        assert_eq!(roundtrip("{'a': 1, 'b': -2}"), "{'a': 1, 'b': -2}");
        assert_eq!(roundtrip("not (a and b)"), "not (a and b)");
        assert_eq!(roundtrip("x = -y"), "x = -y");
        assert_eq!(roundtrip("a - b"), "a - b");
    }
}
