//! Tokenizer shared by the security analyzer and the translator.
//!
//! Two dialects are supported. `Indented` follows the Python-like layout rules
//! and produces `Newline`/`Indent`/`Dedent` tokens; `Braced` ignores layout
//! entirely and treats `#* ... *#` as a block comment.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Indented,
    Braced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Number,
    Str,
    Op,
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text == op
    }

    pub fn is_name(&self, name: &str) -> bool {
        self.kind == TokenKind::Name && self.text == name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

const OPS_3: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "-->", "<--", "++>", "<++",
];
const OPS_2: &[&str] = &[
    "**", "//", "==", "!=", "<=", ">=", "->", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=",
    "&&", "||", ":=", "<<", ">>", "::", "@=",
];
const OPS_1: &str = "+-*/%<>=!&|^~()[]{},:;.@`?";

const STRING_PREFIXES: &[&str] = &["r", "b", "u", "f", "rb", "br", "fr", "rf"];

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    dialect: Dialect,
    depth: usize,
    indents: Vec<usize>,
    at_line_start: bool,
    tokens: Vec<Token>,
    errors: Vec<LexError>,
}

/// Tokenize `source`. Lexing never stops at the first problem; malformed input
/// is reported through the returned error list.
pub fn tokenize(source: &str, dialect: Dialect) -> (Vec<Token>, Vec<LexError>) {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        column: 1,
        dialect,
        depth: 0,
        indents: vec![0],
        at_line_start: true,
        tokens: Vec::new(),
        errors: Vec::new(),
    };
    lexer.run();
    (lexer.tokens, lexer.errors)
}

impl Lexer {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, text: String, line: usize, column: usize) {
        self.tokens.push(Token {
            kind,
            text,
            line,
            column,
        });
    }

    fn error(&mut self, message: impl Into<String>, line: usize, column: usize) {
        self.errors.push(LexError {
            message: message.into(),
            line,
            column,
        });
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| t.kind),
            None | Some(TokenKind::Newline) | Some(TokenKind::Indent) | Some(TokenKind::Dedent)
        )
    }

    fn run(&mut self) {
        while self.pos < self.chars.len() {
            if self.dialect == Dialect::Indented && self.at_line_start && self.depth == 0 {
                if !self.handle_indentation() {
                    continue;
                }
            }
            let Some(c) = self.peek(0) else { break };
            match c {
                '\n' => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    if self.dialect == Dialect::Indented && self.depth == 0 {
                        if !self.last_is_newline() {
                            self.push(TokenKind::Newline, "\n".to_string(), line, column);
                        }
                        self.at_line_start = true;
                    }
                }
                ' ' | '\t' | '\r' | '\x0c' => {
                    self.bump();
                }
                '\\' if self.peek(1) == Some('\n') => {
                    self.bump();
                    self.bump();
                }
                '\\' if self.peek(1) == Some('\r') && self.peek(2) == Some('\n') => {
                    self.bump();
                    self.bump();
                    self.bump();
                }
                '#' => self.comment(),
                '\'' | '"' => self.string(String::new()),
                c if c.is_ascii_digit() => self.number(),
                '.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => self.number(),
                c if c == '_' || c.is_alphabetic() => self.name(),
                _ => self.operator(),
            }
        }

        if self.dialect == Dialect::Indented {
            if !self.last_is_newline() {
                self.push(TokenKind::Newline, "\n".to_string(), self.line, self.column);
            }
            while self.indents.len() > 1 {
                self.indents.pop();
                self.push(TokenKind::Dedent, String::new(), self.line, 1);
            }
        }
        if self.depth > 0 {
            self.error("unclosed bracket at end of input", self.line, self.column);
        }
        self.push(TokenKind::Eof, String::new(), self.line, self.column);
    }

    /// Measure leading whitespace of a logical line. Returns false when the
    /// line was blank or comment-only and has been consumed.
    fn handle_indentation(&mut self) -> bool {
        let mut width = 0usize;
        let mut offset = 0usize;
        while let Some(c) = self.peek(offset) {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0c' | '\r' => {}
                _ => break,
            }
            offset += 1;
        }
        match self.peek(offset) {
            None | Some('\n') | Some('#') => {
                for _ in 0..offset {
                    self.bump();
                }
                if self.peek(0) == Some('#') {
                    self.comment();
                }
                if self.peek(0) == Some('\n') {
                    self.bump();
                }
                return false;
            }
            _ => {}
        }
        for _ in 0..offset {
            self.bump();
        }
        self.at_line_start = false;

        let current = *self.indents.last().unwrap_or(&0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent, String::new(), self.line, 1);
        } else if width < current {
            while self.indents.len() > 1 && width < *self.indents.last().unwrap_or(&0) {
                self.indents.pop();
                self.push(TokenKind::Dedent, String::new(), self.line, 1);
            }
            if width != *self.indents.last().unwrap_or(&0) {
                self.error(
                    "unindent does not match any outer indentation level",
                    self.line,
                    1,
                );
                self.indents.push(width);
            }
        }
        true
    }

    fn comment(&mut self) {
        if self.dialect == Dialect::Braced && self.peek(1) == Some('*') {
            let (line, column) = (self.line, self.column);
            self.bump();
            self.bump();
            loop {
                match self.peek(0) {
                    None => {
                        self.error("unterminated block comment", line, column);
                        return;
                    }
                    Some('*') if self.peek(1) == Some('#') => {
                        self.bump();
                        self.bump();
                        return;
                    }
                    Some(_) => {
                        self.bump();
                    }
                }
            }
        }
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn name(&mut self) {
        let (line, column) = (self.line, self.column);
        let mut text = String::new();
        while let Some(c) = self.peek(0) {
            if c == '_' || c.is_alphanumeric() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if matches!(self.peek(0), Some('\'') | Some('"'))
            && STRING_PREFIXES.contains(&text.to_ascii_lowercase().as_str())
        {
            self.string(text);
            return;
        }
        self.push(TokenKind::Name, text, line, column);
    }

    fn number(&mut self) {
        let (line, column) = (self.line, self.column);
        let mut text = String::new();
        while let Some(c) = self.peek(0) {
            let exponent_sign = (c == '+' || c == '-')
                && matches!(text.chars().last(), Some('e') | Some('E'))
                && !text.starts_with("0x")
                && !text.starts_with("0X")
                && self.peek(1).is_some_and(|n| n.is_ascii_digit());
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        self.push(TokenKind::Number, text, line, column);
    }

    fn string(&mut self, prefix: String) {
        let (line, column) = (self.line, self.column.saturating_sub(prefix.chars().count()));
        let mut text = prefix;
        let Some(quote) = self.bump() else { return };
        text.push(quote);
        let triple = self.peek(0) == Some(quote) && self.peek(1) == Some(quote);
        if triple {
            text.push(quote);
            text.push(quote);
            self.bump();
            self.bump();
        }
        loop {
            let Some(c) = self.peek(0) else {
                self.error("unterminated string literal", line, column);
                break;
            };
            if c == '\\' {
                text.push(c);
                self.bump();
                if let Some(next) = self.bump() {
                    text.push(next);
                }
                continue;
            }
            if c == '\n' && !triple {
                self.error("unterminated string literal", line, column);
                break;
            }
            if c == quote {
                if !triple {
                    text.push(c);
                    self.bump();
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    for _ in 0..3 {
                        text.push(quote);
                        self.bump();
                    }
                    break;
                }
            }
            text.push(c);
            self.bump();
        }
        self.push(TokenKind::Str, text, line, column);
    }

    fn operator(&mut self) {
        let (line, column) = (self.line, self.column);
        for table in [OPS_3, OPS_2] {
            for op in table {
                let len = op.chars().count();
                let matches = op
                    .chars()
                    .enumerate()
                    .all(|(i, ch)| self.peek(i) == Some(ch));
                if matches {
                    for _ in 0..len {
                        self.bump();
                    }
                    self.push(TokenKind::Op, op.to_string(), line, column);
                    return;
                }
            }
        }
        let Some(c) = self.bump() else { return };
        if OPS_1.contains(c) {
            match c {
                '(' | '[' | '{' => self.depth += 1,
                ')' | ']' | '}' => {
                    if self.depth == 0 {
                        if self.dialect == Dialect::Indented {
                            self.error(format!("unmatched '{}'", c), line, column);
                        }
                    } else {
                        self.depth -= 1;
                    }
                }
                _ => {}
            }
            // Braces delimit blocks in the braced dialect, so they never
            // suppress layout there (layout is ignored anyway).
            if self.dialect == Dialect::Braced {
                self.depth = 0;
            }
            self.push(TokenKind::Op, c.to_string(), line, column);
        } else {
            self.error(format!("unexpected character '{}'", c), line, column);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_indentation_tokens() {
        let (tokens, errors) = tokenize("if x:\n    y = 1\nz\n", Dialect::Indented);
        assert!(errors.is_empty());
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Name,
                TokenKind::Name,
                TokenKind::Op,
                TokenKind::Newline,
                TokenKind::Indent,
                TokenKind::Name,
                TokenKind::Op,
                TokenKind::Number,
                TokenKind::Newline,
                TokenKind::Dedent,
                TokenKind::Name,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_brackets_suppress_newlines() {
        let (tokens, errors) = tokenize("f(1,\n  2)\n", Dialect::Indented);
        assert!(errors.is_empty());
        let newlines = tokens.iter().filter(|t| t.kind == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
        assert!(!tokens.iter().any(|t| t.kind == TokenKind::Indent));
    }

    #[test]
    fn test_strings_hide_keywords() {
        let (tokens, errors) = tokenize("s = 'import os'\nt = f\"{x}\"\n", Dialect::Indented);
        assert!(errors.is_empty());
        assert!(!tokens.iter().any(|t| t.is_name("import")));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Str && t.text == "f\"{x}\""));
    }

    #[test]
    fn test_triple_quoted_string_spans_lines() {
        let (tokens, errors) = tokenize("s = \"\"\"a\nimport os\n\"\"\"\n", Dialect::Indented);
        assert!(errors.is_empty());
        assert!(!tokens.iter().any(|t| t.is_name("os")));
    }

    #[test]
    fn test_braced_dialect_comments_and_edges() {
        let source = "#* block\n comment *#\nwalker W { can go with entry { visit [-->]; } }";
        let (tokens, errors) = tokenize(source, Dialect::Braced);
        assert!(errors.is_empty());
        assert!(!tokens.iter().any(|t| t.kind == TokenKind::Newline));
        assert!(tokens.iter().any(|t| t.is_op("-->")));
        assert_eq!(tokens.first().map(|t| t.text.as_str()), Some("walker"));
    }

    #[test]
    fn test_bad_dedent_is_reported() {
        let (_, errors) = tokenize("if x:\n        a\n    b\n", Dialect::Indented);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 3);
    }

    #[test]
    fn test_unterminated_string_is_reported() {
        let (_, errors) = tokenize("x = 'abc\n", Dialect::Indented);
        assert!(errors.iter().any(|e| e.message.contains("unterminated")));
    }
}
