//! Token cursor and the few grammar pieces both frontends share: parameter
//! lists and assignment statements.

use super::ir::{Expr, Location, Param};
use super::lexer::{Token, TokenKind};

const ASSIGN_OPS: &[&str] = &[
    "=", "+=", "-=", "*=", "/=", "//=", "%=", "**=", ">>=", "<<=", "&=", "|=", "^=", "@=",
];

pub(crate) fn is_opening(token: &Token) -> bool {
    token.kind == TokenKind::Op && matches!(token.text.as_str(), "(" | "[" | "{")
}

pub(crate) fn is_closing(token: &Token) -> bool {
    token.kind == TokenKind::Op && matches!(token.text.as_str(), ")" | "]" | "}")
}

pub(crate) struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
    last_line: usize,
}

impl Cursor {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if tokens.last().map(|t| t.kind) != Some(TokenKind::Eof) {
            let (line, column) = tokens.last().map(|t| (t.line, t.column)).unwrap_or((1, 1));
            tokens.push(Token {
                kind: TokenKind::Eof,
                text: String::new(),
                line,
                column,
            });
        }
        Self {
            tokens,
            pos: 0,
            last_line: 1,
        }
    }

    pub fn peek(&self) -> &Token {
        self.peek_nth(0)
    }

    pub fn peek_nth(&self, n: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + n).min(last)]
    }

    pub fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
            if !matches!(
                token.kind,
                TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent
            ) {
                self.last_line = token.line + token.text.matches('\n').count();
            }
        }
        token
    }

    pub fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    pub fn at_op(&self, op: &str) -> bool {
        self.peek().is_op(op)
    }

    pub fn at_name(&self, name: &str) -> bool {
        self.peek().is_name(name)
    }

    pub fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub fn eat_name(&mut self, name: &str) -> bool {
        if self.at_name(name) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Consume an identifier if one is next
    pub fn name(&mut self) -> Option<String> {
        if self.peek().kind == TokenKind::Name {
            Some(self.advance().text)
        } else {
            None
        }
    }

    /// `a.b.c`
    pub fn dotted_name(&mut self) -> Option<String> {
        let mut name = self.name()?;
        while self.at_op(".") && self.peek_nth(1).kind == TokenKind::Name {
            self.advance();
            name.push('.');
            name.push_str(&self.advance().text);
        }
        Some(name)
    }

    pub fn location(&self) -> Location {
        Location::of(self.peek())
    }

    /// Line of the last consumed token that carried source text
    pub fn last_line(&self) -> usize {
        self.last_line
    }

    /// Collect tokens up to (not including) the first one at bracket depth
    /// zero that satisfies `stop`. An unmatched closing bracket also stops.
    pub fn collect_until(&mut self, stop: impl Fn(&Token) -> bool) -> Vec<Token> {
        let mut out = Vec::new();
        let mut depth = 0usize;
        loop {
            let token = self.peek();
            if token.kind == TokenKind::Eof {
                break;
            }
            let opening = is_opening(token);
            let closing = is_closing(token);
            if depth == 0 && (closing || stop(token)) {
                break;
            }
            if opening {
                depth += 1;
            } else if closing {
                depth -= 1;
            }
            out.push(self.advance());
        }
        out
    }

    /// Skip a bracketed group starting at the current opening bracket
    pub fn skip_balanced(&mut self) {
        if !is_opening(self.peek()) {
            return;
        }
        let mut depth = 0usize;
        loop {
            let token = self.advance();
            if token.kind == TokenKind::Eof {
                return;
            }
            if is_opening(&token) {
                depth += 1;
            } else if is_closing(&token) {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return;
                }
            }
        }
    }
}

pub(crate) fn find_top_level(tokens: &[Token], pred: impl Fn(&Token) -> bool) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        if depth == 0 && pred(token) {
            return Some(i);
        }
        if is_opening(token) {
            depth += 1;
        } else if is_closing(token) {
            depth = depth.saturating_sub(1);
        }
    }
    None
}

/// Split on a separator at bracket depth zero. A trailing separator does not
/// produce an empty segment.
pub(crate) fn split_top_level(tokens: &[Token], sep: &str) -> Vec<Vec<Token>> {
    let mut parts = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0usize;
    for token in tokens {
        if depth == 0 && token.is_op(sep) {
            parts.push(std::mem::take(&mut current));
            continue;
        }
        if is_opening(token) {
            depth += 1;
        } else if is_closing(token) {
            depth = depth.saturating_sub(1);
        }
        current.push(token.clone());
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// `[*|**]name[: annotation][= default]`, or a bare `*` / `/` marker
pub(crate) fn parse_param(tokens: &[Token]) -> Option<Param> {
    let first = tokens.first()?;
    let (prefix, rest) = if first.is_op("*") || first.is_op("**") || first.is_op("/") {
        (first.text.clone(), &tokens[1..])
    } else {
        (String::new(), tokens)
    };
    let Some(name) = rest.first() else {
        return Some(Param {
            name: prefix,
            annotation: None,
            default: None,
        });
    };
    if name.kind != TokenKind::Name {
        return None;
    }
    let rest = &rest[1..];
    let eq = find_top_level(rest, |t| t.is_op("="));
    let (head, default) = match eq {
        Some(i) => (&rest[..i], Some(Expr::new(rest[i + 1..].to_vec()))),
        None => (rest, None),
    };
    let annotation = match head.first() {
        Some(colon) if colon.is_op(":") => Some(Expr::new(head[1..].to_vec())),
        _ => None,
    };
    Some(Param {
        name: format!("{}{}", prefix, name.text),
        annotation,
        default,
    })
}

pub(crate) enum Assignment {
    Expr(Expr),
    Assign {
        target: Expr,
        annotation: Option<Expr>,
        op: String,
        value: Option<Expr>,
    },
    Chained,
}

pub(crate) fn split_assignment(tokens: &[Token]) -> Assignment {
    let mut positions = Vec::new();
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        if is_opening(token) {
            depth += 1;
        } else if is_closing(token) {
            depth = depth.saturating_sub(1);
        } else if depth == 0
            && token.kind == TokenKind::Op
            && ASSIGN_OPS.contains(&token.text.as_str())
        {
            positions.push(i);
        }
    }

    let split_annotation = |head: &[Token]| -> (Expr, Option<Expr>) {
        match find_top_level(head, |t| t.is_op(":")) {
            Some(c) if c > 0 => (
                Expr::new(head[..c].to_vec()),
                Some(Expr::new(head[c + 1..].to_vec())),
            ),
            _ => (Expr::new(head.to_vec()), None),
        }
    };

    match positions.as_slice() {
        [] => match find_top_level(tokens, |t| t.is_op(":")) {
            Some(c) if c > 0 => {
                let (target, annotation) = split_annotation(tokens);
                Assignment::Assign {
                    target,
                    annotation,
                    op: "=".to_string(),
                    value: None,
                }
            }
            _ => Assignment::Expr(Expr::new(tokens.to_vec())),
        },
        [p] => {
            let (target, annotation) = split_annotation(&tokens[..*p]);
            Assignment::Assign {
                target,
                annotation,
                op: tokens[*p].text.clone(),
                value: Some(Expr::new(tokens[p + 1..].to_vec())),
            }
        }
        _ => Assignment::Chained,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::lexer::{tokenize, Dialect};

    fn tokens(src: &str) -> Vec<Token> {
        let (tokens, _) = tokenize(src, Dialect::Braced);
        tokens
            .into_iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .collect()
    }

    #[test]
    fn test_parse_param_forms() {
        let p = parse_param(&tokens("age: int = 0")).unwrap();
        assert_eq!(p.name, "age");
        assert!(p.annotation.is_some());
        assert!(p.default.is_some());

        let p = parse_param(&tokens("**kwargs")).unwrap();
        assert_eq!(p.name, "**kwargs");

        let p = parse_param(&tokens("*")).unwrap();
        assert_eq!(p.name, "*");
    }

    #[test]
    fn test_split_assignment() {
        match split_assignment(&tokens("x: dict[str, int] = {'a': 1}")) {
            Assignment::Assign {
                target,
                annotation,
                op,
                value,
            } => {
                assert_eq!(target.as_name(), Some("x"));
                assert!(annotation.is_some());
                assert_eq!(op, "=");
                assert!(value.is_some());
            }
            _ => panic!("expected assignment"),
        }
        assert!(matches!(
            split_assignment(&tokens("f(a=1)")),
            Assignment::Expr(_)
        ));
        assert!(matches!(
            split_assignment(&tokens("a = b = 1")),
            Assignment::Chained
        ));
    }

    #[test]
    fn test_split_top_level_ignores_nested_commas() {
        let parts = split_top_level(&tokens("a, f(b, c), [d, e],"), ",");
        assert_eq!(parts.len(), 3);
    }
}
