//! Graph-language frontend: brace-delimited parser and emitter for
//! node/edge/walker programs.

use super::ir::{
    render, Ability, Archetype, ArchetypeKind, Expr, Field, Function, Import, Location, Module,
    Param, Stmt, StmtKind,
};
use super::lexer::{tokenize, Dialect, Token, TokenKind};
use super::syntax::{parse_param, split_assignment, split_top_level, Assignment, Cursor};
use super::{source_lines, Diagnostics, LanguageFrontend};
use crate::types::Language;

pub struct GraphFrontend;

impl LanguageFrontend for GraphFrontend {
    fn language(&self) -> Language {
        Language::Graph
    }

    fn parse(&self, source: &str, diagnostics: &mut Diagnostics) -> Module {
        let (tokens, errors) = tokenize(source, Dialect::Braced);
        for error in errors {
            diagnostics.error(
                Location {
                    line: error.line,
                    column: error.column,
                },
                error.message,
            );
        }
        let mut parser = Parser {
            cur: Cursor::new(unescape_names(tokens)),
            source,
            diags: diagnostics,
        };
        Module {
            body: parser.module(),
        }
    }

    fn emit(&self, module: &Module, diagnostics: &mut Diagnostics) -> String {
        Emitter {
            out: String::new(),
            indent: 0,
            diags: diagnostics,
        }
        .module(module)
    }
}

/// Words reserved by the graph language that are ordinary identifiers in the
/// Python-like language. They are written with the `<>` escape.
const RESERVED: &[&str] = &[
    "node", "edge", "walker", "obj", "has", "can", "visit", "spawn", "report", "disengage",
    "entry", "exit", "glob", "test", "impl", "ignore", "skip", "by", "to", "include", "static",
    "priv", "pub", "protect", "abs",
];

const ARCHETYPE_KEYWORDS: &[(&str, ArchetypeKind)] = &[
    ("obj", ArchetypeKind::Obj),
    ("class", ArchetypeKind::Class),
    ("node", ArchetypeKind::Node),
    ("edge", ArchetypeKind::Edge),
    ("walker", ArchetypeKind::Walker),
];

fn archetype_kind(token: &Token) -> Option<ArchetypeKind> {
    if token.kind != TokenKind::Name {
        return None;
    }
    ARCHETYPE_KEYWORDS
        .iter()
        .find(|(kw, _)| *kw == token.text)
        .map(|(_, kind)| *kind)
}

/// Fold `<>name` escapes into plain identifier tokens
fn unescape_names(tokens: Vec<Token>) -> Vec<Token> {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        if token.is_op("<") {
            let escaped = match iter.peek() {
                Some(next) => next.is_op(">") && next.line == token.line && next.column == token.column + 1,
                None => false,
            };
            if escaped {
                iter.next();
                if let Some(mut name) = iter.next_if(|t| t.kind == TokenKind::Name) {
                    name.line = token.line;
                    name.column = token.column;
                    out.push(name);
                    continue;
                }
            }
        }
        out.push(token);
    }
    out
}

fn plain(tokens: &[Token]) -> String {
    render(tokens, &|t| t.text.clone())
}

fn ident(name: &str) -> String {
    let bare = name.trim_start_matches('*');
    if RESERVED.contains(&bare) {
        format!("{}<>{}", &name[..name.len() - bare.len()], bare)
    } else {
        name.to_string()
    }
}

fn graph_token(token: &Token) -> String {
    if token.kind == TokenKind::Name {
        ident(&token.text)
    } else {
        token.text.clone()
    }
}

fn graph_expr(expr: &Expr) -> String {
    render(&expr.tokens, &graph_token)
}

struct Parser<'a> {
    cur: Cursor,
    source: &'a str,
    diags: &'a mut Diagnostics,
}

impl<'a> Parser<'a> {
    fn module(&mut self) -> Vec<Stmt> {
        let mut body = Vec::new();
        while !self.cur.at_eof() {
            if self.cur.at_op("}") {
                let loc = self.cur.location();
                self.diags.error(loc, "unmatched '}'");
                self.cur.advance();
                continue;
            }
            body.extend(self.top_level());
        }
        body
    }

    fn expect_op(&mut self, op: &str) -> bool {
        if self.cur.eat_op(op) {
            return true;
        }
        let loc = self.cur.location();
        let found = if self.cur.at_eof() {
            "end of input".to_string()
        } else {
            format!("'{}'", self.cur.peek().text)
        };
        self.diags
            .error(loc, format!("expected '{}', found {}", op, found));
        false
    }

    fn expect_name(&mut self, what: &str) -> String {
        match self.cur.name() {
            Some(name) => name,
            None => {
                let loc = self.cur.location();
                self.diags.error(loc, format!("expected {}", what));
                String::new()
            }
        }
    }

    /// `:pub`, `:priv` and `:protect` after a declaration keyword
    fn skip_access(&mut self) {
        let next = self.cur.peek_nth(1);
        if self.cur.at_op(":")
            && next.kind == TokenKind::Name
            && matches!(next.text.as_str(), "pub" | "priv" | "protect")
        {
            self.cur.advance();
            self.cur.advance();
        }
    }

    /// Statement terminator; also accepted before a closing brace
    fn end_statement(&mut self) {
        if !self.cur.eat_op(";") && !self.cur.at_op("}") {
            self.expect_op(";");
        }
    }

    fn top_level(&mut self) -> Vec<Stmt> {
        let token = self.cur.peek().clone();
        let loc = Location::of(&token);
        if token.is_op(";") {
            self.cur.advance();
            return Vec::new();
        }
        if token.is_op("@") {
            self.decorator();
            return Vec::new();
        }
        if let Some(kind) = archetype_kind(&token) {
            return vec![self.archetype(kind)];
        }
        if self.at_inline_python() {
            return vec![self.inline_python()];
        }
        match token.text.as_str() {
            "import" if token.kind == TokenKind::Name => self.import(),
            "include" if token.kind == TokenKind::Name => {
                vec![self.unsupported_simple("include statements are not translated")]
            }
            "glob" if token.kind == TokenKind::Name => self.glob(),
            "def" | "can" if token.kind == TokenKind::Name => {
                let function = self.function(false);
                vec![Stmt::new(StmtKind::Function(function), loc)]
            }
            "with" if self.cur.peek_nth(1).is_name("entry") => {
                self.cur.advance();
                self.cur.advance();
                if self.cur.eat_op(":") {
                    self.cur.name();
                }
                let body = self.block();
                vec![Stmt::new(StmtKind::Entry(body), loc)]
            }
            "test" | "impl" | "enum" | "async"
                if token.kind == TokenKind::Name =>
            {
                let reason = format!("{} blocks are not translated", token.text);
                vec![self.unsupported_block(&reason, &[])]
            }
            _ => self.statement(),
        }
    }

    fn at_inline_python(&self) -> bool {
        self.cur.at_op("::")
            && self.cur.peek_nth(1).is_name("py")
            && self.cur.peek_nth(2).is_op("::")
    }

    /// `::py:: ... ::py::`, kept as a comment
    fn inline_python(&mut self) -> Stmt {
        let loc = self.cur.location();
        for _ in 0..3 {
            self.cur.advance();
        }
        while !self.cur.at_eof() && !self.at_inline_python() {
            self.cur.advance();
        }
        if self.at_inline_python() {
            for _ in 0..3 {
                self.cur.advance();
            }
        } else {
            self.diags.error(loc, "unterminated ::py:: block");
        }
        self.unsupported_at(loc, "inline Python blocks are not translated")
    }

    fn decorator(&mut self) {
        let loc = self.cur.location();
        self.cur.advance();
        let name = self.cur.dotted_name().unwrap_or_default();
        if self.cur.at_op("(") {
            self.cur.skip_balanced();
        }
        if name != "staticmethod" {
            self.diags
                .warning(loc, format!("decorator @{} is not translated", name));
        }
    }

    fn import(&mut self) -> Vec<Stmt> {
        let loc = self.cur.location();
        self.cur.advance();
        if self.cur.eat_op(":") {
            let lang = self.cur.name().unwrap_or_default();
            if lang == "jac" {
                self.diags.warning(
                    loc,
                    "graph-language module import is translated as a plain import",
                );
            }
        }

        if self.cur.eat_name("from") {
            let module = self.cur.dotted_name().unwrap_or_default();
            let names_tokens = if self.cur.eat_op("{") {
                let inner = self.cur.collect_until(|_| false);
                self.expect_op("}");
                inner
            } else {
                self.cur.eat_op(",");
                self.cur.collect_until(|t| t.is_op(";"))
            };
            self.end_statement();
            let names = split_top_level(&names_tokens, ",")
                .iter()
                .filter_map(|part| {
                    let name = part.first()?.text.clone();
                    let alias = part
                        .iter()
                        .position(|t| t.is_name("as"))
                        .and_then(|i| part.get(i + 1))
                        .map(|t| t.text.clone());
                    Some((name, alias))
                })
                .collect();
            return vec![Stmt::new(
                StmtKind::Import(Import {
                    module,
                    names,
                    alias: None,
                }),
                loc,
            )];
        }

        let tokens = self.cur.collect_until(|t| t.is_op(";"));
        self.end_statement();
        split_top_level(&tokens, ",")
            .iter()
            .map(|part| {
                let (module, alias) = match part.iter().position(|t| t.is_name("as")) {
                    Some(i) => (
                        part[..i].iter().map(|t| t.text.as_str()).collect(),
                        part.get(i + 1).map(|t| t.text.clone()),
                    ),
                    None => (part.iter().map(|t| t.text.as_str()).collect(), None),
                };
                Stmt::new(
                    StmtKind::Import(Import {
                        module,
                        names: Vec::new(),
                        alias,
                    }),
                    loc,
                )
            })
            .collect()
    }

    /// `glob a = 1, b: int = 2;`
    fn glob(&mut self) -> Vec<Stmt> {
        self.cur.advance();
        let tokens = self.cur.collect_until(|t| t.is_op(";"));
        self.end_statement();
        split_top_level(&tokens, ",")
            .iter()
            .filter_map(|part| {
                let loc = part.first().map(Location::of)?;
                match split_assignment(part) {
                    Assignment::Assign {
                        target,
                        annotation,
                        op,
                        value,
                    } => Some(Stmt::new(
                        StmtKind::Assign {
                            target,
                            annotation,
                            op,
                            value,
                        },
                        loc,
                    )),
                    _ => None,
                }
            })
            .collect()
    }

    fn archetype(&mut self, kind: ArchetypeKind) -> Stmt {
        let loc = self.cur.location();
        self.cur.advance();
        self.skip_access();
        let name = self.expect_name("an archetype name");

        let mut bases = Vec::new();
        if self.cur.eat_op("(") {
            let inner = self.cur.collect_until(|_| false);
            self.expect_op(")");
            bases = split_top_level(&inner, ",").iter().map(|b| plain(b)).collect();
        } else if self.cur.eat_op(":") {
            let inner = self.cur.collect_until(|t| t.is_op(":") || t.is_op("{"));
            self.cur.eat_op(":");
            bases = split_top_level(&inner, ",").iter().map(|b| plain(b)).collect();
        }

        let mut archetype = Archetype {
            kind,
            name,
            bases,
            fields: Vec::new(),
            methods: Vec::new(),
            other: Vec::new(),
        };
        if self.cur.eat_op(";") {
            return Stmt::new(StmtKind::Archetype(archetype), loc);
        }
        if !self.expect_op("{") {
            return Stmt::new(StmtKind::Archetype(archetype), loc);
        }

        loop {
            if self.cur.eat_op("}") {
                break;
            }
            if self.cur.at_eof() {
                let loc = self.cur.location();
                self.diags
                    .error(loc, format!("expected '}}' to close {}", archetype.name));
                break;
            }
            self.member(&mut archetype);
        }
        Stmt::new(StmtKind::Archetype(archetype), loc)
    }

    fn member(&mut self, archetype: &mut Archetype) {
        let token = self.cur.peek().clone();
        let loc = Location::of(&token);
        if token.is_op(";") {
            self.cur.advance();
            return;
        }
        if token.is_op("@") {
            self.decorator();
            return;
        }
        let is_static = self.cur.eat_name("static");
        let token = self.cur.peek().clone();
        if token.is_name("has") {
            if is_static {
                self.diags
                    .warning(loc, "static fields are translated as instance fields");
            }
            self.fields(archetype);
        } else if token.is_name("def") || token.is_name("can") {
            let function = self.function(is_static);
            archetype.methods.push(function);
        } else if let Some(kind) = archetype_kind(&token) {
            let nested = self.archetype(kind);
            archetype.other.push(nested);
        } else {
            let stmts = self.statement();
            for stmt in &stmts {
                self.diags.warning(
                    stmt.loc,
                    "statement inside an archetype body is not translated",
                );
            }
            archetype.other.extend(stmts.into_iter().map(|stmt| {
                let text = source_lines(self.source, stmt.loc.line, stmt.loc.line);
                Stmt::new(
                    StmtKind::Unsupported {
                        text,
                        reason: "statement inside an archetype body".to_string(),
                    },
                    stmt.loc,
                )
            }));
        }
    }

    /// `has a: int = 0, b: str;`
    fn fields(&mut self, archetype: &mut Archetype) {
        self.cur.advance();
        self.skip_access();
        let tokens = self.cur.collect_until(|t| t.is_op(";"));
        self.end_statement();
        for part in split_top_level(&tokens, ",") {
            let Some(first) = part.first() else { continue };
            let loc = Location::of(first);
            if first.kind != TokenKind::Name {
                self.diags.error(loc, "expected a field name");
                continue;
            }
            let Some(param) = parse_param(&part) else {
                self.diags.error(loc, "malformed field declaration");
                continue;
            };
            if param.annotation.is_none() {
                self.diags
                    .error(loc, format!("field {} needs a type annotation", param.name));
            }
            if param
                .default
                .as_ref()
                .is_some_and(|d| d.contains_name("postinit"))
            {
                self.diags.warning(
                    loc,
                    format!("post-init field {} is translated without a default", param.name),
                );
                archetype.fields.push(Field {
                    name: param.name,
                    annotation: param.annotation,
                    default: None,
                    loc,
                });
                continue;
            }
            archetype.fields.push(Field {
                name: param.name,
                annotation: param.annotation,
                default: param.default,
                loc,
            });
        }
    }

    /// `def name(params) -> T { ... }`, `can name(params) { ... }` or
    /// `can name with Trigger entry { ... }`
    fn function(&mut self, is_static: bool) -> Function {
        let loc = self.cur.location();
        self.cur.advance();
        self.skip_access();
        let name = self.expect_name("a function name");

        let mut params: Vec<Param> = Vec::new();
        let mut ability = None;
        if self.cur.eat_name("with") {
            let trigger = self
                .cur
                .collect_until(|t| t.is_name("entry") || t.is_name("exit") || t.is_op("{"));
            let event = match self.cur.name() {
                Some(event) => event,
                None => {
                    let loc = self.cur.location();
                    self.diags.error(loc, "expected 'entry' or 'exit'");
                    "entry".to_string()
                }
            };
            ability = Some(Ability {
                trigger: (!trigger.is_empty()).then(|| plain(&trigger)),
                event,
            });
        } else if self.cur.eat_op("(") {
            let inner = self.cur.collect_until(|_| false);
            self.expect_op(")");
            params = split_top_level(&inner, ",")
                .iter()
                .filter_map(|p| parse_param(p))
                .collect();
            if params.first().is_some_and(|p| p.name == "self") {
                params.remove(0);
            }
        }

        let returns = if self.cur.eat_op("->") {
            Some(Expr::new(
                self.cur.collect_until(|t| t.is_op("{") || t.is_op(";")),
            ))
        } else {
            None
        };

        let body = if self.cur.eat_op(";") {
            self.diags.warning(
                loc,
                format!("declaration of {} without a body is translated as empty", name),
            );
            Vec::new()
        } else {
            self.block()
        };

        Function {
            name,
            params,
            returns,
            body,
            ability,
            is_static,
            loc,
        }
    }

    /// `{ statements }`
    fn block(&mut self) -> Vec<Stmt> {
        let mut body = Vec::new();
        if !self.expect_op("{") {
            return body;
        }
        loop {
            if self.cur.eat_op("}") {
                break;
            }
            if self.cur.at_eof() {
                let loc = self.cur.location();
                self.diags.error(loc, "expected '}' before end of input");
                break;
            }
            body.extend(self.statement());
        }
        body
    }

    fn unsupported_simple(&mut self, reason: &str) -> Stmt {
        let loc = self.cur.location();
        self.cur.collect_until(|t| t.is_op(";"));
        self.end_statement();
        self.unsupported_at(loc, reason)
    }

    /// Header up to `{`, the block and any `continuations` (`else`, ...)
    fn unsupported_block(&mut self, reason: &str, continuations: &[&str]) -> Stmt {
        let loc = self.cur.location();
        loop {
            self.cur.collect_until(|t| t.is_op("{") || t.is_op(";"));
            if self.cur.at_op("{") {
                self.cur.skip_balanced();
            } else {
                self.cur.eat_op(";");
            }
            if !continuations.iter().any(|c| self.cur.at_name(c)) {
                break;
            }
        }
        self.unsupported_at(loc, reason)
    }

    fn unsupported_at(&mut self, loc: Location, reason: &str) -> Stmt {
        let text = source_lines(self.source, loc.line, self.cur.last_line().max(loc.line));
        self.diags.warning(loc, reason);
        Stmt::new(
            StmtKind::Unsupported {
                text,
                reason: reason.to_string(),
            },
            loc,
        )
    }

    fn condition(&mut self) -> Expr {
        Expr::new(self.cur.collect_until(|t| t.is_op("{") || t.is_op(";")))
    }

    fn statement(&mut self) -> Vec<Stmt> {
        let token = self.cur.peek().clone();
        let loc = Location::of(&token);
        if token.is_op(";") {
            self.cur.advance();
            return Vec::new();
        }
        if token.is_op("{") {
            self.diags.error(loc, "unexpected '{'");
            self.cur.skip_balanced();
            return Vec::new();
        }
        if let Some(kind) = archetype_kind(&token) {
            if self.cur.peek_nth(1).kind == TokenKind::Name {
                return vec![self.archetype(kind)];
            }
        }

        let kind = match (token.kind, token.text.as_str()) {
            (TokenKind::Name, "if") => {
                self.cur.advance();
                let cond = self.condition();
                let body = self.block();
                let mut branches = vec![(cond, body)];
                let mut orelse = None;
                loop {
                    if self.cur.eat_name("elif") {
                        let cond = self.condition();
                        let body = self.block();
                        branches.push((cond, body));
                    } else if self.cur.eat_name("else") {
                        if self.cur.eat_name("if") {
                            let cond = self.condition();
                            let body = self.block();
                            branches.push((cond, body));
                        } else {
                            orelse = Some(self.block());
                            break;
                        }
                    } else {
                        break;
                    }
                }
                StmtKind::If { branches, orelse }
            }
            (TokenKind::Name, "while") => {
                self.cur.advance();
                let cond = self.condition();
                let body = self.block();
                StmtKind::While { cond, body }
            }
            (TokenKind::Name, "for") => {
                let is_counted = {
                    let mut n = 1;
                    loop {
                        let t = self.cur.peek_nth(n);
                        if t.is_name("in") || t.is_op("{") || t.kind == TokenKind::Eof {
                            break false;
                        }
                        if t.is_op("=") {
                            break true;
                        }
                        n += 1;
                    }
                };
                if is_counted {
                    return vec![
                        self.unsupported_block("counted for loops are not translated", &[])
                    ];
                }
                self.cur.advance();
                let target = Expr::new(
                    self.cur
                        .collect_until(|t| t.is_name("in") || t.is_op("{")),
                );
                if !self.cur.eat_name("in") {
                    self.expect_op("in");
                }
                let iter = self.condition();
                let body = self.block();
                StmtKind::For { target, iter, body }
            }
            (TokenKind::Name, "return") => {
                self.cur.advance();
                let value = self.cur.collect_until(|t| t.is_op(";"));
                self.end_statement();
                StmtKind::Return((!value.is_empty()).then(|| Expr::new(value)))
            }
            (TokenKind::Name, "raise") => {
                self.cur.advance();
                let value = self.cur.collect_until(|t| t.is_op(";"));
                self.end_statement();
                StmtKind::Raise((!value.is_empty()).then(|| Expr::new(value)))
            }
            (TokenKind::Name, "break") => {
                self.cur.advance();
                self.end_statement();
                StmtKind::Break
            }
            (TokenKind::Name, "continue") => {
                self.cur.advance();
                self.end_statement();
                StmtKind::Continue
            }
            (TokenKind::Name, "disengage") => {
                self.cur.advance();
                self.end_statement();
                StmtKind::Disengage
            }
            (TokenKind::Name, "report") => {
                self.cur.advance();
                let value = self.cur.collect_until(|t| t.is_op(";"));
                self.end_statement();
                StmtKind::Report(Expr::new(value))
            }
            (TokenKind::Name, "visit") => {
                self.cur.advance();
                let target = self
                    .cur
                    .collect_until(|t| t.is_op(";") || t.is_name("else"));
                if self.cur.at_name("else") {
                    let else_loc = self.cur.location();
                    self.cur.advance();
                    self.cur.skip_balanced();
                    self.diags
                        .warning(else_loc, "visit else clauses are not translated");
                } else {
                    self.end_statement();
                }
                StmtKind::Visit(Expr::new(target))
            }
            (TokenKind::Name, "try") => {
                return vec![self.unsupported_block(
                    "try/except blocks are not translated",
                    &["except", "else", "finally"],
                )]
            }
            (TokenKind::Name, "match" | "switch" | "async") => {
                let reason = format!("{} statements are not translated", token.text);
                return vec![self.unsupported_block(&reason, &[])];
            }
            (TokenKind::Name, "with") => {
                return vec![self.unsupported_block("context managers are not translated", &[])]
            }
            (TokenKind::Name, "def" | "can") => {
                let function = self.function(false);
                StmtKind::Function(function)
            }
            (TokenKind::Name, "del" | "assert" | "skip" | "ignore" | "glob" | "nonlocal") => {
                let reason = format!("{} statements are not translated", token.text);
                return vec![self.unsupported_simple(&reason)];
            }
            _ => {
                let tokens = self.cur.collect_until(|t| t.is_op(";"));
                if tokens.is_empty() {
                    // stray closing bracket or similar
                    let stray = self.cur.advance();
                    self.diags
                        .error(Location::of(&stray), format!("unexpected '{}'", stray.text));
                    return Vec::new();
                }
                self.end_statement();
                match split_assignment(&tokens) {
                    Assignment::Expr(e) => StmtKind::Expr(e),
                    Assignment::Assign {
                        target,
                        annotation,
                        op,
                        value,
                    } => StmtKind::Assign {
                        target,
                        annotation,
                        op,
                        value,
                    },
                    Assignment::Chained => {
                        let end = tokens.last().map(|t| t.line).unwrap_or(loc.line);
                        let reason = "chained assignment is not translated";
                        self.diags.warning(loc, reason);
                        StmtKind::Unsupported {
                            text: source_lines(self.source, loc.line, end),
                            reason: reason.to_string(),
                        }
                    }
                }
            }
        };
        vec![Stmt::new(kind, loc)]
    }
}

struct Emitter<'d> {
    out: String,
    indent: usize,
    diags: &'d mut Diagnostics,
}

fn is_declaration(stmt: &Stmt) -> bool {
    matches!(
        stmt.kind,
        StmtKind::Import(_) | StmtKind::Function(_) | StmtKind::Archetype(_)
    )
}

fn format_param(param: &Param) -> String {
    if param.name == "*" || param.name == "/" {
        return param.name.clone();
    }
    let annotation = param
        .annotation
        .as_ref()
        .map(graph_expr)
        .unwrap_or_else(|| "any".to_string());
    match &param.default {
        Some(default) => format!("{}: {} = {}", ident(&param.name), annotation, graph_expr(default)),
        None => format!("{}: {}", ident(&param.name), annotation),
    }
}

impl<'d> Emitter<'d> {
    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn blank_line(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }

    fn module(mut self, module: &Module) -> String {
        let mut pending: Vec<&Stmt> = Vec::new();
        let mut last_import = false;
        for stmt in &module.body {
            if let StmtKind::Entry(body) = &stmt.kind {
                pending.extend(body.iter());
                continue;
            }
            if !is_declaration(stmt) {
                pending.push(stmt);
                continue;
            }
            self.flush_entry(&mut pending);
            let is_import = matches!(stmt.kind, StmtKind::Import(_));
            if !(is_import && last_import) {
                self.blank_line();
            }
            self.stmt(stmt);
            last_import = is_import;
        }
        self.flush_entry(&mut pending);
        self.out
    }

    fn flush_entry(&mut self, pending: &mut Vec<&Stmt>) {
        if pending.is_empty() {
            return;
        }
        self.blank_line();
        self.line("with entry {");
        self.indent += 1;
        for stmt in pending.drain(..) {
            self.stmt(stmt);
        }
        self.indent -= 1;
        self.line("}");
    }

    fn block(&mut self, header: &str, body: &[Stmt]) {
        self.line(&format!("{} {{", header));
        self.indent += 1;
        for stmt in body {
            self.stmt(stmt);
        }
        self.indent -= 1;
        self.line("}");
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import(import) => {
                if import.names.is_empty() {
                    match &import.alias {
                        Some(alias) => self.line(&format!("import:py {} as {};", import.module, alias)),
                        None => self.line(&format!("import:py {};", import.module)),
                    }
                } else {
                    let names: Vec<String> = import
                        .names
                        .iter()
                        .map(|(name, alias)| match alias {
                            Some(alias) => format!("{} as {}", name, alias),
                            None => name.clone(),
                        })
                        .collect();
                    self.line(&format!(
                        "import:py from {} {{ {} }};",
                        import.module,
                        names.join(", ")
                    ));
                }
            }
            StmtKind::Function(function) => self.function(function),
            StmtKind::Archetype(archetype) => self.archetype(archetype),
            StmtKind::If { branches, orelse } => {
                for (i, (cond, body)) in branches.iter().enumerate() {
                    if i == 0 {
                        self.line(&format!("if {} {{", graph_expr(cond)));
                    } else {
                        self.line(&format!("}} elif {} {{", graph_expr(cond)));
                    }
                    self.indent += 1;
                    for stmt in body {
                        self.stmt(stmt);
                    }
                    self.indent -= 1;
                }
                if let Some(body) = orelse {
                    self.line("} else {");
                    self.indent += 1;
                    for stmt in body {
                        self.stmt(stmt);
                    }
                    self.indent -= 1;
                }
                self.line("}");
            }
            StmtKind::While { cond, body } => {
                self.block(&format!("while {}", graph_expr(cond)), body)
            }
            StmtKind::For { target, iter, body } => self.block(
                &format!("for {} in {}", graph_expr(target), graph_expr(iter)),
                body,
            ),
            StmtKind::Return(value) => match value {
                Some(v) => self.line(&format!("return {};", graph_expr(v))),
                None => self.line("return;"),
            },
            StmtKind::Raise(value) => match value {
                Some(v) => self.line(&format!("raise {};", graph_expr(v))),
                None => self.line("raise;"),
            },
            StmtKind::Assign {
                target,
                annotation,
                op,
                value,
            } => {
                let mut text = graph_expr(target);
                if let Some(annotation) = annotation {
                    text.push_str(&format!(": {}", graph_expr(annotation)));
                }
                if let Some(value) = value {
                    text.push_str(&format!(" {} {}", op, graph_expr(value)));
                }
                text.push(';');
                self.line(&text);
            }
            StmtKind::Expr(expr) => self.line(&format!("{};", graph_expr(expr))),
            StmtKind::Pass => {}
            StmtKind::Break => self.line("break;"),
            StmtKind::Continue => self.line("continue;"),
            StmtKind::Entry(body) => {
                for stmt in body {
                    self.stmt(stmt);
                }
            }
            StmtKind::Visit(expr) => self.line(&format!("visit {};", graph_expr(expr))),
            StmtKind::Report(expr) => self.line(&format!("report {};", graph_expr(expr))),
            StmtKind::Disengage => self.line("disengage;"),
            StmtKind::Unsupported { text, .. } => {
                for line in text.lines() {
                    self.line(format!("# {}", line).trim_end());
                }
            }
        }
    }

    fn function(&mut self, function: &Function) {
        let prefix = if function.is_static { "static " } else { "" };
        let header = match &function.ability {
            Some(ability) => {
                let trigger = match ability.trigger.as_deref() {
                    Some("root") => "`root ".to_string(),
                    Some(trigger) => format!("{} ", trigger),
                    None => String::new(),
                };
                format!(
                    "{}can {} with {}{}",
                    prefix,
                    ident(&function.name),
                    trigger,
                    ability.event
                )
            }
            None => {
                let mut params = Vec::new();
                for param in &function.params {
                    if param.name == "*" || param.name == "/" {
                        self.diags.warning(
                            function.loc,
                            format!(
                                "parameter marker {} in {} is not translated",
                                param.name, function.name
                            ),
                        );
                        continue;
                    }
                    params.push(format_param(param));
                }
                let mut header = format!(
                    "{}def {}({})",
                    prefix,
                    ident(&function.name),
                    params.join(", ")
                );
                if let Some(returns) = &function.returns {
                    header.push_str(&format!(" -> {}", graph_expr(returns)));
                }
                header
            }
        };
        self.block(&header, &function.body);
    }

    fn archetype(&mut self, archetype: &Archetype) {
        let mut header = format!("{} {}", archetype.kind.keyword(), ident(&archetype.name));
        if !archetype.bases.is_empty() {
            header.push_str(&format!("({})", archetype.bases.join(", ")));
        }
        self.line(&format!("{} {{", header));
        self.indent += 1;
        for field in &archetype.fields {
            let annotation = field
                .annotation
                .as_ref()
                .map(graph_expr)
                .unwrap_or_else(|| "any".to_string());
            let line = match &field.default {
                Some(default) => format!(
                    "has {}: {} = {};",
                    ident(&field.name),
                    annotation,
                    graph_expr(default)
                ),
                None => format!("has {}: {};", ident(&field.name), annotation),
            };
            self.line(&line);
        }
        for (i, method) in archetype.methods.iter().enumerate() {
            if i > 0 || !archetype.fields.is_empty() {
                self.blank_line();
            }
            self.function(method);
        }
        for stmt in &archetype.other {
            match &stmt.kind {
                StmtKind::Unsupported { .. } | StmtKind::Archetype(_) => self.stmt(stmt),
                _ => {
                    self.diags.warning(
                        stmt.loc,
                        "class-level statement has no graph-language equivalent",
                    );
                    let mut nested = Emitter {
                        out: String::new(),
                        indent: 0,
                        diags: &mut *self.diags,
                    };
                    nested.stmt(stmt);
                    let text = nested.out;
                    for line in text.lines() {
                        self.line(format!("# {}", line).trim_end());
                    }
                }
            }
        }
        self.indent -= 1;
        self.line("}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> (Module, Diagnostics) {
        let mut diags = Diagnostics::new();
        let module = GraphFrontend.parse(source, &mut diags);
        (module, diags)
    }

    #[test]
    fn test_parse_walker_with_graph_statements() {
        let source = r#"
walker Visitor {
    has count: int = 0;

    can start with `root entry {
        visit [-->];
    }

    can count_city with City entry {
        self.count += 1;
        report here.name;
        if self.count > 3 {
            disengage;
        }
    }
}

with entry {
    root spawn Visitor();
}
"#;
        let (module, diags) = parse(source);
        assert!(diags.is_empty(), "{:?}", diags.into_vec());
        assert_eq!(module.body.len(), 2);
        match &module.body[0].kind {
            StmtKind::Archetype(a) => {
                assert_eq!(a.kind, ArchetypeKind::Walker);
                assert_eq!(a.fields.len(), 1);
                assert_eq!(a.methods.len(), 2);
                let start = a.methods[0].ability.as_ref().unwrap();
                assert_eq!(start.trigger.as_deref(), Some("`root"));
                assert!(matches!(a.methods[0].body[0].kind, StmtKind::Visit(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(module.body[1].kind, StmtKind::Entry(_)));
    }

    #[test]
    fn test_graph_operations_are_flagged_for_python() {
        let source = "walker W {\n    can go with `root entry {\n        visit [-->];\n    }\n}\nwith entry {\n    root spawn W();\n}\n";
        let mut diags = Diagnostics::new();
        let module = GraphFrontend.parse(source, &mut diags);
        let code = super::super::PythonFrontend.emit(&module, &mut diags);
        let warnings = diags.into_vec();
        assert_eq!(warnings.len(), 2, "{:?}", warnings);
        assert!(code.contains("# visit [-->]"));
        assert!(code.contains("# root spawn W()"));
        assert!(code.contains("def go(self, here: \"root\"):"));
    }

    #[test]
    fn test_imports_and_escaped_names() {
        let source = "import:py math;\nimport:py from random { randint, choice as pick };\nglob <>node = 1;\n";
        let (module, diags) = parse(source);
        assert!(diags.is_empty());
        assert_eq!(module.body.len(), 3);
        match &module.body[1].kind {
            StmtKind::Import(import) => {
                assert_eq!(import.module, "random");
                assert_eq!(import.names[1], ("choice".to_string(), Some("pick".to_string())));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &module.body[2].kind {
            StmtKind::Assign { target, .. } => assert_eq!(target.as_name(), Some("node")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reserved_words_are_escaped_on_emit() {
        let mut diags = Diagnostics::new();
        let module = super::super::PythonFrontend.parse("edge = 3\nprint(edge)\n", &mut diags);
        let code = GraphFrontend.emit(&module, &mut diags);
        assert!(code.contains("<>edge = 3;"));
        assert!(code.contains("print(<>edge);"));
    }

    #[test]
    fn test_if_elif_else_layout() {
        let mut diags = Diagnostics::new();
        let module = super::super::PythonFrontend.parse(
            "if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n",
            &mut diags,
        );
        let code = GraphFrontend.emit(&module, &mut diags);
        assert!(code.contains("    if a {\n        x = 1;\n    } elif b {\n        x = 2;\n    } else {\n        x = 3;\n    }\n"));
    }

    #[test]
    fn test_inline_python_is_kept_as_comment() {
        let source = "::py::\nimport math\nprint(math.pi)\n::py::\nwith entry {\n    print(2);\n}\n";
        let (module, diags) = parse(source);
        assert!(!diags.has_errors());
        assert_eq!(diags.len(), 1);
        assert_eq!(module.body.len(), 2);
        match &module.body[0].kind {
            StmtKind::Unsupported { text, .. } => assert!(text.contains("print(math.pi)")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(module.body[1].kind, StmtKind::Entry(_)));
    }

    #[test]
    fn test_unclosed_block_is_an_error() {
        let (module, diags) = parse("with entry {\n    x = 1;\n");
        assert!(diags.has_errors());
        assert_eq!(module.body.len(), 1);
    }
}
