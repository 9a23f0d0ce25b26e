//! Python-like frontend: indentation-based parser and emitter.

use super::ir::{
    render, Ability, Archetype, ArchetypeKind, Expr, Field, Function, Import, Location, Module,
    Param, Stmt, StmtKind,
};
use super::lexer::{tokenize, Dialect, Token, TokenKind};
use super::syntax::{parse_param, split_assignment, split_top_level, Assignment, Cursor};
use super::{source_lines, Diagnostics, LanguageFrontend};
use crate::types::Language;

pub struct PythonFrontend;

impl LanguageFrontend for PythonFrontend {
    fn language(&self) -> Language {
        Language::Python
    }

    fn parse(&self, source: &str, diagnostics: &mut Diagnostics) -> Module {
        let (tokens, errors) = tokenize(source, Dialect::Indented);
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
            cur: Cursor::new(tokens),
            source,
            diags: diagnostics,
            in_class: false,
        };
        let mut body = parser.block_body(true);
        strip_docstring(&mut body);
        Module { body }
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

const MARKERS: [(ArchetypeKind, &str); 3] = [
    (ArchetypeKind::Node, "Marker base for graph nodes."),
    (ArchetypeKind::Edge, "Marker base for graph edges."),
    (ArchetypeKind::Walker, "Marker base for graph walkers."),
];

/// Constructs that exist in the Python-like language only
fn python_only(tokens: &[Token]) -> Option<&'static str> {
    for token in tokens {
        match token.text.as_str() {
            "lambda" if token.kind == TokenKind::Name => {
                return Some("lambda expressions are not translated")
            }
            "yield" if token.kind == TokenKind::Name => {
                return Some("generators are not translated")
            }
            "await" if token.kind == TokenKind::Name => {
                return Some("async code is not translated")
            }
            _ => {}
        }
    }
    None
}

fn join_text(tokens: &[Token]) -> String {
    tokens.iter().map(|t| t.text.as_str()).collect()
}

fn plain(tokens: &[Token]) -> String {
    render(tokens, &|t| t.text.clone())
}

fn is_docstring(stmt: &Stmt) -> bool {
    matches!(&stmt.kind, StmtKind::Expr(e) if e.tokens.len() == 1 && e.tokens[0].kind == TokenKind::Str)
}

fn strip_docstring(body: &mut Vec<Stmt>) {
    if body.first().is_some_and(is_docstring) {
        body.remove(0);
    }
}

/// `self.<name>`
fn self_attribute(target: &Expr) -> Option<String> {
    match target.tokens.as_slice() {
        [receiver, dot, name]
            if receiver.is_name("self") && dot.is_op(".") && name.kind == TokenKind::Name =>
        {
            Some(name.text.clone())
        }
        _ => None,
    }
}

/// `<default> if p is None else p`, as written for mutable field defaults
fn none_sentinel(value: &Expr) -> Option<(Expr, String)> {
    let t = &value.tokens;
    let n = t.len();
    if n < 7 {
        return None;
    }
    let tail = &t[n - 6..];
    let matches = tail[0].is_name("if")
        && tail[1].kind == TokenKind::Name
        && tail[2].is_name("is")
        && tail[3].is_name("None")
        && tail[4].is_name("else")
        && tail[5].text == tail[1].text;
    matches.then(|| (Expr::new(t[..n - 6].to_vec()), tail[1].text.clone()))
}

/// Turn an `__init__` that only stores its parameters into field
/// declarations. Returns `None` when the constructor does anything else.
fn fields_from_init(init: &Function) -> Option<Vec<Field>> {
    let param = |name: &str| init.params.iter().find(|p| p.name == name);
    let mut fields = Vec::new();
    let mut used: Vec<String> = Vec::new();

    for stmt in &init.body {
        match &stmt.kind {
            StmtKind::Pass => continue,
            _ if is_docstring(stmt) => continue,
            StmtKind::Assign {
                target,
                annotation,
                op,
                value: Some(value),
            } if op == "=" => {
                let name = self_attribute(target)?;
                let (field_annotation, default) =
                    if let Some(p) = value.as_name().and_then(|v| param(v)) {
                        if p.name != name {
                            return None;
                        }
                        used.push(p.name.clone());
                        (p.annotation.clone(), p.default.clone())
                    } else if let Some((default, p)) = none_sentinel(value) {
                        let p = param(&p)?;
                        if p.name != name {
                            return None;
                        }
                        used.push(p.name.clone());
                        (p.annotation.clone(), Some(default))
                    } else if init
                        .params
                        .iter()
                        .any(|p| value.contains_name(p.name.trim_start_matches('*')))
                    {
                        return None;
                    } else {
                        (None, Some(value.clone()))
                    };
                fields.push(Field {
                    name,
                    annotation: field_annotation.or_else(|| annotation.clone()),
                    default,
                    loc: stmt.loc,
                });
            }
            _ => return None,
        }
    }

    let all_used = init
        .params
        .iter()
        .filter(|p| p.name != "*" && p.name != "/")
        .all(|p| used.contains(&p.name));
    all_used.then_some(fields)
}

/// Trigger archetype named by an ability parameter annotation
fn trigger_name(annotation: &Expr) -> String {
    match annotation.tokens.as_slice() {
        [t] if t.kind == TokenKind::Str => t
            .text
            .trim_matches(|c| c == '"' || c == '\'')
            .to_string(),
        tokens => plain(tokens),
    }
}

struct Parser<'a> {
    cur: Cursor,
    source: &'a str,
    diags: &'a mut Diagnostics,
    in_class: bool,
}

impl<'a> Parser<'a> {
    fn block_body(&mut self, top: bool) -> Vec<Stmt> {
        let mut body = Vec::new();
        loop {
            match self.cur.peek().kind {
                TokenKind::Eof => break,
                TokenKind::Dedent => {
                    self.cur.advance();
                    if !top {
                        break;
                    }
                }
                TokenKind::Newline => {
                    self.cur.advance();
                }
                TokenKind::Indent => {
                    let loc = self.cur.location();
                    self.cur.advance();
                    self.diags.error(loc, "unexpected indent");
                    body.extend(self.block_body(false));
                }
                _ => body.extend(self.statement()),
            }
        }
        body
    }

    /// `:` followed by an indented block or an inline simple statement
    fn suite(&mut self) -> Vec<Stmt> {
        if !self.cur.eat_op(":") {
            let loc = self.cur.location();
            self.diags.error(loc, "expected ':'");
            self.cur.collect_until(|t| t.kind == TokenKind::Newline);
        }
        if self.cur.peek().kind == TokenKind::Newline {
            self.cur.advance();
            if self.cur.peek().kind == TokenKind::Indent {
                self.cur.advance();
                return self.block_body(false);
            }
            let loc = self.cur.location();
            self.diags.error(loc, "expected an indented block");
            return Vec::new();
        }
        self.simple_line()
    }

    fn header(&mut self) -> Expr {
        Expr::new(
            self.cur
                .collect_until(|t| t.is_op(":") || t.kind == TokenKind::Newline),
        )
    }

    /// Tokens up to the end of the logical line; the newline is consumed
    fn rest_of_line(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            tokens.extend(self.cur.collect_until(|t| t.kind == TokenKind::Newline));
            match self.cur.peek().kind {
                TokenKind::Newline => {
                    self.cur.advance();
                    break;
                }
                TokenKind::Eof => break,
                _ => tokens.push(self.cur.advance()),
            }
        }
        tokens
    }

    fn skip_indented_block(&mut self) {
        let mut depth = 0usize;
        loop {
            let token = self.cur.advance();
            match token.kind {
                TokenKind::Indent => depth += 1,
                TokenKind::Dedent => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return;
                    }
                }
                TokenKind::Eof => return,
                _ => {}
            }
        }
    }

    fn statement(&mut self) -> Vec<Stmt> {
        let token = self.cur.peek().clone();
        if token.is_op("@") {
            return self.decorated();
        }
        if token.kind != TokenKind::Name {
            return self.simple_line();
        }
        match token.text.as_str() {
            "def" => {
                let function = self.function(false);
                let loc = function.loc;
                vec![Stmt::new(StmtKind::Function(function), loc)]
            }
            "class" => self.class().into_iter().collect(),
            "if" => vec![self.if_stmt()],
            "while" => self.while_stmt(),
            "for" => self.for_stmt(),
            "try" => vec![self.unsupported_compound(
                "try/except blocks are not translated",
                &["except", "else", "finally"],
            )],
            "with" => vec![self.unsupported_compound("context managers are not translated", &[])],
            "async" => vec![self.unsupported_compound("async code is not translated", &[])],
            "match" if self.is_block_header() => {
                vec![self.unsupported_compound("match statements are not translated", &[])]
            }
            _ => self.simple_line(),
        }
    }

    /// Whether the current logical line ends with `:` (soft keywords)
    fn is_block_header(&self) -> bool {
        let mut n = 0;
        let mut depth = 0usize;
        let mut last_colon = false;
        loop {
            let token = self.cur.peek_nth(n);
            if depth == 0 && matches!(token.kind, TokenKind::Newline | TokenKind::Eof) {
                return last_colon;
            }
            if token.kind == TokenKind::Eof {
                return false;
            }
            if super::syntax::is_opening(token) {
                depth += 1;
            } else if super::syntax::is_closing(token) {
                depth = depth.saturating_sub(1);
            }
            last_colon = token.is_op(":");
            n += 1;
        }
    }

    fn unsupported_compound(&mut self, reason: &str, continuations: &[&str]) -> Stmt {
        let loc = self.cur.location();
        loop {
            self.rest_of_line();
            if self.cur.peek().kind == TokenKind::Indent {
                self.skip_indented_block();
            }
            if !continuations.iter().any(|c| self.cur.at_name(c)) {
                break;
            }
        }
        let text = source_lines(self.source, loc.line, self.cur.last_line());
        self.diags.warning(loc, reason);
        Stmt::new(
            StmtKind::Unsupported {
                text,
                reason: reason.to_string(),
            },
            loc,
        )
    }

    fn unsupported_tokens(&mut self, tokens: &[Token], reason: &str) -> Stmt {
        let loc = tokens.first().map(Location::of).unwrap_or_default();
        let end = tokens
            .last()
            .map(|t| t.line + t.text.matches('\n').count())
            .unwrap_or(loc.line);
        self.diags.warning(loc, reason);
        Stmt::new(
            StmtKind::Unsupported {
                text: source_lines(self.source, loc.line, end),
                reason: reason.to_string(),
            },
            loc,
        )
    }

    fn decorated(&mut self) -> Vec<Stmt> {
        let mut is_static = false;
        while self.cur.at_op("@") {
            let loc = self.cur.location();
            self.cur.advance();
            let name = join_text(&self.rest_of_line());
            if name == "staticmethod" {
                is_static = true;
            } else {
                self.diags
                    .warning(loc, format!("decorator @{} is not translated", name));
            }
        }
        if self.cur.at_name("def") {
            let function = self.function(is_static);
            let loc = function.loc;
            return vec![Stmt::new(StmtKind::Function(function), loc)];
        }
        if self.cur.at_name("class") {
            return self.class().into_iter().collect();
        }
        Vec::new()
    }

    fn function(&mut self, is_static: bool) -> Function {
        let loc = self.cur.location();
        self.cur.advance();
        let name = match self.cur.name() {
            Some(name) => name,
            None => {
                self.diags.error(loc, "expected a function name");
                String::new()
            }
        };

        let mut params: Vec<Param> = Vec::new();
        if self.cur.eat_op("(") {
            let inner = self.cur.collect_until(|_| false);
            if !self.cur.eat_op(")") {
                let loc = self.cur.location();
                self.diags.error(loc, "expected ')'");
            }
            params = split_top_level(&inner, ",")
                .iter()
                .filter_map(|p| parse_param(p))
                .collect();
        } else {
            let loc = self.cur.location();
            self.diags.error(loc, "expected '('");
        }
        if self.in_class && !is_static && !params.is_empty() {
            params.remove(0);
        }

        let returns = if self.cur.eat_op("->") {
            Some(self.header())
        } else {
            None
        };

        let outer = std::mem::replace(&mut self.in_class, false);
        let mut body = self.suite();
        self.in_class = outer;
        strip_docstring(&mut body);

        Function {
            name,
            params,
            returns,
            body,
            ability: None,
            is_static,
            loc,
        }
    }

    fn class(&mut self) -> Option<Stmt> {
        let loc = self.cur.location();
        self.cur.advance();
        let name = match self.cur.name() {
            Some(name) => name,
            None => {
                self.diags.error(loc, "expected a class name");
                String::new()
            }
        };
        let mut bases = Vec::new();
        if self.cur.eat_op("(") {
            let inner = self.cur.collect_until(|_| false);
            if !self.cur.eat_op(")") {
                let loc = self.cur.location();
                self.diags.error(loc, "expected ')'");
            }
            bases = split_top_level(&inner, ",")
                .iter()
                .map(|b| plain(b))
                .collect();
        }
        let outer = std::mem::replace(&mut self.in_class, true);
        let body = self.suite();
        self.in_class = outer;
        self.archetype(name, bases, body, loc)
    }

    fn archetype(
        &mut self,
        name: String,
        mut bases: Vec<String>,
        body: Vec<Stmt>,
        loc: Location,
    ) -> Option<Stmt> {
        let members: Vec<Stmt> = body
            .into_iter()
            .filter(|s| !is_docstring(s) && s.kind != StmtKind::Pass)
            .collect();

        // Marker bases emitted for lowered archetypes
        let is_marker = MARKERS
            .iter()
            .any(|(k, _)| k.marker_base() == Some(name.as_str()));
        if is_marker && bases.is_empty() && members.is_empty() {
            return None;
        }

        let mut kind = ArchetypeKind::Obj;
        bases.retain(|base| {
            let marker = MARKERS
                .iter()
                .find(|(k, _)| k.marker_base() == Some(base.as_str()));
            match marker {
                Some((k, _)) => {
                    kind = *k;
                    false
                }
                None => true,
            }
        });

        let mut fields = Vec::new();
        let mut methods = Vec::new();
        let mut other = Vec::new();
        for stmt in members {
            match stmt.kind {
                StmtKind::Function(function) => methods.push(function),
                StmtKind::Assign {
                    target,
                    annotation,
                    op,
                    value,
                } if op == "=" && target.as_name().is_some() => fields.push(Field {
                    name: target.as_name().unwrap_or_default().to_string(),
                    annotation,
                    default: value,
                    loc: stmt.loc,
                }),
                member => other.push(Stmt::new(member, stmt.loc)),
            }
        }

        if let Some(i) = methods.iter().position(|m| m.name == "__init__") {
            match fields_from_init(&methods[i]) {
                Some(init_fields) => {
                    methods.remove(i);
                    fields.extend(init_fields);
                }
                None => {
                    methods[i].name = "init".to_string();
                    self.diags.warning(
                        methods[i].loc,
                        format!("constructor of {} is translated as an init method", name),
                    );
                }
            }
        }

        if kind.marker_base().is_some() {
            let subject = kind.ability_subject();
            for method in methods.iter_mut() {
                let is_ability = method.params.len() == 1
                    && method.params[0].name == subject
                    && method.params[0].default.is_none()
                    && method.returns.is_none();
                if is_ability {
                    let trigger = method.params[0].annotation.as_ref().map(trigger_name);
                    method.ability = Some(Ability {
                        trigger,
                        event: "entry".to_string(),
                    });
                    method.params.clear();
                }
            }
        }

        Some(Stmt::new(
            StmtKind::Archetype(Archetype {
                kind,
                name,
                bases,
                fields,
                methods,
                other,
            }),
            loc,
        ))
    }

    fn if_stmt(&mut self) -> Stmt {
        let loc = self.cur.location();
        self.cur.advance();
        let cond = self.header();
        let body = self.suite();
        let mut branches = vec![(cond, body)];
        let mut orelse = None;
        loop {
            if self.cur.eat_name("elif") {
                let cond = self.header();
                let body = self.suite();
                branches.push((cond, body));
            } else if self.cur.eat_name("else") {
                orelse = Some(self.suite());
                break;
            } else {
                break;
            }
        }

        if branches.len() == 1 && orelse.is_none() && is_main_guard(&branches[0].0) {
            let (_, body) = branches.remove(0);
            return Stmt::new(StmtKind::Entry(body), loc);
        }
        Stmt::new(StmtKind::If { branches, orelse }, loc)
    }

    fn loop_else(&mut self) -> Option<Stmt> {
        self.cur
            .at_name("else")
            .then(|| self.unsupported_compound("loop else clauses are not translated", &[]))
    }

    fn while_stmt(&mut self) -> Vec<Stmt> {
        let loc = self.cur.location();
        self.cur.advance();
        let cond = self.header();
        let body = self.suite();
        let mut out = vec![Stmt::new(StmtKind::While { cond, body }, loc)];
        out.extend(self.loop_else());
        out
    }

    fn for_stmt(&mut self) -> Vec<Stmt> {
        let loc = self.cur.location();
        self.cur.advance();
        let target = Expr::new(self.cur.collect_until(|t| {
            t.is_name("in") || t.is_op(":") || t.kind == TokenKind::Newline
        }));
        if !self.cur.eat_name("in") {
            let loc = self.cur.location();
            self.diags.error(loc, "expected 'in'");
        }
        let iter = self.header();
        let body = self.suite();
        let mut out = vec![Stmt::new(StmtKind::For { target, iter, body }, loc)];
        out.extend(self.loop_else());
        out
    }

    fn simple_line(&mut self) -> Vec<Stmt> {
        let tokens = self.rest_of_line();
        split_top_level(&tokens, ";")
            .iter()
            .flat_map(|part| self.simple_stmt(part))
            .collect()
    }

    fn simple_stmt(&mut self, tokens: &[Token]) -> Vec<Stmt> {
        let Some(first) = tokens.first() else {
            return Vec::new();
        };
        let loc = Location::of(first);
        let rest = &tokens[1..];
        let expr = |t: &[Token]| (!t.is_empty()).then(|| Expr::new(t.to_vec()));

        if first.is_name("import") {
            return self.import(rest, loc);
        }
        if first.is_name("from") {
            return self.from_import(tokens, loc);
        }
        if let Some(reason) = python_only(tokens) {
            return vec![self.unsupported_tokens(tokens, reason)];
        }

        let kind = match first.text.as_str() {
            "pass" if first.kind == TokenKind::Name => StmtKind::Pass,
            "break" if first.kind == TokenKind::Name => StmtKind::Break,
            "continue" if first.kind == TokenKind::Name => StmtKind::Continue,
            "return" if first.kind == TokenKind::Name => StmtKind::Return(expr(rest)),
            "raise" if first.kind == TokenKind::Name => StmtKind::Raise(expr(rest)),
            "global" | "nonlocal" if first.kind == TokenKind::Name => {
                return vec![self.unsupported_tokens(tokens, "global declarations are not translated")]
            }
            "del" if first.kind == TokenKind::Name => {
                return vec![self.unsupported_tokens(tokens, "del statements are not translated")]
            }
            "assert" if first.kind == TokenKind::Name => {
                return vec![self.unsupported_tokens(tokens, "assert statements are not translated")]
            }
            _ => match split_assignment(tokens) {
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
                    return vec![self.unsupported_tokens(tokens, "chained assignment is not translated")]
                }
            },
        };
        vec![Stmt::new(kind, loc)]
    }

    fn import(&mut self, rest: &[Token], loc: Location) -> Vec<Stmt> {
        split_top_level(rest, ",")
            .iter()
            .map(|part| {
                let (module, alias) = match part.iter().position(|t| t.is_name("as")) {
                    Some(i) => (join_text(&part[..i]), part.get(i + 1).map(|t| t.text.clone())),
                    None => (join_text(part), None),
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

    fn from_import(&mut self, tokens: &[Token], loc: Location) -> Vec<Stmt> {
        let Some(split) = tokens.iter().position(|t| t.is_name("import")) else {
            return vec![self.unsupported_tokens(tokens, "malformed import")];
        };
        let module_tokens = &tokens[1..split];
        if module_tokens.first().is_some_and(|t| t.is_op(".") || t.is_op("...")) {
            return vec![self.unsupported_tokens(tokens, "relative imports are not translated")];
        }
        let mut names_tokens = &tokens[split + 1..];
        if names_tokens.first().is_some_and(|t| t.is_op("(")) {
            let end = names_tokens.len().saturating_sub(1).max(1);
            names_tokens = &names_tokens[1..end];
        }
        if names_tokens.iter().any(|t| t.is_op("*")) {
            return vec![self.unsupported_tokens(tokens, "wildcard imports are not translated")];
        }
        let names = split_top_level(names_tokens, ",")
            .iter()
            .filter_map(|part| {
                let name = part.first()?.text.clone();
                let alias = match part.iter().position(|t| t.is_name("as")) {
                    Some(i) => part.get(i + 1).map(|t| t.text.clone()),
                    None => None,
                };
                Some((name, alias))
            })
            .collect();
        vec![Stmt::new(
            StmtKind::Import(Import {
                module: join_text(module_tokens),
                names,
                alias: None,
            }),
            loc,
        )]
    }
}

fn is_main_guard(cond: &Expr) -> bool {
    let text = plain(&cond.tokens).replace('\'', "\"");
    text == "__name__ == \"__main__\"" || text == "\"__main__\" == __name__"
}

/// Graph-language expression tokens with no Python counterpart
fn graph_only(expr: &Expr) -> bool {
    expr.tokens.iter().any(|t| {
        (t.kind == TokenKind::Op && matches!(t.text.as_str(), "-->" | "<--" | "++>" | "<++" | "`"))
            || t.is_name("spawn")
    })
}

fn python_token(token: &Token) -> String {
    match (token.kind, token.text.as_str()) {
        (TokenKind::Op, "&&") => "and".to_string(),
        (TokenKind::Op, "||") => "or".to_string(),
        (TokenKind::Op, "!") => "not".to_string(),
        (TokenKind::Name, "null") => "None".to_string(),
        (TokenKind::Name, "true") => "True".to_string(),
        (TokenKind::Name, "false") => "False".to_string(),
        _ => token.text.clone(),
    }
}

fn python_expr(expr: &Expr) -> String {
    render(&expr.tokens, &python_token)
}

/// `any` is the graph language's "no particular type"
fn is_any(annotation: &Expr) -> bool {
    annotation.as_name() == Some("any")
}

fn is_mutable_default(default: &Expr) -> bool {
    match default.tokens.as_slice() {
        [first, ..] if first.is_op("[") || first.is_op("{") => true,
        [first, second, ..] => {
            first.kind == TokenKind::Name
                && matches!(first.text.as_str(), "list" | "dict" | "set")
                && second.is_op("(")
        }
        _ => false,
    }
}

fn format_param(name: &str, annotation: Option<String>, default: Option<String>) -> String {
    match (annotation, default) {
        (Some(a), Some(d)) => format!("{}: {} = {}", name, a, d),
        (Some(a), None) => format!("{}: {}", name, a),
        (None, Some(d)) => format!("{}={}", name, d),
        (None, None) => name.to_string(),
    }
}

/// Field declared alongside an explicit constructor
fn class_attribute(field: &Field) -> String {
    let default = field
        .default
        .as_ref()
        .map(python_expr)
        .unwrap_or_else(|| "None".to_string());
    match python_annotation(field.annotation.as_ref()) {
        Some(annotation) => format!("{}: {} = {}", field.name, annotation, default),
        None => format!("{} = {}", field.name, default),
    }
}

fn python_annotation(annotation: Option<&Expr>) -> Option<String> {
    annotation.filter(|a| !is_any(a)).map(python_expr)
}

fn python_import(import: &Import) -> String {
    if import.names.is_empty() {
        return match &import.alias {
            Some(alias) => format!("import {} as {}", import.module, alias),
            None => format!("import {}", import.module),
        };
    }
    let names: Vec<String> = import
        .names
        .iter()
        .map(|(name, alias)| match alias {
            Some(alias) => format!("{} as {}", name, alias),
            None => name.clone(),
        })
        .collect();
    format!("from {} import {}", import.module, names.join(", "))
}

struct Emitter<'d> {
    out: String,
    indent: usize,
    diags: &'d mut Diagnostics,
}

impl<'d> Emitter<'d> {
    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn blank_lines(&mut self, n: usize) {
        if self.out.is_empty() {
            return;
        }
        while self.out.ends_with("\n\n") {
            self.out.pop();
        }
        for _ in 0..n {
            self.out.push('\n');
        }
    }

    fn module(mut self, module: &Module) -> String {
        for (kind, doc) in MARKERS {
            let needed = module.body.iter().any(|s| {
                matches!(&s.kind, StmtKind::Archetype(a) if a.kind == kind && a.bases.is_empty())
            });
            if let (true, Some(base)) = (needed, kind.marker_base()) {
                self.blank_lines(2);
                self.line(&format!("class {}:", base));
                self.indent += 1;
                self.line(&format!("\"\"\"{}\"\"\"", doc));
                self.indent -= 1;
            }
        }

        let mut prev_block = !self.out.is_empty();
        for stmt in &module.body {
            let is_block = matches!(stmt.kind, StmtKind::Function(_) | StmtKind::Archetype(_));
            if is_block || prev_block {
                self.blank_lines(2);
            }
            self.stmt(stmt);
            prev_block = is_block;
        }
        self.out
    }

    fn block(&mut self, body: &[Stmt]) {
        self.indent += 1;
        let before = self.out.len();
        for stmt in body {
            self.stmt(stmt);
        }
        if self.out.len() == before {
            self.line("pass");
        }
        self.indent -= 1;
    }

    fn commented(&mut self, loc: Location, text: &str) {
        self.diags.warning(
            loc,
            format!("graph operation has no Python equivalent: {}", text),
        );
        self.line(&format!("# {}", text));
        self.line("pass");
    }

    fn condition(&mut self, expr: &Expr, fallback: &str) -> String {
        if graph_only(expr) {
            let text = plain(&expr.tokens);
            self.diags.warning(
                expr.location(),
                format!("graph expression `{}` replaced with {}", text, fallback),
            );
            fallback.to_string()
        } else {
            python_expr(expr)
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        let loc = stmt.loc;
        match &stmt.kind {
            StmtKind::Import(import) => self.line(&python_import(import)),
            StmtKind::Function(function) => self.function(function, None),
            StmtKind::Archetype(archetype) => self.archetype(archetype),
            StmtKind::If { branches, orelse } => {
                for (i, (cond, body)) in branches.iter().enumerate() {
                    let keyword = if i == 0 { "if" } else { "elif" };
                    let cond = self.condition(cond, "False");
                    self.line(&format!("{} {}:", keyword, cond));
                    self.block(body);
                }
                if let Some(body) = orelse {
                    self.line("else:");
                    self.block(body);
                }
            }
            StmtKind::While { cond, body } => {
                let cond = self.condition(cond, "False");
                self.line(&format!("while {}:", cond));
                self.block(body);
            }
            StmtKind::For { target, iter, body } => {
                let iter = self.condition(iter, "[]");
                self.line(&format!("for {} in {}:", python_expr(target), iter));
                self.block(body);
            }
            StmtKind::Return(value) | StmtKind::Raise(value) => {
                let keyword = if matches!(stmt.kind, StmtKind::Return(_)) {
                    "return"
                } else {
                    "raise"
                };
                match value {
                    Some(v) if graph_only(v) => {
                        self.commented(loc, &format!("{} {}", keyword, plain(&v.tokens)))
                    }
                    Some(v) => self.line(&format!("{} {}", keyword, python_expr(v))),
                    None => self.line(keyword),
                }
            }
            StmtKind::Assign {
                target,
                annotation,
                op,
                value,
            } => {
                if value.as_ref().is_some_and(graph_only) {
                    let value = value.as_ref().map(|v| plain(&v.tokens)).unwrap_or_default();
                    self.commented(loc, &format!("{} {} {}", plain(&target.tokens), op, value));
                    return;
                }
                let mut text = python_expr(target);
                if let Some(annotation) = python_annotation(annotation.as_ref()) {
                    text.push_str(": ");
                    text.push_str(&annotation);
                }
                match value {
                    Some(value) => {
                        text.push_str(&format!(" {} {}", op, python_expr(value)));
                    }
                    None if annotation.as_ref().is_some_and(is_any) => {
                        text.push_str(" = None");
                    }
                    None => {}
                }
                self.line(&text);
            }
            StmtKind::Expr(expr) => {
                if graph_only(expr) {
                    self.commented(loc, &plain(&expr.tokens));
                } else {
                    self.line(&python_expr(expr));
                }
            }
            StmtKind::Pass => self.line("pass"),
            StmtKind::Break => self.line("break"),
            StmtKind::Continue => self.line("continue"),
            StmtKind::Entry(body) => {
                for stmt in body {
                    self.stmt(stmt);
                }
            }
            StmtKind::Visit(expr) => {
                self.diags
                    .warning(loc, "visit has no Python equivalent and is emitted as a comment");
                self.line(&format!("# visit {}", plain(&expr.tokens)));
                self.line("pass");
            }
            StmtKind::Report(expr) => {
                if graph_only(expr) {
                    self.commented(loc, &format!("report {}", plain(&expr.tokens)));
                } else {
                    self.diags.warning(loc, "report is translated as print");
                    self.line(&format!("print({})", python_expr(expr)));
                }
            }
            StmtKind::Disengage => {
                self.diags
                    .warning(loc, "disengage is translated as return");
                self.line("return");
            }
            StmtKind::Unsupported { text, .. } => {
                for line in text.lines() {
                    self.line(&format!("# {}", line).trim_end().to_string());
                }
                self.line("pass");
            }
        }
    }

    fn function(&mut self, function: &Function, owner: Option<ArchetypeKind>) {
        let mut params = Vec::new();
        if owner.is_some() && !function.is_static {
            params.push("self".to_string());
        }
        if let Some(ability) = &function.ability {
            let subject = owner.map(|k| k.ability_subject()).unwrap_or("here");
            params.push(match &ability.trigger {
                Some(trigger) => format!("{}: \"{}\"", subject, trigger.trim_start_matches('`')),
                None => subject.to_string(),
            });
            if ability.event == "exit" {
                self.diags.warning(
                    function.loc,
                    format!("exit ability {} is translated as a plain method", function.name),
                );
            }
        }
        for param in &function.params {
            if param.name == "/" {
                params.push("/".to_string());
                continue;
            }
            params.push(format_param(
                &param.name,
                python_annotation(param.annotation.as_ref()),
                param.default.as_ref().map(python_expr),
            ));
        }

        if function.is_static && owner.is_some() {
            self.line("@staticmethod");
        }
        let name = if owner.is_some() && function.name == "init" {
            "__init__"
        } else {
            function.name.as_str()
        };
        let mut header = format!("def {}({})", name, params.join(", "));
        if let Some(returns) = python_annotation(function.returns.as_ref()) {
            header.push_str(&format!(" -> {}", returns));
        }
        header.push(':');
        self.line(&header);
        self.block(&function.body);
    }

    fn archetype(&mut self, archetype: &Archetype) {
        let mut bases = archetype.bases.clone();
        if bases.is_empty() {
            if let Some(marker) = archetype.kind.marker_base() {
                bases.push(marker.to_string());
            }
        }
        if bases.is_empty() {
            self.line(&format!("class {}:", archetype.name));
        } else {
            self.line(&format!("class {}({}):", archetype.name, bases.join(", ")));
        }

        self.indent += 1;
        let before = self.out.len();
        let explicit_init = archetype
            .methods
            .iter()
            .any(|m| m.name == "init" || m.name == "__init__");
        if !archetype.fields.is_empty() {
            if explicit_init {
                for field in &archetype.fields {
                    self.line(&class_attribute(field));
                }
            } else {
                self.init(&archetype.fields);
            }
        }
        for method in &archetype.methods {
            if self.out.len() != before {
                self.blank_lines(1);
            }
            self.function(method, Some(archetype.kind));
        }
        for stmt in &archetype.other {
            self.stmt(stmt);
        }
        if self.out.len() == before {
            self.line("pass");
        }
        self.indent -= 1;
    }

    fn init(&mut self, fields: &[Field]) {
        let mut params = vec!["self".to_string()];
        let mut seen_default = false;
        let mut keyword_only = false;
        for field in fields {
            if field.default.is_some() {
                seen_default = true;
            } else if seen_default {
                keyword_only = true;
            }
        }
        if keyword_only {
            params.push("*".to_string());
        }

        let mut body = Vec::new();
        for field in fields {
            let mutable = field.default.as_ref().filter(|d| is_mutable_default(d));
            let default = match mutable {
                Some(_) => Some("None".to_string()),
                None => field.default.as_ref().map(python_expr),
            };
            params.push(format_param(
                &field.name,
                python_annotation(field.annotation.as_ref()),
                default,
            ));
            body.push(match mutable {
                Some(d) => format!(
                    "self.{0} = {1} if {0} is None else {0}",
                    field.name,
                    python_expr(d)
                ),
                None => format!("self.{0} = {0}", field.name),
            });
        }

        self.line(&format!("def __init__({}):", params.join(", ")));
        self.indent += 1;
        for line in body {
            self.line(&line);
        }
        self.indent -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::Severity;

    fn parse(source: &str) -> (Module, Diagnostics) {
        let mut diags = Diagnostics::new();
        let module = PythonFrontend.parse(source, &mut diags);
        (module, diags)
    }

    #[test]
    fn test_parse_control_flow() {
        let source = "for i in range(3):\n    if i == 1:\n        continue\n    elif i > 1:\n        break\n    else:\n        print(i)\nwhile x:\n    x -= 1\n";
        let (module, diags) = parse(source);
        assert!(diags.is_empty());
        assert_eq!(module.body.len(), 2);
        match &module.body[0].kind {
            StmtKind::For { body, .. } => match &body[0].kind {
                StmtKind::If { branches, orelse } => {
                    assert_eq!(branches.len(), 2);
                    assert!(orelse.is_some());
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_init_becomes_fields() {
        let source = "class Point:\n    def __init__(self, x: int, y: int = 0, tags: list = None):\n        self.x = x\n        self.y = y\n        self.tags = [] if tags is None else tags\n";
        let (module, diags) = parse(source);
        assert!(diags.is_empty());
        match &module.body[0].kind {
            StmtKind::Archetype(a) => {
                assert_eq!(a.kind, ArchetypeKind::Obj);
                assert!(a.methods.is_empty());
                let names: Vec<&str> = a.fields.iter().map(|f| f.name.as_str()).collect();
                assert_eq!(names, vec!["x", "y", "tags"]);
                let tags_default = a.fields[2].default.as_ref().map(|d| plain(&d.tokens));
                assert_eq!(tags_default.as_deref(), Some("[]"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_custom_constructor_is_kept() {
        let source = "class C:\n    def __init__(self, n):\n        self.total = n * 2\n";
        let (module, diags) = parse(source);
        assert_eq!(diags.len(), 1);
        match &module.body[0].kind {
            StmtKind::Archetype(a) => assert_eq!(a.methods[0].name, "init"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_main_guard_becomes_entry() {
        let (module, _) = parse("if __name__ == '__main__':\n    main()\n");
        assert!(matches!(module.body[0].kind, StmtKind::Entry(_)));
    }

    #[test]
    fn test_unsupported_statements_are_warnings() {
        let (module, diags) =
            parse("import os, sys as s\nfrom . import x\nglobal g\nsquare = lambda v: v * v\n");
        assert_eq!(module.body.len(), 5);
        let warnings = diags
            .into_vec()
            .into_iter()
            .filter(|d| d.severity == Severity::Warning)
            .count();
        assert_eq!(warnings, 3);
    }

    #[test]
    fn test_emit_keyword_only_init_for_required_after_default() {
        let loc = Location::default();
        let field = |name: &str, default: Option<&str>| Field {
            name: name.to_string(),
            annotation: None,
            default: default.map(|d| {
                let (tokens, _) = tokenize(d, Dialect::Braced);
                Expr::new(
                    tokens
                        .into_iter()
                        .filter(|t| t.kind != TokenKind::Eof)
                        .collect(),
                )
            }),
            loc,
        };
        let module = Module {
            body: vec![Stmt::new(
                StmtKind::Archetype(Archetype {
                    kind: ArchetypeKind::Obj,
                    name: "Task".to_string(),
                    bases: Vec::new(),
                    fields: vec![field("done", Some("False")), field("title", None), field("items", Some("[]"))],
                    methods: Vec::new(),
                    other: Vec::new(),
                }),
                loc,
            )],
        };
        let mut diags = Diagnostics::new();
        let code = PythonFrontend.emit(&module, &mut diags);
        assert!(code.contains("def __init__(self, *, done=False, title, items=None):"));
        assert!(code.contains("self.items = [] if items is None else items"));
    }
}
