//! Static checks run before anything is spawned.
//!
//! Evaluation works on the translator's token stream, so text inside string
//! literals and comments never matches an import or builtin rule. Syntax
//! patterns are regular expressions over the raw source. When the lexer
//! reports errors the token view may hide code behind an unterminated string,
//! so line-based regex fallbacks for imports and builtins run as well.

use crate::errors::Result;
use crate::policy::{PolicySet, SecurityPolicy};
use crate::translate::lexer::{tokenize, Dialect, Token, TokenKind};
use crate::types::Language;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    BlockedImport,
    BlockedBuiltin,
    BlockedPattern,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ViolationKind::BlockedImport => "import of blocked module",
            ViolationKind::BlockedBuiltin => "use of blocked builtin",
            ViolationKind::BlockedPattern => "blocked construct",
        })
    }
}

/// The offending construct and where it was found
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityViolation {
    pub kind: ViolationKind,
    pub construct: String,
    /// 1-based source line
    pub line: usize,
}

impl fmt::Display for SecurityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' on line {}", self.kind, self.construct, self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Violation(SecurityViolation),
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Verdict::Approved)
    }
}

/// Per-language security check. Implementations must be deterministic and
/// free of side effects.
pub trait PolicyEvaluator: Send + Sync {
    fn language(&self) -> Language;

    fn evaluate(&self, code: &str) -> Verdict;
}

fn dialect_for(language: Language) -> Dialect {
    match language {
        Language::Python => Dialect::Indented,
        Language::Graph => Dialect::Braced,
    }
}

/// Reference evaluator built from a [`SecurityPolicy`]
pub struct TokenPolicyEvaluator {
    language: Language,
    dialect: Dialect,
    policy: SecurityPolicy,
    patterns: Vec<Regex>,
    import_fallback: Regex,
    builtin_fallback: Option<Regex>,
}

impl TokenPolicyEvaluator {
    /// Fails when one of the policy's syntax patterns is not a valid regex
    pub fn new(language: Language, policy: &SecurityPolicy) -> Result<Self> {
        let patterns = policy
            .blocked_syntax_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let import_fallback = Regex::new(
            r"(?m)^\s*(?:from\s+([A-Za-z_][\w.]*)\s+import\b|import(?::\w+)?\s+(?:from\s+)?([A-Za-z_][\w.]*))",
        )?;
        let builtin_fallback = if policy.blocked_builtins.is_empty() {
            None
        } else {
            let names: Vec<String> = policy
                .blocked_builtins
                .iter()
                .map(|b| regex::escape(b))
                .collect();
            Some(Regex::new(&format!(
                r"(?:^|[^\w.])({})\s*\(",
                names.join("|")
            ))?)
        };
        Ok(Self {
            language,
            dialect: dialect_for(language),
            policy: policy.clone(),
            patterns,
            import_fallback,
            builtin_fallback,
        })
    }

    /// Every violation found, ordered by line
    pub fn evaluate_all(&self, code: &str) -> Vec<SecurityViolation> {
        let (tokens, lex_errors) = tokenize(code, self.dialect);
        let mut found = Vec::new();

        self.scan_imports(&tokens, &mut found);
        self.scan_builtins(&tokens, 0, &mut found);
        for token in tokens.iter().filter(|t| is_format_string(t)) {
            for (offset, segment) in interpolations(&token.text) {
                let (inner, _) = tokenize(&segment, Dialect::Braced);
                self.scan_builtins(&inner, token.line + offset - 1, &mut found);
            }
        }
        self.scan_patterns(code, &mut found);
        if !lex_errors.is_empty() {
            self.scan_fallback(code, &mut found);
        }

        found.sort_by_key(|v| v.line);
        found.dedup();
        found
    }

    fn check_module(&self, module: &str, line: usize, found: &mut Vec<SecurityViolation>) {
        if self.policy.is_import_blocked(module) {
            found.push(SecurityViolation {
                kind: ViolationKind::BlockedImport,
                construct: module.to_string(),
                line,
            });
        }
    }

    fn scan_imports(&self, tokens: &[Token], found: &mut Vec<SecurityViolation>) {
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            let after_dot = i > 0 && tokens[i - 1].is_op(".");
            if token.is_name("import") && !after_dot {
                i = self.import_statement(tokens, i + 1, found);
            } else if token.is_name("from")
                && !after_dot
                && !(i > 0 && (tokens[i - 1].is_name("yield") || tokens[i - 1].is_name("raise")))
            {
                i = self.from_import(tokens, i + 1, found);
            } else {
                i += 1;
            }
        }
    }

    /// `import a.b as c, d`, `import:py a;`, `import:py from a { b, c }`
    fn import_statement(
        &self,
        tokens: &[Token],
        mut i: usize,
        found: &mut Vec<SecurityViolation>,
    ) -> usize {
        if at_op(tokens, i, ":") && at_kind(tokens, i + 1, TokenKind::Name) {
            i += 2;
        }
        if at_name(tokens, i, "from") {
            let Some((module, line, next)) = dotted(tokens, i + 1) else {
                return i + 1;
            };
            self.check_module(&module, line, found);
            i = next;
            let close = if at_op(tokens, i, "{") {
                i += 1;
                Some("}")
            } else if at_op(tokens, i, ",") {
                i += 1;
                None
            } else {
                return i;
            };
            return self.imported_names(tokens, i, &module, close, found);
        }
        loop {
            let Some((module, line, next)) = dotted(tokens, i) else {
                return i;
            };
            self.check_module(&module, line, found);
            i = skip_alias(tokens, next);
            if !at_op(tokens, i, ",") {
                return i;
            }
            i += 1;
        }
    }

    /// `from a.b import c as d, e` and `from . import x`
    fn from_import(&self, tokens: &[Token], mut i: usize, found: &mut Vec<SecurityViolation>) -> usize {
        let mut relative = false;
        while at_op(tokens, i, ".") || at_op(tokens, i, "...") {
            relative = true;
            i += 1;
        }
        let (module, line) = match dotted(tokens, i) {
            Some((module, line, next)) => {
                i = next;
                (module, line)
            }
            None if relative => (String::new(), 0),
            None => return i,
        };
        if !at_name(tokens, i, "import") {
            return i;
        }
        i += 1;
        if relative {
            return i;
        }
        self.check_module(&module, line, found);
        let close = if at_op(tokens, i, "(") {
            i += 1;
            Some(")")
        } else {
            None
        };
        self.imported_names(tokens, i, &module, close, found)
    }

    fn imported_names(
        &self,
        tokens: &[Token],
        mut i: usize,
        module: &str,
        close: Option<&str>,
        found: &mut Vec<SecurityViolation>,
    ) -> usize {
        loop {
            if let Some(close) = close {
                if at_op(tokens, i, close) {
                    return i + 1;
                }
            }
            match tokens.get(i) {
                Some(t) if t.kind == TokenKind::Name => {
                    self.check_module(&format!("{}.{}", module, t.text), t.line, found);
                    i = skip_alias(tokens, i + 1);
                }
                Some(t) if t.is_op("*") => i += 1,
                _ => return i,
            }
            if at_op(tokens, i, ",") {
                i += 1;
            } else if close.is_none() {
                return i;
            }
        }
    }

    /// Blocked builtin referenced as a value: not an attribute, not a
    /// definition, not a keyword argument name.
    fn scan_builtins(&self, tokens: &[Token], line_offset: usize, found: &mut Vec<SecurityViolation>) {
        for (i, token) in tokens.iter().enumerate() {
            if token.kind != TokenKind::Name || !self.policy.is_builtin_blocked(&token.text) {
                continue;
            }
            if let Some(prev) = i.checked_sub(1).map(|p| &tokens[p]) {
                if prev.is_op(".")
                    || prev.is_name("def")
                    || prev.is_name("class")
                    || prev.is_name("can")
                {
                    continue;
                }
            }
            if tokens.get(i + 1).is_some_and(|next| next.is_op("=")) {
                continue;
            }
            found.push(SecurityViolation {
                kind: ViolationKind::BlockedBuiltin,
                construct: token.text.clone(),
                line: token.line + line_offset,
            });
        }
    }

    fn scan_patterns(&self, code: &str, found: &mut Vec<SecurityViolation>) {
        for pattern in &self.patterns {
            if let Some(m) = pattern.find(code) {
                found.push(SecurityViolation {
                    kind: ViolationKind::BlockedPattern,
                    construct: m.as_str().to_string(),
                    line: line_of(code, m.start()),
                });
            }
        }
    }

    fn scan_fallback(&self, code: &str, found: &mut Vec<SecurityViolation>) {
        for caps in self.import_fallback.captures_iter(code) {
            if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
                self.check_module(m.as_str(), line_of(code, m.start()), found);
            }
        }
        if let Some(builtins) = &self.builtin_fallback {
            for caps in builtins.captures_iter(code) {
                if let Some(m) = caps.get(1) {
                    found.push(SecurityViolation {
                        kind: ViolationKind::BlockedBuiltin,
                        construct: m.as_str().to_string(),
                        line: line_of(code, m.start()),
                    });
                }
            }
        }
    }
}

impl PolicyEvaluator for TokenPolicyEvaluator {
    fn language(&self) -> Language {
        self.language
    }

    fn evaluate(&self, code: &str) -> Verdict {
        match self.evaluate_all(code).into_iter().next() {
            Some(violation) => Verdict::Violation(violation),
            None => Verdict::Approved,
        }
    }
}

fn at_op(tokens: &[Token], i: usize, op: &str) -> bool {
    tokens.get(i).is_some_and(|t| t.is_op(op))
}

fn at_name(tokens: &[Token], i: usize, name: &str) -> bool {
    tokens.get(i).is_some_and(|t| t.is_name(name))
}

fn at_kind(tokens: &[Token], i: usize, kind: TokenKind) -> bool {
    tokens.get(i).is_some_and(|t| t.kind == kind)
}

/// `a.b.c` starting at `i`: (name, line, index after)
fn dotted(tokens: &[Token], mut i: usize) -> Option<(String, usize, usize)> {
    let first = tokens.get(i).filter(|t| t.kind == TokenKind::Name)?;
    let line = first.line;
    let mut name = first.text.clone();
    i += 1;
    while at_op(tokens, i, ".") && at_kind(tokens, i + 1, TokenKind::Name) {
        name.push('.');
        name.push_str(&tokens[i + 1].text);
        i += 2;
    }
    Some((name, line, i))
}

fn skip_alias(tokens: &[Token], i: usize) -> usize {
    if at_name(tokens, i, "as") && at_kind(tokens, i + 1, TokenKind::Name) {
        i + 2
    } else {
        i
    }
}

fn line_of(code: &str, offset: usize) -> usize {
    code[..offset].matches('\n').count() + 1
}

fn is_format_string(token: &Token) -> bool {
    if token.kind != TokenKind::Str {
        return false;
    }
    token
        .text
        .chars()
        .take_while(|c| *c != '\'' && *c != '"')
        .any(|c| c == 'f' || c == 'F')
}

/// `{...}` replacement fields of an f-string literal, with the 0-based line
/// offset of each inside the literal
fn interpolations(literal: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut chars = literal.chars().peekable();
    let mut line = 0;
    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
            }
            '{' => {
                let start_line = line;
                let mut depth = 1;
                let mut segment = String::new();
                for c in chars.by_ref() {
                    match c {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        '\n' => line += 1,
                        _ => {}
                    }
                    segment.push(c);
                }
                out.push((start_line, segment));
            }
            _ => {}
        }
    }
    out
}

/// Evaluators keyed by language
#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    evaluators: HashMap<Language, Arc<dyn PolicyEvaluator>>,
}

impl EvaluatorRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// One [`TokenPolicyEvaluator`] per policy in the set
    pub fn from_policies(policies: &PolicySet) -> Result<Self> {
        let mut registry = Self::empty();
        for (language, policy) in policies.iter() {
            registry.register(Arc::new(TokenPolicyEvaluator::new(language, policy)?));
        }
        Ok(registry)
    }

    /// Replaces any evaluator already registered for the same language
    pub fn register(&mut self, evaluator: Arc<dyn PolicyEvaluator>) {
        self.evaluators.insert(evaluator.language(), evaluator);
    }

    pub fn get(&self, language: Language) -> Option<Arc<dyn PolicyEvaluator>> {
        self.evaluators.get(&language).cloned()
    }

    pub fn languages(&self) -> BTreeSet<Language> {
        self.evaluators.keys().copied().collect()
    }
}
