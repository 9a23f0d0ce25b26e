//! Best-effort source translation between the Python-like language and the
//! graph language.
//!
//! Each language implements [`LanguageFrontend`] (parse into the shared IR,
//! emit from it). Constructs outside the supported subset are never dropped
//! silently: they are emitted as commented approximations and reported as
//! diagnostics on an otherwise successful [`TranslationResult`].

mod graph;
pub mod ir;
pub mod lexer;
mod python;
mod syntax;

pub use graph::GraphFrontend;
pub use ir::Location;
pub use python::PythonFrontend;

use crate::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// The emitted code may not be valid in the target language
    Error,
    /// Valid target code whose behaviour may differ from the source
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub location: Location,
    pub message: String,
    pub severity: Severity,
}

/// Ordered diagnostic sink handed to `parse` and `emit`
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, severity: Severity, location: Location, message: impl Into<String>) {
        self.items.push(Diagnostic {
            location,
            message: message.into(),
            severity,
        });
    }

    pub fn error(&mut self, location: Location, message: impl Into<String>) {
        self.push(Severity::Error, location, message);
    }

    pub fn warning(&mut self, location: Location, message: impl Into<String>) {
        self.push(Severity::Warning, location, message);
    }

    pub fn info(&mut self, location: Location, message: impl Into<String>) {
        self.push(Severity::Info, location, message);
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranslationRequest {
    pub source_lang: Language,
    pub target_lang: Language,
    pub source_code: String,
}

impl TranslationRequest {
    pub fn new(source_lang: Language, target_lang: Language, source_code: impl Into<String>) -> Self {
        Self {
            source_lang,
            target_lang,
            source_code: source_code.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranslationResult {
    pub id: uuid::Uuid,
    pub source_lang: Language,
    pub target_lang: Language,
    pub source_code: String,
    pub target_code: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl TranslationResult {
    /// No error diagnostics: the target code is syntactically valid
    pub fn is_valid(&self) -> bool {
        !self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Warning)
    }
}

/// Per-language parse/emit capability
pub trait LanguageFrontend: Send + Sync {
    fn language(&self) -> Language;

    fn parse(&self, source: &str, diagnostics: &mut Diagnostics) -> ir::Module;

    fn emit(&self, module: &ir::Module, diagnostics: &mut Diagnostics) -> String;
}

/// Frontends keyed by language tag
#[derive(Clone)]
pub struct FrontendRegistry {
    frontends: HashMap<Language, Arc<dyn LanguageFrontend>>,
}

impl FrontendRegistry {
    pub fn empty() -> Self {
        Self {
            frontends: HashMap::new(),
        }
    }

    pub fn register(&mut self, frontend: Arc<dyn LanguageFrontend>) {
        self.frontends.insert(frontend.language(), frontend);
    }

    pub fn get(&self, language: Language) -> Option<Arc<dyn LanguageFrontend>> {
        self.frontends.get(&language).cloned()
    }
}

impl Default for FrontendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PythonFrontend));
        registry.register(Arc::new(GraphFrontend));
        registry
    }
}

/// Stateless translation pipeline; safe to share across tasks
#[derive(Clone, Default)]
pub struct Translator {
    registry: FrontendRegistry,
}

impl Translator {
    pub fn new(registry: FrontendRegistry) -> Self {
        Self { registry }
    }

    pub fn translate(&self, request: &TranslationRequest) -> TranslationResult {
        let mut diagnostics = Diagnostics::new();
        let target_code = if request.source_lang == request.target_lang {
            request.source_code.clone()
        } else {
            match (
                self.registry.get(request.source_lang),
                self.registry.get(request.target_lang),
            ) {
                (Some(source), Some(target)) => {
                    let module = source.parse(&request.source_code, &mut diagnostics);
                    target.emit(&module, &mut diagnostics)
                }
                (source, _) => {
                    let missing = if source.is_none() {
                        request.source_lang
                    } else {
                        request.target_lang
                    };
                    diagnostics.error(
                        Location::default(),
                        format!("no translator registered for {}", missing),
                    );
                    String::new()
                }
            }
        };

        debug!(
            "[TRANSLATE] {} -> {}: {} diagnostics",
            request.source_lang,
            request.target_lang,
            diagnostics.len()
        );

        TranslationResult {
            id: uuid::Uuid::new_v4(),
            source_lang: request.source_lang,
            target_lang: request.target_lang,
            source_code: request.source_code.clone(),
            target_code,
            diagnostics: diagnostics.into_vec(),
        }
    }
}

/// Lines `start..=end` (1-based) of `source` with their common indentation
/// removed, used to quote unsupported code
pub(crate) fn source_lines(source: &str, start: usize, end: usize) -> String {
    let lines: Vec<&str> = source
        .lines()
        .enumerate()
        .filter(|(i, _)| *i + 1 >= start && *i + 1 <= end)
        .map(|(_, l)| l.trim_end())
        .collect();
    let margin = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|l| l.get(margin..).unwrap_or("").to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(from: Language, to: Language, code: &str) -> TranslationResult {
        Translator::default().translate(&TranslationRequest::new(from, to, code))
    }

    #[test]
    fn test_node_and_walker_to_python() {
        let source = r#"
node Person {
    has name: str;
    has age: int = 0;
}

walker Greeter {
    has greeting: str = "Hello";

    can greet with Person entry {
        print(self.greeting, here.name);
    }
}
"#;
        let result = translate(Language::Graph, Language::Python, source);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let code = &result.target_code;
        assert!(code.contains("class Node:"));
        assert!(code.contains("class Walker:"));
        assert!(code.contains("class Person(Node):"));
        assert!(code.contains("def __init__(self, name: str, age: int = 0):"));
        assert!(code.contains("self.age = age"));
        assert!(code.contains("class Greeter(Walker):"));
        assert!(code.contains("def greet(self, here: \"Person\"):"));
        assert!(code.contains("print(self.greeting, here.name)"));
    }

    #[test]
    fn test_python_functions_to_graph() {
        let source = "def add(a: int, b: int) -> int:\n    return a + b\n\nprint(add(1, 2))\n";
        let result = translate(Language::Python, Language::Graph, source);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert!(result
            .target_code
            .contains("def add(a: int, b: int) -> int {"));
        assert!(result.target_code.contains("return a + b;"));
        assert!(result.target_code.contains("with entry {"));
        assert!(result.target_code.contains("print(add(1, 2));"));
    }

    #[test]
    fn test_unsupported_constructs_become_warnings() {
        let source = "try:\n    x = 1\nexcept Exception:\n    pass\nf = lambda v: v\n";
        let result = translate(Language::Python, Language::Graph, source);
        assert!(result.is_valid());
        assert!(result.has_warnings());
        assert!(result.diagnostics.len() >= 2);
        assert!(result.target_code.contains("# try:"));
    }

    #[test]
    fn test_everything_unsupported_still_returns_result() {
        let source = "async def f():\n    await g()\n";
        let result = translate(Language::Python, Language::Graph, source);
        assert!(!result.diagnostics.is_empty());
        assert!(result.target_code.contains("# async def f():"));
        assert!(!result
            .target_code
            .lines()
            .any(|l| l.trim_start().starts_with("def ")));
    }

    #[test]
    fn test_same_language_is_identity() {
        let result = translate(Language::Python, Language::Python, "x = 1\n");
        assert_eq!(result.target_code, "x = 1\n");
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn test_malformed_source_reports_error() {
        let result = translate(Language::Graph, Language::Python, "node A { has x: int;");
        assert!(!result.is_valid());
    }

    #[test]
    fn test_graph_round_trip_keeps_archetypes() {
        let source = r#"
node City {
    has name: str;
}

walker Tour {
    can visit_city with City entry {
        print(here.name);
    }
}
"#;
        let translator = Translator::default();
        let python = translator.translate(&TranslationRequest::new(
            Language::Graph,
            Language::Python,
            source,
        ));
        let back = translator.translate(&TranslationRequest::new(
            Language::Python,
            Language::Graph,
            python.target_code,
        ));
        assert!(back.diagnostics.is_empty(), "{:?}", back.diagnostics);
        assert!(back.target_code.contains("node City {"));
        assert!(back.target_code.contains("has name: str;"));
        assert!(back.target_code.contains("walker Tour {"));
        assert!(back.target_code.contains("can visit_city with City entry {"));
        assert!(!back.target_code.contains("obj Node"));
    }
}
