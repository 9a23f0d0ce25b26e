//! Read-only starter programs that requests can be seeded from.

use crate::errors::{EngineError, Result};
use crate::types::Language;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeTemplate {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub language: Language,
    pub body: String,
}

impl CodeTemplate {
    pub fn new(id: &str, language: Language, body: &str) -> Self {
        Self {
            id: id.to_string(),
            title: String::new(),
            language,
            body: body.to_string(),
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<CodeTemplate>>;

    async fn list(&self) -> Result<Vec<CodeTemplate>>;
}

#[derive(Debug, Default)]
pub struct InMemoryTemplateStore {
    templates: RwLock<BTreeMap<String, CodeTemplate>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a template
    pub fn insert(&self, template: CodeTemplate) {
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(template.id.clone(), template);
    }

    /// Load a JSON array of templates
    pub fn from_json(content: &str) -> Result<Self> {
        let templates: Vec<CodeTemplate> = serde_json::from_str(content)?;
        let store = Self::new();
        for template in templates {
            store.insert(template);
        }
        Ok(store)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read templates {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn get(&self, id: &str) -> Result<Option<CodeTemplate>> {
        Ok(self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<CodeTemplate>> {
        Ok(self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }
}
