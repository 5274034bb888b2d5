//! Template catalog lookup, consulted when bootstrapping patients.

use std::collections::HashMap;
use async_trait::async_trait;
use studyphase_core::{TemplateId, TemplateMeta};

use crate::error::Result;

/// Read access to the form-template catalog.
#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    /// Look up a template; `Ok(None)` when it does not exist.
    async fn get_template(&self, id: &TemplateId) -> Result<Option<TemplateMeta>>;
}

/// Catalog backed by a fixed map.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    templates: HashMap<TemplateId, TemplateMeta>,
}

impl StaticCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template.
    pub fn with_template(mut self, meta: TemplateMeta) -> Self {
        self.templates.insert(meta.id.clone(), meta);
        self
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl FromIterator<TemplateMeta> for StaticCatalog {
    fn from_iter<I: IntoIterator<Item = TemplateMeta>>(iter: I) -> Self {
        Self {
            templates: iter.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }
}

#[async_trait]
impl TemplateCatalog for StaticCatalog {
    async fn get_template(&self, id: &TemplateId) -> Result<Option<TemplateMeta>> {
        Ok(self.templates.get(id).cloned())
    }
}
