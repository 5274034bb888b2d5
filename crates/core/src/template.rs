//! Template catalog metadata.

use serde::{Deserialize, Serialize};
use crate::id::TemplateId;

/// What the template catalog knows about a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMeta {
    /// Template id
    pub id: TemplateId,

    /// Display name
    pub name: String,

    /// Template version
    #[serde(default)]
    pub version: Option<String>,

    /// Whether the template may still be assigned
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl TemplateMeta {
    /// Create active metadata.
    pub fn new(id: impl Into<TemplateId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: None,
            active: true,
        }
    }
}
