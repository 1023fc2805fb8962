//! Client-module types: the external references a stream can carry.
//!
//! The writer never inlines a client module. It looks the reference up in
//! the manifest, emits the metadata once as an `M` row, and lets the reader
//! hand that metadata to a host loader when the value is actually used.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Payload of an `M` row: everything a host loader needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// Opaque module token.
    pub id: String,
    /// Load-time dependencies that must be fetched first.
    #[serde(default)]
    pub chunks: Vec<String>,
    /// Export name within the module.
    #[serde(default)]
    pub name: String,
}

/// A producer-side pointer to a client export.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientReference {
    pub module: String,
    pub export: String,
}

impl ClientReference {
    pub fn new(module: impl Into<String>, export: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            export: export.into(),
        }
    }
}

/// module path -> export name -> metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientManifest {
    modules: HashMap<String, HashMap<String, ModuleMetadata>>,
}

impl ClientManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        module: impl Into<String>,
        export: impl Into<String>,
        metadata: ModuleMetadata,
    ) {
        self.modules
            .entry(module.into())
            .or_default()
            .insert(export.into(), metadata);
    }

    pub fn resolve(&self, reference: &ClientReference) -> Option<&ModuleMetadata> {
        self.modules
            .get(&reference.module)
            .and_then(|exports| exports.get(&reference.export))
    }

    pub fn len(&self) -> usize {
        self.modules.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
