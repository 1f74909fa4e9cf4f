//! Loaded-script catalog.
//!
//! Replaced wholesale from each `scripts` response; keeps no history.

use serde::Deserialize;
use std::collections::HashMap;

/// One entry of a `scripts` response body. Anonymous (eval'd) scripts have
/// no name and are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: u8,
}

#[derive(Debug, Default)]
pub struct ScriptCatalog {
    scripts: HashMap<String, u8>,
}

impl ScriptCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table from a `scripts` response body.
    pub fn replace_all(&mut self, entries: &[ScriptInfo]) {
        self.scripts.clear();
        for entry in entries {
            if let Some(name) = &entry.name {
                self.scripts.insert(name.clone(), entry.kind);
            }
        }
    }

    /// False for names never reported by the debuggee.
    pub fn exists(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }

    pub fn clear(&mut self) {
        self.scripts.clear();
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}
