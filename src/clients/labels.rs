use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::MetadataStore;
use crate::error::Result;

/// Label name to id lookups, shared for the lifetime of one task runner.
///
/// Only configured label names are looked up, so the map never holds more
/// than the status labels plus the synced label.
#[derive(Default)]
pub struct LabelCache {
    ids: RwLock<HashMap<String, String>>,
}

impl LabelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.ids.read().get(name).cloned()
    }

    pub fn insert(&self, name: &str, id: &str) {
        self.ids.write().insert(name.to_string(), id.to_string());
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached id, else the store's label with exactly this name, else a
    /// newly created one.
    pub fn find_or_create(&self, store: &dyn MetadataStore, name: &str) -> Result<String> {
        if let Some(id) = self.get(name) {
            return Ok(id);
        }
        let id = match store.find_label(name)? {
            Some(id) => {
                debug!("Found label '{}' (id {})", name, id);
                id
            }
            None => {
                let id = store.create_label(name)?;
                info!("Created label '{}' (id {})", name, id);
                id
            }
        };
        // A concurrent writer may have won; either id names the same label
        let mut ids = self.ids.write();
        Ok(ids.entry(name.to_string()).or_insert(id).clone())
    }
}
