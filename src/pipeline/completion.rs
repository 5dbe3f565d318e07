//! Per-item status labels.
//!
//! Scanned and Matched only ever get added. Complete and Partial are
//! mutually exclusive and recomputed after every run from the number of
//! faces detected and resolved.

use tracing::{debug, info, warn};

use crate::clients::labels::LabelCache;
use crate::clients::MetadataStore;
use crate::error::Result;
use crate::models::media::MediaKind;
use crate::utils::config::LabelNames;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Complete,
    Partial,
}

impl CompletionState {
    /// Complete when every detected face was resolved, including the
    /// zero-face case; Partial otherwise.
    pub fn evaluate(detected: usize, matched: usize) -> Self {
        if matched >= detected {
            CompletionState::Complete
        } else {
            CompletionState::Partial
        }
    }
}

/// Ids of the four status labels, resolved once per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLabels {
    pub scanned: String,
    pub matched: String,
    pub complete: String,
    pub partial: String,
}

impl StatusLabels {
    pub fn resolve(store: &dyn MetadataStore, cache: &LabelCache, names: &LabelNames) -> Result<Self> {
        Ok(Self {
            scanned: cache.find_or_create(store, &names.scanned)?,
            matched: cache.find_or_create(store, &names.matched)?,
            complete: cache.find_or_create(store, &names.complete)?,
            partial: cache.find_or_create(store, &names.partial)?,
        })
    }

    fn for_state(&self, state: CompletionState) -> (&str, &str) {
        match state {
            CompletionState::Complete => (&self.complete, &self.partial),
            CompletionState::Partial => (&self.partial, &self.complete),
        }
    }
}

/// Write the completion label for one item. Removing the opposite label is
/// best effort; adding the target label is not.
pub fn apply_completion(
    store: &dyn MetadataStore,
    labels: &StatusLabels,
    kind: MediaKind,
    item_id: &str,
    detected: usize,
    matched: usize,
) -> Result<CompletionState> {
    let state = CompletionState::evaluate(detected, matched);
    let (target, opposite) = labels.for_state(state);

    if let Err(e) = store.remove_label(kind, item_id, opposite) {
        warn!("Failed to remove stale completion label from {} {}: {}", kind, item_id, e);
    }
    store.add_label(kind, item_id, target)?;

    match state {
        CompletionState::Complete => info!("{} {} complete ({}/{} faces)", kind, item_id, matched, detected),
        CompletionState::Partial => debug!("{} {} partial ({}/{} faces)", kind, item_id, matched, detected),
    }
    Ok(state)
}
