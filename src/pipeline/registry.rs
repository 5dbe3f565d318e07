//! Identity naming and registration with the recognition service.
//!
//! Generated subject names look like `Person <source-id> <SUFFIX>` where
//! SUFFIX is 16 characters from `A-Z0-9`. Existing registries are keyed by
//! this format, so it must not change.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::clients::{MetadataStore, RecognitionService};
use crate::error::{PipelineError, Result};
use crate::models::media::Performer;

pub const SUBJECT_PREFIX: &str = "Person";
pub const SUFFIX_LEN: usize = 16;
const SUFFIX_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

static ALIAS_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Person .*$").unwrap());

pub fn random_suffix<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}

pub fn create_subject_name(source_id: &str) -> String {
    let suffix = random_suffix(&mut rand::thread_rng(), SUFFIX_LEN);
    format!("{} {} {}", SUBJECT_PREFIX, source_id, suffix)
}

/// The registry link for a performer: the first alias matching the subject
/// pattern, else the name itself if it matches.
pub fn find_alias(performer: &Performer) -> Option<&str> {
    performer
        .alias_list
        .iter()
        .find(|a| ALIAS_PATTERN.is_match(a))
        .map(String::as_str)
        .or_else(|| ALIAS_PATTERN.is_match(&performer.name).then_some(performer.name.as_str()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Subject was already known to the registry.
    AlreadyRegistered(String),
    Registered(String),
}

/// Ensures one performer is linked to a registry subject.
///
/// `known` holds the registry's subject names and is updated as subjects are
/// added, so a sync run lists the registry once.
pub struct RegistrySync<'a> {
    store: &'a dyn MetadataStore,
    recognition: &'a dyn RecognitionService,
    known: HashSet<String>,
}

impl<'a> RegistrySync<'a> {
    pub fn load(store: &'a dyn MetadataStore, recognition: &'a dyn RecognitionService) -> Result<Self> {
        let known: HashSet<String> = recognition.list_subjects()?.into_iter().collect();
        info!("Recognition registry holds {} subject(s)", known.len());
        Ok(Self { store, recognition, known })
    }

    pub fn is_known(&self, subject: &str) -> bool {
        self.known.contains(subject)
    }

    /// Link `performer`, then mark it with `synced_label`. Performers without
    /// a subject alias get a generated one, persisted before registration.
    pub fn sync(&mut self, performer: &Performer, synced_label: &str) -> Result<SyncOutcome> {
        let alias = match find_alias(performer) {
            Some(alias) => {
                debug!("Performer {} already has subject alias '{}'", performer.id, alias);
                alias.to_string()
            }
            None => {
                let alias = create_subject_name(&performer.id);
                let mut aliases = performer.alias_list.clone();
                aliases.push(alias.clone());
                self.store.update_performer_aliases(&performer.id, &aliases)?;
                info!("Assigned subject alias '{}' to performer {} ({})", alias, performer.id, performer.name);
                alias
            }
        };

        if self.known.contains(&alias) {
            info!("Subject '{}' already registered, marking performer {} synced", alias, performer.id);
            self.store.add_performer_label(&performer.id, synced_label)?;
            return Ok(SyncOutcome::AlreadyRegistered(alias));
        }

        let Some(image_url) = performer.image_path.as_deref().filter(|p| !p.is_empty()) else {
            warn!("Performer {} ({}) has no image to register", performer.id, performer.name);
            return Err(PipelineError::NotFound(format!("image for performer {}", performer.id)));
        };
        let image = self.store.fetch_bytes(image_url)?;
        let added = self.recognition.add_subject(&alias, &image)?;
        info!("Registered subject '{}' (image_id {}) for performer {}", added.subject, added.image_id, performer.id);
        self.known.insert(alias.clone());

        self.store.add_performer_label(&performer.id, synced_label)?;
        Ok(SyncOutcome::Registered(alias))
    }
}
