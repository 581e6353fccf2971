use super::staging::PlannedEntry;
use crate::config::VersionedLinks;
use crate::core::{PersistenceError, ResourceKey, Result};
use crate::storage::ResourceReader;
use crate::storage::item::{ReferenceField, reference_fields, set_at_path};
use futures::future::join_all;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use tracing::{Level, event};

lazy_static! {
    /// `[base url/]Type/id[/_history/vid]`
    static ref REFERENCE_PATTERN: Regex = Regex::new(
        r"^(https?://(?:.+/)*?)?([A-Z][a-zA-Z]+)/([A-Za-z0-9\-.]{1,64})(/_history/[A-Za-z0-9\-.]{1,64})?$"
    )
    .unwrap();
}

/// Parsed literal reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReference {
    pub target: ResourceKey,
    pub is_versioned: bool,
}

pub fn parse_reference(reference: &str) -> Option<ParsedReference> {
    let captures = REFERENCE_PATTERN.captures(reference)?;
    Some(ParsedReference {
        target: ResourceKey::new(&captures[2], &captures[3]),
        is_versioned: captures.get(4).is_some(),
    })
}

/// A reference that must be pinned to a version.
#[derive(Debug, Clone)]
struct Candidate {
    entry: usize,
    field: ReferenceField,
    target: ResourceKey,
}

/// Pins registered references of a transaction to concrete versions.
///
/// Runs in two passes: every target version is resolved first, and only
/// when all of them are known are the payloads rewritten, so a failure
/// leaves every entry untouched.
pub struct ReferenceResolver<'a> {
    links: &'a VersionedLinks,
    reader: &'a ResourceReader,
    tenant_id: Option<&'a str>,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(
        links: &'a VersionedLinks,
        reader: &'a ResourceReader,
        tenant_id: Option<&'a str>,
    ) -> Self {
        Self {
            links,
            reader,
            tenant_id,
        }
    }

    pub async fn resolve(&self, entries: &mut [PlannedEntry]) -> Result<()> {
        let candidates = self.collect_candidates(entries);
        if candidates.is_empty() {
            return Ok(());
        }

        let mut versions = in_bundle_versions(entries);
        let missing: BTreeSet<ResourceKey> = candidates
            .iter()
            .map(|candidate| candidate.target.clone())
            .filter(|target| !versions.contains_key(target))
            .collect();

        let lookups = missing.iter().map(|target| async move {
            let latest = self
                .reader
                .get_latest_committed(&target.resource_type, &target.id, self.tenant_id)
                .await?;
            Ok::<_, PersistenceError>((target.clone(), latest.vid))
        });
        for lookup in join_all(lookups).await {
            let (target, vid) = lookup?;
            versions.insert(target, vid);
        }

        for candidate in candidates {
            let Some(vid) = versions.get(&candidate.target) else {
                continue;
            };
            let pinned = format!("{}/_history/{vid}", candidate.field.value);
            set_at_path(
                &mut entries[candidate.entry].resource,
                &candidate.field.path,
                pinned,
            );
        }
        Ok(())
    }

    fn collect_candidates(&self, entries: &[PlannedEntry]) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            if !entry.writes_new_version() || !self.links.covers_type(&entry.key.resource_type) {
                continue;
            }
            for field in reference_fields(&entry.resource) {
                if !self
                    .links
                    .matches(&entry.key.resource_type, &field.dotted_path())
                {
                    continue;
                }
                match parse_reference(&field.value) {
                    Some(parsed) if !parsed.is_versioned => candidates.push(Candidate {
                        entry: index,
                        field,
                        target: parsed.target,
                    }),
                    Some(_) => {}
                    None => event!(
                        Level::DEBUG,
                        reference = %field.value,
                        "reference is not a literal resource reference; left as is"
                    ),
                }
            }
        }
        candidates
    }
}

/// Versions this transaction itself is about to write.
fn in_bundle_versions(entries: &[PlannedEntry]) -> HashMap<ResourceKey, u64> {
    entries
        .iter()
        .filter(|entry| entry.writes_new_version())
        .map(|entry| (entry.key.clone(), entry.target_vid()))
        .collect()
}
