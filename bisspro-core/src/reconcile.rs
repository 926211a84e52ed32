//! Reconciliation engine
//!
//! All store mutations go through here. Every operation keeps the store free
//! of duplicate composite identities: a write for an identity that already
//! exists replaces the record where it stands instead of appending.

use crate::codec;
use crate::error::Result;
use crate::models::{Annotation, BissKey, CompositeIdentity, KeyRecord};
use crate::store::{KeyStore, StoreEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

/// Result of [`upsert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated { previous: KeyRecord },
    /// Identity, key and name already present; store untouched
    Unchanged,
}

impl UpsertOutcome {
    /// True when the store content changed
    pub fn is_change(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

/// Insert or replace the record for `identity`
pub fn upsert(
    store: &mut KeyStore,
    identity: CompositeIdentity,
    key_hex: &str,
    annotation: Annotation,
) -> Result<UpsertOutcome> {
    let key = BissKey::from_hex(key_hex)?;
    let record = KeyRecord::new(identity, key, annotation);
    Ok(upsert_record(store, record))
}

/// [`upsert`] for an already validated record
pub fn upsert_record(store: &mut KeyStore, record: KeyRecord) -> UpsertOutcome {
    let identity = record.identity;
    match store.position_of(&identity) {
        Some(pos) => {
            let entries = store.entries_mut();
            if let StoreEntry::Record(existing) = &entries[pos] {
                if existing.same_content(&record) {
                    debug!(%identity, "Record unchanged");
                    return UpsertOutcome::Unchanged;
                }
            }
            let previous = std::mem::replace(&mut entries[pos], StoreEntry::Record(record));
            info!(%identity, position = pos, "Updated key record");
            match previous {
                StoreEntry::Record(previous) => UpsertOutcome::Updated { previous },
                // position_of only returns record entries
                StoreEntry::Raw(_) => UpsertOutcome::Added,
            }
        }
        None => {
            store.entries_mut().push(StoreEntry::Record(record));
            info!(%identity, "Added key record");
            UpsertOutcome::Added
        }
    }
}

/// What to do when a merged record's identity is already in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Incoming record replaces the existing one in place
    #[default]
    Replace,
    /// Existing record is kept
    Skip,
}

/// Counts produced by [`merge_batch`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Appended as new identities
    pub added: usize,
    /// Replaced an existing record with the same identity
    pub replaced: usize,
    /// Exact line already present
    pub duplicates: usize,
    /// Identity collided and the policy kept the existing record
    pub collisions_skipped: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.added + self.replaced > 0
    }
}

/// Merge a batch of records (remote feed or pasted text) into the store
///
/// A record whose serialized line already exists is skipped. A record whose
/// identity collides is handled according to `policy`, except that a later
/// record in the same batch always wins over an earlier one.
pub fn merge_batch<I>(store: &mut KeyStore, batch: I, policy: CollisionPolicy) -> MergeReport
where
    I: IntoIterator<Item = KeyRecord>,
{
    let mut report = MergeReport::default();
    let mut lines: HashSet<String> = store.records().map(codec::serialize).collect();
    let mut from_batch: HashSet<CompositeIdentity> = HashSet::new();

    for record in batch {
        let line = codec::serialize(&record);
        if lines.contains(&line) {
            report.duplicates += 1;
            continue;
        }

        let identity = record.identity;
        match store.position_of(&identity) {
            Some(pos) => {
                let earlier_in_batch = from_batch.contains(&identity);
                if !earlier_in_batch && policy == CollisionPolicy::Skip {
                    debug!(%identity, "Identity collision, keeping existing record");
                    report.collisions_skipped += 1;
                    continue;
                }

                let entries = store.entries_mut();
                if let StoreEntry::Record(old) = &entries[pos] {
                    lines.remove(&codec::serialize(old));
                }
                entries[pos] = StoreEntry::Record(record);
                if !earlier_in_batch {
                    report.replaced += 1;
                }
            }
            None => {
                store.entries_mut().push(StoreEntry::Record(record));
                report.added += 1;
            }
        }
        lines.insert(line);
        from_batch.insert(identity);
    }

    info!(
        added = report.added,
        replaced = report.replaced,
        duplicates = report.duplicates,
        skipped = report.collisions_skipped,
        "Merged batch"
    );
    report
}

/// Selects the record [`remove`] deletes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveTarget {
    Identity(CompositeIdentity),
    /// Any record for this service id
    ProgramId(u16),
    /// Case-insensitive substring of the channel name
    Annotation(String),
    /// Record with the same identity, key and name
    Record(KeyRecord),
}

impl RemoveTarget {
    fn matches(&self, record: &KeyRecord) -> bool {
        match self {
            RemoveTarget::Identity(identity) => &record.identity == identity,
            RemoveTarget::ProgramId(sid) => record.identity.program_id == *sid,
            RemoveTarget::Annotation(text) => {
                let needle = text.trim().to_lowercase();
                !needle.is_empty() && record.annotation.name.to_lowercase().contains(&needle)
            }
            RemoveTarget::Record(other) => record.same_content(other),
        }
    }

    /// Human-readable form for error messages
    pub fn describe(&self) -> String {
        match self {
            RemoveTarget::Identity(identity) => identity.to_string(),
            RemoveTarget::ProgramId(sid) => format!("SID {:04X}", sid),
            RemoveTarget::Annotation(text) => format!("'{}'", text),
            RemoveTarget::Record(record) => record.identity.to_string(),
        }
    }
}

/// Remove the first record matching `target`
///
/// Only one record is removed per call even if several match.
pub fn remove(store: &mut KeyStore, target: &RemoveTarget) -> Option<KeyRecord> {
    let pos = store
        .entries()
        .iter()
        .position(|e| e.record().map(|r| target.matches(r)).unwrap_or(false))?;

    match store.entries_mut().remove(pos) {
        StoreEntry::Record(record) => {
            info!(identity = %record.identity, position = pos, "Removed key record");
            Some(record)
        }
        StoreEntry::Raw(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_line;

    const STORE: &str = "\
# header
F 0001 0000 0000 00 0011223344556677 ; One
F 0002 0000 0000 00 1111111111111111 ; Two Sport
F 0003 0000 0000 00 2222222222222222 ; Three Sport
";

    fn store() -> KeyStore {
        KeyStore::from_text("/tmp/SoftCam.Key", STORE)
    }

    fn rec(line: &str) -> KeyRecord {
        parse_line(line).unwrap()
    }

    fn identities(store: &KeyStore) -> Vec<CompositeIdentity> {
        store.records().map(|r| r.identity).collect()
    }

    #[test]
    fn test_upsert_appends_new_identity() {
        let mut store = store();
        let outcome = upsert(
            &mut store,
            CompositeIdentity::new(4, 0, 0),
            "AAAAAAAAAAAAAAAA",
            Annotation::new("Four"),
        )
        .unwrap();
        assert_eq!(outcome, UpsertOutcome::Added);
        assert_eq!(store.entries().len(), 5);
        assert_eq!(identities(&store).last(), Some(&CompositeIdentity::new(4, 0, 0)));
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut store = store();
        let outcome = upsert(
            &mut store,
            CompositeIdentity::program_only(2),
            "ffffffffffffffff",
            Annotation::new("Two New"),
        )
        .unwrap();
        match outcome {
            UpsertOutcome::Updated { previous } => assert_eq!(previous.annotation.name, "Two Sport"),
            other => panic!("unexpected outcome {:?}", other),
        }
        let updated = store.entries()[2].record().unwrap();
        assert_eq!(updated.key.to_hex(), "FFFFFFFFFFFFFFFF");
        assert_eq!(store.record_count(), 3);
    }

    #[test]
    fn test_upsert_rejects_bad_key() {
        let mut store = store();
        let err = upsert(
            &mut store,
            CompositeIdentity::program_only(9),
            "123",
            Annotation::default(),
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidKeyLength(3)));
        assert_eq!(store, self::store());
    }

    #[test]
    fn test_upsert_unchanged_ignores_timestamp() {
        let mut store = store();
        let stamp = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let outcome = upsert(
            &mut store,
            CompositeIdentity::program_only(1),
            "0011223344556677",
            Annotation::new("One").with_updated(stamp),
        )
        .unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert!(!outcome.is_change());
        assert_eq!(store, self::store());
    }

    #[test]
    fn test_merge_skips_exact_lines_and_appends_new() {
        let mut store = store();
        let report = merge_batch(
            &mut store,
            vec![
                rec("F 0001 0000 0000 00 0011223344556677 ; One"),
                rec("F 0009 0000 0000 00 9999999999999999 ; Nine"),
            ],
            CollisionPolicy::Replace,
        );
        assert_eq!(report.added, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(store.entries().len(), 5);
    }

    #[test]
    fn test_merge_collision_policies() {
        let incoming = rec("F 0002 0000 0000 00 ABABABABABABABAB ; Two Sport");

        let mut replaced = store();
        let report = merge_batch(&mut replaced, vec![incoming.clone()], CollisionPolicy::Replace);
        assert_eq!(report.replaced, 1);
        assert_eq!(replaced.entries()[2].record(), Some(&incoming));

        let mut kept = store();
        let report = merge_batch(&mut kept, vec![incoming], CollisionPolicy::Skip);
        assert_eq!(report.collisions_skipped, 1);
        assert!(!report.changed());
        assert_eq!(kept, store());
    }

    #[test]
    fn test_merge_later_batch_entry_wins() {
        let mut store = store();
        let report = merge_batch(
            &mut store,
            vec![
                rec("F 0007 0000 0000 00 1234123412341234 ; First"),
                rec("F 0007 0000 0000 00 5678567856785678 ; Second"),
            ],
            CollisionPolicy::Skip,
        );
        assert_eq!(report.added, 1);
        assert_eq!(report.replaced, 0);
        assert_eq!(report.collisions_skipped, 0);
        let last = store.records().last().unwrap();
        assert_eq!(last.annotation.name, "Second");
    }

    #[test]
    fn test_merge_keeps_identities_unique() {
        let mut store = store();
        merge_batch(
            &mut store,
            vec![
                rec("F 0002 0000 0000 00 ABABABABABABABAB ; X"),
                rec("F 0002 0000 0000 00 CDCDCDCDCDCDCDCD ; Y"),
                rec("F 0002 0000 0000 00 ABABABABABABABAB ; X"),
            ],
            CollisionPolicy::Replace,
        );
        let ids = identities(&store);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
    }

    #[test]
    fn test_remove_by_annotation_removes_first_only() {
        let mut store = store();
        let target = RemoveTarget::Annotation("sport".to_string());

        let removed = remove(&mut store, &target).unwrap();
        assert_eq!(removed.identity.program_id, 2);
        assert_eq!(store.record_count(), 2);

        let removed = remove(&mut store, &target).unwrap();
        assert_eq!(removed.identity.program_id, 3);
        assert!(remove(&mut store, &target).is_none());
    }

    #[test]
    fn test_remove_by_identity_and_record() {
        let mut store = store();
        assert!(remove(&mut store, &RemoveTarget::Identity(CompositeIdentity::new(1, 5, 5))).is_none());
        assert!(remove(&mut store, &RemoveTarget::ProgramId(1)).is_some());

        let three = rec("F 0003 0000 0000 00 2222222222222222 ; Three Sport");
        assert_eq!(remove(&mut store, &RemoveTarget::Record(three.clone())), Some(three));
        assert_eq!(store.entries()[0], StoreEntry::Raw("# header".to_string()));
    }
}
