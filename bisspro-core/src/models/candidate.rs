//! Match candidates gathered from the store, a remote feed or pasted text

use super::key_record::{CompositeIdentity, KeyRecord};

/// Where a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Store,
    Feed,
    Pasted,
}

/// A possible key for a channel
///
/// The key text is kept raw: the matcher must be able to report "matched,
/// but the key is unusable" separately from "nothing matched".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Structured identity, when the source carries one
    pub identity: Option<CompositeIdentity>,
    /// Channel name as given by the source
    pub name: Option<String>,
    pub frequency_khz: Option<u32>,
    /// Polarization letter (H, V, L, R) if the source gave one
    pub polarization: Option<char>,
    /// Key text exactly as found
    pub raw_key: String,
    pub source: CandidateSource,
    /// 1-based line number in the source text
    pub line: usize,
}

impl Candidate {
    pub fn from_record(record: &KeyRecord, source: CandidateSource, line: usize) -> Self {
        let name = if record.annotation.name.is_empty() {
            None
        } else {
            Some(record.annotation.name.clone())
        };
        Self {
            identity: Some(record.identity),
            name,
            frequency_khz: None,
            polarization: None,
            raw_key: record.key.to_hex(),
            source,
            line,
        }
    }
}
