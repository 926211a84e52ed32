//! Identity matcher
//!
//! Picks the best key for the tuned channel from a pool of candidates using
//! a fixed priority chain. The first tier that has any candidate wins:
//!
//! 1. Exact identity: same service id, and same tsid/onid wherever both
//!    sides know them
//! 2. Frequency + normalized name: transponders within the tolerance window
//!    and the same normalized channel name
//! 3. Name only: same normalized name, when one side has no frequency
//!
//! "Nothing matched" and "matched, but the key is unusable" are separate
//! outcomes so the front end can tell the user which one happened.

use crate::models::{BissKey, Candidate, CandidateSource, ChannelIdentity, KeyError, KeyRecord};
use crate::store::KeyStore;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::debug;

/// Matching rules, injectable from config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Enable the exact-identity tier
    pub match_by_sid: bool,
    /// Enable the name-based tiers
    pub match_by_name: bool,
    /// Drop trailing quality words before comparing names
    pub ignore_quality_suffix: bool,
    /// Quality words stripped when `ignore_quality_suffix` is set
    pub quality_suffixes: Vec<String>,
    /// Maximum transponder distance for the frequency tier
    pub frequency_tolerance_khz: u32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            match_by_sid: true,
            match_by_name: true,
            ignore_quality_suffix: true,
            quality_suffixes: ["HD", "FHD", "UHD", "SD", "4K"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            frequency_tolerance_khz: 5_000,
        }
    }
}

/// Which tier produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    ExactIdentity,
    FrequencyAndName,
    NameOnly,
}

/// A usable key chosen for the tuned channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedKey {
    pub key: BissKey,
    pub kind: MatchKind,
    pub candidate: Candidate,
}

/// Result of [`IdentityMatcher::select`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Found(MatchedKey),
    /// No candidate matched in any tier
    NotFound,
    /// Candidates matched, but none of them carried a valid key
    InvalidKey {
        candidate: Candidate,
        kind: MatchKind,
        error: KeyError,
    },
}

/// Scores candidates against the tuned channel
#[derive(Debug, Clone, Default)]
pub struct IdentityMatcher {
    config: MatcherConfig,
}

impl IdentityMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Case-folded, alphanumeric-only channel name
    pub fn normalize_name(&self, name: &str) -> String {
        let mut words: Vec<String> = name
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        if self.config.ignore_quality_suffix {
            while words.len() > 1 {
                let last = words[words.len() - 1].as_str();
                if self
                    .config
                    .quality_suffixes
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(last))
                {
                    words.pop();
                } else {
                    break;
                }
            }
        }

        words.concat()
    }

    /// Number of identity fields confirmed, or None if the identity conflicts
    fn exact_rank(tuned: &ChannelIdentity, candidate: &Candidate) -> Option<u8> {
        let id = candidate.identity?;
        if id.program_id != tuned.program_id {
            return None;
        }

        let mut rank = 1u8;
        for (ours, theirs) in [
            (tuned.transport_stream_id, id.transport_stream_id),
            (tuned.original_network_id, id.original_network_id),
        ] {
            if ours != 0 && theirs != 0 {
                if ours != theirs {
                    return None;
                }
                rank += 1;
            }
        }
        Some(rank)
    }

    /// Select at most one candidate for `tuned`
    pub fn select(&self, tuned: &ChannelIdentity, pool: &[Candidate]) -> MatchOutcome {
        if self.config.match_by_sid {
            let mut exact: Vec<(u8, usize)> = pool
                .iter()
                .enumerate()
                .filter_map(|(i, c)| Self::exact_rank(tuned, c).map(|rank| (rank, i)))
                .collect();
            if !exact.is_empty() {
                exact.sort_by_key(|&(rank, i)| (Reverse(rank), i));
                let ordered = exact.iter().map(|&(_, i)| &pool[i]);
                return Self::resolve(ordered, MatchKind::ExactIdentity);
            }
        }

        if !self.config.match_by_name {
            return MatchOutcome::NotFound;
        }

        let tuned_name = self.normalize_name(&tuned.name);
        if tuned_name.is_empty() {
            return MatchOutcome::NotFound;
        }

        let named: Vec<(usize, &Candidate)> = pool
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.name
                    .as_deref()
                    .map(|n| self.normalize_name(n) == tuned_name)
                    .unwrap_or(false)
            })
            .collect();

        if let Some(tuned_freq) = tuned.frequency_khz {
            let mut near: Vec<(u32, usize)> = named
                .iter()
                .filter_map(|&(i, c)| {
                    let delta = c.frequency_khz?.abs_diff(tuned_freq);
                    (delta <= self.config.frequency_tolerance_khz).then_some((delta, i))
                })
                .collect();
            if !near.is_empty() {
                near.sort();
                let ordered = near.iter().map(|&(_, i)| &pool[i]);
                return Self::resolve(ordered, MatchKind::FrequencyAndName);
            }
        }

        let name_only: Vec<&Candidate> = named
            .iter()
            .filter(|(_, c)| tuned.frequency_khz.is_none() || c.frequency_khz.is_none())
            .map(|&(_, c)| c)
            .collect();
        if !name_only.is_empty() {
            return Self::resolve(name_only.into_iter(), MatchKind::NameOnly);
        }

        MatchOutcome::NotFound
    }

    /// First candidate with a valid key, or the first failure in the tier
    fn resolve<'a>(
        ordered: impl Iterator<Item = &'a Candidate>,
        kind: MatchKind,
    ) -> MatchOutcome {
        let mut first_failure: Option<(&Candidate, KeyError)> = None;

        for candidate in ordered {
            match BissKey::from_hex(&candidate.raw_key) {
                Ok(key) => {
                    debug!(?kind, line = candidate.line, "Matched candidate");
                    return MatchOutcome::Found(MatchedKey {
                        key,
                        kind,
                        candidate: candidate.clone(),
                    });
                }
                Err(e) => {
                    if first_failure.is_none() {
                        first_failure = Some((candidate, e));
                    }
                }
            }
        }

        match first_failure {
            Some((candidate, error)) => MatchOutcome::InvalidKey {
                candidate: candidate.clone(),
                kind,
                error,
            },
            None => MatchOutcome::NotFound,
        }
    }
}

/// Local store records as match candidates
pub fn candidates_from_store(store: &KeyStore) -> Vec<Candidate> {
    store
        .entries()
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| {
            entry
                .record()
                .map(|r| Candidate::from_record(r, CandidateSource::Store, i + 1))
        })
        .collect()
}

/// All local records for one service id, in store order
pub fn keys_for_program(store: &KeyStore, program_id: u16) -> Vec<&KeyRecord> {
    store
        .records()
        .filter(|r| r.identity.program_id == program_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CompositeIdentity;

    fn record_candidate(sid: u16, tsid: u16, onid: u16, key: &str, line: usize) -> Candidate {
        Candidate {
            identity: Some(CompositeIdentity::new(sid, tsid, onid)),
            name: None,
            frequency_khz: None,
            polarization: None,
            raw_key: key.to_string(),
            source: CandidateSource::Feed,
            line,
        }
    }

    fn block_candidate(name: &str, freq: Option<u32>, key: &str, line: usize) -> Candidate {
        Candidate {
            identity: None,
            name: Some(name.to_string()),
            frequency_khz: freq,
            polarization: Some('H'),
            raw_key: key.to_string(),
            source: CandidateSource::Feed,
            line,
        }
    }

    fn tuned() -> ChannelIdentity {
        ChannelIdentity::new(0x1234, 0x0010, 0x0002)
            .with_name("Nile Sport HD")
            .with_frequency_khz(11_843_000)
    }

    const KEY_A: &str = "0011223344556677";
    const KEY_B: &str = "8899AABBCCDDEEFF";

    #[test]
    fn test_normalize_name() {
        let matcher = IdentityMatcher::default();
        assert_eq!(matcher.normalize_name("Nile Sport HD"), "nilesport");
        assert_eq!(matcher.normalize_name("NILE_SPORT fhd"), "nilesport");
        assert_eq!(matcher.normalize_name("Nile-Sport 4K UHD"), "nilesport");
        assert_eq!(matcher.normalize_name("HD"), "hd");
        assert_eq!(matcher.normalize_name(""), "");
    }

    #[test]
    fn test_normalize_keeps_suffix_when_disabled() {
        let matcher = IdentityMatcher::new(MatcherConfig {
            ignore_quality_suffix: false,
            ..Default::default()
        });
        assert_eq!(matcher.normalize_name("Nile Sport HD"), "nilesporthd");
    }

    #[test]
    fn test_exact_identity_beats_frequency_and_name() {
        let pool = vec![
            block_candidate("Nile Sport", Some(11_843_000), KEY_B, 1),
            record_candidate(0x1234, 0, 0, KEY_A, 5),
        ];
        match IdentityMatcher::default().select(&tuned(), &pool) {
            MatchOutcome::Found(m) => {
                assert_eq!(m.kind, MatchKind::ExactIdentity);
                assert_eq!(m.key.to_hex(), KEY_A);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_more_specific_identity_wins() {
        let pool = vec![
            record_candidate(0x1234, 0, 0, KEY_A, 1),
            record_candidate(0x1234, 0x0010, 0x0002, KEY_B, 2),
        ];
        match IdentityMatcher::default().select(&tuned(), &pool) {
            MatchOutcome::Found(m) => assert_eq!(m.key.to_hex(), KEY_B),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_tsid_is_not_exact() {
        let pool = vec![record_candidate(0x1234, 0x0099, 0, KEY_A, 1)];
        assert_eq!(
            IdentityMatcher::default().select(&tuned(), &pool),
            MatchOutcome::NotFound
        );
    }

    #[test]
    fn test_frequency_window() {
        let matcher = IdentityMatcher::default();
        let far = vec![block_candidate("Nile Sport", Some(11_900_000), KEY_A, 1)];
        assert_eq!(matcher.select(&tuned(), &far), MatchOutcome::NotFound);

        let near = vec![
            block_candidate("Nile Sport", Some(11_846_000), KEY_A, 1),
            block_candidate("Nile Sport", Some(11_844_000), KEY_B, 2),
        ];
        match matcher.select(&tuned(), &near) {
            MatchOutcome::Found(m) => {
                assert_eq!(m.kind, MatchKind::FrequencyAndName);
                assert_eq!(m.key.to_hex(), KEY_B);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_name_only_when_frequency_unknown() {
        let pool = vec![block_candidate("nile sport", None, KEY_A, 1)];
        match IdentityMatcher::default().select(&tuned(), &pool) {
            MatchOutcome::Found(m) => assert_eq!(m.kind, MatchKind::NameOnly),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_invalid_key_distinct_from_not_found() {
        let pool = vec![record_candidate(0x1234, 0, 0, "ZZZZ", 3)];
        match IdentityMatcher::default().select(&tuned(), &pool) {
            MatchOutcome::InvalidKey { kind, candidate, .. } => {
                assert_eq!(kind, MatchKind::ExactIdentity);
                assert_eq!(candidate.line, 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_valid_key_preferred_within_tier() {
        let pool = vec![
            record_candidate(0x1234, 0, 0, "12 34", 1),
            record_candidate(0x1234, 0, 0, KEY_A, 2),
        ];
        match IdentityMatcher::default().select(&tuned(), &pool) {
            MatchOutcome::Found(m) => assert_eq!(m.candidate.line, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_disabled_tiers() {
        let pool = vec![
            record_candidate(0x1234, 0, 0, KEY_A, 1),
            block_candidate("Nile Sport", None, KEY_B, 2),
        ];
        let no_sid = IdentityMatcher::new(MatcherConfig {
            match_by_sid: false,
            ..Default::default()
        });
        match no_sid.select(&tuned(), &pool) {
            MatchOutcome::Found(m) => assert_eq!(m.kind, MatchKind::NameOnly),
            other => panic!("unexpected outcome {:?}", other),
        }

        let nothing = IdentityMatcher::new(MatcherConfig {
            match_by_sid: false,
            match_by_name: false,
            ..Default::default()
        });
        assert_eq!(nothing.select(&tuned(), &pool), MatchOutcome::NotFound);
    }
}
