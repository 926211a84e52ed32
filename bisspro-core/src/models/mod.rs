//! Data models for the key store and matcher

pub mod candidate;
pub mod channel;
pub mod key_record;

pub use candidate::{Candidate, CandidateSource};
pub use channel::ChannelIdentity;
pub use key_record::{Annotation, BissKey, CompositeIdentity, KeyError, KeyMode, KeyRecord};
