//! Currently tuned channel, as reported by the tuner collaborator

use super::key_record::CompositeIdentity;
use serde::{Deserialize, Serialize};

/// Identity of the channel the user is looking at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub program_id: u16,
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    /// Service name as broadcast
    pub name: String,
    /// Tuned frequency (None when the tuner could not report it)
    pub frequency_khz: Option<u32>,
}

impl ChannelIdentity {
    pub fn new(program_id: u16, transport_stream_id: u16, original_network_id: u16) -> Self {
        Self {
            program_id,
            transport_stream_id,
            original_network_id,
            name: String::new(),
            frequency_khz: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_frequency_khz(mut self, frequency_khz: u32) -> Self {
        self.frequency_khz = Some(frequency_khz);
        self
    }

    pub fn identity(&self) -> CompositeIdentity {
        CompositeIdentity::new(
            self.program_id,
            self.transport_stream_id,
            self.original_network_id,
        )
    }

    /// Name as written into a record annotation (spaces become underscores)
    pub fn annotation_name(&self) -> String {
        self.name.trim().replace(' ', "_")
    }
}
