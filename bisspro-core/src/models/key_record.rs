//! Key store record types

use bisspro_common::time::ANNOTATION_STAMP_FORMAT;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Key validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Key text is not 16 or 32 hex characters long
    #[error("Invalid key length: {0} hex chars (expected 16 or 32)")]
    InvalidLength(usize),

    /// Key text contains a non-hex character
    #[error("Key contains non-hex characters: {0}")]
    NonHex(String),
}

/// `(program_id, transport_stream_id, original_network_id)`
///
/// Zero in the tsid/onid slots means "unknown"; sources frequently omit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeIdentity {
    pub program_id: u16,
    pub transport_stream_id: u16,
    pub original_network_id: u16,
}

impl CompositeIdentity {
    pub fn new(program_id: u16, transport_stream_id: u16, original_network_id: u16) -> Self {
        Self {
            program_id,
            transport_stream_id,
            original_network_id,
        }
    }

    /// Identity known only by service id
    pub fn program_only(program_id: u16) -> Self {
        Self::new(program_id, 0, 0)
    }
}

impl fmt::Display for CompositeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}/{:04X}/{:04X}",
            self.program_id, self.transport_stream_id, self.original_network_id
        )
    }
}

/// Key layout, always implied by key length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyMode {
    /// One 8-byte key (`00`)
    SingleKey,
    /// Two 8-byte keys (`01`)
    DualKey,
}

impl KeyMode {
    /// Two-digit code used in the store line
    pub fn code(self) -> &'static str {
        match self {
            KeyMode::SingleKey => "00",
            KeyMode::DualKey => "01",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "00" => Some(KeyMode::SingleKey),
            "01" => Some(KeyMode::DualKey),
            _ => None,
        }
    }

    /// Number of raw key bytes for this mode
    pub fn byte_len(self) -> usize {
        match self {
            KeyMode::SingleKey => 8,
            KeyMode::DualKey => 16,
        }
    }
}

/// Raw BISS key material (8 or 16 bytes)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BissKey(Vec<u8>);

impl BissKey {
    /// Parse 16 or 32 hex characters, any case
    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        let text = text.trim();
        let len = text.chars().count();
        if len != 16 && len != 32 {
            return Err(KeyError::InvalidLength(len));
        }
        if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KeyError::NonHex(text.to_string()));
        }

        let bytes = text
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                // Both bytes were checked as ASCII hex above
                let s = std::str::from_utf8(pair).unwrap_or("00");
                u8::from_str_radix(s, 16).unwrap_or(0)
            })
            .collect();
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        match bytes.len() {
            8 | 16 => Ok(Self(bytes.to_vec())),
            n => Err(KeyError::InvalidLength(n * 2)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn mode(&self) -> KeyMode {
        if self.0.len() == 16 {
            KeyMode::DualKey
        } else {
            KeyMode::SingleKey
        }
    }

    /// Uppercase hex rendering as written to the store
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

// Keys are secrets: keep them out of debug logs.
impl fmt::Debug for BissKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BissKey({:?}, {} bytes)", self.mode(), self.0.len())
    }
}

/// Free-text channel name with optional update time
///
/// A name never ends in ` @ <stamp>`: that tail is the update-time syntax on
/// disk, so [`Annotation::new`] rewrites such an `@` to `at`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Annotation {
    pub name: String,
    pub updated: Option<NaiveDateTime>,
}

impl Annotation {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name
            .into()
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        Self {
            name: escape_stamp_tail(name.trim()),
            updated: None,
        }
    }

    /// Split `text` into name and update time if it ends in ` @ <stamp>`
    pub fn split_stamp(text: &str) -> Option<(&str, NaiveDateTime)> {
        stamp_tail(text).map(|(idx, updated)| (&text[..idx], updated))
    }

    pub fn with_updated(mut self, at: NaiveDateTime) -> Self {
        self.updated = Some(at);
        self
    }
}

/// Byte offset of the `@` and the parsed time of a trailing ` @ <stamp>`
fn stamp_tail(text: &str) -> Option<(usize, NaiveDateTime)> {
    let idx = text.rfind('@')?;
    let head = &text[..idx];
    if !(head.is_empty() || head.ends_with(' ')) {
        return None;
    }
    NaiveDateTime::parse_from_str(text[idx + 1..].trim(), ANNOTATION_STAMP_FORMAT)
        .ok()
        .map(|updated| (idx, updated))
}

pub(crate) fn escape_stamp_tail(name: &str) -> String {
    let mut name = name.to_string();
    if let Some((idx, _)) = stamp_tail(&name) {
        name.replace_range(idx..idx + 1, "at");
    }
    name
}

/// One active line of the key store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub identity: CompositeIdentity,
    pub key: BissKey,
    pub annotation: Annotation,
}

impl KeyRecord {
    pub fn new(identity: CompositeIdentity, key: BissKey, annotation: Annotation) -> Self {
        Self {
            identity,
            key,
            annotation,
        }
    }

    pub fn mode(&self) -> KeyMode {
        self.key.mode()
    }

    /// Same identity, key material and channel name (timestamp ignored)
    pub fn same_content(&self, other: &KeyRecord) -> bool {
        self.identity == other.identity
            && self.key == other.key
            && self.annotation.name == other.annotation.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_hex_single() {
        let key = BissKey::from_hex("0011223344556677").unwrap();
        assert_eq!(key.mode(), KeyMode::SingleKey);
        assert_eq!(key.as_bytes().len(), 8);
        assert_eq!(key.to_hex(), "0011223344556677");
    }

    #[test]
    fn test_key_from_hex_dual_mixed_case() {
        let key = BissKey::from_hex("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(key.mode(), KeyMode::DualKey);
        assert_eq!(key.to_hex(), "00112233445566778899AABBCCDDEEFF");
    }

    #[test]
    fn test_key_rejects_bad_length() {
        assert_eq!(
            BissKey::from_hex("0011223344"),
            Err(KeyError::InvalidLength(10))
        );
    }

    #[test]
    fn test_key_length_counts_characters() {
        // 8 chars, 16 bytes
        assert_eq!(
            BissKey::from_hex("ÄÄÄÄÄÄÄÄ"),
            Err(KeyError::InvalidLength(8))
        );
        // 16 chars, more bytes: length passes, content does not
        assert!(matches!(
            BissKey::from_hex("ÄÄ11223344556677"),
            Err(KeyError::NonHex(_))
        ));
    }

    #[test]
    fn test_key_rejects_non_hex() {
        assert!(matches!(
            BissKey::from_hex("00112233445566GG"),
            Err(KeyError::NonHex(_))
        ));
    }

    #[test]
    fn test_key_debug_hides_material() {
        let key = BissKey::from_hex("0011223344556677").unwrap();
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("0011"));
    }

    #[test]
    fn test_identity_display() {
        let identity = CompositeIdentity::new(0x1234, 0x00AB, 1);
        assert_eq!(identity.to_string(), "1234/00AB/0001");
    }

    #[test]
    fn test_mode_codes() {
        assert_eq!(KeyMode::from_code("00"), Some(KeyMode::SingleKey));
        assert_eq!(KeyMode::from_code("01"), Some(KeyMode::DualKey));
        assert_eq!(KeyMode::from_code("02"), None);
        assert_eq!(KeyMode::DualKey.code(), "01");
        assert_eq!(KeyMode::DualKey.byte_len(), 16);
    }

    #[test]
    fn test_annotation_trims_name() {
        assert_eq!(Annotation::new("  Nile Drama ").name, "Nile Drama");
    }
}
