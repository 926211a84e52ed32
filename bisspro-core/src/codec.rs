//! Record codec
//!
//! Reads and writes the key store line format:
//!
//! ```text
//! F <SID:4 hex> <TSID:4 hex> <ONID:4 hex> <MODE:00|01> <KEY:16|32 hex> ; <annotation>
//! ```
//!
//! The short form `F <SID> <MODE> <KEY> ; <annotation>` is accepted on read
//! (tsid/onid become zero). Output is always the full form, uppercase hex.
//! The annotation is the channel name optionally followed by
//! ` @ YYYY-MM-DD HH:MM:SS`.
//!
//! Remote feeds are read leniently by [`parse_feed`]: store-format lines and
//! 4-line `{marker, name, frequency, key}` blocks are both understood.

use crate::models::key_record::escape_stamp_tail;
use crate::models::{
    Annotation, BissKey, Candidate, CandidateSource, CompositeIdentity, KeyError, KeyMode,
    KeyRecord,
};
use bisspro_common::time::ANNOTATION_STAMP_FORMAT;
use thiserror::Error;
use tracing::debug;

/// Literal marker opening every record line
pub const FIELD_MARKER: &str = "F";

/// Why a marker line could not be read as a record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Line does not start with the 'F' field marker")]
    MissingMarker,

    #[error("Expected 4 or 6 fields, found {0}")]
    FieldCount(usize),

    #[error("Invalid hex in {field} field: '{value}'")]
    InvalidHexField { field: &'static str, value: String },

    #[error("Invalid mode '{0}' (expected 00 or 01)")]
    InvalidMode(String),

    #[error("Invalid key length: {0} hex chars (expected 16 or 32)")]
    InvalidKeyLength(usize),

    #[error("Key contains non-hex characters: '{0}'")]
    NonHexKey(String),

    #[error("Mode {mode} does not match a {key_len}-char key")]
    ModeMismatch { mode: String, key_len: usize },
}

impl From<KeyError> for ParseError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::InvalidLength(len) => ParseError::InvalidKeyLength(len),
            KeyError::NonHex(text) => ParseError::NonHexKey(text),
        }
    }
}

/// How a line of the store file is treated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// A valid record
    Record(KeyRecord),
    /// Not a record at all (comment, blank, other formats)
    NotARecord,
    /// Starts with the marker but does not parse
    Malformed(ParseError),
}

/// Fields of a marker line, split but not validated
struct RawFields<'a> {
    program_id: &'a str,
    transport_stream_id: Option<&'a str>,
    original_network_id: Option<&'a str>,
    mode: &'a str,
    key: &'a str,
    annotation: &'a str,
}

fn split_fields(text: &str) -> Result<RawFields<'_>, ParseError> {
    let text = text.trim();
    let (body, annotation) = match text.split_once(';') {
        Some((body, rest)) => (body, rest),
        None => (text, ""),
    };

    let tokens: Vec<&str> = body.split_whitespace().collect();
    match tokens.first() {
        Some(marker) if marker.eq_ignore_ascii_case(FIELD_MARKER) => {}
        _ => return Err(ParseError::MissingMarker),
    }

    match tokens.len() {
        4 => Ok(RawFields {
            program_id: tokens[1],
            transport_stream_id: None,
            original_network_id: None,
            mode: tokens[2],
            key: tokens[3],
            annotation,
        }),
        6 => Ok(RawFields {
            program_id: tokens[1],
            transport_stream_id: Some(tokens[2]),
            original_network_id: Some(tokens[3]),
            mode: tokens[4],
            key: tokens[5],
            annotation,
        }),
        n => Err(ParseError::FieldCount(n)),
    }
}

fn parse_hex_u16(field: &'static str, value: &str) -> Result<u16, ParseError> {
    if value.is_empty() || value.len() > 4 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseError::InvalidHexField {
            field,
            value: value.to_string(),
        });
    }
    u16::from_str_radix(value, 16).map_err(|_| ParseError::InvalidHexField {
        field,
        value: value.to_string(),
    })
}

fn parse_identity(fields: &RawFields<'_>) -> Result<CompositeIdentity, ParseError> {
    let program_id = parse_hex_u16("SID", fields.program_id)?;
    let transport_stream_id = match fields.transport_stream_id {
        Some(v) => parse_hex_u16("TSID", v)?,
        None => 0,
    };
    let original_network_id = match fields.original_network_id {
        Some(v) => parse_hex_u16("ONID", v)?,
        None => 0,
    };
    Ok(CompositeIdentity::new(
        program_id,
        transport_stream_id,
        original_network_id,
    ))
}

/// Parse one store line
pub fn parse_line(text: &str) -> Result<KeyRecord, ParseError> {
    let fields = split_fields(text)?;
    let identity = parse_identity(&fields)?;

    let mode = KeyMode::from_code(fields.mode)
        .ok_or_else(|| ParseError::InvalidMode(fields.mode.to_string()))?;
    let key = BissKey::from_hex(fields.key)?;
    if key.mode() != mode {
        return Err(ParseError::ModeMismatch {
            mode: fields.mode.to_string(),
            key_len: fields.key.len(),
        });
    }

    Ok(KeyRecord::new(identity, key, parse_annotation(fields.annotation)))
}

/// Classify a store line without failing
pub fn classify_line(text: &str) -> LineKind {
    match parse_line(text) {
        Ok(record) => LineKind::Record(record),
        Err(ParseError::MissingMarker) => LineKind::NotARecord,
        Err(e) => LineKind::Malformed(e),
    }
}

fn parse_annotation(text: &str) -> Annotation {
    let text = text.trim();
    match Annotation::split_stamp(text) {
        Some((head, updated)) => Annotation::new(head).with_updated(updated),
        None => Annotation::new(text),
    }
}

/// Render a record as one store line (no trailing newline)
pub fn serialize(record: &KeyRecord) -> String {
    let identity = record.identity;
    let mut line = format!(
        "{} {:04X} {:04X} {:04X} {} {} ;",
        FIELD_MARKER,
        identity.program_id,
        identity.transport_stream_id,
        identity.original_network_id,
        record.mode().code(),
        record.key.to_hex(),
    );
    if !record.annotation.name.is_empty() {
        line.push(' ');
        line.push_str(&escape_stamp_tail(&record.annotation.name));
    }
    if let Some(updated) = record.annotation.updated {
        line.push_str(" @ ");
        line.push_str(&updated.format(ANNOTATION_STAMP_FORMAT).to_string());
    }
    line
}

fn is_hex(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Find a BISS key in loosely formatted text
///
/// Accepts exactly 8 or 16 consecutive two-digit hex tokens separated by
/// anything non-alphanumeric (`12 34 56 ...`, `12:34:56...`), or a single
/// 16/32-digit hex token. Returns the key as one uppercase string.
pub fn extract_hex_key(line: &str) -> Option<String> {
    fn finish(run: &str, pairs: usize) -> Option<String> {
        (pairs == 8 || pairs == 16).then(|| run.to_ascii_uppercase())
    }

    let mut run = String::new();
    let mut pairs = 0usize;

    for token in line
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        if token.len() == 2 && is_hex(token) {
            run.push_str(token);
            pairs += 1;
            continue;
        }

        if let Some(key) = finish(&run, pairs) {
            return Some(key);
        }
        run.clear();
        pairs = 0;

        if (token.len() == 16 || token.len() == 32) && is_hex(token) {
            return Some(token.to_ascii_uppercase());
        }
    }

    finish(&run, pairs)
}

/// Parse a frequency line such as `11843 H`, `11843.5V` or `12596000 V`
///
/// Values below 100000 are taken as MHz; the result is always kHz.
pub fn parse_frequency(line: &str) -> (Option<u32>, Option<char>) {
    let line = line.trim();
    let numeric_len = line
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(line.len());
    let frequency = line[..numeric_len]
        .parse::<f64>()
        .ok()
        .filter(|v| *v > 0.0)
        .map(|v| {
            if v < 100_000.0 {
                (v * 1000.0).round() as u32
            } else {
                v.round() as u32
            }
        });

    let polarization = line[numeric_len..]
        .chars()
        .find(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| matches!(c, 'H' | 'V' | 'L' | 'R'));

    (frequency, polarization)
}

/// Result of reading a remote feed or pasted text
#[derive(Debug, Clone, Default)]
pub struct FeedParse {
    /// Store-format lines that parsed cleanly (usable for merging)
    pub records: Vec<KeyRecord>,
    /// Everything usable for matching, including 4-line blocks and
    /// marker lines whose key is unusable
    pub candidates: Vec<Candidate>,
    /// Lines that could not be used at all
    pub skipped: usize,
}

fn is_block_marker(line: &str, marker: &str) -> bool {
    let stripped: String = line.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    !stripped.is_empty() && stripped.eq_ignore_ascii_case(marker)
}

/// Lenient candidate for a marker line whose key failed validation
fn lenient_candidate(line: &str, line_no: usize, source: CandidateSource) -> Option<Candidate> {
    let fields = split_fields(line).ok()?;
    let identity = parse_identity(&fields).ok()?;
    let name = parse_annotation(fields.annotation).name;
    Some(Candidate {
        identity: Some(identity),
        name: (!name.is_empty()).then_some(name),
        frequency_khz: None,
        polarization: None,
        raw_key: fields.key.to_string(),
        source,
        line: line_no,
    })
}

/// Read a feed: store-format lines and `{marker, name, frequency, key}` blocks
pub fn parse_feed(text: &str, ca_marker: &str, source: CandidateSource) -> FeedParse {
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .collect();

    let mut parsed = FeedParse::default();
    let mut i = 0;

    while i < lines.len() {
        let (line_no, line) = lines[i];

        if is_block_marker(line, ca_marker) {
            let block: Vec<usize> = (i + 1..lines.len())
                .filter(|&j| !lines[j].1.is_empty())
                .take(3)
                .collect();
            if block.len() < 3 {
                debug!(line = line_no, "Truncated feed block at end of input");
                parsed.skipped += 1;
                break;
            }

            let name = lines[block[0]].1;
            let (frequency_khz, polarization) = parse_frequency(lines[block[1]].1);
            let key_line = lines[block[2]].1;
            parsed.candidates.push(Candidate {
                identity: None,
                name: Some(name.to_string()),
                frequency_khz,
                polarization,
                raw_key: extract_hex_key(key_line).unwrap_or_else(|| key_line.to_string()),
                source,
                line: line_no,
            });
            i = block[2] + 1;
            continue;
        }

        match classify_line(line) {
            LineKind::Record(record) => {
                parsed
                    .candidates
                    .push(Candidate::from_record(&record, source, line_no));
                parsed.records.push(record);
            }
            LineKind::Malformed(e) => {
                debug!(line = line_no, error = %e, "Skipping malformed feed line");
                parsed.skipped += 1;
                if matches!(
                    e,
                    ParseError::InvalidKeyLength(_)
                        | ParseError::NonHexKey(_)
                        | ParseError::ModeMismatch { .. }
                ) {
                    if let Some(candidate) = lenient_candidate(line, line_no, source) {
                        parsed.candidates.push(candidate);
                    }
                }
            }
            LineKind::NotARecord => {}
        }
        i += 1;
    }

    parsed
}
