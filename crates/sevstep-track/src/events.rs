//! The page-fault [`Event`] and its JSON line encoding.
//!
//! An [`Event`] is built either from a [`PageFaultRecord`] handed out by the
//! tracker, or from one JSON line of a previously captured log (see
//! [`crate::parser`]).  It is never modified after construction.
//!
//! # JSON encoding
//!
//! ```text
//! {"id":4,"faulted_gpa":985686016,"error_code":20,"have_rip_info":true,
//!  "rip":139969225768391,"monitor_gpa":959684384,
//!  "content":"7e6927d61379d2620800000030000000",
//!  "timestamp":"2022-05-17T09:12:44.123456789Z",
//!  "have_retired_instructions":false,"retired_instructions":0}
//! ```
//!
//! `monitor_gpa` and `content` are omitted when absent.  `content` is
//! lowercase hex without prefix on output; on input a `0x` prefix and a
//! pair of literal quotes inside the string are tolerated, since logs from
//! older tools were written that way.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sevstep_protocol::PageFaultRecord;
use std::fmt;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Event
// ═══════════════════════════════════════════════════════════════════════

/// One guest page-fault notification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    /// Assigned by the tracker.  Used for acknowledgement and ordering.
    pub id: u64,
    /// Guest-physical address that faulted.
    pub faulted_gpa: u64,
    /// `PFERR_*` bits, see [`crate::pf_error`].
    pub error_code: u32,
    /// The tracker could resolve the faulting RIP.  Requires a plain VM or
    /// a debug-enabled SEV-ES guest.
    pub have_rip_info: bool,
    /// Undefined unless `have_rip_info`; prefer [`Event::rip`].
    pub rip: u64,
    /// Page monitored for access tracking when this fault fired.
    #[serde(skip_serializing_if = "gpa_is_absent", with = "nonzero_gpa")]
    pub monitor_gpa: Option<u64>,
    /// Data captured from `monitor_gpa`.
    #[serde(skip_serializing_if = "content_is_absent", with = "hex_content")]
    pub content: Option<Vec<u8>>,
    /// Host time at which the tracker generated the event.
    pub timestamp: DateTime<Utc>,
    pub have_retired_instructions: bool,
    /// Guest instructions retired since the previous event (by id).
    /// Undefined unless `have_retired_instructions`.
    pub retired_instructions: u64,
}

impl Event {
    /// The faulting instruction pointer, if the tracker resolved it.
    pub fn rip(&self) -> Option<u64> {
        self.have_rip_info.then_some(self.rip)
    }

    /// Retired guest instructions since the previous event, if measured.
    pub fn retired_instructions(&self) -> Option<u64> {
        self.have_retired_instructions
            .then_some(self.retired_instructions)
    }

    /// True iff this event carries access-tracking data for a monitored page.
    ///
    /// `Some(0)` counts as absent, same as on the wire.
    pub fn has_access_data(&self) -> bool {
        matches!(self.monitor_gpa, Some(gpa) if gpa != 0)
    }

    /// Encode as a single JSON line (no trailing newline).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&PageFaultRecord> for Event {
    fn from(rec: &PageFaultRecord) -> Self {
        let nanos = i64::try_from(rec.ns_timestamp).unwrap_or(i64::MAX);
        Self {
            id: rec.id,
            faulted_gpa: rec.faulted_gpa,
            error_code: rec.error_code,
            have_rip_info: rec.have_rip_info,
            rip: rec.rip,
            monitor_gpa: None,
            content: None,
            timestamp: Utc.timestamp_nanos(nanos),
            have_retired_instructions: rec.have_retired_instructions,
            retired_instructions: rec.retired_instructions,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID {}, FaultedGPA {:x}, HaveRip {}, RIP {:x}, Timestamp {} Retired Instructions ",
            self.id,
            self.faulted_gpa,
            self.have_rip_info,
            self.rip,
            self.timestamp.format("%b %e %H:%M:%S%.9f"),
        )?;
        match self.retired_instructions() {
            Some(n) => write!(f, "{}", n),
            None => f.write_str("not measured"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Hex payload codec
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("odd number of hex digits ({0})")]
    OddLength(usize),

    #[error("invalid hex digit {byte:#04x} at index {index}")]
    InvalidDigit { index: usize, byte: u8 },
}

/// Lowercase hex, no prefix, no separators.
pub fn encode_hex_payload(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Writing to a String cannot fail.
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Decode a hex payload.
///
/// One pair of surrounding `"` and then one `0x` prefix are stripped
/// first, so `7e69`, `0x7e69`, `"7e69"` and `"0x7e69"` all decode to the
/// same bytes.  Both digit cases are accepted.
pub fn decode_hex_payload(s: &str) -> Result<Vec<u8>, HexError> {
    let s = s
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(s);
    let s = s.strip_prefix("0x").unwrap_or(s);

    let digits = s.as_bytes();
    if digits.len() % 2 != 0 {
        return Err(HexError::OddLength(digits.len()));
    }

    let nibble = |index: usize| -> Result<u8, HexError> {
        let byte = digits[index];
        match byte {
            b'0'..=b'9' => Ok(byte - b'0'),
            b'a'..=b'f' => Ok(byte - b'a' + 10),
            b'A'..=b'F' => Ok(byte - b'A' + 10),
            _ => Err(HexError::InvalidDigit { index, byte }),
        }
    };

    (0..digits.len())
        .step_by(2)
        .map(|i| Ok((nibble(i)? << 4) | nibble(i + 1)?))
        .collect()
}

fn gpa_is_absent(gpa: &Option<u64>) -> bool {
    gpa.map_or(true, |g| g == 0)
}

fn content_is_absent(content: &Option<Vec<u8>>) -> bool {
    content.as_ref().map_or(true, |c| c.is_empty())
}

mod hex_content {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(content: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match content {
            Some(bytes) => s.serialize_str(&super::encode_hex_payload(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        let bytes = super::decode_hex_payload(&raw)
            .map_err(|e| D::Error::custom(format!("invalid content payload: {e}")))?;
        Ok((!bytes.is_empty()).then_some(bytes))
    }
}

mod nonzero_gpa {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(gpa: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match gpa {
            Some(gpa) => s.serialize_u64(*gpa),
            None => s.serialize_none(),
        }
    }

    /// Zero is the "absent" sentinel used by the tracker.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.filter(|gpa| *gpa != 0))
    }
}
