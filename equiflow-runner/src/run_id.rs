//! Run identifiers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one pipeline run: `YYYYMMDD_HHMMSS-<8 hex>`.
///
/// The suffix is a BLAKE3 digest of the start instant and an input
/// fingerprint, so two runs started in the same second still differ.
/// Also used as the run's directory name, so it never contains a path
/// separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate(started_at: DateTime<Utc>, fingerprint: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&started_at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        hasher.update(fingerprint);
        let hex = hasher.finalize().to_hex();
        Self(format!("{}-{}", started_at.format("%Y%m%d_%H%M%S"), &hex[..8]))
    }

    /// Accept a run id typed by a user. `None` unless it has the generated shape.
    pub fn parse(raw: &str) -> Option<Self> {
        let (stamp, suffix) = raw.trim().split_once('-')?;
        let stamp_ok = stamp.len() == 15
            && stamp.char_indices().all(|(i, c)| {
                if i == 8 {
                    c == '_'
                } else {
                    c.is_ascii_digit()
                }
            });
        let suffix_ok = suffix.len() == 8 && suffix.chars().all(|c| c.is_ascii_hexdigit());
        (stamp_ok && suffix_ok).then(|| Self(raw.trim().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
