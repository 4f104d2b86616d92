//! Negative-value sentinel
//!
//! A key whose source confirmed there is nothing to load is cached with the
//! reserved payload `_n`, so repeated lookups stop at the cache instead of
//! reaching the source. Any stored payload byte-equal to the sentinel is read
//! back as "confirmed absent"; real data must never use these two bytes.

use bytes::Bytes;

/// Wire value of a negative entry
pub const NEGATIVE_VALUE: &[u8] = b"_n";

/// Whether `raw` is the negative-value sentinel
pub fn is_negative(raw: &[u8]) -> bool {
    raw == NEGATIVE_VALUE
}

pub(crate) fn negative() -> Bytes {
    Bytes::from_static(NEGATIVE_VALUE)
}

/// Outcome of reading a single layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Real data
    Hit(Bytes),
    /// The sentinel: the source was asked and had nothing
    Negative,
    /// Nothing stored
    Miss,
}

impl Lookup {
    /// Classify a raw payload read from a layer; empty payloads count as misses
    pub(crate) fn from_raw(raw: Bytes) -> Self {
        if raw.is_empty() {
            Lookup::Miss
        } else if is_negative(&raw) {
            Lookup::Negative
        } else {
            Lookup::Hit(raw)
        }
    }

    /// Found real data (a negative entry is not trusted as data)
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    /// The layer answered the query, either with data or with the sentinel
    pub fn is_answer(&self) -> bool {
        !matches!(self, Lookup::Miss)
    }

    /// Payload as seen by callers: the data, the sentinel bytes, or nothing
    pub fn into_payload(self) -> Option<Bytes> {
        match self {
            Lookup::Hit(data) => Some(data),
            Lookup::Negative => Some(negative()),
            Lookup::Miss => None,
        }
    }
}
