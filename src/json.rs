//! JSON payload helpers.
//!
//! The cache itself only moves bytes; these helpers are for callers caching
//! serde types.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{error::Result, sentinel::is_negative};

pub fn encode<T: Serialize>(value: &T) -> serde_json::Result<Bytes> {
    serde_json::to_vec(value).map(Bytes::from)
}

/// Decode a cached payload. A negative entry decodes to `None`.
pub fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<Option<T>> {
    if is_negative(raw) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::{CacheError, sentinel::NEGATIVE_VALUE};

    #[test]
    fn test_decode_negative() {
        let value: Option<HashMap<String, String>> = decode(NEGATIVE_VALUE).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_encode_decode() {
        let settings = HashMap::from([("locale".to_owned(), "sv".to_owned())]);
        let raw = encode(&settings).unwrap();
        let back: Option<HashMap<String, String>> = decode(&raw).unwrap();
        assert_eq!(back, Some(settings));
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode::<u32>(b"{not json").unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
