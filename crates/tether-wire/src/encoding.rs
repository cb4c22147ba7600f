use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::WireError;

/// Body serialization format bound to a magic entry.
///
/// Raw is the pass-through format for pre-serialized payloads; it refuses to
/// encode or decode structured values. Hosts that need another format (e.g.
/// Protobuf) register a magic with their own framing outside this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// serde_json, human-readable.
    Json,
    /// No serialization; bytes pass through as-is.
    Raw,
}

impl Encoding {
    /// Encode a value into body bytes.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, WireError> {
        match self {
            Encoding::Json => serde_json::to_vec(value).map_err(WireError::Encode),
            Encoding::Raw => Err(WireError::RawUnsupported),
        }
    }

    /// Decode body bytes into a value.
    pub fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, WireError> {
        match self {
            Encoding::Json => serde_json::from_slice(buf).map_err(WireError::Decode),
            Encoding::Raw => Err(WireError::RawUnsupported),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Json => write!(f, "json"),
            Encoding::Raw => write!(f, "raw"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        id: u32,
        name: String,
    }

    #[test]
    fn json_round_trip() {
        let probe = Probe {
            id: 7,
            name: "ping".to_string(),
        };
        let bytes = Encoding::Json.encode(&probe).unwrap();
        let back: Probe = Encoding::Json.decode(&bytes).unwrap();
        assert_eq!(probe, back);
    }

    #[test]
    fn json_rejects_garbage() {
        let result: Result<Probe, _> = Encoding::Json.decode(b"{nope");
        assert!(result.is_err());
    }

    #[test]
    fn raw_refuses_structured_values() {
        let probe = Probe {
            id: 1,
            name: "x".to_string(),
        };
        assert!(matches!(
            Encoding::Raw.encode(&probe),
            Err(WireError::RawUnsupported)
        ));
        assert!(matches!(
            Encoding::Raw.decode::<Probe>(b"1234"),
            Err(WireError::RawUnsupported)
        ));
    }
}
