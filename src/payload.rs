//! Message serialization for the typed call helpers.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::Result;

/// Turns typed messages into payload bytes and back.
pub trait Codec: Send + Sync + 'static {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON payloads via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Code, Error};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        name: String,
    }

    #[test]
    fn test_json_codec() {
        let bytes = JsonCodec
            .serialize(&Greeting {
                name: "tether".into(),
            })
            .unwrap();
        assert_eq!(bytes.as_ref(), br#"{"name":"tether"}"#);

        let back: Greeting = JsonCodec.deserialize(&bytes).unwrap();
        assert_eq!(back.name, "tether");
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let err = JsonCodec.deserialize::<Greeting>(b"not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(err.code(), Code::Internal);
    }
}
