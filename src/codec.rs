//! Payload codecs
//!
//! Inbound payloads come from peers we do not control, so decoding never
//! fails: malformed input becomes an empty JSON object.

use bytes::Bytes;
use serde_json::{Map, Value};
use std::fmt;
use tracing::debug;

/// Encode/decode pair used for message payloads
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Bytes;
    fn decode(&self, data: &[u8]) -> Value;
}

/// Default JSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Bytes {
        // serializing a Value cannot fail
        Bytes::from(serde_json::to_vec(value).unwrap_or_default())
    }

    fn decode(&self, data: &[u8]) -> Value {
        match serde_json::from_slice(data) {
            Ok(value) => value,
            Err(e) => {
                debug!(target: "codec", "Malformed payload ({} bytes): {}", data.len(), e);
                Value::Object(Map::new())
            }
        }
    }
}

type Encoder = Box<dyn Fn(&Value) -> Bytes + Send + Sync>;
type Decoder = Box<dyn Fn(&[u8]) -> Value + Send + Sync>;

/// Codec built from a pair of closures
pub struct FnCodec {
    encoder: Encoder,
    decoder: Decoder,
}

impl FnCodec {
    pub fn new<E, D>(encoder: E, decoder: D) -> Self
    where
        E: Fn(&Value) -> Bytes + Send + Sync + 'static,
        D: Fn(&[u8]) -> Value + Send + Sync + 'static,
    {
        Self {
            encoder: Box::new(encoder),
            decoder: Box::new(decoder),
        }
    }
}

impl Codec for FnCodec {
    fn encode(&self, value: &Value) -> Bytes {
        (self.encoder)(value)
    }

    fn decode(&self, data: &[u8]) -> Value {
        (self.decoder)(data)
    }
}

impl fmt::Debug for FnCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCodec").finish_non_exhaustive()
    }
}
