//! Trace and span identifiers.
//!
//! Ids follow the W3C Trace Context sizes: 128-bit trace ids and 64-bit
//! span ids, rendered as lowercase hex. All reconciliation state in this
//! crate is keyed by these ids rather than by call order; the bridge
//! gives no ordering guarantee, so ids are the only safe correlation key.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Id parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("invalid id length (expected {expected} hex characters, got {actual})")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid hex in id")]
    InvalidHex,

    #[error("id cannot be all zeros")]
    AllZero,
}

macro_rules! hex_id {
    ($name:ident, $bytes:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $bytes]);

        impl $name {
            /// Wrap raw bytes.
            pub fn from_bytes(bytes: [u8; $bytes]) -> Self {
                $name(bytes)
            }

            /// Raw bytes.
            pub fn as_bytes(&self) -> &[u8; $bytes] {
                &self.0
            }

            /// Parse from lowercase/uppercase hex.
            ///
            /// All-zero ids are rejected (forbidden by the W3C format and
            /// useless as correlation keys).
            pub fn parse(s: &str) -> Result<Self, IdError> {
                if s.len() != $bytes * 2 {
                    return Err(IdError::InvalidLength {
                        expected: $bytes * 2,
                        actual: s.len(),
                    });
                }
                let mut bytes = [0u8; $bytes];
                hex::decode_to_slice(s, &mut bytes).map_err(|_| IdError::InvalidHex)?;
                if bytes.iter().all(|&b| b == 0) {
                    return Err(IdError::AllZero);
                }
                Ok($name(bytes))
            }

            /// Generate a random (non-zero) id.
            pub fn random() -> Self {
                loop {
                    let bytes: [u8; $bytes] = rand::random();
                    if bytes.iter().any(|&b| b != 0) {
                        return $name(bytes);
                    }
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                $name::parse(&s).map_err(D::Error::custom)
            }
        }
    };
}

hex_id!(TraceId, 16, "128-bit trace identifier (32 hex characters).");
hex_id!(SpanId, 8, "64-bit span identifier (16 hex characters).");
