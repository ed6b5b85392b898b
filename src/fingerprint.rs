//! Order-independent fingerprinting of evaluation contexts.
//!
//! The fingerprint decides whether a cached resolution still matches the caller's context. Two
//! contexts with the same key/value sets must hash identically regardless of insertion order, and
//! any change to any leaf value must change the digest. To that end every value contributes a
//! type-tagged, length-prefixed byte sequence, recursively, with map keys visited in sorted order.
use serde::{Deserialize, Serialize};

use crate::context::{ContextValue, EvaluationContext};

// One tag byte per value shape keeps e.g. Int(1), Double(1.0) and String("1") distinguishable.
const TAG_NO_TARGETING_KEY: u8 = 0x00;
const TAG_TARGETING_KEY: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_DOUBLE: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_TIMESTAMP: u8 = 0x06;
const TAG_LIST: u8 = 0x07;
const TAG_STRUCT: u8 = 0x08;

/// Deterministic hash of an [`EvaluationContext`], stored alongside cached resolutions to detect
/// staleness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextFingerprint(String);

impl ContextFingerprint {
    /// Compute the fingerprint of `context`.
    pub fn of(context: &EvaluationContext) -> ContextFingerprint {
        let mut digest = md5::Context::new();

        match context.targeting_key() {
            Some(key) => {
                digest.consume([TAG_TARGETING_KEY]);
                consume_str(&mut digest, key);
            }
            None => digest.consume([TAG_NO_TARGETING_KEY]),
        }

        digest.consume((context.attributes().len() as u64).to_be_bytes());
        for (key, value) in context.attributes() {
            consume_str(&mut digest, key);
            consume_value(&mut digest, value);
        }

        ContextFingerprint(format!("{:x}", digest.compute()))
    }

    /// The fingerprint as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContextFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn consume_str(digest: &mut md5::Context, value: &str) {
    // Length prefix so adjacent strings cannot blur together ("ab","c" vs "a","bc").
    digest.consume((value.len() as u64).to_be_bytes());
    digest.consume(value.as_bytes());
}

fn consume_value(digest: &mut md5::Context, value: &ContextValue) {
    match value {
        ContextValue::Bool(value) => {
            digest.consume([TAG_BOOL, *value as u8]);
        }
        ContextValue::Int(value) => {
            digest.consume([TAG_INT]);
            digest.consume(value.to_be_bytes());
        }
        ContextValue::Double(value) => {
            digest.consume([TAG_DOUBLE]);
            digest.consume(value.to_bits().to_be_bytes());
        }
        ContextValue::String(value) => {
            digest.consume([TAG_STRING]);
            consume_str(digest, value);
        }
        ContextValue::Timestamp(value) => {
            digest.consume([TAG_TIMESTAMP]);
            digest.consume(value.timestamp_millis().to_be_bytes());
        }
        ContextValue::List(items) => {
            digest.consume([TAG_LIST]);
            digest.consume((items.len() as u64).to_be_bytes());
            for item in items {
                consume_value(digest, item);
            }
        }
        ContextValue::Struct(fields) => {
            digest.consume([TAG_STRUCT]);
            digest.consume((fields.len() as u64).to_be_bytes());
            // BTreeMap iterates in key order, which keeps the digest insertion-order independent.
            for (key, value) in fields {
                consume_str(digest, key);
                consume_value(digest, value);
            }
        }
    }
}
