//! Hierarchical node position encoding.
//!
//! A node's position in its hierarchy is an ordered sequence of unsigned
//! integers (one ordinal per ancestor level). [`IndexCodec`] turns that
//! sequence into sort keys whose native ascending order matches the
//! sequence's lexicographic order, in two flavors:
//!
//! - a human-readable text form for stores that order text,
//! - a compact binary form for stores that order blobs bytewise (the
//!   durable tier keys its sibling-order index with this one).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Digits in one zero-padded text word (`u64::MAX` is 20 digits wide).
const TEXT_WORD_WIDTH: usize = 20;

/// Separator between text words. Sorts below every digit, so fixed-width
/// words compare the same joined or split.
const TEXT_SEPARATOR: char = '-';

/// Bytes in one big-endian binary word.
const BINARY_WORD_WIDTH: usize = 8;

/// Ordered position of a node among its hierarchy siblings and ancestors.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIndex(Vec<u64>);

impl NodeIndex {
    /// Build an index from ordinal parts.
    pub fn new(parts: Vec<u64>) -> Self {
        Self(parts)
    }

    /// The ordinal parts, outermost ancestor first.
    pub fn parts(&self) -> &[u64] {
        &self.0
    }

    /// Number of parts.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the index has no parts (a root position).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extend this position with a child ordinal.
    pub fn child(&self, ordinal: u64) -> Self {
        let mut parts = self.0.clone();
        parts.push(ordinal);
        Self(parts)
    }

    /// Whether `self` is a strict prefix of `other`.
    pub fn is_strict_prefix_of(&self, other: &NodeIndex) -> bool {
        self.0.len() < other.0.len() && other.0.starts_with(&self.0)
    }
}

impl From<Vec<u64>> for NodeIndex {
    fn from(parts: Vec<u64>) -> Self {
        Self(parts)
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", part)?;
            first = false;
        }
        Ok(())
    }
}

/// Error decoding an encoded index.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexCodecError {
    #[error("Invalid index word {word:?}: expected 20 decimal digits")]
    InvalidWord { word: String },

    #[error("Invalid binary index length {len}: not a multiple of 8")]
    InvalidLength { len: usize },
}

/// Encoder/decoder for [`NodeIndex`] sort keys.
pub struct IndexCodec;

impl IndexCodec {
    /// Encode as zero-padded decimal words joined with `'-'`.
    ///
    /// Text ordering of two encodings matches [`IndexCodec::compare`] for
    /// any pair where neither sequence is a strict prefix of the other.
    pub fn encode_text(index: &NodeIndex) -> String {
        let words: Vec<String> = index
            .parts()
            .iter()
            .map(|part| format!("{:0width$}", part, width = TEXT_WORD_WIDTH))
            .collect();
        words.join(&TEXT_SEPARATOR.to_string())
    }

    /// Exact inverse of [`IndexCodec::encode_text`].
    pub fn decode_text(encoded: &str) -> Result<NodeIndex, IndexCodecError> {
        if encoded.is_empty() {
            return Ok(NodeIndex::default());
        }
        let mut parts = Vec::new();
        for word in encoded.split(TEXT_SEPARATOR) {
            if word.len() != TEXT_WORD_WIDTH || !word.bytes().all(|b| b.is_ascii_digit()) {
                return Err(IndexCodecError::InvalidWord {
                    word: word.to_string(),
                });
            }
            let part = word
                .parse::<u64>()
                .map_err(|_| IndexCodecError::InvalidWord {
                    word: word.to_string(),
                })?;
            parts.push(part);
        }
        Ok(NodeIndex(parts))
    }

    /// Encode as concatenated big-endian 8-byte words.
    ///
    /// Bytewise ordering of two encodings matches [`IndexCodec::compare`]
    /// for any pair where neither sequence is a strict prefix of the other.
    pub fn encode_binary(index: &NodeIndex) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(index.len() * BINARY_WORD_WIDTH);
        for part in index.parts() {
            bytes.extend_from_slice(&part.to_be_bytes());
        }
        bytes
    }

    /// Exact inverse of [`IndexCodec::encode_binary`].
    pub fn decode_binary(encoded: &[u8]) -> Result<NodeIndex, IndexCodecError> {
        if encoded.len() % BINARY_WORD_WIDTH != 0 {
            return Err(IndexCodecError::InvalidLength {
                len: encoded.len(),
            });
        }
        let mut parts = Vec::with_capacity(encoded.len() / BINARY_WORD_WIDTH);
        for chunk in encoded.chunks_exact(BINARY_WORD_WIDTH) {
            let mut word = [0u8; BINARY_WORD_WIDTH];
            word.copy_from_slice(chunk);
            parts.push(u64::from_be_bytes(word));
        }
        Ok(NodeIndex(parts))
    }

    /// Compare element-wise up to the shorter length.
    ///
    /// An equal common prefix compares equal regardless of remaining parts;
    /// callers keep sibling keys prefix-free where order matters.
    pub fn compare(a: &NodeIndex, b: &NodeIndex) -> Ordering {
        for (x, y) in a.parts().iter().zip(b.parts()) {
            match x.cmp(y) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_text_round_trip(parts in proptest::collection::vec(any::<u64>(), 0..8)) {
            let index = NodeIndex::new(parts);
            let encoded = IndexCodec::encode_text(&index);
            prop_assert_eq!(IndexCodec::decode_text(&encoded).unwrap(), index);
        }

        #[test]
        fn prop_binary_round_trip(parts in proptest::collection::vec(any::<u64>(), 0..8)) {
            let index = NodeIndex::new(parts);
            let encoded = IndexCodec::encode_binary(&index);
            prop_assert_eq!(IndexCodec::decode_binary(&encoded).unwrap(), index);
        }

        #[test]
        fn prop_encodings_are_monotonic(
            a in proptest::collection::vec(any::<u64>(), 1..6),
            b in proptest::collection::vec(any::<u64>(), 1..6),
        ) {
            let a = NodeIndex::new(a);
            let b = NodeIndex::new(b);
            // The guarantee covers prefix-free pairs; sibling keys are kept
            // prefix-free by construction.
            prop_assume!(!a.is_strict_prefix_of(&b) && !b.is_strict_prefix_of(&a));
            let expected = IndexCodec::compare(&a, &b);
            prop_assert_eq!(
                IndexCodec::encode_text(&a).cmp(&IndexCodec::encode_text(&b)),
                expected
            );
            prop_assert_eq!(
                IndexCodec::encode_binary(&a).cmp(&IndexCodec::encode_binary(&b)),
                expected
            );
        }
    }
}
