//! Context entries, tiers and placement policy

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec;
use crate::config::ContextConfig;
use crate::error::Result;

/// Storage tier of a context entry, ordered from hottest to coldest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextTier {
    Hot,
    Warm,
    Cold,
    Archive,
}

impl ContextTier {
    /// Tiers whose entries are always stored compressed
    pub fn requires_compression(&self) -> bool {
        matches!(self, Self::Cold | Self::Archive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
            Self::Archive => "archive",
        }
    }
}

impl fmt::Display for ContextTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored form of a payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum Payload {
    /// Plain JSON value
    Inline { value: Value },

    /// Gzip-compressed JSON bytes
    Gzip {
        #[serde(with = "codec::base64_bytes")]
        data: Vec<u8>,
    },
}

impl Payload {
    /// Decode the payload into an owned value
    pub fn value(&self) -> Result<Value> {
        match self {
            Self::Inline { value } => Ok(value.clone()),
            Self::Gzip { data } => {
                let bytes = codec::decompress(data)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Gzip { .. })
    }

    /// Bytes occupied by the stored form
    pub fn stored_bytes(&self) -> Result<usize> {
        match self {
            Self::Inline { value } => Ok(serde_json::to_vec(value)?.len()),
            Self::Gzip { data } => Ok(data.len()),
        }
    }
}

/// A phase output held by the context store
///
/// Entries are never edited in place. Compression and demotion publish a new
/// entry with `version + 1`; holders of the old copy keep seeing the old data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    pub payload: Payload,

    /// Size of the uncompressed JSON encoding
    pub size_bytes: usize,

    /// Size as stored (equals `size_bytes` unless compressed)
    pub stored_bytes: usize,

    pub tier: ContextTier,
    pub produced_by_phase: String,
    pub created_at: DateTime<Utc>,
    pub version: u32,
}

impl ContextEntry {
    /// Decoded payload copy
    pub fn value(&self) -> Result<Value> {
        self.payload.value()
    }

    pub fn is_compressed(&self) -> bool {
        self.payload.is_compressed()
    }

    /// Compressed successor of this entry (a copy if already compressed)
    pub fn compressed(&self) -> Result<Self> {
        if self.is_compressed() {
            return Ok(self.clone());
        }

        let raw = serde_json::to_vec(&self.value()?)?;
        let data = codec::compress(&raw)?;
        Ok(Self {
            stored_bytes: data.len(),
            payload: Payload::Gzip { data },
            tier: self.tier.max(ContextTier::Warm),
            created_at: Utc::now(),
            version: self.version + 1,
            ..self.clone()
        })
    }

    /// Successor of this entry placed in `tier`, compressed if the tier needs it
    pub fn demoted(&self, tier: ContextTier) -> Result<Self> {
        let mut next = if tier.requires_compression() {
            self.compressed()?
        } else {
            self.clone()
        };

        if next.version == self.version {
            next.version += 1;
            next.created_at = Utc::now();
        }
        next.tier = tier;
        Ok(next)
    }
}

/// Size-based tier placement
#[derive(Debug, Clone, PartialEq)]
pub struct TierPolicy {
    pub hot_max_bytes: usize,
    pub warm_max_bytes: usize,
    pub cold_max_bytes: usize,
    pub compression_threshold_bytes: usize,
    pub max_entry_bytes: usize,
    pub hot_budget_bytes: usize,
}

impl TierPolicy {
    /// Tier for an entry of `size_bytes` uncompressed bytes
    pub fn place(&self, size_bytes: usize, compressed: bool) -> ContextTier {
        let tier = if size_bytes <= self.hot_max_bytes {
            ContextTier::Hot
        } else if size_bytes <= self.warm_max_bytes {
            ContextTier::Warm
        } else if size_bytes <= self.cold_max_bytes {
            ContextTier::Cold
        } else {
            ContextTier::Archive
        };

        if compressed {
            tier.max(ContextTier::Warm)
        } else {
            tier
        }
    }

    /// Whether an entry of this size is compressed on write
    pub fn should_compress(&self, size_bytes: usize) -> bool {
        size_bytes > self.compression_threshold_bytes
            || size_bytes > self.max_entry_bytes
            || size_bytes > self.cold_max_bytes
    }
}

impl From<&ContextConfig> for TierPolicy {
    fn from(config: &ContextConfig) -> Self {
        Self {
            hot_max_bytes: config.hot_max_bytes,
            warm_max_bytes: config.warm_max_bytes,
            cold_max_bytes: config.cold_max_bytes,
            compression_threshold_bytes: config.compression_threshold_bytes,
            max_entry_bytes: config.max_entry_bytes,
            hot_budget_bytes: config.hot_budget_bytes,
        }
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::from(&ContextConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: Value) -> ContextEntry {
        let size = serde_json::to_vec(&value).unwrap().len();
        ContextEntry {
            key: "k".into(),
            payload: Payload::Inline { value },
            size_bytes: size,
            stored_bytes: size,
            tier: ContextTier::Hot,
            produced_by_phase: "phase-1".into(),
            created_at: Utc::now(),
            version: 1,
        }
    }

    #[test]
    fn test_placement_by_size() {
        let policy = TierPolicy::default();
        assert_eq!(policy.place(10, false), ContextTier::Hot);
        assert_eq!(policy.place(10, true), ContextTier::Warm);
        assert_eq!(policy.place(100 * 1024, false), ContextTier::Warm);
        assert_eq!(policy.place(1024 * 1024, false), ContextTier::Cold);
        assert_eq!(policy.place(64 * 1024 * 1024, false), ContextTier::Archive);
    }

    #[test]
    fn test_compression_produces_new_version() {
        let original = entry(json!({"text": "a".repeat(2048)}));
        let packed = original.compressed().unwrap();

        assert_eq!(packed.version, 2);
        assert!(packed.is_compressed());
        assert!(!original.is_compressed());
        assert_eq!(packed.value().unwrap(), original.value().unwrap());
        assert!(packed.stored_bytes < original.stored_bytes);
    }

    #[test]
    fn test_demote_to_archive_compresses() {
        let original = entry(json!({"n": 1}));
        let archived = original.demoted(ContextTier::Archive).unwrap();
        assert_eq!(archived.tier, ContextTier::Archive);
        assert!(archived.is_compressed());
        assert_eq!(archived.version, 2);

        let warm = original.demoted(ContextTier::Warm).unwrap();
        assert!(!warm.is_compressed());
        assert_eq!(warm.version, 2);
    }

    #[test]
    fn test_compressed_payload_serializes_as_base64() {
        let packed = entry(json!({"n": 1})).compressed().unwrap();
        let text = serde_json::to_string(&packed).unwrap();
        assert!(text.contains("\"encoding\":\"gzip\""));
        let back: ContextEntry = serde_json::from_str(&text).unwrap();
        assert_eq!(back, packed);
    }
}
