//! Content hashing: the identities the staleness oracle compares.
//!
//! Two algorithms are in play, both recorded in the cache config so a cache
//! written with one pair is never read with another:
//!
//! - the short hash, a fast non-cryptographic 64-bit hash (FNV-1a by
//!   default) used for per-file fingerprints;
//! - the long hash, a cryptographic 256-bit hash (SHA-256 by default) used
//!   for command text, serialized values, and composite depends-hashes.

use crate::eval::Value;
use crate::parse::{deparse, Expr};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::hash::Hasher as _;
use std::path::Path;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

const UNIT_SEPARATOR: u8 = 0x1F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShortAlgo {
    #[serde(rename = "fnv64")]
    Fnv,
    #[serde(rename = "sip64")]
    Sip,
}

impl ShortAlgo {
    pub fn as_str(self) -> &'static str {
        match self {
            ShortAlgo::Fnv => "fnv64",
            ShortAlgo::Sip => "sip64",
        }
    }
}

impl FromStr for ShortAlgo {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fnv64" => Ok(ShortAlgo::Fnv),
            "sip64" => Ok(ShortAlgo::Sip),
            other => Err(format!("unknown short hash {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LongAlgo {
    #[serde(rename = "sha256")]
    Sha256,
}

impl LongAlgo {
    pub fn as_str(self) -> &'static str {
        match self {
            LongAlgo::Sha256 => "sha256",
        }
    }
}

impl FromStr for LongAlgo {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(LongAlgo::Sha256),
            other => Err(format!("unknown long hash {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Hashers {
    pub short: ShortAlgo,
    pub long: LongAlgo,
}

impl Default for Hashers {
    fn default() -> Self {
        Hashers {
            short: ShortAlgo::Fnv,
            long: LongAlgo::Sha256,
        }
    }
}

impl Hashers {
    pub fn short_hash(&self, bytes: &[u8]) -> u64 {
        match self.short {
            ShortAlgo::Fnv => {
                let mut h = fnv::FnvHasher::default();
                h.write(bytes);
                h.finish()
            }
            ShortAlgo::Sip => {
                let mut h = std::collections::hash_map::DefaultHasher::new();
                h.write(bytes);
                h.finish()
            }
        }
    }

    pub fn long_hash(&self, bytes: &[u8]) -> String {
        match self.long {
            LongAlgo::Sha256 => hex::encode(Sha256::digest(bytes)),
        }
    }

    /// Hash of the standardized command text.
    pub fn command_hash(&self, command: &Expr) -> String {
        self.long_hash(deparse(command).as_bytes())
    }

    /// Hash of a value's stable serialization; doubles as its object-store
    /// key.
    pub fn value_hash(&self, value: &Value) -> String {
        let bytes = serde_json::to_vec(value).expect("value serialization cannot fail");
        self.long_hash(&bytes)
    }

    /// Hash of arbitrary identity text (import bodies, config strings).
    pub fn text_hash(&self, text: &str) -> String {
        self.long_hash(text.as_bytes())
    }

    /// Composite hash over the ordered (name, hash) pairs of a target's
    /// immediate dependencies.  Callers pass the pairs sorted by name.
    pub fn depends_hash(&self, pairs: &[(String, String)]) -> String {
        let mut buf = Vec::new();
        for (name, hash) in pairs {
            buf.extend_from_slice(name.as_bytes());
            buf.push(UNIT_SEPARATOR);
            buf.extend_from_slice(hash.as_bytes());
            buf.push(UNIT_SEPARATOR);
        }
        self.long_hash(&buf)
    }

    /// Deterministic per-target seed: hash(root_seed || target_name).
    pub fn seed_for(&self, root_seed: u64, target: &str) -> u64 {
        let mut buf = Vec::with_capacity(9 + target.len());
        buf.extend_from_slice(&root_seed.to_le_bytes());
        buf.push(UNIT_SEPARATOR);
        buf.extend_from_slice(target.as_bytes());
        let digest = self.long_hash(&buf);
        let mut eight = [0u8; 8];
        hex::decode_to_slice(&digest[..16], &mut eight).expect("hex digest");
        u64::from_le_bytes(eight)
    }
}

/// A file's recorded state: mtime always, content hash only when
/// file-change hashing is enabled (mtime is the cheap surrogate otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSig {
    pub mtime_ms: u64,
    pub size: u64,
    pub hash: Option<u64>,
}

impl FileSig {
    /// Whether two signatures represent the same content.  Content hashes
    /// win when both sides have them.
    pub fn same_as(&self, other: &FileSig) -> bool {
        match (self.hash, other.hash) {
            (Some(a), Some(b)) => a == b,
            _ => self.mtime_ms == other.mtime_ms && self.size == other.size,
        }
    }

    /// Stable text form used inside depends-hashes.
    pub fn identity(&self) -> String {
        match self.hash {
            Some(h) => format!("h{:016x}", h),
            None => format!("m{}.{}", self.mtime_ms, self.size),
        }
    }
}

/// Fingerprint a file; None when it does not exist.
pub fn fingerprint(
    hashers: &Hashers,
    path: &Path,
    with_content_hash: bool,
) -> std::io::Result<Option<FileSig>> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let mtime_ms = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let hash = if with_content_hash {
        Some(hashers.short_hash(&std::fs::read(path)?))
    } else {
        None
    };
    Ok(Some(FileSig {
        mtime_ms,
        size: meta.len(),
        hash,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_expr_text;

    #[test]
    fn command_hash_ignores_quoting_and_whitespace() {
        let h = Hashers::default();
        let a = parse_expr_text("file_in('x.txt')  +  1;").unwrap();
        let b = parse_expr_text("file_in(\"x.txt\") + 1").unwrap();
        assert_eq!(h.command_hash(&a), h.command_hash(&b));
    }

    #[test]
    fn command_hash_distinguishes_commands() {
        let h = Hashers::default();
        let a = parse_expr_text("a + 1").unwrap();
        let b = parse_expr_text("a + 10").unwrap();
        assert_ne!(h.command_hash(&a), h.command_hash(&b));
    }

    #[test]
    fn depends_hash_sensitive_to_names_and_hashes() {
        let h = Hashers::default();
        let base = vec![("a".to_string(), "h1".to_string())];
        let renamed = vec![("b".to_string(), "h1".to_string())];
        let rehashed = vec![("a".to_string(), "h2".to_string())];
        assert_ne!(h.depends_hash(&base), h.depends_hash(&renamed));
        assert_ne!(h.depends_hash(&base), h.depends_hash(&rehashed));
        assert_eq!(h.depends_hash(&base), h.depends_hash(&base.clone()));
    }

    #[test]
    fn seeds_differ_per_target() {
        let h = Hashers::default();
        assert_ne!(h.seed_for(1, "a"), h.seed_for(1, "b"));
        assert_ne!(h.seed_for(1, "a"), h.seed_for(2, "a"));
        assert_eq!(h.seed_for(1, "a"), h.seed_for(1, "a"));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        let h = Hashers::default();
        assert!(fingerprint(&h, &path, true).unwrap().is_none());
        std::fs::write(&path, "hello").unwrap();
        let a = fingerprint(&h, &path, true).unwrap().unwrap();
        std::fs::write(&path, "world").unwrap();
        let b = fingerprint(&h, &path, true).unwrap().unwrap();
        assert!(!a.same_as(&b));
        std::fs::write(&path, "hello").unwrap();
        let c = fingerprint(&h, &path, true).unwrap().unwrap();
        assert!(a.same_as(&c), "content hash should see through mtime");
    }

    #[test]
    fn algo_identifiers_round_trip() {
        assert_eq!(ShortAlgo::from_str("fnv64").unwrap(), ShortAlgo::Fnv);
        assert_eq!(LongAlgo::from_str("sha256").unwrap(), LongAlgo::Sha256);
        assert!(ShortAlgo::from_str("md5").is_err());
    }
}
