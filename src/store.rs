//! The on-disk cache: value blobs addressed by content hash, per-target
//! meta records, and ephemeral per-run progress markers.
//!
//! Layout under the cache root:
//!
//! ```text
//! objects/<hash>     serialized target values
//! meta/<target>      meta records (JSON)
//! progress/<target>  per-run state: queued|building|built|failed
//! config             hashing algorithm identifiers
//! tmp/               staging area for atomic writes
//! ```
//!
//! Every write lands in tmp/ and is renamed into place, so readers only
//! ever see complete entries; a reader that sees a meta record can read the
//! value it points at.

use crate::error::{EngineError, EngineResult};
use crate::eval::Value;
use crate::hash::{FileSig, Hashers};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Persisted record of one successful (or, optionally, failed) build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub command_hash: String,
    pub depends_hash: String,
    /// Absent for failures recorded with record_failed_meta.
    pub value_hash: Option<String>,
    /// Fingerprints of declared output files at commit time.
    #[serde(default)]
    pub output_files: BTreeMap<String, FileSig>,
    pub seed: u64,
    pub elapsed_ms: u64,
    pub finished_at: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Objects,
    Meta,
    Progress,
}

impl Namespace {
    fn dir(self) -> &'static str {
        match self {
            Namespace::Objects => "objects",
            Namespace::Meta => "meta",
            Namespace::Progress => "progress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Queued,
    Building,
    Built,
    Failed,
}

impl ProgressState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressState::Queued => "queued",
            ProgressState::Building => "building",
            ProgressState::Built => "built",
            ProgressState::Failed => "failed",
        }
    }
}

impl FromStr for ProgressState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "queued" => Ok(ProgressState::Queued),
            "building" => Ok(ProgressState::Building),
            "built" => Ok(ProgressState::Built),
            "failed" => Ok(ProgressState::Failed),
            other => Err(format!("unknown progress state {:?}", other)),
        }
    }
}

/// Algorithm identifiers stored alongside the cached data.  A mismatch
/// between runs invalidates the whole cache.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
struct StoreConfig {
    version: u32,
    short_hash: String,
    long_hash: String,
}

const STORE_VERSION: u32 = 1;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (or create) a cache directory, validating that the stored
    /// hashing configuration matches; on mismatch the cache contents are
    /// discarded and the config rewritten.
    pub fn open(root: impl Into<PathBuf>, hashers: &Hashers) -> EngineResult<Store> {
        let store = Store { root: root.into() };
        for ns in [Namespace::Objects, Namespace::Meta, Namespace::Progress] {
            store.ensure_dir(&store.root.join(ns.dir()))?;
        }
        store.ensure_dir(&store.root.join("tmp"))?;

        let wanted = StoreConfig {
            version: STORE_VERSION,
            short_hash: hashers.short.as_str().to_owned(),
            long_hash: hashers.long.as_str().to_owned(),
        };
        let config_path = store.root.join("config");
        match std::fs::read_to_string(&config_path) {
            Ok(text) => {
                let found: Option<StoreConfig> = serde_json::from_str(&text).ok();
                if found.as_ref() != Some(&wanted) {
                    warn!(
                        cache = %store.root.display(),
                        "cache config changed; invalidating cached results"
                    );
                    store.clean(None)?;
                    store.write_config(&config_path, &wanted)?;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                store.write_config(&config_path, &wanted)?;
            }
            Err(err) => return Err(store.cache_err(&config_path, err.to_string())),
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_config(&self, path: &Path, config: &StoreConfig) -> EngineResult<()> {
        let text = serde_json::to_string(config).expect("config serializes");
        self.write_atomic(path, text.as_bytes())
    }

    fn ensure_dir(&self, dir: &Path) -> EngineResult<()> {
        std::fs::create_dir_all(dir).map_err(|err| self.cache_err(dir, err.to_string()))
    }

    fn cache_err(&self, path: &Path, message: String) -> EngineError {
        EngineError::Cache {
            path: path.to_owned(),
            message,
        }
    }

    fn key_path(&self, ns: Namespace, key: &str) -> PathBuf {
        self.root.join(ns.dir()).join(key)
    }

    /// Stage in tmp/ and rename into place; rename is atomic per key on the
    /// filesystems we care about, and concurrent writers of the same
    /// content-addressed key write identical bytes.
    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> EngineResult<()> {
        let tmp = self.root.join("tmp").join(format!(
            "{}.{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&tmp, bytes)
            .map_err(|err| self.cache_err(&tmp, err.to_string()))?;
        std::fs::rename(&tmp, dest).map_err(|err| self.cache_err(dest, err.to_string()))
    }

    // Meta records.

    pub fn get_meta(&self, name: &str) -> EngineResult<Option<Meta>> {
        let path = self.key_path(Namespace::Meta, name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.cache_err(&path, err.to_string())),
        };
        let meta = serde_json::from_str(&text)
            .map_err(|err| self.cache_err(&path, format!("corrupt meta record: {}", err)))?;
        Ok(Some(meta))
    }

    pub fn put_meta(&self, name: &str, meta: &Meta) -> EngineResult<()> {
        let path = self.key_path(Namespace::Meta, name);
        let text = serde_json::to_string(meta).expect("meta serializes");
        debug!(node = name, "meta commit");
        self.write_atomic(&path, text.as_bytes())
    }

    // Object blobs, keyed by value hash.

    pub fn put_object(&self, hashers: &Hashers, value: &Value) -> EngineResult<String> {
        let hash = hashers.value_hash(value);
        let path = self.key_path(Namespace::Objects, &hash);
        if !path.exists() {
            let bytes = serde_json::to_vec(value).expect("value serializes");
            self.write_atomic(&path, &bytes)?;
        }
        Ok(hash)
    }

    pub fn get_object(&self, hash: &str) -> EngineResult<Option<Value>> {
        let path = self.key_path(Namespace::Objects, hash);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.cache_err(&path, err.to_string())),
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|err| self.cache_err(&path, format!("corrupt object: {}", err)))?;
        Ok(Some(value))
    }

    pub fn has_object(&self, hash: &str) -> bool {
        self.key_path(Namespace::Objects, hash).exists()
    }

    // Progress markers.

    pub fn set_progress(&self, name: &str, state: ProgressState) -> EngineResult<()> {
        let path = self.key_path(Namespace::Progress, name);
        self.write_atomic(&path, state.as_str().as_bytes())
    }

    pub fn get_progress(&self, name: &str) -> EngineResult<Option<ProgressState>> {
        let path = self.key_path(Namespace::Progress, name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.cache_err(&path, err.to_string())),
        };
        ProgressState::from_str(&text)
            .map(Some)
            .map_err(|err| self.cache_err(&path, err))
    }

    /// Progress is per-run state; the scheduler clears it when a run starts.
    pub fn clear_progress(&self) -> EngineResult<()> {
        self.clean_dir(&self.root.join(Namespace::Progress.dir()))
    }

    // Shared namespace operations.

    pub fn exists(&self, ns: Namespace, key: &str) -> bool {
        self.key_path(ns, key).exists()
    }

    pub fn list(&self, ns: Namespace) -> EngineResult<Vec<String>> {
        let dir = self.root.join(ns.dir());
        let mut keys = Vec::new();
        let entries =
            std::fs::read_dir(&dir).map_err(|err| self.cache_err(&dir, err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| self.cache_err(&dir, err.to_string()))?;
            keys.push(entry.file_name().to_string_lossy().into_owned());
        }
        keys.sort();
        Ok(keys)
    }

    /// Remove one target's records, or every record in the cache.
    pub fn clean(&self, name: Option<&str>) -> EngineResult<()> {
        match name {
            Some(name) => {
                for ns in [Namespace::Meta, Namespace::Progress] {
                    let path = self.key_path(ns, name);
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(self.cache_err(&path, err.to_string())),
                    }
                }
                Ok(())
            }
            None => {
                for ns in [Namespace::Objects, Namespace::Meta, Namespace::Progress] {
                    self.clean_dir(&self.root.join(ns.dir()))?;
                }
                Ok(())
            }
        }
    }

    fn clean_dir(&self, dir: &Path) -> EngineResult<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(self.cache_err(dir, err.to_string())),
        };
        for entry in entries {
            let entry = entry.map_err(|err| self.cache_err(dir, err.to_string()))?;
            std::fs::remove_file(entry.path())
                .map_err(|err| self.cache_err(&entry.path(), err.to_string()))?;
        }
        Ok(())
    }

    pub fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{LongAlgo, ShortAlgo};

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("cache"), &Hashers::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn objects_round_trip() {
        let (_dir, store) = test_store();
        let hashers = Hashers::default();
        let value = Value::List(vec![
            Value::Int(1),
            Value::Str("two".into()),
            Value::Float(3.5),
        ]);
        let hash = store.put_object(&hashers, &value).unwrap();
        assert!(store.has_object(&hash));
        assert_eq!(store.get_object(&hash).unwrap(), Some(value));
        assert_eq!(store.get_object("0".repeat(64).as_str()).unwrap(), None);
    }

    #[test]
    fn meta_round_trip_and_list() {
        let (_dir, store) = test_store();
        let meta = Meta {
            command_hash: "c".into(),
            depends_hash: "d".into(),
            value_hash: Some("v".into()),
            output_files: BTreeMap::new(),
            seed: 9,
            elapsed_ms: 12,
            finished_at: 100,
            error: None,
        };
        store.put_meta("alpha", &meta).unwrap();
        let loaded = store.get_meta("alpha").unwrap().unwrap();
        assert_eq!(loaded.command_hash, "c");
        assert_eq!(loaded.value_hash.as_deref(), Some("v"));
        assert_eq!(store.list(Namespace::Meta).unwrap(), vec!["alpha"]);
        assert!(store.get_meta("beta").unwrap().is_none());
    }

    #[test]
    fn corrupt_meta_is_a_cache_error() {
        let (_dir, store) = test_store();
        std::fs::write(store.root().join("meta").join("bad"), "{not json").unwrap();
        assert!(matches!(
            store.get_meta("bad"),
            Err(EngineError::Cache { .. })
        ));
    }

    #[test]
    fn progress_states() {
        let (_dir, store) = test_store();
        store.set_progress("t", ProgressState::Building).unwrap();
        assert_eq!(
            store.get_progress("t").unwrap(),
            Some(ProgressState::Building)
        );
        store.clear_progress().unwrap();
        assert_eq!(store.get_progress("t").unwrap(), None);
    }

    #[test]
    fn changing_hash_algos_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let fnv = Hashers::default();
        {
            let store = Store::open(&root, &fnv).unwrap();
            let meta = Meta {
                command_hash: "c".into(),
                depends_hash: "d".into(),
                value_hash: None,
                output_files: BTreeMap::new(),
                seed: 0,
                elapsed_ms: 0,
                finished_at: 0,
                error: None,
            };
            store.put_meta("t", &meta).unwrap();
        }
        let sip = Hashers {
            short: ShortAlgo::Sip,
            long: LongAlgo::Sha256,
        };
        let store = Store::open(&root, &sip).unwrap();
        assert!(store.get_meta("t").unwrap().is_none(), "cache not cleared");

        // Same algos again: still empty but no further invalidation needed.
        let store = Store::open(&root, &sip).unwrap();
        assert!(store.get_meta("t").unwrap().is_none());
    }
}
