//! The persistent per-task cache: a manifest mapping node ids to the
//! fingerprint and artifact of their last successful execution.
//!
//! Artifacts are stored content-addressed (file name = fingerprint hex), so
//! superseded entries simply stop being referenced. The store is opened at
//! run start and flushed at run end; there is no ambient global state.

use std::collections::HashMap;
use std::fs;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Hash32, NodeId};
use crate::io::{link_or_copy, write_atomic};

const MANIFEST: &str = "manifest.cbor";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    pub fingerprint: Hash32,
    /// Artifact file name within the cache directory.
    pub artifact: String,
    pub produced_at: SystemTime,
}

#[derive(Debug)]
pub(crate) struct CacheStore {
    dir: Utf8PathBuf,
    entries: HashMap<NodeId, CacheEntry>,
    dirty: bool,
}

impl CacheStore {
    /// Open the cache directory, reading the manifest if one exists. A
    /// corrupt manifest is discarded rather than failing the run.
    pub(crate) fn open(dir: &Utf8Path) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;

        let manifest = dir.join(MANIFEST);
        let entries = if manifest.is_file() {
            let file = fs::File::open(&manifest)?;
            match ciborium::from_reader(std::io::BufReader::new(file)) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!("discarding corrupt cache manifest {manifest}: {err}");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(CacheStore {
            dir: dir.to_owned(),
            entries,
            dirty: false,
        })
    }

    /// The stored artifact for `id`, provided the stored fingerprint matches
    /// the one recomputed for this run and the artifact bytes still exist.
    pub(crate) fn lookup(&self, id: NodeId, fingerprint: Hash32) -> Option<Utf8PathBuf> {
        let entry = self.entries.get(&id)?;
        if entry.fingerprint != fingerprint {
            return None;
        }
        let path = self.dir.join(&entry.artifact);
        path.is_file().then_some(path)
    }

    /// Record a freshly built artifact. The bytes are linked or copied into
    /// the store under their fingerprint.
    pub(crate) fn store(
        &mut self,
        id: NodeId,
        fingerprint: Hash32,
        artifact: &Utf8Path,
    ) -> std::io::Result<()> {
        let name = fingerprint.to_hex();
        link_or_copy(artifact, &self.dir.join(&name))?;
        self.entries.insert(
            id,
            CacheEntry {
                fingerprint,
                artifact: name,
                produced_at: SystemTime::now(),
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Write the manifest back to disk if anything changed this run.
    pub(crate) fn flush(&mut self) -> std::io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut buffer = Vec::new();
        ciborium::into_writer(&self.entries, &mut buffer).map_err(std::io::Error::other)?;
        write_atomic(&self.dir.join(MANIFEST), &buffer)?;
        self.dirty = false;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Blake3Hasher;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn id_of(text: &str) -> NodeId {
        let mut hasher = Blake3Hasher::default();
        hasher.push(text);
        NodeId(hasher.finish())
    }

    #[test]
    fn round_trips_through_the_manifest() {
        let (_guard, dir) = scratch();
        let cache_dir = dir.join("cache");
        let artifact = dir.join("artifact");
        fs::write(&artifact, b"bytes").unwrap();

        let id = id_of("node");
        let fingerprint = Hash32::hash(b"fingerprint");

        let mut cache = CacheStore::open(&cache_dir).unwrap();
        cache.store(id, fingerprint, &artifact).unwrap();
        cache.flush().unwrap();

        let cache = CacheStore::open(&cache_dir).unwrap();
        assert_eq!(cache.len(), 1);
        let hit = cache.lookup(id, fingerprint).unwrap();
        assert_eq!(fs::read(hit).unwrap(), b"bytes");
    }

    #[test]
    fn stale_fingerprints_miss() {
        let (_guard, dir) = scratch();
        let cache_dir = dir.join("cache");
        let artifact = dir.join("artifact");
        fs::write(&artifact, b"bytes").unwrap();

        let id = id_of("node");
        let mut cache = CacheStore::open(&cache_dir).unwrap();
        cache.store(id, Hash32::hash(b"old"), &artifact).unwrap();

        assert!(cache.lookup(id, Hash32::hash(b"new")).is_none());
        assert!(cache.lookup(id_of("other"), Hash32::hash(b"old")).is_none());
    }

    #[test]
    fn corrupt_manifest_is_discarded() {
        let (_guard, dir) = scratch();
        let cache_dir = dir.join("cache");
        fs::create_dir_all(&cache_dir).unwrap();
        fs::write(cache_dir.join(MANIFEST), b"not cbor").unwrap();

        let cache = CacheStore::open(&cache_dir).unwrap();
        assert_eq!(cache.len(), 0);
    }
}
