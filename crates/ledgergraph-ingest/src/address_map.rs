//! Stable numeric identifiers for addresses.
//!
//! Graph output refers to addresses by compact id; this map assigns ids
//! first-come and persists the assignment so ids stay stable across runs.
//! Persistence is atomic: the map is written to a sibling temp file and
//! renamed over the live one, so a crash mid-write never corrupts it.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

const HEADER: &str = "id\taddress";

/// Address-to-id assignment, shared across worker tasks.
pub struct AddressIdMap {
    path: PathBuf,
    ids: DashMap<String, u64>,
    next_id: AtomicU64,
}

impl AddressIdMap {
    /// Load the map from `path`, or start empty when none exists yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let ids = DashMap::new();
        let mut max_id = 0u64;

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (number, line) in reader.lines().enumerate() {
                let line = line?;
                if number == 0 && line == HEADER {
                    continue;
                }
                if line.is_empty() {
                    continue;
                }
                let (id, address) = line.split_once('\t').ok_or_else(|| {
                    Error::Recovery(format!("malformed address map line: {line:?}"))
                })?;
                let id: u64 = id.parse().map_err(|_| {
                    Error::Recovery(format!("bad id in address map line: {line:?}"))
                })?;
                max_id = max_id.max(id);
                ids.insert(address.to_string(), id);
            }
            info!(addresses = ids.len(), path = %path.display(), "loaded address map");
        }

        let next_id = AtomicU64::new(if ids.is_empty() { 0 } else { max_id + 1 });
        Ok(Self { path, ids, next_id })
    }

    /// The id for `address`, assigning the next free one on first sight.
    pub fn id_of(&self, address: &str) -> u64 {
        if let Some(id) = self.ids.get(address) {
            return *id;
        }
        *self
            .ids
            .entry(address.to_string())
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Write the whole map out atomically (temp file, then rename).
    pub fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writeln!(writer, "{HEADER}")?;
            let mut rows: Vec<(u64, String)> = self
                .ids
                .iter()
                .map(|kv| (*kv.value(), kv.key().clone()))
                .collect();
            rows.sort_unstable();
            for (id, address) in rows {
                writeln!(writer, "{id}\t{address}")?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ids_are_assigned_first_come() {
        let tmp = TempDir::new().unwrap();
        let map = AddressIdMap::open(tmp.path().join("addresses.tsv")).unwrap();

        assert_eq!(map.id_of("A"), 0);
        assert_eq!(map.id_of("B"), 1);
        assert_eq!(map.id_of("A"), 0);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_persist_and_reload_keeps_ids_stable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("addresses.tsv");

        {
            let map = AddressIdMap::open(&path).unwrap();
            map.id_of("A");
            map.id_of("B");
            map.persist().unwrap();
        }

        let map = AddressIdMap::open(&path).unwrap();
        assert_eq!(map.id_of("B"), 1);
        assert_eq!(map.id_of("A"), 0);
        // New addresses continue after the reloaded maximum.
        assert_eq!(map.id_of("C"), 2);
    }

    #[test]
    fn test_persist_is_atomic_rename() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("addresses.tsv");
        let map = AddressIdMap::open(&path).unwrap();
        map.id_of("A");
        map.persist().unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "id\taddress\n0\tA\n");
    }

    #[test]
    fn test_malformed_map_line_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("addresses.tsv");
        fs::write(&path, "id\taddress\nnot-a-line\n").unwrap();
        assert!(AddressIdMap::open(&path).is_err());
    }
}
