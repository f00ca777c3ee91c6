// src/index/store.rs
//
// On-disk form of the semantic index: a metadata JSON next to an
// append-only CSV-ish vector file. Appends are line-atomic enough that a
// crash mid-write costs at most the torn trailing line, which the loader
// silently discards; the metadata's indexedTools count is only advanced
// after the lines it covers are on disk.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    pub fingerprint: String,
    pub model_id: String,
    pub total_tools: usize,
    pub indexed_tools: usize,
    /// Unix seconds; present only once every tool is embedded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl IndexMeta {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some() && self.indexed_tools >= self.total_tools
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub qualified_name: String,
    pub desc_hash: String,
    pub schema_hash: String,
    pub vector: Vec<f32>,
}

impl VectorRecord {
    /// `name,descHash,schemaHash,v0;v1;…` — the name may itself contain
    /// commas, so parsing splits from the right.
    fn to_line(&self) -> String {
        let vector = self
            .vector
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(";");
        format!(
            "{},{},{},{}",
            self.qualified_name, self.desc_hash, self.schema_hash, vector
        )
    }

    fn parse(line: &str) -> Option<VectorRecord> {
        let mut fields = line.rsplitn(4, ',');
        let vector_text = fields.next()?;
        let schema_hash = fields.next()?.to_string();
        let desc_hash = fields.next()?.to_string();
        let qualified_name = fields.next()?.to_string();
        if qualified_name.is_empty() {
            return None;
        }
        let mut vector = Vec::new();
        for part in vector_text.split(';') {
            vector.push(part.parse::<f32>().ok()?);
        }
        Some(VectorRecord {
            qualified_name,
            desc_hash,
            schema_hash,
            vector,
        })
    }
}

/// Paths for one profile's persisted index.
pub struct VectorStore {
    meta_path: PathBuf,
    vectors_path: PathBuf,
}

impl VectorStore {
    pub fn for_profile(cache_dir: &Path, profile: &str) -> VectorStore {
        VectorStore {
            meta_path: cache_dir.join(format!("{profile}-meta.json")),
            vectors_path: cache_dir.join(format!("{profile}-tools.csv")),
        }
    }

    /// Load both files. Absence or corruption of either yields `None` and a
    /// cold build; a torn trailing vector line is skipped, not fatal.
    pub fn load(&self) -> Option<(IndexMeta, Vec<VectorRecord>)> {
        let meta_text = std::fs::read_to_string(&self.meta_path).ok()?;
        let meta: IndexMeta = match serde_json::from_str(&meta_text) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("index metadata unreadable, rebuilding: {e}");
                return None;
            }
        };

        let file = File::open(&self.vectors_path).ok()?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.ok()?;
            if line.is_empty() {
                continue;
            }
            match VectorRecord::parse(&line) {
                Some(record) => records.push(record),
                None => {
                    debug!("discarding torn vector line");
                    break;
                }
            }
        }
        Some((meta, records))
    }

    /// Start a fresh store generation: truncate the vector file and write
    /// the initial metadata.
    pub fn begin(&self, meta: IndexMeta) -> Result<VectorWriter> {
        if let Some(parent) = self.vectors_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.vectors_path)?;
        let writer = VectorWriter {
            meta_path: self.meta_path.clone(),
            file,
            meta,
        };
        writer.write_meta()?;
        Ok(writer)
    }
}

/// The single writer for a store generation; the index owner holds exactly
/// one of these at a time.
pub struct VectorWriter {
    meta_path: PathBuf,
    file: File,
    meta: IndexMeta,
}

impl VectorWriter {
    pub fn append(&mut self, record: &VectorRecord) -> Result<()> {
        let line = record.to_line();
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        Ok(())
    }

    /// Persist progress: the vector lines first, then the count that
    /// promises them.
    pub fn flush_progress(&mut self, indexed_tools: usize) -> Result<()> {
        self.file.flush()?;
        self.meta.indexed_tools = indexed_tools;
        self.write_meta()
    }

    /// Mark the build complete and fsync everything.
    pub fn complete(&mut self, indexed_tools: usize) -> Result<()> {
        self.meta.indexed_tools = indexed_tools;
        self.meta.completed_at = Some(unix_now());
        self.file.flush()?;
        self.file.sync_all()?;
        self.write_meta()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn write_meta(&self) -> Result<()> {
        let tmp = self.meta_path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(&self.meta)?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.meta_path).map_err(|e| {
            GatewayError::Io(std::io::Error::new(
                e.kind(),
                format!("replacing index metadata: {e}"),
            ))
        })?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(name: &str, seed: f32) -> VectorRecord {
        VectorRecord {
            qualified_name: name.to_string(),
            desc_hash: "d1".to_string(),
            schema_hash: "s1".to_string(),
            vector: vec![seed, seed * 0.5, 0.25],
        }
    }

    fn meta(fingerprint: &str, total: usize) -> IndexMeta {
        IndexMeta {
            fingerprint: fingerprint.to_string(),
            model_id: "lexical-trigram-v1".to_string(),
            total_tools: total,
            indexed_tools: 0,
            completed_at: None,
        }
    }

    #[test]
    fn test_round_trip_preserves_vectors_bitwise() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::for_profile(dir.path(), "default");

        let records = vec![record("p1:echo", 0.125), record("p1:other", 0.333333)];
        let mut writer = store.begin(meta("fp-1", 2)).unwrap();
        for r in &records {
            writer.append(r).unwrap();
        }
        writer.complete(2).unwrap();

        let (loaded_meta, loaded) = store.load().unwrap();
        assert_eq!(loaded_meta.fingerprint, "fp-1");
        assert_eq!(loaded_meta.indexed_tools, 2);
        assert!(loaded_meta.is_complete());
        assert_eq!(loaded, records);
    }

    #[test]
    fn test_missing_files_yield_cold_build() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::for_profile(dir.path(), "default");
        assert!(store.load().is_none());
    }

    #[test]
    fn test_torn_trailing_line_is_discarded() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::for_profile(dir.path(), "default");

        let mut writer = store.begin(meta("fp-2", 2)).unwrap();
        writer.append(&record("p1:kept", 1.0)).unwrap();
        writer.flush_progress(1).unwrap();
        drop(writer);

        // Simulate a crash mid-append.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("default-tools.csv"))
            .unwrap();
        file.write_all(b"p1:torn,d,s,0.5;0.2").unwrap(); // no newline, then cut
        file.write_all(b";garb").unwrap();
        drop(file);

        let (_, records) = store.load().unwrap();
        // The torn record parses as garbage and is dropped.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].qualified_name, "p1:kept");
    }

    #[test]
    fn test_name_with_commas_survives() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::for_profile(dir.path(), "default");
        let odd = VectorRecord {
            qualified_name: "p1:do,thing,now".to_string(),
            desc_hash: "d".to_string(),
            schema_hash: "s".to_string(),
            vector: vec![1.0],
        };
        let mut writer = store.begin(meta("fp", 1)).unwrap();
        writer.append(&odd).unwrap();
        writer.complete(1).unwrap();

        let (_, records) = store.load().unwrap();
        assert_eq!(records[0], odd);
    }

    #[test]
    fn test_begin_truncates_previous_generation() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::for_profile(dir.path(), "default");

        let mut writer = store.begin(meta("old", 1)).unwrap();
        writer.append(&record("p1:old", 0.5)).unwrap();
        writer.complete(1).unwrap();

        let writer = store.begin(meta("new", 0)).unwrap();
        drop(writer);

        let (loaded_meta, records) = store.load().unwrap();
        assert_eq!(loaded_meta.fingerprint, "new");
        assert!(records.is_empty());
    }
}
