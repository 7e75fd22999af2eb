//! Durable brute-force cosine vector index.
//!
//! Records live in memory in insertion order (the search tie-break) behind
//! a single `RwLock`: mutations take the write lock for their full span,
//! searches the read lock, so a reader observes either the pre- or
//! post-mutation state and never a partial one.
//!
//! Two artifacts under the storage directory make the index durable:
//! - `records.json` — content, metadata, and embeddings for every record,
//!   in insertion order. Human-inspectable and the source of truth.
//! - `vectors.bin` — the aligned vector matrix (`dims` and row count as
//!   `u32` LE, then row-major `f32` LE). A derived cache: on reload any
//!   disagreement with `records.json` is detected and the matrix is
//!   rebuilt from the record set.
//!
//! Both are flushed before any mutating call returns. An unreadable
//! `records.json` means the index starts empty rather than guessing, with
//! a loud error log.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::models::Record;

const RECORDS_FILE: &str = "records.json";
const VECTORS_FILE: &str = "vectors.bin";

struct IndexInner {
    /// Insertion-ordered record set; position is the search tie-break.
    records: Vec<Record>,
    /// id → position in `records`.
    by_id: HashMap<String, usize>,
    /// Established dimensionality; set by the first record, cleared when
    /// the index empties.
    dims: Option<usize>,
}

/// File-backed vector index with cosine similarity search.
pub struct VectorIndex {
    records_path: PathBuf,
    vectors_path: PathBuf,
    inner: RwLock<IndexInner>,
}

impl VectorIndex {
    /// Open (or create) an index under `dir`, reloading any persisted state.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let index = Self {
            records_path: dir.join(RECORDS_FILE),
            vectors_path: dir.join(VECTORS_FILE),
            inner: RwLock::new(IndexInner {
                records: Vec::new(),
                by_id: HashMap::new(),
                dims: None,
            }),
        };

        index.load()?;

        info!(
            records = index.len(),
            dir = %dir.display(),
            "vector index opened"
        );
        Ok(index)
    }

    fn load(&self) -> Result<()> {
        if !self.records_path.exists() {
            return Ok(());
        }

        let bytes = fs::read(&self.records_path)?;
        let parsed: Vec<Record> = match serde_json::from_slice(&bytes) {
            Ok(records) => records,
            Err(e) => {
                // The record set itself is unreadable. Nothing to rebuild
                // from, so start empty rather than guess.
                let corrupt = EngineError::CorruptStorage(format!(
                    "{} is not valid JSON: {}",
                    self.records_path.display(),
                    e
                ));
                error!(error = %corrupt, "starting from an empty index");
                return Ok(());
            }
        };

        let mut inner = self.inner.write().unwrap();
        for record in parsed {
            let dims = *inner.dims.get_or_insert(record.embedding.len());
            if record.embedding.len() != dims {
                warn!(
                    id = %record.id,
                    expected = dims,
                    got = record.embedding.len(),
                    "skipping persisted record with mismatched dimensionality"
                );
                continue;
            }
            let position = inner.records.len();
            if let Some(&existing) = inner.by_id.get(&record.id) {
                inner.records[existing] = record;
            } else {
                inner.by_id.insert(record.id.clone(), position);
                inner.records.push(record);
            }
        }

        // The matrix is a pure cache of the record set; verify it and
        // rebuild from the records on any disagreement.
        if !self.matrix_matches(&inner) {
            warn!(
                path = %self.vectors_path.display(),
                "vector matrix disagrees with record set; rebuilding"
            );
            self.write_matrix(&inner)?;
        }

        debug!(records = inner.records.len(), "loaded index from disk");
        Ok(())
    }

    fn matrix_matches(&self, inner: &IndexInner) -> bool {
        let bytes = match fs::read(&self.vectors_path) {
            Ok(b) => b,
            Err(_) => return inner.records.is_empty(),
        };

        if bytes.len() < 8 {
            return false;
        }

        let dims = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let rows = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

        rows == inner.records.len()
            && dims == inner.dims.unwrap_or(0)
            && bytes.len() == 8 + rows * dims * 4
    }

    /// Add a record, replacing any existing record with the same id in
    /// place (its insertion position is preserved). Flushes before return.
    ///
    /// # Errors
    ///
    /// [`EngineError::DimensionMismatch`] if the embedding length disagrees
    /// with the index's established dimensionality.
    pub fn add(&self, record: Record) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        Self::insert(&mut inner, record)?;
        self.flush(&inner)
    }

    /// Add several records with a single flush at the end.
    ///
    /// Dimensionality is validated for the whole batch up front, so a
    /// mismatch rejects the batch before any record lands.
    pub fn add_batch(&self, records: Vec<Record>) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();

        let mut dims = inner.dims;
        for record in &records {
            let expected = *dims.get_or_insert(record.embedding.len());
            if record.embedding.len() != expected {
                return Err(EngineError::DimensionMismatch {
                    expected,
                    got: record.embedding.len(),
                });
            }
        }

        let count = records.len();
        for record in records {
            Self::insert(&mut inner, record)?;
        }
        self.flush(&inner)?;
        debug!(count, total = inner.records.len(), "added record batch");
        Ok(count)
    }

    fn insert(inner: &mut IndexInner, mut record: Record) -> Result<()> {
        let dims = *inner.dims.get_or_insert(record.embedding.len());
        if record.embedding.len() != dims {
            return Err(EngineError::DimensionMismatch {
                expected: dims,
                got: record.embedding.len(),
            });
        }

        record.score = None;
        match inner.by_id.get(&record.id) {
            Some(&position) => inner.records[position] = record,
            None => {
                let position = inner.records.len();
                inner.by_id.insert(record.id.clone(), position);
                inner.records.push(record);
            }
        }
        Ok(())
    }

    /// Rank the corpus by cosine similarity against `query_vec`.
    ///
    /// Results are sorted by descending score; equal scores keep insertion
    /// order (the sort is stable over the insertion-ordered record set).
    /// `filter` is an exact-match AND over metadata pairs. At most `k`
    /// records are returned, each with `score` populated.
    pub fn search(
        &self,
        query_vec: &[f32],
        k: usize,
        filter: Option<&HashMap<String, String>>,
    ) -> Vec<Record> {
        let inner = self.inner.read().unwrap();

        let mut scored: Vec<Record> = inner
            .records
            .iter()
            .filter(|record| match filter {
                Some(pairs) => pairs
                    .iter()
                    .all(|(key, value)| record.metadata.get(key) == Some(value)),
                None => true,
            })
            .map(|record| {
                let mut hit = record.clone();
                hit.score = Some(cosine_similarity(&record.embedding, query_vec));
                hit
            })
            .collect();

        // Stable sort keeps insertion order on ties.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        scored
    }

    /// Get a record by id. The returned record carries no score.
    pub fn get(&self, id: &str) -> Option<Record> {
        let inner = self.inner.read().unwrap();
        inner.by_id.get(id).map(|&position| inner.records[position].clone())
    }

    /// Delete a record by id, restoring the id→row mapping and flushing
    /// before return. Returns whether the record existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();

        let position = match inner.by_id.remove(id) {
            Some(p) => p,
            None => return Ok(false),
        };

        inner.records.remove(position);
        for row in inner.by_id.values_mut() {
            if *row > position {
                *row -= 1;
            }
        }
        if inner.records.is_empty() {
            inner.dims = None;
        }

        self.flush(&inner)?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().records.is_empty()
    }

    /// The dimensionality established by the first stored record, if any.
    pub fn dims(&self) -> Option<usize> {
        self.inner.read().unwrap().dims
    }

    /// Remove all records and flush.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.records.clear();
        inner.by_id.clear();
        inner.dims = None;
        self.flush(&inner)?;
        info!("vector index cleared");
        Ok(())
    }

    /// Write both artifacts: `records.json` first (source of truth), then
    /// the derived matrix. A crash in between leaves a row-count mismatch
    /// that reload detects and repairs.
    fn flush(&self, inner: &IndexInner) -> Result<()> {
        let json = serde_json::to_vec(&inner.records)?;
        fs::write(&self.records_path, json)?;
        self.write_matrix(inner)?;
        Ok(())
    }

    fn write_matrix(&self, inner: &IndexInner) -> Result<()> {
        let dims = inner.dims.unwrap_or(0);
        let mut bytes = Vec::with_capacity(8 + inner.records.len() * dims * 4);
        bytes.extend_from_slice(&(dims as u32).to_le_bytes());
        bytes.extend_from_slice(&(inner.records.len() as u32).to_le_bytes());
        for record in &inner.records {
            bytes.extend_from_slice(&vec_to_blob(&record.embedding));
        }
        fs::write(&self.vectors_path, bytes)?;
        Ok(())
    }
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian `f32` bytes back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// A zero-norm vector is treated as orthogonal to everything: empty
/// vectors, mismatched lengths, and zero vectors all score `0.0`, never
/// NaN or infinity.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn record(id: &str, embedding: Vec<f32>, channel: &str) -> Record {
        Record::new(id, format!("content of {id}"), embedding, meta(&[("channel", channel)]))
    }

    fn open_temp() -> (tempfile::TempDir, VectorIndex) {
        let tmp = tempfile::TempDir::new().unwrap();
        let index = VectorIndex::open(tmp.path()).unwrap();
        (tmp, index)
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_norm_is_zero_not_nan() {
        let zero = vec![0.0, 0.0, 0.0];
        let v = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine_similarity(&zero, &v), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_add_replaces_same_id_in_place() {
        let (_tmp, index) = open_temp();
        index.add(record("a", vec![1.0, 0.0], "c1")).unwrap();
        index.add(record("b", vec![0.0, 1.0], "c1")).unwrap();

        let mut updated = record("a", vec![0.5, 0.5], "c2");
        updated.content = "updated".to_string();
        index.add(updated).unwrap();

        assert_eq!(index.len(), 2);
        let got = index.get("a").unwrap();
        assert_eq!(got.content, "updated");
        assert_eq!(got.embedding, vec![0.5, 0.5]);
        assert_eq!(got.metadata.get("channel").unwrap(), "c2");
    }

    #[test]
    fn test_dimension_mismatch_fails_fast() {
        let (_tmp, index) = open_temp();
        index.add(record("a", vec![1.0, 0.0], "c1")).unwrap();

        let err = index.add(record("b", vec![1.0, 0.0, 0.0], "c1")).unwrap_err();
        match err {
            EngineError::DimensionMismatch { expected, got } => {
                assert_eq!(expected, 2);
                assert_eq!(got, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_batch_dimension_mismatch_rejects_whole_batch() {
        let (_tmp, index) = open_temp();
        let result = index.add_batch(vec![
            record("a", vec![1.0, 0.0], "c1"),
            record("b", vec![1.0, 0.0, 0.0], "c1"),
        ]);
        assert!(result.is_err());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_search_top_k_ordering() {
        let (_tmp, index) = open_temp();
        index
            .add_batch(vec![
                record("far", vec![0.0, 1.0], "c1"),
                record("near", vec![1.0, 0.0], "c1"),
                record("mid", vec![1.0, 1.0], "c1"),
            ])
            .unwrap();

        let results = index.search(&[1.0, 0.0], 2, None);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "near");
        assert_eq!(results[1].id, "mid");
        // Scores non-increasing and within bounds
        let s0 = results[0].score.unwrap();
        let s1 = results[1].score.unwrap();
        assert!(s0 >= s1);
        assert!((-1.0..=1.0).contains(&s0));
    }

    #[test]
    fn test_search_ties_break_by_insertion_order() {
        let (_tmp, index) = open_temp();
        // Identical embeddings: scores tie exactly.
        index
            .add_batch(vec![
                record("first", vec![1.0, 0.0], "c1"),
                record("second", vec![1.0, 0.0], "c1"),
                record("third", vec![1.0, 0.0], "c1"),
            ])
            .unwrap();

        let results = index.search(&[1.0, 0.0], 3, None);
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_search_metadata_filter_exact_match() {
        let (_tmp, index) = open_temp();
        index
            .add_batch(vec![
                record("a", vec![1.0, 0.0], "c1"),
                record("b", vec![1.0, 0.1], "c2"),
                record("c", vec![0.9, 0.0], "c1"),
            ])
            .unwrap();

        let filter = meta(&[("channel", "c1")]);
        let results = index.search(&[1.0, 0.0], 10, Some(&filter));
        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.metadata.get("channel").unwrap(), "c1");
        }
    }

    #[test]
    fn test_search_filter_requires_all_pairs() {
        let (_tmp, index) = open_temp();
        let mut rec = record("a", vec![1.0, 0.0], "c1");
        rec.metadata.insert("author".to_string(), "u1".to_string());
        index.add(rec).unwrap();

        let matching = meta(&[("channel", "c1"), ("author", "u1")]);
        assert_eq!(index.search(&[1.0, 0.0], 10, Some(&matching)).len(), 1);

        let partial = meta(&[("channel", "c1"), ("author", "u2")]);
        assert!(index.search(&[1.0, 0.0], 10, Some(&partial)).is_empty());
    }

    #[test]
    fn test_self_similarity_is_one() {
        let (_tmp, index) = open_temp();
        index.add(record("a", vec![0.3, -0.7, 0.2], "c1")).unwrap();

        let stored = index.get("a").unwrap();
        let results = index.search(&stored.embedding, 1, None);
        assert!((results[0].score.unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_delete_invariants() {
        let (_tmp, index) = open_temp();
        index
            .add_batch(vec![
                record("a", vec![1.0, 0.0], "c1"),
                record("b", vec![0.0, 1.0], "c1"),
                record("c", vec![1.0, 1.0], "c1"),
            ])
            .unwrap();

        assert!(index.delete("b").unwrap());
        assert!(!index.delete("b").unwrap());

        assert_eq!(index.len(), 2);
        assert!(index.get("b").is_none());
        // Remaining ids still resolve after the row shift.
        assert_eq!(index.get("a").unwrap().id, "a");
        assert_eq!(index.get("c").unwrap().id, "c");

        let results = index.search(&[0.0, 1.0], 10, None);
        assert!(results.iter().all(|r| r.id != "b"));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let index = VectorIndex::open(tmp.path()).unwrap();
            index
                .add_batch(vec![
                    record("a", vec![1.0, 0.0], "c1"),
                    record("b", vec![0.0, 1.0], "c2"),
                ])
                .unwrap();
        }

        let reopened = VectorIndex::open(tmp.path()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.dims(), Some(2));
        assert_eq!(reopened.get("a").unwrap().embedding, vec![1.0, 0.0]);

        // Insertion order (and so tie-breaking) survives the reload.
        let results = reopened.search(&[0.0, 0.0], 10, None);
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_reload_rebuilds_disagreeing_matrix() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let index = VectorIndex::open(tmp.path()).unwrap();
            index
                .add_batch(vec![
                    record("a", vec![1.0, 0.0], "c1"),
                    record("b", vec![0.0, 1.0], "c1"),
                ])
                .unwrap();
        }

        // Truncate the matrix to simulate a crash between the two writes.
        std::fs::write(tmp.path().join(VECTORS_FILE), [0u8; 4]).unwrap();

        let reopened = VectorIndex::open(tmp.path()).unwrap();
        assert_eq!(reopened.len(), 2);

        // The matrix was regenerated from the record set.
        let bytes = std::fs::read(tmp.path().join(VECTORS_FILE)).unwrap();
        assert_eq!(bytes.len(), 8 + 2 * 2 * 4);
    }

    #[test]
    fn test_corrupt_records_starts_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join(RECORDS_FILE), b"{not json").unwrap();

        let index = VectorIndex::open(tmp.path()).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_clear_empties_index_and_persists() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let index = VectorIndex::open(tmp.path()).unwrap();
            index
                .add_batch(vec![
                    record("a", vec![1.0, 0.0], "c1"),
                    record("b", vec![0.0, 1.0], "c1"),
                ])
                .unwrap();

            index.clear().unwrap();
            assert!(index.is_empty());
            assert_eq!(index.dims(), None);
            assert!(index.search(&[1.0, 0.0], 10, None).is_empty());
        }

        // The cleared state was flushed, not just dropped from memory.
        let reopened = VectorIndex::open(tmp.path()).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_dims_reset_when_emptied() {
        let (_tmp, index) = open_temp();
        index.add(record("a", vec![1.0, 0.0], "c1")).unwrap();
        index.delete("a").unwrap();
        assert_eq!(index.dims(), None);

        // A different dimensionality is acceptable for a fresh corpus.
        index.add(record("b", vec![1.0, 0.0, 0.0], "c1")).unwrap();
        assert_eq!(index.dims(), Some(3));
    }
}
