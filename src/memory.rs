//! Incident memory: an exact nearest-neighbor store over embedded incidents.
//!
//! [`VectorIndex`] is a struct-of-arrays holding a flat embedding buffer and
//! the per-record metadata, co-indexed by position. Appends are atomic: a
//! record and its embedding are pushed together or not at all.
//!
//! [`IncidentStore`] wraps the index with an [`Embedder`] and on-disk
//! persistence. Search is brute-force squared Euclidean distance over every
//! stored vector; the corpus of one host's incidents is small enough that
//! exact top-k is cheaper than maintaining an approximate index.
//!
//! # On-disk format
//!
//! Two side-by-side artifacts in the memory directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `incidents.vec` | `LKOV` magic, `u32` dims, `u64` count, then `count × dims` little-endian `f32` |
//! | `incidents.json` | `{"dims": D, "records": [{"id", "text", "metadata"}]}` |
//!
//! Loading with either file missing yields an empty store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::embedding::{blob_to_vec, squared_l2, vec_to_blob, Embedder};
use crate::error::MemoryError;

/// Open-ended metadata attached to an incident (`problem`, `solution`,
/// `outcome`, `query`, `tools`, `timestamp`, ...).
pub type Metadata = Map<String, Value>;

const VECTOR_MAGIC: &[u8; 4] = b"LKOV";
const VECTOR_HEADER_LEN: usize = 4 + 4 + 8;

/// One remembered incident. The embedding lives in the [`VectorIndex`]
/// buffer at the same position as the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: usize,
    pub text: String,
    pub metadata: Metadata,
}

/// A search result, best match first.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: usize,
    pub text: String,
    pub metadata: Metadata,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
    /// `1 / (1 + distance)`, in `(0, 1]`.
    pub similarity: f32,
}

/// Embeddings and records, co-indexed by position.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dims: usize,
    data: Vec<f32>,
    records: Vec<IncidentRecord>,
}

impl VectorIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            data: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append one embedding and its record. Returns the new id.
    ///
    /// The record's id is assigned here so ids always equal positions.
    pub fn push(
        &mut self,
        embedding: &[f32],
        text: String,
        metadata: Metadata,
    ) -> Result<usize, MemoryError> {
        if embedding.len() != self.dims {
            return Err(MemoryError::Dimension {
                expected: self.dims,
                actual: embedding.len(),
            });
        }
        let id = self.records.len();
        self.data.extend_from_slice(embedding);
        self.records.push(IncidentRecord { id, text, metadata });
        debug_assert_eq!(self.data.len(), self.records.len() * self.dims);
        Ok(id)
    }

    pub fn embedding(&self, id: usize) -> Option<&[f32]> {
        if id >= self.records.len() {
            return None;
        }
        let start = id * self.dims;
        Some(&self.data[start..start + self.dims])
    }

    pub fn record(&self, id: usize) -> Option<&IncidentRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> &[IncidentRecord] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.records.clear();
    }

    /// Exact k-nearest neighbors of `query`, nearest first.
    ///
    /// Ties on distance are broken by insertion order.
    pub fn nearest(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if k == 0 || self.is_empty() || query.len() != self.dims {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dims)
            .enumerate()
            .map(|(id, v)| (id, squared_l2(query, v)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }
}

/// Paths of the two persisted artifacts.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub vectors: PathBuf,
    pub metadata: PathBuf,
}

impl StorePaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            vectors: dir.join("incidents.vec"),
            metadata: dir.join("incidents.json"),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MetadataFile {
    dims: usize,
    records: Vec<IncidentRecord>,
}

/// Persistent, semantically searchable incident memory.
pub struct IncidentStore {
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    paths: Option<StorePaths>,
}

impl IncidentStore {
    /// A store that lives only in memory; `save`/`load` are no-ops.
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            index: VectorIndex::new(embedder.dims()),
            embedder,
            paths: None,
        }
    }

    /// Open the store persisted in `dir`.
    ///
    /// Missing artifacts give an empty store. Unusable artifacts are logged
    /// and also give an empty store; the next `save` overwrites them.
    pub fn open(dir: &Path, embedder: Arc<dyn Embedder>) -> Self {
        let mut store = Self {
            index: VectorIndex::new(embedder.dims()),
            embedder,
            paths: Some(StorePaths::in_dir(dir)),
        };
        match store.load() {
            Ok(n) => tracing::debug!("loaded incident store with {} records", n),
            Err(e) => tracing::warn!("starting with an empty incident store: {}", e),
        }
        store
    }

    pub fn count(&self) -> usize {
        self.index.len()
    }

    pub fn dims(&self) -> usize {
        self.index.dims()
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn paths(&self) -> Option<&StorePaths> {
        self.paths.as_ref()
    }

    pub fn records(&self) -> &[IncidentRecord] {
        self.index.records()
    }

    pub fn embedding(&self, id: usize) -> Option<&[f32]> {
        self.index.embedding(id)
    }

    /// Embed `text` and remember it. Returns the new record's id.
    ///
    /// `added_at` (RFC 3339) is stamped into the metadata unless present.
    pub async fn add(&mut self, text: &str, metadata: Metadata) -> Result<usize, MemoryError> {
        let mut ids = self.add_batch(&[text.to_string()], vec![metadata]).await?;
        ids.pop()
            .ok_or_else(|| MemoryError::Embedding("embedder returned no vector".to_string()))
    }

    /// Embed all `texts` in one embedder call and remember them in order.
    ///
    /// `texts` and `metadata` must have the same length. Nothing is stored
    /// unless every text was embedded successfully.
    pub async fn add_batch(
        &mut self,
        texts: &[String],
        metadata: Vec<Metadata>,
    ) -> Result<Vec<usize>, MemoryError> {
        if texts.len() != metadata.len() {
            return Err(MemoryError::BatchLength {
                texts: texts.len(),
                metadata: metadata.len(),
            });
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self
            .embedder
            .embed(texts)
            .await
            .map_err(|e| MemoryError::Embedding(format!("{:#}", e)))?;
        if vectors.len() != texts.len() {
            return Err(MemoryError::Embedding(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.index.dims()) {
            return Err(MemoryError::Dimension {
                expected: self.index.dims(),
                actual: bad.len(),
            });
        }

        let added_at = chrono::Utc::now().to_rfc3339();
        let mut ids = Vec::with_capacity(texts.len());
        for ((text, vector), mut meta) in texts.iter().zip(vectors.iter()).zip(metadata) {
            meta.entry("added_at")
                .or_insert_with(|| Value::String(added_at.clone()));
            ids.push(self.index.push(vector, text.clone(), meta)?);
        }
        Ok(ids)
    }

    /// The `k` stored incidents closest to `query`, most similar first.
    ///
    /// Returns `min(k, count)` hits; an empty store returns no hits without
    /// calling the embedder.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, MemoryError> {
        if self.index.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = crate::embedding::embed_one(self.embedder.as_ref(), query)
            .await
            .map_err(|e| MemoryError::Embedding(format!("{:#}", e)))?;
        if query_vec.len() != self.index.dims() {
            return Err(MemoryError::Dimension {
                expected: self.index.dims(),
                actual: query_vec.len(),
            });
        }

        let hits = self
            .index
            .nearest(&query_vec, k)
            .into_iter()
            .filter_map(|(id, distance)| {
                self.index.record(id).map(|r| SearchHit {
                    id,
                    text: r.text.clone(),
                    metadata: r.metadata.clone(),
                    distance,
                    similarity: 1.0 / (1.0 + distance),
                })
            })
            .collect();
        Ok(hits)
    }

    /// Write both artifacts. Each file is written to a temp path and renamed.
    pub fn save(&self) -> Result<(), MemoryError> {
        let Some(paths) = &self.paths else {
            return Ok(());
        };
        for path in [&paths.vectors, &paths.metadata] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MemoryError::persistence(parent, e))?;
            }
        }

        let mut vec_bytes = Vec::with_capacity(VECTOR_HEADER_LEN + self.index.data.len() * 4);
        vec_bytes.extend_from_slice(VECTOR_MAGIC);
        vec_bytes.extend_from_slice(&(self.index.dims() as u32).to_le_bytes());
        vec_bytes.extend_from_slice(&(self.index.len() as u64).to_le_bytes());
        vec_bytes.extend_from_slice(&vec_to_blob(&self.index.data));

        let meta = MetadataFile {
            dims: self.index.dims(),
            records: self.index.records().to_vec(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| MemoryError::persistence(&paths.metadata, e))?;

        write_atomic(&paths.vectors, &vec_bytes)?;
        write_atomic(&paths.metadata, &meta_bytes)?;
        tracing::debug!("saved incident store with {} records", self.index.len());
        Ok(())
    }

    /// Replace the in-memory contents with the persisted artifacts.
    ///
    /// Returns the number of records loaded. A missing artifact (either of
    /// the pair) is not an error and leaves the store empty. On any error
    /// the store is also left empty.
    pub fn load(&mut self) -> Result<usize, MemoryError> {
        self.index.clear();
        let Some(paths) = self.paths.clone() else {
            return Ok(0);
        };
        if !paths.vectors.exists() || !paths.metadata.exists() {
            return Ok(0);
        }

        let loaded = read_artifacts(&paths, self.index.dims())?;
        self.index = loaded;
        Ok(self.index.len())
    }
}

fn read_artifacts(paths: &StorePaths, dims: usize) -> Result<VectorIndex, MemoryError> {
    let vec_bytes =
        std::fs::read(&paths.vectors).map_err(|e| MemoryError::persistence(&paths.vectors, e))?;
    if vec_bytes.len() < VECTOR_HEADER_LEN || &vec_bytes[..4] != VECTOR_MAGIC {
        return Err(MemoryError::persistence(&paths.vectors, "bad header"));
    }
    let file_dims = u32::from_le_bytes([vec_bytes[4], vec_bytes[5], vec_bytes[6], vec_bytes[7]]) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&vec_bytes[8..16]);
    let count = u64::from_le_bytes(count_bytes) as usize;

    if file_dims != dims {
        return Err(MemoryError::persistence(
            &paths.vectors,
            format!("stored dims {} differ from embedder dims {}", file_dims, dims),
        ));
    }
    let payload = &vec_bytes[VECTOR_HEADER_LEN..];
    let expected_len = count
        .checked_mul(dims)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| MemoryError::persistence(&paths.vectors, "count overflow"))?;
    if payload.len() != expected_len {
        return Err(MemoryError::persistence(
            &paths.vectors,
            format!("expected {} payload bytes, found {}", expected_len, payload.len()),
        ));
    }

    let meta_bytes =
        std::fs::read(&paths.metadata).map_err(|e| MemoryError::persistence(&paths.metadata, e))?;
    let meta: MetadataFile = serde_json::from_slice(&meta_bytes)
        .map_err(|e| MemoryError::persistence(&paths.metadata, e))?;
    if meta.dims != dims || meta.records.len() != count {
        return Err(MemoryError::persistence(
            &paths.metadata,
            format!(
                "{} records at {} dims do not pair with {} vectors at {} dims",
                meta.records.len(),
                meta.dims,
                count,
                dims
            ),
        ));
    }

    let data = blob_to_vec(payload);
    let mut index = VectorIndex::new(dims);
    for (position, (record, vector)) in meta
        .records
        .into_iter()
        .zip(data.chunks_exact(dims.max(1)))
        .enumerate()
    {
        if record.id != position {
            return Err(MemoryError::persistence(
                &paths.metadata,
                format!("record at position {} has id {}", position, record.id),
            ));
        }
        index.push(vector, record.text, record.metadata)?;
    }
    Ok(index)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), MemoryError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(|e| MemoryError::persistence(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| MemoryError::persistence(path, e))
}

/// Build a [`Metadata`] map from string pairs.
pub fn metadata_from<I, K, V>(pairs: I) -> Metadata
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
