//! Context retrieval for the agent loop.
//!
//! A [`Retriever`] turns a user query into a block of context text that is
//! folded into the user turn. [`KeywordRetriever`] indexes plain-text files
//! into the [`storage::KnowledgeStore`] and scores chunks by how many query
//! terms they contain.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};

use storage::{Chunk, KnowledgeStore};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.3;
pub const DEFAULT_TOP_K: usize = 5;
pub const MAX_CHUNK_CHARS: usize = 1000;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("no index for knowledge label `{0}`")]
    UnknownLabel(String),

    #[error("nothing to index under {}", .0.display())]
    NothingToIndex(PathBuf),

    #[error("retrieval is not configured")]
    Unsupported,

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] storage::Error),
}

/// Outcome of indexing a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSummary {
    pub label: String,
    pub files: usize,
    pub chunks: usize,
}

/// Source of context for a query.
pub trait Retriever: Send + Sync {
    /// Context for `query`, or an empty string when nothing is relevant.
    /// With no label, no context is retrieved.
    fn retrieve(
        &self,
        query: &str,
        label: Option<&str>,
    ) -> impl Future<Output = Result<String, RetrievalError>> + Send;

    /// (Re)build the index for `label` from every file under `dir`.
    fn create_index(
        &self,
        dir: &Path,
        label: &str,
    ) -> impl Future<Output = Result<IndexSummary, RetrievalError>> + Send;

    fn delete_index(&self, label: &str) -> impl Future<Output = Result<(), RetrievalError>> + Send;
}

/// Retrieval disabled: every query gets no context.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetrieval;

impl Retriever for NoRetrieval {
    async fn retrieve(&self, _query: &str, _label: Option<&str>) -> Result<String, RetrievalError> {
        Ok(String::new())
    }

    async fn create_index(&self, _dir: &Path, _label: &str) -> Result<IndexSummary, RetrievalError> {
        Err(RetrievalError::Unsupported)
    }

    async fn delete_index(&self, _label: &str) -> Result<(), RetrievalError> {
        Err(RetrievalError::Unsupported)
    }
}

/// Term-coverage retriever over a [`KnowledgeStore`].
pub struct KeywordRetriever {
    store: KnowledgeStore,
    threshold: f32,
    top_k: usize,
}

impl KeywordRetriever {
    pub fn new(store: KnowledgeStore) -> Self {
        Self {
            store,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            top_k: DEFAULT_TOP_K,
        }
    }

    /// Minimum fraction of query terms a chunk must contain.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn labels(&self) -> Result<Vec<String>, RetrievalError> {
        Ok(self.store.labels()?)
    }

    fn search(&self, query: &str, label: &str) -> Result<String, RetrievalError> {
        let chunks = self.store.chunks(label)?;
        if chunks.is_empty() {
            return Err(RetrievalError::UnknownLabel(label.to_string()));
        }

        let terms = terms(query);
        if terms.is_empty() {
            return Ok(String::new());
        }

        let mut scored: Vec<(f32, &Chunk)> = chunks
            .iter()
            .map(|chunk| (coverage(&terms, &chunk.text), chunk))
            .filter(|(score, _)| *score >= self.threshold)
            .collect();
        // Stable sort keeps document order among equal scores.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(self.top_k);
        debug!(label, hits = scored.len(), "retrieved chunks");

        Ok(scored
            .iter()
            .enumerate()
            .map(|(i, (_, chunk))| format!("## {}:\n{}\n", i + 1, chunk.text))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn index(&self, dir: &Path, label: &str) -> Result<IndexSummary, RetrievalError> {
        let mut files = Vec::new();
        collect_files(dir, &mut files)?;
        files.sort();

        let mut chunks = Vec::new();
        let mut indexed = 0;
        for path in &files {
            let bytes = std::fs::read(path).map_err(|source| RetrievalError::Io {
                path: path.clone(),
                source,
            })?;
            let Ok(text) = String::from_utf8(bytes) else {
                debug!(path = %path.display(), "skipping non-UTF-8 file");
                continue;
            };
            let source = path.display().to_string();
            let before = chunks.len();
            chunks.extend(split_chunks(&text, MAX_CHUNK_CHARS).into_iter().map(|text| Chunk {
                source: source.clone(),
                text,
            }));
            if chunks.len() > before {
                indexed += 1;
            }
        }

        if chunks.is_empty() {
            return Err(RetrievalError::NothingToIndex(dir.to_path_buf()));
        }
        self.store.replace(label, &chunks)?;
        info!(label, files = indexed, chunks = chunks.len(), "index built");
        Ok(IndexSummary {
            label: label.to_string(),
            files: indexed,
            chunks: chunks.len(),
        })
    }
}

impl Retriever for KeywordRetriever {
    async fn retrieve(&self, query: &str, label: Option<&str>) -> Result<String, RetrievalError> {
        match label {
            Some(label) => self.search(query, label),
            None => Ok(String::new()),
        }
    }

    async fn create_index(&self, dir: &Path, label: &str) -> Result<IndexSummary, RetrievalError> {
        self.index(dir, label)
    }

    async fn delete_index(&self, label: &str) -> Result<(), RetrievalError> {
        if self.store.delete(label)? == 0 {
            return Err(RetrievalError::UnknownLabel(label.to_string()));
        }
        info!(label, "index deleted");
        Ok(())
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RetrievalError> {
    let io_err = |source: std::io::Error| RetrievalError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of `query_terms` that appear in `text`.
fn coverage(query_terms: &HashSet<String>, text: &str) -> f32 {
    let present = terms(text);
    let hits = query_terms.iter().filter(|t| present.contains(*t)).count();
    hits as f32 / query_terms.len() as f32
}

/// Split on blank lines, then pack paragraphs into chunks of at most
/// `max_chars` characters. Oversized paragraphs are cut on char boundaries.
fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    let paragraphs = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty());
    for paragraph in paragraphs {
        let pieces: Vec<String> = if paragraph.chars().count() > max_chars {
            paragraph
                .chars()
                .collect::<Vec<_>>()
                .chunks(max_chars)
                .map(|piece| piece.iter().collect())
                .collect()
        } else {
            vec![paragraph.to_string()]
        };

        for piece in pieces {
            let joined = current.chars().count() + 2 + piece.chars().count();
            if !current.is_empty() && joined > max_chars {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&piece);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
