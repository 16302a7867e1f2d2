//! In-memory vector index of carrier guideline documents, optionally written
//! through to the database so it survives restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::embeddings::{Embedder, Embedding, cosine_similarity};
use crate::error::GuidelineError;
use crate::store::{Database, StoredGuideline};

/// A guideline document as indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidelineDocument {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A query hit. `score` is in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidelineMatch {
    pub document: GuidelineDocument,
    pub score: f32,
}

struct IndexedGuideline {
    document: GuidelineDocument,
    embedding: Embedding,
}

/// Similarity-searchable guideline index.
///
/// Queries take a read lock and may overlap each other; indexing the same id
/// concurrently is last-writer-wins.
pub struct GuidelineStore {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<HashMap<String, IndexedGuideline>>,
    db: Option<Arc<dyn Database>>,
}

impl GuidelineStore {
    /// Purely in-memory store.
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    /// Store that persists every indexed document.
    pub fn with_database(embedder: Arc<dyn Embedder>, db: Arc<dyn Database>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(HashMap::new()),
            db: Some(db),
        }
    }

    /// Insert or replace a document's vector.
    pub async fn index(
        &self,
        document_id: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<(), GuidelineError> {
        if document_id.trim().is_empty() {
            return Err(GuidelineError::InvalidInput(
                "document id must not be empty".to_string(),
            ));
        }
        if text.trim().is_empty() {
            return Err(GuidelineError::InvalidInput(format!(
                "guideline '{document_id}' has empty text"
            )));
        }

        // Embed outside the lock so queries are not blocked on the model.
        let embedding = self.embedder.embed(text).await?;
        let document = GuidelineDocument {
            id: document_id.to_string(),
            text: text.to_string(),
            metadata,
        };

        if let Some(db) = &self.db {
            db.upsert_guideline(&StoredGuideline {
                id: document.id.clone(),
                text: document.text.clone(),
                metadata: document.metadata.clone(),
                embedding: embedding.clone(),
                updated_at: Utc::now(),
            })
            .await?;
        }

        self.entries.write().await.insert(
            document.id.clone(),
            IndexedGuideline {
                document,
                embedding,
            },
        );
        debug!(document_id, "Guideline indexed");
        Ok(())
    }

    /// Documents scoring at least `min_similarity`, best first, at most `top_k`.
    pub async fn query(
        &self,
        text: &str,
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<GuidelineMatch>, GuidelineError> {
        if text.trim().is_empty() {
            return Err(GuidelineError::InvalidInput(
                "query text must not be empty".to_string(),
            ));
        }
        let query_vec = self.embedder.embed(text).await?;

        let entries = self.entries.read().await;
        let mut matches: Vec<GuidelineMatch> = entries
            .values()
            .map(|entry| GuidelineMatch {
                document: entry.document.clone(),
                score: cosine_similarity(&query_vec, &entry.embedding).clamp(0.0, 1.0),
            })
            .filter(|m| m.score >= min_similarity)
            .collect();
        drop(entries);

        // Id tiebreak keeps the order stable across HashMap iteration orders.
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    /// Restore the index from persisted rows. Rows embedded with a different
    /// dimension than the current embedder are re-embedded.
    pub async fn load_from_db(&self) -> Result<usize, GuidelineError> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let rows = db.list_guidelines().await?;
        let mut loaded = 0;
        for row in rows {
            if row.embedding.len() != self.embedder.dimension() {
                warn!(document_id = %row.id, "Stored embedding dimension mismatch, re-indexing");
                self.index(&row.id, &row.text, row.metadata).await?;
            } else {
                self.entries.write().await.insert(
                    row.id.clone(),
                    IndexedGuideline {
                        document: GuidelineDocument {
                            id: row.id,
                            text: row.text,
                            metadata: row.metadata,
                        },
                        embedding: row.embedding,
                    },
                );
            }
            loaded += 1;
        }
        info!(count = loaded, "Guidelines loaded from database");
        Ok(loaded)
    }

    /// Index every `.md` / `.txt` file in `dir`, using the file stem as id.
    pub async fn index_directory(&self, dir: &Path) -> Result<usize, GuidelineError> {
        let mut read_dir = tokio::fs::read_dir(dir).await.map_err(|e| {
            GuidelineError::InvalidInput(format!("cannot read {}: {e}", dir.display()))
        })?;

        let mut indexed = 0;
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| {
            GuidelineError::InvalidInput(format!("cannot read {}: {e}", dir.display()))
        })? {
            let path = entry.path();
            let is_text = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("md" | "txt")
            );
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_text {
                continue;
            }
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable guideline file");
                    continue;
                }
            };
            if text.trim().is_empty() {
                warn!(path = %path.display(), "Skipping empty guideline file");
                continue;
            }
            self.index(
                stem,
                &text,
                serde_json::json!({ "source": path.display().to_string() }),
            )
            .await?;
            indexed += 1;
        }
        info!(dir = %dir.display(), count = indexed, "Guideline directory indexed");
        Ok(indexed)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
