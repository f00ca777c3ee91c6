// src/index/mod.rs
//
// The semantic tool index. Answers "which tools match this description"
// from an in-memory vector table that is rebuilt in the background whenever
// the catalog changes and persisted per profile. Queries never wait for the
// warm-up: they score whatever subset is embedded and say so.

mod embedder;
mod store;

pub use embedder::{cosine, tokenize, Embedder, LexicalEmbedder, DEFAULT_DIMENSIONS};
pub use store::{IndexMeta, VectorRecord, VectorStore};

use crate::catalog::{CatalogSnapshot, ToolRecord};
use crate::error::Result;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Embeddings computed concurrently during warm-up.
const EMBED_CONCURRENCY: usize = 4;
/// Metadata progress is persisted every this many new vectors.
const FLUSH_EVERY: usize = 16;

#[derive(Debug, Clone)]
struct IndexedVector {
    vector: Vec<f32>,
    desc_hash: String,
    schema_hash: String,
}

#[derive(Default)]
struct IndexState {
    fingerprint: String,
    vectors: HashMap<String, IndexedVector>,
}

#[derive(Debug, Clone, Default)]
pub struct FindFilters {
    pub providers: Option<Vec<String>>,
    pub substring: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FindMatch {
    pub qualified_name: String,
    pub score: f32,
    pub provider: String,
    pub title: Option<String>,
    pub description: String,
    pub available: bool,
}

#[derive(Debug, Clone)]
pub struct FindResponse {
    pub matches: Vec<FindMatch>,
    /// Candidates that survived the filters, before truncation to `limit`.
    pub total: usize,
    pub indexing_in_progress: bool,
    pub indexed: usize,
    pub total_tools: usize,
}

pub struct SemanticIndex {
    embedder: Arc<dyn Embedder>,
    store: Option<VectorStore>,
    state: RwLock<IndexState>,
    /// Held by the active rebuild; fsynced on graceful shutdown.
    writer: Mutex<Option<store::VectorWriter>>,
}

impl SemanticIndex {
    pub fn new(embedder: Arc<dyn Embedder>, store: Option<VectorStore>) -> Self {
        SemanticIndex {
            embedder,
            store,
            state: RwLock::new(IndexState::default()),
            writer: Mutex::new(None),
        }
    }

    pub fn indexed(&self) -> usize {
        self.state.read().map(|s| s.vectors.len()).unwrap_or(0)
    }

    /// Follow catalog changes until the sender side goes away. Intended to
    /// run as a background task: `tokio::spawn(index.run(rx))`.
    pub async fn run(self: Arc<Self>, mut catalog: watch::Receiver<CatalogSnapshot>) {
        loop {
            let snapshot = catalog.borrow_and_update().clone();
            if !snapshot.is_empty() || !snapshot.fingerprint().is_empty() {
                if let Err(e) = self.rebuild(&snapshot).await {
                    warn!("index rebuild failed: {e}");
                }
            }
            if catalog.changed().await.is_err() {
                break;
            }
        }
    }

    /// Bring the index in line with one catalog snapshot: reuse what can be
    /// reused (memory first, then the persisted store), embed the rest in a
    /// bounded worker pool, and persist the new generation.
    pub async fn rebuild(&self, snapshot: &CatalogSnapshot) -> Result<()> {
        let fingerprint = snapshot.fingerprint().to_string();
        {
            let state = self.state.read().expect("index state poisoned");
            if state.fingerprint == fingerprint && state.vectors.len() >= snapshot.len() {
                return Ok(()); // already current
            }
        }

        let mut reusable: HashMap<String, IndexedVector> = HashMap::new();

        // In-memory vectors survive a reload when the tool is unchanged.
        {
            let state = self.state.read().expect("index state poisoned");
            for tool in snapshot.iter() {
                if let Some(existing) = state.vectors.get(&tool.qualified_name) {
                    if existing.desc_hash == tool.description_hash()
                        && existing.schema_hash == tool.schema_hash()
                    {
                        reusable.insert(tool.qualified_name.clone(), existing.clone());
                    }
                }
            }
        }

        // Then the persisted store: wholesale on a fingerprint match,
        // otherwise record-by-record where the {name, description, schema}
        // triple still holds.
        if let Some(store) = &self.store {
            if let Some((meta, records)) = store.load() {
                if meta.model_id == self.embedder.model_id() {
                    let wholesale = meta.fingerprint == fingerprint;
                    for record in records {
                        if reusable.contains_key(&record.qualified_name) {
                            continue;
                        }
                        if record.vector.len() != self.embedder.dimensions() {
                            continue;
                        }
                        let Some(tool) = snapshot.get(&record.qualified_name) else {
                            continue;
                        };
                        if wholesale
                            || (record.desc_hash == tool.description_hash()
                                && record.schema_hash == tool.schema_hash())
                        {
                            reusable.insert(
                                record.qualified_name.clone(),
                                IndexedVector {
                                    vector: record.vector,
                                    desc_hash: record.desc_hash,
                                    schema_hash: record.schema_hash,
                                },
                            );
                        }
                    }
                } else {
                    debug!(
                        "persisted index was built by {}, current model is {}; discarding",
                        meta.model_id,
                        self.embedder.model_id()
                    );
                }
            }
        }

        // Publish the partial state before embedding starts so queries see
        // the reused subset immediately.
        {
            let mut state = self.state.write().expect("index state poisoned");
            state.fingerprint = fingerprint.clone();
            state.vectors = reusable.clone();
        }

        // New store generation seeded with the reused vectors.
        if let Some(store) = &self.store {
            let mut writer = store.begin(IndexMeta {
                fingerprint: fingerprint.clone(),
                model_id: self.embedder.model_id().to_string(),
                total_tools: snapshot.len(),
                indexed_tools: 0,
                completed_at: None,
            })?;
            for (name, indexed) in &reusable {
                writer.append(&VectorRecord {
                    qualified_name: name.clone(),
                    desc_hash: indexed.desc_hash.clone(),
                    schema_hash: indexed.schema_hash.clone(),
                    vector: indexed.vector.clone(),
                })?;
            }
            writer.flush_progress(reusable.len())?;
            *self.writer.lock().expect("writer lock poisoned") = Some(writer);
        }

        let missing: Vec<ToolRecord> = snapshot
            .iter()
            .filter(|tool| !reusable.contains_key(&tool.qualified_name))
            .cloned()
            .collect();
        let missing_count = missing.len();

        let embedder = self.embedder.clone();
        let mut embedded = futures::stream::iter(missing.into_iter().map(|tool| {
            let embedder = embedder.clone();
            async move {
                let vector = embedder.embed(&tool.embedding_text()).await;
                (tool, vector)
            }
        }))
        .buffer_unordered(EMBED_CONCURRENCY);

        let mut since_flush = 0usize;
        while let Some((tool, vector)) = embedded.next().await {
            let vector = match vector {
                Ok(vector) => vector,
                Err(e) => {
                    warn!(tool = %tool.qualified_name, "embedding failed: {e}");
                    continue;
                }
            };
            let indexed = IndexedVector {
                vector: vector.clone(),
                desc_hash: tool.description_hash(),
                schema_hash: tool.schema_hash(),
            };

            let count = {
                let mut state = self.state.write().expect("index state poisoned");
                if state.fingerprint != fingerprint {
                    // A newer snapshot superseded this rebuild.
                    return Ok(());
                }
                state
                    .vectors
                    .insert(tool.qualified_name.clone(), indexed.clone());
                state.vectors.len()
            };

            if let Some(writer) = self.writer.lock().expect("writer lock poisoned").as_mut() {
                writer.append(&VectorRecord {
                    qualified_name: tool.qualified_name.clone(),
                    desc_hash: indexed.desc_hash,
                    schema_hash: indexed.schema_hash,
                    vector,
                })?;
                since_flush += 1;
                if since_flush >= FLUSH_EVERY {
                    writer.flush_progress(count)?;
                    since_flush = 0;
                }
            }
        }

        let indexed = self.indexed();
        if let Some(writer) = self.writer.lock().expect("writer lock poisoned").as_mut() {
            writer.complete(indexed)?;
        }
        if missing_count > 0 {
            info!(
                embedded = missing_count,
                reused = reusable.len(),
                "semantic index warm-up complete"
            );
        }
        Ok(())
    }

    /// fsync the store; called on graceful shutdown.
    pub fn sync(&self) {
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(writer) = guard.as_mut() {
                if let Err(e) = writer.sync() {
                    warn!("index sync failed: {e}");
                }
            }
        }
    }

    /// Top-k query against whatever subset of the catalog is embedded.
    pub async fn query(
        &self,
        snapshot: &CatalogSnapshot,
        text: &str,
        limit: usize,
        filters: &FindFilters,
    ) -> Result<FindResponse> {
        let query_vector = self.embedder.embed(text).await?;
        let query_terms = tokenize(text);

        let state = self.state.read().expect("index state poisoned");
        let indexed = snapshot
            .iter()
            .filter(|tool| state.vectors.contains_key(&tool.qualified_name))
            .count();
        let total_tools = snapshot.len();

        // Exact filters narrow the candidate set before ranking.
        let mut scored: Vec<(&ToolRecord, f32, usize)> = snapshot
            .iter()
            .filter(|tool| match &filters.providers {
                Some(providers) => providers.iter().any(|p| *p == tool.provider),
                None => true,
            })
            .filter_map(|tool| {
                let indexed = state.vectors.get(&tool.qualified_name)?;
                let score = cosine(&query_vector, &indexed.vector);
                let overlap = name_overlap(&query_terms, &tool.local_name);
                Some((tool, score, overlap))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.2.cmp(&a.2))
                .then_with(|| a.0.qualified_name.cmp(&b.0.qualified_name))
        });

        // Fuzzy substring filter applies after ranking.
        let needle = filters.substring.as_ref().map(|s| s.to_lowercase());
        let filtered: Vec<&(&ToolRecord, f32, usize)> = scored
            .iter()
            .filter(|(tool, _, _)| match &needle {
                Some(needle) => {
                    tool.qualified_name.to_lowercase().contains(needle)
                        || tool.description.to_lowercase().contains(needle)
                }
                None => true,
            })
            .collect();

        let total = filtered.len();
        let matches = filtered
            .into_iter()
            .take(limit)
            .map(|(tool, score, _)| FindMatch {
                qualified_name: tool.qualified_name.clone(),
                score: *score,
                provider: tool.provider.clone(),
                title: tool.title.clone(),
                description: tool.description.clone(),
                available: tool.available,
            })
            .collect();

        Ok(FindResponse {
            matches,
            total,
            indexing_in_progress: indexed < total_tools,
            indexed,
            total_tools,
        })
    }
}

fn name_overlap(query_terms: &[String], local_name: &str) -> usize {
    let name_terms = tokenize(local_name);
    query_terms
        .iter()
        .filter(|term| name_terms.iter().any(|n| n == *term))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{IngestedTool, ProviderListing};
    use crate::error::Result as GwResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn snapshot(tools: &[(&str, &str, &str)]) -> CatalogSnapshot {
        let mut by_provider: HashMap<String, Vec<IngestedTool>> = HashMap::new();
        for (provider, name, desc) in tools {
            by_provider
                .entry(provider.to_string())
                .or_default()
                .push(IngestedTool {
                    name: name.to_string(),
                    title: None,
                    description: desc.to_string(),
                    input_schema: json!({"type": "object"}),
                    source_revision: "1".to_string(),
                });
        }
        let listings: Vec<ProviderListing> = by_provider
            .into_iter()
            .map(|(provider, tools)| ProviderListing {
                source_identity: format!("cmd-{provider}"),
                provider,
                available: true,
                tools,
            })
            .collect();
        CatalogSnapshot::build(&listings)
    }

    /// Wraps the lexical embedder and counts calls, for cache-reuse tests.
    struct CountingEmbedder {
        inner: LexicalEmbedder,
        calls: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new() -> Self {
            CountingEmbedder {
                inner: LexicalEmbedder::default(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> GwResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text).await
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn model_id(&self) -> &str {
            self.inner.model_id()
        }
    }

    fn lexical_index() -> SemanticIndex {
        SemanticIndex::new(Arc::new(LexicalEmbedder::default()), None)
    }

    #[tokio::test]
    async fn test_query_finds_the_obvious_tool() {
        let index = lexical_index();
        let snap = snapshot(&[
            ("p1", "echo", "echo a string back to the caller"),
            ("p1", "delete_cluster", "tear down a kubernetes cluster"),
        ]);
        index.rebuild(&snap).await.unwrap();

        let result = index
            .query(&snap, "repeat echo text", 3, &FindFilters::default())
            .await
            .unwrap();
        assert_eq!(result.matches[0].qualified_name, "p1:echo");
        assert!(result.matches[0].score > 0.0);
        assert!(!result.indexing_in_progress);
        assert_eq!(result.indexed, 2);
        assert_eq!(result.total_tools, 2);
    }

    #[tokio::test]
    async fn test_query_limit_zero_returns_empty_not_error() {
        let index = lexical_index();
        let snap = snapshot(&[("p1", "echo", "echo")]);
        index.rebuild(&snap).await.unwrap();

        let result = index
            .query(&snap, "echo", 0, &FindFilters::default())
            .await
            .unwrap();
        assert!(result.matches.is_empty());
        assert_eq!(result.total, 1);
    }

    #[tokio::test]
    async fn test_provider_filter_is_exact() {
        let index = lexical_index();
        let snap = snapshot(&[
            ("gh", "search", "search code on github"),
            ("jira", "search", "search jira issues"),
        ]);
        index.rebuild(&snap).await.unwrap();

        let filters = FindFilters {
            providers: Some(vec!["jira".to_string()]),
            substring: None,
        };
        let result = index.query(&snap, "search", 10, &filters).await.unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].provider, "jira");
    }

    #[tokio::test]
    async fn test_substring_filter_applies_after_ranking() {
        let index = lexical_index();
        let snap = snapshot(&[
            ("p1", "list_repos", "list github repositories"),
            ("p1", "list_users", "list github users"),
        ]);
        index.rebuild(&snap).await.unwrap();

        let filters = FindFilters {
            providers: None,
            substring: Some("repos".to_string()),
        };
        let result = index.query(&snap, "list things", 10, &filters).await.unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].qualified_name, "p1:list_repos");
    }

    #[tokio::test]
    async fn test_tiebreak_is_deterministic() {
        let index = lexical_index();
        // Two identical descriptions: scores tie, name overlap ties, the
        // lexicographically smaller qualified name must come first.
        let snap = snapshot(&[("p1", "beta", "same words"), ("p1", "alpha", "same words")]);
        index.rebuild(&snap).await.unwrap();

        let result = index
            .query(&snap, "same words", 2, &FindFilters::default())
            .await
            .unwrap();
        assert_eq!(result.matches[0].qualified_name, "p1:alpha");
        assert_eq!(result.matches[1].qualified_name, "p1:beta");
    }

    #[tokio::test]
    async fn test_matches_are_subset_of_catalog() {
        let index = lexical_index();
        let snap = snapshot(&[("p1", "one", "first tool"), ("p2", "two", "second tool")]);
        index.rebuild(&snap).await.unwrap();
        let result = index
            .query(&snap, "tool", 10, &FindFilters::default())
            .await
            .unwrap();
        for m in &result.matches {
            assert!(snap.contains(&m.qualified_name));
        }
    }

    #[tokio::test]
    async fn test_persisted_index_is_reused_without_reembedding() {
        let dir = TempDir::new().unwrap();
        let snap = snapshot(&[
            ("p1", "echo", "echo a string"),
            ("p1", "ping", "check liveness"),
        ]);

        // First run embeds and persists.
        {
            let index = SemanticIndex::new(
                Arc::new(LexicalEmbedder::default()),
                Some(VectorStore::for_profile(dir.path(), "default")),
            );
            index.rebuild(&snap).await.unwrap();
            assert_eq!(index.indexed(), 2);
        }

        // Second run with the same fingerprint must not embed anything.
        let counting = Arc::new(CountingEmbedder::new());
        let index = SemanticIndex::new(
            counting.clone(),
            Some(VectorStore::for_profile(dir.path(), "default")),
        );
        index.rebuild(&snap).await.unwrap();
        assert_eq!(index.indexed(), 2);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);

        // And queries over the reloaded index still answer correctly
        // (one embed call for the query itself).
        let result = index
            .query(&snap, "echo a string", 1, &FindFilters::default())
            .await
            .unwrap();
        assert_eq!(result.matches[0].qualified_name, "p1:echo");
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert!(!result.indexing_in_progress);
    }

    #[tokio::test]
    async fn test_changed_tool_is_reembedded_others_reused() {
        let dir = TempDir::new().unwrap();
        let before = snapshot(&[
            ("p1", "echo", "echo a string"),
            ("p1", "ping", "check liveness"),
        ]);
        {
            let index = SemanticIndex::new(
                Arc::new(LexicalEmbedder::default()),
                Some(VectorStore::for_profile(dir.path(), "default")),
            );
            index.rebuild(&before).await.unwrap();
        }

        // One description changed: only that tool re-embeds.
        let after = snapshot(&[
            ("p1", "echo", "echo a string loudly"),
            ("p1", "ping", "check liveness"),
        ]);
        let counting = Arc::new(CountingEmbedder::new());
        let index = SemanticIndex::new(
            counting.clone(),
            Some(VectorStore::for_profile(dir.path(), "default")),
        );
        index.rebuild(&after).await.unwrap();
        assert_eq!(index.indexed(), 2);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }
}
