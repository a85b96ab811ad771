//! RAG store seam
//!
//! The vector store is external; the daemon only queries it for loop context
//! and indexes successful worker API patterns back into it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::store::StoreError;

/// Collection holding worker API usage patterns
pub const API_PATTERNS: &str = "api_patterns";

/// A RAG lookup request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagQuery {
    /// Agent codename from the profile
    pub codename: String,
    /// Trigger descriptor of the current loop
    pub trigger: String,
    /// Optional free text from the triggering message
    pub text: Option<String>,
    pub top_k: usize,
}

/// One retrieved chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagHit {
    pub content: String,
    pub score: f32,
}

/// The RAG store the daemon retrieves context from
#[async_trait]
pub trait RagStore: Send + Sync {
    async fn query(&self, query: &RagQuery) -> Result<Vec<RagHit>, StoreError>;
    async fn index(&self, collection: &str, id: &str, content: &str) -> Result<(), StoreError>;
}

/// Concatenate hits up to a character budget, newline-separated
pub fn join_hits(hits: &[RagHit], max_chars: usize) -> String {
    let mut out = String::new();
    for hit in hits {
        if out.len() + hit.content.len() + 1 > max_chars {
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&hit.content);
    }
    out
}

/// In-memory RAG store: naive keyword overlap scoring, good enough for tests
#[derive(Default)]
pub struct MemoryRag {
    docs: Mutex<Vec<(String, String, String)>>,
}

impl MemoryRag {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RagStore for MemoryRag {
    async fn query(&self, query: &RagQuery) -> Result<Vec<RagHit>, StoreError> {
        let needle = format!(
            "{} {} {}",
            query.codename,
            query.trigger,
            query.text.as_deref().unwrap_or("")
        )
        .to_lowercase();
        let words: Vec<&str> = needle.split_whitespace().collect();

        let docs = self.docs.lock().await;
        let mut hits: Vec<RagHit> = docs
            .iter()
            .map(|(_, _, content)| {
                let lower = content.to_lowercase();
                let score = words.iter().filter(|w| lower.contains(**w)).count() as f32;
                RagHit {
                    content: content.clone(),
                    score,
                }
            })
            .filter(|h| h.score > 0.0)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(query.top_k);
        Ok(hits)
    }

    async fn index(&self, collection: &str, id: &str, content: &str) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().await;
        docs.retain(|(c, i, _)| !(c == collection && i == id));
        docs.push((collection.to_string(), id.to_string(), content.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_ranks_by_overlap() {
        let rag = MemoryRag::new();
        rag.index("kb", "1", "atlas quarterly revenue report").await.unwrap();
        rag.index("kb", "2", "unrelated gardening notes").await.unwrap();

        let hits = rag
            .query(&RagQuery {
                codename: "atlas".into(),
                trigger: "scheduled".into(),
                text: Some("revenue".into()),
                top_k: 5,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("revenue"));
    }

    #[tokio::test]
    async fn test_index_replaces_same_id() {
        let rag = MemoryRag::new();
        rag.index("kb", "1", "atlas alpha").await.unwrap();
        rag.index("kb", "1", "atlas beta").await.unwrap();

        let hits = rag
            .query(&RagQuery {
                codename: "atlas".into(),
                trigger: "scheduled".into(),
                text: None,
                top_k: 5,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("beta"));
    }

    #[test]
    fn test_join_hits_respects_budget() {
        let hits = vec![
            RagHit { content: "a".repeat(10), score: 2.0 },
            RagHit { content: "b".repeat(10), score: 1.0 },
        ];
        let joined = join_hits(&hits, 15);
        assert_eq!(joined, "a".repeat(10));

        let joined = join_hits(&hits, 100);
        assert!(joined.contains('\n'));
    }
}
