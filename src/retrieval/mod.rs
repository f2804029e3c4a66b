//! Hybrid retrieval over the per-brand knowledge base.

pub mod chunking;
pub mod embeddings;
pub mod vector_store;

use diesel::prelude::*;
use log::{debug, warn};
use uuid::Uuid;

use crate::shared::error::AppResult;
use crate::shared::models::{retrieval_configs, RetrievalConfigRow};
use crate::shared::utils::{estimate_token_count, DbPool};

use embeddings::EmbeddingService;
use vector_store::VectorStoreClient;

/// Per-tenant knobs driving retrieval, loaded from `retrieval_configs` with
/// conservative defaults when the row is absent.
#[derive(Debug, Clone)]
pub struct RetrievalTunables {
    pub hybrid_weight: f32,
    pub min_score: f32,
    pub max_documents: usize,
    pub context_budget_tokens: usize,
    pub filters: serde_json::Value,
    pub fallback_llm: Option<String>,
}

impl Default for RetrievalTunables {
    fn default() -> Self {
        Self {
            hybrid_weight: 0.7,
            min_score: 0.2,
            max_documents: 8,
            context_budget_tokens: 1500,
            filters: serde_json::json!({}),
            fallback_llm: None,
        }
    }
}

impl From<RetrievalConfigRow> for RetrievalTunables {
    fn from(row: RetrievalConfigRow) -> Self {
        Self {
            hybrid_weight: row.hybrid_weight.clamp(0.0, 1.0),
            min_score: row.min_score,
            max_documents: row.max_documents.max(0) as usize,
            context_budget_tokens: row.context_budget_tokens.max(0) as usize,
            filters: row.filters,
            fallback_llm: row.fallback_llm,
        }
    }
}

pub fn load_tunables(pool: &DbPool, tenant: Uuid) -> RetrievalTunables {
    let Ok(mut conn) = pool.get() else {
        return RetrievalTunables::default();
    };
    retrieval_configs::table
        .filter(retrieval_configs::tenant_id.eq(tenant))
        .first::<RetrievalConfigRow>(&mut conn)
        .map(RetrievalTunables::from)
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub id: String,
    pub text: String,
    pub dense_score: f32,
    pub lexical_score: f32,
    pub final_score: f32,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct ContextSelection {
    pub documents: Vec<ScoredDocument>,
    pub degraded: bool,
}

impl ContextSelection {
    pub fn degraded() -> Self {
        Self {
            documents: Vec::new(),
            degraded: true,
        }
    }
}

/// Retrieve grounded context for an inbound message.
///
/// Embedding failure on every provider degrades to empty context rather than
/// failing the conversation; empty knowledge bases simply return nothing.
pub async fn retrieve_context(
    embeddings: &EmbeddingService,
    vectors: &VectorStoreClient,
    tenant_id: Uuid,
    brand_id: Uuid,
    message: &str,
    tunables: &RetrievalTunables,
) -> AppResult<ContextSelection> {
    if message.trim().is_empty() || tunables.max_documents == 0 {
        return Ok(ContextSelection::default());
    }

    let query_vectors = match embeddings.embed(&[message.to_string()]).await {
        Ok(v) => v,
        Err(e) => {
            warn!("embedding unavailable, degrading to empty context: {}", e);
            return Ok(ContextSelection::degraded());
        }
    };
    let Some(query_vector) = query_vectors.into_iter().next() else {
        return Ok(ContextSelection::degraded());
    };

    let matches = vectors
        .search(
            tenant_id,
            brand_id,
            &query_vector,
            tunables.max_documents,
            &tunables.filters,
        )
        .await?;

    let scored = score_and_select(message, matches, tunables);
    debug!(
        "retrieved {} context documents for tenant {}",
        scored.documents.len(),
        tenant_id
    );
    Ok(scored)
}

/// Hybrid scoring plus greedy selection under the token budget.
pub fn score_and_select(
    message: &str,
    matches: Vec<vector_store::VectorMatch>,
    tunables: &RetrievalTunables,
) -> ContextSelection {
    let w = tunables.hybrid_weight;
    let mut scored: Vec<ScoredDocument> = matches
        .into_iter()
        .map(|m| {
            let lexical = lexical_score(message, &m.text);
            let final_score = w * m.score + (1.0 - w) * lexical;
            ScoredDocument {
                id: m.id,
                text: m.text,
                dense_score: m.score,
                lexical_score: lexical,
                final_score,
                payload: m.payload,
            }
        })
        .filter(|d| d.final_score >= tunables.min_score)
        .collect();

    scored.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut selected = Vec::new();
    let mut budget_used = 0usize;
    for doc in scored {
        let tokens = estimate_token_count(&doc.text);
        if budget_used + tokens > tunables.context_budget_tokens {
            continue;
        }
        budget_used += tokens;
        selected.push(doc);
        if selected.len() >= tunables.max_documents {
            break;
        }
    }

    ContextSelection {
        documents: selected,
        degraded: false,
    }
}

/// Term-overlap ratio between query and document, in [0, 1].
pub fn lexical_score(query: &str, document: &str) -> f32 {
    let query_terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if query_terms.is_empty() {
        return 0.0;
    }
    let doc_terms: std::collections::HashSet<String> = document
        .to_lowercase()
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let overlap = query_terms
        .iter()
        .filter(|term| doc_terms.contains(*term))
        .count();
    overlap as f32 / query_terms.len() as f32
}

#[cfg(test)]
mod tests {
    use super::vector_store::VectorMatch;
    use super::*;

    fn matches(entries: &[(&str, f32)]) -> Vec<VectorMatch> {
        entries
            .iter()
            .enumerate()
            .map(|(i, (text, score))| VectorMatch {
                id: i.to_string(),
                score: *score,
                text: text.to_string(),
                payload: serde_json::json!({}),
            })
            .collect()
    }

    #[test]
    fn lexical_score_counts_overlap() {
        assert_eq!(lexical_score("how do i reset", "press and hold to reset"), 0.25);
        assert_eq!(lexical_score("reset", "nothing relevant"), 0.0);
        assert_eq!(lexical_score("", "anything"), 0.0);
    }

    #[test]
    fn low_scores_are_dropped() {
        let tunables = RetrievalTunables {
            min_score: 0.5,
            ..Default::default()
        };
        let selection = score_and_select(
            "reset device",
            matches(&[("reset the device by holding", 0.9), ("unrelated", 0.1)]),
            &tunables,
        );
        assert_eq!(selection.documents.len(), 1);
        assert!(selection.documents[0].text.contains("reset"));
    }

    #[test]
    fn budget_limits_selection() {
        let tunables = RetrievalTunables {
            min_score: 0.0,
            context_budget_tokens: 12,
            ..Default::default()
        };
        let long = "word ".repeat(40);
        let selection = score_and_select(
            "word",
            matches(&[(&long, 0.9), ("word word word", 0.8)]),
            &tunables,
        );
        // The long document blows the budget; the short one still fits.
        assert_eq!(selection.documents.len(), 1);
        assert_eq!(selection.documents[0].text, "word word word");
    }

    #[test]
    fn hybrid_weight_blends_scores() {
        let tunables = RetrievalTunables {
            hybrid_weight: 0.0,
            min_score: 0.0,
            ..Default::default()
        };
        // With weight 0 the lexical score decides the order.
        let selection = score_and_select(
            "reset",
            matches(&[("nothing here", 0.99), ("how to reset", 0.01)]),
            &tunables,
        );
        assert_eq!(selection.documents[0].text, "how to reset");
    }

    #[test]
    fn ordering_is_descending_by_final_score() {
        let tunables = RetrievalTunables {
            min_score: 0.0,
            ..Default::default()
        };
        let selection = score_and_select(
            "alpha",
            matches(&[("alpha beta", 0.2), ("alpha", 0.9), ("gamma", 0.5)]),
            &tunables,
        );
        let scores: Vec<f32> = selection.documents.iter().map(|d| d.final_score).collect();
        let mut sorted = scores.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(scores, sorted);
    }
}
