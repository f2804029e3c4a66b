//! Ingestion-to-retrieval flow over the pure pieces: chunk an uploaded FAQ
//! document, then check that lexical/hybrid scoring surfaces the ingested
//! chunk for a matching question.

use std::collections::HashMap;

use convoserver::retrieval::chunking::{chunk_markdown, ChunkingConfig};
use convoserver::retrieval::vector_store::VectorMatch;
use convoserver::retrieval::{score_and_select, RetrievalTunables};

const FAQ_DOC: &str = "# FAQ\n\nQ: reset?\nA: press hold 5s.";

#[test]
fn faq_upload_produces_at_least_one_chunk() {
    let chunks = chunk_markdown(FAQ_DOC, &ChunkingConfig::default(), &HashMap::new());
    assert!(!chunks.is_empty());
    assert!(chunks[0].content.contains("press hold 5s."));
    assert_eq!(chunks[0].metadata.get("format").map(|s| s.as_str()), Some("faq"));
    assert_eq!(chunks[0].metadata.get("section").map(|s| s.as_str()), Some("FAQ"));
}

#[test]
fn ingested_chunk_is_retrieved_above_min_score() {
    let chunks = chunk_markdown(FAQ_DOC, &ChunkingConfig::default(), &HashMap::new());
    let matches: Vec<VectorMatch> = chunks
        .iter()
        .map(|chunk| VectorMatch {
            id: chunk.id.to_string(),
            score: 0.82,
            text: chunk.content.clone(),
            payload: serde_json::json!({"chunk_index": chunk.index}),
        })
        .collect();

    let tunables = RetrievalTunables::default();
    let selection = score_and_select("how do I reset", matches, &tunables);
    assert!(!selection.documents.is_empty());
    assert!(selection.documents[0].final_score >= tunables.min_score);
    assert!(selection.documents[0].text.contains("press hold 5s."));
}

#[test]
fn unrelated_question_scores_below_related_one() {
    let chunks = chunk_markdown(FAQ_DOC, &ChunkingConfig::default(), &HashMap::new());
    let make_matches = || {
        chunks
            .iter()
            .map(|chunk| VectorMatch {
                id: chunk.id.to_string(),
                score: 0.5,
                text: chunk.content.clone(),
                payload: serde_json::json!({}),
            })
            .collect::<Vec<_>>()
    };

    let tunables = RetrievalTunables {
        min_score: 0.0,
        ..Default::default()
    };
    let related = score_and_select("how do I reset", make_matches(), &tunables);
    let unrelated = score_and_select("pricing for enterprise plans", make_matches(), &tunables);
    assert!(
        related.documents[0].final_score > unrelated.documents[0].final_score,
        "lexical component should reward overlapping terms"
    );
}
