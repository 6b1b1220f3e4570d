//! Reciprocal Rank Fusion: score = Σ 1/(k + rank_i)
//!
//! Merges the dense and sparse rankings into one ordering without having to
//! normalize the two similarity scales against each other.

use std::collections::HashMap;

use crate::pipeline::domain::{RankedDocument, RetrievalHit};

/// Standard smoothing constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RrfFusion {
    k: f64,
}

struct Candidate<'a> {
    text: &'a str,
    dense_rank: Option<u32>,
    sparse_rank: Option<u32>,
}

impl RrfFusion {
    /// `k` dampens the advantage of top ranks: higher k, flatter fusion.
    pub fn new(k: f64) -> Self {
        Self { k }
    }

    fn contribution(&self, rank: Option<u32>) -> f64 {
        rank.map(|r| 1.0 / (self.k + r as f64)).unwrap_or(0.0)
    }

    /// Fuses two rankings into at most `top_k` hits, best first.
    ///
    /// Ties on score go to the lower rank sum (an absent rank counts as one
    /// past the longer list), then to the lexically smaller document id. A
    /// document listed twice in one ranking keeps its best rank.
    pub fn fuse(
        &self,
        dense: &[RankedDocument],
        sparse: &[RankedDocument],
        top_k: usize,
    ) -> Vec<RetrievalHit> {
        let mut candidates: HashMap<&str, Candidate<'_>> = HashMap::new();

        for doc in dense {
            let candidate = candidates
                .entry(doc.document_id.as_str())
                .or_insert(Candidate {
                    text: &doc.text,
                    dense_rank: None,
                    sparse_rank: None,
                });
            if better(doc, candidate.dense_rank, candidate.text) {
                candidate.dense_rank = Some(doc.rank);
                candidate.text = &doc.text;
            }
        }

        for doc in sparse {
            let candidate = candidates
                .entry(doc.document_id.as_str())
                .or_insert(Candidate {
                    text: &doc.text,
                    dense_rank: None,
                    sparse_rank: None,
                });
            let improves = better(doc, candidate.sparse_rank, candidate.text);
            if improves {
                candidate.sparse_rank = Some(doc.rank);
                // dense text wins when the document is in both rankings
                if candidate.dense_rank.is_none() {
                    candidate.text = &doc.text;
                }
            }
        }

        let missing_rank = dense.len().max(sparse.len()) as u64 + 1;
        let rank_sum = |hit: &RetrievalHit| {
            hit.dense_rank.map(u64::from).unwrap_or(missing_rank)
                + hit.sparse_rank.map(u64::from).unwrap_or(missing_rank)
        };

        let mut hits: Vec<RetrievalHit> = candidates
            .into_iter()
            .map(|(id, c)| RetrievalHit {
                document_id: id.to_string(),
                text: c.text.to_string(),
                dense_rank: c.dense_rank,
                sparse_rank: c.sparse_rank,
                fused_score: self.contribution(c.dense_rank) + self.contribution(c.sparse_rank),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.fused_score
                .total_cmp(&a.fused_score)
                .then_with(|| rank_sum(a).cmp(&rank_sum(b)))
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        hits.truncate(top_k);
        hits
    }
}

impl Default for RrfFusion {
    fn default() -> Self {
        Self::new(DEFAULT_RRF_K)
    }
}

fn better(doc: &RankedDocument, current: Option<u32>, current_text: &str) -> bool {
    match current {
        None => true,
        Some(rank) => doc.rank < rank || (doc.rank == rank && doc.text.as_str() < current_text),
    }
}
