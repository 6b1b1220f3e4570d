use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::fallback::{join_tolerant, Capability};
use super::fusion::RrfFusion;
use super::guard::GuardedCall;
use crate::error::{CollaboratorError, PipelineError};
use crate::pipeline::domain::{IndexedDocument, RankedDocument, RetrievalHit};

/// One request against a single leg of the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LegQuery {
    pub text: String,
    pub k: usize,
}

struct RankingLeg {
    name: &'static str,
    call: GuardedCall<LegQuery, Vec<IndexedDocument>>,
}

#[async_trait]
impl Capability<LegQuery> for RankingLeg {
    type Output = Vec<RankedDocument>;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn invoke(&self, query: &LegQuery) -> Result<Vec<RankedDocument>, CollaboratorError> {
        let documents = self.call.call(query.clone()).await?;
        Ok(RankedDocument::from_ordered(documents))
    }
}

#[derive(Error, Debug)]
#[error("both rankings failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
pub struct BothRankingsFailed(pub Vec<CollaboratorError>);

#[derive(Debug)]
pub struct Retrieval {
    pub hits: Vec<RetrievalHit>,
    /// Set when one ranking failed and fusion ran on the other alone
    pub degraded: Option<CollaboratorError>,
}

/// What to look up for one detected label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelQuery {
    pub label: String,
    pub query: String,
    pub top_k: usize,
}

#[derive(Debug, Default)]
pub struct LabelRetrieval {
    /// Hits per label, sorted by label
    pub retrieved: IndexMap<String, Vec<RetrievalHit>>,
    pub errors: Vec<PipelineError>,
}

/// Dense + sparse retrieval fused with RRF.
pub struct HybridRetriever {
    dense: RankingLeg,
    sparse: RankingLeg,
    fusion: RrfFusion,
    prefetch_multiplier: usize,
}

impl HybridRetriever {
    pub fn new(
        dense: GuardedCall<LegQuery, Vec<IndexedDocument>>,
        sparse: GuardedCall<LegQuery, Vec<IndexedDocument>>,
        fusion: RrfFusion,
        prefetch_multiplier: usize,
    ) -> Self {
        Self {
            dense: RankingLeg {
                name: "dense ranking",
                call: dense,
            },
            sparse: RankingLeg {
                name: "sparse ranking",
                call: sparse,
            },
            fusion,
            prefetch_multiplier: prefetch_multiplier.max(1),
        }
    }

    /// At most `top_k` hits for `query`. Survives the loss of either ranking.
    #[instrument(skip(self))]
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Retrieval, BothRankingsFailed> {
        if top_k == 0 {
            return Ok(Retrieval {
                hits: Vec::new(),
                degraded: None,
            });
        }

        let leg_query = LegQuery {
            text: query.to_string(),
            k: top_k.saturating_mul(self.prefetch_multiplier),
        };
        let joined = join_tolerant(&self.dense, &self.sparse, &leg_query)
            .await
            .map_err(BothRankingsFailed)?;

        let dense = joined.left.unwrap_or_default();
        let sparse = joined.right.unwrap_or_default();
        let hits = self.fusion.fuse(&dense, &sparse, top_k);
        debug!(
            "Fused {} dense and {} sparse candidates into {} hits",
            dense.len(),
            sparse.len(),
            hits.len()
        );

        Ok(Retrieval {
            hits,
            degraded: joined.errors.into_iter().next(),
        })
    }

    /// Retrieves for every label, at most `pool_size` queries in flight.
    /// Labels sharing a query and budget are looked up once.
    pub async fn retrieve_labels(&self, queries: Vec<LabelQuery>, pool_size: usize) -> LabelRetrieval {
        let mut groups: IndexMap<(String, usize), Vec<String>> = IndexMap::new();
        for query in queries {
            groups
                .entry((query.query, query.top_k))
                .or_default()
                .push(query.label);
        }
        info!("Retrieving regulations for {} distinct queries", groups.len());

        let this = self;
        let results: Vec<_> = stream::iter(groups)
            .map(|((query, top_k), labels)| async move {
                let result = this.retrieve(&query, top_k).await;
                (labels, result)
            })
            .buffer_unordered(pool_size.max(1))
            .collect()
            .await;

        let mut outcome = LabelRetrieval::default();
        for (labels, result) in results {
            for label in labels {
                match &result {
                    Ok(retrieval) => {
                        if let Some(e) = &retrieval.degraded {
                            outcome.errors.push(PipelineError::RankingDegraded {
                                label: label.clone(),
                                reason: e.to_string(),
                            });
                        }
                        outcome.retrieved.insert(label, retrieval.hits.clone());
                    }
                    Err(e) => {
                        warn!("No regulations for '{}': {}", label, e);
                        outcome.errors.push(PipelineError::RetrievalUnavailable {
                            label: label.clone(),
                            reason: e.to_string(),
                        });
                        outcome.retrieved.insert(label, Vec::new());
                    }
                }
            }
        }

        outcome.retrieved.sort_keys();
        outcome.errors.sort_by_key(|e| e.to_string());
        outcome
    }
}
