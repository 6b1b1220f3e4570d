use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::labels::LabelCategory;

/// A document as returned by one leg of the vector index, in rank order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub document_id: String,
    pub text: String,
}

impl IndexedDocument {
    pub fn new(document_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            text: text.into(),
        }
    }
}

/// A document with its 1-based position in a single ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedDocument {
    pub document_id: String,
    pub text: String,
    pub rank: u32,
}

impl RankedDocument {
    /// Assigns ranks from list position, most relevant first.
    pub fn from_ordered(documents: Vec<IndexedDocument>) -> Vec<RankedDocument> {
        documents
            .into_iter()
            .zip(1u32..)
            .map(|(doc, rank)| RankedDocument {
                document_id: doc.document_id,
                text: doc.text,
                rank,
            })
            .collect()
    }
}

/// One fused regulation excerpt. At least one of the two ranks is present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalHit {
    pub document_id: String,
    pub text: String,
    pub dense_rank: Option<u32>,
    pub sparse_rank: Option<u32>,
    pub fused_score: f64,
}

/// Label category to `top_k` table. Categories missing from the table get `default_top_k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalBudget {
    pub tiers: IndexMap<LabelCategory, usize>,
    pub default_top_k: usize,
}

impl RetrievalBudget {
    pub fn top_k_for(&self, category: Option<LabelCategory>) -> usize {
        category
            .and_then(|category| self.tiers.get(&category).copied())
            .unwrap_or(self.default_top_k)
    }
}

impl Default for RetrievalBudget {
    fn default() -> Self {
        let mut tiers = IndexMap::new();
        tiers.insert(LabelCategory::PpeViolation, 5);
        tiers.insert(LabelCategory::Machinery, 3);
        tiers.insert(LabelCategory::SiteEquipment, 3);
        Self {
            tiers,
            default_top_k: 1,
        }
    }
}
