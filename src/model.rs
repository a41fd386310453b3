use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingModelProfile {
    pub model_id: String,
    pub provider: String,
    pub dimensions: usize,
    pub display_name: String,
}

/// Catalog view of a collection. May be stale relative to the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,
    pub model_id: String,
    pub provider: String,
    pub declared_item_count: u64,
    pub verified_present: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub true_item_count: u64,
    pub dimensions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedCollection {
    pub descriptor: CollectionDescriptor,
    /// `None` when a catalog-verified collection could not be described.
    pub stats: Option<CollectionStats>,
    pub verified_by_probe: bool,
}

impl ResolvedCollection {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceChunk {
    pub collection: String,
    pub source_id: String,
    pub text: String,
    pub similarity: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryClassification {
    pub class: String,
    pub threshold: f64,
    pub matched_pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Complete,
    /// The store stopped returning items before the true count was reached.
    Short,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionScan {
    pub collection: String,
    pub true_item_count: Option<u64>,
    pub items_examined: u64,
    pub pages: usize,
    pub status: ScanStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Accepted,
    Rejected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServedBy {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NoSearchableCorpus,
    NoCandidates,
    BelowThreshold,
    GeneratorDeclined,
    DeadlineExceeded,
}

impl RejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoSearchableCorpus => "no_searchable_corpus",
            Self::NoCandidates => "no_candidates",
            Self::BelowThreshold => "below_threshold",
            Self::GeneratorDeclined => "generator_declined",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalReport {
    pub model_id: String,
    pub collections_resolved: usize,
    pub collections_searched: usize,
    pub expected_items: u64,
    pub total_items_examined: u64,
    pub complete: bool,
    pub highest_similarity: Option<f64>,
    pub threshold_applied: f64,
    pub sensitivity_class: String,
    pub qualified_items: usize,
    pub decision: OutcomeStatus,
    pub scans: Vec<CollectionScan>,
    pub duration_ms: f64,
}

impl RetrievalReport {
    pub fn from_scans(
        model_id: &str,
        classification: &QueryClassification,
        collections_resolved: usize,
        scans: Vec<CollectionScan>,
        highest_similarity: Option<f64>,
    ) -> Self {
        let searched = scans
            .iter()
            .filter(|scan| matches!(scan.status, ScanStatus::Complete | ScanStatus::Short))
            .collect::<Vec<&CollectionScan>>();
        let expected_items = scans
            .iter()
            .filter_map(|scan| scan.true_item_count)
            .sum::<u64>();
        let total_items_examined = searched.iter().map(|scan| scan.items_examined).sum::<u64>();
        let complete = scans.len() == collections_resolved
            && scans
                .iter()
                .all(|scan| scan.status == ScanStatus::Complete);

        Self {
            model_id: model_id.to_string(),
            collections_resolved,
            collections_searched: searched.len(),
            expected_items,
            total_items_examined,
            complete,
            highest_similarity,
            threshold_applied: classification.threshold,
            sensitivity_class: classification.class.clone(),
            qualified_items: 0,
            decision: OutcomeStatus::Rejected,
            scans,
            duration_ms: 0.0,
        }
    }

    /// Report for a query that failed before any retrieval happened.
    pub fn unavailable(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            collections_resolved: 0,
            collections_searched: 0,
            expected_items: 0,
            total_items_examined: 0,
            complete: false,
            highest_similarity: None,
            threshold_applied: 0.0,
            sensitivity_class: String::new(),
            qualified_items: 0,
            decision: OutcomeStatus::Error,
            scans: Vec::new(),
            duration_ms: 0.0,
        }
    }

    pub fn degraded(&self) -> bool {
        !self.complete
    }
}

/// Caller-facing result of one grounded query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateOutcome {
    pub status: OutcomeStatus,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Vec<EvidenceChunk>>,
    pub report: RetrievalReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub served_by: Option<ServedBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GateOutcome {
    pub fn rejected(query: &str, mut report: RetrievalReport, reason: RejectionReason) -> Self {
        report.decision = OutcomeStatus::Rejected;
        Self {
            status: OutcomeStatus::Rejected,
            query: query.to_string(),
            answer: None,
            evidence: None,
            report,
            served_by: None,
            backend_id: None,
            reason: Some(reason),
            error: None,
        }
    }

    pub fn accepted(
        query: &str,
        mut report: RetrievalReport,
        answer: String,
        evidence: Vec<EvidenceChunk>,
        served_by: ServedBy,
        backend_id: String,
    ) -> Self {
        report.decision = OutcomeStatus::Accepted;
        Self {
            status: OutcomeStatus::Accepted,
            query: query.to_string(),
            answer: Some(answer),
            evidence: Some(evidence),
            report,
            served_by: Some(served_by),
            backend_id: Some(backend_id),
            reason: None,
            error: None,
        }
    }

    pub fn errored(query: &str, mut report: RetrievalReport, error: String) -> Self {
        report.decision = OutcomeStatus::Error;
        Self {
            status: OutcomeStatus::Error,
            query: query.to_string(),
            answer: None,
            evidence: None,
            report,
            served_by: None,
            backend_id: None,
            reason: None,
            error: Some(error),
        }
    }
}
