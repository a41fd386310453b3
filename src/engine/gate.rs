use tracing::{info, warn};

use crate::generation::{AnswerOrchestrator, GenerationRequest};
use crate::model::{
    ConversationTurn, EmbeddingModelProfile, EvidenceChunk, GateOutcome, QueryClassification,
    RejectionReason, ResolvedCollection, RetrievalReport,
};

use super::deadline::{QueryDeadline, deadline_expired};

/// Lexical markers a generator uses to say the context did not answer the query.
#[derive(Debug, Clone)]
pub struct NegativeMarkers {
    markers: Vec<String>,
}

impl NegativeMarkers {
    pub fn new(markers: &[String]) -> Self {
        Self {
            markers: markers
                .iter()
                .map(|marker| marker.trim().to_lowercase())
                .filter(|marker| !marker.is_empty())
                .collect(),
        }
    }

    /// Returns the marker found in `reply`. A blank reply counts as negative.
    pub fn detect(&self, reply: &str) -> Option<String> {
        let lowered = reply.trim().to_lowercase();
        if lowered.is_empty() {
            return Some("<empty reply>".to_string());
        }

        self.markers
            .iter()
            .find(|marker| lowered.contains(marker.as_str()))
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdDecision {
    NoCandidates,
    Below { highest: f64 },
    Pass { qualified: Vec<EvidenceChunk> },
}

/// First gate. `candidates` must already be sorted best first.
pub fn threshold_gate(
    candidates: &[EvidenceChunk],
    classification: &QueryClassification,
) -> ThresholdDecision {
    let Some(best) = candidates.first() else {
        return ThresholdDecision::NoCandidates;
    };

    if best.similarity < classification.threshold {
        return ThresholdDecision::Below {
            highest: best.similarity,
        };
    }

    ThresholdDecision::Pass {
        qualified: candidates
            .iter()
            .take_while(|chunk| chunk.similarity >= classification.threshold)
            .cloned()
            .collect(),
    }
}

pub struct GateInput<'a> {
    pub query: &'a str,
    pub classification: &'a QueryClassification,
    pub candidates: &'a [EvidenceChunk],
    pub report: RetrievalReport,
    pub profile: &'a EmbeddingModelProfile,
    pub collections: &'a [ResolvedCollection],
    pub session_id: Option<&'a str>,
    pub history: &'a [ConversationTurn],
    pub deadline: Option<QueryDeadline>,
}

/// Threshold gate followed by the generation gate.
pub struct GroundingGate<'a> {
    orchestrator: &'a AnswerOrchestrator,
    markers: &'a NegativeMarkers,
    top_k: usize,
}

impl<'a> GroundingGate<'a> {
    pub fn new(
        orchestrator: &'a AnswerOrchestrator,
        markers: &'a NegativeMarkers,
        top_k: usize,
    ) -> Self {
        Self {
            orchestrator,
            markers,
            top_k: top_k.max(1),
        }
    }

    pub fn evaluate(&self, input: GateInput<'_>) -> GateOutcome {
        let GateInput {
            query,
            classification,
            candidates,
            mut report,
            profile,
            collections,
            session_id,
            history,
            deadline,
        } = input;

        let qualified = match threshold_gate(candidates, classification) {
            ThresholdDecision::NoCandidates => {
                info!(query = %query, "no candidates retrieved; rejecting");
                return GateOutcome::rejected(query, report, RejectionReason::NoCandidates);
            }
            ThresholdDecision::Below { highest } => {
                info!(
                    query = %query,
                    highest_similarity = highest,
                    threshold = classification.threshold,
                    class = %classification.class,
                    items_examined = report.total_items_examined,
                    "best evidence below threshold; rejecting"
                );
                return GateOutcome::rejected(query, report, RejectionReason::BelowThreshold);
            }
            ThresholdDecision::Pass { qualified } => qualified,
        };
        report.qualified_items = qualified.len();

        if deadline_expired(deadline) {
            warn!(query = %query, "deadline expired before generation");
            return GateOutcome::rejected(query, report, RejectionReason::DeadlineExceeded);
        }

        let evidence = qualified
            .into_iter()
            .take(self.top_k)
            .collect::<Vec<EvidenceChunk>>();
        let request = GenerationRequest {
            query,
            model: profile,
            evidence: &evidence,
            collections,
            session_id,
            history,
        };

        let generated = match self.orchestrator.answer(&request, deadline) {
            Ok(generated) => generated,
            Err(err) if deadline_expired(deadline) => {
                warn!(query = %query, error = %err, "deadline expired during generation");
                return GateOutcome::rejected(query, report, RejectionReason::DeadlineExceeded);
            }
            Err(err) => {
                warn!(query = %query, error = %err, "all generation backends failed");
                return GateOutcome::errored(query, report, err.to_string());
            }
        };

        if let Some(marker) = self.markers.detect(&generated.text) {
            info!(
                query = %query,
                marker = %marker,
                backend = %generated.backend_id,
                "generator reported missing grounding; rejecting"
            );
            return GateOutcome::rejected(query, report, RejectionReason::GeneratorDeclined);
        }

        info!(
            query = %query,
            evidence = evidence.len(),
            served_by = ?generated.served_by,
            backend = %generated.backend_id,
            "answer accepted"
        );
        GateOutcome::accepted(
            query,
            report,
            generated.text,
            evidence,
            generated.served_by,
            generated.backend_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::engine::errors::GenerationError;
    use crate::engine::testing::{ScriptedGenerator, chunk, profile, resolved};

    fn classification(threshold: f64) -> QueryClassification {
        QueryClassification {
            class: "test".to_string(),
            threshold,
            matched_pattern: None,
        }
    }

    #[test]
    fn markers_match_case_insensitively() {
        let markers = NegativeMarkers::new(&[
            "The provided context does not contain".to_string(),
            "  ".to_string(),
        ]);
        assert_eq!(
            markers.detect("Sorry, THE PROVIDED CONTEXT DOES NOT CONTAIN this information."),
            Some("the provided context does not contain".to_string())
        );
        assert_eq!(markers.detect("Jane Doe is a cardiologist [1]."), None);
        assert!(markers.detect("   ").is_some());
    }

    #[test]
    fn threshold_gate_keeps_only_qualified_chunks() {
        let candidates = vec![
            chunk("kb", "a", 0.9),
            chunk("kb", "b", 0.75),
            chunk("kb", "c", 0.74),
        ];
        let decision = threshold_gate(&candidates, &classification(0.75));
        let ThresholdDecision::Pass { qualified } = decision else {
            panic!("expected pass, got {decision:?}");
        };
        let ids = qualified
            .iter()
            .map(|chunk| chunk.source_id.as_str())
            .collect::<Vec<&str>>();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn threshold_gate_rejects_below_and_empty() {
        assert_eq!(
            threshold_gate(&[], &classification(0.5)),
            ThresholdDecision::NoCandidates
        );
        assert_eq!(
            threshold_gate(&[chunk("kb", "a", 0.42)], &classification(0.9)),
            ThresholdDecision::Below { highest: 0.42 }
        );
    }

    #[test]
    fn deadline_expiring_during_generation_rejects_without_trying_fallbacks() {
        let primary = ScriptedGenerator::failing(
            "workflow",
            GenerationError::Timeout(Duration::from_millis(20)),
        )
        .with_delay(Duration::from_millis(60));
        let primary_calls = primary.calls();
        let fallback = ScriptedGenerator::answering("ollama", "Jane Doe is a cardiologist [1].");
        let fallback_calls = fallback.calls();
        let orchestrator =
            AnswerOrchestrator::new(Some(Box::new(primary)), vec![Box::new(fallback)], 6);
        let markers = NegativeMarkers::new(&[]);
        let gate = GroundingGate::new(&orchestrator, &markers, 5);

        let model = profile("local");
        let collections = vec![resolved("kb", 1)];
        let candidates = vec![chunk("kb", "doc-1", 0.9)];
        let classification = classification(0.5);
        let report =
            RetrievalReport::from_scans("local", &classification, 1, Vec::new(), Some(0.9));

        let outcome = gate.evaluate(GateInput {
            query: "what is Jane Doe's specialty",
            classification: &classification,
            candidates: &candidates,
            report,
            profile: &model,
            collections: &collections,
            session_id: None,
            history: &[],
            deadline: QueryDeadline::new(20),
        });

        assert_eq!(outcome.reason, Some(RejectionReason::DeadlineExceeded));
        assert!(outcome.evidence.is_none());
        assert!(outcome.error.is_none());
        assert_eq!(primary_calls.count(), 1);
        assert_eq!(fallback_calls.count(), 0);
    }
}
