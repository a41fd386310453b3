use std::fmt::Write as _;

use super::GenerationRequest;

/// Exact phrase a backend must use when the evidence does not answer the query.
pub const ABSENCE_PHRASE: &str = "The provided context does not contain this information.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundedPrompt {
    pub system: String,
    pub user: String,
}

pub fn build_grounded_prompt(request: &GenerationRequest<'_>) -> GroundedPrompt {
    let system = format!(
        "You answer questions using only the numbered context excerpts supplied with each \
         question. Do not use outside knowledge. Cite every claim with the excerpt number in \
         square brackets, for example [1]. If the excerpts do not answer the question, reply \
         exactly: \"{ABSENCE_PHRASE}\""
    );

    let mut user = String::new();
    let _ = writeln!(
        user,
        "Context excerpts (embedding model: {}):",
        request.model.model_id
    );
    for (index, chunk) in request.evidence.iter().enumerate() {
        let _ = writeln!(
            user,
            "[{}] (collection: {}, source: {}, similarity: {:.1}%)",
            index + 1,
            chunk.collection,
            chunk.source_id,
            chunk.similarity * 100.0
        );
        let _ = writeln!(user, "{}", chunk.text.trim());
        user.push('\n');
    }
    let _ = write!(user, "Question: {}", request.query.trim());

    GroundedPrompt { system, user }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{chunk, profile};

    #[test]
    fn evidence_is_numbered_in_submission_order() {
        let model = profile("local");
        let evidence = vec![chunk("staff", "doc-7", 0.91), chunk("policies", "doc-2", 0.55)];
        let request = GenerationRequest {
            query: "  what is Jane Doe's specialty ",
            model: &model,
            evidence: &evidence,
            collections: &[],
            session_id: None,
            history: &[],
        };

        let prompt = build_grounded_prompt(&request);
        assert!(prompt.system.contains(ABSENCE_PHRASE));
        assert!(prompt.system.contains("[1]"));
        let first = prompt.user.find("[1] (collection: staff, source: doc-7, similarity: 91.0%)");
        let second = prompt.user.find("[2] (collection: policies, source: doc-2, similarity: 55.0%)");
        assert!(first.is_some() && second.is_some());
        assert!(first < second);
        assert!(prompt.user.ends_with("Question: what is Jane Doe's specialty"));
    }

    #[test]
    fn prompt_is_deterministic() {
        let model = profile("local");
        let evidence = vec![chunk("staff", "doc-7", 0.91)];
        let request = GenerationRequest {
            query: "q",
            model: &model,
            evidence: &evidence,
            collections: &[],
            session_id: None,
            history: &[],
        };
        assert_eq!(build_grounded_prompt(&request), build_grounded_prompt(&request));
    }
}
