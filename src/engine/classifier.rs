use anyhow::{Context, Result};
use regex::Regex;

use crate::config::ClassifierConfig;
use crate::model::QueryClassification;
use crate::semantic::normalize_whitespace;

#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub class: String,
    pub threshold: f64,
    pub patterns: Vec<Regex>,
}

/// Maps a query onto a sensitivity class through an ordered rule table.
#[derive(Debug, Clone)]
pub struct RelevanceClassifier {
    rules: Vec<ClassificationRule>,
    default_class: String,
    default_threshold: f64,
}

impl RelevanceClassifier {
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let mut rules = Vec::<ClassificationRule>::with_capacity(config.rules.len());
        for rule in &config.rules {
            let patterns = rule
                .patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).with_context(|| {
                        format!(
                            "invalid pattern for classifier rule '{}': {pattern}",
                            rule.class
                        )
                    })
                })
                .collect::<Result<Vec<Regex>>>()?;

            rules.push(ClassificationRule {
                class: rule.class.clone(),
                threshold: rule.threshold,
                patterns,
            });
        }

        Ok(Self {
            rules,
            default_class: config.default_class.clone(),
            default_threshold: config.default_threshold,
        })
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn classify(&self, query: &str) -> QueryClassification {
        let normalized = normalize_whitespace(query);

        for rule in &self.rules {
            if let Some(pattern) = rule
                .patterns
                .iter()
                .find(|pattern| pattern.is_match(&normalized))
            {
                return QueryClassification {
                    class: rule.class.clone(),
                    threshold: rule.threshold,
                    matched_pattern: Some(pattern.as_str().to_string()),
                };
            }
        }

        QueryClassification {
            class: self.default_class.clone(),
            threshold: self.default_threshold,
            matched_pattern: None,
        }
    }

    /// Classification with a caller floor that can only make the gate stricter.
    pub fn classify_with_floor(&self, query: &str, min_threshold: Option<f64>) -> QueryClassification {
        let mut classification = self.classify(query);
        if let Some(floor) = min_threshold {
            classification.threshold = classification.threshold.max(floor.clamp(0.0, 1.0));
        }
        classification
    }
}
