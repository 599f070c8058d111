use std::collections::BTreeSet;

use decision_core::{AnalyzerOutput, EngineConfig, EngineError, WeightSet};

/// Raw fusion result before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeScore {
    pub score: f64,
    pub confidence: f64,
    /// Fraction of the original weight mass covered by present analyzers.
    pub present_mass: f64,
}

/// Fuses available analyzer outputs into one score/confidence pair under a
/// given weight set. Analyzers may be absent; missing coverage degrades
/// confidence rather than failing, down to the configured minimum.
pub struct CompositeScorer {
    config: EngineConfig,
}

impl CompositeScorer {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn score(
        &self,
        outputs: &[AnalyzerOutput],
        weights: &WeightSet,
    ) -> Result<CompositeScore, EngineError> {
        let mut seen = BTreeSet::new();
        for output in outputs {
            output.validate()?;
            if !seen.insert(output.analyzer) {
                return Err(EngineError::InvalidInput(format!(
                    "duplicate output for analyzer {}",
                    output.analyzer
                )));
            }
        }

        // Weight mass covered by the analyzers that actually reported.
        let present_mass: f64 = outputs.iter().map(|o| weights.weight(o.analyzer)).sum();

        if present_mass < self.config.min_coverage {
            tracing::warn!(
                present_mass,
                required = self.config.min_coverage,
                "refusing to score: analyzer coverage too thin"
            );
            return Err(EngineError::InsufficientCoverage {
                present_mass,
                required: self.config.min_coverage,
            });
        }

        // Renormalize the surviving weights, then penalize confidence by the
        // missing mass so a thin panel never scores more confidently than a
        // full one.
        let mut score = 0.0;
        let mut confidence = 0.0;
        for output in outputs {
            let w = weights.weight(output.analyzer) / present_mass;
            score += w * output.score;
            confidence += w * output.confidence;
        }
        confidence *= present_mass;

        tracing::debug!(
            score,
            confidence,
            present_mass,
            analyzers = outputs.len(),
            weight_version = weights.version,
            "composite score computed"
        );

        Ok(CompositeScore {
            score,
            confidence,
            present_mass,
        })
    }

    /// Ordered justification list: strongest weighted contribution first.
    pub fn reasoning(&self, outputs: &[AnalyzerOutput], weights: &WeightSet) -> Vec<String> {
        let mut ranked: Vec<&AnalyzerOutput> = outputs.iter().collect();
        ranked.sort_by(|a, b| {
            let ia = (a.score * weights.weight(a.analyzer)).abs();
            let ib = (b.score * weights.weight(b.analyzer)).abs();
            ib.partial_cmp(&ia).unwrap_or(std::cmp::Ordering::Equal)
        });

        ranked
            .iter()
            .map(|o| {
                let direction = if o.score > 0.0 {
                    "bullish"
                } else if o.score < 0.0 {
                    "bearish"
                } else {
                    "neutral"
                };
                let lead = o.rationale.first().map(String::as_str).unwrap_or("");
                format!(
                    "{} ({}, score: {:+.0}, confidence: {:.0}%, weight: {:.0}%): {}",
                    o.analyzer,
                    direction,
                    o.score,
                    o.confidence * 100.0,
                    weights.weight(o.analyzer) * 100.0,
                    lead
                )
            })
            .collect()
    }
}
