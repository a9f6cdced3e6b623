//! Score aggregation and the decision policy.
//!
//! The total is the weighted mean over *evaluated* criteria only. Weight
//! redistribution for soft failures is therefore just a recomputation of the
//! normalization denominator; the configured weights are never touched.
//!
//! ```text
//! total = Σ (weight_i / Σ weight_evaluated) * score_i
//! ```
//!
//! Decision bands come from the profile thresholds:
//!
//! | total                          | band        |
//! |--------------------------------|-------------|
//! | `>= accept`                    | ACCEPT      |
//! | `[patch, accept)`              | PATCH       |
//! | `[regenerate, patch)`          | REGENERATE  |
//! | `< regenerate`                 | REJECT      |

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::profile::{QualityProfile, SectionPrecedence};
use crate::types::{CriterionResult, DecisionBand, Origin, ScoreCard};

/// Errors that can occur during aggregation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    /// Every criterion was `evaluated = false`; the total is undefined.
    #[error("No criteria were evaluated; total is undefined")]
    NothingEvaluated,

    #[error("Result references unknown criterion: {0}")]
    UnknownCriterion(String),
}

/// A section selected for patching.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchTarget {
    pub section: String,

    /// Kind of the lowest-scoring failed criterion in the section
    pub origin: Origin,

    /// Ids of the criteria that failed in this section
    pub failing: Vec<String>,
}

/// The action the orchestrator should take for a scorecard.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accept,
    Patch(Vec<PatchTarget>),
    Regenerate,
    Reject,
}

/// Combines criterion results into scorecards and decisions.
pub struct ScoreAggregator<'p> {
    profile: &'p QualityProfile,
}

impl<'p> ScoreAggregator<'p> {
    pub fn new(profile: &'p QualityProfile) -> Self {
        Self { profile }
    }

    /// Build a scorecard from a full set of results.
    ///
    /// Results are reordered into profile order. Criteria with no result are
    /// recorded as not evaluated.
    pub fn aggregate(&self, results: Vec<CriterionResult>) -> Result<ScoreCard, AggregationError> {
        let mut by_id: BTreeMap<String, CriterionResult> = BTreeMap::new();
        for r in results {
            if self.profile.criterion(&r.criterion_id).is_none() {
                return Err(AggregationError::UnknownCriterion(r.criterion_id));
            }
            by_id.insert(r.criterion_id.clone(), r);
        }

        let results: Vec<CriterionResult> = self
            .profile
            .criteria
            .iter()
            .map(|c| {
                by_id
                    .remove(&c.id)
                    .unwrap_or_else(|| CriterionResult::not_evaluated(&c.id, "No result produced"))
            })
            .collect();

        let total = self.total(&results)?;
        let section_scores = self
            .profile
            .sections
            .iter()
            .filter_map(|s| self.section_score(&results, &s.name).map(|v| (s.name.clone(), v)))
            .collect();

        Ok(ScoreCard {
            decision_band: self.band(total),
            results,
            total,
            section_scores,
        })
    }

    /// Replace some results and recompute the total and only the touched
    /// section sub-scores.
    pub fn rescore(
        &self,
        previous: &ScoreCard,
        updates: Vec<CriterionResult>,
    ) -> Result<ScoreCard, AggregationError> {
        let mut results = previous.results.clone();
        let mut touched = BTreeSet::new();

        for update in updates {
            let criterion = self
                .profile
                .criterion(&update.criterion_id)
                .ok_or_else(|| AggregationError::UnknownCriterion(update.criterion_id.clone()))?;
            if let Some(section) = &criterion.section {
                touched.insert(section.clone());
            }
            match results.iter_mut().find(|r| r.criterion_id == update.criterion_id) {
                Some(slot) => *slot = update,
                None => results.push(update),
            }
        }

        let total = self.total(&results)?;
        let mut section_scores = previous.section_scores.clone();
        for section in touched {
            match self.section_score(&results, &section) {
                Some(score) => section_scores.insert(section, score),
                None => section_scores.remove(&section),
            };
        }

        Ok(ScoreCard {
            decision_band: self.band(total),
            results,
            total,
            section_scores,
        })
    }

    fn weighted_mean<'a>(&self, results: impl Iterator<Item = &'a CriterionResult>) -> Option<f64> {
        let (mut weighted, mut weights) = (0.0, 0.0);
        for r in results.filter(|r| r.evaluated) {
            if let Some(c) = self.profile.criterion(&r.criterion_id) {
                weighted += c.weight * r.score;
                weights += c.weight;
            }
        }
        (weights > 0.0).then(|| (weighted / weights).clamp(0.0, 1.0))
    }

    fn total(&self, results: &[CriterionResult]) -> Result<f64, AggregationError> {
        self.weighted_mean(results.iter())
            .ok_or(AggregationError::NothingEvaluated)
    }

    /// Sub-score over evaluated criteria scoped to `section`.
    fn section_score(&self, results: &[CriterionResult], section: &str) -> Option<f64> {
        self.weighted_mean(results.iter().filter(|r| {
            self.profile
                .criterion(&r.criterion_id)
                .map(|c| c.targets(section))
                .unwrap_or(false)
        }))
    }

    /// Band for a total.
    pub fn band(&self, total: f64) -> DecisionBand {
        let t = &self.profile.thresholds;
        if total >= t.accept {
            DecisionBand::Accept
        } else if total >= t.patch {
            DecisionBand::Patch
        } else if total >= t.regenerate {
            DecisionBand::Regenerate
        } else {
            DecisionBand::Reject
        }
    }

    /// Map a scorecard to an action.
    ///
    /// Budgets are not considered here; the orchestrator escalates when a
    /// budget is spent.
    pub fn decide(&self, card: &ScoreCard) -> Decision {
        let below = self.below_sub_threshold(card);

        match card.decision_band {
            DecisionBand::Accept => {
                if !below.is_empty() && self.profile.thresholds.section_precedence == SectionPrecedence::Patch {
                    Decision::Patch(below)
                } else {
                    Decision::Accept
                }
            }
            DecisionBand::Patch => {
                if !below.is_empty() {
                    return Decision::Patch(below);
                }
                let failing = self.sections_with_failures(card);
                if failing.is_empty() {
                    Decision::Regenerate
                } else {
                    Decision::Patch(failing)
                }
            }
            DecisionBand::Regenerate => Decision::Regenerate,
            DecisionBand::Reject => Decision::Reject,
        }
    }

    fn below_sub_threshold(&self, card: &ScoreCard) -> Vec<PatchTarget> {
        let threshold = self.profile.thresholds.section_patch;
        let mut scored: Vec<(&String, f64)> = card
            .section_scores
            .iter()
            .filter(|(_, score)| **score < threshold)
            .map(|(name, score)| (name, *score))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        scored
            .into_iter()
            .map(|(name, _)| self.target(card, name))
            .collect()
    }

    fn sections_with_failures(&self, card: &ScoreCard) -> Vec<PatchTarget> {
        let mut scored: Vec<(&String, f64)> = card
            .section_scores
            .iter()
            .filter(|(name, _)| {
                card.results.iter().any(|r| {
                    self.profile
                        .criterion(&r.criterion_id)
                        .map(|c| c.targets(name) && r.evaluated && !r.passes(c.pass_threshold))
                        .unwrap_or(false)
                })
            })
            .map(|(name, score)| (name, *score))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        scored
            .into_iter()
            .map(|(name, _)| self.target(card, name))
            .collect()
    }

    fn target(&self, card: &ScoreCard, section: &str) -> PatchTarget {
        let mut failing: Vec<(&CriterionResult, Origin)> = card
            .results
            .iter()
            .filter_map(|r| {
                let c = self.profile.criterion(&r.criterion_id)?;
                (c.targets(section) && r.evaluated && !r.passes(c.pass_threshold)).then(|| (r, c.kind.into()))
            })
            .collect();
        failing.sort_by(|a, b| a.0.score.total_cmp(&b.0.score));

        PatchTarget {
            section: section.to_string(),
            origin: failing.first().map(|(_, o)| *o).unwrap_or(Origin::Rule),
            failing: failing.iter().map(|(r, _)| r.criterion_id.clone()).collect(),
        }
    }
}
