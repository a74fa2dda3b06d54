//! Resonance matching: rank candidate agents against a formulated demand.
//!
//! Scoring is cosine similarity over unit vectors, computed across *views*:
//! three views of the demand (intent, constraints, combined) against two
//! views of each profile (capabilities, context). The aggregate score is
//! the maximum over all view pairs, so matching strongly on any single
//! facet is enough to surface an agent.
//!
//! Everything in this module is a pure function over already-encoded
//! vectors; encoding happens in the engine, in one order-preserving batch.

use crate::parley::channel::AgentProfile;
use crate::parley::session::FormulatedDemand;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Names of the demand-side views, in batch-encoding order.
pub const DEMAND_VIEW_NAMES: [&str; 3] = ["intent", "constraints", "combined"];

/// Names of the profile-side views, in batch-encoding order.
pub const PROFILE_VIEW_NAMES: [&str; 2] = ["capabilities", "context"];

/// Encoded views of one formulated demand.
#[derive(Debug, Clone)]
pub struct EncodedDemand {
    pub intent: Vec<f32>,
    pub constraints: Vec<f32>,
    pub combined: Vec<f32>,
}

impl EncodedDemand {
    fn view(&self, name: &str) -> &[f32] {
        match name {
            "intent" => &self.intent,
            "constraints" => &self.constraints,
            _ => &self.combined,
        }
    }
}

/// Encoded views of one agent profile.
#[derive(Debug, Clone)]
pub struct EncodedProfile {
    pub agent_id: String,
    pub capabilities: Vec<f32>,
    pub context: Vec<f32>,
}

impl EncodedProfile {
    fn view(&self, name: &str) -> &[f32] {
        match name {
            "capabilities" => &self.capabilities,
            _ => &self.context,
        }
    }
}

/// Similarity of one (demand view, profile view) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewPairScore {
    pub demand_view: String,
    pub profile_view: String,
    pub score: f32,
}

/// All view-pair similarities behind one aggregate score.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScoreBreakdown {
    pub pairs: Vec<ViewPairScore>,
}

/// One ranked candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResonanceMatch {
    pub agent_id: String,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
}

/// The three demand view texts, in [`DEMAND_VIEW_NAMES`] order.
///
/// The combined view concatenates intent, constraints, and preferences so
/// that agents matching the demand as a whole still surface.
pub fn demand_view_texts(demand: &FormulatedDemand) -> [String; 3] {
    let constraints = demand.constraints.join(". ");
    let combined = {
        let mut parts = vec![demand.intent.clone()];
        parts.extend(demand.constraints.iter().cloned());
        parts.extend(demand.preferences.iter().cloned());
        parts.join(". ")
    };
    [demand.intent.clone(), constraints, combined]
}

/// The two profile view texts, in [`PROFILE_VIEW_NAMES`] order.
pub fn profile_view_texts(profile: &AgentProfile) -> [String; 2] {
    [profile.capabilities.join(". "), profile.context.clone()]
}

/// Cosine similarity. Vectors are expected unit-length; zero vectors score
/// zero against everything.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Score one profile against the demand: max over all view pairs, with the
/// full breakdown.
pub fn score_profile(demand: &EncodedDemand, profile: &EncodedProfile) -> (f32, ScoreBreakdown) {
    let mut best = 0.0f32;
    let mut pairs = Vec::with_capacity(DEMAND_VIEW_NAMES.len() * PROFILE_VIEW_NAMES.len());
    for demand_view in DEMAND_VIEW_NAMES {
        for profile_view in PROFILE_VIEW_NAMES {
            let s = cosine(demand.view(demand_view), profile.view(profile_view));
            if s > best {
                best = s;
            }
            pairs.push(ViewPairScore {
                demand_view: demand_view.to_string(),
                profile_view: profile_view.to_string(),
                score: s,
            });
        }
    }
    (best, ScoreBreakdown { pairs })
}

/// Rank every profile against the demand, best first. Ties break by
/// lexicographic agent id, which makes ranking deterministic for a given
/// demand, registry, and encoder.
pub fn rank(demand: &EncodedDemand, profiles: &[EncodedProfile]) -> Vec<ResonanceMatch> {
    let mut matches: Vec<ResonanceMatch> = profiles
        .iter()
        .map(|p| {
            let (score, breakdown) = score_profile(demand, p);
            ResonanceMatch {
                agent_id: p.agent_id.clone(),
                score,
                breakdown,
            }
        })
        .collect();
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });
    matches
}

/// Apply the selection policy: drop candidates below `threshold`, keep at
/// most `top_k` of the rest. The input must already be ranked.
pub fn select(matches: Vec<ResonanceMatch>, threshold: f32, top_k: usize) -> Vec<ResonanceMatch> {
    matches
        .into_iter()
        .filter(|m| m.score >= threshold)
        .take(top_k)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: Vec<f32>) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.into_iter().map(|x| x / norm).collect()
    }

    fn profile(id: &str, capabilities: Vec<f32>, context: Vec<f32>) -> EncodedProfile {
        EncodedProfile {
            agent_id: id.to_string(),
            capabilities,
            context,
        }
    }

    fn demand_along(axis: usize) -> EncodedDemand {
        let mut v = vec![0.0; 4];
        v[axis] = 1.0;
        EncodedDemand {
            intent: v.clone(),
            constraints: v.clone(),
            combined: v,
        }
    }

    #[test]
    fn cosine_of_identical_unit_vectors_is_one() {
        let v = unit(vec![1.0, 2.0, 3.0, 4.0]);
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert_eq!(cosine(&a, &b), 0.0);
    }

    #[test]
    fn aggregate_is_max_over_view_pairs() {
        let demand = demand_along(0);
        // Capabilities orthogonal, context aligned: the context pair must
        // carry the aggregate.
        let p = profile("alice", vec![0.0, 1.0, 0.0, 0.0], vec![1.0, 0.0, 0.0, 0.0]);
        let (score, breakdown) = score_profile(&demand, &p);
        assert!((score - 1.0).abs() < 1e-6);
        assert_eq!(breakdown.pairs.len(), 6);
    }

    #[test]
    fn rank_orders_by_score_then_id() {
        let demand = demand_along(0);
        let strong = vec![1.0, 0.0, 0.0, 0.0];
        let weak = unit(vec![1.0, 1.0, 0.0, 0.0]);
        let profiles = vec![
            profile("carol", weak.clone(), weak.clone()),
            profile("bob", strong.clone(), strong.clone()),
            profile("alice", strong.clone(), strong.clone()),
        ];
        let ranked = rank(&demand, &profiles);
        let ids: Vec<&str> = ranked.iter().map(|m| m.agent_id.as_str()).collect();
        // alice and bob tie at 1.0 and break lexicographically.
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn selection_applies_threshold_then_top_k() {
        let demand = demand_along(0);
        let strong = vec![1.0, 0.0, 0.0, 0.0];
        let weak = unit(vec![1.0, 3.0, 0.0, 0.0]);
        let nothing = vec![0.0, 1.0, 0.0, 0.0];
        let ranked = rank(
            &demand,
            &[
                profile("alice", strong.clone(), strong.clone()),
                profile("bob", weak.clone(), weak.clone()),
                profile("carol", nothing.clone(), nothing),
            ],
        );
        let selected = select(ranked.clone(), 0.2, 5);
        assert_eq!(selected.len(), 2);

        let capped = select(ranked, 0.2, 1);
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].agent_id, "alice");
    }

    #[test]
    fn ranking_is_deterministic() {
        let demand = demand_along(2);
        let profiles: Vec<EncodedProfile> = (0..8)
            .map(|i| {
                let v = unit(vec![1.0, i as f32, 2.0, 0.5]);
                profile(&format!("agent-{}", i), v.clone(), v)
            })
            .collect();
        let first = rank(&demand, &profiles);
        let second = rank(&demand, &profiles);
        let ids = |r: &[ResonanceMatch]| r.iter().map(|m| m.agent_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }
}
