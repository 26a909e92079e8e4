//! Mandates and the typed artifacts produced by each phase.
//!
//! The oracle is free-form text; these are the strict shapes the rest of the
//! engine operates on.  Every artifact carries its own id, the id of the
//! agent that produced it, and a UTC timestamp, so a run's history can be
//! replayed or audited after the fact.

use crate::evoforge::dna::{clamp_unit, Capability, TraitVector};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The user-supplied problem statement and evolution budget.
///
/// # Example
///
/// ```rust
/// use evoforge::artifacts::Mandate;
///
/// let mandate = Mandate::new("Cheaper cold storage", "Cut archive storage cost by 40%")
///     .with_domain("infrastructure")
///     .with_constraint("no vendor lock-in")
///     .with_success_criterion("cost model validated against real traffic")
///     .with_max_iterations(5)
///     .with_max_agents(8);
///
/// assert_eq!(mandate.max_iterations, 5);
/// assert_eq!(mandate.constraints.len(), 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mandate {
    pub id: String,
    pub title: String,
    pub description: String,
    pub domain: String,
    pub constraints: Vec<String>,
    pub success_criteria: Vec<String>,
    pub max_iterations: u32,
    pub max_agents: usize,
    pub created: DateTime<Utc>,
}

impl Mandate {
    /// Create a mandate with defaults: general domain, no constraints,
    /// 10 iterations, 12 agents.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            domain: String::from("general"),
            constraints: Vec::new(),
            success_criteria: Vec::new(),
            max_iterations: 10,
            max_agents: 12,
            created: Utc::now(),
        }
    }

    /// Set the domain tag (builder pattern).
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Append a constraint (builder pattern).
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Append a success criterion (builder pattern).
    pub fn with_success_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.success_criteria.push(criterion.into());
        self
    }

    /// Override the iteration budget (builder pattern).
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Override the agent cap (builder pattern).
    pub fn with_max_agents(mut self, max_agents: usize) -> Self {
        self.max_agents = max_agents;
        self
    }
}

/// One proposal produced by an ideator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Idea {
    pub id: String,
    /// The ideator that proposed it.
    pub agent_id: String,
    pub title: String,
    pub description: String,
    pub approach: String,
    /// Self-reported by the oracle, clamped into `[0, 1]`.
    pub novelty: f64,
    pub created: DateTime<Utc>,
}

impl Idea {
    pub fn new(
        agent_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        approach: impl Into<String>,
        novelty: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            title: title.into(),
            description: description.into(),
            approach: approach.into(),
            novelty: clamp_unit(novelty),
            created: Utc::now(),
        }
    }
}

/// A simulator's assessment of one idea.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Simulation {
    pub id: String,
    /// The simulator that produced it.
    pub agent_id: String,
    /// The idea under simulation.
    pub idea_id: String,
    /// Self-reported by the oracle, clamped into `[0, 1]`.
    pub viability: f64,
    /// Free-form metric map reported by the oracle.
    pub metrics: HashMap<String, serde_json::Value>,
    pub risks: Vec<String>,
    pub recommendations: Vec<String>,
    pub created: DateTime<Utc>,
}

/// Verdict attached to a [`Critique`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    Approve,
    NeedsRevision,
    Reject,
}

impl Assessment {
    /// Parse the lower-snake-case wire form.
    pub fn parse(raw: &str) -> Option<Assessment> {
        match raw.trim().to_lowercase().as_str() {
            "approve" | "approved" => Some(Assessment::Approve),
            "needs_revision" | "needs-revision" => Some(Assessment::NeedsRevision),
            "reject" | "rejected" => Some(Assessment::Reject),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Assessment::Approve => "approve",
            Assessment::NeedsRevision => "needs_revision",
            Assessment::Reject => "reject",
        }
    }
}

/// A critic's review of an idea or simulation.
///
/// Any of the three list fields may be empty; an empty `flaws` list with an
/// `Approve` assessment is a perfectly normal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Critique {
    pub id: String,
    /// The critic that produced it.
    pub agent_id: String,
    /// Id of the idea or simulation under review.
    pub target_id: String,
    pub flaws: Vec<String>,
    pub strengths: Vec<String>,
    pub biases_detected: Vec<String>,
    pub assessment: Assessment,
    /// Self-reported by the oracle, clamped into `[0, 1]`.
    pub confidence: f64,
    pub created: DateTime<Utc>,
}

/// Partial trait mix carried by a spawn recommendation.
///
/// Only the traits the synthesizer chose to specify are present; the rest are
/// filled from the population average at spawn time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialTraits {
    pub creativity: Option<f64>,
    pub precision: Option<f64>,
    pub speed: Option<f64>,
    pub collaboration: Option<f64>,
}

impl PartialTraits {
    /// Overlay the specified traits on `base`, clamping the result.
    pub fn apply_to(&self, base: TraitVector) -> TraitVector {
        TraitVector {
            creativity: self.creativity.unwrap_or(base.creativity),
            precision: self.precision.unwrap_or(base.precision),
            speed: self.speed.unwrap_or(base.speed),
            collaboration: self.collaboration.unwrap_or(base.collaboration),
        }
        .clamped()
    }

    /// Whether any trait was specified.
    pub fn is_empty(&self) -> bool {
        self.creativity.is_none()
            && self.precision.is_none()
            && self.speed.is_none()
            && self.collaboration.is_none()
    }
}

/// The synthesizer's request for new population members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRecommendation {
    /// Trait preferences; the role-specific nudge rules still apply on top.
    #[serde(default)]
    pub traits: PartialTraits,
    /// Capabilities the new agents must cover.  Must be non-empty when the
    /// recommendation is attached to a ready-to-spawn synthesis.
    pub capabilities: Vec<Capability>,
    pub reasoning: String,
}

/// The synthesizer's verdict over a full iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    pub id: String,
    /// The synthesizer that produced it.
    pub agent_id: String,
    /// Up to three idea ids, best first.
    pub top_idea_ids: Vec<String>,
    pub combined_approach: String,
    /// Drives run termination; clamped into `[0, 1]`.
    pub consensus: f64,
    pub ready_to_spawn: bool,
    pub spawn_recommendation: Option<SpawnRecommendation>,
    pub created: DateTime<Utc>,
}

impl Synthesis {
    /// The synthesis produced when an iteration has nothing to synthesize:
    /// zero consensus and no spawn request.
    pub fn empty(agent_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            top_idea_ids: Vec::new(),
            combined_approach: String::from("No ideas were available to synthesize."),
            consensus: 0.0,
            ready_to_spawn: false,
            spawn_recommendation: None,
            created: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assessment_parsing() {
        assert_eq!(Assessment::parse("approve"), Some(Assessment::Approve));
        assert_eq!(
            Assessment::parse(" Needs_Revision "),
            Some(Assessment::NeedsRevision)
        );
        assert_eq!(Assessment::parse("rejected"), Some(Assessment::Reject));
        assert_eq!(Assessment::parse("maybe"), None);
    }

    #[test]
    fn partial_traits_overlay_and_clamp() {
        let partial = PartialTraits {
            creativity: Some(1.7),
            speed: Some(0.1),
            ..PartialTraits::default()
        };
        let out = partial.apply_to(TraitVector::default());
        assert!((out.creativity - 1.0).abs() < 1e-9);
        assert!((out.speed - 0.1).abs() < 1e-9);
        assert!((out.precision - 0.5).abs() < 1e-9);
    }

    #[test]
    fn idea_novelty_is_clamped() {
        let idea = Idea::new("a1", "t", "d", "how", 1.8);
        assert!((idea.novelty - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_synthesis_has_zero_consensus() {
        let synth = Synthesis::empty("synth-1");
        assert_eq!(synth.consensus, 0.0);
        assert!(!synth.ready_to_spawn);
        assert!(synth.top_idea_ids.is_empty());
    }
}
