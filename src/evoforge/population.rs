//! Typed agents and the live population arena.
//!
//! An [`EvoAgent`] pairs immutable [`AgentDna`] with a role tag; the role
//! decides which prompt is composed and which parser interprets the oracle's
//! answer.  Agents are cheap to clone (`Arc` internals), so the coordinator
//! can move clones into `tokio::spawn` worker tasks without touching the
//! live set.
//!
//! The [`Population`] owns the live set: agents live in a vector and every
//! reference into the set is an integer [`AgentHandle`], with an id map for
//! lookups.  The orchestrator is the only writer; readers clone snapshots.
//!
//! # Failure semantics
//!
//! Oracle retry lives one layer down in
//! [`ask_structured`](crate::evoforge::oracle::ask_structured).  When retries
//! are exhausted a role does *not* abort its phase: the ideator yields an
//! empty list, the simulator and critic yield neutral fallback artifacts with
//! a note, and the synthesizer yields a zero-consensus synthesis.  Warnings
//! describing the failures are carried on the [`RoleRun`] for the
//! orchestrator to publish.

use crate::evoforge::artifacts::{
    Assessment, Critique, Idea, Mandate, PartialTraits, Simulation, SpawnRecommendation, Synthesis,
};
use crate::evoforge::dna::{clamp_unit, AgentDna, Capability, TraitVector};
use crate::evoforge::oracle::{
    ask_structured, CancelSignal, ExpectedShape, FieldType, OracleClient,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// The four behavioural roles an agent can hold.  Immutable after
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Ideator,
    Simulator,
    Critic,
    Synthesizer,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Ideator => "ideator",
            AgentRole::Simulator => "simulator",
            AgentRole::Critic => "critic",
            AgentRole::Synthesizer => "synthesizer",
        }
    }

    /// The capability tag this role covers.
    pub fn capability(self) -> Capability {
        match self {
            AgentRole::Ideator => Capability::Ideation,
            AgentRole::Simulator => Capability::Simulation,
            AgentRole::Critic => Capability::Critique,
            AgentRole::Synthesizer => Capability::Synthesis,
        }
    }

    /// The role that hosts a requested capability.  Optimization work is
    /// hosted by simulators, research by ideators.
    pub fn for_capability(capability: Capability) -> AgentRole {
        match capability {
            Capability::Ideation | Capability::Research => AgentRole::Ideator,
            Capability::Simulation | Capability::Optimization => AgentRole::Simulator,
            Capability::Critique => AgentRole::Critic,
            Capability::Synthesis => AgentRole::Synthesizer,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one role invocation.
///
/// `failed` marks a fallback result produced after oracle exhaustion; the
/// coordinator counts failed workers to decide whether the whole phase
/// failed.  `warnings` holds human-readable notes (per-attempt retry errors
/// and fallback notices) for the orchestrator to publish.
#[derive(Debug, Clone)]
pub struct RoleRun<T> {
    pub output: T,
    pub warnings: Vec<String>,
    pub failed: bool,
}

impl<T> RoleRun<T> {
    fn ok(output: T, warnings: Vec<String>) -> Self {
        Self {
            output,
            warnings,
            failed: false,
        }
    }

    fn fallback(output: T, warnings: Vec<String>) -> Self {
        Self {
            output,
            warnings,
            failed: true,
        }
    }
}

/// The target handed to a critic: either an idea or a simulation.
#[derive(Debug, Clone, Copy)]
pub enum CritiqueTarget<'a> {
    Idea(&'a Idea),
    Simulation(&'a Simulation),
}

impl<'a> CritiqueTarget<'a> {
    pub fn id(&self) -> &str {
        match self {
            CritiqueTarget::Idea(idea) => &idea.id,
            CritiqueTarget::Simulation(sim) => &sim.id,
        }
    }
}

/// A DNA record bound to a role and an oracle.
///
/// Cloning shares the DNA and the oracle client; the clone is safe to move
/// into a worker task.
#[derive(Clone)]
pub struct EvoAgent {
    pub dna: Arc<AgentDna>,
    role: AgentRole,
    oracle: Arc<dyn OracleClient>,
}

impl EvoAgent {
    pub fn new(dna: AgentDna, role: AgentRole, oracle: Arc<dyn OracleClient>) -> Self {
        Self {
            dna: Arc::new(dna),
            role,
            oracle,
        }
    }

    pub fn id(&self) -> &str {
        &self.dna.id
    }

    pub fn name(&self) -> &str {
        &self.dna.name
    }

    /// The role is fixed at construction.
    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// Ask this ideator for `count` ideas.  Returns an empty list on oracle
    /// exhaustion.
    pub async fn run_ideation(
        &self,
        mandate: &Mandate,
        count: usize,
        cancel: &CancelSignal,
    ) -> RoleRun<Vec<Idea>> {
        let prompt = self.ideation_prompt(mandate, count);
        let schema = [
            ("title", FieldType::String),
            ("description", FieldType::String),
        ];
        match ask_structured(
            self.oracle.as_ref(),
            &self.dna.model,
            &prompt,
            ExpectedShape::JsonArray,
            &schema,
            cancel,
        )
        .await
        {
            Ok(answer) => {
                let ideas = parse_ideas(&answer.value, self.id());
                RoleRun::ok(ideas, answer.retry_errors)
            }
            Err(err) => RoleRun::fallback(
                Vec::new(),
                vec![format!("ideator {} produced no ideas: {}", self.name(), err)],
            ),
        }
    }

    /// Ask this simulator to assess one idea.  Produces a neutral fallback
    /// simulation on oracle exhaustion.
    pub async fn run_simulation(&self, idea: &Idea, cancel: &CancelSignal) -> RoleRun<Simulation> {
        let prompt = self.simulation_prompt(idea);
        let schema = [("viability", FieldType::Number)];
        match ask_structured(
            self.oracle.as_ref(),
            &self.dna.model,
            &prompt,
            ExpectedShape::JsonObject,
            &schema,
            cancel,
        )
        .await
        {
            Ok(answer) => {
                let sim = parse_simulation(&answer.value, self.id(), &idea.id);
                RoleRun::ok(sim, answer.retry_errors)
            }
            Err(err) => {
                let note = format!("simulation unavailable: {}", err);
                let sim = Simulation {
                    id: Uuid::new_v4().to_string(),
                    agent_id: self.id().to_string(),
                    idea_id: idea.id.clone(),
                    viability: 0.5,
                    metrics: HashMap::new(),
                    risks: vec![note.clone()],
                    recommendations: vec![String::from("retry in a later iteration")],
                    created: Utc::now(),
                };
                RoleRun::fallback(
                    sim,
                    vec![format!("simulator {} fell back: {}", self.name(), note)],
                )
            }
        }
    }

    /// Ask this critic to review an idea or simulation.  Produces a neutral
    /// needs-revision fallback on oracle exhaustion.
    pub async fn run_critique(
        &self,
        target: CritiqueTarget<'_>,
        cancel: &CancelSignal,
    ) -> RoleRun<Critique> {
        let prompt = self.critique_prompt(&target);
        let schema = [
            ("assessment", FieldType::String),
            ("confidence", FieldType::Number),
        ];
        match ask_structured(
            self.oracle.as_ref(),
            &self.dna.model,
            &prompt,
            ExpectedShape::JsonObject,
            &schema,
            cancel,
        )
        .await
        {
            Ok(answer) => {
                let (critique, mut warnings) =
                    parse_critique(&answer.value, self.id(), target.id());
                let mut all = answer.retry_errors;
                all.append(&mut warnings);
                RoleRun::ok(critique, all)
            }
            Err(err) => {
                let note = format!("critique unavailable: {}", err);
                let critique = Critique {
                    id: Uuid::new_v4().to_string(),
                    agent_id: self.id().to_string(),
                    target_id: target.id().to_string(),
                    flaws: vec![note.clone()],
                    strengths: Vec::new(),
                    biases_detected: Vec::new(),
                    assessment: Assessment::NeedsRevision,
                    confidence: 0.5,
                    created: Utc::now(),
                };
                RoleRun::fallback(
                    critique,
                    vec![format!("critic {} fell back: {}", self.name(), note)],
                )
            }
        }
    }

    /// Ask this synthesizer to fold an iteration's artifacts into a verdict.
    ///
    /// With zero ideas the oracle is not consulted at all: the result is the
    /// canonical empty synthesis (consensus 0, no spawn request).
    pub async fn run_synthesis(
        &self,
        ideas: &[Idea],
        simulations: &[Simulation],
        critiques: &[Critique],
        cancel: &CancelSignal,
    ) -> RoleRun<Synthesis> {
        if ideas.is_empty() {
            return RoleRun::ok(Synthesis::empty(self.id()), Vec::new());
        }
        let prompt = self.synthesis_prompt(ideas, simulations, critiques);
        let schema = [("consensus", FieldType::Number)];
        match ask_structured(
            self.oracle.as_ref(),
            &self.dna.model,
            &prompt,
            ExpectedShape::JsonObject,
            &schema,
            cancel,
        )
        .await
        {
            Ok(answer) => {
                let (synth, mut warnings) = parse_synthesis(&answer.value, self.id(), ideas);
                let mut all = answer.retry_errors;
                all.append(&mut warnings);
                RoleRun::ok(synth, all)
            }
            Err(err) => {
                let mut fallback = Synthesis::empty(self.id());
                fallback.combined_approach = format!("synthesis unavailable: {}", err);
                RoleRun::fallback(
                    fallback,
                    vec![format!("synthesizer {} fell back: {}", self.name(), err)],
                )
            }
        }
    }

    // ── Prompt composition ───────────────────────────────────────────────

    fn persona(&self) -> String {
        format!(
            "{}\n\nYour behavioural profile: {}.",
            self.dna.instructions,
            self.dna.traits.describe()
        )
    }

    fn ideation_prompt(&self, mandate: &Mandate, count: usize) -> String {
        let constraints = bullet_list(&mandate.constraints, "(none)");
        let criteria = bullet_list(&mandate.success_criteria, "(none)");
        format!(
            "{persona}\n\n\
             ## Problem\n{title}\n{description}\nDomain: {domain}\n\n\
             ## Constraints\n{constraints}\n\n\
             ## Success criteria\n{criteria}\n\n\
             ## Task\n\
             Propose exactly {count} distinct ideas. Respond with ONLY a JSON array; \
             each element must be an object with fields \"title\" (string), \
             \"description\" (string), \"approach\" (string), and \"novelty\" \
             (number between 0 and 1 rating how unconventional the idea is).",
            persona = self.persona(),
            title = mandate.title,
            description = mandate.description,
            domain = mandate.domain,
            constraints = constraints,
            criteria = criteria,
            count = count,
        )
    }

    fn simulation_prompt(&self, idea: &Idea) -> String {
        format!(
            "{persona}\n\n\
             ## Idea under simulation\nTitle: {title}\nDescription: {description}\n\
             Approach: {approach}\n\n\
             ## Task\n\
             Mentally simulate executing this idea. Respond with ONLY a JSON object \
             with fields \"viability\" (number between 0 and 1), \"metrics\" (object \
             of named measurements), \"risks\" (array of strings, at least one), and \
             \"recommendations\" (array of strings, at least one).",
            persona = self.persona(),
            title = idea.title,
            description = idea.description,
            approach = idea.approach,
        )
    }

    fn critique_prompt(&self, target: &CritiqueTarget<'_>) -> String {
        let subject = match target {
            CritiqueTarget::Idea(idea) => format!(
                "An idea.\nTitle: {}\nDescription: {}\nApproach: {}\nSelf-reported novelty: {:.2}",
                idea.title, idea.description, idea.approach, idea.novelty
            ),
            CritiqueTarget::Simulation(sim) => format!(
                "A simulation result.\nViability: {:.2}\nRisks: {}\nRecommendations: {}",
                sim.viability,
                sim.risks.join("; "),
                sim.recommendations.join("; ")
            ),
        };
        format!(
            "{persona}\n\n\
             ## Subject under review\n{subject}\n\n\
             ## Task\n\
             Review the subject adversarially. Respond with ONLY a JSON object with \
             fields \"flaws\" (array of strings), \"strengths\" (array of strings), \
             \"biases_detected\" (array of strings), \"assessment\" (one of \
             \"approve\", \"needs_revision\", \"reject\"), and \"confidence\" \
             (number between 0 and 1).",
            persona = self.persona(),
            subject = subject,
        )
    }

    fn synthesis_prompt(
        &self,
        ideas: &[Idea],
        simulations: &[Simulation],
        critiques: &[Critique],
    ) -> String {
        let mut ideas_block = String::new();
        for idea in ideas {
            ideas_block.push_str(&format!(
                "- id {} | {} (novelty {:.2}): {}\n",
                idea.id, idea.title, idea.novelty, idea.description
            ));
        }
        let mut sims_block = String::new();
        for sim in simulations {
            sims_block.push_str(&format!(
                "- idea {} viability {:.2}; risks: {}\n",
                sim.idea_id,
                sim.viability,
                sim.risks.join("; ")
            ));
        }
        let mut crits_block = String::new();
        for critique in critiques {
            crits_block.push_str(&format!(
                "- target {} assessment {} (confidence {:.2}); flaws: {}\n",
                critique.target_id,
                critique.assessment.as_str(),
                critique.confidence,
                critique.flaws.join("; ")
            ));
        }
        format!(
            "{persona}\n\n\
             ## Ideas\n{ideas}\n## Simulations\n{sims}\n## Critiques\n{crits}\n\
             ## Task\n\
             Synthesize this iteration. Respond with ONLY a JSON object with fields \
             \"top_idea_ids\" (array of up to 3 idea ids, best first), \
             \"combined_approach\" (string), \"consensus\" (number between 0 and 1 \
             measuring how close the swarm is to a winning approach), \
             \"ready_to_spawn\" (boolean), and optionally \"spawn_recommendation\" \
             (object with \"capabilities\", an array drawn from ideation, simulation, \
             critique, synthesis, optimization, research, plus optional \"traits\" \
             object and \"reasoning\" string).",
            persona = self.persona(),
            ideas = ideas_block,
            sims = sims_block,
            crits = crits_block,
        )
    }
}

// ── Response parsers ─────────────────────────────────────────────────────

fn parse_ideas(value: &serde_json::Value, agent_id: &str) -> Vec<Idea> {
    let items = match value.as_array() {
        Some(items) => items,
        None => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let title = obj.get("title")?.as_str()?.trim();
            if title.is_empty() {
                return None;
            }
            let description = obj
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let approach = obj.get("approach").and_then(|v| v.as_str()).unwrap_or("");
            let novelty = obj
                .get("novelty")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5);
            Some(Idea::new(agent_id, title, description, approach, novelty))
        })
        .collect()
}

fn parse_simulation(value: &serde_json::Value, agent_id: &str, idea_id: &str) -> Simulation {
    let viability = value
        .get("viability")
        .and_then(|v| v.as_f64())
        .map(clamp_unit)
        .unwrap_or(0.5);
    let metrics = value
        .get("metrics")
        .and_then(|v| v.as_object())
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let mut risks = string_list(value.get("risks"));
    if risks.is_empty() {
        risks.push(String::from("no risks reported"));
    }
    let mut recommendations = string_list(value.get("recommendations"));
    if recommendations.is_empty() {
        recommendations.push(String::from("no recommendations reported"));
    }
    Simulation {
        id: Uuid::new_v4().to_string(),
        agent_id: agent_id.to_string(),
        idea_id: idea_id.to_string(),
        viability,
        metrics,
        risks,
        recommendations,
        created: Utc::now(),
    }
}

fn parse_critique(
    value: &serde_json::Value,
    agent_id: &str,
    target_id: &str,
) -> (Critique, Vec<String>) {
    let mut warnings = Vec::new();
    let raw_assessment = value
        .get("assessment")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let assessment = match Assessment::parse(raw_assessment) {
        Some(a) => a,
        None => {
            warnings.push(format!(
                "critic {} returned unknown assessment '{}'; recorded as needs_revision",
                agent_id, raw_assessment
            ));
            Assessment::NeedsRevision
        }
    };
    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(clamp_unit)
        .unwrap_or(0.5);
    let critique = Critique {
        id: Uuid::new_v4().to_string(),
        agent_id: agent_id.to_string(),
        target_id: target_id.to_string(),
        flaws: string_list(value.get("flaws")),
        strengths: string_list(value.get("strengths")),
        biases_detected: string_list(value.get("biases_detected")),
        assessment,
        confidence,
        created: Utc::now(),
    };
    (critique, warnings)
}

fn parse_synthesis(
    value: &serde_json::Value,
    agent_id: &str,
    ideas: &[Idea],
) -> (Synthesis, Vec<String>) {
    let mut warnings = Vec::new();
    let consensus = value
        .get("consensus")
        .and_then(|v| v.as_f64())
        .map(clamp_unit)
        .unwrap_or(0.0);

    // Top ideas: keep only ids that exist, best first, capped at
    // min(3, available); fall back to novelty ordering when the oracle's
    // selection is unusable or absent.
    let cap = ideas.len().min(3);
    let selection_provided = value.get("top_idea_ids").is_some();
    let mut top_idea_ids: Vec<String> = string_list(value.get("top_idea_ids"))
        .into_iter()
        .filter(|id| ideas.iter().any(|i| &i.id == id))
        .take(cap)
        .collect();
    if top_idea_ids.is_empty() && cap > 0 {
        let mut ranked: Vec<&Idea> = ideas.iter().collect();
        ranked.sort_by(|a, b| {
            b.novelty
                .partial_cmp(&a.novelty)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        top_idea_ids = ranked.iter().take(cap).map(|i| i.id.clone()).collect();
        if selection_provided {
            warnings.push(format!(
                "synthesizer {} selected no known idea ids; ranked by novelty instead",
                agent_id
            ));
        }
    }

    let combined_approach = value
        .get("combined_approach")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let mut ready_to_spawn = value
        .get("ready_to_spawn")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let spawn_recommendation = value.get("spawn_recommendation").and_then(|rec| {
        let capabilities: Vec<Capability> = string_list(rec.get("capabilities"))
            .iter()
            .filter_map(|name| Capability::parse(name))
            .collect();
        if capabilities.is_empty() {
            return None;
        }
        let traits: PartialTraits = rec
            .get("traits")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let reasoning = rec
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Some(SpawnRecommendation {
            traits,
            capabilities,
            reasoning,
        })
    });

    // A ready-to-spawn synthesis must identify at least one capability.
    if ready_to_spawn && spawn_recommendation.is_none() {
        warnings.push(format!(
            "synthesizer {} set ready_to_spawn without a usable capability list; ignoring",
            agent_id
        ));
        ready_to_spawn = false;
    }

    let synth = Synthesis {
        id: Uuid::new_v4().to_string(),
        agent_id: agent_id.to_string(),
        top_idea_ids,
        combined_approach,
        consensus,
        ready_to_spawn,
        spawn_recommendation,
        created: Utc::now(),
    };
    (synth, warnings)
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn bullet_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return empty.to_string();
    }
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Population arena ─────────────────────────────────────────────────────

/// Stable integer handle into the population arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentHandle(pub usize);

/// Errors raised by population mutation.
#[derive(Debug, Clone)]
pub enum PopulationError {
    /// Adding the agent would exceed the run's agent cap.
    CapacityExceeded { cap: usize },
    /// An agent with this id is already registered.
    DuplicateId(String),
}

impl fmt::Display for PopulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopulationError::CapacityExceeded { cap } => {
                write!(f, "population is at its cap of {} agents", cap)
            }
            PopulationError::DuplicateId(id) => {
                write!(f, "agent with id '{}' already exists", id)
            }
        }
    }
}

impl Error for PopulationError {}

/// Summary of one agent, safe to hand to control-plane readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    pub generation: u32,
    pub traits: TraitVector,
    pub capabilities: Vec<Capability>,
}

/// Copy-on-read view of the population for status endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PopulationSnapshot {
    pub agents: Vec<AgentSummary>,
    pub counts: HashMap<String, usize>,
    pub diversity: f64,
}

/// The live agent set for one run.  Single-writer (the orchestrator);
/// readers work from clones and snapshots.
pub struct Population {
    agents: Vec<EvoAgent>,
    index: HashMap<String, usize>,
    max_agents: usize,
}

impl Population {
    pub fn new(max_agents: usize) -> Self {
        Self {
            agents: Vec::new(),
            index: HashMap::new(),
            max_agents: max_agents.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }

    /// Whether another agent can be added without breaching the cap.
    pub fn has_room(&self) -> bool {
        self.agents.len() < self.max_agents
    }

    /// Add an agent, returning its handle.  Enforces the agent cap and id
    /// uniqueness.
    pub fn add(&mut self, agent: EvoAgent) -> Result<AgentHandle, PopulationError> {
        if self.agents.len() >= self.max_agents {
            return Err(PopulationError::CapacityExceeded {
                cap: self.max_agents,
            });
        }
        let id = agent.id().to_string();
        if self.index.contains_key(&id) {
            return Err(PopulationError::DuplicateId(id));
        }
        let handle = AgentHandle(self.agents.len());
        self.index.insert(id, handle.0);
        self.agents.push(agent);
        Ok(handle)
    }

    pub fn get(&self, handle: AgentHandle) -> Option<&EvoAgent> {
        self.agents.get(handle.0)
    }

    pub fn by_id(&self, id: &str) -> Option<&EvoAgent> {
        self.index.get(id).and_then(|&idx| self.agents.get(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvoAgent> {
        self.agents.iter()
    }

    /// Clones of every agent holding `role`, in insertion order.
    pub fn with_role(&self, role: AgentRole) -> Vec<EvoAgent> {
        self.agents
            .iter()
            .filter(|a| a.role() == role)
            .cloned()
            .collect()
    }

    /// The first agent holding `role`, if any.
    pub fn first_with_role(&self, role: AgentRole) -> Option<&EvoAgent> {
        self.agents.iter().find(|a| a.role() == role)
    }

    /// Mean trait vector across all live agents.
    pub fn average_traits(&self) -> TraitVector {
        TraitVector::average(self.agents.iter().map(|a| &a.dna.traits))
    }

    /// Every agent's trait vector, in insertion order.
    pub fn trait_vectors(&self) -> Vec<TraitVector> {
        self.agents.iter().map(|a| a.dna.traits).collect()
    }

    /// Copy-on-read snapshot for the control plane.
    pub fn snapshot(&self) -> PopulationSnapshot {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let agents: Vec<AgentSummary> = self
            .agents
            .iter()
            .map(|a| {
                *counts.entry(a.role().as_str().to_string()).or_insert(0) += 1;
                AgentSummary {
                    id: a.dna.id.clone(),
                    name: a.dna.name.clone(),
                    role: a.role(),
                    generation: a.dna.generation,
                    traits: a.dna.traits,
                    capabilities: a.dna.capabilities.iter().cloned().collect(),
                }
            })
            .collect();
        let diversity = crate::evoforge::dna::diversity(&self.trait_vectors());
        PopulationSnapshot {
            agents,
            counts,
            diversity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evoforge::oracle::{OracleError, OracleErrorKind};
    use async_trait::async_trait;

    struct EchoOracle(String);

    #[async_trait]
    impl OracleClient for EchoOracle {
        async fn ask(&self, _model: &str, _prompt: &str) -> Result<String, OracleError> {
            Ok(self.0.clone())
        }
    }

    struct DeadOracle;

    #[async_trait]
    impl OracleClient for DeadOracle {
        async fn ask(&self, _model: &str, _prompt: &str) -> Result<String, OracleError> {
            Err(OracleError::new(OracleErrorKind::Auth, "bad key"))
        }
    }

    fn agent_with(role: AgentRole, oracle: Arc<dyn OracleClient>) -> EvoAgent {
        let dna = AgentDna::root(
            format!("Test {}", role.as_str()),
            TraitVector::default(),
            vec![role.capability()],
            "mock-model",
            "Do the work.",
        );
        EvoAgent::new(dna, role, oracle)
    }

    #[test]
    fn parse_ideas_skips_invalid_entries() {
        let value = serde_json::json!([
            {"title": "Good", "description": "d", "approach": "a", "novelty": 0.7},
            {"description": "missing title"},
            {"title": "", "description": "empty title"},
            {"title": "Clamped", "novelty": 7.0},
        ]);
        let ideas = parse_ideas(&value, "agent-1");
        assert_eq!(ideas.len(), 2);
        assert!((ideas[1].novelty - 1.0).abs() < 1e-9);
    }

    #[test]
    fn parse_simulation_fills_required_lists() {
        let value = serde_json::json!({"viability": 0.8, "risks": [], "metrics": {"cost": 3}});
        let sim = parse_simulation(&value, "a", "i");
        assert_eq!(sim.risks.len(), 1);
        assert_eq!(sim.recommendations.len(), 1);
        assert!(sim.metrics.contains_key("cost"));
    }

    #[test]
    fn parse_critique_defaults_unknown_assessment() {
        let value = serde_json::json!({"assessment": "meh", "confidence": 0.9});
        let (critique, warnings) = parse_critique(&value, "a", "t");
        assert_eq!(critique.assessment, Assessment::NeedsRevision);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn parse_synthesis_validates_top_ideas_and_spawn_request() {
        let ideas = vec![
            Idea::new("a", "One", "", "", 0.9),
            Idea::new("a", "Two", "", "", 0.2),
        ];
        let value = serde_json::json!({
            "consensus": 0.6,
            "top_idea_ids": ["bogus"],
            "ready_to_spawn": true,
            "spawn_recommendation": {"capabilities": ["unknown"]},
        });
        let (synth, warnings) = parse_synthesis(&value, "s", &ideas);
        // bogus ids are dropped; novelty ordering takes over
        assert_eq!(synth.top_idea_ids.len(), 2);
        assert_eq!(synth.top_idea_ids[0], ideas[0].id);
        // no usable capabilities => spawn request is ignored
        assert!(!synth.ready_to_spawn);
        assert!(synth.spawn_recommendation.is_none());
        assert_eq!(warnings.len(), 2);
    }

    #[tokio::test]
    async fn ideator_falls_back_to_empty_on_fatal_oracle() {
        let agent = agent_with(AgentRole::Ideator, Arc::new(DeadOracle));
        let mandate = Mandate::new("T", "D");
        let run = agent
            .run_ideation(&mandate, 2, &CancelSignal::never())
            .await;
        assert!(run.failed);
        assert!(run.output.is_empty());
        assert_eq!(run.warnings.len(), 1);
    }

    #[tokio::test]
    async fn simulator_fallback_is_neutral() {
        let agent = agent_with(AgentRole::Simulator, Arc::new(DeadOracle));
        let idea = Idea::new("a", "T", "d", "how", 0.5);
        let run = agent.run_simulation(&idea, &CancelSignal::never()).await;
        assert!(run.failed);
        assert!((run.output.viability - 0.5).abs() < 1e-9);
        assert_eq!(run.output.idea_id, idea.id);
    }

    #[tokio::test]
    async fn synthesizer_short_circuits_on_zero_ideas() {
        let agent = agent_with(AgentRole::Synthesizer, Arc::new(DeadOracle));
        let run = agent
            .run_synthesis(&[], &[], &[], &CancelSignal::never())
            .await;
        // DeadOracle is never consulted, so this is a clean empty synthesis.
        assert!(!run.failed);
        assert_eq!(run.output.consensus, 0.0);
        assert!(!run.output.ready_to_spawn);
    }

    #[tokio::test]
    async fn ideator_parses_oracle_array() {
        let oracle = Arc::new(EchoOracle(
            "[{\"title\": \"A\", \"description\": \"d\", \"approach\": \"x\", \"novelty\": 0.4}]"
                .to_string(),
        ));
        let agent = agent_with(AgentRole::Ideator, oracle);
        let mandate = Mandate::new("T", "D");
        let run = agent
            .run_ideation(&mandate, 1, &CancelSignal::never())
            .await;
        assert!(!run.failed);
        assert_eq!(run.output.len(), 1);
        assert_eq!(run.output[0].agent_id, agent.id());
    }

    #[test]
    fn population_enforces_cap_and_unique_ids() {
        let oracle: Arc<dyn OracleClient> = Arc::new(DeadOracle);
        let mut population = Population::new(2);
        let a = agent_with(AgentRole::Ideator, oracle.clone());
        let duplicate = a.clone();
        population.add(a).unwrap();
        match population.add(duplicate) {
            Err(PopulationError::DuplicateId(_)) => {}
            other => panic!("expected duplicate id error, got {:?}", other.map(|_| ())),
        }
        population
            .add(agent_with(AgentRole::Critic, oracle.clone()))
            .unwrap();
        match population.add(agent_with(AgentRole::Simulator, oracle)) {
            Err(PopulationError::CapacityExceeded { cap }) => assert_eq!(cap, 2),
            other => panic!("expected capacity error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn snapshot_counts_roles() {
        let oracle: Arc<dyn OracleClient> = Arc::new(DeadOracle);
        let mut population = Population::new(8);
        population
            .add(agent_with(AgentRole::Ideator, oracle.clone()))
            .unwrap();
        population
            .add(agent_with(AgentRole::Ideator, oracle.clone()))
            .unwrap();
        population
            .add(agent_with(AgentRole::Critic, oracle))
            .unwrap();
        let snapshot = population.snapshot();
        assert_eq!(snapshot.agents.len(), 3);
        assert_eq!(snapshot.counts["ideator"], 2);
        assert_eq!(snapshot.counts["critic"], 1);
    }
}
