//! The evolution orchestrator: one task that drives a run.
//!
//! Each iteration walks the four phases (ideation, simulation, critique,
//! synthesis) through the [`SwarmCoordinator`], records the synthesizer's
//! consensus, checks the termination predicates, and lets the genesis
//! machinery grow the population.  All run state is owned by this single
//! task; the control plane reads copy-on-read snapshots and talks back only
//! through a command channel and the cancellation handle.
//!
//! Termination, in check order per iteration:
//!
//! 1. stability convergence (three stable, non-improving consensus values),
//! 2. breakthrough (consensus at or above the threshold),
//! 3. agent cap reached,
//! 4. iteration budget spent,
//!
//! plus failure escalation: two *consecutive* failed phases (every worker
//! failed, or the phase deadline expired) abort the run.
//!
//! Spawn commits are atomic with respect to readers: DNA is built first, then
//! population insert, then lineage registration, then the snapshot write and
//! the `agent_spawned` event.  A reader never observes a half-spawned agent.

use crate::evoforge::artifacts::{Critique, Idea, Mandate, Simulation, SpawnRecommendation, Synthesis};
use crate::evoforge::bus::EventBus;
use crate::evoforge::coordinator::{PhaseDisposition, PhaseError, PhaseReport, SwarmCoordinator};
use crate::evoforge::dna::{
    breed, genetic_distance, tournament_select, AgentDna, Capability, TraitKind, TraitVector,
};
use crate::evoforge::event::{EventKind, Phase, RunStats, TerminationReason};
use crate::evoforge::lineage::{FamilyTreeNode, LineageStats, LineageTracker};
use crate::evoforge::oracle::{cancel_pair, CancelHandle, CancelSignal, OracleClient};
use crate::evoforge::population::{
    AgentRole, EvoAgent, Population, PopulationError, PopulationSnapshot,
};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-role oracle model identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleModels {
    pub ideator: String,
    pub simulator: String,
    pub critic: String,
    pub synthesizer: String,
}

impl Default for RoleModels {
    fn default() -> Self {
        let model = String::from("gpt-4o-mini");
        Self {
            ideator: model.clone(),
            simulator: model.clone(),
            critic: model.clone(),
            synthesizer: model,
        }
    }
}

impl RoleModels {
    pub fn for_role(&self, role: AgentRole) -> &str {
        match role {
            AgentRole::Ideator => &self.ideator,
            AgentRole::Simulator => &self.simulator,
            AgentRole::Critic => &self.critic,
            AgentRole::Synthesizer => &self.synthesizer,
        }
    }
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Consensus at or above this value terminates with `breakthrough`.
    pub breakthrough_threshold: f64,
    /// Stability bound on the standard deviation of the last three
    /// consensus values.
    pub stability_epsilon: f64,
    /// Ideas requested from each ideator per iteration.
    pub ideas_per_agent: usize,
    /// Hard cap on specialists spawned in a single iteration.
    pub max_spawns_per_iteration: usize,
    /// Wall-clock budget per phase.
    pub phase_deadline: Duration,
    /// Per-subscriber inbox capacity for the run's event bus.
    pub bus_capacity: usize,
    /// Events retained for `Last-Event-ID` replay.
    pub bus_retention: usize,
    /// Mutation rate applied when breeding hybrids.
    pub mutation_rate: f64,
    /// Minimum genetic distance between breeding parents.
    pub min_breeding_distance: f64,
    pub models: RoleModels,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            breakthrough_threshold: 0.85,
            stability_epsilon: 0.01,
            ideas_per_agent: 2,
            max_spawns_per_iteration: 2,
            phase_deadline: Duration::from_secs(300),
            bus_capacity: 256,
            bus_retention: 256,
            mutation_rate: 0.3,
            min_breeding_distance: 0.3,
            models: RoleModels::default(),
        }
    }
}

/// Coarse run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Copy-on-read view of a run for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub title: String,
    pub status: RunStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub consensus: f64,
    pub consensus_history: Vec<f64>,
    pub population: PopulationSnapshot,
    pub lineage_stats: LineageStats,
    pub family_tree: Vec<FamilyTreeNode>,
    pub ideas: usize,
    pub simulations: usize,
    pub critiques: usize,
    pub agents_spawned: usize,
    pub started: DateTime<Utc>,
    pub termination: Option<TerminationReason>,
}

/// Operator commands dispatched through the control plane.
#[derive(Debug, Clone)]
pub enum RunCommand {
    /// Breed two live agents into a hybrid.  With ids omitted the
    /// orchestrator selects parents itself: a fitness tournament for the
    /// first, the most genetically distant partner for the second.
    Breed {
        parent1: Option<String>,
        parent2: Option<String>,
    },
}

/// The control plane's grip on a running evolution.
///
/// Everything here is read-only with respect to run state: snapshots are
/// clones, the bus hands out independent subscriptions, and mutation
/// requests travel through the command channel to the orchestrator task.
pub struct RunHandle {
    pub id: String,
    bus: EventBus,
    cancel: CancelHandle,
    commands: mpsc::Sender<RunCommand>,
    snapshot: Arc<RwLock<RunSnapshot>>,
}

impl RunHandle {
    /// The run's event bus (subscribe for SSE/WS fan-out).
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Clone the current status snapshot.
    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot.read().expect("run snapshot poisoned").clone()
    }

    /// Request cooperative cancellation of the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Queue a command for the orchestrator; `false` when the run has
    /// already terminated.
    pub fn send_command(&self, command: RunCommand) -> bool {
        self.commands.try_send(command).is_ok()
    }
}

enum Outcome {
    Completed(TerminationReason),
    Failed(String),
}

/// The orchestrator task state for one run.
pub struct EvolutionRun {
    id: String,
    mandate: Mandate,
    config: OrchestratorConfig,
    oracle: Arc<dyn OracleClient>,
    population: Population,
    lineage: LineageTracker,
    coordinator: SwarmCoordinator,
    bus: EventBus,
    cancel: CancelSignal,
    commands: mpsc::Receiver<RunCommand>,
    snapshot: Arc<RwLock<RunSnapshot>>,
    rng: StdRng,

    iteration: u32,
    history: Vec<f64>,
    ideas: Vec<Idea>,
    simulations: Vec<Simulation>,
    critiques: Vec<Critique>,
    syntheses: Vec<Synthesis>,
    /// Per-agent quality scores from the current iteration, feeding the
    /// breeding path's fitness selection.
    fitness: HashMap<String, Vec<f64>>,
    agents_spawned: usize,
    consecutive_failed_phases: u32,
    /// Set when an internal invariant is violated; checked at the next safe
    /// point and escalated to `RunFailed`.
    fatal: Option<String>,
    started: DateTime<Utc>,
}

impl EvolutionRun {
    /// Build a run, seed the founding population, and spawn the orchestrator
    /// task in the background.  Returns immediately with the handle.
    pub fn spawn(
        mandate: Mandate,
        oracle: Arc<dyn OracleClient>,
        config: OrchestratorConfig,
    ) -> Result<Arc<RunHandle>, Box<dyn std::error::Error + Send + Sync>> {
        let id = Uuid::new_v4().to_string();
        let bus = EventBus::with_retention(config.bus_capacity, config.bus_retention);
        let (cancel_handle, cancel_signal) = cancel_pair();
        let (command_tx, command_rx) = mpsc::channel(8);

        let mut population = Population::new(mandate.max_agents);
        let mut lineage = LineageTracker::new();
        for role in [
            AgentRole::Ideator,
            AgentRole::Simulator,
            AgentRole::Critic,
            AgentRole::Synthesizer,
        ] {
            let dna = founding_dna(role, &config.models);
            lineage.register(&dna)?;
            population.add(EvoAgent::new(dna, role, oracle.clone()))?;
        }

        let started = Utc::now();
        let snapshot = Arc::new(RwLock::new(RunSnapshot {
            run_id: id.clone(),
            title: mandate.title.clone(),
            status: RunStatus::Running,
            iteration: 0,
            max_iterations: mandate.max_iterations,
            consensus: 0.0,
            consensus_history: Vec::new(),
            population: population.snapshot(),
            lineage_stats: lineage.stats(),
            family_tree: lineage.family_tree(),
            ideas: 0,
            simulations: 0,
            critiques: 0,
            agents_spawned: 0,
            started,
            termination: None,
        }));

        let handle = Arc::new(RunHandle {
            id: id.clone(),
            bus: bus.clone(),
            cancel: cancel_handle,
            commands: command_tx,
            snapshot: snapshot.clone(),
        });

        let coordinator = SwarmCoordinator::new().with_phase_deadline(config.phase_deadline);
        let run = EvolutionRun {
            id,
            mandate,
            config,
            oracle,
            population,
            lineage,
            coordinator,
            bus,
            cancel: cancel_signal,
            commands: command_rx,
            snapshot,
            rng: StdRng::from_os_rng(),
            iteration: 0,
            history: Vec::new(),
            ideas: Vec::new(),
            simulations: Vec::new(),
            critiques: Vec::new(),
            syntheses: Vec::new(),
            fitness: HashMap::new(),
            agents_spawned: 0,
            consecutive_failed_phases: 0,
            fatal: None,
            started,
        };

        tokio::spawn(run.drive());
        Ok(handle)
    }

    async fn drive(mut self) {
        log::info!(
            "run {} started: '{}' ({} iterations, {} agents max)",
            self.id,
            self.mandate.title,
            self.mandate.max_iterations,
            self.mandate.max_agents
        );
        self.bus.publish(EventKind::RunStarted {
            run_id: self.id.clone(),
            title: self.mandate.title.clone(),
        });

        let outcome = self.iterate().await;

        let stats = self.stats();
        match outcome {
            Outcome::Completed(reason) => {
                log::info!(
                    "run {} completed: {} after {} iteration(s), consensus {:.2}",
                    self.id,
                    reason.as_str(),
                    stats.iterations,
                    stats.final_consensus
                );
                self.write_snapshot(RunStatus::Completed, Some(reason));
                self.bus.publish(EventKind::RunCompleted { reason, stats });
            }
            Outcome::Failed(error) => {
                log::error!("run {} failed: {}", self.id, error);
                self.write_snapshot(RunStatus::Failed, Some(TerminationReason::Failed));
                self.bus.publish(EventKind::RunFailed { error });
            }
        }

        self.bus.shutdown(crate::evoforge::bus::SHUTDOWN_DRAIN).await;
    }

    async fn iterate(&mut self) -> Outcome {
        for iteration in 1..=self.mandate.max_iterations {
            self.iteration = iteration;
            self.fitness.clear();
            self.drain_commands();
            if let Some(message) = self.fatal.take() {
                return Outcome::Failed(message);
            }

            if self.cancel.is_cancelled() {
                return Outcome::Completed(TerminationReason::Cancelled);
            }

            self.bus.publish(EventKind::IterationStarted { iteration });
            log::info!(
                "run {} iteration {}/{}, population {}",
                self.id,
                iteration,
                self.mandate.max_iterations,
                self.population.len()
            );

            // ── Ideation ────────────────────────────────────────────
            let ideas = match self.run_phase_ideation().await {
                PhaseStep::Done(ideas) => ideas,
                PhaseStep::SkipIteration => continue,
                PhaseStep::Terminate(outcome) => return outcome,
            };
            for idea in &ideas {
                // ideators are scored by the novelty of what they produce
                let (agent_id, novelty) = (idea.agent_id.clone(), idea.novelty);
                self.record_fitness_for(&agent_id, novelty);
            }
            if ideas.is_empty() {
                // Succeeded workers, empty result: not a phase failure, but
                // the iteration cannot proceed without ideas.
                self.bus.publish(EventKind::Warning {
                    message: format!("iteration {}: no ideas produced, skipping", iteration),
                });
                continue;
            }

            // ── Simulation ──────────────────────────────────────────
            let simulations = match self.run_phase_simulation(&ideas).await {
                PhaseStep::Done(simulations) => simulations,
                PhaseStep::SkipIteration => continue,
                PhaseStep::Terminate(outcome) => return outcome,
            };
            for sim in &simulations {
                let (agent_id, viability) = (sim.agent_id.clone(), sim.viability);
                self.record_fitness_for(&agent_id, viability);
            }

            // ── Critique ────────────────────────────────────────────
            let critiques = match self.run_phase_critique(&ideas).await {
                PhaseStep::Done(critiques) => critiques,
                PhaseStep::SkipIteration => continue,
                PhaseStep::Terminate(outcome) => return outcome,
            };
            for critique in &critiques {
                let (agent_id, confidence) = (critique.agent_id.clone(), critique.confidence);
                self.record_fitness_for(&agent_id, confidence);
            }

            // ── Synthesis ───────────────────────────────────────────
            let synthesis = match self
                .run_phase_synthesis(&ideas, &simulations, &critiques)
                .await
            {
                PhaseStep::Done(synthesis) => synthesis,
                PhaseStep::SkipIteration => continue,
                PhaseStep::Terminate(outcome) => return outcome,
            };

            self.ideas.extend(ideas);
            self.simulations.extend(simulations);
            self.critiques.extend(critiques);

            let consensus = synthesis.consensus;
            self.bus
                .publish(EventKind::ConsensusUpdate { value: consensus });
            self.history.push(consensus);
            self.record_fitness_for(&synthesis.agent_id, consensus);

            let ready_to_spawn = synthesis.ready_to_spawn;
            let recommendation = synthesis.spawn_recommendation.clone();
            self.syntheses.push(synthesis);
            self.write_snapshot(RunStatus::Running, None);

            if stable_convergence(&self.history, self.config.stability_epsilon) {
                return Outcome::Completed(TerminationReason::Convergence);
            }
            if consensus >= self.config.breakthrough_threshold {
                return Outcome::Completed(TerminationReason::Breakthrough);
            }

            if ready_to_spawn {
                if let Some(recommendation) = recommendation {
                    self.spawn_specialists(&recommendation);
                    if let Some(message) = self.fatal.take() {
                        return Outcome::Failed(message);
                    }
                }
            }

            if self.population.len() >= self.mandate.max_agents {
                return Outcome::Completed(TerminationReason::AgentCap);
            }

            self.bus.publish(EventKind::IterationCompleted { iteration });
        }

        Outcome::Completed(TerminationReason::MaxIterations)
    }

    // ── Phases ──────────────────────────────────────────────────────────

    async fn run_phase_ideation(&mut self) -> PhaseStep<Vec<Idea>> {
        self.bus.publish(EventKind::PhaseStarted {
            phase: Phase::Ideation,
        });
        let workers = self.population.with_role(AgentRole::Ideator);
        let result = self
            .coordinator
            .ideate(
                workers,
                &self.mandate,
                self.config.ideas_per_agent,
                &self.cancel,
            )
            .await;
        self.absorb_phase(Phase::Ideation, result, |report| report.items)
    }

    async fn run_phase_simulation(&mut self, ideas: &[Idea]) -> PhaseStep<Vec<Simulation>> {
        self.bus.publish(EventKind::PhaseStarted {
            phase: Phase::Simulation,
        });
        let workers = self.population.with_role(AgentRole::Simulator);
        let result = self.coordinator.simulate(workers, ideas, &self.cancel).await;
        self.absorb_phase(Phase::Simulation, result, |report| report.items)
    }

    async fn run_phase_critique(&mut self, ideas: &[Idea]) -> PhaseStep<Vec<Critique>> {
        self.bus.publish(EventKind::PhaseStarted {
            phase: Phase::Critique,
        });
        let workers = self.population.with_role(AgentRole::Critic);
        let result = self.coordinator.critique(workers, ideas, &self.cancel).await;
        self.absorb_phase(Phase::Critique, result, |report| report.items)
    }

    async fn run_phase_synthesis(
        &mut self,
        ideas: &[Idea],
        simulations: &[Simulation],
        critiques: &[Critique],
    ) -> PhaseStep<Synthesis> {
        self.bus.publish(EventKind::PhaseStarted {
            phase: Phase::Synthesis,
        });
        let synthesizer = match self.population.first_with_role(AgentRole::Synthesizer) {
            Some(agent) => agent.clone(),
            None => {
                return PhaseStep::Terminate(Outcome::Failed(String::from(
                    "population has no synthesizer",
                )));
            }
        };
        let result = self
            .coordinator
            .synthesize(&synthesizer, ideas, simulations, critiques, &self.cancel)
            .await;
        self.absorb_phase(Phase::Synthesis, result, |mut report| {
            report
                .items
                .pop()
                .unwrap_or_else(|| Synthesis::empty(synthesizer.id()))
        })
    }

    /// Shared phase epilogue: publish warnings, translate dispositions and
    /// failures into control flow, track the consecutive-failure escalation.
    fn absorb_phase<T, R, F>(
        &mut self,
        phase: Phase,
        result: Result<PhaseReport<T>, PhaseError>,
        finish: F,
    ) -> PhaseStep<R>
    where
        F: FnOnce(PhaseReport<T>) -> R,
    {
        match result {
            Ok(report) => {
                for warning in &report.warnings {
                    self.bus.publish(EventKind::Warning {
                        message: warning.clone(),
                    });
                }
                match report.disposition {
                    PhaseDisposition::Cancelled => {
                        PhaseStep::Terminate(Outcome::Completed(TerminationReason::Cancelled))
                    }
                    PhaseDisposition::DeadlineExpired => self.phase_failed(
                        phase,
                        format!("{} phase deadline expired", phase.as_str()),
                    ),
                    PhaseDisposition::Complete => {
                        self.consecutive_failed_phases = 0;
                        let count = report.items.len();
                        let step = PhaseStep::Done(finish(report));
                        self.bus.publish(EventKind::PhaseDone { phase, count });
                        step
                    }
                }
            }
            Err(err @ PhaseError::NoWorkers(_)) => {
                // The founding population covers every role; losing one is a
                // programmer error, not an oracle hiccup.
                PhaseStep::Terminate(Outcome::Failed(err.to_string()))
            }
            Err(err @ PhaseError::AllWorkersFailed(_)) => {
                self.phase_failed(phase, err.to_string())
            }
        }
    }

    fn phase_failed<R>(&mut self, phase: Phase, message: String) -> PhaseStep<R> {
        self.consecutive_failed_phases += 1;
        log::warn!(
            "run {}: {} phase failed: {} ({} consecutive)",
            self.id,
            phase.as_str(),
            message,
            self.consecutive_failed_phases
        );
        self.bus.publish(EventKind::Warning {
            message: message.clone(),
        });
        if self.consecutive_failed_phases >= 2 {
            return PhaseStep::Terminate(Outcome::Failed(format!(
                "two consecutive failed phases, last: {}",
                message
            )));
        }
        PhaseStep::SkipIteration
    }

    // ── Genesis: specialists and hybrids ────────────────────────────────

    /// Spawn de-novo specialists for a synthesis recommendation, at most
    /// [`OrchestratorConfig::max_spawns_per_iteration`] of them.
    fn spawn_specialists(&mut self, recommendation: &SpawnRecommendation) {
        let base = recommendation
            .traits
            .apply_to(self.population.average_traits());

        for capability in recommendation
            .capabilities
            .iter()
            .take(self.config.max_spawns_per_iteration)
        {
            if !self.population.has_room() {
                self.bus.publish(EventKind::Warning {
                    message: format!(
                        "spawn of {} specialist skipped: agent cap of {} reached",
                        capability.as_str(),
                        self.mandate.max_agents
                    ),
                });
                return;
            }

            let mut traits = base.adjusted(capability.dominant_trait(), 0.20);
            if *capability == Capability::Critique {
                traits = traits.adjusted(TraitKind::Creativity, -0.10);
            }

            let role = AgentRole::for_capability(*capability);
            let dna = AgentDna::root(
                format!(
                    "{} Specialist {}",
                    capitalize(capability.as_str()),
                    self.population.len() + 1
                ),
                traits,
                vec![*capability],
                self.config.models.for_role(role),
                specialist_instructions(*capability),
            );
            self.commit_spawn(dna, role, Some(recommendation.reasoning.clone()));
        }
    }

    /// Breed two live parents into a hybrid, guarded by the genetic
    /// distance floor and the agent cap.
    fn breed_hybrid(&mut self, parent1: Option<String>, parent2: Option<String>) {
        if !self.population.has_room() {
            self.bus.publish(EventKind::Warning {
                message: format!(
                    "breeding skipped: agent cap of {} reached",
                    self.mandate.max_agents
                ),
            });
            return;
        }

        let (p1, p2) = match self.resolve_parents(parent1, parent2) {
            Ok(pair) => pair,
            Err(message) => {
                self.bus.publish(EventKind::Warning { message });
                return;
            }
        };

        let distance = genetic_distance(&p1.dna.traits, &p2.dna.traits);
        if distance <= self.config.min_breeding_distance {
            self.bus.publish(EventKind::Warning {
                message: format!(
                    "breeding skipped: parents {} and {} are too similar (distance {:.2})",
                    p1.name(),
                    p2.name(),
                    distance
                ),
            });
            return;
        }

        let child = breed(&p1.dna, &p2.dna, self.config.mutation_rate, &mut self.rng);
        let role = p1.role();
        log::info!(
            "run {}: bred hybrid '{}' from {} and {} (distance {:.2})",
            self.id,
            child.name,
            p1.name(),
            p2.name(),
            distance
        );
        self.commit_spawn(child, role, None);
    }

    /// Resolve explicit or auto-selected breeding parents.
    fn resolve_parents(
        &mut self,
        parent1: Option<String>,
        parent2: Option<String>,
    ) -> Result<(EvoAgent, EvoAgent), String> {
        let first = match parent1 {
            Some(id) => self
                .population
                .by_id(&id)
                .cloned()
                .ok_or_else(|| format!("breeding skipped: unknown agent '{}'", id))?,
            None => {
                // fitness tournament over the live set
                let agents: Vec<EvoAgent> = self.population.iter().cloned().collect();
                let fitness: Vec<f64> =
                    agents.iter().map(|a| self.fitness_of(a.id())).collect();
                let idx = tournament_select(&fitness, 3, &mut self.rng)
                    .ok_or_else(|| String::from("breeding skipped: population is empty"))?;
                agents[idx].clone()
            }
        };
        let second = match parent2 {
            Some(id) => self
                .population
                .by_id(&id)
                .cloned()
                .ok_or_else(|| format!("breeding skipped: unknown agent '{}'", id))?,
            None => {
                // the most genetically distant partner
                self.population
                    .iter()
                    .filter(|a| a.id() != first.id())
                    .max_by(|a, b| {
                        let da = genetic_distance(&first.dna.traits, &a.dna.traits);
                        let db = genetic_distance(&first.dna.traits, &b.dna.traits);
                        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .cloned()
                    .ok_or_else(|| String::from("breeding skipped: need at least two agents"))?
            }
        };
        if first.id() == second.id() {
            return Err(String::from("breeding skipped: parents must differ"));
        }
        Ok((first, second))
    }

    /// Commit a spawn atomically with respect to readers:
    /// population → lineage → memory → snapshot → event.
    fn commit_spawn(&mut self, dna: AgentDna, role: AgentRole, insight: Option<String>) {
        let agent_id = dna.id.clone();
        let generation = dna.generation;
        let agent = EvoAgent::new(dna.clone(), role, self.oracle.clone());

        match self.population.add(agent) {
            Ok(_) => {}
            Err(PopulationError::CapacityExceeded { cap }) => {
                self.bus.publish(EventKind::Warning {
                    message: format!("spawn skipped: agent cap of {} reached", cap),
                });
                return;
            }
            Err(err) => {
                self.bus.publish(EventKind::Warning {
                    message: format!("spawn skipped: {}", err),
                });
                return;
            }
        }
        if let Err(err) = self.lineage.register(&dna) {
            // Unknown-parent here means the spawn-commit discipline was
            // broken; escalate to run failure at the next safe point.
            log::error!("run {}: lineage registration failed: {}", self.id, err);
            self.fatal = Some(format!("lineage registration failed: {}", err));
            return;
        }
        if let Some(insight) = insight {
            if !insight.is_empty() {
                self.lineage.with_memory(&agent_id, |memory| {
                    memory.insights.push(insight);
                });
            }
        }
        self.agents_spawned += 1;
        self.write_snapshot(RunStatus::Running, None);
        self.bus.publish(EventKind::AgentSpawned {
            agent_id,
            role,
            generation,
        });
    }

    // ── Bookkeeping ─────────────────────────────────────────────────────

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                RunCommand::Breed { parent1, parent2 } => self.breed_hybrid(parent1, parent2),
            }
        }
    }

    fn record_fitness_for(&mut self, agent_id: &str, score: f64) {
        self.fitness
            .entry(agent_id.to_string())
            .or_insert_with(Vec::new)
            .push(score);
    }

    /// Mean of the agent's scores this iteration; neutral 0.5 without any.
    fn fitness_of(&self, agent_id: &str) -> f64 {
        match self.fitness.get(agent_id) {
            Some(scores) if !scores.is_empty() => {
                scores.iter().sum::<f64>() / scores.len() as f64
            }
            _ => 0.5,
        }
    }

    fn stats(&self) -> RunStats {
        RunStats {
            iterations: self.iteration,
            ideas: self.ideas.len(),
            simulations: self.simulations.len(),
            critiques: self.critiques.len(),
            syntheses: self.syntheses.len(),
            agents_spawned: self.agents_spawned,
            population_size: self.population.len(),
            final_consensus: self.history.last().copied().unwrap_or(0.0),
            elapsed_ms: (Utc::now() - self.started).num_milliseconds().max(0) as u64,
        }
    }

    fn write_snapshot(&self, status: RunStatus, termination: Option<TerminationReason>) {
        let mut snapshot = self.snapshot.write().expect("run snapshot poisoned");
        snapshot.status = status;
        snapshot.iteration = self.iteration;
        snapshot.consensus = self.history.last().copied().unwrap_or(0.0);
        snapshot.consensus_history = self.history.clone();
        snapshot.population = self.population.snapshot();
        snapshot.lineage_stats = self.lineage.stats();
        snapshot.family_tree = self.lineage.family_tree();
        snapshot.ideas = self.ideas.len();
        snapshot.simulations = self.simulations.len();
        snapshot.critiques = self.critiques.len();
        snapshot.agents_spawned = self.agents_spawned;
        if termination.is_some() {
            snapshot.termination = termination;
        }
    }
}

enum PhaseStep<T> {
    Done(T),
    SkipIteration,
    Terminate(Outcome),
}

/// The stability predicate over the rolling consensus history: at least
/// three samples, standard deviation of the last three under `epsilon`, and
/// the newest sample not improving on the oldest of the three.
pub fn stable_convergence(history: &[f64], epsilon: f64) -> bool {
    if history.len() < 3 {
        return false;
    }
    let last3 = &history[history.len() - 3..];
    let mean = (last3[0] + last3[1] + last3[2]) / 3.0;
    let variance = last3
        .iter()
        .map(|v| (v - mean) * (v - mean))
        .sum::<f64>()
        / 3.0;
    variance.sqrt() < epsilon && last3[2] <= last3[0]
}

fn founding_dna(role: AgentRole, models: &RoleModels) -> AgentDna {
    let (name, instructions) = match role {
        AgentRole::Ideator => (
            "Prime Ideator",
            "You generate bold, distinct ideas for the problem at hand. Favor \
             unconventional approaches over safe ones and never repeat yourself.",
        ),
        AgentRole::Simulator => (
            "Prime Simulator",
            "You mentally execute proposals and report what would actually \
             happen: viability, measurable outcomes, risks, and course corrections.",
        ),
        AgentRole::Critic => (
            "Prime Critic",
            "You stress-test proposals adversarially. Surface flaws, hidden \
             assumptions, and cognitive biases before they become expensive.",
        ),
        AgentRole::Synthesizer => (
            "Prime Synthesizer",
            "You weigh every idea, simulation, and critique, then fold them into \
             a single coherent direction and an honest consensus measure.",
        ),
    };
    AgentDna::root(
        name,
        TraitVector::default(),
        vec![role.capability()],
        models.for_role(role),
        instructions,
    )
}

fn specialist_instructions(capability: Capability) -> String {
    let focus = match capability {
        Capability::Ideation => "generating unconventional ideas the current population has missed",
        Capability::Simulation => "rigorously projecting how proposals behave under real conditions",
        Capability::Critique => "finding the flaws and biases everyone else is glossing over",
        Capability::Synthesis => "reconciling competing approaches into one coherent direction",
        Capability::Optimization => "tightening promising approaches until they are efficient",
        Capability::Research => "digging up prior art and evidence the swarm lacks",
    };
    format!(
        "You were spawned mid-run to strengthen the swarm. Specialize in {}.",
        focus
    )
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
