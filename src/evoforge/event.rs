//! Typed events emitted by a run.
//!
//! The orchestrator is the sole source of truth for run progress and
//! publishes these events directly; observers never infer progress from log
//! lines.  Every event carries a monotonically increasing sequence number and
//! a wall-clock timestamp, assigned by the [`EventBus`](crate::evoforge::bus::EventBus)
//! at publish time; the sequence number linearizes ordering for reconnecting
//! clients.
//!
//! On the wire (SSE `event:` field, WebSocket `event` property) kinds appear
//! in lower-snake-case: `run_started`, `phase_done`, `consensus_update`, and
//! so on.

use crate::evoforge::population::AgentRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the four pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ideation,
    Simulation,
    Critique,
    Synthesis,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Ideation => "ideation",
            Phase::Simulation => "simulation",
            Phase::Critique => "critique",
            Phase::Synthesis => "synthesis",
        }
    }
}

/// Why a run reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The iteration budget was spent.
    MaxIterations,
    /// Consensus met or exceeded the breakthrough threshold.
    Breakthrough,
    /// Consensus stabilized without improving.
    Convergence,
    /// The population reached the agent cap.
    AgentCap,
    /// Unrecoverable error.
    Failed,
    /// The caller cancelled the run.
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::MaxIterations => "max_iterations",
            TerminationReason::Breakthrough => "breakthrough",
            TerminationReason::Convergence => "convergence",
            TerminationReason::AgentCap => "agent_cap",
            TerminationReason::Failed => "failed",
            TerminationReason::Cancelled => "cancelled",
        }
    }
}

/// Final accounting attached to `run_completed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub iterations: u32,
    pub ideas: usize,
    pub simulations: usize,
    pub critiques: usize,
    pub syntheses: usize,
    pub agents_spawned: usize,
    pub population_size: usize,
    pub final_consensus: f64,
    pub elapsed_ms: u64,
}

/// The tagged union of everything a run can announce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// Synthesized per-connection by the control plane, never published on a
    /// run's bus.
    Connected,
    RunStarted {
        run_id: String,
        title: String,
    },
    IterationStarted {
        iteration: u32,
    },
    PhaseStarted {
        phase: Phase,
    },
    PhaseDone {
        phase: Phase,
        count: usize,
    },
    ConsensusUpdate {
        value: f64,
    },
    AgentSpawned {
        agent_id: String,
        role: AgentRole,
        generation: u32,
    },
    IterationCompleted {
        iteration: u32,
    },
    Warning {
        message: String,
    },
    RunCompleted {
        reason: TerminationReason,
        stats: RunStats,
    },
    RunFailed {
        error: String,
    },
}

impl EventKind {
    /// The lower-snake-case kind used as the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::RunStarted { .. } => "run_started",
            EventKind::IterationStarted { .. } => "iteration_started",
            EventKind::PhaseStarted { .. } => "phase_started",
            EventKind::PhaseDone { .. } => "phase_done",
            EventKind::ConsensusUpdate { .. } => "consensus_update",
            EventKind::AgentSpawned { .. } => "agent_spawned",
            EventKind::IterationCompleted { .. } => "iteration_completed",
            EventKind::Warning { .. } => "warning",
            EventKind::RunCompleted { .. } => "run_completed",
            EventKind::RunFailed { .. } => "run_failed",
        }
    }
}

/// A published event: kind plus the bus-assigned envelope fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}
