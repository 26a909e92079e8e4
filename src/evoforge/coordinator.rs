//! Phase-level fan-out/fan-in over the agent population.
//!
//! One call drives one phase.  Workers are spawned as tokio tasks and their
//! results are collected as they complete, so a deadline or cancellation can
//! still report the inputs that *were* processed.  Within a phase there is no
//! cross-worker ordering guarantee; downstream consumers treat the aggregated
//! lists as sets.
//!
//! Concurrency contract per phase:
//!
//! - **Ideation**: every ideator runs in parallel, each producing `k` ideas.
//! - **Simulation**: ideas are split into `ceil(|ideas| / |simulators|)`
//!   contiguous chunks; each simulator walks its chunk sequentially while the
//!   chunks run in parallel.
//! - **Critique**: the same partitioning over critics.
//! - **Synthesis**: a single synthesizer folds the full tri-list.

use crate::evoforge::artifacts::{Critique, Idea, Mandate, Simulation, Synthesis};
use crate::evoforge::event::Phase;
use crate::evoforge::oracle::CancelSignal;
use crate::evoforge::population::{CritiqueTarget, EvoAgent};
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default wall-clock budget for a single phase.
pub const DEFAULT_PHASE_DEADLINE: Duration = Duration::from_secs(300);

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseDisposition {
    /// All workers finished.
    Complete,
    /// The caller's cancellation signal fired mid-phase.
    Cancelled,
    /// The phase deadline expired before all workers finished.
    DeadlineExpired,
}

/// Aggregated outcome of one phase.
///
/// `processed` names the inputs that were actually handled (agent ids for
/// ideation, artifact ids for the chunked phases), which is how partial
/// progress is reported after cancellation.
#[derive(Debug, Clone)]
pub struct PhaseReport<T> {
    pub phase: Phase,
    pub items: Vec<T>,
    pub processed: Vec<String>,
    pub warnings: Vec<String>,
    pub workers: usize,
    pub failed_workers: usize,
    pub disposition: PhaseDisposition,
}

impl<T> PhaseReport<T> {
    fn new(phase: Phase, workers: usize) -> Self {
        Self {
            phase,
            items: Vec::new(),
            processed: Vec::new(),
            warnings: Vec::new(),
            workers,
            failed_workers: 0,
            disposition: PhaseDisposition::Complete,
        }
    }
}

/// Errors a phase can fail with outright.
#[derive(Debug, Clone)]
pub enum PhaseError {
    /// The population holds no agent for the phase's role.
    NoWorkers(Phase),
    /// Every worker failed; per the propagation policy a phase fails only
    /// when nothing succeeded.
    AllWorkersFailed(Phase),
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseError::NoWorkers(phase) => {
                write!(f, "no workers available for {} phase", phase.as_str())
            }
            PhaseError::AllWorkersFailed(phase) => {
                write!(f, "every worker failed in {} phase", phase.as_str())
            }
        }
    }
}

impl Error for PhaseError {}

/// Per-worker result flowing back through the collection channel.
struct WorkerOutcome<T> {
    items: Vec<T>,
    processed: Vec<String>,
    warnings: Vec<String>,
    failed: bool,
}

/// Drives one phase per call over caller-supplied agent clones.
#[derive(Debug, Clone)]
pub struct SwarmCoordinator {
    phase_deadline: Duration,
}

impl Default for SwarmCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SwarmCoordinator {
    pub fn new() -> Self {
        Self {
            phase_deadline: DEFAULT_PHASE_DEADLINE,
        }
    }

    /// Override the per-phase deadline (builder pattern).
    pub fn with_phase_deadline(mut self, deadline: Duration) -> Self {
        self.phase_deadline = deadline;
        self
    }

    /// Run the ideation phase: all ideators in parallel, `ideas_per_agent`
    /// ideas each, results concatenated in completion order.
    pub async fn ideate(
        &self,
        ideators: Vec<EvoAgent>,
        mandate: &Mandate,
        ideas_per_agent: usize,
        cancel: &CancelSignal,
    ) -> Result<PhaseReport<Idea>, PhaseError> {
        if ideators.is_empty() {
            return Err(PhaseError::NoWorkers(Phase::Ideation));
        }
        let workers = ideators.len();
        let (tx, rx) = mpsc::channel::<WorkerOutcome<Idea>>(workers);

        for agent in ideators {
            let tx = tx.clone();
            let mandate = mandate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let run = agent.run_ideation(&mandate, ideas_per_agent, &cancel).await;
                let outcome = WorkerOutcome {
                    items: run.output,
                    processed: vec![agent.id().to_string()],
                    warnings: run.warnings,
                    failed: run.failed,
                };
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        self.collect(Phase::Ideation, workers, rx, cancel).await
    }

    /// Run the simulation phase: ideas chunked across simulators.
    pub async fn simulate(
        &self,
        simulators: Vec<EvoAgent>,
        ideas: &[Idea],
        cancel: &CancelSignal,
    ) -> Result<PhaseReport<Simulation>, PhaseError> {
        if simulators.is_empty() {
            return Err(PhaseError::NoWorkers(Phase::Simulation));
        }
        if ideas.is_empty() {
            return Ok(PhaseReport::new(Phase::Simulation, 0));
        }
        let chunks = partition(ideas, simulators.len());
        let workers = chunks.len();
        let (tx, rx) = mpsc::channel::<WorkerOutcome<Simulation>>(workers);

        for (agent, chunk) in simulators.into_iter().zip(chunks) {
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut outcome = WorkerOutcome {
                    items: Vec::with_capacity(chunk.len()),
                    processed: Vec::with_capacity(chunk.len()),
                    warnings: Vec::new(),
                    failed: true,
                };
                for idea in &chunk {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let run = agent.run_simulation(idea, &cancel).await;
                    outcome.processed.push(idea.id.clone());
                    outcome.warnings.extend(run.warnings);
                    if !run.failed {
                        outcome.failed = false;
                    }
                    outcome.items.push(run.output);
                }
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        self.collect(Phase::Simulation, workers, rx, cancel).await
    }

    /// Run the critique phase: ideas chunked across critics, identical
    /// partitioning to [`simulate`](SwarmCoordinator::simulate).
    pub async fn critique(
        &self,
        critics: Vec<EvoAgent>,
        ideas: &[Idea],
        cancel: &CancelSignal,
    ) -> Result<PhaseReport<Critique>, PhaseError> {
        if critics.is_empty() {
            return Err(PhaseError::NoWorkers(Phase::Critique));
        }
        if ideas.is_empty() {
            return Ok(PhaseReport::new(Phase::Critique, 0));
        }
        let chunks = partition(ideas, critics.len());
        let workers = chunks.len();
        let (tx, rx) = mpsc::channel::<WorkerOutcome<Critique>>(workers);

        for (agent, chunk) in critics.into_iter().zip(chunks) {
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut outcome = WorkerOutcome {
                    items: Vec::with_capacity(chunk.len()),
                    processed: Vec::with_capacity(chunk.len()),
                    warnings: Vec::new(),
                    failed: true,
                };
                for idea in &chunk {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let run = agent.run_critique(CritiqueTarget::Idea(idea), &cancel).await;
                    outcome.processed.push(idea.id.clone());
                    outcome.warnings.extend(run.warnings);
                    if !run.failed {
                        outcome.failed = false;
                    }
                    outcome.items.push(run.output);
                }
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        self.collect(Phase::Critique, workers, rx, cancel).await
    }

    /// Run the synthesis phase: one synthesizer over the full tri-list.
    pub async fn synthesize(
        &self,
        synthesizer: &EvoAgent,
        ideas: &[Idea],
        simulations: &[Simulation],
        critiques: &[Critique],
        cancel: &CancelSignal,
    ) -> Result<PhaseReport<Synthesis>, PhaseError> {
        let mut report = PhaseReport::new(Phase::Synthesis, 1);
        let deadline = tokio::time::sleep(self.phase_deadline);
        tokio::pin!(deadline);
        let mut cancel_wait = cancel.clone();

        tokio::select! {
            run = synthesizer.run_synthesis(ideas, simulations, critiques, cancel) => {
                report.processed = ideas.iter().map(|i| i.id.clone()).collect();
                report.warnings = run.warnings;
                if run.failed {
                    report.failed_workers = 1;
                }
                report.items.push(run.output);
            }
            _ = &mut deadline => {
                report.disposition = PhaseDisposition::DeadlineExpired;
            }
            _ = cancel_wait.cancelled() => {
                report.disposition = PhaseDisposition::Cancelled;
            }
        }

        if report.disposition == PhaseDisposition::Complete && report.failed_workers == 1 {
            return Err(PhaseError::AllWorkersFailed(Phase::Synthesis));
        }
        Ok(report)
    }

    /// Join loop shared by the fan-out phases: gather worker outcomes until
    /// all arrive, the deadline passes, or the cancel signal fires.
    async fn collect<T>(
        &self,
        phase: Phase,
        workers: usize,
        mut rx: mpsc::Receiver<WorkerOutcome<T>>,
        cancel: &CancelSignal,
    ) -> Result<PhaseReport<T>, PhaseError> {
        let mut report = PhaseReport::new(phase, workers);
        let deadline = tokio::time::sleep(self.phase_deadline);
        tokio::pin!(deadline);
        let mut cancel_wait = cancel.clone();

        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(outcome) => {
                        report.items.extend(outcome.items);
                        report.processed.extend(outcome.processed);
                        report.warnings.extend(outcome.warnings);
                        if outcome.failed {
                            report.failed_workers += 1;
                        }
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    log::warn!("{} phase deadline expired", phase.as_str());
                    report.disposition = PhaseDisposition::DeadlineExpired;
                    break;
                }
                _ = cancel_wait.cancelled() => {
                    log::info!("{} phase cancelled", phase.as_str());
                    report.disposition = PhaseDisposition::Cancelled;
                    break;
                }
            }
        }

        if report.disposition == PhaseDisposition::Complete
            && report.workers > 0
            && report.failed_workers == report.workers
        {
            return Err(PhaseError::AllWorkersFailed(phase));
        }
        Ok(report)
    }
}

/// Split `items` into `ceil(len / workers)`-sized contiguous chunks, one per
/// worker, dropping surplus workers.
fn partition<T: Clone>(items: &[T], workers: usize) -> Vec<Vec<T>> {
    let workers = workers.max(1);
    let chunk_size = (items.len() + workers - 1) / workers;
    if chunk_size == 0 {
        return Vec::new();
    }
    items.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_shapes() {
        let items: Vec<u32> = (0..7).collect();
        let chunks = partition(&items, 3);
        // ceil(7/3) = 3 per chunk
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], vec![0, 1, 2]);
        assert_eq!(chunks[2], vec![6]);

        // more workers than items: one item per chunk, surplus workers idle
        let chunks = partition(&items[..2], 5);
        assert_eq!(chunks.len(), 2);

        let empty: Vec<u32> = Vec::new();
        assert!(partition(&empty, 4).is_empty());
    }
}
