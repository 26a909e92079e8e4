use async_trait::async_trait;
use evoforge::artifacts::{Idea, Mandate};
use evoforge::coordinator::{PhaseDisposition, PhaseError, SwarmCoordinator};
use evoforge::dna::{AgentDna, TraitVector};
use evoforge::oracle::{cancel_pair, CancelSignal, OracleClient, OracleError, OracleErrorKind};
use evoforge::population::{AgentRole, EvoAgent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Oracle returning one fixed response, counting calls.
struct FixedOracle {
    response: String,
    calls: AtomicUsize,
}

impl FixedOracle {
    fn new(response: &str) -> Arc<Self> {
        Arc::new(Self {
            response: response.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl OracleClient for FixedOracle {
    async fn ask(&self, _model: &str, _prompt: &str) -> Result<String, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

/// Oracle that always fails fatally (no retry delay in tests).
struct BrokenOracle;

#[async_trait]
impl OracleClient for BrokenOracle {
    async fn ask(&self, _model: &str, _prompt: &str) -> Result<String, OracleError> {
        Err(OracleError::new(OracleErrorKind::Auth, "revoked key"))
    }
}

/// Oracle that never answers; used to exercise cancellation.
struct StalledOracle;

#[async_trait]
impl OracleClient for StalledOracle {
    async fn ask(&self, _model: &str, _prompt: &str) -> Result<String, OracleError> {
        futures_util::future::pending::<()>().await;
        unreachable!()
    }
}

fn agent(role: AgentRole, name: &str, oracle: Arc<dyn OracleClient>) -> EvoAgent {
    let dna = AgentDna::root(
        name,
        TraitVector::default(),
        vec![role.capability()],
        "mock-model",
        "Do the work.",
    );
    EvoAgent::new(dna, role, oracle)
}

fn ideas(n: usize) -> Vec<Idea> {
    (0..n)
        .map(|i| Idea::new("origin", format!("idea {}", i), "d", "a", 0.5))
        .collect()
}

const TWO_IDEAS: &str = "[{\"title\": \"A\", \"description\": \"d\", \"approach\": \"x\", \"novelty\": 0.4}, \
                          {\"title\": \"B\", \"description\": \"d\", \"approach\": \"y\", \"novelty\": 0.6}]";
const ONE_SIM: &str = "{\"viability\": 0.7, \"metrics\": {}, \"risks\": [\"r\"], \"recommendations\": [\"g\"]}";

#[tokio::test]
async fn ideation_fans_out_across_all_ideators() {
    let oracle = FixedOracle::new(TWO_IDEAS);
    let ideators: Vec<EvoAgent> = (0..3)
        .map(|i| {
            agent(
                AgentRole::Ideator,
                &format!("I{}", i),
                oracle.clone() as Arc<dyn OracleClient>,
            )
        })
        .collect();

    let coordinator = SwarmCoordinator::new();
    let mandate = Mandate::new("T", "D");
    let report = coordinator
        .ideate(ideators, &mandate, 2, &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.disposition, PhaseDisposition::Complete);
    assert_eq!(report.items.len(), 6);
    assert_eq!(report.workers, 3);
    assert_eq!(report.failed_workers, 0);
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn simulation_chunks_cover_every_idea() {
    let oracle = FixedOracle::new(ONE_SIM);
    let simulators: Vec<EvoAgent> = (0..2)
        .map(|i| {
            agent(
                AgentRole::Simulator,
                &format!("S{}", i),
                oracle.clone() as Arc<dyn OracleClient>,
            )
        })
        .collect();

    let coordinator = SwarmCoordinator::new();
    let inputs = ideas(5);
    let report = coordinator
        .simulate(simulators, &inputs, &CancelSignal::never())
        .await
        .unwrap();

    // ceil(5/2) = 3: one worker takes 3 ideas, the other 2
    assert_eq!(report.workers, 2);
    assert_eq!(report.items.len(), 5);
    assert_eq!(report.processed.len(), 5);
    for idea in &inputs {
        assert!(report.processed.contains(&idea.id));
        assert!(report.items.iter().any(|s| s.idea_id == idea.id));
    }
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn one_failed_worker_does_not_fail_the_phase() {
    let healthy = FixedOracle::new(TWO_IDEAS);
    let ideators = vec![
        agent(
            AgentRole::Ideator,
            "healthy",
            healthy.clone() as Arc<dyn OracleClient>,
        ),
        agent(AgentRole::Ideator, "broken", Arc::new(BrokenOracle)),
    ];

    let coordinator = SwarmCoordinator::new();
    let mandate = Mandate::new("T", "D");
    let report = coordinator
        .ideate(ideators, &mandate, 2, &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.items.len(), 2);
    assert_eq!(report.failed_workers, 1);
    assert_eq!(report.warnings.len(), 1);
}

#[tokio::test]
async fn all_failed_workers_fail_the_phase() {
    let ideators = vec![
        agent(AgentRole::Ideator, "b1", Arc::new(BrokenOracle)),
        agent(AgentRole::Ideator, "b2", Arc::new(BrokenOracle)),
    ];
    let coordinator = SwarmCoordinator::new();
    let mandate = Mandate::new("T", "D");
    match coordinator
        .ideate(ideators, &mandate, 2, &CancelSignal::never())
        .await
    {
        Err(PhaseError::AllWorkersFailed(_)) => {}
        other => panic!("expected AllWorkersFailed, got {:?}", other.map(|r| r.items.len())),
    }
}

#[tokio::test]
async fn no_workers_is_an_error() {
    let coordinator = SwarmCoordinator::new();
    let mandate = Mandate::new("T", "D");
    match coordinator
        .ideate(Vec::new(), &mandate, 2, &CancelSignal::never())
        .await
    {
        Err(PhaseError::NoWorkers(_)) => {}
        other => panic!("expected NoWorkers, got {:?}", other.map(|r| r.items.len())),
    }
}

#[tokio::test]
async fn empty_idea_list_short_circuits_chunked_phases() {
    let oracle = FixedOracle::new(ONE_SIM);
    let simulators = vec![agent(
        AgentRole::Simulator,
        "S",
        oracle.clone() as Arc<dyn OracleClient>,
    )];
    let coordinator = SwarmCoordinator::new();
    let report = coordinator
        .simulate(simulators, &[], &CancelSignal::never())
        .await
        .unwrap();
    assert!(report.items.is_empty());
    assert_eq!(report.workers, 0);
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_reports_partial_progress() {
    // one stalled simulator alongside a healthy one
    let healthy = FixedOracle::new(ONE_SIM);
    let simulators = vec![
        agent(
            AgentRole::Simulator,
            "fast",
            healthy.clone() as Arc<dyn OracleClient>,
        ),
        agent(AgentRole::Simulator, "stuck", Arc::new(StalledOracle)),
    ];

    let coordinator = SwarmCoordinator::new();
    let inputs = ideas(4);
    let (handle, signal) = cancel_pair();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel();
    });

    let report = coordinator
        .simulate(simulators, &inputs, &signal)
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(report.disposition, PhaseDisposition::Cancelled);
    // the healthy worker finished its chunk of two before the signal fired;
    // the stalled worker's chunk is at most partially present
    assert!(report.processed.len() >= 2 && report.processed.len() < 4);
    assert_eq!(report.items.len(), report.processed.len());
}

#[tokio::test(start_paused = true)]
async fn deadline_expiry_is_reported() {
    let simulators = vec![agent(AgentRole::Simulator, "stuck", Arc::new(StalledOracle))];
    let coordinator = SwarmCoordinator::new().with_phase_deadline(Duration::from_millis(250));
    let inputs = ideas(1);
    let report = coordinator
        .simulate(simulators, &inputs, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(report.disposition, PhaseDisposition::DeadlineExpired);
    assert!(report.items.is_empty());
}