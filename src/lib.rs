// src/lib.rs

// Import the top-level `evoforge` module.
pub mod evoforge;

// Re-export the component modules at the crate root so callers write
// `evoforge::dna::breed` rather than `evoforge::evoforge::dna::breed`.
pub use crate::evoforge::{
    artifacts, bus, clients, config, coordinator, dna, event, lineage, oracle, orchestrator,
    population, server,
};

// Re-exporting key items for easier external access.
pub use crate::evoforge::config::EvoForgeConfig;
pub use crate::evoforge::oracle::OracleClient;
pub use crate::evoforge::orchestrator::{EvolutionRun, OrchestratorConfig, RunHandle};
pub use crate::evoforge::population::{AgentRole, EvoAgent, Population};
