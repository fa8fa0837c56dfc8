pub mod orchestrator;
pub mod scheduler;

pub use orchestrator::{CycleOutcome, FailureStage, Phase, RenewalOrchestrator};
pub use scheduler::RenewalScheduler;
