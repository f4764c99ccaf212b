//! Step abstraction, typed pipeline context and the chain executor.

pub mod chain;
pub mod context;
pub mod step;
pub mod tracked;

pub use chain::{ChainExecutor, UnsatisfiedRead, run_guarded, validate_chain};
pub use context::{ContextKey, PipelineContext, VideoMetadata};
pub use step::{Step, StepError, StepOutcome};
pub use tracked::TrackedStep;

use crate::store::{StepDefinition, StepPhase, WorkUnit};
use crate::workspace::Workspace;

/// Registry of the fixed step topology.
///
/// Schedulers only know step names; the factory turns a name into a runnable
/// step bound to a unit and its workspace.
pub trait PipelineFactory: Send + Sync {
    fn definitions(&self) -> &[StepDefinition];

    fn step(&self, name: &str, unit: &WorkUnit, workspace: &Workspace) -> Option<Box<dyn Step>>;

    fn definition(&self, name: &str) -> Option<StepDefinition> {
        self.definitions().iter().find(|d| d.name == name).copied()
    }

    /// Ingest steps in order.
    fn ingest_chain(&self, unit: &WorkUnit, workspace: &Workspace) -> Vec<Box<dyn Step>> {
        let mut defs: Vec<StepDefinition> = self
            .definitions()
            .iter()
            .filter(|d| d.phase == StepPhase::Ingest)
            .copied()
            .collect();
        defs.sort_by_key(|d| d.order);
        defs.iter()
            .filter_map(|d| self.step(d.name, unit, workspace))
            .collect()
    }
}
