//! Renumbering and merging of live sequences.
//!
//! A run is planned in memory per workspace ([`plan`]), written in one
//! transaction per workspace ([`apply`]), and recorded in a rollback
//! artifact ([`artifact`]) that [`rollback`] can replay.

pub mod apply;
pub mod artifact;
pub mod correspondence;
pub mod plan;
pub mod rollback;
pub mod runner;

pub use artifact::RollbackArtifact;
pub use correspondence::{Correspondence, Mapping, canonicalize};
pub use plan::{MigrationPlanFile, Planner, WorkspacePlan};
pub use rollback::RollbackReport;
pub use runner::{MigrationMode, MigrationRunner, MigrationScope, MigrationSummary, RunOutcome};
