//! # Dripline Scheduler
//!
//! Follow-up sequence engine: fires timed, multi-channel steps for leads and
//! migrates live sequences without losing their place.
//!
//! ## Design Principles
//! - SQLite persistence, one file, WAL mode
//! - Batch jobs, not a service: a driver tick and on-demand migrations
//! - Bounded fan-out per tick and per workspace
//! - Pure planning: dry-run and apply share one code path
//!
//! ## Architecture
//! ```text
//! DueDriver (tokio interval)
//!   ├── due instances (cursor + budget) → LeadDirectory snapshot
//!   ├── lifecycle::advance → conditions → tasks (pending | queued)
//!   └── outbox flush → Dispatcher
//!                        ├── Log
//!                        └── Webhook (HTTP POST)
//!
//! MigrationRunner
//!   ├── plan file: [[canonical]] then [[merge]]
//!   ├── Planner (in memory) → WorkspacePlan
//!   ├── apply: one transaction per workspace
//!   └── RollbackArtifact (JSON) → rollback
//! ```

pub mod batch;
pub mod conditions;
pub mod dispatch;
pub mod engine;
pub mod leads;
pub mod lifecycle;
pub mod migration;
pub mod model;
pub mod persistence;
pub mod render;
pub mod schedule;
pub mod service;
pub mod store;

pub use batch::{BatchBudget, BatchSummary, ItemOutcome};
pub use dispatch::{Dispatcher, LogDispatcher, OutboundMessage, WebhookDispatcher};
pub use engine::{DueDriver, TickReport, spawn_driver};
pub use leads::{DbLeadDirectory, LeadDirectory, StaticLeadDirectory};
pub use migration::{MigrationMode, MigrationPlanFile, MigrationRunner, MigrationScope, RunOutcome};
pub use model::{
    Channel, Condition, Instance, InstanceStatus, LeadCapabilities, LeadSnapshot, PendingTask,
    SequenceDefinition, Step, StepDraft, TaskStatus, TriggerType,
};
pub use persistence::{DripDb, SequenceStore};
pub use service::{SequenceService, Started};
pub use store::ArtifactStore;
