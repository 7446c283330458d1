//! Sync runs: the step scheduler, the two provider graphs, and reconciliation.

mod engine;
mod error;
pub mod pipeline;
mod progress;
mod push;
pub mod reconcile;
mod settings;
mod stream_sync;
mod zone_sync;

pub use engine::{queue_local_edit, Provider, SyncEngine};
pub use error::{PipelineError, SyncError};
pub use pipeline::{Pipeline, PipelineBuilder, RunReport, StepOutput, StepState};
pub use progress::{Progress, ProgressTracker};
pub use push::PushOutcome;
pub use reconcile::{plan, ReconcilePlan, ReconcileTarget};
pub use settings::SyncSettings;
pub use stream_sync::{ALL_IDS_CHECKPOINT, UPDATED_CHECKPOINT};
pub use zone_sync::zone_checkpoint;
