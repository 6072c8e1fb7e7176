pub mod context;
pub mod deletion;
pub mod error;
pub mod ownership;
pub mod pipeline;
pub mod reconciler;
pub mod result;
pub mod status;

pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use ownership::{assign_owner, is_controlled_by};
pub use pipeline::{PIPELINE, PipelineState, Stage, run_pipeline};
pub use reconciler::{error_policy, reconcile, reconcile_cluster};
pub use result::Requeue;
pub use status::{ConditionBuilder, condition_status, condition_types};
