//! Sparse data distribution pipeline
//!
//! [`SparseDataDist`] rewrites a model so that the input distribution of its
//! sharded modules runs ahead of the forward pass, one batch early, on a
//! dedicated communication stream. Each batch in flight owns a
//! [`TrainPipelineContext`]; the orchestrator keeps a small window of them
//! and advances it after every forward.
//!
//! Typical loop:
//!
//! ```rust,ignore
//! let sdd = SparseDataDist::builder(model).config(config).build()?;
//! let mut current = sdd.start_communication(first)?;
//! sdd.wait_fill_callback()?;
//! loop {
//!     match batches.next() {
//!         Some(next) => pending = Some(sdd.start_communication(next)?),
//!         None => sdd.data_exhausted()?,
//!     }
//!     let out = sdd.model().forward(&[current])?;
//!     ...
//! }
//! ```

pub mod arg_info;
pub mod context;
pub mod forward;
pub mod loader;
pub mod postproc;
pub mod rewrite;
pub mod sdd;
pub mod staged;

pub use arg_info::{ArgInfo, ArgInfoStep, CallArgs};
pub use context::TrainPipelineContext;
pub use forward::PipelinedForward;
pub use loader::BackgroundLoader;
pub use postproc::PipelinedPostproc;
pub use rewrite::{compile_targets, rewrite_model, ArgResolver, RewriteEnv, RewriteOutcome};
pub use sdd::{SparseDataDist, SparseDataDistBuilder};
pub use staged::{train_pipeline_stages, PipelineStage, StagedPipeline};
