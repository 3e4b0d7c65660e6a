//! recpipe - sparse data distribution pipelining for recommendation training
//!
//! Overlaps the input distribution of sharded embedding modules with the
//! dense forward/backward of the previous batch. A model is traced, the
//! argument paths of its sharded modules are resolved back to the raw batch,
//! and their forwards are replaced with pipelined forwards that consume the
//! distribution started one batch early.

#![allow(clippy::type_complexity)] // Boxed awaitables nest deeply
#![allow(clippy::new_without_default)] // Builders mirror the config structs

pub mod backend;
pub mod config;
pub mod dist;
pub mod error;
pub mod graph;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod tensor;
pub mod value;

pub use backend::{Device, DeviceRuntime, HostRuntime, Stream, StreamGuard};
pub use config::{ContextVersion, ForwardVariant, LoaderConfig, PipelineConfig};
pub use error::{ErrorCategory, PipelineError, PipelineResult};
pub use model::{GraphModel, Module};
pub use pipeline::{
    BackgroundLoader, PipelineStage, SparseDataDist, StagedPipeline, TrainPipelineContext,
};
pub use tensor::{KeyedJaggedTensor, KeyedTensor, Tensor};
pub use value::{Kwargs, Value};
