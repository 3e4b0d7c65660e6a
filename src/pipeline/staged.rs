//! Runs a batch iterator through a fixed list of stages, one batch per stage
//! per step.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info_span};

use crate::backend::{wait_for_batch, Device, DeviceRuntime, Stream, StreamGuard};
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::SparseDataDist;
use crate::value::{Multistreamable, Pipelineable, Value};

type Runnable<S> = Box<dyn Fn(S) -> PipelineResult<S> + Send + Sync>;
type Callback = Box<dyn Fn() -> PipelineResult<()> + Send + Sync>;

pub struct PipelineStage<S> {
    pub name: String,
    runnable: Runnable<S>,
    pub stream: Option<Stream>,
    fill_callback: Option<Callback>,
    data_exhausted_callback: Option<Callback>,
}

impl<S> PipelineStage<S> {
    pub fn new<F>(name: impl Into<String>, runnable: F) -> Self
    where
        F: Fn(S) -> PipelineResult<S> + Send + Sync + 'static,
    {
        PipelineStage {
            name: name.into(),
            runnable: Box::new(runnable),
            stream: None,
            fill_callback: None,
            data_exhausted_callback: None,
        }
    }

    pub fn with_stream(mut self, stream: Option<Stream>) -> Self {
        self.stream = stream;
        self
    }

    /// Runs after this stage while the pipeline is being primed.
    pub fn with_fill_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn() -> PipelineResult<()> + Send + Sync + 'static,
    {
        self.fill_callback = Some(Box::new(callback));
        self
    }

    /// Runs once when the source runs dry.
    pub fn with_data_exhausted_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn() -> PipelineResult<()> + Send + Sync + 'static,
    {
        self.data_exhausted_callback = Some(Box::new(callback));
        self
    }
}

impl<S: Pipelineable + 'static> PipelineStage<S> {
    /// Host-to-device copy of every batch.
    pub fn data_copy(device: Device, non_blocking: bool, stream: Option<Stream>) -> Self {
        PipelineStage::new("data_copy", move |batch: S| batch.to_device(device, non_blocking))
            .with_stream(stream)
    }
}

impl<S> fmt::Debug for PipelineStage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("name", &self.name)
            .field("stream", &self.stream)
            .field("fill_callback", &self.fill_callback.is_some())
            .field("data_exhausted_callback", &self.data_exhausted_callback.is_some())
            .finish()
    }
}

/// Keeps one batch in flight per stage. [`StagedPipeline::progress`]
/// returns the batch that has been through every stage and pushes a new
/// one into the first.
pub struct StagedPipeline<S, I> {
    stages: Vec<PipelineStage<S>>,
    source: I,
    runtime: Arc<dyn DeviceRuntime>,
    outputs: Vec<Option<S>>,
    filled: bool,
    exhausted: bool,
}

impl<S, I> StagedPipeline<S, I>
where
    S: Multistreamable,
    I: Iterator<Item = S>,
{
    pub fn new(
        stages: Vec<PipelineStage<S>>,
        source: I,
        runtime: Arc<dyn DeviceRuntime>,
    ) -> PipelineResult<Self> {
        if stages.is_empty() {
            return Err(PipelineError::InvalidConfiguration(
                "a staged pipeline needs at least one stage".to_string(),
            ));
        }
        let outputs = (0..stages.len()).map(|_| None).collect();
        Ok(StagedPipeline {
            stages,
            source,
            runtime,
            outputs,
            filled: false,
            exhausted: false,
        })
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn run_stage(&self, i: usize, batch: S) -> PipelineResult<S> {
        let stage = &self.stages[i];
        let _span = info_span!("pipeline_stage", stage = %stage.name).entered();
        let _guard = StreamGuard::enter(self.runtime.as_ref(), stage.stream.as_ref())?;
        if i > 0 {
            wait_for_batch(self.runtime.as_ref(), &batch, self.stages[i - 1].stream.as_ref())?;
        }
        (stage.runnable)(batch)
    }

    fn next_input(&mut self) -> PipelineResult<Option<S>> {
        if self.exhausted {
            return Ok(None);
        }
        match self.source.next() {
            Some(batch) => Ok(Some(batch)),
            None => {
                self.exhausted = true;
                debug!("source exhausted");
                for stage in &self.stages {
                    if let Some(callback) = &stage.data_exhausted_callback {
                        callback()?;
                    }
                }
                Ok(None)
            }
        }
    }

    fn shift(&mut self, i: usize) -> PipelineResult<()> {
        let input = self.outputs[i - 1].take();
        self.outputs[i] = match input {
            Some(batch) => Some(self.run_stage(i, batch)?),
            None => None,
        };
        Ok(())
    }

    fn feed(&mut self) -> PipelineResult<()> {
        self.outputs[0] = match self.next_input()? {
            Some(batch) => Some(self.run_stage(0, batch)?),
            None => None,
        };
        Ok(())
    }

    /// Prime every stage. Stage `i` sees its first batch on step `i`; its
    /// fill callback runs after each of its priming steps, with or without a
    /// batch.
    fn fill(&mut self) -> PipelineResult<()> {
        let n = self.stages.len();
        for step in 0..n {
            for i in (1..=step.min(n - 1)).rev() {
                self.shift(i)?;
                if let Some(callback) = &self.stages[i].fill_callback {
                    callback()?;
                }
            }
            self.feed()?;
            if let Some(callback) = &self.stages[0].fill_callback {
                callback()?;
            }
        }
        self.filled = true;
        Ok(())
    }

    /// Next batch that has passed every stage, or `None` once the source is
    /// exhausted and every in-flight batch has been returned.
    pub fn progress(&mut self) -> PipelineResult<Option<S>> {
        if !self.filled {
            self.fill()?;
        }
        let n = self.stages.len();
        let out = self.outputs[n - 1].take();
        for i in (1..n).rev() {
            self.shift(i)?;
        }
        self.feed()?;
        Ok(out)
    }
}

/// Stages of a sparse-data-dist training pipeline: host-to-device copy,
/// then the orchestrator's own stages.
pub fn train_pipeline_stages(
    sdd: &SparseDataDist,
    device: Device,
    non_blocking: bool,
    copy_stream: Option<Stream>,
) -> Vec<PipelineStage<Value>> {
    let mut stages = vec![PipelineStage::data_copy(device, non_blocking, copy_stream)];
    stages.extend(sdd.pipeline_stages());
    stages
}
