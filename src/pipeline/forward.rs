//! Replacement forwards of pipelined sharded modules.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::backend::{Device, DeviceRuntime, Stream, StreamGuard};
use crate::choreography_violation;
use crate::config::EffectiveForward;
use crate::dist::{LazyAwaitable, OutputDist, Ready, ShardedModule};
use crate::error::{type_mismatch, PipelineResult};
use crate::graph::NodeOutput;
use crate::model::Module;
use crate::pipeline::arg_info::CallArgs;
use crate::pipeline::context::TrainPipelineContext;
use crate::tensor::{JaggedTensor, KeyedTensor, Tensor};
use crate::value::{Multistreamable, Value};

/// Stands in for a sharded module's forward inside the model: consumes the
/// requests started for this batch instead of distributing inputs again.
pub struct PipelinedForward {
    name: String,
    args: CallArgs,
    module: Arc<dyn Module>,
    variant: EffectiveForward,
    /// Stream the awaited inputs were produced on.
    stream: Option<Stream>,
    device: Device,
}

impl PipelinedForward {
    pub fn new(
        name: impl Into<String>,
        args: CallArgs,
        module: Arc<dyn Module>,
        variant: EffectiveForward,
        stream: Option<Stream>,
        device: Device,
    ) -> Self {
        PipelinedForward {
            name: name.into(),
            args,
            module,
            variant,
            stream,
            device,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &CallArgs {
        &self.args
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn variant(&self) -> EffectiveForward {
        self.variant
    }

    pub fn sharded(&self) -> PipelineResult<&dyn ShardedModule> {
        self.module
            .as_sharded()
            .ok_or_else(|| type_mismatch("sharded module", self.module.type_name()))
    }

    pub fn invoke(
        &self,
        ctx: &mut TrainPipelineContext,
        runtime: &dyn DeviceRuntime,
    ) -> PipelineResult<NodeOutput> {
        match self.variant {
            EffectiveForward::Synchronous => self.invoke_sync(ctx, runtime).map(NodeOutput::Pending),
            EffectiveForward::SemiSynchronous { detach } => {
                self.invoke_embedding(ctx, runtime, detach)
            }
            EffectiveForward::Prefetch => self.invoke_prefetched(ctx, runtime).map(NodeOutput::Pending),
        }
    }

    fn invoke_sync(
        &self,
        ctx: &mut TrainPipelineContext,
        runtime: &dyn DeviceRuntime,
    ) -> PipelineResult<LazyAwaitable> {
        let request = ctx.input_dist_tensors_requests.remove(&self.name).ok_or_else(|| {
            choreography_violation!(
                "no input distribution request for '{}' in context {}",
                self.name,
                ctx.index
            )
        })?;
        let data = {
            let _guard = StreamGuard::enter(runtime, self.stream.as_ref())?;
            request.wait()?
        };
        let mut module_ctx = ctx.module_contexts.remove(&self.name).ok_or_else(|| {
            choreography_violation!("no module context for '{}' in context {}", self.name, ctx.index)
        })?;

        if let Some(stream) = &self.stream {
            let current = runtime.current_stream(self.device);
            runtime.wait_stream(&current, stream)?;
            data.record_stream(&current);
            module_ctx.record_stream(&current);
            trace!(module = %self.name, stream = %current.id(), "recorded forward inputs");
        }

        Ok(self
            .sharded()?
            .compute_and_output_dist(module_ctx.as_mut(), data)?
            .into_lazy())
    }

    fn invoke_prefetched(
        &self,
        ctx: &mut TrainPipelineContext,
        runtime: &dyn DeviceRuntime,
    ) -> PipelineResult<LazyAwaitable> {
        let data = ctx.module_input_post_prefetch.remove(&self.name).ok_or_else(|| {
            choreography_violation!("'{}' was not prefetched in context {}", self.name, ctx.index)
        })?;
        let mut module_ctx = ctx
            .module_contexts_post_prefetch
            .remove(&self.name)
            .ok_or_else(|| {
                choreography_violation!(
                    "no prefetched module context for '{}' in context {}",
                    self.name,
                    ctx.index
                )
            })?;

        if let Some(stream) = &self.stream {
            let current = runtime.current_stream(self.device);
            runtime.wait_stream(&current, stream)?;
            data.record_stream(&current);
            module_ctx.record_stream(&current);
        }

        Ok(self
            .sharded()?
            .compute_and_output_dist(module_ctx.as_mut(), data)?
            .into_lazy())
    }

    fn invoke_embedding(
        &self,
        ctx: &mut TrainPipelineContext,
        runtime: &dyn DeviceRuntime,
        detach: bool,
    ) -> PipelineResult<NodeOutput> {
        if !ctx.embedding_a2a_requests.contains_key(&self.name) {
            return Err(choreography_violation!(
                "embedding lookup for '{}' was not started in context {}",
                self.name,
                ctx.index
            ));
        }
        let module_ctx = ctx.module_contexts.remove(&self.name).ok_or_else(|| {
            choreography_violation!("no module context for '{}' in context {}", self.name, ctx.index)
        })?;
        let current = runtime.current_stream(self.device);
        if let Some(stream) = &self.stream {
            runtime.wait_stream(&current, stream)?;
            module_ctx.record_stream(&current);
        }

        let output = ctx
            .embedding_a2a_requests
            .remove(&self.name)
            .ok_or_else(|| choreography_violation!("embedding lookup for '{}' vanished", self.name))?;
        let value = match output {
            OutputDist::Embeddings(embeddings) => {
                let embeddings = embeddings.wait()?;
                if detach {
                    detach_embeddings(embeddings, &current, ctx)?
                } else {
                    embeddings
                }
            }
            OutputDist::WithRemap {
                embeddings,
                remapped,
            } => {
                let embeddings = embeddings.wait()?;
                let remapped = remapped.wait()?;
                let embeddings = if detach {
                    detach_embeddings(embeddings, &current, ctx)?
                } else {
                    embeddings
                };
                Value::List(vec![embeddings, remapped])
            }
        };
        // Results are already materialised; the forward still sees a deferred
        // handle.
        Ok(NodeOutput::Pending(Box::new(Ready(value))))
    }
}

/// Replace embedding tensors with gradient-tracking leaves, keeping the
/// originals in the context for a separately scheduled backward.
fn detach_embeddings(
    embeddings: Value,
    current: &Stream,
    ctx: &mut TrainPipelineContext,
) -> PipelineResult<Value> {
    match embeddings {
        Value::Keyed(kt) => {
            kt.record_stream(current);
            let tensor = kt.values().clone();
            let detached = tensor.detach_with_grad();
            let out = KeyedTensor::with_values(&kt, detached.clone())?;
            ctx.embedding_tensors.push(vec![tensor]);
            ctx.embedding_features.push(vec![kt.keys().to_vec()]);
            ctx.detached_embedding_tensors.push(vec![detached]);
            Ok(Value::Keyed(out))
        }
        Value::Dict(map) => {
            let mut tensors: Vec<Tensor> = Vec::with_capacity(map.len());
            let mut features = Vec::with_capacity(map.len());
            let mut detached_tensors = Vec::with_capacity(map.len());
            let mut out = std::collections::BTreeMap::new();
            for (key, value) in map {
                let jt = match value {
                    Value::Jagged(jt) => jt,
                    other => return Err(type_mismatch("JaggedTensor", other.type_name())),
                };
                jt.record_stream(current);
                let tensor = jt.values().clone();
                let detached = tensor.detach_with_grad();
                out.insert(
                    key.clone(),
                    Value::Jagged(JaggedTensor::with_values(&jt, detached.clone())?),
                );
                tensors.push(tensor);
                features.push(vec![key]);
                detached_tensors.push(detached);
            }
            ctx.embedding_tensors.push(tensors);
            ctx.embedding_features.push(features);
            ctx.detached_embedding_tensors.push(detached_tensors);
            Ok(Value::Dict(out))
        }
        other => Err(type_mismatch("KeyedTensor or dict of JaggedTensor", other.type_name())),
    }
}

impl fmt::Debug for PipelinedForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelinedForward")
            .field("name", &self.name)
            .field("variant", &self.variant)
            .field("args", &self.args.len())
            .finish()
    }
}
