//! Interceptor for auxiliary modules feeding sharded modules.

use std::fmt;
use std::sync::Arc;

use tracing::{debug_span, warn};

use crate::backend::{DeviceRuntime, Stream, StreamGuard};
use crate::error::PipelineResult;
use crate::graph::{FunctionRegistry, Graph};
use crate::model::Module;
use crate::pipeline::arg_info::CallArgs;
use crate::pipeline::context::TrainPipelineContext;
use crate::tensor::Tensor;
use crate::value::{Kwargs, Multistreamable, Value};

/// Runs a parameter-free module on the communication stream ahead of the
/// forward pass and caches its result in the batch's context.
///
/// Introspection (children, parameters, buffers) is forwarded to the wrapped
/// module so state dicts are unchanged by interception.
pub struct PipelinedPostproc {
    fqn: String,
    module: Arc<dyn Module>,
    args: CallArgs,
    runtime: Arc<dyn DeviceRuntime>,
    dist_stream: Option<Stream>,
    default_stream: Option<Stream>,
}

impl PipelinedPostproc {
    pub fn new(
        fqn: impl Into<String>,
        module: Arc<dyn Module>,
        args: CallArgs,
        runtime: Arc<dyn DeviceRuntime>,
        dist_stream: Option<Stream>,
        default_stream: Option<Stream>,
    ) -> Self {
        PipelinedPostproc {
            fqn: fqn.into(),
            module,
            args,
            runtime,
            dist_stream,
            default_stream,
        }
    }

    pub fn fqn(&self) -> &str {
        &self.fqn
    }

    pub fn postproc_module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn args(&self) -> &CallArgs {
        &self.args
    }

    /// Produce the result for the batch `input` belongs to, running the
    /// wrapped module at most once per context.
    pub fn invoke(&self, input: &Value, ctx: &mut TrainPipelineContext) -> PipelineResult<Value> {
        if let Some(cached) = ctx.postproc_fwd_results.get(&self.fqn) {
            return Ok(cached.clone());
        }

        let (args, kwargs) = self.args.build_args_kwargs(input, ctx)?;
        let _span = debug_span!("sdd_input_postproc", index = ctx.index, fqn = %self.fqn).entered();
        let result = {
            let _guard = StreamGuard::enter(self.runtime.as_ref(), self.dist_stream.as_ref())?;
            self.module.forward(&args, &kwargs)?
        };

        if let (Some(default), Some(dist)) = (&self.default_stream, &self.dist_stream) {
            self.runtime.wait_stream(default, dist)?;
            if result.is_stream_aware() {
                result.record_stream(default);
            } else if ctx.index == 0 {
                warn!(
                    fqn = %self.fqn,
                    kind = result.type_name(),
                    "postproc result cannot be recorded on the forward stream"
                );
            }
        }

        ctx.postproc_fwd_results
            .insert(self.fqn.clone(), result.clone());
        Ok(result)
    }

    /// Call site inside the model forward: reuse the result computed at
    /// start time, or run eagerly on the forward's own arguments.
    pub fn invoke_in_forward(
        &self,
        args: &[Value],
        kwargs: &Kwargs,
        ctx: &mut TrainPipelineContext,
    ) -> PipelineResult<Value> {
        if let Some(cached) = ctx.postproc_fwd_results.get(&self.fqn) {
            return Ok(cached.clone());
        }
        let result = self.module.forward(args, kwargs)?;
        ctx.postproc_fwd_results
            .insert(self.fqn.clone(), result.clone());
        Ok(result)
    }
}

impl Module for PipelinedPostproc {
    fn type_name(&self) -> &str {
        self.module.type_name()
    }

    fn forward(&self, args: &[Value], kwargs: &Kwargs) -> PipelineResult<Value> {
        self.module.forward(args, kwargs)
    }

    fn named_children(&self) -> Vec<(String, Arc<dyn Module>)> {
        self.module.named_children()
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        self.module.parameters()
    }

    fn buffers(&self) -> Vec<(String, Tensor)> {
        self.module.buffers()
    }

    fn graph(&self) -> Option<&Graph> {
        self.module.graph()
    }

    fn functions(&self) -> Option<&FunctionRegistry> {
        self.module.functions()
    }

    fn is_traceable(&self) -> bool {
        self.module.is_traceable()
    }
}

impl fmt::Debug for PipelinedPostproc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelinedPostproc")
            .field("fqn", &self.fqn)
            .field("module", &self.module.type_name())
            .field("args", &self.args)
            .finish()
    }
}
