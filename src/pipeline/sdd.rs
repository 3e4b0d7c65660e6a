//! Sparse data distribution orchestrator.
//!
//! Owns a sliding window of [`TrainPipelineContext`]s and drives the
//! communication phases of the pipelined sharded modules against fixed slots
//! of that window:
//!
//! | phase                  | slot without prefetch | slot with prefetch |
//! |------------------------|-----------------------|--------------------|
//! | model forward          | 0                     | 0                  |
//! | `prefetch`             | -                     | 1                  |
//! | `start_communication`  | 1                     | 2                  |
//! | `wait_communication`   | 1                     | 2                  |
//!
//! A forward hook on the model waits for the newest batch's splits and
//! advances the window after every forward pass.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, info_span, trace};

use crate::backend::{Device, DeviceRuntime, HostRuntime, Stream, StreamGuard};
use crate::choreography_violation;
use crate::config::{ContextVersion, EffectiveForward, PipelineConfig};
use crate::dist::{fuse_splits, Awaitable};
use crate::error::{internal_err, PipelineError, PipelineResult};
use crate::graph::{ModuleDispatch, NodeOutput};
use crate::model::{ForwardHook, GraphModel, HookHandle, Module, ModuleCompiler};
use crate::pipeline::context::TrainPipelineContext;
use crate::pipeline::forward::PipelinedForward;
use crate::pipeline::postproc::PipelinedPostproc;
use crate::pipeline::rewrite::{rewrite_model, RewriteEnv};
use crate::pipeline::staged::PipelineStage;
use crate::value::{Kwargs, Multistreamable, Value};

/// Interceptors installed for one attached period.
struct Registry {
    forwards: Vec<Arc<PipelinedForward>>,
    postprocs: BTreeMap<String, Arc<PipelinedPostproc>>,
    compiled: BTreeMap<String, Arc<dyn Module>>,
}

impl Registry {
    fn forward(&self, fqn: &str) -> Option<&Arc<PipelinedForward>> {
        self.forwards.iter().find(|f| f.name() == fqn)
    }

    fn names(&self) -> BTreeSet<String> {
        self.forwards.iter().map(|f| f.name().to_string()).collect()
    }
}

struct SddState {
    contexts: VecDeque<TrainPipelineContext>,
    next_index: i64,
    initialized: bool,
    exhausting: bool,
    registry: Option<Arc<Registry>>,
    non_pipelined: Vec<String>,
    hook: Option<HookHandle>,
    retired: Option<TrainPipelineContext>,
}

struct SddCore {
    config: PipelineConfig,
    env: RewriteEnv,
    compiler: Option<Arc<dyn ModuleCompiler>>,
    state: Mutex<SddState>,
}

impl SddCore {
    fn lock(&self) -> PipelineResult<MutexGuard<'_, SddState>> {
        Ok(self.state.lock()?)
    }

    fn start_slot(&self) -> usize {
        if self.config.prefetch {
            2
        } else {
            1
        }
    }

    fn add_context(&self, state: &mut SddState) {
        let ctx = TrainPipelineContext::new(state.next_index, self.config.context_version);
        state.next_index += 1;
        state.contexts.push_back(ctx);
    }

    fn should_assert(&self, state: &SddState, index: i64) -> bool {
        self.config.context_assertions && state.initialized && !state.exhausting && index >= 0
    }

    fn pipelined_names(state: &SddState) -> BTreeSet<String> {
        state
            .registry
            .as_ref()
            .map(|r| r.names())
            .unwrap_or_default()
    }

    fn wait(&self) -> PipelineResult<()> {
        let mut state = self.lock()?;
        if state.contexts.is_empty() {
            return Ok(());
        }
        let slot = self.start_slot();
        let names = Self::pipelined_names(&state);
        let index = slot_index(&state, slot)?;
        let check = self.should_assert(&state, index);
        let ctx = slot_mut(&mut state, slot)?;

        let _span = info_span!("wait_sparse_data_dist", index = ctx.index).entered();
        if check {
            let fused = ctx.fused_request_names();
            if fused != names {
                return Err(PipelineError::ContextInvariantViolated {
                    index: ctx.index,
                    map: "fused_splits_awaitables",
                    expected: format!("{:?}", names),
                    actual: format!("{:?}", fused),
                });
            }
        }
        {
            let _guard = StreamGuard::enter(
                self.env.runtime.as_ref(),
                self.env.data_dist_stream.as_ref(),
            )?;
            for (fused_names, fused) in std::mem::take(&mut ctx.fused_splits_awaitables) {
                let requests = Box::new(fused).wait()?;
                for (name, request) in fused_names.into_iter().zip(requests) {
                    ctx.input_dist_tensors_requests.insert(name, request);
                }
            }
        }
        ctx.input_dist_splits_requests.clear();
        if ctx.version == ContextVersion::Legacy {
            let parked = std::mem::take(&mut ctx.module_contexts_next_batch);
            ctx.module_contexts.extend(parked);
        }
        Ok(())
    }

    fn advance(&self) -> PipelineResult<()> {
        let mut state = self.lock()?;
        if state.contexts.is_empty() {
            return Ok(());
        }
        let window = self.config.window_size();
        if self.config.context_assertions && state.contexts.len() != window {
            return Err(PipelineError::ContextInvariantViolated {
                index: state.contexts.front().map_or(-1, |c| c.index),
                map: "contexts",
                expected: window.to_string(),
                actual: state.contexts.len().to_string(),
            });
        }
        state.retired = state.contexts.pop_front();
        self.add_context(&mut state);
        trace!(
            contexts = ?state.contexts.iter().map(|c| c.index).collect::<Vec<_>>(),
            "advanced context window"
        );
        self.check_forward_context(&state)
    }

    /// Key sets of the context the next forward consumes.
    fn check_forward_context(&self, state: &SddState) -> PipelineResult<()> {
        let Some(ctx) = state.contexts.front() else {
            return Ok(());
        };
        if !self.should_assert(state, ctx.index) {
            return Ok(());
        }
        let names = Self::pipelined_names(state);
        if self.config.prefetch {
            expect_keys(ctx.index, "module_input_post_prefetch", &ctx.module_input_post_prefetch, &names)?;
            expect_keys(
                ctx.index,
                "module_contexts_post_prefetch",
                &ctx.module_contexts_post_prefetch,
                &names,
            )
        } else {
            expect_keys(ctx.index, "input_dist_tensors_requests", &ctx.input_dist_tensors_requests, &names)?;
            expect_keys(ctx.index, "module_contexts", &ctx.module_contexts, &names)
        }
    }
}

fn slot_index(state: &SddState, slot: usize) -> PipelineResult<i64> {
    state
        .contexts
        .get(slot)
        .map(|c| c.index)
        .ok_or_else(|| internal_err(&format!("context window has no slot {}", slot)))
}

fn slot_mut(state: &mut SddState, slot: usize) -> PipelineResult<&mut TrainPipelineContext> {
    state
        .contexts
        .get_mut(slot)
        .ok_or_else(|| internal_err(&format!("context window has no slot {}", slot)))
}

fn expect_keys<T>(
    index: i64,
    map: &'static str,
    actual: &BTreeMap<String, T>,
    expected: &BTreeSet<String>,
) -> PipelineResult<()> {
    let keys: BTreeSet<String> = actual.keys().cloned().collect();
    if &keys != expected {
        return Err(PipelineError::ContextInvariantViolated {
            index,
            map,
            expected: format!("{:?}", expected),
            actual: format!("{:?}", keys),
        });
    }
    Ok(())
}

/// Issue input distribution of every pipelined module for `batch`.
fn start_data_dist(
    forwards: &[Arc<PipelinedForward>],
    batch: &Value,
    ctx: &mut TrainPipelineContext,
) -> PipelineResult<()> {
    if ctx.version == ContextVersion::Legacy {
        ctx.input_dist_splits_requests.clear();
        ctx.module_contexts_next_batch.clear();
        ctx.fused_splits_awaitables.clear();
    }
    for forward in forwards {
        let (args, kwargs) = forward.args().build_args_kwargs(batch, ctx)?;
        let sharded = forward.sharded()?;
        let mut module_ctx = sharded.create_context();
        let splits = sharded.input_dist(module_ctx.as_mut(), &args, &kwargs)?;
        let name = forward.name().to_string();
        match ctx.version {
            ContextVersion::Legacy => {
                ctx.module_contexts_next_batch.insert(name.clone(), module_ctx);
            }
            ContextVersion::Current => {
                ctx.module_contexts.insert(name.clone(), module_ctx);
            }
        }
        ctx.input_dist_splits_requests.insert(name, splits);
    }
    let splits = std::mem::take(&mut ctx.input_dist_splits_requests);
    ctx.fused_splits_awaitables.extend(fuse_splits(splits));
    Ok(())
}

/// Routes calls of intercepted modules to their pipelined counterparts.
struct SddDispatch {
    core: Arc<SddCore>,
    registry: Arc<Registry>,
}

impl ModuleDispatch for SddDispatch {
    fn call_module(
        &self,
        fqn: &str,
        _module: &Arc<dyn Module>,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> PipelineResult<Option<NodeOutput>> {
        if let Some(forward) = self.registry.forward(fqn) {
            let mut state = self.core.lock()?;
            let ctx = state
                .contexts
                .front_mut()
                .ok_or_else(|| choreography_violation!("'{}' called before any batch was started", fqn))?;
            return forward
                .invoke(ctx, self.core.env.runtime.as_ref())
                .map(Some);
        }
        if let Some(postproc) = self.registry.postprocs.get(fqn) {
            let mut state = self.core.lock()?;
            let ctx = state
                .contexts
                .front_mut()
                .ok_or_else(|| choreography_violation!("'{}' called before any batch was started", fqn))?;
            return postproc
                .invoke_in_forward(args, kwargs, ctx)
                .map(|v| Some(NodeOutput::Ready(v)));
        }
        if let Some(compiled) = self.registry.compiled.get(fqn) {
            return compiled
                .forward(args, kwargs)
                .map(|v| Some(NodeOutput::Ready(v)));
        }
        Ok(None)
    }
}

/// Runs after every model forward: wait for the newest batch's splits,
/// then advance the window.
struct SddForwardHook {
    core: Arc<SddCore>,
}

impl ForwardHook for SddForwardHook {
    fn after_forward(&self, _inputs: &[Value], _output: &Value) -> PipelineResult<()> {
        self.core.wait()?;
        self.core.advance()
    }
}

pub struct SparseDataDistBuilder {
    model: Arc<GraphModel>,
    runtime: Option<Arc<dyn DeviceRuntime>>,
    device: Device,
    config: PipelineConfig,
    compiler: Option<Arc<dyn ModuleCompiler>>,
}

impl SparseDataDistBuilder {
    pub fn runtime(mut self, runtime: Arc<dyn DeviceRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn compiler(mut self, compiler: Arc<dyn ModuleCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn build(self) -> PipelineResult<SparseDataDist> {
        self.config.validate()?;
        if self.config.apply_compile && self.compiler.is_none() {
            return Err(PipelineError::UnsupportedConfiguration(
                "apply_compile is set but no module compiler was supplied".to_string(),
            ));
        }
        let runtime = self.runtime.unwrap_or_else(HostRuntime::shared);
        let (data_dist_stream, prefetch_stream, default_stream) = if self.device.has_streams() {
            let data_dist = runtime.new_stream(self.device, 0, "data_dist")?;
            let prefetch = if self.config.prefetch {
                Some(runtime.new_stream(self.device, 0, "prefetch")?)
            } else {
                None
            };
            (Some(data_dist), prefetch, Some(runtime.current_stream(self.device)))
        } else {
            (None, None, None)
        };
        debug!(device = %self.device, config = ?self.config, "building sparse data dist");

        let core = SddCore {
            config: self.config,
            env: RewriteEnv {
                runtime,
                device: self.device,
                data_dist_stream,
                prefetch_stream,
                default_stream,
            },
            compiler: self.compiler,
            state: Mutex::new(SddState {
                contexts: VecDeque::new(),
                next_index: 0,
                initialized: false,
                exhausting: false,
                registry: None,
                non_pipelined: Vec::new(),
                hook: None,
                retired: None,
            }),
        };
        Ok(SparseDataDist {
            model: self.model,
            core: Arc::new(core),
        })
    }
}

/// Cloneable handle on the orchestrator of one model.
///
/// Typical loop without prefetch:
///
/// ```ignore
/// sdd.start_communication(b0)?;
/// sdd.wait_fill_callback()?;
/// loop {
///     sdd.start_communication(next)?;   // or sdd.data_exhausted()?
///     model.forward(&[current])?;        // hook: wait + advance
/// }
/// ```
#[derive(Clone)]
pub struct SparseDataDist {
    model: Arc<GraphModel>,
    core: Arc<SddCore>,
}

impl SparseDataDist {
    pub fn builder(model: Arc<GraphModel>) -> SparseDataDistBuilder {
        SparseDataDistBuilder {
            model,
            runtime: None,
            device: Device::Cpu,
            config: PipelineConfig::default(),
            compiler: None,
        }
    }

    pub fn model(&self) -> &Arc<GraphModel> {
        &self.model
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.core.config
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.core.env.runtime
    }

    pub fn data_dist_stream(&self) -> Option<&Stream> {
        self.core.env.data_dist_stream.as_ref()
    }

    pub fn prefetch_stream(&self) -> Option<&Stream> {
        self.core.env.prefetch_stream.as_ref()
    }

    pub fn default_stream(&self) -> Option<&Stream> {
        self.core.env.default_stream.as_ref()
    }

    /// Rewrite the model and install the dispatch and forward hook. The
    /// context window is created on first attach and kept across detaches.
    fn attach(&self) -> PipelineResult<()> {
        let core = &self.core;
        let outcome = rewrite_model(
            &self.model,
            &core.config,
            &core.env,
            core.compiler.as_deref(),
        )?;
        let registry = Arc::new(Registry {
            forwards: outcome.forwards,
            postprocs: outcome.postprocs,
            compiled: outcome.compiled,
        });

        let mut state = core.lock()?;
        if state.initialized {
            return Ok(());
        }
        if state.contexts.is_empty() {
            let version = core.config.context_version;
            if core.config.prefetch {
                state.contexts.push_back(TrainPipelineContext::new(-2, version));
            }
            state.contexts.push_back(TrainPipelineContext::new(-1, version));
            core.add_context(&mut state);
        }
        state.non_pipelined = outcome.non_pipelined;
        state.registry = Some(Arc::clone(&registry));

        self.model.set_dispatch(Some(Arc::new(SddDispatch {
            core: Arc::clone(core),
            registry: Arc::clone(&registry),
        })))?;
        let hook = self.model.register_forward_hook(Arc::new(SddForwardHook {
            core: Arc::clone(core),
        }))?;
        state.hook = Some(hook);
        state.initialized = true;
        info!(
            pipelined = ?registry.names(),
            postprocs = ?registry.postprocs.keys().collect::<Vec<_>>(),
            non_pipelined = ?state.non_pipelined,
            "sparse data dist attached"
        );
        Ok(())
    }

    /// Issue input distribution for `batch`, attaching first if needed.
    pub fn start_communication(&self, batch: Value) -> PipelineResult<Value> {
        if !self.is_attached() {
            self.attach()?;
        }
        let mut state = self.core.lock()?;
        let registry = state
            .registry
            .clone()
            .ok_or_else(|| internal_err("attached without a registry"))?;
        let ctx = slot_mut(&mut state, self.core.start_slot())?;
        let _span = info_span!("start_sparse_data_dist", index = ctx.index).entered();
        start_data_dist(&registry.forwards, &batch, ctx)?;
        Ok(batch)
    }

    /// Wait for the splits of the most recently started batch.
    pub fn wait_communication(&self) -> PipelineResult<()> {
        self.core.wait()
    }

    /// Fill callback of the communication stage: wait, then advance.
    pub fn wait_fill_callback(&self) -> PipelineResult<()> {
        self.core.wait()?;
        self.core.advance()
    }

    /// Move the distributed inputs of the next batch into the modules'
    /// faster memory ahead of its forward.
    pub fn prefetch(&self, batch: Value) -> PipelineResult<Value> {
        if !self.core.config.prefetch {
            return Err(PipelineError::UnsupportedConfiguration(
                "prefetch() requires prefetch to be enabled".to_string(),
            ));
        }
        let core = &self.core;
        let mut state = core.lock()?;
        let Some(registry) = state.registry.clone() else {
            return Err(choreography_violation!("prefetch before any batch was started"));
        };
        let names = registry.names();
        let index = slot_index(&state, 1)?;
        let check = core.should_assert(&state, index);
        let ctx = slot_mut(&mut state, 1)?;
        if check {
            expect_keys(ctx.index, "input_dist_tensors_requests", &ctx.input_dist_tensors_requests, &names)?;
            expect_keys(ctx.index, "module_contexts", &ctx.module_contexts, &names)?;
        }

        let runtime = core.env.runtime.as_ref();
        let _span = info_span!("prefetch_embeddings", index = ctx.index).entered();
        let _guard = StreamGuard::enter(runtime, core.env.prefetch_stream.as_ref())?;
        for forward in &registry.forwards {
            let name = forward.name();
            let request = ctx.input_dist_tensors_requests.remove(name).ok_or_else(|| {
                choreography_violation!("no input distribution request for '{}' in context {}", name, ctx.index)
            })?;
            let data = {
                let _dist = StreamGuard::enter(runtime, core.env.data_dist_stream.as_ref())?;
                request.wait()?
            };
            let mut module_ctx = ctx.module_contexts.remove(name).ok_or_else(|| {
                choreography_violation!("no module context for '{}' in context {}", name, ctx.index)
            })?;
            if let Some(dist) = &core.env.data_dist_stream {
                let current = runtime.current_stream(core.env.device);
                runtime.wait_stream(&current, dist)?;
                data.record_stream(&current);
                module_ctx.record_stream(&current);
                if let Some(default) = &core.env.default_stream {
                    data.record_stream(default);
                    module_ctx.record_stream(default);
                }
            }
            forward.sharded()?.prefetch(
                module_ctx.as_mut(),
                &data,
                core.env.default_stream.as_ref(),
            )?;
            ctx.module_input_post_prefetch.insert(name.to_string(), data);
            ctx.module_contexts_post_prefetch
                .insert(name.to_string(), module_ctx);
        }
        Ok(batch)
    }

    /// Fill callback of the prefetch stage. Prefetched state already lives
    /// in the context, so there is nothing to load.
    pub fn load_prefetch(&self) {
        debug!("load_prefetch");
    }

    /// Switch to draining: context checks are relaxed from now on.
    pub fn data_exhausted(&self) -> PipelineResult<()> {
        let mut state = self.core.lock()?;
        if !state.exhausting {
            info!("data exhausted, draining in-flight batches");
        }
        state.exhausting = true;
        Ok(())
    }

    pub fn is_exhausting(&self) -> bool {
        self.core.lock().map(|s| s.exhausting).unwrap_or(false)
    }

    /// Start compute and output distribution for the batch the next forward
    /// consumes. Semi-synchronous forwards only.
    pub fn start_embedding_lookup(&self) -> PipelineResult<()> {
        if !matches!(
            self.core.config.effective_forward(),
            EffectiveForward::SemiSynchronous { .. }
        ) {
            return Err(PipelineError::UnsupportedConfiguration(
                "embedding lookup can only be started ahead for semi-synchronous forwards"
                    .to_string(),
            ));
        }
        let core = &self.core;
        let mut state = core.lock()?;
        let Some(registry) = state.registry.clone() else {
            return Err(choreography_violation!("embedding lookup before any batch was started"));
        };
        let ctx = slot_mut(&mut state, 0)?;
        let runtime = core.env.runtime.as_ref();
        let _span = info_span!("start_embedding_lookup", index = ctx.index).entered();
        for forward in &registry.forwards {
            let name = forward.name();
            let request = ctx.input_dist_tensors_requests.remove(name).ok_or_else(|| {
                choreography_violation!("no input distribution request for '{}' in context {}", name, ctx.index)
            })?;
            let data = {
                let _dist = StreamGuard::enter(runtime, core.env.data_dist_stream.as_ref())?;
                request.wait()?
            };
            let module_ctx = ctx.module_contexts.get_mut(name).ok_or_else(|| {
                choreography_violation!("no module context for '{}' in context {}", name, ctx.index)
            })?;
            if let Some(target) = &core.env.default_stream {
                data.record_stream(target);
                module_ctx.record_stream(target);
            }
            let output = forward
                .sharded()?
                .compute_and_output_dist(module_ctx.as_mut(), data)?;
            ctx.embedding_a2a_requests.insert(name.to_string(), output);
        }
        Ok(())
    }

    /// Remove the dispatch and hook so the model runs as written. In-flight
    /// contexts are kept for a later reattach.
    pub fn detach(&self) -> PipelineResult<Arc<GraphModel>> {
        let mut state = self.core.lock()?;
        if state.initialized {
            if let Some(hook) = state.hook.take() {
                self.model.remove_hook(hook)?;
            }
            self.model.set_dispatch(None)?;
            state.registry = None;
            state.initialized = false;
            info!("sparse data dist detached");
        }
        Ok(Arc::clone(&self.model))
    }

    pub fn is_attached(&self) -> bool {
        self.core.lock().map(|s| s.initialized).unwrap_or(false)
    }

    pub fn window_len(&self) -> usize {
        self.core.lock().map(|s| s.contexts.len()).unwrap_or(0)
    }

    /// Indices of the contexts in the window, oldest first.
    pub fn context_indices(&self) -> Vec<i64> {
        self.core
            .lock()
            .map(|s| s.contexts.iter().map(|c| c.index).collect())
            .unwrap_or_default()
    }

    /// Run `f` on the context in `slot` of the window.
    pub fn with_context<R>(
        &self,
        slot: usize,
        f: impl FnOnce(&TrainPipelineContext) -> R,
    ) -> PipelineResult<Option<R>> {
        let state = self.core.lock()?;
        Ok(state.contexts.get(slot).map(f))
    }

    /// Context dropped by the latest advance, if not taken yet.
    pub fn take_retired_context(&self) -> PipelineResult<Option<TrainPipelineContext>> {
        Ok(self.core.lock()?.retired.take())
    }

    pub fn pipelined_module_names(&self) -> Vec<String> {
        self.core
            .lock()
            .ok()
            .and_then(|s| s.registry.clone())
            .map(|r| r.forwards.iter().map(|f| f.name().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn pipelined_postproc_names(&self) -> Vec<String> {
        self.core
            .lock()
            .ok()
            .and_then(|s| s.registry.clone())
            .map(|r| r.postprocs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn compiled_module_names(&self) -> Vec<String> {
        self.core
            .lock()
            .ok()
            .and_then(|s| s.registry.clone())
            .map(|r| r.compiled.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn non_pipelined_module_names(&self) -> Vec<String> {
        self.core
            .lock()
            .map(|s| s.non_pipelined.clone())
            .unwrap_or_default()
    }

    /// Communication stage, plus the prefetch stage when enabled, for a
    /// [`crate::pipeline::StagedPipeline`]. The caller supplies the stages
    /// before and after.
    pub fn pipeline_stages(&self) -> Vec<PipelineStage<Value>> {
        let start = self.clone();
        let fill = self.clone();
        let exhausted = self.clone();
        let mut stages = vec![PipelineStage::new("start_sparse_data_dist", move |batch| {
            start.start_communication(batch)
        })
        .with_stream(self.core.env.data_dist_stream.clone())
        .with_fill_callback(move || fill.wait_fill_callback())
        .with_data_exhausted_callback(move || exhausted.data_exhausted())];

        if self.core.config.prefetch {
            let prefetch = self.clone();
            let load = self.clone();
            stages.push(
                PipelineStage::new("prefetch", move |batch| prefetch.prefetch(batch))
                    .with_stream(self.core.env.prefetch_stream.clone())
                    .with_fill_callback(move || {
                        load.load_prefetch();
                        Ok(())
                    }),
            );
        }
        stages
    }
}

impl fmt::Debug for SparseDataDist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseDataDist")
            .field("model", &self.model)
            .field("config", &self.core.config)
            .field("contexts", &self.context_indices())
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::{EmbeddingTable, LocalEmbeddingBagCollection};
    use crate::graph::{Argument, Graph};
    use crate::model::Composite;
    use crate::tensor::{KeyedJaggedTensor, Tensor};
    use crate::value::Record;

    fn model() -> Arc<GraphModel> {
        let mut g = Graph::new();
        let batch = g.placeholder("batch");
        let sparse = g.get_attr(batch, "sparse");
        let out = g.call_module("ebc", vec![sparse.into()]);
        g.output(out.into());
        let ebc: Arc<dyn Module> = Arc::new(LocalEmbeddingBagCollection::new(vec![
            EmbeddingTable::new("t1", "f1", 8, 2),
        ]));
        Arc::new(GraphModel::new(Arc::new(Composite::new("Model", g).with_child("ebc", ebc))).unwrap())
    }

    fn batch(id: f32) -> Value {
        let kjt = KeyedJaggedTensor::from_lengths(
            vec!["f1".to_string()],
            Tensor::from_slice(&[id, id + 1.0]),
            vec![1, 1],
        )
        .unwrap();
        Value::Record(Record::new("Batch").with_field("sparse", kjt))
    }

    #[test]
    fn test_build_rejects_compile_without_compiler() {
        let err = SparseDataDist::builder(model())
            .config(PipelineConfig::default().with_apply_compile(true))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedConfiguration(_)));
    }

    #[test]
    fn test_streams_only_on_accelerators() {
        let sdd = SparseDataDist::builder(model()).build().unwrap();
        assert!(sdd.data_dist_stream().is_none());

        let sdd = SparseDataDist::builder(model())
            .device(Device::Accelerator(0))
            .config(PipelineConfig::default().with_prefetch(true))
            .build()
            .unwrap();
        assert!(sdd.data_dist_stream().is_some());
        assert!(sdd.prefetch_stream().is_some());
        assert_ne!(sdd.data_dist_stream(), sdd.default_stream());
    }

    #[test]
    fn test_first_start_attaches_and_primes_window() {
        let sdd = SparseDataDist::builder(model()).build().unwrap();
        assert!(!sdd.is_attached());
        assert_eq!(sdd.window_len(), 0);

        sdd.start_communication(batch(1.0)).unwrap();
        assert!(sdd.is_attached());
        assert_eq!(sdd.context_indices(), vec![-1, 0]);
        assert_eq!(sdd.pipelined_module_names(), vec!["ebc".to_string()]);
        assert_eq!(sdd.model().hook_count(), 1);

        sdd.wait_fill_callback().unwrap();
        assert_eq!(sdd.context_indices(), vec![0, 1]);
        let ready = sdd
            .with_context(0, |c| c.tensors_request_names())
            .unwrap()
            .unwrap();
        assert!(ready.contains("ebc"));
    }

    #[test]
    fn test_wait_rejects_partially_fused_splits() {
        let mut g = Graph::new();
        let batch_ph = g.placeholder("batch");
        let sparse = g.get_attr(batch_ph, "sparse");
        let a = g.call_module("ebc", vec![sparse.into()]);
        let b = g.call_module("ebc2", vec![sparse.into()]);
        g.output(Argument::List(vec![a.into(), b.into()]));
        let table = || -> Arc<dyn Module> {
            Arc::new(LocalEmbeddingBagCollection::new(vec![EmbeddingTable::new(
                "t1", "f1", 8, 2,
            )]))
        };
        let root = Composite::new("Model", g)
            .with_child("ebc", table())
            .with_child("ebc2", table());
        let sdd = SparseDataDist::builder(Arc::new(GraphModel::new(Arc::new(root)).unwrap()))
            .config(PipelineConfig::default().with_context_assertions(true))
            .build()
            .unwrap();

        sdd.start_communication(batch(1.0)).unwrap();
        {
            let mut state = sdd.core.lock().unwrap();
            let slot = sdd.core.start_slot();
            let ctx = &mut state.contexts[slot];
            assert_eq!(ctx.fused_splits_awaitables.len(), 1);
            ctx.fused_splits_awaitables[0].0.retain(|n| n != "ebc2");
            assert!(!ctx.fused_request_names().is_empty());
        }

        let err = sdd.wait_fill_callback().unwrap_err();
        match err {
            PipelineError::ContextInvariantViolated { map, actual, .. } => {
                assert_eq!(map, "fused_splits_awaitables");
                assert!(!actual.contains("ebc2"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_prefetch_requires_config() {
        let sdd = SparseDataDist::builder(model()).build().unwrap();
        assert!(matches!(
            sdd.prefetch(batch(1.0)),
            Err(PipelineError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_forward_without_start_is_violation() {
        let sdd = SparseDataDist::builder(model()).build().unwrap();
        sdd.start_communication(batch(1.0)).unwrap();
        // the forward slot still holds the throwaway context
        let err = sdd.model().forward(&[batch(1.0)]).unwrap_err();
        assert!(matches!(err, PipelineError::ChoreographyViolation(_)));
    }

    #[test]
    fn test_detach_restores_model() {
        let sdd = SparseDataDist::builder(model()).build().unwrap();
        sdd.start_communication(batch(1.0)).unwrap();
        let model = sdd.detach().unwrap();
        assert!(!sdd.is_attached());
        assert!(!model.has_dispatch());
        assert_eq!(model.hook_count(), 0);
        assert_eq!(sdd.window_len(), 2);
        assert!(model.forward(&[batch(1.0)]).is_ok());
    }
}
