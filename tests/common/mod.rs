//! Shared fixtures for the pipeline integration tests
//!
//! - [`InstrumentedEbc`]: a sharded embedding collection that logs when its
//!   input distribution starts and when its splits are waited
//! - a counting auxiliary module that shifts ids, shared by both tables
//! - seeded synthetic batches
//! - drivers for the manual and the staged training loop
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::*;
//!
//! let fx = TwoTableModel::new();
//! let sdd = SparseDataDist::builder(Arc::clone(&fx.model)).build()?;
//! let outputs = run_pipelined(&sdd, synthetic_batches(3))?;
//! ```

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use recpipe::backend::{Device, Stream};
use recpipe::dist::{
    run_sharded_eager, Awaitable, EmbeddingTable, LocalEmbeddingBagCollection, ModuleContext,
    OutputDist, ProcessGroup, ShardedModule, SplitsAwaitable, TensorsRequest,
};
use recpipe::error::{PipelineError, PipelineResult};
use recpipe::graph::{Argument, Graph};
use recpipe::model::{Composite, FnModule, GraphModel, Module};
use recpipe::pipeline::{train_pipeline_stages, SparseDataDist, StagedPipeline};
use recpipe::tensor::{KeyedJaggedTensor, Tensor};
use recpipe::value::{Kwargs, Record, Value};

pub use serial_test::serial;

pub const ROWS: usize = 16;
pub const BATCH_SIZE: usize = 4;

// ============================================================================
// Event log
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Input distribution issued for the module's `call`-th batch.
    Start { module: String, call: usize },
    /// Splits of the module's `call`-th batch waited.
    WaitSplits { module: String, call: usize },
    /// Model forward of the test's `n`-th batch began.
    Forward(usize),
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

// ============================================================================
// Instrumented sharded module
// ============================================================================

/// [`LocalEmbeddingBagCollection`] that reports its communication phases.
pub struct InstrumentedEbc {
    inner: LocalEmbeddingBagCollection,
    label: String,
    log: EventLog,
    calls: AtomicUsize,
}

impl InstrumentedEbc {
    pub fn new(label: &str, tables: Vec<EmbeddingTable>, log: &EventLog) -> Self {
        InstrumentedEbc {
            inner: LocalEmbeddingBagCollection::new(tables),
            label: label.to_string(),
            log: log.clone(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_process_group(mut self, pg: ProcessGroup) -> Self {
        self.inner = self.inner.with_process_group(pg);
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.inner = self.inner.with_device(device);
        self
    }

    pub fn contexts_created(&self) -> usize {
        self.inner.contexts_created()
    }

    pub fn input_dist_count(&self) -> usize {
        self.inner.input_dist_count()
    }

    pub fn prefetch_count(&self) -> usize {
        self.inner.prefetch_count()
    }
}

struct LoggedSplits {
    inner: Box<dyn SplitsAwaitable>,
    module: String,
    call: usize,
    log: EventLog,
}

impl Awaitable<TensorsRequest> for LoggedSplits {
    fn wait(self: Box<Self>) -> PipelineResult<TensorsRequest> {
        self.log.push(Event::WaitSplits {
            module: self.module.clone(),
            call: self.call,
        });
        self.inner.wait()
    }
}

impl SplitsAwaitable for LoggedSplits {
    fn process_group(&self) -> Option<&ProcessGroup> {
        self.inner.process_group()
    }
}

impl ShardedModule for InstrumentedEbc {
    fn create_context(&self) -> Box<dyn ModuleContext> {
        self.inner.create_context()
    }

    fn input_dist(
        &self,
        ctx: &mut dyn ModuleContext,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> PipelineResult<Box<dyn SplitsAwaitable>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.push(Event::Start {
            module: self.label.clone(),
            call,
        });
        let inner = self.inner.input_dist(ctx, args, kwargs)?;
        Ok(Box::new(LoggedSplits {
            inner,
            module: self.label.clone(),
            call,
            log: self.log.clone(),
        }))
    }

    fn compute_and_output_dist(
        &self,
        ctx: &mut dyn ModuleContext,
        data: Value,
    ) -> PipelineResult<OutputDist> {
        self.inner.compute_and_output_dist(ctx, data)
    }

    fn prefetch(
        &self,
        ctx: &mut dyn ModuleContext,
        data: &Value,
        forward_stream: Option<&Stream>,
    ) -> PipelineResult<()> {
        self.inner.prefetch(ctx, data, forward_stream)
    }
}

impl Module for InstrumentedEbc {
    fn type_name(&self) -> &str {
        "InstrumentedEmbeddingBagCollection"
    }

    fn forward(&self, args: &[Value], kwargs: &Kwargs) -> PipelineResult<Value> {
        run_sharded_eager(self, args, kwargs)
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        self.inner.parameters()
    }

    fn as_sharded(&self) -> Option<&dyn ShardedModule> {
        Some(self)
    }
}

// ============================================================================
// Auxiliary modules
// ============================================================================

/// Parameter-free module adding 1 (mod [`ROWS`]) to every id, counting its
/// invocations.
pub fn shift_ids(calls: &Arc<AtomicUsize>) -> Arc<dyn Module> {
    let calls = Arc::clone(calls);
    Arc::new(FnModule::new("ShiftIds", move |args: &[Value], _kwargs: &Kwargs| {
        calls.fetch_add(1, Ordering::SeqCst);
        let kjt = args
            .first()
            .ok_or_else(|| PipelineError::GraphError("ShiftIds takes a batch".to_string()))?
            .as_kjt()?;
        let shifted = kjt.values().map(|id| (id + 1.0) % ROWS as f32);
        Ok(Value::KeyedJagged(kjt.with_values(shifted)?))
    }))
}

// ============================================================================
// Models
// ============================================================================

/// `[ebc_user(preproc(batch.sparse)), ebc_item(preproc(batch.sparse))]`
pub struct TwoTableModel {
    pub model: Arc<GraphModel>,
    pub user: Arc<InstrumentedEbc>,
    pub item: Arc<InstrumentedEbc>,
    pub aux_calls: Arc<AtomicUsize>,
    pub log: EventLog,
}

impl TwoTableModel {
    pub fn new() -> Self {
        Self::build(Device::Cpu, None)
    }

    pub fn on_device(device: Device) -> Self {
        Self::build(device, None)
    }

    /// Tables on separate process groups, so their splits are not fused.
    pub fn with_split_groups() -> Self {
        Self::build(Device::Cpu, Some(("pg_user", "pg_item")))
    }

    fn build(device: Device, groups: Option<(&str, &str)>) -> Self {
        recpipe::logging::init_logging_default();
        let log = EventLog::new();
        let aux_calls = Arc::new(AtomicUsize::new(0));

        let mut user = InstrumentedEbc::new(
            "user",
            vec![EmbeddingTable::new("t_user", "user", ROWS, 4)],
            &log,
        )
        .with_device(device);
        let mut item = InstrumentedEbc::new(
            "item",
            vec![EmbeddingTable::new("t_item", "item", ROWS, 2)],
            &log,
        )
        .with_device(device);
        if let Some((pg_user, pg_item)) = groups {
            user = user.with_process_group(ProcessGroup::single(pg_user));
            item = item.with_process_group(ProcessGroup::single(pg_item));
        }
        let user = Arc::new(user);
        let item = Arc::new(item);

        let mut g = Graph::new();
        let batch = g.placeholder("batch");
        let sparse = g.get_attr(batch, "sparse");
        let shifted = g.call_module("preproc", vec![sparse.into()]);
        let user_out = g.call_module("ebc_user", vec![shifted.into()]);
        let item_out = g.call_module("ebc_item", vec![shifted.into()]);
        g.output(Argument::List(vec![user_out.into(), item_out.into()]));

        let user_module: Arc<dyn Module> = user.clone();
        let item_module: Arc<dyn Module> = item.clone();
        let root = Composite::new("SparseArch", g)
            .with_child("preproc", shift_ids(&aux_calls))
            .with_child("ebc_user", user_module)
            .with_child("ebc_item", item_module);
        let model = Arc::new(GraphModel::new(Arc::new(root)).unwrap());

        TwoTableModel {
            model,
            user,
            item,
            aux_calls,
            log,
        }
    }

    pub fn aux_calls(&self) -> usize {
        self.aux_calls.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Batches
// ============================================================================

/// Record with a `sparse` jagged batch over `user` and `item` and a `dense`
/// tensor, deterministic in `seed`.
pub fn synthetic_batch(seed: u64) -> Value {
    let mut rng = StdRng::seed_from_u64(seed);
    let keys = vec!["user".to_string(), "item".to_string()];
    let mut lengths = Vec::with_capacity(keys.len() * BATCH_SIZE);
    let mut ids = Vec::new();
    for _ in &keys {
        for _ in 0..BATCH_SIZE {
            let len = rng.gen_range(0..4usize);
            lengths.push(len);
            for _ in 0..len {
                ids.push(rng.gen_range(0..ROWS) as f32);
            }
        }
    }
    let sparse = KeyedJaggedTensor::from_lengths(keys, Tensor::from_slice(&ids), lengths).unwrap();
    let dense: Vec<f32> = (0..BATCH_SIZE * 2).map(|_| rng.gen::<f32>()).collect();
    let dense = Tensor::from_vec(dense, vec![BATCH_SIZE, 2]).unwrap();
    Value::Record(
        Record::new("Batch")
            .with_field("sparse", sparse)
            .with_field("dense", dense),
    )
}

pub fn synthetic_batches(n: usize) -> Vec<Value> {
    (0..n as u64).map(|i| synthetic_batch(1000 + i)).collect()
}

// ============================================================================
// Training loops
// ============================================================================

/// Start the next batch, then run the forward of the current one. The
/// forward hook waits for the started batch and advances the window.
pub fn run_pipelined(sdd: &SparseDataDist, batches: Vec<Value>) -> PipelineResult<Vec<Value>> {
    run_pipelined_logged(sdd, batches, None)
}

pub fn run_pipelined_logged(
    sdd: &SparseDataDist,
    batches: Vec<Value>,
    log: Option<&EventLog>,
) -> PipelineResult<Vec<Value>> {
    let semi_sync = sdd.config().forward_variant.is_semi_synchronous();
    let mut source = batches.into_iter();
    let Some(first) = source.next() else {
        return Ok(Vec::new());
    };
    let mut current = sdd.start_communication(first)?;
    sdd.wait_fill_callback()?;

    let mut outputs = Vec::new();
    loop {
        let next = match source.next() {
            Some(batch) => Some(sdd.start_communication(batch)?),
            None => {
                sdd.data_exhausted()?;
                None
            }
        };
        if semi_sync {
            sdd.start_embedding_lookup()?;
        }
        if let Some(log) = log {
            log.push(Event::Forward(outputs.len()));
        }
        outputs.push(sdd.model().forward(&[current])?);
        match next {
            Some(batch) => current = batch,
            None => break,
        }
    }
    Ok(outputs)
}

/// Same batches through a [`StagedPipeline`] built from the orchestrator's
/// stages.
pub fn run_staged(
    sdd: &SparseDataDist,
    device: Device,
    batches: Vec<Value>,
) -> PipelineResult<Vec<Value>> {
    let stages = train_pipeline_stages(sdd, device, true, None);
    let mut pipeline = StagedPipeline::new(stages, batches.into_iter(), Arc::clone(sdd.runtime()))?;
    let mut outputs = Vec::new();
    while let Some(batch) = pipeline.progress()? {
        outputs.push(sdd.model().forward(&[batch])?);
    }
    Ok(outputs)
}

/// Outputs of a fresh, never pipelined copy of the model.
pub fn eager_outputs(batches: &[Value]) -> Vec<Value> {
    let fx = TwoTableModel::new();
    batches
        .iter()
        .map(|b| fx.model.forward(&[b.clone()]).unwrap())
        .collect()
}

/// Structural equality with bitwise comparison of tensor data.
pub fn bit_identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Tensor(x), Value::Tensor(y)) => x.bit_eq(y),
        (Value::Keyed(x), Value::Keyed(y)) => {
            x.keys() == y.keys()
                && x.length_per_key() == y.length_per_key()
                && x.values().bit_eq(y.values())
        }
        (Value::List(xs), Value::List(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| bit_identical(x, y))
        }
        (Value::Dict(xs), Value::Dict(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys)
                    .all(|((kx, x), (ky, y))| kx == ky && bit_identical(x, y))
        }
        _ => a == b,
    }
}
