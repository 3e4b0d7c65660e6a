//! Single-worker sharded embedding collection.
//!
//! Every table lives on this worker and the "exchange" is a loopback, so the
//! collection runs without a real collective backend while still going
//! through every phase of the sharded protocol.
//!
//! # Usage
//!
//! ```rust,ignore
//! let ebc = LocalEmbeddingBagCollection::new(vec![
//!     EmbeddingTable::new("t_user", "user_id", 100, 8),
//! ]);
//! let pooled = ebc.forward(&[Value::KeyedJagged(kjt)], &Kwargs::new())?;
//! ```

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::trace;

use crate::backend::{Device, Stream, StreamId};
use crate::dist::{
    run_sharded_eager, Awaitable, Deferred, ModuleContext, OutputDist, ProcessGroup, Ready,
    ShardedModule, SplitsAwaitable, TensorsRequest,
};
use crate::error::{PipelineError, PipelineResult};
use crate::model::Module;
use crate::tensor::{KeyedJaggedTensor, KeyedTensor, Tensor};
use crate::value::{Kwargs, Value};

/// Embedding table pooled over the ids of one feature.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    name: String,
    feature: String,
    weights: Tensor,
}

impl EmbeddingTable {
    /// Table with deterministic weights: `w[r][d] = ((r * dim + d) % 7) * 0.1`.
    pub fn new(name: &str, feature: &str, rows: usize, dim: usize) -> Self {
        let data: Vec<f32> = (0..rows * dim).map(|i| (i % 7) as f32 * 0.1).collect();
        EmbeddingTable {
            name: name.to_string(),
            feature: feature.to_string(),
            weights: Tensor::from_slice(&data)
                .reshape(vec![rows, dim])
                .unwrap_or_else(|_| Tensor::zeros(vec![rows, dim])),
        }
    }

    pub fn with_weights(name: &str, feature: &str, weights: Tensor) -> PipelineResult<Self> {
        if weights.shape().len() != 2 {
            return Err(PipelineError::TypeMismatch {
                expected: "[rows, dim] weights".to_string(),
                got: format!("{:?}", weights.shape()),
            });
        }
        Ok(EmbeddingTable {
            name: name.to_string(),
            feature: feature.to_string(),
            weights,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn rows(&self) -> usize {
        self.weights.shape()[0]
    }

    pub fn dim(&self) -> usize {
        self.weights.shape()[1]
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    /// Sum of the rows named by `ids`.
    fn pool(&self, ids: &[f32], out: &mut Vec<f32>) -> PipelineResult<()> {
        let dim = self.dim();
        let start = out.len();
        out.resize(start + dim, 0.0);
        for &id in ids {
            let row = id as i64;
            if id < 0.0 || id.fract() != 0.0 || row as usize >= self.rows() {
                return Err(PipelineError::IndexOutOfRange {
                    index: row,
                    len: self.rows(),
                });
            }
            let row = row as usize;
            let weights = &self.weights.data()[row * dim..(row + 1) * dim];
            for (acc, w) in out[start..].iter_mut().zip(weights) {
                *acc += w;
            }
        }
        Ok(())
    }
}

/// Per-call state of [`LocalEmbeddingBagCollection`].
#[derive(Debug, Default)]
pub struct LocalContext {
    batch_size: usize,
    recorded_streams: Mutex<Vec<StreamId>>,
    prefetched: bool,
}

impl LocalContext {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn recorded_streams(&self) -> Vec<StreamId> {
        self.recorded_streams
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn prefetched(&self) -> bool {
        self.prefetched
    }
}

impl ModuleContext for LocalContext {
    fn record_stream(&self, stream: &Stream) {
        if let Ok(mut recorded) = self.recorded_streams.lock() {
            if !recorded.contains(&stream.id()) {
                recorded.push(stream.id());
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl LocalContext {
    fn downcast(ctx: &mut dyn ModuleContext) -> PipelineResult<&mut LocalContext> {
        ctx.as_any_mut()
            .downcast_mut::<LocalContext>()
            .ok_or_else(|| PipelineError::TypeMismatch {
                expected: "LocalContext".to_string(),
                got: "foreign module context".to_string(),
            })
    }
}

struct LoopbackSplits {
    pg: ProcessGroup,
    features: KeyedJaggedTensor,
    device: Device,
}

impl Awaitable<TensorsRequest> for LoopbackSplits {
    fn wait(self: Box<Self>) -> PipelineResult<TensorsRequest> {
        let LoopbackSplits {
            features, device, ..
        } = *self;
        Ok(Box::new(Deferred::new(move || -> PipelineResult<Value> {
            Ok(Value::KeyedJagged(features.to_device(device)))
        })))
    }
}

impl SplitsAwaitable for LoopbackSplits {
    fn process_group(&self) -> Option<&ProcessGroup> {
        Some(&self.pg)
    }
}

/// Sum-pooled embedding bags, one table per feature, all owned by this
/// worker.
#[derive(Debug)]
pub struct LocalEmbeddingBagCollection {
    tables: Vec<EmbeddingTable>,
    pg: ProcessGroup,
    device: Device,
    remap: bool,
    contexts_created: AtomicUsize,
    input_dists: AtomicUsize,
    prefetches: AtomicUsize,
}

impl LocalEmbeddingBagCollection {
    pub fn new(tables: Vec<EmbeddingTable>) -> Self {
        LocalEmbeddingBagCollection {
            tables,
            pg: ProcessGroup::single("default"),
            device: Device::Cpu,
            remap: false,
            contexts_created: AtomicUsize::new(0),
            input_dists: AtomicUsize::new(0),
            prefetches: AtomicUsize::new(0),
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_process_group(mut self, pg: ProcessGroup) -> Self {
        self.pg = pg;
        self
    }

    /// Also return the input batch from output distribution, the way
    /// managed-collision collections return their remapped ids.
    pub fn with_remap(mut self, remap: bool) -> Self {
        self.remap = remap;
        self
    }

    pub fn tables(&self) -> &[EmbeddingTable] {
        &self.tables
    }

    pub fn features(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.feature.clone()).collect()
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }

    pub fn input_dist_count(&self) -> usize {
        self.input_dists.load(Ordering::SeqCst)
    }

    pub fn prefetch_count(&self) -> usize {
        self.prefetches.load(Ordering::SeqCst)
    }

    fn lookup(&self, features: &KeyedJaggedTensor) -> PipelineResult<KeyedTensor> {
        let batch = features.stride();
        let dims: Vec<usize> = self.tables.iter().map(EmbeddingTable::dim).collect();
        let width: usize = dims.iter().sum();
        let mut data = Vec::with_capacity(batch * width);
        for sample in 0..batch {
            for (k, table) in self.tables.iter().enumerate() {
                table.pool(features.bag(k, sample), &mut data)?;
            }
        }
        let values = Tensor::from_vec(data, vec![batch, width])?.to_device(self.device);
        KeyedTensor::new(self.features(), dims, values)
    }
}

impl ShardedModule for LocalEmbeddingBagCollection {
    fn create_context(&self) -> Box<dyn ModuleContext> {
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        Box::new(LocalContext::default())
    }

    fn input_dist(
        &self,
        ctx: &mut dyn ModuleContext,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> PipelineResult<Box<dyn SplitsAwaitable>> {
        let input = kwargs
            .get("features")
            .or_else(|| args.first())
            .ok_or_else(|| PipelineError::GraphError("embedding bags need features".to_string()))?;
        let features = input.as_kjt()?.select(&self.features())?;
        LocalContext::downcast(ctx)?.batch_size = features.stride();
        self.input_dists.fetch_add(1, Ordering::SeqCst);
        trace!(pg = self.pg.name(), keys = features.keys().len(), "loopback input dist");
        Ok(Box::new(LoopbackSplits {
            pg: self.pg.clone(),
            features,
            device: self.device,
        }))
    }

    fn compute_and_output_dist(
        &self,
        ctx: &mut dyn ModuleContext,
        data: Value,
    ) -> PipelineResult<OutputDist> {
        let local = LocalContext::downcast(ctx)?;
        let features = data.as_kjt()?;
        if features.stride() != local.batch_size {
            return Err(PipelineError::TypeMismatch {
                expected: format!("batch of {}", local.batch_size),
                got: format!("batch of {}", features.stride()),
            });
        }
        let embeddings = Value::Keyed(self.lookup(features)?);
        if self.remap {
            Ok(OutputDist::WithRemap {
                embeddings: Box::new(Ready(embeddings)),
                remapped: Box::new(Ready(data)),
            })
        } else {
            Ok(OutputDist::Embeddings(Box::new(Ready(embeddings))))
        }
    }

    fn prefetch(
        &self,
        ctx: &mut dyn ModuleContext,
        _data: &Value,
        _forward_stream: Option<&Stream>,
    ) -> PipelineResult<()> {
        LocalContext::downcast(ctx)?.prefetched = true;
        self.prefetches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Module for LocalEmbeddingBagCollection {
    fn type_name(&self) -> &str {
        "EmbeddingBagCollection"
    }

    fn forward(&self, args: &[Value], kwargs: &Kwargs) -> PipelineResult<Value> {
        run_sharded_eager(self, args, kwargs)
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        self.tables
            .iter()
            .map(|t| (format!("embedding_bags.{}.weight", t.name), t.weights.clone()))
            .collect()
    }

    fn as_sharded(&self) -> Option<&dyn ShardedModule> {
        Some(self)
    }
}
