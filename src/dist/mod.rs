//! Communication contracts between the pipeline and sharded modules
//!
//! Input distribution is a two-stage exchange. `input_dist` issues the splits
//! exchange and returns a [`SplitsAwaitable`]; waiting on it yields a tensors
//! request whose own wait delivers the module's share of the batch. The
//! pipeline fuses splits requests that share a process group and waits them
//! together.

pub mod local;

use std::any::Any;
use std::collections::BTreeMap;

use crate::backend::Stream;
use crate::error::{PipelineError, PipelineResult};
use crate::value::{Kwargs, Value};

pub use local::{EmbeddingTable, LocalEmbeddingBagCollection};

/// Logical group of workers taking part in a collective.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessGroup {
    name: String,
    rank: usize,
    world_size: usize,
}

impl ProcessGroup {
    pub fn new(name: impl Into<String>, rank: usize, world_size: usize) -> PipelineResult<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(PipelineError::InvalidConfiguration(format!(
                "rank {} is not valid for world size {}",
                rank, world_size
            )));
        }
        Ok(ProcessGroup {
            name: name.into(),
            rank,
            world_size,
        })
    }

    /// Group containing only the calling worker.
    pub fn single(name: impl Into<String>) -> Self {
        ProcessGroup {
            name: name.into(),
            rank: 0,
            world_size: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }
}

/// Handle to a result that may not have been produced yet.
pub trait Awaitable<T>: Send {
    /// Block the issuing stream until the result is available.
    fn wait(self: Box<Self>) -> PipelineResult<T>;
}

/// Deferred value, materialised on first use.
pub type LazyAwaitable = Box<dyn Awaitable<Value>>;

/// Second stage of input distribution.
pub type TensorsRequest = LazyAwaitable;

/// Result that is already available.
pub struct Ready<T>(pub T);

impl<T: Send> Awaitable<T> for Ready<T> {
    fn wait(self: Box<Self>) -> PipelineResult<T> {
        Ok(self.0)
    }
}

/// Result produced by running a closure at wait time.
pub struct Deferred<F>(F);

impl<F> Deferred<F> {
    pub fn new(f: F) -> Self {
        Deferred(f)
    }
}

impl<T, F> Awaitable<T> for Deferred<F>
where
    F: FnOnce() -> PipelineResult<T> + Send,
{
    fn wait(self: Box<Self>) -> PipelineResult<T> {
        (self.0)()
    }
}

/// First stage of input distribution.
pub trait SplitsAwaitable: Awaitable<TensorsRequest> {
    /// Group the exchange runs on. Requests on the same group are fused.
    fn process_group(&self) -> Option<&ProcessGroup> {
        None
    }
}

/// Splits requests of several modules sharing one process group.
pub struct FusedSplitsAwaitable {
    requests: Vec<Box<dyn SplitsAwaitable>>,
    pg: Option<ProcessGroup>,
}

impl FusedSplitsAwaitable {
    pub fn new(requests: Vec<Box<dyn SplitsAwaitable>>, pg: Option<ProcessGroup>) -> Self {
        FusedSplitsAwaitable { requests, pg }
    }

    pub fn process_group(&self) -> Option<&ProcessGroup> {
        self.pg.as_ref()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl Awaitable<Vec<TensorsRequest>> for FusedSplitsAwaitable {
    fn wait(self: Box<Self>) -> PipelineResult<Vec<TensorsRequest>> {
        self.requests.into_iter().map(|r| r.wait()).collect()
    }
}

/// Group splits requests by process group.
///
/// Requests are visited in module-name order, so groups are ordered by their
/// smallest module name and names within a group are sorted. The order in
/// which callers inserted requests has no effect.
pub fn fuse_splits(
    requests: BTreeMap<String, Box<dyn SplitsAwaitable>>,
) -> Vec<(Vec<String>, FusedSplitsAwaitable)> {
    let mut groups: Vec<(Option<ProcessGroup>, Vec<String>, Vec<Box<dyn SplitsAwaitable>>)> =
        Vec::new();
    for (name, request) in requests {
        let pg = request.process_group().cloned();
        match groups.iter_mut().find(|(g, _, _)| *g == pg) {
            Some((_, names, reqs)) => {
                names.push(name);
                reqs.push(request);
            }
            None => groups.push((pg, vec![name], vec![request])),
        }
    }
    groups
        .into_iter()
        .map(|(pg, names, reqs)| (names, FusedSplitsAwaitable::new(reqs, pg)))
        .collect()
}

/// Per-call state a sharded module threads from input distribution to
/// output distribution.
pub trait ModuleContext: Send {
    fn record_stream(&self, _stream: &Stream) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Context for modules that keep no per-call state.
#[derive(Debug, Default)]
pub struct EmptyContext;

impl ModuleContext for EmptyContext {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Pending output of compute and output distribution.
pub enum OutputDist {
    Embeddings(LazyAwaitable),
    /// Managed-collision modules also return the remapped input batch.
    WithRemap {
        embeddings: LazyAwaitable,
        remapped: LazyAwaitable,
    },
}

impl OutputDist {
    /// Single deferred value; remapping modules yield `[embeddings, remapped]`.
    pub fn into_lazy(self) -> LazyAwaitable {
        match self {
            OutputDist::Embeddings(lazy) => lazy,
            OutputDist::WithRemap {
                embeddings,
                remapped,
            } => Box::new(Deferred::new(move || -> PipelineResult<Value> {
                Ok(Value::List(vec![embeddings.wait()?, remapped.wait()?]))
            })),
        }
    }
}

/// Capability of modules whose parameters are split across workers.
pub trait ShardedModule: Send + Sync {
    fn create_context(&self) -> Box<dyn ModuleContext>;

    /// Start redistributing this worker's share of the inputs.
    fn input_dist(
        &self,
        ctx: &mut dyn ModuleContext,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> PipelineResult<Box<dyn SplitsAwaitable>>;

    fn compute_and_output_dist(
        &self,
        ctx: &mut dyn ModuleContext,
        data: Value,
    ) -> PipelineResult<OutputDist>;

    /// Move distributed inputs into faster memory ahead of compute.
    fn prefetch(
        &self,
        _ctx: &mut dyn ModuleContext,
        _data: &Value,
        _forward_stream: Option<&Stream>,
    ) -> PipelineResult<()> {
        Ok(())
    }
}

/// Run every phase of a sharded module back to back.
pub fn run_sharded_eager(
    module: &dyn ShardedModule,
    args: &[Value],
    kwargs: &Kwargs,
) -> PipelineResult<Value> {
    let mut ctx = module.create_context();
    let splits = module.input_dist(ctx.as_mut(), args, kwargs)?;
    let data = splits.wait()?.wait()?;
    module
        .compute_and_output_dist(ctx.as_mut(), data)?
        .into_lazy()
        .wait()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Splits {
        pg: Option<ProcessGroup>,
        payload: i64,
    }

    impl Awaitable<TensorsRequest> for Splits {
        fn wait(self: Box<Self>) -> PipelineResult<TensorsRequest> {
            Ok(Box::new(Ready(Value::Int(self.payload))))
        }
    }

    impl SplitsAwaitable for Splits {
        fn process_group(&self) -> Option<&ProcessGroup> {
            self.pg.as_ref()
        }
    }

    fn splits(pg: Option<&str>, payload: i64) -> Box<dyn SplitsAwaitable> {
        Box::new(Splits {
            pg: pg.map(ProcessGroup::single),
            payload,
        })
    }

    #[test]
    fn test_process_group_validation() {
        assert!(ProcessGroup::new("pg", 2, 2).is_err());
        assert!(ProcessGroup::new("pg", 0, 0).is_err());
        let pg = ProcessGroup::new("pg", 1, 4).unwrap();
        assert_eq!((pg.rank(), pg.world_size()), (1, 4));
    }

    #[test]
    fn test_fuse_splits_groups_by_process_group() {
        let mut requests = BTreeMap::new();
        requests.insert("a".to_string(), splits(Some("pg0"), 1));
        requests.insert("b".to_string(), splits(Some("pg1"), 2));
        requests.insert("c".to_string(), splits(Some("pg0"), 3));
        requests.insert("d".to_string(), splits(None, 4));

        let fused = fuse_splits(requests);
        let names: Vec<Vec<String>> = fused.iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(
            names,
            vec![
                vec!["a".to_string(), "c".to_string()],
                vec!["b".to_string()],
                vec!["d".to_string()],
            ]
        );

        let (_, first) = fused.into_iter().next().unwrap();
        let tensors = Box::new(first).wait().unwrap();
        let values: Vec<Value> = tensors.into_iter().map(|t| t.wait().unwrap()).collect();
        assert_eq!(values, vec![Value::Int(1), Value::Int(3)]);
    }

    #[test]
    fn test_fuse_splits_orders_groups_by_module_name() {
        let mut requests = BTreeMap::new();
        requests.insert("z_ebc".to_string(), splits(Some("pg0"), 1));
        requests.insert("m_ebc".to_string(), splits(None, 2));
        requests.insert("a_ebc".to_string(), splits(Some("pg1"), 3));
        requests.insert("b_ebc".to_string(), splits(Some("pg0"), 4));

        let names: Vec<Vec<String>> = fuse_splits(requests).into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                vec!["a_ebc".to_string()],
                vec!["b_ebc".to_string(), "z_ebc".to_string()],
                vec!["m_ebc".to_string()],
            ]
        );
    }

    #[test]
    fn test_output_dist_with_remap_joins() {
        let out = OutputDist::WithRemap {
            embeddings: Box::new(Ready(Value::Int(1))),
            remapped: Box::new(Deferred::new(|| -> PipelineResult<Value> { Ok(Value::Int(2)) })),
        };
        assert_eq!(
            out.into_lazy().wait().unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
    }
}
