//! Per-batch training context.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::ContextVersion;
use crate::dist::{FusedSplitsAwaitable, ModuleContext, OutputDist, SplitsAwaitable, TensorsRequest};
use crate::tensor::Tensor;
use crate::value::Value;

/// Bookkeeping for one in-flight batch, keyed by sharded-module path.
///
/// Negative indices mark throwaway contexts used while priming the window.
pub struct TrainPipelineContext {
    pub index: i64,
    pub version: ContextVersion,
    pub input_dist_splits_requests: BTreeMap<String, Box<dyn SplitsAwaitable>>,
    pub fused_splits_awaitables: Vec<(Vec<String>, FusedSplitsAwaitable)>,
    pub input_dist_tensors_requests: BTreeMap<String, TensorsRequest>,
    pub module_contexts: BTreeMap<String, Box<dyn ModuleContext>>,
    /// Legacy contexts park module contexts here until the splits are waited.
    pub module_contexts_next_batch: BTreeMap<String, Box<dyn ModuleContext>>,
    pub postproc_fwd_results: BTreeMap<String, Value>,
    pub module_input_post_prefetch: BTreeMap<String, Value>,
    pub module_contexts_post_prefetch: BTreeMap<String, Box<dyn ModuleContext>>,
    pub embedding_a2a_requests: BTreeMap<String, OutputDist>,
    /// Per intercepted call: the embedding tensors before detaching.
    pub embedding_tensors: Vec<Vec<Tensor>>,
    /// Per intercepted call, per tensor: the features it holds.
    pub embedding_features: Vec<Vec<Vec<String>>>,
    pub detached_embedding_tensors: Vec<Vec<Tensor>>,
}

impl TrainPipelineContext {
    pub fn new(index: i64, version: ContextVersion) -> Self {
        TrainPipelineContext {
            index,
            version,
            input_dist_splits_requests: BTreeMap::new(),
            fused_splits_awaitables: Vec::new(),
            input_dist_tensors_requests: BTreeMap::new(),
            module_contexts: BTreeMap::new(),
            module_contexts_next_batch: BTreeMap::new(),
            postproc_fwd_results: BTreeMap::new(),
            module_input_post_prefetch: BTreeMap::new(),
            module_contexts_post_prefetch: BTreeMap::new(),
            embedding_a2a_requests: BTreeMap::new(),
            embedding_tensors: Vec::new(),
            embedding_features: Vec::new(),
            detached_embedding_tensors: Vec::new(),
        }
    }

    pub fn is_throwaway(&self) -> bool {
        self.index < 0
    }

    /// Names with a pending tensors request.
    pub fn tensors_request_names(&self) -> BTreeSet<String> {
        self.input_dist_tensors_requests.keys().cloned().collect()
    }

    pub fn module_context_names(&self) -> BTreeSet<String> {
        self.module_contexts.keys().cloned().collect()
    }

    pub fn fused_request_names(&self) -> BTreeSet<String> {
        self.fused_splits_awaitables
            .iter()
            .flat_map(|(names, _)| names.iter().cloned())
            .collect()
    }
}

impl fmt::Debug for TrainPipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn keys<T>(map: &BTreeMap<String, T>) -> Vec<&String> {
            map.keys().collect()
        }
        f.debug_struct("TrainPipelineContext")
            .field("index", &self.index)
            .field("version", &self.version)
            .field("splits", &keys(&self.input_dist_splits_requests))
            .field("fused", &self.fused_request_names())
            .field("tensors", &keys(&self.input_dist_tensors_requests))
            .field("module_contexts", &keys(&self.module_contexts))
            .field("module_contexts_next_batch", &keys(&self.module_contexts_next_batch))
            .field("postproc", &keys(&self.postproc_fwd_results))
            .field("input_post_prefetch", &keys(&self.module_input_post_prefetch))
            .field("contexts_post_prefetch", &keys(&self.module_contexts_post_prefetch))
            .field("embedding_a2a", &keys(&self.embedding_a2a_requests))
            .field("embedding_tensors", &self.embedding_tensors.len())
            .finish()
    }
}
