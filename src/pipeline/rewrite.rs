//! Decide which sharded modules can be pipelined and how to rebuild their
//! inputs from a raw batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{Device, DeviceRuntime, Stream};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::graph::{parse_ph_key, Access, Argument, Function, Graph, Node, Op, SymbolicTracer, Tracer};
use crate::model::{has_sharded_descendant, named_parameters, GraphModel, Module, ModuleCompiler};
use crate::pipeline::arg_info::{ArgInfo, ArgInfoStep, CallArgs};
use crate::pipeline::forward::PipelinedForward;
use crate::pipeline::postproc::PipelinedPostproc;
use crate::value::{Index, Value};

/// Streams and runtime shared by everything the rewrite installs.
#[derive(Clone)]
pub struct RewriteEnv {
    pub runtime: Arc<dyn DeviceRuntime>,
    pub device: Device,
    pub data_dist_stream: Option<Stream>,
    pub prefetch_stream: Option<Stream>,
    pub default_stream: Option<Stream>,
}

/// What one rewrite pass installed.
#[derive(Default)]
pub struct RewriteOutcome {
    /// In call order.
    pub forwards: Vec<Arc<PipelinedForward>>,
    pub postprocs: BTreeMap<String, Arc<PipelinedPostproc>>,
    pub compiled: BTreeMap<String, Arc<dyn Module>>,
    pub non_pipelined: Vec<String>,
}

impl RewriteOutcome {
    pub fn pipelined_names(&self) -> Vec<String> {
        self.forwards.iter().map(|f| f.name().to_string()).collect()
    }
}

impl std::fmt::Debug for RewriteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewriteOutcome")
            .field("pipelined", &self.pipelined_names())
            .field("postprocs", &self.postprocs.keys().collect::<Vec<_>>())
            .field("compiled", &self.compiled.keys().collect::<Vec<_>>())
            .field("non_pipelined", &self.non_pipelined)
            .finish()
    }
}

impl std::fmt::Debug for RewriteEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewriteEnv")
            .field("device", &self.device)
            .field("data_dist_stream", &self.data_dist_stream)
            .field("prefetch_stream", &self.prefetch_stream)
            .field("default_stream", &self.default_stream)
            .finish()
    }
}

/// Walks call-site arguments backwards through the traced graph.
pub struct ArgResolver<'a> {
    graph: &'a Graph,
    model: &'a GraphModel,
    config: &'a PipelineConfig,
    env: &'a RewriteEnv,
    postprocs: BTreeMap<String, Arc<PipelinedPostproc>>,
}

impl<'a> ArgResolver<'a> {
    pub fn new(
        graph: &'a Graph,
        model: &'a GraphModel,
        config: &'a PipelineConfig,
        env: &'a RewriteEnv,
    ) -> Self {
        ArgResolver {
            graph,
            model,
            config,
            env,
            postprocs: BTreeMap::new(),
        }
    }

    pub fn postprocs(&self) -> &BTreeMap<String, Arc<PipelinedPostproc>> {
        &self.postprocs
    }

    pub fn into_postprocs(self) -> BTreeMap<String, Arc<PipelinedPostproc>> {
        self.postprocs
    }

    /// Descriptors for every argument of `node` that could be resolved, and
    /// how many that was.
    pub fn resolve_node_args(
        &mut self,
        node: &Node,
        for_postproc: bool,
    ) -> PipelineResult<(CallArgs, usize)> {
        let mut found = 0;
        let mut args = Vec::with_capacity(node.args.len());
        for arg in &node.args {
            if let Some(info) = self.resolve_top_level(arg, for_postproc)? {
                args.push(info);
                found += 1;
            }
        }
        let mut kwargs = BTreeMap::new();
        for (name, arg) in &node.kwargs {
            if let Some(info) = self.resolve_top_level(arg, for_postproc)? {
                kwargs.insert(name.clone(), info);
                found += 1;
            }
        }
        Ok((CallArgs::new(args, kwargs), found))
    }

    fn resolve_top_level(&mut self, arg: &Argument, for_postproc: bool) -> PipelineResult<Option<ArgInfo>> {
        if !for_postproc && *arg == Argument::none() {
            return Ok(Some(ArgInfo::from_steps(vec![ArgInfoStep::Constant(Value::None)])));
        }
        self.resolve_arg(arg)
    }

    /// Descriptor rebuilding `arg`, or `None` when its producer cannot be
    /// reproduced from the batch alone.
    pub fn resolve_arg(&mut self, arg: &Argument) -> PipelineResult<Option<ArgInfo>> {
        let mut info = ArgInfo::new();
        let mut current = arg.clone();
        loop {
            let id = match &current {
                Argument::Node(id) => *id,
                other => return self.resolve_constant(other, info),
            };
            let graph = self.graph;
            let node = graph.node(id)?;
            match &node.op {
                Op::Placeholder { ph_key } => {
                    match ph_key {
                        Some(key) => {
                            info.prepend_steps(parse_ph_key(key).into_iter().map(access_step));
                        }
                        None => {
                            info.add_step(ArgInfoStep::Noop);
                        }
                    }
                    return Ok(Some(info));
                }
                Op::CallModule(target) => return self.resolve_module(node, target, info),
                Op::CallFunction(Function::GetAttr) => {
                    let Some(attr) = const_str(node.args.get(1)) else {
                        return Ok(None);
                    };
                    info.add_step(ArgInfoStep::GetAttr(attr));
                    current = first_arg(node);
                }
                Op::CallFunction(Function::GetItem) => {
                    let Some(index) = const_index(node.args.get(1)) else {
                        return Ok(None);
                    };
                    info.add_step(ArgInfoStep::GetItem(index));
                    current = first_arg(node);
                }
                Op::CallFunction(Function::TreeUnflatten) => {
                    let leaf = match (info.steps().first(), node.args.first()) {
                        (Some(ArgInfoStep::GetItem(Index::Int(i))), Some(Argument::List(leaves))) => {
                            usize::try_from(*i).ok().and_then(|i| leaves.get(i)).cloned()
                        }
                        _ => None,
                    };
                    let Some(leaf) = leaf else {
                        return Ok(None);
                    };
                    info.pop_front();
                    current = leaf;
                }
                Op::CallFunction(Function::KeyedJaggedTensor) => {
                    let inputs = node.args.iter().chain(node.kwargs.values());
                    for input in inputs {
                        if self.depends_on_module_call(input)? {
                            return Ok(None);
                        }
                    }
                    current = match node.kwargs.get("values").or_else(|| node.args.get(1)) {
                        Some(values) => values.clone(),
                        None => return Ok(None),
                    };
                }
                Op::CallMethod(method) if method == "get" => {
                    let Some(index) = const_index(node.args.get(1)) else {
                        return Ok(None);
                    };
                    info.add_step(ArgInfoStep::GetItem(index));
                    current = first_arg(node);
                }
                _ => {
                    debug!(node = %node.name, "argument producer cannot be rebuilt from the batch");
                    return Ok(None);
                }
            }
        }
    }

    fn resolve_constant(&mut self, arg: &Argument, mut info: ArgInfo) -> PipelineResult<Option<ArgInfo>> {
        let step = match arg {
            Argument::Const(value) => ArgInfoStep::Constant(value.clone()),
            Argument::List(items) => {
                let mut nested = Vec::with_capacity(items.len());
                for item in items {
                    match self.resolve_arg(item)? {
                        Some(i) => nested.push(i),
                        None => return Ok(None),
                    }
                }
                ArgInfoStep::ListOf(nested)
            }
            Argument::Dict(items) => {
                let mut nested = BTreeMap::new();
                for (key, item) in items {
                    match self.resolve_arg(item)? {
                        Some(i) => {
                            nested.insert(key.clone(), i);
                        }
                        None => return Ok(None),
                    }
                }
                ArgInfoStep::DictOf(nested)
            }
            Argument::Node(_) => return Ok(None),
        };
        info.add_step(step);
        Ok(Some(info))
    }

    fn resolve_module(&mut self, node: &Node, fqn: &str, mut info: ArgInfo) -> PipelineResult<Option<ArgInfo>> {
        if !self.config.pipeline_postproc {
            warn!(
                module = fqn,
                "found a module call on an input path; enable pipeline_postproc to pipeline it"
            );
            return Ok(None);
        }
        if let Some(existing) = self.postprocs.get(fqn) {
            info.add_step(ArgInfoStep::Postproc(Arc::clone(existing)));
            return Ok(Some(info));
        }

        let module = match self.model.get_submodule(fqn) {
            Ok(m) => m,
            Err(e) => {
                warn!(module = fqn, error = %e, "called module is not a submodule of the model");
                return Ok(None);
            }
        };
        if module.as_sharded().is_some() {
            debug!(module = fqn, "input comes from another sharded module");
            return Ok(None);
        }
        if !named_parameters(module.as_ref(), "").is_empty() {
            warn!(module = fqn, "module has trainable parameters and cannot be pipelined");
            return Ok(None);
        }
        let total = node.args.len() + node.kwargs.len();
        if total == 0 {
            debug!(module = fqn, "module takes no inputs and cannot be pipelined as a postproc");
            return Ok(None);
        }

        let (args, found) = self.resolve_node_args(node, true)?;
        if found != total {
            warn!(
                module = fqn,
                found,
                total,
                "postproc inputs cannot all be rebuilt from the batch"
            );
            return Ok(None);
        }
        info!(module = fqn, "module will be pipelined as an input postproc");
        let postproc = Arc::new(PipelinedPostproc::new(
            fqn,
            module,
            args,
            Arc::clone(&self.env.runtime),
            self.env.data_dist_stream.clone(),
            self.env.default_stream.clone(),
        ));
        self.postprocs.insert(fqn.to_string(), Arc::clone(&postproc));
        info.add_step(ArgInfoStep::Postproc(postproc));
        Ok(Some(info))
    }

    fn depends_on_module_call(&self, arg: &Argument) -> PipelineResult<bool> {
        for id in arg.nodes() {
            let node = self.graph.node(id)?;
            if matches!(node.op, Op::CallModule(_)) {
                return Ok(true);
            }
            let inputs = node.args.iter().chain(node.kwargs.values());
            for input in inputs {
                if self.depends_on_module_call(input)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn access_step(access: Access) -> ArgInfoStep {
    match access {
        Access::Attr(attr) => ArgInfoStep::GetAttr(attr),
        Access::Item(index) => ArgInfoStep::GetItem(index),
    }
}

fn first_arg(node: &Node) -> Argument {
    node.args.first().cloned().unwrap_or_else(Argument::none)
}

fn const_str(arg: Option<&Argument>) -> Option<String> {
    match arg {
        Some(Argument::Const(Value::Str(s))) => Some(s.clone()),
        _ => None,
    }
}

fn const_index(arg: Option<&Argument>) -> Option<Index> {
    match arg {
        Some(Argument::Const(Value::Int(i))) => Some(Index::Int(*i)),
        Some(Argument::Const(Value::Str(s))) => Some(Index::Key(s.clone())),
        _ => None,
    }
}

/// Non-sharded children of modules that also own sharded modules.
pub fn compile_targets(model: &GraphModel) -> Vec<(String, Arc<dyn Module>)> {
    let mut targets = Vec::new();
    for (fqn, module) in model.named_modules() {
        if module.as_sharded().is_some() {
            continue;
        }
        let children = module.named_children();
        if !children.iter().any(|(_, c)| has_sharded_descendant(c.as_ref())) {
            continue;
        }
        for (name, child) in children {
            if !has_sharded_descendant(child.as_ref()) {
                let path = if fqn.is_empty() { name } else { format!("{}.{}", fqn, name) };
                targets.push((path, child));
            }
        }
    }
    targets
}

/// Trace `model`, pick the pipelinable sharded modules and build their
/// replacement forwards.
pub fn rewrite_model(
    model: &GraphModel,
    config: &PipelineConfig,
    env: &RewriteEnv,
    compiler: Option<&dyn ModuleCompiler>,
) -> PipelineResult<RewriteOutcome> {
    let sharded: BTreeMap<String, Arc<dyn Module>> = model
        .named_modules()
        .into_iter()
        .filter(|(_, m)| m.as_sharded().is_some())
        .collect();

    let graph = SymbolicTracer::for_model(model.root()).trace(model.root())?;
    let variant = config.effective_forward();
    let forward_stream = match variant {
        crate::config::EffectiveForward::Prefetch => env.prefetch_stream.clone(),
        _ => env.data_dist_stream.clone(),
    };

    let mut resolver = ArgResolver::new(&graph, model, config, env);
    let mut forwards: Vec<Arc<PipelinedForward>> = Vec::new();
    let mut non_pipelined: Vec<String> = Vec::new();
    let mut seen = BTreeSet::new();

    for node in graph.nodes() {
        let Op::CallModule(target) = &node.op else {
            continue;
        };
        let Some(module) = sharded.get(target) else {
            continue;
        };
        if !seen.insert(target.clone()) {
            warn!(module = %target, "sharded module is called more than once and cannot be pipelined");
            forwards.retain(|f| f.name() != target);
            if !non_pipelined.contains(target) {
                non_pipelined.push(target.clone());
            }
            continue;
        }
        let total = node.args.len() + node.kwargs.len();
        if total == 0 {
            warn!(module = %target, "sharded module takes no inputs and cannot be pipelined");
            non_pipelined.push(target.clone());
            continue;
        }

        let (args, found) = resolver.resolve_node_args(node, false)?;
        if found == total {
            info!(module = %target, "module will be pipelined");
            forwards.push(Arc::new(PipelinedForward::new(
                target.clone(),
                args,
                Arc::clone(module),
                variant,
                forward_stream.clone(),
                env.device,
            )));
        } else {
            warn!(
                module = %target,
                found,
                total,
                "module could not be pipelined: not every input can be rebuilt from the batch"
            );
            non_pipelined.push(target.clone());
        }
    }

    let mut compiled = BTreeMap::new();
    if config.apply_compile {
        let compiler = compiler.ok_or_else(|| {
            PipelineError::UnsupportedConfiguration(
                "apply_compile is set but no module compiler was supplied".to_string(),
            )
        })?;
        for (fqn, module) in compile_targets(model) {
            // postprocs run through their pipelined wrapper
            if resolver.postprocs().contains_key(&fqn) {
                debug!(module = %fqn, "skipping compilation of a pipelined postproc");
                continue;
            }
            match compiler.compile(&fqn, &module) {
                Ok(replacement) => {
                    info!(module = %fqn, "compiled");
                    compiled.insert(fqn, replacement);
                }
                Err(e) if config.strict_compile => {
                    return Err(PipelineError::CompilationFailed {
                        module: fqn,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(module = %fqn, error = %e, "compilation failed, keeping the module as written");
                }
            }
        }
    }

    if !non_pipelined.is_empty() {
        warn!(
            modules = ?non_pipelined,
            "some sharded modules were not pipelined and will run synchronously"
        );
    }

    Ok(RewriteOutcome {
        forwards,
        postprocs: resolver.into_postprocs(),
        compiled,
        non_pipelined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostRuntime;
    use crate::config::ContextVersion;
    use crate::dist::{EmbeddingTable, LocalEmbeddingBagCollection};
    use crate::model::{Composite, FnCompiler, FnModule};
    use crate::pipeline::context::TrainPipelineContext;
    use crate::tensor::{KeyedJaggedTensor, Tensor};
    use crate::value::Record;

    fn env() -> RewriteEnv {
        RewriteEnv {
            runtime: HostRuntime::shared(),
            device: Device::Cpu,
            data_dist_stream: None,
            prefetch_stream: None,
            default_stream: None,
        }
    }

    fn ebc() -> Arc<dyn Module> {
        Arc::new(LocalEmbeddingBagCollection::new(vec![EmbeddingTable::new("t1", "f1", 8, 2)]))
    }

    fn passthrough() -> Arc<dyn Module> {
        Arc::new(FnModule::new("Identity", |args, _| Ok(args[0].clone())))
    }

    fn parametric() -> Arc<dyn Module> {
        Arc::new(
            FnModule::new("Scale", |args, _| Ok(args[0].clone()))
                .with_parameter("w", Tensor::from_slice(&[1.0])),
        )
    }

    /// `ebc(prep(batch.sparse))`
    fn model_with(prep: Arc<dyn Module>) -> GraphModel {
        let mut g = Graph::new();
        let batch = g.placeholder("batch");
        let sparse = g.get_attr(batch, "sparse");
        let prepped = g.call_module("prep", vec![sparse.into()]);
        let out = g.call_module("ebc", vec![prepped.into()]);
        g.output(out.into());
        GraphModel::new(Arc::new(
            Composite::new("Model", g)
                .with_child("prep", prep)
                .with_child("ebc", ebc()),
        ))
        .unwrap()
    }

    fn batch() -> Value {
        let kjt = KeyedJaggedTensor::from_lengths(
            vec!["f1".to_string()],
            Tensor::from_slice(&[1.0, 2.0]),
            vec![1, 1],
        )
        .unwrap();
        Value::Record(Record::new("Batch").with_field("sparse", kjt))
    }

    #[test]
    fn test_placeholder_path_is_pipelined() {
        let mut g = Graph::new();
        let batch_node = g.placeholder("batch");
        let sparse = g.get_attr(batch_node, "sparse");
        let out = g.call_module("ebc", vec![sparse.into()]);
        g.output(out.into());
        let model = GraphModel::new(Arc::new(Composite::new("Model", g).with_child("ebc", ebc()))).unwrap();

        let outcome = rewrite_model(&model, &PipelineConfig::default(), &env(), None).unwrap();
        assert_eq!(outcome.pipelined_names(), vec!["ebc".to_string()]);
        assert!(outcome.non_pipelined.is_empty());

        let mut ctx = TrainPipelineContext::new(0, ContextVersion::Current);
        let (args, _) = outcome.forwards[0]
            .args()
            .build_args_kwargs(&batch(), &mut ctx)
            .unwrap();
        assert_eq!(args[0], batch().get_attr("sparse").unwrap());
    }

    #[test]
    fn test_postproc_is_discovered() {
        let model = model_with(passthrough());
        let outcome = rewrite_model(&model, &PipelineConfig::default(), &env(), None).unwrap();
        assert_eq!(outcome.pipelined_names(), vec!["ebc".to_string()]);
        assert_eq!(outcome.postprocs.keys().collect::<Vec<_>>(), vec!["prep"]);
        assert_eq!(outcome.forwards[0].args().args[0].postprocs().len(), 1);
    }

    #[test]
    fn test_parametric_producer_blocks_pipelining() {
        let model = model_with(parametric());
        let outcome = rewrite_model(&model, &PipelineConfig::default(), &env(), None).unwrap();
        assert!(outcome.forwards.is_empty());
        assert_eq!(outcome.non_pipelined, vec!["ebc".to_string()]);
    }

    #[test]
    fn test_postproc_disabled_blocks_pipelining() {
        let model = model_with(passthrough());
        let config = PipelineConfig::default().with_pipeline_postproc(false);
        let outcome = rewrite_model(&model, &config, &env(), None).unwrap();
        assert!(outcome.forwards.is_empty());
        assert!(outcome.postprocs.is_empty());
    }

    #[test]
    fn test_keyed_jagged_constructor_is_unwound() {
        let mut g = Graph::new();
        let batch_node = g.placeholder("batch");
        let sparse = g.get_attr(batch_node, "sparse");
        let values = g.call_method("values", vec![sparse.into()]);
        let kjt = g.call_function_kw(
            Function::KeyedJaggedTensor,
            vec![],
            [
                ("keys".to_string(), Argument::Const(Value::List(vec![Value::from("f1")]))),
                ("values".to_string(), values.into()),
            ]
            .into_iter()
            .collect(),
        );
        let out = g.call_module("ebc", vec![kjt.into()]);
        g.output(out.into());
        let model = GraphModel::new(Arc::new(Composite::new("Model", g).with_child("ebc", ebc()))).unwrap();
        let outcome = rewrite_model(&model, &PipelineConfig::default(), &env(), None).unwrap();
        // the method call producing the values cannot be rebuilt
        assert_eq!(outcome.non_pipelined, vec!["ebc".to_string()]);

        let mut g = Graph::new();
        let batch_node = g.placeholder("batch");
        let sparse = g.get_attr(batch_node, "sparse");
        let kjt = g.call_function_kw(
            Function::KeyedJaggedTensor,
            vec![],
            [
                ("keys".to_string(), Argument::Const(Value::List(vec![Value::from("f1")]))),
                ("values".to_string(), sparse.into()),
            ]
            .into_iter()
            .collect(),
        );
        let out = g.call_module("ebc", vec![kjt.into()]);
        g.output(out.into());
        let model = GraphModel::new(Arc::new(Composite::new("Model", g).with_child("ebc", ebc()))).unwrap();
        let outcome = rewrite_model(&model, &PipelineConfig::default(), &env(), None).unwrap();
        assert_eq!(outcome.pipelined_names(), vec!["ebc".to_string()]);
    }

    #[test]
    fn test_tree_unflatten_indexes_leaves() {
        let mut g = Graph::new();
        let batch_node = g.placeholder("batch");
        let leaf = g.placeholder_with_key("leaf", "sparse");
        let unflat = g.call_function(
            Function::TreeUnflatten,
            vec![Argument::List(vec![batch_node.into(), leaf.into()])],
        );
        let picked = g.get_item(unflat, 1);
        let out = g.call_module("ebc", vec![picked.into()]);
        g.output(out.into());
        let model = GraphModel::new(Arc::new(Composite::new("Model", g).with_child("ebc", ebc()))).unwrap();
        let outcome = rewrite_model(&model, &PipelineConfig::default(), &env(), None).unwrap();
        assert_eq!(outcome.pipelined_names(), vec!["ebc".to_string()]);

        let mut ctx = TrainPipelineContext::new(0, ContextVersion::Current);
        let (args, _) = outcome.forwards[0]
            .args()
            .build_args_kwargs(&batch(), &mut ctx)
            .unwrap();
        assert_eq!(args[0], batch().get_attr("sparse").unwrap());
    }

    #[test]
    fn test_zero_arg_sharded_module_is_not_pipelined() {
        let mut g = Graph::new();
        let _batch = g.placeholder("batch");
        let out = g.call_module("ebc", vec![]);
        g.output(out.into());
        let model = GraphModel::new(Arc::new(Composite::new("Model", g).with_child("ebc", ebc()))).unwrap();
        let outcome = rewrite_model(&model, &PipelineConfig::default(), &env(), None).unwrap();
        assert_eq!(outcome.non_pipelined, vec!["ebc".to_string()]);
    }

    #[test]
    fn test_compile_pass() {
        let model = model_with(parametric());
        let config = PipelineConfig::default().with_apply_compile(true);

        assert!(matches!(
            rewrite_model(&model, &config, &env(), None),
            Err(PipelineError::UnsupportedConfiguration(_))
        ));

        let ok = FnCompiler(|_: &str, m: &Arc<dyn Module>| -> PipelineResult<Arc<dyn Module>> {
            Ok(Arc::clone(m))
        });
        let outcome = rewrite_model(&model, &config, &env(), Some(&ok)).unwrap();
        assert_eq!(outcome.compiled.keys().collect::<Vec<_>>(), vec!["prep"]);

        let failing = FnCompiler(|fqn: &str, _: &Arc<dyn Module>| -> PipelineResult<Arc<dyn Module>> {
            Err(PipelineError::Internal(format!("cannot compile {}", fqn)))
        });
        let outcome = rewrite_model(&model, &config, &env(), Some(&failing)).unwrap();
        assert!(outcome.compiled.is_empty());

        let strict = config.with_strict_compile(true);
        assert!(matches!(
            rewrite_model(&model, &strict, &env(), Some(&failing)),
            Err(PipelineError::CompilationFailed { .. })
        ));
    }

    #[test]
    fn test_pipelined_postproc_is_not_compiled() {
        let mut g = Graph::new();
        let batch_node = g.placeholder("batch");
        let sparse = g.get_attr(batch_node, "sparse");
        let dense = g.get_attr(batch_node, "dense");
        let prepped = g.call_module("prep", vec![sparse.into()]);
        let pooled = g.call_module("ebc", vec![prepped.into()]);
        let dense_out = g.call_module("dense", vec![dense.into()]);
        g.output(Argument::List(vec![pooled.into(), dense_out.into()]));
        let model = GraphModel::new(Arc::new(
            Composite::new("Model", g)
                .with_child("prep", passthrough())
                .with_child("ebc", ebc())
                .with_child("dense", parametric()),
        ))
        .unwrap();

        let compiler = FnCompiler(|_: &str, m: &Arc<dyn Module>| -> PipelineResult<Arc<dyn Module>> {
            Ok(Arc::clone(m))
        });
        let config = PipelineConfig::default().with_apply_compile(true);
        let outcome = rewrite_model(&model, &config, &env(), Some(&compiler)).unwrap();
        assert_eq!(outcome.postprocs.keys().collect::<Vec<_>>(), vec!["prep"]);
        assert_eq!(outcome.compiled.keys().collect::<Vec<_>>(), vec!["dense"]);

        // without postproc interception prep is an ordinary module again
        let config = config.with_pipeline_postproc(false);
        let outcome = rewrite_model(&model, &config, &env(), Some(&compiler)).unwrap();
        assert_eq!(
            outcome.compiled.keys().collect::<Vec<_>>(),
            vec!["dense", "prep"]
        );
    }
}
