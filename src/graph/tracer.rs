//! Symbolic tracing into one flat graph.
//!
//! Submodule graphs are inlined unless the submodule is a leaf. Call nodes
//! in the result name their module by its full path from the root.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{PipelineError, PipelineResult};
use crate::graph::{Argument, Graph, NodeId, Op};
use crate::model::{get_submodule, has_sharded_descendant, named_modules, Module};

pub trait Tracer {
    fn trace(&self, root: &Arc<dyn Module>) -> PipelineResult<Graph>;
}

/// Non-sharded children of modules that mix sharded and non-sharded
/// children. Tracing stops at them unless they are marked traceable.
pub fn leaf_module_names(root: &Arc<dyn Module>) -> BTreeSet<String> {
    let mut leaves = BTreeSet::new();
    for (fqn, module) in named_modules(root) {
        let children = module.named_children();
        let hybrid = module.as_sharded().is_none()
            && children.iter().any(|(_, c)| has_sharded_descendant(c.as_ref()))
            && children.iter().any(|(_, c)| !has_sharded_descendant(c.as_ref()));
        if !hybrid {
            continue;
        }
        for (name, child) in children {
            if !has_sharded_descendant(child.as_ref()) && !child.is_traceable() {
                leaves.insert(join(&fqn, &name));
            }
        }
    }
    leaves
}

#[derive(Debug, Default, Clone)]
pub struct SymbolicTracer {
    leaf_modules: BTreeSet<String>,
}

impl SymbolicTracer {
    pub fn new(leaf_modules: BTreeSet<String>) -> Self {
        SymbolicTracer { leaf_modules }
    }

    /// Tracer stopping at [`leaf_module_names`] of `root`.
    pub fn for_model(root: &Arc<dyn Module>) -> Self {
        Self::new(leaf_module_names(root))
    }

    pub fn leaf_modules(&self) -> &BTreeSet<String> {
        &self.leaf_modules
    }

    fn is_leaf(&self, fqn: &str, module: &dyn Module) -> bool {
        module.graph().is_none()
            || module.as_sharded().is_some()
            || self.leaf_modules.contains(fqn)
    }

    /// Copy `graph` into `out`, binding its plain placeholders to `bound`.
    /// Returns the argument standing for the graph's output.
    fn inline(
        &self,
        graph: &Graph,
        owner: &dyn Module,
        prefix: &str,
        bound: Option<(&[Argument], &BTreeMap<String, Argument>)>,
        out: &mut Graph,
    ) -> PipelineResult<Argument> {
        let mut env: Vec<Option<Argument>> = vec![None; graph.len()];
        let mut positional = 0;

        for node in graph.nodes() {
            let remap = |arg: &Argument, env: &[Option<Argument>]| -> PipelineResult<Argument> {
                let mut missing = None;
                let mapped = arg.map_nodes(&|id: NodeId| match env.get(id.0).cloned().flatten() {
                    Some(a) => a,
                    None => Argument::none(),
                });
                for id in arg.nodes() {
                    if env.get(id.0).map_or(true, Option::is_none) {
                        missing = Some(id);
                    }
                }
                match missing {
                    Some(id) => Err(PipelineError::GraphError(format!(
                        "node {} used before it was traced",
                        id.0
                    ))),
                    None => Ok(mapped),
                }
            };
            let args = node
                .args
                .iter()
                .map(|a| remap(a, &env))
                .collect::<PipelineResult<Vec<_>>>()?;
            let kwargs = node
                .kwargs
                .iter()
                .map(|(k, a)| Ok((k.clone(), remap(a, &env)?)))
                .collect::<PipelineResult<BTreeMap<_, _>>>()?;
            let name = format!("{}{}", prefix.replace('.', "_"), node.name);

            let result = match (&node.op, bound) {
                (Op::Placeholder { ph_key: None }, Some((call_args, call_kwargs))) => {
                    let arg = call_args
                        .get(positional)
                        .or_else(|| call_kwargs.get(&node.name))
                        .cloned()
                        .unwrap_or_else(Argument::none);
                    positional += 1;
                    arg
                }
                (Op::Output, _) => {
                    return args.into_iter().next().ok_or_else(|| {
                        PipelineError::GraphError("output node has no argument".to_string())
                    });
                }
                (Op::CallModule(target), _) => {
                    let fqn = format!("{}{}", prefix, target);
                    let module = get_submodule(owner, target)?;
                    if self.is_leaf(&fqn, module.as_ref()) {
                        Argument::Node(out.add_node(name, Op::CallModule(fqn), args, kwargs))
                    } else {
                        let sub = module.graph().ok_or_else(|| {
                            PipelineError::GraphError(format!("{} has no graph", fqn))
                        })?;
                        self.inline(
                            sub,
                            module.as_ref(),
                            &format!("{}.", fqn),
                            Some((args.as_slice(), &kwargs)),
                            out,
                        )?
                    }
                }
                (op, _) => Argument::Node(out.add_node(name, op.clone(), args, kwargs)),
            };
            env[node.id.0] = Some(result);
        }

        Err(PipelineError::GraphError("graph has no output node".to_string()))
    }
}

impl Tracer for SymbolicTracer {
    fn trace(&self, root: &Arc<dyn Module>) -> PipelineResult<Graph> {
        let graph = root
            .graph()
            .ok_or_else(|| PipelineError::GraphError("model has no graph to trace".to_string()))?;
        let mut out = Graph::new();
        let result = self.inline(graph, root.as_ref(), "", None, &mut out)?;
        out.output(result);
        out.validate()?;
        Ok(out)
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
