//! Module tree of a recommendation model.
//!
//! A model is a tree of [`Module`]s. Modules built from a [`Graph`] call
//! their children by name; others run arbitrary code in `forward`. Sharded
//! modules expose the [`ShardedModule`] capability through
//! [`Module::as_sharded`].

pub mod compile;
pub mod composite;
pub mod graph_model;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dist::ShardedModule;
use crate::error::{PipelineError, PipelineResult};
use crate::graph::{FunctionRegistry, Graph};
use crate::tensor::Tensor;
use crate::value::{Kwargs, Value};

pub use compile::{FnCompiler, ModuleCompiler};
pub use composite::{Composite, FnModule};
pub use graph_model::{ForwardHook, GraphModel, HookHandle};

pub trait Module: Send + Sync {
    fn type_name(&self) -> &str;

    fn forward(&self, args: &[Value], kwargs: &Kwargs) -> PipelineResult<Value>;

    fn named_children(&self) -> Vec<(String, Arc<dyn Module>)> {
        Vec::new()
    }

    /// Parameters owned directly by this module, excluding children.
    fn parameters(&self) -> Vec<(String, Tensor)> {
        Vec::new()
    }

    /// Buffers owned directly by this module, excluding children.
    fn buffers(&self) -> Vec<(String, Tensor)> {
        Vec::new()
    }

    fn as_sharded(&self) -> Option<&dyn ShardedModule> {
        None
    }

    /// Call graph of `forward`, for modules built from one.
    fn graph(&self) -> Option<&Graph> {
        None
    }

    fn functions(&self) -> Option<&FunctionRegistry> {
        None
    }

    /// Trace through this module even where it would otherwise be a leaf.
    fn is_traceable(&self) -> bool {
        false
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Every module under `root`, pre-order, `root` itself first under `""`.
pub fn named_modules(root: &Arc<dyn Module>) -> Vec<(String, Arc<dyn Module>)> {
    let mut out = vec![(String::new(), Arc::clone(root))];
    collect_modules(root.as_ref(), "", &mut out);
    out
}

fn collect_modules(module: &dyn Module, prefix: &str, out: &mut Vec<(String, Arc<dyn Module>)>) {
    for (name, child) in module.named_children() {
        let fqn = join(prefix, &name);
        out.push((fqn.clone(), Arc::clone(&child)));
        collect_modules(child.as_ref(), &fqn, out);
    }
}

/// Submodule at the dotted `path` below `owner`.
pub fn get_submodule(owner: &dyn Module, path: &str) -> PipelineResult<Arc<dyn Module>> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let mut current = child(owner, first, path)?;
    for segment in segments {
        current = child(current.as_ref(), segment, path)?;
    }
    Ok(current)
}

fn child(module: &dyn Module, name: &str, path: &str) -> PipelineResult<Arc<dyn Module>> {
    module
        .named_children()
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, c)| c)
        .ok_or_else(|| PipelineError::ModuleNotFound(path.to_string()))
}

/// Whether `module` or anything below it is sharded.
pub fn has_sharded_descendant(module: &dyn Module) -> bool {
    module.as_sharded().is_some()
        || module
            .named_children()
            .iter()
            .any(|(_, c)| has_sharded_descendant(c.as_ref()))
}

pub fn named_parameters(module: &dyn Module, prefix: &str) -> Vec<(String, Tensor)> {
    let mut out: Vec<(String, Tensor)> = module
        .parameters()
        .into_iter()
        .map(|(n, t)| (join(prefix, &n), t))
        .collect();
    for (name, child) in module.named_children() {
        out.extend(named_parameters(child.as_ref(), &join(prefix, &name)));
    }
    out
}

pub fn named_buffers(module: &dyn Module, prefix: &str) -> Vec<(String, Tensor)> {
    let mut out: Vec<(String, Tensor)> = module
        .buffers()
        .into_iter()
        .map(|(n, t)| (join(prefix, &n), t))
        .collect();
    for (name, child) in module.named_children() {
        out.extend(named_buffers(child.as_ref(), &join(prefix, &name)));
    }
    out
}

/// Parameters and buffers by dotted name.
pub fn state_dict(module: &dyn Module, prefix: &str) -> BTreeMap<String, Tensor> {
    named_parameters(module, prefix)
        .into_iter()
        .chain(named_buffers(module, prefix))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str) -> Arc<dyn Module> {
        Arc::new(
            FnModule::new(name, |_, _| Ok(Value::None))
                .with_parameter("weight", Tensor::from_slice(&[1.0]))
                .with_buffer("running_mean", Tensor::from_slice(&[0.0])),
        )
    }

    fn tree() -> Arc<dyn Module> {
        let mut g = Graph::new();
        let x = g.placeholder("x");
        g.output(x.into());
        let inner: Arc<dyn Module> = Arc::new(
            Composite::new("Inner", g.clone())
                .with_child("a", leaf("A"))
                .with_child("b", leaf("B")),
        );
        Arc::new(Composite::new("Root", g).with_child("inner", inner))
    }

    #[test]
    fn test_named_modules_preorder() {
        let names: Vec<String> = named_modules(&tree()).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["", "inner", "inner.a", "inner.b"]);
    }

    #[test]
    fn test_get_submodule() {
        let root = tree();
        assert_eq!(get_submodule(root.as_ref(), "inner.b").unwrap().type_name(), "B");
        assert!(matches!(
            get_submodule(root.as_ref(), "inner.c"),
            Err(PipelineError::ModuleNotFound(p)) if p == "inner.c"
        ));
    }

    #[test]
    fn test_state_dict_names() {
        let root = tree();
        let keys: Vec<String> = state_dict(root.as_ref(), "").into_keys().collect();
        assert_eq!(
            keys,
            vec![
                "inner.a.running_mean",
                "inner.a.weight",
                "inner.b.running_mean",
                "inner.b.weight",
            ]
        );
        assert_eq!(named_parameters(root.as_ref(), "model").len(), 2);
        assert!(!has_sharded_descendant(root.as_ref()));
    }
}
