//! Top-level model with forward hooks and a replaceable call dispatch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{PipelineError, PipelineResult};
use crate::graph::{EagerDispatch, FunctionRegistry, Graph, Interpreter, ModuleDispatch};
use crate::model::{get_submodule, named_modules, named_parameters, state_dict, Module};
use crate::tensor::Tensor;
use crate::value::{Kwargs, Value};

/// Callback run after every forward pass of a [`GraphModel`].
pub trait ForwardHook: Send + Sync {
    fn after_forward(&self, inputs: &[Value], output: &Value) -> PipelineResult<()>;
}

impl<F> ForwardHook for F
where
    F: Fn(&[Value], &Value) -> PipelineResult<()> + Send + Sync,
{
    fn after_forward(&self, inputs: &[Value], output: &Value) -> PipelineResult<()> {
        self(inputs, output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(u64);

pub struct GraphModel {
    root: Arc<dyn Module>,
    dispatch: RwLock<Option<Arc<dyn ModuleDispatch>>>,
    hooks: Mutex<Vec<(HookHandle, Arc<dyn ForwardHook>)>>,
    next_hook: AtomicU64,
}

impl GraphModel {
    pub fn new(root: Arc<dyn Module>) -> PipelineResult<Self> {
        root.graph()
            .ok_or_else(|| {
                PipelineError::GraphError(format!("{} has no call graph", root.type_name()))
            })?
            .validate()?;
        Ok(GraphModel {
            root,
            dispatch: RwLock::new(None),
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Arc<dyn Module> {
        &self.root
    }

    pub fn graph(&self) -> PipelineResult<&Graph> {
        self.root
            .graph()
            .ok_or_else(|| PipelineError::GraphError("model has no call graph".to_string()))
    }

    /// Run the model on a batch, then every registered forward hook.
    pub fn forward(&self, inputs: &[Value]) -> PipelineResult<Value> {
        let dispatch = self.dispatch.read()?.clone();
        let empty = FunctionRegistry::new();
        let functions = self.root.functions().unwrap_or(&empty);
        let graph = self.graph()?;
        let output = match &dispatch {
            Some(d) => Interpreter::new(functions, d.as_ref()).run(
                graph,
                self.root.as_ref(),
                "",
                inputs,
                &Kwargs::new(),
            )?,
            None => Interpreter::new(functions, &EagerDispatch).run(
                graph,
                self.root.as_ref(),
                "",
                inputs,
                &Kwargs::new(),
            )?,
        };

        let hooks: Vec<Arc<dyn ForwardHook>> = self
            .hooks
            .lock()?
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for hook in hooks {
            hook.after_forward(inputs, &output)?;
        }
        Ok(output)
    }

    /// Replace how submodule calls are dispatched. Returns the previous
    /// dispatch.
    pub fn set_dispatch(
        &self,
        dispatch: Option<Arc<dyn ModuleDispatch>>,
    ) -> PipelineResult<Option<Arc<dyn ModuleDispatch>>> {
        let mut slot = self.dispatch.write()?;
        Ok(std::mem::replace(&mut *slot, dispatch))
    }

    pub fn has_dispatch(&self) -> bool {
        self.dispatch.read().map(|d| d.is_some()).unwrap_or(false)
    }

    pub fn register_forward_hook(&self, hook: Arc<dyn ForwardHook>) -> PipelineResult<HookHandle> {
        let handle = HookHandle(self.next_hook.fetch_add(1, Ordering::Relaxed));
        self.hooks.lock()?.push((handle, hook));
        Ok(handle)
    }

    /// Returns whether the hook was registered.
    pub fn remove_hook(&self, handle: HookHandle) -> PipelineResult<bool> {
        let mut hooks = self.hooks.lock()?;
        let before = hooks.len();
        hooks.retain(|(h, _)| *h != handle);
        Ok(hooks.len() != before)
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn named_modules(&self) -> Vec<(String, Arc<dyn Module>)> {
        named_modules(&self.root)
    }

    pub fn get_submodule(&self, fqn: &str) -> PipelineResult<Arc<dyn Module>> {
        get_submodule(self.root.as_ref(), fqn)
    }

    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        named_parameters(self.root.as_ref(), "")
    }

    pub fn state_dict(&self) -> BTreeMap<String, Tensor> {
        state_dict(self.root.as_ref(), "")
    }
}

impl std::fmt::Debug for GraphModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphModel")
            .field("root", &self.root.type_name())
            .field("hooks", &self.hook_count())
            .field("dispatch", &self.has_dispatch())
            .finish()
    }
}
