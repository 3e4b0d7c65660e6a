//! Graph-backed and closure-backed modules.

use std::fmt;
use std::sync::Arc;

use crate::error::PipelineResult;
use crate::graph::{EagerDispatch, FunctionRegistry, Graph, Interpreter};
use crate::model::Module;
use crate::tensor::Tensor;
use crate::value::{Kwargs, Value};

/// Module whose forward is a call graph over named children.
pub struct Composite {
    type_name: String,
    graph: Graph,
    children: Vec<(String, Arc<dyn Module>)>,
    functions: Arc<FunctionRegistry>,
    parameters: Vec<(String, Tensor)>,
    traceable: bool,
}

impl Composite {
    pub fn new(type_name: impl Into<String>, graph: Graph) -> Self {
        Composite {
            type_name: type_name.into(),
            graph,
            children: Vec::new(),
            functions: Arc::new(FunctionRegistry::new()),
            parameters: Vec::new(),
            traceable: false,
        }
    }

    pub fn with_child(mut self, name: impl Into<String>, child: Arc<dyn Module>) -> Self {
        self.children.push((name.into(), child));
        self
    }

    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.parameters.push((name.into(), tensor));
        self
    }

    pub fn traceable(mut self, traceable: bool) -> Self {
        self.traceable = traceable;
        self
    }

    pub fn graph_ref(&self) -> &Graph {
        &self.graph
    }
}

impl Module for Composite {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn forward(&self, args: &[Value], kwargs: &Kwargs) -> PipelineResult<Value> {
        Interpreter::new(&self.functions, &EagerDispatch).run(&self.graph, self, "", args, kwargs)
    }

    fn named_children(&self) -> Vec<(String, Arc<dyn Module>)> {
        self.children.clone()
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        self.parameters.clone()
    }

    fn graph(&self) -> Option<&Graph> {
        Some(&self.graph)
    }

    fn functions(&self) -> Option<&FunctionRegistry> {
        Some(&self.functions)
    }

    fn is_traceable(&self) -> bool {
        self.traceable
    }
}

impl fmt::Debug for Composite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composite")
            .field("type_name", &self.type_name)
            .field("nodes", &self.graph.len())
            .field(
                "children",
                &self.children.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

type ForwardFn = dyn Fn(&[Value], &Kwargs) -> PipelineResult<Value> + Send + Sync;

/// Leaf module running a closure.
pub struct FnModule {
    type_name: String,
    forward: Box<ForwardFn>,
    parameters: Vec<(String, Tensor)>,
    buffers: Vec<(String, Tensor)>,
}

impl FnModule {
    pub fn new<F>(type_name: impl Into<String>, forward: F) -> Self
    where
        F: Fn(&[Value], &Kwargs) -> PipelineResult<Value> + Send + Sync + 'static,
    {
        FnModule {
            type_name: type_name.into(),
            forward: Box::new(forward),
            parameters: Vec::new(),
            buffers: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.parameters.push((name.into(), tensor));
        self
    }

    pub fn with_buffer(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.buffers.push((name.into(), tensor));
        self
    }
}

impl Module for FnModule {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn forward(&self, args: &[Value], kwargs: &Kwargs) -> PipelineResult<Value> {
        (self.forward)(args, kwargs)
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        self.parameters.clone()
    }

    fn buffers(&self) -> Vec<(String, Tensor)> {
        self.buffers.clone()
    }
}

impl fmt::Debug for FnModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnModule")
            .field("type_name", &self.type_name)
            .finish()
    }
}
