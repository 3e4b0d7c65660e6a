//! Graph interpreter.
//!
//! Nodes run in order. A module call may be taken over by a
//! [`ModuleDispatch`]; its result can then stay pending until a later node,
//! or the output, consumes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::dist::LazyAwaitable;
use crate::error::{type_mismatch, PipelineError, PipelineResult};
use crate::graph::{parse_ph_key, Access, Argument, Function, Graph, Op};
use crate::model::{get_submodule, Module};
use crate::tensor::KeyedJaggedTensor;
use crate::value::{Index, Kwargs, Value};

pub type FunctionImpl = Arc<dyn Fn(&[Value], &Kwargs) -> PipelineResult<Value> + Send + Sync>;

/// User functions callable from graphs by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionImpl>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&[Value], &Kwargs) -> PipelineResult<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(f));
    }

    pub fn with<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&[Value], &Kwargs) -> PipelineResult<Value> + Send + Sync + 'static,
    {
        self.register(name, f);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FunctionImpl> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

/// Result of a node, possibly still in flight.
pub enum NodeOutput {
    Ready(Value),
    Pending(LazyAwaitable),
}

impl NodeOutput {
    pub fn into_value(self) -> PipelineResult<Value> {
        match self {
            NodeOutput::Ready(v) => Ok(v),
            NodeOutput::Pending(lazy) => lazy.wait(),
        }
    }
}

impl fmt::Debug for NodeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutput::Ready(v) => f.debug_tuple("Ready").field(v).finish(),
            NodeOutput::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Hook deciding how submodule calls run.
pub trait ModuleDispatch: Send + Sync {
    /// Return `Some` to take over the call of the module at `fqn`. `None`
    /// runs the module normally.
    fn call_module(
        &self,
        fqn: &str,
        module: &Arc<dyn Module>,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> PipelineResult<Option<NodeOutput>>;
}

/// Runs every module as written.
#[derive(Debug, Default, Clone, Copy)]
pub struct EagerDispatch;

impl ModuleDispatch for EagerDispatch {
    fn call_module(
        &self,
        _fqn: &str,
        _module: &Arc<dyn Module>,
        _args: &[Value],
        _kwargs: &Kwargs,
    ) -> PipelineResult<Option<NodeOutput>> {
        Ok(None)
    }
}

pub struct Interpreter<'a> {
    functions: &'a FunctionRegistry,
    dispatch: &'a dyn ModuleDispatch,
}

impl<'a> Interpreter<'a> {
    pub fn new(functions: &'a FunctionRegistry, dispatch: &'a dyn ModuleDispatch) -> Self {
        Interpreter {
            functions,
            dispatch,
        }
    }

    /// Run `graph`, owned by `owner`, whose submodules are named under
    /// `prefix`.
    ///
    /// Placeholders with a key read from the first input; the others take
    /// the positional inputs in order, then keyword inputs by name.
    pub fn run(
        &self,
        graph: &Graph,
        owner: &dyn Module,
        prefix: &str,
        inputs: &[Value],
        kwargs: &Kwargs,
    ) -> PipelineResult<Value> {
        let mut env: Vec<Option<NodeOutput>> = (0..graph.len()).map(|_| None).collect();
        let mut positional = 0;

        for node in graph.nodes() {
            let out = match &node.op {
                Op::Placeholder { ph_key: Some(key) } => {
                    let batch = inputs.first().ok_or_else(|| {
                        PipelineError::GraphError(format!("placeholder {} has no input", node.name))
                    })?;
                    NodeOutput::Ready(navigate(batch, &parse_ph_key(key))?)
                }
                Op::Placeholder { ph_key: None } => {
                    let value = match inputs.get(positional) {
                        Some(v) => v.clone(),
                        None => kwargs.get(&node.name).cloned().unwrap_or_default(),
                    };
                    positional += 1;
                    NodeOutput::Ready(value)
                }
                Op::Output => {
                    let arg = node.args.first().ok_or_else(|| {
                        PipelineError::GraphError("output node has no argument".to_string())
                    })?;
                    return resolve(arg, &mut env);
                }
                Op::CallModule(target) => {
                    let (args, kw) = resolve_call(&node.args, &node.kwargs, &mut env)?;
                    let fqn = format!("{}{}", prefix, target);
                    let module = get_submodule(owner, target)?;
                    match self.dispatch.call_module(&fqn, &module, &args, &kw)? {
                        Some(out) => out,
                        None => NodeOutput::Ready(self.call_module(&fqn, &module, &args, &kw)?),
                    }
                }
                Op::CallFunction(function) => {
                    let (args, kw) = resolve_call(&node.args, &node.kwargs, &mut env)?;
                    NodeOutput::Ready(self.call_function(function, &args, &kw)?)
                }
                Op::CallMethod(method) => {
                    let (args, _) = resolve_call(&node.args, &node.kwargs, &mut env)?;
                    NodeOutput::Ready(call_method(method, &args)?)
                }
            };
            env[node.id.0] = Some(out);
        }

        Err(PipelineError::GraphError("graph has no output node".to_string()))
    }

    fn call_module(
        &self,
        fqn: &str,
        module: &Arc<dyn Module>,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> PipelineResult<Value> {
        match module.graph() {
            Some(graph) => {
                let functions = module.functions().unwrap_or(self.functions);
                Interpreter::new(functions, self.dispatch).run(
                    graph,
                    module.as_ref(),
                    &format!("{}.", fqn),
                    args,
                    kwargs,
                )
            }
            None => module.forward(args, kwargs),
        }
    }

    fn call_function(
        &self,
        function: &Function,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> PipelineResult<Value> {
        match function {
            Function::GetAttr => {
                let (obj, attr) = two_args(args, "getattr")?;
                obj.get_attr(attr.as_str()?)
            }
            Function::GetItem => {
                let (obj, index) = two_args(args, "getitem")?;
                obj.get_item(&value_index(index)?)
            }
            Function::TreeUnflatten => match args.first() {
                Some(leaves @ Value::List(_)) => Ok(leaves.clone()),
                Some(other) => Err(type_mismatch("List of leaves", other.type_name())),
                None => Err(PipelineError::GraphError(
                    "tree_unflatten takes the list of leaves".to_string(),
                )),
            },
            Function::KeyedJaggedTensor => build_kjt(args, kwargs).map(Value::KeyedJagged),
            Function::Named(name) => {
                let f = self.functions.get(name).ok_or_else(|| {
                    PipelineError::GraphError(format!("unknown function {}", name))
                })?;
                f(args, kwargs)
            }
        }
    }
}

fn resolve(arg: &Argument, env: &mut [Option<NodeOutput>]) -> PipelineResult<Value> {
    match arg {
        Argument::Node(id) => {
            let slot = env.get_mut(id.0).ok_or_else(|| {
                PipelineError::GraphError(format!("no node {}", id.0))
            })?;
            match slot.take() {
                Some(NodeOutput::Ready(v)) => {
                    *slot = Some(NodeOutput::Ready(v.clone()));
                    Ok(v)
                }
                Some(NodeOutput::Pending(lazy)) => {
                    let v = lazy.wait()?;
                    *slot = Some(NodeOutput::Ready(v.clone()));
                    Ok(v)
                }
                None => Err(PipelineError::GraphError(format!(
                    "node {} used before it ran",
                    id.0
                ))),
            }
        }
        Argument::Const(v) => Ok(v.clone()),
        Argument::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|a| resolve(a, env))
                .collect::<PipelineResult<_>>()?,
        )),
        Argument::Dict(map) => Ok(Value::Dict(
            map.iter()
                .map(|(k, a)| Ok((k.clone(), resolve(a, env)?)))
                .collect::<PipelineResult<_>>()?,
        )),
    }
}

fn resolve_call(
    args: &[Argument],
    kwargs: &std::collections::BTreeMap<String, Argument>,
    env: &mut [Option<NodeOutput>],
) -> PipelineResult<(Vec<Value>, Kwargs)> {
    let args = args
        .iter()
        .map(|a| resolve(a, env))
        .collect::<PipelineResult<Vec<_>>>()?;
    let kwargs = kwargs
        .iter()
        .map(|(k, a)| Ok((k.clone(), resolve(a, env)?)))
        .collect::<PipelineResult<Kwargs>>()?;
    Ok((args, kwargs))
}

/// Follow a chain of accesses from `value`.
pub fn navigate(value: &Value, accesses: &[Access]) -> PipelineResult<Value> {
    let mut current = value.clone();
    for access in accesses {
        current = match access {
            Access::Attr(attr) => current.get_attr(attr)?,
            Access::Item(index) => current.get_item(index)?,
        };
    }
    Ok(current)
}

fn two_args<'v>(args: &'v [Value], what: &str) -> PipelineResult<(&'v Value, &'v Value)> {
    match args {
        [a, b, ..] => Ok((a, b)),
        _ => Err(PipelineError::GraphError(format!(
            "{} takes two arguments, got {}",
            what,
            args.len()
        ))),
    }
}

fn value_index(value: &Value) -> PipelineResult<Index> {
    match value {
        Value::Int(i) => Ok(Index::Int(*i)),
        Value::Str(s) => Ok(Index::Key(s.clone())),
        other => Err(type_mismatch("Int or Str index", other.type_name())),
    }
}

fn call_method(method: &str, args: &[Value]) -> PipelineResult<Value> {
    let receiver = args.first().ok_or_else(|| {
        PipelineError::GraphError(format!("method {} called without receiver", method))
    })?;
    match method {
        "get" => {
            let key = args
                .get(1)
                .ok_or_else(|| PipelineError::GraphError("get takes a key".to_string()))?
                .as_str()?;
            let default = args.get(2).cloned().unwrap_or_default();
            match receiver {
                Value::Dict(map) => Ok(map.get(key).cloned().unwrap_or(default)),
                Value::Record(record) => Ok(record.fields.get(key).cloned().unwrap_or(default)),
                other => Err(type_mismatch("Dict or Record", other.type_name())),
            }
        }
        "values" | "lengths" | "keys" | "weights" | "stride" => receiver.get_attr(method),
        "to_dict" => match receiver {
            Value::KeyedJagged(kjt) => Ok(Value::Dict(
                kjt.to_dict()?
                    .into_iter()
                    .map(|(k, jt)| (k, Value::Jagged(jt)))
                    .collect(),
            )),
            Value::Keyed(kt) => Ok(Value::Dict(
                kt.to_dict()?
                    .into_iter()
                    .map(|(k, t)| (k, Value::Tensor(t)))
                    .collect(),
            )),
            other => Err(type_mismatch("KeyedJaggedTensor or KeyedTensor", other.type_name())),
        },
        other => Err(PipelineError::GraphError(format!(
            "unsupported method {} on {}",
            other,
            receiver.type_name()
        ))),
    }
}

fn build_kjt(args: &[Value], kwargs: &Kwargs) -> PipelineResult<KeyedJaggedTensor> {
    let param = |name: &str, pos: usize| kwargs.get(name).or_else(|| args.get(pos));
    let missing = |name: &str| {
        PipelineError::GraphError(format!("KeyedJaggedTensor needs {}", name))
    };

    let keys = param("keys", 0)
        .ok_or_else(|| missing("keys"))?
        .as_list()?
        .iter()
        .map(|k| k.as_str().map(str::to_string))
        .collect::<PipelineResult<Vec<_>>>()?;
    let values = param("values", 1)
        .ok_or_else(|| missing("values"))?
        .as_tensor()?
        .clone();
    let lengths = match param("lengths", 2).ok_or_else(|| missing("lengths"))? {
        Value::List(items) => items
            .iter()
            .map(|v| v.as_int().map(|i| i.max(0) as usize))
            .collect::<PipelineResult<Vec<_>>>()?,
        Value::Tensor(t) => t.data().iter().map(|&x| x.max(0.0) as usize).collect(),
        other => return Err(type_mismatch("lengths as List or Tensor", other.type_name())),
    };
    let weights = match param("weights", 3) {
        None | Some(Value::None) => None,
        Some(w) => Some(w.as_tensor()?.clone()),
    };
    let stride = if keys.is_empty() {
        0
    } else {
        lengths.len() / keys.len()
    };
    KeyedJaggedTensor::new(keys, values, weights, lengths, stride)
}
