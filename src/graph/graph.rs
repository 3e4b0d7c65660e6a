//! Graph structures for traced module calls.

use std::collections::BTreeMap;

use crate::error::{PipelineError, PipelineResult};
use crate::graph::{Function, Op};
use crate::value::{Index, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Argument of a node: another node's output, a constant, or a collection
/// of arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Node(NodeId),
    Const(Value),
    List(Vec<Argument>),
    Dict(BTreeMap<String, Argument>),
}

impl Argument {
    pub fn none() -> Self {
        Argument::Const(Value::None)
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Argument::Node(id) => Some(*id),
            _ => None,
        }
    }

    /// Every node referenced by this argument, depth first.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_nodes(&mut out);
        out
    }

    fn collect_nodes(&self, out: &mut Vec<NodeId>) {
        match self {
            Argument::Node(id) => out.push(*id),
            Argument::Const(_) => {}
            Argument::List(items) => items.iter().for_each(|a| a.collect_nodes(out)),
            Argument::Dict(map) => map.values().for_each(|a| a.collect_nodes(out)),
        }
    }

    /// Rewrite every node reference with `f`.
    pub fn map_nodes(&self, f: &impl Fn(NodeId) -> Argument) -> Argument {
        match self {
            Argument::Node(id) => f(*id),
            Argument::Const(v) => Argument::Const(v.clone()),
            Argument::List(items) => Argument::List(items.iter().map(|a| a.map_nodes(f)).collect()),
            Argument::Dict(map) => Argument::Dict(
                map.iter()
                    .map(|(k, a)| (k.clone(), a.map_nodes(f)))
                    .collect(),
            ),
        }
    }
}

impl From<NodeId> for Argument {
    fn from(id: NodeId) -> Self {
        Argument::Node(id)
    }
}

impl From<Value> for Argument {
    fn from(v: Value) -> Self {
        Argument::Const(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: Op,
    pub args: Vec<Argument>,
    pub kwargs: BTreeMap<String, Argument>,
}

/// Nodes in execution order. A node only refers to nodes before it; the
/// last node is the output.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: Op,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            name: name.into(),
            op,
            args,
            kwargs,
        });
        id
    }

    pub fn placeholder(&mut self, name: &str) -> NodeId {
        self.add_node(name, Op::Placeholder { ph_key: None }, Vec::new(), BTreeMap::new())
    }

    pub fn placeholder_with_key(&mut self, name: &str, ph_key: &str) -> NodeId {
        self.add_node(
            name,
            Op::Placeholder {
                ph_key: Some(ph_key.to_string()),
            },
            Vec::new(),
            BTreeMap::new(),
        )
    }

    pub fn call_module(&mut self, target: &str, args: Vec<Argument>) -> NodeId {
        self.call_module_kw(target, args, BTreeMap::new())
    }

    pub fn call_module_kw(
        &mut self,
        target: &str,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> NodeId {
        let name = target.replace('.', "_");
        self.add_node(name, Op::CallModule(target.to_string()), args, kwargs)
    }

    pub fn call_function(&mut self, function: Function, args: Vec<Argument>) -> NodeId {
        self.call_function_kw(function, args, BTreeMap::new())
    }

    pub fn call_function_kw(
        &mut self,
        function: Function,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> NodeId {
        let name = match &function {
            Function::GetAttr => "getattr".to_string(),
            Function::GetItem => "getitem".to_string(),
            Function::TreeUnflatten => "tree_unflatten".to_string(),
            Function::KeyedJaggedTensor => "keyed_jagged_tensor".to_string(),
            Function::Named(name) => name.clone(),
        };
        self.add_node(name, Op::CallFunction(function), args, kwargs)
    }

    pub fn call_method(&mut self, method: &str, args: Vec<Argument>) -> NodeId {
        self.add_node(method, Op::CallMethod(method.to_string()), args, BTreeMap::new())
    }

    pub fn get_attr(&mut self, obj: NodeId, attr: &str) -> NodeId {
        self.call_function(
            Function::GetAttr,
            vec![obj.into(), Value::from(attr).into()],
        )
    }

    pub fn get_item(&mut self, obj: NodeId, index: impl Into<Index>) -> NodeId {
        let index = match index.into() {
            Index::Int(i) => Value::Int(i),
            Index::Key(k) => Value::Str(k),
        };
        self.call_function(Function::GetItem, vec![obj.into(), index.into()])
    }

    pub fn output(&mut self, arg: Argument) -> NodeId {
        self.add_node("output", Op::Output, vec![arg], BTreeMap::new())
    }

    pub fn node(&self, id: NodeId) -> PipelineResult<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| PipelineError::GraphError(format!("no node {}", id.0)))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.op, Op::Placeholder { .. }))
    }

    /// Nodes whose arguments reference `id`.
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| {
                n.args
                    .iter()
                    .chain(n.kwargs.values())
                    .any(|a| a.nodes().contains(&id))
            })
            .map(|n| n.id)
            .collect()
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let Some(last) = self.nodes.last() else {
            return Err(PipelineError::GraphError("graph has no nodes".to_string()));
        };
        if last.op != Op::Output {
            return Err(PipelineError::GraphError(
                "last node must be the output".to_string(),
            ));
        }
        for node in &self.nodes {
            if node.op == Op::Output && node.id != last.id {
                return Err(PipelineError::GraphError(format!(
                    "output node {} is not last",
                    node.id.0
                )));
            }
            for arg in node.args.iter().chain(node.kwargs.values()) {
                if let Some(bad) = arg.nodes().into_iter().find(|dep| dep.0 >= node.id.0) {
                    return Err(PipelineError::GraphError(format!(
                        "node {} ({}) refers to later node {}",
                        node.id.0, node.name, bad.0
                    )));
                }
            }
        }
        Ok(())
    }
}
