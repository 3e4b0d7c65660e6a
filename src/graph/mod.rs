//! Call-graph IR, interpreter and tracer.

pub mod executor;
#[allow(clippy::module_inception)]
pub mod graph;
pub mod op;
pub mod tracer;

pub use executor::{
    navigate, EagerDispatch, FunctionRegistry, Interpreter, ModuleDispatch, NodeOutput,
};
pub use graph::{Argument, Graph, Node, NodeId};
pub use op::{parse_ph_key, Access, Function, Op, OpKind};
pub use tracer::{leaf_module_names, SymbolicTracer, Tracer};
