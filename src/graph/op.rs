//! Node operations of the traced call graph.

use crate::value::Index;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Placeholder,
    CallModule,
    CallFunction,
    CallMethod,
    Output,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Model input. `ph_key` locates the value inside the batch, e.g.
    /// `sparse.id_list[0]`.
    Placeholder { ph_key: Option<String> },
    /// Call of the submodule at this path relative to the graph's owner.
    CallModule(String),
    CallFunction(Function),
    /// Method called on `args[0]`.
    CallMethod(String),
    Output,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Placeholder { .. } => OpKind::Placeholder,
            Op::CallModule(_) => OpKind::CallModule,
            Op::CallFunction(_) => OpKind::CallFunction,
            Op::CallMethod(_) => OpKind::CallMethod,
            Op::Output => OpKind::Output,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Function {
    /// `getattr(obj, name)`
    GetAttr,
    /// `obj[index]`
    GetItem,
    /// Rebuild structured inputs from flattened leaves: `args[0]` is the list
    /// of leaves.
    TreeUnflatten,
    /// Build a `KeyedJaggedTensor` from `keys`, `values`, `lengths` and an
    /// optional `weights` (keyword or positional in that order).
    KeyedJaggedTensor,
    /// User function looked up in the model's function registry.
    Named(String),
}

/// One access on the way from a batch to a nested field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Attr(String),
    Item(Index),
}

/// Parse a placeholder key such as `features[marketplace].ids[0]`.
///
/// Dotted segments are attribute accesses; bracketed segments are item
/// accesses, integers when they parse as one.
pub fn parse_ph_key(ph_key: &str) -> Vec<Access> {
    ph_key
        .replace('[', ".")
        .split('.')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.strip_suffix(']') {
            Some(item) => match item.parse::<i64>() {
                Ok(i) => Access::Item(Index::Int(i)),
                Err(_) => Access::Item(Index::Key(item.to_string())),
            },
            None => Access::Attr(segment.to_string()),
        })
        .collect()
}
