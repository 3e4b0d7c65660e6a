//! Argument descriptors: step lists that rebuild a call argument from a batch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::PipelineResult;
use crate::pipeline::context::TrainPipelineContext;
use crate::pipeline::postproc::PipelinedPostproc;
use crate::value::{Index, Kwargs, Value};

/// One resolution step.
#[derive(Clone)]
pub enum ArgInfoStep {
    Noop,
    GetAttr(String),
    GetItem(Index),
    /// Replace the running value with a constant.
    Constant(Value),
    /// Rebuild a list, each element from the original batch.
    ListOf(Vec<ArgInfo>),
    DictOf(BTreeMap<String, ArgInfo>),
    Postproc(Arc<PipelinedPostproc>),
}

impl ArgInfoStep {
    fn apply(&self, batch: &Value, current: Value, ctx: &mut TrainPipelineContext) -> PipelineResult<Value> {
        match self {
            ArgInfoStep::Noop => Ok(current),
            ArgInfoStep::GetAttr(attr) => current.get_attr(attr),
            ArgInfoStep::GetItem(index) => current.get_item(index),
            ArgInfoStep::Constant(value) => Ok(value.clone()),
            ArgInfoStep::ListOf(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| item.build(batch, ctx))
                    .collect::<PipelineResult<Vec<_>>>()?,
            )),
            ArgInfoStep::DictOf(items) => {
                let mut out = BTreeMap::new();
                for (key, item) in items {
                    out.insert(key.clone(), item.build(batch, ctx)?);
                }
                Ok(Value::Dict(out))
            }
            ArgInfoStep::Postproc(postproc) => postproc.invoke(&current, ctx),
        }
    }
}

impl fmt::Debug for ArgInfoStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgInfoStep::Noop => write!(f, "Noop"),
            ArgInfoStep::GetAttr(attr) => write!(f, "GetAttr({})", attr),
            ArgInfoStep::GetItem(index) => write!(f, "GetItem({})", index),
            ArgInfoStep::Constant(value) => write!(f, "Constant({})", value.type_name()),
            ArgInfoStep::ListOf(items) => f.debug_tuple("ListOf").field(items).finish(),
            ArgInfoStep::DictOf(items) => f.debug_tuple("DictOf").field(items).finish(),
            ArgInfoStep::Postproc(p) => write!(f, "Postproc({})", p.fqn()),
        }
    }
}

/// Ordered steps applied to the raw batch.
#[derive(Debug, Clone, Default)]
pub struct ArgInfo {
    steps: Vec<ArgInfoStep>,
}

impl ArgInfo {
    pub fn new() -> Self {
        ArgInfo::default()
    }

    pub fn from_steps(steps: Vec<ArgInfoStep>) -> Self {
        ArgInfo { steps }
    }

    /// Insert a step before all others. Used while walking the graph
    /// backwards from the consumer.
    pub fn add_step(&mut self, step: ArgInfoStep) -> &mut Self {
        self.steps.insert(0, step);
        self
    }

    pub fn append_step(&mut self, step: ArgInfoStep) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// Insert `steps`, in order, before all existing steps.
    pub fn prepend_steps(&mut self, steps: impl IntoIterator<Item = ArgInfoStep>) -> &mut Self {
        let tail = std::mem::take(&mut self.steps);
        self.steps.extend(steps);
        self.steps.extend(tail);
        self
    }

    /// Drop and return the first step.
    pub fn pop_front(&mut self) -> Option<ArgInfoStep> {
        if self.steps.is_empty() {
            None
        } else {
            Some(self.steps.remove(0))
        }
    }

    pub fn steps(&self) -> &[ArgInfoStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Reconstruct the argument from `batch`. An empty descriptor yields
    /// `None`.
    pub fn build(&self, batch: &Value, ctx: &mut TrainPipelineContext) -> PipelineResult<Value> {
        if self.steps.is_empty() {
            return Ok(Value::None);
        }
        let mut current = batch.clone();
        for step in &self.steps {
            current = step.apply(batch, current, ctx)?;
        }
        Ok(current)
    }

    /// Postprocs referenced anywhere in this descriptor.
    pub fn postprocs(&self) -> Vec<Arc<PipelinedPostproc>> {
        let mut out = Vec::new();
        for step in &self.steps {
            match step {
                ArgInfoStep::Postproc(p) => out.push(Arc::clone(p)),
                ArgInfoStep::ListOf(items) => out.extend(items.iter().flat_map(|i| i.postprocs())),
                ArgInfoStep::DictOf(items) => out.extend(items.values().flat_map(|i| i.postprocs())),
                _ => {}
            }
        }
        out
    }
}

/// Positional and keyword descriptors of one call site.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<ArgInfo>,
    pub kwargs: BTreeMap<String, ArgInfo>,
}

impl CallArgs {
    pub fn new(args: Vec<ArgInfo>, kwargs: BTreeMap<String, ArgInfo>) -> Self {
        CallArgs { args, kwargs }
    }

    pub fn len(&self) -> usize {
        self.args.len() + self.kwargs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn build_args_kwargs(
        &self,
        batch: &Value,
        ctx: &mut TrainPipelineContext,
    ) -> PipelineResult<(Vec<Value>, Kwargs)> {
        let args = self
            .args
            .iter()
            .map(|a| a.build(batch, ctx))
            .collect::<PipelineResult<Vec<_>>>()?;
        let mut kwargs = Kwargs::new();
        for (name, info) in &self.kwargs {
            kwargs.insert(name.clone(), info.build(batch, ctx)?);
        }
        Ok((args, kwargs))
    }
}
