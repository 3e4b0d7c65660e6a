//! Module compilation hook.

use std::sync::Arc;

use crate::error::PipelineResult;
use crate::model::Module;

/// Produces an optimised stand-in for a module.
pub trait ModuleCompiler: Send + Sync {
    fn compile(&self, fqn: &str, module: &Arc<dyn Module>) -> PipelineResult<Arc<dyn Module>>;
}

/// Compiler backed by a closure.
pub struct FnCompiler<F>(pub F);

impl<F> ModuleCompiler for FnCompiler<F>
where
    F: Fn(&str, &Arc<dyn Module>) -> PipelineResult<Arc<dyn Module>> + Send + Sync,
{
    fn compile(&self, fqn: &str, module: &Arc<dyn Module>) -> PipelineResult<Arc<dyn Module>> {
        (self.0)(fqn, module)
    }
}
