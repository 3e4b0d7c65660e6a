//! Configuration for the sparse data distribution pipeline
//!
//! [`PipelineConfig`] selects which phases run, which forward variant the
//! rewrite installs, and whether debug-mode context invariants are checked.
//! [`LoaderConfig`] controls the background batch loader.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{io_context, PipelineError, PipelineResult};

const CONTEXT_ASSERTIONS_ENV: &str = "RECPIPE_CONTEXT_ASSERTIONS";

/// How the replacement forward of a pipelined module obtains its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardVariant {
    /// Runs compute and output distribution inside the model forward.
    #[default]
    Synchronous,
    /// Output distribution is started ahead of the forward; embeddings are
    /// detached so their backward can be scheduled separately.
    SemiSynchronous,
    /// Like `SemiSynchronous` without detaching the embeddings.
    SemiSynchronousNoDetach,
}

impl ForwardVariant {
    pub fn is_semi_synchronous(&self) -> bool {
        !matches!(self, ForwardVariant::Synchronous)
    }
}

/// Which population rules the per-batch contexts follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextVersion {
    /// Start clears the splits and next-batch maps and writes module contexts
    /// into the next-batch map.
    Legacy,
    #[default]
    Current,
}

/// Configuration for [`crate::pipeline::SparseDataDist`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Intercept auxiliary modules whose outputs feed sharded modules.
    pub pipeline_postproc: bool,

    /// Add the prefetch phase and the third context slot.
    pub prefetch: bool,

    /// Ignored when `prefetch` is on; the prefetch forward is used instead.
    pub forward_variant: ForwardVariant,

    /// Compile the non-pipelined remainder of hybrid modules after rewrite.
    pub apply_compile: bool,

    /// Propagate compile failures instead of keeping the uncompiled module.
    pub strict_compile: bool,

    /// Check the per-phase context invariants (debug mode).
    pub context_assertions: bool,

    pub context_version: ContextVersion,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            pipeline_postproc: true,
            prefetch: false,
            forward_variant: ForwardVariant::Synchronous,
            apply_compile: false,
            strict_compile: false,
            context_assertions: false,
            context_version: ContextVersion::Current,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipeline_postproc(mut self, pipeline_postproc: bool) -> Self {
        self.pipeline_postproc = pipeline_postproc;
        self
    }

    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_forward_variant(mut self, forward_variant: ForwardVariant) -> Self {
        self.forward_variant = forward_variant;
        self
    }

    pub fn with_apply_compile(mut self, apply_compile: bool) -> Self {
        self.apply_compile = apply_compile;
        self
    }

    pub fn with_strict_compile(mut self, strict_compile: bool) -> Self {
        self.strict_compile = strict_compile;
        self
    }

    pub fn with_context_assertions(mut self, context_assertions: bool) -> Self {
        self.context_assertions = context_assertions;
        self
    }

    pub fn with_context_version(mut self, context_version: ContextVersion) -> Self {
        self.context_version = context_version;
        self
    }

    /// Defaults with `RECPIPE_CONTEXT_ASSERTIONS` applied ("1", "true", "on").
    pub fn from_env() -> Self {
        let assertions = std::env::var(CONTEXT_ASSERTIONS_ENV)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "on"))
            .unwrap_or(false);
        Self::default().with_context_assertions(assertions)
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> PipelineResult<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| io_context(e, &format!("reading {}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> PipelineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Variant the rewrite installs on pipelined modules.
    pub fn effective_forward(&self) -> EffectiveForward {
        if self.prefetch {
            EffectiveForward::Prefetch
        } else {
            match self.forward_variant {
                ForwardVariant::Synchronous => EffectiveForward::Synchronous,
                ForwardVariant::SemiSynchronous => EffectiveForward::SemiSynchronous { detach: true },
                ForwardVariant::SemiSynchronousNoDetach => {
                    EffectiveForward::SemiSynchronous { detach: false }
                }
            }
        }
    }

    /// Number of contexts the window holds once the pipeline is primed.
    pub fn window_size(&self) -> usize {
        if self.prefetch {
            3
        } else {
            2
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.prefetch && self.forward_variant.is_semi_synchronous() {
            return Err(PipelineError::UnsupportedConfiguration(
                "semi-synchronous forwards cannot be combined with prefetch".to_string(),
            ));
        }
        if self.strict_compile && !self.apply_compile {
            return Err(PipelineError::UnsupportedConfiguration(
                "strict_compile requires apply_compile".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolved forward variant after applying the prefetch switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveForward {
    Synchronous,
    SemiSynchronous { detach: bool },
    Prefetch,
}

/// Configuration for [`crate::pipeline::BackgroundLoader`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Batches produced ahead of the consumer.
    pub prefetch_depth: usize,

    /// Priority of the host-to-device copy stream (lower is higher priority).
    pub memcpy_stream_priority: i32,

    pub to_device_non_blocking: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            prefetch_depth: 1,
            memcpy_stream_priority: 0,
            to_device_non_blocking: true,
        }
    }
}

impl LoaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefetch_depth(mut self, prefetch_depth: usize) -> Self {
        self.prefetch_depth = prefetch_depth;
        self
    }

    pub fn with_memcpy_stream_priority(mut self, priority: i32) -> Self {
        self.memcpy_stream_priority = priority;
        self
    }

    pub fn with_to_device_non_blocking(mut self, non_blocking: bool) -> Self {
        self.to_device_non_blocking = non_blocking;
        self
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.prefetch_depth == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "prefetch_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert!(config.pipeline_postproc);
        assert!(!config.prefetch);
        assert_eq!(config.forward_variant, ForwardVariant::Synchronous);
        assert_eq!(config.context_version, ContextVersion::Current);
        assert_eq!(config.window_size(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pipeline_config_builder() {
        let config = PipelineConfig::new()
            .with_prefetch(true)
            .with_pipeline_postproc(false)
            .with_context_assertions(true)
            .with_context_version(ContextVersion::Legacy);

        assert!(config.prefetch);
        assert!(!config.pipeline_postproc);
        assert!(config.context_assertions);
        assert_eq!(config.window_size(), 3);
        assert_eq!(config.effective_forward(), EffectiveForward::Prefetch);
    }

    #[test]
    fn test_semi_sync_with_prefetch_rejected() {
        let config = PipelineConfig::new()
            .with_prefetch(true)
            .with_forward_variant(ForwardVariant::SemiSynchronous);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedConfiguration(_)));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_strict_compile_requires_apply_compile() {
        let config = PipelineConfig::new().with_strict_compile(true);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedConfiguration(_)));
        assert!(err.is_user_error());
        assert!(config.with_apply_compile(true).validate().is_ok());
    }

    #[test]
    fn test_effective_forward() {
        let config =
            PipelineConfig::new().with_forward_variant(ForwardVariant::SemiSynchronousNoDetach);
        assert_eq!(
            config.effective_forward(),
            EffectiveForward::SemiSynchronous { detach: false }
        );
        assert_eq!(
            PipelineConfig::new().effective_forward(),
            EffectiveForward::Synchronous
        );
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config =
            PipelineConfig::from_json_str(r#"{"forward_variant": "semi_synchronous"}"#).unwrap();
        assert_eq!(config.forward_variant, ForwardVariant::SemiSynchronous);
        assert!(config.pipeline_postproc);

        let bad = PipelineConfig::from_json_str(
            r#"{"prefetch": true, "forward_variant": "semi_synchronous"}"#,
        );
        assert!(matches!(
            bad,
            Err(PipelineError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let written = PipelineConfig::new().with_prefetch(true);
        std::fs::write(&path, written.to_json_string().unwrap()).unwrap();

        let read = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(read, written);

        let missing = PipelineConfig::from_file(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(PipelineError::Io(_))));
    }

    #[test]
    #[serial]
    fn test_from_env_context_assertions() {
        std::env::set_var(CONTEXT_ASSERTIONS_ENV, "1");
        assert!(PipelineConfig::from_env().context_assertions);
        std::env::set_var(CONTEXT_ASSERTIONS_ENV, "0");
        assert!(!PipelineConfig::from_env().context_assertions);
        std::env::remove_var(CONTEXT_ASSERTIONS_ENV);
    }

    #[test]
    fn test_loader_config() {
        let config = LoaderConfig::new()
            .with_prefetch_depth(2)
            .with_memcpy_stream_priority(-1)
            .with_to_device_non_blocking(false);
        assert_eq!(config.prefetch_depth, 2);
        assert_eq!(config.memcpy_stream_priority, -1);
        assert!(config.validate().is_ok());
        assert!(LoaderConfig::new().with_prefetch_depth(0).validate().is_err());
    }
}
