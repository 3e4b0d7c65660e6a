//! Device and execution-stream abstraction
//!
//! The pipeline never touches a device API directly. It orders work through a
//! [`DeviceRuntime`]: streams are created per phase, the current stream is
//! swapped with [`StreamGuard`] and cross-stream ordering is expressed with
//! `wait_stream`. [`HostRuntime`] runs everything on the host. Built with
//! [`HostRuntime::with_trace`] it records every ordering call so tests can
//! check the pipeline's happens-before rules.

pub mod host;
pub mod stream;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use host::{HostRuntime, StreamEvent, StreamTrace};
pub use stream::{wait_for_batch, DeviceRuntime, Stream, StreamGuard, StreamId};

/// Placement of tensors and streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Accelerator(u32),
}

impl Device {
    /// Streams only order work on accelerators; on the CPU they are
    /// bookkeeping.
    pub fn has_streams(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(ordinal) => write!(f, "accel:{}", ordinal),
        }
    }
}
