//! Execution streams and the runtime contract that orders them

use std::fmt;
use std::sync::Arc;

use crate::backend::Device;
use crate::error::PipelineResult;
use crate::value::Multistreamable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Handle to an independently schedulable command queue.
///
/// Cloning a handle does not create a new queue; two handles with the same
/// id refer to the same stream.
#[derive(Debug, Clone)]
pub struct Stream {
    id: StreamId,
    device: Device,
    priority: i32,
    name: Arc<str>,
}

impl Stream {
    pub fn new(id: StreamId, device: Device, priority: i32, name: &str) -> Self {
        Stream {
            id,
            device,
            priority,
            name: Arc::from(name),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Stream {}

/// Stream operations the pipeline relies on.
///
/// The current stream is tracked per calling thread, so a background loader
/// can switch to its copy stream without affecting the training loop.
pub trait DeviceRuntime: Send + Sync {
    /// Create a new stream on `device`. Lower priority values run first.
    fn new_stream(&self, device: Device, priority: i32, name: &str) -> PipelineResult<Stream>;

    /// Stream that work issued by the calling thread lands on.
    fn current_stream(&self, device: Device) -> Stream;

    /// Make `stream` current for the calling thread, returning the previous one.
    fn set_current_stream(&self, stream: &Stream) -> PipelineResult<Stream>;

    /// Work issued to `waiter` after this call starts only once everything
    /// already issued to `producer` has completed. Does not block the host.
    fn wait_stream(&self, waiter: &Stream, producer: &Stream) -> PipelineResult<()>;

    /// Block the host until `stream` drains.
    fn synchronize(&self, stream: &Stream) -> PipelineResult<()>;
}

/// Makes a stream current for its lifetime and restores the previous stream
/// on drop. Entering `None` is a no-op.
pub struct StreamGuard<'a> {
    runtime: &'a dyn DeviceRuntime,
    previous: Option<Stream>,
}

impl<'a> StreamGuard<'a> {
    pub fn enter(runtime: &'a dyn DeviceRuntime, stream: Option<&Stream>) -> PipelineResult<Self> {
        let previous = match stream {
            Some(stream) => {
                let previous = runtime.set_current_stream(stream)?;
                tracing::trace!(enter = %stream.id(), name = stream.name(), "stream guard");
                Some(previous)
            }
            None => None,
        };
        Ok(StreamGuard { runtime, previous })
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Err(e) = self.runtime.set_current_stream(&previous) {
                tracing::error!(error = %e, "failed to restore stream {}", previous.id());
            }
        }
    }
}

/// Hand a value produced on `producer` over to the calling thread's current
/// stream: the current stream waits for `producer`, then the value is
/// recorded as used by the current stream so its memory is not reclaimed
/// early.
pub fn wait_for_batch(
    runtime: &dyn DeviceRuntime,
    batch: &dyn Multistreamable,
    producer: Option<&Stream>,
) -> PipelineResult<()> {
    let Some(producer) = producer else {
        return Ok(());
    };
    let current = runtime.current_stream(producer.device());
    runtime.wait_stream(&current, producer)?;
    batch.record_stream(&current);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostRuntime, StreamEvent};
    use crate::tensor::Tensor;

    #[test]
    fn test_stream_identity() {
        let a = Stream::new(StreamId(1), Device::Cpu, 0, "a");
        let b = Stream::new(StreamId(1), Device::Cpu, -1, "renamed");
        assert_eq!(a, b);
        assert_eq!(a.id().to_string(), "stream#1");
    }

    #[test]
    fn test_stream_guard_restores_previous() {
        let runtime = HostRuntime::new();
        let device = Device::Accelerator(0);
        let default = runtime.current_stream(device);
        let side = runtime.new_stream(device, 0, "side").unwrap();

        {
            let _guard = StreamGuard::enter(&runtime, Some(&side)).unwrap();
            assert_eq!(runtime.current_stream(device), side);
        }
        assert_eq!(runtime.current_stream(device), default);

        let _noop = StreamGuard::enter(&runtime, None).unwrap();
        assert_eq!(runtime.current_stream(device), default);
    }

    #[test]
    fn test_wait_for_batch_records_consumer() {
        let runtime = HostRuntime::with_trace();
        let device = Device::Accelerator(0);
        let copy = runtime.new_stream(device, -1, "memcpy").unwrap();
        let tensor = Tensor::from_vec(vec![1.0, 2.0], vec![2]).unwrap();

        wait_for_batch(&runtime, &tensor, Some(&copy)).unwrap();

        let current = runtime.current_stream(device);
        assert!(tensor.recorded_streams().contains(&current.id()));
        assert!(runtime.trace().events().contains(&StreamEvent::Wait {
            waiter: current.id(),
            producer: copy.id(),
        }));

        // Without a producer there is nothing to order.
        let before = runtime.trace().len();
        wait_for_batch(&runtime, &tensor, None).unwrap();
        assert_eq!(runtime.trace().len(), before);
    }
}
