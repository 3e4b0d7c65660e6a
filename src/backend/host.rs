//! Host runtime: streams complete synchronously, ordering calls can be traced

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use crate::backend::{Device, DeviceRuntime, Stream, StreamId};
use crate::error::{PipelineError, PipelineResult};

/// One ordering call observed by [`HostRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Created { stream: StreamId, name: String },
    /// A stream became current on some thread.
    Enter { stream: StreamId },
    Wait { waiter: StreamId, producer: StreamId },
    Synchronize { stream: StreamId },
}

/// Shared, append-only log of stream events.
///
/// A disabled trace drops every event, so a long-lived runtime does not
/// accumulate one entry per ordering call.
#[derive(Debug, Clone, Default)]
pub struct StreamTrace {
    enabled: bool,
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl StreamTrace {
    /// A trace that records nothing.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recording() -> Self {
        StreamTrace {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn push(&self, event: StreamEvent) {
        if !self.enabled {
            return;
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producers `waiter` was ordered after, in call order.
    pub fn waits_of(&self, waiter: StreamId) -> Vec<StreamId> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StreamEvent::Wait { waiter: w, producer } if w == waiter => Some(producer),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

/// [`DeviceRuntime`] for hosts without accelerator queues.
///
/// Every operation completes when issued, so waits never block. Each device
/// gets a default stream on first use; the current stream is tracked per
/// thread. Ordering calls are only recorded by a runtime built with
/// [`HostRuntime::with_trace`].
pub struct HostRuntime {
    next_id: AtomicU64,
    defaults: Mutex<HashMap<Device, Stream>>,
    current: Mutex<HashMap<(ThreadId, Device), Stream>>,
    trace: StreamTrace,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::with_stream_trace(StreamTrace::new())
    }

    /// Runtime that records every ordering call in [`HostRuntime::trace`].
    pub fn with_trace() -> Self {
        Self::with_stream_trace(StreamTrace::recording())
    }

    fn with_stream_trace(trace: StreamTrace) -> Self {
        HostRuntime {
            next_id: AtomicU64::new(0),
            defaults: Mutex::new(HashMap::new()),
            current: Mutex::new(HashMap::new()),
            trace,
        }
    }

    pub fn shared() -> Arc<dyn DeviceRuntime> {
        Arc::new(Self::new())
    }

    pub fn trace(&self) -> &StreamTrace {
        &self.trace
    }

    fn allocate(&self, device: Device, priority: i32, name: &str) -> Stream {
        let id = StreamId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.trace.push(StreamEvent::Created {
            stream: id,
            name: name.to_string(),
        });
        Stream::new(id, device, priority, name)
    }

    fn default_stream(&self, device: Device) -> Stream {
        let mut defaults = match self.defaults.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        defaults
            .entry(device)
            .or_insert_with(|| self.allocate(device, 0, "default"))
            .clone()
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRuntime for HostRuntime {
    fn new_stream(&self, device: Device, priority: i32, name: &str) -> PipelineResult<Stream> {
        let stream = self.allocate(device, priority, name);
        tracing::debug!(stream = %stream.id(), %device, name, "created stream");
        Ok(stream)
    }

    fn current_stream(&self, device: Device) -> Stream {
        let key = (std::thread::current().id(), device);
        let current = self.current.lock().ok().and_then(|map| map.get(&key).cloned());
        current.unwrap_or_else(|| self.default_stream(device))
    }

    fn set_current_stream(&self, stream: &Stream) -> PipelineResult<Stream> {
        let previous = self.current_stream(stream.device());
        let key = (std::thread::current().id(), stream.device());
        self.current
            .lock()
            .map_err(|e| PipelineError::StreamError(e.to_string()))?
            .insert(key, stream.clone());
        self.trace.push(StreamEvent::Enter { stream: stream.id() });
        Ok(previous)
    }

    fn wait_stream(&self, waiter: &Stream, producer: &Stream) -> PipelineResult<()> {
        if waiter.device() != producer.device() {
            return Err(PipelineError::StreamError(format!(
                "{} on {} cannot wait for {} on {}",
                waiter.id(),
                waiter.device(),
                producer.id(),
                producer.device()
            )));
        }
        tracing::trace!(waiter = %waiter.id(), producer = %producer.id(), "wait_stream");
        self.trace.push(StreamEvent::Wait {
            waiter: waiter.id(),
            producer: producer.id(),
        });
        Ok(())
    }

    fn synchronize(&self, stream: &Stream) -> PipelineResult<()> {
        self.trace.push(StreamEvent::Synchronize { stream: stream.id() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stream_is_stable() {
        let runtime = HostRuntime::new();
        let device = Device::Accelerator(0);
        let a = runtime.current_stream(device);
        let b = runtime.current_stream(device);
        assert_eq!(a, b);
        assert_eq!(a.name(), "default");
        assert_ne!(a, runtime.current_stream(Device::Cpu));
    }

    #[test]
    fn test_current_stream_is_per_thread() {
        let runtime = Arc::new(HostRuntime::new());
        let device = Device::Accelerator(0);
        let side = runtime.new_stream(device, 0, "side").unwrap();
        runtime.set_current_stream(&side).unwrap();

        let other = Arc::clone(&runtime);
        let seen = std::thread::spawn(move || other.current_stream(device))
            .join()
            .unwrap();
        assert_ne!(seen, side);
        assert_eq!(runtime.current_stream(device), side);
    }

    #[test]
    fn test_wait_stream_is_traced() {
        let runtime = HostRuntime::with_trace();
        let device = Device::Accelerator(0);
        let a = runtime.new_stream(device, 0, "a").unwrap();
        let b = runtime.new_stream(device, 0, "b").unwrap();
        runtime.wait_stream(&a, &b).unwrap();
        runtime.wait_stream(&a, &a).unwrap();

        assert_eq!(runtime.trace().waits_of(a.id()), vec![b.id(), a.id()]);
        assert!(runtime.trace().waits_of(b.id()).is_empty());
    }

    #[test]
    fn test_untraced_runtime_records_nothing() {
        let runtime = HostRuntime::new();
        let device = Device::Accelerator(0);
        assert!(!runtime.trace().is_enabled());
        for _ in 0..64 {
            let a = runtime.new_stream(device, 0, "a").unwrap();
            let previous = runtime.set_current_stream(&a).unwrap();
            runtime.wait_stream(&previous, &a).unwrap();
            runtime.synchronize(&a).unwrap();
        }
        assert!(runtime.trace().is_empty());

        let shared = HostRuntime::shared();
        let s = shared.new_stream(device, 0, "s").unwrap();
        shared.wait_stream(&s, &s).unwrap();
        assert!(!HostRuntime::default().trace().is_enabled());
    }

    #[test]
    fn test_wait_across_devices_fails() {
        let runtime = HostRuntime::new();
        let a = runtime.new_stream(Device::Accelerator(0), 0, "a").unwrap();
        let b = runtime.new_stream(Device::Accelerator(1), 0, "b").unwrap();
        let err = runtime.wait_stream(&a, &b).unwrap_err();
        assert!(matches!(err, PipelineError::StreamError(_)));
    }
}
