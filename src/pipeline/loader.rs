//! Background batch loading on a dedicated producer task.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span};

use crate::backend::{wait_for_batch, Device, DeviceRuntime, Stream, StreamGuard};
use crate::config::LoaderConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::value::Pipelineable;

/// Pulls batches from an iterator on a blocking task, copies them to the
/// device on a copy stream, and hands them over through a bounded channel.
///
/// A slot is reserved before the next batch is loaded, so at most
/// `prefetch_depth` batches wait for the consumer. One producer, one
/// consumer.
pub struct BackgroundLoader<S> {
    rx: mpsc::Receiver<PipelineResult<S>>,
    producer: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    memcpy_stream: Option<Stream>,
    runtime: Arc<dyn DeviceRuntime>,
    error: Option<PipelineError>,
}

impl<S> BackgroundLoader<S>
where
    S: Pipelineable + Send + 'static,
{
    pub fn spawn<I>(
        handle: &Handle,
        source: I,
        device: Device,
        runtime: Arc<dyn DeviceRuntime>,
        config: &LoaderConfig,
    ) -> PipelineResult<Self>
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: Send + 'static,
    {
        config.validate()?;
        let memcpy_stream = if device.has_streams() {
            Some(runtime.new_stream(device, config.memcpy_stream_priority, "memcpy")?)
        } else {
            None
        };
        let (tx, rx) = mpsc::channel(config.prefetch_depth);
        let stop = Arc::new(AtomicBool::new(false));

        let producer = {
            let handle_for_task = handle.clone();
            let source = source.into_iter();
            let stop = Arc::clone(&stop);
            let runtime = Arc::clone(&runtime);
            let stream = memcpy_stream.clone();
            let non_blocking = config.to_device_non_blocking;
            handle.spawn_blocking(move || {
                produce(Producer {
                    handle: handle_for_task,
                    source,
                    tx,
                    stop,
                    runtime,
                    stream,
                    device,
                    non_blocking,
                })
            })
        };

        Ok(BackgroundLoader {
            rx,
            producer: Some(producer),
            stop,
            memcpy_stream,
            runtime,
            error: None,
        })
    }

    pub fn memcpy_stream(&self) -> Option<&Stream> {
        self.memcpy_stream.as_ref()
    }

    fn hand_over(&self, received: Option<PipelineResult<S>>) -> PipelineResult<Option<S>> {
        match received {
            Some(Ok(batch)) => {
                wait_for_batch(self.runtime.as_ref(), &batch, self.memcpy_stream.as_ref())?;
                Ok(Some(batch))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Next batch, ready on the calling thread's current stream. `None` once
    /// the source is exhausted.
    ///
    /// Must not be called from inside an async context; use
    /// [`BackgroundLoader::next_batch`] there.
    pub fn get_next_batch(&mut self) -> PipelineResult<Option<S>> {
        let received = self.rx.blocking_recv();
        self.hand_over(received)
    }

    pub async fn next_batch(&mut self) -> PipelineResult<Option<S>> {
        let received = self.rx.recv().await;
        self.hand_over(received)
    }

    /// Error that ended iteration, if any.
    pub fn take_error(&mut self) -> Option<PipelineError> {
        self.error.take()
    }

    /// Stop producing. Batches already buffered are dropped.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.rx.close();
        if let Some(producer) = self.producer.take() {
            // the producer exits at its next reservation
            drop(producer);
        }
    }
}

impl<S> Iterator for BackgroundLoader<S>
where
    S: Pipelineable + Send + 'static,
{
    type Item = S;

    fn next(&mut self) -> Option<S> {
        match self.get_next_batch() {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "background loader failed");
                self.error = Some(e);
                None
            }
        }
    }
}

impl<S> Drop for BackgroundLoader<S> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.rx.close();
    }
}

impl<S> fmt::Debug for BackgroundLoader<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundLoader")
            .field("memcpy_stream", &self.memcpy_stream)
            .field("stopped", &self.stop.load(Ordering::Acquire))
            .finish()
    }
}

struct Producer<S, I> {
    handle: Handle,
    source: I,
    tx: mpsc::Sender<PipelineResult<S>>,
    stop: Arc<AtomicBool>,
    runtime: Arc<dyn DeviceRuntime>,
    stream: Option<Stream>,
    device: Device,
    non_blocking: bool,
}

fn produce<S, I>(producer: Producer<S, I>)
where
    S: Pipelineable + Send + 'static,
    I: Iterator<Item = S>,
{
    let Producer {
        handle,
        mut source,
        tx,
        stop,
        runtime,
        stream,
        device,
        non_blocking,
    } = producer;

    let _guard = match StreamGuard::enter(runtime.as_ref(), stream.as_ref()) {
        Ok(guard) => guard,
        Err(e) => {
            let _ = tx.blocking_send(Err(e));
            return;
        }
    };

    while !stop.load(Ordering::Acquire) {
        let Ok(permit) = handle.block_on(tx.reserve()) else {
            break;
        };
        let next = {
            let _span = info_span!("load_batch").entered();
            source.next()
        };
        let Some(batch) = next else {
            break;
        };
        match batch.to_device(device, non_blocking) {
            Ok(batch) => permit.send(Ok(batch)),
            Err(e) => {
                permit.send(Err(e));
                break;
            }
        }
    }
    debug!("loader producer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostRuntime;
    use crate::tensor::Tensor;
    use std::sync::atomic::AtomicUsize;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn tensors(n: usize) -> Vec<Tensor> {
        (0..n).map(|i| Tensor::from_slice(&[i as f32])).collect()
    }

    #[test]
    fn test_yields_every_batch_in_order() {
        let rt = rt();
        let loader = BackgroundLoader::spawn(
            rt.handle(),
            tensors(5),
            Device::Cpu,
            HostRuntime::shared(),
            &LoaderConfig::default(),
        )
        .unwrap();
        let seen: Vec<f32> = loader.map(|t| t.data()[0]).collect();
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_batches_land_on_device_and_consumer_stream() {
        let rt = rt();
        let host = Arc::new(HostRuntime::with_trace());
        let runtime: Arc<dyn DeviceRuntime> = host.clone();
        let device = Device::Accelerator(0);
        let mut loader = BackgroundLoader::spawn(
            rt.handle(),
            tensors(2),
            device,
            Arc::clone(&runtime),
            &LoaderConfig::default(),
        )
        .unwrap();
        let copy = loader.memcpy_stream().cloned().unwrap();
        let batch = loader.get_next_batch().unwrap().unwrap();
        assert_eq!(batch.device(), device);
        let consumer = runtime.current_stream(device);
        assert!(batch.recorded_streams().contains(&consumer.id()));
        assert!(host.trace().waits_of(consumer.id()).contains(&copy.id()));
    }

    #[test]
    fn test_buffer_is_bounded() {
        let rt = rt();
        let loaded = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loaded);
        let source = (0..10).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            Tensor::from_slice(&[i as f32])
        });
        let mut loader = BackgroundLoader::spawn(
            rt.handle(),
            source,
            Device::Cpu,
            HostRuntime::shared(),
            &LoaderConfig::default(),
        )
        .unwrap();
        let mut consumed = 0;
        while let Some(_batch) = loader.get_next_batch().unwrap() {
            consumed += 1;
            std::thread::sleep(std::time::Duration::from_millis(2));
            // one slot in the channel, nothing loaded past it
            assert!(loaded.load(Ordering::SeqCst) <= consumed + 1);
        }
        assert_eq!(consumed, 10);
    }

    #[test]
    fn test_stop_ends_iteration() {
        let rt = rt();
        let mut loader = BackgroundLoader::spawn(
            rt.handle(),
            (0..).map(|i| Tensor::from_slice(&[i as f32])),
            Device::Cpu,
            HostRuntime::shared(),
            &LoaderConfig::default(),
        )
        .unwrap();
        assert!(loader.get_next_batch().unwrap().is_some());
        loader.stop();
        let mut drained = 0;
        while loader.get_next_batch().unwrap().is_some() {
            drained += 1;
        }
        assert!(drained <= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_consumer() {
        let mut loader = BackgroundLoader::spawn(
            &Handle::current(),
            tensors(3),
            Device::Cpu,
            HostRuntime::shared(),
            &LoaderConfig::default(),
        )
        .unwrap();
        let mut count = 0;
        while let Some(_batch) = loader.next_batch().await.unwrap() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_zero_depth_rejected() {
        let rt = rt();
        let result = BackgroundLoader::spawn(
            rt.handle(),
            tensors(1),
            Device::Cpu,
            HostRuntime::shared(),
            &LoaderConfig::default().with_prefetch_depth(0),
        );
        assert!(result.is_err());
    }
}
