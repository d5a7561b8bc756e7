//! Audio provider port and a reference-counted implementation.
//!
//! Consumers (encoder, keyword detector, endpoint detector) each `acquire` the
//! shared capture stream and read it through their own reader. The first
//! acquire opens the source and starts a pump on the blocking pool; the last
//! release stops it and closes the writer.
//!
//! Consumer bookkeeping and the source sit behind separate locks, so only the
//! first acquire and the last release ever wait for a device read to return.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::AudioError;
use crate::format::AudioFormat;
use crate::ring::{AudioRingStream, AudioWriter};

/// Identity of a stream consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shares one capture stream among many consumers.
pub trait AudioProvider: Send + Sync {
    /// Register `consumer` and return the shared stream, or `None` if the
    /// source could not be started.
    fn acquire(&self, consumer: &ConsumerId) -> Option<Arc<AudioRingStream>>;

    fn release(&self, consumer: &ConsumerId);

    fn format(&self) -> AudioFormat;
}

/// A capture device or any other producer of PCM bytes.
pub trait AudioSource: Send + 'static {
    fn format(&self) -> AudioFormat;

    fn open(&mut self) -> Result<(), AudioError>;

    /// Read the next chunk. `Ok(0)` means the source ended.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError>;

    fn close(&mut self);
}

struct Running {
    stream: Arc<AudioRingStream>,
    stop: CancellationToken,
    generation: u64,
}

/// Consumer bookkeeping. Never held across a device read.
#[derive(Default)]
struct Control {
    consumers: HashSet<ConsumerId>,
    running: Option<Running>,
}

/// The source and its run generation. The pump holds this lock while it
/// reads; everything else takes it only after [`Control`].
struct Device<S> {
    source: S,
    /// Bumped on every start and stop; a pump only touches the source while
    /// its generation is current.
    generation: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stop the running pump, if any, and close the source.
fn stop_running<S: AudioSource>(control: &mut Control, device: &Mutex<Device<S>>) {
    if let Some(running) = control.running.take() {
        running.stop.cancel();
        let mut device = lock(device);
        device.generation += 1;
        device.source.close();
        tracing::debug!(position = running.stream.position(), "Audio source stopped");
    }
}

/// Reference-counted [`AudioProvider`] over one [`AudioSource`].
pub struct SharedAudioProvider<S: AudioSource> {
    control: Arc<Mutex<Control>>,
    device: Arc<Mutex<Device<S>>>,
    format: AudioFormat,
    capacity: usize,
    chunk_size: usize,
    handle: Handle,
}

impl<S: AudioSource> SharedAudioProvider<S> {
    /// `capacity` is the ring size in bytes. Chunks of 10 ms are pumped.
    pub fn new(source: S, capacity: usize, handle: Handle) -> Self {
        let format = source.format();
        let chunk_size = usize::try_from((format.bytes_per_second() / 100).max(1)).unwrap_or(320);
        Self {
            control: Arc::default(),
            device: Arc::new(Mutex::new(Device {
                source,
                generation: 0,
            })),
            format,
            capacity,
            chunk_size,
            handle,
        }
    }

    /// Consumers currently registered.
    pub fn consumer_count(&self) -> usize {
        lock(&self.control).consumers.len()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.control).running.is_some()
    }

    fn start(&self, control: &mut Control) -> Result<Arc<AudioRingStream>, AudioError> {
        let stream = AudioRingStream::new(self.capacity)?;
        let writer = stream.create_writer()?;

        let generation = {
            let mut device = lock(&self.device);
            device.source.open()?;
            device.generation += 1;
            device.generation
        };

        let stop = CancellationToken::new();
        control.running = Some(Running {
            stream: Arc::clone(&stream),
            stop: stop.clone(),
            generation,
        });

        let pump = Pump {
            control: Arc::clone(&self.control),
            device: Arc::clone(&self.device),
            writer,
            stop,
            generation,
            chunk_size: self.chunk_size,
        };
        drop(self.handle.spawn_blocking(move || pump.run()));

        tracing::debug!(capacity = self.capacity, format = ?self.format, "Audio source started");
        Ok(stream)
    }
}

impl<S: AudioSource> AudioProvider for SharedAudioProvider<S> {
    fn acquire(&self, consumer: &ConsumerId) -> Option<Arc<AudioRingStream>> {
        let mut control = lock(&self.control);

        if let Some(running) = &control.running {
            let stream = Arc::clone(&running.stream);
            control.consumers.insert(consumer.clone());
            return Some(stream);
        }

        match self.start(&mut control) {
            Ok(stream) => {
                control.consumers.insert(consumer.clone());
                tracing::debug!(%consumer, "Audio consumer acquired");
                Some(stream)
            }
            Err(e) => {
                tracing::warn!(%consumer, error = %e, "Failed to start audio source");
                None
            }
        }
    }

    fn release(&self, consumer: &ConsumerId) {
        let mut control = lock(&self.control);
        if !control.consumers.remove(consumer) {
            return;
        }
        tracing::debug!(%consumer, remaining = control.consumers.len(), "Audio consumer released");
        if control.consumers.is_empty() {
            stop_running(&mut control, &self.device);
        }
    }

    fn format(&self) -> AudioFormat {
        self.format
    }
}

impl<S: AudioSource> Drop for SharedAudioProvider<S> {
    fn drop(&mut self) {
        let mut control = lock(&self.control);
        control.consumers.clear();
        stop_running(&mut control, &self.device);
    }
}

/// Copies from the source into the ring until stopped or the source ends.
struct Pump<S> {
    control: Arc<Mutex<Control>>,
    device: Arc<Mutex<Device<S>>>,
    writer: AudioWriter,
    stop: CancellationToken,
    generation: u64,
    chunk_size: usize,
}

impl<S: AudioSource> Pump<S> {
    fn run(mut self) {
        let mut buf = vec![0u8; self.chunk_size];

        while !self.stop.is_cancelled() {
            let read = {
                let mut device = lock(&self.device);
                if device.generation != self.generation {
                    break;
                }
                device.source.read(&mut buf)
            };

            match read {
                Ok(0) => {
                    tracing::debug!("Audio source ended");
                    self.source_done();
                    break;
                }
                Ok(n) => {
                    if let Err(e) = self.writer.write(&buf[..n]) {
                        tracing::warn!(error = %e, "Audio pump write failed");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Audio source read failed");
                    self.source_done();
                    break;
                }
            }
        }

        self.writer.close();
    }

    /// The source is done; the next acquire restarts it.
    fn source_done(&self) {
        let mut control = lock(&self.control);
        let current = control
            .running
            .as_ref()
            .is_some_and(|running| running.generation == self.generation);
        if current {
            stop_running(&mut control, &self.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::ring::ReadOutcome;

    /// Endless source producing a counting byte pattern.
    struct CountingSource {
        next: u8,
        read_delay: Duration,
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl AudioSource for CountingSource {
        fn format(&self) -> AudioFormat {
            AudioFormat::new(1_600, 16, 1)
        }

        fn open(&mut self) -> Result<(), AudioError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
            std::thread::sleep(self.read_delay);
            for b in buf.iter_mut() {
                *b = self.next;
                self.next = self.next.wrapping_add(1);
            }
            Ok(buf.len())
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    type Fixture = (SharedAudioProvider<CountingSource>, Arc<AtomicUsize>, Arc<AtomicUsize>);

    fn provider() -> Fixture {
        provider_with_delay(Duration::from_millis(1))
    }

    fn provider_with_delay(read_delay: Duration) -> Fixture {
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            next: 0,
            read_delay,
            opens: Arc::clone(&opens),
            closes: Arc::clone(&closes),
        };
        (
            SharedAudioProvider::new(source, 4_096, Handle::current()),
            opens,
            closes,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn consumers_share_one_stream() {
        let (provider, opens, _) = provider();
        let asr = ConsumerId::new("asr");
        let kwd = ConsumerId::new("kwd");

        let first = provider.acquire(&asr).unwrap();
        let second = provider.acquire(&kwd).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(provider.consumer_count(), 2);
        assert_eq!(provider.format(), AudioFormat::new(1_600, 16, 1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn last_release_stops_pump_and_closes_writer() {
        let (provider, _, closes) = provider();
        let asr = ConsumerId::new("asr");
        let kwd = ConsumerId::new("kwd");
        let stream = provider.acquire(&asr).unwrap();
        provider.acquire(&kwd).unwrap();
        let mut reader = stream.create_reader(None).unwrap();

        provider.release(&asr);
        assert!(provider.is_running());
        provider.release(&kwd);
        assert!(!provider.is_running());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let drained = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 64];
            loop {
                match reader.read(&mut buf) {
                    Ok(ReadOutcome::Eos) => return true,
                    Ok(ReadOutcome::Data(_)) => {}
                    Ok(ReadOutcome::Overrun) => {
                        reader.resync();
                    }
                    Ok(ReadOutcome::Underrun) | Err(_) => return false,
                }
            }
        });
        let reached_eos = tokio::time::timeout(Duration::from_secs(2), drained)
            .await
            .expect("reader should reach end of stream")
            .unwrap();
        assert!(reached_eos);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pumped_bytes_arrive_in_order() {
        let (provider, _, _) = provider();
        let asr = ConsumerId::new("asr");
        let stream = provider.acquire(&asr).unwrap();
        let mut reader = stream.create_reader(Some(0)).unwrap();

        let bytes = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 100];
            let outcome = reader.read(&mut buf);
            (outcome, buf)
        })
        .await
        .unwrap();

        assert_eq!(bytes.0, Ok(ReadOutcome::Data(100)));
        let expected: Vec<u8> = (0..100).collect();
        assert_eq!(bytes.1.to_vec(), expected);
        provider.release(&asr);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn releasing_unknown_consumer_is_ignored() {
        let (provider, _, closes) = provider();
        provider.release(&ConsumerId::new("ghost"));
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert!(!provider.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bookkeeping_does_not_wait_for_a_slow_read() {
        let (provider, _, _) = provider_with_delay(Duration::from_millis(400));
        let asr = ConsumerId::new("asr");
        provider.acquire(&asr).unwrap();
        // Let the pump enter its first read.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        assert_eq!(provider.consumer_count(), 1);
        assert!(provider.is_running());
        provider.acquire(&ConsumerId::new("kwd")).unwrap();
        provider.release(&ConsumerId::new("kwd"));
        assert!(started.elapsed() < Duration::from_millis(200));

        provider.release(&asr);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_the_provider_closes_the_source() {
        let (provider, opens, closes) = provider();
        provider.acquire(&ConsumerId::new("asr")).unwrap();

        drop(provider);

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
