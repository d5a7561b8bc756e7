//! Single-writer, multi-reader audio ring stream.
//!
//! The stream is a fixed-capacity byte ring with an absolute, monotonically
//! increasing write position. Each reader keeps its own absolute read
//! position, so readers never affect each other or the writer.
//!
//! # Locking
//!
//! - `ring` (`RwLock`): the writer holds it exclusively for one chunk copy,
//!   readers share it while copying out.
//! - `signal` (`Mutex<()>` + `Condvar`): blocked readers wait here. The
//!   writer publishes the new position before taking `signal` to notify, and
//!   readers re-check the position while holding it, so no wakeup is lost.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

use crate::error::AudioError;

/// Result of one read call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes copied into the destination.
    Data(usize),
    /// The reader fell more than one capacity behind; the data is lost.
    Overrun,
    /// Nothing to read yet. Only returned by non-blocking reads.
    Underrun,
    /// The writer closed and everything written was read.
    Eos,
}

struct Ring {
    bytes: Box<[u8]>,
    write_offset: usize,
    fill_count: u64,
}

/// Fixed-capacity circular byte buffer with one writer and any number of
/// independent readers.
pub struct AudioRingStream {
    capacity: usize,
    ring: RwLock<Ring>,
    /// `fill_count * capacity + write_offset`, updated under the ring lock.
    position: AtomicU64,
    writer_created: AtomicBool,
    writer_closed: AtomicBool,
    readers: AtomicUsize,
    signal: Mutex<()>,
    data_ready: Condvar,
}

impl AudioRingStream {
    pub fn new(capacity: usize) -> Result<Arc<Self>, AudioError> {
        if capacity == 0 {
            return Err(AudioError::ZeroCapacity);
        }
        Ok(Arc::new(Self {
            capacity,
            ring: RwLock::new(Ring {
                bytes: vec![0; capacity].into_boxed_slice(),
                write_offset: 0,
                fill_count: 0,
            }),
            position: AtomicU64::new(0),
            writer_created: AtomicBool::new(false),
            writer_closed: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
            signal: Mutex::new(()),
            data_ready: Condvar::new(),
        }))
    }

    /// Create the one writer of this stream.
    pub fn create_writer(self: &Arc<Self>) -> Result<AudioWriter, AudioError> {
        self.writer_created
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AudioError::WriterAlreadyCreated)?;
        tracing::debug!(capacity = self.capacity, "Audio writer created");
        Ok(AudioWriter {
            stream: Arc::clone(self),
            closed: false,
        })
    }

    /// Create a reader starting at `position`, or at the current write
    /// position if `None`.
    ///
    /// An explicit position must still be buffered: at most one capacity
    /// behind the write position and not ahead of it.
    pub fn create_reader(self: &Arc<Self>, position: Option<u64>) -> Result<AudioReader, AudioError> {
        let newest = self.position();
        let oldest = newest.saturating_sub(self.capacity as u64);
        let read_position = match position {
            None => newest,
            Some(requested) if (oldest..=newest).contains(&requested) => requested,
            Some(requested) => {
                return Err(AudioError::PositionOutOfWindow {
                    requested,
                    oldest,
                    newest,
                });
            }
        };

        self.readers.fetch_add(1, Ordering::AcqRel);
        Ok(AudioReader {
            stream: Arc::clone(self),
            read_position,
            closed: false,
        })
    }

    /// Absolute write position: total bytes ever written.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Readers created and not yet closed.
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub fn is_writer_closed(&self) -> bool {
        self.writer_closed.load(Ordering::Acquire)
    }

    fn wake_readers(&self) {
        let _signal = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        self.data_ready.notify_all();
    }
}

impl std::fmt::Debug for AudioRingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRingStream")
            .field("capacity", &self.capacity)
            .field("position", &self.position())
            .field("readers", &self.reader_count())
            .field("writer_closed", &self.is_writer_closed())
            .finish()
    }
}

/// The single producer of an [`AudioRingStream`]. Closes on drop.
#[derive(Debug)]
pub struct AudioWriter {
    stream: Arc<AudioRingStream>,
    closed: bool,
}

impl AudioWriter {
    /// Append `data`, overwriting the oldest bytes. Never waits for readers.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, AudioError> {
        if self.closed {
            return Err(AudioError::WriterClosed);
        }

        let stream = &self.stream;
        let mut written = 0;
        while written < data.len() {
            let mut ring = stream.ring.write().unwrap_or_else(PoisonError::into_inner);
            let offset = ring.write_offset;
            let chunk = (stream.capacity - offset).min(data.len() - written);

            ring.bytes[offset..offset + chunk].copy_from_slice(&data[written..written + chunk]);
            ring.write_offset += chunk;
            if ring.write_offset == stream.capacity {
                ring.write_offset = 0;
                ring.fill_count += 1;
            }
            let position = ring.fill_count * stream.capacity as u64 + ring.write_offset as u64;
            stream.position.store(position, Ordering::Release);
            drop(ring);

            written += chunk;
        }

        stream.wake_readers();
        Ok(written)
    }

    /// Close the stream. Blocked readers wake and drain to end of stream.
    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.stream.writer_closed.store(true, Ordering::Release);
        self.stream.wake_readers();
        tracing::debug!(position = self.stream.position(), "Audio writer closed");
    }

    pub fn stream(&self) -> &Arc<AudioRingStream> {
        &self.stream
    }
}

impl Drop for AudioWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// One consumer's cursor over an [`AudioRingStream`]. Closes on drop.
#[derive(Debug)]
pub struct AudioReader {
    stream: Arc<AudioRingStream>,
    read_position: u64,
    closed: bool,
}

impl AudioReader {
    /// Fill `dst`, blocking while no data is available and the writer is
    /// open.
    ///
    /// Returns a short `Data` count only if the writer closes mid-read.
    ///
    /// `Overrun` means the writer lapped this reader. That can happen partway
    /// through a fill: the bytes already copied into `dst` by this call are
    /// lost, and the reader's position has moved past them. Call
    /// [`resync`](Self::resync) before reading again.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<ReadOutcome, AudioError> {
        self.read_inner(dst, true)
    }

    /// Like [`read`](Self::read), but returns what is available instead of
    /// blocking, or `Underrun` if nothing is.
    pub fn try_read(&mut self, dst: &mut [u8]) -> Result<ReadOutcome, AudioError> {
        self.read_inner(dst, false)
    }

    /// Absolute position of the next byte this reader returns.
    pub const fn position(&self) -> u64 {
        self.read_position
    }

    /// Jump to the current write position after an overrun. Returns how
    /// many bytes were skipped.
    pub fn resync(&mut self) -> u64 {
        let newest = self.stream.position();
        let skipped = newest.saturating_sub(self.read_position);
        self.read_position = newest;
        tracing::debug!(skipped, "Audio reader resynced");
        skipped
    }

    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.stream.readers.fetch_sub(1, Ordering::AcqRel);
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    fn read_inner(&mut self, dst: &mut [u8], blocking: bool) -> Result<ReadOutcome, AudioError> {
        if self.closed {
            return Err(AudioError::ReaderClosed);
        }
        if dst.is_empty() {
            return Ok(ReadOutcome::Data(0));
        }

        let capacity = self.stream.capacity;
        let mut copied = 0;
        loop {
            {
                let ring = self.stream.ring.read().unwrap_or_else(PoisonError::into_inner);
                let readable = self.stream.position() - self.read_position;
                if readable > capacity as u64 {
                    tracing::debug!(readable, capacity, "Audio reader overrun");
                    return Ok(ReadOutcome::Overrun);
                }
                if readable > 0 {
                    let offset = usize::try_from(self.read_position % capacity as u64).unwrap_or_default();
                    let available = usize::try_from(readable).unwrap_or(capacity);
                    let chunk = (capacity - offset).min(available).min(dst.len() - copied);

                    dst[copied..copied + chunk].copy_from_slice(&ring.bytes[offset..offset + chunk]);
                    copied += chunk;
                    self.read_position += chunk as u64;

                    if copied == dst.len() {
                        return Ok(ReadOutcome::Data(copied));
                    }
                    continue;
                }
            }

            if !blocking {
                return Ok(self.drained(copied, ReadOutcome::Underrun));
            }
            if !self.wait_for_data() {
                return Ok(self.drained(copied, ReadOutcome::Eos));
            }
        }
    }

    /// Nothing more to copy this call.
    fn drained(&self, copied: usize, empty: ReadOutcome) -> ReadOutcome {
        if copied > 0 {
            ReadOutcome::Data(copied)
        } else if self.stream.is_writer_closed() {
            ReadOutcome::Eos
        } else {
            empty
        }
    }

    /// Block until data is available (`true`) or the writer closed with
    /// nothing left for this reader (`false`).
    fn wait_for_data(&self) -> bool {
        let stream = &self.stream;
        let mut signal = stream.signal.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if stream.position() > self.read_position {
                return true;
            }
            if stream.is_writer_closed() {
                return false;
            }
            signal = stream
                .data_ready
                .wait(signal)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for AudioReader {
    fn drop(&mut self) {
        self.close();
    }
}
