//! Bounded sample stream between the acquisition thread and a consumer
//!
//! The stream is a two-slot exchange built on two `bounded(1)` channels. The
//! producer fills a buffer it owns exclusively ([`StreamWriter`]) and
//! publishes it with [`swap`](StreamWriter::swap): it takes the spare buffer
//! from the free channel and sends the filled one on the filled channel. The
//! consumer ([`StreamReader`]) receives the filled buffer in
//! [`read`](StreamReader::read) and returns its previous buffer to the free
//! channel. Exactly one buffer circulates between the two channels, so
//! producer and consumer never touch the same buffer and buffers are moved
//! rather than copied.
//!
//! A producer blocks in `swap` until the consumer has drained the previous
//! buffer (back-pressure). [`SampleStream::stop_writer`] wakes it and makes
//! every further `swap` return `false` until
//! [`SampleStream::clear_write_stop`] is called.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, select};
use futures::Stream;

use crate::error::Result;

/// Maximum number of samples a single swap can publish
pub const DEFAULT_STREAM_CAPACITY: usize = 1_000_000;

/// How often the async drain thread checks whether its receiver is gone
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Wake-up channel for a side blocked in the exchange
struct Wake {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Wake {
    fn new() -> Self {
        let (tx, rx) = channel::bounded(1);
        Self { tx, rx }
    }

    fn notify(&self) {
        let _ = self.tx.try_send(());
    }

    fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// Shared state of a single-producer / single-consumer sample stream
pub struct SampleStream<T> {
    filled_tx: Sender<(Vec<T>, usize)>,
    filled_rx: Receiver<(Vec<T>, usize)>,
    free_tx: Sender<Vec<T>>,
    free_rx: Receiver<Vec<T>>,
    writer_wake: Wake,
    reader_wake: Wake,
    write_stop: AtomicBool,
    read_stop: AtomicBool,
    capacity: usize,
}

impl<T: Clone + Default> SampleStream<T> {
    pub fn new(capacity: usize) -> Self {
        let (filled_tx, filled_rx) = channel::bounded(1);
        let (free_tx, free_rx) = channel::bounded(1);
        // the single spare buffer starts on the free side
        let _ = free_tx.try_send(Vec::new());
        Self {
            filled_tx,
            filled_rx,
            free_tx,
            free_rx,
            writer_wake: Wake::new(),
            reader_wake: Wake::new(),
            write_stop: AtomicBool::new(false),
            read_stop: AtomicBool::new(false),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Producer handle. Only one should be active at a time.
    pub fn writer(self: &Arc<Self>) -> StreamWriter<T> {
        StreamWriter {
            stream: Arc::clone(self),
            buf: Vec::new(),
        }
    }

    /// Consumer handle. Only one should be active at a time.
    pub fn reader(self: &Arc<Self>) -> StreamReader<T> {
        StreamReader {
            stream: Arc::clone(self),
            buf: Vec::new(),
            len: 0,
        }
    }

    /// Refuse further swaps and wake a producer waiting for a free slot
    pub fn stop_writer(&self) {
        self.write_stop.store(true, Ordering::SeqCst);
        self.writer_wake.notify();
    }

    pub fn clear_write_stop(&self) {
        self.write_stop.store(false, Ordering::SeqCst);
        self.writer_wake.drain();
    }

    /// Make pending and future reads return `None`. A producer waiting on
    /// the stopped consumer is released and its swaps are dropped.
    pub fn stop_reader(&self) {
        self.read_stop.store(true, Ordering::SeqCst);
        self.reader_wake.notify();
        self.writer_wake.notify();
    }

    pub fn clear_read_stop(&self) {
        self.read_stop.store(false, Ordering::SeqCst);
        self.reader_wake.drain();
    }

    pub fn is_write_stopped(&self) -> bool {
        self.write_stop.load(Ordering::SeqCst)
    }

    pub fn is_read_stopped(&self) -> bool {
        self.read_stop.load(Ordering::SeqCst)
    }

    /// True while a published buffer waits for the consumer
    pub fn has_pending(&self) -> bool {
        !self.filled_rx.is_empty()
    }

    fn is_stopped(&self) -> bool {
        self.is_write_stopped() || self.is_read_stopped()
    }
}

impl<T: Clone + Default> Default for SampleStream<T> {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_CAPACITY)
    }
}

/// Producer side of a [`SampleStream`]
pub struct StreamWriter<T> {
    stream: Arc<SampleStream<T>>,
    buf: Vec<T>,
}

impl<T: Clone + Default> StreamWriter<T> {
    /// The exclusively owned write buffer, sized to `len` samples (capped
    /// at the stream capacity)
    pub fn buffer(&mut self, len: usize) -> &mut [T] {
        let len = len.min(self.stream.capacity);
        if self.buf.len() < len {
            self.buf.resize(len, T::default());
        }
        &mut self.buf[..len]
    }

    /// Publish the first `count` samples of the write buffer.
    ///
    /// Waits while the consumer still holds an undrained buffer. Returns
    /// `false` without publishing if either side is stopped, in which case
    /// the caller drops its data.
    pub fn swap(&mut self, count: usize) -> bool {
        let count = count.min(self.buf.len());
        let stream = &self.stream;
        loop {
            if stream.is_stopped() {
                return false;
            }
            let mut spare = None;
            select! {
                recv(stream.free_rx) -> msg => spare = msg.ok(),
                recv(stream.writer_wake.rx) -> _ => (),
            }
            let Some(spare) = spare else {
                continue;
            };
            if stream.is_stopped() {
                let _ = stream.free_tx.try_send(spare);
                return false;
            }
            let filled = std::mem::replace(&mut self.buf, spare);
            return stream.filled_tx.try_send((filled, count)).is_ok();
        }
    }
}

/// Consumer side of a [`SampleStream`]
pub struct StreamReader<T> {
    stream: Arc<SampleStream<T>>,
    buf: Vec<T>,
    len: usize,
}

impl<T: Clone + Default> StreamReader<T> {
    /// Wait for the next published buffer. `None` once the reader is
    /// stopped.
    pub fn read(&mut self) -> Option<&[T]> {
        self.next(None)
    }

    /// Like [`read`](Self::read) but gives up after `timeout`
    pub fn read_timeout(&mut self, timeout: Duration) -> Option<&[T]> {
        self.next(Some(Instant::now() + timeout))
    }

    /// The buffer returned by the last successful read
    pub fn current(&self) -> &[T] {
        &self.buf[..self.len]
    }

    fn next(&mut self, deadline: Option<Instant>) -> Option<&[T]> {
        let stream = Arc::clone(&self.stream);
        let (filled, len) = loop {
            if stream.is_read_stopped() {
                return None;
            }
            let mut received = None;
            let mut timed_out = false;
            match deadline {
                None => select! {
                    recv(stream.filled_rx) -> msg => received = msg.ok(),
                    recv(stream.reader_wake.rx) -> _ => (),
                },
                Some(deadline) => select! {
                    recv(stream.filled_rx) -> msg => received = msg.ok(),
                    recv(stream.reader_wake.rx) -> _ => (),
                    default(deadline.saturating_duration_since(Instant::now())) => timed_out = true,
                },
            }
            if let Some(filled) = received {
                break filled;
            }
            if timed_out {
                return None;
            }
        };
        let drained = std::mem::replace(&mut self.buf, filled);
        self.len = len;
        let _ = stream.free_tx.try_send(drained);
        Some(&self.buf[..self.len])
    }
}

impl<T: Clone + Default + Send + 'static> StreamReader<T> {
    /// Turn this reader into a `futures::Stream` of owned buffers.
    ///
    /// A background thread drains the sample stream into a bounded channel
    /// of `depth` buffers. The thread exits when the reader is stopped or
    /// the returned stream is dropped; dropping waits for it.
    pub fn into_async(mut self, depth: usize) -> Result<AsyncSampleReader<T>> {
        let (tx, rx) = tokio::sync::mpsc::channel::<Vec<T>>(depth.max(1));
        let handle = std::thread::Builder::new()
            .name("sample-stream-drain".into())
            .spawn(move || {
                let stream = Arc::clone(&self.stream);
                while !tx.is_closed() {
                    match self.read_timeout(DRAIN_POLL) {
                        Some(samples) => {
                            if tx.blocking_send(samples.to_vec()).is_err() {
                                break;
                            }
                        }
                        None if stream.is_read_stopped() => break,
                        None => {}
                    }
                }
                tracing::debug!("sample stream drain thread exited");
            })?;
        Ok(AsyncSampleReader {
            rx,
            handle: Some(handle),
        })
    }
}

/// Asynchronous consumer of a [`SampleStream`]
pub struct AsyncSampleReader<T> {
    rx: tokio::sync::mpsc::Receiver<Vec<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T> Stream for AsyncSampleReader<T> {
    type Item = Vec<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for AsyncSampleReader<T> {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("sample stream drain thread panicked");
            }
        }
    }
}
