//! Batching frame writer.
//!
//! Producers submit frames to a bounded queue; a single consumer task owns
//! the write half of the transport and drains the queue into batches. A batch
//! is flushed when it reaches `max_batch` frames, when the batch-wait timer
//! fires, or immediately when the queue depth falls to the low-concurrency
//! threshold. Heartbeats are injected through the same batch path so data
//! and heartbeats cannot starve each other.
//!
//! The first write error is latched; every later submission fails with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::frame::Frame;

/// Callback that fabricates a heartbeat frame. Must not take locks; it runs
/// on the consumer task.
pub type HeartbeatFn = Arc<dyn Fn() -> Frame + Send + Sync>;

/// Callback invoked once with the first terminal write error. Runs on its
/// own task, never on the consumer.
pub type WriteErrorFn = Arc<dyn Fn(String) + Send + Sync>;

/// Writer tuning knobs.
#[derive(Clone)]
pub struct WriterConfig {
    /// Flush when a batch reaches this many frames.
    pub max_batch: usize,
    /// Flush a non-empty batch at least this often.
    pub max_batch_wait: Duration,
    /// Bounded submission queue capacity.
    pub queue_size: usize,
    /// Flush immediately when queue depth is at or below this. `None`
    /// disables adaptive flushing.
    pub low_concurrency_threshold: Option<usize>,
    /// Periodic heartbeat injection.
    pub heartbeat: Option<(Duration, HeartbeatFn)>,
    /// Invoked exactly once with the first terminal write error.
    pub on_write_error: Option<WriteErrorFn>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_batch: 256,
            max_batch_wait: Duration::from_millis(2),
            queue_size: 4096,
            low_concurrency_threshold: Some(16),
            heartbeat: None,
            on_write_error: None,
        }
    }
}

impl std::fmt::Debug for WriterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterConfig")
            .field("max_batch", &self.max_batch)
            .field("max_batch_wait", &self.max_batch_wait)
            .field("queue_size", &self.queue_size)
            .field("low_concurrency_threshold", &self.low_concurrency_threshold)
            .field("heartbeat", &self.heartbeat.as_ref().map(|(i, _)| *i))
            .finish()
    }
}

/// Submission outcomes other than success.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("writer closed")]
    Closed,

    #[error("writer queue full")]
    Full,

    #[error("write failed: {0}")]
    Failed(String),
}

struct Shared {
    closed: AtomicBool,
    write_err: Mutex<Option<String>>,
}

impl Shared {
    fn terminal_error(&self) -> SubmitError {
        match self
            .write_err
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            Some(err) => SubmitError::Failed(err),
            None => SubmitError::Closed,
        }
    }
}

/// Handle to a batching writer task. Cheap to share behind an `Arc`.
pub struct FrameWriter {
    tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FrameWriter {
    /// Spawn the consumer task over `sink` and return the submission handle.
    pub fn spawn<W>(sink: W, config: WriterConfig) -> FrameWriter
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            write_err: Mutex::new(None),
        });

        tokio::spawn(write_loop(
            sink,
            rx,
            shared.clone(),
            config,
            shutdown_rx,
            done_tx,
        ));

        FrameWriter {
            tx,
            shared,
            shutdown: shutdown_tx,
            done: Mutex::new(Some(done_rx)),
        }
    }

    /// Queue a frame without blocking. Returns [`SubmitError::Full`] when the
    /// queue has no room.
    pub fn try_submit(&self, frame: Frame) -> Result<(), SubmitError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(self.shared.terminal_error());
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SubmitError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.shared.terminal_error()),
        }
    }

    /// Queue a frame, waiting for room up to `wait`. A timeout maps to
    /// [`SubmitError::Full`]; ordering relative to queued frames is always
    /// preserved (there is no direct-write fallback).
    pub async fn submit(&self, frame: Frame, wait: Duration) -> Result<(), SubmitError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(self.shared.terminal_error());
        }
        match tokio::time::timeout(wait, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self.shared.terminal_error()),
            Err(_) => Err(SubmitError::Full),
        }
    }

    /// The latched terminal write error, if any.
    pub fn write_error(&self) -> Option<String> {
        self.shared
            .write_err
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Close the writer: refuse further submissions, let the consumer flush
    /// its in-flight batch, release anything still queued, and return.
    /// Idempotent; later calls return immediately.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let waiter = self
            .done
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(done) = waiter else {
            return;
        };
        let _ = self.shutdown.send(true);
        let _ = done.await;
    }
}

async fn write_loop<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
    config: WriterConfig,
    mut shutdown: watch::Receiver<bool>,
    done: oneshot::Sender<()>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut batch: Vec<Frame> = Vec::with_capacity(config.max_batch);
    let mut wire = BytesMut::with_capacity(64 * 1024);

    let mut batch_timer = tokio::time::interval(config.max_batch_wait);
    batch_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let heartbeat_enabled = config.heartbeat.is_some();
    let heartbeat_interval = config
        .heartbeat
        .as_ref()
        .map(|(interval, _)| *interval)
        .unwrap_or(Duration::from_secs(3600));
    let mut heartbeat_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(frame) => {
                        batch.push(frame);
                        let flush_now = batch.len() >= config.max_batch
                            || config
                                .low_concurrency_threshold
                                .is_some_and(|threshold| rx.len() <= threshold);
                        if flush_now && flush(&mut sink, &mut batch, &mut wire, &shared, &config).await.is_err() {
                            break;
                        }
                    }
                    // Every handle dropped: flush what we have and stop.
                    None => {
                        let _ = flush(&mut sink, &mut batch, &mut wire, &shared, &config).await;
                        break;
                    }
                }
            }
            _ = batch_timer.tick() => {
                if !batch.is_empty()
                    && flush(&mut sink, &mut batch, &mut wire, &shared, &config).await.is_err()
                {
                    break;
                }
            }
            _ = heartbeat_timer.tick(), if heartbeat_enabled => {
                if let Some((_, make_frame)) = config.heartbeat.as_ref() {
                    trace!("injecting heartbeat frame");
                    batch.push(make_frame());
                    if flush(&mut sink, &mut batch, &mut wire, &shared, &config).await.is_err() {
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                let _ = flush(&mut sink, &mut batch, &mut wire, &shared, &config).await;
                break;
            }
        }
    }

    shared.closed.store(true, Ordering::Release);
    rx.close();
    // Anything still queued is released without being sent.
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!(dropped, "released queued frames on writer shutdown");
    }
    let _ = sink.shutdown().await;
    let _ = done.send(());
}

async fn flush<W>(
    sink: &mut W,
    batch: &mut Vec<Frame>,
    wire: &mut BytesMut,
    shared: &Arc<Shared>,
    config: &WriterConfig,
) -> Result<(), ()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    wire.clear();
    let mut encode_err = None;
    for frame in batch.iter() {
        if let Err(err) = frame.encode_into(wire) {
            encode_err = Some(err.to_string());
            break;
        }
    }
    batch.clear();

    let result = match encode_err {
        Some(err) => Err(err),
        None => match sink.write_all(wire).await {
            Ok(()) => sink.flush().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        },
    };

    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            latch_error(shared, config, err);
            Err(())
        }
    }
}

fn latch_error(shared: &Arc<Shared>, config: &WriterConfig, err: String) {
    let mut slot = shared
        .write_err
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        return;
    }
    warn!(error = %err, "frame writer hit terminal write error");
    *slot = Some(err.clone());
    drop(slot);
    shared.closed.store(true, Ordering::Release);

    // The callback must not run on the consumer task.
    if let Some(callback) = config.on_write_error.clone() {
        tokio::spawn(async move {
            callback(err);
        });
    }
}
