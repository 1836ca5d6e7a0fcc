// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Periodic flush loop for tools with streaming side output (session
//! recordings, capture streams).
//!
//! A background task wakes on an interval, drains the lock-protected
//! buffer, and hands the batch to a sink. Sink failures bump a
//! consecutive-failure counter for operational visibility and never
//! propagate into the main loop; a later success resets the counter.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Persists one drained batch. Implementations typically write a
/// timestamped chunk file.
pub trait FlushSink<T>: Send + Sync + 'static {
    fn flush(&self, batch: Vec<T>) -> anyhow::Result<()>;
}

impl<T, F> FlushSink<T> for F
where
    F: Fn(Vec<T>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn flush(&self, batch: Vec<T>) -> anyhow::Result<()> {
        self(batch)
    }
}

pub struct PeriodicFlusher<T> {
    buffer: Arc<Mutex<Vec<T>>>,
    failures: Arc<Mutex<u32>>,
    stop: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl<T: Send + 'static> PeriodicFlusher<T> {
    pub fn start(interval: Duration, sink: impl FlushSink<T>) -> Self {
        let buffer: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Mutex::new(0u32));
        let stop = CancellationToken::new();

        let task_buffer = Arc::clone(&buffer);
        let task_failures = Arc::clone(&failures);
        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                flush_once(&task_buffer, &sink, &task_failures);
            }
            // Final drain on shutdown.
            flush_once(&task_buffer, &sink, &task_failures);
        });

        Self {
            buffer,
            failures,
            stop,
            task: Some(task),
        }
    }

    /// Queue one item; never blocks on I/O.
    pub fn push(&self, item: T) {
        self.buffer.lock().expect("flush buffer lock").push(item);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().expect("flush buffer lock").len()
    }

    /// Consecutive flush failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        *self.failures.lock().expect("failure counter lock")
    }

    /// Stop the loop and wait for the final drain of whatever is still
    /// buffered.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<T> Drop for PeriodicFlusher<T> {
    fn drop(&mut self) {
        // Dropping without shutdown still stops the loop; the task drains
        // the buffer once more on its way out.
        self.stop.cancel();
    }
}

fn flush_once<T>(
    buffer: &Mutex<Vec<T>>,
    sink: &impl FlushSink<T>,
    failures: &Mutex<u32>,
) {
    let batch: Vec<T> = std::mem::take(&mut *buffer.lock().expect("flush buffer lock"));
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    match sink.flush(batch) {
        Ok(()) => {
            debug!(items = count, "flushed buffered side output");
            *failures.lock().expect("failure counter lock") = 0;
        }
        Err(e) => {
            let mut failures = failures.lock().expect("failure counter lock");
            *failures += 1;
            warn!(consecutive = *failures, "side-output flush failed: {e}");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
