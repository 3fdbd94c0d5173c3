use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Receives `(bytes_done, bytes_total)` updates.
///
/// Sinks are shared between workers in `run_many`, so they must be callable
/// concurrently and must return quickly. Slow consumers (terminal rendering)
/// should sit behind a [`ChannelSink`].
pub trait ProgressSink: Send + Sync {
    fn update(&self, bytes_done: u64, bytes_total: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn update(&self, bytes_done: u64, bytes_total: u64) {
        self(bytes_done, bytes_total)
    }
}

/// Sink that drops every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _bytes_done: u64, _bytes_total: u64) {}
}

pub fn no_progress() -> Arc<dyn ProgressSink> {
    Arc::new(NoProgress)
}

/// One progress update as delivered through a [`ChannelSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Forwards updates into an unbounded queue so workers never wait on the reader
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn update(&self, bytes_done: u64, bytes_total: u64) {
        // Receiver gone means nobody is rendering any more
        let _ = self.tx.send(ProgressEvent {
            bytes_done,
            bytes_total,
        });
    }
}

/// Per-session progress reporting.
///
/// Keeps the reported byte count monotonic and makes sure the final
/// `(total, total)` tuple is emitted exactly once, by [`finish`](Self::finish).
pub(crate) struct ProgressTracker {
    sink: Arc<dyn ProgressSink>,
    total: u64,
    done: u64,
    finished: bool,
}

impl ProgressTracker {
    pub(crate) fn new(sink: Arc<dyn ProgressSink>, total: u64, already_done: u64) -> Self {
        Self {
            sink,
            total,
            done: already_done.min(total),
            finished: false,
        }
    }

    /// Report the initial position, useful when resuming mid-file
    pub(crate) fn start(&self) {
        if self.done > 0 && self.done < self.total {
            self.sink.update(self.done, self.total);
        }
    }

    /// Record `n` more bytes. Reaching the total is left to `finish`.
    pub(crate) fn advance(&mut self, n: u64) {
        self.done = self.done.saturating_add(n).min(self.total);
        if self.done < self.total {
            self.sink.update(self.done, self.total);
        }
    }

    pub(crate) fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.done = self.total;
            self.sink.update(self.total, self.total);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    done: u64,
    total: u64,
}

/// Combines per-file progress into one running total for `run_many`
pub(crate) struct AggregateProgress {
    slots: Mutex<Vec<Slot>>,
    sink: Arc<dyn ProgressSink>,
}

impl AggregateProgress {
    pub(crate) fn new(files: usize, sink: Arc<dyn ProgressSink>) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![Slot::default(); files]),
            sink,
        })
    }

    /// Sink for file number `index`
    pub(crate) fn sink_for(self: &Arc<Self>, index: usize) -> Arc<dyn ProgressSink> {
        let aggregate = Arc::clone(self);
        Arc::new(move |done: u64, total: u64| aggregate.record(index, done, total))
    }

    fn record(&self, index: usize, done: u64, total: u64) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        if let Some(slot) = slots.get_mut(index) {
            slot.done = slot.done.max(done);
            slot.total = total;
        }
        let (done, total) = slots
            .iter()
            .fold((0u64, 0u64), |(d, t), s| (d + s.done, t + s.total));
        // Forward while holding the lock so the combined total never goes backwards
        self.sink.update(done, total);
    }
}
