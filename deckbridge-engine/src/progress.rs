//! Progress transport and cancellation
//!
//! Progress events travel on a bounded channel with drop-oldest
//! semantics: a slow consumer loses intermediate percentages, never the
//! producer's throughput. Terminal events use a separate unbounded channel
//! so completion, error and cancellation can not be dropped under load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};

/// Capacity of the bounded progress queue.
pub const PROGRESS_QUEUE_LEN: usize = 64;

/// A progress update: percentage plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub percent: u8,
    pub message: String,
}

/// Terminal outcome of a conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Done,
    Error(String),
    Cancelled,
}

/// Producer half. Cloneable; shared by the driver and the writers.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    events_tx: Sender<ProgressEvent>,
    events_rx: Receiver<ProgressEvent>,
    terminal_tx: Sender<Terminal>,
}

impl ProgressSink {
    /// Send a progress event, discarding the oldest queued event when the
    /// consumer lags.
    pub fn send(&self, percent: u8, message: impl Into<String>) {
        let mut event = ProgressEvent {
            percent,
            message: message.into(),
        };
        loop {
            match self.events_tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(ev)) => {
                    let _ = self.events_rx.try_recv();
                    event = ev;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Send the terminal event. Never dropped.
    pub fn finish(&self, terminal: Terminal) {
        let _ = self.terminal_tx.send(terminal);
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct ProgressStream {
    pub events: Receiver<ProgressEvent>,
    pub terminal: Receiver<Terminal>,
}

/// Create a linked sink/stream pair.
pub fn progress_channel() -> (ProgressSink, ProgressStream) {
    let (events_tx, events_rx) = bounded(PROGRESS_QUEUE_LEN);
    let (terminal_tx, terminal_rx) = unbounded();
    (
        ProgressSink {
            events_tx,
            events_rx: events_rx.clone(),
            terminal_tx,
        },
        ProgressStream {
            events: events_rx,
            terminal: terminal_rx,
        },
    )
}

/// Caller-owned cancellation flag, polled by the engine between tracks,
/// pages and copied files.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_oldest_under_load() {
        let (sink, stream) = progress_channel();
        for i in 0..(PROGRESS_QUEUE_LEN + 10) {
            sink.send((i % 100) as u8, format!("step {i}"));
        }
        // Queue holds the newest 64 events; the first ten were dropped.
        let first = stream.events.try_recv().unwrap();
        assert_eq!(first.message, "step 10");
        assert_eq!(stream.events.len(), PROGRESS_QUEUE_LEN - 1);
    }

    #[test]
    fn test_terminal_never_dropped() {
        let (sink, stream) = progress_channel();
        for i in 0..200 {
            sink.send(0, format!("{i}"));
        }
        sink.finish(Terminal::Done);
        assert_eq!(stream.terminal.recv().unwrap(), Terminal::Done);
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_send_after_consumer_drop() {
        let (sink, stream) = progress_channel();
        drop(stream);
        // Must not panic or block.
        sink.send(50, "ignored");
        sink.finish(Terminal::Done);
    }
}
