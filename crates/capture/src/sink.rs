//! Capture sinks
//!
//! The engine's obligation ends at a successful `add_*` call. Everything a
//! sink does must be safe to run from any thread and must not block.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use hijack_sdk::{ArgumentCapture, Timer};

use crate::error::SinkError;

/// Everything the engine can hand to a sink
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Timer(Timer),
    /// A string keyed by the address it was read from (zone names, file paths)
    String { key: u64, value: String },
    Callstack { hash: u64, frames: Vec<u64> },
    Arguments(ArgumentCapture),
}

/// Consumer of finalized records
///
/// Only [`CaptureSink::add_timer`] is required; the enrichment channels
/// default to dropping their payload.
pub trait CaptureSink: Send + Sync {
    fn add_timer(&self, timer: Timer);

    fn add_string(&self, _key: u64, _value: String) {}

    fn add_callstack(&self, _hash: u64, _frames: &[u64]) {}

    fn add_arguments(&self, _capture: ArgumentCapture) {}
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl CaptureSink for NullSink {
    fn add_timer(&self, _timer: Timer) {}
}

/// Default capacity of a [`ChannelSink`]
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Bounded channel sink
///
/// Events that do not fit are dropped and counted rather than blocking the
/// instrumented thread.
pub struct ChannelSink {
    sender: Sender<CaptureEvent>,
    receiver: Receiver<CaptureEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            dropped: AtomicU64::new(0),
        }
    }

    fn send(&self, event: CaptureEvent) -> Result<(), SinkError> {
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::Full)
            }
            Err(TrySendError::Disconnected(_)) => Err(SinkError::Disconnected),
        }
    }

    /// Receiver handle for a consumer thread
    pub fn receiver(&self) -> Receiver<CaptureEvent> {
        self.receiver.clone()
    }

    /// Drain up to `max` pending events
    pub fn drain(&self, max: usize) -> Vec<CaptureEvent> {
        self.receiver.try_iter().take(max).collect()
    }

    /// Number of pending events
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Number of events dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ChannelSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl CaptureSink for ChannelSink {
    fn add_timer(&self, timer: Timer) {
        // Full queue: drop and count
        let _ = self.send(CaptureEvent::Timer(timer));
    }

    fn add_string(&self, key: u64, value: String) {
        let _ = self.send(CaptureEvent::String { key, value });
    }

    fn add_callstack(&self, hash: u64, frames: &[u64]) {
        let _ = self.send(CaptureEvent::Callstack {
            hash,
            frames: frames.to_vec(),
        });
    }

    fn add_arguments(&self, capture: ArgumentCapture) {
        let _ = self.send(CaptureEvent::Arguments(capture));
    }
}

/// Unbounded in-memory sink
///
/// Keeps every event behind a mutex. Meant for tests and short captures.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<CaptureEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CaptureEvent> {
        self.events.lock().clone()
    }

    pub fn timers(&self) -> Vec<Timer> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::Timer(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    /// Timers recorded for one function (or zone name) address
    pub fn timers_for(&self, function_address: u64) -> Vec<Timer> {
        self.timers()
            .into_iter()
            .filter(|t| t.function_address == function_address)
            .collect()
    }

    pub fn strings(&self) -> Vec<(u64, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::String { key, value } => Some((*key, value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn callstacks(&self) -> Vec<(u64, Vec<u64>)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::Callstack { hash, frames } => Some((*hash, frames.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn arguments(&self) -> Vec<ArgumentCapture> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::Arguments(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl CaptureSink for MemorySink {
    fn add_timer(&self, timer: Timer) {
        self.events.lock().push(CaptureEvent::Timer(timer));
    }

    fn add_string(&self, key: u64, value: String) {
        self.events.lock().push(CaptureEvent::String { key, value });
    }

    fn add_callstack(&self, hash: u64, frames: &[u64]) {
        self.events.lock().push(CaptureEvent::Callstack {
            hash,
            frames: frames.to_vec(),
        });
    }

    fn add_arguments(&self, capture: ArgumentCapture) {
        self.events.lock().push(CaptureEvent::Arguments(capture));
    }
}
