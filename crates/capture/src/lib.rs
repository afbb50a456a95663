//! Hijack Capture - Record Sinks and Capture Sessions
//!
//! This crate holds the seams between the interception engine and the
//! outside world:
//! - Where finalized records go ([`CaptureSink`])
//! - Which capture session is current ([`session`])
//! - How timestamps and thread ids are obtained ([`clock`])
//!
//! # Architecture
//!
//! The engine hands every finished [`Timer`](hijack_sdk::Timer) to a
//! [`CaptureSink`] by value and forgets about it. Transport, batching and
//! persistence belong to the sink implementation. [`ChannelSink`] is the
//! production sink: a bounded crossbeam channel drained by a consumer thread.
//!
//! # Thread Safety
//!
//! Sinks are called from whichever thread executed the hooked function and
//! must synchronize internally. They must not block.

pub mod clock;
pub mod error;
pub mod session;
pub mod sink;

pub use clock::{current_thread_id, ticks};
pub use error::SinkError;
pub use session::{begin_session, current_session};
pub use sink::{CaptureEvent, CaptureSink, ChannelSink, MemorySink, NullSink};
