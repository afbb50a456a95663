//! Error types for capture sinks

/// Error type for sink delivery
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Bounded sink is full, the event was dropped
    #[error("Capture sink full, event dropped")]
    Full,

    /// Consumer side of the sink is gone
    #[error("Capture sink disconnected")]
    Disconnected,
}
