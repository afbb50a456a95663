//! Timer record emitted for every intercepted call

/// Kind of record, drawn from a closed set
///
/// The kind decides which [`Timer::user_data`] slots carry meaning.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Plain function call
    #[default]
    Call = 0,
    /// Allocation: `user_data[0]` = returned pointer, `user_data[1]` = size
    Alloc = 1,
    /// Free: `user_data[0]` = freed pointer
    Free = 2,
    /// Zone delimited by zone-start/zone-stop hooks; `function_address` is the
    /// address of the zone name literal
    Zone = 3,
    /// Engine object method call: `user_data[0]` = object pointer
    EngineObject = 4,
    /// First call of a function on a thread within a session
    PerThreadUniqueCall = 5,
    /// Core activity interval
    CoreActivity = 6,
    /// Instrumentation measuring itself
    Introspection = 7,
}

impl TimerKind {
    /// Every kind, in discriminant order
    pub const ALL: [TimerKind; 8] = [
        TimerKind::Call,
        TimerKind::Alloc,
        TimerKind::Free,
        TimerKind::Zone,
        TimerKind::EngineObject,
        TimerKind::PerThreadUniqueCall,
        TimerKind::CoreActivity,
        TimerKind::Introspection,
    ];

    /// Decode a raw discriminant
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Names of the meaningful `user_data` slots, in slot order
    pub fn user_data_slots(self) -> &'static [&'static str] {
        match self {
            TimerKind::Alloc => &["pointer", "size"],
            TimerKind::Free => &["pointer"],
            TimerKind::EngineObject => &["object"],
            TimerKind::Zone => &["name"],
            _ => &[],
        }
    }
}

/// Enter/exit measurement handed to the capture sink by value
///
/// Timestamps are monotonic nanosecond ticks.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    /// Hooked function address, or the name literal address for zones
    pub function_address: u64,
    pub start: u64,
    pub end: u64,
    /// Hash of the observed callstack, 0 when not tracked
    pub callstack_hash: u64,
    pub user_data: [u64; 2],
    pub thread_id: u32,
    /// Frame stack depth at entry
    pub depth: u8,
    pub kind: TimerKind,
}

impl Timer {
    pub fn new(function_address: u64, kind: TimerKind) -> Self {
        Self {
            function_address,
            kind,
            ..Self::default()
        }
    }

    pub fn start_at(&mut self, ticks: u64) {
        self.start = ticks;
        self.end = ticks;
    }

    /// Finalize the record; never moves `end` before `start`
    pub fn stop_at(&mut self, ticks: u64) {
        self.end = ticks.max(self.start);
    }

    pub fn elapsed_ns(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn elapsed_micros(&self) -> f64 {
        self.elapsed_ns() as f64 / 1_000.0
    }

    /// Whether `start <= end`
    pub fn is_finalized(&self) -> bool {
        self.start <= self.end
    }
}
