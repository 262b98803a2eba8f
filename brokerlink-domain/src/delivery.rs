use std::time::Duration;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Message priority, `0` (lowest) to `9` (highest).
///
/// Values outside the range are clamped on construction so a producer can
/// never hand the broker an out-of-band priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

const MAX_PRIORITY: u8 = 9;

// ---

impl Priority {
    // ---
    /// Broker default priority.
    pub const DEFAULT: Priority = Priority(4);

    /// Clamp a raw value into `0..=9`.
    pub fn new(value: u8) -> Self {
        // ---
        Self(value.min(MAX_PRIORITY))
    }

    /// Return the raw priority value.
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// `true` for priorities 5..=9, which brokers conventionally expedite.
    pub fn is_expedited(self) -> bool {
        self.0 > Self::DEFAULT.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ---------------------------------------------------------------------------
// DeliveryMode
// ---------------------------------------------------------------------------

/// Whether the broker must persist a message before acknowledging the send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    // ---
    NonPersistent,

    #[default]
    Persistent,
}

// ---------------------------------------------------------------------------
// SendOptions
// ---------------------------------------------------------------------------

/// Per-send parameters passed through to the broker client unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    // ---
    pub delivery_mode: DeliveryMode,

    pub priority: Priority,

    /// `None` = the message never expires.
    pub time_to_live: Option<Duration>,
}

// ---

impl SendOptions {
    // ---
    pub fn new(delivery_mode: DeliveryMode, priority: Priority, time_to_live: Option<Duration>) -> Self {
        // ---
        Self {
            delivery_mode,
            priority,
            time_to_live,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::Priority;

    #[test]
    fn priority_clamps_to_nine() {
        assert_eq!(Priority::new(42).as_u8(), 9);
        assert!(Priority::new(7).is_expedited());
        assert!(!Priority::default().is_expedited());
    }
}
