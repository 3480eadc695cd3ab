use std::time::{Duration, SystemTime};

/// A single cancellable wake-up. Arming replaces whatever was pending, so an
/// engine never has more than one outstanding scheduled step.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    wake_at: Option<SystemTime>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, now: SystemTime, delay_ms: u64) -> SystemTime {
        let at = now + Duration::from_millis(delay_ms);
        self.wake_at = Some(at);
        at
    }

    /// Returns whether a wake-up was pending.
    pub fn cancel(&mut self) -> bool {
        self.wake_at.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.wake_at.is_some()
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.wake_at
    }

    /// Disarm and report true if the wake-up time has been reached.
    pub fn take_due(&mut self, now: SystemTime) -> bool {
        match self.wake_at {
            Some(at) if at <= now => {
                self.wake_at = None;
                true
            }
            _ => false,
        }
    }
}
