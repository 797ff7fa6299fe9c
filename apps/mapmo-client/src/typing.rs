use std::time::Duration;

/// Issued on every input event: send `typing: true` now and schedule the
/// quiet-period check for `generation` after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingArm {
    pub generation: u64,
    pub delay: Duration,
}

/// Turns a burst of keystrokes into leading `true` frames and exactly one
/// trailing `false`.
#[derive(Debug)]
pub struct TypingDebouncer {
    quiet_period: Duration,
    generation: u64,
    armed: bool,
}

impl TypingDebouncer {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            generation: 0,
            armed: false,
        }
    }

    pub fn on_input(&mut self) -> TypingArm {
        self.generation += 1;
        self.armed = true;
        TypingArm {
            generation: self.generation,
            delay: self.quiet_period,
        }
    }

    /// True when this firing is the latest arm, i.e. the stop signal is due.
    pub fn on_quiet(&mut self, generation: u64) -> bool {
        if !self.armed || generation != self.generation {
            return false;
        }
        self.armed = false;
        true
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}
