//! Conversation expiry timer. Ticks locally once a second and is pulled back
//! towards the server's `(start_time, duration, both_kept)` on every resync.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mapmo_proto::CountdownState;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownPolicy {
    pub duration_secs: i64,
    pub tick: Duration,
    pub resync_interval: Duration,
    pub initial_resync_delay: Duration,
    pub drift_tolerance_secs: i64,
}

impl Default for CountdownPolicy {
    fn default() -> Self {
        Self {
            duration_secs: 300,
            tick: Duration::from_secs(1),
            resync_interval: Duration::from_secs(15),
            initial_resync_delay: Duration::from_secs(2),
            drift_tolerance_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Normal,
    /// One minute or less.
    Warning,
    /// Thirty seconds or less.
    Danger,
}

impl Urgency {
    pub fn for_seconds(seconds: i64) -> Self {
        match seconds {
            s if s <= 30 => Urgency::Danger,
            s if s <= 60 => Urgency::Warning,
            _ => Urgency::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownDisplay {
    Remaining { seconds: i64, urgency: Urgency },
    /// Both participants kept the conversation; the timer no longer applies.
    Connected,
}

impl fmt::Display for CountdownDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountdownDisplay::Remaining { seconds, .. } => {
                write!(f, "{}:{:02}", seconds / 60, seconds % 60)
            }
            CountdownDisplay::Connected => f.write_str("connected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownEffect {
    Render(CountdownDisplay),
    /// The conversation timed out. Emitted at most once.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bootstrap {
    Seeded(Vec<CountdownEffect>),
    /// No snapshot; fetch one and feed it to [`CountdownSynchronizer::resync`].
    NeedsResync,
}

#[derive(Debug)]
pub struct CountdownSynchronizer {
    policy: CountdownPolicy,
    time_left: i64,
    server_start: Option<DateTime<Utc>>,
    both_kept: bool,
    running: bool,
    expired: bool,
    stopped: bool,
}

impl CountdownSynchronizer {
    pub fn new(policy: CountdownPolicy) -> Self {
        Self {
            policy,
            time_left: policy.duration_secs,
            server_start: None,
            both_kept: false,
            running: false,
            expired: false,
            stopped: false,
        }
    }

    pub fn time_left(&self) -> i64 {
        self.time_left
    }

    pub fn both_kept(&self) -> bool {
        self.both_kept
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn display(&self) -> CountdownDisplay {
        if self.both_kept {
            CountdownDisplay::Connected
        } else {
            CountdownDisplay::Remaining {
                seconds: self.time_left,
                urgency: Urgency::for_seconds(self.time_left),
            }
        }
    }

    pub fn bootstrap(&mut self, seed: Option<&CountdownState>, now: DateTime<Utc>) -> Bootstrap {
        match seed {
            Some(state) => {
                self.running = true;
                Bootstrap::Seeded(self.adopt(state, now))
            }
            None => Bootstrap::NeedsResync,
        }
    }

    /// The bootstrap fetch failed: run from whatever is known locally.
    pub fn start_unsynced(&mut self) -> Vec<CountdownEffect> {
        if self.running || self.stopped {
            return Vec::new();
        }
        debug!(target: "mapmo::countdown", time_left = self.time_left, "starting without server snapshot");
        self.running = true;
        vec![CountdownEffect::Render(self.display())]
    }

    pub fn tick(&mut self) -> Vec<CountdownEffect> {
        if !self.running || self.stopped || self.both_kept || self.expired {
            return Vec::new();
        }
        self.time_left = (self.time_left - 1).max(0);
        let mut effects = vec![CountdownEffect::Render(self.display())];
        if self.time_left == 0 {
            effects.extend(self.expire());
        }
        effects
    }

    /// Applies a server snapshot. The first one also starts the local ticker.
    pub fn resync(&mut self, state: &CountdownState, now: DateTime<Utc>) -> Vec<CountdownEffect> {
        if self.stopped {
            return Vec::new();
        }
        if !self.running {
            self.running = true;
            return self.adopt(state, now);
        }
        if self.both_kept {
            return Vec::new();
        }
        if state.both_kept {
            return self.freeze();
        }
        if let Some(start) = state.start_time {
            self.server_start = Some(start);
        }

        let mut effects = Vec::new();
        if let Some(server_left) = self.server_time_left(state, now) {
            let drift = self.time_left - server_left;
            if drift.abs() > self.policy.drift_tolerance_secs {
                info!(
                    target: "mapmo::countdown",
                    local = self.time_left,
                    server = server_left,
                    "countdown drifted; snapping to server"
                );
                self.time_left = server_left;
                effects.push(CountdownEffect::Render(self.display()));
            }
        }
        if state.expired || self.time_left == 0 {
            effects.extend(self.expire());
        }
        effects
    }

    /// Both participants kept the conversation. Permanent, unless the
    /// countdown already expired: expiry is latched and wins.
    pub fn set_both_kept(&mut self) -> Vec<CountdownEffect> {
        if self.stopped {
            return Vec::new();
        }
        self.freeze()
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Seconds left according to the server start time, clamped to
    /// `[0, duration]`.
    pub fn derive(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        let elapsed = (now - start).num_seconds().max(0);
        (self.policy.duration_secs - elapsed).clamp(0, self.policy.duration_secs)
    }

    fn server_time_left(&self, state: &CountdownState, now: DateTime<Utc>) -> Option<i64> {
        match state.start_time.or(self.server_start) {
            Some(start) => Some(self.derive(start, now)),
            None => state
                .time_left
                .map(|left| left.clamp(0, self.policy.duration_secs)),
        }
    }

    fn adopt(&mut self, state: &CountdownState, now: DateTime<Utc>) -> Vec<CountdownEffect> {
        if state.both_kept {
            return self.freeze();
        }
        if let Some(start) = state.start_time {
            self.server_start = Some(start);
        }
        if let Some(server_left) = self.server_time_left(state, now) {
            self.time_left = server_left;
        }
        debug!(target: "mapmo::countdown", time_left = self.time_left, "countdown seeded");
        let mut effects = vec![CountdownEffect::Render(self.display())];
        if state.expired || self.time_left == 0 {
            effects.extend(self.expire());
        }
        effects
    }

    fn freeze(&mut self) -> Vec<CountdownEffect> {
        if self.both_kept {
            return Vec::new();
        }
        if self.expired {
            debug!(target: "mapmo::countdown", "both kept after expiry; the end stands");
            return Vec::new();
        }
        info!(target: "mapmo::countdown", time_left = self.time_left, "both kept; countdown frozen");
        self.both_kept = true;
        vec![CountdownEffect::Render(CountdownDisplay::Connected)]
    }

    fn expire(&mut self) -> Option<CountdownEffect> {
        if self.both_kept || self.expired || self.stopped {
            return None;
        }
        info!(target: "mapmo::countdown", "countdown expired");
        self.expired = true;
        self.time_left = 0;
        Some(CountdownEffect::Expired)
    }
}
