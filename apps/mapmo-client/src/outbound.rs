use std::time::Duration;

use mapmo_proto::{ClientFrame, FrameError};
use tracing::{debug, warn};

use crate::transport::TransportError;

/// Anything that can put an encoded frame on the wire right now.
pub trait FrameSink {
    fn send_text(&self, text: String) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub step: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry_count + 1`: linear in the retry count.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.step.saturating_mul(retry_count.saturating_add(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub frame: ClientFrame,
    pub retry_count: u32,
}

impl OutboundFrame {
    pub fn new(frame: ClientFrame) -> Self {
        Self {
            frame,
            retry_count: 0,
        }
    }

    /// Losing one of these is worth telling the user about.
    pub fn is_user_content(&self) -> bool {
        matches!(self.frame, ClientFrame::ChatMessage { .. })
    }
}

#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    /// Schedule another attempt with the bumped frame after `delay`.
    Retry { frame: OutboundFrame, delay: Duration },
    Exhausted(OutboundFrame),
    /// The frame cannot be encoded; retrying would not help.
    Dropped(FrameError),
}

/// Stateless delivery with linear retry. Scheduling the retry is up to the
/// caller so retries die with whatever scope owns them.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboundSender {
    policy: RetryPolicy,
}

impl OutboundSender {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn send(&self, sink: &dyn FrameSink, mut frame: OutboundFrame) -> SendOutcome {
        let kind = frame.frame.kind();
        let text = match frame.frame.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "mapmo::outbound", kind, error = %err, "dropping unencodable frame");
                return SendOutcome::Dropped(err);
            }
        };
        let err = match sink.send_text(text) {
            Ok(()) => {
                debug!(target: "mapmo::outbound", kind, retry = frame.retry_count, "frame sent");
                return SendOutcome::Sent;
            }
            Err(err) => err,
        };
        if frame.retry_count >= self.policy.max_retries {
            warn!(
                target: "mapmo::outbound",
                kind,
                retries = frame.retry_count,
                error = %err,
                "giving up on frame"
            );
            return SendOutcome::Exhausted(frame);
        }
        let delay = self.policy.delay_for(frame.retry_count);
        frame.retry_count += 1;
        debug!(
            target: "mapmo::outbound",
            kind,
            retry = frame.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "send failed; retrying"
        );
        SendOutcome::Retry { frame, delay }
    }
}
