//! Owns the single live link to the server and the reconnect state machine:
//! `Idle -> Connecting -> Open -> {Closed | Reconnecting -> Connecting}`.

use std::sync::Arc;
use std::time::Duration;

use mapmo_proto::ClientFrame;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::CredentialMode;
use crate::error::ClientError;
use crate::outbound::FrameSink;
use crate::session::Session;
use crate::transport::{ConnectRequest, Connector, Link, LinkEvents, LinkMessage, TransportError};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_AUTH_FAILED: u16 = 4001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    Normal,
    AuthFailed,
    GaveUp,
    LoggedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed(TerminalReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    Normal,
    AuthFailure,
    Transient,
}

impl CloseDisposition {
    pub fn classify(code: u16) -> Self {
        match code {
            CLOSE_NORMAL => CloseDisposition::Normal,
            CLOSE_AUTH_FAILED => CloseDisposition::AuthFailure,
            _ => CloseDisposition::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the `attempt`-th reconnect (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// What the runtime should do about a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The close belongs to a link that was already replaced or closed.
    Stale,
    Terminal(TerminalReason),
    Retry { attempt: u32, delay: Duration },
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    socket_base: Url,
    credential_mode: CredentialMode,
    policy: ReconnectPolicy,
    sink: Arc<dyn Fn(LinkMessage) + Send + Sync>,
    state: ConnectionState,
    attempt_count: u32,
    generation: u64,
    link: Option<Box<dyn Link>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        socket_base: Url,
        credential_mode: CredentialMode,
        policy: ReconnectPolicy,
        sink: Arc<dyn Fn(LinkMessage) + Send + Sync>,
    ) -> Self {
        Self {
            connector,
            socket_base,
            credential_mode,
            policy,
            sink,
            state: ConnectionState::Idle,
            attempt_count: 0,
            generation: 0,
            link: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && !matches!(self.state, ConnectionState::Closed(_))
    }

    /// Opens a fresh link, replacing any previous one wholesale.
    pub fn connect(&mut self, session: &Session) -> Result<u64, ClientError> {
        if !session.has_token() {
            return Err(ClientError::MissingToken);
        }
        let request = socket_request(&self.socket_base, session, self.credential_mode)?;
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        info!(
            target: "mapmo::connection",
            generation = self.generation,
            attempt = self.attempt_count,
            url = %request.redacted_url(),
            "connecting"
        );
        let events = LinkEvents::new(self.generation, Arc::clone(&self.sink));
        // The old link, if any, winds down once its handle is dropped.
        self.link = Some(self.connector.open(request, events));
        Ok(self.generation)
    }

    /// Connects unless a link is already open or on its way. A user action
    /// that needs the socket may revive a closed connection this way.
    pub fn ensure_connected(&mut self, session: &Session) -> Result<Option<u64>, ClientError> {
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting | ConnectionState::Reconnecting => {
                Ok(None)
            }
            ConnectionState::Idle | ConnectionState::Closed(_) => {
                self.attempt_count = 0;
                self.connect(session).map(Some)
            }
        }
    }

    /// Returns true when the event applied to the current link.
    pub fn on_opened(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(target: "mapmo::connection", generation, current = self.generation, "ignoring stale open");
            return false;
        }
        info!(target: "mapmo::connection", generation, "connection open");
        self.state = ConnectionState::Open;
        self.attempt_count = 0;
        true
    }

    pub fn on_closed(&mut self, generation: u64, code: u16) -> CloseOutcome {
        if !self.is_current(generation) {
            debug!(target: "mapmo::connection", generation, code, "ignoring stale close");
            return CloseOutcome::Stale;
        }
        self.link = None;
        match CloseDisposition::classify(code) {
            CloseDisposition::Normal => {
                info!(target: "mapmo::connection", generation, "closed normally");
                self.state = ConnectionState::Closed(TerminalReason::Normal);
                CloseOutcome::Terminal(TerminalReason::Normal)
            }
            CloseDisposition::AuthFailure => {
                warn!(target: "mapmo::connection", generation, "server rejected credential");
                self.state = ConnectionState::Closed(TerminalReason::AuthFailed);
                CloseOutcome::Terminal(TerminalReason::AuthFailed)
            }
            CloseDisposition::Transient => {
                self.attempt_count += 1;
                if self.attempt_count > self.policy.max_attempts {
                    warn!(
                        target: "mapmo::connection",
                        generation,
                        code,
                        attempts = self.policy.max_attempts,
                        "giving up on reconnection"
                    );
                    self.state = ConnectionState::Closed(TerminalReason::GaveUp);
                    return CloseOutcome::Terminal(TerminalReason::GaveUp);
                }
                let delay = self.policy.delay_for(self.attempt_count);
                warn!(
                    target: "mapmo::connection",
                    generation,
                    code,
                    attempt = self.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    "connection lost; scheduling reconnect"
                );
                self.state = ConnectionState::Reconnecting;
                CloseOutcome::Retry {
                    attempt: self.attempt_count,
                    delay,
                }
            }
        }
    }

    /// Fires when a reconnect delay elapses. Without a session the attempt
    /// is abandoned.
    pub fn reconnect_due(&mut self, session: Option<&Session>) -> Result<Option<u64>, ClientError> {
        if self.state != ConnectionState::Reconnecting {
            return Ok(None);
        }
        match session {
            Some(session) => self.connect(session).map(Some),
            None => {
                debug!(target: "mapmo::connection", "session gone; abandoning reconnect");
                self.state = ConnectionState::Closed(TerminalReason::LoggedOut);
                Ok(None)
            }
        }
    }

    pub fn reply_pong(&self) {
        match ClientFrame::pong().encode() {
            Ok(text) => {
                if let Err(err) = self.send_text(text) {
                    debug!(target: "mapmo::connection", error = %err, "pong not sent");
                }
            }
            Err(err) => warn!(target: "mapmo::connection", error = %err, "cannot encode pong"),
        }
    }

    pub fn close_normal(&mut self) {
        self.shutdown(TerminalReason::Normal);
    }

    pub fn logout(&mut self) {
        self.shutdown(TerminalReason::LoggedOut);
    }

    fn shutdown(&mut self, reason: TerminalReason) {
        if let Some(link) = self.link.take() {
            link.close(CLOSE_NORMAL, "client closing");
        }
        if !matches!(self.state, ConnectionState::Closed(_) | ConnectionState::Idle) {
            info!(target: "mapmo::connection", generation = self.generation, ?reason, "closing connection");
        }
        self.state = ConnectionState::Closed(reason);
        self.attempt_count = 0;
    }
}

impl FrameSink for ConnectionManager {
    fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.state != ConnectionState::Open {
            return Err(TransportError::NotOpen);
        }
        let link = self.link.as_ref().ok_or(TransportError::NotOpen)?;
        trace!(target: "mapmo::connection", generation = self.generation, bytes = text.len(), "send");
        link.send(text)
    }
}

/// `<base>/ws/<user_id>`, with the credential as a query parameter when the
/// header cannot be used.
pub fn socket_request(
    base: &Url,
    session: &Session,
    mode: CredentialMode,
) -> Result<ConnectRequest, ClientError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ClientError::InvalidServer {
            address: base.to_string(),
            reason: "cannot carry a path".into(),
        })?
        .pop_if_empty()
        .push("ws")
        .push(&session.user_id().to_string());
    let bearer = match mode {
        CredentialMode::Header => Some(session.auth_token().to_string()),
        CredentialMode::Query => {
            url.query_pairs_mut()
                .append_pair("token", session.auth_token());
            None
        }
    };
    Ok(ConnectRequest { url, bearer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnector;
    use crate::transport::{ABNORMAL_CLOSURE, LinkEvent};
    use std::sync::Mutex;

    struct Harness {
        manager: ConnectionManager,
        connector: MockConnector,
        events: Arc<Mutex<Vec<LinkMessage>>>,
        session: Session,
    }

    fn harness() -> Harness {
        let connector = MockConnector::new();
        connector.hold_handshakes(true);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = Arc::clone(&events);
            Arc::new(move |msg: LinkMessage| events.lock().unwrap().push(msg))
        };
        let manager = ConnectionManager::new(
            Arc::new(connector.clone()),
            Url::parse("ws://127.0.0.1:8000/").unwrap(),
            CredentialMode::Header,
            ReconnectPolicy::default(),
            sink,
        );
        Harness {
            manager,
            connector,
            events,
            session: Session::new(42, "tok"),
        }
    }

    #[test]
    fn reconnect_delays_double_until_the_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn socket_url_shapes() {
        let base = Url::parse("wss://chat.mapmo.app/").unwrap();
        let session = Session::new(42, "t0k");
        let header = socket_request(&base, &session, CredentialMode::Header).unwrap();
        assert_eq!(header.url.as_str(), "wss://chat.mapmo.app/ws/42");
        assert_eq!(header.bearer.as_deref(), Some("t0k"));

        let query = socket_request(&base, &session, CredentialMode::Query).unwrap();
        assert_eq!(query.url.as_str(), "wss://chat.mapmo.app/ws/42?token=t0k");
        assert_eq!(query.bearer, None);

        let prefixed = Url::parse("https://example.com/mapmo/").unwrap();
        let req = socket_request(&prefixed, &session, CredentialMode::Header).unwrap();
        assert_eq!(req.url.path(), "/mapmo/ws/42");
    }

    #[test]
    fn refuses_to_connect_without_token() {
        let mut h = harness();
        let err = h.manager.connect(&Session::new(1, "")).unwrap_err();
        assert!(matches!(err, ClientError::MissingToken));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert_eq!(h.connector.attempts(), 0);
    }

    #[test]
    fn transient_closes_back_off_then_give_up() {
        let mut h = harness();
        let generation = h.manager.connect(&h.session).unwrap();
        assert!(h.manager.on_opened(generation));

        let mut delays = Vec::new();
        let mut current = generation;
        for _ in 0..5 {
            match h.manager.on_closed(current, ABNORMAL_CLOSURE) {
                CloseOutcome::Retry { delay, .. } => delays.push(delay.as_secs()),
                other => panic!("unexpected {other:?}"),
            }
            current = h.manager.reconnect_due(Some(&h.session)).unwrap().unwrap();
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(
            h.manager.on_closed(current, ABNORMAL_CLOSURE),
            CloseOutcome::Terminal(TerminalReason::GaveUp)
        );
        assert_eq!(h.manager.state(), ConnectionState::Closed(TerminalReason::GaveUp));
        assert_eq!(h.connector.attempts(), 6);
    }

    #[test]
    fn successful_open_resets_attempts() {
        let mut h = harness();
        let generation = h.manager.connect(&h.session).unwrap();
        h.manager.on_closed(generation, 1011);
        let generation = h.manager.reconnect_due(Some(&h.session)).unwrap().unwrap();
        assert_eq!(h.manager.attempt_count(), 1);
        assert!(h.manager.on_opened(generation));
        assert_eq!(h.manager.attempt_count(), 0);
        match h.manager.on_closed(generation, ABNORMAL_CLOSURE) {
            CloseOutcome::Retry { attempt, delay } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_secs(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn normal_and_auth_closes_are_terminal() {
        let mut h = harness();
        let generation = h.manager.connect(&h.session).unwrap();
        h.manager.on_opened(generation);
        assert_eq!(
            h.manager.on_closed(generation, CLOSE_NORMAL),
            CloseOutcome::Terminal(TerminalReason::Normal)
        );

        let generation = h.manager.ensure_connected(&h.session).unwrap().unwrap();
        h.manager.on_opened(generation);
        assert_eq!(
            h.manager.on_closed(generation, CLOSE_AUTH_FAILED),
            CloseOutcome::Terminal(TerminalReason::AuthFailed)
        );
        assert_eq!(h.manager.reconnect_due(Some(&h.session)).unwrap(), None);
        assert_eq!(h.connector.attempts(), 2);
    }

    #[test]
    fn events_from_replaced_links_are_ignored() {
        let mut h = harness();
        let first = h.manager.connect(&h.session).unwrap();
        h.manager.on_closed(first, ABNORMAL_CLOSURE);
        let second = h.manager.reconnect_due(Some(&h.session)).unwrap().unwrap();
        assert_ne!(first, second);
        assert!(!h.manager.on_opened(first));
        assert_eq!(h.manager.on_closed(first, ABNORMAL_CLOSURE), CloseOutcome::Stale);
        assert!(h.manager.on_opened(second));
    }

    #[test]
    fn reconnect_abandoned_without_session() {
        let mut h = harness();
        let generation = h.manager.connect(&h.session).unwrap();
        h.manager.on_closed(generation, ABNORMAL_CLOSURE);
        assert_eq!(h.manager.reconnect_due(None).unwrap(), None);
        assert_eq!(
            h.manager.state(),
            ConnectionState::Closed(TerminalReason::LoggedOut)
        );
        assert_eq!(h.connector.attempts(), 1);
    }

    #[test]
    fn sends_require_an_open_link_and_pong_goes_out() {
        let mut h = harness();
        assert_eq!(h.manager.send_text("x".into()), Err(TransportError::NotOpen));
        let generation = h.manager.connect(&h.session).unwrap();
        assert_eq!(h.manager.send_text("x".into()), Err(TransportError::NotOpen));
        h.manager.on_opened(generation);
        h.manager.reply_pong();
        let remote = h.connector.latest().unwrap();
        assert_eq!(remote.sent_of_kind("pong").len(), 1);
        assert_eq!(remote.request().bearer.as_deref(), Some("tok"));
    }

    #[test]
    fn close_normal_closes_link_with_1000() {
        let mut h = harness();
        let generation = h.manager.connect(&h.session).unwrap();
        h.manager.on_opened(generation);
        h.manager.close_normal();
        assert_eq!(h.connector.latest().unwrap().closed_with(), Some(CLOSE_NORMAL));
        assert_eq!(h.manager.state(), ConnectionState::Closed(TerminalReason::Normal));
        // The server's echo of our close is not a reason to reconnect.
        assert_eq!(h.manager.on_closed(generation, CLOSE_NORMAL), CloseOutcome::Stale);
    }

    #[test]
    fn held_handshake_emits_nothing_until_accepted() {
        let mut h = harness();
        h.manager.connect(&h.session).unwrap();
        assert!(h.events.lock().unwrap().is_empty());
        h.connector.latest().unwrap().accept();
        assert_eq!(h.events.lock().unwrap()[0].event, LinkEvent::Opened);
    }
}
