//! In-memory connector for tests. Each opened link gets a [`MockRemote`]
//! that plays the server side: accept, push frames, drop with a close code,
//! and inspect what the client sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mapmo_proto::Envelope;
use tokio::time::Instant;

use super::{ABNORMAL_CLOSURE, ConnectRequest, Connector, Link, LinkEvents, TransportError};

#[derive(Debug, Clone)]
pub struct SentFrame {
    pub at: Instant,
    pub text: String,
    /// False when the send was rejected by [`MockConnector::fail_sends`].
    pub delivered: bool,
}

impl SentFrame {
    pub fn envelope(&self) -> Option<Envelope> {
        serde_json::from_str(&self.text).ok()
    }
}

struct LinkShared {
    request: ConnectRequest,
    events: LinkEvents,
    opened_at: Instant,
    sent: Mutex<Vec<SentFrame>>,
    closed_with: Mutex<Option<u16>>,
    dead: AtomicBool,
}

#[derive(Default)]
struct MockState {
    links: Vec<Arc<LinkShared>>,
    refuse: bool,
    hold_handshakes: bool,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
    fail_sends: Arc<AtomicBool>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// New handshakes fail at once with an abnormal closure.
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }

    /// New handshakes stay pending until [`MockRemote::accept`].
    pub fn hold_handshakes(&self, hold: bool) {
        lock(&self.state).hold_handshakes = hold;
    }

    /// Every link rejects sends synchronously while set.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        lock(&self.state).links.len()
    }

    pub fn remotes(&self) -> Vec<MockRemote> {
        lock(&self.state)
            .links
            .iter()
            .map(|shared| MockRemote {
                shared: Arc::clone(shared),
            })
            .collect()
    }

    pub fn latest(&self) -> Option<MockRemote> {
        self.remotes().pop()
    }
}

impl Connector for MockConnector {
    fn open(&self, request: ConnectRequest, events: LinkEvents) -> Box<dyn Link> {
        let shared = Arc::new(LinkShared {
            request,
            events,
            opened_at: Instant::now(),
            sent: Mutex::new(Vec::new()),
            closed_with: Mutex::new(None),
            dead: AtomicBool::new(false),
        });
        let (refuse, hold) = {
            let mut state = lock(&self.state);
            state.links.push(Arc::clone(&shared));
            (state.refuse, state.hold_handshakes)
        };
        if refuse {
            shared.dead.store(true, Ordering::SeqCst);
            shared.events.closed(ABNORMAL_CLOSURE, "connection refused");
        } else if !hold {
            shared.events.opened();
        }
        Box::new(MockLink {
            shared,
            fail_sends: Arc::clone(&self.fail_sends),
        })
    }
}

struct MockLink {
    shared: Arc<LinkShared>,
    fail_sends: Arc<AtomicBool>,
}

impl Link for MockLink {
    fn send(&self, text: String) -> Result<(), TransportError> {
        if self.shared.dead.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let delivered = !self.fail_sends.load(Ordering::SeqCst);
        lock(&self.shared.sent).push(SentFrame {
            at: Instant::now(),
            text,
            delivered,
        });
        if delivered {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn close(&self, code: u16, _reason: &str) {
        self.shared.dead.store(true, Ordering::SeqCst);
        *lock(&self.shared.closed_with) = Some(code);
    }
}

/// Server side of one mock link.
#[derive(Clone)]
pub struct MockRemote {
    shared: Arc<LinkShared>,
}

impl MockRemote {
    pub fn generation(&self) -> u64 {
        self.shared.events.generation()
    }

    pub fn request(&self) -> ConnectRequest {
        self.shared.request.clone()
    }

    pub fn opened_at(&self) -> Instant {
        self.shared.opened_at
    }

    pub fn accept(&self) {
        self.shared.events.opened();
    }

    pub fn push(&self, frame: serde_json::Value) {
        self.push_text(frame.to_string());
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.shared.events.text(text.into());
    }

    /// Server-initiated close.
    pub fn drop_with(&self, code: u16) {
        self.shared.dead.store(true, Ordering::SeqCst);
        self.shared.events.closed(code, "closed by mock server");
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        lock(&self.shared.sent).clone()
    }

    /// Delivered frames with the given tag, oldest first.
    pub fn sent_of_kind(&self, kind: &str) -> Vec<(Instant, Envelope)> {
        self.sent()
            .into_iter()
            .filter(|frame| frame.delivered)
            .filter_map(|frame| frame.envelope().map(|env| (frame.at, env)))
            .filter(|(_, env)| env.kind == kind)
            .collect()
    }

    /// Close code the client used, if it closed this link.
    pub fn closed_with(&self) -> Option<u16> {
        *lock(&self.shared.closed_with)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
