//! The seam between the connection state machine and an actual socket.
//! A [`Connector`] opens links; each link reports its lifecycle through
//! [`LinkEvents`] tagged with the generation it was opened under.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use url::Url;

pub mod mock;
pub mod websocket;

/// Close code reported when a link dies without a close frame, including a
/// handshake that never completed.
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection is not open")]
    NotOpen,
    #[error("link closed")]
    Closed,
    #[error("invalid handshake request: {0}")]
    Request(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    Text(String),
    Closed { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    pub generation: u64,
    pub event: LinkEvent,
}

type EventSink = Arc<dyn Fn(LinkMessage) + Send + Sync>;

/// Reporter handed to a link when it is opened.
#[derive(Clone)]
pub struct LinkEvents {
    generation: u64,
    sink: EventSink,
}

impl LinkEvents {
    pub fn new(generation: u64, sink: EventSink) -> Self {
        Self { generation, sink }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self) {
        self.emit(LinkEvent::Opened);
    }

    pub fn text(&self, text: String) {
        self.emit(LinkEvent::Text(text));
    }

    pub fn closed(&self, code: u16, reason: impl Into<String>) {
        self.emit(LinkEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    fn emit(&self, event: LinkEvent) {
        (self.sink)(LinkMessage {
            generation: self.generation,
            event,
        });
    }
}

impl fmt::Debug for LinkEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEvents")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Everything needed to open one link.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: Url,
    /// Sent as `Authorization: Bearer ...` when present.
    pub bearer: Option<String>,
}

impl ConnectRequest {
    /// URL safe to log: the token query parameter is masked.
    pub fn redacted_url(&self) -> String {
        if self.url.query_pairs().any(|(key, _)| key == "token") {
            let mut url = self.url.clone();
            let pairs: Vec<(String, String)> = self
                .url
                .query_pairs()
                .map(|(key, value)| {
                    let value = if key == "token" {
                        "<redacted>".to_string()
                    } else {
                        value.into_owned()
                    };
                    (key.into_owned(), value)
                })
                .collect();
            url.query_pairs_mut().clear().extend_pairs(pairs);
            url.to_string()
        } else {
            self.url.to_string()
        }
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("url", &self.redacted_url())
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One live (or opening) socket.
pub trait Link: Send + Sync {
    /// Queues a text frame. Fails synchronously when the link is known dead.
    fn send(&self, text: String) -> Result<(), TransportError>;
    fn close(&self, code: u16, reason: &str);
}

pub trait Connector: Send + Sync {
    /// Starts opening a link and returns immediately. The outcome arrives as
    /// `Opened` or `Closed` through `events`; a failed handshake reports
    /// [`ABNORMAL_CLOSURE`] unless the server answered with something more
    /// specific.
    fn open(&self, request: ConnectRequest, events: LinkEvents) -> Box<dyn Link>;
}
