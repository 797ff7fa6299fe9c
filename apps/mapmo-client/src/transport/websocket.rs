use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

use super::{ABNORMAL_CLOSURE, ConnectRequest, Connector, Link, LinkEvents, TransportError};
use crate::connection::CLOSE_AUTH_FAILED;

const NO_STATUS_RECEIVED: u16 = 1005;

enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

/// Opens real sockets with tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn open(&self, request: ConnectRequest, events: LinkEvents) -> Box<dyn Link> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(request, rx, events));
        Box::new(WebSocketLink { tx })
    }
}

/// Handle to a pump task. Dropping it lets the pump send a normal close and
/// wind down on its own.
struct WebSocketLink {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Link for WebSocketLink {
    fn send(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(Outgoing::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outgoing::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

fn build_request(request: &ConnectRequest) -> Result<Request, TransportError> {
    let mut ws_request = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| TransportError::Request(err.to_string()))?;
    if let Some(token) = &request.bearer {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| TransportError::Request(err.to_string()))?;
        ws_request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(ws_request)
}

/// Maps a failed handshake to the close code the state machine should see.
fn handshake_close_code(err: &WsError) -> u16 {
    match err {
        WsError::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            CLOSE_AUTH_FAILED
        }
        _ => ABNORMAL_CLOSURE,
    }
}

async fn run_link(
    request: ConnectRequest,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: LinkEvents,
) {
    let generation = events.generation();
    let ws_request = match build_request(&request) {
        Ok(ws_request) => ws_request,
        Err(err) => {
            warn!(target: "mapmo::transport", generation, error = %err, "cannot build handshake");
            events.closed(ABNORMAL_CLOSURE, err.to_string());
            return;
        }
    };

    let stream = match connect_async(ws_request).await {
        Ok((stream, _response)) => stream,
        Err(err) => {
            let code = handshake_close_code(&err);
            warn!(target: "mapmo::transport", generation, code, error = %err, "handshake failed");
            events.closed(code, err.to_string());
            return;
        }
    };
    debug!(target: "mapmo::transport", generation, url = %request.redacted_url(), "socket open");
    events.opened();

    let (mut sink, mut source) = stream.split();
    let mut outgoing_open = true;
    loop {
        tokio::select! {
            next = outgoing.recv(), if outgoing_open => match next {
                Some(Outgoing::Text(text)) => {
                    trace!(target: "mapmo::transport", generation, bytes = text.len(), "send");
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        warn!(target: "mapmo::transport", generation, error = %err, "send failed");
                        events.closed(ABNORMAL_CLOSURE, err.to_string());
                        return;
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    outgoing_open = false;
                    send_close(&mut sink, code, reason).await;
                }
                None => {
                    outgoing_open = false;
                    send_close(&mut sink, crate::connection::CLOSE_NORMAL, String::new()).await;
                }
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => events.text(text),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    debug!(target: "mapmo::transport", generation, code, %reason, "socket closed by peer");
                    events.closed(code, reason);
                    return;
                }
                // Protocol pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(target: "mapmo::transport", generation, error = %err, "socket error");
                    events.closed(ABNORMAL_CLOSURE, err.to_string());
                    return;
                }
                None => {
                    events.closed(ABNORMAL_CLOSURE, "stream ended");
                    return;
                }
            }
        }
    }
}

async fn send_close<S>(sink: &mut S, code: u16, reason: String)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    if let Err(err) = sink.send(Message::Close(Some(frame))).await {
        debug!(target: "mapmo::transport", error = %err, "close frame not sent");
    }
}
