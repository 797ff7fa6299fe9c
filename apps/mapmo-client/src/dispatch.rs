use mapmo_proto::{
    ChatMessage, ConversationEnded, CountdownState, Decoded, KeepStatus, MatchFound, ServerFrame,
    TypingStatus, decode,
};
use tracing::{debug, trace, warn};

/// Receiver of decoded server frames, one method per tag.
pub trait FrameHandler {
    fn on_ping(&mut self);
    fn on_chat_message(&mut self, message: ChatMessage);
    fn on_match_found(&mut self, found: MatchFound);
    fn on_keep_status(&mut self, status: KeepStatus);
    fn on_typing(&mut self, status: TypingStatus);
    fn on_conversation_ended(&mut self, ended: ConversationEnded);
    fn on_countdown_update(&mut self, state: CountdownState);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Routed(&'static str),
    Unknown(String),
    Malformed,
}

/// Decodes one text frame and routes it. Bad frames are logged and dropped;
/// they never affect the connection.
pub fn dispatch<H>(handler: &mut H, text: &str) -> Dispatched
where
    H: FrameHandler + ?Sized,
{
    let frame = match decode(text) {
        Ok(Decoded::Frame(frame)) => frame,
        Ok(Decoded::Unknown { kind }) => {
            debug!(target: "mapmo::dispatch", %kind, "ignoring unknown frame");
            return Dispatched::Unknown(kind);
        }
        Err(err) => {
            warn!(target: "mapmo::dispatch", error = %err, bytes = text.len(), "dropping malformed frame");
            return Dispatched::Malformed;
        }
    };
    let kind = frame.kind();
    trace!(target: "mapmo::dispatch", kind, "routing frame");
    match frame {
        ServerFrame::Ping => handler.on_ping(),
        ServerFrame::ChatMessage(message) => handler.on_chat_message(message),
        ServerFrame::Typing(status) => handler.on_typing(status),
        ServerFrame::MatchFound(found) => handler.on_match_found(found),
        ServerFrame::KeepStatus(status) => handler.on_keep_status(status),
        ServerFrame::ConversationEnded(ended) => handler.on_conversation_ended(ended),
        ServerFrame::CountdownUpdate(state) => handler.on_countdown_update(state),
    }
    Dispatched::Routed(kind)
}
