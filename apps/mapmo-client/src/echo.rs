//! Optimistic rendering of the user's own messages and reconciliation
//! against the server's authoritative echo.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use mapmo_proto::{ChatMessage, ConversationId, ServerMessageId, UserId};
use tracing::{debug, trace};

use crate::error::ClientError;

/// Id of a message that only exists locally. Millisecond based and strictly
/// increasing per reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(u64);

impl LocalId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Local(LocalId),
    Server(ServerMessageId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_local(&self) -> bool {
        matches!(self.key, MessageKey::Local(_))
    }

    fn authoritative(inbound: ChatMessage, now: DateTime<Utc>) -> Self {
        Self {
            key: MessageKey::Server(inbound.id),
            conversation_id: inbound.conversation_id,
            sender_id: inbound.sender_id,
            content: inbound.content,
            message_type: inbound.message_type,
            created_at: inbound.created_at.unwrap_or(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEcho {
    pub local_id: LocalId,
    pub sender_id: UserId,
    pub content: String,
}

impl PendingEcho {
    fn matches(&self, inbound: &ChatMessage) -> bool {
        inbound.sender_id == self.sender_id && inbound.content == self.content
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EchoUpdate {
    Render(Message),
    Retract(LocalId),
}

#[derive(Debug)]
pub struct EchoReconciler {
    user_id: UserId,
    conversation_id: ConversationId,
    // A second send before the first echo replaces this slot.
    pending: Option<PendingEcho>,
    last_local: u64,
    rendered: HashSet<ServerMessageId>,
}

impl EchoReconciler {
    pub fn new(user_id: UserId, conversation_id: ConversationId) -> Self {
        Self {
            user_id,
            conversation_id,
            pending: None,
            last_local: 0,
            rendered: HashSet::new(),
        }
    }

    pub fn pending(&self) -> Option<&PendingEcho> {
        self.pending.as_ref()
    }

    /// Builds the local-temporary message for `content` and remembers it as
    /// the pending echo. The caller renders it and submits the frame.
    pub fn stage(&mut self, content: &str, now: DateTime<Utc>) -> Result<Message, ClientError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let local_id = self.next_local_id(now);
        if let Some(replaced) = &self.pending {
            debug!(
                target: "mapmo::echo",
                replaced = replaced.local_id.get(),
                "pending echo replaced before reconciliation"
            );
        }
        self.pending = Some(PendingEcho {
            local_id,
            sender_id: self.user_id,
            content: content.to_string(),
        });
        Ok(Message {
            key: MessageKey::Local(local_id),
            conversation_id: self.conversation_id,
            sender_id: self.user_id,
            content: content.to_string(),
            message_type: "text".to_string(),
            created_at: now,
        })
    }

    pub fn reconcile(&mut self, inbound: ChatMessage, now: DateTime<Utc>) -> Vec<EchoUpdate> {
        if inbound.conversation_id != self.conversation_id {
            debug!(
                target: "mapmo::echo",
                conversation = inbound.conversation_id,
                "message for another conversation dropped"
            );
            return Vec::new();
        }
        if !self.rendered.insert(inbound.id) {
            trace!(target: "mapmo::echo", id = inbound.id, "duplicate message skipped");
            return Vec::new();
        }

        let mut updates = Vec::with_capacity(2);
        if inbound.sender_id == self.user_id
            && self.pending.as_ref().is_some_and(|p| p.matches(&inbound))
        {
            if let Some(pending) = self.pending.take() {
                trace!(
                    target: "mapmo::echo",
                    local = pending.local_id.get(),
                    server = inbound.id,
                    "echo reconciled"
                );
                updates.push(EchoUpdate::Retract(pending.local_id));
            }
        }
        updates.push(EchoUpdate::Render(Message::authoritative(inbound, now)));
        updates
    }

    /// Renders server history once, oldest first.
    pub fn replay(&mut self, history: Vec<ChatMessage>, now: DateTime<Utc>) -> Vec<EchoUpdate> {
        history
            .into_iter()
            .flat_map(|message| self.reconcile(message, now))
            .collect()
    }

    fn next_local_id(&mut self, now: DateTime<Utc>) -> LocalId {
        let millis = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        self.last_local = millis.max(self.last_local + 1);
        LocalId(self.last_local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ME: UserId = 1;
    const PARTNER: UserId = 2;
    const CONV: ConversationId = 7;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn inbound(id: ServerMessageId, sender_id: UserId, content: &str) -> ChatMessage {
        ChatMessage {
            id,
            conversation_id: CONV,
            sender_id,
            content: content.into(),
            message_type: "text".into(),
            created_at: None,
        }
    }

    fn rendered_ids(updates: &[EchoUpdate]) -> Vec<MessageKey> {
        updates
            .iter()
            .filter_map(|update| match update {
                EchoUpdate::Render(message) => Some(message.key),
                EchoUpdate::Retract(_) => None,
            })
            .collect()
    }

    #[test]
    fn own_echo_retracts_the_temporary_bubble() {
        let mut echo = EchoReconciler::new(ME, CONV);
        let local = echo.stage("  hi ", now()).unwrap();
        assert!(local.is_local());
        assert_eq!(local.content, "hi");
        let MessageKey::Local(local_id) = local.key else {
            panic!("expected local key");
        };

        let updates = echo.reconcile(inbound(50, ME, "hi"), now());
        assert_eq!(updates[0], EchoUpdate::Retract(local_id));
        assert_eq!(rendered_ids(&updates), vec![MessageKey::Server(50)]);
        assert!(echo.pending().is_none());
    }

    #[test]
    fn authoritative_message_renders_exactly_once() {
        let mut echo = EchoReconciler::new(ME, CONV);
        echo.stage("hi", now()).unwrap();
        let first = echo.reconcile(inbound(50, ME, "hi"), now());
        let again = echo.reconcile(inbound(50, ME, "hi"), now());
        assert_eq!(rendered_ids(&first).len(), 1);
        assert!(again.is_empty());

        let history = echo.replay(vec![inbound(49, PARTNER, "hey"), inbound(50, ME, "hi")], now());
        assert_eq!(rendered_ids(&history), vec![MessageKey::Server(49)]);
    }

    #[test]
    fn partner_messages_and_mismatches_render_directly() {
        let mut echo = EchoReconciler::new(ME, CONV);
        echo.stage("hi", now()).unwrap();
        let updates = echo.reconcile(inbound(10, PARTNER, "hi"), now());
        assert_eq!(updates.len(), 1);
        assert!(echo.pending().is_some());

        let updates = echo.reconcile(inbound(11, ME, "something else"), now());
        assert_eq!(updates.len(), 1);
        assert!(echo.pending().is_some());
    }

    #[test]
    fn second_send_replaces_the_slot() {
        let mut echo = EchoReconciler::new(ME, CONV);
        echo.stage("one", now()).unwrap();
        let second = echo.stage("two", now()).unwrap();
        assert_eq!(echo.pending().unwrap().content, "two");
        assert_eq!(second.key, MessageKey::Local(echo.pending().unwrap().local_id));
    }

    #[test]
    fn local_ids_strictly_increase_within_one_millisecond() {
        let mut echo = EchoReconciler::new(ME, CONV);
        let a = echo.stage("a", now()).unwrap().key;
        let b = echo.stage("b", now()).unwrap().key;
        match (a, b) {
            (MessageKey::Local(a), MessageKey::Local(b)) => {
                assert!(b > a);
                assert!(a.get() >= now().timestamp_millis() as u64);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_content_is_rejected() {
        let mut echo = EchoReconciler::new(ME, CONV);
        assert!(matches!(echo.stage("   ", now()), Err(ClientError::EmptyMessage)));
        assert!(echo.pending().is_none());
    }

    #[test]
    fn other_conversations_are_ignored() {
        let mut echo = EchoReconciler::new(ME, CONV);
        let mut stray = inbound(5, PARTNER, "x");
        stray.conversation_id = CONV + 1;
        assert!(echo.reconcile(stray, now()).is_empty());
    }
}
