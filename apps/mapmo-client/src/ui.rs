//! Everything the core tells the presentation layer. The core never draws;
//! it pushes [`UiUpdate`]s into a [`UiSink`].

use chrono::{DateTime, Utc};
use mapmo_proto::rest::{Profile, ProfileOptions, SearchKind};
use mapmo_proto::{ConversationId, MatchedUser, UserId};

use crate::connection::ConnectionState;
use crate::countdown::CountdownDisplay;
use crate::echo::{LocalId, Message, MessageKey};

#[derive(Debug, Clone, PartialEq)]
pub enum Screen {
    Login,
    /// Logged in, but the account has no profile yet; searching is refused.
    ProfileSetup,
    Lobby,
    Searching(SearchKind),
    Chat {
        conversation_id: ConversationId,
        partner: Option<MatchedUser>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
    /// The user has to reload or log in again; nothing recovers on its own.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }

    pub fn fatal(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Fatal,
            text: text.into(),
        }
    }
}

/// A message as handed to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub key: MessageKey,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
    /// Sent by the logged-in user.
    pub own: bool,
    /// Still waiting for the server echo.
    pub pending: bool,
}

impl RenderedMessage {
    pub fn from_message(message: &Message, user_id: UserId) -> Self {
        Self {
            key: message.key,
            sender_id: message.sender_id,
            content: message.content.clone(),
            message_type: message.message_type.clone(),
            created_at: message.created_at,
            own: message.sender_id == user_id,
            pending: message.is_local(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepIndicator {
    pub mine: bool,
    pub partner: bool,
    pub both: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    Screen(Screen),
    Connection(ConnectionState),
    MessageRendered(RenderedMessage),
    MessageRetracted(LocalId),
    PartnerTyping(bool),
    Keep(KeepIndicator),
    Countdown(CountdownDisplay),
    /// `None` when the counter could not be fetched.
    SearchingCount(Option<u64>),
    Profile(Profile),
    ProfileOptions(ProfileOptions),
    Notice(Notice),
    ConversationEnded {
        redirect_url: String,
        reason: Option<String>,
    },
}

/// Receiver of UI updates. Called from the client task, so implementations
/// should hand work off rather than block.
pub trait UiSink: Send + Sync {
    fn apply(&self, update: UiUpdate);
}

impl<F> UiSink for F
where
    F: Fn(UiUpdate) + Send + Sync,
{
    fn apply(&self, update: UiUpdate) {
        (self)(update)
    }
}
