//! REST request and response bodies. Most successful responses are wrapped
//! in `{ success, message, data }`; failures carry a FastAPI-style `detail`.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{CountdownState, MatchFound, MatchedUser};
use crate::{ConversationId, UserId};

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginData {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    pub user: UserSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub profile_completed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub confirm_password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterData {
    pub user_id: UserId,
}

/// `GET /api/me`. Returned bare, without the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, with = "crate::time::option")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Profile {
    /// The server refuses to search for users without a nickname.
    pub fn is_complete(&self) -> bool {
        self.nickname.as_deref().is_some_and(|name| !name.trim().is_empty())
    }
}

pub const MAX_INTERESTS: usize = 5;

/// `PUT /profile` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileUpdate {
    pub nickname: String,
    #[serde(serialize_with = "serialize_dob")]
    pub dob: NaiveDate,
    pub gender: String,
    pub preference: String,
    pub goal: String,
    pub interests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("pick at least one interest")]
    NoInterests,
    #[error("pick at most {} interests", MAX_INTERESTS)]
    TooManyInterests,
}

impl ProfileUpdate {
    pub fn validate(&self) -> Result<(), ProfileError> {
        let required = [
            ("nickname", &self.nickname),
            ("gender", &self.gender),
            ("preference", &self.preference),
            ("goal", &self.goal),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ProfileError::Missing(*field));
        }
        match self.interests.len() {
            0 => Err(ProfileError::NoInterests),
            n if n > MAX_INTERESTS => Err(ProfileError::TooManyInterests),
            _ => Ok(()),
        }
    }
}

// The server takes a full datetime; midnight UTC stands for the date.
fn serialize_dob<S>(dob: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let midnight = dob.and_time(NaiveTime::default()).and_utc();
    serializer.serialize_str(&midnight.to_rfc3339())
}

/// `GET /profile/options`. Returned bare, without the envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProfileOptions {
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub goals: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    Chat,
    Voice,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    pub search_type: SearchKind,
}

/// `POST /search` answers either with an immediate match or a pending marker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SearchData {
    Matched(MatchFound),
    Pending { status: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchingCount {
    pub searching_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeepRequest {
    pub conversation_id: ConversationId,
    pub keep_status: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeepData {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub keep_status: bool,
    #[serde(default)]
    pub both_kept: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndRequest {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationInfo {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub conversation_type: Option<String>,
    #[serde(default)]
    pub matched_user: Option<MatchedUser>,
    #[serde(default)]
    pub countdown: Option<CountdownState>,
}
