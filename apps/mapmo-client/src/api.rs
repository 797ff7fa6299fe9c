//! REST collaborator. Everything the socket does not carry: accounts and
//! profiles, search, keep votes, ending, history and countdown snapshots.

use std::time::Duration;

use async_trait::async_trait;
use mapmo_proto::rest::{
    ApiEnvelope, ConversationInfo, EndRequest, ErrorBody, KeepData, KeepRequest, LoginData,
    LoginRequest, Profile, ProfileOptions, ProfileUpdate, RegisterData, RegisterRequest,
    SearchData, SearchKind, SearchRequest, SearchingCount,
};
use mapmo_proto::{ChatMessage, ConversationId, CountdownState, UserId};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::error::ErrorKind;
use crate::session::Session;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("config error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request failed ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("unexpected response: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Config(_) => ErrorKind::Invalid,
            ApiError::Http(err) if err.is_decode() => ErrorKind::Malformed,
            ApiError::Http(_) => ErrorKind::Transient,
            ApiError::Unauthorized(_) => ErrorKind::Unauthorized,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::Rejected { status, .. } if *status >= 500 => ErrorKind::Transient,
            ApiError::Rejected { .. } => ErrorKind::Invalid,
            ApiError::Malformed(_) => ErrorKind::Malformed,
        }
    }

    /// Text suitable for a notice.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Rejected { detail, .. }
            | ApiError::Unauthorized(detail)
            | ApiError::NotFound(detail) => detail.clone(),
            ApiError::Http(_) => "network error, please try again".to_string(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn register(
        &self,
        username: &str,
        password: &str,
        confirm_password: &str,
    ) -> Result<UserId, ApiError>;
    async fn login(&self, username: &str, password: &str) -> Result<LoginData, ApiError>;
    async fn logout(&self, session: &Session) -> Result<(), ApiError>;
    async fn me(&self, session: &Session) -> Result<Profile, ApiError>;
    async fn update_profile(&self, session: &Session, profile: &ProfileUpdate) -> Result<(), ApiError>;
    async fn profile_options(&self) -> Result<ProfileOptions, ApiError>;
    async fn start_search(&self, session: &Session, kind: SearchKind) -> Result<SearchData, ApiError>;
    async fn cancel_search(&self, session: &Session) -> Result<(), ApiError>;
    async fn searching_count(&self, session: &Session) -> Result<u64, ApiError>;
    async fn conversation(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<ConversationInfo, ApiError>;
    async fn countdown(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<CountdownState, ApiError>;
    async fn messages(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<Vec<ChatMessage>, ApiError>;
    async fn submit_keep(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        keep: bool,
    ) -> Result<KeepData, ApiError>;
    async fn end_conversation(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<(), ApiError>;
}

#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base: Url,
}

impl HttpApi {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::Config(err.to_string()))?;
        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|err| ApiError::Config(format!("invalid api path '{path}': {err}")))
    }

    fn get(&self, session: &Session, path: &str) -> Result<RequestBuilder, ApiError> {
        Ok(self.client.get(self.url(path)?).bearer_auth(session.auth_token()))
    }

    fn post(&self, session: &Session, path: &str) -> Result<RequestBuilder, ApiError> {
        Ok(self.client.post(self.url(path)?).bearer_auth(session.auth_token()))
    }

    fn put(&self, session: &Session, path: &str) -> Result<RequestBuilder, ApiError> {
        Ok(self.client.put(self.url(path)?).bearer_auth(session.auth_token()))
    }

    async fn data<T: DeserializeOwned>(request: RequestBuilder, what: &str) -> Result<T, ApiError> {
        let envelope: ApiEnvelope<T> = Self::json(request).await?;
        envelope
            .data
            .ok_or_else(|| ApiError::Malformed(format!("{what} response carried no data")))
    }

    async fn json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ApiError> {
        let response = checked(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn unit(request: RequestBuilder) -> Result<(), ApiError> {
        checked(request.send().await?).await?;
        Ok(())
    }
}

async fn checked(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().path().to_string();
    let text = response.text().await.unwrap_or_default();
    let err = status_error(status, &text);
    debug!(target: "mapmo::api", %url, status = status.as_u16(), error = %err, "request rejected");
    Err(err)
}

fn status_error(status: StatusCode, body: &str) -> ApiError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|body| body.detail)
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("unknown error").to_string()
            } else {
                body.to_string()
            }
        });
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized(detail),
        StatusCode::NOT_FOUND => ApiError::NotFound(detail),
        _ => ApiError::Rejected {
            status: status.as_u16(),
            detail,
        },
    }
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn register(
        &self,
        username: &str,
        password: &str,
        confirm_password: &str,
    ) -> Result<UserId, ApiError> {
        let request = self.client.post(self.url("register")?).json(&RegisterRequest {
            username,
            password,
            confirm_password,
        });
        let data: RegisterData = Self::data(request, "register").await?;
        Ok(data.user_id)
    }

    async fn login(&self, username: &str, password: &str) -> Result<LoginData, ApiError> {
        let request = self
            .client
            .post(self.url("login")?)
            .json(&LoginRequest { username, password });
        Self::data(request, "login").await
    }

    async fn logout(&self, session: &Session) -> Result<(), ApiError> {
        Self::unit(self.post(session, "logout")?).await
    }

    async fn me(&self, session: &Session) -> Result<Profile, ApiError> {
        Self::json(self.get(session, "api/me")?).await
    }

    async fn update_profile(&self, session: &Session, profile: &ProfileUpdate) -> Result<(), ApiError> {
        Self::unit(self.put(session, "profile")?.json(profile)).await
    }

    async fn profile_options(&self) -> Result<ProfileOptions, ApiError> {
        Self::json(self.client.get(self.url("profile/options")?)).await
    }

    async fn start_search(&self, session: &Session, kind: SearchKind) -> Result<SearchData, ApiError> {
        let request = self
            .post(session, "search")?
            .json(&SearchRequest { search_type: kind });
        Self::data(request, "search").await
    }

    async fn cancel_search(&self, session: &Session) -> Result<(), ApiError> {
        Self::unit(self.post(session, "cancel-search")?).await
    }

    async fn searching_count(&self, session: &Session) -> Result<u64, ApiError> {
        let count: SearchingCount =
            Self::data(self.get(session, "api/searching-count")?, "searching count").await?;
        Ok(count.searching_count)
    }

    async fn conversation(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<ConversationInfo, ApiError> {
        let path = format!("api/conversation/{conversation_id}");
        Self::data(self.get(session, &path)?, "conversation").await
    }

    async fn countdown(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<CountdownState, ApiError> {
        let path = format!("api/conversation/{conversation_id}/countdown");
        Self::data(self.get(session, &path)?, "countdown").await
    }

    async fn messages(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        // History comes back as a bare list, not an envelope.
        let path = format!("conversation/{conversation_id}/messages");
        Self::json(self.get(session, &path)?).await
    }

    async fn submit_keep(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        keep: bool,
    ) -> Result<KeepData, ApiError> {
        let request = self.post(session, "keep")?.json(&KeepRequest {
            conversation_id,
            keep_status: keep,
        });
        Self::data(request, "keep").await
    }

    async fn end_conversation(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<(), ApiError> {
        let request = self
            .post(session, "end")?
            .json(&EndRequest { conversation_id });
        Self::unit(request).await.inspect_err(|err| {
            warn!(target: "mapmo::api", conversation_id, error = %err, "end request failed");
        })
    }
}
