#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use mapmo_client::api::{ApiError, ChatApi};
use mapmo_client::config::{ClientConfig, Endpoints};
use mapmo_client::echo::MessageKey;
use mapmo_client::transport::mock::{MockConnector, MockRemote};
use mapmo_client::ui::{Notice, NoticeLevel, RenderedMessage, Screen};
use mapmo_client::{ChatClient, ClientHandle, Command, Session, UiSink, UiUpdate};
use mapmo_proto::rest::{
    ConversationInfo, KeepData, LoginData, Profile, ProfileOptions, ProfileUpdate, SearchData,
    SearchKind, UserSummary,
};
use mapmo_proto::{ChatMessage, ConversationId, CountdownState, MatchFound, UserId};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const ME: UserId = 7;
pub const PARTNER: UserId = 9;
pub const CONVERSATION: ConversationId = 41;

/// How a scripted endpoint answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Unauthorized,
    NotFound,
    Unavailable,
}

impl Reply {
    fn check(self) -> Result<(), ApiError> {
        match self {
            Reply::Ok => Ok(()),
            Reply::Unauthorized => Err(ApiError::Unauthorized("token expired".into())),
            Reply::NotFound => Err(ApiError::NotFound("conversation not found".into())),
            Reply::Unavailable => Err(ApiError::Rejected {
                status: 503,
                detail: "try again later".into(),
            }),
        }
    }
}

struct Script {
    register: Reply,
    login: Reply,
    profile_completed: bool,
    profile_updates: Vec<ProfileUpdate>,
    immediate_match: Option<MatchFound>,
    conversation: Reply,
    seed: Option<CountdownState>,
    countdown: Reply,
    countdown_state: CountdownState,
    history: Vec<ChatMessage>,
    both_kept_after_keep: bool,
    end: Reply,
    calls: HashMap<&'static str, usize>,
    keep_votes: Vec<bool>,
}

/// In-memory REST double. Every call answers immediately from the script.
pub struct ScriptedApi {
    script: Mutex<Script>,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script {
                register: Reply::Ok,
                login: Reply::Ok,
                profile_completed: true,
                profile_updates: Vec::new(),
                immediate_match: None,
                conversation: Reply::Ok,
                seed: None,
                countdown: Reply::Ok,
                countdown_state: CountdownState {
                    time_left: Some(300),
                    ..CountdownState::default()
                },
                history: Vec::new(),
                both_kept_after_keep: false,
                end: Reply::Ok,
                calls: HashMap::new(),
                keep_votes: Vec::new(),
            }),
        })
    }

    pub fn set_register(&self, reply: Reply) {
        self.script().register = reply;
    }

    pub fn set_login(&self, reply: Reply) {
        self.script().login = reply;
    }

    /// Whether the account has a nickname; saving a profile sets it.
    pub fn set_profile_completed(&self, completed: bool) {
        self.script().profile_completed = completed;
    }

    pub fn profile_updates(&self) -> Vec<ProfileUpdate> {
        self.script().profile_updates.clone()
    }

    pub fn set_immediate_match(&self, found: MatchFound) {
        self.script().immediate_match = Some(found);
    }

    pub fn set_conversation(&self, reply: Reply) {
        self.script().conversation = reply;
    }

    pub fn set_countdown(&self, reply: Reply, state: CountdownState) {
        let mut script = self.script();
        script.countdown = reply;
        script.countdown_state = state;
    }

    pub fn set_history(&self, history: Vec<ChatMessage>) {
        self.script().history = history;
    }

    pub fn set_both_kept_after_keep(&self, both: bool) {
        self.script().both_kept_after_keep = both;
    }

    pub fn set_end(&self, reply: Reply) {
        self.script().end = reply;
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.script()
            .calls
            .get(endpoint)
            .copied()
            .unwrap_or_default()
    }

    pub fn keep_votes(&self) -> Vec<bool> {
        self.script().keep_votes.clone()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Counts a call and hands back the script to answer it from.
    fn record(&self, endpoint: &'static str) -> MutexGuard<'_, Script> {
        let mut script = self.script();
        *script.calls.entry(endpoint).or_default() += 1;
        script
    }
}

#[async_trait]
impl ChatApi for ScriptedApi {
    async fn register(
        &self,
        _username: &str,
        _password: &str,
        _confirm_password: &str,
    ) -> Result<UserId, ApiError> {
        let script = self.record("register");
        script.register.check()?;
        Ok(ME)
    }

    async fn login(&self, username: &str, _password: &str) -> Result<LoginData, ApiError> {
        let script = self.record("login");
        script.login.check()?;
        Ok(LoginData {
            access_token: format!("tok-{ME}"),
            token_type: Some("bearer".into()),
            user: UserSummary {
                id: ME,
                username: username.to_string(),
                nickname: None,
                state: Some("waiting".into()),
                profile_completed: script.profile_completed,
            },
        })
    }

    async fn logout(&self, _session: &Session) -> Result<(), ApiError> {
        drop(self.record("logout"));
        Ok(())
    }

    async fn me(&self, _session: &Session) -> Result<Profile, ApiError> {
        let script = self.record("me");
        Ok(Profile {
            id: ME,
            username: "lan".into(),
            nickname: script.profile_completed.then(|| "Lan".to_string()),
            state: Some("waiting".into()),
            created_at: None,
        })
    }

    async fn update_profile(&self, _session: &Session, profile: &ProfileUpdate) -> Result<(), ApiError> {
        let mut script = self.record("update_profile");
        script.profile_updates.push(profile.clone());
        script.profile_completed = true;
        Ok(())
    }

    async fn profile_options(&self) -> Result<ProfileOptions, ApiError> {
        drop(self.record("profile_options"));
        Ok(ProfileOptions {
            interests: vec!["Đọc sách 📚".into(), "Du lịch ✈️".into()],
            goals: vec!["Kết hôn".into()],
        })
    }

    async fn start_search(&self, _session: &Session, _kind: SearchKind) -> Result<SearchData, ApiError> {
        let script = self.record("search");
        Ok(match script.immediate_match.clone() {
            Some(found) => SearchData::Matched(found),
            None => SearchData::Pending {
                status: "searching".into(),
            },
        })
    }

    async fn cancel_search(&self, _session: &Session) -> Result<(), ApiError> {
        drop(self.record("cancel_search"));
        Ok(())
    }

    async fn searching_count(&self, _session: &Session) -> Result<u64, ApiError> {
        drop(self.record("searching_count"));
        Ok(3)
    }

    async fn conversation(
        &self,
        _session: &Session,
        conversation_id: ConversationId,
    ) -> Result<ConversationInfo, ApiError> {
        let script = self.record("conversation");
        script.conversation.check()?;
        Ok(ConversationInfo {
            conversation_id,
            conversation_type: Some("chat".into()),
            matched_user: None,
            countdown: script.seed.clone(),
        })
    }

    async fn countdown(
        &self,
        _session: &Session,
        _conversation_id: ConversationId,
    ) -> Result<CountdownState, ApiError> {
        let script = self.record("countdown");
        script.countdown.check()?;
        Ok(script.countdown_state.clone())
    }

    async fn messages(
        &self,
        _session: &Session,
        _conversation_id: ConversationId,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        let script = self.record("messages");
        Ok(script.history.clone())
    }

    async fn submit_keep(
        &self,
        _session: &Session,
        conversation_id: ConversationId,
        keep: bool,
    ) -> Result<KeepData, ApiError> {
        let mut script = self.record("keep");
        script.keep_votes.push(keep);
        Ok(KeepData {
            conversation_id: Some(conversation_id),
            keep_status: keep,
            both_kept: keep && script.both_kept_after_keep,
        })
    }

    async fn end_conversation(
        &self,
        _session: &Session,
        _conversation_id: ConversationId,
    ) -> Result<(), ApiError> {
        let script = self.record("end");
        script.end.check()
    }
}

/// Keeps every update with the (virtual) time it arrived.
#[derive(Default)]
pub struct RecordingUi {
    updates: Mutex<Vec<(Instant, UiUpdate)>>,
}

impl UiSink for RecordingUi {
    fn apply(&self, update: UiUpdate) {
        self.updates.lock().unwrap().push((Instant::now(), update));
    }
}

impl RecordingUi {
    pub fn updates(&self) -> Vec<(Instant, UiUpdate)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn notices(&self) -> Vec<(Instant, Notice)> {
        self.updates()
            .into_iter()
            .filter_map(|(at, update)| match update {
                UiUpdate::Notice(notice) => Some((at, notice)),
                _ => None,
            })
            .collect()
    }

    pub fn notices_containing(&self, text: &str) -> Vec<(Instant, Notice)> {
        self.notices()
            .into_iter()
            .filter(|(_, notice)| notice.text.contains(text))
            .collect()
    }

    pub fn fatal_notices(&self) -> Vec<(Instant, Notice)> {
        self.notices()
            .into_iter()
            .filter(|(_, notice)| notice.level == NoticeLevel::Fatal)
            .collect()
    }

    pub fn screens(&self) -> Vec<(Instant, Screen)> {
        self.updates()
            .into_iter()
            .filter_map(|(at, update)| match update {
                UiUpdate::Screen(screen) => Some((at, screen)),
                _ => None,
            })
            .collect()
    }

    pub fn last_screen(&self) -> Option<Screen> {
        self.screens().pop().map(|(_, screen)| screen)
    }

    pub fn count(&self, predicate: impl Fn(&UiUpdate) -> bool) -> usize {
        self.updates()
            .iter()
            .filter(|(_, update)| predicate(update))
            .count()
    }

    /// The transcript as a renderer keyed by message key would show it.
    pub fn transcript(&self) -> Vec<RenderedMessage> {
        let mut shown: Vec<RenderedMessage> = Vec::new();
        for (_, update) in self.updates() {
            match update {
                UiUpdate::MessageRendered(message) => {
                    shown.retain(|existing| existing.key != message.key);
                    shown.push(message);
                }
                UiUpdate::MessageRetracted(local) => {
                    shown.retain(|existing| existing.key != MessageKey::Local(local));
                }
                _ => {}
            }
        }
        shown
    }
}

pub struct Harness {
    pub connector: MockConnector,
    pub api: Arc<ScriptedApi>,
    pub ui: Arc<RecordingUi>,
    pub handle: ClientHandle,
    pub task: JoinHandle<()>,
    pub started: Instant,
}

impl Harness {
    /// Client that starts logged in as [`ME`].
    pub async fn logged_in(api: Arc<ScriptedApi>, connector: MockConnector) -> Self {
        Self::launch(api, connector, Some(Session::new(ME, format!("tok-{ME}")))).await
    }

    pub async fn logged_out(api: Arc<ScriptedApi>, connector: MockConnector) -> Self {
        Self::launch(api, connector, None).await
    }

    async fn launch(
        api: Arc<ScriptedApi>,
        connector: MockConnector,
        session: Option<Session>,
    ) -> Self {
        let config = ClientConfig::new(Endpoints::resolve("127.0.0.1:8000").unwrap());
        let ui = Arc::new(RecordingUi::default());
        let (client, handle) =
            ChatClient::new(config, Arc::new(connector.clone()), api.clone(), ui.clone());
        let client = match session {
            Some(session) => client.with_session(session),
            None => client,
        };
        let started = Instant::now();
        let task = client.spawn();
        settle().await;
        Self {
            connector,
            api,
            ui,
            handle,
            task,
            started,
        }
    }

    pub fn send(&self, command: Command) {
        self.handle.send(command).expect("client running");
    }

    pub fn remote(&self) -> MockRemote {
        self.connector.latest().expect("a link was opened")
    }

    pub async fn enter_conversation(&self) {
        self.send(Command::EnterConversation {
            conversation_id: CONVERSATION,
            partner: None,
        });
        settle().await;
    }

    /// Seconds since launch, in virtual time.
    pub fn elapsed(&self, at: Instant) -> Duration {
        at - self.started
    }
}

/// Lets the client task and any spawned REST calls drain their queues
/// without moving the clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
    settle().await;
}

pub fn chat_frame(id: i64, sender_id: UserId, content: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "chat_message",
        "data": {
            "id": id,
            "conversation_id": CONVERSATION,
            "sender_id": sender_id,
            "content": content,
            "message_type": "text",
            "created_at": "2024-05-01T10:00:00"
        }
    })
}
