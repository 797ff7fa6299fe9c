//! The client runtime: one task that owns the session, the connection and
//! the active conversation. UI commands, link events, timer firings and REST
//! replies all arrive on the same queue and are handled one at a time.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use mapmo_proto::rest::{
    ConversationInfo, KeepData, LoginData, Profile, ProfileOptions, ProfileUpdate, SearchData,
    SearchKind,
};
use mapmo_proto::{
    ChatMessage, ClientFrame, ConversationEnded, ConversationId, CountdownState, KeepStatus,
    MatchFound, MatchedUser, TypingStatus, UserId,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::api::{ApiError, ChatApi};
use crate::config::ClientConfig;
use crate::connection::{CloseOutcome, ConnectionManager, ConnectionState, TerminalReason};
use crate::countdown::{Bootstrap, CountdownEffect, CountdownSynchronizer};
use crate::dispatch::{FrameHandler, dispatch};
use crate::echo::{EchoReconciler, EchoUpdate};
use crate::error::{ClientError, ErrorKind};
use crate::outbound::{OutboundFrame, OutboundSender, SendOutcome};
use crate::session::Session;
use crate::timer::Timer;
use crate::transport::{Connector, LinkEvent, LinkMessage};
use crate::typing::TypingDebouncer;
use crate::ui::{KeepIndicator, Notice, RenderedMessage, Screen, UiSink, UiUpdate};

/// Requests from the presentation layer.
#[derive(Clone, PartialEq)]
pub enum Command {
    Register {
        username: String,
        password: String,
        confirm_password: String,
    },
    Login { username: String, password: String },
    ShowProfile,
    ProfileOptions,
    UpdateProfile(ProfileUpdate),
    StartSearch(SearchKind),
    CancelSearch,
    EnterConversation {
        conversation_id: ConversationId,
        partner: Option<MatchedUser>,
    },
    SendMessage(String),
    /// The compose box changed.
    InputChanged,
    ToggleKeep,
    EndConversation,
    Logout,
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Register { .. } => "register",
            Command::Login { .. } => "login",
            Command::ShowProfile => "show_profile",
            Command::ProfileOptions => "profile_options",
            Command::UpdateProfile(_) => "update_profile",
            Command::StartSearch(_) => "start_search",
            Command::CancelSearch => "cancel_search",
            Command::EnterConversation { .. } => "enter_conversation",
            Command::SendMessage(_) => "send_message",
            Command::InputChanged => "input_changed",
            Command::ToggleKeep => "toggle_keep",
            Command::EndConversation => "end_conversation",
            Command::Logout => "logout",
            Command::Shutdown => "shutdown",
        }
    }
}

// Credentials never reach the logs.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Register { username, .. } => f
                .debug_struct("Register")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Command::Login { username, .. } => f
                .debug_struct("Login")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Command::UpdateProfile(profile) => f.debug_tuple("UpdateProfile").field(profile).finish(),
            Command::StartSearch(kind) => f.debug_tuple("StartSearch").field(kind).finish(),
            Command::EnterConversation {
                conversation_id,
                partner,
            } => f
                .debug_struct("EnterConversation")
                .field("conversation_id", conversation_id)
                .field("partner", partner)
                .finish(),
            Command::SendMessage(text) => f.debug_tuple("SendMessage").field(text).finish(),
            other => f.write_str(other.name()),
        }
    }
}

enum Event {
    Command(Command),
    Link(LinkMessage),
    Timer(TimerEvent),
    Api(ApiReply),
}

enum TimerEvent {
    Reconnect { generation: u64 },
    ForcedLogout,
    SearchPoll { epoch: u64 },
    Tick { epoch: u64 },
    Resync { epoch: u64 },
    TypingQuiet { epoch: u64, generation: u64 },
    RetrySend { epoch: u64, frame: OutboundFrame },
    ExpiryEnd { epoch: u64 },
}

enum ApiReply {
    Registered(Result<UserId, ApiError>),
    Login(Result<LoginData, ApiError>),
    Profile(Result<Profile, ApiError>),
    ProfileOptions(Result<ProfileOptions, ApiError>),
    ProfileSaved(Result<(), ApiError>),
    LoggedOut(Result<(), ApiError>),
    Search {
        epoch: u64,
        result: Result<SearchData, ApiError>,
    },
    SearchCancelled(Result<(), ApiError>),
    SearchingCount {
        epoch: u64,
        result: Result<u64, ApiError>,
    },
    Conversation {
        epoch: u64,
        result: Result<ConversationInfo, ApiError>,
    },
    History {
        epoch: u64,
        result: Result<Vec<ChatMessage>, ApiError>,
    },
    Countdown {
        epoch: u64,
        result: Result<CountdownState, ApiError>,
    },
    Keep {
        epoch: u64,
        result: Result<KeepData, ApiError>,
    },
    Ended {
        epoch: u64,
        result: Result<(), ApiError>,
    },
}

/// Cheap handle for feeding commands to a running [`ChatClient`].
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl ClientHandle {
    pub fn send(&self, command: Command) -> Result<(), ClientError> {
        self.tx
            .send(Event::Command(command))
            .map_err(|_| ClientError::Stopped)
    }
}

/// Per-conversation state. Dropping it cancels every timer it owns.
struct ConversationScope {
    epoch: u64,
    id: ConversationId,
    partner: Option<MatchedUser>,
    echo: EchoReconciler,
    typing: TypingDebouncer,
    countdown: CountdownSynchronizer,
    my_keep: bool,
    partner_keep: bool,
    keep_in_flight: bool,
    resync_in_flight: bool,
    end_requested: bool,
    tick_timer: Option<Timer>,
    _first_resync: Timer,
    _resync_timer: Timer,
    typing_timer: Option<Timer>,
    expiry_timer: Option<Timer>,
    retry_timers: Vec<Timer>,
}

impl ConversationScope {
    fn keep_indicator(&self) -> KeepIndicator {
        KeepIndicator {
            mine: self.my_keep,
            partner: self.partner_keep,
            both: self.countdown.both_kept(),
        }
    }
}

enum Phase {
    Lobby,
    Searching {
        epoch: u64,
        _poll: Timer,
    },
    Conversation(Box<ConversationScope>),
}

pub struct ChatClient {
    config: ClientConfig,
    api: Arc<dyn ChatApi>,
    ui: Arc<dyn UiSink>,
    session: Option<Session>,
    connection: ConnectionManager,
    outbound: OutboundSender,
    phase: Phase,
    next_epoch: u64,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    reconnect_timer: Option<Timer>,
    logout_timer: Option<Timer>,
    login_in_flight: bool,
    /// Known from login or `/api/me` to have no nickname yet.
    needs_profile: bool,
    running: bool,
}

impl ChatClient {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        api: Arc<dyn ChatApi>,
        ui: Arc<dyn UiSink>,
    ) -> (Self, ClientHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link_tx = tx.clone();
        let connection = ConnectionManager::new(
            connector,
            config.endpoints.socket.clone(),
            config.credential_mode,
            config.reconnect,
            Arc::new(move |message: LinkMessage| {
                let _ = link_tx.send(Event::Link(message));
            }),
        );
        let handle = ClientHandle { tx: tx.clone() };
        let client = Self {
            outbound: OutboundSender::new(config.retry),
            config,
            api,
            ui,
            session: None,
            connection,
            phase: Phase::Lobby,
            next_epoch: 0,
            tx,
            rx,
            reconnect_timer: None,
            logout_timer: None,
            login_in_flight: false,
            needs_profile: false,
            running: true,
        };
        (client, handle)
    }

    /// Starts already logged in instead of on the login screen.
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        match self.session.clone() {
            Some(session) => self.enter_lobby(&session),
            None => self.emit(UiUpdate::Screen(Screen::Login)),
        }
        while self.running {
            let Some(event) = self.rx.recv().await else {
                break;
            };
            self.handle(event);
        }
        debug!(target: "mapmo::client", "client loop finished");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.on_command(command),
            Event::Link(message) => self.on_link(message),
            Event::Timer(timer) => self.on_timer(timer),
            Event::Api(reply) => self.on_api(reply),
        }
    }

    fn on_command(&mut self, command: Command) {
        trace!(target: "mapmo::client", command = command.name(), "command");
        match command {
            Command::Register {
                username,
                password,
                confirm_password,
            } => self.register(username, password, confirm_password),
            Command::Login { username, password } => self.login(username, password),
            Command::ShowProfile => self.show_profile(),
            Command::ProfileOptions => {
                self.request(|api| async move { ApiReply::ProfileOptions(api.profile_options().await) })
            }
            Command::UpdateProfile(profile) => self.update_profile(profile),
            Command::StartSearch(kind) => self.start_search(kind),
            Command::CancelSearch => self.cancel_search(),
            Command::EnterConversation {
                conversation_id,
                partner,
            } => self.enter_conversation(conversation_id, partner),
            Command::SendMessage(text) => self.send_message(&text),
            Command::InputChanged => self.input_changed(),
            Command::ToggleKeep => self.toggle_keep(),
            Command::EndConversation => match self.scope() {
                Some(scope) => {
                    let epoch = scope.epoch;
                    self.request_end(epoch);
                }
                None => self.notice(Notice::error(ClientError::NoConversation.to_string())),
            },
            Command::Logout => self.logout(),
            Command::Shutdown => self.shutdown(),
        }
    }

    fn on_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::Reconnect { generation } => self.reconnect_due(generation),
            TimerEvent::ForcedLogout => {
                self.logout_timer = None;
                self.logout();
            }
            TimerEvent::SearchPoll { epoch } => self.poll_searching_count(epoch),
            TimerEvent::Tick { epoch } => {
                if let Some(scope) = self.scope_for(epoch) {
                    let effects = scope.countdown.tick();
                    self.apply_countdown(epoch, effects);
                }
            }
            TimerEvent::Resync { epoch } => self.request_resync(epoch),
            TimerEvent::TypingQuiet { epoch, generation } => {
                let Some(scope) = self.scope_for(epoch) else {
                    return;
                };
                if scope.typing.on_quiet(generation) {
                    let id = scope.id;
                    self.send_frame(epoch, ClientFrame::typing(id, false));
                }
            }
            TimerEvent::RetrySend { epoch, frame } => {
                if self.scope_for(epoch).is_some() {
                    let outcome = self.outbound.send(&self.connection, frame);
                    self.on_send_outcome(epoch, outcome);
                }
            }
            TimerEvent::ExpiryEnd { epoch } => self.request_end(epoch),
        }
    }

    fn on_api(&mut self, reply: ApiReply) {
        match reply {
            ApiReply::Registered(result) => self.on_registered(result),
            ApiReply::Login(result) => self.on_login(result),
            ApiReply::Profile(result) => self.on_profile(result),
            ApiReply::ProfileOptions(result) => match result {
                Ok(options) => self.emit(UiUpdate::ProfileOptions(options)),
                Err(err) => self.on_account_error(err, "could not load profile options"),
            },
            ApiReply::ProfileSaved(result) => self.on_profile_saved(result),
            ApiReply::LoggedOut(result) => {
                if let Err(err) = result {
                    debug!(target: "mapmo::client", error = %err, "server logout failed");
                }
            }
            ApiReply::Search { epoch, result } => self.on_search(epoch, result),
            ApiReply::SearchCancelled(result) => {
                if let Err(err) = result {
                    debug!(target: "mapmo::client", error = %err, "cancel-search failed");
                }
            }
            ApiReply::SearchingCount { epoch, result } => {
                if self.is_searching(epoch) {
                    if let Err(err) = &result {
                        debug!(target: "mapmo::client", error = %err, "searching count unavailable");
                    }
                    self.emit(UiUpdate::SearchingCount(result.ok()));
                }
            }
            ApiReply::Conversation { epoch, result } => self.on_conversation_info(epoch, result),
            ApiReply::History { epoch, result } => self.on_history(epoch, result),
            ApiReply::Countdown { epoch, result } => self.on_countdown_reply(epoch, result),
            ApiReply::Keep { epoch, result } => self.on_keep_reply(epoch, result),
            ApiReply::Ended { epoch, result } => self.on_ended(epoch, result),
        }
    }

    // ---- session ----------------------------------------------------------

    fn login(&mut self, username: String, password: String) {
        if self.session.is_some() {
            self.notice(Notice::error("already logged in"));
            return;
        }
        if self.login_in_flight {
            return;
        }
        self.login_in_flight = true;
        self.request(move |api| async move { ApiReply::Login(api.login(&username, &password).await) });
    }

    fn on_login(&mut self, result: Result<LoginData, ApiError>) {
        self.login_in_flight = false;
        match result {
            Ok(data) => {
                info!(target: "mapmo::client", user_id = data.user.id, "logged in");
                let session = Session::new(data.user.id, data.access_token);
                let name = data.user.nickname.unwrap_or(data.user.username);
                self.session = Some(session.clone());
                self.logout_timer = None;
                self.needs_profile = !data.user.profile_completed;
                self.notice(Notice::success(format!("welcome, {name}")));
                if self.needs_profile {
                    self.notice(Notice::error("complete your profile before searching"));
                }
                self.enter_lobby(&session);
            }
            Err(err) => {
                warn!(target: "mapmo::client", error = %err, "login failed");
                self.notice(Notice::error(format!("login failed: {}", err.user_message())));
            }
        }
    }

    fn enter_lobby(&mut self, session: &Session) {
        self.connect_if_needed(session);
        self.phase = Phase::Lobby;
        self.emit(UiUpdate::Screen(self.lobby_screen()));
    }

    fn lobby_screen(&self) -> Screen {
        if self.needs_profile {
            Screen::ProfileSetup
        } else {
            Screen::Lobby
        }
    }

    // ---- account ----------------------------------------------------------

    fn register(&mut self, username: String, password: String, confirm_password: String) {
        if username.trim().is_empty() || password.is_empty() {
            self.notice(Notice::error("username and password are required"));
            return;
        }
        if password != confirm_password {
            self.notice(Notice::error("passwords do not match"));
            return;
        }
        self.request(move |api| async move {
            ApiReply::Registered(api.register(&username, &password, &confirm_password).await)
        });
    }

    fn on_registered(&mut self, result: Result<UserId, ApiError>) {
        match result {
            Ok(user_id) => {
                info!(target: "mapmo::client", user_id, "account created");
                self.notice(Notice::success("account created, please log in"));
                if self.session.is_none() {
                    self.emit(UiUpdate::Screen(Screen::Login));
                }
            }
            Err(err) => {
                warn!(target: "mapmo::client", error = %err, "registration failed");
                self.notice(Notice::error(format!("registration failed: {}", err.user_message())));
            }
        }
    }

    fn show_profile(&mut self) {
        let Some(session) = self.session.clone() else {
            self.notice(Notice::error(ClientError::NoSession.to_string()));
            return;
        };
        self.request(move |api| async move { ApiReply::Profile(api.me(&session).await) });
    }

    fn on_profile(&mut self, result: Result<Profile, ApiError>) {
        match result {
            Ok(profile) => {
                self.needs_profile = !profile.is_complete();
                self.emit(UiUpdate::Profile(profile));
            }
            Err(err) => self.on_account_error(err, "could not load profile"),
        }
    }

    fn update_profile(&mut self, profile: ProfileUpdate) {
        let Some(session) = self.session.clone() else {
            self.notice(Notice::error(ClientError::NoSession.to_string()));
            return;
        };
        if let Err(err) = profile.validate() {
            self.notice(Notice::error(err.to_string()));
            return;
        }
        self.request(move |api| async move {
            ApiReply::ProfileSaved(api.update_profile(&session, &profile).await)
        });
    }

    fn on_profile_saved(&mut self, result: Result<(), ApiError>) {
        match result {
            Ok(()) => {
                info!(target: "mapmo::client", "profile saved");
                let was_setup = std::mem::take(&mut self.needs_profile);
                self.notice(Notice::success("profile saved"));
                if was_setup && matches!(self.phase, Phase::Lobby) {
                    self.emit(UiUpdate::Screen(Screen::Lobby));
                }
            }
            Err(err) => self.on_account_error(err, "could not save profile"),
        }
    }

    fn on_account_error(&mut self, err: ApiError, context: &str) {
        if err.kind() == ErrorKind::Unauthorized {
            self.on_auth_failure();
            return;
        }
        warn!(target: "mapmo::client", error = %err, "{context}");
        self.notice(Notice::error(format!("{context}: {}", err.user_message())));
    }

    fn logout(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        info!(target: "mapmo::client", user_id = session.user_id(), "logging out");
        self.phase = Phase::Lobby;
        self.needs_profile = false;
        self.reconnect_timer = None;
        self.logout_timer = None;
        self.connection.logout();
        self.request(move |api| async move { ApiReply::LoggedOut(api.logout(&session).await) });
        self.emit(UiUpdate::Connection(self.connection.state()));
        self.emit(UiUpdate::Screen(Screen::Login));
    }

    /// Credential rejected by the socket or a REST call. The user sees a
    /// notice first; the logout follows after a short delay.
    fn on_auth_failure(&mut self) {
        if self.logout_timer.is_some() || self.session.is_none() {
            return;
        }
        warn!(target: "mapmo::client", "session expired; forcing logout");
        self.notice(Notice::error("session expired, please log in again"));
        self.logout_timer = Some(Timer::after(
            self.config.forced_logout_delay,
            &self.tx,
            Event::Timer(TimerEvent::ForcedLogout),
        ));
    }

    fn shutdown(&mut self) {
        info!(target: "mapmo::client", "shutting down");
        self.phase = Phase::Lobby;
        self.reconnect_timer = None;
        self.logout_timer = None;
        self.connection.close_normal();
        self.running = false;
    }

    // ---- connection -------------------------------------------------------

    fn connect_if_needed(&mut self, session: &Session) {
        match self.connection.ensure_connected(session) {
            Ok(Some(_)) => {
                self.reconnect_timer = None;
                self.emit(UiUpdate::Connection(ConnectionState::Connecting));
            }
            Ok(None) => {}
            Err(err) if err.kind() == ErrorKind::Unauthorized => self.on_auth_failure(),
            Err(err) => {
                warn!(target: "mapmo::client", error = %err, "cannot connect");
                self.notice(Notice::error(format!("cannot connect: {err}")));
            }
        }
    }

    fn on_link(&mut self, message: LinkMessage) {
        let LinkMessage { generation, event } = message;
        match event {
            LinkEvent::Opened => {
                if !self.connection.on_opened(generation) {
                    return;
                }
                self.reconnect_timer = None;
                self.emit(UiUpdate::Connection(ConnectionState::Open));
                // Time may have passed offline; pull the countdown back in line.
                let resync = self
                    .scope()
                    .filter(|scope| scope.countdown.is_running())
                    .map(|scope| scope.epoch);
                if let Some(epoch) = resync {
                    self.request_resync(epoch);
                }
            }
            LinkEvent::Text(text) => {
                if !self.connection.is_current(generation) {
                    trace!(target: "mapmo::client", generation, "frame from stale link dropped");
                    return;
                }
                dispatch(self, &text);
            }
            LinkEvent::Closed { code, reason } => {
                debug!(target: "mapmo::client", generation, code, %reason, "link closed");
                self.on_link_closed(generation, code);
            }
        }
    }

    fn on_link_closed(&mut self, generation: u64, code: u16) {
        let outcome = self.connection.on_closed(generation, code);
        if outcome != CloseOutcome::Stale {
            self.emit(UiUpdate::Connection(self.connection.state()));
        }
        match outcome {
            CloseOutcome::Stale => {}
            CloseOutcome::Terminal(TerminalReason::AuthFailed) => {
                self.leave_conversation();
                self.on_auth_failure();
            }
            CloseOutcome::Terminal(TerminalReason::GaveUp) => {
                self.leave_conversation();
                self.notice(Notice::fatal("connection lost, please reload"));
            }
            CloseOutcome::Terminal(TerminalReason::Normal) => {
                if self.leave_conversation() {
                    self.notice(Notice::error("disconnected from the conversation"));
                }
            }
            CloseOutcome::Terminal(TerminalReason::LoggedOut) => {}
            CloseOutcome::Retry { attempt, delay } => {
                debug!(target: "mapmo::client", attempt, ?delay, "reconnect scheduled");
                let generation = self.connection.generation();
                self.reconnect_timer = Some(Timer::after(
                    delay,
                    &self.tx,
                    Event::Timer(TimerEvent::Reconnect { generation }),
                ));
            }
        }
    }

    fn reconnect_due(&mut self, generation: u64) {
        self.reconnect_timer = None;
        if generation != self.connection.generation() {
            return;
        }
        match self.connection.reconnect_due(self.session.as_ref()) {
            Ok(_) => self.emit(UiUpdate::Connection(self.connection.state())),
            Err(err) => {
                warn!(target: "mapmo::client", error = %err, "reconnect failed to start");
                if err.kind() == ErrorKind::Unauthorized {
                    self.on_auth_failure();
                }
            }
        }
    }

    // ---- search -----------------------------------------------------------

    fn start_search(&mut self, kind: SearchKind) {
        let Some(session) = self.session.clone() else {
            self.notice(Notice::error(ClientError::NoSession.to_string()));
            return;
        };
        if matches!(self.phase, Phase::Conversation(_)) {
            self.notice(Notice::error("leave the current conversation first"));
            return;
        }
        if self.needs_profile {
            self.notice(Notice::error("complete your profile before searching"));
            return;
        }
        self.connect_if_needed(&session);
        let epoch = self.allocate_epoch();
        let poll = Timer::every(self.config.searching_poll_interval, &self.tx, move || {
            Event::Timer(TimerEvent::SearchPoll { epoch })
        });
        self.phase = Phase::Searching { epoch, _poll: poll };
        info!(target: "mapmo::client", ?kind, "searching");
        self.emit(UiUpdate::Screen(Screen::Searching(kind)));
        self.poll_searching_count(epoch);
        self.request(move |api| async move {
            ApiReply::Search {
                epoch,
                result: api.start_search(&session, kind).await,
            }
        });
    }

    fn is_searching(&self, epoch: u64) -> bool {
        matches!(self.phase, Phase::Searching { epoch: current, .. } if current == epoch)
    }

    fn poll_searching_count(&mut self, epoch: u64) {
        if !self.is_searching(epoch) {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        self.request(move |api| async move {
            ApiReply::SearchingCount {
                epoch,
                result: api.searching_count(&session).await,
            }
        });
    }

    fn on_search(&mut self, epoch: u64, result: Result<SearchData, ApiError>) {
        if !self.is_searching(epoch) {
            debug!(target: "mapmo::client", "search reply after search ended");
            return;
        }
        match result {
            Ok(SearchData::Matched(found)) => {
                info!(target: "mapmo::client", conversation_id = found.conversation_id, "matched immediately");
                self.enter_conversation(found.conversation_id, found.matched_user);
            }
            Ok(SearchData::Pending { status }) => {
                debug!(target: "mapmo::client", %status, "waiting for a match");
            }
            Err(err) if err.kind() == ErrorKind::Unauthorized => self.on_auth_failure(),
            Err(err) => {
                warn!(target: "mapmo::client", error = %err, "search failed");
                self.phase = Phase::Lobby;
                self.notice(Notice::error(format!("search failed: {}", err.user_message())));
                self.emit(UiUpdate::Screen(Screen::Lobby));
            }
        }
    }

    fn cancel_search(&mut self) {
        if !matches!(self.phase, Phase::Searching { .. }) {
            return;
        }
        self.phase = Phase::Lobby;
        self.emit(UiUpdate::Screen(Screen::Lobby));
        if let Some(session) = self.session.clone() {
            self.request(move |api| async move {
                ApiReply::SearchCancelled(api.cancel_search(&session).await)
            });
        }
    }

    // ---- conversation lifecycle ---------------------------------------------

    fn enter_conversation(&mut self, conversation_id: ConversationId, partner: Option<MatchedUser>) {
        let Some(session) = self.session.clone() else {
            self.notice(Notice::error(ClientError::NoSession.to_string()));
            return;
        };
        if self.scope().is_some_and(|scope| scope.id == conversation_id) {
            debug!(target: "mapmo::client", conversation_id, "already in conversation");
            return;
        }
        self.connect_if_needed(&session);

        let epoch = self.allocate_epoch();
        let policy = self.config.countdown;
        let scope = ConversationScope {
            epoch,
            id: conversation_id,
            partner: partner.clone(),
            echo: EchoReconciler::new(session.user_id(), conversation_id),
            typing: TypingDebouncer::new(self.config.typing_quiet_period),
            countdown: CountdownSynchronizer::new(policy),
            my_keep: false,
            partner_keep: false,
            keep_in_flight: false,
            resync_in_flight: false,
            end_requested: false,
            tick_timer: None,
            _first_resync: Timer::after(
                policy.initial_resync_delay,
                &self.tx,
                Event::Timer(TimerEvent::Resync { epoch }),
            ),
            _resync_timer: Timer::every(policy.resync_interval, &self.tx, move || {
                Event::Timer(TimerEvent::Resync { epoch })
            }),
            typing_timer: None,
            expiry_timer: None,
            retry_timers: Vec::new(),
        };
        // Replacing the phase drops any previous scope and its timers.
        self.phase = Phase::Conversation(Box::new(scope));
        info!(target: "mapmo::client", conversation_id, epoch, "entered conversation");
        self.emit(UiUpdate::Screen(Screen::Chat {
            conversation_id,
            partner,
        }));
        self.emit(UiUpdate::Keep(KeepIndicator::default()));

        let info_session = session.clone();
        self.request(move |api| async move {
            ApiReply::Conversation {
                epoch,
                result: api.conversation(&info_session, conversation_id).await,
            }
        });
        self.request(move |api| async move {
            ApiReply::History {
                epoch,
                result: api.messages(&session, conversation_id).await,
            }
        });
    }

    fn on_conversation_info(&mut self, epoch: u64, result: Result<ConversationInfo, ApiError>) {
        let now = Utc::now();
        let Some(scope) = self.scope_for(epoch) else {
            return;
        };
        let info = match result {
            Ok(info) => info,
            Err(err) => {
                match err.kind() {
                    ErrorKind::Unauthorized | ErrorKind::NotFound => {
                        self.on_scoped_api_error(epoch, err, "conversation unavailable");
                    }
                    _ => {
                        warn!(target: "mapmo::client", error = %err, "conversation info unavailable");
                        self.request_resync(epoch);
                    }
                }
                return;
            }
        };
        if scope.partner.is_none() {
            scope.partner = info.matched_user.clone();
        }
        match scope.countdown.bootstrap(info.countdown.as_ref(), now) {
            Bootstrap::Seeded(effects) => {
                self.start_ticker(epoch);
                self.apply_countdown(epoch, effects);
            }
            Bootstrap::NeedsResync => self.request_resync(epoch),
        }
    }

    fn on_history(&mut self, epoch: u64, result: Result<Vec<ChatMessage>, ApiError>) {
        let now = Utc::now();
        let Some(user_id) = self.user_id() else {
            return;
        };
        let Some(scope) = self.scope_for(epoch) else {
            return;
        };
        match result {
            Ok(history) => {
                debug!(target: "mapmo::client", count = history.len(), "replaying history");
                let updates = scope.echo.replay(history, now);
                self.apply_echo(updates, user_id);
            }
            Err(err) => self.on_scoped_api_error(epoch, err, "could not load earlier messages"),
        }
    }

    fn request_end(&mut self, epoch: u64) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let Some(scope) = self.scope_for(epoch) else {
            return;
        };
        if scope.end_requested {
            debug!(target: "mapmo::client", "end already requested");
            return;
        }
        scope.end_requested = true;
        let conversation_id = scope.id;
        info!(target: "mapmo::client", conversation_id, "ending conversation");
        self.request(move |api| async move {
            ApiReply::Ended {
                epoch,
                result: api.end_conversation(&session, conversation_id).await,
            }
        });
    }

    fn on_ended(&mut self, epoch: u64, result: Result<(), ApiError>) {
        if self.scope_for(epoch).is_none() {
            return;
        }
        match result {
            Ok(()) => self.finish_conversation("/".to_string(), None),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.finish_conversation("/".to_string(), None);
            }
            Err(err) => {
                if let Some(scope) = self.scope_for(epoch) {
                    scope.end_requested = false;
                }
                self.on_scoped_api_error(epoch, err, "could not end the conversation");
            }
        }
    }

    /// Tears the conversation down: timers die with the scope, the link is
    /// closed normally and the user lands back in the lobby.
    fn finish_conversation(&mut self, redirect_url: String, reason: Option<String>) {
        let Phase::Conversation(scope) = &self.phase else {
            return;
        };
        info!(target: "mapmo::client", conversation_id = scope.id, "conversation finished");
        self.phase = Phase::Lobby;
        self.reconnect_timer = None;
        self.connection.close_normal();
        self.emit(UiUpdate::ConversationEnded {
            redirect_url,
            reason,
        });
        self.emit(UiUpdate::Connection(self.connection.state()));
        self.emit(UiUpdate::Screen(Screen::Lobby));
    }

    /// Drops the conversation scope after the link went away for good.
    /// Returns whether a conversation was active.
    fn leave_conversation(&mut self) -> bool {
        let Phase::Conversation(scope) = &self.phase else {
            return false;
        };
        info!(target: "mapmo::client", conversation_id = scope.id, "leaving conversation after disconnect");
        self.phase = Phase::Lobby;
        self.emit(UiUpdate::Screen(Screen::Lobby));
        true
    }

    fn on_scoped_api_error(&mut self, epoch: u64, err: ApiError, context: &str) {
        match err.kind() {
            ErrorKind::Unauthorized => self.on_auth_failure(),
            ErrorKind::NotFound => {
                if self.scope_for(epoch).is_some() {
                    warn!(target: "mapmo::client", error = %err, "conversation is gone");
                    self.notice(Notice::error("this conversation no longer exists"));
                    self.finish_conversation("/".to_string(), Some(err.user_message()));
                }
            }
            _ => {
                warn!(target: "mapmo::client", error = %err, "{context}");
                self.notice(Notice::error(format!("{context}: {}", err.user_message())));
            }
        }
    }

    // ---- messages, typing and keep ------------------------------------------

    fn send_message(&mut self, text: &str) {
        let now = Utc::now();
        let Some(user_id) = self.user_id() else {
            return;
        };
        let Some(scope) = self.scope_mut() else {
            self.notice(Notice::error(ClientError::NoConversation.to_string()));
            return;
        };
        let message = match scope.echo.stage(text, now) {
            Ok(message) => message,
            Err(err) => {
                debug!(target: "mapmo::client", error = %err, "message not staged");
                return;
            }
        };
        let (epoch, conversation_id) = (scope.epoch, scope.id);
        self.emit(UiUpdate::MessageRendered(RenderedMessage::from_message(
            &message, user_id,
        )));
        self.send_frame(epoch, ClientFrame::chat(conversation_id, message.content));
    }

    fn input_changed(&mut self) {
        let tx = self.tx.clone();
        let Some(scope) = self.scope_mut() else {
            return;
        };
        let arm = scope.typing.on_input();
        let (epoch, conversation_id) = (scope.epoch, scope.id);
        // Re-arming drops the previous timer, cancelling its stop signal.
        scope.typing_timer = Some(Timer::after(
            arm.delay,
            &tx,
            Event::Timer(TimerEvent::TypingQuiet {
                epoch,
                generation: arm.generation,
            }),
        ));
        self.send_frame(epoch, ClientFrame::typing(conversation_id, true));
    }

    fn send_frame(&mut self, epoch: u64, frame: ClientFrame) {
        let outcome = self.outbound.send(&self.connection, OutboundFrame::new(frame));
        self.on_send_outcome(epoch, outcome);
    }

    fn on_send_outcome(&mut self, epoch: u64, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Sent | SendOutcome::Dropped(_) => {}
            SendOutcome::Retry { frame, delay } => {
                let tx = self.tx.clone();
                if let Some(scope) = self.scope_for(epoch) {
                    scope.retry_timers.retain(|timer| !timer.is_finished());
                    scope.retry_timers.push(Timer::after(
                        delay,
                        &tx,
                        Event::Timer(TimerEvent::RetrySend { epoch, frame }),
                    ));
                }
            }
            SendOutcome::Exhausted(frame) => {
                if frame.is_user_content() {
                    self.notice(Notice::error("message not delivered"));
                }
            }
        }
    }

    fn toggle_keep(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let Some(scope) = self.scope_mut() else {
            self.notice(Notice::error(ClientError::NoConversation.to_string()));
            return;
        };
        if scope.keep_in_flight || scope.countdown.both_kept() {
            return;
        }
        scope.keep_in_flight = true;
        let keep = !scope.my_keep;
        let (epoch, conversation_id) = (scope.epoch, scope.id);
        self.request(move |api| async move {
            ApiReply::Keep {
                epoch,
                result: api.submit_keep(&session, conversation_id, keep).await,
            }
        });
    }

    fn on_keep_reply(&mut self, epoch: u64, result: Result<KeepData, ApiError>) {
        let Some(scope) = self.scope_for(epoch) else {
            return;
        };
        scope.keep_in_flight = false;
        match result {
            Ok(data) => {
                scope.my_keep = data.keep_status;
                let effects = if data.both_kept {
                    scope.countdown.set_both_kept()
                } else {
                    Vec::new()
                };
                let indicator = scope.keep_indicator();
                self.emit(UiUpdate::Keep(indicator));
                self.notice(Notice::success(if data.keep_status {
                    "you kept this conversation"
                } else {
                    "keep withdrawn"
                }));
                self.apply_countdown(epoch, effects);
            }
            Err(err) => self.on_scoped_api_error(epoch, err, "could not update keep"),
        }
    }

    // ---- countdown --------------------------------------------------------

    fn start_ticker(&mut self, epoch: u64) {
        let tx = self.tx.clone();
        let tick = self.config.countdown.tick;
        if let Some(scope) = self.scope_for(epoch) {
            if scope.tick_timer.is_none() && !scope.countdown.is_expired() {
                scope.tick_timer = Some(Timer::every(tick, &tx, move || {
                    Event::Timer(TimerEvent::Tick { epoch })
                }));
            }
        }
    }

    fn request_resync(&mut self, epoch: u64) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let Some(scope) = self.scope_for(epoch) else {
            return;
        };
        if scope.resync_in_flight || scope.countdown.both_kept() || scope.countdown.is_expired() {
            return;
        }
        scope.resync_in_flight = true;
        let conversation_id = scope.id;
        self.request(move |api| async move {
            ApiReply::Countdown {
                epoch,
                result: api.countdown(&session, conversation_id).await,
            }
        });
    }

    fn on_countdown_reply(&mut self, epoch: u64, result: Result<CountdownState, ApiError>) {
        let Some(scope) = self.scope_for(epoch) else {
            return;
        };
        scope.resync_in_flight = false;
        match result {
            Ok(state) => self.apply_server_countdown(epoch, state),
            Err(err) if matches!(err.kind(), ErrorKind::Unauthorized | ErrorKind::NotFound) => {
                self.on_scoped_api_error(epoch, err, "countdown unavailable");
            }
            Err(err) => {
                debug!(target: "mapmo::client", error = %err, "countdown resync failed; deferring");
                if !scope.countdown.is_running() {
                    let effects = scope.countdown.start_unsynced();
                    self.start_ticker(epoch);
                    self.apply_countdown(epoch, effects);
                }
            }
        }
    }

    fn apply_server_countdown(&mut self, epoch: u64, state: CountdownState) {
        let now = Utc::now();
        let Some(scope) = self.scope_for(epoch) else {
            return;
        };
        let was_running = scope.countdown.is_running();
        let effects = scope.countdown.resync(&state, now);
        if !was_running && scope.countdown.is_running() {
            self.start_ticker(epoch);
        }
        self.apply_countdown(epoch, effects);
    }

    fn apply_countdown(&mut self, epoch: u64, effects: Vec<CountdownEffect>) {
        for effect in effects {
            match effect {
                CountdownEffect::Render(display) => self.emit(UiUpdate::Countdown(display)),
                CountdownEffect::Expired => self.on_expired(epoch),
            }
        }
    }

    fn on_expired(&mut self, epoch: u64) {
        let tx = self.tx.clone();
        let delay = self.config.expiry_end_delay;
        let Some(scope) = self.scope_for(epoch) else {
            return;
        };
        scope.tick_timer = None;
        scope.expiry_timer = Some(Timer::after(
            delay,
            &tx,
            Event::Timer(TimerEvent::ExpiryEnd { epoch }),
        ));
        self.notice(Notice::error("time's up, the conversation is ending"));
    }

    // ---- helpers ----------------------------------------------------------

    fn request<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<dyn ChatApi>) -> Fut,
        Fut: Future<Output = ApiReply> + Send + 'static,
    {
        let reply = call(Arc::clone(&self.api));
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Event::Api(reply.await));
        });
    }

    fn allocate_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn user_id(&self) -> Option<UserId> {
        self.session.as_ref().map(Session::user_id)
    }

    fn scope(&self) -> Option<&ConversationScope> {
        match &self.phase {
            Phase::Conversation(scope) => Some(&**scope),
            _ => None,
        }
    }

    fn scope_mut(&mut self) -> Option<&mut ConversationScope> {
        match &mut self.phase {
            Phase::Conversation(scope) => Some(&mut **scope),
            _ => None,
        }
    }

    fn scope_for(&mut self, epoch: u64) -> Option<&mut ConversationScope> {
        self.scope_mut().filter(|scope| scope.epoch == epoch)
    }

    fn apply_echo(&self, updates: Vec<EchoUpdate>, user_id: UserId) {
        for update in updates {
            match update {
                EchoUpdate::Render(message) => self.emit(UiUpdate::MessageRendered(
                    RenderedMessage::from_message(&message, user_id),
                )),
                EchoUpdate::Retract(local_id) => self.emit(UiUpdate::MessageRetracted(local_id)),
            }
        }
    }

    fn emit(&self, update: UiUpdate) {
        self.ui.apply(update);
    }

    fn notice(&self, notice: Notice) {
        self.emit(UiUpdate::Notice(notice));
    }
}

impl FrameHandler for ChatClient {
    fn on_ping(&mut self) {
        self.connection.reply_pong();
    }

    fn on_chat_message(&mut self, message: ChatMessage) {
        let now = Utc::now();
        let Some(user_id) = self.user_id() else {
            return;
        };
        let Some(scope) = self.scope_mut() else {
            debug!(target: "mapmo::client", id = message.id, "chat message outside a conversation");
            return;
        };
        let updates = scope.echo.reconcile(message, now);
        self.apply_echo(updates, user_id);
    }

    fn on_match_found(&mut self, found: MatchFound) {
        match self.scope() {
            Some(scope) if scope.id == found.conversation_id => {
                debug!(target: "mapmo::client", conversation_id = scope.id, "duplicate match notification");
            }
            Some(scope) => {
                warn!(
                    target: "mapmo::client",
                    current = scope.id,
                    offered = found.conversation_id,
                    "match while in another conversation ignored"
                );
            }
            None => {
                info!(
                    target: "mapmo::client",
                    conversation_id = found.conversation_id,
                    chat_url = found.chat_url.as_deref().unwrap_or_default(),
                    "match found"
                );
                self.enter_conversation(found.conversation_id, found.matched_user);
            }
        }
    }

    fn on_keep_status(&mut self, status: KeepStatus) {
        let user_id = self.user_id();
        let Some(scope) = self.scope_mut() else {
            return;
        };
        if status.conversation_id.is_some_and(|id| id != scope.id) {
            return;
        }
        if status.user_id.is_some() && status.user_id == user_id {
            scope.my_keep = status.keep_status;
        } else {
            scope.partner_keep = status.keep_status;
        }
        let effects = if status.both_kept {
            scope.countdown.set_both_kept()
        } else {
            Vec::new()
        };
        let indicator = scope.keep_indicator();
        let epoch = scope.epoch;
        self.emit(UiUpdate::Keep(indicator));
        self.apply_countdown(epoch, effects);
        self.request_resync(epoch);
    }

    fn on_typing(&mut self, status: TypingStatus) {
        let user_id = self.user_id();
        let Some(scope) = self.scope() else {
            return;
        };
        if status.conversation_id.is_some_and(|id| id != scope.id) {
            return;
        }
        // The server relays typing to everyone, including the typist.
        if status.user_id.is_some() && status.user_id == user_id {
            return;
        }
        self.emit(UiUpdate::PartnerTyping(status.is_typing));
    }

    fn on_conversation_ended(&mut self, ended: ConversationEnded) {
        let Some(scope) = self.scope() else {
            return;
        };
        if ended.conversation_id.is_some_and(|id| id != scope.id) {
            return;
        }
        info!(
            target: "mapmo::client",
            conversation_id = scope.id,
            ended_by = ?ended.ended_by,
            "conversation ended by server"
        );
        let redirect_url = ended.redirect_url.unwrap_or_else(|| "/".to_string());
        self.finish_conversation(redirect_url, ended.reason);
    }

    fn on_countdown_update(&mut self, state: CountdownState) {
        if let Some(epoch) = self.scope().map(|scope| scope.epoch) {
            self.apply_server_countdown(epoch, state);
        }
    }
}
