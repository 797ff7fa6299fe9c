use std::path::PathBuf;

use clap::{Args, Parser, builder::BoolishValueParser};
use mapmo_client::config::{
    ClientConfig, CredentialMode, DEFAULT_SERVER, Endpoints, SERVER_ENV, TOKEN_IN_QUERY_ENV,
};
use mapmo_client::telemetry::logging::{LogConfig, LogLevel};
use mapmo_client::{ClientError, Command};
use chrono::NaiveDate;
use mapmo_proto::rest::{ProfileUpdate, SearchKind};
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(
    name = "mapmo",
    about = "Anonymous one-to-one chat from the terminal",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = SERVER_ENV,
        default_value = DEFAULT_SERVER,
        help = "Server address; a bare host:port picks plain transports for loopback and TLS otherwise"
    )]
    pub server: String,

    #[arg(long, env = "MAPMO_USERNAME", help = "Log in as this user on startup")]
    pub username: Option<String>,

    #[arg(
        long,
        env = "MAPMO_PASSWORD",
        hide_env_values = true,
        help = "Password for --username; prompted for when omitted"
    )]
    pub password: Option<String>,

    #[arg(
        long = "token-in-query",
        env = TOKEN_IN_QUERY_ENV,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Pass the socket credential as a query parameter instead of a header"
    )]
    pub token_in_query: Option<bool>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "MAPMO_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "MAPMO_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    pub fn client_config(&self) -> Result<ClientConfig, CliError> {
        let mut config = ClientConfig::new(Endpoints::resolve(&self.server)?);
        if self.token_in_query.unwrap_or(false) {
            config.credential_mode = CredentialMode::Query;
        }
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("unknown command '/{0}'; try /help")]
    UnknownCommand(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Client(Command),
    /// `/login <username>`; the password is prompted for separately.
    Login(String),
    /// `/register <username>`; the password is prompted for twice.
    Register(String),
    Help,
    Quit,
    Empty,
}

pub const HELP: &str = "\
/register <username>   create an account
/login <username>      log in
/profile               show your profile
/profile options       list the goals and interests to pick from
/profile set nickname=...; dob=YYYY-MM-DD; gender=...; preference=...; goal=...; interests=a, b
                       fill in your profile (required before searching)
/search [chat|voice]   look for a partner
/cancel                stop searching
/join <id>             enter a conversation by id
/keep                  toggle keeping the current conversation
/end                   end the current conversation
/logout                log out
/quit                  exit
anything else          send as a chat message";

pub fn parse_input(line: &str) -> Result<Input, CliError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Ok(Input::Client(Command::SendMessage(line.to_string())));
    };
    let (name, tail) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(name, tail)| (name, tail.trim()));
    let arg = tail.split_whitespace().next();
    let input = match name {
        "register" => match arg {
            Some(username) => Input::Register(username.to_string()),
            None => return Err(CliError::InvalidArgument("usage: /register <username>".into())),
        },
        "profile" => match arg {
            None => Input::Client(Command::ShowProfile),
            Some("options") => Input::Client(Command::ProfileOptions),
            Some("set") => {
                let fields = tail.strip_prefix("set").unwrap_or_default();
                Input::Client(Command::UpdateProfile(parse_profile(fields)?))
            }
            Some(other) => {
                return Err(CliError::InvalidArgument(format!(
                    "unknown profile action '{other}'; try /help"
                )));
            }
        },
        "login" => match arg {
            Some(username) => Input::Login(username.to_string()),
            None => return Err(CliError::InvalidArgument("usage: /login <username>".into())),
        },
        "search" => Input::Client(Command::StartSearch(match arg {
            None | Some("chat") => SearchKind::Chat,
            Some("voice") => SearchKind::Voice,
            Some(other) => {
                return Err(CliError::InvalidArgument(format!(
                    "unknown search type '{other}'"
                )));
            }
        })),
        "cancel" => Input::Client(Command::CancelSearch),
        "join" => {
            let id = arg
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| CliError::InvalidArgument("usage: /join <conversation id>".into()))?;
            Input::Client(Command::EnterConversation {
                conversation_id: id,
                partner: None,
            })
        }
        "keep" => Input::Client(Command::ToggleKeep),
        "end" => Input::Client(Command::EndConversation),
        "logout" => Input::Client(Command::Logout),
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(CliError::UnknownCommand(other.to_string())),
    };
    Ok(input)
}

/// Parses `key=value` pairs separated by `;`. Interests are comma separated.
fn parse_profile(fields: &str) -> Result<ProfileUpdate, CliError> {
    let mut nickname = None;
    let mut dob = None;
    let mut gender = None;
    let mut preference = None;
    let mut goal = None;
    let mut interests = Vec::new();
    for field in fields.split(';').map(str::trim).filter(|field| !field.is_empty()) {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| CliError::InvalidArgument(format!("expected key=value, got '{field}'")))?;
        let value = value.trim().to_string();
        match key.trim() {
            "nickname" => nickname = Some(value),
            "dob" => {
                let date = NaiveDate::parse_from_str(&value, "%Y-%m-%d").map_err(|_| {
                    CliError::InvalidArgument(format!("dob must be YYYY-MM-DD, got '{value}'"))
                })?;
                dob = Some(date);
            }
            "gender" => gender = Some(value),
            "preference" => preference = Some(value),
            "goal" => goal = Some(value),
            "interests" => {
                interests = value
                    .split(',')
                    .map(str::trim)
                    .filter(|interest| !interest.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            other => {
                return Err(CliError::InvalidArgument(format!("unknown profile field '{other}'")));
            }
        }
    }
    let required = |value: Option<String>, name: &str| {
        value.ok_or_else(|| CliError::InvalidArgument(format!("{name} is required")))
    };
    Ok(ProfileUpdate {
        nickname: required(nickname, "nickname")?,
        dob: dob.ok_or_else(|| CliError::InvalidArgument("dob is required".into()))?,
        gender: required(gender, "gender")?,
        preference: required(preference, "preference")?,
        goal: required(goal, "goal")?,
        interests,
    })
}
