use std::env;
use std::time::Duration;

use url::Url;

use crate::connection::ReconnectPolicy;
use crate::countdown::CountdownPolicy;
use crate::error::ClientError;
use crate::outbound::RetryPolicy;

pub const SERVER_ENV: &str = "MAPMO_SERVER";
pub const TOKEN_IN_QUERY_ENV: &str = "MAPMO_TOKEN_IN_QUERY";
pub const DEFAULT_SERVER: &str = "127.0.0.1:8000";

/// How the auth token travels with the socket handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialMode {
    /// `Authorization: Bearer <token>` on the upgrade request.
    #[default]
    Header,
    /// `?token=<token>` on the socket URL, for servers that only read the query.
    Query,
}

/// Base URLs for REST calls and the live socket, both ending in `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub http: Url,
    pub socket: Url,
}

impl Endpoints {
    /// Accepts a bare `host:port` or an explicit `ws(s)://` / `http(s)://`
    /// address. Without a scheme, loopback hosts get plain transports and
    /// everything else TLS.
    pub fn resolve(server: &str) -> Result<Self, ClientError> {
        let server = normalize_server(server);
        let invalid = |reason: String| ClientError::InvalidServer {
            address: server.clone(),
            reason,
        };

        let (scheme, rest) = match server.split_once("://") {
            Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
            None => (None, server.as_str()),
        };
        let secure = match scheme.as_deref() {
            Some("ws") | Some("http") => false,
            Some("wss") | Some("https") => true,
            Some(other) => return Err(invalid(format!("unsupported scheme {other:?}"))),
            None => !is_loopback(rest),
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(invalid("missing host".into()));
        }

        let (http_scheme, ws_scheme) = if secure {
            ("https", "wss")
        } else {
            ("http", "ws")
        };
        let http = Url::parse(&format!("{http_scheme}://{rest}/"))
            .map_err(|err| invalid(err.to_string()))?;
        let socket = Url::parse(&format!("{ws_scheme}://{rest}/"))
            .map_err(|err| invalid(err.to_string()))?;
        Ok(Self { http, socket })
    }
}

/// Rewrites `localhost` to `127.0.0.1` so the client does not wander off to
/// `::1` when the server only listens on IPv4.
pub fn normalize_server(raw: &str) -> String {
    let raw = raw.trim();
    let (prefix, rest) = match raw.find("://") {
        Some(idx) => raw.split_at(idx + 3),
        None => ("", raw),
    };
    if rest == "localhost" || rest.starts_with("localhost:") || rest.starts_with("localhost/") {
        format!("{prefix}{}", rest.replacen("localhost", "127.0.0.1", 1))
    } else {
        raw.to_string()
    }
}

fn is_loopback(rest: &str) -> bool {
    let authority = rest.split('/').next().unwrap_or_default();
    let host = if authority.starts_with('[') {
        authority.split(']').next().map(|h| &h[1..]).unwrap_or_default()
    } else {
        authority.split(':').next().unwrap_or_default()
    };
    host == "localhost" || host == "::1" || host.starts_with("127.")
}

/// Everything the client runtime needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoints: Endpoints,
    pub credential_mode: CredentialMode,
    pub reconnect: ReconnectPolicy,
    pub retry: RetryPolicy,
    pub countdown: CountdownPolicy,
    pub typing_quiet_period: Duration,
    pub searching_poll_interval: Duration,
    pub forced_logout_delay: Duration,
    pub expiry_end_delay: Duration,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            endpoints,
            credential_mode: CredentialMode::default(),
            reconnect: ReconnectPolicy::default(),
            retry: RetryPolicy::default(),
            countdown: CountdownPolicy::default(),
            typing_quiet_period: Duration::from_secs(1),
            searching_poll_interval: Duration::from_secs(5),
            forced_logout_delay: Duration::from_secs(2),
            expiry_end_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(15),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ClientError> {
        let server = env::var(SERVER_ENV).unwrap_or_else(|_| DEFAULT_SERVER.to_string());
        let mut config = Self::new(Endpoints::resolve(&server)?);
        if env::var(TOKEN_IN_QUERY_ENV).is_ok_and(|v| v != "0" && !v.is_empty()) {
            config.credential_mode = CredentialMode::Query;
        }
        Ok(config)
    }
}
