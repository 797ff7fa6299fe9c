use mapmo_proto::FrameError;
use thiserror::Error;

use crate::api::ApiError;
use crate::transport::TransportError;

/// Coarse classification the runtime uses to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network hiccup or server-side failure; retry or wait for the next cycle.
    Transient,
    /// Credential rejected; the session has to be discarded.
    Unauthorized,
    /// The conversation no longer exists on the server.
    NotFound,
    /// A frame or response could not be understood.
    Malformed,
    /// The request could not be made in the current state.
    Invalid,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session has no auth token")]
    MissingToken,
    #[error("not logged in")]
    NoSession,
    #[error("no active conversation")]
    NoConversation,
    #[error("message is empty")]
    EmptyMessage,
    #[error("invalid server address {address:?}: {reason}")]
    InvalidServer { address: String, reason: String },
    #[error("client runtime has stopped")]
    Stopped,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::MissingToken | ClientError::NoSession => ErrorKind::Unauthorized,
            ClientError::NoConversation
            | ClientError::EmptyMessage
            | ClientError::InvalidServer { .. }
            | ClientError::Stopped => ErrorKind::Invalid,
            ClientError::Api(err) => err.kind(),
            ClientError::Transport(_) => ErrorKind::Transient,
            ClientError::Frame(_) => ErrorKind::Malformed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_keep_their_classification() {
        let err = ClientError::from(ApiError::Unauthorized("expired".into()));
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        let err = ClientError::from(ApiError::NotFound("conversation 9".into()));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = ClientError::from(TransportError::NotOpen);
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn malformed_frames_are_classified() {
        let err = ClientError::from(mapmo_proto::decode("{").unwrap_err());
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }
}
