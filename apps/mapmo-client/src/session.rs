use std::fmt;

use mapmo_proto::UserId;

/// Logged-in identity. Created from a successful login and dropped on logout;
/// everything else only borrows it.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    user_id: UserId,
    auth_token: String,
}

impl Session {
    pub fn new(user_id: UserId, auth_token: impl Into<String>) -> Self {
        Self {
            user_id,
            auth_token: auth_token.into(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub fn has_token(&self) -> bool {
        !self.auth_token.trim().is_empty()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_token() {
        let session = Session::new(7, "secret-token");
        let rendered = format!("{session:?}");
        assert!(rendered.contains("user_id: 7"));
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn blank_token_is_not_usable() {
        assert!(!Session::new(1, "  ").has_token());
        assert!(Session::new(1, "abc").has_token());
    }
}
