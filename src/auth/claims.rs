use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type of JWT: access or refresh.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Access token payload: who the caller is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,        // user ID
    pub username: String,
    pub email: String,
    pub iat: usize,       // issued at (unix timestamp)
    pub exp: usize,       // expires at (unix timestamp)
    pub iss: String,
    pub aud: String,
    pub kind: TokenKind,
}

/// Refresh token payload: only the user id, plus a nonce so every issued token is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub jti: Uuid,
    pub iat: usize,
    pub exp: usize,
    pub iss: String,
    pub aud: String,
    pub kind: TokenKind,
}

pub(crate) trait TokenClaims {
    fn kind(&self) -> TokenKind;
    fn exp(&self) -> usize;
}

impl TokenClaims for AccessClaims {
    fn kind(&self) -> TokenKind {
        self.kind
    }
    fn exp(&self) -> usize {
        self.exp
    }
}

impl TokenClaims for RefreshClaims {
    fn kind(&self) -> TokenKind {
        self.kind
    }
    fn exp(&self) -> usize {
        self.exp
    }
}
