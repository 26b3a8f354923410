use std::time::Duration;

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::de::DeserializeOwned;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use super::claims::{AccessClaims, RefreshClaims, TokenClaims, TokenKind};
use crate::{
    config::{JwtConfig, TokenConfig, MAX_TTL_MINUTES},
    error::AppError,
    users::User,
};

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token rejected")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("token is not a well-formed JWT")]
    Malformed,
    #[error("sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Invalid => AppError::InvalidToken,
            TokenError::Expired => AppError::ExpiredToken,
            TokenError::Malformed => AppError::MalformedToken,
            TokenError::Signing(err) => AppError::Internal(anyhow::Error::new(err)),
        }
    }
}

#[derive(Clone)]
struct KindKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl KindKeys {
    fn from_config(cfg: &TokenConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            ttl: Duration::from_secs((cfg.ttl_minutes.clamp(0, MAX_TTL_MINUTES) as u64) * 60),
        }
    }
}

/// Issues and verifies access and refresh JWTs, each kind with its own secret and lifetime.
#[derive(Clone)]
pub struct TokenService {
    access: KindKeys,
    refresh: KindKeys,
    issuer: String,
    audience: String,
}

impl TokenService {
    pub fn from_config(cfg: &JwtConfig) -> Self {
        Self {
            access: KindKeys::from_config(&cfg.access),
            refresh: KindKeys::from_config(&cfg.refresh),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access.ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh.ttl
    }

    pub fn issue_access(&self, user: &User) -> Result<String, TokenError> {
        self.issue_access_at(user, OffsetDateTime::now_utc())
    }

    pub fn issue_access_at(&self, user: &User, now: OffsetDateTime) -> Result<String, TokenError> {
        let claims = AccessClaims {
            sub: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            iat: now.unix_timestamp() as usize,
            exp: expiry(now, self.access.ttl),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            kind: TokenKind::Access,
        };
        let token = encode(&Header::default(), &claims, &self.access.encoding)
            .map_err(TokenError::Signing)?;
        debug!(user_id = %user.id, kind = ?TokenKind::Access, "jwt signed");
        Ok(token)
    }

    pub fn issue_refresh(&self, user_id: Uuid) -> Result<String, TokenError> {
        self.issue_refresh_at(user_id, OffsetDateTime::now_utc())
    }

    pub fn issue_refresh_at(&self, user_id: Uuid, now: OffsetDateTime) -> Result<String, TokenError> {
        let claims = RefreshClaims {
            sub: user_id,
            jti: Uuid::new_v4(),
            iat: now.unix_timestamp() as usize,
            exp: expiry(now, self.refresh.ttl),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            kind: TokenKind::Refresh,
        };
        let token = encode(&Header::default(), &claims, &self.refresh.encoding)
            .map_err(TokenError::Signing)?;
        debug!(user_id = %user_id, kind = ?TokenKind::Refresh, "jwt signed");
        Ok(token)
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, TokenError> {
        self.verify_access_at(token, OffsetDateTime::now_utc())
    }

    pub fn verify_access_at(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<AccessClaims, TokenError> {
        self.verify(token, &self.access, TokenKind::Access, now)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        self.verify_refresh_at(token, OffsetDateTime::now_utc())
    }

    pub fn verify_refresh_at(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<RefreshClaims, TokenError> {
        self.verify(token, &self.refresh, TokenKind::Refresh, now)
    }

    fn verify<C>(
        &self,
        token: &str,
        keys: &KindKeys,
        kind: TokenKind,
        now: OffsetDateTime,
    ) -> Result<C, TokenError>
    where
        C: DeserializeOwned + TokenClaims,
    {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked below against the caller's clock.
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));

        let claims = decode::<C>(token, &keys.decoding, &validation)
            .map_err(|e| classify(e.kind()))?
            .claims;

        if claims.kind() != kind {
            return Err(TokenError::Invalid);
        }
        if claims.exp() as i64 <= now.unix_timestamp() {
            return Err(TokenError::Expired);
        }
        debug!(kind = ?kind, "jwt verified");
        Ok(claims)
    }
}

fn expiry(now: OffsetDateTime, ttl: Duration) -> usize {
    (now + TimeDuration::seconds(ttl.as_secs() as i64)).unix_timestamp() as usize
}

fn classify(kind: &ErrorKind) -> TokenError {
    match kind {
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            TokenError::Malformed
        }
        ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Invalid,
    }
}
