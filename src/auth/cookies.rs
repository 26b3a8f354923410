//! Session cookie helpers.

use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue};

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

/// Read a cookie value from the `Cookie` header.
pub fn get_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim())
}

pub fn set_cookie(name: &str, value: &str, max_age: Duration, secure: bool) -> String {
    format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}{}",
        name,
        value,
        max_age.as_secs(),
        if secure { "; Secure" } else { "" }
    )
}

pub fn clear_cookie(name: &str, secure: bool) -> String {
    set_cookie(name, "", Duration::ZERO, secure)
}

/// Cookie instructions attached to a session response.
#[derive(Debug, Default, Clone)]
pub struct CookieJar(Vec<String>);

impl CookieJar {
    pub fn set_session(
        access: &str,
        access_ttl: Duration,
        refresh: &str,
        refresh_ttl: Duration,
        secure: bool,
    ) -> Self {
        Self(vec![
            set_cookie(ACCESS_COOKIE, access, access_ttl, secure),
            set_cookie(REFRESH_COOKIE, refresh, refresh_ttl, secure),
        ])
    }

    pub fn clear_session(secure: bool) -> Self {
        Self(vec![
            clear_cookie(ACCESS_COOKIE, secure),
            clear_cookie(REFRESH_COOKIE, secure),
        ])
    }

    #[cfg(test)]
    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn into_headers(self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for cookie in self.0 {
            if let Ok(v) = HeaderValue::from_str(&cookie) {
                headers.append(header::SET_COOKIE, v);
            }
        }
        headers
    }
}
