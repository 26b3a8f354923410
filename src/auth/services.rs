use tracing::{info, instrument, warn};

use super::{
    cookies::CookieJar,
    dto::{ChangePasswordRequest, LoginOutcome, LoginRequest, RefreshOutcome, TokenPair},
    extractors::AuthUser,
    password::{hash_password, verify_password, MIN_PASSWORD_LEN},
};
use crate::{
    error::AppError,
    state::AppState,
    users::{PublicUser, User},
};

fn normalized(field: Option<String>) -> Option<String> {
    field
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

/// Mint a fresh access/refresh pair and the cookies that carry it.
fn issue_pair(st: &AppState, user: &User) -> Result<(TokenPair, CookieJar), AppError> {
    let tokens = TokenPair {
        access_token: st.tokens.issue_access(user)?,
        refresh_token: st.tokens.issue_refresh(user.id)?,
    };
    let cookies = CookieJar::set_session(
        &tokens.access_token,
        st.tokens.access_ttl(),
        &tokens.refresh_token,
        st.tokens.refresh_ttl(),
        st.config.cookie_secure,
    );
    Ok((tokens, cookies))
}

/// Anonymous -> Authenticated(T). The stored refresh token becomes the live session.
#[instrument(skip(st, input), fields(username = ?input.username, email = ?input.email))]
pub async fn login(st: &AppState, input: LoginRequest) -> Result<LoginOutcome, AppError> {
    let username = normalized(input.username);
    let email = normalized(input.email);
    if username.is_none() && email.is_none() {
        return Err(AppError::validation("username or email is required"));
    }
    if input.password.is_empty() {
        return Err(AppError::validation("password is required"));
    }

    let user = st
        .users
        .find_by_login(username.as_deref(), email.as_deref())
        .await?
        .ok_or_else(|| {
            warn!("login for unknown user");
            AppError::NotFound
        })?;

    if !verify_password(&input.password, &user.password_hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::InvalidCredentials);
    }

    let (tokens, cookies) = issue_pair(st, &user)?;
    st.users
        .set_refresh_token(user.id, Some(&tokens.refresh_token))
        .await?;

    info!(user_id = %user.id, "user logged in");
    Ok(LoginOutcome {
        user: user.into(),
        tokens,
        cookies,
    })
}

/// Authenticated(T) -> Authenticated(T'). `presented` must be exactly the stored token;
/// the swap is conditional on it so concurrent refreshes with one token cannot both win.
#[instrument(skip_all)]
pub async fn refresh(st: &AppState, presented: Option<String>) -> Result<RefreshOutcome, AppError> {
    let presented = presented
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(AppError::MissingToken)?;

    let claims = st.tokens.verify_refresh(&presented).map_err(|e| {
        warn!(error = %e, "refresh token rejected");
        AppError::from(e)
    })?;

    let user = st.users.find_by_id(claims.sub).await?.ok_or_else(|| {
        warn!(user_id = %claims.sub, "refresh token for unknown user");
        AppError::InvalidToken
    })?;

    if user.refresh_token.as_deref() != Some(presented.as_str()) {
        warn!(user_id = %user.id, "refresh token superseded or revoked");
        return Err(AppError::InvalidToken);
    }

    let (tokens, cookies) = issue_pair(st, &user)?;
    let swapped = st
        .users
        .rotate_refresh_token(user.id, &presented, &tokens.refresh_token)
        .await?;
    if !swapped {
        warn!(user_id = %user.id, "refresh token rotated concurrently");
        return Err(AppError::InvalidToken);
    }

    info!(user_id = %user.id, "session refreshed");
    Ok(RefreshOutcome { tokens, cookies })
}

/// Authenticated(T) -> LoggedOut. Idempotent.
#[instrument(skip(st, auth), fields(user_id = %auth.id))]
pub async fn logout(st: &AppState, auth: &AuthUser) -> Result<CookieJar, AppError> {
    st.users.set_refresh_token(auth.id, None).await?;
    info!("user logged out");
    Ok(CookieJar::clear_session(st.config.cookie_secure))
}

/// Replace the password hash. Outstanding refresh tokens stay valid.
#[instrument(skip(st, auth, input), fields(user_id = %auth.id))]
pub async fn change_password(
    st: &AppState,
    auth: &AuthUser,
    input: ChangePasswordRequest,
) -> Result<(), AppError> {
    if input.new_password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::validation("New password too short"));
    }

    let user = st.users.find_by_id(auth.id).await?.ok_or(AppError::NotFound)?;
    if !verify_password(&input.old_password, &user.password_hash)? {
        warn!("change password with wrong current password");
        return Err(AppError::InvalidCredentials);
    }

    let hash = hash_password(&input.new_password)?;
    st.users.set_password_hash(user.id, &hash).await?;
    info!("password changed");
    Ok(())
}

#[instrument(skip(st, auth), fields(user_id = %auth.id))]
pub async fn current_user(st: &AppState, auth: &AuthUser) -> Result<PublicUser, AppError> {
    let user = st.users.find_by_id(auth.id).await?.ok_or(AppError::NotFound)?;
    Ok(user.into())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use time::{Duration as TimeDuration, OffsetDateTime};
    use uuid::Uuid;

    use super::*;
    use crate::users::{memory::MemoryUserStore, store::StoreError, NewUser, UserStore};

    async fn seed(st: &AppState, username: &str, password: &str) -> User {
        st.users
            .create(NewUser {
                username: username.into(),
                email: format!("{}@example.com", username),
                full_name: "Test User".into(),
                avatar: "https://fake.local/media/avatars/a.png".into(),
                cover_image: None,
                password_hash: hash_password(password).unwrap(),
            })
            .await
            .unwrap()
    }

    fn login_req(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            username: Some(username.into()),
            email: None,
            password: password.into(),
        }
    }

    fn auth_of(user: &User) -> AuthUser {
        AuthUser {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
        }
    }

    async fn stored_token(st: &AppState, user: &User) -> Option<String> {
        st.users
            .find_by_id(user.id)
            .await
            .unwrap()
            .unwrap()
            .refresh_token
    }

    #[tokio::test]
    async fn login_persists_refresh_token_and_returns_sanitized_user() {
        let st = AppState::fake();
        let alice = seed(&st, "alice", "correct-password").await;

        let out = login(&st, login_req("alice", "correct-password")).await.unwrap();
        assert_eq!(out.user.id, alice.id);
        assert_eq!(stored_token(&st, &alice).await, Some(out.tokens.refresh_token.clone()));

        let access = st.tokens.verify_access(&out.tokens.access_token).unwrap();
        assert_eq!(access.sub, alice.id);
        assert_eq!(access.username, "alice");

        assert_eq!(out.cookies.values().len(), 2);
        assert!(out.cookies.values().iter().all(|c| c.contains("HttpOnly")));
    }

    #[tokio::test]
    async fn login_by_email_is_case_insensitive() {
        let st = AppState::fake();
        let alice = seed(&st, "alice", "correct-password").await;
        let req = LoginRequest {
            username: None,
            email: Some("  ALICE@Example.com ".into()),
            password: "correct-password".into(),
        };
        assert_eq!(login(&st, req).await.unwrap().user.id, alice.id);
    }

    #[tokio::test]
    async fn login_failures() {
        let st = AppState::fake();
        seed(&st, "alice", "correct-password").await;

        let err = login(&st, login_req("nobody", "whatever")).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound));

        let err = login(&st, login_req("alice", "wrong-password")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));

        let req = LoginRequest {
            username: Some("  ".into()),
            email: None,
            password: "x".into(),
        };
        assert!(matches!(login(&st, req).await.unwrap_err(), AppError::Validation(_)));
    }

    #[tokio::test]
    async fn refresh_rotates_and_old_token_is_single_use() {
        let st = AppState::fake();
        let alice = seed(&st, "alice", "correct").await;

        let r1 = login(&st, login_req("alice", "correct"))
            .await
            .unwrap()
            .tokens
            .refresh_token;

        let second = refresh(&st, Some(r1.clone())).await.unwrap();
        let r2 = second.tokens.refresh_token;
        assert_ne!(r1, r2);
        assert_eq!(stored_token(&st, &alice).await, Some(r2.clone()));
        assert_eq!(
            st.tokens.verify_access(&second.tokens.access_token).unwrap().sub,
            alice.id
        );

        let err = refresh(&st, Some(r1)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));

        // The superseding token keeps working.
        refresh(&st, Some(r2)).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_after_logout_fails() {
        let st = AppState::fake();
        let alice = seed(&st, "alice", "correct").await;
        let r1 = login(&st, login_req("alice", "correct"))
            .await
            .unwrap()
            .tokens
            .refresh_token;

        let cookies = logout(&st, &auth_of(&alice)).await.unwrap();
        assert!(cookies.values().iter().all(|c| c.contains("Max-Age=0")));
        assert_eq!(stored_token(&st, &alice).await, None);

        let err = refresh(&st, Some(r1)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let st = AppState::fake();
        let alice = seed(&st, "alice", "correct").await;
        logout(&st, &auth_of(&alice)).await.unwrap();
        logout(&st, &auth_of(&alice)).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_requires_a_token() {
        let st = AppState::fake();
        assert!(matches!(refresh(&st, None).await.unwrap_err(), AppError::MissingToken));
        assert!(matches!(
            refresh(&st, Some("   ".into())).await.unwrap_err(),
            AppError::MissingToken
        ));
        assert!(matches!(
            refresh(&st, Some("garbage".into())).await.unwrap_err(),
            AppError::MalformedToken
        ));
    }

    #[tokio::test]
    async fn refresh_rejects_access_token_and_unknown_user() {
        let st = AppState::fake();
        let alice = seed(&st, "alice", "correct").await;
        let out = login(&st, login_req("alice", "correct")).await.unwrap();

        let err = refresh(&st, Some(out.tokens.access_token)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));

        let ghost = st.tokens.issue_refresh(uuid::Uuid::new_v4()).unwrap();
        assert!(matches!(refresh(&st, Some(ghost)).await.unwrap_err(), AppError::InvalidToken));
        assert!(stored_token(&st, &alice).await.is_some());
    }

    #[tokio::test]
    async fn expired_refresh_token_fails_with_expired() {
        let st = AppState::fake();
        let alice = seed(&st, "alice", "correct").await;
        let stale = st
            .tokens
            .issue_refresh_at(alice.id, OffsetDateTime::now_utc() - TimeDuration::days(30))
            .unwrap();
        st.users.set_refresh_token(alice.id, Some(&stale)).await.unwrap();

        let err = refresh(&st, Some(stale)).await.unwrap_err();
        assert!(matches!(err, AppError::ExpiredToken));
    }

    /// Lets a rival session rotate the stored token right after the first
    /// `find_by_id` returns, so the caller's read is stale by the time it swaps.
    struct RacedStore {
        inner: MemoryUserStore,
        rival: Mutex<Option<String>>,
    }

    #[async_trait]
    impl UserStore for RacedStore {
        async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
            let user = self.inner.find_by_id(id).await?;
            let rival = self.rival.lock().unwrap().take();
            if let (Some(rival), Some(current)) =
                (rival, user.as_ref().and_then(|u| u.refresh_token.as_deref()))
            {
                assert!(self.inner.rotate_refresh_token(id, current, &rival).await?);
            }
            Ok(user)
        }

        async fn find_by_login(
            &self,
            username: Option<&str>,
            email: Option<&str>,
        ) -> Result<Option<User>, StoreError> {
            self.inner.find_by_login(username, email).await
        }

        async fn exists(&self, username: &str, email: &str) -> Result<bool, StoreError> {
            self.inner.exists(username, email).await
        }

        async fn create(&self, new: NewUser) -> Result<User, StoreError> {
            self.inner.create(new).await
        }

        async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), StoreError> {
            self.inner.set_refresh_token(id, token).await
        }

        async fn rotate_refresh_token(
            &self,
            id: Uuid,
            expected: &str,
            next: &str,
        ) -> Result<bool, StoreError> {
            self.inner.rotate_refresh_token(id, expected, next).await
        }

        async fn set_password_hash(&self, id: Uuid, hash: &str) -> Result<(), StoreError> {
            self.inner.set_password_hash(id, hash).await
        }

        async fn update_details(
            &self,
            id: Uuid,
            full_name: &str,
            email: &str,
        ) -> Result<Option<User>, StoreError> {
            self.inner.update_details(id, full_name, email).await
        }

        async fn set_avatar(&self, id: Uuid, url: &str) -> Result<Option<User>, StoreError> {
            self.inner.set_avatar(id, url).await
        }

        async fn set_cover_image(&self, id: Uuid, url: &str) -> Result<Option<User>, StoreError> {
            self.inner.set_cover_image(id, url).await
        }
    }

    #[tokio::test]
    async fn refresh_loses_when_token_rotates_after_read() {
        let raced = Arc::new(RacedStore {
            inner: MemoryUserStore::new(),
            rival: Mutex::new(None),
        });
        let st = AppState::fake_with(
            raced.clone(),
            Arc::new(crate::state::fake::FakeStorage::default()),
        );
        let alice = seed(&st, "alice", "correct").await;
        let r1 = login(&st, login_req("alice", "correct"))
            .await
            .unwrap()
            .tokens
            .refresh_token;

        let winner = st.tokens.issue_refresh(alice.id).unwrap();
        *raced.rival.lock().unwrap() = Some(winner.clone());

        let err = refresh(&st, Some(r1)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));
        assert_eq!(stored_token(&st, &alice).await, Some(winner.clone()));

        let next = refresh(&st, Some(winner)).await.unwrap().tokens.refresh_token;
        assert_eq!(stored_token(&st, &alice).await, Some(next));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refresh_has_one_winner() {
        let slow = MemoryUserStore::with_latency(std::time::Duration::from_millis(20));
        let st = AppState::fake_with(
            Arc::new(slow),
            Arc::new(crate::state::fake::FakeStorage::default()),
        );
        let alice = seed(&st, "alice", "correct").await;
        let r1 = login(&st, login_req("alice", "correct"))
            .await
            .unwrap()
            .tokens
            .refresh_token;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let st = st.clone();
                let r1 = r1.clone();
                tokio::spawn(async move { refresh(&st, Some(r1)).await })
            })
            .collect();

        let mut winners = Vec::new();
        for t in tasks {
            match t.await.unwrap() {
                Ok(out) => winners.push(out.tokens.refresh_token),
                Err(e) => assert!(matches!(e, AppError::InvalidToken)),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(stored_token(&st, &alice).await, winners.pop());
    }

    #[tokio::test]
    async fn change_password_with_wrong_current_leaves_hash() {
        let st = AppState::fake();
        let alice = seed(&st, "alice", "correct-password").await;
        let before = st.users.find_by_id(alice.id).await.unwrap().unwrap().password_hash;

        let err = change_password(
            &st,
            &auth_of(&alice),
            ChangePasswordRequest {
                old_password: "wrong-password".into(),
                new_password: "brand-new-password".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));

        let after = st.users.find_by_id(alice.id).await.unwrap().unwrap().password_hash;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn change_password_keeps_existing_session() {
        let st = AppState::fake();
        let alice = seed(&st, "alice", "correct-password").await;
        let r1 = login(&st, login_req("alice", "correct-password"))
            .await
            .unwrap()
            .tokens
            .refresh_token;

        change_password(
            &st,
            &auth_of(&alice),
            ChangePasswordRequest {
                old_password: "correct-password".into(),
                new_password: "brand-new-password".into(),
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            login(&st, login_req("alice", "correct-password")).await.unwrap_err(),
            AppError::InvalidCredentials
        ));
        refresh(&st, Some(r1)).await.unwrap();
        login(&st, login_req("alice", "brand-new-password")).await.unwrap();
    }

    #[tokio::test]
    async fn change_password_rejects_short_new_password() {
        let st = AppState::fake();
        let alice = seed(&st, "alice", "correct-password").await;
        let err = change_password(
            &st,
            &auth_of(&alice),
            ChangePasswordRequest {
                old_password: "correct-password".into(),
                new_password: "short".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn slow_store_surfaces_unavailable() {
        let slow = MemoryUserStore::with_latency(std::time::Duration::from_secs(2));
        let st = AppState::fake_with(
            Arc::new(slow),
            Arc::new(crate::state::fake::FakeStorage::default()),
        );
        let err = login(&st, login_req("alice", "correct")).await.unwrap_err();
        assert!(matches!(err, AppError::StoreUnavailable(_)));
    }
}
