use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;

use crate::api::{self, TokenProvider};
use crate::data::UserService;
use crate::models::User;
use crate::storage::Store;

/// Scopes a token must carry before channels can be managed.
pub const REQUIRED_SCOPES: [&str; 3] = ["basic", "messages", "write_post"];

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no access token in redirect url")]
    MissingToken,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("token is missing scopes: {0}. Log out and log in again")]
    MissingScopes(String),
}

pub struct Manager {
    store: Arc<Store>,
    token: RwLock<Option<String>>,
    user: RwLock<Option<User>>,
    next_path: RwLock<Option<String>>,
}

impl Manager {
    /// Restore whatever session the store holds.
    pub fn new(store: Arc<Store>) -> Result<Self> {
        let stored = store.load_session().context("session: load stored session")?;
        let (token, user, next_path) = match stored {
            Some(session) => (
                Some(session.access_token),
                session.user,
                session.next_path,
            ),
            None => (None, None, None),
        };
        Ok(Self {
            store,
            token: RwLock::new(token),
            user: RwLock::new(user),
            next_path: RwLock::new(next_path),
        })
    }

    pub fn is_logged_in(&self) -> bool {
        self.token.read().is_some()
    }

    pub fn current_user(&self) -> Option<User> {
        self.user.read().clone()
    }

    /// Resolve the user behind the held token, or behind the token in
    /// `redirect_url` when none is held or the held one was revoked. A new
    /// token is only stored once the server accepts it.
    pub fn login(&self, redirect_url: &str, users: &dyn UserService) -> Result<User> {
        let fresh = token_from_fragment(redirect_url);
        if self.is_logged_in() {
            match self.refresh_user(users) {
                Ok(user) => return Ok(user),
                Err(err) if fresh.is_some() && is_unauthorized(&err) => {
                    log::info!("session: stored token was rejected, trying the new one");
                }
                Err(err) => return Err(err),
            }
        }
        let token = fresh.ok_or(SessionError::MissingToken)?;
        let previous = self.token.write().replace(token.clone());
        match self.adopt(&token, users) {
            Ok(user) => {
                log::info!("session: stored new access token");
                Ok(user)
            }
            Err(err) => {
                *self.token.write() = previous;
                Err(err)
            }
        }
    }

    fn adopt(&self, token: &str, users: &dyn UserService) -> Result<User> {
        let user = users.me().context("session: fetch current user")?;
        self.store
            .save_token(token)
            .context("session: persist token")?;
        self.store
            .save_user(&user)
            .context("session: persist user")?;
        *self.user.write() = Some(user.clone());
        Ok(user)
    }

    pub fn logout(&self) -> Result<()> {
        self.store
            .clear_session()
            .context("session: clear stored session")?;
        *self.token.write() = None;
        *self.user.write() = None;
        *self.next_path.write() = None;
        log::info!("session: logged out");
        Ok(())
    }

    pub fn refresh_user(&self, users: &dyn UserService) -> Result<User> {
        if !self.is_logged_in() {
            return Err(SessionError::NotLoggedIn.into());
        }
        let user = users.me().context("session: fetch current user")?;
        self.store
            .save_user(&user)
            .context("session: persist user")?;
        *self.user.write() = Some(user.clone());
        Ok(user)
    }

    pub fn verify_scopes(&self, users: &dyn UserService) -> Result<()> {
        let scopes = users.token_scopes().context("session: fetch token scopes")?;
        let missing: Vec<&str> = REQUIRED_SCOPES
            .iter()
            .copied()
            .filter(|required| !scopes.iter().any(|scope| scope == required))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SessionError::MissingScopes(missing.join(", ")).into())
        }
    }

    /// Remember where the user was when the server turned them away.
    pub fn remember_path(&self, path: &str) -> Result<()> {
        *self.next_path.write() = Some(path.to_string());
        if self.is_logged_in() {
            self.store
                .set_next_path(Some(path))
                .context("session: persist next path")?;
        }
        Ok(())
    }

    pub fn take_next_path(&self) -> Option<String> {
        let path = self.next_path.write().take();
        if path.is_some() && self.is_logged_in() {
            if let Err(err) = self.store.set_next_path(None) {
                log::warn!("session: failed to clear next path: {err:#}");
            }
        }
        path
    }
}

impl TokenProvider for Manager {
    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

fn is_unauthorized(err: &anyhow::Error) -> bool {
    err.downcast_ref::<api::Error>()
        .is_some_and(api::Error::is_unauthorized)
}

/// Pull `access_token` out of the fragment of an OAuth redirect url.
pub fn token_from_fragment(redirect_url: &str) -> Option<String> {
    let (_, fragment) = redirect_url.split_once('#')?;
    url::form_urlencoded::parse(fragment.as_bytes())
        .find(|(key, _)| key == "access_token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}
