//! Session lifecycle: restore, sign-in, sign-out and token refresh.
//!
//! The manager is handed explicitly to every component that needs
//! authenticated calls. Store operations take a [`Session`] argument, and the
//! only way to obtain one is [`SessionManager::require`].

use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, watch};

use crate::auth::{AuthBackend, Session, User};
use crate::entry::EntryId;
use crate::error::{AuthError, BlotterError, Result};

/// Navigation targets of the user-facing surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Login,
    Home,
    List,
    Entry(EntryId),
}

impl Route {
    /// Path the route is served under
    pub fn path(&self) -> String {
        match self {
            Route::Login => "/login".to_string(),
            Route::Home => "/".to_string(),
            Route::List => "/entries".to_string(),
            Route::Entry(id) => format!("/entries/{}", id),
        }
    }
}

/// Change notifications published to session dependents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A stored session was verified during `init`
    Restored(User),
    SignedIn(User),
    SignedOut,
    TokenRefreshed(User),
}

/// Result of a sign-out; the user always ends signed out on the login route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOutOutcome {
    pub route: Route,
    /// Server-side failure that was swallowed, if any
    pub server_error: Option<String>,
}

const EVENT_CAPACITY: usize = 16;

/// Tracks the authenticated identity of one client
pub struct SessionManager {
    backend: Arc<dyn AuthBackend>,
    state: watch::Sender<Option<Session>>,
    events: broadcast::Sender<SessionEvent>,
    // Serializes refreshes; refresh tokens are single use
    refreshing: Mutex<()>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        let (state, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        SessionManager {
            backend,
            state,
            events,
            refreshing: Mutex::new(()),
        }
    }

    /// Load the current session state from the backend
    ///
    /// A previously stored session is verified with the auth service. An
    /// absent or rejected session leaves the manager signed out; transport
    /// failures are returned to the caller.
    pub async fn init(&self, stored: Option<Session>) -> Result<Option<User>> {
        let Some(session) = stored else {
            debug!("[AUTH] No stored session");
            return Ok(None);
        };

        match self.backend.get_user(&session.access_token).await {
            Ok(user) => {
                let session = Session {
                    user: user.clone(),
                    ..session
                };
                self.state.send_replace(Some(session));
                self.publish(SessionEvent::Restored(user.clone()));
                Ok(Some(user))
            }
            Err(BlotterError::Auth(err)) => {
                debug!("[AUTH] Stored session rejected: {}", err);
                self.state.send_replace(None);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Exchange credentials for a session
    ///
    /// # Returns
    /// * `Ok(Route::Home)` - the caller navigates there exactly once
    /// * `Err(_)` - invalid credentials or a transport failure; no navigation
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Route> {
        let session = self.backend.sign_in_with_password(email, password).await?;
        let user = session.user.clone();
        self.state.send_replace(Some(session));
        info!("[AUTH] Signed in {}", user.email);
        self.publish(SessionEvent::SignedIn(user));
        Ok(Route::Home)
    }

    /// Sign out, ending on the login route whatever the server says
    ///
    /// Local state is cleared before the server is contacted. A missing
    /// server-side session counts as success; any other server failure is
    /// logged and reported in the outcome.
    pub async fn sign_out(&self) -> SignOutOutcome {
        let previous = self.state.send_replace(None);
        if previous.is_some() {
            self.publish(SessionEvent::SignedOut);
        }

        let server_error = match previous {
            Some(session) => match self.backend.sign_out(&session.access_token).await {
                Ok(()) => None,
                Err(BlotterError::Auth(AuthError::MissingSession)) => {
                    debug!("[AUTH] Server had no session to sign out of");
                    None
                }
                Err(err) => {
                    warn!("[AUTH] Server-side sign-out failed: {}", err);
                    Some(err.to_string())
                }
            },
            None => None,
        };

        // A refresh may have landed while the server call was in flight.
        if self.state.send_replace(None).is_some() {
            self.publish(SessionEvent::SignedOut);
        }

        SignOutOutcome {
            route: Route::Login,
            server_error,
        }
    }

    /// Install a session refreshed by the auth service
    pub fn token_refreshed(&self, session: Session) {
        let user = session.user.clone();
        self.state.send_replace(Some(session));
        self.publish(SessionEvent::TokenRefreshed(user));
    }

    /// Current session, if any
    pub fn current(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    pub fn user(&self) -> Option<User> {
        self.state.borrow().as_ref().map(|s| s.user.clone())
    }

    /// Current unexpired session
    ///
    /// # Errors
    /// * `AuthError::MissingSession` - nobody is signed in
    /// * `AuthError::Expired` - the access token has run out; see [`SessionManager::active`]
    pub fn require(&self) -> Result<Session> {
        let session = self.current().ok_or(AuthError::MissingSession)?;
        if session.is_expired(Utc::now()) {
            return Err(AuthError::Expired("Session expired".to_string()).into());
        }
        Ok(session)
    }

    /// Current session, refreshed first if its access token has expired
    ///
    /// A refresh rejected by the auth service signs the manager out and
    /// returns `AuthError::Expired`. Transport failures leave the session in
    /// place so a later call can retry.
    pub async fn active(&self) -> Result<Session> {
        match self.require() {
            Err(BlotterError::Auth(AuthError::Expired(_))) => {}
            other => return other,
        }

        let _guard = self.refreshing.lock().await;
        // Another caller may have refreshed while we waited.
        let session = match self.require() {
            Err(BlotterError::Auth(AuthError::Expired(_))) => self.current(),
            other => return other,
        };
        let Some(refresh_token) = session.and_then(|s| s.refresh_token) else {
            self.expire();
            return Err(AuthError::Expired("Session expired".to_string()).into());
        };

        match self.backend.refresh(&refresh_token).await {
            Ok(fresh) => {
                debug!("[AUTH] Refreshed session for {}", fresh.user.email);
                self.token_refreshed(fresh.clone());
                Ok(fresh)
            }
            Err(BlotterError::Auth(err)) => {
                warn!("[AUTH] Session refresh rejected: {}", err);
                self.expire();
                Err(AuthError::Expired(err.to_string()).into())
            }
            Err(err) => Err(err),
        }
    }

    /// Drop the local session without contacting the server
    ///
    /// Used when the server has already rejected the token.
    pub fn expire(&self) {
        if self.state.send_replace(None).is_some() {
            info!("[AUTH] Session expired; signed out locally");
            self.publish(SessionEvent::SignedOut);
        }
    }

    /// Stream of session changes
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Watch the current session; dependents wait on this before fetching
    pub fn watch(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }

    fn publish(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}
