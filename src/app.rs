//! HTTP surface of the blotter.
//!
//! Browser sessions are identified by a `session` cookie holding an opaque
//! id. Each id maps to its own [`SessionManager`] in the injected
//! [`SessionRegistry`]. Everything under `/api` requires a signed-in
//! session; other paths fall through to the front-end assets.

use axum::{
    Extension, Form, Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::auth::{AuthBackend, MemoryAuth, RestAuth, Session, User};
use crate::config::Config;
use crate::entry::{BlotterEntry, EntryId, EntryUpdate, NewEntry};
use crate::error::{AuthError, BlotterError};
use crate::export::{ExportFormat, fetch_all, to_csv, to_xlsx};
use crate::import::import_file;
use crate::memory_store::MemoryStore;
use crate::rest_store::RestStore;
use crate::search::{ListPage, fetch_page};
use crate::session::{Route, SessionManager, SignOutOutcome};
use crate::store::RecordStore;

const SESSION_COOKIE: &str = "session";
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
/// Sessions left idle this long past their token expiry are evicted
const STALE_AFTER_EXPIRY_HOURS: i64 = 12;

const LOGIN_PAGE: &str = r#"<!doctype html>
<html>
<head><title>Blotter - Sign in</title></head>
<body>
  <form method="post" action="/login">
    <input type="email" name="email" placeholder="Email" required>
    <input type="password" name="password" placeholder="Password" required>
    <button type="submit">Sign in</button>
  </form>
</body>
</html>
"#;

/// Sign-in form data
#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Generic status body, used for errors and acknowledgements
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResponse {
    fn ok() -> Self {
        StatusResponse {
            status: "ok".to_string(),
            message: None,
        }
    }
}

/// Body returned after an import
#[derive(Debug, Serialize, Deserialize)]
pub struct ImportResponse {
    pub status: String,
    pub imported: usize,
    /// Path the client should navigate to
    pub redirect: String,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    search: String,
    page: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ExportParams {
    format: Option<String>,
}

impl IntoResponse for BlotterError {
    fn into_response(self) -> Response {
        let status = match &self {
            BlotterError::Auth(_) => StatusCode::UNAUTHORIZED,
            BlotterError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BlotterError::Parse(_) => StatusCode::BAD_REQUEST,
            BlotterError::NotFound(_) => StatusCode::NOT_FOUND,
            BlotterError::Transport { .. } => StatusCode::BAD_GATEWAY,
        };
        let body = StatusResponse {
            status: "error".to_string(),
            message: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

/// Per-browser session managers keyed by cookie id
pub struct SessionRegistry {
    backend: Arc<dyn AuthBackend>,
    sessions: RwLock<HashMap<String, Arc<SessionManager>>>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        SessionRegistry {
            backend,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Sign in and register the new session
    ///
    /// # Returns
    /// * `Ok((cookie_id, route))` on success
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(String, Route), BlotterError> {
        let manager = Arc::new(SessionManager::new(self.backend.clone()));
        let route = manager.sign_in(email, password).await?;

        self.sweep(Utc::now());
        let id = Uuid::new_v4().to_string();
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), manager);
        Ok((id, route))
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionManager>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Live session behind a cookie id
    ///
    /// Expired tokens are refreshed. A session the auth service no longer
    /// accepts is evicted and reported as an `AuthError`.
    pub async fn require(&self, id: Option<&str>) -> Result<Session, BlotterError> {
        let id = id.ok_or(AuthError::MissingSession)?;
        let manager = self.get(id).ok_or(AuthError::MissingSession)?;

        match manager.active().await {
            Err(BlotterError::Auth(err)) => {
                self.evict(id);
                Err(err.into())
            }
            other => other,
        }
    }

    /// Drop a session the server has rejected, without a server round trip
    pub fn evict(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match removed {
            Some(manager) => {
                manager.expire();
                true
            }
            None => false,
        }
    }

    /// Evict signed-out sessions and those expired longer than the idle limit
    ///
    /// # Returns
    /// * The number of sessions removed
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::hours(STALE_AFTER_EXPIRY_HOURS);
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, manager| {
            manager
                .current()
                .is_some_and(|s| s.expires_at.is_none_or(|at| at > cutoff))
        });

        let removed = before - sessions.len();
        if removed > 0 {
            debug!("[AUTH] Evicted {} stale sessions", removed);
        }
        removed
    }

    /// Forget the cookie id and sign its manager out
    pub async fn sign_out(&self, id: Option<&str>) -> SignOutOutcome {
        let manager = id.and_then(|id| {
            self.sessions
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id)
        });

        match manager {
            Some(manager) => manager.sign_out().await,
            None => SignOutOutcome {
                route: Route::Login,
                server_error: None,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<dyn RecordStore>,
}

impl AppState {
    pub fn new(auth: Arc<dyn AuthBackend>, store: Arc<dyn RecordStore>) -> Self {
        AppState {
            registry: Arc::new(SessionRegistry::new(auth)),
            store,
        }
    }

    /// Backends selected by the configuration
    pub fn from_config(config: &Config) -> Self {
        match &config.store {
            Some(store) => {
                info!("[STORE] Using remote store at {}", store.url);
                AppState::new(Arc::new(RestAuth::new(store)), Arc::new(RestStore::new(store)))
            }
            None => {
                warn!(
                    "[STORE] BLOTTER_STORE_URL not set; running in demo mode with in-memory data (login {})",
                    config.demo_email
                );
                let auth = MemoryAuth::new([(config.demo_email.clone(), config.demo_password.clone())]);
                AppState::new(Arc::new(auth), Arc::new(MemoryStore::new()))
            }
        }
    }
}

/// Build the router; non-API paths fall back to `static_dir`
pub fn router(state: AppState, static_dir: &str) -> Router {
    let api = Router::new()
        .route("/session", get(session_info))
        .route(
            "/entries",
            get(list_entries).post(create_entry).delete(delete_all_entries),
        )
        .route(
            "/entries/:id",
            get(get_entry).put(update_entry).delete(delete_entry),
        )
        .route(
            "/import",
            post(import_entries).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/export", get(export_entries))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/", get(landing))
        .route("/login", get(serve_login_page).post(handle_login))
        .route("/logout", post(handle_logout))
        .nest("/api", api)
        .fallback_service(ServeDir::new(static_dir))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Serve the blotter until the process is stopped
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::from_config(&config);
    let app = router(state, &config.static_dir);

    let listener = TcpListener::bind(&config.bind).await?;
    info!("Listening on http://{}", config.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

fn cookie_id(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE).map(|c| c.value().to_string())
}

/// Request logging middleware
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;
    debug!(
        "{} {} -> {} in {:?}",
        method,
        path,
        response.status().as_u16(),
        started.elapsed()
    );
    response
}

/// Authentication middleware
///
/// Puts the caller's [`Session`] into the request extensions, or answers
/// 401 when there is none.
async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let id = cookie_id(&jar);
    match state.registry.require(id.as_deref()).await {
        Ok(session) => {
            request.extensions_mut().insert(session);
            let response = next.run(request).await;
            // The store refused the token; the next visit goes through login.
            if response.status() == StatusCode::UNAUTHORIZED {
                if let Some(id) = &id {
                    state.registry.evict(id);
                }
            }
            response
        }
        Err(err) => err.into_response(),
    }
}

async fn landing(State(state): State<AppState>, jar: CookieJar) -> Redirect {
    match state.registry.require(cookie_id(&jar).as_deref()).await {
        Ok(_) => Redirect::to(&Route::List.path()),
        Err(_) => Redirect::to(&Route::Login.path()),
    }
}

async fn serve_login_page() -> Html<&'static str> {
    Html(LOGIN_PAGE)
}

/// Handle sign-in form submissions
async fn handle_login(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(credentials): Form<Credentials>,
) -> Result<(CookieJar, Redirect), BlotterError> {
    let (id, route) = state
        .registry
        .sign_in(&credentials.email, &credentials.password)
        .await?;

    // A stale cookie from an earlier sign-in is replaced.
    if let Some(old) = cookie_id(&jar) {
        state.registry.sign_out(Some(old.as_str())).await;
    }

    let cookie = Cookie::build((SESSION_COOKIE, id))
        .path("/")
        .http_only(true)
        .build();
    Ok((jar.add(cookie), Redirect::to(&route.path())))
}

/// Handle sign-out; always ends on the login page
async fn handle_logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Redirect) {
    let outcome = state.registry.sign_out(cookie_id(&jar).as_deref()).await;
    if let Some(err) = &outcome.server_error {
        warn!("[AUTH] Signed out locally; server reported: {}", err);
    }

    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    (jar, Redirect::to(&outcome.route.path()))
}

async fn session_info(Extension(session): Extension<Session>) -> Json<User> {
    Json(session.user)
}

async fn list_entries(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListPage>, BlotterError> {
    let page = fetch_page(
        state.store.as_ref(),
        &session,
        &params.search,
        params.page.unwrap_or(1),
    )
    .await?;
    Ok(Json(page))
}

async fn get_entry(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<EntryId>,
) -> Result<Json<BlotterEntry>, BlotterError> {
    Ok(Json(state.store.get(&session, id).await?))
}

async fn create_entry(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(entry): Json<NewEntry>,
) -> Result<(StatusCode, Json<BlotterEntry>), BlotterError> {
    entry.validate()?;
    let created = state
        .store
        .insert(&session, vec![entry])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| BlotterError::transport("Insert returned no row"))?;
    info!("[STORE] Created entry {}", created.id);
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_entry(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<EntryId>,
    Json(update): Json<EntryUpdate>,
) -> Result<Json<BlotterEntry>, BlotterError> {
    update.validate()?;

    if update.is_empty() {
        return Ok(Json(state.store.get(&session, id).await?));
    }
    Ok(Json(state.store.update(&session, id, &update).await?))
}

async fn delete_entry(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<EntryId>,
) -> Result<Json<StatusResponse>, BlotterError> {
    state.store.delete(&session, id).await?;
    info!("[STORE] Deleted entry {}", id);
    Ok(Json(StatusResponse::ok()))
}

async fn delete_all_entries(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<StatusResponse>, BlotterError> {
    state.store.delete_all(&session).await?;
    warn!("[STORE] All entries deleted by {}", session.user.email);
    Ok(Json(StatusResponse::ok()))
}

/// Import an uploaded spreadsheet from the multipart field `file`
async fn import_entries(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    mut multipart: Multipart,
) -> Result<Json<ImportResponse>, BlotterError> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| BlotterError::parse(e.to_string()))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or_default().to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| BlotterError::parse(e.to_string()))?;
            upload = Some((filename, bytes.to_vec()));
        }
    }

    let (filename, bytes) = upload
        .filter(|(_, bytes)| !bytes.is_empty())
        .ok_or_else(|| BlotterError::parse("No file data received"))?;

    let report = import_file(state.store.as_ref(), &session, &filename, &bytes).await?;
    Ok(Json(ImportResponse {
        status: "ok".to_string(),
        imported: report.imported,
        redirect: report.route.path(),
    }))
}

/// Download every entry as CSV (default) or XLSX
async fn export_entries(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Query(params): Query<ExportParams>,
) -> Result<Response, BlotterError> {
    let format = match params.format.as_deref() {
        None => ExportFormat::Csv,
        Some(name) => ExportFormat::parse(name)
            .ok_or_else(|| BlotterError::parse(format!("Unsupported export format: {}", name)))?,
    };

    let entries = fetch_all(state.store.as_ref(), &session).await?;
    let body = match format {
        ExportFormat::Csv => to_csv(&entries).into_bytes(),
        ExportFormat::Xlsx => to_xlsx(&entries)?,
    };

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", format.file_name()),
            ),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMAIL: &str = "officer@example.com";
    const PASSWORD: &str = "secret";

    fn registry_with(auth: MemoryAuth) -> (SessionRegistry, Arc<MemoryAuth>) {
        let auth = Arc::new(auth);
        (SessionRegistry::new(auth.clone()), auth)
    }

    fn access_token(registry: &SessionRegistry, id: &str) -> String {
        registry.get(id).unwrap().current().unwrap().access_token
    }

    #[tokio::test]
    async fn sweep_drops_sessions_long_past_expiry() {
        let (registry, _) = registry_with(MemoryAuth::new([(EMAIL, PASSWORD)]));
        registry.sign_in(EMAIL, PASSWORD).await.unwrap();
        registry.sign_in(EMAIL, PASSWORD).await.unwrap();
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.sweep(Utc::now()), 0);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.sweep(Utc::now() + Duration::hours(14)), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn sign_in_sweeps_stale_sessions() {
        let auth = MemoryAuth::new([(EMAIL, PASSWORD)])
            .with_token_lifetime(Duration::hours(-13));
        let (registry, _) = registry_with(auth);

        registry.sign_in(EMAIL, PASSWORD).await.unwrap();
        registry.sign_in(EMAIL, PASSWORD).await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_evicts_the_session() {
        let auth = MemoryAuth::new([(EMAIL, PASSWORD)]).with_token_lifetime(Duration::seconds(-1));
        let (registry, auth) = registry_with(auth);
        let (id, _) = registry.sign_in(EMAIL, PASSWORD).await.unwrap();
        auth.revoke(&access_token(&registry, &id));

        let err = registry.require(Some(&id)).await.unwrap_err();
        assert!(matches!(err, BlotterError::Auth(AuthError::Expired(_))));
        assert!(registry.is_empty());

        let err = registry.require(Some(&id)).await.unwrap_err();
        assert!(matches!(err, BlotterError::Auth(AuthError::MissingSession)));
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_in_place() {
        let auth = MemoryAuth::new([(EMAIL, PASSWORD)]).with_token_lifetime(Duration::seconds(-1));
        let (registry, _) = registry_with(auth);
        let (id, _) = registry.sign_in(EMAIL, PASSWORD).await.unwrap();
        let before = access_token(&registry, &id);

        let session = registry.require(Some(&id)).await.unwrap();
        assert_ne!(session.access_token, before);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn evict_signs_the_manager_out() {
        let (registry, _) = registry_with(MemoryAuth::new([(EMAIL, PASSWORD)]));
        let (id, _) = registry.sign_in(EMAIL, PASSWORD).await.unwrap();
        let manager = registry.get(&id).unwrap();

        assert!(registry.evict(&id));
        assert!(!registry.evict(&id));
        assert!(manager.current().is_none());
        assert!(registry.is_empty());
    }
}
