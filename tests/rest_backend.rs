#![cfg(feature = "web")]

//! REST clients against a local stand-in for the hosted API.

use axum::Router;
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::net::TcpListener;

use blotter::auth::{AuthBackend, RestAuth, Session, User};
use blotter::config::StoreConfig;
use blotter::entry::EntryUpdate;
use blotter::error::{AuthError, BlotterError};
use blotter::rest_store::RestStore;
use blotter::store::{ListQuery, RecordStore};

const TABLE_PATH: &str = "/rest/v1/blotter";

/// Serve `app` on an ephemeral port and return its base URL
async fn serve(app: Router) -> StoreConfig {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    StoreConfig {
        url: format!("http://{}", addr),
        api_key: "anon".into(),
        table: "blotter".into(),
    }
}

async fn store_for(app: Router) -> RestStore {
    RestStore::with_client(&serve(app).await, reqwest::Client::new())
}

async fn auth_for(app: Router) -> RestAuth {
    RestAuth::with_client(&serve(app).await, reqwest::Client::new())
}

fn session() -> Session {
    Session {
        user: User {
            id: "u1".into(),
            email: "officer@example.com".into(),
        },
        access_token: "token".into(),
        refresh_token: None,
        expires_at: None,
    }
}

fn row(id: i64, first_name: &str) -> Value {
    json!({
        "id": id,
        "first_name": first_name,
        "last_name": "Smith",
        "case_type": "Theft",
        "date": "2024-01-01",
        "blotter_entry": "Bicycle reported stolen",
        "created_at": "2024-01-02T00:00:00Z"
    })
}

fn token_body(access: &str) -> Value {
    json!({
        "access_token": access,
        "refresh_token": format!("{}-refresh", access),
        "expires_in": 3600,
        "user": {"id": "u1", "email": "officer@example.com"}
    })
}

#[tokio::test]
async fn list_reads_total_from_content_range() {
    let app = Router::new().route(
        TABLE_PATH,
        get(|headers: HeaderMap, Query(params): Query<HashMap<String, String>>| async move {
            let counted = headers
                .get("prefer")
                .is_some_and(|v| v == "count=exact");
            let ranged = params.get("offset").map(String::as_str) == Some("20")
                && params.get("limit").map(String::as_str) == Some("2");
            let authorized = headers
                .get(header::AUTHORIZATION)
                .is_some_and(|v| v == "Bearer token")
                && headers.get("apikey").is_some_and(|v| v == "anon");
            if !(counted && ranged && authorized) {
                return (StatusCode::BAD_REQUEST, Json(json!({"message": "bad request"})))
                    .into_response();
            }
            (
                [(header::CONTENT_RANGE, "20-21/45")],
                Json(json!([row(1, "John"), row(2, "Jane")])),
            )
                .into_response()
        }),
    );
    let store = store_for(app).await;

    let page = store
        .list(&session(), &ListQuery::default().range(20, 2))
        .await
        .unwrap();
    assert_eq!(page.total, 45);
    assert_eq!(page.entries.len(), 2);
    assert_eq!(page.entries[1].first_name, "Jane");
}

#[tokio::test]
async fn list_without_content_range_counts_the_rows() {
    let app = Router::new().route(TABLE_PATH, get(|| async { Json(json!([row(1, "John")])) }));
    let store = store_for(app).await;

    let page = store.list(&session(), &ListQuery::default()).await.unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn rejected_token_is_an_auth_error() {
    for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
        let app = Router::new().route(
            TABLE_PATH,
            get(move || async move { (status, Json(json!({"message": "JWT expired"}))) }),
        );
        let store = store_for(app).await;

        let err = store.list(&session(), &ListQuery::default()).await.unwrap_err();
        match err {
            BlotterError::Auth(AuthError::Expired(message)) => assert_eq!(message, "JWT expired"),
            other => panic!("unexpected error for {}: {:?}", status, other),
        }
    }
}

#[tokio::test]
async fn server_failure_keeps_status_and_message() {
    let app = Router::new().route(
        TABLE_PATH,
        get(|| async {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"details": "db down"})),
            )
        }),
    );
    let store = store_for(app).await;

    match store.get(&session(), 7).await.unwrap_err() {
        BlotterError::Transport { status, message } => {
            assert_eq!(status, Some(503));
            assert_eq!(message, "db down");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn plain_text_failure_body_becomes_the_message() {
    let app = Router::new().route(
        TABLE_PATH,
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded") }),
    );
    let store = store_for(app).await;

    match store.list(&session(), &ListQuery::default()).await.unwrap_err() {
        BlotterError::Transport { status, message } => {
            assert_eq!(status, Some(500));
            assert_eq!(message, "upstream exploded");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn empty_representation_is_not_found() {
    let empty = || async { Json(json!([])) };
    let app = Router::new().route(TABLE_PATH, get(empty).patch(empty).delete(empty));
    let store = store_for(app).await;
    let update = EntryUpdate {
        case_type: Some("Assault".into()),
        ..Default::default()
    };

    assert!(matches!(
        store.get(&session(), 7).await,
        Err(BlotterError::NotFound(7))
    ));
    assert!(matches!(
        store.update(&session(), 7, &update).await,
        Err(BlotterError::NotFound(7))
    ));
    assert!(matches!(
        store.delete(&session(), 7).await,
        Err(BlotterError::NotFound(7))
    ));
}

#[tokio::test]
async fn update_returns_the_stored_row() {
    let app = Router::new().route(
        TABLE_PATH,
        axum::routing::patch(|Json(body): Json<Value>| async move {
            let mut stored = row(7, "John");
            stored["case_type"] = body["case_type"].clone();
            Json(json!([stored]))
        }),
    );
    let store = store_for(app).await;
    let update = EntryUpdate {
        case_type: Some("Assault".into()),
        ..Default::default()
    };

    let entry = store.update(&session(), 7, &update).await.unwrap();
    assert_eq!(entry.id, 7);
    assert_eq!(entry.case_type, "Assault");
}

#[tokio::test]
async fn password_sign_in_returns_a_session() {
    let app = Router::new().route(
        "/auth/v1/token",
        post(|Query(params): Query<HashMap<String, String>>, Json(body): Json<Value>| async move {
            if params.get("grant_type").map(String::as_str) != Some("password")
                || body["password"] != "secret"
            {
                return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"})))
                    .into_response();
            }
            Json(token_body("access-1")).into_response()
        }),
    );
    let auth = auth_for(app).await;

    let session = auth
        .sign_in_with_password("officer@example.com", "secret")
        .await
        .unwrap();
    assert_eq!(session.access_token, "access-1");
    assert_eq!(session.refresh_token.as_deref(), Some("access-1-refresh"));
    assert_eq!(session.user.email, "officer@example.com");
    assert!(session.expires_at.is_some());
}

#[tokio::test]
async fn invalid_grant_is_invalid_credentials() {
    let app = Router::new().route(
        "/auth/v1/token",
        post(|| async {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_grant",
                    "error_description": "Invalid login credentials"
                })),
            )
        }),
    );
    let auth = auth_for(app).await;

    let err = auth
        .sign_in_with_password("officer@example.com", "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, BlotterError::Auth(AuthError::InvalidCredentials)));
}

#[tokio::test]
async fn refresh_exchanges_the_refresh_token() {
    let app = Router::new().route(
        "/auth/v1/token",
        post(|Query(params): Query<HashMap<String, String>>, Json(body): Json<Value>| async move {
            let refresh = params.get("grant_type").map(String::as_str) == Some("refresh_token");
            if refresh && body["refresh_token"] == "good-refresh" {
                Json(token_body("access-2")).into_response()
            } else {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error_code": "refresh_token_not_found", "msg": "Invalid Refresh Token"})),
                )
                    .into_response()
            }
        }),
    );
    let auth = auth_for(app).await;

    let session = auth.refresh("good-refresh").await.unwrap();
    assert_eq!(session.access_token, "access-2");

    match auth.refresh("stale-refresh").await.unwrap_err() {
        BlotterError::Auth(AuthError::Expired(message)) => {
            assert_eq!(message, "Invalid Refresh Token")
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn sign_out_without_server_session_is_missing_session() {
    for status in [StatusCode::UNAUTHORIZED, StatusCode::NOT_FOUND] {
        let app = Router::new().route(
            "/auth/v1/logout",
            post(move || async move { (status, Json(json!({"msg": "Session not found"}))) }),
        );
        let auth = auth_for(app).await;

        let err = auth.sign_out("token").await.unwrap_err();
        assert!(
            matches!(err, BlotterError::Auth(AuthError::MissingSession)),
            "unexpected error for {}: {:?}",
            status,
            err
        );
    }
}

#[tokio::test]
async fn sign_out_server_failure_is_transport() {
    let app = Router::new().route(
        "/auth/v1/logout",
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"msg": "logout broke"})),
            )
        }),
    );
    let auth = auth_for(app).await;

    match auth.sign_out("token").await.unwrap_err() {
        BlotterError::Transport { status, message } => {
            assert_eq!(status, Some(500));
            assert_eq!(message, "logout broke");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    let app = Router::new().route("/auth/v1/logout", post(|| async { StatusCode::NO_CONTENT }));
    assert!(auth_for(app).await.sign_out("token").await.is_ok());
}
