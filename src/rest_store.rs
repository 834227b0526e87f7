//! Record store backed by the hosted REST table API.
//!
//! Queries map onto PostgREST conventions: `col=op.value` predicates,
//! `or=(...)` disjunctions, `order=date.desc`, `offset`/`limit`, and the
//! total count from the `Content-Range` header when `Prefer: count=exact` is
//! sent.

use async_trait::async_trait;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use serde::Deserialize;
use std::time::Instant;

use crate::auth::Session;
use crate::config::StoreConfig;
use crate::entry::{BlotterEntry, EntryId, EntryUpdate, NewEntry};
use crate::error::{AuthError, BlotterError, Result};
use crate::store::{Filter, ListQuery, Page, RecordStore};

lazy_static! {
    static ref CONTENT_RANGE_REGEX: Regex =
        Regex::new(r"^(?:\d+-\d+|\*)/(\d+|\*)$").expect("valid content-range pattern");
}

/// Error body returned by the table API
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// HTTP client for the blotter table
#[derive(Clone)]
pub struct RestStore {
    table_url: String,
    api_key: String,
    http_client: reqwest::Client,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: &StoreConfig, http_client: reqwest::Client) -> Self {
        RestStore {
            table_url: format!("{}/rest/v1/{}", config.url, config.table),
            api_key: config.api_key.clone(),
            http_client,
        }
    }

    fn request(&self, method: reqwest::Method, session: &Session) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, &self.table_url)
            .header("apikey", &self.api_key)
            .bearer_auth(&session.access_token)
    }

    /// Turn a non-success response into an error, otherwise pass it through
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let message = body
            .message
            .or(body.details)
            .unwrap_or_else(|| if text.is_empty() { status.to_string() } else { text });
        warn!("[STORE] Request failed: status={} message=\"{}\"", status, message);

        match status.as_u16() {
            401 | 403 => Err(AuthError::Expired(message).into()),
            code => Err(BlotterError::Transport {
                status: Some(code),
                message,
            }),
        }
    }

    async fn single_row(response: reqwest::Response, id: EntryId) -> Result<BlotterEntry> {
        let rows: Vec<BlotterEntry> = Self::check(response).await?.json().await?;
        rows.into_iter().next().ok_or(BlotterError::NotFound(id))
    }
}

/// Render a query as URL parameters
pub fn query_params(query: &ListQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];

    for filter in &query.filters {
        match filter {
            Filter::Any(inner) => {
                let parts: Vec<String> = inner.iter().map(nested_predicate).collect();
                params.push(("or".to_string(), format!("({})", parts.join(","))));
            }
            Filter::Eq(col, _) | Filter::Neq(col, _) | Filter::ILike(col, _) => {
                params.push((col.clone(), predicate_value(filter)));
            }
        }
    }

    if !query.order.is_empty() {
        let order: Vec<String> = query
            .order
            .iter()
            .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
            .collect();
        params.push(("order".to_string(), order.join(",")));
    }

    if let Some(range) = query.range {
        params.push(("offset".to_string(), range.offset.to_string()));
        params.push(("limit".to_string(), range.limit.to_string()));
    }

    params
}

// `op.value` part of a top-level predicate
fn predicate_value(filter: &Filter) -> String {
    match filter {
        Filter::Eq(_, v) => format!("eq.{}", v),
        Filter::Neq(_, v) => format!("neq.{}", v),
        Filter::ILike(_, v) => {
            let (op, pattern) = substring_pattern(v);
            format!("{}.{}", op, pattern)
        }
        Filter::Any(inner) => {
            let parts: Vec<String> = inner.iter().map(nested_predicate).collect();
            format!("({})", parts.join(","))
        }
    }
}

// `col.op.value` inside an `or=(...)` list; values are quoted so commas and
// parentheses in user input do not split the list
fn nested_predicate(filter: &Filter) -> String {
    match filter {
        Filter::Eq(c, v) => format!("{}.eq.{}", c, quote(v)),
        Filter::Neq(c, v) => format!("{}.neq.{}", c, quote(v)),
        Filter::ILike(c, v) => {
            let (op, pattern) = substring_pattern(v);
            format!("{}.{}.{}", c, op, quote(&pattern))
        }
        Filter::Any(inner) => {
            let parts: Vec<String> = inner.iter().map(nested_predicate).collect();
            format!("or({})", parts.join(","))
        }
    }
}

// Case-insensitive substring match on `value` taken literally. The server
// reads `*` in a like pattern as `%`, so needles containing one go through
// the regex operator instead.
fn substring_pattern(value: &str) -> (&'static str, String) {
    if value.contains('*') {
        ("imatch", regex::escape(value))
    } else {
        ("ilike", format!("*{}*", escape_like(value)))
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Total row count from a `Content-Range` header such as `0-19/45`
pub fn parse_content_range(header: &str) -> Option<usize> {
    let captures = CONTENT_RANGE_REGEX.captures(header.trim())?;
    captures.get(1)?.as_str().parse().ok()
}

#[async_trait]
impl RecordStore for RestStore {
    async fn list(&self, session: &Session, query: &ListQuery) -> Result<Page> {
        let params = query_params(query);
        debug!("[STORE] GET {} params={:?}", self.table_url, params);
        let start = Instant::now();

        let response = self
            .request(reqwest::Method::GET, session)
            .header("Prefer", "count=exact")
            .query(&params)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let total = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let entries: Vec<BlotterEntry> = response.json().await?;
        debug!(
            "[STORE] Listed {} entries in {:?}",
            entries.len(),
            start.elapsed()
        );

        Ok(Page {
            total: total.unwrap_or(entries.len()),
            entries,
        })
    }

    async fn get(&self, session: &Session, id: EntryId) -> Result<BlotterEntry> {
        let response = self
            .request(reqwest::Method::GET, session)
            .query(&[("select", "*".to_string()), ("id", format!("eq.{}", id))])
            .send()
            .await?;
        Self::single_row(response, id).await
    }

    async fn insert(&self, session: &Session, entries: Vec<NewEntry>) -> Result<Vec<BlotterEntry>> {
        debug!("[STORE] Inserting {} entries", entries.len());
        let response = self
            .request(reqwest::Method::POST, session)
            .header("Prefer", "return=representation")
            .json(&entries)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn update(
        &self,
        session: &Session,
        id: EntryId,
        update: &EntryUpdate,
    ) -> Result<BlotterEntry> {
        let response = self
            .request(reqwest::Method::PATCH, session)
            .header("Prefer", "return=representation")
            .query(&[("id", format!("eq.{}", id))])
            .json(update)
            .send()
            .await?;
        Self::single_row(response, id).await
    }

    async fn delete(&self, session: &Session, id: EntryId) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, session)
            .header("Prefer", "return=representation")
            .query(&[("id", format!("eq.{}", id))])
            .send()
            .await?;
        Self::single_row(response, id).await.map(|_| ())
    }

    async fn delete_all(&self, session: &Session) -> Result<()> {
        // Unfiltered deletes are refused by the table API.
        let response = self
            .request(reqwest::Method::DELETE, session)
            .query(&[("id", "neq.0")])
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }
}
