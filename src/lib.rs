/*!
# Blotter

A thin client for recording police blotter incidents, built in Rust.

## Overview

Each blotter entry records the person involved, the case type, the incident
date and a free-text narrative. Entries live in a hosted row store behind a
REST API; the hosted auth service issues the access tokens every store call
carries. The crate adds no persistence of its own: it validates, searches,
paginates, imports and exports.

## Architecture

### Session Layer
- **session**: `SessionManager` restores, signs in, signs out (always ending
  on the login route) and publishes changes over `tokio::sync::watch` and
  `broadcast` channels
- **auth**: `AuthBackend` trait with the REST client (`RestAuth`) and an
  in-process backend (`MemoryAuth`)

### Data Layer
- **store**: `RecordStore` trait with filter, order and range queries
- **rest_store**: REST implementation (`or=(...)` filters, `Content-Range` totals)
- **memory_store**: in-process implementation for demo mode and tests
- **entry**: the record types and required-field validation

### Features
- **search**: debounced name search with 20-row pages; stale responses are
  discarded by sequence number
- **import**: CSV and XLSX uploads with spreadsheet serial date conversion
  and all-or-nothing required-column checks
- **export**: CSV and XLSX downloads of the whole blotter

### Web Layer (feature `web`)
- **app**: axum router, cookie sessions, the `require_auth` middleware and
  JSON handlers under `/api`

## Configuration

`BLOTTER_STORE_URL`, `BLOTTER_STORE_KEY`, `BLOTTER_TABLE`, `BLOTTER_BIND`,
`BLOTTER_STATIC_DIR`, `BLOTTER_DEMO_EMAIL` and `BLOTTER_DEMO_PASSWORD`.
Without a store URL the server runs in demo mode on in-memory data.

## REST API Endpoints

- `POST /login`, `POST /logout` - Sign in and out
- `GET /api/session` - Current user
- `GET /api/entries?search=&page=` - Search and paginate
- `POST /api/entries`, `DELETE /api/entries` - Create one, delete all
- `GET|PUT|DELETE /api/entries/{id}` - Single entry
- `POST /api/import` - Multipart spreadsheet upload
- `GET /api/export?format=csv|xlsx` - Download
*/

pub mod auth;
pub mod config;
pub mod entry;
pub mod error;
pub mod export;
pub mod import;
pub mod memory_store;
pub mod rest_store;
pub mod search;
pub mod session;
pub mod store;

#[cfg(feature = "web")]
pub mod app;

pub use auth::{AuthBackend, MemoryAuth, RestAuth, Session, User};
pub use config::{Config, StoreConfig};
pub use entry::{BlotterEntry, EntryId, EntryUpdate, NewEntry};
pub use error::{AuthError, BlotterError, Result, ValidationError};
pub use memory_store::MemoryStore;
pub use rest_store::RestStore;
pub use session::{Route, SessionManager};
pub use store::{ListQuery, Page, RecordStore};
