//! Debounced search and pagination over the record store.
//!
//! Text input is promoted to the active search terms only after a quiet
//! period. Every fetch carries a sequence number and only the result of the
//! most recent fetch is applied, so a slow stale response can never replace
//! a newer listing.
//!
//! Filtering happens server-side: the search matches `first_name` or
//! `last_name` case-insensitively and nothing else.

use log::debug;
use serde::Serialize;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};

use crate::auth::Session;
use crate::entry::BlotterEntry;
use crate::error::Result;
use crate::store::{Filter, ListQuery, RecordStore};

/// Entries per page
pub const PAGE_SIZE: usize = 20;

/// Quiet period before typed text becomes the active search
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Columns the search box matches against
pub const SEARCH_COLUMNS: [&str; 2] = ["first_name", "last_name"];

/// Number of pages needed for `total` rows
pub fn total_pages(total: usize, page_size: usize) -> usize {
    if page_size == 0 {
        return 0;
    }
    total.div_ceil(page_size)
}

/// Query for one page of the search results; `page` is 1-based
pub fn search_query(terms: &str, page: usize) -> ListQuery {
    let mut query = ListQuery::default();
    let terms = terms.trim();
    if !terms.is_empty() {
        query = query.filter(Filter::Any(
            SEARCH_COLUMNS
                .iter()
                .map(|col| Filter::ilike(col, terms))
                .collect(),
        ));
    }
    // Pages past the end come back empty; huge page numbers must not overflow.
    let offset = page.saturating_sub(1).saturating_mul(PAGE_SIZE);
    query.range(offset, PAGE_SIZE)
}

/// One page of search results with pagination figures
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListPage {
    pub entries: Vec<BlotterEntry>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

/// Fetch one page of entries matching `terms`
///
/// Out-of-range pages are not rejected; they simply come back empty.
pub async fn fetch_page(
    store: &dyn RecordStore,
    session: &Session,
    terms: &str,
    page: usize,
) -> Result<ListPage> {
    let page = page.max(1);
    let result = store.list(session, &search_query(terms, page)).await?;
    Ok(ListPage {
        total_pages: total_pages(result.total, PAGE_SIZE),
        total: result.total,
        entries: result.entries,
        page,
        page_size: PAGE_SIZE,
    })
}

/// Where the controller is in its input/fetch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    /// No session yet, or nothing fetched
    Idle,
    /// Text changed; waiting for the debounce period to elapse
    SearchPending,
    /// A fetch is in flight
    Fetching,
    /// The latest fetch has resolved
    Settled,
}

/// Snapshot of the list view published by the controller
#[derive(Debug, Clone, PartialEq)]
pub struct ListView {
    pub state: SearchState,
    /// Text as typed
    pub raw_text: String,
    /// Text the current listing was fetched with
    pub active_terms: String,
    pub page: usize,
    pub entries: Vec<BlotterEntry>,
    pub total: usize,
    pub total_pages: usize,
    /// Message of the last failed fetch
    pub error: Option<String>,
}

impl Default for ListView {
    fn default() -> Self {
        ListView {
            state: SearchState::Idle,
            raw_text: String::new(),
            active_terms: String::new(),
            page: 1,
            entries: Vec::new(),
            total: 0,
            total_pages: 0,
            error: None,
        }
    }
}

/// Input events accepted by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCommand {
    TextChanged(String),
    GoToPage(usize),
    Refresh,
}

/// Handle to a running controller
#[derive(Clone)]
pub struct SearchHandle {
    commands: mpsc::UnboundedSender<SearchCommand>,
    view: watch::Receiver<ListView>,
}

impl SearchHandle {
    pub fn set_text(&self, text: impl Into<String>) {
        self.send(SearchCommand::TextChanged(text.into()));
    }

    pub fn go_to_page(&self, page: usize) {
        self.send(SearchCommand::GoToPage(page));
    }

    /// Re-fetch the current page, e.g. after an insert or delete
    pub fn refresh(&self) {
        self.send(SearchCommand::Refresh);
    }

    /// Receiver of every published view
    pub fn view(&self) -> watch::Receiver<ListView> {
        self.view.clone()
    }

    pub fn snapshot(&self) -> ListView {
        self.view.borrow().clone()
    }

    fn send(&self, command: SearchCommand) {
        if self.commands.send(command).is_err() {
            debug!("[SEARCH] Controller stopped; command dropped");
        }
    }
}

struct FetchResult {
    seq: u64,
    result: Result<ListPage>,
}

/// Event loop owning the list view state
pub struct SearchController {
    store: Arc<dyn RecordStore>,
    session: watch::Receiver<Option<Session>>,
    debounce: Duration,
    view: watch::Sender<ListView>,
    results: mpsc::UnboundedSender<FetchResult>,
    latest_seq: u64,
    in_flight: bool,
    deadline: Option<Instant>,
}

impl SearchController {
    /// Start a controller on the current tokio runtime
    ///
    /// The first fetch happens as soon as the session is available. The task
    /// ends when every [`SearchHandle`] is dropped.
    pub fn spawn(
        store: Arc<dyn RecordStore>,
        session: watch::Receiver<Option<Session>>,
        debounce: Duration,
    ) -> SearchHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(ListView::default());

        let controller = SearchController {
            store,
            session,
            debounce,
            view: view_tx,
            results: results_tx,
            latest_seq: 0,
            in_flight: false,
            deadline: None,
        };
        tokio::spawn(controller.run(commands_rx, results_rx));

        SearchHandle {
            commands: commands_tx,
            view: view_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SearchCommand>,
        mut results: mpsc::UnboundedReceiver<FetchResult>,
    ) {
        let mut session_open = true;
        self.session.mark_changed();

        loop {
            let deadline = self.deadline;
            let debounce = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                _ = debounce => self.on_debounce_elapsed(),
                changed = self.session.changed(), if session_open => match changed {
                    Ok(()) => self.on_session_changed(),
                    Err(_) => session_open = false,
                },
                Some(done) = results.recv() => self.on_fetch_done(done),
            }
        }
        debug!("[SEARCH] Controller stopped");
    }

    fn on_command(&mut self, command: SearchCommand) {
        match command {
            SearchCommand::TextChanged(text) => {
                self.deadline = Some(Instant::now() + self.debounce);
                self.view.send_modify(|v| {
                    v.raw_text = text;
                    v.state = SearchState::SearchPending;
                });
            }
            SearchCommand::GoToPage(page) => {
                if self.view.borrow().page != page {
                    self.fetch_with(|v| v.page = page);
                }
            }
            SearchCommand::Refresh => self.fetch_with(|_| {}),
        }
    }

    fn on_debounce_elapsed(&mut self) {
        self.deadline = None;
        let (raw, active) = {
            let v = self.view.borrow();
            (v.raw_text.clone(), v.active_terms.clone())
        };

        if raw != active {
            self.fetch_with(|v| {
                v.active_terms = raw;
                v.page = 1;
            });
        } else {
            let state = self.resting_state();
            self.view.send_modify(|v| v.state = state);
        }
    }

    fn on_session_changed(&mut self) {
        let present = self.session.borrow_and_update().is_some();
        if present {
            self.fetch_with(|_| {});
        } else {
            // Results of the old session must not land after sign-out.
            if self.in_flight {
                self.latest_seq += 1;
                self.in_flight = false;
            }
            self.view.send_modify(|v| {
                v.entries.clear();
                v.total = 0;
                v.total_pages = 0;
                v.state = SearchState::Idle;
            });
        }
    }

    fn on_fetch_done(&mut self, done: FetchResult) {
        if done.seq != self.latest_seq {
            debug!(
                "[SEARCH] Discarding stale result seq={} latest={}",
                done.seq, self.latest_seq
            );
            return;
        }
        self.in_flight = false;
        let state = self.resting_state();

        self.view.send_modify(|v| {
            v.state = state;
            match done.result {
                Ok(page) => {
                    v.entries = page.entries;
                    v.total = page.total;
                    v.total_pages = page.total_pages;
                    v.error = None;
                }
                Err(err) => v.error = Some(err.to_string()),
            }
        });
    }

    /// Apply `prepare` to the view and fetch the page it describes
    ///
    /// Both land in a single view update so observers never see the new
    /// page or terms paired with the previous state.
    fn fetch_with(&mut self, prepare: impl FnOnce(&mut ListView)) {
        let session = self.session.borrow().clone();
        let Some(session) = session else {
            debug!("[SEARCH] No session; fetch deferred");
            self.view.send_modify(|v| {
                prepare(v);
                v.state = SearchState::Idle;
            });
            return;
        };

        self.latest_seq += 1;
        self.in_flight = true;
        let seq = self.latest_seq;
        let state = self.resting_state();
        self.view.send_modify(|v| {
            prepare(v);
            v.state = state;
        });
        let (terms, page) = {
            let v = self.view.borrow();
            (v.active_terms.clone(), v.page)
        };

        debug!("[SEARCH] Fetch seq={} terms={:?} page={}", seq, terms, page);
        let store = self.store.clone();
        let results = self.results.clone();
        tokio::spawn(async move {
            let result = fetch_page(store.as_ref(), &session, &terms, page).await;
            // The controller may have stopped.
            let _ = results.send(FetchResult { seq, result });
        });
    }

    fn resting_state(&self) -> SearchState {
        if self.deadline.is_some() {
            SearchState::SearchPending
        } else if self.in_flight {
            SearchState::Fetching
        } else if self.latest_seq == 0 || self.session.borrow().is_none() {
            SearchState::Idle
        } else {
            SearchState::Settled
        }
    }
}
