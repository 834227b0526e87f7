//! Record store contract and the query vocabulary it understands.

use async_trait::async_trait;

use crate::auth::Session;
use crate::entry::{BlotterEntry, EntryId, EntryUpdate, NewEntry};
use crate::error::Result;

/// Row predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Column equals value
    Eq(String, String),
    /// Column differs from value
    Neq(String, String),
    /// Case-insensitive substring match
    ILike(String, String),
    /// Any of the nested predicates holds
    Any(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<String>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn neq(column: &str, value: impl Into<String>) -> Self {
        Filter::Neq(column.to_string(), value.into())
    }

    pub fn ilike(column: &str, value: impl Into<String>) -> Self {
        Filter::ILike(column.to_string(), value.into())
    }

    /// Evaluate the predicate against an entry
    pub fn matches(&self, entry: &BlotterEntry) -> bool {
        match self {
            Filter::Eq(col, value) => column_value(entry, col).is_some_and(|v| v == *value),
            Filter::Neq(col, value) => column_value(entry, col).is_some_and(|v| v != *value),
            Filter::ILike(col, needle) => column_value(entry, col)
                .is_some_and(|v| v.to_lowercase().contains(&needle.to_lowercase())),
            Filter::Any(filters) => filters.iter().any(|f| f.matches(entry)),
        }
    }
}

/// One ordering key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn desc(column: &str) -> Self {
        OrderBy {
            column: column.to_string(),
            ascending: false,
        }
    }

    pub fn asc(column: &str) -> Self {
        OrderBy {
            column: column.to_string(),
            ascending: true,
        }
    }
}

/// Window of an ordered result set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: usize,
    pub limit: usize,
}

/// A filtered, ordered, optionally ranged listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Conjunction of predicates
    pub filters: Vec<Filter>,
    pub order: Vec<OrderBy>,
    pub range: Option<Range>,
}

impl Default for ListQuery {
    /// Every entry, newest date first
    fn default() -> Self {
        ListQuery {
            filters: Vec::new(),
            order: vec![OrderBy::desc("date"), OrderBy::desc("id")],
            range: None,
        }
    }
}

impl ListQuery {
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn range(mut self, offset: usize, limit: usize) -> Self {
        self.range = Some(Range { offset, limit });
        self
    }

    pub fn order(mut self, order: Vec<OrderBy>) -> Self {
        self.order = order;
        self
    }
}

/// One page of a listing plus the total number of matching rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub entries: Vec<BlotterEntry>,
    pub total: usize,
}

/// Typed access to the remote blotter table
///
/// Every call takes the session whose token authorizes it.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list(&self, session: &Session, query: &ListQuery) -> Result<Page>;

    /// Fetch one entry; `BlotterError::NotFound` when absent
    async fn get(&self, session: &Session, id: EntryId) -> Result<BlotterEntry>;

    /// Insert every entry in a single batch, returning the stored rows
    async fn insert(&self, session: &Session, entries: Vec<NewEntry>) -> Result<Vec<BlotterEntry>>;

    async fn update(
        &self,
        session: &Session,
        id: EntryId,
        update: &EntryUpdate,
    ) -> Result<BlotterEntry>;

    async fn delete(&self, session: &Session, id: EntryId) -> Result<()>;

    async fn delete_all(&self, session: &Session) -> Result<()>;
}

/// Read a column of an entry as text
pub fn column_value(entry: &BlotterEntry, column: &str) -> Option<String> {
    match column {
        "id" => Some(entry.id.to_string()),
        "first_name" => Some(entry.first_name.clone()),
        "last_name" => Some(entry.last_name.clone()),
        "case_type" => Some(entry.case_type.clone()),
        "date" => Some(entry.date.clone()),
        "blotter_entry" => Some(entry.blotter_entry.clone()),
        "created_at" => Some(entry.created_at.clone()),
        _ => None,
    }
}
