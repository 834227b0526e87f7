use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::cmp::Ordering;
use std::sync::{Mutex, MutexGuard};

use crate::auth::Session;
use crate::entry::{BlotterEntry, EntryId, EntryUpdate, NewEntry};
use crate::error::{BlotterError, Result};
use crate::store::{ListQuery, OrderBy, Page, RecordStore, column_value};

#[derive(Default)]
struct Table {
    rows: Vec<BlotterEntry>,
    next_id: EntryId,
}

/// In-process record store with the same semantics as the remote table
///
/// Used for demo mode and tests. Ids start at 1 and only grow.
#[derive(Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored entry in insertion order
    pub fn snapshot(&self) -> Vec<BlotterEntry> {
        self.table
            .lock()
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Table>> {
        self.table
            .lock()
            .map_err(|_| BlotterError::transport("memory store poisoned"))
    }
}

fn compare(a: &BlotterEntry, b: &BlotterEntry, order: &[OrderBy]) -> Ordering {
    for key in order {
        let ord = if key.column == "id" {
            a.id.cmp(&b.id)
        } else {
            column_value(a, &key.column).cmp(&column_value(b, &key.column))
        };
        let ord = if key.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list(&self, _session: &Session, query: &ListQuery) -> Result<Page> {
        let table = self.lock()?;
        let mut matching: Vec<BlotterEntry> = table
            .rows
            .iter()
            .filter(|row| query.filters.iter().all(|f| f.matches(row)))
            .cloned()
            .collect();
        drop(table);

        matching.sort_by(|a, b| compare(a, b, &query.order));
        let total = matching.len();

        let entries = match query.range {
            Some(range) => matching
                .into_iter()
                .skip(range.offset)
                .take(range.limit)
                .collect(),
            None => matching,
        };

        Ok(Page { entries, total })
    }

    async fn get(&self, _session: &Session, id: EntryId) -> Result<BlotterEntry> {
        self.lock()?
            .rows
            .iter()
            .find(|row| row.id == id)
            .cloned()
            .ok_or(BlotterError::NotFound(id))
    }

    async fn insert(&self, _session: &Session, entries: Vec<NewEntry>) -> Result<Vec<BlotterEntry>> {
        let mut table = self.lock()?;
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut inserted = Vec::with_capacity(entries.len());

        for entry in entries {
            table.next_id += 1;
            let row = BlotterEntry {
                id: table.next_id,
                first_name: entry.first_name,
                last_name: entry.last_name,
                case_type: entry.case_type,
                date: entry.date,
                blotter_entry: entry.blotter_entry,
                created_at: created_at.clone(),
            };
            table.rows.push(row.clone());
            inserted.push(row);
        }

        Ok(inserted)
    }

    async fn update(
        &self,
        _session: &Session,
        id: EntryId,
        update: &EntryUpdate,
    ) -> Result<BlotterEntry> {
        let mut table = self.lock()?;
        let row = table
            .rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(BlotterError::NotFound(id))?;
        update.apply_to(row);
        Ok(row.clone())
    }

    async fn delete(&self, _session: &Session, id: EntryId) -> Result<()> {
        let mut table = self.lock()?;
        let before = table.rows.len();
        table.rows.retain(|row| row.id != id);
        if table.rows.len() == before {
            return Err(BlotterError::NotFound(id));
        }
        Ok(())
    }

    async fn delete_all(&self, _session: &Session) -> Result<()> {
        self.lock()?.rows.clear();
        Ok(())
    }
}
