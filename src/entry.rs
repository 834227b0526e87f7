use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Server-assigned identifier of a blotter entry
pub type EntryId = i64;

/// Column names of the required user fields, in display order
pub const REQUIRED_FIELDS: [&str; 5] = [
    "blotter_entry",
    "first_name",
    "last_name",
    "case_type",
    "date",
];

/// One logged incident record as stored by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlotterEntry {
    /// Assigned by the store on insert, never changes afterwards
    pub id: EntryId,
    pub first_name: String,
    pub last_name: String,
    pub case_type: String,
    /// ISO `YYYY-MM-DD` date string
    pub date: String,
    /// Free-text narrative
    pub blotter_entry: String,
    /// Assigned by the store on insert, read-only
    pub created_at: String,
}

/// Insert payload: the user-editable fields of an entry
///
/// Every field is required. Use [`NewEntry::validate`] before inserting
/// form submissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub case_type: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub blotter_entry: String,
}

impl NewEntry {
    /// Check that every required field is non-blank
    ///
    /// # Returns
    /// * `Err(ValidationError::MissingFields)` naming each blank field
    pub fn validate(&self) -> Result<(), ValidationError> {
        let missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|field| self.field(field).is_none_or(|v| v.trim().is_empty()))
            .map(|field| field.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::MissingFields(missing))
        }
    }

    /// Look up a user field by column name
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "first_name" => Some(&self.first_name),
            "last_name" => Some(&self.last_name),
            "case_type" => Some(&self.case_type),
            "date" => Some(&self.date),
            "blotter_entry" => Some(&self.blotter_entry),
            _ => None,
        }
    }
}

/// Partial update payload
///
/// There is deliberately no `id` or `created_at` here: a request body
/// carrying them deserializes fine and the extra keys are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blotter_entry: Option<String>,
}

impl EntryUpdate {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.case_type.is_none()
            && self.date.is_none()
            && self.blotter_entry.is_none()
    }

    /// Reject fields that are present but blank; absent fields are kept as is
    pub fn validate(&self) -> Result<(), ValidationError> {
        let present = [
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("case_type", &self.case_type),
            ("date", &self.date),
            ("blotter_entry", &self.blotter_entry),
        ];
        let blank: Vec<String> = present
            .into_iter()
            .filter(|(_, value)| matches!(value, Some(v) if v.trim().is_empty()))
            .map(|(name, _)| name.to_string())
            .collect();

        if blank.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::MissingFields(blank))
        }
    }

    /// Overwrite the fields present in this update, leaving `id` and
    /// `created_at` untouched
    pub fn apply_to(&self, entry: &mut BlotterEntry) {
        if let Some(v) = &self.first_name {
            entry.first_name = v.clone();
        }
        if let Some(v) = &self.last_name {
            entry.last_name = v.clone();
        }
        if let Some(v) = &self.case_type {
            entry.case_type = v.clone();
        }
        if let Some(v) = &self.date {
            entry.date = v.clone();
        }
        if let Some(v) = &self.blotter_entry {
            entry.blotter_entry = v.clone();
        }
    }
}
