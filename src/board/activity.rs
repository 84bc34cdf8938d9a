//! Per-ticket activity trail.
//!
//! [`record`] builds an immutable [`ActivityEntry`]; the ticket store pushes
//! it onto the ticket's [`ActivityLog`], which keeps the newest
//! [`ACTIVITY_LIMIT`] entries, most recent first. Older entries are dropped.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::FieldValue;

/// Maximum number of entries kept per ticket.
pub const ACTIVITY_LIMIT: usize = 50;

/// What happened to a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    Created {
        board: String,
    },
    StatusChanged {
        from: String,
        to: String,
    },
    FieldUpdated {
        field: String,
        old: Option<FieldValue>,
        new: Option<FieldValue>,
    },
    CommentAdded {
        comment_id: Uuid,
        excerpt: String,
    },
    CommentEdited {
        comment_id: Uuid,
    },
    CommentRemoved {
        comment_id: Uuid,
    },
    AttachmentAdded {
        attachment_id: Uuid,
        file_name: String,
    },
    AttachmentRemoved {
        attachment_id: Uuid,
        file_name: String,
    },
    PendingItemAdded {
        item_id: Uuid,
        text: String,
    },
    PendingItemToggled {
        item_id: Uuid,
        text: String,
        completed: bool,
    },
    PendingItemRemoved {
        item_id: Uuid,
        text: String,
    },
    Completed,
    Cancelled,
    Restored {
        to: String,
    },
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::StatusChanged { .. } => "status_changed",
            Self::FieldUpdated { .. } => "field_updated",
            Self::CommentAdded { .. } => "comment_added",
            Self::CommentEdited { .. } => "comment_edited",
            Self::CommentRemoved { .. } => "comment_removed",
            Self::AttachmentAdded { .. } => "attachment_added",
            Self::AttachmentRemoved { .. } => "attachment_removed",
            Self::PendingItemAdded { .. } => "pending_item_added",
            Self::PendingItemToggled { .. } => "pending_item_toggled",
            Self::PendingItemRemoved { .. } => "pending_item_removed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Restored { .. } => "restored",
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable record of a change to a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub ticket_name: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ActivityKind,
}

/// Build an entry for `kind`, stamped now and attributed to `actor`.
pub fn record(kind: ActivityKind, actor: &str, ticket_id: Uuid, ticket_name: &str) -> ActivityEntry {
    ActivityEntry {
        id: Uuid::new_v4(),
        ticket_id,
        ticket_name: ticket_name.to_string(),
        actor: actor.to_string(),
        timestamp: Utc::now(),
        kind,
    }
}

/// Bounded, newest-first sequence of activity entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend `entry`, evicting the oldest entries past [`ACTIVITY_LIMIT`].
    pub fn push(&mut self, entry: ActivityEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(ACTIVITY_LIMIT);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&ActivityEntry> {
        self.entries.front()
    }

    /// Entries, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.entries.iter()
    }

    /// Kind names, most recent first.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.kind.as_str()).collect()
    }

    pub fn to_vec(&self) -> Vec<ActivityEntry> {
        self.entries.iter().cloned().collect()
    }
}
