//! Ticket store. Every mutation loads the ticket, applies the change in
//! memory, records the matching activity entries and writes the row back.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use super::{BoardDb, TicketRow};
use crate::board::activity::{ActivityEntry, ActivityKind};
use crate::board::fields::FieldSchema;
use crate::board::models::*;
use crate::errors::BoardError;

/// Longest comment excerpt stored in a `comment_added` entry.
const EXCERPT_CHARS: usize = 80;

impl BoardDb {
    pub fn create_ticket(&self, project_type: &str, new: NewTicket, actor: &str) -> Result<Ticket> {
        self.ensure_project_type(project_type)?;
        let name = new.name.trim();
        if name.is_empty() {
            return Err(BoardError::validation("Ticket name is required").into());
        }
        let board_name = new.board_name.trim();
        if !self.board_exists(project_type, board_name)? {
            return Err(BoardError::not_found(format!("Board '{}'", board_name)).into());
        }
        let configs = self.list_active_fields(project_type)?;
        let field_values = FieldSchema::new(&configs).validate_new(&new.fields)?;

        let now = Utc::now();
        let mut ticket = Ticket {
            id: Uuid::new_v4(),
            project_type: project_type.to_string(),
            name: name.to_string(),
            board_name: board_name.to_string(),
            field_values,
            members: new.members,
            labels: new.labels,
            due_date: new.due_date,
            comments: Vec::new(),
            attachments: Vec::new(),
            pending_items: Vec::new(),
            activity: Default::default(),
            created_at: now,
            updated_at: now,
        };
        ticket.log(
            actor,
            ActivityKind::Created {
                board: ticket.board_name.clone(),
            },
        );
        self.insert_ticket(&ticket)?;
        tracing::info!(id = %ticket.id, project_type, board = board_name, actor, "ticket created");
        Ok(ticket)
    }

    pub fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>> {
        let sql = format!("SELECT {} FROM tickets WHERE id = ?1", TicketRow::COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id.to_string()], TicketRow::from_row)
            .optional()
            .context("Failed to query ticket")?;
        row.map(TicketRow::into_ticket).transpose()
    }

    fn require_ticket(&self, id: Uuid) -> Result<Ticket> {
        self.get_ticket(id)?
            .ok_or_else(|| BoardError::not_found(format!("Ticket {}", id)).into())
    }

    /// Tickets of a project type, oldest first.
    pub fn list_tickets(&self, project_type: &str) -> Result<Vec<Ticket>> {
        let sql = format!(
            "SELECT {} FROM tickets WHERE project_type = ?1 ORDER BY created_at, rowid",
            TicketRow::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_tickets")?;
        let rows = stmt
            .query_map(params![project_type], TicketRow::from_row)
            .context("Failed to query tickets")?;
        let mut tickets = Vec::new();
        for row in rows {
            let r = row.context("Failed to read ticket row")?;
            tickets.push(r.into_ticket()?);
        }
        Ok(tickets)
    }

    /// Case-insensitive match on the ticket name and searchable field values.
    pub fn search_tickets(&self, project_type: &str, query: &str) -> Result<Vec<Ticket>> {
        let query = query.trim().to_lowercase();
        let tickets = self.list_tickets(project_type)?;
        if query.is_empty() {
            return Ok(tickets);
        }
        let configs = self.list_active_fields(project_type)?;
        let schema = FieldSchema::new(&configs);
        Ok(tickets
            .into_iter()
            .filter(|t| {
                t.name.to_lowercase().contains(&query)
                    || schema.matches_searchable(&t.field_values, &query)
            })
            .collect())
    }

    /// Move a ticket to another board, recording the status change and,
    /// when a terminal board is entered or left, the matching entry.
    pub fn move_ticket(&self, id: Uuid, board_name: &str, actor: &str) -> Result<Ticket> {
        let mut ticket = self.require_ticket(id)?;
        let to = board_name.trim();
        if !self.board_exists(&ticket.project_type, to)? {
            return Err(BoardError::not_found(format!("Board '{}'", to)).into());
        }
        if ticket.board_name == to {
            return Ok(ticket);
        }

        let from = std::mem::replace(&mut ticket.board_name, to.to_string());
        ticket.log(
            actor,
            ActivityKind::StatusChanged {
                from: from.clone(),
                to: to.to_string(),
            },
        );
        match (ReservedBoard::from_name(&from), ReservedBoard::from_name(to)) {
            (_, Some(terminal)) => ticket.log(actor, terminal.arrival_activity()),
            (Some(_), None) => ticket.log(actor, ActivityKind::Restored { to: to.to_string() }),
            (None, None) => {}
        }
        ticket.updated_at = Utc::now();
        self.save_ticket(&ticket)?;
        tracing::info!(%id, from = %from, to, actor, "ticket moved");
        Ok(ticket)
    }

    /// Merge field values; one `field_updated` entry per key that changed.
    pub fn update_fields(
        &self,
        id: Uuid,
        values: &BTreeMap<String, serde_json::Value>,
        actor: &str,
    ) -> Result<Ticket> {
        let mut ticket = self.require_ticket(id)?;
        let configs = self.list_active_fields(&ticket.project_type)?;
        let changes = FieldSchema::new(&configs).diff(&ticket.field_values, values)?;
        if changes.is_empty() {
            return Ok(ticket);
        }
        for change in &changes {
            match &change.new {
                Some(v) => ticket.field_values.insert(change.field.clone(), v.clone()),
                None => ticket.field_values.remove(&change.field),
            };
        }
        for change in changes.iter() {
            ticket.log(
                actor,
                ActivityKind::FieldUpdated {
                    field: change.field.clone(),
                    old: change.old.clone(),
                    new: change.new.clone(),
                },
            );
        }
        ticket.updated_at = Utc::now();
        self.save_ticket(&ticket)?;
        tracing::info!(%id, changed = changes.len(), actor, "ticket fields updated");
        Ok(ticket)
    }

    /// Edit name, labels, members or due date. Not recorded as activity.
    pub fn update_ticket(&self, id: Uuid, update: TicketUpdate) -> Result<Ticket> {
        self.mutate_ticket(id, |ticket| {
            if let Some(name) = update.name {
                let name = name.trim();
                if name.is_empty() {
                    return Err(BoardError::validation("Ticket name is required").into());
                }
                ticket.name = name.to_string();
            }
            if let Some(labels) = update.labels {
                ticket.labels = labels;
            }
            if let Some(members) = update.members {
                ticket.members = members;
            }
            if let Some(due_date) = update.due_date {
                ticket.due_date = due_date;
            }
            Ok(())
        })
    }

    pub fn delete_ticket(&self, id: Uuid) -> Result<()> {
        let count = self
            .conn
            .execute("DELETE FROM tickets WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete ticket")?;
        if count == 0 {
            return Err(BoardError::not_found(format!("Ticket {}", id)).into());
        }
        tracing::info!(%id, "ticket deleted");
        Ok(())
    }

    pub fn ticket_activity(&self, id: Uuid) -> Result<Vec<ActivityEntry>> {
        Ok(self.require_ticket(id)?.activity.to_vec())
    }

    // ── Comments ──────────────────────────────────────────────────────

    pub fn add_comment(&self, id: Uuid, author: &str, text: &str) -> Result<Ticket> {
        let text = non_blank(text, "Comment text")?;
        self.mutate_ticket(id, |ticket| {
            let comment = Comment {
                id: Uuid::new_v4(),
                author: author.to_string(),
                text: text.to_string(),
                created_at: Utc::now(),
                edited_at: None,
            };
            let kind = ActivityKind::CommentAdded {
                comment_id: comment.id,
                excerpt: text.chars().take(EXCERPT_CHARS).collect(),
            };
            ticket.comments.push(comment);
            ticket.log(author, kind);
            Ok(())
        })
    }

    /// Only the author may edit a comment.
    pub fn edit_comment(&self, id: Uuid, comment_id: Uuid, actor: &str, text: &str) -> Result<Ticket> {
        let text = non_blank(text, "Comment text")?;
        self.mutate_ticket(id, |ticket| {
            let comment = ticket
                .comments
                .iter_mut()
                .find(|c| c.id == comment_id)
                .ok_or_else(|| BoardError::not_found(format!("Comment {}", comment_id)))?;
            if comment.author != actor {
                return Err(BoardError::Forbidden("only the author can edit a comment".into()).into());
            }
            comment.text = text.to_string();
            comment.edited_at = Some(Utc::now());
            ticket.log(actor, ActivityKind::CommentEdited { comment_id });
            Ok(())
        })
    }

    /// The author may always remove a comment; `moderator` lets anyone else.
    pub fn remove_comment(&self, id: Uuid, comment_id: Uuid, actor: &str, moderator: bool) -> Result<Ticket> {
        self.mutate_ticket(id, |ticket| {
            let index = ticket
                .comments
                .iter()
                .position(|c| c.id == comment_id)
                .ok_or_else(|| BoardError::not_found(format!("Comment {}", comment_id)))?;
            if ticket.comments[index].author != actor && !moderator {
                return Err(BoardError::Forbidden("only the author can remove a comment".into()).into());
            }
            ticket.comments.remove(index);
            ticket.log(actor, ActivityKind::CommentRemoved { comment_id });
            Ok(())
        })
    }

    // ── Attachments ───────────────────────────────────────────────────

    pub fn add_attachment(&self, id: Uuid, actor: &str, new: NewAttachment) -> Result<Ticket> {
        let file_name = non_blank(&new.file_name, "Attachment file name")?.to_string();
        let url = non_blank(&new.url, "Attachment url")?.to_string();
        self.mutate_ticket(id, |ticket| {
            let attachment = Attachment {
                id: Uuid::new_v4(),
                file_name,
                url,
                size_bytes: new.size_bytes,
                uploaded_by: actor.to_string(),
                created_at: Utc::now(),
            };
            let kind = ActivityKind::AttachmentAdded {
                attachment_id: attachment.id,
                file_name: attachment.file_name.clone(),
            };
            ticket.attachments.push(attachment);
            ticket.log(actor, kind);
            Ok(())
        })
    }

    pub fn remove_attachment(&self, id: Uuid, attachment_id: Uuid, actor: &str) -> Result<Ticket> {
        self.mutate_ticket(id, |ticket| {
            let index = ticket
                .attachments
                .iter()
                .position(|a| a.id == attachment_id)
                .ok_or_else(|| BoardError::not_found(format!("Attachment {}", attachment_id)))?;
            let removed = ticket.attachments.remove(index);
            ticket.log(
                actor,
                ActivityKind::AttachmentRemoved {
                    attachment_id,
                    file_name: removed.file_name,
                },
            );
            Ok(())
        })
    }

    // ── Pending items ─────────────────────────────────────────────────

    pub fn add_pending_item(&self, id: Uuid, actor: &str, text: &str) -> Result<Ticket> {
        let text = non_blank(text, "Pending item text")?;
        self.mutate_ticket(id, |ticket| {
            let item = PendingItem {
                id: Uuid::new_v4(),
                text: text.to_string(),
                completed: false,
                created_at: Utc::now(),
            };
            let kind = ActivityKind::PendingItemAdded {
                item_id: item.id,
                text: item.text.clone(),
            };
            ticket.pending_items.push(item);
            ticket.log(actor, kind);
            Ok(())
        })
    }

    pub fn toggle_pending_item(&self, id: Uuid, item_id: Uuid, actor: &str) -> Result<Ticket> {
        self.mutate_ticket(id, |ticket| {
            let item = ticket
                .pending_items
                .iter_mut()
                .find(|p| p.id == item_id)
                .ok_or_else(|| BoardError::not_found(format!("Pending item {}", item_id)))?;
            item.completed = !item.completed;
            let kind = ActivityKind::PendingItemToggled {
                item_id,
                text: item.text.clone(),
                completed: item.completed,
            };
            ticket.log(actor, kind);
            Ok(())
        })
    }

    pub fn remove_pending_item(&self, id: Uuid, item_id: Uuid, actor: &str) -> Result<Ticket> {
        self.mutate_ticket(id, |ticket| {
            let index = ticket
                .pending_items
                .iter()
                .position(|p| p.id == item_id)
                .ok_or_else(|| BoardError::not_found(format!("Pending item {}", item_id)))?;
            let removed = ticket.pending_items.remove(index);
            ticket.log(
                actor,
                ActivityKind::PendingItemRemoved {
                    item_id,
                    text: removed.text,
                },
            );
            Ok(())
        })
    }

    // ── Persistence helpers ───────────────────────────────────────────

    /// Load, apply `f`, bump `updated_at` and write back. If `f` fails the
    /// stored ticket is left untouched.
    fn mutate_ticket<F>(&self, id: Uuid, f: F) -> Result<Ticket>
    where
        F: FnOnce(&mut Ticket) -> Result<()>,
    {
        let mut ticket = self.require_ticket(id)?;
        f(&mut ticket)?;
        ticket.updated_at = Utc::now();
        self.save_ticket(&ticket)?;
        tracing::debug!(%id, latest = ?ticket.activity.latest().map(|e| e.kind.as_str()), "ticket saved");
        Ok(ticket)
    }

    fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
        let json = TicketJson::encode(ticket)?;
        self.conn
            .execute(
                "INSERT INTO tickets (id, project_type, name, board_name, field_values, members, labels, due_date,
                     comments, attachments, pending_items, activity, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    ticket.id.to_string(),
                    ticket.project_type,
                    ticket.name,
                    ticket.board_name,
                    json.field_values,
                    json.members,
                    json.labels,
                    json.due_date,
                    json.comments,
                    json.attachments,
                    json.pending_items,
                    json.activity,
                    ticket.created_at.to_rfc3339(),
                    ticket.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert ticket")?;
        Ok(())
    }

    fn save_ticket(&self, ticket: &Ticket) -> Result<()> {
        let json = TicketJson::encode(ticket)?;
        self.conn
            .execute(
                "UPDATE tickets SET name = ?1, board_name = ?2, field_values = ?3, members = ?4, labels = ?5,
                     due_date = ?6, comments = ?7, attachments = ?8, pending_items = ?9, activity = ?10,
                     updated_at = ?11
                 WHERE id = ?12",
                params![
                    ticket.name,
                    ticket.board_name,
                    json.field_values,
                    json.members,
                    json.labels,
                    json.due_date,
                    json.comments,
                    json.attachments,
                    json.pending_items,
                    json.activity,
                    ticket.updated_at.to_rfc3339(),
                    ticket.id.to_string(),
                ],
            )
            .context("Failed to update ticket")?;
        Ok(())
    }
}

/// JSON text of a ticket's collection columns.
struct TicketJson {
    field_values: String,
    members: String,
    labels: String,
    due_date: Option<String>,
    comments: String,
    attachments: String,
    pending_items: String,
    activity: String,
}

impl TicketJson {
    fn encode(ticket: &Ticket) -> Result<Self> {
        Ok(Self {
            field_values: serde_json::to_string(&ticket.field_values)
                .context("Failed to serialize field values")?,
            members: serde_json::to_string(&ticket.members).context("Failed to serialize members")?,
            labels: serde_json::to_string(&ticket.labels).context("Failed to serialize labels")?,
            due_date: ticket.due_date.map(|d| d.format("%Y-%m-%d").to_string()),
            comments: serde_json::to_string(&ticket.comments).context("Failed to serialize comments")?,
            attachments: serde_json::to_string(&ticket.attachments)
                .context("Failed to serialize attachments")?,
            pending_items: serde_json::to_string(&ticket.pending_items)
                .context("Failed to serialize pending items")?,
            activity: serde_json::to_string(&ticket.activity).context("Failed to serialize activity")?,
        })
    }
}

fn non_blank<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BoardError::validation(format!("{} is required", what)).into());
    }
    Ok(trimmed)
}
