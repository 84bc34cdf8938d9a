use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use super::models::*;
use crate::errors::BoardError;

mod boards;
mod field_configs;
mod tickets;

/// Async-safe handle to the board database.
///
/// Wraps `BoardDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BoardDb>>,
}

impl DbHandle {
    pub fn new(db: BoardDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BoardDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| BoardError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, BoardDb>> {
        self.inner
            .lock()
            .map_err(|_| BoardError::LockPoisoned.into())
    }
}

pub struct BoardDb {
    conn: Connection,
}

impl BoardDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS boards (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_type TEXT NOT NULL,
                    name TEXT NOT NULL,
                    position INTEGER NOT NULL DEFAULT 0,
                    reserved INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    UNIQUE(project_type, name)
                );

                CREATE TABLE IF NOT EXISTS board_colors (
                    project_type TEXT NOT NULL,
                    board_name TEXT NOT NULL,
                    color TEXT NOT NULL,
                    PRIMARY KEY (project_type, board_name)
                );

                CREATE TABLE IF NOT EXISTS tickets (
                    id TEXT PRIMARY KEY,
                    project_type TEXT NOT NULL,
                    name TEXT NOT NULL,
                    board_name TEXT NOT NULL,
                    field_values TEXT NOT NULL DEFAULT '{}',
                    members TEXT NOT NULL DEFAULT '[]',
                    labels TEXT NOT NULL DEFAULT '[]',
                    due_date TEXT,
                    comments TEXT NOT NULL DEFAULT '[]',
                    attachments TEXT NOT NULL DEFAULT '[]',
                    pending_items TEXT NOT NULL DEFAULT '[]',
                    activity TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS field_configs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_type TEXT NOT NULL,
                    field_name TEXT NOT NULL,
                    label TEXT NOT NULL,
                    field_type TEXT NOT NULL,
                    required INTEGER NOT NULL DEFAULT 0,
                    searchable INTEGER NOT NULL DEFAULT 0,
                    active INTEGER NOT NULL DEFAULT 1,
                    visible_on_card INTEGER NOT NULL DEFAULT 0,
                    options TEXT NOT NULL DEFAULT '[]',
                    position INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(project_type, field_name)
                );

                CREATE INDEX IF NOT EXISTS idx_boards_project_type ON boards(project_type);
                CREATE INDEX IF NOT EXISTS idx_tickets_board ON tickets(project_type, board_name);
                CREATE INDEX IF NOT EXISTS idx_field_configs_project_type ON field_configs(project_type);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Materialise the reserved boards of a project type. Only write paths
    /// call this; reads synthesise the reserved boards instead.
    fn ensure_project_type(&self, project_type: &str) -> Result<()> {
        check_project_type(project_type)?;
        let now = Utc::now().to_rfc3339();
        for (position, reserved) in ReservedBoard::ALL.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO boards (project_type, name, position, reserved, created_at)
                     VALUES (?1, ?2, ?3, 1, ?4)",
                    params![project_type, reserved.name(), position as i32, now],
                )
                .context("Failed to create reserved board")?;
        }
        Ok(())
    }
}

fn check_project_type(project_type: &str) -> Result<()> {
    if project_type.trim().is_empty() {
        return Err(BoardError::validation("Project type is required").into());
    }
    Ok(())
}

// ── Row conversion ────────────────────────────────────────────────────

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: '{}'", raw))
}

/// Intermediate row struct for boards joined with their color mapping.
struct BoardRow {
    project_type: String,
    name: String,
    position: i32,
    reserved: bool,
    created_at: String,
    color: Option<String>,
}

impl BoardRow {
    const COLUMNS: &'static str = "b.project_type, b.name, b.position, b.reserved, b.created_at, c.color";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_type: row.get(0)?,
            name: row.get(1)?,
            position: row.get(2)?,
            reserved: row.get(3)?,
            created_at: row.get(4)?,
            color: row.get(5)?,
        })
    }

    fn into_board(self) -> Result<Board> {
        let color = match self.color {
            Some(c) => BoardColor::from_str(&c)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse board color")?,
            None => ReservedBoard::from_name(&self.name)
                .map(|r| r.default_color())
                .unwrap_or_default(),
        };
        Ok(Board {
            created_at: parse_timestamp(&self.created_at)?,
            project_type: self.project_type,
            name: self.name,
            position: self.position,
            reserved: self.reserved,
            color,
        })
    }
}

/// Intermediate row struct for tickets; collections are JSON text.
struct TicketRow {
    id: String,
    project_type: String,
    name: String,
    board_name: String,
    field_values: String,
    members: String,
    labels: String,
    due_date: Option<String>,
    comments: String,
    attachments: String,
    pending_items: String,
    activity: String,
    created_at: String,
    updated_at: String,
}

impl TicketRow {
    const COLUMNS: &'static str = "id, project_type, name, board_name, field_values, members, labels, due_date, \
         comments, attachments, pending_items, activity, created_at, updated_at";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_type: row.get(1)?,
            name: row.get(2)?,
            board_name: row.get(3)?,
            field_values: row.get(4)?,
            members: row.get(5)?,
            labels: row.get(6)?,
            due_date: row.get(7)?,
            comments: row.get(8)?,
            attachments: row.get(9)?,
            pending_items: row.get(10)?,
            activity: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_ticket(self) -> Result<Ticket> {
        let due_date = self
            .due_date
            .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
            .transpose()
            .context("Failed to parse ticket due date")?;
        Ok(Ticket {
            id: Uuid::parse_str(&self.id).context("Failed to parse ticket id")?,
            project_type: self.project_type,
            name: self.name,
            board_name: self.board_name,
            field_values: serde_json::from_str(&self.field_values)
                .context("Failed to parse ticket field values JSON")?,
            members: serde_json::from_str(&self.members).context("Failed to parse ticket members JSON")?,
            labels: serde_json::from_str(&self.labels).context("Failed to parse ticket labels JSON")?,
            due_date,
            comments: serde_json::from_str(&self.comments).context("Failed to parse ticket comments JSON")?,
            attachments: serde_json::from_str(&self.attachments)
                .context("Failed to parse ticket attachments JSON")?,
            pending_items: serde_json::from_str(&self.pending_items)
                .context("Failed to parse ticket pending items JSON")?,
            activity: serde_json::from_str(&self.activity).context("Failed to parse ticket activity JSON")?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

/// Intermediate row struct for field_configs.
struct FieldConfigRow {
    id: i64,
    project_type: String,
    field_name: String,
    label: String,
    field_type: String,
    required: bool,
    searchable: bool,
    active: bool,
    visible_on_card: bool,
    options: String,
    position: i32,
}

impl FieldConfigRow {
    const COLUMNS: &'static str = "id, project_type, field_name, label, field_type, required, searchable, \
         active, visible_on_card, options, position";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_type: row.get(1)?,
            field_name: row.get(2)?,
            label: row.get(3)?,
            field_type: row.get(4)?,
            required: row.get(5)?,
            searchable: row.get(6)?,
            active: row.get(7)?,
            visible_on_card: row.get(8)?,
            options: row.get(9)?,
            position: row.get(10)?,
        })
    }

    fn into_field_config(self) -> Result<FieldConfig> {
        let field_type = FieldType::from_str(&self.field_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse field type")?;
        Ok(FieldConfig {
            id: self.id,
            project_type: self.project_type,
            label: self.label,
            field_name: self.field_name,
            field_type,
            required: self.required,
            searchable: self.searchable,
            active: self.active,
            visible_on_card: self.visible_on_card,
            options: serde_json::from_str(&self.options).context("Failed to parse field options JSON")?,
            position: self.position,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
