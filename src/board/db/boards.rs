//! Board registry: ordered, named columns per project type.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::{BoardDb, BoardRow, check_project_type};
use crate::board::models::*;
use crate::errors::BoardError;

impl BoardDb {
    /// Boards of a project type in display order: non-reserved boards by
    /// position (ties by creation), then Done, then Cancelled.
    pub fn list_boards(&self, project_type: &str) -> Result<Vec<Board>> {
        check_project_type(project_type)?;
        let sql = format!(
            "SELECT {} FROM boards b
             LEFT JOIN board_colors c ON c.project_type = b.project_type AND c.board_name = b.name
             WHERE b.project_type = ?1
             ORDER BY b.reserved, b.position, b.id",
            BoardRow::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_boards")?;
        let rows = stmt
            .query_map(params![project_type], BoardRow::from_row)
            .context("Failed to query boards")?;
        let mut boards = Vec::new();
        for row in rows {
            let r = row.context("Failed to read board row")?;
            boards.push(r.into_board()?);
        }
        for reserved in ReservedBoard::ALL {
            if !boards.iter().any(|b| b.name == reserved.name()) {
                boards.push(unsaved_reserved(project_type, reserved));
            }
        }
        Ok(boards)
    }

    pub fn get_board(&self, project_type: &str, name: &str) -> Result<Option<Board>> {
        check_project_type(project_type)?;
        let sql = format!(
            "SELECT {} FROM boards b
             LEFT JOIN board_colors c ON c.project_type = b.project_type AND c.board_name = b.name
             WHERE b.project_type = ?1 AND b.name = ?2",
            BoardRow::COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![project_type, name], BoardRow::from_row)
            .optional()
            .context("Failed to query board")?;
        match row {
            Some(row) => row.into_board().map(Some),
            None => Ok(ReservedBoard::from_name(name).map(|r| unsaved_reserved(project_type, r))),
        }
    }

    pub(super) fn board_exists(&self, project_type: &str, name: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM boards WHERE project_type = ?1 AND name = ?2",
                params![project_type, name],
                |row| row.get(0),
            )
            .context("Failed to check board existence")
    }

    /// Create a board after the current last non-reserved board.
    pub fn create_board(
        &self,
        project_type: &str,
        name: &str,
        color: Option<BoardColor>,
    ) -> Result<Board> {
        self.ensure_project_type(project_type)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(BoardError::validation("Board name is required").into());
        }
        if self.board_exists(project_type, name)? {
            return Err(BoardError::Conflict(format!("Board '{}' already exists", name)).into());
        }

        // Safety: the DbHandle mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let position: i32 = tx
            .query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM boards WHERE project_type = ?1 AND reserved = 0",
                params![project_type],
                |row| row.get(0),
            )
            .context("Failed to get next board position")?;
        insert_board(&tx, project_type, name, position, color)?;
        tx.commit().context("Failed to commit board creation")?;

        tracing::info!(project_type, board = name, position, "board created");
        self.get_board(project_type, name)?
            .context("Board not found after insert")
    }

    /// Rename a board, re-tagging its tickets and moving its color mapping.
    pub fn rename_board(&self, project_type: &str, old_name: &str, new_name: &str) -> Result<Board> {
        self.ensure_project_type(project_type)?;
        let old_name = old_name.trim();
        let new_name = new_name.trim();
        if is_reserved(old_name) {
            return Err(BoardError::InvalidOperation(format!(
                "Board '{}' is reserved and cannot be renamed",
                old_name
            ))
            .into());
        }
        if is_reserved(new_name) {
            return Err(BoardError::InvalidOperation(format!(
                "'{}' is a reserved board name",
                new_name
            ))
            .into());
        }
        if new_name.is_empty() {
            return Err(BoardError::validation("New board name is required").into());
        }
        if !self.board_exists(project_type, old_name)? {
            return Err(BoardError::not_found(format!("Board '{}'", old_name)).into());
        }
        if old_name == new_name {
            return self
                .get_board(project_type, old_name)?
                .context("Board not found after existence check");
        }
        if self.board_exists(project_type, new_name)? {
            return Err(BoardError::InvalidOperation(format!(
                "Board '{}' already exists",
                new_name
            ))
            .into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE boards SET name = ?1 WHERE project_type = ?2 AND name = ?3",
            params![new_name, project_type, old_name],
        )
        .context("Failed to rename board")?;
        let retagged = tx
            .execute(
                "UPDATE tickets SET board_name = ?1, updated_at = ?2 WHERE project_type = ?3 AND board_name = ?4",
                params![new_name, Utc::now().to_rfc3339(), project_type, old_name],
            )
            .context("Failed to re-tag tickets")?;
        tx.execute(
            "UPDATE board_colors SET board_name = ?1 WHERE project_type = ?2 AND board_name = ?3",
            params![new_name, project_type, old_name],
        )
        .context("Failed to move board color")?;
        tx.commit().context("Failed to commit board rename")?;

        tracing::info!(project_type, from = old_name, to = new_name, retagged, "board renamed");
        self.get_board(project_type, new_name)?
            .context("Board not found after rename")
    }

    /// Give each listed board its index as position. Unlisted boards follow
    /// in their current order; reserved names are ignored and stay last.
    pub fn reorder_boards(&self, project_type: &str, ordered_names: &[String]) -> Result<Vec<Board>> {
        let current = self.list_boards(project_type)?;
        let known: HashSet<&str> = current.iter().map(|b| b.name.as_str()).collect();

        let mut seen = HashSet::new();
        let mut order: Vec<&str> = Vec::new();
        for name in ordered_names {
            let name = name.trim();
            if !seen.insert(name) {
                return Err(BoardError::validation(format!(
                    "Board '{}' is listed more than once",
                    name
                ))
                .into());
            }
            if !known.contains(name) {
                return Err(BoardError::not_found(format!("Board '{}'", name)).into());
            }
            if !is_reserved(name) {
                order.push(name);
            }
        }
        for board in current.iter().filter(|b| !b.reserved) {
            if !seen.contains(board.name.as_str()) {
                order.push(&board.name);
            }
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        write_positions(&tx, project_type, &order)?;
        tx.commit().context("Failed to commit board reorder")?;

        tracing::info!(project_type, boards = order.len(), "boards reordered");
        self.list_boards(project_type)
    }

    /// Delete a board together with all of its tickets. Returns the number
    /// of deleted tickets.
    pub fn delete_board(&self, project_type: &str, name: &str) -> Result<usize> {
        self.ensure_project_type(project_type)?;
        let name = name.trim();
        if is_reserved(name) {
            return Err(BoardError::InvalidOperation(format!(
                "Board '{}' is reserved and cannot be deleted",
                name
            ))
            .into());
        }
        if !self.board_exists(project_type, name)? {
            return Err(BoardError::not_found(format!("Board '{}'", name)).into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let deleted_tickets = tx
            .execute(
                "DELETE FROM tickets WHERE project_type = ?1 AND board_name = ?2",
                params![project_type, name],
            )
            .context("Failed to delete board tickets")?;
        tx.execute(
            "DELETE FROM board_colors WHERE project_type = ?1 AND board_name = ?2",
            params![project_type, name],
        )
        .context("Failed to delete board color")?;
        tx.execute(
            "DELETE FROM boards WHERE project_type = ?1 AND name = ?2",
            params![project_type, name],
        )
        .context("Failed to delete board")?;
        tx.commit().context("Failed to commit board deletion")?;

        tracing::info!(project_type, board = name, deleted_tickets, "board deleted");
        Ok(deleted_tickets)
    }

    /// Bulk save: create any missing boards and apply the supplied order in
    /// one transaction. Existing boards left out of `names` follow in their
    /// current order.
    pub fn save_boards(&self, project_type: &str, names: &[String]) -> Result<Vec<Board>> {
        self.ensure_project_type(project_type)?;
        let current = self.list_boards(project_type)?;
        let mut seen = HashSet::new();
        let mut order: Vec<&str> = Vec::new();
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                return Err(BoardError::validation("Board names cannot be blank").into());
            }
            if !seen.insert(name) {
                return Err(BoardError::validation(format!(
                    "Board '{}' is listed more than once",
                    name
                ))
                .into());
            }
            if !is_reserved(name) {
                order.push(name);
            }
        }

        let existing: HashSet<&str> = current.iter().map(|b| b.name.as_str()).collect();
        let missing: Vec<&str> = order.iter().copied().filter(|n| !existing.contains(n)).collect();
        for board in current.iter().filter(|b| !b.reserved) {
            if !seen.contains(board.name.as_str()) {
                order.push(&board.name);
            }
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for name in &missing {
            insert_board(&tx, project_type, name, 0, None)?;
        }
        write_positions(&tx, project_type, &order)?;
        tx.commit().context("Failed to commit board save")?;

        tracing::info!(project_type, created = missing.len(), boards = order.len(), "boards saved");
        self.list_boards(project_type)
    }

    pub fn list_board_colors(&self, project_type: &str) -> Result<Vec<BoardColorMapping>> {
        Ok(self
            .list_boards(project_type)?
            .into_iter()
            .map(|b| BoardColorMapping {
                project_type: b.project_type,
                board_name: b.name,
                color: b.color,
            })
            .collect())
    }

    pub fn set_board_color(
        &self,
        project_type: &str,
        board_name: &str,
        color: BoardColor,
    ) -> Result<BoardColorMapping> {
        self.ensure_project_type(project_type)?;
        let board_name = board_name.trim();
        if !self.board_exists(project_type, board_name)? {
            return Err(BoardError::not_found(format!("Board '{}'", board_name)).into());
        }
        self.conn
            .execute(
                "INSERT INTO board_colors (project_type, board_name, color) VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_type, board_name) DO UPDATE SET color = ?3",
                params![project_type, board_name, color.as_str()],
            )
            .context("Failed to upsert board color")?;
        tracing::debug!(project_type, board = board_name, %color, "board color set");
        Ok(BoardColorMapping {
            project_type: project_type.to_string(),
            board_name: board_name.to_string(),
            color,
        })
    }

    /// Boards of a project type with their ticket cards.
    pub fn board_view(&self, project_type: &str) -> Result<BoardView> {
        let boards = self.list_boards(project_type)?;
        let fields = self.list_active_fields(project_type)?;
        let mut by_board: BTreeMap<String, Vec<TicketCard>> = BTreeMap::new();
        for ticket in self.list_tickets(project_type)? {
            by_board
                .entry(ticket.board_name.clone())
                .or_default()
                .push(TicketCard::from_ticket(&ticket, &fields));
        }
        let columns = boards
            .into_iter()
            .map(|board| ColumnView {
                tickets: by_board.remove(&board.name).unwrap_or_default(),
                board,
            })
            .collect();
        Ok(BoardView {
            project_type: project_type.to_string(),
            columns,
        })
    }
}

/// A reserved board that has not been written yet, as reads present it.
fn unsaved_reserved(project_type: &str, reserved: ReservedBoard) -> Board {
    Board {
        project_type: project_type.to_string(),
        name: reserved.name().to_string(),
        position: ReservedBoard::ALL.iter().position(|r| *r == reserved).unwrap_or_default() as i32,
        color: reserved.default_color(),
        reserved: true,
        created_at: Utc::now(),
    }
}

fn insert_board(
    conn: &Connection,
    project_type: &str,
    name: &str,
    position: i32,
    color: Option<BoardColor>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO boards (project_type, name, position, reserved, created_at) VALUES (?1, ?2, ?3, 0, ?4)",
        params![project_type, name, position, Utc::now().to_rfc3339()],
    )
    .context("Failed to insert board")?;
    if let Some(color) = color {
        conn.execute(
            "INSERT OR REPLACE INTO board_colors (project_type, board_name, color) VALUES (?1, ?2, ?3)",
            params![project_type, name, color.as_str()],
        )
        .context("Failed to insert board color")?;
    }
    Ok(())
}

/// Give each board in `order` its index as position.
fn write_positions(conn: &Connection, project_type: &str, order: &[&str]) -> Result<()> {
    for (position, name) in order.iter().enumerate() {
        conn.execute(
            "UPDATE boards SET position = ?1 WHERE project_type = ?2 AND name = ?3",
            params![position as i32, project_type, name],
        )
        .context("Failed to update board position")?;
    }
    Ok(())
}
