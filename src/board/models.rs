use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::activity::{self, ActivityKind, ActivityLog};

/// Terminal board for finished work.
pub const DONE_BOARD: &str = "Concluídas";
/// Terminal board for abandoned work.
pub const CANCELLED_BOARD: &str = "Canceladas";

/// One of the two terminal boards every project type carries.
///
/// Reserved boards cannot be renamed or deleted, no board may be renamed to
/// their names, and they always sort after every other board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservedBoard {
    Done,
    Cancelled,
}

impl ReservedBoard {
    pub const ALL: [ReservedBoard; 2] = [Self::Done, Self::Cancelled];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Done => DONE_BOARD,
            Self::Cancelled => CANCELLED_BOARD,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            DONE_BOARD => Some(Self::Done),
            CANCELLED_BOARD => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn default_color(&self) -> BoardColor {
        match self {
            Self::Done => BoardColor::Green,
            Self::Cancelled => BoardColor::Red,
        }
    }

    /// Activity recorded when a ticket lands on this board.
    pub fn arrival_activity(&self) -> ActivityKind {
        match self {
            Self::Done => ActivityKind::Completed,
            Self::Cancelled => ActivityKind::Cancelled,
        }
    }
}

pub fn is_reserved(name: &str) -> bool {
    ReservedBoard::from_name(name).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardColor {
    #[default]
    Gray,
    Blue,
    Green,
    Yellow,
    Orange,
    Red,
    Purple,
    Pink,
    Teal,
}

impl BoardColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gray => "gray",
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Orange => "orange",
            Self::Red => "red",
            Self::Purple => "purple",
            Self::Pink => "pink",
            Self::Teal => "teal",
        }
    }
}

impl std::fmt::Display for BoardColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoardColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gray" => Ok(Self::Gray),
            "blue" => Ok(Self::Blue),
            "green" => Ok(Self::Green),
            "yellow" => Ok(Self::Yellow),
            "orange" => Ok(Self::Orange),
            "red" => Ok(Self::Red),
            "purple" => Ok(Self::Purple),
            "pink" => Ok(Self::Pink),
            "teal" => Ok(Self::Teal),
            _ => Err(format!("Invalid board color: {}", s)),
        }
    }
}

/// A named column of a project type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub project_type: String,
    pub name: String,
    pub position: i32,
    pub color: BoardColor,
    pub reserved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardColorMapping {
    pub project_type: String,
    pub board_name: String,
    pub color: BoardColor,
}

// ── Field configuration ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    LongText,
    Number,
    Date,
    Dropdown,
    Checkbox,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::LongText => "long_text",
            Self::Number => "number",
            Self::Date => "date",
            Self::Dropdown => "dropdown",
            Self::Checkbox => "checkbox",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "long_text" => Ok(Self::LongText),
            "number" => Ok(Self::Number),
            "date" => Ok(Self::Date),
            "dropdown" => Ok(Self::Dropdown),
            "checkbox" => Ok(Self::Checkbox),
            _ => Err(format!("Invalid field type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOption {
    pub value: String,
    pub label: String,
}

/// Schema entry describing one extra attribute tickets of a project type carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub id: i64,
    pub project_type: String,
    /// Display label.
    pub label: String,
    /// Storage key inside `Ticket::field_values`, unique per project type.
    pub field_name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub searchable: bool,
    pub active: bool,
    pub visible_on_card: bool,
    pub options: Vec<FieldOption>,
    pub position: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFieldConfig {
    pub label: String,
    pub field_name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub searchable: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub visible_on_card: bool,
    #[serde(default)]
    pub options: Vec<FieldOption>,
    pub position: Option<i32>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldConfigUpdate {
    pub label: Option<String>,
    pub field_name: Option<String>,
    pub field_type: Option<FieldType>,
    pub required: Option<bool>,
    pub searchable: Option<bool>,
    pub active: Option<bool>,
    pub visible_on_card: Option<bool>,
    pub options: Option<Vec<FieldOption>>,
    pub position: Option<i32>,
}

/// A typed value in a ticket's field bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Bool(bool),
    /// The `value` of one of a dropdown's options.
    Choice(String),
}

impl FieldValue {
    /// Plain-text rendering used for search and card display.
    pub fn display(&self) -> String {
        match self {
            Self::Text(s) | Self::Choice(s) => s.clone(),
            Self::Number(n) => n.to_string(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

// ── Tickets ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub file_name: String,
    pub url: String,
    pub size_bytes: Option<u64>,
    pub uploaded_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingItem {
    pub id: Uuid,
    pub text: String,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

/// The primary work item tracked on a board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub project_type: String,
    pub name: String,
    pub board_name: String,
    pub field_values: BTreeMap<String, FieldValue>,
    pub members: BTreeSet<String>,
    pub labels: BTreeSet<String>,
    pub due_date: Option<NaiveDate>,
    pub comments: Vec<Comment>,
    pub attachments: Vec<Attachment>,
    pub pending_items: Vec<PendingItem>,
    pub activity: ActivityLog,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Record an activity entry attributed to `actor`.
    pub fn log(&mut self, actor: &str, kind: ActivityKind) {
        let entry = activity::record(kind, actor, self.id, &self.name);
        self.activity.push(entry);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTicket {
    pub name: String,
    pub board_name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub members: BTreeSet<String>,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TicketUpdate {
    pub name: Option<String>,
    pub labels: Option<BTreeSet<String>>,
    pub members: Option<BTreeSet<String>>,
    /// `Some(None)` clears the due date.
    #[serde(default, with = "double_option")]
    pub due_date: Option<Option<NaiveDate>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAttachment {
    pub file_name: String,
    pub url: String,
    pub size_bytes: Option<u64>,
}

/// Distinguishes an absent key from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

// API view types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardView {
    pub project_type: String,
    pub columns: Vec<ColumnView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnView {
    pub board: Board,
    pub tickets: Vec<TicketCard>,
}

/// Compact ticket rendering for board columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketCard {
    pub id: Uuid,
    pub name: String,
    pub labels: BTreeSet<String>,
    pub members: BTreeSet<String>,
    pub due_date: Option<NaiveDate>,
    pub card_fields: Vec<CardField>,
    pub pending_done: usize,
    pub pending_total: usize,
    pub comment_count: usize,
    pub attachment_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardField {
    pub field_name: String,
    pub label: String,
    pub value: FieldValue,
}

impl TicketCard {
    /// Build a card showing the values of the `visible_on_card` fields in `fields`.
    pub fn from_ticket(ticket: &Ticket, fields: &[FieldConfig]) -> Self {
        let card_fields = fields
            .iter()
            .filter(|f| f.visible_on_card)
            .filter_map(|f| {
                ticket.field_values.get(&f.field_name).map(|value| CardField {
                    field_name: f.field_name.clone(),
                    label: f.label.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        Self {
            id: ticket.id,
            name: ticket.name.clone(),
            labels: ticket.labels.clone(),
            members: ticket.members.clone(),
            due_date: ticket.due_date,
            card_fields,
            pending_done: ticket.pending_items.iter().filter(|p| p.completed).count(),
            pending_total: ticket.pending_items.len(),
            comment_count: ticket.comments.len(),
            attachment_count: ticket.attachments.len(),
            updated_at: ticket.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_board_names() {
        assert_eq!(ReservedBoard::from_name("Concluídas"), Some(ReservedBoard::Done));
        assert_eq!(ReservedBoard::from_name("Canceladas"), Some(ReservedBoard::Cancelled));
        assert_eq!(ReservedBoard::from_name("concluídas"), None);
        assert!(is_reserved(DONE_BOARD));
        assert!(!is_reserved("Triagem"));
        for reserved in ReservedBoard::ALL {
            assert_eq!(ReservedBoard::from_name(reserved.name()), Some(reserved));
        }
    }

    #[test]
    fn test_board_color_parse() {
        assert_eq!("teal".parse::<BoardColor>().unwrap(), BoardColor::Teal);
        assert_eq!(BoardColor::default(), BoardColor::Gray);
        assert!("magenta".parse::<BoardColor>().is_err());
    }

    #[test]
    fn test_field_type_parse() {
        assert_eq!("long_text".parse::<FieldType>().unwrap(), FieldType::LongText);
        assert_eq!(FieldType::Dropdown.to_string(), "dropdown");
        assert!("select".parse::<FieldType>().is_err());
    }

    #[test]
    fn test_field_value_serde_is_tagged() {
        let date = FieldValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let json = serde_json::to_value(&date).unwrap();
        assert_eq!(json, serde_json::json!({"type": "date", "value": "2024-03-01"}));
        let back: FieldValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, date);

        // Text that looks like a date stays text
        let text = FieldValue::Text("2024-03-01".into());
        let back: FieldValue = serde_json::from_str(&serde_json::to_string(&text).unwrap()).unwrap();
        assert_eq!(back, text);
    }

    #[test]
    fn test_ticket_update_due_date_null_vs_absent() {
        let absent: TicketUpdate = serde_json::from_str(r#"{"name": "x"}"#).unwrap();
        assert_eq!(absent.due_date, None);
        let cleared: TicketUpdate = serde_json::from_str(r#"{"due_date": null}"#).unwrap();
        assert_eq!(cleared.due_date, Some(None));
        let set: TicketUpdate = serde_json::from_str(r#"{"due_date": "2025-01-31"}"#).unwrap();
        assert_eq!(set.due_date, Some(NaiveDate::from_ymd_opt(2025, 1, 31)));
    }

    #[test]
    fn test_new_field_config_defaults() {
        let cfg: NewFieldConfig = serde_json::from_str(
            r#"{"label": "Custas", "field_name": "custas", "field_type": "text"}"#,
        )
        .unwrap();
        assert!(cfg.active);
        assert!(!cfg.required);
        assert!(cfg.options.is_empty());
        assert_eq!(cfg.position, None);
    }
}
