use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::{BoardDb, FieldConfigRow};
use crate::board::fields::validate_definition;
use crate::board::models::*;
use crate::errors::BoardError;

impl BoardDb {
    /// All field configs of a project type, active or not, in display order.
    pub fn list_fields(&self, project_type: &str) -> Result<Vec<FieldConfig>> {
        self.query_fields(project_type, false)
    }

    pub fn list_active_fields(&self, project_type: &str) -> Result<Vec<FieldConfig>> {
        self.query_fields(project_type, true)
    }

    fn query_fields(&self, project_type: &str, active_only: bool) -> Result<Vec<FieldConfig>> {
        let sql = format!(
            "SELECT {} FROM field_configs WHERE project_type = ?1 {} ORDER BY position, id",
            FieldConfigRow::COLUMNS,
            if active_only { "AND active = 1" } else { "" }
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare field config query")?;
        let rows = stmt
            .query_map(params![project_type], FieldConfigRow::from_row)
            .context("Failed to query field configs")?;
        let mut fields = Vec::new();
        for row in rows {
            let r = row.context("Failed to read field config row")?;
            fields.push(r.into_field_config()?);
        }
        Ok(fields)
    }

    pub fn get_field(&self, project_type: &str, id: i64) -> Result<Option<FieldConfig>> {
        let sql = format!(
            "SELECT {} FROM field_configs WHERE project_type = ?1 AND id = ?2",
            FieldConfigRow::COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![project_type, id], FieldConfigRow::from_row)
            .optional()
            .context("Failed to query field config")?;
        row.map(FieldConfigRow::into_field_config).transpose()
    }

    fn require_field(&self, project_type: &str, id: i64) -> Result<FieldConfig> {
        self.get_field(project_type, id)?
            .ok_or_else(|| BoardError::not_found(format!("Field config {}", id)).into())
    }

    fn field_name_taken(&self, project_type: &str, field_name: &str, except: Option<i64>) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM field_configs
                 WHERE project_type = ?1 AND field_name = ?2 AND id != ?3",
                params![project_type, field_name, except.unwrap_or(-1)],
                |row| row.get(0),
            )
            .context("Failed to check field name")
    }

    pub fn create_field(&self, project_type: &str, new: NewFieldConfig) -> Result<FieldConfig> {
        self.ensure_project_type(project_type)?;
        let position = match new.position {
            Some(p) => p,
            None => self
                .conn
                .query_row(
                    "SELECT COALESCE(MAX(position), -1) + 1 FROM field_configs WHERE project_type = ?1",
                    params![project_type],
                    |row| row.get(0),
                )
                .context("Failed to compute field position")?,
        };
        let mut config = FieldConfig {
            id: 0,
            project_type: project_type.to_string(),
            label: new.label.trim().to_string(),
            field_name: new.field_name.trim().to_string(),
            field_type: new.field_type,
            required: new.required,
            searchable: new.searchable,
            active: new.active,
            visible_on_card: new.visible_on_card,
            options: new.options,
            position,
        };
        validate_definition(&config)?;
        if self.field_name_taken(project_type, &config.field_name, None)? {
            return Err(BoardError::Conflict(format!(
                "Field '{}' already exists for project type '{}'",
                config.field_name, project_type
            ))
            .into());
        }

        let options = serde_json::to_string(&config.options).context("Failed to serialize field options")?;
        self.conn
            .execute(
                "INSERT INTO field_configs (project_type, field_name, label, field_type, required, searchable,
                     active, visible_on_card, options, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    project_type,
                    config.field_name,
                    config.label,
                    config.field_type.as_str(),
                    config.required,
                    config.searchable,
                    config.active,
                    config.visible_on_card,
                    options,
                    config.position,
                ],
            )
            .context("Failed to insert field config")?;
        config.id = self.conn.last_insert_rowid();
        tracing::info!(project_type, field = %config.field_name, id = config.id, "field config created");
        Ok(config)
    }

    /// Apply a partial update. Values already stored on tickets are left as they are.
    pub fn update_field(&self, project_type: &str, id: i64, update: FieldConfigUpdate) -> Result<FieldConfig> {
        let mut config = self.require_field(project_type, id)?;
        if let Some(label) = update.label {
            config.label = label.trim().to_string();
        }
        if let Some(field_name) = update.field_name {
            config.field_name = field_name.trim().to_string();
        }
        if let Some(field_type) = update.field_type {
            config.field_type = field_type;
        }
        if let Some(required) = update.required {
            config.required = required;
        }
        if let Some(searchable) = update.searchable {
            config.searchable = searchable;
        }
        if let Some(active) = update.active {
            config.active = active;
        }
        if let Some(visible_on_card) = update.visible_on_card {
            config.visible_on_card = visible_on_card;
        }
        if let Some(options) = update.options {
            config.options = options;
        }
        if let Some(position) = update.position {
            config.position = position;
        }
        validate_definition(&config)?;
        if self.field_name_taken(project_type, &config.field_name, Some(id))? {
            return Err(BoardError::Conflict(format!("Field '{}' already exists", config.field_name)).into());
        }

        let options = serde_json::to_string(&config.options).context("Failed to serialize field options")?;
        self.conn
            .execute(
                "UPDATE field_configs SET field_name = ?1, label = ?2, field_type = ?3, required = ?4,
                     searchable = ?5, active = ?6, visible_on_card = ?7, options = ?8, position = ?9
                 WHERE id = ?10",
                params![
                    config.field_name,
                    config.label,
                    config.field_type.as_str(),
                    config.required,
                    config.searchable,
                    config.active,
                    config.visible_on_card,
                    options,
                    config.position,
                    id,
                ],
            )
            .context("Failed to update field config")?;
        tracing::info!(project_type, id, "field config updated");
        Ok(config)
    }

    pub fn delete_field(&self, project_type: &str, id: i64) -> Result<()> {
        let count = self
            .conn
            .execute(
                "DELETE FROM field_configs WHERE project_type = ?1 AND id = ?2",
                params![project_type, id],
            )
            .context("Failed to delete field config")?;
        if count == 0 {
            return Err(BoardError::not_found(format!("Field config {}", id)).into());
        }
        tracing::info!(project_type, id, "field config deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::db::BoardDb;

    const PT: &str = "registro";

    fn new_field(name: &str, field_type: FieldType) -> NewFieldConfig {
        NewFieldConfig {
            label: name.to_uppercase(),
            field_name: name.to_string(),
            field_type,
            required: false,
            searchable: false,
            active: true,
            visible_on_card: false,
            options: vec![],
            position: None,
        }
    }

    fn kind_of(err: &anyhow::Error) -> &BoardError {
        BoardError::find(err).expect("expected a BoardError")
    }

    #[test]
    fn test_create_and_list_fields_in_position_order() -> Result<()> {
        let db = BoardDb::new_in_memory()?;
        let a = db.create_field(PT, new_field("matricula", FieldType::Text))?;
        let b = db.create_field(PT, new_field("valor", FieldType::Number))?;
        let mut first = new_field("protocolo", FieldType::Text);
        first.position = Some(-1);
        db.create_field(PT, first)?;

        assert_eq!(a.position, 0);
        assert_eq!(b.position, 1);
        let names: Vec<String> = db.list_fields(PT)?.into_iter().map(|f| f.field_name).collect();
        assert_eq!(names, vec!["protocolo", "matricula", "valor"]);
        assert!(db.list_fields("outro")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_duplicate_field_name_is_conflict() -> Result<()> {
        let db = BoardDb::new_in_memory()?;
        db.create_field(PT, new_field("matricula", FieldType::Text))?;
        let err = db.create_field(PT, new_field("matricula", FieldType::Number)).unwrap_err();
        assert!(matches!(kind_of(&err), BoardError::Conflict(_)));

        // Same name under another project type is fine.
        db.create_field("escritura", new_field("matricula", FieldType::Text))?;
        Ok(())
    }

    #[test]
    fn test_invalid_definitions_are_rejected() -> Result<()> {
        let db = BoardDb::new_in_memory()?;
        let err = db.create_field(PT, new_field("tipo", FieldType::Dropdown)).unwrap_err();
        assert!(matches!(kind_of(&err), BoardError::Validation(_)));

        let err = db.create_field(PT, new_field("nome mae", FieldType::Text)).unwrap_err();
        assert!(matches!(kind_of(&err), BoardError::Validation(_)));

        let mut dropdown = new_field("tipo", FieldType::Dropdown);
        dropdown.options = vec![FieldOption {
            value: "nasc".into(),
            label: "Nascimento".into(),
        }];
        let created = db.create_field(PT, dropdown)?;
        assert_eq!(created.options.len(), 1);
        Ok(())
    }

    #[test]
    fn test_update_field_partial() -> Result<()> {
        let db = BoardDb::new_in_memory()?;
        let f = db.create_field(PT, new_field("matricula", FieldType::Text))?;
        let updated = db.update_field(
            PT,
            f.id,
            FieldConfigUpdate {
                label: Some("Matrícula".into()),
                searchable: Some(true),
                ..Default::default()
            },
        )?;
        assert_eq!(updated.label, "Matrícula");
        assert!(updated.searchable);
        assert_eq!(updated.field_type, FieldType::Text);

        let stored = db.get_field(PT, f.id)?.unwrap();
        assert_eq!(stored.label, "Matrícula");
        Ok(())
    }

    #[test]
    fn test_update_field_rename_collision() -> Result<()> {
        let db = BoardDb::new_in_memory()?;
        db.create_field(PT, new_field("matricula", FieldType::Text))?;
        let f = db.create_field(PT, new_field("livro", FieldType::Text))?;
        let err = db
            .update_field(
                PT,
                f.id,
                FieldConfigUpdate {
                    field_name: Some("matricula".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(kind_of(&err), BoardError::Conflict(_)));
        Ok(())
    }

    #[test]
    fn test_inactive_fields_are_excluded_from_active_list() -> Result<()> {
        let db = BoardDb::new_in_memory()?;
        let f = db.create_field(PT, new_field("matricula", FieldType::Text))?;
        db.update_field(
            PT,
            f.id,
            FieldConfigUpdate {
                active: Some(false),
                ..Default::default()
            },
        )?;
        assert_eq!(db.list_fields(PT)?.len(), 1);
        assert!(db.list_active_fields(PT)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_delete_field() -> Result<()> {
        let db = BoardDb::new_in_memory()?;
        let f = db.create_field(PT, new_field("matricula", FieldType::Text))?;
        db.delete_field(PT, f.id)?;
        assert!(db.get_field(PT, f.id)?.is_none());

        let err = db.delete_field(PT, f.id).unwrap_err();
        assert!(matches!(kind_of(&err), BoardError::NotFound(_)));
        let err = db.update_field(PT, f.id, FieldConfigUpdate::default()).unwrap_err();
        assert!(matches!(kind_of(&err), BoardError::NotFound(_)));
        Ok(())
    }
}
