use {
    burrow_common::{Error, Result, time::now_ms},
    sqlx::SqlitePool,
};

use crate::{
    types::{ConfigTemplate, NewTemplate, TemplateKind, TemplatePatch},
    validate::validate_content,
};

/// SQLite-backed template catalog.
pub struct TemplateStore {
    pool: SqlitePool,
}

impl TemplateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the catalog schema.
    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS config_templates (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                kind        TEXT NOT NULL,
                description TEXT,
                content     TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                UNIQUE(name, kind)
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn create(&self, input: NewTemplate) -> Result<ConfigTemplate> {
        if input.name.trim().is_empty() {
            return Err(Error::validation("template name cannot be empty"));
        }
        validate_content(input.kind, &input.content)?;

        if self.find(&input.name, input.kind).await?.is_some() {
            return Err(Error::conflict(format!(
                "template '{}' already exists for kind {}",
                input.name,
                input.kind.as_str()
            )));
        }

        let now = now_ms();
        let template = ConfigTemplate {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name,
            kind: input.kind,
            description: input.description,
            content: input.content,
            created_at_ms: now,
            updated_at_ms: now,
        };

        sqlx::query(
            "INSERT INTO config_templates (id, name, kind, description, content, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(template.kind.as_str())
        .bind(&template.description)
        .bind(&template.content)
        .bind(template.created_at_ms as i64)
        .bind(template.updated_at_ms as i64)
        .execute(&self.pool)
        .await?;

        Ok(template)
    }

    pub async fn get(&self, id: &str) -> Result<ConfigTemplate> {
        let row = sqlx::query_as::<_, TemplateRow>("SELECT * FROM config_templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TemplateRow::into_template)
            .transpose()?
            .ok_or_else(|| Error::not_found(format!("template {id} not found")))
    }

    pub async fn list(&self, kind: Option<TemplateKind>) -> Result<Vec<ConfigTemplate>> {
        let rows = match kind {
            Some(k) => {
                sqlx::query_as::<_, TemplateRow>(
                    "SELECT * FROM config_templates WHERE kind = ? ORDER BY name",
                )
                .bind(k.as_str())
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as::<_, TemplateRow>(
                    "SELECT * FROM config_templates ORDER BY kind, name",
                )
                .fetch_all(&self.pool)
                .await?
            },
        };
        rows.into_iter().map(TemplateRow::into_template).collect()
    }

    /// Partial update. Content and kind changes trigger re-validation; a
    /// name or kind change re-checks `(name, kind)` uniqueness.
    pub async fn update(&self, id: &str, patch: TemplatePatch) -> Result<ConfigTemplate> {
        let mut template = self.get(id).await?;

        let next_name = patch.name.unwrap_or_else(|| template.name.clone());
        let next_kind = patch.kind.unwrap_or(template.kind);
        let next_content = patch.content.unwrap_or_else(|| template.content.clone());

        if next_name.trim().is_empty() {
            return Err(Error::validation("template name cannot be empty"));
        }
        if next_kind != template.kind || next_content != template.content {
            validate_content(next_kind, &next_content)?;
        }
        if next_name != template.name || next_kind != template.kind {
            if let Some(other) = self.find(&next_name, next_kind).await?
                && other.id != template.id
            {
                return Err(Error::conflict(format!(
                    "template '{next_name}' already exists for kind {}",
                    next_kind.as_str()
                )));
            }
        }

        template.name = next_name;
        template.kind = next_kind;
        template.content = next_content;
        if let Some(description) = patch.description {
            template.description = Some(description);
        }
        template.updated_at_ms = now_ms();

        sqlx::query(
            "UPDATE config_templates
             SET name = ?, kind = ?, description = ?, content = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&template.name)
        .bind(template.kind.as_str())
        .bind(&template.description)
        .bind(&template.content)
        .bind(template.updated_at_ms as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(template)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM config_templates WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("template {id} not found")));
        }
        Ok(())
    }

    async fn find(&self, name: &str, kind: TemplateKind) -> Result<Option<ConfigTemplate>> {
        let row = sqlx::query_as::<_, TemplateRow>(
            "SELECT * FROM config_templates WHERE name = ? AND kind = ?",
        )
        .bind(name)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TemplateRow::into_template).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: String,
    name: String,
    kind: String,
    description: Option<String>,
    content: String,
    created_at: i64,
    updated_at: i64,
}

impl TemplateRow {
    fn into_template(self) -> Result<ConfigTemplate> {
        let kind = TemplateKind::parse(&self.kind)
            .ok_or_else(|| Error::message(format!("unknown template kind '{}'", self.kind)))?;
        Ok(ConfigTemplate {
            id: self.id,
            name: self.name,
            kind,
            description: self.description,
            content: self.content,
            created_at_ms: self.created_at as u64,
            updated_at_ms: self.updated_at as u64,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn store() -> TemplateStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        TemplateStore::init(&pool).await.unwrap();
        TemplateStore::new(pool)
    }

    fn instructions(name: &str) -> NewTemplate {
        NewTemplate {
            name: name.into(),
            kind: TemplateKind::Instructions,
            description: None,
            content: "# hi".into(),
        }
    }

    #[tokio::test]
    async fn create_get_list_delete() {
        let store = store().await;
        let created = store.create(instructions("x")).await.unwrap();
        assert_eq!(store.get(&created.id).await.unwrap().name, "x");
        assert_eq!(store.list(None).await.unwrap().len(), 1);
        store.delete(&created.id).await.unwrap();
        assert!(store.get(&created.id).await.is_err());
    }

    #[tokio::test]
    async fn name_unique_within_kind_only() {
        let store = store().await;
        store.create(instructions("x")).await.unwrap();

        // Same (name, kind) is a conflict.
        let err = store.create(instructions("x")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Same name under another kind is fine.
        store
            .create(NewTemplate {
                name: "x".into(),
                kind: TemplateKind::Command,
                description: None,
                content: "echo".into(),
            })
            .await
            .unwrap();
        assert_eq!(store.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mcp_validation_gates_create_and_update() {
        let store = store().await;
        let bad = NewTemplate {
            name: "srv".into(),
            kind: TemplateKind::McpServer,
            description: None,
            content: r#"{"command": "npx"}"#.into(),
        };
        assert!(matches!(
            store.create(bad).await.unwrap_err(),
            Error::Validation(_)
        ));

        let good = NewTemplate {
            name: "srv".into(),
            kind: TemplateKind::McpServer,
            description: None,
            content: r#"{"command": "npx", "args": ["-y", "server"]}"#.into(),
        };
        let created = store.create(good).await.unwrap();

        let err = store
            .update(
                &created.id,
                TemplatePatch {
                    content: Some("{}".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn update_kind_revalidates() {
        let store = store().await;
        let created = store.create(instructions("x")).await.unwrap();
        // Instructions text is not valid skill content.
        let err = store
            .update(
                &created.id,
                TemplatePatch {
                    kind: Some(TemplateKind::Skill),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn update_rename_checks_uniqueness() {
        let store = store().await;
        store.create(instructions("a")).await.unwrap();
        let b = store.create(instructions("b")).await.unwrap();
        let err = store
            .update(
                &b.id,
                TemplatePatch {
                    name: Some("a".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
