use {
    burrow_common::{Error, Result, time::now_ms},
    sqlx::SqlitePool,
};

use crate::types::{
    Container, InitStatus, InjectionOutcome, LifecycleStatus, PortMapping, ProxyDescriptor,
    SelectedTemplates,
};

/// SQLite persistence for container records.
///
/// Scalar attributes map to columns; nested lists (ports, proxy, selected
/// templates, injection outcome) are stored as JSON blobs.
pub struct ContainerStore {
    pool: SqlitePool,
}

impl ContainerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS containers (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL UNIQUE,
                runtime_id      TEXT NOT NULL DEFAULT '',
                status          TEXT NOT NULL,
                init_status     TEXT NOT NULL,
                init_message    TEXT,
                git_url         TEXT,
                repo_name       TEXT,
                work_dir        TEXT NOT NULL,
                memory_bytes    INTEGER NOT NULL,
                cpu_cores       REAL NOT NULL,
                ports           TEXT NOT NULL DEFAULT '[]',
                proxy           TEXT,
                editor_enabled  INTEGER NOT NULL DEFAULT 0,
                credential_id   TEXT,
                env_profile_id  TEXT,
                command_profile_id TEXT,
                templates       TEXT NOT NULL DEFAULT '{}',
                skip_git_repo   INTEGER NOT NULL DEFAULT 0,
                permissive_mode INTEGER NOT NULL DEFAULT 0,
                run_as_root     INTEGER NOT NULL DEFAULT 0,
                injection       TEXT NOT NULL DEFAULT '{}',
                created_at      INTEGER NOT NULL,
                started_at      INTEGER,
                stopped_at      INTEGER,
                initialized_at  INTEGER
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_containers_runtime_id ON containers(runtime_id)",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn insert(&self, container: &Container) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO containers (
                id, name, runtime_id, status, init_status, init_message,
                git_url, repo_name, work_dir, memory_bytes, cpu_cores, ports,
                proxy, editor_enabled, credential_id, env_profile_id,
                command_profile_id, templates, skip_git_repo, permissive_mode,
                run_as_root, injection, created_at, started_at, stopped_at,
                initialized_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&container.id)
        .bind(&container.name)
        .bind(&container.runtime_id)
        .bind(container.status.as_str())
        .bind(container.init_status.as_str())
        .bind(&container.init_message)
        .bind(&container.git_url)
        .bind(&container.repo_name)
        .bind(&container.work_dir)
        .bind(container.memory_bytes)
        .bind(container.cpu_cores)
        .bind(serde_json::to_string(&container.ports).unwrap_or_else(|_| "[]".into()))
        .bind(
            container
                .proxy
                .as_ref()
                .and_then(|p| serde_json::to_string(p).ok()),
        )
        .bind(container.editor_enabled as i32)
        .bind(&container.credential_id)
        .bind(&container.env_profile_id)
        .bind(&container.command_profile_id)
        .bind(serde_json::to_string(&container.templates).unwrap_or_else(|_| "{}".into()))
        .bind(container.skip_git_repo as i32)
        .bind(container.permissive_mode as i32)
        .bind(container.run_as_root as i32)
        .bind(serde_json::to_string(&container.injection).unwrap_or_else(|_| "{}".into()))
        .bind(container.created_at_ms as i64)
        .bind(container.started_at_ms.map(|v| v as i64))
        .bind(container.stopped_at_ms.map(|v| v as i64))
        .bind(container.initialized_at_ms.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Error::conflict(format!("container '{}' already exists", container.name))
            },
            other => other.into(),
        })?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Container> {
        let row = sqlx::query_as::<_, ContainerRow>("SELECT * FROM containers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ContainerRow::into_container)
            .transpose()?
            .ok_or_else(|| Error::not_found(format!("container {id} not found")))
    }

    pub async fn get_by_runtime_id(&self, runtime_id: &str) -> Result<Option<Container>> {
        let row =
            sqlx::query_as::<_, ContainerRow>("SELECT * FROM containers WHERE runtime_id = ?")
                .bind(runtime_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(ContainerRow::into_container).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Container>> {
        let rows =
            sqlx::query_as::<_, ContainerRow>("SELECT * FROM containers ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(ContainerRow::into_container).collect()
    }

    pub async fn set_runtime_id(&self, id: &str, runtime_id: &str) -> Result<()> {
        sqlx::query("UPDATE containers SET runtime_id = ? WHERE id = ?")
            .bind(runtime_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: LifecycleStatus) -> Result<()> {
        let (started, stopped) = match status {
            LifecycleStatus::Running => (Some(now_ms() as i64), None),
            LifecycleStatus::Stopped => (None, Some(now_ms() as i64)),
            _ => (None, None),
        };
        sqlx::query(
            "UPDATE containers SET status = ?,
                 started_at = COALESCE(?, started_at),
                 stopped_at = COALESCE(?, stopped_at)
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(started)
        .bind(stopped)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_init_status(
        &self,
        id: &str,
        status: InitStatus,
        message: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE containers SET init_status = ?, init_message = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(message)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Single-statement transition to Ready: init status, injection outcome
    /// and the initialized timestamp land together.
    pub async fn set_ready(&self, id: &str, injection: &InjectionOutcome) -> Result<()> {
        sqlx::query(
            "UPDATE containers
             SET init_status = ?, init_message = NULL, injection = ?, initialized_at = ?
             WHERE id = ?",
        )
        .bind(InitStatus::Ready.as_str())
        .bind(serde_json::to_string(injection).unwrap_or_else(|_| "{}".into()))
        .bind(now_ms() as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM containers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ContainerRow {
    id: String,
    name: String,
    runtime_id: String,
    status: String,
    init_status: String,
    init_message: Option<String>,
    git_url: Option<String>,
    repo_name: Option<String>,
    work_dir: String,
    memory_bytes: i64,
    cpu_cores: f64,
    ports: String,
    proxy: Option<String>,
    editor_enabled: i32,
    credential_id: Option<String>,
    env_profile_id: Option<String>,
    command_profile_id: Option<String>,
    templates: String,
    skip_git_repo: i32,
    permissive_mode: i32,
    run_as_root: i32,
    injection: String,
    created_at: i64,
    started_at: Option<i64>,
    stopped_at: Option<i64>,
    initialized_at: Option<i64>,
}

impl ContainerRow {
    fn into_container(self) -> Result<Container> {
        let status = LifecycleStatus::parse(&self.status)
            .ok_or_else(|| Error::message(format!("unknown container status '{}'", self.status)))?;
        let init_status = InitStatus::parse(&self.init_status)
            .ok_or_else(|| Error::message(format!("unknown init status '{}'", self.init_status)))?;
        let ports: Vec<PortMapping> = serde_json::from_str(&self.ports).unwrap_or_default();
        let proxy: Option<ProxyDescriptor> = self
            .proxy
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        let templates: SelectedTemplates =
            serde_json::from_str(&self.templates).unwrap_or_default();
        let injection: InjectionOutcome =
            serde_json::from_str(&self.injection).unwrap_or_default();

        Ok(Container {
            id: self.id,
            name: self.name,
            runtime_id: self.runtime_id,
            status,
            init_status,
            init_message: self.init_message,
            git_url: self.git_url,
            repo_name: self.repo_name,
            work_dir: self.work_dir,
            memory_bytes: self.memory_bytes,
            cpu_cores: self.cpu_cores,
            ports,
            proxy,
            editor_enabled: self.editor_enabled != 0,
            credential_id: self.credential_id,
            env_profile_id: self.env_profile_id,
            command_profile_id: self.command_profile_id,
            templates,
            skip_git_repo: self.skip_git_repo != 0,
            permissive_mode: self.permissive_mode != 0,
            run_as_root: self.run_as_root != 0,
            injection,
            created_at_ms: self.created_at as u64,
            started_at_ms: self.started_at.map(|v| v as u64),
            stopped_at_ms: self.stopped_at.map(|v| v as u64),
            initialized_at_ms: self.initialized_at.map(|v| v as u64),
        })
    }
}
