use {
    burrow_common::{Error, Result},
    sqlx::SqlitePool,
    tracing::debug,
};

/// Host port reservations. Uniqueness is enforced by the primary key, so
/// two concurrent allocations of the same port cannot both succeed; the
/// loser retries with the next candidate.
pub struct PortAllocator {
    pool: SqlitePool,
}

impl PortAllocator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ports (
                port         INTEGER PRIMARY KEY,
                container_id TEXT NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Reserve a specific port for a container.
    pub async fn reserve(&self, port: u16, container_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO ports (port, container_id) VALUES (?, ?)")
            .bind(port as i64)
            .bind(container_id)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    Error::conflict(format!("port {port} is already bound"))
                },
                other => other.into(),
            })?;
        Ok(())
    }

    /// Reserve the first free port in `[start, end]`, retrying past ports
    /// that another allocation claims concurrently.
    pub async fn allocate_in_range(
        &self,
        start: u16,
        end: u16,
        container_id: &str,
    ) -> Result<u16> {
        for port in start..=end {
            match self.reserve(port, container_id).await {
                Ok(()) => {
                    debug!(port, container_id, "allocated host port");
                    return Ok(port);
                },
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(format!(
            "no free port in range {start}-{end}"
        )))
    }

    /// Release every reservation held by a container.
    pub async fn release_for_container(&self, container_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM ports WHERE container_id = ?")
            .bind(container_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
