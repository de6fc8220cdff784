use {
    burrow_common::{Result, time::now_ms},
    sqlx::{Row, SqlitePool},
};

use crate::types::MonitorConfig;

/// Persisted per-container monitoring policy, so a re-enabled session
/// starts from the last saved configuration.
pub struct MonitorConfigStore {
    pool: SqlitePool,
}

impl MonitorConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS monitor_configs (
                container_id TEXT PRIMARY KEY,
                config       TEXT NOT NULL,
                updated_at   INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn save(&self, container_id: &str, config: &MonitorConfig) -> Result<()> {
        let raw = serde_json::to_string(config)
            .map_err(|e| burrow_common::Error::message(format!("serialize config: {e}")))?;
        sqlx::query(
            "INSERT INTO monitor_configs (container_id, config, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(container_id) DO UPDATE SET
               config = excluded.config, updated_at = excluded.updated_at",
        )
        .bind(container_id)
        .bind(&raw)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load(&self, container_id: &str) -> Result<Option<MonitorConfig>> {
        let row = sqlx::query("SELECT config FROM monitor_configs WHERE container_id = ?")
            .bind(container_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| serde_json::from_str(&r.get::<String, _>("config")).ok()))
    }

    pub async fn delete(&self, container_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM monitor_configs WHERE container_id = ?")
            .bind(container_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, crate::types::StrategyKind};

    #[tokio::test]
    async fn save_load_round_trip() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        MonitorConfigStore::init(&pool).await.unwrap();
        let store = MonitorConfigStore::new(pool);

        assert!(store.load("c1").await.unwrap().is_none());

        let mut config = MonitorConfig::default();
        config.strategy = StrategyKind::Queue;
        config.silence_threshold_secs = 45;
        store.save("c1", &config).await.unwrap();

        let loaded = store.load("c1").await.unwrap().unwrap();
        assert_eq!(loaded.strategy, StrategyKind::Queue);
        assert_eq!(loaded.silence_threshold_secs, 45);

        store.delete("c1").await.unwrap();
        assert!(store.load("c1").await.unwrap().is_none());
    }
}
