use std::{
    collections::HashMap,
    io::{Read as _, Write as _},
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    burrow_common::{Result, time::now_ms},
    burrow_config::HistoryConfig,
    flate2::{Compression, read::GzDecoder, write::GzEncoder},
    sqlx::{Row, SqlitePool},
    tokio::sync::Mutex as AsyncMutex,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

/// Per-session scrollback: an in-memory staging buffer plus immutable
/// gzip-compressed chunks in SQLite, indexed monotonically per session.
///
/// `read_full` returns decompressed chunks in index order followed by the
/// live buffer; together they are exactly the bytes the reader routine
/// appended, in order.
pub struct HistoryStore {
    pool: SqlitePool,
    cfg: HistoryConfig,
    buffers: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
    /// Serializes flushes per session so chunk indices stay monotonic.
    flush_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool, cfg: HistoryConfig) -> Self {
        Self {
            pool,
            cfg,
            buffers: Mutex::new(HashMap::new()),
            flush_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS terminal_history (
                session_id        TEXT NOT NULL,
                chunk_idx         INTEGER NOT NULL,
                data              BLOB NOT NULL,
                uncompressed_size INTEGER NOT NULL,
                created_at        INTEGER NOT NULL,
                PRIMARY KEY (session_id, chunk_idx)
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    fn buffer(&self, session_id: &str) -> Arc<Mutex<Vec<u8>>> {
        let mut buffers = lock(&self.buffers);
        let capacity = self.cfg.buffer_capacity;
        buffers
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::with_capacity(capacity))))
            .clone()
    }

    fn flush_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = lock(&self.flush_locks);
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Append output bytes; crossing the flush threshold persists the
    /// buffer in the caller's task.
    pub async fn append(&self, session_id: &str, data: &[u8]) -> Result<()> {
        let buffer = self.buffer(session_id);
        let should_flush = {
            let mut staged = lock(&buffer);
            staged.extend_from_slice(data);
            staged.len() >= self.cfg.flush_threshold
        };
        if should_flush {
            self.flush_session(session_id).await?;
        }
        Ok(())
    }

    /// Persist the staged buffer: swap it out atomically, split into
    /// chunks, gzip each, and append them after the session's last index.
    pub async fn flush_session(&self, session_id: &str) -> Result<()> {
        let guard = self.flush_lock(session_id);
        let _flushing = guard.lock().await;

        let staged: Vec<u8> = {
            let buffer = self.buffer(session_id);
            let mut staged = lock(&buffer);
            std::mem::take(&mut *staged)
        };
        if staged.is_empty() {
            return Ok(());
        }

        let row = sqlx::query(
            "SELECT COALESCE(MAX(chunk_idx), -1) AS last FROM terminal_history WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        let mut next_idx: i64 = row.get::<i64, _>("last") + 1;

        for chunk in staged.chunks(self.cfg.max_chunk_bytes.max(1)) {
            let compressed = gzip(chunk)?;
            sqlx::query(
                "INSERT INTO terminal_history (session_id, chunk_idx, data, uncompressed_size, created_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(session_id)
            .bind(next_idx)
            .bind(&compressed)
            .bind(chunk.len() as i64)
            .bind(now_ms() as i64)
            .execute(&self.pool)
            .await?;
            next_idx += 1;
        }
        debug!(session_id, bytes = staged.len(), "flushed terminal history");

        self.enforce_retention(session_id).await
    }

    /// Full scrollback: decompressed chunks in index order plus the live
    /// buffer.
    pub async fn read_full(&self, session_id: &str) -> Result<Vec<u8>> {
        let rows = sqlx::query(
            "SELECT data FROM terminal_history WHERE session_id = ? ORDER BY chunk_idx",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for row in rows {
            let compressed: Vec<u8> = row.get("data");
            out.extend_from_slice(&gunzip(&compressed)?);
        }
        let buffer = self.buffer(session_id);
        out.extend_from_slice(&lock(&buffer));
        Ok(out)
    }

    /// Truncated variant for fast reconnects: only the live buffer.
    pub fn read_buffer(&self, session_id: &str) -> Vec<u8> {
        let buffer = self.buffer(session_id);
        let staged = lock(&buffer);
        staged.clone()
    }

    /// Drop everything stored for a session.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM terminal_history WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        lock(&self.buffers).remove(session_id);
        lock(&self.flush_locks).remove(session_id);
        Ok(())
    }

    /// Retention hook. `max_chunks = 0` means unlimited and is the default.
    pub async fn enforce_retention(&self, session_id: &str) -> Result<()> {
        if self.cfg.max_chunks == 0 {
            return Ok(());
        }
        sqlx::query(
            "DELETE FROM terminal_history WHERE session_id = ? AND chunk_idx <= (
                 SELECT MAX(chunk_idx) - ? FROM terminal_history WHERE session_id = ?
             )",
        )
        .bind(session_id)
        .bind(self.cfg.max_chunks as i64)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Background tick flushing every dirty buffer. Runs until cancelled.
    pub async fn run_flush_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.cfg.flush_interval_secs.max(1),
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {},
            }
            let sessions: Vec<String> = lock(&self.buffers).keys().cloned().collect();
            for session_id in sessions {
                if let Err(e) = self.flush_session(&session_id).await {
                    warn!(session_id, error = %e, "history flush failed");
                }
            }
        }
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Lock a std mutex, recovering from poisoning (writers never panic while
/// holding these, but a poisoned buffer is still only bytes).
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
