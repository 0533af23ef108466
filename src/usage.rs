use crate::chat::ChatMessage;
use crate::routing::{RoutingDecision, RoutingMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Pool, Sqlite, sqlite::SqlitePoolOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_COST_PER_1K_TOKENS: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub tokens_in: i64,
    pub cost: f64,
    pub mode: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("usage store unavailable: {0}")]
    Unavailable(String),
    #[error("usage insert failed: {0}")]
    Insert(String),
}

/// Append-only destination for usage records.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn append(&self, record: UsageRecord) -> Result<(), RecorderError>;
}

#[derive(Clone, Default)]
pub struct MemoryUsageSink {
    inner: Arc<Mutex<Vec<UsageRecord>>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.inner.lock().await.clone()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn append(&self, record: UsageRecord) -> Result<(), RecorderError> {
        self.inner.lock().await.push(record);
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteUsageSink {
    pool: Pool<Sqlite>,
}

impl SqliteUsageSink {
    pub async fn connect(dsn: &str) -> Result<Self, RecorderError> {
        ensure_sqlite_file(dsn).map_err(RecorderError::Unavailable)?;
        let options = dsn
            .parse::<sqlx::sqlite::SqliteConnectOptions>()
            .map_err(|err| RecorderError::Unavailable(err.to_string()))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|err| RecorderError::Unavailable(err.to_string()))?;
        Self::new(pool).await
    }

    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, RecorderError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS usage_logs (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                tokens_in INTEGER NOT NULL,
                cost REAL NOT NULL,
                mode TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|err| RecorderError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    async fn list_recent(&self, limit: i64) -> Result<Vec<UsageRecord>, RecorderError> {
        use sqlx::Row;

        let rows = sqlx::query(
            r#"SELECT provider, model, tokens_in, cost, mode, created_at
               FROM usage_logs ORDER BY created_at DESC LIMIT ?"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| RecorderError::Unavailable(err.to_string()))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: String = row.get("created_at");
            out.push(UsageRecord {
                provider: row.get("provider"),
                model: row.get("model"),
                tokens_in: row.get("tokens_in"),
                cost: row.get("cost"),
                mode: row.get("mode"),
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl UsageSink for SqliteUsageSink {
    async fn append(&self, record: UsageRecord) -> Result<(), RecorderError> {
        sqlx::query(
            r#"INSERT INTO usage_logs (id, provider, model, tokens_in, cost, mode, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&record.provider)
        .bind(&record.model)
        .bind(record.tokens_in)
        .bind(record.cost)
        .bind(&record.mode)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| RecorderError::Insert(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageEstimate {
    pub tokens_in: f64,
    pub cost: f64,
}

/// Input tokens are the UTF-16 length of the serialized messages divided by
/// four; cost is a flat rate per thousand of those. Dashboard figures only.
pub fn estimate(messages: &[ChatMessage], cost_per_1k_tokens: f64) -> UsageEstimate {
    let chars = serde_json::to_string(messages)
        .map(|s| s.encode_utf16().count())
        .unwrap_or_default();
    let tokens_in = chars as f64 / 4.0;
    UsageEstimate {
        tokens_in,
        cost: tokens_in / 1000.0 * cost_per_1k_tokens,
    }
}

#[derive(Clone)]
pub struct UsageRecorder {
    sink: Arc<dyn UsageSink>,
    cost_per_1k_tokens: f64,
}

impl UsageRecorder {
    pub fn new(sink: Arc<dyn UsageSink>, cost_per_1k_tokens: f64) -> Self {
        Self {
            sink,
            cost_per_1k_tokens,
        }
    }

    pub fn build_record(
        &self,
        decision: &RoutingDecision,
        mode: RoutingMode,
        messages: &[ChatMessage],
    ) -> UsageRecord {
        let estimate = estimate(messages, self.cost_per_1k_tokens);
        UsageRecord {
            provider: decision.provider.as_str().to_string(),
            model: decision.model.clone(),
            tokens_in: estimate.tokens_in.round() as i64,
            cost: estimate.cost,
            mode: mode.as_str().to_string(),
            created_at: Utc::now(),
        }
    }

    /// Writes the record on a background task. Sink failures are logged and
    /// counted; they never reach the caller.
    pub fn record(
        &self,
        decision: &RoutingDecision,
        mode: RoutingMode,
        messages: &[ChatMessage],
    ) -> tokio::task::JoinHandle<()> {
        let record = self.build_record(decision, mode, messages);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            let provider = record.provider.clone();
            if let Err(err) = sink.append(record).await {
                metrics::counter!("chatgate_usage_record_failures_total").increment(1);
                tracing::warn!(provider = %provider, error = %err, "failed to record usage");
            }
        })
    }
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Role;
    use crate::config::ProviderKind;

    struct FailingSink;

    #[async_trait]
    impl UsageSink for FailingSink {
        async fn append(&self, _record: UsageRecord) -> Result<(), RecorderError> {
            Err(RecorderError::Insert("disk full".to_string()))
        }
    }

    fn decision() -> RoutingDecision {
        RoutingDecision {
            provider: ProviderKind::Anthropic,
            model: "claude-3-5-sonnet-20240620".to_string(),
            credential: "sk-ant".to_string(),
        }
    }

    #[test]
    fn estimate_uses_serialized_length_over_four() {
        let messages = vec![ChatMessage::new(Role::User, "hi")];
        // [{"role":"user","content":"hi"}] is 32 characters.
        let est = estimate(&messages, DEFAULT_COST_PER_1K_TOKENS);
        assert_eq!(est.tokens_in, 8.0);
        assert!((est.cost - 0.00008).abs() < 1e-12);
    }

    #[test]
    fn record_rounds_tokens_and_keeps_mode() {
        let recorder = UsageRecorder::new(Arc::new(MemoryUsageSink::new()), 0.01);
        let messages = vec![ChatMessage::new(Role::User, "hello")];
        let record = recorder.build_record(&decision(), RoutingMode::Manual, &messages);
        // 35 characters -> 8.75 estimated tokens.
        assert_eq!(record.tokens_in, 9);
        assert!((record.cost - 0.0000875).abs() < 1e-12);
        assert_eq!(record.mode, "manual");
        assert_eq!(record.provider, "anthropic");
    }

    #[tokio::test]
    async fn failing_sink_is_contained() {
        let recorder = UsageRecorder::new(Arc::new(FailingSink), 0.01);
        let messages = vec![ChatMessage::new(Role::User, "hi")];
        let handle = recorder.record(&decision(), RoutingMode::AutoPower, &messages);
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn sqlite_sink_appends_records() {
        let sink = SqliteUsageSink::connect("sqlite::memory:").await.unwrap();
        let recorder = UsageRecorder::new(Arc::new(sink.clone()), 0.01);
        let messages = vec![ChatMessage::new(Role::User, "hi")];
        recorder
            .record(&decision(), RoutingMode::AutoCost, &messages)
            .await
            .unwrap();
        let rows = sink.list_recent(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model, "claude-3-5-sonnet-20240620");
        assert_eq!(rows[0].tokens_in, 8);
        assert_eq!(rows[0].mode, "auto-cost");
    }
}
