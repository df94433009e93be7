//! Usage Tracker (§4.I): an embedded durable store fed by a bounded,
//! non-blocking channel. Grounded on the teacher's bounded-channel /
//! drop-and-count idiom (`metrics.rs`'s `health_tracking_failure` pattern,
//! applied here to "never let the writer back up the forwarding path").

pub mod cost;

use chrono_tz::Tz;
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::StartupError;
use crate::lifecycle::{LifecycleRecord, UsageEvent};
use crate::metrics::Metrics;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    request_id TEXT PRIMARY KEY,
    client_ip TEXT,
    user_agent TEXT,
    start_ts TEXT NOT NULL,
    status TEXT NOT NULL,
    attempted_endpoints TEXT NOT NULL,
    current_endpoint TEXT,
    current_group TEXT,
    global_attempt INTEGER NOT NULL,
    retry_count INTEGER NOT NULL,
    model TEXT,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cache_creation_tokens INTEGER NOT NULL,
    cache_read_tokens INTEGER NOT NULL,
    cost REAL NOT NULL,
    duration_ms INTEGER,
    final_http_status INTEGER
);
CREATE INDEX IF NOT EXISTS idx_requests_start_ts ON requests(start_ts);
CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status);
CREATE INDEX IF NOT EXISTS idx_requests_model ON requests(model);
CREATE INDEX IF NOT EXISTS idx_requests_endpoint ON requests(current_endpoint);
CREATE INDEX IF NOT EXISTS idx_requests_group ON requests(current_group);
"#;

pub fn bounded_channel(buffer_size: usize) -> (mpsc::Sender<UsageEvent>, mpsc::Receiver<UsageEvent>) {
    mpsc::channel(buffer_size)
}

pub struct UsageTracker {
    conn: Arc<Mutex<Connection>>,
    tz: Tz,
}

#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub start_ts: Option<String>,
    pub end_ts: Option<String>,
    pub status: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub group: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecordRow {
    pub request_id: String,
    pub start_ts: String,
    pub status: String,
    pub current_endpoint: Option<String>,
    pub current_group: Option<String>,
    pub global_attempt: i64,
    pub retry_count: i64,
    pub model: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub cost: f64,
    pub duration_ms: Option<i64>,
    pub final_http_status: Option<i64>,
}

impl UsageTracker {
    pub fn open(path: &str, tz: Tz) -> Result<Arc<Self>, StartupError> {
        let conn = Connection::open(path).map_err(|source| StartupError::Store { path: path.to_string(), source })?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|source| StartupError::Store { path: path.to_string(), source })?;
        Ok(Arc::new(Self { conn: Arc::new(Mutex::new(conn)), tz }))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Spawns the batched writer: applies up to `batch_size` events or
    /// whatever has accumulated by `flush_interval`, whichever comes first,
    /// in a single transaction (§4.I).
    pub fn spawn_writer(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<UsageEvent>,
        batch_size: usize,
        flush_interval: Duration,
    ) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut batch = Vec::with_capacity(batch_size);
            let mut ticker = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        match maybe {
                            Some(event) => {
                                batch.push(event);
                                if batch.len() >= batch_size {
                                    tracker.flush(std::mem::take(&mut batch)).await;
                                }
                            }
                            None => {
                                tracker.flush(std::mem::take(&mut batch)).await;
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if !batch.is_empty() {
                            tracker.flush(std::mem::take(&mut batch)).await;
                        }
                    }
                }
            }
        });
    }

    async fn flush(&self, events: Vec<UsageEvent>) {
        if events.is_empty() {
            return;
        }
        let conn = self.conn.clone();
        let tz_name = self.tz.name().to_string();
        let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let mut conn = conn.lock().expect("usage store mutex poisoned");
            let tx = conn.transaction()?;
            for event in &events {
                upsert(&tx, event.record(), &tz_name)?;
            }
            tx.commit()
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "usage writer transaction failed"),
            Err(e) => tracing::error!(error = %e, "usage writer task panicked"),
        }
    }

    pub async fn query(&self, filter: UsageFilter) -> Result<Vec<UsageRecordRow>, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || run_query(&conn, &filter))
            .await
            .map_err(|e| format!("query task panicked: {e}"))?
    }

    pub async fn export_csv(&self, filter: UsageFilter) -> Result<String, String> {
        let rows = self.query(filter).await?;
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows {
            writer.serialize(row).map_err(|e| e.to_string())?;
        }
        let bytes = writer.into_inner().map_err(|e| e.to_string())?;
        String::from_utf8(bytes).map_err(|e| e.to_string())
    }

    pub async fn export_json(&self, filter: UsageFilter) -> Result<String, String> {
        let rows = self.query(filter).await?;
        serde_json::to_string(&rows).map_err(|e| e.to_string())
    }
}

fn upsert(tx: &rusqlite::Transaction, record: &LifecycleRecord, tz_name: &str) -> rusqlite::Result<()> {
    let start_ts = format_in_zone(record.start, tz_name);
    let attempted = serde_json::to_string(&record.attempted_endpoints).unwrap_or_else(|_| "[]".to_string());
    tx.execute(
        "INSERT INTO requests (request_id, client_ip, user_agent, start_ts, status, attempted_endpoints, \
         current_endpoint, current_group, global_attempt, retry_count, model, input_tokens, output_tokens, \
         cache_creation_tokens, cache_read_tokens, cost, duration_ms, final_http_status) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18) \
         ON CONFLICT(request_id) DO UPDATE SET \
         status=excluded.status, attempted_endpoints=excluded.attempted_endpoints, \
         current_endpoint=excluded.current_endpoint, current_group=excluded.current_group, \
         global_attempt=excluded.global_attempt, retry_count=excluded.retry_count, model=excluded.model, \
         input_tokens=excluded.input_tokens, output_tokens=excluded.output_tokens, \
         cache_creation_tokens=excluded.cache_creation_tokens, cache_read_tokens=excluded.cache_read_tokens, \
         cost=excluded.cost, duration_ms=excluded.duration_ms, final_http_status=excluded.final_http_status",
        rusqlite::params![
            record.request_id.to_string(),
            record.client_ip,
            record.user_agent,
            start_ts,
            record.status.as_str(),
            attempted,
            record.current_endpoint,
            record.current_group,
            record.global_attempt,
            record.retry_count,
            record.model,
            record.usage.input as i64,
            record.usage.output as i64,
            record.usage.cache_creation as i64,
            record.usage.cache_read as i64,
            record.cost,
            record.duration_ms.map(|d| d as i64),
            record.final_http_status.map(|s| s as i64),
        ],
    )?;
    Ok(())
}

fn format_in_zone(ts: chrono::DateTime<chrono::Utc>, tz_name: &str) -> String {
    let tz: Tz = tz_name.parse().unwrap_or(chrono_tz::UTC);
    ts.with_timezone(&tz).to_rfc3339()
}

fn run_query(conn: &Arc<Mutex<Connection>>, filter: &UsageFilter) -> Result<Vec<UsageRecordRow>, String> {
    let conn = conn.lock().map_err(|_| "usage store mutex poisoned".to_string())?;
    let mut sql = String::from(
        "SELECT request_id, start_ts, status, current_endpoint, current_group, global_attempt, retry_count, \
         model, input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens, cost, duration_ms, \
         final_http_status FROM requests WHERE 1=1",
    );
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref v) = filter.start_ts {
        sql.push_str(" AND start_ts >= ?");
        params.push(Box::new(v.clone()));
    }
    if let Some(ref v) = filter.end_ts {
        sql.push_str(" AND start_ts <= ?");
        params.push(Box::new(v.clone()));
    }
    if let Some(ref v) = filter.status {
        sql.push_str(" AND status = ?");
        params.push(Box::new(v.clone()));
    }
    if let Some(ref v) = filter.model {
        sql.push_str(" AND model = ?");
        params.push(Box::new(v.clone()));
    }
    if let Some(ref v) = filter.endpoint {
        sql.push_str(" AND current_endpoint = ?");
        params.push(Box::new(v.clone()));
    }
    if let Some(ref v) = filter.group {
        sql.push_str(" AND current_group = ?");
        params.push(Box::new(v.clone()));
    }
    sql.push_str(" ORDER BY start_ts ASC LIMIT ? OFFSET ?");
    let limit = if filter.limit == 0 { 100 } else { filter.limit };
    params.push(Box::new(limit));
    params.push(Box::new(filter.offset));

    let mut stmt = conn.prepare(&sql).map_err(|e| e.to_string())?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok(UsageRecordRow {
                request_id: row.get(0)?,
                start_ts: row.get(1)?,
                status: row.get(2)?,
                current_endpoint: row.get(3)?,
                current_group: row.get(4)?,
                global_attempt: row.get(5)?,
                retry_count: row.get(6)?,
                model: row.get(7)?,
                input_tokens: row.get(8)?,
                output_tokens: row.get(9)?,
                cache_creation_tokens: row.get(10)?,
                cache_read_tokens: row.get(11)?,
                cost: row.get(12)?,
                duration_ms: row.get(13)?,
                final_http_status: row.get(14)?,
            })
        })
        .map_err(|e| e.to_string())?;

    rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::lifecycle::LifecycleManager;
    use uuid::Uuid;

    fn tmp_tracker() -> Arc<UsageTracker> {
        let path = format!("file:memdb_{}?mode=memory&cache=shared", Uuid::new_v4());
        // rusqlite needs the shared-cache URI form to keep an in-memory db alive
        // across connections; for this single-connection tracker a plain
        // in-memory path is sufficient and simpler.
        let _ = path;
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        Arc::new(UsageTracker { conn: Arc::new(Mutex::new(conn)), tz: chrono_tz::UTC })
    }

    #[tokio::test]
    async fn writer_persists_started_and_completed_events() {
        let tracker = tmp_tracker();
        let (tx, rx) = bounded_channel(16);
        tracker.spawn_writer(rx, 100, Duration::from_millis(20));

        let bus = Arc::new(EventBus::new(Duration::from_millis(0), Arc::new(Metrics::new().unwrap())));
        let manager = LifecycleManager::new(Uuid::new_v4(), None, None, tx, bus, Arc::new(Metrics::new().unwrap()));
        manager.mark_model("claude-3-5-haiku").await;
        manager.complete(crate::lifecycle::Status::Completed, Some(200)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let rows = tracker.query(UsageFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "completed");
        assert_eq!(rows[0].model.as_deref(), Some("claude-3-5-haiku"));
    }

    #[tokio::test]
    async fn completion_overwrites_any_prior_nonterminal_status() {
        let tracker = tmp_tracker();
        let (tx, rx) = bounded_channel(16);
        tracker.spawn_writer(rx, 1, Duration::from_millis(10));

        let bus = Arc::new(EventBus::new(Duration::from_millis(0), Arc::new(Metrics::new().unwrap())));
        let manager = LifecycleManager::new(Uuid::new_v4(), None, None, tx, bus, Arc::new(Metrics::new().unwrap()));
        manager.increment_attempt("e1", "main").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.complete(crate::lifecycle::Status::Completed, Some(200)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let rows = tracker.query(UsageFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1, "same request_id must overwrite, not duplicate rows");
        assert_eq!(rows[0].status, "completed");
    }

    #[tokio::test]
    async fn query_filters_by_status() {
        let tracker = tmp_tracker();
        let (tx, rx) = bounded_channel(16);
        tracker.spawn_writer(rx, 1, Duration::from_millis(10));
        let bus = Arc::new(EventBus::new(Duration::from_millis(0), Arc::new(Metrics::new().unwrap())));

        for status in [crate::lifecycle::Status::Completed, crate::lifecycle::Status::Timeout] {
            let manager = LifecycleManager::new(Uuid::new_v4(), None, None, tx.clone(), bus.clone(), Arc::new(Metrics::new().unwrap()));
            manager.complete(status, None).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let rows = tracker
            .query(UsageFilter { status: Some("timeout".to_string()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "timeout");
    }

    #[tokio::test]
    async fn export_csv_and_json_round_trip_row_count() {
        let tracker = tmp_tracker();
        let (tx, rx) = bounded_channel(16);
        tracker.spawn_writer(rx, 1, Duration::from_millis(10));
        let bus = Arc::new(EventBus::new(Duration::from_millis(0), Arc::new(Metrics::new().unwrap())));
        let manager = LifecycleManager::new(Uuid::new_v4(), None, None, tx, bus, Arc::new(Metrics::new().unwrap()));
        manager.complete(crate::lifecycle::Status::Completed, Some(200)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let csv = tracker.export_csv(UsageFilter::default()).await.unwrap();
        assert_eq!(csv.lines().count(), 2); // header + one row

        let json = tracker.export_json(UsageFilter::default()).await.unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
    }
}
