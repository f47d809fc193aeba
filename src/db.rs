//! SQLite invocation ledger with Diesel ORM
//!
//! One row per completed tool call, plus a per-day cost aggregate keyed by
//! (date, agent, tool, model) that is updated in the same transaction.
//! Writers serialize on a single lock so concurrent callers never lose an
//! aggregate increment.

use crate::error::TelemetryError;
use crate::schema::*;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Double, Text};
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Current schema version of the telemetry database
pub const CURRENT_SCHEMA: TelemetrySchema = TelemetrySchema {
    major: 1,
    minor: 0,
    patch: 0,
    name: "invocation-ledger",
    features: &["invocations", "daily_costs", "privacy_levels"],
};

/// Describes the version and capabilities of the schema
#[derive(Debug, Clone)]
pub struct TelemetrySchema {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub name: &'static str,
    pub features: &'static [&'static str],
}

impl TelemetrySchema {
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(&feature)
    }
}

impl std::fmt::Display for TelemetrySchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{} ({})", self.version_string(), self.name)
    }
}

/// Characters of the prompt kept at the `full` privacy level
pub const PROMPT_PREVIEW_CHARS: usize = 200;

/// How much of the prompt the ledger retains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    /// Nothing about the prompt
    Minimal,
    /// SHA-256 digest of the prompt
    #[default]
    Standard,
    /// Digest plus a short preview
    Full,
}

impl PrivacyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyLevel::Minimal => "minimal",
            PrivacyLevel::Standard => "standard",
            PrivacyLevel::Full => "full",
        }
    }
}

impl std::str::FromStr for PrivacyLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(PrivacyLevel::Minimal),
            "standard" => Ok(PrivacyLevel::Standard),
            "full" => Ok(PrivacyLevel::Full),
            other => Err(format!(
                "unknown privacy level '{}' (expected minimal, standard or full)",
                other
            )),
        }
    }
}

/// One completed tool call, as handed to [`TelemetryStore::log_invocation`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub tool: String,
    pub model: String,
    pub task_type: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub status: String,
    pub error: Option<String>,
    pub privacy_level: PrivacyLevel,
    pub prompt_digest: Option<String>,
    pub prompt_preview: Option<String>,
    pub fallback_used: bool,
}

impl InvocationRecord {
    /// A successful, zero-cost record with a fresh id and the current time
    pub fn new(agent: &str, tool: &str, model: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            agent: agent.to_string(),
            tool: tool.to_string(),
            model: model.to_string(),
            task_type: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            latency_ms: 0,
            status: "success".to_string(),
            error: None,
            privacy_level: PrivacyLevel::default(),
            prompt_digest: None,
            prompt_preview: None,
            fallback_used: false,
        }
    }

    /// Attach what `level` allows us to keep of `prompt`
    pub fn with_prompt(mut self, prompt: &str, level: PrivacyLevel) -> Self {
        self.privacy_level = level;
        self.prompt_digest = match level {
            PrivacyLevel::Minimal => None,
            PrivacyLevel::Standard | PrivacyLevel::Full => Some(hex_digest(prompt)),
        };
        self.prompt_preview = match level {
            PrivacyLevel::Full => Some(prompt.chars().take(PROMPT_PREVIEW_CHARS).collect()),
            _ => None,
        };
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// UTC calendar day the record is aggregated under
    pub fn date(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }
}

fn hex_digest(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Timestamps are stored in one fixed-width form so they sort lexically
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ============================================================================
// Diesel Models
// ============================================================================

/// Insertable schema version
#[derive(Insertable)]
#[diesel(table_name = schema_versions)]
pub struct NewSchemaVersion<'a> {
    pub version: &'a str,
    pub name: &'a str,
    pub features: &'a str,
    pub introduced_at: &'a str,
}

/// Insertable invocation row
#[derive(Insertable)]
#[diesel(table_name = invocations)]
pub struct NewInvocation<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub date: &'a str,
    pub agent: &'a str,
    pub tool: &'a str,
    pub model: &'a str,
    pub task_type: Option<&'a str>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub status: &'a str,
    pub error: Option<&'a str>,
    pub privacy_level: &'a str,
    pub prompt_digest: Option<&'a str>,
    pub prompt_preview: Option<&'a str>,
    pub fallback_used: bool,
}

/// Queryable invocation row
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = invocations)]
pub struct StoredInvocation {
    pub id: String,
    pub timestamp: String,
    pub date: String,
    pub agent: String,
    pub tool: String,
    pub model: String,
    pub task_type: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub status: String,
    pub error: Option<String>,
    pub privacy_level: String,
    pub prompt_digest: Option<String>,
    pub prompt_preview: Option<String>,
    pub fallback_used: bool,
}

/// Queryable per-day aggregate
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = daily_costs)]
pub struct DailyCost {
    pub date: String,
    pub agent: String,
    pub tool: String,
    pub model: String,
    pub invocations: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
}

/// Totals for one agent across a date range
#[derive(QueryableByName, Debug, Clone, PartialEq, Serialize)]
pub struct AgentCostSummary {
    #[diesel(sql_type = Text)]
    pub agent: String,
    #[diesel(sql_type = BigInt)]
    pub invocations: i64,
    #[diesel(sql_type = BigInt)]
    pub total_tokens: i64,
    #[diesel(sql_type = Double)]
    pub total_cost_usd: f64,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Per-connection SQLite settings for concurrent access
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout_ms: u32,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Relational telemetry ledger
pub struct TelemetryStore {
    pool: DbPool,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for TelemetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryStore").finish_non_exhaustive()
    }
}

impl TelemetryStore {
    /// Open (creating if needed) the database at `path`
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| TelemetryError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let path_str = path.to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(5)
            .connection_customizer(Box::new(ConnectionOptions { busy_timeout_ms: 5000 }))
            .build(manager)
            .map_err(|source| TelemetryError::Connection {
                path: path.to_path_buf(),
                source,
            })?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.init_schema()?;
        debug!(path = %path.display(), "telemetry store opened");
        Ok(store)
    }

    fn get_conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                version TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                features TEXT NOT NULL,
                introduced_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS invocations (
                id TEXT PRIMARY KEY NOT NULL,
                timestamp TEXT NOT NULL,
                date TEXT NOT NULL,
                agent TEXT NOT NULL,
                tool TEXT NOT NULL,
                model TEXT NOT NULL,
                task_type TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0.0,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error TEXT,
                privacy_level TEXT NOT NULL DEFAULT 'standard',
                prompt_digest TEXT,
                prompt_preview TEXT,
                fallback_used BOOLEAN NOT NULL DEFAULT 0
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS daily_costs (
                date TEXT NOT NULL,
                agent TEXT NOT NULL,
                tool TEXT NOT NULL,
                model TEXT NOT NULL,
                invocations INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost_usd REAL NOT NULL DEFAULT 0.0,
                PRIMARY KEY (date, agent, tool, model)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_invocations_timestamp ON invocations(timestamp)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_invocations_agent ON invocations(agent)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_invocations_tool ON invocations(tool)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_invocations_model ON invocations(model)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_invocations_status ON invocations(status)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_daily_costs_date ON daily_costs(date)").execute(&mut conn)?;

        self.register_schema(&mut conn, &CURRENT_SCHEMA)?;
        Ok(())
    }

    fn register_schema(&self, conn: &mut DbConn, schema: &TelemetrySchema) -> Result<()> {
        let now = format_timestamp(&Utc::now());
        let features_json = serde_json::to_string(&schema.features)?;

        let new_schema = NewSchemaVersion {
            version: &schema.version_string(),
            name: schema.name,
            features: &features_json,
            introduced_at: &now,
        };

        diesel::insert_or_ignore_into(schema_versions::table)
            .values(&new_schema)
            .execute(conn)?;

        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert `record` and fold it into its daily aggregate, atomically.
    ///
    /// A reused id fails with [`TelemetryError::Integrity`] and leaves both
    /// tables untouched.
    pub fn log_invocation(&self, record: &InvocationRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut conn = self.get_conn()?;

        let timestamp = format_timestamp(&record.timestamp);
        let date = record.date();
        let total_tokens = to_i64(record.total_tokens());

        let row = NewInvocation {
            id: &record.id,
            timestamp: &timestamp,
            date: &date,
            agent: &record.agent,
            tool: &record.tool,
            model: &record.model,
            task_type: record.task_type.as_deref(),
            input_tokens: to_i64(record.input_tokens),
            output_tokens: to_i64(record.output_tokens),
            total_tokens,
            cost_usd: record.cost_usd,
            latency_ms: to_i64(record.latency_ms),
            status: &record.status,
            error: record.error.as_deref(),
            privacy_level: record.privacy_level.as_str(),
            prompt_digest: record.prompt_digest.as_deref(),
            prompt_preview: record.prompt_preview.as_deref(),
            fallback_used: record.fallback_used,
        };

        conn.immediate_transaction::<_, TelemetryError, _>(|conn| {
            diesel::insert_into(invocations::table)
                .values(&row)
                .execute(conn)
                .map_err(|e| match e {
                    DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                        TelemetryError::Integrity(record.id.clone())
                    }
                    other => TelemetryError::Query(other),
                })?;

            diesel::sql_query(
                "INSERT INTO daily_costs (date, agent, tool, model, invocations, total_tokens, total_cost_usd)
                 VALUES (?, ?, ?, ?, 1, ?, ?)
                 ON CONFLICT (date, agent, tool, model) DO UPDATE SET
                    invocations = invocations + 1,
                    total_tokens = total_tokens + excluded.total_tokens,
                    total_cost_usd = total_cost_usd + excluded.total_cost_usd",
            )
            .bind::<Text, _>(&date)
            .bind::<Text, _>(&record.agent)
            .bind::<Text, _>(&record.tool)
            .bind::<Text, _>(&record.model)
            .bind::<BigInt, _>(total_tokens)
            .bind::<Double, _>(record.cost_usd)
            .execute(conn)?;

            Ok(())
        })?;

        info!(
            id = %record.id,
            agent = %record.agent,
            tool = %record.tool,
            model = %record.model,
            cost_usd = record.cost_usd,
            latency_ms = record.latency_ms,
            status = %record.status,
            "invocation logged"
        );
        Ok(())
    }

    /// Delete invocation rows older than `cutoff`; daily aggregates are kept
    pub fn purge_invocations_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut conn = self.get_conn()?;
        let cutoff = format_timestamp(&cutoff);
        let deleted = diesel::delete(invocations::table.filter(invocations::timestamp.lt(cutoff.as_str())))
            .execute(&mut conn)?;
        info!(deleted, cutoff = %cutoff, "purged old invocations");
        Ok(deleted)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get_invocation(&self, id: &str) -> Result<Option<StoredInvocation>> {
        let mut conn = self.get_conn()?;
        let row = invocations::table
            .filter(invocations::id.eq(id))
            .select(StoredInvocation::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(row)
    }

    /// Most recent invocations first
    pub fn recent_invocations(&self, limit: i64) -> Result<Vec<StoredInvocation>> {
        let mut conn = self.get_conn()?;
        let rows = invocations::table
            .order(invocations::timestamp.desc())
            .limit(limit)
            .select(StoredInvocation::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    pub fn count_invocations(&self) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let count = invocations::table.count().get_result(&mut conn)?;
        Ok(count)
    }

    /// Daily aggregates on or after `since` (`YYYY-MM-DD`), oldest first
    pub fn daily_costs(&self, since: Option<&str>) -> Result<Vec<DailyCost>> {
        let mut conn = self.get_conn()?;
        let rows = daily_costs::table
            .filter(daily_costs::date.ge(since.unwrap_or("")))
            .order((
                daily_costs::date.asc(),
                daily_costs::agent.asc(),
                daily_costs::tool.asc(),
                daily_costs::model.asc(),
            ))
            .select(DailyCost::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// Per-agent totals on or after `since`, most expensive first
    pub fn cost_by_agent(&self, since: Option<&str>) -> Result<Vec<AgentCostSummary>> {
        let mut conn = self.get_conn()?;
        let rows = diesel::sql_query(
            "SELECT agent,
                    CAST(SUM(invocations) AS INTEGER) AS invocations,
                    CAST(SUM(total_tokens) AS INTEGER) AS total_tokens,
                    CAST(SUM(total_cost_usd) AS REAL) AS total_cost_usd
             FROM daily_costs
             WHERE date >= ?
             GROUP BY agent
             ORDER BY total_cost_usd DESC, agent ASC",
        )
        .bind::<Text, _>(since.unwrap_or(""))
        .load::<AgentCostSummary>(&mut conn)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open() -> (TempDir, TelemetryStore) {
        let dir = TempDir::new().unwrap();
        let store = TelemetryStore::open_at(dir.path().join("telemetry.db")).unwrap();
        (dir, store)
    }

    fn record(id: &str, cost: f64, tokens: u64) -> InvocationRecord {
        let mut r = InvocationRecord::new("coder", "claude", "sonnet");
        r.id = id.to_string();
        r.timestamp = Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap();
        r.input_tokens = tokens;
        r.cost_usd = cost;
        r.latency_ms = 1200;
        r
    }

    #[test]
    fn test_schema_version() {
        assert_eq!(CURRENT_SCHEMA.version_string(), "1.0.0");
        assert!(CURRENT_SCHEMA.has_feature("daily_costs"));
        assert_eq!(CURRENT_SCHEMA.to_string(), "v1.0.0 (invocation-ledger)");
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("t.db");
        TelemetryStore::open_at(&path).unwrap().log_invocation(&record("a", 0.1, 10)).unwrap();
        let store = TelemetryStore::open_at(&path).unwrap();
        assert_eq!(store.count_invocations().unwrap(), 1);
    }

    #[test]
    fn test_log_and_read_back() {
        let (_dir, store) = open();
        let r = record("inv-1", 0.05, 300).with_prompt("secret prompt", PrivacyLevel::Full);
        store.log_invocation(&r).unwrap();

        let row = store.get_invocation("inv-1").unwrap().unwrap();
        assert_eq!(row.agent, "coder");
        assert_eq!(row.date, "2025-03-14");
        assert_eq!(row.total_tokens, 300);
        assert_eq!(row.privacy_level, "full");
        assert_eq!(row.prompt_preview.as_deref(), Some("secret prompt"));
        assert_eq!(row.prompt_digest.as_ref().map(|d| d.len()), Some(64));
        assert!(store.get_invocation("missing").unwrap().is_none());
    }

    #[test]
    fn test_two_records_one_aggregate_row() {
        let (_dir, store) = open();
        store.log_invocation(&record("a", 0.25, 100)).unwrap();
        store.log_invocation(&record("b", 0.5, 50)).unwrap();

        let costs = store.daily_costs(None).unwrap();
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[0].invocations, 2);
        assert_eq!(costs[0].total_tokens, 150);
        assert!((costs[0].total_cost_usd - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_different_keys_get_separate_rows() {
        let (_dir, store) = open();
        store.log_invocation(&record("a", 0.1, 1)).unwrap();
        let mut other = record("b", 0.2, 1);
        other.model = "opus".to_string();
        store.log_invocation(&other).unwrap();
        let mut next_day = record("c", 0.3, 1);
        next_day.timestamp = Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 1).unwrap();
        store.log_invocation(&next_day).unwrap();

        assert_eq!(store.daily_costs(None).unwrap().len(), 3);
        assert_eq!(store.daily_costs(Some("2025-03-15")).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_id_is_integrity_error_and_state_unchanged() {
        let (_dir, store) = open();
        store.log_invocation(&record("dup", 0.1, 10)).unwrap();

        let err = store.log_invocation(&record("dup", 9.9, 999)).unwrap_err();
        assert!(matches!(err, TelemetryError::Integrity(ref id) if id == "dup"));

        assert_eq!(store.count_invocations().unwrap(), 1);
        let costs = store.daily_costs(None).unwrap();
        assert_eq!(costs[0].invocations, 1);
        assert!((costs[0].total_cost_usd - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_writers_lose_no_updates() {
        let (_dir, store) = open();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        store.log_invocation(&record(&format!("{t}-{i}"), 0.01, 1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let costs = store.daily_costs(None).unwrap();
        assert_eq!(costs[0].invocations, 80);
        assert_eq!(costs[0].total_tokens, 80);
        assert!((costs[0].total_cost_usd - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_cost_by_agent() {
        let (_dir, store) = open();
        store.log_invocation(&record("a", 0.1, 10)).unwrap();
        let mut r = record("b", 1.0, 10);
        r.agent = "reviewer".to_string();
        store.log_invocation(&r).unwrap();

        let summary = store.cost_by_agent(None).unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].agent, "reviewer");
        assert_eq!(summary[1].invocations, 1);
    }

    #[test]
    fn test_purge_keeps_aggregates() {
        let (_dir, store) = open();
        store.log_invocation(&record("old", 0.1, 10)).unwrap();
        let mut recent = record("new", 0.1, 10);
        recent.timestamp = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        store.log_invocation(&recent).unwrap();

        let deleted = store
            .purge_invocations_before(Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap())
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_invocations().unwrap(), 1);
        assert_eq!(store.daily_costs(None).unwrap().len(), 2);
    }

    #[test]
    fn test_recent_invocations_newest_first() {
        let (_dir, store) = open();
        store.log_invocation(&record("first", 0.0, 0)).unwrap();
        let mut later = record("second", 0.0, 0);
        later.timestamp = Utc.with_ymd_and_hms(2025, 3, 14, 13, 0, 0).unwrap();
        store.log_invocation(&later).unwrap();

        let rows = store.recent_invocations(10).unwrap();
        assert_eq!(rows[0].id, "second");
        assert_eq!(store.recent_invocations(1).unwrap().len(), 1);
    }

    #[derive(QueryableByName)]
    struct SyncMode {
        #[diesel(sql_type = diesel::sql_types::Integer)]
        synchronous: i32,
    }

    #[test]
    fn test_connections_sync_every_commit() {
        let (_dir, store) = open();
        let mut conn = store.get_conn().unwrap();
        let mode = diesel::sql_query("PRAGMA synchronous")
            .get_result::<SyncMode>(&mut conn)
            .unwrap();
        // 2 = FULL: a committed invocation survives power loss in WAL mode
        assert_eq!(mode.synchronous, 2);
    }

    #[test]
    fn test_privacy_levels() {
        let minimal = InvocationRecord::new("a", "t", "m").with_prompt("p", PrivacyLevel::Minimal);
        assert!(minimal.prompt_digest.is_none() && minimal.prompt_preview.is_none());

        let standard = InvocationRecord::new("a", "t", "m").with_prompt("p", PrivacyLevel::Standard);
        assert!(standard.prompt_digest.is_some() && standard.prompt_preview.is_none());

        let long = "x".repeat(500);
        let full = InvocationRecord::new("a", "t", "m").with_prompt(&long, PrivacyLevel::Full);
        assert_eq!(full.prompt_preview.unwrap().len(), PROMPT_PREVIEW_CHARS);

        assert_eq!("FULL".parse::<PrivacyLevel>().unwrap(), PrivacyLevel::Full);
        assert!("verbose".parse::<PrivacyLevel>().is_err());
    }
}
