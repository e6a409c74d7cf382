//! SQLite-backed event store.
//! Claims are single conditional `UPDATE`s inside an immediate transaction,
//! so concurrent workers (threads or processes) sharing the file never both
//! win the same transition.

use async_trait::async_trait;
use cadence_core::config::WriteConcern;
use cadence_core::error::{CadenceError, EventFault, Result};
use cadence_core::event::{
    Candidate, Event, EventId, EventPayload, EventState, EventType, Retention,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{CandidateQuery, ClaimMatch, ClaimUpdate, EventStore};
use crate::collaborators::{ConsoleLine, ConsoleSink};

const EVENT_COLUMNS: &str = "id, tenant, key, type, state, start, schedule, started, count, sequence, \
     shard_key, expires_at, principal, retention, guard, payload, reap, err, parent, parent_key, created";

/// SQLite-backed persistence for event documents and console lines.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open or create the event database.
    pub fn open(path: &Path, write_concern: WriteConcern) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| CadenceError::store(format!("DB open: {e}")))?;
        Self::init(conn, write_concern)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CadenceError::store(format!("DB open: {e}")))?;
        Self::init(conn, WriteConcern::Acknowledged)
    }

    fn init(conn: Connection, write_concern: WriteConcern) -> Result<Self> {
        let synchronous = match write_concern {
            WriteConcern::Majority => "FULL",
            WriteConcern::Acknowledged => "NORMAL",
            WriteConcern::Unacknowledged => "OFF",
        };
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = {synchronous};"
        ))
        .map_err(|e| CadenceError::store(format!("DB pragma: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                key TEXT,                        -- optional dedup key, unset on reap
                type TEXT NOT NULL,              -- script | driver | console | notification
                state TEXT NOT NULL,
                start INTEGER NOT NULL,          -- unix millis
                schedule TEXT,
                started INTEGER,
                count INTEGER NOT NULL DEFAULT 0,
                sequence INTEGER NOT NULL DEFAULT 0,
                shard_key INTEGER NOT NULL,
                expires_at INTEGER,
                principal TEXT,
                retention INTEGER NOT NULL DEFAULT 0,
                guard TEXT,                      -- JSON
                payload TEXT NOT NULL,           -- JSON, tagged by type
                reap INTEGER NOT NULL DEFAULT 0,
                err TEXT,                        -- JSON fault, never with a stack
                parent TEXT,
                parent_key TEXT,
                created INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_queue
                ON events (shard_key, state, start) WHERE reap = 0;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_key
                ON events (tenant, key) WHERE key IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_events_parent_key
                ON events (parent_key);

            CREATE TABLE IF NOT EXISTS console_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant TEXT NOT NULL,
                date INTEGER NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| CadenceError::store(format!("Migration: {e}")))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CadenceError::store(format!("connection poisoned: {e}")))
    }

    /// Most recent console lines for a tenant, newest first.
    pub fn console_lines(&self, tenant: &str, limit: usize) -> Result<Vec<ConsoleLine>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT tenant, date, level, message FROM console_logs
                 WHERE tenant = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| CadenceError::store(format!("Console query: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![tenant, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| CadenceError::store(format!("Console query: {e}")))?;

        let mut lines = Vec::new();
        for row in rows {
            let (tenant, date, level, message) =
                row.map_err(|e| CadenceError::store(format!("Console row: {e}")))?;
            lines.push(ConsoleLine {
                tenant,
                date: from_millis(date)?,
                level,
                message,
            });
        }
        Ok(lines)
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CadenceError::store(format!("timestamp out of range: {ms}")))
}

/// Raw column values, converted outside of rusqlite's row callback.
struct EventRow {
    id: String,
    tenant: String,
    key: Option<String>,
    state: String,
    start: i64,
    schedule: Option<String>,
    started: Option<i64>,
    count: i64,
    sequence: i64,
    shard_key: i64,
    expires_at: Option<i64>,
    principal: Option<String>,
    retention: i64,
    guard: Option<String>,
    payload: String,
    reap: bool,
    err: Option<String>,
    parent: Option<String>,
    parent_key: Option<String>,
    created: i64,
}

impl EventRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant: row.get(1)?,
            key: row.get(2)?,
            state: row.get(4)?,
            start: row.get(5)?,
            schedule: row.get(6)?,
            started: row.get(7)?,
            count: row.get(8)?,
            sequence: row.get(9)?,
            shard_key: row.get(10)?,
            expires_at: row.get(11)?,
            principal: row.get(12)?,
            retention: row.get(13)?,
            guard: row.get(14)?,
            payload: row.get(15)?,
            reap: row.get::<_, i32>(16)? != 0,
            err: row.get(17)?,
            parent: row.get(18)?,
            parent_key: row.get(19)?,
            created: row.get(20)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        let state = EventState::parse(&self.state)
            .ok_or_else(|| CadenceError::store(format!("unknown state '{}'", self.state)))?;
        let payload: EventPayload = serde_json::from_str(&self.payload)?;
        let guard = self.guard.as_deref().map(serde_json::from_str).transpose()?;
        let err: Option<EventFault> = self.err.as_deref().map(serde_json::from_str).transpose()?;
        let retention = Retention::from_bits(self.retention as u8)
            .ok_or_else(|| CadenceError::store(format!("bad retention {}", self.retention)))?;

        Ok(Event {
            id: EventId::from(self.id),
            tenant: self.tenant,
            key: self.key,
            state,
            start: from_millis(self.start)?,
            schedule: self.schedule,
            started: self.started.map(from_millis).transpose()?,
            count: self.count as u64,
            sequence: self.sequence as u64,
            shard_key: self.shard_key as u32,
            expires_at: self.expires_at.map(from_millis).transpose()?,
            principal: self.principal,
            retention,
            guard,
            payload,
            reap: self.reap,
            err,
            parent: self.parent.map(EventId::from),
            parent_key: self.parent_key,
            created: from_millis(self.created)?,
        })
    }
}

/// Appends the `WHERE` clause for a claim predicate.
fn push_predicate(filter: &ClaimMatch, sql: &mut String, params: &mut Vec<SqlValue>) {
    sql.push_str(" WHERE reap = 0");
    if let Some(id) = &filter.id {
        params.push(SqlValue::Text(id.to_string()));
        sql.push_str(&format!(" AND id = ?{}", params.len()));
    }
    if let Some(state) = filter.state {
        params.push(SqlValue::Text(state.as_str().to_string()));
        sql.push_str(&format!(" AND state = ?{}", params.len()));
    }
    if let Some(start) = filter.start {
        params.push(SqlValue::Integer(to_millis(start)));
        sql.push_str(&format!(" AND start = ?{}", params.len()));
    }
    if let Some(sequence) = filter.sequence {
        params.push(SqlValue::Integer(sequence as i64));
        sql.push_str(&format!(" AND sequence = ?{}", params.len()));
    }
    if let Some(count) = filter.count {
        params.push(SqlValue::Integer(count as i64));
        sql.push_str(&format!(" AND count = ?{}", params.len()));
    }
    match filter.expires_at {
        Some(Some(at)) => {
            params.push(SqlValue::Integer(to_millis(at)));
            sql.push_str(&format!(" AND expires_at = ?{}", params.len()));
        }
        Some(None) => sql.push_str(" AND expires_at IS NULL"),
        None => {}
    }
}

/// Builds the `SET` list for a claim update. Empty when nothing changes.
fn set_clause(update: &ClaimUpdate, params: &mut Vec<SqlValue>) -> Result<Vec<String>> {
    let mut sets = Vec::new();
    if let Some(state) = update.state {
        params.push(SqlValue::Text(state.as_str().to_string()));
        sets.push(format!("state = ?{}", params.len()));
    }
    if let Some(start) = update.start {
        params.push(SqlValue::Integer(to_millis(start)));
        sets.push(format!("start = ?{}", params.len()));
    }
    if let Some(started) = update.started {
        params.push(SqlValue::Integer(to_millis(started)));
        sets.push(format!("started = ?{}", params.len()));
    }
    if let Some(err) = &update.err {
        params.push(SqlValue::Text(serde_json::to_string(&err.sanitized())?));
        sets.push(format!("err = ?{}", params.len()));
    }
    if update.inc_count {
        sets.push("count = count + 1".into());
    }
    if update.inc_sequence {
        sets.push("sequence = sequence + 1".into());
    }
    if update.reap {
        sets.push("reap = 1".into());
    }
    if update.unset_key {
        sets.push("key = NULL".into());
    }
    Ok(sets)
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<Candidate>> {
        if query.states.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }

        let mut params: Vec<SqlValue> = vec![
            SqlValue::Integer(query.shard_lower as i64),
            SqlValue::Integer(query.shard_upper as i64),
            SqlValue::Integer(to_millis(query.now)),
        ];
        let mut placeholders = Vec::new();
        for state in &query.states {
            params.push(SqlValue::Text(state.as_str().to_string()));
            placeholders.push(format!("?{}", params.len()));
        }
        params.push(SqlValue::Integer(query.limit as i64));
        let sql = format!(
            "SELECT id, tenant, type, state, start, schedule, started, count, sequence, expires_at
             FROM events
             WHERE shard_key BETWEEN ?1 AND ?2 AND start <= ?3 AND reap = 0 AND state IN ({})
             ORDER BY start ASC LIMIT ?{}",
            placeholders.join(", "),
            params.len()
        );

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| CadenceError::store(format!("Poll query: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Option<i64>>(9)?,
                ))
            })
            .map_err(|e| CadenceError::store(format!("Poll query: {e}")))?;

        let mut found = Vec::new();
        for row in rows {
            let (id, tenant, kind, state, start, schedule, started, count, sequence, expires_at) =
                row.map_err(|e| CadenceError::store(format!("Poll row: {e}")))?;
            found.push(Candidate {
                id: EventId::from(id),
                tenant,
                event_type: EventType::parse(&kind)
                    .ok_or_else(|| CadenceError::store(format!("unknown type '{kind}'")))?,
                state: EventState::parse(&state)
                    .ok_or_else(|| CadenceError::store(format!("unknown state '{state}'")))?,
                start: from_millis(start)?,
                schedule,
                started: started.map(from_millis).transpose()?,
                count: count as u64,
                sequence: sequence as u64,
                expires_at: expires_at.map(from_millis).transpose()?,
            });
        }
        Ok(found)
    }

    async fn find_one_and_update(
        &self,
        filter: &ClaimMatch,
        update: &ClaimUpdate,
    ) -> Result<Option<Event>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CadenceError::store(format!("Begin: {e}")))?;

        let mut select = String::from("SELECT id FROM events");
        let mut select_params = Vec::new();
        push_predicate(filter, &mut select, &mut select_params);
        select.push_str(" LIMIT 1");
        let id: Option<String> = tx
            .query_row(&select, rusqlite::params_from_iter(select_params), |row| row.get(0))
            .optional()
            .map_err(|e| CadenceError::store(format!("Claim lookup: {e}")))?;
        let Some(id) = id else {
            return Ok(None);
        };

        let mut params = Vec::new();
        let sets = set_clause(update, &mut params)?;
        if !sets.is_empty() {
            let mut sql = format!("UPDATE events SET {}", sets.join(", "));
            let pinned = ClaimMatch {
                id: Some(EventId::from(id.as_str())),
                ..filter.clone()
            };
            push_predicate(&pinned, &mut sql, &mut params);
            let changed = tx
                .execute(&sql, rusqlite::params_from_iter(params))
                .map_err(|e| CadenceError::store(format!("Claim update: {e}")))?;
            if changed == 0 {
                return Ok(None);
            }
        }

        let row = tx
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                [&id],
                EventRow::read,
            )
            .map_err(|e| CadenceError::store(format!("Claim reload: {e}")))?;
        tx.commit()
            .map_err(|e| CadenceError::store(format!("Commit: {e}")))?;
        row.into_event().map(Some)
    }

    async fn insert(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        let guard = event.guard.as_ref().map(serde_json::to_string).transpose()?;
        let err = event
            .err
            .as_ref()
            .map(|f| serde_json::to_string(&f.sanitized()))
            .transpose()?;

        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO events ({EVENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
                ),
                rusqlite::params![
                    event.id.as_str(),
                    event.tenant,
                    event.key,
                    event.event_type().as_str(),
                    event.state.as_str(),
                    to_millis(event.start),
                    event.schedule,
                    event.started.map(to_millis),
                    event.count as i64,
                    event.sequence as i64,
                    event.shard_key as i64,
                    event.expires_at.map(to_millis),
                    event.principal,
                    event.retention.bits() as i64,
                    guard,
                    payload,
                    event.reap as i32,
                    err,
                    event.parent.as_ref().map(|p| p.to_string()),
                    event.parent_key,
                    to_millis(event.created),
                ],
            )
            .map_err(|e| CadenceError::store(format!("Insert event: {e}")))?;
        Ok(())
    }

    async fn get(&self, id: &EventId) -> Result<Option<Event>> {
        let row = self
            .conn()?
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                [id.as_str()],
                EventRow::read,
            )
            .optional()
            .map_err(|e| CadenceError::store(format!("Get event: {e}")))?;
        row.map(EventRow::into_event).transpose()
    }
}

#[async_trait]
impl ConsoleSink for SqliteEventStore {
    async fn write(&self, line: ConsoleLine) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO console_logs (tenant, date, level, message) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![line.tenant, to_millis(line.date), line.level, line.message],
            )
            .map_err(|e| CadenceError::Console(format!("Insert console line: {e}")))?;
        Ok(())
    }
}
