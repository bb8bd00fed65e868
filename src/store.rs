use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::models::{DailyStat, Event, EventStatus, EventType, ListStatus, ReputationEntry};

/// Maximum length of any stored string field, in characters.
const FIELD_LIMIT: usize = 512;

/// Thread-safe event store: append-only event log plus per-day aggregate
/// counters, both in SQLite.
#[derive(Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    /// Open or create the store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            -- Security event log
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                date TEXT NOT NULL,
                date_expire TEXT,
                ip TEXT NOT NULL DEFAULT '',
                username TEXT NOT NULL DEFAULT '',
                uri TEXT NOT NULL DEFAULT '',
                referer TEXT NOT NULL DEFAULT '',
                user_agent TEXT NOT NULL DEFAULT '',
                threats INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT '',
                details TEXT NOT NULL DEFAULT '',
                score INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_events_type_status ON events(type, status);
            CREATE INDEX IF NOT EXISTS idx_events_ip ON events(ip);
            CREATE INDEX IF NOT EXISTS idx_events_date ON events(date);

            -- Per-day aggregate counters
            CREATE TABLE IF NOT EXISTS daily_stats (
                date TEXT PRIMARY KEY,
                "404s" INTEGER NOT NULL DEFAULT 0,
                "404s_threats" INTEGER NOT NULL DEFAULT 0,
                blocked INTEGER NOT NULL DEFAULT 0,
                threats INTEGER NOT NULL DEFAULT 0,
                logins INTEGER NOT NULL DEFAULT 0,
                logins_failed INTEGER NOT NULL DEFAULT 0,
                logins_success INTEGER NOT NULL DEFAULT 0,
                logins_threats INTEGER NOT NULL DEFAULT 0,
                logins_blocked INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;

        Ok(())
    }

    // ==================== Event Operations ====================

    /// Append an event, clipping string fields to 512 characters.
    ///
    /// The daily-stat row for the event's day is incremented in the same
    /// transaction for every non-`activity`/non-`allow_deny` event.
    /// `expire_at` is persisted only for `allow_deny` rows.
    pub fn record(&self, event: &Event) -> Result<bool> {
        let expire = if event.kind == EventType::AllowDeny {
            event.expire_at.map(ts)
        } else {
            None
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO events (type, date, date_expire, ip, username, uri, referer, user_agent, threats, status, details, score)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                event.kind.as_str(),
                ts(event.date),
                expire,
                clip(&event.ip),
                clip(&event.username),
                clip(&event.uri),
                clip(&event.referer),
                clip(&event.user_agent),
                event.threats as i64,
                event.status.map(|s| s.as_str()).unwrap_or(""),
                clip(&event.details),
                event.score as i64,
            ],
        )?;

        if event.kind != EventType::Activity && event.kind != EventType::AllowDeny {
            Self::bump_stats(&tx, event)?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Increment-or-insert the day's counters in a single upsert so concurrent
    /// writers never lose updates.
    fn bump_stats(tx: &rusqlite::Transaction<'_>, event: &Event) -> Result<()> {
        let day = event.date.format("%Y-%m-%d").to_string();

        let blocked = i64::from(event.status == Some(EventStatus::Blocked));
        let threats = i64::from(event.threats);
        let e404s = i64::from(event.kind == EventType::NotFound);
        let e404s_threats = e404s * threats;
        let logins = i64::from(event.kind == EventType::Login);
        let logins_failed = logins * i64::from(event.status == Some(EventStatus::Failed));
        let logins_success = logins * i64::from(event.status == Some(EventStatus::Success));
        let logins_threats = logins * threats;
        let logins_blocked = logins * blocked;

        tx.execute(
            r#"INSERT INTO daily_stats
                (date, "404s", "404s_threats", blocked, threats,
                 logins, logins_failed, logins_success, logins_threats, logins_blocked)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(date) DO UPDATE SET
                 "404s" = "404s" + excluded."404s",
                 "404s_threats" = "404s_threats" + excluded."404s_threats",
                 blocked = blocked + excluded.blocked,
                 threats = threats + excluded.threats,
                 logins = logins + excluded.logins,
                 logins_failed = logins_failed + excluded.logins_failed,
                 logins_success = logins_success + excluded.logins_success,
                 logins_threats = logins_threats + excluded.logins_threats,
                 logins_blocked = logins_blocked + excluded.logins_blocked"#,
            params![
                day,
                e404s,
                e404s_threats,
                blocked,
                threats,
                logins,
                logins_failed,
                logins_success,
                logins_threats,
                logins_blocked,
            ],
        )?;

        Ok(())
    }

    /// Sum of the `threats` indicator over failed-login rows for an IP in the
    /// window `[since, until]`.
    ///
    /// Sums threat flags rather than counting all failed rows: a failed login
    /// that carried no threat flag does not advance the window total.
    pub fn login_failure_score(
        &self,
        ip: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u32> {
        let conn = self.conn.lock().unwrap();

        let total: u32 = conn.query_row(
            "SELECT COALESCE(SUM(threats), 0) FROM events
             WHERE ip = ? AND type = 'logins' AND status = 'failed' AND date >= ? AND date <= ?",
            params![ip, ts(since), ts(until)],
            |row| row.get(0),
        )?;

        Ok(total)
    }

    // ==================== Reputation Reads ====================

    /// Most recent `allow_deny` row for an IP with the given status whose
    /// expiry is strictly in the future.
    pub fn latest_listed(
        &self,
        ip: &str,
        status: ListStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<ReputationEntry>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            "SELECT date, date_expire, details FROM events
             WHERE ip = ? AND type = 'allow_deny' AND status = ?
               AND date_expire IS NOT NULL AND date_expire > ?
             ORDER BY date DESC, id DESC LIMIT 1",
            params![ip, status.as_str(), ts(now)],
            |row| Self::entry_from_row(row, status),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Most recent timed `deny` row for an IP, expired or not. This is the
    /// escalation-tier input: only the latest prior ban's duration matters.
    pub fn last_timed_deny(&self, ip: &str) -> Result<Option<ReputationEntry>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            "SELECT date, date_expire, details FROM events
             WHERE ip = ? AND type = 'allow_deny' AND status = 'deny'
               AND date_expire IS NOT NULL
             ORDER BY date DESC, id DESC LIMIT 1",
            params![ip],
            |row| Self::entry_from_row(row, ListStatus::Deny),
        )
        .optional()
        .map_err(Into::into)
    }

    fn entry_from_row(
        row: &rusqlite::Row<'_>,
        status: ListStatus,
    ) -> rusqlite::Result<ReputationEntry> {
        Ok(ReputationEntry {
            status,
            created_at: parse_ts(&row.get::<_, String>(0)?)?,
            expire_at: row
                .get::<_, Option<String>>(1)?
                .map(|s| parse_ts(&s))
                .transpose()?,
            details: row.get(2)?,
        })
    }

    // ==================== Retention ====================

    /// Delete the oldest rows of a type beyond `retain`, oldest-first.
    /// The delete is a bounded batch so it is safe alongside live traffic.
    pub fn cleanup(&self, kind: EventType, retain: u64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();

        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE type = ?",
            [kind.as_str()],
            |row| row.get(0),
        )?;

        if total <= retain {
            return Ok(0);
        }

        let excess = total - retain;
        let deleted = conn.execute(
            "DELETE FROM events WHERE id IN (
                 SELECT id FROM events WHERE type = ? ORDER BY date ASC, id ASC LIMIT ?
             )",
            params![kind.as_str(), excess],
        )?;

        Ok(deleted as u64)
    }

    /// Delete allow/deny rows whose expiry passed more than `grace` ago.
    pub fn expire_stale_allow_deny(&self, grace: Duration) -> Result<u64> {
        let cutoff = Utc::now() - grace;
        let conn = self.conn.lock().unwrap();

        let deleted = conn.execute(
            "DELETE FROM events
             WHERE type = 'allow_deny' AND status IN ('allow', 'deny')
               AND date_expire IS NOT NULL AND date_expire < ?",
            [ts(cutoff)],
        )?;

        Ok(deleted as u64)
    }

    // ==================== Read Paths ====================

    /// Most recent events, newest first
    pub fn recent_events(&self, limit: u32) -> Result<Vec<Event>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id, type, date, date_expire, ip, username, uri, referer, user_agent,
                    threats, status, details, score
             FROM events ORDER BY date DESC, id DESC LIMIT ?",
        )?;

        let events = stmt
            .query_map([limit], |row| {
                let kind = EventType::from_str(&row.get::<_, String>(1)?)
                    .map_err(|e| conversion_err(1, e))?;
                let status_raw: String = row.get(10)?;
                let status = if status_raw.is_empty() {
                    None
                } else {
                    Some(EventStatus::from_str(&status_raw).map_err(|e| conversion_err(10, e))?)
                };

                Ok(Event {
                    id: Some(row.get(0)?),
                    kind,
                    date: parse_ts(&row.get::<_, String>(2)?)?,
                    expire_at: row
                        .get::<_, Option<String>>(3)?
                        .map(|s| parse_ts(&s))
                        .transpose()?,
                    ip: row.get(4)?,
                    username: row.get(5)?,
                    uri: row.get(6)?,
                    referer: row.get(7)?,
                    user_agent: row.get(8)?,
                    threats: row.get::<_, i64>(9)? != 0,
                    status,
                    details: row.get(11)?,
                    score: row.get::<_, i64>(12)? as u8,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(events)
    }

    /// Count of stored events of a type
    pub fn count_events(&self, kind: EventType) -> Result<u64> {
        let conn = self.conn.lock().unwrap();

        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE type = ?",
            [kind.as_str()],
            |row| row.get(0),
        )?;

        Ok(count)
    }

    /// Aggregate counters for one day, if any events were recorded
    pub fn daily_stat(&self, day: NaiveDate) -> Result<Option<DailyStat>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            r#"SELECT "404s", "404s_threats", blocked, threats,
                      logins, logins_failed, logins_success, logins_threats, logins_blocked
               FROM daily_stats WHERE date = ?"#,
            [day.format("%Y-%m-%d").to_string()],
            |row| {
                Ok(DailyStat {
                    date: Some(day),
                    e404s: row.get(0)?,
                    e404s_threats: row.get(1)?,
                    blocked: row.get(2)?,
                    threats: row.get(3)?,
                    logins: row.get(4)?,
                    logins_failed: row.get(5)?,
                    logins_success: row.get(6)?,
                    logins_threats: row.get(7)?,
                    logins_blocked: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }
}

/// Fixed-width UTC timestamp text, so string comparison orders correctly.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(0, e))
}

fn conversion_err(
    col: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(err))
}

/// Limit a field to 512 characters
fn clip(s: &str) -> String {
    s.chars().take(FIELD_LIMIT).collect()
}
