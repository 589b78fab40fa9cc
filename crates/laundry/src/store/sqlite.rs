//! SQLite-backed store (durable across restarts).
//!
//! Timestamps are stored as epoch milliseconds so `ORDER BY` is exact. The
//! machine compare-and-set is one `UPDATE` guarded on every column of the
//! expected state; `rows_affected()` tells whether it applied.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};

use super::{Store, StoreError, StoreResult};
use crate::machine::{Machine, MachineId, MachineState, MachineStatus};
use crate::notification::{Notification, NotificationId};
use crate::reservation::{Reservation, ReservationId};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS machines (
        machine_id INTEGER PRIMARY KEY,
        status TEXT NOT NULL,
        owner TEXT,
        started_at INTEGER,
        ends_at INTEGER,
        duration_minutes INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS reservations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        requester TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS reservations_by_age ON reservations (created_at, id)",
    "CREATE TABLE IF NOT EXISTS notifications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        recipient TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        read INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS notifications_by_recipient ON notifications (recipient, read)",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

/// Flat column form of a [`MachineState`].
struct MachineColumns {
    status: &'static str,
    owner: Option<String>,
    started_at: Option<i64>,
    ends_at: Option<i64>,
    duration_minutes: i64,
}

impl From<&MachineState> for MachineColumns {
    fn from(state: &MachineState) -> Self {
        let usage = state.usage();
        Self {
            status: state.status().as_str(),
            owner: usage.map(|u| u.owner.clone()),
            started_at: usage.map(|u| u.started_at.timestamp_millis()),
            ends_at: usage.map(|u| u.ends_at.timestamp_millis()),
            duration_minutes: usage.map(|u| i64::from(u.duration_minutes)).unwrap_or(0),
        }
    }
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn machine_from_row(row: &SqliteRow) -> StoreResult<Machine> {
    let raw_id: i64 = row.try_get("machine_id")?;
    let id = u32::try_from(raw_id)
        .map(MachineId::new)
        .map_err(|_| StoreError::Corrupt(format!("machine id out of range: {raw_id}")))?;

    let raw_status: String = row.try_get("status")?;
    let status = MachineStatus::parse(&raw_status).ok_or_else(|| {
        StoreError::Corrupt(format!("machine {id}: unknown status {raw_status:?}"))
    })?;

    let owner: Option<String> = row.try_get("owner")?;
    let started_at = row
        .try_get::<Option<i64>, _>("started_at")?
        .map(from_millis)
        .transpose()?;
    let ends_at = row
        .try_get::<Option<i64>, _>("ends_at")?
        .map(from_millis)
        .transpose()?;
    let duration: i64 = row.try_get("duration_minutes")?;
    let duration_minutes = u32::try_from(duration)
        .map_err(|_| StoreError::Corrupt(format!("machine {id}: bad duration {duration}")))?;

    let state = MachineState::from_parts(status, owner, started_at, ends_at, duration_minutes)
        .ok_or_else(|| {
            StoreError::Corrupt(format!("machine {id}: inconsistent {raw_status} row"))
        })?;

    Ok(Machine { id, state })
}

fn reservation_from_row(row: &SqliteRow) -> StoreResult<Reservation> {
    Ok(Reservation {
        id: ReservationId::new(row.try_get("id")?),
        requester: row.try_get("requester")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        expires_at: from_millis(row.try_get("expires_at")?)?,
    })
}

fn notification_from_row(row: &SqliteRow) -> StoreResult<Notification> {
    Ok(Notification {
        id: NotificationId::new(row.try_get("id")?),
        recipient: row.try_get("recipient")?,
        message: row.try_get("message")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        read: row.try_get::<i64, _>("read")? != 0,
    })
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database. Uses a single pinned connection, since every
    /// SQLite connection to `:memory:` sees its own database.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> StoreResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    async fn machine_exists(&self, id: MachineId) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM machines WHERE machine_id = ?")
            .bind(i64::from(id.get()))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn init_machines(&self, count: u32) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;

        let existing: i64 = sqlx::query("SELECT COUNT(*) AS count FROM machines")
            .fetch_one(&mut *tx)
            .await?
            .try_get("count")?;

        if existing == 0 {
            for id in 1..=count {
                sqlx::query(
                    "INSERT INTO machines (machine_id, status, duration_minutes) VALUES (?, ?, 0)",
                )
                .bind(i64::from(id))
                .bind(MachineStatus::Available.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(if existing == 0 {
            count as usize
        } else {
            existing as usize
        })
    }

    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        let rows = sqlx::query(
            "SELECT machine_id, status, owner, started_at, ends_at, duration_minutes
             FROM machines ORDER BY machine_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(machine_from_row).collect()
    }

    async fn update_machine(&self, id: MachineId, state: MachineState) -> StoreResult<()> {
        let cols = MachineColumns::from(&state);
        let result = sqlx::query(
            "UPDATE machines
             SET status = ?, owner = ?, started_at = ?, ends_at = ?, duration_minutes = ?
             WHERE machine_id = ?",
        )
        .bind(cols.status)
        .bind(cols.owner)
        .bind(cols.started_at)
        .bind(cols.ends_at)
        .bind(cols.duration_minutes)
        .bind(i64::from(id.get()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownMachine(id));
        }
        Ok(())
    }

    async fn compare_and_set_machine(
        &self,
        id: MachineId,
        expected: &MachineState,
        new: MachineState,
    ) -> StoreResult<bool> {
        let old = MachineColumns::from(expected);
        let cols = MachineColumns::from(&new);
        let result = sqlx::query(
            "UPDATE machines
             SET status = ?, owner = ?, started_at = ?, ends_at = ?, duration_minutes = ?
             WHERE machine_id = ?
               AND status = ? AND owner IS ? AND started_at IS ? AND ends_at IS ?
               AND duration_minutes = ?",
        )
        .bind(cols.status)
        .bind(cols.owner)
        .bind(cols.started_at)
        .bind(cols.ends_at)
        .bind(cols.duration_minutes)
        .bind(i64::from(id.get()))
        .bind(old.status)
        .bind(old.owner)
        .bind(old.started_at)
        .bind(old.ends_at)
        .bind(old.duration_minutes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.machine_exists(id).await? {
            return Err(StoreError::UnknownMachine(id));
        }
        Ok(false)
    }

    async fn insert_reservation(
        &self,
        requester: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<ReservationId> {
        let result = sqlx::query(
            "INSERT INTO reservations (requester, created_at, expires_at) VALUES (?, ?, ?)",
        )
        .bind(requester)
        .bind(created_at.timestamp_millis())
        .bind(expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(ReservationId::new(result.last_insert_rowid()))
    }

    async fn list_reservations(&self) -> StoreResult<Vec<Reservation>> {
        let rows = sqlx::query(
            "SELECT id, requester, created_at, expires_at
             FROM reservations ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn delete_reservation(&self, id: ReservationId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM reservations WHERE id = ?")
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_reservations_by_requester(&self, requester: &str) -> StoreResult<usize> {
        let result = sqlx::query("DELETE FROM reservations WHERE requester = ?")
            .bind(requester)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn delete_expired_reservations(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let result = sqlx::query("DELETE FROM reservations WHERE expires_at < ?")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn insert_notification(
        &self,
        recipient: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<NotificationId> {
        let result = sqlx::query(
            "INSERT INTO notifications (recipient, message, created_at, read) VALUES (?, ?, ?, 0)",
        )
        .bind(recipient)
        .bind(message)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(NotificationId::new(result.last_insert_rowid()))
    }

    async fn list_unread_notifications(&self, recipient: &str) -> StoreResult<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT id, recipient, message, created_at, read
             FROM notifications
             WHERE recipient = ? AND read = 0
             ORDER BY created_at DESC, id DESC",
        )
        .bind(recipient)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn mark_all_read(&self, recipient: &str) -> StoreResult<usize> {
        let result =
            sqlx::query("UPDATE notifications SET read = 1 WHERE recipient = ? AND read = 0")
                .bind(recipient)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() as usize)
    }
}
