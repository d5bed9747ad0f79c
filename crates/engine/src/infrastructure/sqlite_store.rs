//! SQLite command store for production persistence
//!
//! One row per command id. Inserts use `ON CONFLICT DO NOTHING` so duplicate
//! deliveries never create a second row, and every state change is a
//! compare-and-swap on the row's `revision`, which makes the `Executing` state
//! an execution lock even across processes sharing the same database file.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use storesync_domain::{
    Command, CommandId, CommandRecord, CommandState, PlayerId, StateUpdate,
};

use crate::infrastructure::ports::{
    ClockPort, CommandStorePort, PendingCursor, PutOutcome, StoreError,
};

/// Optimistic write attempts before giving up on a contended row
const MAX_CAS_ATTEMPTS: usize = 3;

pub struct SqliteCommandStore {
    pool: SqlitePool,
    clock: Arc<dyn ClockPort>,
}

impl SqliteCommandStore {
    /// Open (or create) the database file and ensure the schema exists.
    pub async fn open(path: &str, clock: Arc<dyn ClockPort>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::database("open", e))?;

        Self::from_pool(pool, clock).await
    }

    pub async fn from_pool(pool: SqlitePool, clock: Arc<dyn ClockPort>) -> Result<Self, StoreError> {
        // AUTOINCREMENT keeps sequence numbers monotonic even after purges
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS commands (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                player TEXT NOT NULL,
                payload TEXT NOT NULL,
                requires_online_player INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                received_at TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                not_before TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL,
                completed_at TEXT,
                acknowledged_at TEXT,
                revision INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| StoreError::database("create_table", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_commands_state
            ON commands(state, received_at, sequence)
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| StoreError::database("create_index", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_commands_player
            ON commands(player, state)
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| StoreError::database("create_index", e))?;

        Ok(Self { pool, clock })
    }

    async fn fetch(&self, id: &CommandId) -> Result<Option<CommandRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM commands WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("get", e))?;

        row.map(|row| row_to_record(&row)).transpose()
    }

    /// Write every mutable column, guarded by the revision the change was based on.
    async fn write_if_unchanged(
        &self,
        record: &CommandRecord,
        expected_revision: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE commands
            SET state = ?, attempts = ?, not_before = ?, last_error = ?,
                updated_at = ?, completed_at = ?, acknowledged_at = ?, revision = ?
            WHERE id = ? AND revision = ?
            "#,
        )
        .bind(record.state.as_str())
        .bind(record.attempts as i64)
        .bind(record.not_before.map(format_ts))
        .bind(&record.last_error)
        .bind(format_ts(record.updated_at))
        .bind(record.completed_at.map(format_ts))
        .bind(record.acknowledged_at.map(format_ts))
        .bind(record.revision)
        .bind(record.command.id.as_str())
        .bind(expected_revision)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("update_state", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn fetch_many<'q>(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> Result<Vec<CommandRecord>, StoreError> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::database(operation, e))?;

        rows.iter().map(row_to_record).collect()
    }
}

#[async_trait]
impl CommandStorePort for SqliteCommandStore {
    async fn put(&self, command: Command) -> Result<PutOutcome, StoreError> {
        let received_at = format_ts(command.received_at);

        let result = sqlx::query(
            r#"
            INSERT INTO commands
            (id, player, payload, requires_online_player, priority, received_at, state, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(command.id.as_str())
        .bind(command.player.as_str())
        .bind(&command.payload)
        .bind(command.requires_online_player as i64)
        .bind(command.priority as i64)
        .bind(&received_at)
        .bind(&received_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("put", e))?;

        let record = self
            .fetch(&command.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(command.id.clone()))?;

        if result.rows_affected() == 1 {
            Ok(PutOutcome::Inserted(record))
        } else {
            Ok(PutOutcome::Existing(record))
        }
    }

    async fn get(&self, id: &CommandId) -> Result<Option<CommandRecord>, StoreError> {
        self.fetch(id).await
    }

    async fn update_state(
        &self,
        id: &CommandId,
        update: StateUpdate,
    ) -> Result<CommandRecord, StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .fetch(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;

            let mut next = current.clone();
            if let Err(e) = next.apply(&update, self.clock.now()) {
                tracing::warn!(command_id = %id, error = %e, "Rejected command state change");
                return Err(StoreError::from_domain(id, e));
            }

            if self.write_if_unchanged(&next, current.revision).await? {
                return Ok(next);
            }
            tracing::debug!(command_id = %id, "Concurrent update detected, re-reading");
        }

        Err(StoreError::database(
            "update_state",
            format!("command {id} kept changing underneath the update"),
        ))
    }

    async fn list_pending_page(
        &self,
        player: Option<PlayerId>,
        after: Option<PendingCursor>,
        limit: usize,
    ) -> Result<Vec<CommandRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT * FROM commands WHERE state IN ('pending', 'executing')",
        );
        if player.is_some() {
            sql.push_str(" AND player = ?");
        }
        if after.is_some() {
            sql.push_str(" AND (received_at > ? OR (received_at = ? AND sequence > ?))");
        }
        sql.push_str(" ORDER BY received_at ASC, sequence ASC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(player) = &player {
            query = query.bind(player.as_str());
        }
        if let Some(cursor) = &after {
            let received_at = format_ts(cursor.received_at);
            query = query
                .bind(received_at.clone())
                .bind(received_at)
                .bind(cursor.sequence);
        }
        query = query.bind(limit as i64);

        self.fetch_many("list_pending", query).await
    }

    async fn list_unreported(&self) -> Result<Vec<CommandRecord>, StoreError> {
        let query = sqlx::query(
            r#"
            SELECT * FROM commands
            WHERE state = 'executed'
            OR (state = 'failed' AND acknowledged_at IS NULL)
            ORDER BY received_at ASC, sequence ASC
            "#,
        );
        self.fetch_many("list_unreported", query).await
    }

    async fn mark_reported(&self, id: &CommandId) -> Result<CommandRecord, StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .fetch(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;

            let mut next = current.clone();
            let changed = next
                .mark_reported(self.clock.now())
                .map_err(|e| StoreError::from_domain(id, e))?;
            if !changed {
                return Ok(current);
            }

            if self.write_if_unchanged(&next, current.revision).await? {
                return Ok(next);
            }
        }

        Err(StoreError::database(
            "mark_reported",
            format!("command {id} kept changing underneath the update"),
        ))
    }

    async fn recover_executing(&self) -> Result<usize, StoreError> {
        let now = format_ts(self.clock.now());

        let result = sqlx::query(
            r#"
            UPDATE commands
            SET state = 'pending', not_before = NULL, last_error = 'interrupted by restart',
                updated_at = ?, revision = revision + 1
            WHERE state = 'executing'
            "#,
        )
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("recover_executing", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn purge_acknowledged(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = format_ts(older_than);

        let result = sqlx::query(
            r#"
            DELETE FROM commands
            WHERE state IN ('acknowledged', 'failed')
            AND acknowledged_at IS NOT NULL
            AND acknowledged_at < ?
            "#,
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("purge_acknowledged", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

// Fixed-width timestamps so that text comparison in SQL matches time order
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::serialization(format!("Invalid datetime '{value}': {e}")))
}

fn parse_optional_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_ts).transpose()
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::serialization(format!("column {name}: {e}")))
}

fn row_to_record(row: &SqliteRow) -> Result<CommandRecord, StoreError> {
    let state: String = column(row, "state")?;
    let state = CommandState::from_str(&state).map_err(StoreError::serialization)?;
    let received_at: String = column(row, "received_at")?;
    let updated_at: String = column(row, "updated_at")?;
    let requires_online_player: i64 = column(row, "requires_online_player")?;
    let priority: i64 = column(row, "priority")?;
    let attempts: i64 = column(row, "attempts")?;

    let command = Command {
        id: CommandId::new(column::<String>(row, "id")?),
        player: PlayerId::new(column::<String>(row, "player")?),
        payload: column(row, "payload")?,
        requires_online_player: requires_online_player != 0,
        priority: priority as i32,
        received_at: parse_ts(&received_at)?,
    };

    Ok(CommandRecord {
        command,
        sequence: column(row, "sequence")?,
        state,
        attempts: attempts as u32,
        not_before: parse_optional_ts(column(row, "not_before")?)?,
        last_error: column(row, "last_error")?,
        updated_at: parse_ts(&updated_at)?,
        completed_at: parse_optional_ts(column(row, "completed_at")?)?,
        acknowledged_at: parse_optional_ts(column(row, "acknowledged_at")?)?,
        revision: column(row, "revision")?,
    })
}
