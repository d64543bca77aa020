use crate::constants::{DB_CHECKPOINT_RETENTION_DAYS, DB_PRAGMAS};
use crate::store::{now_timestamp, ConversationStore};
use crate::types::{
    NewSession, RelayError, RequestId, Result, Role, Session, SessionId, TurnId, TurnRecord,
    Variant,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

pub type DbPool = SqlitePool;

pub async fn init_db(path: &str) -> Result<DbPool> {
    let in_memory = path == ":memory:";
    let url = if in_memory {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite:{}", path)
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    // Each in-memory connection is its own database, so pin the pool to one.
    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 8 })
        .connect_with(options)
        .await?;

    configure_db(&pool).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    verify_schema_version(&pool).await;

    if let Err(e) = cleanup_old_checkpoints(&pool, DB_CHECKPOINT_RETENTION_DAYS).await {
        tracing::warn!("Database cleanup failed: {}", e);
    }

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        sqlx::query(pragma).execute(pool).await?;
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

pub async fn cleanup_old_checkpoints(
    pool: &DbPool,
    retention_days: i64,
) -> std::result::Result<u64, sqlx::Error> {
    let threshold = format!("-{} days", retention_days);

    let deleted =
        sqlx::query("DELETE FROM stream_checkpoints WHERE updated_at < datetime('now', ?)")
            .bind(&threshold)
            .execute(pool)
            .await?;

    if deleted.rows_affected() > 0 {
        tracing::info!(
            "Cleanup complete: removed {} stream checkpoints older than {} days.",
            deleted.rows_affected(),
            retention_days
        );
    }

    Ok(deleted.rows_affected())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

fn row_to_turn(row: &SqliteRow) -> Result<TurnRecord> {
    let role_raw: String = row.try_get("role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| RelayError::Store(format!("unknown role '{}' in turns table", role_raw)))?;
    Ok(TurnRecord {
        id: TurnId(row.try_get("id")?),
        session_id: SessionId(row.try_get("session_id")?),
        role,
        content: row.try_get("content")?,
        sequence: row.try_get("seq")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_variant(row: &SqliteRow) -> Result<Variant> {
    let version: i64 = row.try_get("version")?;
    let is_active: i64 = row.try_get("is_active")?;
    Ok(Variant {
        parent_turn_id: TurnId(row.try_get("parent_turn_id")?),
        version: u32::try_from(version)
            .map_err(|_| RelayError::Store(format!("variant version {} out of range", version)))?,
        content: row.try_get("content")?,
        is_active: is_active != 0,
        created_at: row.try_get("created_at")?,
    })
}

const TURN_COLUMNS: &str = "seq, id, session_id, role, content, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn connect(path: &str) -> Result<Self> {
        Ok(Self::new(init_db(path).await?))
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect(":memory:").await
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_session(&self, new: NewSession) -> Result<Session> {
        let session = Session {
            id: SessionId::generate(),
            title: new.title,
            summary: new.summary,
            last_active_at: Some(now_timestamp()),
        };
        sqlx::query("INSERT INTO sessions (id, title, summary, last_active_at) VALUES (?, ?, ?, ?)")
            .bind(&session.id.0)
            .bind(&session.title)
            .bind(&session.summary)
            .bind(&session.last_active_at)
            .execute(&self.pool)
            .await?;
        Ok(session)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT id, title, summary, last_active_at FROM sessions WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(Session {
                id: SessionId(r.try_get("id")?),
                title: r.try_get("title")?,
                summary: r.try_get("summary")?,
                last_active_at: r.try_get("last_active_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn touch_session(&self, id: &SessionId) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET last_active_at = ? WHERE id = ?")
            .bind(now_timestamp())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("session {}", id)).into());
        }
        Ok(())
    }

    async fn list_turns(&self, session: &SessionId) -> Result<Vec<TurnRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM turns WHERE session_id = ? ORDER BY seq ASC",
            TURN_COLUMNS
        ))
        .bind(&session.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_turn).collect()
    }

    async fn get_turn(&self, id: &TurnId) -> Result<Option<TurnRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM turns WHERE id = ?", TURN_COLUMNS))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_turn).transpose()
    }

    async fn latest_turn(&self, session: &SessionId) -> Result<Option<TurnRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM turns WHERE session_id = ? ORDER BY seq DESC LIMIT 1",
            TURN_COLUMNS
        ))
        .bind(&session.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_turn).transpose()
    }

    async fn create_turn(
        &self,
        session: &SessionId,
        role: Role,
        content: &str,
    ) -> Result<TurnRecord> {
        if self.get_session(session).await?.is_none() {
            return Err(RelayError::NotFound(format!("session {}", session)).into());
        }
        let id = TurnId::generate();
        let created_at = now_timestamp();
        let result = sqlx::query(
            "INSERT INTO turns (id, session_id, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id.0)
        .bind(&session.0)
        .bind(role.as_str())
        .bind(content)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;
        Ok(TurnRecord {
            id,
            session_id: session.clone(),
            role,
            content: content.to_string(),
            sequence: result.last_insert_rowid(),
            created_at,
        })
    }

    async fn append_to_turn(&self, id: &TurnId, addition: &str) -> Result<TurnRecord> {
        let result = sqlx::query("UPDATE turns SET content = content || ? WHERE id = ?")
            .bind(addition)
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("turn {}", id)).into());
        }
        self.get_turn(id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("turn {}", id)).into())
    }

    async fn delete_turn(&self, id: &TurnId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM turns WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_stream_checkpoint(
        &self,
        session: &SessionId,
        request: &RequestId,
        partial: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO stream_checkpoints (session_id, request_id, partial_text, updated_at)
             VALUES (?, ?, ?, datetime('now'))
             ON CONFLICT(session_id, request_id)
             DO UPDATE SET partial_text = excluded.partial_text, updated_at = excluded.updated_at",
        )
        .bind(&session.0)
        .bind(&request.0)
        .bind(partial)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_stream_checkpoint(
        &self,
        session: &SessionId,
        request: &RequestId,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT partial_text FROM stream_checkpoints WHERE session_id = ? AND request_id = ?",
        )
        .bind(&session.0)
        .bind(&request.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(text,)| text))
    }

    async fn save_debug_snapshot(&self, session: &SessionId, snapshot: &Value) -> Result<()> {
        sqlx::query("UPDATE sessions SET debug_snapshot = ? WHERE id = ?")
            .bind(serde_json::to_string(snapshot)?)
            .bind(&session.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_debug_snapshot(&self, session: &SessionId) -> Result<Option<Value>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT debug_snapshot FROM sessions WHERE id = ?")
                .bind(&session.0)
                .fetch_optional(&self.pool)
                .await?;
        match row.and_then(|(raw,)| raw) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn max_variant_version(&self, parent: &TurnId) -> Result<u32> {
        let (max,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM variants WHERE parent_turn_id = ?",
        )
        .bind(&parent.0)
        .fetch_one(&self.pool)
        .await?;
        u32::try_from(max)
            .map_err(|_| RelayError::Store(format!("variant version {} out of range", max)).into())
    }

    async fn variant_exists(&self, parent: &TurnId, version: u32) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM variants WHERE parent_turn_id = ? AND version = ?")
            .bind(&parent.0)
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_variant(
        &self,
        parent: &TurnId,
        version: u32,
        content: &str,
    ) -> Result<Variant> {
        let created_at = now_timestamp();
        let inserted = sqlx::query(
            "INSERT INTO variants (parent_turn_id, version, content, is_active, created_at)
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(&parent.0)
        .bind(version as i64)
        .bind(content)
        .bind(&created_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(Variant {
                parent_turn_id: parent.clone(),
                version,
                content: content.to_string(),
                is_active: false,
                created_at,
            }),
            Err(e) if is_unique_violation(&e) => Err(RelayError::VariantVersionConflict {
                parent: parent.clone(),
                version,
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_variants(&self, parent: &TurnId) -> Result<Vec<Variant>> {
        let rows = sqlx::query(
            "SELECT parent_turn_id, version, content, is_active, created_at
             FROM variants WHERE parent_turn_id = ? ORDER BY version ASC",
        )
        .bind(&parent.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_variant).collect()
    }

    async fn activate_variant(&self, parent: &TurnId, version: u32) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM variants WHERE parent_turn_id = ? AND version = ?")
            .bind(&parent.0)
            .bind(version as i64)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(
                RelayError::NotFound(format!("variant {} of turn {}", version, parent)).into(),
            );
        }

        sqlx::query("UPDATE variants SET is_active = 0 WHERE parent_turn_id = ?")
            .bind(&parent.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE variants SET is_active = 1 WHERE parent_turn_id = ? AND version = ?")
            .bind(&parent.0)
            .bind(version as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
