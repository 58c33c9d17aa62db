//! SQLite-backed consent store.
//!
//! A record is "current" only when its `policy_version` matches the
//! version the store was opened with; bumping the version in config
//! invalidates every earlier acceptance without touching the rows.

use aviary_core::{
    config::{shellexpand, ConsentConfig},
    error::AviaryError,
};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// One user's acceptance of the current terms.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ConsentRecord {
    pub user_id: i64,
    pub accepted_at: String,
    pub policy_version: i64,
    pub age_confirmed: bool,
}

/// Durable per-user consent records.
#[derive(Clone)]
pub struct ConsentStore {
    pool: SqlitePool,
    policy_version: i64,
}

impl ConsentStore {
    /// Open (or create) the store, running migrations.
    ///
    /// Failure here is fatal at startup: a gateway that cannot check
    /// consent must not accept traffic.
    pub async fn new(config: &ConsentConfig, policy_version: i64) -> Result<Self, AviaryError> {
        let db_path = shellexpand(&config.db_path);

        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AviaryError::Consent(format!("failed to create data dir: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
            .map_err(|e| AviaryError::Consent(format!("invalid db path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| AviaryError::Consent(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;

        info!("consent store initialized at {db_path} (policy v{policy_version})");

        Ok(Self {
            pool,
            policy_version,
        })
    }

    /// Wrap an existing pool, running migrations. Used by tests and
    /// one-off tooling that manage their own connection.
    pub async fn from_pool(pool: SqlitePool, policy_version: i64) -> Result<Self, AviaryError> {
        Self::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            policy_version,
        })
    }

    /// Run SQL migrations, tracking which have already been applied.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), AviaryError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| AviaryError::Consent(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] =
            &[("001_consent", include_str!("../migrations/001_consent.sql"))];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| {
                        AviaryError::Consent(format!("failed to check migration {name}: {e}"))
                    })?;

            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| AviaryError::Consent(format!("migration {name} failed: {e}")))?;

            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| {
                    AviaryError::Consent(format!("failed to record migration {name}: {e}"))
                })?;
        }
        Ok(())
    }

    /// Record acceptance of the current policy version. Upsert: a repeat
    /// accept refreshes the timestamp and version.
    pub async fn set_accepted(&self, user_id: i64, age_confirmed: bool) -> Result<(), AviaryError> {
        sqlx::query(
            "INSERT INTO consent (user_id, accepted_at, policy_version, age_confirmed) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET \
                 accepted_at = excluded.accepted_at, \
                 policy_version = excluded.policy_version, \
                 age_confirmed = excluded.age_confirmed",
        )
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .bind(self.policy_version)
        .bind(age_confirmed)
        .execute(&self.pool)
        .await
        .map_err(|e| AviaryError::Consent(format!("upsert failed: {e}")))?;

        Ok(())
    }

    /// Whether the user holds a current-version acceptance.
    pub async fn has_accepted(&self, user_id: i64) -> Result<bool, AviaryError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT policy_version FROM consent WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AviaryError::Consent(format!("select failed: {e}")))?;

        Ok(matches!(row, Some((v,)) if v == self.policy_version))
    }

    /// Remove any acceptance record. No error if none exists.
    pub async fn delete_acceptance(&self, user_id: i64) -> Result<(), AviaryError> {
        sqlx::query("DELETE FROM consent WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AviaryError::Consent(format!("delete failed: {e}")))?;

        Ok(())
    }

    /// Fetch the raw record, current-version or not.
    pub async fn record(&self, user_id: i64) -> Result<Option<ConsentRecord>, AviaryError> {
        sqlx::query_as(
            "SELECT user_id, accepted_at, policy_version, age_confirmed \
             FROM consent WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AviaryError::Consent(format!("select failed: {e}")))
    }
}
