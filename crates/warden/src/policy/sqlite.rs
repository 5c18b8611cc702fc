//! SQLite-backed [`PolicyStore`].
//!
//! The schema is applied inline via `include_str!` every time the database is
//! opened; every statement is idempotent.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::store::{Admin, PolicyManaged, PolicyStore, StoreError};

const SCHEMA: &str = include_str!("../../migrations/001_policy_schema.sql");

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(sqlx::Error::Io(e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Apply the schema to an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        tracing::debug!("Policy schema applied");
        Ok(Self { pool })
    }
}

fn into_vote((admin, policy, value): (String, String, String)) -> PolicyManaged {
    PolicyManaged {
        admin,
        policy,
        value,
    }
}

#[async_trait]
impl PolicyStore for SqliteStore {
    async fn insert_admin(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("INSERT INTO admin (name, activated) VALUES (?1, 1) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_admin(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM admin WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn admin(&self, name: &str) -> Result<Option<Admin>, StoreError> {
        let row = sqlx::query_as::<_, (String, bool)>(
            "SELECT name, activated FROM admin WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(name, activated)| Admin { name, activated }))
    }

    async fn set_activated(&self, name: &str, activated: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE admin SET activated = ?2 WHERE name = ?1")
            .bind(name)
            .bind(activated)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn admins(&self) -> Result<Vec<Admin>, StoreError> {
        let rows = sqlx::query_as::<_, (String, bool)>(
            "SELECT name, activated FROM admin ORDER BY rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, activated)| Admin { name, activated })
            .collect())
    }

    async fn upsert_vote(
        &self,
        admin: &str,
        policy: &str,
        value: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let previous = sqlx::query_as::<_, (String,)>(
            "SELECT value FROM policy_managed WHERE admin = ?1 AND policy = ?2",
        )
        .bind(admin)
        .bind(policy)
        .fetch_optional(&mut *tx)
        .await?
        .map(|(value,)| value);

        // ON CONFLICT keeps the row id, so the vote keeps its position.
        sqlx::query(
            "INSERT INTO policy_managed (admin, policy, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(admin, policy) DO UPDATE SET value = excluded.value",
        )
        .bind(admin)
        .bind(policy)
        .bind(value)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(previous)
    }

    async fn delete_vote(&self, admin: &str, policy: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM policy_managed WHERE admin = ?1 AND policy = ?2")
            .bind(admin)
            .bind(policy)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn votes_for(&self, policy: &str) -> Result<Vec<PolicyManaged>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT admin, policy, value FROM policy_managed WHERE policy = ?1 ORDER BY id ASC",
        )
        .bind(policy)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(into_vote).collect())
    }

    async fn votes_by(&self, admin: &str) -> Result<Vec<PolicyManaged>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT admin, policy, value FROM policy_managed WHERE admin = ?1 ORDER BY id ASC",
        )
        .bind(admin)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(into_vote).collect())
    }

    async fn delete_votes_by(&self, admin: &str) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let policies: Vec<String> = sqlx::query_as::<_, (String,)>(
            "SELECT policy FROM policy_managed WHERE admin = ?1 ORDER BY id ASC",
        )
        .bind(admin)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|(policy,)| policy)
        .collect();
        sqlx::query("DELETE FROM policy_managed WHERE admin = ?1")
            .bind(admin)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(policies)
    }
}
