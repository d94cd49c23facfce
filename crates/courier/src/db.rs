//! Embedded relational store.
//!
//! One SQLite file holds the error counters the admin aggregator thresholds
//! on and the username-to-uid cache used to derive push targets. All writes
//! go through the aggregator or startup code; reads tolerate concurrent
//! writes in unrelated keys.

use std::collections::BTreeMap;
use std::path::Path;

use sqlx::Row as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::types::ServiceName;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The queried row does not exist. Distinct from a failing query.
    #[error("no such row")]
    NotFound,

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Persistent per-service counter pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceErrorCounts {
    pub setup_errors: u32,
    pub push_errors: BTreeMap<String, u32>,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS setup_errors (
        service_id INTEGER NOT NULL UNIQUE REFERENCES services(id) ON DELETE CASCADE,
        count INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS push_errors (
        service_id INTEGER NOT NULL REFERENCES services(id) ON DELETE CASCADE,
        node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
        count INTEGER NOT NULL,
        UNIQUE (service_id, node_id)
    )",
    "CREATE TABLE IF NOT EXISTS uids (
        username TEXT NOT NULL UNIQUE,
        uid INTEGER NOT NULL
    )",
];

/// Handle to the courier database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self { pool })
    }

    // ---- uid cache ----

    /// Upsert username/uid rows; the most recent uid wins.
    pub async fn insert_uids(&self, rows: &[(String, u32)]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (username, uid) in rows {
            sqlx::query(
                "INSERT INTO uids (username, uid) VALUES (?, ?)
                 ON CONFLICT (username) DO UPDATE SET uid = excluded.uid",
            )
            .bind(username)
            .bind(i64::from(*uid))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// The uid mapped to `username`, or [`StoreError::NotFound`].
    pub async fn uid_by_username(&self, username: &str) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT uid FROM uids WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or(StoreError::NotFound)?;
        Ok(row.get::<i64, _>("uid") as u32)
    }

    /// Read back every stored mapping, for post-load confirmation logging.
    pub async fn confirm_uids(&self) -> Result<Vec<(String, u32)>, StoreError> {
        let rows = sqlx::query("SELECT username, uid FROM uids ORDER BY username")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("username"), r.get::<i64, _>("uid") as u32))
            .collect())
    }

    // ---- error counters ----

    /// Counters for one service; zeroes when nothing is recorded yet.
    pub async fn error_counts_for_service(
        &self,
        service: &ServiceName,
    ) -> Result<ServiceErrorCounts, StoreError> {
        let name = service.to_string();

        let setup = sqlx::query(
            "SELECT se.count AS count FROM setup_errors se
             JOIN services s ON s.id = se.service_id
             WHERE s.name = ?",
        )
        .bind(&name)
        .fetch_optional(&self.pool)
        .await?;

        let push_rows = sqlx::query(
            "SELECT n.name AS node, pe.count AS count FROM push_errors pe
             JOIN services s ON s.id = pe.service_id
             JOIN nodes n ON n.id = pe.node_id
             WHERE s.name = ?",
        )
        .bind(&name)
        .fetch_all(&self.pool)
        .await?;

        Ok(ServiceErrorCounts {
            setup_errors: setup.map(|r| r.get::<i64, _>("count") as u32).unwrap_or(0),
            push_errors: push_rows
                .into_iter()
                .map(|r| (r.get::<String, _>("node"), r.get::<i64, _>("count") as u32))
                .collect(),
        })
    }

    /// Every service with recorded counters.
    pub async fn all_error_counts(
        &self,
    ) -> Result<BTreeMap<ServiceName, ServiceErrorCounts>, StoreError> {
        let mut all: BTreeMap<ServiceName, ServiceErrorCounts> = BTreeMap::new();

        let setup_rows = sqlx::query(
            "SELECT s.name AS service, se.count AS count FROM setup_errors se
             JOIN services s ON s.id = se.service_id",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in setup_rows {
            let service = ServiceName::parse(&row.get::<String, _>("service"));
            all.entry(service).or_default().setup_errors = row.get::<i64, _>("count") as u32;
        }

        let push_rows = sqlx::query(
            "SELECT s.name AS service, n.name AS node, pe.count AS count FROM push_errors pe
             JOIN services s ON s.id = pe.service_id
             JOIN nodes n ON n.id = pe.node_id",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in push_rows {
            let service = ServiceName::parse(&row.get::<String, _>("service"));
            all.entry(service)
                .or_default()
                .push_errors
                .insert(row.get::<String, _>("node"), row.get::<i64, _>("count") as u32);
        }

        Ok(all)
    }

    /// Upsert setup-error counters, conflict-resolving on the service.
    pub async fn upsert_setup_counts(
        &self,
        rows: &[(ServiceName, u32)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (service, count) in rows {
            let service_id = Self::intern_service(&mut tx, service).await?;
            Self::upsert_setup_in(&mut tx, service_id, *count).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Upsert push-error counters, conflict-resolving on (service, node).
    pub async fn upsert_push_counts(
        &self,
        rows: &[(ServiceName, String, u32)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (service, node, count) in rows {
            let service_id = Self::intern_service(&mut tx, service).await?;
            let node_id = Self::intern_node(&mut tx, node).await?;
            Self::upsert_push_in(&mut tx, service_id, node_id, *count).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Persist every counter in one transaction, so the end-of-run write is
    /// atomic with respect to readers of unrelated keys.
    pub async fn persist_counts(
        &self,
        counts: &BTreeMap<ServiceName, ServiceErrorCounts>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for (service, counts) in counts {
            let service_id = Self::intern_service(&mut tx, service).await?;
            Self::upsert_setup_in(&mut tx, service_id, counts.setup_errors).await?;
            for (node, count) in &counts.push_errors {
                let node_id = Self::intern_node(&mut tx, node).await?;
                Self::upsert_push_in(&mut tx, service_id, node_id, *count).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_setup_in(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        service_id: i64,
        count: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO setup_errors (service_id, count) VALUES (?, ?)
             ON CONFLICT (service_id) DO UPDATE SET count = excluded.count",
        )
        .bind(service_id)
        .bind(i64::from(count))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_push_in(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        service_id: i64,
        node_id: i64,
        count: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO push_errors (service_id, node_id, count) VALUES (?, ?, ?)
             ON CONFLICT (service_id, node_id) DO UPDATE SET count = excluded.count",
        )
        .bind(service_id)
        .bind(node_id)
        .bind(i64::from(count))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn intern_service(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        service: &ServiceName,
    ) -> Result<i64, StoreError> {
        let name = service.to_string();
        sqlx::query("INSERT INTO services (name) VALUES (?) ON CONFLICT (name) DO NOTHING")
            .bind(&name)
            .execute(&mut **tx)
            .await?;
        let row = sqlx::query("SELECT id FROM services WHERE name = ?")
            .bind(&name)
            .fetch_one(&mut **tx)
            .await?;
        Ok(row.get::<i64, _>("id"))
    }

    async fn intern_node(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        node: &str,
    ) -> Result<i64, StoreError> {
        sqlx::query("INSERT INTO nodes (name) VALUES (?) ON CONFLICT (name) DO NOTHING")
            .bind(node)
            .execute(&mut **tx)
            .await?;
        let row = sqlx::query("SELECT id FROM nodes WHERE name = ?")
            .bind(node)
            .fetch_one(&mut **tx)
            .await?;
        Ok(row.get::<i64, _>("id"))
    }
}
