//! PostgreSQL implementation of the event store.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

use super::models::{StoredEvent, StoredOwnerEvent};
use super::{EventStore, OwnerDevices, SnapshotQuery};
use crate::domain::{Event, EventKind, OwnerEvent, OwnerEventKind, ResourceId};
use crate::error::GatewayError;

/// How many times an append retries after losing a version race.
const APPEND_ATTEMPTS: u32 = 3;

/// PostgreSQL-backed event store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` and runs pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UpstreamUnavailable`] if the database cannot
    /// be reached and [`GatewayError::PersistenceError`] if a migration
    /// fails.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| GatewayError::PersistenceError(format!("migration failed: {e}")))?;
        info!(max_connections, "connected to PostgreSQL event store");
        Ok(Self::new(pool))
    }

    /// Applies one ownership change and appends its owner event in the
    /// same transaction, retrying when a concurrent change took the next
    /// owner version.
    async fn change_ownership(
        &self,
        owner: &str,
        device_id: &str,
        kind: OwnerEventKind,
    ) -> Result<Option<OwnerEvent>, GatewayError> {
        let payload = serde_json::to_value(&kind)
            .map_err(|e| GatewayError::Internal(format!("owner event encoding: {e}")))?;
        let statement = match kind {
            OwnerEventKind::DevicesRegistered { .. } => {
                "INSERT INTO device_owners (owner, device_id) VALUES ($1, $2) ON CONFLICT DO NOTHING"
            }
            OwnerEventKind::DevicesUnregistered { .. } => {
                "DELETE FROM device_owners WHERE owner = $1 AND device_id = $2"
            }
        };

        let mut last_version = 0;
        for attempt in 1..=APPEND_ATTEMPTS {
            let mut tx = self.pool.begin().await?;
            let changed = sqlx::query(statement)
                .bind(owner)
                .bind(device_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if changed == 0 {
                tx.rollback().await?;
                return Ok(None);
            }

            let result = sqlx::query_as::<_, StoredOwnerEvent>(
                "INSERT INTO owner_events (owner, version, payload) \
                 SELECT $1, COALESCE(MAX(version), 0) + 1, $2 FROM owner_events WHERE owner = $1 \
                 RETURNING owner, version, payload, created_at",
            )
            .bind(owner)
            .bind(&payload)
            .fetch_one(&mut *tx)
            .await;

            match result {
                Ok(row) => {
                    tx.commit().await?;
                    return row.into_owner_event().map(Some);
                }
                Err(err) if is_unique_violation(&err) => {
                    tx.rollback().await?;
                    debug!(%owner, %device_id, attempt, "ownership change lost version race, retrying");
                    last_version = sqlx::query_scalar::<_, i64>(
                        "SELECT COALESCE(MAX(version), 0) FROM owner_events WHERE owner = $1",
                    )
                    .bind(owner)
                    .fetch_one(&self.pool)
                    .await?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let actual = u64::try_from(last_version).unwrap_or_default();
        Err(GatewayError::VersionConflict {
            aggregate: format!("owner:{owner}"),
            expected: actual.saturating_add(1),
            actual,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        resource_id: &ResourceId,
        kind: EventKind,
    ) -> Result<Event, GatewayError> {
        let payload = serde_json::to_value(&kind)
            .map_err(|e| GatewayError::Internal(format!("event encoding: {e}")))?;
        let event_type = kind.event_type().as_str();

        let mut last_version = 0;
        for attempt in 1..=APPEND_ATTEMPTS {
            let result = sqlx::query_as::<_, StoredEvent>(
                "INSERT INTO events (device_id, href, version, event_type, payload) \
                 SELECT $1, $2, COALESCE(MAX(version), 0) + 1, $3, $4 FROM events \
                 WHERE device_id = $1 AND href = $2 \
                 RETURNING device_id, href, version, event_type, payload, created_at",
            )
            .bind(&resource_id.device_id)
            .bind(&resource_id.href)
            .bind(event_type)
            .bind(&payload)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => return row.into_event(),
                Err(err) if is_unique_violation(&err) => {
                    debug!(%resource_id, attempt, "append lost version race, retrying");
                    last_version = sqlx::query_scalar::<_, i64>(
                        "SELECT COALESCE(MAX(version), 0) FROM events \
                         WHERE device_id = $1 AND href = $2",
                    )
                    .bind(&resource_id.device_id)
                    .bind(&resource_id.href)
                    .fetch_one(&self.pool)
                    .await?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let actual = u64::try_from(last_version).unwrap_or_default();
        Err(GatewayError::VersionConflict {
            aggregate: resource_id.aggregate_id(),
            expected: actual.saturating_add(1),
            actual,
        })
    }

    async fn load(&self, query: &SnapshotQuery) -> Result<Vec<Event>, GatewayError> {
        let rows = sqlx::query_as::<_, StoredEvent>(
            "SELECT device_id, href, version, event_type, payload, created_at FROM events \
             WHERE device_id = $1 AND ($2::TEXT IS NULL OR href = $2) \
             ORDER BY href ASC, version ASC",
        )
        .bind(&query.device_id)
        .bind(query.href.as_deref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredEvent::into_event).collect()
    }

    async fn owner_devices(&self, owner: &str) -> Result<OwnerDevices, GatewayError> {
        // One snapshot for both reads so the version matches the device set.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;
        let version = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(version), 0) FROM owner_events WHERE owner = $1",
        )
        .bind(owner)
        .fetch_one(&mut *tx)
        .await?;
        let device_ids = sqlx::query_scalar::<_, String>(
            "SELECT device_id FROM device_owners WHERE owner = $1 ORDER BY device_id",
        )
        .bind(owner)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(OwnerDevices {
            version: u64::try_from(version).unwrap_or_default(),
            device_ids,
        })
    }

    async fn register_device(
        &self,
        owner: &str,
        device_id: &str,
    ) -> Result<Option<OwnerEvent>, GatewayError> {
        let kind = OwnerEventKind::DevicesRegistered {
            device_ids: vec![device_id.to_string()],
        };
        self.change_ownership(owner, device_id, kind).await
    }

    async fn unregister_device(
        &self,
        owner: &str,
        device_id: &str,
    ) -> Result<Option<OwnerEvent>, GatewayError> {
        let kind = OwnerEventKind::DevicesUnregistered {
            device_ids: vec![device_id.to_string()],
        };
        self.change_ownership(owner, device_id, kind).await
    }
}
