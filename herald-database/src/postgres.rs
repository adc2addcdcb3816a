use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use herald_interfaces::{CleanupError, Device, DeviceResolver, ResolveError, SessionCleanup};
use herald_models::{
    IdempotencyKey,
    errors::{RuntimeError, SendableError},
};
use log::{debug, info};
use sqlx::{
    ConnectOptions, PgPool, Row,
    postgres::{PgConnectOptions, PgPoolOptions},
};

const FIND_DEVICE_SQL: &str = r#"
SELECT jid
FROM whatsmeow_device
WHERE registration_id::text = $1
"#;

const FIND_SESSION_ACCOUNT_SQL: &str = r#"
SELECT "accountId"::text AS account_id
FROM sessions
WHERE id = $1
"#;

const DELETE_SESSION_SQL: &str = "DELETE FROM sessions WHERE id = $1";
const DELETE_ACCOUNT_SQL: &str = "DELETE FROM accounts WHERE id::text = $1";

/// Device lookups against the protocol library's device table, plus cleanup of the
/// session and account rows left behind when a device disappears.
pub struct PgDeviceStore {
    pool: PgPool,
}

impl PgDeviceStore {
    pub async fn connect(connection_str: &str, max_connections: u32) -> Result<Self, SendableError> {
        let mut options = PgConnectOptions::from_str(connection_str)
            .map_err(|err| RuntimeError::boxed("database.postgres.dsn", err.to_string()))?;
        options.log_statements(log::LevelFilter::Debug);
        options.log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|err| RuntimeError::boxed("database.postgres.connect", err.to_string()))?;
        info!("Connected to Postgres device store");
        Ok(Self { pool })
    }
}

/// An absent row is the only permanent lookup failure; anything the database
/// reports is worth retrying.
fn classify_lookup(
    key: &IdempotencyKey,
    result: Result<Option<String>, sqlx::Error>,
) -> Result<Device, ResolveError> {
    match result {
        Ok(Some(jid)) => Ok(Device {
            session_id: key.clone(),
            jid,
        }),
        Ok(None) | Err(sqlx::Error::RowNotFound) => {
            Err(ResolveError::NotFound(key.as_str().to_string()))
        }
        Err(err) => Err(ResolveError::Lookup(err.to_string())),
    }
}

#[async_trait]
impl DeviceResolver for PgDeviceStore {
    async fn resolve_device(&self, key: &IdempotencyKey) -> Result<Device, ResolveError> {
        let result = sqlx::query(FIND_DEVICE_SQL)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .and_then(|row| row.map(|row| row.try_get::<String, _>("jid")).transpose());

        classify_lookup(key, result)
    }
}

#[async_trait]
impl SessionCleanup for PgDeviceStore {
    async fn remove_orphaned_session(&self, key: &IdempotencyKey) -> Result<bool, CleanupError> {
        let cleanup_error = |err: sqlx::Error| CleanupError(err.to_string());

        let mut tx = self.pool.begin().await.map_err(cleanup_error)?;
        let account_id: Option<String> = sqlx::query(FIND_SESSION_ACCOUNT_SQL)
            .bind(key.as_str())
            .fetch_optional(&mut tx)
            .await
            .map_err(cleanup_error)?
            .map(|row| row.try_get::<Option<String>, _>("account_id"))
            .transpose()
            .map_err(cleanup_error)?
            .flatten();

        let sessions = sqlx::query(DELETE_SESSION_SQL)
            .bind(key.as_str())
            .execute(&mut tx)
            .await
            .map_err(cleanup_error)?
            .rows_affected();

        let accounts = match &account_id {
            Some(account_id) => sqlx::query(DELETE_ACCOUNT_SQL)
                .bind(account_id)
                .execute(&mut tx)
                .await
                .map_err(cleanup_error)?
                .rows_affected(),
            None => 0,
        };

        tx.commit().await.map_err(cleanup_error)?;
        debug!(
            "Cleanup for session '{}': {} session row(s), {} account row(s)",
            key, sessions, accounts
        );
        Ok(sessions + accounts > 0)
    }
}
