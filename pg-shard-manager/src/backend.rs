//! Connection resources behind each shard.
//!
//! [`ShardBackend`] is what a shard executes against; [`ShardConnector`]
//! opens one from a [`ShardConfig`]. The PostgreSQL implementation wraps a
//! bounded `sqlx` pool per shard.

use crate::{Error, ShardConfig};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgPoolOptions, PgRow, PgTypeInfo};
use sqlx::query::Query;
use sqlx::types::Decimal;
use sqlx::{Column, Encode, PgPool, Postgres, Row as _, Type, TypeInfo, ValueRef};
use std::sync::Arc;
use std::time::Duration;

/// One result row, keyed by column name.
pub type Row = Map<String, Value>;

/// Pool occupancy, reported in stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: usize,
    pub max_size: u32,
}

#[async_trait]
pub trait ShardBackend: Send + Sync {
    /// Run a statement and return its rows. Statements that return no rows
    /// yield an empty vec.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error>;

    /// Trivial liveness query.
    async fn ping(&self) -> Result<(), Error>;

    /// Close the pool, waiting for checked-out connections to return.
    /// Calling it again is a no-op.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn pool_status(&self) -> PoolStatus;
}

/// Opens a backend for a shard. Called by `add_shard` before the shard is
/// placed on the ring, so failures surface to the caller.
#[async_trait]
pub trait ShardConnector: Send + Sync {
    async fn connect(&self, config: &ShardConfig) -> Result<Arc<dyn ShardBackend>, Error>;
}

/// Connects shards to PostgreSQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

#[async_trait]
impl ShardConnector for PgConnector {
    async fn connect(&self, config: &ShardConfig) -> Result<Arc<dyn ShardBackend>, Error> {
        let backend = PgBackend::connect(config).await?;
        Ok(Arc::new(backend))
    }
}

/// A bounded PostgreSQL pool for one shard.
pub struct PgBackend {
    pool: PgPool,
    endpoint: String,
    statement_timeout: Duration,
    connect_timeout: Duration,
}

impl PgBackend {
    /// Connect eagerly and verify the endpoint with `SELECT 1`.
    ///
    /// Unlike a lazy pool, this opens a connection up front so an unreachable
    /// shard is reported here rather than on its first query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] if the shard cannot be reached within
    /// `connect_timeout`.
    pub async fn connect(config: &ShardConfig) -> Result<Self, Error> {
        let endpoint = config.endpoint();
        let connect = PgPoolOptions::new()
            .max_connections(config.pool_size.max(1))
            .min_connections(0)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .connect_with(config.connect_options());

        let pool = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| Error::connectivity(&endpoint, "connect timed out"))?
            .map_err(|e| Error::connectivity(&endpoint, e))?;

        let backend = Self {
            pool,
            endpoint,
            statement_timeout: config.statement_timeout,
            connect_timeout: config.connect_timeout,
        };
        if let Err(e) = backend.ping().await {
            backend.pool.close().await;
            return Err(e);
        }

        tracing::debug!(
            endpoint = %backend.endpoint,
            max_connections = config.pool_size,
            "Shard pool connected"
        );
        Ok(backend)
    }

    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch(&self, sql: &str, params: &[Value]) -> Result<Vec<PgRow>, Error> {
        let query = params
            .iter()
            .fold(sqlx::query(sql), |query, param| bind_json(query, param));
        tokio::time::timeout(self.statement_timeout, query.fetch_all(&self.pool))
            .await
            .map_err(|_| Error::connectivity(&self.endpoint, "statement timed out"))?
            .map_err(|e| classify(&self.endpoint, e))
    }
}

#[async_trait]
impl ShardBackend for PgBackend {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let rows = self.fetch(sql, params).await?;
        rows.iter().map(row_to_json).collect()
    }

    async fn ping(&self) -> Result<(), Error> {
        tokio::time::timeout(
            self.connect_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| Error::connectivity(&self.endpoint, "liveness probe timed out"))?
        .map_err(|e| classify(&self.endpoint, e))?;
        Ok(())
    }

    async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            tracing::debug!(endpoint = %self.endpoint, "Shard pool closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn pool_status(&self) -> PoolStatus {
        PoolStatus {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max_size: self.pool.options().get_max_connections(),
        }
    }
}

/// Connection-level failures become `Connectivity`; anything the server
/// itself reported stays a `Database` error.
fn classify(endpoint: &str, err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::connectivity(endpoint, err),
        other => Error::Database(other),
    }
}

fn bind_json<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        Value::Null => query.bind(UntypedNull),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(sqlx::types::Json(other.clone())),
    }
}

/// A NULL parameter sent with an unspecified type, so the server infers it
/// from context (`WHERE id = $1` against an int column) instead of TEXT.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Decode a row into JSON.
///
/// NUMERIC is rendered as a decimal string so no precision is lost. BYTEA
/// uses the server's `\x` hex form. A column of any other type that cannot
/// be read as text is a [`Error::Database`] rather than a silent null.
fn row_to_json(row: &PgRow) -> Result<Row, Error> {
    let mut out = Map::with_capacity(row.len());
    for column in row.columns() {
        let ordinal = column.ordinal();
        let raw = row.try_get_raw(ordinal)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match column.type_info().name() {
                "BOOL" => Value::from(row.try_get::<bool, _>(ordinal)?),
                "INT2" => Value::from(row.try_get::<i16, _>(ordinal)?),
                "INT4" => Value::from(row.try_get::<i32, _>(ordinal)?),
                "INT8" => Value::from(row.try_get::<i64, _>(ordinal)?),
                "FLOAT4" => Value::from(row.try_get::<f32, _>(ordinal)?),
                "FLOAT8" => Value::from(row.try_get::<f64, _>(ordinal)?),
                "NUMERIC" => Value::from(row.try_get::<Decimal, _>(ordinal)?.to_string()),
                "JSON" | "JSONB" => row.try_get::<Value, _>(ordinal)?,
                "UUID" => Value::from(row.try_get::<sqlx::types::Uuid, _>(ordinal)?.to_string()),
                "TIMESTAMPTZ" => Value::from(
                    row.try_get::<chrono::DateTime<chrono::Utc>, _>(ordinal)?
                        .to_rfc3339(),
                ),
                "TIMESTAMP" => Value::from(
                    row.try_get::<chrono::NaiveDateTime, _>(ordinal)?
                        .to_string(),
                ),
                "DATE" => Value::from(row.try_get::<chrono::NaiveDate, _>(ordinal)?.to_string()),
                "TIME" => Value::from(row.try_get::<chrono::NaiveTime, _>(ordinal)?.to_string()),
                "BYTEA" => Value::from(bytea_hex(&row.try_get::<Vec<u8>, _>(ordinal)?)),
                "BOOL[]" => Value::from(row.try_get::<Vec<bool>, _>(ordinal)?),
                "INT2[]" => Value::from(row.try_get::<Vec<i16>, _>(ordinal)?),
                "INT4[]" => Value::from(row.try_get::<Vec<i32>, _>(ordinal)?),
                "INT8[]" => Value::from(row.try_get::<Vec<i64>, _>(ordinal)?),
                "FLOAT8[]" => Value::from(row.try_get::<Vec<f64>, _>(ordinal)?),
                "TEXT[]" | "VARCHAR[]" => Value::from(row.try_get::<Vec<String>, _>(ordinal)?),
                // TEXT, VARCHAR, NAME, BPCHAR and other text-compatible types
                _ => Value::from(row.try_get::<String, _>(ordinal)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn bytea_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_connection_errors() {
        let err = classify("db:5432/app", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, Error::Connectivity { .. }));

        let err = classify("db:5432/app", sqlx::Error::PoolClosed);
        assert!(matches!(err, Error::Connectivity { .. }));

        let err = classify("db:5432/app", sqlx::Error::RowNotFound);
        assert!(matches!(err, Error::Database(_)));
    }

    #[test]
    fn test_bytea_hex_matches_server_format() {
        assert_eq!(bytea_hex(&[]), "\\x");
        assert_eq!(bytea_hex(&[0x00, 0xab, 0x10]), "\\x00ab10");
    }

    #[tokio::test]
    async fn test_connect_unreachable_shard_fails_fast() {
        // Nothing listens on port 1; connect must fail within the timeout
        let config = ShardConfig::new("127.0.0.1", "app")
            .with_port(1)
            .with_connect_timeout(Duration::from_millis(500));

        let started = std::time::Instant::now();
        let result = PgBackend::connect(&config).await;

        assert!(matches!(result, Err(Error::Connectivity { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
