//! Engine bootstrap and connection configuration.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use chronopg_core::{TemporalError, TemporalResult};

use crate::cache::TemporalCache;
use crate::compiler::SchemaCompiler;
use crate::ddl;
use crate::{HISTORY_SCHEMA, TEMPORAL_SCHEMA};

/// Minimum `server_version_num` the engine accepts. The storage layout
/// depends on CTEs, GiST exclusion constraints and rewrite rules.
const MIN_SERVER_VERSION_NUM: i64 = 90_000;

/// Connection tuning knobs for the engine pool.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Database connection URL
    pub url: String,
    /// Maximum number of pooled connections
    pub max_connections: u32,
    /// Timeout applied when acquiring a connection
    pub acquire_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/chronopg".to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectOptions {
    /// Options for the given URL with default tuning.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// One engine instance per database.
///
/// Owns the connection pool and the temporal cache, and hands out the
/// schema compiler. Every compiler operation runs on its own pooled
/// connection with its own per-connection search_path state, so
/// concurrent operations never observe each other's path changes;
/// inter-connection coordination is PostgreSQL's.
#[derive(Debug, Clone)]
pub struct TemporalEngine {
    pool: PgPool,
    cache: TemporalCache,
}

impl TemporalEngine {
    /// Connect and validate the backend.
    pub async fn connect(options: ConnectOptions) -> TemporalResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect(&options.url)
            .await?;
        Self::with_pool(pool).await
    }

    /// Build an engine over an existing pool: validates the server
    /// version, creates the reserved schemas if absent, and primes the
    /// temporal cache.
    pub async fn with_pool(pool: PgPool) -> TemporalResult<Self> {
        let raw: String = sqlx::query_scalar("SELECT current_setting('server_version_num')")
            .fetch_one(&pool)
            .await?;
        let version: i64 = raw
            .parse()
            .map_err(|_| TemporalError::unsupported_database(raw.clone()))?;
        if version < MIN_SERVER_VERSION_NUM {
            return Err(TemporalError::unsupported_database(format!(
                "server_version_num {version}"
            )));
        }

        for schema in [TEMPORAL_SCHEMA, HISTORY_SCHEMA] {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
                    .bind(schema)
                    .fetch_one(&pool)
                    .await?;
            if !exists {
                sqlx::query(&ddl::create_schema(schema)).execute(&pool).await?;
            }
        }

        let cache = TemporalCache::default();
        let primed = cache.prime(&pool).await?;
        info!(server_version_num = version, primed, "temporal engine ready");

        Ok(Self { pool, cache })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The engine's temporal cache handle.
    pub fn cache(&self) -> &TemporalCache {
        &self.cache
    }

    /// A schema compiler bound to this engine.
    pub fn compiler(&self) -> SchemaCompiler {
        SchemaCompiler::new(self.pool.clone(), self.cache.clone())
    }
}
