use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connect to the test database named by `PG_TEST_DSN`, or `None` when
/// the variable is unset (the caller then skips the test).
pub async fn try_pool() -> anyhow::Result<Option<PgPool>> {
    let Ok(dsn) = std::env::var("PG_TEST_DSN") else {
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&dsn)
        .await?;
    Ok(Some(pool))
}

/// Drop everything previous runs may have left behind.
pub async fn reset(pool: &PgPool) -> Result<(), sqlx::Error> {
    let drops = [
        "DROP SCHEMA IF EXISTS history CASCADE",
        "DROP SCHEMA IF EXISTS temporal CASCADE",
        "DROP TABLE IF EXISTS public.foos",
        "DROP TABLE IF EXISTS public.plain_notes",
        "DROP TABLE IF EXISTS public.authors",
        "DROP TABLE IF EXISTS public.books",
    ];

    for stmt in drops {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

/// The database's idea of "now", parsed back into a UTC instant.
pub async fn db_now(pool: &PgPool) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    let raw: String = sqlx::query_scalar("SELECT timezone('UTC', now())::text")
        .fetch_one(pool)
        .await?;
    Ok(chronopg_core::time::parse_utc(&raw)?)
}
