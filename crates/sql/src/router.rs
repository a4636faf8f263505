//! Schema-scoped statement execution.
//!
//! PostgreSQL resolves unqualified names through `search_path`. The
//! router runs a body of work with the path pointed at one schema and
//! restores it on every exit path, with a nesting counter so re-entrant
//! callers compose.

use std::sync::Mutex;

use futures::future::BoxFuture;
use sqlx::PgConnection;
use tracing::warn;

use chronopg_core::quoting::quote_ident;
use chronopg_core::TemporalResult;

/// Nesting discipline for [`SchemaRouter::on_schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nesting {
    /// Always switch the path, even inside an enclosing frame.
    Follow,
    /// Switch only when this is the outermost frame; inner calls are a
    /// no-op with respect to path changes.
    Ignore,
}

#[derive(Debug, Default)]
struct RouterState {
    depth: u32,
    cached_path: Option<String>,
    dirty: bool,
}

/// Per-connection `search_path` discipline.
///
/// The nesting counter and cached path describe exactly one physical
/// connection: build one router per connection and keep it for that
/// connection's lifetime. Sharing a router across connections would let
/// an unrelated frame satisfy the [`Nesting::Ignore`] skip test and
/// leave another connection's path unset.
///
/// The cached path is marked invalid instead of restored when the
/// enclosing transaction has aborted, so no further statements are
/// emitted during rollback; the next read refreshes from the server.
#[derive(Debug, Default)]
pub struct SchemaRouter {
    state: Mutex<RouterState>,
}

impl SchemaRouter {
    /// A router with no cached path.
    pub fn new() -> Self {
        Self::default()
    }

    /// The connection's current `search_path`, read from the cache when
    /// valid and from the server otherwise.
    pub async fn search_path(&self, conn: &mut PgConnection) -> TemporalResult<String> {
        if let Some(path) = self.cached() {
            return Ok(path);
        }
        let path: String = sqlx::query_scalar("SELECT current_setting('search_path')")
            .fetch_one(&mut *conn)
            .await?;
        let mut state = self.state.lock().unwrap();
        state.cached_path = Some(path.clone());
        state.dirty = false;
        Ok(path)
    }

    /// Force the next [`search_path`](Self::search_path) read to refresh
    /// from the server.
    pub fn invalidate(&self) {
        self.state.lock().unwrap().dirty = true;
    }

    fn cached(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.dirty {
            None
        } else {
            state.cached_path.clone()
        }
    }

    fn push(&self) {
        self.state.lock().unwrap().depth += 1;
    }

    fn pop(&self) {
        let mut state = self.state.lock().unwrap();
        state.depth = state.depth.saturating_sub(1);
    }

    /// Execute `body` with `search_path` set to `schema`, restoring the
    /// previous path afterwards regardless of the body's outcome.
    ///
    /// With [`Nesting::Ignore`], an inner call leaves the path of the
    /// enclosing frame untouched.
    pub async fn on_schema<'c, T, F>(
        &self,
        conn: &'c mut PgConnection,
        schema: &str,
        nesting: Nesting,
        body: F,
    ) -> TemporalResult<T>
    where
        F: for<'a> FnOnce(&'a mut PgConnection) -> BoxFuture<'a, TemporalResult<T>>,
    {
        let skip = {
            let state = self.state.lock().unwrap();
            nesting == Nesting::Ignore && state.depth > 0
        };

        if skip {
            self.push();
            let result = body(&mut *conn).await;
            self.pop();
            return result;
        }

        let previous = self.search_path(conn).await?;
        sqlx::query(&format!("SET search_path TO {}", quote_ident(schema)))
            .execute(&mut *conn)
            .await?;
        {
            let mut state = self.state.lock().unwrap();
            state.cached_path = Some(quote_ident(schema));
            state.dirty = false;
        }

        self.push();
        let result = body(&mut *conn).await;
        self.pop();

        match sqlx::query(&format!("SET search_path TO {previous}"))
            .execute(&mut *conn)
            .await
        {
            Ok(_) => {
                let mut state = self.state.lock().unwrap();
                state.cached_path = Some(previous);
                state.dirty = false;
            }
            Err(err) => {
                // The enclosing transaction has likely aborted; emitting
                // further statements would fail as well. Refresh lazily.
                warn!(schema, error = %err, "deferring search_path restoration");
                self.invalidate();
            }
        }

        result
    }

    /// Current nesting depth; zero outside any frame.
    pub fn depth(&self) -> u32 {
        self.state.lock().unwrap().depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_depth_zero() {
        let router = SchemaRouter::new();
        assert_eq!(router.depth(), 0);
    }

    #[test]
    fn invalidate_clears_cached_path() {
        let router = SchemaRouter::new();
        {
            let mut state = router.state.lock().unwrap();
            state.cached_path = Some("public".to_string());
        }
        assert_eq!(router.cached().as_deref(), Some("public"));
        router.invalidate();
        assert!(router.cached().is_none());
    }

    #[test]
    fn pop_saturates() {
        let router = SchemaRouter::new();
        router.pop();
        assert_eq!(router.depth(), 0);
    }
}
