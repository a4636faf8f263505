//! Structured operation counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info};

static DDL_OPERATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static AS_OF_REWRITES_TOTAL: AtomicU64 = AtomicU64::new(0);

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Records a completed DDL operation as a structured log entry.
pub fn record_ddl(operation: &str, table: &str, duration: Duration) {
    let total = DDL_OPERATIONS_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        metric = "ddl_latency_ms",
        operation,
        table,
        latency_ms = duration_ms(duration),
        ddl_operations_total = total
    );
}

/// Records an emitted as-of rewrite and its CTE count.
pub fn record_rewrite(table: &str, cte_count: usize) {
    let total = AS_OF_REWRITES_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(
        metric = "as_of_rewrite",
        table,
        ctes = cte_count,
        as_of_rewrites_total = total
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_conversion() {
        assert_eq!(duration_ms(Duration::from_millis(250)), 250.0);
    }
}
