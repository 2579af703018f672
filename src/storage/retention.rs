use deadpool_sqlite::Pool;
use rusqlite::params;
use std::time::Duration;
use tokio::time;

/// Background task that prunes old call records on a fixed cadence.
pub async fn retention_loop(pool: Pool, retention_days: u64, interval_secs: u64) {
    let mut interval = time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match run_retention_once(&pool, retention_days).await {
            Ok(deleted) => {
                if deleted > 0 {
                    tracing::info!(deleted, "pruned old call records");
                }
            }
            Err(e) => tracing::error!(error = %e, "retention prune failed"),
        }
    }
}

/// Run a single retention pass. Returns the number of rows deleted.
pub async fn run_retention_once(
    pool: &Pool,
    retention_days: u64,
) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let conn = pool.get().await?;

    let deleted = conn
        .interact(move |conn| {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let cutoff_ms = now_ms - (retention_days as i64 * 86400 * 1000);

            let deleted = conn.execute(
                "DELETE FROM call_records WHERE created_at < ?1",
                params![cutoff_ms],
            )?;

            if deleted > 10000 {
                let _ = conn.execute_batch("VACUUM");
            }

            Ok::<_, rusqlite::Error>(deleted)
        })
        .await
        .map_err(|e| format!("interact error: {e}"))??;

    Ok(deleted)
}
