use crate::governor::tracker::CallRecord;
use chrono::DateTime;
use deadpool_sqlite::Pool;
use rusqlite::params;

/// Batch-write call records to SQLite in a single transaction.
pub async fn write_batch(
    pool: &Pool,
    records: Vec<CallRecord>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if records.is_empty() {
        return Ok(());
    }

    let conn = pool.get().await?;
    conn.interact(move |conn| {
        let tx = conn.transaction()?;

        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO call_records (
                    endpoint, model, tokens, success, latency_ms, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for record in &records {
                insert.execute(params![
                    record.endpoint,
                    record.model,
                    record.tokens as i64,
                    record.success as i64,
                    record.latency_ms as i64,
                    record.timestamp.timestamp_millis(),
                ])?;
            }
        }

        tx.commit()?;
        tracing::debug!(count = records.len(), "flushed call records to sqlite");
        Ok::<_, rusqlite::Error>(())
    })
    .await
    .map_err(|e| format!("interact error: {e}"))??;

    Ok(())
}

/// Load the most recent call records from the last 24 hours, oldest first.
///
/// Used to warm-start the in-memory usage tracker so quota windows survive
/// a process restart.
pub async fn load_recent(
    pool: &Pool,
    cap: usize,
) -> Result<Vec<CallRecord>, Box<dyn std::error::Error + Send + Sync>> {
    let conn = pool.get().await?;

    let records = conn
        .interact(move |conn| {
            let cutoff_ms = chrono::Utc::now().timestamp_millis() - 24 * 3600 * 1000;

            let mut stmt = conn.prepare_cached(
                "SELECT endpoint, model, tokens, success, latency_ms, created_at
                 FROM call_records
                 WHERE created_at >= ?1
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )?;

            let mut rows: Vec<CallRecord> = stmt
                .query_map(params![cutoff_ms, cap as i64], |row| {
                    let created_at_ms: i64 = row.get(5)?;
                    Ok(CallRecord {
                        endpoint: row.get(0)?,
                        model: row.get(1)?,
                        tokens: row.get::<_, i64>(2)? as u64,
                        success: row.get::<_, i64>(3)? != 0,
                        latency_ms: row.get::<_, i64>(4)? as u64,
                        timestamp: DateTime::from_timestamp_millis(created_at_ms)
                            .unwrap_or_else(chrono::Utc::now),
                    })
                })?
                .collect::<Result<_, _>>()?;

            // Query returns newest-first so LIMIT keeps the most recent rows;
            // the tracker wants ascending order.
            rows.reverse();
            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .map_err(|e| format!("interact error: {e}"))??;

    Ok(records)
}
