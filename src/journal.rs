use crate::config::UsageConfig;
use crate::governor::tracker::CallRecord;
use crate::storage::writer;
use deadpool_sqlite::Pool;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

/// Journal worker: consumes call records from the channel, batches them,
/// and flushes to SQLite on batch size or time trigger.
///
/// The in-memory tracker is authoritative for quota decisions; this task
/// only persists an audit trail and warm-start data, so a dropped batch
/// never blocks request handling.
pub async fn run_worker(mut rx: mpsc::Receiver<CallRecord>, pool: Pool, config: UsageConfig) {
    let mut buffer: Vec<CallRecord> = Vec::with_capacity(config.flush_batch_size);
    let flush_interval = Duration::from_secs(config.flush_interval_secs);
    let mut flush_timer = time::interval(flush_interval);
    flush_timer.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(record) => {
                        buffer.push(record);

                        // Flush on batch size
                        if buffer.len() >= config.flush_batch_size {
                            flush(&pool, &mut buffer).await;
                        }
                    }
                    None => {
                        // Channel closed - drain remaining
                        tracing::info!("journal channel closed, draining buffer");
                        if !buffer.is_empty() {
                            flush(&pool, &mut buffer).await;
                        }
                        return;
                    }
                }
            }
            // Flush on time interval
            _ = flush_timer.tick() => {
                if !buffer.is_empty() {
                    flush(&pool, &mut buffer).await;
                }
            }
        }
    }
}

async fn flush(pool: &Pool, buffer: &mut Vec<CallRecord>) {
    let records: Vec<CallRecord> = std::mem::take(buffer);
    let count = records.len();

    // Try up to 2 times (initial + 1 retry) before dropping records.
    for attempt in 0..2u8 {
        match writer::write_batch(pool, records.clone()).await {
            Ok(_) => return,
            Err(e) => {
                if attempt == 0 {
                    tracing::warn!(error = %e, count, "journal flush failed, retrying in 500ms");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                } else {
                    tracing::error!(error = %e, count, "journal flush retry failed, {count} records dropped");
                }
            }
        }
    }
}
