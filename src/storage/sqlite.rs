use crate::config::DatabaseConfig;
use deadpool_sqlite::{Config, Pool, Runtime};
use rusqlite::Connection;

/// Apply performance PRAGMAs to a SQLite connection.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        PRAGMA temp_store = MEMORY;
        ",
    )
}

/// Create a deadpool-sqlite connection pool.
pub fn create_pool(config: &DatabaseConfig) -> Result<Pool, deadpool_sqlite::CreatePoolError> {
    let db_path = config.path.clone();

    // Set restrictive file permissions on the database file (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if db_path.exists() {
            if let Err(e) =
                std::fs::set_permissions(&db_path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(error = %e, "failed to set database file permissions");
            }
        }
    }

    let cfg = Config::new(db_path);
    cfg.create_pool(Runtime::Tokio1)
}

/// Initialize the pool: apply pragmas and run migrations on one connection.
pub async fn init_pool(pool: &Pool) -> Result<(), Box<dyn std::error::Error>> {
    let conn = pool.get().await?;
    conn.interact(|conn| {
        apply_pragmas(conn)?;
        crate::storage::migrations::run_migrations(conn)?;
        Ok::<_, rusqlite::Error>(())
    })
    .await??;
    Ok(())
}
