use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

pub type DbPool = sqlx::SqlitePool;

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

/// Opens a pool with foreign keys enforced, WAL journaling and a busy timeout.
/// File databases are created on first use.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5_000));

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .connect_with(options)
        .await
}

pub async fn ping(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{connect_with_settings, ping};

    #[tokio::test]
    async fn file_database_is_created_on_first_connect() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("zenthor.db");
        let url = format!("sqlite://{}", path.display());

        let pool = connect_with_settings(&url, 1, 5).await.expect("connect");
        ping(&pool).await.expect("ping");

        assert!(path.exists());
        pool.close().await;
    }

    #[tokio::test]
    async fn ping_fails_on_closed_pool() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        pool.close().await;

        assert!(ping(&pool).await.is_err());
    }
}
