//! Schema versions for the libSQL backend.
//!
//! `_schema_version` records every applied step. Opening a database applies
//! the steps it has not seen yet, in order, and never re-runs one.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append-only. Never edit a shipped step; add a new one.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "job_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                message TEXT NOT NULL,
                lead_context TEXT NOT NULL DEFAULT '{}',
                enqueued_at TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'queued',
                result TEXT,
                error TEXT,
                lease_until INTEGER,
                finished_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_finished ON jobs(finished_at);
        "#,
    },
    Migration {
        version: 2,
        name: "conversation_log",
        sql: r#"
            CREATE TABLE IF NOT EXISTS conversation_log (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_log_lead ON conversation_log(lead_id);
        "#,
    },
];

fn migration_err(context: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Migration(format!("{context}: {e}"))
}

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| migration_err("creating _schema_version", e))?;

    let applied = applied_version(conn).await?;
    let pending = pending(applied);
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema is current");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying schema step");
        conn.execute_batch(step.sql)
            .await
            .map_err(|e| migration_err(&format!("V{} {}", step.version, step.name), e))?;
        conn.execute(
            "INSERT INTO _schema_version (version, name) VALUES (?1, ?2)",
            libsql::params![step.version, step.name],
        )
        .await
        .map_err(|e| migration_err(&format!("recording V{}", step.version), e))?;
    }
    Ok(())
}

/// Steps newer than `applied`, oldest first.
fn pending(applied: i64) -> Vec<&'static Migration> {
    MIGRATIONS.iter().filter(|m| m.version > applied).collect()
}

async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _schema_version", ())
        .await
        .map_err(|e| migration_err("reading schema version", e))?;
    match rows
        .next()
        .await
        .map_err(|e| migration_err("reading schema version", e))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| migration_err("decoding schema version", e)),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn conn() -> Connection {
        libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap()
            .connect()
            .unwrap()
    }

    async fn columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut rows = conn
            .query(&format!("PRAGMA table_info({table})"), ())
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            names.push(row.get::<String>(1).unwrap());
        }
        names
    }

    #[test]
    fn versions_are_strictly_increasing() {
        assert!(MIGRATIONS.windows(2).all(|w| w[0].version < w[1].version));
        assert_eq!(pending(0).len(), MIGRATIONS.len());
        assert!(pending(MIGRATIONS.len() as i64).is_empty());
    }

    #[tokio::test]
    async fn fresh_database_gets_queue_and_log_tables() {
        let conn = conn().await;
        run_migrations(&conn).await.unwrap();

        let jobs = columns(&conn, "jobs").await;
        for col in ["attempt", "status", "lease_until", "finished_at"] {
            assert!(jobs.iter().any(|c| c == col), "jobs.{col} missing");
        }
        let log = columns(&conn, "conversation_log").await;
        assert_eq!(log, vec!["id", "lead_id", "role", "content", "created_at"]);
    }

    #[tokio::test]
    async fn rerun_applies_nothing_new() {
        let conn = conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT COUNT(*), MAX(version) FROM _schema_version", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), MIGRATIONS.len() as i64);
        assert_eq!(row.get::<i64>(1).unwrap(), 2);
    }
}
