//! Embedded SQL migrations, applied in lexical file-name order and tracked in
//! a `schema_migrations` table. No external migration-runner crate: this repo
//! ships a handful of monotonically-numbered files, so a bare
//! `batch_execute` per file is enough.

use deadpool_postgres::Pool;

use crate::error::{Error, Result};

struct Migration {
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    name: "0001_init",
    sql: include_str!("../migrations/0001_init.sql"),
}];

#[tracing::instrument(skip(pool))]
pub async fn run(pool: &Pool) -> Result<()> {
    let client = pool.get().await.map_err(|e| Error::Transient(e.into()))?;

    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (name TEXT PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
        )
        .await?;

    for migration in MIGRATIONS {
        let already_applied = client
            .query_opt(
                "SELECT 1 FROM schema_migrations WHERE name = $1",
                &[&migration.name],
            )
            .await?
            .is_some();
        if already_applied {
            continue;
        }

        tracing::info!(migration = migration.name, "applying migration");
        client.batch_execute(migration.sql).await?;
        client
            .execute(
                "INSERT INTO schema_migrations (name) VALUES ($1)",
                &[&migration.name],
            )
            .await?;
    }

    Ok(())
}
