use std::collections::HashSet;

use deadpool_postgres::Pool;

use super::error::DbError;

/// Schema migrations, embedded so the binary carries its own DDL. Applied
/// entries are recorded in `schema_migrations` and never re-run; new
/// migrations append to this list in order.
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_block_numbers_and_transactions",
    include_str!("../../migrations/001_init.sql"),
)];

pub async fn run(pool: &Pool) -> Result<(), DbError> {
    let mut client = pool.get().await?;

    client
        .execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )",
            &[],
        )
        .await?;

    let rows = client.query("SELECT name FROM schema_migrations", &[]).await?;
    let applied: HashSet<String> = rows.iter().map(|row| row.get(0)).collect();

    for (name, sql) in MIGRATIONS {
        if applied.contains(*name) {
            continue;
        }

        let tx = client.transaction().await?;
        tx.batch_execute(sql).await.map_err(|source| DbError::Migration {
            name: (*name).to_string(),
            source,
        })?;
        tx.execute("INSERT INTO schema_migrations (name) VALUES ($1)", &[name])
            .await?;
        tx.commit().await?;

        tracing::info!("applied schema migration {}", name);
    }

    Ok(())
}
