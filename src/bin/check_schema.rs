use anyhow::Context;
use bjj_journal::config::AppConfig;
use bjj_journal::database::{CURRENT_SCHEMA, SchemaChanges, get_schema_changes};
use bjj_journal::env::load_environment;
use sqlx::SqlitePool;

/// Compares the deployed database with the declared schema and fails when
/// applying it would drop tables, columns, or indices.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_environment().context("Failed to load environment files")?;
    let config = AppConfig::from_env()?;

    let pool = SqlitePool::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.database_url))?;

    let changes = get_schema_changes(pool, CURRENT_SCHEMA).await?;
    report(&changes);

    if changes.is_destructive() {
        std::process::exit(1);
    }
    Ok(())
}

fn report(changes: &SchemaChanges) {
    if changes.is_empty() {
        println!("Schema is up to date");
        return;
    }

    print_all("    Table added:", &changes.new_tables);
    print_all("    Index added:", &changes.new_indices);
    print_all("    Index changed:", &changes.modified_indices);
    for table in &changes.modified_tables {
        println!("    Table rebuilt: {}", table.name);
    }

    if !changes.is_destructive() {
        println!("Changes passed the check ✓");
        return;
    }

    println!("Destructive changes detected:");
    print_all("    Table removed:", &changes.removed_tables);
    print_all("    Index removed:", &changes.removed_indices);
    for table in &changes.modified_tables {
        let prefix = format!("    Column removed from table {}:", table.name);
        print_all(&prefix, &table.removed_columns);
    }
}

fn print_all(prefix: &str, items: &[String]) {
    for item in items {
        println!("{} {}", prefix, item);
    }
}
