// pgsqltool/src/overwrite/mod.rs
pub mod csv_table;
pub mod reconcile;

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use tracing::info;

use crate::config::{OverwriteConfig, OverwriteSource};
use crate::utils::{PgTool, pg_command, process};

/// Wraps a query so psql prints its result as CSV with a header line.
pub fn copy_to_stdout_sql(query: &str) -> String {
    let query = query.trim().trim_end_matches(';').trim_end();
    format!("COPY ({}) TO STDOUT WITH CSV HEADER", query)
}

async fn capture_csv(overwrite_config: &OverwriteConfig) -> Result<String> {
    match &overwrite_config.source {
        OverwriteSource::Query(query) => {
            let copy_sql = copy_to_stdout_sql(query);
            let command = pg_command(
                PgTool::Psql,
                &["-X", "-w", "-v", "ON_ERROR_STOP=1", "-c", &copy_sql],
                &overwrite_config.db,
            )?;
            process::run_captured(command).await.with_context(|| {
                format!("Failed to export query result from database {}", overwrite_config.db.name)
            })
        }
        OverwriteSource::CsvFile(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read CSV file {}", path.display())),
    }
}

/// Captures a snapshot as CSV, turns it into UPDATE and guarded INSERT
/// statements for `overwrite_config.table`, then prints them or pipes them
/// into the `apply_to` database.
pub async fn run_overwrite_flow(overwrite_config: OverwriteConfig) -> Result<()> {
    info!(
        target_name = %overwrite_config.target,
        "Building overwrite statements for table {} ...",
        overwrite_config.table
    );

    let csv_text = capture_csv(&overwrite_config).await?;
    let reconciliation =
        reconcile::reconcile_csv(&csv_text, overwrite_config.comment, &overwrite_config.table)
            .with_context(|| format!("Failed to build statements for table {}", overwrite_config.table))?;

    let sql = format!("{}{}", reconciliation.render_updates(), reconciliation.render_inserts());
    info!(
        target_name = %overwrite_config.target,
        "Generated {} UPDATE and {} INSERT statements",
        reconciliation.updates.len(),
        reconciliation.inserts.len()
    );

    match &overwrite_config.apply_to {
        Some(destination) => {
            if sql.is_empty() {
                info!(target_name = %overwrite_config.target, "Nothing to apply");
                return Ok(());
            }
            let command = pg_command(
                PgTool::Psql,
                &["-X", "-w", "-v", "ON_ERROR_STOP=1", "-1", "-f", "-"],
                destination,
            )?;
            process::run_with_input(command, sql.into_bytes())
                .await
                .with_context(|| format!("Failed to apply statements to database {}", destination.name))?;
            info!(target_name = %overwrite_config.target, "✓ Applied statements to {}", destination.name);
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(sql.as_bytes())
                .and_then(|_| stdout.flush())
                .context("Failed to write statements to stdout")?;
        }
    }
    Ok(())
}
