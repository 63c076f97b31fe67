// pgsqltool/src/constraints/mod.rs
use anyhow::{Context, Result};
use tracing::info;

use crate::config::{ConnectionOptions, MoveConstraintsConfig, TargetConfig};
use crate::utils::{PgTool, pg_command, process};

const USER_NAMESPACES: &str =
    "nspname NOT IN ('pg_catalog', 'information_schema') AND nspname NOT LIKE 'pg_toast%'";

/// Foreign keys go first so the keys they reference can be dropped after them.
fn drop_constraints_query() -> String {
    format!(
        "SELECT 'ALTER TABLE ' || quote_ident(nspname) || '.' || quote_ident(relname) \
         || ' DROP CONSTRAINT ' || quote_ident(conname) || ';' \
         FROM pg_constraint \
         INNER JOIN pg_class ON conrelid = pg_class.oid \
         INNER JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace \
         WHERE {} \
         ORDER BY CASE WHEN contype = 'f' THEN 0 ELSE 1 END, contype, nspname, relname, conname",
        USER_NAMESPACES
    )
}

/// Foreign keys go last so the keys they reference exist by then.
fn add_constraints_query() -> String {
    format!(
        "SELECT 'ALTER TABLE ' || quote_ident(nspname) || '.' || quote_ident(relname) \
         || ' ADD CONSTRAINT ' || quote_ident(conname) || ' ' \
         || pg_get_constraintdef(pg_constraint.oid) || ';' \
         FROM pg_constraint \
         INNER JOIN pg_class ON conrelid = pg_class.oid \
         INNER JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace \
         WHERE {} \
         ORDER BY CASE WHEN contype = 'f' THEN 0 ELSE 1 END DESC, contype DESC, nspname DESC, relname DESC, conname DESC",
        USER_NAMESPACES
    )
}

/// Keeps only the generated `ALTER` statements from psql output.
pub fn alter_statements(listing: &str) -> String {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| line.contains("ALTER"))
        .fold(String::new(), |mut sql, line| {
            sql.push_str(line);
            sql.push('\n');
            sql
        })
}

async fn generate_statements(db: &ConnectionOptions, query: &str) -> Result<String> {
    let command = pg_command(PgTool::Psql, &["-X", "-w", "-A", "-t", "-c", query], db)?;
    let listing = process::run_captured(command)
        .await
        .with_context(|| format!("Failed to read constraints of database {}", db.name))?;
    Ok(alter_statements(&listing))
}

async fn apply_statements(db: &ConnectionOptions, sql: String) -> Result<()> {
    let command = pg_command(PgTool::Psql, &["-X", "-w", "-f", "-"], db)?;
    process::run_with_input(command, sql.into_bytes())
        .await
        .with_context(|| format!("Failed to apply constraint statements to database {}", db.name))?;
    Ok(())
}

/// Drops every constraint in the target database.
pub async fn run_drop_constraints_flow(config: TargetConfig) -> Result<()> {
    info!(target_name = %config.target, "Dropping constraints in {} ...", config.db.name);
    let sql = generate_statements(&config.db, &drop_constraints_query()).await?;
    if sql.is_empty() {
        info!(target_name = %config.target, "No constraints to drop");
        return Ok(());
    }

    let count = sql.lines().count();
    apply_statements(&config.db, sql).await?;
    info!(target_name = %config.target, "✓ Dropped {} constraints", count);
    Ok(())
}

/// Recreates the source database's constraints in the target database.
pub async fn run_move_constraints_flow(config: MoveConstraintsConfig) -> Result<()> {
    info!(
        target_name = %config.target,
        "Moving constraints from {}@{}/{} to {} ...",
        config.source.user,
        config.source.host,
        config.source.name,
        config.db.name
    );
    let sql = generate_statements(&config.source, &add_constraints_query()).await?;
    if sql.is_empty() {
        info!(target_name = %config.target, "Source database has no constraints to move");
        return Ok(());
    }

    let count = sql.lines().count();
    apply_statements(&config.db, sql).await?;
    info!(target_name = %config.target, "✓ Applied {} constraints", count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alter_statements_keeps_only_alter_lines() {
        let listing = "ALTER TABLE public.orders DROP CONSTRAINT orders_customer_fkey;\n\
                       \n\
                       (2 rows)\n\
                       ALTER TABLE public.orders DROP CONSTRAINT orders_pkey;\n";
        assert_eq!(
            alter_statements(listing),
            "ALTER TABLE public.orders DROP CONSTRAINT orders_customer_fkey;\n\
             ALTER TABLE public.orders DROP CONSTRAINT orders_pkey;\n"
        );
    }

    #[test]
    fn test_alter_statements_empty_listing() {
        assert_eq!(alter_statements(""), "");
    }

    #[test]
    fn test_queries_order_foreign_keys_oppositely() {
        assert!(drop_constraints_query().contains("THEN 0 ELSE 1 END, contype,"));
        assert!(add_constraints_query().contains("THEN 0 ELSE 1 END DESC"));
        assert!(add_constraints_query().contains("pg_get_constraintdef"));
    }

    #[test]
    fn test_queries_skip_system_schemas() {
        for query in [drop_constraints_query(), add_constraints_query()] {
            assert!(query.contains("'pg_catalog'"));
            assert!(query.contains("pg_toast"));
        }
    }
}
