// pgsqltool/src/purge/mod.rs
use anyhow::{Context, Result};
use tracing::info;

use crate::config::TargetConfig;
use crate::utils::{PgTool, pg_command, process};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub schema: String,
    pub name: String,
    pub kind: String,
}

/// Parses `psql -A -t -c '\d'` output (`schema|name|type|owner` per line).
/// Lines that are not relation rows are ignored.
pub fn parse_relations(listing: &str) -> Vec<Relation> {
    listing
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('|').map(str::trim).collect();
            if fields.len() < 3 || fields[1].is_empty() {
                return None;
            }
            Some(Relation {
                schema: fields[0].to_string(),
                name: fields[1].to_string(),
                kind: fields[2].to_string(),
            })
        })
        .collect()
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// DROP statements for every table, then every sequence. Dropping a table
/// takes its owned sequences with it, hence `IF EXISTS` on the sequences.
pub fn drop_statements(relations: &[Relation]) -> Vec<String> {
    let qualified = |r: &Relation| format!("{}.{}", quote_ident(&r.schema), quote_ident(&r.name));

    let tables = relations
        .iter()
        .filter(|r| r.kind == "table")
        .map(|r| format!("DROP TABLE IF EXISTS {} CASCADE", qualified(r)));
    let sequences = relations
        .iter()
        .filter(|r| r.kind == "sequence")
        .map(|r| format!("DROP SEQUENCE IF EXISTS {} CASCADE", qualified(r)));

    tables.chain(sequences).collect()
}

/// Drops every table and sequence visible to the target's user.
pub async fn run_drop_flow(drop_config: TargetConfig) -> Result<()> {
    info!(target_name = %drop_config.target, "Listing relations in {} ...", drop_config.db.name);
    let list_command = pg_command(PgTool::Psql, &["-X", "-w", "-A", "-t", "-c", "\\d"], &drop_config.db)?;
    let listing = process::run_captured(list_command)
        .await
        .with_context(|| format!("Failed to list relations of database {}", drop_config.db.name))?;

    let statements = drop_statements(&parse_relations(&listing));
    if statements.is_empty() {
        info!(target_name = %drop_config.target, "No tables or sequences to drop");
        return Ok(());
    }

    let sql = statements.join("; ");
    let drop_command = pg_command(PgTool::Psql, &["-X", "-w", "-c", &sql], &drop_config.db)?;
    process::run_captured(drop_command)
        .await
        .with_context(|| format!("Failed to drop relations of database {}", drop_config.db.name))?;

    info!(
        target_name = %drop_config.target,
        "✓ Dropped {} relations from {}",
        statements.len(),
        drop_config.db.name
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "public|accounts|table|app\n\
                           public|accounts_id_seq|sequence|app\n\
                           public|active_accounts|view|app\n\
                           sales|orders|table|app\n";

    #[test]
    fn test_parse_relations() {
        let relations = parse_relations(LISTING);
        assert_eq!(relations.len(), 4);
        assert_eq!(
            relations[3],
            Relation {
                schema: "sales".to_string(),
                name: "orders".to_string(),
                kind: "table".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_relations_ignores_noise() {
        assert!(parse_relations("Did not find any relations.\n\n").is_empty());
    }

    #[test]
    fn test_drop_statements_tables_before_sequences() {
        let statements = drop_statements(&parse_relations(LISTING));
        assert_eq!(
            statements,
            vec![
                r#"DROP TABLE IF EXISTS "public"."accounts" CASCADE"#,
                r#"DROP TABLE IF EXISTS "sales"."orders" CASCADE"#,
                r#"DROP SEQUENCE IF EXISTS "public"."accounts_id_seq" CASCADE"#,
            ]
        );
    }

    #[test]
    fn test_quote_ident_doubles_quotes() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }
}
