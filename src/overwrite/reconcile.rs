// pgsqltool/src/overwrite/reconcile.rs
//! Rebuilds `UPDATE` and guarded `INSERT` statements from a captured CSV
//! snapshot so a destination table can be brought in line with it.
//!
//! Values are interpolated as single-quoted literals without escaping and the
//! key value is written bare, so the input is expected to come from a trusted
//! export.

use std::fmt;

use super::csv_table::CsvTable;
use crate::errors::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationStatement {
    Update {
        table: String,
        assignments: Vec<(String, String)>,
        key_column: String,
        key_value: String,
    },
    ConditionalInsert {
        table: String,
        columns: Vec<String>,
        values: Vec<String>,
        key_column: String,
        key_value: String,
    },
}

impl fmt::Display for ReconciliationStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconciliationStatement::Update {
                table,
                assignments,
                key_column,
                key_value,
            } => {
                let set = assignments
                    .iter()
                    .map(|(column, value)| format!("{} = '{}'", column, value))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "UPDATE {} SET {} WHERE {} = {}", table, set, key_column, key_value)
            }
            ReconciliationStatement::ConditionalInsert {
                table,
                columns,
                values,
                key_column,
                key_value,
            } => {
                let values = values
                    .iter()
                    .map(|value| format!("'{}'", value))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(
                    f,
                    "INSERT INTO {} ({}) SELECT {} WHERE NOT EXISTS (SELECT 1 FROM {} WHERE {} = {})",
                    table,
                    columns.join(", "),
                    values,
                    table,
                    key_column,
                    key_value
                )
            }
        }
    }
}

/// Statements derived from one snapshot: updates for every row, inserts for
/// every row after the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub updates: Vec<ReconciliationStatement>,
    pub inserts: Vec<ReconciliationStatement>,
}

impl Reconciliation {
    pub fn render_updates(&self) -> String {
        render(&self.updates)
    }

    pub fn render_inserts(&self) -> String {
        render(&self.inserts)
    }
}

/// Joins statements with `;\n`, keeping the trailing separator. An empty list
/// renders as an empty string.
pub fn render(statements: &[ReconciliationStatement]) -> String {
    statements.iter().map(|s| format!("{};\n", s)).collect()
}

pub fn generate(csv: &CsvTable, table: &str) -> Result<Reconciliation> {
    if table.trim().is_empty() {
        return Err(AppError::InvalidInput("target table name must not be empty".to_string()));
    }

    let header = csv.header();
    let key_column = csv.key_column();
    let mut reconciliation = Reconciliation::default();

    for (index, row) in csv.rows().iter().enumerate() {
        let key_value = row[0].clone();

        reconciliation.updates.push(ReconciliationStatement::Update {
            table: table.to_string(),
            assignments: header.iter().cloned().zip(row.iter().cloned()).collect(),
            key_column: key_column.to_string(),
            key_value: key_value.clone(),
        });

        // The first data row only ever gets an UPDATE.
        if index == 0 {
            continue;
        }
        reconciliation.inserts.push(ReconciliationStatement::ConditionalInsert {
            table: table.to_string(),
            columns: header.to_vec(),
            values: row.clone(),
            key_column: key_column.to_string(),
            key_value,
        });
    }

    Ok(reconciliation)
}

/// Parses raw CSV text and builds its statements. Any malformed row aborts
/// the whole batch.
pub fn reconcile_csv(text: &str, comment: Option<u8>, table: &str) -> Result<Reconciliation> {
    let csv = CsvTable::parse(text, comment)?;
    generate(&csv, table)
}

/// Like [`reconcile_csv`], rendered as `(updates, inserts)`.
pub fn generate_from_csv(text: &str, comment: Option<u8>, table: &str) -> Result<(String, String)> {
    let reconciliation = reconcile_csv(text, comment, table)?;
    Ok((reconciliation.render_updates(), reconciliation.render_inserts()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_row_yields_one_update_and_no_insert() -> anyhow::Result<()> {
        let csv = CsvTable::parse("id,a,b\n1,x,y\n", None)?;
        let reconciliation = generate(&csv, "t")?;

        assert_eq!(reconciliation.updates.len(), 1);
        assert_eq!(
            reconciliation.updates[0].to_string(),
            "UPDATE t SET id = '1', a = 'x', b = 'y' WHERE id = 1"
        );
        assert!(reconciliation.inserts.is_empty());
        Ok(())
    }

    #[test]
    fn test_second_row_gets_guarded_insert() -> anyhow::Result<()> {
        let (updates, inserts) = generate_from_csv("id,a\n1,x\n2,y\n", None, "t")?;

        assert_eq!(
            updates,
            "UPDATE t SET id = '1', a = 'x' WHERE id = 1;\nUPDATE t SET id = '2', a = 'y' WHERE id = 2;\n"
        );
        assert_eq!(
            inserts,
            "INSERT INTO t (id, a) SELECT '2', 'y' WHERE NOT EXISTS (SELECT 1 FROM t WHERE id = 2);\n"
        );
        Ok(())
    }

    #[test]
    fn test_key_column_follows_header() -> anyhow::Result<()> {
        let (updates, inserts) = generate_from_csv("code,label\nA,x\nB,y\n", None, "codes")?;

        assert!(updates.contains("WHERE code = A;"));
        assert!(inserts.contains("WHERE NOT EXISTS (SELECT 1 FROM codes WHERE code = B)"));
        Ok(())
    }

    #[test]
    fn test_generation_is_idempotent() -> anyhow::Result<()> {
        let input = "id,name,qty\n1,apple,3\n2,pear,5\n3,plum,8\n";
        let first = generate_from_csv(input, None, "stock")?;
        let second = generate_from_csv(input, None, "stock")?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_inserts_carry_source_values_unchanged() -> anyhow::Result<()> {
        let csv = CsvTable::parse("id,name,qty\n1,apple,3\n2,pear,5\n3,plum,8\n", None)?;
        let reconciliation = generate(&csv, "stock")?;

        let mut reproduced: Vec<Vec<String>> = Vec::new();
        for statement in &reconciliation.updates {
            if let ReconciliationStatement::Update { assignments, .. } = statement {
                reproduced.push(assignments.iter().map(|(_, v)| v.clone()).collect());
            }
        }
        assert_eq!(reproduced, csv.rows());

        let mut inserted: Vec<Vec<String>> = Vec::new();
        for statement in &reconciliation.inserts {
            match statement {
                ReconciliationStatement::ConditionalInsert { columns, values, .. } => {
                    assert_eq!(columns.as_slice(), csv.header());
                    inserted.push(values.clone());
                }
                other => panic!("expected insert, got {:?}", other),
            }
        }
        assert_eq!(inserted, &csv.rows()[1..]);

        // Against an empty table only the inserts create rows, so the first
        // snapshot row never arrives.
        assert!(!inserted.contains(&csv.rows()[0]));
        Ok(())
    }

    #[test]
    fn test_statement_counts_ignore_embedded_newlines() -> anyhow::Result<()> {
        let reconciliation = reconcile_csv("id,note\n1,\"a\nb\"\n2,\"c\nd\"\n", None, "t")?;

        assert_eq!(reconciliation.updates.len(), 2);
        assert_eq!(reconciliation.inserts.len(), 1);
        assert_eq!(reconciliation.render_updates().lines().count(), 4);
        Ok(())
    }

    #[test]
    fn test_short_row_aborts_whole_batch() {
        let result = generate_from_csv("id,a,b\n1,x,y\n2,z\n", None, "t");
        assert!(matches!(result, Err(AppError::MalformedRow { .. })));
    }

    #[test]
    fn test_header_only_yields_empty_output() -> anyhow::Result<()> {
        let (updates, inserts) = generate_from_csv("id,a\n", None, "t")?;
        assert_eq!(updates, "");
        assert_eq!(inserts, "");
        Ok(())
    }

    #[test]
    fn test_empty_table_name_is_rejected() -> anyhow::Result<()> {
        let csv = CsvTable::parse("id\n1\n", None)?;
        assert!(matches!(generate(&csv, " "), Err(AppError::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn test_values_are_not_escaped() -> anyhow::Result<()> {
        let (updates, _) = generate_from_csv("id,name\n1,\"O'Brien\"\n", None, "people")?;
        assert_eq!(updates, "UPDATE people SET id = '1', name = 'O'Brien' WHERE id = 1;\n");
        Ok(())
    }
}
