// pgsqltool/src/dump/mod.rs
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::DumpConfig;
use crate::utils::{PgTool, pg_command, process};

/// pg_dump flags: clean statements guarded by IF EXISTS, no privileges, no ownership.
const PG_DUMP_ARGS: &[&str] = &["-c", "--if-exists", "--no-acl", "-O"];

/// Dumps the target database to `dump_config.file`, gzip-compressed when the
/// file name ends in `.gz`.
pub async fn run_dump_flow(dump_config: DumpConfig) -> Result<()> {
    info!(
        target_name = %dump_config.target,
        "Dumping DB {} to {} ...",
        dump_config.db.name,
        dump_config.file.display()
    );

    let command = pg_command(PgTool::PgDump, PG_DUMP_ARGS, &dump_config.db)?;
    let bytes = write_dump(command, &dump_config.file, dump_config.compress)
        .await
        .with_context(|| {
            format!(
                "Failed to dump database {} for target {}",
                dump_config.db.name, dump_config.target
            )
        })?;
    info!(
        target_name = %dump_config.target,
        "✓ Dumped {} bytes of SQL to {}",
        bytes,
        dump_config.file.display()
    );
    Ok(())
}

/// Streams the output of `command` into `file`, creating missing parent
/// directories. A failed run leaves no file behind.
async fn write_dump(command: Command, file: &Path, compress: bool) -> Result<u64> {
    if let Some(parent) = file.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create directory for dump file: {}", parent.display())
            })?;
        }
    }

    match process::run_to_file(command, file, compress).await {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            if let Err(remove_err) = fs::remove_file(file) {
                warn!("Could not remove partial dump {}: {}", file.display(), remove_err);
            }
            Err(e.into())
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::errors::AppError;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[tokio::test]
    async fn test_write_dump_creates_parent_directories() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("nightly").join("prod").join("shop.sql");

        let bytes = write_dump(shell("printf 'SELECT 1;\\n'"), &file, false).await?;

        assert_eq!(bytes, 10);
        assert_eq!(fs::read_to_string(&file)?, "SELECT 1;\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_dump_removes_partial_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("shop.sql.gz");

        let err = write_dump(shell("printf x; echo 'connection refused' >&2; exit 1"), &file, true)
            .await
            .unwrap_err();

        assert!(!file.exists());
        match err.downcast_ref::<AppError>() {
            Some(AppError::ProcessExecution { program, stderr, .. }) => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "connection refused");
            }
            other => panic!("expected process error, got {:?}", other),
        }
        Ok(())
    }
}
