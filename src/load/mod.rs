// pgsqltool/src/load/mod.rs
use anyhow::{Context, Result};
use tracing::info;

use crate::config::LoadConfig;
use crate::utils::{PgTool, pg_command, process};

/// psql arguments for replaying a dump. `-w` never prompts for a password.
pub fn psql_load_args(load_config: &LoadConfig) -> Vec<String> {
    let mut args = vec!["-X".to_string(), "-w".to_string()];
    if load_config.stop_on_error {
        args.extend(["-v".to_string(), "ON_ERROR_STOP=1".to_string()]);
    }
    args.push("-f".to_string());
    if load_config.compressed {
        args.push("-".to_string());
    } else {
        args.push(load_config.file.to_string_lossy().into_owned());
    }
    args
}

/// Restores a plain or gzip-compressed SQL dump into the target database.
pub async fn run_load_flow(load_config: LoadConfig) -> Result<()> {
    if !load_config.file.is_file() {
        anyhow::bail!("Dump file to load not found: {}", load_config.file.display());
    }

    info!(
        target_name = %load_config.target,
        "Loading DB {} with {} ...",
        load_config.db.name,
        load_config.file.display()
    );

    let args = psql_load_args(&load_config);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let command = pg_command(PgTool::Psql, &args, &load_config.db)?;

    let result = if load_config.compressed {
        process::run_with_gzip_input(command, &load_config.file).await
    } else {
        process::run_captured(command).await
    };
    result.with_context(|| {
        format!(
            "Failed to load {} into database {} for target {}",
            load_config.file.display(),
            load_config.db.name,
            load_config.target
        )
    })?;

    info!(target_name = %load_config.target, "✓ Loaded {}", load_config.file.display());
    Ok(())
}
