// pgsqltool/src/dispatch.rs
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::{
    ALL_TARGETS, AppConfig, ConnectionOptions, DumpConfig, LoadConfig, MoveConstraintsConfig,
    OperationConfig, OverwriteConfig, OverwriteSource, TargetConfig, dump_file_for_target,
    is_gzip_path,
};
use crate::errors::AppError;
use crate::{constraints, dump, load, overwrite, purge};

#[derive(Debug, Clone, Subcommand)]
pub enum TaskCommand {
    /// Dump database to a file (gzip-compressed when the name ends in .gz)
    Dump {
        /// Configured target, or `all`
        target: String,
        /// Output file; the first `%s` is replaced by the target name
        file: String,
    },
    /// Restore a dump
    Load {
        /// Configured target, or `all`
        target: String,
        /// Plain or .gz SQL dump
        file: PathBuf,
        /// Stop at the first failing statement
        #[arg(long)]
        strict: bool,
    },
    /// Drop tables and sequences
    Drop {
        /// Configured target, or `all`
        target: String,
    },
    /// Drop every constraint in the target database
    DropConstraints {
        /// Configured target, or `all`
        target: String,
    },
    /// Copy constraints from a source database into the target database
    MoveConstraints {
        /// Configured target, or `all`
        target: String,
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Print (or apply) UPDATE/INSERT statements rebuilt from a query result
    Overwrite {
        /// Configured target the query runs against, or `all`
        target: String,
        /// Table the statements are written for
        #[arg(long)]
        table: String,
        /// Query whose result is captured
        #[arg(long, conflicts_with = "csv", required_unless_present = "csv")]
        query: Option<String>,
        /// Read the snapshot from a CSV file instead of running a query
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Ignore CSV lines starting with this character
        #[arg(long)]
        comment: Option<char>,
        /// Pipe the statements into this `overwrite` target instead of printing them
        #[arg(long)]
        apply_to: Option<String>,
    },
}

/// Connection to the database constraints are copied from.
#[derive(Debug, Clone, Args)]
pub struct SourceArgs {
    #[arg(long)]
    pub source_user: String,
    #[arg(long, env = "PGSQLTOOL_SOURCE_PASSWORD", hide_env_values = true)]
    pub source_password: Option<String>,
    #[arg(long, default_value = "127.0.0.1")]
    pub source_host: String,
    #[arg(long, default_value_t = 5432)]
    pub source_port: u16,
    #[arg(long)]
    pub source_database: String,
}

impl SourceArgs {
    fn connection_options(&self, charset: &str) -> crate::errors::Result<ConnectionOptions> {
        let options = ConnectionOptions {
            host: self.source_host.clone(),
            port: self.source_port,
            user: self.source_user.clone(),
            password: self.source_password.clone().filter(|p| !p.is_empty()),
            name: self.source_database.clone(),
            charset: charset.to_string(),
        };
        options.validate()?;
        Ok(options)
    }
}

impl TaskCommand {
    /// Name of the task section in the config file.
    pub fn task_name(&self) -> &'static str {
        match self {
            TaskCommand::Dump { .. } => "dump",
            TaskCommand::Load { .. } => "load",
            TaskCommand::Drop { .. } => "drop",
            TaskCommand::DropConstraints { .. } => "drop-constraints",
            TaskCommand::MoveConstraints { .. } => "move-constraints",
            TaskCommand::Overwrite { .. } => "overwrite",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            TaskCommand::Dump { target, .. }
            | TaskCommand::Load { target, .. }
            | TaskCommand::Drop { target }
            | TaskCommand::DropConstraints { target }
            | TaskCommand::MoveConstraints { target, .. }
            | TaskCommand::Overwrite { target, .. } => target.as_str(),
        }
    }
}

/// Resolves everything one task needs for one target. Every configuration
/// error surfaces here, before any external command runs.
pub fn build_operation(
    app_config: &AppConfig,
    command: &TaskCommand,
    target: &str,
) -> crate::errors::Result<OperationConfig> {
    let db = app_config.resolve(command.task_name(), target)?;
    let target = target.to_string();

    let operation = match command {
        TaskCommand::Dump { file, .. } => {
            let file = dump_file_for_target(file, &target);
            let compress = is_gzip_path(&file);
            OperationConfig::Dump(DumpConfig { target, db, file, compress })
        }
        TaskCommand::Load { file, strict, .. } => OperationConfig::Load(LoadConfig {
            target,
            db,
            compressed: is_gzip_path(file),
            file: file.clone(),
            stop_on_error: *strict,
        }),
        TaskCommand::Drop { .. } => OperationConfig::Drop(TargetConfig { target, db }),
        TaskCommand::DropConstraints { .. } => {
            OperationConfig::DropConstraints(TargetConfig { target, db })
        }
        TaskCommand::MoveConstraints { source, .. } => {
            let source = source.connection_options(&db.charset)?;
            OperationConfig::MoveConstraints(MoveConstraintsConfig { target, source, db })
        }
        TaskCommand::Overwrite {
            table,
            query,
            csv,
            comment,
            apply_to,
            ..
        } => {
            if table.trim().is_empty() {
                return Err(AppError::Config("--table must not be empty".to_string()));
            }
            let source = match (query, csv) {
                (Some(query), None) => OverwriteSource::Query(query.clone()),
                (None, Some(path)) => OverwriteSource::CsvFile(path.clone()),
                _ => {
                    return Err(AppError::Config(
                        "overwrite needs exactly one of --query or --csv".to_string(),
                    ));
                }
            };
            let comment = match comment {
                Some(c) if c.is_ascii() => Some(*c as u8),
                Some(c) => {
                    return Err(AppError::Config(format!(
                        "comment marker '{}' must be an ASCII character",
                        c
                    )));
                }
                None => None,
            };
            let apply_to = apply_to
                .as_deref()
                .map(|destination| app_config.resolve(command.task_name(), destination))
                .transpose()?;
            OperationConfig::Overwrite(OverwriteConfig {
                target,
                db,
                table: table.clone(),
                source,
                comment,
                apply_to,
            })
        }
    };
    Ok(operation)
}

pub async fn run_operation(operation: OperationConfig) -> Result<()> {
    match operation {
        OperationConfig::Dump(cfg) => dump::run_dump_flow(cfg).await,
        OperationConfig::Load(cfg) => load::run_load_flow(cfg).await,
        OperationConfig::Drop(cfg) => purge::run_drop_flow(cfg).await,
        OperationConfig::DropConstraints(cfg) => constraints::run_drop_constraints_flow(cfg).await,
        OperationConfig::MoveConstraints(cfg) => constraints::run_move_constraints_flow(cfg).await,
        OperationConfig::Overwrite(cfg) => overwrite::run_overwrite_flow(cfg).await,
    }
}

/// Every configured target of the task, with operations resolved up front.
pub fn build_fan_out(
    app_config: &AppConfig,
    command: &TaskCommand,
    jobs: usize,
) -> crate::errors::Result<Vec<OperationConfig>> {
    let targets = app_config.targets_for(command.task_name());
    if targets.is_empty() {
        return Err(AppError::Config(format!(
            "task '{}' has no configured targets to run for '{}'",
            command.task_name(),
            ALL_TARGETS
        )));
    }

    let operations = targets
        .iter()
        .map(|target| build_operation(app_config, command, target))
        .collect::<crate::errors::Result<Vec<_>>>()?;

    if jobs > 1 {
        let mut seen = HashSet::new();
        for operation in &operations {
            if let OperationConfig::Dump(cfg) = operation {
                if !seen.insert(cfg.file.clone()) {
                    return Err(AppError::Config(format!(
                        "several targets would dump to {} concurrently; put %s in the file name",
                        cfg.file.display()
                    )));
                }
            }
        }
    }
    Ok(operations)
}

/// Runs the task for one target, or for every configured target when the
/// target is `all`. At most `jobs` targets run at a time.
pub async fn run_task(app_config: &AppConfig, command: &TaskCommand, jobs: usize) -> Result<()> {
    if command.target() != ALL_TARGETS {
        let operation = build_operation(app_config, command, command.target())?;
        return run_operation(operation).await;
    }

    let operations = build_fan_out(app_config, command, jobs)?;
    let total = operations.len();
    info!("Running {} for {} targets ({} at a time)", command.task_name(), total, jobs);

    let mut failed = Vec::new();
    if jobs <= 1 {
        for operation in operations {
            let target = operation.target().to_string();
            if let Err(e) = run_operation(operation).await {
                error!(target_name = %target, "{:#}", e);
                failed.push(target);
            }
        }
    } else {
        let semaphore = Arc::new(Semaphore::new(jobs));
        let mut set = JoinSet::new();
        for operation in operations {
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let target = operation.target().to_string();
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => run_operation(operation).await,
                    Err(e) => Err(e.into()),
                };
                (target, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            let (target, result) = joined.context("target task panicked")?;
            if let Err(e) = result {
                error!(target_name = %target, "{:#}", e);
                failed.push(target);
            }
        }
    }

    if !failed.is_empty() {
        failed.sort();
        anyhow::bail!(
            "{} of {} targets failed for {}: {}",
            failed.len(),
            total,
            command.task_name(),
            failed.join(", ")
        );
    }
    Ok(())
}
