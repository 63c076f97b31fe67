pub mod process;

use std::path::PathBuf;
use tokio::process::Command;
use which::which;

use crate::config::ConnectionOptions;
use crate::errors::{AppError, Result};

/// PostgreSQL client programs the tasks shell out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgTool {
    Psql,
    PgDump,
}

impl PgTool {
    pub fn binary_name(self) -> &'static str {
        match self {
            PgTool::Psql => "psql",
            PgTool::PgDump => "pg_dump",
        }
    }
}

/// Finds a PostgreSQL client executable in the system PATH.
pub fn find_executable(tool: PgTool) -> Result<PathBuf> {
    which(tool.binary_name()).map_err(|e| {
        AppError::Config(format!(
            "{} executable not found in PATH ({}). Please ensure PostgreSQL client tools are installed and in your PATH.",
            tool.binary_name(),
            e
        ))
    })
}

/// Task arguments followed by the connection arguments. The password is
/// never part of the argument vector.
pub fn build_args(task_args: &[&str], options: &ConnectionOptions) -> Vec<String> {
    let mut args: Vec<String> = task_args.iter().map(|a| a.to_string()).collect();
    args.extend([
        "-h".to_string(),
        options.host.clone(),
        "-p".to_string(),
        options.port.to_string(),
        "-U".to_string(),
        options.user.clone(),
        "-d".to_string(),
        options.name.clone(),
    ]);
    args
}

/// Builds a ready-to-spawn command for `tool` against the database described
/// by `options`. Credentials and encoding travel through the environment.
pub fn pg_command(tool: PgTool, task_args: &[&str], options: &ConnectionOptions) -> Result<Command> {
    let program = find_executable(tool)?;
    let mut command = Command::new(program);
    command
        .args(build_args(task_args, options))
        .env("PGCLIENTENCODING", &options.charset)
        .kill_on_drop(true);
    match &options.password {
        Some(password) => command.env("PGPASSWORD", password),
        None => command.env_remove("PGPASSWORD"),
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            host: "db.example".to_string(),
            port: 5433,
            user: "app".to_string(),
            password: Some("hunter2".to_string()),
            name: "shop".to_string(),
            charset: "UTF8".to_string(),
        }
    }

    #[test]
    fn test_build_args_appends_connection_after_task_args() {
        let args = build_args(&["-X", "-w"], &options());
        assert_eq!(
            args,
            vec!["-X", "-w", "-h", "db.example", "-p", "5433", "-U", "app", "-d", "shop"]
        );
    }

    #[test]
    fn test_build_args_never_contains_password() {
        let args = build_args(&["-c", "SELECT 1"], &options());
        assert!(args.iter().all(|a| !a.contains("hunter2")));
    }

    #[test]
    fn test_binary_names() {
        assert_eq!(PgTool::Psql.binary_name(), "psql");
        assert_eq!(PgTool::PgDump.binary_name(), "pg_dump");
    }
}
