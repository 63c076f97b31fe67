// pgsqltool/src/utils/process.rs
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::{AppError, Result};

const CHUNK_SIZE: usize = 64 * 1024;

/// Renders a command line for logging. Arguments with whitespace are quoted.
pub fn describe_command(command: &Command) -> String {
    let std_command = command.as_std();
    let mut parts = vec![program_name(command)];
    for arg in std_command.get_args() {
        let arg = arg.to_string_lossy();
        if arg.is_empty() || arg.chars().any(char::is_whitespace) {
            parts.push(format!("'{}'", arg));
        } else {
            parts.push(arg.into_owned());
        }
    }
    parts.join(" ")
}

fn program_name(command: &Command) -> String {
    let program = Path::new(command.as_std().get_program());
    program
        .file_name()
        .unwrap_or(program.as_os_str())
        .to_string_lossy()
        .into_owned()
}

fn spawn_error(command: &Command, err: std::io::Error) -> AppError {
    AppError::ProcessExecution {
        program: program_name(command),
        status: None,
        stderr: err.to_string(),
    }
}

/// Turns a finished process into its stdout, or a `ProcessExecution` error
/// carrying stderr when the exit status is non-zero.
fn check_output(program: String, output: Output) -> Result<String> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !stdout.trim().is_empty() {
        debug!(program = %program, "stdout:\n{}", stdout.trim_end());
    }

    if !output.status.success() {
        return Err(AppError::ProcessExecution {
            program,
            status: Some(output.status),
            stderr: stderr.trim().to_string(),
        });
    }

    if !stderr.trim().is_empty() {
        warn!(program = %program, "stderr:\n{}", stderr.trim_end());
    }
    Ok(stdout)
}

/// Runs the command to completion and returns its stdout.
pub async fn run_captured(mut command: Command) -> Result<String> {
    info!("running: {}", describe_command(&command));
    let output = command
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| spawn_error(&command, e))?;
    check_output(program_name(&command), output)
}

/// Runs the command with `input` written to its stdin and returns its stdout.
pub async fn run_with_input(mut command: Command, input: Vec<u8>) -> Result<String> {
    info!("running: {} (<- {} bytes on stdin)", describe_command(&command), input.len());
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(&command, e))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_error(&command, std::io::Error::other("stdin was not captured")))?;
    let writer = tokio::spawn(async move {
        stdin.write_all(&input).await?;
        stdin.shutdown().await
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| spawn_error(&command, e))?;
    let stdout = check_output(program_name(&command), output)?;
    join_writer(writer).await?;
    Ok(stdout)
}

/// Destination of a streamed dump: buffered plain output or a gzip stream.
enum FileSink<W: Write> {
    Plain(BufWriter<W>),
    Gzip(GzEncoder<W>),
}

impl<W: Write> FileSink<W> {
    fn new(inner: W, compress: bool) -> Self {
        if compress {
            FileSink::Gzip(GzEncoder::new(inner, Compression::default()))
        } else {
            FileSink::Plain(BufWriter::new(inner))
        }
    }

    /// Flushes buffered output and, for gzip, writes the trailer. Errors from
    /// either surface here instead of being lost on drop.
    fn finish(self) -> std::io::Result<W> {
        match self {
            FileSink::Plain(writer) => writer.into_inner().map_err(|e| e.into_error()),
            FileSink::Gzip(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for FileSink<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            FileSink::Plain(writer) => writer.write(buf),
            FileSink::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            FileSink::Plain(writer) => writer.flush(),
            FileSink::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// Runs the command and streams its stdout into `destination`, gzip-compressed
/// when `compress` is set. Returns the number of uncompressed bytes written.
pub async fn run_to_file(mut command: Command, destination: &Path, compress: bool) -> Result<u64> {
    info!(
        "running: {} > {}{}",
        describe_command(&command),
        destination.display(),
        if compress { " (gzip)" } else { "" }
    );

    let mut sink = FileSink::new(File::create(destination)?, compress);

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(&command, e))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error(&command, std::io::Error::other("stdout was not captured")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_error(&command, std::io::Error::other("stderr was not captured")))?;
    let stderr_reader = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await.map(|_| buf)
    });

    let mut total: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n])?;
        total += n as u64;
    }
    sink.finish()?;

    let status = child.wait().await.map_err(|e| spawn_error(&command, e))?;
    let stderr = match stderr_reader.await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return Err(e.into()),
        Err(e) => return Err(std::io::Error::other(e).into()),
    };
    check_output(
        program_name(&command),
        Output {
            status,
            stdout: Vec::new(),
            stderr,
        },
    )?;
    debug!("wrote {} bytes to {}", total, destination.display());
    Ok(total)
}

/// Runs the command with the decompressed contents of the gzip file `source`
/// streamed to its stdin. Returns the command's stdout.
pub async fn run_with_gzip_input(mut command: Command, source: &Path) -> Result<String> {
    info!("running: gunzip -c {} | {}", source.display(), describe_command(&command));
    let mut decoder = GzDecoder::new(File::open(source)?);

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(&command, e))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_error(&command, std::io::Error::other("stdin was not captured")))?;
    let writer = tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            stdin.write_all(&buf[..n]).await?;
        }
        stdin.shutdown().await
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| spawn_error(&command, e))?;
    let stdout = check_output(program_name(&command), output)?;
    join_writer(writer).await?;
    Ok(stdout)
}

async fn join_writer(writer: tokio::task::JoinHandle<std::io::Result<()>>) -> Result<()> {
    match writer.await {
        Ok(result) => Ok(result?),
        Err(e) => Err(std::io::Error::other(e).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_command_quotes_whitespace() {
        let mut command = Command::new("/usr/bin/psql");
        command.args(["-c", "SELECT 1", "-d", "shop"]);
        assert_eq!(describe_command(&command), "psql -c 'SELECT 1' -d shop");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_returns_stdout() -> anyhow::Result<()> {
        let mut command = Command::new("sh");
        command.args(["-c", "printf 'a|b\\n'"]);
        assert_eq!(run_captured(command).await?, "a|b\n");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_a_process_error() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo boom >&2; exit 3"]);
        match run_captured(command).await {
            Err(AppError::ProcessExecution { program, status, stderr }) => {
                assert_eq!(program, "sh");
                assert_eq!(status.and_then(|s| s.code()), Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected process error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_a_process_error() {
        let command = Command::new("pgsqltool-definitely-not-installed");
        let err = run_captured(command).await.unwrap_err();
        assert!(matches!(err, AppError::ProcessExecution { status: None, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gzip_round_trip_through_processes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dump = dir.path().join("dump.sql.gz");

        let mut producer = Command::new("sh");
        producer.args(["-c", "printf 'CREATE TABLE t (id int);\\n'"]);
        let written = run_to_file(producer, &dump, true).await?;
        assert_eq!(written, 25);

        let consumer = Command::new("cat");
        let echoed = run_with_gzip_input(consumer, &dump).await?;
        assert_eq!(echoed, "CREATE TABLE t (id int);\n");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_input_feeds_stdin() -> anyhow::Result<()> {
        let command = Command::new("cat");
        let out = run_with_input(command, b"ALTER TABLE x;\n".to_vec()).await?;
        assert_eq!(out, "ALTER TABLE x;\n");
        Ok(())
    }

    /// Accepts writes until `broken` is set.
    struct FlakyWriter {
        written: Vec<u8>,
        broken: bool,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.broken {
                return Err(std::io::Error::other("device full"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_gzip_trailer_write_failure_is_reported() -> anyhow::Result<()> {
        let mut sink = FileSink::new(FlakyWriter { written: Vec::new(), broken: false }, true);
        sink.write_all(b"CREATE TABLE t (id int);\n")?;
        sink.flush()?;
        if let FileSink::Gzip(encoder) = &mut sink {
            encoder.get_mut().broken = true;
        }
        assert!(sink.finish().is_err());
        Ok(())
    }

    #[test]
    fn test_plain_sink_flushes_on_finish() -> anyhow::Result<()> {
        let mut sink = FileSink::new(FlakyWriter { written: Vec::new(), broken: false }, false);
        sink.write_all(b"SELECT 1;\n")?;
        let inner = sink.finish()?;
        assert_eq!(inner.written, b"SELECT 1;\n");

        let mut sink = FileSink::new(FlakyWriter { written: Vec::new(), broken: true }, false);
        sink.write_all(b"SELECT 1;\n")?;
        assert!(sink.finish().is_err());
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_run_to_file_reports_write_failure() {
        let mut producer = Command::new("sh");
        producer.args(["-c", "printf 'CREATE TABLE t (id int);\\n'"]);
        let result = run_to_file(producer, Path::new("/dev/full"), true).await;
        assert!(matches!(result, Err(AppError::Io(_))));
    }
}
