//! External process execution for the ACME client and reload hook

use crate::types::{AcmeError, AcmeResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout and stderr joined, trimmed
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }

    /// Convert a non-zero exit into [`AcmeError::ExternalProcess`]
    pub fn into_result(self) -> AcmeResult<Self> {
        if self.success() {
            return Ok(self);
        }
        let output = self.combined();
        let output = if output.is_empty() {
            format!("process exited with status {}", describe_exit(self.exit_code))
        } else {
            output
        };
        Err(AcmeError::ExternalProcess {
            exit_code: self.exit_code,
            output,
        })
    }
}

fn describe_exit(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

/// Runs external programs with captured output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> AcmeResult<ProcessOutput>;

    /// Fail early when `program` cannot be executed at all
    async fn check_available(&self, _program: &str) -> AcmeResult<()> {
        Ok(())
    }
}

/// [`CommandRunner`] spawning real processes with a timeout
pub struct TokioCommandRunner {
    timeout: Duration,
    log_path: Option<PathBuf>,
}

impl TokioCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            log_path: None,
        }
    }

    /// Append every invocation and its output to `path`
    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    async fn append_log(&self, program: &str, args: &[String], body: &str) {
        let Some(path) = &self.log_path else {
            return;
        };

        let entry = format!(
            "[{}] {} {}\n{}\n",
            chrono::Utc::now().to_rfc3339(),
            program,
            args.join(" "),
            body.trim_end()
        );

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(entry.as_bytes()).await
        }
        .await;

        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to append to ACME log");
        }
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> AcmeResult<ProcessOutput> {
        debug!(program, args = %args.join(" "), "Running external command");

        let result = timeout(
            self.timeout,
            Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let output = ProcessOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                let body = format!(
                    "exit status {}\n{}",
                    describe_exit(output.exit_code),
                    output.combined()
                );
                self.append_log(program, args, &body).await;
                Ok(output)
            }
            Ok(Err(e)) => {
                self.append_log(program, args, &format!("failed to execute: {}", e))
                    .await;
                if e.kind() == std::io::ErrorKind::NotFound {
                    return Err(AcmeError::BinaryNotFound(program.to_string()));
                }
                Err(AcmeError::ProcessSpawn {
                    program: program.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                self.append_log(program, args, "timed out, process killed")
                    .await;
                Err(AcmeError::ProcessTimeout {
                    program: program.to_string(),
                    secs: self.timeout.as_secs(),
                })
            }
        }
    }

    async fn check_available(&self, program: &str) -> AcmeResult<()> {
        if find_executable(program).is_some() {
            Ok(())
        } else {
            Err(AcmeError::BinaryNotFound(program.to_string()))
        }
    }
}

/// Resolve `program` like a shell would: paths as-is, bare names via `PATH`
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
