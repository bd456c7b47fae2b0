//! Bounded subprocess execution.
//!
//! Every external invocation the kernel makes (checkers, verification
//! commands, git) goes through [`run_command`], which captures output and
//! enforces a wall-clock timeout.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// Captured output of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr concatenated, in that order.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `argv` in `cwd` with a timeout, capturing stdout and stderr.
///
/// # Errors
///
/// Returns `ErrorKind::NotFound` when the program is missing,
/// `ErrorKind::TimedOut` when the timeout elapses, and other IO errors
/// as reported by the OS. A non-zero exit status is not an error.
pub async fn run_command(
    argv: &[String],
    cwd: &Path,
    timeout: Duration,
) -> std::io::Result<CommandOutput> {
    let (program, args) = argv.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line")
    })?;

    debug!(command = %argv.join(" "), cwd = %cwd.display(), "spawning subprocess");

    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("command timed out after {}s: {}", timeout.as_secs(), program),
            ));
        }
    };

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let argv = vec!["echo".to_string(), "hello".to_string()];
        let out = run_command(&argv, Path::new("."), Duration::from_secs(5))
            .await
            .expect("echo should run");
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_command_missing_program() {
        let argv = vec!["definitely-not-a-real-binary-xyz".to_string()];
        let err = run_command(&argv, Path::new("."), Duration::from_secs(5))
            .await
            .expect_err("missing binary should error");
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_run_command_empty_argv() {
        let err = run_command(&[], Path::new("."), Duration::from_secs(5))
            .await
            .expect_err("empty argv should error");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_timeout() {
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let err = run_command(&argv, Path::new("."), Duration::from_millis(100))
            .await
            .expect_err("sleep should time out");
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_nonzero_exit_is_not_error() {
        let argv = vec!["false".to_string()];
        let out = run_command(&argv, Path::new("."), Duration::from_secs(5))
            .await
            .expect("false should run");
        assert!(!out.success());
    }
}
