use crate::error::{Result, RuntimeError};
use tracing::debug;

/// Output from a command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stderr, or stdout when stderr is empty
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Execute a tool and fail on non-zero exit code
pub async fn exec(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let output = exec_unchecked(program, args).await?;

    if !output.success() {
        return Err(RuntimeError::command_failed(
            format!("{} {}", program, args.join(" ")),
            output.exit_code,
            output.message(),
        ));
    }

    Ok(output)
}

/// Execute a tool and return output regardless of exit code
///
/// Tools run with `LC_ALL=C` so their output can be parsed.
pub async fn exec_unchecked(program: &str, args: &[&str]) -> Result<CommandOutput> {
    debug!("Executing: {} {}", program, args.join(" "));

    let output = tokio::process::Command::new(program)
        .args(args)
        .env("LC_ALL", "C")
        .output()
        .await
        .map_err(|e| {
            RuntimeError::command_failed(
                format!("{} {}", program, args.join(" ")),
                -1,
                e.to_string(),
            )
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    debug!(
        "Command exited with code {}: {} {}",
        exit_code,
        program,
        args.join(" ")
    );

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_prefers_stderr() {
        let out = CommandOutput {
            stdout: "ignored\n".to_string(),
            stderr: "cannot open 'x': dataset does not exist\n".to_string(),
            exit_code: 1,
        };
        assert_eq!(out.message(), "cannot open 'x': dataset does not exist");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_missing_program_is_command_failure() {
        let err = exec("snapmount-definitely-missing-tool", &["--version"])
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CommandFailed { exit_code: -1, .. }));
    }
}
