// crates/core/src/cbt/command.rs
//! External tool invocation for the local tracker variants.

use std::process::Command;
use std::time::Instant;

use crate::error::CbtError;

/// Runs a tool and returns its stdout. A seam so trackers can be tested
/// against scripted output.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CbtError>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CbtError> {
        let t0 = Instant::now();
        let output = Command::new(program).args(args).output().map_err(|e| {
            tracing::error!(program, error = %e, "Failed to spawn tracker command");
            CbtError::Command {
                program: program.to_string(),
                message: e.to_string(),
            }
        })?;
        let elapsed_ms = t0.elapsed().as_millis() as u64;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let snippet: String = stderr.chars().take(500).collect();
            tracing::warn!(program, elapsed_ms, exit_code = ?output.status.code(), stderr = %snippet, "Tracker command failed");
            return Err(CbtError::Command {
                program: program.to_string(),
                message: if stderr.is_empty() {
                    format!("exited with {}", output.status)
                } else {
                    stderr.to_string()
                },
            });
        }

        tracing::debug!(program, elapsed_ms, "Tracker command finished");
        String::from_utf8(output.stdout).map_err(|e| CbtError::Parse(e.to_string()))
    }
}
