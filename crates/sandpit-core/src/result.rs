//! Execution result types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Raw outcome of one command run inside a sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    /// Exit code of the process
    pub exit_code: i64,

    /// Combined stdout and stderr in arrival order
    pub output: Vec<u8>,

    /// Execution duration
    pub duration: Duration,

    /// Whether the process was killed due to timeout
    pub timed_out: bool,

    /// Whether output beyond the configured cap was dropped
    pub truncated: bool,
}

impl RunOutput {
    /// Get combined output as UTF-8 string, lossy conversion
    #[must_use]
    pub fn output_str(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.output).into_owned();
        if self.truncated {
            text.push_str("\n[output truncated]");
        }
        text
    }

    /// Check if the run was successful (exit code 0, no timeout)
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

impl Default for RunOutput {
    fn default() -> Self {
        Self {
            exit_code: -1,
            output: Vec::new(),
            duration: Duration::ZERO,
            timed_out: false,
            truncated: false,
        }
    }
}

/// Successful script execution, demultiplexed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// First `<!DOCTYPE html>` block printed by the script
    pub html: Option<String>,
    /// Remaining output, trimmed
    pub text: String,
}

/// Successful checker run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintReport {
    /// Trimmed checker output, possibly empty
    pub report: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_out_runs_are_never_successful() {
        let run = RunOutput {
            exit_code: 0,
            timed_out: true,
            ..RunOutput::default()
        };
        assert!(!run.is_success());
    }

    #[test]
    fn truncation_is_visible_in_text() {
        let run = RunOutput {
            exit_code: 0,
            output: b"abc".to_vec(),
            truncated: true,
            ..RunOutput::default()
        };
        assert_eq!(run.output_str(), "abc\n[output truncated]");
    }
}
