// pgkeeper/src/execs/mod.rs
//
// Wrapper around the PostgreSQL client executables. Tools are resolved either
// under an explicitly configured bin directory or on PATH; stderr is always
// captured so a failing tool surfaces its own diagnostics. Credentials travel
// through the child environment, never through the argument vector.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use which::which;

use crate::errors::{AppError, Result};

/// Resolves an executable, preferring the configured bin directory.
pub fn find_tool(bin_dir: Option<&Path>, name: &str) -> Result<PathBuf> {
    let candidate = match bin_dir {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    };
    which(&candidate).map_err(|_| AppError::ToolMissing(candidate.display().to_string()))
}

/// Captured output of one tool run.
#[derive(Debug, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// One prepared tool invocation.
#[derive(Debug)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    mirror_output: bool,
}

impl ToolCommand {
    pub fn new(program: PathBuf) -> Self {
        ToolCommand {
            program,
            args: Vec::new(),
            envs: Vec::new(),
            mirror_output: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Re-emit the captured streams on our own stdout/stderr after the run.
    pub fn mirror_output(mut self, enable: bool) -> Self {
        self.mirror_output = enable;
        self
    }

    fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Runs to completion with both streams captured.
    pub async fn run(&self) -> Result<ToolOutput> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if self.mirror_output {
            let _ = std::io::stdout().write_all(&output.stdout);
            let _ = std::io::stderr().write_all(&output.stderr);
        }

        if !output.status.success() {
            return Err(AppError::ToolFailed {
                tool: self.tool_name(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(ToolOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Runs with stdout streamed straight to `stdout_path` (restore logs can
    /// be large); stderr is still captured and returned.
    pub async fn run_stdout_to_file(&self, stdout_path: &Path) -> Result<Vec<u8>> {
        let file = std::fs::File::create(stdout_path)?;
        let output = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if self.mirror_output {
            let _ = std::io::stderr().write_all(&output.stderr);
        }

        if !output.status.success() {
            return Err(AppError::ToolFailed {
                tool: self.tool_name(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output.stderr)
    }
}
