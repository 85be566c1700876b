//! Helpers to run external programs, built on [`std::process::Command`].

use std::{fmt, io, process};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty command provided")]
    Empty,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("non-zero exit status\n{0}")]
    NonZero(Output),
}

/// The captured result of a finished command.
#[derive(Debug, Clone)]
pub struct Output {
    /// The command line, for diagnostics.
    pub command: String,
    pub status: process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    fn new(command: String, value: process::Output) -> Self {
        Self {
            command,
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// The exit code, `None` if the process was killed by a signal.
    #[inline]
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "command: {}", self.command)?;
        writeln!(f, "status: {}", self.status)?;
        writeln!(f, "stdout: {:?}", self.stdout.trim_end())?;
        write!(f, "stderr: {:?}", self.stderr.trim_end())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Renders a command as a shell-like string.
pub fn display(cmd: &process::Command) -> String {
    let mut cmd_str = cmd.get_program().to_string_lossy().to_string();
    for arg in cmd.get_args() {
        cmd_str.push(' ');
        cmd_str.push_str(&arg.to_string_lossy());
    }

    cmd_str
}

#[derive(Debug)]
pub struct Runner;

impl Runner {
    /// Runs the command provided as strings, separating args with whitespaces.
    pub fn by_str(cmd: &str) -> Result<Output> {
        let mut iter = cmd.split_ascii_whitespace();
        let program = iter.next().ok_or(Error::Empty)?;
        let mut cmd = process::Command::new(program);
        cmd.args(iter);

        Self::run(&mut cmd)
    }

    /// Runs `cmd` to completion, failing with [`Error::NonZero`] if it does not succeed.
    pub fn run(cmd: &mut process::Command) -> Result<Output> {
        let output = Self::output(cmd)?;

        if !output.success() {
            tracing::debug!(
                ?output.stderr,
                ?output.status,
                command = %output.command,
                "command returned non-zero status"
            );
            return Err(Error::NonZero(output));
        }

        Ok(output)
    }

    /// Runs `cmd` to completion and returns its output whatever the exit status.
    pub fn output(cmd: &mut process::Command) -> Result<Output> {
        let command = display(cmd);
        cmd.stdin(process::Stdio::null())
            .stderr(process::Stdio::piped())
            .stdout(process::Stdio::piped());

        tracing::debug!(command, "running command");

        let raw = cmd
            .spawn()
            .and_then(|child| child.wait_with_output())
            .map_err(|source| Error::Spawn { program: command.clone(), source })?;

        Ok(Output::new(command, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_args() {
        let mut cmd = process::Command::new("ip");
        cmd.args(["link", "set", "dev", "a_to_b", "up"]);

        assert_eq!(display(&cmd), "ip link set dev a_to_b up");
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(Runner::by_str("   "), Err(Error::Empty)));
    }

    #[test]
    fn non_zero_status_keeps_output() {
        let mut cmd = process::Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);

        let Err(Error::NonZero(output)) = Runner::run(&mut cmd) else {
            panic!("expected non-zero exit");
        };
        assert_eq!(output.code(), Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(output.to_string().contains("sh -c"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        assert!(matches!(
            Runner::by_str("/nonexistent/xdpcheck-helper --flag"),
            Err(Error::Spawn { .. })
        ));
    }
}
