use std::{
    fmt::Display,
    io::ErrorKind,
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use tracing::debug;

/// What a single remote command produced. Transport problems (tool missing,
/// timeout, device unreachable) show up as `success = false` with a
/// descriptive stderr, never as an error value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn failure(stderr: impl Into<String>) -> Self {
        CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// A runner that cannot even produce a `CommandOutput` has broken its
/// contract; this is fatal for the whole run and is never retried.
#[derive(Debug)]
pub struct RunnerError(pub String);

impl std::error::Error for RunnerError {}

impl Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command runner misbehaved: {}", self.0)
    }
}

/// Run a single shell command line on the target and report what happened.
pub trait ShellRunner {
    fn run(&self, command_line: &str) -> Result<CommandOutput, RunnerError>;
}

/// Executes command lines on a device through `adb shell`.
#[derive(Debug, Clone)]
pub struct AdbShell {
    device: Option<String>,
    command_timeout: Duration,
}

impl AdbShell {
    pub fn new(device: Option<String>, command_timeout: Duration) -> Self {
        AdbShell {
            device,
            command_timeout,
        }
    }

    fn adb_command(&self) -> Command {
        let mut command = Command::new("adb");
        if let Some(serial) = &self.device {
            command.arg("-s").arg(serial);
        }
        command
    }

    /// List the serials of connected devices in the `device` state.
    pub fn devices(&self) -> Result<Vec<String>, String> {
        let mut command = self.adb_command();
        command.arg("devices");

        let output = run_with_timeout(command, self.command_timeout);
        if !output.success {
            return Err(output.stderr);
        }

        Ok(parse_devices(&output.stdout))
    }
}

impl ShellRunner for AdbShell {
    fn run(&self, command_line: &str) -> Result<CommandOutput, RunnerError> {
        let mut command = self.adb_command();
        command.arg("shell").arg(command_line);

        debug!(command = command_line, "running remote command");
        Ok(run_with_timeout(command, self.command_timeout))
    }
}

fn parse_devices(listing: &str) -> Vec<String> {
    // `adb devices` output: a header line, then `SERIAL\tSTATE` per device.
    listing
        .lines()
        .skip(1)
        .filter_map(|line| line.split_once('\t'))
        .filter(|(_, state)| state.trim() == "device")
        .map(|(serial, _)| serial.to_string())
        .collect()
}

/// Run a local command to completion with a bounded execution time. The child
/// is killed when the deadline passes; stale output from a killed child is
/// discarded along with it.
fn run_with_timeout(mut command: Command, timeout: Duration) -> CommandOutput {
    let program = command.get_program().to_string_lossy().into_owned();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return CommandOutput::failure(format!("{program} not found in PATH"))
        }
        Err(e) => return CommandOutput::failure(format!("could not start {program}: {e}")),
    };

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return CommandOutput::failure(format!(
                    "command timed out after {:?}",
                    timeout
                ));
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(25)),
            Err(e) => {
                let _ = child.kill();
                return CommandOutput::failure(format!("could not wait for {program}: {e}"));
            }
        }
    }

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(e) => return CommandOutput::failure(format!("could not read {program} output: {e}")),
    };

    CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn captures_output_of_successful_command() {
        let output = run_with_timeout(sh("echo out; echo err >&2"), Duration::from_secs(5));
        assert!(output.success);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[test]
    fn nonzero_exit_is_not_success() {
        let output = run_with_timeout(sh("echo nope >&2; exit 3"), Duration::from_secs(5));
        assert!(!output.success);
        assert_eq!(output.stderr, "nope\n");
    }

    #[test]
    fn missing_binary_reports_failure_not_error() {
        let command = Command::new("adb-timesync-no-such-binary");
        let output = run_with_timeout(command, Duration::from_secs(5));
        assert!(!output.success);
        assert!(output.stderr.contains("not found in PATH"));
    }

    #[test]
    fn slow_command_is_killed_at_the_deadline() {
        let start = Instant::now();
        let output = run_with_timeout(sh("sleep 30"), Duration::from_millis(200));
        assert!(!output.success);
        assert!(output.stderr.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn device_listing_skips_header_and_offline_devices() {
        let listing = "List of devices attached\n\
                       ABC123\tdevice\n\
                       DEF456\toffline\n\
                       GHI789\tdevice\n\n";
        assert_eq!(parse_devices(listing), ["ABC123", "GHI789"]);
    }

    #[test]
    fn empty_device_listing() {
        assert_eq!(parse_devices("List of devices attached\n\n"), [""; 0]);
    }
}
