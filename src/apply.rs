use std::{fmt::Display, time::Duration};

use chrono::{DateTime, Local, NaiveDateTime};
use tracing::{info, warn};

use crate::{
    adb::{CommandOutput, RunnerError, ShellRunner},
    probe::ElevationMethod,
    sntp::TimeSample,
    source::{self, ResolveError},
};

/// Positional field string `date -s` expects: month, day, hour, minute, year,
/// then a literal `.` and the seconds. The exact order and separator matter
/// to the device.
const DATE_SET_FORMAT: &str = "%m%d%H%M%Y.%S";

#[derive(Debug)]
pub enum ApplyError {
    Runner(RunnerError),
    CommandFailed { stdout: String, stderr: String },
}

impl std::error::Error for ApplyError {}

impl Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runner(e) => write!(f, "{e}"),
            Self::CommandFailed { stdout, stderr } => {
                write!(f, "setting the clock failed: {}", stderr.trim())?;
                if !stdout.trim().is_empty() {
                    write!(f, " (command output: {})", stdout.trim())?;
                }
                Ok(())
            }
        }
    }
}

impl From<RunnerError> for ApplyError {
    fn from(value: RunnerError) -> Self {
        Self::Runner(value)
    }
}

fn build_set_command(local: NaiveDateTime, method: &ElevationMethod) -> String {
    method.wrap(&format!("date -s {}", local.format(DATE_SET_FORMAT)))
}

/// The exact command line that would set the device clock to `sample`.
///
/// The sample is converted to the local civil time of this process, not of
/// the device; when the two run in different timezones the device ends up
/// with this host's wall clock.
pub fn set_command(sample: &TimeSample, method: &ElevationMethod) -> String {
    build_set_command(DateTime::<Local>::from(sample.time).naive_local(), method)
}

/// Set the device clock: one command, one execution, no retry.
pub fn apply(
    sample: &TimeSample,
    method: &ElevationMethod,
    runner: &impl ShellRunner,
) -> Result<CommandOutput, ApplyError> {
    let command = set_command(sample, method);
    info!(%method, command, "setting device clock");

    let output = runner.run(&command)?;
    if output.success {
        Ok(output)
    } else {
        Err(ApplyError::CommandFailed {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    InTolerance {
        elapsed: Duration,
    },
    OutsideTolerance {
        elapsed: Duration,
        tolerance: Duration,
    },
    /// No reference time could be fetched; nothing to compare against.
    ReferenceUnavailable,
}

fn tolerance_outcome(
    original: &TimeSample,
    fresh: &TimeSample,
    tolerance: Duration,
) -> VerifyOutcome {
    let elapsed = fresh
        .time
        .duration_since(original.time)
        .unwrap_or_default();

    if elapsed <= tolerance {
        VerifyOutcome::InTolerance { elapsed }
    } else {
        VerifyOutcome::OutsideTolerance { elapsed, tolerance }
    }
}

/// Cross-check after an apply. Reads the device clock back for the log,
/// re-resolves a reference time, and compares the elapsed wall-clock delay
/// since `original` was fetched against `tolerance`. Always advisory: every
/// outcome is a pass or a warning, never a failure of the run.
pub fn verify(
    original: &TimeSample,
    runner: &impl ShellRunner,
    servers: &[String],
    per_server_timeout: Duration,
    tolerance: Duration,
) -> Result<VerifyOutcome, RunnerError> {
    // Reported verbatim; the device's date string is not parsed back.
    let device = runner.run("date")?;
    if device.success {
        info!(device_time = device.stdout.trim(), "device reports time");
    } else {
        warn!(stderr = device.stderr.trim(), "could not read device time");
    }

    let fresh = match source::resolve_time(servers, per_server_timeout) {
        Ok(sample) => sample,
        Err(e @ ResolveError::AllServersFailed { .. }) => {
            warn!(error = %e, "verification reference unavailable");
            return Ok(VerifyOutcome::ReferenceUnavailable);
        }
    };

    Ok(tolerance_outcome(original, &fresh, tolerance))
}
