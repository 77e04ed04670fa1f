use std::{
    io::IsTerminal,
    path::PathBuf,
    process::ExitCode,
    str::FromStr,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing_subscriber::util::SubscriberInitExt;

use crate::{
    adb::AdbShell,
    apply::{self, VerifyOutcome},
    config::{CliArg, Config},
    probe::{self, ProbeReport},
    source,
    tracing::LogLevel,
};

const USAGE_MSG: &str = "\
usage: adb-timesync sync [-s SERVER] [-d SERIAL] [--verify] [-c PATH]
       adb-timesync probe [-d SERIAL] [-c PATH]
       adb-timesync -h | adb-timesync -v";

const DESCRIPTOR: &str = "adb-timesync - set an adb device's clock from ntp";

const HELP_MSG: &str = "Options:
  -c, --config=PATH                    which configuration file to read
  -l, --log-level=LOG_LEVEL            change the log level
  -s, --server=SERVER                  query a single server instead of the default list
  -d, --device=SERIAL                  which device to target when several are connected
  -t, --timeout=SECONDS                per-server query timeout
      --verify                         cross-check the device clock after setting it
  -h, --help                           display this help text
  -v, --version                        display version information";

pub fn long_help_message() -> String {
    format!("{DESCRIPTOR}\n\n{USAGE_MSG}\n\n{HELP_MSG}")
}

#[derive(Debug, Default, PartialEq, Eq)]
pub enum TimesyncAction {
    #[default]
    Help,
    Version,
    Sync,
    Probe,
}

#[derive(Debug, Default)]
pub(crate) struct TimesyncOptions {
    config: Option<PathBuf>,
    log_level: Option<LogLevel>,
    server: Option<String>,
    device: Option<String>,
    timeout: Option<u64>,
    verify: bool,
    help: bool,
    version: bool,
    sync: bool,
    probe: bool,
    action: TimesyncAction,
}

impl TimesyncOptions {
    const TAKES_ARGUMENT: &'static [&'static str] =
        &["--config", "--log-level", "--server", "--device", "--timeout"];
    const TAKES_ARGUMENT_SHORT: &'static [char] = &['c', 'l', 's', 'd', 't'];

    /// parse an iterator over command line arguments
    pub fn try_parse_from<I, T>(iter: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str> + Clone,
    {
        let mut options = TimesyncOptions::default();

        let it = iter.into_iter().map(|x| x.as_ref().to_string());

        let arg_iter =
            CliArg::normalize_arguments(Self::TAKES_ARGUMENT, Self::TAKES_ARGUMENT_SHORT, it)?
                .into_iter()
                .peekable();

        for arg in arg_iter {
            match arg {
                CliArg::Flag(flag) => match flag.as_str() {
                    "-h" | "--help" => {
                        options.help = true;
                    }
                    "-v" | "--version" => {
                        options.version = true;
                    }
                    "--verify" => {
                        options.verify = true;
                    }
                    option => {
                        Err(format!("invalid option provided: {option}"))?;
                    }
                },
                CliArg::Argument(option, value) => match option.as_str() {
                    "-c" | "--config" => {
                        options.config = Some(PathBuf::from(value));
                    }
                    "-l" | "--log-level" => match LogLevel::from_str(&value) {
                        Ok(level) => options.log_level = Some(level),
                        Err(_) => return Err("invalid log level".into()),
                    },
                    "-s" | "--server" => {
                        options.server = Some(value);
                    }
                    "-d" | "--device" => {
                        options.device = Some(value);
                    }
                    "-t" | "--timeout" => match value.parse() {
                        Ok(timeout) => options.timeout = Some(timeout),
                        Err(_) => return Err(format!("invalid timeout: {value}")),
                    },
                    option => {
                        Err(format!("invalid option provided: {option}"))?;
                    }
                },
                CliArg::Rest(rest) => {
                    if rest.len() > 1 {
                        eprintln!("Warning: Too many commands provided.")
                    }
                    for command in rest {
                        match command.as_str() {
                            "sync" => {
                                options.sync = true;
                            }
                            "probe" => {
                                options.probe = true;
                            }
                            unknown => {
                                eprintln!("Warning: Unknown command {unknown}");
                            }
                        }
                    }
                }
            }
        }

        options.resolve_action();

        Ok(options)
    }

    /// from the arguments resolve which action should be performed
    fn resolve_action(&mut self) {
        if self.help {
            self.action = TimesyncAction::Help;
        } else if self.version {
            self.action = TimesyncAction::Version;
        } else if self.sync {
            self.action = TimesyncAction::Sync;
        } else if self.probe {
            self.action = TimesyncAction::Probe;
        } else {
            self.action = TimesyncAction::Help;
        }
    }
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn main() -> std::io::Result<ExitCode> {
    let options = match TimesyncOptions::try_parse_from(std::env::args()) {
        Ok(options) => options,
        Err(msg) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, msg)),
    };

    match options.action {
        TimesyncAction::Help => {
            println!("{}", long_help_message());
            Ok(ExitCode::SUCCESS)
        }
        TimesyncAction::Version => {
            eprintln!("adb-timesync {VERSION}");
            Ok(ExitCode::SUCCESS)
        }
        TimesyncAction::Sync => Ok(run_sync(options)),
        TimesyncAction::Probe => Ok(run_probe(options)),
    }
}

fn initialize_logging_parse_config(options: &TimesyncOptions) -> Config {
    let config = match Config::from_args(options.config.as_ref(), options.server.clone()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Unable to load configuration file: {e}");
            Config::default()
        }
    };

    let log_level = options
        .log_level
        .or(config.observability.log_level)
        .unwrap_or_default();
    crate::tracing::tracing_init(log_level, std::io::stderr().is_terminal()).init();

    config
}

/// Pick the device to talk to: an explicit serial wins, otherwise the first
/// connected device, warning when there is a choice.
fn select_device(explicit: Option<String>, command_timeout: Duration) -> Result<String, String> {
    if let Some(serial) = explicit {
        return Ok(serial);
    }

    let devices = AdbShell::new(None, command_timeout)
        .devices()
        .map_err(|e| format!("could not list adb devices: {e}"))?;

    match devices.as_slice() {
        [] => Err("no adb devices found, connect a device and try again".to_string()),
        [serial] => Ok(serial.clone()),
        [serial, ..] => {
            println!(
                "Multiple devices connected ({}), using {serial}. Pass --device to pick one.",
                devices.join(", ")
            );
            Ok(serial.clone())
        }
    }
}

fn connect(options: &TimesyncOptions, config: &Config) -> Result<AdbShell, String> {
    let command_timeout = Duration::from_secs(config.adb.command_timeout);
    let explicit = options.device.clone().or_else(|| config.adb.device.clone());
    let serial = select_device(explicit, command_timeout)?;

    Ok(AdbShell::new(Some(serial), command_timeout))
}

fn run_sync(options: TimesyncOptions) -> ExitCode {
    let config = initialize_logging_parse_config(&options);
    config.check();

    let query_timeout =
        Duration::from_secs(options.timeout.unwrap_or(config.sntp.query_timeout));

    let shell = match connect(&options, &config) {
        Ok(shell) => shell,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("Determining current time...");
    let sample = match source::resolve_time(&config.sntp.servers, query_timeout) {
        Ok(sample) => sample,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!(
        "Got {} from {}",
        DateTime::<Utc>::from(sample.time).format("%Y-%m-%d %H:%M:%S UTC"),
        sample.server
    );

    println!("Probing device for a way to run privileged commands...");
    let report = match probe::probe(&shell) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let Some(method) = report.method.clone() else {
        eprintln!("Error: no working way to run privileged commands was found on the device");
        return ExitCode::FAILURE;
    };
    println!("Using {method}");

    if report.enforcing {
        println!("Note: selinux is enforcing; the device may still reject the clock change.");
    }
    if !report.can_set_clock {
        println!("Note: could not confirm that {method} reaches the date command.");
    }

    match apply::apply(&sample, &method, &shell) {
        Ok(output) => {
            println!("Device clock set.");
            if !output.stdout.trim().is_empty() {
                println!("{}", output.stdout.trim());
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    }

    if options.verify || config.apply.verify {
        println!("Verifying...");
        let tolerance = Duration::from_secs(config.apply.verify_tolerance);
        match apply::verify(
            &sample,
            &shell,
            &config.sntp.servers,
            query_timeout,
            tolerance,
        ) {
            Ok(VerifyOutcome::InTolerance { elapsed }) => {
                println!(
                    "Verification passed ({:.1}s since the reference was fetched).",
                    elapsed.as_secs_f64()
                );
            }
            Ok(VerifyOutcome::OutsideTolerance { elapsed, tolerance }) => {
                println!(
                    "Warning: {:.1}s passed since the reference was fetched (tolerance {}s); the device clock may be off.",
                    elapsed.as_secs_f64(),
                    tolerance.as_secs()
                );
            }
            Ok(VerifyOutcome::ReferenceUnavailable) => {
                println!("Warning: could not fetch a reference time to verify against.");
            }
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    println!("Done.");
    ExitCode::SUCCESS
}

fn run_probe(options: TimesyncOptions) -> ExitCode {
    let config = initialize_logging_parse_config(&options);

    let shell = match connect(&options, &config) {
        Ok(shell) => shell,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match probe::probe(&shell) {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_report(report: &ProbeReport) {
    println!("Privilege report:");
    match &report.method {
        Some(method) => println!("Selected method: {method}"),
        None => println!("Selected method: none (no working elevation found)"),
    }
    println!(
        "su: present {}, working {}",
        report.su.present, report.su.working
    );
    println!(
        "sudo: present {}, working {}",
        report.sudo.present, report.sudo.working
    );
    println!(
        "rootshell: present {}, working {}{}",
        report.broker.present,
        report.broker.working,
        report
            .broker_path
            .as_deref()
            .map(|path| format!(" (at {path})"))
            .unwrap_or_default()
    );
    println!("Shell already root: {}", report.shell_is_root);
    println!("Full privilege available: {}", report.has_root);
    println!("Clock modification plausible: {}", report.can_set_clock);
    println!(
        "SELinux: {}",
        report.enforcement.as_deref().unwrap_or("unknown")
    );
    println!();
    println!("Device properties:");
    if report.properties.is_empty() {
        println!("(none reported)");
    }
    for (name, value) in &report.properties {
        println!("{name}: {value}");
    }
}
