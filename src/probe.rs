use std::{collections::BTreeMap, fmt::Display};

use tracing::debug;

use crate::adb::{CommandOutput, RunnerError, ShellRunner};

/// Marker that proves a command ran as root. The device only hands us raw
/// text, so root detection is substring matching on `id` output.
pub const ROOT_MARKER: &str = "uid=0";

/// Well-known places a rootshell binary lives when it is not on PATH,
/// searched in order.
const ROOTSHELL_LOCATIONS: &[&str] = &[
    "/system/bin/rootshell",
    "/system/xbin/rootshell",
    "/vendor/bin/rootshell",
    "/sbin/rootshell",
];

/// Properties queried for the report. A property the device does not have is
/// simply absent from the result, not an error.
const DEVICE_PROPERTIES: &[&str] = &[
    "ro.product.manufacturer",
    "ro.product.model",
    "ro.build.version.release",
    "ro.build.version.sdk",
    "ro.serialno",
];

/// How to run a command with full privilege on the device. Exactly one method
/// is selected per probing run and that selection is final; "nothing found"
/// is `Option::None` at the use sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElevationMethod {
    Su,
    Sudo,
    /// A dedicated root broker binary; `path` is where probing found it,
    /// since it may not be on PATH.
    RootBroker {
        path: String,
    },
    /// The shell is already privileged; commands run bare.
    AlreadyRoot,
}

impl ElevationMethod {
    /// Produce the one command line that runs `command` through this method.
    pub fn wrap(&self, command: &str) -> String {
        match self {
            ElevationMethod::Su => format!("su -c \"{command}\""),
            ElevationMethod::Sudo => format!("sudo -n {command}"),
            ElevationMethod::RootBroker { path } => format!("{path} -c \"{command}\""),
            ElevationMethod::AlreadyRoot => command.to_string(),
        }
    }
}

impl Display for ElevationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElevationMethod::Su => write!(f, "su"),
            ElevationMethod::Sudo => write!(f, "sudo"),
            ElevationMethod::RootBroker { path } => write!(f, "rootshell ({path})"),
            ElevationMethod::AlreadyRoot => write!(f, "direct shell (already root)"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MechanismStatus {
    /// The mechanism exists on the device.
    pub present: bool,
    /// Invoking it actually granted root.
    pub working: bool,
}

/// Everything a probing run learned about the device. Built stage by stage;
/// callers treat it as read-only.
#[derive(Debug, Default)]
pub struct ProbeReport {
    pub method: Option<ElevationMethod>,
    pub su: MechanismStatus,
    pub sudo: MechanismStatus,
    pub broker: MechanismStatus,
    pub broker_path: Option<String>,
    /// The bare shell reported root without any elevation prefix.
    pub shell_is_root: bool,
    pub has_root: bool,
    /// The selected method could reach the `date` command. Advisory only.
    pub can_set_clock: bool,
    /// Raw value reported by `getenforce`, when available.
    pub enforcement: Option<String>,
    pub enforcing: bool,
    pub properties: BTreeMap<String, String>,
}

/// Success predicate shared by every elevation check.
fn grants_root(output: &CommandOutput) -> bool {
    output.success && output.stdout.contains(ROOT_MARKER)
}

fn on_path(runner: &impl ShellRunner, name: &str) -> Result<bool, RunnerError> {
    let output = runner.run(&format!("command -v {name}"))?;
    Ok(output.success && !output.stdout.trim().is_empty())
}

fn file_executable(runner: &impl ShellRunner, path: &str) -> Result<bool, RunnerError> {
    Ok(runner.run(&format!("test -x {path}"))?.success)
}

/// Run the full probe battery. Every stage always executes; a stage whose
/// commands fail just leaves its flags unset. The only fatal outcome is the
/// runner violating its contract.
pub fn probe(runner: &impl ShellRunner) -> Result<ProbeReport, RunnerError> {
    let mut report = ProbeReport::default();

    // stage 1: su
    report.su.present = on_path(runner, "su")?;
    if report.su.present {
        report.su.working = grants_root(&runner.run(&ElevationMethod::Su.wrap("id"))?);
    }

    // stage 2: sudo, non-interactive only
    report.sudo.present = on_path(runner, "sudo")?;
    if report.sudo.present {
        report.sudo.working = grants_root(&runner.run(&ElevationMethod::Sudo.wrap("id"))?);
    }

    // stage 3: rootshell, PATH first and then the well-known locations
    if on_path(runner, "rootshell")? {
        report.broker_path = Some("rootshell".to_string());
    } else {
        for location in ROOTSHELL_LOCATIONS {
            if file_executable(runner, location)? {
                report.broker_path = Some(location.to_string());
                break;
            }
        }
    }
    if let Some(path) = report.broker_path.clone() {
        report.broker.present = true;
        let method = ElevationMethod::RootBroker { path };
        report.broker.working = grants_root(&runner.run(&method.wrap("id"))?);
    }

    // stage 4: maybe the shell is root without any help
    report.shell_is_root = grants_root(&runner.run("id")?);

    // stage 5: selinux enforcement; affects reporting, never selection
    let enforce = runner.run("getenforce")?;
    if enforce.success && !enforce.stdout.trim().is_empty() {
        let value = enforce.stdout.trim().to_string();
        report.enforcing = value.eq_ignore_ascii_case("enforcing");
        report.enforcement = Some(value);
    }

    // stage 6: device properties
    for name in DEVICE_PROPERTIES {
        let output = runner.run(&format!("getprop {name}"))?;
        if output.success {
            let value = output.stdout.trim();
            if !value.is_empty() {
                report.properties.insert(name.to_string(), value.to_string());
            }
        }
    }

    // fixed priority: su, sudo, rootshell, then an already privileged shell
    report.method = if report.su.working {
        Some(ElevationMethod::Su)
    } else if report.sudo.working {
        Some(ElevationMethod::Sudo)
    } else if report.broker.working {
        report
            .broker_path
            .clone()
            .map(|path| ElevationMethod::RootBroker { path })
    } else if report.shell_is_root {
        Some(ElevationMethod::AlreadyRoot)
    } else {
        None
    };
    report.has_root = report.method.is_some();

    if let Some(method) = &report.method {
        debug!(%method, "checking whether the clock is reachable");
        report.can_set_clock = runner.run(&method.wrap("date --help"))?.success;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap};

    use super::*;

    struct ScriptedRunner {
        responses: HashMap<String, CommandOutput>,
        calls: RefCell<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(responses: &[(&str, CommandOutput)]) -> Self {
            ScriptedRunner {
                responses: responses
                    .iter()
                    .map(|(command, output)| (command.to_string(), output.clone()))
                    .collect(),
                calls: RefCell::new(vec![]),
            }
        }

        fn ran(&self, command: &str) -> bool {
            self.calls.borrow().iter().any(|c| c == command)
        }
    }

    impl ShellRunner for ScriptedRunner {
        fn run(&self, command_line: &str) -> Result<CommandOutput, RunnerError> {
            self.calls.borrow_mut().push(command_line.to_string());
            Ok(self
                .responses
                .get(command_line)
                .cloned()
                .unwrap_or_else(|| CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "device unreachable".to_string(),
                }))
        }
    }

    struct BrokenRunner;

    impl ShellRunner for BrokenRunner {
        fn run(&self, _command_line: &str) -> Result<CommandOutput, RunnerError> {
            Err(RunnerError("panicked instead of reporting".to_string()))
        }
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn su_wins_over_working_sudo() {
        let runner = ScriptedRunner::new(&[
            ("command -v su", ok("/system/bin/su")),
            ("su -c \"id\"", ok("uid=0(root) gid=0(root)")),
            ("command -v sudo", ok("/usr/bin/sudo")),
            ("sudo -n id", ok("uid=0(root) gid=0(root)")),
        ]);

        let report = probe(&runner).unwrap();

        assert_eq!(report.method, Some(ElevationMethod::Su));
        assert!(report.has_root);
        assert!(report.su.working);
        assert!(report.sudo.working);
        // later stages still ran even though su already worked
        assert!(runner.ran("id"));
        assert!(runner.ran("getenforce"));
        assert!(runner.ran("getprop ro.product.model"));
    }

    #[test]
    fn broker_found_through_location_fallback() {
        let runner = ScriptedRunner::new(&[
            ("test -x /system/xbin/rootshell", ok("")),
            (
                "/system/xbin/rootshell -c \"id\"",
                ok("uid=0(root) gid=0(root)"),
            ),
            ("id", ok("uid=2000(shell) gid=2000(shell)")),
            ("getenforce", ok("Enforcing\n")),
            ("getprop ro.product.model", ok("Pixel 5\n")),
            ("/system/xbin/rootshell -c \"date --help\"", ok("usage: date ...")),
        ]);

        let report = probe(&runner).unwrap();

        assert_eq!(
            report.method,
            Some(ElevationMethod::RootBroker {
                path: "/system/xbin/rootshell".to_string()
            })
        );
        assert_eq!(report.broker_path.as_deref(), Some("/system/xbin/rootshell"));
        assert!(report.broker.present);
        assert!(report.broker.working);
        assert!(!report.shell_is_root);
        assert!(report.can_set_clock);
        assert_eq!(report.enforcement.as_deref(), Some("Enforcing"));
        assert!(report.enforcing);
        assert_eq!(
            report.properties.get("ro.product.model").map(String::as_str),
            Some("Pixel 5")
        );
    }

    #[test]
    fn broker_on_path_skips_location_search() {
        let runner = ScriptedRunner::new(&[
            ("command -v rootshell", ok("/system/bin/rootshell")),
            ("rootshell -c \"id\"", ok("uid=0(root)")),
        ]);

        let report = probe(&runner).unwrap();

        assert_eq!(
            report.method,
            Some(ElevationMethod::RootBroker {
                path: "rootshell".to_string()
            })
        );
        assert!(!runner.ran("test -x /system/bin/rootshell"));
    }

    #[test]
    fn already_privileged_shell_is_the_last_resort() {
        let runner = ScriptedRunner::new(&[("id", ok("uid=0(root) gid=0(root)"))]);

        let report = probe(&runner).unwrap();

        assert_eq!(report.method, Some(ElevationMethod::AlreadyRoot));
        assert!(report.shell_is_root);
        assert!(report.has_root);
    }

    #[test]
    fn present_but_broken_mechanism_is_not_selected() {
        let runner = ScriptedRunner::new(&[
            ("command -v su", ok("/system/bin/su")),
            ("su -c \"id\"", ok("uid=2000(shell)")),
        ]);

        let report = probe(&runner).unwrap();

        assert!(report.su.present);
        assert!(!report.su.working);
        assert_eq!(report.method, None);
        assert!(!report.has_root);
    }

    #[test]
    fn unreachable_device_yields_an_empty_report() {
        let runner = ScriptedRunner::new(&[]);

        let report = probe(&runner).unwrap();

        assert_eq!(report.method, None);
        assert!(!report.has_root);
        assert!(!report.su.present);
        assert!(!report.sudo.present);
        assert!(!report.broker.present);
        assert!(!report.can_set_clock);
        assert!(report.enforcement.is_none());
        assert!(report.properties.is_empty());
    }

    #[test]
    fn runner_contract_violation_is_fatal() {
        assert!(probe(&BrokenRunner).is_err());
    }

    #[test]
    fn wrapping_commands() {
        assert_eq!(ElevationMethod::Su.wrap("id"), "su -c \"id\"");
        assert_eq!(ElevationMethod::Sudo.wrap("id"), "sudo -n id");
        assert_eq!(
            ElevationMethod::RootBroker {
                path: "/sbin/rootshell".to_string()
            }
            .wrap("id"),
            "/sbin/rootshell -c \"id\""
        );
        assert_eq!(ElevationMethod::AlreadyRoot.wrap("id"), "id");
    }
}
