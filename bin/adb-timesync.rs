#![forbid(unsafe_code)]

fn main() -> std::io::Result<std::process::ExitCode> {
    adb_timesync::sync_main()
}
