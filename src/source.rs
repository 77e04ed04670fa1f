use std::{fmt::Display, time::Duration};

use tracing::{debug, warn};

use crate::sntp::{self, QueryError, TimeSample};

/// Default candidate servers, tried strictly in this order.
pub const DEFAULT_SERVERS: &[&str] = &[
    "time.google.com",
    "time.windows.com",
    "pool.ntp.org",
    "time.nist.gov",
    "time.apple.com",
];

#[derive(Debug)]
pub enum ResolveError {
    AllServersFailed { attempted: Vec<String> },
}

impl std::error::Error for ResolveError {}

impl Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllServersFailed { attempted } => {
                write!(
                    f,
                    "could not get the time from any server (tried {})",
                    attempted.join(", ")
                )
            }
        }
    }
}

/// Query the candidates in order and return the first sample obtained. Every
/// kind of per-server failure just advances to the next candidate; no
/// candidate is retried.
pub fn resolve_time(
    servers: &[String],
    per_server_timeout: Duration,
) -> Result<TimeSample, ResolveError> {
    resolve_time_with(sntp::query, servers, per_server_timeout)
}

fn resolve_time_with<F>(
    mut query: F,
    servers: &[String],
    per_server_timeout: Duration,
) -> Result<TimeSample, ResolveError>
where
    F: FnMut(&str, Duration) -> Result<TimeSample, QueryError>,
{
    for server in servers {
        debug!(server = server.as_str(), "querying time server");
        match query(server, per_server_timeout) {
            Ok(sample) => {
                debug!(server = server.as_str(), "time server answered");
                return Ok(sample);
            }
            Err(e) => {
                warn!(server = server.as_str(), error = %e, "time server failed");
            }
        }
    }

    Err(ResolveError::AllServersFailed {
        attempted: servers.to_vec(),
    })
}
