use std::{
    fmt::Display,
    io::ErrorKind,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::debug;

const NTP_PORT: u16 = 123;

/// SNTP messages are a fixed 48 bytes; anything shorter is unusable.
const WIRE_LENGTH: usize = 48;

/// First header byte of a request: leap indicator 0, version 3, mode 3 (client).
const REQUEST_HEADER: u8 = 0x1B;

/// Unix uses an epoch located at 1/1/1970-00:00h (UTC) and NTP uses 1/1/1900-00:00h.
/// This leads to an offset equivalent to 70 years in seconds
/// there are 17 leap years between the two dates so the offset is
const EPOCH_OFFSET: u64 = (70 * 365 + 17) * 86400;

/// A 64-bit NTP timestamp as it appears on the wire: high 32 bits are seconds
/// since the NTP epoch, low 32 bits are the binary fraction of a second.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct NtpTimestamp {
    timestamp: u64,
}

impl NtpTimestamp {
    pub(crate) const fn from_bits(bits: [u8; 8]) -> NtpTimestamp {
        NtpTimestamp {
            timestamp: u64::from_be_bytes(bits),
        }
    }

    /// Convert to a Unix-epoch instant. Timestamps that land before the Unix
    /// epoch have no `SystemTime` representation here and yield `None`.
    pub(crate) fn to_system_time(self) -> Option<SystemTime> {
        let seconds = (self.timestamp >> 32).checked_sub(EPOCH_OFFSET)?;
        let nanos = ((self.timestamp & 0x00000000FFFFFFFF) * 1_000_000_000 / (1u64 << 32)) as u32;

        Some(UNIX_EPOCH + Duration::new(seconds, nanos))
    }

    #[cfg(test)]
    pub(crate) const fn from_fixed_int(timestamp: u64) -> NtpTimestamp {
        NtpTimestamp { timestamp }
    }
}

/// An absolute UTC instant together with the server that reported it.
#[derive(Debug, Clone)]
pub struct TimeSample {
    pub time: SystemTime,
    pub server: String,
}

#[derive(Debug)]
pub enum QueryError {
    /// No reply arrived within the timeout.
    Timeout,
    /// The reply was too short or its transmit timestamp is unusable.
    Malformed,
    /// Name resolution or socket error.
    Io(std::io::Error),
}

impl std::error::Error for QueryError {}

impl Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for a reply"),
            Self::Malformed => write!(f, "received a malformed reply"),
            Self::Io(e) => write!(f, "io error during query: {e}"),
        }
    }
}

fn server_addr(server: &str) -> std::io::Result<SocketAddr> {
    // A server given as `host:port` keeps its port; otherwise port 123.
    let mut addrs = if server.contains(':') {
        server.to_socket_addrs()?
    } else {
        (server, NTP_PORT).to_socket_addrs()?
    };

    addrs.next().ok_or_else(|| {
        std::io::Error::new(ErrorKind::NotFound, format!("no address found for {server}"))
    })
}

/// Send one client request to `server` and decode the transmit timestamp of
/// the reply. Opens a transient socket per call and never retries; trying
/// other servers is the selector's job.
pub fn query(server: &str, timeout: Duration) -> Result<TimeSample, QueryError> {
    let addr = server_addr(server).map_err(QueryError::Io)?;

    let socket = match addr {
        SocketAddr::V4(_) => UdpSocket::bind(("0.0.0.0", 0)),
        SocketAddr::V6(_) => UdpSocket::bind(("::", 0)),
    }
    .map_err(QueryError::Io)?;
    socket.set_read_timeout(Some(timeout)).map_err(QueryError::Io)?;

    let mut request = [0u8; WIRE_LENGTH];
    request[0] = REQUEST_HEADER;

    debug!(server, %addr, "sending time request");
    socket.send_to(&request, addr).map_err(QueryError::Io)?;

    let mut buf = [0u8; 1024];
    let (len, _remote) = match socket.recv_from(&mut buf) {
        Ok(received) => received,
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            return Err(QueryError::Timeout)
        }
        Err(e) => return Err(QueryError::Io(e)),
    };

    if len < WIRE_LENGTH {
        return Err(QueryError::Malformed);
    }

    let transmit = NtpTimestamp::from_bits(buf[40..48].try_into().unwrap());
    let time = transmit.to_system_time().ok_or(QueryError::Malformed)?;

    debug!(server, "received time response");
    Ok(TimeSample {
        time,
        server: server.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // 0xDEADBEEF seconds since 1900 is 1526939759 seconds since 1970,
    // i.e. 2018-05-21T21:55:59Z.
    const FIXTURE_UNIX_SECONDS: u64 = 0xDEADBEEF - EPOCH_OFFSET;

    #[test]
    fn decode_exact_timestamp() {
        let transmit = NtpTimestamp::from_fixed_int(0xDEADBEEF_00000000);
        assert_eq!(FIXTURE_UNIX_SECONDS, 1526939759);
        assert_eq!(
            transmit.to_system_time().unwrap(),
            UNIX_EPOCH + Duration::from_secs(FIXTURE_UNIX_SECONDS)
        );
    }

    #[test]
    fn decode_fractional_seconds() {
        // a fraction of 0x80000000 is exactly half a second
        let transmit = NtpTimestamp::from_fixed_int(((0xDEADBEEF_u64) << 32) | 0x80000000);
        assert_eq!(
            transmit.to_system_time().unwrap(),
            UNIX_EPOCH + Duration::new(FIXTURE_UNIX_SECONDS, 500_000_000)
        );
    }

    #[test]
    fn decode_pre_unix_epoch() {
        let transmit = NtpTimestamp::from_fixed_int((EPOCH_OFFSET - 1) << 32);
        assert!(transmit.to_system_time().is_none());
    }

    #[test]
    fn query_receives_transmit_timestamp() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (len, peer) = server.recv_from(&mut buf).unwrap();
            assert_eq!(len, WIRE_LENGTH);
            assert_eq!(buf[0], REQUEST_HEADER);
            assert!(buf[1..WIRE_LENGTH].iter().all(|b| *b == 0));

            let mut reply = [0u8; WIRE_LENGTH];
            reply[40..48].copy_from_slice(&((0xDEADBEEF_u64) << 32).to_be_bytes());
            server.send_to(&reply, peer).unwrap();
        });

        let sample = query(&addr.to_string(), Duration::from_secs(5)).unwrap();
        handle.join().unwrap();

        assert_eq!(
            sample.time,
            UNIX_EPOCH + Duration::from_secs(FIXTURE_UNIX_SECONDS)
        );
        assert_eq!(sample.server, addr.to_string());
    }

    #[test]
    fn query_rejects_short_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, peer) = server.recv_from(&mut buf).unwrap();
            server.send_to(&[0u8; 20], peer).unwrap();
        });

        let result = query(&addr.to_string(), Duration::from_secs(5));
        handle.join().unwrap();

        assert!(matches!(result, Err(QueryError::Malformed)));
    }

    #[test]
    fn query_times_out_without_reply() {
        // bound but silent
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let result = query(&addr.to_string(), Duration::from_millis(100));
        assert!(matches!(result, Err(QueryError::Timeout)));
    }
}
