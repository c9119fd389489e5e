// Server configuration: the payload, retry and timeout settings, and the transfer port range.
// Validated once before anything is served.

use crate::tftp::MAX_PAYLOAD_LEN;
use std::error;
use std::fmt;
use std::io;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_RETRIES: u8 = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6);

/// Server configuration as supplied by the caller. Unset fields fall back to defaults when the
/// configuration is validated.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Bytes returned for every read request, whatever file name was asked for.
    pub payload: Option<Arc<[u8]>>,

    /// How many times each block is written before the transfer is abandoned.
    pub retries: Option<u8>,

    /// How long to wait for an acknowledgment after each write.
    pub timeout: Option<Duration>,

    /// Local ports transfer sockets are picked from. The OS chooses when unset.
    pub transfer_ports: Option<RangeInclusive<u16>>,
}

/// Validated settings shared by every transfer.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub payload: Arc<[u8]>,
    pub retries: u8,
    pub timeout: Duration,
    pub transfer_ports: Option<RangeInclusive<u16>>,
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    MissingPayload,
    EmptyPayload,
    PayloadTooLarge(usize),
    InvalidRetries,
    InvalidTimeout,
    InvalidPortRange(u16, u16),
}

impl error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MissingPayload => write!(f, "payload is required"),
            Self::EmptyPayload => write!(f, "payload is empty"),
            Self::PayloadTooLarge(len) => write!(
                f,
                "payload of {len} bytes would overflow the block counter (max {MAX_PAYLOAD_LEN} bytes)"
            ),
            Self::InvalidRetries => write!(f, "retries must be positive"),
            Self::InvalidTimeout => write!(f, "timeout must be positive"),
            Self::InvalidPortRange(low, high) => write!(f, "invalid transfer port range {low}-{high}"),
        }
    }
}

impl ServerConfig {
    pub fn with_payload(payload: impl Into<Arc<[u8]>>) -> ServerConfig {
        ServerConfig { payload: Some(payload.into()), ..Default::default() }
    }

    /// Checks the configuration once, before anything is served, and fills in defaults.
    pub fn validate(self) -> Result<TransferSettings, ConfigError> {
        let payload = self.payload.ok_or(ConfigError::MissingPayload)?;
        if payload.is_empty() {
            return Err(ConfigError::EmptyPayload);
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ConfigError::PayloadTooLarge(payload.len()));
        }

        let retries = match self.retries {
            None => DEFAULT_RETRIES,
            Some(0) => return Err(ConfigError::InvalidRetries),
            Some(n) => n,
        };

        let timeout = match self.timeout {
            None => DEFAULT_TIMEOUT,
            Some(t) if t.is_zero() => return Err(ConfigError::InvalidTimeout),
            Some(t) => t,
        };

        if let Some(range) = &self.transfer_ports {
            if range.is_empty() || *range.start() == 0 {
                return Err(ConfigError::InvalidPortRange(*range.start(), *range.end()));
            }
        }

        Ok(TransferSettings { payload, retries, timeout, transfer_ports: self.transfer_ports })
    }
}

/// Reads the file served to every client.
pub fn load_payload(path: &Path) -> Result<Arc<[u8]>, io::Error> {
    Ok(std::fs::read(path)?.into())
}

/// Parses a `LOW-HIGH` port range.
pub fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, String> {
    let (low, high) = s
        .split_once('-')
        .ok_or_else(|| format!("expected LOW-HIGH, got '{s}'"))?;
    let low: u16 = low.trim().parse().map_err(|e| format!("bad low port '{low}': {e}"))?;
    let high: u16 = high.trim().parse().map_err(|e| format!("bad high port '{high}': {e}"))?;
    Ok(low..=high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempdir::TempDir;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_applied() {
        let settings = assert_ok!(ServerConfig::with_payload(vec![1u8, 2, 3]).validate());
        assert_eq!(&settings.payload[..], &[1, 2, 3]);
        assert_eq!(settings.retries, DEFAULT_RETRIES);
        assert_eq!(settings.timeout, Duration::from_secs(6));
        assert!(settings.transfer_ports.is_none());
    }

    #[test]
    fn test_explicit_values_kept() {
        let config = ServerConfig {
            retries: Some(3),
            timeout: Some(Duration::from_millis(50)),
            transfer_ports: Some(40000..=40010),
            ..ServerConfig::with_payload(vec![0u8; 1000])
        };
        let settings = assert_ok!(config.validate());
        assert_eq!(settings.retries, 3);
        assert_eq!(settings.timeout, Duration::from_millis(50));
        assert_eq!(settings.transfer_ports, Some(40000..=40010));
    }

    #[test]
    fn test_invalid_configs() {
        assert_eq!(assert_err!(ServerConfig::default().validate()), ConfigError::MissingPayload);
        assert_eq!(
            assert_err!(ServerConfig::with_payload(Vec::<u8>::new()).validate()),
            ConfigError::EmptyPayload
        );
        assert_eq!(
            assert_err!(ServerConfig { retries: Some(0), ..ServerConfig::with_payload(vec![1u8]) }.validate()),
            ConfigError::InvalidRetries
        );
        assert_eq!(
            assert_err!(
                ServerConfig { timeout: Some(Duration::ZERO), ..ServerConfig::with_payload(vec![1u8]) }.validate()
            ),
            ConfigError::InvalidTimeout
        );
        let backwards = RangeInclusive::new(5000, 4000);
        assert_eq!(
            assert_err!(
                ServerConfig { transfer_ports: Some(backwards), ..ServerConfig::with_payload(vec![1u8]) }.validate()
            ),
            ConfigError::InvalidPortRange(5000, 4000)
        );
    }

    #[test]
    fn test_payload_size_limit() {
        assert_ok!(ServerConfig::with_payload(vec![0u8; MAX_PAYLOAD_LEN]).validate());
        assert_eq!(
            assert_err!(ServerConfig::with_payload(vec![0u8; MAX_PAYLOAD_LEN + 1]).validate()),
            ConfigError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1)
        );
    }

    #[test]
    fn test_load_payload() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("payload.svg");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"<svg/>").unwrap();

        let payload = assert_ok!(load_payload(&path));
        assert_eq!(&payload[..], b"<svg/>");

        let missing = assert_err!(load_payload(&tmpdir.path().join("missing.svg")));
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("40000-40100"), Ok(40000..=40100));
        assert!(parse_port_range("40000").is_err());
        assert!(parse_port_range("a-b").is_err());
        assert!(parse_port_range("1-70000").is_err());
    }
}
