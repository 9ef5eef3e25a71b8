//! Logging infrastructure for bridgestrap.
//!
//! Sets up the tracing subscriber with output to stderr or a log file. By
//! default every log line passes through a scrubber that replaces IP
//! addresses with `[scrubbed]`, so that logs never record which bridges
//! clients asked about. The `--unsafe` flag disables scrubbing.
//!
//! The `RUST_LOG` environment variable overrides the default `info` filter.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;
use std::sync::Mutex;

use regex::Regex;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Replacement for scrubbed addresses, matching what snowflake's safelog
/// produces.
const SCRUBBED: &str = "[scrubbed]";

// IPv4 dotted quads. Ports are left alone; the address is the sensitive part.
static IPV4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").unwrap()
});

// IPv6 addresses need at least three colons before we scrub, so that log
// timestamps like 12:34:56 survive. Bracketed forms with :: are caught by the
// second alternative.
static IPV6_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9a-fA-F]{1,4}:){3,7}[0-9a-fA-F]{0,4}|\[[0-9a-fA-F:]*::[0-9a-fA-F:]*\]")
        .unwrap()
});

/// Replaces IP addresses in the given text with `[scrubbed]`.
pub fn scrub(text: &str) -> String {
    let text = IPV4_RE.replace_all(text, SCRUBBED);
    IPV6_RE.replace_all(&text, SCRUBBED).into_owned()
}

/// A `Write` adapter that scrubs IP addresses before forwarding to the
/// underlying writer.
pub struct ScrubWriter<W: Write> {
    inner: W,
}

impl<W: Write> ScrubWriter<W> {
    /// Wraps the given writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for ScrubWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let scrubbed = scrub(&String::from_utf8_lossy(buf));
        self.inner.write_all(scrubbed.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Initialises the tracing subscriber.
///
/// Logs go to stderr unless `log_file` is given, in which case they are
/// appended to that file. Unless `unsafe_logging` is set, all output passes
/// through [`scrub`].
pub fn init(log_file: Option<&Path>, unsafe_logging: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match (log_file, unsafe_logging) {
        (None, true) => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        (None, false) => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(|| ScrubWriter::new(std::io::stderr()))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        (Some(path), unsafe_logging) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            if unsafe_logging {
                let subscriber = tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .finish();
                tracing::subscriber::set_global_default(subscriber)
                    .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
            } else {
                let subscriber = tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(ScrubWriter::new(file)))
                    .finish();
                tracing::subscriber::set_global_default(subscriber)
                    .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_ipv4() {
        assert_eq!(
            scrub("connection from 203.0.113.5 refused"),
            "connection from [scrubbed] refused"
        );
    }

    #[test]
    fn test_scrub_ipv4_with_port() {
        assert_eq!(scrub("bridge 1.2.3.4:443 works"), "bridge [scrubbed]:443 works");
    }

    #[test]
    fn test_scrub_ipv6() {
        assert_eq!(
            scrub("bridge [2001:db8::1]:443 works"),
            "bridge [scrubbed]:443 works"
        );
        assert_eq!(
            scrub("addr 2001:db8:1:2:3:4:5:6 seen"),
            "addr [scrubbed] seen"
        );
    }

    #[test]
    fn test_scrub_keeps_timestamps() {
        assert_eq!(
            scrub("2024-01-01T12:34:56Z something happened"),
            "2024-01-01T12:34:56Z something happened"
        );
    }

    #[test]
    fn test_scrub_writer() {
        let mut buf = Vec::new();
        {
            let mut w = ScrubWriter::new(&mut buf);
            w.write_all(b"saw 10.0.0.1 today").unwrap();
        }
        assert_eq!(String::from_utf8(buf).unwrap(), "saw [scrubbed] today");
    }
}
