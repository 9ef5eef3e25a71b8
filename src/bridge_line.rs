//! Bridge-line lexing.
//!
//! A bridge line is free-form text of the shape
//! `[transport] addr:port [fingerprint] [key=value ...]`, for example:
//!
//! ```text
//! obfs4 1.2.3.4:1234 0123456789ABCDEF0123456789ABCDEF01234567 cert=... iat-mode=0
//! ```
//!
//! This module does not validate bridge lines. It only extracts the two
//! identifiers the rest of bridgestrap needs: the `addr:port` tuple that keys
//! the result cache, and the identity (fingerprint if present, `addr:port`
//! otherwise) that the event state machine matches ORCONN events against.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// The number of hex digits in a bridge's fingerprint, e.g.:
/// 0123456789ABCDEF0123456789ABCDEF01234567
pub const BRIDGE_FINGERPRINT_LEN: usize = 40;

// Captures the address:port part of a bridge line, for both IPv4 and IPv6
// addresses.
static ADDR_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9a-z\[\]\.:]+:[0-9]{1,5}").unwrap());

static FINGERPRINT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-F0-9]{40}").unwrap());

/// Extracts the bridge's `addr:port` from the given bridge line.
pub fn addr_port(bridge_line: &str) -> Result<String> {
    match ADDR_PORT_RE.find(bridge_line) {
        Some(m) => Ok(m.as_str().to_string()),
        None => Err(Error::Parse(
            "could not extract addr:port from bridge line".to_string(),
        )),
    }
}

/// Extracts the bridge's fingerprint from the given line, if there is one.
///
/// Also used on ORCONN and NEWDESC event lines, which carry fingerprints in
/// the same 40-digit upper-hex form.
pub fn fingerprint(line: &str) -> Option<String> {
    FINGERPRINT_RE
        .find(line)
        .map(|m| m.as_str().to_string())
}

/// Returns the identifier that tor uses to refer to the given bridge in
/// ORCONN events: `$FINGERPRINT` if the line carries a fingerprint, and the
/// bridge's `addr:port` otherwise.
pub fn identity(bridge_line: &str) -> Result<String> {
    match fingerprint(bridge_line) {
        Some(fp) => Ok(format!("${}", fp)),
        None => addr_port(bridge_line),
    }
}

/// Returns a hashed identifier for the given bridge that is safe to publish:
/// the hex SHA-256 of the SHA-256 of the bridge's identity.
pub fn hashed_identifier(bridge_line: &str) -> Result<String> {
    let ident = identity(bridge_line)?;
    let inner = Sha256::digest(ident.as_bytes());
    let outer = Sha256::digest(inner);
    Ok(format!("{:x}", outer))
}
