//! Parsing of asynchronous tor controller events.
//!
//! Testing a bridge means asking tor to connect to it and watching what
//! happens on the control port. Two event types matter:
//!
//! - `ORCONN` announces state changes of outgoing OR connections:
//!
//!   ```text
//!   650 ORCONN 90.41.70.32:7434 LAUNCHED ID=75
//!   650 ORCONN $D9A82D2F9C2F65A18407B1D2B764F130847F8B5D LAUNCHED ID=38
//!   650 ORCONN 128.31.0.33:9101 FAILED REASON=TIMEOUT NCIRCS=1 ID=1836
//!   650 ORCONN $D9A82D2F9C2F65A18407B1D2B764F130847F8B5D~dragon CONNECTED ID=42
//!   ```
//!
//! - `NEWDESC` announces that tor obtained a relay's descriptor, which is the
//!   definitive signal that the relay is usable:
//!
//!   ```text
//!   650 NEWDESC $CDF2E852BF539B82BD10E27E9115A31734E378C2~Lisbeth
//!   ```
//!
//! [`TorEventState`] is a per-bridge state machine that consumes these lines
//! and settles on [`BridgeState::Success`] or [`BridgeState::Failure`]. All
//! bridges of a batch share the control connection, so each machine has to
//! pick its own events out of the interleaved stream: it remembers the
//! connection IDs of ORCONNs launched towards its bridge and ignores
//! everything else.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::bridge_line::{self, BRIDGE_FINGERPRINT_LEN};

static ORCONN_EVENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^650 ORCONN").unwrap());

static ORCONN_FIELDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ORCONN ([^ ]*) ([^ ]*).*ID=([0-9]*)").unwrap());

static ORCONN_REASON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^650 ORCONN.*REASON=([A-Z]*)").unwrap());

static NEWDESC_EVENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^650 NEWDESC").unwrap());

/// The test outcome for a single bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No verdict yet.
    Pending,
    /// Tor obtained the bridge's descriptor.
    Success,
    /// An OR connection to the bridge failed.
    Failure,
}

/// Maps an ORCONN FAILED reason code to a human-readable description.
///
/// The codes and descriptions are taken verbatim from tor's control
/// specification. Returns `None` for codes the specification does not list.
fn failure_desc(reason: &str) -> Option<&'static str> {
    match reason {
        "DONE" => Some("The OR connection has shut down cleanly."),
        "CONNECTREFUSED" => Some("We got an ECONNREFUSED while connecting to the target OR."),
        "IDENTITY" => Some(
            "We connected to the OR, but found that its identity was not what we expected.",
        ),
        "CONNECTRESET" => {
            Some("We got an ECONNRESET or similar IO error from the connection with the OR.")
        }
        "TIMEOUT" => Some(
            "We got an ETIMEOUT or similar IO error from the connection with the OR, or we're \
             closing the connection for being idle for too long.",
        ),
        "NOROUTE" => Some(
            "We got an ENOTCONN, ENETUNREACH, ENETDOWN, EHOSTUNREACH, or similar error while \
             connecting to the OR.",
        ),
        "IOERROR" => Some("We got some other IO error on our connection to the OR."),
        "RESOURCELIMIT" => Some(
            "We don't have enough operating system resources (file descriptors, buffers, etc) \
             to connect to the OR.",
        ),
        "PT_MISSING" => Some("No pluggable transport was available."),
        "MISC" => Some("The OR connection closed for some other reason."),
        _ => None,
    }
}

/// Extracts the REASON field of an ORCONN line and maps it to its
/// description, or `None` if the line has no recognisable reason.
fn orconn_failure_desc(line: &str) -> Option<&'static str> {
    let caps = ORCONN_REASON_RE.captures(line)?;
    failure_desc(caps.get(1)?.as_str())
}

/// Determines the number of characters to compare when matching an ORCONN
/// LAUNCHED target against a bridge identifier.
///
/// LAUNCHED events may refer to the same bridge either by `addr:port` or by
/// `$fingerprint`, and may append `~nickname` to the fingerprint. Capping the
/// comparison at `$` plus forty hex digits handles both flavours without
/// conflating distinct bridges.
fn match_length(target1: &str, target2: &str) -> usize {
    target1
        .len()
        .min(target2.len())
        .min(BRIDGE_FINGERPRINT_LEN + 1)
}

/// A state machine that parses ORCONN and NEWDESC events for one bridge.
#[derive(Debug)]
pub struct TorEventState {
    /// IDs of OR connections that tor launched towards our bridge.
    conn_ids: HashSet<u64>,
    /// Where the test stands.
    pub state: BridgeState,
    /// Human-readable failure description, empty unless state is Failure.
    pub reason: String,
    /// The bridge's fingerprint, learned from a CONNECTED event.
    fingerprint: String,
    /// The identifier tor uses for our bridge: `$fingerprint` if the bridge
    /// line has one, `addr:port` otherwise.
    target: String,
    /// Random tag that prefixes this test's log messages.
    test_id: u32,
}

impl TorEventState {
    /// Creates a new state machine for the bridge known as `target`.
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        let test_id: u32 = rand::random();
        debug!(
            "{:x}: Creating new event parser with {} bridge identifier.",
            test_id, target
        );
        Self {
            conn_ids: HashSet::new(),
            state: BridgeState::Pending,
            reason: String::new(),
            fingerprint: String::new(),
            target,
            test_id,
        }
    }

    /// Feeds a controller event line into the state machine.
    ///
    /// Safe to call with arbitrary input; lines that don't parse are logged
    /// and ignored. Once the machine reached Success or Failure, further
    /// events have no effect.
    pub fn feed(&mut self, line: &str) {
        if self.state != BridgeState::Pending {
            return;
        }

        if ORCONN_EVENT_RE.is_match(line) {
            self.process_orconn_line(line);
        } else if NEWDESC_EVENT_RE.is_match(line) {
            self.process_newdesc_line(line);
        } else {
            warn!("{:x}: Bug: Received an unexpected event {:?}.", self.test_id, line);
        }
    }

    fn process_orconn_line(&mut self, line: &str) {
        let Some(caps) = ORCONN_FIELDS_RE.captures(line) else {
            warn!(
                "{:x}: Bug: Unexpected number of substring matches in {:?}",
                self.test_id, line
            );
            return;
        };
        let target = &caps[1];
        let event_type = &caps[2];
        let conn_id: u64 = match caps[3].parse() {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    "{:x}: Bug: Could not convert {:?} to integer: {}",
                    self.test_id, &caps[3], e
                );
                return;
            }
        };

        // A new OR connection for our bridge? Remember its ID so we can keep
        // track of it.
        if event_type == "LAUNCHED" {
            let len = match_length(target, &self.target);
            if target.as_bytes().get(..len) == self.target.as_bytes().get(..len) {
                debug!("{:x}: Adding ID {} to map.", self.test_id, conn_id);
                self.conn_ids.insert(conn_id);
            }
        }

        // An OR connection for a bridge that isn't ours.
        if !self.conn_ids.contains(&conn_id) {
            return;
        }

        match event_type {
            "FAILED" => {
                debug!("{:x}: Setting ORCONN failure.", self.test_id);
                self.state = BridgeState::Failure;
                match orconn_failure_desc(line) {
                    Some(desc) => {
                        debug!("{:x}: ORCONN failed because: {}", self.test_id, desc);
                        self.reason = desc.to_string();
                    }
                    None => {
                        warn!(
                            "{:x}: Bug: Could not map failure reason in {:?}.",
                            self.test_id, line
                        );
                        self.reason.clear();
                    }
                }
            }
            "CONNECTED" => {
                match bridge_line::fingerprint(line) {
                    Some(fp) => {
                        debug!("{:x}: Setting fingerprint to {}.", self.test_id, fp);
                        self.fingerprint = fp;
                    }
                    None => {
                        debug!(
                            "{:x}: ORCONN success without a fingerprint. One step closer to \
                             NEWDESC.",
                            self.test_id
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn process_newdesc_line(&mut self, line: &str) {
        let Some(fp) = bridge_line::fingerprint(line) else {
            warn!(
                "{:x}: Bug: Could not extract fingerprint from {:?}.",
                self.test_id, line
            );
            return;
        };

        // Is the NEWDESC event ours? The fingerprint either matches the one
        // we learned from a CONNECTED event or, if the bridge line itself
        // carried a fingerprint, our own identifier.
        if fp == self.fingerprint || Some(fp.as_str()) == self.target.strip_prefix('$') {
            debug!("{:x}: Received NEWDESC event for our bridge.", self.test_id);
            self.state = BridgeState::Success;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_bridge_test() {
        let mut state = TorEventState::new("146.57.248.225:22");
        state.feed("650 ORCONN 146.57.248.225:22 LAUNCHED ID=69");
        assert_eq!(state.state, BridgeState::Pending);
        state.feed("650 ORCONN $10A6CD36A537FCE513A322361547444B393989F0 CONNECTED ID=69");
        assert_eq!(state.state, BridgeState::Pending);
        state.feed("650 NEWDESC $10A6CD36A537FCE513A322361547444B393989F0~hopperlab");
        assert_eq!(state.state, BridgeState::Success);
    }

    #[test]
    fn test_failed_bridge_test() {
        let mut state = TorEventState::new("146.57.248.225:22");
        state.feed("650 ORCONN 146.57.248.225:22 LAUNCHED ID=69");
        state.feed("650 ORCONN 146.57.248.225:22 FAILED REASON=DONE ID=69");
        assert_eq!(state.state, BridgeState::Failure);
        assert_eq!(state.reason, "The OR connection has shut down cleanly.");
    }

    #[test]
    fn test_fingerprint_target() {
        // A bridge line with a fingerprint is identified by $fingerprint, and
        // the NEWDESC match works without a prior CONNECTED event.
        let mut state = TorEventState::new("$0123456789ABCDEF0123456789ABCDEF01234567");
        state.feed("650 ORCONN $0123456789ABCDEF0123456789ABCDEF01234567 LAUNCHED ID=12");
        state.feed("650 NEWDESC $0123456789ABCDEF0123456789ABCDEF01234567~foobar");
        assert_eq!(state.state, BridgeState::Success);
    }

    #[test]
    fn test_foreign_events_ignored() {
        let mut state = TorEventState::new("146.57.248.225:22");
        state.feed("650 ORCONN 1.2.3.4:443 LAUNCHED ID=1");
        state.feed("650 ORCONN 1.2.3.4:443 FAILED REASON=TIMEOUT ID=1");
        assert_eq!(state.state, BridgeState::Pending);
        state.feed("650 NEWDESC $AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA~other");
        assert_eq!(state.state, BridgeState::Pending);
    }

    #[test]
    fn test_closed_events_ignored() {
        let mut state = TorEventState::new("146.57.248.225:22");
        state.feed("650 ORCONN 146.57.248.225:22 LAUNCHED ID=5");
        state.feed("650 ORCONN 146.57.248.225:22 CLOSED REASON=IOERROR ID=5");
        assert_eq!(state.state, BridgeState::Pending);
    }

    #[test]
    fn test_terminal_states_absorb() {
        let mut state = TorEventState::new("146.57.248.225:22");
        state.feed("650 ORCONN 146.57.248.225:22 LAUNCHED ID=5");
        state.feed("650 ORCONN 146.57.248.225:22 FAILED REASON=TIMEOUT ID=5");
        assert_eq!(state.state, BridgeState::Failure);
        state.feed("650 NEWDESC $0123456789ABCDEF0123456789ABCDEF01234567");
        assert_eq!(state.state, BridgeState::Failure);
    }

    #[test]
    fn test_unknown_reason_still_fails() {
        let mut state = TorEventState::new("146.57.248.225:22");
        state.feed("650 ORCONN 146.57.248.225:22 LAUNCHED ID=7");
        state.feed("650 ORCONN 146.57.248.225:22 FAILED REASON=FROBNICATED ID=7");
        assert_eq!(state.state, BridgeState::Failure);
        assert_eq!(state.reason, "");
    }

    #[test]
    fn test_malformed_lines_are_harmless() {
        let mut state = TorEventState::new("146.57.248.225:22");
        state.feed("650 ORCONN");
        state.feed("650 ORCONN garbage");
        state.feed("650 ORCONN 146.57.248.225:22 LAUNCHED ID=notanumber");
        state.feed("650 NEWDESC");
        state.feed("something else entirely");
        state.feed("");
        assert_eq!(state.state, BridgeState::Pending);
    }

    #[test]
    fn test_extract_fingerprint_from_orconn() {
        let line =
            "650 ORCONN $0123456789ABCDEF0123456789ABCDEF01234567~foobar CLOSED REASON=IOERROR \
             ID=326";
        assert_eq!(
            bridge_line::fingerprint(line).as_deref(),
            Some("0123456789ABCDEF0123456789ABCDEF01234567")
        );
    }

    #[test]
    fn test_failure_desc_mapping() {
        assert_eq!(
            failure_desc("IOERROR"),
            Some("We got some other IO error on our connection to the OR.")
        );
        assert_eq!(failure_desc("NO_SUCH_REASON"), None);
    }

    #[test]
    fn test_match_length() {
        // addr:port against addr:port.
        assert_eq!(match_length("1.2.3.4:1", "1.2.3.4:1"), 9);
        // Fingerprint with nickname suffix is capped at $ plus 40 digits.
        assert_eq!(
            match_length(
                "$0123456789ABCDEF0123456789ABCDEF01234567~foobar",
                "$0123456789ABCDEF0123456789ABCDEF01234567"
            ),
            41
        );
    }

    #[test]
    fn test_launched_by_fingerprint() {
        // LAUNCHED may report the bridge as $fingerprint~nickname. The capped
        // prefix comparison has to track the connection anyway.
        let mut state = TorEventState::new("$0123456789ABCDEF0123456789ABCDEF01234567");
        state.feed("650 ORCONN $0123456789ABCDEF0123456789ABCDEF01234567~nick LAUNCHED ID=3");
        state.feed("650 ORCONN $0123456789ABCDEF0123456789ABCDEF01234567~nick FAILED REASON=CONNECTREFUSED ID=3");
        assert_eq!(state.state, BridgeState::Failure);
        assert_eq!(
            state.reason,
            "We got an ECONNREFUSED while connecting to the target OR."
        );
    }
}
