//! Error types for bridgestrap.
//!
//! This module defines the [`enum@Error`] enum representing all failure
//! conditions in bridgestrap, together with the crate-wide [`Result`] alias.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io          ◄── cache file, template file, control socket, tor launch
//!   ├── Parse       ◄── malformed bridge line
//!   ├── Protocol    ◄── unexpected control-port response
//!   ├── Timeout     ◄── bridge produced no descriptor within the deadline
//!   ├── ClientDeath ◄── tor died while a batch was in flight
//!   ├── Overload    ◄── request queue full
//!   ├── Config      ◄── invalid flags, missing TLS key, logger setup
//!   └── Metrics     ◄── prometheus registration failure
//! ```
//!
//! Individual bridge failures are not errors: a bridge that refuses
//! connections is a perfectly good test result. The variants above cover
//! faults of bridgestrap itself or of the tor client it controls.

use thiserror::Error;

/// Errors that can occur during bridgestrap operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during file, socket or subprocess operations.
    ///
    /// Cache read/write failures are logged and tolerated; a failure to
    /// launch the tor client is fatal at startup.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bridge line from which neither an address:port nor a fingerprint
    /// could be derived.
    #[error("cannot parse bridge line: {0}")]
    Parse(String),

    /// Unexpected or malformed response on the control port.
    ///
    /// Surfaces as a batch-level error; the batch returns with whatever
    /// partial results it has.
    #[error("control protocol error: {0}")]
    Protocol(String),

    /// A bridge under test produced no descriptor before the deadline.
    #[error("timed out waiting for bridge descriptor")]
    Timeout,

    /// The tor client died while a batch was in flight.
    ///
    /// The event queue closed underneath the dispatcher. Bridges without a
    /// verdict at that point are reported as timed out.
    #[error("lost connection to the tor process")]
    ClientDeath,

    /// The request queue is full.
    ///
    /// The caller is refused rather than queued indefinitely; the HTTP
    /// boundary turns this into a 5xx response.
    #[error("too many pending requests")]
    Overload,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to build or register a prometheus instrument.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type alias for bridgestrap operations.
pub type Result<T> = std::result::Result<T, Error>;
