//! # bridgestrap
//!
//! bridgestrap tests whether Tor bridges are reachable. Clients hand it a
//! batch of bridge lines over a small HTTP API; bridgestrap points a single
//! long-lived tor client at them, watches the ORCONN and NEWDESC events on
//! the control port, and reports each bridge as functional or not. Results
//! are cached on disk and repeat queries are answered from the cache.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────┐   JSON batch    ┌─────────┐  miss  ┌────────────┐
//!   │  client  │ ──────────────▶ │ handlers│ ─────▶ │ dispatcher │
//!   └──────────┘                 └────┬────┘        └─────┬──────┘
//!                                     │ hit               │ SETCONF /
//!                                ┌────▼────┐              │ SIGNAL ACTIVE
//!                                │  cache  │        ┌─────▼──────┐
//!                                └─────────┘        │ tor client │
//!                                                   └─────┬──────┘
//!                                     ┌────────────┐      │ ORCONN /
//!                                     │ per-bridge │ ◀────┘ NEWDESC
//!                                     │  parsers   │   (event queue)
//!                                     └────────────┘
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`bridge_line`] | Extract `addr:port` and fingerprints from bridge lines |
//! | [`events`] | Per-bridge state machines over controller events |
//! | [`control`] | Control-socket framing and event demultiplexing |
//! | [`tor`] | Tor process supervision and the serial batch dispatcher |
//! | [`cache`] | TTL'd result cache with disk persistence |
//! | [`handlers`] | HTTP API and web interface |
//! | [`ratelimit`] | Token bucket guarding the web route |
//! | [`metrics`] | Prometheus instruments |
//! | [`logger`] | Logging with IP address scrubbing |
//! | [`config`] | Command-line arguments |
//! | [`error`] | Error types and [`Result`] alias |
//!
//! # What bridgestrap Does NOT Do
//!
//! - **Validate bridge lines**: it extracts an `addr:port` and, if present,
//!   a fingerprint; everything else is tor's business
//! - **Carry traffic**: a bridge is "functional" once tor has its
//!   descriptor, no payload data ever flows over it
//! - **Test concurrently**: batches run strictly one at a time through the
//!   shared tor process
//!
//! # Quick Start
//!
//! ```bash
//! # Run with defaults: JSON API on port 5000, system tor binary
//! bridgestrap
//!
//! # Enable the web interface and a custom tor binary
//! bridgestrap --web --templates ./templates --tor /usr/local/bin/tor
//! ```
//!
//! Then ask it about a bridge:
//!
//! ```bash
//! curl -X GET localhost:5000/bridge-state \
//!     -d '{"bridge_lines": ["obfs4 1.2.3.4:1234 cert=... iat-mode=0"]}'
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod bridge_line;
pub mod cache;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod handlers;
pub mod logger;
pub mod metrics;
pub mod ratelimit;
pub mod tor;

pub use cache::{CacheEntry, TestCache};
pub use config::CliArgs;
pub use error::{Error, Result};
pub use events::{BridgeState, TorEventState};
pub use handlers::{AppState, Templates};
pub use metrics::Metrics;
pub use ratelimit::TokenBucket;
pub use tor::{BridgeTest, TestResult, TorContext, MAX_BRIDGES_PER_REQ};

/// bridgestrap's version, based on semantic versioning.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
