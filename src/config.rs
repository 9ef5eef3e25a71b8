//! Command-line configuration for bridgestrap.
//!
//! All runtime knobs come from command-line flags; there is no configuration
//! file. The defaults match a typical deployment behind a reverse proxy with
//! a system-installed `tor` binary.

use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "bridgestrap", about = "Tests the reachability of Tor bridges.")]
pub struct CliArgs {
    /// Address to listen on.
    #[arg(long = "addr", default_value = ":5000")]
    pub addr: String,

    /// Enable the web interface (in addition to the JSON API).
    #[arg(long = "web")]
    pub web: bool,

    /// Print the given cache file and exit.
    #[arg(long = "print-cache")]
    pub print_cache: bool,

    /// Don't scrub IP addresses in log messages.
    #[arg(long = "unsafe")]
    pub unsafe_logging: bool,

    /// Print bridgestrap's version and exit.
    #[arg(long = "version")]
    pub version: bool,

    /// TLS certificate file.
    #[arg(long = "cert")]
    pub cert: Option<PathBuf>,

    /// TLS private key file.
    #[arg(long = "key")]
    pub key: Option<PathBuf>,

    /// Cache file that contains test results.
    #[arg(long = "cache", default_value = "bridgestrap-cache.bin")]
    pub cache_file: PathBuf,

    /// Path to the directory that contains our web templates.
    #[arg(long = "templates", default_value = "templates")]
    pub templates_dir: PathBuf,

    /// Path to the tor executable.
    #[arg(long = "tor", default_value = "tor")]
    pub tor_binary: String,

    /// File to write logs to.
    #[arg(long = "log")]
    pub log_file: Option<PathBuf>,

    /// Test timeout in seconds.
    #[arg(long = "test-timeout", default_value_t = 60)]
    pub test_timeout: u64,

    /// Cache timeout in hours.
    #[arg(long = "cache-timeout", default_value_t = 18)]
    pub cache_timeout: i64,
}

impl CliArgs {
    /// Returns the listen address with the host part filled in.
    ///
    /// A bare `:5000` is accepted for compatibility and expanded to
    /// `0.0.0.0:5000`.
    pub fn listen_addr(&self) -> String {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        }
    }
}
