//! Tor process supervision and the bridge-test dispatcher.
//!
//! # Overview
//!
//! bridgestrap keeps a single long-lived tor client around and funnels all
//! bridge tests through it. Spawning one tor per test would be dominated by
//! bootstrap time, and testing batches concurrently over one control
//! connection is a non-starter because the event stream cannot be routed to
//! concurrent consumers. So:
//!
//! ```text
//!   HTTP handler ──TestRequest──▶ request queue (cap 100)
//!                                      │
//!                                      ▼
//!                               dispatcher task ──SIGNAL ACTIVE──▶ tor
//!                                      │         ──SETCONF Bridge=...──▶
//!                                      ▼
//!                               event queue (cap 100) ◀── reader task ◀── tor
//!                                      │
//!                                      ▼
//!                             per-bridge TorEventState
//! ```
//!
//! Exactly one batch is in flight at any time. Events that arrive while no
//! batch is running are drained and discarded, which is what keeps batch
//! *k+1* from ever observing an event of batch *k*.
//!
//! A batch is processed by replacing tor's entire bridge set with one
//! `SETCONF` command, which makes tor attempt a connection to every listed
//! bridge, and then feeding the resulting ORCONN and NEWDESC events to the
//! per-bridge state machines until each bridge has a verdict or the deadline
//! passes. Individual bridge failures are results, not faults: the tor
//! process is never restarted because a bridge was unreachable.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bridge_line;
use crate::control::ControlConnection;
use crate::error::{Error, Result};
use crate::events::{BridgeState, TorEventState};
use crate::metrics::Metrics;

/// The maximum number of bridge lines a single request may carry.
pub const MAX_BRIDGES_PER_REQ: usize = 100;

/// Capacity of the request queue. A full queue refuses new requests.
const REQUEST_QUEUE_CAPACITY: usize = 100;

/// How often and how long we retry connecting to the control socket, to
/// cover the race with tor creating it at startup.
const CONTROL_CONNECT_ATTEMPTS: u32 = 10;
const CONTROL_CONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default bridges written to our torrc so tor can bootstrap before the
/// first test comes in. Taken from Tor Browser's default bridge list.
const DEFAULT_BRIDGES: &[&str] = &[
    "obfs4 193.11.166.194:27015 2D82C2E354D531A68469ADF7F878FA6060C6BACA \
     cert=4TLQPJrTSaDffMK7Nbao6LC7G9OW/NHkUwIdjLSS3KYf0Nv4/nQiiI8dY2TcsQx01NniOg iat-mode=0",
    "obfs4 37.218.245.14:38224 D9A82D2F9C2F65A18407B1D2B764F130847F8B5D \
     cert=bjRaMrr1BRiAW8IE9U5z27fQaYgOhX1UCmOpg2pFpoMvo6ZgQMzLsaTzzQNTlm7hNcb+Sg iat-mode=0",
    "obfs4 85.31.186.98:443 011F2599C0E9B27EE74B353155E244813763C3E5 \
     cert=ayq0XzCwhpdysn5o0EyDUbmSOx3X/oTEbzDMvczHOdBJKlvIdHHLJGkZARtT4dcBFArPPg iat-mode=0",
];

/// The result of a single bridge test, sent back to the client as part of a
/// [`TestResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeTest {
    /// Whether tor obtained the bridge's descriptor.
    pub functional: bool,
    /// When the bridge was tested.
    pub last_tested: DateTime<Utc>,
    /// Failure description; empty (and omitted from JSON) for functional
    /// bridges.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl BridgeTest {
    fn timed_out(last_tested: DateTime<Utc>) -> Self {
        Self {
            functional: false,
            last_tested,
            error: Error::Timeout.to_string(),
        }
    }
}

/// The result of testing a batch of bridge lines.
#[derive(Debug, Default, Serialize)]
pub struct TestResult {
    /// One verdict per input bridge line.
    #[serde(rename = "bridge_results")]
    pub bridges: HashMap<String, BridgeTest>,
    /// How long the test took, in seconds.
    pub time: f64,
    /// Batch-level error; empty (and omitted from JSON) if the batch ran.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// A batch test request. Ownership passes to the dispatcher at enqueue time;
/// the dispatcher owns it until the reply is posted.
struct TestRequest {
    bridge_lines: Vec<String>,
    reply: oneshot::Sender<TestResult>,
}

/// Supervises the shared tor process and serialises bridge tests through it.
pub struct TorContext {
    req_tx: Mutex<Option<mpsc::Sender<TestRequest>>>,
    child: Mutex<Option<Child>>,
    data_dir: Mutex<Option<TempDir>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

impl TorContext {
    /// Spawns the tor process and brings up the control connection.
    ///
    /// Creates a fresh data directory with a torrc in it, starts tor,
    /// connects to its control socket (retrying to cover the startup race),
    /// authenticates, subscribes to ORCONN and NEWDESC events and starts the
    /// dispatcher.
    pub async fn start(
        tor_binary: &str,
        test_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let data_dir = tempfile::Builder::new()
            .prefix("bridgestrap-datadir-")
            .tempdir()?;
        let torrc_path = data_dir.path().join("torrc");
        tokio::fs::write(&torrc_path, torrc_content(data_dir.path())).await?;
        debug!("Wrote tor config to {:?}.", torrc_path);

        let child = Command::new(tor_binary)
            .arg("-f")
            .arg(&torrc_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!("Started tor process with PID {:?}.", child.id());

        let socket_path = data_dir.path().join("control-socket");
        let (mut conn, event_rx) = connect_with_retry(&socket_path, metrics.clone()).await?;
        conn.authenticate().await?;
        conn.subscribe_to_events().await?;
        info!("Authenticated and subscribed to ORCONN and NEWDESC events.");

        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let dispatcher = tokio::spawn(dispatch_loop(
            conn,
            req_rx,
            event_rx,
            metrics.clone(),
            test_timeout,
        ));

        Ok(Self {
            req_tx: Mutex::new(Some(req_tx)),
            child: Mutex::new(Some(child)),
            data_dir: Mutex::new(Some(data_dir)),
            dispatcher: Mutex::new(Some(dispatcher)),
            metrics,
        })
    }

    /// Submits a batch of bridge lines for testing and waits for the result.
    ///
    /// Returns [`Error::Overload`] without blocking if the request queue is
    /// full.
    pub async fn test_bridge_lines(&self, bridge_lines: Vec<String>) -> Result<TestResult> {
        let tx = match self.req_tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(Error::ClientDeath),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        enqueue(
            &tx,
            TestRequest {
                bridge_lines,
                reply: reply_tx,
            },
        )?;

        self.metrics.pending_reqs.inc();
        let result = reply_rx.await.map_err(|_| Error::ClientDeath);
        self.metrics.pending_reqs.dec();
        result
    }

    /// Tears everything down: dispatcher, control connection, tor process
    /// and data directory. Every error is logged; the last one is returned.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping tor process.");
        let mut last_err: Option<Error> = None;

        // Closing the request queue makes the dispatcher wind down, which
        // drops the control connection.
        self.req_tx.lock().take();

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                error!("Failed to kill tor process: {}", e);
                last_err = Some(e.into());
            }
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!("Dispatcher task panicked: {}", e);
            }
        }

        let data_dir = self.data_dir.lock().take();
        if let Some(dir) = data_dir {
            if let Err(e) = dir.close() {
                error!("Failed to remove tor's data directory: {}", e);
                last_err = Some(e.into());
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Renders the torrc for our tor instance.
///
/// The control socket lives inside the data directory, so a single tempdir
/// removal cleans up everything.
fn torrc_content(data_dir: &Path) -> String {
    let dir = data_dir.display();
    let mut torrc = format!(
        "UseBridges 1\n\
         ControlPort unix:{dir}/control-socket\n\
         SocksPort auto\n\
         SafeLogging 0\n\
         __DisablePredictedCircuits\n\
         DataDirectory {dir}\n\
         ClientTransportPlugin obfs4 exec /usr/bin/obfs4proxy\n\
         PathsNeededToBuildCircuits 0.25"
    );
    for bridge in DEFAULT_BRIDGES {
        torrc.push_str("\nBridge ");
        torrc.push_str(bridge);
    }
    torrc
}

async fn connect_with_retry(
    path: &Path,
    metrics: Arc<Metrics>,
) -> Result<(ControlConnection, mpsc::Receiver<String>)> {
    let mut last_err = None;
    for attempt in 1..=CONTROL_CONNECT_ATTEMPTS {
        match ControlConnection::connect(path, metrics.clone()).await {
            Ok(pair) => return Ok(pair),
            Err(e) => {
                debug!(
                    "Control socket connect attempt {}/{} failed: {}",
                    attempt, CONTROL_CONNECT_ATTEMPTS, e
                );
                last_err = Some(e);
                tokio::time::sleep(CONTROL_CONNECT_DELAY).await;
            }
        }
    }
    Err(last_err.unwrap_or(Error::ClientDeath))
}

/// Maps queue-full to an overload error instead of blocking the caller.
fn enqueue(tx: &mpsc::Sender<TestRequest>, req: TestRequest) -> Result<()> {
    tx.try_send(req).map_err(|e| match e {
        TrySendError::Full(_) => Error::Overload,
        TrySendError::Closed(_) => Error::ClientDeath,
    })
}

/// The dispatcher: one serialised worker selecting over test requests and
/// controller events.
async fn dispatch_loop(
    mut conn: ControlConnection,
    mut req_rx: mpsc::Receiver<TestRequest>,
    mut event_rx: mpsc::Receiver<String>,
    metrics: Arc<Metrics>,
    test_timeout: Duration,
) {
    let mut events_open = true;
    loop {
        // Stale events take priority over new requests, and the queue is
        // drained once more right before a batch starts. Both are needed for
        // batch k+1 to never observe an event of batch k.
        tokio::select! {
            biased;

            event = event_rx.recv(), if events_open => match event {
                Some(_) => {
                    // No batch in flight: drain and discard.
                    metrics.pending_events.dec();
                }
                None => {
                    info!("Event queue closed; tor process is gone.");
                    events_open = false;
                }
            },
            req = req_rx.recv() => match req {
                Some(req) => {
                    drain_stale_events(&mut event_rx, &mut events_open, &metrics);
                    let result = process_batch(
                        &mut conn,
                        &mut event_rx,
                        &mut events_open,
                        req.bridge_lines,
                        test_timeout,
                        &metrics,
                    )
                    .await;
                    if req.reply.send(result).is_err() {
                        warn!("Requester went away before its test finished.");
                    }
                }
                None => break,
            },
        }
    }
    debug!("Dispatcher exiting.");
    conn.close();
}

/// Discards every event already queued, without blocking.
///
/// Events sent after a batch's deadline or final verdict are still sitting
/// in the queue when the next request arrives; they belong to the previous
/// batch and must not reach the new parsers.
fn drain_stale_events(
    event_rx: &mut mpsc::Receiver<String>,
    events_open: &mut bool,
    metrics: &Metrics,
) {
    let mut drained = 0;
    loop {
        match event_rx.try_recv() {
            Ok(_) => {
                metrics.pending_events.dec();
                drained += 1;
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                *events_open = false;
                break;
            }
        }
    }
    if drained > 0 {
        debug!("Discarded {} stale events before starting batch.", drained);
    }
}

/// Builds the per-bridge parsers for a batch. Lines without a derivable
/// identity get their verdict right away and are excluded from the test.
fn build_parsers(
    bridge_lines: Vec<String>,
    now: DateTime<Utc>,
    result: &mut TestResult,
) -> HashMap<String, TorEventState> {
    let mut parsers = HashMap::new();
    for line in bridge_lines {
        match bridge_line::identity(&line) {
            Ok(identity) => {
                parsers.insert(line, TorEventState::new(identity));
            }
            Err(e) => {
                warn!("Skipping unparseable bridge line: {}", e);
                result.bridges.insert(
                    line,
                    BridgeTest {
                        functional: false,
                        last_tested: now,
                        error: "internal: bad bridge line".to_string(),
                    },
                );
            }
        }
    }
    parsers
}

/// Runs one batch to completion.
async fn process_batch(
    conn: &mut ControlConnection,
    event_rx: &mut mpsc::Receiver<String>,
    events_open: &mut bool,
    bridge_lines: Vec<String>,
    test_timeout: Duration,
    metrics: &Metrics,
) -> TestResult {
    let start = std::time::Instant::now();
    let now = Utc::now();
    let mut result = TestResult::default();

    let mut parsers = build_parsers(bridge_lines, now, &mut result);
    if parsers.is_empty() {
        result.time = start.elapsed().as_secs_f64();
        return result;
    }
    info!("Testing batch of {} bridge lines.", parsers.len());

    let lines: Vec<String> = parsers.keys().cloned().collect();
    match run_batch_commands(conn, &lines).await {
        Ok(()) => {
            await_verdicts(
                &mut parsers,
                event_rx,
                events_open,
                &mut result,
                now,
                test_timeout,
                metrics,
            )
            .await;
        }
        Err(e) => {
            warn!("Aborting batch: {}", e);
            result.error = e.to_string();
            timeout_remaining(&mut parsers, &mut result, now);
        }
    }

    result.time = start.elapsed().as_secs_f64();
    metrics.tor_test_time.observe(result.time);
    for test in result.bridges.values() {
        let status = if test.functional { "functional" } else { "dysfunctional" };
        metrics.bridge_status.with_label_values(&[status]).inc();
    }
    info!(
        "Batch done after {:.1}s: {} verdicts.",
        result.time,
        result.bridges.len()
    );
    result
}

/// Wakes tor up and points it at the batch's bridges.
async fn run_batch_commands(conn: &mut ControlConnection, lines: &[String]) -> Result<()> {
    conn.signal_active().await?;
    conn.set_conf_bridges(lines).await?;
    Ok(())
}

/// Feeds controller events to the pending parsers until every bridge has a
/// verdict, the deadline passes, or the event stream ends.
async fn await_verdicts(
    parsers: &mut HashMap<String, TorEventState>,
    event_rx: &mut mpsc::Receiver<String>,
    events_open: &mut bool,
    result: &mut TestResult,
    now: DateTime<Utc>,
    test_timeout: Duration,
    metrics: &Metrics,
) {
    let deadline = Instant::now() + test_timeout;

    while !parsers.is_empty() {
        if !*events_open {
            result.error = Error::ClientDeath.to_string();
            timeout_remaining(parsers, result, now);
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                info!("Deadline expired with {} bridges still pending.", parsers.len());
                timeout_remaining(parsers, result, now);
                return;
            }
            event = event_rx.recv() => match event {
                Some(line) => {
                    metrics.pending_events.dec();
                    record_event_metrics(&line, metrics);
                    parsers.retain(|bridge, parser| {
                        parser.feed(&line);
                        match parser.state {
                            BridgeState::Pending => true,
                            BridgeState::Success => {
                                result.bridges.insert(
                                    bridge.clone(),
                                    BridgeTest {
                                        functional: true,
                                        last_tested: now,
                                        error: String::new(),
                                    },
                                );
                                false
                            }
                            BridgeState::Failure => {
                                result.bridges.insert(
                                    bridge.clone(),
                                    BridgeTest {
                                        functional: false,
                                        last_tested: now,
                                        error: parser.reason.clone(),
                                    },
                                );
                                false
                            }
                        }
                    });
                }
                None => {
                    warn!("Event queue closed mid-batch; tor process is gone.");
                    *events_open = false;
                    result.error = Error::ClientDeath.to_string();
                    timeout_remaining(parsers, result, now);
                    return;
                }
            },
        }
    }
}

/// Gives every bridge without a verdict a timed-out one.
fn timeout_remaining(
    parsers: &mut HashMap<String, TorEventState>,
    result: &mut TestResult,
    now: DateTime<Utc>,
) {
    for (bridge, _) in parsers.drain() {
        result.bridges.insert(bridge, BridgeTest::timed_out(now));
    }
}

fn record_event_metrics(line: &str, metrics: &Metrics) {
    let mut fields = line.split_whitespace();
    let _ = fields.next(); // the 650 prefix
    let event_type = fields.next().unwrap_or("UNKNOWN");
    let status = match event_type {
        "ORCONN" => fields.nth(1).unwrap_or("UNKNOWN"),
        _ => "OK",
    };
    metrics.events.with_label_values(&[event_type, status]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new(60.0).unwrap())
    }

    #[test]
    fn test_torrc_content() {
        let torrc = torrc_content(Path::new("/foo"));
        let expected_prefix = "UseBridges 1\n\
                               ControlPort unix:/foo/control-socket\n\
                               SocksPort auto\n\
                               SafeLogging 0\n\
                               __DisablePredictedCircuits\n\
                               DataDirectory /foo\n\
                               ClientTransportPlugin obfs4 exec /usr/bin/obfs4proxy\n\
                               PathsNeededToBuildCircuits 0.25";
        assert!(torrc.starts_with(expected_prefix));
        assert_eq!(torrc.matches("\nBridge ").count(), DEFAULT_BRIDGES.len());
    }

    #[test]
    fn test_enqueue_backpressure() {
        let (tx, _rx) = mpsc::channel(1);
        let mk = || {
            let (reply, _) = oneshot::channel();
            TestRequest {
                bridge_lines: vec![],
                reply,
            }
        };
        assert!(enqueue(&tx, mk()).is_ok());
        assert!(matches!(enqueue(&tx, mk()), Err(Error::Overload)));
    }

    #[test]
    fn test_build_parsers_reports_bad_lines() {
        let now = Utc::now();
        let mut result = TestResult::default();
        let parsers = build_parsers(
            vec!["1.2.3.4:1234".to_string(), "not a bridge line".to_string()],
            now,
            &mut result,
        );
        assert_eq!(parsers.len(), 1);
        assert!(parsers.contains_key("1.2.3.4:1234"));
        let bad = &result.bridges["not a bridge line"];
        assert!(!bad.functional);
        assert_eq!(bad.error, "internal: bad bridge line");
    }

    #[tokio::test]
    async fn test_await_verdicts_success_and_failure() {
        let now = Utc::now();
        let mut result = TestResult::default();
        let mut parsers = build_parsers(
            vec!["146.57.248.225:22".to_string(), "1.2.3.4:443".to_string()],
            now,
            &mut result,
        );
        let (tx, mut rx) = mpsc::channel(100);
        let mut events_open = true;
        let metrics = test_metrics();

        for line in [
            "650 ORCONN 146.57.248.225:22 LAUNCHED ID=69",
            "650 ORCONN $10A6CD36A537FCE513A322361547444B393989F0 CONNECTED ID=69",
            "650 NEWDESC $10A6CD36A537FCE513A322361547444B393989F0~hopperlab",
            "650 ORCONN 1.2.3.4:443 LAUNCHED ID=70",
            "650 ORCONN 1.2.3.4:443 FAILED REASON=CONNECTREFUSED ID=70",
        ] {
            tx.send(line.to_string()).await.unwrap();
        }

        await_verdicts(
            &mut parsers,
            &mut rx,
            &mut events_open,
            &mut result,
            now,
            Duration::from_secs(5),
            &metrics,
        )
        .await;

        assert_eq!(result.bridges.len(), 2);
        assert!(result.bridges["146.57.248.225:22"].functional);
        let failed = &result.bridges["1.2.3.4:443"];
        assert!(!failed.functional);
        assert_eq!(
            failed.error,
            "We got an ECONNREFUSED while connecting to the target OR."
        );
        assert!(result.error.is_empty());
    }

    #[tokio::test]
    async fn test_await_verdicts_timeout() {
        let now = Utc::now();
        let mut result = TestResult::default();
        let mut parsers = build_parsers(vec!["1.2.3.4:443".to_string()], now, &mut result);
        let (_tx, mut rx) = mpsc::channel::<String>(100);
        let mut events_open = true;
        let metrics = test_metrics();

        await_verdicts(
            &mut parsers,
            &mut rx,
            &mut events_open,
            &mut result,
            now,
            Duration::from_millis(50),
            &metrics,
        )
        .await;

        let test = &result.bridges["1.2.3.4:443"];
        assert!(!test.functional);
        assert_eq!(test.error, "timed out waiting for bridge descriptor");
    }

    #[tokio::test]
    async fn test_await_verdicts_client_death() {
        let now = Utc::now();
        let mut result = TestResult::default();
        let mut parsers = build_parsers(vec!["1.2.3.4:443".to_string()], now, &mut result);
        let (tx, mut rx) = mpsc::channel::<String>(100);
        drop(tx);
        let mut events_open = true;
        let metrics = test_metrics();

        await_verdicts(
            &mut parsers,
            &mut rx,
            &mut events_open,
            &mut result,
            now,
            Duration::from_secs(5),
            &metrics,
        )
        .await;

        assert!(!events_open);
        assert_eq!(result.error, "lost connection to the tor process");
        assert_eq!(
            result.bridges["1.2.3.4:443"].error,
            "timed out waiting for bridge descriptor"
        );
    }

    #[tokio::test]
    async fn test_one_verdict_per_input() {
        // Every input line produces exactly one verdict, whether it tested
        // fine, failed to parse, or timed out.
        let now = Utc::now();
        let mut result = TestResult::default();
        let lines = vec![
            "146.57.248.225:22".to_string(),
            "no identifiers".to_string(),
            "5.6.7.8:9".to_string(),
        ];
        let num_lines = lines.len();
        let mut parsers = build_parsers(lines, now, &mut result);
        let (tx, mut rx) = mpsc::channel(100);
        let mut events_open = true;
        let metrics = test_metrics();

        tx.send("650 ORCONN 146.57.248.225:22 LAUNCHED ID=1".to_string())
            .await
            .unwrap();
        tx.send("650 ORCONN 146.57.248.225:22 FAILED REASON=DONE ID=1".to_string())
            .await
            .unwrap();

        await_verdicts(
            &mut parsers,
            &mut rx,
            &mut events_open,
            &mut result,
            now,
            Duration::from_millis(50),
            &metrics,
        )
        .await;

        assert_eq!(result.bridges.len(), num_lines);
    }

    #[tokio::test]
    async fn test_stale_events_drained_before_batch() {
        // Leftovers of a finished batch must never reach the next batch's
        // parsers, even for the same bridge.
        let (tx, mut rx) = mpsc::channel(100);
        let mut events_open = true;
        let metrics = test_metrics();

        tx.send("650 ORCONN 1.2.3.4:443 LAUNCHED ID=9".to_string())
            .await
            .unwrap();
        tx.send("650 ORCONN 1.2.3.4:443 FAILED REASON=DONE ID=9".to_string())
            .await
            .unwrap();

        drain_stale_events(&mut rx, &mut events_open, &metrics);
        assert!(events_open);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // With the queue clean, the old FAILED event cannot have produced a
        // verdict for a fresh parser of the same bridge.
        let now = Utc::now();
        let mut result = TestResult::default();
        let mut parsers = build_parsers(vec!["1.2.3.4:443".to_string()], now, &mut result);
        await_verdicts(
            &mut parsers,
            &mut rx,
            &mut events_open,
            &mut result,
            now,
            Duration::from_millis(50),
            &metrics,
        )
        .await;
        assert_eq!(
            result.bridges["1.2.3.4:443"].error,
            "timed out waiting for bridge descriptor"
        );

        // A closed queue is noticed during the drain.
        drop(tx);
        drain_stale_events(&mut rx, &mut events_open, &metrics);
        assert!(!events_open);
    }

    #[test]
    fn test_result_serialisation() {
        let now = "2024-05-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut result = TestResult::default();
        result.bridges.insert(
            "1.2.3.4:443".to_string(),
            BridgeTest {
                functional: true,
                last_tested: now,
                error: String::new(),
            },
        );
        result.time = 2.5;

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["time"], 2.5);
        // The batch-level error is omitted when empty.
        assert!(json.get("error").is_none());
        let bridge = &json["bridge_results"]["1.2.3.4:443"];
        assert_eq!(bridge["functional"], true);
        assert!(bridge.get("error").is_none());
        assert!(bridge["last_tested"].as_str().unwrap().starts_with("2024-05-01T00:00:00"));
    }
}
