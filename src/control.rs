//! Control-port connection handling.
//!
//! Tor's control protocol is line-based. Replies to commands carry a
//! three-digit status code and a divider that distinguishes the final line
//! (` `), continuation lines (`-`) and data blocks (`+`, terminated by a
//! lone dot). Asynchronous events use status code 650 and can arrive at any
//! time, interleaved with command replies:
//!
//! ```text
//! 250 OK
//! 250-version=0.4.7.13
//! 250 OK
//! 650 ORCONN 1.2.3.4:443 LAUNCHED ID=17
//! 552 Unrecognized option
//! ```
//!
//! [`ControlConnection`] demultiplexes this stream. A background reader task
//! owns the read half of the socket and routes each framed message: events
//! go into a bounded queue handed to the caller, command replies go to an
//! internal reply channel. The write half stays with the
//! `ControlConnection`, whose [`command`](ControlConnection::command) method
//! performs a synchronous request/response round trip. Only one task (the
//! batch dispatcher) ever issues commands, so there is never more than one
//! reply outstanding.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Capacity of the asynchronous event queue. If the dispatcher falls behind,
/// the reader blocks rather than dropping events.
pub const EVENT_QUEUE_CAPACITY: usize = 100;

/// A framed reply from the control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    /// The three-digit status code shared by all lines of the reply.
    pub status: u16,
    /// The reply's lines, stripped of status code and divider.
    pub lines: Vec<String>,
}

impl ControlReply {
    /// Returns the first line of the reply, or "" for an empty reply.
    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }
}

/// A connection to tor's control socket with the event stream split off.
pub struct ControlConnection {
    writer: OwnedWriteHalf,
    replies: mpsc::Receiver<ControlReply>,
    reader: JoinHandle<()>,
}

impl ControlConnection {
    /// Connects to the control socket at `path` and starts the reader task.
    ///
    /// Returns the connection and the receiving end of the event queue.
    /// Asynchronous events are delivered as raw `650 `-prefixed lines, ready
    /// to be fed into the per-bridge event parsers.
    pub async fn connect(
        path: &Path,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, mpsc::Receiver<String>)> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (reply_tx, reply_rx) = mpsc::channel(1);

        let reader = tokio::spawn(read_loop(read_half, event_tx, reply_tx, metrics));

        Ok((
            Self {
                writer: write_half,
                replies: reply_rx,
                reader,
            },
            event_rx,
        ))
    }

    /// Sends a command and waits for tor's reply.
    ///
    /// Returns the reply on status 250 and a protocol error for any other
    /// status. A closed reply channel means the reader task exited, i.e. tor
    /// went away.
    pub async fn command(&mut self, cmd: &str) -> Result<ControlReply> {
        debug!("Sending control command: {}", cmd);
        self.writer.write_all(format!("{}\r\n", cmd).as_bytes()).await?;

        match self.replies.recv().await {
            Some(reply) if reply.status == 250 => Ok(reply),
            Some(reply) => Err(Error::Protocol(format!(
                "unexpected response: {} {}",
                reply.status,
                reply.first_line()
            ))),
            None => Err(Error::ClientDeath),
        }
    }

    /// Authenticates with an empty cookie.
    ///
    /// The tor instance we spawn has no control-port authentication
    /// configured, so this always succeeds against a healthy process.
    pub async fn authenticate(&mut self) -> Result<()> {
        self.command(r#"AUTHENTICATE """#).await?;
        Ok(())
    }

    /// Subscribes to the ORCONN and NEWDESC event streams.
    pub async fn subscribe_to_events(&mut self) -> Result<()> {
        self.command("SETEVENTS ORCONN NEWDESC").await?;
        Ok(())
    }

    /// Sends SIGNAL ACTIVE to defeat tor's dormancy timer.
    pub async fn signal_active(&mut self) -> Result<()> {
        self.command("SIGNAL ACTIVE").await?;
        Ok(())
    }

    /// Replaces tor's bridge set with the given bridge lines.
    pub async fn set_conf_bridges(&mut self, bridge_lines: &[String]) -> Result<()> {
        self.command(&set_conf_command(bridge_lines)).await?;
        Ok(())
    }

    /// Tears the connection down, stopping the reader task.
    pub fn close(self) {
        self.reader.abort();
    }
}

/// Builds the SETCONF command that replaces tor's bridge set.
pub fn set_conf_command(bridge_lines: &[String]) -> String {
    let mut cmd = String::from("SETCONF");
    for line in bridge_lines {
        cmd.push_str(&format!(" Bridge={:?}", line));
    }
    cmd
}

/// The reader task: frames messages off the socket and routes them.
///
/// This is the only producer for both channels. Any read error closes them,
/// which downstream consumers observe as the end of the event stream.
async fn read_loop(
    read_half: OwnedReadHalf,
    event_tx: mpsc::Sender<String>,
    reply_tx: mpsc::Sender<ControlReply>,
    metrics: Arc<Metrics>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        match read_message(&mut reader).await {
            Ok(msg) if msg.status == 650 => {
                for line in msg.lines {
                    metrics.pending_events.inc();
                    if event_tx.send(format!("650 {}", line)).await.is_err() {
                        info!("Event queue consumer went away; stopping control reader.");
                        return;
                    }
                }
            }
            Ok(msg) => {
                if reply_tx.send(msg).await.is_err() {
                    info!("Reply consumer went away; stopping control reader.");
                    return;
                }
            }
            Err(e) => {
                info!("Control connection read failed: {}", e);
                return;
            }
        }
    }
}

/// Reads one complete framed message from the control connection.
///
/// Handles single-line replies, `-` continuation lines and `+` data blocks
/// terminated by a lone dot, per the control protocol's framing rules.
async fn read_message<R>(reader: &mut R) -> Result<ControlReply>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut lines = Vec::new();
    let mut status: Option<u16> = None;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::ClientDeath);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 4 {
            return Err(Error::Protocol(format!("response line too short: {:?}", line)));
        }

        let code: u16 = line[..3]
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid status code: {:?}", &line[..3])))?;
        match status {
            None => status = Some(code),
            Some(existing) if existing != code => {
                return Err(Error::Protocol(format!(
                    "inconsistent status codes: {} vs {}",
                    existing, code
                )));
            }
            _ => {}
        }

        let divider = line.as_bytes()[3] as char;
        let content = &line[4..];

        match divider {
            ' ' => {
                lines.push(content.to_string());
                break;
            }
            '-' => {
                lines.push(content.to_string());
            }
            '+' => {
                let mut block = content.to_string();
                loop {
                    let mut data_line = String::new();
                    if reader.read_line(&mut data_line).await? == 0 {
                        return Err(Error::ClientDeath);
                    }
                    let data_line = data_line.trim_end_matches(['\r', '\n']);
                    if data_line == "." {
                        break;
                    }
                    let unescaped = data_line.strip_prefix('.').unwrap_or(data_line);
                    block.push('\n');
                    block.push_str(unescaped);
                }
                lines.push(block);
            }
            other => {
                return Err(Error::Protocol(format!("invalid divider: {:?}", other)));
            }
        }
    }

    Ok(ControlReply {
        status: status.unwrap_or(0),
        lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(input: &str) -> Result<ControlReply> {
        let mut reader = BufReader::new(input.as_bytes());
        read_message(&mut reader).await
    }

    #[tokio::test]
    async fn test_single_line_reply() {
        let msg = read_all("250 OK\r\n").await.unwrap();
        assert_eq!(msg.status, 250);
        assert_eq!(msg.lines, vec!["OK"]);
    }

    #[tokio::test]
    async fn test_multi_line_reply() {
        let msg = read_all("250-version=0.4.7.13\r\n250 OK\r\n").await.unwrap();
        assert_eq!(msg.status, 250);
        assert_eq!(msg.lines, vec!["version=0.4.7.13", "OK"]);
    }

    #[tokio::test]
    async fn test_data_block_reply() {
        let msg = read_all("250+config-text=\r\nUseBridges 1\r\n..dotted\r\n.\r\n250 OK\r\n")
            .await
            .unwrap();
        assert_eq!(msg.status, 250);
        assert_eq!(msg.lines, vec!["config-text=\nUseBridges 1\n.dotted", "OK"]);
    }

    #[tokio::test]
    async fn test_async_event() {
        let msg = read_all("650 ORCONN 1.2.3.4:443 LAUNCHED ID=17\r\n").await.unwrap();
        assert_eq!(msg.status, 650);
        assert_eq!(msg.lines, vec!["ORCONN 1.2.3.4:443 LAUNCHED ID=17"]);
    }

    #[tokio::test]
    async fn test_error_reply() {
        let msg = read_all("552 Unrecognized option\r\n").await.unwrap();
        assert_eq!(msg.status, 552);
    }

    #[tokio::test]
    async fn test_eof_is_client_death() {
        assert!(matches!(read_all("").await, Err(Error::ClientDeath)));
    }

    #[tokio::test]
    async fn test_short_line_is_protocol_error() {
        assert!(matches!(read_all("25\r\n").await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_inconsistent_status_codes() {
        let res = read_all("250-foo\r\n650 bar\r\n").await;
        assert!(matches!(res, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_set_conf_command() {
        let lines = vec!["1.2.3.4:1234".to_string(), "5.6.7.8:5678".to_string()];
        assert_eq!(
            set_conf_command(&lines),
            r#"SETCONF Bridge="1.2.3.4:1234" Bridge="5.6.7.8:5678""#
        );
    }

    #[test]
    fn test_set_conf_command_full_batch() {
        let lines: Vec<String> = (0..100).map(|i| format!("10.0.0.{}:443", i)).collect();
        let cmd = set_conf_command(&lines);
        assert_eq!(cmd.matches("Bridge=").count(), 100);
        assert!(cmd.starts_with("SETCONF Bridge=\"10.0.0.0:443\""));
    }
}
