//! The control-socket listener (spec.md §4.4, §6.1): a local Unix stream
//! socket that upsd (and tooling) connect to, speaking the line-oriented
//! dstate/command protocol.
//!
//! Reader tasks are spawned per-peer purely to multiplex blocking socket
//! I/O into a single inbound channel; all protocol *decisions* (what a
//! line means, whether a SET is valid) still happen on the one poll-loop
//! task that owns `DriverContext`, preserving the single-threaded
//! ownership model from §5.

use crate::error::{NutError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Outbound flow-control discipline, the `synchronous` option
/// (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Writes that would block are dropped with a warning.
    No,
    /// The poll loop blocks on the write.
    Yes,
    /// A peer slow enough to block a write is disconnected instead.
    Auto,
}

impl SyncMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no" => Some(SyncMode::No),
            "yes" => Some(SyncMode::Yes),
            "auto" => Some(SyncMode::Auto),
            _ => None,
        }
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Auto
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

/// Events flowing from per-peer I/O tasks back to the owning poll loop.
/// Never carries a decision, only raw facts.
#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        id: PeerId,
        outbound_tx: mpsc::Sender<String>,
    },
    Line { id: PeerId, line: String },
    Closed { id: PeerId },
}

struct PeerHandle {
    outbound_tx: mpsc::Sender<String>,
}

/// Owns the listening socket, the set of connected peers, and the single
/// channel every peer's reader task feeds into.
pub struct CtrlSocket {
    path: PathBuf,
    synchronous: SyncMode,
    events_rx: mpsc::Receiver<PeerEvent>,
    events_tx: mpsc::Sender<PeerEvent>,
    peers: HashMap<PeerId, PeerHandle>,
    next_id: u64,
}

impl CtrlSocket {
    /// Bind the listener at `<rundir>/<progname>-<upsname>` and spawn its
    /// accept loop. Pre-existing stale socket files are removed first,
    /// matching the core's "one driver instance owns this path" model.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                NutError::fatal(format!("removing stale control socket {}: {e}", path.display()))
            })?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| NutError::fatal(format!("binding control socket {}: {e}", path.display())))?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let accept_tx = events_tx.clone();
        tokio::spawn(accept_loop(listener, accept_tx));

        Ok(Self {
            path: path.to_path_buf(),
            synchronous: SyncMode::Auto,
            events_rx,
            events_tx,
            peers: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn set_synchronous(&mut self, mode: SyncMode) {
        self.synchronous = mode;
    }

    /// Await the next raw peer event. The poll loop's `tokio::select!`
    /// races this against the pollinterval timer and the signal stream.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events_rx.recv().await
    }

    /// Record bookkeeping for a freshly-connected peer. The caller is
    /// responsible for sending the `DUMPALL` handshake body immediately
    /// afterward via [`CtrlSocket::send_line`].
    pub fn register(&mut self, id: PeerId, outbound_tx: mpsc::Sender<String>) {
        self.peers.insert(id, PeerHandle { outbound_tx });
    }

    pub fn forget(&mut self, id: PeerId) {
        self.peers.remove(&id);
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    /// Write one line to one peer, honoring `synchronous` (spec.md §4.4
    /// "Outbound flow control"). Returns `Ok(false)` if the peer was
    /// disconnected as a side effect (mode `auto`, write would block).
    pub async fn send_line(&mut self, id: PeerId, line: &str) -> Result<bool> {
        let Some(peer) = self.peers.get(&id) else {
            return Ok(false);
        };

        match self.synchronous {
            SyncMode::Yes => {
                if peer.outbound_tx.send(line.to_string()).await.is_err() {
                    self.peers.remove(&id);
                    return Ok(false);
                }
                Ok(true)
            }
            SyncMode::No => {
                if peer.outbound_tx.try_send(line.to_string()).is_err() {
                    tracing::warn!(peer = id.0, "ctrlsocket write would block, dropping line");
                }
                Ok(true)
            }
            SyncMode::Auto => {
                if peer.outbound_tx.try_send(line.to_string()).is_err() {
                    tracing::warn!(peer = id.0, "ctrlsocket peer too slow, disconnecting");
                    self.peers.remove(&id);
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    /// Broadcast a batch of lines (a dirty-drain or a DUMPALL body) to one
    /// peer in order.
    pub async fn send_all(&mut self, id: PeerId, lines: &[String]) -> Result<()> {
        for line in lines {
            self.send_line(id, line).await?;
        }
        Ok(())
    }

    /// Broadcast a batch of lines to every connected peer.
    pub async fn broadcast(&mut self, lines: &[String]) -> Result<()> {
        let ids: Vec<PeerId> = self.peer_ids().collect();
        for id in ids {
            self.send_all(id, lines).await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CtrlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(listener: UnixListener, events_tx: mpsc::Sender<PeerEvent>) {
    let mut next_id: u64 = 0;
    loop {
        let Ok((stream, _addr)) = listener.accept().await else {
            return;
        };
        let id = PeerId(next_id);
        next_id += 1;

        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(256);

        if events_tx
            .send(PeerEvent::Connected { id, outbound_tx })
            .await
            .is_err()
        {
            return;
        }

        tokio::spawn(writer_task(write_half, outbound_rx));
        tokio::spawn(reader_task(read_half, id, events_tx.clone()));
    }
}

async fn writer_task(
    mut write_half: tokio::net::unix::OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<String>,
) {
    while let Some(line) = outbound_rx.recv().await {
        let mut framed = line;
        framed.push('\n');
        if write_half.write_all(framed.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn reader_task(
    read_half: tokio::net::unix::OwnedReadHalf,
    id: PeerId,
    events_tx: mpsc::Sender<PeerEvent>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = truncate_to_char_boundary(line, MAX_LINE_LEN);
                if events_tx.send(PeerEvent::Line { id, line }).await.is_err() {
                    return;
                }
            }
            _ => {
                let _ = events_tx.send(PeerEvent::Closed { id }).await;
                return;
            }
        }
    }
}

/// Truncate `line` to at most `max_bytes` bytes, falling back to the
/// nearest preceding char boundary rather than slicing mid-codepoint
/// (spec.md §6.1 "Maximum line length 8 KiB"). A naive byte-offset slice
/// here would panic on a multi-byte UTF-8 sequence straddling the limit.
fn truncate_to_char_boundary(mut line: String, max_bytes: usize) -> String {
    if line.len() <= max_bytes {
        return line;
    }
    let mut boundary = max_bytes;
    while boundary > 0 && !line.is_char_boundary(boundary) {
        boundary -= 1;
    }
    line.truncate(boundary);
    line
}

/// Tokenize one inbound line: whitespace-separated tokens, with
/// double-quoted segments (backslash escapes identical to
/// [`crate::dstate::escape_value`]) treated as a single token.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '"' {
            chars.next();
            let mut raw = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                if c == '\\' {
                    raw.push(c);
                    if let Some(next) = chars.next() {
                        raw.push(next);
                        if next == 'x' {
                            for _ in 0..2 {
                                if let Some(hex) = chars.next() {
                                    raw.push(hex);
                                }
                            }
                        }
                    }
                } else if c == '"' {
                    closed = true;
                    break;
                } else {
                    raw.push(c);
                }
            }
            if !closed {
                return Err(NutError::protocol("unterminated quoted token"));
            }
            let value = crate::dstate::unescape_value(&raw)
                .ok_or_else(|| NutError::protocol("malformed escape in quoted token"))?;
            tokens.push(value);
        } else {
            let mut raw = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                raw.push(c);
                chars.next();
            }
            tokens.push(raw);
        }
    }

    Ok(tokens)
}
