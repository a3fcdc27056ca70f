//! Reconnecting control-protocol client
//!
//! One unix-socket connection carries both command replies and unsolicited
//! lifecycle events. A single reader task owns the read half and routes
//! every inbound line: replies complete the oldest in-flight command (the
//! protocol answers in request order, so a FIFO queue of oneshot senders is
//! the whole correlation story), events fan out on a bounded channel.
//!
//! Connection loss is fatal for the connection, not the process: the reader
//! fails all in-flight commands, the link is marked dead, and the next
//! command reconnects. While the emulator has not created its socket yet,
//! connection attempts retry on a fixed tick instead of failing.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{ProtocolError, Result};
use crate::types::GuestEvent;
use crate::wire::{self, Inbound};

/// Delay between connection attempts while the emulator socket is absent.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection.
    Disconnected,
    /// Socket dialing in progress.
    Connecting,
    /// Greeting line consumed, capabilities not yet negotiated.
    Greeted,
    /// Commands may be issued.
    Ready,
}

type Waiter = oneshot::Sender<Result<Value>>;
type PendingQueue = Arc<Mutex<VecDeque<Waiter>>>;

struct Connection {
    writer: OwnedWriteHalf,
    pending: PendingQueue,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

struct Link {
    state: LinkState,
    conn: Option<Connection>,
}

impl Link {
    fn reset(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.reader.abort();
        }
        self.state = LinkState::Disconnected;
    }
}

/// Reconnecting client for the guest's control socket.
pub struct ControlClient {
    socket_path: PathBuf,
    // Connection-scoped lock: serializes connects and socket writes. Held
    // only until a request line is on the wire, never across the reply
    // wait, so commands from different callers can be in flight together.
    link: Mutex<Link>,
    event_tx: Sender<GuestEvent>,
    event_rx: Receiver<GuestEvent>,
}

impl ControlClient {
    /// Create a client for the given socket path. No connection is made
    /// until the first command.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let (event_tx, event_rx) = async_channel::bounded(EVENT_CHANNEL_CAPACITY);
        Self {
            socket_path: socket_path.into(),
            link: Mutex::new(Link {
                state: LinkState::Disconnected,
                conn: None,
            }),
            event_tx,
            event_rx,
        }
    }

    /// The socket path this client dials.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Current connection state.
    pub async fn state(&self) -> LinkState {
        self.link.lock().await.state
    }

    /// Receiver for guest lifecycle events. Events are produced by the
    /// reader task for as long as any connection is up.
    pub fn events(&self) -> Receiver<GuestEvent> {
        self.event_rx.clone()
    }

    /// Drop the current connection, if any. In-flight commands fail with
    /// [`ProtocolError::Eof`]; the next command reconnects.
    pub async fn close(&self) {
        self.link.lock().await.reset();
    }

    /// Issue one command and return its `"return"` value.
    ///
    /// Connects (and negotiates capabilities) first if needed. A reply
    /// carrying an `"error"` member maps to [`ProtocolError::Command`].
    pub async fn send(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let rx = {
            let mut link = self.link.lock().await;
            if link.conn.as_ref().is_none_or(|c| !c.is_alive()) {
                link.reset();
                if let Err(e) = self.connect(&mut link).await {
                    link.reset();
                    return Err(e);
                }
            }
            Self::submit(&mut link, command, arguments.as_ref()).await?
        };
        let reply = match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(ProtocolError::Eof),
        };
        wire::response_result(reply)
    }

    /// Queue a waiter and put the request line on the wire. The caller
    /// must hold the link lock; the returned receiver is awaited after
    /// releasing it.
    async fn submit(
        link: &mut Link,
        command: &str,
        arguments: Option<&Value>,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let Some(conn) = link.conn.as_mut() else {
            return Err(ProtocolError::Eof);
        };
        let line = wire::request_line(command, arguments)?;
        trace!(%command, "sending {}", line.trim_end());
        let (tx, rx) = oneshot::channel();
        // Queue the waiter before writing: the reply can race the write
        // call returning.
        conn.pending.lock().await.push_back(tx);
        let written = conn.writer.write_all(line.as_bytes()).await;
        if let Err(e) = written {
            link.reset();
            return Err(e.into());
        }
        // The reader may have died between the aliveness check and the
        // write; it drains the queue when it exits, so any waiter queued
        // after that drain would never complete. Fail them here.
        if !conn.is_alive() {
            for waiter in conn.pending.lock().await.drain(..) {
                let _ = waiter.send(Err(ProtocolError::Eof));
            }
            link.reset();
            return Err(ProtocolError::Eof);
        }
        Ok(rx)
    }

    async fn connect(&self, link: &mut Link) -> Result<()> {
        link.state = LinkState::Connecting;
        debug!(path = %self.socket_path.display(), "connecting to control socket");
        let stream = self.wait_for_socket().await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut greeting = String::new();
        if reader.read_line(&mut greeting).await? == 0 {
            link.state = LinkState::Disconnected;
            return Err(ProtocolError::Eof);
        }
        let banner: Value = serde_json::from_str(greeting.trim())?;
        if banner.get("error").is_some() {
            link.state = LinkState::Disconnected;
            return Err(ProtocolError::Greeting(banner.to_string()));
        }
        trace!("greeting: {}", banner);
        link.state = LinkState::Greeted;

        let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            self.event_tx.clone(),
            Arc::clone(&alive),
        ));
        link.conn = Some(Connection {
            writer: write_half,
            pending,
            alive,
            reader: reader_task,
        });

        // Negotiate capabilities before anyone else can use the link.
        let rx = Self::submit(link, "qmp_capabilities", None).await?;
        let reply = match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(ProtocolError::Eof),
        };
        wire::response_result(reply)?;
        link.state = LinkState::Ready;
        info!(path = %self.socket_path.display(), "control link ready");
        Ok(())
    }

    /// Dial the socket, retrying on a fixed tick while it does not exist
    /// yet (the emulator may not have created it) or refuses connections
    /// (the emulator may be mid-restart). Bounded only by process
    /// lifetime.
    async fn wait_for_socket(&self) -> Result<UnixStream> {
        loop {
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    info!(
                        path = %self.socket_path.display(),
                        "control socket not available ({}), retrying in {}s",
                        e.kind(),
                        CONNECT_RETRY_DELAY.as_secs()
                    );
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// The single reader: classifies every inbound line and routes it to the
/// response queue or the event channel. Exits on EOF or a malformed line,
/// failing all in-flight commands.
async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    pending: PendingQueue,
    events: Sender<GuestEvent>,
    alive: Arc<AtomicBool>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("peer closed the control socket");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("control socket read failed: {}", e);
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            warn!("empty line on control socket");
            break;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                warn!("malformed control line: {}", e);
                break;
            }
        };
        match wire::classify(value) {
            Inbound::Response(reply) => {
                let waiter = pending.lock().await.pop_front();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(reply));
                    }
                    None => debug!("reply with no in-flight command: {}", reply),
                }
            }
            Inbound::Event { name, payload } => match GuestEvent::from_name(&name) {
                Some(event) => {
                    debug!(event = %name, "guest lifecycle event");
                    if events.send(event).await.is_err() {
                        debug!("event channel closed; dropping further events");
                    }
                }
                None => trace!(event = %name, "ignoring event: {}", payload),
            },
            Inbound::Other(value) => debug!("unclassifiable control message: {}", value),
        }
    }
    alive.store(false, Ordering::Release);
    for waiter in pending.lock().await.drain(..) {
        let _ = waiter.send(Err(ProtocolError::Eof));
    }
}
