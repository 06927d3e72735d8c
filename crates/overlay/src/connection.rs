//! TCP transport for overlay connections.
//!
//! - [`TcpTransport`] - a socket driven by a reader and a writer task
//! - [`TcpDialer`] - opens outbound [`TcpTransport`]s
//! - [`Listener`] - accepts inbound connections on a port
//!
//! # Architecture
//!
//! The event loop never awaits socket I/O. Each transport spawns a reader
//! task that pushes [`TransportEvent::Data`] chunks into a channel while
//! reading is enabled, and a writer task that writes queued frames in
//! order and reports [`TransportEvent::Written`]. Both tasks poke a shared
//! [`Notify`] so the loop knows there are events to poll.

use crate::transport::{Dialer, Transport, TransportEvent};
use crate::{PeerAddress, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Default time allowed for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK_SIZE: usize = 64 * 1024;

enum WriteCommand {
    Frame(Vec<u8>),
    Shutdown,
}

/// A TCP connection to a peer.
pub struct TcpTransport {
    remote_ip: Option<Ipv4Addr>,
    write_tx: mpsc::UnboundedSender<WriteCommand>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    read_enabled: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
    /// Set on a close that discards pending writes.
    abort: Arc<AtomicBool>,
    closed: bool,
    close_reported: bool,
}

struct TaskHandles {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    write_rx: mpsc::UnboundedReceiver<WriteCommand>,
    read_enabled: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
}

impl TcpTransport {
    fn new_parts(remote_ip: Option<Ipv4Addr>, connected: bool) -> (Self, TaskHandles) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = watch::channel(true);
        let connected = Arc::new(AtomicBool::new(connected));
        let abort = Arc::new(AtomicBool::new(false));
        (
            Self {
                remote_ip,
                write_tx,
                events_rx,
                read_enabled: read_tx,
                connected: Arc::clone(&connected),
                abort: Arc::clone(&abort),
                closed: false,
                close_reported: false,
            },
            TaskHandles {
                events_tx,
                write_rx,
                read_enabled: read_rx,
                connected,
                abort,
                wakeup: Arc::new(Notify::new()),
            },
        )
    }

    /// Wraps an accepted stream. Must be called inside a tokio runtime.
    pub fn from_stream(stream: TcpStream, wakeup: Arc<Notify>) -> Result<Self> {
        let remote_ip = ipv4_of(stream.peer_addr()?);
        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;

        let (transport, mut handles) = Self::new_parts(remote_ip, true);
        handles.wakeup = wakeup;
        spawn_io_tasks(stream, handles);
        Ok(transport)
    }

    /// Starts connecting to `address` in the background. Must be called
    /// inside a tokio runtime.
    pub fn connect(address: PeerAddress, connect_timeout: Duration, wakeup: Arc<Notify>) -> Self {
        let (transport, mut handles) = Self::new_parts(Some(address.ip), false);
        handles.wakeup = wakeup;

        tokio::spawn(async move {
            debug!(peer = %address, "Connecting to peer");
            let result = timeout(connect_timeout, TcpStream::connect(address.to_socket_addr())).await;
            let stream = match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(peer = %address, error = %e, "Connection failed");
                    let _ = handles.events_tx.send(TransportEvent::Closed);
                    handles.wakeup.notify_one();
                    return;
                }
                Err(_) => {
                    debug!(peer = %address, "Connection timed out");
                    let _ = handles.events_tx.send(TransportEvent::Closed);
                    handles.wakeup.notify_one();
                    return;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                trace!(error = %e, "Failed to set TCP_NODELAY");
            }
            debug!(peer = %address, "Connected to peer");
            handles.connected.store(true, Ordering::Release);
            let _ = handles.events_tx.send(TransportEvent::Connected);
            handles.wakeup.notify_one();
            spawn_io_tasks(stream, handles);
        });

        transport
    }
}

fn ipv4_of(addr: SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

fn spawn_io_tasks(stream: TcpStream, handles: TaskHandles) {
    let (read_half, write_half) = stream.into_split();
    let TaskHandles {
        events_tx,
        write_rx,
        read_enabled,
        connected,
        abort,
        wakeup,
    } = handles;

    tokio::spawn(read_loop(
        read_half,
        events_tx.clone(),
        read_enabled,
        Arc::clone(&connected),
        Arc::clone(&wakeup),
    ));
    tokio::spawn(write_loop(write_half, write_rx, events_tx, connected, abort, wakeup));
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    mut read_enabled: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        while !*read_enabled.borrow_and_update() {
            if read_enabled.changed().await.is_err() {
                return;
            }
        }

        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Read error");
                    break;
                }
            },
            changed = read_enabled.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        };

        trace!(bytes = n, "Read from socket");
        if events_tx.send(TransportEvent::Data(buf[..n].to_vec())).is_err() {
            return;
        }
        wakeup.notify_one();
    }

    connected.store(false, Ordering::Release);
    let _ = events_tx.send(TransportEvent::Closed);
    wakeup.notify_one();
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut write_rx: mpsc::UnboundedReceiver<WriteCommand>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
) {
    while let Some(command) = write_rx.recv().await {
        match command {
            WriteCommand::Frame(bytes) => {
                if abort.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(error = %e, "Write error");
                    connected.store(false, Ordering::Release);
                    break;
                }
                let _ = events_tx.send(TransportEvent::Written(1));
                wakeup.notify_one();
            }
            WriteCommand::Shutdown => break,
        }
    }
    let _ = writer.shutdown().await;
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: Vec<u8>) {
        if self.closed {
            return;
        }
        if self.write_tx.send(WriteCommand::Frame(bytes)).is_err() {
            trace!("Writer task is gone, dropping frame");
        }
    }

    fn set_read_enabled(&mut self, enabled: bool) {
        self.read_enabled.send_if_modified(|current| {
            let changed = *current != enabled;
            *current = enabled;
            changed
        });
    }

    fn remote_ip(&self) -> Option<Ipv4Addr> {
        self.remote_ip
    }

    fn is_connected(&self) -> bool {
        !self.closed && self.connected.load(Ordering::Acquire)
    }

    fn close(&mut self, flush: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !flush {
            self.abort.store(true, Ordering::Release);
        }
        let _ = self.write_tx.send(WriteCommand::Shutdown);
        // Stop the reader as well
        self.read_enabled.send_replace(false);
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        if self.close_reported {
            return None;
        }
        if self.closed {
            self.close_reported = true;
            return Some(TransportEvent::Closed);
        }
        match self.events_rx.try_recv() {
            Ok(TransportEvent::Closed) => {
                self.close_reported = true;
                Some(TransportEvent::Closed)
            }
            Ok(event) => Some(event),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.close_reported = true;
                Some(TransportEvent::Closed)
            }
        }
    }
}

/// Opens [`TcpTransport`]s that wake the event loop through `wakeup`.
pub struct TcpDialer {
    wakeup: Arc<Notify>,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(wakeup: Arc<Notify>) -> Self {
        Self {
            wakeup,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Dialer for TcpDialer {
    fn dial(&mut self, address: PeerAddress) -> Box<dyn Transport> {
        Box::new(TcpTransport::connect(
            address,
            self.connect_timeout,
            Arc::clone(&self.wakeup),
        ))
    }
}

/// TCP listener for accepting incoming peer connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds to the specified port on all interfaces (0.0.0.0).
    pub async fn bind(port: u16) -> Result<Self> {
        Self::bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await
    }

    pub async fn bind_addr(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!(addr = %local_addr, "Listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next incoming connection.
    pub async fn accept(&self, wakeup: Arc<Notify>) -> Result<TcpTransport> {
        let (stream, remote_addr) = self.listener.accept().await?;
        debug!(remote = %remote_addr, "Accepted connection");
        TcpTransport::from_stream(stream, wakeup)
    }
}
