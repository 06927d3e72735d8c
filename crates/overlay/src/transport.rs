//! Byte transport underneath a [`Peer`](crate::Peer).
//!
//! A [`Transport`] moves opaque frames and reports what happened through
//! [`TransportEvent`]s, which the event loop polls and hands to the peer.
//! Events for one transport come out in this order: a connect notification
//! first, write completions before data, and `Closed` only once all data
//! that was readable has been delivered.
//!
//! Two implementations exist: [`TcpTransport`](crate::TcpTransport) over a
//! tokio socket and [`LoopbackTransport`], an in-memory pair for tests and
//! simulations. Loopback delivery is synchronous, which makes a pair of
//! engines fully deterministic under virtual time.

use crate::PeerAddress;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An outbound connection was established.
    Connected,
    /// Bytes from the remote; not necessarily a whole frame.
    Data(Vec<u8>),
    /// This many previously sent frames have been written out.
    Written(usize),
    /// The connection is gone; nothing else will be reported.
    Closed,
}

/// Capability interface the engine uses to talk to a remote.
pub trait Transport: Send {
    /// Queues one frame for writing.
    fn send(&mut self, bytes: Vec<u8>);

    /// Pauses or resumes delivery of incoming data.
    fn set_read_enabled(&mut self, enabled: bool);

    /// IPv4 address of the remote end, if known.
    fn remote_ip(&self) -> Option<Ipv4Addr>;

    fn is_connected(&self) -> bool;

    /// Closes the transport. With `flush`, frames already sent are still
    /// written out before the connection goes away.
    fn close(&mut self, flush: bool);

    /// Next pending event, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

/// Opens outbound transports.
pub trait Dialer: Send {
    /// Starts connecting to `address`. The returned transport reports
    /// [`TransportEvent::Connected`] or [`TransportEvent::Closed`] later.
    fn dial(&mut self, address: PeerAddress) -> Box<dyn Transport>;
}

#[derive(Debug)]
struct LoopbackSide {
    ip: Option<Ipv4Addr>,
    /// Frames sent by this side and not yet delivered.
    outgoing: VecDeque<Vec<u8>>,
    /// Frames delivered to this side and not yet read.
    incoming: VecDeque<Vec<u8>>,
    written: usize,
    connect_pending: bool,
    connected: bool,
    read_enabled: bool,
    corked: bool,
    closed: bool,
    close_reported: bool,
}

impl LoopbackSide {
    fn new(ip: Option<Ipv4Addr>, initiator: bool) -> Self {
        Self {
            ip,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
            written: 0,
            connect_pending: initiator,
            connected: !initiator,
            read_enabled: true,
            corked: false,
            closed: false,
            close_reported: false,
        }
    }
}

#[derive(Debug)]
struct LoopbackShared {
    sides: [LoopbackSide; 2],
}

impl LoopbackShared {
    /// Moves frames written by `from` to the other side.
    fn deliver(&mut self, from: usize) {
        let to = 1 - from;
        if self.sides[from].corked {
            return;
        }
        while let Some(frame) = self.sides[from].outgoing.pop_front() {
            self.sides[from].written += 1;
            if !self.sides[to].closed {
                self.sides[to].incoming.push_back(frame);
            }
        }
    }
}

/// One end of an in-memory connection.
///
/// Clones refer to the same end, so a test can keep a handle for
/// [`cork`](LoopbackTransport::cork) after handing the transport over.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    shared: Arc<Mutex<LoopbackShared>>,
    side: usize,
}

impl LoopbackTransport {
    /// Creates a connected pair: `(initiator, acceptor)`.
    ///
    /// `initiator_ip` is the address the acceptor sees as remote, and the
    /// other way round. The initiator reports [`TransportEvent::Connected`]
    /// on its first poll.
    pub fn pair(
        initiator_ip: Option<Ipv4Addr>,
        acceptor_ip: Option<Ipv4Addr>,
    ) -> (LoopbackTransport, LoopbackTransport) {
        let shared = Arc::new(Mutex::new(LoopbackShared {
            sides: [
                LoopbackSide::new(initiator_ip, true),
                LoopbackSide::new(acceptor_ip, false),
            ],
        }));
        (
            LoopbackTransport {
                shared: Arc::clone(&shared),
                side: 0,
            },
            LoopbackTransport { shared, side: 1 },
        )
    }

    /// Holds back frames sent from this end until [`uncork`] is called.
    ///
    /// [`uncork`]: LoopbackTransport::uncork
    pub fn cork(&self) {
        self.shared.lock().sides[self.side].corked = true;
    }

    pub fn uncork(&self) {
        let mut shared = self.shared.lock();
        shared.sides[self.side].corked = false;
        shared.deliver(self.side);
    }

    /// Frames sent from this end that were not delivered yet.
    pub fn pending_outgoing(&self) -> usize {
        self.shared.lock().sides[self.side].outgoing.len()
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, bytes: Vec<u8>) {
        let mut shared = self.shared.lock();
        if shared.sides[self.side].closed {
            return;
        }
        shared.sides[self.side].outgoing.push_back(bytes);
        shared.deliver(self.side);
    }

    fn set_read_enabled(&mut self, enabled: bool) {
        self.shared.lock().sides[self.side].read_enabled = enabled;
    }

    fn remote_ip(&self) -> Option<Ipv4Addr> {
        self.shared.lock().sides[1 - self.side].ip
    }

    fn is_connected(&self) -> bool {
        let shared = self.shared.lock();
        let me = &shared.sides[self.side];
        me.connected && !me.closed && !shared.sides[1 - self.side].closed
    }

    fn close(&mut self, flush: bool) {
        let mut shared = self.shared.lock();
        if flush {
            shared.deliver(self.side);
        }
        let me = &mut shared.sides[self.side];
        me.outgoing.clear();
        me.incoming.clear();
        me.closed = true;
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        let mut shared = self.shared.lock();
        let peer_closed = shared.sides[1 - self.side].closed;
        let me = &mut shared.sides[self.side];

        if me.close_reported {
            return None;
        }
        if me.connect_pending && !me.closed {
            me.connect_pending = false;
            me.connected = true;
            return Some(TransportEvent::Connected);
        }
        if me.written > 0 {
            return Some(TransportEvent::Written(std::mem::take(&mut me.written)));
        }
        if me.read_enabled && !me.closed {
            if let Some(frame) = me.incoming.pop_front() {
                return Some(TransportEvent::Data(frame));
            }
        }
        if me.closed || (peer_closed && me.incoming.is_empty()) {
            me.close_reported = true;
            return Some(TransportEvent::Closed);
        }
        None
    }
}
