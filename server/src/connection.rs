//! Per-connection state shared between the I/O loop and the world loop.
//!
//! The socket itself stays inside the network module; what crosses threads
//! is this handle: two bounded, mutex-guarded message queues plus liveness
//! flags. The loops only ever `try_lock` the queues — a missed acquisition
//! means the messages wait one iteration, never that a loop blocks — and a
//! queue that fills past [`QUEUE_CAPACITY`] marks the connection broken,
//! the same policy as a failed send. Entity state is never touched from
//! here; the world loop owns all of that.

use log::warn;
use shared::{ClientMessage, ServerMessage};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

pub type ConnectionId = u64;

/// Most messages either queue may hold before the connection is treated as
/// broken (a peer that stops reading, or a client flooding faster than the
/// world loop drains).
pub const QUEUE_CAPACITY: usize = 1024;

/// Queue/liveness state for one live socket.
pub struct ConnectionShared {
    id: ConnectionId,
    peer: SocketAddr,
    /// Decoded client frames waiting for the world loop.
    inbound: Mutex<VecDeque<ClientMessage>>,
    /// Typed server messages waiting for the I/O loop to encode and send.
    outbound: Mutex<VecDeque<ServerMessage>>,
    /// Holding pen for outbound messages queued while the I/O loop had the
    /// outbound lock. Only the world loop takes this lock first, so it is
    /// never contended on the queueing side.
    outbound_spill: Mutex<VecDeque<ServerMessage>>,
    /// Set on any socket error; excluded from I/O until the removal pass.
    broken: AtomicBool,
    /// Set by the world loop to request shutdown after a final flush.
    force_close: AtomicBool,
    /// Millisecond timestamp of the last traffic from the peer.
    last_comm_ms: AtomicU64,
}

impl ConnectionShared {
    pub fn new(id: ConnectionId, peer: SocketAddr, now_ms: u64) -> Self {
        Self {
            id,
            peer,
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(VecDeque::new()),
            outbound_spill: Mutex::new(VecDeque::new()),
            broken: AtomicBool::new(false),
            force_close: AtomicBool::new(false),
            last_comm_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Moves decoded messages into the inbound queue. Returns false on lock
    /// contention; the caller keeps the messages and retries next iteration.
    /// Overflowing the queue marks the connection broken and discards the
    /// backlog.
    pub fn try_enqueue_inbound(&self, msgs: &mut VecDeque<ClientMessage>) -> bool {
        match self.inbound.try_lock() {
            Ok(mut q) => {
                if q.len() + msgs.len() > QUEUE_CAPACITY {
                    warn!("Inbound queue overflow on connection {}, marking broken", self.id);
                    q.clear();
                    msgs.clear();
                    self.mark_broken();
                    return true;
                }
                q.append(msgs);
                true
            }
            Err(_) => false,
        }
    }

    /// Takes every queued inbound message, or nothing on lock contention.
    pub fn drain_inbound(&self) -> Vec<ClientMessage> {
        match self.inbound.try_lock() {
            Ok(mut q) => q.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Queues a message for the peer without ever blocking: messages pass
    /// through the spill so that outbound-lock contention (the I/O loop
    /// draining) only delays delivery, never stalls the caller. Overflowing
    /// the capacity marks the connection broken and discards the backlog.
    pub fn queue(&self, msg: ServerMessage) {
        let mut spill = match self.outbound_spill.try_lock() {
            Ok(g) => g,
            // Single queueing thread; only a poisoned lock lands here.
            Err(_) => {
                warn!("Dropping outbound message on connection {}: spill unavailable", self.id);
                return;
            }
        };
        spill.push_back(msg);
        let mut q = match self.outbound.try_lock() {
            Ok(q) => q,
            // The I/O loop is mid-drain; the spill keeps the messages in
            // order until the next queue() or take_outbound().
            Err(_) => return,
        };
        while q.len() < QUEUE_CAPACITY {
            match spill.pop_front() {
                Some(m) => q.push_back(m),
                None => return,
            }
        }
        if !spill.is_empty() {
            warn!("Outbound queue overflow on connection {}, marking broken", self.id);
            q.clear();
            spill.clear();
            self.mark_broken();
        }
    }

    /// Takes every queued outbound message, or nothing on lock contention.
    /// Spilled messages are strictly newer than queued ones, so draining the
    /// queue first preserves order.
    pub fn take_outbound(&self) -> Vec<ServerMessage> {
        let mut out: Vec<ServerMessage> = match self.outbound.try_lock() {
            Ok(mut q) => q.drain(..).collect(),
            Err(_) => return Vec::new(),
        };
        if let Ok(mut spill) = self.outbound_spill.try_lock() {
            out.extend(spill.drain(..));
        }
        out
    }

    pub fn mark_traffic(&self, now_ms: u64) {
        self.last_comm_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_comm_ms(&self) -> u64 {
        self.last_comm_ms.load(Ordering::Relaxed)
    }

    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }

    pub fn request_close(&self) {
        self.force_close.store(true, Ordering::Relaxed);
    }

    pub fn is_close_requested(&self) -> bool {
        self.force_close.load(Ordering::Relaxed)
    }

    /// Whether the removal pass should destroy this connection.
    pub fn should_drop(&self) -> bool {
        self.is_broken() || self.is_close_requested()
    }
}
