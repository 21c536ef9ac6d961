//! Connection layer: the listener and the poll-and-drain I/O loop.
//!
//! Two of the three server loops live here; the world tick loop is the
//! third. The listener blocks on accept and hands fresh sockets to both the
//! I/O loop and the world loop through staged lists, each guarded by its own
//! short-lived lock. The I/O loop never blocks on a socket: it drains
//! whatever bytes are available, decodes complete frames into the
//! per-connection inbound queue, and pushes queued outbound messages back
//! out. Neither loop ever touches entity state.
//!
//! Incomplete trailing frames are carried across drains in a per-connection
//! accumulator instead of being dropped at the iteration boundary; see
//! DESIGN.md for the rationale behind that deviation.

use crate::connection::{ConnectionShared, ConnectionId, QUEUE_CAPACITY};
use crate::utils::get_timestamp;
use log::{debug, error, info, warn};
use shared::protocol::{complete_frame_len, decode_client};
use shared::ClientMessage;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Twice the largest legal frame (u16 body plus header); more accumulated
/// undecoded bytes than this means the peer is flooding, not fragmenting.
const READ_BUFFER_LIMIT: usize = 2 * (u16::MAX as usize + 3);

/// Tunables for the connection loops.
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    /// Silence longer than this marks a connection broken.
    pub liveness_timeout: Duration,
    /// Period of the I/O loop.
    pub poll_interval: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// Cross-loop handoff state: staged connection lists and the stop flag.
///
/// Each staged list has its own lock, held only for the push or the swap.
/// "Stop" is a plain flag every loop polls once per iteration; shutdown is
/// cooperative, not instantaneous.
pub struct NetHub {
    staged_io: Mutex<Vec<NetConnection>>,
    staged_world: Mutex<Vec<Arc<ConnectionShared>>>,
    next_conn_id: AtomicU64,
    stop: AtomicBool,
}

impl NetHub {
    pub fn new() -> Self {
        Self {
            staged_io: Mutex::new(Vec::new()),
            staged_world: Mutex::new(Vec::new()),
            next_conn_id: AtomicU64::new(1),
            stop: AtomicBool::new(false),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Wraps an accepted socket and stages it for both consuming loops.
    pub fn stage_connection(&self, stream: TcpStream, peer: SocketAddr) -> ConnectionId {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(ConnectionShared::new(id, peer, get_timestamp()));
        let conn = NetConnection::new(stream, Arc::clone(&shared));
        if let Ok(mut staged) = self.staged_io.lock() {
            staged.push(conn);
        }
        if let Ok(mut staged) = self.staged_world.lock() {
            staged.push(shared);
        }
        id
    }

    fn take_staged_io(&self) -> Vec<NetConnection> {
        match self.staged_io.try_lock() {
            Ok(mut staged) => staged.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Called by the world loop at the top of each tick. Contention just
    /// delays the handoff one tick.
    pub fn take_staged_world(&self) -> Vec<Arc<ConnectionShared>> {
        match self.staged_world.try_lock() {
            Ok(mut staged) => staged.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for NetHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live socket as the I/O loop sees it: stream, shared queue handle,
/// read accumulator and messages awaiting a free inbound lock.
struct NetConnection {
    stream: TcpStream,
    shared: Arc<ConnectionShared>,
    read_buf: Vec<u8>,
    pending_in: VecDeque<ClientMessage>,
}

impl NetConnection {
    fn new(stream: TcpStream, shared: Arc<ConnectionShared>) -> Self {
        Self {
            stream,
            shared,
            read_buf: Vec::new(),
            pending_in: VecDeque::new(),
        }
    }

    /// Drains all currently available bytes and decodes complete frames.
    fn service_read(&mut self, now_ms: u64) {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    debug!("Connection {} closed by peer", self.shared.id());
                    self.shared.mark_broken();
                    break;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    self.shared.mark_traffic(now_ms);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Read error on connection {}: {}", self.shared.id(), e);
                    self.shared.mark_broken();
                    break;
                }
            }
        }
        self.decode_buffered();
        if self.read_buf.len() > READ_BUFFER_LIMIT {
            warn!(
                "Connection {} accumulated {} undecodable bytes, marking broken",
                self.shared.id(),
                self.read_buf.len()
            );
            self.read_buf.clear();
            self.shared.mark_broken();
            return;
        }
        if !self.pending_in.is_empty() {
            // Missed inbound lock keeps them here until the next iteration.
            self.shared.try_enqueue_inbound(&mut self.pending_in);
        }
        if self.pending_in.len() > QUEUE_CAPACITY {
            warn!(
                "Connection {} backed up {} undelivered messages, marking broken",
                self.shared.id(),
                self.pending_in.len()
            );
            self.pending_in.clear();
            self.shared.mark_broken();
        }
    }

    /// Decodes every complete frame in the accumulator; the trailing
    /// partial frame (if any) stays for the next drain.
    fn decode_buffered(&mut self) {
        let mut offset = 0;
        while complete_frame_len(&self.read_buf, offset).is_some() {
            let (result, next) = decode_client(&self.read_buf, offset);
            match result {
                Ok(msg) => self.pending_in.push_back(msg),
                Err(e) => {
                    // Recoverable: drop the one message, resume at the next
                    // nominal offset.
                    warn!("Protocol error on connection {}: {}", self.shared.id(), e);
                }
            }
            offset = next;
        }
        self.read_buf.drain(..offset);
    }

    /// Encodes and sends everything queued, clearing the queue regardless
    /// of success; a failed send marks the connection broken, no retry.
    fn service_write(&mut self) {
        for msg in self.shared.take_outbound() {
            let bytes = shared::encode_server(&msg);
            if let Err(e) = self.write_all_now(&bytes) {
                warn!("Write error on connection {}: {}", self.shared.id(), e);
                self.shared.mark_broken();
                break;
            }
        }
    }

    fn write_all_now(&self, bytes: &[u8]) -> io::Result<()> {
        let mut off = 0;
        while off < bytes.len() {
            match self.stream.try_write(&bytes[off..]) {
                Ok(n) => off += n,
                // An unwritable socket counts as a failed send; nothing
                // gets buffered for retry.
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Probes a silent peer and marks it broken past the timeout.
    fn check_liveness(&mut self, now_ms: u64, timeout: Duration) {
        let silent_for = now_ms.saturating_sub(self.shared.last_comm_ms());
        if silent_for < timeout.as_millis() as u64 {
            return;
        }
        if let Err(e) = self.stream.try_write(&[]) {
            debug!("Liveness probe failed on connection {}: {}", self.shared.id(), e);
        }
        info!(
            "Connection {} ({}) silent for {}ms, marking broken",
            self.shared.id(),
            self.shared.peer(),
            silent_for
        );
        self.shared.mark_broken();
    }
}

/// Accept loop: blocks on accept (with a short timeout so the stop flag
/// gets polled) and stages each new socket.
pub async fn run_listener(listener: TcpListener, hub: Arc<NetHub>) {
    match listener.local_addr() {
        Ok(addr) => info!("Server listening on {}", addr),
        Err(_) => info!("Server listening"),
    }
    while !hub.stopped() {
        match tokio::time::timeout(Duration::from_millis(250), listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                let _ = stream.set_nodelay(true);
                let id = hub.stage_connection(stream, peer);
                info!("Connection {} accepted from {}", id, peer);
            }
            Ok(Err(e)) => {
                error!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(_) => {} // accept timed out; re-check the stop flag
        }
    }
    info!("Listener stopped");
}

/// The connection I/O loop: merge staged sockets, drain reads, flush
/// writes, probe liveness, then run the removal pass outside the
/// active-set iteration.
pub async fn run_io_loop(hub: Arc<NetHub>, cfg: NetConfig) {
    let mut active: Vec<NetConnection> = Vec::new();
    let mut interval = tokio::time::interval(cfg.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while !hub.stopped() {
        interval.tick().await;
        active.extend(hub.take_staged_io());

        let now = get_timestamp();
        for conn in active.iter_mut() {
            if conn.shared.should_drop() {
                continue;
            }
            conn.service_read(now);
            conn.service_write();
            conn.check_liveness(now, cfg.liveness_timeout);
        }

        // Removal pass: shut down broken/forced connections without
        // mutating the set mid-iteration.
        let mut i = 0;
        while i < active.len() {
            if active[i].shared.should_drop() {
                let mut conn = active.remove(i);
                if !conn.shared.is_broken() {
                    // Force-closed but healthy: one final flush so parting
                    // messages (logout text) reach the peer.
                    conn.service_write();
                }
                info!(
                    "Connection {} ({}) closed",
                    conn.shared.id(),
                    conn.shared.peer()
                );
            } else {
                i += 1;
            }
        }
    }
    info!("Connection loop stopped ({} connections dropped)", active.len());
}
