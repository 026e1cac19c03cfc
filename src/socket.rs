//! Sockets, memory accounting, and the process-wide socket table.
//!
//! A [`Socket`] pairs a quota-accounted buffer budget ([`MemQuota`]) with the
//! per-connection engine state from `tcp`. All mutable connection state sits
//! behind one advisory `spin::Mutex` per socket; paths that must never block
//! (packet arrival, timer fires) use `try_lock` and either park the work on
//! the socket's backlog or ask the timer layer to re-arm. Socket identity
//! (addresses, ports) and the fine-timer deadlines live outside the advisory
//! lock so demultiplexing and timer polling never contend with a lock
//! holder. Blocking application calls suspend through pluggable
//! [`WaitHooks`]; the crate itself never parks a thread.
//!
//! Inbound flow:
//!
//! ```text
//! ip_input -> transport_input -> (demux by protocol + endpoints)
//!     TCP:  try_lock --ok--> process segment, drain backlog
//!                 \--busy--> push onto backlog (drained by lock holder)
//!     UDP:  charge recv quota, enqueue datagram, wake readers
//! ```

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::{Mutex, Once, RwLock};

use crate::buffer::SharedPacket;
use crate::config::{config, StackConfig};
use crate::ipv4::{Ipv4Addr, Ipv4Proto};
use crate::tcp::{
    ack_sent, ack_timing, apply_sack_blocks, build_tcp_segment, generate_isn, handle_ack,
    next_probe_interval, next_retransmit_candidate, on_retransmit_timeout, parse_tcp_header,
    parse_tcp_options, seq_ge, seq_gt, seq_le, tcp_stats, update_congestion_control,
    validate_cwnd_after_idle, verify_tcp_checksum, window_opened, zero_window_probe, AckTiming,
    CongestionAction, RtoDisposition, SendSegment, TcpControlBlock, TcpConnKey, TcpHeader,
    TcpState, TCP_DEFAULT_WINDOW, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_SYN,
};
use crate::timer::{self, SweepKind, TimerKind, TimerSet};

/// Fixed per-segment accounting overhead beyond the payload bytes.
pub const SEGMENT_OVERHEAD: usize = core::mem::size_of::<SendSegment>();

// ============================================================================
// Memory Accounting
// ============================================================================

/// Accounting direction for a charged buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemDirection {
    /// Send-side (queued for transmission or awaiting ACK)
    Send,
    /// Receive-side (delivered, not yet consumed)
    Recv,
}

/// Per-socket byte quota, one counter per direction.
///
/// A non-forced charge fails when it would push the counter past the quota.
/// Forced charges always succeed so control segments are never dropped for
/// memory reasons; the counter may then temporarily exceed the quota.
#[derive(Debug)]
pub struct MemQuota {
    send_charged: AtomicUsize,
    recv_charged: AtomicUsize,
    send_quota: usize,
    recv_quota: usize,
}

impl MemQuota {
    /// Create a quota with the given per-direction budgets.
    pub fn new(send_quota: usize, recv_quota: usize) -> Self {
        Self {
            send_charged: AtomicUsize::new(0),
            recv_charged: AtomicUsize::new(0),
            send_quota,
            recv_quota,
        }
    }

    #[inline]
    fn counter(&self, dir: MemDirection) -> &AtomicUsize {
        match dir {
            MemDirection::Send => &self.send_charged,
            MemDirection::Recv => &self.recv_charged,
        }
    }

    /// The configured budget for a direction.
    #[inline]
    pub fn quota(&self, dir: MemDirection) -> usize {
        match dir {
            MemDirection::Send => self.send_quota,
            MemDirection::Recv => self.recv_quota,
        }
    }

    /// Bytes currently charged in a direction.
    #[inline]
    pub fn charged(&self, dir: MemDirection) -> usize {
        self.counter(dir).load(Ordering::Acquire)
    }

    /// Charge `truesize` bytes. Returns `false` (and charges nothing) when
    /// the charge would exceed the quota and `force` is not set.
    pub fn charge(&self, truesize: usize, dir: MemDirection, force: bool) -> bool {
        let counter = self.counter(dir);
        let quota = self.quota(dir);
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(truesize);
            if !force && next > quota {
                return false;
            }
            match counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release a previous charge. Must be called exactly once per charged
    /// buffer.
    pub fn uncharge(&self, truesize: usize, dir: MemDirection) {
        let counter = self.counter(dir);
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Relaxed, |cur| {
            Some(cur.saturating_sub(truesize))
        });
    }

    /// Send side has drained to the low-water mark; blocked writers are
    /// worth waking.
    #[inline]
    pub fn send_space_open(&self) -> bool {
        self.charged(MemDirection::Send) <= self.send_quota / 2
    }
}

// ============================================================================
// Wait Queues
// ============================================================================

/// Why a blocked operation resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited condition may now hold; re-check and proceed.
    Woken,
    /// The caller's timeout elapsed first.
    TimedOut,
    /// The socket was closed while waiting.
    Closed,
    /// Externally interrupted (signal-equivalent). Never silently retried.
    Interrupted,
}

/// Which condition a caller is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitChannel {
    /// Data, a connection to accept, EOF, or an error is available.
    Readable,
    /// Send-side quota space, or connection establishment.
    Writable,
}

/// Embedder-supplied blocking primitive.
///
/// The stack never parks a thread itself; `wait` suspends the caller until
/// `wake` is called for the same socket and channel (or the timeout runs
/// out). Spurious wakeups are fine; callers re-check their condition.
pub trait WaitHooks: Send + Sync {
    /// Suspend until woken. `timeout_ms` of `None` means wait indefinitely.
    fn wait(&self, socket: SocketId, channel: WaitChannel, timeout_ms: Option<u64>) -> WaitOutcome;
    /// Wake all waiters on `channel`.
    fn wake(&self, socket: SocketId, channel: WaitChannel);
}

static WAIT_HOOKS: Once<&'static dyn WaitHooks> = Once::new();

/// Register the blocking hooks. Only the first registration takes effect;
/// returns `false` on later calls.
pub fn register_wait_hooks(hooks: &'static dyn WaitHooks) -> bool {
    let mut first = false;
    WAIT_HOOKS.call_once(|| {
        first = true;
        hooks
    });
    first
}

#[inline]
fn wait_hooks() -> Option<&'static dyn WaitHooks> {
    WAIT_HOOKS.get().copied()
}

/// Per-socket waiter bookkeeping; wake calls are skipped when nobody waits.
#[derive(Debug)]
struct WaitQueue {
    readers: AtomicUsize,
    writers: AtomicUsize,
}

impl WaitQueue {
    const fn new() -> Self {
        Self {
            readers: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
        }
    }

    fn counter(&self, channel: WaitChannel) -> &AtomicUsize {
        match channel {
            WaitChannel::Readable => &self.readers,
            WaitChannel::Writable => &self.writers,
        }
    }
}

// ============================================================================
// Socket Errors
// ============================================================================

/// Socket-level errors surfaced to the application.
///
/// Resource exhaustion (`NoBufferSpace`) is always recoverable and never
/// discards already-accepted data. Hard errors (`ConnectionReset`,
/// `TimedOut`, `ConnectionRefused`) are posted to the pending-error slot and
/// consumed exactly once. Policy violations (`Shutdown`, `InvalidState`,
/// `Unsupported`) are returned synchronously with no state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// Quota exhausted; retry after the peer drains the queue
    NoBufferSpace,
    /// Peer sent RST on an established connection
    ConnectionReset,
    /// Peer refused the connection attempt
    ConnectionRefused,
    /// Retry or keepalive ceiling exceeded
    TimedOut,
    /// Operation needs an established connection
    NotConnected,
    /// Operation is invalid in the current state
    InvalidState,
    /// Write after shutdown of the send side
    Shutdown,
    /// Local address/port is taken
    AddressInUse,
    /// Would block and the socket is non-blocking (or no wait hooks exist)
    WouldBlock,
    /// Blocking call interrupted externally
    Interrupted,
    /// No such socket
    BadDescriptor,
    /// Operation not supported for this protocol
    Unsupported,
}

/// Result type for socket operations
pub type SocketResult<T> = Result<T, SocketError>;

/// Soft, non-fatal advisories recorded opportunistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftError {
    /// Repeated retransmissions suggest the path is degrading
    PathDegraded,
    /// Peer closed its receive window for an extended period
    PeerStalled,
}

// ============================================================================
// Socket Identity and Options
// ============================================================================

/// Opaque socket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(pub u32);

/// Transport protocol of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Stream socket
    Tcp,
    /// Datagram socket
    Udp,
}

/// Local and remote addressing for a socket. Kept outside the advisory
/// lock so the demux path can match without contending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    /// Local address (0.0.0.0 until bound)
    pub local_ip: Ipv4Addr,
    /// Local port (0 until bound)
    pub local_port: u16,
    /// Remote address for connected sockets
    pub remote_ip: Ipv4Addr,
    /// Remote port for connected sockets
    pub remote_port: u16,
}

impl Endpoints {
    const fn unbound() -> Self {
        Self {
            local_ip: Ipv4Addr::UNSPECIFIED,
            local_port: 0,
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
        }
    }

    /// The connection key for these endpoints.
    pub fn key(&self) -> TcpConnKey {
        TcpConnKey::new(
            self.local_ip,
            self.local_port,
            self.remote_ip,
            self.remote_port,
        )
    }
}

/// Which half of the connection `shutdown` affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    /// No further reads; queued data still drains, then EOF
    Read,
    /// No further writes; a FIN is sent once queued data is acknowledged
    Write,
    /// Both directions
    Both,
}

/// Socket options settable through `set_option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Non-blocking mode: operations that would block return `WouldBlock`
    NonBlocking(bool),
    /// Enable the keepalive sweep for this connection
    KeepAlive(bool),
}

// ============================================================================
// Socket Statistics
// ============================================================================

/// Per-socket counters.
#[derive(Debug)]
pub struct SocketStats {
    /// Payload bytes accepted from the application
    pub bytes_sent: AtomicU64,
    /// Payload bytes handed to the application
    pub bytes_received: AtomicU64,
    /// Segments/datagrams received for this socket
    pub segments_received: AtomicU64,
    /// Inbound data dropped against a full receive quota
    pub rx_dropped_quota: AtomicU64,
}

impl SocketStats {
    /// Create zeroed counters
    pub const fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            segments_received: AtomicU64::new(0),
            rx_dropped_quota: AtomicU64::new(0),
        }
    }
}

/// Table-wide counters.
#[derive(Debug)]
pub struct SocketTableStats {
    /// Segments parked on a backlog because the socket lock was held
    pub backlog_queued: AtomicU64,
    /// Segments later drained from backlogs
    pub backlog_drained: AtomicU64,
    /// Inbound packets with no matching socket
    pub demux_misses: AtomicU64,
    /// Segments dropped for bad checksums or malformed headers
    pub malformed_drops: AtomicU64,
    /// Connections force-closed by timer policy
    pub timer_closes: AtomicU64,
    /// Sweep visits skipped because the socket lock was held
    pub sweep_skips: AtomicU64,
}

impl SocketTableStats {
    /// Create zeroed counters
    pub const fn new() -> Self {
        Self {
            backlog_queued: AtomicU64::new(0),
            backlog_drained: AtomicU64::new(0),
            demux_misses: AtomicU64::new(0),
            malformed_drops: AtomicU64::new(0),
            timer_closes: AtomicU64::new(0),
            sweep_skips: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// Listening State
// ============================================================================

/// One half-open (SYN received, handshake incomplete) connection attempt.
#[derive(Debug, Clone)]
pub struct HalfOpenConn {
    /// Connection 4-tuple
    pub key: TcpConnKey,
    /// Our chosen ISN (the SYN-ACK carries it)
    pub iss: u32,
    /// Peer's ISN from the SYN
    pub irs: u32,
    /// SYN-ACK retransmissions so far
    pub retries: u8,
    /// Current retry interval; doubles up to the configured cap
    pub retry_interval_ms: u64,
    /// Deadline for the next retransmission
    pub next_retry_at: u64,
}

/// Per-listener queues: half-open attempts and fully established
/// connections awaiting `accept`.
#[derive(Debug)]
pub struct TcpListenState {
    /// Half-open attempts, visited by the SYN-RECV retry sweep
    pub syn_queue: VecDeque<HalfOpenConn>,
    /// Established connections not yet accepted
    pub accept_queue: VecDeque<SocketId>,
}

impl TcpListenState {
    fn new() -> Self {
        Self {
            syn_queue: VecDeque::new(),
            accept_queue: VecDeque::new(),
        }
    }
}

// ============================================================================
// Socket
// ============================================================================

/// A segment parked while the socket lock was held.
#[derive(Debug)]
struct BacklogPacket {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    segment: Vec<u8>,
    received_at: u64,
}

/// Mutable connection state behind the advisory lock.
pub struct SocketInner {
    /// TCP engine state; `None` for datagram sockets and unconnected stubs
    pub tcb: Option<TcpControlBlock>,
    /// Listener queues; `Some` only after `listen`
    pub listen: Option<TcpListenState>,
    /// Datagram receive queue (UDP): source address, source port, payload
    pub rx_queue: VecDeque<(Ipv4Addr, u16, SharedPacket)>,
    /// Next sequence number not yet handed to the wire
    pub next_to_send: u32,
    /// Sequence number consumed by our FIN, once queued
    pub fin_seq: Option<u32>,
    /// Read side shut down
    pub shut_rd: bool,
    /// Write side shut down
    pub shut_wr: bool,
    /// Keepalive sweep membership
    pub keepalive: bool,
}

/// A socket: identity, accounting, queues, and engine state.
pub struct Socket {
    /// Handle
    pub id: SocketId,
    /// Transport protocol
    pub protocol: Protocol,
    /// Byte quotas and charged counters
    pub quota: Arc<MemQuota>,
    /// Counters
    pub stats: SocketStats,
    /// Addressing, readable without the advisory lock
    endpoints: RwLock<Endpoints>,
    /// Fine timer deadlines, pollable without the advisory lock
    pub timers: Mutex<TimerSet>,
    /// Advisory lock over all mutable connection state
    inner: Mutex<SocketInner>,
    /// Segments awaiting the lock, drained in arrival order
    backlog: Mutex<VecDeque<BacklogPacket>>,
    /// Hard error, consumed exactly once
    pending_error: Mutex<Option<SocketError>>,
    /// Soft advisory, surfaced opportunistically
    soft_error: Mutex<Option<SoftError>>,
    /// Waiter bookkeeping
    waiters: WaitQueue,
    /// Listener flag for lock-free demux
    listening: AtomicBool,
    /// Application handle closed; the table entry goes away once the
    /// teardown handshake completes
    detached: AtomicBool,
    /// Non-blocking mode
    nonblocking: AtomicBool,
}

impl Socket {
    fn new(id: SocketId, protocol: Protocol, send_quota: usize, recv_quota: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            protocol,
            quota: Arc::new(MemQuota::new(send_quota, recv_quota)),
            stats: SocketStats::new(),
            endpoints: RwLock::new(Endpoints::unbound()),
            timers: Mutex::new(TimerSet::new()),
            inner: Mutex::new(SocketInner {
                tcb: None,
                listen: None,
                rx_queue: VecDeque::new(),
                next_to_send: 0,
                fin_seq: None,
                shut_rd: false,
                shut_wr: false,
                keepalive: false,
            }),
            backlog: Mutex::new(VecDeque::new()),
            pending_error: Mutex::new(None),
            soft_error: Mutex::new(None),
            waiters: WaitQueue::new(),
            listening: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            nonblocking: AtomicBool::new(false),
        })
    }

    /// Current addressing.
    #[inline]
    pub fn endpoints(&self) -> Endpoints {
        *self.endpoints.read()
    }

    fn set_endpoints(&self, f: impl FnOnce(&mut Endpoints)) {
        f(&mut self.endpoints.write());
    }

    /// Non-blocking mode is set
    #[inline]
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Relaxed)
    }

    /// Socket is a listener
    #[inline]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Take the pending hard error, clearing the slot. The first caller
    /// gets it; later callers see `None`.
    pub fn take_error(&self) -> Option<SocketError> {
        self.pending_error.lock().take()
    }

    /// Take the soft advisory, if one is recorded.
    pub fn take_soft_error(&self) -> Option<SoftError> {
        self.soft_error.lock().take()
    }

    /// Post a hard error: first poster wins, timers are cleared before the
    /// state transition so nothing fires afterwards, waiters wake.
    pub fn post_hard_error(&self, inner: &mut SocketInner, err: SocketError) {
        {
            let mut slot = self.pending_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.timers.lock().cancel_all();
        if inner.keepalive {
            inner.keepalive = false;
            timer::sweep_unref(SweepKind::Keepalive);
        }
        if let Some(tcb) = inner.tcb.as_mut() {
            tcb.state = TcpState::Closed;
        }
        self.wake(WaitChannel::Readable);
        self.wake(WaitChannel::Writable);
    }

    /// Record a soft advisory without disturbing the connection.
    pub fn post_soft_error(&self, err: SoftError) {
        let mut slot = self.soft_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Wake waiters on a channel, if any.
    pub fn wake(&self, channel: WaitChannel) {
        if self.waiters.counter(channel).load(Ordering::Acquire) > 0 {
            if let Some(hooks) = wait_hooks() {
                hooks.wake(self.id, channel);
            }
        }
    }

    /// Block on a channel. `None` means no hooks are registered and the
    /// caller must fail with `WouldBlock`.
    fn wait(&self, channel: WaitChannel, timeout_ms: Option<u64>) -> Option<WaitOutcome> {
        let hooks = wait_hooks()?;
        let counter = self.waiters.counter(channel);
        counter.fetch_add(1, Ordering::AcqRel);
        let outcome = hooks.wait(self.id, channel, timeout_ms);
        counter.fetch_sub(1, Ordering::AcqRel);
        Some(outcome)
    }

    /// Run `f` under the advisory lock, then drain any backlog that piled
    /// up while it was held.
    pub fn with_inner<R>(self: &Arc<Self>, f: impl FnOnce(&mut SocketInner) -> R) -> R {
        let mut guard = self.inner.lock();
        let result = f(&mut guard);
        drain_backlog(self, &mut guard);
        result
    }

    /// Try to take the advisory lock without blocking.
    fn try_inner(&self) -> Option<spin::MutexGuard<'_, SocketInner>> {
        self.inner.try_lock()
    }
}

fn drain_backlog(sock: &Arc<Socket>, inner: &mut SocketInner) {
    loop {
        let pkt = {
            let mut backlog = sock.backlog.lock();
            match backlog.pop_front() {
                Some(p) => p,
                None => return,
            }
        };
        socket_table()
            .stats
            .backlog_drained
            .fetch_add(1, Ordering::Relaxed);
        process_tcp_segment(sock, inner, pkt.src, pkt.dst, &pkt.segment, pkt.received_at);
    }
}

// ============================================================================
// Socket Table
// ============================================================================

/// Process-wide socket registry and POSIX-like entry points.
pub struct SocketTable {
    sockets: RwLock<BTreeMap<SocketId, Arc<Socket>>>,
    next_id: AtomicU32,
    /// Table-wide counters
    pub stats: SocketTableStats,
}

impl SocketTable {
    const fn new() -> Self {
        Self {
            sockets: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            stats: SocketTableStats::new(),
        }
    }

    /// Create a socket with the configured default quotas.
    pub fn socket(&self, protocol: Protocol) -> SocketId {
        let cfg = config();
        self.socket_with_quotas(protocol, cfg.send_quota, cfg.recv_quota)
    }

    /// Create a socket with explicit per-direction quotas.
    pub fn socket_with_quotas(
        &self,
        protocol: Protocol,
        send_quota: usize,
        recv_quota: usize,
    ) -> SocketId {
        let id = SocketId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sock = Socket::new(id, protocol, send_quota, recv_quota);
        self.sockets.write().insert(id, sock);
        id
    }

    /// Look up a socket by handle.
    pub fn get(&self, id: SocketId) -> SocketResult<Arc<Socket>> {
        self.sockets
            .read()
            .get(&id)
            .cloned()
            .ok_or(SocketError::BadDescriptor)
    }

    /// All sockets, for sweep iteration.
    pub fn snapshot(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().values().cloned().collect()
    }

    /// Number of live sockets.
    pub fn len(&self) -> usize {
        self.sockets.read().len()
    }

    /// True when no sockets exist.
    pub fn is_empty(&self) -> bool {
        self.sockets.read().is_empty()
    }

    /// Bind a local address and port, rejecting duplicates within the same
    /// protocol.
    pub fn bind(&self, id: SocketId, ip: Ipv4Addr, port: u16) -> SocketResult<()> {
        let sock = self.get(id)?;
        let taken = self.snapshot().into_iter().any(|other| {
            if other.id == id || other.protocol != sock.protocol {
                return false;
            }
            let ep = other.endpoints();
            ep.local_port == port && (ep.local_ip == ip || ep.local_ip.is_unspecified())
        });
        if taken {
            return Err(SocketError::AddressInUse);
        }
        sock.set_endpoints(|ep| {
            ep.local_ip = ip;
            ep.local_port = port;
        });
        Ok(())
    }

    /// Start an active open. Blocks until established unless non-blocking.
    pub fn connect(&self, id: SocketId, ip: Ipv4Addr, port: u16) -> SocketResult<()> {
        let sock = self.get(id)?;
        if sock.protocol == Protocol::Udp {
            // Datagram connect just pins the default peer
            sock.set_endpoints(|ep| {
                ep.remote_ip = ip;
                ep.remote_port = port;
            });
            return Ok(());
        }

        let cfg = config();
        let now = crate::now_ms();
        sock.set_endpoints(|ep| {
            if ep.local_port == 0 {
                ep.local_port = ephemeral_port();
            }
            ep.remote_ip = ip;
            ep.remote_port = port;
        });
        let ep = sock.endpoints();

        sock.with_inner(|inner| {
            if inner.tcb.is_some() {
                return Err(SocketError::InvalidState);
            }
            let iss = generate_isn(ep.local_ip, ep.local_port, ip, port);
            let mut tcb =
                TcpControlBlock::new_client(ep.local_ip, ep.local_port, ip, port, iss, cfg);
            tcb.state = TcpState::SynSent;
            tcb.snd_nxt = iss.wrapping_add(1);
            inner.next_to_send = tcb.snd_nxt;

            transmit_flags(&ep, iss, 0, TCP_FLAG_SYN, TCP_DEFAULT_WINDOW, &[]);
            let rto = tcb.rto_ms;
            inner.tcb = Some(tcb);
            sock.timers.lock().arm(TimerKind::Retransmit, now + rto);
            Ok(())
        })?;

        loop {
            if let Some(err) = sock.take_error() {
                return Err(err);
            }
            let established = sock.with_inner(|inner| {
                inner
                    .tcb
                    .as_ref()
                    .map(|t| t.state == TcpState::Established)
                    .unwrap_or(false)
            });
            if established {
                return Ok(());
            }
            if sock.is_nonblocking() {
                return Err(SocketError::WouldBlock);
            }
            match sock.wait(WaitChannel::Writable, None) {
                None => return Err(SocketError::WouldBlock),
                Some(WaitOutcome::Interrupted) => return Err(SocketError::Interrupted),
                Some(WaitOutcome::Closed) => return Err(SocketError::NotConnected),
                Some(WaitOutcome::TimedOut) => return Err(SocketError::TimedOut),
                Some(WaitOutcome::Woken) => continue,
            }
        }
    }

    /// Mark a bound TCP socket as listening.
    pub fn listen(&self, id: SocketId) -> SocketResult<()> {
        let sock = self.get(id)?;
        if sock.protocol != Protocol::Tcp {
            return Err(SocketError::Unsupported);
        }
        if sock.endpoints().local_port == 0 {
            return Err(SocketError::InvalidState);
        }
        sock.with_inner(|inner| {
            if inner.tcb.is_some() {
                return Err(SocketError::InvalidState);
            }
            if inner.listen.is_none() {
                inner.listen = Some(TcpListenState::new());
                sock.listening.store(true, Ordering::Release);
                timer::sweep_ref(SweepKind::SynRetry);
            }
            Ok(())
        })
    }

    /// Accept an established connection. Blocks unless non-blocking.
    pub fn accept(&self, id: SocketId) -> SocketResult<SocketId> {
        let sock = self.get(id)?;
        loop {
            if let Some(err) = sock.take_error() {
                return Err(err);
            }
            let ready = sock.with_inner(|inner| {
                let listen = inner.listen.as_mut().ok_or(SocketError::InvalidState)?;
                Ok(listen.accept_queue.pop_front())
            })?;
            if let Some(conn) = ready {
                return Ok(conn);
            }
            if sock.is_nonblocking() {
                return Err(SocketError::WouldBlock);
            }
            match sock.wait(WaitChannel::Readable, None) {
                None => return Err(SocketError::WouldBlock),
                Some(WaitOutcome::Interrupted) => return Err(SocketError::Interrupted),
                Some(WaitOutcome::Closed) => return Err(SocketError::NotConnected),
                Some(WaitOutcome::TimedOut) => return Err(SocketError::TimedOut),
                Some(WaitOutcome::Woken) => continue,
            }
        }
    }

    /// Queue data for transmission. Returns the number of bytes accepted;
    /// blocks for quota space unless non-blocking.
    pub fn send(&self, id: SocketId, data: &[u8]) -> SocketResult<usize> {
        let sock = self.get(id)?;
        if data.is_empty() {
            return Ok(0);
        }
        if sock.protocol == Protocol::Udp {
            return udp_send(&sock, data);
        }

        let mut offset = 0;
        loop {
            if let Some(err) = sock.take_error() {
                return Err(err);
            }
            let accepted = sock.with_inner(|inner| tcp_queue_data(&sock, inner, &data[offset..]))?;
            offset += accepted;
            if offset == data.len() {
                sock.stats
                    .bytes_sent
                    .fetch_add(offset as u64, Ordering::Relaxed);
                return Ok(offset);
            }
            if sock.is_nonblocking() {
                if offset == 0 {
                    return Err(SocketError::NoBufferSpace);
                }
                sock.stats
                    .bytes_sent
                    .fetch_add(offset as u64, Ordering::Relaxed);
                return Ok(offset);
            }
            match sock.wait(WaitChannel::Writable, None) {
                None => {
                    if offset == 0 {
                        return Err(SocketError::NoBufferSpace);
                    }
                    sock.stats
                        .bytes_sent
                        .fetch_add(offset as u64, Ordering::Relaxed);
                    return Ok(offset);
                }
                Some(WaitOutcome::Interrupted) => return Err(SocketError::Interrupted),
                Some(WaitOutcome::Closed) => return Err(SocketError::NotConnected),
                Some(WaitOutcome::TimedOut) => return Err(SocketError::TimedOut),
                Some(WaitOutcome::Woken) => continue,
            }
        }
    }

    /// Receive into `buf`. Returns 0 at end-of-stream. Blocks for data
    /// unless non-blocking.
    pub fn recv(&self, id: SocketId, buf: &mut [u8]) -> SocketResult<usize> {
        let sock = self.get(id)?;
        loop {
            if let Some(err) = sock.take_error() {
                return Err(err);
            }
            let outcome = sock.with_inner(|inner| match sock.protocol {
                Protocol::Tcp => tcp_drain_recv(&sock, inner, buf),
                Protocol::Udp => udp_drain_recv(inner, buf),
            })?;
            if let Some(n) = outcome {
                sock.stats
                    .bytes_received
                    .fetch_add(n as u64, Ordering::Relaxed);
                return Ok(n);
            }
            if sock.is_nonblocking() {
                return Err(SocketError::WouldBlock);
            }
            match sock.wait(WaitChannel::Readable, None) {
                None => return Err(SocketError::WouldBlock),
                Some(WaitOutcome::Interrupted) => return Err(SocketError::Interrupted),
                Some(WaitOutcome::Closed) => return Ok(0),
                Some(WaitOutcome::TimedOut) => return Err(SocketError::TimedOut),
                Some(WaitOutcome::Woken) => continue,
            }
        }
    }

    /// Shut down one or both directions.
    pub fn shutdown(&self, id: SocketId, how: ShutdownHow) -> SocketResult<()> {
        let sock = self.get(id)?;
        sock.with_inner(|inner| {
            match how {
                ShutdownHow::Read => inner.shut_rd = true,
                ShutdownHow::Write => shutdown_write(&sock, inner),
                ShutdownHow::Both => {
                    inner.shut_rd = true;
                    shutdown_write(&sock, inner);
                }
            }
            Ok(())
        })
    }

    /// Set a socket option.
    pub fn set_option(&self, id: SocketId, option: SocketOption) -> SocketResult<()> {
        let sock = self.get(id)?;
        match option {
            SocketOption::NonBlocking(enabled) => {
                sock.nonblocking.store(enabled, Ordering::Relaxed);
                Ok(())
            }
            SocketOption::KeepAlive(enabled) => {
                if sock.protocol != Protocol::Tcp {
                    return Err(SocketError::Unsupported);
                }
                sock.with_inner(|inner| {
                    if inner.keepalive != enabled {
                        inner.keepalive = enabled;
                        if enabled {
                            timer::sweep_ref(SweepKind::Keepalive);
                        } else {
                            timer::sweep_unref(SweepKind::Keepalive);
                        }
                    }
                });
                Ok(())
            }
        }
    }

    /// Close a socket: send a FIN where the state calls for one. The table
    /// entry disappears immediately unless a teardown handshake is in
    /// flight, in which case it lingers until that completes.
    pub fn close(&self, id: SocketId) -> SocketResult<()> {
        let sock = self.get(id)?;
        sock.detached.store(true, Ordering::Release);
        let teardown_pending = sock.with_inner(|inner| {
            if inner.keepalive {
                inner.keepalive = false;
                timer::sweep_unref(SweepKind::Keepalive);
            }
            if inner.listen.take().is_some() {
                sock.listening.store(false, Ordering::Release);
                timer::sweep_unref(SweepKind::SynRetry);
            }
            if let Some(state) = inner.tcb.as_ref().map(|t| t.state) {
                match state {
                    TcpState::Established => {
                        if let Some(tcb) = inner.tcb.as_mut() {
                            tcb.state = TcpState::FinWait1;
                        }
                        queue_fin(&sock, inner);
                    }
                    TcpState::CloseWait => {
                        if let Some(tcb) = inner.tcb.as_mut() {
                            tcb.state = TcpState::LastAck;
                        }
                        queue_fin(&sock, inner);
                    }
                    TcpState::SynSent | TcpState::SynReceived => {
                        if let Some(tcb) = inner.tcb.as_mut() {
                            tcb.state = TcpState::Closed;
                        }
                        sock.timers.lock().cancel_all();
                    }
                    _ => {}
                }
            }
            matches!(
                inner.tcb.as_ref().map(|t| t.state),
                Some(TcpState::FinWait1)
                    | Some(TcpState::FinWait2)
                    | Some(TcpState::Closing)
                    | Some(TcpState::LastAck)
            )
        });
        sock.wake(WaitChannel::Readable);
        sock.wake(WaitChannel::Writable);
        if !teardown_pending {
            self.sockets.write().remove(&id);
        }
        Ok(())
    }
}

static SOCKET_TABLE: Once<SocketTable> = Once::new();

/// Get the process-wide socket table.
#[inline]
pub fn socket_table() -> &'static SocketTable {
    SOCKET_TABLE.call_once(SocketTable::new)
}

static EPHEMERAL_PORT: AtomicU32 = AtomicU32::new(49152);

fn ephemeral_port() -> u16 {
    let raw = EPHEMERAL_PORT.fetch_add(1, Ordering::Relaxed);
    (49152 + (raw - 49152) % 16384) as u16
}

// ============================================================================
// TCP Send Path
// ============================================================================

/// Queue application bytes as MSS-sized segments, charging the send quota
/// per segment. Stops (without error) at the first failed charge; a zero
/// return against a full quota is the caller's cue to block or fail.
fn tcp_queue_data(
    sock: &Arc<Socket>,
    inner: &mut SocketInner,
    data: &[u8],
) -> SocketResult<usize> {
    if inner.shut_wr {
        return Err(SocketError::Shutdown);
    }
    let now = crate::now_ms();
    let ep = sock.endpoints();
    let queued = {
        let tcb = inner.tcb.as_mut().ok_or(SocketError::NotConnected)?;
        if !tcb.state.can_send() {
            return Err(SocketError::NotConnected);
        }
        validate_cwnd_after_idle(tcb, now);

        let mss = (tcb.snd_mss as usize).max(1);
        let mut queued = 0;
        for chunk in data.chunks(mss) {
            let mut chunk = chunk;
            let truesize = chunk.len() + SEGMENT_OVERHEAD;
            let mut last = false;
            if !sock.quota.charge(truesize, MemDirection::Send, false) {
                // A full chunk no longer fits; a truncated tail segment may
                // still occupy the remaining quota
                let headroom = sock
                    .quota
                    .quota(MemDirection::Send)
                    .saturating_sub(sock.quota.charged(MemDirection::Send));
                let tail = headroom.saturating_sub(SEGMENT_OVERHEAD).min(chunk.len());
                if tail == 0
                    || !sock
                        .quota
                        .charge(tail + SEGMENT_OVERHEAD, MemDirection::Send, false)
                {
                    break;
                }
                chunk = &chunk[..tail];
                last = true;
            }
            tcb.send_buffer.push_back(SendSegment {
                seq: tcb.snd_nxt,
                data: chunk.to_vec(),
                sent_at: now,
                retrans_count: 0,
                sacked: false,
            });
            tcb.snd_nxt = tcb.snd_nxt.wrapping_add(chunk.len() as u32);
            queued += chunk.len();
            if last {
                break;
            }
        }
        queued
    };

    if queued > 0 {
        tcp_output(&ep, inner, now);
        let rto = inner.tcb.as_ref().map(|t| t.rto_ms).unwrap_or(0);
        let mut timers = sock.timers.lock();
        if !timers.is_armed(TimerKind::Retransmit) {
            timers.arm(TimerKind::Retransmit, now + rto);
        }
    }
    Ok(queued)
}

/// Transmit queued segments allowed by the effective send window.
fn tcp_output(ep: &Endpoints, inner: &mut SocketInner, now: u64) {
    let fin_seq = inner.fin_seq;
    let sent_upto_in = inner.next_to_send;
    let sent_upto_out = {
        let tcb = match inner.tcb.as_mut() {
            Some(t) => t,
            None => return,
        };
        let mut budget = tcb.send_window_available() as usize;
        let mut sent_upto = sent_upto_in;
        let window = tcb.rcv_wnd.min(u16::MAX as u32) as u16;
        let ack = tcb.rcv_nxt;
        let mut sent_any = false;

        for seg in tcb.send_buffer.iter_mut() {
            if crate::tcp::seq_lt(seg.seq, sent_upto) {
                continue;
            }
            if seg.data.len() > budget && !seg.data.is_empty() {
                break;
            }
            let mut flags = TCP_FLAG_ACK;
            if fin_seq == Some(seg.seq) {
                flags |= TCP_FLAG_FIN;
            }
            transmit_flags(ep, seg.seq, ack, flags, window, &seg.data);
            seg.sent_at = now;
            budget = budget.saturating_sub(seg.data.len());
            sent_upto = seg.end_seq().wrapping_add(if fin_seq == Some(seg.seq) { 1 } else { 0 });
            sent_any = true;
        }
        if sent_any {
            ack_sent(tcb);
            tcb.last_activity = now;
        }
        sent_upto
    };
    inner.next_to_send = sent_upto_out;
}

/// Send one previously unsent segment on a duplicate ACK (RFC 3042
/// limited transmit). The congestion budget is bypassed for this single
/// segment; the peer window still binds.
fn limited_transmit_output(ep: &Endpoints, inner: &mut SocketInner, now: u64) {
    let fin_seq = inner.fin_seq;
    let sent_upto_in = inner.next_to_send;
    let sent_upto_out = {
        let tcb = match inner.tcb.as_mut() {
            Some(t) => t,
            None => return,
        };
        let window = tcb.rcv_wnd.min(u16::MAX as u32) as u16;
        let ack = tcb.rcv_nxt;
        let snd_una = tcb.snd_una;
        let snd_wnd = tcb.snd_wnd;
        let mut sent_upto = sent_upto_in;
        if let Some(seg) = tcb
            .send_buffer
            .iter_mut()
            .find(|s| !crate::tcp::seq_lt(s.seq, sent_upto_in))
        {
            let end_offset = seg.end_seq().wrapping_sub(snd_una);
            if end_offset <= snd_wnd {
                let mut flags = TCP_FLAG_ACK;
                if fin_seq == Some(seg.seq) {
                    flags |= TCP_FLAG_FIN;
                }
                transmit_flags(ep, seg.seq, ack, flags, window, &seg.data);
                seg.sent_at = now;
                sent_upto = seg
                    .end_seq()
                    .wrapping_add(if fin_seq == Some(seg.seq) { 1 } else { 0 });
            }
        }
        if sent_upto != sent_upto_in {
            ack_sent(tcb);
            tcb.last_activity = now;
        }
        sent_upto
    };
    inner.next_to_send = sent_upto_out;
}

/// Build and transmit a bare segment for these endpoints.
fn transmit_flags(ep: &Endpoints, seq: u32, ack: u32, flags: u8, window: u16, payload: &[u8]) {
    tcp_stats().tx_segments.fetch_add(1, Ordering::Relaxed);
    let wire = build_tcp_segment(
        ep.local_ip,
        ep.remote_ip,
        ep.local_port,
        ep.remote_port,
        seq,
        ack,
        flags,
        window,
        payload,
    );
    let _ = crate::ip_output(ep.local_ip, ep.remote_ip, Ipv4Proto::Tcp as u8, &wire);
}

/// Send the ACK currently owed and clear the delayed-ACK state.
fn send_ack_now(sock: &Socket, inner: &mut SocketInner) {
    let ep = sock.endpoints();
    let (seq, ack, window) = match inner.tcb.as_mut() {
        Some(tcb) => {
            let triple = (
                tcb.snd_nxt,
                tcb.rcv_nxt,
                tcb.rcv_wnd.min(u16::MAX as u32) as u16,
            );
            ack_sent(tcb);
            triple
        }
        None => return,
    };
    transmit_flags(&ep, seq, ack, TCP_FLAG_ACK, window, &[]);
    sock.timers.lock().cancel(TimerKind::DelayedAck);
}

/// Queue a FIN: it occupies one sequence number and rides the
/// retransmission machinery as an empty segment. The charge is forced so
/// closing never fails against a full quota.
fn queue_fin(sock: &Arc<Socket>, inner: &mut SocketInner) {
    let now = crate::now_ms();
    let ep = sock.endpoints();
    let (fin_seq, ack, window, rto) = {
        let tcb = match inner.tcb.as_mut() {
            Some(t) => t,
            None => return,
        };
        if tcb.fin_sent {
            return;
        }
        tcb.fin_sent = true;
        let fin_seq = tcb.snd_nxt;
        sock.quota.charge(SEGMENT_OVERHEAD, MemDirection::Send, true);
        tcb.send_buffer.push_back(SendSegment {
            seq: fin_seq,
            data: Vec::new(),
            sent_at: now,
            retrans_count: 0,
            sacked: false,
        });
        tcb.snd_nxt = fin_seq.wrapping_add(1);
        (
            fin_seq,
            tcb.rcv_nxt,
            tcb.rcv_wnd.min(u16::MAX as u32) as u16,
            tcb.rto_ms,
        )
    };
    inner.fin_seq = Some(fin_seq);

    transmit_flags(&ep, fin_seq, ack, TCP_FLAG_FIN | TCP_FLAG_ACK, window, &[]);
    let mut timers = sock.timers.lock();
    if !timers.is_armed(TimerKind::Retransmit) {
        timers.arm(TimerKind::Retransmit, now + rto);
    }
}

fn shutdown_write(sock: &Arc<Socket>, inner: &mut SocketInner) {
    if inner.shut_wr {
        return;
    }
    inner.shut_wr = true;
    let state = match inner.tcb.as_ref().map(|t| t.state) {
        Some(s) => s,
        None => return,
    };
    match state {
        TcpState::Established => {
            if let Some(tcb) = inner.tcb.as_mut() {
                tcb.state = TcpState::FinWait1;
            }
            queue_fin(sock, inner);
        }
        TcpState::CloseWait => {
            if let Some(tcb) = inner.tcb.as_mut() {
                tcb.state = TcpState::LastAck;
            }
            queue_fin(sock, inner);
        }
        _ => {}
    }
}

// ============================================================================
// TCP Receive Path
// ============================================================================

/// Drain in-order received bytes into `buf`. `Ok(None)` means nothing is
/// available yet and the caller may block; `Ok(Some(0))` is end-of-stream.
fn tcp_drain_recv(
    sock: &Arc<Socket>,
    inner: &mut SocketInner,
    buf: &mut [u8],
) -> SocketResult<Option<usize>> {
    let tcb = inner.tcb.as_mut().ok_or(SocketError::NotConnected)?;

    let available = tcb.recv_buffer.len();
    if available > 0 {
        let n = available.min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = tcb.recv_buffer.pop_front().unwrap_or(0);
        }
        sock.quota.uncharge(n, MemDirection::Recv);
        return Ok(Some(n));
    }

    if inner.shut_rd || tcb.fin_received || tcb.state == TcpState::Closed {
        return Ok(Some(0));
    }
    Ok(None)
}

// ============================================================================
// Transport Demux
// ============================================================================

/// Demultiplex a reassembled IP payload to its transport handler.
pub fn transport_input(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8], now_ms: u64) {
    match protocol {
        p if p == Ipv4Proto::Tcp as u8 => tcp_input(src, dst, payload, now_ms),
        p if p == Ipv4Proto::Udp as u8 => udp_input(src, dst, payload, now_ms),
        _ => {
            socket_table()
                .stats
                .demux_misses
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// TCP inbound entry: verify, find the owning socket, and either process
/// under the lock or park the segment on the backlog.
pub fn tcp_input(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8], now_ms: u64) {
    let table = socket_table();
    let header = match parse_tcp_header(segment) {
        Ok(h) => h,
        Err(_) => {
            table.stats.malformed_drops.fetch_add(1, Ordering::Relaxed);
            tcp_stats().rx_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    tcp_stats().rx_segments.fetch_add(1, Ordering::Relaxed);
    if !verify_tcp_checksum(src, dst, segment) {
        table.stats.malformed_drops.fetch_add(1, Ordering::Relaxed);
        tcp_stats().checksum_errors.fetch_add(1, Ordering::Relaxed);
        log::debug!("tcp: bad checksum from {}.{} dropped", src, header.src_port);
        return;
    }

    let sock = match find_tcp_socket(dst, header.dst_port, src, header.src_port) {
        Some(s) => s,
        None => {
            // Late traffic for a quarantined tuple restarts its lifetime
            // and gets an ACK carrying the final sequence numbers
            let key = TcpConnKey::new(dst, header.dst_port, src, header.src_port);
            if let Some((snd_nxt, rcv_nxt)) = timer::time_wait_refresh(&key) {
                let wire = build_tcp_segment(
                    dst,
                    src,
                    header.dst_port,
                    header.src_port,
                    snd_nxt,
                    rcv_nxt,
                    TCP_FLAG_ACK,
                    0,
                    &[],
                );
                let _ = crate::ip_output(dst, src, Ipv4Proto::Tcp as u8, &wire);
                return;
            }
            table.stats.demux_misses.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    match sock.try_inner() {
        Some(mut inner) => {
            process_tcp_segment(&sock, &mut inner, src, dst, segment, now_ms);
            drain_backlog(&sock, &mut inner);
        }
        None => {
            sock.backlog.lock().push_back(BacklogPacket {
                src,
                dst,
                segment: segment.to_vec(),
                received_at: now_ms,
            });
            table.stats.backlog_queued.fetch_add(1, Ordering::Relaxed);
            log::trace!("tcp: socket {} busy, segment backlogged", sock.id.0);
        }
    };
}

/// Connected 4-tuple match first, then a listener on the port.
fn find_tcp_socket(
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
) -> Option<Arc<Socket>> {
    let mut listener = None;
    for sock in socket_table().snapshot() {
        if sock.protocol != Protocol::Tcp {
            continue;
        }
        let ep = sock.endpoints();
        let local_match =
            ep.local_port == local_port && (ep.local_ip == local_ip || ep.local_ip.is_unspecified());
        if !local_match {
            continue;
        }
        if ep.remote_ip == remote_ip && ep.remote_port == remote_port {
            return Some(sock);
        }
        if listener.is_none() && sock.listening.load(Ordering::Acquire) {
            listener = Some(sock);
        }
    }
    listener
}

/// Per-segment TCP processing under the socket lock. Connection-setup
/// handling is intentionally minimal: just enough state to arm and disarm
/// the timers each phase calls for.
fn process_tcp_segment(
    sock: &Arc<Socket>,
    inner: &mut SocketInner,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    segment: &[u8],
    now_ms: u64,
) {
    let header = match parse_tcp_header(segment) {
        Ok(h) => h,
        Err(_) => return,
    };
    sock.stats.segments_received.fetch_add(1, Ordering::Relaxed);

    if inner.listen.is_some() {
        listener_input(sock, inner, src, dst, &header, now_ms);
        return;
    }

    let state = match inner.tcb.as_ref() {
        Some(t) => t.state,
        None => return,
    };

    if header.is_rst() {
        let err = if state == TcpState::SynSent {
            SocketError::ConnectionRefused
        } else {
            SocketError::ConnectionReset
        };
        tcp_stats().connections_reset.fetch_add(1, Ordering::Relaxed);
        sock.post_hard_error(inner, err);
        return;
    }

    match state {
        TcpState::SynSent => syn_sent_input(sock, inner, segment, &header, now_ms),
        _ => established_input(sock, inner, segment, &header, now_ms),
    }
}

fn syn_sent_input(
    sock: &Arc<Socket>,
    inner: &mut SocketInner,
    segment: &[u8],
    header: &TcpHeader,
    now_ms: u64,
) {
    if !(header.is_syn() && header.is_ack()) {
        return;
    }
    let accepted = {
        let tcb = match inner.tcb.as_mut() {
            Some(t) => t,
            None => return,
        };
        if header.ack_num != tcb.iss.wrapping_add(1) {
            false
        } else {
            let options = parse_tcp_options(segment, header);
            if let Some(mss) = options.mss {
                tcb.snd_mss = mss;
            }
            tcb.irs = header.seq_num;
            tcb.rcv_nxt = header.seq_num.wrapping_add(1);
            tcb.snd_una = header.ack_num;
            tcb.snd_wnd = header.window as u32;
            tcb.state = TcpState::Established;
            tcb.established_at = now_ms;
            tcb.last_activity = now_ms;
            true
        }
    };
    if accepted {
        tcp_stats()
            .connections_established
            .fetch_add(1, Ordering::Relaxed);
        sock.timers.lock().cancel(TimerKind::Retransmit);
        send_ack_now(sock, inner);
        sock.wake(WaitChannel::Writable);
    }
}

/// Segment processing for synchronized states.
fn established_input(
    sock: &Arc<Socket>,
    inner: &mut SocketInner,
    segment: &[u8],
    header: &TcpHeader,
    now_ms: u64,
) {
    let options = parse_tcp_options(segment, header);

    if header.is_ack() {
        process_ack(sock, inner, header, &options, now_ms);
    }

    let payload = &segment[header.header_len().min(segment.len())..];
    if !payload.is_empty() {
        process_payload(sock, inner, header, payload, now_ms);
    }

    if header.is_fin() {
        process_fin(sock, inner, header, payload.len(), now_ms);
    }
}

/// What the FIN-ACK bookkeeping decided while the control block was
/// borrowed.
enum FinAckStep {
    None,
    TimeWait,
    Closed,
}

fn process_ack(
    sock: &Arc<Socket>,
    inner: &mut SocketInner,
    header: &TcpHeader,
    options: &crate::tcp::TcpOptions,
    now_ms: u64,
) {
    let cfg = config();
    let ep = sock.endpoints();
    let fin_seq = inner.fin_seq;

    let mut cancel_probe = false;
    let mut arm_probe_at = None;
    let mut fin_step = FinAckStep::None;
    let mut retransmit: Option<(u32, Vec<u8>, u32, u16)> = None;
    let mut rearm_retransmit = None;
    let mut cancel_retransmit = false;
    let mut limited_transmit = false;

    let (update, freed) = {
        let tcb = match inner.tcb.as_mut() {
            Some(t) => t,
            None => return,
        };

        // Window update (RFC 793 snd_wl1/snd_wl2 discipline)
        let had_zero_window = tcb.snd_wnd == 0;
        if seq_gt(header.seq_num, tcb.snd_wl1)
            || (header.seq_num == tcb.snd_wl1 && seq_ge(header.ack_num, tcb.snd_wl2))
        {
            tcb.snd_wnd = header.window as u32;
            tcb.snd_wl1 = header.seq_num;
            tcb.snd_wl2 = header.ack_num;
        }
        if had_zero_window && tcb.snd_wnd > 0 {
            window_opened(tcb, cfg);
            cancel_probe = true;
        }

        if !options.sack_blocks.is_empty() {
            apply_sack_blocks(tcb, &options.sack_blocks);
        }

        let before_bytes: usize = tcb.send_buffer.iter().map(|s| s.data.len()).sum();
        let before_segs = tcb.send_buffer.len();

        let update = handle_ack(tcb, header.ack_num, now_ms, cfg);

        let after_bytes: usize = tcb.send_buffer.iter().map(|s| s.data.len()).sum();
        let freed = before_bytes.saturating_sub(after_bytes)
            + (before_segs - tcb.send_buffer.len()) * SEGMENT_OVERHEAD;

        let action = update_congestion_control(tcb, update, header.ack_num);

        if let Some(fseq) = fin_seq {
            if seq_ge(header.ack_num, fseq.wrapping_add(1)) {
                match tcb.state {
                    TcpState::FinWait1 => tcb.state = TcpState::FinWait2,
                    TcpState::Closing => fin_step = FinAckStep::TimeWait,
                    TcpState::LastAck => {
                        tcb.state = TcpState::Closed;
                        fin_step = FinAckStep::Closed;
                    }
                    _ => {}
                }
            }
        }

        match action {
            CongestionAction::FastRetransmit | CongestionAction::RetransmitNext => {
                if let Some((seq, data)) = next_retransmit_candidate(tcb)
                    .map(|seg| (seg.seq, seg.data.clone()))
                {
                    if let Some(seg) = tcb.send_buffer.iter_mut().find(|s| s.seq == seq) {
                        seg.retrans_count = seg.retrans_count.saturating_add(1);
                        seg.sent_at = now_ms;
                    }
                    retransmit = Some((
                        seq,
                        data,
                        tcb.rcv_nxt,
                        tcb.rcv_wnd.min(u16::MAX as u32) as u16,
                    ));
                }
            }
            CongestionAction::LimitedTransmit => limited_transmit = true,
            CongestionAction::None => {}
        }

        if update.newly_acked > 0 {
            keepalive_answered(tcb);
            if tcb.send_buffer.is_empty() {
                cancel_retransmit = true;
            } else {
                rearm_retransmit = Some(now_ms + tcb.rto_ms);
            }
            if tcb.snd_wnd == 0 && !tcb.send_buffer.is_empty() {
                arm_probe_at = Some(now_ms + tcb.probe_interval_ms);
            }
        }

        (update, freed)
    };

    match fin_step {
        FinAckStep::TimeWait => {
            enter_time_wait(sock, inner);
            return;
        }
        FinAckStep::Closed => {
            sock.timers.lock().cancel_all();
            sock.wake(WaitChannel::Readable);
            if sock.detached.load(Ordering::Acquire) {
                socket_table().sockets.write().remove(&sock.id);
            }
            return;
        }
        FinAckStep::None => {}
    }

    {
        let mut timers = sock.timers.lock();
        if cancel_probe {
            timers.cancel(TimerKind::ZeroWindowProbe);
        }
        if cancel_retransmit {
            timers.cancel(TimerKind::Retransmit);
        } else if let Some(at) = rearm_retransmit {
            timers.arm(TimerKind::Retransmit, at);
        }
        if let Some(at) = arm_probe_at {
            if !timers.is_armed(TimerKind::ZeroWindowProbe) {
                timers.arm(TimerKind::ZeroWindowProbe, at);
            }
        }
    }

    if let Some((seq, data, ack, window)) = retransmit {
        let mut flags = TCP_FLAG_ACK;
        if fin_seq == Some(seq) {
            flags |= TCP_FLAG_FIN;
        }
        tcp_stats().retransmissions.fetch_add(1, Ordering::Relaxed);
        transmit_flags(&ep, seq, ack, flags, window, &data);
    } else if limited_transmit {
        limited_transmit_output(&ep, inner, now_ms);
    } else if update.newly_acked > 0 {
        tcp_output(&ep, inner, now_ms);
    }

    if freed > 0 {
        sock.quota.uncharge(freed, MemDirection::Send);
        if sock.quota.send_space_open() {
            sock.wake(WaitChannel::Writable);
        }
    }
}

fn process_payload(
    sock: &Arc<Socket>,
    inner: &mut SocketInner,
    header: &TcpHeader,
    payload: &[u8],
    now_ms: u64,
) {
    let cfg = config();
    let (in_order, timing) = {
        let tcb = match inner.tcb.as_mut() {
            Some(t) => t,
            None => return,
        };
        if !tcb.state.can_receive() {
            return;
        }

        let in_order = header.seq_num == tcb.rcv_nxt;
        if in_order {
            if !sock.quota.charge(payload.len(), MemDirection::Recv, false) {
                // Quota full: drop without advancing rcv_nxt; the peer
                // retransmits once the reader frees space
                sock.stats.rx_dropped_quota.fetch_add(1, Ordering::Relaxed);
                log::debug!("tcp: socket {} recv quota full, segment dropped", sock.id.0);
                return;
            }
            tcb.recv_buffer.extend(payload.iter().copied());
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(payload.len() as u32);
            tcb.last_activity = now_ms;
            merge_out_of_order(sock, tcb);
        } else if seq_gt(header.seq_num, tcb.rcv_nxt) {
            // Beyond a gap: hold in the out-of-order queue
            tcp_stats().out_of_order.fetch_add(1, Ordering::Relaxed);
            if sock.quota.charge(payload.len(), MemDirection::Recv, false) {
                tcb.ooo_queue.push_back(SendSegment {
                    seq: header.seq_num,
                    data: payload.to_vec(),
                    sent_at: now_ms,
                    retrans_count: 0,
                    sacked: false,
                });
            } else {
                sock.stats.rx_dropped_quota.fetch_add(1, Ordering::Relaxed);
            }
        }
        // Old duplicate data stores nothing but still forces an ACK

        (in_order, ack_timing(tcb, !in_order))
    };

    match timing {
        AckTiming::Immediate => send_ack_now(sock, inner),
        AckTiming::Delayed => {
            let mut timers = sock.timers.lock();
            if !timers.is_armed(TimerKind::DelayedAck) {
                timers.arm(TimerKind::DelayedAck, now_ms + cfg.delayed_ack_ms);
            }
        }
    }
    if in_order {
        sock.wake(WaitChannel::Readable);
    }
}

/// Pull any out-of-order segments that the advancing rcv_nxt has reached.
fn merge_out_of_order(sock: &Arc<Socket>, tcb: &mut TcpControlBlock) {
    loop {
        let mut progressed = false;
        let mut i = 0;
        while i < tcb.ooo_queue.len() {
            let seq = tcb.ooo_queue[i].seq;
            let len = tcb.ooo_queue[i].data.len();
            let end = seq.wrapping_add(len as u32);
            if seq_le(end, tcb.rcv_nxt) {
                // Entirely duplicate now
                if let Some(seg) = tcb.ooo_queue.remove(i) {
                    sock.quota.uncharge(seg.data.len(), MemDirection::Recv);
                }
                progressed = true;
                continue;
            }
            if seq_le(seq, tcb.rcv_nxt) {
                let seg = match tcb.ooo_queue.remove(i) {
                    Some(s) => s,
                    None => break,
                };
                let skip = tcb.rcv_nxt.wrapping_sub(seg.seq) as usize;
                tcb.recv_buffer.extend(seg.data[skip..].iter().copied());
                tcb.rcv_nxt = end;
                // The duplicate prefix is no longer held
                if skip > 0 {
                    sock.quota.uncharge(skip, MemDirection::Recv);
                }
                progressed = true;
                continue;
            }
            i += 1;
        }
        if !progressed {
            return;
        }
    }
}

fn process_fin(
    sock: &Arc<Socket>,
    inner: &mut SocketInner,
    header: &TcpHeader,
    payload_len: usize,
    now_ms: u64,
) {
    let _ = now_ms;
    let fin_pos = header.seq_num.wrapping_add(payload_len as u32);
    let step = {
        let tcb = match inner.tcb.as_mut() {
            Some(t) => t,
            None => return,
        };
        if fin_pos != tcb.rcv_nxt {
            // FIN beyond a gap: the retransmission closes the gap first
            return;
        }
        tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
        tcb.fin_received = true;

        match tcb.state {
            TcpState::Established => {
                tcb.state = TcpState::CloseWait;
                FinAckStep::None
            }
            TcpState::FinWait1 => {
                tcb.state = TcpState::Closing;
                FinAckStep::None
            }
            TcpState::FinWait2 => FinAckStep::TimeWait,
            _ => FinAckStep::None,
        }
    };
    send_ack_now(sock, inner);
    if matches!(step, FinAckStep::TimeWait) {
        enter_time_wait(sock, inner);
    }
    sock.wake(WaitChannel::Readable);
}

/// Swap the connection for a death-row placeholder and go quiet.
fn enter_time_wait(sock: &Arc<Socket>, inner: &mut SocketInner) {
    sock.timers.lock().cancel_all();
    if let Some(tcb) = inner.tcb.as_mut() {
        tcb.state = TcpState::TimeWait;
        timer::time_wait_insert(tcb.key, tcb.snd_nxt, tcb.rcv_nxt);
    }
    sock.wake(WaitChannel::Readable);
    sock.wake(WaitChannel::Writable);
    if sock.detached.load(Ordering::Acquire) {
        socket_table().sockets.write().remove(&sock.id);
    }
}

// ============================================================================
// Listener Input
// ============================================================================

fn listener_input(
    sock: &Arc<Socket>,
    inner: &mut SocketInner,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    header: &TcpHeader,
    now_ms: u64,
) {
    let cfg = config();
    let key = TcpConnKey::new(dst, header.dst_port, src, header.src_port);

    if header.is_syn() && !header.is_ack() {
        let syn_ack = {
            let listen = match inner.listen.as_mut() {
                Some(l) => l,
                None => return,
            };
            if listen.syn_queue.iter().any(|h| h.key == key) {
                return; // retransmitted SYN; the retry sweep answers it
            }
            if listen.syn_queue.len() >= cfg.max_syn_backlog {
                log::debug!("tcp: SYN backlog full on port {}", header.dst_port);
                return;
            }
            let iss = generate_isn(dst, header.dst_port, src, header.src_port);
            listen.syn_queue.push_back(HalfOpenConn {
                key,
                iss,
                irs: header.seq_num,
                retries: 0,
                retry_interval_ms: cfg.syn_retry_initial_ms,
                next_retry_at: now_ms + cfg.syn_retry_initial_ms,
            });
            (iss, header.seq_num.wrapping_add(1))
        };
        send_syn_ack(&key, syn_ack.0, syn_ack.1);
        return;
    }

    if header.is_ack() && !header.is_syn() {
        let entry = {
            let listen = match inner.listen.as_mut() {
                Some(l) => l,
                None => return,
            };
            let idx = listen
                .syn_queue
                .iter()
                .position(|h| h.key == key && header.ack_num == h.iss.wrapping_add(1));
            match idx {
                Some(i) => listen.syn_queue.remove(i),
                None => None,
            }
        };
        let entry = match entry {
            Some(e) => e,
            None => return,
        };

        let accept_full = inner
            .listen
            .as_ref()
            .map(|l| l.accept_queue.len() >= cfg.max_accept_backlog)
            .unwrap_or(true);
        if accept_full {
            log::debug!("tcp: accept backlog full on port {}", header.dst_port);
            return;
        }

        let conn_id = spawn_established(&entry, now_ms, cfg);
        if let Some(listen) = inner.listen.as_mut() {
            listen.accept_queue.push_back(conn_id);
        }
        sock.wake(WaitChannel::Readable);
    }
}

fn send_syn_ack(key: &TcpConnKey, iss: u32, ack: u32) {
    let wire = build_tcp_segment(
        key.local_ip,
        key.remote_ip,
        key.local_port,
        key.remote_port,
        iss,
        ack,
        TCP_FLAG_SYN | TCP_FLAG_ACK,
        TCP_DEFAULT_WINDOW,
        &[],
    );
    let _ = crate::ip_output(key.local_ip, key.remote_ip, Ipv4Proto::Tcp as u8, &wire);
}

/// Create the connection socket for a completed handshake.
fn spawn_established(entry: &HalfOpenConn, now_ms: u64, cfg: &StackConfig) -> SocketId {
    let table = socket_table();
    let id = table.socket(Protocol::Tcp);
    if let Ok(sock) = table.get(id) {
        sock.set_endpoints(|ep| {
            ep.local_ip = entry.key.local_ip;
            ep.local_port = entry.key.local_port;
            ep.remote_ip = entry.key.remote_ip;
            ep.remote_port = entry.key.remote_port;
        });
        sock.with_inner(|inner| {
            let mut tcb = TcpControlBlock::new_server(
                entry.key.local_ip,
                entry.key.local_port,
                entry.key.remote_ip,
                entry.key.remote_port,
                entry.iss,
                entry.irs,
                cfg,
            );
            tcb.snd_una = entry.iss.wrapping_add(1);
            tcb.snd_nxt = tcb.snd_una;
            tcb.state = TcpState::Established;
            tcb.established_at = now_ms;
            tcb.last_activity = now_ms;
            inner.next_to_send = tcb.snd_nxt;
            inner.tcb = Some(tcb);
        });
        tcp_stats()
            .connections_established
            .fetch_add(1, Ordering::Relaxed);
    }
    id
}

// ============================================================================
// Fine Timer Dispatch
// ============================================================================

/// Handle a fired fine timer. Returns `false` when the socket lock was
/// held and the timer should re-arm `defer_interval_ms` into the future.
pub fn fine_timer_fired(sock: &Arc<Socket>, kind: TimerKind, now_ms: u64) -> bool {
    let mut inner = match sock.try_inner() {
        Some(g) => g,
        None => return false,
    };
    match kind {
        TimerKind::Retransmit => retransmit_fired(sock, &mut inner, now_ms),
        TimerKind::DelayedAck => send_ack_now(sock, &mut inner),
        TimerKind::ZeroWindowProbe => probe_fired(sock, &mut inner, now_ms),
    }
    drain_backlog(sock, &mut inner);
    true
}

fn retransmit_fired(sock: &Arc<Socket>, inner: &mut SocketInner, now_ms: u64) {
    let cfg = config();
    let ep = sock.endpoints();
    sock.timers.lock().cancel(TimerKind::DelayedAck);

    let (outcome, ack, window, rto) = {
        let tcb = match inner.tcb.as_mut() {
            Some(t) => t,
            None => return,
        };
        if tcb.send_buffer.is_empty() {
            return;
        }
        let outcome = on_retransmit_timeout(tcb, now_ms, cfg);
        (
            outcome,
            tcb.rcv_nxt,
            tcb.rcv_wnd.min(u16::MAX as u32) as u16,
            tcb.rto_ms,
        )
    };

    if let Some((seq, data)) = outcome.resend.as_ref() {
        let mut flags = TCP_FLAG_ACK;
        if inner.fin_seq == Some(*seq) {
            flags |= TCP_FLAG_FIN;
        }
        transmit_flags(&ep, *seq, ack, flags, window, data);
    }

    if outcome.path_degraded {
        sock.post_soft_error(SoftError::PathDegraded);
        if let Some(device) = crate::device() {
            device.report_path_degraded(ep.remote_ip);
        }
    }

    match outcome.disposition {
        RtoDisposition::Continue => {
            sock.timers.lock().arm(TimerKind::Retransmit, now_ms + rto);
        }
        RtoDisposition::FailConnect => {
            socket_table()
                .stats
                .timer_closes
                .fetch_add(1, Ordering::Relaxed);
            log::warn!("tcp: socket {} connect timed out", sock.id.0);
            sock.post_hard_error(inner, SocketError::TimedOut);
        }
        RtoDisposition::MoveToTimeWait => {
            socket_table()
                .stats
                .timer_closes
                .fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "tcp: socket {} hit the retry ceiling, entering TIME-WAIT",
                sock.id.0
            );
            {
                let mut slot = sock.pending_error.lock();
                if slot.is_none() {
                    *slot = Some(SocketError::TimedOut);
                }
            }
            enter_time_wait(sock, inner);
        }
        RtoDisposition::ForceClose => {
            socket_table()
                .stats
                .timer_closes
                .fetch_add(1, Ordering::Relaxed);
            log::warn!("tcp: socket {} hit the retry ceiling, force-closed", sock.id.0);
            sock.post_hard_error(inner, SocketError::TimedOut);
        }
    }
}

fn probe_fired(sock: &Arc<Socket>, inner: &mut SocketInner, now_ms: u64) {
    let cfg = config();
    let ep = sock.endpoints();
    let probe = {
        let tcb = match inner.tcb.as_mut() {
            Some(t) => t,
            None => return,
        };
        match zero_window_probe(tcb, now_ms) {
            Some((seq, byte)) => {
                let ack = tcb.rcv_nxt;
                let window = tcb.rcv_wnd.min(u16::MAX as u32) as u16;
                let next = next_probe_interval(tcb, cfg);
                Some((seq, byte, ack, window, next))
            }
            None => None,
        }
    };
    if let Some((seq, byte, ack, window, next)) = probe {
        transmit_flags(&ep, seq, ack, TCP_FLAG_ACK, window, &byte);
        sock.timers
            .lock()
            .arm(TimerKind::ZeroWindowProbe, now_ms + next);
    }
}

// ============================================================================
// Sweep Visits
// ============================================================================

/// Examine one keepalive-enabled connection during the sweep. A held lock
/// skips the socket this round; the next tick retries.
pub fn keepalive_visit(sock: &Arc<Socket>, now_ms: u64) {
    let cfg = config();
    let ep = sock.endpoints();
    let mut inner = match sock.try_inner() {
        Some(g) => g,
        None => {
            socket_table()
                .stats
                .sweep_skips
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    if !inner.keepalive {
        return;
    }
    let probe = {
        let tcb = match inner.tcb.as_mut() {
            Some(t) => t,
            None => return,
        };
        if tcb.state != TcpState::Established {
            return;
        }
        let idle = now_ms.saturating_sub(tcb.last_activity);
        if idle < cfg.keepalive_idle_ms {
            tcb.keepalive_probes_sent = 0;
            return;
        }
        if tcb.keepalive_probes_sent >= cfg.keepalive_probes {
            None
        } else {
            tcb.keepalive_probes_sent += 1;
            // Probe: an ACK carrying snd_nxt-1, eliciting a peer ACK
            Some((
                tcb.snd_nxt.wrapping_sub(1),
                tcb.rcv_nxt,
                tcb.rcv_wnd.min(u16::MAX as u32) as u16,
            ))
        }
    };
    match probe {
        Some((seq, ack, window)) => transmit_flags(&ep, seq, ack, TCP_FLAG_ACK, window, &[]),
        None => {
            socket_table()
                .stats
                .timer_closes
                .fetch_add(1, Ordering::Relaxed);
            log::warn!("tcp: socket {} keepalive ceiling, closing", sock.id.0);
            sock.post_hard_error(&mut inner, SocketError::TimedOut);
        }
    }
}

/// Peer activity answers an outstanding keepalive probe.
pub fn keepalive_answered(tcb: &mut TcpControlBlock) {
    tcb.keepalive_probes_sent = 0;
}

/// Walk one listener's half-open queue: retransmit expired SYN-ACKs with
/// doubled (capped) backoff, drop entries past the retry ceiling.
pub fn syn_retry_visit(sock: &Arc<Socket>, now_ms: u64) {
    let cfg = config();
    let mut guard = match sock.try_inner() {
        Some(g) => g,
        None => {
            socket_table()
                .stats
                .sweep_skips
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    let inner = &mut *guard;
    let listen = match inner.listen.as_mut() {
        Some(l) => l,
        None => return,
    };

    let mut retransmits = Vec::new();
    let mut i = 0;
    while i < listen.syn_queue.len() {
        if now_ms < listen.syn_queue[i].next_retry_at {
            i += 1;
            continue;
        }
        if listen.syn_queue[i].retries >= cfg.syn_retries {
            if let Some(h) = listen.syn_queue.remove(i) {
                log::debug!(
                    "tcp: half-open {}:{} dropped after {} retries",
                    h.key.remote_ip,
                    h.key.remote_port,
                    h.retries
                );
            }
            continue;
        }
        let entry = &mut listen.syn_queue[i];
        entry.retries += 1;
        entry.retry_interval_ms = (entry.retry_interval_ms * 2).min(cfg.syn_retry_max_ms);
        entry.next_retry_at = now_ms + entry.retry_interval_ms;
        retransmits.push((entry.key, entry.iss, entry.irs.wrapping_add(1)));
        i += 1;
    }
    drop(guard);

    for (key, iss, ack) in retransmits {
        send_syn_ack(&key, iss, ack);
    }
}

// ============================================================================
// UDP
// ============================================================================

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

fn udp_send(sock: &Arc<Socket>, data: &[u8]) -> SocketResult<usize> {
    let ep = sock.endpoints();
    if ep.remote_port == 0 {
        return Err(SocketError::NotConnected);
    }

    let mut datagram = Vec::with_capacity(UDP_HEADER_LEN + data.len());
    datagram.extend_from_slice(&ep.local_port.to_be_bytes());
    datagram.extend_from_slice(&ep.remote_port.to_be_bytes());
    datagram.extend_from_slice(&((UDP_HEADER_LEN + data.len()) as u16).to_be_bytes());
    datagram.extend_from_slice(&[0, 0]); // checksum optional for IPv4
    datagram.extend_from_slice(data);

    let _ = crate::ip_output(ep.local_ip, ep.remote_ip, Ipv4Proto::Udp as u8, &datagram);
    sock.stats
        .bytes_sent
        .fetch_add(data.len() as u64, Ordering::Relaxed);
    Ok(data.len())
}

/// UDP inbound: charge the receive quota and enqueue, dropping against a
/// full quota; a full queue evicts the oldest datagram.
pub fn udp_input(src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8], _now_ms: u64) {
    let table = socket_table();
    if datagram.len() < UDP_HEADER_LEN {
        table.stats.malformed_drops.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let sport = u16::from_be_bytes([datagram[0], datagram[1]]);
    let dport = u16::from_be_bytes([datagram[2], datagram[3]]);
    let length = u16::from_be_bytes([datagram[4], datagram[5]]) as usize;
    if length < UDP_HEADER_LEN || length > datagram.len() {
        table.stats.malformed_drops.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let payload = &datagram[UDP_HEADER_LEN..length];

    let sock = match table.snapshot().into_iter().find(|s| {
        if s.protocol != Protocol::Udp {
            return false;
        }
        let ep = s.endpoints();
        ep.local_port == dport && (ep.local_ip == dst || ep.local_ip.is_unspecified())
    }) {
        Some(s) => s,
        None => {
            table.stats.demux_misses.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let cfg = config();
    let packet = SharedPacket::from_bytes(payload.to_vec());
    if !sock
        .quota
        .charge(packet.truesize(), MemDirection::Recv, false)
    {
        sock.stats.rx_dropped_quota.fetch_add(1, Ordering::Relaxed);
        log::debug!("udp: socket {} recv quota full, datagram dropped", sock.id.0);
        return;
    }
    packet.assign_owner(sock.quota.clone(), MemDirection::Recv);

    sock.with_inner(|inner| {
        if inner.rx_queue.len() >= cfg.max_rx_queue {
            // Oldest datagram gives way; its drop releases the charge
            inner.rx_queue.pop_front();
        }
        inner.rx_queue.push_back((src, sport, packet));
    });
    sock.stats.segments_received.fetch_add(1, Ordering::Relaxed);
    sock.wake(WaitChannel::Readable);
}

fn udp_drain_recv(inner: &mut SocketInner, buf: &mut [u8]) -> SocketResult<Option<usize>> {
    if inner.shut_rd {
        return Ok(Some(0));
    }
    match inner.rx_queue.pop_front() {
        Some((_src, _sport, packet)) => {
            let n = packet.len().min(buf.len());
            buf[..n].copy_from_slice(&packet.data()[..n]);
            // Dropping the packet here releases its receive-side charge
            Ok(Some(n))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use crate::tcp::TcpState;

    fn established_socket(send_quota: usize) -> (SocketId, Arc<Socket>) {
        let table = socket_table();
        let id = table.socket_with_quotas(Protocol::Tcp, send_quota, config().recv_quota);
        let sock = table.get(id).unwrap();
        sock.set_endpoints(|ep| {
            ep.local_ip = Ipv4Addr::new(10, 0, 0, 1);
            ep.local_port = 40000u16.wrapping_add(id.0 as u16);
            ep.remote_ip = Ipv4Addr::new(10, 0, 0, 2);
            ep.remote_port = 80;
        });
        let ep = sock.endpoints();
        sock.with_inner(|inner| {
            let mut tcb = TcpControlBlock::new_client(
                ep.local_ip,
                ep.local_port,
                ep.remote_ip,
                ep.remote_port,
                5000,
                config(),
            );
            tcb.state = TcpState::Established;
            tcb.snd_wnd = 64 * 1024;
            inner.next_to_send = tcb.snd_nxt;
            inner.tcb = Some(tcb);
        });
        table.set_option(id, SocketOption::NonBlocking(true)).unwrap();
        (id, sock)
    }

    fn established_pair() -> (SocketId, Arc<Socket>) {
        established_socket(config().send_quota)
    }

    fn peer_segment(sock: &Arc<Socket>, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let ep = sock.endpoints();
        build_tcp_segment(
            ep.remote_ip,
            ep.local_ip,
            ep.remote_port,
            ep.local_port,
            seq,
            ack,
            flags,
            65535,
            payload,
        )
    }

    #[test]
    fn test_quota_charge_uncharge_invariant() {
        let quota = MemQuota::new(4096, 4096);
        assert!(quota.charge(3000, MemDirection::Send, false));
        assert!(quota.charge(1000, MemDirection::Send, false));
        // Would exceed: rejected, counter unchanged
        assert!(!quota.charge(200, MemDirection::Send, false));
        assert_eq!(quota.charged(MemDirection::Send), 4000);
        // Forced charge lands anyway
        assert!(quota.charge(200, MemDirection::Send, true));
        assert_eq!(quota.charged(MemDirection::Send), 4200);
        quota.uncharge(4200, MemDirection::Send);
        assert_eq!(quota.charged(MemDirection::Send), 0);
        // Directions are independent
        assert!(quota.charge(4096, MemDirection::Recv, false));
        assert_eq!(quota.charged(MemDirection::Send), 0);
    }

    #[test]
    fn test_send_space_low_water() {
        let quota = MemQuota::new(4096, 4096);
        assert!(quota.charge(4000, MemDirection::Send, false));
        assert!(!quota.send_space_open());
        quota.uncharge(2000, MemDirection::Send);
        assert!(quota.send_space_open());
    }

    #[test]
    fn test_full_send_quota_rejects_then_recovers() {
        let (id, sock) = established_socket(4096);
        let table = socket_table();

        // Fill the 4096-byte send quota with unacknowledged data
        let big = vec![0x55u8; 8192];
        let accepted = table.send(id, &big).unwrap();
        assert!(accepted > 0);
        assert!(accepted < big.len());
        // Occupied to within one segment's bookkeeping overhead
        assert!(4096 - sock.quota.charged(MemDirection::Send) <= SEGMENT_OVERHEAD);

        // Quota fully occupied: a 1-byte write is refused, data intact
        let before = sock.quota.charged(MemDirection::Send);
        assert_eq!(table.send(id, &[1]), Err(SocketError::NoBufferSpace));
        assert_eq!(sock.quota.charged(MemDirection::Send), before);

        // Peer ACKs the first two segments (over 1000 payload bytes)
        let acked_to = sock.with_inner(|inner| {
            let tcb = inner.tcb.as_ref().unwrap();
            tcb.send_buffer[1].end_seq()
        });
        let seg = peer_segment(&sock, 9000, acked_to, TCP_FLAG_ACK, &[]);
        let ep = sock.endpoints();
        tcp_input(ep.remote_ip, ep.local_ip, &seg, 100);

        assert!(sock.quota.charged(MemDirection::Send) < before);
        assert_eq!(table.send(id, &[1]), Ok(1));

        table.close(id).unwrap();
    }

    #[test]
    fn test_send_fills_quota_with_truncated_tail() {
        let quota = 536 + 2 * SEGMENT_OVERHEAD + 100;
        let (id, sock) = established_socket(quota);
        let table = socket_table();

        // One full segment fits; the second is cut down to the 100 bytes
        // of quota left after its overhead
        let n = table.send(id, &[0x42u8; 1072]).unwrap();
        assert_eq!(n, 636);
        assert_eq!(sock.quota.charged(MemDirection::Send), quota);
        sock.with_inner(|inner| {
            let tcb = inner.tcb.as_ref().unwrap();
            assert_eq!(tcb.send_buffer.len(), 2);
            assert_eq!(tcb.send_buffer[0].data.len(), 536);
            assert_eq!(tcb.send_buffer[1].data.len(), 100);
        });

        // Nothing left, not even for one byte
        assert_eq!(table.send(id, &[1]), Err(SocketError::NoBufferSpace));
        table.close(id).unwrap();
    }

    #[test]
    fn test_duplicate_ack_triggers_limited_transmit() {
        let (id, sock) = established_pair();
        let table = socket_table();
        sock.with_inner(|inner| {
            inner.tcb.as_mut().unwrap().cwnd = 1;
        });

        // Two segments queued; a one-segment congestion budget already
        // spent on the queue keeps both untransmitted
        table.send(id, &vec![0x33u8; 1072]).unwrap();
        let snd_una = sock.with_inner(|inner| {
            let tcb = inner.tcb.as_ref().unwrap();
            assert_eq!(inner.next_to_send, tcb.snd_una);
            tcb.snd_una
        });

        // First duplicate ACK: exactly one new segment goes out past the
        // congestion budget, without inflating cwnd
        let ep = sock.endpoints();
        let dup = peer_segment(&sock, 9000, snd_una, TCP_FLAG_ACK, &[]);
        tcp_input(ep.remote_ip, ep.local_ip, &dup, 100);
        sock.with_inner(|inner| {
            assert_eq!(inner.next_to_send, snd_una.wrapping_add(536));
            assert_eq!(inner.tcb.as_ref().unwrap().cwnd, 1);
        });
        table.close(id).unwrap();
    }

    #[test]
    fn test_send_after_idle_restarts_from_initial_window() {
        let (id, sock) = established_pair();
        sock.with_inner(|inner| {
            let tcb = inner.tcb.as_mut().unwrap();
            tcb.cwnd = 40;
            tcb.ssthresh = 64;
            tcb.congestion_state = crate::tcp::TcpCongestionState::CongestionAvoidance;
            tcb.last_activity = 1;
            tcb.rto_ms = 1000;
        });

        // Well past one RTO of idle: the next write collapses the stale
        // window before queueing
        crate::note_time(50_000);
        socket_table().send(id, b"fresh data").unwrap();
        sock.with_inner(|inner| {
            let tcb = inner.tcb.as_ref().unwrap();
            assert_eq!(tcb.cwnd, crate::tcp::initial_cwnd(tcb.snd_mss));
            assert_eq!(
                tcb.congestion_state,
                crate::tcp::TcpCongestionState::SlowStart
            );
        });
        socket_table().close(id).unwrap();
    }

    #[test]
    fn test_hard_error_consumed_exactly_once() {
        let (id, sock) = established_pair();
        sock.with_inner(|inner| {
            sock.post_hard_error(inner, SocketError::ConnectionReset);
            // Second poster does not overwrite
            sock.post_hard_error(inner, SocketError::TimedOut);
        });
        assert_eq!(sock.take_error(), Some(SocketError::ConnectionReset));
        assert_eq!(sock.take_error(), None);
        // Timers were cleared before the transition
        assert_eq!(sock.timers.lock().next_deadline(), None);
        sock.with_inner(|inner| {
            assert_eq!(inner.tcb.as_ref().unwrap().state, TcpState::Closed);
        });
        socket_table().close(id).unwrap();
    }

    #[test]
    fn test_rst_posts_reset_error() {
        let (id, sock) = established_pair();
        let ep = sock.endpoints();
        let rst = peer_segment(&sock, 9000, 0, crate::tcp::TCP_FLAG_RST, &[]);
        tcp_input(ep.remote_ip, ep.local_ip, &rst, 50);
        assert_eq!(sock.take_error(), Some(SocketError::ConnectionReset));
        socket_table().close(id).unwrap();
    }

    #[test]
    fn test_write_after_shutdown_is_policy_error() {
        let (id, _sock) = established_pair();
        let table = socket_table();
        table.shutdown(id, ShutdownHow::Write).unwrap();
        assert_eq!(table.send(id, b"x"), Err(SocketError::Shutdown));
        table.close(id).unwrap();
    }

    #[test]
    fn test_read_drains_then_eof_after_fin() {
        let (id, sock) = established_pair();
        let table = socket_table();
        sock.with_inner(|inner| {
            let tcb = inner.tcb.as_mut().unwrap();
            tcb.recv_buffer.extend(b"hello".iter().copied());
            tcb.fin_received = true;
        });
        sock.quota.charge(5, MemDirection::Recv, false);

        let mut buf = [0u8; 16];
        assert_eq!(table.recv(id, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"hello");
        // Queue drained: end-of-stream, not an error
        assert_eq!(table.recv(id, &mut buf), Ok(0));
        assert_eq!(sock.quota.charged(MemDirection::Recv), 0);
        table.close(id).unwrap();
    }

    #[test]
    fn test_backlog_preserves_arrival_order() {
        let (id, sock) = established_pair();
        let ep = sock.endpoints();
        let rcv_nxt = sock.with_inner(|inner| inner.tcb.as_ref().unwrap().rcv_nxt);

        let seg_a = peer_segment(&sock, rcv_nxt, 5001, TCP_FLAG_ACK, b"aaaa");
        let seg_b = peer_segment(&sock, rcv_nxt.wrapping_add(4), 5001, TCP_FLAG_ACK, b"bbbb");

        {
            // Hold the advisory lock: both segments must park on the backlog
            let guard = sock.inner.lock();
            tcp_input(ep.remote_ip, ep.local_ip, &seg_a, 10);
            tcp_input(ep.remote_ip, ep.local_ip, &seg_b, 11);
            assert_eq!(sock.backlog.lock().len(), 2);
            drop(guard);
        }

        // Next lock acquisition drains in arrival order
        sock.with_inner(|_| {});
        let contents = sock.with_inner(|inner| {
            let tcb = inner.tcb.as_ref().unwrap();
            tcb.recv_buffer.iter().copied().collect::<Vec<u8>>()
        });
        assert_eq!(contents, b"aaaabbbb");
        assert!(sock.backlog.lock().is_empty());
        socket_table().close(id).unwrap();
    }

    #[test]
    fn test_out_of_order_holds_then_merges() {
        let (id, sock) = established_pair();
        let ep = sock.endpoints();
        let rcv_nxt = sock.with_inner(|inner| inner.tcb.as_ref().unwrap().rcv_nxt);

        // Arrives beyond a gap
        let later = peer_segment(&sock, rcv_nxt.wrapping_add(4), 5001, TCP_FLAG_ACK, b"wxyz");
        tcp_input(ep.remote_ip, ep.local_ip, &later, 10);
        sock.with_inner(|inner| {
            let tcb = inner.tcb.as_ref().unwrap();
            assert_eq!(tcb.ooo_queue.len(), 1);
            assert!(tcb.recv_buffer.is_empty());
        });

        // The gap fill pulls the held segment through
        let first = peer_segment(&sock, rcv_nxt, 5001, TCP_FLAG_ACK, b"stuv");
        tcp_input(ep.remote_ip, ep.local_ip, &first, 11);
        sock.with_inner(|inner| {
            let tcb = inner.tcb.as_ref().unwrap();
            assert!(tcb.ooo_queue.is_empty());
            let got: Vec<u8> = tcb.recv_buffer.iter().copied().collect();
            assert_eq!(got, b"stuvwxyz");
            assert_eq!(tcb.rcv_nxt, rcv_nxt.wrapping_add(8));
        });
        socket_table().close(id).unwrap();
    }

    #[test]
    fn test_recv_quota_full_drops_without_advancing() {
        let (id, sock) = established_pair();
        let ep = sock.endpoints();
        let rcv_nxt = sock.with_inner(|inner| inner.tcb.as_ref().unwrap().rcv_nxt);

        // Exhaust the receive quota
        assert!(sock
            .quota
            .charge(config().recv_quota, MemDirection::Recv, false));

        let seg = peer_segment(&sock, rcv_nxt, 5001, TCP_FLAG_ACK, b"data");
        tcp_input(ep.remote_ip, ep.local_ip, &seg, 10);
        sock.with_inner(|inner| {
            let tcb = inner.tcb.as_ref().unwrap();
            // rcv_nxt untouched so the peer retransmits
            assert_eq!(tcb.rcv_nxt, rcv_nxt);
            assert!(tcb.recv_buffer.is_empty());
        });
        assert_eq!(sock.stats.rx_dropped_quota.load(Ordering::Relaxed), 1);
        sock.quota.uncharge(config().recv_quota, MemDirection::Recv);
        socket_table().close(id).unwrap();
    }

    #[test]
    fn test_listener_handshake_and_accept_queue() {
        let table = socket_table();
        let lid = table.socket(Protocol::Tcp);
        table.set_option(lid, SocketOption::NonBlocking(true)).unwrap();
        table.bind(lid, Ipv4Addr::new(10, 1, 0, 1), 8080).unwrap();
        table.listen(lid).unwrap();

        assert_eq!(table.accept(lid), Err(SocketError::WouldBlock));

        let peer = Ipv4Addr::new(10, 1, 0, 9);
        let syn = build_tcp_segment(
            peer,
            Ipv4Addr::new(10, 1, 0, 1),
            5555,
            8080,
            700,
            0,
            TCP_FLAG_SYN,
            65535,
            &[],
        );
        tcp_input(peer, Ipv4Addr::new(10, 1, 0, 1), &syn, 10);

        let lsock = table.get(lid).unwrap();
        let iss = lsock.with_inner(|inner| {
            let listen = inner.listen.as_ref().unwrap();
            assert_eq!(listen.syn_queue.len(), 1);
            assert_eq!(listen.syn_queue[0].irs, 700);
            listen.syn_queue[0].iss
        });

        // Handshake-completing ACK promotes the entry
        let ack = build_tcp_segment(
            peer,
            Ipv4Addr::new(10, 1, 0, 1),
            5555,
            8080,
            701,
            iss.wrapping_add(1),
            TCP_FLAG_ACK,
            65535,
            &[],
        );
        tcp_input(peer, Ipv4Addr::new(10, 1, 0, 1), &ack, 20);

        let conn = table.accept(lid).unwrap();
        let csock = table.get(conn).unwrap();
        csock.with_inner(|inner| {
            let tcb = inner.tcb.as_ref().unwrap();
            assert_eq!(tcb.state, TcpState::Established);
            assert_eq!(tcb.rcv_nxt, 701);
            assert_eq!(tcb.snd_una, iss.wrapping_add(1));
        });
        lsock.with_inner(|inner| {
            assert!(inner.listen.as_ref().unwrap().syn_queue.is_empty());
        });

        table.close(conn).unwrap();
        table.close(lid).unwrap();
    }

    #[test]
    fn test_syn_retry_backoff_and_ceiling() {
        let cfg = config();
        let table = socket_table();
        let lid = table.socket(Protocol::Tcp);
        table.bind(lid, Ipv4Addr::new(10, 2, 0, 1), 8081).unwrap();
        table.listen(lid).unwrap();
        let lsock = table.get(lid).unwrap();

        let peer = Ipv4Addr::new(10, 2, 0, 9);
        let syn = build_tcp_segment(
            peer,
            Ipv4Addr::new(10, 2, 0, 1),
            5556,
            8081,
            900,
            0,
            TCP_FLAG_SYN,
            65535,
            &[],
        );
        tcp_input(peer, Ipv4Addr::new(10, 2, 0, 1), &syn, 0);

        let mut now = 0u64;
        let mut expected_interval = cfg.syn_retry_initial_ms;
        for round in 1..=cfg.syn_retries {
            now += expected_interval + 1;
            syn_retry_visit(&lsock, now);
            let (retries, interval) = lsock.with_inner(|inner| {
                let h = &inner.listen.as_ref().unwrap().syn_queue[0];
                (h.retries, h.retry_interval_ms)
            });
            assert_eq!(retries, round);
            expected_interval = (expected_interval * 2).min(cfg.syn_retry_max_ms);
            assert_eq!(interval, expected_interval);
        }

        // Past the ceiling: the half-open entry is discarded
        now += expected_interval + 1;
        syn_retry_visit(&lsock, now);
        lsock.with_inner(|inner| {
            assert!(inner.listen.as_ref().unwrap().syn_queue.is_empty());
        });
        table.close(lid).unwrap();
    }

    #[test]
    fn test_retransmit_timer_defer_on_held_lock() {
        let (id, sock) = established_pair();
        socket_table().send(id, b"payload").unwrap();

        {
            let _guard = sock.inner.lock();
            // Lock held: the fire must report deferral, not block
            assert!(!fine_timer_fired(&sock, TimerKind::Retransmit, 5000));
        }
        assert!(fine_timer_fired(&sock, TimerKind::Retransmit, 5000));
        sock.with_inner(|inner| {
            let tcb = inner.tcb.as_ref().unwrap();
            assert_eq!(tcb.backoff, 1);
            assert_eq!(tcb.cwnd, 1);
        });
        socket_table().close(id).unwrap();
    }

    #[test]
    fn test_keepalive_ceiling_closes_with_timeout() {
        let cfg = config();
        let (id, sock) = established_pair();
        sock.with_inner(|inner| {
            inner.keepalive = true;
            let tcb = inner.tcb.as_mut().unwrap();
            tcb.last_activity = 0;
        });

        let probe_time = cfg.keepalive_idle_ms + 1;
        for _ in 0..cfg.keepalive_probes {
            keepalive_visit(&sock, probe_time);
        }
        sock.with_inner(|inner| {
            assert_eq!(
                inner.tcb.as_ref().unwrap().keepalive_probes_sent,
                cfg.keepalive_probes
            );
        });
        keepalive_visit(&sock, probe_time);
        assert_eq!(sock.take_error(), Some(SocketError::TimedOut));
        socket_table().close(id).unwrap();
    }

    #[test]
    fn test_udp_accounting_roundtrip() {
        let table = socket_table();
        let id = table.socket(Protocol::Udp);
        table.set_option(id, SocketOption::NonBlocking(true)).unwrap();
        table.bind(id, Ipv4Addr::new(10, 3, 0, 1), 9999).unwrap();
        let sock = table.get(id).unwrap();

        let mut datagram = Vec::new();
        datagram.extend_from_slice(&4444u16.to_be_bytes());
        datagram.extend_from_slice(&9999u16.to_be_bytes());
        datagram.extend_from_slice(&((UDP_HEADER_LEN + 4) as u16).to_be_bytes());
        datagram.extend_from_slice(&[0, 0]);
        datagram.extend_from_slice(b"ping");

        udp_input(
            Ipv4Addr::new(10, 3, 0, 7),
            Ipv4Addr::new(10, 3, 0, 1),
            &datagram,
            5,
        );
        assert!(sock.quota.charged(MemDirection::Recv) > 0);

        let mut buf = [0u8; 16];
        assert_eq!(table.recv(id, &mut buf), Ok(4));
        assert_eq!(&buf[..4], b"ping");
        // Consuming the datagram released its charge
        assert_eq!(sock.quota.charged(MemDirection::Recv), 0);

        table.close(id).unwrap();
    }

    #[test]
    fn test_bind_conflict() {
        let table = socket_table();
        let a = table.socket(Protocol::Tcp);
        let b = table.socket(Protocol::Tcp);
        table.bind(a, Ipv4Addr::new(10, 4, 0, 1), 7777).unwrap();
        assert_eq!(
            table.bind(b, Ipv4Addr::new(10, 4, 0, 1), 7777),
            Err(SocketError::AddressInUse)
        );
        table.close(a).unwrap();
        table.close(b).unwrap();
    }

    #[test]
    fn test_fin_moves_established_to_close_wait() {
        let (id, sock) = established_pair();
        let ep = sock.endpoints();
        let rcv_nxt = sock.with_inner(|inner| inner.tcb.as_ref().unwrap().rcv_nxt);

        let fin = peer_segment(&sock, rcv_nxt, 5001, TCP_FLAG_FIN | TCP_FLAG_ACK, &[]);
        tcp_input(ep.remote_ip, ep.local_ip, &fin, 30);
        sock.with_inner(|inner| {
            let tcb = inner.tcb.as_ref().unwrap();
            assert_eq!(tcb.state, TcpState::CloseWait);
            assert!(tcb.fin_received);
            assert_eq!(tcb.rcv_nxt, rcv_nxt.wrapping_add(1));
        });
        socket_table().close(id).unwrap();
    }
}
