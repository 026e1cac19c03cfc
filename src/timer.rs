//! Two-tier timer subsystem.
//!
//! Fine per-connection timers (retransmit, delayed ACK, zero-window probe)
//! are independent one-shot deadlines held in a [`TimerSet`], armed and
//! cancelled in O(1) by the engine. They must never fire against an active
//! socket lock holder; a fire that finds the lock held re-arms itself
//! `defer_interval_ms` into the future instead of blocking or dropping.
//!
//! Coarse work (keepalive probing, SYN-ACK retries, TIME-WAIT reclamation)
//! runs as shared periodic sweeps off one clock tick. Each sweep kind keeps
//! a reference count of interested connections; [`clock_interval_ms`]
//! reports the minimum cadence across referenced sweeps so the embedder can
//! disarm its clock entirely when nothing needs one.
//!
//! TIME-WAIT entries live on a fixed-size rotating ring (the death row): an
//! entry inserted into slot `(current - 1) mod N` survives between `N - 1`
//! and `N` ticks, and each tick unconditionally destroys everything in the
//! slot that becomes current.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, Once};

use crate::config::{config, StackConfig};
use crate::socket::{self, socket_table, Protocol};
use crate::tcp::TcpConnKey;

// ============================================================================
// Fine Timers
// ============================================================================

/// The fine per-connection timer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Retransmission timeout
    Retransmit,
    /// Owed ACK deadline
    DelayedAck,
    /// Zero-window probe
    ZeroWindowProbe,
}

const TIMER_KINDS: [TimerKind; 3] = [
    TimerKind::Retransmit,
    TimerKind::DelayedAck,
    TimerKind::ZeroWindowProbe,
];

impl TimerKind {
    #[inline]
    fn index(self) -> usize {
        match self {
            TimerKind::Retransmit => 0,
            TimerKind::DelayedAck => 1,
            TimerKind::ZeroWindowProbe => 2,
        }
    }
}

/// One-shot deadlines for a single connection, one slot per [`TimerKind`].
#[derive(Debug, Default)]
pub struct TimerSet {
    deadlines: [Option<u64>; 3],
}

impl TimerSet {
    /// An empty set with nothing armed.
    pub const fn new() -> Self {
        Self {
            deadlines: [None; 3],
        }
    }

    /// Arm (or re-arm) a timer for an absolute deadline.
    #[inline]
    pub fn arm(&mut self, kind: TimerKind, deadline_ms: u64) {
        self.deadlines[kind.index()] = Some(deadline_ms);
    }

    /// Disarm a timer.
    #[inline]
    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind.index()] = None;
    }

    /// Disarm everything.
    #[inline]
    pub fn cancel_all(&mut self) {
        self.deadlines = [None; 3];
    }

    /// True when the timer is armed.
    #[inline]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.index()].is_some()
    }

    /// The earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.iter().flatten().copied().min()
    }

    /// Pop every timer whose deadline has passed, disarming it.
    pub fn take_expired(&mut self, now_ms: u64) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        for kind in TIMER_KINDS {
            if let Some(deadline) = self.deadlines[kind.index()] {
                if deadline <= now_ms {
                    self.deadlines[kind.index()] = None;
                    fired.push(kind);
                }
            }
        }
        fired
    }
}

// ============================================================================
// Sweep Registry
// ============================================================================

/// The coarse shared sweep kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// Keepalive probing of idle established connections
    Keepalive,
    /// SYN-ACK retransmission for half-open queues
    SynRetry,
    /// TIME-WAIT ring advancement
    TimeWait,
}

/// Reference counts of connections interested in each sweep kind.
#[derive(Debug)]
pub struct SweepRegistry {
    keepalive: AtomicUsize,
    syn_retry: AtomicUsize,
    time_wait: AtomicUsize,
}

impl SweepRegistry {
    /// A registry with no references.
    pub const fn new() -> Self {
        Self {
            keepalive: AtomicUsize::new(0),
            syn_retry: AtomicUsize::new(0),
            time_wait: AtomicUsize::new(0),
        }
    }

    fn counter(&self, kind: SweepKind) -> &AtomicUsize {
        match kind {
            SweepKind::Keepalive => &self.keepalive,
            SweepKind::SynRetry => &self.syn_retry,
            SweepKind::TimeWait => &self.time_wait,
        }
    }

    /// Register one more interested connection.
    pub fn add_ref(&self, kind: SweepKind) {
        self.counter(kind).fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one interested connection.
    pub fn remove_ref(&self, kind: SweepKind) {
        let _ = self
            .counter(kind)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Current reference count for a sweep kind.
    pub fn refs(&self, kind: SweepKind) -> usize {
        self.counter(kind).load(Ordering::Acquire)
    }

    /// The minimum cadence across sweeps with at least one reference, or
    /// `None` when every count is zero and the clock can stay disarmed.
    pub fn clock_interval_ms(&self, cfg: &StackConfig) -> Option<u64> {
        let mut interval = None;
        let candidates = [
            (SweepKind::Keepalive, cfg.keepalive_tick_ms),
            (SweepKind::SynRetry, cfg.syn_sweep_ms),
            (SweepKind::TimeWait, cfg.time_wait_tick_ms),
        ];
        for (kind, tick) in candidates {
            if self.refs(kind) > 0 {
                interval = Some(interval.map_or(tick, |cur: u64| cur.min(tick)));
            }
        }
        interval
    }
}

static SWEEPS: SweepRegistry = SweepRegistry::new();

/// Register interest in a sweep kind on the process-wide registry.
pub fn sweep_ref(kind: SweepKind) {
    SWEEPS.add_ref(kind);
}

/// Drop interest in a sweep kind on the process-wide registry.
pub fn sweep_unref(kind: SweepKind) {
    SWEEPS.remove_ref(kind);
}

/// Cadence the embedder should drive [`handle_timer_tick`] at, or `None`
/// when no sweep has interested connections.
pub fn clock_interval_ms() -> Option<u64> {
    SWEEPS.clock_interval_ms(config())
}

// ============================================================================
// TIME-WAIT Ring
// ============================================================================

/// A quarantined 4-tuple standing in for a closed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWaitEntry {
    /// The quarantined connection key
    pub key: TcpConnKey,
    /// Final send-next, for answering duplicate late segments
    pub snd_nxt: u32,
    /// Final receive-next, for answering duplicate late segments
    pub rcv_nxt: u32,
}

/// Fixed-size rotating expiry ring for TIME-WAIT entries.
#[derive(Debug)]
pub struct TimeWaitRing {
    slots: Vec<Vec<TimeWaitEntry>>,
    current: usize,
}

impl TimeWaitRing {
    /// A ring with `slots` slots, all empty. `slots` must be at least 2.
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(2);
        let mut ring = Vec::with_capacity(slots);
        ring.resize_with(slots, Vec::new);
        Self {
            slots: ring,
            current: 0,
        }
    }

    fn insert_slot(&self) -> usize {
        (self.current + self.slots.len() - 1) % self.slots.len()
    }

    /// Insert an entry into the slot farthest from destruction, giving it
    /// a lifetime of `[N - 1, N]` ticks.
    pub fn insert(&mut self, entry: TimeWaitEntry) {
        let slot = self.insert_slot();
        self.slots[slot].push(entry);
    }

    /// Advance one tick, destroying everything in the slot that becomes
    /// current. Returns the destroyed entries.
    pub fn advance(&mut self) -> Vec<TimeWaitEntry> {
        self.current = (self.current + 1) % self.slots.len();
        core::mem::take(&mut self.slots[self.current])
    }

    /// Find a quarantined key.
    pub fn lookup(&self, key: &TcpConnKey) -> Option<TimeWaitEntry> {
        self.slots
            .iter()
            .flat_map(|slot| slot.iter())
            .find(|e| e.key == *key)
            .copied()
    }

    /// Grant an entry a fresh full lifetime (duplicate late traffic seen).
    /// Returns the entry when the key was present.
    pub fn reschedule(&mut self, key: &TcpConnKey) -> Option<TimeWaitEntry> {
        let entry = self.remove(key)?;
        self.insert(entry);
        Some(entry)
    }

    /// Destroy an entry early (a superseding event). Returns the entry
    /// when the key was present.
    pub fn deschedule(&mut self, key: &TcpConnKey) -> Option<TimeWaitEntry> {
        self.remove(key)
    }

    fn remove(&mut self, key: &TcpConnKey) -> Option<TimeWaitEntry> {
        for slot in self.slots.iter_mut() {
            if let Some(pos) = slot.iter().position(|e| e.key == *key) {
                return Some(slot.swap_remove(pos));
            }
        }
        None
    }

    /// Number of quarantined entries.
    pub fn len(&self) -> usize {
        self.slots.iter().map(|s| s.len()).sum()
    }

    /// True when nothing is quarantined.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_empty())
    }
}

static TIME_WAIT: Once<Mutex<TimeWaitRing>> = Once::new();

fn time_wait_ring() -> &'static Mutex<TimeWaitRing> {
    TIME_WAIT.call_once(|| Mutex::new(TimeWaitRing::new(config().time_wait_slots)))
}

/// Quarantine a closed connection's 4-tuple. A key already present is
/// rescheduled rather than duplicated.
pub fn time_wait_insert(key: TcpConnKey, snd_nxt: u32, rcv_nxt: u32) {
    let mut ring = time_wait_ring().lock();
    if ring.reschedule(&key).is_some() {
        return;
    }
    ring.insert(TimeWaitEntry {
        key,
        snd_nxt,
        rcv_nxt,
    });
    SWEEPS.add_ref(SweepKind::TimeWait);
}

/// Late traffic arrived for a quarantined key: grant a fresh lifetime and
/// return the final sequence numbers for the answering ACK.
pub fn time_wait_refresh(key: &TcpConnKey) -> Option<(u32, u32)> {
    time_wait_ring()
        .lock()
        .reschedule(key)
        .map(|e| (e.snd_nxt, e.rcv_nxt))
}

/// Destroy a quarantined entry early. Returns true when the key was
/// present.
pub fn time_wait_deschedule(key: &TcpConnKey) -> bool {
    let removed = time_wait_ring().lock().deschedule(key).is_some();
    if removed {
        SWEEPS.remove_ref(SweepKind::TimeWait);
    }
    removed
}

// ============================================================================
// The Clock Tick
// ============================================================================

/// Per-sweep pacing and the keepalive round-robin cursor.
struct SweepClock {
    next_keepalive_at: u64,
    next_syn_retry_at: u64,
    next_time_wait_at: u64,
    next_frag_cleanup_at: u64,
    keepalive_cursor: usize,
}

static SWEEP_CLOCK: Mutex<SweepClock> = Mutex::new(SweepClock {
    next_keepalive_at: 0,
    next_syn_retry_at: 0,
    next_time_wait_at: 0,
    next_frag_cleanup_at: 0,
    keepalive_cursor: 0,
});

/// Drive everything the periodic clock owes at `now_ms`: expired fine
/// timers (with defer-and-rearm against held locks), due sweeps, and
/// reassembly-queue expiry.
pub fn handle_timer_tick(now_ms: u64) {
    crate::note_time(now_ms);
    let cfg = config();

    poll_fine_timers(now_ms, cfg);

    let (run_keepalive, run_syn_retry, run_time_wait, run_frag) = {
        let mut clock = SWEEP_CLOCK.lock();
        let mut due = (false, false, false, false);
        if SWEEPS.refs(SweepKind::Keepalive) > 0 && now_ms >= clock.next_keepalive_at {
            clock.next_keepalive_at = now_ms + cfg.keepalive_tick_ms;
            due.0 = true;
        }
        if SWEEPS.refs(SweepKind::SynRetry) > 0 && now_ms >= clock.next_syn_retry_at {
            clock.next_syn_retry_at = now_ms + cfg.syn_sweep_ms;
            due.1 = true;
        }
        if SWEEPS.refs(SweepKind::TimeWait) > 0 && now_ms >= clock.next_time_wait_at {
            clock.next_time_wait_at = now_ms + cfg.time_wait_tick_ms;
            due.2 = true;
        }
        if now_ms >= clock.next_frag_cleanup_at {
            clock.next_frag_cleanup_at = now_ms + cfg.frag_timeout_ms / 2;
            due.3 = true;
        }
        due
    };

    if run_keepalive {
        keepalive_sweep(now_ms, cfg);
    }
    if run_syn_retry {
        syn_retry_sweep(now_ms);
    }
    if run_time_wait {
        time_wait_sweep();
    }
    if run_frag {
        crate::fragment::cleanup_expired_fragments(now_ms);
    }
}

/// Fire expired fine timers across the socket table. A socket whose lock
/// is held gets its timer re-armed a short defer interval out rather than
/// fired under contention.
fn poll_fine_timers(now_ms: u64, cfg: &StackConfig) {
    for sock in socket_table().snapshot() {
        let fired = sock.timers.lock().take_expired(now_ms);
        for kind in fired {
            if !socket::fine_timer_fired(&sock, kind, now_ms) {
                sock.timers.lock().arm(kind, now_ms + cfg.defer_interval_ms);
            }
        }
    }
}

/// Visit a bounded round-robin chunk of TCP sockets for keepalive.
fn keepalive_sweep(now_ms: u64, cfg: &StackConfig) {
    let snapshot = socket_table().snapshot();
    if snapshot.is_empty() {
        return;
    }
    let start = {
        let mut clock = SWEEP_CLOCK.lock();
        let start = clock.keepalive_cursor % snapshot.len();
        clock.keepalive_cursor = (start + cfg.keepalive_chunk) % snapshot.len();
        start
    };
    for i in 0..cfg.keepalive_chunk.min(snapshot.len()) {
        let sock = &snapshot[(start + i) % snapshot.len()];
        if sock.protocol == Protocol::Tcp {
            socket::keepalive_visit(sock, now_ms);
        }
    }
}

/// Walk every listening socket's half-open queue.
fn syn_retry_sweep(now_ms: u64) {
    for sock in socket_table().snapshot() {
        if sock.protocol == Protocol::Tcp && sock.is_listening() {
            socket::syn_retry_visit(&sock, now_ms);
        }
    }
}

/// Advance the death row one slot and destroy what rotates in.
fn time_wait_sweep() {
    let destroyed = time_wait_ring().lock().advance();
    for entry in destroyed {
        SWEEPS.remove_ref(SweepKind::TimeWait);
        log::trace!(
            "time-wait: {}:{} released",
            entry.key.remote_ip,
            entry.key.remote_port
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::Ipv4Addr;

    fn entry(n: u8) -> TimeWaitEntry {
        TimeWaitEntry {
            key: TcpConnKey::new(
                Ipv4Addr::new(10, 0, 0, 1),
                1000 + n as u16,
                Ipv4Addr::new(10, 0, 0, 2),
                80,
            ),
            snd_nxt: 5000,
            rcv_nxt: 9000,
        }
    }

    #[test]
    fn test_timer_set_arm_cancel() {
        let mut set = TimerSet::new();
        assert_eq!(set.next_deadline(), None);

        set.arm(TimerKind::Retransmit, 1000);
        set.arm(TimerKind::DelayedAck, 200);
        assert!(set.is_armed(TimerKind::Retransmit));
        assert!(!set.is_armed(TimerKind::ZeroWindowProbe));
        assert_eq!(set.next_deadline(), Some(200));

        // Re-arming replaces the deadline
        set.arm(TimerKind::DelayedAck, 1500);
        assert_eq!(set.next_deadline(), Some(1000));

        set.cancel(TimerKind::Retransmit);
        assert_eq!(set.next_deadline(), Some(1500));
        set.cancel_all();
        assert_eq!(set.next_deadline(), None);
    }

    #[test]
    fn test_take_expired_disarms_only_due_timers() {
        let mut set = TimerSet::new();
        set.arm(TimerKind::Retransmit, 100);
        set.arm(TimerKind::DelayedAck, 50);
        set.arm(TimerKind::ZeroWindowProbe, 500);

        let fired = set.take_expired(100);
        assert_eq!(fired, vec![TimerKind::Retransmit, TimerKind::DelayedAck]);
        assert!(!set.is_armed(TimerKind::Retransmit));
        assert!(!set.is_armed(TimerKind::DelayedAck));
        assert!(set.is_armed(TimerKind::ZeroWindowProbe));

        // Nothing due: nothing popped
        assert!(set.take_expired(400).is_empty());
        assert_eq!(set.take_expired(500), vec![TimerKind::ZeroWindowProbe]);
    }

    #[test]
    fn test_ring_lifetime_bounds() {
        let n = 4;
        let mut ring = TimeWaitRing::new(n);
        ring.insert(entry(1));

        // The entry survives n-2 advances
        for _ in 0..n - 2 {
            assert!(ring.advance().is_empty());
            assert_eq!(ring.len(), 1);
        }
        // The (n-1)th advance rotates its slot in and destroys it
        let destroyed = ring.advance();
        assert_eq!(destroyed.len(), 1);
        assert_eq!(destroyed[0], entry(1));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ring_reschedule_grants_fresh_lifetime() {
        let n = 4;
        let mut ring = TimeWaitRing::new(n);
        ring.insert(entry(1));

        for _ in 0..n - 2 {
            assert!(ring.advance().is_empty());
        }
        // One tick from destruction: duplicate traffic reschedules
        assert!(ring.reschedule(&entry(1).key).is_some());
        for _ in 0..n - 2 {
            assert!(ring.advance().is_empty());
        }
        assert_eq!(ring.advance().len(), 1);
    }

    #[test]
    fn test_ring_deschedule_destroys_early() {
        let mut ring = TimeWaitRing::new(4);
        ring.insert(entry(1));
        ring.insert(entry(2));

        assert!(ring.deschedule(&entry(1).key).is_some());
        assert_eq!(ring.len(), 1);
        // Second deschedule of the same key is a no-op
        assert!(ring.deschedule(&entry(1).key).is_none());
        assert!(ring.lookup(&entry(2).key).is_some());
    }

    #[test]
    fn test_ring_lookup_finds_any_slot() {
        let mut ring = TimeWaitRing::new(4);
        ring.insert(entry(1));
        ring.advance();
        ring.insert(entry(2));
        assert!(ring.lookup(&entry(1).key).is_some());
        assert!(ring.lookup(&entry(2).key).is_some());
        assert!(ring.lookup(&entry(3).key).is_none());
    }

    #[test]
    fn test_sweep_registry_clock_interval() {
        let cfg = StackConfig::new();
        let sweeps = SweepRegistry::new();
        // Nothing referenced: the clock stays disarmed
        assert_eq!(sweeps.clock_interval_ms(&cfg), None);

        sweeps.add_ref(SweepKind::TimeWait);
        assert_eq!(sweeps.clock_interval_ms(&cfg), Some(cfg.time_wait_tick_ms));

        // The minimum cadence across referenced sweeps wins
        sweeps.add_ref(SweepKind::Keepalive);
        assert_eq!(sweeps.clock_interval_ms(&cfg), Some(cfg.keepalive_tick_ms));

        sweeps.remove_ref(SweepKind::Keepalive);
        assert_eq!(sweeps.clock_interval_ms(&cfg), Some(cfg.time_wait_tick_ms));
        sweeps.remove_ref(SweepKind::TimeWait);
        assert_eq!(sweeps.clock_interval_ms(&cfg), None);

        // Underflow stays saturated at zero
        sweeps.remove_ref(SweepKind::TimeWait);
        assert_eq!(sweeps.refs(SweepKind::TimeWait), 0);
    }
}
