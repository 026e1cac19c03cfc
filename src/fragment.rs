//! IPv4 fragment reassembly.
//!
//! Reassembly queues are keyed by (src, dst, protocol, identification) per
//! RFC 791 and track missing ranges with an RFC 815 hole list. Overlaps are
//! resolved first-writer-wins: an arriving fragment is clipped to the
//! current holes, so bytes already committed are never overwritten and the
//! reassembled datagram does not depend on arrival order beyond who wrote
//! each byte first.
//!
//! A queue's deadline is fixed at creation and never extended by later
//! fragments. A fragment that finds its queue already expired discards the
//! stale queue and starts a fresh one, so one timed-out datagram cannot
//! poison a retransmitted datagram that reuses the same identification.
//!
//! Anti-DoS bounds: per-queue fragment and byte caps, and a global queue
//! cap with oldest-first eviction.
//!
//! # References
//! - RFC 791: Internet Protocol (fragmentation)
//! - RFC 815: IP Datagram Reassembly Algorithms

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, Once};

use crate::config::{config, StackConfig};
use crate::ipv4::Ipv4Header;

/// Maximum reassembled packet size (IPv4 max is 65535)
pub const MAX_PACKET_SIZE: usize = 65_535;

/// Minimum L4 header bytes required in the first fragment
/// (8 bytes covers the UDP header and the TCP port pair)
pub const MIN_L4_HEADER_BYTES: usize = 8;

// ============================================================================
// Statistics
// ============================================================================

/// Fragment reassembly statistics
#[derive(Debug, Default)]
pub struct FragmentStats {
    /// Fragments received
    pub fragments_received: AtomicU64,
    /// Successfully reassembled packets
    pub reassembled: AtomicU64,
    /// Queues dropped due to timeout (sweep or arrival-time)
    pub timeout_drops: AtomicU64,
    /// Fragments fully covered by committed data and ignored
    pub duplicate_frags: AtomicU64,
    /// Fragments partially clipped against committed data
    pub clipped_frags: AtomicU64,
    /// Fragments dropped due to per-queue or global limits
    pub limit_drops: AtomicU64,
    /// Queues evicted to make room under the global cap
    pub evictions: AtomicU64,
    /// Fragments dropped as malformed (zero length, inconsistent last,
    /// beyond max packet size, short first fragment)
    pub malformed_drops: AtomicU64,
    /// Current active queues
    pub active_queues: AtomicU32,
    /// Current buffered fragment ranges
    pub buffered_fragments: AtomicU32,
    /// Current buffered bytes
    pub buffered_bytes: AtomicU64,
}

impl FragmentStats {
    pub const fn new() -> Self {
        Self {
            fragments_received: AtomicU64::new(0),
            reassembled: AtomicU64::new(0),
            timeout_drops: AtomicU64::new(0),
            duplicate_frags: AtomicU64::new(0),
            clipped_frags: AtomicU64::new(0),
            limit_drops: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            malformed_drops: AtomicU64::new(0),
            active_queues: AtomicU32::new(0),
            buffered_fragments: AtomicU32::new(0),
            buffered_bytes: AtomicU64::new(0),
        }
    }

    fn queue_removed(&self, ranges: usize, bytes: usize) {
        self.active_queues.fetch_sub(1, Ordering::Relaxed);
        self.buffered_fragments
            .fetch_sub(ranges as u32, Ordering::Relaxed);
        self.buffered_bytes.fetch_sub(bytes as u64, Ordering::Relaxed);
    }
}

// ============================================================================
// Drop Reasons
// ============================================================================

/// Reason a fragment was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentDropReason {
    /// Fragment would extend beyond the maximum packet size
    TooLarge,
    /// Queue has too many fragment ranges
    QueueFragLimit,
    /// Queue has too many buffered bytes
    QueueByteLimit,
    /// Global queue limit exceeded and nothing could be evicted
    GlobalQueueLimit,
    /// First fragment too small to contain an L4 header
    FirstTooSmall,
    /// An MF=0 fragment claimed a total length below data already buffered
    InconsistentLast,
    /// Zero-length fragment
    ZeroLength,
}

// ============================================================================
// Fragment Key
// ============================================================================

/// Key identifying a reassembly queue.
///
/// Ord is derived so the key can be used directly in a BTreeMap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FragmentKey {
    pub src: [u8; 4],
    pub dst: [u8; 4],
    pub protocol: u8,
    pub identification: u16,
}

impl FragmentKey {
    /// Create key from IPv4 header
    pub fn from_header(hdr: &Ipv4Header) -> Self {
        Self {
            src: hdr.src.octets(),
            dst: hdr.dst.octets(),
            protocol: hdr.protocol,
            identification: hdr.identification,
        }
    }
}

// ============================================================================
// Fragment Hole Tracking (RFC 815)
// ============================================================================

/// A gap [start, end) that still needs to be filled
#[derive(Debug, Clone, Copy)]
struct FragmentHole {
    start: u16,
    end: u16,
}

/// Per-queue limits, copied from [`StackConfig`] at cache construction
#[derive(Debug, Clone, Copy)]
struct FragLimits {
    timeout_ms: u64,
    max_frags_per_queue: usize,
    max_bytes_per_queue: usize,
    max_queues: usize,
}

impl FragLimits {
    fn from_config(cfg: &StackConfig) -> Self {
        Self {
            timeout_ms: cfg.frag_timeout_ms,
            max_frags_per_queue: cfg.max_frags_per_queue,
            max_bytes_per_queue: cfg.max_bytes_per_queue,
            max_queues: cfg.max_reassembly_queues,
        }
    }
}

// ============================================================================
// Fragment Queue
// ============================================================================

/// Outcome of inserting one fragment into a queue
struct InsertOutcome {
    /// All holes filled, first and last fragments present
    complete: bool,
    /// Bytes actually committed (after clipping)
    accepted_bytes: usize,
    /// Ranges committed (0 for a full duplicate)
    accepted_ranges: usize,
    /// Fragment intersected committed data and lost the overlap
    clipped: bool,
}

/// A single reassembly queue for one IP datagram
struct FragmentQueue {
    /// Creation timestamp (ms)
    created_ms: u64,
    /// Expiration timestamp (ms). Fixed at creation; arrival never extends it.
    expires_at_ms: u64,
    /// Total length once the MF=0 fragment is seen
    total_len: Option<u16>,
    /// Committed fragment ranges
    range_count: usize,
    /// Committed bytes
    byte_count: usize,
    /// Gaps still to fill
    holes: Vec<FragmentHole>,
    /// Committed data keyed by byte offset. Ranges never overlap.
    frags: BTreeMap<u16, Vec<u8>>,
    /// Zero-offset fragment received
    have_first: bool,
    /// MF=0 fragment received
    have_last: bool,
}

impl FragmentQueue {
    fn new(now_ms: u64, timeout_ms: u64) -> Self {
        Self {
            created_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(timeout_ms),
            total_len: None,
            range_count: 0,
            byte_count: 0,
            // Initial hole: the entire possible packet range
            holes: alloc::vec![FragmentHole {
                start: 0,
                end: u16::MAX,
            }],
            frags: BTreeMap::new(),
            have_first: false,
            have_last: false,
        }
    }

    /// Insert a fragment, clipping it to the current holes.
    ///
    /// Committed bytes are never overwritten; whatever part of the fragment
    /// lands on a hole is kept, the rest is discarded. A fragment with no
    /// intersection with any hole is a duplicate and changes nothing.
    fn insert(
        &mut self,
        offset: u16,
        more_fragments: bool,
        data: &[u8],
        limits: &FragLimits,
    ) -> Result<InsertOutcome, FragmentDropReason> {
        let len = data.len() as u16;
        if len == 0 {
            return Err(FragmentDropReason::ZeroLength);
        }

        let frag_start = offset;
        let frag_end = offset
            .checked_add(len)
            .ok_or(FragmentDropReason::TooLarge)?;
        if frag_end as usize > MAX_PACKET_SIZE {
            return Err(FragmentDropReason::TooLarge);
        }

        if self.range_count >= limits.max_frags_per_queue {
            return Err(FragmentDropReason::QueueFragLimit);
        }
        // Conservative cap check up front: counts the full fragment even
        // when clipping would commit less, but keeps the insert all-or-nothing
        if self.byte_count.saturating_add(data.len()) > limits.max_bytes_per_queue {
            return Err(FragmentDropReason::QueueByteLimit);
        }

        let is_first = offset == 0;
        if is_first && data.len() < MIN_L4_HEADER_BYTES {
            return Err(FragmentDropReason::FirstTooSmall);
        }

        let is_last = !more_fragments;
        if is_last {
            // A last fragment fixing the total length below data already
            // buffered describes a different datagram
            for (&off, stored) in &self.frags {
                if off.saturating_add(stored.len() as u16) > frag_end {
                    return Err(FragmentDropReason::InconsistentLast);
                }
            }
        }

        // The first MF=0 fragment fixes the total length; a later one only
        // contributes data within the already-fixed range
        let max_end = match self.total_len {
            Some(t) => t,
            None if is_last => frag_end,
            None => u16::MAX,
        };

        // Clip the fragment to the holes, committing each covered sub-range
        let mut new_holes = Vec::with_capacity(self.holes.len() + 1);
        let mut accepted_bytes = 0usize;
        let mut accepted_ranges = 0usize;
        let mut covered_all = true;

        for hole in self.holes.drain(..) {
            if hole.start >= max_end {
                continue;
            }
            let hole_end = hole.end.min(max_end);

            let inter_start = frag_start.max(hole.start);
            let inter_end = frag_end.min(hole_end);
            if inter_start >= inter_end {
                // No intersection with this hole
                new_holes.push(FragmentHole {
                    start: hole.start,
                    end: hole_end,
                });
                continue;
            }

            // Commit the covered sub-range
            let lo = (inter_start - frag_start) as usize;
            let hi = (inter_end - frag_start) as usize;
            self.frags.insert(inter_start, data[lo..hi].to_vec());
            accepted_bytes += hi - lo;
            accepted_ranges += 1;
            if inter_start > frag_start || inter_end < frag_end {
                covered_all = false;
            }

            // Split the hole around the committed range
            if hole.start < inter_start {
                new_holes.push(FragmentHole {
                    start: hole.start,
                    end: inter_start,
                });
            }
            if inter_end < hole_end {
                new_holes.push(FragmentHole {
                    start: inter_end,
                    end: hole_end,
                });
            }
        }

        new_holes.sort_by_key(|h| h.start);
        self.holes = new_holes;

        if is_first {
            self.have_first = true;
        }
        if is_last {
            self.have_last = true;
            if self.total_len.is_none() {
                self.total_len = Some(frag_end);
            }
        }
        self.range_count += accepted_ranges;
        self.byte_count += accepted_bytes;

        Ok(InsertOutcome {
            complete: self.is_complete(),
            accepted_bytes,
            accepted_ranges,
            clipped: accepted_bytes > 0 && !covered_all,
        })
    }

    /// All fragments received
    fn is_complete(&self) -> bool {
        self.have_first && self.have_last && self.holes.is_empty()
    }

    /// Concatenate committed ranges in offset order
    fn reassemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }

        let total = self.total_len? as usize;
        if total > MAX_PACKET_SIZE {
            return None;
        }

        let mut buf = alloc::vec![0u8; total];
        for (&off, frag) in &self.frags {
            let start = off as usize;
            let end = start + frag.len();
            if end > total {
                return None;
            }
            buf[start..end].copy_from_slice(frag);
        }
        Some(buf)
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

// ============================================================================
// Fragment Cache (Global State)
// ============================================================================

/// Global fragment reassembly cache
pub struct FragmentCache {
    /// Active reassembly queues keyed by FragmentKey
    queues: Mutex<BTreeMap<FragmentKey, FragmentQueue>>,
    limits: FragLimits,
    stats: FragmentStats,
}

impl FragmentCache {
    /// Create a cache using the installed stack configuration
    pub fn from_config(cfg: &StackConfig) -> Self {
        Self {
            queues: Mutex::new(BTreeMap::new()),
            limits: FragLimits::from_config(cfg),
            stats: FragmentStats::new(),
        }
    }

    /// Process an incoming fragment.
    ///
    /// Returns:
    /// - Ok(Some(payload)) if reassembly is complete
    /// - Ok(None) if more fragments are needed (duplicates land here too)
    /// - Err(reason) if the fragment was dropped
    pub fn process_fragment(
        &self,
        header: &Ipv4Header,
        payload: &[u8],
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, FragmentDropReason> {
        self.stats
            .fragments_received
            .fetch_add(1, Ordering::Relaxed);

        let key = FragmentKey::from_header(header);
        // Fragment offset is in 8-byte units
        let offset = header.fragment_offset() * 8;
        let more_fragments = header.more_fragments();

        let mut queues = self.queues.lock();

        // An expired queue hit on arrival is discarded; the arriving
        // fragment starts a fresh queue below, so the stale datagram cannot
        // contaminate a retransmission reusing the identification
        if let Some(queue) = queues.get(&key) {
            if queue.is_expired(now_ms) {
                let (ranges, bytes) = (queue.range_count, queue.byte_count);
                queues.remove(&key);
                self.stats.timeout_drops.fetch_add(1, Ordering::Relaxed);
                self.stats.queue_removed(ranges, bytes);
                log::debug!(
                    "fragment: expired queue id={:#06x} replaced on arrival",
                    key.identification
                );
            }
        }

        if !queues.contains_key(&key) {
            // Global cap: evict the oldest queue rather than dropping the
            // new fragment, so a flood of never-completed datagrams cannot
            // starve live traffic
            if queues.len() >= self.limits.max_queues {
                let oldest = queues
                    .iter()
                    .min_by_key(|(_, q)| q.created_ms)
                    .map(|(&k, _)| k);
                match oldest {
                    Some(evict_key) => {
                        if let Some(evicted) = queues.remove(&evict_key) {
                            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                            self.stats
                                .queue_removed(evicted.range_count, evicted.byte_count);
                        }
                    }
                    None => {
                        self.stats.limit_drops.fetch_add(1, Ordering::Relaxed);
                        return Err(FragmentDropReason::GlobalQueueLimit);
                    }
                }
            }
            queues.insert(key, FragmentQueue::new(now_ms, self.limits.timeout_ms));
            self.stats.active_queues.fetch_add(1, Ordering::Relaxed);
        }

        // Present after the block above
        let queue = match queues.get_mut(&key) {
            Some(q) => q,
            None => return Err(FragmentDropReason::GlobalQueueLimit),
        };
        let created_fresh = queue.range_count == 0;

        match queue.insert(offset, more_fragments, payload, &self.limits) {
            Ok(outcome) => {
                self.stats
                    .buffered_fragments
                    .fetch_add(outcome.accepted_ranges as u32, Ordering::Relaxed);
                self.stats
                    .buffered_bytes
                    .fetch_add(outcome.accepted_bytes as u64, Ordering::Relaxed);
                if outcome.clipped {
                    self.stats.clipped_frags.fetch_add(1, Ordering::Relaxed);
                }
                if outcome.accepted_bytes == 0 {
                    self.stats.duplicate_frags.fetch_add(1, Ordering::Relaxed);
                }

                if outcome.complete {
                    let result = queue.reassemble();
                    let (ranges, bytes) = (queue.range_count, queue.byte_count);
                    queues.remove(&key);
                    self.stats.queue_removed(ranges, bytes);
                    self.stats.reassembled.fetch_add(1, Ordering::Relaxed);
                    Ok(result)
                } else {
                    Ok(None)
                }
            }
            Err(reason) => {
                // A queue created for a fragment that was then rejected
                // holds nothing; drop it rather than pinning an empty entry
                // for the full timeout
                if created_fresh && queue.range_count == 0 {
                    queues.remove(&key);
                    self.stats.active_queues.fetch_sub(1, Ordering::Relaxed);
                }
                match reason {
                    FragmentDropReason::QueueFragLimit
                    | FragmentDropReason::QueueByteLimit
                    | FragmentDropReason::GlobalQueueLimit => {
                        self.stats.limit_drops.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        self.stats.malformed_drops.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(reason)
            }
        }
    }

    /// Drop every queue whose deadline has passed.
    ///
    /// Called from the coarse timer path. Returns the number of queues
    /// dropped.
    pub fn cleanup_expired(&self, now_ms: u64) -> usize {
        let mut queues = self.queues.lock();

        let expired: Vec<FragmentKey> = queues
            .iter()
            .filter(|(_, q)| q.is_expired(now_ms))
            .map(|(&k, _)| k)
            .collect();

        let count = expired.len();
        for key in expired {
            if let Some(q) = queues.remove(&key) {
                self.stats.timeout_drops.fetch_add(1, Ordering::Relaxed);
                self.stats.queue_removed(q.range_count, q.byte_count);
            }
        }
        count
    }

    /// Get current statistics
    pub fn stats(&self) -> &FragmentStats {
        &self.stats
    }
}

// ============================================================================
// Global Instance
// ============================================================================

static FRAGMENT_CACHE: Once<FragmentCache> = Once::new();

/// Get the global fragment cache
pub fn fragment_cache() -> &'static FragmentCache {
    FRAGMENT_CACHE.call_once(|| FragmentCache::from_config(config()))
}

/// Process an incoming IP fragment through the global cache
pub fn process_fragment(
    header: &Ipv4Header,
    payload: &[u8],
    now_ms: u64,
) -> Result<Option<Vec<u8>>, FragmentDropReason> {
    fragment_cache().process_fragment(header, payload, now_ms)
}

/// Run fragment timeout cleanup on the global cache
pub fn cleanup_expired_fragments(now_ms: u64) -> usize {
    fragment_cache().cleanup_expired(now_ms)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::{fragment_packet, parse_ipv4, Ipv4Addr};

    fn make_header(src: [u8; 4], id: u16, offset: u16, mf: bool) -> Ipv4Header {
        let flags_frag = if mf { 0x2000 | offset } else { offset };
        Ipv4Header {
            version: 4,
            ihl: 5,
            dscp_ecn: 0,
            total_len: 0,
            identification: id,
            flags_fragment: flags_frag,
            ttl: 64,
            protocol: 17, // UDP
            checksum: 0,
            src: Ipv4Addr(src),
            dst: Ipv4Addr([192, 168, 1, 1]),
            options_len: 0,
        }
    }

    fn test_cache() -> FragmentCache {
        FragmentCache::from_config(&StackConfig::new())
    }

    #[test]
    fn test_fragment_key() {
        let hdr = make_header([10, 0, 0, 1], 0x1234, 0, true);
        let key = FragmentKey::from_header(&hdr);
        assert_eq!(key.src, [10, 0, 0, 1]);
        assert_eq!(key.identification, 0x1234);
    }

    #[test]
    fn test_simple_reassembly() {
        let cache = test_cache();
        let now = 1000u64;

        // Fragment 1: offset 0, MF=1
        let hdr1 = make_header([10, 0, 0, 1], 0x1234, 0, true);
        let data1 = [1u8; 16];

        // Fragment 2: offset 2 units (16 bytes), MF=0
        let hdr2 = make_header([10, 0, 0, 1], 0x1234, 2, false);
        let data2 = [2u8; 16];

        assert_eq!(cache.process_fragment(&hdr1, &data1, now), Ok(None));
        let packet = cache
            .process_fragment(&hdr2, &data2, now)
            .unwrap()
            .unwrap();
        assert_eq!(packet.len(), 32);
        assert_eq!(&packet[0..16], &[1u8; 16]);
        assert_eq!(&packet[16..32], &[2u8; 16]);
        assert_eq!(cache.stats().active_queues.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_first_writer_wins_on_overlap() {
        let cache = test_cache();
        let now = 1000u64;

        // 16 bytes of 1s at offset 0
        let hdr1 = make_header([10, 0, 0, 1], 0x5678, 0, true);
        assert_eq!(cache.process_fragment(&hdr1, &[1u8; 16], now), Ok(None));

        // 16 bytes of 2s at offset 8: bytes 8..16 collide with committed
        // data and must lose; bytes 16..24 fill the hole. MF=0 fixes the
        // total length at 24.
        let hdr2 = make_header([10, 0, 0, 1], 0x5678, 1, false);
        let packet = cache
            .process_fragment(&hdr2, &[2u8; 16], now)
            .unwrap()
            .unwrap();

        assert_eq!(packet.len(), 24);
        assert_eq!(&packet[0..16], &[1u8; 16]);
        assert_eq!(&packet[16..24], &[2u8; 8]);
        assert_eq!(cache.stats().clipped_frags.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_duplicate_ignored() {
        let cache = test_cache();
        let now = 1000u64;

        let hdr1 = make_header([10, 0, 0, 1], 0x0042, 0, true);
        assert_eq!(cache.process_fragment(&hdr1, &[1u8; 16], now), Ok(None));
        // Exact duplicate: no hole intersection, silently ignored
        assert_eq!(cache.process_fragment(&hdr1, &[9u8; 16], now), Ok(None));
        assert_eq!(cache.stats().duplicate_frags.load(Ordering::Relaxed), 1);

        let hdr2 = make_header([10, 0, 0, 1], 0x0042, 2, false);
        let packet = cache
            .process_fragment(&hdr2, &[2u8; 8], now)
            .unwrap()
            .unwrap();
        assert_eq!(&packet[0..16], &[1u8; 16]);
    }

    #[test]
    fn test_timeout_isolation() {
        let cfg = StackConfig::new();
        let cache = test_cache();

        // Start a datagram that never completes
        let hdr = make_header([10, 0, 0, 1], 0x0777, 0, true);
        assert_eq!(cache.process_fragment(&hdr, &[9u8; 16], 0), Ok(None));

        // Past the deadline, the same key arrives again; the stale queue is
        // replaced, not reported as an error, and the fresh datagram
        // reassembles from only its own fragments
        let later = cfg.frag_timeout_ms + 1;
        let hdr1 = make_header([10, 0, 0, 1], 0x0777, 0, true);
        assert_eq!(cache.process_fragment(&hdr1, &[1u8; 16], later), Ok(None));
        assert_eq!(cache.stats().timeout_drops.load(Ordering::Relaxed), 1);

        let hdr2 = make_header([10, 0, 0, 1], 0x0777, 2, false);
        let packet = cache
            .process_fragment(&hdr2, &[2u8; 8], later)
            .unwrap()
            .unwrap();
        assert_eq!(packet.len(), 24);
        assert_eq!(&packet[0..16], &[1u8; 16]);
    }

    #[test]
    fn test_sweep_cleanup() {
        let cfg = StackConfig::new();
        let cache = test_cache();

        let hdr = make_header([10, 0, 0, 1], 0x0abc, 0, true);
        assert_eq!(cache.process_fragment(&hdr, &[1u8; 16], 0), Ok(None));
        assert_eq!(cache.cleanup_expired(cfg.frag_timeout_ms - 1), 0);
        assert_eq!(cache.cleanup_expired(cfg.frag_timeout_ms), 1);
        assert_eq!(cache.stats().active_queues.load(Ordering::Relaxed), 0);
        assert_eq!(cache.stats().buffered_bytes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_first_fragment_too_small() {
        let cache = test_cache();
        let hdr = make_header([10, 0, 0, 1], 0x9abc, 0, true);
        assert_eq!(
            cache.process_fragment(&hdr, &[1u8; 4], 0),
            Err(FragmentDropReason::FirstTooSmall)
        );
        // Rejected first fragment must not pin an empty queue
        assert_eq!(cache.stats().active_queues.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_oldest_queue_evicted_at_cap() {
        let mut cfg = StackConfig::new();
        cfg.max_reassembly_queues = 2;
        let cache = FragmentCache::from_config(&cfg);

        let h1 = make_header([10, 0, 0, 1], 1, 0, true);
        let h2 = make_header([10, 0, 0, 1], 2, 0, true);
        let h3 = make_header([10, 0, 0, 1], 3, 0, true);
        assert_eq!(cache.process_fragment(&h1, &[1u8; 16], 100), Ok(None));
        assert_eq!(cache.process_fragment(&h2, &[1u8; 16], 200), Ok(None));
        assert_eq!(cache.process_fragment(&h3, &[1u8; 16], 300), Ok(None));

        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().active_queues.load(Ordering::Relaxed), 2);

        // The evicted queue was the oldest (id 1): its completion now needs
        // both fragments again
        let h1_last = make_header([10, 0, 0, 1], 1, 2, false);
        assert_eq!(cache.process_fragment(&h1_last, &[2u8; 8], 400), Ok(None));
    }

    #[test]
    fn test_scrambled_refragmented_roundtrip() {
        // Build a 9000-byte datagram, fragment it at MTU 1500, and feed the
        // fragments back in scrambled order
        let mut payload = Vec::with_capacity(9000);
        for i in 0..9000usize {
            payload.push((i % 251) as u8);
        }
        let mut pkt = crate::ipv4::build_ipv4_header(
            Ipv4Addr::new(192, 168, 0, 1),
            Ipv4Addr::new(192, 168, 0, 2),
            crate::ipv4::Ipv4Proto::Udp,
            9000,
            64,
            0x7001,
            false,
        )
        .to_vec();
        pkt.extend_from_slice(&payload);

        let frags = fragment_packet(&pkt, 1500).unwrap();
        assert_eq!(frags.len(), 7);

        let order = [3usize, 0, 6, 1, 5, 2, 4];
        let cache = test_cache();
        let mut result = None;
        for &i in &order {
            let (hdr, _, frag_payload) = parse_ipv4(&frags[i]).unwrap();
            match cache.process_fragment(&hdr, frag_payload, 1000) {
                Ok(Some(done)) => result = Some(done),
                Ok(None) => {}
                Err(e) => panic!("fragment {} dropped: {:?}", i, e),
            }
        }
        assert_eq!(result.unwrap(), payload);
    }
}
