//! Stack configuration.
//!
//! Every numeric policy constant in the stack (timeouts, retry ceilings,
//! quotas, sweep cadences, the TIME-WAIT ring size) lives here as a field of
//! [`StackConfig`] with a documented default. The embedder installs a
//! configuration once via [`init`]; all later reads go through [`config`],
//! which falls back to the defaults if `init` was never called.

use spin::Once;

/// Tunable parameters for the whole stack.
///
/// Defaults follow common practice (RFC 6298 timer bounds, 2*MSL TIME-WAIT,
/// 30-second reassembly lifetime) and are safe for general use.
#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    // === IP ===
    /// Default TTL for locally originated datagrams.
    pub ip_default_ttl: u8,
    /// MTU assumed when the device layer cannot resolve a route-specific one.
    pub default_mtu: usize,

    // === Reassembly ===
    /// Lifetime of a reassembly queue from first fragment to expiry (ms).
    /// The deadline is fixed at creation; fragment arrival does not extend it.
    pub frag_timeout_ms: u64,
    /// Maximum fragments buffered in a single reassembly queue.
    pub max_frags_per_queue: usize,
    /// Maximum buffered bytes in a single reassembly queue.
    pub max_bytes_per_queue: usize,
    /// Global cap on concurrent reassembly queues; the oldest queue is
    /// evicted when a new one would exceed this.
    pub max_reassembly_queues: usize,

    // === Memory accounting ===
    /// Per-socket send-side byte quota (truesize accounted).
    pub send_quota: usize,
    /// Per-socket receive-side byte quota (truesize accounted).
    pub recv_quota: usize,

    // === Retransmission ===
    /// Initial retransmission timeout (ms).
    pub initial_rto_ms: u64,
    /// Lower clamp for the computed RTO (ms). RFC 6298 recommends 1 second.
    pub min_rto_ms: u64,
    /// Upper clamp and backoff ceiling for the RTO (ms).
    pub max_rto_ms: u64,
    /// Consecutive retransmissions before an established connection is
    /// abandoned.
    pub max_retries: u8,
    /// Consecutive retransmissions before a connect attempt (SYN_SENT or
    /// SYN_RECV) fails with a timeout error.
    pub connect_retries: u8,
    /// Retransmission count at which a degraded-path hint is reported to
    /// the routing layer. Must be below `max_retries` to be useful.
    pub soft_retry_threshold: u8,

    // === Zero-window probing ===
    /// First probe interval once the peer advertises a zero window (ms).
    pub probe_initial_ms: u64,
    /// Probe interval ceiling; intervals double up to this (ms).
    pub probe_max_ms: u64,

    // === Delayed ACK ===
    /// Maximum time an owed ACK may be deferred (ms).
    pub delayed_ack_ms: u64,

    // === Fine timer scheduling ===
    /// Re-arm distance when a fine timer fires against a held socket lock (ms).
    pub defer_interval_ms: u64,

    // === Keepalive sweep ===
    /// Idle time before the first keepalive probe (ms).
    pub keepalive_idle_ms: u64,
    /// Interval between successive keepalive probes (ms).
    pub keepalive_interval_ms: u64,
    /// Unanswered probes before the connection is closed with a timeout.
    pub keepalive_probes: u8,
    /// Sockets examined per keepalive tick (round-robin chunk).
    pub keepalive_chunk: usize,
    /// Keepalive sweep cadence (ms).
    pub keepalive_tick_ms: u64,

    // === SYN-RECV retry sweep ===
    /// SYN-ACK retransmissions before a half-open entry is discarded.
    pub syn_retries: u8,
    /// First SYN-ACK retransmit interval (ms); doubles up to `syn_retry_max_ms`.
    pub syn_retry_initial_ms: u64,
    /// SYN-ACK retransmit interval ceiling (ms).
    pub syn_retry_max_ms: u64,
    /// SYN-RECV retry sweep cadence (ms).
    pub syn_sweep_ms: u64,
    /// Maximum half-open connections per listening socket.
    pub max_syn_backlog: usize,
    /// Maximum established-but-unaccepted connections per listening socket.
    pub max_accept_backlog: usize,

    // === TIME-WAIT ring ===
    /// Number of slots in the TIME-WAIT ring. An entry inserted at tick T is
    /// destroyed in `[T + N - 1, T + N]` ticks.
    pub time_wait_slots: usize,
    /// Ring advancement cadence (ms). slots * tick is the effective 2*MSL.
    pub time_wait_tick_ms: u64,

    // === Datagram sockets ===
    /// Maximum queued datagrams per UDP/RAW socket.
    pub max_rx_queue: usize,
}

impl StackConfig {
    /// The default configuration. 8 slots * 15 s gives the classic 120 s
    /// (2*MSL) TIME-WAIT lifetime.
    pub const fn new() -> Self {
        Self {
            ip_default_ttl: 64,
            default_mtu: 1500,
            frag_timeout_ms: 30_000,
            max_frags_per_queue: 64,
            max_bytes_per_queue: 512 * 1024,
            max_reassembly_queues: 4096,
            send_quota: 64 * 1024,
            recv_quota: 64 * 1024,
            initial_rto_ms: 1000,
            min_rto_ms: 1000,
            max_rto_ms: 120_000,
            max_retries: 15,
            connect_retries: 6,
            soft_retry_threshold: 3,
            probe_initial_ms: 5_000,
            probe_max_ms: 60_000,
            delayed_ack_ms: 200,
            defer_interval_ms: 10,
            keepalive_idle_ms: 7_200_000,
            keepalive_interval_ms: 75_000,
            keepalive_probes: 9,
            keepalive_chunk: 16,
            keepalive_tick_ms: 1_000,
            syn_retries: 5,
            syn_retry_initial_ms: 1_000,
            syn_retry_max_ms: 30_000,
            syn_sweep_ms: 1_000,
            max_syn_backlog: 128,
            max_accept_backlog: 128,
            time_wait_slots: 8,
            time_wait_tick_ms: 15_000,
            max_rx_queue: 64,
        }
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::new()
    }
}

static CONFIG: Once<StackConfig> = Once::new();

/// Install the stack configuration. Only the first call takes effect;
/// returns `false` if a configuration was already installed.
pub fn init(cfg: StackConfig) -> bool {
    let mut first = false;
    CONFIG.call_once(|| {
        first = true;
        cfg
    });
    first
}

/// Get the active configuration, installing the defaults on first use.
#[inline]
pub fn config() -> &'static StackConfig {
    CONFIG.call_once(StackConfig::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let cfg = StackConfig::new();
        assert!(cfg.min_rto_ms <= cfg.max_rto_ms);
        assert!(cfg.initial_rto_ms >= cfg.min_rto_ms);
        assert!(cfg.soft_retry_threshold < cfg.max_retries);
        assert!(cfg.time_wait_slots >= 2);
        // 2*MSL with the default ring geometry
        assert_eq!(
            cfg.time_wait_slots as u64 * cfg.time_wait_tick_ms,
            120_000
        );
    }
}
