//! TCP wire format and per-connection reliability engine.
//!
//! This module owns everything that operates on a single TCP connection's
//! state: header/option codecs, wraparound-safe sequence arithmetic, the
//! control block, RFC 6298 RTT estimation, RFC 5681 congestion control with
//! NewReno recovery, the SACK scoreboard, the retransmission-timeout fire
//! sequence, zero-window probing, and delayed-ACK pacing. Socket plumbing
//! (queues, accounting, demux) lives in `socket`; timer scheduling lives in
//! `timer`.
//!
//! # TCP Header Format (RFC 793)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Source Port           |       Destination Port        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                        Sequence Number                        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                     Acknowledgment Number                     |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Data  |       |U|A|P|R|S|F|                                   |
//! | Offs  | Resv  |R|C|S|S|Y|I|            Window                 |
//! |       |       |G|K|H|T|N|N|                                   |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |           Checksum            |         Urgent Pointer        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Options (if data offset > 5)               |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! Congestion state (`cwnd`, `ssthresh`) is kept in whole segments, not
//! bytes; byte conversion happens only at the send-window boundary.
//!
//! # References
//!
//! - RFC 793: Transmission Control Protocol
//! - RFC 2018: TCP Selective Acknowledgment Options
//! - RFC 5681: TCP Congestion Control
//! - RFC 6298: Computing TCP's Retransmission Timer
//! - RFC 6528: Defending Against Sequence Number Attacks
//! - RFC 6582: The NewReno Modification to TCP's Fast Recovery

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::StackConfig;
use crate::ipv4::{compute_checksum, Ipv4Addr};

// ============================================================================
// TCP Constants
// ============================================================================

/// TCP header minimum length in bytes (without options)
pub const TCP_HEADER_MIN_LEN: usize = 20;

/// TCP header maximum length in bytes (with max options)
pub const TCP_HEADER_MAX_LEN: usize = 60;

/// TCP protocol number (for IPv4)
pub const TCP_PROTO: u8 = 6;

/// Maximum Segment Size default (RFC 879)
pub const TCP_DEFAULT_MSS: u16 = 536;

/// Maximum Segment Size for Ethernet (1500 - 20 IP - 20 TCP)
pub const TCP_ETHERNET_MSS: u16 = 1460;

/// Default receive window size
pub const TCP_DEFAULT_WINDOW: u16 = 65535;

/// Maximum window scale shift factor per RFC 7323
pub const TCP_MAX_WINDOW_SCALE: u8 = 14;

/// Initial slow-start threshold in segments. Effectively "unlimited" so
/// slow start runs until the first loss event sets a real threshold.
pub const TCP_INITIAL_SSTHRESH: u32 = u32::MAX / 2;

/// Initial congestion window in segments per RFC 5681 Section 3.1.
///
/// IW = min(4*SMSS, max(2*SMSS, 4380 bytes)), expressed in segments.
#[inline]
pub fn initial_cwnd(smss: u16) -> u32 {
    let smss = (smss as u32).max(1);
    let iw_bytes = core::cmp::min(4 * smss, core::cmp::max(2 * smss, 4380));
    (iw_bytes / smss).max(2)
}

// ============================================================================
// TCP Flags
// ============================================================================

/// FIN flag - sender has finished sending
pub const TCP_FLAG_FIN: u8 = 0x01;
/// SYN flag - synchronize sequence numbers
pub const TCP_FLAG_SYN: u8 = 0x02;
/// RST flag - reset the connection
pub const TCP_FLAG_RST: u8 = 0x04;
/// PSH flag - push function
pub const TCP_FLAG_PSH: u8 = 0x08;
/// ACK flag - acknowledgment field is significant
pub const TCP_FLAG_ACK: u8 = 0x10;
/// URG flag - urgent pointer field is significant
pub const TCP_FLAG_URG: u8 = 0x20;

// ============================================================================
// TCP State Machine
// ============================================================================

/// TCP connection state per RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// No connection state at all
    Closed,
    /// Waiting for a connection request from any remote TCP
    Listen,
    /// Waiting for a matching connection request after having sent one
    SynSent,
    /// Waiting for confirming connection request acknowledgment
    SynReceived,
    /// Open connection, data can be exchanged
    Established,
    /// Local close sent, waiting for ACK or peer FIN
    FinWait1,
    /// Local close acknowledged, waiting for peer FIN
    FinWait2,
    /// Peer closed, local side may still send
    CloseWait,
    /// Both sides closed simultaneously, waiting for FIN ACK
    Closing,
    /// Peer closed first, waiting for ACK of our FIN
    LastAck,
    /// Final quarantine before the 4-tuple can be reused
    TimeWait,
}

impl TcpState {
    /// Connection may accept application data for transmission
    pub fn can_send(&self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// Connection may receive data from the peer
    pub fn can_receive(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }

    /// Handshake not yet completed
    pub fn is_connecting(&self) -> bool {
        matches!(self, TcpState::SynSent | TcpState::SynReceived)
    }

    /// Local FIN has been sent and the connection is winding down
    pub fn is_half_closed(&self) -> bool {
        matches!(
            self,
            TcpState::FinWait1 | TcpState::FinWait2 | TcpState::Closing | TcpState::LastAck
        )
    }

    /// Sequence numbers have been synchronized (post handshake)
    pub fn is_synchronized(&self) -> bool {
        !matches!(
            self,
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived
        )
    }
}

// ============================================================================
// Congestion Control State Machine (RFC 5681)
// ============================================================================

/// Congestion control phase per RFC 5681.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpCongestionState {
    /// Exponential cwnd growth (cwnd < ssthresh): +1 segment per new ACK.
    SlowStart,
    /// Linear growth: +1 segment per cwnd's worth of ACKs.
    CongestionAvoidance,
    /// After triple duplicate ACK, until the recovery point is acked.
    FastRecovery,
}

impl Default for TcpCongestionState {
    fn default() -> Self {
        Self::SlowStart
    }
}

/// Result of ACK processing, input to congestion control.
#[derive(Debug, Default, Clone, Copy)]
pub struct AckUpdate {
    /// Newly acknowledged bytes (0 for a duplicate ACK).
    pub newly_acked: u32,
    /// True if this ACK did not advance snd_una.
    pub duplicate: bool,
}

/// Transmission action requested by congestion control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionAction {
    /// No immediate transmission change needed.
    None,
    /// Fast retransmit of the first unacknowledged segment.
    FastRetransmit,
    /// RFC 3042 Limited Transmit: send one new segment on an early dup ACK.
    LimitedTransmit,
    /// NewReno partial ACK: retransmit the next unacked segment, stay in
    /// fast recovery.
    RetransmitNext,
}

// ============================================================================
// TCP Header
// ============================================================================

/// Parsed TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Sequence number
    pub seq_num: u32,
    /// Acknowledgment number (valid if ACK flag set)
    pub ack_num: u32,
    /// Data offset in 32-bit words (5-15)
    pub data_offset: u8,
    /// Reserved bits
    pub reserved: u8,
    /// Control flags
    pub flags: u8,
    /// Receive window size
    pub window: u16,
    /// Checksum
    pub checksum: u16,
    /// Urgent pointer (valid if URG flag set)
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Create a new TCP header with the given parameters
    pub fn new(
        src_port: u16,
        dst_port: u16,
        seq_num: u32,
        ack_num: u32,
        flags: u8,
        window: u16,
    ) -> Self {
        Self {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            data_offset: 5, // No options, 20 bytes
            reserved: 0,
            flags,
            window,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    /// Get the header length in bytes
    pub fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    /// Check if SYN flag is set
    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    /// Check if ACK flag is set
    pub fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    /// Check if FIN flag is set
    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    /// Check if RST flag is set
    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }

    /// Check if PSH flag is set
    pub fn is_psh(&self) -> bool {
        self.flags & TCP_FLAG_PSH != 0
    }

    /// Serialize header to bytes (checksum field as stored)
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_MIN_LEN] {
        let mut bytes = [0u8; TCP_HEADER_MIN_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.seq_num.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack_num.to_be_bytes());
        // Data offset (4 bits) + reserved (4 bits)
        bytes[12] = (self.data_offset << 4) | (self.reserved & 0x0F);
        bytes[13] = self.flags;
        bytes[14..16].copy_from_slice(&self.window.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        bytes
    }
}

// ============================================================================
// TCP Options
// ============================================================================

/// TCP option kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOptionKind {
    /// End of option list
    EndOfList,
    /// No-operation (padding)
    Nop,
    /// Maximum Segment Size
    Mss(u16),
    /// Window Scale (RFC 7323)
    WindowScale(u8),
    /// Selective Acknowledgment Permitted (RFC 2018)
    SackPermitted,
    /// Selective Acknowledgment blocks (RFC 2018), up to 4
    Sack(Vec<(u32, u32)>),
    /// Timestamps (RFC 7323)
    Timestamps { ts_val: u32, ts_ecr: u32 },
}

/// Parsed TCP options
#[derive(Debug, Clone, Default)]
pub struct TcpOptions {
    /// Maximum Segment Size
    pub mss: Option<u16>,
    /// Window Scale factor
    pub window_scale: Option<u8>,
    /// SACK permitted
    pub sack_permitted: bool,
    /// SACK blocks, each a [left, right) sequence range
    pub sack_blocks: Vec<(u32, u32)>,
    /// Timestamps
    pub timestamps: Option<(u32, u32)>,
}

/// Serialize a single TCP option to bytes.
pub fn serialize_tcp_option(option: &TcpOptionKind) -> Vec<u8> {
    match option {
        TcpOptionKind::EndOfList => vec![0],
        TcpOptionKind::Nop => vec![1],
        TcpOptionKind::Mss(mss) => {
            let mut bytes = Vec::with_capacity(4);
            bytes.extend_from_slice(&[2, 4]); // kind=2, len=4
            bytes.extend_from_slice(&mss.to_be_bytes());
            bytes
        }
        TcpOptionKind::WindowScale(scale) => vec![3, 3, *scale], // kind=3, len=3
        TcpOptionKind::SackPermitted => vec![4, 2],              // kind=4, len=2
        TcpOptionKind::Sack(blocks) => {
            let n = blocks.len().min(4);
            let mut bytes = Vec::with_capacity(2 + n * 8);
            bytes.push(5); // kind=5
            bytes.push((2 + n * 8) as u8);
            for &(left, right) in blocks.iter().take(n) {
                bytes.extend_from_slice(&left.to_be_bytes());
                bytes.extend_from_slice(&right.to_be_bytes());
            }
            bytes
        }
        TcpOptionKind::Timestamps { ts_val, ts_ecr } => {
            let mut bytes = Vec::with_capacity(10);
            bytes.extend_from_slice(&[8, 10]); // kind=8, len=10
            bytes.extend_from_slice(&ts_val.to_be_bytes());
            bytes.extend_from_slice(&ts_ecr.to_be_bytes());
            bytes
        }
    }
}

/// Serialize a slice of TCP options with padding to a 32-bit boundary.
///
/// Appends an End-of-List marker if not already present, then pads.
/// Returns an empty Vec when no options are given.
pub fn serialize_tcp_options(options: &[TcpOptionKind]) -> Vec<u8> {
    if options.is_empty() {
        return Vec::new();
    }

    let mut bytes = Vec::new();
    let mut has_end = false;

    for opt in options {
        bytes.extend_from_slice(&serialize_tcp_option(opt));
        if matches!(opt, TcpOptionKind::EndOfList) {
            has_end = true;
            break;
        }
    }

    if !has_end {
        bytes.push(0);
    }
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }

    bytes
}

/// Parse TCP options from a segment.
pub fn parse_tcp_options(data: &[u8], header: &TcpHeader) -> TcpOptions {
    let mut options = TcpOptions::default();
    let header_len = header.header_len();

    if header_len <= TCP_HEADER_MIN_LEN || data.len() < header_len {
        return options;
    }

    let opts_data = &data[TCP_HEADER_MIN_LEN..header_len];
    let mut i = 0;

    while i < opts_data.len() {
        match opts_data[i] {
            0 => break,  // End of Option List
            1 => i += 1, // NOP
            2 => {
                // MSS, clamped to the RFC 879 floor to keep segments useful
                if i + 4 <= opts_data.len() && opts_data[i + 1] == 4 {
                    let raw_mss = u16::from_be_bytes([opts_data[i + 2], opts_data[i + 3]]);
                    options.mss = Some(raw_mss.max(TCP_DEFAULT_MSS));
                    i += 4;
                } else {
                    break;
                }
            }
            3 => {
                // Window Scale, shift clamped to 14 per RFC 7323
                if i + 3 <= opts_data.len() && opts_data[i + 1] == 3 {
                    options.window_scale = Some(opts_data[i + 2].min(TCP_MAX_WINDOW_SCALE));
                    i += 3;
                } else {
                    break;
                }
            }
            4 => {
                // SACK Permitted
                if i + 2 <= opts_data.len() && opts_data[i + 1] == 2 {
                    options.sack_permitted = true;
                    i += 2;
                } else {
                    break;
                }
            }
            5 => {
                // SACK blocks: len = 2 + 8*n, n in 1..=4
                if i + 1 >= opts_data.len() {
                    break;
                }
                let len = opts_data[i + 1] as usize;
                if len < 10 || (len - 2) % 8 != 0 || i + len > opts_data.len() {
                    break;
                }
                let mut j = i + 2;
                while j + 8 <= i + len && options.sack_blocks.len() < 4 {
                    let left = u32::from_be_bytes([
                        opts_data[j],
                        opts_data[j + 1],
                        opts_data[j + 2],
                        opts_data[j + 3],
                    ]);
                    let right = u32::from_be_bytes([
                        opts_data[j + 4],
                        opts_data[j + 5],
                        opts_data[j + 6],
                        opts_data[j + 7],
                    ]);
                    if seq_lt(left, right) {
                        options.sack_blocks.push((left, right));
                    }
                    j += 8;
                }
                i += len;
            }
            8 => {
                // Timestamps
                if i + 10 <= opts_data.len() && opts_data[i + 1] == 10 {
                    let ts_val = u32::from_be_bytes([
                        opts_data[i + 2],
                        opts_data[i + 3],
                        opts_data[i + 4],
                        opts_data[i + 5],
                    ]);
                    let ts_ecr = u32::from_be_bytes([
                        opts_data[i + 6],
                        opts_data[i + 7],
                        opts_data[i + 8],
                        opts_data[i + 9],
                    ]);
                    options.timestamps = Some((ts_val, ts_ecr));
                    i += 10;
                } else {
                    break;
                }
            }
            _ => {
                // Unknown option: skip by length with overflow-safe math
                if i + 1 < opts_data.len() {
                    let len = opts_data[i + 1] as usize;
                    if len < 2 {
                        break;
                    }
                    match i.checked_add(len) {
                        Some(next) if next <= opts_data.len() => i = next,
                        _ => break,
                    }
                } else {
                    break;
                }
            }
        }
    }

    options
}

// ============================================================================
// TCP Control Block (TCB)
// ============================================================================

/// 4-tuple connection key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TcpConnKey {
    /// Local IP address
    pub local_ip: Ipv4Addr,
    /// Local port
    pub local_port: u16,
    /// Remote IP address
    pub remote_ip: Ipv4Addr,
    /// Remote port
    pub remote_port: u16,
}

impl TcpConnKey {
    /// Create a new connection key
    pub fn new(local_ip: Ipv4Addr, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16) -> Self {
        Self {
            local_ip,
            local_port,
            remote_ip,
            remote_port,
        }
    }

    /// Create the reverse key (for matching incoming packets)
    pub fn reverse(&self) -> Self {
        Self {
            local_ip: self.remote_ip,
            local_port: self.remote_port,
            remote_ip: self.local_ip,
            remote_port: self.local_port,
        }
    }
}

/// A queued outbound segment awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct SendSegment {
    /// Sequence number of the first byte
    pub seq: u32,
    /// Segment data
    pub data: Vec<u8>,
    /// When the segment was (last) sent, for RTT sampling
    pub sent_at: u64,
    /// Number of times retransmitted
    pub retrans_count: u8,
    /// Peer reported this range received via SACK
    pub sacked: bool,
}

impl SendSegment {
    /// Sequence number one past the last byte
    #[inline]
    pub fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }
}

/// TCP Control Block - per-connection state
pub struct TcpControlBlock {
    /// Connection state
    pub state: TcpState,

    /// Connection key (4-tuple)
    pub key: TcpConnKey,

    // === Send Sequence Space (RFC 793 Section 3.2) ===
    /// Initial Send Sequence Number
    pub iss: u32,
    /// Send Unacknowledged - oldest unacknowledged sequence number
    pub snd_una: u32,
    /// Send Next - next sequence number to send
    pub snd_nxt: u32,
    /// Send Window - peer's advertised window in bytes
    pub snd_wnd: u32,
    /// Segment sequence number used for last window update
    pub snd_wl1: u32,
    /// Segment acknowledgment number used for last window update
    pub snd_wl2: u32,

    // === Congestion Control (RFC 5681), in segments ===
    /// Congestion window in segments.
    pub cwnd: u32,
    /// Slow-start threshold in segments.
    pub ssthresh: u32,
    /// ACK counter for linear growth in congestion avoidance.
    pub cwnd_count: u32,
    /// Duplicate ACK counter for fast retransmit detection.
    pub dup_ack_count: u8,
    /// Current congestion control phase.
    pub congestion_state: TcpCongestionState,
    /// NewReno recovery point: snd_nxt at loss detection. A full ACK
    /// (ack >= recover) exits fast recovery; a partial ACK retransmits the
    /// next hole while staying in.
    pub recover: u32,

    // === Receive Sequence Space ===
    /// Initial Receive Sequence Number
    pub irs: u32,
    /// Receive Next - next sequence number expected
    pub rcv_nxt: u32,
    /// Receive Window in bytes
    pub rcv_wnd: u32,

    // === Segment Size ===
    /// Maximum Segment Size for sending
    pub snd_mss: u16,
    /// Maximum Segment Size for receiving
    pub rcv_mss: u16,

    // === Retransmission State ===
    /// Current retransmission timeout in milliseconds
    pub rto_ms: u64,
    /// Smoothed Round-Trip Time (SRTT) in microseconds
    pub srtt_us: u64,
    /// RTT variance (RTTVAR) in microseconds
    pub rttvar_us: u64,
    /// Consecutive expiries of the retransmission timer without forward
    /// progress. Doubles the RTO; reset when an ACK advances snd_una.
    pub backoff: u8,
    /// A degraded-path report has been issued for the current loss episode
    pub path_degraded_reported: bool,

    // === Zero-window probing ===
    /// Current probe interval; doubles up to the configured ceiling
    pub probe_interval_ms: u64,
    /// Probes sent since the window closed
    pub probes_sent: u32,

    // === Delayed ACK ===
    /// An ACK is owed to the peer
    pub ack_pending: bool,
    /// Segments received since the last ACK was sent
    pub segs_since_ack: u8,

    // === Keepalive ===
    /// Keepalive enabled on this connection
    pub keepalive_enabled: bool,
    /// Unanswered keepalive probes
    pub keepalive_probes_sent: u8,

    // === Buffers ===
    /// Send queue: segments between snd_una and snd_nxt
    pub send_buffer: VecDeque<SendSegment>,
    /// In-order received data awaiting the application
    pub recv_buffer: VecDeque<u8>,
    /// Out-of-order segments keyed by sequence number
    pub ooo_queue: VecDeque<SendSegment>,

    // === Flags ===
    /// FIN has been sent
    pub fin_sent: bool,
    /// FIN has been received
    pub fin_received: bool,

    // === Timestamps ===
    /// Connection established timestamp
    pub established_at: u64,
    /// Last send or receive activity
    pub last_activity: u64,
}

impl TcpControlBlock {
    /// Create a new TCB for an outgoing connection (client)
    pub fn new_client(
        local_ip: Ipv4Addr,
        local_port: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        iss: u32,
        cfg: &StackConfig,
    ) -> Self {
        Self {
            state: TcpState::Closed,
            key: TcpConnKey::new(local_ip, local_port, remote_ip, remote_port),
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            cwnd: initial_cwnd(TCP_DEFAULT_MSS),
            ssthresh: TCP_INITIAL_SSTHRESH,
            cwnd_count: 0,
            dup_ack_count: 0,
            congestion_state: TcpCongestionState::SlowStart,
            recover: iss,
            irs: 0,
            rcv_nxt: 0,
            rcv_wnd: cfg.recv_quota as u32,
            snd_mss: TCP_DEFAULT_MSS,
            rcv_mss: TCP_ETHERNET_MSS,
            rto_ms: cfg.initial_rto_ms,
            srtt_us: 0,
            rttvar_us: 0,
            backoff: 0,
            path_degraded_reported: false,
            probe_interval_ms: cfg.probe_initial_ms,
            probes_sent: 0,
            ack_pending: false,
            segs_since_ack: 0,
            keepalive_enabled: false,
            keepalive_probes_sent: 0,
            send_buffer: VecDeque::new(),
            recv_buffer: VecDeque::new(),
            ooo_queue: VecDeque::new(),
            fin_sent: false,
            fin_received: false,
            established_at: 0,
            last_activity: 0,
        }
    }

    /// Create a new TCB for an incoming connection (server)
    pub fn new_server(
        local_ip: Ipv4Addr,
        local_port: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        iss: u32,
        irs: u32,
        cfg: &StackConfig,
    ) -> Self {
        let mut tcb = Self::new_client(local_ip, local_port, remote_ip, remote_port, iss, cfg);
        tcb.irs = irs;
        tcb.rcv_nxt = irs.wrapping_add(1);
        tcb.state = TcpState::SynReceived;
        tcb
    }

    /// Check if there is unacknowledged data
    pub fn has_pending_data(&self) -> bool {
        !self.send_buffer.is_empty() || self.snd_una != self.snd_nxt
    }

    /// Bytes currently in flight: snd_nxt - snd_una
    #[inline]
    pub fn bytes_in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// Unacknowledged segments currently in flight
    #[inline]
    pub fn segments_in_flight(&self) -> u32 {
        self.send_buffer.len() as u32
    }

    /// Data available for the application to read
    pub fn available_data(&self) -> usize {
        self.recv_buffer.len()
    }

    /// Peer's advertised window expressed in whole segments, at least 1.
    #[inline]
    pub fn peer_window_segments(&self) -> u32 {
        (self.snd_wnd / (self.snd_mss as u32).max(1)).max(1)
    }

    /// Bytes that may be sent right now under both the peer window and the
    /// congestion window.
    pub fn send_window_available(&self) -> u32 {
        let in_flight = self.bytes_in_flight();
        let cwnd_bytes = self.cwnd.saturating_mul(self.snd_mss as u32);
        let effective = core::cmp::min(self.snd_wnd, cwnd_bytes);
        effective.saturating_sub(in_flight)
    }

    /// Clamp cwnd so it never exceeds the peer window in segments.
    #[inline]
    pub fn clamp_cwnd_to_peer(&mut self) {
        if self.snd_wnd > 0 {
            self.cwnd = self.cwnd.min(self.peer_window_segments()).max(1);
        }
    }
}

// ============================================================================
// RTT Estimation (RFC 6298)
// ============================================================================

/// Clock granularity (G) in microseconds for RTO calculation.
const RTO_CLOCK_GRANULARITY_US: u64 = 100_000;

/// Smoothing factor alpha = 1/8 for SRTT.
const RTT_ALPHA_NUM: u64 = 1;
const RTT_ALPHA_DEN: u64 = 8;

/// Variance factor beta = 1/4 for RTTVAR.
const RTT_BETA_NUM: u64 = 1;
const RTT_BETA_DEN: u64 = 4;

/// Multiplier K = 4 for the RTO variance term.
const RTT_K: u64 = 4;

/// Update RTT estimates and recompute the RTO per RFC 6298.
///
/// - First sample: SRTT = R, RTTVAR = R/2
/// - Subsequent:   RTTVAR = (1-β)×RTTVAR + β×|SRTT - R|
///                 SRTT = (1-α)×SRTT + α×R
/// - RTO = SRTT + max(G, K×RTTVAR), clamped to [min_rto, max_rto]
pub fn update_rtt(tcb: &mut TcpControlBlock, sample_us: u64, cfg: &StackConfig) {
    // Reject zero or unreasonably large samples (> 10 minutes)
    if sample_us == 0 || sample_us > 600_000_000 {
        return;
    }

    if tcb.srtt_us == 0 {
        // First RTT measurement (RFC 6298 Section 2.2)
        tcb.srtt_us = sample_us;
        tcb.rttvar_us = sample_us / 2;
    } else {
        // Subsequent measurements (RFC 6298 Section 2.3)
        let srtt = tcb.srtt_us;
        let rttvar = tcb.rttvar_us;

        let rtt_err = if srtt > sample_us {
            srtt - sample_us
        } else {
            sample_us - srtt
        };

        // RTTVAR = (3×RTTVAR + error) / 4
        tcb.rttvar_us =
            ((RTT_BETA_DEN - RTT_BETA_NUM) * rttvar + RTT_BETA_NUM * rtt_err) / RTT_BETA_DEN;

        // SRTT = (7×SRTT + sample) / 8
        tcb.srtt_us =
            ((RTT_ALPHA_DEN - RTT_ALPHA_NUM) * srtt + RTT_ALPHA_NUM * sample_us) / RTT_ALPHA_DEN;
    }

    let variance_term = RTT_K.saturating_mul(tcb.rttvar_us);
    let rto_us = tcb
        .srtt_us
        .saturating_add(core::cmp::max(RTO_CLOCK_GRANULARITY_US, variance_term));

    tcb.rto_ms = (rto_us / 1000).clamp(cfg.min_rto_ms, cfg.max_rto_ms);
}

// ============================================================================
// ACK Processing
// ============================================================================

/// Process an incoming ACK: advance snd_una, trim the send queue, sample RTT.
///
/// Karn's rule: RTT is sampled only from segments that were never
/// retransmitted. Forward progress resets the backoff counter and the
/// degraded-path latch, ending any loss episode in progress.
pub fn handle_ack(
    tcb: &mut TcpControlBlock,
    ack_num: u32,
    now_ms: u64,
    cfg: &StackConfig,
) -> AckUpdate {
    let mut update = AckUpdate::default();

    if seq_gt(ack_num, tcb.snd_una) {
        update.newly_acked = ack_num.wrapping_sub(tcb.snd_una);

        let mut rtt_sampled = false;

        // Remove fully acknowledged segments from the send queue
        while let Some(seg) = tcb.send_buffer.front() {
            if !seq_ge(ack_num, seg.end_seq()) {
                break;
            }
            let seg = match tcb.send_buffer.pop_front() {
                Some(s) => s,
                None => break,
            };

            if !rtt_sampled && seg.retrans_count == 0 {
                let rtt_ms = now_ms.saturating_sub(seg.sent_at);
                update_rtt(tcb, rtt_ms.saturating_mul(1000), cfg);
                rtt_sampled = true;
            }
        }

        tcb.snd_una = ack_num;
        tcb.backoff = 0;
        tcb.path_degraded_reported = false;
        tcb.last_activity = now_ms;
    } else if ack_num == tcb.snd_una {
        update.duplicate = true;
    }

    update
}

/// Apply peer SACK blocks to the send queue scoreboard.
///
/// A segment is marked sacked only when a block covers it entirely.
/// Returns the number of segments newly marked.
pub fn apply_sack_blocks(tcb: &mut TcpControlBlock, blocks: &[(u32, u32)]) -> usize {
    let mut marked = 0;
    for seg in tcb.send_buffer.iter_mut() {
        if seg.sacked {
            continue;
        }
        let end = seg.end_seq();
        for &(left, right) in blocks {
            if seq_ge(seg.seq, left) && seq_le(end, right) {
                seg.sacked = true;
                marked += 1;
                break;
            }
        }
    }
    marked
}

/// First unsacked segment at or after snd_una, for retransmission during
/// recovery. Sacked segments are skipped.
pub fn next_retransmit_candidate(tcb: &TcpControlBlock) -> Option<&SendSegment> {
    tcb.send_buffer.iter().find(|seg| !seg.sacked)
}

// ============================================================================
// Congestion Control (RFC 5681)
// ============================================================================

/// Update congestion state after ACK processing.
///
/// All window arithmetic is in segments:
///
/// **Slow Start** (cwnd < ssthresh): cwnd += 1 per ACK advancing snd_una.
///
/// **Congestion Avoidance**: cwnd += 1 per cwnd ACKs (one segment per RTT).
///
/// **Fast Recovery** (triple duplicate ACK, NewReno):
/// - entry: ssthresh = max(flight/2, 2), cwnd = ssthresh + 3, recover = snd_nxt
/// - each further dup ACK inflates cwnd by 1
/// - partial ACK (ack < recover): retransmit next hole, stay in recovery
/// - full ACK (ack >= recover): cwnd = ssthresh, back to avoidance
pub fn update_congestion_control(
    tcb: &mut TcpControlBlock,
    update: AckUpdate,
    ack_num: u32,
) -> CongestionAction {
    if update.newly_acked > 0 {
        tcb.dup_ack_count = 0;

        let action = match tcb.congestion_state {
            TcpCongestionState::SlowStart => {
                tcb.cwnd = tcb.cwnd.saturating_add(1);
                if tcb.cwnd >= tcb.ssthresh {
                    tcb.congestion_state = TcpCongestionState::CongestionAvoidance;
                }
                CongestionAction::None
            }
            TcpCongestionState::CongestionAvoidance => {
                tcb.cwnd_count += 1;
                if tcb.cwnd_count >= tcb.cwnd {
                    tcb.cwnd = tcb.cwnd.saturating_add(1);
                    tcb.cwnd_count = 0;
                }
                CongestionAction::None
            }
            TcpCongestionState::FastRecovery => {
                if seq_ge(ack_num, tcb.recover) {
                    // Full ACK: deflate and leave recovery
                    tcb.cwnd = tcb.ssthresh.max(1);
                    tcb.congestion_state = TcpCongestionState::CongestionAvoidance;
                    tcb.cwnd_count = 0;
                    CongestionAction::None
                } else {
                    // Partial ACK: the next hole is lost too
                    tcb.cwnd = tcb.cwnd.saturating_sub(1).max(1);
                    CongestionAction::RetransmitNext
                }
            }
        };
        tcb.clamp_cwnd_to_peer();
        return action;
    }

    if update.duplicate {
        tcb.dup_ack_count = tcb.dup_ack_count.saturating_add(1);

        if tcb.congestion_state != TcpCongestionState::FastRecovery {
            // RFC 3042 Limited Transmit on the first two dup ACKs
            if tcb.dup_ack_count <= 2 {
                let flight = tcb.segments_in_flight();
                if flight.saturating_add(1) <= tcb.cwnd.saturating_add(2) {
                    return CongestionAction::LimitedTransmit;
                }
            }

            if tcb.dup_ack_count == 3 {
                // Triple duplicate ACK: multiplicative decrease and enter
                // fast recovery
                let flight = tcb.segments_in_flight().max(1);
                tcb.ssthresh = core::cmp::max(flight / 2, 2);
                tcb.cwnd = tcb.ssthresh.saturating_add(3);
                tcb.congestion_state = TcpCongestionState::FastRecovery;
                tcb.recover = tcb.snd_nxt;
                return CongestionAction::FastRetransmit;
            }
        } else {
            // Inflate for each segment that left the network
            tcb.cwnd = tcb.cwnd.saturating_add(1);
        }
    }

    CongestionAction::None
}

/// Collapse a stale congestion window after an idle period (RFC 2861).
///
/// With nothing in flight for at least one RTO, cwnd no longer reflects
/// path conditions; cap it back at the initial window.
#[inline]
pub fn validate_cwnd_after_idle(tcb: &mut TcpControlBlock, now_ms: u64) {
    if tcb.last_activity == 0 || tcb.rto_ms == 0 || tcb.bytes_in_flight() > 0 {
        return;
    }
    if now_ms.saturating_sub(tcb.last_activity) < tcb.rto_ms {
        return;
    }
    let iw = initial_cwnd(tcb.snd_mss);
    if iw < tcb.cwnd {
        tcb.cwnd = iw;
        tcb.cwnd_count = 0;
        if tcb.cwnd <= tcb.ssthresh {
            tcb.congestion_state = TcpCongestionState::SlowStart;
        }
    }
}

// ============================================================================
// Retransmission Timeout
// ============================================================================

/// What the connection should do after a retransmission-timer expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtoDisposition {
    /// Keep going; the timer has been rescheduled
    Continue,
    /// Connect-phase retry ceiling reached; fail the connection attempt
    FailConnect,
    /// Retry ceiling reached with our FIN already sent; quarantine the
    /// 4-tuple instead of lingering
    MoveToTimeWait,
    /// Retry ceiling reached mid-stream; tear the connection down
    ForceClose,
}

/// Outcome of one retransmission-timer expiry.
#[derive(Debug)]
pub struct RtoOutcome {
    /// Head segment to resend, if any data is outstanding
    pub resend: Option<(u32, Vec<u8>)>,
    /// Continue, or how to give up
    pub disposition: RtoDisposition,
    /// The soft retry threshold was just crossed; the caller should report
    /// a degraded path to the routing layer
    pub path_degraded: bool,
}

/// Handle an expiry of the retransmission timer.
///
/// In order: the pending delayed ACK is abandoned (the retransmission will
/// carry an up-to-date ACK anyway), SACK marks beyond the send head are
/// discarded as stale, the first expiry of an episode performs the
/// multiplicative decrease (ssthresh = max(flight/2, 2), cwnd = 1), the
/// head segment is queued for resend, the backoff counter rises and the
/// RTO doubles toward the ceiling, and finally the give-up policy is
/// evaluated against the configured ceilings.
pub fn on_retransmit_timeout(
    tcb: &mut TcpControlBlock,
    now_ms: u64,
    cfg: &StackConfig,
) -> RtoOutcome {
    tcb.ack_pending = false;
    tcb.segs_since_ack = 0;

    // The peer's reneging window: anything it SACKed may be gone from its
    // reassembly buffer once we are timing out
    for seg in tcb.send_buffer.iter_mut().skip(1) {
        seg.sacked = false;
    }

    if tcb.backoff == 0 {
        // First expiry of this episode: multiplicative decrease back to
        // slow start
        let flight = tcb.segments_in_flight().max(1);
        tcb.ssthresh = core::cmp::max(flight / 2, 2);
        tcb.cwnd = 1;
        tcb.cwnd_count = 0;
        tcb.congestion_state = TcpCongestionState::SlowStart;
        tcb.recover = tcb.snd_nxt;
        tcb.dup_ack_count = 0;
    }

    let resend = tcb.send_buffer.front_mut().map(|seg| {
        seg.retrans_count = seg.retrans_count.saturating_add(1);
        seg.sent_at = now_ms;
        seg.sacked = false;
        (seg.seq, seg.data.clone())
    });
    if resend.is_some() {
        TCP_STATS.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    tcb.backoff = tcb.backoff.saturating_add(1);
    tcb.rto_ms = tcb.rto_ms.saturating_mul(2).min(cfg.max_rto_ms);

    let disposition = if tcb.state.is_connecting() {
        if tcb.backoff >= cfg.connect_retries {
            RtoDisposition::FailConnect
        } else {
            RtoDisposition::Continue
        }
    } else if tcb.backoff >= cfg.max_retries {
        if tcb.state.is_half_closed() || tcb.fin_sent {
            RtoDisposition::MoveToTimeWait
        } else {
            RtoDisposition::ForceClose
        }
    } else {
        RtoDisposition::Continue
    };
    if disposition != RtoDisposition::Continue {
        TCP_STATS.timeout_closes.fetch_add(1, Ordering::Relaxed);
    }

    let path_degraded = if disposition == RtoDisposition::Continue
        && tcb.backoff >= cfg.soft_retry_threshold
        && !tcb.path_degraded_reported
    {
        tcb.path_degraded_reported = true;
        true
    } else {
        false
    };

    RtoOutcome {
        resend,
        disposition,
        path_degraded,
    }
}

// ============================================================================
// Zero-Window Probing
// ============================================================================

/// Build a one-byte window probe if the peer window is closed and data is
/// waiting. The probe carries the first unacknowledged byte; a peer that
/// has opened its window will ACK beyond it.
pub fn zero_window_probe(tcb: &mut TcpControlBlock, now_ms: u64) -> Option<(u32, Vec<u8>)> {
    if tcb.snd_wnd != 0 {
        return None;
    }
    let seg = tcb.send_buffer.front()?;
    let byte = *seg.data.first()?;
    tcb.probes_sent += 1;
    tcb.last_activity = now_ms;
    TCP_STATS.zero_window_probes.fetch_add(1, Ordering::Relaxed);
    Some((seg.seq, vec![byte]))
}

/// Double the probe interval toward the ceiling.
pub fn next_probe_interval(tcb: &mut TcpControlBlock, cfg: &StackConfig) -> u64 {
    tcb.probe_interval_ms = tcb
        .probe_interval_ms
        .saturating_mul(2)
        .clamp(cfg.probe_initial_ms, cfg.probe_max_ms);
    tcb.probe_interval_ms
}

/// Reset probing state once the peer window opens.
pub fn window_opened(tcb: &mut TcpControlBlock, cfg: &StackConfig) {
    tcb.probe_interval_ms = cfg.probe_initial_ms;
    tcb.probes_sent = 0;
}

// ============================================================================
// Delayed ACK
// ============================================================================

/// When the ACK for a received segment should go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTiming {
    /// Send now
    Immediate,
    /// May wait for the delayed-ACK interval or a piggyback
    Delayed,
}

/// Decide ACK timing for a newly received data segment.
///
/// An out-of-order segment forces an immediate (duplicate) ACK so the
/// sender's fast retransmit can trigger. Every second in-order segment
/// also forces one (RFC 1122). Otherwise the ACK is owed but may wait.
pub fn ack_timing(tcb: &mut TcpControlBlock, out_of_order: bool) -> AckTiming {
    if out_of_order {
        return AckTiming::Immediate;
    }
    tcb.segs_since_ack = tcb.segs_since_ack.saturating_add(1);
    if tcb.segs_since_ack >= 2 {
        AckTiming::Immediate
    } else {
        tcb.ack_pending = true;
        AckTiming::Delayed
    }
}

/// Record that an ACK left (alone or piggybacked on data).
pub fn ack_sent(tcb: &mut TcpControlBlock) {
    tcb.ack_pending = false;
    tcb.segs_since_ack = 0;
}

// ============================================================================
// TCP Errors
// ============================================================================

/// Errors that can occur during TCP processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    /// Packet is too short
    Truncated,
    /// Invalid header length (data offset)
    InvalidHeaderLen,
    /// Invalid flags combination
    InvalidFlags,
    /// Checksum verification failed
    BadChecksum,
    /// Connection refused (RST received)
    ConnectionRefused,
    /// Connection reset by peer
    ConnectionReset,
    /// Connection timed out
    Timeout,
    /// Invalid state for operation
    InvalidState,
    /// Address already in use
    AddressInUse,
    /// Connection already exists
    ConnectionExists,
    /// Not connected
    NotConnected,
    /// Resource temporarily unavailable
    WouldBlock,
}

/// Result type for TCP operations
pub type TcpResult<T> = Result<T, TcpError>;

// ============================================================================
// TCP Statistics
// ============================================================================

/// TCP stack statistics
#[derive(Debug, Default)]
pub struct TcpStats {
    /// Total segments received
    pub rx_segments: AtomicU64,
    /// Total segments sent
    pub tx_segments: AtomicU64,
    /// Segments dropped (invalid)
    pub rx_dropped: AtomicU64,
    /// Checksum errors
    pub checksum_errors: AtomicU64,
    /// Connections established
    pub connections_established: AtomicU64,
    /// Connections reset
    pub connections_reset: AtomicU64,
    /// Retransmissions
    pub retransmissions: AtomicU64,
    /// Segments received out of order
    pub out_of_order: AtomicU64,
    /// Zero-window probes sent
    pub zero_window_probes: AtomicU64,
    /// Connections abandoned at the retry ceiling
    pub timeout_closes: AtomicU64,
}

impl TcpStats {
    /// Create new statistics
    pub const fn new() -> Self {
        Self {
            rx_segments: AtomicU64::new(0),
            tx_segments: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connections_reset: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            zero_window_probes: AtomicU64::new(0),
            timeout_closes: AtomicU64::new(0),
        }
    }
}

static TCP_STATS: TcpStats = TcpStats::new();

/// Process-wide TCP statistics.
pub fn tcp_stats() -> &'static TcpStats {
    &TCP_STATS
}

// ============================================================================
// TCP Parsing and Building
// ============================================================================

/// Parse a TCP header from raw bytes.
///
/// Validates length and data offset; the checksum is the caller's job.
pub fn parse_tcp_header(data: &[u8]) -> TcpResult<TcpHeader> {
    if data.len() < TCP_HEADER_MIN_LEN {
        return Err(TcpError::Truncated);
    }

    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let seq_num = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ack_num = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let data_offset = (data[12] >> 4) & 0x0F;
    let reserved = data[12] & 0x0F;
    let flags = data[13];
    let window = u16::from_be_bytes([data[14], data[15]]);
    let checksum = u16::from_be_bytes([data[16], data[17]]);
    let urgent_ptr = u16::from_be_bytes([data[18], data[19]]);

    if data_offset < 5 {
        return Err(TcpError::InvalidHeaderLen);
    }
    let header_len = (data_offset as usize) * 4;
    if data.len() < header_len {
        return Err(TcpError::Truncated);
    }

    // SYN+FIN and SYN+RST are never legitimate
    if flags & TCP_FLAG_SYN != 0 && flags & (TCP_FLAG_FIN | TCP_FLAG_RST) != 0 {
        return Err(TcpError::InvalidFlags);
    }

    Ok(TcpHeader {
        src_port,
        dst_port,
        seq_num,
        ack_num,
        data_offset,
        reserved,
        flags,
        window,
        checksum,
        urgent_ptr,
    })
}

/// Compute the TCP checksum using the IPv4 pseudo-header.
pub fn compute_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_data: &[u8]) -> u16 {
    let tcp_len = tcp_data.len() as u16;
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src_ip.0);
    pseudo[4..8].copy_from_slice(&dst_ip.0);
    pseudo[8] = 0;
    pseudo[9] = TCP_PROTO;
    pseudo[10..12].copy_from_slice(&tcp_len.to_be_bytes());

    // One's-complement sum over pseudo-header then segment
    let mut sum: u32 = (!compute_checksum(&pseudo, pseudo.len())) as u32;
    sum = sum.wrapping_add((!compute_checksum(tcp_data, tcp_data.len())) as u32);

    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Verify a TCP checksum; a valid segment sums to zero.
pub fn verify_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_data: &[u8]) -> bool {
    compute_tcp_checksum(src_ip, dst_ip, tcp_data) == 0
}

/// Build a complete TCP segment with checksum, no options.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq_num: u32,
    ack_num: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let header = TcpHeader::new(src_port, dst_port, seq_num, ack_num, flags, window);
    let mut segment = Vec::with_capacity(TCP_HEADER_MIN_LEN + payload.len());
    segment.extend_from_slice(&header.to_bytes());
    segment.extend_from_slice(payload);

    let checksum = compute_tcp_checksum(src_ip, dst_ip, &segment);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());

    segment
}

/// Build a complete TCP segment with options, padding, correct data offset,
/// and checksum.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_segment_with_options(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq_num: u32,
    ack_num: u32,
    flags: u8,
    window: u16,
    options: &[TcpOptionKind],
    payload: &[u8],
) -> Vec<u8> {
    let options_bytes = serialize_tcp_options(options);
    let header_len = TCP_HEADER_MIN_LEN + options_bytes.len();

    debug_assert!(
        header_len <= TCP_HEADER_MAX_LEN,
        "TCP options exceed maximum header length: {} > {}",
        header_len,
        TCP_HEADER_MAX_LEN
    );

    let mut header = TcpHeader::new(src_port, dst_port, seq_num, ack_num, flags, window);
    header.data_offset = (header_len / 4) as u8;

    let mut segment = Vec::with_capacity(header_len + payload.len());
    segment.extend_from_slice(&header.to_bytes());
    segment.extend_from_slice(&options_bytes);
    segment.extend_from_slice(payload);

    let checksum = compute_tcp_checksum(src_ip, dst_ip, &segment);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());

    segment
}

// ============================================================================
// ISN Generation (RFC 6528)
// ============================================================================

static ISN_COUNTER: AtomicU32 = AtomicU32::new(0);
static ISN_SECRET: AtomicU64 = AtomicU64::new(0);

/// Install the ISN secret from embedder-provided entropy. Only the first
/// nonzero value takes effect.
pub fn seed_isn_secret(secret: u64) {
    if secret != 0 {
        let _ = ISN_SECRET.compare_exchange(0, secret, Ordering::AcqRel, Ordering::Acquire);
    }
}

#[inline]
fn isn_secret() -> u64 {
    let current = ISN_SECRET.load(Ordering::Acquire);
    if current != 0 {
        return current;
    }
    // Unseeded fallback. Predictable; the embedder should call
    // seed_isn_secret at startup.
    let fallback = 0xa5a5_5a5a_d3e4_c7d2u64
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .rotate_left(17);
    match ISN_SECRET.compare_exchange(0, fallback, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => fallback,
        Err(installed) => installed,
    }
}

/// Generate an Initial Sequence Number per RFC 6528: a keyed hash over the
/// 4-tuple plus a monotonic counter.
pub fn generate_isn(
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
) -> u32 {
    let counter = ISN_COUNTER.fetch_add(1, Ordering::Relaxed);
    let secret = isn_secret();

    let tuple_ip = u64::from_be_bytes([
        local_ip.0[0],
        local_ip.0[1],
        local_ip.0[2],
        local_ip.0[3],
        remote_ip.0[0],
        remote_ip.0[1],
        remote_ip.0[2],
        remote_ip.0[3],
    ]);
    let tuple_port = ((local_port as u64) << 48) | ((remote_port as u64) << 32) | (counter as u64);

    // SipHash-like multiply-rotate-xor rounds for avalanche
    let mut v0 = secret;
    let mut v1 = tuple_ip;

    v0 = v0.wrapping_add(v1);
    v1 = v1.rotate_left(13);
    v1 ^= v0;
    v0 = v0.rotate_left(32);

    v0 = v0.wrapping_add(tuple_port);
    v1 = v1.rotate_left(17);
    v0 ^= v1;
    v1 = v1.rotate_left(21);

    let mixed = v0.wrapping_add(v1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let final_mix = mixed.rotate_left(23);

    (final_mix >> 32) as u32 ^ final_mix as u32
}

// ============================================================================
// Sequence Number Arithmetic (RFC 793 Section 3.3)
// ============================================================================

/// Check if sequence number a is less than b (with wraparound)
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Check if sequence number a is less than or equal to b (with wraparound)
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// Check if sequence number a is greater than b (with wraparound)
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Check if sequence number a is greater than or equal to b (with wraparound)
#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Check if sequence number seq is within window [left, left+size)
#[inline]
pub fn seq_in_window(seq: u32, left: u32, size: u32) -> bool {
    let right = left.wrapping_add(size);
    if size == 0 {
        false
    } else if seq_le(left, right) {
        seq_ge(seq, left) && seq_lt(seq, right)
    } else {
        // Window wraps around
        seq_ge(seq, left) || seq_lt(seq, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tcb() -> TcpControlBlock {
        let cfg = StackConfig::new();
        let mut tcb = TcpControlBlock::new_client(
            Ipv4Addr::new(10, 0, 0, 1),
            40000,
            Ipv4Addr::new(10, 0, 0, 2),
            80,
            1000,
            &cfg,
        );
        tcb.state = TcpState::Established;
        tcb.snd_wnd = 64 * 1024;
        tcb
    }

    fn queue_segment(tcb: &mut TcpControlBlock, seq: u32, len: usize, sent_at: u64) {
        tcb.send_buffer.push_back(SendSegment {
            seq,
            data: vec![0xab; len],
            sent_at,
            retrans_count: 0,
            sacked: false,
        });
        tcb.snd_nxt = seq.wrapping_add(len as u32);
    }

    #[test]
    fn test_tcp_header_parsing() {
        let syn = [
            0x00, 0x50, // src port 80
            0x1F, 0x90, // dst port 8080
            0x00, 0x00, 0x00, 0x01, // seq 1
            0x00, 0x00, 0x00, 0x00, // ack 0
            0x50, // data offset 5 (20 bytes)
            0x02, // SYN flag
            0xFF, 0xFF, // window 65535
            0x00, 0x00, // checksum (placeholder)
            0x00, 0x00, // urgent ptr
        ];

        let header = parse_tcp_header(&syn).unwrap();
        assert_eq!(header.src_port, 80);
        assert_eq!(header.dst_port, 8080);
        assert_eq!(header.seq_num, 1);
        assert!(header.is_syn());
        assert!(!header.is_ack());
    }

    #[test]
    fn test_syn_fin_rejected() {
        let mut bad = [0u8; 20];
        bad[12] = 0x50;
        bad[13] = TCP_FLAG_SYN | TCP_FLAG_FIN;
        assert_eq!(parse_tcp_header(&bad), Err(TcpError::InvalidFlags));
    }

    #[test]
    fn test_seq_arithmetic() {
        assert!(seq_lt(100, 200));
        assert!(seq_le(100, 100));
        assert!(seq_gt(200, 100));

        // Wraparound
        assert!(seq_lt(0xFFFFFFFF, 0));
        assert!(seq_gt(0, 0xFFFFFFFF));
        assert!(seq_in_window(5, 0xFFFFFFF0, 0x20));
    }

    #[test]
    fn test_sack_option_roundtrip() {
        let blocks = vec![(1000u32, 2000u32), (3000, 4000)];
        let seg = build_tcp_segment_with_options(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1234,
            80,
            1,
            100,
            TCP_FLAG_ACK,
            4096,
            &[TcpOptionKind::Sack(blocks.clone())],
            &[],
        );
        let header = parse_tcp_header(&seg).unwrap();
        let opts = parse_tcp_options(&seg, &header);
        assert_eq!(opts.sack_blocks, blocks);
        assert!(verify_tcp_checksum(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            &seg
        ));
    }

    #[test]
    fn test_rtt_first_sample() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        update_rtt(&mut tcb, 500_000, &cfg);
        assert_eq!(tcb.srtt_us, 500_000);
        assert_eq!(tcb.rttvar_us, 250_000);
        // RTO = 500ms + 4*250ms = 1500ms
        assert_eq!(tcb.rto_ms, 1500);
    }

    #[test]
    fn test_rtt_smoothing_and_clamp() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        update_rtt(&mut tcb, 100_000, &cfg);
        // Steady samples shrink variance; RTO bottoms out at the floor
        for _ in 0..20 {
            update_rtt(&mut tcb, 100_000, &cfg);
        }
        assert_eq!(tcb.srtt_us, 100_000);
        assert_eq!(tcb.rto_ms, cfg.min_rto_ms);
    }

    #[test]
    fn test_handle_ack_pops_and_karn() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        queue_segment(&mut tcb, 1000, 100, 50);
        queue_segment(&mut tcb, 1100, 100, 50);
        tcb.send_buffer[1].retrans_count = 1;

        let up = handle_ack(&mut tcb, 1100, 250, &cfg);
        assert_eq!(up.newly_acked, 100);
        assert_eq!(tcb.send_buffer.len(), 1);
        assert_eq!(tcb.snd_una, 1100);
        // 200ms sample from the non-retransmitted segment
        assert_eq!(tcb.srtt_us, 200_000);

        let srtt_before = tcb.srtt_us;
        let up = handle_ack(&mut tcb, 1200, 400, &cfg);
        assert_eq!(up.newly_acked, 100);
        // Retransmitted segment: no RTT sample taken
        assert_eq!(tcb.srtt_us, srtt_before);
        assert!(tcb.send_buffer.is_empty());
    }

    #[test]
    fn test_duplicate_ack_detection() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        queue_segment(&mut tcb, 1000, 100, 50);
        let up = handle_ack(&mut tcb, 1000, 100, &cfg);
        assert!(up.duplicate);
        assert_eq!(up.newly_acked, 0);
    }

    #[test]
    fn test_fast_retransmit_entry() {
        let mut tcb = test_tcb();
        for i in 0..10 {
            queue_segment(&mut tcb, 1000 + i * 100, 100, 50);
        }
        tcb.cwnd = 10;
        tcb.congestion_state = TcpCongestionState::CongestionAvoidance;

        let dup = AckUpdate {
            newly_acked: 0,
            duplicate: true,
        };
        // First two dup ACKs: limited transmit territory, no window cut
        assert_ne!(
            update_congestion_control(&mut tcb, dup, 1000),
            CongestionAction::FastRetransmit
        );
        assert_ne!(
            update_congestion_control(&mut tcb, dup, 1000),
            CongestionAction::FastRetransmit
        );
        assert_eq!(tcb.ssthresh, TCP_INITIAL_SSTHRESH);

        // Third one triggers the cut: ssthresh = max(10/2, 2) = 5 segments
        assert_eq!(
            update_congestion_control(&mut tcb, dup, 1000),
            CongestionAction::FastRetransmit
        );
        assert_eq!(tcb.ssthresh, 5);
        assert_eq!(tcb.cwnd, 8); // ssthresh + 3
        assert_eq!(tcb.congestion_state, TcpCongestionState::FastRecovery);
        assert_eq!(tcb.recover, tcb.snd_nxt);
    }

    #[test]
    fn test_newreno_partial_and_full_ack() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        for i in 0..10 {
            queue_segment(&mut tcb, 1000 + i * 100, 100, 50);
        }
        tcb.cwnd = 10;
        tcb.ssthresh = 5;
        tcb.congestion_state = TcpCongestionState::FastRecovery;
        tcb.recover = tcb.snd_nxt; // 2000

        // Partial ACK: below the recovery point
        let up = handle_ack(&mut tcb, 1300, 100, &cfg);
        assert_eq!(
            update_congestion_control(&mut tcb, up, 1300),
            CongestionAction::RetransmitNext
        );
        assert_eq!(tcb.congestion_state, TcpCongestionState::FastRecovery);

        // Full ACK: at the recovery point, deflate and exit
        let up = handle_ack(&mut tcb, 2000, 100, &cfg);
        assert_eq!(
            update_congestion_control(&mut tcb, up, 2000),
            CongestionAction::None
        );
        assert_eq!(tcb.congestion_state, TcpCongestionState::CongestionAvoidance);
        assert_eq!(tcb.cwnd, 5);
    }

    #[test]
    fn test_slow_start_growth_capped_by_peer_window() {
        let mut tcb = test_tcb();
        tcb.snd_wnd = 4 * tcb.snd_mss as u32; // peer window: 4 segments
        tcb.cwnd = 2;
        queue_segment(&mut tcb, 1000, 100, 50);

        let up = AckUpdate {
            newly_acked: 100,
            duplicate: false,
        };
        for ack in [1100u32, 1200, 1300, 1400, 1500] {
            update_congestion_control(&mut tcb, up, ack);
        }
        // Growth continues but never beyond the peer window in segments
        assert_eq!(tcb.cwnd, 4);
    }

    #[test]
    fn test_rto_backoff_doubles_to_ceiling() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        queue_segment(&mut tcb, 1000, 100, 50);

        let mut now = 1000u64;
        for n in 1..=10u32 {
            let out = on_retransmit_timeout(&mut tcb, now, &cfg);
            assert!(out.resend.is_some());
            let expected = (cfg.initial_rto_ms << n).min(cfg.max_rto_ms);
            assert_eq!(tcb.rto_ms, expected);
            now += tcb.rto_ms;
        }
        assert_eq!(tcb.rto_ms, cfg.max_rto_ms);
    }

    #[test]
    fn test_rto_first_fire_multiplicative_decrease() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        for i in 0..10 {
            queue_segment(&mut tcb, 1000 + i * 100, 100, 50);
        }
        tcb.cwnd = 20;
        tcb.congestion_state = TcpCongestionState::CongestionAvoidance;

        let out = on_retransmit_timeout(&mut tcb, 2000, &cfg);
        // Head segment resent, flight was 10 segments
        assert_eq!(out.resend.as_ref().map(|(seq, _)| *seq), Some(1000));
        assert_eq!(tcb.ssthresh, 5);
        assert_eq!(tcb.cwnd, 1);
        assert_eq!(tcb.congestion_state, TcpCongestionState::SlowStart);
        assert_eq!(tcb.send_buffer[0].retrans_count, 1);

        // Second fire in the same episode leaves ssthresh alone
        let _ = on_retransmit_timeout(&mut tcb, 4000, &cfg);
        assert_eq!(tcb.ssthresh, 5);
        assert_eq!(tcb.cwnd, 1);
    }

    #[test]
    fn test_rto_discards_sack_marks_beyond_head() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        for i in 0..4 {
            queue_segment(&mut tcb, 1000 + i * 100, 100, 50);
        }
        apply_sack_blocks(&mut tcb, &[(1100, 1400)]);
        assert!(tcb.send_buffer[1].sacked);
        assert!(tcb.send_buffer[2].sacked);
        assert!(tcb.send_buffer[3].sacked);

        let _ = on_retransmit_timeout(&mut tcb, 2000, &cfg);
        for seg in &tcb.send_buffer {
            assert!(!seg.sacked);
        }
    }

    #[test]
    fn test_rto_cancels_pending_delayed_ack() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        queue_segment(&mut tcb, 1000, 100, 50);
        tcb.ack_pending = true;
        let _ = on_retransmit_timeout(&mut tcb, 2000, &cfg);
        assert!(!tcb.ack_pending);
    }

    #[test]
    fn test_connect_phase_retry_ceiling() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        tcb.state = TcpState::SynSent;
        queue_segment(&mut tcb, 1000, 1, 50);

        let mut disposition = RtoDisposition::Continue;
        for _ in 0..cfg.connect_retries {
            disposition = on_retransmit_timeout(&mut tcb, 2000, &cfg).disposition;
        }
        assert_eq!(disposition, RtoDisposition::FailConnect);
    }

    #[test]
    fn test_established_retry_ceiling_policies() {
        let cfg = StackConfig::new();

        // Mid-stream: force close
        let mut tcb = test_tcb();
        queue_segment(&mut tcb, 1000, 100, 50);
        tcb.backoff = cfg.max_retries - 1;
        let out = on_retransmit_timeout(&mut tcb, 2000, &cfg);
        assert_eq!(out.disposition, RtoDisposition::ForceClose);

        // Half closed: quarantine instead
        let mut tcb = test_tcb();
        tcb.state = TcpState::FinWait1;
        tcb.fin_sent = true;
        queue_segment(&mut tcb, 1000, 100, 50);
        tcb.backoff = cfg.max_retries - 1;
        let out = on_retransmit_timeout(&mut tcb, 2000, &cfg);
        assert_eq!(out.disposition, RtoDisposition::MoveToTimeWait);
    }

    #[test]
    fn test_soft_threshold_reports_once() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        queue_segment(&mut tcb, 1000, 100, 50);

        let mut reports = 0;
        for _ in 0..cfg.soft_retry_threshold + 2 {
            if on_retransmit_timeout(&mut tcb, 2000, &cfg).path_degraded {
                reports += 1;
            }
        }
        assert_eq!(reports, 1);

        // Forward progress re-arms the report for the next episode
        handle_ack(&mut tcb, 1100, 3000, &cfg);
        assert!(!tcb.path_degraded_reported);
        assert_eq!(tcb.backoff, 0);
    }

    #[test]
    fn test_zero_window_probe_one_byte() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        queue_segment(&mut tcb, 1000, 100, 50);

        // Window open: no probe
        assert!(zero_window_probe(&mut tcb, 100).is_none());

        tcb.snd_wnd = 0;
        let (seq, data) = zero_window_probe(&mut tcb, 100).unwrap();
        assert_eq!(seq, 1000);
        assert_eq!(data.len(), 1);

        // Interval doubles toward the ceiling
        assert_eq!(next_probe_interval(&mut tcb, &cfg), cfg.probe_initial_ms * 2);
        for _ in 0..10 {
            next_probe_interval(&mut tcb, &cfg);
        }
        assert_eq!(tcb.probe_interval_ms, cfg.probe_max_ms);

        window_opened(&mut tcb, &cfg);
        assert_eq!(tcb.probe_interval_ms, cfg.probe_initial_ms);
        assert_eq!(tcb.probes_sent, 0);
    }

    #[test]
    fn test_delayed_ack_pacing() {
        let mut tcb = test_tcb();

        // First in-order segment: ACK may wait
        assert_eq!(ack_timing(&mut tcb, false), AckTiming::Delayed);
        assert!(tcb.ack_pending);
        // Second: forced out
        assert_eq!(ack_timing(&mut tcb, false), AckTiming::Immediate);
        ack_sent(&mut tcb);
        assert_eq!(tcb.segs_since_ack, 0);

        // Out-of-order arrival always forces a duplicate ACK
        assert_eq!(ack_timing(&mut tcb, true), AckTiming::Immediate);
    }

    #[test]
    fn test_isn_differs_per_tuple() {
        let a = generate_isn(Ipv4Addr::new(10, 0, 0, 1), 80, Ipv4Addr::new(10, 0, 0, 2), 1234);
        let b = generate_isn(Ipv4Addr::new(10, 0, 0, 1), 80, Ipv4Addr::new(10, 0, 0, 3), 1234);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tcp_state_helpers() {
        assert!(!TcpState::Closed.can_send());
        assert!(TcpState::Established.can_send());
        assert!(TcpState::Established.can_receive());
        assert!(!TcpState::TimeWait.can_receive());
        assert!(TcpState::SynSent.is_connecting());
        assert!(TcpState::Closing.is_half_closed());
    }

    #[test]
    fn test_idle_collapses_stale_cwnd() {
        let mut tcb = test_tcb();
        tcb.cwnd = 50;
        tcb.ssthresh = 64;
        tcb.congestion_state = TcpCongestionState::CongestionAvoidance;
        tcb.last_activity = 1000;
        tcb.rto_ms = 1000;

        // Not idle long enough: untouched
        validate_cwnd_after_idle(&mut tcb, 1500);
        assert_eq!(tcb.cwnd, 50);

        // Data in flight: untouched even after a long idle
        let snd_una = tcb.snd_una;
        queue_segment(&mut tcb, snd_una, 100, 1000);
        tcb.snd_nxt = tcb.snd_una.wrapping_add(100);
        validate_cwnd_after_idle(&mut tcb, 10_000);
        assert_eq!(tcb.cwnd, 50);

        // Idle past one RTO with nothing outstanding: back to the
        // initial window and slow start
        tcb.send_buffer.clear();
        tcb.snd_nxt = tcb.snd_una;
        validate_cwnd_after_idle(&mut tcb, 10_000);
        assert_eq!(tcb.cwnd, initial_cwnd(tcb.snd_mss));
        assert_eq!(tcb.congestion_state, TcpCongestionState::SlowStart);
    }

    #[test]
    fn test_stats_count_rto_and_probe_events() {
        let cfg = StackConfig::new();
        let mut tcb = test_tcb();
        queue_segment(&mut tcb, 1000, 100, 50);
        tcb.snd_nxt = 1100;

        let retrans_before = tcp_stats().retransmissions.load(Ordering::Relaxed);
        let outcome = on_retransmit_timeout(&mut tcb, 2000, &cfg);
        assert!(outcome.resend.is_some());
        assert!(tcp_stats().retransmissions.load(Ordering::Relaxed) > retrans_before);

        let probes_before = tcp_stats().zero_window_probes.load(Ordering::Relaxed);
        tcb.snd_wnd = 0;
        assert!(zero_window_probe(&mut tcb, 3000).is_some());
        assert!(tcp_stats().zero_window_probes.load(Ordering::Relaxed) > probes_before);
    }
}
