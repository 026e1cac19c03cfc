//! A user-space TCP/IP transport core.
//!
//! This crate owns the reliability machinery that sits between an
//! embedder-provided network device and an embedder-provided socket front
//! end: per-socket buffer accounting and backpressure, IPv4 output
//! fragmentation and inbound reassembly, the TCP retransmission and
//! congestion engine, and the two-tier timer subsystem that drives them.
//! It is `no_std` + `alloc` and never parks a thread or touches a wall
//! clock; the embedder supplies time ([`note_time`], [`handle_timer_tick`]),
//! packets ([`ip_input`]), a device ([`register_device`]), and optionally a
//! blocking primitive ([`register_wait_hooks`]).
//!
//! ```text
//!           application                      network device
//!               |                                  ^
//!   socket_table().send/recv            DeviceHooks::transmit
//!               v                                  |
//!   socket (quotas, TCB) --> ip_output --> fragment_packet
//!               ^
//!   transport_input <-- reassembly <-- ip_input <-- device RX
//!
//!   handle_timer_tick: fine timers (RTO, delayed ACK, probe)
//!                      + sweeps (keepalive, SYN retry, TIME-WAIT)
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod buffer;
pub mod config;
pub mod fragment;
pub mod ipv4;
pub mod socket;
pub mod tcp;
pub mod timer;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use spin::Once;

pub use config::{config, init, StackConfig};
pub use ipv4::{Ipv4Addr, Ipv4Error, Ipv4Proto};
pub use socket::{
    register_wait_hooks, socket_table, Protocol, ShutdownHow, SocketError, SocketId, SocketOption,
    SocketResult, SoftError, WaitChannel, WaitHooks, WaitOutcome,
};
pub use tcp::{
    seed_isn_secret, seq_ge, seq_gt, seq_in_window, seq_le, seq_lt, tcp_stats, TcpConnKey,
    TcpStats,
};
pub use timer::{clock_interval_ms, handle_timer_tick};

// ============================================================================
// Device Hooks
// ============================================================================

/// A resolved route: where to hand the frame and how large it may be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Next-hop address on the attached link
    pub next_hop: Ipv4Addr,
    /// Path MTU toward the destination
    pub mtu: usize,
}

/// Embedder-supplied device and routing layer.
pub trait DeviceHooks: Send + Sync {
    /// Hand a complete IPv4 packet to the device for transmission.
    fn transmit(&self, frame: &[u8]);
    /// Resolve the route toward `dst`. `None` falls back to the configured
    /// default MTU with direct delivery.
    fn resolve(&self, dst: Ipv4Addr) -> Option<Route>;
    /// A connection toward `dst` crossed its soft retransmission
    /// threshold; the routing layer may want to re-evaluate the path.
    fn report_path_degraded(&self, dst: Ipv4Addr);
}

static DEVICE: Once<&'static dyn DeviceHooks> = Once::new();

/// Register the device layer. Only the first registration takes effect;
/// returns `false` on later calls.
pub fn register_device(device: &'static dyn DeviceHooks) -> bool {
    let mut first = false;
    DEVICE.call_once(|| {
        first = true;
        device
    });
    first
}

#[inline]
pub(crate) fn device() -> Option<&'static dyn DeviceHooks> {
    DEVICE.get().copied()
}

// ============================================================================
// Stack Clock
// ============================================================================

static STACK_CLOCK: AtomicU64 = AtomicU64::new(0);

/// Advance the stack's notion of time. Monotonic: a smaller value than
/// previously noted is ignored.
pub fn note_time(now_ms: u64) {
    STACK_CLOCK.fetch_max(now_ms, Ordering::AcqRel);
}

/// The most recently noted time.
#[inline]
pub(crate) fn now_ms() -> u64 {
    STACK_CLOCK.load(Ordering::Acquire)
}

// ============================================================================
// IP Output
// ============================================================================

/// Errors on the IP output path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// No device layer has been registered
    NoDevice,
    /// Payload exceeds what one IPv4 datagram can carry
    PayloadTooLarge,
    /// The protocol number is not one the stack produces
    UnsupportedProtocol,
    /// Fragmentation or header construction failed
    Ipv4(Ipv4Error),
}

impl From<Ipv4Error> for NetError {
    fn from(e: Ipv4Error) -> Self {
        NetError::Ipv4(e)
    }
}

static IP_IDENT: AtomicU16 = AtomicU16::new(1);

/// Maximum L4 payload in one IPv4 datagram with a 20-byte header.
const MAX_IP_PAYLOAD: usize = 65_535 - ipv4::IPV4_HEADER_MIN_LEN;

/// Build an IPv4 datagram around `payload` and hand it to the device,
/// fragmenting first when it exceeds the path MTU.
pub fn ip_output(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload: &[u8],
) -> Result<(), NetError> {
    let cfg = config();
    let proto = Ipv4Proto::from_raw(protocol).ok_or(NetError::UnsupportedProtocol)?;
    if payload.len() > MAX_IP_PAYLOAD {
        return Err(NetError::PayloadTooLarge);
    }
    let device = device().ok_or(NetError::NoDevice)?;
    let mtu = device
        .resolve(dst)
        .map(|route| route.mtu)
        .unwrap_or(cfg.default_mtu);

    let ident = IP_IDENT.fetch_add(1, Ordering::Relaxed);
    let header = ipv4::build_ipv4_header(
        src,
        dst,
        proto,
        payload.len() as u16,
        cfg.ip_default_ttl,
        ident,
        false,
    );

    let mut packet = Vec::with_capacity(header.len() + payload.len());
    packet.extend_from_slice(&header);
    packet.extend_from_slice(payload);

    if packet.len() <= mtu {
        device.transmit(&packet);
    } else {
        for frag in ipv4::fragment_packet(&packet, mtu)? {
            device.transmit(&frag);
        }
    }
    Ok(())
}

// ============================================================================
// IP Input
// ============================================================================

/// Inbound entry point: parse, reassemble if fragmented, and demultiplex
/// to the owning transport socket.
pub fn ip_input(frame: &[u8], now_ms: u64) {
    note_time(now_ms);

    let (header, _options, payload) = match ipv4::parse_ipv4(frame) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::debug!("ip: inbound packet rejected: {:?}", err);
            return;
        }
    };

    if header.is_fragment() {
        match fragment::process_fragment(&header, payload, now_ms) {
            Ok(Some(reassembled)) => {
                socket::transport_input(
                    header.src,
                    header.dst,
                    header.protocol,
                    &reassembled,
                    now_ms,
                );
            }
            Ok(None) => {}
            Err(reason) => {
                log::debug!(
                    "ip: fragment id={:#06x} dropped: {:?}",
                    header.identification,
                    reason
                );
            }
        }
        return;
    }

    socket::transport_input(header.src, header.dst, header.protocol, payload, now_ms);
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket::UDP_HEADER_LEN;
    use spin::Mutex;

    struct CaptureDevice {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl DeviceHooks for CaptureDevice {
        fn transmit(&self, frame: &[u8]) {
            self.frames.lock().push(frame.to_vec());
        }
        fn resolve(&self, _dst: Ipv4Addr) -> Option<Route> {
            Some(Route {
                next_hop: Ipv4Addr::new(10, 99, 0, 1),
                mtu: 600,
            })
        }
        fn report_path_degraded(&self, _dst: Ipv4Addr) {}
    }

    static CAPTURE: CaptureDevice = CaptureDevice {
        frames: Mutex::new(Vec::new()),
    };

    fn frames_to(dst: Ipv4Addr) -> Vec<Vec<u8>> {
        CAPTURE
            .frames
            .lock()
            .iter()
            .filter(|f| f.len() >= 20 && f[16..20] == dst.0)
            .cloned()
            .collect()
    }

    #[test]
    fn test_note_time_is_monotonic() {
        note_time(100);
        assert!(now_ms() >= 100);
        note_time(50);
        assert!(now_ms() >= 100);
    }

    #[test]
    fn test_ip_output_fragments_past_mtu() {
        register_device(&CAPTURE);
        let src = Ipv4Addr::new(10, 99, 1, 1);
        let dst = Ipv4Addr::new(10, 99, 1, 2);

        // Fits in the 600-byte route MTU: exactly one frame
        ip_output(src, dst, Ipv4Proto::Udp as u8, &[0xab; 100]).unwrap();
        let sent = frames_to(dst);
        assert_eq!(sent.len(), 1);
        let (header, _, payload) = ipv4::parse_ipv4(&sent[0]).unwrap();
        assert_eq!(header.protocol, Ipv4Proto::Udp as u8);
        assert_eq!(payload.len(), 100);

        // Exceeds it: fragments, offsets in 8-byte units
        let dst2 = Ipv4Addr::new(10, 99, 1, 3);
        ip_output(src, dst2, Ipv4Proto::Udp as u8, &[0xcd; 1400]).unwrap();
        let frags = frames_to(dst2);
        assert!(frags.len() > 1);
        let mut total = 0;
        for (i, frag) in frags.iter().enumerate() {
            let (h, _, p) = ipv4::parse_ipv4(frag).unwrap();
            assert!(frag.len() <= 600);
            assert_eq!(h.more_fragments(), i < frags.len() - 1);
            total += p.len();
        }
        assert_eq!(total, 1400);
    }

    #[test]
    fn test_ip_output_oversized_payload_rejected() {
        register_device(&CAPTURE);
        let src = Ipv4Addr::new(10, 99, 2, 1);
        let dst = Ipv4Addr::new(10, 99, 2, 2);
        let huge = vec![0u8; MAX_IP_PAYLOAD + 1];
        assert_eq!(
            ip_output(src, dst, Ipv4Proto::Udp as u8, &huge),
            Err(NetError::PayloadTooLarge)
        );
    }

    fn udp_datagram(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let mut dgram = Vec::new();
        dgram.extend_from_slice(&sport.to_be_bytes());
        dgram.extend_from_slice(&dport.to_be_bytes());
        dgram.extend_from_slice(&((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
        dgram.extend_from_slice(&[0, 0]);
        dgram.extend_from_slice(payload);
        dgram
    }

    #[test]
    fn test_ip_input_delivers_to_udp_socket() {
        let table = socket_table();
        let id = table.socket(Protocol::Udp);
        table.set_option(id, SocketOption::NonBlocking(true)).unwrap();
        table.bind(id, Ipv4Addr::new(10, 99, 3, 1), 9998).unwrap();

        let dgram = udp_datagram(5000, 9998, b"direct");
        let header = ipv4::build_ipv4_header(
            Ipv4Addr::new(10, 99, 3, 9),
            Ipv4Addr::new(10, 99, 3, 1),
            Ipv4Proto::Udp,
            dgram.len() as u16,
            64,
            77,
            false,
        );
        let mut frame = Vec::new();
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&dgram);

        ip_input(&frame, 10);
        let mut buf = [0u8; 32];
        assert_eq!(table.recv(id, &mut buf), Ok(6));
        assert_eq!(&buf[..6], b"direct");
        table.close(id).unwrap();
    }

    #[test]
    fn test_ip_input_reassembles_fragments() {
        let table = socket_table();
        let id = table.socket(Protocol::Udp);
        table.set_option(id, SocketOption::NonBlocking(true)).unwrap();
        table.bind(id, Ipv4Addr::new(10, 99, 4, 1), 9997).unwrap();

        let payload = vec![0x5a; 900];
        let dgram = udp_datagram(5001, 9997, &payload);
        let header = ipv4::build_ipv4_header(
            Ipv4Addr::new(10, 99, 4, 9),
            Ipv4Addr::new(10, 99, 4, 1),
            Ipv4Proto::Udp,
            dgram.len() as u16,
            64,
            78,
            false,
        );
        let mut packet = Vec::new();
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&dgram);

        // Deliver as fragments, out of order
        let mut frags = ipv4::fragment_packet(&packet, 400).unwrap();
        assert!(frags.len() > 1);
        frags.rotate_left(1);
        for frag in &frags {
            ip_input(frag, 20);
        }

        let mut buf = [0u8; 1024];
        assert_eq!(table.recv(id, &mut buf), Ok(900));
        assert!(buf[..900].iter().all(|&b| b == 0x5a));
        table.close(id).unwrap();
    }
}
