//! IPv4 packet parsing, building, and output fragmentation.
//!
//! Parsing is strict: version, IHL, total length, checksum, TTL, and source
//! address are all validated before a packet reaches a transport protocol,
//! and source-routing options (LSRR/SSRR) are rejected outright.
//!
//! Output fragmentation splits a datagram that exceeds the route MTU into
//! fragments whose payloads are 8-byte aligned, replicating copy-flagged
//! options into every fragment and keeping MF on the final fragment when the
//! input was itself a middle fragment of a larger datagram.
//!
//! # References
//! - RFC 791: Internet Protocol

use alloc::vec::Vec;

/// Minimum IPv4 header length in bytes (IHL == 5)
pub const IPV4_HEADER_MIN_LEN: usize = 20;

/// Maximum IPv4 header length in bytes (IHL == 15)
pub const IPV4_HEADER_MAX_LEN: usize = 60;

/// Fragment offsets count in units of 8 bytes.
pub const FRAGMENT_UNIT: usize = 8;

// ============================================================================
// IPv4 Protocol Numbers
// ============================================================================

/// IPv4 protocol numbers understood by the stack
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Proto {
    /// ICMP (Internet Control Message Protocol)
    Icmp = 1,
    /// TCP (Transmission Control Protocol)
    Tcp = 6,
    /// UDP (User Datagram Protocol)
    Udp = 17,
}

impl Ipv4Proto {
    /// Try to convert from raw protocol number
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            1 => Some(Ipv4Proto::Icmp),
            6 => Some(Ipv4Proto::Tcp),
            17 => Some(Ipv4Proto::Udp),
            _ => None,
        }
    }

    /// Get raw protocol number
    pub fn to_raw(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// IPv4 Address
// ============================================================================

/// IPv4 address (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// Create from 4 octets
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Addr([a, b, c, d])
    }

    /// All zeros (0.0.0.0)
    pub const UNSPECIFIED: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

    /// Loopback (127.0.0.1)
    pub const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    /// Broadcast (255.255.255.255)
    pub const BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

    /// Check if this is a multicast address (224.0.0.0/4)
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 0xe0
    }

    /// Check if this is the broadcast address (255.255.255.255)
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [255, 255, 255, 255]
    }

    /// Check if this is the unspecified address (0.0.0.0)
    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0, 0, 0, 0]
    }

    /// Check if this is a loopback address (127.0.0.0/8)
    #[inline]
    pub fn is_loopback(&self) -> bool {
        self.0[0] == 127
    }

    /// Check if this address is valid as a source address on the wire.
    ///
    /// Rejected: broadcast, multicast, unspecified, loopback (never appears
    /// on the wire legitimately), the reserved 0/8 network, and addresses
    /// ending in .255 (likely directed broadcast).
    #[inline]
    pub fn is_valid_source(&self) -> bool {
        if self.is_broadcast() || self.is_multicast() || self.is_unspecified() {
            return false;
        }
        if self.is_loopback() {
            return false;
        }
        if self.0[0] == 0 {
            return false;
        }
        if self.0[3] == 255 {
            return false;
        }
        true
    }

    /// Get the raw bytes
    #[inline]
    pub fn octets(&self) -> [u8; 4] {
        self.0
    }

    /// Big-endian u32 form, used in connection keys and pseudo headers.
    #[inline]
    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl core::fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(bytes: [u8; 4]) -> Self {
        Ipv4Addr(bytes)
    }
}

impl From<u32> for Ipv4Addr {
    fn from(ip: u32) -> Self {
        Ipv4Addr(ip.to_be_bytes())
    }
}

// ============================================================================
// IPv4 Header
// ============================================================================

/// Parsed IPv4 header
///
/// Options are not stored here; use the slice returned by [`parse_ipv4`].
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    /// IP version (should always be 4)
    pub version: u8,
    /// Internet Header Length (in 32-bit words, minimum 5)
    pub ihl: u8,
    /// Type of Service / DSCP + ECN
    pub dscp_ecn: u8,
    /// Total length of the IP packet (header + payload)
    pub total_len: u16,
    /// Identification for fragmentation
    pub identification: u16,
    /// Flags (3 bits) + Fragment offset (13 bits)
    pub flags_fragment: u16,
    /// Time to Live
    pub ttl: u8,
    /// Protocol number
    pub protocol: u8,
    /// Header checksum
    pub checksum: u16,
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
    /// Options length in bytes (header_len - 20)
    pub options_len: usize,
}

impl Ipv4Header {
    /// Get the header length in bytes
    #[inline]
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }

    /// Get the payload length in bytes
    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(self.header_len())
    }

    /// Check if this packet has the "Don't Fragment" flag set
    #[inline]
    pub fn dont_fragment(&self) -> bool {
        self.flags_fragment & 0x4000 != 0
    }

    /// Check if this packet has the "More Fragments" flag set
    #[inline]
    pub fn more_fragments(&self) -> bool {
        self.flags_fragment & 0x2000 != 0
    }

    /// Get the fragment offset (in 8-byte units)
    #[inline]
    pub fn fragment_offset(&self) -> u16 {
        self.flags_fragment & 0x1fff
    }

    /// Check if this is a fragment
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    /// Get the protocol as enum if known
    #[inline]
    pub fn proto(&self) -> Option<Ipv4Proto> {
        Ipv4Proto::from_raw(self.protocol)
    }
}

// ============================================================================
// IPv4 Errors
// ============================================================================

/// Errors that can occur during IPv4 parsing, validation, and fragmentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Error {
    /// Packet is too short
    Truncated,
    /// IP version is not 4
    BadVersion,
    /// Internet Header Length is less than 5
    BadIhl,
    /// Total length field doesn't match packet size
    BadTotalLen,
    /// Header checksum is incorrect
    ChecksumMismatch,
    /// Packet contains source routing options (LSRR or SSRR)
    SourceRoutingForbidden,
    /// Source address is invalid (broadcast, multicast, etc.)
    InvalidSource,
    /// TTL is zero
    InvalidTtl,
    /// Datagram exceeds the MTU but carries the Don't Fragment flag
    DontFragment,
    /// MTU leaves less than one 8-byte fragment unit of payload per fragment
    MtuTooSmall,
    /// A fragment offset would not fit in the 13-bit field
    OffsetOverflow,
}

/// Result alias for IPv4 operations
pub type Ipv4Result<T> = Result<T, Ipv4Error>;

// ============================================================================
// Checksum Calculation
// ============================================================================

/// Compute IPv4 header checksum.
///
/// Standard Internet checksum (one's complement sum). When computed over a
/// header that includes the checksum field, the result is 0 if the checksum
/// is valid.
pub fn compute_checksum(data: &[u8], len: usize) -> u16 {
    let capped = core::cmp::min(data.len(), len);
    let mut sum: u32 = 0;
    let mut i = 0;

    // Sum 16-bit words
    while i + 1 < capped {
        let word = u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        sum = sum.wrapping_add(word);
        i += 2;
    }

    // Handle odd byte
    if capped % 2 == 1 {
        sum = sum.wrapping_add((data[capped - 1] as u32) << 8);
    }

    // Fold 32-bit sum to 16 bits
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

/// Internet checksum over a pseudo header followed by transport data.
pub fn calculate_checksum_with_pseudo(pseudo_header: &[u8], data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    for chunk in pseudo_header.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]]) as u32
        } else {
            (chunk[0] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }

    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]]) as u32
        } else {
            (chunk[0] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

// ============================================================================
// IPv4 Parsing
// ============================================================================

/// Parse and validate an IPv4 packet.
///
/// Validates version, header length, total length, checksum, TTL, and
/// source address, and rejects source-routing options.
///
/// # Returns
/// On success: (header, options_slice, payload_slice)
pub fn parse_ipv4(packet: &[u8]) -> Ipv4Result<(Ipv4Header, &[u8], &[u8])> {
    if packet.len() < IPV4_HEADER_MIN_LEN {
        return Err(Ipv4Error::Truncated);
    }

    let version_ihl = packet[0];
    let version = version_ihl >> 4;
    let ihl = version_ihl & 0x0f;

    if version != 4 {
        return Err(Ipv4Error::BadVersion);
    }

    // IHL must be at least 5 (20 bytes)
    if ihl < 5 {
        return Err(Ipv4Error::BadIhl);
    }

    let header_len = (ihl as usize) * 4;

    if header_len > packet.len() {
        return Err(Ipv4Error::Truncated);
    }

    let total_len = u16::from_be_bytes([packet[2], packet[3]]);

    // Total length may be less than the buffer (link-layer padding)
    if (total_len as usize) > packet.len() {
        return Err(Ipv4Error::Truncated);
    }
    if (total_len as usize) < header_len {
        return Err(Ipv4Error::BadTotalLen);
    }

    let checksum = u16::from_be_bytes([packet[10], packet[11]]);
    if compute_checksum(&packet[..header_len], header_len) != 0 {
        return Err(Ipv4Error::ChecksumMismatch);
    }

    let ttl = packet[8];
    if ttl == 0 {
        return Err(Ipv4Error::InvalidTtl);
    }

    let src = Ipv4Addr([packet[12], packet[13], packet[14], packet[15]]);
    let dst = Ipv4Addr([packet[16], packet[17], packet[18], packet[19]]);

    if !src.is_valid_source() {
        return Err(Ipv4Error::InvalidSource);
    }

    let options_len = header_len - IPV4_HEADER_MIN_LEN;
    let options = &packet[IPV4_HEADER_MIN_LEN..header_len];
    if contains_source_routing(options) {
        return Err(Ipv4Error::SourceRoutingForbidden);
    }

    let payload = &packet[header_len..total_len as usize];

    let hdr = Ipv4Header {
        version,
        ihl,
        dscp_ecn: packet[1],
        total_len,
        identification: u16::from_be_bytes([packet[4], packet[5]]),
        flags_fragment: u16::from_be_bytes([packet[6], packet[7]]),
        ttl,
        protocol: packet[9],
        checksum,
        src,
        dst,
        options_len,
    };

    Ok((hdr, options, payload))
}

/// Check if options contain source routing (LSRR or SSRR).
///
/// - LSRR (Loose Source Route): 0x83
/// - SSRR (Strict Source Route): 0x89
fn contains_source_routing(options: &[u8]) -> bool {
    let mut i = 0;
    while i < options.len() {
        let opt = options[i];
        match opt {
            0 => break,                 // End of options list
            1 => i += 1,                // NOP (No Operation)
            0x83 | 0x89 => return true, // LSRR or SSRR - FORBIDDEN
            _ => {
                // Variable-length option
                if i + 1 >= options.len() {
                    break;
                }
                let len = options[i + 1] as usize;
                if len < 2 || i + len > options.len() {
                    break; // Malformed option
                }
                i += len;
            }
        }
    }
    false
}

/// Extract the options that must be replicated into non-first fragments.
///
/// An option type's high bit is the copy flag; copy-flagged options appear
/// in every fragment, the rest only in the first. The result is padded with
/// end-of-option-list bytes to a 32-bit boundary.
fn copied_options(options: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < options.len() {
        let opt = options[i];
        match opt {
            0 => break,
            1 => i += 1, // NOP is never copied (copy flag clear)
            _ => {
                if i + 1 >= options.len() {
                    break;
                }
                let len = options[i + 1] as usize;
                if len < 2 || i + len > options.len() {
                    break;
                }
                if opt & 0x80 != 0 {
                    out.extend_from_slice(&options[i..i + len]);
                }
                i += len;
            }
        }
    }
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

// ============================================================================
// IPv4 Packet Building
// ============================================================================

/// Build a 20-byte IPv4 header for transmission, checksum filled in.
pub fn build_ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: Ipv4Proto,
    payload_len: u16,
    ttl: u8,
    identification: u16,
    dont_fragment: bool,
) -> [u8; IPV4_HEADER_MIN_LEN] {
    let total_len = (IPV4_HEADER_MIN_LEN as u16) + payload_len;
    let mut hdr = [0u8; IPV4_HEADER_MIN_LEN];

    // Version (4) + IHL (5)
    hdr[0] = 0x45;
    // DSCP/ECN
    hdr[1] = 0;
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr[4..6].copy_from_slice(&identification.to_be_bytes());
    let flags: u16 = if dont_fragment { 0x4000 } else { 0 };
    hdr[6..8].copy_from_slice(&flags.to_be_bytes());
    hdr[8] = ttl;
    hdr[9] = proto.to_raw();
    // Checksum placeholder
    hdr[10] = 0;
    hdr[11] = 0;
    hdr[12..16].copy_from_slice(&src.0);
    hdr[16..20].copy_from_slice(&dst.0);

    let checksum = compute_checksum(&hdr, IPV4_HEADER_MIN_LEN);
    hdr[10] = (checksum >> 8) as u8;
    hdr[11] = (checksum & 0xff) as u8;

    hdr
}

// ============================================================================
// Output Fragmentation
// ============================================================================

/// Split an IPv4 packet into fragments that each fit within `mtu`.
///
/// Every fragment except the last carries a payload that is a multiple of
/// 8 bytes, as the 13-bit offset field requires. All fragments get a fresh
/// header with a recomputed checksum. Options appear in full on the first
/// fragment; only copy-flagged options are replicated into the rest.
///
/// If the input is itself a fragment (nonzero offset or MF set), offsets
/// are rebased on the input's own offset, and the last produced fragment
/// keeps MF set when the input had it. This makes re-fragmenting an
/// already-fragmented datagram transparent to the final reassembler.
///
/// # Errors
/// - [`Ipv4Error::DontFragment`] if the packet exceeds `mtu` with DF set
/// - [`Ipv4Error::MtuTooSmall`] if `mtu` leaves under 8 payload bytes per
///   fragment
/// - [`Ipv4Error::OffsetOverflow`] if a fragment offset would exceed the
///   13-bit field
pub fn fragment_packet(packet: &[u8], mtu: usize) -> Ipv4Result<Vec<Vec<u8>>> {
    if packet.len() < IPV4_HEADER_MIN_LEN {
        return Err(Ipv4Error::Truncated);
    }

    let ihl = (packet[0] & 0x0f) as usize;
    if packet[0] >> 4 != 4 {
        return Err(Ipv4Error::BadVersion);
    }
    if ihl < 5 {
        return Err(Ipv4Error::BadIhl);
    }
    let header_len = ihl * 4;
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if header_len > packet.len() || total_len > packet.len() || total_len < header_len {
        return Err(Ipv4Error::Truncated);
    }

    if total_len <= mtu {
        let mut single = Vec::new();
        single.push(packet[..total_len].to_vec());
        return Ok(single);
    }

    let flags_fragment = u16::from_be_bytes([packet[6], packet[7]]);
    if flags_fragment & 0x4000 != 0 {
        return Err(Ipv4Error::DontFragment);
    }
    let orig_offset = (flags_fragment & 0x1fff) as usize;
    let orig_mf = flags_fragment & 0x2000 != 0;

    let options = &packet[IPV4_HEADER_MIN_LEN..header_len];
    let payload = &packet[header_len..total_len];

    let rest_options = copied_options(options);
    let rest_header_len = IPV4_HEADER_MIN_LEN + rest_options.len();

    // Largest 8-byte-aligned payload each header shape allows
    let first_room = mtu
        .checked_sub(header_len)
        .map(|r| r / FRAGMENT_UNIT * FRAGMENT_UNIT)
        .unwrap_or(0);
    let rest_room = mtu
        .checked_sub(rest_header_len)
        .map(|r| r / FRAGMENT_UNIT * FRAGMENT_UNIT)
        .unwrap_or(0);
    if first_room < FRAGMENT_UNIT || rest_room < FRAGMENT_UNIT {
        return Err(Ipv4Error::MtuTooSmall);
    }

    let mut fragments = Vec::new();
    let mut consumed = 0usize;

    while consumed < payload.len() {
        let first = consumed == 0;
        let remaining = payload.len() - consumed;
        let room = if first { first_room } else { rest_room };
        let last = remaining <= room;
        let chunk = if last { remaining } else { room };

        let offset = orig_offset + consumed / FRAGMENT_UNIT;
        if offset > 0x1fff {
            return Err(Ipv4Error::OffsetOverflow);
        }
        // MF stays set on the last fragment when the input was a fragment
        // with more data behind it
        let mf = !last || orig_mf;

        let hdr_len = if first { header_len } else { rest_header_len };
        let mut frag = Vec::with_capacity(hdr_len + chunk);
        frag.extend_from_slice(&packet[..IPV4_HEADER_MIN_LEN]);
        if first {
            frag.extend_from_slice(options);
        } else {
            frag.extend_from_slice(&rest_options);
        }

        frag[0] = 0x40 | (hdr_len / 4) as u8;
        let frag_total = (hdr_len + chunk) as u16;
        frag[2..4].copy_from_slice(&frag_total.to_be_bytes());
        let ff = (offset as u16) | if mf { 0x2000 } else { 0 };
        frag[6..8].copy_from_slice(&ff.to_be_bytes());
        frag[10] = 0;
        frag[11] = 0;
        let checksum = compute_checksum(&frag, hdr_len);
        frag[10] = (checksum >> 8) as u8;
        frag[11] = (checksum & 0xff) as u8;

        frag.extend_from_slice(&payload[consumed..consumed + chunk]);
        fragments.push(frag);
        consumed += chunk;
    }

    Ok(fragments)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(payload_len: usize, flags_fragment: u16) -> Vec<u8> {
        let mut hdr = build_ipv4_header(
            Ipv4Addr::new(192, 168, 0, 1),
            Ipv4Addr::new(192, 168, 0, 2),
            Ipv4Proto::Udp,
            payload_len as u16,
            64,
            0x1234,
            false,
        )
        .to_vec();
        hdr[6..8].copy_from_slice(&flags_fragment.to_be_bytes());
        hdr[10] = 0;
        hdr[11] = 0;
        let csum = compute_checksum(&hdr, IPV4_HEADER_MIN_LEN);
        hdr[10] = (csum >> 8) as u8;
        hdr[11] = (csum & 0xff) as u8;
        let mut pkt = hdr;
        for i in 0..payload_len {
            pkt.push((i % 251) as u8);
        }
        pkt
    }

    #[test]
    fn test_ipv4_addr_properties() {
        assert!(Ipv4Addr::new(224, 0, 0, 1).is_multicast());
        assert!(Ipv4Addr::new(255, 255, 255, 255).is_broadcast());
        assert!(Ipv4Addr::new(127, 0, 0, 1).is_loopback());
        assert!(Ipv4Addr::new(0, 0, 0, 0).is_unspecified());

        assert!(Ipv4Addr::new(192, 168, 1, 1).is_valid_source());
        assert!(!Ipv4Addr::new(255, 255, 255, 255).is_valid_source());
        assert!(!Ipv4Addr::new(127, 0, 0, 1).is_valid_source());
    }

    #[test]
    fn test_ipv4_addr_display_dotted_quad() {
        assert_eq!(format!("{}", Ipv4Addr::new(10, 0, 0, 1)), "10.0.0.1");
        assert_eq!(format!("{}", Ipv4Addr::UNSPECIFIED), "0.0.0.0");
        assert_eq!(format!("{}", Ipv4Addr::BROADCAST), "255.255.255.255");
    }

    #[test]
    fn test_checksum() {
        // Example from RFC 791
        let hdr = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let csum = compute_checksum(&hdr, 20);
        assert_ne!(csum, 0);
    }

    #[test]
    fn test_parse_roundtrip() {
        let pkt = make_packet(100, 0);
        let (hdr, options, payload) = parse_ipv4(&pkt).unwrap();
        assert_eq!(hdr.protocol, 17);
        assert_eq!(hdr.identification, 0x1234);
        assert!(options.is_empty());
        assert_eq!(payload.len(), 100);
    }

    #[test]
    fn test_fragment_9000_bytes_at_1500_mtu() {
        let pkt = make_packet(9000, 0);
        let frags = fragment_packet(&pkt, 1500).unwrap();
        assert_eq!(frags.len(), 7);

        let mut expected_offset = 0u16;
        for (i, frag) in frags.iter().enumerate() {
            let (hdr, _, payload) = parse_ipv4(frag).unwrap();
            let last = i == frags.len() - 1;
            assert_eq!(hdr.more_fragments(), !last);
            assert_eq!(hdr.fragment_offset(), expected_offset);
            assert_eq!(hdr.identification, 0x1234);
            if last {
                assert_eq!(payload.len(), 9000 - 6 * 1480);
            } else {
                assert_eq!(payload.len(), 1480);
                assert_eq!(payload.len() % 8, 0);
            }
            expected_offset += (payload.len() / 8) as u16;
        }
    }

    #[test]
    fn test_fragment_fits_mtu_passthrough() {
        let pkt = make_packet(500, 0);
        let frags = fragment_packet(&pkt, 1500).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0], pkt);
    }

    #[test]
    fn test_fragment_dont_fragment_fails() {
        let pkt = make_packet(3000, 0x4000);
        assert_eq!(fragment_packet(&pkt, 1500), Err(Ipv4Error::DontFragment));
    }

    #[test]
    fn test_fragment_mtu_too_small() {
        let pkt = make_packet(100, 0);
        assert_eq!(fragment_packet(&pkt, 24), Err(Ipv4Error::MtuTooSmall));
    }

    #[test]
    fn test_refragment_keeps_mf_on_last() {
        // Middle fragment of a larger datagram: offset 100 units, MF set
        let pkt = make_packet(2000, 0x2000 | 100);
        let frags = fragment_packet(&pkt, 1500).unwrap();
        assert!(frags.len() >= 2);

        for frag in &frags {
            let (hdr, _, _) = parse_ipv4(frag).unwrap();
            // Every output fragment keeps MF: the input had more behind it
            assert!(hdr.more_fragments());
        }
        let (first, _, _) = parse_ipv4(&frags[0]).unwrap();
        assert_eq!(first.fragment_offset(), 100);
    }
}
