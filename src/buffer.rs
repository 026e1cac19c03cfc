//! Packet buffers.
//!
//! Two buffer forms cover the packet lifecycle:
//!
//! - [`PacketBuf`] is the exclusive, mutable form used while a packet is
//!   being built or parsed. It reserves headroom and tailroom so protocol
//!   headers can be prepended or stripped without copying the payload.
//! - [`SharedPacket`] is the frozen, reference-counted form used once a
//!   packet sits on a queue. Clones are cheap; the packet may be held by a
//!   send queue and a retransmit path at once. A `SharedPacket` optionally
//!   carries an accounting owner (socket quota handle + direction): the
//!   last reference release uncharges the owner exactly once.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------+------------------+-------------+
//! |  headroom   |      data        |  tailroom   |
//! +-------------+------------------+-------------+
//! ^             ^                  ^             ^
//! 0             data_offset        data_end      storage.len()
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::socket::{MemDirection, MemQuota};

/// Default headroom reserved for protocol headers (IP + TCP, rounded up).
pub const DEFAULT_HEADROOM: usize = 64;

/// Default tailroom reserved for trailers and padding.
pub const DEFAULT_TAILROOM: usize = 16;

/// Fixed per-packet bookkeeping cost added to the storage size when
/// computing truesize.
const PACKET_OVERHEAD: usize = core::mem::size_of::<PacketInner>();

// ============================================================================
// PacketBuf - exclusive build/parse form
// ============================================================================

/// A mutable packet buffer with headroom/tailroom management.
#[derive(Debug)]
pub struct PacketBuf {
    /// Backing storage. Fully allocated up front; the data region is a
    /// window into it.
    storage: Vec<u8>,
    /// Initial headroom (restored by `reset`).
    headroom: usize,
    /// Current offset where data starts.
    data_offset: usize,
    /// Current data length.
    data_len: usize,
}

impl PacketBuf {
    /// Create a buffer with room for `capacity` payload bytes plus the
    /// given headroom and tailroom.
    ///
    /// Returns `None` if the combined layout overflows.
    pub fn new(capacity: usize, headroom: usize, tailroom: usize) -> Option<Self> {
        let total = headroom.checked_add(capacity)?.checked_add(tailroom)?;
        let mut storage = Vec::new();
        storage.try_reserve_exact(total).ok()?;
        storage.resize(total, 0);
        Some(PacketBuf {
            storage,
            headroom,
            data_offset: headroom,
            data_len: 0,
        })
    }

    /// Create a buffer with default headroom/tailroom around `capacity`
    /// payload bytes.
    pub fn with_capacity(capacity: usize) -> Option<Self> {
        Self::new(capacity, DEFAULT_HEADROOM, DEFAULT_TAILROOM)
    }

    /// Create a buffer holding a copy of `payload` with default headroom.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let mut buf = Self::with_capacity(payload.len())?;
        buf.push_tail(payload.len())?.copy_from_slice(payload);
        Some(buf)
    }

    /// Returns the current data length.
    #[inline]
    pub fn len(&self) -> usize {
        self.data_len
    }

    /// Returns true if the buffer contains no data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    /// Returns the total backing size.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Returns the available headroom (bytes before current data start).
    #[inline]
    pub fn headroom(&self) -> usize {
        self.data_offset
    }

    /// Returns the available tailroom (bytes after current data end).
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.storage.len() - (self.data_offset + self.data_len)
    }

    /// Real memory cost of this buffer: backing storage plus fixed
    /// per-packet overhead. Always at least the payload length.
    #[inline]
    pub fn truesize(&self) -> usize {
        self.storage.capacity() + PACKET_OVERHEAD
    }

    /// Returns an immutable view of the current data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.storage[self.data_offset..self.data_offset + self.data_len]
    }

    /// Returns a mutable view of the current data.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.data_offset..self.data_offset + self.data_len]
    }

    /// Prepend space, returning a mutable view of the new region.
    ///
    /// Consumes headroom; `None` if insufficient headroom is available.
    pub fn push_head(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.data_offset {
            return None;
        }
        self.data_offset -= len;
        self.data_len += len;
        Some(&mut self.storage[self.data_offset..self.data_offset + len])
    }

    /// Append space, returning a mutable view of the new region.
    ///
    /// Consumes tailroom; `None` if insufficient tailroom is available.
    pub fn push_tail(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.tailroom() {
            return None;
        }
        let start = self.data_offset + self.data_len;
        self.data_len += len;
        Some(&mut self.storage[start..start + len])
    }

    /// Remove and return data from the head of the buffer.
    ///
    /// Reclaims headroom; `None` if `len` exceeds the current data length.
    pub fn pull_head(&mut self, len: usize) -> Option<&[u8]> {
        if len > self.data_len {
            return None;
        }
        let start = self.data_offset;
        self.data_offset += len;
        self.data_len -= len;
        Some(&self.storage[start..start + len])
    }

    /// Remove and return data from the tail of the buffer.
    ///
    /// Reclaims tailroom; `None` if `len` exceeds the current data length.
    pub fn pull_tail(&mut self, len: usize) -> Option<&[u8]> {
        if len > self.data_len {
            return None;
        }
        self.data_len -= len;
        let start = self.data_offset + self.data_len;
        Some(&self.storage[start..start + len])
    }

    /// Reset the buffer for reuse: restore the initial headroom and clear
    /// the data length. Contents are zeroed so no stale data survives.
    pub fn reset(&mut self) {
        self.storage.fill(0);
        self.data_offset = self.headroom;
        self.data_len = 0;
    }

    /// Freeze into a shared, reference-counted packet.
    ///
    /// The data region is retained; headroom and tailroom are released.
    /// Truesize is captured before the copy so the accounting charge
    /// reflects the cost of the buffer that carried the packet.
    pub fn freeze(self) -> SharedPacket {
        let truesize = self.truesize();
        let data = self.data().to_vec();
        SharedPacket(Arc::new(PacketInner {
            data,
            truesize,
            owner: Mutex::new(None),
        }))
    }
}

// ============================================================================
// SharedPacket - frozen, reference-counted form
// ============================================================================

/// Accounting owner recorded on a shared packet.
struct PacketOwner {
    quota: Arc<MemQuota>,
    dir: MemDirection,
    truesize: usize,
}

struct PacketInner {
    /// Frozen packet bytes.
    data: Vec<u8>,
    /// Memory cost charged for this packet.
    truesize: usize,
    /// Accounting owner, uncharged exactly once: either on explicit
    /// `disown` or when the last reference drops.
    owner: Mutex<Option<PacketOwner>>,
}

impl Drop for PacketInner {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.get_mut().take() {
            owner.quota.uncharge(owner.truesize, owner.dir);
        }
    }
}

/// A frozen packet shared across queues. Cloning bumps a reference count.
pub struct SharedPacket(Arc<PacketInner>);

impl Clone for SharedPacket {
    fn clone(&self) -> Self {
        SharedPacket(Arc::clone(&self.0))
    }
}

impl core::fmt::Debug for SharedPacket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedPacket")
            .field("len", &self.0.data.len())
            .field("truesize", &self.0.truesize)
            .finish()
    }
}

impl SharedPacket {
    /// Build a shared packet directly from payload bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let truesize = data.capacity() + PACKET_OVERHEAD;
        SharedPacket(Arc::new(PacketInner {
            data,
            truesize,
            owner: Mutex::new(None),
        }))
    }

    /// Packet bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.0.data
    }

    /// Packet length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.data.len()
    }

    /// True if the packet carries no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.data.is_empty()
    }

    /// Memory cost accounted for this packet.
    #[inline]
    pub fn truesize(&self) -> usize {
        self.0.truesize
    }

    /// Current number of references.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Record `quota` as the accounting owner of this packet.
    ///
    /// The caller must have already charged the quota; the owner slot only
    /// guarantees the matching uncharge happens exactly once. A packet can
    /// have at most one owner at a time.
    pub fn assign_owner(&self, quota: Arc<MemQuota>, dir: MemDirection) {
        let mut slot = self.0.owner.lock();
        debug_assert!(slot.is_none(), "packet already has an accounting owner");
        *slot = Some(PacketOwner {
            quota,
            dir,
            truesize: self.0.truesize,
        });
    }

    /// Uncharge and clear the accounting owner now, ahead of the final
    /// reference release. Safe to call on an unowned packet.
    pub fn disown(&self) {
        if let Some(owner) = self.0.owner.lock().take() {
            owner.quota.uncharge(owner.truesize, owner.dir);
        }
    }

    /// True if the packet currently carries an accounting owner.
    pub fn has_owner(&self) -> bool {
        self.0.owner.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{MemDirection, MemQuota};

    #[test]
    fn test_headroom_tailroom_ops() {
        let mut buf = PacketBuf::new(100, 32, 8).unwrap();
        assert_eq!(buf.headroom(), 32);
        assert_eq!(buf.len(), 0);

        buf.push_tail(10).unwrap().copy_from_slice(&[7u8; 10]);
        assert_eq!(buf.len(), 10);

        let hdr = buf.push_head(4).unwrap();
        hdr.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buf.len(), 14);
        assert_eq!(buf.headroom(), 28);
        assert_eq!(&buf.data()[..4], &[1, 2, 3, 4]);

        let pulled = buf.pull_head(4).unwrap();
        assert_eq!(pulled, &[1, 2, 3, 4]);
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.data(), &[7u8; 10]);
    }

    #[test]
    fn test_push_head_exhausts_headroom() {
        let mut buf = PacketBuf::new(10, 8, 0).unwrap();
        assert!(buf.push_head(8).is_some());
        assert!(buf.push_head(1).is_none());
    }

    #[test]
    fn test_truesize_at_least_payload() {
        let buf = PacketBuf::from_payload(&[0u8; 256]).unwrap();
        assert!(buf.truesize() >= 256);
    }

    #[test]
    fn test_shared_packet_uncharges_once_on_last_drop() {
        let quota = Arc::new(MemQuota::new(4096, 4096));
        let pkt = SharedPacket::from_bytes(alloc::vec![0u8; 100]);
        let ts = pkt.truesize();
        assert!(quota.charge(ts, MemDirection::Send, false));
        pkt.assign_owner(quota.clone(), MemDirection::Send);

        let clone = pkt.clone();
        drop(pkt);
        // Still referenced: charge must persist
        assert_eq!(quota.charged(MemDirection::Send), ts);
        drop(clone);
        assert_eq!(quota.charged(MemDirection::Send), 0);
    }

    #[test]
    fn test_disown_then_drop_uncharges_once() {
        let quota = Arc::new(MemQuota::new(4096, 4096));
        let pkt = SharedPacket::from_bytes(alloc::vec![0u8; 64]);
        let ts = pkt.truesize();
        assert!(quota.charge(ts, MemDirection::Recv, false));
        pkt.assign_owner(quota.clone(), MemDirection::Recv);

        pkt.disown();
        assert_eq!(quota.charged(MemDirection::Recv), 0);
        // Final drop must not uncharge again
        drop(pkt);
        assert_eq!(quota.charged(MemDirection::Recv), 0);
    }
}
