//! Registered message buffer sliced into a ring of fixed-size slots.

use memmap2::MmapMut;

use crate::{
    constants::BUFFER_ALIGN,
    error::{BenchError, Result},
    verbs::{AccessFlags, MrKeys, Sge, VerbsOps},
};

/// Page-aligned buffer registered for local and remote access.
#[derive(Debug)]
pub struct MemoryRegion {
    buf: MmapMut,
    keys: MrKeys,
}

impl MemoryRegion {
    /// Maps `len` bytes of anonymous memory and registers them with `verbs`.
    pub fn register<V: VerbsOps + ?Sized>(verbs: &mut V, len: usize) -> Result<Self> {
        let mut buf = MmapMut::map_anon(len)?;
        debug_assert_eq!(buf.as_ptr() as usize % BUFFER_ALIGN, 0);
        let keys = verbs.reg_mr(
            buf.as_mut_ptr() as u64,
            len,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
        )?;
        Ok(Self { buf, keys })
    }

    pub fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn keys(&self) -> MrKeys {
        self.keys
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Byte offset into a buffer advancing by a fixed step with wrap-around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    offset: usize,
    step: usize,
    capacity: usize,
}

impl RingCursor {
    pub fn new(step: usize, capacity: usize) -> Result<Self> {
        if step == 0 || capacity == 0 || capacity % step != 0 {
            return Err(BenchError::InvalidInput(format!(
                "ring of {capacity} bytes cannot hold {step}-byte slots"
            )));
        }
        Ok(Self {
            offset: 0,
            step,
            capacity,
        })
    }

    /// Current offset
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the current offset and moves past it.
    pub fn advance(&mut self) -> usize {
        let current = self.offset;
        self.offset = (self.offset + self.step) % self.capacity;
        current
    }
}

/// `slots` message buffers of `message_size` bytes in one region, with
/// independent cursors for posting receives and sends.
#[derive(Debug)]
pub struct BufferRing {
    region: MemoryRegion,
    message_size: usize,
    slots: usize,
    recv: RingCursor,
    send: RingCursor,
}

impl BufferRing {
    pub fn new<V: VerbsOps + ?Sized>(
        verbs: &mut V,
        message_size: usize,
        slots: usize,
    ) -> Result<Self> {
        if message_size == 0 || slots == 0 || u32::try_from(message_size).is_err() {
            return Err(BenchError::InvalidInput(format!(
                "invalid ring geometry: {slots} slots of {message_size} bytes"
            )));
        }
        let size = message_size
            .checked_mul(slots)
            .ok_or_else(|| BenchError::InvalidInput("ring size overflows".into()))?;
        let cursor = RingCursor::new(message_size, size)?;
        let region = MemoryRegion::register(verbs, size)?;
        Ok(Self {
            region,
            message_size,
            slots,
            recv: cursor,
            send: cursor,
        })
    }

    pub fn message_size(&self) -> usize {
        self.message_size
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn recv_cursor(&self) -> RingCursor {
        self.recv
    }

    pub fn send_cursor(&self) -> RingCursor {
        self.send
    }

    /// Slot under the receive cursor, advancing it.
    pub fn next_recv_slot(&mut self) -> usize {
        self.recv.advance() / self.message_size
    }

    /// Slot under the send cursor, advancing it.
    pub fn next_send_slot(&mut self) -> usize {
        self.send.advance() / self.message_size
    }

    /// Scatter/gather entry covering exactly one slot.
    pub fn sge(&self, slot: usize) -> Sge {
        debug_assert!(slot < self.slots);
        Sge {
            addr: self.region.addr() + (slot * self.message_size) as u64,
            length: self.message_size as u32,
            lkey: self.region.keys().lkey,
        }
    }

    pub fn slot(&self, slot: usize) -> &[u8] {
        let start = slot * self.message_size;
        &self.region.as_slice()[start..start + self.message_size]
    }

    pub fn slot_mut(&mut self, slot: usize) -> &mut [u8] {
        let start = slot * self.message_size;
        let size = self.message_size;
        &mut self.region.as_mut_slice()[start..start + size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::{mock::MockVerbs, QpCaps};

    #[test]
    fn cursor_offset_after_n_advances() {
        for (step, slots) in [(64, 4), (4096, 3), (1, 1), (100, 7)] {
            let capacity = step * slots;
            let mut cursor = RingCursor::new(step, capacity).unwrap();
            for n in 1..=3 * slots + 1 {
                let before = cursor.advance();
                assert!(before < capacity);
                assert_eq!(cursor.offset(), (n * step) % capacity);
                assert!(cursor.offset() < capacity);
            }
        }
    }

    #[test]
    fn cursor_rejects_bad_geometry() {
        assert!(RingCursor::new(0, 64).is_err());
        assert!(RingCursor::new(64, 0).is_err());
        assert!(RingCursor::new(64, 100).is_err());
    }

    #[test]
    fn recv_and_send_cursors_wrap_independently() {
        let (mut verbs, _peer) = MockVerbs::pair(QpCaps::for_concurrency(4));
        let mut ring = BufferRing::new(&mut verbs, 64, 4).unwrap();
        assert_eq!(ring.region().len(), 256);
        assert_eq!(ring.region().addr() % BUFFER_ALIGN as u64, 0);

        let recvs: Vec<_> = (0..6).map(|_| ring.next_recv_slot()).collect();
        assert_eq!(recvs, [0, 1, 2, 3, 0, 1]);
        assert_eq!(ring.next_send_slot(), 0);
        assert_eq!(ring.recv_cursor().offset(), 128);
        assert_eq!(ring.send_cursor().offset(), 64);
    }

    #[test]
    fn sge_covers_one_slot() {
        let (mut verbs, _peer) = MockVerbs::pair(QpCaps::for_concurrency(2));
        let mut ring = BufferRing::new(&mut verbs, 32, 2).unwrap();
        let sge = ring.sge(1);
        assert_eq!(sge.addr, ring.region().addr() + 32);
        assert_eq!(sge.length, 32);
        assert_eq!(sge.lkey, ring.region().keys().lkey);
        ring.slot_mut(1).fill(7);
        assert!(ring.slot(0).iter().all(|b| *b == 0));
        assert!(ring.slot(1).iter().all(|b| *b == 7));
    }

    #[test]
    fn zero_sized_ring_is_rejected() {
        let (mut verbs, _peer) = MockVerbs::pair(QpCaps::for_concurrency(1));
        assert!(matches!(
            BufferRing::new(&mut verbs, 0, 4),
            Err(BenchError::InvalidInput(_))
        ));
    }
}
