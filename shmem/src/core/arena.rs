//! Fixed-slot record arena laid over a flat byte region.
//!
//! The arena is an `ArenaHeader` followed by `slot_count` slots of
//! `slot_size` bytes each. A slot starts with a `SlotHeader` and carries the
//! key bytes immediately followed by the payload bytes. Everything stored is
//! a fixed-width integer or an offset into the slot, so any process mapping
//! the same bytes at any address reads the same records.
//!
//! The arena performs no locking itself; callers hold the region lock for
//! the lifetime of a `SlotArena`.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::slice;

pub const ARENA_HEADER_SIZE: usize = 64;
pub const SLOT_HEADER_SIZE: usize = mem::size_of::<SlotHeader>();

#[repr(C)]
struct ArenaHeader {
    next_sequence: u64,
    slot_size: u64,
    slot_count: u64,
}

#[repr(C)]
#[derive(Default, Copy, Clone, Debug)]
struct SlotHeader {
    occupied: u32,
    key_len: u32,
    payload_len: u32,
    reserved: u32,
    // Unix epoch milliseconds
    expires_at: i64,
    sequence: u64,
}

/// Identifies one stored record. The sequence guards against freeing a slot
/// that has been reused since the id was taken.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub slot: usize,
    pub sequence: u64,
}

#[derive(Copy, Clone, Debug)]
pub struct Record<'a> {
    pub id: RecordId,
    pub key: &'a [u8],
    pub payload: &'a [u8],
    pub expires_at: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// No free or expired slot is left.
    Full,
    /// Key and payload together exceed the data area of one slot.
    TooLarge { size: usize, max: usize },
}

pub struct SlotArena<'a> {
    base: *mut u8,
    slot_size: usize,
    slot_count: usize,
    _region: PhantomData<&'a mut [u8]>,
}

impl<'a> SlotArena<'a> {
    /// Number of slots an arena of `len` bytes holds.
    pub fn slot_count_for(len: usize, slot_size: usize) -> usize {
        len.saturating_sub(ARENA_HEADER_SIZE) / slot_size
    }

    /// Writes a fresh, empty arena over `len` bytes at `base`.
    ///
    /// # Safety
    /// `base` must be 8-byte aligned and valid for `len` bytes of writes, and
    /// nothing else may access those bytes while the returned arena lives.
    pub unsafe fn format(base: *mut u8, len: usize, slot_size: usize) -> SlotArena<'a> {
        let slot_count = Self::slot_count_for(len, slot_size);
        ptr::write(
            base as *mut ArenaHeader,
            ArenaHeader {
                next_sequence: 1,
                slot_size: slot_size as u64,
                slot_count: slot_count as u64,
            },
        );
        let mut arena = Self::attach(base);
        for slot in 0..slot_count {
            arena.write_header(slot, SlotHeader::default());
        }
        arena
    }

    /// Reads the geometry written by `format`.
    ///
    /// # Safety
    /// `base` must point to a formatted arena.
    pub unsafe fn geometry(base: *const u8) -> (usize, usize) {
        let header = &*(base as *const ArenaHeader);
        (header.slot_size as usize, header.slot_count as usize)
    }

    /// # Safety
    /// `base` must point to an arena previously written by `format`, and the
    /// caller must have exclusive access to it for `'a`.
    pub unsafe fn attach(base: *mut u8) -> SlotArena<'a> {
        let (slot_size, slot_count) = Self::geometry(base);
        SlotArena {
            base,
            slot_size,
            slot_count,
            _region: PhantomData,
        }
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Maximum key plus payload bytes a single record may carry.
    #[inline]
    pub fn record_capacity(&self) -> usize {
        self.slot_size - SLOT_HEADER_SIZE
    }

    #[inline]
    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.slot_count);
        unsafe { self.base.add(ARENA_HEADER_SIZE + slot * self.slot_size) }
    }

    #[inline]
    fn header(&self, slot: usize) -> SlotHeader {
        unsafe { ptr::read_unaligned(self.slot_ptr(slot) as *const SlotHeader) }
    }

    #[inline]
    fn write_header(&mut self, slot: usize, header: SlotHeader) {
        unsafe { ptr::write_unaligned(self.slot_ptr(slot) as *mut SlotHeader, header) }
    }

    #[inline]
    fn release_slot(&mut self, slot: usize) {
        let mut header = self.header(slot);
        header.occupied = 0;
        self.write_header(slot, header);
    }

    fn next_sequence(&mut self) -> u64 {
        let header = self.base as *mut ArenaHeader;
        unsafe {
            let sequence = (*header).next_sequence;
            (*header).next_sequence = sequence + 1;
            sequence
        }
    }

    fn record(&self, slot: usize) -> Record<'_> {
        let header = self.header(slot);
        let key_len = header.key_len as usize;
        let payload_len = header.payload_len as usize;
        let (key, payload) = unsafe {
            let data = self.slot_ptr(slot).add(SLOT_HEADER_SIZE);
            (
                slice::from_raw_parts(data as *const u8, key_len),
                slice::from_raw_parts(data.add(key_len) as *const u8, payload_len),
            )
        };
        Record {
            id: RecordId { slot, sequence: header.sequence },
            key,
            payload,
            expires_at: header.expires_at,
        }
    }

    fn first_free(&self) -> Option<usize> {
        (0..self.slot_count).find(|&slot| self.header(slot).occupied == 0)
    }

    /// Stores a record in the first free slot. When every slot is occupied,
    /// expired records are swept first.
    pub fn allocate(
        &mut self,
        key: &[u8],
        payload: &[u8],
        expires_at: i64,
        now: i64,
    ) -> Result<RecordId, AllocError> {
        let size = key.len() + payload.len();
        if size > self.record_capacity() {
            return Err(AllocError::TooLarge { size, max: self.record_capacity() });
        }
        let slot = match self.first_free() {
            Some(slot) => slot,
            None if self.sweep_expired(now) > 0 => self.first_free().ok_or(AllocError::Full)?,
            None => return Err(AllocError::Full),
        };
        let sequence = self.next_sequence();
        unsafe {
            let data = self.slot_ptr(slot).add(SLOT_HEADER_SIZE);
            ptr::copy_nonoverlapping(key.as_ptr(), data, key.len());
            ptr::copy_nonoverlapping(payload.as_ptr(), data.add(key.len()), payload.len());
        }
        // Header last: a writer dying mid-copy leaves the slot free or expired.
        self.write_header(
            slot,
            SlotHeader {
                occupied: 1,
                key_len: key.len() as u32,
                payload_len: payload.len() as u32,
                reserved: 0,
                expires_at,
                sequence,
            },
        );
        Ok(RecordId { slot, sequence })
    }

    /// Live records in ascending sequence order. Expired records met on the
    /// way are released.
    pub fn records(&mut self, now: i64) -> Records<'_, 'a> {
        let mut order = Vec::new();
        for slot in 0..self.slot_count {
            let header = self.header(slot);
            if header.occupied == 0 {
                continue;
            }
            if header.expires_at <= now {
                self.release_slot(slot);
                continue;
            }
            order.push((header.sequence, slot));
        }
        order.sort_unstable();
        Records {
            arena: self,
            order: order.into_iter(),
        }
    }

    /// Releases the record. Returns false when the slot no longer holds it.
    pub fn free(&mut self, id: RecordId) -> bool {
        if id.slot >= self.slot_count {
            return false;
        }
        let header = self.header(id.slot);
        if header.occupied == 0 || header.sequence != id.sequence {
            return false;
        }
        self.release_slot(id.slot);
        true
    }

    /// Moves the expiry of a stored record. Returns false when the slot no
    /// longer holds it.
    pub fn refresh(&mut self, id: RecordId, expires_at: i64) -> bool {
        if id.slot >= self.slot_count {
            return false;
        }
        let mut header = self.header(id.slot);
        if header.occupied == 0 || header.sequence != id.sequence {
            return false;
        }
        header.expires_at = expires_at;
        self.write_header(id.slot, header);
        true
    }

    /// Releases every expired record. Returns how many were reclaimed.
    pub fn sweep_expired(&mut self, now: i64) -> usize {
        let mut reclaimed = 0;
        for slot in 0..self.slot_count {
            let header = self.header(slot);
            if header.occupied != 0 && header.expires_at <= now {
                self.release_slot(slot);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Releases every occupied slot, expired or not.
    pub fn clear(&mut self) -> usize {
        let mut cleared = 0;
        for slot in 0..self.slot_count {
            if self.header(slot).occupied != 0 {
                self.release_slot(slot);
                cleared += 1;
            }
        }
        cleared
    }
}

pub struct Records<'r, 'a> {
    arena: &'r SlotArena<'a>,
    order: std::vec::IntoIter<(u64, usize)>,
}

impl<'r, 'a> Iterator for Records<'r, 'a> {
    type Item = Record<'r>;

    fn next(&mut self) -> Option<Record<'r>> {
        let arena: &'r SlotArena<'a> = self.arena;
        self.order.next().map(|(_, slot)| arena.record(slot))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.order.size_hint()
    }
}
