// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Physically addressed memory shared between the driver and the controller.
//!
//! Every structure the controller reads (ring segments, contexts, the ERST, data buffers) lives
//! in a `DmaMemory` region. The region is addressed with `PhysAddr` values exactly as the
//! controller sees it, and the backing bytes are atomics so the controller side may run on
//! another thread while the driver side publishes descriptors.

mod allocator;

use std::fmt;
use std::fmt::Display;
use std::mem::size_of;
use std::ops::Range;
use std::sync::atomic::fence;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use log::error;
use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

pub use self::allocator::DmaAllocator;
pub use self::allocator::Error as AllocatorError;
use crate::trb::Trb;
use crate::trb::TRB_CONTROL_OFFSET;
use crate::trb::TRB_SIZE;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to allocate dma memory: {0}")]
    Allocate(AllocatorError),
    #[error("dma memory of {size:#x} bytes at {base} is not representable")]
    BadRegion { base: PhysAddr, size: u64 },
    #[error("cannot decode object read from {0}")]
    Decode(PhysAddr),
    #[error("access of {len:#x} bytes at {addr} is outside dma memory")]
    InvalidAccess { addr: PhysAddr, len: usize },
    #[error("offset {0:#x} is outside dma memory")]
    InvalidOffset(usize),
    #[error("failed to release dma memory: {0}")]
    Release(AllocatorError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An address as seen by the controller.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Returns the raw address value.
    pub fn offset(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the result of the add or None if there is overflow.
    pub fn checked_add(self, other: u64) -> Option<PhysAddr> {
        self.0.checked_add(other).map(PhysAddr)
    }

    /// Returns the result of the subtraction or None if there is underflow.
    pub fn checked_sub(self, other: u64) -> Option<PhysAddr> {
        self.0.checked_sub(other).map(PhysAddr)
    }

    /// Returns the distance from `base` to this address, None if `base` is above it.
    pub fn offset_from(self, base: PhysAddr) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    pub fn is_aligned(self, alignment: u64) -> bool {
        alignment != 0 && self.0 % alignment == 0
    }
}

impl Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

struct Region {
    base: PhysAddr,
    bytes: Box<[AtomicU8]>,
    allocator: Mutex<DmaAllocator>,
}

/// Handle to a physically contiguous memory region. Clones share the same bytes.
#[derive(Clone)]
pub struct DmaMemory {
    region: Arc<Region>,
}

impl DmaMemory {
    /// Creates a zeroed region of `size` bytes starting at physical address `base`.
    pub fn new(base: PhysAddr, size: u64) -> Result<DmaMemory> {
        let len = usize::try_from(size).map_err(|_| Error::BadRegion { base, size })?;
        let allocator =
            DmaAllocator::new(base, size, None).map_err(|_| Error::BadRegion { base, size })?;
        let bytes = (0..len).map(|_| AtomicU8::new(0)).collect();
        Ok(DmaMemory {
            region: Arc::new(Region {
                base,
                bytes,
                allocator: Mutex::new(allocator),
            }),
        })
    }

    pub fn base(&self) -> PhysAddr {
        self.region.base
    }

    pub fn size(&self) -> u64 {
        self.region.bytes.len() as u64
    }

    /// Returns true if `addr` falls inside this region.
    pub fn address_in_range(&self, addr: PhysAddr) -> bool {
        addr.offset_from(self.base())
            .map_or(false, |off| off < self.size())
    }

    /// Translates an offset into the backing storage to the address the controller uses.
    pub fn to_physical(&self, offset: usize) -> Result<PhysAddr> {
        if offset >= self.region.bytes.len() {
            return Err(Error::InvalidOffset(offset));
        }
        self.base()
            .checked_add(offset as u64)
            .ok_or(Error::InvalidOffset(offset))
    }

    /// Translates a controller-visible address back to an offset into the backing storage.
    pub fn to_virtual(&self, addr: PhysAddr) -> Result<usize> {
        self.range(addr, 1).map(|r| r.start)
    }

    fn range(&self, addr: PhysAddr, len: usize) -> Result<Range<usize>> {
        let invalid = || Error::InvalidAccess { addr, len };
        let start = addr.offset_from(self.base()).ok_or_else(invalid)?;
        let start = usize::try_from(start).map_err(|_| invalid())?;
        let end = start.checked_add(len).ok_or_else(invalid)?;
        if end > self.region.bytes.len() {
            return Err(invalid());
        }
        Ok(start..end)
    }

    /// Reads `buf.len()` bytes starting at `addr`.
    pub fn read_at_addr(&self, buf: &mut [u8], addr: PhysAddr) -> Result<()> {
        let range = self.range(addr, buf.len())?;
        for (dst, src) in buf.iter_mut().zip(&self.region.bytes[range]) {
            *dst = src.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Writes all of `buf` starting at `addr`.
    pub fn write_all_at_addr(&self, buf: &[u8], addr: PhysAddr) -> Result<()> {
        let range = self.range(addr, buf.len())?;
        for (src, dst) in buf.iter().zip(&self.region.bytes[range]) {
            dst.store(*src, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Sets `len` bytes starting at `addr` to `value`.
    pub fn fill(&self, value: u8, len: usize, addr: PhysAddr) -> Result<()> {
        let range = self.range(addr, len)?;
        for byte in &self.region.bytes[range] {
            byte.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Reads an object of type `T` from `addr`.
    pub fn read_obj_from_addr<T: FromBytes>(&self, addr: PhysAddr) -> Result<T> {
        let mut buf = vec![0u8; size_of::<T>()];
        self.read_at_addr(&mut buf, addr)?;
        T::read_from_bytes(&buf).map_err(|_| Error::Decode(addr))
    }

    /// Writes `val` at `addr`.
    pub fn write_obj_at_addr<T: IntoBytes + Immutable>(
        &self,
        val: T,
        addr: PhysAddr,
    ) -> Result<()> {
        self.write_all_at_addr(val.as_bytes(), addr)
    }

    pub fn read_u32(&self, addr: PhysAddr) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at_addr(&mut buf, addr)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, value: u32, addr: PhysAddr) -> Result<()> {
        self.write_all_at_addr(&value.to_le_bytes(), addr)
    }

    pub fn read_u64(&self, addr: PhysAddr) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_at_addr(&mut buf, addr)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, value: u64, addr: PhysAddr) -> Result<()> {
        self.write_all_at_addr(&value.to_le_bytes(), addr)
    }

    /// Writes `trb` so that its cycle bit becomes visible to the other agent only after every
    /// other field. The slot is first written with the inverted cycle bit, which keeps it owned
    /// by the writer.
    pub fn publish_trb(&self, trb: &Trb, addr: PhysAddr) -> Result<()> {
        let mut staged = *trb;
        staged.set_cycle(!trb.cycle());
        self.write_obj_at_addr(staged, addr)?;
        // The cycle dword must land after the rest of the TRB.
        fence(Ordering::SeqCst);
        let control_addr = addr
            .checked_add(TRB_CONTROL_OFFSET)
            .ok_or(Error::InvalidAccess {
                addr,
                len: TRB_SIZE,
            })?;
        self.write_u32(trb.control(), control_addr)
    }

    pub fn read_trb(&self, addr: PhysAddr) -> Result<Trb> {
        self.read_obj_from_addr(addr)
    }

    /// Returns the TRB at `addr` if its cycle bit equals `cycle`, that is if the other agent has
    /// handed it over.
    pub fn read_trb_if_owned(&self, addr: PhysAddr, cycle: bool) -> Result<Option<Trb>> {
        let control_addr = addr
            .checked_add(TRB_CONTROL_OFFSET)
            .ok_or(Error::InvalidAccess {
                addr,
                len: TRB_SIZE,
            })?;
        let control = self.read_u32(control_addr)?;
        if (control & 1 != 0) != cycle {
            return Ok(None);
        }
        fence(Ordering::Acquire);
        let trb = self.read_trb(addr)?;
        // The writer may have rewritten the slot between the two loads; trust the full copy.
        if trb.cycle() != cycle {
            return Ok(None);
        }
        Ok(Some(trb))
    }

    /// Allocates a zeroed buffer of `size` bytes aligned to `alignment` that does not cross a
    /// multiple of `boundary`.
    pub fn allocate(&self, size: u64, alignment: u64, boundary: Option<u64>) -> Result<DmaBuffer> {
        let addr = self
            .region
            .allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate(size, alignment, boundary)
            .map_err(Error::Allocate)?;
        let buffer = DmaBuffer {
            mem: self.clone(),
            addr,
            len: size,
        };
        // `size` was accepted by the allocator so it fits in the region.
        self.fill(0, size as usize, buffer.addr)?;
        Ok(buffer)
    }

    /// Bytes still available for allocation.
    pub fn free_bytes(&self) -> u64 {
        self.region
            .allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free_bytes()
    }

    fn release(&self, addr: PhysAddr) -> Result<()> {
        self.region
            .allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(addr)
            .map(|_| ())
            .map_err(Error::Release)
    }
}

impl fmt::Debug for DmaMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DmaMemory")
            .field("base", &self.base())
            .field("size", &self.size())
            .finish()
    }
}

/// An allocation inside a `DmaMemory` region, released when dropped.
pub struct DmaBuffer {
    mem: DmaMemory,
    addr: PhysAddr,
    len: u64,
}

impl DmaBuffer {
    pub fn addr(&self) -> PhysAddr {
        self.addr
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn memory(&self) -> &DmaMemory {
        &self.mem
    }

    /// Returns true if `addr` lies inside this buffer.
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr.offset_from(self.addr).map_or(false, |off| off < self.len)
    }

    /// Address of the byte at `offset`, checked against the buffer length.
    pub fn addr_at(&self, offset: u64) -> Result<PhysAddr> {
        let invalid = Error::InvalidAccess {
            addr: self.addr,
            len: offset as usize,
        };
        if offset >= self.len {
            return Err(invalid);
        }
        self.addr.checked_add(offset).ok_or(invalid)
    }

    fn check(&self, offset: u64, len: usize) -> Result<PhysAddr> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.len) {
            return Err(Error::InvalidAccess {
                addr: PhysAddr(self.addr.0.wrapping_add(offset)),
                len,
            });
        }
        Ok(PhysAddr(self.addr.0 + offset))
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let addr = self.check(offset, data.len())?;
        self.mem.write_all_at_addr(data, addr)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let addr = self.check(offset, buf.len())?;
        self.mem.read_at_addr(buf, addr)
    }

    /// Copies the whole buffer out.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.len as usize];
        self.mem.read_at_addr(&mut buf, self.addr)?;
        Ok(buf)
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.mem.release(self.addr) {
            error!("leaking dma buffer at {}: {}", self.addr, e);
        }
    }
}
