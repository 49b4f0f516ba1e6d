// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;

use remain::sorted;
use thiserror::Error;

use super::PhysAddr;

#[sorted]
#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    #[error("allocation cannot have size of 0")]
    AllocSizeZero,
    #[error("alignment must be a power of 2")]
    BadAlignment,
    #[error("no allocation starts at {0}")]
    BadAlloc(PhysAddr),
    #[error("pool of {size:#x} bytes at {base} is empty or wraps the address space")]
    BadPool { base: PhysAddr, size: u64 },
    #[error("allocation of {size:#x} bytes cannot avoid crossing a {boundary:#x} boundary")]
    BoundaryTooSmall { size: u64, boundary: u64 },
    #[error("out of space")]
    OutOfSpace,
}

pub type Result<T> = std::result::Result<T, Error>;

/// First-fit allocator over the physical range of one DMA region.
///
/// Free space is a set of extents keyed by start address, merged with their neighbours on
/// release so no two free extents touch. Allocations are keyed by the address handed out,
/// which is all a `DmaBuffer` keeps to give it back.
#[derive(Debug)]
pub struct DmaAllocator {
    min_align: u64,
    free: BTreeMap<u64, u64>,
    live: BTreeMap<u64, u64>,
}

impl DmaAllocator {
    /// Manages `size` bytes from `base`. `min_align` defaults to 16, the TRB size.
    pub fn new(base: PhysAddr, size: u64, min_align: Option<u64>) -> Result<Self> {
        let min_align = min_align.unwrap_or(16);
        if !min_align.is_power_of_two() {
            return Err(Error::BadAlignment);
        }
        if size == 0 || base.0.checked_add(size).is_none() {
            return Err(Error::BadPool { base, size });
        }
        Ok(DmaAllocator {
            min_align,
            free: BTreeMap::from([(base.0, size)]),
            live: BTreeMap::new(),
        })
    }

    /// Allocates `size` bytes aligned to `alignment`. When `boundary` is given, the returned
    /// buffer never crosses a multiple of it.
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        boundary: Option<u64>,
    ) -> Result<PhysAddr> {
        if size == 0 {
            return Err(Error::AllocSizeZero);
        }
        let alignment = alignment.max(self.min_align);
        if !alignment.is_power_of_two() {
            return Err(Error::BadAlignment);
        }
        if let Some(boundary) = boundary {
            if !boundary.is_power_of_two() {
                return Err(Error::BadAlignment);
            }
            if size > boundary {
                return Err(Error::BoundaryTooSmall { size, boundary });
            }
        }

        let (start, len, addr) = self
            .free
            .iter()
            .find_map(|(&start, &len)| {
                let addr = place(start, size, alignment, boundary)?;
                (addr.checked_add(size)? <= start + len).then_some((start, len, addr))
            })
            .ok_or(Error::OutOfSpace)?;

        self.free.remove(&start);
        if addr > start {
            self.free.insert(start, addr - start);
        }
        let end = addr + size;
        if end < start + len {
            self.free.insert(end, start + len - end);
        }
        self.live.insert(addr, size);
        Ok(PhysAddr(addr))
    }

    /// Gives back the allocation at `addr` and returns its size.
    pub fn release(&mut self, addr: PhysAddr) -> Result<u64> {
        let size = self.live.remove(&addr.0).ok_or(Error::BadAlloc(addr))?;
        let mut start = addr.0;
        let mut end = start + size;
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }
        self.free.insert(start, end - start);
        Ok(size)
    }

    /// Number of bytes not handed out.
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }
}

// Lowest address at or above `start` with the alignment that keeps `size` bytes inside one
// `boundary` window.
fn place(start: u64, size: u64, alignment: u64, boundary: Option<u64>) -> Option<u64> {
    let addr = align_up(start, alignment)?;
    let last = addr.checked_add(size - 1)?;
    match boundary {
        Some(b) if addr / b != last / b => align_up(addr, b),
        _ => Some(addr),
    }
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    value.checked_add(alignment - 1).map(|v| v & !(alignment - 1))
}
