// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Segmented TRB rings shared with the controller.
//!
//! A `Ring` is an ordered list of segments, each a physically contiguous array of TRBs. Command
//! and transfer rings end every segment with a Link TRB to the next segment; the Link TRB of
//! the segment where the ring wraps carries Toggle Cycle. Event rings have no Link TRBs: their
//! segments are listed in the Event Ring Segment Table and wrapping past the last one toggles.
//!
//! Slots are addressed by `Cursor` (segment index, TRB index). Software and hardware never lock
//! each other out; a slot belongs to whoever the cycle bit says it belongs to. For producer
//! rings the ring's cycle is the value software writes into new TRBs; for event rings it is
//! the value software expects to read.
//!
//! The same machinery backs the three specializations in `command`, `transfer` and `event`.

mod command;
mod event;
mod transfer;

use std::fmt;
use std::fmt::Write;

use log::debug;
use log::trace;
use log::warn;
use remain::sorted;
use thiserror::Error;

pub use self::command::CommandCompletion;
pub use self::command::CommandRing;
pub use self::event::EventMatch;
pub use self::event::EventRing;
pub use self::event::EventRingState;
pub use self::transfer::Fragment;
pub use self::transfer::IsochOptions;
pub use self::transfer::Td;
pub use self::transfer::TdOptions;
pub use self::transfer::TransferCompletion;
pub use self::transfer::TransferRing;
use crate::config::RingConfig;
use crate::config::MAX_SEGMENT_TRBS;
use crate::config::MIN_SEGMENT_TRBS;
use crate::memory;
use crate::memory::DmaBuffer;
use crate::memory::DmaMemory;
use crate::memory::PhysAddr;
use crate::trb;
use crate::trb::LinkTrb;
use crate::trb::Trb;
use crate::trb::TrbType;
use crate::trb::TypedTrb;
use crate::trb::TRB_SIZE;

/// Segments may not cross a 64 KiB boundary.
pub const SEGMENT_BOUNDARY: u64 = 0x10000;
/// Alignment of every ring segment.
pub const SEGMENT_ALIGNMENT: u64 = 64;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("max packet size {0} is invalid")]
    BadPacketSize(u16),
    #[error("no segment {0}")]
    BadSegmentIndex(usize),
    #[error("segment of {0} trbs is outside the allowed size")]
    BadSegmentSize(usize),
    #[error("{0} is not a trb of this ring")]
    BadTrbAddress(PhysAddr),
    #[error("command ring is running, CRCR cannot be written")]
    CommandRingRunning,
    #[error("expected a trb at {0} but the slot is empty")]
    EmptySlot(PhysAddr),
    #[error("cannot remove the only segment")]
    LastSegment,
    #[error("memory access failed: {0}")]
    Memory(memory::Error),
    #[error("no transfer descriptor to truncate")]
    NoTd,
    #[error("{0} is not between the dequeue and enqueue pointers")]
    NotPending(PhysAddr),
    #[error("ring is full")]
    RingFull,
    #[error("segment {0} is in use by the controller")]
    SegmentBusy(usize),
    #[error("event ring already has the maximum of {0} segments")]
    SegmentLimit(usize),
    #[error("segment {0} is pending a table change")]
    SegmentPending(usize),
    #[error("timed out waiting for the controller")]
    Timeout,
    #[error("bad trb: {0}")]
    Trb(trb::Error),
    #[error("cannot keep {keep} trbs of a {len} trb transfer descriptor")]
    TruncateOutOfRange { keep: usize, len: usize },
    #[error("operation not supported on a {0:?} ring")]
    WrongKind(RingKind),
    #[error("ring is {0:?}")]
    WrongState(RingState),
    #[error("{0:?} trb does not belong on this ring")]
    WrongTrbType(TrbType),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<memory::Error> for Error {
    fn from(e: memory::Error) -> Self {
        Error::Memory(e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingKind {
    Command,
    Transfer,
    Event,
}

impl RingKind {
    /// Command and transfer rings are chained by Link TRBs.
    pub fn has_links(self) -> bool {
        self != RingKind::Event
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingState {
    Uninitialized,
    Active,
    TornDown,
}

/// Position of a TRB slot in a ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Cursor {
    pub segment: usize,
    pub index: usize,
}

impl Cursor {
    pub fn new(segment: usize, index: usize) -> Cursor {
        Cursor { segment, index }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.index)
    }
}

/// A slot handed out by `Ring::insert_empty_slot`, to be filled with `Ring::publish`.
///
/// The slot in memory is zeroed and still carries the inverted cycle bit, so the controller
/// does not own it until it is published with `cycle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub addr: PhysAddr,
    pub cursor: Cursor,
    /// The cycle value that hands this slot to the controller.
    pub cycle: bool,
    /// Link TRB that follows this slot and is armed along with it.
    link: Option<PhysAddr>,
}

struct Segment {
    buffer: DmaBuffer,
    capacity: usize,
    /// Traversing past the end of this segment toggles the cycle.
    toggle: bool,
}

impl Segment {
    fn addr(&self) -> PhysAddr {
        self.buffer.addr()
    }

    fn trb_addr(&self, index: usize) -> PhysAddr {
        PhysAddr(self.buffer.addr().0 + (index * TRB_SIZE) as u64)
    }
}

pub struct Ring {
    name: String,
    kind: RingKind,
    mem: DmaMemory,
    config: RingConfig,
    segments: Vec<Segment>,
    enqueue: Cursor,
    dequeue: Cursor,
    cycle: bool,
    state: RingState,
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} ring `{}`", self.kind, self.name)
    }
}

impl Ring {
    pub fn new(name: &str, kind: RingKind, mem: DmaMemory, config: RingConfig) -> Ring {
        Ring {
            name: name.to_owned(),
            kind,
            mem,
            config,
            segments: Vec::new(),
            enqueue: Cursor::default(),
            dequeue: Cursor::default(),
            // xHCI 4.9.2: rings start with cycle state 1.
            cycle: true,
            state: RingState::Uninitialized,
        }
    }

    /// Allocates the first segment and makes the ring usable. `capacity` defaults to the
    /// configured segment size. The first segment of a command or transfer ring needs a usable
    /// slot besides its Link TRB and the one kept free, so it holds at least 3 TRBs.
    pub fn init(&mut self, capacity: Option<usize>) -> Result<()> {
        if self.state != RingState::Uninitialized {
            return Err(Error::WrongState(self.state));
        }
        let capacity = capacity.unwrap_or(self.config.segment_trbs);
        let min = if self.kind.has_links() {
            MIN_SEGMENT_TRBS + 1
        } else {
            MIN_SEGMENT_TRBS
        };
        if capacity < min || capacity > MAX_SEGMENT_TRBS {
            return Err(Error::BadSegmentSize(capacity));
        }
        let segment = self.allocate_segment(capacity)?;
        self.segments.push(Segment {
            toggle: true,
            ..segment
        });
        self.enqueue = Cursor::default();
        self.dequeue = Cursor::default();
        self.cycle = true;
        self.fill_segment(0)?;
        if self.kind.has_links() {
            self.write_link(0)?;
        }
        self.state = RingState::Active;
        debug!(
            "{}: initialized with {} trbs at {}",
            self,
            capacity,
            self.segments[0].addr()
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    pub fn state(&self) -> RingState {
        self.state
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    pub fn memory(&self) -> &DmaMemory {
        &self.mem
    }

    /// Producer cycle state for command and transfer rings, consumer cycle state for event
    /// rings.
    pub fn cycle(&self) -> bool {
        self.cycle
    }

    pub fn enqueue(&self) -> Cursor {
        self.enqueue
    }

    pub fn dequeue(&self) -> Cursor {
        self.dequeue
    }

    pub fn enqueue_addr(&self) -> PhysAddr {
        self.trb_addr(self.enqueue)
    }

    pub fn dequeue_addr(&self) -> PhysAddr {
        self.trb_addr(self.dequeue)
    }

    /// Address of the first TRB of the first segment, what CRCR and endpoint contexts point at.
    pub fn base(&self) -> Option<PhysAddr> {
        self.segments.first().map(Segment::addr)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_addr(&self, segment: usize) -> Result<PhysAddr> {
        self.segment(segment).map(Segment::addr)
    }

    pub fn segment_capacity(&self, segment: usize) -> Result<usize> {
        self.segment(segment).map(|s| s.capacity)
    }

    pub fn toggle_cycle(&self, segment: usize) -> Result<bool> {
        self.segment(segment).map(|s| s.toggle)
    }

    /// Address of the TRB at `cursor`. The cursor must be valid.
    pub fn trb_addr(&self, cursor: Cursor) -> PhysAddr {
        self.segments
            .get(cursor.segment)
            .map_or(PhysAddr(0), |s| s.trb_addr(cursor.index))
    }

    pub fn read(&self, cursor: Cursor) -> Result<Trb> {
        self.check_cursor(cursor)?;
        Ok(self.mem.read_trb(self.trb_addr(cursor))?)
    }

    fn segment(&self, segment: usize) -> Result<&Segment> {
        self.segments
            .get(segment)
            .ok_or(Error::BadSegmentIndex(segment))
    }

    fn check_active(&self) -> Result<()> {
        if self.state != RingState::Active {
            return Err(Error::WrongState(self.state));
        }
        Ok(())
    }

    fn check_cursor(&self, cursor: Cursor) -> Result<()> {
        let segment = self.segment(cursor.segment)?;
        if cursor.index >= segment.capacity {
            return Err(Error::BadTrbAddress(segment.trb_addr(cursor.index)));
        }
        Ok(())
    }

    // Slots of `segment` that can hold work, i.e. all but the Link TRB.
    fn usable(&self, segment: usize) -> usize {
        let capacity = self.segments[segment].capacity;
        if self.kind.has_links() {
            capacity - 1
        } else {
            capacity
        }
    }

    fn total_usable(&self) -> usize {
        (0..self.segments.len()).map(|s| self.usable(s)).sum()
    }

    // Linear position of a usable slot. A Link TRB maps to the first slot of the next segment.
    fn position(&self, cursor: Cursor) -> usize {
        let before: usize = (0..cursor.segment).map(|s| self.usable(s)).sum();
        (before + cursor.index.min(self.usable(cursor.segment))) % self.total_usable().max(1)
    }

    // Number of forward steps from `from` to `to`.
    fn distance(&self, from: Cursor, to: Cursor) -> usize {
        let total = self.total_usable();
        if total == 0 {
            return 0;
        }
        (self.position(to) + total - self.position(from)) % total
    }

    // The slot after `cursor`, and the cycle value there given `cycle` at `cursor`.
    fn next(&self, cursor: Cursor, cycle: bool) -> (Cursor, bool) {
        let index = cursor.index + 1;
        if index < self.usable(cursor.segment) {
            return (Cursor::new(cursor.segment, index), cycle);
        }
        let segment = (cursor.segment + 1) % self.segments.len();
        (
            Cursor::new(segment, 0),
            cycle ^ self.segments[cursor.segment].toggle,
        )
    }

    fn prev(&self, cursor: Cursor) -> Cursor {
        if cursor.index > 0 {
            return Cursor::new(cursor.segment, cursor.index - 1);
        }
        let segment = (cursor.segment + self.segments.len() - 1) % self.segments.len();
        Cursor::new(segment, self.usable(segment) - 1)
    }

    // Parity of Toggle Cycle crossings walking forward from `from` to `to`.
    fn toggles_between(&self, from: Cursor, to: Cursor) -> bool {
        if from.segment == to.segment && to.index >= from.index {
            return false;
        }
        let mut parity = false;
        let mut segment = from.segment;
        loop {
            parity ^= self.segments[segment].toggle;
            segment = (segment + 1) % self.segments.len();
            if segment == to.segment {
                return parity;
            }
        }
    }

    // Software's own position: enqueue for producer rings, dequeue for event rings.
    fn origin(&self) -> Cursor {
        if self.kind.has_links() {
            self.enqueue
        } else {
            self.dequeue
        }
    }

    // Cycle value software will use when it next reaches `cursor`.
    fn arrival_cycle(&self, cursor: Cursor) -> bool {
        self.cycle ^ self.toggles_between(self.origin(), cursor)
    }

    /// Cycle value a slot between dequeue and enqueue was published with.
    pub fn cycle_at(&self, cursor: Cursor) -> bool {
        self.cycle ^ self.toggles_between(cursor, self.origin())
    }

    // True if the controller may still read the slot at `cursor`.
    fn in_flight(&self, cursor: Cursor) -> bool {
        self.kind.has_links()
            && self.distance(self.dequeue, cursor) < self.distance(self.dequeue, self.enqueue)
    }

    fn allocate_segment(&self, capacity: usize) -> Result<Segment> {
        let buffer = self.mem.allocate(
            (capacity * TRB_SIZE) as u64,
            SEGMENT_ALIGNMENT,
            Some(SEGMENT_BOUNDARY),
        )?;
        Ok(Segment {
            buffer,
            capacity,
            toggle: false,
        })
    }

    // Zeroes every slot of `segment` with a cycle bit the controller will not accept on its
    // next pass.
    fn fill_segment(&self, segment: usize) -> Result<()> {
        let start = Cursor::new(segment, 0);
        let mut empty = Trb::default();
        empty.set_cycle(!self.arrival_cycle(start));
        let seg = &self.segments[segment];
        for index in 0..seg.capacity {
            self.mem.write_obj_at_addr(empty, seg.trb_addr(index))?;
        }
        Ok(())
    }

    /// Rewrites the Link TRB of `segment` to point at the next segment in ring order, with the
    /// segment's Toggle Cycle flag. The link stays owned by software until the TRB before it is
    /// published.
    pub fn write_link(&self, segment: usize) -> Result<()> {
        if !self.kind.has_links() {
            return Err(Error::WrongKind(self.kind));
        }
        let seg = self.segment(segment)?;
        let next = &self.segments[(segment + 1) % self.segments.len()];
        let link_index = seg.capacity - 1;
        let mut link = Trb::build(&LinkTrb {
            ring_segment_pointer: next.addr().0,
            toggle_cycle: seg.toggle,
            ..Default::default()
        });
        link.set_cycle(!self.arrival_cycle(Cursor::new(segment, link_index)));
        self.mem.write_obj_at_addr(link, seg.trb_addr(link_index))?;
        Ok(())
    }

    // The Link TRB of `segment` is in flight when the TRB before it has been published and not
    // yet completed.
    fn check_link_idle(&self, segment: usize) -> Result<()> {
        let last = Cursor::new(segment, self.usable(segment) - 1);
        if self.in_flight(last) {
            warn!("{}: link of segment {} is in flight", self, segment);
            return Err(Error::SegmentBusy(segment));
        }
        Ok(())
    }

    /// Sets or clears Toggle Cycle on the Link TRB of `segment`.
    pub fn set_toggle_cycle(&mut self, segment: usize, toggle: bool) -> Result<()> {
        self.check_active()?;
        if !self.kind.has_links() {
            return Err(Error::WrongKind(self.kind));
        }
        self.segment(segment)?;
        self.check_link_idle(segment)?;
        self.segments[segment].toggle = toggle;
        self.write_link(segment)
    }

    /// Splices a new segment of `capacity` TRBs in after segment `after` (default: the last
    /// segment) and returns its index.
    ///
    /// With `handle_link`, the Link TRB of `after` is rewritten to point at the new segment and
    /// its Toggle Cycle flag moves to the new segment's link. Otherwise the new segment links to
    /// the old successor and the caller rewrites `after`'s link with `write_link` later.
    pub fn append_segment(
        &mut self,
        capacity: usize,
        after: Option<usize>,
        handle_link: bool,
    ) -> Result<usize> {
        self.check_active()?;
        if !(MIN_SEGMENT_TRBS..=MAX_SEGMENT_TRBS).contains(&capacity) {
            return Err(Error::BadSegmentSize(capacity));
        }
        let after = after.unwrap_or(self.segments.len() - 1);
        self.segment(after)?;
        let links = self.kind.has_links();
        if links && handle_link {
            self.check_link_idle(after)?;
        }

        let segment = self.allocate_segment(capacity)?;
        let index = after + 1;
        self.segments.insert(index, segment);
        for cursor in [&mut self.enqueue, &mut self.dequeue] {
            if cursor.segment >= index {
                cursor.segment += 1;
            }
        }

        if links {
            if handle_link {
                self.segments[index].toggle = self.segments[after].toggle;
                self.segments[after].toggle = false;
            }
            self.fill_segment(index)?;
            self.write_link(index)?;
            if handle_link {
                self.write_link(after)?;
            }
        } else {
            self.retoggle_event_segments();
            self.fill_segment(index)?;
        }
        debug!(
            "{}: appended segment {} of {} trbs at {}",
            self,
            index,
            capacity,
            self.segments[index].addr()
        );
        Ok(index)
    }

    /// Removes segment `index` and frees it. With `handle_link`, the Link TRB that pointed at
    /// it is rewritten to point at its successor and inherits its Toggle Cycle flag.
    pub fn remove_segment(&mut self, index: usize, handle_link: bool) -> Result<()> {
        self.check_active()?;
        self.segment(index)?;
        if self.segments.len() == 1 {
            return Err(Error::LastSegment);
        }
        if self.enqueue.segment == index || self.dequeue.segment == index {
            return Err(Error::SegmentBusy(index));
        }
        let links = self.kind.has_links();
        let pred = (index + self.segments.len() - 1) % self.segments.len();
        if links {
            if self.in_flight(Cursor::new(index, 0)) {
                return Err(Error::SegmentBusy(index));
            }
            if handle_link {
                self.check_link_idle(pred)?;
            }
        }

        let removed = self.segments.remove(index);
        for cursor in [&mut self.enqueue, &mut self.dequeue] {
            if cursor.segment > index {
                cursor.segment -= 1;
            }
        }
        let pred = if pred > index { pred - 1 } else { pred };
        if links {
            // Keep the number of toggles per lap unchanged.
            self.segments[pred].toggle ^= removed.toggle;
            if handle_link {
                self.write_link(pred)?;
            }
        } else {
            self.retoggle_event_segments();
        }
        debug!("{}: removed segment {} at {}", self, index, removed.addr());
        Ok(())
    }

    // Event rings wrap, and toggle, after the last table entry.
    fn retoggle_event_segments(&mut self) {
        let last = self.segments.len() - 1;
        for (i, segment) in self.segments.iter_mut().enumerate() {
            segment.toggle = i == last;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.enqueue == self.dequeue
    }

    /// Full when taking one more slot would make enqueue catch up with dequeue.
    pub fn is_full(&self) -> bool {
        !self.segments.is_empty() && self.next(self.enqueue, self.cycle).0 == self.dequeue
    }

    /// Slots `insert_empty_slot` can still hand out.
    pub fn free_slots(&self) -> usize {
        if self.segments.is_empty() || !self.kind.has_links() {
            return 0;
        }
        match self.distance(self.enqueue, self.dequeue) {
            0 => self.total_usable() - 1,
            d => d - 1,
        }
    }

    /// Slots published and not yet reported complete.
    pub fn pending(&self) -> usize {
        self.distance(self.dequeue, self.enqueue)
    }

    /// Takes the slot at the enqueue pointer and advances it, crossing Link TRBs and toggling
    /// the cycle where they say so.
    ///
    /// The slot is zeroed in memory with the inverted cycle bit, so the controller does not own
    /// it yet. The cycle value that hands it over is kept in `Slot::cycle` and written by
    /// `publish` after every other field. Until then the controller cannot observe a
    /// partially filled TRB.
    pub fn insert_empty_slot(&mut self) -> Result<Slot> {
        self.check_active()?;
        if !self.kind.has_links() {
            return Err(Error::WrongKind(self.kind));
        }
        let (next, next_cycle) = self.next(self.enqueue, self.cycle);
        if next == self.dequeue {
            warn!("{}: ring full at {}", self, self.enqueue);
            return Err(Error::RingFull);
        }
        let cursor = self.enqueue;
        let addr = self.trb_addr(cursor);
        let mut empty = Trb::default();
        empty.set_cycle(!self.cycle);
        self.mem.write_obj_at_addr(empty, addr)?;
        let link = if next.segment != cursor.segment || next.index == 0 {
            let segment = &self.segments[cursor.segment];
            Some(segment.trb_addr(segment.capacity - 1))
        } else {
            None
        };
        let slot = Slot {
            addr,
            cursor,
            cycle: self.cycle,
            link,
        };
        self.enqueue = next;
        self.cycle = next_cycle;
        Ok(slot)
    }

    /// Writes `trb` into `slot` and hands it to the controller: every field first, the cycle
    /// bit last. A Link TRB following the slot is armed with it and copies its chain flag.
    pub fn publish(&self, slot: &Slot, trb: Trb) -> Result<()> {
        let trb_type = trb.trb_type().map_err(Error::Trb)?;
        let mut trb = trb;
        trb.finalize(trb_type, slot.cycle);
        self.mem.publish_trb(&trb, slot.addr)?;
        if self.config.debug {
            trace!("{}: {} <- {}", self, slot.addr, trb);
        }
        if let Some(link_addr) = slot.link {
            let mut link = self.mem.read_trb(link_addr)?;
            link.set_chain(trb.chain());
            link.set_cycle(slot.cycle);
            self.mem.publish_trb(&link, link_addr)?;
            if self.config.debug {
                trace!("{}: {} <- {}", self, link_addr, link);
            }
        }
        Ok(())
    }

    /// Encodes `fields` and publishes them into `slot`.
    pub fn publish_typed<T: TypedTrb>(&self, slot: &Slot, fields: &T) -> Result<()> {
        self.publish(slot, fields.to_trb())
    }

    /// Rewrites the TRB at `addr` in place, keeping its cycle bit. Only valid for slots the
    /// controller cannot be reading, e.g. ahead of a TD's unpublished first TRB.
    pub(crate) fn modify<F: FnOnce(&mut Trb)>(&self, addr: PhysAddr, f: F) -> Result<()> {
        let mut trb = self.mem.read_trb(addr)?;
        let cycle = trb.cycle();
        f(&mut trb);
        trb.set_cycle(cycle);
        self.mem.publish_trb(&trb, addr)?;
        Ok(())
    }

    /// True if the TRB at `addr` is at most as far from dequeue as enqueue is, i.e. the
    /// controller has not been reported past it. The enqueue slot itself counts.
    pub fn is_owned_by_software(&self, addr: PhysAddr) -> Result<bool> {
        let cursor = self.find(addr)?;
        Ok(self.distance(self.dequeue, cursor) <= self.distance(self.dequeue, self.enqueue))
    }

    /// True if the TRB at `addr` has been published and dequeue has not moved past it.
    pub fn is_pending(&self, addr: PhysAddr) -> Result<bool> {
        let cursor = self.find(addr)?;
        Ok(self.in_flight(cursor))
    }

    /// Moves dequeue to `finished`, or just past it with `advance_one_more`.
    pub fn advance_dequeue(&mut self, finished: PhysAddr, advance_one_more: bool) -> Result<()> {
        self.check_active()?;
        let cursor = self.find(finished)?;
        if cursor.index >= self.usable(cursor.segment) {
            return Err(Error::BadTrbAddress(finished));
        }
        let pending = self.distance(self.dequeue, self.enqueue);
        if self.kind.has_links() && self.distance(self.dequeue, cursor) >= pending {
            return Err(Error::NotPending(finished));
        }
        self.dequeue = if advance_one_more {
            self.next(cursor, false).0
        } else {
            cursor
        };
        Ok(())
    }

    /// Segment and index of the TRB at `addr`.
    pub fn find(&self, addr: PhysAddr) -> Result<Cursor> {
        if !addr.is_aligned(TRB_SIZE as u64) {
            return Err(Error::BadTrbAddress(addr));
        }
        self.segments
            .iter()
            .enumerate()
            .find_map(|(i, segment)| {
                let offset = addr.offset_from(segment.addr())?;
                let index = (offset / TRB_SIZE as u64) as usize;
                (index < segment.capacity).then_some(Cursor::new(i, index))
            })
            .ok_or(Error::BadTrbAddress(addr))
    }

    /// The usable slot `count` steps after `cursor`, skipping Link TRBs.
    pub fn step_forward(&self, cursor: Cursor, count: usize) -> Result<Cursor> {
        self.check_cursor(cursor)?;
        let mut cursor = cursor;
        for _ in 0..count {
            cursor = self.next(cursor, false).0;
        }
        Ok(cursor)
    }

    /// The usable slot `count` steps before `cursor`, skipping Link TRBs.
    pub fn step_backward(&self, cursor: Cursor, count: usize) -> Result<Cursor> {
        self.check_cursor(cursor)?;
        let mut cursor = cursor;
        for _ in 0..count {
            cursor = self.prev(cursor);
        }
        Ok(cursor)
    }

    /// Moves dequeue to `addr`, which may be the enqueue slot itself, as when the controller
    /// reports where it stopped.
    pub(crate) fn sync_dequeue(&mut self, addr: PhysAddr) -> Result<()> {
        if addr == self.enqueue_addr() {
            self.dequeue = self.enqueue;
            return Ok(());
        }
        self.advance_dequeue(addr, false)
    }

    /// Drops every pending slot, as after the controller's dequeue pointer is moved to enqueue.
    pub(crate) fn reset_dequeue(&mut self) {
        self.dequeue = self.enqueue;
    }

    // Event ring consumer side.

    /// Repositions the consumer when the controller is found to have taken another path
    /// through the segment table.
    pub(crate) fn set_consumer(&mut self, cursor: Cursor, cycle: bool) -> Result<()> {
        self.check_cursor(cursor)?;
        self.dequeue = cursor;
        self.cycle = cycle;
        Ok(())
    }

    /// The event at dequeue if the controller has written it.
    pub(crate) fn peek_event(&self) -> Result<Option<Trb>> {
        self.check_active()?;
        Ok(self.mem.read_trb_if_owned(self.dequeue_addr(), self.cycle)?)
    }

    /// Moves the consumer past the event at dequeue.
    pub(crate) fn pop_event(&mut self) {
        let (next, cycle) = self.next(self.dequeue, self.cycle);
        self.dequeue = next;
        self.cycle = cycle;
    }

    /// Frees every segment. The ring cannot be used afterwards.
    pub fn teardown(&mut self) {
        if self.state == RingState::TornDown {
            return;
        }
        debug!("{}: torn down", self);
        self.segments.clear();
        self.enqueue = Cursor::default();
        self.dequeue = Cursor::default();
        self.state = RingState::TornDown;
    }

    /// Renders every TRB of the ring, marking the enqueue and dequeue pointers.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {:?} cycle={} enqueue={} dequeue={}",
            self, self.state, self.cycle as u8, self.enqueue, self.dequeue
        );
        for (i, segment) in self.segments.iter().enumerate() {
            let _ = writeln!(
                out,
                "segment {} at {}: {} trbs{}",
                i,
                segment.addr(),
                segment.capacity,
                if segment.toggle { " (toggle)" } else { "" }
            );
            for index in 0..segment.capacity {
                let cursor = Cursor::new(i, index);
                let marker = match (cursor == self.enqueue, cursor == self.dequeue) {
                    (true, true) => "ED",
                    (true, false) => "E ",
                    (false, true) => " D",
                    (false, false) => "  ",
                };
                let addr = segment.trb_addr(index);
                match self.mem.read_trb(addr) {
                    Ok(trb) => {
                        let _ = writeln!(out, "  {} {:4} {} {}", marker, index, addr, trb);
                    }
                    Err(e) => {
                        let _ = writeln!(out, "  {} {:4} {} <{}>", marker, index, addr, e);
                    }
                }
            }
        }
        out
    }

    /// Logs `dump` when debugging is configured.
    pub fn log_dump(&self) {
        if self.config.debug {
            debug!("{}", self.dump());
        }
    }
}
