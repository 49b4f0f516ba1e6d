// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::fmt;
use std::hint;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::error;
use log::trace;
use log::warn;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use super::Cursor;
use super::Error;
use super::Result;
use super::Ring;
use super::RingKind;
use super::SEGMENT_ALIGNMENT;
use crate::config::RingConfig;
use crate::memory::DmaBuffer;
use crate::memory::DmaMemory;
use crate::memory::PhysAddr;
use crate::regs::RegisterIo;
use crate::regs::RegisterLayout;
use crate::regs::ERDP_DEQUEUE_ERST_SEGMENT_INDEX;
use crate::regs::ERDP_EVENT_HANDLER_BUSY;
use crate::trb::CompletionCode;
use crate::trb::Trb;
use crate::trb::TrbType;

/// One Event Ring Segment Table entry, xHCI 6.5.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ErstEntry {
    pub ring_segment_base_address: u64,
    pub ring_segment_size: u32,
    reserved: u32,
}

const ERST_ENTRY_SIZE: usize = std::mem::size_of::<ErstEntry>();

/// Selects which event `EventRing::wait_for` returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventMatch {
    /// Command Completion or Transfer Event reporting on the TRB at this address.
    TrbAddress(PhysAddr),
    /// Any event of `trb_type`, optionally from one slot and endpoint.
    Type {
        trb_type: TrbType,
        slot_id: Option<u8>,
        endpoint_id: Option<u8>,
    },
    /// Any event carrying this completion code.
    Completion(CompletionCode),
}

impl EventMatch {
    pub fn of_type(trb_type: TrbType) -> EventMatch {
        EventMatch::Type {
            trb_type,
            slot_id: None,
            endpoint_id: None,
        }
    }

    pub fn matches(&self, event: &Trb) -> bool {
        match *self {
            EventMatch::TrbAddress(addr) => event.event_trb_pointer() == Some(addr),
            EventMatch::Type {
                trb_type,
                slot_id,
                endpoint_id,
            } => {
                event.trb_type() == Ok(trb_type)
                    && slot_id.map_or(true, |id| event.slot_id() == id)
                    && endpoint_id.map_or(true, |id| event.endpoint_id() == id)
            }
            EventMatch::Completion(code) => event.completion_code() == Some(code),
        }
    }
}

/// Whether the segment table is being resized under the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventRingState {
    Normal,
    /// The last segment was just added. The controller may or may not have seen the new table
    /// size when it left the segment before it.
    SegmentPending { segment: usize },
    /// The last segment was dropped from the table but may still be written by the controller.
    SegmentRemoving { segment: usize },
}

/// The consumer side of an interrupter's event ring.
///
/// Events are taken off the ring strictly in the order the controller wrote them. Events read
/// while waiting for something else are kept in a local queue, in order, until asked for.
pub struct EventRing {
    ring: Ring,
    io: Arc<dyn RegisterIo>,
    layout: RegisterLayout,
    interrupter: u16,
    max_segments: usize,
    erst: Option<DmaBuffer>,
    queue: VecDeque<Trb>,
    state: EventRingState,
}

impl fmt::Display for EventRing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "event ring {}", self.interrupter)
    }
}

impl EventRing {
    /// `erst_max` is the controller's ERST Max; the table may hold `2^erst_max` entries, fewer
    /// if the config caps it.
    pub fn new(
        mem: DmaMemory,
        io: Arc<dyn RegisterIo>,
        layout: RegisterLayout,
        interrupter: u16,
        erst_max: u8,
        config: RingConfig,
    ) -> EventRing {
        let hw_max = 1usize << erst_max.min(15);
        let max_segments = config
            .max_event_segments
            .map_or(hw_max, |cap| cap.min(hw_max));
        let name = format!("event {}", interrupter);
        EventRing {
            ring: Ring::new(&name, RingKind::Event, mem, config),
            io,
            layout,
            interrupter,
            max_segments,
            erst: None,
            queue: VecDeque::new(),
            state: EventRingState::Normal,
        }
    }

    /// Allocates the table and the first segment and hands both to the interrupter: ERSTSZ,
    /// then ERDP, then ERSTBA, which enables the ring.
    pub fn init(&mut self, capacity: Option<usize>) -> Result<()> {
        self.ring.init(capacity)?;
        let erst = self.ring.memory().allocate(
            (self.max_segments * ERST_ENTRY_SIZE) as u64,
            SEGMENT_ALIGNMENT,
            None,
        )?;
        let erst_addr = erst.addr();
        self.erst = Some(erst);
        self.write_erst_entry(0)?;
        self.io.write32(self.layout.erstsz(self.interrupter), 1);
        self.write_dequeue();
        self.io.write64(self.layout.erstba(self.interrupter), erst_addr.0);
        debug!("{}: erst at {}", self, erst_addr);
        Ok(())
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn interrupter(&self) -> u16 {
        self.interrupter
    }

    pub fn state(&self) -> EventRingState {
        self.state
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    pub fn erst_addr(&self) -> Option<PhysAddr> {
        self.erst.as_ref().map(DmaBuffer::addr)
    }

    /// Events already taken off the ring and not yet returned, oldest first.
    pub fn queued(&self) -> &VecDeque<Trb> {
        &self.queue
    }

    /// Hands the local queue over to the caller.
    pub fn take_queued(&mut self) -> Vec<Trb> {
        self.queue.drain(..).collect()
    }

    fn write_erst_entry(&self, segment: usize) -> Result<()> {
        let erst = self.erst.as_ref().ok_or(Error::WrongState(self.ring.state()))?;
        let entry = ErstEntry {
            ring_segment_base_address: self.ring.segment_addr(segment)?.0,
            ring_segment_size: self.ring.segment_capacity(segment)? as u32,
            reserved: 0,
        };
        erst.write_at((segment * ERST_ENTRY_SIZE) as u64, entry.as_bytes())?;
        Ok(())
    }

    // Tells the controller how far software has read and clears Event Handler Busy.
    fn write_dequeue(&self) {
        let segment = self.ring.dequeue().segment as u64 & ERDP_DEQUEUE_ERST_SEGMENT_INDEX;
        self.io.write64(
            self.layout.erdp(self.interrupter),
            self.ring.dequeue_addr().0 | ERDP_EVENT_HANDLER_BUSY | segment,
        );
    }

    /// Adds a segment of `capacity` TRBs at the end of the segment table.
    pub fn append_segment(&mut self, capacity: usize) -> Result<usize> {
        if let EventRingState::SegmentPending { segment }
        | EventRingState::SegmentRemoving { segment } = self.state
        {
            return Err(Error::SegmentPending(segment));
        }
        if self.ring.segment_count() >= self.max_segments {
            return Err(Error::SegmentLimit(self.max_segments));
        }
        let segment = self.ring.append_segment(capacity, None, false)?;
        // The entry must be in place before the controller can see the new size.
        self.write_erst_entry(segment)?;
        self.io.write32(
            self.layout.erstsz(self.interrupter),
            self.ring.segment_count() as u32,
        );
        self.state = EventRingState::SegmentPending { segment };
        debug!("{}: segment {} pending", self, segment);
        Ok(segment)
    }

    /// Drops the last segment from the table. It is freed once the controller is known to be
    /// done with it.
    pub fn remove_last_segment(&mut self) -> Result<()> {
        if let EventRingState::SegmentPending { segment }
        | EventRingState::SegmentRemoving { segment } = self.state
        {
            return Err(Error::SegmentPending(segment));
        }
        let count = self.ring.segment_count();
        if count == 1 {
            return Err(Error::LastSegment);
        }
        let segment = count - 1;
        if self.ring.dequeue().segment == segment {
            return Err(Error::SegmentBusy(segment));
        }
        self.io.write32(self.layout.erstsz(self.interrupter), segment as u32);
        self.state = EventRingState::SegmentRemoving { segment };
        debug!("{}: segment {} removing", self, segment);
        Ok(())
    }

    // Frees a removed segment once the consumer has left it behind.
    fn finish_removal(&mut self, segment: usize) -> Result<()> {
        self.ring.remove_segment(segment, false)?;
        self.state = EventRingState::Normal;
        debug!("{}: segment {} removed", self, segment);
        Ok(())
    }

    // When the consumer reaches the first slot of a segment whose table entry just changed,
    // nothing may show up there because the controller went around the table instead. Look
    // at the first slot of the table with the toggled cycle to find out.
    fn resolve_pending(&mut self) -> Result<bool> {
        let segment = match self.state {
            EventRingState::Normal => return Ok(false),
            EventRingState::SegmentPending { segment }
            | EventRingState::SegmentRemoving { segment } => segment,
        };
        if self.ring.dequeue() != Cursor::new(segment, 0) {
            return Ok(false);
        }
        let wrapped_cycle = !self.ring.cycle();
        let first = self.ring.trb_addr(Cursor::new(0, 0));
        if self.ring.memory().read_trb_if_owned(first, wrapped_cycle)?.is_none() {
            return Ok(false);
        }
        debug!("{}: controller skipped segment {}", self, segment);
        self.ring.set_consumer(Cursor::new(0, 0), wrapped_cycle)?;
        match self.state {
            EventRingState::SegmentRemoving { segment } => self.finish_removal(segment)?,
            _ => {
                // The filler was written for the previous lap's cycle.
                self.ring.fill_segment(segment)?;
                self.state = EventRingState::Normal;
            }
        }
        Ok(true)
    }

    // Takes one event off the ring if the controller has written it.
    fn fetch(&mut self) -> Result<Option<Trb>> {
        let mut event = self.ring.peek_event()?;
        if event.is_none() && self.resolve_pending()? {
            event = self.ring.peek_event()?;
        }
        let event = match event {
            Some(e) => e,
            None => return Ok(None),
        };
        let from = self.ring.dequeue();
        self.ring.pop_event();
        match self.state {
            EventRingState::SegmentPending { segment } if from.segment == segment => {
                self.state = EventRingState::Normal;
                debug!("{}: controller entered segment {}", self, segment);
            }
            EventRingState::SegmentRemoving { segment }
                if from.segment == segment && self.ring.dequeue().segment != segment =>
            {
                self.finish_removal(segment)?;
            }
            _ => {}
        }
        self.write_dequeue();
        if event.trb_type().is_err() {
            error!("{}: undecodable event {:08x?}", self, event.dwords());
        } else if self.ring.config().debug {
            trace!("{}: {}", self, event);
        }
        Ok(Some(event))
    }

    fn poll<F>(&mut self, timeout: Duration, mut f: F) -> Result<Option<Trb>>
    where
        F: FnMut(&mut Self, Trb) -> Option<Trb>,
    {
        // A timeout past the end of time waits forever.
        let deadline = Instant::now().checked_add(timeout);
        let interval = self.ring.config().poll_interval();
        loop {
            while let Some(event) = self.fetch()? {
                if let Some(found) = f(self, event) {
                    return Ok(Some(found));
                }
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }
            match interval {
                Some(interval) => thread::sleep(interval),
                None => hint::spin_loop(),
            }
        }
    }

    /// Returns the oldest queued event, or the next one the controller writes within `timeout`.
    pub fn get_event(&mut self, timeout: Duration) -> Result<Option<Trb>> {
        if let Some(event) = self.queue.pop_front() {
            return Ok(Some(event));
        }
        self.poll(timeout, |_, event| Some(event))
    }

    /// Returns the first event selected by `selector`, from the local queue or the ring. Other
    /// events read in the meantime stay queued in order.
    pub fn wait_for(&mut self, selector: &EventMatch, timeout: Duration) -> Result<Trb> {
        if let Some(pos) = self.queue.iter().position(|e| selector.matches(e)) {
            if let Some(event) = self.queue.remove(pos) {
                return Ok(event);
            }
        }
        let found = self.poll(timeout, |ring, event| {
            if selector.matches(&event) {
                Some(event)
            } else {
                ring.queue.push_back(event);
                None
            }
        })?;
        found.ok_or_else(|| {
            warn!("{}: timed out waiting for {:?}", self, selector);
            Error::Timeout
        })
    }

    /// Moves every event the controller has written so far to the local queue, without waiting.
    pub fn flush(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some(event) = self.fetch()? {
            self.queue.push_back(event);
            count += 1;
        }
        if count > 0 {
            debug!("{}: flushed {} events", self, count);
        }
        Ok(count)
    }

    /// Disables the interrupter's ring and frees it.
    pub fn teardown(&mut self) {
        self.io.write32(self.layout.erstsz(self.interrupter), 0);
        self.queue.clear();
        self.erst = None;
        self.ring.teardown();
        self.state = EventRingState::Normal;
    }
}
