// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use log::warn;

use super::Error;
use super::EventMatch;
use super::EventRing;
use super::Result;
use super::Ring;
use super::RingKind;
use super::Slot;
use super::SEGMENT_BOUNDARY;
use crate::config::RingConfig;
use crate::memory::DmaBuffer;
use crate::memory::DmaMemory;
use crate::memory::PhysAddr;
use crate::regs::doorbell_value;
use crate::regs::RegisterIo;
use crate::regs::RegisterLayout;
use crate::trb::CompletionCode;
use crate::trb::DataStageTrb;
use crate::trb::EventDataTrb;
use crate::trb::IsochTrb;
use crate::trb::NoOpTrb;
use crate::trb::NormalTrb;
use crate::trb::SetupStageTrb;
use crate::trb::StatusStageTrb;
use crate::trb::TransferEventTrb;
use crate::trb::TransferType;
use crate::trb::Trb;
use crate::trb::TrbType;
use crate::trb::TypedTrb;
use crate::trb::MAX_TD_SIZE;

/// A physically contiguous piece of a transfer buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub addr: PhysAddr,
    pub len: usize,
}

impl Fragment {
    pub fn new(addr: PhysAddr, len: usize) -> Fragment {
        Fragment { addr, len }
    }
}

impl From<&DmaBuffer> for Fragment {
    fn from(buffer: &DmaBuffer) -> Self {
        Fragment::new(buffer.addr(), buffer.len() as usize)
    }
}

/// Isochronous scheduling fields for the first TRB of an isoch TD.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsochOptions {
    pub frame_id: u16,
    pub start_isoch_asap: bool,
    pub transfer_burst_count: u8,
    pub transfer_last_burst_packet_count: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TdOptions {
    pub max_packet_size: u16,
    pub interrupter_target: u16,
    pub interrupt_on_completion: bool,
    pub interrupt_on_short_packet: bool,
    pub block_event_interrupt: bool,
    /// Queue an isoch TD instead of a normal one.
    pub isoch: Option<IsochOptions>,
    /// End the TD with an Event Data TRB carrying this value.
    pub event_data: Option<u64>,
}

impl Default for TdOptions {
    fn default() -> Self {
        TdOptions {
            max_packet_size: 512,
            interrupter_target: 0,
            interrupt_on_completion: true,
            interrupt_on_short_packet: false,
            block_event_interrupt: false,
            isoch: None,
            event_data: None,
        }
    }
}

/// A TD on the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Td {
    pub first: PhysAddr,
    pub last: PhysAddr,
    pub trb_count: usize,
    pub bytes: usize,
}

struct QueuedTd {
    td: Td,
    slots: Vec<Slot>,
    // Control dwords as first published, for truncate_td.
    controls: Vec<u32>,
    event_data: Option<u64>,
    retained: Vec<DmaBuffer>,
}

impl QueuedTd {
    fn contains(&self, addr: PhysAddr) -> bool {
        self.slots.iter().any(|s| s.addr == addr)
    }
}

/// Result of a Transfer Event for this endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferCompletion {
    /// The TRB the event reports on. None for Event Data events.
    pub trb: Option<PhysAddr>,
    pub event_data: Option<u64>,
    pub completion_code: CompletionCode,
    /// Bytes not transferred.
    pub residual: u32,
    pub slot_id: u8,
    pub endpoint_id: u8,
    /// The TD this event finished, if any.
    pub td: Option<Td>,
}

/// The transfer ring of one endpoint, or of one stream of an endpoint.
pub struct TransferRing {
    ring: Ring,
    io: Arc<dyn RegisterIo>,
    layout: RegisterLayout,
    slot_id: u8,
    dci: u8,
    stream_id: u16,
    in_flight: VecDeque<QueuedTd>,
    completed: Vec<DmaBuffer>,
}

impl fmt::Display for TransferRing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "transfer ring {}.{}.{}", self.slot_id, self.dci, self.stream_id)
    }
}

// Splits fragments so that no piece crosses a 64 KiB boundary.
fn split(fragments: &[Fragment]) -> Vec<Fragment> {
    let mut pieces = Vec::new();
    for fragment in fragments {
        let mut addr = fragment.addr.0;
        let mut remaining = fragment.len as u64;
        if remaining == 0 {
            pieces.push(*fragment);
            continue;
        }
        while remaining > 0 {
            let boundary = (addr | (SEGMENT_BOUNDARY - 1)) + 1;
            let len = remaining.min(boundary - addr);
            pieces.push(Fragment::new(PhysAddr(addr), len as usize));
            addr += len;
            remaining -= len;
        }
    }
    if pieces.is_empty() {
        pieces.push(Fragment::new(PhysAddr(0), 0));
    }
    pieces
}

// Packets left in the TD after the current TRB, saturated to the field width.
fn td_size(remaining: usize, max_packet_size: u16) -> u8 {
    let packets = remaining.div_ceil(max_packet_size as usize);
    packets.min(MAX_TD_SIZE as usize) as u8
}

impl TransferRing {
    pub fn new(
        mem: DmaMemory,
        io: Arc<dyn RegisterIo>,
        layout: RegisterLayout,
        slot_id: u8,
        dci: u8,
        stream_id: u16,
        config: RingConfig,
    ) -> TransferRing {
        let name = format!("{}.{}.{}", slot_id, dci, stream_id);
        TransferRing {
            ring: Ring::new(&name, RingKind::Transfer, mem, config),
            io,
            layout,
            slot_id,
            dci,
            stream_id,
            in_flight: VecDeque::new(),
            completed: Vec::new(),
        }
    }

    pub fn init(&mut self, capacity: Option<usize>) -> Result<()> {
        self.ring.init(capacity)
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut Ring {
        &mut self.ring
    }

    pub fn slot_id(&self) -> u8 {
        self.slot_id
    }

    pub fn dci(&self) -> u8 {
        self.dci
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// TDs queued and not yet reported complete, oldest first.
    pub fn pending_tds(&self) -> impl Iterator<Item = &Td> {
        self.in_flight.iter().map(|q| &q.td)
    }

    pub fn ring_doorbell(&self) {
        self.io.write32(
            self.layout.doorbell(self.slot_id),
            doorbell_value(self.dci, self.stream_id),
        );
    }

    // Takes a slot for every TRB up front, then publishes them back to front so the
    // controller cannot start on the TD before all of it is in place.
    fn queue_td(
        &mut self,
        trbs: Vec<Trb>,
        bytes: usize,
        event_data: Option<u64>,
        retained: Vec<DmaBuffer>,
    ) -> Result<Td> {
        if trbs.len() > self.ring.free_slots() {
            warn!(
                "{}: no room for a {} trb TD, {} free",
                self,
                trbs.len(),
                self.ring.free_slots()
            );
            return Err(Error::RingFull);
        }
        let slots = trbs
            .iter()
            .map(|_| self.ring.insert_empty_slot())
            .collect::<Result<Vec<Slot>>>()?;
        for (slot, trb) in slots.iter().zip(&trbs).rev() {
            self.ring.publish(slot, *trb)?;
        }
        let td = Td {
            first: slots[0].addr,
            last: slots[slots.len() - 1].addr,
            trb_count: slots.len(),
            bytes,
        };
        debug!("{}: queued {:?}", self, td);
        self.in_flight.push_back(QueuedTd {
            td,
            controls: trbs.iter().map(Trb::control).collect(),
            slots,
            event_data,
            retained,
        });
        Ok(td)
    }

    // Normal or isoch TRBs for `fragments`, chained, with TD Size hints.
    fn data_trbs(fragments: &[Fragment], options: &TdOptions) -> Result<(Vec<Trb>, usize)> {
        if options.max_packet_size == 0 {
            return Err(Error::BadPacketSize(0));
        }
        let pieces = split(fragments);
        let total: usize = pieces.iter().map(|p| p.len).sum();
        let mut remaining = total;
        let last = pieces.len() - 1;
        let mut trbs = Vec::with_capacity(pieces.len() + 1);
        for (i, piece) in pieces.iter().enumerate() {
            remaining -= piece.len;
            let is_last = i == last;
            let chain = !is_last || options.event_data.is_some();
            let ioc = is_last && options.event_data.is_none() && options.interrupt_on_completion;
            let size = if is_last {
                0
            } else {
                td_size(remaining, options.max_packet_size)
            };
            let trb = match options.isoch {
                Some(isoch) if i == 0 => IsochTrb {
                    data_buffer: piece.addr.0,
                    transfer_length: piece.len as u32,
                    td_size: size,
                    interrupter_target: options.interrupter_target,
                    interrupt_on_short_packet: options.interrupt_on_short_packet,
                    chain,
                    interrupt_on_completion: ioc,
                    transfer_burst_count: isoch.transfer_burst_count,
                    block_event_interrupt: options.block_event_interrupt,
                    transfer_last_burst_packet_count: isoch.transfer_last_burst_packet_count,
                    frame_id: isoch.frame_id,
                    start_isoch_asap: isoch.start_isoch_asap,
                    ..Default::default()
                }
                .to_trb(),
                _ => NormalTrb {
                    data_buffer: piece.addr.0,
                    transfer_length: piece.len as u32,
                    td_size: size,
                    interrupter_target: options.interrupter_target,
                    interrupt_on_short_packet: options.interrupt_on_short_packet,
                    chain,
                    interrupt_on_completion: ioc,
                    block_event_interrupt: options.block_event_interrupt,
                    ..Default::default()
                }
                .to_trb(),
            };
            trbs.push(trb);
        }
        if let Some(event_data) = options.event_data {
            trbs.push(
                EventDataTrb {
                    event_data,
                    interrupter_target: options.interrupter_target,
                    interrupt_on_completion: options.interrupt_on_completion,
                    block_event_interrupt: options.block_event_interrupt,
                    ..Default::default()
                }
                .to_trb(),
            );
        }
        Ok((trbs, total))
    }

    /// Queues one TD covering `fragments`. Pieces crossing a 64 KiB boundary take two TRBs.
    /// Nothing is queued unless the whole TD fits.
    pub fn insert_td(&mut self, fragments: &[Fragment], options: &TdOptions) -> Result<Td> {
        let (trbs, bytes) = Self::data_trbs(fragments, options)?;
        self.queue_td(trbs, bytes, options.event_data, Vec::new())
    }

    /// Like `insert_td`, and the ring keeps `buffers` until the TD completes. Collect them with
    /// `take_retained`.
    pub fn insert_td_retained(
        &mut self,
        buffers: Vec<DmaBuffer>,
        options: &TdOptions,
    ) -> Result<Td> {
        let fragments: Vec<Fragment> = buffers.iter().map(Fragment::from).collect();
        let (trbs, bytes) = Self::data_trbs(&fragments, options)?;
        self.queue_td(trbs, bytes, options.event_data, buffers)
    }

    pub fn insert_setup(&mut self, setup: &SetupStageTrb) -> Result<PhysAddr> {
        let td = self.queue_td(vec![setup.to_trb()], 0, None, Vec::new())?;
        Ok(td.first)
    }

    fn data_stage_trbs(
        buffer: Fragment,
        direction_in: bool,
        max_packet_size: u16,
    ) -> Result<Vec<Trb>> {
        let options = TdOptions {
            max_packet_size,
            interrupt_on_completion: false,
            interrupt_on_short_packet: direction_in,
            ..Default::default()
        };
        let (mut trbs, _) = Self::data_trbs(&[buffer], &options)?;
        // A Data Stage TRB leads, any further pieces follow as Normal TRBs.
        let first = trbs[0].parse::<NormalTrb>().map_err(Error::Trb)?;
        trbs[0] = DataStageTrb {
            data_buffer: first.data_buffer,
            transfer_length: first.transfer_length,
            td_size: first.td_size,
            interrupt_on_short_packet: first.interrupt_on_short_packet,
            chain: first.chain,
            direction_in,
            ..Default::default()
        }
        .to_trb();
        Ok(trbs)
    }

    pub fn insert_data_stage(
        &mut self,
        buffer: Fragment,
        direction_in: bool,
        max_packet_size: u16,
    ) -> Result<Td> {
        let trbs = Self::data_stage_trbs(buffer, direction_in, max_packet_size)?;
        self.queue_td(trbs, buffer.len, None, Vec::new())
    }

    pub fn insert_status_stage(
        &mut self,
        direction_in: bool,
        interrupt_on_completion: bool,
    ) -> Result<PhysAddr> {
        let trb = StatusStageTrb {
            direction_in,
            interrupt_on_completion,
            ..Default::default()
        }
        .to_trb();
        Ok(self.queue_td(vec![trb], 0, None, Vec::new())?.first)
    }

    /// Queues a whole control transfer as one TD: setup, optional data, status. The transfer
    /// type and the stage directions follow bit 7 of `bmRequestType`.
    pub fn insert_control_transfer(
        &mut self,
        setup: SetupStageTrb,
        data: Option<Fragment>,
        max_packet_size: u16,
    ) -> Result<Td> {
        let direction_in = setup.request_type & 0x80 != 0;
        let transfer_type = match (data, direction_in) {
            (None, _) => TransferType::NoData,
            (Some(_), true) => TransferType::InData,
            (Some(_), false) => TransferType::OutData,
        };
        let mut trbs = vec![SetupStageTrb {
            transfer_type,
            interrupt_on_completion: false,
            ..setup
        }
        .to_trb()];
        let mut bytes = 0;
        if let Some(buffer) = data {
            trbs.extend(Self::data_stage_trbs(buffer, direction_in, max_packet_size)?);
            bytes = buffer.len;
        }
        // The status stage runs opposite to the data stage, IN when there is none.
        let status_in = data.is_none() || !direction_in;
        trbs.push(
            StatusStageTrb {
                direction_in: status_in,
                interrupt_on_completion: true,
                ..Default::default()
            }
            .to_trb(),
        );
        self.queue_td(trbs, bytes, None, Vec::new())
    }

    pub fn insert_noop(&mut self, interrupt_on_completion: bool) -> Result<PhysAddr> {
        let trb = NoOpTrb {
            interrupt_on_completion,
            ..Default::default()
        }
        .to_trb();
        Ok(self.queue_td(vec![trb], 0, None, Vec::new())?.first)
    }

    pub fn insert_event_data(&mut self, event_data: u64) -> Result<PhysAddr> {
        let trb = EventDataTrb {
            event_data,
            interrupt_on_completion: true,
            ..Default::default()
        }
        .to_trb();
        Ok(self.queue_td(vec![trb], 0, Some(event_data), Vec::new())?.first)
    }

    /// Cuts the last queued TD down to its first `keep` TRBs: TRB `keep` loses its chain flag
    /// and gains Interrupt On Completion. The rest stay in memory. `keep == 0` restores the TD
    /// as queued. Only meaningful before the controller reaches the TD.
    pub fn truncate_td(&mut self, keep: usize) -> Result<()> {
        let queued = self.in_flight.back().ok_or(Error::NoTd)?;
        let len = queued.slots.len();
        if keep > len {
            return Err(Error::TruncateOutOfRange { keep, len });
        }
        for (slot, control) in queued.slots.iter().zip(&queued.controls) {
            let mut original = Trb::default();
            original.set_control(*control);
            let chain = original.chain();
            self.ring.modify(slot.addr, |trb| trb.set_control(*control))?;
            if let Some(link) = slot.link {
                self.ring.modify(link, |trb| {
                    trb.set_chain(chain);
                })?;
            }
        }
        if keep > 0 {
            let slot = queued.slots[keep - 1];
            self.ring.modify(slot.addr, |trb| {
                trb.set_chain(false);
                trb.set_interrupt_on_completion(true);
            })?;
            if let Some(link) = slot.link {
                self.ring.modify(link, |trb| {
                    trb.set_chain(false);
                })?;
            }
        }
        debug!("{}: last TD truncated to {} of {} trbs", self, keep, len);
        Ok(())
    }

    // Finishes TDs up to and including `index` and moves dequeue past them.
    fn retire(&mut self, index: usize) -> Result<Td> {
        let mut td = None;
        for _ in 0..=index {
            if let Some(queued) = self.in_flight.pop_front() {
                self.completed.extend(queued.retained);
                td = Some(queued.td);
            }
        }
        let td = td.ok_or(Error::NoTd)?;
        self.ring.advance_dequeue(td.last, true)?;
        Ok(td)
    }

    /// Waits for the next Transfer Event of this endpoint. A TD is retired when the event
    /// reports on its last TRB or its Event Data TRB, or ends it with an error.
    pub fn wait_for_transfer(
        &mut self,
        events: &mut EventRing,
        timeout: Option<Duration>,
    ) -> Result<TransferCompletion> {
        let timeout = timeout.unwrap_or_else(|| self.ring.config().transfer_timeout());
        let selector = EventMatch::Type {
            trb_type: TrbType::TransferEvent,
            slot_id: Some(self.slot_id),
            endpoint_id: Some(self.dci),
        };
        let event = events
            .wait_for(&selector, timeout)?
            .parse::<TransferEventTrb>()
            .map_err(Error::Trb)?;
        let code = event.completion_code;
        let (trb, event_data, index) = if event.event_data {
            let index = self
                .in_flight
                .iter()
                .position(|q| q.event_data == Some(event.trb_pointer));
            (None, Some(event.trb_pointer), index)
        } else {
            let addr = PhysAddr(event.trb_pointer);
            let index = self.in_flight.iter().position(|q| {
                q.contains(addr)
                    && (q.td.last == addr || !(code.is_success() || code.is_short_packet()))
            });
            (Some(addr), None, index)
        };
        let td = match index {
            Some(index) => Some(self.retire(index)?),
            None => None,
        };
        if code.is_error() {
            warn!("{}: transfer failed with {:?}", self, code);
        }
        Ok(TransferCompletion {
            trb,
            event_data,
            completion_code: code,
            residual: event.transfer_length,
            slot_id: event.slot_id,
            endpoint_id: event.endpoint_id,
            td,
        })
    }

    /// Buffers of completed TDs, each handed out once.
    pub fn take_retained(&mut self) -> Vec<DmaBuffer> {
        std::mem::take(&mut self.completed)
    }

    /// Abandons every pending TD and returns the dequeue pointer and cycle state to program
    /// with Set TR Dequeue Pointer so the controller resumes at the enqueue pointer.
    pub fn dequeue_for_reset(&mut self) -> (PhysAddr, bool) {
        for queued in self.in_flight.drain(..) {
            self.completed.extend(queued.retained);
        }
        self.ring.reset_dequeue();
        (self.ring.enqueue_addr(), self.ring.cycle())
    }

    /// Software's dequeue pointer and the cycle state the controller expects there.
    pub fn dequeue_state(&self) -> (PhysAddr, bool) {
        let dequeue = self.ring.dequeue();
        (self.ring.trb_addr(dequeue), self.ring.cycle_at(dequeue))
    }
}
