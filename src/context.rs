// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device, endpoint, input and stream contexts, and the Device Context Base Address Array that
//! tells the controller where each slot's output context lives.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use enumn::N;
use log::debug;
use log::warn;
use remain::sorted;
use thiserror::Error;

use crate::bits;
use crate::config::RingConfig;
use crate::memory;
use crate::memory::DmaBuffer;
use crate::memory::DmaMemory;
use crate::memory::PhysAddr;
use crate::regs::Capabilities;
use crate::regs::RegisterIo;
use crate::regs::RegisterLayout;
use crate::ring::TransferRing;

/// Highest endpoint number; DCI 31 is endpoint 15 IN.
pub const MAX_ENDPOINT_NUMBER: u8 = 15;
pub const MAX_DCI: u8 = 31;
pub const STREAM_CONTEXT_SIZE: usize = 16;

const CONTEXT_ALIGNMENT: u64 = 64;
const PAGE_SIZE: u64 = 4096;
// Contexts in a device context: the slot context and 31 endpoints.
const DEVICE_CONTEXT_ENTRIES: usize = 32;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("device context index {0} is out of range")]
    BadDeviceContextIndex(u8),
    #[error("endpoint number {0} is out of range")]
    BadEndpointNumber(u8),
    #[error("slot id {0} is out of range")]
    BadSlotId(u8),
    #[error("stream context array of {0} entries is not supported")]
    BadStreamArraySize(usize),
    #[error("stream context type {0} is not valid here")]
    BadStreamContextType(u8),
    #[error("stream id {0} does not resolve to a stream context")]
    BadStreamId(u16),
    #[error("endpoint context holds reserved state {0}")]
    InvalidEndpointState(u8),
    #[error("slot context holds reserved state {0}")]
    InvalidSlotState(u8),
    #[error("linear stream context arrays have no secondary arrays")]
    LinearStreamArray,
    #[error("dma memory error: {0}")]
    Memory(memory::Error),
    #[error("{ring} does not belong to slot {slot_id} dci {dci}")]
    RingMismatch { ring: String, slot_id: u8, dci: u8 },
    #[error("primary entry {0} already has a secondary array")]
    SecondaryInUse(usize),
    #[error("slot {0} is already enabled")]
    SlotInUse(u8),
    #[error("slot {0} is not enabled")]
    SlotNotEnabled(u8),
    #[error("{0:?} endpoints cannot have streams")]
    StreamsUnsupported(EndpointType),
}

impl From<memory::Error> for Error {
    fn from(e: memory::Error) -> Self {
        Error::Memory(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// xHCI 6.2.2 table 6-7.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
#[repr(u8)]
pub enum SlotState {
    /// Enabled and disabled share the encoding.
    #[default]
    DisabledOrEnabled = 0,
    Default = 1,
    Addressed = 2,
    Configured = 3,
}

/// xHCI 6.2.3 table 6-8.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
#[repr(u8)]
pub enum EndpointState {
    #[default]
    Disabled = 0,
    Running = 1,
    Halted = 2,
    Stopped = 3,
    Error = 4,
}

/// xHCI 6.2.3 table 6-9.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
#[repr(u8)]
pub enum EndpointType {
    #[default]
    NotValid = 0,
    IsochOut = 1,
    BulkOut = 2,
    InterruptOut = 3,
    Control = 4,
    IsochIn = 5,
    BulkIn = 6,
    InterruptIn = 7,
}

impl EndpointType {
    pub fn is_bulk(self) -> bool {
        matches!(self, EndpointType::BulkOut | EndpointType::BulkIn)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// Index of an endpoint's context within a device context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceContextIndex(u8);

impl DeviceContextIndex {
    pub fn new(dci: u8) -> Result<DeviceContextIndex> {
        if dci > MAX_DCI {
            return Err(Error::BadDeviceContextIndex(dci));
        }
        Ok(DeviceContextIndex(dci))
    }

    /// `2 * endpoint + 1` for IN, `2 * endpoint` for OUT. Endpoint 0 is bidirectional and has a
    /// single context; `is_host_mode_ep0` selects index 0 for it, otherwise 1.
    ///
    /// Index 0 names the Slot Context, not an endpoint context. `ContextStore` endpoint
    /// accessors such as `init_endpoint` and `bind_transfer_ring` reject it with
    /// `BadDeviceContextIndex(0)`; pass `is_host_mode_ep0 = false` to address the default
    /// control endpoint's context at index 1.
    pub fn from_endpoint(
        endpoint: u8,
        direction: Direction,
        is_host_mode_ep0: bool,
    ) -> Result<DeviceContextIndex> {
        if endpoint > MAX_ENDPOINT_NUMBER {
            return Err(Error::BadEndpointNumber(endpoint));
        }
        if endpoint == 0 {
            return Ok(DeviceContextIndex(if is_host_mode_ep0 { 0 } else { 1 }));
        }
        let dci = 2 * endpoint + u8::from(direction == Direction::In);
        Ok(DeviceContextIndex(dci))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn endpoint_number(self) -> u8 {
        self.0 / 2
    }

    pub fn direction(self) -> Direction {
        if self.0 % 2 == 1 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for DeviceContextIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dci {}", self.0)
    }
}

/// Slot Context, xHCI 6.2.2.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotContext {
    /// 20 bits.
    pub route_string: u32,
    pub speed: u8,
    pub multi_tt: bool,
    pub hub: bool,
    /// Index of the last valid endpoint context.
    pub context_entries: u8,
    pub max_exit_latency: u16,
    pub root_hub_port_number: u8,
    pub number_of_ports: u8,
    pub tt_hub_slot_id: u8,
    pub tt_port_number: u8,
    pub tt_think_time: u8,
    pub interrupter_target: u16,
    pub usb_device_address: u8,
    pub slot_state: SlotState,
}

impl SlotContext {
    pub fn encode(&self) -> [u32; 8] {
        let mut dw = [0u32; 8];
        dw[0] = bits::set(dw[0], 0, 20, self.route_string);
        dw[0] = bits::set(dw[0], 20, 4, self.speed as u32);
        dw[0] = bits::set_bit(dw[0], 25, self.multi_tt);
        dw[0] = bits::set_bit(dw[0], 26, self.hub);
        dw[0] = bits::set(dw[0], 27, 5, self.context_entries as u32);
        dw[1] = bits::set(dw[1], 0, 16, self.max_exit_latency as u32);
        dw[1] = bits::set(dw[1], 16, 8, self.root_hub_port_number as u32);
        dw[1] = bits::set(dw[1], 24, 8, self.number_of_ports as u32);
        dw[2] = bits::set(dw[2], 0, 8, self.tt_hub_slot_id as u32);
        dw[2] = bits::set(dw[2], 8, 8, self.tt_port_number as u32);
        dw[2] = bits::set(dw[2], 16, 2, self.tt_think_time as u32);
        dw[2] = bits::set(dw[2], 22, 10, self.interrupter_target as u32);
        dw[3] = bits::set(dw[3], 0, 8, self.usb_device_address as u32);
        dw[3] = bits::set(dw[3], 27, 5, self.slot_state as u32);
        dw
    }

    pub fn decode(dw: &[u32; 8]) -> Result<SlotContext> {
        let raw_state = bits::get(dw[3], 27, 5) as u8;
        Ok(SlotContext {
            route_string: bits::get(dw[0], 0, 20),
            speed: bits::get(dw[0], 20, 4) as u8,
            multi_tt: bits::get_bit(dw[0], 25),
            hub: bits::get_bit(dw[0], 26),
            context_entries: bits::get(dw[0], 27, 5) as u8,
            max_exit_latency: bits::get(dw[1], 0, 16) as u16,
            root_hub_port_number: bits::get(dw[1], 16, 8) as u8,
            number_of_ports: bits::get(dw[1], 24, 8) as u8,
            tt_hub_slot_id: bits::get(dw[2], 0, 8) as u8,
            tt_port_number: bits::get(dw[2], 8, 8) as u8,
            tt_think_time: bits::get(dw[2], 16, 2) as u8,
            interrupter_target: bits::get(dw[2], 22, 10) as u16,
            usb_device_address: bits::get(dw[3], 0, 8) as u8,
            slot_state: SlotState::n(raw_state).ok_or(Error::InvalidSlotState(raw_state))?,
        })
    }
}

/// Endpoint Context, xHCI 6.2.3.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointContext {
    pub state: EndpointState,
    pub mult: u8,
    /// Primary stream array holds `2^(max_primary_streams + 1)` entries; 0 means no streams.
    pub max_primary_streams: u8,
    pub linear_stream_array: bool,
    pub interval: u8,
    /// 24 bits, split between dword 0 and dword 4.
    pub max_esit_payload: u32,
    pub error_count: u8,
    pub endpoint_type: EndpointType,
    pub host_initiate_disable: bool,
    pub max_burst_size: u8,
    pub max_packet_size: u16,
    pub dequeue_cycle_state: bool,
    /// Transfer ring dequeue pointer, or the stream context array when streams are enabled.
    pub tr_dequeue_pointer: u64,
    pub average_trb_length: u16,
}

impl EndpointContext {
    pub fn encode(&self) -> [u32; 8] {
        let mut dw = [0u32; 8];
        dw[0] = bits::set(dw[0], 0, 3, self.state as u32);
        dw[0] = bits::set(dw[0], 8, 2, self.mult as u32);
        dw[0] = bits::set(dw[0], 10, 5, self.max_primary_streams as u32);
        dw[0] = bits::set_bit(dw[0], 15, self.linear_stream_array);
        dw[0] = bits::set(dw[0], 16, 8, self.interval as u32);
        dw[0] = bits::set(dw[0], 24, 8, self.max_esit_payload >> 16);
        dw[1] = bits::set(dw[1], 1, 2, self.error_count as u32);
        dw[1] = bits::set(dw[1], 3, 3, self.endpoint_type as u32);
        dw[1] = bits::set_bit(dw[1], 7, self.host_initiate_disable);
        dw[1] = bits::set(dw[1], 8, 8, self.max_burst_size as u32);
        dw[1] = bits::set(dw[1], 16, 16, self.max_packet_size as u32);
        dw[2] = (bits::lo32(self.tr_dequeue_pointer) & !0xf) | self.dequeue_cycle_state as u32;
        dw[3] = bits::hi32(self.tr_dequeue_pointer);
        dw[4] = bits::set(dw[4], 0, 16, self.average_trb_length as u32);
        dw[4] = bits::set(dw[4], 16, 16, self.max_esit_payload & 0xffff);
        dw
    }

    pub fn decode(dw: &[u32; 8]) -> Result<EndpointContext> {
        let raw_state = bits::get(dw[0], 0, 3) as u8;
        let raw_type = bits::get(dw[1], 3, 3) as u8;
        Ok(EndpointContext {
            state: EndpointState::n(raw_state).ok_or(Error::InvalidEndpointState(raw_state))?,
            mult: bits::get(dw[0], 8, 2) as u8,
            max_primary_streams: bits::get(dw[0], 10, 5) as u8,
            linear_stream_array: bits::get_bit(dw[0], 15),
            interval: bits::get(dw[0], 16, 8) as u8,
            max_esit_payload: bits::get(dw[0], 24, 8) << 16 | bits::get(dw[4], 16, 16),
            error_count: bits::get(dw[1], 1, 2) as u8,
            // Three bits always decode.
            endpoint_type: EndpointType::n(raw_type).unwrap_or_default(),
            host_initiate_disable: bits::get_bit(dw[1], 7),
            max_burst_size: bits::get(dw[1], 8, 8) as u8,
            max_packet_size: bits::get(dw[1], 16, 16) as u16,
            dequeue_cycle_state: bits::get_bit(dw[2], 0),
            tr_dequeue_pointer: bits::join64(dw[2] & !0xf, dw[3]),
            average_trb_length: bits::get(dw[4], 0, 16) as u16,
        })
    }
}

/// Input Control Context, xHCI 6.2.5.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputControlContext {
    pub drop_context_flags: u32,
    pub add_context_flags: u32,
    pub configuration_value: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
}

impl InputControlContext {
    pub fn drop_context_flag(&self, index: u8) -> bool {
        bits::get_bit(self.drop_context_flags, index as u32)
    }

    pub fn add_context_flag(&self, index: u8) -> bool {
        bits::get_bit(self.add_context_flags, index as u32)
    }

    pub fn set_drop_context_flag(&mut self, index: u8, on: bool) {
        self.drop_context_flags = bits::set_bit(self.drop_context_flags, index as u32, on);
    }

    pub fn set_add_context_flag(&mut self, index: u8, on: bool) {
        self.add_context_flags = bits::set_bit(self.add_context_flags, index as u32, on);
    }

    pub fn encode(&self) -> [u32; 8] {
        let mut dw = [0u32; 8];
        dw[0] = self.drop_context_flags;
        dw[1] = self.add_context_flags;
        dw[7] = bits::set(dw[7], 0, 8, self.configuration_value as u32);
        dw[7] = bits::set(dw[7], 8, 8, self.interface_number as u32);
        dw[7] = bits::set(dw[7], 16, 8, self.alternate_setting as u32);
        dw
    }

    pub fn decode(dw: &[u32; 8]) -> InputControlContext {
        InputControlContext {
            drop_context_flags: dw[0],
            add_context_flags: dw[1],
            configuration_value: bits::get(dw[7], 0, 8) as u8,
            interface_number: bits::get(dw[7], 8, 8) as u8,
            alternate_setting: bits::get(dw[7], 16, 8) as u8,
        }
    }
}

/// What a stream context entry points at, xHCI 6.2.4.1 table 6-13.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamContextType {
    #[default]
    SecondaryRing,
    PrimaryRing,
    /// A secondary stream array of `2^(n + 3)` entries, n in 0..=5.
    SecondaryArray(u8),
}

impl StreamContextType {
    fn raw(self) -> u8 {
        match self {
            StreamContextType::SecondaryRing => 0,
            StreamContextType::PrimaryRing => 1,
            StreamContextType::SecondaryArray(n) => n + 2,
        }
    }

    fn from_raw(raw: u8) -> StreamContextType {
        match raw & 0x7 {
            0 => StreamContextType::SecondaryRing,
            1 => StreamContextType::PrimaryRing,
            n => StreamContextType::SecondaryArray(n - 2),
        }
    }
}

/// Stream Context, xHCI 6.2.4.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamContext {
    pub dequeue_cycle_state: bool,
    pub context_type: StreamContextType,
    pub tr_dequeue_pointer: u64,
    /// Stopped EDTLA, 24 bits.
    pub stopped_edtla: u32,
}

impl StreamContext {
    pub fn encode(&self) -> [u32; 4] {
        let mut dw = [0u32; 4];
        dw[0] = bits::lo32(self.tr_dequeue_pointer) & !0xf;
        dw[0] = bits::set_bit(dw[0], 0, self.dequeue_cycle_state);
        dw[0] = bits::set(dw[0], 1, 3, self.context_type.raw() as u32);
        dw[1] = bits::hi32(self.tr_dequeue_pointer);
        dw[2] = bits::set(dw[2], 0, 24, self.stopped_edtla);
        dw
    }

    pub fn decode(dw: &[u32; 4]) -> StreamContext {
        StreamContext {
            dequeue_cycle_state: bits::get_bit(dw[0], 0),
            context_type: StreamContextType::from_raw(bits::get(dw[0], 1, 3) as u8),
            tr_dequeue_pointer: bits::join64(dw[0] & !0xf, dw[1]),
            stopped_edtla: bits::get(dw[2], 0, 24),
        }
    }
}

/// The output device context as the controller last wrote it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceContext {
    pub slot: SlotContext,
    /// Endpoint contexts for DCI 1 to 31.
    pub endpoints: Vec<EndpointContext>,
}

impl DeviceContext {
    pub fn endpoint(&self, dci: DeviceContextIndex) -> Option<&EndpointContext> {
        (dci.0 as usize).checked_sub(1).and_then(|i| self.endpoints.get(i))
    }
}

/// Fields for `ContextStore::init_endpoint`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub endpoint_type: EndpointType,
    pub state: EndpointState,
    pub max_packet_size: u16,
    pub max_burst_size: u8,
    pub interval: u8,
    pub mult: u8,
    pub error_count: u8,
    pub average_trb_length: u16,
    pub max_esit_payload: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            endpoint_type: EndpointType::Control,
            state: EndpointState::Disabled,
            max_packet_size: 64,
            max_burst_size: 0,
            interval: 0,
            mult: 0,
            error_count: 3,
            average_trb_length: 8,
            max_esit_payload: 0,
        }
    }
}

fn check_stream_array_size(size: usize, min: usize, max: usize) -> Result<()> {
    if !size.is_power_of_two() || size < min || size > max {
        return Err(Error::BadStreamArraySize(size));
    }
    Ok(())
}

fn entry_addr(base: PhysAddr, index: usize, size: usize) -> Result<PhysAddr> {
    base.checked_add((index * size) as u64)
        .ok_or(Error::Memory(memory::Error::InvalidAccess { addr: base, len: size }))
}

/// Maps stream ids to stream contexts for one endpoint. A linear array holds one context per
/// stream. A hybrid array lets primary entries point at secondary arrays; the low bits of the
/// stream id select the primary entry and the next bits the secondary entry.
pub struct StreamContextArray {
    mem: DmaMemory,
    primary: DmaBuffer,
    size: usize,
    linear: bool,
    secondary: BTreeMap<usize, (DmaBuffer, usize)>,
}

impl StreamContextArray {
    /// Primary arrays hold 4 to 65536 entries.
    pub const MIN_PRIMARY: usize = 4;
    pub const MAX_PRIMARY: usize = 1 << 16;
    /// Secondary arrays hold 8 to 256 entries.
    pub const MIN_SECONDARY: usize = 8;
    pub const MAX_SECONDARY: usize = 256;

    fn new(mem: &DmaMemory, size: usize, linear: bool) -> Result<StreamContextArray> {
        check_stream_array_size(size, Self::MIN_PRIMARY, Self::MAX_PRIMARY)?;
        let primary = mem.allocate(
            (size * STREAM_CONTEXT_SIZE) as u64,
            CONTEXT_ALIGNMENT,
            Some(PAGE_SIZE.max((size * STREAM_CONTEXT_SIZE) as u64)),
        )?;
        debug!(
            "{} stream context array of {} entries at {}",
            if linear { "linear" } else { "hybrid" },
            size,
            primary.addr()
        );
        Ok(StreamContextArray {
            mem: mem.clone(),
            primary,
            size,
            linear,
            secondary: BTreeMap::new(),
        })
    }

    pub fn new_linear(mem: &DmaMemory, size: usize) -> Result<StreamContextArray> {
        Self::new(mem, size, true)
    }

    pub fn new_hybrid(mem: &DmaMemory, size: usize) -> Result<StreamContextArray> {
        Self::new(mem, size, false)
    }

    pub fn addr(&self) -> PhysAddr {
        self.primary.addr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_linear(&self) -> bool {
        self.linear
    }

    /// The Max Primary Streams value describing this array.
    pub fn max_primary_streams(&self) -> u8 {
        (self.size.trailing_zeros() - 1) as u8
    }

    /// Creates a secondary array of `size` entries behind primary entry `primary_index`.
    pub fn setup_secondary(&mut self, primary_index: usize, size: usize) -> Result<PhysAddr> {
        if self.linear {
            return Err(Error::LinearStreamArray);
        }
        if primary_index == 0 || primary_index >= self.size {
            return Err(Error::BadStreamId(primary_index as u16));
        }
        if self.secondary.contains_key(&primary_index) {
            return Err(Error::SecondaryInUse(primary_index));
        }
        check_stream_array_size(size, Self::MIN_SECONDARY, Self::MAX_SECONDARY)?;
        let buffer = self.mem.allocate(
            (size * STREAM_CONTEXT_SIZE) as u64,
            CONTEXT_ALIGNMENT,
            Some(PAGE_SIZE),
        )?;
        let addr = buffer.addr();
        let entry = StreamContext {
            context_type: StreamContextType::SecondaryArray((size.trailing_zeros() - 3) as u8),
            tr_dequeue_pointer: addr.0,
            ..Default::default()
        };
        self.write_entry(entry_addr(self.addr(), primary_index, STREAM_CONTEXT_SIZE)?, &entry)?;
        self.secondary.insert(primary_index, (buffer, size));
        debug!(
            "secondary stream array of {} entries at {} behind primary entry {}",
            size, addr, primary_index
        );
        Ok(addr)
    }

    /// Address of the stream context for `stream_id` and the type that entry must carry.
    pub fn resolve(&self, stream_id: u16) -> Result<(PhysAddr, StreamContextType)> {
        let id = stream_id as usize;
        if id == 0 {
            return Err(Error::BadStreamId(stream_id));
        }
        if self.linear {
            if id >= self.size {
                return Err(Error::BadStreamId(stream_id));
            }
            let addr = entry_addr(self.addr(), id, STREAM_CONTEXT_SIZE)?;
            return Ok((addr, StreamContextType::PrimaryRing));
        }
        let primary_index = id & (self.size - 1);
        let secondary_id = id >> self.size.trailing_zeros();
        match self.secondary.get(&primary_index) {
            Some((buffer, size)) => {
                if secondary_id >= *size || (secondary_id == 0 && primary_index == 0) {
                    return Err(Error::BadStreamId(stream_id));
                }
                let addr = entry_addr(buffer.addr(), secondary_id, STREAM_CONTEXT_SIZE)?;
                Ok((addr, StreamContextType::SecondaryRing))
            }
            None if secondary_id == 0 && primary_index != 0 => {
                let addr = entry_addr(self.addr(), primary_index, STREAM_CONTEXT_SIZE)?;
                Ok((addr, StreamContextType::PrimaryRing))
            }
            None => Err(Error::BadStreamId(stream_id)),
        }
    }

    pub fn stream_context(&self, stream_id: u16) -> Result<StreamContext> {
        let (addr, _) = self.resolve(stream_id)?;
        let dw: [u32; 4] = self.mem.read_obj_from_addr(addr)?;
        Ok(StreamContext::decode(&dw))
    }

    /// Points stream `stream_id` at `dequeue` with consumer cycle state `cycle`.
    pub fn set_stream_ring(&self, stream_id: u16, dequeue: PhysAddr, cycle: bool) -> Result<()> {
        let (addr, context_type) = self.resolve(stream_id)?;
        let entry = StreamContext {
            dequeue_cycle_state: cycle,
            context_type,
            tr_dequeue_pointer: dequeue.0,
            stopped_edtla: 0,
        };
        self.write_entry(addr, &entry)
    }

    /// Binds a stream transfer ring to the entry for its stream id.
    pub fn bind_stream_ring(&self, ring: &TransferRing) -> Result<()> {
        let (dequeue, cycle) = ring.dequeue_state();
        self.set_stream_ring(ring.stream_id(), dequeue, cycle)
    }

    fn write_entry(&self, addr: PhysAddr, entry: &StreamContext) -> Result<()> {
        self.mem.write_obj_at_addr(entry.encode(), addr)?;
        Ok(())
    }
}

// One enabled device slot: software copies of its contexts plus the input and output buffers.
struct DeviceSlot {
    input: DmaBuffer,
    output: DmaBuffer,
    input_control: InputControlContext,
    slot: SlotContext,
    endpoints: [EndpointContext; MAX_DCI as usize],
    streams: BTreeMap<u8, StreamContextArray>,
}

/// Owns the DCBAA and every enabled slot's device contexts.
pub struct ContextStore {
    mem: DmaMemory,
    config: RingConfig,
    context_size: usize,
    max_slots: u8,
    dcbaa: DmaBuffer,
    // Scratchpad buffer array followed by its pages.
    scratchpad: Vec<DmaBuffer>,
    slots: Vec<Option<DeviceSlot>>,
}

impl ContextStore {
    /// Allocates the DCBAA and the scratchpad buffers `caps` asks for, then programs DCBAAP and
    /// CONFIG.MaxSlotsEn.
    pub fn new(
        mem: DmaMemory,
        io: Arc<dyn RegisterIo>,
        layout: RegisterLayout,
        caps: &Capabilities,
        config: RingConfig,
    ) -> Result<ContextStore> {
        let max_slots = caps.max_slots;
        let dcbaa = mem.allocate(
            (max_slots as u64 + 1) * 8,
            CONTEXT_ALIGNMENT,
            Some(PAGE_SIZE),
        )?;
        let mut scratchpad = Vec::new();
        if caps.max_scratchpad_buffers > 0 {
            let count = caps.max_scratchpad_buffers as usize;
            let array = mem.allocate((count * 8) as u64, CONTEXT_ALIGNMENT, Some(PAGE_SIZE))?;
            for i in 0..count {
                let page = mem.allocate(PAGE_SIZE, PAGE_SIZE, None)?;
                mem.write_u64(page.addr().0, entry_addr(array.addr(), i, 8)?)?;
                scratchpad.push(page);
            }
            mem.write_u64(array.addr().0, dcbaa.addr())?;
            scratchpad.insert(0, array);
        }
        io.write64(layout.dcbaap(), dcbaa.addr().0);
        let config_reg = io.read32(layout.config());
        io.write32(layout.config(), bits::set(config_reg, 0, 8, max_slots as u32));
        debug!(
            "dcbaa at {} for {} slots, {} scratchpad buffers",
            dcbaa.addr(),
            max_slots,
            caps.max_scratchpad_buffers
        );
        Ok(ContextStore {
            mem,
            config,
            context_size: caps.context_size(),
            max_slots,
            dcbaa,
            scratchpad,
            slots: (0..max_slots).map(|_| None).collect(),
        })
    }

    pub fn dcbaa_address(&self) -> PhysAddr {
        self.dcbaa.addr()
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn max_slots(&self) -> u8 {
        self.max_slots
    }

    pub fn scratchpad_buffers(&self) -> usize {
        self.scratchpad.len().saturating_sub(1)
    }

    fn check_slot_id(&self, slot_id: u8) -> Result<usize> {
        if slot_id == 0 || slot_id > self.max_slots {
            warn!("slot id {} out of range 1..={}", slot_id, self.max_slots);
            return Err(Error::BadSlotId(slot_id));
        }
        Ok(slot_id as usize - 1)
    }

    fn slot(&self, slot_id: u8) -> Result<&DeviceSlot> {
        let index = self.check_slot_id(slot_id)?;
        self.slots[index]
            .as_ref()
            .ok_or(Error::SlotNotEnabled(slot_id))
    }

    fn slot_mut(&mut self, slot_id: u8) -> Result<&mut DeviceSlot> {
        let index = self.check_slot_id(slot_id)?;
        self.slots[index]
            .as_mut()
            .ok_or(Error::SlotNotEnabled(slot_id))
    }

    // Endpoint contexts are stored from DCI 1.
    fn endpoint_index(dci: DeviceContextIndex) -> Result<usize> {
        match dci.0 {
            0 => Err(Error::BadDeviceContextIndex(0)),
            n => Ok(n as usize - 1),
        }
    }

    fn dcbaa_entry(&self, slot_id: u8) -> Result<PhysAddr> {
        entry_addr(self.dcbaa.addr(), slot_id as usize, 8)
    }

    /// Allocates input and output contexts for `slot_id`, as returned by Enable Slot, and
    /// enters the output context in the DCBAA.
    pub fn enable_slot(&mut self, slot_id: u8) -> Result<()> {
        let index = self.check_slot_id(slot_id)?;
        if self.slots[index].is_some() {
            return Err(Error::SlotInUse(slot_id));
        }
        let device_size = (DEVICE_CONTEXT_ENTRIES * self.context_size) as u64;
        let output = self
            .mem
            .allocate(device_size, CONTEXT_ALIGNMENT, Some(PAGE_SIZE))?;
        let input = self.mem.allocate(
            device_size + self.context_size as u64,
            CONTEXT_ALIGNMENT,
            Some(PAGE_SIZE),
        )?;
        self.mem
            .write_u64(output.addr().0, self.dcbaa_entry(slot_id)?)?;
        debug!(
            "slot {} enabled: output context {}, input context {}",
            slot_id,
            output.addr(),
            input.addr()
        );
        self.slots[index] = Some(DeviceSlot {
            input,
            output,
            input_control: InputControlContext::default(),
            slot: SlotContext::default(),
            endpoints: [EndpointContext::default(); MAX_DCI as usize],
            streams: BTreeMap::new(),
        });
        Ok(())
    }

    /// Clears the DCBAA entry and frees the slot's contexts and stream arrays.
    pub fn disable_slot(&mut self, slot_id: u8) -> Result<()> {
        let index = self.check_slot_id(slot_id)?;
        if self.slots[index].take().is_none() {
            return Err(Error::SlotNotEnabled(slot_id));
        }
        self.mem.write_u64(0, self.dcbaa_entry(slot_id)?)?;
        debug!("slot {} disabled", slot_id);
        Ok(())
    }

    pub fn is_enabled(&self, slot_id: u8) -> bool {
        self.slot(slot_id).is_ok()
    }

    pub fn input_address(&self, slot_id: u8) -> Result<PhysAddr> {
        Ok(self.slot(slot_id)?.input.addr())
    }

    pub fn output_address(&self, slot_id: u8) -> Result<PhysAddr> {
        Ok(self.slot(slot_id)?.output.addr())
    }

    pub fn input_control(&self, slot_id: u8) -> Result<&InputControlContext> {
        Ok(&self.slot(slot_id)?.input_control)
    }

    pub fn input_control_mut(&mut self, slot_id: u8) -> Result<&mut InputControlContext> {
        Ok(&mut self.slot_mut(slot_id)?.input_control)
    }

    pub fn slot_context(&self, slot_id: u8) -> Result<&SlotContext> {
        Ok(&self.slot(slot_id)?.slot)
    }

    pub fn slot_context_mut(&mut self, slot_id: u8) -> Result<&mut SlotContext> {
        Ok(&mut self.slot_mut(slot_id)?.slot)
    }

    pub fn endpoint_context(
        &self,
        slot_id: u8,
        dci: DeviceContextIndex,
    ) -> Result<&EndpointContext> {
        let index = Self::endpoint_index(dci)?;
        Ok(&self.slot(slot_id)?.endpoints[index])
    }

    pub fn endpoint_context_mut(
        &mut self,
        slot_id: u8,
        dci: DeviceContextIndex,
    ) -> Result<&mut EndpointContext> {
        let index = Self::endpoint_index(dci)?;
        Ok(&mut self.slot_mut(slot_id)?.endpoints[index])
    }

    /// Resets the endpoint context at `dci` to `endpoint` and marks it, and the slot context,
    /// to be added by the next Address Device or Configure Endpoint.
    pub fn init_endpoint(
        &mut self,
        slot_id: u8,
        dci: DeviceContextIndex,
        endpoint: &EndpointConfig,
    ) -> Result<()> {
        let index = Self::endpoint_index(dci)?;
        let slot = self.slot_mut(slot_id)?;
        slot.streams.remove(&dci.0);
        slot.endpoints[index] = EndpointContext {
            state: endpoint.state,
            mult: endpoint.mult,
            interval: endpoint.interval,
            max_esit_payload: endpoint.max_esit_payload,
            error_count: endpoint.error_count,
            endpoint_type: endpoint.endpoint_type,
            max_burst_size: endpoint.max_burst_size,
            max_packet_size: endpoint.max_packet_size,
            average_trb_length: endpoint.average_trb_length,
            ..Default::default()
        };
        slot.slot.context_entries = slot.slot.context_entries.max(dci.0);
        slot.input_control.set_add_context_flag(0, true);
        slot.input_control.set_add_context_flag(dci.0, true);
        slot.input_control.set_drop_context_flag(dci.0, false);
        debug!("slot {} {}: {:?}", slot_id, dci, endpoint.endpoint_type);
        Ok(())
    }

    /// Marks the endpoint at `dci` to be dropped by the next Configure Endpoint and frees its
    /// stream array.
    pub fn drop_endpoint(&mut self, slot_id: u8, dci: DeviceContextIndex) -> Result<()> {
        let index = Self::endpoint_index(dci)?;
        let slot = self.slot_mut(slot_id)?;
        slot.streams.remove(&dci.0);
        slot.endpoints[index] = EndpointContext::default();
        slot.input_control.set_add_context_flag(dci.0, false);
        slot.input_control.set_drop_context_flag(dci.0, true);
        Ok(())
    }

    /// Points the endpoint context at `ring`'s dequeue pointer and cycle state.
    pub fn bind_transfer_ring(
        &mut self,
        slot_id: u8,
        dci: DeviceContextIndex,
        ring: &TransferRing,
    ) -> Result<()> {
        if ring.slot_id() != slot_id || ring.dci() != dci.0 || ring.stream_id() != 0 {
            return Err(Error::RingMismatch {
                ring: ring.to_string(),
                slot_id,
                dci: dci.0,
            });
        }
        let (dequeue, cycle) = ring.dequeue_state();
        let context = self.endpoint_context_mut(slot_id, dci)?;
        context.max_primary_streams = 0;
        context.linear_stream_array = false;
        context.tr_dequeue_pointer = dequeue.0;
        context.dequeue_cycle_state = cycle;
        debug!("slot {} {}: transfer ring at {}", slot_id, dci, dequeue);
        Ok(())
    }

    /// Hands `array` to the endpoint at `dci`, which must be a bulk endpoint. The endpoint's
    /// dequeue pointer names the array from then on.
    pub fn attach_streams(
        &mut self,
        slot_id: u8,
        dci: DeviceContextIndex,
        array: StreamContextArray,
    ) -> Result<()> {
        let index = Self::endpoint_index(dci)?;
        let slot = self.slot_mut(slot_id)?;
        let context = &mut slot.endpoints[index];
        if !context.endpoint_type.is_bulk() {
            return Err(Error::StreamsUnsupported(context.endpoint_type));
        }
        context.max_primary_streams = array.max_primary_streams();
        context.linear_stream_array = array.is_linear();
        context.tr_dequeue_pointer = array.addr().0;
        context.dequeue_cycle_state = false;
        debug!(
            "slot {} {}: {} streams at {}",
            slot_id,
            dci,
            array.size(),
            array.addr()
        );
        slot.streams.insert(dci.0, array);
        Ok(())
    }

    pub fn streams(
        &self,
        slot_id: u8,
        dci: DeviceContextIndex,
    ) -> Result<Option<&StreamContextArray>> {
        Ok(self.slot(slot_id)?.streams.get(&dci.0))
    }

    pub fn streams_mut(
        &mut self,
        slot_id: u8,
        dci: DeviceContextIndex,
    ) -> Result<Option<&mut StreamContextArray>> {
        Ok(self.slot_mut(slot_id)?.streams.get_mut(&dci.0))
    }

    /// Writes the input control context, the slot context and every endpoint context into the
    /// slot's input context and returns its address for Address Device, Configure Endpoint or
    /// Evaluate Context.
    pub fn publish_input(&self, slot_id: u8) -> Result<PhysAddr> {
        let slot = self.slot(slot_id)?;
        let base = slot.input.addr();
        self.mem
            .write_obj_at_addr(slot.input_control.encode(), base)?;
        self.mem.write_obj_at_addr(
            slot.slot.encode(),
            entry_addr(base, 1, self.context_size)?,
        )?;
        for (i, endpoint) in slot.endpoints.iter().enumerate() {
            self.mem.write_obj_at_addr(
                endpoint.encode(),
                entry_addr(base, i + 2, self.context_size)?,
            )?;
        }
        if self.config.debug {
            debug!(
                "slot {}: input context at {} {:?}",
                slot_id, base, slot.input_control
            );
        }
        Ok(base)
    }

    /// Reads the output device context the controller maintains for `slot_id`.
    pub fn read_output(&self, slot_id: u8) -> Result<DeviceContext> {
        let base = self.slot(slot_id)?.output.addr();
        let dw: [u32; 8] = self.mem.read_obj_from_addr(base)?;
        let slot = SlotContext::decode(&dw)?;
        let endpoints = (1..DEVICE_CONTEXT_ENTRIES)
            .map(|i| {
                let dw: [u32; 8] = self
                    .mem
                    .read_obj_from_addr(entry_addr(base, i, self.context_size)?)?;
                EndpointContext::decode(&dw)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DeviceContext { slot, endpoints })
    }

    /// Replaces the software copies with the output context and clears the input control
    /// flags, as after a command completes.
    pub fn refresh(&mut self, slot_id: u8) -> Result<()> {
        let output = self.read_output(slot_id)?;
        let slot = self.slot_mut(slot_id)?;
        slot.slot = output.slot;
        slot.endpoints.copy_from_slice(&output.endpoints);
        slot.input_control = InputControlContext::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::PoisonError;

    use super::*;

    #[derive(Default)]
    struct Registers(Mutex<HashMap<u64, u32>>);

    impl RegisterIo for Registers {
        fn read32(&self, offset: u64) -> u32 {
            let regs = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            regs.get(&offset).copied().unwrap_or(0)
        }

        fn write32(&self, offset: u64, value: u32) {
            let mut regs = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            regs.insert(offset, value);
        }
    }

    fn caps(context_size_64: bool, scratchpads: u16) -> Capabilities {
        Capabilities {
            hci_version: 0x110,
            max_slots: 8,
            max_interrupters: 1,
            max_ports: 4,
            erst_max: 2,
            max_scratchpad_buffers: scratchpads,
            addressing_64: true,
            context_size_64,
            max_psa_size: 4,
        }
    }

    fn store(context_size_64: bool) -> (ContextStore, DmaMemory, Arc<Registers>) {
        let mem = DmaMemory::new(PhysAddr(0x10_0000), 0x10_0000).unwrap();
        let io = Arc::new(Registers::default());
        let layout = RegisterLayout::new(0x20, 0x800, 0x1000);
        let store = ContextStore::new(
            mem.clone(),
            io.clone(),
            layout,
            &caps(context_size_64, 0),
            RingConfig::default(),
        )
        .unwrap();
        (store, mem, io)
    }

    fn dci(value: u8) -> DeviceContextIndex {
        DeviceContextIndex::new(value).unwrap()
    }

    #[test]
    fn dci_from_endpoint() {
        let out3 = DeviceContextIndex::from_endpoint(3, Direction::Out, false).unwrap();
        assert_eq!(out3.value(), 6);
        assert_eq!(out3.endpoint_number(), 3);
        assert_eq!(out3.direction(), Direction::Out);
        let in3 = DeviceContextIndex::from_endpoint(3, Direction::In, false).unwrap();
        assert_eq!(in3.value(), 7);
        assert_eq!(
            DeviceContextIndex::from_endpoint(0, Direction::Out, true)
                .unwrap()
                .value(),
            0
        );
        assert_eq!(
            DeviceContextIndex::from_endpoint(0, Direction::Out, false)
                .unwrap()
                .value(),
            1
        );
        assert!(matches!(
            DeviceContextIndex::from_endpoint(16, Direction::In, false),
            Err(Error::BadEndpointNumber(16))
        ));
        assert!(matches!(
            DeviceContextIndex::new(32),
            Err(Error::BadDeviceContextIndex(32))
        ));
    }

    #[test]
    fn slot_context_layout() {
        let slot = SlotContext {
            route_string: 0x12345,
            speed: 4,
            hub: true,
            context_entries: 5,
            max_exit_latency: 0x100,
            root_hub_port_number: 2,
            number_of_ports: 4,
            interrupter_target: 3,
            usb_device_address: 7,
            slot_state: SlotState::Addressed,
            ..Default::default()
        };
        let dw = slot.encode();
        assert_eq!(dw[0], 0x12345 | 4 << 20 | 1 << 26 | 5 << 27);
        assert_eq!(dw[1], 0x100 | 2 << 16 | 4 << 24);
        assert_eq!(dw[2], 3 << 22);
        assert_eq!(dw[3], 7 | 2 << 27);
        assert_eq!(SlotContext::decode(&dw).unwrap(), slot);

        let mut bad = dw;
        bad[3] = 9 << 27;
        assert!(matches!(
            SlotContext::decode(&bad),
            Err(Error::InvalidSlotState(9))
        ));
    }

    #[test]
    fn endpoint_context_layout() {
        let endpoint = EndpointContext {
            state: EndpointState::Running,
            max_primary_streams: 3,
            linear_stream_array: true,
            interval: 6,
            max_esit_payload: 0x12_3456,
            error_count: 3,
            endpoint_type: EndpointType::BulkIn,
            max_burst_size: 15,
            max_packet_size: 1024,
            dequeue_cycle_state: true,
            tr_dequeue_pointer: 0x1_2345_6780,
            average_trb_length: 3072,
            ..Default::default()
        };
        let dw = endpoint.encode();
        assert_eq!(dw[0], 1 | 3 << 10 | 1 << 15 | 6 << 16 | 0x12 << 24);
        assert_eq!(dw[1], 3 << 1 | 6 << 3 | 15 << 8 | 1024 << 16);
        assert_eq!(dw[2], 0x2345_6781);
        assert_eq!(dw[3], 1);
        assert_eq!(dw[4], 3072 | 0x3456 << 16);
        assert_eq!(EndpointContext::decode(&dw).unwrap(), endpoint);
    }

    #[test]
    fn input_control_and_stream_context_layout() {
        let mut control = InputControlContext {
            configuration_value: 1,
            interface_number: 2,
            alternate_setting: 3,
            ..Default::default()
        };
        control.set_add_context_flag(0, true);
        control.set_add_context_flag(3, true);
        control.set_drop_context_flag(4, true);
        let dw = control.encode();
        assert_eq!(dw[0], 1 << 4);
        assert_eq!(dw[1], 0b1001);
        assert_eq!(dw[7], 0x03_0201);
        assert_eq!(InputControlContext::decode(&dw), control);

        let stream = StreamContext {
            dequeue_cycle_state: true,
            context_type: StreamContextType::SecondaryArray(5),
            tr_dequeue_pointer: 0x8000,
            stopped_edtla: 0x100,
        };
        let dw = stream.encode();
        assert_eq!(dw[0], 0x8000 | 7 << 1 | 1);
        assert_eq!(dw[2], 0x100);
        assert_eq!(StreamContext::decode(&dw), stream);
    }

    #[test]
    fn new_programs_dcbaap_and_max_slots() {
        let (store, _, io) = store(false);
        let layout = RegisterLayout::new(0x20, 0x800, 0x1000);
        assert_eq!(io.read64(layout.dcbaap()), store.dcbaa_address().0);
        assert_eq!(io.read32(layout.config()) & 0xff, 8);
        assert_eq!(store.context_size(), 32);
        assert_eq!(store.scratchpad_buffers(), 0);
    }

    #[test]
    fn scratchpad_array_in_dcbaa_entry_zero() {
        let mem = DmaMemory::new(PhysAddr(0x10_0000), 0x10_0000).unwrap();
        let io = Arc::new(Registers::default());
        let layout = RegisterLayout::new(0x20, 0x800, 0x1000);
        let store =
            ContextStore::new(mem.clone(), io, layout, &caps(false, 2), RingConfig::default())
                .unwrap();
        assert_eq!(store.scratchpad_buffers(), 2);
        let array = PhysAddr(mem.read_u64(store.dcbaa_address()).unwrap());
        let page = mem.read_u64(array).unwrap();
        assert_ne!(page, 0);
        assert_eq!(page % PAGE_SIZE, 0);
    }

    #[test]
    fn host_mode_ep0_index_is_not_an_endpoint_context() {
        let (mut store, _, _) = store(false);
        store.enable_slot(1).unwrap();
        let slot_index = DeviceContextIndex::from_endpoint(0, Direction::Out, true).unwrap();
        assert!(matches!(
            store.init_endpoint(1, slot_index, &EndpointConfig::default()),
            Err(Error::BadDeviceContextIndex(0))
        ));
        assert!(matches!(
            store.endpoint_context(1, slot_index),
            Err(Error::BadDeviceContextIndex(0))
        ));
        let ep0 = DeviceContextIndex::from_endpoint(0, Direction::Out, false).unwrap();
        store.init_endpoint(1, ep0, &EndpointConfig::default()).unwrap();
        assert!(store.endpoint_context(1, ep0).is_ok());
    }

    #[test]
    fn enable_and_disable_slot() {
        let (mut store, mem, _) = store(false);
        assert!(matches!(store.enable_slot(0), Err(Error::BadSlotId(0))));
        assert!(matches!(store.enable_slot(9), Err(Error::BadSlotId(9))));
        store.enable_slot(3).unwrap();
        assert!(matches!(store.enable_slot(3), Err(Error::SlotInUse(3))));
        let entry = store.dcbaa_address().checked_add(3 * 8).unwrap();
        assert_eq!(
            mem.read_u64(entry).unwrap(),
            store.output_address(3).unwrap().0
        );
        assert!(store.is_enabled(3));
        store.disable_slot(3).unwrap();
        assert_eq!(mem.read_u64(entry).unwrap(), 0);
        assert!(!store.is_enabled(3));
        assert!(matches!(
            store.disable_slot(3),
            Err(Error::SlotNotEnabled(3))
        ));
        assert!(matches!(
            store.slot_context(3),
            Err(Error::SlotNotEnabled(3))
        ));
    }

    #[test]
    fn publish_input_with_64_byte_contexts() {
        let (mut store, mem, io) = store(true);
        store.enable_slot(1).unwrap();
        store.slot_context_mut(1).unwrap().root_hub_port_number = 2;
        store
            .init_endpoint(1, dci(1), &EndpointConfig::default())
            .unwrap();

        let layout = RegisterLayout::new(0x20, 0x800, 0x1000);
        let mut ring = TransferRing::new(
            mem.clone(),
            io,
            layout,
            1,
            1,
            0,
            RingConfig::default(),
        );
        ring.init(Some(16)).unwrap();
        store.bind_transfer_ring(1, dci(1), &ring).unwrap();

        let input = store.publish_input(1).unwrap();
        let control: [u32; 8] = mem.read_obj_from_addr(input).unwrap();
        assert_eq!(control[1], 0b11);
        let slot: [u32; 8] = mem
            .read_obj_from_addr(input.checked_add(64).unwrap())
            .unwrap();
        let slot = SlotContext::decode(&slot).unwrap();
        assert_eq!(slot.context_entries, 1);
        assert_eq!(slot.root_hub_port_number, 2);
        let ep0: [u32; 8] = mem
            .read_obj_from_addr(input.checked_add(128).unwrap())
            .unwrap();
        let ep0 = EndpointContext::decode(&ep0).unwrap();
        assert_eq!(ep0.endpoint_type, EndpointType::Control);
        assert_eq!(ep0.max_packet_size, 64);
        assert_eq!(ep0.error_count, 3);
        assert_eq!(Some(PhysAddr(ep0.tr_dequeue_pointer)), ring.ring().base());
        assert!(ep0.dequeue_cycle_state);
    }

    #[test]
    fn bind_rejects_foreign_ring() {
        let (mut store, mem, io) = store(false);
        store.enable_slot(1).unwrap();
        let layout = RegisterLayout::new(0x20, 0x800, 0x1000);
        let mut ring = TransferRing::new(mem, io, layout, 2, 1, 0, RingConfig::default());
        ring.init(Some(16)).unwrap();
        assert!(matches!(
            store.bind_transfer_ring(1, dci(1), &ring),
            Err(Error::RingMismatch { slot_id: 1, dci: 1, .. })
        ));
    }

    #[test]
    fn read_output_and_refresh() {
        let (mut store, mem, _) = store(false);
        store.enable_slot(2).unwrap();
        store
            .init_endpoint(2, dci(1), &EndpointConfig::default())
            .unwrap();
        let output = store.output_address(2).unwrap();
        let slot = SlotContext {
            usb_device_address: 5,
            slot_state: SlotState::Addressed,
            context_entries: 1,
            ..Default::default()
        };
        mem.write_obj_at_addr(slot.encode(), output).unwrap();
        let ep0 = EndpointContext {
            state: EndpointState::Running,
            endpoint_type: EndpointType::Control,
            max_packet_size: 512,
            ..Default::default()
        };
        mem.write_obj_at_addr(ep0.encode(), output.checked_add(32).unwrap())
            .unwrap();

        let device = store.read_output(2).unwrap();
        assert_eq!(device.slot, slot);
        assert_eq!(device.endpoint(dci(1)), Some(&ep0));
        assert_eq!(device.endpoint(dci(0)), None);
        assert_eq!(device.endpoints.len(), 31);

        store.refresh(2).unwrap();
        assert_eq!(store.slot_context(2).unwrap().usb_device_address, 5);
        assert_eq!(
            store.endpoint_context(2, dci(1)).unwrap().state,
            EndpointState::Running
        );
        assert_eq!(store.input_control(2).unwrap().add_context_flags, 0);
    }

    #[test]
    fn drop_endpoint_flags() {
        let (mut store, _, _) = store(false);
        store.enable_slot(1).unwrap();
        let bulk = EndpointConfig {
            endpoint_type: EndpointType::BulkOut,
            max_packet_size: 512,
            ..Default::default()
        };
        store.init_endpoint(1, dci(4), &bulk).unwrap();
        assert!(store.input_control(1).unwrap().add_context_flag(4));
        store.drop_endpoint(1, dci(4)).unwrap();
        let control = store.input_control(1).unwrap();
        assert!(!control.add_context_flag(4));
        assert!(control.drop_context_flag(4));
        assert!(matches!(
            store.endpoint_context(1, dci(0)),
            Err(Error::BadDeviceContextIndex(0))
        ));
    }

    #[test]
    fn linear_stream_array() {
        let mem = DmaMemory::new(PhysAddr(0x10_0000), 0x1_0000).unwrap();
        assert!(matches!(
            StreamContextArray::new_linear(&mem, 6),
            Err(Error::BadStreamArraySize(6))
        ));
        assert!(matches!(
            StreamContextArray::new_linear(&mem, 2),
            Err(Error::BadStreamArraySize(2))
        ));
        let mut array = StreamContextArray::new_linear(&mem, 16).unwrap();
        assert_eq!(array.max_primary_streams(), 3);
        assert!(matches!(array.resolve(0), Err(Error::BadStreamId(0))));
        assert!(matches!(array.resolve(16), Err(Error::BadStreamId(16))));
        let (addr, context_type) = array.resolve(5).unwrap();
        assert_eq!(addr, array.addr().checked_add(5 * 16).unwrap());
        assert_eq!(context_type, StreamContextType::PrimaryRing);
        array
            .set_stream_ring(5, PhysAddr(0x2_0000), true)
            .unwrap();
        let context = array.stream_context(5).unwrap();
        assert_eq!(context.tr_dequeue_pointer, 0x2_0000);
        assert!(context.dequeue_cycle_state);
        assert_eq!(context.context_type, StreamContextType::PrimaryRing);
        assert!(matches!(
            array.setup_secondary(1, 8),
            Err(Error::LinearStreamArray)
        ));
    }

    #[test]
    fn hybrid_stream_array() {
        let mem = DmaMemory::new(PhysAddr(0x10_0000), 0x1_0000).unwrap();
        let mut array = StreamContextArray::new_hybrid(&mem, 4).unwrap();
        assert!(matches!(
            array.setup_secondary(3, 4),
            Err(Error::BadStreamArraySize(4))
        ));
        assert!(matches!(
            array.setup_secondary(3, 512),
            Err(Error::BadStreamArraySize(512))
        ));
        assert!(matches!(
            array.setup_secondary(4, 8),
            Err(Error::BadStreamId(4))
        ));
        let secondary = array.setup_secondary(3, 8).unwrap();
        assert!(matches!(
            array.setup_secondary(3, 8),
            Err(Error::SecondaryInUse(3))
        ));
        let primary: [u32; 4] = mem
            .read_obj_from_addr(array.addr().checked_add(3 * 16).unwrap())
            .unwrap();
        let primary = StreamContext::decode(&primary);
        assert_eq!(primary.context_type, StreamContextType::SecondaryArray(0));
        assert_eq!(primary.tr_dequeue_pointer, secondary.0);

        // Stream 23 is primary entry 3, secondary entry 5.
        let (addr, context_type) = array.resolve(3 | 5 << 2).unwrap();
        assert_eq!(addr, secondary.checked_add(5 * 16).unwrap());
        assert_eq!(context_type, StreamContextType::SecondaryRing);
        assert!(matches!(
            array.resolve(3 | 8 << 2),
            Err(Error::BadStreamId(35))
        ));
        // Entry 2 has no secondary array, so it is a ring itself.
        let (addr, context_type) = array.resolve(2).unwrap();
        assert_eq!(addr, array.addr().checked_add(2 * 16).unwrap());
        assert_eq!(context_type, StreamContextType::PrimaryRing);
        assert!(matches!(array.resolve(2 | 1 << 2), Err(Error::BadStreamId(6))));
    }

    #[test]
    fn attach_streams_to_bulk_endpoint() {
        let (mut store, mem, io) = store(false);
        store.enable_slot(1).unwrap();
        let interrupt = EndpointConfig {
            endpoint_type: EndpointType::InterruptIn,
            ..Default::default()
        };
        store.init_endpoint(1, dci(3), &interrupt).unwrap();
        let array = StreamContextArray::new_linear(&mem, 4).unwrap();
        assert!(matches!(
            store.attach_streams(1, dci(3), array),
            Err(Error::StreamsUnsupported(EndpointType::InterruptIn))
        ));

        let bulk = EndpointConfig {
            endpoint_type: EndpointType::BulkIn,
            max_packet_size: 1024,
            ..Default::default()
        };
        store.init_endpoint(1, dci(3), &bulk).unwrap();
        let array = StreamContextArray::new_linear(&mem, 4).unwrap();
        let array_addr = array.addr();
        store.attach_streams(1, dci(3), array).unwrap();
        let context = store.endpoint_context(1, dci(3)).unwrap();
        assert_eq!(context.max_primary_streams, 1);
        assert!(context.linear_stream_array);
        assert_eq!(context.tr_dequeue_pointer, array_addr.0);

        let layout = RegisterLayout::new(0x20, 0x800, 0x1000);
        let mut ring = TransferRing::new(mem, io, layout, 1, 3, 2, RingConfig::default());
        ring.init(Some(16)).unwrap();
        let streams = store.streams(1, dci(3)).unwrap().unwrap();
        streams.bind_stream_ring(&ring).unwrap();
        let stream = streams.stream_context(2).unwrap();
        assert_eq!(Some(PhysAddr(stream.tr_dequeue_pointer)), ring.ring().base());
        assert!(stream.dequeue_cycle_state);
    }
}
