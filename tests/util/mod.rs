// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software model of an xHC used by the integration tests. It walks the command ring and the
//! transfer rings the way a controller does, following Link TRBs, moves data between transfer
//! buffers and per-endpoint queues, and posts events through the ERST.

#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use log::debug;
use xhci_ring::context::ContextStore;
use xhci_ring::context::EndpointContext;
use xhci_ring::context::EndpointState;
use xhci_ring::context::InputControlContext;
use xhci_ring::context::SlotContext;
use xhci_ring::context::SlotState;
use xhci_ring::context::StreamContext;
use xhci_ring::context::StreamContextType;
use xhci_ring::context::STREAM_CONTEXT_SIZE;
use xhci_ring::regs::Capabilities;
use xhci_ring::regs::RegisterIo;
use xhci_ring::regs::RegisterLayout;
use xhci_ring::regs::CRCR_COMMAND_ABORT;
use xhci_ring::regs::CRCR_RING_CYCLE_STATE;
use xhci_ring::regs::ERDP_EVENT_RING_DEQUEUE_POINTER;
use xhci_ring::trb::AddressDeviceCommandTrb;
use xhci_ring::trb::CommandCompletionEventTrb;
use xhci_ring::trb::CompletionCode;
use xhci_ring::trb::ConfigureEndpointCommandTrb;
use xhci_ring::trb::DataStageTrb;
use xhci_ring::trb::LinkTrb;
use xhci_ring::trb::PortStatusChangeEventTrb;
use xhci_ring::trb::ResetEndpointCommandTrb;
use xhci_ring::trb::SetTrDequeuePointerCommandTrb;
use xhci_ring::trb::SetupStageTrb;
use xhci_ring::trb::StopEndpointCommandTrb;
use xhci_ring::trb::TransferEventTrb;
use xhci_ring::trb::Trb;
use xhci_ring::trb::TrbType;
use xhci_ring::trb::TypedTrb;
use xhci_ring::trb::TRB_SIZE;
use xhci_ring::CommandRing;
use xhci_ring::DmaMemory;
use xhci_ring::EventRing;
use xhci_ring::PhysAddr;
use xhci_ring::RingConfig;
use xhci_ring::TransferRing;

pub const MEMORY_BASE: u64 = 0x1000_0000;
pub const MEMORY_SIZE: u64 = 0x10_0000;
pub const CONTEXT_SIZE: usize = 32;
pub const ERST_MAX: u8 = 2;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn layout() -> RegisterLayout {
    RegisterLayout::new(0x20, 0x2000, 0x3000)
}

pub fn capabilities() -> Capabilities {
    Capabilities {
        hci_version: 0x120,
        max_slots: 8,
        max_interrupters: 1,
        max_ports: 4,
        erst_max: ERST_MAX,
        max_scratchpad_buffers: 0,
        addressing_64: true,
        context_size_64: CONTEXT_SIZE == 64,
        max_psa_size: 4,
    }
}

pub fn test_config() -> RingConfig {
    RingConfig {
        poll_interval_us: 0,
        command_timeout_ms: 200,
        transfer_timeout_ms: 200,
        segment_trbs: 16,
        ..Default::default()
    }
}

// A producer ring as the controller walks it.
#[derive(Clone, Copy, Debug)]
struct Consumer {
    dequeue: PhysAddr,
    cycle: bool,
}

impl Consumer {
    // The next TRB software has handed over, following Link TRBs.
    fn peek(&mut self, mem: &DmaMemory) -> Option<(PhysAddr, Trb)> {
        loop {
            let trb = mem.read_trb_if_owned(self.dequeue, self.cycle).ok()??;
            if trb.trb_type() == Ok(TrbType::Link) {
                let link: LinkTrb = trb.parse().ok()?;
                self.dequeue = PhysAddr(link.ring_segment_pointer);
                self.cycle ^= link.toggle_cycle;
                continue;
            }
            return Some((self.dequeue, trb));
        }
    }

    fn advance(&mut self) {
        self.dequeue = PhysAddr(self.dequeue.0 + TRB_SIZE as u64);
    }
}

// The controller side of one interrupter's event ring.
#[derive(Default)]
struct Producer {
    erst_base: u64,
    erst_size: u32,
    segment: u32,
    remaining: u32,
    enqueue: u64,
    cycle: bool,
}

impl Producer {
    fn load(&mut self, mem: &DmaMemory) {
        let entry = PhysAddr(self.erst_base + 16 * self.segment as u64);
        self.enqueue = mem.read_u64(entry).unwrap_or(0);
        self.remaining = mem
            .read_u32(PhysAddr(entry.0 + 8))
            .unwrap_or(0)
            & 0xffff;
    }

    fn is_full(&self, mem: &DmaMemory, dequeue: u64) -> bool {
        if self.remaining == 1 {
            let next = (self.segment + 1) % self.erst_size.max(1);
            let entry = PhysAddr(self.erst_base + 16 * next as u64);
            mem.read_u64(entry).map_or(false, |base| base == dequeue)
        } else {
            dequeue == self.enqueue + TRB_SIZE as u64
        }
    }

    fn add_event(&mut self, mem: &DmaMemory, dequeue: u64, mut trb: Trb) {
        assert_ne!(self.enqueue, 0, "event ring not programmed");
        assert!(!self.is_full(mem, dequeue), "event ring full");
        trb.set_cycle(self.cycle);
        mem.publish_trb(&trb, PhysAddr(self.enqueue))
            .expect("event ring write");
        debug!("controller: event at {:#x} {}", self.enqueue, trb);
        self.enqueue += TRB_SIZE as u64;
        self.remaining -= 1;
        if self.remaining == 0 {
            self.segment += 1;
            if self.segment >= self.erst_size {
                self.cycle = !self.cycle;
                self.segment = 0;
            }
            self.load(mem);
        }
    }
}

#[derive(Default)]
struct Endpoint {
    consumer: Option<Consumer>,
    halted: bool,
    halt_next: Option<CompletionCode>,
}

/// Bytes a device endpoint produces for IN transfers and collects from OUT transfers.
#[derive(Default)]
pub struct DeviceData {
    pub in_data: VecDeque<u8>,
    pub out_data: Vec<u8>,
    pub setups: Vec<[u8; 8]>,
}

#[derive(Default)]
struct State {
    command: Option<Consumer>,
    events: Producer,
    next_slot: u8,
    endpoints: HashMap<(u8, u8, u16), Endpoint>,
    data: HashMap<(u8, u8), DeviceData>,
    commands_seen: Vec<TrbType>,
}

pub struct Controller {
    mem: DmaMemory,
    layout: RegisterLayout,
    regs: Mutex<HashMap<u64, u32>>,
    state: Mutex<State>,
}

impl Controller {
    pub fn new(mem: DmaMemory, layout: RegisterLayout) -> Arc<Controller> {
        Arc::new(Controller {
            mem,
            layout,
            regs: Mutex::new(HashMap::new()),
            state: Mutex::new(State {
                events: Producer {
                    cycle: true,
                    ..Default::default()
                },
                next_slot: 1,
                ..Default::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reg(&self, offset: u64) -> u32 {
        self.read32(offset)
    }

    fn erdp(&self) -> u64 {
        self.read64(self.layout.erdp(0)) & ERDP_EVENT_RING_DEQUEUE_POINTER
    }

    fn post(&self, state: &mut State, trb: Trb) {
        let dequeue = self.erdp();
        state.events.add_event(&self.mem, dequeue, trb);
    }

    /// Posts a Port Status Change event as if `port` changed.
    pub fn port_status_change(&self, port: u8) {
        let trb = PortStatusChangeEventTrb {
            port_id: port,
            completion_code: CompletionCode::Success,
        }
        .to_trb();
        let mut state = self.state();
        self.post(&mut state, trb);
    }

    /// Makes the next TRB the endpoint processes fail with `code` and halt the endpoint.
    pub fn halt_next(&self, slot_id: u8, dci: u8, code: CompletionCode) {
        self.state()
            .endpoints
            .entry((slot_id, dci, 0))
            .or_default()
            .halt_next = Some(code);
    }

    /// Queues bytes the device returns on IN transfers of `dci`.
    pub fn push_in_data(&self, slot_id: u8, dci: u8, data: &[u8]) {
        self.state()
            .data
            .entry((slot_id, dci))
            .or_default()
            .in_data
            .extend(data);
    }

    pub fn out_data(&self, slot_id: u8, dci: u8) -> Vec<u8> {
        self.state()
            .data
            .get(&(slot_id, dci))
            .map(|d| d.out_data.clone())
            .unwrap_or_default()
    }

    pub fn setups(&self, slot_id: u8) -> Vec<[u8; 8]> {
        self.state()
            .data
            .get(&(slot_id, 1))
            .map(|d| d.setups.clone())
            .unwrap_or_default()
    }

    pub fn commands_seen(&self) -> Vec<TrbType> {
        self.state().commands_seen.clone()
    }

    /// Where the controller will read the next TRB of the endpoint, once it has started.
    pub fn endpoint_dequeue(
        &self,
        slot_id: u8,
        dci: u8,
        stream_id: u16,
    ) -> Option<(PhysAddr, bool)> {
        self.state()
            .endpoints
            .get(&(slot_id, dci, stream_id))
            .and_then(|e| e.consumer)
            .map(|c| (c.dequeue, c.cycle))
    }

    fn output_context(&self, slot_id: u8) -> PhysAddr {
        let dcbaa = self.read64(self.layout.dcbaap());
        PhysAddr(
            self.mem
                .read_u64(PhysAddr(dcbaa + 8 * slot_id as u64))
                .unwrap_or(0),
        )
    }

    fn context_addr(base: PhysAddr, index: usize) -> PhysAddr {
        PhysAddr(base.0 + (index * CONTEXT_SIZE) as u64)
    }

    fn read_endpoint(&self, slot_id: u8, dci: u8) -> EndpointContext {
        let addr = Self::context_addr(self.output_context(slot_id), dci as usize);
        let dw: [u32; 8] = self.mem.read_obj_from_addr(addr).unwrap_or_default();
        EndpointContext::decode(&dw).unwrap_or_default()
    }

    fn write_endpoint(&self, slot_id: u8, dci: u8, context: &EndpointContext) {
        let addr = Self::context_addr(self.output_context(slot_id), dci as usize);
        self.mem
            .write_obj_at_addr(context.encode(), addr)
            .expect("output context write");
    }

    fn set_endpoint_state(&self, slot_id: u8, dci: u8, state: EndpointState) {
        let mut context = self.read_endpoint(slot_id, dci);
        context.state = state;
        self.write_endpoint(slot_id, dci, &context);
    }

    fn copy_context(&self, input: PhysAddr, output: PhysAddr, index: usize) {
        let dw: [u32; 8] = self
            .mem
            .read_obj_from_addr(Self::context_addr(input, index + 1))
            .expect("input context read");
        self.mem
            .write_obj_at_addr(dw, Self::context_addr(output, index))
            .expect("output context write");
    }

    fn update_slot(&self, slot_id: u8, f: impl FnOnce(&mut SlotContext)) {
        let addr = self.output_context(slot_id);
        let dw: [u32; 8] = self.mem.read_obj_from_addr(addr).unwrap_or_default();
        let mut slot = SlotContext::decode(&dw).unwrap_or_default();
        f(&mut slot);
        self.mem
            .write_obj_at_addr(slot.encode(), addr)
            .expect("slot context write");
    }

    // Stream contexts are read from linear arrays only.
    fn stream_context_addr(&self, slot_id: u8, dci: u8, stream_id: u16) -> PhysAddr {
        let endpoint = self.read_endpoint(slot_id, dci);
        PhysAddr(endpoint.tr_dequeue_pointer + (stream_id as usize * STREAM_CONTEXT_SIZE) as u64)
    }

    fn load_consumer(&self, slot_id: u8, dci: u8, stream_id: u16) -> Consumer {
        if stream_id == 0 {
            let endpoint = self.read_endpoint(slot_id, dci);
            return Consumer {
                dequeue: PhysAddr(endpoint.tr_dequeue_pointer),
                cycle: endpoint.dequeue_cycle_state,
            };
        }
        let dw: [u32; 4] = self
            .mem
            .read_obj_from_addr(self.stream_context_addr(slot_id, dci, stream_id))
            .unwrap_or_default();
        let stream = StreamContext::decode(&dw);
        assert_eq!(stream.context_type, StreamContextType::PrimaryRing);
        Consumer {
            dequeue: PhysAddr(stream.tr_dequeue_pointer),
            cycle: stream.dequeue_cycle_state,
        }
    }

    fn complete_command(
        &self,
        state: &mut State,
        addr: PhysAddr,
        code: CompletionCode,
        slot_id: u8,
    ) {
        let trb = CommandCompletionEventTrb {
            command_trb_pointer: addr.0,
            completion_code: code,
            slot_id,
            ..Default::default()
        }
        .to_trb();
        self.post(state, trb);
    }

    fn run_commands(&self) {
        let mut state = self.state();
        let mut consumer = match state.command {
            Some(c) => c,
            None => return,
        };
        while let Some((addr, trb)) = consumer.peek(&self.mem) {
            consumer.advance();
            let (code, slot_id) = self.execute(&mut state, &trb);
            self.complete_command(&mut state, addr, code, slot_id);
        }
        state.command = Some(consumer);
    }

    fn execute(&self, state: &mut State, trb: &Trb) -> (CompletionCode, u8) {
        let trb_type = match trb.trb_type() {
            Ok(t) if t.is_command() => t,
            _ => return (CompletionCode::TrbError, 0),
        };
        state.commands_seen.push(trb_type);
        let slot_id = trb.slot_id();
        match trb_type {
            TrbType::EnableSlotCommand => {
                let slot_id = state.next_slot;
                state.next_slot += 1;
                (CompletionCode::Success, slot_id)
            }
            TrbType::DisableSlotCommand => {
                state.endpoints.retain(|k, _| k.0 != slot_id);
                (CompletionCode::Success, slot_id)
            }
            TrbType::AddressDeviceCommand => {
                let Ok(command) = trb.parse::<AddressDeviceCommandTrb>() else {
                    return (CompletionCode::TrbError, slot_id);
                };
                let input = PhysAddr(command.input_context_pointer);
                let output = self.output_context(slot_id);
                self.copy_context(input, output, 0);
                self.copy_context(input, output, 1);
                self.update_slot(slot_id, |slot| {
                    if command.block_set_address_request {
                        slot.slot_state = SlotState::Default;
                    } else {
                        slot.slot_state = SlotState::Addressed;
                        slot.usb_device_address = slot_id;
                    }
                });
                self.set_endpoint_state(slot_id, 1, EndpointState::Running);
                state.endpoints.remove(&(slot_id, 1, 0));
                (CompletionCode::Success, slot_id)
            }
            TrbType::ConfigureEndpointCommand => {
                let Ok(command) = trb.parse::<ConfigureEndpointCommandTrb>() else {
                    return (CompletionCode::TrbError, slot_id);
                };
                let control = if command.deconfigure {
                    InputControlContext {
                        drop_context_flags: 0xffff_fffc,
                        ..Default::default()
                    }
                } else {
                    let dw: [u32; 8] = self
                        .mem
                        .read_obj_from_addr(PhysAddr(command.input_context_pointer))
                        .unwrap_or_default();
                    InputControlContext::decode(&dw)
                };
                let input = PhysAddr(command.input_context_pointer);
                let output = self.output_context(slot_id);
                for dci in 2..=31u8 {
                    if control.drop_context_flag(dci) {
                        self.set_endpoint_state(slot_id, dci, EndpointState::Disabled);
                        state.endpoints.retain(|k, _| (k.0, k.1) != (slot_id, dci));
                    }
                    if control.add_context_flag(dci) {
                        self.copy_context(input, output, dci as usize);
                        self.set_endpoint_state(slot_id, dci, EndpointState::Running);
                        state.endpoints.retain(|k, _| (k.0, k.1) != (slot_id, dci));
                    }
                }
                self.update_slot(slot_id, |slot| {
                    slot.slot_state = if command.deconfigure {
                        SlotState::Addressed
                    } else {
                        SlotState::Configured
                    };
                });
                (CompletionCode::Success, slot_id)
            }
            TrbType::ResetEndpointCommand => {
                let Ok(command) = trb.parse::<ResetEndpointCommandTrb>() else {
                    return (CompletionCode::TrbError, slot_id);
                };
                let endpoint = state
                    .endpoints
                    .entry((slot_id, command.endpoint_id, 0))
                    .or_default();
                if !endpoint.halted {
                    return (CompletionCode::ContextStateError, slot_id);
                }
                endpoint.halted = false;
                self.set_endpoint_state(slot_id, command.endpoint_id, EndpointState::Stopped);
                (CompletionCode::Success, slot_id)
            }
            TrbType::StopEndpointCommand => {
                let Ok(command) = trb.parse::<StopEndpointCommandTrb>() else {
                    return (CompletionCode::TrbError, slot_id);
                };
                self.set_endpoint_state(slot_id, command.endpoint_id, EndpointState::Stopped);
                (CompletionCode::Success, slot_id)
            }
            TrbType::SetTrDequeuePointerCommand => {
                let Ok(command) = trb.parse::<SetTrDequeuePointerCommandTrb>() else {
                    return (CompletionCode::TrbError, slot_id);
                };
                let mut context = self.read_endpoint(slot_id, command.endpoint_id);
                if context.state == EndpointState::Running {
                    return (CompletionCode::ContextStateError, slot_id);
                }
                let consumer = Consumer {
                    dequeue: PhysAddr(command.dequeue_pointer),
                    cycle: command.dequeue_cycle_state,
                };
                state
                    .endpoints
                    .entry((slot_id, command.endpoint_id, command.stream_id))
                    .or_default()
                    .consumer = Some(consumer);
                if command.stream_id == 0 {
                    context.tr_dequeue_pointer = command.dequeue_pointer;
                    context.dequeue_cycle_state = command.dequeue_cycle_state;
                    self.write_endpoint(slot_id, command.endpoint_id, &context);
                }
                (CompletionCode::Success, slot_id)
            }
            TrbType::ResetDeviceCommand => {
                state.endpoints.retain(|k, _| k.0 != slot_id);
                self.update_slot(slot_id, |slot| slot.slot_state = SlotState::Default);
                (CompletionCode::Success, slot_id)
            }
            _ => (CompletionCode::Success, slot_id),
        }
    }

    fn transfer_event(
        &self,
        state: &mut State,
        slot_id: u8,
        dci: u8,
        pointer: u64,
        code: CompletionCode,
        residual: u32,
        event_data: bool,
    ) {
        let trb = TransferEventTrb {
            trb_pointer: pointer,
            transfer_length: residual,
            completion_code: code,
            event_data,
            endpoint_id: dci,
            slot_id,
        }
        .to_trb();
        self.post(state, trb);
    }

    // Moves one data TRB's bytes. Returns the residual.
    fn move_data(
        &self,
        state: &mut State,
        slot_id: u8,
        dci: u8,
        buffer: u64,
        len: u32,
        direction_in: bool,
    ) -> u32 {
        let data = state.data.entry((slot_id, dci)).or_default();
        if direction_in {
            let n = (len as usize).min(data.in_data.len());
            let bytes: Vec<u8> = data.in_data.drain(..n).collect();
            self.mem
                .write_all_at_addr(&bytes, PhysAddr(buffer))
                .expect("transfer buffer write");
            len - n as u32
        } else {
            let mut bytes = vec![0u8; len as usize];
            self.mem
                .read_at_addr(&mut bytes, PhysAddr(buffer))
                .expect("transfer buffer read");
            data.out_data.extend(bytes);
            0
        }
    }

    fn run_transfers(&self, slot_id: u8, dci: u8, stream_id: u16) {
        let mut state = self.state();
        let key = (slot_id, dci, stream_id);
        let mut consumer = match state.endpoints.get(&key).and_then(|e| e.consumer) {
            Some(c) => c,
            None => self.load_consumer(slot_id, dci, stream_id),
        };
        if state.endpoints.get(&key).map_or(false, |e| e.halted) {
            return;
        }
        // Within a TD: the data direction of a control transfer and whether it went short.
        let mut control_in = false;
        let mut short: Option<u32> = None;
        let mut edtla = 0u32;
        while let Some((addr, trb)) = consumer.peek(&self.mem) {
            let halt = state.endpoints.entry(key).or_default().halt_next.take();
            if let Some(code) = halt {
                state.endpoints.entry(key).or_default().halted = true;
                let length = trb.status() & 0x1_ffff;
                self.transfer_event(&mut state, slot_id, dci, addr.0, code, length, false);
                self.set_endpoint_state(slot_id, dci, EndpointState::Halted);
                break;
            }
            consumer.advance();
            let trb_type = trb.trb_type().unwrap_or(TrbType::Reserved);
            let chain = trb.chain();
            let ioc = trb.interrupt_on_completion();
            let mut residual = 0;
            match trb_type {
                TrbType::SetupStage => {
                    if let Ok(setup) = trb.parse::<SetupStageTrb>() {
                        control_in = setup.request_type & 0x80 != 0;
                    }
                    let packet = trb.parameter().to_le_bytes();
                    state.data.entry((slot_id, dci)).or_default().setups.push(packet);
                }
                TrbType::DataStage | TrbType::Normal | TrbType::Isoch if short.is_none() => {
                    // Normal, Isoch and Data Stage TRBs share the buffer, length and ISP fields.
                    let buffer = trb.parameter();
                    let len = trb.status() & 0x1_ffff;
                    let isp = trb.control() & (1 << 2) != 0;
                    let direction_in = if trb_type == TrbType::DataStage {
                        let data: DataStageTrb = trb.parse().unwrap_or_default();
                        control_in = data.direction_in;
                        data.direction_in
                    } else if dci == 1 {
                        control_in
                    } else {
                        dci % 2 == 1
                    };
                    residual = self.move_data(&mut state, slot_id, dci, buffer, len, direction_in);
                    edtla += len - residual;
                    if residual > 0 {
                        short = Some(residual);
                        if isp || ioc {
                            let code = CompletionCode::ShortPacket;
                            self.transfer_event(
                                &mut state, slot_id, dci, addr.0, code, residual, false,
                            );
                        }
                        if !chain {
                            short = None;
                            edtla = 0;
                        }
                        continue;
                    }
                }
                TrbType::EventData => {
                    if ioc {
                        let code = if short.is_some() {
                            CompletionCode::ShortPacket
                        } else {
                            CompletionCode::Success
                        };
                        let length = edtla & 0xff_ffff;
                        let pointer = trb.parameter();
                        self.transfer_event(&mut state, slot_id, dci, pointer, code, length, true);
                    }
                    if !chain {
                        short = None;
                        edtla = 0;
                    }
                    continue;
                }
                _ => {}
            }
            if ioc {
                let (code, residual) = match short {
                    Some(r) => (CompletionCode::ShortPacket, r),
                    None => (CompletionCode::Success, residual),
                };
                self.transfer_event(&mut state, slot_id, dci, addr.0, code, residual, false);
            }
            if !chain {
                short = None;
                edtla = 0;
            }
        }
        state.endpoints.entry(key).or_default().consumer = Some(consumer);
    }

    fn abort_commands(&self) {
        let mut state = self.state();
        if let Some(consumer) = state.command {
            // Nothing runs asynchronously here, so only the stop is reported.
            let code = CompletionCode::CommandRingStopped;
            self.complete_command(&mut state, consumer.dequeue, code, 0);
        }
    }

    fn crcr_written(&self) {
        let lo = self.reg(self.layout.crcr()) as u64;
        let hi = self.reg(self.layout.crcr() + 4) as u64;
        let value = hi << 32 | lo;
        if value & CRCR_COMMAND_ABORT != 0 {
            self.abort_commands();
            return;
        }
        self.state().command = Some(Consumer {
            dequeue: PhysAddr(value & !0x3f),
            cycle: value & CRCR_RING_CYCLE_STATE != 0,
        });
    }

    fn erst_written(&self) {
        let base = self.read64(self.layout.erstba(0));
        let size = self.reg(self.layout.erstsz(0));
        let mut state = self.state();
        state.events.erst_base = base;
        state.events.erst_size = size;
        state.events.segment = 0;
        state.events.load(&self.mem);
    }

    fn erstsz_written(&self) {
        let size = self.reg(self.layout.erstsz(0));
        self.state().events.erst_size = size;
    }
}

impl RegisterIo for Controller {
    fn read32(&self, offset: u64) -> u32 {
        let regs = self.regs.lock().unwrap_or_else(PoisonError::into_inner);
        regs.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u64, value: u32) {
        self.regs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(offset, value);
        let layout = self.layout;
        if offset == layout.crcr() + 4 {
            self.crcr_written();
        } else if offset == layout.erstba(0) + 4 {
            self.erst_written();
        } else if offset == layout.erstsz(0) {
            self.erstsz_written();
        } else if offset == layout.doorbell(0) {
            self.run_commands();
        } else if offset > layout.doorbell(0) && offset < layout.doorbell(0) + 4 * 256 {
            let slot_id = ((offset - layout.doorbell(0)) / 4) as u8;
            self.run_transfers(slot_id, (value & 0xff) as u8, (value >> 16) as u16);
        }
    }
}

/// A driver stack wired to a `Controller`.
pub struct Harness {
    pub controller: Arc<Controller>,
    pub mem: DmaMemory,
    pub config: RingConfig,
    pub commands: CommandRing,
    pub events: EventRing,
    pub contexts: ContextStore,
}

impl Harness {
    pub fn new() -> Harness {
        Self::with_config(test_config())
    }

    pub fn with_config(config: RingConfig) -> Harness {
        init_logging();
        let mem = DmaMemory::new(PhysAddr(MEMORY_BASE), MEMORY_SIZE).expect("dma memory");
        let controller = Controller::new(mem.clone(), layout());
        let io: Arc<dyn RegisterIo> = controller.clone();
        let mut events = EventRing::new(
            mem.clone(),
            io.clone(),
            layout(),
            0,
            ERST_MAX,
            config.clone(),
        );
        events.init(None).expect("event ring init");
        let mut commands = CommandRing::new(mem.clone(), io.clone(), layout(), config.clone());
        commands.init(None).expect("command ring init");
        let contexts = ContextStore::new(mem.clone(), io, layout(), &capabilities(), config.clone())
            .expect("context store");
        Harness {
            controller,
            mem,
            config,
            commands,
            events,
            contexts,
        }
    }

    pub fn io(&self) -> Arc<dyn RegisterIo> {
        self.controller.clone()
    }

    pub fn transfer_ring(&self, slot_id: u8, dci: u8, stream_id: u16) -> TransferRing {
        let mut ring = TransferRing::new(
            self.mem.clone(),
            self.io(),
            layout(),
            slot_id,
            dci,
            stream_id,
            self.config.clone(),
        );
        ring.init(None).expect("transfer ring init");
        ring
    }
}
