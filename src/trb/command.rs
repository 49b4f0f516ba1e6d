// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command TRBs, xHCI 1.2 section 6.4.3.

use super::Trb;
use super::TrbType;
use super::TypedTrb;
use crate::bits;

const SLOT_SHIFT: u32 = 24;
const ENDPOINT_SHIFT: u32 = 16;

fn slot_of(trb: &Trb) -> u8 {
    bits::get(trb.control(), SLOT_SHIFT, 8) as u8
}

fn with_slot(trb: &mut Trb, slot_id: u8) {
    trb.set_control(bits::set(trb.control(), SLOT_SHIFT, 8, slot_id as u32));
}

fn endpoint_of(trb: &Trb) -> u8 {
    bits::get(trb.control(), ENDPOINT_SHIFT, 5) as u8
}

fn with_endpoint(trb: &mut Trb, endpoint_id: u8) {
    trb.set_control(bits::set(
        trb.control(),
        ENDPOINT_SHIFT,
        5,
        endpoint_id as u32,
    ));
}

fn with_bit(trb: &mut Trb, bit: u32, on: bool) {
    trb.set_control(bits::set_bit(trb.control(), bit, on));
}

fn context_pointer(trb: &Trb) -> u64 {
    trb.parameter() & !0xf
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoOpCommandTrb {}

impl TypedTrb for NoOpCommandTrb {
    const TYPE: TrbType = TrbType::NoOpCommand;

    fn encode(&self, _trb: &mut Trb) {}

    fn decode(_trb: &Trb) -> Self {
        NoOpCommandTrb {}
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnableSlotCommandTrb {
    /// 5 bits, from the Supported Protocol capability.
    pub slot_type: u8,
}

impl TypedTrb for EnableSlotCommandTrb {
    const TYPE: TrbType = TrbType::EnableSlotCommand;

    fn encode(&self, trb: &mut Trb) {
        trb.set_control(bits::set(trb.control(), 16, 5, self.slot_type as u32));
    }

    fn decode(trb: &Trb) -> Self {
        EnableSlotCommandTrb {
            slot_type: bits::get(trb.control(), 16, 5) as u8,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisableSlotCommandTrb {
    pub slot_id: u8,
}

impl TypedTrb for DisableSlotCommandTrb {
    const TYPE: TrbType = TrbType::DisableSlotCommand;

    fn encode(&self, trb: &mut Trb) {
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        DisableSlotCommandTrb {
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddressDeviceCommandTrb {
    pub input_context_pointer: u64,
    /// Block Set Address Request: move the slot to Default without sending SET_ADDRESS.
    pub block_set_address_request: bool,
    pub slot_id: u8,
}

impl TypedTrb for AddressDeviceCommandTrb {
    const TYPE: TrbType = TrbType::AddressDeviceCommand;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.input_context_pointer & !0xf);
        with_bit(trb, 9, self.block_set_address_request);
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        AddressDeviceCommandTrb {
            input_context_pointer: context_pointer(trb),
            block_set_address_request: bits::get_bit(trb.control(), 9),
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigureEndpointCommandTrb {
    pub input_context_pointer: u64,
    /// Deconfigure: drop every endpoint of the slot and ignore the input context.
    pub deconfigure: bool,
    pub slot_id: u8,
}

impl TypedTrb for ConfigureEndpointCommandTrb {
    const TYPE: TrbType = TrbType::ConfigureEndpointCommand;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.input_context_pointer & !0xf);
        with_bit(trb, 9, self.deconfigure);
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        ConfigureEndpointCommandTrb {
            input_context_pointer: context_pointer(trb),
            deconfigure: bits::get_bit(trb.control(), 9),
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvaluateContextCommandTrb {
    pub input_context_pointer: u64,
    pub slot_id: u8,
}

impl TypedTrb for EvaluateContextCommandTrb {
    const TYPE: TrbType = TrbType::EvaluateContextCommand;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.input_context_pointer & !0xf);
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        EvaluateContextCommandTrb {
            input_context_pointer: context_pointer(trb),
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResetEndpointCommandTrb {
    pub transfer_state_preserve: bool,
    pub endpoint_id: u8,
    pub slot_id: u8,
}

impl TypedTrb for ResetEndpointCommandTrb {
    const TYPE: TrbType = TrbType::ResetEndpointCommand;

    fn encode(&self, trb: &mut Trb) {
        with_bit(trb, 9, self.transfer_state_preserve);
        with_endpoint(trb, self.endpoint_id);
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        ResetEndpointCommandTrb {
            transfer_state_preserve: bits::get_bit(trb.control(), 9),
            endpoint_id: endpoint_of(trb),
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StopEndpointCommandTrb {
    pub endpoint_id: u8,
    pub suspend: bool,
    pub slot_id: u8,
}

impl TypedTrb for StopEndpointCommandTrb {
    const TYPE: TrbType = TrbType::StopEndpointCommand;

    fn encode(&self, trb: &mut Trb) {
        with_endpoint(trb, self.endpoint_id);
        with_bit(trb, 23, self.suspend);
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        StopEndpointCommandTrb {
            endpoint_id: endpoint_of(trb),
            suspend: bits::get_bit(trb.control(), 23),
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetTrDequeuePointerCommandTrb {
    pub dequeue_cycle_state: bool,
    /// Only meaningful when the endpoint has streams. 3 bits.
    pub stream_context_type: u8,
    /// 16-byte aligned new dequeue pointer.
    pub dequeue_pointer: u64,
    pub stream_id: u16,
    pub endpoint_id: u8,
    pub slot_id: u8,
}

impl TypedTrb for SetTrDequeuePointerCommandTrb {
    const TYPE: TrbType = TrbType::SetTrDequeuePointerCommand;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(
            (self.dequeue_pointer & !0xf)
                | ((self.stream_context_type as u64 & 0x7) << 1)
                | self.dequeue_cycle_state as u64,
        );
        trb.set_status((self.stream_id as u32) << 16);
        with_endpoint(trb, self.endpoint_id);
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        let p = trb.parameter();
        SetTrDequeuePointerCommandTrb {
            dequeue_cycle_state: p & 1 != 0,
            stream_context_type: ((p >> 1) & 0x7) as u8,
            dequeue_pointer: p & !0xf,
            stream_id: (trb.status() >> 16) as u16,
            endpoint_id: endpoint_of(trb),
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResetDeviceCommandTrb {
    pub slot_id: u8,
}

impl TypedTrb for ResetDeviceCommandTrb {
    const TYPE: TrbType = TrbType::ResetDeviceCommand;

    fn encode(&self, trb: &mut Trb) {
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        ResetDeviceCommandTrb {
            slot_id: slot_of(trb),
        }
    }
}

/// Force Event, used by virtualization hosts to inject events into a VF event ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForceEventCommandTrb {
    pub event_trb_pointer: u64,
    /// 10 bits.
    pub vf_interrupter_target: u16,
    pub vf_id: u8,
}

impl TypedTrb for ForceEventCommandTrb {
    const TYPE: TrbType = TrbType::ForceEventCommand;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.event_trb_pointer & !0xf);
        trb.set_status(bits::set(0, 22, 10, self.vf_interrupter_target as u32));
        trb.set_control(bits::set(trb.control(), 16, 8, self.vf_id as u32));
    }

    fn decode(trb: &Trb) -> Self {
        ForceEventCommandTrb {
            event_trb_pointer: trb.parameter() & !0xf,
            vf_interrupter_target: bits::get(trb.status(), 22, 10) as u16,
            vf_id: bits::get(trb.control(), 16, 8) as u8,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NegotiateBandwidthCommandTrb {
    pub slot_id: u8,
}

impl TypedTrb for NegotiateBandwidthCommandTrb {
    const TYPE: TrbType = TrbType::NegotiateBandwidthCommand;

    fn encode(&self, trb: &mut Trb) {
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        NegotiateBandwidthCommandTrb {
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetLatencyToleranceValueCommandTrb {
    /// Best Effort Latency Tolerance, 12 bits.
    pub best_effort_latency_tolerance: u16,
}

impl TypedTrb for SetLatencyToleranceValueCommandTrb {
    const TYPE: TrbType = TrbType::SetLatencyToleranceValueCommand;

    fn encode(&self, trb: &mut Trb) {
        trb.set_control(bits::set(
            trb.control(),
            16,
            12,
            self.best_effort_latency_tolerance as u32,
        ));
    }

    fn decode(trb: &Trb) -> Self {
        SetLatencyToleranceValueCommandTrb {
            best_effort_latency_tolerance: bits::get(trb.control(), 16, 12) as u16,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetPortBandwidthCommandTrb {
    pub port_bandwidth_context_pointer: u64,
    /// 4 bits.
    pub dev_speed: u8,
    pub hub_slot_id: u8,
}

impl TypedTrb for GetPortBandwidthCommandTrb {
    const TYPE: TrbType = TrbType::GetPortBandwidthCommand;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.port_bandwidth_context_pointer & !0xf);
        trb.set_control(bits::set(trb.control(), 16, 4, self.dev_speed as u32));
        with_slot(trb, self.hub_slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        GetPortBandwidthCommandTrb {
            port_bandwidth_context_pointer: context_pointer(trb),
            dev_speed: bits::get(trb.control(), 16, 4) as u8,
            hub_slot_id: slot_of(trb),
        }
    }
}

/// Force Header. The 96-bit header is split around the packet type in the low 5 bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForceHeaderCommandTrb {
    /// 5 bits.
    pub packet_type: u8,
    /// Header bits 31:5 of the first dword, stored right aligned. 27 bits.
    pub header_info_lo: u32,
    pub header_info_mid: u32,
    pub header_info_hi: u32,
    pub root_hub_port_number: u8,
}

impl TypedTrb for ForceHeaderCommandTrb {
    const TYPE: TrbType = TrbType::ForceHeaderCommand;

    fn encode(&self, trb: &mut Trb) {
        let dw0 = bits::set(0, 0, 5, self.packet_type as u32);
        let dw0 = bits::set(dw0, 5, 27, self.header_info_lo);
        trb.set_parameter(bits::join64(dw0, self.header_info_mid));
        trb.set_status(self.header_info_hi);
        with_slot(trb, self.root_hub_port_number);
    }

    fn decode(trb: &Trb) -> Self {
        let dw0 = bits::lo32(trb.parameter());
        ForceHeaderCommandTrb {
            packet_type: bits::get(dw0, 0, 5) as u8,
            header_info_lo: bits::get(dw0, 5, 27),
            header_info_mid: bits::hi32(trb.parameter()),
            header_info_hi: trb.status(),
            root_hub_port_number: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetExtendedPropertyCommandTrb {
    pub extended_property_context_pointer: u64,
    pub extended_capability_identifier: u16,
    /// 3 bits.
    pub command_subtype: u8,
    /// 5 bits.
    pub endpoint_id: u8,
    pub slot_id: u8,
}

impl TypedTrb for GetExtendedPropertyCommandTrb {
    const TYPE: TrbType = TrbType::GetExtendedPropertyCommand;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.extended_property_context_pointer & !0xf);
        trb.set_status(self.extended_capability_identifier as u32);
        let control = bits::set(trb.control(), 16, 3, self.command_subtype as u32);
        trb.set_control(bits::set(control, 19, 5, self.endpoint_id as u32));
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        GetExtendedPropertyCommandTrb {
            extended_property_context_pointer: context_pointer(trb),
            extended_capability_identifier: bits::get(trb.status(), 0, 16) as u16,
            command_subtype: bits::get(trb.control(), 16, 3) as u8,
            endpoint_id: bits::get(trb.control(), 19, 5) as u8,
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetExtendedPropertyCommandTrb {
    pub extended_capability_identifier: u16,
    pub capability_parameter: u8,
    pub command_subtype: u8,
    pub endpoint_id: u8,
    pub slot_id: u8,
}

impl TypedTrb for SetExtendedPropertyCommandTrb {
    const TYPE: TrbType = TrbType::SetExtendedPropertyCommand;

    fn encode(&self, trb: &mut Trb) {
        let status = bits::set(0, 0, 16, self.extended_capability_identifier as u32);
        trb.set_status(bits::set(status, 16, 8, self.capability_parameter as u32));
        let control = bits::set(trb.control(), 16, 3, self.command_subtype as u32);
        trb.set_control(bits::set(control, 19, 5, self.endpoint_id as u32));
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        SetExtendedPropertyCommandTrb {
            extended_capability_identifier: bits::get(trb.status(), 0, 16) as u16,
            capability_parameter: bits::get(trb.status(), 16, 8) as u8,
            command_subtype: bits::get(trb.control(), 16, 3) as u8,
            endpoint_id: bits::get(trb.control(), 19, 5) as u8,
            slot_id: slot_of(trb),
        }
    }
}
