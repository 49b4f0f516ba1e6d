// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Event TRBs, xHCI 1.2 section 6.4.2. Software only builds these when modeling the
//! controller; drivers decode them off the event ring.

use super::CompletionCode;
use super::Trb;
use super::TrbType;
use super::TypedTrb;
use crate::bits;

fn code_of(trb: &Trb) -> CompletionCode {
    CompletionCode::from(bits::get(trb.status(), 24, 8) as u8)
}

fn status_with_code(status: u32, code: CompletionCode) -> u32 {
    bits::set(status, 24, 8, u8::from(code) as u32)
}

fn slot_of(trb: &Trb) -> u8 {
    bits::get(trb.control(), 24, 8) as u8
}

fn with_slot(trb: &mut Trb, slot_id: u8) {
    trb.set_control(bits::set(trb.control(), 24, 8, slot_id as u32));
}

fn vf_of(trb: &Trb) -> u8 {
    bits::get(trb.control(), 16, 8) as u8
}

fn with_vf(trb: &mut Trb, vf_id: u8) {
    trb.set_control(bits::set(trb.control(), 16, 8, vf_id as u32));
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferEventTrb {
    /// Address of the TRB that generated the event, or the Event Data TRB's parameter when
    /// `event_data` is set.
    pub trb_pointer: u64,
    /// Residual byte count, 24 bits.
    pub transfer_length: u32,
    pub completion_code: CompletionCode,
    pub event_data: bool,
    pub endpoint_id: u8,
    pub slot_id: u8,
}

impl TypedTrb for TransferEventTrb {
    const TYPE: TrbType = TrbType::TransferEvent;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.trb_pointer);
        trb.set_status(status_with_code(
            bits::set(0, 0, 24, self.transfer_length),
            self.completion_code,
        ));
        let control = bits::set_bit(trb.control(), 2, self.event_data);
        trb.set_control(bits::set(control, 16, 5, self.endpoint_id as u32));
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        TransferEventTrb {
            trb_pointer: trb.parameter(),
            transfer_length: bits::get(trb.status(), 0, 24),
            completion_code: code_of(trb),
            event_data: bits::get_bit(trb.control(), 2),
            endpoint_id: bits::get(trb.control(), 16, 5) as u8,
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandCompletionEventTrb {
    pub command_trb_pointer: u64,
    /// 24 bits.
    pub completion_parameter: u32,
    pub completion_code: CompletionCode,
    pub vf_id: u8,
    pub slot_id: u8,
}

impl TypedTrb for CommandCompletionEventTrb {
    const TYPE: TrbType = TrbType::CommandCompletionEvent;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.command_trb_pointer & !0xf);
        trb.set_status(status_with_code(
            bits::set(0, 0, 24, self.completion_parameter),
            self.completion_code,
        ));
        with_vf(trb, self.vf_id);
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        CommandCompletionEventTrb {
            command_trb_pointer: trb.parameter() & !0xf,
            completion_parameter: bits::get(trb.status(), 0, 24),
            completion_code: code_of(trb),
            vf_id: vf_of(trb),
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortStatusChangeEventTrb {
    /// 1-based root hub port number.
    pub port_id: u8,
    pub completion_code: CompletionCode,
}

impl TypedTrb for PortStatusChangeEventTrb {
    const TYPE: TrbType = TrbType::PortStatusChangeEvent;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter((self.port_id as u64) << 24);
        trb.set_status(status_with_code(0, self.completion_code));
    }

    fn decode(trb: &Trb) -> Self {
        PortStatusChangeEventTrb {
            port_id: bits::get(bits::lo32(trb.parameter()), 24, 8) as u8,
            completion_code: code_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BandwidthRequestEventTrb {
    pub completion_code: CompletionCode,
    pub slot_id: u8,
}

impl TypedTrb for BandwidthRequestEventTrb {
    const TYPE: TrbType = TrbType::BandwidthRequestEvent;

    fn encode(&self, trb: &mut Trb) {
        trb.set_status(status_with_code(0, self.completion_code));
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        BandwidthRequestEventTrb {
            completion_code: code_of(trb),
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DoorbellEventTrb {
    /// 5 bits, the DB Target written by the VF.
    pub db_reason: u8,
    pub completion_code: CompletionCode,
    pub vf_id: u8,
    pub slot_id: u8,
}

impl TypedTrb for DoorbellEventTrb {
    const TYPE: TrbType = TrbType::DoorbellEvent;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.db_reason as u64 & 0x1f);
        trb.set_status(status_with_code(0, self.completion_code));
        with_vf(trb, self.vf_id);
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        DoorbellEventTrb {
            db_reason: (trb.parameter() & 0x1f) as u8,
            completion_code: code_of(trb),
            vf_id: vf_of(trb),
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostControllerEventTrb {
    pub completion_code: CompletionCode,
}

impl TypedTrb for HostControllerEventTrb {
    const TYPE: TrbType = TrbType::HostControllerEvent;

    fn encode(&self, trb: &mut Trb) {
        trb.set_status(status_with_code(0, self.completion_code));
    }

    fn decode(trb: &Trb) -> Self {
        HostControllerEventTrb {
            completion_code: code_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceNotificationEventTrb {
    /// 4 bits.
    pub notification_type: u8,
    /// 56 bits.
    pub notification_data: u64,
    pub completion_code: CompletionCode,
    pub slot_id: u8,
}

impl TypedTrb for DeviceNotificationEventTrb {
    const TYPE: TrbType = TrbType::DeviceNotificationEvent;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(
            (self.notification_data << 8) | ((self.notification_type as u64 & 0xf) << 4),
        );
        trb.set_status(status_with_code(0, self.completion_code));
        with_slot(trb, self.slot_id);
    }

    fn decode(trb: &Trb) -> Self {
        DeviceNotificationEventTrb {
            notification_type: ((trb.parameter() >> 4) & 0xf) as u8,
            notification_data: trb.parameter() >> 8,
            completion_code: code_of(trb),
            slot_id: slot_of(trb),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MfindexWrapEventTrb {
    pub completion_code: CompletionCode,
}

impl TypedTrb for MfindexWrapEventTrb {
    const TYPE: TrbType = TrbType::MfindexWrapEvent;

    fn encode(&self, trb: &mut Trb) {
        trb.set_status(status_with_code(0, self.completion_code));
    }

    fn decode(trb: &Trb) -> Self {
        MfindexWrapEventTrb {
            completion_code: code_of(trb),
        }
    }
}
