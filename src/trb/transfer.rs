// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Transfer TRBs, xHCI 1.2 section 6.4.1, plus the Link TRB shared with the command ring.

use enumn::N;

use super::flags;
use super::Trb;
use super::TrbType;
use super::TypedTrb;
use crate::bits;

// Status dword of Normal, Data Stage and Isoch TRBs.
const LENGTH_WIDTH: u32 = 17;
const TD_SIZE_SHIFT: u32 = 17;
const TD_SIZE_WIDTH: u32 = 5;
const INTERRUPTER_SHIFT: u32 = 22;
const INTERRUPTER_WIDTH: u32 = 10;

const DIR_BIT: u32 = 16;
const TOGGLE_CYCLE_BIT: u32 = 1;

/// Largest value the TD Size field can hold.
pub const MAX_TD_SIZE: u8 = 31;

fn encode_status(length: u32, td_size: u8, interrupter_target: u16) -> u32 {
    let status = bits::set(0, 0, LENGTH_WIDTH, length);
    let status = bits::set(status, TD_SIZE_SHIFT, TD_SIZE_WIDTH, td_size as u32);
    bits::set(
        status,
        INTERRUPTER_SHIFT,
        INTERRUPTER_WIDTH,
        interrupter_target as u32,
    )
}

fn interrupter_of(trb: &Trb) -> u16 {
    bits::get(trb.status(), INTERRUPTER_SHIFT, INTERRUPTER_WIDTH) as u16
}

fn flag(trb: &Trb, bit: u32) -> bool {
    bits::get_bit(trb.control(), bit)
}

fn with_flags(trb: &mut Trb, set: &[(u32, bool)]) {
    let control = set
        .iter()
        .fold(trb.control(), |c, &(bit, on)| bits::set_bit(c, bit, on));
    trb.set_control(control);
}

/// Normal TRB, one buffer fragment of a bulk or interrupt TD.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NormalTrb {
    pub data_buffer: u64,
    /// 17 bits.
    pub transfer_length: u32,
    /// Packets remaining in the TD after this TRB, saturated at 31.
    pub td_size: u8,
    pub interrupter_target: u16,
    pub evaluate_next_trb: bool,
    pub interrupt_on_short_packet: bool,
    pub no_snoop: bool,
    pub chain: bool,
    pub interrupt_on_completion: bool,
    pub immediate_data: bool,
    pub block_event_interrupt: bool,
}

impl TypedTrb for NormalTrb {
    const TYPE: TrbType = TrbType::Normal;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.data_buffer);
        trb.set_status(encode_status(
            self.transfer_length,
            self.td_size,
            self.interrupter_target,
        ));
        with_flags(
            trb,
            &[
                (flags::ENT, self.evaluate_next_trb),
                (flags::ISP, self.interrupt_on_short_packet),
                (flags::NS, self.no_snoop),
                (flags::CH, self.chain),
                (flags::IOC, self.interrupt_on_completion),
                (flags::IDT, self.immediate_data),
                (flags::BEI, self.block_event_interrupt),
            ],
        );
    }

    fn decode(trb: &Trb) -> Self {
        NormalTrb {
            data_buffer: trb.parameter(),
            transfer_length: bits::get(trb.status(), 0, LENGTH_WIDTH),
            td_size: bits::get(trb.status(), TD_SIZE_SHIFT, TD_SIZE_WIDTH) as u8,
            interrupter_target: interrupter_of(trb),
            evaluate_next_trb: flag(trb, flags::ENT),
            interrupt_on_short_packet: flag(trb, flags::ISP),
            no_snoop: flag(trb, flags::NS),
            chain: flag(trb, flags::CH),
            interrupt_on_completion: flag(trb, flags::IOC),
            immediate_data: flag(trb, flags::IDT),
            block_event_interrupt: flag(trb, flags::BEI),
        }
    }
}

/// Transfer Type field of a Setup Stage TRB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
#[repr(u8)]
pub enum TransferType {
    #[default]
    NoData = 0,
    Reserved = 1,
    OutData = 2,
    InData = 3,
}

/// Setup Stage TRB. The eight setup bytes are always immediate data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupStageTrb {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    /// Always 8 for a well formed setup stage.
    pub transfer_length: u32,
    pub interrupter_target: u16,
    pub interrupt_on_completion: bool,
    pub immediate_data: bool,
    pub transfer_type: TransferType,
}

impl Default for SetupStageTrb {
    fn default() -> Self {
        SetupStageTrb {
            request_type: 0,
            request: 0,
            value: 0,
            index: 0,
            length: 0,
            transfer_length: 8,
            interrupter_target: 0,
            interrupt_on_completion: false,
            immediate_data: true,
            transfer_type: TransferType::NoData,
        }
    }
}

impl TypedTrb for SetupStageTrb {
    const TYPE: TrbType = TrbType::SetupStage;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(
            self.request_type as u64
                | (self.request as u64) << 8
                | (self.value as u64) << 16
                | (self.index as u64) << 32
                | (self.length as u64) << 48,
        );
        trb.set_status(encode_status(
            self.transfer_length,
            0,
            self.interrupter_target,
        ));
        with_flags(
            trb,
            &[
                (flags::IOC, self.interrupt_on_completion),
                (flags::IDT, self.immediate_data),
            ],
        );
        trb.set_control(bits::set(
            trb.control(),
            16,
            2,
            self.transfer_type as u32,
        ));
    }

    fn decode(trb: &Trb) -> Self {
        let p = trb.parameter();
        SetupStageTrb {
            request_type: p as u8,
            request: (p >> 8) as u8,
            value: (p >> 16) as u16,
            index: (p >> 32) as u16,
            length: (p >> 48) as u16,
            transfer_length: bits::get(trb.status(), 0, LENGTH_WIDTH),
            interrupter_target: interrupter_of(trb),
            interrupt_on_completion: flag(trb, flags::IOC),
            immediate_data: flag(trb, flags::IDT),
            // Two bits always decode.
            transfer_type: TransferType::n(bits::get(trb.control(), 16, 2) as u8)
                .unwrap_or(TransferType::Reserved),
        }
    }
}

/// Data Stage TRB of a control transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataStageTrb {
    pub data_buffer: u64,
    pub transfer_length: u32,
    pub td_size: u8,
    pub interrupter_target: u16,
    pub evaluate_next_trb: bool,
    pub interrupt_on_short_packet: bool,
    pub no_snoop: bool,
    pub chain: bool,
    pub interrupt_on_completion: bool,
    pub immediate_data: bool,
    /// Device to host.
    pub direction_in: bool,
}

impl TypedTrb for DataStageTrb {
    const TYPE: TrbType = TrbType::DataStage;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.data_buffer);
        trb.set_status(encode_status(
            self.transfer_length,
            self.td_size,
            self.interrupter_target,
        ));
        with_flags(
            trb,
            &[
                (flags::ENT, self.evaluate_next_trb),
                (flags::ISP, self.interrupt_on_short_packet),
                (flags::NS, self.no_snoop),
                (flags::CH, self.chain),
                (flags::IOC, self.interrupt_on_completion),
                (flags::IDT, self.immediate_data),
                (DIR_BIT, self.direction_in),
            ],
        );
    }

    fn decode(trb: &Trb) -> Self {
        DataStageTrb {
            data_buffer: trb.parameter(),
            transfer_length: bits::get(trb.status(), 0, LENGTH_WIDTH),
            td_size: bits::get(trb.status(), TD_SIZE_SHIFT, TD_SIZE_WIDTH) as u8,
            interrupter_target: interrupter_of(trb),
            evaluate_next_trb: flag(trb, flags::ENT),
            interrupt_on_short_packet: flag(trb, flags::ISP),
            no_snoop: flag(trb, flags::NS),
            chain: flag(trb, flags::CH),
            interrupt_on_completion: flag(trb, flags::IOC),
            immediate_data: flag(trb, flags::IDT),
            direction_in: flag(trb, DIR_BIT),
        }
    }
}

/// Status Stage TRB of a control transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusStageTrb {
    pub interrupter_target: u16,
    pub evaluate_next_trb: bool,
    pub chain: bool,
    pub interrupt_on_completion: bool,
    pub direction_in: bool,
}

impl TypedTrb for StatusStageTrb {
    const TYPE: TrbType = TrbType::StatusStage;

    fn encode(&self, trb: &mut Trb) {
        trb.set_status(encode_status(0, 0, self.interrupter_target));
        with_flags(
            trb,
            &[
                (flags::ENT, self.evaluate_next_trb),
                (flags::CH, self.chain),
                (flags::IOC, self.interrupt_on_completion),
                (DIR_BIT, self.direction_in),
            ],
        );
    }

    fn decode(trb: &Trb) -> Self {
        StatusStageTrb {
            interrupter_target: interrupter_of(trb),
            evaluate_next_trb: flag(trb, flags::ENT),
            chain: flag(trb, flags::CH),
            interrupt_on_completion: flag(trb, flags::IOC),
            direction_in: flag(trb, DIR_BIT),
        }
    }
}

/// Isoch TRB, the first TRB of an isochronous TD.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsochTrb {
    pub data_buffer: u64,
    pub transfer_length: u32,
    pub td_size: u8,
    pub interrupter_target: u16,
    pub evaluate_next_trb: bool,
    pub interrupt_on_short_packet: bool,
    pub no_snoop: bool,
    pub chain: bool,
    pub interrupt_on_completion: bool,
    pub immediate_data: bool,
    /// 2 bits.
    pub transfer_burst_count: u8,
    pub block_event_interrupt: bool,
    /// 4 bits.
    pub transfer_last_burst_packet_count: u8,
    /// 11 bits.
    pub frame_id: u16,
    pub start_isoch_asap: bool,
}

impl TypedTrb for IsochTrb {
    const TYPE: TrbType = TrbType::Isoch;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.data_buffer);
        trb.set_status(encode_status(
            self.transfer_length,
            self.td_size,
            self.interrupter_target,
        ));
        with_flags(
            trb,
            &[
                (flags::ENT, self.evaluate_next_trb),
                (flags::ISP, self.interrupt_on_short_packet),
                (flags::NS, self.no_snoop),
                (flags::CH, self.chain),
                (flags::IOC, self.interrupt_on_completion),
                (flags::IDT, self.immediate_data),
                (flags::BEI, self.block_event_interrupt),
                (31, self.start_isoch_asap),
            ],
        );
        let control = bits::set(trb.control(), 7, 2, self.transfer_burst_count as u32);
        let control = bits::set(
            control,
            16,
            4,
            self.transfer_last_burst_packet_count as u32,
        );
        trb.set_control(bits::set(control, 20, 11, self.frame_id as u32));
    }

    fn decode(trb: &Trb) -> Self {
        IsochTrb {
            data_buffer: trb.parameter(),
            transfer_length: bits::get(trb.status(), 0, LENGTH_WIDTH),
            td_size: bits::get(trb.status(), TD_SIZE_SHIFT, TD_SIZE_WIDTH) as u8,
            interrupter_target: interrupter_of(trb),
            evaluate_next_trb: flag(trb, flags::ENT),
            interrupt_on_short_packet: flag(trb, flags::ISP),
            no_snoop: flag(trb, flags::NS),
            chain: flag(trb, flags::CH),
            interrupt_on_completion: flag(trb, flags::IOC),
            immediate_data: flag(trb, flags::IDT),
            transfer_burst_count: bits::get(trb.control(), 7, 2) as u8,
            block_event_interrupt: flag(trb, flags::BEI),
            transfer_last_burst_packet_count: bits::get(trb.control(), 16, 4) as u8,
            frame_id: bits::get(trb.control(), 20, 11) as u16,
            start_isoch_asap: flag(trb, 31),
        }
    }
}

/// Link TRB, the last slot of every command and transfer ring segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkTrb {
    /// Address of the next segment, 16-byte aligned. The low four bits are dropped.
    pub ring_segment_pointer: u64,
    pub interrupter_target: u16,
    pub toggle_cycle: bool,
    pub chain: bool,
    pub interrupt_on_completion: bool,
}

impl TypedTrb for LinkTrb {
    const TYPE: TrbType = TrbType::Link;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.ring_segment_pointer & !0xf);
        trb.set_status(encode_status(0, 0, self.interrupter_target));
        with_flags(
            trb,
            &[
                (TOGGLE_CYCLE_BIT, self.toggle_cycle),
                (flags::CH, self.chain),
                (flags::IOC, self.interrupt_on_completion),
            ],
        );
    }

    fn decode(trb: &Trb) -> Self {
        LinkTrb {
            ring_segment_pointer: trb.parameter() & !0xf,
            interrupter_target: interrupter_of(trb),
            toggle_cycle: flag(trb, TOGGLE_CYCLE_BIT),
            chain: flag(trb, flags::CH),
            interrupt_on_completion: flag(trb, flags::IOC),
        }
    }
}

/// Event Data TRB. Its parameter is reported verbatim in the Transfer Event it generates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventDataTrb {
    pub event_data: u64,
    pub interrupter_target: u16,
    pub evaluate_next_trb: bool,
    pub chain: bool,
    pub interrupt_on_completion: bool,
    pub block_event_interrupt: bool,
}

impl TypedTrb for EventDataTrb {
    const TYPE: TrbType = TrbType::EventData;

    fn encode(&self, trb: &mut Trb) {
        trb.set_parameter(self.event_data);
        trb.set_status(encode_status(0, 0, self.interrupter_target));
        with_flags(
            trb,
            &[
                (flags::ENT, self.evaluate_next_trb),
                (flags::CH, self.chain),
                (flags::IOC, self.interrupt_on_completion),
                (flags::BEI, self.block_event_interrupt),
            ],
        );
    }

    fn decode(trb: &Trb) -> Self {
        EventDataTrb {
            event_data: trb.parameter(),
            interrupter_target: interrupter_of(trb),
            evaluate_next_trb: flag(trb, flags::ENT),
            chain: flag(trb, flags::CH),
            interrupt_on_completion: flag(trb, flags::IOC),
            block_event_interrupt: flag(trb, flags::BEI),
        }
    }
}

/// No Op transfer TRB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoOpTrb {
    pub interrupter_target: u16,
    pub evaluate_next_trb: bool,
    pub chain: bool,
    pub interrupt_on_completion: bool,
}

impl TypedTrb for NoOpTrb {
    const TYPE: TrbType = TrbType::NoOp;

    fn encode(&self, trb: &mut Trb) {
        trb.set_status(encode_status(0, 0, self.interrupter_target));
        with_flags(
            trb,
            &[
                (flags::ENT, self.evaluate_next_trb),
                (flags::CH, self.chain),
                (flags::IOC, self.interrupt_on_completion),
            ],
        );
    }

    fn decode(trb: &Trb) -> Self {
        NoOpTrb {
            interrupter_target: interrupter_of(trb),
            evaluate_next_trb: flag(trb, flags::ENT),
            chain: flag(trb, flags::CH),
            interrupt_on_completion: flag(trb, flags::IOC),
        }
    }
}
