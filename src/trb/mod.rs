// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Transfer Request Blocks.
//!
//! `Trb` is the raw 16-byte descriptor as it sits in ring memory. Every TRB type has a typed
//! record in one of the submodules which encodes to and decodes from the raw form through the
//! `TypedTrb` trait. Typed records never carry the cycle bit: ownership is decided by the ring
//! that publishes the descriptor, see `Trb::finalize` and `DmaMemory::publish_trb`.

mod command;
mod event;
mod transfer;

use std::fmt;
use std::fmt::Display;
use std::sync::atomic::compiler_fence;
use std::sync::atomic::Ordering;

use enumn::N;
use remain::sorted;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub use self::command::*;
pub use self::event::*;
pub use self::transfer::*;
use crate::bits;
use crate::memory::PhysAddr;

/// Size of every TRB in bytes.
pub const TRB_SIZE: usize = 16;
/// TRBs, segments and every pointer to them are aligned to this.
pub const TRB_ALIGNMENT: u64 = 16;
/// Byte offset of the control dword, the one holding the cycle bit.
pub const TRB_CONTROL_OFFSET: u64 = 12;

const CYCLE_BIT: u32 = 0;
const EVALUATE_NEXT_BIT: u32 = 1;
const CHAIN_BIT: u32 = 4;
const IOC_BIT: u32 = 5;
const TYPE_SHIFT: u32 = 10;
const TYPE_WIDTH: u32 = 6;
const ENDPOINT_SHIFT: u32 = 16;
const ENDPOINT_WIDTH: u32 = 5;
const SLOT_SHIFT: u32 = 24;
const SLOT_WIDTH: u32 = 8;
const COMPLETION_CODE_SHIFT: u32 = 24;

#[sorted]
#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    #[error("expected a {expected:?} trb but found {found}")]
    TypeMismatch { expected: TrbType, found: u8 },
    #[error("unknown trb type {0}")]
    UnknownType(u8),
}

pub type Result<T> = std::result::Result<T, Error>;

/// TRB type tags, xHCI 1.2 table 6-91.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, N)]
#[repr(u8)]
pub enum TrbType {
    Reserved = 0,
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Isoch = 5,
    Link = 6,
    EventData = 7,
    NoOp = 8,
    EnableSlotCommand = 9,
    DisableSlotCommand = 10,
    AddressDeviceCommand = 11,
    ConfigureEndpointCommand = 12,
    EvaluateContextCommand = 13,
    ResetEndpointCommand = 14,
    StopEndpointCommand = 15,
    SetTrDequeuePointerCommand = 16,
    ResetDeviceCommand = 17,
    ForceEventCommand = 18,
    NegotiateBandwidthCommand = 19,
    SetLatencyToleranceValueCommand = 20,
    GetPortBandwidthCommand = 21,
    ForceHeaderCommand = 22,
    NoOpCommand = 23,
    GetExtendedPropertyCommand = 24,
    SetExtendedPropertyCommand = 25,
    TransferEvent = 32,
    CommandCompletionEvent = 33,
    PortStatusChangeEvent = 34,
    BandwidthRequestEvent = 35,
    DoorbellEvent = 36,
    HostControllerEvent = 37,
    DeviceNotificationEvent = 38,
    MfindexWrapEvent = 39,
}

impl TrbType {
    /// Decodes a raw type tag.
    pub fn from_raw(raw: u8) -> Result<TrbType> {
        TrbType::n(raw).ok_or(Error::UnknownType(raw))
    }

    /// Types software may place on a transfer ring.
    pub fn is_transfer(self) -> bool {
        matches!(
            self,
            TrbType::Normal
                | TrbType::SetupStage
                | TrbType::DataStage
                | TrbType::StatusStage
                | TrbType::Isoch
                | TrbType::Link
                | TrbType::EventData
                | TrbType::NoOp
        )
    }

    /// Types software may place on the command ring (Link included).
    pub fn is_command(self) -> bool {
        self == TrbType::Link
            || (TrbType::EnableSlotCommand as u8..=TrbType::SetExtendedPropertyCommand as u8)
                .contains(&(self as u8))
    }

    /// Types the controller writes to an event ring.
    pub fn is_event(self) -> bool {
        (TrbType::TransferEvent as u8..=TrbType::MfindexWrapEvent as u8).contains(&(self as u8))
    }

    /// Types whose control dword carries the chain bit (bit 4).
    pub fn has_chain_bit(self) -> bool {
        matches!(
            self,
            TrbType::Normal
                | TrbType::DataStage
                | TrbType::StatusStage
                | TrbType::Isoch
                | TrbType::Link
                | TrbType::EventData
                | TrbType::NoOp
        )
    }
}

/// Completion codes reported in event TRBs, xHCI 1.2 table 6-90.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompletionCode {
    #[default]
    Invalid,
    Success,
    DataBufferError,
    BabbleDetectedError,
    UsbTransactionError,
    TrbError,
    StallError,
    ResourceError,
    BandwidthError,
    NoSlotsAvailableError,
    InvalidStreamTypeError,
    SlotNotEnabledError,
    EndpointNotEnabledError,
    ShortPacket,
    RingUnderrun,
    RingOverrun,
    VfEventRingFullError,
    ParameterError,
    BandwidthOverrunError,
    ContextStateError,
    NoPingResponseError,
    EventRingFullError,
    IncompatibleDeviceError,
    MissedServiceError,
    CommandRingStopped,
    CommandAborted,
    Stopped,
    StoppedLengthInvalid,
    StoppedShortPacket,
    MaxExitLatencyTooLargeError,
    IsochBufferOverrun,
    EventLostError,
    UndefinedError,
    InvalidStreamIdError,
    SecondaryBandwidthError,
    SplitTransactionError,
    /// Codes 192..=223.
    VendorError(u8),
    /// Codes 224..=255.
    VendorInfo(u8),
    /// Codes 37..=191, reserved in xHCI 1.2.
    Reserved(u8),
}

const COMPLETION_CODES: [CompletionCode; 37] = [
    CompletionCode::Invalid,
    CompletionCode::Success,
    CompletionCode::DataBufferError,
    CompletionCode::BabbleDetectedError,
    CompletionCode::UsbTransactionError,
    CompletionCode::TrbError,
    CompletionCode::StallError,
    CompletionCode::ResourceError,
    CompletionCode::BandwidthError,
    CompletionCode::NoSlotsAvailableError,
    CompletionCode::InvalidStreamTypeError,
    CompletionCode::SlotNotEnabledError,
    CompletionCode::EndpointNotEnabledError,
    CompletionCode::ShortPacket,
    CompletionCode::RingUnderrun,
    CompletionCode::RingOverrun,
    CompletionCode::VfEventRingFullError,
    CompletionCode::ParameterError,
    CompletionCode::BandwidthOverrunError,
    CompletionCode::ContextStateError,
    CompletionCode::NoPingResponseError,
    CompletionCode::EventRingFullError,
    CompletionCode::IncompatibleDeviceError,
    CompletionCode::MissedServiceError,
    CompletionCode::CommandRingStopped,
    CompletionCode::CommandAborted,
    CompletionCode::Stopped,
    CompletionCode::StoppedLengthInvalid,
    CompletionCode::StoppedShortPacket,
    CompletionCode::MaxExitLatencyTooLargeError,
    CompletionCode::Reserved(30),
    CompletionCode::IsochBufferOverrun,
    CompletionCode::EventLostError,
    CompletionCode::UndefinedError,
    CompletionCode::InvalidStreamIdError,
    CompletionCode::SecondaryBandwidthError,
    CompletionCode::SplitTransactionError,
];

impl CompletionCode {
    pub fn is_success(self) -> bool {
        self == CompletionCode::Success
    }

    /// Short packets end a transfer early but are not failures on their own.
    pub fn is_short_packet(self) -> bool {
        matches!(
            self,
            CompletionCode::ShortPacket | CompletionCode::StoppedShortPacket
        )
    }

    /// True for every code that reports a failed operation. Stop and abort notifications and
    /// vendor informational codes are not errors.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            CompletionCode::Success
                | CompletionCode::ShortPacket
                | CompletionCode::StoppedShortPacket
                | CompletionCode::Stopped
                | CompletionCode::StoppedLengthInvalid
                | CompletionCode::CommandRingStopped
                | CompletionCode::CommandAborted
                | CompletionCode::VendorInfo(_)
        )
    }
}

impl From<u8> for CompletionCode {
    fn from(raw: u8) -> Self {
        match raw {
            0..=36 => COMPLETION_CODES[raw as usize],
            192..=223 => CompletionCode::VendorError(raw),
            224..=255 => CompletionCode::VendorInfo(raw),
            _ => CompletionCode::Reserved(raw),
        }
    }
}

impl From<CompletionCode> for u8 {
    fn from(code: CompletionCode) -> u8 {
        match code {
            CompletionCode::VendorError(raw)
            | CompletionCode::VendorInfo(raw)
            | CompletionCode::Reserved(raw) => raw,
            code => COMPLETION_CODES
                .iter()
                .position(|c| *c == code)
                .map_or(0, |i| i as u8),
        }
    }
}

/// A raw TRB as laid out in memory: a 64-bit parameter, a status dword and a control dword.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Trb {
    parameter: u64,
    status: u32,
    control: u32,
}

impl Trb {
    pub fn new(parameter: u64, status: u32, control: u32) -> Trb {
        Trb {
            parameter,
            status,
            control,
        }
    }

    pub fn from_dwords(dwords: [u32; 4]) -> Trb {
        Trb::new(bits::join64(dwords[0], dwords[1]), dwords[2], dwords[3])
    }

    pub fn dwords(&self) -> [u32; 4] {
        [
            bits::lo32(self.parameter),
            bits::hi32(self.parameter),
            self.status,
            self.control,
        ]
    }

    pub fn parameter(&self) -> u64 {
        self.parameter
    }

    pub fn set_parameter(&mut self, parameter: u64) {
        self.parameter = parameter;
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn set_status(&mut self, status: u32) {
        self.status = status;
    }

    pub fn control(&self) -> u32 {
        self.control
    }

    pub fn set_control(&mut self, control: u32) {
        self.control = control;
    }

    pub fn cycle(&self) -> bool {
        bits::get_bit(self.control, CYCLE_BIT)
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        self.control = bits::set_bit(self.control, CYCLE_BIT, cycle);
    }

    pub fn evaluate_next_trb(&self) -> bool {
        bits::get_bit(self.control, EVALUATE_NEXT_BIT)
    }

    /// The 6-bit type tag exactly as stored.
    pub fn trb_type_raw(&self) -> u8 {
        bits::get(self.control, TYPE_SHIFT, TYPE_WIDTH) as u8
    }

    pub fn trb_type(&self) -> Result<TrbType> {
        TrbType::from_raw(self.trb_type_raw())
    }

    pub fn set_trb_type(&mut self, trb_type: TrbType) {
        self.control = bits::set(self.control, TYPE_SHIFT, TYPE_WIDTH, trb_type as u32);
    }

    /// True for the empty slot sentinel: every field zero, the cycle bit ignored.
    pub fn is_empty(&self) -> bool {
        self.parameter == 0 && self.status == 0 && self.control & !(1 << CYCLE_BIT) == 0
    }

    /// Writes the type tag and then the cycle bit. The cycle bit is always the last field
    /// touched; publishing to shared memory keeps the same order through
    /// `DmaMemory::publish_trb`.
    pub fn finalize(&mut self, trb_type: TrbType, cycle: bool) {
        self.set_trb_type(trb_type);
        compiler_fence(Ordering::Release);
        self.set_cycle(cycle);
    }

    /// Encodes `fields`. The cycle bit is left clear.
    pub fn build<T: TypedTrb>(fields: &T) -> Trb {
        fields.to_trb()
    }

    /// Decodes this TRB as `T`, failing if the stored type tag is not `T::TYPE`.
    pub fn parse<T: TypedTrb>(&self) -> Result<T> {
        T::from_trb(self)
    }

    /// Chain bit, for the types that have one.
    pub fn chain(&self) -> bool {
        self.trb_type().map_or(false, TrbType::has_chain_bit)
            && bits::get_bit(self.control, CHAIN_BIT)
    }

    /// Sets the chain bit. Returns false without touching the TRB if its type has no chain bit.
    pub fn set_chain(&mut self, chain: bool) -> bool {
        if !self.trb_type().map_or(false, TrbType::has_chain_bit) {
            return false;
        }
        self.control = bits::set_bit(self.control, CHAIN_BIT, chain);
        true
    }

    /// Interrupt on completion, for transfer and link TRBs.
    pub fn interrupt_on_completion(&self) -> bool {
        self.trb_type().map_or(false, TrbType::is_transfer) && bits::get_bit(self.control, IOC_BIT)
    }

    /// Sets interrupt on completion. Returns false if the type has no such flag.
    pub fn set_interrupt_on_completion(&mut self, ioc: bool) -> bool {
        if !self.trb_type().map_or(false, TrbType::is_transfer) {
            return false;
        }
        self.control = bits::set_bit(self.control, IOC_BIT, ioc);
        true
    }

    /// Slot id field of command and event TRBs.
    pub fn slot_id(&self) -> u8 {
        bits::get(self.control, SLOT_SHIFT, SLOT_WIDTH) as u8
    }

    /// Endpoint id field of command and event TRBs.
    pub fn endpoint_id(&self) -> u8 {
        bits::get(self.control, ENDPOINT_SHIFT, ENDPOINT_WIDTH) as u8
    }

    /// Completion code of an event TRB.
    pub fn completion_code(&self) -> Option<CompletionCode> {
        match self.trb_type() {
            Ok(t) if t.is_event() => Some(CompletionCode::from(
                bits::get(self.status, COMPLETION_CODE_SHIFT, 8) as u8,
            )),
            _ => None,
        }
    }

    /// The TRB an event reports on: the command TRB of a Command Completion Event, or the
    /// transfer TRB of a Transfer Event that does not carry Event Data.
    pub fn event_trb_pointer(&self) -> Option<PhysAddr> {
        match self.trb_type() {
            Ok(TrbType::CommandCompletionEvent) => Some(PhysAddr(self.parameter & !0xf)),
            Ok(TrbType::TransferEvent) if !bits::get_bit(self.control, 2) => {
                Some(PhysAddr(self.parameter))
            }
            _ => None,
        }
    }

    /// Human readable rendering of the typed record, used by trace logs and ring dumps.
    pub fn describe(&self) -> String {
        let t = match self.trb_type() {
            Ok(t) => t,
            Err(_) => return format!("unknown type {} {:08x?}", self.trb_type_raw(), self.dwords()),
        };
        let fields = match t {
            TrbType::Reserved => format!("{:08x?}", self.dwords()),
            TrbType::Normal => format!("{:?}", NormalTrb::decode(self)),
            TrbType::SetupStage => format!("{:?}", SetupStageTrb::decode(self)),
            TrbType::DataStage => format!("{:?}", DataStageTrb::decode(self)),
            TrbType::StatusStage => format!("{:?}", StatusStageTrb::decode(self)),
            TrbType::Isoch => format!("{:?}", IsochTrb::decode(self)),
            TrbType::Link => format!("{:?}", LinkTrb::decode(self)),
            TrbType::EventData => format!("{:?}", EventDataTrb::decode(self)),
            TrbType::NoOp => format!("{:?}", NoOpTrb::decode(self)),
            TrbType::EnableSlotCommand => format!("{:?}", EnableSlotCommandTrb::decode(self)),
            TrbType::DisableSlotCommand => format!("{:?}", DisableSlotCommandTrb::decode(self)),
            TrbType::AddressDeviceCommand => {
                format!("{:?}", AddressDeviceCommandTrb::decode(self))
            }
            TrbType::ConfigureEndpointCommand => {
                format!("{:?}", ConfigureEndpointCommandTrb::decode(self))
            }
            TrbType::EvaluateContextCommand => {
                format!("{:?}", EvaluateContextCommandTrb::decode(self))
            }
            TrbType::ResetEndpointCommand => {
                format!("{:?}", ResetEndpointCommandTrb::decode(self))
            }
            TrbType::StopEndpointCommand => format!("{:?}", StopEndpointCommandTrb::decode(self)),
            TrbType::SetTrDequeuePointerCommand => {
                format!("{:?}", SetTrDequeuePointerCommandTrb::decode(self))
            }
            TrbType::ResetDeviceCommand => format!("{:?}", ResetDeviceCommandTrb::decode(self)),
            TrbType::ForceEventCommand => format!("{:?}", ForceEventCommandTrb::decode(self)),
            TrbType::NegotiateBandwidthCommand => {
                format!("{:?}", NegotiateBandwidthCommandTrb::decode(self))
            }
            TrbType::SetLatencyToleranceValueCommand => {
                format!("{:?}", SetLatencyToleranceValueCommandTrb::decode(self))
            }
            TrbType::GetPortBandwidthCommand => {
                format!("{:?}", GetPortBandwidthCommandTrb::decode(self))
            }
            TrbType::ForceHeaderCommand => format!("{:?}", ForceHeaderCommandTrb::decode(self)),
            TrbType::NoOpCommand => format!("{:?}", NoOpCommandTrb::decode(self)),
            TrbType::GetExtendedPropertyCommand => {
                format!("{:?}", GetExtendedPropertyCommandTrb::decode(self))
            }
            TrbType::SetExtendedPropertyCommand => {
                format!("{:?}", SetExtendedPropertyCommandTrb::decode(self))
            }
            TrbType::TransferEvent => format!("{:?}", TransferEventTrb::decode(self)),
            TrbType::CommandCompletionEvent => {
                format!("{:?}", CommandCompletionEventTrb::decode(self))
            }
            TrbType::PortStatusChangeEvent => {
                format!("{:?}", PortStatusChangeEventTrb::decode(self))
            }
            TrbType::BandwidthRequestEvent => {
                format!("{:?}", BandwidthRequestEventTrb::decode(self))
            }
            TrbType::DoorbellEvent => format!("{:?}", DoorbellEventTrb::decode(self)),
            TrbType::HostControllerEvent => format!("{:?}", HostControllerEventTrb::decode(self)),
            TrbType::DeviceNotificationEvent => {
                format!("{:?}", DeviceNotificationEventTrb::decode(self))
            }
            TrbType::MfindexWrapEvent => format!("{:?}", MfindexWrapEventTrb::decode(self)),
        };
        format!("c={} {}", self.cycle() as u8, fields)
    }
}

impl fmt::Debug for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Trb({:08x?})", self.dwords())
    }
}

impl Display for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// A typed view of one TRB type.
pub trait TypedTrb: Sized {
    const TYPE: TrbType;

    /// Writes this record's fields into `trb`. The type tag and cycle bit are handled by
    /// `to_trb`. Fields wider than their wire encoding are truncated to it.
    fn encode(&self, trb: &mut Trb);

    /// Reads the record's fields without checking the type tag.
    fn decode(trb: &Trb) -> Self;

    fn to_trb(&self) -> Trb {
        let mut trb = Trb::default();
        self.encode(&mut trb);
        trb.set_trb_type(Self::TYPE);
        trb.set_cycle(false);
        trb
    }

    fn from_trb(trb: &Trb) -> Result<Self> {
        let found = trb.trb_type_raw();
        if found != Self::TYPE as u8 {
            return Err(Error::TypeMismatch {
                expected: Self::TYPE,
                found,
            });
        }
        Ok(Self::decode(trb))
    }
}

// Flag bits shared by the control dword of most TRB types.
pub(crate) mod flags {
    pub const ENT: u32 = 1;
    pub const ISP: u32 = 2;
    pub const NS: u32 = 3;
    pub const CH: u32 = 4;
    pub const IOC: u32 = 5;
    pub const IDT: u32 = 6;
    pub const BEI: u32 = 9;
}
