// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Controller register access.
//!
//! The rings only need a handful of registers: the doorbell array, CRCR, and the event ring
//! registers of each interrupter. Access goes through the `RegisterIo` trait so the MMIO
//! mapping stays outside this crate; `RegisterLayout` turns register names into offsets from
//! the start of the capability registers.

use log::debug;

use crate::bits;

pub const USB_CMD_RUNSTOP: u32 = 1 << 0;
pub const USB_CMD_RESET: u32 = 1 << 1;
pub const USB_CMD_INTERRUPTER_ENABLE: u32 = 1 << 2;

pub const USB_STS_HALTED: u32 = 1 << 0;
pub const USB_STS_HOST_SYSTEM_ERROR: u32 = 1 << 2;
pub const USB_STS_EVENT_INTERRUPT: u32 = 1 << 3;
pub const USB_STS_PORT_CHANGE_DETECT: u32 = 1 << 4;
pub const USB_STS_CONTROLLER_NOT_READY: u32 = 1 << 11;

pub const CRCR_RING_CYCLE_STATE: u64 = 1 << 0;
pub const CRCR_COMMAND_STOP: u64 = 1 << 1;
pub const CRCR_COMMAND_ABORT: u64 = 1 << 2;
pub const CRCR_COMMAND_RING_RUNNING: u64 = 1 << 3;
pub const CRCR_COMMAND_RING_POINTER: u64 = !0x3f;

pub const IMAN_INTERRUPT_PENDING: u32 = 1 << 0;
pub const IMAN_INTERRUPT_ENABLE: u32 = 1 << 1;

pub const ERDP_DEQUEUE_ERST_SEGMENT_INDEX: u64 = 0x7;
pub const ERDP_EVENT_HANDLER_BUSY: u64 = 1 << 3;
pub const ERDP_EVENT_RING_DEQUEUE_POINTER: u64 = !0xf;

pub const PORTSC_CURRENT_CONNECT_STATUS: u32 = 1 << 0;
pub const PORTSC_PORT_ENABLED: u32 = 1 << 1;
pub const PORTSC_OVER_CURRENT_ACTIVE: u32 = 1 << 3;
pub const PORTSC_PORT_RESET: u32 = 1 << 4;
pub const PORTSC_PORT_LINK_STATE_MASK: u32 = 0xf << 5;
pub const PORTSC_PORT_POWER: u32 = 1 << 9;
pub const PORTSC_PORT_SPEED_MASK: u32 = 0xf << 10;
pub const PORTSC_PORT_INDICATOR_MASK: u32 = 0x3 << 14;
pub const PORTSC_LINK_STATE_WRITE_STROBE: u32 = 1 << 16;
pub const PORTSC_CONNECT_STATUS_CHANGE: u32 = 1 << 17;
pub const PORTSC_PORT_ENABLED_DISABLED_CHANGE: u32 = 1 << 18;
pub const PORTSC_WARM_PORT_RESET_CHANGE: u32 = 1 << 19;
pub const PORTSC_OVER_CURRENT_CHANGE: u32 = 1 << 20;
pub const PORTSC_PORT_RESET_CHANGE: u32 = 1 << 21;
pub const PORTSC_PORT_LINK_STATE_CHANGE: u32 = 1 << 22;
pub const PORTSC_PORT_CONFIG_ERROR_CHANGE: u32 = 1 << 23;
pub const PORTSC_COLD_ATTACH_STATUS: u32 = 1 << 24;
pub const PORTSC_WAKE_ON_CONNECT: u32 = 1 << 25;
pub const PORTSC_WAKE_ON_DISCONNECT: u32 = 1 << 26;
pub const PORTSC_WAKE_ON_OVER_CURRENT: u32 = 1 << 27;
pub const PORTSC_DEVICE_REMOVABLE: u32 = 1 << 30;
pub const PORTSC_WARM_PORT_RESET: u32 = 1 << 31;

/// Every RW1C status change bit of PORTSC.
pub const PORTSC_CHANGE_BITS: u32 = PORTSC_CONNECT_STATUS_CHANGE
    | PORTSC_PORT_ENABLED_DISABLED_CHANGE
    | PORTSC_WARM_PORT_RESET_CHANGE
    | PORTSC_OVER_CURRENT_CHANGE
    | PORTSC_PORT_RESET_CHANGE
    | PORTSC_PORT_LINK_STATE_CHANGE
    | PORTSC_PORT_CONFIG_ERROR_CHANGE;

const PORTSC_READ_ONLY: u32 = PORTSC_CURRENT_CONNECT_STATUS
    | PORTSC_OVER_CURRENT_ACTIVE
    | PORTSC_PORT_SPEED_MASK
    | PORTSC_COLD_ATTACH_STATUS
    | PORTSC_DEVICE_REMOVABLE;

const PORTSC_READ_WRITE: u32 = PORTSC_PORT_LINK_STATE_MASK
    | PORTSC_PORT_POWER
    | PORTSC_PORT_INDICATOR_MASK
    | PORTSC_WAKE_ON_CONNECT
    | PORTSC_WAKE_ON_DISCONNECT
    | PORTSC_WAKE_ON_OVER_CURRENT;

// Capability register offsets.
const CAPLENGTH: u64 = 0x00;
const HCSPARAMS1: u64 = 0x04;
const HCSPARAMS2: u64 = 0x08;
const HCCPARAMS1: u64 = 0x10;
const DBOFF: u64 = 0x14;
const RTSOFF: u64 = 0x18;

// Operational register offsets, relative to CAPLENGTH.
const USBCMD: u64 = 0x00;
const USBSTS: u64 = 0x04;
const PAGESIZE: u64 = 0x08;
const DNCTRL: u64 = 0x14;
const CRCR: u64 = 0x18;
const DCBAAP: u64 = 0x30;
const CONFIG: u64 = 0x38;
const PORT_REGISTER_BASE: u64 = 0x400;
const PORT_REGISTER_STRIDE: u64 = 0x10;

// Interrupter register offsets, relative to the interrupter's register set.
const INTERRUPTER_BASE: u64 = 0x20;
const INTERRUPTER_STRIDE: u64 = 0x20;
const IMAN: u64 = 0x00;
const IMOD: u64 = 0x04;
const ERSTSZ: u64 = 0x08;
const ERSTBA: u64 = 0x10;
const ERDP: u64 = 0x18;

/// 32-bit access to the controller's MMIO space, offsets relative to the capability registers.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: u64) -> u32;
    fn write32(&self, offset: u64, value: u32);

    fn read64(&self, offset: u64) -> u64 {
        bits::join64(self.read32(offset), self.read32(offset + 4))
    }

    /// Writes the low dword first. The controller latches 64-bit registers on the high write.
    fn write64(&self, offset: u64, value: u64) {
        self.write32(offset, bits::lo32(value));
        self.write32(offset + 4, bits::hi32(value));
    }
}

/// Offsets of the register sets, from the capability registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterLayout {
    pub cap_length: u64,
    pub doorbell_offset: u64,
    pub runtime_offset: u64,
}

impl RegisterLayout {
    pub fn new(cap_length: u64, doorbell_offset: u64, runtime_offset: u64) -> RegisterLayout {
        RegisterLayout {
            cap_length,
            doorbell_offset,
            runtime_offset,
        }
    }

    /// Reads CAPLENGTH, DBOFF and RTSOFF.
    pub fn probe(io: &dyn RegisterIo) -> RegisterLayout {
        let layout = RegisterLayout::new(
            (io.read32(CAPLENGTH) & 0xff) as u64,
            (io.read32(DBOFF) & !0x3) as u64,
            (io.read32(RTSOFF) & !0x1f) as u64,
        );
        debug!("xhci register layout {:?}", layout);
        layout
    }

    pub fn usbcmd(&self) -> u64 {
        self.cap_length + USBCMD
    }

    pub fn usbsts(&self) -> u64 {
        self.cap_length + USBSTS
    }

    pub fn pagesize(&self) -> u64 {
        self.cap_length + PAGESIZE
    }

    pub fn dnctrl(&self) -> u64 {
        self.cap_length + DNCTRL
    }

    pub fn crcr(&self) -> u64 {
        self.cap_length + CRCR
    }

    pub fn dcbaap(&self) -> u64 {
        self.cap_length + DCBAAP
    }

    pub fn config(&self) -> u64 {
        self.cap_length + CONFIG
    }

    /// PORTSC of the 1-based root hub `port`. None for port 0.
    pub fn portsc(&self, port: u8) -> Option<u64> {
        let index = (port as u64).checked_sub(1)?;
        Some(self.cap_length + PORT_REGISTER_BASE + PORT_REGISTER_STRIDE * index)
    }

    fn interrupter(&self, interrupter: u16) -> u64 {
        self.runtime_offset + INTERRUPTER_BASE + INTERRUPTER_STRIDE * interrupter as u64
    }

    pub fn iman(&self, interrupter: u16) -> u64 {
        self.interrupter(interrupter) + IMAN
    }

    pub fn imod(&self, interrupter: u16) -> u64 {
        self.interrupter(interrupter) + IMOD
    }

    pub fn erstsz(&self, interrupter: u16) -> u64 {
        self.interrupter(interrupter) + ERSTSZ
    }

    pub fn erstba(&self, interrupter: u16) -> u64 {
        self.interrupter(interrupter) + ERSTBA
    }

    pub fn erdp(&self, interrupter: u16) -> u64 {
        self.interrupter(interrupter) + ERDP
    }

    /// Doorbell `index`: 0 is the host controller command doorbell, 1..=255 the device slots.
    pub fn doorbell(&self, index: u8) -> u64 {
        self.doorbell_offset + 4 * index as u64
    }
}

/// Value written to a device slot doorbell to kick endpoint `target` (a DCI) and `stream_id`.
pub fn doorbell_value(target: u8, stream_id: u16) -> u32 {
    (target as u32) | (stream_id as u32) << 16
}

/// Host controller limits decoded from the capability registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub hci_version: u16,
    pub max_slots: u8,
    pub max_interrupters: u16,
    pub max_ports: u8,
    /// ERST Max: the ERST may hold up to 2^erst_max entries.
    pub erst_max: u8,
    pub max_scratchpad_buffers: u16,
    pub addressing_64: bool,
    pub context_size_64: bool,
    /// Maximum Primary Stream Array Size: 2^(max_psa_size + 1) entries.
    pub max_psa_size: u8,
}

impl Capabilities {
    pub fn from_registers(
        caplength: u32,
        hcsparams1: u32,
        hcsparams2: u32,
        hccparams1: u32,
    ) -> Self {
        let scratchpad_hi = bits::get(hcsparams2, 21, 5);
        let scratchpad_lo = bits::get(hcsparams2, 27, 5);
        Capabilities {
            hci_version: (caplength >> 16) as u16,
            max_slots: bits::get(hcsparams1, 0, 8) as u8,
            max_interrupters: bits::get(hcsparams1, 8, 11) as u16,
            max_ports: bits::get(hcsparams1, 24, 8) as u8,
            erst_max: bits::get(hcsparams2, 4, 4) as u8,
            max_scratchpad_buffers: (scratchpad_hi << 5 | scratchpad_lo) as u16,
            addressing_64: bits::get_bit(hccparams1, 0),
            context_size_64: bits::get_bit(hccparams1, 2),
            max_psa_size: bits::get(hccparams1, 12, 4) as u8,
        }
    }

    pub fn probe(io: &dyn RegisterIo) -> Self {
        let caps = Capabilities::from_registers(
            io.read32(CAPLENGTH),
            io.read32(HCSPARAMS1),
            io.read32(HCSPARAMS2),
            io.read32(HCCPARAMS1),
        );
        debug!("xhci capabilities {:?}", caps);
        caps
    }

    /// Number of segments an event ring may use.
    pub fn max_event_ring_segments(&self) -> usize {
        1usize << self.erst_max
    }

    /// Size in bytes of one slot or endpoint context.
    pub fn context_size(&self) -> usize {
        if self.context_size_64 {
            64
        } else {
            32
        }
    }

    /// Entries in the largest primary stream context array, 0 if streams are unsupported.
    pub fn max_primary_streams(&self) -> usize {
        if self.max_psa_size == 0 {
            0
        } else {
            1usize << (self.max_psa_size + 1)
        }
    }
}

/// A snapshot of one PORTSC register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortStatus(pub u32);

impl PortStatus {
    pub fn read(io: &dyn RegisterIo, layout: &RegisterLayout, port: u8) -> Option<PortStatus> {
        layout.portsc(port).map(|offset| PortStatus(io.read32(offset)))
    }

    pub fn connected(&self) -> bool {
        self.0 & PORTSC_CURRENT_CONNECT_STATUS != 0
    }

    pub fn enabled(&self) -> bool {
        self.0 & PORTSC_PORT_ENABLED != 0
    }

    pub fn in_reset(&self) -> bool {
        self.0 & PORTSC_PORT_RESET != 0
    }

    pub fn powered(&self) -> bool {
        self.0 & PORTSC_PORT_POWER != 0
    }

    pub fn link_state(&self) -> u8 {
        bits::get(self.0, 5, 4) as u8
    }

    /// Protocol speed ID of the attached device.
    pub fn speed(&self) -> u8 {
        bits::get(self.0, 10, 4) as u8
    }

    /// Pending RW1C change bits.
    pub fn changes(&self) -> u32 {
        self.0 & PORTSC_CHANGE_BITS
    }

    /// The value that writes back no change at all: read-only bits kept, RW bits preserved,
    /// RW1C and RW1S bits zero.
    pub fn neutral(&self) -> u32 {
        self.0 & (PORTSC_READ_ONLY | PORTSC_READ_WRITE)
    }

    /// Write value acknowledging the change bits in `changes`.
    pub fn ack(&self, changes: u32) -> u32 {
        self.neutral() | (changes & PORTSC_CHANGE_BITS)
    }

    /// Write value starting a port reset.
    pub fn reset(&self) -> u32 {
        self.neutral() | PORTSC_PORT_RESET
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeRegisters {
        values: Mutex<HashMap<u64, u32>>,
        writes: Mutex<Vec<(u64, u32)>>,
    }

    impl RegisterIo for FakeRegisters {
        fn read32(&self, offset: u64) -> u32 {
            *self.values.lock().unwrap().get(&offset).unwrap_or(&0)
        }

        fn write32(&self, offset: u64, value: u32) {
            self.values.lock().unwrap().insert(offset, value);
            self.writes.lock().unwrap().push((offset, value));
        }
    }

    #[test]
    fn layout_offsets() {
        let regs = FakeRegisters::default();
        regs.write32(CAPLENGTH, 0x0120_0020);
        regs.write32(DBOFF, 0x2003);
        regs.write32(RTSOFF, 0x301f);
        let layout = RegisterLayout::probe(&regs);
        assert_eq!(layout, RegisterLayout::new(0x20, 0x2000, 0x3000));
        assert_eq!(layout.crcr(), 0x38);
        assert_eq!(layout.dcbaap(), 0x50);
        assert_eq!(layout.portsc(0), None);
        assert_eq!(layout.portsc(1), Some(0x420));
        assert_eq!(layout.portsc(3), Some(0x440));
        assert_eq!(layout.erstsz(0), 0x3028);
        assert_eq!(layout.erdp(1), 0x3058);
        assert_eq!(layout.doorbell(2), 0x2008);
    }

    #[test]
    fn write64_is_low_then_high() {
        let regs = FakeRegisters::default();
        regs.write64(0x18, 0x1_0000_0041);
        assert_eq!(
            *regs.writes.lock().unwrap(),
            vec![(0x18, 0x41), (0x1c, 0x1)]
        );
        assert_eq!(regs.read64(0x18), 0x1_0000_0041);
    }

    #[test]
    fn capabilities() {
        let caps = Capabilities::from_registers(
            0x0120_0020,
            4 << 24 | 8 << 8 | 32,
            1 << 27 | 3 << 4,
            1 << 2 | 1 | 7 << 12,
        );
        assert_eq!(caps.hci_version, 0x120);
        assert_eq!(caps.max_slots, 32);
        assert_eq!(caps.max_interrupters, 8);
        assert_eq!(caps.max_ports, 4);
        assert_eq!(caps.max_event_ring_segments(), 8);
        assert_eq!(caps.max_scratchpad_buffers, 1);
        assert_eq!(caps.context_size(), 64);
        assert_eq!(caps.max_primary_streams(), 256);
    }

    #[test]
    fn portsc_write_values() {
        let status = PortStatus(
            PORTSC_CURRENT_CONNECT_STATUS
                | PORTSC_PORT_ENABLED
                | PORTSC_PORT_POWER
                | 4 << 10
                | PORTSC_CONNECT_STATUS_CHANGE
                | PORTSC_PORT_RESET_CHANGE,
        );
        assert!(status.connected());
        assert_eq!(status.speed(), 4);
        // Writing PED back would disable the port.
        assert_eq!(status.neutral() & PORTSC_PORT_ENABLED, 0);
        assert_eq!(status.neutral() & PORTSC_CHANGE_BITS, 0);
        assert_eq!(
            status.ack(status.changes()) & PORTSC_CHANGE_BITS,
            PORTSC_CONNECT_STATUS_CHANGE | PORTSC_PORT_RESET_CHANGE
        );
        assert_ne!(status.reset() & PORTSC_PORT_RESET, 0);
        assert_ne!(status.reset() & PORTSC_PORT_POWER, 0);
    }

    #[test]
    fn doorbell_values() {
        assert_eq!(doorbell_value(3, 0), 3);
        assert_eq!(doorbell_value(5, 2), 0x2_0005);
    }
}
