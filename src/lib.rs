// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Driver side of the xHCI descriptor ring protocol.
//!
//! The crate encodes and decodes TRBs (`trb`), manages the multi-segment rings the driver shares
//! with the controller (`ring`: command, transfer and event rings), and maintains the device,
//! endpoint and stream contexts the controller reads to find those rings (`context`).
//!
//! All structures live in a `memory::DmaMemory` region addressed by physical address, and the
//! controller is reached only through the `regs::RegisterIo` trait, so the same code drives real
//! hardware or a software model of it.

mod bits;
pub mod config;
pub mod context;
pub mod memory;
pub mod regs;
pub mod ring;
pub mod trb;

pub use config::RingConfig;
pub use memory::DmaBuffer;
pub use memory::DmaMemory;
pub use memory::PhysAddr;
pub use ring::CommandRing;
pub use ring::EventRing;
pub use ring::TransferRing;
pub use trb::Trb;
