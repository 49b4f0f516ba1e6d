// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

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
use crate::config::RingConfig;
use crate::memory::DmaMemory;
use crate::memory::PhysAddr;
use crate::regs::RegisterIo;
use crate::regs::RegisterLayout;
use crate::regs::CRCR_COMMAND_ABORT;
use crate::regs::CRCR_COMMAND_RING_RUNNING;
use crate::regs::CRCR_RING_CYCLE_STATE;
use crate::trb::AddressDeviceCommandTrb;
use crate::trb::CommandCompletionEventTrb;
use crate::trb::CompletionCode;
use crate::trb::ConfigureEndpointCommandTrb;
use crate::trb::DisableSlotCommandTrb;
use crate::trb::EnableSlotCommandTrb;
use crate::trb::EvaluateContextCommandTrb;
use crate::trb::ForceEventCommandTrb;
use crate::trb::ForceHeaderCommandTrb;
use crate::trb::GetExtendedPropertyCommandTrb;
use crate::trb::GetPortBandwidthCommandTrb;
use crate::trb::NegotiateBandwidthCommandTrb;
use crate::trb::NoOpCommandTrb;
use crate::trb::ResetDeviceCommandTrb;
use crate::trb::ResetEndpointCommandTrb;
use crate::trb::SetExtendedPropertyCommandTrb;
use crate::trb::SetLatencyToleranceValueCommandTrb;
use crate::trb::SetTrDequeuePointerCommandTrb;
use crate::trb::StopEndpointCommandTrb;
use crate::trb::TrbType;
use crate::trb::TypedTrb;

/// Result of one command as reported by its Command Completion Event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandCompletion {
    pub command: PhysAddr,
    pub completion_code: CompletionCode,
    pub slot_id: u8,
    pub vf_id: u8,
    pub parameter: u32,
}

impl From<CommandCompletionEventTrb> for CommandCompletion {
    fn from(event: CommandCompletionEventTrb) -> Self {
        CommandCompletion {
            command: PhysAddr(event.command_trb_pointer),
            completion_code: event.completion_code,
            slot_id: event.slot_id,
            vf_id: event.vf_id,
            parameter: event.completion_parameter,
        }
    }
}

/// The controller's single command ring.
///
/// Every `issue_*` call takes one slot, publishes the command and, unless the doorbell is
/// deferred, rings doorbell 0. The returned address identifies the command's completion.
pub struct CommandRing {
    ring: Ring,
    io: Arc<dyn RegisterIo>,
    layout: RegisterLayout,
    defer_doorbell: bool,
}

impl fmt::Display for CommandRing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "command ring")
    }
}

impl CommandRing {
    pub fn new(
        mem: DmaMemory,
        io: Arc<dyn RegisterIo>,
        layout: RegisterLayout,
        config: RingConfig,
    ) -> CommandRing {
        CommandRing {
            ring: Ring::new("command", RingKind::Command, mem, config),
            io,
            layout,
            defer_doorbell: false,
        }
    }

    /// Allocates the first segment and points CRCR at it. CRCR may only be written while the
    /// command ring is stopped.
    pub fn init(&mut self, capacity: Option<usize>) -> Result<()> {
        if self.io.read64(self.layout.crcr()) & CRCR_COMMAND_RING_RUNNING != 0 {
            return Err(Error::CommandRingRunning);
        }
        self.ring.init(capacity)?;
        let base = self.ring.base().ok_or(Error::WrongState(self.ring.state()))?;
        let cycle = if self.ring.cycle() {
            CRCR_RING_CYCLE_STATE
        } else {
            0
        };
        self.io.write64(self.layout.crcr(), base.0 | cycle);
        debug!("{}: crcr set to {}", self, base);
        Ok(())
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut Ring {
        &mut self.ring
    }

    /// While set, commands are published without ringing the doorbell; call `ring_doorbell`
    /// once the batch is queued.
    pub fn set_defer_doorbell(&mut self, defer: bool) {
        self.defer_doorbell = defer;
    }

    pub fn ring_doorbell(&self) {
        self.io.write32(self.layout.doorbell(0), 0);
    }

    /// Publishes any command record and returns the address of its TRB.
    pub fn issue<T: TypedTrb + fmt::Debug>(&mut self, command: &T) -> Result<PhysAddr> {
        if !T::TYPE.is_command() || T::TYPE == TrbType::Link {
            return Err(Error::WrongTrbType(T::TYPE));
        }
        let slot = self.ring.insert_empty_slot()?;
        self.ring.publish_typed(&slot, command)?;
        debug!("{}: {:?} at {}", self, command, slot.addr);
        if !self.defer_doorbell {
            self.ring_doorbell();
        }
        Ok(slot.addr)
    }

    pub fn issue_noop(&mut self) -> Result<PhysAddr> {
        self.issue(&NoOpCommandTrb {})
    }

    pub fn issue_enable_slot(&mut self, slot_type: u8) -> Result<PhysAddr> {
        self.issue(&EnableSlotCommandTrb { slot_type })
    }

    pub fn issue_disable_slot(&mut self, slot_id: u8) -> Result<PhysAddr> {
        self.issue(&DisableSlotCommandTrb { slot_id })
    }

    pub fn issue_address_device(
        &mut self,
        slot_id: u8,
        input_context: PhysAddr,
        block_set_address_request: bool,
    ) -> Result<PhysAddr> {
        self.issue(&AddressDeviceCommandTrb {
            input_context_pointer: input_context.0,
            block_set_address_request,
            slot_id,
        })
    }

    pub fn issue_configure_endpoint(
        &mut self,
        slot_id: u8,
        input_context: PhysAddr,
    ) -> Result<PhysAddr> {
        self.issue(&ConfigureEndpointCommandTrb {
            input_context_pointer: input_context.0,
            deconfigure: false,
            slot_id,
        })
    }

    /// Configure Endpoint with the Deconfigure flag: drops every endpoint but the default one.
    pub fn issue_deconfigure_endpoint(&mut self, slot_id: u8) -> Result<PhysAddr> {
        self.issue(&ConfigureEndpointCommandTrb {
            input_context_pointer: 0,
            deconfigure: true,
            slot_id,
        })
    }

    pub fn issue_evaluate_context(
        &mut self,
        slot_id: u8,
        input_context: PhysAddr,
    ) -> Result<PhysAddr> {
        self.issue(&EvaluateContextCommandTrb {
            input_context_pointer: input_context.0,
            slot_id,
        })
    }

    pub fn issue_reset_endpoint(
        &mut self,
        slot_id: u8,
        endpoint_id: u8,
        transfer_state_preserve: bool,
    ) -> Result<PhysAddr> {
        self.issue(&ResetEndpointCommandTrb {
            transfer_state_preserve,
            endpoint_id,
            slot_id,
        })
    }

    pub fn issue_stop_endpoint(
        &mut self,
        slot_id: u8,
        endpoint_id: u8,
        suspend: bool,
    ) -> Result<PhysAddr> {
        self.issue(&StopEndpointCommandTrb {
            endpoint_id,
            suspend,
            slot_id,
        })
    }

    /// Points an endpoint, or one of its streams, at `dequeue` with cycle state `cycle`.
    pub fn issue_set_tr_dequeue_pointer(
        &mut self,
        slot_id: u8,
        endpoint_id: u8,
        stream_id: u16,
        dequeue: PhysAddr,
        cycle: bool,
    ) -> Result<PhysAddr> {
        self.issue(&SetTrDequeuePointerCommandTrb {
            dequeue_cycle_state: cycle,
            stream_context_type: 0,
            dequeue_pointer: dequeue.0,
            stream_id,
            endpoint_id,
            slot_id,
        })
    }

    pub fn issue_reset_device(&mut self, slot_id: u8) -> Result<PhysAddr> {
        self.issue(&ResetDeviceCommandTrb { slot_id })
    }

    pub fn issue_force_event(&mut self, command: ForceEventCommandTrb) -> Result<PhysAddr> {
        self.issue(&command)
    }

    pub fn issue_negotiate_bandwidth(&mut self, slot_id: u8) -> Result<PhysAddr> {
        self.issue(&NegotiateBandwidthCommandTrb { slot_id })
    }

    pub fn issue_set_latency_tolerance_value(
        &mut self,
        best_effort_latency_tolerance: u16,
    ) -> Result<PhysAddr> {
        self.issue(&SetLatencyToleranceValueCommandTrb {
            best_effort_latency_tolerance,
        })
    }

    pub fn issue_get_port_bandwidth(
        &mut self,
        context: PhysAddr,
        dev_speed: u8,
        hub_slot_id: u8,
    ) -> Result<PhysAddr> {
        self.issue(&GetPortBandwidthCommandTrb {
            port_bandwidth_context_pointer: context.0,
            dev_speed,
            hub_slot_id,
        })
    }

    pub fn issue_force_header(&mut self, command: ForceHeaderCommandTrb) -> Result<PhysAddr> {
        self.issue(&command)
    }

    pub fn issue_get_extended_property(
        &mut self,
        command: GetExtendedPropertyCommandTrb,
    ) -> Result<PhysAddr> {
        self.issue(&command)
    }

    pub fn issue_set_extended_property(
        &mut self,
        command: SetExtendedPropertyCommandTrb,
    ) -> Result<PhysAddr> {
        self.issue(&command)
    }

    /// Waits for the completion of the command at `command` and retires its slot, along with
    /// every command issued before it. A command already retired by a later completion still
    /// gets its own event. On timeout the slot stays pending; the caller decides whether to
    /// abort.
    pub fn wait_for_completion(
        &mut self,
        events: &mut EventRing,
        command: PhysAddr,
        timeout: Option<Duration>,
    ) -> Result<CommandCompletion> {
        let timeout = timeout.unwrap_or_else(|| self.ring.config().command_timeout());
        let event = events.wait_for(&EventMatch::TrbAddress(command), timeout)?;
        let completion = CommandCompletion::from(
            event
                .parse::<CommandCompletionEventTrb>()
                .map_err(Error::Trb)?,
        );
        // The controller runs commands in order, so a later completion may already have
        // retired this one.
        match self.ring.is_pending(command) {
            Ok(true) => {
                if let Err(e) = self.ring.advance_dequeue(command, true) {
                    warn!("{}: cannot retire {}: {}", self, command, e);
                }
            }
            Ok(false) => debug!("{}: {} already retired", self, command),
            Err(e) => warn!("{}: completion for {} is not on this ring: {}", self, command, e),
        }
        if completion.completion_code.is_success() {
            debug!("{}: {} completed: {:?}", self, command, completion);
        } else {
            warn!("{}: {} failed with {:?}", self, command, completion.completion_code);
        }
        Ok(completion)
    }

    /// Issues `command`, rings the doorbell and waits for its completion.
    pub fn execute<T: TypedTrb + fmt::Debug>(
        &mut self,
        events: &mut EventRing,
        command: &T,
    ) -> Result<CommandCompletion> {
        let addr = self.issue(command)?;
        if self.defer_doorbell {
            self.ring_doorbell();
        }
        self.wait_for_completion(events, addr, None)
    }

    /// Aborts the command in progress through CRCR. The controller completes it with Command
    /// Aborted, if one was running, then reports Command Ring Stopped at the TRB it stopped on.
    /// Commands after that TRB stay queued until the doorbell is rung again.
    pub fn abort(
        &mut self,
        events: &mut EventRing,
        timeout: Option<Duration>,
    ) -> Result<CommandCompletion> {
        let timeout = timeout.unwrap_or_else(|| self.ring.config().command_timeout());
        self.io.write64(self.layout.crcr(), CRCR_COMMAND_ABORT);
        let event = events.wait_for(
            &EventMatch::Completion(CompletionCode::CommandRingStopped),
            timeout,
        )?;
        let stopped = CommandCompletion::from(
            event
                .parse::<CommandCompletionEventTrb>()
                .map_err(Error::Trb)?,
        );
        self.ring.sync_dequeue(stopped.command)?;
        debug!("{}: stopped at {}", self, stopped.command);
        Ok(stopped)
    }
}
