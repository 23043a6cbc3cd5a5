// Copyright 2026 The pcie-irq Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared legacy INTx interrupt lines.
//!
//! Every system interrupt id that at least one function's INTx pin is routed to gets exactly one
//! [`SharedLegacyLine`], registered with the platform as the dispatcher of that id. When the line
//! fires, the dispatcher polls every subscribed function and runs the handler of those that are
//! asserting their interrupt status bit.

use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use super::{Error, IrqMode, IrqReturn, Result};
use crate::config::{Command, Status};
use crate::device::{IrqState, PciDevice};
use crate::platform::{InterruptDispatch, Platform};

/// Definition for PCI INTx pins.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd)]
pub enum IntXPin {
    /// INTA
    IntA = 0x1,
    /// INTB
    IntB = 0x2,
    /// INTC
    IntC = 0x3,
    /// INTD
    IntD = 0x4,
}

impl IntXPin {
    /// Decode the content of the interrupt pin register. Zero means no pin.
    pub fn from_register(value: u8) -> Option<Self> {
        match value {
            0x1 => Some(IntXPin::IntA),
            0x2 => Some(IntXPin::IntB),
            0x3 => Some(IntXPin::IntC),
            0x4 => Some(IntXPin::IntD),
            _ => None,
        }
    }
}

/// Legacy interrupt routing of one function.
pub(crate) struct LegacyIrq {
    pin: IntXPin,
    line: Arc<SharedLegacyLine>,
}

impl LegacyIrq {
    pub(crate) fn new(pin: IntXPin, line: Arc<SharedLegacyLine>) -> Self {
        LegacyIrq { pin, line }
    }

    pub(crate) fn pin(&self) -> u8 {
        self.pin as u8
    }

    pub(crate) fn line(&self) -> &Arc<SharedLegacyLine> {
        &self.line
    }
}

/// A system interrupt line shared by the INTx pins of several functions.
pub struct SharedLegacyLine {
    irq_id: u32,
    platform: Arc<dyn Platform>,
    // Subscribed functions, in subscription order. Doubles as the dispatch lock.
    devices: spin::Mutex<Vec<Arc<PciDevice>>>,
}

impl SharedLegacyLine {
    /// Create the line and install it as the platform dispatcher of `irq_id`.
    ///
    /// The system interrupt is masked on return; it gets unmasked when the first function
    /// subscribes.
    pub(crate) fn create(irq_id: u32, platform: Arc<dyn Platform>) -> Result<Arc<Self>> {
        let line = Arc::new(SharedLegacyLine {
            irq_id,
            platform,
            devices: spin::Mutex::new(Vec::new()),
        });

        line.platform.mask_interrupt(irq_id);
        line.platform
            .register_interrupt_handler(irq_id, Some(line.clone()))
            .map_err(|e| {
                warn!(
                    "failed to register shared legacy IRQ handler for system IRQ {}: {}",
                    irq_id, e
                );
                Error::NoResources
            })?;

        Ok(line)
    }

    /// Return the system interrupt id of the line.
    pub fn irq_id(&self) -> u32 {
        self.irq_id
    }

    /// Return the number of subscribed functions.
    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    /// Subscribe `device`, disabled at the function level. The system interrupt is unmasked by
    /// the first subscription.
    pub(crate) fn add_device(&self, device: &Arc<PciDevice>) {
        let mut devices = self.devices.lock();

        debug_assert!(!devices.iter().any(|d| Arc::ptr_eq(d, device)));
        device.modify_command(Command::empty(), Command::INT_DISABLE);
        devices.push(device.clone());
        if devices.len() == 1 {
            self.platform.unmask_interrupt(self.irq_id);
        }
    }

    /// Unsubscribe `device`. The system interrupt is masked when the last function leaves.
    pub(crate) fn remove_device(&self, device: &PciDevice) {
        // Dropped after the list lock is released.
        let removed;
        {
            let mut devices = self.devices.lock();

            device.modify_command(Command::empty(), Command::INT_DISABLE);
            let pos = devices
                .iter()
                .position(|d| std::ptr::eq(Arc::as_ptr(d), device));
            debug_assert!(pos.is_some(), "{} not on IRQ {}", device.address(), self.irq_id);
            removed = pos.map(|pos| devices.remove(pos));

            if devices.is_empty() {
                self.platform.mask_interrupt(self.irq_id);
            }
        }
        drop(removed);
    }

    // Mask the system interrupt and unhook the line from the platform.
    fn release(&self) {
        debug_assert_eq!(self.device_count(), 0);
        self.platform.mask_interrupt(self.irq_id);
        if let Err(e) = self.platform.register_interrupt_handler(self.irq_id, None) {
            warn!(
                "failed to unregister shared legacy IRQ handler for system IRQ {}: {}",
                self.irq_id, e
            );
        }
    }
}

impl fmt::Debug for SharedLegacyLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // The subscriber list is left out; it is locked from interrupt context.
        f.debug_struct("SharedLegacyLine")
            .field("irq_id", &self.irq_id)
            .finish()
    }
}

impl InterruptDispatch for SharedLegacyLine {
    fn dispatch(&self) -> bool {
        let devices = self.devices.lock();

        if devices.is_empty() {
            warn!(
                "received legacy PCI INT (system IRQ {}), but there are no devices registered to \
                 handle this interrupt. This is bad. Disabling the interrupt at the system IRQ \
                 level.",
                self.irq_id
            );
            self.platform.mask_interrupt(self.irq_id);
            return false;
        }

        let mut reschedule = false;
        for device in devices.iter() {
            let (command, status) = device.read_command_status();
            if !status.contains(Status::INT_STATUS) || command.contains(Command::INT_DISABLE) {
                continue;
            }

            let ret = {
                let mut slot = device.legacy_slot().lock();
                let ret = match slot.handler.as_deref() {
                    Some(handler) if !slot.masked => handler.handle(device, 0),
                    Some(_) => IrqReturn::MASK,
                    None => {
                        warn!(
                            "received legacy PCI INT (system IRQ {}) for {}, but no handler \
                             is registered. Disabling the interrupt at the device level.",
                            self.irq_id,
                            device.address()
                        );
                        IrqReturn::MASK
                    }
                };
                if ret.contains(IrqReturn::MASK) {
                    slot.masked = true;
                }
                ret
            };

            if ret.contains(IrqReturn::MASK) {
                device.modify_command(Command::empty(), Command::INT_DISABLE);
            }
            reschedule |= ret.contains(IrqReturn::RESCHEDULE);
        }

        reschedule
    }
}

/// Bus wide registry of the shared legacy lines, keyed by system interrupt id.
pub struct LegacyLineRegistry {
    platform: Arc<dyn Platform>,
    lines: Mutex<Vec<Arc<SharedLegacyLine>>>,
}

impl LegacyLineRegistry {
    /// Create an empty registry.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        LegacyLineRegistry {
            platform,
            lines: Mutex::new(Vec::new()),
        }
    }

    /// Return the line of `irq_id`, creating it on first use.
    ///
    /// Must not be called with any device lock held.
    pub fn find_or_create(&self, irq_id: u32) -> Result<Arc<SharedLegacyLine>> {
        // Safe to unwrap because there's no legal way to break the mutex.
        let mut lines = self.lines.lock().unwrap();

        if let Some(line) = lines.iter().find(|line| line.irq_id() == irq_id) {
            return Ok(line.clone());
        }

        let line = SharedLegacyLine::create(irq_id, self.platform.clone())?;
        lines.try_reserve(1).map_err(|_| {
            line.release();
            Error::OutOfMemory
        })?;
        lines.push(line.clone());
        debug!("created shared legacy line for system IRQ {}", irq_id);

        Ok(line)
    }

    /// Return the number of lines created so far.
    pub fn len(&self) -> usize {
        // Safe to unwrap because there's no legal way to break the mutex.
        self.lines.lock().unwrap().len()
    }

    /// Whether no line was created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unhook every line from the platform. Every function must have left legacy mode already.
    pub fn shutdown(self) {
        // Safe to unwrap because there's no legal way to break the mutex.
        let lines = self.lines.into_inner().unwrap();

        for line in lines {
            let count = line.device_count();
            if count != 0 {
                warn!(
                    "shutting down system IRQ {} with {} device(s) still subscribed",
                    line.irq_id(),
                    count
                );
            }
            line.release();
        }
    }
}

/// Enter legacy mode. Only a single vector can be requested.
pub(crate) fn enter(device: &Arc<PciDevice>, state: &mut IrqState, requested: u32) -> Result<()> {
    let legacy = match device.legacy() {
        Some(legacy) if requested == 1 => legacy,
        _ => return Err(Error::NotSupported),
    };

    state.vectors.allocate(1)?;
    state.mode = IrqMode::Legacy;
    legacy.line().add_device(device);

    Ok(())
}

/// Leave legacy mode. The function ends up masked and off its line.
pub(crate) fn leave(device: &PciDevice, state: &mut IrqState) {
    if let Err(e) = mask_unmask(device, state, true) {
        debug!("{}: failed to mask legacy IRQ: {}", device.address(), e);
    }
    if let Some(legacy) = device.legacy() {
        legacy.line().remove_device(device);
    }
    state.reset_bookkeeping();
}

/// Mask or unmask the legacy interrupt of the function.
///
/// The interrupt is disabled at the function before the slot is marked masked, and the slot is
/// marked unmasked before the interrupt is enabled at the function.
pub(crate) fn mask_unmask(device: &PciDevice, state: &IrqState, mask: bool) -> Result<()> {
    let slot = state.vectors.get(0).ok_or(Error::InvalidArgs)?;

    if mask {
        device.modify_command(Command::empty(), Command::INT_DISABLE);
        slot.lock().masked = true;
    } else {
        slot.lock().masked = false;
        device.modify_command(Command::INT_DISABLE, Command::empty());
    }

    Ok(())
}
