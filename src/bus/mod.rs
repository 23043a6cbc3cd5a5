// Copyright 2026 The pcie-irq Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Discovery of PCI functions and the bus wide interrupt state.
//!
//! A [`PciBus`] is the place where functions found by the enumeration code are turned into
//! [`PciDevice`] objects. Every bus owns the registry of shared legacy lines its functions'
//! INTx pins are routed to.

mod address;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::config::{self, Command, ConfigSpace, PCI_CFG_INTERRUPT_PIN};
use crate::device::PciDevice;
use crate::interrupt::legacy::{IntXPin, LegacyIrq, LegacyLineRegistry};
use crate::interrupt::msi::MsiCapability;
use crate::interrupt::{Error, Result};
use crate::platform::Platform;

pub use address::{PciAddress, PCI_MAX_DEVICES_PER_BUS, PCI_MAX_FUNCTIONS_PER_DEVICE};

/// A PCI bus segment and the functions discovered on it.
pub struct PciBus {
    platform: Arc<dyn Platform>,
    legacy_lines: LegacyLineRegistry,
    devices: Mutex<BTreeMap<PciAddress, Weak<PciDevice>>>,
}

impl PciBus {
    /// Create a bus without functions.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        PciBus {
            legacy_lines: LegacyLineRegistry::new(platform.clone()),
            platform,
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Return the platform the bus delivers interrupts through.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Return the registry of the shared legacy lines of the bus.
    pub fn legacy_lines(&self) -> &LegacyLineRegistry {
        &self.legacy_lines
    }

    /// Set up the interrupt state of a newly discovered function.
    ///
    /// The function's INTx pin is disabled and, if it has one, routed to the shared legacy line
    /// of its system interrupt. The function starts in [`IrqMode::Disabled`].
    ///
    /// # Arguments
    /// * `address`: location of the function
    /// * `config`: access to the function's configuration space
    /// * `msi_cap_offset`: offset of the MSI capability structure, if the function has one
    ///
    /// Fails with [`Error::InvalidArgs`] if `msi_cap_offset` does not locate a well formed MSI
    /// capability, and with [`Error::BadState`] if a live function is already registered at
    /// `address`.
    ///
    /// [`IrqMode::Disabled`]: ../interrupt/enum.IrqMode.html#variant.Disabled
    /// [`Error::InvalidArgs`]: ../interrupt/enum.Error.html#variant.InvalidArgs
    /// [`Error::BadState`]: ../interrupt/enum.Error.html#variant.BadState
    pub fn add_device(
        &self,
        address: PciAddress,
        config: Arc<dyn ConfigSpace>,
        msi_cap_offset: Option<u16>,
    ) -> Result<Arc<PciDevice>> {
        // Safe to unwrap because there's no legal way to break the mutex.
        let mut devices = self.devices.lock().unwrap();
        if devices
            .get(&address)
            .map_or(false, |device| device.strong_count() > 0)
        {
            warn!("{}: function registered twice", address);
            return Err(Error::BadState);
        }

        // Nobody else knows about the function yet, so the register lock is not needed.
        config::modify_command(&*config, Command::empty(), Command::INT_DISABLE);

        let msi = match msi_cap_offset {
            Some(offset) => {
                let cap = MsiCapability::read(&*config, offset).map_err(|e| {
                    warn!("{}: no usable MSI capability at {:#x}", address, offset);
                    e
                })?;
                Some(cap)
            }
            None => None,
        };

        let pin = config.read8(PCI_CFG_INTERRUPT_PIN);
        let legacy = match IntXPin::from_register(pin) {
            Some(pin) => {
                let irq = self.platform.map_pin_to_irq(address, pin as u8);
                let line = self.legacy_lines.find_or_create(irq).map_err(|e| {
                    warn!(
                        "{}: failed to find or create shared legacy IRQ handler (pin {}, irq \
                         id {}): {}",
                        address, pin as u8, irq, e
                    );
                    e
                })?;
                Some(LegacyIrq::new(pin, line))
            }
            None => {
                if pin != 0 {
                    warn!("{}: invalid interrupt pin {}", address, pin);
                }
                None
            }
        };

        debug!(
            "{}: discovered (pin {}, MSI {:?})",
            address,
            pin,
            msi.map(|cap| cap.max_vectors())
        );
        let device = Arc::new(PciDevice::new(
            address,
            config,
            self.platform.clone(),
            legacy,
            msi,
        ));
        devices.insert(address, Arc::downgrade(&device));

        Ok(device)
    }

    /// Return the live function at `address`.
    pub fn device(&self, address: PciAddress) -> Option<Arc<PciDevice>> {
        // Safe to unwrap because there's no legal way to break the mutex.
        let devices = self.devices.lock().unwrap();
        devices.get(&address).and_then(Weak::upgrade)
    }

    /// Return the live functions of the bus, ordered by address.
    pub fn devices(&self) -> Vec<Arc<PciDevice>> {
        // Safe to unwrap because there's no legal way to break the mutex.
        let devices = self.devices.lock().unwrap();
        devices.values().filter_map(Weak::upgrade).collect()
    }

    /// Unplug the function at `address` and forget about it.
    pub fn remove_device(&self, address: PciAddress) -> Option<Arc<PciDevice>> {
        let device = {
            // Safe to unwrap because there's no legal way to break the mutex.
            let mut devices = self.devices.lock().unwrap();
            devices.remove(&address).and_then(|device| device.upgrade())
        }?;
        device.unplug();
        Some(device)
    }

    /// Tear down the shared legacy lines. Every function must have left legacy mode.
    pub fn shutdown_irqs(self) {
        self.legacy_lines.shutdown();
    }
}
