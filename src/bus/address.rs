// Copyright 2026 The pcie-irq Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt::{self, Display};

/// Maximum device number on a bus.
pub const PCI_MAX_DEVICES_PER_BUS: u8 = 32;
/// Maximum function number on a device.
pub const PCI_MAX_FUNCTIONS_PER_DEVICE: u8 = 8;

/// Bus/device/function triple identifying a PCI/PCIe function.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct PciAddress {
    bus: u8,
    device: u8,
    function: u8,
}

impl PciAddress {
    /// Create a new address, or `None` if the device or function number is out of range.
    pub fn new(bus: u8, device: u8, function: u8) -> Option<Self> {
        if device >= PCI_MAX_DEVICES_PER_BUS || function >= PCI_MAX_FUNCTIONS_PER_DEVICE {
            return None;
        }
        Some(PciAddress {
            bus,
            device,
            function,
        })
    }

    /// Return the bus number.
    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// Return the device number.
    pub fn device(&self) -> u8 {
        self.device
    }

    /// Return the function number.
    pub fn function(&self) -> u8 {
        self.function
    }
}

impl PartialOrd for PciAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PciAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.bus, self.device, self.function).cmp(&(other.bus, other.device, other.function))
    }
}

impl Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}
