// Copyright 2026 The pcie-irq Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Access to the configuration space of a PCI/PCIe function.
//!
//! The interrupt core never maps configuration space itself. The bus driver hands every
//! discovered function an object implementing [`ConfigSpace`], and the core only uses it to
//! touch the handful of registers involved in interrupt delivery: the command and status
//! registers of the standard header, the interrupt pin, and the registers of the MSI
//! capability structure.

use std::ops::Deref;
use std::sync::Arc;

use bitflags::bitflags;

/// Offset of the command register in the standard configuration header.
pub const PCI_CFG_COMMAND: u16 = 0x04;
/// Offset of the status register in the standard configuration header.
pub const PCI_CFG_STATUS: u16 = 0x06;
/// Offset of the interrupt pin register in the standard configuration header.
pub const PCI_CFG_INTERRUPT_PIN: u16 = 0x3d;
/// Size of the standard configuration header. Capability structures live past it.
pub const PCI_CFG_HEADER_SIZE: u16 = 0x40;
/// Size of the extended configuration space of a PCIe function.
pub const PCIE_CFG_SPACE_SIZE: u16 = 0x1000;

bitflags! {
    /// Bits of the command register the interrupt core cares about.
    pub struct Command: u16 {
        /// Disables assertion of the function's legacy INTx pin.
        const INT_DISABLE = 1 << 10;
    }
}

bitflags! {
    /// Bits of the status register the interrupt core cares about.
    pub struct Status: u16 {
        /// The function is asserting (or would assert) its legacy INTx pin.
        const INT_STATUS = 1 << 3;
    }
}

/// Allows the interrupt core to access the configuration registers of a function.
///
/// Accesses are little endian and never cross the natural alignment of the access size.
///
/// # Example
/// ```
/// # use std::sync::Mutex;
/// # use pcie_irq::config::ConfigSpace;
/// struct FlatConfig {
///     bytes: Mutex<[u8; 256]>,
/// }
///
/// impl ConfigSpace for FlatConfig {
///     fn config_read(&self, offset: u16, data: &mut [u8]) {
///         let bytes = self.bytes.lock().unwrap();
///         let start = offset as usize;
///         data.copy_from_slice(&bytes[start..start + data.len()]);
///     }
///
///     fn config_write(&self, offset: u16, data: &[u8]) {
///         let mut bytes = self.bytes.lock().unwrap();
///         let start = offset as usize;
///         bytes[start..start + data.len()].copy_from_slice(data);
///     }
/// }
///
/// let cfg = FlatConfig { bytes: Mutex::new([0; 256]) };
/// cfg.write16(0x04, 0x0400);
/// assert_eq!(cfg.read16(0x04), 0x0400);
/// ```
pub trait ConfigSpace: Send + Sync {
    /// Handle a read from configuration space.
    ///
    /// # Arguments
    ///
    /// * `offset`: byte offset into configuration space
    /// * `data`:   a buffer provided by the caller to store the read data
    fn config_read(&self, offset: u16, data: &mut [u8]);

    /// Handle a write to configuration space.
    ///
    /// # Arguments
    ///
    /// * `offset`: byte offset into configuration space
    /// * `data`:   a buffer provided by the caller holding the data to write
    fn config_write(&self, offset: u16, data: &[u8]);

    /// Read one byte at `offset`.
    fn read8(&self, offset: u16) -> u8 {
        let mut data = [0u8; 1];
        self.config_read(offset, &mut data);
        data[0]
    }

    /// Read a 16 bit register at `offset`.
    fn read16(&self, offset: u16) -> u16 {
        let mut data = [0u8; 2];
        self.config_read(offset, &mut data);
        u16::from_le_bytes(data)
    }

    /// Read a 32 bit register at `offset`.
    fn read32(&self, offset: u16) -> u32 {
        let mut data = [0u8; 4];
        self.config_read(offset, &mut data);
        u32::from_le_bytes(data)
    }

    /// Write a 16 bit register at `offset`.
    fn write16(&self, offset: u16, value: u16) {
        self.config_write(offset, &value.to_le_bytes());
    }

    /// Write a 32 bit register at `offset`.
    fn write32(&self, offset: u16, value: u32) {
        self.config_write(offset, &value.to_le_bytes());
    }
}

// Blanket implementation for Arc<T>.

impl<T: ConfigSpace + ?Sized> ConfigSpace for Arc<T> {
    fn config_read(&self, offset: u16, data: &mut [u8]) {
        self.deref().config_read(offset, data);
    }

    fn config_write(&self, offset: u16, data: &[u8]) {
        self.deref().config_write(offset, data);
    }
}

/// Read-modify-write the command register.
///
/// The caller must hold the register lock of the function owning `cfg`.
pub(crate) fn modify_command(cfg: &dyn ConfigSpace, clear: Command, set: Command) {
    let raw = cfg.read16(PCI_CFG_COMMAND);
    cfg.write16(PCI_CFG_COMMAND, (raw & !clear.bits()) | set.bits());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockConfig;

    #[test]
    fn test_register_accessors() {
        let cfg = MockConfig::new();

        cfg.write32(0x10, 0xdead_beef);
        assert_eq!(cfg.read32(0x10), 0xdead_beef);
        assert_eq!(cfg.read16(0x10), 0xbeef);
        assert_eq!(cfg.read16(0x12), 0xdead);
        assert_eq!(cfg.read8(0x13), 0xde);

        let shared: Arc<dyn ConfigSpace> = Arc::new(MockConfig::new());
        shared.write16(PCI_CFG_STATUS, Status::INT_STATUS.bits());
        assert_eq!(shared.read16(PCI_CFG_STATUS), 0x0008);
    }

    #[test]
    fn test_modify_command_keeps_foreign_bits() {
        let cfg = MockConfig::new();
        // Memory space enable and bus master are set by someone else.
        cfg.write16(PCI_CFG_COMMAND, 0x0006);

        modify_command(&cfg, Command::empty(), Command::INT_DISABLE);
        assert_eq!(cfg.read16(PCI_CFG_COMMAND), 0x0406);

        modify_command(&cfg, Command::INT_DISABLE, Command::empty());
        assert_eq!(cfg.read16(PCI_CFG_COMMAND), 0x0006);
    }
}
