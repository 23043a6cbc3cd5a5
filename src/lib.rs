// Copyright 2026 The pcie-irq Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! This crate provides the interrupt core of a PCI/PCIe bus driver:
//! * a per-function interrupt mode state machine (disabled, shared legacy INTx or MSI)
//! * the bookkeeping of the handlers drivers attach to each interrupt vector
//! * the dispatch paths the platform calls into when a system interrupt or an MSI vector fires
//! * the [`Platform`](platform/trait.Platform.html) trait describing what the core needs from the
//! system interrupt controller(s)
//!
//! # Example
//!
//! Discover a function wired to INTA, switch it to legacy mode and attach a handler.
//!```
//! use std::sync::{Arc, Mutex};
//! use pcie_irq::bus::{PciAddress, PciBus};
//! use pcie_irq::config::ConfigSpace;
//! use pcie_irq::device::PciDevice;
//! use pcie_irq::interrupt::{Error, InterruptIndex, IrqMode, IrqReturn, Result};
//! use pcie_irq::platform::{InterruptDispatch, MsiBlock, Platform};
//!
//! struct PicPlatform;
//!
//! impl Platform for PicPlatform {
//!     fn supports_msi(&self) -> bool {
//!         false
//!     }
//!     fn supports_msi_masking(&self) -> bool {
//!         false
//!     }
//!     fn alloc_msi_block(&self, _count: u32, _is_64bit: bool, _is_msix: bool) -> Result<MsiBlock> {
//!         Err(Error::NotSupported)
//!     }
//!     fn free_msi_block(&self, block: &mut MsiBlock) {
//!         block.allocated = false;
//!     }
//!     fn register_msi_handler(
//!         &self,
//!         _block: &MsiBlock,
//!         _index: InterruptIndex,
//!         _handler: Option<Arc<dyn InterruptDispatch>>,
//!     ) {
//!     }
//!     fn mask_unmask_msi(&self, _block: &MsiBlock, _index: InterruptIndex, _mask: bool) {}
//!     fn map_pin_to_irq(&self, _address: PciAddress, pin: u8) -> u32 {
//!         16 + pin as u32
//!     }
//!     fn register_interrupt_handler(
//!         &self,
//!         irq: u32,
//!         handler: Option<Arc<dyn InterruptDispatch>>,
//!     ) -> Result<()> {
//!         println!("IRQ {} handler installed: {}", irq, handler.is_some());
//!         Ok(())
//!     }
//!     fn mask_interrupt(&self, _irq: u32) {}
//!     fn unmask_interrupt(&self, _irq: u32) {}
//! }
//!
//! struct FlatConfig(Mutex<[u8; 256]>);
//!
//! impl ConfigSpace for FlatConfig {
//!     fn config_read(&self, offset: u16, data: &mut [u8]) {
//!         let start = offset as usize;
//!         data.copy_from_slice(&self.0.lock().unwrap()[start..start + data.len()]);
//!     }
//!     fn config_write(&self, offset: u16, data: &[u8]) {
//!         let start = offset as usize;
//!         self.0.lock().unwrap()[start..start + data.len()].copy_from_slice(data);
//!     }
//! }
//!
//! let bus = PciBus::new(Arc::new(PicPlatform));
//! let mut bytes = [0u8; 256];
//! // Interrupt pin register: INTA.
//! bytes[0x3d] = 1;
//! let config = Arc::new(FlatConfig(Mutex::new(bytes)));
//! let device = bus
//!     .add_device(PciAddress::new(0, 3, 0).unwrap(), config, None)
//!     .unwrap();
//!
//! device.set_irq_mode(IrqMode::Legacy, 1).unwrap();
//! let handler = Arc::new(|_: &PciDevice, _: InterruptIndex| IrqReturn::empty());
//! device.register_irq_handler(0, Some(handler)).unwrap();
//! device.mask_unmask_irq(0, false).unwrap();
//! assert_eq!(device.get_irq_mode().unwrap().registered_handlers, 1);
//!
//! device.set_irq_mode(IrqMode::Disabled, 0).unwrap();
//! bus.shutdown_irqs();
//! ```

pub mod bus;
pub mod config;
pub mod device;
pub mod interrupt;
pub mod platform;

#[cfg(test)]
mod test_utils;
