// Copyright 2026 The pcie-irq Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Services the interrupt core requires from the platform.
//!
//! The platform layer owns the system interrupt controller(s). It routes legacy INTx pins to
//! system interrupt ids, masks and unmasks those ids, and hands out blocks of MSI vectors together
//! with the address/data pair a function must write to raise them. Interrupts delivered by the
//! controller come back into the core through [`InterruptDispatch`] objects registered with the
//! platform.

use std::sync::Arc;

use crate::bus::PciAddress;
use crate::interrupt::{InterruptIndex, Result};

/// Maximum number of vectors in a PCI MSI block.
pub const PCI_MAX_MSI_IRQS: u32 = 32;

/// Entry point of the interrupt core, called by the platform in interrupt context.
pub trait InterruptDispatch: Send + Sync {
    /// Service one delivery. Return `true` if a reschedule should happen on interrupt exit.
    fn dispatch(&self) -> bool;
}

/// A block of MSI vectors allocated by the platform.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MsiBlock {
    /// Address the function writes to signal one of the vectors.
    pub target_addr: u64,
    /// Data written by the function. The low bits select the vector within the block.
    pub target_data: u32,
    /// First platform vector of the block, for the platform's own bookkeeping.
    pub base_irq: u32,
    /// Number of vectors in the block. Always a power of two.
    pub num_irq: u32,
    /// Whether the block is still owned by a function.
    pub allocated: bool,
}

/// Downward interface of the interrupt core.
///
/// Implementations must be callable from any thread. `mask_unmask_msi`, `mask_interrupt` and
/// `unmask_interrupt` must also be callable from interrupt context.
pub trait Platform: Send + Sync {
    /// Whether the platform can deliver MSI at all.
    fn supports_msi(&self) -> bool;

    /// Whether the platform can mask individual vectors of an MSI block.
    fn supports_msi_masking(&self) -> bool;

    /// Allocate a block able to hold `count` vectors.
    ///
    /// # Arguments
    /// * `count`: number of vectors requested; the platform rounds it up to a power of two
    /// * `is_64bit`: whether the function can target a 64 bit address
    /// * `is_msix`: whether the block is meant for MSI-X
    fn alloc_msi_block(&self, count: u32, is_64bit: bool, is_msix: bool) -> Result<MsiBlock>;

    /// Return a block to the platform. The platform clears `block.allocated`.
    fn free_msi_block(&self, block: &mut MsiBlock);

    /// Install (`Some`) or remove (`None`) the dispatcher of vector `index` of `block`.
    ///
    /// Removing a dispatcher synchronizes with any in-flight invocation of it.
    fn register_msi_handler(
        &self,
        block: &MsiBlock,
        index: InterruptIndex,
        handler: Option<Arc<dyn InterruptDispatch>>,
    );

    /// Mask or unmask vector `index` of `block` at the interrupt controller.
    fn mask_unmask_msi(&self, block: &MsiBlock, index: InterruptIndex, mask: bool);

    /// Return the system interrupt id the INTx `pin` (1 = INTA) of `address` is routed to.
    fn map_pin_to_irq(&self, address: PciAddress, pin: u8) -> u32;

    /// Install (`Some`) or remove (`None`) the dispatcher of the system interrupt `irq`.
    fn register_interrupt_handler(
        &self,
        irq: u32,
        handler: Option<Arc<dyn InterruptDispatch>>,
    ) -> Result<()>;

    /// Mask the system interrupt `irq`.
    fn mask_interrupt(&self, irq: u32);

    /// Unmask the system interrupt `irq`.
    fn unmask_interrupt(&self, irq: u32);
}
