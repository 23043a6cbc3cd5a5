// Copyright 2026 The pcie-irq Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Message signaled interrupts.
//!
//! A function in MSI mode owns a power of two block of platform vectors. The block's target
//! address and data are programmed into the function's MSI capability, and one
//! [`InterruptDispatch`] object per vector is registered with the platform. Vectors can be masked
//! either at the platform interrupt controller, through the per-vector mask register of the
//! capability, or both.

use std::sync::Arc;

use log::debug;

use super::vector::SlotState;
use super::{Error, InterruptIndex, IrqMode, IrqReturn, Result, VectorSlot};
use crate::bus::PciAddress;
use crate::config::{ConfigSpace, PCIE_CFG_SPACE_SIZE, PCI_CFG_HEADER_SIZE};
use crate::device::{IrqState, PciDevice};
use crate::platform::{InterruptDispatch, MsiBlock, Platform, PCI_MAX_MSI_IRQS};

/// Capability id of the MSI capability structure.
pub const PCI_CAP_ID_MSI: u8 = 0x05;

const MSI_CTRL_ENABLE: u16 = 1 << 0;
const MSI_CTRL_MMC_SHIFT: u16 = 1;
const MSI_CTRL_MME_SHIFT: u16 = 4;
const MSI_CTRL_MM_MASK: u16 = 0x7;
const MSI_CTRL_64BIT: u16 = 1 << 7;
const MSI_CTRL_PVM: u16 = 1 << 8;
// 64 bit address and per-vector masking.
const MSI_CAP_MAX_SIZE: u16 = 24;

/// Layout of the MSI capability structure of a function.
///
/// Built once at discovery from the message control register; the layout bits are read-only
/// in hardware.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MsiCapability {
    offset: u16,
    ctrl: u16,
}

impl MsiCapability {
    /// Parse the capability located at `offset` in the configuration space of a function.
    ///
    /// Fails with [`Error::InvalidArgs`] if `offset` is not a dword aligned offset past the
    /// standard header with room for the largest MSI structure before the end of configuration
    /// space, or if no MSI capability id is found there.
    pub fn read(config: &dyn ConfigSpace, offset: u16) -> Result<Self> {
        let fits = offset
            .checked_add(MSI_CAP_MAX_SIZE)
            .map_or(false, |end| end <= PCIE_CFG_SPACE_SIZE);
        if offset % 4 != 0 || offset < PCI_CFG_HEADER_SIZE || !fits {
            return Err(Error::InvalidArgs);
        }
        if config.read8(offset) != PCI_CAP_ID_MSI {
            return Err(Error::InvalidArgs);
        }
        Ok(Self::new(offset, config.read16(offset + 2)))
    }

    fn new(offset: u16, ctrl: u16) -> Self {
        MsiCapability { offset, ctrl }
    }

    /// Offset of the capability in configuration space.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Whether the function can target a 64 bit address.
    pub fn is_64bit(&self) -> bool {
        self.ctrl & MSI_CTRL_64BIT != 0
    }

    /// Whether the capability has per-vector mask bits.
    pub fn has_pvm(&self) -> bool {
        self.ctrl & MSI_CTRL_PVM != 0
    }

    /// Maximum number of vectors the function can use.
    pub fn max_vectors(&self) -> u32 {
        let mmc = (self.ctrl >> MSI_CTRL_MMC_SHIFT) & MSI_CTRL_MM_MASK;
        // Encodings above 32 vectors are reserved.
        std::cmp::min(1u32 << mmc, PCI_MAX_MSI_IRQS)
    }

    fn ctrl_reg(&self) -> u16 {
        self.offset + 2
    }

    fn addr_reg(&self) -> u16 {
        self.offset + 4
    }

    fn addr_upper_reg(&self) -> Option<u16> {
        if self.is_64bit() {
            Some(self.offset + 8)
        } else {
            None
        }
    }

    fn data_reg(&self) -> u16 {
        if self.is_64bit() {
            self.offset + 12
        } else {
            self.offset + 8
        }
    }

    /// Offset of the per-vector mask register, if the function has one.
    pub fn mask_reg(&self) -> Option<u16> {
        match (self.has_pvm(), self.is_64bit()) {
            (false, _) => None,
            (true, true) => Some(self.offset + 16),
            (true, false) => Some(self.offset + 12),
        }
    }
}

/// An active MSI session of a function.
///
/// Shared between the function and the dispatchers of its vectors, so interrupt context never
/// needs the device primary lock.
pub struct MsiController {
    device: PciAddress,
    cap: MsiCapability,
    config: Arc<dyn ConfigSpace>,
    platform: Arc<dyn Platform>,
    block: MsiBlock,
    // Leaf lock serializing updates of the per-vector mask register.
    mask_lock: spin::Mutex<()>,
}

impl MsiController {
    fn new(device: &PciDevice, cap: MsiCapability, block: MsiBlock) -> Self {
        MsiController {
            device: device.address(),
            cap,
            config: device.config_handle(),
            platform: device.platform().clone(),
            block,
            mask_lock: spin::Mutex::new(()),
        }
    }

    /// The block of platform vectors backing the session.
    pub fn block(&self) -> &MsiBlock {
        &self.block
    }

    fn can_mask(&self) -> bool {
        self.platform.supports_msi_masking() || self.cap.has_pvm()
    }

    // Must be called with the slot lock of `index` held. Returns the previous masked state.
    pub(crate) fn mask_unmask_locked(
        &self,
        slot: &mut SlotState,
        index: InterruptIndex,
        mask: bool,
    ) -> bool {
        debug_assert!(index < self.block.num_irq);

        if let Some(reg) = self.cap.mask_reg() {
            let _guard = self.mask_lock.lock();
            let bits = self.config.read32(reg);
            let bits = if mask {
                bits | (1 << index)
            } else {
                bits & !(1 << index)
            };
            self.config.write32(reg, bits);
        }

        if self.platform.supports_msi_masking() {
            self.platform.mask_unmask_msi(&self.block, index, mask);
        }

        let was_masked = slot.masked;
        slot.masked = mask;
        was_masked
    }

    fn mask_all_at_device(&self) {
        if let Some(reg) = self.cap.mask_reg() {
            let _guard = self.mask_lock.lock();
            self.config.write32(reg, 0xffff_ffff);
        }
    }
}

// Per-vector entry point registered with the platform. Owning the function keeps it alive
// until its vectors are unregistered, so dispatch never drops the last handle.
struct MsiVectorDispatch {
    device: Arc<PciDevice>,
    msi: Arc<MsiController>,
    slot: Arc<VectorSlot>,
}

impl InterruptDispatch for MsiVectorDispatch {
    fn dispatch(&self) -> bool {
        let index = self.slot.index();
        let mut slot = self.slot.lock();

        // Mask for the duration of the handler if possible. An already masked vector means the
        // platform raced with a mask request, so the delivery is dropped.
        let was_masked = if self.msi.can_mask() {
            self.msi.mask_unmask_locked(&mut slot, index, true)
        } else {
            debug_assert!(!slot.masked);
            false
        };
        if was_masked {
            return false;
        }

        let ret = match slot.handler.as_deref() {
            Some(handler) => handler.handle(&self.device, index),
            None => {
                debug!(
                    "{}: MSI vector {} fired without a handler, leaving it masked",
                    self.msi.device, index
                );
                return false;
            }
        };

        if !ret.contains(IrqReturn::MASK) && self.msi.can_mask() {
            self.msi.mask_unmask_locked(&mut slot, index, false);
        }

        ret.contains(IrqReturn::RESCHEDULE)
    }
}

fn set_enable(config: &dyn ConfigSpace, cap: &MsiCapability, enable: bool) {
    let ctrl = config.read16(cap.ctrl_reg());
    let ctrl = if enable {
        ctrl | MSI_CTRL_ENABLE
    } else {
        ctrl & !MSI_CTRL_ENABLE
    };
    config.write16(cap.ctrl_reg(), ctrl);
}

fn set_multi_message_enable(config: &dyn ConfigSpace, cap: &MsiCapability, requested: u32) {
    debug_assert!(requested >= 1 && requested <= PCI_MAX_MSI_IRQS);
    let log2 = requested.next_power_of_two().trailing_zeros() as u16;

    let ctrl = config.read16(cap.ctrl_reg());
    let ctrl = (ctrl & !(MSI_CTRL_MM_MASK << MSI_CTRL_MME_SHIFT)) | (log2 << MSI_CTRL_MME_SHIFT);
    config.write16(cap.ctrl_reg(), ctrl);
}

// Mask every allocated vector, then every vector of the function.
fn mask_all(device: &PciDevice, state: &IrqState) {
    for slot in state.vectors.iter() {
        match mask_unmask(device, state, slot.index(), true) {
            // Vectors that cannot be masked are covered by the disabled capability.
            Ok(_) | Err(Error::NotSupported) => {}
            Err(e) => debug_assert!(
                false,
                "{}: failed to mask MSI vector {}: {}",
                device.address(),
                slot.index(),
                e
            ),
        }
    }
    match state.msi {
        Some(ref msi) => msi.mask_all_at_device(),
        None => {
            if let Some(reg) = device.msi_capability().and_then(|cap| cap.mask_reg()) {
                device.config().write32(reg, 0xffff_ffff);
            }
        }
    }
}

// Disable MSI, mask everything and point the function at `addr`/`data`.
fn set_target(device: &PciDevice, state: &IrqState, cap: &MsiCapability, addr: u64, data: u32) {
    debug_assert!(cap.is_64bit() || addr >> 32 == 0);
    debug_assert_eq!(data >> 16, 0);
    let config = device.config();

    set_enable(config, cap, false);
    mask_all(device, state);

    config.write32(cap.addr_reg(), addr as u32);
    if let Some(reg) = cap.addr_upper_reg() {
        config.write32(reg, (addr >> 32) as u32);
    }
    config.write16(cap.data_reg(), data as u16);
}

/// Enter MSI mode with `requested` vectors. On error the function is left disabled.
pub(crate) fn enter(device: &Arc<PciDevice>, state: &mut IrqState, requested: u32) -> Result<()> {
    let cap = match device.msi_capability() {
        Some(cap) if device.platform().supports_msi() && requested <= cap.max_vectors() => *cap,
        _ => return Err(Error::NotSupported),
    };

    let res = program(device, state, &cap, requested);
    if res.is_err() {
        leave(device, state);
    }
    res
}

fn program(
    device: &Arc<PciDevice>,
    state: &mut IrqState,
    cap: &MsiCapability,
    requested: u32,
) -> Result<()> {
    debug_assert!(state.msi.is_none());
    let platform = device.platform().clone();

    let block = platform
        .alloc_msi_block(requested, cap.is_64bit(), false)
        .map_err(|e| {
            debug!(
                "{}: failed to allocate a block of {} MSI IRQs: {}",
                device.address(),
                requested,
                e
            );
            Error::NoResources
        })?;
    debug_assert!(block.allocated && block.num_irq >= requested);

    let msi = Arc::new(MsiController::new(device, *cap, block));
    state.msi = Some(msi.clone());
    state.vectors.allocate(requested)?;
    state.mode = IrqMode::Msi;

    set_target(device, state, cap, block.target_addr, block.target_data);
    set_multi_message_enable(device.config(), cap, requested);

    for slot in state.vectors.iter() {
        let dispatch = MsiVectorDispatch {
            device: device.clone(),
            msi: msi.clone(),
            slot: slot.clone(),
        };
        platform.register_msi_handler(&block, slot.index(), Some(Arc::new(dispatch)));
    }

    set_enable(device.config(), cap, true);
    Ok(())
}

/// Leave MSI mode and return the block to the platform.
///
/// Safe to call on a partially entered session.
pub(crate) fn leave(device: &PciDevice, state: &mut IrqState) {
    if let Some(cap) = device.msi_capability() {
        set_target(device, state, cap, 0, 0);
    }

    if let Some(msi) = state.msi.take() {
        let platform = device.platform();
        let mut block = msi.block;

        for index in 0..block.num_irq {
            if platform.supports_msi_masking() {
                platform.mask_unmask_msi(&block, index, true);
            }
            platform.register_msi_handler(&block, index, None);
        }
        platform.free_msi_block(&mut block);
        debug_assert!(!block.allocated);
    }

    state.reset_bookkeeping();
}

/// Mask or unmask `vector`. Returns whether the vector was masked before.
pub(crate) fn mask_unmask(
    device: &PciDevice,
    state: &IrqState,
    vector: InterruptIndex,
    mask: bool,
) -> Result<bool> {
    let slot = state.vectors.get(vector).ok_or(Error::InvalidArgs)?;
    let msi = state.msi.as_ref().ok_or(Error::BadState)?;

    if mask && !device.platform().supports_msi_masking() && !msi.cap.has_pvm() {
        return Err(Error::NotSupported);
    }

    let mut slot_state = slot.lock();
    Ok(msi.mask_unmask_locked(&mut slot_state, vector, mask))
}
